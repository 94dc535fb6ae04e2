//! Structural validation and advisory graph analysis.
//!
//! [`Graph::validate`] proves a graph is executable before the engine ever
//! sees it. The checks run in a fixed order and the first offense is
//! reported:
//!
//! 1. The entry point is set and names a known node.
//! 2. Every edge endpoint names a known node.
//! 3. No node has an unconditional self-loop (a conditional self-loop is
//!    the supported bounded-loop mechanism).
//! 4. Every node is reachable from the entry point.
//!
//! Cycles are allowed: a workflow loops by design. [`Graph::find_cycles`] is
//! a separate advisory API for visualization and UX, never a validation
//! gate.

use miette::Diagnostic;
use rustc_hash::{FxHashMap, FxHashSet};
use thiserror::Error;

use crate::graphs::builder::Graph;

/// The first structural offense found by [`Graph::validate`].
#[derive(Debug, Error, Diagnostic)]
pub enum GraphValidationError {
    /// Two nodes were registered under the same name.
    #[error("duplicate node name '{name}'")]
    #[diagnostic(
        code(flowgraph::graph::duplicate_node),
        help("Node names are unique within a graph.")
    )]
    DuplicateNode { name: String },

    /// The graph has no nodes at all.
    #[error("graph '{graph}' has no nodes")]
    #[diagnostic(code(flowgraph::graph::empty))]
    Empty { graph: String },

    /// No entry point was declared.
    #[error("graph '{graph}' has no entry point")]
    #[diagnostic(
        code(flowgraph::graph::missing_entry_point),
        help("Declare the starting node with entry_point(...).")
    )]
    MissingEntryPoint { graph: String },

    /// The declared entry point names an unknown node.
    #[error("entry point '{entry_point}' is not a node of graph '{graph}'")]
    #[diagnostic(code(flowgraph::graph::unknown_entry_point))]
    UnknownEntryPoint { graph: String, entry_point: String },

    /// An edge endpoint names an unknown node.
    #[error("edge '{from}' -> '{to}' references unknown node '{unknown}'")]
    #[diagnostic(
        code(flowgraph::graph::unknown_edge_endpoint),
        help("Every edge endpoint must name a registered node.")
    )]
    UnknownEdgeEndpoint {
        from: String,
        to: String,
        unknown: String,
    },

    /// A node loops back to itself without a condition, which can never
    /// terminate.
    #[error("node '{node}' has an unconditional self-loop")]
    #[diagnostic(
        code(flowgraph::graph::unconditional_self_loop),
        help("Guard the self-loop with a condition; conditional self-loops are how bounded loops are expressed.")
    )]
    UnconditionalSelfLoop { node: String },

    /// Some nodes can never be reached from the entry point.
    #[error("nodes unreachable from entry point '{entry_point}': {unreachable}")]
    #[diagnostic(
        code(flowgraph::graph::unreachable_nodes),
        help("Connect the listed nodes or remove them from the graph.")
    )]
    UnreachableNodes {
        entry_point: String,
        unreachable: String,
    },
}

/// Summary counters for a graph, for listings and dashboards.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GraphStats {
    /// Graph name.
    pub name: String,
    /// Node count.
    pub node_count: usize,
    /// Edge count.
    pub edge_count: usize,
    /// Declared entry point.
    pub entry_point: Option<String>,
    /// Nodes with no outgoing edge.
    pub end_nodes: Vec<String>,
    /// Number of distinct cycles found by the advisory pass.
    pub cycle_count: usize,
}

impl Graph {
    /// Prove the graph is executable. Returns the first offense found,
    /// in the documented check order.
    pub fn validate(&self) -> Result<(), GraphValidationError> {
        if self.node_count() == 0 {
            return Err(GraphValidationError::Empty {
                graph: self.name().to_string(),
            });
        }

        let entry = match self.entry_point() {
            Some(entry) => entry,
            None => {
                return Err(GraphValidationError::MissingEntryPoint {
                    graph: self.name().to_string(),
                })
            }
        };
        if !self.has_node(entry) {
            return Err(GraphValidationError::UnknownEntryPoint {
                graph: self.name().to_string(),
                entry_point: entry.to_string(),
            });
        }

        for edge in self.edges().all() {
            for endpoint in [&edge.from, &edge.to] {
                if !self.has_node(endpoint) {
                    return Err(GraphValidationError::UnknownEdgeEndpoint {
                        from: edge.from.clone(),
                        to: edge.to.clone(),
                        unknown: endpoint.clone(),
                    });
                }
            }
        }

        for edge in self.edges().all() {
            if edge.is_self_loop() && !edge.is_conditional() {
                return Err(GraphValidationError::UnconditionalSelfLoop {
                    node: edge.from.clone(),
                });
            }
        }

        let reachable = self.reachable_from(entry);
        let mut unreachable: Vec<&str> = self
            .node_names()
            .into_iter()
            .filter(|name| !reachable.contains(*name))
            .collect();
        if !unreachable.is_empty() {
            unreachable.sort_unstable();
            return Err(GraphValidationError::UnreachableNodes {
                entry_point: entry.to_string(),
                unreachable: unreachable.join(", "),
            });
        }

        Ok(())
    }

    /// Forward traversal from `start` over the edge index.
    fn reachable_from<'a>(&'a self, start: &'a str) -> FxHashSet<&'a str> {
        let mut reachable = FxHashSet::default();
        let mut stack = vec![start];
        while let Some(current) = stack.pop() {
            if !reachable.insert(current) {
                continue;
            }
            for edge in self.edges().outgoing(current) {
                if !reachable.contains(edge.to.as_str()) {
                    stack.push(&edge.to);
                }
            }
        }
        reachable
    }

    /// Nodes with no outgoing edge, sorted.
    #[must_use]
    pub fn end_nodes(&self) -> Vec<&str> {
        let mut ends: Vec<&str> = self
            .node_names()
            .into_iter()
            .filter(|name| !self.edges().has_outgoing(name))
            .collect();
        ends.sort_unstable();
        ends
    }

    /// Advisory cycle detection for visualization.
    ///
    /// Returns each cycle as the node sequence that closes it (last element
    /// repeats the first). Cycles never fail validation.
    #[must_use]
    pub fn find_cycles(&self) -> Vec<Vec<String>> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            InProgress,
            Done,
        }

        let mut marks: FxHashMap<&str, Mark> = FxHashMap::default();
        let mut cycles = Vec::new();

        // Iterative DFS with an explicit path so deep graphs cannot blow
        // the stack.
        for root in self.node_names() {
            if marks.contains_key(root) {
                continue;
            }
            let mut path: Vec<&str> = Vec::new();
            let mut stack: Vec<(&str, bool)> = vec![(root, false)];
            while let Some((node, exiting)) = stack.pop() {
                if exiting {
                    marks.insert(node, Mark::Done);
                    path.pop();
                    continue;
                }
                if marks.contains_key(node) {
                    continue;
                }
                marks.insert(node, Mark::InProgress);
                path.push(node);
                stack.push((node, true));
                for edge in self.edges().outgoing(node) {
                    let target = edge.to.as_str();
                    match marks.get(target) {
                        Some(Mark::InProgress) => {
                            if let Some(start) = path.iter().position(|n| *n == target) {
                                let mut cycle: Vec<String> =
                                    path[start..].iter().map(|s| s.to_string()).collect();
                                cycle.push(target.to_string());
                                cycles.push(cycle);
                            }
                        }
                        Some(Mark::Done) => {}
                        None => stack.push((target, false)),
                    }
                }
            }
        }
        cycles
    }

    /// Summary counters.
    #[must_use]
    pub fn stats(&self) -> GraphStats {
        GraphStats {
            name: self.name().to_string(),
            node_count: self.node_count(),
            edge_count: self.edges().len(),
            entry_point: self.entry_point().map(str::to_string),
            end_nodes: self.end_nodes().into_iter().map(str::to_string).collect(),
            cycle_count: self.find_cycles().len(),
        }
    }
}
