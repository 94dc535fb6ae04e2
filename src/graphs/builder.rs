//! The executable graph and its fluent builder.
//!
//! A [`Graph`] is the static shape of a workflow: node bindings indexed by
//! name, ordered edges, and an entry point. It is built per run (from a
//! persisted definition through the registries, or directly in code via
//! [`GraphBuilder`]) and owned by that run; nothing is shared across runs.
//!
//! Edges hold node *names*, not node references, so cyclic workflows never
//! create ownership cycles.

use std::sync::Arc;

use rustc_hash::FxHashMap;

use crate::graphs::edges::{Edge, EdgeCondition, EdgeManager};
use crate::graphs::validation::GraphValidationError;
use crate::node::{NodeBinding, Tool, ToolMetadata};

/// An executable workflow graph.
#[derive(Clone, Debug)]
pub struct Graph {
    name: String,
    description: String,
    nodes: FxHashMap<String, NodeBinding>,
    edges: EdgeManager,
    entry_point: Option<String>,
}

impl Graph {
    /// Start building a graph.
    #[must_use]
    pub fn builder(name: impl Into<String>) -> GraphBuilder {
        GraphBuilder {
            name: name.into(),
            description: String::new(),
            nodes: FxHashMap::default(),
            edges: EdgeManager::new(),
            entry_point: None,
            duplicate: None,
        }
    }

    pub(crate) fn from_parts(
        name: String,
        description: String,
        nodes: FxHashMap<String, NodeBinding>,
        edges: EdgeManager,
        entry_point: Option<String>,
    ) -> Self {
        Self {
            name,
            description,
            nodes,
            edges,
            entry_point,
        }
    }

    /// The graph's name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Human description.
    #[must_use]
    pub fn description(&self) -> &str {
        &self.description
    }

    /// The configured entry point, if any. Validation guarantees presence.
    #[must_use]
    pub fn entry_point(&self) -> Option<&str> {
        self.entry_point.as_deref()
    }

    /// Look up a node binding by name.
    #[must_use]
    pub fn node(&self, name: &str) -> Option<&NodeBinding> {
        self.nodes.get(name)
    }

    /// Whether the graph contains a node with the given name.
    #[must_use]
    pub fn has_node(&self, name: &str) -> bool {
        self.nodes.contains_key(name)
    }

    /// All node names, sorted for stable output.
    #[must_use]
    pub fn node_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.nodes.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Number of nodes.
    #[must_use]
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// The edge index.
    #[must_use]
    pub fn edges(&self) -> &EdgeManager {
        &self.edges
    }
}

/// Fluent builder for [`Graph`].
///
/// # Examples
///
/// ```rust
/// use flowgraph::graphs::Graph;
/// use flowgraph::graphs::edges::conditions;
/// use flowgraph::node::tool_fn;
///
/// let echo = tool_fn(|state| async move { Ok(state) });
///
/// let graph = Graph::builder("pipeline")
///     .description("two-step linear pipeline")
///     .node("first", echo.clone())
///     .node("second", echo)
///     .edge("first", "second")
///     .entry_point("first")
///     .build()
///     .unwrap();
///
/// assert_eq!(graph.entry_point(), Some("first"));
/// assert_eq!(graph.node_count(), 2);
/// ```
pub struct GraphBuilder {
    name: String,
    description: String,
    nodes: FxHashMap<String, NodeBinding>,
    edges: EdgeManager,
    entry_point: Option<String>,
    duplicate: Option<String>,
}

impl GraphBuilder {
    /// Set the human description.
    #[must_use]
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Add a node bound to `tool` with default metadata.
    #[must_use]
    pub fn node(self, name: impl Into<String>, tool: Arc<dyn Tool>) -> Self {
        self.node_with_metadata(name, tool, ToolMetadata::default())
    }

    /// Add a node bound to `tool` carrying explicit metadata.
    #[must_use]
    pub fn node_with_metadata(
        mut self,
        name: impl Into<String>,
        tool: Arc<dyn Tool>,
        metadata: ToolMetadata,
    ) -> Self {
        let name = name.into();
        if self.nodes.contains_key(&name) && self.duplicate.is_none() {
            self.duplicate = Some(name.clone());
        }
        self.nodes
            .insert(name.clone(), NodeBinding::new(name, tool, metadata));
        self
    }

    /// Add an unconditional edge.
    #[must_use]
    pub fn edge(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.edges.add(Edge::new(from, to));
        self
    }

    /// Add a guarded edge.
    #[must_use]
    pub fn conditional_edge(
        mut self,
        from: impl Into<String>,
        to: impl Into<String>,
        condition: Arc<dyn EdgeCondition>,
    ) -> Self {
        self.edges.add(Edge::conditional(from, to, condition));
        self
    }

    /// Declare the entry point.
    #[must_use]
    pub fn entry_point(mut self, name: impl Into<String>) -> Self {
        self.entry_point = Some(name.into());
        self
    }

    /// Validate and produce the graph.
    pub fn build(self) -> Result<Graph, GraphValidationError> {
        if let Some(name) = self.duplicate {
            return Err(GraphValidationError::DuplicateNode { name });
        }
        let graph = Graph::from_parts(
            self.name,
            self.description,
            self.nodes,
            self.edges,
            self.entry_point,
        );
        graph.validate()?;
        Ok(graph)
    }

    /// Produce the graph without validating, for inspection and advisory
    /// tooling. Executing an unvalidated graph is a caller bug.
    #[must_use]
    pub fn build_unvalidated(self) -> Graph {
        Graph::from_parts(
            self.name,
            self.description,
            self.nodes,
            self.edges,
            self.entry_point,
        )
    }
}
