//! The serialized graph definition and its rehydration path.
//!
//! A [`GraphDefinition`] is what travels over the wire and into the graphs
//! table: node entries referencing tools *by name*, edge entries optionally
//! referencing conditions *by name*, and an entry point. Rehydration maps
//! those names through the [`ToolRegistry`] and [`ConditionRegistry`] to
//! produce a validated, executable [`Graph`].
//!
//! Build failures are deliberately split from validation failures: an
//! unknown tool or condition name is a registry problem the caller sees as
//! a bad request, before any run record exists.

use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::graphs::builder::{Graph, GraphBuilder};
use crate::graphs::validation::GraphValidationError;
use crate::node::ToolMetadata;
use crate::registry::{ConditionRegistry, RegistryError, ToolRegistry};

/// One node of a serialized graph: a graph-local name plus the registered
/// tool it binds to.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeDefinition {
    /// Graph-local node name; unique within the definition.
    pub name: String,
    /// Registered tool name resolved at build time.
    pub tool: String,
}

/// One edge of a serialized graph. An absent `condition` means the edge is
/// unconditional.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EdgeDefinition {
    /// Source node name.
    #[serde(rename = "from")]
    pub from_node: String,
    /// Target node name.
    #[serde(rename = "to")]
    pub to_node: String,
    /// Registered condition name, if the edge is guarded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
}

/// The wire form of a workflow graph.
///
/// # Examples
///
/// ```rust
/// use flowgraph::graphs::GraphDefinition;
///
/// let definition: GraphDefinition = serde_json::from_str(
///     r#"{
///         "name": "review",
///         "description": "check then improve",
///         "nodes": [
///             {"name": "check", "tool": "checker"},
///             {"name": "improve", "tool": "improver"}
///         ],
///         "edges": [
///             {"from": "check", "to": "improve", "condition": "needs_work"}
///         ],
///         "entry_point": "check"
///     }"#,
/// )
/// .unwrap();
///
/// assert_eq!(definition.nodes.len(), 2);
/// assert_eq!(definition.edges[0].condition.as_deref(), Some("needs_work"));
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphDefinition {
    /// Unique workflow name.
    pub name: String,
    /// Human description.
    #[serde(default)]
    pub description: Option<String>,
    /// Node entries, order preserved.
    pub nodes: Vec<NodeDefinition>,
    /// Edge entries; per-source order is routing order.
    #[serde(default)]
    pub edges: Vec<EdgeDefinition>,
    /// Name of the starting node.
    pub entry_point: String,
}

/// Why a definition could not be turned into an executable graph.
#[derive(Debug, Error, Diagnostic)]
pub enum GraphBuildError {
    /// A node references a tool name the registry does not know.
    #[error("node '{node}' references unknown tool '{tool}'")]
    #[diagnostic(
        code(flowgraph::graph::build::tool_not_found),
        help("Register the tool before creating runs for this graph.")
    )]
    ToolNotFound {
        node: String,
        tool: String,
        #[source]
        source: RegistryError,
    },

    /// An edge references a condition name the registry does not know.
    #[error("edge '{from}' -> '{to}' references unknown condition '{condition}'")]
    #[diagnostic(
        code(flowgraph::graph::build::condition_not_found),
        help("Register the named condition before creating runs for this graph.")
    )]
    ConditionNotFound {
        from: String,
        to: String,
        condition: String,
        #[source]
        source: RegistryError,
    },

    /// The rehydrated graph failed structural validation.
    #[error(transparent)]
    #[diagnostic(transparent)]
    Validation(#[from] GraphValidationError),
}

impl GraphDefinition {
    /// Rehydrate into an executable, validated [`Graph`].
    pub fn build(
        &self,
        tools: &ToolRegistry,
        conditions: &ConditionRegistry,
    ) -> Result<Graph, GraphBuildError> {
        let mut builder: GraphBuilder = Graph::builder(self.name.clone())
            .description(self.description.clone().unwrap_or_default());

        for node in &self.nodes {
            let tool = tools
                .get(&node.tool)
                .map_err(|source| GraphBuildError::ToolNotFound {
                    node: node.name.clone(),
                    tool: node.tool.clone(),
                    source,
                })?;
            let metadata = tools
                .metadata(&node.tool)
                .cloned()
                .unwrap_or_else(|_| ToolMetadata::default());
            builder = builder.node_with_metadata(&node.name, tool, metadata);
        }

        for edge in &self.edges {
            builder = match &edge.condition {
                None => builder.edge(&edge.from_node, &edge.to_node),
                Some(name) => {
                    let condition = conditions.get(name).map_err(|source| {
                        GraphBuildError::ConditionNotFound {
                            from: edge.from_node.clone(),
                            to: edge.to_node.clone(),
                            condition: name.clone(),
                            source,
                        }
                    })?;
                    builder.conditional_edge(&edge.from_node, &edge.to_node, condition)
                }
            };
        }

        Ok(builder.entry_point(&self.entry_point).build()?)
    }

    /// All tool names the definition references, deduplicated and sorted.
    #[must_use]
    pub fn referenced_tools(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.nodes.iter().map(|n| n.tool.as_str()).collect();
        names.sort_unstable();
        names.dedup();
        names
    }
}
