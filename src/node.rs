//! Tools and node bindings.
//!
//! A *tool* is the user-supplied unit of work: an async function from state
//! to state, registered once by name. A *node* binds a graph-local name to a
//! tool; the engine invokes nodes, never tools directly.
//!
//! The node wrapper owns the failure contract from the engine's point of
//! view: a tool error is caught, recorded as an error entry on the state,
//! and reported as a `failed` outcome together with the measured execution
//! time. The engine decides what to do with the failure.
//!
//! # Implementing tools
//!
//! Most tools are async closures wrapped with [`tool_fn`]:
//!
//! ```rust
//! use flowgraph::node::{tool_fn, ToolError};
//! use flowgraph::state::WorkflowState;
//! use serde_json::json;
//!
//! let increment = tool_fn(|state: WorkflowState| async move {
//!     let count = state
//!         .get_data("count")
//!         .and_then(|v| v.as_i64())
//!         .unwrap_or(0);
//!     Ok(state.set_data("count", json!(count + 1)))
//! });
//! ```
//!
//! CPU-bound synchronous work must not stall the cooperative loop; wrap it
//! with [`blocking_tool`] and it runs on the blocking worker pool instead.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use miette::Diagnostic;
use thiserror::Error;

use crate::state::WorkflowState;

/// Errors a tool can raise. Raising any of these fails the node and, through
/// the engine, the run.
#[derive(Debug, Error, Diagnostic)]
pub enum ToolError {
    /// Expected input data is missing from the state.
    #[error("missing expected input: {what}")]
    #[diagnostic(
        code(flowgraph::tool::missing_input),
        help("Check that an upstream node produced the required data key.")
    )]
    MissingInput { what: String },

    /// Input data was present but unusable.
    #[error("invalid input: {message}")]
    #[diagnostic(code(flowgraph::tool::invalid_input))]
    InvalidInput { message: String },

    /// JSON (de)serialization inside the tool failed.
    #[error(transparent)]
    #[diagnostic(code(flowgraph::tool::serde))]
    Serde(#[from] serde_json::Error),

    /// Any other tool-internal failure.
    #[error("{0}")]
    #[diagnostic(code(flowgraph::tool::failed))]
    Failed(String),
}

impl ToolError {
    /// Shorthand for a free-form failure.
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

/// A unit of work executed by a node.
///
/// Tools take the current state by value and return a new state; they must
/// be `Send + Sync` because the coordinator runs many runs concurrently and
/// a registry hands the same tool to all of them.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Run the tool against the given state.
    async fn call(&self, state: WorkflowState) -> Result<WorkflowState, ToolError>;
}

impl std::fmt::Debug for dyn Tool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("dyn Tool")
    }
}

/// Descriptive metadata carried alongside a registered tool.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ToolMetadata {
    /// Human description of what the tool does.
    pub description: String,
    /// Version string, free-form.
    pub version: String,
    /// Author or owning team.
    pub author: Option<String>,
    /// Whether the tool runs on the blocking worker pool.
    pub blocking: bool,
}

impl ToolMetadata {
    /// Metadata with just a description.
    #[must_use]
    pub fn described(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            ..Default::default()
        }
    }
}

struct FnTool<F> {
    func: F,
}

#[async_trait]
impl<F, Fut> Tool for FnTool<F>
where
    F: Fn(WorkflowState) -> Fut + Send + Sync,
    Fut: Future<Output = Result<WorkflowState, ToolError>> + Send,
{
    async fn call(&self, state: WorkflowState) -> Result<WorkflowState, ToolError> {
        (self.func)(state).await
    }
}

/// Wrap an async closure as a [`Tool`].
pub fn tool_fn<F, Fut>(func: F) -> Arc<dyn Tool>
where
    F: Fn(WorkflowState) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<WorkflowState, ToolError>> + Send + 'static,
{
    Arc::new(FnTool { func })
}

struct BlockingTool<F> {
    func: Arc<F>,
}

#[async_trait]
impl<F> Tool for BlockingTool<F>
where
    F: Fn(WorkflowState) -> Result<WorkflowState, ToolError> + Send + Sync + 'static,
{
    async fn call(&self, state: WorkflowState) -> Result<WorkflowState, ToolError> {
        let func = Arc::clone(&self.func);
        tokio::task::spawn_blocking(move || func(state))
            .await
            .map_err(|join| ToolError::failed(format!("blocking tool panicked: {join}")))?
    }
}

/// Wrap a synchronous function as a [`Tool`] dispatched onto the blocking
/// worker pool, keeping the engine's cooperative loop responsive.
pub fn blocking_tool<F>(func: F) -> Arc<dyn Tool>
where
    F: Fn(WorkflowState) -> Result<WorkflowState, ToolError> + Send + Sync + 'static,
{
    Arc::new(BlockingTool {
        func: Arc::new(func),
    })
}

/// Terminal status of a single node invocation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeOutcomeStatus {
    /// The tool returned a new state.
    Completed,
    /// The tool raised; the error was folded into the state.
    Failed,
}

/// What a node invocation produced: the resulting state, the outcome, the
/// wall-clock duration, and the captured error message if the tool raised.
#[derive(Clone, Debug)]
pub struct NodeOutcome {
    /// State after the invocation. On failure this is the input state with
    /// the error appended, so partial progress is never lost.
    pub state: WorkflowState,
    /// Completed or failed.
    pub status: NodeOutcomeStatus,
    /// Entry-to-exit execution time.
    pub duration: Duration,
    /// The tool's error message when `status` is `Failed`.
    pub error: Option<String>,
}

impl NodeOutcome {
    /// Execution time in whole milliseconds, the unit used by logs and
    /// events.
    #[must_use]
    pub fn duration_ms(&self) -> u64 {
        self.duration.as_millis() as u64
    }
}

/// Binding of a graph-local node name to a tool.
///
/// Bindings are constructed per run when a serialized graph is rehydrated
/// through the registry; they are not persisted themselves.
#[derive(Clone)]
pub struct NodeBinding {
    name: String,
    tool: Arc<dyn Tool>,
    metadata: ToolMetadata,
}

impl NodeBinding {
    /// Bind `name` to `tool`.
    #[must_use]
    pub fn new(name: impl Into<String>, tool: Arc<dyn Tool>, metadata: ToolMetadata) -> Self {
        Self {
            name: name.into(),
            tool,
            metadata,
        }
    }

    /// The node's graph-local name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Metadata of the bound tool.
    #[must_use]
    pub fn metadata(&self) -> &ToolMetadata {
        &self.metadata
    }

    /// Invoke the bound tool, capturing failure and timing.
    ///
    /// A raising tool does not propagate an `Err` from here: the error is
    /// appended to the state's error list and reported through the outcome,
    /// leaving the abort decision to the engine.
    pub async fn execute(&self, state: WorkflowState) -> NodeOutcome {
        let started = Instant::now();
        // The input state is kept for the failure path: the tool consumed
        // its copy, and partial progress lives in the returned state only
        // on success.
        let fallback = state.clone();
        match self.tool.call(state).await {
            Ok(next) => NodeOutcome {
                state: next,
                status: NodeOutcomeStatus::Completed,
                duration: started.elapsed(),
                error: None,
            },
            Err(err) => {
                let raw = err.to_string();
                tracing::warn!(node = %self.name, error = %raw, "node tool raised");
                NodeOutcome {
                    state: fallback.add_error(format!("Node '{}' failed: {raw}", self.name)),
                    status: NodeOutcomeStatus::Failed,
                    duration: started.elapsed(),
                    error: Some(raw),
                }
            }
        }
    }
}

impl std::fmt::Debug for NodeBinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeBinding")
            .field("name", &self.name)
            .field("metadata", &self.metadata)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn passthrough() -> Arc<dyn Tool> {
        tool_fn(|state| async move { Ok(state) })
    }

    #[tokio::test]
    async fn completed_outcome_carries_new_state() {
        let tool = tool_fn(|state: WorkflowState| async move {
            Ok(state.set_data("touched", json!(true)))
        });
        let binding = NodeBinding::new("toucher", tool, ToolMetadata::default());

        let outcome = binding.execute(WorkflowState::new("wf", "r")).await;
        assert_eq!(outcome.status, NodeOutcomeStatus::Completed);
        assert_eq!(outcome.state.get_data("touched"), Some(&json!(true)));
        assert!(outcome.error.is_none());
    }

    #[tokio::test]
    async fn failure_is_captured_not_propagated() {
        let tool = tool_fn(|_state: WorkflowState| async move {
            Err(ToolError::MissingInput {
                what: "count".into(),
            })
        });
        let binding = NodeBinding::new("broken", tool, ToolMetadata::default());

        let outcome = binding.execute(WorkflowState::new("wf", "r")).await;
        assert_eq!(outcome.status, NodeOutcomeStatus::Failed);
        assert_eq!(outcome.state.errors.len(), 1);
        assert!(outcome.state.errors[0].contains("broken"));
        assert!(outcome.error.as_deref().unwrap().contains("count"));
    }

    #[tokio::test]
    async fn failure_preserves_prior_progress() {
        let tool = tool_fn(|_state: WorkflowState| async move {
            Err(ToolError::failed("nope"))
        });
        let binding = NodeBinding::new("late_failure", tool, ToolMetadata::default());

        let seeded = WorkflowState::new("wf", "r").set_data("earlier", json!(41));
        let outcome = binding.execute(seeded).await;
        assert_eq!(outcome.state.get_data("earlier"), Some(&json!(41)));
    }

    #[tokio::test]
    async fn blocking_tool_runs_off_loop() {
        let tool = blocking_tool(|state: WorkflowState| {
            // Simulate CPU work; this would stall a cooperative loop.
            let mut acc: u64 = 0;
            for i in 0..10_000u64 {
                acc = acc.wrapping_add(i);
            }
            Ok(state.set_data("acc", json!(acc)))
        });
        let binding = NodeBinding::new("cruncher", tool, ToolMetadata::default());

        let outcome = binding.execute(WorkflowState::new("wf", "r")).await;
        assert_eq!(outcome.status, NodeOutcomeStatus::Completed);
        assert!(outcome.state.get_data("acc").is_some());
    }

    #[tokio::test]
    async fn duration_is_measured() {
        let tool = tool_fn(|state: WorkflowState| async move {
            tokio::time::sleep(Duration::from_millis(15)).await;
            Ok(state)
        });
        let binding = NodeBinding::new("sleepy", tool, ToolMetadata::default());

        let outcome = binding.execute(WorkflowState::new("wf", "r")).await;
        assert!(outcome.duration >= Duration::from_millis(10));
    }

    #[test]
    fn metadata_described() {
        let meta = ToolMetadata::described("does things");
        assert_eq!(meta.description, "does things");
        assert!(!meta.blocking);
        let _ = NodeBinding::new("n", passthrough(), meta);
    }
}
