//! The execution engine: step-by-step traversal of a validated graph.
//!
//! One loop iteration executes one node. At the loop head the engine checks,
//! in order, the iteration bound, the cancellation token, and the wall-clock
//! timeout; all three produce terminal failures. The node runs, the new
//! state is stamped with the iteration counter, the observer is notified,
//! and the edge index resolves the next node. Traversal ends cleanly when no
//! edge matches.
//!
//! The engine never preempts a node: cancellation and timeout take effect at
//! the next loop head, so a node that was picked up runs to completion.
//!
//! # Examples
//!
//! ```rust,no_run
//! use flowgraph::graphs::Graph;
//! use flowgraph::runtimes::{Engine, EngineOptions, NoopObserver};
//! use flowgraph::state::WorkflowState;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example(graph: Graph) -> Result<(), Box<dyn std::error::Error>> {
//! let engine = Engine::new(EngineOptions::default());
//! let report = engine
//!     .execute(
//!         &graph,
//!         WorkflowState::new("wf", "run_1"),
//!         &CancellationToken::new(),
//!         &NoopObserver,
//!     )
//!     .await?;
//! println!("finished after {} node executions", report.iterations);
//! # Ok(())
//! # }
//! ```

use std::time::{Duration, Instant};

use miette::Diagnostic;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::graphs::edges::EdgeConditionError;
use crate::graphs::Graph;
use crate::node::NodeOutcomeStatus;
use crate::runtimes::observer::{ExecutionObserver, ObserverError};
use crate::state::WorkflowState;
use crate::types::RunStatus;

/// Default iteration bound; the guard against runaway conditional loops.
pub const DEFAULT_MAX_ITERATIONS: u32 = 100;

/// Per-run execution knobs.
#[derive(Clone, Debug)]
pub struct EngineOptions {
    /// Hard upper bound on node executions.
    pub max_iterations: u32,
    /// Wall-clock budget for the whole run; `None` means unbounded.
    pub timeout: Option<Duration>,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            max_iterations: DEFAULT_MAX_ITERATIONS,
            timeout: None,
        }
    }
}

/// How a run ended when it did not complete.
#[derive(Debug, Error, Diagnostic)]
pub enum EngineError {
    /// A node's tool raised; the error is already folded into the state.
    #[error("node '{node}' failed: {message}")]
    #[diagnostic(code(flowgraph::engine::node_execution))]
    NodeExecution { node: String, message: String },

    /// An edge condition raised during routing.
    #[error(transparent)]
    #[diagnostic(transparent)]
    EdgeCondition(#[from] EdgeConditionError),

    /// The iteration bound was hit before traversal terminated.
    #[error("max iterations ({limit}) exceeded")]
    #[diagnostic(
        code(flowgraph::engine::max_iterations),
        help("Raise max_iterations or fix the loop condition that never goes false.")
    )]
    MaxIterationsExceeded { limit: u32 },

    /// The wall-clock budget elapsed between nodes.
    #[error("timeout after {elapsed_ms}ms (budget {budget_ms}ms)")]
    #[diagnostic(code(flowgraph::engine::timeout))]
    Timeout { elapsed_ms: u64, budget_ms: u64 },

    /// Cancellation was requested and observed at a loop head.
    #[error("cancelled")]
    #[diagnostic(code(flowgraph::engine::cancelled))]
    Cancelled,

    /// A persistence callback kept failing; the run cannot be audited.
    #[error("persistence failure: {message}")]
    #[diagnostic(code(flowgraph::engine::persistence))]
    Persistence { message: String },

    /// The graph broke an invariant validation should have caught.
    #[error("invalid graph: {message}")]
    #[diagnostic(
        code(flowgraph::engine::invalid_graph),
        help("Run Graph::validate before execution.")
    )]
    InvalidGraph { message: String },
}

impl EngineError {
    /// The terminal run status this error maps to.
    #[must_use]
    pub fn run_status(&self) -> RunStatus {
        match self {
            Self::Cancelled => RunStatus::Cancelled,
            _ => RunStatus::Failed,
        }
    }

    /// The `error_message` recorded on the run row. Timeout and
    /// cancellation use their fixed wire spellings.
    #[must_use]
    pub fn run_error_message(&self) -> String {
        match self {
            Self::Timeout { .. } => "timeout".to_string(),
            Self::Cancelled => "cancelled".to_string(),
            other => other.to_string(),
        }
    }
}

impl From<ObserverError> for EngineError {
    fn from(err: ObserverError) -> Self {
        Self::Persistence {
            message: err.message,
        }
    }
}

/// What a completed traversal produced.
#[derive(Clone, Debug)]
pub struct EngineReport {
    /// The final state.
    pub state: WorkflowState,
    /// Node-execution count.
    pub iterations: u32,
    /// Wall-clock duration of the traversal.
    pub duration: Duration,
}

impl EngineReport {
    /// Duration in whole milliseconds.
    #[must_use]
    pub fn duration_ms(&self) -> u64 {
        self.duration.as_millis() as u64
    }
}

/// Executes validated graphs. Stateless; one engine value can serve any
/// number of runs, each call carrying its own options' worth of behavior.
#[derive(Clone, Debug, Default)]
pub struct Engine {
    options: EngineOptions,
}

impl Engine {
    /// An engine with the given options.
    #[must_use]
    pub fn new(options: EngineOptions) -> Self {
        Self { options }
    }

    /// The configured options.
    #[must_use]
    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    /// Walk `graph` from its entry point until no edge matches.
    ///
    /// Assumes a validated graph. The observer is notified per node in
    /// execution order; the state the observer sees on completion is the
    /// state routing will use.
    #[instrument(skip_all, fields(workflow = %graph.name(), run = %initial_state.run_id), err)]
    pub async fn execute(
        &self,
        graph: &Graph,
        initial_state: WorkflowState,
        cancellation: &CancellationToken,
        observer: &dyn ExecutionObserver,
    ) -> Result<EngineReport, EngineError> {
        let entry = graph
            .entry_point()
            .ok_or_else(|| EngineError::InvalidGraph {
                message: "no entry point".to_string(),
            })?;

        let mut state = initial_state;
        let mut current = Some(entry.to_string());
        let mut iterations: u32 = 0;
        let started = Instant::now();

        while let Some(node_name) = current {
            if iterations >= self.options.max_iterations {
                return Err(EngineError::MaxIterationsExceeded {
                    limit: self.options.max_iterations,
                });
            }
            if cancellation.is_cancelled() {
                tracing::info!(node = %node_name, iteration = iterations, "cancellation observed");
                return Err(EngineError::Cancelled);
            }
            if let Some(budget) = self.options.timeout {
                let elapsed = started.elapsed();
                if elapsed > budget {
                    return Err(EngineError::Timeout {
                        elapsed_ms: elapsed.as_millis() as u64,
                        budget_ms: budget.as_millis() as u64,
                    });
                }
            }

            let node = graph
                .node(&node_name)
                .ok_or_else(|| EngineError::InvalidGraph {
                    message: format!("node '{node_name}' not found"),
                })?;

            observer.on_node_start(&node_name, iterations).await?;
            tracing::debug!(node = %node_name, iteration = iterations, "executing node");

            let outcome = node.execute(state).await;
            let duration_ms = outcome.duration_ms();
            state = outcome.state.with_iteration(iterations);

            match outcome.status {
                NodeOutcomeStatus::Completed => {
                    observer
                        .on_node_complete(&node_name, iterations, duration_ms, &state)
                        .await?;
                }
                NodeOutcomeStatus::Failed => {
                    let message = outcome.error.unwrap_or_else(|| "unknown failure".to_string());
                    observer
                        .on_node_failed(&node_name, iterations, duration_ms, &message, &state)
                        .await?;
                    return Err(EngineError::NodeExecution {
                        node: node_name,
                        message,
                    });
                }
            }

            current = graph
                .edges()
                .next_node(&node_name, &state)
                .await?
                .map(str::to_string);
            iterations += 1;
        }

        let duration = started.elapsed();
        tracing::info!(iterations, duration_ms = duration.as_millis() as u64, "traversal complete");
        Ok(EngineReport {
            state,
            iterations,
            duration,
        })
    }
}
