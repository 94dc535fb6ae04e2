//! The engine-to-coordinator tap.
//!
//! The engine knows nothing about repositories or brokers; it reports each
//! node's start, completion, and failure through an [`ExecutionObserver`].
//! The coordinator's observer appends the execution-log row first and
//! publishes the matching event second, which is what gives subscribers the
//! "row is visible before the frame arrives" guarantee.
//!
//! Observer callbacks are fallible: a persistence failure that survives the
//! observer's own retries aborts the run.

use async_trait::async_trait;
use thiserror::Error;

use crate::state::WorkflowState;

/// A persistence (or comparable) failure raised from an observer callback.
/// The engine turns this into a run-terminating error.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct ObserverError {
    /// What went wrong, suitable for the run's `error_message`.
    pub message: String,
}

impl ObserverError {
    /// Build from any displayable cause.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Per-node execution callbacks, fired in execution order.
///
/// All methods default to no-ops so partial observers stay small.
#[async_trait]
pub trait ExecutionObserver: Send + Sync {
    /// A node is about to execute.
    async fn on_node_start(&self, _node: &str, _iteration: u32) -> Result<(), ObserverError> {
        Ok(())
    }

    /// A node finished successfully. `state` is the post-node state with the
    /// iteration already stamped.
    async fn on_node_complete(
        &self,
        _node: &str,
        _iteration: u32,
        _duration_ms: u64,
        _state: &WorkflowState,
    ) -> Result<(), ObserverError> {
        Ok(())
    }

    /// A node's tool raised. `state` carries the captured error entry.
    async fn on_node_failed(
        &self,
        _node: &str,
        _iteration: u32,
        _duration_ms: u64,
        _error: &str,
        _state: &WorkflowState,
    ) -> Result<(), ObserverError> {
        Ok(())
    }
}

/// Observer that ignores everything; the default for direct engine use.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopObserver;

#[async_trait]
impl ExecutionObserver for NoopObserver {}
