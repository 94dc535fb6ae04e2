//! Run event frames.
//!
//! Every frame a subscriber receives is one [`RunEvent`] variant, serialized
//! as a JSON object with a `type` discriminator and a `timestamp`. The
//! variants cover the whole life of a run: status transitions, per-node
//! completions, log mirroring, progress, errors, the terminal
//! `workflow_completed`, and the `pong` heartbeat reply.
//!
//! Frames are self-describing so a WebSocket layer can forward them
//! verbatim.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::{NodeStatus, RunStatus};

/// One frame on a run's event stream.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunEvent {
    /// The run's lifecycle status changed, or a node was picked up.
    StatusUpdate {
        run_id: String,
        status: RunStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        current_node: Option<String>,
        /// 0-100, when a meaningful figure exists.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        progress: Option<u8>,
        timestamp: DateTime<Utc>,
    },

    /// A node finished executing (successfully or not).
    NodeCompleted {
        run_id: String,
        node_name: String,
        duration_ms: u64,
        iteration: u32,
        node_status: NodeStatus,
        timestamp: DateTime<Utc>,
    },

    /// Terminal frame: the run reached a final status. Always the last
    /// meaningful frame before end-of-stream.
    WorkflowCompleted {
        run_id: String,
        status: RunStatus,
        final_state: Value,
        total_duration_ms: u64,
        total_iterations: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error_message: Option<String>,
        timestamp: DateTime<Utc>,
    },

    /// Coarse progress against the graph's node count.
    ProgressUpdate {
        run_id: String,
        current_node: String,
        completed_nodes: u32,
        total_nodes: u32,
        progress_percentage: u8,
        timestamp: DateTime<Utc>,
    },

    /// Mirror of an execution-log row.
    LogEntry {
        run_id: String,
        node_name: String,
        status: NodeStatus,
        iteration: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        execution_time_ms: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error_message: Option<String>,
        timestamp: DateTime<Utc>,
    },

    /// An error the subscriber should surface.
    Error {
        run_id: String,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        node: Option<String>,
        timestamp: DateTime<Utc>,
    },

    /// Heartbeat reply to a client `ping`.
    Pong { timestamp: DateTime<Utc> },
}

impl RunEvent {
    /// A status-update frame stamped now.
    #[must_use]
    pub fn status_update(
        run_id: impl Into<String>,
        status: RunStatus,
        current_node: Option<String>,
    ) -> Self {
        Self::StatusUpdate {
            run_id: run_id.into(),
            status,
            current_node,
            progress: None,
            timestamp: Utc::now(),
        }
    }

    /// A node-completed frame stamped now.
    #[must_use]
    pub fn node_completed(
        run_id: impl Into<String>,
        node_name: impl Into<String>,
        duration_ms: u64,
        iteration: u32,
        node_status: NodeStatus,
    ) -> Self {
        Self::NodeCompleted {
            run_id: run_id.into(),
            node_name: node_name.into(),
            duration_ms,
            iteration,
            node_status,
            timestamp: Utc::now(),
        }
    }

    /// The terminal frame stamped now.
    #[must_use]
    pub fn workflow_completed(
        run_id: impl Into<String>,
        status: RunStatus,
        final_state: Value,
        total_duration_ms: u64,
        total_iterations: u32,
        error_message: Option<String>,
    ) -> Self {
        Self::WorkflowCompleted {
            run_id: run_id.into(),
            status,
            final_state,
            total_duration_ms,
            total_iterations,
            error_message,
            timestamp: Utc::now(),
        }
    }

    /// A progress frame stamped now; the percentage is clamped to 100
    /// because looping workflows revisit nodes.
    #[must_use]
    pub fn progress(
        run_id: impl Into<String>,
        current_node: impl Into<String>,
        completed_nodes: u32,
        total_nodes: u32,
    ) -> Self {
        let percentage = if total_nodes == 0 {
            0
        } else {
            ((completed_nodes.saturating_mul(100)) / total_nodes).min(100) as u8
        };
        Self::ProgressUpdate {
            run_id: run_id.into(),
            current_node: current_node.into(),
            completed_nodes,
            total_nodes,
            progress_percentage: percentage,
            timestamp: Utc::now(),
        }
    }

    /// A log-mirror frame stamped now.
    #[must_use]
    pub fn log_entry(
        run_id: impl Into<String>,
        node_name: impl Into<String>,
        status: NodeStatus,
        iteration: u32,
        execution_time_ms: Option<u64>,
        error_message: Option<String>,
    ) -> Self {
        Self::LogEntry {
            run_id: run_id.into(),
            node_name: node_name.into(),
            status,
            iteration,
            execution_time_ms,
            error_message,
            timestamp: Utc::now(),
        }
    }

    /// An error frame stamped now.
    #[must_use]
    pub fn error(
        run_id: impl Into<String>,
        message: impl Into<String>,
        node: Option<String>,
    ) -> Self {
        Self::Error {
            run_id: run_id.into(),
            message: message.into(),
            node,
            timestamp: Utc::now(),
        }
    }

    /// A pong frame stamped now.
    #[must_use]
    pub fn pong() -> Self {
        Self::Pong {
            timestamp: Utc::now(),
        }
    }

    /// The run this frame belongs to; `None` only for heartbeat frames.
    #[must_use]
    pub fn run_id(&self) -> Option<&str> {
        match self {
            Self::StatusUpdate { run_id, .. }
            | Self::NodeCompleted { run_id, .. }
            | Self::WorkflowCompleted { run_id, .. }
            | Self::ProgressUpdate { run_id, .. }
            | Self::LogEntry { run_id, .. }
            | Self::Error { run_id, .. } => Some(run_id),
            Self::Pong { .. } => None,
        }
    }

    /// Whether this frame ends the stream.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::WorkflowCompleted { .. })
    }
}
