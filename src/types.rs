//! Core lifecycle enums shared by persistence and streaming.
//!
//! Both enums serialize as lowercase strings, which is the form stored in
//! the runs/execution_logs tables and emitted in event frames.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle status of a run.
///
/// `pending` → `running` → exactly one of `completed` / `failed` /
/// `cancelled`. After a terminal status the run record is immutable.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Row created, execution not yet started.
    Pending,
    /// The engine is walking the graph.
    Running,
    /// Traversal reached a terminal node.
    Completed,
    /// The engine aborted (node failure, timeout, iteration cap, ...).
    Failed,
    /// Cancellation was requested and took effect.
    Cancelled,
}

impl RunStatus {
    /// Whether this status ends the lifecycle.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// The stored string form.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Parse the stored string form.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of a single node execution, as recorded in the execution log.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    /// The node was picked up; a completion row follows.
    Started,
    /// The node's tool returned a new state.
    Completed,
    /// The node's tool raised.
    Failed,
    /// The node was skipped by its tool's own short-circuit logic.
    Skipped,
}

impl NodeStatus {
    /// The stored string form.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Started => "started",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }

    /// Parse the stored string form.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "started" => Some(Self::Started),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "skipped" => Some(Self::Skipped),
            _ => None,
        }
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_status_terminality() {
        assert!(!RunStatus::Pending.is_terminal());
        assert!(!RunStatus::Running.is_terminal());
        assert!(RunStatus::Completed.is_terminal());
        assert!(RunStatus::Failed.is_terminal());
        assert!(RunStatus::Cancelled.is_terminal());
    }

    #[test]
    fn string_round_trips() {
        for status in [
            RunStatus::Pending,
            RunStatus::Running,
            RunStatus::Completed,
            RunStatus::Failed,
            RunStatus::Cancelled,
        ] {
            assert_eq!(RunStatus::parse(status.as_str()), Some(status));
        }
        for status in [
            NodeStatus::Started,
            NodeStatus::Completed,
            NodeStatus::Failed,
            NodeStatus::Skipped,
        ] {
            assert_eq!(NodeStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(RunStatus::parse("bogus"), None);
        assert_eq!(NodeStatus::parse("bogus"), None);
    }

    #[test]
    fn serde_uses_snake_case_strings() {
        assert_eq!(
            serde_json::to_string(&RunStatus::Completed).unwrap(),
            "\"completed\""
        );
        assert_eq!(
            serde_json::from_str::<NodeStatus>("\"skipped\"").unwrap(),
            NodeStatus::Skipped
        );
    }
}
