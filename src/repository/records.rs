//! Persisted record shapes and query helpers.
//!
//! These structs are the storage-agnostic row images the [`Repository`]
//! trait trades in. Both backends produce identical values, which is what
//! lets the coordinator and tests swap storage freely.
//!
//! [`Repository`]: crate::repository::Repository

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::graphs::GraphDefinition;
use crate::types::{NodeStatus, RunStatus};

/// A persisted graph definition row.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GraphRecord {
    /// Surrogate primary key.
    pub id: i64,
    /// Unique workflow name.
    pub name: String,
    /// Human description.
    pub description: Option<String>,
    /// The serialized definition, rehydrated through the registries at run
    /// time.
    pub definition: GraphDefinition,
    /// Entry-point node name, denormalized for listings.
    pub entry_point: String,
    /// Definition version counter.
    pub version: i32,
    /// Soft-delete flag; inactive graphs are hidden from default listings.
    pub is_active: bool,
    /// Row creation time.
    pub created_at: DateTime<Utc>,
    /// Last modification time.
    pub updated_at: DateTime<Utc>,
}

/// A persisted run row.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    /// Surrogate primary key.
    pub id: i64,
    /// Opaque public run identifier.
    pub run_id: String,
    /// The graph this run executes.
    pub graph_id: i64,
    /// Lifecycle status.
    pub status: RunStatus,
    /// State the run started from.
    pub initial_state: Value,
    /// Opportunistically updated mid-run state, for progress polling.
    pub current_state: Option<Value>,
    /// State at the terminal transition.
    pub final_state: Option<Value>,
    /// When the engine began executing.
    pub started_at: Option<DateTime<Utc>>,
    /// When the run reached a terminal status.
    pub completed_at: Option<DateTime<Utc>>,
    /// Node-execution count at termination.
    pub total_iterations: Option<u32>,
    /// Wall-clock duration of the whole run.
    pub total_execution_time_ms: Option<u64>,
    /// Why the run failed or was cancelled.
    pub error_message: Option<String>,
    /// Row creation time.
    pub created_at: DateTime<Utc>,
}

/// A persisted per-node audit row.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExecutionLogRecord {
    /// Surrogate primary key; also the insertion-order tiebreak.
    pub id: i64,
    /// Public identifier of the owning run.
    pub run_id: String,
    /// Node that executed.
    pub node_name: String,
    /// What happened.
    pub status: NodeStatus,
    /// The engine's iteration counter when the node ran.
    pub iteration: u32,
    /// Entry-to-exit time; absent on `started` rows.
    pub execution_time_ms: Option<u64>,
    /// When the row was written.
    pub timestamp: DateTime<Utc>,
    /// Captured error for `failed` rows.
    pub error_message: Option<String>,
}

/// Input for appending one execution-log row.
#[derive(Clone, Debug, PartialEq)]
pub struct NewLogEntry {
    pub run_id: String,
    pub node_name: String,
    pub status: NodeStatus,
    pub iteration: u32,
    pub execution_time_ms: Option<u64>,
    pub error_message: Option<String>,
}

impl NewLogEntry {
    /// A `started` row.
    #[must_use]
    pub fn started(run_id: impl Into<String>, node_name: impl Into<String>, iteration: u32) -> Self {
        Self {
            run_id: run_id.into(),
            node_name: node_name.into(),
            status: NodeStatus::Started,
            iteration,
            execution_time_ms: None,
            error_message: None,
        }
    }

    /// A `completed` row.
    #[must_use]
    pub fn completed(
        run_id: impl Into<String>,
        node_name: impl Into<String>,
        iteration: u32,
        execution_time_ms: u64,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            node_name: node_name.into(),
            status: NodeStatus::Completed,
            iteration,
            execution_time_ms: Some(execution_time_ms),
            error_message: None,
        }
    }

    /// A `failed` row.
    #[must_use]
    pub fn failed(
        run_id: impl Into<String>,
        node_name: impl Into<String>,
        iteration: u32,
        execution_time_ms: u64,
        error_message: impl Into<String>,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            node_name: node_name.into(),
            status: NodeStatus::Failed,
            iteration,
            execution_time_ms: Some(execution_time_ms),
            error_message: Some(error_message.into()),
        }
    }
}

/// A run row together with its eager-loaded graph and ordered log entries.
#[derive(Clone, Debug, PartialEq)]
pub struct RunWithLogs {
    /// The run row.
    pub run: RunRecord,
    /// The graph row the run references, when still present.
    pub graph: Option<GraphRecord>,
    /// Log rows ordered by timestamp (insertion order as tiebreak).
    pub logs: Vec<ExecutionLogRecord>,
}

/// Filter for run listings.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RunFilter {
    /// Restrict to runs of one graph.
    pub graph_id: Option<i64>,
    /// Restrict to one lifecycle status.
    pub status: Option<RunStatus>,
    /// Pagination offset.
    pub skip: u32,
    /// Page size; zero means the backend default.
    pub limit: u32,
}

impl RunFilter {
    /// Effective page size.
    #[must_use]
    pub fn effective_limit(&self) -> u32 {
        if self.limit == 0 {
            100
        } else {
            self.limit.min(1000)
        }
    }
}

/// Aggregate counters for the stats endpoint.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StatsSummary {
    /// All graph rows, active or not.
    pub total_graphs: u64,
    /// Graph rows not soft-deleted.
    pub active_graphs: u64,
    /// All run rows.
    pub total_runs: u64,
    /// Runs currently pending or running.
    pub in_flight_runs: u64,
    /// Terminal `completed` runs.
    pub completed_runs: u64,
    /// Terminal `failed` runs.
    pub failed_runs: u64,
    /// Terminal `cancelled` runs.
    pub cancelled_runs: u64,
    /// Mean wall-clock duration over runs that recorded one.
    pub avg_execution_time_ms: Option<f64>,
    /// Mean node-execution count over runs that recorded one.
    pub avg_iterations: Option<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_entry_constructors_fill_status() {
        let started = NewLogEntry::started("run_1", "a", 0);
        assert_eq!(started.status, NodeStatus::Started);
        assert!(started.execution_time_ms.is_none());

        let completed = NewLogEntry::completed("run_1", "a", 0, 12);
        assert_eq!(completed.status, NodeStatus::Completed);
        assert_eq!(completed.execution_time_ms, Some(12));

        let failed = NewLogEntry::failed("run_1", "a", 0, 3, "boom");
        assert_eq!(failed.status, NodeStatus::Failed);
        assert_eq!(failed.error_message.as_deref(), Some("boom"));
    }

    #[test]
    fn run_filter_limits() {
        assert_eq!(RunFilter::default().effective_limit(), 100);
        assert_eq!(
            RunFilter {
                limit: 5,
                ..Default::default()
            }
            .effective_limit(),
            5
        );
        assert_eq!(
            RunFilter {
                limit: 100_000,
                ..Default::default()
            }
            .effective_limit(),
            1000
        );
    }
}
