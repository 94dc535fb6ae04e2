//! The storage contract and its reference backends.
//!
//! The coordinator speaks only to the [`Repository`] trait; any store that
//! implements it works. Two reference backends ship with the crate:
//! [`MemoryRepository`] for tests and development, and (behind the `sqlite`
//! feature) [`SqliteRepository`] for durable single-file persistence.
//!
//! Every operation is a single atomic row insert or update. Status and
//! final-state updates are idempotent: re-applying the same transition does
//! not corrupt the row, which is what makes bounded retries of persistence
//! operations safe.

pub mod memory;
pub mod records;
#[cfg(feature = "sqlite")]
pub mod sqlite;

use async_trait::async_trait;
use miette::Diagnostic;
use serde_json::Value;
use thiserror::Error;

use crate::graphs::GraphDefinition;
use crate::types::RunStatus;

pub use memory::MemoryRepository;
pub use records::{
    ExecutionLogRecord, GraphRecord, NewLogEntry, RunFilter, RunRecord, RunWithLogs, StatsSummary,
};
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteRepository;

/// Failures surfaced by repository operations.
#[derive(Debug, Error, Diagnostic)]
pub enum RepositoryError {
    /// A graph with the same name already exists.
    #[error("graph '{name}' already exists")]
    #[diagnostic(
        code(flowgraph::repository::duplicate_graph),
        help("Graph names are unique; pick another name or update the existing graph.")
    )]
    DuplicateGraphName { name: String },

    /// An update referenced a run that does not exist.
    #[error("run '{run_id}' not found")]
    #[diagnostic(code(flowgraph::repository::run_not_found))]
    RunNotFound { run_id: String },

    /// Stored JSON could not be decoded into its record shape.
    #[error("stored record is corrupt: {message}")]
    #[diagnostic(
        code(flowgraph::repository::corrupt_record),
        help("The row predates a schema change or was written by another tool.")
    )]
    CorruptRecord { message: String },

    /// The backing store failed.
    #[error("storage backend error: {message}")]
    #[diagnostic(code(flowgraph::repository::backend))]
    Backend { message: String },
}

impl RepositoryError {
    /// Wrap any backend failure.
    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend {
            message: message.into(),
        }
    }

    /// Wrap a JSON decoding failure.
    pub fn corrupt(message: impl Into<String>) -> Self {
        Self::CorruptRecord {
            message: message.into(),
        }
    }
}

/// The data-access interface the coordinator consumes.
///
/// All operations are potentially suspending. Implementations provide their
/// own transactional discipline; callers assume single-row atomicity only.
#[async_trait]
pub trait Repository: Send + Sync {
    /// Persist a graph definition. Fails on duplicate names.
    async fn create_graph(
        &self,
        definition: &GraphDefinition,
    ) -> Result<GraphRecord, RepositoryError>;

    /// Fetch a graph by surrogate id.
    async fn graph_by_id(&self, id: i64) -> Result<Option<GraphRecord>, RepositoryError>;

    /// Fetch a graph by unique name.
    async fn graph_by_name(&self, name: &str) -> Result<Option<GraphRecord>, RepositoryError>;

    /// List graphs, newest first.
    async fn list_graphs(
        &self,
        skip: u32,
        limit: u32,
        active_only: bool,
    ) -> Result<Vec<GraphRecord>, RepositoryError>;

    /// Soft-delete a graph. Returns whether a row was affected.
    async fn soft_delete_graph(&self, id: i64) -> Result<bool, RepositoryError>;

    /// Create a `pending` run row.
    async fn create_run(
        &self,
        run_id: &str,
        graph_id: i64,
        initial_state: &Value,
    ) -> Result<RunRecord, RepositoryError>;

    /// Fetch a run row by public id.
    async fn run_by_run_id(&self, run_id: &str) -> Result<Option<RunRecord>, RepositoryError>;

    /// Fetch a run row with its graph and ordered logs eagerly loaded.
    async fn run_with_logs(&self, run_id: &str) -> Result<Option<RunWithLogs>, RepositoryError>;

    /// List runs, newest first, filtered.
    async fn list_runs(&self, filter: &RunFilter) -> Result<Vec<RunRecord>, RepositoryError>;

    /// Transition a run's lifecycle status.
    ///
    /// Entering `running` stamps `started_at` once; entering a terminal
    /// status stamps `completed_at` once. Transitions after a terminal
    /// status are ignored, keeping terminal rows immutable.
    async fn update_run_status(
        &self,
        run_id: &str,
        status: RunStatus,
        error_message: Option<&str>,
    ) -> Result<(), RepositoryError>;

    /// Opportunistically record the latest observed state.
    async fn update_current_state(
        &self,
        run_id: &str,
        state: &Value,
    ) -> Result<(), RepositoryError>;

    /// Record the terminal state and totals.
    async fn update_final_state(
        &self,
        run_id: &str,
        final_state: &Value,
        total_iterations: u32,
        total_execution_time_ms: u64,
    ) -> Result<(), RepositoryError>;

    /// Append one execution-log row.
    async fn append_log(&self, entry: NewLogEntry) -> Result<(), RepositoryError>;

    /// All log rows of a run, ordered by timestamp with insertion order as
    /// the tiebreak.
    async fn logs_for_run(&self, run_id: &str)
        -> Result<Vec<ExecutionLogRecord>, RepositoryError>;

    /// Aggregate counters and averages.
    async fn stats_summary(&self) -> Result<StatsSummary, RepositoryError>;
}
