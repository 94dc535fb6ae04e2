//! Run lifecycle coordination.
//!
//! The coordinator sits between external callers and the engine. Starting a
//! run is synchronous up to the point the caller has a `run_id` in hand:
//! resolve the graph row, rehydrate it through the registries (unknown tool
//! names fail here, before any row is written), persist a `pending` run,
//! and hand back the record. Execution itself happens on a spawned task
//! gated by the concurrency semaphore.
//!
//! During execution the coordinator's observer appends each execution-log
//! row *before* publishing the matching event, keeping the broker stream
//! and the audit table in agreement. On any terminal transition the run row
//! is finalized, a `workflow_completed` frame is published, and the run's
//! event channel is closed.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use miette::Diagnostic;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::event_bus::{EventBroker, RunEvent, RunEventStream};
use crate::graphs::{Graph, GraphBuildError, GraphDefinition};
use crate::registry::{ConditionRegistry, ToolRegistry};
use crate::repository::{
    GraphRecord, NewLogEntry, Repository, RepositoryError, RunFilter, RunRecord, RunWithLogs,
    StatsSummary,
};
use crate::runtimes::engine::{Engine, EngineOptions, DEFAULT_MAX_ITERATIONS};
use crate::runtimes::observer::{ExecutionObserver, ObserverError};
use crate::state::{StateError, WorkflowState};
use crate::types::{NodeStatus, RunStatus};
use crate::utils::ids;

/// Coordinator-level failures.
#[derive(Debug, Error, Diagnostic)]
pub enum CoordinatorError {
    /// The named graph does not exist.
    #[error("graph '{name}' not found")]
    #[diagnostic(code(flowgraph::coordinator::graph_not_found))]
    GraphNotFound { name: String },

    /// The run id does not exist.
    #[error("run '{run_id}' not found")]
    #[diagnostic(code(flowgraph::coordinator::run_not_found))]
    RunNotFound { run_id: String },

    /// The graph could not be rehydrated (unknown tool/condition names or
    /// structural problems).
    #[error(transparent)]
    #[diagnostic(transparent)]
    Build(#[from] GraphBuildError),

    /// The repository failed.
    #[error(transparent)]
    #[diagnostic(transparent)]
    Repository(#[from] RepositoryError),

    /// State serialization failed.
    #[error(transparent)]
    #[diagnostic(transparent)]
    State(#[from] StateError),
}

/// Coordinator tuning, usually derived from [`EngineConfig`].
///
/// [`EngineConfig`]: crate::config::EngineConfig
#[derive(Clone, Debug)]
pub struct CoordinatorConfig {
    /// Bound on concurrently executing runs; queued runs stay `pending`.
    pub max_concurrent_runs: usize,
    /// Iteration bound applied when a request does not override it.
    pub default_max_iterations: u32,
    /// Wall-clock budget applied when a request does not override it.
    pub default_timeout: Option<Duration>,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_runs: 10,
            default_max_iterations: DEFAULT_MAX_ITERATIONS,
            default_timeout: Some(Duration::from_secs(300)),
        }
    }
}

/// A request to start one run.
#[derive(Clone, Debug, Default)]
pub struct RunRequest {
    /// Which graph to execute.
    pub graph_name: String,
    /// Seed for the state's open `data` payload.
    pub initial_data: FxHashMap<String, Value>,
    /// Execution hints carried on the state's `config` map.
    pub config: FxHashMap<String, Value>,
    /// Per-run wall-clock budget override.
    pub timeout: Option<Duration>,
    /// Per-run iteration bound override.
    pub max_iterations: Option<u32>,
}

impl RunRequest {
    /// A request with defaults for everything but the graph name.
    #[must_use]
    pub fn new(graph_name: impl Into<String>) -> Self {
        Self {
            graph_name: graph_name.into(),
            ..Default::default()
        }
    }

    /// Add one payload seed entry.
    #[must_use]
    pub fn data(mut self, key: impl Into<String>, value: Value) -> Self {
        self.initial_data.insert(key.into(), value);
        self
    }

    /// Add one config hint.
    #[must_use]
    pub fn config(mut self, key: impl Into<String>, value: Value) -> Self {
        self.config.insert(key.into(), value);
        self
    }

    /// Override the wall-clock budget.
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Override the iteration bound.
    #[must_use]
    pub fn max_iterations(mut self, max_iterations: u32) -> Self {
        self.max_iterations = Some(max_iterations);
        self
    }
}

/// Shared handles a background run needs after the coordinator call that
/// spawned it has returned.
#[derive(Clone)]
struct RunHandles {
    repository: Arc<dyn Repository>,
    broker: Arc<EventBroker>,
    active: Arc<Mutex<FxHashMap<String, CancellationToken>>>,
}

/// Mediates between callers, the engine, the repository, and the broker.
///
/// All dependencies are injected; the coordinator owns no global state.
pub struct RunCoordinator {
    tools: ToolRegistry,
    conditions: ConditionRegistry,
    handles: RunHandles,
    config: CoordinatorConfig,
    semaphore: Arc<Semaphore>,
}

impl RunCoordinator {
    /// Wire up a coordinator and start the broker's routing task.
    #[must_use]
    pub fn new(
        tools: ToolRegistry,
        conditions: ConditionRegistry,
        repository: Arc<dyn Repository>,
        broker: Arc<EventBroker>,
        config: CoordinatorConfig,
    ) -> Self {
        broker.start();
        let semaphore = Arc::new(Semaphore::new(config.max_concurrent_runs.max(1)));
        Self {
            tools,
            conditions,
            handles: RunHandles {
                repository,
                broker,
                active: Arc::new(Mutex::new(FxHashMap::default())),
            },
            config,
            semaphore,
        }
    }

    /// The shared repository handle.
    #[must_use]
    pub fn repository(&self) -> &Arc<dyn Repository> {
        &self.handles.repository
    }

    /// The shared broker handle.
    #[must_use]
    pub fn broker(&self) -> &Arc<EventBroker> {
        &self.handles.broker
    }

    /// Persist a graph definition.
    ///
    /// The definition is rehydrated once before writing, so unknown tool or
    /// condition names and structural offenses are rejected here rather
    /// than at first run.
    #[instrument(skip(self, definition), fields(graph = %definition.name), err)]
    pub async fn create_graph(
        &self,
        definition: GraphDefinition,
    ) -> Result<GraphRecord, CoordinatorError> {
        definition.build(&self.tools, &self.conditions)?;
        Ok(self.handles.repository.create_graph(&definition).await?)
    }

    /// Start a run of the named graph.
    ///
    /// Returns as soon as the `pending` row exists; execution proceeds on a
    /// background task. The returned record carries the allocated `run_id`.
    #[instrument(skip(self, request), fields(graph = %request.graph_name), err)]
    pub async fn start_run(&self, request: RunRequest) -> Result<RunRecord, CoordinatorError> {
        let record = self
            .handles
            .repository
            .graph_by_name(&request.graph_name)
            .await?
            .ok_or_else(|| CoordinatorError::GraphNotFound {
                name: request.graph_name.clone(),
            })?;

        // Rehydrate before creating the run row: a bad definition or a
        // missing tool must not leave an orphaned pending run behind.
        let graph = record.definition.build(&self.tools, &self.conditions)?;

        let run_id = ids::generate_run_id();
        let state = WorkflowState::builder(&record.name, &run_id)
            .data_map(request.initial_data)
            .config_map(request.config)
            .build();
        let initial_json = state.to_value()?;
        let run = self
            .handles
            .repository
            .create_run(&run_id, record.id, &initial_json)
            .await?;

        let options = EngineOptions {
            max_iterations: request
                .max_iterations
                .unwrap_or(self.config.default_max_iterations),
            timeout: request.timeout.or(self.config.default_timeout),
        };
        let token = CancellationToken::new();
        self.handles
            .active
            .lock()
            .insert(run_id.clone(), token.clone());

        let handles = self.handles.clone();
        let semaphore = Arc::clone(&self.semaphore);
        tokio::spawn(execute_run(
            handles, semaphore, run_id, graph, state, options, token,
        ));

        Ok(run)
    }

    /// Request cancellation of a run. Returns whether the run was active.
    ///
    /// The engine observes the request at its next loop head; a node that
    /// is already executing runs to completion first.
    pub fn cancel_run(&self, run_id: &str) -> bool {
        match self.handles.active.lock().get(run_id) {
            Some(token) => {
                tracing::info!(run_id, "cancellation requested");
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// The run row with its graph and ordered log entries.
    pub async fn run_state(&self, run_id: &str) -> Result<RunWithLogs, CoordinatorError> {
        self.handles
            .repository
            .run_with_logs(run_id)
            .await?
            .ok_or_else(|| CoordinatorError::RunNotFound {
                run_id: run_id.to_string(),
            })
    }

    /// List run rows, filtered.
    pub async fn list_runs(&self, filter: &RunFilter) -> Result<Vec<RunRecord>, CoordinatorError> {
        Ok(self.handles.repository.list_runs(filter).await?)
    }

    /// Aggregate counters for the stats endpoint.
    pub async fn stats(&self) -> Result<StatsSummary, CoordinatorError> {
        Ok(self.handles.repository.stats_summary().await?)
    }

    /// Subscribe to a run's event stream.
    ///
    /// A live run yields a broker stream. A run already in a terminal state
    /// yields a stream with exactly one `workflow_completed` frame
    /// reconstructed from the persisted row, then end-of-stream.
    pub async fn subscribe(&self, run_id: &str) -> Result<RunEventStream, CoordinatorError> {
        // Subscribe before reading the row: finalization writes the row
        // first and publishes afterwards, so a non-terminal read here
        // guarantees the live stream still carries the terminal frame.
        let live = self.handles.broker.subscribe(run_id);
        let run = self
            .handles
            .repository
            .run_by_run_id(run_id)
            .await?
            .ok_or_else(|| CoordinatorError::RunNotFound {
                run_id: run_id.to_string(),
            })?;

        if run.status.is_terminal() {
            // The eager subscription re-created the run's channel; close it
            // again so terminal runs do not accumulate empty channels.
            self.handles.broker.close(run_id);
            drop(live);
            Ok(RunEventStream::replay(terminal_frame(&run)))
        } else {
            Ok(live)
        }
    }
}

impl std::fmt::Debug for RunCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunCoordinator")
            .field("config", &self.config)
            .field("active_runs", &self.handles.active.lock().len())
            .finish()
    }
}

fn terminal_frame(run: &RunRecord) -> RunEvent {
    RunEvent::workflow_completed(
        run.run_id.clone(),
        run.status,
        run.final_state.clone().unwrap_or(Value::Null),
        run.total_execution_time_ms.unwrap_or(0),
        run.total_iterations.unwrap_or(0),
        run.error_message.clone(),
    )
}

/// Background body of one run.
#[instrument(skip_all, fields(run_id = %run_id))]
async fn execute_run(
    handles: RunHandles,
    semaphore: Arc<Semaphore>,
    run_id: String,
    graph: Graph,
    state: WorkflowState,
    options: EngineOptions,
    token: CancellationToken,
) {
    let initial_snapshot = state.to_value().unwrap_or(Value::Null);

    // Respect the concurrency bound, but let cancellation drain queued runs
    // without ever executing them.
    let permit = tokio::select! {
        permit = semaphore.acquire_owned() => permit,
        _ = token.cancelled() => {
            finalize_error(
                &handles,
                &run_id,
                RunStatus::Cancelled,
                "cancelled",
                initial_snapshot,
                0,
                0,
            )
            .await;
            return;
        }
    };
    let _permit = match permit {
        Ok(permit) => permit,
        Err(_) => {
            finalize_error(
                &handles,
                &run_id,
                RunStatus::Failed,
                "coordinator shutting down",
                initial_snapshot,
                0,
                0,
            )
            .await;
            return;
        }
    };

    let started = Instant::now();
    if let Err(err) = handles
        .repository
        .update_run_status(&run_id, RunStatus::Running, None)
        .await
    {
        tracing::error!(error = %err, "could not transition run to running");
        finalize_error(
            &handles,
            &run_id,
            RunStatus::Failed,
            &format!("persistence failure: {err}"),
            initial_snapshot,
            0,
            0,
        )
        .await;
        return;
    }
    handles
        .broker
        .publish(RunEvent::status_update(&run_id, RunStatus::Running, None));

    let observer = CoordinatorObserver {
        run_id: run_id.clone(),
        repository: Arc::clone(&handles.repository),
        broker: Arc::clone(&handles.broker),
        total_nodes: graph.node_count() as u32,
        executed_nodes: AtomicU32::new(0),
        last_state: Mutex::new(None),
    };

    let engine = Engine::new(options);
    let result = engine.execute(&graph, state, &token, &observer).await;
    let duration_ms = started.elapsed().as_millis() as u64;
    let iterations = observer.executed_nodes.load(Ordering::Relaxed);

    match result {
        Ok(report) => {
            let final_state = report.state.to_value().unwrap_or(Value::Null);
            if let Err(err) = handles
                .repository
                .update_final_state(&run_id, &final_state, report.iterations, duration_ms)
                .await
            {
                tracing::error!(error = %err, "final state write failed");
            }
            if let Err(err) = handles
                .repository
                .update_run_status(&run_id, RunStatus::Completed, None)
                .await
            {
                tracing::error!(error = %err, "completed transition failed");
            }
            handles.broker.publish(RunEvent::workflow_completed(
                &run_id,
                RunStatus::Completed,
                final_state,
                duration_ms,
                report.iterations,
                None,
            ));
            handles.broker.close(&run_id);
            handles.active.lock().remove(&run_id);
            tracing::info!(iterations = report.iterations, duration_ms, "run completed");
        }
        Err(err) => {
            let status = err.run_status();
            let message = err.run_error_message();
            let last_state = observer
                .last_state
                .lock()
                .clone()
                .unwrap_or(initial_snapshot);
            finalize_error(
                &handles, &run_id, status, &message, last_state, iterations, duration_ms,
            )
            .await;
            tracing::warn!(status = %status, error = %message, "run terminated");
        }
    }
}

/// Write the failure/cancellation outcome, publish the terminal frame, and
/// close the stream.
async fn finalize_error(
    handles: &RunHandles,
    run_id: &str,
    status: RunStatus,
    message: &str,
    final_state: Value,
    iterations: u32,
    duration_ms: u64,
) {
    if let Err(err) = handles
        .repository
        .update_final_state(run_id, &final_state, iterations, duration_ms)
        .await
    {
        tracing::error!(run_id, error = %err, "final state write failed");
    }
    if let Err(err) = handles
        .repository
        .update_run_status(run_id, status, Some(message))
        .await
    {
        tracing::error!(run_id, error = %err, "terminal transition failed");
    }
    handles.broker.publish(RunEvent::workflow_completed(
        run_id,
        status,
        final_state,
        duration_ms,
        iterations,
        Some(message.to_string()),
    ));
    handles.broker.close(run_id);
    handles.active.lock().remove(run_id);
}

/// Observer wired to the repository and the broker.
///
/// The log row is appended (with bounded retries) before the matching frame
/// is published; a subscriber that sees `node_completed` can always read
/// the row.
struct CoordinatorObserver {
    run_id: String,
    repository: Arc<dyn Repository>,
    broker: Arc<EventBroker>,
    total_nodes: u32,
    executed_nodes: AtomicU32,
    last_state: Mutex<Option<Value>>,
}

impl CoordinatorObserver {
    const RETRIES: u32 = 3;

    async fn append_with_retry(&self, entry: NewLogEntry) -> Result<(), ObserverError> {
        let mut attempt = 0;
        loop {
            match self.repository.append_log(entry.clone()).await {
                Ok(()) => return Ok(()),
                Err(err @ RepositoryError::RunNotFound { .. }) => {
                    return Err(ObserverError::new(format!("persistence failure: {err}")));
                }
                Err(err) if attempt + 1 < Self::RETRIES => {
                    attempt += 1;
                    tracing::warn!(
                        run_id = %self.run_id,
                        attempt,
                        error = %err,
                        "log append failed; retrying"
                    );
                    tokio::time::sleep(Duration::from_millis(25 * u64::from(attempt))).await;
                }
                Err(err) => {
                    return Err(ObserverError::new(format!("persistence failure: {err}")));
                }
            }
        }
    }

    fn publish_log(&self, entry: &NewLogEntry) {
        self.broker.publish(RunEvent::log_entry(
            &self.run_id,
            &entry.node_name,
            entry.status,
            entry.iteration,
            entry.execution_time_ms,
            entry.error_message.clone(),
        ));
    }
}

#[async_trait]
impl ExecutionObserver for CoordinatorObserver {
    async fn on_node_start(&self, node: &str, iteration: u32) -> Result<(), ObserverError> {
        let entry = NewLogEntry::started(&self.run_id, node, iteration);
        self.append_with_retry(entry.clone()).await?;
        self.publish_log(&entry);
        self.broker.publish(RunEvent::status_update(
            &self.run_id,
            RunStatus::Running,
            Some(node.to_string()),
        ));
        Ok(())
    }

    async fn on_node_complete(
        &self,
        node: &str,
        iteration: u32,
        duration_ms: u64,
        state: &WorkflowState,
    ) -> Result<(), ObserverError> {
        let entry = NewLogEntry::completed(&self.run_id, node, iteration, duration_ms);
        self.append_with_retry(entry.clone()).await?;

        let executed = self.executed_nodes.fetch_add(1, Ordering::Relaxed) + 1;
        if let Ok(snapshot) = state.to_value() {
            // current_state is an opportunistic progress aid; losing one
            // write is not worth failing the run over.
            if let Err(err) = self
                .repository
                .update_current_state(&self.run_id, &snapshot)
                .await
            {
                tracing::warn!(run_id = %self.run_id, error = %err, "current_state update failed");
            }
            *self.last_state.lock() = Some(snapshot);
        }

        self.publish_log(&entry);
        self.broker.publish(RunEvent::node_completed(
            &self.run_id,
            node,
            duration_ms,
            iteration,
            NodeStatus::Completed,
        ));
        self.broker.publish(RunEvent::progress(
            &self.run_id,
            node,
            executed,
            self.total_nodes,
        ));
        Ok(())
    }

    async fn on_node_failed(
        &self,
        node: &str,
        iteration: u32,
        duration_ms: u64,
        error: &str,
        state: &WorkflowState,
    ) -> Result<(), ObserverError> {
        let entry = NewLogEntry::failed(&self.run_id, node, iteration, duration_ms, error);
        self.append_with_retry(entry.clone()).await?;

        self.executed_nodes.fetch_add(1, Ordering::Relaxed);
        if let Ok(snapshot) = state.to_value() {
            *self.last_state.lock() = Some(snapshot);
        }

        self.publish_log(&entry);
        self.broker.publish(RunEvent::node_completed(
            &self.run_id,
            node,
            duration_ms,
            iteration,
            NodeStatus::Failed,
        ));
        self.broker.publish(RunEvent::error(
            &self.run_id,
            error,
            Some(node.to_string()),
        ));
        Ok(())
    }
}
