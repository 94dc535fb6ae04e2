//! Volatile in-memory repository for tests and development.
//!
//! Rows live in parking_lot-guarded tables; every trait operation takes the
//! lock once, mirroring the single-row atomicity real backends provide.
//! Semantics (idempotent transitions, terminal immutability, ordering)
//! match [`SqliteRepository`] so tests exercised against this backend hold
//! against the durable one.
//!
//! [`SqliteRepository`]: crate::repository::sqlite::SqliteRepository

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use serde_json::Value;

use crate::graphs::GraphDefinition;
use crate::repository::records::{
    ExecutionLogRecord, GraphRecord, NewLogEntry, RunFilter, RunRecord, RunWithLogs, StatsSummary,
};
use crate::repository::{Repository, RepositoryError};
use crate::types::RunStatus;

#[derive(Default)]
struct Tables {
    graphs: Vec<GraphRecord>,
    runs: Vec<RunRecord>,
    logs: Vec<ExecutionLogRecord>,
    next_graph_id: i64,
    next_run_id: i64,
    next_log_id: i64,
}

/// In-memory [`Repository`] implementation.
#[derive(Default)]
pub struct MemoryRepository {
    tables: Mutex<Tables>,
}

impl MemoryRepository {
    /// Empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl std::fmt::Debug for MemoryRepository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tables = self.tables.lock();
        f.debug_struct("MemoryRepository")
            .field("graphs", &tables.graphs.len())
            .field("runs", &tables.runs.len())
            .field("logs", &tables.logs.len())
            .finish()
    }
}

#[async_trait]
impl Repository for MemoryRepository {
    async fn create_graph(
        &self,
        definition: &GraphDefinition,
    ) -> Result<GraphRecord, RepositoryError> {
        let mut tables = self.tables.lock();
        if tables.graphs.iter().any(|g| g.name == definition.name) {
            return Err(RepositoryError::DuplicateGraphName {
                name: definition.name.clone(),
            });
        }
        tables.next_graph_id += 1;
        let now = Utc::now();
        let record = GraphRecord {
            id: tables.next_graph_id,
            name: definition.name.clone(),
            description: definition.description.clone(),
            definition: definition.clone(),
            entry_point: definition.entry_point.clone(),
            version: 1,
            is_active: true,
            created_at: now,
            updated_at: now,
        };
        tables.graphs.push(record.clone());
        Ok(record)
    }

    async fn graph_by_id(&self, id: i64) -> Result<Option<GraphRecord>, RepositoryError> {
        Ok(self.tables.lock().graphs.iter().find(|g| g.id == id).cloned())
    }

    async fn graph_by_name(&self, name: &str) -> Result<Option<GraphRecord>, RepositoryError> {
        Ok(self
            .tables
            .lock()
            .graphs
            .iter()
            .find(|g| g.name == name)
            .cloned())
    }

    async fn list_graphs(
        &self,
        skip: u32,
        limit: u32,
        active_only: bool,
    ) -> Result<Vec<GraphRecord>, RepositoryError> {
        let tables = self.tables.lock();
        let limit = if limit == 0 { 100 } else { limit.min(1000) };
        let mut graphs: Vec<GraphRecord> = tables
            .graphs
            .iter()
            .filter(|g| !active_only || g.is_active)
            .cloned()
            .collect();
        graphs.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(graphs
            .into_iter()
            .skip(skip as usize)
            .take(limit as usize)
            .collect())
    }

    async fn soft_delete_graph(&self, id: i64) -> Result<bool, RepositoryError> {
        let mut tables = self.tables.lock();
        match tables.graphs.iter_mut().find(|g| g.id == id) {
            Some(graph) => {
                graph.is_active = false;
                graph.updated_at = Utc::now();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn create_run(
        &self,
        run_id: &str,
        graph_id: i64,
        initial_state: &Value,
    ) -> Result<RunRecord, RepositoryError> {
        let mut tables = self.tables.lock();
        tables.next_run_id += 1;
        let record = RunRecord {
            id: tables.next_run_id,
            run_id: run_id.to_string(),
            graph_id,
            status: RunStatus::Pending,
            initial_state: initial_state.clone(),
            current_state: None,
            final_state: None,
            started_at: None,
            completed_at: None,
            total_iterations: None,
            total_execution_time_ms: None,
            error_message: None,
            created_at: Utc::now(),
        };
        tables.runs.push(record.clone());
        Ok(record)
    }

    async fn run_by_run_id(&self, run_id: &str) -> Result<Option<RunRecord>, RepositoryError> {
        Ok(self
            .tables
            .lock()
            .runs
            .iter()
            .find(|r| r.run_id == run_id)
            .cloned())
    }

    async fn run_with_logs(&self, run_id: &str) -> Result<Option<RunWithLogs>, RepositoryError> {
        let tables = self.tables.lock();
        let Some(run) = tables.runs.iter().find(|r| r.run_id == run_id).cloned() else {
            return Ok(None);
        };
        let graph = tables.graphs.iter().find(|g| g.id == run.graph_id).cloned();
        let mut logs: Vec<ExecutionLogRecord> = tables
            .logs
            .iter()
            .filter(|l| l.run_id == run_id)
            .cloned()
            .collect();
        logs.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then(a.id.cmp(&b.id)));
        Ok(Some(RunWithLogs { run, graph, logs }))
    }

    async fn list_runs(&self, filter: &RunFilter) -> Result<Vec<RunRecord>, RepositoryError> {
        let tables = self.tables.lock();
        let mut runs: Vec<RunRecord> = tables
            .runs
            .iter()
            .filter(|r| filter.graph_id.is_none_or(|id| r.graph_id == id))
            .filter(|r| filter.status.is_none_or(|s| r.status == s))
            .cloned()
            .collect();
        runs.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(runs
            .into_iter()
            .skip(filter.skip as usize)
            .take(filter.effective_limit() as usize)
            .collect())
    }

    async fn update_run_status(
        &self,
        run_id: &str,
        status: RunStatus,
        error_message: Option<&str>,
    ) -> Result<(), RepositoryError> {
        let mut tables = self.tables.lock();
        let run = tables
            .runs
            .iter_mut()
            .find(|r| r.run_id == run_id)
            .ok_or_else(|| RepositoryError::RunNotFound {
                run_id: run_id.to_string(),
            })?;

        if run.status.is_terminal() {
            tracing::warn!(run_id, current = %run.status, requested = %status,
                "ignoring status transition on terminal run");
            return Ok(());
        }

        run.status = status;
        let now = Utc::now();
        if status == RunStatus::Running && run.started_at.is_none() {
            run.started_at = Some(now);
        }
        if status.is_terminal() && run.completed_at.is_none() {
            run.completed_at = Some(now);
        }
        if let Some(message) = error_message {
            run.error_message = Some(message.to_string());
        }
        Ok(())
    }

    async fn update_current_state(
        &self,
        run_id: &str,
        state: &Value,
    ) -> Result<(), RepositoryError> {
        let mut tables = self.tables.lock();
        let run = tables
            .runs
            .iter_mut()
            .find(|r| r.run_id == run_id)
            .ok_or_else(|| RepositoryError::RunNotFound {
                run_id: run_id.to_string(),
            })?;
        if !run.status.is_terminal() {
            run.current_state = Some(state.clone());
        }
        Ok(())
    }

    async fn update_final_state(
        &self,
        run_id: &str,
        final_state: &Value,
        total_iterations: u32,
        total_execution_time_ms: u64,
    ) -> Result<(), RepositoryError> {
        let mut tables = self.tables.lock();
        let run = tables
            .runs
            .iter_mut()
            .find(|r| r.run_id == run_id)
            .ok_or_else(|| RepositoryError::RunNotFound {
                run_id: run_id.to_string(),
            })?;
        if run.status.is_terminal() {
            tracing::warn!(run_id, "ignoring final-state write on terminal run");
            return Ok(());
        }
        run.final_state = Some(final_state.clone());
        run.current_state = Some(final_state.clone());
        run.total_iterations = Some(total_iterations);
        run.total_execution_time_ms = Some(total_execution_time_ms);
        Ok(())
    }

    async fn append_log(&self, entry: NewLogEntry) -> Result<(), RepositoryError> {
        let mut tables = self.tables.lock();
        if !tables.runs.iter().any(|r| r.run_id == entry.run_id) {
            return Err(RepositoryError::RunNotFound {
                run_id: entry.run_id,
            });
        }
        tables.next_log_id += 1;
        let record = ExecutionLogRecord {
            id: tables.next_log_id,
            run_id: entry.run_id,
            node_name: entry.node_name,
            status: entry.status,
            iteration: entry.iteration,
            execution_time_ms: entry.execution_time_ms,
            timestamp: Utc::now(),
            error_message: entry.error_message,
        };
        tables.logs.push(record);
        Ok(())
    }

    async fn logs_for_run(
        &self,
        run_id: &str,
    ) -> Result<Vec<ExecutionLogRecord>, RepositoryError> {
        let tables = self.tables.lock();
        let mut logs: Vec<ExecutionLogRecord> = tables
            .logs
            .iter()
            .filter(|l| l.run_id == run_id)
            .cloned()
            .collect();
        logs.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then(a.id.cmp(&b.id)));
        Ok(logs)
    }

    async fn stats_summary(&self) -> Result<StatsSummary, RepositoryError> {
        let tables = self.tables.lock();
        let mut summary = StatsSummary {
            total_graphs: tables.graphs.len() as u64,
            active_graphs: tables.graphs.iter().filter(|g| g.is_active).count() as u64,
            total_runs: tables.runs.len() as u64,
            ..Default::default()
        };
        let mut duration_sum = 0u64;
        let mut duration_count = 0u64;
        let mut iteration_sum = 0u64;
        let mut iteration_count = 0u64;
        for run in &tables.runs {
            match run.status {
                RunStatus::Pending | RunStatus::Running => summary.in_flight_runs += 1,
                RunStatus::Completed => summary.completed_runs += 1,
                RunStatus::Failed => summary.failed_runs += 1,
                RunStatus::Cancelled => summary.cancelled_runs += 1,
            }
            if let Some(ms) = run.total_execution_time_ms {
                duration_sum += ms;
                duration_count += 1;
            }
            if let Some(iterations) = run.total_iterations {
                iteration_sum += u64::from(iterations);
                iteration_count += 1;
            }
        }
        if duration_count > 0 {
            summary.avg_execution_time_ms = Some(duration_sum as f64 / duration_count as f64);
        }
        if iteration_count > 0 {
            summary.avg_iterations = Some(iteration_sum as f64 / iteration_count as f64);
        }
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graphs::{EdgeDefinition, NodeDefinition};
    use serde_json::json;

    fn definition(name: &str) -> GraphDefinition {
        GraphDefinition {
            name: name.to_string(),
            description: None,
            nodes: vec![
                NodeDefinition {
                    name: "a".into(),
                    tool: "echo".into(),
                },
                NodeDefinition {
                    name: "b".into(),
                    tool: "echo".into(),
                },
            ],
            edges: vec![EdgeDefinition {
                from_node: "a".into(),
                to_node: "b".into(),
                condition: None,
            }],
            entry_point: "a".into(),
        }
    }

    #[tokio::test]
    async fn graph_crud_round_trip() {
        let repo = MemoryRepository::new();
        let created = repo.create_graph(&definition("wf")).await.unwrap();
        assert!(created.is_active);
        assert_eq!(created.entry_point, "a");

        assert!(repo.graph_by_id(created.id).await.unwrap().is_some());
        assert!(repo.graph_by_name("wf").await.unwrap().is_some());
        assert!(repo.graph_by_name("nope").await.unwrap().is_none());

        assert!(matches!(
            repo.create_graph(&definition("wf")).await.unwrap_err(),
            RepositoryError::DuplicateGraphName { name } if name == "wf"
        ));
    }

    #[tokio::test]
    async fn soft_delete_hides_from_active_listing() {
        let repo = MemoryRepository::new();
        let created = repo.create_graph(&definition("wf")).await.unwrap();
        assert!(repo.soft_delete_graph(created.id).await.unwrap());
        assert!(!repo.soft_delete_graph(9999).await.unwrap());

        assert!(repo.list_graphs(0, 10, true).await.unwrap().is_empty());
        assert_eq!(repo.list_graphs(0, 10, false).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn run_lifecycle_stamps_timestamps_once() {
        let repo = MemoryRepository::new();
        let graph = repo.create_graph(&definition("wf")).await.unwrap();
        let run = repo
            .create_run("run_1", graph.id, &json!({"data": {}}))
            .await
            .unwrap();
        assert_eq!(run.status, RunStatus::Pending);
        assert!(run.started_at.is_none());

        repo.update_run_status("run_1", RunStatus::Running, None)
            .await
            .unwrap();
        let started = repo
            .run_by_run_id("run_1")
            .await
            .unwrap()
            .unwrap()
            .started_at
            .unwrap();

        // Re-applying running does not move started_at.
        repo.update_run_status("run_1", RunStatus::Running, None)
            .await
            .unwrap();
        let run = repo.run_by_run_id("run_1").await.unwrap().unwrap();
        assert_eq!(run.started_at, Some(started));

        repo.update_final_state("run_1", &json!({"done": true}), 2, 40)
            .await
            .unwrap();
        repo.update_run_status("run_1", RunStatus::Completed, None)
            .await
            .unwrap();

        let run = repo.run_by_run_id("run_1").await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        assert!(run.completed_at.is_some());
        assert!(run.started_at.unwrap() <= run.completed_at.unwrap());
        assert_eq!(run.total_iterations, Some(2));
    }

    #[tokio::test]
    async fn terminal_runs_are_immutable() {
        let repo = MemoryRepository::new();
        let graph = repo.create_graph(&definition("wf")).await.unwrap();
        repo.create_run("run_1", graph.id, &json!({})).await.unwrap();
        repo.update_run_status("run_1", RunStatus::Failed, Some("boom"))
            .await
            .unwrap();

        repo.update_run_status("run_1", RunStatus::Completed, None)
            .await
            .unwrap();
        repo.update_final_state("run_1", &json!({"late": true}), 9, 9)
            .await
            .unwrap();
        repo.update_current_state("run_1", &json!({"late": true}))
            .await
            .unwrap();

        let run = repo.run_by_run_id("run_1").await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.error_message.as_deref(), Some("boom"));
        assert!(run.final_state.is_none());
        assert!(run.current_state.is_none());
    }

    #[tokio::test]
    async fn logs_preserve_insertion_order() {
        let repo = MemoryRepository::new();
        let graph = repo.create_graph(&definition("wf")).await.unwrap();
        repo.create_run("run_1", graph.id, &json!({})).await.unwrap();

        repo.append_log(NewLogEntry::started("run_1", "a", 0))
            .await
            .unwrap();
        repo.append_log(NewLogEntry::completed("run_1", "a", 0, 5))
            .await
            .unwrap();
        repo.append_log(NewLogEntry::started("run_1", "b", 1))
            .await
            .unwrap();
        repo.append_log(NewLogEntry::failed("run_1", "b", 1, 2, "boom"))
            .await
            .unwrap();

        let logs = repo.logs_for_run("run_1").await.unwrap();
        let names: Vec<&str> = logs.iter().map(|l| l.node_name.as_str()).collect();
        assert_eq!(names, vec!["a", "a", "b", "b"]);
        assert_eq!(logs[3].error_message.as_deref(), Some("boom"));

        let err = repo
            .append_log(NewLogEntry::started("ghost", "a", 0))
            .await
            .unwrap_err();
        assert!(matches!(err, RepositoryError::RunNotFound { .. }));
    }

    #[tokio::test]
    async fn run_with_logs_eager_loads() {
        let repo = MemoryRepository::new();
        let graph = repo.create_graph(&definition("wf")).await.unwrap();
        repo.create_run("run_1", graph.id, &json!({})).await.unwrap();
        repo.append_log(NewLogEntry::started("run_1", "a", 0))
            .await
            .unwrap();

        let loaded = repo.run_with_logs("run_1").await.unwrap().unwrap();
        assert_eq!(loaded.run.run_id, "run_1");
        assert_eq!(loaded.graph.unwrap().name, "wf");
        assert_eq!(loaded.logs.len(), 1);

        assert!(repo.run_with_logs("ghost").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn list_runs_filters_and_paginates() {
        let repo = MemoryRepository::new();
        let graph = repo.create_graph(&definition("wf")).await.unwrap();
        for i in 0..5 {
            repo.create_run(&format!("run_{i}"), graph.id, &json!({}))
                .await
                .unwrap();
        }
        repo.update_run_status("run_0", RunStatus::Running, None)
            .await
            .unwrap();

        let all = repo.list_runs(&RunFilter::default()).await.unwrap();
        assert_eq!(all.len(), 5);

        let running = repo
            .list_runs(&RunFilter {
                status: Some(RunStatus::Running),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].run_id, "run_0");

        let page = repo
            .list_runs(&RunFilter {
                skip: 1,
                limit: 2,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(page.len(), 2);
    }

    #[tokio::test]
    async fn stats_summary_aggregates() {
        let repo = MemoryRepository::new();
        let graph = repo.create_graph(&definition("wf")).await.unwrap();
        repo.create_run("run_a", graph.id, &json!({})).await.unwrap();
        repo.create_run("run_b", graph.id, &json!({})).await.unwrap();

        repo.update_final_state("run_a", &json!({}), 4, 100)
            .await
            .unwrap();
        repo.update_run_status("run_a", RunStatus::Completed, None)
            .await
            .unwrap();
        repo.update_run_status("run_b", RunStatus::Failed, Some("x"))
            .await
            .unwrap();

        let stats = repo.stats_summary().await.unwrap();
        assert_eq!(stats.total_graphs, 1);
        assert_eq!(stats.total_runs, 2);
        assert_eq!(stats.completed_runs, 1);
        assert_eq!(stats.failed_runs, 1);
        assert_eq!(stats.avg_execution_time_ms, Some(100.0));
        assert_eq!(stats.avg_iterations, Some(4.0));
    }
}
