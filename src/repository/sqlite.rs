//! SQLite-backed repository.
//!
//! Durable single-file persistence for graphs, runs, and execution logs.
//! The schema is applied idempotently on connect, so a fresh database file
//! is usable immediately; production deployments that manage migrations
//! externally get a no-op.
//!
//! Layout:
//!
//! - `graphs(id, name UNIQUE, description, definition JSON, entry_point,
//!   version, is_active, created_at, updated_at)`
//! - `runs(id, run_id UNIQUE, graph_id FK, status, initial_state JSON,
//!   current_state JSON?, final_state JSON?, started_at?, completed_at?,
//!   total_iterations?, total_execution_time_ms?, error_message?,
//!   created_at)` with composite indexes on `(status, created_at)` and
//!   `(graph_id, status)`
//! - `execution_logs(id, run_id FK CASCADE, node_name, status, iteration,
//!   execution_time_ms?, timestamp, error_message?)` with an index on
//!   `(run_id, timestamp)`
//!
//! Timestamps are stored as RFC3339 text; JSON columns hold compact
//! `serde_json` output. Terminal-run immutability is enforced in the UPDATE
//! statements themselves (`WHERE status NOT IN (...)`), so concurrent
//! writers cannot resurrect a finished run.

use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use tracing::instrument;

use crate::graphs::GraphDefinition;
use crate::repository::records::{
    ExecutionLogRecord, GraphRecord, NewLogEntry, RunFilter, RunRecord, RunWithLogs, StatsSummary,
};
use crate::repository::{Repository, RepositoryError};
use crate::types::{NodeStatus, RunStatus};

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS graphs (
        id          INTEGER PRIMARY KEY AUTOINCREMENT,
        name        TEXT NOT NULL UNIQUE,
        description TEXT,
        definition  TEXT NOT NULL,
        entry_point TEXT NOT NULL,
        version     INTEGER NOT NULL DEFAULT 1,
        is_active   INTEGER NOT NULL DEFAULT 1,
        created_at  TEXT NOT NULL,
        updated_at  TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS runs (
        id                      INTEGER PRIMARY KEY AUTOINCREMENT,
        run_id                  TEXT NOT NULL UNIQUE,
        graph_id                INTEGER NOT NULL REFERENCES graphs(id),
        status                  TEXT NOT NULL,
        initial_state           TEXT NOT NULL,
        current_state           TEXT,
        final_state             TEXT,
        started_at              TEXT,
        completed_at            TEXT,
        total_iterations        INTEGER,
        total_execution_time_ms INTEGER,
        error_message           TEXT,
        created_at              TEXT NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_runs_status_created ON runs(status, created_at)",
    "CREATE INDEX IF NOT EXISTS idx_runs_graph_status ON runs(graph_id, status)",
    r#"
    CREATE TABLE IF NOT EXISTS execution_logs (
        id                INTEGER PRIMARY KEY AUTOINCREMENT,
        run_id            TEXT NOT NULL REFERENCES runs(run_id) ON DELETE CASCADE,
        node_name         TEXT NOT NULL,
        status            TEXT NOT NULL,
        iteration         INTEGER NOT NULL,
        execution_time_ms INTEGER,
        timestamp         TEXT NOT NULL,
        error_message     TEXT
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_logs_run_timestamp ON execution_logs(run_id, timestamp)",
];

const TERMINAL_STATUSES: &str = "('completed', 'failed', 'cancelled')";

/// SQLite [`Repository`] implementation.
pub struct SqliteRepository {
    pool: Arc<SqlitePool>,
}

impl std::fmt::Debug for SqliteRepository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteRepository").finish()
    }
}

impl SqliteRepository {
    /// Connect to (or create) the database at `database_url` and apply the
    /// schema. Example URL: `sqlite://workflow.db`.
    #[instrument(skip(database_url))]
    pub async fn connect(database_url: &str) -> Result<Self, RepositoryError> {
        let options = SqliteConnectOptions::from_str(database_url)
            .map_err(|e| RepositoryError::backend(format!("invalid database url: {e}")))?
            .create_if_missing(true)
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(|e| RepositoryError::backend(format!("connect error: {e}")))?;

        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&pool)
                .await
                .map_err(|e| RepositoryError::backend(format!("schema setup: {e}")))?;
        }

        Ok(Self {
            pool: Arc::new(pool),
        })
    }

    fn encode_json(value: &impl serde::Serialize) -> Result<String, RepositoryError> {
        serde_json::to_string(value)
            .map_err(|e| RepositoryError::backend(format!("json encode: {e}")))
    }

    fn decode_timestamp(raw: &str) -> Result<DateTime<Utc>, RepositoryError> {
        DateTime::parse_from_rfc3339(raw)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| RepositoryError::corrupt(format!("bad timestamp '{raw}': {e}")))
    }

    fn decode_opt_timestamp(raw: Option<String>) -> Result<Option<DateTime<Utc>>, RepositoryError> {
        raw.as_deref().map(Self::decode_timestamp).transpose()
    }

    fn decode_json(raw: &str, what: &str) -> Result<Value, RepositoryError> {
        serde_json::from_str(raw)
            .map_err(|e| RepositoryError::corrupt(format!("bad {what} json: {e}")))
    }

    fn decode_graph_row(row: &SqliteRow) -> Result<GraphRecord, RepositoryError> {
        let definition_raw: String = row.get("definition");
        let definition: GraphDefinition = serde_json::from_str(&definition_raw)
            .map_err(|e| RepositoryError::corrupt(format!("bad graph definition: {e}")))?;
        let created_at: String = row.get("created_at");
        let updated_at: String = row.get("updated_at");
        Ok(GraphRecord {
            id: row.get("id"),
            name: row.get("name"),
            description: row.get("description"),
            definition,
            entry_point: row.get("entry_point"),
            version: row.get("version"),
            is_active: row.get::<i64, _>("is_active") != 0,
            created_at: Self::decode_timestamp(&created_at)?,
            updated_at: Self::decode_timestamp(&updated_at)?,
        })
    }

    fn decode_run_row(row: &SqliteRow) -> Result<RunRecord, RepositoryError> {
        let status_raw: String = row.get("status");
        let status = RunStatus::parse(&status_raw)
            .ok_or_else(|| RepositoryError::corrupt(format!("bad run status '{status_raw}'")))?;
        let initial_raw: String = row.get("initial_state");
        let current_raw: Option<String> = row.get("current_state");
        let final_raw: Option<String> = row.get("final_state");
        let created_at: String = row.get("created_at");
        Ok(RunRecord {
            id: row.get("id"),
            run_id: row.get("run_id"),
            graph_id: row.get("graph_id"),
            status,
            initial_state: Self::decode_json(&initial_raw, "initial_state")?,
            current_state: current_raw
                .as_deref()
                .map(|raw| Self::decode_json(raw, "current_state"))
                .transpose()?,
            final_state: final_raw
                .as_deref()
                .map(|raw| Self::decode_json(raw, "final_state"))
                .transpose()?,
            started_at: Self::decode_opt_timestamp(row.get("started_at"))?,
            completed_at: Self::decode_opt_timestamp(row.get("completed_at"))?,
            total_iterations: row
                .get::<Option<i64>, _>("total_iterations")
                .map(|v| v as u32),
            total_execution_time_ms: row
                .get::<Option<i64>, _>("total_execution_time_ms")
                .map(|v| v as u64),
            error_message: row.get("error_message"),
            created_at: Self::decode_timestamp(&created_at)?,
        })
    }

    fn decode_log_row(row: &SqliteRow) -> Result<ExecutionLogRecord, RepositoryError> {
        let status_raw: String = row.get("status");
        let status = NodeStatus::parse(&status_raw)
            .ok_or_else(|| RepositoryError::corrupt(format!("bad log status '{status_raw}'")))?;
        let timestamp: String = row.get("timestamp");
        Ok(ExecutionLogRecord {
            id: row.get("id"),
            run_id: row.get("run_id"),
            node_name: row.get("node_name"),
            status,
            iteration: row.get::<i64, _>("iteration") as u32,
            execution_time_ms: row
                .get::<Option<i64>, _>("execution_time_ms")
                .map(|v| v as u64),
            timestamp: Self::decode_timestamp(&timestamp)?,
            error_message: row.get("error_message"),
        })
    }

    async fn run_exists(&self, run_id: &str) -> Result<bool, RepositoryError> {
        let row = sqlx::query("SELECT 1 FROM runs WHERE run_id = ?1")
            .bind(run_id)
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| RepositoryError::backend(format!("run lookup: {e}")))?;
        Ok(row.is_some())
    }

    /// Zero affected rows means either a missing run (an error) or a
    /// terminal run (transition silently ignored).
    async fn check_update(&self, run_id: &str, affected: u64) -> Result<(), RepositoryError> {
        if affected > 0 {
            return Ok(());
        }
        if self.run_exists(run_id).await? {
            tracing::warn!(run_id, "ignoring update on terminal run");
            Ok(())
        } else {
            Err(RepositoryError::RunNotFound {
                run_id: run_id.to_string(),
            })
        }
    }
}

#[async_trait]
impl Repository for SqliteRepository {
    #[instrument(skip(self, definition), err)]
    async fn create_graph(
        &self,
        definition: &GraphDefinition,
    ) -> Result<GraphRecord, RepositoryError> {
        let now = Utc::now().to_rfc3339();
        let definition_json = Self::encode_json(definition)?;
        let result = sqlx::query(
            r#"
            INSERT INTO graphs (name, description, definition, entry_point, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?5)
            "#,
        )
        .bind(&definition.name)
        .bind(&definition.description)
        .bind(&definition_json)
        .bind(&definition.entry_point)
        .bind(&now)
        .execute(&*self.pool)
        .await;

        match result {
            Ok(done) => {
                let id = done.last_insert_rowid();
                self.graph_by_id(id).await?.ok_or_else(|| {
                    RepositoryError::backend("graph row vanished after insert".to_string())
                })
            }
            Err(e) => {
                let unique = e
                    .as_database_error()
                    .is_some_and(|db| db.is_unique_violation());
                if unique {
                    Err(RepositoryError::DuplicateGraphName {
                        name: definition.name.clone(),
                    })
                } else {
                    Err(RepositoryError::backend(format!("insert graph: {e}")))
                }
            }
        }
    }

    async fn graph_by_id(&self, id: i64) -> Result<Option<GraphRecord>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM graphs WHERE id = ?1")
            .bind(id)
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| RepositoryError::backend(format!("select graph: {e}")))?;
        row.as_ref().map(Self::decode_graph_row).transpose()
    }

    async fn graph_by_name(&self, name: &str) -> Result<Option<GraphRecord>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM graphs WHERE name = ?1")
            .bind(name)
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| RepositoryError::backend(format!("select graph: {e}")))?;
        row.as_ref().map(Self::decode_graph_row).transpose()
    }

    async fn list_graphs(
        &self,
        skip: u32,
        limit: u32,
        active_only: bool,
    ) -> Result<Vec<GraphRecord>, RepositoryError> {
        let limit = if limit == 0 { 100 } else { limit.min(1000) };
        let sql = if active_only {
            "SELECT * FROM graphs WHERE is_active = 1 ORDER BY created_at DESC, id DESC LIMIT ?1 OFFSET ?2"
        } else {
            "SELECT * FROM graphs ORDER BY created_at DESC, id DESC LIMIT ?1 OFFSET ?2"
        };
        let rows = sqlx::query(sql)
            .bind(i64::from(limit))
            .bind(i64::from(skip))
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| RepositoryError::backend(format!("list graphs: {e}")))?;
        rows.iter().map(Self::decode_graph_row).collect()
    }

    async fn soft_delete_graph(&self, id: i64) -> Result<bool, RepositoryError> {
        let done = sqlx::query("UPDATE graphs SET is_active = 0, updated_at = ?2 WHERE id = ?1")
            .bind(id)
            .bind(Utc::now().to_rfc3339())
            .execute(&*self.pool)
            .await
            .map_err(|e| RepositoryError::backend(format!("soft delete graph: {e}")))?;
        Ok(done.rows_affected() > 0)
    }

    #[instrument(skip(self, initial_state), err)]
    async fn create_run(
        &self,
        run_id: &str,
        graph_id: i64,
        initial_state: &Value,
    ) -> Result<RunRecord, RepositoryError> {
        let now = Utc::now().to_rfc3339();
        let initial_json = Self::encode_json(initial_state)?;
        sqlx::query(
            r#"
            INSERT INTO runs (run_id, graph_id, status, initial_state, created_at)
            VALUES (?1, ?2, 'pending', ?3, ?4)
            "#,
        )
        .bind(run_id)
        .bind(graph_id)
        .bind(&initial_json)
        .bind(&now)
        .execute(&*self.pool)
        .await
        .map_err(|e| RepositoryError::backend(format!("insert run: {e}")))?;

        self.run_by_run_id(run_id).await?.ok_or_else(|| {
            RepositoryError::backend("run row vanished after insert".to_string())
        })
    }

    async fn run_by_run_id(&self, run_id: &str) -> Result<Option<RunRecord>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM runs WHERE run_id = ?1")
            .bind(run_id)
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| RepositoryError::backend(format!("select run: {e}")))?;
        row.as_ref().map(Self::decode_run_row).transpose()
    }

    async fn run_with_logs(&self, run_id: &str) -> Result<Option<RunWithLogs>, RepositoryError> {
        let Some(run) = self.run_by_run_id(run_id).await? else {
            return Ok(None);
        };
        let graph = self.graph_by_id(run.graph_id).await?;
        let logs = self.logs_for_run(run_id).await?;
        Ok(Some(RunWithLogs { run, graph, logs }))
    }

    async fn list_runs(&self, filter: &RunFilter) -> Result<Vec<RunRecord>, RepositoryError> {
        // Both optional filters collapse into bindable expressions, keeping
        // the statement count at one.
        let rows = sqlx::query(
            r#"
            SELECT * FROM runs
            WHERE (?1 IS NULL OR graph_id = ?1)
              AND (?2 IS NULL OR status = ?2)
            ORDER BY created_at DESC, id DESC
            LIMIT ?3 OFFSET ?4
            "#,
        )
        .bind(filter.graph_id)
        .bind(filter.status.map(|s| s.as_str()))
        .bind(i64::from(filter.effective_limit()))
        .bind(i64::from(filter.skip))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| RepositoryError::backend(format!("list runs: {e}")))?;
        rows.iter().map(Self::decode_run_row).collect()
    }

    #[instrument(skip(self), err)]
    async fn update_run_status(
        &self,
        run_id: &str,
        status: RunStatus,
        error_message: Option<&str>,
    ) -> Result<(), RepositoryError> {
        let now = Utc::now().to_rfc3339();
        let sql = format!(
            r#"
            UPDATE runs SET
                status = ?2,
                started_at = CASE WHEN ?2 = 'running'
                    THEN COALESCE(started_at, ?3) ELSE started_at END,
                completed_at = CASE WHEN ?2 IN {TERMINAL_STATUSES}
                    THEN COALESCE(completed_at, ?3) ELSE completed_at END,
                error_message = COALESCE(?4, error_message)
            WHERE run_id = ?1 AND status NOT IN {TERMINAL_STATUSES}
            "#
        );
        let done = sqlx::query(&sql)
            .bind(run_id)
            .bind(status.as_str())
            .bind(&now)
            .bind(error_message)
            .execute(&*self.pool)
            .await
            .map_err(|e| RepositoryError::backend(format!("update run status: {e}")))?;
        self.check_update(run_id, done.rows_affected()).await
    }

    async fn update_current_state(
        &self,
        run_id: &str,
        state: &Value,
    ) -> Result<(), RepositoryError> {
        let state_json = Self::encode_json(state)?;
        let sql = format!(
            "UPDATE runs SET current_state = ?2 WHERE run_id = ?1 AND status NOT IN {TERMINAL_STATUSES}"
        );
        let done = sqlx::query(&sql)
            .bind(run_id)
            .bind(&state_json)
            .execute(&*self.pool)
            .await
            .map_err(|e| RepositoryError::backend(format!("update current state: {e}")))?;
        self.check_update(run_id, done.rows_affected()).await
    }

    #[instrument(skip(self, final_state), err)]
    async fn update_final_state(
        &self,
        run_id: &str,
        final_state: &Value,
        total_iterations: u32,
        total_execution_time_ms: u64,
    ) -> Result<(), RepositoryError> {
        let state_json = Self::encode_json(final_state)?;
        let sql = format!(
            r#"
            UPDATE runs SET
                final_state = ?2,
                current_state = ?2,
                total_iterations = ?3,
                total_execution_time_ms = ?4
            WHERE run_id = ?1 AND status NOT IN {TERMINAL_STATUSES}
            "#
        );
        let done = sqlx::query(&sql)
            .bind(run_id)
            .bind(&state_json)
            .bind(i64::from(total_iterations))
            .bind(total_execution_time_ms as i64)
            .execute(&*self.pool)
            .await
            .map_err(|e| RepositoryError::backend(format!("update final state: {e}")))?;
        self.check_update(run_id, done.rows_affected()).await
    }

    async fn append_log(&self, entry: NewLogEntry) -> Result<(), RepositoryError> {
        let result = sqlx::query(
            r#"
            INSERT INTO execution_logs
                (run_id, node_name, status, iteration, execution_time_ms, timestamp, error_message)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
        )
        .bind(&entry.run_id)
        .bind(&entry.node_name)
        .bind(entry.status.as_str())
        .bind(i64::from(entry.iteration))
        .bind(entry.execution_time_ms.map(|v| v as i64))
        .bind(Utc::now().to_rfc3339())
        .bind(&entry.error_message)
        .execute(&*self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) => {
                let foreign_key = e
                    .as_database_error()
                    .is_some_and(|db| db.is_foreign_key_violation());
                if foreign_key {
                    Err(RepositoryError::RunNotFound {
                        run_id: entry.run_id,
                    })
                } else {
                    Err(RepositoryError::backend(format!("insert log: {e}")))
                }
            }
        }
    }

    async fn logs_for_run(
        &self,
        run_id: &str,
    ) -> Result<Vec<ExecutionLogRecord>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT * FROM execution_logs WHERE run_id = ?1 ORDER BY timestamp, id",
        )
        .bind(run_id)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| RepositoryError::backend(format!("select logs: {e}")))?;
        rows.iter().map(Self::decode_log_row).collect()
    }

    async fn stats_summary(&self) -> Result<StatsSummary, RepositoryError> {
        let graph_row = sqlx::query(
            "SELECT COUNT(*) AS total, COALESCE(SUM(is_active), 0) AS active FROM graphs",
        )
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| RepositoryError::backend(format!("graph stats: {e}")))?;

        let run_row = sqlx::query(
            r#"
            SELECT
                COUNT(*) AS total,
                COALESCE(SUM(status IN ('pending', 'running')), 0) AS in_flight,
                COALESCE(SUM(status = 'completed'), 0) AS completed,
                COALESCE(SUM(status = 'failed'), 0) AS failed,
                COALESCE(SUM(status = 'cancelled'), 0) AS cancelled,
                AVG(total_execution_time_ms) AS avg_ms,
                AVG(total_iterations) AS avg_iterations
            FROM runs
            "#,
        )
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| RepositoryError::backend(format!("run stats: {e}")))?;

        Ok(StatsSummary {
            total_graphs: graph_row.get::<i64, _>("total") as u64,
            active_graphs: graph_row.get::<i64, _>("active") as u64,
            total_runs: run_row.get::<i64, _>("total") as u64,
            in_flight_runs: run_row.get::<i64, _>("in_flight") as u64,
            completed_runs: run_row.get::<i64, _>("completed") as u64,
            failed_runs: run_row.get::<i64, _>("failed") as u64,
            cancelled_runs: run_row.get::<i64, _>("cancelled") as u64,
            avg_execution_time_ms: run_row.get::<Option<f64>, _>("avg_ms"),
            avg_iterations: run_row.get::<Option<f64>, _>("avg_iterations"),
        })
    }
}
