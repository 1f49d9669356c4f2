//! Conductor-Orchestrator: Persistence
//!
//! Small async store traits per subsystem plus the SQLite implementation
//! backing all of them. Idempotent writes and reads are wrapped in bounded
//! retry with exponential backoff; the in-memory state stays authoritative
//! and a failed write-through (other than the enqueue upsert) logs without
//! failing the operation.

use crate::assignment::TaskAssignment;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use conductor_arbiter::ArbitrationSession;
use conductor_core::{retry, RetryConfig, Task, TaskState, TaskStatus};
use conductor_routing::{AgentLoad, AgentProfile, AgentStore, ModelFamily, PerformanceHistory, StoreError};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use std::str::FromStr;

/// Persistence errors.
#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("corrupt row: {reason}")]
    CorruptRow { reason: String },
}

impl conductor_core::Classify for PersistenceError {
    fn kind(&self) -> conductor_core::ErrorKind {
        match self {
            Self::Database(_) => conductor_core::ErrorKind::Transient,
            Self::CorruptRow { .. } => conductor_core::ErrorKind::PartialData,
        }
    }
}

/// Queue persistence contract (write-through + startup replay).
#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Upsert the full task row.
    async fn upsert_task(&self, state: &TaskState) -> Result<(), PersistenceError>;
    /// Set the status column and bump `updated_at`.
    async fn update_task_status(
        &self,
        task_id: &str,
        status: TaskStatus,
        error: Option<&str>,
    ) -> Result<(), PersistenceError>;
    /// Rows with `status = 'queued'`, `(priority DESC, created_at ASC)`.
    async fn load_queued(&self) -> Result<Vec<TaskState>, PersistenceError>;
}

/// Assignment persistence contract.
#[async_trait]
pub trait AssignmentStore: Send + Sync {
    /// Upsert the full assignment row.
    async fn upsert_assignment(&self, assignment: &TaskAssignment) -> Result<(), PersistenceError>;
}

/// Arbitration persistence contract.
#[async_trait]
pub trait ArbitrationStore: Send + Sync {
    /// Upsert the session row.
    async fn upsert_session(&self, session: &ArbitrationSession) -> Result<(), PersistenceError>;
    /// Crash recovery: force every non-terminal session row to FAILED.
    async fn mark_non_terminal_failed(&self, reason: &str) -> Result<u64, PersistenceError>;
}

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS agents (
        agent_id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        model_family TEXT NOT NULL,
        capabilities_json TEXT NOT NULL,
        perf_success_rate REAL NOT NULL,
        perf_avg_quality REAL NOT NULL,
        perf_avg_latency REAL NOT NULL,
        perf_task_count INTEGER NOT NULL,
        load_active INTEGER NOT NULL,
        load_queued INTEGER NOT NULL,
        load_util_pct REAL NOT NULL,
        registered_at INTEGER NOT NULL,
        last_active_at INTEGER NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS task_queue (
        task_id TEXT PRIMARY KEY,
        task_type TEXT NOT NULL,
        description TEXT NOT NULL DEFAULT '',
        priority INTEGER NOT NULL,
        timeout_ms INTEGER NOT NULL,
        attempts INTEGER NOT NULL,
        max_attempts INTEGER NOT NULL,
        budget_max_files INTEGER,
        budget_max_loc INTEGER,
        required_capabilities_json TEXT,
        task_metadata_json TEXT,
        status TEXT NOT NULL,
        last_error TEXT,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_task_queue_status
        ON task_queue (status, priority DESC, created_at ASC)",
    "CREATE TABLE IF NOT EXISTS task_assignments (
        assignment_id TEXT PRIMARY KEY,
        task_id TEXT NOT NULL,
        agent_id TEXT NOT NULL,
        assigned_at INTEGER NOT NULL,
        deadline INTEGER NOT NULL,
        timeout_ms INTEGER NOT NULL,
        routing_confidence REAL NOT NULL,
        routing_strategy TEXT NOT NULL,
        routing_reason TEXT NOT NULL,
        status TEXT NOT NULL,
        acknowledged_at INTEGER,
        started_at INTEGER,
        completed_at INTEGER,
        progress REAL NOT NULL,
        error_message TEXT,
        error_code TEXT,
        metadata_json TEXT
    )",
    "CREATE TABLE IF NOT EXISTS arbitration_sessions (
        session_id TEXT PRIMARY KEY,
        violation_json TEXT NOT NULL,
        state TEXT NOT NULL,
        started_at INTEGER NOT NULL,
        ended_at INTEGER,
        metadata_json TEXT NOT NULL
    )",
];

fn to_ms(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

fn from_ms(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_else(Utc::now)
}

/// SQLite-backed store serving every subsystem.
pub struct SqliteStore {
    pool: SqlitePool,
    retry_config: RetryConfig,
}

impl SqliteStore {
    /// Open (or create) the database at `path` and run the schema DDL.
    /// Pass `":memory:"` for an ephemeral database.
    pub async fn connect(path: &str) -> Result<Self, PersistenceError> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        // An in-memory database exists per connection, so the pool must be
        // pinned to a single long-lived connection for ":memory:".
        let pool = if path == ":memory:" {
            SqlitePoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
                .connect_with(options)
                .await?
        } else {
            SqlitePoolOptions::new()
                .max_connections(5)
                .connect_with(options)
                .await?
        };

        for ddl in SCHEMA {
            sqlx::query(ddl).execute(&pool).await?;
        }
        tracing::info!(path, "sqlite store ready");

        Ok(Self {
            pool,
            retry_config: RetryConfig {
                max_attempts: 3,
                initial_delay_ms: 50,
                max_delay_ms: 1_000,
                ..RetryConfig::default()
            },
        })
    }

    async fn do_upsert_task(&self, state: &TaskState) -> Result<(), PersistenceError> {
        let task = &state.task;
        let required = task
            .required_capabilities
            .as_ref()
            .map(|c| serde_json::to_string(c).unwrap_or_default());
        let metadata = if task.metadata.is_null() {
            None
        } else {
            Some(task.metadata.to_string())
        };

        sqlx::query(
            "INSERT INTO task_queue (task_id, task_type, description, priority, timeout_ms,
                attempts, max_attempts, budget_max_files, budget_max_loc,
                required_capabilities_json, task_metadata_json, status, last_error,
                created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
             ON CONFLICT(task_id) DO UPDATE SET
                status = excluded.status,
                attempts = excluded.attempts,
                last_error = excluded.last_error,
                updated_at = excluded.updated_at",
        )
        .bind(&task.task_id)
        .bind(task.task_type.as_str())
        .bind(&task.description)
        .bind(task.priority as i64)
        .bind(task.timeout_ms as i64)
        .bind(state.attempts as i64)
        .bind(state.max_attempts as i64)
        .bind(task.budget.and_then(|b| b.max_files).map(|v| v as i64))
        .bind(task.budget.and_then(|b| b.max_loc).map(|v| v as i64))
        .bind(required)
        .bind(metadata)
        .bind(state.status.as_str())
        .bind(state.last_error.as_deref())
        .bind(to_ms(task.created_at))
        .bind(to_ms(state.updated_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    fn task_state_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<TaskState, PersistenceError> {
        let task_id: String = row.try_get("task_id")?;
        let task_type_raw: String = row.try_get("task_type")?;
        let task_type =
            conductor_core::TaskType::from_str(&task_type_raw).map_err(|reason| {
                PersistenceError::CorruptRow { reason }
            })?;
        let status_raw: String = row.try_get("status")?;
        let status = TaskStatus::from_str(&status_raw)
            .map_err(|reason| PersistenceError::CorruptRow { reason })?;

        let required: Option<String> = row.try_get("required_capabilities_json")?;
        let required_capabilities = required
            .as_deref()
            .and_then(|raw| serde_json::from_str(raw).ok());
        let metadata: Option<String> = row.try_get("task_metadata_json")?;
        let metadata = metadata
            .as_deref()
            .and_then(|raw| serde_json::from_str(raw).ok())
            .unwrap_or(serde_json::Value::Null);

        let max_files: Option<i64> = row.try_get("budget_max_files")?;
        let max_loc: Option<i64> = row.try_get("budget_max_loc")?;
        let budget = if max_files.is_some() || max_loc.is_some() {
            Some(conductor_core::Budget {
                max_files: max_files.map(|v| v as u32),
                max_loc: max_loc.map(|v| v as u32),
            })
        } else {
            None
        };

        let created_at = from_ms(row.try_get("created_at")?);
        let updated_at = from_ms(row.try_get("updated_at")?);

        let task = Task {
            task_id,
            task_type,
            description: row.try_get("description")?,
            priority: row.try_get::<i64, _>("priority")? as i32,
            timeout_ms: row.try_get::<i64, _>("timeout_ms")? as u64,
            max_attempts: row.try_get::<i64, _>("max_attempts")? as u32,
            required_capabilities,
            budget,
            created_at,
            metadata,
        };

        Ok(TaskState {
            status,
            attempts: row.try_get::<i64, _>("attempts")? as u32,
            max_attempts: task.max_attempts,
            routing_history: Vec::new(),
            last_error: row.try_get("last_error")?,
            enqueued_at: created_at,
            started_at: None,
            completed_at: None,
            updated_at,
            task,
        })
    }
}

#[async_trait]
impl QueueStore for SqliteStore {
    async fn upsert_task(&self, state: &TaskState) -> Result<(), PersistenceError> {
        retry(&self.retry_config, || self.do_upsert_task(state)).await
    }

    async fn update_task_status(
        &self,
        task_id: &str,
        status: TaskStatus,
        error: Option<&str>,
    ) -> Result<(), PersistenceError> {
        retry(&self.retry_config, || async {
            sqlx::query(
                "UPDATE task_queue SET status = ?2, last_error = ?3, updated_at = ?4
                 WHERE task_id = ?1",
            )
            .bind(task_id)
            .bind(status.as_str())
            .bind(error)
            .bind(to_ms(Utc::now()))
            .execute(&self.pool)
            .await?;
            Ok(())
        })
        .await
    }

    async fn load_queued(&self) -> Result<Vec<TaskState>, PersistenceError> {
        let rows = retry(&self.retry_config, || async {
            sqlx::query(
                "SELECT * FROM task_queue WHERE status = 'queued'
                 ORDER BY priority DESC, created_at ASC",
            )
            .fetch_all(&self.pool)
            .await
            .map_err(PersistenceError::from)
        })
        .await?;

        let mut states = Vec::with_capacity(rows.len());
        for row in &rows {
            match Self::task_state_from_row(row) {
                Ok(state) => states.push(state),
                Err(err) => {
                    // A corrupt row is skipped, not fatal.
                    tracing::warn!(error = %err, "skipping corrupt task row during replay");
                }
            }
        }
        Ok(states)
    }
}

#[async_trait]
impl AssignmentStore for SqliteStore {
    async fn upsert_assignment(&self, assignment: &TaskAssignment) -> Result<(), PersistenceError> {
        retry(&self.retry_config, || async {
            sqlx::query(
                "INSERT INTO task_assignments (assignment_id, task_id, agent_id, assigned_at,
                    deadline, timeout_ms, routing_confidence, routing_strategy, routing_reason,
                    status, acknowledged_at, started_at, completed_at, progress,
                    error_message, error_code, metadata_json)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)
                 ON CONFLICT(assignment_id) DO UPDATE SET
                    status = excluded.status,
                    acknowledged_at = excluded.acknowledged_at,
                    started_at = excluded.started_at,
                    completed_at = excluded.completed_at,
                    progress = excluded.progress,
                    error_message = excluded.error_message,
                    error_code = excluded.error_code,
                    metadata_json = excluded.metadata_json",
            )
            .bind(&assignment.id)
            .bind(&assignment.task.task_id)
            .bind(&assignment.agent_id)
            .bind(to_ms(assignment.assigned_at))
            .bind(to_ms(assignment.deadline))
            .bind(assignment.task.timeout_ms as i64)
            .bind(assignment.routing_decision.confidence)
            .bind(assignment.routing_decision.strategy.as_str())
            .bind(&assignment.routing_decision.reason)
            .bind(assignment.status.as_str())
            .bind(assignment.acknowledged_at.map(to_ms))
            .bind(assignment.started_at.map(to_ms))
            .bind(assignment.completed_at.map(to_ms))
            .bind(assignment.progress)
            .bind(assignment.error_message.as_deref())
            .bind(assignment.error_code.as_deref())
            .bind(assignment.metadata.to_string())
            .execute(&self.pool)
            .await?;
            Ok(())
        })
        .await
    }
}

#[async_trait]
impl ArbitrationStore for SqliteStore {
    async fn upsert_session(&self, session: &ArbitrationSession) -> Result<(), PersistenceError> {
        retry(&self.retry_config, || async {
            sqlx::query(
                "INSERT INTO arbitration_sessions (session_id, violation_json, state,
                    started_at, ended_at, metadata_json)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(session_id) DO UPDATE SET
                    state = excluded.state,
                    ended_at = excluded.ended_at,
                    metadata_json = excluded.metadata_json",
            )
            .bind(&session.session_id)
            .bind(serde_json::to_string(&session.violation).unwrap_or_default())
            .bind(session.state.as_str())
            .bind(to_ms(session.start_time))
            .bind(session.end_time.map(to_ms))
            .bind(session.metadata.to_string())
            .execute(&self.pool)
            .await?;
            Ok(())
        })
        .await
    }

    async fn mark_non_terminal_failed(&self, reason: &str) -> Result<u64, PersistenceError> {
        let result = sqlx::query(
            "UPDATE arbitration_sessions
             SET state = 'FAILED',
                 ended_at = ?1,
                 metadata_json = json_set(metadata_json, '$.failureReason', ?2)
             WHERE state NOT IN ('COMPLETED', 'FAILED')",
        )
        .bind(to_ms(Utc::now()))
        .bind(reason)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl AgentStore for SqliteStore {
    async fn load_agent(&self, agent_id: &str) -> Result<Option<AgentProfile>, StoreError> {
        let row = sqlx::query("SELECT * FROM agents WHERE agent_id = ?1")
            .bind(agent_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError(e.to_string()))?;

        let Some(row) = row else {
            return Ok(None);
        };
        agent_from_row(&row).map(Some)
    }

    async fn save_agent(&self, profile: &AgentProfile) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO agents (agent_id, name, model_family, capabilities_json,
                perf_success_rate, perf_avg_quality, perf_avg_latency, perf_task_count,
                load_active, load_queued, load_util_pct, registered_at, last_active_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
             ON CONFLICT(agent_id) DO UPDATE SET
                name = excluded.name,
                capabilities_json = excluded.capabilities_json,
                perf_success_rate = excluded.perf_success_rate,
                perf_avg_quality = excluded.perf_avg_quality,
                perf_avg_latency = excluded.perf_avg_latency,
                perf_task_count = excluded.perf_task_count,
                load_active = excluded.load_active,
                load_queued = excluded.load_queued,
                load_util_pct = excluded.load_util_pct,
                last_active_at = excluded.last_active_at",
        )
        .bind(&profile.agent_id)
        .bind(&profile.name)
        .bind(profile.model_family.as_str())
        .bind(serde_json::to_string(&profile.capabilities).unwrap_or_default())
        .bind(profile.performance.success_rate)
        .bind(profile.performance.average_quality)
        .bind(profile.performance.average_latency_ms)
        .bind(profile.performance.task_count as i64)
        .bind(profile.load.active_tasks as i64)
        .bind(profile.load.queued_tasks as i64)
        .bind(profile.load.utilization_percent)
        .bind(to_ms(profile.registered_at))
        .bind(to_ms(profile.last_active_at))
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError(e.to_string()))?;
        Ok(())
    }

    async fn delete_agent(&self, agent_id: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM agents WHERE agent_id = ?1")
            .bind(agent_id)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError(e.to_string()))?;
        Ok(())
    }

    async fn load_all_agents(&self) -> Result<Vec<AgentProfile>, StoreError> {
        let rows = sqlx::query("SELECT * FROM agents")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StoreError(e.to_string()))?;

        let mut profiles = Vec::with_capacity(rows.len());
        for row in &rows {
            match agent_from_row(row) {
                Ok(profile) => profiles.push(profile),
                Err(err) => tracing::warn!(error = %err, "skipping corrupt agent row"),
            }
        }
        Ok(profiles)
    }
}

fn agent_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<AgentProfile, StoreError> {
    let model_family_raw: String = row
        .try_get("model_family")
        .map_err(|e| StoreError(e.to_string()))?;
    let model_family = ModelFamily::from_str(&model_family_raw).map_err(StoreError)?;
    let capabilities_raw: String = row
        .try_get("capabilities_json")
        .map_err(|e| StoreError(e.to_string()))?;
    let capabilities =
        serde_json::from_str(&capabilities_raw).map_err(|e| StoreError(e.to_string()))?;

    let get_i64 = |name: &str| -> Result<i64, StoreError> {
        row.try_get::<i64, _>(name).map_err(|e| StoreError(e.to_string()))
    };
    let get_f64 = |name: &str| -> Result<f64, StoreError> {
        row.try_get::<f64, _>(name).map_err(|e| StoreError(e.to_string()))
    };

    Ok(AgentProfile {
        agent_id: row
            .try_get("agent_id")
            .map_err(|e| StoreError(e.to_string()))?,
        name: row.try_get("name").map_err(|e| StoreError(e.to_string()))?,
        model_family,
        capabilities,
        performance: PerformanceHistory {
            success_rate: get_f64("perf_success_rate")?,
            average_quality: get_f64("perf_avg_quality")?,
            average_latency_ms: get_f64("perf_avg_latency")?,
            task_count: get_i64("perf_task_count")? as u64,
        },
        load: AgentLoad {
            active_tasks: get_i64("load_active")? as u32,
            queued_tasks: get_i64("load_queued")? as u32,
            utilization_percent: get_f64("load_util_pct")?,
        },
        registered_at: from_ms(get_i64("registered_at")?),
        last_active_at: from_ms(get_i64("last_active_at")?),
    })
}
