//! Conductor-Orchestrator: Task Queue
//!
//! Bounded queue ordering tasks by the configured policy (FIFO, priority,
//! or deadline-aware priority). Every mutating operation is serialized by a
//! FIFO exclusive lock so concurrent producers cannot starve each other,
//! and, when persistence is enabled, writes through to the store before the
//! lock is released.

use crate::persistence::{PersistenceError, QueueStore};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use conductor_core::events::topics;
use conductor_core::{
    Classify, Event, EventBus, FifoLock, Task, TaskState, TaskStatus, DEFAULT_TASK_TIMEOUT_MS,
};
use conductor_gate::{Credentials, Permission, SecurityContext, SecurityError};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Queue ordering policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueuePolicy {
    /// Strict arrival order
    Fifo,
    /// Descending task priority, arrival order within a priority
    Priority,
    /// Task priority boosted by deadline urgency
    Deadline,
}

/// Queue configuration.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Maximum queued tasks
    pub max_capacity: usize,
    /// Ordering policy
    pub policy: QueuePolicy,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_capacity: 1_000,
            policy: QueuePolicy::Priority,
        }
    }
}

/// Queue errors.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("queue is full ({capacity} tasks)")]
    CapacityExceeded { capacity: usize },

    #[error("task '{task_id}' is already queued")]
    DuplicateTask { task_id: String },

    #[error("task '{task_id}' not found")]
    TaskNotFound { task_id: String },

    #[error("task '{task_id}': invalid status transition {from} → {to}")]
    InvalidTransition {
        task_id: String,
        from: TaskStatus,
        to: TaskStatus,
    },

    #[error("invalid task: {reason}")]
    InvalidTask { reason: String },

    #[error(transparent)]
    Persistence(#[from] PersistenceError),

    #[error(transparent)]
    Security(#[from] SecurityError),
}

impl conductor_core::Classify for QueueError {
    fn kind(&self) -> conductor_core::ErrorKind {
        match self {
            Self::CapacityExceeded { .. } => conductor_core::ErrorKind::Saturation,
            Self::DuplicateTask { .. }
            | Self::InvalidTransition { .. }
            | Self::InvalidTask { .. } => conductor_core::ErrorKind::Precondition,
            Self::TaskNotFound { .. } => conductor_core::ErrorKind::NotFound,
            Self::Persistence(err) => err.kind(),
            Self::Security(err) => err.kind(),
        }
    }
}

/// Queue counters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueueStats {
    pub depth: usize,
    pub max_depth: usize,
    pub total_enqueued: u64,
    pub total_dequeued: u64,
    pub total_canceled: u64,
    pub priority_histogram: BTreeMap<i32, u64>,
}

#[derive(Debug, Clone)]
struct QueueEntry {
    task_id: String,
    score: f64,
}

#[derive(Default)]
struct QueueInner {
    /// Queued entries, highest score first, arrival order within a score
    entries: Vec<QueueEntry>,
    /// Every task the queue has seen, keyed by id
    states: HashMap<String, TaskState>,
}

#[derive(Debug, Default)]
struct StatCounters {
    max_depth: usize,
    total_enqueued: u64,
    total_dequeued: u64,
    total_canceled: u64,
    priority_histogram: BTreeMap<i32, u64>,
}

/// Priority/deadline-aware bounded task queue.
pub struct TaskQueue {
    config: QueueConfig,
    lock: FifoLock,
    bus: EventBus,
    store: Option<Arc<dyn QueueStore>>,
    security: Option<Arc<SecurityContext>>,
    inner: RwLock<QueueInner>,
    stats: parking_lot::Mutex<StatCounters>,
}

impl TaskQueue {
    /// Create a queue publishing events on `bus`.
    pub fn new(config: QueueConfig, bus: EventBus) -> Self {
        Self {
            config,
            lock: FifoLock::new(),
            bus,
            store: None,
            security: None,
            inner: RwLock::new(QueueInner::default()),
            stats: parking_lot::Mutex::new(StatCounters::default()),
        }
    }

    /// Attach a persistence store; mutations write through before the queue
    /// lock is released.
    pub fn with_store(mut self, store: Arc<dyn QueueStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Attach a security context used by credentialed enqueues.
    pub fn with_security(mut self, security: Arc<SecurityContext>) -> Self {
        self.security = Some(security);
        self
    }

    /// Effective queue score: higher dequeues earlier.
    fn score(&self, task: &Task, now: DateTime<Utc>) -> f64 {
        match self.config.policy {
            QueuePolicy::Fifo => 0.0,
            QueuePolicy::Priority => task.priority as f64,
            QueuePolicy::Deadline => {
                let deadline =
                    task.created_at + ChronoDuration::milliseconds(task.timeout_ms as i64);
                let remaining_ms = (deadline - now).num_milliseconds() as f64;
                let day_ms = 86_400_000.0;
                let urgency = (1.0 - remaining_ms / day_ms).clamp(0.0, 1.0);
                task.priority as f64 + urgency * 10.0
            }
        }
    }

    /// Insert preserving descending score, arrival order within equal
    /// scores.
    fn insert_entry(entries: &mut Vec<QueueEntry>, entry: QueueEntry) {
        let position = entries
            .iter()
            .position(|existing| existing.score < entry.score)
            .unwrap_or(entries.len());
        entries.insert(position, entry);
    }

    /// Enqueue a task. Rejects at capacity and on duplicate queued ids; a
    /// failed write-through rolls the in-memory insert back.
    pub async fn enqueue(&self, mut task: Task) -> Result<(), QueueError> {
        if task.task_id.trim().is_empty() {
            return Err(QueueError::InvalidTask {
                reason: "task_id is empty".to_string(),
            });
        }
        if task.timeout_ms == 0 {
            task.timeout_ms = DEFAULT_TASK_TIMEOUT_MS;
        }

        let _guard = self.lock.acquire().await;
        let state = TaskState::queued(task);
        self.enqueue_locked(state).await
    }

    /// Put a task back on the queue for another routing attempt.
    pub async fn requeue(&self, task: Task, attempts: u32) -> Result<(), QueueError> {
        let _guard = self.lock.acquire().await;
        let mut state = TaskState::queued(task);
        state.attempts = attempts;
        self.enqueue_locked(state).await
    }

    /// Caller must hold the queue lock.
    async fn enqueue_locked(&self, state: TaskState) -> Result<(), QueueError> {
        let task_id = state.task.task_id.clone();
        let priority = state.task.priority;
        {
            let mut inner = self.inner.write().await;
            if inner.entries.len() >= self.config.max_capacity {
                return Err(QueueError::CapacityExceeded {
                    capacity: self.config.max_capacity,
                });
            }
            if inner.entries.iter().any(|e| e.task_id == task_id) {
                return Err(QueueError::DuplicateTask { task_id });
            }

            let entry = QueueEntry {
                task_id: task_id.clone(),
                score: self.score(&state.task, Utc::now()),
            };
            Self::insert_entry(&mut inner.entries, entry);
            inner.states.insert(task_id.clone(), state.clone());
        }

        if let Some(store) = &self.store {
            if let Err(err) = store.upsert_task(&state).await {
                // Roll the in-memory insert back; the enqueue fails whole.
                let mut inner = self.inner.write().await;
                inner.entries.retain(|e| e.task_id != task_id);
                inner.states.remove(&task_id);
                tracing::warn!(task_id = %task_id, error = %err, "enqueue write-through failed");
                return Err(err.into());
            }
        }

        {
            let mut stats = self.stats.lock();
            stats.total_enqueued += 1;
            *stats.priority_histogram.entry(priority).or_insert(0) += 1;
        }
        let depth = self.depth().await;
        {
            let mut stats = self.stats.lock();
            if depth > stats.max_depth {
                stats.max_depth = depth;
            }
        }

        tracing::debug!(task_id = %task_id, priority, depth, "task enqueued");
        self.bus
            .emit(
                Event::new(topics::TASK_ENQUEUED, "queue")
                    .with_task(task_id)
                    .with_metadata(serde_json::json!({ "priority": priority, "depth": depth })),
            )
            .await;
        Ok(())
    }

    /// Authenticated enqueue: authn + `submit_task` + rate limit, then the
    /// normal enqueue path with sanitized inputs.
    pub async fn enqueue_with_credentials(
        &self,
        mut task: Task,
        credentials: &Credentials,
    ) -> Result<(), QueueError> {
        if let Some(security) = &self.security {
            security
                .authorize(credentials, Permission::SubmitTask)
                .await?;
        }

        task.task_id = task.task_id.trim().to_string();
        task.description = task.description.trim().to_string();
        if task.description.len() > 10_000 {
            tracing::warn!(task_id = %task.task_id, "task description truncated");
            task.description.truncate(10_000);
        }
        self.enqueue(task).await
    }

    /// Pop the highest-priority task; its state moves QUEUED → ROUTING and
    /// ownership passes to the caller. `None` on an empty queue.
    pub async fn dequeue(&self) -> Option<TaskState> {
        let _guard = self.lock.acquire().await;

        let (state, wait_ms) = {
            let mut inner = self.inner.write().await;
            if inner.entries.is_empty() {
                return None;
            }
            let entry = inner.entries.remove(0);
            let state = inner.states.get_mut(&entry.task_id)?;
            state.status = TaskStatus::Routing;
            state.attempts += 1;
            state.updated_at = Utc::now();
            let wait_ms = (Utc::now() - state.enqueued_at).num_milliseconds().max(0);
            (state.clone(), wait_ms)
        };

        self.stats.lock().total_dequeued += 1;

        if let Some(store) = &self.store {
            if let Err(err) = store
                .update_task_status(&state.task.task_id, TaskStatus::Routing, None)
                .await
            {
                tracing::warn!(task_id = %state.task.task_id, error = %err, "dequeue write-through failed");
            }
        }

        self.bus
            .emit(
                Event::new(topics::TASK_DEQUEUED, "queue")
                    .with_task(state.task.task_id.clone())
                    .with_metadata(serde_json::json!({ "wait_ms": wait_ms })),
            )
            .await;
        Some(state)
    }

    /// Next task without removing it.
    pub async fn peek(&self) -> Option<TaskState> {
        let inner = self.inner.read().await;
        let entry = inner.entries.first()?;
        inner.states.get(&entry.task_id).cloned()
    }

    /// Cancel every queued task. Returns how many were canceled.
    pub async fn clear(&self) -> usize {
        let _guard = self.lock.acquire().await;

        let canceled: Vec<String> = {
            let mut inner = self.inner.write().await;
            let ids: Vec<String> = inner.entries.drain(..).map(|e| e.task_id).collect();
            let now = Utc::now();
            for task_id in &ids {
                if let Some(state) = inner.states.get_mut(task_id) {
                    state.status = TaskStatus::Canceled;
                    state.last_error = Some("Queue cleared".to_string());
                    state.completed_at = Some(now);
                    state.updated_at = now;
                }
            }
            ids
        };

        self.stats.lock().total_canceled += canceled.len() as u64;

        if let Some(store) = &self.store {
            for task_id in &canceled {
                if let Err(err) = store
                    .update_task_status(task_id, TaskStatus::Canceled, Some("Queue cleared"))
                    .await
                {
                    tracing::warn!(task_id = %task_id, error = %err, "clear write-through failed");
                }
            }
        }

        tracing::info!(count = canceled.len(), "queue cleared");
        canceled.len()
    }

    /// Record a status change for a task the queue has seen. Rejects
    /// non-monotonic transitions; records timestamps on ASSIGNED and
    /// terminal statuses.
    pub async fn update_task_status(
        &self,
        task_id: &str,
        status: TaskStatus,
        error: Option<&str>,
    ) -> Result<(), QueueError> {
        let _guard = self.lock.acquire().await;

        let was_queued = {
            let mut inner = self.inner.write().await;
            let state = inner
                .states
                .get_mut(task_id)
                .ok_or_else(|| QueueError::TaskNotFound {
                    task_id: task_id.to_string(),
                })?;

            if !state.status.can_transition_to(status) {
                return Err(QueueError::InvalidTransition {
                    task_id: task_id.to_string(),
                    from: state.status,
                    to: status,
                });
            }

            let was_queued = state.status == TaskStatus::Queued;
            let now = Utc::now();
            state.status = status;
            state.updated_at = now;
            if let Some(error) = error {
                state.last_error = Some(error.to_string());
            }
            match status {
                TaskStatus::Assigned => state.started_at = Some(now),
                TaskStatus::Executing if state.started_at.is_none() => {
                    state.started_at = Some(now)
                }
                s if s.is_terminal() => state.completed_at = Some(now),
                _ => {}
            }

            if was_queued && status.is_terminal() {
                inner.entries.retain(|e| e.task_id != task_id);
            }
            was_queued
        };

        if was_queued && status == TaskStatus::Canceled {
            self.stats.lock().total_canceled += 1;
        }

        if let Some(store) = &self.store {
            if let Err(err) = store.update_task_status(task_id, status, error).await {
                tracing::warn!(task_id, error = %err, "status write-through failed");
            }
        }
        Ok(())
    }

    /// Replay `status = 'queued'` rows from the store (startup).
    pub async fn replay_from_store(&self) -> Result<usize, QueueError> {
        let Some(store) = &self.store else {
            return Ok(0);
        };
        let states = store.load_queued().await?;

        let _guard = self.lock.acquire().await;
        let mut inner = self.inner.write().await;
        let mut stats = self.stats.lock();
        let count = states.len();
        for state in states {
            let entry = QueueEntry {
                task_id: state.task.task_id.clone(),
                score: self.score(&state.task, Utc::now()),
            };
            Self::insert_entry(&mut inner.entries, entry);
            stats.total_enqueued += 1;
            *stats
                .priority_histogram
                .entry(state.task.priority)
                .or_insert(0) += 1;
            inner.states.insert(state.task.task_id.clone(), state);
        }
        if inner.entries.len() > stats.max_depth {
            stats.max_depth = inner.entries.len();
        }
        tracing::info!(count, "task queue replayed from store");
        Ok(count)
    }

    /// Copy of the tracked state for a task.
    pub async fn get_state(&self, task_id: &str) -> Option<TaskState> {
        self.inner.read().await.states.get(task_id).cloned()
    }

    /// Number of queued tasks.
    pub async fn depth(&self) -> usize {
        self.inner.read().await.entries.len()
    }

    /// Snapshot of queue counters.
    pub async fn stats(&self) -> QueueStats {
        let depth = self.depth().await;
        let stats = self.stats.lock();
        QueueStats {
            depth,
            max_depth: stats.max_depth,
            total_enqueued: stats.total_enqueued,
            total_dequeued: stats.total_dequeued,
            total_canceled: stats.total_canceled,
            priority_histogram: stats.priority_histogram.clone(),
        }
    }
}
