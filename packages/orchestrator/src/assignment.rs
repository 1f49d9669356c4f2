//! Conductor-Orchestrator: Assignment Manager
//!
//! Tracks a task's life with an agent from assignment to a terminal status.
//! Two timers guard every assignment: an acknowledgment timer that fires if
//! the agent never picks the task up, and a rolling progress check that
//! declares a timeout once the assignment outlives its duration ceiling.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use conductor_core::events::topics;
use conductor_core::{Event, EventBus, EventSeverity, Task, TaskStatus};
use conductor_routing::RoutingDecision;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Assignment manager configuration.
#[derive(Debug, Clone)]
pub struct AssignmentConfig {
    /// How long an agent has to acknowledge an assignment
    pub acknowledgment_timeout_ms: u64,
    /// Period of the rolling progress check
    pub progress_check_interval_ms: u64,
    /// Hard ceiling on assignment duration
    pub max_assignment_duration_ms: u64,
}

impl Default for AssignmentConfig {
    fn default() -> Self {
        Self {
            acknowledgment_timeout_ms: 30_000,
            progress_check_interval_ms: 10_000,
            max_assignment_duration_ms: 300_000,
        }
    }
}

/// A live (or just-terminated) assignment of a task to an agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskAssignment {
    /// Assignment id
    pub id: String,
    /// The assigned task
    pub task: Task,
    /// Routing attempts consumed, including this one
    pub attempts: u32,
    /// Agent executing the task
    pub agent_id: String,
    /// The routing decision that produced this assignment
    pub routing_decision: RoutingDecision,
    /// When the assignment was created
    pub assigned_at: DateTime<Utc>,
    /// `assigned_at + max_assignment_duration`
    pub deadline: DateTime<Utc>,
    /// When the agent acknowledged
    pub acknowledged_at: Option<DateTime<Utc>>,
    /// When execution started
    pub started_at: Option<DateTime<Utc>>,
    /// When a terminal status was reached
    pub completed_at: Option<DateTime<Utc>>,
    /// Reported progress in `[0, 1]`
    pub progress: f64,
    /// Current lifecycle status
    pub status: TaskStatus,
    /// Error message on failure
    pub error_message: Option<String>,
    /// Machine-readable error code on failure
    pub error_code: Option<String>,
    /// Merged progress metadata
    pub metadata: serde_json::Value,
}

/// Assignment errors.
#[derive(Debug, thiserror::Error)]
pub enum AssignmentError {
    #[error("assignment '{assignment_id}' not found")]
    NotFound { assignment_id: String },

    #[error("assignment '{assignment_id}' is already acknowledged")]
    AlreadyAcknowledged { assignment_id: String },

    #[error("assignment '{assignment_id}' has not been acknowledged")]
    NotAcknowledged { assignment_id: String },

    #[error("assignment '{assignment_id}' is already terminal ({status})")]
    Terminal {
        assignment_id: String,
        status: TaskStatus,
    },
}

impl conductor_core::Classify for AssignmentError {
    fn kind(&self) -> conductor_core::ErrorKind {
        match self {
            Self::NotFound { .. } => conductor_core::ErrorKind::NotFound,
            _ => conductor_core::ErrorKind::Precondition,
        }
    }
}

/// Assignment counters. The invariant
/// `total_created = completed + failed + timed_out + reassigned + active`
/// holds at every quiescent point.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AssignmentStats {
    pub total_created: u64,
    pub completed: u64,
    pub failed: u64,
    pub timed_out: u64,
    pub reassigned: u64,
    pub active: usize,
    pub average_duration_ms: f64,
}

#[derive(Default)]
struct Timers {
    ack: Option<JoinHandle<()>>,
    progress: Option<JoinHandle<()>>,
}

#[derive(Debug, Default)]
struct Counters {
    total_created: u64,
    completed: u64,
    failed: u64,
    timed_out: u64,
    reassigned: u64,
    duration_mean_ms: f64,
    duration_samples: u64,
}

/// Lifecycle tracker for live assignments.
pub struct AssignmentManager {
    config: AssignmentConfig,
    bus: EventBus,
    assignments: Arc<RwLock<HashMap<String, TaskAssignment>>>,
    timers: parking_lot::Mutex<HashMap<String, Timers>>,
    counters: parking_lot::Mutex<Counters>,
}

impl AssignmentManager {
    /// Create a manager publishing lifecycle events on `bus`.
    pub fn new(config: AssignmentConfig, bus: EventBus) -> Self {
        Self {
            config,
            bus,
            assignments: Arc::new(RwLock::new(HashMap::new())),
            timers: parking_lot::Mutex::new(HashMap::new()),
            counters: parking_lot::Mutex::new(Counters::default()),
        }
    }

    fn cancel_timers(&self, assignment_id: &str) {
        if let Some(timers) = self.timers.lock().remove(assignment_id) {
            if let Some(handle) = timers.ack {
                handle.abort();
            }
            if let Some(handle) = timers.progress {
                handle.abort();
            }
        }
    }

    /// Create and track an assignment; arms the acknowledgment timer.
    pub async fn create_assignment(
        self: &Arc<Self>,
        task: Task,
        attempts: u32,
        decision: RoutingDecision,
    ) -> TaskAssignment {
        let now = Utc::now();
        let assignment = TaskAssignment {
            id: Uuid::new_v4().to_string(),
            attempts,
            agent_id: decision.selected_agent.clone(),
            routing_decision: decision,
            assigned_at: now,
            deadline: now + ChronoDuration::milliseconds(self.config.max_assignment_duration_ms as i64),
            acknowledged_at: None,
            started_at: None,
            completed_at: None,
            progress: 0.0,
            status: TaskStatus::Assigned,
            error_message: None,
            error_code: None,
            metadata: serde_json::Value::Null,
            task,
        };

        let assignment_id = assignment.id.clone();
        self.assignments
            .write()
            .await
            .insert(assignment_id.clone(), assignment.clone());
        self.counters.lock().total_created += 1;

        // Acknowledgment timer: a never-acknowledged assignment times out.
        let ack_handle = {
            let manager = Arc::clone(self);
            let id = assignment_id.clone();
            let timeout = Duration::from_millis(self.config.acknowledgment_timeout_ms);
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                let unacknowledged = {
                    let assignments = manager.assignments.read().await;
                    assignments
                        .get(&id)
                        .map(|a| a.acknowledged_at.is_none())
                        .unwrap_or(false)
                };
                if unacknowledged {
                    tracing::warn!(assignment_id = %id, "assignment never acknowledged");
                    let _ = manager.timeout_assignment(&id, "acknowledgment timeout").await;
                }
            })
        };
        self.timers.lock().entry(assignment_id.clone()).or_default().ack = Some(ack_handle);

        tracing::info!(
            assignment_id = %assignment_id,
            task_id = %assignment.task.task_id,
            agent_id = %assignment.agent_id,
            "assignment created"
        );
        self.bus
            .emit(
                Event::new(topics::TASK_ASSIGNED, "assignment")
                    .with_task(assignment.task.task_id.clone())
                    .with_agent(assignment.agent_id.clone())
                    .with_metadata(serde_json::json!({
                        "assignment_id": assignment_id,
                        "confidence": assignment.routing_decision.confidence,
                    })),
            )
            .await;
        assignment
    }

    /// Agent picked the task up: cancels the ack timer, marks the
    /// assignment EXECUTING, and arms the rolling progress check.
    pub async fn acknowledge(self: &Arc<Self>, assignment_id: &str) -> Result<(), AssignmentError> {
        let (task_id, agent_id) = {
            let mut assignments = self.assignments.write().await;
            let assignment =
                assignments
                    .get_mut(assignment_id)
                    .ok_or_else(|| AssignmentError::NotFound {
                        assignment_id: assignment_id.to_string(),
                    })?;
            if assignment.status.is_terminal() {
                return Err(AssignmentError::Terminal {
                    assignment_id: assignment_id.to_string(),
                    status: assignment.status,
                });
            }
            if assignment.acknowledged_at.is_some() {
                return Err(AssignmentError::AlreadyAcknowledged {
                    assignment_id: assignment_id.to_string(),
                });
            }
            let now = Utc::now();
            assignment.acknowledged_at = Some(now);
            assignment.started_at = Some(now);
            assignment.status = TaskStatus::Executing;
            (assignment.task.task_id.clone(), assignment.agent_id.clone())
        };

        // Swap the ack timer for the progress check.
        if let Some(timers) = self.timers.lock().get_mut(assignment_id) {
            if let Some(handle) = timers.ack.take() {
                handle.abort();
            }
        }
        let progress_handle = {
            let manager = Arc::clone(self);
            let id = assignment_id.to_string();
            let period = Duration::from_millis(self.config.progress_check_interval_ms.max(1));
            let max_duration = self.config.max_assignment_duration_ms;
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(period);
                interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                loop {
                    interval.tick().await;
                    let overdue = {
                        let assignments = manager.assignments.read().await;
                        match assignments.get(&id) {
                            Some(a) => {
                                let started = a.started_at.unwrap_or(a.assigned_at);
                                (Utc::now() - started).num_milliseconds() as u64 > max_duration
                            }
                            None => return,
                        }
                    };
                    if overdue {
                        let _ = manager.timeout_assignment(&id, "assignment duration exceeded").await;
                        return;
                    }
                }
            })
        };
        self.timers
            .lock()
            .entry(assignment_id.to_string())
            .or_default()
            .progress = Some(progress_handle);

        self.bus
            .emit(
                Event::new(topics::TASK_ACKNOWLEDGED, "assignment")
                    .with_task(task_id)
                    .with_agent(agent_id),
            )
            .await;
        Ok(())
    }

    /// Record progress (clamped to `[0, 1]`), an optional status move, and
    /// merged metadata.
    pub async fn update_progress(
        &self,
        assignment_id: &str,
        progress: f64,
        status: Option<TaskStatus>,
        metadata: Option<serde_json::Value>,
    ) -> Result<(), AssignmentError> {
        let clamped = progress.clamp(0.0, 1.0);
        if (clamped - progress).abs() > f64::EPSILON {
            tracing::warn!(assignment_id, progress, "progress out of range, clamped");
        }

        let (task_id, agent_id, progress) = {
            let mut assignments = self.assignments.write().await;
            let assignment =
                assignments
                    .get_mut(assignment_id)
                    .ok_or_else(|| AssignmentError::NotFound {
                        assignment_id: assignment_id.to_string(),
                    })?;
            if assignment.status.is_terminal() {
                return Err(AssignmentError::Terminal {
                    assignment_id: assignment_id.to_string(),
                    status: assignment.status,
                });
            }
            if assignment.acknowledged_at.is_none() {
                return Err(AssignmentError::NotAcknowledged {
                    assignment_id: assignment_id.to_string(),
                });
            }

            assignment.progress = clamped;
            if let Some(status) = status {
                if assignment.status.can_transition_to(status) && !status.is_terminal() {
                    assignment.status = status;
                }
            }
            if let Some(new_metadata) = metadata {
                merge_metadata(&mut assignment.metadata, new_metadata);
            }
            (
                assignment.task.task_id.clone(),
                assignment.agent_id.clone(),
                assignment.progress,
            )
        };

        self.bus
            .emit(
                Event::new(topics::TASK_PROGRESS, "assignment")
                    .with_task(task_id)
                    .with_agent(agent_id)
                    .with_metadata(serde_json::json!({ "progress": progress })),
            )
            .await;
        Ok(())
    }

    fn record_duration(&self, assignment: &TaskAssignment) {
        let duration_ms = assignment
            .completed_at
            .map(|done| (done - assignment.assigned_at).num_milliseconds().max(0) as f64)
            .unwrap_or(0.0);
        let mut counters = self.counters.lock();
        let n = counters.duration_samples as f64;
        counters.duration_mean_ms += (duration_ms - counters.duration_mean_ms) / (n + 1.0);
        counters.duration_samples += 1;
    }

    fn take_assignment_if_live(
        assignments: &mut HashMap<String, TaskAssignment>,
        assignment_id: &str,
    ) -> Result<TaskAssignment, AssignmentError> {
        match assignments.remove(assignment_id) {
            None => Err(AssignmentError::NotFound {
                assignment_id: assignment_id.to_string(),
            }),
            Some(assignment) if assignment.status.is_terminal() => {
                let status = assignment.status;
                assignments.insert(assignment_id.to_string(), assignment);
                Err(AssignmentError::Terminal {
                    assignment_id: assignment_id.to_string(),
                    status,
                })
            }
            Some(assignment) => Ok(assignment),
        }
    }

    /// Complete the assignment; cancels timers and folds the duration into
    /// the running average.
    pub async fn complete_assignment(
        &self,
        assignment_id: &str,
    ) -> Result<TaskAssignment, AssignmentError> {
        let assignment = {
            let mut assignments = self.assignments.write().await;
            let mut assignment = Self::take_assignment_if_live(&mut assignments, assignment_id)?;
            assignment.status = TaskStatus::Completed;
            assignment.completed_at = Some(Utc::now());
            assignment.progress = 1.0;
            assignment
        };

        self.cancel_timers(assignment_id);
        self.record_duration(&assignment);
        self.counters.lock().completed += 1;

        self.bus
            .emit(
                Event::new(topics::TASK_COMPLETED, "assignment")
                    .with_task(assignment.task.task_id.clone())
                    .with_agent(assignment.agent_id.clone()),
            )
            .await;
        Ok(assignment)
    }

    /// Fail the assignment. When `can_retry` holds and attempts remain, the
    /// task is returned for reassignment; otherwise the failure is final.
    pub async fn fail_assignment(
        &self,
        assignment_id: &str,
        error: &str,
        can_retry: bool,
    ) -> Result<Option<Task>, AssignmentError> {
        let (assignment, reassign) = {
            let mut assignments = self.assignments.write().await;
            let mut assignment = Self::take_assignment_if_live(&mut assignments, assignment_id)?;
            assignment.status = TaskStatus::Failed;
            assignment.completed_at = Some(Utc::now());
            assignment.error_message = Some(error.to_string());
            let reassign = can_retry && assignment.attempts < assignment.task.max_attempts;
            (assignment, reassign)
        };

        self.cancel_timers(assignment_id);
        self.record_duration(&assignment);
        {
            let mut counters = self.counters.lock();
            if reassign {
                counters.reassigned += 1;
            } else {
                counters.failed += 1;
            }
        }

        tracing::warn!(
            assignment_id,
            task_id = %assignment.task.task_id,
            agent_id = %assignment.agent_id,
            reassign,
            error,
            "assignment failed"
        );
        self.bus
            .emit(
                Event::new(topics::TASK_FAILED, "assignment")
                    .with_severity(EventSeverity::Warn)
                    .with_task(assignment.task.task_id.clone())
                    .with_agent(assignment.agent_id.clone())
                    .with_metadata(serde_json::json!({
                        "error": error,
                        "reassign": reassign,
                    })),
            )
            .await;

        Ok(reassign.then(|| assignment.task.clone()))
    }

    /// Declare the assignment timed out; cancels timers.
    pub async fn timeout_assignment(
        &self,
        assignment_id: &str,
        reason: &str,
    ) -> Result<TaskAssignment, AssignmentError> {
        let assignment = {
            let mut assignments = self.assignments.write().await;
            let mut assignment = Self::take_assignment_if_live(&mut assignments, assignment_id)?;
            assignment.status = TaskStatus::Timeout;
            assignment.completed_at = Some(Utc::now());
            assignment.error_message = Some(reason.to_string());
            assignment
        };

        self.cancel_timers(assignment_id);
        self.record_duration(&assignment);
        self.counters.lock().timed_out += 1;

        tracing::warn!(
            assignment_id,
            task_id = %assignment.task.task_id,
            reason,
            "assignment timed out"
        );
        self.bus
            .emit(
                Event::new(topics::TASK_TIMEOUT, "assignment")
                    .with_severity(EventSeverity::Warn)
                    .with_task(assignment.task.task_id.clone())
                    .with_agent(assignment.agent_id.clone())
                    .with_metadata(serde_json::json!({ "reason": reason })),
            )
            .await;
        Ok(assignment)
    }

    /// Copy of an assignment, if it is still tracked.
    pub async fn get(&self, assignment_id: &str) -> Option<TaskAssignment> {
        self.assignments.read().await.get(assignment_id).cloned()
    }

    /// Copy of the assignment tracking a given task, if any.
    pub async fn get_by_task(&self, task_id: &str) -> Option<TaskAssignment> {
        let assignments = self.assignments.read().await;
        assignments
            .values()
            .find(|a| a.task.task_id == task_id)
            .cloned()
    }

    /// Number of live assignments.
    pub async fn active_count(&self) -> usize {
        self.assignments.read().await.len()
    }

    /// Live assignments per agent (used for load bookkeeping).
    pub async fn active_for_agent(&self, agent_id: &str) -> usize {
        let assignments = self.assignments.read().await;
        assignments.values().filter(|a| a.agent_id == agent_id).count()
    }

    /// Cancel every timer and fail all live assignments.
    pub async fn shutdown(&self) {
        let ids: Vec<String> = self.assignments.read().await.keys().cloned().collect();
        for assignment_id in ids {
            let _ = self
                .fail_assignment(&assignment_id, "System shutdown", false)
                .await;
        }
        let mut timers = self.timers.lock();
        for (_, timer) in timers.drain() {
            if let Some(handle) = timer.ack {
                handle.abort();
            }
            if let Some(handle) = timer.progress {
                handle.abort();
            }
        }
    }

    /// Snapshot of assignment counters.
    pub async fn stats(&self) -> AssignmentStats {
        let active = self.active_count().await;
        let counters = self.counters.lock();
        AssignmentStats {
            total_created: counters.total_created,
            completed: counters.completed,
            failed: counters.failed,
            timed_out: counters.timed_out,
            reassigned: counters.reassigned,
            active,
            average_duration_ms: counters.duration_mean_ms,
        }
    }
}

/// Shallow-merge `incoming` object keys into `target`.
fn merge_metadata(target: &mut serde_json::Value, incoming: serde_json::Value) {
    if incoming.is_null() {
        return;
    }
    match incoming {
        serde_json::Value::Object(new_keys) => {
            if let Some(object) = target.as_object_mut() {
                for (key, value) in new_keys {
                    object.insert(key, value);
                }
            } else {
                *target = serde_json::Value::Object(new_keys);
            }
        }
        other => *target = other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conductor_core::TaskType;
    use conductor_routing::RoutingStrategy;

    fn manager(config: AssignmentConfig) -> Arc<AssignmentManager> {
        Arc::new(AssignmentManager::new(config, EventBus::default()))
    }

    fn decision(agent: &str) -> RoutingDecision {
        RoutingDecision::new("t-1", agent, 0.9, RoutingStrategy::CapabilityMatch)
    }

    async fn assigned(manager: &Arc<AssignmentManager>) -> TaskAssignment {
        manager
            .create_assignment(Task::new("t-1", TaskType::CodeEditing), 1, decision("a-1"))
            .await
    }

    #[tokio::test]
    async fn test_happy_path() {
        let manager = manager(AssignmentConfig::default());
        let assignment = assigned(&manager).await;

        manager.acknowledge(&assignment.id).await.unwrap();
        manager
            .update_progress(&assignment.id, 0.5, None, None)
            .await
            .unwrap();

        let live = manager.get(&assignment.id).await.unwrap();
        assert_eq!(live.status, TaskStatus::Executing);
        assert!((live.progress - 0.5).abs() < f64::EPSILON);

        let done = manager.complete_assignment(&assignment.id).await.unwrap();
        assert_eq!(done.status, TaskStatus::Completed);

        let stats = manager.stats().await;
        assert_eq!(stats.total_created, 1);
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.active, 0);
    }

    #[tokio::test]
    async fn test_progress_requires_acknowledgment() {
        let manager = manager(AssignmentConfig::default());
        let assignment = assigned(&manager).await;

        let result = manager.update_progress(&assignment.id, 0.5, None, None).await;
        assert!(matches!(result, Err(AssignmentError::NotAcknowledged { .. })));
    }

    #[tokio::test]
    async fn test_double_acknowledge_rejected() {
        let manager = manager(AssignmentConfig::default());
        let assignment = assigned(&manager).await;

        manager.acknowledge(&assignment.id).await.unwrap();
        assert!(matches!(
            manager.acknowledge(&assignment.id).await,
            Err(AssignmentError::AlreadyAcknowledged { .. })
        ));
    }

    #[tokio::test]
    async fn test_terminal_admits_no_further_transitions() {
        let manager = manager(AssignmentConfig::default());
        let assignment = assigned(&manager).await;
        manager.acknowledge(&assignment.id).await.unwrap();
        manager.complete_assignment(&assignment.id).await.unwrap();

        assert!(matches!(
            manager.complete_assignment(&assignment.id).await,
            Err(AssignmentError::NotFound { .. })
        ));
        assert!(matches!(
            manager
                .fail_assignment(&assignment.id, "late", true)
                .await,
            Err(AssignmentError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_ack_timeout_fires() {
        let manager = manager(AssignmentConfig {
            acknowledgment_timeout_ms: 20,
            ..AssignmentConfig::default()
        });
        let assignment = assigned(&manager).await;

        tokio::time::sleep(Duration::from_millis(120)).await;

        assert!(manager.get(&assignment.id).await.is_none());
        let stats = manager.stats().await;
        assert_eq!(stats.timed_out, 1);
        assert_eq!(stats.active, 0);
    }

    #[tokio::test]
    async fn test_progress_timer_declares_timeout() {
        let manager = manager(AssignmentConfig {
            acknowledgment_timeout_ms: 60_000,
            progress_check_interval_ms: 10,
            max_assignment_duration_ms: 30,
            ..AssignmentConfig::default()
        });
        let assignment = assigned(&manager).await;
        manager.acknowledge(&assignment.id).await.unwrap();

        tokio::time::sleep(Duration::from_millis(150)).await;

        let stats = manager.stats().await;
        assert_eq!(stats.timed_out, 1);
        assert_eq!(stats.active, 0);
    }

    #[tokio::test]
    async fn test_fail_with_retry_returns_task() {
        let manager = manager(AssignmentConfig::default());
        let assignment = manager
            .create_assignment(
                Task::new("t-1", TaskType::CodeEditing).with_max_attempts(3),
                1,
                decision("a-1"),
            )
            .await;
        manager.acknowledge(&assignment.id).await.unwrap();

        let task = manager
            .fail_assignment(&assignment.id, "agent crashed", true)
            .await
            .unwrap();
        assert!(task.is_some());

        let stats = manager.stats().await;
        assert_eq!(stats.reassigned, 1);
        assert_eq!(stats.failed, 0);
    }

    #[tokio::test]
    async fn test_fail_without_attempts_is_final() {
        let manager = manager(AssignmentConfig::default());
        let assignment = manager
            .create_assignment(
                Task::new("t-1", TaskType::CodeEditing).with_max_attempts(1),
                1,
                decision("a-1"),
            )
            .await;

        let task = manager
            .fail_assignment(&assignment.id, "agent crashed", true)
            .await
            .unwrap();
        assert!(task.is_none());
        assert_eq!(manager.stats().await.failed, 1);
    }

    #[tokio::test]
    async fn test_out_of_range_progress_is_clamped() {
        let manager = manager(AssignmentConfig::default());
        let assignment = assigned(&manager).await;
        manager.acknowledge(&assignment.id).await.unwrap();

        manager
            .update_progress(&assignment.id, 7.5, None, None)
            .await
            .unwrap();
        assert!((manager.get(&assignment.id).await.unwrap().progress - 1.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_shutdown_drains_all() {
        let manager = manager(AssignmentConfig::default());
        for i in 0..3 {
            manager
                .create_assignment(
                    Task::new(format!("t-{i}"), TaskType::Testing),
                    1,
                    decision("a-1"),
                )
                .await;
        }

        manager.shutdown().await;

        let stats = manager.stats().await;
        assert_eq!(stats.active, 0);
        assert_eq!(stats.failed, 3);
        assert_eq!(stats.total_created, 3);
    }

    #[tokio::test]
    async fn test_duration_average_is_incremental() {
        let manager = manager(AssignmentConfig::default());
        for i in 0..3 {
            let assignment = manager
                .create_assignment(
                    Task::new(format!("t-{i}"), TaskType::Testing),
                    1,
                    decision("a-1"),
                )
                .await;
            manager.acknowledge(&assignment.id).await.unwrap();
            manager.complete_assignment(&assignment.id).await.unwrap();
        }

        let stats = manager.stats().await;
        assert_eq!(stats.completed, 3);
        assert!(stats.average_duration_ms >= 0.0);
    }
}
