//! Conductor-Orchestrator: Wiring
//!
//! Owns every subsystem handle (no globals), drives the task pipeline
//! ingest → dequeue → route → assign → progress → terminal, and exposes the
//! standalone arbitration path for constitutional violation reports.

use crate::assignment::{AssignmentError, AssignmentManager, AssignmentStats, TaskAssignment};
use crate::config::OrchestratorConfig;
use crate::persistence::{
    ArbitrationStore, AssignmentStore, PersistenceError, QueueStore, SqliteStore,
};
use crate::queue::{QueueError, QueueStats, TaskQueue};
use conductor_arbiter::{
    ArbitrationEngine, ArbitrationError, ArbitrationStats, ConstitutionalRule,
    ConstitutionalViolation, RuleError, Verdict,
};
use conductor_core::events::topics;
use conductor_core::{Classify, Event, EventBus, EventBusStats, Task, TaskState, TaskStatus};
use conductor_gate::{CommandError, CommandValidator, Credentials, SecurityContext, SecurityError};
use conductor_routing::{
    AgentRegistry, AgentStore, BanditStats, MultiArmedBandit, RegistryError, RegistryStats,
    RouterError, RouterMetrics, RoutingOutcome, TaskRouter,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::task::JoinHandle;

/// Orchestrator-level errors: each subsystem error passes through with its
/// classification intact.
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Router(#[from] RouterError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Assignment(#[from] AssignmentError),

    #[error(transparent)]
    Arbitration(#[from] ArbitrationError),

    #[error(transparent)]
    Persistence(#[from] PersistenceError),

    #[error(transparent)]
    Command(#[from] CommandError),

    #[error(transparent)]
    Security(#[from] SecurityError),

    #[error(transparent)]
    Rules(#[from] RuleError),
}

impl conductor_core::Classify for OrchestratorError {
    fn kind(&self) -> conductor_core::ErrorKind {
        match self {
            Self::Queue(e) => e.kind(),
            Self::Router(e) => e.kind(),
            Self::Registry(e) => e.kind(),
            Self::Assignment(e) => e.kind(),
            Self::Arbitration(e) => e.kind(),
            Self::Persistence(e) => e.kind(),
            Self::Command(e) => e.kind(),
            Self::Security(e) => e.kind(),
            Self::Rules(e) => e.kind(),
        }
    }
}

/// Aggregated statistics across every subsystem.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorStats {
    pub queue: QueueStats,
    pub registry: RegistryStats,
    pub router: RouterMetrics,
    pub bandit: BanditStats,
    pub assignments: AssignmentStats,
    pub arbitration: ArbitrationStats,
    pub events: EventBusStats,
}

/// The control plane: wires registry, queue, router, assignment manager,
/// and arbitration engine around one shared event bus.
pub struct Orchestrator {
    bus: EventBus,
    validator: CommandValidator,
    security: Arc<SecurityContext>,
    registry: Arc<AgentRegistry>,
    bandit: Arc<MultiArmedBandit>,
    router: Arc<TaskRouter>,
    queue: Arc<TaskQueue>,
    assignments: Arc<AssignmentManager>,
    engine: Arc<ArbitrationEngine>,
    store: Option<Arc<SqliteStore>>,
    background: parking_lot::Mutex<Vec<JoinHandle<()>>>,
    registry_cleanup_enabled: bool,
}

impl Orchestrator {
    /// Build the control plane and run crash recovery if persistence is
    /// enabled.
    pub async fn new(config: OrchestratorConfig) -> Result<Self, OrchestratorError> {
        let bus = EventBus::new(config.events.clone());

        let store = if config.persistence.enabled {
            Some(Arc::new(
                SqliteStore::connect(&config.persistence.database_path).await?,
            ))
        } else {
            None
        };

        let validator = match &config.command_allowlist_path {
            Some(path) => CommandValidator::from_file(path)?,
            None => CommandValidator::new(config.command_allowlist.clone()),
        };
        let security = Arc::new(SecurityContext::new(config.security.clone()));

        let mut registry = AgentRegistry::new(config.registry.clone(), bus.clone());
        if let Some(store) = &store {
            registry = registry.with_store(Arc::clone(store) as Arc<dyn AgentStore>);
        }
        let registry = Arc::new(registry);

        let bandit = Arc::new(MultiArmedBandit::new(config.bandit.clone()));
        let router = Arc::new(TaskRouter::new(
            config.router.clone(),
            Arc::clone(&registry),
            Arc::clone(&bandit),
            bus.clone(),
        ));

        let mut queue =
            TaskQueue::new(config.queue.clone(), bus.clone()).with_security(Arc::clone(&security));
        if let Some(store) = &store {
            queue = queue.with_store(Arc::clone(store) as Arc<dyn QueueStore>);
        }
        let queue = Arc::new(queue);

        let assignments = Arc::new(AssignmentManager::new(config.assignment.clone(), bus.clone()));
        let engine = Arc::new(ArbitrationEngine::new(config.arbitration.clone(), bus.clone()));

        let orchestrator = Self {
            bus,
            validator,
            security,
            registry,
            bandit,
            router,
            queue,
            assignments,
            engine,
            store,
            background: parking_lot::Mutex::new(Vec::new()),
            registry_cleanup_enabled: config.registry.enable_auto_cleanup,
        };
        orchestrator.recover().await;
        Ok(orchestrator)
    }

    /// Startup recovery: reload agents, replay queued tasks, and fail any
    /// session that was mid-flight when the process died.
    async fn recover(&self) {
        let Some(store) = &self.store else {
            return;
        };

        if let Err(err) = self.registry.load_from_store().await {
            tracing::warn!(error = %err, "agent reload failed during recovery");
        }
        match self.queue.replay_from_store().await {
            Ok(count) if count > 0 => tracing::info!(count, "queued tasks replayed"),
            Ok(_) => {}
            Err(err) => tracing::warn!(error = %err, "queue replay failed during recovery"),
        }
        match store.mark_non_terminal_failed("crash recovery").await {
            Ok(count) if count > 0 => {
                tracing::warn!(count, "non-terminal arbitration sessions failed on recovery")
            }
            Ok(_) => {}
            Err(err) => tracing::warn!(error = %err, "session recovery failed"),
        }
    }

    /// Spawn the background sweeps (event retention, stale agents, session
    /// timeouts).
    pub fn start(&self) {
        let mut background = self.background.lock();
        background.push(self.bus.spawn_retention_sweep());
        if self.registry_cleanup_enabled {
            if let Some(handle) = self.registry.spawn_cleanup_sweep() {
                background.push(handle);
            }
        }
        background.push(self.engine.spawn_timeout_sweep());
    }

    // Subsystem handles

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn validator(&self) -> &CommandValidator {
        &self.validator
    }

    pub fn security(&self) -> &Arc<SecurityContext> {
        &self.security
    }

    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.registry
    }

    pub fn router(&self) -> &Arc<TaskRouter> {
        &self.router
    }

    pub fn queue(&self) -> &Arc<TaskQueue> {
        &self.queue
    }

    pub fn assignments(&self) -> &Arc<AssignmentManager> {
        &self.assignments
    }

    pub fn arbitration(&self) -> &Arc<ArbitrationEngine> {
        &self.engine
    }

    // Task pipeline

    /// Enqueue a task.
    pub async fn ingest_task(&self, task: Task) -> Result<(), OrchestratorError> {
        self.queue.enqueue(task).await?;
        Ok(())
    }

    /// Enqueue a task on behalf of an authenticated caller.
    pub async fn ingest_task_with_credentials(
        &self,
        task: Task,
        credentials: &Credentials,
    ) -> Result<(), OrchestratorError> {
        self.queue
            .enqueue_with_credentials(task, credentials)
            .await?;
        Ok(())
    }

    /// Dequeue the next task and route it to an agent. On a routing
    /// failure the task is marked FAILED and the error surfaces.
    pub async fn process_next(&self) -> Result<Option<TaskAssignment>, OrchestratorError> {
        let Some(state) = self.queue.dequeue().await else {
            return Ok(None);
        };
        let task_id = state.task.task_id.clone();

        match self.router.route_task(&state.task).await {
            Ok(decision) => {
                self.queue
                    .update_task_status(&task_id, TaskStatus::Assigned, None)
                    .await?;
                let assignment = self
                    .assignments
                    .create_assignment(state.task.clone(), state.attempts, decision)
                    .await;

                let active = self.assignments.active_for_agent(&assignment.agent_id).await;
                if let Err(err) = self
                    .registry
                    .update_load(&assignment.agent_id, active as u32, 0)
                    .await
                {
                    tracing::warn!(agent_id = %assignment.agent_id, error = %err, "load update failed");
                }
                self.persist_assignment(&assignment).await;
                Ok(Some(assignment))
            }
            Err(err) => {
                let message = err.to_string();
                if let Err(status_err) = self
                    .queue
                    .update_task_status(&task_id, TaskStatus::Failed, Some(&message))
                    .await
                {
                    tracing::warn!(task_id = %task_id, error = %status_err, "status update failed");
                }
                Err(err.into())
            }
        }
    }

    async fn persist_assignment(&self, assignment: &TaskAssignment) {
        if let Some(store) = &self.store {
            if let Err(err) = store.upsert_assignment(assignment).await {
                tracing::warn!(
                    assignment_id = %assignment.id,
                    error = %err,
                    "assignment write-through failed"
                );
            }
        }
    }

    /// Agent acknowledges its assignment.
    pub async fn acknowledge_assignment(
        &self,
        assignment_id: &str,
    ) -> Result<(), OrchestratorError> {
        self.assignments.acknowledge(assignment_id).await?;
        if let Some(assignment) = self.assignments.get(assignment_id).await {
            if let Err(err) = self
                .queue
                .update_task_status(&assignment.task.task_id, TaskStatus::Executing, None)
                .await
            {
                tracing::warn!(task_id = %assignment.task.task_id, error = %err, "status update failed");
            }
            self.persist_assignment(&assignment).await;
        }
        Ok(())
    }

    /// Agent reports progress.
    pub async fn update_progress(
        &self,
        assignment_id: &str,
        progress: f64,
        metadata: Option<serde_json::Value>,
    ) -> Result<(), OrchestratorError> {
        self.assignments
            .update_progress(assignment_id, progress, None, metadata)
            .await?;
        Ok(())
    }

    /// Agent finished successfully: closes the assignment, feeds the
    /// outcome into the registry and bandit, records terminal status.
    pub async fn complete_task(
        &self,
        assignment_id: &str,
        quality: f64,
    ) -> Result<TaskAssignment, OrchestratorError> {
        let assignment = self.assignments.complete_assignment(assignment_id).await?;
        let latency_ms = assignment
            .completed_at
            .map(|done| (done - assignment.assigned_at).num_milliseconds().max(0) as f64)
            .unwrap_or(0.0);

        self.router
            .record_routing_outcome(&RoutingOutcome {
                decision_id: Some(assignment.routing_decision.id.clone()),
                task_id: assignment.task.task_id.clone(),
                agent_id: assignment.agent_id.clone(),
                success: true,
                quality,
                latency_ms,
            })
            .await?;

        if let Err(err) = self
            .queue
            .update_task_status(&assignment.task.task_id, TaskStatus::Completed, None)
            .await
        {
            tracing::warn!(task_id = %assignment.task.task_id, error = %err, "status update failed");
        }
        let active = self.assignments.active_for_agent(&assignment.agent_id).await;
        let _ = self
            .registry
            .update_load(&assignment.agent_id, active as u32, 0)
            .await;
        self.persist_assignment(&assignment).await;
        Ok(assignment)
    }

    /// Agent failed: the outcome feeds back, and the task is requeued when
    /// attempts remain and the failure is retriable.
    pub async fn fail_task(
        &self,
        assignment_id: &str,
        error: &str,
        can_retry: bool,
    ) -> Result<Option<Task>, OrchestratorError> {
        let assignment = self.assignments.get(assignment_id).await.ok_or_else(|| {
            AssignmentError::NotFound {
                assignment_id: assignment_id.to_string(),
            }
        })?;
        let attempts = assignment.attempts;

        let retry_task = self
            .assignments
            .fail_assignment(assignment_id, error, can_retry)
            .await?;

        self.router
            .record_routing_outcome(&RoutingOutcome {
                decision_id: Some(assignment.routing_decision.id.clone()),
                task_id: assignment.task.task_id.clone(),
                agent_id: assignment.agent_id.clone(),
                success: false,
                quality: 0.0,
                latency_ms: (chrono::Utc::now() - assignment.assigned_at)
                    .num_milliseconds()
                    .max(0) as f64,
            })
            .await?;

        match &retry_task {
            Some(task) => {
                self.queue.requeue(task.clone(), attempts).await?;
            }
            None => {
                if let Err(err) = self
                    .queue
                    .update_task_status(&assignment.task.task_id, TaskStatus::Failed, Some(error))
                    .await
                {
                    tracing::warn!(task_id = %assignment.task.task_id, error = %err, "status update failed");
                }
            }
        }
        Ok(retry_task)
    }

    /// Current state of a task.
    pub async fn task_status(&self, task_id: &str) -> Option<TaskState> {
        self.queue.get_state(task_id).await
    }

    // Arbitration path

    /// Run a full arbitration pass for a standalone violation report:
    /// session → rule evaluation → verdict → completion.
    pub async fn arbitrate(
        &self,
        violation: ConstitutionalViolation,
        rules: &[ConstitutionalRule],
    ) -> Result<Verdict, OrchestratorError> {
        let session_id = self.engine.start_session(violation).await?;
        self.engine.evaluate_rules(&session_id, rules).await?;
        let verdict = self.engine.generate_verdict(&session_id).await?;
        self.engine.complete_session(&session_id).await?;
        self.persist_session(&session_id).await;
        Ok(verdict)
    }

    async fn persist_session(&self, session_id: &str) {
        if let Some(store) = &self.store {
            if let Some(session) = self.engine.get_session(session_id).await {
                if let Err(err) = store.upsert_session(&session).await {
                    tracing::warn!(session_id, error = %err, "session write-through failed");
                }
            }
        }
    }

    /// Aggregated statistics snapshot.
    pub async fn stats(&self) -> OrchestratorStats {
        OrchestratorStats {
            queue: self.queue.stats().await,
            registry: self.registry.stats().await,
            router: self.router.metrics(),
            bandit: self.bandit.stats(),
            assignments: self.assignments.stats().await,
            arbitration: self.engine.stats().await,
            events: self.bus.stats(),
        }
    }

    /// Graceful shutdown: stop sweeps, drain assignments, fail open
    /// sessions, emit the final summary event.
    pub async fn shutdown(&self) {
        {
            let mut background = self.background.lock();
            for handle in background.drain(..) {
                handle.abort();
            }
        }

        self.assignments.shutdown().await;
        self.engine.shutdown().await;

        let stats = self.stats().await;
        self.bus
            .emit(
                Event::new(topics::ORCHESTRATOR_SHUTDOWN, "orchestrator").with_metadata(
                    serde_json::to_value(&stats).unwrap_or(serde_json::Value::Null),
                ),
            )
            .await;
        tracing::info!("orchestrator shut down");
    }
}
