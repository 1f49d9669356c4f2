//! Conductor-Orchestrator: Control Plane
//!
//! Receives software-engineering tasks, routes each to an agent picked by
//! capability matching and a multi-armed bandit, tracks the assignment
//! through acknowledgment, progress, and completion, and renders verdicts
//! against declared constitutional rules via the arbitration engine.
//!
//! ```text
//! ingest → validate → enqueue → dequeue → route → assign → execute
//!        → progress updates → completion/fail → arbitrate → final events
//! ```

pub mod assignment;
pub mod config;
pub mod facade;
pub mod orchestrator;
pub mod persistence;
pub mod queue;

// Re-exports
pub use assignment::{
    AssignmentConfig, AssignmentError, AssignmentManager, AssignmentStats, TaskAssignment,
};
pub use config::{OrchestratorConfig, PersistenceConfig};
pub use facade::{
    ArtifactSummary, AssignmentResponse, BudgetCompliance, BudgetGauge, BudgetUsage,
    EstimatedEffort, ProgressAlert, ProgressReport, ProgressThresholds, QualityGate,
    QualityGatesSummary, TaskSpec, TimeTracking, ValidationResult, VerdictResponse,
};
pub use orchestrator::{Orchestrator, OrchestratorError, OrchestratorStats};
pub use persistence::{
    ArbitrationStore, AssignmentStore, PersistenceError, QueueStore, SqliteStore,
};
pub use queue::{QueueConfig, QueueError, QueuePolicy, QueueStats, TaskQueue};
