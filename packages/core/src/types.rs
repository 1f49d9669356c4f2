//! Conductor-Core: Task Model

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Category of work an agent can be asked to perform.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "kebab-case")]
pub enum TaskType {
    /// Editing or authoring source code
    CodeEditing,
    /// Reviewing a change set
    CodeReview,
    /// Writing or running tests
    Testing,
    /// Writing documentation
    Documentation,
    /// Restructuring without behavior change
    Refactoring,
    /// Diagnosing and fixing defects
    Debugging,
    /// Reading and summarizing code or data
    Analysis,
}

impl TaskType {
    /// Stable string form used in persisted rows and event payloads.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CodeEditing => "code-editing",
            Self::CodeReview => "code-review",
            Self::Testing => "testing",
            Self::Documentation => "documentation",
            Self::Refactoring => "refactoring",
            Self::Debugging => "debugging",
            Self::Analysis => "analysis",
        }
    }
}

impl std::fmt::Display for TaskType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TaskType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "code-editing" => Ok(Self::CodeEditing),
            "code-review" => Ok(Self::CodeReview),
            "testing" => Ok(Self::Testing),
            "documentation" => Ok(Self::Documentation),
            "refactoring" => Ok(Self::Refactoring),
            "debugging" => Ok(Self::Debugging),
            "analysis" => Ok(Self::Analysis),
            other => Err(format!("unknown task type '{other}'")),
        }
    }
}

/// Declared capability triple: what an agent can do, in which languages,
/// with which specializations. Also used as the requirement side of a task.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentCapabilities {
    /// Supported task categories
    #[serde(default)]
    pub task_types: BTreeSet<TaskType>,
    /// Supported languages (e.g. "TypeScript", "Rust")
    #[serde(default)]
    pub languages: BTreeSet<String>,
    /// Specializations (e.g. "frontend", "database")
    #[serde(default)]
    pub specializations: BTreeSet<String>,
}

impl AgentCapabilities {
    /// Capability set covering a single task type.
    pub fn for_task_type(task_type: TaskType) -> Self {
        Self {
            task_types: BTreeSet::from([task_type]),
            ..Self::default()
        }
    }

    /// Add a language to the set.
    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.languages.insert(language.into());
        self
    }

    /// Add a specialization to the set.
    pub fn with_specialization(mut self, specialization: impl Into<String>) -> Self {
        self.specializations.insert(specialization.into());
        self
    }

    /// True if `self` covers every requirement in `required`.
    pub fn covers(&self, required: &AgentCapabilities) -> bool {
        required.task_types.is_subset(&self.task_types)
            && required.languages.is_subset(&self.languages)
            && required.specializations.is_subset(&self.specializations)
    }
}

/// File/LOC budget attached to a task.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Budget {
    /// Maximum number of files the task may touch
    pub max_files: Option<u32>,
    /// Maximum lines of code the task may add or change
    pub max_loc: Option<u32>,
}

/// A unit of work submitted to the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Caller-supplied task identifier
    pub task_id: String,
    /// Task category
    pub task_type: TaskType,
    /// Human-readable description
    #[serde(default)]
    pub description: String,
    /// Scheduling priority (higher = more urgent)
    pub priority: i32,
    /// Execution timeout in milliseconds
    pub timeout_ms: u64,
    /// Maximum routing attempts before the task is failed for good
    pub max_attempts: u32,
    /// Capabilities an agent must declare to receive this task
    #[serde(default)]
    pub required_capabilities: Option<AgentCapabilities>,
    /// Optional file/LOC budget
    #[serde(default)]
    pub budget: Option<Budget>,
    /// Submission timestamp
    pub created_at: DateTime<Utc>,
    /// Free-form metadata carried through routing and arbitration
    #[serde(default)]
    pub metadata: serde_json::Value,
}

/// Default execution timeout when the caller leaves it unspecified.
pub const DEFAULT_TASK_TIMEOUT_MS: u64 = 300_000;

/// Default number of routing attempts.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

impl Task {
    /// Create a task with defaults for everything but identity and type.
    pub fn new(task_id: impl Into<String>, task_type: TaskType) -> Self {
        Self {
            task_id: task_id.into(),
            task_type,
            description: String::new(),
            priority: 0,
            timeout_ms: DEFAULT_TASK_TIMEOUT_MS,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            required_capabilities: None,
            budget: None,
            created_at: Utc::now(),
            metadata: serde_json::Value::Null,
        }
    }

    /// Set the description.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Set the priority.
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Set the execution timeout.
    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    /// Set the maximum routing attempts.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Set required capabilities.
    pub fn with_required_capabilities(mut self, capabilities: AgentCapabilities) -> Self {
        self.required_capabilities = Some(capabilities);
        self
    }

    /// Set the file/LOC budget.
    pub fn with_budget(mut self, budget: Budget) -> Self {
        self.budget = Some(budget);
        self
    }

    /// Attach metadata.
    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Lifecycle status of a task. Transitions are strictly monotonic toward a
/// terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting in the queue
    Queued,
    /// Popped from the queue, routing in progress
    Routing,
    /// Assigned to an agent, awaiting acknowledgment
    Assigned,
    /// Agent acknowledged and is executing
    Executing,
    /// Execution finished, output being validated
    Validating,
    /// Terminal: finished successfully
    Completed,
    /// Terminal: failed permanently
    Failed,
    /// Terminal: timed out
    Timeout,
    /// Terminal: canceled before completion
    Canceled,
}

impl TaskStatus {
    /// True for statuses that admit no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Timeout | Self::Canceled
        )
    }

    /// Monotonic rank used to reject backward transitions.
    fn rank(&self) -> u8 {
        match self {
            Self::Queued => 0,
            Self::Routing => 1,
            Self::Assigned => 2,
            Self::Executing => 3,
            Self::Validating => 4,
            Self::Completed | Self::Failed | Self::Timeout | Self::Canceled => 5,
        }
    }

    /// True if moving from `self` to `next` goes forward in the lifecycle.
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        // Cancel and fail are reachable from any non-terminal state.
        if matches!(next, Self::Canceled | Self::Failed | Self::Timeout) {
            return true;
        }
        next.rank() > self.rank()
    }

    /// Stable string form used in persisted rows.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Routing => "routing",
            Self::Assigned => "assigned",
            Self::Executing => "executing",
            Self::Validating => "validating",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Timeout => "timeout",
            Self::Canceled => "canceled",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "routing" => Ok(Self::Routing),
            "assigned" => Ok(Self::Assigned),
            "executing" => Ok(Self::Executing),
            "validating" => Ok(Self::Validating),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "timeout" => Ok(Self::Timeout),
            "canceled" => Ok(Self::Canceled),
            other => Err(format!("unknown task status '{other}'")),
        }
    }
}

/// Task plus everything the control plane has learned about it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskState {
    /// The task itself
    pub task: Task,
    /// Current lifecycle status
    pub status: TaskStatus,
    /// Routing attempts consumed so far
    pub attempts: u32,
    /// Attempt ceiling copied from the task at enqueue
    pub max_attempts: u32,
    /// Routing decision ids, oldest first
    pub routing_history: Vec<String>,
    /// Last error observed, if any
    pub last_error: Option<String>,
    /// When the task was enqueued
    pub enqueued_at: DateTime<Utc>,
    /// When execution started (status reached Executing)
    pub started_at: Option<DateTime<Utc>>,
    /// When a terminal status was reached
    pub completed_at: Option<DateTime<Utc>>,
    /// Last state-change timestamp
    pub updated_at: DateTime<Utc>,
}

impl TaskState {
    /// Initial state for a freshly enqueued task.
    pub fn queued(task: Task) -> Self {
        let now = Utc::now();
        let max_attempts = task.max_attempts;
        Self {
            task,
            status: TaskStatus::Queued,
            attempts: 0,
            max_attempts,
            routing_history: Vec::new(),
            last_error: None,
            enqueued_at: now,
            started_at: None,
            completed_at: None,
            updated_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_builder() {
        let task = Task::new("t-1", TaskType::CodeEditing)
            .with_priority(5)
            .with_timeout_ms(60_000)
            .with_required_capabilities(
                AgentCapabilities::for_task_type(TaskType::CodeEditing)
                    .with_language("TypeScript"),
            );

        assert_eq!(task.task_id, "t-1");
        assert_eq!(task.priority, 5);
        assert_eq!(task.timeout_ms, 60_000);
        assert!(task
            .required_capabilities
            .as_ref()
            .unwrap()
            .languages
            .contains("TypeScript"));
    }

    #[test]
    fn test_capability_covers() {
        let agent = AgentCapabilities::for_task_type(TaskType::CodeEditing)
            .with_language("Rust")
            .with_language("TypeScript")
            .with_specialization("backend");

        let required = AgentCapabilities::for_task_type(TaskType::CodeEditing)
            .with_language("Rust");
        assert!(agent.covers(&required));

        let too_much = AgentCapabilities::for_task_type(TaskType::CodeEditing)
            .with_language("Python");
        assert!(!agent.covers(&too_much));
    }

    #[test]
    fn test_status_monotonic() {
        assert!(TaskStatus::Queued.can_transition_to(TaskStatus::Routing));
        assert!(TaskStatus::Routing.can_transition_to(TaskStatus::Assigned));
        assert!(TaskStatus::Executing.can_transition_to(TaskStatus::Completed));
        assert!(TaskStatus::Queued.can_transition_to(TaskStatus::Canceled));

        assert!(!TaskStatus::Assigned.can_transition_to(TaskStatus::Queued));
        assert!(!TaskStatus::Completed.can_transition_to(TaskStatus::Executing));
        assert!(!TaskStatus::Canceled.can_transition_to(TaskStatus::Completed));
    }

    #[test]
    fn test_initial_state() {
        let state = TaskState::queued(Task::new("t-1", TaskType::Testing).with_max_attempts(2));
        assert_eq!(state.status, TaskStatus::Queued);
        assert_eq!(state.attempts, 0);
        assert_eq!(state.max_attempts, 2);
        assert!(state.routing_history.is_empty());
    }
}
