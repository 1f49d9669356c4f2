//! Conductor-Routing: Decision Records & Queries

use chrono::{DateTime, Utc};
use conductor_core::TaskType;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use uuid::Uuid;

/// How an agent was chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RoutingStrategy {
    /// Bandit exploit pick (argmax of mean + UCB)
    MultiArmedBandit,
    /// Weighted capability/performance scoring
    CapabilityMatch,
    /// Bandit exploration pick (random draw)
    EpsilonGreedy,
}

impl RoutingStrategy {
    /// Stable string form used in persisted rows.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MultiArmedBandit => "multi-armed-bandit",
            Self::CapabilityMatch => "capability-match",
            Self::EpsilonGreedy => "epsilon-greedy",
        }
    }
}

/// A candidate that was considered but not selected.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingAlternative {
    /// Candidate agent id
    pub agent_id: String,
    /// Score the candidate received
    pub score: f64,
    /// Short human-readable justification
    pub reason: String,
}

/// Immutable record of one routing choice.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingDecision {
    /// Decision id
    pub id: String,
    /// Task being routed
    pub task_id: String,
    /// Chosen agent
    pub selected_agent: String,
    /// Confidence in the choice, in `[0, 1]`
    pub confidence: f64,
    /// Human-readable justification
    pub reason: String,
    /// Strategy that produced the choice
    pub strategy: RoutingStrategy,
    /// Other candidates with their scores
    pub alternatives: Vec<RoutingAlternative>,
    /// When the decision was made
    pub timestamp: DateTime<Utc>,
}

impl RoutingDecision {
    /// Create a decision record with a fresh id.
    pub fn new(
        task_id: impl Into<String>,
        selected_agent: impl Into<String>,
        confidence: f64,
        strategy: RoutingStrategy,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            task_id: task_id.into(),
            selected_agent: selected_agent.into(),
            confidence: confidence.clamp(0.0, 1.0),
            reason: String::new(),
            strategy,
            alternatives: Vec::new(),
            timestamp: Utc::now(),
        }
    }

    /// Set the justification text.
    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = reason.into();
        self
    }

    /// Attach the non-selected candidates.
    pub fn with_alternatives(mut self, alternatives: Vec<RoutingAlternative>) -> Self {
        self.alternatives = alternatives;
        self
    }
}

/// Registry query used by the router's candidate filter.
#[derive(Debug, Clone, Default)]
pub struct CapabilityQuery {
    /// Task type the agent must support
    pub task_type: Option<TaskType>,
    /// Languages the agent must cover entirely
    pub languages: Option<BTreeSet<String>>,
    /// Specializations the agent must cover entirely
    pub specializations: Option<BTreeSet<String>>,
    /// Exclude agents above this utilization
    pub max_utilization: Option<f64>,
    /// Exclude agents below this success rate
    pub min_success_rate: Option<f64>,
}

impl CapabilityQuery {
    /// Query for a single task type.
    pub fn for_task_type(task_type: TaskType) -> Self {
        Self {
            task_type: Some(task_type),
            ..Self::default()
        }
    }
}

/// Observed outcome of an executed routing decision, fed back into the
/// registry and the bandit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingOutcome {
    /// Routing decision this outcome belongs to, if known
    pub decision_id: Option<String>,
    /// Task that was executed
    pub task_id: String,
    /// Agent that executed it
    pub agent_id: String,
    /// Whether execution succeeded
    pub success: bool,
    /// Quality score in `[0, 1]`
    pub quality: f64,
    /// Observed latency in milliseconds
    pub latency_ms: f64,
}
