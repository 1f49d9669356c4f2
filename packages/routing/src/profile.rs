//! Conductor-Routing: Agent Profiles

use chrono::{DateTime, Utc};
use conductor_core::AgentCapabilities;
use serde::{Deserialize, Serialize};

/// Model family behind an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ModelFamily {
    Claude,
    Gpt,
    Gemini,
    Llama,
    Mistral,
    /// Locally hosted or fine-tuned model
    Local,
}

impl ModelFamily {
    /// Stable string form used in persisted rows.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Claude => "claude",
            Self::Gpt => "gpt",
            Self::Gemini => "gemini",
            Self::Llama => "llama",
            Self::Mistral => "mistral",
            Self::Local => "local",
        }
    }
}

impl std::str::FromStr for ModelFamily {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "claude" => Ok(Self::Claude),
            "gpt" => Ok(Self::Gpt),
            "gemini" => Ok(Self::Gemini),
            "llama" => Ok(Self::Llama),
            "mistral" => Ok(Self::Mistral),
            "local" => Ok(Self::Local),
            other => Err(format!("unknown model family '{other}'")),
        }
    }
}

/// Running performance statistics, updated incrementally on every outcome:
/// `new_avg = old_avg + (x - old_avg) / (task_count + 1)`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PerformanceHistory {
    /// Fraction of outcomes that succeeded, in `[0, 1]`
    pub success_rate: f64,
    /// Mean quality score, in `[0, 1]`
    pub average_quality: f64,
    /// Mean latency in milliseconds
    pub average_latency_ms: f64,
    /// Number of recorded outcomes
    pub task_count: u64,
}

impl Default for PerformanceHistory {
    /// Optimistic prior so a fresh agent is worth exploring. The first real
    /// outcome replaces the prior entirely (`task_count` starts at zero).
    fn default() -> Self {
        Self {
            success_rate: 0.8,
            average_quality: 0.7,
            average_latency_ms: 5_000.0,
            task_count: 0,
        }
    }
}

impl PerformanceHistory {
    /// Fold one outcome into the running averages.
    pub fn record(&mut self, success: bool, quality: f64, latency_ms: f64) {
        let n = self.task_count as f64;
        let success_value = if success { 1.0 } else { 0.0 };
        let quality = quality.clamp(0.0, 1.0);
        let latency_ms = latency_ms.max(0.0);

        self.success_rate += (success_value - self.success_rate) / (n + 1.0);
        self.average_quality += (quality - self.average_quality) / (n + 1.0);
        self.average_latency_ms += (latency_ms - self.average_latency_ms) / (n + 1.0);
        self.task_count += 1;
    }
}

/// Current load of an agent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentLoad {
    /// Tasks currently executing
    pub active_tasks: u32,
    /// Tasks waiting on the agent's side
    pub queued_tasks: u32,
    /// `active / max_concurrent * 100`, clamped to `[0, 100]`
    pub utilization_percent: f64,
}

/// Catalog entry for one agent. Owned exclusively by the registry; every
/// read outside the registry is a copy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentProfile {
    /// Unique agent identifier
    pub agent_id: String,
    /// Display name
    pub name: String,
    /// Model family backing the agent
    pub model_family: ModelFamily,
    /// Declared capabilities
    pub capabilities: AgentCapabilities,
    /// Running performance statistics
    pub performance: PerformanceHistory,
    /// Current load
    pub load: AgentLoad,
    /// Registration timestamp
    pub registered_at: DateTime<Utc>,
    /// Last time the agent did anything observable
    pub last_active_at: DateTime<Utc>,
}

impl AgentProfile {
    /// Create a profile with default performance and zero load.
    pub fn new(
        agent_id: impl Into<String>,
        name: impl Into<String>,
        model_family: ModelFamily,
    ) -> Self {
        let now = Utc::now();
        Self {
            agent_id: agent_id.into(),
            name: name.into(),
            model_family,
            capabilities: AgentCapabilities::default(),
            performance: PerformanceHistory::default(),
            load: AgentLoad::default(),
            registered_at: now,
            last_active_at: now,
        }
    }

    /// Set the capability triple.
    pub fn with_capabilities(mut self, capabilities: AgentCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }
}
