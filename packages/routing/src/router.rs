//! Conductor-Routing: Task Router
//!
//! Filters the registry for capable, non-saturated candidates, then picks
//! one either through the bandit or by weighted capability scoring. Every
//! decision is recorded in a bounded history and reflected in the metrics.

use crate::bandit::MultiArmedBandit;
use crate::registry::{AgentRegistry, RegistryError, ScoredAgent};
use crate::types::{
    CapabilityQuery, RoutingAlternative, RoutingDecision, RoutingOutcome, RoutingStrategy,
};
use conductor_core::events::topics;
use conductor_core::{Classify, Event, EventBus, Task};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

/// Router configuration.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Candidate list is truncated to this many agents
    pub max_agents_to_consider: usize,
    /// Routing fails if fewer candidates than this survive the filter
    pub min_agents_required: usize,
    /// Soft routing deadline; exceeding it logs WARN
    pub max_routing_time_ms: u64,
    /// Strategy used when the bandit is enabled
    pub default_strategy: RoutingStrategy,
    /// Whether the bandit participates at all
    pub enable_bandit: bool,
    /// Candidates above this utilization are filtered out
    pub max_utilization: f64,
    /// Candidates below this success rate are filtered out
    pub min_success_rate: f64,
    /// Ring capacity of the decision history
    pub history_capacity: usize,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            max_agents_to_consider: 10,
            min_agents_required: 1,
            max_routing_time_ms: 100,
            default_strategy: RoutingStrategy::MultiArmedBandit,
            enable_bandit: true,
            max_utilization: 90.0,
            min_success_rate: 0.0,
            history_capacity: 1_000,
        }
    }
}

/// Routing errors.
#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    #[error("no agents available for task type '{task_type}'")]
    NoAgents { task_type: String },

    #[error("only {available} agent(s) available, {required} required")]
    InsufficientAgents { available: usize, required: usize },

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

impl conductor_core::Classify for RouterError {
    fn kind(&self) -> conductor_core::ErrorKind {
        match self {
            Self::NoAgents { .. } | Self::InsufficientAgents { .. } => {
                conductor_core::ErrorKind::Precondition
            }
            Self::Registry(err) => err.kind(),
        }
    }
}

/// Router metrics. The routing-time average is an incremental mean.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RouterMetrics {
    pub total_routing_decisions: u64,
    pub average_routing_time_ms: f64,
    pub exploration_count: u64,
    pub exploitation_count: u64,
}

/// Capability-matching and bandit-driven task router.
pub struct TaskRouter {
    config: RouterConfig,
    registry: Arc<AgentRegistry>,
    bandit: Arc<MultiArmedBandit>,
    bus: EventBus,
    history: RwLock<VecDeque<RoutingDecision>>,
    metrics: Mutex<RouterMetrics>,
}

impl TaskRouter {
    /// Create a router over the given registry and bandit.
    pub fn new(
        config: RouterConfig,
        registry: Arc<AgentRegistry>,
        bandit: Arc<MultiArmedBandit>,
        bus: EventBus,
    ) -> Self {
        Self {
            config,
            registry,
            bandit,
            bus,
            history: RwLock::new(VecDeque::new()),
            metrics: Mutex::new(RouterMetrics::default()),
        }
    }

    fn build_query(&self, task: &Task) -> CapabilityQuery {
        let mut query = CapabilityQuery::for_task_type(task.task_type);
        if let Some(required) = &task.required_capabilities {
            if !required.languages.is_empty() {
                query.languages = Some(required.languages.clone());
            }
            if !required.specializations.is_empty() {
                query.specializations = Some(required.specializations.clone());
            }
        }
        query.max_utilization = Some(self.config.max_utilization);
        query.min_success_rate = Some(self.config.min_success_rate);
        query
    }

    /// Route a task to an agent. Fails when no candidate (or too few)
    /// survives the capability/utilization filter.
    pub async fn route_task(&self, task: &Task) -> Result<RoutingDecision, RouterError> {
        let started = Instant::now();

        let query = self.build_query(task);
        let mut candidates = self.registry.get_agents_by_capability(&query).await;
        candidates.truncate(self.config.max_agents_to_consider);

        if candidates.is_empty() {
            return Err(RouterError::NoAgents {
                task_type: task.task_type.to_string(),
            });
        }
        if candidates.len() < self.config.min_agents_required {
            return Err(RouterError::InsufficientAgents {
                available: candidates.len(),
                required: self.config.min_agents_required,
            });
        }

        let decision = if self.config.enable_bandit
            && self.config.default_strategy == RoutingStrategy::MultiArmedBandit
        {
            let ids: Vec<String> = candidates
                .iter()
                .map(|c| c.profile.agent_id.clone())
                .collect();
            // A non-empty slate always yields a selection.
            self.bandit
                .create_routing_decision(&task.task_id, &ids)
                .ok_or_else(|| RouterError::NoAgents {
                    task_type: task.task_type.to_string(),
                })?
        } else {
            Self::capability_match_decision(&task.task_id, &candidates)
        };

        let elapsed_ms = started.elapsed().as_secs_f64() * 1_000.0;
        if elapsed_ms > self.config.max_routing_time_ms as f64 {
            tracing::warn!(
                task_id = %task.task_id,
                elapsed_ms,
                budget_ms = self.config.max_routing_time_ms,
                "routing exceeded its time budget"
            );
        }

        {
            let mut metrics = self.metrics.lock();
            let n = metrics.total_routing_decisions as f64;
            metrics.average_routing_time_ms += (elapsed_ms - metrics.average_routing_time_ms)
                / (n + 1.0);
            metrics.total_routing_decisions += 1;
            // Heuristic: a low-confidence pick counts as exploration.
            if decision.confidence < 0.8 {
                metrics.exploration_count += 1;
            } else {
                metrics.exploitation_count += 1;
            }
        }

        {
            let mut history = self.history.write();
            while history.len() >= self.config.history_capacity {
                history.pop_front();
            }
            history.push_back(decision.clone());
        }

        self.bus
            .emit(
                Event::new(topics::ROUTING_DECIDED, "router")
                    .with_task(task.task_id.clone())
                    .with_agent(decision.selected_agent.clone())
                    .with_metadata(serde_json::json!({
                        "strategy": decision.strategy.as_str(),
                        "confidence": decision.confidence,
                        "candidates": candidates.len(),
                    })),
            )
            .await;

        Ok(decision)
    }

    /// Pick the best candidate by the weighted capability blend. Candidates
    /// arrive pre-sorted by the registry (success rate, then match score).
    fn capability_match_decision(task_id: &str, candidates: &[ScoredAgent]) -> RoutingDecision {
        let selected = &candidates[0];
        let alternatives = candidates[1..]
            .iter()
            .map(|c| RoutingAlternative {
                agent_id: c.profile.agent_id.clone(),
                score: c.match_score,
                reason: format!(
                    "capability score {:.3}, success rate {:.2}",
                    c.match_score, c.profile.performance.success_rate
                ),
            })
            .collect();

        RoutingDecision::new(
            task_id,
            selected.profile.agent_id.clone(),
            selected.match_score,
            RoutingStrategy::CapabilityMatch,
        )
        .with_reason(format!(
            "best capability score {:.3} with success rate {:.2}",
            selected.match_score, selected.profile.performance.success_rate
        ))
        .with_alternatives(alternatives)
    }

    /// Feed an execution outcome back into the registry and the bandit.
    pub async fn record_routing_outcome(
        &self,
        outcome: &RoutingOutcome,
    ) -> Result<(), RouterError> {
        self.registry
            .update_performance(
                &outcome.agent_id,
                outcome.success,
                outcome.quality,
                outcome.latency_ms,
            )
            .await?;
        self.bandit.record_outcome(
            &outcome.agent_id,
            outcome.success,
            outcome.quality,
            outcome.latency_ms,
        );
        Ok(())
    }

    /// Most recent decisions, newest first, up to `limit`.
    pub fn history(&self, limit: usize) -> Vec<RoutingDecision> {
        let history = self.history.read();
        history.iter().rev().take(limit).cloned().collect()
    }

    /// Snapshot of router metrics.
    pub fn metrics(&self) -> RouterMetrics {
        self.metrics.lock().clone()
    }
}
