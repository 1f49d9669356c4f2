//! Conductor-Routing: Multi-Armed Bandit
//!
//! ε-greedy selection with optional UCB bonus over the candidate agents.
//! The exploration rate decays per selection toward a floor; agents with
//! fewer than `min_sample_size` pulls receive the full exploration bonus so
//! every arm gets coverage before exploitation settles in.

use crate::types::{RoutingAlternative, RoutingDecision, RoutingStrategy};
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Bandit configuration.
#[derive(Debug, Clone)]
pub struct BanditConfig {
    /// Initial probability of a random (exploration) pick
    pub exploration_rate: f64,
    /// Multiplier applied to the exploration rate after each selection
    pub decay_factor: f64,
    /// Exploration rate floor
    pub min_exploration: f64,
    /// Whether the UCB bonus is added to the exploit score
    pub use_ucb: bool,
    /// UCB bonus scale
    pub ucb_constant: f64,
    /// Pull count below which an arm gets the full exploration bonus
    pub min_sample_size: u64,
    /// Latency normalization ceiling for the reward formula
    pub max_latency_ms: f64,
}

impl Default for BanditConfig {
    fn default() -> Self {
        Self {
            exploration_rate: 0.1,
            decay_factor: 0.995,
            min_exploration: 0.01,
            use_ucb: true,
            ucb_constant: 2.0,
            min_sample_size: 5,
            max_latency_ms: 30_000.0,
        }
    }
}

/// Per-agent arm state.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
struct ArmState {
    pulls: u64,
    reward_sum: f64,
    quality_sum: f64,
    latency_sum: f64,
}

impl ArmState {
    fn mean_reward(&self) -> f64 {
        self.reward_sum / self.pulls.max(1) as f64
    }
}

/// Bandit counters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BanditStats {
    pub arms: usize,
    pub total_selections: u64,
    pub explorations: u64,
    pub exploitations: u64,
    pub current_exploration_rate: f64,
}

/// ε-greedy + UCB bandit over agent ids.
pub struct MultiArmedBandit {
    config: BanditConfig,
    arms: RwLock<HashMap<String, ArmState>>,
    exploration_rate: Mutex<f64>,
    counters: Mutex<(u64, u64, u64)>,
}

impl MultiArmedBandit {
    /// Create a bandit with the given configuration.
    pub fn new(config: BanditConfig) -> Self {
        let exploration_rate = config.exploration_rate;
        Self {
            config,
            arms: RwLock::new(HashMap::new()),
            exploration_rate: Mutex::new(exploration_rate),
            counters: Mutex::new((0, 0, 0)),
        }
    }

    /// Score every candidate: exploit mean plus (optionally) the UCB bonus.
    /// `total_pulls` is the pull sum across the candidate set.
    fn score_candidates(&self, candidates: &[String]) -> Vec<(String, f64)> {
        let arms = self.arms.read();
        let total_pulls: u64 = candidates
            .iter()
            .map(|id| arms.get(id).map(|a| a.pulls).unwrap_or(0))
            .sum();
        let ln_total = (total_pulls.max(1) as f64).ln();

        candidates
            .iter()
            .map(|id| {
                let arm = arms.get(id).copied().unwrap_or_default();
                let mean = arm.mean_reward();
                let bonus = if !self.config.use_ucb {
                    0.0
                } else if arm.pulls < self.config.min_sample_size {
                    // Full bonus guarantees coverage of under-sampled arms.
                    self.config.ucb_constant
                } else {
                    self.config.ucb_constant * (ln_total / arm.pulls as f64).sqrt()
                };
                (id.clone(), mean + bonus)
            })
            .collect()
    }

    /// Pick an agent from `candidates`, exploring with the current ε.
    /// Returns `(agent_id, score, explored)`; `None` on an empty slate.
    pub fn select(&self, candidates: &[String]) -> Option<(String, f64, bool)> {
        if candidates.is_empty() {
            return None;
        }

        let epsilon = {
            let mut rate = self.exploration_rate.lock();
            let current = *rate;
            *rate = (current * self.config.decay_factor).max(self.config.min_exploration);
            current
        };

        let scores = self.score_candidates(candidates);
        let explore = rand::thread_rng().gen::<f64>() < epsilon;

        let (selected, score) = if explore {
            let index = rand::thread_rng().gen_range(0..candidates.len());
            scores[index].clone()
        } else {
            scores
                .iter()
                .cloned()
                .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))?
        };

        {
            let mut counters = self.counters.lock();
            counters.0 += 1;
            if explore {
                counters.1 += 1;
            } else {
                counters.2 += 1;
            }
        }

        Some((selected, score, explore))
    }

    /// Build a full routing decision: selection, confidence relative to the
    /// best-scored candidate, and a per-candidate alternatives list.
    pub fn create_routing_decision(
        &self,
        task_id: &str,
        candidates: &[String],
    ) -> Option<RoutingDecision> {
        let (selected, selected_score, explored) = self.select(candidates)?;
        let scores = self.score_candidates(candidates);
        let best_score = scores
            .iter()
            .map(|(_, s)| *s)
            .fold(f64::MIN, f64::max)
            .max(f64::EPSILON);
        let confidence = (selected_score / best_score).clamp(0.0, 1.0);

        let arms = self.arms.read();
        let alternatives: Vec<RoutingAlternative> = scores
            .iter()
            .filter(|(id, _)| *id != selected)
            .map(|(id, score)| {
                let arm = arms.get(id).copied().unwrap_or_default();
                RoutingAlternative {
                    agent_id: id.clone(),
                    score: *score,
                    reason: format!(
                        "mean reward {:.3} over {} pulls",
                        arm.mean_reward(),
                        arm.pulls
                    ),
                }
            })
            .collect();
        drop(arms);

        let strategy = if explored {
            RoutingStrategy::EpsilonGreedy
        } else {
            RoutingStrategy::MultiArmedBandit
        };
        let reason = if explored {
            format!("exploration draw among {} candidates", candidates.len())
        } else {
            format!(
                "highest bandit score {selected_score:.3} among {} candidates",
                candidates.len()
            )
        };

        Some(
            RoutingDecision::new(task_id, selected, confidence, strategy)
                .with_reason(reason)
                .with_alternatives(alternatives),
        )
    }

    /// Fold an observed outcome into the selected arm:
    /// `reward = success*0.6 + quality*0.3 + (1 - latency/max)*0.1`.
    pub fn record_outcome(&self, agent_id: &str, success: bool, quality: f64, latency_ms: f64) {
        let latency_term = 1.0 - (latency_ms / self.config.max_latency_ms).clamp(0.0, 1.0);
        let reward = if success { 0.6 } else { 0.0 } + quality.clamp(0.0, 1.0) * 0.3
            + latency_term * 0.1;

        let mut arms = self.arms.write();
        let arm = arms.entry(agent_id.to_string()).or_default();
        arm.pulls += 1;
        arm.reward_sum += reward;
        arm.quality_sum += quality.clamp(0.0, 1.0);
        arm.latency_sum += latency_ms.max(0.0);
    }

    /// Snapshot of bandit counters.
    pub fn stats(&self) -> BanditStats {
        let counters = self.counters.lock();
        BanditStats {
            arms: self.arms.read().len(),
            total_selections: counters.0,
            explorations: counters.1,
            exploitations: counters.2,
            current_exploration_rate: *self.exploration_rate.lock(),
        }
    }
}

impl Default for MultiArmedBandit {
    fn default() -> Self {
        Self::new(BanditConfig::default())
    }
}
