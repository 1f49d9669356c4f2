//! Conductor-Routing: Agent Registry
//!
//! Indexed catalog of agent profiles. The registry is the sole owner of
//! profile state; every read returns a copy and every write goes through a
//! registry operation under the map's write lock, so a registration racing a
//! duplicate loses deterministically.

use crate::profile::{AgentProfile, PerformanceHistory};
use crate::types::CapabilityQuery;
use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use conductor_core::events::topics;
use conductor_core::{Event, EventBus};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

/// Registry configuration.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Maximum number of registered agents
    pub max_agents: usize,
    /// Concurrency ceiling used to compute utilization
    pub max_concurrent_tasks_per_agent: u32,
    /// Whether the stale-agent sweep runs
    pub enable_auto_cleanup: bool,
    /// Sweep period
    pub cleanup_interval_ms: u64,
    /// Agents idle longer than this are evicted
    pub stale_agent_threshold_ms: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            max_agents: 500,
            max_concurrent_tasks_per_agent: 5,
            enable_auto_cleanup: false,
            cleanup_interval_ms: 60_000,
            stale_agent_threshold_ms: 1_800_000,
        }
    }
}

/// Store lookup/persist failure, surfaced by [`AgentStore`] implementations.
#[derive(Debug, thiserror::Error)]
#[error("agent store error: {0}")]
pub struct StoreError(pub String);

/// Persistence hooks the registry can use for lazy loads and write-through.
#[async_trait]
pub trait AgentStore: Send + Sync {
    /// Load one agent row, if present.
    async fn load_agent(&self, agent_id: &str) -> Result<Option<AgentProfile>, StoreError>;
    /// Upsert one agent row.
    async fn save_agent(&self, profile: &AgentProfile) -> Result<(), StoreError>;
    /// Delete one agent row.
    async fn delete_agent(&self, agent_id: &str) -> Result<(), StoreError>;
    /// Load every agent row (startup).
    async fn load_all_agents(&self) -> Result<Vec<AgentProfile>, StoreError>;
}

/// Registry errors.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("agent '{agent_id}' not found")]
    AgentNotFound { agent_id: String },

    #[error("agent '{agent_id}' is already registered")]
    DuplicateAgent { agent_id: String },

    #[error("registry is full ({capacity} agents)")]
    CapacityExceeded { capacity: usize },

    #[error("invalid agent profile: {reason}")]
    InvalidProfile { reason: String },
}

impl conductor_core::Classify for RegistryError {
    fn kind(&self) -> conductor_core::ErrorKind {
        match self {
            Self::AgentNotFound { .. } => conductor_core::ErrorKind::NotFound,
            Self::DuplicateAgent { .. } | Self::InvalidProfile { .. } => {
                conductor_core::ErrorKind::Precondition
            }
            Self::CapacityExceeded { .. } => conductor_core::ErrorKind::Saturation,
        }
    }
}

/// A query match with its capability score.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoredAgent {
    /// Copy of the matched profile
    pub profile: AgentProfile,
    /// Weighted capability/performance score in `[0, 1]`
    pub match_score: f64,
}

/// Registry counters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegistryStats {
    pub total_agents: usize,
    pub total_registered: u64,
    pub total_unregistered: u64,
    pub performance_updates: u64,
    pub evicted_stale: u64,
}

/// Weighted blend of capability coverage and historical success:
/// 0.3 task-type + 0.3 language coverage + 0.2 specialization coverage +
/// 0.2 success rate.
pub fn capability_match_score(profile: &AgentProfile, query: &CapabilityQuery) -> f64 {
    let language_ratio = match &query.languages {
        Some(required) if !required.is_empty() => {
            let matched = required
                .iter()
                .filter(|l| profile.capabilities.languages.contains(*l))
                .count();
            matched as f64 / required.len() as f64
        }
        _ => 1.0,
    };
    let specialization_ratio = match &query.specializations {
        Some(required) if !required.is_empty() => {
            let matched = required
                .iter()
                .filter(|s| profile.capabilities.specializations.contains(*s))
                .count();
            matched as f64 / required.len() as f64
        }
        _ => 1.0,
    };

    0.3 + 0.3 * language_ratio + 0.2 * specialization_ratio + 0.2 * profile.performance.success_rate
}

/// Indexed map `agent_id → AgentProfile`.
pub struct AgentRegistry {
    config: RegistryConfig,
    agents: Arc<RwLock<HashMap<String, AgentProfile>>>,
    store: Option<Arc<dyn AgentStore>>,
    bus: EventBus,
    total_registered: AtomicU64,
    total_unregistered: AtomicU64,
    performance_updates: AtomicU64,
    evicted_stale: AtomicU64,
}

impl AgentRegistry {
    /// Create a registry publishing lifecycle events on `bus`.
    pub fn new(config: RegistryConfig, bus: EventBus) -> Self {
        Self {
            config,
            agents: Arc::new(RwLock::new(HashMap::new())),
            store: None,
            bus,
            total_registered: AtomicU64::new(0),
            total_unregistered: AtomicU64::new(0),
            performance_updates: AtomicU64::new(0),
            evicted_stale: AtomicU64::new(0),
        }
    }

    /// Attach a persistence store for lazy loads and write-through.
    pub fn with_store(mut self, store: Arc<dyn AgentStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Replace the in-memory map from the store (startup).
    pub async fn load_from_store(&self) -> Result<usize, StoreError> {
        let Some(store) = &self.store else {
            return Ok(0);
        };
        let profiles = store.load_all_agents().await?;
        let mut agents = self.agents.write().await;
        let count = profiles.len();
        for profile in profiles {
            agents.insert(profile.agent_id.clone(), profile);
        }
        tracing::info!(count, "agent registry reloaded from store");
        Ok(count)
    }

    /// Register a new agent. Rejects duplicates, invalid profiles, and
    /// registration beyond capacity.
    pub async fn register_agent(&self, profile: AgentProfile) -> Result<(), RegistryError> {
        if profile.agent_id.trim().is_empty() {
            return Err(RegistryError::InvalidProfile {
                reason: "agent_id is empty".to_string(),
            });
        }
        if profile.name.trim().is_empty() {
            return Err(RegistryError::InvalidProfile {
                reason: "name is empty".to_string(),
            });
        }
        if profile.capabilities.task_types.is_empty() {
            return Err(RegistryError::InvalidProfile {
                reason: "no task types declared".to_string(),
            });
        }

        let agent_id = profile.agent_id.clone();
        {
            let mut agents = self.agents.write().await;
            if agents.contains_key(&agent_id) {
                return Err(RegistryError::DuplicateAgent { agent_id });
            }
            if agents.len() >= self.config.max_agents {
                return Err(RegistryError::CapacityExceeded {
                    capacity: self.config.max_agents,
                });
            }
            agents.insert(agent_id.clone(), profile.clone());
        }

        self.total_registered.fetch_add(1, Ordering::Relaxed);
        tracing::info!(agent_id = %agent_id, name = %profile.name, "agent registered");

        if let Some(store) = &self.store {
            if let Err(err) = store.save_agent(&profile).await {
                tracing::warn!(agent_id = %agent_id, error = %err, "agent write-through failed");
            }
        }

        self.bus
            .emit(
                Event::new(topics::AGENT_REGISTERED, "registry")
                    .with_agent(agent_id)
                    .with_metadata(serde_json::json!({
                        "model_family": profile.model_family.as_str(),
                        "task_types": profile.capabilities.task_types,
                    })),
            )
            .await;
        Ok(())
    }

    /// Copy of a profile. With a store attached, a miss falls back to the
    /// store and caches the row.
    pub async fn get_profile(&self, agent_id: &str) -> Option<AgentProfile> {
        if let Some(profile) = self.agents.read().await.get(agent_id) {
            return Some(profile.clone());
        }

        let store = self.store.as_ref()?;
        match store.load_agent(agent_id).await {
            Ok(Some(profile)) => {
                let mut agents = self.agents.write().await;
                agents
                    .entry(agent_id.to_string())
                    .or_insert_with(|| profile.clone());
                Some(profile)
            }
            Ok(None) => None,
            Err(err) => {
                tracing::warn!(agent_id, error = %err, "store lookup failed");
                None
            }
        }
    }

    /// Agents matching the query, scored and sorted best-first: success rate
    /// (differences above 0.01) first, then capability score.
    pub async fn get_agents_by_capability(&self, query: &CapabilityQuery) -> Vec<ScoredAgent> {
        let agents = self.agents.read().await;
        let mut matches: Vec<ScoredAgent> = agents
            .values()
            .filter(|profile| {
                if let Some(task_type) = query.task_type {
                    if !profile.capabilities.task_types.contains(&task_type) {
                        return false;
                    }
                }
                if let Some(languages) = &query.languages {
                    if !languages.is_subset(&profile.capabilities.languages) {
                        return false;
                    }
                }
                if let Some(specializations) = &query.specializations {
                    if !specializations.is_subset(&profile.capabilities.specializations) {
                        return false;
                    }
                }
                if let Some(max_utilization) = query.max_utilization {
                    if profile.load.utilization_percent > max_utilization {
                        return false;
                    }
                }
                if let Some(min_success_rate) = query.min_success_rate {
                    if profile.performance.success_rate < min_success_rate {
                        return false;
                    }
                }
                true
            })
            .map(|profile| ScoredAgent {
                match_score: capability_match_score(profile, query),
                profile: profile.clone(),
            })
            .collect();

        matches.sort_by(|a, b| {
            let rate_diff = b.profile.performance.success_rate - a.profile.performance.success_rate;
            if rate_diff.abs() > 0.01 {
                return rate_diff
                    .partial_cmp(&0.0)
                    .unwrap_or(std::cmp::Ordering::Equal);
            }
            b.match_score
                .partial_cmp(&a.match_score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        matches
    }

    /// Fold one observed outcome into an agent's running statistics.
    pub async fn update_performance(
        &self,
        agent_id: &str,
        success: bool,
        quality: f64,
        latency_ms: f64,
    ) -> Result<PerformanceHistory, RegistryError> {
        let performance = {
            let mut agents = self.agents.write().await;
            let profile = agents
                .get_mut(agent_id)
                .ok_or_else(|| RegistryError::AgentNotFound {
                    agent_id: agent_id.to_string(),
                })?;
            profile.performance.record(success, quality, latency_ms);
            profile.last_active_at = Utc::now();
            profile.performance
        };

        self.performance_updates.fetch_add(1, Ordering::Relaxed);
        self.bus
            .emit(
                Event::new(topics::AGENT_PERFORMANCE_UPDATED, "registry")
                    .with_agent(agent_id)
                    .with_metadata(serde_json::json!({
                        "success": success,
                        "success_rate": performance.success_rate,
                        "task_count": performance.task_count,
                    })),
            )
            .await;

        if let Some(store) = &self.store {
            if let Some(profile) = self.agents.read().await.get(agent_id).cloned() {
                if let Err(err) = store.save_agent(&profile).await {
                    tracing::warn!(agent_id, error = %err, "performance write-through failed");
                }
            }
        }
        Ok(performance)
    }

    /// Recompute an agent's load and utilization.
    pub async fn update_load(
        &self,
        agent_id: &str,
        active_tasks: u32,
        queued_tasks: u32,
    ) -> Result<(), RegistryError> {
        let mut agents = self.agents.write().await;
        let profile = agents
            .get_mut(agent_id)
            .ok_or_else(|| RegistryError::AgentNotFound {
                agent_id: agent_id.to_string(),
            })?;
        profile.load.active_tasks = active_tasks;
        profile.load.queued_tasks = queued_tasks;
        profile.load.utilization_percent = (active_tasks as f64
            / self.config.max_concurrent_tasks_per_agent.max(1) as f64
            * 100.0)
            .min(100.0);
        profile.last_active_at = Utc::now();
        Ok(())
    }

    /// Remove an agent, returning its final profile.
    pub async fn unregister_agent(&self, agent_id: &str) -> Result<AgentProfile, RegistryError> {
        let profile = {
            let mut agents = self.agents.write().await;
            agents
                .remove(agent_id)
                .ok_or_else(|| RegistryError::AgentNotFound {
                    agent_id: agent_id.to_string(),
                })?
        };

        self.total_unregistered.fetch_add(1, Ordering::Relaxed);
        tracing::info!(agent_id, "agent unregistered");

        if let Some(store) = &self.store {
            if let Err(err) = store.delete_agent(agent_id).await {
                tracing::warn!(agent_id, error = %err, "agent delete write-through failed");
            }
        }

        self.bus
            .emit(Event::new(topics::AGENT_UNREGISTERED, "registry").with_agent(agent_id))
            .await;
        Ok(profile)
    }

    /// Evict agents idle beyond the staleness threshold. Returns the ids of
    /// evicted agents.
    pub async fn evict_stale(&self) -> Vec<String> {
        let cutoff =
            Utc::now() - ChronoDuration::milliseconds(self.config.stale_agent_threshold_ms as i64);
        let stale: Vec<String> = {
            let agents = self.agents.read().await;
            agents
                .values()
                .filter(|p| p.last_active_at < cutoff)
                .map(|p| p.agent_id.clone())
                .collect()
        };

        for agent_id in &stale {
            {
                let mut agents = self.agents.write().await;
                agents.remove(agent_id);
            }
            self.evicted_stale.fetch_add(1, Ordering::Relaxed);
            tracing::info!(agent_id, "stale agent evicted");
            self.bus
                .emit(
                    Event::new(topics::AGENT_UNREGISTERED, "registry")
                        .with_agent(agent_id.clone())
                        .with_metadata(serde_json::json!({ "reason": "stale" })),
                )
                .await;
        }
        stale
    }

    /// Spawn the periodic stale-agent sweep if enabled.
    pub fn spawn_cleanup_sweep(self: &Arc<Self>) -> Option<tokio::task::JoinHandle<()>> {
        if !self.config.enable_auto_cleanup {
            return None;
        }
        let registry = Arc::clone(self);
        let period = Duration::from_millis(registry.config.cleanup_interval_ms.max(1));
        Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                registry.evict_stale().await;
            }
        }))
    }

    /// Copies of every registered profile.
    pub async fn list(&self) -> Vec<AgentProfile> {
        self.agents.read().await.values().cloned().collect()
    }

    /// Number of registered agents.
    pub async fn count(&self) -> usize {
        self.agents.read().await.len()
    }

    /// Snapshot of registry counters.
    pub async fn stats(&self) -> RegistryStats {
        RegistryStats {
            total_agents: self.count().await,
            total_registered: self.total_registered.load(Ordering::Relaxed),
            total_unregistered: self.total_unregistered.load(Ordering::Relaxed),
            performance_updates: self.performance_updates.load(Ordering::Relaxed),
            evicted_stale: self.evicted_stale.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::ModelFamily;
    use conductor_core::{AgentCapabilities, TaskType};

    fn profile(id: &str) -> AgentProfile {
        AgentProfile::new(id, format!("Agent {id}"), ModelFamily::Claude).with_capabilities(
            AgentCapabilities::for_task_type(TaskType::CodeEditing).with_language("TypeScript"),
        )
    }

    fn registry() -> AgentRegistry {
        AgentRegistry::new(RegistryConfig::default(), EventBus::default())
    }

    #[tokio::test]
    async fn test_register_and_get() {
        let registry = registry();
        registry.register_agent(profile("a-1")).await.unwrap();

        let copy = registry.get_profile("a-1").await.unwrap();
        assert_eq!(copy.agent_id, "a-1");
        assert_eq!(registry.count().await, 1);
    }

    #[tokio::test]
    async fn test_duplicate_rejected() {
        let registry = registry();
        registry.register_agent(profile("a-1")).await.unwrap();
        let result = registry.register_agent(profile("a-1")).await;
        assert!(matches!(result, Err(RegistryError::DuplicateAgent { .. })));
    }

    #[tokio::test]
    async fn test_invalid_profile_rejected() {
        let registry = registry();
        let empty_caps = AgentProfile::new("a-1", "Agent", ModelFamily::Gpt);
        assert!(matches!(
            registry.register_agent(empty_caps).await,
            Err(RegistryError::InvalidProfile { .. })
        ));
    }

    #[tokio::test]
    async fn test_capacity() {
        let registry = AgentRegistry::new(
            RegistryConfig {
                max_agents: 1,
                ..RegistryConfig::default()
            },
            EventBus::default(),
        );
        registry.register_agent(profile("a-1")).await.unwrap();
        assert!(matches!(
            registry.register_agent(profile("a-2")).await,
            Err(RegistryError::CapacityExceeded { .. })
        ));
    }

    #[tokio::test]
    async fn test_capability_query_filters() {
        let registry = registry();
        registry.register_agent(profile("a-1")).await.unwrap();
        registry
            .register_agent(
                AgentProfile::new("a-2", "Agent 2", ModelFamily::Gpt).with_capabilities(
                    AgentCapabilities::for_task_type(TaskType::Testing).with_language("Rust"),
                ),
            )
            .await
            .unwrap();

        let matches = registry
            .get_agents_by_capability(&CapabilityQuery::for_task_type(TaskType::CodeEditing))
            .await;
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].profile.agent_id, "a-1");

        let mut query = CapabilityQuery::for_task_type(TaskType::CodeEditing);
        query.languages = Some(["Python".to_string()].into_iter().collect());
        assert!(registry.get_agents_by_capability(&query).await.is_empty());
    }

    #[tokio::test]
    async fn test_query_excludes_overloaded() {
        let registry = registry();
        registry.register_agent(profile("a-1")).await.unwrap();
        registry.update_load("a-1", 5, 0).await.unwrap();

        let mut query = CapabilityQuery::for_task_type(TaskType::CodeEditing);
        query.max_utilization = Some(90.0);
        assert!(registry.get_agents_by_capability(&query).await.is_empty());
    }

    #[tokio::test]
    async fn test_performance_update() {
        let registry = registry();
        registry.register_agent(profile("a-1")).await.unwrap();

        let perf = registry
            .update_performance("a-1", true, 0.9, 1_200.0)
            .await
            .unwrap();
        assert_eq!(perf.task_count, 1);
        assert!((perf.success_rate - 1.0).abs() < f64::EPSILON);

        let missing = registry.update_performance("ghost", true, 0.5, 10.0).await;
        assert!(matches!(missing, Err(RegistryError::AgentNotFound { .. })));
    }

    #[tokio::test]
    async fn test_utilization_computation() {
        let registry = registry();
        registry.register_agent(profile("a-1")).await.unwrap();
        registry.update_load("a-1", 2, 3).await.unwrap();

        let copy = registry.get_profile("a-1").await.unwrap();
        assert!((copy.load.utilization_percent - 40.0).abs() < f64::EPSILON);
        assert_eq!(copy.load.queued_tasks, 3);
    }

    #[tokio::test]
    async fn test_copy_on_read() {
        let registry = registry();
        registry.register_agent(profile("a-1")).await.unwrap();

        let mut copy = registry.get_profile("a-1").await.unwrap();
        copy.name = "mutated".to_string();

        assert_eq!(registry.get_profile("a-1").await.unwrap().name, "Agent a-1");
    }

    #[tokio::test]
    async fn test_evict_stale() {
        let registry = AgentRegistry::new(
            RegistryConfig {
                stale_agent_threshold_ms: 0,
                ..RegistryConfig::default()
            },
            EventBus::default(),
        );
        registry.register_agent(profile("a-1")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;

        let evicted = registry.evict_stale().await;
        assert_eq!(evicted, vec!["a-1".to_string()]);
        assert_eq!(registry.count().await, 0);
    }
}
