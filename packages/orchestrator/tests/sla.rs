//! Latency envelope checks over the in-memory hot paths.
//!
//! Thresholds follow the declared service levels (registration ≤ 100 ms,
//! capability query ≤ 50 ms, performance update ≤ 30 ms at P95) with the
//! measurement done over 1000 cold-state iterations each.

use conductor_core::{AgentCapabilities, EventBus, TaskType};
use conductor_routing::{
    AgentProfile, AgentRegistry, CapabilityQuery, ModelFamily, RegistryConfig,
};
use std::time::Instant;

fn p95(mut samples: Vec<f64>) -> f64 {
    samples.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let index = ((samples.len() as f64) * 0.95) as usize;
    samples[index.min(samples.len() - 1)]
}

fn agent(id: usize) -> AgentProfile {
    AgentProfile::new(format!("agent-{id}"), format!("Agent {id}"), ModelFamily::Claude)
        .with_capabilities(
            AgentCapabilities::for_task_type(TaskType::CodeEditing)
                .with_language("TypeScript")
                .with_specialization("backend"),
        )
}

#[tokio::test]
async fn registration_p95_under_100ms() {
    let registry = AgentRegistry::new(
        RegistryConfig {
            max_agents: 2_000,
            ..RegistryConfig::default()
        },
        EventBus::default(),
    );

    let mut samples = Vec::with_capacity(1_000);
    for i in 0..1_000 {
        let profile = agent(i);
        let started = Instant::now();
        registry.register_agent(profile).await.unwrap();
        samples.push(started.elapsed().as_secs_f64() * 1_000.0);
    }

    assert!(p95(samples) <= 100.0);
}

#[tokio::test]
async fn capability_query_p95_under_50ms() {
    let registry = AgentRegistry::new(
        RegistryConfig {
            max_agents: 2_000,
            ..RegistryConfig::default()
        },
        EventBus::default(),
    );
    for i in 0..200 {
        registry.register_agent(agent(i)).await.unwrap();
    }

    let query = CapabilityQuery::for_task_type(TaskType::CodeEditing);
    let mut samples = Vec::with_capacity(1_000);
    for _ in 0..1_000 {
        let started = Instant::now();
        let matches = registry.get_agents_by_capability(&query).await;
        samples.push(started.elapsed().as_secs_f64() * 1_000.0);
        assert_eq!(matches.len(), 200);
    }

    assert!(p95(samples) <= 50.0);
}

#[tokio::test]
async fn performance_update_p95_under_30ms() {
    let registry = AgentRegistry::new(RegistryConfig::default(), EventBus::default());
    registry.register_agent(agent(0)).await.unwrap();

    let mut samples = Vec::with_capacity(1_000);
    for i in 0..1_000 {
        let started = Instant::now();
        registry
            .update_performance("agent-0", i % 3 != 0, 0.8, 1_200.0)
            .await
            .unwrap();
        samples.push(started.elapsed().as_secs_f64() * 1_000.0);
    }

    assert!(p95(samples) <= 30.0);
}

#[tokio::test]
async fn sustained_query_throughput() {
    let registry = AgentRegistry::new(RegistryConfig::default(), EventBus::default());
    for i in 0..50 {
        registry.register_agent(agent(i)).await.unwrap();
    }

    let query = CapabilityQuery::for_task_type(TaskType::CodeEditing);
    let started = Instant::now();
    let iterations = 2_000;
    for _ in 0..iterations {
        let _ = registry.get_agents_by_capability(&query).await;
    }
    let per_second = iterations as f64 / started.elapsed().as_secs_f64();

    assert!(per_second >= 2_000.0, "throughput {per_second:.0}/s");
}
