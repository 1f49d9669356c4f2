//! Property tests for the universal invariants.

use conductor_core::{AgentCapabilities, EventBus, Task, TaskType};
use conductor_gate::CommandValidator;
use conductor_orchestrator::{QueueConfig, TaskQueue};
use conductor_routing::{
    AgentProfile, AgentRegistry, BanditConfig, ModelFamily, MultiArmedBandit,
    PerformanceHistory, RegistryConfig, RouterConfig, TaskRouter,
};
use proptest::prelude::*;
use std::sync::Arc;

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("runtime")
}

proptest! {
    /// Depth equals enqueues minus dequeues minus cancellations, and never
    /// goes negative.
    #[test]
    fn queue_depth_consistency(ops in prop::collection::vec(0u8..3, 1..60)) {
        runtime().block_on(async move {
            let queue = TaskQueue::new(QueueConfig::default(), EventBus::default());
            let mut next_id = 0u32;

            for op in ops {
                match op {
                    0 => {
                        next_id += 1;
                        queue
                            .enqueue(Task::new(format!("t-{next_id}"), TaskType::Testing))
                            .await
                            .unwrap();
                    }
                    1 => {
                        queue.dequeue().await;
                    }
                    _ => {
                        queue.clear().await;
                    }
                }
                let stats = queue.stats().await;
                prop_assert_eq!(
                    stats.depth as u64,
                    stats.total_enqueued - stats.total_dequeued - stats.total_canceled
                );
            }
            Ok(())
        })?;
    }

    /// Dequeue order is descending priority, FIFO within a priority.
    #[test]
    fn queue_priority_order(priorities in prop::collection::vec(-20i32..20, 1..40)) {
        runtime().block_on(async move {
            let queue = TaskQueue::new(QueueConfig::default(), EventBus::default());
            for (index, priority) in priorities.iter().enumerate() {
                queue
                    .enqueue(
                        Task::new(format!("t-{index}"), TaskType::Testing)
                            .with_priority(*priority),
                    )
                    .await
                    .unwrap();
            }

            let mut drained: Vec<(i32, usize)> = Vec::new();
            while let Some(state) = queue.dequeue().await {
                let index: usize = state.task.task_id[2..].parse().unwrap();
                drained.push((state.task.priority, index));
            }

            prop_assert_eq!(drained.len(), priorities.len());
            for pair in drained.windows(2) {
                let (p_first, i_first) = pair[0];
                let (p_second, i_second) = pair[1];
                prop_assert!(
                    p_first > p_second || (p_first == p_second && i_first < i_second),
                    "out of order: {:?} before {:?}",
                    pair[0],
                    pair[1]
                );
            }
            Ok(())
        })?;
    }

    /// Incremental performance averages match the arithmetic mean.
    #[test]
    fn performance_running_average(
        outcomes in prop::collection::vec((any::<bool>(), 0.0f64..1.0, 0.0f64..60_000.0), 1..50)
    ) {
        let mut perf = PerformanceHistory::default();
        for (success, quality, latency) in &outcomes {
            perf.record(*success, *quality, *latency);
        }

        let n = outcomes.len() as f64;
        let mean_success =
            outcomes.iter().filter(|(s, _, _)| *s).count() as f64 / n;
        let mean_quality = outcomes.iter().map(|(_, q, _)| q).sum::<f64>() / n;
        let mean_latency = outcomes.iter().map(|(_, _, l)| l).sum::<f64>() / n;

        prop_assert!((perf.success_rate - mean_success).abs() < 1e-6);
        prop_assert!((perf.average_quality - mean_quality).abs() < 1e-6);
        prop_assert!((perf.average_latency_ms - mean_latency).abs() < 1e-6);
        prop_assert_eq!(perf.task_count, outcomes.len() as u64);
    }

    /// Routing selects some agent whenever at least one candidate is below
    /// the utilization cutoff, and fails cleanly otherwise.
    #[test]
    fn routing_liveness(loads in prop::collection::vec(0u32..8, 1..12)) {
        runtime().block_on(async move {
            let bus = EventBus::default();
            let registry = Arc::new(AgentRegistry::new(RegistryConfig::default(), bus.clone()));
            let bandit = Arc::new(MultiArmedBandit::new(BanditConfig::default()));
            let router = TaskRouter::new(
                RouterConfig::default(),
                Arc::clone(&registry),
                bandit,
                bus,
            );

            // max_concurrent defaults to 5, so 5+ active tasks saturate an
            // agent past the 90% utilization cutoff.
            let mut any_available = false;
            for (index, active) in loads.iter().enumerate() {
                let agent = AgentProfile::new(
                    format!("agent-{index}"),
                    format!("Agent {index}"),
                    ModelFamily::Claude,
                )
                .with_capabilities(AgentCapabilities::for_task_type(TaskType::CodeEditing));
                registry.register_agent(agent).await.unwrap();
                registry
                    .update_load(&format!("agent-{index}"), *active, 0)
                    .await
                    .unwrap();
                if *active < 5 {
                    any_available = true;
                }
            }

            let task = Task::new("t-1", TaskType::CodeEditing);
            let result = router.route_task(&task).await;
            prop_assert_eq!(result.is_ok(), any_available);
            Ok(())
        })?;
    }

    /// Arguments containing any forbidden metacharacter are rejected;
    /// clean arguments pass.
    #[test]
    fn allowlist_argument_screening(
        clean in "[a-zA-Z0-9_./=-]{0,40}",
        bad_char in prop::sample::select(vec![";", "|", "&", "`", "$(", "${", "*", "?", "<", ">", "\0"]),
        split in 0usize..40,
    ) {
        let validator = CommandValidator::new(["any"]);

        prop_assert!(validator.validate_arguments(&[clean.clone()]).is_ok());

        let split = split.min(clean.len());
        let tainted = format!("{}{}{}", &clean[..split], bad_char, &clean[split..]);
        prop_assert!(validator.validate_arguments(&[tainted]).is_err());
    }
}
