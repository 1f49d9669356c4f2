//! End-to-end scenarios across the full control plane.

use conductor_arbiter::{
    Appeal, AppealRuling, ArbitrationConfig, ArbitrationEngine, ArbitrationError,
    ConstitutionalRule, ConstitutionalViolation, RuleCategory, SessionState, Severity,
    VerdictOutcome, WaiverRequest, WaiverStatus,
};
use conductor_core::{AgentCapabilities, EventBus, Task, TaskStatus, TaskType};
use conductor_gate::CommandValidator;
use conductor_orchestrator::{
    AssignmentConfig, Orchestrator, OrchestratorConfig, OrchestratorError, QueueConfig,
};
use conductor_routing::{AgentProfile, ModelFamily, RouterError, RoutingStrategy};
use std::collections::HashMap;
use std::time::Duration;

fn typescript_agent(id: &str) -> AgentProfile {
    AgentProfile::new(id, format!("Agent {id}"), ModelFamily::Claude).with_capabilities(
        AgentCapabilities::for_task_type(TaskType::CodeEditing).with_language("TypeScript"),
    )
}

/// Register, enqueue, route, acknowledge, report progress, complete.
#[tokio::test]
async fn full_pipeline_happy_path() {
    let orchestrator = Orchestrator::new(OrchestratorConfig::default()).await.unwrap();
    orchestrator
        .registry()
        .register_agent(typescript_agent("A"))
        .await
        .unwrap();

    orchestrator
        .ingest_task(
            Task::new("T", TaskType::CodeEditing)
                .with_priority(5)
                .with_required_capabilities(
                    AgentCapabilities::for_task_type(TaskType::CodeEditing)
                        .with_language("TypeScript"),
                ),
        )
        .await
        .unwrap();

    let assignment = orchestrator.process_next().await.unwrap().unwrap();
    assert_eq!(assignment.agent_id, "A");
    assert!(assignment.routing_decision.confidence > 0.0);
    assert!(matches!(
        assignment.routing_decision.strategy,
        RoutingStrategy::MultiArmedBandit
            | RoutingStrategy::CapabilityMatch
            | RoutingStrategy::EpsilonGreedy
    ));

    orchestrator
        .acknowledge_assignment(&assignment.id)
        .await
        .unwrap();
    orchestrator
        .update_progress(&assignment.id, 0.5, None)
        .await
        .unwrap();
    orchestrator.complete_task(&assignment.id, 0.9).await.unwrap();

    let profile = orchestrator.registry().get_profile("A").await.unwrap();
    assert_eq!(profile.performance.task_count, 1);
    assert!((profile.performance.success_rate - 1.0).abs() < f64::EPSILON);

    let stats = orchestrator.stats().await;
    assert_eq!(stats.assignments.completed, 1);
    assert_eq!(stats.assignments.active, 0);
    assert_eq!(
        orchestrator.task_status("T").await.unwrap().status,
        TaskStatus::Completed
    );
}

/// With no agents registered, routing fails and the queue drains anyway.
#[tokio::test]
async fn router_starvation_fails_task() {
    let orchestrator = Orchestrator::new(OrchestratorConfig::default()).await.unwrap();
    orchestrator
        .ingest_task(Task::new("T", TaskType::CodeEditing))
        .await
        .unwrap();

    let result = orchestrator.process_next().await;
    assert!(matches!(
        result,
        Err(OrchestratorError::Router(RouterError::NoAgents { .. }))
    ));

    let stats = orchestrator.stats().await;
    assert_eq!(stats.queue.depth, 0);
    assert_eq!(stats.queue.total_dequeued, 1);
}

/// A queue capped at two rejects the third task.
#[tokio::test]
async fn queue_capacity_rejects_overflow() {
    let config = OrchestratorConfig {
        queue: QueueConfig {
            max_capacity: 2,
            ..QueueConfig::default()
        },
        ..OrchestratorConfig::default()
    };
    let orchestrator = Orchestrator::new(config).await.unwrap();

    orchestrator
        .ingest_task(Task::new("t-1", TaskType::Testing))
        .await
        .unwrap();
    orchestrator
        .ingest_task(Task::new("t-2", TaskType::Testing))
        .await
        .unwrap();

    let third = orchestrator
        .ingest_task(Task::new("t-3", TaskType::Testing))
        .await;
    assert!(third.is_err());
    assert_eq!(orchestrator.queue().depth().await, 2);
}

/// An acknowledged assignment that never reports progress times out.
#[tokio::test]
async fn silent_assignment_times_out() {
    let config = OrchestratorConfig {
        assignment: AssignmentConfig {
            acknowledgment_timeout_ms: 60_000,
            progress_check_interval_ms: 10,
            max_assignment_duration_ms: 30,
        },
        ..OrchestratorConfig::default()
    };
    let orchestrator = Orchestrator::new(config).await.unwrap();
    orchestrator
        .registry()
        .register_agent(typescript_agent("A"))
        .await
        .unwrap();
    orchestrator
        .ingest_task(Task::new("T", TaskType::CodeEditing))
        .await
        .unwrap();

    let assignment = orchestrator.process_next().await.unwrap().unwrap();
    orchestrator
        .acknowledge_assignment(&assignment.id)
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(200)).await;

    let stats = orchestrator.stats().await;
    assert_eq!(stats.assignments.timed_out, 1);
    assert_eq!(stats.assignments.active, 0);
}

/// Rejection, appeal overturn, and two precedents along the way.
#[tokio::test]
async fn rejection_then_appeal_overturn_mints_precedents() {
    let engine = ArbitrationEngine::new(ArbitrationConfig::default(), EventBus::default());

    let rule = ConstitutionalRule::new(
        "no-unreviewed-deploy",
        RuleCategory::Safety,
        "Deploys require review",
        "violation.location == 'deploy'",
        Severity::High,
    );
    let violation =
        ConstitutionalViolation::new("no-unreviewed-deploy", Severity::High, "deploy w/o review")
            .with_location("deploy")
            .with_evidence("ci pipeline log");

    let session_id = engine.start_session(violation).await.unwrap();
    let results = engine.evaluate_rules(&session_id, &[rule]).await.unwrap();
    assert!(results[0].violated);
    assert!((results[0].confidence - 0.95).abs() < 1e-9);

    let verdict = engine.generate_verdict(&session_id).await.unwrap();
    assert_eq!(verdict.outcome, VerdictOutcome::Rejected);
    assert!((verdict.confidence - 0.95).abs() < 1e-9);
    engine.complete_session(&session_id).await.unwrap();
    assert_eq!(engine.precedents().count().await, 1);

    let appeal = Appeal::new(
        &session_id,
        "agent-owner",
        "The flagged pipeline log belonged to a stale run; the attached records show the \
         review was approved before the deploy started, the approver held the release role, \
         and the deploy fell inside a maintenance window published well in advance.",
    )
    .with_new_evidence("review approval record")
    .with_new_evidence("approver role export")
    .with_new_evidence("maintenance window announcement");
    engine.submit_appeal(&session_id, appeal).await.unwrap();

    let decision = engine.review_appeal(&session_id).await.unwrap();
    assert_eq!(decision.ruling, AppealRuling::Overturned);
    assert!(decision.confidence > 0.8);

    let session = engine.get_session(&session_id).await.unwrap();
    assert_eq!(session.state, SessionState::Completed);
    let stats = engine.stats().await;
    assert!(stats.total_precedents >= 2);
}

/// An approved waiver is recorded in session metadata; the same flow
/// fails when waivers are disabled.
#[tokio::test]
async fn waiver_approval_and_disabled_replay() {
    let rule = ConstitutionalRule::new(
        "budget-loc-cap",
        RuleCategory::Budget,
        "Stay within the LOC budget",
        "violation.severity == 'medium'",
        Severity::Medium,
    )
    .waivable();
    let violation = ConstitutionalViolation::new("budget-loc-cap", Severity::Medium, "LOC overrun")
        .with_evidence("diff summary");
    let request = WaiverRequest::new(
        "budget-loc-cap",
        "release-manager",
        "The overrun is entirely generated protocol bindings regenerated in the same \
         change; splitting them into a separate commit would leave the tree non-compiling \
         between commits and block the downstream release train for every dependent team.",
        24 * 60 * 60 * 1_000,
    )
    .with_evidence("diff summary showing generated files")
    .with_evidence("binding generator output");

    let engine = ArbitrationEngine::new(ArbitrationConfig::default(), EventBus::default());
    let session_id = engine.start_session(violation.clone()).await.unwrap();
    engine
        .evaluate_rules(&session_id, std::slice::from_ref(&rule))
        .await
        .unwrap();
    let decision = engine
        .submit_waiver(&session_id, request.clone())
        .await
        .unwrap();
    assert_eq!(decision.status, WaiverStatus::Approved);
    engine.generate_verdict(&session_id).await.unwrap();
    engine.complete_session(&session_id).await.unwrap();

    let session = engine.get_session(&session_id).await.unwrap();
    assert_eq!(session.state, SessionState::Completed);
    assert_eq!(
        session
            .metadata
            .get("waiverDecision")
            .and_then(|d| d.get("status"))
            .and_then(|s| s.as_str()),
        Some("APPROVED")
    );

    // Same inputs, waivers disabled.
    let disabled = ArbitrationEngine::new(
        ArbitrationConfig {
            enable_waivers: false,
            ..ArbitrationConfig::default()
        },
        EventBus::default(),
    );
    let session_id = disabled.start_session(violation).await.unwrap();
    disabled
        .evaluate_rules(&session_id, &[rule])
        .await
        .unwrap();
    assert!(matches!(
        disabled.submit_waiver(&session_id, request).await,
        Err(ArbitrationError::WaiverSystemDisabled)
    ));
}

/// Allowlist, argument screening, and environment sanitization.
#[tokio::test]
async fn command_validator_end_to_end() {
    let validator = CommandValidator::new(["npm"]);

    assert!(validator.is_command_allowed("/usr/bin/npm"));
    assert!(!validator.is_command_allowed("/usr/bin/curl"));

    assert!(validator
        .validate_arguments(&["test".to_string(), "--coverage".to_string()])
        .is_ok());
    assert!(validator
        .validate_arguments(&["test;rm -rf /".to_string()])
        .is_err());

    let env: HashMap<String, String> = [
        ("AWS_SECRET_ACCESS_KEY".to_string(), "x".to_string()),
        ("NODE_ENV".to_string(), "test".to_string()),
    ]
    .into_iter()
    .collect();
    let clean = validator.sanitize_environment(&env);
    assert!(!clean.contains_key("AWS_SECRET_ACCESS_KEY"));
    assert_eq!(clean.get("NODE_ENV").map(String::as_str), Some("test"));
}

/// Persistence round trip: a queued task survives a restart, and an open
/// arbitration session is failed on recovery.
#[tokio::test]
async fn persistence_recovery() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("conductor.db").display().to_string();

    let config = OrchestratorConfig {
        persistence: conductor_orchestrator::PersistenceConfig {
            enabled: true,
            database_path: db_path.clone(),
        },
        ..OrchestratorConfig::default()
    };

    {
        let orchestrator = Orchestrator::new(config.clone()).await.unwrap();
        orchestrator
            .ingest_task(Task::new("t-1", TaskType::Testing).with_priority(3))
            .await
            .unwrap();
        orchestrator
            .registry()
            .register_agent(typescript_agent("A"))
            .await
            .unwrap();
        // Dropped without completing anything: simulated crash.
    }

    let restarted = Orchestrator::new(config).await.unwrap();
    assert_eq!(restarted.queue().depth().await, 1);
    assert_eq!(
        restarted.queue().peek().await.unwrap().task.task_id,
        "t-1"
    );
    assert!(restarted.registry().get_profile("A").await.is_some());
}
