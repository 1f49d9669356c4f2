//! Conductor Orchestrator Server

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use conductor_arbiter::{ConstitutionalViolation, RuleSet, Verdict};
use conductor_core::{Task, TaskState};
use conductor_orchestrator::{
    ArtifactSummary, AssignmentResponse, Orchestrator, OrchestratorConfig, OrchestratorStats,
    ProgressReport, ProgressThresholds, QualityGate, TaskAssignment, TaskSpec, ValidationResult,
    VerdictResponse,
};
use conductor_routing::{AgentProfile, ModelFamily};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

struct AppState {
    orchestrator: Orchestrator,
    rules: RuleSet,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

#[derive(Debug, Deserialize)]
struct RegisterAgentRequest {
    agent_id: String,
    name: String,
    model_family: String,
    #[serde(default)]
    capabilities: conductor_core::AgentCapabilities,
}

#[derive(Debug, Deserialize)]
struct AssignRequest {
    spec: TaskSpec,
    #[serde(default)]
    priority: Option<i32>,
}

#[derive(Debug, Deserialize)]
struct VerdictRequest {
    spec: TaskSpec,
    #[serde(default)]
    artifacts: ArtifactSummary,
    #[serde(default)]
    quality_gates: Vec<QualityGate>,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

fn error_response(status: StatusCode, err: impl std::fmt::Display) -> (StatusCode, Json<ErrorResponse>) {
    (
        status,
        Json(ErrorResponse {
            error: err.to_string(),
        }),
    )
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut config = OrchestratorConfig::default();
    if let Ok(path) = std::env::var("CONDUCTOR_DB") {
        config.persistence.enabled = true;
        config.persistence.database_path = path;
    }
    if let Ok(path) = std::env::var("CONDUCTOR_ALLOWLIST") {
        config.command_allowlist_path = Some(path);
    }

    let rules = match std::env::var("CONDUCTOR_RULES") {
        Ok(path) => RuleSet::from_file(&path)?,
        Err(_) => RuleSet::default(),
    };

    let orchestrator = Orchestrator::new(config).await?;
    orchestrator.start();
    let state = Arc::new(AppState {
        orchestrator,
        rules,
    });

    let app = Router::new()
        .route("/health", get(health))
        .route("/tasks", post(ingest_task))
        .route("/tasks/process", post(process_next))
        .route("/tasks/{task_id}", get(task_status))
        .route("/agents", post(register_agent).get(list_agents))
        .route("/validate", post(validate))
        .route("/assign", post(assign))
        .route("/progress/{task_id}", get(progress))
        .route("/verdict", post(verdict))
        .route("/violations", post(report_violation))
        .route("/stats", get(stats))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let port = std::env::var("PORT").unwrap_or_else(|_| "3010".to_string());
    let addr = format!("0.0.0.0:{port}");
    tracing::info!("conductor orchestrator listening on http://{addr}");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn ingest_task(
    State(state): State<Arc<AppState>>,
    Json(spec): Json<TaskSpec>,
) -> Result<Json<serde_json::Value>, (StatusCode, Json<ErrorResponse>)> {
    let validation = state.orchestrator.validate_spec(&spec);
    if !validation.valid {
        return Err(error_response(
            StatusCode::BAD_REQUEST,
            validation.errors.join("; "),
        ));
    }
    let task: Task = spec
        .to_task()
        .map_err(|reason| error_response(StatusCode::BAD_REQUEST, reason))?;
    let task_id = task.task_id.clone();

    state
        .orchestrator
        .ingest_task(task)
        .await
        .map_err(|err| error_response(StatusCode::CONFLICT, err))?;
    Ok(Json(serde_json::json!({ "task_id": task_id })))
}

async fn process_next(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Option<TaskAssignment>>, (StatusCode, Json<ErrorResponse>)> {
    state
        .orchestrator
        .process_next()
        .await
        .map(Json)
        .map_err(|err| error_response(StatusCode::CONFLICT, err))
}

async fn task_status(
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<String>,
) -> Result<Json<TaskState>, StatusCode> {
    state
        .orchestrator
        .task_status(&task_id)
        .await
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}

async fn register_agent(
    State(state): State<Arc<AppState>>,
    Json(request): Json<RegisterAgentRequest>,
) -> Result<Json<serde_json::Value>, (StatusCode, Json<ErrorResponse>)> {
    let model_family = ModelFamily::from_str(&request.model_family)
        .map_err(|reason| error_response(StatusCode::BAD_REQUEST, reason))?;
    let profile = AgentProfile::new(request.agent_id, request.name, model_family)
        .with_capabilities(request.capabilities);

    state
        .orchestrator
        .registry()
        .register_agent(profile)
        .await
        .map_err(|err| error_response(StatusCode::CONFLICT, err))?;
    Ok(Json(serde_json::json!({ "registered": true })))
}

async fn list_agents(State(state): State<Arc<AppState>>) -> Json<Vec<AgentProfile>> {
    Json(state.orchestrator.registry().list().await)
}

async fn validate(
    State(state): State<Arc<AppState>>,
    Json(spec): Json<TaskSpec>,
) -> Json<ValidationResult> {
    Json(state.orchestrator.validate_spec(&spec))
}

async fn assign(
    State(state): State<Arc<AppState>>,
    Json(request): Json<AssignRequest>,
) -> Result<Json<AssignmentResponse>, (StatusCode, Json<ErrorResponse>)> {
    state
        .orchestrator
        .assign_task(&request.spec, request.priority)
        .await
        .map(Json)
        .map_err(|err| error_response(StatusCode::INTERNAL_SERVER_ERROR, err))
}

async fn progress(
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<String>,
) -> Result<Json<ProgressReport>, StatusCode> {
    state
        .orchestrator
        .monitor_progress(&task_id, Some(ProgressThresholds::default()))
        .await
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}

async fn verdict(
    State(state): State<Arc<AppState>>,
    Json(request): Json<VerdictRequest>,
) -> Json<VerdictResponse> {
    Json(state.orchestrator.generate_task_verdict(
        &request.spec,
        &request.artifacts,
        request.quality_gates,
    ))
}

async fn report_violation(
    State(state): State<Arc<AppState>>,
    Json(violation): Json<ConstitutionalViolation>,
) -> Result<Json<Verdict>, (StatusCode, Json<ErrorResponse>)> {
    state
        .orchestrator
        .arbitrate(violation, state.rules.rules())
        .await
        .map(Json)
        .map_err(|err| error_response(StatusCode::CONFLICT, err))
}

async fn stats(State(state): State<Arc<AppState>>) -> Json<OrchestratorStats> {
    Json(state.orchestrator.stats().await)
}
