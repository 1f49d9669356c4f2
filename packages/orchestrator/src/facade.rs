//! Conductor-Orchestrator: Protocol Facade
//!
//! Transport-agnostic request/response shapes for the outward-facing
//! operations: task-spec validation, direct assignment, progress
//! monitoring, and quality-gate verdicts. The server binary maps HTTP onto
//! these; other transports can do the same without touching the core.

use crate::orchestrator::{Orchestrator, OrchestratorError};
use chrono::{DateTime, Utc};
use conductor_core::{AgentCapabilities, Budget, Task, TaskStatus, TaskType};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Instant;
use uuid::Uuid;

/// Incoming task specification.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskSpec {
    /// Task id; generated when absent
    #[serde(default)]
    pub task_id: Option<String>,
    /// Task type string (e.g. "code-editing")
    pub task_type: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub priority: Option<i32>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub languages: Vec<String>,
    #[serde(default)]
    pub specializations: Vec<String>,
    #[serde(default)]
    pub budget_max_files: Option<u32>,
    #[serde(default)]
    pub budget_max_loc: Option<u32>,
}

/// Result of validating a task spec.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationResult {
    pub valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub suggestions: Vec<String>,
    pub duration_ms: f64,
}

/// Rough effort estimate attached to an assignment response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EstimatedEffort {
    pub hours: f64,
    pub confidence: f64,
}

/// Response to a direct assignment request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssignmentResponse {
    pub success: bool,
    pub agent_id: Option<String>,
    pub reason: String,
    pub capabilities_matched: Vec<String>,
    pub estimated_effort: EstimatedEffort,
    pub priority: i32,
}

/// One budget dimension: usage against a limit.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BudgetGauge {
    pub current: u64,
    pub limit: Option<u64>,
    /// Usage fraction of the limit; 0 when no limit is set
    pub pct: f64,
}

impl BudgetGauge {
    fn new(current: u64, limit: Option<u64>) -> Self {
        let pct = match limit {
            Some(limit) if limit > 0 => current as f64 / limit as f64,
            _ => 0.0,
        };
        Self { current, limit, pct }
    }
}

/// File and LOC budget usage.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BudgetUsage {
    pub files: BudgetGauge,
    pub loc: BudgetGauge,
}

/// Progress alert raised against a threshold.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressAlert {
    /// "warning" or "critical"
    pub severity: String,
    pub message: String,
    pub threshold: Option<f64>,
}

/// Time bookkeeping for a monitored task.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TimeTracking {
    pub started_at: Option<DateTime<Utc>>,
    pub elapsed_ms: u64,
    pub deadline: Option<DateTime<Utc>>,
    pub remaining_ms: Option<i64>,
}

/// Progress report for a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressReport {
    pub status: TaskStatus,
    pub budget_usage: BudgetUsage,
    pub alerts: Vec<ProgressAlert>,
    pub acceptance_criteria: Vec<String>,
    pub overall_progress: f64,
    pub time_tracking: TimeTracking,
}

/// A quality gate with its observed result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityGate {
    pub name: String,
    pub passed: bool,
    #[serde(default)]
    pub details: Option<String>,
}

/// Aggregate over the supplied quality gates.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QualityGatesSummary {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub details: Vec<QualityGate>,
}

/// Measured artifacts of an executed task.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ArtifactSummary {
    #[serde(default)]
    pub files_changed: u64,
    #[serde(default)]
    pub loc_changed: u64,
    #[serde(default)]
    pub tests_added: bool,
}

/// Budget compliance of the artifacts against the spec.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BudgetCompliance {
    pub files_within_budget: bool,
    pub loc_within_budget: bool,
    pub waivers_used: Vec<String>,
}

/// Quality-gate verdict for a finished task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerdictResponse {
    /// "approved", "rejected", or "conditional"
    pub decision: String,
    /// 0–100
    pub quality_score: f64,
    pub quality_gates: QualityGatesSummary,
    pub budget_compliance: BudgetCompliance,
    pub recommendations: Vec<String>,
    pub required_actions: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

/// Thresholds for progress alerts.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ProgressThresholds {
    pub warning: f64,
    pub critical: f64,
}

impl Default for ProgressThresholds {
    fn default() -> Self {
        Self {
            warning: 0.8,
            critical: 1.0,
        }
    }
}

impl TaskSpec {
    /// Materialize a [`Task`] from the spec. Assumes `validate` passed.
    pub fn to_task(&self) -> Result<Task, String> {
        let task_type = TaskType::from_str(&self.task_type)?;
        let mut capabilities = AgentCapabilities::for_task_type(task_type);
        for language in &self.languages {
            capabilities.languages.insert(language.clone());
        }
        for specialization in &self.specializations {
            capabilities.specializations.insert(specialization.clone());
        }

        let mut task = Task::new(
            self.task_id
                .clone()
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
            task_type,
        )
        .with_description(self.description.clone().unwrap_or_default())
        .with_priority(self.priority.unwrap_or(0))
        .with_required_capabilities(capabilities);

        if let Some(timeout_ms) = self.timeout_ms {
            task = task.with_timeout_ms(timeout_ms);
        }
        if self.budget_max_files.is_some() || self.budget_max_loc.is_some() {
            task = task.with_budget(Budget {
                max_files: self.budget_max_files,
                max_loc: self.budget_max_loc,
            });
        }
        Ok(task)
    }
}

impl Orchestrator {
    /// Validate a task spec without touching any state.
    pub fn validate_spec(&self, spec: &TaskSpec) -> ValidationResult {
        let started = Instant::now();
        let mut errors = Vec::new();
        let mut warnings = Vec::new();
        let mut suggestions = Vec::new();

        if TaskType::from_str(&spec.task_type).is_err() {
            errors.push(format!("unknown task type '{}'", spec.task_type));
        }
        if let Some(task_id) = &spec.task_id {
            if task_id.trim().is_empty() {
                errors.push("task_id must not be blank".to_string());
            }
        }
        if let Some(timeout_ms) = spec.timeout_ms {
            if timeout_ms == 0 {
                errors.push("timeout_ms must be positive".to_string());
            } else if timeout_ms > 86_400_000 {
                warnings.push("timeout_ms exceeds 24 hours".to_string());
            }
        }
        if spec.budget_max_files == Some(0) || spec.budget_max_loc == Some(0) {
            errors.push("budget limits must be positive".to_string());
        }
        if let Some(priority) = spec.priority {
            if !(-100..=100).contains(&priority) {
                warnings.push(format!("priority {priority} is outside the usual [-100, 100]"));
            }
        }
        if spec.description.as_deref().unwrap_or("").trim().is_empty() {
            warnings.push("description is empty".to_string());
        }
        if spec.languages.is_empty() {
            suggestions.push("declare required languages to narrow routing".to_string());
        }
        if spec.budget_max_loc.is_none() {
            suggestions.push("set a LOC budget to enable budget monitoring".to_string());
        }

        ValidationResult {
            valid: errors.is_empty(),
            errors,
            warnings,
            suggestions,
            duration_ms: started.elapsed().as_secs_f64() * 1_000.0,
        }
    }

    /// Route a spec to an agent immediately and create the assignment.
    pub async fn assign_task(
        &self,
        spec: &TaskSpec,
        priority: Option<i32>,
    ) -> Result<AssignmentResponse, OrchestratorError> {
        let validation = self.validate_spec(spec);
        if !validation.valid {
            return Ok(AssignmentResponse {
                success: false,
                agent_id: None,
                reason: validation.errors.join("; "),
                capabilities_matched: Vec::new(),
                estimated_effort: EstimatedEffort {
                    hours: 0.0,
                    confidence: 0.0,
                },
                priority: priority.unwrap_or(0),
            });
        }

        let mut task = match spec.to_task() {
            Ok(task) => task,
            Err(reason) => {
                return Ok(AssignmentResponse {
                    success: false,
                    agent_id: None,
                    reason,
                    capabilities_matched: Vec::new(),
                    estimated_effort: EstimatedEffort {
                        hours: 0.0,
                        confidence: 0.0,
                    },
                    priority: priority.unwrap_or(0),
                })
            }
        };
        if let Some(priority) = priority {
            task = task.with_priority(priority);
        }

        let decision = match self.router().route_task(&task).await {
            Ok(decision) => decision,
            Err(err) => {
                return Ok(AssignmentResponse {
                    success: false,
                    agent_id: None,
                    reason: err.to_string(),
                    capabilities_matched: Vec::new(),
                    estimated_effort: EstimatedEffort {
                        hours: 0.0,
                        confidence: 0.0,
                    },
                    priority: task.priority,
                })
            }
        };

        let capabilities_matched = match self.registry().get_profile(&decision.selected_agent).await
        {
            Some(profile) => {
                let mut matched: Vec<String> = vec![task.task_type.to_string()];
                if let Some(required) = &task.required_capabilities {
                    matched.extend(
                        required
                            .languages
                            .iter()
                            .filter(|l| profile.capabilities.languages.contains(*l))
                            .cloned(),
                    );
                    matched.extend(
                        required
                            .specializations
                            .iter()
                            .filter(|s| profile.capabilities.specializations.contains(*s))
                            .cloned(),
                    );
                }
                matched
            }
            None => Vec::new(),
        };

        let confidence = decision.confidence;
        let task_priority = task.priority;
        let estimated_effort = EstimatedEffort {
            hours: estimate_effort_hours(&task),
            confidence,
        };
        let agent_id = decision.selected_agent.clone();
        let reason = decision.reason.clone();

        let assignment = self
            .assignments()
            .create_assignment(task, 1, decision)
            .await;
        tracing::debug!(assignment_id = %assignment.id, "direct assignment created");

        Ok(AssignmentResponse {
            success: true,
            agent_id: Some(agent_id),
            reason,
            capabilities_matched,
            estimated_effort,
            priority: task_priority,
        })
    }

    /// Progress and budget report for a task.
    pub async fn monitor_progress(
        &self,
        task_id: &str,
        thresholds: Option<ProgressThresholds>,
    ) -> Option<ProgressReport> {
        let thresholds = thresholds.unwrap_or_default();
        let assignment = self.assignments().get_by_task(task_id).await;
        let state = self.task_status(task_id).await;

        let (status, task, progress, started_at, metadata) = match (&assignment, &state) {
            (Some(assignment), _) => (
                assignment.status,
                assignment.task.clone(),
                assignment.progress,
                assignment.started_at,
                assignment.metadata.clone(),
            ),
            (None, Some(state)) => (
                state.status,
                state.task.clone(),
                if state.status == TaskStatus::Completed {
                    1.0
                } else {
                    0.0
                },
                state.started_at,
                serde_json::Value::Null,
            ),
            (None, None) => return None,
        };

        let files_current = metadata
            .get("files_changed")
            .and_then(|v| v.as_u64())
            .unwrap_or(0);
        let loc_current = metadata
            .get("loc_changed")
            .and_then(|v| v.as_u64())
            .unwrap_or(0);
        let budget = task.budget.unwrap_or_default();
        let budget_usage = BudgetUsage {
            files: BudgetGauge::new(files_current, budget.max_files.map(u64::from)),
            loc: BudgetGauge::new(loc_current, budget.max_loc.map(u64::from)),
        };

        let mut alerts = Vec::new();
        for (label, gauge) in [("files", &budget_usage.files), ("loc", &budget_usage.loc)] {
            if gauge.limit.is_none() {
                continue;
            }
            if gauge.pct >= thresholds.critical {
                alerts.push(ProgressAlert {
                    severity: "critical".to_string(),
                    message: format!("{label} budget exhausted ({:.0}%)", gauge.pct * 100.0),
                    threshold: Some(thresholds.critical),
                });
            } else if gauge.pct >= thresholds.warning {
                alerts.push(ProgressAlert {
                    severity: "warning".to_string(),
                    message: format!("{label} budget at {:.0}%", gauge.pct * 100.0),
                    threshold: Some(thresholds.warning),
                });
            }
        }

        let deadline = assignment.as_ref().map(|a| a.deadline);
        let elapsed_ms = started_at
            .map(|s| (Utc::now() - s).num_milliseconds().max(0) as u64)
            .unwrap_or(0);
        let remaining_ms = deadline.map(|d| (d - Utc::now()).num_milliseconds());
        if matches!(remaining_ms, Some(ms) if ms < 0) {
            alerts.push(ProgressAlert {
                severity: "critical".to_string(),
                message: "assignment deadline passed".to_string(),
                threshold: None,
            });
        }

        let acceptance_criteria = task
            .metadata
            .get("acceptance_criteria")
            .and_then(|v| v.as_array())
            .map(|items| {
                items
                    .iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();

        Some(ProgressReport {
            status,
            budget_usage,
            alerts,
            acceptance_criteria,
            overall_progress: progress,
            time_tracking: TimeTracking {
                started_at,
                elapsed_ms,
                deadline,
                remaining_ms,
            },
        })
    }

    /// Quality-gate verdict over a task's artifacts.
    pub fn generate_task_verdict(
        &self,
        spec: &TaskSpec,
        artifacts: &ArtifactSummary,
        gates: Vec<QualityGate>,
    ) -> VerdictResponse {
        let passed = gates.iter().filter(|g| g.passed).count();
        let failed = gates.len() - passed;
        let gate_ratio = if gates.is_empty() {
            1.0
        } else {
            passed as f64 / gates.len() as f64
        };

        let files_within_budget = spec
            .budget_max_files
            .map(|limit| artifacts.files_changed <= u64::from(limit))
            .unwrap_or(true);
        let loc_within_budget = spec
            .budget_max_loc
            .map(|limit| artifacts.loc_changed <= u64::from(limit))
            .unwrap_or(true);
        let budget_ok = files_within_budget && loc_within_budget;

        let quality_score =
            (gate_ratio * 70.0 + if budget_ok { 30.0 } else { 0.0 }).clamp(0.0, 100.0);

        let decision = if failed == 0 && budget_ok {
            "approved"
        } else if gate_ratio >= 0.5 {
            "conditional"
        } else {
            "rejected"
        };

        let mut recommendations = Vec::new();
        let mut required_actions = Vec::new();
        for gate in gates.iter().filter(|g| !g.passed) {
            recommendations.push(format!("address failing quality gate '{}'", gate.name));
        }
        if !files_within_budget {
            required_actions.push(format!(
                "reduce files changed ({} over the {} limit)",
                artifacts.files_changed,
                spec.budget_max_files.unwrap_or(0)
            ));
        }
        if !loc_within_budget {
            required_actions.push(format!(
                "reduce LOC changed ({} over the {} limit)",
                artifacts.loc_changed,
                spec.budget_max_loc.unwrap_or(0)
            ));
        }
        if !artifacts.tests_added && decision != "approved" {
            recommendations.push("add tests covering the change".to_string());
        }

        VerdictResponse {
            decision: decision.to_string(),
            quality_score,
            quality_gates: QualityGatesSummary {
                total: gates.len(),
                passed,
                failed,
                details: gates,
            },
            budget_compliance: BudgetCompliance {
                files_within_budget,
                loc_within_budget,
                waivers_used: Vec::new(),
            },
            recommendations,
            required_actions,
            timestamp: Utc::now(),
        }
    }
}

/// Coarse effort heuristic from task type and LOC budget.
fn estimate_effort_hours(task: &Task) -> f64 {
    let base = match task.task_type {
        TaskType::CodeEditing => 2.0,
        TaskType::CodeReview => 1.0,
        TaskType::Testing => 1.5,
        TaskType::Documentation => 1.0,
        TaskType::Refactoring => 3.0,
        TaskType::Debugging => 2.5,
        TaskType::Analysis => 1.0,
    };
    let loc_factor = task
        .budget
        .and_then(|b| b.max_loc)
        .map(|loc| (f64::from(loc) / 200.0).max(0.5))
        .unwrap_or(1.0);
    base * loc_factor
}
