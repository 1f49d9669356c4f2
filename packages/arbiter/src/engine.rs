//! Conductor-Arbiter: Arbitration Engine
//!
//! Owns every arbitration session and drives it through the state machine:
//!
//! ```text
//! RULE_EVALUATION → VERDICT_GENERATION → (WAIVER_CONSIDERATION) → COMPLETED
//!                                              COMPLETED → APPEAL_PENDING → COMPLETED
//!                        any non-terminal → FAILED
//! ```
//!
//! Sessions are isolated: each is serialized behind its own mutex, and a
//! fault inside one session (a throwing condition, corrupt metadata, a
//! missing violator) never touches another session's state.

use crate::appeal::AppealArbitrator;
use crate::condition::evaluate_condition;
use crate::precedent::PrecedentManager;
use crate::types::{
    Appeal, AppealDecision, AppealRuling, ArbitrationSession, ConstitutionalRule,
    ConstitutionalViolation, ReasoningStep, RuleActivity, RuleEvaluationResult, SessionState,
    StateTransition, Verdict, VerdictOutcome, WaiverDecision, WaiverRequest, WaiverStatus,
};
use crate::waiver::WaiverInterpreter;
use chrono::Utc;
use conductor_core::events::topics;
use conductor_core::{Event, EventBus, EventSeverity};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

/// Verdicts above this confidence become precedents.
const PRECEDENT_CONFIDENCE_THRESHOLD: f64 = 0.8;

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct ArbitrationConfig {
    /// Cap on concurrently active (non-terminal) sessions
    pub max_concurrent_sessions: usize,
    /// Sessions older than this are failed by the timeout sweep
    pub session_timeout_ms: u64,
    /// Whether waiver submission is accepted
    pub enable_waivers: bool,
    /// Whether appeal submission is accepted
    pub enable_appeals: bool,
    /// `issued_by` stamped onto verdicts
    pub issued_by: String,
}

impl Default for ArbitrationConfig {
    fn default() -> Self {
        Self {
            max_concurrent_sessions: 100,
            session_timeout_ms: 300_000,
            enable_waivers: true,
            enable_appeals: true,
            issued_by: "conductor-arbiter".to_string(),
        }
    }
}

/// Arbitration errors.
#[derive(Debug, thiserror::Error)]
pub enum ArbitrationError {
    #[error("session '{session_id}' not found")]
    SessionNotFound { session_id: String },

    #[error("session '{session_id}': invalid transition {from:?} → {to:?}")]
    InvalidStateTransition {
        session_id: String,
        from: SessionState,
        to: SessionState,
    },

    #[error("arbitration saturated: {active} active sessions (limit {limit})")]
    Saturation { active: usize, limit: usize },

    #[error("waiver system is disabled")]
    WaiverSystemDisabled,

    #[error("appeal system is disabled")]
    AppealSystemDisabled,

    #[error("session '{session_id}' has no verdict to appeal")]
    NoVerdict { session_id: String },

    #[error("session '{session_id}' has no pending appeal")]
    NoAppeal { session_id: String },
}

impl conductor_core::Classify for ArbitrationError {
    fn kind(&self) -> conductor_core::ErrorKind {
        match self {
            Self::SessionNotFound { .. } => conductor_core::ErrorKind::NotFound,
            Self::Saturation { .. } => conductor_core::ErrorKind::Saturation,
            _ => conductor_core::ErrorKind::Precondition,
        }
    }
}

/// Engine counters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ArbitrationStats {
    pub total_sessions: u64,
    pub active_sessions: usize,
    pub completed_sessions: u64,
    pub failed_sessions: u64,
    pub verdicts_issued: u64,
    pub waivers_approved: u64,
    pub waivers_rejected: u64,
    pub appeals_upheld: u64,
    pub appeals_overturned: u64,
    pub appeals_remanded: u64,
    pub total_precedents: usize,
}

#[derive(Debug, Default)]
struct Counters {
    total_sessions: u64,
    completed_sessions: u64,
    failed_sessions: u64,
    verdicts_issued: u64,
    waivers_approved: u64,
    waivers_rejected: u64,
    appeals_upheld: u64,
    appeals_overturned: u64,
    appeals_remanded: u64,
}

/// The arbitration engine.
pub struct ArbitrationEngine {
    config: ArbitrationConfig,
    sessions: RwLock<HashMap<String, Arc<Mutex<ArbitrationSession>>>>,
    precedents: Arc<PrecedentManager>,
    waiver_interpreter: WaiverInterpreter,
    appeal_arbitrator: AppealArbitrator,
    bus: EventBus,
    active: AtomicUsize,
    counters: parking_lot::Mutex<Counters>,
}

impl ArbitrationEngine {
    /// Create an engine publishing events on `bus`.
    pub fn new(config: ArbitrationConfig, bus: EventBus) -> Self {
        Self {
            config,
            sessions: RwLock::new(HashMap::new()),
            precedents: Arc::new(PrecedentManager::default()),
            waiver_interpreter: WaiverInterpreter::default(),
            appeal_arbitrator: AppealArbitrator::default(),
            bus,
            active: AtomicUsize::new(0),
            counters: parking_lot::Mutex::new(Counters::default()),
        }
    }

    /// Replace the precedent manager (e.g. with one sharing global config).
    pub fn with_precedents(mut self, precedents: Arc<PrecedentManager>) -> Self {
        self.precedents = precedents;
        self
    }

    /// The precedent store.
    pub fn precedents(&self) -> Arc<PrecedentManager> {
        Arc::clone(&self.precedents)
    }

    /// Apply a state transition if the state machine allows it, recording it
    /// in `metadata.stateTransitions`. The session is left untouched on a
    /// rejected transition.
    fn apply_transition(
        session: &mut ArbitrationSession,
        to: SessionState,
        reason: &str,
    ) -> Result<(), ArbitrationError> {
        use SessionState::*;
        let from = session.state;
        let valid = matches!(
            (from, to),
            (RuleEvaluation, VerdictGeneration)
                | (VerdictGeneration, WaiverConsideration)
                | (VerdictGeneration, Completed)
                | (WaiverConsideration, Completed)
                | (Completed, AppealPending)
                | (AppealPending, Completed)
        ) || (to == Failed && !from.is_terminal());

        if !valid {
            return Err(ArbitrationError::InvalidStateTransition {
                session_id: session.session_id.clone(),
                from,
                to,
            });
        }

        let now = Utc::now();
        session.state = to;
        session.end_time = to.is_terminal().then_some(now);
        let transition = StateTransition {
            from,
            to,
            at: now,
            reason: reason.to_string(),
        };
        session.append_metadata(
            "stateTransitions",
            serde_json::to_value(&transition).unwrap_or(serde_json::Value::Null),
        );
        Ok(())
    }

    /// Track the active-session gauge across a state change.
    fn track_activity(&self, from: SessionState, to: SessionState) {
        match (from.is_terminal(), to.is_terminal()) {
            (false, true) => {
                self.active.fetch_sub(1, Ordering::SeqCst);
            }
            (true, false) => {
                self.active.fetch_add(1, Ordering::SeqCst);
            }
            _ => {}
        }
    }

    async fn session_handle(
        &self,
        session_id: &str,
    ) -> Result<Arc<Mutex<ArbitrationSession>>, ArbitrationError> {
        self.sessions
            .read()
            .await
            .get(session_id)
            .cloned()
            .ok_or_else(|| ArbitrationError::SessionNotFound {
                session_id: session_id.to_string(),
            })
    }

    /// Open a session for a violation. Fails with saturation at the
    /// concurrency cap; the caller is expected to back off and retry.
    pub async fn start_session(
        &self,
        violation: ConstitutionalViolation,
    ) -> Result<String, ArbitrationError> {
        let active = self.active.load(Ordering::SeqCst);
        if active >= self.config.max_concurrent_sessions {
            return Err(ArbitrationError::Saturation {
                active,
                limit: self.config.max_concurrent_sessions,
            });
        }

        let mut session = ArbitrationSession::new(violation);
        if let Some(violator) = &session.violation.violator {
            session.participants.push(violator.clone());
        }
        let session_id = session.session_id.clone();
        let severity = session.violation.severity;
        let rule_id = session.violation.rule_id.clone();

        self.sessions
            .write()
            .await
            .insert(session_id.clone(), Arc::new(Mutex::new(session)));
        self.active.fetch_add(1, Ordering::SeqCst);
        self.counters.lock().total_sessions += 1;

        tracing::info!(session_id = %session_id, rule_id = %rule_id, "arbitration session started");
        self.bus
            .emit(
                Event::new(topics::ARBITRATION_STARTED, "arbiter")
                    .with_session(session_id.clone())
                    .with_metadata(serde_json::json!({
                        "rule_id": rule_id,
                        "severity": severity.as_str(),
                    })),
            )
            .await;
        Ok(session_id)
    }

    /// Evaluate one rule against the session's violation. Inconclusive
    /// conditions and missing evidence degrade confidence instead of
    /// failing the session.
    async fn evaluate_rule(
        &self,
        rule: &ConstitutionalRule,
        violation: &ConstitutionalViolation,
    ) -> RuleEvaluationResult {
        let started = Instant::now();
        let now = Utc::now();

        let (violated, mut explanation, mut confidence) = match rule.activity(now) {
            RuleActivity::NotYetEffective => (false, "rule not yet effective".to_string(), 1.0),
            RuleActivity::Expired => (false, "rule expired".to_string(), 1.0),
            RuleActivity::Active => match evaluate_condition(&rule.condition, violation) {
                Ok(true) => (
                    true,
                    format!("condition '{}' matched", rule.condition),
                    0.95,
                ),
                Ok(false) => (
                    false,
                    format!("condition '{}' did not match", rule.condition),
                    0.9,
                ),
                Err(err) => {
                    tracing::warn!(
                        rule_id = %rule.id,
                        error = %err,
                        "rule condition inconclusive"
                    );
                    (false, format!("condition inconclusive: {err}"), 0.5)
                }
            },
        };

        let missing: Vec<&String> = rule
            .required_evidence
            .iter()
            .filter(|required| {
                !violation.evidence.iter().any(|supplied| {
                    !supplied.trim().is_empty()
                        && supplied.to_lowercase().contains(&required.to_lowercase())
                })
            })
            .collect();
        if !missing.is_empty() {
            confidence = (confidence - 0.15 * missing.len() as f64).max(0.3);
            explanation.push_str(&format!(
                "; missing evidence: {}",
                missing
                    .iter()
                    .map(|s| s.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            ));
        }

        // Precedent lookup is advisory; a miss or failure never blocks the
        // evaluation.
        let precedents_applied: Vec<String> = self
            .precedents
            .find_similar(rule.category, rule.severity, &violation.evidence)
            .await
            .into_iter()
            .map(|p| p.id)
            .collect();

        RuleEvaluationResult {
            rule_id: rule.id.clone(),
            violated,
            explanation,
            confidence,
            severity: rule.severity,
            category: rule.category,
            waivable: rule.waivable,
            precedents_applied,
            evaluation_time_ms: started.elapsed().as_secs_f64() * 1_000.0,
        }
    }

    /// Evaluate the supplied rules; transitions the session to
    /// VERDICT_GENERATION.
    pub async fn evaluate_rules(
        &self,
        session_id: &str,
        rules: &[ConstitutionalRule],
    ) -> Result<Vec<RuleEvaluationResult>, ArbitrationError> {
        let handle = self.session_handle(session_id).await?;
        let mut session = handle.lock().await;

        if session.state != SessionState::RuleEvaluation {
            return Err(ArbitrationError::InvalidStateTransition {
                session_id: session_id.to_string(),
                from: session.state,
                to: SessionState::VerdictGeneration,
            });
        }

        let violation = session.violation.clone();
        let mut results = Vec::with_capacity(rules.len());
        for rule in rules {
            let result = self.evaluate_rule(rule, &violation).await;
            session.rules_evaluated.push(rule.id.clone());
            session.append_metadata(
                "ruleEvaluationResults",
                serde_json::to_value(&result).unwrap_or(serde_json::Value::Null),
            );
            results.push(result);
        }

        Self::apply_transition(&mut session, SessionState::VerdictGeneration, "rules evaluated")?;
        drop(session);

        for result in &results {
            self.bus
                .emit(
                    Event::new(topics::ARBITRATION_RULE_EVALUATED, "arbiter")
                        .with_session(session_id)
                        .with_severity(if result.violated {
                            EventSeverity::Warn
                        } else {
                            EventSeverity::Info
                        })
                        .with_metadata(serde_json::json!({
                            "rule_id": result.rule_id,
                            "violated": result.violated,
                            "confidence": result.confidence,
                        })),
                )
                .await;
        }
        Ok(results)
    }

    /// Submit a waiver request; transitions the session to
    /// WAIVER_CONSIDERATION and records the decision in
    /// `metadata.waiverDecision`.
    pub async fn submit_waiver(
        &self,
        session_id: &str,
        request: WaiverRequest,
    ) -> Result<WaiverDecision, ArbitrationError> {
        if !self.config.enable_waivers {
            return Err(ArbitrationError::WaiverSystemDisabled);
        }

        let handle = self.session_handle(session_id).await?;
        let mut session = handle.lock().await;
        Self::apply_transition(
            &mut session,
            SessionState::WaiverConsideration,
            "waiver submitted",
        )?;

        let decision = self.waiver_interpreter.evaluate(&request);
        if !session.participants.contains(&request.requested_by) {
            session.participants.push(request.requested_by.clone());
        }
        session.waiver_request = Some(request);
        session.set_metadata(
            "waiverDecision",
            serde_json::to_value(&decision).unwrap_or(serde_json::Value::Null),
        );
        drop(session);

        {
            let mut counters = self.counters.lock();
            match decision.status {
                WaiverStatus::Approved => counters.waivers_approved += 1,
                WaiverStatus::Rejected => counters.waivers_rejected += 1,
            }
        }

        self.bus
            .emit(
                Event::new(topics::ARBITRATION_WAIVER_DECIDED, "arbiter")
                    .with_session(session_id)
                    .with_metadata(serde_json::json!({
                        "status": decision.status,
                        "expires_at": decision.expires_at,
                    })),
            )
            .await;
        Ok(decision)
    }

    fn stored_results(session: &ArbitrationSession) -> Vec<RuleEvaluationResult> {
        session
            .metadata
            .get("ruleEvaluationResults")
            .cloned()
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_default()
    }

    fn waiver_approved(session: &ArbitrationSession) -> bool {
        session
            .metadata
            .get("waiverDecision")
            .and_then(|d| d.get("status"))
            .and_then(|s| s.as_str())
            .map(|s| s == "APPROVED")
            .unwrap_or(false)
    }

    /// Aggregate the stored rule results into a verdict. Valid in
    /// VERDICT_GENERATION and WAIVER_CONSIDERATION.
    pub async fn generate_verdict(&self, session_id: &str) -> Result<Verdict, ArbitrationError> {
        let handle = self.session_handle(session_id).await?;
        let mut session = handle.lock().await;

        if !matches!(
            session.state,
            SessionState::VerdictGeneration | SessionState::WaiverConsideration
        ) {
            return Err(ArbitrationError::InvalidStateTransition {
                session_id: session_id.to_string(),
                from: session.state,
                to: SessionState::VerdictGeneration,
            });
        }

        let results = Self::stored_results(&session);
        let mut audit_log = Vec::new();
        if results.is_empty() {
            tracing::warn!(
                session_id,
                "no rule evaluation results on record, deferring verdict"
            );
            audit_log.push("no rule evaluation results on record".to_string());
        }

        let violated: Vec<&RuleEvaluationResult> =
            results.iter().filter(|r| r.violated).collect();
        let mut outcome = if results.is_empty() {
            VerdictOutcome::Deferred
        } else if violated.is_empty() {
            VerdictOutcome::Approved
        } else {
            VerdictOutcome::Rejected
        };

        // A waiver can soften the outcome only when the most severe violated
        // rule is itself waivable.
        if outcome == VerdictOutcome::Rejected && Self::waiver_approved(&session) {
            if let Some(top) = violated.iter().max_by_key(|r| r.severity) {
                if top.waivable {
                    outcome = VerdictOutcome::Conditional;
                    audit_log.push(format!(
                        "waiver approved for '{}', outcome softened to CONDITIONAL",
                        top.rule_id
                    ));
                }
            }
        }

        let raw_confidence = if results.is_empty() {
            0.0
        } else {
            results.iter().map(|r| r.confidence).sum::<f64>() / results.len() as f64
        };
        let confidence = raw_confidence.clamp(0.0, 1.0);
        if (raw_confidence - confidence).abs() > f64::EPSILON {
            tracing::warn!(session_id, raw_confidence, "verdict confidence clamped");
            audit_log.push(format!("confidence clamped from {raw_confidence}"));
        }

        let mut reasoning: Vec<ReasoningStep> = results
            .iter()
            .enumerate()
            .map(|(index, result)| ReasoningStep {
                step: index as u32 + 1,
                description: format!("rule {}: {}", result.rule_id, result.explanation),
                evidence: if result.violated {
                    session.violation.evidence.clone()
                } else {
                    Vec::new()
                },
                rule_references: vec![result.rule_id.clone()],
                confidence: result.confidence,
            })
            .collect();
        reasoning.push(ReasoningStep {
            step: reasoning.len() as u32 + 1,
            description: format!(
                "{} of {} rules violated, outcome {}",
                violated.len(),
                results.len(),
                outcome.as_str()
            ),
            evidence: Vec::new(),
            rule_references: results.iter().map(|r| r.rule_id.clone()).collect(),
            confidence,
        });

        let rules_applied: Vec<String> = if violated.is_empty() {
            results.iter().map(|r| r.rule_id.clone()).collect()
        } else {
            violated.iter().map(|r| r.rule_id.clone()).collect()
        };
        let mut precedents: Vec<String> = results
            .iter()
            .flat_map(|r| r.precedents_applied.iter().cloned())
            .collect();
        precedents.sort();
        precedents.dedup();

        let verdict = Verdict {
            id: Uuid::new_v4().to_string(),
            session_id: session_id.to_string(),
            outcome,
            reasoning,
            rules_applied,
            evidence: session.violation.evidence.clone(),
            precedents,
            confidence,
            issued_by: self.config.issued_by.clone(),
            issued_at: Utc::now(),
            audit_log,
        };
        session.verdict = Some(verdict.clone());

        // Pick the anchor rule for precedent derivation: the most severe
        // violated rule, or the first result for approvals.
        let anchor = violated
            .iter()
            .max_by_key(|r| r.severity)
            .copied()
            .or_else(|| results.first());
        let violation_evidence = session.violation.evidence.clone();
        drop(session);

        self.counters.lock().verdicts_issued += 1;

        if verdict.confidence > PRECEDENT_CONFIDENCE_THRESHOLD {
            if let Some(anchor) = anchor {
                let precedent = self
                    .precedents
                    .store_from_verdict(
                        &verdict,
                        format!("{}: {}", anchor.rule_id, verdict.outcome.as_str()),
                        anchor.category,
                        anchor.severity,
                        violation_evidence,
                    )
                    .await;
                tracing::info!(
                    session_id,
                    precedent_id = %precedent.id,
                    "precedent created from high-confidence verdict"
                );
            }
        }

        self.bus
            .emit(
                Event::new(topics::ARBITRATION_VERDICT, "arbiter")
                    .with_session(session_id)
                    .with_metadata(serde_json::json!({
                        "outcome": verdict.outcome.as_str(),
                        "confidence": verdict.confidence,
                    })),
            )
            .await;
        Ok(verdict)
    }

    /// Complete a session from VERDICT_GENERATION, WAIVER_CONSIDERATION, or
    /// APPEAL_PENDING.
    pub async fn complete_session(&self, session_id: &str) -> Result<(), ArbitrationError> {
        let handle = self.session_handle(session_id).await?;
        let mut session = handle.lock().await;
        let from = session.state;
        Self::apply_transition(&mut session, SessionState::Completed, "session completed")?;
        drop(session);

        self.track_activity(from, SessionState::Completed);
        self.counters.lock().completed_sessions += 1;

        self.bus
            .emit(
                Event::new(topics::ARBITRATION_COMPLETED, "arbiter")
                    .with_session(session_id)
                    .with_metadata(serde_json::json!({ "state": "COMPLETED" })),
            )
            .await;
        Ok(())
    }

    /// Submit an appeal against a completed session; transitions it to
    /// APPEAL_PENDING. Prior appeals are retained in `metadata.appeals`.
    pub async fn submit_appeal(
        &self,
        session_id: &str,
        appeal: Appeal,
    ) -> Result<(), ArbitrationError> {
        if !self.config.enable_appeals {
            return Err(ArbitrationError::AppealSystemDisabled);
        }

        let handle = self.session_handle(session_id).await?;
        let mut session = handle.lock().await;
        if session.verdict.is_none() {
            return Err(ArbitrationError::NoVerdict {
                session_id: session_id.to_string(),
            });
        }
        let from = session.state;
        Self::apply_transition(&mut session, SessionState::AppealPending, "appeal submitted")?;

        session.append_metadata(
            "appeals",
            serde_json::to_value(&appeal).unwrap_or(serde_json::Value::Null),
        );
        if !session.participants.contains(&appeal.submitted_by) {
            session.participants.push(appeal.submitted_by.clone());
        }
        session.appeal = Some(appeal);
        drop(session);

        self.track_activity(from, SessionState::AppealPending);
        Ok(())
    }

    /// Review the pending appeal; the panel ruling closes the session back
    /// to COMPLETED. An overturned ruling replaces the verdict and, above
    /// the confidence threshold, mints a new precedent.
    pub async fn review_appeal(
        &self,
        session_id: &str,
    ) -> Result<AppealDecision, ArbitrationError> {
        let handle = self.session_handle(session_id).await?;
        let mut session = handle.lock().await;

        if session.state != SessionState::AppealPending {
            return Err(ArbitrationError::InvalidStateTransition {
                session_id: session_id.to_string(),
                from: session.state,
                to: SessionState::AppealPending,
            });
        }
        let appeal = session
            .appeal
            .clone()
            .ok_or_else(|| ArbitrationError::NoAppeal {
                session_id: session_id.to_string(),
            })?;
        let original = session
            .verdict
            .clone()
            .ok_or_else(|| ArbitrationError::NoVerdict {
                session_id: session_id.to_string(),
            })?;

        let decision = self.appeal_arbitrator.review(&appeal, &original);
        session.append_metadata(
            "appealDecisions",
            serde_json::to_value(&decision).unwrap_or(serde_json::Value::Null),
        );

        let mut overturn_verdict = None;
        if decision.ruling == AppealRuling::Overturned {
            let flipped = match original.outcome {
                VerdictOutcome::Rejected | VerdictOutcome::Conditional => VerdictOutcome::Approved,
                VerdictOutcome::Approved => VerdictOutcome::Rejected,
                other => other,
            };
            let verdict = Verdict {
                id: Uuid::new_v4().to_string(),
                session_id: session_id.to_string(),
                outcome: flipped,
                reasoning: vec![ReasoningStep {
                    step: 1,
                    description: format!(
                        "appeal {} overturned verdict {}: {}",
                        appeal.id, original.id, decision.reasoning
                    ),
                    evidence: appeal.new_evidence.clone(),
                    rule_references: original.rules_applied.clone(),
                    confidence: decision.confidence,
                }],
                rules_applied: original.rules_applied.clone(),
                evidence: appeal.new_evidence.clone(),
                precedents: Vec::new(),
                confidence: decision.confidence,
                issued_by: "appeal-panel".to_string(),
                issued_at: Utc::now(),
                audit_log: vec![format!("overturned verdict {}", original.id)],
            };
            session.verdict = Some(verdict.clone());
            overturn_verdict = Some(verdict);
        }

        Self::apply_transition(&mut session, SessionState::Completed, "appeal reviewed")?;
        let results = Self::stored_results(&session);
        drop(session);

        self.track_activity(SessionState::AppealPending, SessionState::Completed);
        {
            let mut counters = self.counters.lock();
            match decision.ruling {
                AppealRuling::Upheld => counters.appeals_upheld += 1,
                AppealRuling::Overturned => counters.appeals_overturned += 1,
                AppealRuling::Remanded => counters.appeals_remanded += 1,
            }
            counters.completed_sessions += 1;
        }

        if let Some(verdict) = overturn_verdict {
            if verdict.confidence > PRECEDENT_CONFIDENCE_THRESHOLD {
                let anchor = results
                    .iter()
                    .filter(|r| r.violated)
                    .max_by_key(|r| r.severity)
                    .or_else(|| results.first());
                if let Some(anchor) = anchor {
                    self.precedents
                        .store_from_verdict(
                            &verdict,
                            format!("{}: overturned on appeal", anchor.rule_id),
                            anchor.category,
                            anchor.severity,
                            appeal.new_evidence.clone(),
                        )
                        .await;
                }
            }
        }

        self.bus
            .emit(
                Event::new(topics::ARBITRATION_APPEAL_DECIDED, "arbiter")
                    .with_session(session_id)
                    .with_metadata(serde_json::json!({
                        "ruling": decision.ruling,
                        "confidence": decision.confidence,
                    })),
            )
            .await;
        Ok(decision)
    }

    /// Force a session to FAILED. Always valid on non-terminal states and a
    /// no-op on terminal ones.
    pub async fn fail_session(
        &self,
        session_id: &str,
        reason: &str,
    ) -> Result<(), ArbitrationError> {
        let handle = self.session_handle(session_id).await?;
        let mut session = handle.lock().await;
        if session.state.is_terminal() {
            return Ok(());
        }
        let from = session.state;
        Self::apply_transition(&mut session, SessionState::Failed, reason)?;
        drop(session);

        self.track_activity(from, SessionState::Failed);
        self.counters.lock().failed_sessions += 1;
        tracing::warn!(session_id, reason, "arbitration session failed");

        self.bus
            .emit(
                Event::new(topics::ARBITRATION_COMPLETED, "arbiter")
                    .with_session(session_id)
                    .with_severity(EventSeverity::Warn)
                    .with_metadata(serde_json::json!({
                        "state": "FAILED",
                        "reason": reason,
                    })),
            )
            .await;
        Ok(())
    }

    /// Copy of a session, terminal or not.
    pub async fn get_session(&self, session_id: &str) -> Option<ArbitrationSession> {
        let handle = self.sessions.read().await.get(session_id).cloned()?;
        let session = handle.lock().await;
        Some(session.clone())
    }

    /// Number of non-terminal sessions.
    pub fn active_sessions(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Fail every session that has outlived `session_timeout_ms`.
    pub async fn expire_timed_out_sessions(&self) -> usize {
        let cutoff =
            Utc::now() - chrono::Duration::milliseconds(self.config.session_timeout_ms as i64);
        let candidates: Vec<String> = {
            let sessions = self.sessions.read().await;
            let mut expired = Vec::new();
            for (id, handle) in sessions.iter() {
                let session = handle.lock().await;
                if !session.state.is_terminal() && session.start_time < cutoff {
                    expired.push(id.clone());
                }
            }
            expired
        };

        let mut failed = 0;
        for session_id in candidates {
            if self
                .fail_session(&session_id, "session timeout")
                .await
                .is_ok()
            {
                failed += 1;
            }
        }
        failed
    }

    /// Spawn the periodic session-timeout sweep.
    pub fn spawn_timeout_sweep(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let engine = Arc::clone(self);
        let period = Duration::from_millis((engine.config.session_timeout_ms / 4).max(1_000));
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                let expired = engine.expire_timed_out_sessions().await;
                if expired > 0 {
                    tracing::warn!(expired, "timed-out arbitration sessions failed");
                }
            }
        })
    }

    /// Fail all non-terminal sessions (shutdown).
    pub async fn shutdown(&self) {
        let ids: Vec<String> = self.sessions.read().await.keys().cloned().collect();
        for session_id in ids {
            let _ = self.fail_session(&session_id, "System shutdown").await;
        }
    }

    /// Snapshot of engine counters.
    pub async fn stats(&self) -> ArbitrationStats {
        let total_precedents = self.precedents.count().await;
        let counters = self.counters.lock();
        ArbitrationStats {
            total_sessions: counters.total_sessions,
            active_sessions: self.active.load(Ordering::SeqCst),
            completed_sessions: counters.completed_sessions,
            failed_sessions: counters.failed_sessions,
            verdicts_issued: counters.verdicts_issued,
            waivers_approved: counters.waivers_approved,
            waivers_rejected: counters.waivers_rejected,
            appeals_upheld: counters.appeals_upheld,
            appeals_overturned: counters.appeals_overturned,
            appeals_remanded: counters.appeals_remanded,
            total_precedents,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{RuleCategory, Severity};

    fn engine() -> ArbitrationEngine {
        ArbitrationEngine::new(ArbitrationConfig::default(), EventBus::default())
    }

    fn violation() -> ConstitutionalViolation {
        ConstitutionalViolation::new("no-unreviewed-deploy", Severity::High, "deploy without review")
            .with_violator("agent-7")
            .with_location("deploy")
            .with_evidence("ci-log excerpt showing direct deploy")
    }

    fn strict_rule() -> ConstitutionalRule {
        ConstitutionalRule::new(
            "no-unreviewed-deploy",
            RuleCategory::Safety,
            "Deploys require review",
            "violation.location == 'deploy'",
            Severity::High,
        )
        .with_required_evidence("ci-log")
    }

    fn waivable_rule() -> ConstitutionalRule {
        ConstitutionalRule::new(
            "budget-loc-cap",
            RuleCategory::Budget,
            "Stay within the LOC budget",
            "violation.severity == 'medium'",
            Severity::Medium,
        )
        .waivable()
    }

    #[tokio::test]
    async fn test_full_rejection_path_creates_precedent() {
        let engine = engine();
        let session_id = engine.start_session(violation()).await.unwrap();

        let results = engine
            .evaluate_rules(&session_id, &[strict_rule()])
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
        assert!(results[0].violated);
        assert!((results[0].confidence - 0.95).abs() < 1e-9);

        let verdict = engine.generate_verdict(&session_id).await.unwrap();
        assert_eq!(verdict.outcome, VerdictOutcome::Rejected);
        assert!((verdict.confidence - 0.95).abs() < 1e-9);
        assert_eq!(engine.precedents().count().await, 1);

        engine.complete_session(&session_id).await.unwrap();
        let session = engine.get_session(&session_id).await.unwrap();
        assert_eq!(session.state, SessionState::Completed);
        assert!(session.end_time.is_some());
    }

    #[tokio::test]
    async fn test_clean_violation_is_approved() {
        let engine = engine();
        let clean = ConstitutionalViolation::new("r", Severity::Low, "routine change")
            .with_evidence("ci-log all green");
        let session_id = engine.start_session(clean).await.unwrap();

        engine
            .evaluate_rules(&session_id, &[strict_rule()])
            .await
            .unwrap();
        let verdict = engine.generate_verdict(&session_id).await.unwrap();
        assert_eq!(verdict.outcome, VerdictOutcome::Approved);
    }

    #[tokio::test]
    async fn test_invalid_transitions_rejected_and_session_untouched() {
        let engine = engine();
        let session_id = engine.start_session(violation()).await.unwrap();

        // Verdict before evaluation is out of order.
        assert!(matches!(
            engine.generate_verdict(&session_id).await,
            Err(ArbitrationError::InvalidStateTransition { .. })
        ));

        engine
            .evaluate_rules(&session_id, &[strict_rule()])
            .await
            .unwrap();
        // Evaluating twice is out of order too.
        assert!(matches!(
            engine.evaluate_rules(&session_id, &[strict_rule()]).await,
            Err(ArbitrationError::InvalidStateTransition { .. })
        ));

        let session = engine.get_session(&session_id).await.unwrap();
        assert_eq!(session.state, SessionState::VerdictGeneration);
        assert_eq!(session.transitions().len(), 1);
    }

    #[tokio::test]
    async fn test_terminal_session_rejects_operations_but_stays_readable() {
        let engine = engine();
        let session_id = engine.start_session(violation()).await.unwrap();
        engine
            .evaluate_rules(&session_id, &[strict_rule()])
            .await
            .unwrap();
        engine.generate_verdict(&session_id).await.unwrap();
        engine.complete_session(&session_id).await.unwrap();

        assert!(matches!(
            engine.evaluate_rules(&session_id, &[strict_rule()]).await,
            Err(ArbitrationError::InvalidStateTransition { .. })
        ));
        assert!(matches!(
            engine.generate_verdict(&session_id).await,
            Err(ArbitrationError::InvalidStateTransition { .. })
        ));
        assert!(matches!(
            engine.complete_session(&session_id).await,
            Err(ArbitrationError::InvalidStateTransition { .. })
        ));

        let session = engine.get_session(&session_id).await.unwrap();
        assert_eq!(session.state, SessionState::Completed);
    }

    #[tokio::test]
    async fn test_waiver_softens_waivable_rejection() {
        let engine = engine();
        let medium = ConstitutionalViolation::new("budget-loc-cap", Severity::Medium, "LOC overrun")
            .with_evidence("diff summary");
        let session_id = engine.start_session(medium).await.unwrap();
        engine
            .evaluate_rules(&session_id, &[waivable_rule()])
            .await
            .unwrap();

        let request = WaiverRequest::new(
            "budget-loc-cap",
            "release-manager",
            "The overrun is generated protocol bindings regenerated in the same change; \
             splitting them into a separate commit would leave the tree non-compiling and \
             block the downstream release train for every dependent team.",
            24 * 60 * 60 * 1_000,
        )
        .with_evidence("diff summary showing generated files")
        .with_evidence("binding generator output");
        let decision = engine.submit_waiver(&session_id, request).await.unwrap();
        assert_eq!(decision.status, WaiverStatus::Approved);

        let verdict = engine.generate_verdict(&session_id).await.unwrap();
        assert_eq!(verdict.outcome, VerdictOutcome::Conditional);

        engine.complete_session(&session_id).await.unwrap();
        let session = engine.get_session(&session_id).await.unwrap();
        assert_eq!(
            session
                .metadata
                .get("waiverDecision")
                .and_then(|d| d.get("status"))
                .and_then(|s| s.as_str()),
            Some("APPROVED")
        );
    }

    #[tokio::test]
    async fn test_waivers_disabled() {
        let engine = ArbitrationEngine::new(
            ArbitrationConfig {
                enable_waivers: false,
                ..ArbitrationConfig::default()
            },
            EventBus::default(),
        );
        let session_id = engine.start_session(violation()).await.unwrap();
        engine
            .evaluate_rules(&session_id, &[waivable_rule()])
            .await
            .unwrap();

        let request = WaiverRequest::new("budget-loc-cap", "someone", "justification", 0);
        assert!(matches!(
            engine.submit_waiver(&session_id, request).await,
            Err(ArbitrationError::WaiverSystemDisabled)
        ));
    }

    #[tokio::test]
    async fn test_appeal_overturn_creates_second_precedent() {
        let engine = engine();
        let session_id = engine.start_session(violation()).await.unwrap();
        engine
            .evaluate_rules(&session_id, &[strict_rule()])
            .await
            .unwrap();
        let verdict = engine.generate_verdict(&session_id).await.unwrap();
        assert_eq!(verdict.outcome, VerdictOutcome::Rejected);
        engine.complete_session(&session_id).await.unwrap();
        assert_eq!(engine.precedents().count().await, 1);

        let appeal = Appeal::new(
            &session_id,
            "agent-owner",
            "The CI log came from a stale run; the attached artifacts show review approval \
             before the deploy, the approver held the required role, and the deploy window \
             was a published maintenance exception approved two weeks in advance.",
        )
        .with_new_evidence("review approval timestamped before deploy")
        .with_new_evidence("approver role export")
        .with_new_evidence("maintenance calendar entry");
        engine.submit_appeal(&session_id, appeal).await.unwrap();

        let session = engine.get_session(&session_id).await.unwrap();
        assert_eq!(session.state, SessionState::AppealPending);

        let decision = engine.review_appeal(&session_id).await.unwrap();
        assert_eq!(decision.ruling, AppealRuling::Overturned);
        assert!(decision.confidence > 0.8);

        let session = engine.get_session(&session_id).await.unwrap();
        assert_eq!(session.state, SessionState::Completed);
        assert_eq!(
            session.verdict.as_ref().map(|v| v.outcome),
            Some(VerdictOutcome::Approved)
        );
        assert!(engine.precedents().count().await >= 2);
    }

    #[tokio::test]
    async fn test_fail_session_is_idempotent_on_terminal() {
        let engine = engine();
        let session_id = engine.start_session(violation()).await.unwrap();

        engine.fail_session(&session_id, "operator abort").await.unwrap();
        // Second call is a no-op.
        engine.fail_session(&session_id, "again").await.unwrap();

        let session = engine.get_session(&session_id).await.unwrap();
        assert_eq!(session.state, SessionState::Failed);
        assert_eq!(session.transitions().len(), 1);
        assert_eq!(engine.stats().await.failed_sessions, 1);
    }

    #[tokio::test]
    async fn test_saturation() {
        let engine = ArbitrationEngine::new(
            ArbitrationConfig {
                max_concurrent_sessions: 1,
                ..ArbitrationConfig::default()
            },
            EventBus::default(),
        );

        let first = engine.start_session(violation()).await.unwrap();
        assert!(matches!(
            engine.start_session(violation()).await,
            Err(ArbitrationError::Saturation { .. })
        ));

        // Finishing the first session frees capacity.
        engine.fail_session(&first, "test").await.unwrap();
        assert!(engine.start_session(violation()).await.is_ok());
    }

    #[tokio::test]
    async fn test_fault_isolation_between_sessions() {
        let engine = engine();
        let healthy = engine.start_session(violation()).await.unwrap();
        let faulty = engine.start_session(violation()).await.unwrap();

        // This rule's condition references an unknown field and is
        // inconclusive; the session still progresses and its confidence
        // drops, but the healthy session is untouched.
        let broken_rule = ConstitutionalRule::new(
            "broken",
            RuleCategory::Quality,
            "Broken condition",
            "violation.nonexistent == 'x'",
            Severity::Low,
        );
        let results = engine
            .evaluate_rules(&faulty, &[broken_rule])
            .await
            .unwrap();
        assert!(!results[0].violated);
        assert!((results[0].confidence - 0.5).abs() < 1e-9);

        let healthy_session = engine.get_session(&healthy).await.unwrap();
        assert_eq!(healthy_session.state, SessionState::RuleEvaluation);
        assert!(healthy_session.transitions().is_empty());
    }

    #[tokio::test]
    async fn test_inactive_rules_are_not_violated() {
        let engine = engine();
        let session_id = engine.start_session(violation()).await.unwrap();

        let future_rule = strict_rule()
            .with_effective_date(Utc::now() + chrono::Duration::days(1));
        let expired_rule = ConstitutionalRule::new(
            "old-rule",
            RuleCategory::Process,
            "Old rule",
            "violation.location == 'deploy'",
            Severity::Low,
        )
        .with_effective_date(Utc::now() - chrono::Duration::days(10))
        .with_expiration_date(Utc::now() - chrono::Duration::days(1));

        let results = engine
            .evaluate_rules(&session_id, &[future_rule, expired_rule])
            .await
            .unwrap();
        assert!(!results[0].violated);
        assert_eq!(results[0].explanation, "rule not yet effective");
        assert!(!results[1].violated);
        assert_eq!(results[1].explanation, "rule expired");
    }

    #[tokio::test]
    async fn test_missing_evidence_lowers_confidence() {
        let engine = engine();
        let bare = ConstitutionalViolation::new("no-unreviewed-deploy", Severity::High, "deploy")
            .with_location("deploy");
        let session_id = engine.start_session(bare).await.unwrap();

        let results = engine
            .evaluate_rules(&session_id, &[strict_rule()])
            .await
            .unwrap();
        assert!(results[0].violated);
        assert!((results[0].confidence - 0.8).abs() < 1e-9);
        assert!(results[0].explanation.contains("missing evidence"));
    }

    #[tokio::test]
    async fn test_session_timeout_sweep() {
        let engine = ArbitrationEngine::new(
            ArbitrationConfig {
                session_timeout_ms: 0,
                ..ArbitrationConfig::default()
            },
            EventBus::default(),
        );
        let session_id = engine.start_session(violation()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;

        assert_eq!(engine.expire_timed_out_sessions().await, 1);
        let session = engine.get_session(&session_id).await.unwrap();
        assert_eq!(session.state, SessionState::Failed);
    }
}
