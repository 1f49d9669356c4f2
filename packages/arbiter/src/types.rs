//! Conductor-Arbiter: Core Types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Rule severity, ordered from least to most severe.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    /// Stable string form used in persisted rows and similarity tokens.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

/// Rule category, used for grouping and precedent similarity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleCategory {
    Safety,
    Quality,
    Budget,
    Process,
    Security,
}

impl RuleCategory {
    /// Stable string form used in persisted rows and similarity tokens.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Safety => "safety",
            Self::Quality => "quality",
            Self::Budget => "budget",
            Self::Process => "process",
            Self::Security => "security",
        }
    }
}

/// Whether a rule applies at a given instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleActivity {
    /// In force
    Active,
    /// `now` is before the effective date
    NotYetEffective,
    /// `now` is past the expiration date
    Expired,
}

/// A declarative constitutional rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConstitutionalRule {
    /// Unique rule identifier
    pub id: String,
    /// Rule version string
    #[serde(default = "default_version")]
    pub version: String,
    /// Category
    pub category: RuleCategory,
    /// Short title
    pub title: String,
    /// Longer description
    #[serde(default)]
    pub description: String,
    /// Boolean condition over `violation.*` and `context.*` fields
    pub condition: String,
    /// Severity when violated
    pub severity: Severity,
    /// Whether a waiver can soften a violation of this rule
    #[serde(default)]
    pub waivable: bool,
    /// Evidence labels a violation report must carry
    #[serde(default)]
    pub required_evidence: Vec<String>,
    /// Ids of precedents attached to this rule
    #[serde(default)]
    pub precedents: Vec<String>,
    /// When the rule comes into force
    pub effective_date: DateTime<Utc>,
    /// When the rule lapses, if ever
    #[serde(default)]
    pub expiration_date: Option<DateTime<Utc>>,
    /// Free-form metadata
    #[serde(default)]
    pub metadata: serde_json::Value,
}

fn default_version() -> String {
    "1.0.0".to_string()
}

impl ConstitutionalRule {
    /// Create an immediately effective rule.
    pub fn new(
        id: impl Into<String>,
        category: RuleCategory,
        title: impl Into<String>,
        condition: impl Into<String>,
        severity: Severity,
    ) -> Self {
        Self {
            id: id.into(),
            version: default_version(),
            category,
            title: title.into(),
            description: String::new(),
            condition: condition.into(),
            severity,
            waivable: false,
            required_evidence: Vec::new(),
            precedents: Vec::new(),
            effective_date: Utc::now(),
            expiration_date: None,
            metadata: serde_json::Value::Null,
        }
    }

    /// Mark the rule waivable.
    pub fn waivable(mut self) -> Self {
        self.waivable = true;
        self
    }

    /// Require an evidence label.
    pub fn with_required_evidence(mut self, label: impl Into<String>) -> Self {
        self.required_evidence.push(label.into());
        self
    }

    /// Set the effective date.
    pub fn with_effective_date(mut self, effective_date: DateTime<Utc>) -> Self {
        self.effective_date = effective_date;
        self
    }

    /// Set the expiration date.
    pub fn with_expiration_date(mut self, expiration_date: DateTime<Utc>) -> Self {
        self.expiration_date = Some(expiration_date);
        self
    }

    /// Activity of the rule at `now`.
    pub fn activity(&self, now: DateTime<Utc>) -> RuleActivity {
        if now < self.effective_date {
            return RuleActivity::NotYetEffective;
        }
        if let Some(expiration) = self.expiration_date {
            if now > expiration {
                return RuleActivity::Expired;
            }
        }
        RuleActivity::Active
    }
}

/// A reported violation to be arbitrated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConstitutionalViolation {
    /// Unique violation identifier
    pub id: String,
    /// Rule the reporter believes was violated
    pub rule_id: String,
    /// Reported severity
    pub severity: Severity,
    /// What happened
    pub description: String,
    /// Evidence strings supporting the report
    #[serde(default)]
    pub evidence: Vec<String>,
    /// Detection timestamp
    pub detected_at: DateTime<Utc>,
    /// Agent or actor that caused the violation, if known
    #[serde(default)]
    pub violator: Option<String>,
    /// Where the violation occurred (file, module, endpoint)
    #[serde(default)]
    pub location: Option<String>,
    /// Structured context consulted by rule conditions
    #[serde(default)]
    pub context: serde_json::Value,
}

impl ConstitutionalViolation {
    /// Create a violation report.
    pub fn new(
        rule_id: impl Into<String>,
        severity: Severity,
        description: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            rule_id: rule_id.into(),
            severity,
            description: description.into(),
            evidence: Vec::new(),
            detected_at: Utc::now(),
            violator: None,
            location: None,
            context: serde_json::Value::Null,
        }
    }

    /// Attach an evidence string.
    pub fn with_evidence(mut self, evidence: impl Into<String>) -> Self {
        self.evidence.push(evidence.into());
        self
    }

    /// Set the violator.
    pub fn with_violator(mut self, violator: impl Into<String>) -> Self {
        self.violator = Some(violator.into());
        self
    }

    /// Set the location.
    pub fn with_location(mut self, location: impl Into<String>) -> Self {
        self.location = Some(location.into());
        self
    }

    /// Attach structured context.
    pub fn with_context(mut self, context: serde_json::Value) -> Self {
        self.context = context;
        self
    }
}

/// Arbitration session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionState {
    RuleEvaluation,
    VerdictGeneration,
    WaiverConsideration,
    AppealPending,
    Completed,
    Failed,
}

impl SessionState {
    /// True for COMPLETED and FAILED.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Stable string form used in persisted rows.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RuleEvaluation => "RULE_EVALUATION",
            Self::VerdictGeneration => "VERDICT_GENERATION",
            Self::WaiverConsideration => "WAIVER_CONSIDERATION",
            Self::AppealPending => "APPEAL_PENDING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
        }
    }
}

/// One accepted state transition, appended to the session's
/// `metadata.stateTransitions` log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateTransition {
    pub from: SessionState,
    pub to: SessionState,
    pub at: DateTime<Utc>,
    pub reason: String,
}

/// Result of evaluating one rule against one violation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleEvaluationResult {
    /// Rule that was evaluated
    pub rule_id: String,
    /// Whether the rule was found violated
    pub violated: bool,
    /// Human-readable explanation
    pub explanation: String,
    /// Confidence in the result, in `[0, 1]`
    pub confidence: f64,
    /// Severity of the rule (echoed for verdict aggregation)
    pub severity: Severity,
    /// Category of the rule (echoed for precedent derivation)
    pub category: RuleCategory,
    /// Whether the rule is waivable (echoed for verdict aggregation)
    pub waivable: bool,
    /// Ids of precedents consulted
    pub precedents_applied: Vec<String>,
    /// Wall-clock evaluation time
    pub evaluation_time_ms: f64,
}

/// Verdict outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum VerdictOutcome {
    Approved,
    Rejected,
    Conditional,
    Deferred,
    Remanded,
}

impl VerdictOutcome {
    /// Stable string form used in persisted rows.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Approved => "APPROVED",
            Self::Rejected => "REJECTED",
            Self::Conditional => "CONDITIONAL",
            Self::Deferred => "DEFERRED",
            Self::Remanded => "REMANDED",
        }
    }

    /// Parse a stored outcome, coercing anything unknown to DEFERRED with a
    /// warning rather than failing arbitration.
    pub fn coerce(raw: &str) -> Self {
        match raw.to_uppercase().as_str() {
            "APPROVED" => Self::Approved,
            "REJECTED" => Self::Rejected,
            "CONDITIONAL" => Self::Conditional,
            "DEFERRED" => Self::Deferred,
            "REMANDED" => Self::Remanded,
            other => {
                tracing::warn!(outcome = other, "unknown verdict outcome, coercing to DEFERRED");
                Self::Deferred
            }
        }
    }
}

/// One step in a verdict's reasoning chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReasoningStep {
    /// Step number, starting at 1
    pub step: u32,
    /// What was considered
    pub description: String,
    /// Evidence consulted in this step
    pub evidence: Vec<String>,
    /// Rules referenced in this step
    pub rule_references: Vec<String>,
    /// Confidence of this step
    pub confidence: f64,
}

/// The adjudicated outcome of a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Verdict {
    /// Verdict id
    pub id: String,
    /// Session the verdict belongs to
    pub session_id: String,
    /// Outcome
    pub outcome: VerdictOutcome,
    /// Stepwise reasoning
    pub reasoning: Vec<ReasoningStep>,
    /// Rules that drove the outcome
    pub rules_applied: Vec<String>,
    /// Evidence consulted
    pub evidence: Vec<String>,
    /// Precedents consulted
    pub precedents: Vec<String>,
    /// Aggregate confidence, in `[0, 1]`
    pub confidence: f64,
    /// Component that issued the verdict
    pub issued_by: String,
    /// Issue timestamp
    pub issued_at: DateTime<Utc>,
    /// Audit trail of noteworthy adjustments (clamps, coercions)
    pub audit_log: Vec<String>,
}

/// A request to waive a rule violation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WaiverRequest {
    /// Request id
    pub id: String,
    /// Rule the waiver targets
    pub rule_id: String,
    /// Actor requesting the waiver
    pub requested_by: String,
    /// Why the waiver should be granted
    pub justification: String,
    /// Supporting evidence
    #[serde(default)]
    pub evidence: Vec<String>,
    /// Requested validity window in milliseconds (zero is allowed)
    pub requested_duration_ms: u64,
    /// Submission timestamp
    pub requested_at: DateTime<Utc>,
    /// Structured context
    #[serde(default)]
    pub context: serde_json::Value,
}

impl WaiverRequest {
    /// Create a waiver request.
    pub fn new(
        rule_id: impl Into<String>,
        requested_by: impl Into<String>,
        justification: impl Into<String>,
        requested_duration_ms: u64,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            rule_id: rule_id.into(),
            requested_by: requested_by.into(),
            justification: justification.into(),
            evidence: Vec::new(),
            requested_duration_ms,
            requested_at: Utc::now(),
            context: serde_json::Value::Null,
        }
    }

    /// Attach an evidence string.
    pub fn with_evidence(mut self, evidence: impl Into<String>) -> Self {
        self.evidence.push(evidence.into());
        self
    }
}

/// Waiver decision status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum WaiverStatus {
    Approved,
    Rejected,
}

/// Outcome of evaluating a waiver request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WaiverDecision {
    /// APPROVED or REJECTED
    pub status: WaiverStatus,
    /// Why the decision came out this way
    pub reasoning: String,
    /// When an approved waiver lapses
    pub expires_at: Option<DateTime<Utc>>,
    /// Decision timestamp
    pub decided_at: DateTime<Utc>,
}

/// An appeal against a completed session's verdict.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Appeal {
    /// Appeal id
    pub id: String,
    /// Session being appealed
    pub session_id: String,
    /// Actor submitting the appeal
    pub submitted_by: String,
    /// Grounds for the appeal
    pub grounds: String,
    /// Evidence not available to the original session
    #[serde(default)]
    pub new_evidence: Vec<String>,
    /// Submission timestamp
    pub submitted_at: DateTime<Utc>,
}

impl Appeal {
    /// Create an appeal.
    pub fn new(
        session_id: impl Into<String>,
        submitted_by: impl Into<String>,
        grounds: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            session_id: session_id.into(),
            submitted_by: submitted_by.into(),
            grounds: grounds.into(),
            new_evidence: Vec::new(),
            submitted_at: Utc::now(),
        }
    }

    /// Attach new evidence.
    pub fn with_new_evidence(mut self, evidence: impl Into<String>) -> Self {
        self.new_evidence.push(evidence.into());
        self
    }
}

/// Panel ruling on an appeal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AppealRuling {
    Upheld,
    Overturned,
    Remanded,
}

/// Panel decision on an appeal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppealDecision {
    /// Appeal this decision answers
    pub appeal_id: String,
    /// Ruling
    pub ruling: AppealRuling,
    /// Panel confidence in the ruling
    pub confidence: f64,
    /// Why the panel ruled this way
    pub reasoning: String,
    /// Reviewer identities
    pub reviewers: Vec<String>,
    /// Decision timestamp
    pub decided_at: DateTime<Utc>,
}

/// A stored high-confidence verdict, reusable by later evaluations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Precedent {
    /// Precedent id
    pub id: String,
    /// Short title derived from the top rule
    pub title: String,
    /// Rules the original case involved
    pub rules_involved: Vec<String>,
    /// Verdict the precedent derives from
    pub verdict_id: String,
    /// Outcome of that verdict
    pub outcome: VerdictOutcome,
    /// Category token used for similarity
    pub category: RuleCategory,
    /// Severity token used for similarity
    pub severity: Severity,
    /// Salient facts of the case
    pub key_facts: Vec<String>,
    /// One-paragraph reasoning summary
    pub reasoning_summary: String,
    /// When this precedent applies
    pub applicability: String,
    /// How many times later sessions cited it
    pub citation_count: u64,
    /// Last citation timestamp
    pub last_cited_at: Option<DateTime<Utc>>,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
}

/// One arbitration case, from violation intake to terminal state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArbitrationSession {
    /// Session id
    pub session_id: String,
    /// The violation under arbitration
    pub violation: ConstitutionalViolation,
    /// Ids of rules evaluated so far
    pub rules_evaluated: Vec<String>,
    /// Participants (reporter, violator, reviewers)
    pub participants: Vec<String>,
    /// Current state
    pub state: SessionState,
    /// Verdict, once generated
    pub verdict: Option<Verdict>,
    /// Waiver request, if one was submitted
    pub waiver_request: Option<WaiverRequest>,
    /// Current appeal, if one is pending or was reviewed
    pub appeal: Option<Appeal>,
    /// Append-only audit metadata: `stateTransitions`,
    /// `ruleEvaluationResults`, `waiverDecision`, `appeals`
    pub metadata: serde_json::Value,
    /// Session start
    pub start_time: DateTime<Utc>,
    /// Session end, once terminal
    pub end_time: Option<DateTime<Utc>>,
}

impl ArbitrationSession {
    /// New session in RULE_EVALUATION.
    pub fn new(violation: ConstitutionalViolation) -> Self {
        Self {
            session_id: Uuid::new_v4().to_string(),
            violation,
            rules_evaluated: Vec::new(),
            participants: Vec::new(),
            state: SessionState::RuleEvaluation,
            verdict: None,
            waiver_request: None,
            appeal: None,
            metadata: serde_json::json!({ "stateTransitions": [] }),
            start_time: Utc::now(),
            end_time: None,
        }
    }

    /// Append a value to a metadata array, creating it as needed. Corrupt
    /// (non-object) metadata is replaced rather than crashing the engine.
    pub fn append_metadata(&mut self, key: &str, value: serde_json::Value) {
        if !self.metadata.is_object() {
            tracing::warn!(session_id = %self.session_id, "corrupt session metadata, resetting");
            self.metadata = serde_json::json!({});
        }
        if let Some(object) = self.metadata.as_object_mut() {
            let entry = object
                .entry(key.to_string())
                .or_insert_with(|| serde_json::Value::Array(Vec::new()));
            if let Some(array) = entry.as_array_mut() {
                array.push(value);
            } else {
                *entry = serde_json::Value::Array(vec![value]);
            }
        }
    }

    /// Set a metadata key, resetting corrupt metadata if needed.
    pub fn set_metadata(&mut self, key: &str, value: serde_json::Value) {
        if !self.metadata.is_object() {
            tracing::warn!(session_id = %self.session_id, "corrupt session metadata, resetting");
            self.metadata = serde_json::json!({});
        }
        if let Some(object) = self.metadata.as_object_mut() {
            object.insert(key.to_string(), value);
        }
    }

    /// The recorded state-transition log.
    pub fn transitions(&self) -> Vec<StateTransition> {
        self.metadata
            .get("stateTransitions")
            .cloned()
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_rule_activity_window() {
        let rule = ConstitutionalRule::new(
            "r-1",
            RuleCategory::Safety,
            "No direct deploys",
            "violation.severity == 'high'",
            Severity::High,
        )
        .with_effective_date(Utc::now() - Duration::days(1))
        .with_expiration_date(Utc::now() + Duration::days(1));

        assert_eq!(rule.activity(Utc::now()), RuleActivity::Active);
        assert_eq!(
            rule.activity(Utc::now() - Duration::days(2)),
            RuleActivity::NotYetEffective
        );
        assert_eq!(
            rule.activity(Utc::now() + Duration::days(2)),
            RuleActivity::Expired
        );
    }

    #[test]
    fn test_outcome_coercion() {
        assert_eq!(VerdictOutcome::coerce("approved"), VerdictOutcome::Approved);
        assert_eq!(VerdictOutcome::coerce("REJECTED"), VerdictOutcome::Rejected);
        assert_eq!(VerdictOutcome::coerce("banana"), VerdictOutcome::Deferred);
    }

    #[test]
    fn test_session_metadata_append() {
        let violation =
            ConstitutionalViolation::new("r-1", Severity::High, "unauthorized deploy");
        let mut session = ArbitrationSession::new(violation);

        session.append_metadata(
            "stateTransitions",
            serde_json::json!({
                "from": "RULE_EVALUATION",
                "to": "VERDICT_GENERATION",
                "at": Utc::now(),
                "reason": "rules evaluated"
            }),
        );
        assert_eq!(session.transitions().len(), 1);
    }

    #[test]
    fn test_corrupt_metadata_is_reset_not_fatal() {
        let violation = ConstitutionalViolation::new("r-1", Severity::Low, "x");
        let mut session = ArbitrationSession::new(violation);
        session.metadata = serde_json::Value::String("garbage".to_string());

        session.set_metadata("waiverDecision", serde_json::json!({ "status": "APPROVED" }));
        assert!(session.metadata.get("waiverDecision").is_some());
    }

    #[test]
    fn test_severity_ordering() {
        assert!(Severity::Critical > Severity::High);
        assert!(Severity::High > Severity::Medium);
        assert!(Severity::Medium > Severity::Low);
    }
}
