//! Conductor-Arbiter: Constitutional Arbitration Engine
//!
//! Evaluates reported violations against declared constitutional rules and
//! renders an adjudicated verdict. Each case runs as an isolated session
//! through a strict state machine: rule evaluation, verdict generation,
//! optional waiver consideration, completion, and optional appeal review.
//! High-confidence verdicts become precedents consulted by later sessions.

pub mod appeal;
pub mod condition;
pub mod engine;
pub mod precedent;
pub mod rules;
pub mod types;
pub mod waiver;

// Re-exports
pub use appeal::{AppealArbitrator, AppealPanelConfig};
pub use condition::{evaluate_condition, ConditionError};
pub use engine::{ArbitrationConfig, ArbitrationEngine, ArbitrationError, ArbitrationStats};
pub use precedent::{PrecedentConfig, PrecedentManager, PrecedentStats};
pub use rules::{RuleError, RuleSet};
pub use types::{
    Appeal, AppealDecision, AppealRuling, ArbitrationSession, ConstitutionalRule,
    ConstitutionalViolation, Precedent, ReasoningStep, RuleCategory, RuleEvaluationResult,
    SessionState, Severity, StateTransition, Verdict, VerdictOutcome, WaiverDecision,
    WaiverRequest, WaiverStatus,
};
pub use waiver::{WaiverInterpreter, WaiverPolicy};
