//! Conductor-Arbiter: Waiver Interpreter
//!
//! Deterministic policy mapping a waiver request to a decision. The score is
//! additive over three components: justification strength, evidence volume,
//! and how bounded the requested duration is. The same inputs always yield
//! the same decision.

use crate::types::{WaiverDecision, WaiverRequest, WaiverStatus};
use chrono::{Duration as ChronoDuration, Utc};

/// Tunable waiver policy knobs.
#[derive(Debug, Clone)]
pub struct WaiverPolicy {
    /// Score at or above which the waiver is approved
    pub approval_threshold: f64,
    /// Requests longer than this get no duration credit
    pub max_duration_ms: u64,
    /// Justification length granting the full justification credit
    pub strong_justification_len: usize,
    /// Justification length granting the partial credit
    pub adequate_justification_len: usize,
}

impl Default for WaiverPolicy {
    fn default() -> Self {
        Self {
            approval_threshold: 0.6,
            max_duration_ms: 7 * 24 * 60 * 60 * 1_000,
            strong_justification_len: 200,
            adequate_justification_len: 50,
        }
    }
}

/// Deterministic waiver evaluator.
#[derive(Debug, Clone, Default)]
pub struct WaiverInterpreter {
    policy: WaiverPolicy,
}

impl WaiverInterpreter {
    /// Create an interpreter with the given policy.
    pub fn new(policy: WaiverPolicy) -> Self {
        Self { policy }
    }

    /// Score components: justification (≤ 0.4) + evidence (≤ 0.3) +
    /// bounded duration (≤ 0.3).
    fn score(&self, request: &WaiverRequest) -> (f64, f64, f64) {
        let justification_len = request.justification.trim().len();
        let justification = if justification_len >= self.policy.strong_justification_len {
            0.4
        } else if justification_len >= self.policy.adequate_justification_len {
            0.25
        } else if justification_len > 0 {
            0.1
        } else {
            0.0
        };

        let evidence = (request.evidence.len() as f64 * 0.1).min(0.3);

        // Zero duration is the most bounded request of all.
        let duration = if request.requested_duration_ms > self.policy.max_duration_ms {
            0.0
        } else {
            0.3 * (1.0 - request.requested_duration_ms as f64 / self.policy.max_duration_ms as f64)
        };

        (justification, evidence, duration)
    }

    /// Evaluate a request into a decision.
    pub fn evaluate(&self, request: &WaiverRequest) -> WaiverDecision {
        let (justification, evidence, duration) = self.score(request);
        let total = justification + evidence + duration;
        let approved = total >= self.policy.approval_threshold;

        let now = Utc::now();
        let reasoning = format!(
            "score {total:.2} (justification {justification:.2}, evidence {evidence:.2}, \
             duration {duration:.2}) vs threshold {:.2}",
            self.policy.approval_threshold
        );
        tracing::info!(
            waiver_id = %request.id,
            rule_id = %request.rule_id,
            approved,
            score = total,
            "waiver evaluated"
        );

        WaiverDecision {
            status: if approved {
                WaiverStatus::Approved
            } else {
                WaiverStatus::Rejected
            },
            reasoning,
            expires_at: approved.then(|| {
                now + ChronoDuration::milliseconds(request.requested_duration_ms as i64)
            }),
            decided_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strong_request(duration_ms: u64) -> WaiverRequest {
        WaiverRequest::new(
            "budget-loc-cap",
            "release-manager",
            "The change intentionally exceeds the LOC budget because the generated \
             protocol bindings were regenerated in the same commit; splitting them out \
             would leave the tree in a non-compiling state between commits and block the \
             release train for everyone downstream.",
            duration_ms,
        )
        .with_evidence("diff summary showing generated files")
        .with_evidence("link to binding generator output")
    }

    #[test]
    fn test_strong_request_with_bounded_duration_is_approved() {
        let interpreter = WaiverInterpreter::default();
        let decision = interpreter.evaluate(&strong_request(24 * 60 * 60 * 1_000));

        assert_eq!(decision.status, WaiverStatus::Approved);
        assert!(decision.expires_at.is_some());
    }

    #[test]
    fn test_zero_duration_is_permitted() {
        let interpreter = WaiverInterpreter::default();
        let decision = interpreter.evaluate(&strong_request(0));
        assert_eq!(decision.status, WaiverStatus::Approved);
    }

    #[test]
    fn test_empty_justification_is_rejected() {
        let interpreter = WaiverInterpreter::default();
        let request = WaiverRequest::new("r-1", "someone", "", 1_000);
        let decision = interpreter.evaluate(&request);

        assert_eq!(decision.status, WaiverStatus::Rejected);
        assert!(decision.expires_at.is_none());
    }

    #[test]
    fn test_open_ended_duration_loses_credit() {
        let interpreter = WaiverInterpreter::default();
        // Strong justification and evidence, but a 30-day window.
        let decision = interpreter.evaluate(&strong_request(30 * 24 * 60 * 60 * 1_000));
        assert_eq!(decision.status, WaiverStatus::Approved);

        // Weak justification plus open-ended duration fails.
        let weak = WaiverRequest::new("r-1", "someone", "just because", 30 * 24 * 60 * 60 * 1_000);
        assert_eq!(interpreter.evaluate(&weak).status, WaiverStatus::Rejected);
    }

    #[test]
    fn test_deterministic() {
        let interpreter = WaiverInterpreter::default();
        let request = strong_request(60_000);
        let first = interpreter.evaluate(&request);
        let second = interpreter.evaluate(&request);
        assert_eq!(first.status, second.status);
        assert_eq!(first.reasoning, second.reasoning);
    }
}
