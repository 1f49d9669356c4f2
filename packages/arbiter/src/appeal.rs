//! Conductor-Arbiter: Appeal Panel
//!
//! A fixed-size reviewer panel adjudicates appeals against completed
//! sessions. Each reviewer scores the appeal deterministically from the new
//! evidence, the grounds, and how confident the original verdict was; the
//! majority band decides the ruling.

use crate::types::{Appeal, AppealDecision, AppealRuling, Verdict};
use chrono::Utc;

/// Appeal panel configuration.
#[derive(Debug, Clone)]
pub struct AppealPanelConfig {
    /// Number of reviewers; odd sizes avoid ties
    pub panel_size: usize,
    /// Reviewer score at or above which the vote is "overturn"
    pub overturn_threshold: f64,
    /// Reviewer score at or above which the vote is "remand"
    pub remand_threshold: f64,
}

impl Default for AppealPanelConfig {
    fn default() -> Self {
        Self {
            panel_size: 3,
            overturn_threshold: 0.7,
            remand_threshold: 0.4,
        }
    }
}

/// Deterministic appeal arbitrator.
#[derive(Debug, Clone, Default)]
pub struct AppealArbitrator {
    config: AppealPanelConfig,
}

impl AppealArbitrator {
    /// Create an arbitrator with the given panel configuration.
    pub fn new(config: AppealPanelConfig) -> Self {
        Self { config }
    }

    /// Base merit of the appeal, shared by every reviewer:
    /// new evidence (≤ 0.6) + grounds strength (≤ 0.3) + weakness of the
    /// original verdict (≤ 0.3), capped at 1.0.
    fn base_score(appeal: &Appeal, original: &Verdict) -> f64 {
        let evidence = (appeal.new_evidence.len() as f64 * 0.2).min(0.6);

        let grounds_len = appeal.grounds.trim().len();
        let grounds = if grounds_len >= 200 {
            0.3
        } else if grounds_len >= 50 {
            0.2
        } else if grounds_len > 0 {
            0.1
        } else {
            0.0
        };

        let verdict_weakness = (1.0 - original.confidence.clamp(0.0, 1.0)) * 0.3;

        (evidence + grounds + verdict_weakness).min(1.0)
    }

    /// Review an appeal against the original verdict.
    pub fn review(&self, appeal: &Appeal, original: &Verdict) -> AppealDecision {
        let panel_size = self.config.panel_size.max(1);
        let base = Self::base_score(appeal, original);

        let mut votes: Vec<(String, f64, AppealRuling)> = Vec::with_capacity(panel_size);
        for index in 0..panel_size {
            // Reviewers weigh the same facts slightly differently, but the
            // perturbation is a pure function of the seat index.
            let score = (base + index as f64 * 0.01).min(1.0);
            let ruling = if score >= self.config.overturn_threshold {
                AppealRuling::Overturned
            } else if score >= self.config.remand_threshold {
                AppealRuling::Remanded
            } else {
                AppealRuling::Upheld
            };
            votes.push((format!("reviewer-{}", index + 1), score, ruling));
        }

        let count = |ruling: AppealRuling| votes.iter().filter(|(_, _, r)| *r == ruling).count();
        let overturn = count(AppealRuling::Overturned);
        let remand = count(AppealRuling::Remanded);
        let uphold = count(AppealRuling::Upheld);

        let ruling = if overturn >= remand && overturn >= uphold {
            AppealRuling::Overturned
        } else if remand >= uphold {
            AppealRuling::Remanded
        } else {
            AppealRuling::Upheld
        };

        let majority: Vec<&(String, f64, AppealRuling)> =
            votes.iter().filter(|(_, _, r)| *r == ruling).collect();
        let confidence = if majority.is_empty() {
            0.0
        } else {
            majority.iter().map(|(_, s, _)| *s).sum::<f64>() / majority.len() as f64
        };

        let reasoning = format!(
            "panel of {panel_size}: {overturn} overturn, {remand} remand, {uphold} uphold; \
             base merit {base:.2}"
        );
        tracing::info!(
            appeal_id = %appeal.id,
            session_id = %appeal.session_id,
            ruling = ?ruling,
            confidence,
            "appeal reviewed"
        );

        AppealDecision {
            appeal_id: appeal.id.clone(),
            ruling,
            confidence: confidence.clamp(0.0, 1.0),
            reasoning,
            reviewers: votes.into_iter().map(|(name, _, _)| name).collect(),
            decided_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::VerdictOutcome;

    fn verdict(confidence: f64) -> Verdict {
        Verdict {
            id: "v-1".to_string(),
            session_id: "s-1".to_string(),
            outcome: VerdictOutcome::Rejected,
            reasoning: Vec::new(),
            rules_applied: vec!["r-1".to_string()],
            evidence: Vec::new(),
            precedents: Vec::new(),
            confidence,
            issued_by: "arbiter".to_string(),
            issued_at: Utc::now(),
            audit_log: Vec::new(),
        }
    }

    fn strong_appeal() -> Appeal {
        Appeal::new(
            "s-1",
            "agent-owner",
            "The original evaluation relied on a CI log from a stale run; the attached \
             artifacts show the review actually happened before the deploy, the approver \
             had the required role, and the deployment window was an approved exception \
             published in the maintenance calendar two weeks earlier.",
        )
        .with_new_evidence("review approval timestamped before deploy")
        .with_new_evidence("approver role export")
        .with_new_evidence("maintenance calendar entry")
    }

    #[test]
    fn test_strong_appeal_is_overturned() {
        let arbitrator = AppealArbitrator::default();
        let decision = arbitrator.review(&strong_appeal(), &verdict(0.95));

        assert_eq!(decision.ruling, AppealRuling::Overturned);
        assert!(decision.confidence > 0.8);
        assert_eq!(decision.reviewers.len(), 3);
    }

    #[test]
    fn test_empty_appeal_is_upheld() {
        let arbitrator = AppealArbitrator::default();
        let appeal = Appeal::new("s-1", "someone", "");
        let decision = arbitrator.review(&appeal, &verdict(0.95));

        assert_eq!(decision.ruling, AppealRuling::Upheld);
    }

    #[test]
    fn test_middling_appeal_is_remanded() {
        let arbitrator = AppealArbitrator::default();
        let appeal = Appeal::new(
            "s-1",
            "someone",
            "The evaluation may not have considered the emergency exception process.",
        )
        .with_new_evidence("incident ticket");
        let decision = arbitrator.review(&appeal, &verdict(0.95));

        assert_eq!(decision.ruling, AppealRuling::Remanded);
    }

    #[test]
    fn test_deterministic() {
        let arbitrator = AppealArbitrator::default();
        let appeal = strong_appeal();
        let original = verdict(0.9);

        let first = arbitrator.review(&appeal, &original);
        let second = arbitrator.review(&appeal, &original);
        assert_eq!(first.ruling, second.ruling);
        assert!((first.confidence - second.confidence).abs() < f64::EPSILON);
    }
}
