//! Conductor-Arbiter: Rule Packs
//!
//! Constitutional rules are authored as YAML documents and loaded at boot.
//!
//! # Example Rule Pack (YAML)
//!
//! ```yaml
//! rules:
//!   - id: no-unreviewed-deploy
//!     category: safety
//!     title: Deploys require review
//!     condition: "violation.location == 'deploy' && !context.reviewed"
//!     severity: high
//!     waivable: false
//!     required_evidence: [ci-log]
//!     effective_date: 2025-01-01T00:00:00Z
//!
//!   - id: budget-loc-cap
//!     category: budget
//!     title: Stay within the LOC budget
//!     condition: "context.loc_delta > context.loc_budget"
//!     severity: medium
//!     waivable: true
//!     effective_date: 2025-01-01T00:00:00Z
//! ```

use crate::types::ConstitutionalRule;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Rule pack loading errors.
#[derive(Debug, thiserror::Error)]
pub enum RuleError {
    #[error("failed to read rule pack {path}: {reason}")]
    Io { path: String, reason: String },

    #[error("failed to parse rule pack: {reason}")]
    Parse { reason: String },

    #[error("duplicate rule id '{rule_id}'")]
    DuplicateRule { rule_id: String },

    #[error("rule '{rule_id}' has an empty condition")]
    EmptyCondition { rule_id: String },
}

impl conductor_core::Classify for RuleError {
    fn kind(&self) -> conductor_core::ErrorKind {
        match self {
            Self::Io { .. } => conductor_core::ErrorKind::Transient,
            _ => conductor_core::ErrorKind::Precondition,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct RulePack {
    rules: Vec<ConstitutionalRule>,
}

/// An immutable, validated collection of constitutional rules.
#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    rules: Vec<ConstitutionalRule>,
}

impl RuleSet {
    /// Build a rule set, validating id uniqueness and non-empty conditions.
    pub fn new(rules: Vec<ConstitutionalRule>) -> Result<Self, RuleError> {
        let mut seen = std::collections::HashSet::new();
        for rule in &rules {
            if !seen.insert(rule.id.clone()) {
                return Err(RuleError::DuplicateRule {
                    rule_id: rule.id.clone(),
                });
            }
            if rule.condition.trim().is_empty() {
                return Err(RuleError::EmptyCondition {
                    rule_id: rule.id.clone(),
                });
            }
        }
        Ok(Self { rules })
    }

    /// Parse a YAML rule pack.
    pub fn from_yaml(yaml: &str) -> Result<Self, RuleError> {
        let pack: RulePack = serde_yaml::from_str(yaml).map_err(|e| RuleError::Parse {
            reason: e.to_string(),
        })?;
        Self::new(pack.rules)
    }

    /// Load a YAML rule pack from disk.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, RuleError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| RuleError::Io {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        let set = Self::from_yaml(&raw)?;
        tracing::info!(count = set.len(), path = %path.display(), "rule pack loaded");
        Ok(set)
    }

    /// All rules.
    pub fn rules(&self) -> &[ConstitutionalRule] {
        &self.rules
    }

    /// Look up a rule by id.
    pub fn get(&self, rule_id: &str) -> Option<&ConstitutionalRule> {
        self.rules.iter().find(|r| r.id == rule_id)
    }

    /// Rules in force at `now`.
    pub fn active_at(&self, now: DateTime<Utc>) -> Vec<&ConstitutionalRule> {
        self.rules
            .iter()
            .filter(|r| r.activity(now) == crate::types::RuleActivity::Active)
            .collect()
    }

    /// Number of rules.
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// True if the set is empty.
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{RuleCategory, Severity};

    const PACK: &str = r#"
rules:
  - id: no-unreviewed-deploy
    category: safety
    title: Deploys require review
    condition: "violation.location == 'deploy'"
    severity: high
    waivable: false
    required_evidence: [ci-log]
    effective_date: 2025-01-01T00:00:00Z

  - id: budget-loc-cap
    category: budget
    title: Stay within the LOC budget
    condition: "context.loc_delta > 500"
    severity: medium
    waivable: true
    effective_date: 2025-01-01T00:00:00Z
"#;

    #[test]
    fn test_pack_parses() {
        let set = RuleSet::from_yaml(PACK).unwrap();
        assert_eq!(set.len(), 2);

        let rule = set.get("no-unreviewed-deploy").unwrap();
        assert_eq!(rule.category, RuleCategory::Safety);
        assert_eq!(rule.severity, Severity::High);
        assert!(!rule.waivable);
        assert_eq!(rule.required_evidence, vec!["ci-log".to_string()]);

        assert!(set.get("budget-loc-cap").unwrap().waivable);
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        let rule = ConstitutionalRule::new(
            "r-1",
            RuleCategory::Quality,
            "t",
            "violation.severity == 'low'",
            Severity::Low,
        );
        let result = RuleSet::new(vec![rule.clone(), rule]);
        assert!(matches!(result, Err(RuleError::DuplicateRule { .. })));
    }

    #[test]
    fn test_empty_condition_rejected() {
        let rule =
            ConstitutionalRule::new("r-1", RuleCategory::Quality, "t", "  ", Severity::Low);
        assert!(matches!(
            RuleSet::new(vec![rule]),
            Err(RuleError::EmptyCondition { .. })
        ));
    }

    #[test]
    fn test_active_filter() {
        let set = RuleSet::from_yaml(PACK).unwrap();
        assert_eq!(set.active_at(Utc::now()).len(), 2);
        assert_eq!(
            set.active_at("2024-01-01T00:00:00Z".parse().unwrap()).len(),
            0
        );
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rules.yaml");
        std::fs::write(&path, PACK).unwrap();

        let set = RuleSet::from_file(&path).unwrap();
        assert_eq!(set.len(), 2);
    }
}
