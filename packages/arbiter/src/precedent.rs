//! Conductor-Arbiter: Precedent Manager
//!
//! Stores high-confidence verdicts and serves similarity lookups during rule
//! evaluation. Similarity is Jaccard over the token set
//! `{category, severity} ∪ key_facts`.

use crate::types::{Precedent, RuleCategory, Severity, Verdict};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Precedent manager configuration.
#[derive(Debug, Clone)]
pub struct PrecedentConfig {
    /// Maximum stored precedents; the oldest are pruned beyond this
    pub max_precedents: usize,
    /// Minimum Jaccard similarity for a lookup hit
    pub similarity_threshold: f64,
    /// Maximum hits returned per lookup
    pub max_results: usize,
}

impl Default for PrecedentConfig {
    fn default() -> Self {
        Self {
            max_precedents: 1_000,
            similarity_threshold: 0.5,
            max_results: 5,
        }
    }
}

/// Precedent counters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PrecedentStats {
    pub total_precedents: usize,
    pub total_citations: u64,
}

/// In-memory precedent store with similarity lookup.
pub struct PrecedentManager {
    config: PrecedentConfig,
    precedents: Arc<RwLock<HashMap<String, Precedent>>>,
}

impl PrecedentManager {
    /// Create a manager with the given configuration.
    pub fn new(config: PrecedentConfig) -> Self {
        Self {
            config,
            precedents: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Derive a precedent from a verdict and store it.
    pub async fn store_from_verdict(
        &self,
        verdict: &Verdict,
        title: impl Into<String>,
        category: RuleCategory,
        severity: Severity,
        key_facts: Vec<String>,
    ) -> Precedent {
        let summary = verdict
            .reasoning
            .iter()
            .map(|step| step.description.as_str())
            .collect::<Vec<_>>()
            .join("; ");

        let precedent = Precedent {
            id: Uuid::new_v4().to_string(),
            title: title.into(),
            rules_involved: verdict.rules_applied.clone(),
            verdict_id: verdict.id.clone(),
            outcome: verdict.outcome,
            category,
            severity,
            key_facts,
            reasoning_summary: summary,
            applicability: format!(
                "{} violations of {} severity",
                category.as_str(),
                severity.as_str()
            ),
            citation_count: 0,
            last_cited_at: None,
            created_at: Utc::now(),
        };

        self.store(precedent.clone()).await;
        precedent
    }

    /// Store a precedent, pruning the oldest beyond capacity.
    pub async fn store(&self, precedent: Precedent) {
        let mut precedents = self.precedents.write().await;
        while precedents.len() >= self.config.max_precedents {
            let oldest = precedents
                .values()
                .min_by_key(|p| p.created_at)
                .map(|p| p.id.clone());
            match oldest {
                Some(id) => {
                    precedents.remove(&id);
                }
                None => break,
            }
        }
        tracing::debug!(precedent_id = %precedent.id, title = %precedent.title, "precedent stored");
        precedents.insert(precedent.id.clone(), precedent);
    }

    /// Look up a precedent by id.
    pub async fn get(&self, precedent_id: &str) -> Option<Precedent> {
        self.precedents.read().await.get(precedent_id).cloned()
    }

    fn tokens(category: RuleCategory, severity: Severity, key_facts: &[String]) -> BTreeSet<String> {
        let mut tokens: BTreeSet<String> = key_facts
            .iter()
            .map(|f| f.trim().to_lowercase())
            .filter(|f| !f.is_empty())
            .collect();
        tokens.insert(category.as_str().to_string());
        tokens.insert(severity.as_str().to_string());
        tokens
    }

    fn jaccard(a: &BTreeSet<String>, b: &BTreeSet<String>) -> f64 {
        if a.is_empty() && b.is_empty() {
            return 0.0;
        }
        let intersection = a.intersection(b).count() as f64;
        let union = a.union(b).count() as f64;
        intersection / union
    }

    /// Precedents similar to the given case, best first, citation counters
    /// bumped on every hit.
    pub async fn find_similar(
        &self,
        category: RuleCategory,
        severity: Severity,
        key_facts: &[String],
    ) -> Vec<Precedent> {
        let query = Self::tokens(category, severity, key_facts);

        let mut scored: Vec<(f64, String)> = {
            let precedents = self.precedents.read().await;
            precedents
                .values()
                .map(|p| {
                    let candidate = Self::tokens(p.category, p.severity, &p.key_facts);
                    (Self::jaccard(&query, &candidate), p.id.clone())
                })
                .filter(|(score, _)| *score >= self.config.similarity_threshold)
                .collect()
        };
        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(self.config.max_results);

        let mut hits = Vec::with_capacity(scored.len());
        let mut precedents = self.precedents.write().await;
        for (_, id) in scored {
            if let Some(precedent) = precedents.get_mut(&id) {
                precedent.citation_count += 1;
                precedent.last_cited_at = Some(Utc::now());
                hits.push(precedent.clone());
            }
        }
        hits
    }

    /// Number of stored precedents.
    pub async fn count(&self) -> usize {
        self.precedents.read().await.len()
    }

    /// Snapshot of precedent counters.
    pub async fn stats(&self) -> PrecedentStats {
        let precedents = self.precedents.read().await;
        PrecedentStats {
            total_precedents: precedents.len(),
            total_citations: precedents.values().map(|p| p.citation_count).sum(),
        }
    }
}

impl Default for PrecedentManager {
    fn default() -> Self {
        Self::new(PrecedentConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::VerdictOutcome;

    fn precedent(id: &str, category: RuleCategory, severity: Severity, facts: &[&str]) -> Precedent {
        Precedent {
            id: id.to_string(),
            title: format!("Precedent {id}"),
            rules_involved: vec!["r-1".to_string()],
            verdict_id: "v-1".to_string(),
            outcome: VerdictOutcome::Rejected,
            category,
            severity,
            key_facts: facts.iter().map(|s| s.to_string()).collect(),
            reasoning_summary: String::new(),
            applicability: String::new(),
            citation_count: 0,
            last_cited_at: None,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_exact_match_is_similar() {
        let manager = PrecedentManager::default();
        manager
            .store(precedent(
                "p-1",
                RuleCategory::Safety,
                Severity::High,
                &["deploy", "no-review"],
            ))
            .await;

        let hits = manager
            .find_similar(
                RuleCategory::Safety,
                Severity::High,
                &["deploy".to_string(), "no-review".to_string()],
            )
            .await;
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].citation_count, 1);
        assert!(hits[0].last_cited_at.is_some());
    }

    #[tokio::test]
    async fn test_dissimilar_case_misses() {
        let manager = PrecedentManager::default();
        manager
            .store(precedent(
                "p-1",
                RuleCategory::Safety,
                Severity::High,
                &["deploy", "no-review"],
            ))
            .await;

        let hits = manager
            .find_similar(
                RuleCategory::Budget,
                Severity::Low,
                &["loc-overrun".to_string()],
            )
            .await;
        assert!(hits.is_empty());
    }

    #[tokio::test]
    async fn test_capacity_prunes_oldest() {
        let manager = PrecedentManager::new(PrecedentConfig {
            max_precedents: 2,
            ..PrecedentConfig::default()
        });
        for id in ["p-1", "p-2", "p-3"] {
            manager
                .store(precedent(id, RuleCategory::Safety, Severity::High, &["x"]))
                .await;
            // Distinct created_at ordering
            tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        }

        assert_eq!(manager.count().await, 2);
        assert!(manager.get("p-1").await.is_none());
        assert!(manager.get("p-3").await.is_some());
    }

    #[tokio::test]
    async fn test_results_capped() {
        let manager = PrecedentManager::new(PrecedentConfig {
            max_results: 2,
            ..PrecedentConfig::default()
        });
        for id in ["p-1", "p-2", "p-3", "p-4"] {
            manager
                .store(precedent(id, RuleCategory::Safety, Severity::High, &["x"]))
                .await;
        }

        let hits = manager
            .find_similar(RuleCategory::Safety, Severity::High, &["x".to_string()])
            .await;
        assert_eq!(hits.len(), 2);
    }
}
