//! Conductor-Gate: Security Audit Log
//!
//! Every authentication and authorization decision lands here. Bounded
//! in-memory ledger with query helpers and JSON export.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Maximum entries kept in memory (oldest are pruned).
const DEFAULT_MAX_ENTRIES: usize = 100_000;

/// Outcome of an audited security decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOutcome {
    /// Access granted
    Granted,
    /// Authentication or permission check failed
    Denied,
    /// Rejected by the rate limiter
    RateLimited,
}

/// A single audit entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    /// Unique entry id
    pub id: Uuid,
    /// Decision timestamp
    pub timestamp: DateTime<Utc>,
    /// Actor the decision concerned
    pub actor: String,
    /// Attempted action (permission name or operation)
    pub action: String,
    /// Resource acted on, if any
    pub resource: Option<String>,
    /// Decision outcome
    pub outcome: AuditOutcome,
    /// Human-readable reason
    pub reason: String,
    /// Additional metadata
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl AuditEntry {
    /// Create an entry.
    pub fn new(
        actor: impl Into<String>,
        action: impl Into<String>,
        outcome: AuditOutcome,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            actor: actor.into(),
            action: action.into(),
            resource: None,
            outcome,
            reason: String::new(),
            metadata: serde_json::Value::Null,
        }
    }

    /// Set the resource.
    pub fn with_resource(mut self, resource: impl Into<String>) -> Self {
        self.resource = Some(resource.into());
        self
    }

    /// Set the reason.
    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = reason.into();
        self
    }

    /// Attach metadata.
    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Bounded audit log.
#[derive(Debug, Clone)]
pub struct AuditLog {
    entries: Arc<RwLock<VecDeque<AuditEntry>>>,
    max_entries: usize,
}

impl Default for AuditLog {
    fn default() -> Self {
        Self::new()
    }
}

impl AuditLog {
    /// Create a log with default capacity.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_MAX_ENTRIES)
    }

    /// Create a log with custom capacity.
    pub fn with_capacity(max_entries: usize) -> Self {
        Self {
            entries: Arc::new(RwLock::new(VecDeque::new())),
            max_entries,
        }
    }

    /// Append an entry, pruning the oldest beyond capacity.
    pub async fn record(&self, entry: AuditEntry) {
        let mut entries = self.entries.write().await;
        while entries.len() >= self.max_entries {
            entries.pop_front();
        }
        entries.push_back(entry);
    }

    /// Total entries held.
    pub async fn count(&self) -> usize {
        self.entries.read().await.len()
    }

    /// Entries for a given actor.
    pub async fn query_by_actor(&self, actor: &str) -> Vec<AuditEntry> {
        let entries = self.entries.read().await;
        entries.iter().filter(|e| e.actor == actor).cloned().collect()
    }

    /// Entries for a given action.
    pub async fn query_by_action(&self, action: &str) -> Vec<AuditEntry> {
        let entries = self.entries.read().await;
        entries.iter().filter(|e| e.action == action).cloned().collect()
    }

    /// Entries with a given outcome.
    pub async fn query_by_outcome(&self, outcome: AuditOutcome) -> Vec<AuditEntry> {
        let entries = self.entries.read().await;
        entries.iter().filter(|e| e.outcome == outcome).cloned().collect()
    }

    /// Entries within `[start, end]`.
    pub async fn query_by_time_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Vec<AuditEntry> {
        let entries = self.entries.read().await;
        entries
            .iter()
            .filter(|e| e.timestamp >= start && e.timestamp <= end)
            .cloned()
            .collect()
    }

    /// Export the full log as pretty JSON.
    pub async fn export_json(&self) -> Result<String, serde_json::Error> {
        let entries = self.entries.read().await;
        let all: Vec<_> = entries.iter().collect();
        serde_json::to_string_pretty(&all)
    }

    /// Aggregate counts for reporting.
    pub async fn statistics(&self) -> AuditStatistics {
        let entries = self.entries.read().await;
        let total = entries.len();
        let granted = entries
            .iter()
            .filter(|e| e.outcome == AuditOutcome::Granted)
            .count();
        let denied = entries
            .iter()
            .filter(|e| e.outcome == AuditOutcome::Denied)
            .count();
        let rate_limited = entries
            .iter()
            .filter(|e| e.outcome == AuditOutcome::RateLimited)
            .count();
        AuditStatistics {
            total,
            granted,
            denied,
            rate_limited,
        }
    }
}

/// Aggregate audit counts.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuditStatistics {
    pub total: usize,
    pub granted: usize,
    pub denied: usize,
    pub rate_limited: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_record_and_count() {
        let log = AuditLog::new();
        log.record(AuditEntry::new("alice", "submit_task", AuditOutcome::Granted))
            .await;
        assert_eq!(log.count().await, 1);
    }

    #[tokio::test]
    async fn test_query_by_actor() {
        let log = AuditLog::new();
        log.record(AuditEntry::new("alice", "submit_task", AuditOutcome::Granted))
            .await;
        log.record(AuditEntry::new("bob", "submit_task", AuditOutcome::Denied))
            .await;
        log.record(AuditEntry::new("alice", "create_agent", AuditOutcome::Denied))
            .await;

        assert_eq!(log.query_by_actor("alice").await.len(), 2);
        assert_eq!(log.query_by_outcome(AuditOutcome::Denied).await.len(), 2);
    }

    #[tokio::test]
    async fn test_capacity_prunes_oldest() {
        let log = AuditLog::with_capacity(2);
        for actor in ["a", "b", "c"] {
            log.record(AuditEntry::new(actor, "x", AuditOutcome::Granted))
                .await;
        }
        assert_eq!(log.count().await, 2);
        assert!(log.query_by_actor("a").await.is_empty());
    }

    #[tokio::test]
    async fn test_statistics() {
        let log = AuditLog::new();
        log.record(AuditEntry::new("a", "x", AuditOutcome::Granted)).await;
        log.record(AuditEntry::new("b", "x", AuditOutcome::Denied)).await;
        log.record(AuditEntry::new("c", "x", AuditOutcome::RateLimited))
            .await;

        let stats = log.statistics().await;
        assert_eq!(stats.total, 3);
        assert_eq!(stats.granted, 1);
        assert_eq!(stats.denied, 1);
        assert_eq!(stats.rate_limited, 1);
    }
}
