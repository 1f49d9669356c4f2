//! Conductor-Orchestrator: Configuration

use crate::assignment::AssignmentConfig;
use crate::queue::QueueConfig;
use conductor_arbiter::ArbitrationConfig;
use conductor_core::EventBusConfig;
use conductor_gate::SecurityConfig;
use conductor_routing::{BanditConfig, RegistryConfig, RouterConfig};

/// Persistence configuration.
#[derive(Debug, Clone)]
pub struct PersistenceConfig {
    /// Whether the SQLite store is attached
    pub enabled: bool,
    /// Database path; `":memory:"` for ephemeral
    pub database_path: String,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            database_path: "conductor.db".to_string(),
        }
    }
}

/// Top-level orchestrator configuration, one section per subsystem.
#[derive(Debug, Clone, Default)]
pub struct OrchestratorConfig {
    pub events: EventBusConfig,
    pub queue: QueueConfig,
    pub registry: RegistryConfig,
    pub bandit: BanditConfig,
    pub router: RouterConfig,
    pub assignment: AssignmentConfig,
    pub arbitration: ArbitrationConfig,
    pub security: SecurityConfig,
    pub persistence: PersistenceConfig,
    /// Base command names agents may invoke; empty list denies everything
    pub command_allowlist: Vec<String>,
    /// Optional JSON allowlist file overriding `command_allowlist`
    pub command_allowlist_path: Option<String>,
}
