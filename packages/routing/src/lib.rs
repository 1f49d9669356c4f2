//! Conductor-Routing: Agent Selection Plane
//!
//! The registry catalogs agents by capability and keeps incremental
//! performance statistics; the router matches a task's requirements against
//! the catalog and picks an agent, either by weighted capability scoring or
//! by the multi-armed bandit balancing exploration against exploitation.

pub mod bandit;
pub mod profile;
pub mod registry;
pub mod router;
pub mod types;

// Re-exports
pub use bandit::{BanditConfig, BanditStats, MultiArmedBandit};
pub use profile::{AgentLoad, AgentProfile, ModelFamily, PerformanceHistory};
pub use registry::{
    AgentRegistry, AgentStore, RegistryConfig, RegistryError, RegistryStats, ScoredAgent,
    StoreError,
};
pub use router::{RouterConfig, RouterError, RouterMetrics, TaskRouter};
pub use types::{
    CapabilityQuery, RoutingAlternative, RoutingDecision, RoutingOutcome, RoutingStrategy,
};
