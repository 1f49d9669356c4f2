//! Conductor-Gate: Command & Access Control
//!
//! Answers "is this action allowed?" for the orchestrator:
//! - **Command validator**: allowlist of shell base commands, argument
//!   metacharacter screening, environment sanitization.
//! - **Security context**: token authentication, role-based permissions,
//!   per-actor rate limiting, with every decision written to the audit log.

pub mod audit;
pub mod command;
pub mod security;

// Re-exports
pub use audit::{AuditEntry, AuditLog, AuditOutcome, AuditStatistics};
pub use command::{CommandError, CommandValidator};
pub use security::{
    AuthContext, Credentials, Permission, RateLimiter, Role, SecurityConfig, SecurityContext,
    SecurityError,
};
