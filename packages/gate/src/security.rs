//! Conductor-Gate: Security Context
//!
//! Token authentication, role-based permissions, and per-actor rate
//! limiting. Every decision is recorded in the audit log.

use crate::audit::{AuditEntry, AuditLog, AuditOutcome};
use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;

/// Operations a caller can be granted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Permission {
    /// Enqueue tasks
    SubmitTask,
    /// Cancel queued or running tasks
    CancelTask,
    /// Register agents
    CreateAgent,
    /// Remove agents
    DeleteAgent,
    /// Read task/agent/session status
    ViewStatus,
    /// Load or change constitutional rules
    ManageRules,
    /// Start arbitration sessions and submit waivers/appeals
    Arbitrate,
}

impl Permission {
    /// Stable string form used in audit entries.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SubmitTask => "submit_task",
            Self::CancelTask => "cancel_task",
            Self::CreateAgent => "create_agent",
            Self::DeleteAgent => "delete_agent",
            Self::ViewStatus => "view_status",
            Self::ManageRules => "manage_rules",
            Self::Arbitrate => "arbitrate",
        }
    }
}

/// Caller role, mapped to a fixed permission set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Full control
    Admin,
    /// Operates the task pipeline
    Operator,
    /// An agent reporting its own progress
    Agent,
    /// Read-only access
    Viewer,
}

impl Role {
    /// Permissions granted by this role.
    pub fn permissions(&self) -> &'static [Permission] {
        match self {
            Self::Admin => &[
                Permission::SubmitTask,
                Permission::CancelTask,
                Permission::CreateAgent,
                Permission::DeleteAgent,
                Permission::ViewStatus,
                Permission::ManageRules,
                Permission::Arbitrate,
            ],
            Self::Operator => &[
                Permission::SubmitTask,
                Permission::CancelTask,
                Permission::ViewStatus,
                Permission::Arbitrate,
            ],
            Self::Agent => &[Permission::ViewStatus],
            Self::Viewer => &[Permission::ViewStatus],
        }
    }

    /// True if the role grants `permission`.
    pub fn grants(&self, permission: Permission) -> bool {
        self.permissions().contains(&permission)
    }
}

/// Credentials presented with a request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credentials {
    /// Actor identity (user or service name)
    pub actor: String,
    /// Bearer token, checked against the stored digest
    pub token: String,
}

/// Authenticated caller context returned on success.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthContext {
    /// Authenticated actor
    pub actor: String,
    /// Resolved role
    pub role: Role,
}

/// Security context configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityConfig {
    /// Master switch; when false every check passes as an anonymous admin
    pub enabled: bool,
    /// actor → hex-encoded SHA-256 digest of the actor's token
    pub token_digests: HashMap<String, String>,
    /// actor → role; actors absent here default to Viewer
    pub roles: HashMap<String, Role>,
    /// Authorization requests allowed per actor per minute
    pub rate_limit_per_minute: u32,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            token_digests: HashMap::new(),
            roles: HashMap::new(),
            rate_limit_per_minute: 600,
        }
    }
}

impl SecurityConfig {
    /// Register an actor's token digest and role. Registration alone does
    /// not turn enforcement on; see [`SecurityConfig::enabled`].
    pub fn with_actor(
        mut self,
        actor: impl Into<String>,
        token: &str,
        role: Role,
    ) -> Self {
        let actor = actor.into();
        self.token_digests
            .insert(actor.clone(), token_digest(token));
        self.roles.insert(actor, role);
        self
    }

    /// Toggle the enforcement master switch.
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }
}

/// Hex SHA-256 digest of a token.
pub fn token_digest(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// Security check errors.
#[derive(Debug, thiserror::Error)]
pub enum SecurityError {
    #[error("authentication failed for actor '{actor}'")]
    AuthenticationFailed { actor: String },

    #[error("actor '{actor}' lacks permission '{permission}'")]
    PermissionDenied { actor: String, permission: String },

    #[error("actor '{actor}' exceeded {limit} requests per minute")]
    RateLimited { actor: String, limit: u32 },
}

impl conductor_core::Classify for SecurityError {
    fn kind(&self) -> conductor_core::ErrorKind {
        conductor_core::ErrorKind::Authorization
    }
}

/// Fixed-window per-actor rate limiter.
#[derive(Debug)]
pub struct RateLimiter {
    limit: u32,
    windows: Mutex<HashMap<String, (i64, u32)>>,
}

impl RateLimiter {
    /// Limiter allowing `limit` hits per actor per minute.
    pub fn new(limit: u32) -> Self {
        Self {
            limit,
            windows: Mutex::new(HashMap::new()),
        }
    }

    /// Register a hit; false once the actor's window is exhausted.
    pub fn check(&self, actor: &str) -> bool {
        let minute = Utc::now().timestamp() / 60;
        let mut windows = self.windows.lock();
        let entry = windows.entry(actor.to_string()).or_insert((minute, 0));
        if entry.0 != minute {
            *entry = (minute, 0);
        }
        if entry.1 >= self.limit {
            return false;
        }
        entry.1 += 1;
        true
    }
}

/// Authentication + authorization + rate limiting, with audit.
pub struct SecurityContext {
    config: SecurityConfig,
    rate_limiter: RateLimiter,
    audit: AuditLog,
}

impl SecurityContext {
    /// Build a context from configuration.
    pub fn new(config: SecurityConfig) -> Self {
        let rate_limiter = RateLimiter::new(config.rate_limit_per_minute);
        Self {
            config,
            rate_limiter,
            audit: AuditLog::new(),
        }
    }

    /// Whether security checks are active.
    pub fn enabled(&self) -> bool {
        self.config.enabled
    }

    /// The audit log receiving every decision.
    pub fn audit_log(&self) -> &AuditLog {
        &self.audit
    }

    /// Verify the presented token against the stored digest.
    pub async fn authenticate(
        &self,
        credentials: &Credentials,
    ) -> Result<AuthContext, SecurityError> {
        if !self.config.enabled {
            return Ok(AuthContext {
                actor: credentials.actor.clone(),
                role: Role::Admin,
            });
        }

        let expected = self.config.token_digests.get(&credentials.actor);
        let presented = token_digest(&credentials.token);
        match expected {
            Some(digest) if *digest == presented => {
                let role = self
                    .config
                    .roles
                    .get(&credentials.actor)
                    .copied()
                    .unwrap_or(Role::Viewer);
                Ok(AuthContext {
                    actor: credentials.actor.clone(),
                    role,
                })
            }
            _ => {
                self.audit
                    .record(
                        AuditEntry::new(&credentials.actor, "authenticate", AuditOutcome::Denied)
                            .with_reason("token mismatch or unknown actor"),
                    )
                    .await;
                Err(SecurityError::AuthenticationFailed {
                    actor: credentials.actor.clone(),
                })
            }
        }
    }

    /// Authenticate, rate-limit, and check the permission. Audits every
    /// outcome.
    pub async fn authorize(
        &self,
        credentials: &Credentials,
        permission: Permission,
    ) -> Result<AuthContext, SecurityError> {
        let auth = self.authenticate(credentials).await?;

        if !self.config.enabled {
            return Ok(auth);
        }

        if !self.rate_limiter.check(&auth.actor) {
            self.audit
                .record(
                    AuditEntry::new(&auth.actor, permission.as_str(), AuditOutcome::RateLimited)
                        .with_reason(format!(
                            "over {} requests/minute",
                            self.config.rate_limit_per_minute
                        )),
                )
                .await;
            return Err(SecurityError::RateLimited {
                actor: auth.actor,
                limit: self.config.rate_limit_per_minute,
            });
        }

        if !auth.role.grants(permission) {
            self.audit
                .record(
                    AuditEntry::new(&auth.actor, permission.as_str(), AuditOutcome::Denied)
                        .with_reason(format!("role {:?} does not grant it", auth.role)),
                )
                .await;
            return Err(SecurityError::PermissionDenied {
                actor: auth.actor,
                permission: permission.as_str().to_string(),
            });
        }

        self.audit
            .record(AuditEntry::new(
                &auth.actor,
                permission.as_str(),
                AuditOutcome::Granted,
            ))
            .await;
        Ok(auth)
    }
}
