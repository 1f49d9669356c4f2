//! Conductor-Gate: Command Allowlist Validator
//!
//! Screens shell invocations requested by agents. A command passes only if
//! its resolved base name is on the allowlist and no argument carries a
//! shell metacharacter. Environment sanitization strips credential-bearing
//! variables before anything is handed to a subprocess.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::path::Path;

/// Maximum length of a single argument before it is rejected outright.
const DEFAULT_MAX_ARGUMENT_LENGTH: usize = 4096;

/// Substrings that must never appear in an argument.
const FORBIDDEN_SEQUENCES: &[&str] = &[
    ";", "|", "&", "`", "$(", "${", "*", "?", "<", ">", "\0",
];

/// Case-insensitive name fragments that mark a variable as sensitive.
const SENSITIVE_FRAGMENTS: &[&str] = &["PASSWORD", "SECRET", "TOKEN", "CREDENTIAL", "PRIVATE_KEY"];

/// Case-insensitive name prefixes that mark a variable as sensitive.
const SENSITIVE_PREFIXES: &[&str] = &["AWS_", "API_KEY"];

/// Variables always preserved, sensitive-looking or not.
const SAFE_VARS: &[&str] = &["PATH", "NODE_ENV", "HOME", "USER", "LANG", "TERM"];

/// Prefix for orchestrator-owned variables, always preserved.
const SAFE_PREFIX: &str = "CAWS_";

/// Command validation errors.
#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("command '{command}' is not on the allowlist")]
    CommandNotAllowed { command: String },

    #[error("argument {index} contains forbidden sequence '{sequence}'")]
    ForbiddenSequence { index: usize, sequence: String },

    #[error("argument {index} exceeds the {limit}-byte length cap")]
    ArgumentTooLong { index: usize, limit: usize },

    #[error("failed to load allowlist from {path}: {reason}")]
    AllowlistLoad { path: String, reason: String },
}

impl conductor_core::Classify for CommandError {
    fn kind(&self) -> conductor_core::ErrorKind {
        match self {
            Self::AllowlistLoad { .. } => conductor_core::ErrorKind::Transient,
            _ => conductor_core::ErrorKind::Precondition,
        }
    }
}

/// Allowlist-based validator for shell commands.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandValidator {
    /// Allowed base command names (e.g. "npm", "git")
    allowlist: BTreeSet<String>,
    /// Per-argument length cap
    max_argument_length: usize,
}

impl CommandValidator {
    /// Build a validator from an iterator of allowed base names.
    pub fn new<I, S>(allowed: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            allowlist: allowed.into_iter().map(Into::into).collect(),
            max_argument_length: DEFAULT_MAX_ARGUMENT_LENGTH,
        }
    }

    /// Load the allowlist from a JSON array file (e.g. `["npm", "git"]`).
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, CommandError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| CommandError::AllowlistLoad {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        let names: Vec<String> =
            serde_json::from_str(&raw).map_err(|e| CommandError::AllowlistLoad {
                path: path.display().to_string(),
                reason: e.to_string(),
            })?;
        tracing::info!(count = names.len(), path = %path.display(), "command allowlist loaded");
        Ok(Self::new(names))
    }

    /// Override the argument length cap.
    pub fn with_max_argument_length(mut self, limit: usize) -> Self {
        self.max_argument_length = limit;
        self
    }

    /// Resolve a command path to its base name: `/usr/bin/npm` → `npm`.
    pub fn resolve_base_name(command: &str) -> &str {
        command.rsplit('/').next().unwrap_or(command)
    }

    /// True if the resolved base name is on the allowlist.
    pub fn is_command_allowed(&self, command: &str) -> bool {
        self.allowlist.contains(Self::resolve_base_name(command))
    }

    /// Validate a full invocation: allowlisted base name plus clean args.
    pub fn validate_invocation(
        &self,
        command: &str,
        args: &[String],
    ) -> Result<(), CommandError> {
        if !self.is_command_allowed(command) {
            return Err(CommandError::CommandNotAllowed {
                command: command.to_string(),
            });
        }
        self.validate_arguments(args)
    }

    /// Reject any argument containing a shell metacharacter or exceeding the
    /// length cap.
    pub fn validate_arguments(&self, args: &[String]) -> Result<(), CommandError> {
        for (index, arg) in args.iter().enumerate() {
            if arg.len() > self.max_argument_length {
                return Err(CommandError::ArgumentTooLong {
                    index,
                    limit: self.max_argument_length,
                });
            }
            for sequence in FORBIDDEN_SEQUENCES {
                if arg.contains(sequence) {
                    return Err(CommandError::ForbiddenSequence {
                        index,
                        sequence: (*sequence).to_string(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Drop credential-bearing variables, keeping orchestrator-owned and
    /// well-known safe ones.
    pub fn sanitize_environment(
        &self,
        env: &HashMap<String, String>,
    ) -> HashMap<String, String> {
        env.iter()
            .filter(|(name, _)| {
                let upper = name.to_uppercase();
                if upper.starts_with(SAFE_PREFIX) || SAFE_VARS.contains(&upper.as_str()) {
                    return true;
                }
                let sensitive = SENSITIVE_PREFIXES.iter().any(|p| upper.starts_with(p))
                    || SENSITIVE_FRAGMENTS.iter().any(|f| upper.contains(f));
                if sensitive {
                    tracing::debug!(variable = %name, "stripping sensitive environment variable");
                }
                !sensitive
            })
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Number of allowlisted commands.
    pub fn allowlist_len(&self) -> usize {
        self.allowlist.len()
    }
}
