//! Conductor-Core: Error Taxonomy
//!
//! Every subsystem keeps its own `thiserror` enum; this module supplies the
//! shared classification those enums map into, so the orchestrator can make
//! uniform retry/surface decisions without matching on concrete types.

use serde::{Deserialize, Serialize};

/// Broad classification of a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Invalid input, wrong state, or an otherwise malformed request
    Precondition,
    /// Capacity exceeded; the caller should back off and retry
    Saturation,
    /// Authentication, permission, or rate-limit failure
    Authorization,
    /// Referenced agent/task/session/appeal does not exist
    NotFound,
    /// Persistence or external call failure that may succeed on retry
    Transient,
    /// Field missing or out of range; clamped and logged, never fatal
    PartialData,
    /// Invariant violation; the affected unit is failed, the process stays up
    Fatal,
}

impl ErrorKind {
    /// Only transient I/O failures are worth retrying automatically.
    pub fn retriable(self) -> bool {
        matches!(self, Self::Transient)
    }
}

/// Implemented by subsystem error enums so callers can classify without
/// knowing the concrete type.
pub trait Classify {
    /// The broad kind of this error.
    fn kind(&self) -> ErrorKind;

    /// Whether an automatic retry is reasonable.
    fn retriable(&self) -> bool {
        self.kind().retriable()
    }
}

/// Wire shape of a surfaced failure, used by the protocol facade.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FaultReport {
    /// Broad classification
    pub kind: ErrorKind,
    /// Human-readable message
    pub message: String,
    /// Whether the caller may retry
    pub retriable: bool,
    /// Extra context (ids, limits, offending values)
    #[serde(default)]
    pub context: serde_json::Value,
}

impl FaultReport {
    /// Build a report from any classified error.
    pub fn from_error<E: Classify + std::fmt::Display>(err: &E) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
            retriable: err.retriable(),
            context: serde_json::Value::Null,
        }
    }

    /// Attach context to the report.
    pub fn with_context(mut self, context: serde_json::Value) -> Self {
        self.context = context;
        self
    }
}
