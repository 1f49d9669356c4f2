//! Conductor-Core: Shared Domain Model & Cross-Cutting Primitives
//!
//! Everything the scheduling and arbitration planes have in common lives
//! here: the task model, the error taxonomy, the in-process event bus, the
//! FIFO exclusive lock wrapping queue/assignment critical sections, and the
//! bounded-backoff retry helper used around persistence calls.

pub mod error;
pub mod events;
pub mod lock;
pub mod retry;
pub mod types;

// Re-exports
pub use error::{Classify, ErrorKind, FaultReport};
pub use events::{
    DispatchMode, Event, EventBus, EventBusConfig, EventBusStats, EventFilter, EventSeverity,
};
pub use lock::{FifoLock, FifoLockGuard};
pub use retry::{retry, RetryConfig};
pub use types::{
    AgentCapabilities, Budget, Task, TaskState, TaskStatus, TaskType, DEFAULT_TASK_TIMEOUT_MS,
};
