//! Conductor-Core: Event Bus
//!
//! Single-process publish/subscribe with a bounded retention ring, typed and
//! filtered subscriptions, and a configurable dispatch mode. Emission never
//! fails the caller: handler panics and timeouts are logged and swallowed.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use uuid::Uuid;

/// Well-known event types emitted by the control plane.
pub mod topics {
    pub const TASK_ENQUEUED: &str = "task.enqueued";
    pub const TASK_DEQUEUED: &str = "task.dequeued";
    pub const TASK_ASSIGNED: &str = "task.assigned";
    pub const TASK_ACKNOWLEDGED: &str = "task.acknowledged";
    pub const TASK_PROGRESS: &str = "task.progress";
    pub const TASK_COMPLETED: &str = "task.completed";
    pub const TASK_FAILED: &str = "task.failed";
    pub const TASK_TIMEOUT: &str = "task.timeout";
    pub const AGENT_REGISTERED: &str = "agent.registered";
    pub const AGENT_UNREGISTERED: &str = "agent.unregistered";
    pub const AGENT_PERFORMANCE_UPDATED: &str = "agent.performance.updated";
    pub const ROUTING_DECIDED: &str = "routing.decided";
    pub const ARBITRATION_STARTED: &str = "arbitration.started";
    pub const ARBITRATION_RULE_EVALUATED: &str = "arbitration.rule.evaluated";
    pub const ARBITRATION_VERDICT: &str = "arbitration.verdict";
    pub const ARBITRATION_WAIVER_DECIDED: &str = "arbitration.waiver.decided";
    pub const ARBITRATION_APPEAL_DECIDED: &str = "arbitration.appeal.decided";
    pub const ARBITRATION_COMPLETED: &str = "arbitration.completed";
    pub const ORCHESTRATOR_SHUTDOWN: &str = "orchestrator.shutdown";
}

/// Event severity.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "UPPERCASE")]
pub enum EventSeverity {
    Debug,
    Info,
    Warn,
    Error,
    Critical,
}

/// A structured event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Unique event id
    pub id: Uuid,
    /// Event type (see [`topics`])
    pub event_type: String,
    /// Emission timestamp
    pub timestamp: DateTime<Utc>,
    /// Severity
    pub severity: EventSeverity,
    /// Emitting subsystem
    pub source: String,
    /// Correlates related events across subsystems
    pub correlation_id: Option<String>,
    /// Arbitration session the event belongs to, if any
    pub session_id: Option<String>,
    /// Agent the event concerns, if any
    pub agent_id: Option<String>,
    /// Task the event concerns, if any
    pub task_id: Option<String>,
    /// Free-form payload
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl Event {
    /// Create an INFO event.
    pub fn new(event_type: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            event_type: event_type.into(),
            timestamp: Utc::now(),
            severity: EventSeverity::Info,
            source: source.into(),
            correlation_id: None,
            session_id: None,
            agent_id: None,
            task_id: None,
            metadata: serde_json::Value::Null,
        }
    }

    /// Set the severity.
    pub fn with_severity(mut self, severity: EventSeverity) -> Self {
        self.severity = severity;
        self
    }

    /// Set the correlation id.
    pub fn with_correlation(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    /// Set the session id.
    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    /// Set the agent id.
    pub fn with_agent(mut self, agent_id: impl Into<String>) -> Self {
        self.agent_id = Some(agent_id.into());
        self
    }

    /// Set the task id.
    pub fn with_task(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }

    /// Attach a payload.
    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Predicate applied on top of the declarative filter fields.
pub type EventPredicate = Arc<dyn Fn(&Event) -> bool + Send + Sync>;

/// Declarative event filter. Empty fields match everything.
#[derive(Clone, Default)]
pub struct EventFilter {
    /// Match any of these event types
    pub types: Option<Vec<String>>,
    /// Match any of these severities
    pub severities: Option<Vec<EventSeverity>>,
    /// Match any of these sources
    pub sources: Option<Vec<String>>,
    /// Match any of these agent ids
    pub agent_ids: Option<Vec<String>>,
    /// Match any of these task ids
    pub task_ids: Option<Vec<String>>,
    /// Custom predicate, applied last
    pub predicate: Option<EventPredicate>,
}

impl std::fmt::Debug for EventFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventFilter")
            .field("types", &self.types)
            .field("severities", &self.severities)
            .field("sources", &self.sources)
            .field("agent_ids", &self.agent_ids)
            .field("task_ids", &self.task_ids)
            .field("predicate", &self.predicate.is_some())
            .finish()
    }
}

impl EventFilter {
    /// Filter on a single event type.
    pub fn for_type(event_type: impl Into<String>) -> Self {
        Self {
            types: Some(vec![event_type.into()]),
            ..Self::default()
        }
    }

    /// Restrict to the given severities.
    pub fn with_severities(mut self, severities: Vec<EventSeverity>) -> Self {
        self.severities = Some(severities);
        self
    }

    /// Restrict to the given agent ids.
    pub fn with_agent_ids(mut self, agent_ids: Vec<String>) -> Self {
        self.agent_ids = Some(agent_ids);
        self
    }

    /// Restrict to the given task ids.
    pub fn with_task_ids(mut self, task_ids: Vec<String>) -> Self {
        self.task_ids = Some(task_ids);
        self
    }

    /// Attach a custom predicate.
    pub fn with_predicate(mut self, predicate: EventPredicate) -> Self {
        self.predicate = Some(predicate);
        self
    }

    /// True if the event passes every populated field.
    pub fn matches(&self, event: &Event) -> bool {
        if let Some(types) = &self.types {
            if !types.iter().any(|t| t == &event.event_type) {
                return false;
            }
        }
        if let Some(severities) = &self.severities {
            if !severities.contains(&event.severity) {
                return false;
            }
        }
        if let Some(sources) = &self.sources {
            if !sources.iter().any(|s| s == &event.source) {
                return false;
            }
        }
        if let Some(agent_ids) = &self.agent_ids {
            match &event.agent_id {
                Some(id) if agent_ids.contains(id) => {}
                _ => return false,
            }
        }
        if let Some(task_ids) = &self.task_ids {
            match &event.task_id {
                Some(id) if task_ids.contains(id) => {}
                _ => return false,
            }
        }
        if let Some(predicate) = &self.predicate {
            if !predicate(event) {
                return false;
            }
        }
        true
    }
}

/// Future returned by an event handler.
pub type HandlerFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// An async event handler.
pub type EventHandler = Arc<dyn Fn(Event) -> HandlerFuture + Send + Sync>;

/// Wrap an async closure into an [`EventHandler`].
pub fn handler<F, Fut>(f: F) -> EventHandler
where
    F: Fn(Event) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move |event| Box::pin(f(event)))
}

/// How emitted events reach their handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchMode {
    /// Handlers run inline on the emitting task, one after another
    Cooperative,
    /// Each handler is launched on its own task with a per-handler deadline
    Parallel,
}

/// Polls a handler future inline, turning a panic into an error value so an
/// inline handler cannot take the emitting task down. `HandlerFuture` is a
/// pinned box, so no structural pinning is needed.
struct CatchPanic(HandlerFuture);

impl Future for CatchPanic {
    type Output = Result<(), Box<dyn std::any::Any + Send>>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let inner = &mut self.get_mut().0;
        match std::panic::catch_unwind(AssertUnwindSafe(|| inner.as_mut().poll(cx))) {
            Ok(Poll::Pending) => Poll::Pending,
            Ok(Poll::Ready(())) => Poll::Ready(Ok(())),
            Err(panic) => Poll::Ready(Err(panic)),
        }
    }
}

/// Best-effort message out of a panic payload.
fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_string())
}

/// Event bus configuration.
#[derive(Debug, Clone)]
pub struct EventBusConfig {
    /// Ring capacity; oldest events are dropped beyond this
    pub max_events: usize,
    /// Events older than this are pruned by the retention sweep
    pub retention_ms: u64,
    /// Per-handler deadline
    pub handler_timeout_ms: u64,
    /// Dispatch mode
    pub dispatch: DispatchMode,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            max_events: 10_000,
            retention_ms: 3_600_000,
            handler_timeout_ms: 5_000,
            dispatch: DispatchMode::Cooperative,
        }
    }
}

/// Event bus statistics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventBusStats {
    pub total_emitted: u64,
    pub buffered: usize,
    pub dropped_oldest: u64,
    pub pruned: u64,
    pub handler_timeouts: u64,
    pub typed_handlers: usize,
    pub filtered_handlers: usize,
}

struct BusInner {
    config: EventBusConfig,
    ring: RwLock<VecDeque<Event>>,
    typed: RwLock<HashMap<String, Vec<EventHandler>>>,
    filtered: RwLock<Vec<(EventFilter, EventHandler)>>,
    total_emitted: AtomicU64,
    dropped_oldest: AtomicU64,
    pruned: AtomicU64,
    handler_timeouts: AtomicU64,
}

/// In-process pub/sub bus. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(EventBusConfig::default())
    }
}

impl EventBus {
    /// Create a bus with the given configuration.
    pub fn new(config: EventBusConfig) -> Self {
        Self {
            inner: Arc::new(BusInner {
                config,
                ring: RwLock::new(VecDeque::new()),
                typed: RwLock::new(HashMap::new()),
                filtered: RwLock::new(Vec::new()),
                total_emitted: AtomicU64::new(0),
                dropped_oldest: AtomicU64::new(0),
                pruned: AtomicU64::new(0),
                handler_timeouts: AtomicU64::new(0),
            }),
        }
    }

    /// Register a handler for an event type. Registration is idempotent:
    /// re-registering the same handler instance for the same type is a no-op.
    pub fn on(&self, event_type: impl Into<String>, handler: EventHandler) {
        let event_type = event_type.into();
        let mut typed = self.inner.typed.write();
        let handlers = typed.entry(event_type).or_default();
        if !handlers.iter().any(|h| Arc::ptr_eq(h, &handler)) {
            handlers.push(handler);
        }
    }

    /// Remove a previously registered handler. Unknown handlers are ignored.
    pub fn off(&self, event_type: &str, handler: &EventHandler) {
        let mut typed = self.inner.typed.write();
        if let Some(handlers) = typed.get_mut(event_type) {
            handlers.retain(|h| !Arc::ptr_eq(h, handler));
            if handlers.is_empty() {
                typed.remove(event_type);
            }
        }
    }

    /// Register a handler receiving every event that passes `filter`.
    pub fn on_filtered(&self, filter: EventFilter, handler: EventHandler) {
        let mut filtered = self.inner.filtered.write();
        if !filtered.iter().any(|(_, h)| Arc::ptr_eq(h, &handler)) {
            filtered.push((filter, handler));
        }
    }

    /// Store the event and dispatch it to matching handlers. Never fails the
    /// caller: handler panics and deadline overruns are logged and counted.
    pub async fn emit(&self, event: Event) {
        self.inner.total_emitted.fetch_add(1, Ordering::Relaxed);

        {
            let mut ring = self.inner.ring.write();
            while ring.len() >= self.inner.config.max_events {
                ring.pop_front();
                self.inner.dropped_oldest.fetch_add(1, Ordering::Relaxed);
            }
            ring.push_back(event.clone());
        }

        let mut handlers: Vec<EventHandler> = Vec::new();
        {
            let typed = self.inner.typed.read();
            if let Some(list) = typed.get(&event.event_type) {
                handlers.extend(list.iter().cloned());
            }
        }
        {
            let filtered = self.inner.filtered.read();
            for (filter, handler) in filtered.iter() {
                if filter.matches(&event) {
                    handlers.push(handler.clone());
                }
            }
        }

        if handlers.is_empty() {
            return;
        }

        let deadline = Duration::from_millis(self.inner.config.handler_timeout_ms);
        match self.inner.config.dispatch {
            DispatchMode::Cooperative => {
                // Inline: the handler body runs as part of this emit call,
                // so the deadline can only fire at the handler's own await
                // points.
                for handler in handlers {
                    let future = CatchPanic(handler(event.clone()));
                    match tokio::time::timeout(deadline, future).await {
                        Ok(Ok(())) => {}
                        Ok(Err(panic)) => {
                            tracing::warn!(
                                event_type = %event.event_type,
                                error = %panic_message(panic.as_ref()),
                                "event handler panicked"
                            );
                        }
                        Err(_) => {
                            self.inner.handler_timeouts.fetch_add(1, Ordering::Relaxed);
                            tracing::warn!(
                                event_type = %event.event_type,
                                timeout_ms = self.inner.config.handler_timeout_ms,
                                "event handler exceeded deadline, dropping"
                            );
                        }
                    }
                }
            }
            DispatchMode::Parallel => {
                for handler in handlers {
                    let ev = event.clone();
                    let event_type = event.event_type.clone();
                    let timeouts = Arc::clone(&self.inner);
                    tokio::spawn(async move {
                        let join = tokio::spawn(async move { handler(ev).await });
                        match tokio::time::timeout(deadline, join).await {
                            Ok(Ok(())) => {}
                            Ok(Err(join_err)) => {
                                tracing::warn!(
                                    event_type = %event_type,
                                    error = %join_err,
                                    "event handler panicked"
                                );
                            }
                            Err(_) => {
                                timeouts.handler_timeouts.fetch_add(1, Ordering::Relaxed);
                                tracing::warn!(
                                    event_type = %event_type,
                                    "event handler exceeded deadline, dropping"
                                );
                            }
                        }
                    });
                }
            }
        }
    }

    /// Most recent events matching `filter`, newest first, up to `limit`.
    pub fn get_events(&self, filter: &EventFilter, limit: usize) -> Vec<Event> {
        let ring = self.inner.ring.read();
        ring.iter()
            .rev()
            .filter(|e| filter.matches(e))
            .take(limit)
            .cloned()
            .collect()
    }

    /// Remove events older than the retention window. Returns how many were
    /// pruned.
    pub fn prune_expired(&self) -> usize {
        let cutoff = Utc::now() - ChronoDuration::milliseconds(self.inner.config.retention_ms as i64);
        let mut ring = self.inner.ring.write();
        let before = ring.len();
        ring.retain(|e| e.timestamp >= cutoff);
        let removed = before - ring.len();
        self.inner.pruned.fetch_add(removed as u64, Ordering::Relaxed);
        removed
    }

    /// Spawn the background retention sweep (one pass per minute).
    pub fn spawn_retention_sweep(&self) -> tokio::task::JoinHandle<()> {
        let bus = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(60));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                let removed = bus.prune_expired();
                if removed > 0 {
                    tracing::debug!(removed, "event retention sweep pruned events");
                }
            }
        })
    }

    /// Snapshot of bus statistics.
    pub fn stats(&self) -> EventBusStats {
        let typed_handlers = self.inner.typed.read().values().map(Vec::len).sum();
        EventBusStats {
            total_emitted: self.inner.total_emitted.load(Ordering::Relaxed),
            buffered: self.inner.ring.read().len(),
            dropped_oldest: self.inner.dropped_oldest.load(Ordering::Relaxed),
            pruned: self.inner.pruned.load(Ordering::Relaxed),
            handler_timeouts: self.inner.handler_timeouts.load(Ordering::Relaxed),
            typed_handlers,
            filtered_handlers: self.inner.filtered.read().len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn test_emit_and_get() {
        let bus = EventBus::default();
        bus.emit(Event::new(topics::TASK_ENQUEUED, "queue").with_task("t-1"))
            .await;
        bus.emit(Event::new(topics::TASK_DEQUEUED, "queue").with_task("t-1"))
            .await;

        let events = bus.get_events(&EventFilter::for_type(topics::TASK_ENQUEUED), 10);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].task_id.as_deref(), Some("t-1"));
    }

    #[tokio::test]
    async fn test_typed_handler_receives_event() {
        let bus = EventBus::default();
        let seen = Arc::new(AtomicUsize::new(0));
        let seen2 = Arc::clone(&seen);

        bus.on(
            topics::TASK_ENQUEUED,
            handler(move |_event| {
                let seen = Arc::clone(&seen2);
                async move {
                    seen.fetch_add(1, Ordering::SeqCst);
                }
            }),
        );

        bus.emit(Event::new(topics::TASK_ENQUEUED, "queue")).await;
        bus.emit(Event::new(topics::TASK_DEQUEUED, "queue")).await;

        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_registration_idempotent() {
        let bus = EventBus::default();
        let seen = Arc::new(AtomicUsize::new(0));
        let seen2 = Arc::clone(&seen);

        let h = handler(move |_event| {
            let seen = Arc::clone(&seen2);
            async move {
                seen.fetch_add(1, Ordering::SeqCst);
            }
        });

        bus.on(topics::TASK_ENQUEUED, h.clone());
        bus.on(topics::TASK_ENQUEUED, h.clone());
        bus.emit(Event::new(topics::TASK_ENQUEUED, "queue")).await;
        assert_eq!(seen.load(Ordering::SeqCst), 1);

        bus.off(topics::TASK_ENQUEUED, &h);
        bus.emit(Event::new(topics::TASK_ENQUEUED, "queue")).await;
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_filtered_handler() {
        let bus = EventBus::default();
        let seen = Arc::new(AtomicUsize::new(0));
        let seen2 = Arc::clone(&seen);

        bus.on_filtered(
            EventFilter::default().with_severities(vec![EventSeverity::Error]),
            handler(move |_event| {
                let seen = Arc::clone(&seen2);
                async move {
                    seen.fetch_add(1, Ordering::SeqCst);
                }
            }),
        );

        bus.emit(Event::new("a", "x")).await;
        bus.emit(Event::new("b", "x").with_severity(EventSeverity::Error))
            .await;

        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_ring_drops_oldest() {
        let bus = EventBus::new(EventBusConfig {
            max_events: 2,
            ..EventBusConfig::default()
        });

        bus.emit(Event::new("a", "x")).await;
        bus.emit(Event::new("b", "x")).await;
        bus.emit(Event::new("c", "x")).await;

        let events = bus.get_events(&EventFilter::default(), 10);
        assert_eq!(events.len(), 2);
        // Newest first
        assert_eq!(events[0].event_type, "c");
        assert_eq!(events[1].event_type, "b");
        assert_eq!(bus.stats().dropped_oldest, 1);
    }

    #[tokio::test]
    async fn test_handler_panic_is_swallowed() {
        let bus = EventBus::default();
        bus.on(
            "boom",
            handler(|_event| async {
                panic!("handler exploded");
            }),
        );

        // Must not propagate.
        bus.emit(Event::new("boom", "x")).await;
        assert_eq!(bus.stats().total_emitted, 1);
    }

    #[tokio::test]
    async fn test_handler_timeout_counted() {
        let bus = EventBus::new(EventBusConfig {
            handler_timeout_ms: 20,
            ..EventBusConfig::default()
        });
        bus.on(
            "slow",
            handler(|_event| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
            }),
        );

        bus.emit(Event::new("slow", "x")).await;
        assert_eq!(bus.stats().handler_timeouts, 1);
    }

    #[tokio::test]
    async fn test_custom_predicate() {
        let bus = EventBus::default();
        bus.emit(Event::new("a", "x").with_task("t-1")).await;
        bus.emit(Event::new("a", "x").with_task("t-2")).await;

        let filter = EventFilter::for_type("a")
            .with_predicate(Arc::new(|e| e.task_id.as_deref() == Some("t-2")));
        let events = bus.get_events(&filter, 10);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].task_id.as_deref(), Some("t-2"));
    }
}
