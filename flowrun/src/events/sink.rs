//! Event sink trait and implementations.

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::{debug, info, Level};

use super::{EngineEvent, EventKind};

/// Receives lifecycle events from the coordinator.
///
/// Implementations must not fail; a sink that cannot deliver an event
/// drops it and reports through `tracing`.
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Emits an event.
    async fn emit(&self, event: &EngineEvent);

    /// Emits an event without awaiting.
    fn try_emit(&self, event: &EngineEvent);
}

/// Discards every event. The coordinator default.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpEventSink;

#[async_trait]
impl EventSink for NoOpEventSink {
    async fn emit(&self, _event: &EngineEvent) {}

    fn try_emit(&self, _event: &EngineEvent) {}
}

/// Writes events to `tracing`.
#[derive(Debug, Clone)]
pub struct LoggingEventSink {
    level: Level,
}

impl Default for LoggingEventSink {
    fn default() -> Self {
        Self { level: Level::INFO }
    }
}

impl LoggingEventSink {
    /// Creates a sink logging at `level`. Anything other than DEBUG logs at INFO.
    #[must_use]
    pub fn new(level: Level) -> Self {
        Self { level }
    }

    /// Creates a debug-level sink.
    #[must_use]
    pub fn debug() -> Self {
        Self::new(Level::DEBUG)
    }

    fn log_event(&self, event: &EngineEvent) {
        let task_id = event.task_id.map(|id| id.to_string());
        if self.level == Level::DEBUG {
            debug!(
                event_type = %event.kind,
                run_id = %event.run_id,
                task_id = task_id.as_deref(),
                event_data = %event.data,
                "Event: {}", event.kind
            );
        } else {
            info!(
                event_type = %event.kind,
                run_id = %event.run_id,
                task_id = task_id.as_deref(),
                event_data = %event.data,
                "Event: {}", event.kind
            );
        }
    }
}

#[async_trait]
impl EventSink for LoggingEventSink {
    async fn emit(&self, event: &EngineEvent) {
        self.log_event(event);
    }

    fn try_emit(&self, event: &EngineEvent) {
        self.log_event(event);
    }
}

/// Keeps every event in memory. Used by tests.
#[derive(Debug, Default)]
pub struct CollectingEventSink {
    events: RwLock<Vec<EngineEvent>>,
}

impl CollectingEventSink {
    /// Creates an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns all collected events.
    #[must_use]
    pub fn events(&self) -> Vec<EngineEvent> {
        self.events.read().clone()
    }

    /// Returns the collected event kinds in emission order.
    #[must_use]
    pub fn kinds(&self) -> Vec<EventKind> {
        self.events.read().iter().map(|e| e.kind).collect()
    }

    /// Returns events of one kind.
    #[must_use]
    pub fn of_kind(&self, kind: EventKind) -> Vec<EngineEvent> {
        self.events
            .read()
            .iter()
            .filter(|e| e.kind == kind)
            .cloned()
            .collect()
    }

    /// Returns the number of collected events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    /// Returns true if nothing was collected.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.read().is_empty()
    }

    /// Drops all collected events.
    pub fn clear(&self) {
        self.events.write().clear();
    }
}

#[async_trait]
impl EventSink for CollectingEventSink {
    async fn emit(&self, event: &EngineEvent) {
        self.events.write().push(event.clone());
    }

    fn try_emit(&self, event: &EngineEvent) {
        self.events.write().push(event.clone());
    }
}
