//! Event sink trait and implementations.

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::{debug, info, Level};

use super::EngineEvent;

/// Receives engine events.
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Emits an event.
    async fn emit(&self, event: EngineEvent);

    /// Emits an event without awaiting. Must never fail.
    fn try_emit(&self, event: EngineEvent);
}

/// Discards all events. The default sink.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpEventSink;

#[async_trait]
impl EventSink for NoOpEventSink {
    async fn emit(&self, _event: EngineEvent) {}

    fn try_emit(&self, _event: EngineEvent) {}
}

/// Forwards events to `tracing`.
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
    /// Creates a sink logging at `level`. Anything but `DEBUG` logs at `INFO`.
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
        let node = event.node_id.as_deref().unwrap_or("-");
        if self.level == Level::DEBUG {
            debug!(event = event.name, run_id = %event.run_id, node_id = node, data = %event.data, "Event: {}", event.name);
        } else {
            info!(event = event.name, run_id = %event.run_id, node_id = node, data = %event.data, "Event: {}", event.name);
        }
    }
}

#[async_trait]
impl EventSink for LoggingEventSink {
    async fn emit(&self, event: EngineEvent) {
        self.log_event(&event);
    }

    fn try_emit(&self, event: EngineEvent) {
        self.log_event(&event);
    }
}

/// Keeps every event in memory, for tests.
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

    /// All collected events, in emission order.
    #[must_use]
    pub fn events(&self) -> Vec<EngineEvent> {
        self.events.read().clone()
    }

    /// Names of all collected events, in emission order.
    #[must_use]
    pub fn names(&self) -> Vec<&'static str> {
        self.events.read().iter().map(|e| e.name).collect()
    }

    /// Events whose name starts with `prefix`.
    #[must_use]
    pub fn events_of_type(&self, prefix: &str) -> Vec<EngineEvent> {
        self.events
            .read()
            .iter()
            .filter(|e| e.name.starts_with(prefix))
            .cloned()
            .collect()
    }

    /// Number of collected events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    /// Returns true if nothing was collected.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.read().is_empty()
    }
}

#[async_trait]
impl EventSink for CollectingEventSink {
    async fn emit(&self, event: EngineEvent) {
        self.events.write().push(event);
    }

    fn try_emit(&self, event: EngineEvent) {
        self.events.write().push(event);
    }
}
