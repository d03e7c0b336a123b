//! Event sink trait and implementations.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, Level};

/// One audit record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    /// Event type, e.g. `run.started`.
    pub event_type: String,
    /// Owning tenant.
    pub tenant_id: String,
    /// The pipeline run or scheduled run the event concerns.
    pub run_id: String,
    /// Event payload.
    #[serde(default)]
    pub data: serde_json::Value,
    /// Emission time.
    pub timestamp: DateTime<Utc>,
}

impl AuditEvent {
    /// Creates an event stamped with the current time.
    #[must_use]
    pub fn new(
        event_type: impl Into<String>,
        tenant_id: impl Into<String>,
        run_id: impl Into<String>,
        data: serde_json::Value,
    ) -> Self {
        Self {
            event_type: event_type.into(),
            tenant_id: tenant_id.into(),
            run_id: run_id.into(),
            data,
            timestamp: Utc::now(),
        }
    }
}

/// Receives audit events.
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Emits an event. Implementations log and swallow their own failures.
    async fn emit(&self, event: AuditEvent);
}

/// Discards all events.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpEventSink;

#[async_trait]
impl EventSink for NoOpEventSink {
    async fn emit(&self, _event: AuditEvent) {}
}

/// Writes events to the `tracing` pipeline.
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
    /// Creates a sink logging at `level`.
    #[must_use]
    pub const fn new(level: Level) -> Self {
        Self { level }
    }
}

#[async_trait]
impl EventSink for LoggingEventSink {
    async fn emit(&self, event: AuditEvent) {
        if self.level == Level::DEBUG {
            debug!(
                event_type = %event.event_type,
                tenant_id = %event.tenant_id,
                run_id = %event.run_id,
                data = %event.data,
                "audit event"
            );
        } else {
            info!(
                event_type = %event.event_type,
                tenant_id = %event.tenant_id,
                run_id = %event.run_id,
                data = %event.data,
                "audit event"
            );
        }
    }
}

/// Keeps events in memory.
#[derive(Debug, Default)]
pub struct CollectingEventSink {
    events: RwLock<Vec<AuditEvent>>,
}

impl CollectingEventSink {
    /// Creates an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// All collected events in emission order.
    #[must_use]
    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.read().clone()
    }

    /// Event types in emission order.
    #[must_use]
    pub fn event_types(&self) -> Vec<String> {
        self.events
            .read()
            .iter()
            .map(|e| e.event_type.clone())
            .collect()
    }

    /// Events whose type starts with `prefix`.
    #[must_use]
    pub fn events_of_type(&self, prefix: &str) -> Vec<AuditEvent> {
        self.events
            .read()
            .iter()
            .filter(|e| e.event_type.starts_with(prefix))
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
    async fn emit(&self, event: AuditEvent) {
        self.events.write().push(event);
    }
}
