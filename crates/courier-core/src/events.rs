//! Pipeline events and the sinks that receive them.
//!
//! Sinks are best-effort: a failing sink is logged and never affects a
//! delivery decision.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Mutex, PoisonError};
use thiserror::Error;

/// Every pipeline decision and notable state change produces an Event.
/// Events are observability only; nothing in the engine reads them back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Event {
    NotificationDispatched {
        request_id: String,
        delivery_id: String,
        variant_id: Option<String>,
        at: DateTime<Utc>,
    },
    NotificationDeferred {
        request_id: String,
        reason: String,
        pending: usize,
        at: DateTime<Utc>,
    },
    NotificationSuppressed {
        request_id: String,
        reason: String,
        at: DateTime<Utc>,
    },
    NotificationRejected {
        request_id: String,
        reason: String,
        at: DateTime<Utc>,
    },
    /// Deferred requests were released after quiet hours ended.
    DeferredFlushed {
        count: usize,
        requeued: usize,
        at: DateTime<Utc>,
    },
    EngagementRecorded {
        request_id: String,
        interaction: String,
        at: DateTime<Utc>,
    },
    PersistenceSaveFailed {
        key: String,
        message: String,
        at: DateTime<Utc>,
    },
}

impl Event {
    /// Dotted event name handed to [`EventSink::emit`].
    pub fn name(&self) -> &'static str {
        match self {
            Event::NotificationDispatched { .. } => "notification.dispatched",
            Event::NotificationDeferred { .. } => "notification.deferred",
            Event::NotificationSuppressed { .. } => "notification.suppressed",
            Event::NotificationRejected { .. } => "notification.rejected",
            Event::DeferredFlushed { .. } => "notification.deferred_flushed",
            Event::EngagementRecorded { .. } => "engagement.recorded",
            Event::PersistenceSaveFailed { .. } => "persistence.save_failed",
        }
    }

    /// Flat string attributes for the sink.
    pub fn attributes(&self) -> BTreeMap<String, String> {
        let mut attrs = BTreeMap::new();
        let mut put = |key: &str, value: String| {
            attrs.insert(key.to_string(), value);
        };
        match self {
            Event::NotificationDispatched {
                request_id,
                delivery_id,
                variant_id,
                at,
            } => {
                put("request_id", request_id.clone());
                put("delivery_id", delivery_id.clone());
                if let Some(variant_id) = variant_id {
                    put("variant_id", variant_id.clone());
                }
                put("at", at.to_rfc3339());
            }
            Event::NotificationDeferred {
                request_id,
                reason,
                pending,
                at,
            } => {
                put("request_id", request_id.clone());
                put("reason", reason.clone());
                put("pending", pending.to_string());
                put("at", at.to_rfc3339());
            }
            Event::NotificationSuppressed { request_id, reason, at }
            | Event::NotificationRejected { request_id, reason, at } => {
                put("request_id", request_id.clone());
                put("reason", reason.clone());
                put("at", at.to_rfc3339());
            }
            Event::DeferredFlushed {
                count,
                requeued,
                at,
            } => {
                put("count", count.to_string());
                put("requeued", requeued.to_string());
                put("at", at.to_rfc3339());
            }
            Event::EngagementRecorded {
                request_id,
                interaction,
                at,
            } => {
                put("request_id", request_id.clone());
                put("interaction", interaction.clone());
                put("at", at.to_rfc3339());
            }
            Event::PersistenceSaveFailed { key, message, at } => {
                put("key", key.clone());
                put("message", message.clone());
                put("at", at.to_rfc3339());
            }
        }
        attrs
    }
}

/// Failure reported by a sink. Never propagated past [`publish`].
#[derive(Error, Debug)]
#[error("event sink failed: {0}")]
pub struct SinkError(pub String);

/// Receives engine events. Implementations must not block.
pub trait EventSink: Send + Sync {
    fn emit(&self, name: &str, attributes: &BTreeMap<String, String>) -> Result<(), SinkError>;
}

/// Emits `event` to `sink`, swallowing sink failures.
pub fn publish(sink: &dyn EventSink, event: &Event) {
    if let Err(e) = sink.emit(event.name(), &event.attributes()) {
        tracing::warn!(event = event.name(), error = %e, "event sink rejected event");
    }
}

/// Forwards events to `tracing` at info level.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, name: &str, attributes: &BTreeMap<String, String>) -> Result<(), SinkError> {
        tracing::info!(event = name, ?attributes, "courier event");
        Ok(())
    }
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&self, _name: &str, _attributes: &BTreeMap<String, String>) -> Result<(), SinkError> {
        Ok(())
    }
}

/// Keeps every emitted event in memory, in order.
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<(String, BTreeMap<String, String>)>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// All events emitted so far.
    pub fn events(&self) -> Vec<(String, BTreeMap<String, String>)> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Names of all events emitted so far.
    pub fn names(&self) -> Vec<String> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(name, _)| name.clone())
            .collect()
    }
}

impl EventSink for MemorySink {
    fn emit(&self, name: &str, attributes: &BTreeMap<String, String>) -> Result<(), SinkError> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((name.to_string(), attributes.clone()));
        Ok(())
    }
}
