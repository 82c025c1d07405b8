//! Event sink — `(reason, message)` pairs about scaling outcomes.

use std::sync::{Arc, Mutex, PoisonError};

use serde::Serialize;
use tracing::{info, warn};

use scaler_core::{ItemKey, ScalingItem, ScalingItemType};

pub const REASON_SCALED: &str = "Scaled";
pub const REASON_SCALING_FAILED: &str = "ScalingFailed";
pub const REASON_QUOTA_EXCEEDED: &str = "QuotaExceeded";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EventType {
    Normal,
    Warning,
}

/// An event about one workload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Event {
    pub item: ItemKey,
    pub kind: ScalingItemType,
    pub event_type: EventType,
    pub reason: String,
    pub message: String,
}

impl Event {
    pub fn normal(item: &ScalingItem, reason: &str, message: impl Into<String>) -> Self {
        Self::new(item, EventType::Normal, reason, message.into())
    }

    pub fn warning(item: &ScalingItem, reason: &str, message: impl Into<String>) -> Self {
        Self::new(item, EventType::Warning, reason, message.into())
    }

    fn new(item: &ScalingItem, event_type: EventType, reason: &str, message: String) -> Self {
        Self {
            item: item.key(),
            kind: item.kind,
            event_type,
            reason: reason.to_string(),
            message,
        }
    }
}

/// Consumer of scaling events (e.g. a cluster event recorder).
pub trait EventSink: Send + Sync {
    fn emit(&self, event: Event);
}

/// Writes events to the tracing log.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn emit(&self, event: Event) {
        match event.event_type {
            EventType::Normal => info!(
                item = %event.item,
                kind = %event.kind,
                reason = %event.reason,
                "{}",
                event.message
            ),
            EventType::Warning => warn!(
                item = %event.item,
                kind = %event.kind,
                reason = %event.reason,
                "{}",
                event.message
            ),
        }
    }
}

/// Keeps every event in memory.
#[derive(Debug, Clone, Default)]
pub struct RecordingEventSink {
    events: Arc<Mutex<Vec<Event>>>,
}

impl RecordingEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<Event> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Reasons of the events recorded for `item`, oldest first.
    pub fn reasons_for(&self, item: &ItemKey) -> Vec<String> {
        self.events()
            .into_iter()
            .filter(|e| &e.item == item)
            .map(|e| e.reason)
            .collect()
    }
}

impl EventSink for RecordingEventSink {
    fn emit(&self, event: Event) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
    }
}
