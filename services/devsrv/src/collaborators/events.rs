//! Fire-and-forget event publishing
//!
//! The core never blocks on or retries a publish. The broadcast publisher
//! stands in for the dashboard hub; subscribers that fall behind lose events.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::trace;

pub const SEQUENCE_STARTED: &str = "shutdown.sequence_started";
pub const STEP_COMPLETED: &str = "shutdown.step_completed";
pub const STEP_FAILED: &str = "shutdown.step_failed";
pub const SEQUENCE_COMPLETED: &str = "shutdown.sequence_completed";
pub const SEQUENCE_FAILED: &str = "shutdown.sequence_failed";
pub const SEQUENCE_CANCELLED: &str = "shutdown.sequence_cancelled";
pub const BREAKER_STATE_CHANGED: &str = "breaker.state_changed";
pub const SENSOR_TEMPERATURE: &str = "sensor.temperature";
pub const SENSOR_CHANNEL_STATE: &str = "sensor.channel_state";

/// A published event
#[derive(Debug, Clone, Serialize)]
pub struct Event {
    pub event_type: String,
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
}

impl Event {
    pub fn new(event_type: &str, payload: Value) -> Self {
        Self {
            event_type: event_type.to_string(),
            payload,
            timestamp: Utc::now(),
        }
    }
}

pub trait EventPublisher: Send + Sync {
    fn publish(&self, event_type: &str, payload: Value);
}

/// Discards everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopPublisher;

impl EventPublisher for NoopPublisher {
    fn publish(&self, event_type: &str, _payload: Value) {
        trace!("Dropping event {}", event_type);
    }
}

/// In-process fan-out over a tokio broadcast channel
#[derive(Debug, Clone)]
pub struct BroadcastPublisher {
    sender: broadcast::Sender<Event>,
}

impl BroadcastPublisher {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }
}

impl EventPublisher for BroadcastPublisher {
    fn publish(&self, event_type: &str, payload: Value) {
        // Err only means nobody is listening
        if self.sender.send(Event::new(event_type, payload)).is_err() {
            trace!("No subscribers for {}", event_type);
        }
    }
}
