//! Run event feed over a broadcast channel.
//!
//! Delivery is best-effort: the scheduler never blocks on subscribers, and a
//! send with no receivers is not an error.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::trace;

/// Default buffered events per subscriber before lagging receivers drop.
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunEvent {
    RunStarted {
        run_id: String,
    },
    RunInit {
        run_id: String,
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    RunPaused {
        run_id: String,
    },
    RunResumed {
        run_id: String,
    },
    TaskStarted {
        run_id: String,
        task_id: String,
        attempt: u32,
    },
    TaskLog {
        task_id: String,
        line: String,
    },
    TaskRetrying {
        run_id: String,
        task_id: String,
        attempt: u32,
        delay_ms: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    TaskCompleted {
        run_id: String,
        task_id: String,
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    RunCompleted {
        run_id: String,
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

/// Event stamped with its emission time; serializes flat (`{"type":..,"at":..}`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventEnvelope {
    #[serde(flatten)]
    pub event: RunEvent,
    pub at: String,
}

impl EventEnvelope {
    pub fn new(event: RunEvent, at: DateTime<Utc>) -> Self {
        Self {
            event,
            at: at.to_rfc3339_opts(SecondsFormat::Millis, true),
        }
    }
}

/// Cloneable handle for emitting and subscribing to run events.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: broadcast::Sender<EventEnvelope>,
}

impl EventSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn emit(&self, event: RunEvent) {
        let envelope = EventEnvelope::new(event, Utc::now());
        if self.tx.send(envelope).is_err() {
            trace!("event dropped: no subscribers");
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EventEnvelope> {
        self.tx.subscribe()
    }
}

impl Default for EventSink {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}
