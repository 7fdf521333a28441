use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::flag::Flag;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Save,
    Delete,
    Error,
}

/// A flag change notification published after a successful write, or a
/// transport-level error report.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub kind: EventKind,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub flags: Vec<Flag>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
}

impl Event {
    pub fn save(flags: Vec<Flag>) -> Event {
        Event {
            kind: EventKind::Save,
            flags,
            error: String::new(),
        }
    }

    pub fn delete(flags: Vec<Flag>) -> Event {
        Event {
            kind: EventKind::Delete,
            flags,
            error: String::new(),
        }
    }

    pub fn error(message: impl Into<String>) -> Event {
        Event {
            kind: EventKind::Error,
            flags: Vec::new(),
            error: message.into(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("connecting to the message bus: {0}")]
    Connect(String),
    #[error("encoding event: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("publishing event: {0}")]
    Publish(String),
}

/// Best-effort fan-out of flag change events.
#[async_trait]
pub trait EventBus: Send + Sync {
    /// Publishes an event. A failure is reported to the caller and not
    /// retried.
    async fn send(&self, event: &Event) -> Result<(), BusError>;

    /// Returns a channel of incoming events. The channel closes when the
    /// underlying transport ends or the receiver is dropped. A failed
    /// subscription surfaces as a single terminal [EventKind::Error] event
    /// before the channel closes.
    async fn receiver(&self) -> mpsc::Receiver<Event>;
}

/// A bus that discards sends and produces no events; the default.
pub struct NoopBus;

#[async_trait]
impl EventBus for NoopBus {
    async fn send(&self, _event: &Event) -> Result<(), BusError> {
        Ok(())
    }

    async fn receiver(&self) -> mpsc::Receiver<Event> {
        let (_, receiver) = mpsc::channel(1);
        receiver
    }
}
