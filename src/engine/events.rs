// Operator event channel for queue activity

//! # Event System
//!
//! The event bus broadcasts what happens to queue entries: enqueues, starts,
//! progress, completions, requeues, failures and cancellations. It is the
//! operator channel: dashboards and alerting subscribe to it, and the
//! application logs every failure it carries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

/// Something that happened to a queue entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum QueueEventKind {
    Enqueued,
    Started { attempt: u32 },
    Progress { details: String },
    Completed,
    Requeued { reason: String, delay_ms: u64 },
    Failed { message: String },
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueEvent {
    pub entry_id: Uuid,
    pub task_type: String,
    pub display_name: Option<String>,
    pub kind: QueueEventKind,
    pub timestamp: DateTime<Utc>,
}

/// Event bus for publishing and subscribing to queue events
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<QueueEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    /// Create a new event bus
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(1000); // Buffer up to 1000 events
        Self { sender }
    }

    /// Publish an event to all subscribers
    ///
    /// Having no subscribers is normal, so send errors are ignored.
    pub fn publish(&self, event: QueueEvent) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.sender.subscribe()
    }

    pub fn emit(
        &self,
        entry_id: Uuid,
        task_type: &str,
        display_name: Option<&str>,
        kind: QueueEventKind,
    ) {
        self.publish(QueueEvent {
            entry_id,
            task_type: task_type.to_string(),
            display_name: display_name.map(str::to_string),
            kind,
            timestamp: Utc::now(),
        });
    }
}
