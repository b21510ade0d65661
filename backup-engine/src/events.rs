//! Operation event bus.
//!
//! Every state change, sealed volume, progress sample and warning of a
//! running operation is broadcast to any number of subscribers. Sending
//! never blocks the engine; slow subscribers lag and lose old events.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::trace;

use crate::controller::task::{OperationKind, TaskState};
use crate::report::Warning;

/// Maximum number of queued events per subscriber
const BROADCAST_CAPACITY: usize = 1000;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum EventBody {
    #[serde(rename = "operation:started")]
    Started { kind: OperationKind },

    #[serde(rename = "operation:state")]
    StateChanged { state: TaskState },

    #[serde(rename = "backup:volume")]
    VolumeSealed(VolumeSealedPayload),

    #[serde(rename = "operation:progress")]
    Progress(ProgressPayload),

    #[serde(rename = "operation:warning")]
    Warning(Warning),

    #[serde(rename = "operation:completed")]
    Completed { kind: OperationKind, state: TaskState },

    #[serde(rename = "operation:failed")]
    Failed { kind: OperationKind, error: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeSealedPayload {
    pub index: u32,
    pub content_name: String,
    pub signature_name: String,
    pub content_bytes: u64,
    pub files: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressPayload {
    pub percent: f64,
    pub processed_bytes: u64,
    pub total_bytes: u64,
    pub files_processed: usize,
    pub total_files: usize,
    pub bytes_per_second: u64,
    pub eta_seconds: u64,
    pub current_file: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationEvent {
    /// Empty for events emitted outside a controller task
    pub task_id: String,
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub body: EventBody,
}

/// Broadcast handle, optionally scoped to one task id.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<OperationEvent>,
    task_id: Arc<str>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            tx,
            task_id: Arc::from(""),
        }
    }

    /// Same channel, events tagged with `task_id`.
    pub fn for_task(&self, task_id: &str) -> Self {
        Self {
            tx: self.tx.clone(),
            task_id: Arc::from(task_id),
        }
    }

    pub fn emit(&self, body: EventBody) {
        let event = OperationEvent {
            task_id: self.task_id.to_string(),
            at: Utc::now(),
            body,
        };
        // No subscribers is the normal case for library callers
        if let Ok(count) = self.tx.send(event) {
            trace!("Broadcast event to {} subscriber(s)", count);
        }
    }

    pub fn warning(&self, warning: &Warning) {
        self.emit(EventBody::Warning(warning.clone()));
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OperationEvent> {
        self.tx.subscribe()
    }
}
