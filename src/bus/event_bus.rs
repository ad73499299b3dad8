use std::sync::atomic::{AtomicI64, Ordering};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::manifest::ScanResult;

const BUS_CAPACITY: usize = 1024;

/// Everything the launcher core reports to its subscribers.
///
/// Errors travel on the same stream as normal progress; subscribers
/// distinguish them by variant (`EnvFailed`, a non-zero `JobFinished`
/// exit code, `is_error` on output lines).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CoreEvent {
    ScanFinished {
        result: ScanResult,
    },
    EnvPreparing {
        tool_id: String,
    },
    EnvReady {
        tool_id: String,
        env_path: String,
    },
    EnvFailed {
        tool_id: String,
        message: String,
    },
    JobStarted {
        tool_id: String,
        run_dir: String,
    },
    JobOutput {
        tool_id: String,
        line: String,
        is_error: bool,
    },
    JobFinished {
        tool_id: String,
        exit_code: i32,
        message: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub id: String,
    pub seq: i64,
    pub created_at: String,
    pub event: CoreEvent,
}

pub struct EventBus {
    tx: broadcast::Sender<EventEnvelope>,
    seq: AtomicI64,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(BUS_CAPACITY);
        Self {
            tx,
            seq: AtomicI64::new(0),
        }
    }

    /// Wrap an event in a sequenced envelope and publish it.
    pub fn publish(&self, event: CoreEvent) -> EventEnvelope {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let envelope = EventEnvelope {
            id: Uuid::new_v4().to_string(),
            seq,
            created_at: Utc::now().to_rfc3339(),
            event,
        };
        if let Err(e) = self.tx.send(envelope.clone()) {
            tracing::debug!("event bus publish with no receivers: {e}");
        }
        envelope
    }

    /// Get a new receiver for this bus.
    pub fn subscribe(&self) -> broadcast::Receiver<EventEnvelope> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
