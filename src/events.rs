//! Outward event stream.
//!
//! Every event names its task. Envelopes carry a process-wide sequence number
//! assigned at send time, so consumers observe `seq` strictly increasing even
//! when several session pumps emit concurrently.

use crate::broker::{PermissionRequest, QuestionRequest};
use crate::storage::now_unix_millis;
use crate::types::{
    CompletionOutcome, EntryRetraction, InteractionMode, NormalizedEntry, RateLimitInfo, TaskId,
    TaskStatus, ToolState,
};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum SessionEvent {
    SessionIdAssigned {
        task_id: TaskId,
        session_id: String,
    },
    Entry {
        task_id: TaskId,
        message_index: u64,
        entry: NormalizedEntry,
    },
    EntryRemoved {
        task_id: TaskId,
        retraction: EntryRetraction,
    },
    PermissionRequested {
        task_id: TaskId,
        request: PermissionRequest,
    },
    PermissionResolved {
        task_id: TaskId,
        request_id: String,
        allowed: bool,
    },
    QuestionRequested {
        task_id: TaskId,
        request: QuestionRequest,
    },
    QuestionResolved {
        task_id: TaskId,
        request_id: String,
    },
    ModeChanged {
        task_id: TaskId,
        mode: InteractionMode,
    },
    ToolState {
        task_id: TaskId,
        tool_id: String,
        state: ToolState,
    },
    Completed {
        task_id: TaskId,
        outcome: CompletionOutcome,
    },
    Error {
        task_id: TaskId,
        message: String,
    },
    RateLimited {
        task_id: TaskId,
        info: RateLimitInfo,
    },
    StatusChanged {
        task_id: TaskId,
        status: TaskStatus,
    },
}

impl SessionEvent {
    pub fn task_id(&self) -> &str {
        match self {
            Self::SessionIdAssigned { task_id, .. }
            | Self::Entry { task_id, .. }
            | Self::EntryRemoved { task_id, .. }
            | Self::PermissionRequested { task_id, .. }
            | Self::PermissionResolved { task_id, .. }
            | Self::QuestionRequested { task_id, .. }
            | Self::QuestionResolved { task_id, .. }
            | Self::ModeChanged { task_id, .. }
            | Self::ToolState { task_id, .. }
            | Self::Completed { task_id, .. }
            | Self::Error { task_id, .. }
            | Self::RateLimited { task_id, .. }
            | Self::StatusChanged { task_id, .. } => task_id,
        }
    }
}

/// Sequenced envelope for session events.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionEventEnvelope {
    pub seq: u64,
    pub ts_unix_ms: u64,
    pub event: SessionEvent,
}

impl SessionEventEnvelope {
    pub fn new(seq: u64, event: SessionEvent) -> Self {
        Self {
            seq,
            ts_unix_ms: now_unix_millis(),
            event,
        }
    }
}

/// Cloneable sender that stamps sequence numbers.
#[derive(Debug, Clone)]
pub struct EventEmitter {
    tx: mpsc::UnboundedSender<SessionEventEnvelope>,
    seq: Arc<Mutex<u64>>,
}

impl EventEmitter {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<SessionEventEnvelope>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                tx,
                seq: Arc::new(Mutex::new(0)),
            },
            rx,
        )
    }

    /// Send one event. Returns false when nobody is listening anymore.
    pub fn emit(&self, event: SessionEvent) -> bool {
        let mut seq = self
            .seq
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let sent = self.tx.send(SessionEventEnvelope::new(*seq, event)).is_ok();
        *seq = seq.saturating_add(1);
        sent
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn events_serialize_with_type_and_payload() {
        let event = SessionEvent::ToolState {
            task_id: "t1".into(),
            tool_id: "call_1".into(),
            state: ToolState::Running,
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], json!("tool_state"));
        assert_eq!(value["payload"]["state"], json!("running"));
        assert_eq!(event.task_id(), "t1");
    }

    #[tokio::test]
    async fn emitter_clones_share_one_sequence() {
        let (emitter, mut rx) = EventEmitter::channel();
        let other = emitter.clone();
        emitter.emit(SessionEvent::Error {
            task_id: "a".into(),
            message: "x".into(),
        });
        other.emit(SessionEvent::Error {
            task_id: "b".into(),
            message: "y".into(),
        });
        assert_eq!(rx.recv().await.unwrap().seq, 0);
        assert_eq!(rx.recv().await.unwrap().seq, 1);
    }
}
