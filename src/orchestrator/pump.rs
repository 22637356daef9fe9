//! Per-session pump: backend events → persisted raw → normalized → emitted.
//!
//! The pump is the single writer of a task's `message_index`. It checks the
//! session's cancellation signal before every write, so once `stop` has
//! cancelled the signal nothing further is persisted for that session.

use crate::backend::{BackendEvent, CancelSignal};
use crate::broker::{lock_allow_list, SharedAllowList};
use crate::events::{EventEmitter, SessionEvent};
use crate::normalize::{
    normalize_raw, NormalizeContext, NormalizedEvent, Normalizer, RawInput, NORMALIZATION_VERSION,
};
use crate::storage::{EntryStore, NormalizedEntryRecord, RawMessageRecord};
use crate::types::{BackendKind, EntryType, Part, TaskId, TaskStatus};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// How a pump run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpExit {
    /// The backend stream ended; carries the terminal status to record.
    Finished(TaskStatus),
    /// The session was cancelled; `stop` owns the status write.
    Cancelled,
}

pub(crate) struct SessionPump {
    pub task_id: TaskId,
    pub backend: BackendKind,
    pub backend_session_id: Option<String>,
    pub store: Arc<dyn EntryStore>,
    pub emitter: EventEmitter,
    pub cancel: CancelSignal,
    pub allow_list: SharedAllowList,
    pub normalizer: &'static dyn Normalizer,
    pub context: NormalizeContext,
    pub next_index: u64,
}

/// Outcome flags gathered while pumping.
#[derive(Default)]
struct Flags {
    errored: bool,
}

impl SessionPump {
    /// Rebuild the normalizer context from earlier raw records of this task.
    ///
    /// Every session of a task continues cost totals, compaction counters
    /// and emit-once bookkeeping where the previous one stopped.
    pub fn seed_context(&mut self) {
        let records = match self.store.raw_records(&self.task_id) {
            Ok(records) => records,
            Err(err) => {
                warn!(task_id = %self.task_id, error = %err, "could not load prior raw records");
                return;
            }
        };
        for record in records.iter().filter(|record| record.backend == self.backend) {
            normalize_raw(
                self.normalizer,
                RawInput {
                    payload: &record.payload,
                    received_at_ms: record.created_at_ms,
                },
                &mut self.context,
            );
        }
    }

    pub async fn run(mut self, mut events: mpsc::Receiver<BackendEvent>) -> PumpExit {
        let mut flags = Flags::default();
        loop {
            let event = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return PumpExit::Cancelled,
                event = events.recv() => event,
            };
            let Some(event) = event else {
                break;
            };
            if self.cancel.is_cancelled() {
                return PumpExit::Cancelled;
            }
            match event {
                BackendEvent::Raw(payload) => {
                    if !self.handle_raw(payload, &mut flags) {
                        return PumpExit::Cancelled;
                    }
                }
                BackendEvent::Permission(request) => {
                    info!(task_id = %self.task_id, request_id = %request.request_id, tool = %request.tool_name, "permission requested");
                    self.emitter.emit(SessionEvent::PermissionRequested {
                        task_id: self.task_id.clone(),
                        request,
                    });
                }
                BackendEvent::Question(request) => {
                    info!(task_id = %self.task_id, request_id = %request.request_id, "question requested");
                    self.emitter.emit(SessionEvent::QuestionRequested {
                        task_id: self.task_id.clone(),
                        request,
                    });
                }
                BackendEvent::Failed(message) => {
                    warn!(task_id = %self.task_id, error = %message, "backend stream failed");
                    flags.errored = true;
                    self.emitter.emit(SessionEvent::Error {
                        task_id: self.task_id.clone(),
                        message,
                    });
                    break;
                }
            }
        }
        if self.cancel.is_cancelled() {
            return PumpExit::Cancelled;
        }

        let status = if flags.errored {
            TaskStatus::Errored
        } else {
            TaskStatus::Idle
        };
        let allow_list = lock_allow_list(&self.allow_list).clone();
        if let Err(err) = self.store.update_task(&self.task_id, &mut |record| {
            record.status = status;
            record.allow_list = allow_list.clone();
        }) {
            warn!(task_id = %self.task_id, error = %err, "failed to record final status");
        }
        info!(task_id = %self.task_id, status = status.as_str(), "session finished");
        self.emitter.emit(SessionEvent::StatusChanged {
            task_id: self.task_id.clone(),
            status,
        });
        PumpExit::Finished(status)
    }

    /// Persist, normalize, persist, emit. Returns false when cancelled mid-unit.
    fn handle_raw(&mut self, payload: serde_json::Value, flags: &mut Flags) -> bool {
        let message_index = self.next_index;
        let record = RawMessageRecord::new(
            &self.task_id,
            message_index,
            self.backend,
            self.backend_session_id.clone(),
            payload,
        );
        let received_at_ms = record.created_at_ms;
        let payload = record.payload.clone();
        if let Err(err) = self.store.persist_raw(record) {
            warn!(task_id = %self.task_id, message_index, error = %err, "skipping raw unit that failed to persist");
            return true;
        }
        self.next_index += 1;
        debug!(task_id = %self.task_id, message_index, "raw unit persisted");

        let normalized = normalize_raw(
            self.normalizer,
            RawInput {
                payload: &payload,
                received_at_ms,
            },
            &mut self.context,
        );
        for event in normalized {
            if self.cancel.is_cancelled() {
                return false;
            }
            self.apply(event, message_index, flags);
        }
        true
    }

    fn apply(&mut self, event: NormalizedEvent, message_index: u64, flags: &mut Flags) {
        let task_id = self.task_id.clone();
        match event {
            NormalizedEvent::SessionId(session_id) => {
                self.backend_session_id = Some(session_id.clone());
                let assigned = session_id.clone();
                if let Err(err) = self.store.update_task(&task_id, &mut |record| {
                    record.backend_session_id = Some(assigned.clone());
                }) {
                    warn!(task_id = %task_id, error = %err, "failed to record backend session id");
                }
                info!(task_id = %task_id, session_id = %session_id, "backend session id assigned");
                self.emitter.emit(SessionEvent::SessionIdAssigned {
                    task_id,
                    session_id,
                });
            }
            NormalizedEvent::Entry(entry) => {
                if let EntryType::Unknown = entry.entry_type {
                    let original = entry.message.parts.iter().find_map(|part| match part {
                        Part::Unknown { original_type, .. } => Some(original_type.as_str()),
                        _ => None,
                    });
                    warn!(task_id = %task_id, message_index, original_type = original.unwrap_or("?"), "unrecognized runtime shape");
                }
                let record = NormalizedEntryRecord::new(&task_id, message_index, entry.clone(), NORMALIZATION_VERSION);
                if let Err(err) = self.store.persist_normalized_entry(record) {
                    warn!(task_id = %task_id, message_index, entry_id = %entry.id, error = %err, "skipping entry that failed to persist");
                    return;
                }
                self.emitter.emit(SessionEvent::Entry {
                    task_id,
                    message_index,
                    entry,
                });
            }
            NormalizedEvent::Removed(retraction) => {
                match self.store.retract_entries(&task_id, &retraction) {
                    Ok(count) => debug!(task_id = %task_id, count, "entries retracted"),
                    Err(err) => {
                        warn!(task_id = %task_id, error = %err, "retraction failed to persist");
                        return;
                    }
                }
                self.emitter.emit(SessionEvent::EntryRemoved {
                    task_id,
                    retraction,
                });
            }
            NormalizedEvent::ToolState { tool_id, state } => {
                self.emitter.emit(SessionEvent::ToolState {
                    task_id,
                    tool_id,
                    state,
                });
            }
            NormalizedEvent::ModeChanged(mode) => {
                self.emitter.emit(SessionEvent::ModeChanged { task_id, mode });
            }
            NormalizedEvent::Completion(outcome) => {
                if outcome.is_error {
                    flags.errored = true;
                }
                info!(task_id = %task_id, is_error = outcome.is_error, cost_usd = outcome.total_cost_usd.unwrap_or(0.0), "turn completed");
                self.emitter.emit(SessionEvent::Completed { task_id, outcome });
            }
            NormalizedEvent::Error(message) => {
                flags.errored = true;
                self.emitter.emit(SessionEvent::Error { task_id, message });
            }
            NormalizedEvent::RateLimit(info) => {
                self.emitter.emit(SessionEvent::RateLimited { task_id, info });
            }
        }
    }
}

