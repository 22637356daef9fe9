//! Blocking-callback adapter.
//!
//! The runtime calls [`ToolGate::check`] for every tool use and stalls until
//! it resolves. A check that needs the user registers a resolver with the
//! broker and pushes the request onto a per-session side channel; the session
//! loop drains that channel ahead of the runtime's next message, so the
//! request reaches the orchestrator while the runtime is still blocked.

use super::{new_session_id, AgentBackend, BackendEvent, BackendSession, CancelSignal, StartConfig, EVENT_BUFFER};
use crate::broker::{
    shared_allow_list, PermissionBroker, PermissionDraft, PermissionOutcome, PermissionResponse,
    Question, QuestionAnswer, QuestionOutcome,
};
use crate::error::BackendError;
use crate::types::{BackendKind, InteractionMode};
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Tool the runtime uses to ask the user structured questions.
pub const ASK_USER_QUESTION_TOOL: &str = "AskUserQuestion";

/// Parameters for one runtime query.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryRequest {
    pub prompt: String,
    pub cwd: PathBuf,
    pub mode: InteractionMode,
    pub model: Option<String>,
    pub resume: Option<String>,
}

/// Control surface of a running query.
#[async_trait]
pub trait QueryControl: Send + Sync {
    async fn set_permission_mode(&self, mode: InteractionMode) -> Result<(), BackendError>;
    async fn interrupt(&self) -> Result<(), BackendError>;
}

/// A running query: its message stream plus its control surface.
pub struct RuntimeQuery {
    /// Raw messages in runtime order. An `Err` ends the stream.
    pub messages: mpsc::Receiver<Result<Value, BackendError>>,
    pub control: Arc<dyn QueryControl>,
}

/// Runtime that blocks on a capability callback per tool use.
#[async_trait]
pub trait CallbackRuntime: Send + Sync {
    /// Whether a persisted runtime session exists for `cwd`.
    async fn session_exists(&self, cwd: &Path, session_id: &str) -> Result<bool, BackendError>;

    async fn query(&self, request: QueryRequest, gate: ToolGate) -> Result<RuntimeQuery, BackendError>;
}

/// Answer handed back to the runtime's capability callback.
#[derive(Debug, Clone, PartialEq)]
pub enum GateDecision {
    Allow { updated_input: Value },
    Deny { message: String, interrupt: bool },
}

/// Capability callback handed to the runtime for one session.
#[derive(Clone)]
pub struct ToolGate {
    session_id: String,
    broker: Arc<PermissionBroker>,
    side_channel: mpsc::UnboundedSender<BackendEvent>,
    cancel: CancelSignal,
}

impl ToolGate {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Decide whether the runtime may run `tool_name` with `input`.
    ///
    /// Resolves immediately on a session-scope allow; otherwise waits for the
    /// user or for the session's cancellation, whichever comes first.
    pub async fn check(&self, tool_name: &str, input: Value, tool_use_id: Option<String>) -> GateDecision {
        if self.cancel.is_cancelled() {
            return stopped();
        }
        if tool_name == ASK_USER_QUESTION_TOOL {
            return self.ask(input, tool_use_id).await;
        }
        if self.broker.is_allowed(&self.session_id, tool_name, &input) {
            debug!(session_id = %self.session_id, tool = tool_name, "allowed by session allow-list");
            return GateDecision::Allow {
                updated_input: input,
            };
        }

        let draft = PermissionDraft {
            request_id: None,
            tool_name: tool_name.to_string(),
            tool_input: input,
            tool_use_id,
        };
        let (request, receiver) = match self.broker.register_permission(&self.session_id, draft) {
            Ok(pending) => pending,
            Err(err) => {
                warn!(session_id = %self.session_id, error = %err, "permission request without a live session");
                return stopped();
            }
        };
        if self.side_channel.send(BackendEvent::Permission(request)).is_err() {
            return stopped();
        }
        tokio::select! {
            outcome = receiver => match outcome {
                Ok(PermissionOutcome::Allow { input, .. }) => GateDecision::Allow { updated_input: input },
                Ok(PermissionOutcome::Deny { message, stopped: by_stop }) => GateDecision::Deny {
                    message,
                    interrupt: by_stop,
                },
                Err(_) => stopped(),
            },
            _ = self.cancel.cancelled() => stopped(),
        }
    }

    async fn ask(&self, input: Value, tool_use_id: Option<String>) -> GateDecision {
        let questions: Vec<Question> = input
            .get("questions")
            .and_then(Value::as_array)
            .map(|items| items.iter().filter_map(Question::from_value).collect())
            .unwrap_or_default();
        let (request, receiver) =
            match self
                .broker
                .register_question(&self.session_id, None, questions.clone(), tool_use_id)
            {
                Ok(pending) => pending,
                Err(_) => return stopped(),
            };
        if self.side_channel.send(BackendEvent::Question(request)).is_err() {
            return stopped();
        }
        tokio::select! {
            outcome = receiver => match outcome {
                Ok(QuestionOutcome::Answered(answer)) => GateDecision::Allow {
                    updated_input: with_answers(input, &questions, &answer),
                },
                Ok(QuestionOutcome::Rejected { message }) => GateDecision::Deny { message, interrupt: false },
                Err(_) => stopped(),
            },
            _ = self.cancel.cancelled() => stopped(),
        }
    }
}

fn stopped() -> GateDecision {
    GateDecision::Deny {
        message: crate::broker::STOPPED_MESSAGE.to_string(),
        interrupt: true,
    }
}

/// Return the question tool's input with an `answers` map keyed by question text.
fn with_answers(input: Value, questions: &[Question], answer: &QuestionAnswer) -> Value {
    let mut answers = Map::new();
    for (question, selected) in questions.iter().zip(&answer.answers) {
        answers.insert(question.question.clone(), Value::String(selected.join(", ")));
    }
    let mut object = match input {
        Value::Object(object) => object,
        _ => Map::new(),
    };
    object.insert("answers".to_string(), Value::Object(answers));
    Value::Object(object)
}

struct LiveSession {
    cancel: CancelSignal,
    control: Arc<dyn QueryControl>,
}

/// Adapter for the blocking-callback runtime.
pub struct ClaudeBackend {
    runtime: Arc<dyn CallbackRuntime>,
    broker: Arc<PermissionBroker>,
    sessions: Arc<Mutex<HashMap<String, LiveSession>>>,
}

impl ClaudeBackend {
    pub fn new(runtime: Arc<dyn CallbackRuntime>) -> Self {
        Self {
            runtime,
            broker: Arc::new(PermissionBroker::new()),
            sessions: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn broker(&self) -> &Arc<PermissionBroker> {
        &self.broker
    }

    fn sessions(&self) -> MutexGuard<'_, HashMap<String, LiveSession>> {
        lock_sessions(&self.sessions)
    }

    pub fn live_sessions(&self) -> usize {
        self.sessions().len()
    }
}

fn lock_sessions(
    sessions: &Mutex<HashMap<String, LiveSession>>,
) -> MutexGuard<'_, HashMap<String, LiveSession>> {
    sessions
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait]
impl AgentBackend for ClaudeBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::ClaudeCode
    }

    async fn start(&self, config: StartConfig, prompt: String) -> Result<BackendSession, BackendError> {
        if let Some(resume) = config.resume_session_id.as_deref() {
            if !self.runtime.session_exists(&config.cwd, resume).await? {
                warn!(task_id = %config.task_id, session_id = resume, "resume target not found");
                return Err(BackendError::ResumeNotFound {
                    session_id: resume.to_string(),
                });
            }
        }

        let session_id = new_session_id("cc");
        let allow_list = shared_allow_list(config.allow_list.clone());
        let cancel = CancelSignal::new();
        let (side_tx, side_rx) = mpsc::unbounded_channel();
        self.broker.open_session(&session_id, allow_list.clone());
        let gate = ToolGate {
            session_id: session_id.clone(),
            broker: self.broker.clone(),
            side_channel: side_tx,
            cancel: cancel.clone(),
        };
        let request = QueryRequest {
            prompt,
            cwd: config.cwd.clone(),
            mode: config.mode,
            model: config.model.clone(),
            resume: config.resume_session_id.clone(),
        };
        let query = match self.runtime.query(request, gate).await {
            Ok(query) => query,
            Err(err) => {
                self.broker.close_session(&session_id);
                return Err(err);
            }
        };

        self.sessions().insert(
            session_id.clone(),
            LiveSession {
                cancel: cancel.clone(),
                control: query.control.clone(),
            },
        );
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        tokio::spawn(run_session(
            session_id.clone(),
            query,
            side_rx,
            tx,
            cancel.clone(),
            self.broker.clone(),
            self.sessions.clone(),
        ));
        info!(task_id = %config.task_id, session_id = %session_id, resume = config.resume_session_id.is_some(), "session started");

        Ok(BackendSession {
            session_id,
            runtime_session_id: config.resume_session_id,
            events: rx,
            allow_list,
            cancel,
        })
    }

    async fn stop(&self, session_id: &str) -> Result<(), BackendError> {
        let Some(live) = self.sessions().remove(session_id) else {
            return Ok(());
        };
        live.cancel.cancel();
        self.broker.close_session(session_id);
        if let Err(err) = live.control.interrupt().await {
            warn!(session_id, error = %err, "interrupt failed during stop");
        }
        info!(session_id, "session stopped");
        Ok(())
    }

    async fn respond_to_permission(
        &self,
        session_id: &str,
        request_id: &str,
        response: PermissionResponse,
    ) -> Result<(), BackendError> {
        Ok(self
            .broker
            .respond_permission(session_id, request_id, response)?)
    }

    async fn respond_to_question(
        &self,
        session_id: &str,
        request_id: &str,
        answer: QuestionAnswer,
    ) -> Result<(), BackendError> {
        Ok(self.broker.respond_question(session_id, request_id, answer)?)
    }

    async fn set_mode(&self, session_id: &str, mode: InteractionMode) -> Result<(), BackendError> {
        let control = self
            .sessions()
            .get(session_id)
            .map(|live| live.control.clone())
            .ok_or_else(|| BackendError::UnknownSession(session_id.to_string()))?;
        control.set_permission_mode(mode).await
    }

    async fn dispose(&self) {
        let ids: Vec<String> = self.sessions().keys().cloned().collect();
        for id in ids {
            if let Err(err) = self.stop(&id).await {
                warn!(session_id = %id, error = %err, "stop failed during dispose");
            }
        }
    }
}

/// Session loop: side-channel requests first, then runtime messages.
async fn run_session(
    session_id: String,
    mut query: RuntimeQuery,
    mut side_rx: mpsc::UnboundedReceiver<BackendEvent>,
    tx: mpsc::Sender<BackendEvent>,
    cancel: CancelSignal,
    broker: Arc<PermissionBroker>,
    sessions: Arc<Mutex<HashMap<String, LiveSession>>>,
) {
    loop {
        let event = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            Some(event) = side_rx.recv() => event,
            message = query.messages.recv() => match message {
                Some(Ok(raw)) => BackendEvent::Raw(raw),
                Some(Err(err)) => {
                    warn!(session_id = %session_id, error = %err, "runtime stream failed");
                    let _ = tx.send(BackendEvent::Failed(err.to_string())).await;
                    break;
                }
                None => break,
            },
        };
        if tx.send(event).await.is_err() {
            debug!(session_id = %session_id, "event consumer dropped");
            cancel.cancel();
            break;
        }
    }
    // Requests raised while the final message was in flight still go out.
    if !cancel.is_cancelled() {
        while let Ok(event) = side_rx.try_recv() {
            if tx.send(event).await.is_err() {
                break;
            }
        }
    }
    broker.close_session(&session_id);
    lock_sessions(&sessions).remove(&session_id);
    debug!(session_id = %session_id, "session loop finished");
}
