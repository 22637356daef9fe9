//! Streaming-subscription adapter.
//!
//! All sessions share one runtime server, launched lazily on first use and
//! shut down exactly once. Each session subscribes to the server's global
//! feed, keeps only events for its own session id, and issues its prompt as
//! a separate task. When both the prompt and the session's terminal feed
//! event (`session.idle` / `session.error`) have settled, the adapter appends
//! one synthetic `prompt.result` raw unit and ends the stream.

use super::{AgentBackend, BackendEvent, BackendSession, CancelSignal, StartConfig, EVENT_BUFFER};
use crate::broker::{
    lock_allow_list, shared_allow_list, PermissionBroker, PermissionDraft, PermissionOutcome,
    PermissionResponse, PermissionScope, Question, QuestionAnswer, QuestionOutcome,
    SharedAllowList,
};
use crate::error::BackendError;
use crate::types::{BackendKind, InteractionMode};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

/// Prompt parameters sent to the server.
#[derive(Debug, Clone, PartialEq)]
pub struct PromptRequest {
    pub text: String,
    pub model: Option<String>,
    /// Server-side agent profile; plan mode maps to the read-only agent.
    pub agent: String,
}

impl PromptRequest {
    pub fn new(text: String, model: Option<String>, mode: InteractionMode) -> Self {
        let agent = match mode {
            InteractionMode::Plan => "plan",
            _ => "build",
        };
        Self {
            text,
            model,
            agent: agent.to_string(),
        }
    }
}

/// Reply to a server-side permission request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PermissionReply {
    Once,
    Always,
    Reject { message: Option<String> },
}

/// A runtime server shared by every session of this adapter.
#[async_trait]
pub trait RuntimeServer: Send + Sync {
    /// Subscribe to the global event feed.
    fn subscribe(&self) -> broadcast::Receiver<Value>;
    async fn create_session(&self, cwd: &Path) -> Result<String, BackendError>;
    async fn session_exists(&self, session_id: &str) -> Result<bool, BackendError>;
    /// Run one prompt to completion; returns the final assistant message.
    async fn prompt(&self, session_id: &str, request: PromptRequest) -> Result<Value, BackendError>;
    async fn abort(&self, session_id: &str) -> Result<(), BackendError>;
    async fn reply_permission(
        &self,
        session_id: &str,
        permission_id: &str,
        reply: PermissionReply,
    ) -> Result<(), BackendError>;
    async fn reply_question(&self, request_id: &str, answers: Vec<Vec<String>>) -> Result<(), BackendError>;
    async fn reject_question(&self, request_id: &str) -> Result<(), BackendError>;
    async fn shutdown(&self);
}

/// Starts the runtime server process.
#[async_trait]
pub trait ServerLauncher: Send + Sync {
    async fn launch(&self) -> Result<Arc<dyn RuntimeServer>, BackendError>;
}

enum ServerSlot {
    Empty,
    Ready(Arc<dyn RuntimeServer>),
    Disposed,
}

/// Process-wide server handle: created on first use, torn down once.
///
/// Initialization happens under the slot lock, so racing callers wait for
/// the one in-flight launch instead of starting their own.
pub struct SharedServer {
    launcher: Arc<dyn ServerLauncher>,
    slot: tokio::sync::Mutex<ServerSlot>,
}

impl SharedServer {
    pub fn new(launcher: Arc<dyn ServerLauncher>) -> Self {
        Self {
            launcher,
            slot: tokio::sync::Mutex::new(ServerSlot::Empty),
        }
    }

    pub async fn get(&self) -> Result<Arc<dyn RuntimeServer>, BackendError> {
        let mut slot = self.slot.lock().await;
        match &*slot {
            ServerSlot::Ready(server) => Ok(server.clone()),
            ServerSlot::Disposed => Err(BackendError::Disposed),
            ServerSlot::Empty => {
                let server = self.launcher.launch().await?;
                info!("runtime server launched");
                *slot = ServerSlot::Ready(server.clone());
                Ok(server)
            }
        }
    }

    /// Shut the server down. Safe to call repeatedly or before any launch.
    pub async fn dispose(&self) {
        let mut slot = self.slot.lock().await;
        if let ServerSlot::Ready(server) = std::mem::replace(&mut *slot, ServerSlot::Disposed) {
            server.shutdown().await;
            info!("runtime server shut down");
        }
    }
}

struct LiveSession {
    cancel: CancelSignal,
    server: Arc<dyn RuntimeServer>,
    mode: InteractionMode,
}

/// Adapter for the streaming-subscription runtime.
pub struct OpencodeBackend {
    server: Arc<SharedServer>,
    broker: Arc<PermissionBroker>,
    sessions: Arc<Mutex<HashMap<String, LiveSession>>>,
}

impl OpencodeBackend {
    pub fn new(launcher: Arc<dyn ServerLauncher>) -> Self {
        Self {
            server: Arc::new(SharedServer::new(launcher)),
            broker: Arc::new(PermissionBroker::new()),
            sessions: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn sessions(&self) -> MutexGuard<'_, HashMap<String, LiveSession>> {
        lock_sessions(&self.sessions)
    }

    pub fn live_sessions(&self) -> usize {
        self.sessions().len()
    }

    /// Mode recorded for the session's next prompt.
    pub fn pending_mode(&self, session_id: &str) -> Option<InteractionMode> {
        self.sessions().get(session_id).map(|live| live.mode)
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
impl AgentBackend for OpencodeBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Opencode
    }

    async fn start(&self, config: StartConfig, prompt: String) -> Result<BackendSession, BackendError> {
        let server = self.server.get().await?;
        let session_id = match config.resume_session_id.as_deref() {
            Some(resume) => {
                if !server.session_exists(resume).await? {
                    warn!(task_id = %config.task_id, session_id = resume, "resume target not found");
                    return Err(BackendError::ResumeNotFound {
                        session_id: resume.to_string(),
                    });
                }
                resume.to_string()
            }
            None => server.create_session(&config.cwd).await?,
        };

        // Subscribe before prompting so no event for this session is missed.
        let feed = server.subscribe();
        let allow_list = shared_allow_list(config.allow_list.clone());
        let cancel = CancelSignal::new();
        self.broker.open_session(&session_id, allow_list.clone());
        self.sessions().insert(
            session_id.clone(),
            LiveSession {
                cancel: cancel.clone(),
                server: server.clone(),
                mode: config.mode,
            },
        );

        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let request = PromptRequest::new(prompt, config.model.clone(), config.mode);
        let pump = SessionPump {
            session_id: session_id.clone(),
            server,
            broker: self.broker.clone(),
            allow_list: allow_list.clone(),
            tx,
            cancel: cancel.clone(),
        };
        let sessions = self.sessions.clone();
        tokio::spawn(async move {
            let session_id = pump.session_id.clone();
            pump.run(feed, request).await;
            lock_sessions(&sessions).remove(&session_id);
        });
        info!(task_id = %config.task_id, session_id = %session_id, "session started");

        Ok(BackendSession {
            runtime_session_id: Some(session_id.clone()),
            session_id,
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
        if let Err(err) = live.server.abort(session_id).await {
            warn!(session_id, error = %err, "abort failed during stop");
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

    /// The server has no mid-prompt mode switch; the mode is recorded and
    /// applies from the session's next prompt.
    async fn set_mode(&self, session_id: &str, mode: InteractionMode) -> Result<(), BackendError> {
        if let Some(live) = self.sessions().get_mut(session_id) {
            live.mode = mode;
            debug!(session_id, mode = mode.as_str(), "mode recorded for next prompt");
        }
        Ok(())
    }

    async fn dispose(&self) {
        let ids: Vec<String> = self.sessions().keys().cloned().collect();
        for id in ids {
            if let Err(err) = self.stop(&id).await {
                warn!(session_id = %id, error = %err, "stop failed during dispose");
            }
        }
        self.server.dispose().await;
    }
}

/// Session id an event belongs to, wherever the event type keeps it.
fn event_session_id(event: &Value) -> Option<&str> {
    let props = event.get("properties")?;
    props
        .get("sessionID")
        .or_else(|| props.get("info").and_then(|info| info.get("sessionID")))
        .or_else(|| props.get("part").and_then(|part| part.get("sessionID")))
        .and_then(Value::as_str)
}

enum Terminal {
    Idle,
    Error(Value),
}

struct SessionPump {
    session_id: String,
    server: Arc<dyn RuntimeServer>,
    broker: Arc<PermissionBroker>,
    allow_list: SharedAllowList,
    tx: mpsc::Sender<BackendEvent>,
    cancel: CancelSignal,
}

impl SessionPump {
    async fn run(self, mut feed: broadcast::Receiver<Value>, request: PromptRequest) {
        let mut prompt = {
            let server = self.server.clone();
            let session_id = self.session_id.clone();
            tokio::spawn(async move { server.prompt(&session_id, request).await })
        };
        let mut prompt_result: Option<Value> = None;
        let mut terminal: Option<Terminal> = None;

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    prompt.abort();
                    break;
                }
                joined = &mut prompt, if prompt_result.is_none() => {
                    let result = joined
                        .map_err(|err| BackendError::Runtime(format!("prompt task failed: {err}")))
                        .and_then(|result| result);
                    match result {
                        Ok(value) => prompt_result = Some(value),
                        Err(err) => {
                            warn!(session_id = %self.session_id, error = %err, "prompt failed");
                            let _ = self.tx.send(BackendEvent::Failed(err.to_string())).await;
                            break;
                        }
                    }
                }
                received = feed.recv() => match received {
                    Ok(event) => {
                        if event_session_id(&event) != Some(self.session_id.as_str()) {
                            continue;
                        }
                        match self.handle(event).await {
                            Ok(Some(done)) => terminal = Some(done),
                            Ok(None) => {}
                            Err(()) => break,
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(session_id = %self.session_id, skipped, "event feed lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        let _ = self.tx.send(BackendEvent::Failed("event feed closed".into())).await;
                        break;
                    }
                },
            }

            if let (Some(result), Some(done)) = (prompt_result.as_ref(), terminal.as_ref()) {
                let error = match done {
                    Terminal::Idle => Value::Null,
                    Terminal::Error(error) => error.clone(),
                };
                let info = result.get("info").cloned().unwrap_or_else(|| result.clone());
                let merged = json!({
                    "type": "prompt.result",
                    "properties": {
                        "sessionID": self.session_id,
                        "info": info,
                        "error": error,
                    }
                });
                let _ = self.tx.send(BackendEvent::Raw(merged)).await;
                break;
            }
        }

        self.broker.close_session(&self.session_id);
        debug!(session_id = %self.session_id, "session pump finished");
    }

    /// Forward one event of this session. `Err` means the consumer is gone.
    async fn handle(&self, event: Value) -> Result<Option<Terminal>, ()> {
        let props = event.get("properties").cloned().unwrap_or(Value::Null);
        let kind = event.get("type").and_then(Value::as_str).unwrap_or_default();
        let (forward, terminal) = match kind {
            "permission.asked" => (self.on_permission(&props), None),
            "question.asked" => (self.on_question(&props), None),
            "session.idle" => (Some(BackendEvent::Raw(event)), Some(Terminal::Idle)),
            "session.error" => {
                let error = props.get("error").cloned().unwrap_or(Value::Null);
                (Some(BackendEvent::Raw(event)), Some(Terminal::Error(error)))
            }
            _ => (Some(BackendEvent::Raw(event)), None),
        };
        if let Some(forward) = forward {
            if self.tx.send(forward).await.is_err() {
                self.cancel.cancel();
                return Err(());
            }
        }
        Ok(terminal)
    }

    fn on_permission(&self, props: &Value) -> Option<BackendEvent> {
        let permission_id = props.get("id").and_then(Value::as_str)?.to_string();
        let tool_name = props
            .get("permission")
            .or_else(|| props.get("type"))
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string();
        let tool_input = permission_input(props);

        if lock_allow_list(&self.allow_list).allows(&tool_name, &tool_input) {
            debug!(session_id = %self.session_id, request_id = %permission_id, "allowed by session allow-list");
            let server = self.server.clone();
            let session_id = self.session_id.clone();
            tokio::spawn(async move {
                if let Err(err) = server
                    .reply_permission(&session_id, &permission_id, PermissionReply::Once)
                    .await
                {
                    warn!(session_id = %session_id, error = %err, "permission auto-reply failed");
                }
            });
            return None;
        }

        let draft = PermissionDraft {
            request_id: Some(permission_id.clone()),
            tool_name,
            tool_input,
            tool_use_id: props
                .get("tool")
                .and_then(|tool| tool.get("callID"))
                .and_then(Value::as_str)
                .map(str::to_string),
        };
        let (request, receiver) = match self.broker.register_permission(&self.session_id, draft) {
            Ok(pending) => pending,
            Err(err) => {
                warn!(session_id = %self.session_id, error = %err, "permission arrived after stop");
                return None;
            }
        };
        let server = self.server.clone();
        let session_id = self.session_id.clone();
        tokio::spawn(async move {
            let reply = match receiver.await {
                Ok(PermissionOutcome::Allow {
                    scope: PermissionScope::Session,
                    ..
                }) => PermissionReply::Always,
                Ok(PermissionOutcome::Allow { .. }) => PermissionReply::Once,
                Ok(PermissionOutcome::Deny { message, .. }) => PermissionReply::Reject {
                    message: Some(message),
                },
                Err(_) => PermissionReply::Reject { message: None },
            };
            if let Err(err) = server.reply_permission(&session_id, &permission_id, reply).await {
                debug!(session_id = %session_id, error = %err, "permission reply not delivered");
            }
        });
        Some(BackendEvent::Permission(request))
    }

    fn on_question(&self, props: &Value) -> Option<BackendEvent> {
        let request_id = props.get("id").and_then(Value::as_str)?.to_string();
        let questions: Vec<Question> = props
            .get("questions")
            .and_then(Value::as_array)
            .map(|items| items.iter().filter_map(Question::from_value).collect())
            .unwrap_or_default();
        let tool_use_id = props
            .get("tool")
            .and_then(|tool| tool.get("callID"))
            .and_then(Value::as_str)
            .map(str::to_string);
        let (request, receiver) = match self.broker.register_question(
            &self.session_id,
            Some(request_id.clone()),
            questions,
            tool_use_id,
        ) {
            Ok(pending) => pending,
            Err(err) => {
                warn!(session_id = %self.session_id, error = %err, "question arrived after stop");
                return None;
            }
        };
        let server = self.server.clone();
        tokio::spawn(async move {
            let delivered = match receiver.await {
                Ok(QuestionOutcome::Answered(answer)) => {
                    server.reply_question(&request_id, answer.answers).await
                }
                Ok(QuestionOutcome::Rejected { .. }) | Err(_) => {
                    server.reject_question(&request_id).await
                }
            };
            if let Err(err) = delivered {
                debug!(request_id = %request_id, error = %err, "question reply not delivered");
            }
        });
        Some(BackendEvent::Question(request))
    }
}

/// Tool input used for allow-list signatures of a server permission.
fn permission_input(props: &Value) -> Value {
    let mut input = props
        .get("metadata")
        .filter(|metadata| metadata.is_object())
        .cloned()
        .unwrap_or_else(|| json!({}));
    if input.get("command").is_none() {
        let patterns: Vec<&str> = props
            .get("patterns")
            .and_then(Value::as_array)
            .map(|patterns| patterns.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default();
        if !patterns.is_empty() {
            input["command"] = Value::String(patterns.join(" "));
        }
    }
    input
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testsupport::{FakeLauncher, FakeServer};
    use std::time::Duration;

    async fn next(session: &mut BackendSession) -> Option<BackendEvent> {
        tokio::time::timeout(Duration::from_secs(2), session.events.recv())
            .await
            .expect("event in time")
    }

    fn idle(session: &str) -> Value {
        json!({"type": "session.idle", "properties": {"sessionID": session}})
    }

    #[tokio::test]
    async fn server_launches_once_across_sessions_and_disposes_once() {
        let server = Arc::new(FakeServer::new());
        let launcher = Arc::new(FakeLauncher::new(server.clone()));
        let backend = OpencodeBackend::new(launcher.clone());

        let (a, b) = tokio::join!(
            backend.start(StartConfig::default(), "one".into()),
            backend.start(StartConfig::default(), "two".into())
        );
        assert!(a.is_ok() && b.is_ok());
        assert_eq!(launcher.launches(), 1);

        backend.dispose().await;
        backend.dispose().await;
        assert_eq!(server.shutdowns(), 1);
        assert!(matches!(
            backend.start(StartConfig::default(), "late".into()).await,
            Err(BackendError::Disposed)
        ));
    }

    #[tokio::test]
    async fn foreign_session_events_are_discarded_and_result_merges_last() {
        let server = Arc::new(FakeServer::new());
        let backend = OpencodeBackend::new(Arc::new(FakeLauncher::new(server.clone())));
        let mut session = backend.start(StartConfig::default(), "hi".into()).await.unwrap();
        let id = session.session_id.clone();

        server.emit(json!({"type": "message.updated", "properties": {"info": {"id": "m1", "sessionID": "other"}}}));
        server.emit(json!({"type": "message.updated", "properties": {"info": {"id": "m2", "sessionID": id}}}));
        server.emit(idle(&id));
        server.complete_prompt(&id, json!({"info": {"id": "m2", "cost": 0.1}}));

        let Some(BackendEvent::Raw(first)) = next(&mut session).await else {
            panic!("expected raw");
        };
        assert_eq!(first["properties"]["info"]["id"], "m2");
        let Some(BackendEvent::Raw(second)) = next(&mut session).await else {
            panic!("expected raw");
        };
        assert_eq!(second["type"], "session.idle");
        let Some(BackendEvent::Raw(merged)) = next(&mut session).await else {
            panic!("expected merged result");
        };
        assert_eq!(merged["type"], "prompt.result");
        assert_eq!(merged["properties"]["info"]["cost"], 0.1);
        assert!(next(&mut session).await.is_none());
    }

    #[tokio::test]
    async fn resume_of_unknown_session_fails_loudly() {
        let server = Arc::new(FakeServer::new());
        let backend = OpencodeBackend::new(Arc::new(FakeLauncher::new(server.clone())));
        let err = backend
            .start(
                StartConfig {
                    resume_session_id: Some("ses_gone".into()),
                    ..StartConfig::default()
                },
                "hi".into(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::ResumeNotFound { .. }));
        assert_eq!(backend.live_sessions(), 0);
        assert_eq!(server.created_sessions(), 0);
    }

    #[tokio::test]
    async fn permission_round_trip_and_session_scope_auto_reply() {
        let server = Arc::new(FakeServer::new());
        let backend = OpencodeBackend::new(Arc::new(FakeLauncher::new(server.clone())));
        let mut session = backend.start(StartConfig::default(), "hi".into()).await.unwrap();
        let id = session.session_id.clone();
        let asked = |perm: &str| {
            json!({"type": "permission.asked", "properties": {
                "id": perm, "sessionID": id, "permission": "bash", "patterns": ["npm test"]}})
        };

        server.emit(asked("per_1"));
        let Some(BackendEvent::Permission(request)) = next(&mut session).await else {
            panic!("expected permission");
        };
        assert_eq!(request.request_id, "per_1");
        backend
            .respond_to_permission(&id, "per_1", PermissionResponse::allow_for_session())
            .await
            .unwrap();

        server.emit(asked("per_2"));
        server.emit(idle(&id));
        let Some(BackendEvent::Raw(raw)) = next(&mut session).await else {
            panic!("expected idle, not a second permission");
        };
        assert_eq!(raw["type"], "session.idle");

        let mut replies = server.wait_for_permission_replies(2).await;
        replies.sort_by(|a, b| a.0.cmp(&b.0));
        assert_eq!(
            replies,
            vec![
                ("per_1".to_string(), PermissionReply::Always),
                ("per_2".to_string(), PermissionReply::Once),
            ]
        );
    }

    #[tokio::test]
    async fn set_mode_is_recorded_not_rejected() {
        let server = Arc::new(FakeServer::new());
        let backend = OpencodeBackend::new(Arc::new(FakeLauncher::new(server)));
        let session = backend.start(StartConfig::default(), "hi".into()).await.unwrap();
        backend
            .set_mode(&session.session_id, InteractionMode::Plan)
            .await
            .unwrap();
        assert_eq!(backend.pending_mode(&session.session_id), Some(InteractionMode::Plan));
        backend.set_mode("missing", InteractionMode::Plan).await.unwrap();
    }

    #[tokio::test]
    async fn stop_aborts_and_ends_the_stream() {
        let server = Arc::new(FakeServer::new());
        let backend = OpencodeBackend::new(Arc::new(FakeLauncher::new(server.clone())));
        let mut session = backend.start(StartConfig::default(), "hi".into()).await.unwrap();
        backend.stop(&session.session_id).await.unwrap();
        assert!(next(&mut session).await.is_none());
        assert_eq!(server.aborted(), vec![session.session_id.clone()]);
    }

    #[test]
    fn permission_input_falls_back_to_patterns() {
        let input = permission_input(&json!({"patterns": ["git", "status"]}));
        assert_eq!(input["command"], "git status");
        let input = permission_input(&json!({"metadata": {"command": "ls"}, "patterns": ["x"]}));
        assert_eq!(input["command"], "ls");
    }
}
