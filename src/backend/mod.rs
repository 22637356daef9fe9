//! Backend adapter contract.
//!
//! Every external runtime is driven through [`AgentBackend`]. Adapters hide
//! their concurrency idiom (blocking capability callbacks or a shared event
//! subscription) and hand the orchestrator one ordered stream of
//! [`BackendEvent`]s per session.

use crate::broker::{
    AllowList, PermissionRequest, PermissionResponse, QuestionAnswer, QuestionRequest,
    SharedAllowList,
};
use crate::error::BackendError;
use crate::types::{BackendKind, InteractionMode, TaskId};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

pub mod claude;
pub mod opencode;

pub use claude::{CallbackRuntime, ClaudeBackend, GateDecision, QueryControl, QueryRequest, RuntimeQuery, ToolGate};
pub use opencode::{
    OpencodeBackend, PermissionReply, PromptRequest, RuntimeServer, ServerLauncher, SharedServer,
};

/// Capacity of the outward event channel for one session.
pub const EVENT_BUFFER: usize = 256;

/// Everything an adapter needs to start (or resume) a session.
#[derive(Debug, Clone, Default)]
pub struct StartConfig {
    pub task_id: TaskId,
    pub cwd: PathBuf,
    pub mode: InteractionMode,
    pub model: Option<String>,
    /// Runtime-native session to resume. Resumption never falls back to a fresh session.
    pub resume_session_id: Option<String>,
    /// Session-scope allows carried over from the task's previous session.
    pub allow_list: AllowList,
}

/// One unit on a session's outward stream.
#[derive(Debug, Clone, PartialEq)]
pub enum BackendEvent {
    /// A raw runtime message, persisted and normalized by the orchestrator.
    Raw(Value),
    Permission(PermissionRequest),
    Question(QuestionRequest),
    /// The runtime stream failed; the session ends with an error.
    Failed(String),
}

/// Single cancellation signal per session, observable from any suspension point.
#[derive(Debug, Clone)]
pub struct CancelSignal {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for CancelSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelSignal {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolve once [`CancelSignal::cancel`] has been called.
    pub async fn cancelled(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives as long as `self`, so this only returns on cancel.
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}

/// A started session as seen by the orchestrator.
#[derive(Debug)]
pub struct BackendSession {
    /// Adapter-level id used for every later command.
    pub session_id: String,
    /// Runtime-native id, when known at start (resume, server-created sessions).
    pub runtime_session_id: Option<String>,
    pub events: mpsc::Receiver<BackendEvent>,
    pub allow_list: SharedAllowList,
    pub cancel: CancelSignal,
}

/// Uniform contract over every supported runtime.
#[async_trait]
pub trait AgentBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Start a session and issue `prompt`. Fails with
    /// [`BackendError::ResumeNotFound`] when a named resume target is missing.
    async fn start(&self, config: StartConfig, prompt: String) -> Result<BackendSession, BackendError>;

    /// Cancel the session, denying everything pending. Stopping an unknown
    /// session is not an error.
    async fn stop(&self, session_id: &str) -> Result<(), BackendError>;

    async fn respond_to_permission(
        &self,
        session_id: &str,
        request_id: &str,
        response: PermissionResponse,
    ) -> Result<(), BackendError>;

    async fn respond_to_question(
        &self,
        session_id: &str,
        request_id: &str,
        answer: QuestionAnswer,
    ) -> Result<(), BackendError>;

    /// Best effort. Runtimes that cannot switch mid-session treat this as a no-op.
    async fn set_mode(&self, session_id: &str, mode: InteractionMode) -> Result<(), BackendError>;

    /// Stop every session and release backend-wide resources. Idempotent.
    async fn dispose(&self);
}

/// Closed set of adapters, keyed by runtime.
#[derive(Clone, Default)]
pub struct BackendRegistry {
    backends: BTreeMap<BackendKind, Arc<dyn AgentBackend>>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, backend: Arc<dyn AgentBackend>) {
        self.backends.insert(backend.kind(), backend);
    }

    pub fn with(mut self, backend: Arc<dyn AgentBackend>) -> Self {
        self.register(backend);
        self
    }

    pub fn get(&self, kind: BackendKind) -> Option<Arc<dyn AgentBackend>> {
        self.backends.get(&kind).cloned()
    }

    pub fn kinds(&self) -> impl Iterator<Item = BackendKind> + '_ {
        self.backends.keys().copied()
    }

    pub async fn dispose_all(&self) {
        for backend in self.backends.values() {
            backend.dispose().await;
        }
    }
}

/// Random adapter-local session id.
pub(crate) fn new_session_id(prefix: &str) -> String {
    format!("{prefix}-{:016x}", rand::random::<u64>())
}
