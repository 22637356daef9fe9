//! Shared test fixtures: temp directories and scripted runtimes.
//!
//! The runtimes here stand in for the external agent processes so adapter,
//! orchestrator and storage tests can drive full sessions deterministically.

use crate::backend::{
    CallbackRuntime, GateDecision, PermissionReply, PromptRequest, QueryControl, QueryRequest,
    RuntimeQuery, RuntimeServer, ServerLauncher, ToolGate,
};
use crate::error::BackendError;
use crate::types::InteractionMode;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::{broadcast, mpsc, Notify};

static TEST_DIR_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Temporary directory fixture with best-effort cleanup.
#[derive(Debug)]
pub struct TestTempDir {
    path: PathBuf,
}

impl TestTempDir {
    /// Create a unique temporary directory with a readable prefix.
    pub fn new(prefix: &str) -> Self {
        let suffix = TEST_DIR_COUNTER.fetch_add(1, Ordering::Relaxed);
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();
        let dir = std::env::temp_dir().join(format!("agentdeck-{prefix}-{millis}-{suffix}"));
        fs::create_dir_all(&dir).expect("failed to create temporary fixture directory");
        Self { path: dir }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write UTF-8 text to a child path, creating parent directories as needed.
    pub fn write_text(&self, relative: &str, content: &str) -> PathBuf {
        let path = self.path.join(relative);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("failed to create parent directories for fixture");
        }
        fs::write(&path, content).expect("failed to write fixture file");
        path
    }
}

impl Drop for TestTempDir {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(&self.path);
    }
}

/// Poll `check` until it yields a value or two seconds pass.
async fn poll_until<T>(mut check: impl FnMut() -> Option<T>) -> T {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        if let Some(value) = check() {
            return value;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached in time"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ---------------------------------------------------------------------------
// Blocking-callback runtime
// ---------------------------------------------------------------------------

/// One step of a scripted query.
#[derive(Debug, Clone)]
pub enum ScriptStep {
    /// Yield a raw message.
    Message(Value),
    /// Ask the gate for permission, then carry on whatever it decides.
    Tool { name: String, input: Value },
    /// Fail the stream.
    Fail(String),
}

#[derive(Debug, Default)]
struct ScriptState {
    queries: Vec<QueryRequest>,
    decisions: Vec<GateDecision>,
    modes: Vec<InteractionMode>,
    interrupted: bool,
}

pub struct ScriptedCallbackRuntime {
    script: Vec<ScriptStep>,
    existing_sessions: Vec<String>,
    state: Arc<Mutex<ScriptState>>,
}

impl ScriptedCallbackRuntime {
    pub fn new(script: Vec<ScriptStep>) -> Self {
        Self {
            script,
            existing_sessions: Vec::new(),
            state: Arc::new(Mutex::new(ScriptState::default())),
        }
    }

    pub fn with_existing_session(mut self, session_id: &str) -> Self {
        self.existing_sessions.push(session_id.to_string());
        self
    }

    pub fn query_count(&self) -> usize {
        lock(&self.state).queries.len()
    }

    pub fn queries(&self) -> Vec<QueryRequest> {
        lock(&self.state).queries.clone()
    }

    pub fn decisions(&self) -> Vec<GateDecision> {
        lock(&self.state).decisions.clone()
    }

    pub async fn wait_for_decisions(&self, count: usize) -> Vec<GateDecision> {
        poll_until(|| {
            let decisions = self.decisions();
            (decisions.len() >= count).then_some(decisions)
        })
        .await
    }

    pub fn interrupted(&self) -> bool {
        lock(&self.state).interrupted
    }

    pub fn modes(&self) -> Vec<InteractionMode> {
        lock(&self.state).modes.clone()
    }
}

struct ScriptedControl {
    state: Arc<Mutex<ScriptState>>,
}

#[async_trait]
impl QueryControl for ScriptedControl {
    async fn set_permission_mode(&self, mode: InteractionMode) -> Result<(), BackendError> {
        lock(&self.state).modes.push(mode);
        Ok(())
    }

    async fn interrupt(&self) -> Result<(), BackendError> {
        lock(&self.state).interrupted = true;
        Ok(())
    }
}

#[async_trait]
impl CallbackRuntime for ScriptedCallbackRuntime {
    async fn session_exists(&self, _cwd: &Path, session_id: &str) -> Result<bool, BackendError> {
        Ok(self.existing_sessions.iter().any(|id| id == session_id))
    }

    async fn query(&self, request: QueryRequest, gate: ToolGate) -> Result<RuntimeQuery, BackendError> {
        lock(&self.state).queries.push(request);
        let (tx, rx) = mpsc::channel(8);
        let script = self.script.clone();
        let state = self.state.clone();
        tokio::spawn(async move {
            for (index, step) in script.into_iter().enumerate() {
                match step {
                    ScriptStep::Message(raw) => {
                        if tx.send(Ok(raw)).await.is_err() {
                            return;
                        }
                    }
                    ScriptStep::Tool { name, input } => {
                        let decision = gate.check(&name, input, Some(format!("toolu_{index}"))).await;
                        lock(&state).decisions.push(decision);
                    }
                    ScriptStep::Fail(message) => {
                        let _ = tx.send(Err(BackendError::Runtime(message))).await;
                        return;
                    }
                }
            }
        });
        Ok(RuntimeQuery {
            messages: rx,
            control: Arc::new(ScriptedControl {
                state: self.state.clone(),
            }),
        })
    }
}

// ---------------------------------------------------------------------------
// Streaming-subscription runtime
// ---------------------------------------------------------------------------

#[derive(Default)]
struct ServerState {
    sessions: Vec<String>,
    prompts: Vec<(String, PromptRequest)>,
    prompt_results: HashMap<String, Result<Value, BackendError>>,
    aborted: Vec<String>,
    permission_replies: Vec<(String, PermissionReply)>,
    question_replies: Vec<(String, Option<Vec<Vec<String>>>)>,
    shutdowns: usize,
}

/// In-process runtime server with a scriptable event feed.
pub struct FakeServer {
    feed: broadcast::Sender<Value>,
    state: Mutex<ServerState>,
    prompt_done: Notify,
}

impl Default for FakeServer {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeServer {
    pub fn new() -> Self {
        let (feed, _) = broadcast::channel(256);
        Self {
            feed,
            state: Mutex::new(ServerState::default()),
            prompt_done: Notify::new(),
        }
    }

    pub fn with_session(self, session_id: &str) -> Self {
        lock(&self.state).sessions.push(session_id.to_string());
        self
    }

    /// Publish one event on the global feed.
    pub fn emit(&self, event: Value) {
        let _ = self.feed.send(event);
    }

    /// Let the pending (or next) prompt of `session_id` return `result`.
    pub fn complete_prompt(&self, session_id: &str, result: Value) {
        lock(&self.state)
            .prompt_results
            .insert(session_id.to_string(), Ok(result));
        self.prompt_done.notify_waiters();
    }

    pub fn fail_prompt(&self, session_id: &str, message: &str) {
        lock(&self.state)
            .prompt_results
            .insert(session_id.to_string(), Err(BackendError::Runtime(message.to_string())));
        self.prompt_done.notify_waiters();
    }

    pub fn created_sessions(&self) -> usize {
        lock(&self.state).sessions.len()
    }

    pub fn prompts(&self) -> Vec<(String, PromptRequest)> {
        lock(&self.state).prompts.clone()
    }

    pub fn aborted(&self) -> Vec<String> {
        lock(&self.state).aborted.clone()
    }

    pub fn shutdowns(&self) -> usize {
        lock(&self.state).shutdowns
    }

    pub fn question_replies(&self) -> Vec<(String, Option<Vec<Vec<String>>>)> {
        lock(&self.state).question_replies.clone()
    }

    pub async fn wait_for_permission_replies(&self, count: usize) -> Vec<(String, PermissionReply)> {
        poll_until(|| {
            let replies = lock(&self.state).permission_replies.clone();
            (replies.len() >= count).then_some(replies)
        })
        .await
    }
}

#[async_trait]
impl RuntimeServer for FakeServer {
    fn subscribe(&self) -> broadcast::Receiver<Value> {
        self.feed.subscribe()
    }

    async fn create_session(&self, _cwd: &Path) -> Result<String, BackendError> {
        let mut state = lock(&self.state);
        let id = format!("ses_{}", state.sessions.len() + 1);
        state.sessions.push(id.clone());
        Ok(id)
    }

    async fn session_exists(&self, session_id: &str) -> Result<bool, BackendError> {
        Ok(lock(&self.state).sessions.iter().any(|id| id == session_id))
    }

    async fn prompt(&self, session_id: &str, request: PromptRequest) -> Result<Value, BackendError> {
        lock(&self.state)
            .prompts
            .push((session_id.to_string(), request));
        loop {
            let notified = self.prompt_done.notified();
            if let Some(result) = lock(&self.state).prompt_results.remove(session_id) {
                return result;
            }
            notified.await;
        }
    }

    async fn abort(&self, session_id: &str) -> Result<(), BackendError> {
        lock(&self.state).aborted.push(session_id.to_string());
        Ok(())
    }

    async fn reply_permission(
        &self,
        _session_id: &str,
        permission_id: &str,
        reply: PermissionReply,
    ) -> Result<(), BackendError> {
        lock(&self.state)
            .permission_replies
            .push((permission_id.to_string(), reply));
        Ok(())
    }

    async fn reply_question(&self, request_id: &str, answers: Vec<Vec<String>>) -> Result<(), BackendError> {
        lock(&self.state)
            .question_replies
            .push((request_id.to_string(), Some(answers)));
        Ok(())
    }

    async fn reject_question(&self, request_id: &str) -> Result<(), BackendError> {
        lock(&self.state)
            .question_replies
            .push((request_id.to_string(), None));
        Ok(())
    }

    async fn shutdown(&self) {
        lock(&self.state).shutdowns += 1;
    }
}

/// Launcher that counts launches and hands out one shared fake server.
pub struct FakeLauncher {
    server: Arc<FakeServer>,
    launches: AtomicUsize,
}

impl FakeLauncher {
    pub fn new(server: Arc<FakeServer>) -> Self {
        Self {
            server,
            launches: AtomicUsize::new(0),
        }
    }

    pub fn launches(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ServerLauncher for FakeLauncher {
    async fn launch(&self) -> Result<Arc<dyn RuntimeServer>, BackendError> {
        // Yield so racing callers really overlap with the launch.
        tokio::task::yield_now().await;
        self.launches.fetch_add(1, Ordering::SeqCst);
        Ok(self.server.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn temp_dir_fixture_writes_and_resolves_paths() {
        let fixture = TestTempDir::new("fixture");
        let file = fixture.write_text("nested/file.txt", "hello");
        assert_eq!(fs::read_to_string(file).unwrap(), "hello");
    }

    #[tokio::test]
    async fn fake_server_prompt_waits_for_completion() {
        let server = Arc::new(FakeServer::new());
        let prompt = {
            let server = server.clone();
            tokio::spawn(async move {
                server
                    .prompt("ses_1", PromptRequest::new("hi".into(), None, InteractionMode::Default))
                    .await
            })
        };
        server.complete_prompt("ses_1", serde_json::json!({"ok": true}));
        let result = prompt.await.unwrap().unwrap();
        assert_eq!(result["ok"], true);
    }
}
