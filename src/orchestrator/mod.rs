//! Session orchestrator.
//!
//! Owns at most one live session per task and exposes the command surface
//! (`start`, `stop`, `respond_to_permission`, `respond_to_question`,
//! `set_mode`, `dispose`). Each session runs a [`pump::SessionPump`] task
//! that persists and emits everything the backend produces.
//!
//! Status machine per task: `created → running → (idle | errored | interrupted)`.
//! `stop` cancels the session, waits for the pump to exit and then records
//! `interrupted` itself, so no pump write can land after `stop` returns.

use crate::backend::{AgentBackend, BackendRegistry, CancelSignal, StartConfig};
use crate::broker::{lock_allow_list, PermissionResponse, QuestionAnswer, SharedAllowList};
use crate::config::SessionConfig;
use crate::error::SessionError;
use crate::events::{EventEmitter, SessionEvent};
use crate::normalize::{normalizer_for, NormalizeContext};
use crate::storage::EntryStore;
use crate::types::{BackendKind, InteractionMode, TaskId, TaskStatus};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tracing::{info, warn};

pub mod pump;

pub use pump::PumpExit;
use pump::SessionPump;

/// Parameters of a `start` command.
#[derive(Debug, Clone)]
pub struct StartRequest {
    pub task_id: TaskId,
    pub backend: BackendKind,
    pub cwd: PathBuf,
    pub mode: InteractionMode,
    pub model: Option<String>,
    pub prompt: String,
    /// Resume the task's recorded runtime session instead of starting fresh.
    pub resume: bool,
}

impl StartRequest {
    /// Fresh session in the default mode with the runtime's default model.
    pub fn new(
        task_id: impl Into<TaskId>,
        backend: BackendKind,
        cwd: impl Into<PathBuf>,
        prompt: impl Into<String>,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            backend,
            cwd: cwd.into(),
            mode: InteractionMode::Default,
            model: None,
            prompt: prompt.into(),
            resume: false,
        }
    }

    /// Fresh session using the configured backend, mode and model.
    pub fn from_session_config(
        task_id: impl Into<TaskId>,
        session: &SessionConfig,
        cwd: impl Into<PathBuf>,
        prompt: impl Into<String>,
    ) -> Self {
        let mut request = Self::new(task_id, session.backend, cwd, prompt).with_mode(session.mode);
        request.model = session.model.clone();
        request
    }

    pub fn with_mode(mut self, mode: InteractionMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn resuming(mut self) -> Self {
        self.resume = true;
        self
    }
}

struct ActiveSession {
    backend: Arc<dyn AgentBackend>,
    session_id: String,
    cancel: CancelSignal,
    allow_list: SharedAllowList,
    pump: JoinHandle<PumpExit>,
}

type SessionTable = Arc<Mutex<HashMap<TaskId, ActiveSession>>>;

fn lock_table(table: &SessionTable) -> MutexGuard<'_, HashMap<TaskId, ActiveSession>> {
    table
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub struct Orchestrator {
    backends: BackendRegistry,
    store: Arc<dyn EntryStore>,
    emitter: EventEmitter,
    sessions: SessionTable,
}

impl Orchestrator {
    pub fn new(backends: BackendRegistry, store: Arc<dyn EntryStore>, emitter: EventEmitter) -> Self {
        Self {
            backends,
            store,
            emitter,
            sessions: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn store(&self) -> &Arc<dyn EntryStore> {
        &self.store
    }

    /// Session table with sessions whose pump already exited dropped.
    fn live_sessions(&self) -> MutexGuard<'_, HashMap<TaskId, ActiveSession>> {
        let mut table = lock_table(&self.sessions);
        table.retain(|_, active| !active.pump.is_finished());
        table
    }

    pub fn is_running(&self, task_id: &str) -> bool {
        self.live_sessions().contains_key(task_id)
    }

    pub fn running_tasks(&self) -> Vec<TaskId> {
        let mut tasks: Vec<TaskId> = self.live_sessions().keys().cloned().collect();
        tasks.sort();
        tasks
    }

    /// Start (or resume) the task's session and issue its prompt.
    ///
    /// A failed backend start leaves no session and no status change behind.
    pub async fn start(&self, request: StartRequest) -> Result<String, SessionError> {
        if self.is_running(&request.task_id) {
            return Err(SessionError::AlreadyRunning(request.task_id));
        }
        let backend = self
            .backends
            .get(request.backend)
            .ok_or_else(|| SessionError::BackendNotRegistered(request.backend.to_string()))?;
        let record = self.store.task(&request.task_id)?;
        let resume_session_id = if request.resume {
            let recorded = record.as_ref().and_then(|record| record.backend_session_id.clone());
            match recorded {
                Some(id) => Some(id),
                None => return Err(SessionError::NothingToResume(request.task_id)),
            }
        } else {
            None
        };
        let allow_list = record
            .as_ref()
            .map(|record| record.allow_list.clone())
            .unwrap_or_default();

        let session = backend
            .start(
                StartConfig {
                    task_id: request.task_id.clone(),
                    cwd: request.cwd.clone(),
                    mode: request.mode,
                    model: request.model.clone(),
                    resume_session_id: resume_session_id.clone(),
                    allow_list,
                },
                request.prompt,
            )
            .await?;

        let backend_session_id = session.runtime_session_id.clone().or(resume_session_id);
        let next_index = match self.store.next_message_index(&request.task_id) {
            Ok(index) => index,
            Err(err) => {
                // The session never became visible; tear it down before reporting.
                let _ = backend.stop(&session.session_id).await;
                return Err(err.into());
            }
        };
        let recorded_session_id = backend_session_id.clone();
        let kind = request.backend;
        let cwd = request.cwd.clone();
        self.store.update_task(&request.task_id, &mut |record| {
            record.status = TaskStatus::Running;
            record.backend = Some(kind);
            record.cwd = Some(cwd.clone());
            if recorded_session_id.is_some() {
                record.backend_session_id = recorded_session_id.clone();
            }
        })?;
        self.emitter.emit(SessionEvent::StatusChanged {
            task_id: request.task_id.clone(),
            status: TaskStatus::Running,
        });

        let mut pump = SessionPump {
            task_id: request.task_id.clone(),
            backend: request.backend,
            backend_session_id,
            store: self.store.clone(),
            emitter: self.emitter.clone(),
            cancel: session.cancel.clone(),
            allow_list: session.allow_list.clone(),
            normalizer: normalizer_for(request.backend),
            context: NormalizeContext::new(),
            next_index,
        };
        // Replay folds every earlier raw record into one context, so the live
        // pump starts from the same state to derive identical entry ids.
        pump.seed_context();
        let handle = tokio::spawn(pump.run(session.events));

        info!(task_id = %request.task_id, session_id = %session.session_id, backend = %request.backend, message_index = next_index, "session running");
        lock_table(&self.sessions).insert(
            request.task_id,
            ActiveSession {
                backend,
                session_id: session.session_id.clone(),
                cancel: session.cancel,
                allow_list: session.allow_list,
                pump: handle,
            },
        );
        Ok(session.session_id)
    }

    /// Cancel the task's session: no further writes, pending requests denied.
    pub async fn stop(&self, task_id: &str) -> Result<(), SessionError> {
        let active = lock_table(&self.sessions)
            .remove(task_id)
            .ok_or_else(|| SessionError::NotRunning(task_id.to_string()))?;
        active.cancel.cancel();
        if let Err(err) = active.backend.stop(&active.session_id).await {
            warn!(task_id, error = %err, "backend stop failed");
        }
        // The pump observes the cancel at its next suspension point.
        match active.pump.await {
            Ok(PumpExit::Finished(status)) => {
                info!(task_id, status = status.as_str(), "session had already finished");
                return Ok(());
            }
            Ok(PumpExit::Cancelled) => {}
            Err(err) => warn!(task_id, error = %err, "session pump did not exit cleanly"),
        }

        let allow_list = lock_allow_list(&active.allow_list).clone();
        self.store.update_task(task_id, &mut |record| {
            record.status = TaskStatus::Interrupted;
            record.allow_list = allow_list.clone();
        })?;
        info!(task_id, "session interrupted");
        self.emitter.emit(SessionEvent::StatusChanged {
            task_id: task_id.to_string(),
            status: TaskStatus::Interrupted,
        });
        Ok(())
    }

    fn active(&self, task_id: &str) -> Result<(Arc<dyn AgentBackend>, String), SessionError> {
        self.live_sessions()
            .get(task_id)
            .map(|active| (active.backend.clone(), active.session_id.clone()))
            .ok_or_else(|| SessionError::NotRunning(task_id.to_string()))
    }

    pub async fn respond_to_permission(
        &self,
        task_id: &str,
        request_id: &str,
        response: PermissionResponse,
    ) -> Result<(), SessionError> {
        let (backend, session_id) = self.active(task_id)?;
        let allowed = response.is_allow();
        backend
            .respond_to_permission(&session_id, request_id, response)
            .await?;
        self.emitter.emit(SessionEvent::PermissionResolved {
            task_id: task_id.to_string(),
            request_id: request_id.to_string(),
            allowed,
        });
        Ok(())
    }

    pub async fn respond_to_question(
        &self,
        task_id: &str,
        request_id: &str,
        answer: QuestionAnswer,
    ) -> Result<(), SessionError> {
        let (backend, session_id) = self.active(task_id)?;
        backend
            .respond_to_question(&session_id, request_id, answer)
            .await?;
        self.emitter.emit(SessionEvent::QuestionResolved {
            task_id: task_id.to_string(),
            request_id: request_id.to_string(),
        });
        Ok(())
    }

    pub async fn set_mode(&self, task_id: &str, mode: InteractionMode) -> Result<(), SessionError> {
        let (backend, session_id) = self.active(task_id)?;
        backend.set_mode(&session_id, mode).await?;
        self.emitter.emit(SessionEvent::ModeChanged {
            task_id: task_id.to_string(),
            mode,
        });
        Ok(())
    }

    /// Stop every session and release backend-wide resources.
    pub async fn dispose(&self) {
        let tasks: Vec<TaskId> = lock_table(&self.sessions).keys().cloned().collect();
        for task_id in tasks {
            if let Err(err) = self.stop(&task_id).await {
                warn!(task_id = %task_id, error = %err, "stop failed during dispose");
            }
        }
        self.backends.dispose_all().await;
    }

    /// Reconcile tasks a previous process left live.
    ///
    /// Returns the reconciled task ids.
    pub fn recover_interrupted_tasks(&self) -> Result<Vec<TaskId>, SessionError> {
        recover_interrupted_tasks(self.store.as_ref(), &self.running_tasks())
    }
}

/// Mark every non-terminal task not in `live` as interrupted.
pub fn recover_interrupted_tasks(
    store: &dyn EntryStore,
    live: &[TaskId],
) -> Result<Vec<TaskId>, SessionError> {
    let mut recovered = Vec::new();
    for task in store.list_tasks()? {
        if task.status.is_terminal() || live.contains(&task.task_id) {
            continue;
        }
        store.set_status(&task.task_id, TaskStatus::Interrupted)?;
        info!(task_id = %task.task_id, previous = task.status.as_str(), "recovered stale session");
        recovered.push(task.task_id);
    }
    Ok(recovered)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::ClaudeBackend;
    use crate::error::BackendError;
    use crate::events::SessionEventEnvelope;
    use crate::storage::{MemoryStore, TaskRecord};
    use crate::testsupport::{ScriptStep, ScriptedCallbackRuntime};
    use serde_json::json;
    use std::time::Duration;
    use tokio::sync::mpsc;

    struct Harness {
        orchestrator: Orchestrator,
        store: Arc<MemoryStore>,
        runtime: Arc<ScriptedCallbackRuntime>,
        events: mpsc::UnboundedReceiver<SessionEventEnvelope>,
    }

    fn harness(script: Vec<ScriptStep>) -> Harness {
        let runtime = Arc::new(ScriptedCallbackRuntime::new(script));
        let store = Arc::new(MemoryStore::new());
        let (emitter, events) = EventEmitter::channel();
        let backends = BackendRegistry::new().with(Arc::new(ClaudeBackend::new(runtime.clone())));
        Harness {
            orchestrator: Orchestrator::new(backends, store.clone(), emitter),
            store,
            runtime,
            events,
        }
    }

    fn start_request(task: &str) -> StartRequest {
        StartRequest::new(task, BackendKind::ClaudeCode, "/work", "do it")
    }

    async fn wait_for(
        events: &mut mpsc::UnboundedReceiver<SessionEventEnvelope>,
        mut pred: impl FnMut(&SessionEvent) -> bool,
    ) -> SessionEvent {
        loop {
            let envelope = tokio::time::timeout(Duration::from_secs(2), events.recv())
                .await
                .expect("event in time")
                .expect("channel open");
            if pred(&envelope.event) {
                return envelope.event;
            }
        }
    }

    fn assistant(id: &str, text: &str) -> ScriptStep {
        ScriptStep::Message(json!({
            "type": "assistant",
            "message": {"id": id, "role": "assistant", "content": [{"type": "text", "text": text}]}
        }))
    }

    #[tokio::test]
    async fn indexes_are_contiguous_and_entries_reference_raw() {
        let mut h = harness(vec![
            ScriptStep::Message(json!({"type": "system", "subtype": "init", "session_id": "rt-1"})),
            assistant("m1", "one"),
            assistant("m2", "two"),
            ScriptStep::Message(json!({"type": "result", "subtype": "success", "total_cost_usd": 0.1})),
        ]);
        h.orchestrator.start(start_request("t1")).await.unwrap();
        wait_for(&mut h.events, |e| {
            matches!(e, SessionEvent::StatusChanged { status: TaskStatus::Idle, .. })
        })
        .await;

        let raw = h.store.raw_records("t1").unwrap();
        let indexes: Vec<u64> = raw.iter().map(|r| r.message_index).collect();
        assert_eq!(indexes, vec![0, 1, 2, 3]);
        for entry in h.store.normalized_entries("t1").unwrap() {
            assert_eq!(entry.raw_message_id, format!("raw-{}", entry.message_index));
        }
        let task = h.store.task("t1").unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Idle);
        assert_eq!(task.backend_session_id.as_deref(), Some("rt-1"));
        assert!(!h.orchestrator.is_running("t1"));
    }

    #[tokio::test]
    async fn fresh_sessions_derive_the_same_ids_as_replay() {
        let mut h = harness(vec![
            ScriptStep::Message(json!({"type": "system", "subtype": "status", "status": "compacting"})),
            ScriptStep::Message(json!({"type": "system", "subtype": "compact_boundary", "compact_metadata": {"trigger": "auto"}})),
        ]);
        for _ in 0..2 {
            h.orchestrator.start(start_request("t1")).await.unwrap();
            wait_for(&mut h.events, |e| matches!(e, SessionEvent::StatusChanged { status: TaskStatus::Idle, .. })).await;
        }
        let ids = |store: &MemoryStore| -> Vec<String> {
            store
                .normalized_entries("t1")
                .unwrap()
                .iter()
                .map(|record| record.entry_id().to_string())
                .collect()
        };
        let live = ids(&h.store);
        let ends = h
            .store
            .normalized_entries("t1")
            .unwrap()
            .iter()
            .filter(|record| record.entry.entry_type == crate::types::EntryType::CompactionEnd)
            .count();
        assert_eq!(ends, 2);

        crate::replay::renormalize_task(h.store.as_ref(), "t1").unwrap();
        assert_eq!(ids(&h.store), live);
    }

    #[tokio::test]
    async fn finished_sessions_leave_the_table() {
        let mut h = harness(vec![assistant("m1", "one")]);
        h.orchestrator.start(start_request("t1")).await.unwrap();
        wait_for(&mut h.events, |e| matches!(e, SessionEvent::StatusChanged { status: TaskStatus::Idle, .. })).await;
        for _ in 0..400 {
            if !h.orchestrator.is_running("t1") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(h.orchestrator.running_tasks().is_empty());
        assert_eq!(lock_table(&h.orchestrator.sessions).len(), 0);
        assert!(matches!(
            h.orchestrator.set_mode("t1", InteractionMode::Plan).await,
            Err(SessionError::NotRunning(_))
        ));
    }

    #[tokio::test]
    async fn second_session_continues_the_index() {
        let mut h = harness(vec![assistant("m1", "one")]);
        h.orchestrator.start(start_request("t1")).await.unwrap();
        wait_for(&mut h.events, |e| matches!(e, SessionEvent::StatusChanged { status: TaskStatus::Idle, .. })).await;
        h.orchestrator.start(start_request("t1")).await.unwrap();
        wait_for(&mut h.events, |e| matches!(e, SessionEvent::StatusChanged { status: TaskStatus::Idle, .. })).await;
        let indexes: Vec<u64> = h.store.raw_records("t1").unwrap().iter().map(|r| r.message_index).collect();
        assert_eq!(indexes, vec![0, 1]);
    }

    #[tokio::test]
    async fn failed_resume_creates_nothing() {
        let h = harness(Vec::new());
        let mut record = TaskRecord::new("t1");
        record.status = TaskStatus::Idle;
        record.backend_session_id = Some("rt-gone".into());
        h.store.save_task(&record).unwrap();

        let err = h
            .orchestrator
            .start(start_request("t1").resuming())
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::Backend(BackendError::ResumeNotFound { .. })));
        assert!(!h.orchestrator.is_running("t1"));
        assert_eq!(h.store.task("t1").unwrap().unwrap().status, TaskStatus::Idle);
        assert_eq!(h.runtime.query_count(), 0);
    }

    #[test]
    fn session_config_seeds_request_defaults() {
        let session = SessionConfig {
            backend: BackendKind::Opencode,
            mode: InteractionMode::Plan,
            model: Some("sonnet".into()),
        };
        let request = StartRequest::from_session_config("t1", &session, "/work", "go");
        assert_eq!(request.backend, BackendKind::Opencode);
        assert_eq!(request.mode, InteractionMode::Plan);
        assert_eq!(request.model.as_deref(), Some("sonnet"));
        assert!(!request.resume);
    }

    #[tokio::test]
    async fn resume_without_recorded_session_is_rejected() {
        let h = harness(Vec::new());
        let mut record = TaskRecord::new("t1");
        record.status = TaskStatus::Idle;
        h.store.save_task(&record).unwrap();

        let err = h
            .orchestrator
            .start(start_request("t1").resuming())
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::NothingToResume(ref task) if task == "t1"));
        assert_eq!(h.runtime.query_count(), 0);
    }

    #[tokio::test]
    async fn stop_denies_pending_and_prevents_further_writes() {
        let mut h = harness(vec![
            assistant("m1", "before"),
            ScriptStep::Tool {
                name: "Bash".into(),
                input: json!({"command": "rm -rf build"}),
            },
            assistant("m2", "after"),
        ]);
        h.orchestrator.start(start_request("t1")).await.unwrap();
        let mut request = None;
        let mut saw_entry = false;
        while request.is_none() || !saw_entry {
            match wait_for(&mut h.events, |_| true).await {
                SessionEvent::PermissionRequested { request: r, .. } => request = Some(r),
                SessionEvent::Entry { .. } => saw_entry = true,
                _ => {}
            }
        }
        let request = request.unwrap();

        h.orchestrator.stop("t1").await.unwrap();
        let raw_after_stop = h.store.raw_records("t1").unwrap().len();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(h.store.raw_records("t1").unwrap().len(), raw_after_stop);
        assert_eq!(raw_after_stop, 1);
        assert_eq!(h.store.task("t1").unwrap().unwrap().status, TaskStatus::Interrupted);
        assert!(matches!(
            h.runtime.wait_for_decisions(1).await.as_slice(),
            [crate::backend::GateDecision::Deny { .. }]
        ));
        assert!(matches!(
            h.orchestrator
                .respond_to_permission("t1", &request.request_id, PermissionResponse::allow_once())
                .await,
            Err(SessionError::NotRunning(_))
        ));
    }

    #[tokio::test]
    async fn session_allow_suppresses_repeat_and_carries_over() {
        let bash = || ScriptStep::Tool {
            name: "Bash".into(),
            input: json!({"command": "cargo test"}),
        };
        let mut h = harness(vec![bash(), bash()]);
        h.orchestrator.start(start_request("t1")).await.unwrap();
        let SessionEvent::PermissionRequested { request, .. } =
            wait_for(&mut h.events, |e| matches!(e, SessionEvent::PermissionRequested { .. })).await
        else {
            unreachable!();
        };
        h.orchestrator
            .respond_to_permission("t1", &request.request_id, PermissionResponse::allow_for_session())
            .await
            .unwrap();

        let mut permission_requests = 0;
        loop {
            let event = wait_for(&mut h.events, |_| true).await;
            match event {
                SessionEvent::PermissionRequested { .. } => permission_requests += 1,
                SessionEvent::StatusChanged { status: TaskStatus::Idle, .. } => break,
                _ => {}
            }
        }
        assert_eq!(permission_requests, 0);
        assert_eq!(h.runtime.decisions().len(), 2);
        assert_eq!(h.store.task("t1").unwrap().unwrap().allow_list.len(), 1);
    }

    #[tokio::test]
    async fn start_while_running_is_rejected() {
        let h = harness(vec![ScriptStep::Tool {
            name: "Write".into(),
            input: json!({"file_path": "x"}),
        }]);
        h.orchestrator.start(start_request("t1")).await.unwrap();
        assert!(matches!(
            h.orchestrator.start(start_request("t1")).await,
            Err(SessionError::AlreadyRunning(_))
        ));
        h.orchestrator.dispose().await;
        assert!(!h.orchestrator.is_running("t1"));
    }

    #[test]
    fn recovery_marks_stale_live_tasks_interrupted() {
        let store = MemoryStore::new();
        for (id, status) in [
            ("a", TaskStatus::Running),
            ("b", TaskStatus::Idle),
            ("c", TaskStatus::Created),
        ] {
            let mut record = TaskRecord::new(id);
            record.status = status;
            store.save_task(&record).unwrap();
        }
        let recovered = recover_interrupted_tasks(&store, &[]).unwrap();
        assert_eq!(recovered, vec!["a".to_string(), "c".to_string()]);
        assert_eq!(store.task("b").unwrap().unwrap().status, TaskStatus::Idle);
        assert_eq!(store.task("a").unwrap().unwrap().status, TaskStatus::Interrupted);
    }
}
