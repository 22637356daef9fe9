//! Task timeline cache: bounded per-task view state fed by the event stream.
//!
//! The cache is a convenience for presentation code, never a durability
//! source. Events for a task that is not loaded are dropped; the task's
//! timeline is rebuilt from the store the next time it is loaded.

use crate::broker::{PermissionRequest, QuestionRequest};
use crate::error::StorageError;
use crate::events::{SessionEvent, SessionEventEnvelope};
use crate::storage::EntryStore;
use crate::types::{
    CompletionOutcome, InteractionMode, NormalizedEntry, RateLimitInfo, TaskId, TaskStatus,
    ToolState,
};
use std::collections::{BTreeMap, HashMap};
use tracing::debug;

/// Cached view of one task.
#[derive(Debug, Clone, PartialEq)]
pub struct TimelineState {
    pub task_id: TaskId,
    pub entries: Vec<NormalizedEntry>,
    pub status: TaskStatus,
    pub last_read_index: Option<u64>,
    pub pending_permissions: Vec<PermissionRequest>,
    pub pending_questions: Vec<QuestionRequest>,
    pub queued_prompts: Vec<String>,
    pub session_id: Option<String>,
    pub mode: Option<InteractionMode>,
    pub tool_states: BTreeMap<String, ToolState>,
    pub last_outcome: Option<CompletionOutcome>,
    pub last_error: Option<String>,
    pub rate_limit: Option<RateLimitInfo>,
    last_access: u64,
}

impl TimelineState {
    fn new(task_id: TaskId, entries: Vec<NormalizedEntry>, status: TaskStatus) -> Self {
        Self {
            task_id,
            entries,
            status,
            last_read_index: None,
            pending_permissions: Vec::new(),
            pending_questions: Vec::new(),
            queued_prompts: Vec::new(),
            session_id: None,
            mode: None,
            tool_states: BTreeMap::new(),
            last_outcome: None,
            last_error: None,
            rate_limit: None,
            last_access: 0,
        }
    }

    /// Entries past the read watermark. Running tasks report zero; attention
    /// for them goes through the pending permission/question indicator.
    pub fn unread_count(&self) -> usize {
        if self.status == TaskStatus::Running {
            return 0;
        }
        let total = self.entries.len() as i64;
        let last = self.last_read_index.map_or(-1, |index| index as i64);
        (total - 1 - last).max(0) as usize
    }

    pub fn needs_attention(&self) -> bool {
        !self.pending_permissions.is_empty() || !self.pending_questions.is_empty()
    }

    fn upsert(&mut self, entry: NormalizedEntry) {
        match self.entries.iter_mut().find(|existing| existing.id == entry.id) {
            Some(existing) => *existing = entry,
            None => self.entries.push(entry),
        }
    }

    fn apply(&mut self, event: &SessionEvent) {
        match event {
            SessionEvent::SessionIdAssigned { session_id, .. } => {
                self.session_id = Some(session_id.clone());
            }
            SessionEvent::Entry { entry, .. } => self.upsert(entry.clone()),
            SessionEvent::EntryRemoved { retraction, .. } => {
                self.entries.retain(|entry| !retraction.covers(&entry.id));
            }
            SessionEvent::PermissionRequested { request, .. } => {
                self.pending_permissions.push(request.clone());
            }
            SessionEvent::PermissionResolved { request_id, .. } => {
                self.pending_permissions
                    .retain(|request| &request.request_id != request_id);
            }
            SessionEvent::QuestionRequested { request, .. } => {
                self.pending_questions.push(request.clone());
            }
            SessionEvent::QuestionResolved { request_id, .. } => {
                self.pending_questions
                    .retain(|request| &request.request_id != request_id);
            }
            SessionEvent::ModeChanged { mode, .. } => self.mode = Some(*mode),
            SessionEvent::ToolState { tool_id, state, .. } => {
                self.tool_states.insert(tool_id.clone(), *state);
            }
            SessionEvent::Completed { outcome, .. } => self.last_outcome = Some(outcome.clone()),
            SessionEvent::Error { message, .. } => self.last_error = Some(message.clone()),
            SessionEvent::RateLimited { info, .. } => self.rate_limit = Some(info.clone()),
            SessionEvent::StatusChanged { status, .. } => {
                self.status = *status;
                // Ended sessions deny whatever was outstanding.
                if *status != TaskStatus::Running {
                    self.pending_permissions.clear();
                    self.pending_questions.clear();
                }
            }
        }
    }
}

/// Bounded cache of task timelines with least-recently-accessed eviction.
#[derive(Debug)]
pub struct TaskTimelineCache {
    limit: usize,
    tick: u64,
    tasks: HashMap<TaskId, TimelineState>,
}

impl TaskTimelineCache {
    pub fn new(limit: usize) -> Self {
        Self {
            limit: limit.max(1),
            tick: 0,
            tasks: HashMap::new(),
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn contains(&self, task_id: &str) -> bool {
        self.tasks.contains_key(task_id)
    }

    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    /// Insert (or replace) a task's timeline and evict over the limit.
    ///
    /// Returns the ids evicted to make room. The task being loaded and
    /// running tasks are never evicted, so the cache may stay over its limit.
    pub fn load(
        &mut self,
        task_id: &str,
        entries: Vec<NormalizedEntry>,
        status: TaskStatus,
        last_read_index: Option<u64>,
    ) -> Vec<TaskId> {
        let tick = self.next_tick();
        let mut state = TimelineState::new(task_id.to_string(), entries, status);
        state.last_read_index = last_read_index;
        state.last_access = tick;
        if let Some(previous) = self.tasks.remove(task_id) {
            state.queued_prompts = previous.queued_prompts;
            state.pending_permissions = previous.pending_permissions;
            state.pending_questions = previous.pending_questions;
        }
        self.tasks.insert(task_id.to_string(), state);
        self.evict(task_id)
    }

    /// Load a task's persisted timeline from `store`.
    pub fn load_from_store(
        &mut self,
        store: &dyn EntryStore,
        task_id: &str,
    ) -> Result<Vec<TaskId>, StorageError> {
        let record = store.task(task_id)?;
        let entries = store
            .normalized_entries(task_id)?
            .into_iter()
            .map(|record| record.entry)
            .collect();
        let (status, last_read) = record
            .map(|record| (record.status, record.last_read_index))
            .unwrap_or_default();
        Ok(self.load(task_id, entries, status, last_read))
    }

    fn evict(&mut self, keep: &str) -> Vec<TaskId> {
        let mut evicted = Vec::new();
        while self.tasks.len() > self.limit {
            let victim = self
                .tasks
                .values()
                .filter(|state| state.status != TaskStatus::Running && state.task_id != keep)
                .min_by_key(|state| state.last_access)
                .map(|state| state.task_id.clone());
            let Some(victim) = victim else {
                break;
            };
            debug!(task_id = %victim, "evicting task timeline");
            self.tasks.remove(&victim);
            evicted.push(victim);
        }
        evicted
    }

    /// Read without counting as an access.
    pub fn get(&self, task_id: &str) -> Option<&TimelineState> {
        self.tasks.get(task_id)
    }

    /// Read and mark the task as most recently accessed.
    pub fn view(&mut self, task_id: &str) -> Option<&TimelineState> {
        let tick = self.next_tick();
        let state = self.tasks.get_mut(task_id)?;
        state.last_access = tick;
        Some(state)
    }

    /// Fold one outward event in. Returns false when the task is not loaded.
    pub fn apply(&mut self, envelope: &SessionEventEnvelope) -> bool {
        let task_id = envelope.event.task_id();
        match self.tasks.get_mut(task_id) {
            Some(state) => {
                state.apply(&envelope.event);
                true
            }
            None => {
                debug!(task_id, seq = envelope.seq, "dropping event for unloaded task");
                false
            }
        }
    }

    pub fn unread_count(&self, task_id: &str) -> usize {
        self.tasks.get(task_id).map_or(0, TimelineState::unread_count)
    }

    /// Move the read watermark to the newest entry and return it so the
    /// caller can persist it (see [`EntryStore::set_last_read_index`]).
    pub fn mark_read(&mut self, task_id: &str) -> Option<u64> {
        let state = self.tasks.get_mut(task_id)?;
        let last = state.entries.len().checked_sub(1)? as u64;
        state.last_read_index = Some(last);
        Some(last)
    }

    /// Queue a prompt to send once the task's session is idle again.
    pub fn enqueue_prompt(&mut self, task_id: &str, prompt: impl Into<String>) -> bool {
        match self.tasks.get_mut(task_id) {
            Some(state) => {
                state.queued_prompts.push(prompt.into());
                true
            }
            None => false,
        }
    }

    pub fn take_queued_prompts(&mut self, task_id: &str) -> Vec<String> {
        self.tasks
            .get_mut(task_id)
            .map(|state| std::mem::take(&mut state.queued_prompts))
            .unwrap_or_default()
    }
}
