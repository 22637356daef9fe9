//! Persistence surface consumed by the orchestrator.
//!
//! Raw records are the durability source of truth: append-only, immutable,
//! strictly increasing `message_index` per task. Normalized entries are
//! derived from them, stamped with the normalization version, and may be
//! rebuilt at any time (see [`crate::replay`]).

use crate::broker::AllowList;
use crate::error::StorageError;
use crate::types::{
    BackendKind, EntryRetraction, EntryType, NormalizedEntry, TaskId, TaskStatus,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

pub mod file;
pub mod memory;

pub use file::FileStore;
pub use memory::MemoryStore;

/// One raw runtime unit as received.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawMessageRecord {
    pub id: String,
    pub task_id: TaskId,
    pub message_index: u64,
    pub backend: BackendKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend_session_id: Option<String>,
    pub payload: Value,
    pub created_at_ms: u64,
}

impl RawMessageRecord {
    pub fn new(
        task_id: &str,
        message_index: u64,
        backend: BackendKind,
        backend_session_id: Option<String>,
        payload: Value,
    ) -> Self {
        Self {
            id: raw_message_id(message_index),
            task_id: task_id.to_string(),
            message_index,
            backend,
            backend_session_id,
            payload,
            created_at_ms: now_unix_millis(),
        }
    }
}

/// Raw record ids are derived from the index, which is unique per task.
pub fn raw_message_id(message_index: u64) -> String {
    format!("raw-{message_index}")
}

/// One normalized entry plus its indexing keys.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedEntryRecord {
    pub task_id: TaskId,
    /// Index of the raw record that produced (or last updated) this entry.
    pub message_index: u64,
    pub entry_type: EntryType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_tool_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default)]
    pub is_synthetic: bool,
    pub normalization_version: u32,
    pub raw_message_id: String,
    pub entry: NormalizedEntry,
}

impl NormalizedEntryRecord {
    pub fn new(task_id: &str, message_index: u64, entry: NormalizedEntry, version: u32) -> Self {
        Self {
            task_id: task_id.to_string(),
            message_index,
            entry_type: entry.entry_type,
            tool_id: entry.tool_id.clone(),
            parent_tool_id: entry.parent_tool_id().map(str::to_string),
            model: entry.model().map(str::to_string),
            is_synthetic: entry.is_synthetic(),
            normalization_version: version,
            raw_message_id: raw_message_id(message_index),
            entry,
        }
    }

    pub fn entry_id(&self) -> &str {
        &self.entry.id
    }
}

/// Per-task session bookkeeping owned by the data layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub task_id: TaskId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend: Option<BackendKind>,
    #[serde(default)]
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<PathBuf>,
    /// Runtime-native session id, used to resume.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend_session_id: Option<String>,
    /// Index of the last entry the user has seen.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_read_index: Option<u64>,
    /// Session-scope allows carried to the task's next session.
    #[serde(default)]
    pub allow_list: AllowList,
    #[serde(default)]
    pub updated_at_ms: u64,
}

impl TaskRecord {
    pub fn new(task_id: &str) -> Self {
        Self {
            task_id: task_id.to_string(),
            backend: None,
            status: TaskStatus::Created,
            cwd: None,
            backend_session_id: None,
            last_read_index: None,
            allow_list: AllowList::new(),
            updated_at_ms: now_unix_millis(),
        }
    }
}

/// Storage collaborator.
///
/// Implementations must reject a raw record whose index does not advance the
/// task's sequence, and must treat a repeated entry id as an in-place update.
pub trait EntryStore: Send + Sync {
    /// Append a raw record and return its id.
    fn persist_raw(&self, record: RawMessageRecord) -> Result<String, StorageError>;

    /// Insert or update a normalized entry, keyed by entry id.
    fn persist_normalized_entry(&self, record: NormalizedEntryRecord) -> Result<(), StorageError>;

    /// Drop every entry covered by the retraction; returns how many were dropped.
    fn retract_entries(&self, task_id: &str, retraction: &EntryRetraction) -> Result<usize, StorageError>;

    fn raw_records(&self, task_id: &str) -> Result<Vec<RawMessageRecord>, StorageError>;

    /// Current entries in first-seen order.
    fn normalized_entries(&self, task_id: &str) -> Result<Vec<NormalizedEntryRecord>, StorageError>;

    /// Replace every normalized entry of a task (used by re-normalization).
    fn replace_normalized_entries(
        &self,
        task_id: &str,
        records: Vec<NormalizedEntryRecord>,
    ) -> Result<(), StorageError>;

    fn task(&self, task_id: &str) -> Result<Option<TaskRecord>, StorageError>;

    fn save_task(&self, record: &TaskRecord) -> Result<(), StorageError>;

    fn list_tasks(&self) -> Result<Vec<TaskRecord>, StorageError>;

    /// Index the next raw record of this task must use.
    fn next_message_index(&self, task_id: &str) -> Result<u64, StorageError>;

    /// Load a task record, apply `update`, and save it.
    fn update_task(
        &self,
        task_id: &str,
        update: &mut dyn FnMut(&mut TaskRecord),
    ) -> Result<TaskRecord, StorageError> {
        let mut record = self.task(task_id)?.unwrap_or_else(|| TaskRecord::new(task_id));
        update(&mut record);
        record.updated_at_ms = now_unix_millis();
        self.save_task(&record)?;
        Ok(record)
    }

    fn set_status(&self, task_id: &str, status: TaskStatus) -> Result<(), StorageError> {
        self.update_task(task_id, &mut |record| record.status = status)
            .map(|_| ())
    }

    fn set_last_read_index(&self, task_id: &str, index: u64) -> Result<(), StorageError> {
        self.update_task(task_id, &mut |record| record.last_read_index = Some(index))
            .map(|_| ())
    }
}

/// Fold an upsert into an ordered entry list, keeping first position.
pub(crate) fn apply_upsert(entries: &mut Vec<NormalizedEntryRecord>, record: NormalizedEntryRecord) {
    match entries
        .iter_mut()
        .find(|existing| existing.entry_id() == record.entry_id())
    {
        Some(existing) => *existing = record,
        None => entries.push(record),
    }
}

pub(crate) fn apply_retraction(
    entries: &mut Vec<NormalizedEntryRecord>,
    retraction: &EntryRetraction,
) -> usize {
    let before = entries.len();
    entries.retain(|record| !retraction.covers(record.entry_id()));
    before - entries.len()
}

/// Raw records must advance the task's index.
pub(crate) fn check_index(task_id: &str, expected_min: u64, got: u64) -> Result<(), StorageError> {
    if got < expected_min {
        return Err(StorageError::OutOfOrder {
            task_id: task_id.to_string(),
            expected_min,
            got,
        });
    }
    Ok(())
}

/// Current Unix timestamp in milliseconds.
pub fn now_unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
