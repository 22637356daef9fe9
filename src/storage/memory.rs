//! In-memory store, used by tests and embedders that persist elsewhere.

use super::{
    apply_retraction, apply_upsert, check_index, EntryStore, NormalizedEntryRecord,
    RawMessageRecord, TaskRecord,
};
use crate::error::StorageError;
use crate::types::EntryRetraction;
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

#[derive(Debug, Default)]
struct TaskData {
    raw: Vec<RawMessageRecord>,
    entries: Vec<NormalizedEntryRecord>,
    record: Option<TaskRecord>,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    tasks: Mutex<BTreeMap<String, TaskData>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, TaskData>> {
        self.tasks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl EntryStore for MemoryStore {
    fn persist_raw(&self, record: RawMessageRecord) -> Result<String, StorageError> {
        let mut tasks = self.lock();
        let data = tasks.entry(record.task_id.clone()).or_default();
        let expected_min = data.raw.last().map_or(0, |last| last.message_index + 1);
        check_index(&record.task_id, expected_min, record.message_index)?;
        let id = record.id.clone();
        data.raw.push(record);
        Ok(id)
    }

    fn persist_normalized_entry(&self, record: NormalizedEntryRecord) -> Result<(), StorageError> {
        let mut tasks = self.lock();
        let data = tasks.entry(record.task_id.clone()).or_default();
        apply_upsert(&mut data.entries, record);
        Ok(())
    }

    fn retract_entries(&self, task_id: &str, retraction: &EntryRetraction) -> Result<usize, StorageError> {
        Ok(self
            .lock()
            .get_mut(task_id)
            .map_or(0, |data| apply_retraction(&mut data.entries, retraction)))
    }

    fn raw_records(&self, task_id: &str) -> Result<Vec<RawMessageRecord>, StorageError> {
        Ok(self
            .lock()
            .get(task_id)
            .map(|data| data.raw.clone())
            .unwrap_or_default())
    }

    fn normalized_entries(&self, task_id: &str) -> Result<Vec<NormalizedEntryRecord>, StorageError> {
        Ok(self
            .lock()
            .get(task_id)
            .map(|data| data.entries.clone())
            .unwrap_or_default())
    }

    fn replace_normalized_entries(
        &self,
        task_id: &str,
        records: Vec<NormalizedEntryRecord>,
    ) -> Result<(), StorageError> {
        let mut tasks = self.lock();
        let data = tasks.entry(task_id.to_string()).or_default();
        data.entries.clear();
        for record in records {
            apply_upsert(&mut data.entries, record);
        }
        Ok(())
    }

    fn task(&self, task_id: &str) -> Result<Option<TaskRecord>, StorageError> {
        Ok(self.lock().get(task_id).and_then(|data| data.record.clone()))
    }

    fn save_task(&self, record: &TaskRecord) -> Result<(), StorageError> {
        self.lock()
            .entry(record.task_id.clone())
            .or_default()
            .record = Some(record.clone());
        Ok(())
    }

    fn list_tasks(&self) -> Result<Vec<TaskRecord>, StorageError> {
        Ok(self
            .lock()
            .values()
            .filter_map(|data| data.record.clone())
            .collect())
    }

    fn next_message_index(&self, task_id: &str) -> Result<u64, StorageError> {
        Ok(self
            .lock()
            .get(task_id)
            .and_then(|data| data.raw.last())
            .map_or(0, |last| last.message_index + 1))
    }
}
