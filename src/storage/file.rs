//! File-backed store.
//!
//! Layout under the root:
//!
//! ```text
//! tasks/<task_id>/task.json      task record, replaced atomically
//! tasks/<task_id>/raw.jsonl      append-only raw records
//! tasks/<task_id>/entries.jsonl  append-only upsert/retract log
//! ```
//!
//! The entry log is folded on read. Re-normalization rewrites it in one
//! atomic replace.

use super::{
    apply_retraction, apply_upsert, check_index, EntryStore, NormalizedEntryRecord,
    RawMessageRecord, TaskRecord,
};
use crate::error::StorageError;
use crate::types::EntryRetraction;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tracing::warn;

const TASKS_DIR: &str = "tasks";
const TASK_FILE: &str = "task.json";
const RAW_FILE: &str = "raw.jsonl";
const ENTRIES_FILE: &str = "entries.jsonl";

/// One line of the entry log.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum EntryLogLine {
    Upsert { record: Box<NormalizedEntryRecord> },
    Retract { retraction: EntryRetraction },
}

#[derive(Debug)]
pub struct FileStore {
    root: PathBuf,
    /// Next raw index per task, loaded on first use.
    next_index: Mutex<HashMap<String, u64>>,
}

impl FileStore {
    /// Open (creating if needed) a store rooted at `root`.
    pub fn open(root: impl AsRef<Path>) -> Result<Self, StorageError> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(root.join(TASKS_DIR))?;
        Ok(Self {
            root,
            next_index: Mutex::new(HashMap::new()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn task_dir(&self, task_id: &str) -> Result<PathBuf, StorageError> {
        validate_task_id(task_id)?;
        Ok(self.root.join(TASKS_DIR).join(task_id))
    }

    fn indexes(&self) -> MutexGuard<'_, HashMap<String, u64>> {
        self.next_index
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn load_next_index(&self, task_id: &str) -> Result<u64, StorageError> {
        let records: Vec<RawMessageRecord> = read_jsonl(&self.task_dir(task_id)?.join(RAW_FILE))?;
        Ok(records.last().map_or(0, |last| last.message_index + 1))
    }

    fn append_entry_line(&self, task_id: &str, line: &EntryLogLine) -> Result<(), StorageError> {
        let dir = self.task_dir(task_id)?;
        fs::create_dir_all(&dir)?;
        append_jsonl(&dir.join(ENTRIES_FILE), line)
    }
}

impl EntryStore for FileStore {
    fn persist_raw(&self, record: RawMessageRecord) -> Result<String, StorageError> {
        let dir = self.task_dir(&record.task_id)?;
        let mut indexes = self.indexes();
        let expected_min = match indexes.get(&record.task_id) {
            Some(next) => *next,
            None => self.load_next_index(&record.task_id)?,
        };
        check_index(&record.task_id, expected_min, record.message_index)?;
        fs::create_dir_all(&dir)?;
        append_jsonl(&dir.join(RAW_FILE), &record)?;
        indexes.insert(record.task_id.clone(), record.message_index + 1);
        Ok(record.id)
    }

    fn persist_normalized_entry(&self, record: NormalizedEntryRecord) -> Result<(), StorageError> {
        let task_id = record.task_id.clone();
        self.append_entry_line(
            &task_id,
            &EntryLogLine::Upsert {
                record: Box::new(record),
            },
        )
    }

    fn retract_entries(&self, task_id: &str, retraction: &EntryRetraction) -> Result<usize, StorageError> {
        let covered = self
            .normalized_entries(task_id)?
            .iter()
            .filter(|record| retraction.covers(record.entry_id()))
            .count();
        if covered > 0 {
            self.append_entry_line(
                task_id,
                &EntryLogLine::Retract {
                    retraction: retraction.clone(),
                },
            )?;
        }
        Ok(covered)
    }

    fn raw_records(&self, task_id: &str) -> Result<Vec<RawMessageRecord>, StorageError> {
        read_jsonl(&self.task_dir(task_id)?.join(RAW_FILE))
    }

    fn normalized_entries(&self, task_id: &str) -> Result<Vec<NormalizedEntryRecord>, StorageError> {
        let lines: Vec<EntryLogLine> = read_jsonl(&self.task_dir(task_id)?.join(ENTRIES_FILE))?;
        let mut entries = Vec::new();
        for line in lines {
            match line {
                EntryLogLine::Upsert { record } => apply_upsert(&mut entries, *record),
                EntryLogLine::Retract { retraction } => {
                    apply_retraction(&mut entries, &retraction);
                }
            }
        }
        Ok(entries)
    }

    fn replace_normalized_entries(
        &self,
        task_id: &str,
        records: Vec<NormalizedEntryRecord>,
    ) -> Result<(), StorageError> {
        let dir = self.task_dir(task_id)?;
        fs::create_dir_all(&dir)?;
        let mut body = Vec::new();
        for record in records {
            serde_json::to_writer(
                &mut body,
                &EntryLogLine::Upsert {
                    record: Box::new(record),
                },
            )?;
            body.push(b'\n');
        }
        write_atomic(&dir.join(ENTRIES_FILE), &body)
    }

    fn task(&self, task_id: &str) -> Result<Option<TaskRecord>, StorageError> {
        let path = self.task_dir(task_id)?.join(TASK_FILE);
        match fs::read_to_string(&path) {
            Ok(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn save_task(&self, record: &TaskRecord) -> Result<(), StorageError> {
        let dir = self.task_dir(&record.task_id)?;
        fs::create_dir_all(&dir)?;
        let json = serde_json::to_vec_pretty(record)?;
        write_atomic(&dir.join(TASK_FILE), &json)
    }

    fn list_tasks(&self) -> Result<Vec<TaskRecord>, StorageError> {
        let mut tasks = Vec::new();
        for entry in fs::read_dir(self.root.join(TASKS_DIR))? {
            let path = entry?.path().join(TASK_FILE);
            let raw = match fs::read_to_string(&path) {
                Ok(raw) => raw,
                Err(_) => continue,
            };
            // One unreadable task must not hide the others.
            match serde_json::from_str::<TaskRecord>(&raw) {
                Ok(record) => tasks.push(record),
                Err(err) => warn!(path = %path.display(), error = %err, "skipping unreadable task record"),
            }
        }
        tasks.sort_by(|a, b| a.task_id.cmp(&b.task_id));
        Ok(tasks)
    }

    fn next_message_index(&self, task_id: &str) -> Result<u64, StorageError> {
        if let Some(next) = self.indexes().get(task_id) {
            return Ok(*next);
        }
        self.load_next_index(task_id)
    }
}

/// Task ids become directory names, so only a conservative charset is allowed.
fn validate_task_id(task_id: &str) -> Result<(), StorageError> {
    let trimmed = task_id.trim();
    if trimmed.is_empty() || trimmed == "." || trimmed == ".." {
        return Err(StorageError::Corrupt(format!("invalid task id `{task_id}`")));
    }
    if trimmed
        .chars()
        .any(|ch| !(ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' || ch == '.'))
    {
        return Err(StorageError::Corrupt(format!(
            "task id `{task_id}` may only contain ASCII letters, numbers, '.', '-', '_'"
        )));
    }
    Ok(())
}

fn append_jsonl<T: Serialize>(path: &Path, value: &T) -> Result<(), StorageError> {
    let mut line = serde_json::to_vec(value)?;
    line.push(b'\n');
    let mut file = OpenOptions::new()
        .create(true)
        .read(true)
        .append(true)
        .open(path)?;
    drop_torn_tail(&mut file, path)?;
    file.write_all(&line)?;
    Ok(())
}

/// Cut a partial last line left by a crash mid-append so the next record
/// starts on a line of its own.
fn drop_torn_tail(file: &mut fs::File, path: &Path) -> Result<(), StorageError> {
    let len = file.metadata()?.len();
    if len == 0 {
        return Ok(());
    }
    file.seek(SeekFrom::End(-1))?;
    let mut last = [0u8; 1];
    file.read_exact(&mut last)?;
    if last[0] == b'\n' {
        return Ok(());
    }
    file.seek(SeekFrom::Start(0))?;
    let mut bytes = Vec::with_capacity(len as usize);
    file.read_to_end(&mut bytes)?;
    let keep = bytes
        .iter()
        .rposition(|byte| *byte == b'\n')
        .map_or(0, |newline| newline + 1);
    warn!(path = %path.display(), dropped_bytes = bytes.len() - keep, "truncating torn trailing line");
    file.set_len(keep as u64)?;
    Ok(())
}

fn read_jsonl<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<Vec<T>, StorageError> {
    let file = match fs::File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err.into()),
    };
    let mut values = Vec::new();
    let mut lines = BufReader::new(file).lines().peekable();
    while let Some(line) = lines.next() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str(&line) {
            Ok(value) => values.push(value),
            // A torn final line from a crash mid-append is dropped.
            Err(err) if lines.peek().is_none() => {
                warn!(path = %path.display(), error = %err, "ignoring truncated trailing line");
            }
            Err(err) => {
                return Err(StorageError::Corrupt(format!("{}: {err}", path.display())));
            }
        }
    }
    Ok(values)
}

/// Write to a sibling temp file, then rename over the target.
fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StorageError> {
    let tmp_path = path.with_extension("tmp");
    fs::write(&tmp_path, bytes)?;
    fs::rename(&tmp_path, path)?;
    Ok(())
}
