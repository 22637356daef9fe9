//! Re-derivation of normalized entries from the immutable raw records.
//!
//! Raw records are replayed in `message_index` order through a fresh
//! normalizer context per backend, so a task whose runtime changed between
//! sessions still normalizes each record with the right rules.

use crate::error::StorageError;
use crate::normalize::{
    normalize_raw, normalizer_for, NormalizeContext, NormalizedEvent, RawInput,
    NORMALIZATION_VERSION,
};
use crate::storage::{
    apply_retraction, apply_upsert, EntryStore, NormalizedEntryRecord, RawMessageRecord,
};
use crate::types::BackendKind;
use std::collections::BTreeMap;
use tracing::info;

/// What a re-normalization run produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReplaySummary {
    pub raw_records: usize,
    pub entries: usize,
    pub retracted: usize,
}

/// True when any persisted entry of the task carries an older version stamp.
pub fn needs_renormalization(store: &dyn EntryStore, task_id: &str) -> Result<bool, StorageError> {
    Ok(store
        .normalized_entries(task_id)?
        .iter()
        .any(|record| record.normalization_version != NORMALIZATION_VERSION))
}

/// Rebuild every normalized entry of `task_id` from its raw records.
pub fn renormalize_task(store: &dyn EntryStore, task_id: &str) -> Result<ReplaySummary, StorageError> {
    let records = store.raw_records(task_id)?;
    let (entries, retracted) = derive_entries(task_id, &records);
    let summary = ReplaySummary {
        raw_records: records.len(),
        entries: entries.len(),
        retracted,
    };
    store.replace_normalized_entries(task_id, entries)?;
    info!(
        task_id,
        raw_records = summary.raw_records,
        entries = summary.entries,
        version = NORMALIZATION_VERSION,
        "task re-normalized"
    );
    Ok(summary)
}

fn derive_entries(
    task_id: &str,
    records: &[RawMessageRecord],
) -> (Vec<NormalizedEntryRecord>, usize) {
    let mut contexts: BTreeMap<BackendKind, NormalizeContext> = BTreeMap::new();
    let mut entries = Vec::new();
    let mut retracted = 0;
    for record in records {
        let context = contexts.entry(record.backend).or_default();
        let events = normalize_raw(
            normalizer_for(record.backend),
            RawInput {
                payload: &record.payload,
                received_at_ms: record.created_at_ms,
            },
            context,
        );
        for event in events {
            match event {
                NormalizedEvent::Entry(entry) => apply_upsert(
                    &mut entries,
                    NormalizedEntryRecord::new(task_id, record.message_index, entry, NORMALIZATION_VERSION),
                ),
                NormalizedEvent::Removed(retraction) => {
                    retracted += apply_retraction(&mut entries, &retraction);
                }
                _ => {}
            }
        }
    }
    (entries, retracted)
}
