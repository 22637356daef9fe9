//! Handlers behind the CLI subcommands. Each returns the text to print.

use agentdeck::display::{merge_entries, DisplayMessage};
use agentdeck::error::SessionError;
use agentdeck::orchestrator::recover_interrupted_tasks;
use agentdeck::replay::{needs_renormalization, renormalize_task};
use agentdeck::storage::EntryStore;
use agentdeck::textutil::single_line_preview;
use agentdeck::timeline::TaskTimelineCache;
use agentdeck::types::{EntryType, NormalizedEntry, Part};
use std::fmt::Write as _;

const PREVIEW_CHARS: usize = 96;

pub(crate) fn list_tasks(store: &dyn EntryStore, cache_limit: usize) -> Result<String, SessionError> {
    let tasks = store.list_tasks()?;
    if tasks.is_empty() {
        return Ok("no tasks\n".to_string());
    }
    let mut cache = TaskTimelineCache::new(cache_limit);
    let mut out = String::new();
    for task in tasks {
        cache.load_from_store(store, &task.task_id)?;
        let attention = cache
            .get(&task.task_id)
            .is_some_and(|state| state.needs_attention());
        let _ = writeln!(
            out,
            "{}\t{}\t{}\tunread={}{}",
            task.task_id,
            task.backend.map_or("-", |backend| backend.as_str()),
            task.status.as_str(),
            cache.unread_count(&task.task_id),
            if attention { "\t!" } else { "" },
        );
    }
    Ok(out)
}

pub(crate) fn show_timeline(
    store: &dyn EntryStore,
    task_id: &str,
    json: bool,
    mark_read: bool,
) -> Result<String, SessionError> {
    let entries: Vec<NormalizedEntry> = store
        .normalized_entries(task_id)?
        .into_iter()
        .map(|record| record.entry)
        .collect();
    let merged = merge_entries(&entries);
    let out = if json {
        let mut text = serde_json::to_string_pretty(&merged).map_err(agentdeck::error::StorageError::from)?;
        text.push('\n');
        text
    } else {
        render_text(&merged)
    };
    if mark_read {
        mark_task_read(store, task_id)?;
    }
    Ok(out)
}

pub(crate) fn recover(store: &dyn EntryStore) -> Result<String, SessionError> {
    let recovered = recover_interrupted_tasks(store, &[])?;
    if recovered.is_empty() {
        return Ok("nothing to recover\n".to_string());
    }
    Ok(format!(
        "marked {} task(s) interrupted: {}\n",
        recovered.len(),
        recovered.join(", ")
    ))
}

pub(crate) fn renormalize(
    store: &dyn EntryStore,
    task_id: Option<&str>,
    force: bool,
) -> Result<String, SessionError> {
    let task_ids: Vec<String> = match task_id {
        Some(task_id) => vec![task_id.to_string()],
        None => store
            .list_tasks()?
            .into_iter()
            .map(|task| task.task_id)
            .collect(),
    };
    let mut out = String::new();
    for task_id in task_ids {
        if !force && !needs_renormalization(store, &task_id)? {
            let _ = writeln!(out, "{task_id}: up to date");
            continue;
        }
        let summary = renormalize_task(store, &task_id)?;
        let _ = writeln!(
            out,
            "{task_id}: {} raw record(s) -> {} entr{}",
            summary.raw_records,
            summary.entries,
            if summary.entries == 1 { "y" } else { "ies" },
        );
    }
    Ok(out)
}

/// Move the durable read watermark to the task's newest entry.
pub(crate) fn mark_task_read(store: &dyn EntryStore, task_id: &str) -> Result<String, SessionError> {
    let mut cache = TaskTimelineCache::new(1);
    cache.load_from_store(store, task_id)?;
    match cache.mark_read(task_id) {
        Some(index) => {
            store.set_last_read_index(task_id, index)?;
            Ok(format!("{task_id}: read through entry {index}\n"))
        }
        None => Ok(format!("{task_id}: no entries\n")),
    }
}

fn render_text(messages: &[DisplayMessage]) -> String {
    let mut out = String::new();
    render_into(&mut out, messages, 0);
    out
}

fn render_into(out: &mut String, messages: &[DisplayMessage], depth: usize) {
    let indent = "  ".repeat(depth);
    for message in messages {
        match message {
            DisplayMessage::Entry { entry } => {
                let _ = writeln!(out, "{indent}{}", entry_line(entry));
            }
            DisplayMessage::SkillGroup {
                tool_use,
                prompt,
                children,
                ..
            } => {
                let _ = writeln!(out, "{indent}{} [skill]", entry_line(tool_use));
                if let Some(prompt) = prompt {
                    let _ = writeln!(out, "{indent}  {}", entry_line(prompt));
                }
                render_into(out, children, depth + 1);
            }
            DisplayMessage::SubAgentGroup {
                tool_use,
                result,
                children,
            } => {
                let state = if result.is_some() { "done" } else { "running" };
                let _ = writeln!(out, "{indent}{} [sub-agent, {state}]", entry_line(tool_use));
                render_into(out, children, depth + 1);
                if let Some(result) = result {
                    let _ = writeln!(out, "{indent}  {}", entry_line(result));
                }
            }
            DisplayMessage::CompactionSpan { start, end } => {
                let state = if end.is_some() { "done" } else { "in progress" };
                let _ = writeln!(out, "{indent}{} [{state}]", entry_line(start));
            }
        }
    }
}

fn entry_line(entry: &NormalizedEntry) -> String {
    let label = entry_label(entry.entry_type);
    let body = entry
        .message
        .parts
        .first()
        .map(part_summary)
        .unwrap_or_default();
    format!("{label:<10} {}", single_line_preview(&body, PREVIEW_CHARS))
}

fn entry_label(entry_type: EntryType) -> &'static str {
    match entry_type {
        EntryType::UserMessage => "user",
        EntryType::AssistantMessage => "assistant",
        EntryType::Reasoning => "thinking",
        EntryType::ToolUse => "tool",
        EntryType::ToolResult => "result",
        EntryType::CompactionStart | EntryType::CompactionEnd => "compact",
        EntryType::SystemStatus => "system",
        EntryType::Result => "done",
        EntryType::Unknown => "unknown",
    }
}

fn part_summary(part: &Part) -> String {
    match part {
        Part::Text { text } | Part::Reasoning { text } => text.clone(),
        Part::File { filename, url, .. } => filename
            .clone()
            .or_else(|| url.clone())
            .unwrap_or_else(|| "file".into()),
        Part::ToolUse { name, input, .. } => format!("{name} {input}"),
        Part::ToolResult {
            content, is_error, ..
        } => {
            if *is_error {
                format!("error: {content}")
            } else {
                content.clone()
            }
        }
        Part::Compaction { trigger, .. } => trigger.clone().unwrap_or_else(|| "context".into()),
        Part::SystemStatus { status, detail } => match detail {
            Some(detail) => format!("{status}: {detail}"),
            None => status.clone(),
        },
        Part::Unknown { original_type, .. } => original_type.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agentdeck::storage::{MemoryStore, NormalizedEntryRecord, TaskRecord};
    use agentdeck::types::{NormalizedMessage, Role, TaskStatus};

    fn text_record(task: &str, index: u64, id: &str, text: &str) -> NormalizedEntryRecord {
        let entry = NormalizedEntry {
            id: id.to_string(),
            entry_type: EntryType::AssistantMessage,
            tool_id: None,
            tool_kind: None,
            message: NormalizedMessage::new(
                id,
                Role::Assistant,
                vec![Part::Text { text: text.into() }],
                0,
            ),
        };
        NormalizedEntryRecord::new(task, index, entry, 1)
    }

    fn seeded_store() -> MemoryStore {
        let store = MemoryStore::new();
        let mut task = TaskRecord::new("t1");
        task.status = TaskStatus::Idle;
        store.save_task(&task).unwrap();
        for n in 0..3 {
            store
                .persist_normalized_entry(text_record("t1", n, &format!("m{n}:0"), "line\nbreak"))
                .unwrap();
        }
        store
    }

    #[test]
    fn tasks_lists_unread_counts() {
        let store = seeded_store();
        store.set_last_read_index("t1", 0).unwrap();
        let out = list_tasks(&store, 4).unwrap();
        assert_eq!(out, "t1\t-\tidle\tunread=2\n");
    }

    #[test]
    fn timeline_renders_one_line_per_entry_and_marks_read() {
        let store = seeded_store();
        let out = show_timeline(&store, "t1", false, true).unwrap();
        assert_eq!(out.lines().count(), 3);
        assert!(out.lines().all(|line| line.contains("line break")));
        assert_eq!(store.task("t1").unwrap().unwrap().last_read_index, Some(2));
    }

    #[test]
    fn recover_reports_running_tasks() {
        let store = seeded_store();
        store.set_status("t1", TaskStatus::Running).unwrap();
        assert!(recover(&store).unwrap().contains("t1"));
        assert_eq!(recover(&store).unwrap(), "nothing to recover\n");
    }

    #[test]
    fn renormalize_skips_current_versions_unless_forced() {
        let store = seeded_store();
        assert_eq!(renormalize(&store, None, false).unwrap(), "t1: up to date\n");
        // No raw records back these entries, so a forced rebuild empties them.
        let out = renormalize(&store, Some("t1"), true).unwrap();
        assert_eq!(out, "t1: 0 raw record(s) -> 0 entries\n");
    }
}
