//! Display merger: groups a task's flat entry sequence into render units.
//!
//! Grouping never mutates entries. Children are found through an index from
//! launching tool id to child positions built up front, so entries carry no
//! back-pointers to their groups. A launcher nested under another launcher
//! opens its own group inside the parent's children.

use crate::types::{EntryType, NormalizedEntry, ToolKind};
use serde::Serialize;
use std::collections::HashMap;

/// One render unit derived from the entry sequence. Never persisted.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DisplayMessage {
    Entry {
        entry: NormalizedEntry,
    },
    SkillGroup {
        tool_use: NormalizedEntry,
        result: Option<NormalizedEntry>,
        prompt: Option<NormalizedEntry>,
        children: Vec<DisplayMessage>,
    },
    SubAgentGroup {
        tool_use: NormalizedEntry,
        /// `None` while the sub-agent is still running.
        result: Option<NormalizedEntry>,
        children: Vec<DisplayMessage>,
    },
    CompactionSpan {
        start: NormalizedEntry,
        /// `None` while compaction is still in progress.
        end: Option<NormalizedEntry>,
    },
}

impl DisplayMessage {
    /// Number of entries folded into this unit, nested groups included.
    pub fn entry_count(&self) -> usize {
        let nested = |children: &[DisplayMessage]| -> usize {
            children.iter().map(DisplayMessage::entry_count).sum()
        };
        match self {
            Self::Entry { .. } => 1,
            Self::SkillGroup {
                result,
                prompt,
                children,
                ..
            } => 1 + usize::from(result.is_some()) + usize::from(prompt.is_some()) + nested(children),
            Self::SubAgentGroup { result, children, .. } => {
                1 + usize::from(result.is_some()) + nested(children)
            }
            Self::CompactionSpan { end, .. } => 1 + usize::from(end.is_some()),
        }
    }
}

fn is_group_launcher(entry: &NormalizedEntry) -> bool {
    entry.entry_type == EntryType::ToolUse
        && matches!(entry.tool_kind, Some(ToolKind::SubAgent | ToolKind::Skill))
}

fn is_synthetic_prompt(entry: &NormalizedEntry) -> bool {
    entry.entry_type == EntryType::UserMessage && entry.is_synthetic()
}

/// Group `entries` (in persisted order) into display units.
pub fn merge_entries(entries: &[NormalizedEntry]) -> Vec<DisplayMessage> {
    // Launching tool uses by tool id; the first by position owns the id.
    let mut launchers: HashMap<&str, usize> = HashMap::new();
    for (index, entry) in entries.iter().enumerate() {
        if !is_group_launcher(entry) {
            continue;
        }
        if let Some(tool_id) = entry.tool_id.as_deref() {
            launchers.entry(tool_id).or_insert(index);
        }
    }

    // A child belongs to a launcher positioned before it, so parent chains
    // always point backwards and nesting cannot loop.
    let mut claimed = vec![false; entries.len()];
    let mut children: HashMap<&str, Vec<usize>> = HashMap::new();
    let mut results: HashMap<&str, usize> = HashMap::new();
    for (index, entry) in entries.iter().enumerate() {
        if let Some(parent) = entry.parent_tool_id() {
            if launchers.get(parent).is_some_and(|launcher| *launcher < index) {
                children.entry(parent).or_default().push(index);
                claimed[index] = true;
                continue;
            }
        }
        if entry.entry_type == EntryType::ToolResult {
            if let Some(tool_id) = entry.tool_id.as_deref() {
                if launchers.contains_key(tool_id) && !results.contains_key(tool_id) {
                    results.insert(tool_id, index);
                    claimed[index] = true;
                }
            }
        }
    }

    let top_level: Vec<usize> = (0..entries.len()).filter(|index| !claimed[*index]).collect();
    let mut merger = Merger {
        entries,
        launchers,
        children,
        results,
        emitted: vec![false; entries.len()],
    };
    merger.scan(&top_level)
}

struct Merger<'a> {
    entries: &'a [NormalizedEntry],
    launchers: HashMap<&'a str, usize>,
    children: HashMap<&'a str, Vec<usize>>,
    results: HashMap<&'a str, usize>,
    emitted: Vec<bool>,
}

impl<'a> Merger<'a> {
    /// Render one ordered run of entry positions: the top level or a bucket.
    fn scan(&mut self, sequence: &[usize]) -> Vec<DisplayMessage> {
        let entries = self.entries;
        let mut merged = Vec::new();
        for (position, &index) in sequence.iter().enumerate() {
            if self.emitted[index] {
                continue;
            }
            self.emitted[index] = true;
            let entry = &entries[index];
            let owned_launch = entry
                .tool_id
                .as_deref()
                .filter(|tool_id| self.launchers.get(tool_id) == Some(&index));
            let rest = &sequence[position + 1..];

            match (entry.entry_type, entry.tool_kind, owned_launch) {
                (EntryType::ToolUse, Some(ToolKind::Skill), Some(tool_id))
                    if self.results.contains_key(tool_id) =>
                {
                    let prompt = rest
                        .iter()
                        .copied()
                        .find(|next| !self.emitted[*next])
                        .filter(|next| is_synthetic_prompt(&entries[*next]))
                        .map(|next| {
                            self.emitted[next] = true;
                            entries[next].clone()
                        });
                    let children = self.group_children(tool_id);
                    merged.push(DisplayMessage::SkillGroup {
                        tool_use: entry.clone(),
                        result: self.result_of(tool_id),
                        prompt,
                        children,
                    });
                }
                (EntryType::ToolUse, Some(ToolKind::Skill), Some(tool_id)) => {
                    // Until the skill has a result it renders flat.
                    merged.push(DisplayMessage::Entry {
                        entry: entry.clone(),
                    });
                    let children = self.group_children(tool_id);
                    merged.extend(children);
                }
                (EntryType::ToolUse, Some(ToolKind::SubAgent), Some(tool_id)) => {
                    let children = self.group_children(tool_id);
                    merged.push(DisplayMessage::SubAgentGroup {
                        tool_use: entry.clone(),
                        result: self.result_of(tool_id),
                        children,
                    });
                }
                (EntryType::CompactionStart, _, _) => {
                    let end = rest
                        .iter()
                        .copied()
                        .find(|later| {
                            !self.emitted[*later]
                                && entries[*later].entry_type == EntryType::CompactionEnd
                        })
                        .map(|later| {
                            self.emitted[later] = true;
                            entries[later].clone()
                        });
                    merged.push(DisplayMessage::CompactionSpan {
                        start: entry.clone(),
                        end,
                    });
                }
                // An end marker reached here had no open start before it.
                (EntryType::CompactionEnd, _, _) => {}
                _ => merged.push(DisplayMessage::Entry {
                    entry: entry.clone(),
                }),
            }
        }
        merged
    }

    fn group_children(&mut self, tool_id: &str) -> Vec<DisplayMessage> {
        let bucket = self.children.get(tool_id).cloned().unwrap_or_default();
        self.scan(&bucket)
    }

    fn result_of(&self, tool_id: &str) -> Option<NormalizedEntry> {
        self.results.get(tool_id).map(|index| self.entries[*index].clone())
    }
}
