//! Runtime-agnostic data model shared by every layer.
//!
//! Raw runtime payloads stay untyped (`serde_json::Value`) at the persistence
//! boundary; everything the normalizer recognizes lands in one of the concrete
//! types below, and everything it does not recognize lands in
//! [`Part::Unknown`] with the original payload attached.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// Stable identifier of a task owned by the external data layer.
pub type TaskId = String;

// ---------------------------------------------------------------------------
// Backend identity and session settings
// ---------------------------------------------------------------------------

/// Supported external agent runtimes.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "kebab-case")]
pub enum BackendKind {
    /// Runtime that blocks on a capability callback per tool use.
    #[default]
    ClaudeCode,
    /// Runtime hosted by a shared server and observed through an event feed.
    Opencode,
}

impl BackendKind {
    pub const ALL: [BackendKind; 2] = [BackendKind::ClaudeCode, BackendKind::Opencode];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::ClaudeCode => "claude-code",
            Self::Opencode => "opencode",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str().eq_ignore_ascii_case(value.trim()))
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How much autonomy the runtime gets for tool use.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub enum InteractionMode {
    #[default]
    Default,
    AcceptEdits,
    Plan,
    BypassPermissions,
}

impl InteractionMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Default => "default",
            Self::AcceptEdits => "acceptEdits",
            Self::Plan => "plan",
            Self::BypassPermissions => "bypassPermissions",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim() {
            "default" => Some(Self::Default),
            "acceptEdits" | "accept-edits" => Some(Self::AcceptEdits),
            "plan" => Some(Self::Plan),
            "bypassPermissions" | "bypass-permissions" => Some(Self::BypassPermissions),
            _ => None,
        }
    }
}

/// Lifecycle status of a task's session.
///
/// `Created` and `Running` are live; the other three are terminal.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Created,
    Running,
    Idle,
    Errored,
    Interrupted,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Idle | Self::Errored | Self::Interrupted)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Idle => "idle",
            Self::Errored => "errored",
            Self::Interrupted => "interrupted",
        }
    }
}

// ---------------------------------------------------------------------------
// Normalized message model
// ---------------------------------------------------------------------------

/// Author role of a normalized message.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
    Result,
}

/// Token accounting reported by a runtime.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Usage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub reasoning_tokens: u64,
    #[serde(default)]
    pub cache_read_tokens: u64,
    #[serde(default)]
    pub cache_write_tokens: u64,
}

impl Usage {
    pub fn total(&self) -> u64 {
        self.input_tokens
            .saturating_add(self.output_tokens)
            .saturating_add(self.reasoning_tokens)
    }
}

/// Which side of a compaction span a marker closes or opens.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CompactionPhase {
    Start,
    End,
}

/// One unit of content inside a normalized message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Part {
    Text {
        text: String,
    },
    Reasoning {
        text: String,
    },
    File {
        #[serde(skip_serializing_if = "Option::is_none")]
        filename: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        mime: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        url: Option<String>,
    },
    ToolUse {
        tool_id: String,
        name: String,
        input: Value,
    },
    ToolResult {
        tool_id: String,
        content: String,
        is_error: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        structured: Option<Value>,
    },
    Compaction {
        phase: CompactionPhase,
        #[serde(skip_serializing_if = "Option::is_none")]
        trigger: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        pre_tokens: Option<u64>,
    },
    SystemStatus {
        status: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        detail: Option<String>,
    },
    /// Shape the normalizer does not understand, preserved verbatim.
    Unknown {
        original_type: String,
        raw: Value,
    },
}

/// A runtime-agnostic message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NormalizedMessage {
    pub id: String,
    pub role: Role,
    pub parts: Vec<Part>,
    pub timestamp_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cost_usd: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_tool_id: Option<String>,
    #[serde(default)]
    pub is_synthetic: bool,
    /// Raw fields kept for debugging; never interpreted downstream.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, Value>,
}

impl NormalizedMessage {
    pub fn new(id: impl Into<String>, role: Role, parts: Vec<Part>, timestamp_ms: u64) -> Self {
        Self {
            id: id.into(),
            role,
            parts,
            timestamp_ms,
            cost_usd: None,
            usage: None,
            model: None,
            parent_tool_id: None,
            is_synthetic: false,
            metadata: BTreeMap::new(),
        }
    }
}

/// Classification of a normalized entry, used for storage and grouping.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EntryType {
    UserMessage,
    AssistantMessage,
    Reasoning,
    ToolUse,
    ToolResult,
    CompactionStart,
    CompactionEnd,
    SystemStatus,
    Result,
    Unknown,
}

/// Grouping role of a tool, derived from its name.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ToolKind {
    Regular,
    SubAgent,
    Skill,
}

impl ToolKind {
    /// Classify a tool by the names runtimes use for delegation and skills.
    pub fn classify(tool_name: &str) -> Self {
        match tool_name {
            "Task" | "Agent" | "task" | "agent" => Self::SubAgent,
            "Skill" | "skill" => Self::Skill,
            _ => Self::Regular,
        }
    }
}

/// The unit the orchestrator persists and emits: one message plus indexing keys.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NormalizedEntry {
    /// Deterministic id, `"{message_key}:{part_key}"` with optional suffixes.
    pub id: String,
    pub entry_type: EntryType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_kind: Option<ToolKind>,
    pub message: NormalizedMessage,
}

impl NormalizedEntry {
    pub fn parent_tool_id(&self) -> Option<&str> {
        self.message.parent_tool_id.as_deref()
    }

    pub fn is_synthetic(&self) -> bool {
        self.message.is_synthetic
    }

    pub fn model(&self) -> Option<&str> {
        self.message.model.as_deref()
    }
}

/// Identifies the entries derived from a removed message (or one of its parts).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EntryRetraction {
    pub message_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub part_id: Option<String>,
}

impl EntryRetraction {
    fn prefix(&self) -> String {
        match &self.part_id {
            Some(part_id) => format!("{}:{part_id}", self.message_id),
            None => self.message_id.clone(),
        }
    }

    /// True when `entry_id` was derived from the retracted message/part.
    pub fn covers(&self, entry_id: &str) -> bool {
        let prefix = self.prefix();
        entry_id == prefix
            || entry_id
                .strip_prefix(prefix.as_str())
                .is_some_and(|rest| rest.starts_with(':'))
    }
}

// ---------------------------------------------------------------------------
// Session-level outcomes
// ---------------------------------------------------------------------------

/// Lifecycle of one tool invocation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ToolState {
    Pending,
    Running,
    Completed,
    Error,
}

impl ToolState {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "error" => Some(Self::Error),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Error => "error",
        }
    }
}

/// Result of one prompt turn. Failures use the same shape with `is_error` set.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CompletionOutcome {
    pub is_error: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cost_usd: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_cost_usd: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub num_turns: Option<u32>,
}

/// Rate-limit signal surfaced by a runtime.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RateLimitInfo {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    /// Absolute unix time in milliseconds when the limit is expected to clear.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resets_at_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn retraction_covers_message_and_derived_suffixes() {
        let r = EntryRetraction {
            message_id: "msg_1".into(),
            part_id: None,
        };
        assert!(r.covers("msg_1"));
        assert!(r.covers("msg_1:prt_a"));
        assert!(r.covers("msg_1:prt_a:result"));
        assert!(!r.covers("msg_10:prt_a"));
        assert!(!r.covers("msg_2:prt_a"));
    }

    #[test]
    fn part_retraction_leaves_sibling_parts() {
        let r = EntryRetraction {
            message_id: "msg_1".into(),
            part_id: Some("prt_a".into()),
        };
        assert!(r.covers("msg_1:prt_a"));
        assert!(r.covers("msg_1:prt_a:result"));
        assert!(!r.covers("msg_1:prt_ab"));
        assert!(!r.covers("msg_1:prt_b"));
    }

    #[test]
    fn tool_kind_classifies_delegation_and_skills() {
        assert_eq!(ToolKind::classify("Task"), ToolKind::SubAgent);
        assert_eq!(ToolKind::classify("task"), ToolKind::SubAgent);
        assert_eq!(ToolKind::classify("Skill"), ToolKind::Skill);
        assert_eq!(ToolKind::classify("Bash"), ToolKind::Regular);
    }

    #[test]
    fn unknown_part_serializes_with_original_payload() {
        let part = Part::Unknown {
            original_type: "hologram".into(),
            raw: json!({"type": "hologram", "x": 1}),
        };
        let value = serde_json::to_value(&part).expect("serialize");
        assert_eq!(value["type"], json!("unknown"));
        assert_eq!(value["original_type"], json!("hologram"));
        assert_eq!(value["raw"]["x"], json!(1));
    }

    #[test]
    fn backend_kind_parses_case_insensitively() {
        assert_eq!(BackendKind::parse("OpenCode"), Some(BackendKind::Opencode));
        assert_eq!(
            BackendKind::parse(" claude-code "),
            Some(BackendKind::ClaudeCode)
        );
        assert_eq!(BackendKind::parse("codex"), None);
    }

    #[test]
    fn terminal_statuses() {
        assert!(!TaskStatus::Created.is_terminal());
        assert!(!TaskStatus::Running.is_terminal());
        assert!(TaskStatus::Idle.is_terminal());
        assert!(TaskStatus::Errored.is_terminal());
        assert!(TaskStatus::Interrupted.is_terminal());
    }
}
