//! Raw runtime event → normalized entry conversion.
//!
//! A normalizer is a pure transform over `(raw unit, accumulated context)`.
//! The caller drives three steps per raw unit (see [`normalize_raw`]):
//!
//! 1. [`Normalizer::absorb`] folds the raw delta into the session context,
//! 2. [`Normalizer::normalize`] derives events from the raw unit + context,
//! 3. the emitted keys are recorded so replays stay idempotent.
//!
//! Entry ids are derived from stable runtime keys (message id + part id, or a
//! content digest when the runtime provides none) so removal events can
//! retract exactly the entries they produced.

use crate::types::{
    BackendKind, CompletionOutcome, EntryRetraction, InteractionMode, NormalizedEntry,
    RateLimitInfo, ToolState,
};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};

pub mod claude;
pub mod opencode;

pub use claude::ClaudeNormalizer;
pub use opencode::OpencodeNormalizer;

/// Version stamp written on every persisted normalized entry.
///
/// Raising it marks previously persisted entries stale; they are re-derived
/// from the immutable raw records by [`crate::replay::renormalize_task`].
pub const NORMALIZATION_VERSION: u32 = 1;

/// One raw unit plus the time it was received (used when the payload has no timestamp).
#[derive(Debug, Clone, Copy)]
pub struct RawInput<'a> {
    pub payload: &'a Value,
    pub received_at_ms: u64,
}

/// Output of a normalizer for one raw unit.
#[derive(Debug, Clone, PartialEq)]
pub enum NormalizedEvent {
    SessionId(String),
    Entry(NormalizedEntry),
    Removed(EntryRetraction),
    ToolState { tool_id: String, state: ToolState },
    ModeChanged(InteractionMode),
    Completion(CompletionOutcome),
    Error(String),
    RateLimit(RateLimitInfo),
}

impl NormalizedEvent {
    /// Key recorded in the context after emission, if this event is emit-once.
    fn emitted_key(&self) -> Option<String> {
        match self {
            Self::SessionId(id) => Some(session_key(id)),
            Self::Entry(entry) => Some(entry.id.clone()),
            Self::ToolState { tool_id, state } => Some(tool_state_key(tool_id, *state)),
            _ => None,
        }
    }
}

pub(crate) fn session_key(session_id: &str) -> String {
    format!("session:{session_id}")
}

pub(crate) fn tool_state_key(tool_id: &str, state: ToolState) -> String {
    format!("tool-state:{tool_id}:{}", state.as_str())
}

/// Per-session state accumulated from raw deltas.
///
/// Normalizers only read it; [`Normalizer::absorb`] is the single writer.
#[derive(Debug, Clone, Default)]
pub struct NormalizeContext {
    /// Latest message envelope per runtime message id.
    messages: BTreeMap<String, Value>,
    /// Parts per message id, in first-seen order.
    parts: BTreeMap<String, Vec<(String, Value)>>,
    /// Cost per message id, summed into `total_cost_usd`.
    message_costs: BTreeMap<String, f64>,
    /// Running total across every session of the task.
    pub total_cost_usd: f64,
    /// Compaction spans closed so far, used to key end markers.
    pub compactions_closed: u64,
    emitted: BTreeSet<String>,
}

impl NormalizeContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn message(&self, message_id: &str) -> Option<&Value> {
        self.messages.get(message_id)
    }

    pub fn parts(&self, message_id: &str) -> &[(String, Value)] {
        self.parts.get(message_id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn part(&self, message_id: &str, part_id: &str) -> Option<&Value> {
        self.parts(message_id)
            .iter()
            .find(|(id, _)| id == part_id)
            .map(|(_, part)| part)
    }

    pub fn has_emitted(&self, key: &str) -> bool {
        self.emitted.contains(key)
    }

    pub(crate) fn upsert_message(&mut self, message_id: &str, info: Value) {
        self.messages.insert(message_id.to_string(), info);
    }

    pub(crate) fn upsert_part(&mut self, message_id: &str, part_id: &str, part: Value) {
        let parts = self.parts.entry(message_id.to_string()).or_default();
        match parts.iter_mut().find(|(id, _)| id == part_id) {
            Some((_, existing)) => *existing = part,
            None => parts.push((part_id.to_string(), part)),
        }
    }

    pub(crate) fn remove_message(&mut self, message_id: &str) {
        self.messages.remove(message_id);
        self.parts.remove(message_id);
        if let Some(cost) = self.message_costs.remove(message_id) {
            self.total_cost_usd -= cost;
        }
    }

    pub(crate) fn remove_part(&mut self, message_id: &str, part_id: &str) {
        if let Some(parts) = self.parts.get_mut(message_id) {
            parts.retain(|(id, _)| id != part_id);
        }
    }

    /// Set the cost of one message, keeping the running total consistent.
    pub(crate) fn set_message_cost(&mut self, message_id: &str, cost: f64) {
        let previous = self
            .message_costs
            .insert(message_id.to_string(), cost)
            .unwrap_or(0.0);
        self.total_cost_usd += cost - previous;
    }

    pub(crate) fn add_cost(&mut self, cost: f64) {
        self.total_cost_usd += cost;
    }

    fn record_emitted(&mut self, events: &[NormalizedEvent]) {
        for key in events.iter().filter_map(NormalizedEvent::emitted_key) {
            self.emitted.insert(key);
        }
    }
}

/// Contract every runtime-specific normalizer satisfies.
pub trait Normalizer: Send + Sync {
    fn backend(&self) -> BackendKind;

    /// Fold a raw unit into the context before normalization.
    fn absorb(&self, raw: &Value, ctx: &mut NormalizeContext);

    /// Derive zero or more events from one raw unit.
    fn normalize(&self, raw: RawInput<'_>, ctx: &NormalizeContext) -> Vec<NormalizedEvent>;
}

static CLAUDE_NORMALIZER: ClaudeNormalizer = ClaudeNormalizer;
static OPENCODE_NORMALIZER: OpencodeNormalizer = OpencodeNormalizer;

/// Look up the normalizer for a backend.
pub fn normalizer_for(kind: BackendKind) -> &'static dyn Normalizer {
    match kind {
        BackendKind::ClaudeCode => &CLAUDE_NORMALIZER,
        BackendKind::Opencode => &OPENCODE_NORMALIZER,
    }
}

/// Absorb, normalize, then record emitted keys for one raw unit.
pub fn normalize_raw(
    normalizer: &dyn Normalizer,
    raw: RawInput<'_>,
    ctx: &mut NormalizeContext,
) -> Vec<NormalizedEvent> {
    normalizer.absorb(raw.payload, ctx);
    let events = normalizer.normalize(raw, ctx);
    ctx.record_emitted(&events);
    events
}

// ---------------------------------------------------------------------------
// Shared JSON helpers
// ---------------------------------------------------------------------------

pub(crate) fn str_field<'a>(value: &'a Value, key: &str) -> Option<&'a str> {
    value.get(key).and_then(Value::as_str)
}

pub(crate) fn u64_field(value: &Value, key: &str) -> Option<u64> {
    value.get(key).and_then(Value::as_u64)
}

/// Short content digest used as an id when a runtime supplies no stable key.
pub(crate) fn digest_key(value: &Value) -> String {
    let bytes = serde_json::to_vec(value).unwrap_or_default();
    let digest = Sha256::digest(&bytes);
    let hex: String = digest.iter().take(8).map(|b| format!("{b:02x}")).collect();
    format!("h{hex}")
}

/// Flatten a runtime content value (string or block array) into display text.
pub(crate) fn flatten_text(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        Value::Array(items) => items
            .iter()
            .filter_map(|item| match item {
                Value::String(text) => Some(text.clone()),
                Value::Object(_) => str_field(item, "text").map(str::to_string),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n"),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}
