//! Normalizer for the streaming-subscription runtime's event feed.
//!
//! Feed events are `{ "type": ..., "properties": {...} }`. Messages arrive as
//! an envelope (`message.updated`) plus independently updated parts
//! (`message.part.updated`), so this normalizer leans on the context: the
//! envelope supplies role/model/cost for parts that arrive later, and an
//! envelope that arrives after its parts re-emits them with the right role.

use super::{
    digest_key, str_field, tool_state_key, u64_field, NormalizeContext, NormalizedEvent,
    Normalizer, RawInput,
};
use crate::types::{
    BackendKind, CompactionPhase, CompletionOutcome, EntryRetraction, EntryType,
    NormalizedEntry, NormalizedMessage, Part, RateLimitInfo, Role, ToolKind, ToolState, Usage,
};
use serde_json::Value;

/// Stateless normalizer for the streaming runtime.
#[derive(Debug, Clone, Copy, Default)]
pub struct OpencodeNormalizer;

fn properties(raw: &Value) -> &Value {
    raw.get("properties").unwrap_or(&Value::Null)
}

impl Normalizer for OpencodeNormalizer {
    fn backend(&self) -> BackendKind {
        BackendKind::Opencode
    }

    fn absorb(&self, raw: &Value, ctx: &mut NormalizeContext) {
        let props = properties(raw);
        match str_field(raw, "type") {
            Some("message.updated") => {
                let Some(info) = props.get("info") else {
                    return;
                };
                let Some(message_id) = str_field(info, "id") else {
                    return;
                };
                if let Some(cost) = info.get("cost").and_then(Value::as_f64) {
                    ctx.set_message_cost(message_id, cost);
                }
                ctx.upsert_message(message_id, info.clone());
            }
            Some("message.part.updated") => {
                let Some(part) = props.get("part") else {
                    return;
                };
                if let (Some(message_id), Some(part_id)) =
                    (str_field(part, "messageID"), str_field(part, "id"))
                {
                    ctx.upsert_part(message_id, part_id, part.clone());
                }
            }
            Some("message.removed") => {
                if let Some(message_id) = str_field(props, "messageID") {
                    ctx.remove_message(message_id);
                }
            }
            Some("message.part.removed") => {
                if let (Some(message_id), Some(part_id)) =
                    (str_field(props, "messageID"), str_field(props, "partID"))
                {
                    ctx.remove_part(message_id, part_id);
                }
            }
            Some("session.compacted") => ctx.compactions_closed += 1,
            _ => {}
        }
    }

    fn normalize(&self, raw: RawInput<'_>, ctx: &NormalizeContext) -> Vec<NormalizedEvent> {
        let payload = raw.payload;
        let props = properties(payload);
        match str_field(payload, "type") {
            Some("message.updated") => {
                let Some(message_id) = props.get("info").and_then(|info| str_field(info, "id"))
                else {
                    return Vec::new();
                };
                ctx.parts(message_id)
                    .iter()
                    .flat_map(|(_, part)| part_events(raw, part, ctx))
                    .collect()
            }
            Some("message.part.updated") => {
                let Some(part) = props.get("part") else {
                    return vec![unknown_entry(raw, "message.part.updated")];
                };
                // Prefer the accumulated copy so re-emission sees the latest state.
                let current = match (str_field(part, "messageID"), str_field(part, "id")) {
                    (Some(message_id), Some(part_id)) => {
                        ctx.part(message_id, part_id).unwrap_or(part)
                    }
                    _ => part,
                };
                part_events(raw, current, ctx)
            }
            Some("message.removed") => match str_field(props, "messageID") {
                Some(message_id) => vec![NormalizedEvent::Removed(EntryRetraction {
                    message_id: message_id.to_string(),
                    part_id: None,
                })],
                None => Vec::new(),
            },
            Some("message.part.removed") => {
                match (str_field(props, "messageID"), str_field(props, "partID")) {
                    (Some(message_id), Some(part_id)) => {
                        vec![NormalizedEvent::Removed(EntryRetraction {
                            message_id: message_id.to_string(),
                            part_id: Some(part_id.to_string()),
                        })]
                    }
                    _ => Vec::new(),
                }
            }
            Some("session.status") => {
                let status = props.get("status").unwrap_or(&Value::Null);
                if str_field(status, "type") == Some("retry") {
                    vec![NormalizedEvent::RateLimit(RateLimitInfo {
                        status: Some("retry".to_string()),
                        resets_at_ms: u64_field(status, "next"),
                        message: str_field(status, "message").map(str::to_string),
                    })]
                } else {
                    Vec::new()
                }
            }
            Some("session.idle") => Vec::new(),
            Some("session.error") => {
                vec![NormalizedEvent::Error(error_message(props.get("error")))]
            }
            Some("session.compacted") => {
                let session_id = str_field(props, "sessionID").unwrap_or("session");
                let id = format!("compaction:{session_id}:{}", ctx.compactions_closed);
                let message = NormalizedMessage::new(
                    id.clone(),
                    Role::System,
                    vec![Part::Compaction {
                        phase: CompactionPhase::End,
                        trigger: None,
                        pre_tokens: None,
                    }],
                    raw.received_at_ms,
                );
                vec![NormalizedEvent::Entry(NormalizedEntry {
                    id,
                    entry_type: EntryType::CompactionEnd,
                    tool_id: None,
                    tool_kind: None,
                    message,
                })]
            }
            Some("prompt.result") => vec![NormalizedEvent::Completion(completion(props, ctx))],
            other => vec![unknown_entry(raw, other.unwrap_or("missing"))],
        }
    }
}

fn unknown_entry(raw: RawInput<'_>, original_type: &str) -> NormalizedEvent {
    let id = format!("{}:unknown", digest_key(raw.payload));
    NormalizedEvent::Entry(NormalizedEntry {
        message: NormalizedMessage::new(
            id.clone(),
            Role::System,
            vec![Part::Unknown {
                original_type: original_type.to_string(),
                raw: raw.payload.clone(),
            }],
            raw.received_at_ms,
        ),
        id,
        entry_type: EntryType::Unknown,
        tool_id: None,
        tool_kind: None,
    })
}

fn error_message(error: Option<&Value>) -> String {
    let Some(error) = error else {
        return "session error".to_string();
    };
    error
        .get("data")
        .and_then(|data| str_field(data, "message"))
        .or_else(|| str_field(error, "message"))
        .or_else(|| str_field(error, "name"))
        .or_else(|| error.as_str())
        .unwrap_or("session error")
        .to_string()
}

fn parse_tokens(tokens: &Value) -> Usage {
    let cache = tokens.get("cache").unwrap_or(&Value::Null);
    Usage {
        input_tokens: u64_field(tokens, "input").unwrap_or(0),
        output_tokens: u64_field(tokens, "output").unwrap_or(0),
        reasoning_tokens: u64_field(tokens, "reasoning").unwrap_or(0),
        cache_read_tokens: u64_field(cache, "read").unwrap_or(0),
        cache_write_tokens: u64_field(cache, "write").unwrap_or(0),
    }
}

/// Build the normalized message shell for a part, using its envelope if known.
fn message_for_part(
    raw: RawInput<'_>,
    id: &str,
    part: &Value,
    info: Option<&Value>,
    parts: Vec<Part>,
) -> NormalizedMessage {
    let role = match info.and_then(|info| str_field(info, "role")) {
        Some("user") => Role::User,
        _ => Role::Assistant,
    };
    let timestamp_ms = part
        .get("time")
        .and_then(|time| u64_field(time, "start"))
        .or_else(|| {
            info.and_then(|info| info.get("time"))
                .and_then(|time| u64_field(time, "created"))
        })
        .unwrap_or(raw.received_at_ms);
    let mut message = NormalizedMessage::new(id, role, parts, timestamp_ms);
    message.model = info
        .and_then(|info| str_field(info, "modelID"))
        .map(str::to_string);
    message.is_synthetic = part
        .get("synthetic")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    if let Some(session_id) = part.get("sessionID") {
        message
            .metadata
            .insert("session_id".to_string(), session_id.clone());
    }
    if let Some(kind) = part.get("type") {
        message.metadata.insert("part_type".to_string(), kind.clone());
    }
    message
}

fn part_events(raw: RawInput<'_>, part: &Value, ctx: &NormalizeContext) -> Vec<NormalizedEvent> {
    let (Some(message_id), Some(part_id)) = (str_field(part, "messageID"), str_field(part, "id"))
    else {
        return vec![unknown_entry(raw, "part")];
    };
    let info = ctx.message(message_id);
    let role_type = match info.and_then(|info| str_field(info, "role")) {
        Some("user") => EntryType::UserMessage,
        _ => EntryType::AssistantMessage,
    };
    let id = format!("{message_id}:{part_id}");
    let part_type = str_field(part, "type").unwrap_or("missing");

    let simple = |entry_type: EntryType, parts: Vec<Part>| {
        vec![NormalizedEvent::Entry(NormalizedEntry {
            message: message_for_part(raw, &id, part, info, parts),
            id: id.clone(),
            entry_type,
            tool_id: None,
            tool_kind: None,
        })]
    };

    match part_type {
        "text" => {
            let text = str_field(part, "text").unwrap_or_default();
            if text.is_empty() {
                return Vec::new();
            }
            simple(
                role_type,
                vec![Part::Text {
                    text: text.to_string(),
                }],
            )
        }
        "reasoning" => simple(
            EntryType::Reasoning,
            vec![Part::Reasoning {
                text: str_field(part, "text").unwrap_or_default().to_string(),
            }],
        ),
        "file" => simple(
            role_type,
            vec![Part::File {
                filename: str_field(part, "filename").map(str::to_string),
                mime: str_field(part, "mime").map(str::to_string),
                url: str_field(part, "url").map(str::to_string),
            }],
        ),
        "compaction" => simple(
            EntryType::CompactionStart,
            vec![Part::Compaction {
                phase: CompactionPhase::Start,
                trigger: part
                    .get("auto")
                    .and_then(Value::as_bool)
                    .map(|auto| if auto { "auto" } else { "manual" }.to_string()),
                pre_tokens: None,
            }],
        ),
        "tool" => tool_events(raw, &id, part, info, ctx),
        "patch" | "agent" | "retry" => simple(
            EntryType::SystemStatus,
            vec![Part::SystemStatus {
                status: part_type.to_string(),
                detail: str_field(part, "name")
                    .or_else(|| str_field(part, "hash"))
                    .map(str::to_string),
            }],
        ),
        // Step boundaries and snapshots only carry accounting the envelope repeats.
        "step-start" | "step-finish" | "snapshot" => Vec::new(),
        other => simple(
            EntryType::Unknown,
            vec![Part::Unknown {
                original_type: other.to_string(),
                raw: part.clone(),
            }],
        ),
    }
}

fn tool_events(
    raw: RawInput<'_>,
    id: &str,
    part: &Value,
    info: Option<&Value>,
    ctx: &NormalizeContext,
) -> Vec<NormalizedEvent> {
    let tool_id = str_field(part, "callID")
        .or_else(|| str_field(part, "id"))
        .unwrap_or_default()
        .to_string();
    let name = str_field(part, "tool").unwrap_or_default().to_string();
    let state = part.get("state").unwrap_or(&Value::Null);
    let status = str_field(state, "status")
        .and_then(ToolState::parse)
        .unwrap_or(ToolState::Pending);
    let parent_tool_id = str_field(part, "parentToolID").map(str::to_string);

    let mut events = Vec::new();
    if !ctx.has_emitted(&tool_state_key(&tool_id, status)) {
        events.push(NormalizedEvent::ToolState {
            tool_id: tool_id.clone(),
            state: status,
        });
    }

    let mut use_message = message_for_part(
        raw,
        id,
        part,
        info,
        vec![Part::ToolUse {
            tool_id: tool_id.clone(),
            name: name.clone(),
            input: state.get("input").cloned().unwrap_or(Value::Null),
        }],
    );
    use_message.role = Role::Assistant;
    use_message.parent_tool_id = parent_tool_id.clone();
    if let Some(title) = state.get("title") {
        use_message.metadata.insert("title".to_string(), title.clone());
    }
    events.push(NormalizedEvent::Entry(NormalizedEntry {
        id: id.to_string(),
        entry_type: EntryType::ToolUse,
        tool_id: Some(tool_id.clone()),
        tool_kind: Some(ToolKind::classify(&name)),
        message: use_message,
    }));

    let result = match status {
        ToolState::Completed => Some((
            str_field(state, "output").unwrap_or_default().to_string(),
            false,
        )),
        ToolState::Error => Some((
            str_field(state, "error").unwrap_or_default().to_string(),
            true,
        )),
        ToolState::Pending | ToolState::Running => None,
    };
    if let Some((content, is_error)) = result {
        let result_id = format!("{id}:result");
        let mut result_message = message_for_part(
            raw,
            &result_id,
            part,
            info,
            vec![Part::ToolResult {
                tool_id: tool_id.clone(),
                content,
                is_error,
                structured: state.get("metadata").cloned(),
            }],
        );
        result_message.role = Role::User;
        result_message.parent_tool_id = parent_tool_id;
        if let Some(end) = state.get("time").and_then(|time| u64_field(time, "end")) {
            result_message.timestamp_ms = end;
        }
        events.push(NormalizedEvent::Entry(NormalizedEntry {
            id: result_id,
            entry_type: EntryType::ToolResult,
            tool_id: Some(tool_id),
            tool_kind: None,
            message: result_message,
        }));
    }
    events
}

fn completion(props: &Value, ctx: &NormalizeContext) -> CompletionOutcome {
    let info = props.get("info").unwrap_or(&Value::Null);
    let prompt_error = props.get("error").filter(|error| !error.is_null());
    let info_error = info.get("error").filter(|error| !error.is_null());
    let error = prompt_error.or(info_error);
    let time = info.get("time").unwrap_or(&Value::Null);
    let duration_ms = match (u64_field(time, "created"), u64_field(time, "completed")) {
        (Some(created), Some(completed)) => Some(completed.saturating_sub(created)),
        _ => None,
    };
    CompletionOutcome {
        is_error: error.is_some(),
        message: error.map(|error| error_message(Some(error))),
        cost_usd: info.get("cost").and_then(Value::as_f64),
        total_cost_usd: Some(ctx.total_cost_usd),
        duration_ms,
        usage: info.get("tokens").map(parse_tokens),
        num_turns: None,
    }
}
