//! Normalizer for the blocking-callback runtime's message stream.
//!
//! Every raw unit is one complete message keyed by `type`:
//! `system` (subtypes `init`, `status`, `compact_boundary`, ...), `assistant`,
//! `user`, `result`, `rate_limit_event`. Partial `stream_event` frames carry
//! nothing the complete messages do not, so they produce no events.

use super::{
    digest_key, flatten_text, session_key, str_field, tool_state_key, u64_field,
    NormalizeContext, NormalizedEvent, Normalizer, RawInput,
};
use crate::types::{
    BackendKind, CompactionPhase, CompletionOutcome, EntryType, InteractionMode,
    NormalizedEntry, NormalizedMessage, Part, RateLimitInfo, Role, ToolKind, ToolState, Usage,
};
use serde_json::Value;

/// Stateless normalizer for the callback runtime.
#[derive(Debug, Clone, Copy, Default)]
pub struct ClaudeNormalizer;

impl Normalizer for ClaudeNormalizer {
    fn backend(&self) -> BackendKind {
        BackendKind::ClaudeCode
    }

    fn absorb(&self, raw: &Value, ctx: &mut NormalizeContext) {
        match str_field(raw, "type") {
            Some("result") => {
                if let Some(cost) = raw.get("total_cost_usd").and_then(Value::as_f64) {
                    ctx.add_cost(cost);
                }
            }
            Some("system") if str_field(raw, "subtype") == Some("compact_boundary") => {
                ctx.compactions_closed += 1;
            }
            _ => {}
        }
    }

    fn normalize(&self, raw: RawInput<'_>, ctx: &NormalizeContext) -> Vec<NormalizedEvent> {
        let payload = raw.payload;
        match str_field(payload, "type") {
            Some("system") => normalize_system(raw, ctx),
            Some("assistant") => normalize_assistant(raw, ctx),
            Some("user") => normalize_user(raw, ctx),
            Some("result") => normalize_result(raw, ctx),
            Some("rate_limit_event") => vec![NormalizedEvent::RateLimit(rate_limit_info(payload))],
            Some("stream_event") => Vec::new(),
            other => {
                let original_type = other.unwrap_or("missing").to_string();
                vec![unknown_entry(raw, &message_key(payload), original_type)]
            }
        }
    }
}

/// Stable key for a raw message: runtime uuid, then message id, then digest.
fn message_key(payload: &Value) -> String {
    str_field(payload, "uuid")
        .or_else(|| payload.get("message").and_then(|m| str_field(m, "id")))
        .map(str::to_string)
        .unwrap_or_else(|| digest_key(payload))
}

fn timestamp_ms(raw: RawInput<'_>) -> u64 {
    u64_field(raw.payload, "timestamp_ms").unwrap_or(raw.received_at_ms)
}

fn base_message(raw: RawInput<'_>, id: String, role: Role, parts: Vec<Part>) -> NormalizedMessage {
    let payload = raw.payload;
    let mut message = NormalizedMessage::new(id, role, parts, timestamp_ms(raw));
    message.parent_tool_id = str_field(payload, "parent_tool_use_id").map(str::to_string);
    message.is_synthetic = payload
        .get("isSynthetic")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    if let Some(session_id) = payload.get("session_id") {
        message
            .metadata
            .insert("session_id".to_string(), session_id.clone());
    }
    if let Some(kind) = payload.get("type") {
        message.metadata.insert("raw_type".to_string(), kind.clone());
    }
    message
}

fn entry(
    raw: RawInput<'_>,
    id: String,
    entry_type: EntryType,
    role: Role,
    parts: Vec<Part>,
) -> NormalizedEntry {
    NormalizedEntry {
        message: base_message(raw, id.clone(), role, parts),
        id,
        entry_type,
        tool_id: None,
        tool_kind: None,
    }
}

fn unknown_entry(raw: RawInput<'_>, key: &str, original_type: String) -> NormalizedEvent {
    NormalizedEvent::Entry(entry(
        raw,
        format!("{key}:unknown"),
        EntryType::Unknown,
        Role::System,
        vec![Part::Unknown {
            original_type,
            raw: raw.payload.clone(),
        }],
    ))
}

fn normalize_system(raw: RawInput<'_>, ctx: &NormalizeContext) -> Vec<NormalizedEvent> {
    let payload = raw.payload;
    let key = message_key(payload);
    let subtype = str_field(payload, "subtype").unwrap_or("unknown");
    let mut events = Vec::new();
    match subtype {
        "init" => {
            if let Some(session_id) = str_field(payload, "session_id") {
                if !ctx.has_emitted(&session_key(session_id)) {
                    events.push(NormalizedEvent::SessionId(session_id.to_string()));
                }
            }
            if let Some(mode) = str_field(payload, "permissionMode").and_then(InteractionMode::parse)
            {
                events.push(NormalizedEvent::ModeChanged(mode));
            }
            let mut init = entry(
                raw,
                format!("{key}:init"),
                EntryType::SystemStatus,
                Role::System,
                vec![Part::SystemStatus {
                    status: "init".to_string(),
                    detail: str_field(payload, "cwd").map(str::to_string),
                }],
            );
            init.message.model = str_field(payload, "model").map(str::to_string);
            events.push(NormalizedEvent::Entry(init));
        }
        "status" => {
            let status = str_field(payload, "status");
            let (entry_type, part) = if status == Some("compacting") {
                (
                    EntryType::CompactionStart,
                    Part::Compaction {
                        phase: CompactionPhase::Start,
                        trigger: None,
                        pre_tokens: None,
                    },
                )
            } else {
                (
                    EntryType::SystemStatus,
                    Part::SystemStatus {
                        status: status.unwrap_or("idle").to_string(),
                        detail: None,
                    },
                )
            };
            events.push(NormalizedEvent::Entry(entry(
                raw,
                format!("{key}:status"),
                entry_type,
                Role::System,
                vec![part],
            )));
        }
        "compact_boundary" => {
            let meta = payload.get("compact_metadata");
            events.push(NormalizedEvent::Entry(entry(
                raw,
                format!("{key}:compaction-end:{}", ctx.compactions_closed),
                EntryType::CompactionEnd,
                Role::System,
                vec![Part::Compaction {
                    phase: CompactionPhase::End,
                    trigger: meta
                        .and_then(|m| str_field(m, "trigger"))
                        .map(str::to_string),
                    pre_tokens: meta.and_then(|m| u64_field(m, "pre_tokens")),
                }],
            )));
        }
        other => {
            events.push(NormalizedEvent::Entry(entry(
                raw,
                format!("{key}:{other}"),
                EntryType::SystemStatus,
                Role::System,
                vec![Part::SystemStatus {
                    status: other.to_string(),
                    detail: str_field(payload, "message").map(str::to_string),
                }],
            )));
        }
    }
    events
}

fn content_blocks(payload: &Value) -> Option<&Value> {
    payload.get("message").and_then(|m| m.get("content"))
}

fn normalize_assistant(raw: RawInput<'_>, ctx: &NormalizeContext) -> Vec<NormalizedEvent> {
    let payload = raw.payload;
    let key = message_key(payload);
    let message = payload.get("message");
    let model = message
        .and_then(|m| str_field(m, "model"))
        .map(str::to_string);
    let usage = message.and_then(|m| m.get("usage")).map(parse_usage);

    let mut events = Vec::new();
    let blocks = match content_blocks(payload) {
        Some(Value::Array(blocks)) => blocks.clone(),
        Some(Value::String(text)) => vec![serde_json::json!({"type": "text", "text": text})],
        _ => Vec::new(),
    };
    for (index, block) in blocks.iter().enumerate() {
        let id = format!("{key}:{index}");
        let block_type = str_field(block, "type").unwrap_or("missing");
        let mut normalized = match block_type {
            "text" => entry(
                raw,
                id,
                EntryType::AssistantMessage,
                Role::Assistant,
                vec![Part::Text {
                    text: str_field(block, "text").unwrap_or_default().to_string(),
                }],
            ),
            "thinking" | "redacted_thinking" => entry(
                raw,
                id,
                EntryType::Reasoning,
                Role::Assistant,
                vec![Part::Reasoning {
                    text: str_field(block, "thinking").unwrap_or_default().to_string(),
                }],
            ),
            "tool_use" | "server_tool_use" => {
                let tool_id = str_field(block, "id").unwrap_or_default().to_string();
                let name = str_field(block, "name").unwrap_or_default().to_string();
                let mut tool = entry(
                    raw,
                    id,
                    EntryType::ToolUse,
                    Role::Assistant,
                    vec![Part::ToolUse {
                        tool_id: tool_id.clone(),
                        name: name.clone(),
                        input: block.get("input").cloned().unwrap_or(Value::Null),
                    }],
                );
                tool.tool_kind = Some(ToolKind::classify(&name));
                tool.tool_id = Some(tool_id.clone());
                if !tool_id.is_empty() && !ctx.has_emitted(&tool_state_key(&tool_id, ToolState::Running))
                {
                    events.push(NormalizedEvent::ToolState {
                        tool_id,
                        state: ToolState::Running,
                    });
                }
                tool
            }
            other => entry(
                raw,
                id,
                EntryType::Unknown,
                Role::Assistant,
                vec![Part::Unknown {
                    original_type: other.to_string(),
                    raw: block.clone(),
                }],
            ),
        };
        normalized.message.model = model.clone();
        normalized.message.usage = usage.clone();
        events.push(NormalizedEvent::Entry(normalized));
    }
    if blocks.is_empty() {
        events.push(unknown_entry(raw, &key, "assistant".to_string()));
    }
    // Runtime-reported API errors arrive as assistant messages with an `error` tag.
    if let Some(error) = str_field(payload, "error") {
        if error == "rate_limit" {
            events.push(NormalizedEvent::RateLimit(RateLimitInfo {
                status: Some("rejected".to_string()),
                resets_at_ms: None,
                message: None,
            }));
        }
    }
    events
}

fn normalize_user(raw: RawInput<'_>, ctx: &NormalizeContext) -> Vec<NormalizedEvent> {
    let payload = raw.payload;
    let key = message_key(payload);
    let structured = payload.get("tool_use_result").cloned();
    let mut events = Vec::new();
    match content_blocks(payload) {
        Some(Value::String(text)) => {
            events.push(NormalizedEvent::Entry(entry(
                raw,
                format!("{key}:0"),
                EntryType::UserMessage,
                Role::User,
                vec![Part::Text { text: text.clone() }],
            )));
        }
        Some(Value::Array(blocks)) => {
            for (index, block) in blocks.iter().enumerate() {
                let id = format!("{key}:{index}");
                let block_type = str_field(block, "type").unwrap_or("missing");
                let normalized = match block_type {
                    "text" => entry(
                        raw,
                        id,
                        EntryType::UserMessage,
                        Role::User,
                        vec![Part::Text {
                            text: str_field(block, "text").unwrap_or_default().to_string(),
                        }],
                    ),
                    "image" | "document" => entry(
                        raw,
                        id,
                        EntryType::UserMessage,
                        Role::User,
                        vec![Part::File {
                            filename: block
                                .get("source")
                                .and_then(|s| str_field(s, "path"))
                                .map(str::to_string),
                            mime: block
                                .get("source")
                                .and_then(|s| str_field(s, "media_type"))
                                .map(str::to_string),
                            url: block
                                .get("source")
                                .and_then(|s| str_field(s, "url"))
                                .map(str::to_string),
                        }],
                    ),
                    "tool_result" => {
                        let tool_id = str_field(block, "tool_use_id")
                            .unwrap_or_default()
                            .to_string();
                        let is_error = block
                            .get("is_error")
                            .and_then(Value::as_bool)
                            .unwrap_or(false);
                        let state = if is_error {
                            ToolState::Error
                        } else {
                            ToolState::Completed
                        };
                        if !tool_id.is_empty() && !ctx.has_emitted(&tool_state_key(&tool_id, state)) {
                            events.push(NormalizedEvent::ToolState {
                                tool_id: tool_id.clone(),
                                state,
                            });
                        }
                        let mut result = entry(
                            raw,
                            id,
                            EntryType::ToolResult,
                            Role::User,
                            vec![Part::ToolResult {
                                tool_id: tool_id.clone(),
                                content: block.get("content").map(flatten_text).unwrap_or_default(),
                                is_error,
                                structured: structured.clone(),
                            }],
                        );
                        result.tool_id = Some(tool_id);
                        result
                    }
                    other => entry(
                        raw,
                        id,
                        EntryType::Unknown,
                        Role::User,
                        vec![Part::Unknown {
                            original_type: other.to_string(),
                            raw: block.clone(),
                        }],
                    ),
                };
                events.push(NormalizedEvent::Entry(normalized));
            }
        }
        _ => events.push(unknown_entry(raw, &key, "user".to_string())),
    }
    events
}

fn normalize_result(raw: RawInput<'_>, ctx: &NormalizeContext) -> Vec<NormalizedEvent> {
    let payload = raw.payload;
    let key = message_key(payload);
    let subtype = str_field(payload, "subtype").unwrap_or("success");
    let is_error = payload
        .get("is_error")
        .and_then(Value::as_bool)
        .unwrap_or(false)
        || subtype != "success";
    let text = str_field(payload, "result").map(str::to_string);
    let error_message = if is_error {
        let errors = payload
            .get("errors")
            .and_then(Value::as_array)
            .map(|errors| {
                errors
                    .iter()
                    .filter_map(Value::as_str)
                    .collect::<Vec<_>>()
                    .join("; ")
            })
            .filter(|joined| !joined.is_empty());
        errors.or_else(|| text.clone()).or_else(|| Some(subtype.to_string()))
    } else {
        None
    };
    let usage = payload.get("usage").map(parse_usage);
    let cost = payload.get("total_cost_usd").and_then(Value::as_f64);

    let mut result_entry = entry(
        raw,
        format!("{key}:result"),
        EntryType::Result,
        Role::Result,
        vec![Part::Text {
            text: text.clone().unwrap_or_default(),
        }],
    );
    result_entry.message.cost_usd = cost;
    result_entry.message.usage = usage.clone();
    result_entry
        .message
        .metadata
        .insert("subtype".to_string(), Value::String(subtype.to_string()));

    vec![
        NormalizedEvent::Entry(result_entry),
        NormalizedEvent::Completion(CompletionOutcome {
            is_error,
            message: error_message,
            cost_usd: cost,
            total_cost_usd: Some(ctx.total_cost_usd),
            duration_ms: u64_field(payload, "duration_ms"),
            usage,
            num_turns: u64_field(payload, "num_turns").and_then(|n| u32::try_from(n).ok()),
        }),
    ]
}

fn parse_usage(value: &Value) -> Usage {
    Usage {
        input_tokens: u64_field(value, "input_tokens").unwrap_or(0),
        output_tokens: u64_field(value, "output_tokens").unwrap_or(0),
        reasoning_tokens: 0,
        cache_read_tokens: u64_field(value, "cache_read_input_tokens").unwrap_or(0),
        cache_write_tokens: u64_field(value, "cache_creation_input_tokens").unwrap_or(0),
    }
}

fn rate_limit_info(payload: &Value) -> RateLimitInfo {
    let info = payload.get("rate_limit_info").unwrap_or(payload);
    RateLimitInfo {
        status: str_field(info, "status").map(str::to_string),
        // The runtime reports seconds since epoch.
        resets_at_ms: u64_field(info, "resetsAt").map(|secs| secs.saturating_mul(1000)),
        message: str_field(info, "message").map(str::to_string),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalize::normalize_raw;
    use serde_json::json;

    fn run(ctx: &mut NormalizeContext, payload: &Value) -> Vec<NormalizedEvent> {
        normalize_raw(
            &ClaudeNormalizer,
            RawInput {
                payload,
                received_at_ms: 1_000,
            },
            ctx,
        )
    }

    fn entries(events: &[NormalizedEvent]) -> Vec<&NormalizedEntry> {
        events
            .iter()
            .filter_map(|event| match event {
                NormalizedEvent::Entry(entry) => Some(entry),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn init_assigns_session_once_and_reports_mode() {
        let mut ctx = NormalizeContext::new();
        let init = json!({
            "type": "system", "subtype": "init", "uuid": "u-init",
            "session_id": "ses-1", "model": "sonnet", "permissionMode": "plan"
        });
        let events = run(&mut ctx, &init);
        assert_eq!(events[0], NormalizedEvent::SessionId("ses-1".into()));
        assert_eq!(events[1], NormalizedEvent::ModeChanged(InteractionMode::Plan));
        assert_eq!(entries(&events)[0].model(), Some("sonnet"));

        let replay = run(&mut ctx, &init);
        assert!(!replay
            .iter()
            .any(|event| matches!(event, NormalizedEvent::SessionId(_))));
    }

    #[test]
    fn assistant_blocks_become_one_entry_each() {
        let mut ctx = NormalizeContext::new();
        let events = run(
            &mut ctx,
            &json!({
                "type": "assistant", "uuid": "u1", "parent_tool_use_id": "toolu_parent",
                "message": {"id": "msg_1", "model": "opus", "content": [
                    {"type": "thinking", "thinking": "hmm"},
                    {"type": "text", "text": "hello"},
                    {"type": "tool_use", "id": "toolu_1", "name": "Task", "input": {"prompt": "x"}},
                    {"type": "hologram", "beam": true}
                ]}
            }),
        );
        let entries = entries(&events);
        let ids: Vec<_> = entries.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["u1:0", "u1:1", "u1:2", "u1:3"]);
        assert_eq!(entries[0].entry_type, EntryType::Reasoning);
        assert_eq!(entries[2].tool_kind, Some(ToolKind::SubAgent));
        assert_eq!(entries[2].tool_id.as_deref(), Some("toolu_1"));
        assert_eq!(entries[3].entry_type, EntryType::Unknown);
        assert!(entries.iter().all(|e| e.parent_tool_id() == Some("toolu_parent")));
        assert!(events.contains(&NormalizedEvent::ToolState {
            tool_id: "toolu_1".into(),
            state: ToolState::Running,
        }));
    }

    #[test]
    fn tool_result_carries_error_flag_and_structured_payload() {
        let mut ctx = NormalizeContext::new();
        let events = run(
            &mut ctx,
            &json!({
                "type": "user", "uuid": "u2",
                "message": {"role": "user", "content": [
                    {"type": "tool_result", "tool_use_id": "toolu_1",
                     "content": [{"type": "text", "text": "boom"}], "is_error": true}
                ]},
                "tool_use_result": {"stderr": "boom"}
            }),
        );
        let entry = entries(&events)[0].clone();
        assert_eq!(entry.entry_type, EntryType::ToolResult);
        assert_eq!(
            entry.message.parts[0],
            Part::ToolResult {
                tool_id: "toolu_1".into(),
                content: "boom".into(),
                is_error: true,
                structured: Some(json!({"stderr": "boom"})),
            }
        );
        assert!(events.contains(&NormalizedEvent::ToolState {
            tool_id: "toolu_1".into(),
            state: ToolState::Error,
        }));
    }

    #[test]
    fn synthetic_user_prompt_is_flagged() {
        let mut ctx = NormalizeContext::new();
        let events = run(
            &mut ctx,
            &json!({
                "type": "user", "uuid": "u3", "isSynthetic": true,
                "message": {"role": "user", "content": [{"type": "text", "text": "skill body"}]}
            }),
        );
        assert!(entries(&events)[0].is_synthetic());
    }

    #[test]
    fn result_reports_completion_with_running_cost() {
        let mut ctx = NormalizeContext::new();
        run(
            &mut ctx,
            &json!({"type": "result", "uuid": "r1", "subtype": "success", "total_cost_usd": 0.5, "result": "ok"}),
        );
        let events = run(
            &mut ctx,
            &json!({
                "type": "result", "uuid": "r2", "subtype": "error_during_execution",
                "is_error": true, "total_cost_usd": 0.25, "duration_ms": 900,
                "errors": ["tool crashed"]
            }),
        );
        let completion = events
            .iter()
            .find_map(|event| match event {
                NormalizedEvent::Completion(outcome) => Some(outcome.clone()),
                _ => None,
            })
            .expect("completion");
        assert!(completion.is_error);
        assert_eq!(completion.message.as_deref(), Some("tool crashed"));
        assert_eq!(completion.duration_ms, Some(900));
        assert_eq!(completion.total_cost_usd, Some(0.75));
    }

    #[test]
    fn turn_counts_past_u32_are_dropped_not_wrapped() {
        let completion = |payload: Value| {
            run(&mut NormalizeContext::new(), &payload)
                .into_iter()
                .find_map(|event| match event {
                    NormalizedEvent::Completion(outcome) => Some(outcome),
                    _ => None,
                })
                .expect("completion")
        };
        let small = completion(json!({"type": "result", "uuid": "r1", "subtype": "success", "num_turns": 3}));
        assert_eq!(small.num_turns, Some(3));
        let huge = completion(json!({
            "type": "result", "uuid": "r2", "subtype": "success",
            "num_turns": u64::from(u32::MAX) + 1
        }));
        assert_eq!(huge.num_turns, None);
    }

    #[test]
    fn compaction_markers_map_to_start_and_end() {
        let mut ctx = NormalizeContext::new();
        let start = run(
            &mut ctx,
            &json!({"type": "system", "subtype": "status", "status": "compacting", "uuid": "c1"}),
        );
        let end = run(
            &mut ctx,
            &json!({"type": "system", "subtype": "compact_boundary", "uuid": "c2",
                    "compact_metadata": {"trigger": "auto", "pre_tokens": 1200}}),
        );
        assert_eq!(entries(&start)[0].entry_type, EntryType::CompactionStart);
        let end_entry = entries(&end)[0];
        assert_eq!(end_entry.entry_type, EntryType::CompactionEnd);
        assert_eq!(
            end_entry.message.parts[0],
            Part::Compaction {
                phase: CompactionPhase::End,
                trigger: Some("auto".into()),
                pre_tokens: Some(1200),
            }
        );
    }

    #[test]
    fn unknown_message_type_is_preserved() {
        let mut ctx = NormalizeContext::new();
        let payload = json!({"type": "telemetry", "n": 3});
        let events = run(&mut ctx, &payload);
        let entry = entries(&events)[0];
        assert_eq!(entry.entry_type, EntryType::Unknown);
        assert_eq!(
            entry.message.parts[0],
            Part::Unknown {
                original_type: "telemetry".into(),
                raw: payload.clone(),
            }
        );
    }

    #[test]
    fn rate_limit_event_converts_reset_to_millis() {
        let mut ctx = NormalizeContext::new();
        let events = run(
            &mut ctx,
            &json!({"type": "rate_limit_event", "rate_limit_info": {"status": "rejected", "resetsAt": 1700}}),
        );
        assert_eq!(
            events,
            vec![NormalizedEvent::RateLimit(RateLimitInfo {
                status: Some("rejected".into()),
                resets_at_ms: Some(1_700_000),
                message: None,
            })]
        );
    }
}
