// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Line-framed JSON parsing for provider CLI output.
//!
//! Each provider speaks its own streaming dialect; this module normalises
//! all of them into [`StreamEvent`]s.  A line that parses but carries an
//! unrecognised type is forwarded as `unknown` with the original object
//! preserved; a line that does not parse at all is reported as a parse
//! failure so the supervisor can rate-limit and escalate.

use maestro_protocol::{Provider, StreamEvent, UsageTotals};
use serde_json::{Map, Value};

/// What one stdout line amounted to.
#[derive(Debug, Clone, PartialEq)]
pub enum LineOutcome {
    /// Zero or more events to forward (a claude `assistant` message can
    /// carry several content blocks).
    Events(Vec<StreamEvent>),
    /// The CLI is blocked waiting for an answer on stdin.  The original
    /// object is still forwarded as the contained event.
    WaitingForAnswer(StreamEvent),
    /// Not JSON; accumulate into the execution log.
    ParseFailure,
}

/// Parse one stdout line from `provider`.
pub fn parse_line(provider: Provider, line: &str, max_tool_output: usize) -> LineOutcome {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return LineOutcome::Events(Vec::new());
    }
    let Ok(value) = serde_json::from_str::<Value>(trimmed) else {
        return LineOutcome::ParseFailure;
    };
    let Some(obj) = value.as_object() else {
        return LineOutcome::ParseFailure;
    };

    if is_waiting_for_answer(provider, obj) {
        return LineOutcome::WaitingForAnswer(StreamEvent::Unknown {
            data: value.clone(),
        });
    }

    let events = match provider {
        Provider::Claude => claude_events(obj, max_tool_output),
        Provider::Codex => codex_events(obj, max_tool_output),
        Provider::Gemini => gemini_events(obj, max_tool_output),
    };
    LineOutcome::Events(events.unwrap_or_else(|| vec![StreamEvent::Unknown { data: value }]))
}

/// Cap a tool result at `max_bytes`, marking how much was cut.
pub fn truncate_tool_output(output: &str, max_bytes: usize) -> String {
    if output.len() <= max_bytes {
        return output.to_string();
    }
    // Cut at a char boundary at or below the cap.
    let mut cut = max_bytes;
    while cut > 0 && !output.is_char_boundary(cut) {
        cut -= 1;
    }
    format!(
        "{}…[truncated {} bytes]",
        &output[..cut],
        output.len() - cut
    )
}

fn is_waiting_for_answer(provider: Provider, obj: &Map<String, Value>) -> bool {
    let ty = obj.get("type").and_then(Value::as_str).unwrap_or_default();
    match provider {
        Provider::Claude => ty == "waiting_for_answer",
        Provider::Codex => {
            let msg_ty = obj
                .get("msg")
                .and_then(|m| m.get("type"))
                .and_then(Value::as_str)
                .unwrap_or_default();
            msg_ty == "exec_approval_request" || msg_ty == "apply_patch_approval_request"
        }
        Provider::Gemini => ty == "confirmation_request",
    }
}

fn str_field(obj: &Map<String, Value>, key: &str) -> Option<String> {
    obj.get(key).and_then(Value::as_str).map(str::to_string)
}

// ── Claude (stream-json) ──────────────────────────────────────────────────────

/// Map one claude `--output-format stream-json` message.  Returns `None`
/// for unrecognised types so the caller can fall back to `unknown`.
fn claude_events(obj: &Map<String, Value>, max_tool_output: usize) -> Option<Vec<StreamEvent>> {
    let ty = obj.get("type").and_then(Value::as_str)?;
    match ty {
        "system" => {
            let subtype = str_field(obj, "subtype").unwrap_or_default();
            if subtype == "init" {
                Some(vec![StreamEvent::Init {
                    data: str_field(obj, "model").unwrap_or_else(|| "init".to_string()),
                    session_id: str_field(obj, "session_id"),
                }])
            } else {
                None
            }
        }
        "assistant" | "user" => {
            // Content blocks live either at the top level or nested under
            // `message`, depending on the CLI version.
            let content = obj
                .get("content")
                .or_else(|| obj.get("message").and_then(|m| m.get("content")))?
                .as_array()?;
            Some(
                content
                    .iter()
                    .filter_map(|block| claude_block(block, max_tool_output))
                    .collect(),
            )
        }
        "result" => {
            let usage = obj.get("usage").map(claude_usage);
            Some(vec![StreamEvent::Result {
                result: str_field(obj, "result").unwrap_or_default(),
                usage,
                cost_usd: obj
                    .get("cost_usd")
                    .or_else(|| obj.get("total_cost_usd"))
                    .and_then(Value::as_f64),
                duration_ms: obj.get("duration_ms").and_then(Value::as_u64),
                extra: passthrough(
                    obj,
                    &["type", "result", "usage", "cost_usd", "total_cost_usd", "duration_ms"],
                ),
            }])
        }
        _ => None,
    }
}

fn claude_block(block: &Value, max_tool_output: usize) -> Option<StreamEvent> {
    let obj = block.as_object()?;
    let ty = obj.get("type").and_then(Value::as_str)?;
    match ty {
        "text" => Some(StreamEvent::Text {
            data: str_field(obj, "text")?,
            agent_id: None,
            extra: Map::new(),
        }),
        "thinking" => Some(StreamEvent::Thinking {
            data: str_field(obj, "thinking")?,
            extra: Map::new(),
        }),
        "tool_use" | "server_tool_use" => Some(StreamEvent::ToolUse {
            tool: str_field(obj, "name")?,
            tool_use_id: str_field(obj, "id")?,
            tool_input: obj.get("input").cloned(),
            parent_tool_use_id: str_field(obj, "parent_tool_use_id"),
            agent_id: None,
            extra: Map::new(),
        }),
        "tool_result" | "server_tool_result" => {
            let output = match obj.get("content") {
                Some(Value::String(s)) => Some(s.clone()),
                // Structured content: flatten the text parts.
                Some(Value::Array(parts)) => Some(
                    parts
                        .iter()
                        .filter_map(|p| p.pointer("/text").and_then(Value::as_str))
                        .collect::<Vec<_>>()
                        .join("\n"),
                ),
                _ => None,
            };
            Some(StreamEvent::ToolResult {
                tool: str_field(obj, "name").unwrap_or_default(),
                tool_use_id: str_field(obj, "tool_use_id")?,
                tool_output: output.map(|o| truncate_tool_output(&o, max_tool_output)),
                parent_tool_use_id: str_field(obj, "parent_tool_use_id"),
                agent_id: None,
                extra: Map::new(),
            })
        }
        _ => None,
    }
}

fn claude_usage(usage: &Value) -> UsageTotals {
    let get = |k: &str| usage.get(k).and_then(Value::as_u64).unwrap_or(0);
    let input = get("input_tokens");
    let output = get("output_tokens");
    let cache_creation = get("cache_creation_input_tokens") + get("cache_creation_tokens");
    let cache_read = get("cache_read_input_tokens") + get("cache_read_tokens");
    UsageTotals {
        input_tokens: input,
        output_tokens: output,
        cache_creation_tokens: cache_creation,
        cache_read_tokens: cache_read,
        total_tokens: input + output + cache_creation + cache_read,
        context_percent: None,
    }
}

// ── Codex (exec --json) ───────────────────────────────────────────────────────

/// Codex wraps everything in `{"id": …, "msg": {"type": …}}`.
fn codex_events(obj: &Map<String, Value>, max_tool_output: usize) -> Option<Vec<StreamEvent>> {
    let msg = obj.get("msg")?.as_object()?;
    let ty = msg.get("type").and_then(Value::as_str)?;
    let call_id = || str_field(msg, "call_id").unwrap_or_default();
    match ty {
        "session_configured" => Some(vec![StreamEvent::Init {
            data: str_field(msg, "model").unwrap_or_else(|| "init".to_string()),
            session_id: str_field(msg, "session_id"),
        }]),
        "agent_message" => Some(vec![StreamEvent::Text {
            data: str_field(msg, "message")?,
            agent_id: None,
            extra: Map::new(),
        }]),
        "agent_reasoning" => Some(vec![StreamEvent::Thinking {
            data: str_field(msg, "text")?,
            extra: Map::new(),
        }]),
        "exec_command_begin" => Some(vec![StreamEvent::ToolUse {
            tool: "shell".to_string(),
            tool_use_id: call_id(),
            tool_input: msg.get("command").cloned(),
            parent_tool_use_id: None,
            agent_id: None,
            extra: Map::new(),
        }]),
        "exec_command_end" => {
            let output = str_field(msg, "stdout")
                .or_else(|| str_field(msg, "aggregated_output"))
                .unwrap_or_default();
            Some(vec![StreamEvent::ToolResult {
                tool: "shell".to_string(),
                tool_use_id: call_id(),
                tool_output: Some(truncate_tool_output(&output, max_tool_output)),
                parent_tool_use_id: None,
                agent_id: None,
                extra: Map::new(),
            }])
        }
        "task_complete" => Some(vec![StreamEvent::Result {
            result: str_field(msg, "last_agent_message").unwrap_or_default(),
            usage: None,
            cost_usd: None,
            duration_ms: None,
            extra: Map::new(),
        }]),
        "error" => Some(vec![StreamEvent::Error {
            data: str_field(msg, "message").unwrap_or_else(|| "codex error".to_string()),
        }]),
        _ => None,
    }
}

// ── Gemini (stream-json) ──────────────────────────────────────────────────────

fn gemini_events(obj: &Map<String, Value>, max_tool_output: usize) -> Option<Vec<StreamEvent>> {
    let ty = obj.get("type").and_then(Value::as_str)?;
    match ty {
        "init" => Some(vec![StreamEvent::Init {
            data: str_field(obj, "model").unwrap_or_else(|| "init".to_string()),
            session_id: str_field(obj, "session_id"),
        }]),
        "content" | "text" => Some(vec![StreamEvent::Text {
            data: str_field(obj, "text").or_else(|| str_field(obj, "content"))?,
            agent_id: None,
            extra: Map::new(),
        }]),
        "thought" => Some(vec![StreamEvent::Thinking {
            data: str_field(obj, "text")?,
            extra: Map::new(),
        }]),
        "tool_call" | "tool_use" => Some(vec![StreamEvent::ToolUse {
            tool: str_field(obj, "name")?,
            tool_use_id: str_field(obj, "id").unwrap_or_default(),
            tool_input: obj.get("args").or_else(|| obj.get("input")).cloned(),
            parent_tool_use_id: None,
            agent_id: None,
            extra: Map::new(),
        }]),
        "tool_result" => Some(vec![StreamEvent::ToolResult {
            tool: str_field(obj, "name").unwrap_or_default(),
            tool_use_id: str_field(obj, "id").unwrap_or_default(),
            tool_output: str_field(obj, "output")
                .map(|o| truncate_tool_output(&o, max_tool_output)),
            parent_tool_use_id: None,
            agent_id: None,
            extra: Map::new(),
        }]),
        "result" => Some(vec![StreamEvent::Result {
            result: str_field(obj, "result").or_else(|| str_field(obj, "text"))?,
            usage: None,
            cost_usd: None,
            duration_ms: obj.get("duration_ms").and_then(Value::as_u64),
            extra: Map::new(),
        }]),
        _ => None,
    }
}

/// Copy every field except `skip` into an extra map, so unrecognised fields
/// survive the normalisation.
fn passthrough(obj: &Map<String, Value>, skip: &[&str]) -> Map<String, Value> {
    obj.iter()
        .filter(|(k, _)| !skip.contains(&k.as_str()))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

// ─── Unit tests ───────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    const CAP: usize = 256 * 1024;

    fn events(provider: Provider, line: &str) -> Vec<StreamEvent> {
        match parse_line(provider, line, CAP) {
            LineOutcome::Events(ev) => ev,
            other => panic!("expected events, got {other:?}"),
        }
    }

    // ── Claude ────────────────────────────────────────────────────────────────

    #[test]
    fn claude_init_maps_to_init() {
        let ev = events(
            Provider::Claude,
            r#"{"type":"system","subtype":"init","session_id":"abc","model":"opus"}"#,
        );
        assert_eq!(
            ev,
            vec![StreamEvent::Init {
                data: "opus".into(),
                session_id: Some("abc".into()),
            }]
        );
    }

    #[test]
    fn claude_assistant_blocks_expand_to_multiple_events() {
        let line = r#"{"type":"assistant","message":{"content":[
            {"type":"thinking","thinking":"hmm"},
            {"type":"text","text":"the answer"},
            {"type":"tool_use","id":"tu-1","name":"read_file","input":{"path":"a.rs"}}
        ]}}"#;
        let ev = events(Provider::Claude, line);
        assert_eq!(ev.len(), 3);
        assert!(matches!(ev[0], StreamEvent::Thinking { .. }));
        assert!(matches!(ev[1], StreamEvent::Text { .. }));
        match &ev[2] {
            StreamEvent::ToolUse {
                tool, tool_use_id, ..
            } => {
                assert_eq!(tool, "read_file");
                assert_eq!(tool_use_id, "tu-1");
            }
            other => panic!("expected tool_use, got {other:?}"),
        }
    }

    #[test]
    fn claude_tool_result_in_user_message() {
        let line = r#"{"type":"user","content":[
            {"type":"tool_result","tool_use_id":"tu-1","content":"file contents"}
        ]}"#;
        let ev = events(Provider::Claude, line);
        match &ev[0] {
            StreamEvent::ToolResult {
                tool_use_id,
                tool_output,
                ..
            } => {
                assert_eq!(tool_use_id, "tu-1");
                assert_eq!(tool_output.as_deref(), Some("file contents"));
            }
            other => panic!("expected tool_result, got {other:?}"),
        }
    }

    #[test]
    fn claude_result_carries_usage_and_extra_fields() {
        let line = r#"{"type":"result","result":"4","cost_usd":0.01,"duration_ms":1200,
            "usage":{"input_tokens":100,"output_tokens":5,"cache_read_input_tokens":50},
            "num_turns":2}"#;
        let ev = events(Provider::Claude, line);
        match &ev[0] {
            StreamEvent::Result {
                result,
                usage,
                cost_usd,
                extra,
                ..
            } => {
                assert_eq!(result, "4");
                let usage = usage.unwrap();
                assert_eq!(usage.input_tokens, 100);
                assert_eq!(usage.cache_read_tokens, 50);
                assert_eq!(usage.total_tokens, 155);
                assert_eq!(*cost_usd, Some(0.01));
                assert_eq!(extra["num_turns"], 2);
            }
            other => panic!("expected result, got {other:?}"),
        }
    }

    #[test]
    fn claude_waiting_for_answer_is_signalled() {
        let line = r#"{"type":"waiting_for_answer","question":"overwrite file?"}"#;
        assert!(matches!(
            parse_line(Provider::Claude, line, CAP),
            LineOutcome::WaitingForAnswer(_)
        ));
    }

    // ── Codex / Gemini ────────────────────────────────────────────────────────

    #[test]
    fn codex_agent_message_and_task_complete() {
        let ev = events(
            Provider::Codex,
            r#"{"id":"1","msg":{"type":"agent_message","message":"working on it"}}"#,
        );
        assert!(matches!(&ev[0], StreamEvent::Text { data, .. } if data == "working on it"));

        let ev = events(
            Provider::Codex,
            r#"{"id":"2","msg":{"type":"task_complete","last_agent_message":"done"}}"#,
        );
        assert!(matches!(&ev[0], StreamEvent::Result { result, .. } if result == "done"));
    }

    #[test]
    fn codex_exec_maps_to_shell_tool() {
        let ev = events(
            Provider::Codex,
            r#"{"id":"3","msg":{"type":"exec_command_begin","call_id":"c1","command":["ls","-la"]}}"#,
        );
        assert!(
            matches!(&ev[0], StreamEvent::ToolUse { tool, tool_use_id, .. }
                if tool == "shell" && tool_use_id == "c1")
        );
    }

    #[test]
    fn codex_approval_request_signals_waiting() {
        let line = r#"{"id":"4","msg":{"type":"exec_approval_request","call_id":"c2"}}"#;
        assert!(matches!(
            parse_line(Provider::Codex, line, CAP),
            LineOutcome::WaitingForAnswer(_)
        ));
    }

    #[test]
    fn gemini_text_and_result() {
        let ev = events(Provider::Gemini, r#"{"type":"content","text":"hello"}"#);
        assert!(matches!(&ev[0], StreamEvent::Text { data, .. } if data == "hello"));

        let ev = events(Provider::Gemini, r#"{"type":"result","result":"final"}"#);
        assert!(matches!(&ev[0], StreamEvent::Result { result, .. } if result == "final"));
    }

    // ── Fallbacks ─────────────────────────────────────────────────────────────

    #[test]
    fn unknown_type_becomes_unknown_event() {
        let ev = events(Provider::Claude, r#"{"type":"vendor_ping","n":1}"#);
        match &ev[0] {
            StreamEvent::Unknown { data } => assert_eq!(data["type"], "vendor_ping"),
            other => panic!("expected unknown, got {other:?}"),
        }
    }

    #[test]
    fn non_json_is_a_parse_failure() {
        assert_eq!(
            parse_line(Provider::Claude, "Segmentation fault", CAP),
            LineOutcome::ParseFailure
        );
        assert_eq!(
            parse_line(Provider::Claude, "[1, 2, 3]", CAP),
            LineOutcome::ParseFailure
        );
    }

    #[test]
    fn empty_line_yields_no_events() {
        assert_eq!(
            parse_line(Provider::Claude, "   ", CAP),
            LineOutcome::Events(Vec::new())
        );
    }

    // ── Truncation ────────────────────────────────────────────────────────────

    #[test]
    fn truncation_marks_cut_bytes() {
        let big = "a".repeat(100);
        let out = truncate_tool_output(&big, 10);
        assert!(out.starts_with("aaaaaaaaaa…"));
        assert!(out.ends_with("[truncated 90 bytes]"));
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        // 'é' is two bytes; cutting at byte 3 would split the second one.
        let s = "éééé";
        let out = truncate_tool_output(s, 3);
        assert!(out.starts_with('é'));
        assert!(out.contains("[truncated"));
    }

    #[test]
    fn truncated_output_never_exceeds_cap_plus_suffix() {
        let big = "x".repeat(1000);
        let cap = 64;
        let out = truncate_tool_output(&big, cap);
        let suffix_len = "…[truncated 936 bytes]".len();
        assert!(out.len() <= cap + suffix_len);
    }

    #[test]
    fn tool_result_is_truncated_during_parse() {
        let huge = "y".repeat(600);
        let line = format!(
            r#"{{"type":"user","content":[{{"type":"tool_result","tool_use_id":"t","content":"{huge}"}}]}}"#
        );
        match parse_line(Provider::Claude, &line, 256) {
            LineOutcome::Events(ev) => match &ev[0] {
                StreamEvent::ToolResult { tool_output, .. } => {
                    let out = tool_output.as_ref().unwrap();
                    assert!(out.len() < 600);
                    assert!(out.contains("[truncated 344 bytes]"));
                }
                other => panic!("expected tool_result, got {other:?}"),
            },
            other => panic!("expected events, got {other:?}"),
        }
    }

    #[test]
    fn tool_result_parse_uses_small_cap() {
        // Confirms parse_line threads the cap through.
        let line = r#"{"type":"user","content":[{"type":"tool_result","tool_use_id":"t","content":"abcdef"}]}"#;
        match parse_line(Provider::Claude, line, 4) {
            LineOutcome::Events(ev) => match &ev[0] {
                StreamEvent::ToolResult { tool_output, .. } => {
                    assert!(tool_output.as_ref().unwrap().starts_with("abcd…"));
                }
                other => panic!("unexpected {other:?}"),
            },
            other => panic!("unexpected {other:?}"),
        }
    }
}
