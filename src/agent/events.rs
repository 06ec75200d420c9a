//! Agent NDJSON event parsing.
//!
//! The `claude` CLI in `stream-json` mode emits one JSON object per line:
//! `system` records (including the `init` handshake), `stream_event` partial
//! deltas, consolidated `assistant` / `user` messages, and a terminal
//! `result` record per turn.

use serde::Serialize;
use serde_json::Value;

/// Recoverable error categories surfaced inside an event stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentErrorKind {
    BudgetExceeded,
    TurnLimitExceeded,
    Internal,
}

impl std::fmt::Display for AgentErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AgentErrorKind::BudgetExceeded => write!(f, "budget_exceeded"),
            AgentErrorKind::TurnLimitExceeded => write!(f, "turn_limit_exceeded"),
            AgentErrorKind::Internal => write!(f, "internal"),
        }
    }
}

/// One event in a chat turn's stream.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentEvent {
    /// Subprocess handshake carrying the agent's own session id.
    Init { session_id: String },
    /// A fragment of assistant text.
    TextDelta { text: String },
    /// The agent invoked a tool.
    ToolUse { id: String, name: String, input: Value },
    /// A tool returned a value.
    ToolResult { id: String, output: Value },
    /// Final consolidated assistant text for the turn.
    Assistant { text: String },
    /// Recoverable error; the stream may continue or terminate.
    Error { kind: AgentErrorKind, detail: String },
    /// Terminal marker for the turn.
    Done,
}

/// Parse one NDJSON line into zero or more events. Unrecognized records are
/// skipped; a single line may yield several events (an assistant message
/// with multiple tool_use blocks, or a failed result).
pub fn parse_line(line: &str) -> Vec<AgentEvent> {
    let line = line.trim();
    if line.is_empty() {
        return Vec::new();
    }
    let Ok(value) = serde_json::from_str::<Value>(line) else {
        return Vec::new();
    };

    match value.get("type").and_then(Value::as_str) {
        Some("system") => parse_system(&value),
        Some("stream_event") => parse_stream_event(&value),
        Some("assistant") => parse_assistant(&value),
        Some("user") => parse_user(&value),
        Some("result") => parse_result(&value),
        _ => Vec::new(),
    }
}

fn parse_system(value: &Value) -> Vec<AgentEvent> {
    if value.get("subtype").and_then(Value::as_str) != Some("init") {
        return Vec::new();
    }
    match value.get("session_id").and_then(Value::as_str) {
        Some(session_id) => vec![AgentEvent::Init {
            session_id: session_id.to_string(),
        }],
        None => Vec::new(),
    }
}

fn parse_stream_event(value: &Value) -> Vec<AgentEvent> {
    let Some(event) = value.get("event") else {
        return Vec::new();
    };
    if event.get("type").and_then(Value::as_str) != Some("content_block_delta") {
        return Vec::new();
    }
    let Some(delta) = event.get("delta") else {
        return Vec::new();
    };
    if delta.get("type").and_then(Value::as_str) != Some("text_delta") {
        return Vec::new();
    }
    match delta.get("text").and_then(Value::as_str) {
        Some(text) if !text.is_empty() => vec![AgentEvent::TextDelta {
            text: text.to_string(),
        }],
        _ => Vec::new(),
    }
}

fn parse_assistant(value: &Value) -> Vec<AgentEvent> {
    let Some(blocks) = value
        .pointer("/message/content")
        .and_then(Value::as_array)
    else {
        return Vec::new();
    };

    let mut events = Vec::new();
    let mut text = String::new();

    for block in blocks {
        match block.get("type").and_then(Value::as_str) {
            Some("text") => {
                if let Some(fragment) = block.get("text").and_then(Value::as_str) {
                    text.push_str(fragment);
                }
            }
            Some("tool_use") => {
                let id = block
                    .get("id")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                let name = block
                    .get("name")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown")
                    .to_string();
                let input = block.get("input").cloned().unwrap_or(Value::Null);
                events.push(AgentEvent::ToolUse { id, name, input });
            }
            _ => {}
        }
    }

    if !text.is_empty() {
        events.push(AgentEvent::Assistant { text });
    }
    events
}

fn parse_user(value: &Value) -> Vec<AgentEvent> {
    let Some(blocks) = value
        .pointer("/message/content")
        .and_then(Value::as_array)
    else {
        return Vec::new();
    };

    blocks
        .iter()
        .filter(|block| block.get("type").and_then(Value::as_str) == Some("tool_result"))
        .map(|block| AgentEvent::ToolResult {
            id: block
                .get("tool_use_id")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            output: block.get("content").cloned().unwrap_or(Value::Null),
        })
        .collect()
}

fn parse_result(value: &Value) -> Vec<AgentEvent> {
    let subtype = value.get("subtype").and_then(Value::as_str).unwrap_or("");
    let is_error = value
        .get("is_error")
        .and_then(Value::as_bool)
        .unwrap_or(false)
        || subtype.starts_with("error");

    if !is_error {
        return vec![AgentEvent::Done];
    }

    let kind = match subtype {
        "error_budget_exceeded" => AgentErrorKind::BudgetExceeded,
        "error_max_turns" => AgentErrorKind::TurnLimitExceeded,
        _ => AgentErrorKind::Internal,
    };
    let detail = value
        .get("result")
        .and_then(Value::as_str)
        .unwrap_or("agent reported an error")
        .to_string();

    vec![AgentEvent::Error { kind, detail }, AgentEvent::Done]
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_init() {
        let line = r#"{"type":"system","subtype":"init","session_id":"abc-123","model":"x"}"#;
        assert_eq!(
            parse_line(line),
            vec![AgentEvent::Init {
                session_id: "abc-123".to_string()
            }]
        );
    }

    #[test]
    fn test_parse_text_delta() {
        let line = r#"{"type":"stream_event","event":{"type":"content_block_delta","delta":{"type":"text_delta","text":"Hel"}}}"#;
        assert_eq!(
            parse_line(line),
            vec![AgentEvent::TextDelta {
                text: "Hel".to_string()
            }]
        );
    }

    #[test]
    fn test_parse_assistant_with_tool_use() {
        let line = json!({
            "type": "assistant",
            "message": {
                "content": [
                    {"type": "text", "text": "Let me check."},
                    {"type": "tool_use", "id": "tu_1", "name": "Read", "input": {"path": "a.txt"}}
                ]
            }
        })
        .to_string();

        let events = parse_line(&line);
        assert_eq!(events.len(), 2);
        assert_eq!(
            events[0],
            AgentEvent::ToolUse {
                id: "tu_1".to_string(),
                name: "Read".to_string(),
                input: json!({"path": "a.txt"}),
            }
        );
        assert_eq!(
            events[1],
            AgentEvent::Assistant {
                text: "Let me check.".to_string()
            }
        );
    }

    #[test]
    fn test_parse_tool_result() {
        let line = json!({
            "type": "user",
            "message": {
                "content": [
                    {"type": "tool_result", "tool_use_id": "tu_1", "content": "file contents"}
                ]
            }
        })
        .to_string();

        assert_eq!(
            parse_line(&line),
            vec![AgentEvent::ToolResult {
                id: "tu_1".to_string(),
                output: json!("file contents"),
            }]
        );
    }

    #[test]
    fn test_parse_result_success() {
        let line = r#"{"type":"result","subtype":"success","is_error":false,"result":"done"}"#;
        assert_eq!(parse_line(line), vec![AgentEvent::Done]);
    }

    #[test]
    fn test_parse_result_budget_error() {
        let line =
            r#"{"type":"result","subtype":"error_budget_exceeded","is_error":true,"result":"over budget"}"#;
        let events = parse_line(line);
        assert_eq!(
            events,
            vec![
                AgentEvent::Error {
                    kind: AgentErrorKind::BudgetExceeded,
                    detail: "over budget".to_string(),
                },
                AgentEvent::Done,
            ]
        );
    }

    #[test]
    fn test_parse_result_turn_limit() {
        let line = r#"{"type":"result","subtype":"error_max_turns","is_error":true}"#;
        let events = parse_line(line);
        assert!(matches!(
            events[0],
            AgentEvent::Error {
                kind: AgentErrorKind::TurnLimitExceeded,
                ..
            }
        ));
    }

    #[test]
    fn test_garbage_lines_skipped() {
        assert!(parse_line("").is_empty());
        assert!(parse_line("not json").is_empty());
        assert!(parse_line(r#"{"type":"unknown_thing"}"#).is_empty());
    }
}
