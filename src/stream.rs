//! Translation of agent events into the external streaming vocabulary, and
//! the synchronous accumulator built on top of it.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::agent::AgentEvent;
use crate::session::models::{ChatResponse, ToolCallRecord};

/// One record on the SSE wire. Serialized as `{"type": "...", ...}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamRecord {
    TextDelta {
        text: String,
    },
    ToolUse {
        tool_name: String,
        tool_input: Value,
    },
    ToolResult {
        tool_name: String,
        tool_output: Value,
    },
    Error {
        kind: String,
        detail: String,
    },
    Done,
}

/// Maps the agent's event stream onto [`StreamRecord`]s, preserving emission
/// order. Stateful only to resolve tool result names from earlier tool-use
/// ids; internal events (init handshake, consolidated assistant text)
/// produce no output.
#[derive(Default)]
pub struct StreamTranslator {
    tool_names: HashMap<String, String>,
}

impl StreamTranslator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn translate(&mut self, event: &AgentEvent) -> Option<StreamRecord> {
        match event {
            AgentEvent::Init { .. } | AgentEvent::Assistant { .. } => None,
            AgentEvent::TextDelta { text } => Some(StreamRecord::TextDelta { text: text.clone() }),
            AgentEvent::ToolUse { id, name, input } => {
                self.tool_names.insert(id.clone(), name.clone());
                Some(StreamRecord::ToolUse {
                    tool_name: name.clone(),
                    tool_input: input.clone(),
                })
            }
            AgentEvent::ToolResult { id, output } => Some(StreamRecord::ToolResult {
                tool_name: self
                    .tool_names
                    .get(id)
                    .cloned()
                    .unwrap_or_else(|| "unknown".to_string()),
                tool_output: output.clone(),
            }),
            AgentEvent::Error { kind, detail } => Some(StreamRecord::Error {
                kind: kind.to_string(),
                detail: detail.clone(),
            }),
            AgentEvent::Done => Some(StreamRecord::Done),
        }
    }
}

/// Builds the synchronous [`ChatResponse`] from translator output: `text` is
/// the concatenation of all text deltas in emission order, `tool_calls` the
/// tool invocations in emission order with outputs filled in as results
/// arrive.
#[derive(Default)]
pub struct ChatAccumulator {
    text: String,
    tool_calls: Vec<ToolCallRecord>,
}

impl ChatAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn absorb(&mut self, record: &StreamRecord) {
        match record {
            StreamRecord::TextDelta { text } => self.text.push_str(text),
            StreamRecord::ToolUse {
                tool_name,
                tool_input,
            } => self.tool_calls.push(ToolCallRecord {
                name: tool_name.clone(),
                input: tool_input.clone(),
                output: None,
            }),
            StreamRecord::ToolResult {
                tool_name,
                tool_output,
            } => {
                // Fill the earliest still-open call for this tool.
                if let Some(call) = self
                    .tool_calls
                    .iter_mut()
                    .find(|call| call.name == *tool_name && call.output.is_none())
                {
                    call.output = Some(tool_output.clone());
                }
            }
            StreamRecord::Error { .. } | StreamRecord::Done => {}
        }
    }

    pub fn into_response(self, session_id: String) -> ChatResponse {
        ChatResponse {
            session_id,
            text: self.text,
            tool_calls: self.tool_calls,
            timestamp: chrono::Utc::now(),
        }
    }
}
