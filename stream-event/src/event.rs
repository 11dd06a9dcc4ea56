//! Anthropic streaming event types (type + payload).
//!
//! Field names and tag values match the Anthropic Messages streaming API:
//! `message_start`, `content_block_start`, `content_block_delta`,
//! `content_block_stop`, `message_delta`, `message_stop`, `error`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One Anthropic streaming event: wire shape for a single SSE `data:` payload.
/// The SSE `event:` line uses [`StreamEvent::name`]; see [`crate::frame`].
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    MessageStart { message: MessageShell },
    ContentBlockStart {
        index: usize,
        content_block: ContentBlock,
    },
    ContentBlockDelta {
        index: usize,
        delta: ContentDelta,
    },
    ContentBlockStop { index: usize },
    MessageDelta {
        delta: MessageDelta,
        usage: Usage,
    },
    MessageStop,
    Error { error: ErrorPayload },
}

impl StreamEvent {
    /// SSE event name for this event (the `event:` line).
    pub fn name(&self) -> &'static str {
        match self {
            StreamEvent::MessageStart { .. } => "message_start",
            StreamEvent::ContentBlockStart { .. } => "content_block_start",
            StreamEvent::ContentBlockDelta { .. } => "content_block_delta",
            StreamEvent::ContentBlockStop { .. } => "content_block_stop",
            StreamEvent::MessageDelta { .. } => "message_delta",
            StreamEvent::MessageStop => "message_stop",
            StreamEvent::Error { .. } => "error",
        }
    }

    /// Serializes this event to a JSON object (type + payload only).
    pub fn to_value(&self) -> Result<Value, serde_json::Error> {
        serde_json::to_value(self)
    }
}

/// The message object carried by `message_start`: empty content, zeroed usage.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MessageShell {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub role: String,
    pub model: String,
    pub content: Vec<ContentBlock>,
    pub stop_reason: Option<String>,
    pub stop_sequence: Option<String>,
    pub usage: Usage,
}

impl MessageShell {
    /// Builds the shell for a fresh assistant turn: `content: []`, zeroed usage.
    pub fn assistant(id: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: "message".to_string(),
            role: "assistant".to_string(),
            model: model.into(),
            content: Vec::new(),
            stop_reason: None,
            stop_sequence: None,
            usage: Usage::default(),
        }
    }
}

/// A content block opened by `content_block_start`.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text { text: String },
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
}

/// An incremental delta inside an open content block.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentDelta {
    TextDelta { text: String },
    InputJsonDelta { partial_json: String },
}

/// The delta object carried by `message_delta`.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct MessageDelta {
    pub stop_reason: Option<String>,
    pub stop_sequence: Option<String>,
}

/// Token usage on the Anthropic wire. Cache fields default to 0 when the
/// backend does not report them.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub cache_creation_input_tokens: u64,
    #[serde(default)]
    pub cache_read_input_tokens: u64,
}

/// Payload of an `error` event.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ErrorPayload {
    #[serde(rename = "type")]
    pub kind: String,
    pub message: String,
}

/// Maps an OpenAI-style finish reason onto an Anthropic stop reason.
///
/// `stop` → `end_turn`, `length` → `max_tokens`, `tool_calls`/`tool_use` →
/// `tool_use`; anything else passes through unchanged so unknown backend
/// reasons stay visible to the client.
pub fn normalize_stop_reason(finish_reason: &str) -> String {
    match finish_reason {
        "stop" => "end_turn".to_string(),
        "length" => "max_tokens".to_string(),
        "tool_calls" | "tool_use" => "tool_use".to_string(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// **Scenario**: message_start serializes with the Anthropic tag and a
    /// nested message object with empty content and zeroed usage.
    #[test]
    fn message_start_wire_shape() {
        let ev = StreamEvent::MessageStart {
            message: MessageShell::assistant("msg_1", "claude-x"),
        };
        let v = ev.to_value().unwrap();
        assert_eq!(v["type"], "message_start");
        assert_eq!(v["message"]["id"], "msg_1");
        assert_eq!(v["message"]["type"], "message");
        assert_eq!(v["message"]["role"], "assistant");
        assert_eq!(v["message"]["model"], "claude-x");
        assert!(v["message"]["content"].as_array().unwrap().is_empty());
        assert_eq!(v["message"]["usage"]["input_tokens"], 0);
        assert_eq!(v["message"]["usage"]["cache_read_input_tokens"], 0);
    }

    /// **Scenario**: tool_use content_block_start carries id, name and empty input.
    #[test]
    fn tool_use_block_start_wire_shape() {
        let ev = StreamEvent::ContentBlockStart {
            index: 1,
            content_block: ContentBlock::ToolUse {
                id: "t1".into(),
                name: "get_weather".into(),
                input: serde_json::json!({}),
            },
        };
        let v = ev.to_value().unwrap();
        assert_eq!(v["type"], "content_block_start");
        assert_eq!(v["index"], 1);
        assert_eq!(v["content_block"]["type"], "tool_use");
        assert_eq!(v["content_block"]["id"], "t1");
        assert_eq!(v["content_block"]["name"], "get_weather");
        assert_eq!(v["content_block"]["input"], serde_json::json!({}));
    }

    /// **Scenario**: deltas use text_delta / input_json_delta tags.
    #[test]
    fn delta_wire_shapes() {
        let text = StreamEvent::ContentBlockDelta {
            index: 0,
            delta: ContentDelta::TextDelta { text: "he".into() },
        };
        let v = text.to_value().unwrap();
        assert_eq!(v["delta"]["type"], "text_delta");
        assert_eq!(v["delta"]["text"], "he");

        let json = StreamEvent::ContentBlockDelta {
            index: 0,
            delta: ContentDelta::InputJsonDelta {
                partial_json: "{\"c".into(),
            },
        };
        let v = json.to_value().unwrap();
        assert_eq!(v["delta"]["type"], "input_json_delta");
        assert_eq!(v["delta"]["partial_json"], "{\"c");
    }

    /// **Scenario**: stop-reason mapping is total and stable for the known
    /// finish reasons and passes unknown reasons through.
    #[test]
    fn stop_reason_mapping_total() {
        assert_eq!(normalize_stop_reason("stop"), "end_turn");
        assert_eq!(normalize_stop_reason("length"), "max_tokens");
        assert_eq!(normalize_stop_reason("tool_calls"), "tool_use");
        assert_eq!(normalize_stop_reason("tool_use"), "tool_use");
        assert_eq!(normalize_stop_reason("content_filter"), "content_filter");
        assert_eq!(normalize_stop_reason("other"), "other");
        // Stable: same input, same output.
        assert_eq!(normalize_stop_reason("stop"), normalize_stop_reason("stop"));
    }

    /// **Scenario**: every event variant reports the matching SSE event name.
    #[test]
    fn event_names_match_variants() {
        let shell = MessageShell::assistant("m", "x");
        let cases: Vec<(StreamEvent, &str)> = vec![
            (
                StreamEvent::MessageStart {
                    message: shell.clone(),
                },
                "message_start",
            ),
            (
                StreamEvent::ContentBlockStart {
                    index: 0,
                    content_block: ContentBlock::Text { text: String::new() },
                },
                "content_block_start",
            ),
            (
                StreamEvent::ContentBlockDelta {
                    index: 0,
                    delta: ContentDelta::TextDelta { text: "x".into() },
                },
                "content_block_delta",
            ),
            (StreamEvent::ContentBlockStop { index: 0 }, "content_block_stop"),
            (
                StreamEvent::MessageDelta {
                    delta: MessageDelta::default(),
                    usage: Usage::default(),
                },
                "message_delta",
            ),
            (StreamEvent::MessageStop, "message_stop"),
            (
                StreamEvent::Error {
                    error: ErrorPayload {
                        kind: "overloaded_error".into(),
                        message: "busy".into(),
                    },
                },
                "error",
            ),
        ];
        for (ev, name) in cases {
            assert_eq!(ev.name(), name);
            assert_eq!(ev.to_value().unwrap()["type"], name);
        }
    }
}
