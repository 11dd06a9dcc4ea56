//! Message translation: Anthropic Messages ↔ backend-neutral message list.
//!
//! Forward direction flattens Anthropic content blocks into [`NeutralMessage`]s
//! (order preserved, tool ids preserved, orphan tool_results dropped with a
//! warning). [`to_openai_messages`] renders the neutral list for an
//! OpenAI-style backend. [`assemble_message`] is the reverse direction for the
//! non-streaming path: it folds a translated event sequence back into one
//! Anthropic message object.

use crate::anthropic::{
    InContentBlock, MessageContent, MessagesRequest, MessagesResponse, SystemPrompt,
};
use crate::openai::{
    AssistantToolCall, ChatContent, ChatMessage, ContentPart, FunctionCall, ImageUrl,
};
use serde_json::Value;
use std::collections::HashSet;
use stream_event::{ContentBlock, ContentDelta, StreamEvent, Usage};
use thiserror::Error;
use tracing::warn;

/// Errors while translating an inbound request.
#[derive(Debug, Error)]
pub enum TranslateError {
    #[error("unsupported content block kind in {role} message")]
    UnsupportedBlock { role: String },
    #[error("unsupported message role: {0}")]
    InvalidRole(String),
}

/// Message role in the neutral model.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

/// One backend-neutral content block.
#[derive(Clone, Debug, PartialEq)]
pub enum Block {
    Text(String),
    ToolCall {
        id: String,
        name: String,
        input: Value,
    },
    ToolResult {
        id: String,
        content: String,
    },
    Image {
        media_type: String,
        data: String,
    },
}

/// One backend-neutral message: role + ordered blocks.
#[derive(Clone, Debug, PartialEq)]
pub struct NeutralMessage {
    pub role: Role,
    pub blocks: Vec<Block>,
}

impl NeutralMessage {
    pub fn text(role: Role, text: impl Into<String>) -> Self {
        Self {
            role,
            blocks: vec![Block::Text(text.into())],
        }
    }

    fn is_text_only(&self) -> bool {
        self.blocks.iter().all(|b| matches!(b, Block::Text(_)))
    }
}

/// The translated request: joined system prompt + neutral message list.
#[derive(Clone, Debug)]
pub struct TranslatedRequest {
    pub system: Option<String>,
    pub messages: Vec<NeutralMessage>,
}

/// Translates an Anthropic request into the neutral model.
///
/// Guarantees: block order is preserved; tool ids are preserved; a
/// tool_result whose id was never emitted by an earlier assistant tool_use is
/// dropped with a warning rather than sent.
pub fn to_neutral(req: &MessagesRequest) -> Result<TranslatedRequest, TranslateError> {
    let system = req.system.as_ref().map(SystemPrompt::joined);

    let mut seen_tool_ids: HashSet<String> = HashSet::new();
    let mut messages: Vec<NeutralMessage> = Vec::with_capacity(req.messages.len());

    for msg in &req.messages {
        let role = match msg.role.as_str() {
            "user" => Role::User,
            "assistant" => Role::Assistant,
            other => return Err(TranslateError::InvalidRole(other.to_string())),
        };

        let mut blocks = Vec::new();
        match &msg.content {
            MessageContent::Text(text) => blocks.push(Block::Text(text.clone())),
            MessageContent::Blocks(in_blocks) => {
                for block in in_blocks {
                    match block {
                        InContentBlock::Text { text } => blocks.push(Block::Text(text.clone())),
                        InContentBlock::ToolUse { id, name, input } => {
                            seen_tool_ids.insert(id.clone());
                            blocks.push(Block::ToolCall {
                                id: id.clone(),
                                name: name.clone(),
                                input: input.clone(),
                            });
                        }
                        InContentBlock::ToolResult {
                            tool_use_id,
                            content,
                            ..
                        } => {
                            if !seen_tool_ids.contains(tool_use_id) {
                                warn!(
                                    tool_use_id = %tool_use_id,
                                    "dropping orphan tool_result with no matching tool_use"
                                );
                                continue;
                            }
                            blocks.push(Block::ToolResult {
                                id: tool_use_id.clone(),
                                content: content
                                    .as_ref()
                                    .map(|c| c.as_text())
                                    .unwrap_or_default(),
                            });
                        }
                        InContentBlock::Image { source } => {
                            let media_type = source
                                .media_type
                                .clone()
                                .unwrap_or_else(|| "image/png".to_string());
                            let data = match (&source.data, &source.url) {
                                (Some(data), _) => data.clone(),
                                (None, Some(url)) => url.clone(),
                                (None, None) => String::new(),
                            };
                            blocks.push(Block::Image { media_type, data });
                        }
                        InContentBlock::Unknown => {
                            return Err(TranslateError::UnsupportedBlock {
                                role: msg.role.clone(),
                            })
                        }
                    }
                }
            }
        }

        // Merge with the previous message only when both are text-only and
        // share the role; everything else keeps its own message.
        let candidate = NeutralMessage { role, blocks };
        match messages.last_mut() {
            Some(prev)
                if prev.role == candidate.role
                    && prev.is_text_only()
                    && candidate.is_text_only() =>
            {
                prev.blocks.extend(candidate.blocks);
            }
            _ => messages.push(candidate),
        }
    }

    Ok(TranslatedRequest { system, messages })
}

/// Renders the neutral list as OpenAI chat messages.
///
/// ToolCalls become assistant `tool_calls`; each ToolResult becomes its own
/// `role:"tool"` message; images become `image_url` parts carrying data URLs.
/// `system_override` replaces the translated system prompt when the optimizer
/// rewrote it.
pub fn to_openai_messages(
    translated: &TranslatedRequest,
    system_override: Option<&str>,
) -> Vec<ChatMessage> {
    let mut out = Vec::with_capacity(translated.messages.len() + 1);

    let system = system_override
        .map(str::to_string)
        .or_else(|| translated.system.clone());
    if let Some(system) = system {
        if !system.is_empty() {
            out.push(ChatMessage::system(system));
        }
    }

    for msg in &translated.messages {
        match msg.role {
            Role::Assistant => {
                let mut text = String::new();
                let mut tool_calls = Vec::new();
                for block in &msg.blocks {
                    match block {
                        Block::Text(t) => {
                            if !text.is_empty() {
                                text.push('\n');
                            }
                            text.push_str(t);
                        }
                        Block::ToolCall { id, name, input } => {
                            tool_calls.push(AssistantToolCall {
                                id: id.clone(),
                                kind: "function".into(),
                                function: FunctionCall {
                                    name: name.clone(),
                                    arguments: input.to_string(),
                                },
                            });
                        }
                        // tool results and images never appear on
                        // assistant messages after translation
                        _ => {}
                    }
                }
                out.push(ChatMessage {
                    role: "assistant".into(),
                    content: if text.is_empty() {
                        None
                    } else {
                        Some(ChatContent::Text(text))
                    },
                    tool_calls: if tool_calls.is_empty() {
                        None
                    } else {
                        Some(tool_calls)
                    },
                    tool_call_id: None,
                });
            }
            Role::User => {
                // Tool results come first (they answer the assistant's calls),
                // then the user's own text/images as one user message.
                let mut parts: Vec<ContentPart> = Vec::new();
                let mut plain_text = String::new();
                let mut has_image = false;
                for block in &msg.blocks {
                    match block {
                        Block::ToolResult { id, content } => {
                            out.push(ChatMessage::tool_result(id.clone(), content.clone()));
                        }
                        Block::Text(t) => {
                            if !plain_text.is_empty() {
                                plain_text.push('\n');
                            }
                            plain_text.push_str(t);
                            parts.push(ContentPart {
                                kind: "text".into(),
                                text: Some(t.clone()),
                                image_url: None,
                            });
                        }
                        Block::Image { media_type, data } => {
                            has_image = true;
                            let url = if data.starts_with("http://")
                                || data.starts_with("https://")
                            {
                                data.clone()
                            } else {
                                format!("data:{media_type};base64,{data}")
                            };
                            parts.push(ContentPart {
                                kind: "image_url".into(),
                                text: None,
                                image_url: Some(ImageUrl { url }),
                            });
                        }
                        Block::ToolCall { .. } => {}
                    }
                }
                if has_image {
                    out.push(ChatMessage {
                        role: "user".into(),
                        content: Some(ChatContent::Parts(parts)),
                        tool_calls: None,
                        tool_call_id: None,
                    });
                } else if !plain_text.is_empty() {
                    out.push(ChatMessage::text("user", plain_text));
                }
            }
        }
    }

    out
}

/// Folds a translated event sequence into one Anthropic message (non-stream
/// path). Tool-use input fragments are concatenated and parsed once at the
/// end; a fragment sequence that does not form valid JSON falls back to `{}`.
pub fn assemble_message(events: &[StreamEvent], model: &str) -> MessagesResponse {
    let mut id = String::new();
    let mut content: Vec<ContentBlock> = Vec::new();
    let mut arg_bufs: Vec<Option<String>> = Vec::new();
    let mut stop_reason = None;
    let mut stop_sequence = None;
    let mut usage = Usage::default();

    for event in events {
        match event {
            StreamEvent::MessageStart { message } => id = message.id.clone(),
            StreamEvent::ContentBlockStart {
                content_block, ..
            } => {
                arg_bufs.push(match content_block {
                    ContentBlock::ToolUse { .. } => Some(String::new()),
                    ContentBlock::Text { .. } => None,
                });
                content.push(content_block.clone());
            }
            StreamEvent::ContentBlockDelta { index, delta } => {
                match (content.get_mut(*index), delta) {
                    (Some(ContentBlock::Text { text }), ContentDelta::TextDelta { text: t }) => {
                        text.push_str(t)
                    }
                    (
                        Some(ContentBlock::ToolUse { .. }),
                        ContentDelta::InputJsonDelta { partial_json },
                    ) => {
                        if let Some(Some(buf)) = arg_bufs.get_mut(*index) {
                            buf.push_str(partial_json);
                        }
                    }
                    _ => {}
                }
            }
            StreamEvent::ContentBlockStop { .. } => {}
            StreamEvent::MessageDelta { delta, usage: u } => {
                stop_reason = delta.stop_reason.clone();
                stop_sequence = delta.stop_sequence.clone();
                usage = u.clone();
            }
            StreamEvent::MessageStop | StreamEvent::Error { .. } => {}
        }
    }

    for (block, buf) in content.iter_mut().zip(arg_bufs) {
        if let (ContentBlock::ToolUse { input, .. }, Some(buf)) = (block, buf) {
            if !buf.is_empty() {
                *input = serde_json::from_str(&buf).unwrap_or_else(|e| {
                    warn!(error = %e, "tool input fragments did not form valid JSON");
                    serde_json::json!({})
                });
            }
        }
    }

    MessagesResponse {
        id,
        kind: "message".into(),
        role: "assistant".into(),
        model: model.to_string(),
        content,
        stop_reason,
        stop_sequence,
        usage,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::anthropic::MessagesRequest;

    fn parse(json: &str) -> MessagesRequest {
        serde_json::from_str(json).unwrap()
    }

    /// **Scenario**: a tool round-trip keeps ids and block order; the
    /// tool_result lands as a `role:"tool"` message on the OpenAI side.
    #[test]
    fn tool_round_trip_preserves_ids() {
        let req = parse(
            r#"{
                "model": "m",
                "messages": [
                    { "role": "user", "content": "weather?" },
                    { "role": "assistant", "content": [
                        { "type": "text", "text": "checking" },
                        { "type": "tool_use", "id": "t1", "name": "get_weather", "input": {"city":"SF"} }
                    ]},
                    { "role": "user", "content": [
                        { "type": "tool_result", "tool_use_id": "t1", "content": "sunny" }
                    ]}
                ]
            }"#,
        );
        let translated = to_neutral(&req).unwrap();
        assert_eq!(translated.messages.len(), 3);
        assert_eq!(
            translated.messages[1].blocks[1],
            Block::ToolCall {
                id: "t1".into(),
                name: "get_weather".into(),
                input: serde_json::json!({"city":"SF"}),
            }
        );

        let openai = to_openai_messages(&translated, None);
        // user, assistant (text + tool_calls), tool
        assert_eq!(openai.len(), 3);
        assert_eq!(openai[1].role, "assistant");
        let calls = openai[1].tool_calls.as_ref().unwrap();
        assert_eq!(calls[0].id, "t1");
        assert_eq!(calls[0].function.name, "get_weather");
        assert_eq!(openai[2].role, "tool");
        assert_eq!(openai[2].tool_call_id.as_deref(), Some("t1"));
    }

    /// **Scenario**: a tool_result with no matching tool_use is dropped, not sent.
    #[test]
    fn orphan_tool_result_is_dropped() {
        let req = parse(
            r#"{
                "model": "m",
                "messages": [
                    { "role": "user", "content": [
                        { "type": "tool_result", "tool_use_id": "ghost", "content": "x" },
                        { "type": "text", "text": "hello" }
                    ]}
                ]
            }"#,
        );
        let translated = to_neutral(&req).unwrap();
        assert_eq!(translated.messages[0].blocks, vec![Block::Text("hello".into())]);
    }

    /// **Scenario**: adjacent same-role messages merge only when both are
    /// text-only.
    #[test]
    fn adjacent_text_messages_merge() {
        let req = parse(
            r#"{
                "model": "m",
                "messages": [
                    { "role": "user", "content": "a" },
                    { "role": "user", "content": "b" },
                    { "role": "assistant", "content": [
                        { "type": "tool_use", "id": "t1", "name": "f", "input": {} }
                    ]},
                    { "role": "assistant", "content": "done" }
                ]
            }"#,
        );
        let translated = to_neutral(&req).unwrap();
        // user(a+b), assistant(tool_use), assistant(done): tool message does not merge
        assert_eq!(translated.messages.len(), 3);
        assert_eq!(
            translated.messages[0].blocks,
            vec![Block::Text("a".into()), Block::Text("b".into())]
        );
    }

    /// **Scenario**: unknown block kinds surface as a typed error.
    #[test]
    fn unknown_block_is_unsupported() {
        let req = parse(
            r#"{
                "model": "m",
                "messages": [
                    { "role": "user", "content": [ { "type": "video", "src": "x" } ] }
                ]
            }"#,
        );
        assert!(matches!(
            to_neutral(&req),
            Err(TranslateError::UnsupportedBlock { .. })
        ));
    }

    #[test]
    fn invalid_role_is_an_error() {
        let req = parse(
            r#"{"model":"m","messages":[{"role":"tool","content":"x"}]}"#,
        );
        assert!(matches!(
            to_neutral(&req),
            Err(TranslateError::InvalidRole(_))
        ));
    }

    /// **Scenario**: system list segments join with newlines; the optimizer
    /// override wins when present.
    #[test]
    fn system_join_and_override() {
        let req = parse(
            r#"{
                "model": "m",
                "system": [{"type":"text","text":"a"},{"type":"text","text":"b"}],
                "messages": [{ "role": "user", "content": "hi" }]
            }"#,
        );
        let translated = to_neutral(&req).unwrap();
        assert_eq!(translated.system.as_deref(), Some("a\nb"));

        let openai = to_openai_messages(&translated, Some("optimized"));
        match &openai[0].content {
            Some(ChatContent::Text(t)) => assert_eq!(t, "optimized"),
            _ => panic!("expected system text"),
        }
    }

    /// **Scenario**: reverse assembly concatenates text deltas and parses
    /// tool input fragments into one JSON object.
    #[test]
    fn assemble_from_events() {
        use stream_event::{MessageDelta, MessageShell};
        let events = vec![
            StreamEvent::MessageStart {
                message: MessageShell::assistant("msg_9", "m"),
            },
            StreamEvent::ContentBlockStart {
                index: 0,
                content_block: ContentBlock::Text { text: String::new() },
            },
            StreamEvent::ContentBlockDelta {
                index: 0,
                delta: ContentDelta::TextDelta { text: "hel".into() },
            },
            StreamEvent::ContentBlockDelta {
                index: 0,
                delta: ContentDelta::TextDelta { text: "lo".into() },
            },
            StreamEvent::ContentBlockStop { index: 0 },
            StreamEvent::ContentBlockStart {
                index: 1,
                content_block: ContentBlock::ToolUse {
                    id: "t1".into(),
                    name: "get_weather".into(),
                    input: serde_json::json!({}),
                },
            },
            StreamEvent::ContentBlockDelta {
                index: 1,
                delta: ContentDelta::InputJsonDelta {
                    partial_json: "{\"city\":".into(),
                },
            },
            StreamEvent::ContentBlockDelta {
                index: 1,
                delta: ContentDelta::InputJsonDelta {
                    partial_json: "\"SF\"}".into(),
                },
            },
            StreamEvent::ContentBlockStop { index: 1 },
            StreamEvent::MessageDelta {
                delta: MessageDelta {
                    stop_reason: Some("tool_use".into()),
                    stop_sequence: None,
                },
                usage: Usage {
                    input_tokens: 7,
                    output_tokens: 5,
                    ..Usage::default()
                },
            },
            StreamEvent::MessageStop,
        ];
        let msg = assemble_message(&events, "m");
        assert_eq!(msg.id, "msg_9");
        assert_eq!(msg.stop_reason.as_deref(), Some("tool_use"));
        assert_eq!(msg.usage.input_tokens, 7);
        match &msg.content[0] {
            ContentBlock::Text { text } => assert_eq!(text, "hello"),
            _ => panic!("expected text block"),
        }
        match &msg.content[1] {
            ContentBlock::ToolUse { id, input, .. } => {
                assert_eq!(id, "t1");
                assert_eq!(input, &serde_json::json!({"city":"SF"}));
            }
            _ => panic!("expected tool_use block"),
        }
    }
}
