//! Stream translation: OpenAI chat-completion chunks → Anthropic SSE events.
//!
//! [`StreamTranslator`] is a pure state machine: feed it chunks, collect
//! events. It never blocks and never does I/O, so backpressure and keepalive
//! stay with the server's writer loop. Per assistant turn it guarantees the
//! grammar
//!
//! ```text
//! message_start (content_block_start content_block_delta* content_block_stop)*
//! message_delta message_stop
//! ```
//!
//! with content-block `index` contiguous from 0.

use crate::openai::{ChatCompletionChunk, ChunkUsage, DeltaToolCall};
use stream_event::{
    normalize_stop_reason, ContentBlock, ContentDelta, MessageDelta, MessageShell, StreamEvent,
    Usage,
};
use tracing::warn;

/// Options fixed for one stream.
#[derive(Clone, Debug)]
pub struct TranslatorOptions {
    /// Message id echoed in `message_start` (e.g. `msg_<uuid>`).
    pub message_id: String,
    /// Model name echoed in `message_start`.
    pub model: String,
    /// The handler already wrote a synthetic `message_start`; swallow ours.
    pub skip_first_message_start: bool,
    /// Suppress tool_use blocks named `web_search` / `web_search_*`
    /// (local backends after a proactive search injection).
    pub strip_web_search_calls: bool,
}

/// One in-progress tool-use block. `sse_index` stays `None` until the tool
/// name is known, because `content_block_start` must carry the name;
/// argument fragments arriving before that are buffered.
#[derive(Debug)]
struct ToolBlock {
    provider_index: u32,
    sse_index: Option<usize>,
    id: Option<String>,
    name: String,
    pending_args: String,
    suppressed: bool,
}

#[derive(Debug)]
enum BlockState {
    None,
    Text { index: usize },
    Tool(ToolBlock),
}

/// OpenAI-chunk → Anthropic-event state machine for one assistant turn.
pub struct StreamTranslator {
    opts: TranslatorOptions,
    started: bool,
    finished: bool,
    next_index: usize,
    block: BlockState,
    stop_reason: Option<String>,
    usage: Usage,
    tool_seq: u32,
}

impl StreamTranslator {
    pub fn new(opts: TranslatorOptions) -> Self {
        Self {
            opts,
            started: false,
            finished: false,
            next_index: 0,
            block: BlockState::None,
            stop_reason: None,
            usage: Usage::default(),
            tool_seq: 0,
        }
    }

    /// Usage accumulated so far (whatever the backend last reported).
    pub fn usage(&self) -> &Usage {
        &self.usage
    }

    /// The options this stream was built with (message id, model, flags).
    pub fn options(&self) -> &TranslatorOptions {
        &self.opts
    }

    /// Feeds one provider chunk, returning the Anthropic events it produces.
    pub fn feed(&mut self, chunk: &ChatCompletionChunk) -> Vec<StreamEvent> {
        if self.finished {
            return Vec::new();
        }
        let mut out = Vec::new();
        self.ensure_started(&mut out);

        for choice in &chunk.choices {
            if let Some(content) = &choice.delta.content {
                if !content.is_empty() {
                    self.feed_text(content, &mut out);
                }
            }
            if let Some(tool_calls) = &choice.delta.tool_calls {
                for tc in tool_calls {
                    self.feed_tool_delta(tc, &mut out);
                }
            }
            if let Some(reason) = &choice.finish_reason {
                self.stop_reason = Some(normalize_stop_reason(reason));
            }
        }

        if let Some(usage) = &chunk.usage {
            self.usage = convert_usage(usage);
        }

        out
    }

    /// Ends the stream: closes any open block, emits `message_delta` (with a
    /// normalised stop reason, defaulting to `end_turn`) and `message_stop`.
    pub fn finish(&mut self) -> Vec<StreamEvent> {
        if self.finished {
            return Vec::new();
        }
        let mut out = Vec::new();
        self.ensure_started(&mut out);
        self.close_block(&mut out);
        out.push(StreamEvent::MessageDelta {
            delta: MessageDelta {
                stop_reason: Some(
                    self.stop_reason
                        .take()
                        .unwrap_or_else(|| "end_turn".to_string()),
                ),
                stop_sequence: None,
            },
            usage: self.usage.clone(),
        });
        out.push(StreamEvent::MessageStop);
        self.finished = true;
        out
    }

    fn ensure_started(&mut self, out: &mut Vec<StreamEvent>) {
        if self.started {
            return;
        }
        self.started = true;
        if !self.opts.skip_first_message_start {
            out.push(StreamEvent::MessageStart {
                message: MessageShell::assistant(&self.opts.message_id, &self.opts.model),
            });
        }
    }

    fn feed_text(&mut self, content: &str, out: &mut Vec<StreamEvent>) {
        let index = match &self.block {
            BlockState::Text { index } => *index,
            _ => {
                self.close_block(out);
                let index = self.next_index;
                self.next_index += 1;
                out.push(StreamEvent::ContentBlockStart {
                    index,
                    content_block: ContentBlock::Text {
                        text: String::new(),
                    },
                });
                self.block = BlockState::Text { index };
                index
            }
        };
        out.push(StreamEvent::ContentBlockDelta {
            index,
            delta: ContentDelta::TextDelta {
                text: content.to_string(),
            },
        });
    }

    fn feed_tool_delta(&mut self, tc: &DeltaToolCall, out: &mut Vec<StreamEvent>) {
        // A different provider index means a new tool-use block.
        let same_tool = matches!(&self.block, BlockState::Tool(t) if t.provider_index == tc.index);
        if !same_tool {
            self.close_block(out);
            self.block = BlockState::Tool(ToolBlock {
                provider_index: tc.index,
                sse_index: None,
                id: None,
                name: String::new(),
                pending_args: String::new(),
                suppressed: false,
            });
        }
        let BlockState::Tool(tool) = &mut self.block else {
            return;
        };

        if let Some(id) = &tc.id {
            // Providers repeat the id across fragments of the same index.
            if tool.id.is_none() {
                tool.id = Some(id.clone());
            }
        }
        if let Some(function) = &tc.function {
            if let Some(name) = &function.name {
                tool.name.push_str(name);
            }
            if let Some(args) = &function.arguments {
                if !args.is_empty() {
                    tool.pending_args.push_str(args);
                }
            }
        }

        // Open the block once the name is known; everything buffered so far
        // flushes as the first input_json_delta.
        if tool.sse_index.is_none() && !tool.name.is_empty() {
            tool.suppressed = self.opts.strip_web_search_calls && is_web_search_tool(&tool.name);
            if !tool.suppressed {
                let index = self.next_index;
                self.next_index += 1;
                tool.sse_index = Some(index);
                let id = tool.id.clone().unwrap_or_else(|| {
                    self.tool_seq += 1;
                    format!("toolu_{}_{}", self.opts.message_id, self.tool_seq)
                });
                tool.id = Some(id.clone());
                out.push(StreamEvent::ContentBlockStart {
                    index,
                    content_block: ContentBlock::ToolUse {
                        id,
                        name: tool.name.clone(),
                        input: serde_json::json!({}),
                    },
                });
            }
        }

        if tool.pending_args.is_empty() {
            return;
        }
        if tool.suppressed {
            tool.pending_args.clear();
            return;
        }
        if let Some(index) = tool.sse_index {
            out.push(StreamEvent::ContentBlockDelta {
                index,
                delta: ContentDelta::InputJsonDelta {
                    partial_json: std::mem::take(&mut tool.pending_args),
                },
            });
        }
    }

    fn close_block(&mut self, out: &mut Vec<StreamEvent>) {
        match std::mem::replace(&mut self.block, BlockState::None) {
            BlockState::None => {}
            BlockState::Text { index } => {
                out.push(StreamEvent::ContentBlockStop { index });
            }
            BlockState::Tool(tool) => match tool.sse_index {
                Some(index) => out.push(StreamEvent::ContentBlockStop { index }),
                None => {
                    if !tool.suppressed && !tool.pending_args.is_empty() {
                        warn!(
                            provider_index = tool.provider_index,
                            "dropping tool-call fragments that never received a name"
                        );
                    }
                }
            },
        }
    }
}

/// Name match for server-side web search tools: `web_search` or `web_search_*`.
fn is_web_search_tool(name: &str) -> bool {
    name == "web_search" || name.starts_with("web_search_")
}

fn convert_usage(usage: &ChunkUsage) -> Usage {
    let cached = usage
        .prompt_tokens_details
        .as_ref()
        .map(|d| d.cached_tokens)
        .unwrap_or(0);
    Usage {
        input_tokens: usage.prompt_tokens,
        output_tokens: usage.completion_tokens,
        cache_creation_input_tokens: 0,
        cache_read_input_tokens: cached,
    }
}
