use std::collections::BTreeMap;

use serde::Deserialize;
use serde_json::Value;
use tracing::warn;

use loom_core::errors::GatewayError;
use loom_core::messages::{AssistantContent, AssistantMessage, FinishReason};
use loom_core::security::ProviderType;
use loom_core::stream::StreamEvent;

use crate::assemble::ToolCallAssembler;
use crate::sse::{EventParser, SseFrame};
use crate::usage::UsageMeter;

enum Block {
    Text(String),
    Thinking { text: String, signature: Option<String> },
    Tool,
}

/// State machine for the Anthropic Messages streaming protocol.
///
/// Content blocks are keyed by their `index` so interleaved deltas land in the
/// right block; the final message lists blocks in index order.
pub struct AnthropicParser {
    blocks: BTreeMap<usize, Block>,
    tools: ToolCallAssembler,
    usage: UsageMeter,
    stop_reason: Option<String>,
    context_limit: usize,
    done: bool,
}

impl AnthropicParser {
    pub fn new(estimated_input: u32, context_limit: usize) -> Self {
        Self {
            blocks: BTreeMap::new(),
            tools: ToolCallAssembler::new(),
            usage: UsageMeter::new(ProviderType::Anthropic, estimated_input),
            stop_reason: None,
            context_limit,
            done: false,
        }
    }

    fn block_start(&mut self, index: usize, block: &Value, events: &mut Vec<StreamEvent>) {
        match block.get("type").and_then(Value::as_str) {
            Some("text") => {
                let initial = block.get("text").and_then(Value::as_str).unwrap_or("");
                self.blocks.insert(index, Block::Text(initial.to_string()));
                events.push(StreamEvent::TextStart);
                if !initial.is_empty() {
                    self.usage.observe_output(initial);
                    events.push(StreamEvent::TextDelta { delta: initial.to_string() });
                }
            }
            Some("thinking") => {
                self.blocks.insert(
                    index,
                    Block::Thinking {
                        text: String::new(),
                        signature: None,
                    },
                );
                events.push(StreamEvent::ThinkingStart);
            }
            Some("tool_use") => {
                let id = block.get("id").and_then(Value::as_str);
                let name = block.get("name").and_then(Value::as_str);
                self.blocks.insert(index, Block::Tool);
                events.extend(self.tools.open(index, id, name));
            }
            other => warn!(block_type = ?other, "ignoring unknown content block"),
        }
    }

    fn block_delta(&mut self, index: usize, delta: &Value, events: &mut Vec<StreamEvent>) {
        let field = |key: &str| delta.get(key).and_then(Value::as_str).unwrap_or("");
        match (delta.get("type").and_then(Value::as_str), self.blocks.get_mut(&index)) {
            (Some("text_delta"), Some(Block::Text(text))) => {
                let chunk = field("text");
                text.push_str(chunk);
                self.usage.observe_output(chunk);
                events.push(StreamEvent::TextDelta { delta: chunk.to_string() });
            }
            (Some("thinking_delta"), Some(Block::Thinking { text, .. })) => {
                let chunk = field("thinking");
                text.push_str(chunk);
                self.usage.observe_output(chunk);
                events.push(StreamEvent::ThinkingDelta { delta: chunk.to_string() });
            }
            (Some("signature_delta"), Some(Block::Thinking { signature, .. })) => {
                signature.get_or_insert_with(String::new).push_str(field("signature"));
            }
            (Some("input_json_delta"), Some(Block::Tool)) => {
                let chunk = field("partial_json");
                self.usage.observe_output(chunk);
                events.extend(self.tools.push(index, chunk));
            }
            (kind, _) => warn!(index, delta_type = ?kind, "delta does not match an open block"),
        }
    }

    fn block_stop(&mut self, index: usize, events: &mut Vec<StreamEvent>) {
        match self.blocks.get(&index) {
            Some(Block::Text(text)) => events.push(StreamEvent::TextEnd { text: text.clone() }),
            Some(Block::Thinking { text, signature }) => events.push(StreamEvent::ThinkingEnd {
                thinking: text.clone(),
                signature: signature.clone(),
            }),
            Some(Block::Tool) => events.extend(self.tools.close(index)),
            None => {}
        }
        events.extend(self.usage.event());
    }

    fn build_message(&mut self) -> (AssistantMessage, FinishReason) {
        // Tool blocks the server never stopped still count.
        self.tools.close_all();

        let mut content = Vec::with_capacity(self.blocks.len());
        for (index, block) in &self.blocks {
            match block {
                Block::Text(text) => content.push(AssistantContent::Text { text: text.clone() }),
                Block::Thinking { text, signature } => content.push(AssistantContent::Thinking {
                    text: text.clone(),
                    signature: signature.clone(),
                }),
                Block::Tool => {
                    if let Some(call) = self.tools.get(*index) {
                        content.push(AssistantContent::ToolCall(call));
                    }
                }
            }
        }

        let has_tool_calls = !self.tools.is_empty();
        let finish_reason = map_stop_reason(self.stop_reason.as_deref(), has_tool_calls);
        let message = AssistantMessage {
            content,
            usage: Some(self.usage.current()),
            finish_reason: Some(finish_reason),
        };
        (message, finish_reason)
    }
}

impl EventParser for AnthropicParser {
    fn parse(&mut self, frame: &SseFrame) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        if self.done {
            return events;
        }
        let Ok(data) = serde_json::from_str::<Value>(&frame.data) else {
            warn!(data = %frame.data, "unparseable anthropic frame");
            return events;
        };
        let kind = frame
            .event
            .as_deref()
            .or_else(|| data.get("type").and_then(Value::as_str))
            .unwrap_or_default()
            .to_string();
        let index = data
            .get("index")
            .and_then(Value::as_u64)
            .map(|i| i as usize)
            .unwrap_or_default();

        match kind.as_str() {
            "message_start" => {
                if let Ok(start) = serde_json::from_value::<MessageStart>(data) {
                    if let Some(usage) = start.message.usage {
                        self.usage.report_input(
                            usage.input_tokens.unwrap_or_default(),
                            usage.cache_read_input_tokens.unwrap_or_default(),
                            usage.cache_creation_input_tokens.unwrap_or_default(),
                        );
                    }
                }
                events.push(StreamEvent::Start);
                events.extend(self.usage.event());
            }
            "content_block_start" => {
                let block = data.get("content_block").cloned().unwrap_or(Value::Null);
                self.block_start(index, &block, &mut events);
            }
            "content_block_delta" => {
                let delta = data.get("delta").cloned().unwrap_or(Value::Null);
                self.block_delta(index, &delta, &mut events);
            }
            "content_block_stop" => self.block_stop(index, &mut events),
            "message_delta" => {
                if let Ok(delta) = serde_json::from_value::<MessageDelta>(data) {
                    if let Some(reason) = delta.delta.stop_reason {
                        self.stop_reason = Some(reason);
                    }
                    if let Some(output) = delta.usage.and_then(|u| u.output_tokens) {
                        self.usage.report_output(output);
                    }
                }
                events.extend(self.usage.event());
            }
            "message_stop" => {
                let (message, finish_reason) = self.build_message();
                self.done = true;
                events.push(StreamEvent::Done {
                    message,
                    finish_reason,
                });
            }
            "error" => {
                let error = match serde_json::from_value::<ErrorEvent>(data) {
                    Ok(err) => classify_error(&err.error, self.context_limit),
                    Err(_) => GatewayError::ServerError {
                        status: 500,
                        body: frame.data.clone(),
                    },
                };
                self.done = true;
                events.push(StreamEvent::Error { error });
            }
            _ => {} // ping
        }
        events
    }

    fn finish(&mut self) -> Vec<StreamEvent> {
        if self.done {
            return Vec::new();
        }
        self.done = true;
        vec![StreamEvent::Error {
            error: GatewayError::StreamInterrupted("stream ended before message_stop".into()),
        }]
    }
}

pub fn map_stop_reason(reason: Option<&str>, has_tool_calls: bool) -> FinishReason {
    match reason {
        Some("max_tokens") => FinishReason::Length,
        Some("tool_use") => FinishReason::ToolCalls,
        Some("refusal") => FinishReason::ContentFilter,
        Some("end_turn" | "stop_sequence" | "pause_turn") => FinishReason::Stop,
        _ if has_tool_calls => FinishReason::ToolCalls,
        _ => FinishReason::Stop,
    }
}

pub fn classify_error(err: &ErrorBody, context_limit: usize) -> GatewayError {
    match err.error_type.as_str() {
        "overloaded_error" => GatewayError::ProviderOverloaded,
        "rate_limit_error" => GatewayError::RateLimited { retry_after: None },
        "authentication_error" | "permission_error" => {
            GatewayError::AuthenticationFailed(err.message.clone())
        }
        "not_found_error" => GatewayError::NotFound(err.message.clone()),
        "invalid_request_error" => {
            if err.message.contains("prompt is too long") || err.message.contains("context window") {
                GatewayError::ContextWindowExceeded {
                    limit: context_limit,
                    actual: 0,
                }
            } else {
                GatewayError::InvalidRequest(err.message.clone())
            }
        }
        _ => GatewayError::ServerError {
            status: 500,
            body: err.message.clone(),
        },
    }
}

#[derive(Deserialize)]
struct MessageStart {
    message: MessageStartBody,
}

#[derive(Deserialize)]
struct MessageStartBody {
    usage: Option<WireUsage>,
}

#[derive(Deserialize)]
struct MessageDelta {
    delta: MessageDeltaBody,
    usage: Option<WireUsage>,
}

#[derive(Deserialize)]
struct MessageDeltaBody {
    stop_reason: Option<String>,
}

#[derive(Deserialize)]
struct WireUsage {
    input_tokens: Option<u32>,
    output_tokens: Option<u32>,
    cache_read_input_tokens: Option<u32>,
    cache_creation_input_tokens: Option<u32>,
}

#[derive(Deserialize)]
struct ErrorEvent {
    error: ErrorBody,
}

#[derive(Deserialize)]
pub struct ErrorBody {
    #[serde(rename = "type")]
    pub error_type: String,
    pub message: String,
}
