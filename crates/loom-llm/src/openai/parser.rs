use serde::Deserialize;
use tracing::warn;

use loom_core::errors::GatewayError;
use loom_core::messages::{AssistantContent, AssistantMessage, FinishReason};
use loom_core::security::ProviderType;
use loom_core::stream::StreamEvent;

use crate::assemble::ToolCallAssembler;
use crate::sse::{EventParser, SseFrame};
use crate::usage::UsageMeter;

#[derive(Clone, Copy, PartialEq, Eq)]
enum OpenBlock {
    None,
    Text,
    Thinking,
}

/// State machine for Chat Completions streaming chunks.
///
/// Text, reasoning and tool-call deltas arrive inside `choices[0].delta`.
/// Tool calls are keyed by their `index` field, which is the only stable key
/// for fragments after the first.
pub struct ChatCompletionParser {
    started: bool,
    open: OpenBlock,
    text: String,
    thinking: String,
    tools: ToolCallAssembler,
    usage: UsageMeter,
    finish_reason: Option<String>,
    context_limit: usize,
    done: bool,
}

impl ChatCompletionParser {
    pub fn new(estimated_input: u32, context_limit: usize) -> Self {
        Self {
            started: false,
            open: OpenBlock::None,
            text: String::new(),
            thinking: String::new(),
            tools: ToolCallAssembler::new(),
            usage: UsageMeter::new(ProviderType::OpenAI, estimated_input),
            finish_reason: None,
            context_limit,
            done: false,
        }
    }

    fn switch_to(&mut self, block: OpenBlock, events: &mut Vec<StreamEvent>) {
        if self.open == block {
            return;
        }
        self.close_open(events);
        match block {
            OpenBlock::Text => events.push(StreamEvent::TextStart),
            OpenBlock::Thinking => events.push(StreamEvent::ThinkingStart),
            OpenBlock::None => {}
        }
        self.open = block;
    }

    fn close_open(&mut self, events: &mut Vec<StreamEvent>) {
        match self.open {
            OpenBlock::Text => events.push(StreamEvent::TextEnd { text: self.text.clone() }),
            OpenBlock::Thinking => events.push(StreamEvent::ThinkingEnd {
                thinking: self.thinking.clone(),
                signature: None,
            }),
            OpenBlock::None => {}
        }
        self.open = OpenBlock::None;
    }

    fn apply_delta(&mut self, delta: ChunkDelta, events: &mut Vec<StreamEvent>) {
        if let Some(reasoning) = delta.reasoning_content.filter(|r| !r.is_empty()) {
            self.switch_to(OpenBlock::Thinking, events);
            self.thinking.push_str(&reasoning);
            self.usage.observe_output(&reasoning);
            events.push(StreamEvent::ThinkingDelta { delta: reasoning });
        }
        if let Some(content) = delta.content.filter(|c| !c.is_empty()) {
            self.switch_to(OpenBlock::Text, events);
            self.text.push_str(&content);
            self.usage.observe_output(&content);
            events.push(StreamEvent::TextDelta { delta: content });
        }
        for call in delta.tool_calls.unwrap_or_default() {
            self.close_open(events);
            let (name, arguments) = match call.function {
                Some(f) => (f.name, f.arguments),
                None => (None, None),
            };
            events.extend(self.tools.open(call.index, call.id.as_deref(), name.as_deref()));
            if let Some(fragment) = arguments {
                self.usage.observe_output(&fragment);
                events.extend(self.tools.push(call.index, &fragment));
            }
        }
    }

    fn build_done(&mut self) -> StreamEvent {
        let mut content = Vec::new();
        if !self.thinking.is_empty() {
            content.push(AssistantContent::Thinking {
                text: self.thinking.clone(),
                signature: None,
            });
        }
        if !self.text.is_empty() {
            content.push(AssistantContent::Text { text: self.text.clone() });
        }
        content.extend(self.tools.calls().into_iter().map(AssistantContent::ToolCall));

        let finish_reason = map_finish_reason(self.finish_reason.as_deref(), !self.tools.is_empty());
        StreamEvent::Done {
            message: AssistantMessage {
                content,
                usage: Some(self.usage.current()),
                finish_reason: Some(finish_reason),
            },
            finish_reason,
        }
    }

    fn finalize(&mut self) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        self.close_open(&mut events);
        events.extend(self.tools.close_all());
        events.extend(self.usage.event());
        events.push(self.build_done());
        self.done = true;
        events
    }
}

impl EventParser for ChatCompletionParser {
    fn parse(&mut self, frame: &SseFrame) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        if self.done {
            return events;
        }
        if frame.data.trim() == "[DONE]" {
            return self.finalize();
        }

        let chunk: Chunk = match serde_json::from_str(&frame.data) {
            Ok(chunk) => chunk,
            Err(e) => {
                warn!(error = %e, data = %frame.data, "unparseable chat completion chunk");
                return events;
            }
        };

        if let Some(err) = chunk.error {
            self.done = true;
            events.push(StreamEvent::Error {
                error: classify_error(&err, self.context_limit),
            });
            return events;
        }

        if !self.started {
            self.started = true;
            events.push(StreamEvent::Start);
        }

        for choice in chunk.choices {
            if let Some(delta) = choice.delta {
                self.apply_delta(delta, &mut events);
            }
            if let Some(reason) = choice.finish_reason {
                self.close_open(&mut events);
                events.extend(self.tools.close_all());
                self.finish_reason = Some(reason);
            }
        }

        if let Some(usage) = chunk.usage {
            let cached = usage
                .prompt_tokens_details
                .and_then(|d| d.cached_tokens)
                .unwrap_or_default();
            self.usage.report_input(usage.prompt_tokens, cached, 0);
            self.usage.report_output(usage.completion_tokens);
        }
        events.extend(self.usage.event());
        events
    }

    fn finish(&mut self) -> Vec<StreamEvent> {
        if self.done {
            return Vec::new();
        }
        // Some compatible servers close the stream without `[DONE]`.
        if self.finish_reason.is_some() {
            return self.finalize();
        }
        self.done = true;
        vec![StreamEvent::Error {
            error: GatewayError::StreamInterrupted("stream ended without finish_reason".into()),
        }]
    }
}

pub fn map_finish_reason(reason: Option<&str>, has_tool_calls: bool) -> FinishReason {
    match reason {
        Some("length") => FinishReason::Length,
        Some("content_filter") => FinishReason::ContentFilter,
        Some("tool_calls" | "function_call") => FinishReason::ToolCalls,
        _ if has_tool_calls => FinishReason::ToolCalls,
        _ => FinishReason::Stop,
    }
}

pub fn classify_error(err: &ApiError, context_limit: usize) -> GatewayError {
    let code = err.code.as_deref().or(err.error_type.as_deref()).unwrap_or_default();
    match code {
        "invalid_api_key" | "authentication_error" => {
            GatewayError::AuthenticationFailed(err.message.clone())
        }
        "context_length_exceeded" => GatewayError::ContextWindowExceeded {
            limit: context_limit,
            actual: 0,
        },
        "model_not_found" => GatewayError::NotFound(err.message.clone()),
        "invalid_request_error" => GatewayError::InvalidRequest(err.message.clone()),
        c if c.starts_with("rate_limit") => GatewayError::RateLimited { retry_after: None },
        _ => GatewayError::ServerError {
            status: 500,
            body: err.message.clone(),
        },
    }
}

#[derive(Deserialize)]
struct Chunk {
    #[serde(default)]
    choices: Vec<Choice>,
    usage: Option<WireUsage>,
    error: Option<ApiError>,
}

#[derive(Deserialize)]
struct Choice {
    delta: Option<ChunkDelta>,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct ChunkDelta {
    content: Option<String>,
    reasoning_content: Option<String>,
    tool_calls: Option<Vec<ToolCallChunk>>,
}

#[derive(Deserialize)]
struct ToolCallChunk {
    #[serde(default)]
    index: usize,
    id: Option<String>,
    function: Option<FunctionChunk>,
}

#[derive(Deserialize)]
struct FunctionChunk {
    name: Option<String>,
    arguments: Option<String>,
}

#[derive(Deserialize)]
struct WireUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
    prompt_tokens_details: Option<PromptDetails>,
}

#[derive(Deserialize)]
struct PromptDetails {
    cached_tokens: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct ApiError {
    pub message: String,
    #[serde(rename = "type")]
    pub error_type: Option<String>,
    pub code: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn data(d: &str) -> SseFrame {
        SseFrame {
            event: None,
            data: d.to_string(),
        }
    }

    fn feed(parser: &mut ChatCompletionParser, chunks: &[&str]) -> Vec<StreamEvent> {
        chunks.iter().flat_map(|c| parser.parse(&data(c))).collect()
    }

    fn done(events: &[StreamEvent]) -> (AssistantMessage, FinishReason) {
        match events.last() {
            Some(StreamEvent::Done { message, finish_reason }) => (message.clone(), *finish_reason),
            other => panic!("expected Done, got {other:?}"),
        }
    }

    #[test]
    fn text_stream_with_usage() {
        let mut parser = ChatCompletionParser::new(10, 128_000);
        let events = feed(
            &mut parser,
            &[
                r#"{"choices":[{"delta":{"role":"assistant","content":"Hel"}}]}"#,
                r#"{"choices":[{"delta":{"content":"lo"}}]}"#,
                r#"{"choices":[{"delta":{},"finish_reason":"stop"}]}"#,
                r#"{"choices":[],"usage":{"prompt_tokens":42,"completion_tokens":3}}"#,
                "[DONE]",
            ],
        );
        assert!(matches!(events[0], StreamEvent::Start));
        assert!(events
            .iter()
            .any(|e| matches!(e, StreamEvent::TextEnd { text } if text == "Hello")));
        let (message, reason) = done(&events);
        assert_eq!(reason, FinishReason::Stop);
        assert_eq!(message.text_content(), "Hello");
        let usage = message.usage.unwrap();
        assert_eq!(usage.input_tokens, 42);
        assert!(!usage.estimated);
    }

    #[test]
    fn parallel_tool_calls_keyed_by_index() {
        let mut parser = ChatCompletionParser::new(0, 128_000);
        let events = feed(
            &mut parser,
            &[
                r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"id":"call_a","type":"function","function":{"name":"Read","arguments":""}}]}}]}"#,
                r#"{"choices":[{"delta":{"tool_calls":[{"index":1,"id":"call_b","type":"function","function":{"name":"Glob","arguments":"{\"pat"}}]}}]}"#,
                r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":"{\"file_path\":\"/x\"}"}}]}}]}"#,
                r#"{"choices":[{"delta":{"tool_calls":[{"index":1,"function":{"arguments":"tern\":\"*.md\"}"}}]}}]}"#,
                r#"{"choices":[{"delta":{},"finish_reason":"tool_calls"}]}"#,
                "[DONE]",
            ],
        );
        let ends = events
            .iter()
            .filter(|e| matches!(e, StreamEvent::ToolCallEnd { .. }))
            .count();
        assert_eq!(ends, 2);
        let (message, reason) = done(&events);
        assert_eq!(reason, FinishReason::ToolCalls);
        let calls = message.tool_calls();
        assert_eq!(calls[0].id.as_str(), "call_a");
        assert_eq!(calls[0].arguments, json!({"file_path": "/x"}));
        assert_eq!(calls[1].arguments, json!({"pattern": "*.md"}));
    }

    #[test]
    fn stop_with_tool_calls_becomes_tool_calls() {
        let mut parser = ChatCompletionParser::new(0, 128_000);
        let events = feed(
            &mut parser,
            &[
                r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"id":"call_a","function":{"name":"Bash","arguments":"{}"}}]}}]}"#,
                r#"{"choices":[{"delta":{},"finish_reason":"stop"}]}"#,
                "[DONE]",
            ],
        );
        assert_eq!(done(&events).1, FinishReason::ToolCalls);
    }

    #[test]
    fn reasoning_then_text() {
        let mut parser = ChatCompletionParser::new(0, 128_000);
        let events = feed(
            &mut parser,
            &[
                r#"{"choices":[{"delta":{"reasoning_content":"thinking hard"}}]}"#,
                r#"{"choices":[{"delta":{"content":"answer"}}]}"#,
                r#"{"choices":[{"delta":{},"finish_reason":"length"}]}"#,
                "[DONE]",
            ],
        );
        let thinking_end = events
            .iter()
            .position(|e| matches!(e, StreamEvent::ThinkingEnd { .. }))
            .unwrap();
        let text_start = events
            .iter()
            .position(|e| matches!(e, StreamEvent::TextStart))
            .unwrap();
        assert!(thinking_end < text_start);
        let (message, reason) = done(&events);
        assert_eq!(reason, FinishReason::Length);
        assert!(matches!(message.content[0], AssistantContent::Thinking { .. }));
    }

    #[test]
    fn content_filter_reason() {
        assert_eq!(map_finish_reason(Some("content_filter"), false), FinishReason::ContentFilter);
        assert_eq!(map_finish_reason(Some("function_call"), false), FinishReason::ToolCalls);
        assert_eq!(map_finish_reason(None, false), FinishReason::Stop);
    }

    #[test]
    fn error_chunk_classified() {
        let mut parser = ChatCompletionParser::new(0, 128_000);
        let events = feed(
            &mut parser,
            &[r#"{"error":{"message":"too long","type":"invalid_request_error","code":"context_length_exceeded"}}"#],
        );
        assert!(matches!(
            &events[0],
            StreamEvent::Error { error: GatewayError::ContextWindowExceeded { limit: 128_000, .. } }
        ));
    }

    #[test]
    fn missing_done_marker_after_finish_reason_still_completes() {
        let mut parser = ChatCompletionParser::new(0, 128_000);
        feed(
            &mut parser,
            &[
                r#"{"choices":[{"delta":{"content":"ok"}}]}"#,
                r#"{"choices":[{"delta":{},"finish_reason":"stop"}]}"#,
            ],
        );
        let events = parser.finish();
        assert!(matches!(events.last(), Some(StreamEvent::Done { .. })));
    }

    #[test]
    fn truncated_stream_is_interruption() {
        let mut parser = ChatCompletionParser::new(0, 128_000);
        feed(&mut parser, &[r#"{"choices":[{"delta":{"content":"par"}}]}"#]);
        let events = parser.finish();
        assert!(matches!(
            &events[0],
            StreamEvent::Error { error: GatewayError::StreamInterrupted(_) }
        ));
    }
}
