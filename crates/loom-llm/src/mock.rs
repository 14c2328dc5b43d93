use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use serde_json::Value;

use loom_core::context::LlmContext;
use loom_core::errors::GatewayError;
use loom_core::ids::ToolCallId;
use loom_core::messages::{AssistantContent, AssistantMessage, FinishReason, ToolCallBlock};
use loom_core::provider::{EventStream, LlmProvider, StreamOptions};
use loom_core::security::ProviderType;
use loom_core::stream::StreamEvent;
use loom_core::tokens::{estimate_text_tokens, TokenUsage};

/// Pre-programmed responses for deterministic testing without API calls.
pub enum MockResponse {
    /// Yield a sequence of events.
    Stream(Vec<StreamEvent>),
    /// Yield the events, then never finish.
    Stall(Vec<StreamEvent>),
    /// Return an error from the `stream()` call itself.
    Error(GatewayError),
    /// Wait a duration, then resolve the inner response.
    Delay(Duration, Box<MockResponse>),
}

impl MockResponse {
    pub fn stream_text(text: &str) -> Self {
        let mut message = AssistantMessage::text(text);
        message.usage = Some(mock_usage(text));
        Self::Stream(vec![
            StreamEvent::Start,
            StreamEvent::TextStart,
            StreamEvent::TextDelta { delta: text.to_string() },
            StreamEvent::TextEnd { text: text.to_string() },
            StreamEvent::Usage { usage: mock_usage(text) },
            StreamEvent::Done {
                message,
                finish_reason: FinishReason::Stop,
            },
        ])
    }

    /// A response requesting the given tool calls, in order.
    pub fn tool_calls(calls: Vec<(&str, Value)>) -> Self {
        let mut events = vec![StreamEvent::Start];
        let mut content = Vec::with_capacity(calls.len());
        for (index, (name, arguments)) in calls.into_iter().enumerate() {
            let block = ToolCallBlock {
                id: ToolCallId::new(),
                name: name.to_string(),
                arguments,
            };
            events.push(StreamEvent::ToolCallStart {
                index,
                tool_call_id: block.id.clone(),
                name: block.name.clone(),
            });
            events.push(StreamEvent::ToolCallDelta {
                index,
                tool_call_id: block.id.clone(),
                arguments_delta: block.arguments.to_string(),
            });
            events.push(StreamEvent::ToolCallEnd {
                index,
                tool_call: block.clone(),
            });
            content.push(AssistantContent::ToolCall(block));
        }
        events.push(StreamEvent::Done {
            message: AssistantMessage {
                content,
                usage: Some(mock_usage("")),
                finish_reason: Some(FinishReason::ToolCalls),
            },
            finish_reason: FinishReason::ToolCalls,
        });
        Self::Stream(events)
    }

    /// A text response that ends for the given reason.
    pub fn finished(text: &str, finish_reason: FinishReason) -> Self {
        let mut message = AssistantMessage::text(text);
        message.finish_reason = Some(finish_reason);
        Self::Stream(vec![
            StreamEvent::Start,
            StreamEvent::TextDelta { delta: text.to_string() },
            StreamEvent::Done {
                message,
                finish_reason,
            },
        ])
    }

    /// A stream that starts and then fails.
    pub fn stream_error(error: GatewayError) -> Self {
        Self::Stream(vec![StreamEvent::Start, StreamEvent::Error { error }])
    }

    pub fn delayed(delay: Duration, inner: MockResponse) -> Self {
        Self::Delay(delay, Box::new(inner))
    }
}

fn mock_usage(text: &str) -> TokenUsage {
    TokenUsage {
        input_tokens: 10,
        output_tokens: estimate_text_tokens(text),
        provider_type: ProviderType::Mock,
        ..Default::default()
    }
}

/// Provider that hands out pre-programmed responses in sequence and records
/// every request it receives.
pub struct MockProvider {
    responses: Mutex<VecDeque<MockResponse>>,
    requests: Mutex<Vec<LlmContext>>,
    call_count: AtomicUsize,
    context_window: usize,
}

impl MockProvider {
    pub fn new(responses: Vec<MockResponse>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            requests: Mutex::new(Vec::new()),
            call_count: AtomicUsize::new(0),
            context_window: 200_000,
        }
    }

    pub fn with_context_window(mut self, tokens: usize) -> Self {
        self.context_window = tokens;
        self
    }

    pub fn push(&self, response: MockResponse) {
        self.responses.lock().push_back(response);
    }

    pub fn call_count(&self) -> usize {
        self.call_count.load(Ordering::Relaxed)
    }

    /// Every context passed to `stream()`, oldest first.
    pub fn requests(&self) -> Vec<LlmContext> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl LlmProvider for MockProvider {
    fn name(&self) -> &str {
        "mock"
    }

    fn model(&self) -> &str {
        "mock-model"
    }

    fn context_window(&self) -> usize {
        self.context_window
    }

    fn supports_thinking(&self) -> bool {
        true
    }

    fn supports_tools(&self) -> bool {
        true
    }

    async fn stream(
        &self,
        context: &LlmContext,
        options: &StreamOptions,
    ) -> Result<EventStream, GatewayError> {
        let idx = self.call_count.fetch_add(1, Ordering::Relaxed);
        self.requests.lock().push(context.clone());

        let Some(mut current) = self.responses.lock().pop_front() else {
            return Err(GatewayError::InvalidRequest(format!(
                "MockProvider: no response configured for call {idx}"
            )));
        };

        loop {
            match current {
                MockResponse::Stream(events) => return Ok(Box::pin(stream::iter(events))),
                MockResponse::Stall(events) => {
                    return Ok(Box::pin(stream::iter(events).chain(stream::pending())))
                }
                MockResponse::Error(e) => return Err(e),
                MockResponse::Delay(duration, inner) => {
                    match &options.cancel {
                        Some(cancel) => tokio::select! {
                            _ = cancel.cancelled() => return Err(GatewayError::Cancelled),
                            _ = tokio::time::sleep(duration) => {}
                        },
                        None => tokio::time::sleep(duration).await,
                    }
                    current = *inner;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio_util::sync::CancellationToken;

    #[tokio::test]
    async fn text_response() {
        let mock = MockProvider::new(vec![MockResponse::stream_text("hello world")]);
        let stream = mock
            .stream(&LlmContext::empty(), &StreamOptions::default())
            .await
            .unwrap();
        let events: Vec<StreamEvent> = stream.collect().await;

        assert!(matches!(events[0], StreamEvent::Start));
        assert!(matches!(&events[2], StreamEvent::TextDelta { delta } if delta == "hello world"));
        assert!(matches!(events.last(), Some(StreamEvent::Done { .. })));
    }

    #[tokio::test]
    async fn tool_call_response() {
        let mock = MockProvider::new(vec![MockResponse::tool_calls(vec![
            ("Read", json!({"file_path": "/a"})),
            ("Glob", json!({"pattern": "*"})),
        ])]);
        let events: Vec<StreamEvent> = mock
            .stream(&LlmContext::empty(), &StreamOptions::default())
            .await
            .unwrap()
            .collect()
            .await;
        let Some(StreamEvent::Done { message, finish_reason }) = events.last() else {
            panic!("expected Done");
        };
        assert_eq!(*finish_reason, FinishReason::ToolCalls);
        assert_eq!(message.tool_calls().len(), 2);
    }

    #[tokio::test]
    async fn sequential_then_exhausted() {
        let mock = MockProvider::new(vec![MockResponse::stream_text("first")]);
        let ctx = LlmContext::empty();
        assert!(mock.stream(&ctx, &StreamOptions::default()).await.is_ok());
        assert!(mock.stream(&ctx, &StreamOptions::default()).await.is_err());
        assert_eq!(mock.call_count(), 2);
        assert_eq!(mock.requests().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn delay_observes_cancellation() {
        let mock = MockProvider::new(vec![MockResponse::delayed(
            Duration::from_secs(60),
            MockResponse::stream_text("late"),
        )]);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            trigger.cancel();
        });
        let result = mock
            .stream(&LlmContext::empty(), &StreamOptions::default().with_cancel(cancel))
            .await;
        assert!(matches!(result, Err(GatewayError::Cancelled)));
    }

    #[tokio::test(start_paused = true)]
    async fn delayed_error() {
        let mock = MockProvider::new(vec![MockResponse::delayed(
            Duration::from_millis(20),
            MockResponse::Error(GatewayError::RateLimited { retry_after: None }),
        )]);
        let result = mock.stream(&LlmContext::empty(), &StreamOptions::default()).await;
        assert!(matches!(result, Err(GatewayError::RateLimited { .. })));
    }
}
