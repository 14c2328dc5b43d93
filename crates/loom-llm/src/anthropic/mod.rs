mod converter;
mod parser;

pub use converter::{build_request_body, remap_tool_call_id};
pub use parser::AnthropicParser;

use async_trait::async_trait;
use reqwest::Client;
use tracing::instrument;

use loom_core::context::LlmContext;
use loom_core::errors::GatewayError;
use loom_core::provider::{EventStream, LlmProvider, StreamOptions};
use loom_core::security::{ApiKey, ProviderType};

use crate::http;
use crate::models::{self, ResolvedModel};
use crate::sse::SseStream;

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const API_VERSION: &str = "2023-06-01";

pub struct AnthropicProvider {
    client: Client,
    api_key: ApiKey,
    model: ResolvedModel,
    base_url: String,
}

impl AnthropicProvider {
    pub fn new(api_key: ApiKey, model: Option<&str>) -> Result<Self, GatewayError> {
        Ok(Self {
            client: http::build_client()?,
            api_key,
            model: models::resolve(&ProviderType::Anthropic, model),
            base_url: DEFAULT_BASE_URL.to_string(),
        })
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }
}

#[async_trait]
impl LlmProvider for AnthropicProvider {
    fn name(&self) -> &str {
        "anthropic"
    }

    fn model(&self) -> &str {
        &self.model.id
    }

    fn context_window(&self) -> usize {
        self.model.context_window
    }

    fn supports_thinking(&self) -> bool {
        self.model.supports_thinking
    }

    fn supports_tools(&self) -> bool {
        true
    }

    #[instrument(skip(self, context, options), fields(model = %self.model.id))]
    async fn stream(
        &self,
        context: &LlmContext,
        options: &StreamOptions,
    ) -> Result<EventStream, GatewayError> {
        let body = build_request_body(context, options, &self.model.id, self.model.max_output);
        let request = self
            .client
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", self.api_key.expose())
            .header("anthropic-version", API_VERSION)
            .header("accept", "text/event-stream")
            .json(&body);

        let bytes = http::send_streaming(request).await?;
        let parser = AnthropicParser::new(context.estimate_prompt_tokens(), self.model.context_window);
        Ok(Box::pin(SseStream::new(bytes, parser)))
    }
}
