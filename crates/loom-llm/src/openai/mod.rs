mod converter;
mod parser;

pub use converter::build_request_body;
pub use parser::ChatCompletionParser;

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

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// Any server speaking the Chat Completions streaming protocol.
pub struct OpenAiProvider {
    client: Client,
    api_key: ApiKey,
    model: ResolvedModel,
    base_url: String,
}

impl OpenAiProvider {
    pub fn new(api_key: ApiKey, model: Option<&str>) -> Result<Self, GatewayError> {
        Ok(Self {
            client: http::build_client()?,
            api_key,
            model: models::resolve(&ProviderType::OpenAI, model),
            base_url: DEFAULT_BASE_URL.to_string(),
        })
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }
}

#[async_trait]
impl LlmProvider for OpenAiProvider {
    fn name(&self) -> &str {
        "openai"
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
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(self.api_key.expose())
            .header("accept", "text/event-stream")
            .json(&body);

        let bytes = http::send_streaming(request).await?;
        let parser =
            ChatCompletionParser::new(context.estimate_prompt_tokens(), self.model.context_window);
        Ok(Box::pin(SseStream::new(bytes, parser)))
    }
}
