use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::info;

use loom_core::errors::GatewayError;
use loom_core::provider::LlmProvider;
use loom_core::security::ApiKey;

use crate::anthropic::AnthropicProvider;
use crate::openai::OpenAiProvider;
use crate::reliable::{ReliableConfig, ReliableProvider};

/// Which back end to talk to. API keys are never stored here, only the name
/// of the environment variable holding one.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProviderConfig {
    Anthropic {
        #[serde(default)]
        model: Option<String>,
        #[serde(default = "default_anthropic_key_env")]
        api_key_env: String,
        #[serde(default)]
        base_url: Option<String>,
    },
    #[serde(rename = "openai")]
    OpenAi {
        #[serde(default)]
        model: Option<String>,
        #[serde(default = "default_openai_key_env")]
        api_key_env: String,
        #[serde(default)]
        base_url: Option<String>,
    },
}

fn default_anthropic_key_env() -> String {
    "ANTHROPIC_API_KEY".into()
}

fn default_openai_key_env() -> String {
    "OPENAI_API_KEY".into()
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self::Anthropic {
            model: None,
            api_key_env: default_anthropic_key_env(),
            base_url: None,
        }
    }
}

impl ProviderConfig {
    pub fn api_key_env(&self) -> &str {
        match self {
            Self::Anthropic { api_key_env, .. } | Self::OpenAi { api_key_env, .. } => api_key_env,
        }
    }
}

/// Build the configured provider with retry layered on top.
pub fn build_provider(
    config: &ProviderConfig,
    retry: ReliableConfig,
) -> Result<Arc<dyn LlmProvider>, GatewayError> {
    let key_env = config.api_key_env();
    let api_key = ApiKey::from_env(key_env).ok_or_else(|| {
        GatewayError::AuthenticationFailed(format!("environment variable {key_env} is not set"))
    })?;

    let inner: Arc<dyn LlmProvider> = match config {
        ProviderConfig::Anthropic { model, base_url, .. } => {
            let mut provider = AnthropicProvider::new(api_key, model.as_deref())?;
            if let Some(url) = base_url {
                provider = provider.with_base_url(url);
            }
            Arc::new(provider)
        }
        ProviderConfig::OpenAi { model, base_url, .. } => {
            let mut provider = OpenAiProvider::new(api_key, model.as_deref())?;
            if let Some(url) = base_url {
                provider = provider.with_base_url(url);
            }
            Arc::new(provider)
        }
    };

    info!(
        provider = inner.name(),
        model = inner.model(),
        max_retries = retry.max_retries,
        "provider configured"
    );
    Ok(Arc::new(ReliableProvider::new(inner, retry)))
}
