use loom_core::security::ProviderType;

/// Capabilities of a known model.
#[derive(Clone, Debug)]
pub struct ModelInfo {
    pub id: &'static str,
    pub provider: ProviderType,
    pub display_name: &'static str,
    pub context_window: usize,
    pub max_output: u32,
    pub supports_thinking: bool,
}

pub static CLAUDE_OPUS_4_6: ModelInfo = ModelInfo {
    id: "claude-opus-4-6",
    provider: ProviderType::Anthropic,
    display_name: "Claude Opus 4.6",
    context_window: 200_000,
    max_output: 32_000,
    supports_thinking: true,
};

pub static CLAUDE_SONNET_4_5: ModelInfo = ModelInfo {
    id: "claude-sonnet-4-5-20250929",
    provider: ProviderType::Anthropic,
    display_name: "Claude Sonnet 4.5",
    context_window: 200_000,
    max_output: 64_000,
    supports_thinking: true,
};

pub static CLAUDE_HAIKU_4_5: ModelInfo = ModelInfo {
    id: "claude-haiku-4-5-20251001",
    provider: ProviderType::Anthropic,
    display_name: "Claude Haiku 4.5",
    context_window: 200_000,
    max_output: 64_000,
    supports_thinking: true,
};

pub static GPT_4_1: ModelInfo = ModelInfo {
    id: "gpt-4.1",
    provider: ProviderType::OpenAI,
    display_name: "GPT-4.1",
    context_window: 1_047_576,
    max_output: 32_768,
    supports_thinking: false,
};

pub static GPT_4O: ModelInfo = ModelInfo {
    id: "gpt-4o",
    provider: ProviderType::OpenAI,
    display_name: "GPT-4o",
    context_window: 128_000,
    max_output: 16_384,
    supports_thinking: false,
};

pub static O4_MINI: ModelInfo = ModelInfo {
    id: "o4-mini",
    provider: ProviderType::OpenAI,
    display_name: "o4-mini",
    context_window: 200_000,
    max_output: 100_000,
    supports_thinking: true,
};

pub static ALL_MODELS: &[&ModelInfo] = &[
    &CLAUDE_OPUS_4_6,
    &CLAUDE_SONNET_4_5,
    &CLAUDE_HAIKU_4_5,
    &GPT_4_1,
    &GPT_4O,
    &O4_MINI,
];

/// Window assumed for models missing from the catalog (e.g. local
/// OpenAI-compatible servers).
const UNKNOWN_CONTEXT_WINDOW: usize = 128_000;
const UNKNOWN_MAX_OUTPUT: u32 = 8_192;

pub fn find_model(id: &str) -> Option<&'static ModelInfo> {
    ALL_MODELS.iter().copied().find(|m| m.id == id)
}

pub fn default_model(provider: &ProviderType) -> &'static ModelInfo {
    match provider {
        ProviderType::OpenAI => &GPT_4_1,
        ProviderType::Anthropic | ProviderType::Mock => &CLAUDE_SONNET_4_5,
    }
}

/// The model a provider will talk to: catalog data when known, conservative
/// limits otherwise.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolvedModel {
    pub id: String,
    pub context_window: usize,
    pub max_output: u32,
    pub supports_thinking: bool,
}

pub fn resolve(provider: &ProviderType, id: Option<&str>) -> ResolvedModel {
    let Some(id) = id else {
        return ResolvedModel::from(default_model(provider));
    };
    match find_model(id) {
        Some(info) => ResolvedModel::from(info),
        None => ResolvedModel {
            id: id.to_string(),
            context_window: UNKNOWN_CONTEXT_WINDOW,
            max_output: UNKNOWN_MAX_OUTPUT,
            supports_thinking: false,
        },
    }
}

impl From<&ModelInfo> for ResolvedModel {
    fn from(info: &ModelInfo) -> Self {
        Self {
            id: info.id.to_string(),
            context_window: info.context_window,
            max_output: info.max_output,
            supports_thinking: info.supports_thinking,
        }
    }
}
