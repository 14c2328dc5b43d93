use serde::{Deserialize, Serialize};

use crate::messages::Message;
use crate::security::ProviderType;
use crate::tools::ToolDefinition;

/// Per-response token usage, either reported by the provider or estimated.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u32,
    pub output_tokens: u32,
    #[serde(default)]
    pub cache_read_tokens: u32,
    #[serde(default)]
    pub cache_creation_tokens: u32,
    #[serde(default)]
    pub provider_type: ProviderType,
    /// True when the counts were derived from text length, not reported.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub estimated: bool,
}

impl TokenUsage {
    /// Field-wise maximum of the counts; provider and `estimated` come from
    /// `other`. Keeps a cumulative counter from ever moving backwards.
    pub fn max_with(&self, other: &TokenUsage) -> TokenUsage {
        TokenUsage {
            input_tokens: self.input_tokens.max(other.input_tokens),
            output_tokens: self.output_tokens.max(other.output_tokens),
            cache_read_tokens: self.cache_read_tokens.max(other.cache_read_tokens),
            cache_creation_tokens: self.cache_creation_tokens.max(other.cache_creation_tokens),
            provider_type: other.provider_type.clone(),
            estimated: other.estimated,
        }
    }

    /// Tokens occupying the context window for this request.
    pub fn context_window_tokens(&self) -> u32 {
        match self.provider_type {
            ProviderType::Anthropic => {
                self.input_tokens + self.cache_read_tokens + self.cache_creation_tokens
            }
            ProviderType::OpenAI | ProviderType::Mock => self.input_tokens,
        }
    }
}

/// Session-level accumulated totals.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct AccumulatedTokens {
    pub total_input_tokens: u64,
    pub total_output_tokens: u64,
    pub total_cache_read_tokens: u64,
    pub total_cache_creation_tokens: u64,
    pub last_context_tokens: u32,
    pub response_count: u32,
}

impl AccumulatedTokens {
    pub fn accumulate(&mut self, usage: &TokenUsage) {
        self.total_input_tokens += u64::from(usage.input_tokens);
        self.total_output_tokens += u64::from(usage.output_tokens);
        self.total_cache_read_tokens += u64::from(usage.cache_read_tokens);
        self.total_cache_creation_tokens += u64::from(usage.cache_creation_tokens);
        self.last_context_tokens = usage.context_window_tokens();
        self.response_count += 1;
    }
}

// --- Estimation ---
//
// Rough chars/4 heuristic. Only threshold crossings depend on it.

const MESSAGE_OVERHEAD_TOKENS: u32 = 4;
const TOOL_OVERHEAD_TOKENS: u32 = 8;

pub fn estimate_text_tokens(text: &str) -> u32 {
    u32::try_from(text.len().div_ceil(4)).unwrap_or(u32::MAX)
}

pub fn estimate_message_tokens(message: &Message) -> u32 {
    let body = match message {
        Message::Assistant(a) => a
            .content
            .iter()
            .map(|block| match block {
                crate::messages::AssistantContent::Text { text } => estimate_text_tokens(text),
                crate::messages::AssistantContent::Thinking { text, .. } => {
                    estimate_text_tokens(text)
                }
                crate::messages::AssistantContent::ToolCall(tc) => {
                    estimate_text_tokens(&tc.name)
                        + estimate_text_tokens(&tc.arguments.to_string())
                }
            })
            .sum(),
        other => estimate_text_tokens(&other.plain_text()),
    };
    body + MESSAGE_OVERHEAD_TOKENS
}

pub fn estimate_tool_tokens(tools: &[ToolDefinition]) -> u32 {
    tools
        .iter()
        .map(|t| {
            estimate_text_tokens(&t.name)
                + estimate_text_tokens(&t.description)
                + estimate_text_tokens(&t.parameters.to_string())
                + TOOL_OVERHEAD_TOKENS
        })
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn max_with_never_decreases() {
        let a = TokenUsage {
            input_tokens: 100,
            output_tokens: 40,
            ..Default::default()
        };
        let b = TokenUsage {
            input_tokens: 90,
            output_tokens: 55,
            ..Default::default()
        };
        let merged = a.max_with(&b);
        assert_eq!(merged.input_tokens, 100);
        assert_eq!(merged.output_tokens, 55);
    }

    #[test]
    fn anthropic_context_window_includes_cache() {
        let usage = TokenUsage {
            input_tokens: 1000,
            output_tokens: 500,
            cache_read_tokens: 2000,
            cache_creation_tokens: 3000,
            provider_type: ProviderType::Anthropic,
            estimated: false,
        };
        assert_eq!(usage.context_window_tokens(), 6000);

        let openai = TokenUsage {
            input_tokens: 5000,
            provider_type: ProviderType::OpenAI,
            ..Default::default()
        };
        assert_eq!(openai.context_window_tokens(), 5000);
    }

    #[test]
    fn accumulated_tokens_multi_response() {
        let mut acc = AccumulatedTokens::default();
        acc.accumulate(&TokenUsage {
            input_tokens: 100,
            output_tokens: 50,
            cache_read_tokens: 200,
            ..Default::default()
        });
        acc.accumulate(&TokenUsage {
            input_tokens: 150,
            output_tokens: 75,
            cache_read_tokens: 200,
            cache_creation_tokens: 50,
            ..Default::default()
        });
        assert_eq!(acc.total_input_tokens, 250);
        assert_eq!(acc.total_output_tokens, 125);
        assert_eq!(acc.total_cache_read_tokens, 400);
        assert_eq!(acc.total_cache_creation_tokens, 50);
        assert_eq!(acc.last_context_tokens, 400);
        assert_eq!(acc.response_count, 2);
    }

    #[test]
    fn text_estimate_rounds_up() {
        assert_eq!(estimate_text_tokens(""), 0);
        assert_eq!(estimate_text_tokens("abc"), 1);
        assert_eq!(estimate_text_tokens("abcdefgh"), 2);
        assert_eq!(estimate_text_tokens("abcdefghi"), 3);
    }

    #[test]
    fn message_estimate_adds_overhead() {
        let msg = Message::user_text("abcdefgh");
        assert_eq!(estimate_message_tokens(&msg), 2 + MESSAGE_OVERHEAD_TOKENS);
    }

    #[test]
    fn tool_estimate_grows_with_schema() {
        let small = ToolDefinition {
            name: "A".into(),
            description: "d".into(),
            parameters: serde_json::json!({}),
        };
        let large = ToolDefinition {
            name: "A".into(),
            description: "d".repeat(400),
            parameters: serde_json::json!({"type": "object"}),
        };
        assert!(estimate_tool_tokens(&[large]) > estimate_tool_tokens(&[small]));
    }
}
