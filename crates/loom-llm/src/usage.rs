use loom_core::security::ProviderType;
use loom_core::stream::StreamEvent;
use loom_core::tokens::{estimate_text_tokens, TokenUsage};

/// Tracks usage for one response.
///
/// Provider-reported counts win when present; otherwise counts are estimated
/// from the prompt size and the text streamed so far. The reported value is a
/// running high-water mark, so it never decreases.
pub struct UsageMeter {
    provider: ProviderType,
    estimated_input: u32,
    streamed_output: String,
    reported_input: Option<(u32, u32, u32)>,
    reported_output: Option<u32>,
    high_water: TokenUsage,
    last_emitted: Option<TokenUsage>,
}

impl UsageMeter {
    pub fn new(provider: ProviderType, estimated_input: u32) -> Self {
        Self {
            provider,
            estimated_input,
            streamed_output: String::new(),
            reported_input: None,
            reported_output: None,
            high_water: TokenUsage::default(),
            last_emitted: None,
        }
    }

    pub fn observe_output(&mut self, text: &str) {
        self.streamed_output.push_str(text);
    }

    pub fn report_input(&mut self, input: u32, cache_read: u32, cache_creation: u32) {
        self.reported_input = Some((input, cache_read, cache_creation));
    }

    pub fn report_output(&mut self, output: u32) {
        self.reported_output = Some(output);
    }

    pub fn current(&mut self) -> TokenUsage {
        let (input, cache_read, cache_creation) =
            self.reported_input.unwrap_or((self.estimated_input, 0, 0));
        let candidate = TokenUsage {
            input_tokens: input,
            output_tokens: self
                .reported_output
                .unwrap_or_else(|| estimate_text_tokens(&self.streamed_output)),
            cache_read_tokens: cache_read,
            cache_creation_tokens: cache_creation,
            provider_type: self.provider.clone(),
            estimated: self.reported_input.is_none() || self.reported_output.is_none(),
        };
        self.high_water = self.high_water.max_with(&candidate);
        self.high_water.clone()
    }

    /// A usage event if anything moved since the last one.
    pub fn event(&mut self) -> Option<StreamEvent> {
        let usage = self.current();
        if self.last_emitted.as_ref() == Some(&usage) {
            return None;
        }
        self.last_emitted = Some(usage.clone());
        Some(StreamEvent::Usage { usage })
    }
}
