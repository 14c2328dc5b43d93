use serde::{Deserialize, Serialize};

use crate::errors::GatewayError;
use crate::ids::ToolCallId;
use crate::messages::{AssistantMessage, FinishReason, ToolCallBlock};
use crate::tokens::TokenUsage;

/// Events emitted during LLM streaming. Ordering contract:
///
/// Start → (TextStart → TextDelta* → TextEnd | ThinkingStart → ThinkingDelta* → ThinkingEnd |
///          ToolCallStart → ToolCallDelta* → ToolCallEnd | Usage)* → Done
///
/// Error can end the stream at any point. Retry means everything received so far
/// belongs to an abandoned attempt and must be discarded.
#[derive(Clone, Debug)]
pub enum StreamEvent {
    Start,

    TextStart,
    TextDelta { delta: String },
    TextEnd { text: String },

    ThinkingStart,
    ThinkingDelta { delta: String },
    ThinkingEnd { thinking: String, signature: Option<String> },

    ToolCallStart { index: usize, tool_call_id: ToolCallId, name: String },
    ToolCallDelta { index: usize, tool_call_id: ToolCallId, arguments_delta: String },
    ToolCallEnd { index: usize, tool_call: ToolCallBlock },

    /// Cumulative usage so far. Never decreases within one attempt.
    Usage { usage: TokenUsage },

    Done { message: AssistantMessage, finish_reason: FinishReason },
    Error { error: GatewayError },
    Retry { attempt: u32, max_retries: u32, delay_ms: u64, error: GatewayErrorInfo },
}

/// Coarse phase of a response, shared by every provider.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Uploading,
    Thinking,
    Generating,
    CallingTool,
    Completed,
}

/// Lightweight error info for retry events.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GatewayErrorInfo {
    pub kind: String,
    pub message: String,
}

impl From<&GatewayError> for GatewayErrorInfo {
    fn from(e: &GatewayError) -> Self {
        Self {
            kind: e.error_kind().to_string(),
            message: e.to_string(),
        }
    }
}

impl StreamEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done { .. } | Self::Error { .. })
    }

    pub fn is_content_delta(&self) -> bool {
        matches!(
            self,
            Self::TextDelta { .. } | Self::ThinkingDelta { .. } | Self::ToolCallDelta { .. }
        )
    }

    /// The phase this event belongs to, if it marks one.
    pub fn phase(&self) -> Option<Phase> {
        match self {
            Self::Start => Some(Phase::Uploading),
            Self::ThinkingStart | Self::ThinkingDelta { .. } | Self::ThinkingEnd { .. } => {
                Some(Phase::Thinking)
            }
            Self::TextStart | Self::TextDelta { .. } | Self::TextEnd { .. } => {
                Some(Phase::Generating)
            }
            Self::ToolCallStart { .. } | Self::ToolCallDelta { .. } | Self::ToolCallEnd { .. } => {
                Some(Phase::CallingTool)
            }
            Self::Done { .. } => Some(Phase::Completed),
            Self::Usage { .. } | Self::Error { .. } | Self::Retry { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_classification() {
        let done = StreamEvent::Done {
            message: AssistantMessage::text("hi"),
            finish_reason: FinishReason::Stop,
        };
        assert!(done.is_terminal());

        let delta = StreamEvent::TextDelta { delta: "x".into() };
        assert!(!delta.is_terminal());
        assert!(delta.is_content_delta());
    }

    #[test]
    fn phases_cover_the_vocabulary() {
        assert_eq!(StreamEvent::Start.phase(), Some(Phase::Uploading));
        assert_eq!(
            StreamEvent::ThinkingDelta { delta: "hm".into() }.phase(),
            Some(Phase::Thinking)
        );
        assert_eq!(StreamEvent::TextStart.phase(), Some(Phase::Generating));
        assert_eq!(
            StreamEvent::ToolCallDelta {
                index: 0,
                tool_call_id: ToolCallId::from_raw("toolu_1"),
                arguments_delta: "{".into(),
            }
            .phase(),
            Some(Phase::CallingTool)
        );
        assert_eq!(
            StreamEvent::Usage { usage: TokenUsage::default() }.phase(),
            None
        );
    }

    #[test]
    fn error_info_from_gateway_error() {
        let err = GatewayError::RateLimited { retry_after: None };
        let info = GatewayErrorInfo::from(&err);
        assert_eq!(info.kind, "rate_limited");
        assert!(info.message.contains("rate limited"));
    }
}
