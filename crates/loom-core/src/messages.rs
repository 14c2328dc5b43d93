use serde::{Deserialize, Serialize};

use crate::ids::ToolCallId;
use crate::tokens::TokenUsage;

/// One contribution to a conversation, tagged by role.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "snake_case")]
pub enum Message {
    System(SystemMessage),
    User(UserMessage),
    Assistant(AssistantMessage),
    #[serde(rename = "tool")]
    ToolResult(ToolResultMessage),
}

/// Engine-authored text: compaction summaries, reminders, notices.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SystemMessage {
    pub kind: SystemKind,
    pub text: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SystemKind {
    Summary,
    Reminder,
    Interrupted,
    Notice,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UserMessage {
    pub content: Vec<UserContent>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AssistantMessage {
    pub content: Vec<AssistantContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<TokenUsage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<FinishReason>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToolResultMessage {
    pub tool_call_id: ToolCallId,
    pub content: Vec<ToolResultContent>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_error: bool,
}

// --- Content types ---

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum UserContent {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "image")]
    Image { mime_type: String, data: String },
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum AssistantContent {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "thinking")]
    Thinking {
        text: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        signature: Option<String>,
    },
    #[serde(rename = "tool_call")]
    ToolCall(ToolCallBlock),
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ToolResultContent {
    #[serde(rename = "text")]
    Text { text: String },
}

/// A requested tool invocation.
///
/// `arguments` is whatever the model produced. When the streamed fragments did
/// not concatenate into valid JSON the raw text is kept as a JSON string, and
/// the dispatcher rejects it at invocation time.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ToolCallBlock {
    pub id: ToolCallId,
    pub name: String,
    pub arguments: serde_json::Value,
}

/// Why a model response ended, normalized across providers.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    Length,
    ToolCalls,
    ContentFilter,
}

impl FinishReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stop => "stop",
            Self::Length => "length",
            Self::ToolCalls => "tool_calls",
            Self::ContentFilter => "content_filter",
        }
    }
}

// --- Convenience constructors ---

impl Message {
    pub fn user_text(text: impl Into<String>) -> Self {
        Message::User(UserMessage::text(text))
    }

    pub fn assistant_text(text: impl Into<String>) -> Self {
        Message::Assistant(AssistantMessage::text(text))
    }

    pub fn system(kind: SystemKind, text: impl Into<String>) -> Self {
        Message::System(SystemMessage {
            kind,
            text: text.into(),
        })
    }

    pub fn tool_result(tool_call_id: ToolCallId, text: impl Into<String>, is_error: bool) -> Self {
        Message::ToolResult(ToolResultMessage {
            tool_call_id,
            content: vec![ToolResultContent::Text { text: text.into() }],
            is_error,
        })
    }

    pub fn role(&self) -> &'static str {
        match self {
            Self::System(_) => "system",
            Self::User(_) => "user",
            Self::Assistant(_) => "assistant",
            Self::ToolResult(_) => "tool",
        }
    }

    pub fn is_summary(&self) -> bool {
        matches!(self, Self::System(SystemMessage { kind: SystemKind::Summary, .. }))
    }

    /// True for user-authored input (not tool results or engine notices).
    pub fn is_user_input(&self) -> bool {
        matches!(self, Self::User(_))
    }

    /// Flattened text, used for summaries and token estimation.
    pub fn plain_text(&self) -> String {
        match self {
            Self::System(s) => s.text.clone(),
            Self::User(u) => u
                .content
                .iter()
                .filter_map(|c| match c {
                    UserContent::Text { text } => Some(text.as_str()),
                    UserContent::Image { .. } => None,
                })
                .collect::<Vec<_>>()
                .join("\n"),
            Self::Assistant(a) => {
                let mut parts: Vec<String> = Vec::new();
                for block in &a.content {
                    match block {
                        AssistantContent::Text { text } => parts.push(text.clone()),
                        AssistantContent::Thinking { .. } => {}
                        AssistantContent::ToolCall(tc) => {
                            parts.push(format!("[tool call {}: {}]", tc.name, tc.arguments))
                        }
                    }
                }
                parts.join("\n")
            }
            Self::ToolResult(r) => r.text_content(),
        }
    }
}

impl SystemMessage {
    /// Text as presented to a model that has no mid-conversation system role.
    pub fn prompt_text(&self) -> String {
        match self.kind {
            SystemKind::Summary => {
                format!("<conversation-summary>\n{}\n</conversation-summary>", self.text)
            }
            SystemKind::Reminder => format!("<system-reminder>\n{}\n</system-reminder>", self.text),
            SystemKind::Interrupted | SystemKind::Notice => self.text.clone(),
        }
    }
}

impl UserMessage {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            content: vec![UserContent::Text { text: text.into() }],
        }
    }
}

impl AssistantMessage {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            content: vec![AssistantContent::Text { text: text.into() }],
            usage: None,
            finish_reason: Some(FinishReason::Stop),
        }
    }

    pub fn tool_calls(&self) -> Vec<&ToolCallBlock> {
        self.content
            .iter()
            .filter_map(|c| match c {
                AssistantContent::ToolCall(tc) => Some(tc),
                _ => None,
            })
            .collect()
    }

    pub fn text_content(&self) -> String {
        self.content
            .iter()
            .filter_map(|c| match c {
                AssistantContent::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("")
    }

    pub fn has_tool_calls(&self) -> bool {
        self.content
            .iter()
            .any(|c| matches!(c, AssistantContent::ToolCall(_)))
    }
}

impl ToolResultMessage {
    pub fn text_content(&self) -> String {
        self.content
            .iter()
            .map(|c| match c {
                ToolResultContent::Text { text } => text.as_str(),
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}
