use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::messages::Message;
use crate::tokens::{estimate_text_tokens, estimate_tool_tokens};
use crate::tools::ToolDefinition;

/// The complete request sent to a provider.
#[derive(Clone, Debug)]
pub struct LlmContext {
    pub messages: Vec<Message>,
    pub system_blocks: Vec<SystemBlock>,
    pub tools: Vec<ToolDefinition>,
    pub working_directory: PathBuf,
}

impl LlmContext {
    /// Create an empty context (useful for testing).
    pub fn empty() -> Self {
        Self {
            messages: Vec::new(),
            system_blocks: Vec::new(),
            tools: Vec::new(),
            working_directory: PathBuf::from("/tmp"),
        }
    }

    /// All system blocks joined, in order.
    pub fn system_prompt(&self) -> String {
        self.system_blocks
            .iter()
            .map(|b| b.content.as_str())
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    pub fn estimate_prompt_tokens(&self) -> u32 {
        let system: u32 = self
            .system_blocks
            .iter()
            .map(|b| estimate_text_tokens(&b.content))
            .sum();
        let messages: u32 = self
            .messages
            .iter()
            .map(crate::tokens::estimate_message_tokens)
            .sum();
        system + messages + estimate_tool_tokens(&self.tools)
    }
}

/// A labelled piece of the system prompt.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SystemBlock {
    pub content: String,
    pub label: SystemBlockLabel,
}

impl SystemBlock {
    pub fn new(label: SystemBlockLabel, content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            label,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SystemBlockLabel {
    CorePrompt,
    WorkingDirectory,
    AgentProfile,
    Custom(String),
}
