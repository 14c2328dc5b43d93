pub mod compaction;
pub mod reminders;

use serde::{Deserialize, Serialize};

use loom_core::context::{LlmContext, SystemBlock, SystemBlockLabel};
use loom_core::messages::{Message, SystemKind};
use loom_core::session::Session;
use loom_core::tokens::estimate_tool_tokens;
use loom_core::tools::ToolDefinition;

pub use compaction::{compact, CompactionOutcome};

/// Core system prompt.
pub const CORE_PROMPT: &str = include_str!("../../prompts/core.txt");

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextConfig {
    /// Overrides the provider's context window when set.
    pub context_window: Option<usize>,
    /// Fraction of the window at which compaction starts.
    pub compact_ratio: f64,
    /// Tokens held back for the model's response.
    pub reserved_output_tokens: u32,
    /// User turns kept verbatim by compaction.
    pub keep_recent_turns: usize,
    /// Step at which an empty todo list triggers a reminder.
    pub todo_reminder_step: u32,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            context_window: None,
            compact_ratio: 0.8,
            reserved_output_tokens: 8192,
            keep_recent_turns: 2,
            todo_reminder_step: 3,
        }
    }
}

/// Composes the request for each step and decides when history must shrink.
#[derive(Clone, Debug)]
pub struct ContextManager {
    config: ContextConfig,
    profile_prompt: Option<String>,
}

impl ContextManager {
    pub fn new(config: ContextConfig) -> Self {
        Self {
            config,
            profile_prompt: None,
        }
    }

    /// Extra instructions appended after the core prompt, used by sub-agents.
    pub fn with_profile_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.profile_prompt = Some(prompt.into());
        self
    }

    pub fn config(&self) -> &ContextConfig {
        &self.config
    }

    pub fn context_window(&self, provider_window: usize) -> usize {
        self.config.context_window.unwrap_or(provider_window)
    }

    /// Build the request for the next model call. Reminders are appended as
    /// one transient system message and never stored in the session.
    pub fn build(&self, session: &Session, tools: Vec<ToolDefinition>, reminders: &[String]) -> LlmContext {
        let mut system_blocks = vec![
            SystemBlock::new(SystemBlockLabel::CorePrompt, CORE_PROMPT.trim_end()),
            SystemBlock::new(
                SystemBlockLabel::WorkingDirectory,
                format!("Current working directory: {}", session.working_directory.display()),
            ),
        ];
        if let Some(profile) = &self.profile_prompt {
            system_blocks.push(SystemBlock::new(SystemBlockLabel::AgentProfile, profile.clone()));
        }

        let mut messages = session.context_messages();
        if !reminders.is_empty() {
            messages.push(Message::system(SystemKind::Reminder, reminders.join("\n\n")));
        }

        LlmContext {
            messages,
            system_blocks,
            tools,
            working_directory: session.working_directory.clone(),
        }
    }

    /// Message tokens plus tool-schema tokens plus the reserved output budget.
    pub fn estimate(&self, session: &Session, tools: &[ToolDefinition]) -> u32 {
        session
            .message_token_estimate()
            .saturating_add(estimate_tool_tokens(tools))
            .saturating_add(self.config.reserved_output_tokens)
    }

    pub fn threshold(&self, provider_window: usize) -> u32 {
        let window = self.context_window(provider_window) as f64;
        (window * self.config.compact_ratio.clamp(0.0, 1.0)) as u32
    }

    pub fn needs_compaction(&self, session: &Session, tools: &[ToolDefinition], provider_window: usize) -> bool {
        self.estimate(session, tools) > self.threshold(provider_window)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tool(name: &str) -> ToolDefinition {
        ToolDefinition {
            name: name.into(),
            description: "A tool".into(),
            parameters: serde_json::json!({"type": "object"}),
        }
    }

    #[test]
    fn build_orders_blocks_and_appends_reminders() {
        let mut session = Session::new("/work");
        session.append(Message::user_text("hello"));
        let cm = ContextManager::new(ContextConfig::default()).with_profile_prompt("You explore.");

        let ctx = cm.build(&session, vec![tool("Read")], &["Plan mode is active.".to_string()]);

        let labels: Vec<_> = ctx.system_blocks.iter().map(|b| b.label.clone()).collect();
        assert_eq!(
            labels,
            vec![
                SystemBlockLabel::CorePrompt,
                SystemBlockLabel::WorkingDirectory,
                SystemBlockLabel::AgentProfile
            ]
        );
        assert!(ctx.system_blocks[1].content.ends_with("/work"));
        assert_eq!(ctx.messages.len(), 2);
        assert!(matches!(
            &ctx.messages[1],
            Message::System(s) if s.kind == SystemKind::Reminder && s.text == "Plan mode is active."
        ));
        assert_eq!(session.messages.len(), 1);
        assert_eq!(ctx.tools.len(), 1);
    }

    #[test]
    fn no_reminder_message_when_none_pending() {
        let mut session = Session::new("/work");
        session.append(Message::user_text("hello"));
        let ctx = ContextManager::new(ContextConfig::default()).build(&session, vec![], &[]);
        assert_eq!(ctx.messages.len(), 1);
    }

    #[test]
    fn estimate_includes_tools_and_reserve() {
        let mut session = Session::new("/work");
        session.append(Message::user_text("x".repeat(400)));
        let cm = ContextManager::new(ContextConfig {
            reserved_output_tokens: 1000,
            ..Default::default()
        });
        let tools = vec![tool("Read")];
        let expected = session.message_token_estimate() + estimate_tool_tokens(&tools) + 1000;
        assert_eq!(cm.estimate(&session, &tools), expected);
    }

    #[test]
    fn threshold_uses_override_and_ratio() {
        let cm = ContextManager::new(ContextConfig {
            context_window: Some(10_000),
            compact_ratio: 0.5,
            ..Default::default()
        });
        assert_eq!(cm.context_window(200_000), 10_000);
        assert_eq!(cm.threshold(200_000), 5_000);

        let defaults = ContextManager::new(ContextConfig::default());
        assert_eq!(defaults.threshold(100_000), 80_000);
    }

    #[test]
    fn compaction_trigger() {
        let mut session = Session::new("/work");
        session.append(Message::user_text("y".repeat(4000)));
        let cm = ContextManager::new(ContextConfig {
            reserved_output_tokens: 0,
            ..Default::default()
        });
        assert!(cm.needs_compaction(&session, &[], 1000));
        assert!(!cm.needs_compaction(&session, &[], 100_000));
    }

    #[test]
    fn config_serde_defaults() {
        let config: ContextConfig = serde_json::from_str(r#"{"keep_recent_turns": 4}"#).unwrap();
        assert_eq!(config.keep_recent_turns, 4);
        assert_eq!(config.reserved_output_tokens, 8192);
        assert!(config.context_window.is_none());
    }
}
