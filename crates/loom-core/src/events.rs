use serde::{Deserialize, Serialize};

use crate::ids::{AgentId, SessionId, ToolCallId};
use crate::tokens::{AccumulatedTokens, TokenUsage};

/// How a run ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeKind {
    Completed,
    Interrupted,
    Failed,
}

/// Lifecycle events emitted while a session runs. Every variant carries the
/// session and agent it belongs to so one consumer can multiplex several
/// sessions, including sub-agents.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    TurnStart {
        session_id: SessionId,
        agent_id: AgentId,
        step: u32,
    },

    TextDelta {
        session_id: SessionId,
        agent_id: AgentId,
        delta: String,
    },

    ThinkingDelta {
        session_id: SessionId,
        agent_id: AgentId,
        delta: String,
    },

    /// The provider is retrying; deltas received since the last TurnStart or
    /// Retry are void.
    Retry {
        session_id: SessionId,
        agent_id: AgentId,
        attempt: u32,
        delay_ms: u64,
        error: String,
    },

    ToolCallStart {
        session_id: SessionId,
        agent_id: AgentId,
        tool_call_id: ToolCallId,
        tool_name: String,
        arguments: serde_json::Value,
    },

    ToolCallResult {
        session_id: SessionId,
        agent_id: AgentId,
        tool_call_id: ToolCallId,
        tool_name: String,
        result_preview: String,
        is_error: bool,
        truncated: bool,
        duration_ms: u64,
    },

    CompactionStarted {
        session_id: SessionId,
        agent_id: AgentId,
        tokens_before: u32,
    },

    CompactionComplete {
        session_id: SessionId,
        agent_id: AgentId,
        tokens_before: u32,
        tokens_after: u32,
        removed_messages: usize,
    },

    PlanApprovalRequested {
        session_id: SessionId,
        agent_id: AgentId,
        plan: String,
    },

    PlanDecided {
        session_id: SessionId,
        agent_id: AgentId,
        approved: bool,
    },

    SubagentSpawned {
        session_id: SessionId,
        agent_id: AgentId,
        child_session_id: SessionId,
        child_agent_id: AgentId,
        profile: String,
    },

    SubagentComplete {
        session_id: SessionId,
        agent_id: AgentId,
        child_session_id: SessionId,
        child_agent_id: AgentId,
        outcome: OutcomeKind,
    },

    Interrupted {
        session_id: SessionId,
        agent_id: AgentId,
    },

    Error {
        session_id: SessionId,
        agent_id: AgentId,
        kind: String,
        message: String,
    },

    TurnFinish {
        session_id: SessionId,
        agent_id: AgentId,
        outcome: OutcomeKind,
        #[serde(skip_serializing_if = "Option::is_none")]
        result: Option<String>,
        steps: u32,
        #[serde(skip_serializing_if = "Option::is_none")]
        last_usage: Option<TokenUsage>,
        totals: AccumulatedTokens,
    },
}

impl AgentEvent {
    pub fn session_id(&self) -> &SessionId {
        match self {
            Self::TurnStart { session_id, .. }
            | Self::TextDelta { session_id, .. }
            | Self::ThinkingDelta { session_id, .. }
            | Self::Retry { session_id, .. }
            | Self::ToolCallStart { session_id, .. }
            | Self::ToolCallResult { session_id, .. }
            | Self::CompactionStarted { session_id, .. }
            | Self::CompactionComplete { session_id, .. }
            | Self::PlanApprovalRequested { session_id, .. }
            | Self::PlanDecided { session_id, .. }
            | Self::SubagentSpawned { session_id, .. }
            | Self::SubagentComplete { session_id, .. }
            | Self::Interrupted { session_id, .. }
            | Self::Error { session_id, .. }
            | Self::TurnFinish { session_id, .. } => session_id,
        }
    }

    pub fn agent_id(&self) -> &AgentId {
        match self {
            Self::TurnStart { agent_id, .. }
            | Self::TextDelta { agent_id, .. }
            | Self::ThinkingDelta { agent_id, .. }
            | Self::Retry { agent_id, .. }
            | Self::ToolCallStart { agent_id, .. }
            | Self::ToolCallResult { agent_id, .. }
            | Self::CompactionStarted { agent_id, .. }
            | Self::CompactionComplete { agent_id, .. }
            | Self::PlanApprovalRequested { agent_id, .. }
            | Self::PlanDecided { agent_id, .. }
            | Self::SubagentSpawned { agent_id, .. }
            | Self::SubagentComplete { agent_id, .. }
            | Self::Interrupted { agent_id, .. }
            | Self::Error { agent_id, .. }
            | Self::TurnFinish { agent_id, .. } => agent_id,
        }
    }

    pub fn event_type(&self) -> &'static str {
        match self {
            Self::TurnStart { .. } => "turn_start",
            Self::TextDelta { .. } => "text_delta",
            Self::ThinkingDelta { .. } => "thinking_delta",
            Self::Retry { .. } => "retry",
            Self::ToolCallStart { .. } => "tool_call_start",
            Self::ToolCallResult { .. } => "tool_call_result",
            Self::CompactionStarted { .. } => "compaction_started",
            Self::CompactionComplete { .. } => "compaction_complete",
            Self::PlanApprovalRequested { .. } => "plan_approval_requested",
            Self::PlanDecided { .. } => "plan_decided",
            Self::SubagentSpawned { .. } => "subagent_spawned",
            Self::SubagentComplete { .. } => "subagent_complete",
            Self::Interrupted { .. } => "interrupted",
            Self::Error { .. } => "error",
            Self::TurnFinish { .. } => "turn_finish",
        }
    }
}
