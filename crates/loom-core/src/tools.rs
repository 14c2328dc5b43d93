use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::files::{FileTrackError, FileTracker};
use crate::ids::{AgentId, SessionId};
use crate::session::{SessionMode, TodoList};

/// Whether a tool may overlap with other calls in the same batch.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConcurrencyPolicy {
    /// Runs alone: never overlaps any other call.
    Serial,
    /// May run alongside other concurrent calls, up to the dispatcher's fan-out limit.
    Concurrent,
}

/// Context available to tools during execution.
#[derive(Clone, Debug)]
pub struct ToolContext {
    pub session_id: SessionId,
    pub agent_id: AgentId,
    pub parent_agent_id: Option<AgentId>,
    pub working_directory: PathBuf,
    pub mode: SessionMode,
    pub files: FileTracker,
    pub todos: TodoList,
    /// Fires on user cancellation or when the invocation exceeds its timeout.
    pub abort_signal: CancellationToken,
}

impl ToolContext {
    /// Resolve a tool-supplied path against the working directory.
    pub fn resolve_path(&self, path: &str) -> PathBuf {
        let p = Path::new(path);
        if p.is_absolute() {
            p.to_path_buf()
        } else {
            self.working_directory.join(p)
        }
    }
}

/// Structured outcome a tool reports alongside its text output.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SideEffect {
    FileChanged { path: PathBuf, diff: String },
    TodosUpdated { count: usize },
    PlanModeEntered,
    PlanSubmitted { plan: String },
}

/// Result returned by a tool execution.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToolResult {
    pub content: String,
    pub is_error: bool,
    #[serde(with = "duration_ms")]
    pub duration: Duration,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub side_effect: Option<SideEffect>,
    #[serde(default)]
    pub truncated: bool,
}

impl ToolResult {
    pub fn success(content: impl Into<String>, duration: Duration) -> Self {
        Self {
            content: content.into(),
            is_error: false,
            duration,
            side_effect: None,
            truncated: false,
        }
    }

    pub fn error(content: impl Into<String>, duration: Duration) -> Self {
        Self {
            content: content.into(),
            is_error: true,
            duration,
            side_effect: None,
            truncated: false,
        }
    }

    pub fn with_side_effect(mut self, effect: SideEffect) -> Self {
        self.side_effect = Some(effect);
        self
    }
}

/// Tool definition sent to the model as part of the context.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

/// Trait implemented by each tool.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    fn parameters_schema(&self) -> serde_json::Value;

    /// Whether the tool mutates anything outside its own output.
    fn has_side_effects(&self) -> bool {
        true
    }

    /// Side-effecting tools are serial unless they say otherwise.
    fn concurrency_policy(&self) -> ConcurrencyPolicy {
        if self.has_side_effects() {
            ConcurrencyPolicy::Serial
        } else {
            ConcurrencyPolicy::Concurrent
        }
    }

    /// Whether the tool may run while the session is in plan mode.
    fn allowed_in_plan_mode(&self) -> bool {
        !self.has_side_effects()
    }

    async fn execute(
        &self,
        args: serde_json::Value,
        ctx: &ToolContext,
    ) -> Result<ToolResult, ToolError>;

    fn to_definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name().to_string(),
            description: self.description().to_string(),
            parameters: self.parameters_schema(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),
    #[error("execution failed: {0}")]
    ExecutionFailed(String),
    #[error(transparent)]
    FileTracker(#[from] FileTrackError),
    #[error("blocked: {0}")]
    Blocked(String),
    #[error("timeout after {0:?}")]
    Timeout(Duration),
    #[error("cancelled")]
    Cancelled,
}

/// Serde helper for Duration as milliseconds.
mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let ms = u64::deserialize(d)?;
        Ok(Duration::from_millis(ms))
    }
}
