use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use loom_core::tools::{ConcurrencyPolicy, Tool, ToolContext, ToolError, ToolResult};

use crate::engine::TurnOutcome;
use crate::error::EngineError;
use crate::subagent::{SubagentManager, GENERAL_PURPOSE};

/// Delegates a task to a sub-agent. One tool serves every profile; the
/// profile is picked per call by `subagent_type`.
pub struct TaskTool {
    manager: Arc<SubagentManager>,
    description: String,
}

impl TaskTool {
    pub fn new(manager: Arc<SubagentManager>) -> Self {
        let mut description = String::from(
            "Launch an autonomous sub-agent to handle a task in its own context. \
             The sub-agent's final reply is returned as the result. Available agent types:",
        );
        for profile in manager.profiles().iter() {
            let _ = write!(description, "\n- {}: {}", profile.name, profile.description);
        }
        Self { manager, description }
    }
}

#[async_trait]
impl Tool for TaskTool {
    fn name(&self) -> &str {
        "Task"
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "required": ["prompt", "description"],
            "properties": {
                "prompt": {
                    "type": "string",
                    "description": "The task for the sub-agent to perform"
                },
                "description": {
                    "type": "string",
                    "description": "A short (3-5 word) description of the task"
                },
                "subagent_type": {
                    "type": "string",
                    "enum": self.manager.profiles().names(),
                    "description": "Which agent profile to use (default: general-purpose)"
                }
            }
        })
    }

    // Children edit the same working tree as the parent.
    fn concurrency_policy(&self) -> ConcurrencyPolicy {
        ConcurrencyPolicy::Serial
    }

    async fn execute(
        &self,
        args: serde_json::Value,
        ctx: &ToolContext,
    ) -> Result<ToolResult, ToolError> {
        let start = Instant::now();

        let prompt = args["prompt"]
            .as_str()
            .filter(|p| !p.trim().is_empty())
            .ok_or_else(|| ToolError::InvalidArguments("prompt is required".into()))?;
        let description = args["description"]
            .as_str()
            .ok_or_else(|| ToolError::InvalidArguments("description is required".into()))?;
        let profile = args["subagent_type"].as_str().unwrap_or(GENERAL_PURPOSE);

        tracing::debug!(profile, description, "delegating task");
        let result = match self.manager.run(profile, prompt, ctx).await {
            Ok(result) => result,
            Err(EngineError::UnknownProfile(name)) => {
                return Err(ToolError::InvalidArguments(format!(
                    "unknown subagent_type '{name}'. Available: {}",
                    self.manager.profiles().names().join(", ")
                )))
            }
            Err(e) => return Err(ToolError::ExecutionFailed(e.to_string())),
        };

        match result.outcome {
            TurnOutcome::Completed { result: text, steps } => Ok(ToolResult::success(
                format!("{text}\n\n[{description}: completed in {steps} step(s), session {}]", result.child_session_id),
                start.elapsed(),
            )),
            TurnOutcome::Interrupted { .. } if ctx.abort_signal.is_cancelled() => Err(ToolError::Cancelled),
            TurnOutcome::Interrupted { steps } => Ok(ToolResult::error(
                format!("Sub-agent was cancelled after {steps} step(s)"),
                start.elapsed(),
            )),
            TurnOutcome::Failed { error, steps, .. } => Ok(ToolResult::error(
                format!("Sub-agent failed after {steps} step(s): {error}"),
                start.elapsed(),
            )),
        }
    }
}
