use std::time::Instant;

use async_trait::async_trait;
use loom_core::session::SessionMode;
use loom_core::tools::{SideEffect, Tool, ToolContext, ToolError, ToolResult};

/// Switches the session into read-only planning. The engine applies the mode
/// change from the returned side effect.
pub struct EnterPlanModeTool;

#[async_trait]
impl Tool for EnterPlanModeTool {
    fn name(&self) -> &str {
        "EnterPlanMode"
    }

    fn description(&self) -> &str {
        "Enter plan mode: explore with read-only tools and present a plan with ExitPlanMode before changing anything"
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({"type": "object", "properties": {}})
    }

    fn allowed_in_plan_mode(&self) -> bool {
        true
    }

    async fn execute(
        &self,
        _args: serde_json::Value,
        ctx: &ToolContext,
    ) -> Result<ToolResult, ToolError> {
        let start = Instant::now();
        if ctx.mode == SessionMode::Plan {
            return Err(ToolError::ExecutionFailed("Already in plan mode".into()));
        }
        Ok(ToolResult::success(
            "Entered plan mode. Only read-only tools are available until the plan is approved.",
            start.elapsed(),
        )
        .with_side_effect(SideEffect::PlanModeEntered))
    }
}

/// Submits a plan for user approval. The engine suspends on the approval
/// after the batch finishes.
pub struct ExitPlanModeTool;

#[async_trait]
impl Tool for ExitPlanModeTool {
    fn name(&self) -> &str {
        "ExitPlanMode"
    }

    fn description(&self) -> &str {
        "Present the finished plan to the user for approval and leave plan mode if approved"
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "required": ["plan"],
            "properties": {
                "plan": {
                    "type": "string",
                    "description": "The implementation plan, in markdown"
                }
            }
        })
    }

    fn allowed_in_plan_mode(&self) -> bool {
        true
    }

    async fn execute(
        &self,
        args: serde_json::Value,
        ctx: &ToolContext,
    ) -> Result<ToolResult, ToolError> {
        let start = Instant::now();
        let plan = args["plan"]
            .as_str()
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .ok_or_else(|| ToolError::InvalidArguments("plan is required".into()))?;
        if ctx.mode != SessionMode::Plan {
            return Err(ToolError::ExecutionFailed("Not in plan mode".into()));
        }
        Ok(ToolResult::success("Plan submitted for approval.", start.elapsed())
            .with_side_effect(SideEffect::PlanSubmitted {
                plan: plan.to_string(),
            }))
    }
}
