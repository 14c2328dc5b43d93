use std::time::Instant;

use async_trait::async_trait;
use loom_core::tools::{SideEffect, Tool, ToolContext, ToolError, ToolResult};

use super::fs_ops::{commit_write, unified_diff};

pub struct WriteTool;

#[async_trait]
impl Tool for WriteTool {
    fn name(&self) -> &str {
        "Write"
    }

    fn description(&self) -> &str {
        "Write content to a file. Existing files must be read first."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "required": ["file_path", "content"],
            "properties": {
                "file_path": {
                    "type": "string",
                    "description": "Path to the file to write, absolute or relative to the working directory"
                },
                "content": {
                    "type": "string",
                    "description": "Content to write to the file"
                }
            }
        })
    }

    async fn execute(
        &self,
        args: serde_json::Value,
        ctx: &ToolContext,
    ) -> Result<ToolResult, ToolError> {
        let start = Instant::now();

        let file_path = args["file_path"]
            .as_str()
            .ok_or_else(|| ToolError::InvalidArguments("file_path is required".into()))?;
        let content = args["content"]
            .as_str()
            .ok_or_else(|| ToolError::InvalidArguments("content is required".into()))?;

        let path = ctx.resolve_path(file_path);
        let previous = std::fs::read_to_string(&path).unwrap_or_default();
        commit_write(ctx, &path, content)?;

        let diff = unified_diff(&path, &previous, content);
        Ok(ToolResult::success(
            format!(
                "Wrote {} bytes ({} lines) to {}",
                content.len(),
                content.lines().count(),
                path.display()
            ),
            start.elapsed(),
        )
        .with_side_effect(SideEffect::FileChanged { path, diff }))
    }
}
