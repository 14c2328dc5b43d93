use std::time::Instant;

use async_trait::async_trait;
use loom_core::tools::{SideEffect, Tool, ToolContext, ToolError, ToolResult};

use super::fs_ops::{commit_write, unified_diff};

pub struct EditTool;

#[async_trait]
impl Tool for EditTool {
    fn name(&self) -> &str {
        "Edit"
    }

    fn description(&self) -> &str {
        "Perform exact string replacement in a file that has been read"
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "required": ["file_path", "old_string", "new_string"],
            "properties": {
                "file_path": {
                    "type": "string",
                    "description": "Path to the file to edit"
                },
                "old_string": {
                    "type": "string",
                    "description": "The exact string to find and replace"
                },
                "new_string": {
                    "type": "string",
                    "description": "The replacement string"
                },
                "replace_all": {
                    "type": "boolean",
                    "description": "Replace all occurrences (default: false)"
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
        let old_string = args["old_string"]
            .as_str()
            .ok_or_else(|| ToolError::InvalidArguments("old_string is required".into()))?;
        let new_string = args["new_string"]
            .as_str()
            .ok_or_else(|| ToolError::InvalidArguments("new_string is required".into()))?;
        let replace_all = args["replace_all"].as_bool().unwrap_or(false);

        if old_string.is_empty() {
            return Err(ToolError::InvalidArguments("old_string must not be empty".into()));
        }
        if old_string == new_string {
            return Err(ToolError::InvalidArguments(
                "old_string and new_string must be different".into(),
            ));
        }

        let path = ctx.resolve_path(file_path);
        ctx.files.validate(&path)?;
        let content = std::fs::read_to_string(&path).map_err(|e| {
            ToolError::ExecutionFailed(format!("Failed to read {}: {e}", path.display()))
        })?;

        let count = content.matches(old_string).count();
        if count == 0 {
            return Err(ToolError::ExecutionFailed("old_string not found in file".into()));
        }
        if count > 1 && !replace_all {
            return Err(ToolError::ExecutionFailed(format!(
                "old_string is not unique in the file ({count} occurrences). Use replace_all or provide more context."
            )));
        }
        let new_content = if replace_all {
            content.replace(old_string, new_string)
        } else {
            content.replacen(old_string, new_string, 1)
        };

        commit_write(ctx, &path, &new_content)?;

        let diff = unified_diff(&path, &content, &new_content);
        Ok(ToolResult::success(
            format!("Replaced {count} occurrence(s) in {}", path.display()),
            start.elapsed(),
        )
        .with_side_effect(SideEffect::FileChanged { path, diff }))
    }
}
