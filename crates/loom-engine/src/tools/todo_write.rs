use std::collections::HashSet;
use std::fmt::Write as _;
use std::time::Instant;

use async_trait::async_trait;
use loom_core::session::{TodoItem, TodoStatus};
use loom_core::tools::{SideEffect, Tool, ToolContext, ToolError, ToolResult};

/// Replaces the session's todo list wholesale.
pub struct TodoWriteTool;

#[async_trait]
impl Tool for TodoWriteTool {
    fn name(&self) -> &str {
        "TodoWrite"
    }

    fn description(&self) -> &str {
        "Create and manage the task list for the current session. Always send the full list."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "required": ["todos"],
            "properties": {
                "todos": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": {
                            "id": { "type": "string" },
                            "content": { "type": "string" },
                            "status": {
                                "type": "string",
                                "enum": ["pending", "in_progress", "completed"]
                            }
                        },
                        "required": ["id", "content", "status"]
                    },
                    "description": "The full task list to write"
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

        let raw = args["todos"]
            .as_array()
            .ok_or_else(|| ToolError::InvalidArguments("todos array is required".into()))?;

        let mut seen = HashSet::new();
        let mut todos = Vec::with_capacity(raw.len());
        for item in raw {
            let id = item["id"]
                .as_str()
                .ok_or_else(|| ToolError::InvalidArguments("todo id is required".into()))?;
            let content = item["content"]
                .as_str()
                .ok_or_else(|| ToolError::InvalidArguments("todo content is required".into()))?;
            let status = match item["status"].as_str() {
                Some("pending") => TodoStatus::Pending,
                Some("in_progress") => TodoStatus::InProgress,
                Some("completed") => TodoStatus::Completed,
                Some(other) => {
                    return Err(ToolError::InvalidArguments(format!("invalid status: {other}")))
                }
                None => return Err(ToolError::InvalidArguments("todo status is required".into())),
            };
            if !seen.insert(id) {
                return Err(ToolError::InvalidArguments(format!("duplicate todo id: {id}")));
            }
            todos.push(TodoItem {
                id: id.to_string(),
                content: content.to_string(),
                status,
            });
        }

        let mut summary = format!("Todo list updated ({} items)", todos.len());
        for todo in &todos {
            let mark = match todo.status {
                TodoStatus::Pending => "[ ]",
                TodoStatus::InProgress => "[~]",
                TodoStatus::Completed => "[x]",
            };
            let _ = write!(summary, "\n{mark} {}", todo.content);
        }

        let count = todos.len();
        ctx.todos.replace(todos);
        if count > 0 && !ctx.todos.has_open_items() {
            summary.push_str("\nAll items are completed.");
        }
        Ok(ToolResult::success(summary, start.elapsed())
            .with_side_effect(SideEffect::TodosUpdated { count }))
    }
}
