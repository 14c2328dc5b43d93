use std::fmt::Write as _;
use std::time::Instant;

use async_trait::async_trait;
use loom_core::tools::{Tool, ToolContext, ToolError, ToolResult};

const DEFAULT_LIMIT: usize = 2000;
const MAX_LINE_CHARS: usize = 2000;

pub struct ReadTool;

#[async_trait]
impl Tool for ReadTool {
    fn name(&self) -> &str {
        "Read"
    }

    fn description(&self) -> &str {
        "Read file contents from the filesystem. Files must be read before they can be written or edited."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "required": ["file_path"],
            "properties": {
                "file_path": {
                    "type": "string",
                    "description": "Path to the file to read, absolute or relative to the working directory"
                },
                "offset": {
                    "type": "integer",
                    "description": "Line number to start reading from (1-based)"
                },
                "limit": {
                    "type": "integer",
                    "description": "Maximum number of lines to read"
                }
            }
        })
    }

    fn has_side_effects(&self) -> bool {
        false
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
        let path = ctx.resolve_path(file_path);

        let read_failed =
            |e: std::io::Error| ToolError::ExecutionFailed(format!("Failed to read {}: {e}", path.display()));
        // Stat first so a write racing the read is still reported as a change.
        let seen = tokio::fs::metadata(&path)
            .await
            .and_then(|m| m.modified())
            .map_err(read_failed)?;
        let content = tokio::fs::read_to_string(&path).await.map_err(read_failed)?;
        ctx.files.record(&path, seen);

        let offset = args["offset"].as_u64().unwrap_or(1).max(1) as usize;
        let limit = args["limit"]
            .as_u64()
            .map_or(DEFAULT_LIMIT, |l| l as usize);

        let lines: Vec<&str> = content.lines().collect();
        let start_idx = (offset - 1).min(lines.len());
        let end_idx = start_idx.saturating_add(limit).min(lines.len());

        let mut output = String::new();
        for (i, line) in lines[start_idx..end_idx].iter().enumerate() {
            let shown: String = line.chars().take(MAX_LINE_CHARS).collect();
            let _ = writeln!(output, "{:>6}\t{shown}", start_idx + i + 1);
        }

        if output.is_empty() {
            output = if lines.is_empty() {
                "(empty file)".to_string()
            } else {
                format!("(no lines at offset {offset}; file has {} lines)", lines.len())
            };
        }

        Ok(ToolResult::success(output, start.elapsed()))
    }
}
