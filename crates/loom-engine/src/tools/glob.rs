use std::path::PathBuf;
use std::time::Instant;

use async_trait::async_trait;
use loom_core::tools::{Tool, ToolContext, ToolError, ToolResult};

const MAX_MATCHES: usize = 1000;

pub struct GlobTool;

#[async_trait]
impl Tool for GlobTool {
    fn name(&self) -> &str {
        "Glob"
    }

    fn description(&self) -> &str {
        "Find files matching a glob pattern"
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "required": ["pattern"],
            "properties": {
                "pattern": {
                    "type": "string",
                    "description": "Glob pattern (e.g. '**/*.rs', 'src/**/*.ts')"
                },
                "path": {
                    "type": "string",
                    "description": "Directory to search in (defaults to working directory)"
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

        let pattern = args["pattern"]
            .as_str()
            .ok_or_else(|| ToolError::InvalidArguments("pattern is required".into()))?;
        let base_dir = args["path"]
            .as_str()
            .map_or_else(|| ctx.working_directory.clone(), |p| ctx.resolve_path(p));

        let full_pattern = base_dir.join(pattern).to_string_lossy().to_string();
        let matches = tokio::task::spawn_blocking(move || glob_match(&full_pattern))
            .await
            .map_err(|e| ToolError::ExecutionFailed(format!("Glob task failed: {e}")))??;

        if matches.is_empty() {
            return Ok(ToolResult::success("No files matched the pattern.", start.elapsed()));
        }

        let total = matches.len();
        let mut output = matches
            .iter()
            .take(MAX_MATCHES)
            .map(|p| p.display().to_string())
            .collect::<Vec<_>>()
            .join("\n");
        if total > MAX_MATCHES {
            output.push_str(&format!("\n... and {} more", total - MAX_MATCHES));
        }

        Ok(ToolResult::success(
            format!("{total} file(s) matched:\n{output}"),
            start.elapsed(),
        ))
    }
}

fn glob_match(pattern: &str) -> Result<Vec<PathBuf>, ToolError> {
    let entries = glob::glob(pattern)
        .map_err(|e| ToolError::InvalidArguments(format!("invalid glob pattern: {e}")))?;
    let mut results: Vec<PathBuf> = entries.flatten().filter(|p| p.is_file()).collect();
    results.sort();
    Ok(results)
}
