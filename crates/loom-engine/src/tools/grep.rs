use std::collections::BTreeMap;
use std::path::Path;
use std::time::Instant;

use async_trait::async_trait;
use loom_core::tools::{Tool, ToolContext, ToolError, ToolResult};
use regex::Regex;
use tokio_util::sync::CancellationToken;

const SKIPPED_DIRS: &[&str] = &["node_modules", "target", "dist", "build", "__pycache__", "vendor"];

pub struct GrepTool;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum OutputMode {
    Content,
    FilesWithMatches,
    Count,
}

impl OutputMode {
    fn parse(raw: Option<&str>) -> Result<Self, ToolError> {
        match raw {
            None | Some("files_with_matches") => Ok(Self::FilesWithMatches),
            Some("content") => Ok(Self::Content),
            Some("count") => Ok(Self::Count),
            Some(other) => Err(ToolError::InvalidArguments(format!(
                "output_mode must be content, files_with_matches or count, got {other}"
            ))),
        }
    }
}

#[async_trait]
impl Tool for GrepTool {
    fn name(&self) -> &str {
        "Grep"
    }

    fn description(&self) -> &str {
        "Search file contents using regex patterns"
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "required": ["pattern"],
            "properties": {
                "pattern": {
                    "type": "string",
                    "description": "Regex pattern to search for"
                },
                "path": {
                    "type": "string",
                    "description": "File or directory to search in"
                },
                "glob": {
                    "type": "string",
                    "description": "Glob pattern to filter file names (e.g. '*.rs')"
                },
                "output_mode": {
                    "type": "string",
                    "enum": ["content", "files_with_matches", "count"],
                    "description": "Output mode (default: files_with_matches)"
                },
                "head_limit": {
                    "type": "integer",
                    "description": "Limit output to first N results"
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
        let search_path = args["path"]
            .as_str()
            .map_or_else(|| ctx.working_directory.clone(), |p| ctx.resolve_path(p));
        let mode = OutputMode::parse(args["output_mode"].as_str())?;
        let head_limit = args["head_limit"].as_u64().unwrap_or(0) as usize;

        let regex = Regex::new(pattern)
            .map_err(|e| ToolError::InvalidArguments(format!("Invalid regex: {e}")))?;
        let filter = args["glob"]
            .as_str()
            .map(glob::Pattern::new)
            .transpose()
            .map_err(|e| ToolError::InvalidArguments(format!("Invalid glob: {e}")))?;

        let abort = ctx.abort_signal.clone();
        let results = tokio::task::spawn_blocking(move || {
            let mut results = Vec::new();
            search(&search_path, &regex, filter.as_ref(), &abort, &mut results);
            results
        })
        .await
        .map_err(|e| ToolError::ExecutionFailed(format!("Search task failed: {e}")))?;

        if ctx.abort_signal.is_cancelled() {
            return Err(ToolError::Cancelled);
        }

        Ok(ToolResult::success(
            format_results(&results, mode, head_limit),
            start.elapsed(),
        ))
    }
}

#[derive(Debug)]
struct SearchMatch {
    file: String,
    line_number: usize,
    line_content: String,
}

fn search(
    path: &Path,
    regex: &Regex,
    filter: Option<&glob::Pattern>,
    abort: &CancellationToken,
    results: &mut Vec<SearchMatch>,
) {
    if abort.is_cancelled() {
        return;
    }
    if path.is_file() {
        search_file(path, regex, results);
        return;
    }
    let Ok(entries) = std::fs::read_dir(path) else {
        return;
    };
    let mut paths: Vec<_> = entries.flatten().map(|e| e.path()).collect();
    paths.sort();

    for path in paths {
        let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
        if path.is_dir() {
            if name.starts_with('.') || SKIPPED_DIRS.contains(&name) {
                continue;
            }
            search(&path, regex, filter, abort, results);
        } else if path.is_file() {
            if filter.is_some_and(|f| !f.matches(name)) {
                continue;
            }
            search_file(&path, regex, results);
        }
    }
}

fn search_file(path: &Path, regex: &Regex, results: &mut Vec<SearchMatch>) {
    // Binary or unreadable files are skipped.
    let Ok(content) = std::fs::read_to_string(path) else {
        return;
    };
    for (i, line) in content.lines().enumerate() {
        if regex.is_match(line) {
            results.push(SearchMatch {
                file: path.display().to_string(),
                line_number: i + 1,
                line_content: line.to_string(),
            });
        }
    }
}

fn format_results(results: &[SearchMatch], mode: OutputMode, limit: usize) -> String {
    if results.is_empty() {
        return "No matches found.".to_string();
    }
    let limit = if limit > 0 { limit } else { usize::MAX };

    let items: Vec<String> = match mode {
        OutputMode::Content => results
            .iter()
            .take(limit)
            .map(|m| format!("{}:{}:{}", m.file, m.line_number, m.line_content))
            .collect(),
        OutputMode::Count => {
            let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
            for m in results {
                *counts.entry(&m.file).or_default() += 1;
            }
            counts
                .iter()
                .take(limit)
                .map(|(f, c)| format!("{f}:{c}"))
                .collect()
        }
        OutputMode::FilesWithMatches => {
            let mut files: Vec<&str> = results.iter().map(|m| m.file.as_str()).collect();
            files.dedup();
            files.into_iter().take(limit).map(String::from).collect()
        }
    };
    items.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    use crate::testing::tool_context;

    fn fixture() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.rs"), "fn hello() {}\nfn world() {}").unwrap();
        fs::write(dir.path().join("b.rs"), "fn goodbye() {}").unwrap();
        fs::write(dir.path().join("notes.md"), "fn hello in docs").unwrap();
        fs::create_dir_all(dir.path().join("target")).unwrap();
        fs::write(dir.path().join("target/gen.rs"), "fn hello() {}").unwrap();
        dir
    }

    #[tokio::test]
    async fn content_mode_lists_lines() {
        let dir = fixture();
        let result = GrepTool
            .execute(
                serde_json::json!({"pattern": "fn hello", "output_mode": "content", "glob": "*.rs"}),
                &tool_context(dir.path()),
            )
            .await
            .unwrap();

        assert_eq!(result.content.lines().count(), 1);
        assert!(result.content.ends_with("a.rs:1:fn hello() {}"));
    }

    #[tokio::test]
    async fn files_mode_is_default_and_skips_build_dirs() {
        let dir = fixture();
        let result = GrepTool
            .execute(serde_json::json!({"pattern": "hello"}), &tool_context(dir.path()))
            .await
            .unwrap();

        let files: Vec<&str> = result.content.lines().collect();
        assert_eq!(files.len(), 2);
        assert!(files[0].ends_with("a.rs"));
        assert!(files[1].ends_with("notes.md"));
    }

    #[tokio::test]
    async fn count_mode_and_head_limit() {
        let dir = fixture();
        let ctx = tool_context(dir.path());
        let counts = GrepTool
            .execute(serde_json::json!({"pattern": "^fn", "output_mode": "count"}), &ctx)
            .await
            .unwrap();
        assert!(counts.content.contains("a.rs:2"));
        assert!(counts.content.contains("b.rs:1"));

        let limited = GrepTool
            .execute(serde_json::json!({"pattern": "fn", "output_mode": "content", "head_limit": 1}), &ctx)
            .await
            .unwrap();
        assert_eq!(limited.content.lines().count(), 1);
    }

    #[tokio::test]
    async fn invalid_inputs() {
        let dir = fixture();
        let ctx = tool_context(dir.path());
        let bad_regex = GrepTool
            .execute(serde_json::json!({"pattern": "(unclosed"}), &ctx)
            .await
            .unwrap_err();
        assert!(matches!(bad_regex, ToolError::InvalidArguments(_)));

        let bad_mode = GrepTool
            .execute(serde_json::json!({"pattern": "x", "output_mode": "lines"}), &ctx)
            .await
            .unwrap_err();
        assert!(matches!(bad_mode, ToolError::InvalidArguments(_)));
    }

    #[tokio::test]
    async fn no_matches() {
        let dir = fixture();
        let result = GrepTool
            .execute(serde_json::json!({"pattern": "zzz_not_here"}), &tool_context(dir.path()))
            .await
            .unwrap();
        assert_eq!(result.content, "No matches found.");
    }
}
