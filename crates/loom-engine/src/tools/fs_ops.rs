use std::path::Path;

use similar::TextDiff;

use loom_core::tools::{ToolContext, ToolError};

/// Validate against the file tracker, write, and refresh the tracked time.
///
/// Contains no await point, so a cancelled invocation has either not touched
/// the file or fully replaced it.
pub(crate) fn commit_write(ctx: &ToolContext, path: &Path, content: &str) -> Result<(), ToolError> {
    ctx.files.validate(path)?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| {
            ToolError::ExecutionFailed(format!("Failed to create directory {}: {e}", parent.display()))
        })?;
    }
    std::fs::write(path, content)
        .map_err(|e| ToolError::ExecutionFailed(format!("Failed to write {}: {e}", path.display())))?;
    ctx.files.record_write(path)?;
    Ok(())
}

pub(crate) fn unified_diff(path: &Path, old: &str, new: &str) -> String {
    let name = path.display().to_string();
    TextDiff::from_lines(old, new)
        .unified_diff()
        .context_radius(3)
        .header(&format!("a/{name}"), &format!("b/{name}"))
        .to_string()
}
