use std::io;
use std::path::{Path, PathBuf};

use loom_core::ids::ToolCallId;

/// Largest index `<= max` that falls on a char boundary.
fn floor_char_boundary(s: &str, max: usize) -> usize {
    if max >= s.len() {
        return s.len();
    }
    let mut idx = max;
    while !s.is_char_boundary(idx) {
        idx -= 1;
    }
    idx
}

/// Truncate tool output if it exceeds `max_bytes`.
///
/// Cuts at a char boundary and appends a marker with the original and kept
/// sizes, plus the artifact path when the full output was saved.
pub fn truncate_output(output: &str, max_bytes: usize, artifact: Option<&Path>) -> String {
    if output.len() <= max_bytes {
        return output.to_string();
    }
    let boundary = floor_char_boundary(output, max_bytes);
    let kept = &output[..boundary];
    match artifact {
        Some(path) => format!(
            "{kept}\n\n[truncated: {} bytes -> {} bytes; full output saved to {}]",
            output.len(),
            boundary,
            path.display()
        ),
        None => format!(
            "{kept}\n\n[truncated: {} bytes -> {} bytes]",
            output.len(),
            boundary
        ),
    }
}

/// Save the untruncated output as `<dir>/<tool_call_id>.txt`.
pub async fn write_artifact(
    dir: &Path,
    tool_call_id: &ToolCallId,
    output: &str,
) -> io::Result<PathBuf> {
    tokio::fs::create_dir_all(dir).await?;
    let path = dir.join(format!("{tool_call_id}.txt"));
    tokio::fs::write(&path, output).await?;
    Ok(path)
}
