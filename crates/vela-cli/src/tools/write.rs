//! File writing tool with a live diff preview

use async_trait::async_trait;
use serde_json::json;
use similar::TextDiff;
use std::path::{Path, PathBuf};
use tokio::fs;
use vela_agent::{AskKind, Tool, ToolContext, ToolError, ToolGroup, ToolParams, ToolPreview, ToolResult};

use super::param;

/// Writes a whole file, creating parent directories as needed.
///
/// Preview, approval and the write itself all resolve paths against `cwd`,
/// so the diff the user approves is of the file that gets written.
pub struct WriteToFileTool {
    cwd: PathBuf,
}

impl WriteToFileTool {
    pub fn new(cwd: impl Into<PathBuf>) -> Self {
        Self { cwd: cwd.into() }
    }

    fn target(&self, path: &str) -> PathBuf {
        super::resolve_path(&self.cwd, path)
    }

    fn diff(&self, params: &ToolParams) -> String {
        let path = param(params, "path");
        let content = params.get("content").map(String::as_str).unwrap_or_default();
        let existing = read_existing(&self.target(path));
        diff_preview(path, &existing, normalize_content(content))
    }
}

/// Models tend to open and close the content on its own line
fn normalize_content(content: &str) -> &str {
    let content = content.strip_prefix('\n').unwrap_or(content);
    content.strip_suffix('\n').unwrap_or(content)
}

/// Unified diff of the file at `path` (empty if missing) against `new`
fn diff_preview(path: &str, existing: &str, new: &str) -> String {
    if existing.is_empty() {
        return format!("New file: {}\n{}", path, new);
    }
    TextDiff::from_lines(existing, new)
        .unified_diff()
        .context_radius(3)
        .header(path, path)
        .to_string()
}

fn read_existing(path: &Path) -> String {
    std::fs::read_to_string(path).unwrap_or_default()
}

#[async_trait]
impl Tool for WriteToFileTool {
    fn name(&self) -> &str {
        "write_to_file"
    }

    fn description(&self) -> &str {
        "Write content to a file. Creates the file if it doesn't exist, overwrites it if it does. \
         Parent directories are created automatically. Always provide the complete file content."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Path to the file, relative to the working directory"
                },
                "content": {
                    "type": "string",
                    "description": "The complete content to write"
                }
            },
            "required": ["path", "content"]
        })
    }

    fn group(&self) -> ToolGroup {
        ToolGroup::Edit
    }

    /// The diff grows as the content streams in
    fn preview(&self, params: &ToolParams) -> Option<ToolPreview> {
        if param(params, "path").is_empty() {
            return None;
        }
        Some(ToolPreview::Ask(AskKind::Tool, self.diff(params)))
    }

    fn approval(&self, params: &ToolParams) -> Option<(AskKind, String)> {
        Some((AskKind::Tool, self.diff(params)))
    }

    async fn execute(&self, params: &ToolParams, _ctx: &ToolContext) -> Result<ToolResult, ToolError> {
        let path_str = param(params, "path");
        if path_str == "~" {
            return Err(ToolError::failed("Cannot write to the home directory itself"));
        }
        let path = self.target(path_str);
        let content = normalize_content(params.get("content").map(String::as_str).unwrap_or_default());

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(&path, content).await?;
        tracing::debug!("Wrote {} bytes to {}", content.len(), path.display());

        Ok(ToolResult::text(format!(
            "Successfully wrote {} bytes to {}",
            content.len(),
            path_str
        )))
    }
}
