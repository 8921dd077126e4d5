//! Directory listing tool

use async_trait::async_trait;
use glob::glob;
use serde_json::json;
use std::path::Path;
use vela_agent::{AskKind, Tool, ToolContext, ToolError, ToolGroup, ToolParams, ToolResult};

use super::{param, resolve_path};

const DEFAULT_LIMIT: usize = 200;

/// Lists files under a directory, optionally filtered by a glob pattern
pub struct ListFilesTool;

impl ListFilesTool {
    pub fn new() -> Self {
        Self
    }
}

impl Default for ListFilesTool {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Tool for ListFilesTool {
    fn name(&self) -> &str {
        "list_files"
    }

    fn description(&self) -> &str {
        "List files and directories. Lists the top level unless recursive is true; \
         pattern filters entries with a glob such as *.rs."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Directory to list, relative to the working directory (default: .)"
                },
                "recursive": {
                    "type": "string",
                    "enum": ["true", "false"],
                    "description": "Whether to descend into subdirectories"
                },
                "pattern": {
                    "type": "string",
                    "description": "Glob filter applied to entry names (default: *)"
                }
            },
            "required": []
        })
    }

    fn group(&self) -> ToolGroup {
        ToolGroup::Read
    }

    fn approval(&self, params: &ToolParams) -> Option<(AskKind, String)> {
        let path = match param(params, "path") {
            "" => ".",
            p => p,
        };
        Some((AskKind::Tool, format!("List files in {}", path)))
    }

    async fn execute(&self, params: &ToolParams, ctx: &ToolContext) -> Result<ToolResult, ToolError> {
        let dir = match param(params, "path") {
            "" => ctx.cwd().to_path_buf(),
            p => resolve_path(ctx.cwd(), p),
        };
        if !dir.is_dir() {
            return Err(ToolError::failed(format!("Not a directory: {}", dir.display())));
        }
        let recursive = param(params, "recursive") == "true";
        let pattern = match param(params, "pattern") {
            "" => "*",
            p => p,
        };

        let entries = list(&dir, pattern, recursive, DEFAULT_LIMIT, ctx)?;
        if entries.is_empty() {
            return Ok(ToolResult::text("No files found."));
        }
        let mut output = entries.join("\n");
        if entries.len() >= DEFAULT_LIMIT {
            output.push_str(&format!("\n\n(showing first {} entries)", DEFAULT_LIMIT));
        }
        Ok(ToolResult::text(output))
    }
}

fn list(
    dir: &Path,
    pattern: &str,
    recursive: bool,
    limit: usize,
    ctx: &ToolContext,
) -> Result<Vec<String>, ToolError> {
    let full = if recursive {
        dir.join("**").join(pattern)
    } else {
        dir.join(pattern)
    };
    let paths = glob(&full.to_string_lossy())
        .map_err(|e| ToolError::failed(format!("Invalid glob pattern: {}", e)))?;

    let cancel = ctx.cancel_token();
    let mut entries = Vec::new();
    for entry in paths {
        if cancel.is_cancelled() {
            return Err(ToolError::Aborted);
        }
        match entry {
            Ok(path) => {
                let Ok(relative) = path.strip_prefix(dir) else { continue };
                if relative.components().any(|c| c.as_os_str().to_string_lossy().starts_with('.')) {
                    continue;
                }
                let mut name = relative.display().to_string();
                if path.is_dir() {
                    name.push('/');
                }
                entries.push(name);
                if entries.len() >= limit {
                    break;
                }
            }
            Err(e) => tracing::debug!("Glob entry error: {}", e),
        }
    }
    entries.sort();
    Ok(entries)
}
