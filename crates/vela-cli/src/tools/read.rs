//! File reading tool

use async_trait::async_trait;
use serde_json::json;
use tokio::fs;
use vela_agent::{AskKind, Tool, ToolContext, ToolError, ToolGroup, ToolParams, ToolResult};

use super::{param, resolve_path};

const MAX_LINES: usize = 2000;
const MAX_LINE_LENGTH: usize = 2000;

/// Reads a text file, optionally a window of its lines
pub struct ReadFileTool;

impl ReadFileTool {
    pub fn new() -> Self {
        Self
    }
}

impl Default for ReadFileTool {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Tool for ReadFileTool {
    fn name(&self) -> &str {
        "read_file"
    }

    fn description(&self) -> &str {
        "Read the contents of a text file. For large files, use the offset and limit parameters."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Path to the file, relative to the working directory"
                },
                "offset": {
                    "type": "string",
                    "description": "Line number to start reading from (1-indexed)"
                },
                "limit": {
                    "type": "string",
                    "description": "Maximum number of lines to read"
                }
            },
            "required": ["path"]
        })
    }

    fn group(&self) -> ToolGroup {
        ToolGroup::Read
    }

    fn approval(&self, params: &ToolParams) -> Option<(AskKind, String)> {
        Some((AskKind::Tool, format!("Read file: {}", param(params, "path"))))
    }

    async fn execute(&self, params: &ToolParams, ctx: &ToolContext) -> Result<ToolResult, ToolError> {
        let path = resolve_path(ctx.cwd(), param(params, "path"));
        let content = fs::read_to_string(&path)
            .await
            .map_err(|e| ToolError::failed(format!("Failed to read {}: {}", path.display(), e)))?;

        let offset = param(params, "offset")
            .parse::<usize>()
            .map(|o| o.saturating_sub(1))
            .unwrap_or(0);
        let limit = param(params, "limit").parse::<usize>().unwrap_or(MAX_LINES);

        select_lines(&content, offset, limit).map(ToolResult::text)
    }
}

/// Lines `offset..offset + limit` with long lines cut short and notices for
/// anything left out
fn select_lines(content: &str, offset: usize, limit: usize) -> Result<String, ToolError> {
    let lines: Vec<&str> = content.lines().collect();
    let total = lines.len();
    if total == 0 {
        return Ok("(empty file)".to_string());
    }
    if offset >= total {
        return Err(ToolError::failed(format!(
            "Offset {} is beyond end of file ({} lines total)",
            offset + 1,
            total
        )));
    }

    let end = offset.saturating_add(limit).min(total);
    let mut had_truncated = false;
    let selected: Vec<String> = lines[offset..end]
        .iter()
        .map(|line| {
            if line.chars().count() > MAX_LINE_LENGTH {
                had_truncated = true;
                line.chars().take(MAX_LINE_LENGTH).collect()
            } else {
                line.to_string()
            }
        })
        .collect();
    let mut output = selected.join("\n");

    let mut notices = Vec::new();
    if had_truncated {
        notices.push(format!("Some lines were truncated to {} characters", MAX_LINE_LENGTH));
    }
    if end < total {
        notices.push(format!(
            "{} more lines not shown. Use offset={} to continue reading",
            total - end,
            end + 1
        ));
    }
    if !notices.is_empty() {
        output.push_str(&format!("\n\n... ({})", notices.join(". ")));
    }
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_with_notice() {
        let out = select_lines("a\nb\nc\nd", 1, 2).unwrap();
        assert!(out.starts_with("b\nc"));
        assert!(out.contains("1 more lines not shown. Use offset=4"));
    }

    #[test]
    fn test_offset_past_end() {
        assert!(select_lines("a\nb", 5, 10).is_err());
    }

    #[test]
    fn test_long_multibyte_line_is_cut_on_char_boundary() {
        let line = "é".repeat(MAX_LINE_LENGTH + 10);
        let out = select_lines(&line, 0, 10).unwrap();
        assert!(out.contains("truncated to 2000 characters"));
    }
}
