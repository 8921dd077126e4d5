//! Demonstration tools for the coding agent

mod command;
mod list;
mod read;
mod write;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use vela_agent::{BoxedTool, ToolParams};

pub use command::ExecuteCommandTool;
pub use list::ListFilesTool;
pub use read::ReadFileTool;
pub use write::WriteToFileTool;

/// Every tool the CLI registers, for a task working in `cwd`
pub fn all(cwd: &Path) -> Vec<BoxedTool> {
    vec![
        Arc::new(ExecuteCommandTool::new()),
        Arc::new(ReadFileTool::new()),
        Arc::new(WriteToFileTool::new(cwd)),
        Arc::new(ListFilesTool::new()),
    ]
}

/// A string parameter, empty when absent
pub(crate) fn param<'a>(params: &'a ToolParams, name: &str) -> &'a str {
    params.get(name).map(|v| v.trim()).unwrap_or_default()
}

/// Resolve a model-supplied path against the task's working directory,
/// expanding a leading `~`
pub(crate) fn resolve_path(cwd: &Path, path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(stripped);
        }
    } else if path == "~" {
        if let Some(home) = dirs::home_dir() {
            return home;
        }
    }
    cwd.join(path)
}
