//! Shell command execution tool

use async_trait::async_trait;
use serde_json::json;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use vela_agent::{AskKind, SayKind, Tool, ToolContext, ToolError, ToolGroup, ToolParams, ToolResult};

use super::param;

/// Maximum output size in bytes before truncation
const MAX_OUTPUT_SIZE: usize = 100_000;
/// Maximum number of lines before truncation
const MAX_OUTPUT_LINES: usize = 1000;
const DEFAULT_TIMEOUT_SECS: u64 = 120;

/// Runs a shell command in the task's working directory, streaming its output
pub struct ExecuteCommandTool;

impl ExecuteCommandTool {
    pub fn new() -> Self {
        Self
    }
}

impl Default for ExecuteCommandTool {
    fn default() -> Self {
        Self::new()
    }
}

/// Collected output with the truncation limits applied
#[derive(Default)]
struct Output {
    text: String,
    lines: usize,
    truncated: bool,
}

impl Output {
    fn push(&mut self, line: &str) {
        if self.truncated {
            return;
        }
        if self.lines >= MAX_OUTPUT_LINES || self.text.len() + line.len() > MAX_OUTPUT_SIZE {
            self.truncated = true;
            return;
        }
        if !self.text.is_empty() {
            self.text.push('\n');
        }
        self.text.push_str(line);
        self.lines += 1;
    }

    fn finish(mut self) -> String {
        if self.truncated {
            self.text.push_str(&format!(
                "\n\n... (output truncated at {} lines / {}KB)",
                self.lines,
                MAX_OUTPUT_SIZE / 1024
            ));
        }
        if self.text.is_empty() {
            self.text = "(no output)".to_string();
        }
        self.text
    }
}

#[async_trait]
impl Tool for ExecuteCommandTool {
    fn name(&self) -> &str {
        "execute_command"
    }

    fn description(&self) -> &str {
        "Execute a shell command in the current working directory. Returns combined stdout and stderr."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "command": {
                    "type": "string",
                    "description": "The shell command to execute"
                },
                "timeout": {
                    "type": "string",
                    "pattern": "^\\s*[0-9]+\\s*$",
                    "description": "Timeout in seconds (default 120)"
                }
            },
            "required": ["command"]
        })
    }

    fn group(&self) -> ToolGroup {
        ToolGroup::Command
    }

    fn approval(&self, params: &ToolParams) -> Option<(AskKind, String)> {
        Some((AskKind::Command, param(params, "command").to_string()))
    }

    async fn execute(&self, params: &ToolParams, ctx: &ToolContext) -> Result<ToolResult, ToolError> {
        let command = param(params, "command");
        let timeout_secs = param(params, "timeout")
            .parse::<u64>()
            .unwrap_or(DEFAULT_TIMEOUT_SECS);

        let (shell, shell_arg) = if cfg!(target_os = "windows") {
            ("cmd", "/C")
        } else {
            ("sh", "-c")
        };

        let mut child = Command::new(shell)
            .arg(shell_arg)
            .arg(command)
            .current_dir(ctx.cwd())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ToolError::failed(format!("Failed to spawn command: {}", e)))?;

        let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
            return Err(ToolError::failed("Command output was not captured"));
        };
        let mut stdout = BufReader::new(stdout).lines();
        let mut stderr = BufReader::new(stderr).lines();
        let mut stdout_done = false;
        let mut stderr_done = false;

        let cancel = ctx.cancel_token();
        let deadline = tokio::time::Instant::now() + tokio::time::Duration::from_secs(timeout_secs);
        let mut output = Output::default();

        let status = loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = child.kill().await;
                    return Err(ToolError::Aborted);
                }
                _ = tokio::time::sleep_until(deadline) => {
                    let _ = child.kill().await;
                    return Err(ToolError::failed(format!(
                        "{}\n\nCommand timed out after {} seconds",
                        output.finish(),
                        timeout_secs
                    )));
                }
                line = stdout.next_line(), if !stdout_done => match line {
                    Ok(Some(l)) => {
                        output.push(&l);
                        ctx.say_streaming(SayKind::ToolOutput, &output.text, true)?;
                    }
                    Ok(None) => stdout_done = true,
                    Err(e) => {
                        output.push(&format!("stdout read error: {}", e));
                        stdout_done = true;
                    }
                },
                line = stderr.next_line(), if !stderr_done => match line {
                    Ok(Some(l)) => {
                        output.push(&l);
                        ctx.say_streaming(SayKind::ToolOutput, &output.text, true)?;
                    }
                    Ok(None) => stderr_done = true,
                    Err(e) => {
                        output.push(&format!("stderr read error: {}", e));
                        stderr_done = true;
                    }
                },
                status = child.wait(), if stdout_done && stderr_done => {
                    break status.map_err(|e| ToolError::failed(format!("Failed to wait for command: {}", e)))?;
                }
            }
        };

        let text = output.finish();
        ctx.say_streaming(SayKind::ToolOutput, &text, false)?;
        if status.success() {
            Ok(ToolResult::text(text))
        } else {
            Err(ToolError::failed(format!(
                "{}\n\nCommand exited with code {}",
                text,
                status.code().unwrap_or(-1)
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_truncates() {
        let mut output = Output::default();
        for i in 0..(MAX_OUTPUT_LINES + 5) {
            output.push(&i.to_string());
        }
        let text = output.finish();
        assert!(text.starts_with("0\n1\n"));
        assert!(text.contains("output truncated at 1000 lines"));
    }

    #[test]
    fn test_empty_output() {
        assert_eq!(Output::default().finish(), "(no output)");
    }

    #[test]
    fn test_approval_is_command_ask() {
        let params: ToolParams = [("command".to_string(), "ls -la".to_string())].into_iter().collect();
        let (kind, text) = ExecuteCommandTool::new().approval(&params).unwrap();
        assert_eq!(kind, AskKind::Command);
        assert_eq!(text, "ls -la");
    }
}
