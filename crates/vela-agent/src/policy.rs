//! Modes, tool groups and the allow-list check

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

/// Operating mode of a task
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    /// Every tool group is available
    #[default]
    Act,
    /// Read-only exploration: no edits, no commands
    Plan,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Act => write!(f, "act"),
            Mode::Plan => write!(f, "plan"),
        }
    }
}

impl FromStr for Mode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "act" => Ok(Mode::Act),
            "plan" => Ok(Mode::Plan),
            other => Err(format!("unknown mode '{}' (expected 'act' or 'plan')", other)),
        }
    }
}

/// Broad category a tool belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolGroup {
    Read,
    Edit,
    Command,
    /// Talking to the user; always allowed
    Interaction,
}

/// Host-granted capabilities
#[derive(Debug, Clone, Default)]
pub struct Capabilities {
    pub disabled_tools: HashSet<String>,
}

impl Capabilities {
    pub fn with_disabled<I, S>(tools: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            disabled_tools: tools.into_iter().map(Into::into).collect(),
        }
    }
}

/// Decides whether a tool may run
pub trait ToolPolicy: Send + Sync {
    fn is_tool_allowed(&self, tool: &str, group: ToolGroup, mode: Mode, caps: &Capabilities) -> bool;
}

/// Plan mode forbids edits and commands; disabled tools are never allowed.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultPolicy;

impl ToolPolicy for DefaultPolicy {
    fn is_tool_allowed(&self, tool: &str, group: ToolGroup, mode: Mode, caps: &Capabilities) -> bool {
        if caps.disabled_tools.contains(tool) {
            return false;
        }
        match (mode, group) {
            (Mode::Plan, ToolGroup::Edit | ToolGroup::Command) => false,
            _ => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plan_mode_blocks_side_effects() {
        let caps = Capabilities::default();
        let p = DefaultPolicy;
        assert!(p.is_tool_allowed("read_file", ToolGroup::Read, Mode::Plan, &caps));
        assert!(!p.is_tool_allowed("write_to_file", ToolGroup::Edit, Mode::Plan, &caps));
        assert!(!p.is_tool_allowed("execute_command", ToolGroup::Command, Mode::Plan, &caps));
        assert!(p.is_tool_allowed("execute_command", ToolGroup::Command, Mode::Act, &caps));
    }

    #[test]
    fn test_disabled_tools() {
        let caps = Capabilities::with_disabled(["execute_command"]);
        assert!(!DefaultPolicy.is_tool_allowed("execute_command", ToolGroup::Command, Mode::Act, &caps));
    }

    #[test]
    fn test_mode_parse() {
        assert_eq!("PLAN".parse::<Mode>().unwrap(), Mode::Plan);
        assert!("build".parse::<Mode>().is_err());
        assert_eq!(Mode::Act.to_string(), "act");
    }
}
