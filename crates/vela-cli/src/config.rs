//! Configuration file support

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use vela_agent::{Capabilities, Mode, RetryConfig, TaskConfig};

/// Configuration for vela
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Operating mode, `act` or `plan`
    pub mode: Option<Mode>,
    /// Where task directories are kept
    pub data_dir: Option<PathBuf>,
    /// Retry retryable request failures without asking
    pub auto_retry: Option<bool>,
    pub retry_base_delay_secs: Option<u64>,
    pub retry_max_delay_secs: Option<u64>,
    /// Minimum spacing between requests
    pub rate_limit_secs: Option<u64>,
    pub max_consecutive_mistakes: Option<u32>,
    /// Tools that run without asking
    pub auto_approve: Vec<String>,
    /// Tools the model may never use
    pub disabled_tools: Vec<String>,
    /// Custom system prompt file path
    pub system_prompt_file: Option<PathBuf>,
}

impl Config {
    /// Get the config directory
    pub fn config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("vela")
    }

    /// Get the config file path
    pub fn config_path() -> PathBuf {
        if let Ok(path) = std::env::var("VELA_CONFIG_PATH") {
            return PathBuf::from(path);
        }
        Self::config_dir().join("config.toml")
    }

    /// Default location of task data
    pub fn default_data_dir() -> PathBuf {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("vela")
    }

    /// Load config from file
    pub fn load() -> Self {
        Self::load_from(&Self::config_path())
    }

    fn load_from(path: &Path) -> Self {
        if !path.exists() {
            return Self::default();
        }

        match fs::read_to_string(path) {
            Ok(content) => match toml::from_str(&content) {
                Ok(config) => config,
                Err(e) => {
                    eprintln!("Warning: Failed to parse config file: {}", e);
                    Self::default()
                }
            },
            Err(e) => {
                eprintln!("Warning: Failed to read config file: {}", e);
                Self::default()
            }
        }
    }

    /// Create a default config file if it doesn't exist
    pub fn init() -> std::io::Result<PathBuf> {
        let path = Self::config_path();
        if path.exists() {
            return Ok(path);
        }
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        fs::write(&path, example_config())?;
        Ok(path)
    }

    pub fn data_dir(&self) -> PathBuf {
        self.data_dir.clone().unwrap_or_else(Self::default_data_dir)
    }

    /// Build a task configuration, with defaults for anything unset
    pub fn task_config(&self, cwd: PathBuf) -> std::io::Result<TaskConfig> {
        let mut task = TaskConfig::new(self.data_dir(), cwd);
        if let Some(mode) = self.mode {
            task.mode = mode;
        }
        if let Some(path) = &self.system_prompt_file {
            task.system_prompt = fs::read_to_string(path)?;
        }

        let defaults = RetryConfig::default();
        task.retry = RetryConfig {
            auto_retry: self.auto_retry.unwrap_or(defaults.auto_retry),
            base_delay: self
                .retry_base_delay_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.base_delay),
            max_delay: self
                .retry_max_delay_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.max_delay),
            rate_limit: self
                .rate_limit_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.rate_limit),
        };
        if let Some(limit) = self.max_consecutive_mistakes {
            task.max_consecutive_mistakes = limit;
        }
        task.auto_approve = self.auto_approve.iter().cloned().collect();
        task.capabilities = Capabilities::with_disabled(self.disabled_tools.iter().cloned());
        Ok(task)
    }
}

/// Merge names given on the command line as `a,b` lists
pub fn split_names(values: &[String]) -> HashSet<String> {
    values
        .iter()
        .flat_map(|v| v.split(','))
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .collect()
}

/// Generate example config content
pub fn example_config() -> &'static str {
    r#"# vela configuration file
# Place at ~/.config/vela/config.toml (Linux), or point VELA_CONFIG_PATH at it

# Operating mode: "act" (default) or "plan" (no edits or commands)
mode = "act"

# Where task histories are stored (default: the platform data dir)
# data_dir = "/home/me/.local/share/vela"

# Retry failed requests without asking, with exponential backoff
auto_retry = false
retry_base_delay_secs = 5
retry_max_delay_secs = 600

# Minimum seconds between requests (0 disables)
rate_limit_secs = 0

# Consecutive mistakes before asking the user for guidance
max_consecutive_mistakes = 3

# Tools that run without approval
auto_approve = ["read_file", "list_files"]

# Tools the model may never use
disabled_tools = []

# Custom system prompt file (optional)
# system_prompt_file = "~/.config/vela/system_prompt.txt"
"#
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_example_config_parses() {
        let config: Config = toml::from_str(example_config()).unwrap();
        assert_eq!(config.mode, Some(Mode::Act));
        assert_eq!(config.auto_approve, vec!["read_file", "list_files"]);
        assert_eq!(config.max_consecutive_mistakes, Some(3));
    }

    #[test]
    fn test_task_config_applies_overrides() {
        let config = Config {
            mode: Some(Mode::Plan),
            auto_retry: Some(true),
            retry_base_delay_secs: Some(1),
            disabled_tools: vec!["execute_command".to_string()],
            ..Default::default()
        };
        let task = config.task_config(PathBuf::from("/work")).unwrap();
        assert_eq!(task.mode, Mode::Plan);
        assert!(task.retry.auto_retry);
        assert_eq!(task.retry.base_delay, Duration::from_secs(1));
        assert_eq!(task.retry.max_delay, RetryConfig::default().max_delay);
        assert!(task.capabilities.disabled_tools.contains("execute_command"));
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load_from(&dir.path().join("nope.toml"));
        assert!(config.mode.is_none());
        assert!(config.auto_approve.is_empty());
    }

    #[test]
    fn test_split_names() {
        let names = split_names(&["read_file, list_files".to_string(), "".to_string()]);
        assert_eq!(names.len(), 2);
        assert!(names.contains("list_files"));
    }
}
