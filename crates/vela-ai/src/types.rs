//! Core types for model-facing conversations

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Cost information for a model (per million tokens)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CostInfo {
    pub input: f64,
    pub output: f64,
    pub cache_read: f64,
    pub cache_write: f64,
}

/// Description of the model behind a client
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelInfo {
    /// Model identifier (e.g., "claude-sonnet-4-5-20250929")
    pub id: String,
    /// Human-readable name
    pub name: String,
    /// Cost per million tokens
    #[serde(default)]
    pub cost: CostInfo,
    /// Context window size in tokens
    pub context_window: u32,
    /// Maximum output tokens
    pub max_tokens: u32,
}

impl ModelInfo {
    /// A zero-cost model description, used by offline clients
    pub fn free(id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            cost: CostInfo::default(),
            context_window: 200_000,
            max_tokens: 8192,
        }
    }
}

/// Token usage information
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    pub input: u32,
    pub output: u32,
    pub cache_read: u32,
    pub cache_write: u32,
}

impl Usage {
    /// Fold another usage report into this one
    pub fn add(&mut self, other: &Usage) {
        self.input += other.input;
        self.output += other.output;
        self.cache_read += other.cache_read;
        self.cache_write += other.cache_write;
    }

    /// Calculate cost for this usage given a model
    pub fn calculate_cost(&self, model: &ModelInfo) -> CostBreakdown {
        let input = (self.input as f64 / 1_000_000.0) * model.cost.input;
        let output = (self.output as f64 / 1_000_000.0) * model.cost.output;
        let cache_read = (self.cache_read as f64 / 1_000_000.0) * model.cost.cache_read;
        let cache_write = (self.cache_write as f64 / 1_000_000.0) * model.cost.cache_write;

        CostBreakdown {
            input,
            output,
            cache_read,
            cache_write,
            total: input + output + cache_read + cache_write,
        }
    }
}

/// Cost breakdown in dollars
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CostBreakdown {
    pub input: f64,
    pub output: f64,
    pub cache_read: f64,
    pub cache_write: f64,
    pub total: f64,
}

/// Content blocks in a conversation turn
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    /// Text content
    Text { text: String },
    /// Image content (base64 encoded)
    Image { data: String, mime_type: String },
    /// A tool invocation made by the assistant
    ToolUse {
        id: String,
        name: String,
        input: BTreeMap<String, String>,
    },
    /// The result paired with an earlier tool invocation
    ToolResult {
        tool_use_id: String,
        content: String,
        #[serde(default)]
        is_error: bool,
    },
}

impl ContentBlock {
    /// Create text content
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    /// Create image content from base64 data
    pub fn image(data: impl Into<String>, mime_type: impl Into<String>) -> Self {
        Self::Image {
            data: data.into(),
            mime_type: mime_type.into(),
        }
    }

    /// Create a tool result block
    pub fn tool_result(tool_use_id: impl Into<String>, content: impl Into<String>, is_error: bool) -> Self {
        Self::ToolResult {
            tool_use_id: tool_use_id.into(),
            content: content.into(),
            is_error,
        }
    }

    /// Get text if this is text content
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text { text } => Some(text),
            _ => None,
        }
    }

    /// Check if this is a tool invocation
    pub fn is_tool_use(&self) -> bool {
        matches!(self, Self::ToolUse { .. })
    }
}

/// Who authored a turn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
}

/// One role-attributed entry of the model-facing conversation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: Vec<ContentBlock>,
    #[serde(default)]
    pub ts: i64,
}

impl Message {
    /// Create a user turn with the given blocks
    pub fn user(content: Vec<ContentBlock>) -> Self {
        Self {
            role: Role::User,
            content,
            ts: chrono::Utc::now().timestamp_millis(),
        }
    }

    /// Create an assistant turn with the given blocks
    pub fn assistant(content: Vec<ContentBlock>) -> Self {
        Self {
            role: Role::Assistant,
            content,
            ts: chrono::Utc::now().timestamp_millis(),
        }
    }

    /// Create a user turn holding a single text block
    pub fn user_text(text: impl Into<String>) -> Self {
        Self::user(vec![ContentBlock::text(text)])
    }

    pub fn is_user(&self) -> bool {
        self.role == Role::User
    }

    pub fn is_assistant(&self) -> bool {
        self.role == Role::Assistant
    }

    /// Ids of every tool invocation in this turn, in order
    pub fn tool_use_ids(&self) -> Vec<&str> {
        self.content
            .iter()
            .filter_map(|c| match c {
                ContentBlock::ToolUse { id, .. } => Some(id.as_str()),
                _ => None,
            })
            .collect()
    }

    /// Ids that this turn answers with a tool result
    pub fn tool_result_ids(&self) -> Vec<&str> {
        self.content
            .iter()
            .filter_map(|c| match c {
                ContentBlock::ToolResult { tool_use_id, .. } => Some(tool_use_id.as_str()),
                _ => None,
            })
            .collect()
    }

    /// Get combined text content
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|c| c.as_text())
            .collect::<Vec<_>>()
            .join("")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_usage_cost() {
        let model = ModelInfo {
            id: "m".into(),
            name: "m".into(),
            cost: CostInfo {
                input: 3.0,
                output: 15.0,
                cache_read: 0.3,
                cache_write: 3.75,
            },
            context_window: 200_000,
            max_tokens: 8192,
        };
        let usage = Usage {
            input: 1_000_000,
            output: 100_000,
            ..Default::default()
        };
        let cost = usage.calculate_cost(&model);
        assert!((cost.total - 4.5).abs() < 1e-9);
    }

    #[test]
    fn test_tool_ids() {
        let mut input = BTreeMap::new();
        input.insert("command".to_string(), "ls".to_string());
        let assistant = Message::assistant(vec![
            ContentBlock::text("running"),
            ContentBlock::ToolUse {
                id: "t1".into(),
                name: "execute_command".into(),
                input,
            },
        ]);
        assert_eq!(assistant.tool_use_ids(), vec!["t1"]);

        let user = Message::user(vec![ContentBlock::tool_result("t1", "ok", false)]);
        assert_eq!(user.tool_result_ids(), vec!["t1"]);
        assert!(user.tool_use_ids().is_empty());
    }

    #[test]
    fn test_message_serde_shape() {
        let msg = Message::user(vec![ContentBlock::tool_result("t1", "done", true)]);
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["role"], "user");
        assert_eq!(json["content"][0]["type"], "tool_result");
        assert_eq!(json["content"][0]["is_error"], true);
    }
}
