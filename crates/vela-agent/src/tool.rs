//! Tool trait, registry and the context tools run with

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::context::TaskContext;
use crate::message::{AskKind, AskReply, SayKind};
use crate::parser::{self, ToolGrammar};
use crate::policy::ToolGroup;

/// Parameters of a tool call, as parsed from the response
pub type ToolParams = BTreeMap<String, String>;

/// Result of a successful tool execution
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ToolResult {
    /// Text returned to the model
    pub text: String,
    /// The task is finished once this result is recorded
    pub ends_task: bool,
}

impl ToolResult {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ends_task: false,
        }
    }

    /// A result that ends the task loop
    pub fn finished(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ends_task: true,
        }
    }
}

/// A tool failed to do its job
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("{0}")]
    Failed(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// The task was aborted while the tool was running
    #[error("Task aborted")]
    Aborted,

    /// The ask this tool was waiting on was replaced by a newer one
    #[error("Ask was superseded by a newer message")]
    Superseded,
}

impl ToolError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

impl From<crate::Error> for ToolError {
    fn from(e: crate::Error) -> Self {
        match e {
            crate::Error::Aborted => ToolError::Aborted,
            crate::Error::AskSuperseded => ToolError::Superseded,
            other => ToolError::Failed(other.to_string()),
        }
    }
}

/// What the UI shows while a call is still streaming
#[derive(Debug, Clone, PartialEq)]
pub enum ToolPreview {
    /// Shown as a partial ask; the final ask reuses its slot
    Ask(AskKind, String),
    /// Shown as a partial say
    Say(SayKind, String),
}

/// An effectful action the model can invoke
#[async_trait]
pub trait Tool: Send + Sync {
    /// Tool name, also its tag in responses
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// JSON Schema for parameters; every property is a string
    fn parameters_schema(&self) -> serde_json::Value;

    fn group(&self) -> ToolGroup;

    /// Preview built from possibly incomplete parameters. Must not have side
    /// effects.
    fn preview(&self, params: &ToolParams) -> Option<ToolPreview> {
        self.approval(params).map(|(kind, text)| ToolPreview::Ask(kind, text))
    }

    /// The approval question for a complete call, or `None` if the tool
    /// runs without asking.
    fn approval(&self, params: &ToolParams) -> Option<(AskKind, String)>;

    async fn execute(&self, params: &ToolParams, ctx: &ToolContext) -> Result<ToolResult, ToolError>;
}

/// Type alias for a shared tool
pub type BoxedTool = Arc<dyn Tool>;

/// The narrow view of a task that a running tool gets
#[derive(Clone)]
pub struct ToolContext {
    task: Arc<TaskContext>,
    cwd: PathBuf,
}

impl ToolContext {
    pub(crate) fn new(task: Arc<TaskContext>, cwd: PathBuf) -> Self {
        Self { task, cwd }
    }

    pub fn cwd(&self) -> &Path {
        &self.cwd
    }

    pub fn task_id(&self) -> &str {
        self.task.task_id()
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.task.cancel_token()
    }

    pub fn say(&self, kind: SayKind, text: &str) -> Result<(), ToolError> {
        self.task.say(kind, text, Vec::new())?;
        Ok(())
    }

    pub fn say_streaming(&self, kind: SayKind, text: &str, partial: bool) -> Result<(), ToolError> {
        self.task.say_streaming(kind, text, partial)?;
        Ok(())
    }

    pub async fn ask(&self, kind: AskKind, text: &str) -> Result<AskReply, ToolError> {
        Ok(self.task.ask(kind, text).await?)
    }

    /// Strip a half-written closing tag from a streaming value
    pub fn remove_closing_tag(&self, tag: &str, text: &str, partial: bool) -> String {
        parser::remove_closing_tag(tag, text, partial)
    }
}

/// Registered tools plus their compiled parameter validators
#[derive(Default)]
pub struct ToolRegistry {
    tools: Vec<BoxedTool>,
    /// Cached compiled JSON schema validators keyed by tool name
    schema_cache: HashMap<String, Arc<jsonschema::Validator>>,
}

impl ToolRegistry {
    pub fn new(tools: Vec<BoxedTool>) -> Self {
        let mut registry = Self::default();
        for tool in tools {
            registry.add(tool);
        }
        registry
    }

    /// Register a tool, replacing any tool with the same name
    pub fn add(&mut self, tool: BoxedTool) {
        self.cache_tool_schema(&tool);
        self.tools.retain(|t| t.name() != tool.name());
        self.tools.push(tool);
    }

    fn cache_tool_schema(&mut self, tool: &BoxedTool) {
        let schema = tool.parameters_schema();
        match jsonschema::validator_for(&schema) {
            Ok(validator) => {
                self.schema_cache.insert(tool.name().to_string(), Arc::new(validator));
            }
            Err(e) => {
                tracing::warn!(
                    "Invalid tool parameter schema for '{}', skipping validation: {}",
                    tool.name(),
                    e
                );
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<&BoxedTool> {
        self.tools.iter().find(|t| t.name() == name)
    }

    pub fn tools(&self) -> &[BoxedTool] {
        &self.tools
    }

    pub fn tool_names(&self) -> Vec<&str> {
        self.tools.iter().map(|t| t.name()).collect()
    }

    /// Tags the interpreter should recognise for the registered tools
    pub fn grammar(&self) -> ToolGrammar {
        let params: Vec<String> = self
            .tools
            .iter()
            .flat_map(|t| schema_properties(&t.parameters_schema()))
            .collect();
        ToolGrammar::new(self.tools.iter().map(|t| t.name().to_string()), params)
    }

    /// Usage notes for every registered tool, in the tag format the
    /// interpreter understands
    pub fn describe(&self) -> String {
        let mut out = String::new();
        for tool in &self.tools {
            let schema = tool.parameters_schema();
            let required: Vec<&str> = schema
                .get("required")
                .and_then(|r| r.as_array())
                .map(|r| r.iter().filter_map(|v| v.as_str()).collect())
                .unwrap_or_default();

            out.push_str(&format!("## {}\n{}\nParameters:\n", tool.name(), tool.description()));
            let props = schema_properties(&schema);
            for p in &props {
                let description = schema
                    .pointer(&format!("/properties/{}/description", p))
                    .and_then(|d| d.as_str())
                    .unwrap_or_default();
                let need = if required.contains(&p.as_str()) { "required" } else { "optional" };
                out.push_str(&format!("- {}: ({}) {}\n", p, need, description));
            }
            out.push_str(&format!("Usage:\n<{}>\n", tool.name()));
            for p in &props {
                out.push_str(&format!("<{}>...</{}>\n", p, p));
            }
            out.push_str(&format!("</{}>\n\n", tool.name()));
        }
        out
    }

    /// First required parameter of `tool` that is missing or blank
    pub fn missing_required(&self, tool: &dyn Tool, params: &ToolParams) -> Option<String> {
        let schema = tool.parameters_schema();
        let required = schema.get("required")?.as_array()?;
        required
            .iter()
            .filter_map(|r| r.as_str())
            .find(|r| params.get(*r).is_none_or(|v| v.trim().is_empty()))
            .map(str::to_string)
    }

    /// Validate parameters against the tool's schema.
    /// Returns `Some(error_message)` if validation fails, `None` if valid.
    pub fn validate(&self, name: &str, params: &ToolParams) -> Option<String> {
        let validator = self.schema_cache.get(name)?;
        let args = serde_json::to_value(params).ok()?;
        validate_with_validator(&args, validator)
    }
}

fn schema_properties(schema: &serde_json::Value) -> Vec<String> {
    schema
        .get("properties")
        .and_then(|p| p.as_object())
        .map(|props| props.keys().cloned().collect())
        .unwrap_or_default()
}

fn validate_with_validator(args: &serde_json::Value, validator: &jsonschema::Validator) -> Option<String> {
    let errors: Vec<String> = validator
        .iter_errors(args)
        .map(|e| {
            let path = e.instance_path.to_string();
            if path.is_empty() {
                e.to_string()
            } else {
                format!("{}: {}", path, e)
            }
        })
        .collect();

    if errors.is_empty() {
        None
    } else {
        Some(format!("Tool argument validation failed:\n{}", errors.join("\n")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoTool;

    #[async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &str {
            "echo"
        }
        fn description(&self) -> &str {
            "Echoes input"
        }
        fn parameters_schema(&self) -> serde_json::Value {
            serde_json::json!({
                "type": "object",
                "properties": {
                    "text": { "type": "string" },
                    "mode": { "type": "string", "enum": ["loud", "quiet"] }
                },
                "required": ["text"]
            })
        }
        fn group(&self) -> ToolGroup {
            ToolGroup::Read
        }
        fn approval(&self, params: &ToolParams) -> Option<(AskKind, String)> {
            Some((AskKind::Tool, params.get("text").cloned().unwrap_or_default()))
        }
        async fn execute(&self, params: &ToolParams, _ctx: &ToolContext) -> Result<ToolResult, ToolError> {
            Ok(ToolResult::text(params.get("text").cloned().unwrap_or_default()))
        }
    }

    fn params(pairs: &[(&str, &str)]) -> ToolParams {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn test_grammar_collects_params() {
        let registry = ToolRegistry::new(vec![Arc::new(EchoTool)]);
        let grammar = registry.grammar();
        assert_eq!(grammar.tool_names().collect::<Vec<_>>(), vec!["echo"]);
        let blocks = crate::parser::parse_assistant_message("<echo><mode>loud</mode></echo>", &grammar);
        assert!(matches!(&blocks[0], crate::parser::AssistantBlock::ToolUse { params, .. } if params["mode"] == "loud"));
    }

    #[test]
    fn test_missing_required() {
        let registry = ToolRegistry::new(vec![Arc::new(EchoTool)]);
        let tool = registry.get("echo").unwrap().clone();
        assert_eq!(registry.missing_required(tool.as_ref(), &params(&[])), Some("text".into()));
        assert_eq!(registry.missing_required(tool.as_ref(), &params(&[("text", "  ")])), Some("text".into()));
        assert_eq!(registry.missing_required(tool.as_ref(), &params(&[("text", "hi")])), None);
    }

    #[test]
    fn test_validate_enum() {
        let registry = ToolRegistry::new(vec![Arc::new(EchoTool)]);
        assert!(registry.validate("echo", &params(&[("text", "hi"), ("mode", "loud")])).is_none());
        let err = registry.validate("echo", &params(&[("text", "hi"), ("mode", "shout")]));
        assert!(err.unwrap().contains("/mode"));
    }

    #[test]
    fn test_invalid_schema_skips_validation() {
        struct BadSchema;
        #[async_trait]
        impl Tool for BadSchema {
            fn name(&self) -> &str {
                "bad"
            }
            fn description(&self) -> &str {
                ""
            }
            fn parameters_schema(&self) -> serde_json::Value {
                serde_json::json!({"type": "not_a_real_type"})
            }
            fn group(&self) -> ToolGroup {
                ToolGroup::Read
            }
            fn approval(&self, _: &ToolParams) -> Option<(AskKind, String)> {
                None
            }
            async fn execute(&self, _: &ToolParams, _: &ToolContext) -> Result<ToolResult, ToolError> {
                Ok(ToolResult::default())
            }
        }
        let registry = ToolRegistry::new(vec![Arc::new(BadSchema)]);
        assert!(registry.validate("bad", &params(&[("x", "y")])).is_none());
    }

    #[test]
    fn test_default_preview_uses_approval() {
        let p = EchoTool.preview(&params(&[("text", "hi")]));
        assert_eq!(p, Some(ToolPreview::Ask(AskKind::Tool, "hi".into())));
    }

    #[test]
    fn test_tool_error_from_engine_error() {
        assert!(matches!(ToolError::from(crate::Error::Aborted), ToolError::Aborted));
        assert!(matches!(ToolError::from(crate::Error::AskSuperseded), ToolError::Superseded));
    }
}
