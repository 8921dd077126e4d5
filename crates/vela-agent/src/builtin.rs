//! Interaction tools every task has: asking the user a question and
//! presenting a finished result.

use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;

use crate::message::{AskKind, SayKind};
use crate::policy::ToolGroup;
use crate::responses;
use crate::tool::{BoxedTool, Tool, ToolContext, ToolError, ToolParams, ToolPreview, ToolResult};

pub const ASK_FOLLOWUP_QUESTION: &str = "ask_followup_question";
pub const ATTEMPT_COMPLETION: &str = "attempt_completion";

/// Both built-in tools
pub fn builtin_tools() -> Vec<BoxedTool> {
    vec![Arc::new(AskFollowupQuestion), Arc::new(AttemptCompletion)]
}

fn param<'a>(params: &'a ToolParams, name: &str) -> &'a str {
    params.get(name).map(String::as_str).unwrap_or_default()
}

pub struct AskFollowupQuestion;

#[async_trait]
impl Tool for AskFollowupQuestion {
    fn name(&self) -> &str {
        ASK_FOLLOWUP_QUESTION
    }

    fn description(&self) -> &str {
        "Ask the user a question to gather information needed to complete the task. \
         Use this when something is ambiguous and cannot be resolved with the other tools."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "question": {
                    "type": "string",
                    "description": "The question to ask the user"
                }
            },
            "required": ["question"]
        })
    }

    fn group(&self) -> ToolGroup {
        ToolGroup::Interaction
    }

    fn preview(&self, params: &ToolParams) -> Option<ToolPreview> {
        Some(ToolPreview::Ask(AskKind::Followup, param(params, "question").to_string()))
    }

    fn approval(&self, _params: &ToolParams) -> Option<(AskKind, String)> {
        None
    }

    async fn execute(&self, params: &ToolParams, ctx: &ToolContext) -> Result<ToolResult, ToolError> {
        let reply = ctx.ask(AskKind::Followup, param(params, "question")).await?;
        let answer = reply.feedback().unwrap_or_default().to_string();
        if !answer.is_empty() {
            ctx.say(SayKind::UserFeedback, &answer)?;
        }
        Ok(ToolResult::text(responses::followup_answer(&answer)))
    }
}

pub struct AttemptCompletion;

#[async_trait]
impl Tool for AttemptCompletion {
    fn name(&self) -> &str {
        ATTEMPT_COMPLETION
    }

    fn description(&self) -> &str {
        "Present the result of your work to the user once the task is complete. \
         The user may accept it or respond with feedback."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "result": {
                    "type": "string",
                    "description": "A final description of the result"
                }
            },
            "required": ["result"]
        })
    }

    fn group(&self) -> ToolGroup {
        ToolGroup::Interaction
    }

    fn preview(&self, params: &ToolParams) -> Option<ToolPreview> {
        Some(ToolPreview::Say(SayKind::CompletionResult, param(params, "result").to_string()))
    }

    fn approval(&self, _params: &ToolParams) -> Option<(AskKind, String)> {
        None
    }

    async fn execute(&self, params: &ToolParams, ctx: &ToolContext) -> Result<ToolResult, ToolError> {
        ctx.say(SayKind::CompletionResult, param(params, "result"))?;
        let reply = ctx.ask(AskKind::CompletionResult, "").await?;
        if reply.is_yes() {
            return Ok(ToolResult::finished(""));
        }
        let feedback = match reply.feedback() {
            Some(fb) => {
                ctx.say(SayKind::UserFeedback, fb)?;
                fb.to_string()
            }
            None => "The user did not accept the result.".to_string(),
        };
        Ok(ToolResult::text(responses::completion_feedback(&feedback)))
    }
}
