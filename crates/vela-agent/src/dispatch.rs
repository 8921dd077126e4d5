//! Tool dispatch for one assistant turn.
//!
//! A tool block is seen first while its parameters stream in (preview only,
//! no side effects) and then once complete: policy check, parameter
//! validation, approval, execution. Each complete pass yields a
//! [`DispatchOutcome`] which the [`TurnPolicy`] folds into what the rest of
//! the turn is allowed to do.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use vela_ai::ContentBlock;

use crate::context::TaskContext;
use crate::error::{Error, Result};
use crate::message::SayKind;
use crate::parser::{self, AssistantBlock};
use crate::presenter::{BlockHandler, TurnState};
use crate::responses;
use crate::task::TaskConfig;
use crate::tool::{BoxedTool, ToolContext, ToolError, ToolParams, ToolPreview, ToolRegistry};

/// What handling one tool block amounted to
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    /// The tool ran and succeeded
    Executed,
    /// The tool ran (or was cleared to run) and failed
    Failed,
    /// Rejected before execution: not allowed, unknown, or bad parameters
    Invalid,
    /// Not attempted because of an earlier block in this turn
    Skipped(String),
    /// The user said no, optionally with feedback
    Denied(Option<String>),
    /// A partial block was previewed
    Previewed,
}

/// Per-turn fold of dispatch outcomes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TurnPolicy {
    tool_used: bool,
    rejected: bool,
}

impl TurnPolicy {
    pub fn record(&mut self, outcome: &DispatchOutcome) {
        match outcome {
            DispatchOutcome::Executed | DispatchOutcome::Failed => self.tool_used = true,
            DispatchOutcome::Denied(_) => self.rejected = true,
            DispatchOutcome::Invalid | DispatchOutcome::Skipped(_) | DispatchOutcome::Previewed => {}
        }
    }

    pub fn tool_used(&self) -> bool {
        self.tool_used
    }

    pub fn rejected(&self) -> bool {
        self.rejected
    }

    /// Later blocks are skipped without being looked at
    pub fn short_circuits(&self) -> bool {
        self.tool_used || self.rejected
    }

    /// Result text for a tool block that must not run
    pub fn skip_reason(&self, tool: &str) -> Option<String> {
        if self.rejected {
            Some(responses::tool_skipped_after_rejection(tool))
        } else if self.tool_used {
            Some(responses::tool_already_used(tool))
        } else {
            None
        }
    }
}

/// Handles the blocks of one turn on behalf of the presenter
pub(crate) struct Dispatcher {
    ctx: Arc<TaskContext>,
    tools: Arc<ToolRegistry>,
    turn: Arc<Mutex<TurnState>>,
    config: Arc<TaskConfig>,
}

impl Dispatcher {
    pub(crate) fn new(
        ctx: Arc<TaskContext>,
        tools: Arc<ToolRegistry>,
        turn: Arc<Mutex<TurnState>>,
        config: Arc<TaskConfig>,
    ) -> Self {
        Self {
            ctx,
            tools,
            turn,
            config,
        }
    }

    fn present_text(&self, content: &str, partial: bool) -> Result<()> {
        if self.turn.lock().policy.short_circuits() {
            return Ok(());
        }
        let display = parser::display_text(content, partial);
        if display.is_empty() {
            return Ok(());
        }
        self.ctx.say_streaming(SayKind::Text, &display, partial)?;
        Ok(())
    }

    fn push_result(&self, tool_use_id: &str, text: impl Into<String>, is_error: bool) {
        self.turn
            .lock()
            .user_content
            .push(ContentBlock::tool_result(tool_use_id, text, is_error));
    }

    fn record_mistake(&self) {
        self.ctx.mistakes.lock().record();
    }

    fn auto_approved(&self, name: &str) -> bool {
        self.config.auto_approve.contains(name)
    }

    fn is_allowed(&self, tool: &BoxedTool) -> bool {
        self.config.policy.is_tool_allowed(
            tool.name(),
            tool.group(),
            self.config.mode,
            &self.config.capabilities,
        )
    }

    async fn dispatch_tool(&self, index: usize, name: &str, params: ToolParams, partial: bool) -> Result<DispatchOutcome> {
        let (id, skip) = {
            let turn = self.turn.lock();
            (turn.tool_use_id(index), turn.policy.skip_reason(name))
        };
        if let Some(reason) = skip {
            tracing::debug!("Skipping tool {} at block {}", name, index);
            self.push_result(&id, reason.clone(), true);
            return Ok(DispatchOutcome::Skipped(reason));
        }

        let Some(tool) = self.tools.get(name).cloned() else {
            if partial {
                return Ok(DispatchOutcome::Previewed);
            }
            self.record_mistake();
            self.push_result(&id, responses::unknown_tool(name), true);
            return Ok(DispatchOutcome::Invalid);
        };

        if partial {
            if self.is_allowed(&tool) {
                self.preview(&tool, &params)?;
            }
            return Ok(DispatchOutcome::Previewed);
        }

        self.run_complete(&id, &tool, params).await
    }

    fn preview(&self, tool: &BoxedTool, params: &ToolParams) -> Result<()> {
        let cleaned: ToolParams = params
            .iter()
            .map(|(k, v)| (k.clone(), parser::remove_closing_tag(k, v, true)))
            .collect();
        match tool.preview(&cleaned) {
            Some(ToolPreview::Ask(_, text)) if self.auto_approved(tool.name()) => {
                self.ctx.say_streaming(SayKind::Tool, &text, true)?;
            }
            Some(ToolPreview::Ask(kind, text)) => {
                self.ctx.ask_partial(kind, &text)?;
            }
            Some(ToolPreview::Say(kind, text)) => {
                self.ctx.say_streaming(kind, &text, true)?;
            }
            None => {}
        }
        Ok(())
    }

    async fn run_complete(&self, id: &str, tool: &BoxedTool, params: ToolParams) -> Result<DispatchOutcome> {
        let name = tool.name();

        if !self.is_allowed(tool) {
            let message = responses::tool_not_allowed(name, &self.config.mode.to_string());
            tracing::warn!("{}", message);
            self.record_mistake();
            self.ctx.discard_partial_ask()?;
            self.ctx.say(SayKind::Error, &message, Vec::new())?;
            self.push_result(id, message, true);
            return Ok(DispatchOutcome::Invalid);
        }

        if let Some(param) = self.tools.missing_required(tool.as_ref(), &params) {
            self.record_mistake();
            self.ctx.discard_partial_ask()?;
            self.ctx.say(
                SayKind::Error,
                &format!(
                    "Tried to use {} without value for required parameter '{}'. Retrying...",
                    name, param
                ),
                Vec::new(),
            )?;
            self.push_result(id, responses::missing_param(&param), true);
            return Ok(DispatchOutcome::Invalid);
        }

        if let Some(details) = self.tools.validate(name, &params) {
            self.record_mistake();
            self.ctx.discard_partial_ask()?;
            self.ctx.say(SayKind::Error, &details, Vec::new())?;
            self.push_result(id, responses::invalid_params(&details), true);
            return Ok(DispatchOutcome::Invalid);
        }

        match tool.approval(&params) {
            Some((_, text)) if self.auto_approved(name) => {
                self.ctx.say(SayKind::Tool, &text, Vec::new())?;
            }
            Some((kind, text)) => {
                let reply = match self.ctx.ask(kind, &text).await {
                    Ok(reply) => reply,
                    Err(Error::AskSuperseded) => {
                        self.push_result(id, responses::tool_error("The approval request was superseded."), true);
                        return Ok(DispatchOutcome::Failed);
                    }
                    Err(e) => return Err(e),
                };
                if !reply.is_yes() {
                    let feedback = reply.feedback().map(str::to_string);
                    let text = match &feedback {
                        Some(fb) => {
                            self.ctx.say(SayKind::UserFeedback, fb, reply.images.clone())?;
                            responses::tool_denied_with_feedback(fb)
                        }
                        None => responses::TOOL_DENIED.to_string(),
                    };
                    tracing::debug!("User denied tool {}", name);
                    self.push_result(id, text, true);
                    return Ok(DispatchOutcome::Denied(feedback));
                }
            }
            None => {}
        }

        tracing::debug!("Executing tool {} ({})", name, id);
        let tool_ctx = ToolContext::new(Arc::clone(&self.ctx), self.config.cwd.clone());
        let result = tool.execute(&params, &tool_ctx).await;
        if self.ctx.is_aborted() {
            return Err(Error::Aborted);
        }

        match result {
            Ok(result) => {
                self.ctx.mistakes.lock().reset();
                let mut turn = self.turn.lock();
                turn.user_content
                    .push(ContentBlock::tool_result(id, result.text, false));
                if result.ends_task {
                    turn.completed = true;
                }
                Ok(DispatchOutcome::Executed)
            }
            Err(ToolError::Aborted) => Err(Error::Aborted),
            Err(ToolError::Superseded) => {
                self.push_result(id, responses::tool_error("The request was superseded."), true);
                Ok(DispatchOutcome::Failed)
            }
            Err(e) => {
                self.handle_error(id, name, &e)?;
                Ok(DispatchOutcome::Failed)
            }
        }
    }

    fn handle_error(&self, id: &str, name: &str, error: &ToolError) -> Result<()> {
        tracing::warn!("Tool {} failed: {}", name, error);
        let message = error.to_string();
        self.ctx.say(
            SayKind::Error,
            &format!("Error executing {}:\n{}", name, message),
            Vec::new(),
        )?;
        self.push_result(id, responses::tool_error(&message), true);
        Ok(())
    }
}

#[async_trait]
impl BlockHandler for Dispatcher {
    async fn handle_block(&self, index: usize, block: AssistantBlock) -> Result<()> {
        match block {
            AssistantBlock::Text { content, partial } => self.present_text(&content, partial),
            AssistantBlock::ToolUse { name, params, partial } => {
                let outcome = self.dispatch_tool(index, &name, params, partial).await?;
                self.turn.lock().policy.record(&outcome);
                Ok(())
            }
        }
    }
}
