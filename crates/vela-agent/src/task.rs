//! The task loop: one model request per turn, tool dispatch while the
//! response streams, and persistence of whatever state the turn ends in.

use futures::future::BoxFuture;
use futures::stream::FuturesUnordered;
use futures::{FutureExt, StreamExt};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use vela_ai::{ApiStreamChunk, ContentBlock, Message, ModelClient, Usage};

use crate::builtin::builtin_tools;
use crate::context::TaskContext;
use crate::dispatch::Dispatcher;
use crate::error::{Error, Result};
use crate::events::{TaskEvent, TaskExit};
use crate::handle::TaskHandle;
use crate::message::{ApiRequestInfo, AskKind, CancelReason, SayKind};
use crate::mistakes::DEFAULT_MISTAKE_LIMIT;
use crate::parser::{ToolGrammar, parse_assistant_message};
use crate::policy::{Capabilities, DefaultPolicy, Mode, ToolPolicy};
use crate::presenter::{Presenter, TurnState};
use crate::responses;
use crate::resume::load_for_resume;
use crate::retry::{RequestController, RetryConfig};
use crate::store::{ConversationStore, TaskStore};
use crate::tool::{BoxedTool, ToolRegistry};

const DEFAULT_SYSTEM_PROMPT: &str = "You are a capable software engineer working in the user's project. \
Work through the task step by step, using exactly one tool per message and waiting for its result \
before continuing. When the task is done, present the outcome with attempt_completion.";

/// Configuration for a task
#[derive(Clone)]
pub struct TaskConfig {
    /// Base instructions; tool usage notes are appended
    pub system_prompt: String,
    pub mode: Mode,
    pub capabilities: Capabilities,
    pub policy: Arc<dyn ToolPolicy>,
    /// Tools that run without asking for approval
    pub auto_approve: HashSet<String>,
    pub retry: RetryConfig,
    pub max_consecutive_mistakes: u32,
    /// Root of the persisted task directories
    pub data_dir: PathBuf,
    pub cwd: PathBuf,
}

impl TaskConfig {
    pub fn new(data_dir: impl Into<PathBuf>, cwd: impl Into<PathBuf>) -> Self {
        Self {
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            mode: Mode::default(),
            capabilities: Capabilities::default(),
            policy: Arc::new(DefaultPolicy),
            auto_approve: HashSet::new(),
            retry: RetryConfig::default(),
            max_consecutive_mistakes: DEFAULT_MISTAKE_LIMIT,
            data_dir: data_dir.into(),
            cwd: cwd.into(),
        }
    }
}

/// How a turn ended
enum TurnEnd {
    Completed,
    /// Content for the next user turn
    Continue(Vec<ContentBlock>),
}

/// What is left over from a previous session, waiting for `resume`
struct PendingResume {
    carried: Vec<ContentBlock>,
    ask: AskKind,
    last_activity: i64,
}

type PresentFuture = BoxFuture<'static, Result<()>>;

/// A single task: its conversation, its tools and the loop that drives them
pub struct Task {
    ctx: Arc<TaskContext>,
    client: Arc<dyn ModelClient>,
    tools: Arc<ToolRegistry>,
    config: Arc<TaskConfig>,
    requests: Arc<RequestController>,
    grammar: ToolGrammar,
    system_prompt: Arc<str>,
    pending_resume: Option<PendingResume>,
}

impl Task {
    /// Create a fresh task with a new id
    pub fn new(config: TaskConfig, client: Arc<dyn ModelClient>, tools: Vec<BoxedTool>) -> Self {
        let id = uuid::Uuid::new_v4().to_string();
        let store = ConversationStore::new(TaskStore::new(&config.data_dir, id));
        Self::build(config, client, tools, store, None)
    }

    /// Load a persisted task for resumption. Call [`Task::resume`] to continue it.
    pub fn open(
        config: TaskConfig,
        client: Arc<dyn ModelClient>,
        tools: Vec<BoxedTool>,
        task_id: &str,
    ) -> Result<Self> {
        let state = load_for_resume(TaskStore::new(&config.data_dir, task_id))?;
        let pending = PendingResume {
            carried: state.carried,
            ask: state.ask,
            last_activity: state.last_activity,
        };
        Ok(Self::build(config, client, tools, state.store, Some(pending)))
    }

    fn build(
        config: TaskConfig,
        client: Arc<dyn ModelClient>,
        tools: Vec<BoxedTool>,
        store: ConversationStore,
        pending_resume: Option<PendingResume>,
    ) -> Self {
        let mut registry = ToolRegistry::new(tools);
        for tool in builtin_tools() {
            registry.add(tool);
        }
        let system_prompt = format!(
            "{}\n\nMode: {}\nWorking directory: {}\n\n# Tools\n\n{}",
            config.system_prompt,
            config.mode,
            config.cwd.display(),
            registry.describe()
        );

        Self {
            ctx: Arc::new(TaskContext::new(store, config.max_consecutive_mistakes)),
            client,
            grammar: registry.grammar(),
            tools: Arc::new(registry),
            requests: Arc::new(RequestController::new(config.retry.clone())),
            config: Arc::new(config),
            system_prompt: system_prompt.into(),
            pending_resume,
        }
    }

    pub fn id(&self) -> &str {
        self.ctx.task_id()
    }

    /// A handle for answering asks, aborting and watching events
    pub fn handle(&self) -> TaskHandle {
        TaskHandle::new(Arc::clone(&self.ctx))
    }

    /// Run a new task to completion or abort
    pub async fn start(self, task: &str, images: Vec<String>) -> Result<TaskExit> {
        tracing::info!("Starting task {}", self.id());
        let result = self.start_inner(task, images).await;
        self.finish(result)
    }

    async fn start_inner(&self, task: &str, images: Vec<String>) -> Result<TaskExit> {
        self.ctx.say(SayKind::Task, task, images)?;
        self.run_loop(vec![ContentBlock::text(responses::task_prompt(task))])
            .await
    }

    /// Continue a task loaded with [`Task::open`]
    pub async fn resume(mut self) -> Result<TaskExit> {
        let Some(pending) = self.pending_resume.take() else {
            return Err(Error::Other(format!("task {} was not opened for resumption", self.id())));
        };
        tracing::info!("Resuming task {}", self.id());
        let result = self.resume_inner(pending).await;
        self.finish(result)
    }

    async fn resume_inner(&self, pending: PendingResume) -> Result<TaskExit> {
        let reply = self.ctx.ask(pending.ask, "").await?;
        let feedback = reply.feedback().map(str::to_string);
        if let Some(fb) = &feedback {
            self.ctx.say(SayKind::UserFeedback, fb, reply.images.clone())?;
        }

        let elapsed = chrono::Utc::now().timestamp_millis() - pending.last_activity;
        let mut content = pending.carried;
        content.push(ContentBlock::text(responses::task_resumption(
            &responses::format_ago(elapsed),
            &self.config.cwd.display().to_string(),
            pending.ask == AskKind::ResumeCompletedTask,
            feedback.as_deref(),
        )));
        for image in reply.images {
            content.push(ContentBlock::image(image, "image/png"));
        }
        self.run_loop(content).await
    }

    fn finish(&self, result: Result<TaskExit>) -> Result<TaskExit> {
        let result = match result {
            Err(Error::Aborted) => Ok(TaskExit::Aborted),
            other => other,
        };
        match &result {
            Ok(exit) => {
                tracing::info!("Task {} finished: {:?}", self.id(), exit);
                self.ctx.emit(TaskEvent::TaskFinished {
                    task_id: self.id().to_string(),
                    exit: *exit,
                });
            }
            Err(e) => {
                tracing::error!("Task {} failed: {}", self.id(), e);
                self.ctx.emit(TaskEvent::Error { message: e.to_string() });
            }
        }
        result
    }

    async fn run_loop(&self, mut user_content: Vec<ContentBlock>) -> Result<TaskExit> {
        loop {
            if self.ctx.is_aborted() {
                return Ok(TaskExit::Aborted);
            }

            let limit_reached = self.ctx.mistakes.lock().limit_reached();
            if limit_reached {
                tracing::warn!("Task {} hit the consecutive mistake limit", self.id());
                let reply = self
                    .ctx
                    .ask(
                        AskKind::MistakeLimitReached,
                        "The model is having trouble using tools. Add guidance to help it, or let it try again.",
                    )
                    .await?;
                if let Some(fb) = reply.feedback() {
                    self.ctx.say(SayKind::UserFeedback, fb, reply.images.clone())?;
                    user_content.push(ContentBlock::text(responses::too_many_mistakes(fb)));
                }
                self.ctx.mistakes.lock().reset();
            }

            match self.run_turn(user_content).await? {
                TurnEnd::Completed => return Ok(TaskExit::Completed),
                TurnEnd::Continue(next) => user_content = next,
            }
        }
    }

    async fn run_turn(&self, user_content: Vec<ContentBlock>) -> Result<TurnEnd> {
        let request = request_text(&user_content);
        self.ctx.append_turn(Message::user(user_content))?;
        let info = ApiRequestInfo {
            request: Some(request),
            ..Default::default()
        };
        let api_ts = self.ctx.say(SayKind::ApiReqStarted, &info.to_text(), Vec::new())?;

        let turn = Arc::new(Mutex::new(TurnState::new()));
        let dispatcher = Dispatcher::new(
            Arc::clone(&self.ctx),
            Arc::clone(&self.tools),
            Arc::clone(&turn),
            Arc::clone(&self.config),
        );
        let presenter = Arc::new(Presenter::new(Arc::clone(&turn), Arc::new(dispatcher)));
        let mut inflight: FuturesUnordered<PresentFuture> = FuturesUnordered::new();

        let stream = Arc::clone(&self.requests).attempt_request(
            Arc::clone(&self.ctx),
            Arc::clone(&self.client),
            Arc::clone(&self.system_prompt),
            self.ctx.history(),
        );
        let mut stream = Box::pin(stream);
        let cancel = self.ctx.cancel_token();

        let mut text = String::new();
        let mut reasoning = String::new();
        let mut reasoning_open = false;
        let mut usage = Usage::default();
        let mut total_cost: Option<f64> = None;

        let streamed: Result<()> = loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break Err(Error::Aborted),
                Some(done) = inflight.next(), if !inflight.is_empty() => {
                    if let Err(e) = done {
                        break Err(e);
                    }
                }
                item = stream.next() => match item {
                    None => break Ok(()),
                    Some(Ok(ApiStreamChunk::Text { text: chunk })) => {
                        if reasoning_open {
                            reasoning_open = false;
                            if let Err(e) = self.ctx.say_streaming(SayKind::Reasoning, &reasoning, false) {
                                break Err(e);
                            }
                        }
                        text.push_str(&chunk);
                        let blocks = parse_assistant_message(&text, &self.grammar);
                        turn.lock().update_blocks(blocks);
                        inflight.push(present(&presenter));
                    }
                    Some(Ok(ApiStreamChunk::Reasoning { reasoning: delta })) => {
                        reasoning.push_str(&delta);
                        reasoning_open = true;
                        if let Err(e) = self.ctx.say_streaming(SayKind::Reasoning, &reasoning, true) {
                            break Err(e);
                        }
                    }
                    Some(Ok(ApiStreamChunk::Usage { usage: delta, total_cost: cost })) => {
                        usage.add(&delta);
                        if cost.is_some() {
                            total_cost = cost;
                        }
                    }
                    Some(Err(e)) => break Err(e),
                }
            }
        };

        match streamed {
            Ok(()) => {}
            Err(Error::Aborted) => {
                drop(inflight);
                self.persist_interrupted(&turn, api_ts, None, CancelReason::UserCancelled, None)?;
                return Err(Error::Aborted);
            }
            Err(Error::StreamInterrupted(message)) => {
                drop(inflight);
                self.persist_interrupted(
                    &turn,
                    api_ts,
                    None,
                    CancelReason::StreamingFailed,
                    Some(message.clone()),
                )?;
                return Err(Error::StreamInterrupted(message));
            }
            Err(e) => {
                drop(inflight);
                self.ctx.cancel_pending_asks();
                return Err(e);
            }
        }

        if reasoning_open {
            self.ctx.say_streaming(SayKind::Reasoning, &reasoning, false)?;
        }
        let cost = total_cost.unwrap_or_else(|| usage.calculate_cost(&self.client.model()).total);
        self.ctx.update_api_request(api_ts, |info| {
            info.tokens_in = usage.input;
            info.tokens_out = usage.output;
            info.cache_reads = usage.cache_read;
            info.cache_writes = usage.cache_write;
            info.cost = Some(cost);
        })?;

        if text.trim().is_empty() {
            tracing::warn!("Model returned an empty response");
            drop(inflight);
            self.ctx.say(
                SayKind::Error,
                "Unexpected API response: the model returned no assistant message.",
                Vec::new(),
            )?;
            self.ctx
                .append_turn(Message::assistant(vec![ContentBlock::text(responses::EMPTY_RESPONSE)]))?;
            self.ctx.mistakes.lock().record();
            return Ok(TurnEnd::Continue(vec![ContentBlock::text(responses::no_tools_used())]));
        }

        let assistant = {
            let mut state = turn.lock();
            state.complete_stream();
            Message::assistant(state.assistant_content(false))
        };
        self.ctx.append_turn(assistant.clone())?;

        inflight.push(present(&presenter));
        while !inflight.is_empty() {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(Error::Aborted),
                Some(done) = inflight.next() => done,
            };
            if let Err(e) = next {
                drop(inflight);
                if e.is_aborted() {
                    self.persist_interrupted(&turn, api_ts, Some(&assistant), CancelReason::UserCancelled, None)?;
                }
                return Err(e);
            }
        }

        let (ready, mut next_content, completed) = {
            let state = turn.lock();
            (state.user_content_ready, state.user_content.clone(), state.completed)
        };
        if !ready {
            tracing::warn!("Presentation ended before every block was handled");
        }

        if completed {
            if !next_content.is_empty() {
                self.ctx.append_turn(Message::user(next_content))?;
            }
            return Ok(TurnEnd::Completed);
        }

        if !assistant.content.iter().any(ContentBlock::is_tool_use) {
            let count = self.ctx.mistakes.lock().record();
            tracing::debug!("Turn used no tool ({} consecutive mistakes)", count);
            next_content.push(ContentBlock::text(responses::no_tools_used()));
        }
        Ok(TurnEnd::Continue(next_content))
    }

    /// Persist a turn that was cut short: the assistant content that made it
    /// (unless already saved), a marker, and a result for every tool call.
    fn persist_interrupted(
        &self,
        turn: &Mutex<TurnState>,
        api_ts: i64,
        persisted: Option<&Message>,
        reason: CancelReason,
        failure: Option<String>,
    ) -> Result<()> {
        self.ctx.cancel_pending_asks();
        if let Err(e) = self.ctx.finalize_partial_ui() {
            tracing::warn!("Failed to close partial message: {}", e);
        }

        let assistant = match persisted {
            Some(message) => message.clone(),
            None => {
                let marker = match reason {
                    CancelReason::UserCancelled => responses::INTERRUPTED_BY_USER,
                    CancelReason::StreamingFailed => responses::INTERRUPTED_BY_API_ERROR,
                };
                let mut content = turn.lock().assistant_content(true);
                content.push(ContentBlock::text(marker));
                let message = Message::assistant(content);
                self.ctx.append_turn(message.clone())?;
                message
            }
        };

        let mut results = turn.lock().user_content.clone();
        let answered: HashSet<String> = results
            .iter()
            .filter_map(|b| match b {
                ContentBlock::ToolResult { tool_use_id, .. } => Some(tool_use_id.clone()),
                _ => None,
            })
            .collect();
        for id in assistant.tool_use_ids() {
            if !answered.contains(id) {
                results.push(ContentBlock::tool_result(id, responses::TOOL_INTERRUPTED, true));
            }
        }
        if !results.is_empty() {
            self.ctx.append_turn(Message::user(results))?;
        }

        self.ctx.update_api_request(api_ts, |info| {
            info.cancel_reason = Some(reason);
            info.streaming_failed_message = failure;
        })
    }
}

/// What the `api_req_started` marker shows for an outgoing user turn
fn request_text(content: &[ContentBlock]) -> String {
    content
        .iter()
        .filter_map(|block| match block {
            ContentBlock::Text { text } => Some(text.clone()),
            ContentBlock::ToolResult { tool_use_id, content, .. } => {
                Some(format!("[tool_result {}] {}", tool_use_id, content))
            }
            ContentBlock::Image { .. } => Some("[image]".to_string()),
            ContentBlock::ToolUse { .. } => None,
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

fn present(presenter: &Arc<Presenter>) -> PresentFuture {
    let presenter = Arc::clone(presenter);
    async move { presenter.present().await }.boxed()
}
