//! A cloneable handle for driving a task from the host.

use std::sync::Arc;
use tokio::sync::broadcast;

use crate::context::TaskContext;
use crate::events::TaskEvent;
use crate::message::{AskReply, UiMessage};

/// A cloneable handle for answering asks, aborting and watching a task.
///
/// Cloning is cheap; every clone refers to the same task.
#[derive(Clone)]
pub struct TaskHandle {
    ctx: Arc<TaskContext>,
}

impl TaskHandle {
    pub(crate) fn new(ctx: Arc<TaskContext>) -> Self {
        Self { ctx }
    }

    pub fn task_id(&self) -> &str {
        self.ctx.task_id()
    }

    /// Abort the task. Pending asks resolve as aborted and nothing further
    /// is posted.
    pub fn abort(&self) {
        self.ctx.abort();
    }

    pub fn is_aborted(&self) -> bool {
        self.ctx.is_aborted()
    }

    /// Resolves once the task has been aborted
    pub async fn aborted(&self) {
        let token = self.ctx.cancel_token();
        token.cancelled().await;
    }

    /// Answer the ask posted at `ask_ts`. Returns false when that ask is no
    /// longer the live one.
    pub fn respond(&self, ask_ts: i64, reply: AskReply) -> bool {
        self.ctx.respond(ask_ts, reply)
    }

    /// `ts` of the ask currently waiting for an answer
    pub fn pending_ask(&self) -> Option<i64> {
        self.ctx.pending_ask_ts()
    }

    /// Subscribe to task events. Subscribe before starting the task to see
    /// every message.
    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.ctx.subscribe()
    }

    /// Snapshot of the UI log
    pub fn ui_messages(&self) -> Vec<UiMessage> {
        self.ctx.ui_messages()
    }
}
