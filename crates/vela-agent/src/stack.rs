//! Stack of task frames. Only the top frame is active; the ones below it
//! are suspended until it is popped.

use crate::handle::TaskHandle;
use crate::message::AskReply;

#[derive(Default)]
pub struct TaskStack {
    frames: Vec<TaskHandle>,
}

impl TaskStack {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `handle` the active task
    pub fn push(&mut self, handle: TaskHandle) {
        tracing::debug!("Pushing task {} (depth {})", handle.task_id(), self.frames.len() + 1);
        self.frames.push(handle);
    }

    /// Remove the active task, aborting it
    pub fn pop(&mut self) -> Option<TaskHandle> {
        let handle = self.frames.pop()?;
        handle.abort();
        tracing::debug!("Popped task {}", handle.task_id());
        Some(handle)
    }

    pub fn active(&self) -> Option<&TaskHandle> {
        self.frames.last()
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Abort and drop every frame, top first
    pub fn clear(&mut self) {
        while self.pop().is_some() {}
    }

    /// Route an answer to the active task only
    pub fn respond(&self, ask_ts: i64, reply: AskReply) -> bool {
        self.active().is_some_and(|h| h.respond(ask_ts, reply))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{Task, TaskConfig};
    use std::sync::Arc;
    use vela_ai::scripted::ScriptedClient;

    fn handle(dir: &std::path::Path) -> TaskHandle {
        let client = Arc::new(ScriptedClient::new(Vec::new()));
        Task::new(TaskConfig::new(dir, dir), client, Vec::new()).handle()
    }

    #[test]
    fn test_pop_aborts_only_the_top() {
        let dir = tempfile::tempdir().unwrap();
        let mut stack = TaskStack::new();
        let parent = handle(dir.path());
        let child = handle(dir.path());
        stack.push(parent.clone());
        stack.push(child.clone());
        assert_eq!(stack.active().unwrap().task_id(), child.task_id());

        let popped = stack.pop().unwrap();
        assert_eq!(popped.task_id(), child.task_id());
        assert!(child.is_aborted());
        assert!(!parent.is_aborted());
        assert_eq!(stack.active().unwrap().task_id(), parent.task_id());
    }

    #[test]
    fn test_clear_aborts_everything() {
        let dir = tempfile::tempdir().unwrap();
        let mut stack = TaskStack::new();
        let a = handle(dir.path());
        let b = handle(dir.path());
        stack.push(a.clone());
        stack.push(b.clone());
        stack.clear();
        assert!(stack.is_empty());
        assert!(a.is_aborted() && b.is_aborted());
        assert!(stack.pop().is_none());
    }

    #[test]
    fn test_respond_without_frames() {
        let stack = TaskStack::new();
        assert!(!stack.respond(1, AskReply::yes()));
    }
}
