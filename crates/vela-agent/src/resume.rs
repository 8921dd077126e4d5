//! Reconciling persisted state before a task resumes.
//!
//! A task can stop anywhere: mid-stream, mid-approval, mid-tool. Loading for
//! resumption trims UI bookkeeping that belonged to the dead session and
//! repairs the history so every tool call has a result. Repairs are persisted,
//! so loading twice gives the same state.

use std::collections::HashSet;
use vela_ai::{ContentBlock, Message};

use crate::error::{Error, Result};
use crate::message::{ApiRequestInfo, AskKind, SayKind, UiMessage};
use crate::responses;
use crate::store::{ConversationStore, TaskStore};

/// State recovered for a resumed task
#[derive(Debug)]
pub struct ResumeState {
    pub store: ConversationStore,
    /// Content of a trailing user turn, carried into the resumption prompt
    pub carried: Vec<ContentBlock>,
    /// Which resume ask to put to the user
    pub ask: AskKind,
    /// `ts` of the newest surviving UI message
    pub last_activity: i64,
}

impl ResumeState {
    pub fn was_completed(&self) -> bool {
        self.ask == AskKind::ResumeCompletedTask
    }
}

/// Load a task's documents and reconcile them for resumption
pub fn load_for_resume(task: TaskStore) -> Result<ResumeState> {
    let mut store = ConversationStore::load(task)?;
    if store.history().is_empty() && store.ui_messages().is_empty() {
        return Err(Error::NothingToResume(store.task_store().task_id().to_string()));
    }

    let mut ui = store.ui_messages().to_vec();
    let ui_changed = trim_ui_for_resume(&mut ui);
    if ui_changed {
        store.overwrite_ui(ui)?;
    }

    if let Some(repaired) = repair_history(store.history()) {
        tracing::info!(
            "Repaired history of task {} before resuming",
            store.task_store().task_id()
        );
        store.overwrite_history(repaired)?;
    }

    let carried = store
        .pop_trailing_user_turn()
        .map(|turn| turn.content)
        .unwrap_or_default();

    let ask = match store.last_ui() {
        Some(m) if m.is_ask(AskKind::CompletionResult) => AskKind::ResumeCompletedTask,
        _ => AskKind::ResumeTask,
    };
    let last_activity = store.last_ui().map(|m| m.ts).unwrap_or_default();

    Ok(ResumeState {
        store,
        carried,
        ask,
        last_activity,
    })
}

/// Drop trailing resume asks and the marker of a request that never finished.
/// Returns whether anything changed.
fn trim_ui_for_resume(ui: &mut Vec<UiMessage>) -> bool {
    let before = ui.len();
    while ui
        .last()
        .is_some_and(|m| m.is_ask(AskKind::ResumeTask) || m.is_ask(AskKind::ResumeCompletedTask))
    {
        ui.pop();
    }

    let last_marker = ui.iter().rposition(|m| m.is_say(SayKind::ApiReqStarted));
    if let Some(idx) = last_marker {
        if !ApiRequestInfo::from_text(&ui[idx].text).is_finished() {
            ui.remove(idx);
        }
    }
    ui.len() != before
}

/// Pair every dangling tool call with an "interrupted" result.
///
/// Returns `None` when the history is already consistent.
pub fn repair_history(history: &[Message]) -> Option<Vec<Message>> {
    let last = history.last()?;

    if last.is_assistant() {
        let results = interrupted_results(last.tool_use_ids(), &HashSet::new());
        if results.is_empty() {
            return None;
        }
        let mut repaired = history.to_vec();
        repaired.push(Message::user(results));
        return Some(repaired);
    }

    let prev = history.len().checked_sub(2).map(|i| &history[i])?;
    if !prev.is_assistant() {
        return None;
    }
    let answered: HashSet<&str> = last.tool_result_ids().into_iter().collect();
    let results = interrupted_results(prev.tool_use_ids(), &answered);
    if results.is_empty() {
        return None;
    }
    let mut repaired = history.to_vec();
    if let Some(turn) = repaired.last_mut() {
        // results lead the turn, in call order
        let rest = std::mem::take(&mut turn.content);
        turn.content = merge_results(results, rest);
    }
    Some(repaired)
}

fn interrupted_results(calls: Vec<&str>, answered: &HashSet<&str>) -> Vec<ContentBlock> {
    calls
        .into_iter()
        .filter(|id| !answered.contains(id))
        .map(|id| ContentBlock::tool_result(id, responses::TOOL_INTERRUPTED, true))
        .collect()
}

fn merge_results(synthesized: Vec<ContentBlock>, existing: Vec<ContentBlock>) -> Vec<ContentBlock> {
    let (mut results, others): (Vec<_>, Vec<_>) = existing
        .into_iter()
        .partition(|b| matches!(b, ContentBlock::ToolResult { .. }));
    results.extend(synthesized);
    results.extend(others);
    results
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::CancelReason;
    use std::collections::BTreeMap;

    fn tool_use(id: &str) -> ContentBlock {
        ContentBlock::ToolUse {
            id: id.to_string(),
            name: "read_file".to_string(),
            input: BTreeMap::new(),
        }
    }

    #[test]
    fn test_consistent_history_untouched() {
        let history = vec![
            Message::user_text("task"),
            Message::assistant(vec![tool_use("t1")]),
            Message::user(vec![ContentBlock::tool_result("t1", "ok", false)]),
        ];
        assert!(repair_history(&history).is_none());
        assert!(repair_history(&[]).is_none());
    }

    #[test]
    fn test_dangling_assistant_calls() {
        let history = vec![
            Message::user_text("task"),
            Message::assistant(vec![ContentBlock::text("doing"), tool_use("t1"), tool_use("t2")]),
        ];
        let repaired = repair_history(&history).unwrap();
        assert_eq!(repaired.len(), 3);
        assert_eq!(repaired[2].tool_result_ids(), vec!["t1", "t2"]);
        assert!(repaired[2].content.iter().all(|b| matches!(
            b,
            ContentBlock::ToolResult { content, is_error: true, .. } if content == responses::TOOL_INTERRUPTED
        )));
        assert!(repair_history(&repaired).is_none());
    }

    #[test]
    fn test_user_turn_missing_some_results() {
        let history = vec![
            Message::user_text("task"),
            Message::assistant(vec![tool_use("t1"), tool_use("t2")]),
            Message::user(vec![
                ContentBlock::tool_result("t1", "ok", false),
                ContentBlock::text("note"),
            ]),
        ];
        let repaired = repair_history(&history).unwrap();
        assert_eq!(repaired.len(), 3);
        assert_eq!(repaired[2].tool_result_ids(), vec!["t1", "t2"]);
        assert_eq!(repaired[2].text(), "note");
        assert!(repair_history(&repaired).is_none());
    }

    #[test]
    fn test_trim_ui() {
        let unfinished = ApiRequestInfo {
            request: Some("x".into()),
            ..Default::default()
        };
        let finished = ApiRequestInfo {
            cancel_reason: Some(CancelReason::StreamingFailed),
            ..Default::default()
        };
        let mut ui = vec![
            UiMessage::say(1, SayKind::ApiReqStarted, finished.to_text(), false),
            UiMessage::say(2, SayKind::ApiReqStarted, unfinished.to_text(), false),
            UiMessage::say(3, SayKind::Text, "partial answer", false),
            UiMessage::ask(4, AskKind::ResumeTask, "", false),
            UiMessage::ask(5, AskKind::ResumeTask, "", false),
        ];
        assert!(trim_ui_for_resume(&mut ui));
        let ts: Vec<i64> = ui.iter().map(|m| m.ts).collect();
        assert_eq!(ts, vec![1, 3]);
        assert!(!trim_ui_for_resume(&mut ui));
    }

    fn persisted_task(dir: &std::path::Path) -> TaskStore {
        let task = TaskStore::new(dir, "resume-me");
        let mut store = ConversationStore::new(task.clone());
        store.append_turn(Message::user_text("<task>\nfix it\n</task>")).unwrap();
        store
            .append_turn(Message::assistant(vec![ContentBlock::text("reading"), tool_use("t1")]))
            .unwrap();
        store
            .append_ui(UiMessage::say(10, SayKind::Task, "fix it", false))
            .unwrap();
        store
            .append_ui(UiMessage::say(11, SayKind::ApiReqStarted, "{}", false))
            .unwrap();
        store
            .append_ui(UiMessage::ask(12, AskKind::Tool, "read a", false))
            .unwrap();
        task
    }

    #[test]
    fn test_load_for_resume_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let task = persisted_task(dir.path());

        let first = load_for_resume(task.clone()).unwrap();
        assert_eq!(first.ask, AskKind::ResumeTask);
        // the synthesized results turn is carried, not left in the history
        assert_eq!(first.store.history().len(), 2);
        assert_eq!(first.carried.len(), 1);
        assert!(matches!(&first.carried[0], ContentBlock::ToolResult { tool_use_id, .. } if tool_use_id == "t1"));
        let ui_ts: Vec<i64> = first.store.ui_messages().iter().map(|m| m.ts).collect();
        assert_eq!(ui_ts, vec![10, 12]);

        let second = load_for_resume(task).unwrap();
        assert_eq!(second.store.history(), first.store.history());
        assert_eq!(second.carried, first.carried);
        assert_eq!(second.store.ui_messages(), first.store.ui_messages());
    }

    #[test]
    fn test_resume_completed_task() {
        let dir = tempfile::tempdir().unwrap();
        let task = TaskStore::new(dir.path(), "done");
        let mut store = ConversationStore::new(task.clone());
        store.append_turn(Message::user_text("task")).unwrap();
        store
            .append_ui(UiMessage::ask(1, AskKind::CompletionResult, "", false))
            .unwrap();
        store
            .append_ui(UiMessage::ask(2, AskKind::ResumeCompletedTask, "", false))
            .unwrap();

        let state = load_for_resume(task).unwrap();
        assert!(state.was_completed());
        assert_eq!(state.last_activity, 1);
    }

    #[test]
    fn test_nothing_to_resume() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_for_resume(TaskStore::new(dir.path(), "nope")).unwrap_err();
        assert!(matches!(err, Error::NothingToResume(_)));
    }
}
