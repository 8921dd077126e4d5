//! Durable per-task storage for the conversation history and the UI log.
//!
//! Each task owns a directory holding two JSON documents. Both are rewritten
//! in full on every change (temp file + rename), so a crash leaves either the
//! old or the new document, never a torn one.

use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use vela_ai::Message;

use crate::error::{Error, Result};
use crate::message::{SayKind, UiMessage};

/// Model-facing conversation document
pub const HISTORY_FILE: &str = "api_conversation_history.json";
/// UI log document
pub const UI_MESSAGES_FILE: &str = "ui_messages.json";

/// File-level access to one task directory
#[derive(Debug, Clone)]
pub struct TaskStore {
    task_id: String,
    dir: PathBuf,
}

impl TaskStore {
    /// Storage for `task_id` under `<data_dir>/tasks/`
    pub fn new(data_dir: &Path, task_id: impl Into<String>) -> Self {
        let task_id = task_id.into();
        let dir = data_dir.join("tasks").join(&task_id);
        Self { task_id, dir }
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Whether anything was ever persisted for this task
    pub fn exists(&self) -> bool {
        self.dir.join(HISTORY_FILE).exists() || self.dir.join(UI_MESSAGES_FILE).exists()
    }

    pub fn read_history(&self) -> Result<Vec<Message>> {
        self.read_document(HISTORY_FILE)
    }

    pub fn write_history(&self, history: &[Message]) -> Result<()> {
        self.write_document(HISTORY_FILE, history)
    }

    pub fn read_ui_messages(&self) -> Result<Vec<UiMessage>> {
        self.read_document(UI_MESSAGES_FILE)
    }

    pub fn write_ui_messages(&self, messages: &[UiMessage]) -> Result<()> {
        self.write_document(UI_MESSAGES_FILE, messages)
    }

    /// A missing document is an empty one; an unreadable one is fatal.
    fn read_document<T: DeserializeOwned>(&self, name: &str) -> Result<Vec<T>> {
        let path = self.dir.join(name);
        let content = match fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(Error::storage(path, e)),
        };
        serde_json::from_str(&content).map_err(|source| Error::CorruptHistory { path, source })
    }

    fn write_document<T: Serialize>(&self, name: &str, value: &[T]) -> Result<()> {
        fs::create_dir_all(&self.dir).map_err(|e| Error::storage(&self.dir, e))?;
        let path = self.dir.join(name);
        let tmp = self.dir.join(format!("{}.tmp", name));
        let content = serde_json::to_string(value)?;
        fs::write(&tmp, content).map_err(|e| Error::storage(&tmp, e))?;
        fs::rename(&tmp, &path).map_err(|e| Error::storage(&path, e))
    }

    /// Summaries of every task under `data_dir`, newest first
    pub fn list_tasks(data_dir: &Path) -> Result<Vec<TaskSummary>> {
        let tasks_dir = data_dir.join("tasks");
        let entries = match fs::read_dir(&tasks_dir) {
            Ok(e) => e,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(vec![]),
            Err(e) => return Err(Error::storage(tasks_dir, e)),
        };

        let mut tasks = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| Error::storage(&tasks_dir, e))?;
            if !entry.path().is_dir() {
                continue;
            }
            let id = entry.file_name().to_string_lossy().to_string();
            let store = TaskStore::new(data_dir, id.clone());
            match store.read_ui_messages() {
                Ok(messages) => tasks.push(TaskSummary::from_messages(id, &messages)),
                Err(e) => tracing::warn!("Skipping unreadable task {}: {}", id, e),
            }
        }

        tasks.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(tasks)
    }
}

/// Listing entry for a persisted task
#[derive(Debug, Clone)]
pub struct TaskSummary {
    pub id: String,
    pub created_at: i64,
    pub task: String,
    pub message_count: usize,
}

impl TaskSummary {
    fn from_messages(id: String, messages: &[UiMessage]) -> Self {
        let task = messages
            .iter()
            .find(|m| m.is_say(SayKind::Task))
            .map(|m| m.text.clone())
            .unwrap_or_default();
        Self {
            id,
            created_at: messages.first().map(|m| m.ts).unwrap_or_default(),
            task,
            message_count: messages.len(),
        }
    }

    /// Format the created_at timestamp for display
    pub fn created_at_display(&self) -> String {
        use chrono::{TimeZone, Utc};
        Utc.timestamp_millis_opt(self.created_at)
            .single()
            .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_else(|| "unknown".to_string())
    }
}

/// In-memory history and UI log, persisted through a [`TaskStore`]
#[derive(Debug)]
pub struct ConversationStore {
    store: TaskStore,
    history: Vec<Message>,
    ui: Vec<UiMessage>,
    last_ts: i64,
}

impl ConversationStore {
    /// A store for a task with nothing persisted yet
    pub fn new(store: TaskStore) -> Self {
        Self {
            store,
            history: Vec::new(),
            ui: Vec::new(),
            last_ts: 0,
        }
    }

    /// Load both documents as they are on disk, without any repair
    pub fn load(store: TaskStore) -> Result<Self> {
        let history = store.read_history()?;
        let ui = store.read_ui_messages()?;
        let last_ts = ui.iter().map(|m| m.ts).max().unwrap_or(0);
        Ok(Self {
            store,
            history,
            ui,
            last_ts,
        })
    }

    pub fn task_store(&self) -> &TaskStore {
        &self.store
    }

    pub fn history(&self) -> &[Message] {
        &self.history
    }

    pub fn ui_messages(&self) -> &[UiMessage] {
        &self.ui
    }

    pub fn last_ui(&self) -> Option<&UiMessage> {
        self.ui.last()
    }

    /// Append a turn and persist the history
    pub fn append_turn(&mut self, turn: Message) -> Result<()> {
        self.history.push(turn);
        self.store.write_history(&self.history)
    }

    /// Replace the whole history; only resumption repair does this
    pub fn overwrite_history(&mut self, history: Vec<Message>) -> Result<()> {
        self.history = history;
        self.store.write_history(&self.history)
    }

    /// Remove a trailing user turn from the live history.
    ///
    /// Not persisted on its own: the turn's content is re-sent as part of the
    /// next user turn, and the next append rewrites the document.
    pub(crate) fn pop_trailing_user_turn(&mut self) -> Option<Message> {
        if self.history.last().is_some_and(|m| m.is_user()) {
            self.history.pop()
        } else {
            None
        }
    }

    /// Next UI timestamp: wall-clock millis, forced strictly increasing
    pub fn next_ts(&mut self) -> i64 {
        let now = chrono::Utc::now().timestamp_millis();
        self.last_ts = now.max(self.last_ts + 1);
        self.last_ts
    }

    /// Append a UI message and persist the log
    pub fn append_ui(&mut self, message: UiMessage) -> Result<()> {
        self.last_ts = self.last_ts.max(message.ts);
        self.ui.push(message);
        self.store.write_ui_messages(&self.ui)
    }

    /// Amend the most recent message in place if it is still partial.
    ///
    /// Partial text is kept in memory only; the log is persisted once the
    /// message is finalized.
    pub fn amend_last_partial(&mut self, text: &str, partial: bool) -> Result<Option<UiMessage>> {
        let Some(last) = self.ui.last_mut() else {
            return Ok(None);
        };
        if !last.partial {
            return Ok(None);
        }
        last.text = text.to_string();
        last.partial = partial;
        let updated = last.clone();
        if !partial {
            self.store.write_ui_messages(&self.ui)?;
        }
        Ok(Some(updated))
    }

    /// Drop the last UI message if it is still partial and persist the log
    pub fn remove_last_partial(&mut self) -> Result<Option<UiMessage>> {
        if !self.ui.last().is_some_and(|m| m.partial) {
            return Ok(None);
        }
        let removed = self.ui.pop();
        self.store.write_ui_messages(&self.ui)?;
        Ok(removed)
    }

    /// Edit the message with the given `ts` and persist the log
    pub fn update_ui(
        &mut self,
        ts: i64,
        edit: impl FnOnce(&mut UiMessage),
    ) -> Result<Option<UiMessage>> {
        let Some(message) = self.ui.iter_mut().rev().find(|m| m.ts == ts) else {
            return Ok(None);
        };
        edit(message);
        let updated = message.clone();
        self.store.write_ui_messages(&self.ui)?;
        Ok(Some(updated))
    }

    /// Replace the whole UI log; only resumption trimming does this
    pub fn overwrite_ui(&mut self, messages: Vec<UiMessage>) -> Result<()> {
        self.ui = messages;
        self.store.write_ui_messages(&self.ui)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::AskKind;
    use vela_ai::ContentBlock;

    fn temp_store() -> (tempfile::TempDir, TaskStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = TaskStore::new(dir.path(), "task-1");
        (dir, store)
    }

    #[test]
    fn test_missing_documents_are_empty() {
        let (_dir, store) = temp_store();
        assert!(!store.exists());
        assert!(store.read_history().unwrap().is_empty());
        assert!(store.read_ui_messages().unwrap().is_empty());
    }

    #[test]
    fn test_corrupt_history_is_fatal() {
        let (_dir, store) = temp_store();
        fs::create_dir_all(store.dir()).unwrap();
        fs::write(store.dir().join(HISTORY_FILE), "[{not json").unwrap();
        let err = store.read_history().unwrap_err();
        assert!(matches!(err, Error::CorruptHistory { .. }), "got {:?}", err);
    }

    #[test]
    fn test_append_turn_persists() {
        let (_dir, store) = temp_store();
        let mut convo = ConversationStore::new(store.clone());
        convo.append_turn(Message::user_text("hello")).unwrap();
        convo
            .append_turn(Message::assistant(vec![ContentBlock::text("hi")]))
            .unwrap();

        let reloaded = ConversationStore::load(store).unwrap();
        assert_eq!(reloaded.history().len(), 2);
        assert_eq!(reloaded.history()[1].text(), "hi");
    }

    #[test]
    fn test_next_ts_strictly_increasing() {
        let (_dir, store) = temp_store();
        let mut convo = ConversationStore::new(store);
        let a = convo.next_ts();
        let b = convo.next_ts();
        let c = convo.next_ts();
        assert!(a < b && b < c);
    }

    #[test]
    fn test_amend_only_touches_partial_tail() {
        let (_dir, store) = temp_store();
        let mut convo = ConversationStore::new(store.clone());
        let ts = convo.next_ts();
        convo
            .append_ui(UiMessage::say(ts, SayKind::Text, "Hel", true))
            .unwrap();
        let amended = convo.amend_last_partial("Hello", true).unwrap().unwrap();
        assert_eq!(amended.ts, ts);
        assert_eq!(amended.text, "Hello");

        // still partial: disk holds the original text
        let on_disk = store.read_ui_messages().unwrap();
        assert_eq!(on_disk[0].text, "Hel");

        convo.amend_last_partial("Hello world", false).unwrap();
        let on_disk = store.read_ui_messages().unwrap();
        assert_eq!(on_disk[0].text, "Hello world");
        assert!(!on_disk[0].partial);

        // finalized messages are never amended
        assert!(convo.amend_last_partial("changed", false).unwrap().is_none());
    }

    #[test]
    fn test_remove_last_partial_persists() {
        let (_dir, store) = temp_store();
        let mut convo = ConversationStore::new(store.clone());
        let ts = convo.next_ts();
        convo.append_ui(UiMessage::say(ts, SayKind::Text, "done", false)).unwrap();
        assert!(convo.remove_last_partial().unwrap().is_none());

        let ts = convo.next_ts();
        convo
            .append_ui(UiMessage::ask(ts, AskKind::Tool, "preview", true))
            .unwrap();
        let removed = convo.remove_last_partial().unwrap().unwrap();
        assert_eq!(removed.ts, ts);
        assert_eq!(convo.ui_messages().len(), 1);
        assert_eq!(store.read_ui_messages().unwrap().len(), 1);
    }

    #[test]
    fn test_list_tasks() {
        let dir = tempfile::tempdir().unwrap();
        for (id, text) in [("a", "first task"), ("b", "second task")] {
            let mut convo = ConversationStore::new(TaskStore::new(dir.path(), id));
            let ts = convo.next_ts();
            convo
                .append_ui(UiMessage::say(ts, SayKind::Task, text, false))
                .unwrap();
            let ts = convo.next_ts();
            convo
                .append_ui(UiMessage::ask(ts, AskKind::Followup, "?", false))
                .unwrap();
        }
        let tasks = TaskStore::list_tasks(dir.path()).unwrap();
        assert_eq!(tasks.len(), 2);
        assert!(tasks.iter().any(|t| t.task == "second task" && t.message_count == 2));
    }
}
