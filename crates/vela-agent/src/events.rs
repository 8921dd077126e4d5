//! Task event types

use serde::{Deserialize, Serialize};

use crate::message::UiMessage;

/// How a task run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskExit {
    /// The user accepted an `attempt_completion` result
    Completed,
    /// The task was aborted through its handle
    Aborted,
}

/// Events broadcast to the host while a task runs
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskEvent {
    /// A message was appended to the UI log
    MessageAdded { message: UiMessage },

    /// The most recent partial message was amended, or a message was edited
    MessageUpdated { message: UiMessage },

    /// A partial message was withdrawn from the end of the UI log
    MessageRemoved { ts: i64 },

    /// The task loop finished
    TaskFinished { task_id: String, exit: TaskExit },

    /// The task loop stopped on an error
    Error { message: String },
}

impl TaskEvent {
    /// Check if this is a terminal event
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskEvent::TaskFinished { .. } | TaskEvent::Error { .. })
    }

    /// The message carried by this event, if any
    pub fn message(&self) -> Option<&UiMessage> {
        match self {
            TaskEvent::MessageAdded { message } | TaskEvent::MessageUpdated { message } => Some(message),
            _ => None,
        }
    }
}
