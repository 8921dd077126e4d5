//! UI-facing message log entries
//!
//! The UI log is separate from the model-facing conversation. Each entry
//! carries a per-task monotonic `ts` that doubles as the fence for pending asks.

use serde::{Deserialize, Serialize};

/// Questions the engine can put to the user
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AskKind {
    /// A question from `ask_followup_question`
    Followup,
    /// Approval for a shell command
    Command,
    /// Approval for any other tool
    Tool,
    /// The model claims the task is done; accept or give feedback
    CompletionResult,
    /// A model request failed; retry or give up
    ApiReqFailed,
    /// Resume an interrupted task
    ResumeTask,
    /// Resume a task that had already completed
    ResumeCompletedTask,
    /// Too many consecutive mistakes; ask for guidance
    MistakeLimitReached,
}

/// One-way notifications
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SayKind {
    /// The initial task text
    Task,
    Text,
    Reasoning,
    Error,
    /// Bookkeeping for one model request; text is an [`ApiRequestInfo`] JSON
    ApiReqStarted,
    ApiReqRetried,
    ApiReqRetryDelayed,
    CompletionResult,
    UserFeedback,
    /// An auto-approved tool invocation
    Tool,
    /// Output streamed by a running tool
    ToolOutput,
}

/// Ask or say, tagged the way the UI log is persisted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UiKind {
    Ask { ask: AskKind },
    Say { say: SayKind },
}

/// One entry in the UI log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UiMessage {
    pub ts: i64,
    #[serde(flatten)]
    pub kind: UiKind,
    #[serde(default)]
    pub text: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<String>,
    #[serde(default)]
    pub partial: bool,
}

impl UiMessage {
    pub fn ask(ts: i64, ask: AskKind, text: impl Into<String>, partial: bool) -> Self {
        Self {
            ts,
            kind: UiKind::Ask { ask },
            text: text.into(),
            images: Vec::new(),
            partial,
        }
    }

    pub fn say(ts: i64, say: SayKind, text: impl Into<String>, partial: bool) -> Self {
        Self {
            ts,
            kind: UiKind::Say { say },
            text: text.into(),
            images: Vec::new(),
            partial,
        }
    }

    pub fn with_images(mut self, images: Vec<String>) -> Self {
        self.images = images;
        self
    }

    pub fn is_ask(&self, kind: AskKind) -> bool {
        self.kind == UiKind::Ask { ask: kind }
    }

    pub fn is_say(&self, kind: SayKind) -> bool {
        self.kind == UiKind::Say { say: kind }
    }

    /// The ask kind, if this is an ask
    pub fn ask_kind(&self) -> Option<AskKind> {
        match self.kind {
            UiKind::Ask { ask } => Some(ask),
            UiKind::Say { .. } => None,
        }
    }
}

/// How the user answered an ask
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AskResponse {
    YesButton,
    NoButton,
    /// Free-form reply; the text travels in [`AskReply::text`]
    MessageResponse,
}

/// The user's answer to an ask
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AskReply {
    pub response: AskResponse,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub images: Vec<String>,
}

impl AskReply {
    pub fn yes() -> Self {
        Self {
            response: AskResponse::YesButton,
            text: None,
            images: Vec::new(),
        }
    }

    pub fn no() -> Self {
        Self {
            response: AskResponse::NoButton,
            text: None,
            images: Vec::new(),
        }
    }

    pub fn message(text: impl Into<String>) -> Self {
        Self {
            response: AskResponse::MessageResponse,
            text: Some(text.into()),
            images: Vec::new(),
        }
    }

    pub fn is_yes(&self) -> bool {
        self.response == AskResponse::YesButton
    }

    /// Non-empty feedback text, if the user typed any
    pub fn feedback(&self) -> Option<&str> {
        self.text.as_deref().map(str::trim).filter(|t| !t.is_empty())
    }
}

/// Why a model request ended early
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelReason {
    UserCancelled,
    StreamingFailed,
}

/// Payload of an `api_req_started` message.
///
/// A marker with neither `cost` nor `cancel_reason` belongs to a request that
/// never finished.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiRequestInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request: Option<String>,
    #[serde(default)]
    pub tokens_in: u32,
    #[serde(default)]
    pub tokens_out: u32,
    #[serde(default)]
    pub cache_writes: u32,
    #[serde(default)]
    pub cache_reads: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cancel_reason: Option<CancelReason>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub streaming_failed_message: Option<String>,
}

impl ApiRequestInfo {
    /// Whether the request this marker describes ever finished
    pub fn is_finished(&self) -> bool {
        self.cost.is_some() || self.cancel_reason.is_some()
    }

    /// Decode from a message's text; unreadable payloads count as empty
    pub fn from_text(text: &str) -> Self {
        serde_json::from_str(text).unwrap_or_default()
    }

    pub fn to_text(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ui_message_wire_shape() {
        let msg = UiMessage::ask(42, AskKind::Tool, "write foo.rs", true);
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "ask");
        assert_eq!(json["ask"], "tool");
        assert_eq!(json["partial"], true);

        let back: UiMessage = serde_json::from_value(json).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn test_api_request_info_finished() {
        let mut info = ApiRequestInfo {
            request: Some("hi".into()),
            ..Default::default()
        };
        assert!(!info.is_finished());
        info.cancel_reason = Some(CancelReason::UserCancelled);
        assert!(info.is_finished());

        let text = info.to_text();
        assert!(text.contains("\"cancelReason\":\"user_cancelled\""));
        assert_eq!(ApiRequestInfo::from_text(&text), info);
    }

    #[test]
    fn test_reply_feedback_trims_empty() {
        assert_eq!(AskReply::message("  ").feedback(), None);
        assert_eq!(AskReply::message(" use tabs ").feedback(), Some("use tabs"));
        assert_eq!(AskReply::yes().feedback(), None);
    }
}
