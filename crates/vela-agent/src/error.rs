//! Error types for vela-agent

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias using vela-agent Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while running a task
#[derive(Error, Debug)]
pub enum Error {
    /// An error from the model client layer
    #[error(transparent)]
    Ai(#[from] vela_ai::Error),

    /// Reading or writing task storage failed
    #[error("Task storage error at {path}: {source}")]
    Storage {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A persisted document exists but could not be decoded; the task cannot resume
    #[error("Corrupt task history at {path}: {source}")]
    CorruptHistory {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// JSON encoding failed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The task was aborted; every pending ask/say fails with this
    #[error("Task aborted")]
    Aborted,

    /// A newer ask replaced this one before the user answered
    #[error("Ask was superseded by a newer message")]
    AskSuperseded,

    /// The model request failed and the user declined to retry
    #[error("Request failed: {0}")]
    RequestFailed(String),

    /// The model stream broke after content had started arriving
    #[error("Response stream interrupted: {0}")]
    StreamInterrupted(String),

    /// There is no persisted history to resume from
    #[error("Nothing to resume for task {0}")]
    NothingToResume(String),

    /// A generic engine error
    #[error("{0}")]
    Other(String),
}

impl Error {
    pub(crate) fn storage(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Storage {
            path: path.into(),
            source,
        }
    }

    /// Whether this error is the cooperative-cancellation signal
    pub fn is_aborted(&self) -> bool {
        matches!(self, Error::Aborted)
    }
}
