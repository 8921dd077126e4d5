//! A model client that plays back canned responses.
//!
//! Used as the mock backend in tests and for offline replay from the CLI.

use async_stream::stream;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::Path;

use crate::error::{Error, Result};
use crate::stream::{ApiStream, ApiStreamChunk, ModelClient};
use crate::types::{Message, ModelInfo, Usage};

/// One scripted reply to a `create_message` call
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ScriptedResponse {
    /// Stream these text chunks in order, then an optional usage report
    Reply {
        chunks: Vec<String>,
        #[serde(default)]
        usage: Option<Usage>,
    },
    /// Fail before the first chunk is produced
    Fail {
        message: String,
        #[serde(default = "default_true")]
        retryable: bool,
    },
    /// Stream some chunks, then fail mid-response
    FailAfter { chunks: Vec<String>, message: String },
}

fn default_true() -> bool {
    true
}

impl ScriptedResponse {
    /// A reply delivered as a single chunk
    pub fn text(text: impl Into<String>) -> Self {
        Self::Reply {
            chunks: vec![text.into()],
            usage: None,
        }
    }

    /// A reply delivered as the given chunks
    pub fn chunks<I, S>(chunks: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Reply {
            chunks: chunks.into_iter().map(Into::into).collect(),
            usage: None,
        }
    }

    /// Split `text` into chunks of at most `size` characters
    pub fn split(text: &str, size: usize) -> Self {
        let size = size.max(1);
        let chars: Vec<char> = text.chars().collect();
        Self::Reply {
            chunks: chars.chunks(size).map(|c| c.iter().collect()).collect(),
            usage: None,
        }
    }

    /// A retryable failure before the first chunk
    pub fn fail(message: impl Into<String>) -> Self {
        Self::Fail {
            message: message.into(),
            retryable: true,
        }
    }
}

/// Plays back [`ScriptedResponse`]s in order and records every request
pub struct ScriptedClient {
    model: ModelInfo,
    responses: Mutex<VecDeque<ScriptedResponse>>,
    requests: Mutex<Vec<Vec<Message>>>,
}

impl ScriptedClient {
    pub fn new(responses: Vec<ScriptedResponse>) -> Self {
        Self {
            model: ModelInfo::free("scripted"),
            responses: Mutex::new(responses.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Load a JSON array of responses from disk
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let responses: Vec<ScriptedResponse> = serde_json::from_str(&content)?;
        tracing::debug!("Loaded {} scripted responses from {}", responses.len(), path.display());
        Ok(Self::new(responses))
    }

    pub fn with_model(mut self, model: ModelInfo) -> Self {
        self.model = model;
        self
    }

    /// Append more responses to the end of the script
    pub fn push(&self, response: ScriptedResponse) {
        self.responses.lock().push_back(response);
    }

    /// Conversation snapshots passed to each `create_message` call
    pub fn requests(&self) -> Vec<Vec<Message>> {
        self.requests.lock().clone()
    }

    /// Number of responses not yet consumed
    pub fn remaining(&self) -> usize {
        self.responses.lock().len()
    }
}

#[async_trait]
impl ModelClient for ScriptedClient {
    async fn create_message(&self, _system_prompt: &str, messages: &[Message]) -> Result<ApiStream> {
        self.requests.lock().push(messages.to_vec());
        let next = self.responses.lock().pop_front();

        let response = match next {
            Some(r) => r,
            None => {
                return Err(Error::InvalidConfig(
                    "scripted client has no responses left".to_string(),
                ));
            }
        };

        let s: ApiStream = match response {
            ScriptedResponse::Reply { chunks, usage } => Box::pin(stream! {
                for chunk in chunks {
                    tokio::task::yield_now().await;
                    yield Ok(ApiStreamChunk::text(chunk));
                }
                if let Some(usage) = usage {
                    yield Ok(ApiStreamChunk::Usage { usage, total_cost: None });
                }
            }),
            ScriptedResponse::Fail { message, retryable } => Box::pin(stream! {
                if retryable {
                    yield Err(Error::Stream(message));
                } else {
                    yield Err(Error::api("authentication_error", message));
                }
            }),
            ScriptedResponse::FailAfter { chunks, message } => Box::pin(stream! {
                for chunk in chunks {
                    tokio::task::yield_now().await;
                    yield Ok(ApiStreamChunk::text(chunk));
                }
                yield Err(Error::Stream(message));
            }),
        };
        Ok(s)
    }

    fn model(&self) -> ModelInfo {
        self.model.clone()
    }
}
