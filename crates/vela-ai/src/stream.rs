//! Streaming chunk types and the model client contract

use crate::error::Result;
use crate::types::{Message, ModelInfo, Usage};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use tokio_stream::Stream;

/// One item of a streamed completion
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ApiStreamChunk {
    /// Assistant text delta
    Text { text: String },
    /// Reasoning/thinking delta
    Reasoning { reasoning: String },
    /// Token usage report; providers may send several per response
    Usage {
        usage: Usage,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        total_cost: Option<f64>,
    },
}

impl ApiStreamChunk {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    pub fn reasoning(reasoning: impl Into<String>) -> Self {
        Self::Reasoning {
            reasoning: reasoning.into(),
        }
    }
}

/// A lazily pulled stream of completion chunks
pub type ApiStream = Pin<Box<dyn Stream<Item = Result<ApiStreamChunk>> + Send>>;

/// A language-model backend that can stream a completion for a conversation
#[async_trait]
pub trait ModelClient: Send + Sync {
    /// Open a streamed completion. Errors may surface here or as the first
    /// stream item; callers treat both as a failed first chunk.
    async fn create_message(&self, system_prompt: &str, messages: &[Message]) -> Result<ApiStream>;

    /// The model this client talks to
    fn model(&self) -> ModelInfo;
}
