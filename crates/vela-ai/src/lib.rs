//! vela-ai: model-facing conversation types and the streaming completion contract
//!
//! Provider HTTP clients live outside this workspace; they plug in by
//! implementing [`ModelClient`]. [`scripted::ScriptedClient`] plays back canned
//! responses for tests and offline replay.

pub mod error;
pub mod scripted;
pub mod stream;
pub mod types;

pub use error::{Error, Result};
pub use stream::{ApiStream, ApiStreamChunk, ModelClient};
pub use types::*;
