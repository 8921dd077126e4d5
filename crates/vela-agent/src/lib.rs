//! vela-agent: the task engine of an autonomous coding agent
//!
//! A [`Task`] sends the conversation to a model, interprets the streamed
//! reply as text and XML-tagged tool calls, and dispatches those calls one
//! at a time with user approval. Hosts drive it through a [`TaskHandle`]:
//! answering asks, aborting, and watching [`TaskEvent`]s.

pub mod builtin;
pub mod context;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod handle;
pub mod message;
pub mod mistakes;
pub mod parser;
pub mod policy;
pub mod presenter;
pub mod responses;
pub mod resume;
pub mod retry;
pub mod stack;
pub mod store;
pub mod task;
pub mod tool;

mod ask;

pub use error::{Error, Result};
pub use events::{TaskEvent, TaskExit};
pub use handle::TaskHandle;
pub use message::{AskKind, AskReply, AskResponse, SayKind, UiMessage};
pub use policy::{Capabilities, DefaultPolicy, Mode, ToolGroup, ToolPolicy};
pub use retry::RetryConfig;
pub use stack::TaskStack;
pub use store::{TaskStore, TaskSummary};
pub use task::{Task, TaskConfig};
pub use tool::{BoxedTool, Tool, ToolContext, ToolError, ToolParams, ToolPreview, ToolResult};
