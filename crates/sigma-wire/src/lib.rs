//! sigma-wire: Conversation item model and OpenAI wire client
//!
//! This crate defines the conversation item model shared across the
//! workspace, the codec between stored log records and items, and the
//! HTTP client for the conversation log and compaction endpoints.

pub mod codec;
pub mod error;
pub mod items;
pub mod openai;
pub mod stream;

pub use error::{Error, Result};
pub use items::*;
pub use stream::ResponseEventStream;
