//! sigma-session: Conversation session storage and history compaction
//!
//! This crate provides the session abstraction for multi-turn agent
//! conversations: in-memory and remote-log-backed storage, a compacting
//! session decorator that condenses history through the model API, and a
//! batching exporter for session telemetry.

pub mod compaction;
pub mod conversations;
pub mod error;
pub mod session;
pub mod telemetry;

pub use compaction::{
    CompactionArgs, CompactionBackend, CompactionConfig, CompactionMode, CompactionSession,
};
pub use conversations::{ConversationStore, ConversationsSession};
pub use error::Error;
pub use session::{InMemorySession, Session, SessionKind};
pub use telemetry::{BatchExporter, ExportRecord, ExporterConfig, TelemetrySink};
