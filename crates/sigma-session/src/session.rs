//! Session trait, session kinds, and the in-memory implementation

use async_trait::async_trait;
use parking_lot::Mutex;
use sigma_wire::ConversationItem;
use uuid::Uuid;

use crate::error::Result;

/// The closed set of session variants.
///
/// Code that needs to know what it is holding asks for the kind instead of
/// sniffing concrete types or probing for methods.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionKind {
    /// Client-managed log (in memory or any custom store)
    Basic,
    /// Log owned and written by the remote conversation service
    ConversationLog,
    /// Decorator that compacts a wrapped session's history
    Compaction,
}

/// An ordered log of conversation items.
///
/// Implementations are single-writer: callers issue operations
/// sequentially and serialize externally if they share a session across
/// tasks.
#[async_trait]
pub trait Session: Send + Sync {
    /// Which kind of session this is
    fn kind(&self) -> SessionKind;

    /// The session id, provisioned lazily on first use
    async fn session_id(&self) -> Result<String>;

    /// Items in chronological order; `Some(n)` keeps only the newest `n`,
    /// `Some(0)` is empty, `None` is the full history
    async fn items(&self, limit: Option<usize>) -> Result<Vec<ConversationItem>>;

    /// Append items to the end of the log; empty input is a no-op
    async fn add_items(&self, items: Vec<ConversationItem>) -> Result<()>;

    /// Remove and return the most recent item
    async fn pop_item(&self) -> Result<Option<ConversationItem>>;

    /// Destroy the log
    async fn clear(&self) -> Result<()>;
}

/// A session held entirely in process memory
#[derive(Default)]
pub struct InMemorySession {
    state: Mutex<InMemoryState>,
}

#[derive(Default)]
struct InMemoryState {
    id: Option<String>,
    items: Vec<ConversationItem>,
}

impl InMemorySession {
    /// Create an empty session
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a session pre-seeded with items
    pub fn with_items(items: Vec<ConversationItem>) -> Self {
        Self {
            state: Mutex::new(InMemoryState { id: None, items }),
        }
    }
}

#[async_trait]
impl Session for InMemorySession {
    fn kind(&self) -> SessionKind {
        SessionKind::Basic
    }

    async fn session_id(&self) -> Result<String> {
        let mut state = self.state.lock();
        let id = state
            .id
            .get_or_insert_with(|| Uuid::new_v4().to_string())
            .clone();
        Ok(id)
    }

    async fn items(&self, limit: Option<usize>) -> Result<Vec<ConversationItem>> {
        let state = self.state.lock();
        let items = match limit {
            Some(0) => Vec::new(),
            Some(n) => {
                let start = state.items.len().saturating_sub(n);
                state.items[start..].to_vec()
            }
            None => state.items.clone(),
        };
        Ok(items)
    }

    async fn add_items(&self, items: Vec<ConversationItem>) -> Result<()> {
        if items.is_empty() {
            return Ok(());
        }
        self.state.lock().items.extend(items);
        Ok(())
    }

    async fn pop_item(&self) -> Result<Option<ConversationItem>> {
        Ok(self.state.lock().items.pop())
    }

    async fn clear(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.items.clear();
        state.id = None;
        Ok(())
    }
}
