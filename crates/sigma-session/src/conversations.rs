//! Remote-backed session over a conversation log service

use std::sync::Arc;

use async_stream::stream;
use async_trait::async_trait;
use futures::StreamExt;
use serde_json::Value;
use tokio_stream::Stream;

use sigma_wire::codec::{self, ItemRecord};
use sigma_wire::openai::{ItemPage, ListQuery, OpenAIClient};
use sigma_wire::ConversationItem;

use crate::error::Result;
use crate::session::{Session, SessionKind};

const DEFAULT_PAGE_SIZE: u32 = 100;

/// Storage operations a remote conversation log must provide
#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// Create a new log and return its id
    async fn create_conversation(&self) -> Result<String>;

    /// List one page of records
    async fn list_items(&self, conversation_id: &str, query: &ListQuery) -> Result<ItemPage>;

    /// Append raw item values to the log
    async fn add_items(&self, conversation_id: &str, items: &[Value]) -> Result<()>;

    /// Delete one record
    async fn delete_item(&self, conversation_id: &str, item_id: &str) -> Result<()>;

    /// Delete the whole log
    async fn delete_conversation(&self, conversation_id: &str) -> Result<()>;
}

#[async_trait]
impl ConversationStore for OpenAIClient {
    async fn create_conversation(&self) -> Result<String> {
        Ok(OpenAIClient::create_conversation(self).await?)
    }

    async fn list_items(&self, conversation_id: &str, query: &ListQuery) -> Result<ItemPage> {
        Ok(OpenAIClient::list_items(self, conversation_id, query).await?)
    }

    async fn add_items(&self, conversation_id: &str, items: &[Value]) -> Result<()> {
        Ok(OpenAIClient::add_items(self, conversation_id, items).await?)
    }

    async fn delete_item(&self, conversation_id: &str, item_id: &str) -> Result<()> {
        Ok(OpenAIClient::delete_item(self, conversation_id, item_id).await?)
    }

    async fn delete_conversation(&self, conversation_id: &str) -> Result<()> {
        Ok(OpenAIClient::delete_conversation(self, conversation_id).await?)
    }
}

/// A session whose log lives in a remote conversation service.
///
/// The service appends to this log during response generation, so the log
/// is owned server-side; this type reads and edits it but cannot replace
/// it wholesale. Its kind is [`SessionKind::ConversationLog`].
pub struct ConversationsSession {
    store: Arc<dyn ConversationStore>,
    // Held across the create call so concurrent lazy creates converge on one log.
    conversation_id: tokio::sync::Mutex<Option<String>>,
    page_size: u32,
}

impl ConversationsSession {
    /// Create a session that provisions a fresh remote log on first use
    pub fn new(store: Arc<dyn ConversationStore>) -> Self {
        Self {
            store,
            conversation_id: tokio::sync::Mutex::new(None),
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    /// Resume an existing remote log
    pub fn with_conversation_id(mut self, conversation_id: impl Into<String>) -> Self {
        self.conversation_id = tokio::sync::Mutex::new(Some(conversation_id.into()));
        self
    }

    /// Override the page size used when walking the log
    pub fn with_page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    async fn ensure_conversation_id(&self) -> Result<String> {
        let mut guard = self.conversation_id.lock().await;
        if let Some(id) = guard.as_ref() {
            return Ok(id.clone());
        }
        let id = self.store.create_conversation().await?;
        tracing::debug!("Created conversation log {}", id);
        *guard = Some(id.clone());
        Ok(id)
    }

    /// Walk the whole log oldest-first, one record at a time.
    ///
    /// Restartable only from scratch; terminates when the service reports
    /// the end of the log.
    fn record_stream(
        &self,
        conversation_id: String,
    ) -> impl Stream<Item = Result<ItemRecord>> + Send {
        let store = Arc::clone(&self.store);
        let page_size = self.page_size;
        stream! {
            let mut after: Option<String> = None;
            loop {
                let mut query = ListQuery::ascending().with_limit(page_size);
                if let Some(cursor) = &after {
                    query = query.with_after(cursor.clone());
                }
                let page = match store.list_items(&conversation_id, &query).await {
                    Ok(page) => page,
                    Err(e) => {
                        yield Err(e);
                        return;
                    }
                };
                let next_cursor = page_cursor(&page);
                for record in page.data {
                    yield Ok(record);
                }
                if !page.has_more {
                    break;
                }
                match next_cursor {
                    Some(cursor) => after = Some(cursor),
                    None => break,
                }
            }
        }
    }

    async fn all_items(&self) -> Result<Vec<ConversationItem>> {
        let conversation_id = self.ensure_conversation_id().await?;
        let records = self.record_stream(conversation_id);
        tokio::pin!(records);

        let mut items = Vec::new();
        while let Some(record) = records.next().await {
            items.extend(codec::record_to_items(&record?));
        }
        Ok(items)
    }

    /// Fetch the newest `limit` items by paging from the tail.
    ///
    /// Counts expanded items, not records: one record can become several
    /// items or none, so pulling `limit` records would be wrong in both
    /// directions.
    async fn newest_items(&self, limit: usize) -> Result<Vec<ConversationItem>> {
        let conversation_id = self.ensure_conversation_id().await?;

        let mut groups: Vec<Vec<ConversationItem>> = Vec::new();
        let mut collected = 0usize;
        let mut after: Option<String> = None;
        loop {
            let mut query = ListQuery::descending().with_limit(self.page_size);
            if let Some(cursor) = &after {
                query = query.with_after(cursor.clone());
            }
            let page = self.store.list_items(&conversation_id, &query).await?;
            let next_cursor = page_cursor(&page);

            for record in &page.data {
                let group = codec::record_to_items(record);
                collected += group.len();
                groups.push(group);
                if collected >= limit {
                    break;
                }
            }
            if collected >= limit || !page.has_more {
                break;
            }
            match next_cursor {
                Some(cursor) => after = Some(cursor),
                None => break,
            }
        }

        // Groups arrived newest-first; reverse to chronological order and
        // drop any excess from the oldest side.
        let mut items: Vec<ConversationItem> = groups.into_iter().rev().flatten().collect();
        if items.len() > limit {
            let excess = items.len() - limit;
            items.drain(..excess);
        }
        Ok(items)
    }
}

fn page_cursor(page: &ItemPage) -> Option<String> {
    page.last_id
        .clone()
        .or_else(|| page.data.last().and_then(|r| r.id().map(String::from)))
}

#[async_trait]
impl Session for ConversationsSession {
    fn kind(&self) -> SessionKind {
        SessionKind::ConversationLog
    }

    async fn session_id(&self) -> Result<String> {
        self.ensure_conversation_id().await
    }

    async fn items(&self, limit: Option<usize>) -> Result<Vec<ConversationItem>> {
        match limit {
            Some(0) => Ok(Vec::new()),
            Some(n) => self.newest_items(n).await,
            None => self.all_items().await,
        }
    }

    async fn add_items(&self, items: Vec<ConversationItem>) -> Result<()> {
        if items.is_empty() {
            return Ok(());
        }
        let conversation_id = self.ensure_conversation_id().await?;
        let wire = codec::sanitize_for_store(&items)?;
        self.store.add_items(&conversation_id, &wire).await
    }

    async fn pop_item(&self) -> Result<Option<ConversationItem>> {
        let Some(item) = self.items(Some(1)).await?.pop() else {
            return Ok(None);
        };
        if let Some(item_id) = item.server_id() {
            let conversation_id = self.ensure_conversation_id().await?;
            self.store.delete_item(&conversation_id, item_id).await?;
        }
        Ok(Some(item))
    }

    async fn clear(&self) -> Result<()> {
        let mut guard = self.conversation_id.lock().await;
        let Some(id) = guard.clone() else {
            return Ok(());
        };
        self.store.delete_conversation(&id).await?;
        *guard = None;
        Ok(())
    }
}
