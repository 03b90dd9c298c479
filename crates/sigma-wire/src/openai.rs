//! OpenAI Conversations and Responses API client

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::codec::ItemRecord;
use crate::error::{Error, Result};
use crate::items::TokenUsage;

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// Sort order for listing log records
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Order {
    Asc,
    Desc,
}

impl Order {
    pub fn as_str(&self) -> &'static str {
        match self {
            Order::Asc => "asc",
            Order::Desc => "desc",
        }
    }
}

/// Query parameters for listing log records
#[derive(Debug, Clone)]
pub struct ListQuery {
    pub order: Order,
    pub limit: Option<u32>,
    pub after: Option<String>,
}

impl ListQuery {
    /// List oldest records first
    pub fn ascending() -> Self {
        Self {
            order: Order::Asc,
            limit: None,
            after: None,
        }
    }

    /// List newest records first
    pub fn descending() -> Self {
        Self {
            order: Order::Desc,
            limit: None,
            after: None,
        }
    }

    /// Cap the page size
    pub fn with_limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Resume after a record id
    pub fn with_after(mut self, after: impl Into<String>) -> Self {
        self.after = Some(after.into());
        self
    }
}

/// One page of log records
#[derive(Debug, Clone, Deserialize)]
pub struct ItemPage {
    pub data: Vec<ItemRecord>,
    #[serde(default)]
    pub has_more: bool,
    #[serde(default)]
    pub last_id: Option<String>,
}

/// A created conversation log
#[derive(Debug, Clone, Deserialize)]
pub struct ConversationObject {
    pub id: String,
}

/// Request body for the compaction endpoint.
///
/// Exactly one of `previous_response_id` and `input` is set: the first
/// compacts server-side state reachable from a response id, the second
/// carries the full history inline.
#[derive(Debug, Clone, Serialize)]
pub struct CompactionRequest {
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous_response_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input: Option<Vec<Value>>,
}

/// Response body from the compaction endpoint
#[derive(Debug, Clone, Deserialize)]
pub struct CompactionResponse {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub output: Vec<Value>,
    #[serde(default)]
    pub usage: TokenUsage,
}

/// OpenAI API client
pub struct OpenAIClient {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl OpenAIClient {
    /// Create a new client with an API key
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: api_key.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
        }
    }

    /// Create from environment variable
    pub fn from_env() -> Result<Self> {
        let api_key = std::env::var("OPENAI_API_KEY").map_err(|_| Error::InvalidApiKey)?;
        Ok(Self::new(api_key))
    }

    /// Override the API base URL (for proxies and tests)
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Create a new conversation log and return its id
    pub async fn create_conversation(&self) -> Result<String> {
        let url = format!("{}/conversations", self.base_url);
        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&serde_json::json!({}))
            .send()
            .await?;
        let response = check(response).await?;

        let conversation: ConversationObject = response.json().await?;
        if conversation.id.is_empty() {
            return Err(Error::UnexpectedResponse(
                "conversation created without an id".into(),
            ));
        }
        Ok(conversation.id)
    }

    /// List one page of records from a conversation log
    pub async fn list_items(&self, conversation_id: &str, query: &ListQuery) -> Result<ItemPage> {
        let url = format!("{}/conversations/{}/items", self.base_url, conversation_id);
        tracing::debug!("Listing conversation items: {}", url);

        let mut params: Vec<(&str, String)> = vec![("order", query.order.as_str().to_string())];
        if let Some(limit) = query.limit {
            params.push(("limit", limit.to_string()));
        }
        if let Some(after) = &query.after {
            params.push(("after", after.clone()));
        }

        let response = self
            .client
            .get(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .query(&params)
            .send()
            .await?;
        let response = check(response).await?;

        Ok(response.json().await?)
    }

    /// Append raw item values to a conversation log
    pub async fn add_items(&self, conversation_id: &str, items: &[Value]) -> Result<()> {
        let url = format!("{}/conversations/{}/items", self.base_url, conversation_id);
        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&serde_json::json!({ "items": items }))
            .send()
            .await?;
        check(response).await?;
        Ok(())
    }

    /// Delete one record from a conversation log
    pub async fn delete_item(&self, conversation_id: &str, item_id: &str) -> Result<()> {
        let url = format!(
            "{}/conversations/{}/items/{}",
            self.base_url, conversation_id, item_id
        );
        let response = self
            .client
            .delete(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .send()
            .await?;
        check(response).await?;
        Ok(())
    }

    /// Delete an entire conversation log
    pub async fn delete_conversation(&self, conversation_id: &str) -> Result<()> {
        let url = format!("{}/conversations/{}", self.base_url, conversation_id);
        let response = self
            .client
            .delete(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .send()
            .await?;
        check(response).await?;
        Ok(())
    }

    /// Ask the model to compact a conversation into summary items
    pub async fn compact(&self, request: &CompactionRequest) -> Result<CompactionResponse> {
        let url = format!("{}/responses/compact", self.base_url);
        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(request)
            .send()
            .await?;
        let response = check(response).await?;

        Ok(response.json().await?)
    }
}

async fn check(response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if !status.is_success() {
        let text = response.text().await.unwrap_or_default();
        return Err(Error::api(status.as_u16(), text));
    }
    Ok(response)
}
