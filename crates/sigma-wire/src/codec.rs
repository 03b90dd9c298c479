//! Conversions between raw log records, wire request payloads, and items
//!
//! A stored record is not guaranteed to map to exactly one conversation
//! item: a multi-part message record fans out to one item per part, and a
//! message record with no content vanishes. Callers that count items must
//! count after expansion, never records.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;
use crate::items::{ConversationItem, MessageItem};

/// One raw record of a remote conversation log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ItemRecord(pub Value);

impl ItemRecord {
    /// The server-assigned record id, if present
    pub fn id(&self) -> Option<&str> {
        self.0.get("id").and_then(Value::as_str)
    }
}

impl From<Value> for ItemRecord {
    fn from(value: Value) -> Self {
        Self(value)
    }
}

/// Expand one stored record into zero or more conversation items.
///
/// Message records with several content parts become one single-part item
/// per part (record id and role carried on each); message records with no
/// content become nothing. Everything else maps one to one, unrecognized
/// records included.
pub fn record_to_items(record: &ItemRecord) -> Vec<ConversationItem> {
    match ConversationItem::from_value(record.0.clone()) {
        ConversationItem::Message(msg) => {
            if msg.content.is_empty() {
                return Vec::new();
            }
            if msg.content.len() == 1 {
                return vec![ConversationItem::Message(msg)];
            }
            msg.content
                .iter()
                .map(|part| {
                    ConversationItem::Message(MessageItem {
                        id: msg.id.clone(),
                        role: msg.role,
                        content: vec![part.clone()],
                        provider_extra: msg.provider_extra.clone(),
                    })
                })
                .collect()
        }
        other => vec![other],
    }
}

/// Encode items for a model request's `input` array.
///
/// Server-assigned record ids are stripped: the model API rejects ids it
/// did not mint for the request, and tool linkage rides `call_id`.
pub fn to_wire_input(items: &[ConversationItem]) -> Result<Vec<Value>> {
    items
        .iter()
        .map(|item| {
            let mut value = item.to_value()?;
            if let Some(map) = value.as_object_mut() {
                map.remove("id");
            }
            Ok(value)
        })
        .collect()
}

/// Interpret raw model output values as conversation items.
pub fn to_conversation_items(values: Vec<Value>) -> Vec<ConversationItem> {
    values.into_iter().map(ConversationItem::from_value).collect()
}

/// Encode items for appending to the remote log.
///
/// The store rejects a nested `model` field on message records; drop it
/// and keep everything else, the item's own id included.
pub fn sanitize_for_store(items: &[ConversationItem]) -> Result<Vec<Value>> {
    items
        .iter()
        .map(|item| {
            let mut value = item.to_value()?;
            if value.get("type").and_then(Value::as_str) == Some("message") {
                if let Some(map) = value.as_object_mut() {
                    map.remove("model");
                }
            }
            Ok(value)
        })
        .collect()
}
