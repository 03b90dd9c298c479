//! Conversation item model
//!
//! Items are the units a session stores: messages, tool calls and their
//! outputs, reasoning blocks, hosted tool calls, and compaction markers.
//! The wire evolves faster than this enum, so serialization is routed
//! through [`ConversationItem::from_value`] / [`ConversationItem::to_value`]:
//! an unrecognized tag (or a known tag whose payload no longer parses) is
//! carried as [`ConversationItem::Unknown`] and written back untouched,
//! never dropped.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;

/// Message roles
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

/// Content parts of a message item
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    /// Text sent to the model
    InputText { text: String },
    /// Text produced by the model
    OutputText { text: String },
    /// Image reference sent to the model
    InputImage { image_url: String },
}

impl ContentPart {
    /// Create an input text part
    pub fn input_text(text: impl Into<String>) -> Self {
        Self::InputText { text: text.into() }
    }

    /// Create an output text part
    pub fn output_text(text: impl Into<String>) -> Self {
        Self::OutputText { text: text.into() }
    }

    /// Create an input image part
    pub fn input_image(image_url: impl Into<String>) -> Self {
        Self::InputImage {
            image_url: image_url.into(),
        }
    }

    /// Get the text if this is a text part
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::InputText { text } | Self::OutputText { text } => Some(text),
            Self::InputImage { .. } => None,
        }
    }
}

/// Token usage reported by the model API
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub total_tokens: u64,
}

/// A message from the user, the assistant, or the system
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageItem {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub role: Role,
    #[serde(default)]
    pub content: Vec<ContentPart>,
    /// Provider fields this crate does not model (captured so nothing is lost)
    #[serde(flatten)]
    pub provider_extra: serde_json::Map<String, Value>,
}

/// A function call requested by the model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionCallItem {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub call_id: String,
    pub name: String,
    /// JSON-encoded argument string, exactly as the model produced it
    #[serde(default)]
    pub arguments: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

/// The output of a previously-requested function call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionCallOutputItem {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub call_id: String,
    #[serde(default)]
    pub output: String,
}

/// A reasoning block; content is opaque to this crate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReasoningItem {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default)]
    pub raw_content: Vec<Value>,
}

/// A tool call executed on the provider side
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostedToolCallItem {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(flatten)]
    pub provider_extra: serde_json::Map<String, Value>,
}

/// Marker left in history where a prior compaction replaced older items
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompactionItem {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(flatten)]
    pub payload: serde_json::Map<String, Value>,
}

/// One unit of conversation history
#[derive(Debug, Clone, PartialEq)]
pub enum ConversationItem {
    Message(MessageItem),
    FunctionCall(FunctionCallItem),
    FunctionCallOutput(FunctionCallOutputItem),
    Reasoning(ReasoningItem),
    HostedToolCall(HostedToolCallItem),
    Compaction(CompactionItem),
    /// Anything this crate does not recognize, preserved verbatim
    Unknown(Value),
}

impl ConversationItem {
    /// Create a user message with a single text part
    pub fn user(text: impl Into<String>) -> Self {
        Self::Message(MessageItem {
            id: None,
            role: Role::User,
            content: vec![ContentPart::input_text(text)],
            provider_extra: serde_json::Map::new(),
        })
    }

    /// Create an assistant message with a single text part
    pub fn assistant(text: impl Into<String>) -> Self {
        Self::Message(MessageItem {
            id: None,
            role: Role::Assistant,
            content: vec![ContentPart::output_text(text)],
            provider_extra: serde_json::Map::new(),
        })
    }

    /// Create a system message with a single text part
    pub fn system(text: impl Into<String>) -> Self {
        Self::Message(MessageItem {
            id: None,
            role: Role::System,
            content: vec![ContentPart::input_text(text)],
            provider_extra: serde_json::Map::new(),
        })
    }

    /// Create a function call item
    pub fn function_call(
        call_id: impl Into<String>,
        name: impl Into<String>,
        arguments: impl Into<String>,
    ) -> Self {
        Self::FunctionCall(FunctionCallItem {
            id: None,
            call_id: call_id.into(),
            name: name.into(),
            arguments: arguments.into(),
            status: None,
        })
    }

    /// Create a function call output item
    pub fn function_call_output(call_id: impl Into<String>, output: impl Into<String>) -> Self {
        Self::FunctionCallOutput(FunctionCallOutputItem {
            id: None,
            call_id: call_id.into(),
            output: output.into(),
        })
    }

    /// Create a bare compaction marker
    pub fn compaction_marker() -> Self {
        Self::Compaction(CompactionItem {
            id: None,
            payload: serde_json::Map::new(),
        })
    }

    /// Attach a server-assigned id (replaces any existing one)
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        let id = Some(id.into());
        match &mut self {
            Self::Message(m) => m.id = id,
            Self::FunctionCall(c) => c.id = id,
            Self::FunctionCallOutput(o) => o.id = id,
            Self::Reasoning(r) => r.id = id,
            Self::HostedToolCall(h) => h.id = id,
            Self::Compaction(c) => c.id = id,
            Self::Unknown(v) => {
                if let (Some(map), Some(id)) = (v.as_object_mut(), id) {
                    map.insert("id".to_string(), Value::String(id));
                }
            }
        }
        self
    }

    /// The wire tag of this item
    pub fn item_type(&self) -> &str {
        match self {
            Self::Message(_) => "message",
            Self::FunctionCall(_) => "function_call",
            Self::FunctionCallOutput(_) => "function_call_output",
            Self::Reasoning(_) => "reasoning",
            Self::HostedToolCall(_) => "hosted_tool_call",
            Self::Compaction(_) => "compaction",
            Self::Unknown(v) => v.get("type").and_then(Value::as_str).unwrap_or("unknown"),
        }
    }

    /// The server-assigned record id, if the item carries one
    pub fn server_id(&self) -> Option<&str> {
        match self {
            Self::Message(m) => m.id.as_deref(),
            Self::FunctionCall(c) => c.id.as_deref(),
            Self::FunctionCallOutput(o) => o.id.as_deref(),
            Self::Reasoning(r) => r.id.as_deref(),
            Self::HostedToolCall(h) => h.id.as_deref(),
            Self::Compaction(c) => c.id.as_deref(),
            Self::Unknown(v) => v.get("id").and_then(Value::as_str),
        }
    }

    /// The message role, for message items
    pub fn role(&self) -> Option<Role> {
        match self {
            Self::Message(m) => Some(m.role),
            _ => None,
        }
    }

    /// Concatenated text of a message item's text parts
    pub fn text(&self) -> Option<String> {
        match self {
            Self::Message(m) => {
                let text: Vec<&str> = m.content.iter().filter_map(ContentPart::as_text).collect();
                if text.is_empty() {
                    None
                } else {
                    Some(text.join(""))
                }
            }
            _ => None,
        }
    }

    /// Interpret a raw wire value as an item.
    ///
    /// Infallible: unrecognized tags, missing tags, and known tags whose
    /// payload fails to parse all become [`ConversationItem::Unknown`]
    /// holding the original value.
    pub fn from_value(value: Value) -> Self {
        let Some(tag) = value.get("type").and_then(Value::as_str).map(str::to_string) else {
            return Self::Unknown(value);
        };
        // Parse the payload without the tag so the flattened extras stay clean.
        let mut payload = value.clone();
        if let Some(map) = payload.as_object_mut() {
            map.remove("type");
        }
        let parsed = match tag.as_str() {
            "message" => serde_json::from_value(payload).map(Self::Message),
            "function_call" => serde_json::from_value(payload).map(Self::FunctionCall),
            "function_call_output" => serde_json::from_value(payload).map(Self::FunctionCallOutput),
            "reasoning" => serde_json::from_value(payload).map(Self::Reasoning),
            "hosted_tool_call" => serde_json::from_value(payload).map(Self::HostedToolCall),
            "compaction" => serde_json::from_value(payload).map(Self::Compaction),
            _ => return Self::Unknown(value),
        };
        parsed.unwrap_or_else(|_| Self::Unknown(value))
    }

    /// Encode this item back into its raw wire value.
    pub fn to_value(&self) -> Result<Value> {
        let (tag, mut value) = match self {
            Self::Message(m) => ("message", serde_json::to_value(m)?),
            Self::FunctionCall(c) => ("function_call", serde_json::to_value(c)?),
            Self::FunctionCallOutput(o) => ("function_call_output", serde_json::to_value(o)?),
            Self::Reasoning(r) => ("reasoning", serde_json::to_value(r)?),
            Self::HostedToolCall(h) => ("hosted_tool_call", serde_json::to_value(h)?),
            Self::Compaction(c) => ("compaction", serde_json::to_value(c)?),
            Self::Unknown(v) => return Ok(v.clone()),
        };
        if let Some(map) = value.as_object_mut() {
            map.insert("type".to_string(), Value::String(tag.to_string()));
        }
        Ok(value)
    }
}

impl Serialize for ConversationItem {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        self.to_value()
            .map_err(serde::ser::Error::custom)?
            .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for ConversationItem {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let value = Value::deserialize(deserializer)?;
        Ok(Self::from_value(value))
    }
}
