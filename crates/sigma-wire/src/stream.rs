//! Streamed response events and item reconstruction

use serde::{Deserialize, Serialize};
use std::pin::Pin;
use tokio_stream::Stream;

use crate::items::{ContentPart, ConversationItem, TokenUsage};

/// Events emitted while a model response streams in
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResponseEvent {
    /// A new output item opened at this index
    ItemStart {
        output_index: usize,
        item: ConversationItem,
    },
    /// Text appended to the message item at this index
    TextDelta { output_index: usize, delta: String },
    /// Argument text appended to the function call at this index
    ArgumentsDelta { output_index: usize, delta: String },
    /// The item at this index reached its final form
    ItemDone {
        output_index: usize,
        item: ConversationItem,
    },
    /// The response finished
    Completed {
        response_id: String,
        usage: TokenUsage,
    },
    /// The stream failed
    Error { message: String },
}

impl ResponseEvent {
    /// Check if this is a terminal event (Completed or Error)
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ResponseEvent::Completed { .. } | ResponseEvent::Error { .. }
        )
    }
}

/// A stream of response events
pub type ResponseEventStream = Pin<Box<dyn Stream<Item = ResponseEvent> + Send>>;

/// A fully reconstructed response
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StreamedResponse {
    pub items: Vec<ConversationItem>,
    pub response_id: Option<String>,
    pub usage: TokenUsage,
}

/// Accumulates streamed events back into final conversation items
#[derive(Debug, Default)]
pub struct ItemAccumulator {
    slots: Vec<ConversationItem>,
    response_id: Option<String>,
    usage: TokenUsage,
}

impl ItemAccumulator {
    /// Create a new accumulator
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one event into the accumulated state
    pub fn process_event(&mut self, event: &ResponseEvent) {
        match event {
            ResponseEvent::ItemStart { output_index, item } => {
                self.ensure_slot(*output_index, item.clone());
            }
            ResponseEvent::TextDelta {
                output_index,
                delta,
            } => {
                if let Some(ConversationItem::Message(msg)) = self.slots.get_mut(*output_index) {
                    match msg.content.last_mut() {
                        Some(ContentPart::OutputText { text }) => text.push_str(delta),
                        _ => msg.content.push(ContentPart::output_text(delta.clone())),
                    }
                }
            }
            ResponseEvent::ArgumentsDelta {
                output_index,
                delta,
            } => {
                if let Some(ConversationItem::FunctionCall(call)) =
                    self.slots.get_mut(*output_index)
                {
                    call.arguments.push_str(delta);
                }
            }
            ResponseEvent::ItemDone { output_index, item } => {
                self.ensure_slot(*output_index, item.clone());
            }
            ResponseEvent::Completed { response_id, usage } => {
                self.response_id = Some(response_id.clone());
                self.usage = usage.clone();
            }
            ResponseEvent::Error { .. } => {}
        }
    }

    /// Get the current partial items
    pub fn items(&self) -> Vec<ConversationItem> {
        self.slots.clone()
    }

    /// Consume the accumulator and produce the final response
    pub fn finish(self) -> StreamedResponse {
        StreamedResponse {
            items: self.slots,
            response_id: self.response_id,
            usage: self.usage,
        }
    }

    fn ensure_slot(&mut self, index: usize, item: ConversationItem) {
        while self.slots.len() <= index {
            self.slots.push(ConversationItem::assistant(""));
        }
        self.slots[index] = item;
    }
}
