use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::ids::MessageId;

/// Position of a block inside one message.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct BlockId(pub u32);

impl BlockId {
    /// Creates a typed block slot index.
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }
}

/// Token accounting reported by the model service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
}

/// Result of one tool invocation as recorded in the transcript.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum ToolOutcome {
    Success { output: Value },
    Error { message: String },
}

impl ToolOutcome {
    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error { .. })
    }
}

/// Content carried by one block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum BlockPayload {
    Text {
        text: String,
    },
    Reasoning {
        text: String,
    },
    ToolCall {
        call_id: String,
        name: String,
        input: Value,
    },
    ToolResult {
        call_id: String,
        name: String,
        outcome: ToolOutcome,
    },
    Summary {
        model: Option<String>,
        duration_ms: u64,
        tool_calls: u32,
        usage: Option<Usage>,
    },
    Status {
        text: String,
    },
}

/// Smallest unit of model output.
///
/// A pending block is provisional: the next block for the same slot replaces it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Block {
    pub id: BlockId,
    pub pending: bool,
    pub payload: BlockPayload,
}

impl Block {
    /// Creates a final block.
    pub fn complete(payload: BlockPayload) -> Self {
        Self {
            id: BlockId::default(),
            pending: false,
            payload,
        }
    }

    /// Creates a provisional block.
    pub fn pending(payload: BlockPayload) -> Self {
        Self {
            id: BlockId::default(),
            pending: true,
            payload,
        }
    }

    pub fn text(text: impl Into<String>) -> Self {
        Self::complete(BlockPayload::Text { text: text.into() })
    }

    pub fn pending_text(text: impl Into<String>) -> Self {
        Self::pending(BlockPayload::Text { text: text.into() })
    }

    pub fn tool_call(call_id: impl Into<String>, name: impl Into<String>, input: Value) -> Self {
        Self::complete(BlockPayload::ToolCall {
            call_id: call_id.into(),
            name: name.into(),
            input,
        })
    }

    pub fn tool_result(
        call_id: impl Into<String>,
        name: impl Into<String>,
        outcome: ToolOutcome,
    ) -> Self {
        Self::complete(BlockPayload::ToolResult {
            call_id: call_id.into(),
            name: name.into(),
            outcome,
        })
    }

    pub fn status(text: impl Into<String>) -> Self {
        Self::pending(BlockPayload::Status { text: text.into() })
    }

    pub fn with_id(mut self, id: BlockId) -> Self {
        self.id = id;
        self
    }

    /// Returns the same block marked final.
    pub fn finalized(mut self) -> Self {
        self.pending = false;
        self
    }

    pub fn is_tool_call(&self) -> bool {
        matches!(self.payload, BlockPayload::ToolCall { .. })
    }

    pub fn text_content(&self) -> Option<&str> {
        match &self.payload {
            BlockPayload::Text { text } => Some(text),
            _ => None,
        }
    }
}

/// Author of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Role {
    User,
    Assistant,
    /// Never produced here: tool results are blocks of the assistant message.
    /// Accepted when decoding history written by other producers.
    Tool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Sender {
    pub role: Role,
}

/// Immutable transcript entry once appended to a conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub created_at_unix_millis: i64,
    pub sender: Sender,
    pub blocks: Vec<Block>,
}

impl Message {
    /// Creates a message stamped with a fresh id and the current time.
    pub fn new(role: Role, blocks: Vec<Block>) -> Self {
        Self {
            id: MessageId::new_v7(),
            created_at_unix_millis: unix_timestamp_millis(),
            sender: Sender { role },
            blocks,
        }
    }

    /// Creates the user message that opens a turn.
    pub fn user_text(text: impl Into<String>) -> Self {
        Self::new(Role::User, vec![Block::text(text)])
    }

    pub fn role(&self) -> Role {
        self.sender.role
    }

    /// Concatenates every text block.
    pub fn text(&self) -> String {
        self.blocks
            .iter()
            .filter_map(Block::text_content)
            .collect::<Vec<_>>()
            .join("")
    }

    pub fn has_pending_blocks(&self) -> bool {
        self.blocks.iter().any(|block| block.pending)
    }
}

fn unix_timestamp_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |duration| {
            i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
        })
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn externally_written_tool_messages_decode() {
        let value = json!({
            "id": MessageId::new_v7(),
            "created_at_unix_millis": 0,
            "sender": { "role": "tool" },
            "blocks": [Block::text("42")],
        });
        let message: Message = serde_json::from_value(value).expect("tool message");
        assert_eq!(message.role(), Role::Tool);
        assert_eq!(message.text(), "42");
    }

    #[test]
    fn blocks_serialize_with_type_tags() {
        let block = Block::tool_call("call-1", "search", json!({ "q": "rust" }));
        let value = serde_json::to_value(&block).expect("serialize");
        assert_eq!(value["payload"]["type"], "toolCall");
        assert_eq!(value["payload"]["name"], "search");
        assert_eq!(value["pending"], false);
    }

    #[test]
    fn message_text_joins_text_blocks_only() {
        let message = Message::new(
            Role::Assistant,
            vec![
                Block::text("Hello"),
                Block::tool_call("call-1", "noop", json!({})),
                Block::text(" world"),
            ],
        );
        assert_eq!(message.text(), "Hello world");
        assert!(!message.has_pending_blocks());
    }

    #[test]
    fn stored_messages_decode_back() {
        let message = Message::new(
            Role::Assistant,
            vec![Block::tool_result(
                "call-1",
                "search",
                ToolOutcome::Error {
                    message: "timeout".to_string(),
                },
            )],
        );
        let raw = serde_json::to_string(&message).expect("serialize");
        let decoded: Message = serde_json::from_str(&raw).expect("deserialize");
        assert_eq!(decoded, message);
    }
}
