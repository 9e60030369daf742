use std::sync::Arc;

use chatflow_llm::Message;
use chatflow_storage::{DurableQueue, MemoryQueue, QueueId, StorageResult};
use tokio::sync::broadcast;

/// Append-only transcript backed by a durable queue.
#[derive(Clone)]
pub struct Conversation {
    queue: Arc<dyn DurableQueue<Message>>,
}

impl Conversation {
    pub fn new(queue: Arc<dyn DurableQueue<Message>>) -> Self {
        Self { queue }
    }

    /// Conversation kept in process memory.
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryQueue::new()))
    }

    pub fn id(&self) -> QueueId {
        self.queue.id()
    }

    /// Commits a whole turn. Either every message lands or none does.
    pub async fn append(&self, messages: Vec<Message>) -> StorageResult<()> {
        let count = messages.len();
        self.queue.append(messages).await?;
        tracing::debug!(conversation_id = %self.id(), count, "appended messages");
        Ok(())
    }

    /// Messages in append order.
    pub async fn history(&self) -> StorageResult<Vec<Message>> {
        self.queue.read_all().await
    }

    /// Live feed of messages appended after the call.
    pub fn subscribe(&self) -> broadcast::Receiver<Message> {
        self.queue.subscribe()
    }
}

impl std::fmt::Debug for Conversation {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("Conversation")
            .field("id", &self.id())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use chatflow_llm::{Block, Role};
    use chatflow_storage::SqliteStore;

    use super::*;

    #[tokio::test]
    async fn turns_are_read_back_in_commit_order() {
        let conversation = Conversation::in_memory();
        let mut live = conversation.subscribe();

        let first = vec![
            Message::user_text("hi"),
            Message::new(Role::Assistant, vec![Block::text("hello")]),
        ];
        let second = vec![Message::user_text("bye")];
        conversation.append(first.clone()).await.expect("append first");
        conversation.append(second.clone()).await.expect("append second");

        let history = conversation.history().await.expect("history");
        assert_eq!(history, [first.clone(), second].concat());
        assert_eq!(live.recv().await.expect("live"), first[0]);
    }

    #[tokio::test]
    async fn sqlite_backed_conversation_keeps_blocks() {
        let store = SqliteStore::open(":memory:").await.expect("open store");
        let conversation = Conversation::new(Arc::new(store.queue::<Message>(QueueId::new_v7())));

        let turn = vec![
            Message::user_text("weather?"),
            Message::new(
                Role::Assistant,
                vec![Block::tool_call("c1", "weather", serde_json::json!({ "city": "Oslo" }))],
            ),
        ];
        conversation.append(turn.clone()).await.expect("append");
        assert_eq!(conversation.history().await.expect("history"), turn);
    }
}
