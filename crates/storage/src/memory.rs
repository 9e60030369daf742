use tokio::sync::{RwLock, broadcast};

use super::error::StorageResult;
use super::ids::QueueId;
use super::{BoxFuture, DEFAULT_LIVE_CAPACITY, DurableQueue};

/// Process-local queue. Durable for the lifetime of the value only.
pub struct MemoryQueue<T> {
    id: QueueId,
    items: RwLock<Vec<T>>,
    live: broadcast::Sender<T>,
}

impl<T> MemoryQueue<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::with_id(QueueId::new_v7())
    }

    pub fn with_id(id: QueueId) -> Self {
        let (live, _) = broadcast::channel(DEFAULT_LIVE_CAPACITY);
        Self {
            id,
            items: RwLock::new(Vec::new()),
            live,
        }
    }

    pub async fn len(&self) -> usize {
        self.items.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.items.read().await.is_empty()
    }
}

impl<T> Default for MemoryQueue<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T> DurableQueue<T> for MemoryQueue<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn id(&self) -> QueueId {
        self.id
    }

    fn append<'a>(&'a self, items: Vec<T>) -> BoxFuture<'a, StorageResult<()>> {
        Box::pin(async move {
            if items.is_empty() {
                return Ok(());
            }

            // Publishing under the write guard keeps live order equal to log order.
            let mut log = self.items.write().await;
            log.extend(items.iter().cloned());
            for item in items {
                let _ = self.live.send(item);
            }
            Ok(())
        })
    }

    fn subscribe(&self) -> broadcast::Receiver<T> {
        self.live.subscribe()
    }

    fn read_all<'a>(&'a self) -> BoxFuture<'a, StorageResult<Vec<T>>> {
        Box::pin(async move { Ok(self.items.read().await.clone()) })
    }
}
