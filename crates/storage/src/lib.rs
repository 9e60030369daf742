//! Durable append-only queues.
//!
//! A queue is both the log of everything appended to it and a live feed of new
//! appends. Batches are appended atomically and read back in append order.

use std::future::Future;
use std::pin::Pin;

use tokio::sync::broadcast;

pub mod error;
pub mod ids;
pub mod memory;
pub mod sqlite;

pub use error::{StorageError, StorageResult};
pub use ids::QueueId;
pub use memory::MemoryQueue;
pub use sqlite::{SqliteQueue, SqliteStore};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Capacity of the live feed kept by every queue implementation.
pub const DEFAULT_LIVE_CAPACITY: usize = 256;

pub trait DurableQueue<T>: Send + Sync
where
    T: Clone + Send + Sync + 'static,
{
    fn id(&self) -> QueueId;

    /// Appends the whole batch or nothing. Concurrent appends are serialized.
    fn append<'a>(&'a self, items: Vec<T>) -> BoxFuture<'a, StorageResult<()>>;

    /// Live feed of items appended after the call.
    fn subscribe(&self) -> broadcast::Receiver<T>;

    fn read_all<'a>(&'a self) -> BoxFuture<'a, StorageResult<Vec<T>>>;
}
