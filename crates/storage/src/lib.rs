use std::future::Future;
use std::pin::Pin;
use std::time::{SystemTime, UNIX_EPOCH};

pub mod error;
pub mod ids;
pub mod log;
pub mod memory;
pub mod sqlite;
pub mod types;

pub use error::{StorageError, StorageResult};
pub use ids::MessageId;
pub use log::MessageLog;
pub use memory::MemoryStore;
pub use sqlite::SqliteStorage;
pub use types::{MessageEntry, MessageRole, StoredMessage};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Durable append-only log of one conversation.
///
/// Implementations assign the surrogate id, sequence number and timestamp in a
/// single step so that timestamp order never disagrees with insertion order.
pub trait ConversationStore: Send + Sync {
    fn append<'a>(&'a self, entry: MessageEntry) -> BoxFuture<'a, StorageResult<()>>;
    /// Returns every retained message, oldest first.
    fn load_all<'a>(&'a self) -> BoxFuture<'a, StorageResult<Vec<MessageEntry>>>;
    /// Removes every persisted message. In-memory views are the caller's to reset.
    fn clear<'a>(&'a self) -> BoxFuture<'a, StorageResult<()>>;
}

pub(crate) fn unix_timestamp_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0_i64, |duration| duration.as_millis() as i64)
}
