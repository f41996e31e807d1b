use tokio::sync::Mutex;

use super::error::StorageResult;
use super::ids::MessageId;
use super::types::{MessageEntry, StoredMessage};
use super::{BoxFuture, ConversationStore, unix_timestamp_millis};

#[derive(Debug, Default)]
struct MemoryState {
    rows: Vec<StoredMessage>,
    last_seq: u64,
}

/// Process-local store with the same ordering and retention rules as sqlite.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
    retention: Option<usize>,
}

impl MemoryStore {
    pub fn new(retention: Option<usize>) -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
            retention,
        }
    }

    pub async fn list_stored(&self) -> Vec<StoredMessage> {
        self.state.lock().await.rows.clone()
    }
}

impl ConversationStore for MemoryStore {
    fn append<'a>(&'a self, entry: MessageEntry) -> BoxFuture<'a, StorageResult<()>> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            let floor = state
                .rows
                .last()
                .map_or(0, |row| row.created_at_unix_ms);
            let now = u64::try_from(unix_timestamp_millis()).unwrap_or(0);

            state.last_seq += 1;
            let seq = state.last_seq;
            state.rows.push(StoredMessage {
                id: MessageId::new_v7(),
                seq,
                role: entry.role,
                content: entry.content,
                created_at_unix_ms: now.max(floor),
            });

            if let Some(retention) = self.retention
                && state.rows.len() > retention
            {
                let excess = state.rows.len() - retention;
                state.rows.drain(..excess);
            }

            Ok(())
        })
    }

    fn load_all<'a>(&'a self) -> BoxFuture<'a, StorageResult<Vec<MessageEntry>>> {
        Box::pin(async move {
            let state = self.state.lock().await;
            Ok(state
                .rows
                .iter()
                .cloned()
                .map(StoredMessage::into_entry)
                .collect())
        })
    }

    fn clear<'a>(&'a self) -> BoxFuture<'a, StorageResult<()>> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            state.rows.clear();
            state.last_seq = 0;
            Ok(())
        })
    }
}
