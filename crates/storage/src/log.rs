use std::fmt;
use std::sync::Arc;

use super::ConversationStore;
use super::error::StorageResult;
use super::types::MessageEntry;

/// Degrade-gracefully handle over an optional [`ConversationStore`].
///
/// When the backing store could not be opened every operation succeeds as a
/// no-op, so chat keeps working without persistence.
#[derive(Clone)]
pub struct MessageLog {
    backend: Option<Arc<dyn ConversationStore>>,
}

impl MessageLog {
    pub fn new(store: Arc<dyn ConversationStore>) -> Self {
        Self {
            backend: Some(store),
        }
    }

    pub fn unavailable() -> Self {
        Self { backend: None }
    }

    /// Wraps the outcome of opening a store, logging and absorbing failures.
    pub fn from_open_result<S>(result: StorageResult<S>) -> Self
    where
        S: ConversationStore + 'static,
    {
        match result {
            Ok(store) => Self::new(Arc::new(store)),
            Err(error) => {
                tracing::warn!(
                    stage = error.stage(),
                    error = %error,
                    "conversation store unavailable; continuing without persistence"
                );
                Self::unavailable()
            }
        }
    }

    pub fn is_available(&self) -> bool {
        self.backend.is_some()
    }

    pub async fn append(&self, entry: MessageEntry) -> StorageResult<()> {
        match &self.backend {
            Some(store) => store.append(entry).await,
            None => Ok(()),
        }
    }

    pub async fn load_all(&self) -> StorageResult<Vec<MessageEntry>> {
        match &self.backend {
            Some(store) => store.load_all().await,
            None => Ok(Vec::new()),
        }
    }

    pub async fn clear(&self) -> StorageResult<()> {
        match &self.backend {
            Some(store) => store.clear().await,
            None => Ok(()),
        }
    }
}

impl fmt::Debug for MessageLog {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("MessageLog")
            .field("available", &self.is_available())
            .finish()
    }
}

impl From<Arc<dyn ConversationStore>> for MessageLog {
    fn from(store: Arc<dyn ConversationStore>) -> Self {
        Self::new(store)
    }
}
