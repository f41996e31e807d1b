use super::ids::MessageId;

/// Storage-local message role, intentionally decoupled from chat-layer role enums.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageRole {
    User,
    Assistant,
}

impl MessageRole {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

/// What callers append and what `load_all` hands back: role and content only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageEntry {
    pub role: MessageRole,
    pub content: String,
}

impl MessageEntry {
    pub fn new(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(MessageRole::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(MessageRole::Assistant, content)
    }
}

/// A persisted row. Never leaves the storage crate through the store trait.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMessage {
    pub id: MessageId,
    pub seq: u64,
    pub role: MessageRole,
    pub content: String,
    pub created_at_unix_ms: u64,
}

impl StoredMessage {
    pub fn into_entry(self) -> MessageEntry {
        MessageEntry {
            role: self.role,
            content: self.content,
        }
    }
}
