use std::collections::VecDeque;
use std::fmt;

use murmur_llm::{ProviderMessage, Role as ProviderRole, TurnId, UsageReport};
use murmur_storage::{MessageEntry, MessageRole as StorageMessageRole};

/// Chat speaker role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    User,
    Assistant,
}

/// Core immutable message model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    pub fn to_provider(&self) -> ProviderMessage {
        let role = match self.role {
            Role::User => ProviderRole::User,
            Role::Assistant => ProviderRole::Assistant,
        };
        ProviderMessage::new(role, self.content.clone())
    }

    pub fn to_entry(&self) -> MessageEntry {
        let role = match self.role {
            Role::User => StorageMessageRole::User,
            Role::Assistant => StorageMessageRole::Assistant,
        };
        MessageEntry::new(role, self.content.clone())
    }
}

impl From<MessageEntry> for Message {
    fn from(entry: MessageEntry) -> Self {
        let role = match entry.role {
            StorageMessageRole::User => Role::User,
            StorageMessageRole::Assistant => Role::Assistant,
        };
        Self::new(role, entry.content)
    }
}

/// Bounded, ordered view of the conversation that is replayed to the model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationWindow {
    messages: VecDeque<Message>,
    bound: usize,
}

impl ConversationWindow {
    pub fn new(bound: usize) -> Self {
        Self {
            messages: VecDeque::with_capacity(bound.min(256)),
            bound,
        }
    }

    pub fn bound(&self) -> usize {
        self.bound
    }

    /// Appends and evicts oldest messages past the bound. Returns the eviction count.
    pub fn push(&mut self, message: Message) -> usize {
        self.messages.push_back(message);
        self.trim()
    }

    pub fn trim(&mut self) -> usize {
        let excess = self.messages.len().saturating_sub(self.bound);
        self.messages.drain(..excess);
        excess
    }

    /// Replaces the contents, keeping only the newest `bound` messages.
    pub fn replace_with(&mut self, messages: impl IntoIterator<Item = Message>) {
        self.messages = messages.into_iter().collect();
        self.trim();
    }

    pub fn clear(&mut self) {
        self.messages.clear();
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Message> {
        self.messages.iter()
    }

    pub fn to_provider_messages(&self) -> Vec<ProviderMessage> {
        self.messages.iter().map(Message::to_provider).collect()
    }
}

/// Sends made during this process lifetime. Not persisted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RequestCounter(u64);

impl RequestCounter {
    pub fn value(self) -> u64 {
        self.0
    }

    pub fn increment(&mut self) -> u64 {
        self.0 = self.0.saturating_add(1);
        self.0
    }
}

/// Usage of the most recent completed turn.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChatStats {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub prefill_speed: Option<f64>,
    pub decoding_speed: Option<f64>,
}

impl ChatStats {
    pub fn total_tokens(&self) -> u64 {
        self.prompt_tokens.saturating_add(self.completion_tokens)
    }
}

impl From<UsageReport> for ChatStats {
    fn from(report: UsageReport) -> Self {
        Self {
            prompt_tokens: report.prompt_tokens,
            completion_tokens: report.completion_tokens,
            prefill_speed: report.prefill_speed,
            decoding_speed: report.decoding_speed,
        }
    }
}

impl fmt::Display for ChatStats {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            formatter,
            "prompt {} · completion {} · total {} · prefill {} · decoding {}",
            self.prompt_tokens,
            self.completion_tokens,
            self.total_tokens(),
            format_speed(self.prefill_speed),
            format_speed(self.decoding_speed),
        )
    }
}

fn format_speed(speed: Option<f64>) -> String {
    match speed {
        Some(value) => format!("{value:.1} tok/s"),
        None => "—".to_string(),
    }
}

/// Lifecycle of one user turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TurnPhase {
    #[default]
    Idle,
    AwaitingFirstToken(TurnId),
    Streaming(TurnId),
    Finalizing(TurnId),
    TimedOut(TurnId),
    Failed(TurnId),
}

/// State transition input for the turn lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseTransition {
    Begin(TurnId),
    FirstToken(TurnId),
    StreamEnded(TurnId),
    TimeOut(TurnId),
    Fail(TurnId),
    /// Returns a finished turn to `Idle`.
    Settle,
}

/// Rejection reason for illegal phase transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseRejection {
    AlreadyActive { active: TurnId, attempted: TurnId },
    NoActiveTurn,
    TurnMismatch { active: TurnId, attempted: TurnId },
    StillRunning(TurnId),
}

pub type PhaseResult = Result<TurnPhase, PhaseRejection>;

impl TurnPhase {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Idle => "Ready",
            Self::AwaitingFirstToken(_) => "Waiting for the model…",
            Self::Streaming(_) => "Generating…",
            Self::Finalizing(_) => "Finishing…",
            Self::TimedOut(_) => "Timed out",
            Self::Failed(_) => "Failed",
        }
    }

    /// Turn that is still producing or committing output.
    pub fn active_turn(&self) -> Option<TurnId> {
        match self {
            Self::AwaitingFirstToken(turn) | Self::Streaming(turn) | Self::Finalizing(turn) => {
                Some(*turn)
            }
            Self::Idle | Self::TimedOut(_) | Self::Failed(_) => None,
        }
    }

    pub fn is_busy(&self) -> bool {
        self.active_turn().is_some()
    }

    /// Only a running generation may have its stream events applied.
    pub fn accepts_stream_event(&self, turn: TurnId) -> bool {
        matches!(
            self,
            Self::AwaitingFirstToken(active) | Self::Streaming(active) if *active == turn
        )
    }

    pub fn apply(&self, transition: PhaseTransition) -> PhaseResult {
        match transition {
            PhaseTransition::Begin(turn) => self.apply_begin(turn),
            PhaseTransition::FirstToken(turn) => {
                self.apply_generating(turn, |_| Self::Streaming(turn), true)
            }
            PhaseTransition::StreamEnded(turn) => {
                self.apply_generating(turn, |_| Self::Finalizing(turn), false)
            }
            PhaseTransition::TimeOut(turn) => {
                self.apply_generating(turn, |_| Self::TimedOut(turn), false)
            }
            PhaseTransition::Fail(turn) => {
                self.apply_generating(turn, |_| Self::Failed(turn), false)
            }
            PhaseTransition::Settle => self.apply_settle(),
        }
    }

    fn apply_begin(&self, turn: TurnId) -> PhaseResult {
        match self.active_turn() {
            Some(active) => Err(PhaseRejection::AlreadyActive {
                active,
                attempted: turn,
            }),
            None => Ok(Self::AwaitingFirstToken(turn)),
        }
    }

    fn apply_generating(
        &self,
        turn: TurnId,
        next: impl FnOnce(TurnId) -> Self,
        idempotent_when_streaming: bool,
    ) -> PhaseResult {
        match self {
            Self::Streaming(active) if *active == turn && idempotent_when_streaming => Ok(*self),
            Self::AwaitingFirstToken(active) | Self::Streaming(active) if *active == turn => {
                Ok(next(turn))
            }
            Self::AwaitingFirstToken(active)
            | Self::Streaming(active)
            | Self::Finalizing(active) => Err(PhaseRejection::TurnMismatch {
                active: *active,
                attempted: turn,
            }),
            Self::Idle | Self::TimedOut(_) | Self::Failed(_) => Err(PhaseRejection::NoActiveTurn),
        }
    }

    fn apply_settle(&self) -> PhaseResult {
        match self {
            Self::AwaitingFirstToken(turn) | Self::Streaming(turn) => {
                Err(PhaseRejection::StillRunning(*turn))
            }
            Self::Idle | Self::Finalizing(_) | Self::TimedOut(_) | Self::Failed(_) => {
                Ok(Self::Idle)
            }
        }
    }
}
