#![deny(unsafe_code)]

//! Streaming chat client core: guard, throttled rendering, sanitized
//! markdown and the turn orchestrator that ties them to a local model.

pub mod cli;
pub mod commands;
pub mod config;
pub mod error;
pub mod guard;
/// Markdown conversion into sanitized fragments, plus the render cache.
pub mod markdown;
/// Chat domain types and the turn lifecycle.
pub mod message;
pub mod orchestrator;
pub mod session;
pub mod surface;
/// Plain terminal front end.
pub mod terminal;
pub mod throttle;

pub use cli::Cli;
pub use commands::{Command, CommandOutcome, HELP_TEXT, InputLine, TurnOutcome};
pub use config::{ChatConfig, ConfigError};
pub use error::{ChatError, ChatResult};
pub use markdown::{CommonMarkConverter, Fragment, MarkdownCache, MarkupConverter};
pub use message::{ChatStats, ConversationWindow, Message, RequestCounter, Role, TurnPhase};
pub use orchestrator::{CapabilityState, ChatOrchestrator};
pub use session::SessionContext;
pub use surface::{ChatSurface, RecordingSurface, SurfaceEvent};
pub use terminal::TerminalSurface;
