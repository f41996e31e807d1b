use std::time::Duration;

use murmur_llm::{ProviderError, TurnId};
use murmur_storage::StorageError;
use snafu::Snafu;

pub const TIMEOUT_MESSAGE: &str =
    "The model took too long to respond. Please try again, or ask for a shorter answer.";
pub const GENERIC_ERROR_MESSAGE: &str =
    "Something went wrong while generating a reply. Please try again.";
pub const EMPTY_REPLY_MESSAGE: &str = "The model returned an empty reply.";
pub const UNAVAILABLE_MESSAGE: &str =
    "The local inference engine is not available. Start it and restart murmur to chat.";
pub const INIT_FAILURE_MESSAGE: &str =
    "The selected model could not be loaded. Pick another model to continue.";
pub const CLEAR_FAILURE_MESSAGE: &str = "Chat history could not be cleared.";

pub type ChatResult<T> = Result<T, ChatError>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ChatError {
    #[snafu(display("{reason}"))]
    Validation { stage: &'static str, reason: String },
    #[snafu(display("{reason}"))]
    QuotaExceeded { stage: &'static str, reason: String },
    #[snafu(display("a reply for {turn:?} is still being generated"))]
    TurnInProgress { stage: &'static str, turn: TurnId },
    #[snafu(display("model '{model_id}' is not available for selection"))]
    UnknownModel {
        stage: &'static str,
        model_id: String,
    },
    #[snafu(display("input is locked while the inference engine is unavailable"))]
    InputLocked { stage: &'static str },
    #[snafu(display("no model is loaded"))]
    CapabilityNotReady { stage: &'static str },
    #[snafu(display("inference engine unavailable on `{stage}`: {source}"))]
    CapabilityUnavailable {
        stage: &'static str,
        source: ProviderError,
    },
    #[snafu(display("failed to initialize model '{model_id}' on `{stage}`: {source}"))]
    CapabilityInitFailure {
        stage: &'static str,
        model_id: String,
        source: ProviderError,
    },
    #[snafu(display("no complete reply within {timeout:?}"))]
    RequestTimeout {
        stage: &'static str,
        timeout: Duration,
    },
    #[snafu(display("streaming failed on `{stage}`: {details}"))]
    StreamingFailure {
        stage: &'static str,
        details: String,
    },
    #[snafu(display("conversation store failed on `{stage}`: {source}"))]
    StorageUnavailable {
        stage: &'static str,
        source: StorageError,
    },
}

impl ChatError {
    pub fn stage(&self) -> &'static str {
        match self {
            Self::Validation { stage, .. }
            | Self::QuotaExceeded { stage, .. }
            | Self::TurnInProgress { stage, .. }
            | Self::UnknownModel { stage, .. }
            | Self::InputLocked { stage }
            | Self::CapabilityNotReady { stage }
            | Self::CapabilityUnavailable { stage, .. }
            | Self::CapabilityInitFailure { stage, .. }
            | Self::RequestTimeout { stage, .. }
            | Self::StreamingFailure { stage, .. }
            | Self::StorageUnavailable { stage, .. } => stage,
        }
    }

    /// Guard rejections that leave all state untouched.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            Self::Validation { .. }
                | Self::QuotaExceeded { .. }
                | Self::TurnInProgress { .. }
                | Self::UnknownModel { .. }
                | Self::InputLocked { .. }
                | Self::CapabilityNotReady { .. }
        )
    }

    /// Text safe to show the user. Technical causes stay in the logs.
    pub fn user_message(&self) -> String {
        match self {
            Self::Validation { reason, .. } | Self::QuotaExceeded { reason, .. } => reason.clone(),
            Self::TurnInProgress { .. } => "Wait for the current reply to finish.".to_string(),
            Self::UnknownModel { model_id, .. } => format!("Unknown model '{model_id}'."),
            Self::InputLocked { .. } => {
                "Input is disabled while the inference engine is unavailable.".to_string()
            }
            Self::CapabilityNotReady { .. } => "No model is loaded yet.".to_string(),
            Self::CapabilityUnavailable { .. } => UNAVAILABLE_MESSAGE.to_string(),
            Self::CapabilityInitFailure { .. } => INIT_FAILURE_MESSAGE.to_string(),
            Self::RequestTimeout { .. } => TIMEOUT_MESSAGE.to_string(),
            Self::StreamingFailure { .. } => GENERIC_ERROR_MESSAGE.to_string(),
            Self::StorageUnavailable { .. } => CLEAR_FAILURE_MESSAGE.to_string(),
        }
    }
}
