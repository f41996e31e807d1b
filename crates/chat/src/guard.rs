//! Stateless checks run before a message leaves the client.

use murmur_llm::ModelWhitelist;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Validation {
    Valid,
    /// Reason is shown to the user as-is.
    Invalid(String),
}

impl Validation {
    pub fn is_valid(&self) -> bool {
        matches!(self, Self::Valid)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QuotaCheck {
    Allowed,
    Denied(String),
}

impl QuotaCheck {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed)
    }
}

/// Rejects blank text and text longer than `max_chars` characters.
pub fn validate_outgoing(text: &str, max_chars: usize) -> Validation {
    if text.trim().is_empty() {
        return Validation::Invalid("Message is empty.".to_string());
    }

    let length = text.chars().count();
    if length > max_chars {
        return Validation::Invalid(format!(
            "Message is too long ({length} characters, limit is {max_chars})."
        ));
    }

    Validation::Valid
}

pub fn check_quota(current: u64, limit: u64) -> QuotaCheck {
    if current >= limit {
        QuotaCheck::Denied(format!(
            "Request limit reached ({limit} per session). Restart to continue."
        ))
    } else {
        QuotaCheck::Allowed
    }
}

pub fn is_known_model(candidate: &str, whitelist: &ModelWhitelist) -> bool {
    whitelist.contains(candidate)
}
