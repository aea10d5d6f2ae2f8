//! Error taxonomy shared by the hub, the MCP bridge, and the wrappers.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ChatError {
    /// Missing or mismatched session token, or a bad origin.
    #[error("forbidden: {0}")]
    Auth(String),

    /// Malformed client input: bad channel name, oversized decision text,
    /// unparseable frame.
    #[error("invalid: {0}")]
    Validation(String),

    /// A durable write failed. In-memory state has been rolled back.
    #[error("persistence failure: {0}")]
    Persistence(#[from] std::io::Error),

    /// Keystroke injection into a terminal session failed.
    #[error("injection failed: {0}")]
    Injection(String),

    /// An MCP probe or tool call timed out or could not connect.
    #[error("transport: {0}")]
    Transport(String),

    /// A fixed cap was reached (decisions, channels).
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Unrecoverable startup problem: invalid config, port bind refused.
    #[error("fatal: {0}")]
    Fatal(String),
}

impl ChatError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// True for failures that should only be counted, not escalated on
    /// first occurrence.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transport(_))
    }

    /// True for failures worth surfacing to the user as a system chat
    /// message rather than a log line.
    pub fn is_user_visible(&self) -> bool {
        matches!(self, Self::Validation(_) | Self::ResourceExhausted(_))
    }
}

pub type Result<T> = std::result::Result<T, ChatError>;
