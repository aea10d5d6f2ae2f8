//! Core state for agentchattr: durable chat store, mention routing,
//! presence tracking, per-agent trigger queues, and the session token.
//!
//! Everything here is transport-agnostic. The `agentchattr` binary wires
//! these pieces to axum endpoints, the MCP bridge, and the per-agent
//! wrapper supervisors.

pub mod config;
pub mod error;
pub mod presence;
pub mod queue;
pub mod router;
pub mod store;
pub mod token;
pub mod types;

pub use error::ChatError;

/// Channel names: lowercase alphanumeric plus dashes, 1..=20 chars,
/// must not start with a dash.
pub fn is_valid_channel_name(name: &str) -> bool {
    let bytes = name.as_bytes();
    if bytes.is_empty() || bytes.len() > 20 {
        return false;
    }
    if !bytes[0].is_ascii_lowercase() && !bytes[0].is_ascii_digit() {
        return false;
    }
    bytes[1..]
        .iter()
        .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || *b == b'-')
}

/// The default channel. Always exists, cannot be renamed or deleted.
pub const DEFAULT_CHANNEL: &str = "general";

/// Hard cap on the number of channels.
pub const MAX_CHANNELS: usize = 8;

#[cfg(test)]
mod tests {
    use super::is_valid_channel_name;

    #[test]
    fn channel_names_accepted() {
        for name in ["a", "a1", "a-b", "general", "dev-2"] {
            assert!(is_valid_channel_name(name), "{name} should be valid");
        }
    }

    #[test]
    fn channel_names_rejected() {
        for name in ["", "A", "-a", "a_b", "a/b", "a b", "aaaaaaaaaaaaaaaaaaaaa"] {
            assert!(!is_valid_channel_name(name), "{name} should be invalid");
        }
    }
}
