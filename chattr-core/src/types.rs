use serde::{Deserialize, Serialize};

/// Message type tag. `Message` is the default and is what humans and agents
/// produce; the rest are synthesized by the hub.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    #[default]
    Message,
    System,
    Join,
    Leave,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    /// Storage path on the server, when the file came in through upload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    pub name: String,
    pub url: String,
}

/// A stored chat message. Immutable after insert except for deletion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: u64,
    pub sender: String,
    pub text: String,
    #[serde(rename = "type", default)]
    pub kind: MessageKind,
    /// Seconds since the epoch.
    pub timestamp: u64,
    /// Display time, `HH:MM:SS` local.
    pub time: String,
    #[serde(default = "default_channel")]
    pub channel: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<u64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,
}

fn default_channel() -> String {
    crate::DEFAULT_CHANNEL.to_string()
}

/// Fields a caller supplies when posting; the store assigns the rest.
#[derive(Debug, Clone, Default)]
pub struct NewMessage {
    pub sender: String,
    pub text: String,
    pub kind: MessageKind,
    pub channel: String,
    pub reply_to: Option<u64>,
    pub attachments: Vec<Attachment>,
}

impl NewMessage {
    pub fn new(sender: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            sender: sender.into(),
            text: text.into(),
            channel: crate::DEFAULT_CHANNEL.to_string(),
            ..Default::default()
        }
    }

    pub fn in_channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = channel.into();
        self
    }

    pub fn with_kind(mut self, kind: MessageKind) -> Self {
        self.kind = kind;
        self
    }
}

/// Pin status for a message flagged in the side index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PinStatus {
    Todo,
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionStatus {
    Proposed,
    Approved,
}

/// A short, human-approved note giving durable guidance to agents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decision {
    pub id: u64,
    pub owner: String,
    pub decision: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub status: DecisionStatus,
}

/// Maximum characters for decision text and reason.
pub const DECISION_TEXT_MAX: usize = 80;

/// Maximum number of decisions retained at once.
pub const DECISION_CAP: usize = 30;

/// One pending wake-up on an agent's trigger queue. The target agent is
/// implied by the queue file the entry is written to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerEntry {
    pub channel: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<u64>,
    /// Seconds since the epoch.
    pub ts: u64,
}

/// Room-wide settings, persisted as a tagged store record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomSettings {
    pub title: String,
    pub username: String,
    pub max_agent_hops: u32,
    /// `"all"` or a number rendered as a string.
    pub history_limit: String,
}

impl Default for RoomSettings {
    fn default() -> Self {
        Self {
            title: "agentchattr".to_string(),
            username: "user".to_string(),
            max_agent_hops: 4,
            history_limit: "all".to_string(),
        }
    }
}

impl RoomSettings {
    pub fn history_count(&self) -> usize {
        match self.history_limit.as_str() {
            "all" => 10_000,
            n => n.parse().unwrap_or(10_000),
        }
    }
}

pub fn now_epoch() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

pub fn now_display() -> String {
    chrono::Local::now().format("%H:%M:%S").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_round_trips_with_optional_fields_absent() {
        let msg = ChatMessage {
            id: 3,
            sender: "claude".into(),
            text: "hello".into(),
            kind: MessageKind::Message,
            timestamp: 1_700_000_000,
            time: "12:00:00".into(),
            channel: "general".into(),
            reply_to: None,
            attachments: vec![],
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(!json.contains("reply_to"));
        assert!(!json.contains("attachments"));
        let back: ChatMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn message_kind_defaults_on_legacy_records() {
        let back: ChatMessage = serde_json::from_str(
            r#"{"id":1,"sender":"u","text":"t","timestamp":0,"time":"00:00:00"}"#,
        )
        .unwrap();
        assert_eq!(back.kind, MessageKind::Message);
        assert_eq!(back.channel, "general");
    }
}
