//! Durable, ordered persistence for messages, channels, pins, decisions,
//! and room settings, with synchronous change notification.
//!
//! Everything lives in one append-only JSONL log. Each record carries a
//! `kind` tag so replay can dispatch; destructive operations (delete,
//! clear, channel delete) are themselves appended records, never in-place
//! rewrites. Replay at startup rebuilds the in-memory indexes; malformed
//! lines are skipped and logged.

use std::{
    collections::{BTreeMap, HashSet},
    fs::OpenOptions,
    io::Write,
    path::{Path, PathBuf},
};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::{
    error::{ChatError, Result},
    types::{
        now_display, now_epoch, ChatMessage, Decision, DecisionStatus, NewMessage, PinStatus,
        RoomSettings, DECISION_CAP, DECISION_TEXT_MAX,
    },
    DEFAULT_CHANNEL, MAX_CHANNELS,
};

pub const LOG_FILE: &str = "chat_log";

/// One line of the log.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum LogRecord {
    Msg(ChatMessage),
    Delete {
        ids: Vec<u64>,
    },
    Channel {
        op: ChannelOp,
        name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        new_name: Option<String>,
    },
    Decision {
        op: DecisionOp,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        decision: Option<Decision>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<u64>,
    },
    Pin {
        id: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        status: Option<PinStatus>,
    },
    Settings(RoomSettings),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
enum ChannelOp {
    Create,
    Rename,
    Delete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
enum DecisionOp {
    /// Carries the full current state of the decision.
    Upsert,
    Delete,
}

/// Change notification fired synchronously after a durable write.
#[derive(Debug, Clone)]
pub enum StoreEvent {
    Message(ChatMessage),
    Deleted(Vec<u64>),
    Cleared { channel: Option<String> },
    Todo { id: u64, status: Option<PinStatus> },
    Decision { action: &'static str, decision: Decision },
    Channels(Vec<String>),
    ChannelRenamed { old: String, new: String },
    Settings(RoomSettings),
}

type Observer = std::sync::Arc<dyn Fn(&StoreEvent) + Send + Sync>;

#[derive(Default)]
struct Inner {
    messages: Vec<ChatMessage>,
    next_id: u64,
    channels: Vec<String>,
    pins: BTreeMap<u64, PinStatus>,
    decisions: Vec<Decision>,
    next_decision_id: u64,
    settings: RoomSettings,
    settings_persisted: bool,
}

pub struct Store {
    path: PathBuf,
    inner: Mutex<Inner>,
    observers: Mutex<Vec<Observer>>,
}

impl Store {
    /// Open the log at `dir/chat_log`, replaying it to rebuild state.
    pub fn open(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(LOG_FILE);
        let mut inner = Inner {
            channels: vec![DEFAULT_CHANNEL.to_string()],
            ..Default::default()
        };

        if path.exists() {
            let raw = std::fs::read_to_string(&path)?;
            let mut skipped = 0usize;
            for line in raw.lines() {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                match serde_json::from_str::<LogRecord>(line) {
                    Ok(record) => inner.apply(record),
                    Err(_) => skipped += 1,
                }
            }
            if skipped > 0 {
                tracing::warn!(
                    target = "chattr::store",
                    skipped,
                    path = %path.display(),
                    "skipped malformed log lines during replay"
                );
            }
        }

        Ok(Self {
            path,
            inner: Mutex::new(inner),
            observers: Mutex::new(Vec::new()),
        })
    }

    pub fn on_event(&self, observer: impl Fn(&StoreEvent) + Send + Sync + 'static) {
        self.observers.lock().push(std::sync::Arc::new(observer));
    }

    fn fire(&self, event: StoreEvent) {
        // Observers run outside every store lock so they can call back in
        // (the router observer appends system messages).
        let observers: Vec<Observer> = self.observers.lock().clone();
        for observer in &observers {
            observer(&event);
        }
    }

    fn persist(&self, record: &LogRecord) -> Result<()> {
        let mut line = serde_json::to_string(record)
            .map_err(|e| ChatError::Validation(format!("unserializable record: {e}")))?;
        line.push('\n');
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(line.as_bytes())?;
        file.sync_data()?;
        Ok(())
    }

    // --- messages ---

    /// Assign the next id, write the record, return the stored message.
    /// Nothing is mutated (and no event fires) unless the write succeeds.
    pub fn append(&self, new: NewMessage) -> Result<ChatMessage> {
        let msg = {
            let mut inner = self.inner.lock();
            if !inner.channels.iter().any(|c| c == &new.channel) {
                return Err(ChatError::validation(format!(
                    "unknown channel '{}'",
                    new.channel
                )));
            }
            if let Some(parent) = new.reply_to {
                if parent >= inner.next_id {
                    return Err(ChatError::validation(format!(
                        "reply_to references unknown message {parent}"
                    )));
                }
            }
            let msg = ChatMessage {
                id: inner.next_id,
                sender: new.sender,
                text: new.text,
                kind: new.kind,
                timestamp: now_epoch(),
                time: now_display(),
                channel: new.channel,
                reply_to: new.reply_to,
                attachments: new.attachments,
            };
            self.persist(&LogRecord::Msg(msg.clone()))?;
            inner.next_id += 1;
            inner.messages.push(msg.clone());
            msg
        };
        self.fire(StoreEvent::Message(msg.clone()));
        Ok(msg)
    }

    /// Delete messages by id. Returns the ids actually removed. Pins on
    /// deleted messages are removed along with them.
    pub fn delete(&self, ids: &[u64]) -> Result<Vec<u64>> {
        let deleted = {
            let mut inner = self.inner.lock();
            let wanted: HashSet<u64> = ids.iter().copied().collect();
            let deleted: Vec<u64> = inner
                .messages
                .iter()
                .filter(|m| wanted.contains(&m.id))
                .map(|m| m.id)
                .collect();
            if deleted.is_empty() {
                return Ok(deleted);
            }
            self.persist(&LogRecord::Delete {
                ids: deleted.clone(),
            })?;
            inner.remove_messages(&deleted);
            deleted
        };
        self.fire(StoreEvent::Deleted(deleted.clone()));
        Ok(deleted)
    }

    /// Wipe a channel (or everything). Emits a single `Cleared` event.
    pub fn clear(&self, channel: Option<&str>) -> Result<Vec<u64>> {
        let cleared = {
            let mut inner = self.inner.lock();
            let cleared: Vec<u64> = inner
                .messages
                .iter()
                .filter(|m| channel.is_none_or(|c| m.channel == c))
                .map(|m| m.id)
                .collect();
            if !cleared.is_empty() {
                self.persist(&LogRecord::Delete {
                    ids: cleared.clone(),
                })?;
                inner.remove_messages(&cleared);
            }
            cleared
        };
        self.fire(StoreEvent::Cleared {
            channel: channel.map(String::from),
        });
        Ok(cleared)
    }

    pub fn get(&self, id: u64) -> Option<ChatMessage> {
        self.inner
            .lock()
            .messages
            .iter()
            .find(|m| m.id == id)
            .cloned()
    }

    /// Last N visible messages, newest last. `channel = None` crosses
    /// channels in strict id order.
    pub fn recent(&self, channel: Option<&str>, limit: usize) -> Vec<ChatMessage> {
        let inner = self.inner.lock();
        let matching: Vec<&ChatMessage> = inner
            .messages
            .iter()
            .filter(|m| channel.is_none_or(|c| m.channel == c))
            .collect();
        let skip = matching.len().saturating_sub(limit);
        matching[skip..].iter().map(|m| (*m).clone()).collect()
    }

    /// All visible messages with id > cursor.
    pub fn since(&self, cursor: u64, channel: Option<&str>) -> Vec<ChatMessage> {
        self.inner
            .lock()
            .messages
            .iter()
            .filter(|m| m.id > cursor && channel.is_none_or(|c| m.channel == c))
            .cloned()
            .collect()
    }

    pub fn last_id(&self) -> Option<u64> {
        self.inner.lock().messages.last().map(|m| m.id)
    }

    // --- channels ---

    pub fn channels(&self) -> Vec<String> {
        self.inner.lock().channels.clone()
    }

    pub fn has_channel(&self, name: &str) -> bool {
        self.inner.lock().channels.iter().any(|c| c == name)
    }

    pub fn create_channel(&self, name: &str) -> Result<()> {
        let channels = {
            let mut inner = self.inner.lock();
            if !crate::is_valid_channel_name(name) {
                return Err(ChatError::validation(format!("bad channel name '{name}'")));
            }
            if inner.channels.iter().any(|c| c == name) {
                return Err(ChatError::validation(format!(
                    "channel '{name}' already exists"
                )));
            }
            if inner.channels.len() >= MAX_CHANNELS {
                return Err(ChatError::ResourceExhausted(format!(
                    "channel cap of {MAX_CHANNELS} reached"
                )));
            }
            self.persist(&LogRecord::Channel {
                op: ChannelOp::Create,
                name: name.to_string(),
                new_name: None,
            })?;
            inner.channels.push(name.to_string());
            inner.channels.clone()
        };
        self.fire(StoreEvent::Channels(channels));
        Ok(())
    }

    /// Atomic rename: the channel list and every stored message migrate
    /// together. `general` is immutable.
    pub fn rename_channel(&self, old: &str, new: &str) -> Result<()> {
        let channels = {
            let mut inner = self.inner.lock();
            if old == DEFAULT_CHANNEL {
                return Err(ChatError::validation("cannot rename the default channel"));
            }
            if !crate::is_valid_channel_name(new) {
                return Err(ChatError::validation(format!("bad channel name '{new}'")));
            }
            if !inner.channels.iter().any(|c| c == old) {
                return Err(ChatError::validation(format!("unknown channel '{old}'")));
            }
            if inner.channels.iter().any(|c| c == new) {
                return Err(ChatError::validation(format!(
                    "channel '{new}' already exists"
                )));
            }
            self.persist(&LogRecord::Channel {
                op: ChannelOp::Rename,
                name: old.to_string(),
                new_name: Some(new.to_string()),
            })?;
            inner.rename_channel(old, new);
            inner.channels.clone()
        };
        self.fire(StoreEvent::ChannelRenamed {
            old: old.to_string(),
            new: new.to_string(),
        });
        self.fire(StoreEvent::Channels(channels));
        Ok(())
    }

    /// Delete a non-default channel. Its messages (and their pins) are
    /// purged. Returns the purged message ids.
    pub fn delete_channel(&self, name: &str) -> Result<Vec<u64>> {
        let (purged, channels) = {
            let mut inner = self.inner.lock();
            if name == DEFAULT_CHANNEL {
                return Err(ChatError::validation("cannot delete the default channel"));
            }
            if !inner.channels.iter().any(|c| c == name) {
                return Err(ChatError::validation(format!("unknown channel '{name}'")));
            }
            self.persist(&LogRecord::Channel {
                op: ChannelOp::Delete,
                name: name.to_string(),
                new_name: None,
            })?;
            let purged = inner.delete_channel(name);
            (purged, inner.channels.clone())
        };
        if !purged.is_empty() {
            self.fire(StoreEvent::Deleted(purged.clone()));
        }
        self.fire(StoreEvent::Channels(channels));
        Ok(purged)
    }

    // --- pins ---

    pub fn pins(&self) -> BTreeMap<u64, PinStatus> {
        self.inner.lock().pins.clone()
    }

    pub fn pin_status(&self, id: u64) -> Option<PinStatus> {
        self.inner.lock().pins.get(&id).copied()
    }

    /// Set or clear a pin. Setting requires the message to exist; clearing
    /// an absent pin is a no-op returning false.
    pub fn set_pin(&self, id: u64, status: Option<PinStatus>) -> Result<bool> {
        {
            let mut inner = self.inner.lock();
            match status {
                Some(_) => {
                    if !inner.messages.iter().any(|m| m.id == id) {
                        return Err(ChatError::validation(format!("no message {id} to pin")));
                    }
                }
                None => {
                    if !inner.pins.contains_key(&id) {
                        return Ok(false);
                    }
                }
            }
            self.persist(&LogRecord::Pin { id, status })?;
            match status {
                Some(s) => {
                    inner.pins.insert(id, s);
                }
                None => {
                    inner.pins.remove(&id);
                }
            }
        }
        self.fire(StoreEvent::Todo { id, status });
        Ok(true)
    }

    // --- decisions ---

    pub fn decisions(&self) -> Vec<Decision> {
        self.inner.lock().decisions.clone()
    }

    /// Propose a new decision. At the cap the oldest still-proposed entry
    /// is evicted; if every slot is approved the proposal is refused.
    pub fn propose_decision(
        &self,
        text: &str,
        owner: &str,
        reason: Option<&str>,
    ) -> Result<Decision> {
        let text = text.trim();
        if text.is_empty() {
            return Err(ChatError::validation("empty decision text"));
        }
        if text.chars().count() > DECISION_TEXT_MAX {
            return Err(ChatError::validation(format!(
                "decision text exceeds {DECISION_TEXT_MAX} chars"
            )));
        }
        let reason = reason.map(str::trim).filter(|r| !r.is_empty());
        if let Some(reason) = reason {
            if reason.chars().count() > DECISION_TEXT_MAX {
                return Err(ChatError::validation(format!(
                    "decision reason exceeds {DECISION_TEXT_MAX} chars"
                )));
            }
        }

        let (evicted, decision) = {
            let mut inner = self.inner.lock();
            let mut evicted = None;
            if inner.decisions.len() >= DECISION_CAP {
                let victim = inner
                    .decisions
                    .iter()
                    .find(|d| d.status == DecisionStatus::Proposed)
                    .map(|d| d.id);
                match victim {
                    Some(id) => {
                        self.persist(&LogRecord::Decision {
                            op: DecisionOp::Delete,
                            decision: None,
                            id: Some(id),
                        })?;
                        let pos = inner.decisions.iter().position(|d| d.id == id).unwrap();
                        evicted = Some(inner.decisions.remove(pos));
                    }
                    None => {
                        return Err(ChatError::ResourceExhausted(format!(
                            "all {DECISION_CAP} decision slots are approved"
                        )));
                    }
                }
            }
            let decision = Decision {
                id: inner.next_decision_id,
                owner: owner.to_string(),
                decision: text.to_string(),
                reason: reason.map(String::from),
                status: DecisionStatus::Proposed,
            };
            self.persist(&LogRecord::Decision {
                op: DecisionOp::Upsert,
                decision: Some(decision.clone()),
                id: None,
            })?;
            inner.next_decision_id += 1;
            inner.decisions.push(decision.clone());
            (evicted, decision)
        };
        if let Some(evicted) = evicted {
            self.fire(StoreEvent::Decision {
                action: "delete",
                decision: evicted,
            });
        }
        self.fire(StoreEvent::Decision {
            action: "propose",
            decision: decision.clone(),
        });
        Ok(decision)
    }

    pub fn set_decision_status(&self, id: u64, status: DecisionStatus) -> Result<Decision> {
        let (action, decision) = {
            let mut inner = self.inner.lock();
            let pos = inner
                .decisions
                .iter()
                .position(|d| d.id == id)
                .ok_or_else(|| ChatError::validation(format!("no decision {id}")))?;
            let mut updated = inner.decisions[pos].clone();
            updated.status = status;
            self.persist(&LogRecord::Decision {
                op: DecisionOp::Upsert,
                decision: Some(updated.clone()),
                id: None,
            })?;
            inner.decisions[pos] = updated.clone();
            let action = match status {
                DecisionStatus::Approved => "approve",
                DecisionStatus::Proposed => "unapprove",
            };
            (action, updated)
        };
        self.fire(StoreEvent::Decision { action, decision: decision.clone() });
        Ok(decision)
    }

    pub fn edit_decision(
        &self,
        id: u64,
        text: Option<&str>,
        reason: Option<&str>,
    ) -> Result<Decision> {
        let decision = {
            let mut inner = self.inner.lock();
            let pos = inner
                .decisions
                .iter()
                .position(|d| d.id == id)
                .ok_or_else(|| ChatError::validation(format!("no decision {id}")))?;
            let mut updated = inner.decisions[pos].clone();
            if let Some(text) = text {
                let text = text.trim();
                if text.is_empty() || text.chars().count() > DECISION_TEXT_MAX {
                    return Err(ChatError::validation(format!(
                        "decision text must be 1..={DECISION_TEXT_MAX} chars"
                    )));
                }
                updated.decision = text.to_string();
            }
            if let Some(reason) = reason {
                let reason = reason.trim();
                if reason.chars().count() > DECISION_TEXT_MAX {
                    return Err(ChatError::validation(format!(
                        "decision reason exceeds {DECISION_TEXT_MAX} chars"
                    )));
                }
                updated.reason = (!reason.is_empty()).then(|| reason.to_string());
            }
            self.persist(&LogRecord::Decision {
                op: DecisionOp::Upsert,
                decision: Some(updated.clone()),
                id: None,
            })?;
            inner.decisions[pos] = updated.clone();
            updated
        };
        self.fire(StoreEvent::Decision {
            action: "edit",
            decision: decision.clone(),
        });
        Ok(decision)
    }

    pub fn delete_decision(&self, id: u64) -> Result<Decision> {
        let decision = {
            let mut inner = self.inner.lock();
            let pos = inner
                .decisions
                .iter()
                .position(|d| d.id == id)
                .ok_or_else(|| ChatError::validation(format!("no decision {id}")))?;
            self.persist(&LogRecord::Decision {
                op: DecisionOp::Delete,
                decision: None,
                id: Some(id),
            })?;
            inner.decisions.remove(pos)
        };
        self.fire(StoreEvent::Decision {
            action: "delete",
            decision: decision.clone(),
        });
        Ok(decision)
    }

    // --- settings ---

    pub fn settings(&self) -> RoomSettings {
        self.inner.lock().settings.clone()
    }

    /// False until the first settings record is written or replayed, so
    /// the hub knows to seed settings from config on first boot.
    pub fn settings_persisted(&self) -> bool {
        self.inner.lock().settings_persisted
    }

    pub fn update_settings(&self, settings: RoomSettings) -> Result<()> {
        {
            let mut inner = self.inner.lock();
            self.persist(&LogRecord::Settings(settings.clone()))?;
            inner.settings = settings.clone();
            inner.settings_persisted = true;
        }
        self.fire(StoreEvent::Settings(settings));
        Ok(())
    }
}

impl Inner {
    fn apply(&mut self, record: LogRecord) {
        match record {
            LogRecord::Msg(msg) => {
                if msg.id >= self.next_id {
                    self.next_id = msg.id + 1;
                }
                // A message may reference a channel created in the same
                // replay; channel records precede their first message.
                self.messages.push(msg);
            }
            LogRecord::Delete { ids } => self.remove_messages(&ids),
            LogRecord::Channel { op, name, new_name } => match op {
                ChannelOp::Create => {
                    if !self.channels.iter().any(|c| c == &name) {
                        self.channels.push(name);
                    }
                }
                ChannelOp::Rename => {
                    if let Some(new_name) = new_name {
                        self.rename_channel(&name, &new_name);
                    }
                }
                ChannelOp::Delete => {
                    self.delete_channel(&name);
                }
            },
            LogRecord::Decision { op, decision, id } => match op {
                DecisionOp::Upsert => {
                    if let Some(decision) = decision {
                        if decision.id >= self.next_decision_id {
                            self.next_decision_id = decision.id + 1;
                        }
                        match self.decisions.iter().position(|d| d.id == decision.id) {
                            Some(pos) => self.decisions[pos] = decision,
                            None => self.decisions.push(decision),
                        }
                    }
                }
                DecisionOp::Delete => {
                    if let Some(id) = id {
                        self.decisions.retain(|d| d.id != id);
                    }
                }
            },
            LogRecord::Pin { id, status } => match status {
                Some(status) => {
                    self.pins.insert(id, status);
                }
                None => {
                    self.pins.remove(&id);
                }
            },
            LogRecord::Settings(settings) => {
                self.settings = settings;
                self.settings_persisted = true;
            }
        }
    }

    fn remove_messages(&mut self, ids: &[u64]) {
        let wanted: HashSet<u64> = ids.iter().copied().collect();
        self.messages.retain(|m| !wanted.contains(&m.id));
        for id in &wanted {
            self.pins.remove(id);
        }
    }

    fn rename_channel(&mut self, old: &str, new: &str) {
        if let Some(slot) = self.channels.iter_mut().find(|c| c.as_str() == old) {
            *slot = new.to_string();
        }
        for msg in &mut self.messages {
            if msg.channel == old {
                msg.channel = new.to_string();
            }
        }
    }

    fn delete_channel(&mut self, name: &str) -> Vec<u64> {
        self.channels.retain(|c| c != name);
        let purged: Vec<u64> = self
            .messages
            .iter()
            .filter(|m| m.channel == name)
            .map(|m| m.id)
            .collect();
        self.remove_messages(&purged);
        purged
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    use super::*;

    fn open_store(dir: &Path) -> Store {
        Store::open(dir).unwrap()
    }

    fn post(store: &Store, sender: &str, text: &str) -> ChatMessage {
        store.append(NewMessage::new(sender, text)).unwrap()
    }

    #[test]
    fn ids_are_dense_and_monotonic() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());
        for i in 0..5 {
            assert_eq!(post(&store, "user", "hi").id, i);
        }
        store.delete(&[2, 3]).unwrap();
        // Ids are never reused after deletion.
        assert_eq!(post(&store, "user", "again").id, 5);
    }

    #[test]
    fn replay_restores_full_state() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = open_store(dir.path());
            store.create_channel("dev").unwrap();
            post(&store, "user", "one");
            store
                .append(NewMessage::new("claude", "two").in_channel("dev"))
                .unwrap();
            store.set_pin(0, Some(PinStatus::Todo)).unwrap();
            store.propose_decision("use axum", "user", Some("already in tree")).unwrap();
            let mut settings = store.settings();
            settings.max_agent_hops = 7;
            store.update_settings(settings).unwrap();
            store.delete(&[0]).unwrap();
        }
        let store = open_store(dir.path());
        assert_eq!(store.channels(), vec!["general", "dev"]);
        let msgs = store.recent(None, 50);
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].id, 1);
        assert_eq!(msgs[0].channel, "dev");
        // Pin on the deleted message is gone.
        assert!(store.pins().is_empty());
        assert_eq!(store.decisions().len(), 1);
        assert_eq!(store.settings().max_agent_hops, 7);
        // Next id continues past the deleted one.
        assert_eq!(post(&store, "user", "next").id, 2);
    }

    #[test]
    fn malformed_lines_are_skipped_on_replay() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = open_store(dir.path());
            post(&store, "user", "keep me");
        }
        let log = dir.path().join(LOG_FILE);
        let mut raw = std::fs::read_to_string(&log).unwrap();
        raw.push_str("{not json\n\n{\"kind\":\"unknown_kind\"}\n");
        std::fs::write(&log, raw).unwrap();

        let store = open_store(dir.path());
        assert_eq!(store.recent(None, 10).len(), 1);
    }

    #[test]
    fn cursor_reads_skip_deleted() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());
        for _ in 0..4 {
            post(&store, "user", "m");
        }
        store.delete(&[1, 2]).unwrap();
        let seen: Vec<u64> = store.since(0, None).iter().map(|m| m.id).collect();
        assert_eq!(seen, vec![3]);
    }

    #[test]
    fn rename_round_trip_leaves_channels_identical() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());
        store.create_channel("x").unwrap();
        store
            .append(NewMessage::new("user", "hello").in_channel("x"))
            .unwrap();
        let before = store.recent(None, 10);

        store.rename_channel("x", "y").unwrap();
        assert_eq!(store.recent(Some("y"), 10).len(), 1);
        store.rename_channel("y", "x").unwrap();

        assert_eq!(store.recent(None, 10), before);
        assert_eq!(store.channels(), vec!["general", "x"]);
    }

    #[test]
    fn general_is_protected() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());
        assert!(store.rename_channel("general", "misc").is_err());
        assert!(store.delete_channel("general").is_err());
    }

    #[test]
    fn channel_cap_is_enforced() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());
        for i in 0..(MAX_CHANNELS - 1) {
            store.create_channel(&format!("ch-{i}")).unwrap();
        }
        let err = store.create_channel("one-more").unwrap_err();
        assert!(matches!(err, ChatError::ResourceExhausted(_)));
    }

    #[test]
    fn deleting_channel_purges_messages_and_pins() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());
        store.create_channel("scratch").unwrap();
        let msg = store
            .append(NewMessage::new("user", "bye").in_channel("scratch"))
            .unwrap();
        store.set_pin(msg.id, Some(PinStatus::Todo)).unwrap();

        let purged = store.delete_channel("scratch").unwrap();
        assert_eq!(purged, vec![msg.id]);
        assert!(store.pins().is_empty());
        assert!(!store.has_channel("scratch"));
    }

    #[test]
    fn pin_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());
        for _ in 0..8 {
            post(&store, "user", "m");
        }
        store.set_pin(7, Some(PinStatus::Todo)).unwrap();
        assert_eq!(store.pins().get(&7), Some(&PinStatus::Todo));
        store.set_pin(7, Some(PinStatus::Done)).unwrap();
        assert_eq!(store.pins().get(&7), Some(&PinStatus::Done));
        store.set_pin(7, None).unwrap();
        assert!(store.pins().is_empty());
        // Re-pin, then delete the message: pin goes with it.
        store.set_pin(7, Some(PinStatus::Todo)).unwrap();
        store.delete(&[7]).unwrap();
        assert!(store.pins().is_empty());
    }

    #[test]
    fn pinning_missing_message_is_validation_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());
        assert!(store.set_pin(99, Some(PinStatus::Todo)).is_err());
        assert!(!store.set_pin(99, None).unwrap());
    }

    #[test]
    fn decision_text_boundary() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());
        let exactly_80 = "x".repeat(80);
        assert!(store.propose_decision(&exactly_80, "user", None).is_ok());
        let too_long = "x".repeat(81);
        assert!(store.propose_decision(&too_long, "user", None).is_err());
    }

    #[test]
    fn decision_cap_evicts_oldest_proposed() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());
        for i in 0..DECISION_CAP {
            store
                .propose_decision(&format!("d{i}"), "user", None)
                .unwrap();
        }
        // Approve the oldest so it cannot be evicted.
        store
            .set_decision_status(0, DecisionStatus::Approved)
            .unwrap();

        let added = store.propose_decision("newcomer", "user", None).unwrap();
        let decisions = store.decisions();
        assert_eq!(decisions.len(), DECISION_CAP);
        // d0 survived (approved), d1 was evicted.
        assert!(decisions.iter().any(|d| d.id == 0));
        assert!(!decisions.iter().any(|d| d.id == 1));
        assert!(decisions.iter().any(|d| d.id == added.id));
    }

    #[test]
    fn decision_cap_refuses_when_all_approved() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());
        for i in 0..DECISION_CAP {
            let d = store
                .propose_decision(&format!("d{i}"), "user", None)
                .unwrap();
            store
                .set_decision_status(d.id, DecisionStatus::Approved)
                .unwrap();
        }
        let err = store.propose_decision("overflow", "user", None).unwrap_err();
        assert!(matches!(err, ChatError::ResourceExhausted(_)));
    }

    #[test]
    fn observers_fire_after_durable_write() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());
        let seen = Arc::new(AtomicUsize::new(0));
        let seen_clone = seen.clone();
        store.on_event(move |event| {
            if matches!(event, StoreEvent::Message(_)) {
                seen_clone.fetch_add(1, Ordering::SeqCst);
            }
        });
        post(&store, "user", "one");
        post(&store, "user", "two");
        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn reply_to_unknown_message_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());
        post(&store, "user", "parent");
        let mut reply = NewMessage::new("claude", "child");
        reply.reply_to = Some(0);
        assert!(store.append(reply).is_ok());
        let mut bad = NewMessage::new("claude", "dangling");
        bad.reply_to = Some(99);
        assert!(store.append(bad).is_err());
    }

    #[test]
    fn clear_channel_only_touches_that_channel() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());
        store.create_channel("dev").unwrap();
        post(&store, "user", "keep");
        store
            .append(NewMessage::new("user", "wipe").in_channel("dev"))
            .unwrap();
        store.clear(Some("dev")).unwrap();
        assert_eq!(store.recent(None, 10).len(), 1);
        assert_eq!(store.recent(Some("dev"), 10).len(), 0);
    }
}
