//! Last-seen tracking per agent, with online/offline transitions.
//!
//! Any authenticated tool call refreshes `last_seen`. A periodic tick moves
//! agents past the offline threshold to offline; the hub synthesizes the
//! matching `leave` messages. The busy flag is owned by the wrapper's
//! activity watcher and only mirrored here.

use std::collections::HashMap;

use parking_lot::Mutex;
use serde::Serialize;

use crate::types::now_epoch;

/// Seconds of silence before an agent is considered offline.
pub const DEFAULT_OFFLINE_THRESHOLD: u64 = 120;

#[derive(Debug, Clone, Default)]
struct AgentPresence {
    last_seen: u64,
    busy: bool,
    session_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PresenceSnapshot {
    pub online: bool,
    pub busy: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

pub struct PresenceTracker {
    threshold: u64,
    inner: Mutex<HashMap<String, AgentPresence>>,
}

impl PresenceTracker {
    pub fn new(threshold: u64) -> Self {
        Self {
            threshold,
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Refresh `last_seen`. Returns true when this call brought the agent
    /// back online, so the caller can synthesize exactly one `join`.
    pub fn touch(&self, name: &str) -> bool {
        self.touch_at(name, now_epoch())
    }

    pub fn touch_at(&self, name: &str, now: u64) -> bool {
        let mut inner = self.inner.lock();
        let entry = inner.entry(name.to_string()).or_default();
        let was_online = entry.last_seen != 0 && now.saturating_sub(entry.last_seen) < self.threshold;
        entry.last_seen = now;
        !was_online
    }

    pub fn set_busy(&self, name: &str, busy: bool) {
        let mut inner = self.inner.lock();
        inner.entry(name.to_string()).or_default().busy = busy;
    }

    pub fn set_session(&self, name: &str, session_id: Option<String>) {
        let mut inner = self.inner.lock();
        inner.entry(name.to_string()).or_default().session_id = session_id;
    }

    pub fn is_online(&self, name: &str) -> bool {
        self.is_online_at(name, now_epoch())
    }

    pub fn is_online_at(&self, name: &str, now: u64) -> bool {
        self.inner
            .lock()
            .get(name)
            .is_some_and(|p| p.last_seen != 0 && now.saturating_sub(p.last_seen) < self.threshold)
    }

    pub fn is_busy(&self, name: &str) -> bool {
        self.inner.lock().get(name).is_some_and(|p| p.busy)
    }

    /// Graceful shutdown: drop straight to offline so the next tool call
    /// synthesizes a fresh join.
    pub fn mark_offline(&self, name: &str) {
        let mut inner = self.inner.lock();
        if let Some(presence) = inner.get_mut(name) {
            presence.last_seen = 0;
            presence.busy = false;
        }
    }

    /// Agents whose `last_seen` just crossed the threshold. Each name is
    /// reported once; busy is cleared on the way out.
    pub fn expire(&self) -> Vec<String> {
        self.expire_at(now_epoch())
    }

    pub fn expire_at(&self, now: u64) -> Vec<String> {
        let mut inner = self.inner.lock();
        let mut expired = Vec::new();
        for (name, presence) in inner.iter_mut() {
            if presence.last_seen != 0 && now.saturating_sub(presence.last_seen) >= self.threshold {
                presence.last_seen = 0;
                presence.busy = false;
                expired.push(name.clone());
            }
        }
        expired.sort();
        expired
    }

    pub fn snapshot(&self) -> HashMap<String, PresenceSnapshot> {
        self.snapshot_at(now_epoch())
    }

    pub fn snapshot_at(&self, now: u64) -> HashMap<String, PresenceSnapshot> {
        self.inner
            .lock()
            .iter()
            .map(|(name, p)| {
                (
                    name.clone(),
                    PresenceSnapshot {
                        online: p.last_seen != 0 && now.saturating_sub(p.last_seen) < self.threshold,
                        busy: p.busy,
                        session_id: p.session_id.clone(),
                    },
                )
            })
            .collect()
    }
}

impl Default for PresenceTracker {
    fn default() -> Self {
        Self::new(DEFAULT_OFFLINE_THRESHOLD)
    }
}
