//! Mention parsing and the per-channel loop guard.
//!
//! The router decides which agents to wake for each new message. Agents are
//! addressed with `@name` (case-insensitive, prefix-resolved). Chains of
//! agent-to-agent messages are bounded per channel: every agent-authored
//! message costs one hop, and past the cap the channel pauses until a human
//! speaks or `/continue` resets it.

use std::{
    collections::{HashMap, HashSet, VecDeque},
    time::{Duration, Instant},
};

use parking_lot::Mutex;
use regex::Regex;

use crate::config::DefaultRouting;

/// Window in which a repeated (agent, channel, message) enqueue is dropped.
const DEDUP_WINDOW: Duration = Duration::from_millis(500);
const DEDUP_MAX_ENTRIES: usize = 1024;

/// Outcome of routing one message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteDecision {
    /// Wake these agents (possibly none).
    Deliver(Vec<String>),
    /// The channel's loop guard is engaged; agent triggers are dropped.
    /// `notice` carries the one-time system message text.
    Paused { notice: Option<String> },
}

#[derive(Debug, Default)]
struct ChannelGuard {
    hops: u32,
    paused: bool,
    guard_emitted: bool,
}

pub struct Router {
    agents: Vec<String>,
    default_routing: DefaultRouting,
    mention_re: Regex,
    max_hops: Mutex<u32>,
    guards: Mutex<HashMap<String, ChannelGuard>>,
    dedup: Mutex<DedupWindow>,
}

impl Router {
    pub fn new(agent_names: &[String], default_routing: DefaultRouting, max_hops: u32) -> Self {
        let agents: Vec<String> = agent_names.iter().map(|n| n.to_lowercase()).collect();
        // Tokens are matched broadly and resolved against the configured
        // names afterwards, so prefix forms like `@gemini-cli` work.
        let mention_re = Regex::new(r"@([A-Za-z0-9][A-Za-z0-9_-]*)").expect("static regex");
        Self {
            agents,
            default_routing,
            mention_re,
            max_hops: Mutex::new(max_hops),
            guards: Mutex::new(HashMap::new()),
            dedup: Mutex::new(DedupWindow::new(DEDUP_WINDOW, DEDUP_MAX_ENTRIES)),
        }
    }

    pub fn set_max_hops(&self, max_hops: u32) {
        *self.max_hops.lock() = max_hops;
    }

    pub fn max_hops(&self) -> u32 {
        *self.max_hops.lock()
    }

    pub fn is_agent(&self, sender: &str) -> bool {
        let sender = sender.to_lowercase();
        self.agents.contains(&sender)
    }

    /// Resolve `@` tokens to configured agents. `@all`/`@both` expand to
    /// every agent except the sender; unknown names are ignored.
    pub fn parse_mentions(&self, text: &str, sender: &str) -> Vec<String> {
        let sender = sender.to_lowercase();
        let mut out: Vec<String> = Vec::new();
        let mut seen: HashSet<&str> = HashSet::new();
        for capture in self.mention_re.captures_iter(text) {
            let token = capture[1].to_lowercase();
            if token == "all" || token == "both" {
                for agent in &self.agents {
                    if *agent != sender && seen.insert(agent) {
                        out.push(agent.clone());
                    }
                }
                continue;
            }
            if let Some(agent) = self.resolve(&token) {
                if seen.insert(agent) {
                    out.push(agent.to_string());
                }
            }
        }
        out
    }

    /// Exact match first, then the longest configured name that is a
    /// prefix of the token (`gemini-cli` resolves to `gemini`).
    fn resolve(&self, token: &str) -> Option<&str> {
        if let Some(agent) = self.agents.iter().find(|a| a.as_str() == token) {
            return Some(agent);
        }
        self.agents
            .iter()
            .filter(|a| token.starts_with(a.as_str()))
            .max_by_key(|a| a.len())
            .map(String::as_str)
    }

    /// Decide which agents to wake for a message. Human senders reset the
    /// channel's hop counter; agent senders pay one hop each.
    pub fn route(&self, sender: &str, text: &str, channel: &str) -> RouteDecision {
        let mentions = self.parse_mentions(text, sender);

        if !self.is_agent(sender) {
            let mut guards = self.guards.lock();
            let guard = guards.entry(channel.to_string()).or_default();
            guard.hops = 0;
            guard.paused = false;
            guard.guard_emitted = false;
            drop(guards);

            if mentions.is_empty() {
                return match self.default_routing {
                    DefaultRouting::All => RouteDecision::Deliver(self.agents.clone()),
                    DefaultRouting::None => RouteDecision::Deliver(Vec::new()),
                };
            }
            return RouteDecision::Deliver(mentions);
        }

        // Agent-authored: every message costs one hop, mention or not.
        let max_hops = self.max_hops();
        let mut guards = self.guards.lock();
        let guard = guards.entry(channel.to_string()).or_default();
        if guard.paused {
            return RouteDecision::Paused { notice: None };
        }
        guard.hops += 1;
        if guard.hops > max_hops {
            guard.paused = true;
            let notice = if guard.guard_emitted {
                None
            } else {
                guard.guard_emitted = true;
                Some(format!(
                    "Loop guard paused #{channel} — type /continue to resume"
                ))
            };
            return RouteDecision::Paused { notice };
        }

        let sender = sender.to_lowercase();
        RouteDecision::Deliver(mentions.into_iter().filter(|m| *m != sender).collect())
    }

    /// `/continue`: reset the channel and resume routing.
    pub fn continue_routing(&self, channel: &str) {
        let mut guards = self.guards.lock();
        let guard = guards.entry(channel.to_string()).or_default();
        guard.hops = 0;
        guard.paused = false;
        guard.guard_emitted = false;
    }

    pub fn is_paused(&self, channel: &str) -> bool {
        self.guards
            .lock()
            .get(channel)
            .is_some_and(|guard| guard.paused)
    }

    pub fn hops(&self, channel: &str) -> u32 {
        self.guards.lock().get(channel).map_or(0, |guard| guard.hops)
    }

    /// Channel rename: the guard state follows the channel.
    pub fn rename_channel(&self, old: &str, new: &str) {
        let mut guards = self.guards.lock();
        if let Some(guard) = guards.remove(old) {
            guards.insert(new.to_string(), guard);
        }
    }

    /// True when this (agent, channel, message) was not enqueued within the
    /// dedup window. A repeated call inside the window returns false.
    pub fn should_enqueue(&self, agent: &str, channel: &str, message_id: u64) -> bool {
        let key = format!("{agent}#{channel}#{message_id}");
        self.dedup.lock().insert_if_new(&key, Instant::now())
    }
}

/// TTL-bounded set of recently seen enqueue keys.
#[derive(Debug)]
struct DedupWindow {
    ttl: Duration,
    max_entries: usize,
    seen: HashMap<String, Instant>,
    order: VecDeque<(String, Instant)>,
}

impl DedupWindow {
    fn new(ttl: Duration, max_entries: usize) -> Self {
        Self {
            ttl,
            max_entries,
            seen: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    fn insert_if_new(&mut self, key: &str, now: Instant) -> bool {
        while let Some((old, ts)) = self.order.front() {
            if now.duration_since(*ts) < self.ttl {
                break;
            }
            self.seen.remove(old.as_str());
            self.order.pop_front();
        }
        if self.seen.contains_key(key) {
            return false;
        }
        self.seen.insert(key.to_string(), now);
        self.order.push_back((key.to_string(), now));
        while self.seen.len() > self.max_entries {
            if let Some((old, _)) = self.order.pop_front() {
                self.seen.remove(&old);
            }
        }
        true
    }
}
