//! Shared hub state: the store wired to the router, presence, per-agent
//! trigger queues, and the WebSocket broadcast channels.
//!
//! Initialization order is config → store → auth → router → hub; the
//! singletons are explicit `Arc`s handed to the axum handlers and the MCP
//! bridge rather than globals. Store observers run synchronously after
//! each durable write, so every subscriber sees events in stored-id order.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use anyhow::Result;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::broadcast;

use chattr_core::{
    config::Config,
    presence::PresenceTracker,
    queue::TriggerQueueWriter,
    router::{RouteDecision, Router},
    store::{Store, StoreEvent},
    types::{MessageKind, NewMessage},
    ChatError,
};

/// Capacity of the essential event channel. A client that falls this far
/// behind is closed rather than allowed to miss a message.
const ESSENTIAL_CAPACITY: usize = 1024;
/// Typing/status events are disposable; lagging clients just skip them.
const EPHEMERAL_CAPACITY: usize = 64;

/// Name used by synthesized hub messages. Never routes.
pub const SYSTEM_SENDER: &str = "system";

pub const SERVER_STARTED_AT_FILE: &str = "server_started_at";

pub struct Hub {
    pub config: Config,
    pub data_dir: PathBuf,
    pub token: String,
    pub store: Arc<Store>,
    pub router: Arc<Router>,
    pub presence: Arc<PresenceTracker>,
    pub cursors: Arc<CursorMap>,
    pub hats: Arc<HatStore>,
    pub essential_tx: broadcast::Sender<String>,
    pub ephemeral_tx: broadcast::Sender<String>,
}

impl Hub {
    pub fn new(config: Config, data_dir: &Path, token: String) -> Result<Arc<Self>> {
        let store = Arc::new(Store::open(data_dir)?);

        // Persisted room settings win over config once they exist.
        if !store.settings_persisted() {
            let mut settings = store.settings();
            settings.max_agent_hops = config.routing.max_agent_hops;
            store.update_settings(settings)?;
        }
        let max_hops = store.settings().max_agent_hops;

        let router = Arc::new(Router::new(
            &config.agent_names(),
            config.routing.default,
            max_hops,
        ));
        let presence = Arc::new(PresenceTracker::default());
        let cursors = Arc::new(CursorMap::load(data_dir));
        let hats = Arc::new(HatStore::load(data_dir));

        let (essential_tx, _) = broadcast::channel(ESSENTIAL_CAPACITY);
        let (ephemeral_tx, _) = broadcast::channel(EPHEMERAL_CAPACITY);

        let queues: HashMap<String, TriggerQueueWriter> = config
            .agent_names()
            .into_iter()
            .map(|name| (name.clone(), TriggerQueueWriter::new(data_dir, &name)))
            .collect();

        let hub = Arc::new(Self {
            config,
            data_dir: data_dir.to_path_buf(),
            token,
            store: store.clone(),
            router,
            presence,
            cursors,
            hats,
            essential_tx,
            ephemeral_tx,
        });

        let bridge = hub.clone();
        store.on_event(move |event| bridge.on_store_event(event, &queues));

        Ok(hub)
    }

    // --- store event bridge ---

    fn on_store_event(&self, event: &StoreEvent, queues: &HashMap<String, TriggerQueueWriter>) {
        match event {
            StoreEvent::Message(msg) => {
                self.send_essential(json!({ "type": "message", "data": msg }));
                self.route_message(msg, queues);
            }
            StoreEvent::Deleted(ids) => {
                self.send_essential(json!({ "type": "delete", "ids": ids }));
            }
            StoreEvent::Cleared { channel } => {
                let mut frame = json!({ "type": "clear" });
                if let Some(channel) = channel {
                    frame["channel"] = json!(channel);
                }
                self.send_essential(frame);
            }
            StoreEvent::Todo { id, status } => {
                self.send_essential(json!({
                    "type": "todo_update",
                    "data": { "id": id, "status": status },
                }));
            }
            StoreEvent::Decision { action, decision } => {
                self.send_essential(json!({
                    "type": "decision",
                    "action": action,
                    "data": decision,
                }));
            }
            StoreEvent::Channels(_) | StoreEvent::Settings(_) => {
                self.send_essential(self.settings_frame());
            }
            StoreEvent::ChannelRenamed { old, new } => {
                self.send_essential(json!({
                    "type": "channel_renamed",
                    "old_name": old,
                    "new_name": new,
                }));
            }
        }
    }

    /// Mention routing for a freshly stored message. System and synthetic
    /// messages never route, which also bounds the recursion from the
    /// notices appended below.
    fn route_message(&self, msg: &chattr_core::types::ChatMessage, queues: &HashMap<String, TriggerQueueWriter>) {
        if msg.kind != MessageKind::Message || msg.sender == SYSTEM_SENDER {
            return;
        }

        match self.router.route(&msg.sender, &msg.text, &msg.channel) {
            RouteDecision::Deliver(targets) => {
                for target in targets {
                    let Some(queue) = queues.get(&target) else {
                        continue;
                    };
                    if !self.router.should_enqueue(&target, &msg.channel, msg.id) {
                        continue;
                    }
                    if !self.presence.is_online(&target) {
                        let _ = self.post_system(
                            &msg.channel,
                            &format!("{target} appears offline — message queued."),
                        );
                    }
                    if let Err(error) = queue.push(&msg.channel, Some(msg.id)) {
                        tracing::warn!(
                            target = "chattr::hub",
                            agent = %target,
                            error = %error,
                            "failed to enqueue trigger"
                        );
                    } else {
                        tracing::info!(
                            target = "chattr::hub",
                            agent = %target,
                            channel = %msg.channel,
                            message_id = msg.id,
                            "queued trigger"
                        );
                    }
                }
            }
            RouteDecision::Paused { notice } => {
                if let Some(notice) = notice {
                    let _ = self.post_system(&msg.channel, &notice);
                    self.broadcast_status();
                }
            }
        }
    }

    // --- broadcast helpers ---

    fn send_essential(&self, frame: Value) {
        // No receivers (no browser open) is fine.
        let _ = self.essential_tx.send(frame.to_string());
    }

    pub fn send_ephemeral(&self, frame: Value) {
        let _ = self.ephemeral_tx.send(frame.to_string());
    }

    pub fn broadcast_status(&self) {
        self.send_ephemeral(self.status_frame());
    }

    pub fn broadcast_typing(&self, agent: &str, active: bool) {
        self.send_ephemeral(json!({ "type": "typing", "agent": agent, "active": active }));
    }

    pub fn broadcast_hats(&self) {
        self.send_essential(json!({ "type": "hats", "data": self.hats.snapshot() }));
    }

    // --- frames ---

    pub fn status_frame(&self) -> Value {
        let snapshot = self.presence.snapshot();
        let mut data = serde_json::Map::new();
        for (name, def) in &self.config.agents {
            let presence = snapshot.get(name);
            data.insert(
                name.clone(),
                json!({
                    "available": presence.is_some_and(|p| p.online),
                    "busy": presence.is_some_and(|p| p.busy),
                    "label": def.label_or(name),
                    "color": def.color,
                }),
            );
        }
        let paused = self
            .store
            .channels()
            .iter()
            .any(|channel| self.router.is_paused(channel));
        data.insert("paused".to_string(), json!(paused));
        json!({ "type": "status", "data": data })
    }

    pub fn settings_frame(&self) -> Value {
        let settings = self.store.settings();
        json!({
            "type": "settings",
            "data": {
                "title": settings.title,
                "username": settings.username,
                "max_agent_hops": settings.max_agent_hops,
                "history_limit": settings.history_limit,
                "channels": self.store.channels(),
            },
        })
    }

    pub fn agents_frame(&self) -> Value {
        let data: serde_json::Map<String, Value> = self
            .config
            .agents
            .iter()
            .map(|(name, def)| {
                (
                    name.clone(),
                    json!({ "color": def.color, "label": def.label_or(name) }),
                )
            })
            .collect();
        json!({ "type": "agents", "data": data })
    }

    // --- operations shared by the WS handler and the MCP bridge ---

    pub fn post_system(&self, channel: &str, text: &str) -> chattr_core::error::Result<()> {
        self.store
            .append(
                NewMessage::new(SYSTEM_SENDER, text)
                    .in_channel(channel)
                    .with_kind(MessageKind::System),
            )
            .map(|_| ())
    }

    /// Common ingress for human and agent messages. Slash commands are
    /// consumed here and never stored verbatim.
    pub fn inbound_message(&self, new: NewMessage) -> chattr_core::error::Result<Option<chattr_core::types::ChatMessage>> {
        let text = new.text.trim();
        if text.is_empty() && new.attachments.is_empty() {
            return Ok(None);
        }

        // Strip mentions so "@claude /continue" still counts.
        let stripped = strip_mentions(text);
        let command = stripped.split_whitespace().next().unwrap_or("");
        match command {
            "/continue" => {
                self.router.continue_routing(&new.channel);
                self.post_system(&new.channel, &format!("Routing resumed by {}.", new.sender))?;
                self.broadcast_status();
                return Ok(None);
            }
            "/clear" => {
                self.store.clear(Some(&new.channel))?;
                return Ok(None);
            }
            _ => {}
        }

        let msg = self.store.append(NewMessage {
            text: text.to_string(),
            ..new
        })?;
        Ok(Some(msg))
    }

    /// Refresh presence for an agent, synthesizing the `join` message when
    /// this call brought it back online.
    pub fn touch_presence(&self, name: &str) {
        let came_online = self.presence.touch(name);
        if came_online && self.config.agents.contains_key(name) {
            let result = self.store.append(
                NewMessage::new(name, format!("{name} connected"))
                    .with_kind(MessageKind::Join),
            );
            if let Err(error) = result {
                tracing::warn!(target = "chattr::hub", agent = name, error = %error, "failed to append join message");
            }
            self.broadcast_status();
        }
    }

    /// Post the synthetic `leave` for an agent into every channel.
    pub fn post_leave(&self, name: &str) {
        for channel in self.store.channels() {
            let result = self.store.append(
                NewMessage::new(name, format!("{name} disconnected"))
                    .in_channel(&channel)
                    .with_kind(MessageKind::Leave),
            );
            if let Err(error) = result {
                tracing::warn!(target = "chattr::hub", agent = name, error = %error, "failed to append leave message");
            }
        }
        self.broadcast_status();
    }

    // --- channel operations (store + router + cursors move together) ---

    pub fn create_channel(&self, name: &str) -> chattr_core::error::Result<()> {
        self.store.create_channel(name)
    }

    pub fn rename_channel(&self, old: &str, new: &str) -> chattr_core::error::Result<()> {
        self.store.rename_channel(old, new)?;
        self.router.rename_channel(old, new);
        self.cursors.rename_channel(old, new);
        Ok(())
    }

    pub fn delete_channel(&self, name: &str) -> chattr_core::error::Result<()> {
        self.store.delete_channel(name)?;
        self.cursors.drop_channel(name);
        Ok(())
    }

    /// Stamp consumed by the wrappers' server-restart watchers.
    pub fn write_started_at(&self) -> Result<()> {
        let path = self.data_dir.join(SERVER_STARTED_AT_FILE);
        std::fs::write(&path, chattr_core::types::now_epoch().to_string())?;
        Ok(())
    }

    /// Consume `<agent>_recovered` flag files written by wrappers after a
    /// restart-recovery interrupt, announcing each in chat so the operator
    /// knows why a message may have gone unanswered.
    pub fn sweep_recovery_flags(&self) {
        let Ok(entries) = std::fs::read_dir(&self.data_dir) else {
            return;
        };
        for entry in entries.flatten() {
            let file_name = entry.file_name().to_string_lossy().into_owned();
            let Some(agent) = file_name.strip_suffix("_recovered") else {
                continue;
            };
            let agent = std::fs::read_to_string(entry.path())
                .ok()
                .map(|raw| raw.trim().to_string())
                .filter(|name| !name.is_empty())
                .unwrap_or_else(|| agent.to_string());
            let _ = std::fs::remove_file(entry.path());
            tracing::info!(target = "chattr::hub", agent = %agent, "wrapper reported restart recovery");
            let notice = format!(
                "Agent routing for {agent} interrupted — auto-recovered. \
If agents aren't responding, try sending your message again."
            );
            if let Err(error) = self.post_system(chattr_core::DEFAULT_CHANNEL, &notice) {
                tracing::warn!(target = "chattr::hub", agent = %agent, error = %error, "failed to post recovery notice");
            }
        }
    }
}

fn strip_mentions(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for word in text.split_whitespace() {
        if word.starts_with('@') {
            continue;
        }
        if !out.is_empty() {
            out.push(' ');
        }
        out.push_str(word);
    }
    out.to_lowercase()
}

/// Background sweep: presence expiry (agents past the offline threshold
/// get their `leave` synthesized in every channel) and wrapper recovery
/// flags.
pub async fn run_presence_tick(hub: Arc<Hub>) {
    let mut tick = tokio::time::interval(Duration::from_secs(3));
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tick.tick().await;
        for name in hub.presence.expire() {
            tracing::info!(target = "chattr::hub", agent = %name, "presence expired");
            hub.post_leave(&name);
        }
        hub.sweep_recovery_flags();
    }
}

// ---------------------------------------------------------------------------
// Per-agent read cursors
// ---------------------------------------------------------------------------

const CURSORS_FILE: &str = "mcp_cursors.json";

/// Highest message id each (agent, channel) reader has observed.
/// Persisted so agents do not re-read history after a hub restart.
pub struct CursorMap {
    path: PathBuf,
    map: Mutex<HashMap<String, u64>>,
}

impl CursorMap {
    pub fn load(data_dir: &Path) -> Self {
        let path = data_dir.join(CURSORS_FILE);
        let map = std::fs::read_to_string(&path)
            .ok()
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or_default();
        Self {
            path,
            map: Mutex::new(map),
        }
    }

    fn key(agent: &str, channel: Option<&str>) -> String {
        format!("{agent}/{}", channel.unwrap_or("*"))
    }

    pub fn get(&self, agent: &str, channel: Option<&str>) -> u64 {
        self.map
            .lock()
            .get(&Self::key(agent, channel))
            .copied()
            .unwrap_or(0)
    }

    pub fn set(&self, agent: &str, channel: Option<&str>, id: u64) {
        let mut map = self.map.lock();
        map.insert(Self::key(agent, channel), id);
        self.save(&map);
    }

    pub fn rename_channel(&self, old: &str, new: &str) {
        let mut map = self.map.lock();
        let suffix = format!("/{old}");
        let moved: Vec<(String, u64)> = map
            .iter()
            .filter(|(key, _)| key.ends_with(&suffix))
            .map(|(key, value)| (key.clone(), *value))
            .collect();
        for (key, value) in moved {
            map.remove(&key);
            let agent = key.rsplit_once('/').map(|(a, _)| a).unwrap_or("");
            map.insert(format!("{agent}/{new}"), value);
        }
        self.save(&map);
    }

    pub fn drop_channel(&self, name: &str) {
        let mut map = self.map.lock();
        let suffix = format!("/{name}");
        map.retain(|key, _| !key.ends_with(&suffix));
        self.save(&map);
    }

    fn save(&self, map: &HashMap<String, u64>) {
        // Write-to-temp + rename: readers never see a torn file.
        let tmp = self.path.with_extension("json.tmp");
        let encoded = serde_json::to_string(map).expect("cursor map serializes");
        let result = std::fs::write(&tmp, encoded).and_then(|()| std::fs::rename(&tmp, &self.path));
        if let Err(error) = result {
            tracing::warn!(
                target = "chattr::hub",
                path = %self.path.display(),
                error = %error,
                "failed to persist read cursors"
            );
        }
    }
}

// ---------------------------------------------------------------------------
// Agent hats
// ---------------------------------------------------------------------------

const HATS_FILE: &str = "hats.json";
const HAT_MAX_BYTES: usize = 5120;

pub struct HatStore {
    path: PathBuf,
    map: Mutex<HashMap<String, String>>,
}

impl HatStore {
    pub fn load(data_dir: &Path) -> Self {
        let path = data_dir.join(HATS_FILE);
        let map = std::fs::read_to_string(&path)
            .ok()
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or_default();
        Self {
            path,
            map: Mutex::new(map),
        }
    }

    /// Validate, sanitize, and store. Returns the rejection reason if the
    /// SVG is unacceptable.
    pub fn set(&self, agent: &str, svg: &str) -> std::result::Result<(), ChatError> {
        let svg = svg.trim();
        if !svg.to_ascii_lowercase().starts_with("<svg") {
            return Err(ChatError::validation(
                "hat must be an SVG element (starts with <svg)",
            ));
        }
        if svg.len() > HAT_MAX_BYTES {
            return Err(ChatError::validation("hat SVG too large (max 5KB)"));
        }
        let clean = sanitize_svg(svg);
        let mut map = self.map.lock();
        map.insert(agent.to_lowercase(), clean);
        self.save(&map);
        Ok(())
    }

    pub fn clear(&self, agent: &str) -> bool {
        let mut map = self.map.lock();
        let removed = map.remove(&agent.to_lowercase()).is_some();
        if removed {
            self.save(&map);
        }
        removed
    }

    pub fn snapshot(&self) -> HashMap<String, String> {
        self.map.lock().clone()
    }

    fn save(&self, map: &HashMap<String, String>) {
        let tmp = self.path.with_extension("json.tmp");
        let encoded = serde_json::to_string(map).expect("hat map serializes");
        let result = std::fs::write(&tmp, encoded).and_then(|()| std::fs::rename(&tmp, &self.path));
        if let Err(error) = result {
            tracing::warn!(
                target = "chattr::hub",
                path = %self.path.display(),
                error = %error,
                "failed to persist hats"
            );
        }
    }
}

/// Strip active content from an SVG string.
fn sanitize_svg(svg: &str) -> String {
    use regex::RegexBuilder;
    let script = RegexBuilder::new(r"<script[^>]*>.*?</script>")
        .case_insensitive(true)
        .dot_matches_new_line(true)
        .build()
        .expect("static regex");
    let handlers = RegexBuilder::new(r"\bon\w+\s*=")
        .case_insensitive(true)
        .build()
        .expect("static regex");
    let js_urls = RegexBuilder::new(r"javascript\s*:")
        .case_insensitive(true)
        .build()
        .expect("static regex");

    let svg = script.replace_all(svg, "");
    let svg = handlers.replace_all(&svg, "");
    js_urls.replace_all(&svg, "").into_owned()
}
