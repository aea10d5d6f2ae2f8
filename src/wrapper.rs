//! Per-agent wrapper supervisor.
//!
//! Owns the agent's terminal session and runs the cooperating watcher
//! tasks: trigger injection, activity hashing, presence heartbeat, MCP
//! health probing, and server-restart detection. Exactly one wrapper is
//! authoritative per agent, enforced with an exclusive file lock.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::{Duration, Instant},
};

use anyhow::{Context, Result};
use parking_lot::Mutex;
use tokio::time::MissedTickBehavior;

use chattr_core::{config::Config, queue::TriggerQueueReader, token};

use crate::{
    activity::{ActivityHasher, ActivityTransition},
    hub::SERVER_STARTED_AT_FILE,
    mcp_client::HubClient,
    session::{AgentSession, Key, PtyChildSession, TmuxSession},
    stability::{StabilityLog, StabilityTag},
    watchers::{HealthCounters, RestartSignal, RestartWatcher},
};

const TRIGGER_POLL_INTERVAL: Duration = Duration::from_secs(1);
const ACTIVITY_INTERVAL: Duration = Duration::from_secs(1);
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(60);
const HEALTH_INTERVAL: Duration = Duration::from_secs(30);
const RESTART_WATCH_INTERVAL: Duration = Duration::from_secs(10);
const LIVENESS_INTERVAL: Duration = Duration::from_secs(5);
const IDLE_CHECK_INTERVAL: Duration = Duration::from_secs(30);
const RESTART_WINDOW: Duration = Duration::from_secs(60);
/// Settle delays inside the injection sequence.
const INJECT_SETTLE: Duration = Duration::from_millis(150);
/// Grace period before health probing starts, so a freshly booted hub is
/// not immediately killed into a restart loop.
const HEALTH_GRACE: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WrapperState {
    Starting,
    Running,
    Restarting,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionBackend {
    /// Named, detachable tmux session (default where tmux exists).
    Tmux,
    /// Direct child on a PTY.
    Pty,
}

#[derive(Debug, Clone)]
pub struct WrapperOptions {
    pub headless: bool,
    pub no_restart: bool,
    pub backend: Option<SessionBackend>,
}

struct WrapperCtx {
    agent: String,
    config: Config,
    data_dir: PathBuf,
    client: HubClient,
    stability: StabilityLog,
    session: Arc<Mutex<Box<dyn AgentSession>>>,
    state: Mutex<WrapperState>,
}

impl WrapperCtx {
    fn set_state(&self, next: WrapperState) {
        let mut state = self.state.lock();
        if *state != next {
            tracing::info!(
                target = "chattr::wrapper",
                agent = %self.agent,
                from = ?*state,
                to = ?next,
                "state transition"
            );
            self.stability
                .record(StabilityTag::Session, &format!("state {:?} -> {next:?}", *state));
            *state = next;
        }
    }
}

pub async fn run_wrapper(config: Config, agent: &str, opts: WrapperOptions) -> Result<()> {
    let def = config
        .agents
        .get(agent)
        .with_context(|| format!("agent '{agent}' is not configured"))?
        .clone();
    let data_dir = PathBuf::from(&config.server.data_dir);
    std::fs::create_dir_all(&data_dir)?;

    // One authoritative wrapper per agent. A second one must yield here.
    let _lock = acquire_agent_lock(&data_dir, agent)?;

    let access_token = token::load_or_generate(&data_dir)
        .map_err(|e| anyhow::anyhow!("cannot load session token: {e}"))?;
    let client = HubClient::new(
        config.mcp.http_port,
        config.mcp.sse_port,
        config.server.port,
        access_token,
    );
    let stability = StabilityLog::new(&data_dir, agent);

    // Stale wake-ups from a crashed prior session must not fire now.
    let mut queue = TriggerQueueReader::new(&data_dir, agent);
    queue.truncate()?;

    let backend = opts.backend.unwrap_or_else(|| {
        if tmux_available() {
            SessionBackend::Tmux
        } else {
            SessionBackend::Pty
        }
    });

    // Drop the hub's MCP endpoints into the agent's working directory so
    // the wrapped CLI discovers them on its own.
    let project_dir = std::fs::canonicalize(&def.cwd)
        .with_context(|| format!("agent cwd '{}' does not exist", def.cwd))?;
    if let Err(error) = crate::mcp_config::ensure_mcp_config(
        &project_dir,
        config.mcp.http_port,
        config.mcp.sse_port,
    ) {
        tracing::warn!(
            target = "chattr::wrapper",
            agent,
            error = %error,
            "MCP auto-configuration failed"
        );
    }

    let mut spawn_args: Vec<String> = Vec::new();
    if let Some(resume_flag) = &def.resume_flag {
        spawn_args.extend(resume_flag.split_whitespace().map(str::to_string));
    }

    let session = spawn_session(backend, agent, &def.command, &spawn_args, &def.cwd)?;
    let session_id = session.id().to_string();
    stability.record(StabilityTag::Session, &format!("session {session_id} ready"));

    let ctx = Arc::new(WrapperCtx {
        agent: agent.to_string(),
        config: config.clone(),
        data_dir: data_dir.clone(),
        client: client.clone(),
        stability,
        session: Arc::new(Mutex::new(session)),
        state: Mutex::new(WrapperState::Starting),
    });

    // Presence: announce as soon as the session is up.
    {
        let ctx = ctx.clone();
        tokio::spawn(async move {
            if let Err(error) = ctx.client.announce_join(&ctx.agent).await {
                tracing::warn!(target = "chattr::wrapper", agent = %ctx.agent, error = %error, "chat_join failed");
            }
        });
    }

    ctx.set_state(WrapperState::Running);
    if !opts.headless && backend == SessionBackend::Tmux {
        eprintln!("  {agent} wrapped in tmux session '{session_id}'");
        eprintln!("  Detach: Ctrl+B, D (agent keeps running; wrapper keeps watching)");
        // Show the TUI; the supervisor keeps running after a detach.
        let attach_name = session_id.clone();
        tokio::task::spawn_blocking(move || {
            let _ = std::process::Command::new("tmux")
                .args(["attach-session", "-t", attach_name.as_str()])
                .status();
        });
    }

    let result = supervise(ctx.clone(), queue, def.trigger_cooldown, opts.clone(), backend).await;

    // Graceful exit: leave, drop the session, release the lock.
    ctx.set_state(WrapperState::Stopped);
    let _ = ctx.client.announce_leave(agent).await;
    if !opts.no_restart {
        let _ = ctx.session.lock().kill();
    }
    result
}

async fn supervise(
    ctx: Arc<WrapperCtx>,
    mut queue: TriggerQueueReader,
    trigger_cooldown: f64,
    opts: WrapperOptions,
    backend: SessionBackend,
) -> Result<()> {
    let mut trigger_tick = tokio::time::interval(TRIGGER_POLL_INTERVAL);
    let mut activity_tick = tokio::time::interval(ACTIVITY_INTERVAL);
    let mut heartbeat_tick = tokio::time::interval(HEARTBEAT_INTERVAL);
    let mut health_tick = tokio::time::interval(HEALTH_INTERVAL);
    let mut restart_tick = tokio::time::interval(RESTART_WATCH_INTERVAL);
    let mut liveness_tick = tokio::time::interval(LIVENESS_INTERVAL);
    let mut idle_tick = tokio::time::interval(IDLE_CHECK_INTERVAL);
    for tick in [
        &mut trigger_tick,
        &mut activity_tick,
        &mut heartbeat_tick,
        &mut health_tick,
        &mut restart_tick,
        &mut liveness_tick,
        &mut idle_tick,
    ] {
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
    }

    let started = Instant::now();
    let cooldown = Duration::from_secs_f64(trigger_cooldown.max(0.0));
    let mut last_inject: Option<Instant> = None;
    let mut renudged = false;
    let mut hasher = ActivityHasher::default();
    let mut health = HealthCounters::new(
        ctx.config.mcp.http_kill_threshold,
        ctx.config.mcp.sse_kill_threshold,
    );
    let mut restart_watcher = RestartWatcher::new(RESTART_WINDOW);
    let task_idle = Duration::from_secs_f64(
        ctx.config.monitor.agent_task_timeout_minutes.max(0.0) * 60.0,
    );

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!(target = "chattr::wrapper", agent = %ctx.agent, "interrupt received, shutting down");
                return Ok(());
            }

            _ = trigger_tick.tick() => {
                let pending = match queue.poll() {
                    Ok(pending) => pending,
                    Err(error) => {
                        tracing::warn!(target = "chattr::wrapper", agent = %ctx.agent, error = %error, "queue poll failed");
                        continue;
                    }
                };
                if pending.entries.is_empty() {
                    continue;
                }

                // Debounce so slow TUIs can finish the previous prompt.
                if let Some(at) = last_inject {
                    let elapsed = at.elapsed();
                    if elapsed < cooldown {
                        tokio::time::sleep(cooldown - elapsed).await;
                    }
                }

                // One short prompt per distinct channel in the batch.
                let mut channels: Vec<&str> = Vec::new();
                for entry in &pending.entries {
                    if !channels.contains(&entry.channel.as_str()) {
                        channels.push(&entry.channel);
                    }
                }
                let mut all_ok = true;
                for channel in channels {
                    let prompt = wake_prompt(channel);
                    if let Err(error) = inject_prompt(&ctx.session, &prompt).await {
                        ctx.stability.record(
                            StabilityTag::Inject,
                            &format!("injection failed: {error}"),
                        );
                        all_ok = false;
                        break;
                    }
                    ctx.stability
                        .record(StabilityTag::Inject, &format!("injected '{prompt}'"));
                }
                if all_ok {
                    // Only a fully delivered batch advances the cursor; a
                    // failed injection leaves it for the health cycle.
                    queue.commit(pending.next_offset);
                    last_inject = Some(Instant::now());
                    renudged = false;
                }
            }

            _ = activity_tick.tick() => {
                let snapshot = { ctx.session.lock().capture() };
                let Ok(snapshot) = snapshot else { continue };
                match hasher.observe(&snapshot) {
                    ActivityTransition::BecameBusy => {
                        let _ = ctx.client.notify_activity(&ctx.agent, true).await;
                    }
                    ActivityTransition::BecameIdle => {
                        let _ = ctx.client.notify_activity(&ctx.agent, false).await;
                    }
                    ActivityTransition::None => {}
                }
            }

            _ = heartbeat_tick.tick() => {
                if started.elapsed() < HEARTBEAT_INTERVAL {
                    continue; // the join announcement just refreshed presence
                }
                if let Err(error) = ctx.client.heartbeat(&ctx.agent).await {
                    tracing::debug!(target = "chattr::wrapper", agent = %ctx.agent, error = %error, "heartbeat failed");
                }
            }

            _ = health_tick.tick() => {
                if started.elapsed() < HEALTH_GRACE {
                    continue;
                }
                let http_ok = ctx.client.probe_http().await;
                let sse_ok = ctx.client.probe_sse().await;
                if !http_ok || !sse_ok {
                    ctx.stability.record(
                        StabilityTag::Health,
                        &format!("probe http_ok={http_ok} sse_ok={sse_ok} (http {} / sse {})",
                            health.http_failures() + u32::from(!http_ok),
                            health.sse_failures() + u32::from(!sse_ok)),
                    );
                    tracing::warn!(
                        target = "chattr::wrapper",
                        agent = %ctx.agent,
                        http_ok,
                        sse_ok,
                        "MCP probe failure"
                    );
                }
                let kill = health
                    .record_http(http_ok)
                    .or(health.record_sse(sse_ok));
                if let Some(reason) = kill {
                    kill_session(&ctx, &reason.to_string()).await;
                    if opts.no_restart {
                        return Ok(());
                    }
                    ctx.set_state(WrapperState::Restarting);
                }
            }

            _ = restart_tick.tick() => {
                let stamp = std::fs::read_to_string(ctx.data_dir.join(SERVER_STARTED_AT_FILE))
                    .ok()
                    .map(|s| s.trim().to_string());
                if restart_watcher.observe(stamp.as_deref()) == RestartSignal::Interrupt {
                    // Stale cached MCP session ids: a controlled interrupt
                    // makes the agent reconnect. The session survives.
                    ctx.stability.record(
                        StabilityTag::Session,
                        "hub restarted twice, interrupting agent to reconnect",
                    );
                    let result = { ctx.session.lock().send(Key::Interrupt) };
                    match result {
                        // The hub polls this flag and announces the
                        // recovery in chat.
                        Ok(()) => notify_recovery(&ctx),
                        Err(error) => {
                            tracing::warn!(target = "chattr::wrapper", agent = %ctx.agent, error = %error, "interrupt failed");
                        }
                    }
                }
            }

            _ = liveness_tick.tick() => {
                let alive = { ctx.session.lock().is_alive() };
                if alive {
                    if *ctx.state.lock() == WrapperState::Restarting {
                        ctx.set_state(WrapperState::Running);
                    }
                    continue;
                }
                if opts.no_restart {
                    tracing::info!(target = "chattr::wrapper", agent = %ctx.agent, "session ended, not restarting");
                    return Ok(());
                }
                ctx.set_state(WrapperState::Restarting);
                tokio::time::sleep(Duration::from_secs(3)).await;
                match respawn(&ctx, backend).await {
                    Ok(()) => {
                        hasher = ActivityHasher::default();
                        ctx.set_state(WrapperState::Running);
                        let join_ctx = ctx.clone();
                        tokio::spawn(async move {
                            let _ = join_ctx.client.announce_join(&join_ctx.agent).await;
                        });
                    }
                    Err(error) => {
                        tracing::error!(target = "chattr::wrapper", agent = %ctx.agent, error = %error, "respawn failed");
                    }
                }
            }

            _ = idle_tick.tick() => {
                if renudged || task_idle.is_zero() {
                    continue;
                }
                let has_pending = queue.has_uncommitted().unwrap_or(false);
                if !has_pending {
                    continue;
                }
                let idle_long_enough = hasher
                    .idle_for(Instant::now())
                    .is_some_and(|idle| idle >= task_idle);
                let inject_stale = last_inject
                    .is_none_or(|at| at.elapsed() >= task_idle);
                if idle_long_enough && inject_stale {
                    // The agent looks stuck on a pending wake-up. Re-inject
                    // once; the threshold is generous because long tasks
                    // look identical from out here.
                    let pending = match queue.poll() {
                        Ok(pending) => pending,
                        Err(_) => continue,
                    };
                    let Some(entry) = pending.entries.last() else { continue };
                    let prompt = wake_prompt(&entry.channel);
                    ctx.stability.record(
                        StabilityTag::Inject,
                        &format!("task-idle re-nudge '{prompt}'"),
                    );
                    if inject_prompt(&ctx.session, &prompt).await.is_ok() {
                        queue.commit(pending.next_offset);
                        last_inject = Some(Instant::now());
                    }
                    renudged = true;
                }
            }
        }
    }
}

fn wake_prompt(channel: &str) -> String {
    format!("mcp read #{channel}")
}

/// Flag file consumed by the hub's recovery sweep (one per agent).
fn notify_recovery(ctx: &WrapperCtx) {
    let flag = ctx.data_dir.join(format!("{}_recovered", ctx.agent));
    if let Err(error) = std::fs::write(&flag, &ctx.agent) {
        tracing::warn!(
            target = "chattr::wrapper",
            agent = %ctx.agent,
            error = %error,
            "failed to write recovery flag"
        );
    }
}

/// Deterministic injection: clear the input line, leave any modal input
/// mode, then type the prompt and submit it.
async fn inject_prompt(session: &Arc<Mutex<Box<dyn AgentSession>>>, prompt: &str) -> Result<()> {
    {
        let mut session = session.lock();
        session.send(Key::ClearLine)?;
        session.send(Key::Escape)?;
    }
    tokio::time::sleep(INJECT_SETTLE).await;
    {
        let mut session = session.lock();
        session.send(Key::Literal(prompt))?;
    }
    tokio::time::sleep(INJECT_SETTLE).await;
    {
        let mut session = session.lock();
        session.send(Key::Enter)?;
    }
    Ok(())
}

async fn kill_session(ctx: &Arc<WrapperCtx>, reason: &str) {
    let session_id = { ctx.session.lock().id().to_string() };
    let notice = format!("[stability] Killing {session_id} — {reason}");
    ctx.stability.record(StabilityTag::Kill, reason);
    // Best effort: the hub may be the thing that is down.
    let _ = ctx
        .client
        .post_system_message(&notice, chattr_core::DEFAULT_CHANNEL)
        .await;
    let result = { ctx.session.lock().kill() };
    if let Err(error) = result {
        tracing::warn!(target = "chattr::wrapper", agent = %ctx.agent, error = %error, "session kill failed");
    }
}

async fn respawn(ctx: &Arc<WrapperCtx>, backend: SessionBackend) -> Result<()> {
    let def = ctx
        .config
        .agents
        .get(&ctx.agent)
        .context("agent vanished from config")?;
    let mut spawn_args: Vec<String> = Vec::new();
    if let Some(resume_flag) = &def.resume_flag {
        spawn_args.extend(resume_flag.split_whitespace().map(str::to_string));
    }
    let fresh = spawn_session(backend, &ctx.agent, &def.command, &spawn_args, &def.cwd)?;
    ctx.stability
        .record(StabilityTag::Session, &format!("respawned {}", fresh.id()));
    *ctx.session.lock() = fresh;
    Ok(())
}

fn spawn_session(
    backend: SessionBackend,
    agent: &str,
    command: &str,
    args: &[String],
    cwd: &str,
) -> Result<Box<dyn AgentSession>> {
    let env: Vec<(String, String)> = std::env::vars().collect();
    match backend {
        SessionBackend::Tmux => Ok(Box::new(TmuxSession::attach_or_spawn(
            agent, command, args, cwd, &env,
        )?)),
        SessionBackend::Pty => Ok(Box::new(PtyChildSession::spawn(
            agent, command, args, cwd, &env,
        )?)),
    }
}

fn tmux_available() -> bool {
    std::process::Command::new("tmux")
        .arg("-V")
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

#[cfg(unix)]
fn acquire_agent_lock(data_dir: &Path, agent: &str) -> Result<std::fs::File> {
    use std::os::fd::AsRawFd;

    let path = data_dir.join(format!("{agent}.lock"));
    let file = std::fs::OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(&path)
        .with_context(|| format!("cannot open lock file {}", path.display()))?;
    let rc = unsafe { nix::libc::flock(file.as_raw_fd(), nix::libc::LOCK_EX | nix::libc::LOCK_NB) };
    if rc != 0 {
        anyhow::bail!(
            "another wrapper already owns agent '{agent}' (lock {} is held)",
            path.display()
        );
    }
    Ok(file)
}

#[cfg(not(unix))]
fn acquire_agent_lock(data_dir: &Path, agent: &str) -> Result<std::fs::File> {
    let path = data_dir.join(format!("{agent}.lock"));
    std::fs::OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(&path)
        .with_context(|| format!("cannot open lock file {}", path.display()))
}

/// True when no wrapper currently holds the agent's lock. Used by the
/// cleanup command so it never reaps a session that is still owned.
#[cfg(unix)]
pub fn agent_lock_is_free(data_dir: &Path, agent: &str) -> bool {
    use std::os::fd::AsRawFd;

    let path = data_dir.join(format!("{agent}.lock"));
    let Ok(file) = std::fs::OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(&path)
    else {
        return false;
    };
    let rc = unsafe { nix::libc::flock(file.as_raw_fd(), nix::libc::LOCK_EX | nix::libc::LOCK_NB) };
    if rc == 0 {
        let _ = unsafe { nix::libc::flock(file.as_raw_fd(), nix::libc::LOCK_UN) };
        true
    } else {
        false
    }
}

#[cfg(not(unix))]
pub fn agent_lock_is_free(_data_dir: &Path, _agent: &str) -> bool {
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wake_prompt_names_the_channel() {
        assert_eq!(wake_prompt("general"), "mcp read #general");
        assert_eq!(wake_prompt("dev"), "mcp read #dev");
    }

    #[cfg(unix)]
    #[test]
    fn second_lock_acquisition_fails() {
        let dir = tempfile::tempdir().unwrap();
        let _held = acquire_agent_lock(dir.path(), "claude").unwrap();
        assert!(acquire_agent_lock(dir.path(), "claude").is_err());
        assert!(!agent_lock_is_free(dir.path(), "claude"));
    }

    #[cfg(unix)]
    #[test]
    fn released_lock_is_free() {
        let dir = tempfile::tempdir().unwrap();
        {
            let _held = acquire_agent_lock(dir.path(), "codex").unwrap();
        }
        assert!(agent_lock_is_free(dir.path(), "codex"));
    }
}
