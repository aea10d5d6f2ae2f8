//! Terminal session backends for the wrapper supervisor.
//!
//! Two implementations of one capability contract: a named, detachable
//! tmux session (the normal Unix path) and a direct child on a PTY for
//! hosts without a multiplexer. The wrapper owns exactly one session per
//! agent and serializes every keystroke through it.

use std::{
    io::{Read, Write},
    process::Command,
    sync::Arc,
    thread,
};

use anyhow::{Context, Result};
use parking_lot::Mutex;
use portable_pty::{native_pty_system, CommandBuilder, PtySize};

/// Multiplexer session name for one agent.
pub fn session_name(agent: &str) -> String {
    format!("agentchattr-{agent}")
}

/// One keystroke (or burst of literal text) sent to the agent's terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Key<'a> {
    Literal(&'a str),
    Enter,
    Escape,
    /// Clear any half-typed input (C-u).
    ClearLine,
    /// Controlled interrupt (C-c).
    Interrupt,
}

/// What the wrapper needs from a live terminal session.
pub trait AgentSession: Send {
    /// Stable identifier, e.g. the tmux session name.
    fn id(&self) -> &str;

    fn send(&mut self, key: Key<'_>) -> Result<()>;

    /// Snapshot of the visible region as plain text (escapes stripped).
    fn capture(&mut self) -> Result<Vec<u8>>;

    fn is_alive(&mut self) -> bool;

    fn kill(&mut self) -> Result<()>;
}

// ---------------------------------------------------------------------------
// tmux backend
// ---------------------------------------------------------------------------

pub struct TmuxSession {
    name: String,
}

impl TmuxSession {
    /// Attach to an existing session or spawn a fresh one running
    /// `command` in `cwd`.
    pub fn attach_or_spawn(
        agent: &str,
        command: &str,
        args: &[String],
        cwd: &str,
        env: &[(String, String)],
    ) -> Result<Self> {
        let name = session_name(agent);
        let mut session = Self { name };
        if session.is_alive() {
            tracing::info!(
                target = "chattr::session",
                session = %session.name,
                "attaching to existing session"
            );
            return Ok(session);
        }
        session.spawn(command, args, cwd, env)?;
        Ok(session)
    }

    fn spawn(&mut self, command: &str, args: &[String], cwd: &str, env: &[(String, String)]) -> Result<()> {
        let abs_cwd = std::fs::canonicalize(cwd)
            .with_context(|| format!("agent cwd '{cwd}' does not exist"))?;
        let shell_cmd = shell_join(command, args);

        let mut tmux = Command::new("tmux");
        tmux.args([
            "new-session",
            "-d",
            "-s",
            self.name.as_str(),
            "-c",
            abs_cwd.to_str().context("non-utf8 cwd")?,
            shell_cmd.as_str(),
        ]);
        for (key, value) in env {
            tmux.env(key, value);
        }
        // A nested-session guard variable would make the wrapped CLI
        // think it is already inside an agent session.
        tmux.env_remove("CLAUDECODE");

        let status = tmux.status().context("tmux not found on PATH")?;
        if !status.success() {
            anyhow::bail!("tmux new-session failed for {} (exit {status})", self.name);
        }
        Ok(())
    }

    /// Block the current terminal on the session so the user sees the TUI.
    /// Returns when the user detaches or the session dies.
    pub fn attach_blocking(&self) -> Result<()> {
        let status = Command::new("tmux")
            .args(["attach-session", "-t", self.name.as_str()])
            .status()
            .context("tmux not found on PATH")?;
        if !status.success() {
            anyhow::bail!("tmux attach-session failed for {}", self.name);
        }
        Ok(())
    }

    fn send_keys(&self, args: &[&str]) -> Result<()> {
        let output = Command::new("tmux")
            .arg("send-keys")
            .arg("-t")
            .arg(&self.name)
            .args(args)
            .output()
            .context("tmux not found on PATH")?;
        if !output.status.success() {
            anyhow::bail!(
                "tmux send-keys to {} failed: {}",
                self.name,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(())
    }
}

impl AgentSession for TmuxSession {
    fn id(&self) -> &str {
        &self.name
    }

    fn send(&mut self, key: Key<'_>) -> Result<()> {
        match key {
            // -l sends the text literally so it cannot be misread as a
            // key name.
            Key::Literal(text) => self.send_keys(&["-l", text]),
            Key::Enter => self.send_keys(&["Enter"]),
            Key::Escape => self.send_keys(&["Escape"]),
            Key::ClearLine => self.send_keys(&["C-u"]),
            Key::Interrupt => self.send_keys(&["C-c"]),
        }
    }

    fn capture(&mut self) -> Result<Vec<u8>> {
        // capture-pane without -e already drops escape sequences, so the
        // snapshot only changes when visible text changes.
        let output = Command::new("tmux")
            .args(["capture-pane", "-p", "-t", self.name.as_str()])
            .output()
            .context("tmux not found on PATH")?;
        if !output.status.success() {
            anyhow::bail!("tmux capture-pane failed for {}", self.name);
        }
        Ok(output.stdout)
    }

    fn is_alive(&mut self) -> bool {
        Command::new("tmux")
            .args(["has-session", "-t", self.name.as_str()])
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    fn kill(&mut self) -> Result<()> {
        let _ = Command::new("tmux")
            .args(["kill-session", "-t", self.name.as_str()])
            .output();
        Ok(())
    }
}

/// List live sessions carrying our prefix. Used by the cleanup command.
pub fn list_sessions() -> Vec<String> {
    let output = match Command::new("tmux")
        .args(["list-sessions", "-F", "#{session_name}"])
        .output()
    {
        Ok(output) if output.status.success() => output,
        _ => return Vec::new(),
    };
    String::from_utf8_lossy(&output.stdout)
        .lines()
        .filter(|name| name.starts_with("agentchattr-"))
        .map(str::to_string)
        .collect()
}

pub fn kill_session_by_name(name: &str) -> Result<()> {
    let _ = Command::new("tmux")
        .args(["kill-session", "-t", name])
        .output()
        .context("tmux not found on PATH")?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Direct-child PTY backend
// ---------------------------------------------------------------------------

const SCREEN_BUFFER_CAP: usize = 64 * 1024;

/// Direct child on a PTY. A reader thread drains output into a rolling
/// buffer that stands in for the visible region.
pub struct PtyChildSession {
    id: String,
    writer: Arc<Mutex<Box<dyn Write + Send>>>,
    child: Arc<Mutex<Box<dyn portable_pty::Child + Send>>>,
    screen: Arc<Mutex<Vec<u8>>>,
}

impl PtyChildSession {
    pub fn spawn(
        agent: &str,
        command: &str,
        args: &[String],
        cwd: &str,
        env: &[(String, String)],
    ) -> Result<Self> {
        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(PtySize {
                rows: 40,
                cols: 120,
                pixel_width: 0,
                pixel_height: 0,
            })
            .context("failed to open pty")?;

        let mut cmd = CommandBuilder::new(command);
        cmd.cwd(std::fs::canonicalize(cwd).with_context(|| format!("agent cwd '{cwd}'"))?);
        for arg in args {
            cmd.arg(arg);
        }
        for (key, value) in env {
            cmd.env(key, value);
        }
        cmd.env_remove("CLAUDECODE");

        let child = pair
            .slave
            .spawn_command(cmd)
            .context("failed to spawn wrapped command")?;

        let mut reader = pair
            .master
            .try_clone_reader()
            .context("failed to clone pty reader")?;
        let writer = pair.master.take_writer().context("failed to take pty writer")?;

        let screen = Arc::new(Mutex::new(Vec::new()));
        let screen_writer = screen.clone();
        thread::spawn(move || {
            let mut buf = [0u8; 4096];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        let mut screen = screen_writer.lock();
                        screen.extend_from_slice(&buf[..n]);
                        let len = screen.len();
                        if len > SCREEN_BUFFER_CAP {
                            screen.drain(..len - SCREEN_BUFFER_CAP);
                        }
                    }
                }
            }
        });

        Ok(Self {
            id: format!("pty:{agent}"),
            writer: Arc::new(Mutex::new(writer)),
            child: Arc::new(Mutex::new(child)),
            screen,
        })
    }

    fn write_bytes(&self, bytes: &[u8]) -> Result<()> {
        let mut writer = self.writer.lock();
        writer.write_all(bytes)?;
        writer.flush()?;
        Ok(())
    }
}

impl AgentSession for PtyChildSession {
    fn id(&self) -> &str {
        &self.id
    }

    fn send(&mut self, key: Key<'_>) -> Result<()> {
        match key {
            Key::Literal(text) => self.write_bytes(text.as_bytes()),
            Key::Enter => self.write_bytes(b"\r"),
            Key::Escape => self.write_bytes(b"\x1b"),
            Key::ClearLine => self.write_bytes(b"\x15"),
            Key::Interrupt => self.write_bytes(b"\x03"),
        }
    }

    fn capture(&mut self) -> Result<Vec<u8>> {
        let raw = String::from_utf8_lossy(&self.screen.lock()).into_owned();
        Ok(strip_ansi(&raw).into_bytes())
    }

    fn is_alive(&mut self) -> bool {
        matches!(self.child.lock().try_wait(), Ok(None))
    }

    fn kill(&mut self) -> Result<()> {
        let mut child = self.child.lock();
        let _ = child.kill();
        let _ = child.wait();
        Ok(())
    }
}

/// Strip CSI/OSC escape sequences so only visible text remains.
pub fn strip_ansi(text: &str) -> String {
    let mut result = String::with_capacity(text.len());
    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '\x1b' {
            result.push(c);
            continue;
        }
        match chars.peek() {
            Some('[') => {
                chars.next();
                for nc in chars.by_ref() {
                    if nc.is_ascii_alphabetic() || nc == '@' || nc == '`' {
                        break;
                    }
                }
            }
            Some(']') => {
                chars.next();
                while let Some(nc) = chars.next() {
                    if nc == '\x07' {
                        break;
                    }
                    if nc == '\x1b' && chars.peek() == Some(&'\\') {
                        chars.next();
                        break;
                    }
                }
            }
            Some('(' | ')' | '*' | '+') => {
                chars.next();
                chars.next();
            }
            Some(c) if *c >= '0' && *c <= '~' => {
                chars.next();
            }
            _ => {}
        }
    }
    result
}

fn shell_join(command: &str, args: &[String]) -> String {
    let mut parts = vec![shell_quote(command)];
    parts.extend(args.iter().map(|a| shell_quote(a)));
    parts.join(" ")
}

fn shell_quote(s: &str) -> String {
    if !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:@%+".contains(c))
    {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', "'\\''"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_names_carry_the_prefix() {
        assert_eq!(session_name("claude"), "agentchattr-claude");
    }

    #[test]
    fn strip_ansi_removes_color_codes() {
        assert_eq!(strip_ansi("\x1b[31mred\x1b[0m text"), "red text");
        assert_eq!(strip_ansi("plain"), "plain");
    }

    #[test]
    fn strip_ansi_removes_osc_titles() {
        assert_eq!(strip_ansi("\x1b]0;title\x07body"), "body");
    }

    #[test]
    fn shell_join_quotes_spaces() {
        assert_eq!(
            shell_join("claude", &["--flag".into(), "two words".into()]),
            "claude --flag 'two words'"
        );
    }

    #[test]
    fn shell_quote_escapes_single_quotes() {
        assert_eq!(shell_quote("it's"), "'it'\\''s'");
    }

    #[cfg(unix)]
    #[test]
    fn pty_child_captures_output() {
        let mut session = PtyChildSession::spawn(
            "test",
            "echo",
            &["hello-pty".to_string()],
            ".",
            &[],
        )
        .unwrap();
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(3);
        loop {
            let captured = session.capture().unwrap();
            if String::from_utf8_lossy(&captured).contains("hello-pty") {
                break;
            }
            if std::time::Instant::now() > deadline {
                panic!("echo output never appeared in capture");
            }
            std::thread::sleep(std::time::Duration::from_millis(50));
        }
        let _ = session.kill();
    }
}
