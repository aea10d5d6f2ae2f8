//! Typed configuration, loaded once at startup from `config.toml`.

use std::{collections::BTreeMap, path::Path};

use serde::Deserialize;

use crate::error::{ChatError, Result};

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub mcp: McpConfig,
    #[serde(default)]
    pub routing: RoutingConfig,
    #[serde(default)]
    pub agents: BTreeMap<String, AgentDef>,
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub cleanup: CleanupConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct McpConfig {
    #[serde(default = "default_http_port")]
    pub http_port: u16,
    #[serde(default = "default_sse_port")]
    pub sse_port: u16,
    /// Consecutive HTTP probe failures before the wrapper kills the session.
    #[serde(default = "default_http_kill_threshold")]
    pub http_kill_threshold: u32,
    /// Consecutive SSE probe failures before the wrapper kills the session.
    #[serde(default = "default_sse_kill_threshold")]
    pub sse_kill_threshold: u32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RoutingConfig {
    /// `none`: only explicit mentions trigger agents. `all`: every human
    /// message goes to every agent.
    #[serde(default)]
    pub default: DefaultRouting,
    #[serde(default = "default_max_hops")]
    pub max_agent_hops: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DefaultRouting {
    #[default]
    None,
    All,
}

/// Static definition of one wrapped agent.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AgentDef {
    pub command: String,
    #[serde(default = "default_cwd")]
    pub cwd: String,
    #[serde(default = "default_color")]
    pub color: String,
    #[serde(default)]
    pub label: Option<String>,
    /// Appended to the spawn command when resuming a prior conversation.
    #[serde(default)]
    pub resume_flag: Option<String>,
    /// Minimum seconds between injected wake-ups.
    #[serde(default = "default_trigger_cooldown")]
    pub trigger_cooldown: f64,
}

impl AgentDef {
    pub fn label_or<'a>(&'a self, name: &'a str) -> &'a str {
        self.label.as_deref().unwrap_or(name)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MonitorConfig {
    /// Queue-non-empty idle minutes before the wrapper re-injects once.
    /// Must be generous: long-running agent tasks look idle from outside.
    #[serde(default = "default_task_timeout")]
    pub agent_task_timeout_minutes: f64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CleanupConfig {
    #[serde(default)]
    pub enabled: bool,
}

fn default_port() -> u16 {
    8300
}
fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_data_dir() -> String {
    "./data".to_string()
}
fn default_http_port() -> u16 {
    8200
}
fn default_sse_port() -> u16 {
    8201
}
fn default_http_kill_threshold() -> u32 {
    10
}
fn default_sse_kill_threshold() -> u32 {
    5
}
fn default_max_hops() -> u32 {
    4
}
fn default_cwd() -> String {
    ".".to_string()
}
fn default_color() -> String {
    "#888".to_string()
}
fn default_trigger_cooldown() -> f64 {
    2.0
}
fn default_task_timeout() -> f64 {
    15.0
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            host: default_host(),
            data_dir: default_data_dir(),
        }
    }
}

impl Default for McpConfig {
    fn default() -> Self {
        Self {
            http_port: default_http_port(),
            sse_port: default_sse_port(),
            http_kill_threshold: default_http_kill_threshold(),
            sse_kill_threshold: default_sse_kill_threshold(),
        }
    }
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            default: DefaultRouting::None,
            max_agent_hops: default_max_hops(),
        }
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            agent_task_timeout_minutes: default_task_timeout(),
        }
    }
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self { enabled: false }
    }
}

impl Config {
    /// Parse and validate. `PORT` in the environment overrides the server
    /// port; the session token override (`ACCESS_TOKEN`) is handled by the
    /// token module.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| ChatError::Fatal(format!("cannot read {}: {e}", path.display())))?;
        Self::parse(&raw)
    }

    pub fn parse(raw: &str) -> Result<Self> {
        let mut cfg: Config =
            toml::from_str(raw).map_err(|e| ChatError::Fatal(format!("invalid config: {e}")))?;

        if let Ok(port) = std::env::var("PORT") {
            cfg.server.port = port
                .parse()
                .map_err(|_| ChatError::Fatal(format!("invalid PORT override: {port}")))?;
        }

        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<()> {
        for name in self.agents.keys() {
            if !crate::is_valid_channel_name(name) {
                return Err(ChatError::Fatal(format!(
                    "agent name '{name}' must be lowercase alphanumeric with dashes"
                )));
            }
        }
        let ports = [self.server.port, self.mcp.http_port, self.mcp.sse_port];
        for (i, a) in ports.iter().enumerate() {
            if ports[i + 1..].contains(a) {
                return Err(ChatError::Fatal(format!("port {a} configured twice")));
            }
        }
        Ok(())
    }

    pub fn agent_names(&self) -> Vec<String> {
        self.agents.keys().cloned().collect()
    }

    pub fn host_is_loopback(&self) -> bool {
        matches!(self.server.host.as_str(), "127.0.0.1" | "localhost" | "::1")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_from_empty_config() {
        let cfg = Config::parse("").unwrap();
        assert_eq!(cfg.server.port, 8300);
        assert_eq!(cfg.server.host, "127.0.0.1");
        assert_eq!(cfg.mcp.http_port, 8200);
        assert_eq!(cfg.mcp.sse_port, 8201);
        assert_eq!(cfg.mcp.http_kill_threshold, 10);
        assert_eq!(cfg.mcp.sse_kill_threshold, 5);
        assert_eq!(cfg.routing.default, DefaultRouting::None);
        assert_eq!(cfg.routing.max_agent_hops, 4);
        assert_eq!(cfg.monitor.agent_task_timeout_minutes, 15.0);
        assert!(!cfg.cleanup.enabled);
        assert!(cfg.host_is_loopback());
    }

    #[test]
    fn agents_parse_with_optional_fields() {
        let cfg = Config::parse(
            r##"
[agents.claude]
command = "claude"
cwd = "~/work"
color = "#d97757"
label = "Claude"
resume_flag = "--continue"

[agents.codex]
command = "codex"
"##,
        )
        .unwrap();
        assert_eq!(cfg.agents.len(), 2);
        let claude = &cfg.agents["claude"];
        assert_eq!(claude.resume_flag.as_deref(), Some("--continue"));
        assert_eq!(claude.label_or("claude"), "Claude");
        let codex = &cfg.agents["codex"];
        assert_eq!(codex.cwd, ".");
        assert_eq!(codex.trigger_cooldown, 2.0);
        assert_eq!(codex.label_or("codex"), "codex");
    }

    #[test]
    fn bad_agent_name_is_fatal() {
        let err = Config::parse("[agents.\"Bad Name\"]\ncommand = \"x\"\n").unwrap_err();
        assert!(matches!(err, ChatError::Fatal(_)));
    }

    #[test]
    fn duplicate_ports_rejected() {
        let err = Config::parse("[server]\nport = 8200\n").unwrap_err();
        assert!(matches!(err, ChatError::Fatal(_)));
    }

    #[test]
    fn non_loopback_host_detected() {
        let cfg = Config::parse("[server]\nhost = \"0.0.0.0\"\n").unwrap();
        assert!(!cfg.host_is_loopback());
    }
}
