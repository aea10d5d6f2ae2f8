//! agentchattr — local coordination hub for terminal AI coding agents.
//!
//! `serve` runs the chat hub plus the MCP bridge; `wrap` supervises one
//! agent's terminal session and injects wake-ups when the agent is
//! mentioned in chat; `cleanup` reaps orphaned multiplexer sessions.

mod activity;
mod cleanup;
mod hub;
mod mcp;
mod mcp_client;
mod mcp_config;
mod server;
mod session;
mod stability;
mod watchers;
mod wrapper;

use std::{path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use chattr_core::{config::Config, token};

use crate::wrapper::{SessionBackend, WrapperOptions};

#[derive(Debug, Parser)]
#[command(name = "agentchattr")]
#[command(about = "Multi-agent chat hub with terminal wake-up injection")]
struct Cli {
    /// Path to the configuration file.
    #[arg(long, default_value = "config.toml", global = true)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the chat hub: web UI, WebSocket fan-out, and the MCP bridge.
    Serve(ServeCommand),
    /// Supervise one agent's terminal with chat auto-trigger.
    Wrap(WrapCommand),
    /// Reap multiplexer sessions that no wrapper owns.
    Cleanup(CleanupCommand),
}

#[derive(Debug, clap::Args)]
struct ServeCommand {
    /// Allow binding to a non-loopback host. Without this flag a
    /// non-loopback `server.host` refuses to start.
    #[arg(long, default_value_t = false)]
    allow_network: bool,
}

#[derive(Debug, clap::Args)]
struct WrapCommand {
    /// The configured agent to wrap.
    agent: String,

    /// Run without showing the agent's TUI (for nohup/background use).
    #[arg(long, default_value_t = false)]
    headless: bool,

    /// Don't restart the session when the agent exits.
    #[arg(long, default_value_t = false)]
    no_restart: bool,

    /// Session backend override; auto-detected when omitted.
    #[arg(long, value_enum)]
    backend: Option<BackendArg>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum BackendArg {
    Tmux,
    Pty,
}

#[derive(Debug, clap::Args)]
struct CleanupCommand {
    /// Reap even when `cleanup.enabled` is false in config.
    #[arg(long, default_value_t = false)]
    force: bool,
}

/// Console logging, plus a free-form per-agent log file in wrap mode.
fn init_tracing(log_file: Option<std::fs::File>) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let console = fmt::layer().with_target(true);
    match log_file {
        Some(file) => {
            let file_layer = fmt::layer()
                .with_ansi(false)
                .with_target(true)
                .with_writer(std::sync::Arc::new(file));
            tracing_subscriber::registry()
                .with(filter)
                .with(console)
                .with(file_layer)
                .init();
        }
        None => {
            tracing_subscriber::registry()
                .with(filter)
                .with(console)
                .init();
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::load(&cli.config)
        .map_err(|e| anyhow::anyhow!("{e} (looked for {})", cli.config.display()))?;

    let wrapper_log = match &cli.command {
        Commands::Wrap(cmd) => {
            let data_dir = PathBuf::from(&config.server.data_dir);
            std::fs::create_dir_all(&data_dir)?;
            Some(
                std::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(data_dir.join(format!("{}_wrapper.log", cmd.agent)))?,
            )
        }
        _ => None,
    };
    init_tracing(wrapper_log);

    match cli.command {
        Commands::Serve(cmd) => run_serve(config, cmd).await,
        Commands::Wrap(cmd) => {
            let backend = cmd.backend.map(|b| match b {
                BackendArg::Tmux => SessionBackend::Tmux,
                BackendArg::Pty => SessionBackend::Pty,
            });
            wrapper::run_wrapper(
                config,
                &cmd.agent,
                WrapperOptions {
                    headless: cmd.headless,
                    no_restart: cmd.no_restart,
                    backend,
                },
            )
            .await
        }
        Commands::Cleanup(cmd) => {
            let report = cleanup::run_cleanup(&config, cmd.force)?;
            for name in &report.killed {
                println!("killed {name}");
            }
            for name in &report.kept {
                println!("kept   {name}");
            }
            Ok(())
        }
    }
}

async fn run_serve(config: Config, cmd: ServeCommand) -> Result<()> {
    if !config.host_is_loopback() && !cmd.allow_network {
        anyhow::bail!(
            "refusing to bind to non-loopback host {} — pass --allow-network to expose the hub",
            config.server.host
        );
    }
    if !config.host_is_loopback() {
        tracing::warn!(
            target = "chattr::serve",
            host = %config.server.host,
            "binding beyond loopback, network access enabled"
        );
    }

    let data_dir = PathBuf::from(&config.server.data_dir);
    std::fs::create_dir_all(&data_dir)?;
    let access_token = token::load_or_generate(&data_dir)
        .map_err(|e| anyhow::anyhow!("cannot initialize session token: {e}"))?;

    let host = config.server.host.clone();
    let port = config.server.port;
    let http_port = config.mcp.http_port;
    let sse_port = config.mcp.sse_port;

    let hub = hub::Hub::new(config, &data_dir, access_token.clone())?;
    // Wrappers watch this stamp to detect hub restarts.
    hub.write_started_at()?;

    let mcp_http = tokio::net::TcpListener::bind((host.as_str(), http_port))
        .await
        .with_context(|| format!("cannot bind MCP HTTP port {http_port}"))?;
    let mcp_sse = tokio::net::TcpListener::bind((host.as_str(), sse_port))
        .await
        .with_context(|| format!("cannot bind MCP SSE port {sse_port}"))?;
    let web = tokio::net::TcpListener::bind((host.as_str(), port))
        .await
        .with_context(|| format!("cannot bind server port {port}"))?;

    let http_app = mcp::http_app(hub.clone());
    tokio::spawn(async move {
        if let Err(error) = axum::serve(mcp_http, http_app).await {
            tracing::error!(target = "chattr::serve", error = %error, "MCP HTTP server error");
        }
    });
    let sse_app = mcp::sse_app(hub.clone());
    tokio::spawn(async move {
        if let Err(error) = axum::serve(mcp_sse, sse_app).await {
            tracing::error!(target = "chattr::serve", error = %error, "MCP SSE server error");
        }
    });
    tokio::spawn(hub::run_presence_tick(hub.clone()));

    println!();
    println!("  agentchattr");
    println!("  Web UI:   http://{host}:{port}");
    println!("  MCP HTTP: http://{host}:{http_port}/mcp");
    println!("  MCP SSE:  http://{host}:{sse_port}/sse");
    println!("  Agents auto-trigger on @mention");
    println!();
    println!("  Session token: {access_token}");
    println!();

    axum::serve(web, server::app(hub))
        .await
        .context("hub server error")?;
    Ok(())
}
