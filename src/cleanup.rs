//! Stale multiplexer session reaper.
//!
//! Reaps `agentchattr-*` sessions whose wrapper lock is free: a live
//! session with a held lock belongs to a running wrapper (or to a wrapper
//! that will be restarted by an external watchdog) and is never touched —
//! killing it would end a conversation the agent is still serving.

use std::path::Path;

use anyhow::Result;

use chattr_core::config::Config;

use crate::{session, wrapper::agent_lock_is_free};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CleanupReport {
    pub killed: Vec<String>,
    pub kept: Vec<String>,
}

/// One reap pass. With `force` false, honors `cleanup.enabled` in config.
pub fn run_cleanup(config: &Config, force: bool) -> Result<CleanupReport> {
    let mut report = CleanupReport {
        killed: Vec::new(),
        kept: Vec::new(),
    };
    if !config.cleanup.enabled && !force {
        tracing::info!(
            target = "chattr::cleanup",
            "cleanup disabled in config (pass --force to override)"
        );
        return Ok(report);
    }

    let data_dir = Path::new(&config.server.data_dir);
    for session_name in session::list_sessions() {
        let Some(agent) = session_name.strip_prefix("agentchattr-") else {
            continue;
        };
        if !config.agents.contains_key(agent) {
            // Unknown agent: a manually created session, leave it alone.
            report.kept.push(session_name);
            continue;
        }
        if agent_lock_is_free(data_dir, agent) {
            tracing::info!(
                target = "chattr::cleanup",
                session = %session_name,
                "reaping session with no owning wrapper"
            );
            session::kill_session_by_name(&session_name)?;
            report.killed.push(session_name);
        } else {
            report.kept.push(session_name);
        }
    }
    Ok(report)
}
