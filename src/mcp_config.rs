//! MCP client auto-configuration.
//!
//! At wrapper startup the hub's MCP endpoints are written into the
//! agent's working directory so the wrapped CLI discovers them without
//! manual setup: `.mcp.json` (Claude), `.gemini/settings.json` (Gemini,
//! SSE transport), `.codex/config.toml` (Codex). Existing entries are
//! left untouched; a file we cannot parse is skipped with a warning
//! rather than clobbered.

use std::path::Path;

use anyhow::{Context, Result};
use serde_json::{json, Value};

pub const SERVER_NAME: &str = "agentchattr";

pub fn ensure_mcp_config(project_dir: &Path, http_port: u16, sse_port: u16) -> Result<()> {
    let http_url = format!("http://127.0.0.1:{http_port}/mcp");
    let sse_url = format!("http://127.0.0.1:{sse_port}/sse");

    ensure_json_entry(&project_dir.join(".mcp.json"), &http_url, "http")?;
    ensure_json_entry(
        &project_dir.join(".gemini").join("settings.json"),
        &sse_url,
        "sse",
    )?;
    ensure_codex_entry(&project_dir.join(".codex").join("config.toml"), &http_url)?;
    Ok(())
}

/// Add our server to a JSON MCP config file (Claude / Gemini shape).
fn ensure_json_entry(path: &Path, url: &str, transport: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("cannot create {}", parent.display()))?;
    }

    let mut data = if path.exists() {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("cannot read {}", path.display()))?;
        match serde_json::from_str::<Value>(&raw) {
            Ok(parsed) => parsed,
            Err(_) => {
                tracing::warn!(
                    target = "chattr::mcp_config",
                    path = %path.display(),
                    "existing file is not valid JSON, leaving it alone"
                );
                return Ok(());
            }
        }
    } else {
        json!({})
    };

    let Some(root) = data.as_object_mut() else {
        tracing::warn!(
            target = "chattr::mcp_config",
            path = %path.display(),
            "existing file is not a JSON object, leaving it alone"
        );
        return Ok(());
    };
    let servers = root.entry("mcpServers").or_insert_with(|| json!({}));
    let Some(servers) = servers.as_object_mut() else {
        tracing::warn!(
            target = "chattr::mcp_config",
            path = %path.display(),
            "mcpServers is not an object, leaving it alone"
        );
        return Ok(());
    };
    if servers.contains_key(SERVER_NAME) {
        return Ok(());
    }

    servers.insert(
        SERVER_NAME.to_string(),
        json!({ "type": transport, "url": url }),
    );
    let encoded = serde_json::to_string_pretty(&data).expect("config serializes");
    std::fs::write(path, format!("{encoded}\n"))
        .with_context(|| format!("cannot write {}", path.display()))?;
    tracing::info!(
        target = "chattr::mcp_config",
        path = %path.display(),
        url,
        "added MCP server entry"
    );
    Ok(())
}

/// Add our server to Codex's TOML config file. The file is treated as
/// opaque text: the section block is appended only when absent.
fn ensure_codex_entry(path: &Path, url: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("cannot create {}", parent.display()))?;
    }

    let section = format!("mcp_servers.{SERVER_NAME}");
    let existing = if path.exists() {
        std::fs::read_to_string(path).with_context(|| format!("cannot read {}", path.display()))?
    } else {
        String::new()
    };
    if existing.contains(&section) {
        return Ok(());
    }

    let block = format!("\n[{section}]\nurl = \"{url}\"\n");
    std::fs::write(path, format!("{existing}{block}"))
        .with_context(|| format!("cannot write {}", path.display()))?;
    tracing::info!(
        target = "chattr::mcp_config",
        path = %path.display(),
        url,
        "added MCP server entry"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_directory_gets_all_three_configs() {
        let dir = tempfile::tempdir().unwrap();
        ensure_mcp_config(dir.path(), 8200, 8201).unwrap();

        let claude: Value =
            serde_json::from_str(&std::fs::read_to_string(dir.path().join(".mcp.json")).unwrap())
                .unwrap();
        assert_eq!(
            claude["mcpServers"][SERVER_NAME]["url"],
            json!("http://127.0.0.1:8200/mcp")
        );
        assert_eq!(claude["mcpServers"][SERVER_NAME]["type"], json!("http"));

        let gemini: Value = serde_json::from_str(
            &std::fs::read_to_string(dir.path().join(".gemini").join("settings.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(
            gemini["mcpServers"][SERVER_NAME]["url"],
            json!("http://127.0.0.1:8201/sse")
        );
        assert_eq!(gemini["mcpServers"][SERVER_NAME]["type"], json!("sse"));

        let codex =
            std::fs::read_to_string(dir.path().join(".codex").join("config.toml")).unwrap();
        assert!(codex.contains("[mcp_servers.agentchattr]"));
        assert!(codex.contains("url = \"http://127.0.0.1:8200/mcp\""));
    }

    #[test]
    fn existing_servers_are_merged_not_clobbered() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(".mcp.json"),
            r#"{"mcpServers":{"other":{"type":"http","url":"http://example/mcp"}}}"#,
        )
        .unwrap();

        ensure_mcp_config(dir.path(), 8200, 8201).unwrap();

        let merged: Value =
            serde_json::from_str(&std::fs::read_to_string(dir.path().join(".mcp.json")).unwrap())
                .unwrap();
        assert!(merged["mcpServers"]["other"].is_object());
        assert!(merged["mcpServers"][SERVER_NAME].is_object());
    }

    #[test]
    fn second_run_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        ensure_mcp_config(dir.path(), 8200, 8201).unwrap();
        let first = std::fs::read_to_string(dir.path().join(".mcp.json")).unwrap();
        let first_codex =
            std::fs::read_to_string(dir.path().join(".codex").join("config.toml")).unwrap();

        ensure_mcp_config(dir.path(), 8200, 8201).unwrap();
        assert_eq!(
            std::fs::read_to_string(dir.path().join(".mcp.json")).unwrap(),
            first
        );
        assert_eq!(
            std::fs::read_to_string(dir.path().join(".codex").join("config.toml")).unwrap(),
            first_codex
        );
    }

    #[test]
    fn invalid_json_is_left_untouched() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(".mcp.json"), "{not json").unwrap();

        ensure_mcp_config(dir.path(), 8200, 8201).unwrap();
        assert_eq!(
            std::fs::read_to_string(dir.path().join(".mcp.json")).unwrap(),
            "{not json"
        );
    }

    #[test]
    fn codex_config_with_entry_is_not_duplicated() {
        let dir = tempfile::tempdir().unwrap();
        let codex_dir = dir.path().join(".codex");
        std::fs::create_dir_all(&codex_dir).unwrap();
        std::fs::write(
            codex_dir.join("config.toml"),
            "[mcp_servers.agentchattr]\nurl = \"http://127.0.0.1:9999/mcp\"\n",
        )
        .unwrap();

        ensure_mcp_config(dir.path(), 8200, 8201).unwrap();
        let codex = std::fs::read_to_string(codex_dir.join("config.toml")).unwrap();
        assert_eq!(codex.matches("mcp_servers.agentchattr").count(), 1);
    }
}
