//! Wrapper-side client for the hub: MCP tool calls over JSON-RPC, the
//! transport probes the health watcher counts, and the small REST
//! notifications (heartbeat, activity, leave).

use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::{json, Value};

/// Probes and tool calls never wait longer than this.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone)]
pub struct HubClient {
    mcp_url: String,
    sse_url: String,
    api_base: String,
    token: String,
    client: reqwest::Client,
}

impl HubClient {
    pub fn new(http_port: u16, sse_port: u16, server_port: u16, token: String) -> Self {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .expect("reqwest client");
        Self {
            mcp_url: format!("http://127.0.0.1:{http_port}/mcp"),
            sse_url: format!("http://127.0.0.1:{sse_port}/sse"),
            api_base: format!("http://127.0.0.1:{server_port}"),
            token,
            client,
        }
    }

    /// One MCP tool call. Returns the tool's text content.
    pub async fn call_tool(&self, tool: &str, arguments: Value) -> Result<String> {
        let payload = json!({
            "jsonrpc": "2.0",
            "id": format!("{tool}-call"),
            "method": "tools/call",
            "params": { "name": tool, "arguments": arguments },
        });
        let response = self
            .client
            .post(&self.mcp_url)
            .header("X-Session-Token", &self.token)
            .json(&payload)
            .send()
            .await
            .with_context(|| format!("MCP tool {tool} unreachable"))?;
        let status = response.status();
        let body: Value = response
            .json()
            .await
            .with_context(|| format!("MCP tool {tool} returned a non-JSON body"))?;
        if !status.is_success() {
            anyhow::bail!("MCP tool {tool} failed with HTTP {status}");
        }
        if let Some(error) = body.get("error") {
            anyhow::bail!("MCP tool {tool} error: {error}");
        }
        Ok(body
            .pointer("/result/content/0/text")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string())
    }

    pub async fn announce_join(&self, agent: &str) -> Result<()> {
        let reply = self
            .call_tool("chat_join", json!({ "name": agent }))
            .await?;
        if !reply.contains("Joined") {
            tracing::warn!(
                target = "chattr::wrapper",
                agent,
                reply,
                "unexpected chat_join response"
            );
        }
        Ok(())
    }

    /// Presence heartbeat. Any tool call refreshes `last_seen`; `chat_who`
    /// is the cheapest.
    pub async fn heartbeat(&self, agent: &str) -> Result<()> {
        self.call_tool("chat_who", json!({ "sender": agent })).await?;
        Ok(())
    }

    pub async fn post_system_message(&self, text: &str, channel: &str) -> Result<()> {
        self.call_tool(
            "chat_send",
            json!({ "sender": "system", "message": text, "channel": channel }),
        )
        .await?;
        Ok(())
    }

    /// HTTP transport probe: a real tools/call round-trip.
    pub async fn probe_http(&self) -> bool {
        self.call_tool("chat_who", json!({})).await.is_ok()
    }

    /// SSE transport probe: the stream endpoint must accept a connection.
    /// Headers only; the body is an endless event stream.
    pub async fn probe_sse(&self) -> bool {
        let request = self
            .client
            .get(&self.sse_url)
            .header("Accept", "text/event-stream")
            .query(&[("token", self.token.as_str())]);
        match request.send().await {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        }
    }

    // --- hub REST notifications ---

    pub async fn notify_activity(&self, agent: &str, busy: bool) -> Result<()> {
        self.client
            .post(format!("{}/api/activity/{agent}", self.api_base))
            .header("X-Session-Token", &self.token)
            .json(&json!({ "busy": busy }))
            .send()
            .await
            .context("activity notification failed")?
            .error_for_status()
            .context("activity notification rejected")?;
        Ok(())
    }

    pub async fn notify_heartbeat(&self, agent: &str) -> Result<()> {
        self.client
            .post(format!("{}/api/heartbeat/{agent}", self.api_base))
            .send()
            .await
            .context("heartbeat failed")?;
        Ok(())
    }

    pub async fn announce_leave(&self, agent: &str) -> Result<()> {
        self.client
            .post(format!("{}/api/leave/{agent}", self.api_base))
            .header("X-Session-Token", &self.token)
            .send()
            .await
            .context("leave notification failed")?;
        Ok(())
    }
}
