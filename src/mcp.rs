//! MCP bridge: the tool surface agents use to participate in chat.
//!
//! Two transports for CLI compatibility, both token-authenticated:
//! streamable HTTP JSON-RPC on `mcp.http_port` (POST /mcp) and SSE on
//! `mcp.sse_port` (GET /sse handing out a per-session POST /messages
//! endpoint). Every tool call refreshes the caller's presence; the first
//! call after an offline stretch synthesizes the `join`.

use std::{collections::HashMap, sync::Arc};

use axum::{
    extract::{Query, State},
    http::StatusCode,
    middleware,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use chattr_core::{
    types::{Attachment, ChatMessage, DecisionStatus, NewMessage},
    ChatError,
};

use crate::hub::Hub;

const INSTRUCTIONS: &str = "agentchattr — a shared chat room for coordinating development \
between AI agents and humans. Use chat_send to post, chat_read to catch up, chat_join when \
your session starts. Always use your own name as the sender.";

const IMAGE_EXTS: &[&str] = &[".png", ".jpg", ".jpeg", ".gif", ".webp", ".bmp"];

struct SseSessions {
    senders: Mutex<HashMap<String, mpsc::Sender<String>>>,
}

/// Unregisters the session when its event stream is dropped, so probe
/// connections and departed clients never pile up in the session table.
struct SseSessionGuard {
    sessions: Arc<SseSessions>,
    session_id: String,
}

impl Drop for SseSessionGuard {
    fn drop(&mut self) {
        self.sessions.senders.lock().remove(&self.session_id);
        tracing::debug!(
            target = "chattr::mcp",
            session_id = %self.session_id,
            "sse session closed"
        );
    }
}

#[derive(Clone)]
struct McpState {
    hub: Arc<Hub>,
    sse: Arc<SseSessions>,
}

/// Router served on the streamable-HTTP port.
pub fn http_app(hub: Arc<Hub>) -> Router {
    let state = McpState {
        hub: hub.clone(),
        sse: Arc::new(SseSessions {
            senders: Mutex::new(HashMap::new()),
        }),
    };
    Router::new()
        .route("/mcp", post(handle_rpc))
        .layer(middleware::from_fn_with_state(hub, token_middleware))
        .with_state(state)
}

/// Router served on the SSE port.
pub fn sse_app(hub: Arc<Hub>) -> Router {
    let state = McpState {
        hub: hub.clone(),
        sse: Arc::new(SseSessions {
            senders: Mutex::new(HashMap::new()),
        }),
    };
    Router::new()
        .route("/sse", get(handle_sse))
        .route("/messages", post(handle_sse_rpc))
        .layer(middleware::from_fn_with_state(hub, token_middleware))
        .with_state(state)
}

async fn token_middleware(
    State(hub): State<Arc<Hub>>,
    request: axum::http::Request<axum::body::Body>,
    next: middleware::Next,
) -> Result<Response, (StatusCode, Json<Value>)> {
    let header_token = request
        .headers()
        .get("x-session-token")
        .and_then(|value| value.to_str().ok());
    let query_token = request.uri().query().and_then(|query| {
        query
            .split('&')
            .find_map(|pair| pair.strip_prefix("token=").map(str::to_string))
    });
    if header_token.or(query_token.as_deref()) != Some(hub.token.as_str()) {
        return Err((
            StatusCode::FORBIDDEN,
            Json(json!({ "error": "forbidden: invalid or missing session token" })),
        ));
    }
    Ok(next.run(request).await)
}

// ---------------------------------------------------------------------------
// JSON-RPC plumbing
// ---------------------------------------------------------------------------

async fn handle_rpc(State(state): State<McpState>, Json(request): Json<Value>) -> Json<Value> {
    Json(dispatch_rpc(&state.hub, &request))
}

#[derive(Debug, Deserialize)]
struct SseRpcQuery {
    #[serde(default)]
    session_id: String,
}

/// SSE transport: responses travel back over the event stream; the POST
/// itself just acknowledges receipt.
async fn handle_sse_rpc(
    State(state): State<McpState>,
    Query(query): Query<SseRpcQuery>,
    Json(request): Json<Value>,
) -> Response {
    let response = dispatch_rpc(&state.hub, &request);
    let sender = state.sse.senders.lock().get(&query.session_id).cloned();
    match sender {
        Some(sender) => {
            let _ = sender.send(response.to_string()).await;
            StatusCode::ACCEPTED.into_response()
        }
        // Unknown session: hand the response back directly rather than
        // dropping it.
        None => Json(response).into_response(),
    }
}

async fn handle_sse(State(state): State<McpState>) -> Sse<impl futures_util::Stream<Item = Result<Event, std::convert::Infallible>>> {
    let session_id = uuid::Uuid::new_v4().simple().to_string();
    let (tx, rx) = mpsc::channel::<String>(64);
    state.sse.senders.lock().insert(session_id.clone(), tx);
    tracing::debug!(target = "chattr::mcp", session_id = %session_id, "sse session opened");

    // The guard travels with the stream state; dropping the stream (client
    // gone, probe finished) removes the session from the table.
    let guard = SseSessionGuard {
        sessions: state.sse.clone(),
        session_id: session_id.clone(),
    };
    let endpoint = format!("/messages?session_id={session_id}");
    let stream = futures_util::stream::unfold(
        (rx, Some(endpoint), guard),
        |(mut rx, endpoint, guard)| async move {
            if let Some(endpoint) = endpoint {
                let event = Event::default().event("endpoint").data(endpoint);
                return Some((Ok(event), (rx, None, guard)));
            }
            let payload = rx.recv().await?;
            Some((
                Ok(Event::default().event("message").data(payload)),
                (rx, None, guard),
            ))
        },
    );
    Sse::new(stream).keep_alive(KeepAlive::default())
}

fn dispatch_rpc(hub: &Arc<Hub>, request: &Value) -> Value {
    let id = request.get("id").cloned().unwrap_or(Value::Null);
    let method = request.get("method").and_then(Value::as_str).unwrap_or("");
    let params = request.get("params").cloned().unwrap_or(json!({}));

    match method {
        "initialize" => rpc_result(
            id,
            json!({
                "protocolVersion": "2024-11-05",
                "serverInfo": { "name": "agentchattr", "version": env!("CARGO_PKG_VERSION") },
                "capabilities": { "tools": {} },
                "instructions": INSTRUCTIONS,
            }),
        ),
        "notifications/initialized" | "initialized" => rpc_result(id, json!({})),
        "tools/list" => rpc_result(id, json!({ "tools": tool_descriptors() })),
        "tools/call" => {
            let tool = params.get("name").and_then(Value::as_str).unwrap_or("");
            let arguments = params.get("arguments").cloned().unwrap_or(json!({}));
            let text = call_tool(hub, tool, &arguments);
            rpc_result(
                id,
                json!({
                    "content": [{ "type": "text", "text": text }],
                    "isError": false,
                }),
            )
        }
        other => json!({
            "jsonrpc": "2.0",
            "id": id,
            "error": { "code": -32601, "message": format!("unknown method '{other}'") },
        }),
    }
}

fn rpc_result(id: Value, result: Value) -> Value {
    json!({ "jsonrpc": "2.0", "id": id, "result": result })
}

fn tool_descriptors() -> Vec<Value> {
    let text_prop = |desc: &str| json!({ "type": "string", "description": desc });
    vec![
        json!({
            "name": "chat_send",
            "description": "Send a message to the chat. Use your own name as sender. \
Optionally attach a local image (absolute path) or reply to a message id.",
            "inputSchema": { "type": "object", "properties": {
                "sender": text_prop("your agent name"),
                "message": text_prop("message text"),
                "channel": text_prop("channel name (default general)"),
                "image_path": text_prop("absolute path of an image to attach"),
                "reply_to": { "type": "integer", "description": "message id to reply to" },
            }, "required": ["sender", "message"] },
        }),
        json!({
            "name": "chat_read",
            "description": "Read chat messages. With sender set, successive calls return \
only new messages since your last read.",
            "inputSchema": { "type": "object", "properties": {
                "sender": text_prop("your agent name (enables the cursor)"),
                "channel": text_prop("restrict to one channel"),
                "since_id": { "type": "integer", "description": "override: read from this id" },
                "limit": { "type": "integer", "description": "max messages (default 20)" },
            } },
        }),
        json!({
            "name": "chat_resync",
            "description": "Full-context fetch: latest messages, and the read cursor resets.",
            "inputSchema": { "type": "object", "properties": {
                "sender": text_prop("your agent name"),
                "channel": text_prop("restrict to one channel"),
                "limit": { "type": "integer", "description": "max messages (default 50)" },
            }, "required": ["sender"] },
        }),
        json!({
            "name": "chat_join",
            "description": "Announce that you've connected.",
            "inputSchema": { "type": "object", "properties": {
                "name": text_prop("your agent name"),
            }, "required": ["name"] },
        }),
        json!({
            "name": "chat_who",
            "description": "Check who's currently online.",
            "inputSchema": { "type": "object", "properties": {
                "sender": text_prop("your agent name (refreshes presence)"),
            } },
        }),
        json!({
            "name": "chat_decision",
            "description": "Work with the shared decision list: propose, approve, \
unapprove, edit, delete, or list.",
            "inputSchema": { "type": "object", "properties": {
                "sender": text_prop("your agent name"),
                "action": text_prop("propose | approve | unapprove | edit | delete | list"),
                "decision": text_prop("decision text (max 80 chars)"),
                "reason": text_prop("optional reason (max 80 chars)"),
                "id": { "type": "integer", "description": "decision id for approve/edit/delete" },
            }, "required": ["sender", "action"] },
        }),
        json!({
            "name": "chat_channels",
            "description": "List the chat channels, or create a new one.",
            "inputSchema": { "type": "object", "properties": {
                "sender": text_prop("your agent name"),
                "action": text_prop("list (default) | create"),
                "name": text_prop("channel name for create"),
            } },
        }),
        json!({
            "name": "chat_set_hat",
            "description": "Wear an SVG hat on your avatar (max 5KB, sanitized).",
            "inputSchema": { "type": "object", "properties": {
                "sender": text_prop("your agent name"),
                "svg": text_prop("<svg ...>...</svg>"),
            }, "required": ["sender", "svg"] },
        }),
    ]
}

// ---------------------------------------------------------------------------
// Tool dispatch
// ---------------------------------------------------------------------------

fn arg_str<'a>(args: &'a Value, key: &str) -> &'a str {
    args.get(key).and_then(Value::as_str).unwrap_or("")
}

fn call_tool(hub: &Arc<Hub>, tool: &str, args: &Value) -> String {
    // Any tool call is a liveness signal for its sender. chat_join
    // announces explicitly, so it manages presence itself.
    if tool != "chat_join" {
        let sender = arg_str(args, "sender");
        if !sender.is_empty() {
            hub.touch_presence(sender);
        }
    }

    let result = match tool {
        "chat_send" => tool_send(hub, args),
        "chat_read" => tool_read(hub, args),
        "chat_resync" => tool_resync(hub, args),
        "chat_join" => tool_join(hub, args),
        "chat_who" => Ok(online_line(hub)),
        "chat_decision" => tool_decision(hub, args),
        "chat_channels" => tool_channels(hub, args),
        "chat_set_hat" => tool_set_hat(hub, args),
        other => Err(ChatError::validation(format!("unknown tool '{other}'"))),
    };

    match result {
        Ok(text) => text,
        Err(error) => format!("Error: {error}"),
    }
}

fn tool_send(hub: &Arc<Hub>, args: &Value) -> Result<String, ChatError> {
    let sender = arg_str(args, "sender");
    let message = arg_str(args, "message").trim();
    let channel = match arg_str(args, "channel") {
        "" => chattr_core::DEFAULT_CHANNEL,
        channel => channel,
    };
    let image_path = arg_str(args, "image_path");
    let reply_to = args
        .get("reply_to")
        .and_then(Value::as_i64)
        .filter(|id| *id >= 0)
        .map(|id| id as u64);

    if sender.is_empty() {
        return Err(ChatError::validation("sender is required"));
    }
    if message.is_empty() && image_path.is_empty() {
        return Ok("Empty message, not sent.".to_string());
    }

    let mut attachments = Vec::new();
    if !image_path.is_empty() {
        attachments.push(import_image(hub, image_path)?);
    }

    if let Some(parent) = reply_to {
        if hub.store.get(parent).is_none() {
            return Ok(format!("Message #{parent} not found."));
        }
    }

    let stored = hub.inbound_message(NewMessage {
        sender: sender.to_string(),
        text: message.to_string(),
        kind: Default::default(),
        channel: channel.to_string(),
        reply_to,
        attachments,
    })?;
    Ok(match stored {
        Some(msg) => format!("Sent (id={})", msg.id),
        None => "Ok.".to_string(),
    })
}

/// Copy a local image into the uploads directory and return the
/// attachment record.
fn import_image(hub: &Arc<Hub>, image_path: &str) -> Result<Attachment, ChatError> {
    let src = std::path::Path::new(image_path);
    if !src.exists() {
        return Err(ChatError::validation(format!("image not found: {image_path}")));
    }
    let ext = src
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy().to_lowercase()))
        .unwrap_or_default();
    if !IMAGE_EXTS.contains(&ext.as_str()) {
        return Err(ChatError::validation(format!("unsupported image type: {ext}")));
    }
    let upload_dir = hub.data_dir.join("uploads");
    std::fs::create_dir_all(&upload_dir)?;
    let name = format!("{}{ext}", &uuid::Uuid::new_v4().simple().to_string()[..8]);
    std::fs::copy(src, upload_dir.join(&name))?;
    Ok(Attachment {
        path: Some(upload_dir.join(&name).to_string_lossy().into_owned()),
        name: src
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| name.clone()),
        url: format!("/uploads/{name}"),
    })
}

fn tool_read(hub: &Arc<Hub>, args: &Value) -> Result<String, ChatError> {
    let sender = arg_str(args, "sender");
    let channel = match arg_str(args, "channel") {
        "" => None,
        channel => Some(channel.to_string()),
    };
    let since_id = args.get("since_id").and_then(Value::as_u64).unwrap_or(0);
    let limit = args.get("limit").and_then(Value::as_u64).unwrap_or(20) as usize;

    let msgs = if since_id > 0 {
        hub.store.since(since_id, channel.as_deref())
    } else if !sender.is_empty() {
        let cursor = hub.cursors.get(sender, channel.as_deref());
        if cursor > 0 {
            hub.store.since(cursor, channel.as_deref())
        } else {
            hub.store.recent(channel.as_deref(), limit)
        }
    } else {
        hub.store.recent(channel.as_deref(), limit)
    };

    let skip = msgs.len().saturating_sub(limit);
    let msgs = &msgs[skip..];
    update_cursor(hub, sender, channel.as_deref(), msgs);
    Ok(serialize_messages(msgs))
}

fn tool_resync(hub: &Arc<Hub>, args: &Value) -> Result<String, ChatError> {
    let sender = arg_str(args, "sender").trim();
    if sender.is_empty() {
        return Err(ChatError::validation("sender is required for chat_resync"));
    }
    let channel = match arg_str(args, "channel") {
        "" => None,
        channel => Some(channel.to_string()),
    };
    let limit = args.get("limit").and_then(Value::as_u64).unwrap_or(50) as usize;
    let msgs = hub.store.recent(channel.as_deref(), limit);
    update_cursor(hub, sender, channel.as_deref(), &msgs);
    Ok(serialize_messages(&msgs))
}

fn update_cursor(hub: &Arc<Hub>, sender: &str, channel: Option<&str>, msgs: &[ChatMessage]) {
    if let (false, Some(last)) = (sender.is_empty(), msgs.last()) {
        hub.cursors.set(sender, channel, last.id);
    }
}

fn serialize_messages(msgs: &[ChatMessage]) -> String {
    if msgs.is_empty() {
        return "No new messages.".to_string();
    }
    let entries: Vec<Value> = msgs
        .iter()
        .map(|m| {
            let mut entry = json!({
                "id": m.id,
                "sender": m.sender,
                "text": m.text,
                "type": m.kind,
                "time": m.time,
                "channel": m.channel,
            });
            if !m.attachments.is_empty() {
                entry["attachments"] = json!(m.attachments);
            }
            if let Some(reply_to) = m.reply_to {
                entry["reply_to"] = json!(reply_to);
            }
            entry
        })
        .collect();
    serde_json::to_string_pretty(&entries).expect("messages serialize")
}

fn tool_join(hub: &Arc<Hub>, args: &Value) -> Result<String, ChatError> {
    let name = arg_str(args, "name");
    if name.is_empty() {
        return Err(ChatError::validation("name is required"));
    }
    // Direct presence touch: the join line below is the announcement, so
    // the generic came-online synthesis must not add a second one.
    hub.presence.touch(name);
    hub.store.append(
        NewMessage::new(name, format!("{name} connected"))
            .with_kind(chattr_core::types::MessageKind::Join),
    )?;
    hub.broadcast_status();
    Ok(format!("Joined. {}", online_line(hub)))
}

fn online_line(hub: &Arc<Hub>) -> String {
    let snapshot = hub.presence.snapshot();
    let mut online: Vec<&str> = snapshot
        .iter()
        .filter(|(_, p)| p.online)
        .map(|(name, _)| name.as_str())
        .collect();
    online.sort_unstable();
    if online.is_empty() {
        "Nobody online.".to_string()
    } else {
        format!("Online: {}", online.join(", "))
    }
}

fn tool_decision(hub: &Arc<Hub>, args: &Value) -> Result<String, ChatError> {
    let sender = arg_str(args, "sender");
    let action = arg_str(args, "action");
    let id = args.get("id").and_then(Value::as_u64);
    match action {
        "propose" => {
            let text = arg_str(args, "decision");
            let reason = match arg_str(args, "reason") {
                "" => None,
                reason => Some(reason),
            };
            let decision = hub.store.propose_decision(text, sender, reason)?;
            Ok(format!("Decision #{} proposed.", decision.id))
        }
        "approve" | "unapprove" => {
            let id = id.ok_or_else(|| ChatError::validation("id is required"))?;
            let status = if action == "approve" {
                DecisionStatus::Approved
            } else {
                DecisionStatus::Proposed
            };
            let decision = hub.store.set_decision_status(id, status)?;
            Ok(format!("Decision #{} {}d.", decision.id, action))
        }
        "edit" => {
            let id = id.ok_or_else(|| ChatError::validation("id is required"))?;
            let text = match arg_str(args, "decision") {
                "" => None,
                text => Some(text),
            };
            let reason = match arg_str(args, "reason") {
                "" => None,
                reason => Some(reason),
            };
            let decision = hub.store.edit_decision(id, text, reason)?;
            Ok(format!("Decision #{} updated.", decision.id))
        }
        "delete" => {
            let id = id.ok_or_else(|| ChatError::validation("id is required"))?;
            hub.store.delete_decision(id)?;
            Ok(format!("Decision #{id} deleted."))
        }
        "list" | "" => {
            let decisions = hub.store.decisions();
            if decisions.is_empty() {
                Ok("No decisions yet.".to_string())
            } else {
                Ok(serde_json::to_string_pretty(&decisions).expect("decisions serialize"))
            }
        }
        other => Err(ChatError::validation(format!(
            "unknown decision action '{other}'"
        ))),
    }
}

fn tool_channels(hub: &Arc<Hub>, args: &Value) -> Result<String, ChatError> {
    match arg_str(args, "action") {
        "create" => {
            let name = arg_str(args, "name").trim().to_lowercase();
            hub.create_channel(&name)?;
            Ok(format!("Channel #{name} created."))
        }
        "list" | "" => {
            let channels = hub.store.channels();
            Ok(serde_json::to_string(&channels).expect("channels serialize"))
        }
        other => Err(ChatError::validation(format!(
            "unknown channels action '{other}'"
        ))),
    }
}

fn tool_set_hat(hub: &Arc<Hub>, args: &Value) -> Result<String, ChatError> {
    let sender = arg_str(args, "sender");
    if sender.is_empty() {
        return Err(ChatError::validation("sender is required"));
    }
    hub.hats.set(sender, arg_str(args, "svg"))?;
    hub.broadcast_hats();
    Ok("Hat updated.".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chattr_core::config::Config;

    fn test_hub() -> (Arc<Hub>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::parse(
            "[agents.claude]\ncommand = \"claude\"\n[agents.codex]\ncommand = \"codex\"\n[agents.gemini]\ncommand = \"gemini\"\n",
        )
        .unwrap();
        let hub = Hub::new(config, dir.path(), "secret".to_string()).unwrap();
        (hub, dir)
    }

    #[test]
    fn send_then_read_with_cursor() {
        let (hub, _dir) = test_hub();
        let reply = call_tool(
            &hub,
            "chat_send",
            &json!({ "sender": "claude", "message": "hello room" }),
        );
        assert!(reply.starts_with("Sent (id="), "{reply}");

        // First read returns context; second returns nothing new.
        let first = call_tool(&hub, "chat_read", &json!({ "sender": "codex" }));
        assert!(first.contains("hello room"));
        let second = call_tool(&hub, "chat_read", &json!({ "sender": "codex" }));
        assert_eq!(second, "No new messages.");

        // New message shows up on the next read.
        call_tool(
            &hub,
            "chat_send",
            &json!({ "sender": "claude", "message": "more" }),
        );
        let third = call_tool(&hub, "chat_read", &json!({ "sender": "codex" }));
        assert!(third.contains("more"));
        assert!(!third.contains("hello room"));
    }

    #[test]
    fn resync_resets_the_cursor() {
        let (hub, _dir) = test_hub();
        call_tool(
            &hub,
            "chat_send",
            &json!({ "sender": "claude", "message": "first" }),
        );
        call_tool(&hub, "chat_read", &json!({ "sender": "codex" }));
        let resynced = call_tool(&hub, "chat_resync", &json!({ "sender": "codex" }));
        assert!(resynced.contains("first"));
    }

    #[test]
    fn read_scopes_by_channel() {
        let (hub, _dir) = test_hub();
        hub.create_channel("dev").unwrap();
        call_tool(
            &hub,
            "chat_send",
            &json!({ "sender": "claude", "message": "in dev", "channel": "dev" }),
        );
        call_tool(
            &hub,
            "chat_send",
            &json!({ "sender": "claude", "message": "in general" }),
        );
        let dev_only = call_tool(
            &hub,
            "chat_read",
            &json!({ "sender": "codex", "channel": "dev" }),
        );
        assert!(dev_only.contains("in dev"));
        assert!(!dev_only.contains("in general"));
    }

    #[test]
    fn join_announces_once() {
        let (hub, _dir) = test_hub();
        let reply = call_tool(&hub, "chat_join", &json!({ "name": "claude" }));
        assert!(reply.starts_with("Joined."));
        assert!(reply.contains("claude"));
        let joins: Vec<_> = hub
            .store
            .recent(None, 50)
            .into_iter()
            .filter(|m| m.kind == chattr_core::types::MessageKind::Join)
            .collect();
        assert_eq!(joins.len(), 1);
    }

    #[test]
    fn offline_agent_tool_call_synthesizes_one_join() {
        let (hub, _dir) = test_hub();
        // Agent reads while offline: presence flips online, one join.
        call_tool(&hub, "chat_read", &json!({ "sender": "gemini" }));
        call_tool(&hub, "chat_read", &json!({ "sender": "gemini" }));
        let joins: Vec<_> = hub
            .store
            .recent(None, 50)
            .into_iter()
            .filter(|m| m.kind == chattr_core::types::MessageKind::Join)
            .collect();
        assert_eq!(joins.len(), 1);
        assert_eq!(joins[0].sender, "gemini");
    }

    #[test]
    fn reply_to_missing_message_reports_not_found() {
        let (hub, _dir) = test_hub();
        let reply = call_tool(
            &hub,
            "chat_send",
            &json!({ "sender": "claude", "message": "re", "reply_to": 42 }),
        );
        assert_eq!(reply, "Message #42 not found.");
    }

    #[test]
    fn empty_message_is_not_sent() {
        let (hub, _dir) = test_hub();
        let reply = call_tool(
            &hub,
            "chat_send",
            &json!({ "sender": "claude", "message": "   " }),
        );
        assert_eq!(reply, "Empty message, not sent.");
        assert!(hub.store.recent(None, 10).iter().all(|m| m.kind != Default::default()));
    }

    #[test]
    fn decision_tool_round_trip() {
        let (hub, _dir) = test_hub();
        let reply = call_tool(
            &hub,
            "chat_decision",
            &json!({ "sender": "claude", "action": "propose", "decision": "ship it" }),
        );
        assert!(reply.contains("proposed"));
        let listing = call_tool(
            &hub,
            "chat_decision",
            &json!({ "sender": "claude", "action": "list" }),
        );
        assert!(listing.contains("ship it"));
        let reply = call_tool(
            &hub,
            "chat_decision",
            &json!({ "sender": "user", "action": "approve", "id": 0 }),
        );
        assert!(reply.contains("approved"), "{reply}");
        let oversized = "x".repeat(81);
        let reply = call_tool(
            &hub,
            "chat_decision",
            &json!({ "sender": "claude", "action": "propose", "decision": oversized }),
        );
        assert!(reply.starts_with("Error:"));
    }

    #[test]
    fn channels_tool_lists_and_creates() {
        let (hub, _dir) = test_hub();
        let listing = call_tool(&hub, "chat_channels", &json!({ "sender": "claude" }));
        assert_eq!(listing, "[\"general\"]");
        let reply = call_tool(
            &hub,
            "chat_channels",
            &json!({ "sender": "claude", "action": "create", "name": "dev" }),
        );
        assert!(reply.contains("created"));
        assert!(hub.store.has_channel("dev"));
    }

    #[test]
    fn hat_tool_validates() {
        let (hub, _dir) = test_hub();
        let reply = call_tool(
            &hub,
            "chat_set_hat",
            &json!({ "sender": "claude", "svg": "<svg></svg>" }),
        );
        assert_eq!(reply, "Hat updated.");
        let reply = call_tool(
            &hub,
            "chat_set_hat",
            &json!({ "sender": "claude", "svg": "nope" }),
        );
        assert!(reply.starts_with("Error:"));
    }

    #[test]
    fn sse_guard_unregisters_session_on_drop() {
        let sessions = Arc::new(SseSessions {
            senders: Mutex::new(HashMap::new()),
        });
        let (tx, _rx) = mpsc::channel::<String>(1);
        sessions.senders.lock().insert("s1".to_string(), tx);
        {
            let _guard = SseSessionGuard {
                sessions: sessions.clone(),
                session_id: "s1".to_string(),
            };
        }
        assert!(sessions.senders.lock().is_empty());
    }

    #[test]
    fn rpc_initialize_and_tools_list() {
        let (hub, _dir) = test_hub();
        let response = dispatch_rpc(
            &hub,
            &json!({ "jsonrpc": "2.0", "id": 1, "method": "initialize", "params": {} }),
        );
        assert_eq!(response["result"]["serverInfo"]["name"], "agentchattr");

        let response = dispatch_rpc(
            &hub,
            &json!({ "jsonrpc": "2.0", "id": 2, "method": "tools/list" }),
        );
        let tools = response["result"]["tools"].as_array().unwrap();
        let names: Vec<&str> = tools
            .iter()
            .map(|t| t["name"].as_str().unwrap())
            .collect();
        assert_eq!(
            names,
            vec![
                "chat_send",
                "chat_read",
                "chat_resync",
                "chat_join",
                "chat_who",
                "chat_decision",
                "chat_channels",
                "chat_set_hat",
            ]
        );
    }

    #[test]
    fn rpc_tool_call_returns_text_content() {
        let (hub, _dir) = test_hub();
        let response = dispatch_rpc(
            &hub,
            &json!({
                "jsonrpc": "2.0",
                "id": "who-call",
                "method": "tools/call",
                "params": { "name": "chat_who", "arguments": {} },
            }),
        );
        assert_eq!(
            response["result"]["content"][0]["text"],
            json!("Nobody online.")
        );
    }
}
