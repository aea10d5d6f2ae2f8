//! The chat hub's HTTP/WebSocket surface.
//!
//! Axum router plus the auth middleware: every endpoint except the page
//! shell, uploads, and heartbeats requires the session token (query param
//! or `X-Session-Token`). Browser requests additionally pass the loopback
//! origin check. WebSocket clients that present a bad token are closed
//! with code 4003, which tells them to reload the page.

use std::sync::Arc;

use axum::{
    extract::{
        ws::{CloseFrame, Message as WsMessage, WebSocket},
        Multipart, Path as AxumPath, Query, State, WebSocketUpgrade,
    },
    http::StatusCode,
    middleware,
    response::{Html, IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::broadcast;

use chattr_core::{
    token::origin_allowed,
    types::{Attachment, DecisionStatus, NewMessage, PinStatus, RoomSettings},
    ChatError,
};

use crate::hub::Hub;

/// Close code asking the client to reload: it fell too far behind the
/// essential event stream and would otherwise miss messages.
const CLOSE_RELOAD: u16 = 4008;
/// Close code for a rejected session token.
const CLOSE_FORBIDDEN: u16 = 4003;

const ALLOWED_UPLOAD_EXTS: &[&str] = &[".png", ".jpg", ".jpeg", ".gif", ".webp", ".bmp", ".svg"];
const MAX_UPLOAD_BYTES: usize = 10 * 1024 * 1024;

pub fn app(hub: Arc<Hub>) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/ws", get(ws_upgrade))
        .route("/api/upload", post(upload))
        .route("/api/messages", get(get_messages))
        .route("/api/status", get(get_status))
        .route("/api/settings", get(get_settings))
        .route("/api/open-path", post(open_path))
        .route("/api/open-session/{agent}", post(open_session))
        .route("/api/heartbeat/{agent}", post(heartbeat))
        .route("/api/activity/{agent}", post(activity))
        .route("/api/leave/{agent}", post(leave))
        .route("/api/hat/{agent}", delete(delete_hat))
        .route("/uploads/{file}", get(serve_upload))
        .layer(middleware::from_fn_with_state(
            hub.clone(),
            auth_middleware,
        ))
        .with_state(hub)
}

// ---------------------------------------------------------------------------
// Auth middleware
// ---------------------------------------------------------------------------

async fn auth_middleware(
    State(hub): State<Arc<Hub>>,
    request: axum::http::Request<axum::body::Body>,
    next: middleware::Next,
) -> Result<Response, (StatusCode, Json<Value>)> {
    let path = request.uri().path();

    let origin = request
        .headers()
        .get("origin")
        .and_then(|value| value.to_str().ok());
    if !origin_allowed(origin) {
        return Err((
            StatusCode::FORBIDDEN,
            Json(json!({ "error": "forbidden: origin not allowed" })),
        ));
    }

    // The page shell injects the token client-side; uploads use random
    // names; heartbeats carry no readable state. The WebSocket handshake
    // is let through so the handler can close with 4003.
    let public = path == "/"
        || path == "/ws"
        || path.starts_with("/uploads/")
        || path.starts_with("/api/heartbeat/");
    if public {
        return Ok(next.run(request).await);
    }

    let header_token = request
        .headers()
        .get("x-session-token")
        .and_then(|value| value.to_str().ok());
    let query_token = request.uri().query().and_then(query_token_value);
    let provided = header_token.or(query_token.as_deref());

    if provided != Some(hub.token.as_str()) {
        return Err((
            StatusCode::FORBIDDEN,
            Json(json!({ "error": "forbidden: invalid or missing session token" })),
        ));
    }

    Ok(next.run(request).await)
}

fn query_token_value(query: &str) -> Option<String> {
    query.split('&').find_map(|pair| {
        pair.strip_prefix("token=").map(|value| {
            // Tokens are hex; percent-decoding is not needed.
            value.to_string()
        })
    })
}

// ---------------------------------------------------------------------------
// Page shell
// ---------------------------------------------------------------------------

async fn index(State(hub): State<Arc<Hub>>) -> Html<String> {
    // Minimal shell: the real client assets live outside the hub. Same-
    // origin policy keeps the interpolated token private to this tab.
    let page = format!(
        "<!doctype html><html><head><meta charset=\"utf-8\">\
<title>agentchattr</title>\
<script>window.__SESSION_TOKEN__=\"{}\";</script>\
</head><body><div id=\"app\"></div>\
<script src=\"/static/app.js\"></script></body></html>",
        hub.token
    );
    Html(page)
}

// ---------------------------------------------------------------------------
// WebSocket
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize, Default)]
struct WsQuery {
    #[serde(default)]
    token: String,
}

async fn ws_upgrade(
    ws: WebSocketUpgrade,
    Query(query): Query<WsQuery>,
    State(hub): State<Arc<Hub>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_ws(socket, hub, query.token))
}

async fn handle_ws(mut socket: WebSocket, hub: Arc<Hub>, token: String) {
    if token != hub.token {
        let _ = socket
            .send(WsMessage::Close(Some(CloseFrame {
                code: CLOSE_FORBIDDEN,
                reason: "forbidden: invalid session token".into(),
            })))
            .await;
        return;
    }

    // Subscribe before the snapshot so nothing falls in the gap.
    let mut essential_rx = hub.essential_tx.subscribe();
    let mut ephemeral_rx = hub.ephemeral_tx.subscribe();

    if send_snapshot(&mut socket, &hub).await.is_err() {
        return;
    }

    loop {
        tokio::select! {
            frame = essential_rx.recv() => {
                match frame {
                    Ok(frame) => {
                        if socket.send(WsMessage::Text(frame.into())).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        // This client can no longer be guaranteed every
                        // message; force a reload instead of a silent gap.
                        tracing::warn!(
                            target = "chattr::server",
                            missed,
                            "ws client lagged on essential events, closing"
                        );
                        let _ = socket
                            .send(WsMessage::Close(Some(CloseFrame {
                                code: CLOSE_RELOAD,
                                reason: "event stream lagged, reload".into(),
                            })))
                            .await;
                        break;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            frame = ephemeral_rx.recv() => {
                match frame {
                    Ok(frame) => {
                        if socket.send(WsMessage::Text(frame.into())).await.is_err() {
                            break;
                        }
                    }
                    // typing/status are disposable.
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(WsMessage::Text(raw))) => {
                        if let Err(error) = handle_client_frame(&hub, raw.as_str()) {
                            if error.is_user_visible() {
                                let notice = system_notice_frame(&error);
                                if socket.send(WsMessage::Text(notice.to_string().into())).await.is_err() {
                                    break;
                                }
                            } else {
                                tracing::warn!(target = "chattr::server", error = %error, "client frame failed");
                            }
                        }
                    }
                    Some(Ok(WsMessage::Close(_))) | None => break,
                    Some(Ok(_)) => continue,
                    Some(Err(_)) => break,
                }
            }
        }
    }
}

async fn send_snapshot(socket: &mut WebSocket, hub: &Arc<Hub>) -> Result<(), axum::Error> {
    let mut frames: Vec<Value> = vec![
        hub.settings_frame(),
        hub.agents_frame(),
        json!({ "type": "todos", "data": hub.store.pins() }),
        json!({ "type": "decisions", "data": hub.store.decisions() }),
        json!({ "type": "hats", "data": hub.hats.snapshot() }),
    ];

    // History across channels, interleaved in id order.
    let count = hub.store.settings().history_count();
    let mut history = Vec::new();
    for channel in hub.store.channels() {
        history.extend(hub.store.recent(Some(&channel), count));
    }
    history.sort_by_key(|m| m.id);
    frames.extend(
        history
            .into_iter()
            .map(|m| json!({ "type": "message", "data": m })),
    );
    frames.push(hub.status_frame());

    for frame in frames {
        socket
            .send(WsMessage::Text(frame.to_string().into()))
            .await?;
    }
    Ok(())
}

fn system_notice_frame(error: &ChatError) -> Value {
    // Sent only to the offending connection; never stored.
    json!({
        "type": "message",
        "data": {
            "sender": crate::hub::SYSTEM_SENDER,
            "text": error.to_string(),
            "type": "system",
            "time": chattr_core::types::now_display(),
            "channel": chattr_core::DEFAULT_CHANNEL,
        },
    })
}

fn handle_client_frame(hub: &Arc<Hub>, raw: &str) -> chattr_core::error::Result<()> {
    let event: Value = serde_json::from_str(raw)
        .map_err(|e| ChatError::validation(format!("unparseable frame: {e}")))?;
    let kind = event
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| ChatError::validation("frame missing type"))?;

    match kind {
        "message" => {
            let text = event
                .get("text")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let sender = event
                .get("sender")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| hub.store.settings().username);
            let channel = event
                .get("channel")
                .and_then(Value::as_str)
                .unwrap_or(chattr_core::DEFAULT_CHANNEL)
                .to_string();
            let reply_to = event.get("reply_to").and_then(Value::as_u64);
            let attachments: Vec<Attachment> = event
                .get("attachments")
                .cloned()
                .map(|v| serde_json::from_value(v).unwrap_or_default())
                .unwrap_or_default();
            hub.inbound_message(NewMessage {
                sender,
                text,
                kind: Default::default(),
                channel,
                reply_to,
                attachments,
            })?;
        }
        "delete" => {
            let ids: Vec<u64> = event
                .get("ids")
                .and_then(Value::as_array)
                .map(|arr| arr.iter().filter_map(Value::as_u64).collect())
                .unwrap_or_default();
            if !ids.is_empty() {
                let deleted = hub.store.delete(&ids)?;
                cleanup_deleted_uploads(hub, &deleted);
            }
        }
        "todo_add" => {
            if let Some(id) = event.get("id").and_then(Value::as_u64) {
                hub.store.set_pin(id, Some(PinStatus::Todo))?;
            }
        }
        "todo_toggle" => {
            if let Some(id) = event.get("id").and_then(Value::as_u64) {
                match hub.store.pin_status(id) {
                    Some(PinStatus::Todo) => {
                        hub.store.set_pin(id, Some(PinStatus::Done))?;
                    }
                    Some(PinStatus::Done) => {
                        hub.store.set_pin(id, Some(PinStatus::Todo))?;
                    }
                    None => {}
                }
            }
        }
        "todo_remove" => {
            if let Some(id) = event.get("id").and_then(Value::as_u64) {
                hub.store.set_pin(id, None)?;
            }
        }
        "decision_propose" => {
            let text = event
                .get("decision")
                .and_then(Value::as_str)
                .unwrap_or_default();
            let owner = event
                .get("owner")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| hub.store.settings().username);
            let reason = event.get("reason").and_then(Value::as_str);
            hub.store.propose_decision(text, &owner, reason)?;
        }
        "decision_approve" => {
            if let Some(id) = event.get("id").and_then(Value::as_u64) {
                hub.store.set_decision_status(id, DecisionStatus::Approved)?;
            }
        }
        "decision_unapprove" => {
            if let Some(id) = event.get("id").and_then(Value::as_u64) {
                hub.store.set_decision_status(id, DecisionStatus::Proposed)?;
            }
        }
        "decision_edit" => {
            if let Some(id) = event.get("id").and_then(Value::as_u64) {
                hub.store.edit_decision(
                    id,
                    event.get("decision").and_then(Value::as_str),
                    event.get("reason").and_then(Value::as_str),
                )?;
            }
        }
        "decision_delete" => {
            if let Some(id) = event.get("id").and_then(Value::as_u64) {
                hub.store.delete_decision(id)?;
            }
        }
        "update_settings" => {
            let data = event.get("data").cloned().unwrap_or(json!({}));
            apply_settings_update(hub, &data)?;
        }
        "channel_create" => {
            let name = normalized_name(&event, "name")?;
            hub.create_channel(&name)?;
        }
        "channel_rename" => {
            let old = normalized_name(&event, "old_name")?;
            let new = normalized_name(&event, "new_name")?;
            hub.rename_channel(&old, &new)?;
        }
        "channel_delete" => {
            let name = normalized_name(&event, "name")?;
            hub.delete_channel(&name)?;
        }
        other => {
            return Err(ChatError::validation(format!("unknown frame type '{other}'")));
        }
    }
    Ok(())
}

fn normalized_name(event: &Value, field: &str) -> chattr_core::error::Result<String> {
    event
        .get(field)
        .and_then(Value::as_str)
        .map(|name| name.trim().to_lowercase())
        .filter(|name| !name.is_empty())
        .ok_or_else(|| ChatError::validation(format!("missing {field}")))
}

fn apply_settings_update(hub: &Arc<Hub>, data: &Value) -> chattr_core::error::Result<()> {
    let mut settings: RoomSettings = hub.store.settings();
    if let Some(title) = data.get("title").and_then(Value::as_str) {
        let title = title.trim();
        settings.title = if title.is_empty() {
            "agentchattr".to_string()
        } else {
            title.to_string()
        };
    }
    if let Some(username) = data.get("username").and_then(Value::as_str) {
        let username = username.trim();
        settings.username = if username.is_empty() {
            "user".to_string()
        } else {
            username.to_string()
        };
    }
    if let Some(hops) = data.get("max_agent_hops").and_then(Value::as_u64) {
        let hops = (hops as u32).clamp(1, 50);
        settings.max_agent_hops = hops;
        hub.router.set_max_hops(hops);
    }
    if let Some(limit) = data.get("history_limit") {
        let normalized = match limit {
            Value::String(s) if s.trim().eq_ignore_ascii_case("all") => Some("all".to_string()),
            Value::String(s) => s.trim().parse::<u64>().ok().map(|n| n.clamp(1, 10_000).to_string()),
            Value::Number(n) => n.as_u64().map(|n| n.clamp(1, 10_000).to_string()),
            _ => None,
        };
        if let Some(normalized) = normalized {
            settings.history_limit = normalized;
        }
    }
    hub.store.update_settings(settings)?;
    Ok(())
}

/// Best-effort removal of upload files referenced only by deleted messages.
fn cleanup_deleted_uploads(hub: &Arc<Hub>, _deleted: &[u64]) {
    // Attachment files are content-addressed by random name and cheap to
    // keep; sweeping them is deferred to the cleanup command.
    let _ = hub;
}

// ---------------------------------------------------------------------------
// REST endpoints
// ---------------------------------------------------------------------------

async fn upload(
    State(hub): State<Arc<Hub>>,
    mut multipart: Multipart,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    while let Ok(Some(field)) = multipart.next_field().await {
        if field.name() != Some("file") {
            continue;
        }
        let original = field.file_name().unwrap_or("image.png").to_string();
        let ext = std::path::Path::new(&original)
            .extension()
            .map(|e| format!(".{}", e.to_string_lossy().to_lowercase()))
            .unwrap_or_else(|| ".png".to_string());
        if !ALLOWED_UPLOAD_EXTS.contains(&ext.as_str()) {
            return Err((
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": format!("unsupported file type: {ext}") })),
            ));
        }
        let bytes = field.bytes().await.map_err(|_| {
            (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": "upload read failed" })),
            )
        })?;
        if bytes.len() > MAX_UPLOAD_BYTES {
            return Err((
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": "file too large (max 10 MB)" })),
            ));
        }

        let upload_dir = hub.data_dir.join("uploads");
        std::fs::create_dir_all(&upload_dir).map_err(internal_error)?;
        let name = format!("{}{ext}", &uuid::Uuid::new_v4().simple().to_string()[..8]);
        let path = upload_dir.join(&name);
        std::fs::write(&path, &bytes).map_err(internal_error)?;

        return Ok(Json(json!({
            "name": original,
            "url": format!("/uploads/{name}"),
            "path": path.to_string_lossy(),
        })));
    }
    Err((
        StatusCode::BAD_REQUEST,
        Json(json!({ "error": "no file field" })),
    ))
}

fn internal_error(error: std::io::Error) -> (StatusCode, Json<Value>) {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": error.to_string() })),
    )
}

async fn serve_upload(
    State(hub): State<Arc<Hub>>,
    AxumPath(file): AxumPath<String>,
) -> Response {
    let upload_dir = hub.data_dir.join("uploads");
    let requested = upload_dir.join(&file);
    let Ok(resolved) = requested.canonicalize() else {
        return (StatusCode::NOT_FOUND, Json(json!({ "error": "not found" }))).into_response();
    };
    let Ok(base) = upload_dir.canonicalize() else {
        return (StatusCode::NOT_FOUND, Json(json!({ "error": "not found" }))).into_response();
    };
    if !resolved.starts_with(&base) {
        return (StatusCode::BAD_REQUEST, Json(json!({ "error": "invalid path" }))).into_response();
    }
    match tokio::fs::read(&resolved).await {
        Ok(bytes) => bytes.into_response(),
        Err(_) => (StatusCode::NOT_FOUND, Json(json!({ "error": "not found" }))).into_response(),
    }
}

#[derive(Debug, Deserialize)]
struct MessagesQuery {
    #[serde(default)]
    since_id: u64,
    #[serde(default = "default_limit")]
    limit: usize,
}

fn default_limit() -> usize {
    50
}

async fn get_messages(
    State(hub): State<Arc<Hub>>,
    Query(query): Query<MessagesQuery>,
) -> Json<Value> {
    let messages = if query.since_id > 0 {
        hub.store.since(query.since_id, None)
    } else {
        hub.store.recent(None, query.limit)
    };
    Json(json!(messages))
}

async fn get_status(State(hub): State<Arc<Hub>>) -> Json<Value> {
    Json(hub.status_frame()["data"].clone())
}

async fn get_settings(State(hub): State<Arc<Hub>>) -> Json<Value> {
    Json(hub.settings_frame()["data"].clone())
}

#[derive(Debug, Deserialize)]
struct OpenPathBody {
    path: String,
}

async fn open_path(
    State(_hub): State<Arc<Hub>>,
    Json(body): Json<OpenPathBody>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    if body.path.is_empty() {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "no path" })),
        ));
    }
    let path = std::path::Path::new(&body.path);
    if !path.exists() {
        return Err((
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "path not found" })),
        ));
    }

    let target = if path.is_file() {
        path.parent().unwrap_or(path)
    } else {
        path
    };
    let opener = if cfg!(target_os = "macos") {
        "open"
    } else {
        "xdg-open"
    };
    match std::process::Command::new(opener).arg(target).spawn() {
        Ok(_) => Ok(Json(json!({ "ok": true }))),
        Err(error) => Err((
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": error.to_string() })),
        )),
    }
}

async fn open_session(AxumPath(agent): AxumPath<String>) -> Json<Value> {
    // Best-effort: focus the agent's multiplexer session in an attached
    // client, if any.
    let name = crate::session::session_name(&agent);
    let ok = std::process::Command::new("tmux")
        .args(["switch-client", "-t", name.as_str()])
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false);
    Json(json!({ "ok": ok }))
}

async fn heartbeat(State(hub): State<Arc<Hub>>, AxumPath(agent): AxumPath<String>) -> Json<Value> {
    hub.touch_presence(&agent);
    Json(json!({ "ok": true }))
}

#[derive(Debug, Deserialize)]
struct ActivityBody {
    busy: bool,
}

async fn activity(
    State(hub): State<Arc<Hub>>,
    AxumPath(agent): AxumPath<String>,
    Json(body): Json<ActivityBody>,
) -> Json<Value> {
    hub.presence.set_busy(&agent, body.busy);
    hub.broadcast_typing(&agent, body.busy);
    hub.broadcast_status();
    Json(json!({ "ok": true }))
}

async fn leave(State(hub): State<Arc<Hub>>, AxumPath(agent): AxumPath<String>) -> Json<Value> {
    hub.presence.mark_offline(&agent);
    hub.post_leave(&agent);
    Json(json!({ "ok": true }))
}

async fn delete_hat(State(hub): State<Arc<Hub>>, AxumPath(agent): AxumPath<String>) -> Json<Value> {
    let removed = hub.hats.clear(&agent);
    if removed {
        hub.broadcast_hats();
    }
    Json(json!({ "ok": true }))
}
