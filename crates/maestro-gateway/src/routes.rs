//! HTTP routes and the WebSocket endpoint.
//!
//! Everything under `/api` except the health check requires a valid access
//! token plus the mobile client header; `/auth` is public during pairing.
//! The WebSocket upgrade is authenticated before the 101 handshake
//! completes.

use std::sync::Arc;
use std::time::Instant;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::{Request, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::Engine;
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use maestro_core::protocol::{ClientMessage, ServerEvent};
use maestro_core::{AgentSession, SessionSource, SessionStatus};
use maestro_monitor::SessionRegistry;
use serde::Deserialize;
use serde_json::{json, Value};
use tower_http::cors::CorsLayer;
use tracing::debug;
use uuid::Uuid;

use crate::auth::pairing::DEFAULT_PAIRING_WINDOW;
use crate::auth::token::DEFAULT_TOKEN_TTL;
use crate::auth::AuthService;
use crate::spaces::{SpaceCache, SpaceCommand, VALID_TAB_KINDS};
use crate::terminal::TerminalBridge;
use crate::ws::WsManager;

/// Required on every protected request; browsers will not send it
/// cross-origin, which keeps malicious pages away from the local port.
pub const CLIENT_HEADER: &str = "X-Maestro-Client";
pub const CLIENT_HEADER_VALUE: &str = "mobile";
/// Authorization scheme: `Authorization: Maestro <token>`.
pub const AUTH_SCHEME: &str = "Maestro ";

/// How an agent run was requested from the remote client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LaunchMode {
    Local,
    Mobile,
}

#[derive(Debug, Clone)]
pub struct LaunchedAgent {
    pub session_id: String,
    pub terminal_id: String,
}

/// Collaborator boundary: the host's agent-launch subsystem. The gateway
/// only forwards requests; spawning PTYs is out of its hands.
pub trait Launcher: Send + Sync {
    fn launch(&self, project_path: &str, mode: LaunchMode) -> Result<LaunchedAgent, String>;
}

/// Used when no launcher is wired up (headless monitor-only deployments).
pub struct NoopLauncher;

impl Launcher for NoopLauncher {
    fn launch(&self, _project_path: &str, _mode: LaunchMode) -> Result<LaunchedAgent, String> {
        Err("launcher_unavailable".to_string())
    }
}

#[derive(Clone)]
pub struct AppState {
    pub auth: Arc<AuthService>,
    pub registry: Arc<SessionRegistry>,
    pub ws: Arc<WsManager>,
    pub bridge: Arc<TerminalBridge>,
    pub spaces: Arc<SpaceCache>,
    pub launcher: Arc<dyn Launcher>,
    pub started_at: Instant,
}

fn error_response(status: StatusCode, code: &str) -> Response {
    (status, Json(json!({ "error": code }))).into_response()
}

/// Build the full router: public auth + health, protected API, WebSocket.
pub fn router(state: AppState) -> Router {
    let protected = Router::new()
        .route("/api/agents", get(list_agents))
        .route("/api/agents/launch", post(launch_agent))
        .route("/api/agents/{id}", get(get_agent))
        .route("/api/agents/{id}/activities", get(get_agent_activities))
        .route("/api/agents/{id}/input", post(send_agent_input))
        .route("/api/spaces", get(list_spaces))
        .route("/api/spaces/{id}", get(get_space))
        .route("/api/spaces/{id}/agents", get(get_space_agents))
        .route("/api/spaces/{id}/terminals", post(create_space_terminal))
        .route("/api/spaces/{id}/tabs", post(create_space_tab))
        .route("/api/stats", get(get_stats))
        .route("/api/devices", get(list_devices))
        .route_layer(axum::middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ));

    Router::new()
        .route("/auth/pair/status", get(pair_status))
        .route("/auth/pair", post(pair_device))
        .route("/auth/challenge", post(request_challenge))
        .route("/auth/token", post(exchange_token))
        .route("/auth/device/status", get(device_status))
        .route("/api/health", get(health))
        .route("/ws", get(ws_upgrade))
        .merge(protected)
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Auth middleware
// ---------------------------------------------------------------------------

async fn auth_middleware(
    State(state): State<AppState>,
    request: Request<axum::body::Body>,
    next: Next,
) -> Response {
    let client = request
        .headers()
        .get(CLIENT_HEADER)
        .and_then(|v| v.to_str().ok());
    if client != Some(CLIENT_HEADER_VALUE) {
        return error_response(StatusCode::FORBIDDEN, "invalid_client");
    }

    let token = request
        .headers()
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix(AUTH_SCHEME));
    let Some(token) = token else {
        return error_response(StatusCode::UNAUTHORIZED, "missing_token");
    };

    match state.auth.authenticate(token) {
        Ok(_device_id) => next.run(request).await,
        Err(e) => error_response(StatusCode::UNAUTHORIZED, e.code()),
    }
}

// ---------------------------------------------------------------------------
// Auth routes
// ---------------------------------------------------------------------------

async fn pair_status(State(state): State<AppState>) -> Response {
    (
        [(axum::http::header::CACHE_CONTROL, "no-store")],
        Json(serde_json::to_value(state.auth.pairing.status()).unwrap_or(Value::Null)),
    )
        .into_response()
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PairRequest {
    device_id: Option<String>,
    pin: Option<String>,
    name: Option<String>,
    platform: Option<String>,
    remote_token: Option<String>,
}

async fn pair_device(State(state): State<AppState>, Json(body): Json<PairRequest>) -> Response {
    if !state.auth.pairing.is_active() {
        return error_response(StatusCode::FORBIDDEN, "pairing_not_active");
    }

    let (Some(device_id), Some(pin)) = (body.device_id, body.pin) else {
        return error_response(StatusCode::BAD_REQUEST, "invalid_input");
    };

    // Remote windows require the opaque tunnel token before the PIN is even
    // looked at; a LAN PIN must not be brute-forceable from the internet.
    if state.auth.pairing.status().mode == crate::auth::pairing::PairingMode::Remote {
        let token_ok = body
            .remote_token
            .as_deref()
            .map(|t| state.auth.pairing.verify_remote_token(t))
            .unwrap_or(false);
        if !token_ok {
            return error_response(StatusCode::FORBIDDEN, "invalid_remote_token");
        }
    }

    if !state.auth.pairing.verify_pin(&pin) {
        return error_response(StatusCode::UNAUTHORIZED, "invalid_pin");
    }

    match state.auth.devices.register(&device_id, body.name, body.platform) {
        Ok(device) => Json(json!({
            "success": true,
            "deviceId": device.device_id,
            // The client stores this permanently; it is never returned again.
            "secret": device.secret,
        }))
        .into_response(),
        Err(e) => {
            tracing::error!("failed to persist device registration: {e}");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "registration_failed")
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChallengeRequest {
    device_id: Option<String>,
}

async fn request_challenge(
    State(state): State<AppState>,
    Json(body): Json<ChallengeRequest>,
) -> Response {
    let Some(device_id) = body.device_id else {
        return error_response(StatusCode::BAD_REQUEST, "invalid_input");
    };
    match state.auth.issue_challenge(&device_id) {
        Some(challenge) => Json(serde_json::to_value(challenge).unwrap_or(Value::Null)).into_response(),
        None => error_response(StatusCode::UNAUTHORIZED, "device_not_registered"),
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TokenRequest {
    device_id: Option<String>,
    nonce: Option<String>,
    signature: Option<String>,
}

async fn exchange_token(State(state): State<AppState>, Json(body): Json<TokenRequest>) -> Response {
    let (Some(device_id), Some(nonce), Some(signature)) = (body.device_id, body.nonce, body.signature)
    else {
        return error_response(StatusCode::BAD_REQUEST, "invalid_input");
    };

    let Some(device) = state.auth.devices.get(&device_id) else {
        return error_response(StatusCode::UNAUTHORIZED, "device_not_registered");
    };
    if device.revoked {
        return error_response(StatusCode::UNAUTHORIZED, "device_not_registered");
    }

    if !state.auth.verify_challenge_signature(&device_id, &nonce, &signature) {
        return error_response(StatusCode::UNAUTHORIZED, "invalid_signature");
    }

    state.auth.devices.update_last_seen(&device_id);
    let signed = state.auth.signer.sign(&device_id, DEFAULT_TOKEN_TTL);
    Json(json!({ "token": signed.token, "expiresAt": signed.expires_at })).into_response()
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeviceStatusQuery {
    device_id: Option<String>,
}

async fn device_status(
    State(state): State<AppState>,
    Query(query): Query<DeviceStatusQuery>,
) -> Json<Value> {
    let registered = query
        .device_id
        .and_then(|id| state.auth.devices.get(&id))
        .map(|d| !d.revoked)
        .unwrap_or(false);
    Json(json!({ "registered": registered }))
}

// ---------------------------------------------------------------------------
// System routes
// ---------------------------------------------------------------------------

async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "timestamp": Utc::now(),
        "uptime": state.started_at.elapsed().as_secs_f64(),
    }))
}

async fn get_stats(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "uptime": state.started_at.elapsed().as_secs_f64(),
        "connections": state.ws.client_count(),
        "hostname": std::env::var("HOSTNAME").ok(),
        "sessions": state.registry.stats(),
    }))
}

async fn list_devices(State(state): State<AppState>) -> Json<Value> {
    // Never echo secrets back out.
    let devices: Vec<Value> = state
        .auth
        .devices
        .list()
        .into_iter()
        .map(|d| {
            json!({
                "deviceId": d.device_id,
                "name": d.name,
                "platform": d.platform,
                "createdAt": d.created_at,
                "lastSeen": d.last_seen,
            })
        })
        .collect();
    Json(json!({ "devices": devices }))
}

// ---------------------------------------------------------------------------
// Agent routes
// ---------------------------------------------------------------------------

/// REST projection of a session.
fn agent_info(session: &AgentSession) -> Value {
    let terminal_id = match session.source {
        SessionSource::MaestroPty => Some(session.id.clone()),
        SessionSource::External => None,
    };
    json!({
        "id": session.id,
        "type": session.agent,
        "status": session.status,
        "projectPath": session.project_path,
        "projectName": session.project_name(),
        "spaceId": session.space_id,
        "terminalId": terminal_id,
        "launchMode": "local",
        "startedAt": session.started_at,
        "lastActivityAt": session.last_activity_at,
        "messageCount": session.message_count,
        "toolUseCount": session.tool_use_count,
    })
}

async fn list_agents(State(state): State<AppState>) -> Json<Value> {
    let agents: Vec<Value> = state
        .registry
        .sessions()
        .iter()
        .filter(|s| s.status != SessionStatus::Ended)
        .map(agent_info)
        .collect();
    Json(json!({ "agents": agents }))
}

async fn get_agent(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.registry.session(&id) {
        Some(session) => Json(agent_info(&session)).into_response(),
        None => error_response(StatusCode::NOT_FOUND, "not_found"),
    }
}

#[derive(Deserialize)]
struct ActivitiesQuery {
    limit: Option<usize>,
}

async fn get_agent_activities(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<ActivitiesQuery>,
) -> Json<Value> {
    let limit = query.limit.unwrap_or(50);
    let activities = state.registry.activities(&id, limit);
    Json(json!({ "activities": activities }))
}

#[derive(Deserialize)]
struct AgentInputRequest {
    text: Option<String>,
}

async fn send_agent_input(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<AgentInputRequest>,
) -> Response {
    let Some(text) = body.text else {
        return error_response(StatusCode::BAD_REQUEST, "invalid_input");
    };
    let Some(session) = state.registry.session(&id) else {
        return error_response(StatusCode::NOT_FOUND, "not_found");
    };

    let terminal_id = match session.source {
        SessionSource::MaestroPty => session.id.clone(),
        SessionSource::External => {
            return error_response(StatusCode::BAD_REQUEST, "no_terminal");
        }
    };
    if !state.bridge.has_live_terminal(&terminal_id) {
        return error_response(StatusCode::BAD_REQUEST, "no_terminal");
    }

    state.bridge.write(&terminal_id, text.as_bytes(), None);
    Json(json!({ "success": true })).into_response()
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct LaunchRequest {
    project_path: Option<String>,
    mode: Option<LaunchMode>,
}

async fn launch_agent(State(state): State<AppState>, Json(body): Json<LaunchRequest>) -> Response {
    let Some(project_path) = body.project_path.filter(|p| !p.is_empty()) else {
        return error_response(StatusCode::BAD_REQUEST, "missing_project_path");
    };
    let mode = body.mode.unwrap_or(LaunchMode::Local);

    match state.launcher.launch(&project_path, mode) {
        Ok(launched) => Json(json!({
            "success": true,
            "sessionId": launched.session_id,
            "terminalId": launched.terminal_id,
        }))
        .into_response(),
        Err(code) => {
            tracing::error!(path = %project_path, "agent launch failed: {code}");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, &code)
        }
    }
}

// ---------------------------------------------------------------------------
// Space routes
// ---------------------------------------------------------------------------

fn space_summary(state: &AppState, space: &crate::spaces::SpaceSnapshot) -> Value {
    let agent_count = state.registry.sessions_for_space(&space.id).len();
    json!({
        "id": space.id,
        "name": space.name,
        "color": space.color,
        "icon": space.icon,
        "repoPath": space.repo_path,
        "tabCount": space.tabs.len(),
        "agentCount": agent_count,
    })
}

async fn list_spaces(State(state): State<AppState>) -> Json<Value> {
    let spaces: Vec<Value> = state
        .spaces
        .list()
        .iter()
        .map(|space| space_summary(&state, space))
        .collect();
    Json(json!({ "spaces": spaces }))
}

async fn get_space(State(state): State<AppState>, Path(id): Path<String>) -> Json<Value> {
    let agents: Vec<Value> = state
        .registry
        .sessions_for_space(&id)
        .iter()
        .filter(|s| s.status != SessionStatus::Ended)
        .map(agent_info)
        .collect();

    match state.spaces.get(&id) {
        Some(space) => {
            let mut value = space_summary(&state, &space);
            value["tabs"] = serde_json::to_value(&space.tabs).unwrap_or(Value::Null);
            value["agents"] = Value::Array(agents);
            Json(value)
        }
        // The host has not pushed this space yet; synthesize a minimal view
        // so session correlation still works.
        None => Json(json!({
            "id": id,
            "name": format!("Space {}", &id.chars().take(4).collect::<String>()),
            "tabCount": 0,
            "agentCount": agents.len(),
            "tabs": [],
            "agents": agents,
        })),
    }
}

async fn get_space_agents(State(state): State<AppState>, Path(id): Path<String>) -> Json<Value> {
    let agents: Vec<Value> = state
        .registry
        .sessions_for_space(&id)
        .iter()
        .filter(|s| s.status != SessionStatus::Ended)
        .map(agent_info)
        .collect();
    Json(json!({ "agents": agents }))
}

async fn create_space_terminal(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Json<Value> {
    state.spaces.request(SpaceCommand::CreateTerminal { space_id: id });
    Json(json!({ "success": true }))
}

#[derive(Deserialize)]
struct CreateTabRequest {
    #[serde(rename = "type")]
    kind: Option<String>,
    url: Option<String>,
}

async fn create_space_tab(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<CreateTabRequest>,
) -> Response {
    let Some(kind) = body.kind.filter(|k| VALID_TAB_KINDS.contains(&k.as_str())) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "invalid_tab_type", "valid": VALID_TAB_KINDS })),
        )
            .into_response();
    };

    if kind == "browser" {
        if let Some(url) = &body.url {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                return error_response(StatusCode::BAD_REQUEST, "invalid_url");
            }
        }
    }

    state.spaces.request(SpaceCommand::CreateTab {
        space_id: id,
        kind,
        url: body.url,
    });
    Json(json!({ "success": true })).into_response()
}

// ---------------------------------------------------------------------------
// WebSocket
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct WsQuery {
    token: Option<String>,
}

/// Token check happens here, before the 101 handshake completes; a bad
/// token gets a plain 401 response instead of an upgrade.
async fn ws_upgrade(
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    let Some(token) = query.token else {
        return error_response(StatusCode::UNAUTHORIZED, "missing_token");
    };
    match state.auth.authenticate(&token) {
        Ok(device_id) => ws.on_upgrade(move |socket| handle_socket(socket, state, device_id)),
        Err(e) => error_response(StatusCode::UNAUTHORIZED, e.code()),
    }
}

async fn handle_socket(socket: WebSocket, state: AppState, device_id: String) {
    let (client_id, mut outbound) = state.ws.register(&device_id);
    let (mut sink, mut stream) = socket.split();

    // Writer task: drains the client's outbound queue. The queue closing
    // (eviction, shutdown) closes the socket with an explicit frame.
    let mut writer = tokio::spawn(async move {
        while let Some(text) = outbound.recv().await {
            if sink.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
        let _ = sink.send(Message::Close(None)).await;
    });

    state
        .ws
        .send_to(client_id, ServerEvent::Connected { client_id });

    let mut writer_done = false;
    loop {
        tokio::select! {
            maybe = stream.next() => {
                let Some(message) = maybe else { break };
                let message = match message {
                    Ok(m) => m,
                    Err(e) => {
                        debug!(client = %client_id, "ws read error: {e}");
                        break;
                    }
                };
                match message {
                    Message::Text(text) => handle_client_message(&state, client_id, text.as_str()),
                    Message::Close(_) => break,
                    // Transport-level ping/pong is handled by the ws stack.
                    _ => {}
                }
            }
            // Outbound queue closed: the client was evicted or the gateway
            // is shutting down. Stop reading so the connection tears down.
            result = &mut writer, if !writer_done => {
                let _ = result;
                writer_done = true;
                break;
            }
        }
    }

    state.ws.unregister(client_id);
    if !writer_done {
        let _ = writer.await;
    }
    debug!(client = %client_id, "ws connection closed");
}

/// Dispatch one parsed client frame. Malformed payloads answer with an
/// `error` envelope on this connection only; the connection stays open.
fn handle_client_message(state: &AppState, client_id: Uuid, raw: &str) {
    let message = match ClientMessage::parse(raw) {
        Ok(message) => message,
        Err(e) => {
            debug!(client = %client_id, "protocol error: {e}");
            state.ws.send_to(
                client_id,
                ServerEvent::Error {
                    code: "parse_error".into(),
                    message: "Invalid message".into(),
                },
            );
            return;
        }
    };

    match message {
        ClientMessage::Ping => {
            state.ws.touch_ping(client_id);
            state.ws.send_to(client_id, ServerEvent::Pong);
        }
        ClientMessage::Subscribe(reference) => {
            state
                .ws
                .send_to(client_id, ServerEvent::Subscribed(reference.clone()));
            // Terminal subscriptions get the backlog replayed before any
            // live frame; everything else is a plain key registration.
            match (&reference.channel[..], &reference.id) {
                ("terminal", Some(terminal_id)) => {
                    state.bridge.subscribe_with_replay(client_id, terminal_id);
                }
                _ => state.ws.subscribe(client_id, &reference.key()),
            }
        }
        ClientMessage::Unsubscribe(reference) => {
            state.ws.unsubscribe(client_id, &reference.key());
        }
        ClientMessage::TermInput(input) => {
            let Ok(bytes) = base64::engine::general_purpose::STANDARD.decode(&input.data) else {
                state.ws.send_to(
                    client_id,
                    ServerEvent::Error {
                        code: "invalid_input".into(),
                        message: "input data is not valid base64".into(),
                    },
                );
                return;
            };
            state.bridge.write(&input.id, &bytes, input.seq);
        }
        ClientMessage::TermResize(resize) => {
            state.bridge.resize(&resize.id, resize.cols, resize.rows);
        }
    }
}

/// Convenience used by the pairing UI flow on the host side.
pub fn start_pairing(state: &AppState, remote: bool) -> crate::auth::pairing::PairingStarted {
    state.auth.pairing.start_pairing(DEFAULT_PAIRING_WINDOW, remote)
}
