//! Downstream application-client WebSocket boundary (`spec.md` §6,
//! "Downstream (client) WebSocket boundary").

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use bridge_protocol::{error_codes, Envelope, MessageId, Namespace, Path, Payload, SequenceCounter};
use bridge_router::{RouteTarget, RouterError};
use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval, timeout};
use tracing::{info, warn};

use crate::state::AppState;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const SERVER_VERSION: &str = env!("CARGO_PKG_VERSION");
const MAX_SANITIZED_LEN: usize = 32;

const CLOSE_SERVER_SHUTDOWN: u16 = 1001;
const CLOSE_MAX_CLIENTS: u16 = 1013;
const CLOSE_HANDSHAKE_TIMEOUT: u16 = 4000;
const CLOSE_NON_HANDSHAKE_FIRST: u16 = 4001;
const CLOSE_INVALID_HANDSHAKE: u16 = 4002;
const CLOSE_AUTH_FAILED: u16 = 4003;
const CLOSE_IDLE_TIMEOUT: u16 = 4004;
const CLOSE_SERVER_INITIATED: u16 = 4005;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HandshakeRequest {
    #[serde(rename = "type")]
    kind: String,
    name: String,
    #[serde(default)]
    #[allow(dead_code)]
    version: Option<String>,
    #[serde(default)]
    auth_token: Option<String>,
    #[serde(default)]
    #[allow(dead_code)]
    metadata: Option<Value>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct HandshakeResponse {
    #[serde(rename = "type")]
    kind: &'static str,
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    namespace: Option<String>,
    server_version: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

pub async fn client_ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    let max_message_size = state.config.transport.max_message_size;
    ws.max_message_size(max_message_size)
        .on_upgrade(move |socket| handle_client_socket(socket, state))
}

/// Lowercases, replaces every non-`[a-z0-9]` character with `_`, trims
/// leading/trailing underscores, truncates to 32 characters, and defaults to
/// `client` if the result is empty (`spec.md` §6).
fn sanitize_client_name(name: &str) -> String {
    let lowered: String = name
        .chars()
        .map(|c| {
            let c = c.to_ascii_lowercase();
            if c.is_ascii_lowercase() || c.is_ascii_digit() {
                c
            } else {
                '_'
            }
        })
        .collect();
    let trimmed = lowered.trim_matches('_');
    let truncated: String = trimmed.chars().take(MAX_SANITIZED_LEN).collect();
    if truncated.is_empty() {
        "client".to_owned()
    } else {
        truncated
    }
}

/// [`Namespace`] segments forbid underscores and must start with `a-z`
/// (`spec.md` §3's grammar), which the sanitization algorithm above does not
/// by itself guarantee. Strip underscores and fall back to `client` if the
/// result is empty or digit-leading.
fn to_namespace_segment(sanitized: &str) -> String {
    let stripped: String = sanitized.chars().filter(|c| *c != '_').collect();
    match stripped.chars().next() {
        Some(c) if c.is_ascii_lowercase() => stripped,
        _ => "client".to_owned(),
    }
}

fn client_namespace(name: &str, disambiguator: Option<u64>) -> Namespace {
    let base = to_namespace_segment(&sanitize_client_name(name));
    let segment = match disambiguator {
        Some(n) => format!("{base}{n}"),
        None => base,
    };
    Namespace::new(format!("app.{segment}")).expect("sanitized client segment is a valid namespace")
}

async fn close_with(socket: &mut WebSocket, code: u16, reason: &str) {
    let _ = socket
        .send(Message::Close(Some(CloseFrame { code, reason: reason.to_owned().into() })))
        .await;
}

async fn send_handshake_response(socket: &mut WebSocket, response: &HandshakeResponse) -> bool {
    match serde_json::to_string(response) {
        Ok(json) => socket.send(Message::Text(json.into())).await.is_ok(),
        Err(_) => false,
    }
}

fn build_error_envelope(source: &Namespace, sequence: &SequenceCounter, clock: &dyn bridge_protocol::Clock, code: &'static str, message: String) -> Envelope {
    Envelope {
        id: MessageId::generate(clock),
        source: source.clone(),
        target: None,
        path: Path::new("hub.core").expect("valid path literal"),
        payload: Payload::Error { code: code.to_owned(), message, details: None, related_message_id: None },
        timestamp: clock.now_millis(),
        sequence: sequence.next(),
        correlation_id: None,
        ttl: None,
        idempotency_key: None,
    }
}

async fn handle_client_socket(mut socket: WebSocket, state: AppState) {
    let Some((session_id, seq)) = state.try_register_client().await else {
        close_with(&mut socket, CLOSE_MAX_CLIENTS, "max clients reached").await;
        return;
    };

    let handshake = match timeout(HANDSHAKE_TIMEOUT, socket.recv()).await {
        Ok(Some(Ok(Message::Text(text)))) => match serde_json::from_str::<HandshakeRequest>(&text) {
            Ok(req) if req.kind == "handshake" => req,
            Ok(_) => {
                close_with(&mut socket, CLOSE_NON_HANDSHAKE_FIRST, "first message must be a handshake").await;
                state.unregister_client(&session_id).await;
                return;
            }
            Err(e) => {
                close_with(&mut socket, CLOSE_INVALID_HANDSHAKE, &format!("invalid handshake JSON: {e}")).await;
                state.unregister_client(&session_id).await;
                return;
            }
        },
        Ok(Some(Ok(_))) => {
            close_with(&mut socket, CLOSE_NON_HANDSHAKE_FIRST, "first message must be a handshake").await;
            state.unregister_client(&session_id).await;
            return;
        }
        Ok(Some(Err(_))) | Ok(None) => {
            state.unregister_client(&session_id).await;
            return;
        }
        Err(_) => {
            close_with(&mut socket, CLOSE_HANDSHAKE_TIMEOUT, "handshake timeout").await;
            state.unregister_client(&session_id).await;
            return;
        }
    };

    if state.config.transport.require_auth {
        let authorized = handshake
            .auth_token
            .as_deref()
            .is_some_and(|token| state.config.transport.auth_tokens.iter().any(|allowed| allowed == token));
        if !authorized {
            let response = HandshakeResponse {
                kind: "handshake_response",
                success: false,
                session_id: None,
                namespace: None,
                server_version: SERVER_VERSION,
                error: Some("authentication failed".to_owned()),
            };
            let _ = send_handshake_response(&mut socket, &response).await;
            close_with(&mut socket, CLOSE_AUTH_FAILED, "authentication failed").await;
            state.unregister_client(&session_id).await;
            return;
        }
    }

    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Envelope>();

    // Namespace collisions are not named by the handshake text; retry once
    // with the client's sequence number folded in before giving up.
    let make_target = |namespace: Namespace| {
        let tx = outbound_tx.clone();
        RouteTarget::new(namespace, move |envelope: Envelope| -> BoxFuture<'static, Result<(), RouterError>> {
            let tx = tx.clone();
            Box::pin(async move {
                let _ = tx.send(envelope);
                Ok(())
            })
        })
    };

    let first_attempt = client_namespace(&handshake.name, None);
    let namespace = if state.router.register_target(make_target(first_attempt.clone())).is_ok() {
        first_attempt
    } else {
        let retry = client_namespace(&handshake.name, Some(seq));
        if state.router.register_target(make_target(retry.clone())).is_err() {
            let response = HandshakeResponse {
                kind: "handshake_response",
                success: false,
                session_id: None,
                namespace: None,
                server_version: SERVER_VERSION,
                error: Some("namespace already in use".to_owned()),
            };
            let _ = send_handshake_response(&mut socket, &response).await;
            close_with(&mut socket, CLOSE_SERVER_INITIATED, "namespace already in use").await;
            state.unregister_client(&session_id).await;
            return;
        }
        retry
    };

    let response = HandshakeResponse {
        kind: "handshake_response",
        success: true,
        session_id: Some(session_id.clone()),
        namespace: Some(namespace.as_str().to_owned()),
        server_version: SERVER_VERSION,
        error: None,
    };
    if !send_handshake_response(&mut socket, &response).await {
        state.router.unregister_target(&namespace).await;
        state.unregister_client(&session_id).await;
        return;
    }
    info!(session_id = %session_id, namespace = %namespace, "client connected");

    run_client_loop(&mut socket, &state, &namespace, &session_id, &mut outbound_rx).await;

    state.router.unregister_target(&namespace).await;
    state.unregister_client(&session_id).await;
    info!(session_id = %session_id, namespace = %namespace, "client disconnected");
}

struct RateLimitWindow {
    window_start_ms: u64,
    count: u32,
}

async fn run_client_loop(
    socket: &mut WebSocket,
    state: &AppState,
    namespace: &Namespace,
    session_id: &str,
    outbound_rx: &mut mpsc::UnboundedReceiver<Envelope>,
) {
    let idle_timeout = Duration::from_millis(state.config.transport.idle_timeout);
    let heartbeat_interval_duration = Duration::from_millis(state.config.transport.heartbeat_interval);
    let mut heartbeat = interval(heartbeat_interval_duration);
    heartbeat.tick().await;

    let sequence = SequenceCounter::new();
    let mut rate_limit = RateLimitWindow { window_start_ms: state.clock.now_millis(), count: 0 };
    let mut shutdown_rx = state.shutdown.subscribe();

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => {
                close_with(socket, CLOSE_SERVER_SHUTDOWN, "server shutdown").await;
                break;
            }
            frame = timeout(idle_timeout, socket.recv()) => {
                match frame {
                    Ok(Some(Ok(Message::Text(text)))) => {
                        if !check_rate_limit(state, &mut rate_limit) {
                            let envelope = build_error_envelope(
                                namespace,
                                &sequence,
                                state.clock.as_ref(),
                                error_codes::RATE_LIMITED,
                                "rate limit exceeded".to_owned(),
                            );
                            if send_envelope(socket, &envelope).await.is_err() { break; }
                            continue;
                        }
                        if handle_client_text(socket, state, namespace, &sequence, &text).await.is_err() {
                            break;
                        }
                    }
                    Ok(Some(Ok(Message::Ping(data)))) => { let _ = socket.send(Message::Pong(data)).await; }
                    Ok(Some(Ok(Message::Pong(_)))) => {}
                    Ok(Some(Ok(Message::Close(_)))) | Ok(None) => { break; }
                    Ok(Some(Err(e))) => { warn!(session_id = %session_id, error = %e, "client socket error"); break; }
                    Ok(Some(Ok(Message::Binary(_)))) => {}
                    Err(_) => {
                        close_with(socket, CLOSE_IDLE_TIMEOUT, "idle timeout").await;
                        break;
                    }
                }
            }
            _ = heartbeat.tick() => {
                let ping = json!({ "type": "ping", "timestamp": state.clock.now_millis() });
                if socket.send(Message::Text(ping.to_string().into())).await.is_err() { break; }
            }
            envelope = outbound_rx.recv() => {
                match envelope {
                    Some(envelope) => {
                        if send_envelope(socket, &envelope).await.is_err() { break; }
                    }
                    None => break,
                }
            }
        }
    }
}

fn check_rate_limit(state: &AppState, window: &mut RateLimitWindow) -> bool {
    let now = state.clock.now_millis();
    if now.saturating_sub(window.window_start_ms) >= state.config.transport.rate_limit_window {
        window.window_start_ms = now;
        window.count = 0;
    }
    window.count += 1;
    window.count <= state.config.transport.rate_limit
}

async fn send_envelope(socket: &mut WebSocket, envelope: &Envelope) -> Result<(), ()> {
    match serde_json::to_string(envelope) {
        Ok(json) => socket.send(Message::Text(json.into())).await.map_err(|_| ()),
        Err(_) => Err(()),
    }
}

/// Parses one client frame. `pong` replies carry no envelope shape and are
/// swallowed; anything else is deserialized as an [`Envelope`], its `source`
/// overridden to the client's own namespace, and routed (`spec.md` §6, last
/// sentence).
async fn handle_client_text(
    socket: &mut WebSocket,
    state: &AppState,
    namespace: &Namespace,
    sequence: &SequenceCounter,
    text: &str,
) -> Result<(), ()> {
    if let Ok(value) = serde_json::from_str::<Value>(text) {
        if value.get("type").and_then(Value::as_str) == Some("pong") {
            return Ok(());
        }
    }

    let mut envelope = match serde_json::from_str::<Envelope>(text) {
        Ok(envelope) => envelope,
        Err(e) => {
            let error = build_error_envelope(
                namespace,
                sequence,
                state.clock.as_ref(),
                error_codes::INVALID_MESSAGE,
                format!("invalid envelope JSON: {e}"),
            );
            return send_envelope(socket, &error).await;
        }
    };

    if let Err(e) = envelope.validate() {
        let error = build_error_envelope(namespace, sequence, state.clock.as_ref(), e.code(), e.to_string());
        return send_envelope(socket, &error).await;
    }

    envelope.source = namespace.clone();
    if state.router.route(envelope).await.is_err() {
        // Router already delivers an error envelope to the source on failure.
    }
    Ok(())
}
