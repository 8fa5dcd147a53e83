//! End-to-end coverage of the downstream client WebSocket boundary
//! (`spec.md` §6) and the seed scenarios it is asked to carry (`spec.md` §8).

use bridge_protocol::{Clock, FixedClock, Namespace, Path};
use bridge_router::Router;
use bridge_satellite::{SatelliteAdapter, SatelliteConfig};
use bridge_store::StateStore;
use bridge_subscriptions::SubscriptionManager;
use futures_util::{SinkExt, StreamExt};
use hub::config::{HubConfig, TransportConfig};
use hub::state::AppState;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message;

type WsStream = tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

fn test_transport_config() -> TransportConfig {
    TransportConfig {
        host: "127.0.0.1".to_owned(),
        port: 0,
        max_clients: 2,
        rate_limit: 1000,
        rate_limit_window: 1000,
        idle_timeout: 60_000,
        require_auth: false,
        auth_tokens: Vec::new(),
        max_message_size: 1_048_576,
        heartbeat_interval: 60_000,
    }
}

async fn spawn_hub(transport: TransportConfig) -> (String, AppState) {
    let clock: Arc<dyn Clock> = Arc::new(FixedClock(1_700_000_000_000));
    let store = Arc::new(StateStore::new());
    let subs = Arc::new(SubscriptionManager::new());
    let router = Router::new(store.clone(), subs.clone(), clock.clone(), true, 60_000);

    let satellite_config = SatelliteConfig {
        host: "127.0.0.1".to_owned(),
        port: 0,
        device_id: "test-device".to_owned(),
        product_name: "Test Device".to_owned(),
        keys_per_row: 8,
        keys_total: 32,
        bitmap_size: 72,
        auto_reconnect: false,
        reconnect_base_delay_ms: 1000,
        max_reconnect_attempts: 1,
        heartbeat_interval_ms: 5000,
        connection_timeout_ms: 1000,
    };
    let satellite = SatelliteAdapter::new(satellite_config, store.clone(), router.clone(), clock.clone());
    router.register_target(satellite.as_route_target()).unwrap();

    let config = Arc::new(HubConfig { companion: HubConfig::default_values().companion, transport });
    let state = AppState::new(config, store, subs, router, satellite, clock);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = hub::build_router(state.clone());
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (format!("127.0.0.1:{}", addr.port()), state)
}

async fn connect(addr: &str) -> WsStream {
    let url = format!("ws://{addr}/ws");
    let (stream, _) = tokio_tungstenite::connect_async(url).await.unwrap();
    stream
}

async fn send_json(stream: &mut WsStream, value: &Value) {
    stream.send(Message::Text(value.to_string().into())).await.unwrap();
}

async fn recv_json(stream: &mut WsStream) -> Value {
    match tokio::time::timeout(Duration::from_secs(2), stream.next()).await {
        Ok(Some(Ok(Message::Text(text)))) => serde_json::from_str(&text).unwrap(),
        other => panic!("expected a text frame, got {other:?}"),
    }
}

async fn recv_close(stream: &mut WsStream) -> u16 {
    loop {
        match tokio::time::timeout(Duration::from_secs(2), stream.next()).await {
            Ok(Some(Ok(Message::Close(Some(frame))))) => return frame.code.into(),
            Ok(Some(Ok(_))) => continue,
            other => panic!("expected a close frame, got {other:?}"),
        }
    }
}

async fn handshake(stream: &mut WsStream, name: &str) -> Value {
    send_json(stream, &json!({ "type": "handshake", "name": name, "version": "1.0" })).await;
    recv_json(stream).await
}

/// Builds a full envelope JSON object. The hub overrides `source` with the
/// connection's own namespace before routing, so the placeholder value here
/// never reaches the router.
fn envelope_json(path: &str, fields: Value) -> Value {
    let mut envelope = json!({
        "id": "01890a5d-ac96-7000-8000-000000000000",
        "source": "app.placeholder",
        "path": path,
        "timestamp": 1_700_000_000_000u64,
        "sequence": 0,
    });
    if let (Value::Object(base), Value::Object(extra)) = (&mut envelope, fields) {
        base.extend(extra);
    }
    envelope
}

#[tokio::test]
async fn handshake_assigns_sanitized_namespace() {
    let (addr, _state) = spawn_hub(test_transport_config()).await;
    let mut stream = connect(&addr).await;
    let response = handshake(&mut stream, "Dash Board!!").await;

    assert_eq!(response["type"], "handshake_response");
    assert_eq!(response["success"], true);
    assert_eq!(response["namespace"], "app.dashboard");
}

#[tokio::test]
async fn non_handshake_first_message_closes_4001() {
    let (addr, _state) = spawn_hub(test_transport_config()).await;
    let mut stream = connect(&addr).await;
    // Valid JSON, deserializes fine as a handshake-shaped message, but isn't one.
    send_json(&mut stream, &json!({ "type": "subscribe", "name": "someone" })).await;
    assert_eq!(recv_close(&mut stream).await, 4001);
}

#[tokio::test]
async fn invalid_handshake_json_closes_4002() {
    let (addr, _state) = spawn_hub(test_transport_config()).await;
    let mut stream = connect(&addr).await;
    stream.send(Message::Text("not json".into())).await.unwrap();
    assert_eq!(recv_close(&mut stream).await, 4002);
}

#[tokio::test]
async fn auth_required_and_missing_token_closes_4003() {
    let transport = TransportConfig { require_auth: true, auth_tokens: vec!["secret".to_owned()], ..test_transport_config() };
    let (addr, _state) = spawn_hub(transport).await;
    let mut stream = connect(&addr).await;
    send_json(&mut stream, &json!({ "type": "handshake", "name": "client-a" })).await;
    let response = recv_json(&mut stream).await;
    assert_eq!(response["success"], false);
    assert_eq!(recv_close(&mut stream).await, 4003);
}

#[tokio::test]
async fn auth_required_and_valid_token_succeeds() {
    let transport = TransportConfig { require_auth: true, auth_tokens: vec!["secret".to_owned()], ..test_transport_config() };
    let (addr, _state) = spawn_hub(transport).await;
    let mut stream = connect(&addr).await;
    send_json(&mut stream, &json!({ "type": "handshake", "name": "client-a", "authToken": "secret" })).await;
    let response = recv_json(&mut stream).await;
    assert_eq!(response["success"], true);
}

#[tokio::test]
async fn max_clients_reached_closes_1013() {
    let transport = TransportConfig { max_clients: 1, ..test_transport_config() };
    let (addr, _state) = spawn_hub(transport).await;
    let mut first = connect(&addr).await;
    let _ = handshake(&mut first, "first").await;

    let mut second = connect(&addr).await;
    assert_eq!(recv_close(&mut second).await, 1013);
}

#[tokio::test]
async fn idle_timeout_closes_4004() {
    let transport = TransportConfig { idle_timeout: 150, ..test_transport_config() };
    let (addr, _state) = spawn_hub(transport).await;
    let mut stream = connect(&addr).await;
    let _ = handshake(&mut stream, "idle-client").await;
    assert_eq!(recv_close(&mut stream).await, 4004);
}

/// Seed scenario 1: snapshot then delta.
#[tokio::test]
async fn snapshot_then_delta() {
    let (addr, state) = spawn_hub(test_transport_config()).await;
    let path = Path::new("companion.variables.tally").unwrap();
    let companion = Namespace::new("companion.satellite").unwrap();
    state.store.set(path.clone(), json!("cam1"), companion.clone(), state.clock.as_ref()).unwrap();

    let mut stream = connect(&addr).await;
    let handshake_response = handshake(&mut stream, "dashboard").await;
    assert_eq!(handshake_response["success"], true);

    send_json(
        &mut stream,
        &envelope_json(
            "hub.subscriptions",
            json!({ "type": "subscribe", "patterns": ["companion.variables.**"], "snapshot": true }),
        ),
    )
    .await;

    let ack = recv_json(&mut stream).await;
    assert_eq!(ack["type"], "ack");
    assert_eq!(ack["status"], "completed");

    let snapshot = recv_json(&mut stream).await;
    assert_eq!(snapshot["type"], "state");
    assert_eq!(snapshot["path"], "companion.variables.tally");
    assert_eq!(snapshot["value"], "cam1");

    let complete = recv_json(&mut stream).await;
    assert_eq!(complete["type"], "event");
    assert_eq!(complete["event"], "snapshot_complete");

    state.store.set(path, json!("cam2"), companion, state.clock.as_ref()).unwrap();
    let delta = recv_json(&mut stream).await;
    assert_eq!(delta["type"], "state");
    assert_eq!(delta["value"], "cam2");
    assert_eq!(delta["version"], 2);
}

/// Seed scenario 2: ownership conflict.
#[tokio::test]
async fn ownership_conflict_yields_state_conflict() {
    let (addr, state) = spawn_hub(test_transport_config()).await;

    let mut client_a = connect(&addr).await;
    let response_a = handshake(&mut client_a, "a").await;
    assert_eq!(response_a["namespace"], "app.a");

    let mut client_b = connect(&addr).await;
    let response_b = handshake(&mut client_b, "b").await;
    assert_eq!(response_b["namespace"], "app.b");

    send_json(&mut client_a, &envelope_json("x.y", json!({ "type": "state", "value": 1 }))).await;
    // A connection's frames are handled one at a time in order, so awaiting
    // this subscribe ack on the same connection guarantees the state write
    // above has already landed in the store before client_b writes.
    send_json(&mut client_a, &envelope_json("hub.subscriptions", json!({ "type": "subscribe", "patterns": ["x.**"], "snapshot": false }))).await;
    let sync_ack = recv_json(&mut client_a).await;
    assert_eq!(sync_ack["status"], "completed");

    send_json(&mut client_b, &envelope_json("x.y", json!({ "type": "state", "value": 2 }))).await;

    let error = recv_json(&mut client_b).await;
    assert_eq!(error["type"], "error");
    assert_eq!(error["code"], "STATE_CONFLICT");

    let entry = state.store.get(&Path::new("x.y").unwrap()).unwrap();
    assert_eq!(entry.value, json!(1));
    assert_eq!(entry.owner.as_str(), "app.a");
    assert_eq!(entry.version, 1);
}

/// Seed scenario 6: self-delivery suppression.
#[tokio::test]
async fn self_delivery_is_suppressed() {
    let (addr, _state) = spawn_hub(test_transport_config()).await;
    let mut stream = connect(&addr).await;
    let response = handshake(&mut stream, "x").await;
    assert_eq!(response["namespace"], "app.x");

    send_json(&mut stream, &envelope_json("hub.subscriptions", json!({ "type": "subscribe", "patterns": ["app.x.**"], "snapshot": false }))).await;
    let ack = recv_json(&mut stream).await;
    assert_eq!(ack["status"], "completed");

    send_json(&mut stream, &envelope_json("app.x.foo", json!({ "type": "state", "value": 1 }))).await;

    // The fan-out skips the delta's own owner, so no state message for
    // app.x.foo should ever reach this connection.
    let next = tokio::time::timeout(Duration::from_millis(300), recv_json(&mut stream)).await;
    assert!(next.is_err(), "expected no message, self-write must not be delivered back to its owner");
}
