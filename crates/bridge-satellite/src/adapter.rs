use crate::capability::Capabilities;
use crate::codec::{decode_in, encode_out, InCommand, KeyStateTag, OutCommand};
use crate::connection::{reconnect_delay, transition, ConnectionEvent, ConnectionState};
use crate::error::SatelliteError;
use bridge_protocol::{AckStatus, Clock, Envelope, MessageId, Namespace, Path, Payload, SequenceCounter};
use bridge_router::{RouteTarget, Router, RouterError};
use bridge_store::StateStore;
use futures_util::future::BoxFuture;
use futures_util::{SinkExt, StreamExt};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::protocol::Message;
use tracing::{info, warn};

/// Default port of the satellite wire protocol (`spec.md` §6).
pub const DEFAULT_PORT: u16 = 16622;

/// Device descriptor and tuning knobs the adapter reads
/// (`spec.md` §6, "Configuration surface").
#[derive(Debug, Clone)]
pub struct SatelliteConfig {
    pub host: String,
    pub port: u16,
    pub device_id: String,
    pub product_name: String,
    pub keys_per_row: u32,
    pub keys_total: u32,
    pub bitmap_size: u32,
    pub auto_reconnect: bool,
    pub reconnect_base_delay_ms: u64,
    pub max_reconnect_attempts: u32,
    pub heartbeat_interval_ms: u64,
    pub connection_timeout_ms: u64,
}

impl SatelliteConfig {
    #[must_use]
    pub fn url(&self) -> String {
        format!("ws://{}:{}", self.host, self.port)
    }
}

/// Local mirror of one key's last-seen `KEY-STATE` tags
/// (`spec.md` §4.5, "Variable and key caches").
#[derive(Debug, Clone, Default, PartialEq)]
pub struct KeyState {
    pub color: Option<String>,
    pub text: Option<String>,
    pub bitmap: Option<String>,
    pub pressed: Option<bool>,
}

fn apply_tag(state: &mut KeyState, tag: KeyStateTag) {
    match tag {
        KeyStateTag::Color(c) => state.color = Some(c),
        KeyStateTag::Text(t) => state.text = Some(t),
        KeyStateTag::Bitmap(b) => state.bitmap = Some(b),
        KeyStateTag::Pressed => state.pressed = Some(true),
        KeyStateTag::Released => state.pressed = Some(false),
    }
}

fn key_state_as_value(state: &KeyState) -> Value {
    json!({
        "color": state.color,
        "text": state.text,
        "bitmap": state.bitmap,
        "pressed": state.pressed,
    })
}

/// Lowercases and replaces characters outside `[a-z0-9_]` with `_`
/// (`spec.md` §4.5, "State publishing").
fn safe_variable_name(name: &str) -> String {
    name.chars()
        .map(|c| {
            let c = c.to_ascii_lowercase();
            if c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' { c } else { '_' }
        })
        .collect()
}

/// Extracts `<id>` from a `companion.device.<id>....` path
/// (`spec.md` §4.5's state-publishing paths use the same convention for the
/// device-targeted bridge commands this adapter dispatches).
fn device_id_from_path(path: &Path) -> Result<&str, SatelliteError> {
    let mut segments = path.as_str().split('.');
    match (segments.next(), segments.next(), segments.next()) {
        (Some("companion"), Some("device"), Some(id)) => Ok(id),
        _ => Err(SatelliteError::MissingParam("deviceId")),
    }
}

fn value_to_wire_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        Value::Bool(_) | Value::Number(_) => value.to_string(),
        Value::Array(_) | Value::Object(_) => value.to_string(),
    }
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct PressReleaseParams {
    key_index: Option<u32>,
    page: Option<u32>,
    bank: Option<u32>,
}

impl PressReleaseParams {
    fn resolve_key_index(&self) -> Result<u32, SatelliteError> {
        if let Some(key_index) = self.key_index {
            return Ok(key_index);
        }
        match (self.page, self.bank) {
            (Some(page), Some(bank)) if page >= 1 => Ok((page - 1) * 8 + bank),
            _ => Err(SatelliteError::MissingParam("keyIndex")),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RotateParams {
    key_index: u32,
    direction: String,
}

#[derive(Debug, Deserialize)]
struct SetVariableParams {
    name: String,
    value: Value,
}

#[derive(Debug, Deserialize)]
struct GetVariableParams {
    name: String,
}

/// Drives the upstream satellite WebSocket: connect/reconnect, heartbeat,
/// wire decode into state writes, and dispatch of bridge commands the
/// router addresses to `companion.satellite` (`spec.md` §4.5).
pub struct SatelliteAdapter {
    config: SatelliteConfig,
    store: Arc<StateStore>,
    router: Arc<Router>,
    clock: Arc<dyn Clock>,
    namespace: Namespace,
    sequence: SequenceCounter,
    state: RwLock<ConnectionState>,
    capabilities: RwLock<Capabilities>,
    variables: RwLock<HashMap<String, String>>,
    keys: RwLock<HashMap<(String, u32), KeyState>>,
    pending_pong_at: Mutex<Option<u64>>,
    reconnect_attempts: AtomicU32,
    outbound_tx: RwLock<Option<mpsc::UnboundedSender<String>>>,
    rng: Mutex<StdRng>,
    shutdown_tx: watch::Sender<bool>,
}

impl SatelliteAdapter {
    #[must_use]
    pub fn new(
        config: SatelliteConfig,
        store: Arc<StateStore>,
        router: Arc<Router>,
        clock: Arc<dyn Clock>,
    ) -> Arc<Self> {
        let namespace = Namespace::new("companion.satellite").expect("companion.satellite is a valid namespace");
        let (shutdown_tx, _) = watch::channel(false);
        Arc::new(Self {
            config,
            store,
            router,
            clock,
            namespace,
            sequence: SequenceCounter::new(),
            state: RwLock::new(ConnectionState::Disconnected),
            capabilities: RwLock::new(Capabilities::default()),
            variables: RwLock::new(HashMap::new()),
            keys: RwLock::new(HashMap::new()),
            pending_pong_at: Mutex::new(None),
            reconnect_attempts: AtomicU32::new(0),
            outbound_tx: RwLock::new(None),
            rng: Mutex::new(StdRng::from_entropy()),
            shutdown_tx,
        })
    }

    #[must_use]
    pub fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.state.read().unwrap()
    }

    #[must_use]
    pub fn cached_variable(&self, name: &str) -> Option<String> {
        self.variables.read().unwrap().get(name).cloned()
    }

    /// The [`RouteTarget`] to register with the [`Router`] so bridge
    /// commands addressed at `companion.satellite` reach this adapter
    /// (`spec.md` §4.5, "Bridge-message handler").
    pub fn as_route_target(self: &Arc<Self>) -> RouteTarget {
        let adapter = self.clone();
        RouteTarget::new(self.namespace.clone(), move |envelope: Envelope| -> BoxFuture<'static, Result<(), RouterError>> {
            let adapter = adapter.clone();
            Box::pin(async move { adapter.handle_bridge_command(envelope).await })
        })
    }

    /// Starts the connect/reconnect loop as a background task. Returns
    /// immediately; observe progress via [`Self::state`] or the
    /// `companion.connection.state` store path.
    pub fn spawn(self: &Arc<Self>) {
        let adapter = self.clone();
        tokio::spawn(async move {
            adapter.run().await;
        });
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    async fn run(self: Arc<Self>) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        loop {
            if *shutdown_rx.borrow() {
                return;
            }

            if let Err(e) = self.connect_once().await {
                warn!(error = %e, "upstream connection attempt failed");
            }

            if *shutdown_rx.borrow() || !self.config.auto_reconnect {
                return;
            }

            let attempt = self.reconnect_attempts.fetch_add(1, Ordering::SeqCst) + 1;
            if self.config.max_reconnect_attempts != 0 && attempt > self.config.max_reconnect_attempts {
                *self.state.write().unwrap() = ConnectionState::Error;
                tracing::error!(attempt, "max reconnect attempts exhausted, giving up");
                return;
            }

            *self.state.write().unwrap() = transition(ConnectionEvent::ReconnectScheduled);
            let delay = {
                let mut rng = self.rng.lock().unwrap();
                reconnect_delay(attempt, self.config.reconnect_base_delay_ms, &mut *rng)
            };
            tokio::select! {
                biased;
                _ = shutdown_rx.changed() => { if *shutdown_rx.borrow() { return; } }
                () = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn connect_once(self: &Arc<Self>) -> Result<(), SatelliteError> {
        *self.state.write().unwrap() = transition(ConnectionEvent::ConnectRequested);
        let url = self.config.url();

        let connected = tokio::time::timeout(
            Duration::from_millis(self.config.connection_timeout_ms),
            tokio_tungstenite::connect_async(&url),
        )
        .await;

        let (ws_stream, _response) = match connected {
            Ok(Ok(pair)) => pair,
            Ok(Err(e)) => {
                *self.state.write().unwrap() = transition(ConnectionEvent::SocketClosed);
                self.on_disconnected(format!("CONNECT_FAILED: {e}")).await?;
                return Err(SatelliteError::NotConnected);
            }
            Err(_) => {
                *self.state.write().unwrap() = transition(ConnectionEvent::ConnectionTimedOut);
                self.on_disconnected("TIMEOUT: connection attempt exceeded connectionTimeout".to_owned()).await?;
                return Err(SatelliteError::NotConnected);
            }
        };

        self.reconnect_attempts.store(0, Ordering::SeqCst);
        let (mut write, mut read) = ws_stream.split();
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<String>();

        let begin = encode_out(&OutCommand::Begin {
            device_id: self.config.device_id.clone(),
            product_name: self.config.product_name.clone(),
            keys_per_row: self.config.keys_per_row,
            keys_total: self.config.keys_total,
            bitmap_size: self.config.bitmap_size,
        });
        if write.send(Message::Text(begin.into())).await.is_err() {
            self.on_disconnected("SEND_FAILED: could not send BEGIN".to_owned()).await?;
            return Err(SatelliteError::NotConnected);
        }

        *self.outbound_tx.write().unwrap() = Some(outbound_tx);
        *self.state.write().unwrap() = transition(ConnectionEvent::SocketOpened);
        self.publish_connection_state("connected", None)?;
        self.store.clear_owner_stale(&self.namespace, self.clock.as_ref());
        self.emit_event("connected", None).await?;
        info!(url, "connected to upstream satellite");

        let mut heartbeat_shutdown = self.shutdown_tx.subscribe();
        let heartbeat_adapter = self.clone();
        let heartbeat_task = tokio::spawn(async move {
            heartbeat_adapter.run_heartbeat(&mut heartbeat_shutdown).await;
        });

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let close_reason = loop {
            tokio::select! {
                biased;
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        let _ = write.send(Message::Close(None)).await;
                        break "1001: adapter shutdown".to_owned();
                    }
                }
                outgoing = outbound_rx.recv() => {
                    match outgoing {
                        Some(line) => {
                            if write.send(Message::Text(line.into())).await.is_err() {
                                break "SEND_FAILED: write error".to_owned();
                            }
                        }
                        None => break "SEND_FAILED: outbound channel closed".to_owned(),
                    }
                }
                incoming = read.next() => {
                    match incoming {
                        Some(Ok(Message::Text(text))) => self.handle_wire_line(&text).await,
                        Some(Ok(Message::Ping(data))) => { let _ = write.send(Message::Pong(data)).await; }
                        Some(Ok(Message::Close(frame))) => {
                            break frame.map_or_else(|| "1000: closed".to_owned(), |f| format!("{}: {}", u16::from(f.code), f.reason));
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => break format!("TRANSPORT_ERROR: {e}"),
                        None => break "1006: connection ended".to_owned(),
                    }
                }
            }
        };

        heartbeat_task.abort();
        *self.outbound_tx.write().unwrap() = None;
        *self.state.write().unwrap() = transition(ConnectionEvent::SocketClosed);
        self.on_disconnected(close_reason).await?;
        Ok(())
    }

    async fn run_heartbeat(self: Arc<Self>, shutdown_rx: &mut watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(Duration::from_millis(self.config.heartbeat_interval_ms));
        interval.tick().await;
        loop {
            tokio::select! {
                biased;
                _ = shutdown_rx.changed() => { if *shutdown_rx.borrow() { return; } }
                _ = interval.tick() => {
                    *self.pending_pong_at.lock().unwrap() = Some(self.clock.now_millis());
                    self.send_line(encode_out(&OutCommand::Ping));
                }
            }
        }
    }

    fn send_line(&self, line: String) {
        if let Some(tx) = self.outbound_tx.read().unwrap().as_ref() {
            let _ = tx.send(line);
        }
    }

    fn publish_connection_state(&self, state: &str, last_error: Option<&str>) -> Result<(), SatelliteError> {
        self.store.set(
            Path::new("companion.connection.state").unwrap(),
            json!(state),
            self.namespace.clone(),
            self.clock.as_ref(),
        )?;
        if state == "connected" {
            self.store.set(
                Path::new("companion.connection.lastConnected").unwrap(),
                json!(self.clock.now_millis()),
                self.namespace.clone(),
                self.clock.as_ref(),
            )?;
        }
        if let Some(reason) = last_error {
            self.store.set(
                Path::new("companion.connection.lastError").unwrap(),
                json!(reason),
                self.namespace.clone(),
                self.clock.as_ref(),
            )?;
        }
        Ok(())
    }

    async fn on_disconnected(&self, reason: String) -> Result<(), SatelliteError> {
        warn!(reason = %reason, "upstream disconnected");
        self.publish_connection_state("disconnected", Some(&reason))?;
        self.store.mark_owner_stale(&self.namespace, self.clock.as_ref());
        self.emit_event("disconnected", Some(json!({ "reason": reason }))).await?;
        Ok(())
    }

    async fn handle_wire_line(&self, line: &str) {
        match decode_in(line) {
            Ok(cmd) => {
                if let Err(e) = self.apply_in_command(cmd).await {
                    warn!(error = %e, line, "failed to apply inbound wire command");
                }
            }
            Err(e) => warn!(error = %e, line, "could not decode inbound wire line"),
        }
    }

    async fn apply_in_command(&self, cmd: InCommand) -> Result<(), SatelliteError> {
        match cmd {
            InCommand::AddDevice { capabilities, .. } => {
                self.capabilities.write().unwrap().apply_tokens(&capabilities);
                self.store.set(
                    Path::new("companion.capabilities").unwrap(),
                    serde_json::to_value(&*self.capabilities.read().unwrap()).unwrap_or(Value::Null),
                    self.namespace.clone(),
                    self.clock.as_ref(),
                )?;
            }
            InCommand::KeyState { device_id, key_index, tags } => {
                let mut keys = self.keys.write().unwrap();
                let entry = keys.entry((device_id.clone(), key_index)).or_default();
                for tag in tags {
                    apply_tag(entry, tag);
                }
                let value = key_state_as_value(entry);
                drop(keys);
                self.store.set(
                    Path::new(format!("companion.device.{device_id}.key.{key_index}"))?,
                    value,
                    self.namespace.clone(),
                    self.clock.as_ref(),
                )?;
            }
            InCommand::VariablesUpdate { updates } => {
                for (name, value) in updates {
                    self.variables.write().unwrap().insert(name.clone(), value.clone());
                    let safe_name = safe_variable_name(&name);
                    self.store.set(
                        Path::new(format!("companion.variables.{safe_name}"))?,
                        json!(value),
                        self.namespace.clone(),
                        self.clock.as_ref(),
                    )?;
                }
            }
            InCommand::Brightness { device_id, level } => {
                self.store.set(
                    Path::new(format!("companion.device.{device_id}.brightness"))?,
                    json!(level),
                    self.namespace.clone(),
                    self.clock.as_ref(),
                )?;
            }
            InCommand::Pong => {
                if let Some(sent_at) = self.pending_pong_at.lock().unwrap().take() {
                    let latency = self.clock.now_millis().saturating_sub(sent_at);
                    tracing::debug!(latency_ms = latency, "heartbeat pong received");
                }
            }
            InCommand::Error { message } => {
                warn!(message, "satellite reported an error");
            }
        }
        Ok(())
    }

    async fn emit_event(&self, event: &str, data: Option<Value>) -> Result<(), SatelliteError> {
        let envelope = Envelope {
            id: MessageId::generate(self.clock.as_ref()),
            source: self.namespace.clone(),
            target: None,
            path: Path::new("companion.connection").unwrap(),
            payload: Payload::Event { event: event.to_owned(), data },
            timestamp: self.clock.now_millis(),
            sequence: self.sequence.next(),
            correlation_id: None,
            ttl: None,
            idempotency_key: None,
        };
        self.router.route(envelope).await?;
        Ok(())
    }

    fn build_ack(&self, command_id: MessageId, target: &Namespace, path: &Path, status: AckStatus, result: Option<Value>, error: Option<Value>) -> Envelope {
        Envelope {
            id: MessageId::generate(self.clock.as_ref()),
            source: self.namespace.clone(),
            target: Some(target.clone()),
            path: path.clone(),
            payload: Payload::Ack { status, command_id, result, error },
            timestamp: self.clock.now_millis(),
            sequence: self.sequence.next(),
            correlation_id: None,
            ttl: None,
            idempotency_key: None,
        }
    }

    /// Dispatches one routed bridge command to its wire translation
    /// (`spec.md` §4.5's handler table), then routes a terminal ack back to
    /// the command's source.
    async fn handle_bridge_command(&self, envelope: Envelope) -> Result<(), RouterError> {
        let Payload::Command { action, params } = &envelope.payload else {
            return Ok(());
        };
        let action = action.clone();
        let params = params.clone().unwrap_or(Value::Null);

        let outcome = self.dispatch_action(&action, &params, &envelope.path).await;
        let ack = match outcome {
            Ok(result) => self.build_ack(envelope.id, &envelope.source, &envelope.path, AckStatus::Completed, result, None),
            Err(e) => self.build_ack(
                envelope.id,
                &envelope.source,
                &envelope.path,
                AckStatus::Failed,
                None,
                Some(json!({ "code": e.code(), "message": e.to_string() })),
            ),
        };
        self.router.route(ack).await
    }

    async fn dispatch_action(&self, action: &str, params: &Value, path: &Path) -> Result<Option<Value>, SatelliteError> {
        match action {
            "press" | "release" => {
                let parsed: PressReleaseParams = serde_json::from_value(params.clone()).unwrap_or_default();
                let key_index = parsed.resolve_key_index()?;
                let device_id = device_id_from_path(path)?.to_owned();
                self.send_line(encode_out(&OutCommand::KeyPress { device_id, key_index, pressed: action == "press" }));
                Ok(None)
            }
            "rotate" => {
                if !self.capabilities.read().unwrap().rotation {
                    return Err(SatelliteError::MissingCapability("ROTATION"));
                }
                let parsed: RotateParams =
                    serde_json::from_value(params.clone()).map_err(|_| SatelliteError::MissingParam("keyIndex/direction"))?;
                let direction = match parsed.direction.as_str() {
                    "left" => -1,
                    "right" => 1,
                    _ => return Err(SatelliteError::MissingParam("direction")),
                };
                let device_id = device_id_from_path(path)?.to_owned();
                self.send_line(encode_out(&OutCommand::KeyRotate { device_id, key_index: parsed.key_index, direction }));
                Ok(None)
            }
            "setVariable" => {
                if !self.capabilities.read().unwrap().variable_write {
                    return Err(SatelliteError::MissingCapability("VARIABLE_WRITE"));
                }
                let parsed: SetVariableParams =
                    serde_json::from_value(params.clone()).map_err(|_| SatelliteError::MissingParam("name/value"))?;
                let value = value_to_wire_string(&parsed.value);
                self.send_line(encode_out(&OutCommand::VariableValue { name: parsed.name, value }));
                Ok(None)
            }
            "getVariable" => {
                let parsed: GetVariableParams =
                    serde_json::from_value(params.clone()).map_err(|_| SatelliteError::MissingParam("name"))?;
                let value = self.cached_variable(&parsed.name);
                Ok(Some(json!({ "name": parsed.name, "value": value })))
            }
            "clearKeys" => {
                let device_id = device_id_from_path(path)?.to_owned();
                self.send_line(encode_out(&OutCommand::KeysClear { device_id: device_id.clone() }));
                self.keys.write().unwrap().retain(|(id, _), _| id != &device_id);
                Ok(None)
            }
            other => Err(SatelliteError::UnknownAction(other.to_owned())),
        }
    }
}
