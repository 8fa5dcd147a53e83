//! Hub configuration loading: TOML file plus `BRIDGE_<SECTION>_<KEY>`
//! environment overrides (`spec.md` §6, "Configuration surface" and "CLI").

use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;

#[derive(Debug, Clone)]
pub struct HubConfig {
    pub companion: CompanionConfig,
    pub transport: TransportConfig,
}

#[derive(Debug, Clone)]
pub struct CompanionConfig {
    pub host: String,
    pub port: u16,
    pub device_id: String,
    pub product_name: String,
    pub auto_reconnect: bool,
    pub reconnect_delay: u64,
    pub max_reconnect_attempts: u32,
    pub heartbeat_interval: u64,
    pub connection_timeout: u64,
}

#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub host: String,
    pub port: u16,
    pub max_clients: u32,
    pub rate_limit: u32,
    pub rate_limit_window: u64,
    pub idle_timeout: u64,
    pub require_auth: bool,
    pub auth_tokens: Vec<String>,
    pub max_message_size: usize,
    pub heartbeat_interval: u64,
}

impl HubConfig {
    #[must_use]
    pub fn default_values() -> Self {
        Self {
            companion: CompanionConfig {
                host: "127.0.0.1".to_owned(),
                port: bridge_satellite::DEFAULT_PORT,
                device_id: "hub".to_owned(),
                product_name: "Bridge Hub".to_owned(),
                auto_reconnect: true,
                reconnect_delay: 1_000,
                max_reconnect_attempts: 0,
                heartbeat_interval: 5_000,
                connection_timeout: 5_000,
            },
            transport: TransportConfig {
                host: "0.0.0.0".to_owned(),
                port: 9000,
                max_clients: 64,
                rate_limit: 100,
                rate_limit_window: 1_000,
                idle_timeout: 60_000,
                require_auth: false,
                auth_tokens: Vec::new(),
                max_message_size: 1_048_576,
                heartbeat_interval: 15_000,
            },
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct RawConfig {
    companion: Option<RawCompanionConfig>,
    transport: Option<RawTransportConfig>,
}

#[derive(Debug, Default, Deserialize)]
struct RawCompanionConfig {
    host: Option<String>,
    port: Option<u16>,
    device_id: Option<String>,
    product_name: Option<String>,
    auto_reconnect: Option<bool>,
    reconnect_delay: Option<u64>,
    max_reconnect_attempts: Option<u32>,
    heartbeat_interval: Option<u64>,
    connection_timeout: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct RawTransportConfig {
    host: Option<String>,
    port: Option<u16>,
    max_clients: Option<u32>,
    rate_limit: Option<u32>,
    rate_limit_window: Option<u64>,
    idle_timeout: Option<u64>,
    require_auth: Option<bool>,
    auth_tokens: Option<Vec<String>>,
    max_message_size: Option<usize>,
    heartbeat_interval: Option<u64>,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("reading config file '{path}': {source}")]
    Io { path: String, source: std::io::Error },
    #[error("parsing config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid value for '{key}': {reason}")]
    InvalidValue { key: String, reason: String },
}

/// Loads from `path` if it exists, falling back to defaults with only the
/// environment overlay applied (`spec.md` §6's CLI section treats a missing
/// config file as non-fatal; `--validate` is what makes a missing/invalid
/// file an error).
pub fn load(path: Option<&Path>) -> Result<HubConfig, ConfigError> {
    let raw = match path {
        Some(path) if path.exists() => {
            let text = std::fs::read_to_string(path)
                .map_err(|source| ConfigError::Io { path: path.display().to_string(), source })?;
            toml::from_str(&text)?
        }
        _ => RawConfig::default(),
    };

    let mut config = apply_raw(raw);
    apply_env_overrides(&mut config, &std::env::vars().collect())?;
    Ok(config)
}

fn apply_raw(raw: RawConfig) -> HubConfig {
    let defaults = HubConfig::default_values();
    let companion = raw.companion.unwrap_or_default();
    let transport = raw.transport.unwrap_or_default();

    HubConfig {
        companion: CompanionConfig {
            host: companion.host.unwrap_or(defaults.companion.host),
            port: companion.port.unwrap_or(defaults.companion.port),
            device_id: companion.device_id.unwrap_or(defaults.companion.device_id),
            product_name: companion.product_name.unwrap_or(defaults.companion.product_name),
            auto_reconnect: companion.auto_reconnect.unwrap_or(defaults.companion.auto_reconnect),
            reconnect_delay: companion.reconnect_delay.unwrap_or(defaults.companion.reconnect_delay),
            max_reconnect_attempts: companion
                .max_reconnect_attempts
                .unwrap_or(defaults.companion.max_reconnect_attempts),
            heartbeat_interval: companion.heartbeat_interval.unwrap_or(defaults.companion.heartbeat_interval),
            connection_timeout: companion.connection_timeout.unwrap_or(defaults.companion.connection_timeout),
        },
        transport: TransportConfig {
            host: transport.host.unwrap_or(defaults.transport.host),
            port: transport.port.unwrap_or(defaults.transport.port),
            max_clients: transport.max_clients.unwrap_or(defaults.transport.max_clients),
            rate_limit: transport.rate_limit.unwrap_or(defaults.transport.rate_limit),
            rate_limit_window: transport.rate_limit_window.unwrap_or(defaults.transport.rate_limit_window),
            idle_timeout: transport.idle_timeout.unwrap_or(defaults.transport.idle_timeout),
            require_auth: transport.require_auth.unwrap_or(defaults.transport.require_auth),
            auth_tokens: transport.auth_tokens.unwrap_or(defaults.transport.auth_tokens),
            max_message_size: transport.max_message_size.unwrap_or(defaults.transport.max_message_size),
            heartbeat_interval: transport.heartbeat_interval.unwrap_or(defaults.transport.heartbeat_interval),
        },
    }
}

/// `BRIDGE_<SECTION>_<KEY>` overlay (`spec.md` §6): `true`/`false`, integers,
/// and comma-lists are parsed by the value's own type; anything else is left
/// as a string.
fn apply_env_overrides(config: &mut HubConfig, vars: &HashMap<String, String>) -> Result<(), ConfigError> {
    for (name, value) in vars {
        let Some(rest) = name.strip_prefix("BRIDGE_") else { continue };
        let Some((section, key)) = rest.split_once('_') else { continue };
        let key = key.to_ascii_lowercase();
        match section.to_ascii_uppercase().as_str() {
            "COMPANION" => apply_companion_override(&mut config.companion, &key, value)?,
            "TRANSPORT" => apply_transport_override(&mut config.transport, &key, value)?,
            _ => {}
        }
    }
    Ok(())
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value {
        "true" => Ok(true),
        "false" => Ok(false),
        other => Err(ConfigError::InvalidValue { key: key.to_owned(), reason: format!("expected true/false, got '{other}'") }),
    }
}

fn parse_num<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidValue { key: key.to_owned(), reason: format!("expected a number, got '{value}'") })
}

fn apply_companion_override(companion: &mut CompanionConfig, key: &str, value: &str) -> Result<(), ConfigError> {
    match key {
        "host" => companion.host = value.to_owned(),
        "port" => companion.port = parse_num("companion.port", value)?,
        "deviceid" => companion.device_id = value.to_owned(),
        "productname" => companion.product_name = value.to_owned(),
        "autoreconnect" => companion.auto_reconnect = parse_bool("companion.autoReconnect", value)?,
        "reconnectdelay" => companion.reconnect_delay = parse_num("companion.reconnectDelay", value)?,
        "maxreconnectattempts" => companion.max_reconnect_attempts = parse_num("companion.maxReconnectAttempts", value)?,
        "heartbeatinterval" => companion.heartbeat_interval = parse_num("companion.heartbeatInterval", value)?,
        "connectiontimeout" => companion.connection_timeout = parse_num("companion.connectionTimeout", value)?,
        _ => {}
    }
    Ok(())
}

fn apply_transport_override(transport: &mut TransportConfig, key: &str, value: &str) -> Result<(), ConfigError> {
    match key {
        "host" => transport.host = value.to_owned(),
        "port" => transport.port = parse_num("transport.port", value)?,
        "maxclients" => transport.max_clients = parse_num("transport.maxClients", value)?,
        "ratelimit" => transport.rate_limit = parse_num("transport.rateLimit", value)?,
        "ratelimitwindow" => transport.rate_limit_window = parse_num("transport.rateLimitWindow", value)?,
        "idletimeout" => transport.idle_timeout = parse_num("transport.idleTimeout", value)?,
        "requireauth" => transport.require_auth = parse_bool("transport.requireAuth", value)?,
        "authtokens" => transport.auth_tokens = value.split(',').map(str::to_owned).collect(),
        "maxmessagesize" => transport.max_message_size = parse_num("transport.maxMessageSize", value)?,
        "heartbeatinterval" => transport.heartbeat_interval = parse_num("transport.heartbeatInterval", value)?,
        _ => {}
    }
    Ok(())
}
