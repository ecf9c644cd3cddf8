//! Octopus edge configuration loading.
//!
//! TOML is the sole config source.  Default path: `/etc/dim/octopus.toml`.
//!
//! # Required fields
//! - `schema_version = 1`
//! - `station.id`, `station.host`, `station.port` (the inner station)
//! - `identity.secret_file` (signing key material, raw base64 on one line)
//!
//! Each `[[peers]]` entry describes one outer station link.

use dim_core::Id;
use serde::Deserialize;
use std::path::Path;

// ---------------------------------------------------------------------------
// Config types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct OctopusConfig {
    pub schema_version: u32,
    /// The local station this edge belongs to (and logs in as).
    pub station: StationLink,
    /// Peer stations to bridge.
    pub peers: Vec<StationLink>,
    /// Signing key material read from `identity.secret_file`.
    pub secret: Vec<u8>,
    /// Local identity meta/visa, announced on entering Running.
    pub meta: Option<serde_json::Value>,
    pub visa: Option<serde_json::Value>,
    pub tuning: TuningConfig,
}

#[derive(Debug, Clone)]
pub struct StationLink {
    pub id: Id,
    pub host: String,
    pub port: u16,
}

impl StationLink {
    pub fn ws_url(&self) -> String {
        format!("ws://{}:{}/", self.host, self.port)
    }
}

#[derive(Debug, Clone)]
pub struct TuningConfig {
    /// State machine evaluation interval.
    pub tick_millis: u64,
    /// Handshaking falls back to Connected after this.
    pub handshake_timeout_secs: u64,
    /// Keep-online report interval once Running.
    pub keepalive_secs: u64,
    /// Reconnect back-off after a link error.
    pub reconnect_secs: u64,
}

impl Default for TuningConfig {
    fn default() -> TuningConfig {
        TuningConfig {
            tick_millis: 2000,
            handshake_timeout_secs: 30,
            keepalive_secs: 300,
            reconnect_secs: 8,
        }
    }
}

// ---------------------------------------------------------------------------
// Raw TOML deserialization types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RawConfig {
    schema_version: Option<u32>,
    station: Option<RawLink>,
    identity: Option<RawIdentity>,
    peers: Option<Vec<RawLink>>,
    tuning: Option<RawTuning>,
}

#[derive(Debug, Deserialize)]
struct RawLink {
    id: Option<String>,
    host: Option<String>,
    port: Option<u16>,
}

#[derive(Debug, Deserialize)]
struct RawIdentity {
    secret_file: Option<String>,
    meta_file: Option<String>,
    visa_file: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawTuning {
    tick_millis: Option<u64>,
    handshake_timeout_secs: Option<u64>,
    keepalive_secs: Option<u64>,
    reconnect_secs: Option<u64>,
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

pub fn load_config_from_path(path: &Path) -> Result<OctopusConfig, ConfigError> {
    let toml_str = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Io(format!("reading config file '{}': {}", path.display(), e)))?;
    load_config_from_str(&toml_str)
}

pub fn load_config() -> Result<OctopusConfig, ConfigError> {
    load_config_from_path(Path::new("/etc/dim/octopus.toml"))
}

fn parse_link(raw: RawLink, section: &str) -> Result<StationLink, ConfigError> {
    let id_str = raw
        .id
        .ok_or_else(|| ConfigError::MissingField(format!("{section}.id")))?;
    let id: Id = id_str
        .parse()
        .map_err(|e| ConfigError::InvalidValue(format!("{section}.id: {e}")))?;
    Ok(StationLink {
        id: id.with_network(dim_core::EntityType::Station),
        host: raw
            .host
            .ok_or_else(|| ConfigError::MissingField(format!("{section}.host")))?,
        port: raw
            .port
            .ok_or_else(|| ConfigError::MissingField(format!("{section}.port")))?,
    })
}

pub fn load_config_from_str(toml_str: &str) -> Result<OctopusConfig, ConfigError> {
    let raw: RawConfig = toml::from_str(toml_str).map_err(|e| ConfigError::Parse(e.to_string()))?;

    let schema_version = raw
        .schema_version
        .ok_or_else(|| ConfigError::MissingField("schema_version".to_owned()))?;
    if schema_version != 1 {
        return Err(ConfigError::InvalidValue(format!(
            "schema_version must be 1, got {}",
            schema_version
        )));
    }

    let station = parse_link(
        raw.station
            .ok_or_else(|| ConfigError::MissingField("station".to_owned()))?,
        "station",
    )?;

    let identity = raw
        .identity
        .ok_or_else(|| ConfigError::MissingField("identity".to_owned()))?;
    let secret_file = identity
        .secret_file
        .ok_or_else(|| ConfigError::MissingField("identity.secret_file".to_owned()))?;
    let secret = read_secret_file(&secret_file)?;
    let meta = identity.meta_file.as_deref().map(read_json_file).transpose()?;
    let visa = identity.visa_file.as_deref().map(read_json_file).transpose()?;

    let mut peers = Vec::new();
    for (i, p) in raw.peers.unwrap_or_default().into_iter().enumerate() {
        peers.push(parse_link(p, &format!("peers[{i}]"))?);
    }

    let defaults = TuningConfig::default();
    let tuning = match raw.tuning {
        Some(t) => TuningConfig {
            tick_millis: t.tick_millis.unwrap_or(defaults.tick_millis),
            handshake_timeout_secs: t
                .handshake_timeout_secs
                .unwrap_or(defaults.handshake_timeout_secs),
            keepalive_secs: t.keepalive_secs.unwrap_or(defaults.keepalive_secs),
            reconnect_secs: t.reconnect_secs.unwrap_or(defaults.reconnect_secs),
        },
        None => defaults,
    };

    Ok(OctopusConfig {
        schema_version,
        station,
        peers,
        secret,
        meta,
        visa,
        tuning,
    })
}

fn read_json_file(path: &str) -> Result<serde_json::Value, ConfigError> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Io(format!("reading '{}': {}", path, e)))?;
    serde_json::from_str(&content)
        .map_err(|e| ConfigError::InvalidValue(format!("'{}' is not JSON: {}", path, e)))
}

fn read_secret_file(path: &str) -> Result<Vec<u8>, ConfigError> {
    use base64::Engine;
    let content = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Io(format!("reading secret file '{}': {}", path, e)))?;
    base64::engine::general_purpose::STANDARD
        .decode(content.trim())
        .map_err(|e| ConfigError::InvalidValue(format!("secret file not base64: {e}")))
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(String),
    #[error("Parse error: {0}")]
    Parse(String),
    #[error("Missing required field: {0}")]
    MissingField(String),
    #[error("Invalid config value: {0}")]
    InvalidValue(String),
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
