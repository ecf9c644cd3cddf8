//! Station configuration loading.
//!
//! TOML is the sole config source; no environment variable overrides.
//! Default config path: `/etc/dim/station.toml`.
//!
//! # Required fields
//! - `schema_version = 1`
//! - `database.root`
//! - `server.host`, `server.port`, `server.id`
//!
//! Neighbor stations, ANS records and tuning knobs are optional; tuning
//! defaults match the reference deployment.

use dim_core::Id;
use serde::Deserialize;
use std::path::{Path, PathBuf};

// ---------------------------------------------------------------------------
// Config types (deserialized from TOML)
// ---------------------------------------------------------------------------

/// Top-level station configuration.
#[derive(Debug, Clone)]
pub struct StationConfig {
    pub schema_version: u32,
    pub database: DatabaseConfig,
    pub server: ServerConfig,
    /// ANS records from config; the `station` name always resolves to the
    /// local station.
    pub ans: Vec<(String, Id)>,
    pub neighbors: Vec<NeighborConfig>,
    pub tuning: TuningConfig,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub root: PathBuf,
    pub public: PathBuf,
    pub private: PathBuf,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub id: Id,
}

#[derive(Debug, Clone)]
pub struct NeighborConfig {
    pub host: String,
    pub port: u16,
    pub id: Id,
    pub chosen: u32,
}

/// Cache sizes and timeouts; reference defaults, overridable per deployment.
#[derive(Debug, Clone)]
pub struct TuningConfig {
    /// Per-receiver offline store cap; overflow drops oldest.
    pub offline_cap: usize,
    /// Broadcast neighbor snapshot refresh interval.
    pub neighbor_snapshot_secs: u64,
    /// Handshaking state falls back to Connected after this.
    pub handshake_timeout_secs: u64,
    /// Per-session outbound queue capacity.
    pub queue_capacity: usize,
    /// Push center queue: drop above this length.
    pub push_queue_cap: usize,
    /// Push center queue: warn above this length.
    pub push_queue_warn: usize,
    /// Suspended (pre-handshake) messages are evicted after this.
    pub suspend_ttl_secs: u64,
    /// Roaming replay page size.
    pub roaming_page: usize,
}

impl Default for TuningConfig {
    fn default() -> TuningConfig {
        TuningConfig {
            offline_cap: 71_680,
            neighbor_snapshot_secs: 128,
            handshake_timeout_secs: 30,
            queue_capacity: 8192,
            push_queue_cap: 100_000,
            push_queue_warn: 65_535,
            suspend_ttl_secs: 300,
            roaming_page: 1024,
        }
    }
}

// ---------------------------------------------------------------------------
// Raw TOML deserialization types (with Option for optional fields)
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RawConfig {
    schema_version: Option<u32>,
    database: Option<RawDatabase>,
    server: Option<RawServer>,
    ans: Option<std::collections::BTreeMap<String, String>>,
    neighbors: Option<Vec<RawNeighbor>>,
    tuning: Option<RawTuning>,
}

#[derive(Debug, Deserialize)]
struct RawDatabase {
    root: Option<String>,
    public: Option<String>,
    private: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawServer {
    host: Option<String>,
    port: Option<u16>,
    id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawNeighbor {
    host: Option<String>,
    port: Option<u16>,
    id: Option<String>,
    chosen: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct RawTuning {
    offline_cap: Option<usize>,
    neighbor_snapshot_secs: Option<u64>,
    handshake_timeout_secs: Option<u64>,
    queue_capacity: Option<usize>,
    push_queue_cap: Option<usize>,
    push_queue_warn: Option<usize>,
    suspend_ttl_secs: Option<u64>,
    roaming_page: Option<usize>,
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Load station config from a custom path.
pub fn load_config_from_path(path: &Path) -> Result<StationConfig, ConfigError> {
    let toml_str = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Io(format!("reading config file '{}': {}", path.display(), e)))?;
    load_config_from_str(&toml_str)
}

/// Load station config from the default path `/etc/dim/station.toml`.
pub fn load_config() -> Result<StationConfig, ConfigError> {
    load_config_from_path(Path::new("/etc/dim/station.toml"))
}

/// Load station config from a TOML string.
pub fn load_config_from_str(toml_str: &str) -> Result<StationConfig, ConfigError> {
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

    let raw_db = raw
        .database
        .ok_or_else(|| ConfigError::MissingField("database".to_owned()))?;
    let root = PathBuf::from(
        raw_db
            .root
            .ok_or_else(|| ConfigError::MissingField("database.root".to_owned()))?,
    );
    let database = DatabaseConfig {
        public: raw_db
            .public
            .map_or_else(|| root.join("public"), PathBuf::from),
        private: raw_db
            .private
            .map_or_else(|| root.join("private"), PathBuf::from),
        root,
    };

    let raw_server = raw
        .server
        .ok_or_else(|| ConfigError::MissingField("server".to_owned()))?;
    let id_str = raw_server
        .id
        .ok_or_else(|| ConfigError::MissingField("server.id".to_owned()))?;
    let id: Id = id_str
        .parse()
        .map_err(|e| ConfigError::InvalidValue(format!("server.id: {}", e)))?;
    let server = ServerConfig {
        host: raw_server
            .host
            .ok_or_else(|| ConfigError::MissingField("server.host".to_owned()))?,
        port: raw_server
            .port
            .ok_or_else(|| ConfigError::MissingField("server.port".to_owned()))?,
        id: id.with_network(dim_core::EntityType::Station),
    };

    let mut ans = Vec::new();
    if let Some(records) = raw.ans {
        for (name, value) in records {
            let id: Id = value
                .parse()
                .map_err(|e| ConfigError::InvalidValue(format!("ans.{}: {}", name, e)))?;
            ans.push((name, id.with_network(dim_core::EntityType::Bot)));
        }
    }

    let mut neighbors = Vec::new();
    for (i, n) in raw.neighbors.unwrap_or_default().into_iter().enumerate() {
        let id_str = n
            .id
            .ok_or_else(|| ConfigError::MissingField(format!("neighbors[{}].id", i)))?;
        let id: Id = id_str
            .parse()
            .map_err(|e| ConfigError::InvalidValue(format!("neighbors[{}].id: {}", i, e)))?;
        neighbors.push(NeighborConfig {
            host: n
                .host
                .ok_or_else(|| ConfigError::MissingField(format!("neighbors[{}].host", i)))?,
            port: n
                .port
                .ok_or_else(|| ConfigError::MissingField(format!("neighbors[{}].port", i)))?,
            id: id.with_network(dim_core::EntityType::Station),
            chosen: n.chosen.unwrap_or(0),
        });
    }

    let defaults = TuningConfig::default();
    let tuning = match raw.tuning {
        Some(t) => TuningConfig {
            offline_cap: t.offline_cap.unwrap_or(defaults.offline_cap),
            neighbor_snapshot_secs: t
                .neighbor_snapshot_secs
                .unwrap_or(defaults.neighbor_snapshot_secs),
            handshake_timeout_secs: t
                .handshake_timeout_secs
                .unwrap_or(defaults.handshake_timeout_secs),
            queue_capacity: t.queue_capacity.unwrap_or(defaults.queue_capacity),
            push_queue_cap: t.push_queue_cap.unwrap_or(defaults.push_queue_cap),
            push_queue_warn: t.push_queue_warn.unwrap_or(defaults.push_queue_warn),
            suspend_ttl_secs: t.suspend_ttl_secs.unwrap_or(defaults.suspend_ttl_secs),
            roaming_page: t.roaming_page.unwrap_or(defaults.roaming_page),
        },
        None => defaults,
    };

    Ok(StationConfig {
        schema_version,
        database,
        server,
        ans,
        neighbors,
        tuning,
    })
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
