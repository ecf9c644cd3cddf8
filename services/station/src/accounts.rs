//! Account database: metas, documents, logins, users and neighbor tables.
//!
//! On-disk layout under the configured database root (JSON files):
//!
//! ```text
//! public/{address}/meta.js             entity meta (immutable once written)
//! public/{address}/documents/{type}.js entity documents
//! public/providers.js                  service provider table
//! public/{address}/stations.js         provider's station list
//! private/users.js                     local users
//! private/{address}/login.js           latest login command + envelope
//! private/{address}/contacts.js        social graph
//! private/{address}/members.js         group members
//! private/{address}/block.js           block list
//! ```
//!
//! All reads go through in-memory caches; writes go to disk first, then
//! update the cache.  Entity typing for routing decisions lives here too:
//! the wire form of an ID does not carry its entity type, so the account
//! layer resolves it from what it knows (neighbor tables, ANS records,
//! meta records, membership files).

use crate::config::{DatabaseConfig, NeighborConfig};
use chrono::Utc;
use dim_core::{EntityType, Id, LoginCommand};
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::RwLock;
use tracing::{debug, warn};

/// Documents stamped further in the future than this are rejected.
const DOCUMENT_TIME_SLACK_SECS: f64 = 65.0;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Neighbor {
    pub id: Id,
    pub host: String,
    pub port: u16,
    pub chosen: u32,
}

/// A service provider; stations belong to one provider each.
#[derive(Debug, Clone)]
pub struct Provider {
    pub id: Id,
    pub chosen: u32,
}

#[derive(Debug, Clone)]
pub struct LoginRecord {
    pub command: LoginCommand,
    /// Envelope of the message that carried the login command.
    pub envelope: Value,
}

#[derive(Debug, thiserror::Error)]
pub enum AccountError {
    #[error("IO error: {0}")]
    Io(String),
    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("meta for {0} already exists")]
    Immutable(String),
    #[error("invalid document: {0}")]
    InvalidDocument(String),
    #[error("broadcast address has no storage: {0}")]
    Broadcast(String),
}

// ---------------------------------------------------------------------------
// AccountStore
// ---------------------------------------------------------------------------

pub struct AccountStore {
    public_root: PathBuf,
    private_root: PathBuf,
    local_station: Id,
    metas: RwLock<HashMap<String, Value>>,
    documents: RwLock<HashMap<String, HashMap<String, Value>>>,
    logins: RwLock<HashMap<Id, LoginRecord>>,
    neighbors: RwLock<Vec<Neighbor>>,
    providers: RwLock<Vec<Provider>>,
    ans: RwLock<HashMap<String, Id>>,
    users: RwLock<Vec<Id>>,
    blocks: RwLock<HashMap<String, Vec<Id>>>,
}

impl AccountStore {
    /// Open the store, creating the directory skeleton and loading the
    /// tables that exist.
    pub fn open(
        db: &DatabaseConfig,
        local_station: Id,
        config_ans: &[(String, Id)],
        config_neighbors: &[NeighborConfig],
    ) -> Result<AccountStore, AccountError> {
        std::fs::create_dir_all(&db.public)
            .map_err(|e| AccountError::Io(format!("creating {}: {}", db.public.display(), e)))?;
        std::fs::create_dir_all(&db.private)
            .map_err(|e| AccountError::Io(format!("creating {}: {}", db.private.display(), e)))?;

        let mut ans: HashMap<String, Id> = HashMap::new();
        for (name, id) in config_ans {
            ans.insert(name.clone(), id.clone());
        }
        // The station's own name always resolves to itself.
        ans.insert("station".to_owned(), local_station.clone());

        let neighbors = config_neighbors
            .iter()
            .map(|n| Neighbor {
                id: n.id.clone(),
                host: n.host.clone(),
                port: n.port,
                chosen: n.chosen,
            })
            .collect();

        let store = AccountStore {
            public_root: db.public.clone(),
            private_root: db.private.clone(),
            local_station,
            metas: RwLock::new(HashMap::new()),
            documents: RwLock::new(HashMap::new()),
            logins: RwLock::new(HashMap::new()),
            neighbors: RwLock::new(neighbors),
            providers: RwLock::new(Vec::new()),
            ans: RwLock::new(ans),
            users: RwLock::new(Vec::new()),
            blocks: RwLock::new(HashMap::new()),
        };
        store.load_users();
        store.load_providers();
        store.load_stations();
        Ok(store)
    }

    pub fn local_station(&self) -> &Id {
        &self.local_station
    }

    // -----------------------------------------------------------------------
    // Paths
    // -----------------------------------------------------------------------

    fn address_of(id: &Id) -> Result<String, AccountError> {
        if id.is_broadcast() {
            return Err(AccountError::Broadcast(id.to_string()));
        }
        Ok(id.address.to_string())
    }

    fn meta_path(&self, address: &str) -> PathBuf {
        self.public_root.join(address).join("meta.js")
    }

    fn document_path(&self, address: &str, doc_type: &str) -> PathBuf {
        self.public_root
            .join(address)
            .join("documents")
            .join(format!("{}.js", doc_type))
    }

    fn login_path(&self, address: &str) -> PathBuf {
        self.private_root.join(address).join("login.js")
    }

    fn block_path(&self, address: &str) -> PathBuf {
        self.private_root.join(address).join("block.js")
    }

    fn members_path(&self, address: &str) -> PathBuf {
        self.private_root.join(address).join("members.js")
    }

    fn write_json(path: &PathBuf, value: &Value) -> Result<(), AccountError> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)
                .map_err(|e| AccountError::Io(format!("creating {}: {}", dir.display(), e)))?;
        }
        let text = serde_json::to_string_pretty(value)?;
        std::fs::write(path, text)
            .map_err(|e| AccountError::Io(format!("writing {}: {}", path.display(), e)))
    }

    fn read_json(path: &PathBuf) -> Option<Value> {
        let text = std::fs::read_to_string(path).ok()?;
        match serde_json::from_str(&text) {
            Ok(v) => Some(v),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "unreadable JSON file");
                None
            }
        }
    }

    // -----------------------------------------------------------------------
    // Meta
    // -----------------------------------------------------------------------

    /// Store an entity meta.  Meta is immutable: a second write for the
    /// same address returns `Immutable`.
    pub fn save_meta(&self, id: &Id, meta: Value) -> Result<(), AccountError> {
        let address = Self::address_of(id)?;
        if self.meta(id).is_some() {
            return Err(AccountError::Immutable(id.to_string()));
        }
        Self::write_json(&self.meta_path(&address), &meta)?;
        self.metas.write().unwrap().insert(address, meta);
        Ok(())
    }

    pub fn meta(&self, id: &Id) -> Option<Value> {
        let address = Self::address_of(id).ok()?;
        if let Some(m) = self.metas.read().unwrap().get(&address) {
            return Some(m.clone());
        }
        let meta = Self::read_json(&self.meta_path(&address))?;
        self.metas
            .write()
            .unwrap()
            .insert(address, meta.clone());
        Some(meta)
    }

    // -----------------------------------------------------------------------
    // Documents
    // -----------------------------------------------------------------------

    /// Store an entity document after validating its time stamp is not in
    /// the far future.
    pub fn save_document(&self, id: &Id, doc_type: &str, doc: Value) -> Result<(), AccountError> {
        let address = Self::address_of(id)?;
        if let Some(time) = doc.get("time").and_then(Value::as_f64) {
            let now = Utc::now().timestamp() as f64;
            if time > now + DOCUMENT_TIME_SLACK_SECS {
                return Err(AccountError::InvalidDocument(format!(
                    "document time {} is {}s in the future",
                    time,
                    time - now
                )));
            }
        }
        Self::write_json(&self.document_path(&address, doc_type), &doc)?;
        self.documents
            .write()
            .unwrap()
            .entry(address)
            .or_default()
            .insert(doc_type.to_owned(), doc);
        Ok(())
    }

    pub fn document(&self, id: &Id, doc_type: &str) -> Option<Value> {
        let address = Self::address_of(id).ok()?;
        if let Some(d) = self
            .documents
            .read()
            .unwrap()
            .get(&address)
            .and_then(|m| m.get(doc_type))
        {
            return Some(d.clone());
        }
        let doc = Self::read_json(&self.document_path(&address, doc_type))?;
        self.documents
            .write()
            .unwrap()
            .entry(address)
            .or_default()
            .insert(doc_type.to_owned(), doc.clone());
        Some(doc)
    }

    /// The local station's visa document, if published.
    pub fn station_visa(&self) -> Option<Value> {
        self.document(&self.local_station, "visa")
    }

    pub fn station_meta(&self) -> Option<Value> {
        self.meta(&self.local_station)
    }

    // -----------------------------------------------------------------------
    // Login commands
    // -----------------------------------------------------------------------

    /// Persist a login command.  An older command (by time) never replaces
    /// a newer one.
    pub fn save_login(&self, command: LoginCommand, envelope: Value) -> Result<bool, AccountError> {
        let user = command.id.clone();
        let address = Self::address_of(&user)?;
        {
            let logins = self.logins.read().unwrap();
            if let Some(existing) = logins.get(&user) {
                if existing.command.time >= command.time {
                    debug!(user = %user, "stale login command ignored");
                    return Ok(false);
                }
            }
        }
        let record = serde_json::json!({ "command": command, "envelope": envelope });
        Self::write_json(&self.login_path(&address), &record)?;
        self.logins
            .write()
            .unwrap()
            .insert(user, LoginRecord { command, envelope });
        Ok(true)
    }

    pub fn login(&self, user: &Id) -> Option<LoginRecord> {
        if let Some(r) = self.logins.read().unwrap().get(user) {
            return Some(r.clone());
        }
        let address = Self::address_of(user).ok()?;
        let value = Self::read_json(&self.login_path(&address))?;
        let command: LoginCommand = serde_json::from_value(value.get("command")?.clone()).ok()?;
        let envelope = value.get("envelope")?.clone();
        let record = LoginRecord { command, envelope };
        self.logins
            .write()
            .unwrap()
            .insert(user.clone(), record.clone());
        Some(record)
    }

    /// The station a user last logged in to, per their login command.
    pub fn roaming_station(&self, user: &Id) -> Option<Id> {
        Some(self.login(user)?.command.station.id)
    }

    // -----------------------------------------------------------------------
    // Identity key
    // -----------------------------------------------------------------------

    /// The station's identity key material from `private/{address}/secret.js`,
    /// generated on first boot.
    pub fn station_secret(&self) -> Result<Vec<u8>, AccountError> {
        use base64::Engine;
        use base64::engine::general_purpose::STANDARD as B64;

        let address = Self::address_of(&self.local_station)?;
        let path = self.private_root.join(&address).join("secret.js");
        if let Some(value) = Self::read_json(&path) {
            if let Some(encoded) = value.get("secret").and_then(Value::as_str) {
                if let Ok(secret) = B64.decode(encoded) {
                    return Ok(secret);
                }
            }
            warn!(path = %path.display(), "unreadable secret file, regenerating");
        }
        let secret: Vec<u8> = uuid::Uuid::new_v4()
            .as_bytes()
            .iter()
            .chain(uuid::Uuid::new_v4().as_bytes())
            .copied()
            .collect();
        let value = serde_json::json!({ "secret": B64.encode(&secret) });
        Self::write_json(&path, &value)?;
        Ok(secret)
    }

    // -----------------------------------------------------------------------
    // Users, neighbors, providers
    // -----------------------------------------------------------------------

    fn load_users(&self) {
        let path = self.private_root.join("users.js");
        if let Some(Value::Array(items)) = Self::read_json(&path) {
            let users = items
                .iter()
                .filter_map(|v| v.as_str())
                .filter_map(|s| s.parse::<Id>().ok())
                .collect();
            *self.users.write().unwrap() = users;
        }
    }

    fn load_providers(&self) {
        let path = self.public_root.join("providers.js");
        let Some(Value::Array(items)) = Self::read_json(&path) else {
            return;
        };
        let providers = items
            .iter()
            .filter_map(|item| {
                let id = item
                    .get("ID")
                    .and_then(Value::as_str)
                    .and_then(|s| s.parse::<Id>().ok())?;
                Some(Provider {
                    id: id.with_network(EntityType::Isp),
                    chosen: item.get("chosen").and_then(Value::as_u64).unwrap_or(0) as u32,
                })
            })
            .collect();
        *self.providers.write().unwrap() = providers;
    }

    pub fn providers(&self) -> Vec<Provider> {
        self.providers.read().unwrap().clone()
    }

    fn load_stations(&self) {
        // public/{address}/stations.js holds this provider's station list;
        // merge into the neighbor table (config entries win on conflict).
        let address = self.local_station.address.to_string();
        let path = self.public_root.join(&address).join("stations.js");
        let Some(Value::Array(items)) = Self::read_json(&path) else {
            return;
        };
        let mut neighbors = self.neighbors.write().unwrap();
        for item in items {
            let Some(id) = item
                .get("ID")
                .and_then(Value::as_str)
                .and_then(|s| s.parse::<Id>().ok())
            else {
                continue;
            };
            let id = id.with_network(EntityType::Station);
            if neighbors.iter().any(|n| n.id == id) {
                continue;
            }
            neighbors.push(Neighbor {
                id,
                host: item
                    .get("host")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_owned(),
                port: item.get("port").and_then(Value::as_u64).unwrap_or(0) as u16,
                chosen: item.get("chosen").and_then(Value::as_u64).unwrap_or(0) as u32,
            });
        }
    }

    pub fn local_users(&self) -> Vec<Id> {
        self.users.read().unwrap().clone()
    }

    pub fn neighbors(&self) -> Vec<Neighbor> {
        self.neighbors.read().unwrap().clone()
    }

    pub fn is_neighbor(&self, id: &Id) -> bool {
        self.neighbors.read().unwrap().iter().any(|n| &n.id == id)
    }

    // -----------------------------------------------------------------------
    // ANS
    // -----------------------------------------------------------------------

    pub fn ans_resolve(&self, name: &str) -> Option<Id> {
        self.ans.read().unwrap().get(name).cloned()
    }

    pub fn ans_records(&self, names: &[String]) -> HashMap<String, Id> {
        let ans = self.ans.read().unwrap();
        names
            .iter()
            .filter_map(|n| ans.get(n).map(|id| (n.clone(), id.clone())))
            .collect()
    }

    /// Bots included in an EVERYONE broadcast: every configured bot record
    /// except group assistants.  Falls back to the `archivist` record.
    pub fn station_bots(&self) -> Vec<Id> {
        let ans = self.ans.read().unwrap();
        let mut bots: Vec<Id> = ans
            .iter()
            .filter(|(name, id)| {
                *name != "station" && *name != "assistant" && id.network() == EntityType::Bot
            })
            .map(|(_, id)| id.clone())
            .collect();
        bots.sort_by_key(Id::to_string);
        if bots.is_empty() {
            if let Some(archivist) = ans.get("archivist") {
                bots.push(archivist.clone());
            }
        }
        bots
    }

    /// Assistant bots for a group: the group document's `assistants` list,
    /// else the ANS `assistant` record.
    pub fn group_assistants(&self, group: &Id) -> Vec<Id> {
        if let Some(doc) = self.document(group, "bulletin") {
            if let Some(list) = doc.get("assistants").and_then(Value::as_array) {
                let assistants: Vec<Id> = list
                    .iter()
                    .filter_map(|v| v.as_str())
                    .filter_map(|s| s.parse::<Id>().ok())
                    .map(|id| id.with_network(EntityType::Bot))
                    .collect();
                if !assistants.is_empty() {
                    return assistants;
                }
            }
        }
        self.ans_resolve("assistant").into_iter().collect()
    }

    pub fn group_members(&self, group: &Id) -> Vec<Id> {
        let Ok(address) = Self::address_of(group) else {
            return Vec::new();
        };
        match Self::read_json(&self.members_path(&address)) {
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(|v| v.as_str())
                .filter_map(|s| s.parse::<Id>().ok())
                .collect(),
            _ => Vec::new(),
        }
    }

    // -----------------------------------------------------------------------
    // Block list
    // -----------------------------------------------------------------------

    /// True when `receiver` has blocked `sender`.
    pub fn is_blocked(&self, sender: &Id, receiver: &Id) -> bool {
        let Ok(address) = Self::address_of(receiver) else {
            return false;
        };
        {
            let blocks = self.blocks.read().unwrap();
            if let Some(list) = blocks.get(&address) {
                return list.contains(sender);
            }
        }
        let list: Vec<Id> = match Self::read_json(&self.block_path(&address)) {
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(|v| v.as_str())
                .filter_map(|s| s.parse::<Id>().ok())
                .collect(),
            _ => Vec::new(),
        };
        let blocked = list.contains(sender);
        self.blocks.write().unwrap().insert(address, list);
        blocked
    }

    // -----------------------------------------------------------------------
    // Entity typing
    // -----------------------------------------------------------------------

    /// Resolve the entity type of an ID for routing decisions.
    pub fn entity_type(&self, id: &Id) -> EntityType {
        if let Some(t) = id.address.broadcast_type() {
            return t;
        }
        if id == &self.local_station || self.is_neighbor(id) {
            return EntityType::Station;
        }
        {
            let ans = self.ans.read().unwrap();
            if let Some(record) = ans.values().find(|r| *r == id) {
                return record.network();
            }
        }
        if let Some(meta) = self.meta(id) {
            if let Some(t) = meta.get("type").and_then(Value::as_u64) {
                return match t {
                    1 => EntityType::Group,
                    2 => EntityType::Station,
                    3 => EntityType::Isp,
                    4 => EntityType::Bot,
                    _ => EntityType::User,
                };
            }
        }
        if !self.group_members(id).is_empty() {
            return EntityType::Group;
        }
        id.network()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
