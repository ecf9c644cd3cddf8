//! Entity identifiers.
//!
//! An ID has the form `name@address[/terminal]`.  The address is either one
//! of the two broadcast addresses (`anywhere`, `everywhere`) or an opaque
//! string minted by the account layer.  The terminal part names a login
//! point and is excluded from identity comparison.
//!
//! The entity type of a concrete address is not recoverable from the string
//! alone; IDs parsed off the wire default to `User` and are re-typed by the
//! account store (meta records, neighbor tables, ANS) when a routing
//! decision needs it.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

// ---------------------------------------------------------------------------
// EntityType
// ---------------------------------------------------------------------------

/// Numeric entity type carried by an ID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityType {
    User = 0,
    Group = 1,
    Station = 2,
    Isp = 3,
    Bot = 4,
}

impl EntityType {
    pub fn is_user(self) -> bool {
        matches!(self, EntityType::User | EntityType::Bot)
    }

    pub fn is_group(self) -> bool {
        self == EntityType::Group
    }
}

// ---------------------------------------------------------------------------
// Address
// ---------------------------------------------------------------------------

/// The address part of an ID.
///
/// `Anywhere` and `Everywhere` are the two broadcast addresses; everything
/// else is an opaque concrete address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Address {
    Anywhere,
    Everywhere,
    Concrete(String),
}

impl Address {
    pub fn is_broadcast(&self) -> bool {
        matches!(self, Address::Anywhere | Address::Everywhere)
    }

    /// The entity type implied by a broadcast address:
    /// `anywhere` addresses a single (any) user, `everywhere` a group.
    pub fn broadcast_type(&self) -> Option<EntityType> {
        match self {
            Address::Anywhere => Some(EntityType::User),
            Address::Everywhere => Some(EntityType::Group),
            Address::Concrete(_) => None,
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Anywhere => write!(f, "anywhere"),
            Address::Everywhere => write!(f, "everywhere"),
            Address::Concrete(s) => write!(f, "{}", s),
        }
    }
}

impl From<&str> for Address {
    fn from(s: &str) -> Self {
        match s {
            "anywhere" => Address::Anywhere,
            "everywhere" => Address::Everywhere,
            other => Address::Concrete(other.to_owned()),
        }
    }
}

// ---------------------------------------------------------------------------
// Id
// ---------------------------------------------------------------------------

/// Error type for ID parsing.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum IdError {
    #[error("empty identifier")]
    Empty,
    #[error("identifier has no address part: {0}")]
    MissingAddress(String),
}

/// An entity identifier: `name@address[/terminal]`.
///
/// Equality and hashing cover name and address only; the terminal and the
/// (derived) entity type are advisory.
#[derive(Debug, Clone)]
pub struct Id {
    pub name: String,
    pub address: Address,
    pub terminal: Option<String>,
    network: EntityType,
}

impl Id {
    /// Well-known: `anyone@anywhere`.
    pub fn anyone() -> Id {
        Id::new("anyone", Address::Anywhere, EntityType::User)
    }

    /// Well-known: `everyone@everywhere`.
    pub fn everyone() -> Id {
        Id::new("everyone", Address::Everywhere, EntityType::Group)
    }

    /// Well-known: `station@anywhere` (any station).
    pub fn any_station() -> Id {
        Id::new("station", Address::Anywhere, EntityType::Station)
    }

    /// Well-known: `stations@everywhere` (every station).
    pub fn every_station() -> Id {
        Id::new("stations", Address::Everywhere, EntityType::Station)
    }

    pub fn new(name: &str, address: Address, network: EntityType) -> Id {
        Id {
            name: name.to_owned(),
            address,
            terminal: None,
            network,
        }
    }

    /// A concrete station ID (used by config / neighbor tables).
    pub fn station(name: &str, address: &str) -> Id {
        Id::new(name, Address::Concrete(address.to_owned()), EntityType::Station)
    }

    /// A concrete bot ID (used by ANS records).
    pub fn bot(name: &str, address: &str) -> Id {
        Id::new(name, Address::Concrete(address.to_owned()), EntityType::Bot)
    }

    /// A concrete user ID.
    pub fn user(name: &str, address: &str) -> Id {
        Id::new(name, Address::Concrete(address.to_owned()), EntityType::User)
    }

    /// A concrete group ID.
    pub fn group(name: &str, address: &str) -> Id {
        Id::new(name, Address::Concrete(address.to_owned()), EntityType::Group)
    }

    pub fn network(&self) -> EntityType {
        self.network
    }

    /// Re-type this ID (account layer resolved the real entity type).
    pub fn with_network(mut self, network: EntityType) -> Id {
        self.network = network;
        self
    }

    pub fn with_terminal(mut self, terminal: &str) -> Id {
        self.terminal = Some(terminal.to_owned());
        self
    }

    /// True when the address is `anywhere` or `everywhere`.
    pub fn is_broadcast(&self) -> bool {
        self.address.is_broadcast()
    }

    pub fn is_group(&self) -> bool {
        match self.address.broadcast_type() {
            Some(t) => t.is_group(),
            None => self.network.is_group(),
        }
    }

    pub fn is_user(&self) -> bool {
        match self.address.broadcast_type() {
            Some(t) => t.is_user(),
            None => self.network.is_user(),
        }
    }

    /// The identity string without the terminal part.
    pub fn without_terminal(&self) -> String {
        format!("{}@{}", self.name, self.address)
    }
}

impl FromStr for Id {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Id, IdError> {
        let s = s.trim();
        if s.is_empty() {
            return Err(IdError::Empty);
        }
        let (identity, terminal) = match s.split_once('/') {
            Some((id, term)) if !term.is_empty() => (id, Some(term.to_owned())),
            _ => (s, None),
        };
        let (name, address) = identity
            .split_once('@')
            .ok_or_else(|| IdError::MissingAddress(s.to_owned()))?;
        let address = Address::from(address);
        let network = address.broadcast_type().unwrap_or(EntityType::User);
        Ok(Id {
            name: name.to_owned(),
            address,
            terminal,
            network,
        })
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.terminal {
            Some(t) => write!(f, "{}@{}/{}", self.name, self.address, t),
            None => write!(f, "{}@{}", self.name, self.address),
        }
    }
}

impl PartialEq for Id {
    fn eq(&self, other: &Id) -> bool {
        self.name == other.name && self.address == other.address
    }
}

impl Eq for Id {}

impl Hash for Id {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.name.hash(state);
        self.address.hash(state);
    }
}

// Serialize as the plain string form; deserialize by parsing it back.

impl Serialize for Id {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Id {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Id, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_name_address_terminal() {
        let id: Id = "alice@4WBSiDzg9cpZGPqFrQ4bHcq4U5z9QAQqHv/iphone".parse().unwrap();
        assert_eq!(id.name, "alice");
        assert_eq!(
            id.address,
            Address::Concrete("4WBSiDzg9cpZGPqFrQ4bHcq4U5z9QAQqHv".to_owned())
        );
        assert_eq!(id.terminal.as_deref(), Some("iphone"));
        assert!(!id.is_broadcast());
        assert!(id.is_user());
    }

    #[test]
    fn terminal_excluded_from_identity() {
        let a: Id = "alice@abc123/iphone".parse().unwrap();
        let b: Id = "alice@abc123/desktop".parse().unwrap();
        assert_eq!(a, b);
        assert_eq!(a.without_terminal(), "alice@abc123");
    }

    #[test]
    fn broadcast_singletons() {
        assert_eq!(Id::anyone().to_string(), "anyone@anywhere");
        assert_eq!(Id::everyone().to_string(), "everyone@everywhere");
        assert_eq!(Id::any_station().to_string(), "station@anywhere");
        assert_eq!(Id::every_station().to_string(), "stations@everywhere");
        assert!(Id::anyone().is_broadcast());
        assert!(Id::everyone().is_broadcast());
        assert!(Id::everyone().is_group());
        assert!(Id::anyone().is_user());
        assert!(!Id::every_station().is_user());
    }

    #[test]
    fn parse_rejects_missing_address() {
        assert_eq!(
            "alice".parse::<Id>().unwrap_err(),
            IdError::MissingAddress("alice".to_owned())
        );
        assert_eq!("".parse::<Id>().unwrap_err(), IdError::Empty);
    }

    #[test]
    fn display_round_trips() {
        for s in ["alice@abc123", "archivist@anywhere", "g1@xyz/term"] {
            let id: Id = s.parse().unwrap();
            assert_eq!(id.to_string(), s);
        }
    }

    #[test]
    fn retyping_does_not_change_identity() {
        let parsed: Id = "relay9@9fQz7W1".parse().unwrap();
        let typed = parsed.clone().with_network(EntityType::Station);
        assert_eq!(parsed, typed);
        assert!(!typed.is_user());
        assert_eq!(typed.network(), EntityType::Station);
    }

    #[test]
    fn serde_uses_string_form() {
        let id: Id = "bob@def456/pad".parse().unwrap();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"bob@def456/pad\"");
        let back: Id = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }
}
