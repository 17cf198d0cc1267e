//! Peer addressing.
//!
//! A `PeerAddress` identifies one node in the mesh. Identity is the opaque
//! `id` string — host and port are reachability hints that may change between
//! announcements, and the metadata map carries display-level extras (name,
//! role) that the transport never interprets.

use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Reserved id for the broadcast destination.
pub const BROADCAST_ID: &str = "*";

/// Address of one mesh peer. Immutable once constructed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerAddress {
    /// Opaque identifier. Two addresses with the same id are the same peer.
    pub id: String,

    /// Reachability hint. May be empty when the peer is only reachable
    /// through a non-socket medium.
    pub host: String,

    /// Link intake port on `host`. 0 when unknown.
    pub port: u16,

    /// Open key→value map: display name, role, channel hints.
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl PeerAddress {
    pub fn new(id: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            id: id.into(),
            host: host.into(),
            port,
            metadata: BTreeMap::new(),
        }
    }

    /// The reserved broadcast destination.
    pub fn broadcast() -> Self {
        Self::new(BROADCAST_ID, "", 0)
    }

    pub fn is_broadcast(&self) -> bool {
        self.id == BROADCAST_ID
    }

    /// `host:port` for socket dialing.
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

// Identity is the id alone. Host/port churn must not split a peer in two.
impl PartialEq for PeerAddress {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for PeerAddress {}

impl Hash for PeerAddress {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.is_empty() {
            write!(f, "{}", self.id)
        } else {
            write!(f, "{}@{}:{}", self.id, self.host, self.port)
        }
    }
}

/// Parse the `id@host:port` form used for static peer configuration.
impl FromStr for PeerAddress {
    type Err = PeerParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (id, rest) = s
            .split_once('@')
            .ok_or_else(|| PeerParseError(s.to_string()))?;
        let (host, port) = rest
            .rsplit_once(':')
            .ok_or_else(|| PeerParseError(s.to_string()))?;
        if id.is_empty() || host.is_empty() {
            return Err(PeerParseError(s.to_string()));
        }
        let port: u16 = port.parse().map_err(|_| PeerParseError(s.to_string()))?;
        Ok(PeerAddress::new(id, host, port))
    }
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("invalid peer address '{0}', expected id@host:port")]
pub struct PeerParseError(String);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_is_id_only() {
        let a = PeerAddress::new("n1", "10.0.0.1", 7350);
        let b = PeerAddress::new("n1", "10.0.0.2", 9999);
        assert_eq!(a, b);

        let c = PeerAddress::new("n2", "10.0.0.1", 7350);
        assert_ne!(a, c);
    }

    #[test]
    fn broadcast_is_reserved() {
        let b = PeerAddress::broadcast();
        assert!(b.is_broadcast());
        assert!(!PeerAddress::new("n1", "", 0).is_broadcast());
    }

    #[test]
    fn parse_static_peer_form() {
        let p: PeerAddress = "node-a@192.168.1.4:7350".parse().unwrap();
        assert_eq!(p.id, "node-a");
        assert_eq!(p.host, "192.168.1.4");
        assert_eq!(p.port, 7350);

        assert!("no-at-sign".parse::<PeerAddress>().is_err());
        assert!("id@hostonly".parse::<PeerAddress>().is_err());
        assert!("id@host:notaport".parse::<PeerAddress>().is_err());
    }

    #[test]
    fn serde_round_trip_keeps_metadata() {
        let p = PeerAddress::new("n1", "fe80::1", 7350).with_metadata("name", "kitchen node");
        let json = serde_json::to_string(&p).unwrap();
        let back: PeerAddress = serde_json::from_str(&json).unwrap();
        assert_eq!(back.metadata.get("name").map(String::as_str), Some("kitchen node"));
    }
}
