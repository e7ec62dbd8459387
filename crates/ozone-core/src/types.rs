use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::CoreError;
use crate::frame::Intent;

/// Intent tag reserved for the synthetic liveness broadcast.
pub const HEARTBEAT_INTENT: &str = "HEARTBEAT";
/// Destination wildcard meaning "every known peer".
pub const WILDCARD: &str = "*";
/// Socket port services listen on when a peer address carries none.
pub const DEFAULT_SOCKET_PORT: u16 = 1122;

/// A remote service reachable by name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerDescriptor {
    pub name: String,
    /// Host name, optionally suffixed with `:port`.
    pub address: String,
}

impl PeerDescriptor {
    pub fn new(name: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
        }
    }

    /// Returns `host:port`, filling in `default_port` when the address has none.
    pub fn authority(&self, default_port: u16) -> String {
        let has_port = self
            .address
            .rsplit_once(':')
            .is_some_and(|(host, port)| !host.is_empty() && port.parse::<u16>().is_ok());
        if has_port {
            self.address.clone()
        } else {
            format!("{}:{}", self.address, default_port)
        }
    }
}

impl FromStr for PeerDescriptor {
    type Err = CoreError;

    /// Parses `name=address`; a bare `name` uses itself as the host.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (name, address) = match s.split_once('=') {
            Some((name, address)) => (name.trim(), address.trim()),
            None => (s.trim(), s.trim()),
        };
        if name.is_empty() || address.is_empty() {
            return Err(CoreError::InvalidPeer(s.to_string()));
        }
        if name == WILDCARD {
            return Err(CoreError::ReservedName(name.to_string()));
        }
        Ok(Self::new(name, address))
    }
}

impl fmt::Display for PeerDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name, self.address)
    }
}

/// Where an outbound event should go.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Destination {
    /// Every known peer except the origin.
    All,
    Peer(String),
}

impl Destination {
    pub fn peer(name: impl Into<String>) -> Self {
        Destination::Peer(name.into())
    }

    pub fn as_peer(&self) -> Option<&str> {
        match self {
            Destination::All => None,
            Destination::Peer(name) => Some(name),
        }
    }
}

impl From<String> for Destination {
    fn from(value: String) -> Self {
        if value == WILDCARD {
            Destination::All
        } else {
            Destination::Peer(value)
        }
    }
}

impl From<Destination> for String {
    fn from(value: Destination) -> Self {
        match value {
            Destination::All => WILDCARD.to_string(),
            Destination::Peer(name) => name,
        }
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Destination::All => f.write_str(WILDCARD),
            Destination::Peer(name) => f.write_str(name),
        }
    }
}

/// Immutable event record flowing through the outbound queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundEvent {
    pub intent: String,
    pub destination: Destination,
    pub data: Value,
}

impl OutboundEvent {
    pub fn new(intent: impl Into<String>, destination: Destination, data: Value) -> Self {
        Self {
            intent: intent.into(),
            destination,
            data,
        }
    }

    /// Wildcard event addressed to every known peer.
    pub fn broadcast(intent: impl Into<String>, data: Value) -> Self {
        Self::new(intent, Destination::All, data)
    }

    pub fn heartbeat(data: Value) -> Self {
        Self::broadcast(HEARTBEAT_INTENT, data)
    }

    pub fn is_heartbeat(&self) -> bool {
        self.intent == HEARTBEAT_INTENT
    }

    /// Copy of this event addressed to a single peer.
    pub fn addressed_to(&self, peer: &str) -> Self {
        Self {
            intent: self.intent.clone(),
            destination: Destination::peer(peer),
            data: self.data.clone(),
        }
    }

    /// Wire representation, which drops the routing destination.
    pub fn to_intent(&self) -> Intent {
        Intent::new(self.intent.clone(), self.data.clone())
    }
}
