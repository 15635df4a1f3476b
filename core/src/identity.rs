//! Node identity: public key, logical id and reachable addresses per transport

use crate::CoreError;
use agora_crypto::PublicKey;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Transport a node can be reached over
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TransportType {
    Clear,
    Tor,
    I2p,
}

impl fmt::Display for TransportType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportType::Clear => write!(f, "clear"),
            TransportType::Tor => write!(f, "tor"),
            TransportType::I2p => write!(f, "i2p"),
        }
    }
}

impl FromStr for TransportType {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "clear" | "clearnet" => Ok(TransportType::Clear),
            "tor" => Ok(TransportType::Tor),
            "i2p" => Ok(TransportType::I2p),
            other => Err(CoreError::InvalidAddress(format!(
                "unknown transport: {}",
                other
            ))),
        }
    }
}

/// `host:port` endpoint on one transport
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Address {
    pub host: String,
    pub port: u16,
}

impl Address {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn localhost(port: u16) -> Self {
        Self::new("127.0.0.1", port)
    }

    pub fn is_empty(&self) -> bool {
        self.host.is_empty()
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for Address {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| CoreError::InvalidAddress(s.to_string()))?;
        if host.is_empty() {
            return Err(CoreError::InvalidAddress(s.to_string()));
        }
        let port = port
            .parse::<u16>()
            .map_err(|_| CoreError::InvalidAddress(s.to_string()))?;
        Ok(Self::new(host, port))
    }
}

/// Immutable identity of a node on the network
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NetworkId {
    pub pubkey: PublicKey,
    pub node_id: String,
    pub addresses: BTreeMap<TransportType, Address>,
}

impl NetworkId {
    /// Build a network id, requiring at least one address
    pub fn new(
        pubkey: PublicKey,
        node_id: impl Into<String>,
        addresses: BTreeMap<TransportType, Address>,
    ) -> Result<Self, CoreError> {
        let id = Self {
            pubkey,
            node_id: node_id.into(),
            addresses,
        };
        id.validate()?;
        Ok(id)
    }

    /// Single clear-net address; node id derived from the key
    pub fn with_clear_address(pubkey: PublicKey, address: Address) -> Result<Self, CoreError> {
        let mut addresses = BTreeMap::new();
        addresses.insert(TransportType::Clear, address);
        Self::new(pubkey, Self::derive_node_id(&pubkey), addresses)
    }

    /// Short stable id: first 20 hex chars of the key hash
    pub fn derive_node_id(pubkey: &PublicKey) -> String {
        hex::encode(&pubkey.hash()[..10])
    }

    /// Checks the invariants that deserialization cannot enforce
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.pubkey.is_empty() {
            return Err(CoreError::InvalidPublicKey);
        }
        if self.node_id.is_empty() {
            return Err(CoreError::EmptyNodeId);
        }
        if self.addresses.is_empty() {
            return Err(CoreError::NoAddress);
        }
        if let Some(addr) = self.addresses.values().find(|a| a.is_empty()) {
            return Err(CoreError::InvalidAddress(addr.to_string()));
        }
        Ok(())
    }

    pub fn address_for(&self, transport: TransportType) -> Option<&Address> {
        self.addresses.get(&transport)
    }

    pub fn transports(&self) -> impl Iterator<Item = &TransportType> {
        self.addresses.keys()
    }
}

impl fmt::Display for NetworkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let addrs: Vec<String> = self
            .addresses
            .iter()
            .map(|(t, a)| format!("{}://{}", t, a))
            .collect();
        write!(f, "{} [{}]", self.node_id, addrs.join(", "))
    }
}
