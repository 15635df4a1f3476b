//! Wire protocol for peer communication
//!
//! Handshake, envelope and message types. Everything on the wire is bincode.

use crate::authorization::{AuthorizationToken, MessageClass};
use agora_core::NetworkId;
use agora_crypto::hash_sha256;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Current wire protocol version
pub const PROTOCOL_VERSION: u32 = 1;

/// Current software version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("Protocol version mismatch: expected {expected}, got {actual}")]
    VersionMismatch { expected: u32, actual: u32 },

    #[error("Invalid handshake: {0}")]
    InvalidHandshake(String),
}

/// First frame sent in each direction when a connection opens
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Handshake {
    pub protocol_version: u32,
    pub software_version: String,
    pub network_id: NetworkId,
    /// Sender's connection load in [0, 1]; raises the PoW the peer must do
    pub load: f64,
}

impl Handshake {
    pub fn new(network_id: NetworkId, load: f64) -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
            software_version: VERSION.to_string(),
            network_id,
            load: load.clamp(0.0, 1.0),
        }
    }

    /// Validate handshake from peer
    pub fn validate(&self) -> Result<(), ProtocolError> {
        if self.protocol_version != PROTOCOL_VERSION {
            return Err(ProtocolError::VersionMismatch {
                expected: PROTOCOL_VERSION,
                actual: self.protocol_version,
            });
        }
        self.network_id
            .validate()
            .map_err(|e| ProtocolError::InvalidHandshake(e.to_string()))?;
        if !self.load.is_finite() {
            return Err(ProtocolError::InvalidHandshake("load is not finite".into()));
        }
        Ok(())
    }

    pub fn serialize(&self) -> Result<Vec<u8>, ProtocolError> {
        Ok(bincode::serialize(self)?)
    }

    pub fn deserialize(data: &[u8]) -> Result<Self, ProtocolError> {
        Ok(bincode::deserialize(data)?)
    }
}

/// Point-to-point message channels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Channel {
    Inventory,
    Trade,
}

/// Network message carried inside an envelope
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum NetworkMessage {
    /// Broadcast data, relayed hop by hop
    Gossip { body: Vec<u8> },
    /// Receipt for a gossip message
    Ack { message_hash: [u8; 32] },
    /// Addressed to the connected peer only
    Direct { channel: Channel, body: Vec<u8> },
    /// Sent before an orderly close
    Close { reason: String },
    /// Sender's new connection load in thousandths, replacing the handshake value
    LoadUpdate { load_permille: u16 },
}

impl NetworkMessage {
    /// Authorization class that prices this message
    pub fn class(&self) -> MessageClass {
        match self {
            NetworkMessage::Gossip { .. } => MessageClass::Broadcast,
            NetworkMessage::Ack { .. }
            | NetworkMessage::Close { .. }
            | NetworkMessage::LoadUpdate { .. } => MessageClass::Ack,
            NetworkMessage::Direct { .. } => MessageClass::Direct,
        }
    }

    pub fn load_update(load: f64) -> Self {
        let permille = (load.clamp(0.0, 1.0) * 1000.0).round() as u16;
        NetworkMessage::LoadUpdate {
            load_permille: permille,
        }
    }

    pub fn serialize(&self) -> Result<Vec<u8>, ProtocolError> {
        Ok(bincode::serialize(self)?)
    }

    pub fn deserialize(data: &[u8]) -> Result<Self, ProtocolError> {
        Ok(bincode::deserialize(data)?)
    }

    /// Stable hash used for PoW binding, dedup and acks
    pub fn hash(&self) -> Result<[u8; 32], ProtocolError> {
        Ok(hash_sha256(&self.serialize()?))
    }
}

/// Framed unit on an established connection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub version: u32,
    pub token: AuthorizationToken,
    pub message: NetworkMessage,
}

impl Envelope {
    pub fn new(token: AuthorizationToken, message: NetworkMessage) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            token,
            message,
        }
    }

    pub fn serialize(&self) -> Result<Vec<u8>, ProtocolError> {
        Ok(bincode::serialize(self)?)
    }

    pub fn deserialize(data: &[u8]) -> Result<Self, ProtocolError> {
        let envelope: Envelope = bincode::deserialize(data)?;
        if envelope.version != PROTOCOL_VERSION {
            return Err(ProtocolError::VersionMismatch {
                expected: PROTOCOL_VERSION,
                actual: envelope.version,
            });
        }
        Ok(envelope)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agora_core::Address;
    use agora_crypto::KeyPair;

    fn network_id() -> NetworkId {
        NetworkId::with_clear_address(KeyPair::generate().public_key(), Address::localhost(1))
            .unwrap()
    }

    #[test]
    fn test_handshake_validation() {
        let mut handshake = Handshake::new(network_id(), 0.5);
        assert!(handshake.validate().is_ok());

        handshake.protocol_version = 99;
        assert!(matches!(
            handshake.validate(),
            Err(ProtocolError::VersionMismatch { actual: 99, .. })
        ));
    }

    #[test]
    fn test_handshake_load_clamped() {
        assert_eq!(Handshake::new(network_id(), 7.0).load, 1.0);
        assert_eq!(Handshake::new(network_id(), -1.0).load, 0.0);
    }

    #[test]
    fn test_message_classes() {
        assert_eq!(
            NetworkMessage::Gossip { body: vec![] }.class(),
            MessageClass::Broadcast
        );
        assert_eq!(
            NetworkMessage::Direct {
                channel: Channel::Trade,
                body: vec![]
            }
            .class(),
            MessageClass::Direct
        );
        assert_eq!(
            NetworkMessage::Ack {
                message_hash: [0; 32]
            }
            .class(),
            MessageClass::Ack
        );
    }

    #[test]
    fn test_load_update_is_control_message() {
        let update = NetworkMessage::load_update(0.38);
        assert_eq!(update, NetworkMessage::LoadUpdate { load_permille: 380 });
        assert_eq!(update.class(), MessageClass::Ack);
        assert_eq!(
            NetworkMessage::load_update(3.0),
            NetworkMessage::LoadUpdate { load_permille: 1000 }
        );
    }

    #[test]
    fn test_hash_differs_per_body() {
        let a = NetworkMessage::Gossip { body: vec![1] }.hash().unwrap();
        let b = NetworkMessage::Gossip { body: vec![2] }.hash().unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_envelope_version_checked() {
        let mut envelope = Envelope::new(
            AuthorizationToken::unsolved(MessageClass::Ack, 1, [0; 32]),
            NetworkMessage::Close {
                reason: "bye".into(),
            },
        );
        envelope.version = 7;
        let bytes = envelope.serialize().unwrap();
        assert!(matches!(
            Envelope::deserialize(&bytes),
            Err(ProtocolError::VersionMismatch { actual: 7, .. })
        ));
    }
}
