//! Agora Core Library
//!
//! Value types shared by the network, storage and trade layers

pub mod identity;
pub mod time;
pub mod wallet;

// Re-export main types
pub use identity::{Address, NetworkId, TransportType};
pub use wallet::{SignedMessage, SpendableOutput, TxId};

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    #[error("Network id has no reachable address")]
    NoAddress,

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Empty node id")]
    EmptyNodeId,

    #[error("Invalid public key")]
    InvalidPublicKey,
}
