//! Agora Network Module
//!
//! Transports, framing, proof-of-work admission and gossip routing.

pub mod authorization;
pub mod clearnet;
pub mod connection;
pub mod frame;
pub mod manager;
pub mod memory;
pub mod protocol;
pub mod retry;
pub mod router;
pub mod strikes;
pub mod transport;

pub use authorization::{
    AuthorizationConfig, AuthorizationError, AuthorizationService, AuthorizationToken, CancelFlag,
    MessageClass,
};
pub use clearnet::ClearNetTransport;
pub use connection::{Connection, ConnectionId, Direction};
pub use frame::{decode_varint, encode_varint, FrameError};
pub use manager::{InboundMessage, MessageHandler, NetworkConfig, NetworkService};
pub use memory::{MemoryNetwork, MemoryTransport};
pub use protocol::{Channel, Envelope, Handshake, NetworkMessage, ProtocolError, PROTOCOL_VERSION};
pub use retry::{retry_with_backoff, RetryPolicy};
pub use router::{BroadcastResult, GossipRouter, RouterConfig};
pub use strikes::{ConnectionStrikes, StrikeReason};
pub use transport::{BoxedStream, Transport, TransportConfig, TransportError};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Authorization error: {0}")]
    Authorization(#[from] AuthorizationError),

    #[error("Connection {0} closed")]
    ConnectionClosed(ConnectionId),

    #[error("Outbound queue full on {0}")]
    QueueFull(ConnectionId),

    #[error("No supported transport to reach {0}")]
    NoRoute(String),

    #[error("Peer unreachable: {0}")]
    PeerUnreachable(String),

    #[error("Handshake timed out")]
    HandshakeTimeout,

    #[error("Refusing connection to self")]
    SelfConnection,

    #[error("Connection limit of {0} reached")]
    ConnectionLimit(usize),

    #[error("Network service not started")]
    NotStarted,
}

impl NetworkError {
    /// Errors worth retrying with backoff
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            NetworkError::Transport(_)
                | NetworkError::Frame(_)
                | NetworkError::ConnectionClosed(_)
                | NetworkError::QueueFull(_)
                | NetworkError::HandshakeTimeout
        )
    }
}

pub type NetworkResult<T> = Result<T, NetworkError>;
