//! Transport abstraction
//!
//! A transport hands out opaque, already authenticated byte streams. Framing,
//! envelopes and authorization all live above this trait.

use agora_core::{Address, TransportType};
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

/// Byte stream produced by a transport
pub trait ByteStream: AsyncRead + AsyncWrite + Unpin + Send + Sync {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send + Sync> ByteStream for T {}

pub type BoxedStream = Box<dyn ByteStream>;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Transport {0} is not supported")]
    Unsupported(TransportType),

    #[error("Transport not bound")]
    NotBound,

    #[error("Connect to {0} timed out")]
    ConnectTimeout(Address),

    #[error("No listener at {0}")]
    Unreachable(Address),

    #[error("Transport closed")]
    Closed,
}

/// Per-transport settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Address to bind the listener to
    pub bind: Address,
    /// Address announced to peers when it differs from the bound one
    pub advertise: Option<Address>,
    /// Connect timeout in milliseconds
    pub connect_timeout_ms: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            bind: Address::new("0.0.0.0", 8600),
            advertise: None,
            connect_timeout_ms: 10_000,
        }
    }
}

impl TransportConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    fn transport_type(&self) -> TransportType;

    /// Start listening; returns the reachable address
    async fn bind(&self) -> Result<Address, TransportError>;

    /// Wait for the next inbound stream
    async fn accept(&self) -> Result<(BoxedStream, Address), TransportError>;

    /// Open a stream to a remote address
    async fn connect(&self, address: &Address) -> Result<BoxedStream, TransportError>;

    /// Stop accepting
    async fn close(&self);
}
