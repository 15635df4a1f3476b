//! In-process transport
//!
//! Nodes sharing one `MemoryNetwork` reach each other over tokio duplex pipes.
//! Used by tests and local simulations; behaves like clear-net from the
//! connection layer's point of view.

use crate::transport::{BoxedStream, Transport, TransportError};
use agora_core::{Address, TransportType};
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::io::DuplexStream;
use tokio::sync::{mpsc, Mutex};

const PIPE_CAPACITY: usize = 256 * 1024;

type Incoming = (DuplexStream, Address);

/// Shared registry of bound in-memory listeners
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    listeners: Arc<DashMap<Address, mpsc::Sender<Incoming>>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Transport for a node reachable at `address` on this network
    pub fn transport(&self, address: Address) -> MemoryTransport {
        MemoryTransport {
            network: self.clone(),
            address,
            incoming: Mutex::new(None),
        }
    }

    pub fn is_bound(&self, address: &Address) -> bool {
        self.listeners.contains_key(address)
    }
}

pub struct MemoryTransport {
    network: MemoryNetwork,
    address: Address,
    incoming: Mutex<Option<mpsc::Receiver<Incoming>>>,
}

#[async_trait]
impl Transport for MemoryTransport {
    fn transport_type(&self) -> TransportType {
        TransportType::Clear
    }

    async fn bind(&self) -> Result<Address, TransportError> {
        let (tx, rx) = mpsc::channel(64);
        self.network.listeners.insert(self.address.clone(), tx);
        *self.incoming.lock().await = Some(rx);
        Ok(self.address.clone())
    }

    async fn accept(&self) -> Result<(BoxedStream, Address), TransportError> {
        let mut guard = self.incoming.lock().await;
        let rx = guard.as_mut().ok_or(TransportError::NotBound)?;
        match rx.recv().await {
            Some((stream, from)) => Ok((Box::new(stream) as BoxedStream, from)),
            None => Err(TransportError::Closed),
        }
    }

    async fn connect(&self, address: &Address) -> Result<BoxedStream, TransportError> {
        let listener = self
            .network
            .listeners
            .get(address)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| TransportError::Unreachable(address.clone()))?;

        let (local, remote) = tokio::io::duplex(PIPE_CAPACITY);
        listener
            .send((remote, self.address.clone()))
            .await
            .map_err(|_| TransportError::Unreachable(address.clone()))?;
        Ok(Box::new(local))
    }

    async fn close(&self) {
        self.network.listeners.remove(&self.address);
    }
}
