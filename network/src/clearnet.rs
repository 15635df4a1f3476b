//! Clear-net transport over plain TCP

use crate::transport::{BoxedStream, Transport, TransportConfig, TransportError};
use agora_core::{Address, TransportType};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, info};

pub struct ClearNetTransport {
    config: TransportConfig,
    listener: Mutex<Option<Arc<TcpListener>>>,
    closed: watch::Sender<bool>,
}

impl ClearNetTransport {
    pub fn new(config: TransportConfig) -> Self {
        let (closed, _) = watch::channel(false);
        Self {
            config,
            listener: Mutex::new(None),
            closed,
        }
    }
}

#[async_trait]
impl Transport for ClearNetTransport {
    fn transport_type(&self) -> TransportType {
        TransportType::Clear
    }

    async fn bind(&self) -> Result<Address, TransportError> {
        let listener = TcpListener::bind(self.config.bind.to_string()).await?;
        let local = listener.local_addr()?;
        let address = self
            .config
            .advertise
            .clone()
            .unwrap_or_else(|| Address::new(local.ip().to_string(), local.port()));
        info!(address = %address, "Listening for clear-net peers");
        *self.listener.lock() = Some(Arc::new(listener));
        Ok(address)
    }

    async fn accept(&self) -> Result<(BoxedStream, Address), TransportError> {
        let listener = self
            .listener
            .lock()
            .clone()
            .ok_or(TransportError::NotBound)?;
        let mut closed = self.closed.subscribe();
        if *closed.borrow() {
            return Err(TransportError::Closed);
        }

        tokio::select! {
            accepted = listener.accept() => {
                let (stream, addr) = accepted?;
                stream.set_nodelay(true)?;
                debug!(peer = %addr, "Accepted clear-net connection");
                Ok((Box::new(stream) as BoxedStream, Address::new(addr.ip().to_string(), addr.port())))
            }
            _ = closed.changed() => Err(TransportError::Closed),
        }
    }

    async fn connect(&self, address: &Address) -> Result<BoxedStream, TransportError> {
        let connect = TcpStream::connect(address.to_string());
        let stream = tokio::time::timeout(self.config.connect_timeout(), connect)
            .await
            .map_err(|_| TransportError::ConnectTimeout(address.clone()))??;
        stream.set_nodelay(true)?;
        Ok(Box::new(stream))
    }

    async fn close(&self) {
        self.listener.lock().take();
        let _ = self.closed.send(true);
    }
}
