//! Established peer connection
//!
//! A connection owns a FIFO of outbound messages drained by a single writer
//! task, so tokens are solved and counters assigned in send order.

use crate::authorization::CancelFlag;
use crate::frame::{read_frame, write_frame};
use crate::protocol::{Handshake, NetworkMessage};
use crate::transport::BoxedStream;
use crate::{NetworkError, NetworkResult};
use agora_core::{NetworkId, TransportType};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, oneshot, watch};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

/// Queued outbound message with an optional completion signal
pub(crate) struct Outbound {
    pub(crate) message: NetworkMessage,
    pub(crate) done: Option<oneshot::Sender<NetworkResult<()>>>,
}

pub struct Connection {
    id: ConnectionId,
    peer: NetworkId,
    /// Peer's advertised load as f64 bits
    peer_load: AtomicU64,
    transport: TransportType,
    direction: Direction,
    outbound: mpsc::Sender<Outbound>,
    cancel: CancelFlag,
    closed: AtomicBool,
    closed_tx: watch::Sender<bool>,
    established_at: Instant,
}

impl Connection {
    pub(crate) fn new(
        id: ConnectionId,
        handshake: &Handshake,
        transport: TransportType,
        direction: Direction,
        queue_size: usize,
    ) -> (Arc<Self>, mpsc::Receiver<Outbound>) {
        let (outbound, rx) = mpsc::channel(queue_size.max(1));
        let (closed_tx, _) = watch::channel(false);
        let connection = Arc::new(Self {
            id,
            peer: handshake.network_id.clone(),
            peer_load: AtomicU64::new(handshake.load.to_bits()),
            transport,
            direction,
            outbound,
            cancel: CancelFlag::new(),
            closed: AtomicBool::new(false),
            closed_tx,
            established_at: Instant::now(),
        });
        (connection, rx)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer(&self) -> &NetworkId {
        &self.peer
    }

    /// Load the peer last advertised; prices the tokens we mint for it
    pub fn peer_load(&self) -> f64 {
        f64::from_bits(self.peer_load.load(Ordering::Acquire))
    }

    pub(crate) fn set_peer_load(&self, load: f64) {
        let load = if load.is_finite() { load.clamp(0.0, 1.0) } else { 1.0 };
        self.peer_load.store(load.to_bits(), Ordering::Release);
    }

    pub fn transport(&self) -> TransportType {
        self.transport
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn established_at(&self) -> Instant {
        self.established_at
    }

    pub(crate) fn cancel_flag(&self) -> &CancelFlag {
        &self.cancel
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn closed_signal(&self) -> watch::Receiver<bool> {
        self.closed_tx.subscribe()
    }

    /// Mark closed, cancel pending proof-of-work and wake the I/O tasks
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.cancel.cancel();
            let _ = self.closed_tx.send(true);
        }
    }

    /// Send and wait until the frame is written
    pub async fn send(&self, message: NetworkMessage) -> NetworkResult<()> {
        if self.is_closed() {
            return Err(NetworkError::ConnectionClosed(self.id));
        }
        let (done, rx) = oneshot::channel();
        self.outbound
            .send(Outbound {
                message,
                done: Some(done),
            })
            .await
            .map_err(|_| NetworkError::ConnectionClosed(self.id))?;
        rx.await
            .map_err(|_| NetworkError::ConnectionClosed(self.id))?
    }

    /// Queue without waiting for the write
    pub fn enqueue(&self, message: NetworkMessage) -> NetworkResult<()> {
        if self.is_closed() {
            return Err(NetworkError::ConnectionClosed(self.id));
        }
        self.outbound
            .try_send(Outbound {
                message,
                done: None,
            })
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => NetworkError::QueueFull(self.id),
                mpsc::error::TrySendError::Closed(_) => NetworkError::ConnectionClosed(self.id),
            })
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("peer", &self.peer.node_id)
            .field("transport", &self.transport)
            .field("direction", &self.direction)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Exchange handshakes; the dialing side speaks first
pub(crate) async fn exchange_handshake(
    stream: &mut BoxedStream,
    ours: &Handshake,
    direction: Direction,
    max_frame_size: usize,
) -> NetworkResult<Handshake> {
    let bytes = ours.serialize()?;
    let theirs = match direction {
        Direction::Outbound => {
            write_frame(stream, &bytes, max_frame_size).await?;
            read_frame(stream, max_frame_size).await?
        }
        Direction::Inbound => {
            let theirs = read_frame(stream, max_frame_size).await?;
            write_frame(stream, &bytes, max_frame_size).await?;
            theirs
        }
    };
    let handshake = Handshake::deserialize(&theirs)?;
    handshake.validate()?;
    Ok(handshake)
}

#[cfg(test)]
mod tests {
    use super::*;
    use agora_core::Address;
    use agora_crypto::KeyPair;

    fn handshake(port: u16) -> Handshake {
        let id = NetworkId::with_clear_address(
            KeyPair::generate().public_key(),
            Address::localhost(port),
        )
        .unwrap();
        Handshake::new(id, 0.25)
    }

    #[tokio::test]
    async fn test_handshake_exchange() {
        let (a, b) = tokio::io::duplex(4096);
        let mut a: BoxedStream = Box::new(a);
        let mut b: BoxedStream = Box::new(b);
        let ha = handshake(1);
        let hb = handshake(2);

        let hb_clone = hb.clone();
        let responder = tokio::spawn(async move {
            exchange_handshake(&mut b, &hb_clone, Direction::Inbound, 1024 * 1024).await
        });
        let got_b = exchange_handshake(&mut a, &ha, Direction::Outbound, 1024 * 1024)
            .await
            .unwrap();
        let got_a = responder.await.unwrap().unwrap();

        assert_eq!(got_b.network_id, hb.network_id);
        assert_eq!(got_a.network_id, ha.network_id);
        assert_eq!(got_a.load, 0.25);
    }

    #[tokio::test]
    async fn test_send_after_close_fails() {
        let (conn, _rx) = Connection::new(
            ConnectionId(1),
            &handshake(1),
            TransportType::Clear,
            Direction::Outbound,
            4,
        );
        conn.close();
        assert!(conn.cancel_flag().is_cancelled());
        assert!(matches!(
            conn.send(NetworkMessage::Close { reason: "x".into() }).await,
            Err(NetworkError::ConnectionClosed(ConnectionId(1)))
        ));
    }

    #[test]
    fn test_peer_load_updates() {
        let (conn, _rx) = Connection::new(
            ConnectionId(3),
            &handshake(1),
            TransportType::Clear,
            Direction::Outbound,
            4,
        );
        assert_eq!(conn.peer_load(), 0.25);
        conn.set_peer_load(0.75);
        assert_eq!(conn.peer_load(), 0.75);
        conn.set_peer_load(f64::NAN);
        assert_eq!(conn.peer_load(), 1.0);
    }

    #[tokio::test]
    async fn test_enqueue_full_queue() {
        let (conn, _rx) = Connection::new(
            ConnectionId(2),
            &handshake(1),
            TransportType::Clear,
            Direction::Inbound,
            1,
        );
        conn.enqueue(NetworkMessage::Gossip { body: vec![1] }).unwrap();
        assert!(matches!(
            conn.enqueue(NetworkMessage::Gossip { body: vec![2] }),
            Err(NetworkError::QueueFull(_))
        ));
    }
}
