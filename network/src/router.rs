//! Gossip router
//!
//! Broadcasts go to a random subset of connected peers and resolve once
//! enough of them acknowledge or the deadline passes. Relays skip the peer a
//! message came from, and every gossip hash is remembered for a window so the
//! same item is not processed twice.

use crate::connection::{Connection, ConnectionId};
use crate::protocol::NetworkMessage;
use crate::NetworkResult;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use rand::seq::SliceRandom;
use serde::Deserialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::debug;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Peers each broadcast is sent to
    pub fanout: usize,
    /// Acks that complete a broadcast early
    pub ack_threshold: usize,
    pub ack_timeout_ms: u64,
    pub dedup_window_secs: u64,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            fanout: 8,
            ack_threshold: 2,
            ack_timeout_ms: 2_000,
            dedup_window_secs: 60,
        }
    }
}

impl RouterConfig {
    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    pub fn dedup_window(&self) -> Duration {
        Duration::from_secs(self.dedup_window_secs)
    }
}

/// Outcome of one broadcast
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BroadcastResult {
    pub sent: usize,
    pub acked: usize,
    pub timed_out: bool,
}

pub struct GossipRouter {
    config: RouterConfig,
    seen: DashMap<[u8; 32], Instant>,
    pending_acks: DashMap<[u8; 32], mpsc::UnboundedSender<ConnectionId>>,
}

impl GossipRouter {
    pub fn new() -> Self {
        Self::with_config(RouterConfig::default())
    }

    pub fn with_config(config: RouterConfig) -> Self {
        Self {
            config,
            seen: DashMap::new(),
            pending_acks: DashMap::new(),
        }
    }

    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    /// Record a gossip hash; false if it was already seen inside the window
    pub fn is_new(&self, hash: [u8; 32]) -> bool {
        let window = self.config.dedup_window();
        match self.seen.entry(hash) {
            Entry::Occupied(mut seen_at) => {
                if seen_at.get().elapsed() > window {
                    seen_at.insert(Instant::now());
                    true
                } else {
                    false
                }
            }
            Entry::Vacant(slot) => {
                slot.insert(Instant::now());
                true
            }
        }
    }

    /// Drop dedup entries older than the window
    pub fn prune(&self) {
        let window = self.config.dedup_window();
        self.seen.retain(|_, seen_at| seen_at.elapsed() <= window);
    }

    pub fn seen_count(&self) -> usize {
        self.seen.len()
    }

    /// Route an inbound ack to the broadcast waiting for it
    pub fn on_ack(&self, message_hash: [u8; 32], from: ConnectionId) {
        if let Some(waiter) = self.pending_acks.get(&message_hash) {
            let _ = waiter.send(from);
        }
    }

    /// Fan a message out to a random subset of `connections`.
    ///
    /// `exclude` is the connection the message arrived on, if any.
    pub async fn broadcast(
        &self,
        connections: Vec<Arc<Connection>>,
        message: NetworkMessage,
        exclude: Option<ConnectionId>,
    ) -> NetworkResult<BroadcastResult> {
        let hash = message.hash()?;
        // never reprocess our own message if a peer relays it back
        self.is_new(hash);

        let mut targets: Vec<Arc<Connection>> = connections
            .into_iter()
            .filter(|c| Some(c.id()) != exclude && !c.is_closed())
            .collect();
        {
            let mut rng = rand::rng();
            targets.shuffle(&mut rng);
        }
        targets.truncate(self.config.fanout);

        if targets.is_empty() {
            return Ok(BroadcastResult {
                sent: 0,
                acked: 0,
                timed_out: false,
            });
        }

        let (tx, mut rx) = mpsc::unbounded_channel();
        self.pending_acks.insert(hash, tx);

        let mut sent_to = HashSet::new();
        for connection in &targets {
            match connection.enqueue(message.clone()) {
                Ok(()) => {
                    sent_to.insert(connection.id());
                }
                Err(e) => {
                    debug!(connection = %connection.id(), error = %e, "Broadcast enqueue failed");
                }
            }
        }

        let needed = self.config.ack_threshold.min(sent_to.len());
        let mut acked = HashSet::new();
        let wait = async {
            while acked.len() < needed {
                match rx.recv().await {
                    Some(from) if sent_to.contains(&from) => {
                        acked.insert(from);
                    }
                    Some(_) => {}
                    None => break,
                }
            }
        };
        let timed_out = tokio::time::timeout(self.config.ack_timeout(), wait)
            .await
            .is_err();
        self.pending_acks.remove(&hash);

        Ok(BroadcastResult {
            sent: sent_to.len(),
            acked: acked.len(),
            timed_out,
        })
    }
}

impl Default for GossipRouter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{Direction, Outbound};
    use crate::protocol::Handshake;
    use agora_core::{Address, NetworkId, TransportType};
    use agora_crypto::KeyPair;

    fn connection(id: u64) -> (Arc<Connection>, mpsc::Receiver<Outbound>) {
        let network_id = NetworkId::with_clear_address(
            KeyPair::generate().public_key(),
            Address::localhost(id as u16),
        )
        .unwrap();
        Connection::new(
            ConnectionId(id),
            &Handshake::new(network_id, 0.0),
            TransportType::Clear,
            Direction::Outbound,
            16,
        )
    }

    /// Spawn a fake peer that acks every gossip it receives
    fn acking_peer(router: Arc<GossipRouter>, id: u64, mut rx: mpsc::Receiver<Outbound>) {
        tokio::spawn(async move {
            while let Some(out) = rx.recv().await {
                let hash = out.message.hash().unwrap();
                router.on_ack(hash, ConnectionId(id));
            }
        });
    }

    fn config(fanout: usize, ack_threshold: usize, ack_timeout_ms: u64) -> RouterConfig {
        RouterConfig {
            fanout,
            ack_threshold,
            ack_timeout_ms,
            dedup_window_secs: 60,
        }
    }

    #[tokio::test]
    async fn test_broadcast_resolves_on_ack_threshold() {
        let router = Arc::new(GossipRouter::with_config(config(8, 2, 5_000)));
        let mut connections = Vec::new();
        for id in 1..=3 {
            let (conn, rx) = connection(id);
            acking_peer(router.clone(), id, rx);
            connections.push(conn);
        }

        let result = router
            .broadcast(connections, NetworkMessage::Gossip { body: vec![1] }, None)
            .await
            .unwrap();

        assert_eq!(result.sent, 3);
        assert!(result.acked >= 2);
        assert!(!result.timed_out);
    }

    #[tokio::test]
    async fn test_broadcast_times_out_without_acks() {
        let router = GossipRouter::with_config(config(8, 2, 50));
        let (a, _rx_a) = connection(1);
        let (b, _rx_b) = connection(2);

        let result = router
            .broadcast(vec![a, b], NetworkMessage::Gossip { body: vec![1] }, None)
            .await
            .unwrap();

        assert_eq!(result.sent, 2);
        assert_eq!(result.acked, 0);
        assert!(result.timed_out);
    }

    #[tokio::test]
    async fn test_fanout_bounds_targets() {
        let router = GossipRouter::with_config(config(3, 1, 20));
        let mut connections = Vec::new();
        let mut receivers = Vec::new();
        for id in 1..=10 {
            let (conn, rx) = connection(id);
            connections.push(conn);
            receivers.push(rx);
        }

        let result = router
            .broadcast(connections, NetworkMessage::Gossip { body: vec![9] }, None)
            .await
            .unwrap();
        assert_eq!(result.sent, 3);

        let delivered = receivers
            .iter_mut()
            .map(|rx| rx.try_recv().is_ok())
            .filter(|got| *got)
            .count();
        assert_eq!(delivered, 3);
    }

    #[tokio::test]
    async fn test_relay_never_echoes_origin() {
        let router = GossipRouter::with_config(config(8, 1, 20));
        let (origin, mut origin_rx) = connection(1);
        let (other, mut other_rx) = connection(2);

        let result = router
            .broadcast(
                vec![origin, other],
                NetworkMessage::Gossip { body: vec![3] },
                Some(ConnectionId(1)),
            )
            .await
            .unwrap();

        assert_eq!(result.sent, 1);
        assert!(origin_rx.try_recv().is_err());
        assert!(other_rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_acks_from_non_targets_ignored() {
        let router = Arc::new(GossipRouter::with_config(config(8, 1, 50)));
        let (target, _rx) = connection(1);
        let message = NetworkMessage::Gossip { body: vec![4] };
        let hash = message.hash().unwrap();

        let r = router.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            r.on_ack(hash, ConnectionId(77));
        });

        let result = router.broadcast(vec![target], message, None).await.unwrap();
        assert_eq!(result.acked, 0);
        assert!(result.timed_out);
    }

    #[test]
    fn test_dedup_window() {
        let router = GossipRouter::with_config(RouterConfig {
            dedup_window_secs: 0,
            ..Default::default()
        });
        let hash = [1u8; 32];
        assert!(router.is_new(hash));
        std::thread::sleep(Duration::from_millis(5));
        // zero-length window: entry is already stale
        assert!(router.is_new(hash));
        router.prune();

        let router = GossipRouter::new();
        assert!(router.is_new(hash));
        assert!(!router.is_new(hash));
        assert!(router.is_new([2u8; 32]));
        assert_eq!(router.seen_count(), 2);
    }

    #[tokio::test]
    async fn test_own_broadcast_marked_seen() {
        let router = GossipRouter::new();
        let message = NetworkMessage::Gossip { body: vec![5] };
        let hash = message.hash().unwrap();
        router.broadcast(Vec::new(), message, None).await.unwrap();
        assert!(!router.is_new(hash));
    }
}
