//! Outbound delivery of trade messages

use crate::message::SignedTradeMessage;
use crate::{TradeError, TradeResult};
use agora_core::NetworkId;
use agora_network::{retry_with_backoff, Channel, NetworkError, NetworkMessage, NetworkService, RetryPolicy};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::warn;

#[async_trait]
pub trait TradeMessenger: Send + Sync {
    /// Deliver `message` to `receiver`; an error means the peer is unreachable
    async fn send(&self, receiver: &NetworkId, message: &SignedTradeMessage) -> TradeResult<()>;
}

/// Sends over the network service, retrying transient failures
pub struct NetworkMessenger {
    network: Arc<NetworkService>,
    retry: RetryPolicy,
}

impl NetworkMessenger {
    pub fn new(network: Arc<NetworkService>) -> Self {
        Self::with_retry(network, RetryPolicy::default())
    }

    pub fn with_retry(network: Arc<NetworkService>, retry: RetryPolicy) -> Self {
        Self { network, retry }
    }
}

#[async_trait]
impl TradeMessenger for NetworkMessenger {
    async fn send(&self, receiver: &NetworkId, message: &SignedTradeMessage) -> TradeResult<()> {
        let body = message.serialize()?;
        let network = &self.network;
        retry_with_backoff(
            self.retry,
            || {
                let body = body.clone();
                async move {
                    network
                        .send(
                            receiver,
                            NetworkMessage::Direct {
                                channel: Channel::Trade,
                                body,
                            },
                        )
                        .await
                }
            },
            NetworkError::is_transient,
        )
        .await
        .map_err(|e| {
            warn!(peer = %receiver.node_id, trade_id = %message.trade_id(), error = %e, "Trade message undeliverable");
            TradeError::PeerUnreachable(receiver.node_id.clone())
        })
    }
}

/// Keeps every message instead of sending it
#[derive(Default)]
pub struct RecordingMessenger {
    sent: Mutex<Vec<(NetworkId, SignedTradeMessage)>>,
    unreachable: AtomicBool,
}

impl RecordingMessenger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every later send fail as if the peer were gone
    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<(NetworkId, SignedTradeMessage)> {
        self.sent.lock().clone()
    }

    /// Remove and return everything recorded so far
    pub fn take(&self) -> Vec<(NetworkId, SignedTradeMessage)> {
        std::mem::take(&mut *self.sent.lock())
    }

    pub fn len(&self) -> usize {
        self.sent.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sent.lock().is_empty()
    }
}

#[async_trait]
impl TradeMessenger for RecordingMessenger {
    async fn send(&self, receiver: &NetworkId, message: &SignedTradeMessage) -> TradeResult<()> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(TradeError::PeerUnreachable(receiver.node_id.clone()));
        }
        self.sent.lock().push((receiver.clone(), message.clone()));
        Ok(())
    }
}
