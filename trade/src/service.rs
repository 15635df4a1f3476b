//! Trade service
//!
//! Owns the open trades, each behind its own async mutex so at most one
//! event is applied to a trade at a time while different trades proceed
//! concurrently. Exposes the event handlers presentation layers may call,
//! sends what the engine produces and arms response deadlines.

use crate::engine::{Applied, TradeEngine};
use crate::event::{TradeEvent, UserAction};
use crate::history::{ClosedTrade, TradeHistory};
use crate::message::{SignedTradeMessage, TradePayload};
use crate::messenger::TradeMessenger;
use crate::model::Trade;
use crate::state::{FailureReason, TradeState};
use crate::wallet::SettlementWallet;
use crate::{TradeError, TradeResult};
use agora_contract::{Contract, Offer, PartyRole, TradeId};
use agora_core::time::now_millis;
use agora_core::NetworkId;
use agora_crypto::KeyPair;
use agora_network::{Channel, InboundMessage, MessageHandler, NetworkMessage, NetworkService};
use agora_storage::{DataStore, SnapshotStore, StorageError};
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TradeConfig {
    /// Deadline for the counterparty's reply after a send that expects one
    pub response_timeout_ms: u64,
    pub update_capacity: usize,
}

impl Default for TradeConfig {
    fn default() -> Self {
        Self {
            response_timeout_ms: 60_000,
            update_capacity: 256,
        }
    }
}

/// Change notification for presentation layers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TradeUpdate {
    pub trade_id: TradeId,
    pub state: TradeState,
    pub failure: Option<FailureReason>,
}

pub struct TradeService {
    config: TradeConfig,
    keypair: Arc<KeyPair>,
    local_id: NetworkId,
    engine: TradeEngine,
    messenger: Arc<dyn TradeMessenger>,
    store: Arc<DataStore>,
    trades: DashMap<TradeId, Arc<Mutex<Trade>>>,
    history: TradeHistory,
    updates: broadcast::Sender<TradeUpdate>,
    snapshots: Option<SnapshotStore>,
    timers: DashMap<TradeId, JoinHandle<()>>,
}

impl TradeService {
    /// `store` is where our own offers are published
    pub fn new(
        keypair: Arc<KeyPair>,
        local_id: NetworkId,
        store: Arc<DataStore>,
        messenger: Arc<dyn TradeMessenger>,
        wallet: Arc<dyn SettlementWallet>,
        config: TradeConfig,
    ) -> TradeResult<Self> {
        if local_id.pubkey != keypair.public_key() {
            return Err(TradeError::InvalidInput(
                "local network id does not belong to the key pair".into(),
            ));
        }
        let engine = TradeEngine::new(keypair.clone(), wallet)?;
        let (updates, _) = broadcast::channel(config.update_capacity.max(1));
        Ok(Self {
            config,
            keypair,
            local_id,
            engine,
            messenger,
            store,
            trades: DashMap::new(),
            history: TradeHistory::new(),
            updates,
            snapshots: None,
            timers: DashMap::new(),
        })
    }

    /// Persist closed trades under `snapshots`
    pub fn with_snapshots(mut self, snapshots: SnapshotStore) -> Self {
        self.snapshots = Some(snapshots);
        self
    }

    /// Restore the closed-trade history
    pub async fn start(self: &Arc<Self>) -> TradeResult<()> {
        if self.snapshots.is_some() {
            match self.load_history() {
                Ok(restored) => info!(trades = restored, "Closed trades restored"),
                Err(TradeError::Storage(StorageError::SnapshotNotFound(_))) => {}
                Err(e) => error!(error = %e, "Failed to load trade history"),
            }
        }
        info!(node = %self.local_id.node_id, "Trade service started");
        Ok(())
    }

    /// Route trade-channel messages from `network` to this service
    pub async fn attach(self: &Arc<Self>, network: &NetworkService) {
        network
            .register_handler(Arc::new(TradeChannelHandler {
                service: self.clone(),
            }))
            .await;
    }

    pub async fn shutdown(&self) {
        let timers: Vec<TradeId> = self.timers.iter().map(|t| *t.key()).collect();
        for id in timers {
            self.cancel_timer(&id);
        }
        if self.snapshots.is_some() {
            if let Err(e) = self.save_history() {
                error!(error = %e, "Failed to save trade history");
            }
        }
        info!(open = self.trades.len(), "Trade service stopped");
    }

    pub fn local_id(&self) -> &NetworkId {
        &self.local_id
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TradeUpdate> {
        self.updates.subscribe()
    }

    /// Copy of an open trade
    pub async fn trade(&self, id: &TradeId) -> Option<Trade> {
        let entry = self.trades.get(id).map(|e| e.value().clone())?;
        let trade = entry.lock().await;
        Some(trade.clone())
    }

    pub fn open_trades(&self) -> Vec<TradeId> {
        self.trades.iter().map(|e| *e.key()).collect()
    }

    /// Read-only view of the closed-trade history
    pub fn closed_trades(&self) -> Vec<ClosedTrade> {
        self.history.entries()
    }

    pub fn closed_trade(&self, id: &TradeId) -> Option<ClosedTrade> {
        self.history.get(id)
    }

    pub async fn take_offer(self: &Arc<Self>, offer: Offer) -> TradeResult<TradeId> {
        self.take_offer_at(offer, now_millis()).await
    }

    /// Take `offer` with an explicit take-offer date
    pub async fn take_offer_at(self: &Arc<Self>, offer: Offer, date: i64) -> TradeResult<TradeId> {
        offer.validate()?;
        if offer.maker.pubkey == self.keypair.public_key() {
            return Err(TradeError::InvalidInput("cannot take own offer".into()));
        }
        let contract = Contract::take(offer, self.local_id.clone(), date);
        contract.verify()?;

        let trade = Trade::new(contract, PartyRole::Taker);
        let id = trade.id;
        match self.trades.entry(id) {
            Entry::Occupied(_) => return Err(TradeError::AlreadyExists(id)),
            Entry::Vacant(slot) => {
                slot.insert(Arc::new(Mutex::new(trade)));
            }
        }
        info!(trade_id = %id, "Taking offer");

        if let Err(e) = self.handle_event(id, TradeEvent::User(UserAction::TakeOffer)).await {
            self.trades.remove(&id);
            return Err(e);
        }
        Ok(id)
    }

    pub async fn send_payment_details(
        self: &Arc<Self>,
        id: TradeId,
        account_data: impl Into<String>,
    ) -> TradeResult<TradeState> {
        let action = UserAction::SendPaymentDetails {
            account_data: account_data.into(),
        };
        self.handle_event(id, TradeEvent::User(action)).await
    }

    pub async fn confirm_payment_sent(self: &Arc<Self>, id: TradeId) -> TradeResult<TradeState> {
        self.handle_event(id, TradeEvent::User(UserAction::ConfirmPaymentSent))
            .await
    }

    pub async fn confirm_payment_received(self: &Arc<Self>, id: TradeId) -> TradeResult<TradeState> {
        self.handle_event(id, TradeEvent::User(UserAction::ConfirmPaymentReceived))
            .await
    }

    pub async fn confirm_settlement_sent(self: &Arc<Self>, id: TradeId) -> TradeResult<TradeState> {
        self.handle_event(id, TradeEvent::User(UserAction::ConfirmSettlementSent))
            .await
    }

    pub async fn confirm_settlement_received(
        self: &Arc<Self>,
        id: TradeId,
    ) -> TradeResult<TradeState> {
        self.handle_event(id, TradeEvent::User(UserAction::ConfirmSettlementReceived))
            .await
    }

    pub async fn claim_settlement(self: &Arc<Self>, id: TradeId) -> TradeResult<TradeState> {
        self.handle_event(id, TradeEvent::User(UserAction::ClaimSettlement))
            .await
    }

    pub async fn cancel(self: &Arc<Self>, id: TradeId) -> TradeResult<TradeState> {
        self.handle_event(id, TradeEvent::User(UserAction::Cancel)).await
    }

    /// Apply an inbound message, opening the maker side of a trade when it
    /// is a request to take one of our offers
    pub async fn handle_message(
        self: &Arc<Self>,
        signed: SignedTradeMessage,
    ) -> TradeResult<TradeState> {
        let id = signed.trade_id();
        if !self.trades.contains_key(&id) {
            if self.history.contains(&id) {
                return Err(TradeError::TradeClosed(id));
            }
            match &signed.message.payload {
                TradePayload::TakeOfferRequest { contract, .. } => {
                    self.open_maker_trade(id, contract)?;
                }
                _ => return Err(TradeError::UnknownTrade(id)),
            }
        }
        self.handle_event(id, TradeEvent::Message(signed)).await
    }

    fn open_maker_trade(&self, id: TradeId, contract: &Contract) -> TradeResult<()> {
        if contract.trade_id() != id {
            return Err(TradeError::Rejected(FailureReason::InvalidContract));
        }
        if contract.offer.maker.pubkey != self.keypair.public_key() {
            return Err(TradeError::Rejected(FailureReason::OfferNotFound));
        }
        let published = self
            .store
            .get(&contract.offer.storage_key())
            .and_then(|record| Offer::from_record(&record).ok());
        match published {
            None => {
                debug!(trade_id = %id, offer = %contract.offer.id, "Take request for unknown offer");
                return Err(TradeError::Rejected(FailureReason::OfferNotFound));
            }
            Some(offer) if offer != contract.offer => {
                debug!(trade_id = %id, offer = %offer.id, "Take request for a different offer version");
                return Err(TradeError::Rejected(FailureReason::InvalidContract));
            }
            Some(_) => {}
        }

        if let Entry::Vacant(slot) = self.trades.entry(id) {
            slot.insert(Arc::new(Mutex::new(Trade::new(
                contract.clone(),
                PartyRole::Maker,
            ))));
            info!(trade_id = %id, offer = %contract.offer.id, "Offer taken");
        }
        Ok(())
    }

    /// Apply one event to a trade under its lock
    pub async fn handle_event(
        self: &Arc<Self>,
        id: TradeId,
        event: TradeEvent,
    ) -> TradeResult<TradeState> {
        let entry = match self.trades.get(&id) {
            Some(entry) => entry.value().clone(),
            None if self.history.contains(&id) => return Err(TradeError::TradeClosed(id)),
            None => return Err(TradeError::UnknownTrade(id)),
        };

        let mut trade = entry.lock().await;
        let applied = self.engine.apply(&mut trade, event).await?;
        self.after_apply(&mut trade, applied).await;
        Ok(trade.state)
    }

    async fn after_apply(self: &Arc<Self>, trade: &mut Trade, applied: Applied) {
        match applied {
            Applied::Transitioned {
                from,
                to,
                outbound,
                await_reply,
            } => {
                info!(trade_id = %trade.id, from = %from, to = %to, "Trade state changed");
                self.cancel_timer(&trade.id);

                let receiver = trade.counterparty().network_id.clone();
                for message in outbound {
                    if let Err(e) = self.messenger.send(&receiver, &message).await {
                        warn!(trade_id = %trade.id, kind = %message.kind(), error = %e, "Trade message not delivered");
                        if let Err(e) = self.engine.apply(trade, TradeEvent::PeerUnreachable).await {
                            error!(trade_id = %trade.id, error = %e, "Failed to record unreachable peer");
                        }
                        break;
                    }
                }

                if await_reply && !trade.is_final() {
                    self.arm_timer(trade.id, trade.state);
                }
            }
            Applied::Failed { .. } => self.cancel_timer(&trade.id),
            Applied::Duplicate | Applied::Ignored => return,
        }

        let _ = self.updates.send(TradeUpdate {
            trade_id: trade.id,
            state: trade.state,
            failure: trade.state.failure(),
        });

        if trade.is_final() {
            self.close(trade);
        }
    }

    fn close(&self, trade: &Trade) {
        self.trades.remove(&trade.id);
        self.history
            .append(ClosedTrade::from_trade(trade, now_millis()));
        info!(trade_id = %trade.id, state = %trade.state, "Trade closed");

        if self.snapshots.is_some() {
            if let Err(e) = self.save_history() {
                error!(error = %e, "Failed to save trade history");
            }
        }
    }

    fn arm_timer(self: &Arc<Self>, id: TradeId, state: TradeState) {
        let service = self.clone();
        let timeout = Duration::from_millis(self.config.response_timeout_ms);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            service.timers.remove(&id);
            debug!(trade_id = %id, state = %state, "Response deadline passed");
            if let Err(e) = service.handle_event(id, TradeEvent::Timeout { state }).await {
                debug!(trade_id = %id, error = %e, "Timeout not applied");
            }
        });
        if let Some(previous) = self.timers.insert(id, handle) {
            previous.abort();
        }
    }

    fn cancel_timer(&self, id: &TradeId) {
        if let Some((_, handle)) = self.timers.remove(id) {
            handle.abort();
        }
    }

    pub fn save_history(&self) -> TradeResult<()> {
        let snapshots = self
            .snapshots
            .as_ref()
            .ok_or(StorageError::SnapshotNotConfigured)?;
        self.history.save(snapshots)?;
        Ok(())
    }

    pub fn load_history(&self) -> TradeResult<usize> {
        let snapshots = self
            .snapshots
            .as_ref()
            .ok_or(StorageError::SnapshotNotConfigured)?;
        Ok(self.history.load(snapshots)?)
    }
}

/// Feeds trade-channel messages into a [`TradeService`]
struct TradeChannelHandler {
    service: Arc<TradeService>,
}

#[async_trait]
impl MessageHandler for TradeChannelHandler {
    async fn on_message(&self, inbound: &InboundMessage) {
        let body = match &inbound.message {
            NetworkMessage::Direct {
                channel: Channel::Trade,
                body,
            } => body,
            _ => return,
        };
        let signed = match SignedTradeMessage::deserialize(body) {
            Ok(signed) => signed,
            Err(e) => {
                debug!(peer = %inbound.peer.node_id, error = %e, "Undecodable trade message");
                return;
            }
        };
        if signed.message.sender.pubkey != inbound.peer.pubkey {
            debug!(peer = %inbound.peer.node_id, "Trade message sender differs from peer");
            return;
        }
        let trade_id = signed.trade_id();
        if let Err(e) = self.service.handle_message(signed).await {
            debug!(trade_id = %trade_id, error = %e, "Trade message not applied");
        }
    }
}
