//! Closed-trade history
//!
//! Append-only. Trades reaching a final state are moved here from the
//! open set and never change again.

use crate::model::Trade;
use crate::state::{FailureReason, TradeState};
use agora_contract::{Contract, ProtocolType, TradeId, TradeRole};
use agora_storage::{SnapshotStore, StorageResult};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// Snapshot name of the closed-trade history
pub const HISTORY_SNAPSHOT: &str = "closed_trades";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClosedTrade {
    pub trade_id: TradeId,
    pub protocol: ProtocolType,
    pub role: TradeRole,
    pub final_state: TradeState,
    pub failure: Option<FailureReason>,
    pub contract: Contract,
    /// Unix milliseconds
    pub closed_at: i64,
}

impl ClosedTrade {
    pub fn from_trade(trade: &Trade, closed_at: i64) -> Self {
        Self {
            trade_id: trade.id,
            protocol: trade.protocol(),
            role: trade.role,
            final_state: trade.state,
            failure: trade.state.failure(),
            contract: trade.contract.clone(),
            closed_at,
        }
    }
}

#[derive(Default)]
pub struct TradeHistory {
    entries: RwLock<Vec<ClosedTrade>>,
}

impl TradeHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends unless the trade is already recorded
    pub fn append(&self, closed: ClosedTrade) -> bool {
        let mut entries = self.entries.write();
        if entries.iter().any(|e| e.trade_id == closed.trade_id) {
            return false;
        }
        entries.push(closed);
        true
    }

    pub fn contains(&self, trade_id: &TradeId) -> bool {
        self.entries.read().iter().any(|e| e.trade_id == *trade_id)
    }

    pub fn get(&self, trade_id: &TradeId) -> Option<ClosedTrade> {
        self.entries
            .read()
            .iter()
            .find(|e| e.trade_id == *trade_id)
            .cloned()
    }

    /// Copy of every entry, oldest first
    pub fn entries(&self) -> Vec<ClosedTrade> {
        self.entries.read().clone()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    pub fn save(&self, snapshots: &SnapshotStore) -> StorageResult<()> {
        let entries = self.entries.read().clone();
        snapshots.save(HISTORY_SNAPSHOT, &entries)
    }

    /// Merge a saved history into this one; returns how many were added
    pub fn load(&self, snapshots: &SnapshotStore) -> StorageResult<usize> {
        let saved: Vec<ClosedTrade> = snapshots.load(HISTORY_SNAPSHOT)?;
        Ok(saved.into_iter().filter(|c| self.append(c.clone())).count())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agora_contract::{Offer, OfferDirection, PartyRole};
    use agora_core::{Address, NetworkId};
    use agora_crypto::KeyPair;
    use tempfile::tempdir;

    fn trade(offer_id: &str) -> Trade {
        let maker = KeyPair::generate();
        let taker = KeyPair::generate();
        let offer = Offer {
            id: offer_id.into(),
            maker: NetworkId::with_clear_address(maker.public_key(), Address::localhost(1))
                .unwrap(),
            direction: OfferDirection::Sell,
            protocol: ProtocolType::Escrowless,
            base_amount: 1_000,
            quote_amount: 50,
            payment_method: "SEPA".into(),
            created_at: 1_700_000_000_000,
        };
        let taker_id =
            NetworkId::with_clear_address(taker.public_key(), Address::localhost(2)).unwrap();
        let contract = Contract::take(offer, taker_id, 1_700_000_000_001);
        let mut trade = Trade::new(contract, PartyRole::Taker);
        trade.state = TradeState::Failed(FailureReason::Timeout);
        trade
    }

    #[test]
    fn test_append_only_once() {
        let history = TradeHistory::new();
        let closed = ClosedTrade::from_trade(&trade("offer-1"), 5);
        assert!(history.append(closed.clone()));
        assert!(!history.append(closed.clone()));
        assert_eq!(history.len(), 1);
        assert_eq!(history.get(&closed.trade_id).unwrap().failure, Some(FailureReason::Timeout));
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempdir().unwrap();
        let snapshots = SnapshotStore::open(dir.path()).unwrap();

        let history = TradeHistory::new();
        history.append(ClosedTrade::from_trade(&trade("offer-1"), 1));
        history.append(ClosedTrade::from_trade(&trade("offer-2"), 2));
        history.save(&snapshots).unwrap();

        let restored = TradeHistory::new();
        assert_eq!(restored.load(&snapshots).unwrap(), 2);
        assert_eq!(restored.entries(), history.entries());
        // loading again adds nothing
        assert_eq!(restored.load(&snapshots).unwrap(), 0);
    }
}
