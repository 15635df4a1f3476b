//! Settlement wallet collaborator
//!
//! The trade engine never builds transactions. It asks the wallet for opaque
//! values (shares, signatures, transaction ids) and moves them between the
//! parties.

use crate::message::PartialSignatureSet;
use crate::{TradeError, TradeResult};
use agora_contract::TradeId;
use agora_core::{SignedMessage, SpendableOutput, TxId};
use agora_crypto::hash_sha256_parts;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};

#[async_trait]
pub trait SettlementWallet: Send + Sync {
    async fn key_share(&self, trade_id: &TradeId) -> TradeResult<Vec<u8>>;

    async fn nonce_share(&self, trade_id: &TradeId) -> TradeResult<Vec<u8>>;

    async fn partial_signatures(
        &self,
        trade_id: &TradeId,
        peer_key_share: &[u8],
        peer_nonce_share: &[u8],
    ) -> TradeResult<PartialSignatureSet>;

    async fn sign(&self, trade_id: &TradeId, message: &[u8]) -> TradeResult<SignedMessage>;

    /// Outputs covering at least `amount`
    async fn spendable_outputs(&self, amount: u64) -> TradeResult<Vec<SpendableOutput>>;

    async fn broadcast_deposit(&self, trade_id: &TradeId) -> TradeResult<TxId>;

    async fn broadcast_payout(&self, trade_id: &TradeId) -> TradeResult<TxId>;

    async fn lock_htlc(
        &self,
        trade_id: &TradeId,
        payment_hash: &[u8; 32],
        amount: u64,
    ) -> TradeResult<TxId>;

    async fn receive_address(&self, trade_id: &TradeId) -> TradeResult<String>;

    /// Secret whose hash locks a submarine swap
    async fn swap_preimage(&self, trade_id: &TradeId) -> TradeResult<[u8; 32]>;
}

/// Deterministic wallet: every value is a hash of the seed, a label and the
/// trade id
pub struct MockWallet {
    seed: [u8; 32],
    fail_broadcasts: AtomicBool,
}

impl MockWallet {
    pub fn new(seed: [u8; 32]) -> Self {
        Self {
            seed,
            fail_broadcasts: AtomicBool::new(false),
        }
    }

    /// Make every later broadcast fail
    pub fn fail_broadcasts(&self, fail: bool) {
        self.fail_broadcasts.store(fail, Ordering::SeqCst);
    }

    fn derive(&self, label: &str, trade_id: &TradeId, extra: &[u8]) -> [u8; 32] {
        hash_sha256_parts(&[&self.seed, label.as_bytes(), trade_id.0.as_bytes(), extra])
    }

    fn txid(&self, label: &str, trade_id: &TradeId, extra: &[u8]) -> TradeResult<TxId> {
        if self.fail_broadcasts.load(Ordering::SeqCst) {
            return Err(TradeError::Wallet(format!("{} broadcast rejected", label)));
        }
        Ok(TxId(hex::encode(self.derive(label, trade_id, extra))))
    }
}

#[async_trait]
impl SettlementWallet for MockWallet {
    async fn key_share(&self, trade_id: &TradeId) -> TradeResult<Vec<u8>> {
        Ok(self.derive("key", trade_id, &[]).to_vec())
    }

    async fn nonce_share(&self, trade_id: &TradeId) -> TradeResult<Vec<u8>> {
        Ok(self.derive("nonce", trade_id, &[]).to_vec())
    }

    async fn partial_signatures(
        &self,
        trade_id: &TradeId,
        peer_key_share: &[u8],
        peer_nonce_share: &[u8],
    ) -> TradeResult<PartialSignatureSet> {
        let peer = [peer_key_share, peer_nonce_share].concat();
        Ok(PartialSignatureSet {
            deposit: self.derive("deposit-sig", trade_id, &peer).to_vec(),
            payout: self.derive("payout-sig", trade_id, &peer).to_vec(),
            swap: self.derive("swap-sig", trade_id, &peer).to_vec(),
        })
    }

    async fn sign(&self, trade_id: &TradeId, message: &[u8]) -> TradeResult<SignedMessage> {
        Ok(SignedMessage {
            message: message.to_vec(),
            signature: self.derive("sign", trade_id, message).to_vec(),
        })
    }

    async fn spendable_outputs(&self, amount: u64) -> TradeResult<Vec<SpendableOutput>> {
        let txid = TxId(hex::encode(hash_sha256_parts(&[
            &self.seed,
            b"utxo",
            &amount.to_be_bytes(),
        ])));
        Ok(vec![SpendableOutput {
            txid,
            vout: 0,
            amount,
        }])
    }

    async fn broadcast_deposit(&self, trade_id: &TradeId) -> TradeResult<TxId> {
        self.txid("deposit", trade_id, &[])
    }

    async fn broadcast_payout(&self, trade_id: &TradeId) -> TradeResult<TxId> {
        self.txid("payout", trade_id, &[])
    }

    async fn lock_htlc(
        &self,
        trade_id: &TradeId,
        payment_hash: &[u8; 32],
        amount: u64,
    ) -> TradeResult<TxId> {
        let extra = [&payment_hash[..], &amount.to_be_bytes()].concat();
        self.txid("htlc", trade_id, &extra)
    }

    async fn receive_address(&self, trade_id: &TradeId) -> TradeResult<String> {
        Ok(format!(
            "agora1{}",
            hex::encode(&self.derive("address", trade_id, &[])[..20])
        ))
    }

    async fn swap_preimage(&self, trade_id: &TradeId) -> TradeResult<[u8; 32]> {
        Ok(self.derive("preimage", trade_id, &[]))
    }
}
