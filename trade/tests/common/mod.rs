//! Two-party harness: trade services wired through recording messengers

#![allow(dead_code)]

use agora_contract::{Offer, OfferDirection, ProtocolType, TradeId};
use agora_core::time::now_millis;
use agora_core::{Address, NetworkId};
use agora_crypto::KeyPair;
use agora_storage::{AuthenticatedRecord, DataStore, DataType, SignedRecord};
use agora_trade::{
    MockWallet, RecordingMessenger, SignedTradeMessage, Trade, TradeConfig, TradeMessage,
    TradeService,
};
use std::sync::Arc;

pub const TAKE_DATE: i64 = 1_700_000_000_000;

pub struct Party {
    pub keypair: Arc<KeyPair>,
    pub id: NetworkId,
    pub store: Arc<DataStore>,
    pub messenger: Arc<RecordingMessenger>,
    pub wallet: Arc<MockWallet>,
    pub service: Arc<TradeService>,
}

pub fn config() -> TradeConfig {
    TradeConfig {
        response_timeout_ms: 5_000,
        ..Default::default()
    }
}

pub fn party(seed: u8, port: u16) -> Party {
    party_with_config(seed, port, config())
}

pub fn party_with_config(seed: u8, port: u16, config: TradeConfig) -> Party {
    let keypair = Arc::new(KeyPair::from_seed([seed; 32]));
    let id = NetworkId::with_clear_address(keypair.public_key(), Address::localhost(port)).unwrap();
    let store = Arc::new(DataStore::new());
    let messenger = Arc::new(RecordingMessenger::new());
    let wallet = Arc::new(MockWallet::new([seed.wrapping_add(100); 32]));
    let service = Arc::new(
        TradeService::new(
            keypair.clone(),
            id.clone(),
            store.clone(),
            messenger.clone(),
            wallet.clone(),
            config,
        )
        .unwrap(),
    );
    Party {
        keypair,
        id,
        store,
        messenger,
        wallet,
        service,
    }
}

pub fn offer(maker: &Party, direction: OfferDirection, protocol: ProtocolType) -> Offer {
    Offer {
        id: format!("offer-{:?}-{:?}", protocol, direction),
        maker: maker.id.clone(),
        direction,
        protocol,
        base_amount: 100_000,
        quote_amount: 6_500,
        payment_method: "SEPA".into(),
        created_at: TAKE_DATE - 60_000,
    }
}

/// Sign `offer` as its maker and put it in the maker's store
pub fn publish(maker: &Party, offer: &Offer) {
    let record = AuthenticatedRecord::new(
        DataType::Offer,
        offer.id.clone(),
        maker.keypair.public_key(),
        1,
        offer.to_record_body().unwrap(),
        now_millis(),
    );
    let signed = SignedRecord::sign(record, &maker.keypair).unwrap();
    maker.store.add_or_update(&signed).unwrap();
}

/// Deliver queued messages both ways until neither side has anything left;
/// returns everything delivered to `b`
pub async fn pump(a: &Party, b: &Party) -> Vec<SignedTradeMessage> {
    let mut delivered_to_b = Vec::new();
    loop {
        let from_a = a.messenger.take();
        let from_b = b.messenger.take();
        if from_a.is_empty() && from_b.is_empty() {
            return delivered_to_b;
        }
        for (_, message) in from_a {
            delivered_to_b.push(message.clone());
            let _ = b.service.handle_message(message).await;
        }
        for (_, message) in from_b {
            let _ = a.service.handle_message(message).await;
        }
    }
}

/// Re-sign a modified message as its sender
pub fn resign(message: TradeMessage, sender: &Party) -> SignedTradeMessage {
    SignedTradeMessage::sign(message, &sender.keypair).unwrap()
}

pub async fn open_trade(party: &Party, id: &TradeId) -> Trade {
    party
        .service
        .trade(id)
        .await
        .expect("trade should be open")
}
