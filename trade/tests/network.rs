//! Escrowless trade between two nodes over the in-memory transport

use agora_contract::{Offer, OfferDirection, ProtocolType, TradeId};
use agora_core::{Address, NetworkId, TransportType};
use agora_crypto::KeyPair;
use agora_network::{AuthorizationConfig, MemoryNetwork, NetworkConfig, NetworkService};
use agora_storage::{DataType, StorageConfig, StorageService};
use agora_trade::{
    MockWallet, NetworkMessenger, TradeConfig, TradeService, TradeState, TradeUpdate,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

fn network_config() -> NetworkConfig {
    NetworkConfig {
        authorization: AuthorizationConfig {
            broadcast_bits: 2,
            direct_bits: 1,
            ack_bits: 0,
            load_bits: 0,
            threads_per_class: 1,
            ..Default::default()
        },
        ..Default::default()
    }
}

struct Node {
    id: NetworkId,
    network: Arc<NetworkService>,
    storage: Arc<StorageService>,
    trades: Arc<TradeService>,
}

async fn node(net: &MemoryNetwork, port: u16) -> Node {
    let keypair = Arc::new(KeyPair::generate());
    let network = Arc::new(NetworkService::new(keypair.public_key(), network_config()).unwrap());
    network.add_transport(Arc::new(net.transport(Address::localhost(port))));
    let id = network.start().await.unwrap();

    let storage = Arc::new(StorageService::new(
        keypair.clone(),
        network.clone(),
        StorageConfig::default(),
    ));
    storage.start().await.unwrap();

    let trades = Arc::new(
        TradeService::new(
            keypair.clone(),
            id.clone(),
            storage.store().clone(),
            Arc::new(NetworkMessenger::new(network.clone())),
            Arc::new(MockWallet::new([port as u8; 32])),
            TradeConfig::default(),
        )
        .unwrap(),
    );
    trades.start().await.unwrap();
    trades.attach(&network).await;

    Node {
        id,
        network,
        storage,
        trades,
    }
}

async fn wait_for(updates: &mut broadcast::Receiver<TradeUpdate>, id: TradeId, state: TradeState) {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let update = updates.recv().await.expect("update channel closed");
            if update.trade_id == id && update.state == state {
                return;
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {}", state));
}

#[tokio::test]
async fn test_escrowless_trade_over_the_network() {
    let net = MemoryNetwork::new();
    let maker = node(&net, 1).await;
    let taker = node(&net, 2).await;
    taker
        .network
        .connect(TransportType::Clear, &Address::localhost(1))
        .await
        .unwrap();

    let offer = Offer {
        id: "offer-net".into(),
        maker: maker.id.clone(),
        direction: OfferDirection::Buy,
        protocol: ProtocolType::Escrowless,
        base_amount: 250_000,
        quote_amount: 16_000,
        payment_method: "SEPA".into(),
        created_at: agora_core::time::now_millis(),
    };
    maker
        .storage
        .publish(DataType::Offer, &offer.id, offer.to_record_body().unwrap())
        .await
        .unwrap();

    let mut maker_updates = maker.trades.subscribe();
    let mut taker_updates = taker.trades.subscribe();

    // maker buys, so the taker sells and provides the account data
    let id = taker.trades.take_offer(offer).await.unwrap();
    wait_for(&mut maker_updates, id, TradeState::ContractAgreed).await;
    wait_for(&mut taker_updates, id, TradeState::ContractAgreed).await;

    taker.trades.send_payment_details(id, "IBAN DE89").await.unwrap();
    wait_for(&mut maker_updates, id, TradeState::PaymentDetailsExchanged).await;

    maker.trades.confirm_payment_sent(id).await.unwrap();
    wait_for(&mut taker_updates, id, TradeState::PaymentSent).await;

    taker.trades.confirm_payment_received(id).await.unwrap();
    wait_for(&mut maker_updates, id, TradeState::PaymentReceived).await;

    taker.trades.confirm_settlement_sent(id).await.unwrap();
    wait_for(&mut maker_updates, id, TradeState::SettlementSent).await;

    maker.trades.confirm_settlement_received(id).await.unwrap();
    wait_for(&mut taker_updates, id, TradeState::Completed).await;

    assert_eq!(
        maker.trades.closed_trade(&id).unwrap().final_state,
        TradeState::Completed
    );
    assert!(taker.trades.open_trades().is_empty());

    taker.trades.shutdown().await;
    maker.trades.shutdown().await;
}
