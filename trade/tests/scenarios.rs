//! End-to-end trade scenarios between a maker and a taker

mod common;

use agora_contract::{OfferDirection, ProtocolType};
use agora_trade::{
    FailureReason, MessageKind, MuSigMessage, ProtocolModel, SwapMessage, TradeError,
    TradePayload, TradeState, TradeUpdate,
};
use common::*;

#[tokio::test]
async fn test_both_sides_agree_on_the_contract() {
    let maker = party(1, 1);
    let taker = party(2, 2);
    let offer = offer(&maker, OfferDirection::Sell, ProtocolType::Escrowless);
    publish(&maker, &offer);

    let id = taker.service.take_offer_at(offer, TAKE_DATE).await.unwrap();
    assert_eq!(open_trade(&taker, &id).await.state, TradeState::ContractProposed);

    pump(&taker, &maker).await;

    let on_taker = open_trade(&taker, &id).await;
    let on_maker = open_trade(&maker, &id).await;
    assert_eq!(on_taker.state, TradeState::ContractAgreed);
    assert_eq!(on_maker.state, TradeState::ContractAgreed);
    assert_eq!(on_taker.contract, on_maker.contract);

    let taker_sig = on_taker.taker_signature.unwrap();
    let maker_sig = on_taker.maker_signature.unwrap();
    assert_eq!(on_maker.taker_signature.unwrap().hash(), taker_sig.hash());
    assert_eq!(on_maker.maker_signature.unwrap().hash(), maker_sig.hash());
    assert_eq!(taker_sig.contract_hash, maker_sig.contract_hash);
}

#[tokio::test]
async fn test_invalid_contract_signature_fails_the_maker_trade() {
    let maker = party(1, 1);
    let taker = party(2, 2);
    let offer = offer(&maker, OfferDirection::Sell, ProtocolType::Escrowless);
    publish(&maker, &offer);

    let id = taker.service.take_offer_at(offer, TAKE_DATE).await.unwrap();
    let (_, request) = taker.messenger.take().pop().unwrap();

    let mut forged = request.message.clone();
    if let TradePayload::TakeOfferRequest {
        taker_signature, ..
    } = &mut forged.payload
    {
        taker_signature.signature[0] ^= 0xff;
    }
    let state = maker
        .service
        .handle_message(resign(forged, &taker))
        .await
        .unwrap();

    assert_eq!(
        state,
        TradeState::Failed(FailureReason::InvalidContractSignature)
    );
    assert!(maker.messenger.is_empty());
    let closed = maker.service.closed_trade(&id).unwrap();
    assert_eq!(closed.failure, Some(FailureReason::InvalidContractSignature));
    assert!(maker.service.trade(&id).await.is_none());
}

#[tokio::test]
async fn test_escrowless_trade_completes() {
    let maker = party(1, 1);
    let taker = party(2, 2);
    let offer = offer(&maker, OfferDirection::Sell, ProtocolType::Escrowless);
    publish(&maker, &offer);
    let mut maker_updates = maker.service.subscribe();

    let id = taker.service.take_offer_at(offer, TAKE_DATE).await.unwrap();
    pump(&taker, &maker).await;

    // maker sells
    maker
        .service
        .send_payment_details(id, "IBAN DE00 1234")
        .await
        .unwrap();
    pump(&taker, &maker).await;
    let buyer_view = open_trade(&taker, &id).await;
    assert_eq!(buyer_view.state, TradeState::PaymentDetailsExchanged);
    match &buyer_view.model {
        ProtocolModel::Escrowless(m) => {
            assert_eq!(m.account_data.as_deref(), Some("IBAN DE00 1234"))
        }
        other => panic!("unexpected model {:?}", other),
    }

    taker.service.confirm_payment_sent(id).await.unwrap();
    pump(&taker, &maker).await;
    assert_eq!(open_trade(&maker, &id).await.state, TradeState::PaymentSent);

    maker.service.confirm_payment_received(id).await.unwrap();
    pump(&taker, &maker).await;
    maker.service.confirm_settlement_sent(id).await.unwrap();
    pump(&taker, &maker).await;
    assert_eq!(open_trade(&taker, &id).await.state, TradeState::SettlementSent);

    let state = taker.service.confirm_settlement_received(id).await.unwrap();
    assert_eq!(state, TradeState::Completed);
    pump(&taker, &maker).await;

    for side in [&maker, &taker] {
        let closed = side.service.closed_trade(&id).unwrap();
        assert_eq!(closed.final_state, TradeState::Completed);
        assert!(side.service.open_trades().is_empty());
    }

    let mut last = None;
    while let Ok(update) = maker_updates.try_recv() {
        last = Some(update);
    }
    assert_eq!(
        last,
        Some(TradeUpdate {
            trade_id: id,
            state: TradeState::Completed,
            failure: None,
        })
    );
}

#[tokio::test]
async fn test_duplicate_message_is_applied_once() {
    let maker = party(1, 1);
    let taker = party(2, 2);
    let offer = offer(&maker, OfferDirection::Sell, ProtocolType::Escrowless);
    publish(&maker, &offer);

    let id = taker.service.take_offer_at(offer, TAKE_DATE).await.unwrap();
    pump(&taker, &maker).await;
    maker.service.send_payment_details(id, "IBAN").await.unwrap();
    let (_, account_data) = maker.messenger.take().pop().unwrap();

    let first = taker
        .service
        .handle_message(account_data.clone())
        .await
        .unwrap();
    let after_first = open_trade(&taker, &id).await;

    let second = taker.service.handle_message(account_data).await.unwrap();
    let after_second = open_trade(&taker, &id).await;

    assert_eq!(first, TradeState::PaymentDetailsExchanged);
    assert_eq!(second, first);
    assert_eq!(after_first, after_second);
    assert!(taker.messenger.is_empty());
}

#[tokio::test]
async fn test_replaying_events_is_deterministic() {
    let maker = party(1, 1);
    let taker = party(2, 2);
    let offer = offer(&maker, OfferDirection::Sell, ProtocolType::MuSig);
    publish(&maker, &offer);

    let id = taker
        .service
        .take_offer_at(offer.clone(), TAKE_DATE)
        .await
        .unwrap();
    let to_maker = pump(&taker, &maker).await;
    let original = open_trade(&maker, &id).await;
    assert_eq!(original.state, TradeState::DepositPublished);

    let mut replays = Vec::new();
    for _ in 0..2 {
        let replica = party(1, 1);
        publish(&replica, &offer);
        for message in &to_maker {
            replica.service.handle_message(message.clone()).await.unwrap();
        }
        replays.push(open_trade(&replica, &id).await);
    }

    assert_eq!(replays[0], replays[1]);
    assert_eq!(replays[0], original);
}

#[tokio::test]
async fn test_musig_redaction_is_enforced() {
    let maker = party(1, 1);
    let taker = party(2, 2);
    // maker sells, so the taker's partial signatures must carry the swap signature
    let offer = offer(&maker, OfferDirection::Sell, ProtocolType::MuSig);
    publish(&maker, &offer);

    let id = taker.service.take_offer_at(offer, TAKE_DATE).await.unwrap();
    for (_, message) in taker.messenger.take() {
        maker.service.handle_message(message).await.unwrap();
    }
    // response and key shares
    for (_, message) in maker.messenger.take() {
        taker.service.handle_message(message).await.unwrap();
    }

    let outbound = taker.messenger.take();
    assert_eq!(outbound.len(), 2);
    let (_, key_shares) = &outbound[0];
    let (_, partials) = &outbound[1];
    assert_eq!(partials.kind(), MessageKind::MuSigPartialSignatures);

    maker
        .service
        .handle_message(key_shares.clone())
        .await
        .unwrap();

    let mut redacted = partials.message.clone();
    if let TradePayload::MuSig(MuSigMessage::PartialSignatures { swap_signature, .. }) =
        &mut redacted.payload
    {
        assert!(swap_signature.is_some());
        *swap_signature = None;
    }
    let state = maker
        .service
        .handle_message(resign(redacted, &taker))
        .await
        .unwrap();

    assert_eq!(state, TradeState::Failed(FailureReason::RedactionMismatch));
    assert!(maker.messenger.is_empty());
}

#[tokio::test]
async fn test_musig_key_shares_without_a_key_fail_the_taker() {
    let maker = party(1, 1);
    let taker = party(2, 2);
    let offer = offer(&maker, OfferDirection::Sell, ProtocolType::MuSig);
    publish(&maker, &offer);

    let id = taker.service.take_offer_at(offer, TAKE_DATE).await.unwrap();
    for (_, message) in taker.messenger.take() {
        maker.service.handle_message(message).await.unwrap();
    }
    let replies = maker.messenger.take();
    assert_eq!(replies.len(), 2);
    let (_, response) = &replies[0];
    let (_, key_shares) = &replies[1];
    taker
        .service
        .handle_message(response.clone())
        .await
        .unwrap();

    let mut keyless = key_shares.message.clone();
    if let TradePayload::MuSig(MuSigMessage::KeyShares { key_share, .. }) = &mut keyless.payload {
        key_share.clear();
    }
    let state = taker
        .service
        .handle_message(resign(keyless, &maker))
        .await
        .unwrap();

    assert_eq!(state, TradeState::Failed(FailureReason::InvalidMessage));
    assert!(taker.messenger.is_empty());
    assert!(taker.service.trade(&id).await.is_none());
}

#[tokio::test]
async fn test_musig_trade_completes_and_releases_swap_signature() {
    let maker = party(1, 1);
    let taker = party(2, 2);
    let offer = offer(&maker, OfferDirection::Buy, ProtocolType::MuSig);
    publish(&maker, &offer);

    // maker buys, taker sells
    let id = taker.service.take_offer_at(offer, TAKE_DATE).await.unwrap();
    pump(&taker, &maker).await;

    let buyer = open_trade(&maker, &id).await;
    assert_eq!(buyer.state, TradeState::DepositPublished);
    match &buyer.model {
        ProtocolModel::MuSig(m) => assert!(m.peer_swap_signature.is_none()),
        other => panic!("unexpected model {:?}", other),
    }

    maker.service.confirm_payment_sent(id).await.unwrap();
    pump(&taker, &maker).await;
    taker.service.confirm_payment_received(id).await.unwrap();
    pump(&taker, &maker).await;

    let buyer = open_trade(&maker, &id).await;
    assert_eq!(buyer.state, TradeState::PaymentReceived);
    match &buyer.model {
        ProtocolModel::MuSig(m) => assert!(m.peer_swap_signature.is_some()),
        other => panic!("unexpected model {:?}", other),
    }

    maker.service.claim_settlement(id).await.unwrap();
    pump(&taker, &maker).await;
    assert_eq!(
        taker.service.closed_trade(&id).unwrap().final_state,
        TradeState::Completed
    );
    assert_eq!(
        maker.service.closed_trade(&id).unwrap().final_state,
        TradeState::Completed
    );
}

#[tokio::test]
async fn test_multisig_trade_completes() {
    let maker = party(1, 1);
    let taker = party(2, 2);
    let offer = offer(&maker, OfferDirection::Sell, ProtocolType::MultiSig);
    publish(&maker, &offer);

    let id = taker.service.take_offer_at(offer, TAKE_DATE).await.unwrap();
    pump(&taker, &maker).await;
    assert_eq!(open_trade(&maker, &id).await.state, TradeState::DepositPublished);
    assert_eq!(open_trade(&taker, &id).await.state, TradeState::DepositPublished);

    taker.service.confirm_payment_sent(id).await.unwrap();
    pump(&taker, &maker).await;
    maker.service.confirm_payment_received(id).await.unwrap();
    pump(&taker, &maker).await;

    for side in [&maker, &taker] {
        assert_eq!(
            side.service.closed_trade(&id).unwrap().final_state,
            TradeState::Completed
        );
    }
}

#[tokio::test]
async fn test_swap_completes_with_the_right_preimage() {
    let maker = party(1, 1);
    let taker = party(2, 2);
    let offer = offer(&maker, OfferDirection::Sell, ProtocolType::SubmarineSwap);
    publish(&maker, &offer);

    let id = taker.service.take_offer_at(offer, TAKE_DATE).await.unwrap();
    pump(&taker, &maker).await;
    assert_eq!(open_trade(&taker, &id).await.state, TradeState::HtlcLocked);

    taker.service.claim_settlement(id).await.unwrap();
    pump(&taker, &maker).await;
    for side in [&maker, &taker] {
        assert_eq!(
            side.service.closed_trade(&id).unwrap().final_state,
            TradeState::Completed
        );
    }
}

#[tokio::test]
async fn test_swap_with_wrong_preimage_fails() {
    let maker = party(1, 1);
    let taker = party(2, 2);
    let offer = offer(&maker, OfferDirection::Sell, ProtocolType::SubmarineSwap);
    publish(&maker, &offer);

    let id = taker.service.take_offer_at(offer, TAKE_DATE).await.unwrap();
    pump(&taker, &maker).await;
    taker.service.claim_settlement(id).await.unwrap();

    let (_, reveal) = taker.messenger.take().pop().unwrap();
    let mut wrong = reveal.message.clone();
    if let TradePayload::Swap(SwapMessage::Preimage { preimage }) = &mut wrong.payload {
        preimage[0] ^= 1;
    }
    let state = maker
        .service
        .handle_message(resign(wrong, &taker))
        .await
        .unwrap();

    assert_eq!(state, TradeState::Failed(FailureReason::InvalidPreimage));
    assert!(maker.messenger.is_empty());
}

#[tokio::test]
async fn test_cancel_is_refused_after_the_cutoff() {
    let maker = party(1, 1);
    let taker = party(2, 2);
    let offer = offer(&maker, OfferDirection::Sell, ProtocolType::Escrowless);
    publish(&maker, &offer);

    let id = taker.service.take_offer_at(offer, TAKE_DATE).await.unwrap();
    pump(&taker, &maker).await;
    maker.service.send_payment_details(id, "IBAN").await.unwrap();
    pump(&taker, &maker).await;
    taker.service.confirm_payment_sent(id).await.unwrap();
    pump(&taker, &maker).await;

    let refused = taker.service.cancel(id).await;
    assert!(matches!(
        refused,
        Err(TradeError::CancelNotAllowed(TradeState::PaymentSent))
    ));
    assert_eq!(open_trade(&taker, &id).await.state, TradeState::PaymentSent);
    assert!(taker.messenger.is_empty());
}

#[tokio::test]
async fn test_cancel_before_the_cutoff_reaches_both_sides() {
    let maker = party(1, 1);
    let taker = party(2, 2);
    let offer = offer(&maker, OfferDirection::Sell, ProtocolType::Escrowless);
    publish(&maker, &offer);

    let id = taker.service.take_offer_at(offer, TAKE_DATE).await.unwrap();
    pump(&taker, &maker).await;

    assert_eq!(taker.service.cancel(id).await.unwrap(), TradeState::Cancelled);
    pump(&taker, &maker).await;

    for side in [&maker, &taker] {
        assert_eq!(
            side.service.closed_trade(&id).unwrap().final_state,
            TradeState::Cancelled
        );
    }
}

#[tokio::test(start_paused = true)]
async fn test_missing_reply_times_out() {
    let maker = party(1, 1);
    let taker = party(2, 2);
    let offer = offer(&maker, OfferDirection::Sell, ProtocolType::Escrowless);
    publish(&maker, &offer);
    let mut updates = taker.service.subscribe();

    let id = taker.service.take_offer_at(offer, TAKE_DATE).await.unwrap();
    // the maker never answers
    taker.messenger.take();

    tokio::time::sleep(std::time::Duration::from_millis(config().response_timeout_ms + 100)).await;

    let closed = taker.service.closed_trade(&id).unwrap();
    assert_eq!(closed.final_state, TradeState::Failed(FailureReason::Timeout));

    let mut failure = None;
    while let Ok(update) = updates.try_recv() {
        failure = update.failure;
    }
    assert_eq!(failure, Some(FailureReason::Timeout));
}

#[tokio::test]
async fn test_reply_cancels_the_deadline() {
    let maker = party(1, 1);
    let taker = party(2, 2);
    let offer = offer(&maker, OfferDirection::Sell, ProtocolType::Escrowless);
    publish(&maker, &offer);

    let id = taker.service.take_offer_at(offer, TAKE_DATE).await.unwrap();
    pump(&taker, &maker).await;

    // stale deadline for the state the trade already left
    let state = taker
        .service
        .handle_event(
            id,
            agora_trade::TradeEvent::Timeout {
                state: TradeState::ContractProposed,
            },
        )
        .await
        .unwrap();
    assert_eq!(state, TradeState::ContractAgreed);
}

#[tokio::test]
async fn test_unreachable_peer_fails_the_trade() {
    let maker = party(1, 1);
    let taker = party(2, 2);
    let offer = offer(&maker, OfferDirection::Sell, ProtocolType::Escrowless);
    publish(&maker, &offer);
    taker.messenger.set_unreachable(true);

    let id = taker.service.take_offer_at(offer, TAKE_DATE).await.unwrap();
    assert_eq!(
        taker.service.closed_trade(&id).unwrap().failure,
        Some(FailureReason::PeerUnreachable)
    );
}

#[tokio::test]
async fn test_request_for_unpublished_offer_is_rejected() {
    let maker = party(1, 1);
    let taker = party(2, 2);
    let offer = offer(&maker, OfferDirection::Sell, ProtocolType::Escrowless);
    // never published

    let id = taker.service.take_offer_at(offer, TAKE_DATE).await.unwrap();
    let (_, request) = taker.messenger.take().pop().unwrap();

    let result = maker.service.handle_message(request).await;
    assert!(matches!(
        result,
        Err(TradeError::Rejected(FailureReason::OfferNotFound))
    ));
    assert!(maker.service.trade(&id).await.is_none());
    assert!(maker.service.closed_trade(&id).is_none());
}

#[tokio::test]
async fn test_out_of_order_message_fails_the_trade() {
    let maker = party(1, 1);
    let taker = party(2, 2);
    let offer = offer(&maker, OfferDirection::Sell, ProtocolType::Escrowless);
    publish(&maker, &offer);

    let id = taker.service.take_offer_at(offer, TAKE_DATE).await.unwrap();
    pump(&taker, &maker).await;

    // the buyer claims payment before receiving the account data
    let template = open_trade(&taker, &id).await;
    let early = agora_trade::TradeMessage {
        trade_id: id,
        protocol: ProtocolType::Escrowless,
        sender: taker.id.clone(),
        receiver: maker.id.clone(),
        sequence: template.next_sequence,
        payload: TradePayload::Escrowless(agora_trade::EscrowlessMessage::PaymentSent {
            settlement_address: "agora1xyz".into(),
        }),
    };
    let state = maker
        .service
        .handle_message(resign(early, &taker))
        .await
        .unwrap();
    assert_eq!(state, TradeState::Failed(FailureReason::UnexpectedMessage));
}

#[tokio::test]
async fn test_message_from_a_stranger_fails_with_sender_mismatch() {
    let maker = party(1, 1);
    let taker = party(2, 2);
    let stranger = party(3, 3);
    let offer = offer(&maker, OfferDirection::Sell, ProtocolType::Escrowless);
    publish(&maker, &offer);

    let id = taker.service.take_offer_at(offer, TAKE_DATE).await.unwrap();
    pump(&taker, &maker).await;

    let forged = agora_trade::TradeMessage {
        trade_id: id,
        protocol: ProtocolType::Escrowless,
        sender: stranger.id.clone(),
        receiver: maker.id.clone(),
        sequence: 0,
        payload: TradePayload::CancelTrade {
            reason: "not yours".into(),
        },
    };
    let state = maker
        .service
        .handle_message(resign(forged, &stranger))
        .await
        .unwrap();
    assert_eq!(state, TradeState::Failed(FailureReason::SenderMismatch));
}
