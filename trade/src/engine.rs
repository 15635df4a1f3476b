//! Trade engine
//!
//! Interprets transition tables. Each event runs the tasks of one
//! transition against a draft copy of the trade. A verification failure
//! moves the live trade to `Failed` without touching its model. A refused
//! local command (bad user input, wrong state) leaves it unchanged, while a
//! step that cannot run on a peer's message fails the trade.

use crate::event::{ActionKind, EventKey, TradeEvent, UserAction};
use crate::message::{
    EscrowlessMessage, MessageKind, MuSigMessage, MultiSigMessage, SignedTradeMessage,
    SwapMessage, TradeMessage, TradePayload,
};
use crate::model::{EscrowlessModel, MuSigModel, MultiSigModel, ProtocolModel, SwapModel, Trade};
use crate::state::{FailureReason, TradeState};
use crate::table::{Transition, TransitionTable};
use crate::task::{ProcessTask, Task};
use crate::wallet::SettlementWallet;
use crate::{TradeError, TradeResult};
use agora_contract::{ContractService, PartyRole, ProtocolType, TradeRole};
use agora_crypto::{hash_sha256, KeyPair};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Outcome of applying one event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Applied {
    Transitioned {
        from: TradeState,
        to: TradeState,
        /// Messages to send, in order
        outbound: Vec<SignedTradeMessage>,
        /// A reply is expected while the trade stays in `to`
        await_reply: bool,
    },
    Failed {
        from: TradeState,
        reason: FailureReason,
    },
    /// Message already applied
    Duplicate,
    /// Event no longer relevant: stale timeout, late cancel, final trade
    Ignored,
}

enum TaskError {
    Fail(FailureReason),
    Refuse(TradeError),
}

type TaskResult<T> = Result<T, TaskError>;

impl From<TradeError> for TaskError {
    fn from(err: TradeError) -> Self {
        TaskError::Refuse(err)
    }
}

/// What triggered the transition being run
struct Trigger<'a> {
    action: Option<&'a UserAction>,
    message: Option<&'a SignedTradeMessage>,
}

fn missing(kind: MessageKind, field: &'static str) -> TaskError {
    TaskError::Refuse(TradeError::ModelIncomplete { kind, field })
}

fn missing_for(task: ProcessTask, field: &'static str) -> TaskError {
    TaskError::Refuse(TradeError::InvalidInput(format!(
        "{:?} needs {} first",
        task, field
    )))
}

fn wallet_failure(err: TradeError) -> TaskError {
    warn!(error = %err, "Wallet call failed");
    TaskError::Fail(FailureReason::WalletFailure)
}

fn require(condition: bool, reason: FailureReason) -> TaskResult<()> {
    if condition {
        Ok(())
    } else {
        Err(TaskError::Fail(reason))
    }
}

fn wrong_model(protocol: ProtocolType) -> TaskError {
    TaskError::Refuse(TradeError::InvalidInput(format!(
        "step does not apply to {} trades",
        protocol
    )))
}

fn escrowless(model: &mut ProtocolModel) -> TaskResult<&mut EscrowlessModel> {
    match model {
        ProtocolModel::Escrowless(m) => Ok(m),
        other => Err(wrong_model(other.protocol())),
    }
}

fn musig(model: &mut ProtocolModel) -> TaskResult<&mut MuSigModel> {
    match model {
        ProtocolModel::MuSig(m) => Ok(m),
        other => Err(wrong_model(other.protocol())),
    }
}

fn multisig(model: &mut ProtocolModel) -> TaskResult<&mut MultiSigModel> {
    match model {
        ProtocolModel::MultiSig(m) => Ok(m),
        other => Err(wrong_model(other.protocol())),
    }
}

fn swap(model: &mut ProtocolModel) -> TaskResult<&mut SwapModel> {
    match model {
        ProtocolModel::Swap(m) => Ok(m),
        other => Err(wrong_model(other.protocol())),
    }
}

pub struct TradeEngine {
    keypair: Arc<KeyPair>,
    wallet: Arc<dyn SettlementWallet>,
    contracts: ContractService,
    tables: HashMap<(ProtocolType, TradeRole), TransitionTable>,
}

impl TradeEngine {
    /// Builds and validates the tables of every protocol and role
    pub fn new(keypair: Arc<KeyPair>, wallet: Arc<dyn SettlementWallet>) -> TradeResult<Self> {
        let mut tables = HashMap::new();
        for protocol in [
            ProtocolType::Escrowless,
            ProtocolType::MuSig,
            ProtocolType::MultiSig,
            ProtocolType::SubmarineSwap,
        ] {
            for role in TradeRole::ALL {
                let table = TransitionTable::build(protocol, role);
                table.validate()?;
                tables.insert((protocol, role), table);
            }
        }
        Ok(Self {
            keypair,
            wallet,
            contracts: ContractService::new(),
            tables,
        })
    }

    pub fn table(&self, protocol: ProtocolType, role: TradeRole) -> TradeResult<&TransitionTable> {
        self.tables
            .get(&(protocol, role))
            .ok_or_else(|| TradeError::InvalidTable(format!("no table for {} {}", protocol, role)))
    }

    pub async fn apply(&self, trade: &mut Trade, event: TradeEvent) -> TradeResult<Applied> {
        if trade.is_final() {
            return match event {
                TradeEvent::User(_) => Err(TradeError::TradeClosed(trade.id)),
                _ => Ok(Applied::Ignored),
            };
        }
        let table = self.table(trade.protocol(), trade.role)?;

        match event {
            TradeEvent::User(action) => self.apply_action(trade, table, &action).await,
            TradeEvent::Message(message) => self.apply_message(trade, table, &message).await,
            TradeEvent::Timeout { state } => {
                if trade.state == state {
                    Ok(Self::fail(trade, FailureReason::Timeout))
                } else {
                    Ok(Applied::Ignored)
                }
            }
            TradeEvent::PeerUnreachable => Ok(Self::fail(trade, FailureReason::PeerUnreachable)),
        }
    }

    fn fail(trade: &mut Trade, reason: FailureReason) -> Applied {
        let from = trade.state;
        trade.state = TradeState::Failed(reason);
        warn!(trade_id = %trade.id, from = %from, reason = %reason, "Trade failed");
        Applied::Failed { from, reason }
    }

    async fn apply_action(
        &self,
        trade: &mut Trade,
        table: &TransitionTable,
        action: &UserAction,
    ) -> TradeResult<Applied> {
        let kind = action.kind();
        if kind == ActionKind::Cancel {
            if !table.can_cancel(trade.state) {
                return Err(TradeError::CancelNotAllowed(trade.state));
            }
            let mut draft = trade.clone();
            let notice = match self.build(&mut draft, MessageKind::CancelTrade) {
                Ok(message) => message,
                Err(TaskError::Refuse(err)) => return Err(err),
                Err(TaskError::Fail(reason)) => return Ok(Self::fail(trade, reason)),
            };
            let from = trade.state;
            draft.state = TradeState::Cancelled;
            *trade = draft;
            return Ok(Applied::Transitioned {
                from,
                to: TradeState::Cancelled,
                outbound: vec![notice],
                await_reply: false,
            });
        }

        let transition = table
            .lookup(trade.state, EventKey::Action(kind))
            .ok_or(TradeError::ActionNotAllowed {
                state: trade.state,
                action: kind,
            })?;
        let trigger = Trigger {
            action: Some(action),
            message: None,
        };
        self.run(trade, transition, trigger).await
    }

    async fn apply_message(
        &self,
        trade: &mut Trade,
        table: &TransitionTable,
        signed: &SignedTradeMessage,
    ) -> TradeResult<Applied> {
        let message = &signed.message;
        let kind = message.kind();

        if message.sender != trade.counterparty().network_id {
            return Ok(Self::fail(trade, FailureReason::SenderMismatch));
        }
        if !signed.verify() {
            return Ok(Self::fail(trade, FailureReason::InvalidMessage));
        }
        if trade.has_seen(kind, message.sequence) {
            debug!(trade_id = %trade.id, kind = %kind, sequence = message.sequence, "Duplicate trade message");
            return Ok(Applied::Duplicate);
        }
        if message.trade_id != trade.id
            || message.protocol != trade.protocol()
            || message.receiver != trade.me().network_id
        {
            return Ok(Self::fail(trade, FailureReason::InvalidMessage));
        }

        if kind == MessageKind::CancelTrade {
            if !table.can_cancel(trade.state) {
                warn!(trade_id = %trade.id, state = %trade.state, "Ignoring cancel past the cutoff");
                return Ok(Applied::Ignored);
            }
            let from = trade.state;
            trade.seen.insert((kind, message.sequence));
            trade.state = TradeState::Cancelled;
            return Ok(Applied::Transitioned {
                from,
                to: TradeState::Cancelled,
                outbound: vec![],
                await_reply: false,
            });
        }

        match table.lookup(trade.state, EventKey::Message(kind)) {
            Some(transition) => {
                let trigger = Trigger {
                    action: None,
                    message: Some(signed),
                };
                self.run(trade, transition, trigger).await
            }
            None => {
                debug!(trade_id = %trade.id, state = %trade.state, kind = %kind, "No transition for message");
                Ok(Self::fail(trade, FailureReason::UnexpectedMessage))
            }
        }
    }

    async fn run(
        &self,
        trade: &mut Trade,
        transition: &Transition,
        trigger: Trigger<'_>,
    ) -> TradeResult<Applied> {
        let from = trade.state;
        let mut draft = trade.clone();
        let mut outbound = Vec::new();
        let mut await_reply = false;

        for task in &transition.tasks {
            let result = match task {
                Task::Send(send) => self.build(&mut draft, send.kind).map(|message| {
                    outbound.push(message);
                    await_reply |= send.await_reply;
                }),
                Task::Process(process) => self.process(&mut draft, *process, &trigger).await,
            };
            match result {
                Ok(()) => {}
                Err(TaskError::Fail(reason)) => return Ok(Self::fail(trade, reason)),
                Err(TaskError::Refuse(err)) if trigger.message.is_some() => {
                    debug!(trade_id = %trade.id, error = %err, "Peer message cannot be processed");
                    return Ok(Self::fail(trade, FailureReason::InvalidMessage));
                }
                Err(TaskError::Refuse(err)) => return Err(err),
            }
        }

        if let Some(signed) = trigger.message {
            draft.seen.insert((signed.kind(), signed.message.sequence));
        }
        draft.state = transition.next;
        *trade = draft;
        debug!(trade_id = %trade.id, from = %from, to = %transition.next, "Trade transitioned");

        Ok(Applied::Transitioned {
            from,
            to: transition.next,
            outbound,
            await_reply,
        })
    }

    fn build(&self, draft: &mut Trade, kind: MessageKind) -> TaskResult<SignedTradeMessage> {
        let payload = Self::payload(draft, kind)?;
        let message = TradeMessage {
            trade_id: draft.id,
            protocol: draft.protocol(),
            sender: draft.me().network_id.clone(),
            receiver: draft.counterparty().network_id.clone(),
            sequence: draft.next_sequence,
            payload,
        };
        draft.next_sequence += 1;
        Ok(SignedTradeMessage::sign(message, &self.keypair)?)
    }

    fn payload(draft: &mut Trade, kind: MessageKind) -> TaskResult<TradePayload> {
        use MessageKind::*;

        let is_seller = draft.role.is_seller();
        let base_amount = draft.contract.base_amount;
        let payload = match kind {
            TakeOfferRequest => TradePayload::TakeOfferRequest {
                contract: draft.contract.clone(),
                taker_signature: draft
                    .taker_signature
                    .clone()
                    .ok_or_else(|| missing(kind, "taker signature"))?,
            },
            TakeOfferResponse => TradePayload::TakeOfferResponse {
                maker_signature: draft
                    .maker_signature
                    .clone()
                    .ok_or_else(|| missing(kind, "maker signature"))?,
            },
            CancelTrade => TradePayload::CancelTrade {
                reason: "cancelled by user".into(),
            },

            EscrowlessAccountData => {
                let m = escrowless(&mut draft.model)?;
                TradePayload::Escrowless(EscrowlessMessage::AccountData {
                    account_data: m
                        .account_data
                        .clone()
                        .ok_or_else(|| missing(kind, "account data"))?,
                })
            }
            EscrowlessPaymentSent => {
                let m = escrowless(&mut draft.model)?;
                TradePayload::Escrowless(EscrowlessMessage::PaymentSent {
                    settlement_address: m
                        .settlement_address
                        .clone()
                        .ok_or_else(|| missing(kind, "settlement address"))?,
                })
            }
            EscrowlessPaymentReceived => {
                TradePayload::Escrowless(EscrowlessMessage::PaymentReceived)
            }
            EscrowlessSettlementSent => {
                let m = escrowless(&mut draft.model)?;
                TradePayload::Escrowless(EscrowlessMessage::SettlementSent {
                    txid: m
                        .settlement_txid
                        .clone()
                        .ok_or_else(|| missing(kind, "settlement txid"))?,
                })
            }
            EscrowlessSettlementReceived => {
                TradePayload::Escrowless(EscrowlessMessage::SettlementReceived)
            }

            MuSigKeyShares => {
                let m = musig(&mut draft.model)?;
                TradePayload::MuSig(MuSigMessage::KeyShares {
                    key_share: m.my_key_share.clone().ok_or_else(|| missing(kind, "key share"))?,
                    nonce_share: m
                        .my_nonce_share
                        .clone()
                        .ok_or_else(|| missing(kind, "nonce share"))?,
                })
            }
            MuSigPartialSignatures => {
                let m = musig(&mut draft.model)?;
                let sigs = m
                    .my_signatures
                    .clone()
                    .ok_or_else(|| missing(kind, "partial signatures"))?;
                TradePayload::MuSig(MuSigMessage::PartialSignatures {
                    deposit_signature: sigs.deposit,
                    payout_signature: sigs.payout,
                    // the seller releases its swap signature only on payment receipt
                    swap_signature: if is_seller { None } else { Some(sigs.swap) },
                })
            }
            MuSigDepositPublished => {
                let m = musig(&mut draft.model)?;
                TradePayload::MuSig(MuSigMessage::DepositPublished {
                    txid: m.deposit_txid.clone().ok_or_else(|| missing(kind, "deposit txid"))?,
                })
            }
            MuSigPaymentInitiated => TradePayload::MuSig(MuSigMessage::PaymentInitiated),
            MuSigPaymentReceived => {
                let m = musig(&mut draft.model)?;
                let sigs = m
                    .my_signatures
                    .as_ref()
                    .ok_or_else(|| missing(kind, "partial signatures"))?;
                TradePayload::MuSig(MuSigMessage::PaymentReceived {
                    swap_signature: sigs.swap.clone(),
                })
            }
            MuSigCloseTrade => {
                let m = musig(&mut draft.model)?;
                TradePayload::MuSig(MuSigMessage::CloseTrade {
                    output_key_share: m
                        .my_key_share
                        .clone()
                        .ok_or_else(|| missing(kind, "key share"))?,
                })
            }

            MultiSigTakerInputs => {
                let m = multisig(&mut draft.model)?;
                TradePayload::MultiSig(MultiSigMessage::TakerInputs {
                    inputs: m.my_inputs.clone(),
                    key_share: m.my_key_share.clone().ok_or_else(|| missing(kind, "key share"))?,
                })
            }
            MultiSigDepositSignature => {
                let m = multisig(&mut draft.model)?;
                TradePayload::MultiSig(MultiSigMessage::DepositSignature {
                    inputs: m.my_inputs.clone(),
                    key_share: m.my_key_share.clone().ok_or_else(|| missing(kind, "key share"))?,
                    signature: m
                        .deposit_signature
                        .clone()
                        .ok_or_else(|| missing(kind, "deposit signature"))?,
                })
            }
            MultiSigDepositPublished => {
                let m = multisig(&mut draft.model)?;
                TradePayload::MultiSig(MultiSigMessage::DepositPublished {
                    txid: m.deposit_txid.clone().ok_or_else(|| missing(kind, "deposit txid"))?,
                })
            }
            MultiSigPaymentSent => {
                let m = multisig(&mut draft.model)?;
                TradePayload::MultiSig(MultiSigMessage::PaymentSent {
                    payout_signature: m
                        .payout_signature
                        .clone()
                        .ok_or_else(|| missing(kind, "payout signature"))?,
                })
            }
            MultiSigPayoutPublished => {
                let m = multisig(&mut draft.model)?;
                TradePayload::MultiSig(MultiSigMessage::PayoutPublished {
                    txid: m.payout_txid.clone().ok_or_else(|| missing(kind, "payout txid"))?,
                })
            }

            SwapInvoice => {
                let m = swap(&mut draft.model)?;
                TradePayload::Swap(SwapMessage::Invoice {
                    payment_hash: m.payment_hash.ok_or_else(|| missing(kind, "payment hash"))?,
                    amount: base_amount,
                })
            }
            SwapHtlcLocked => {
                let m = swap(&mut draft.model)?;
                TradePayload::Swap(SwapMessage::HtlcLocked {
                    txid: m.htlc_txid.clone().ok_or_else(|| missing(kind, "htlc txid"))?,
                })
            }
            SwapPreimage => {
                let m = swap(&mut draft.model)?;
                TradePayload::Swap(SwapMessage::Preimage {
                    preimage: m.preimage.ok_or_else(|| missing(kind, "preimage"))?,
                })
            }
            SwapCompleted => TradePayload::Swap(SwapMessage::Completed),
        };
        Ok(payload)
    }

    async fn process(
        &self,
        draft: &mut Trade,
        task: ProcessTask,
        trigger: &Trigger<'_>,
    ) -> TaskResult<()> {
        let trade_id = draft.id;
        match task {
            ProcessTask::Verify(kind) => {
                let signed = trigger.message.ok_or_else(|| {
                    TaskError::Refuse(TradeError::InvalidInput(format!(
                        "{} verification without a message",
                        kind
                    )))
                })?;
                self.verify(draft, &signed.message.payload)
            }
            ProcessTask::SignContract => {
                let signature = self
                    .contracts
                    .sign_contract(&draft.contract, &self.keypair)
                    .map_err(|_| TaskError::Fail(FailureReason::InvalidContract))?;
                match draft.role.party_role() {
                    PartyRole::Maker => draft.maker_signature = Some(signature),
                    PartyRole::Taker => draft.taker_signature = Some(signature),
                }
                Ok(())
            }
            ProcessTask::RecordAccountData => {
                let account_data = match trigger.action {
                    Some(UserAction::SendPaymentDetails { account_data }) => account_data,
                    _ => return Err(missing_for(task, "payment details")),
                };
                if account_data.trim().is_empty() {
                    return Err(TaskError::Refuse(TradeError::InvalidInput(
                        "empty payment details".into(),
                    )));
                }
                escrowless(&mut draft.model)?.account_data = Some(account_data.clone());
                Ok(())
            }
            ProcessTask::ReserveAddress => {
                let address = self
                    .wallet
                    .receive_address(&trade_id)
                    .await
                    .map_err(wallet_failure)?;
                escrowless(&mut draft.model)?.settlement_address = Some(address);
                Ok(())
            }
            ProcessTask::PrepareKeyShares => {
                let key_share = self.wallet.key_share(&trade_id).await.map_err(wallet_failure)?;
                match &mut draft.model {
                    ProtocolModel::MuSig(m) => {
                        let nonce_share = self
                            .wallet
                            .nonce_share(&trade_id)
                            .await
                            .map_err(wallet_failure)?;
                        m.my_key_share = Some(key_share);
                        m.my_nonce_share = Some(nonce_share);
                    }
                    ProtocolModel::MultiSig(m) => {
                        let inputs = self
                            .wallet
                            .spendable_outputs(draft.contract.base_amount)
                            .await
                            .map_err(wallet_failure)?;
                        m.my_key_share = Some(key_share);
                        m.my_inputs = inputs;
                    }
                    other => return Err(wrong_model(other.protocol())),
                }
                Ok(())
            }
            ProcessTask::SignPartials => {
                let m = musig(&mut draft.model)?;
                let peer_key = m
                    .peer_key_share
                    .clone()
                    .ok_or_else(|| missing_for(task, "peer key share"))?;
                let peer_nonce = m
                    .peer_nonce_share
                    .clone()
                    .ok_or_else(|| missing_for(task, "peer nonce share"))?;
                let sigs = self
                    .wallet
                    .partial_signatures(&trade_id, &peer_key, &peer_nonce)
                    .await
                    .map_err(wallet_failure)?;
                musig(&mut draft.model)?.my_signatures = Some(sigs);
                Ok(())
            }
            ProcessTask::SignDeposit => {
                let payload = format!("deposit:{}", trade_id);
                let signature = self
                    .wallet
                    .sign(&trade_id, payload.as_bytes())
                    .await
                    .map_err(wallet_failure)?;
                multisig(&mut draft.model)?.deposit_signature = Some(signature);
                Ok(())
            }
            ProcessTask::PublishDeposit => {
                let txid = self
                    .wallet
                    .broadcast_deposit(&trade_id)
                    .await
                    .map_err(wallet_failure)?;
                match &mut draft.model {
                    ProtocolModel::MuSig(m) => m.deposit_txid = Some(txid),
                    ProtocolModel::MultiSig(m) => m.deposit_txid = Some(txid),
                    other => return Err(wrong_model(other.protocol())),
                }
                Ok(())
            }
            ProcessTask::SignPayout => {
                let payload = format!("payout:{}", trade_id);
                let signature = self
                    .wallet
                    .sign(&trade_id, payload.as_bytes())
                    .await
                    .map_err(wallet_failure)?;
                multisig(&mut draft.model)?.payout_signature = Some(signature);
                Ok(())
            }
            ProcessTask::PublishPayout => {
                let txid = self
                    .wallet
                    .broadcast_payout(&trade_id)
                    .await
                    .map_err(wallet_failure)?;
                match &mut draft.model {
                    ProtocolModel::Escrowless(m) => m.settlement_txid = Some(txid),
                    ProtocolModel::MuSig(m) => m.payout_txid = Some(txid),
                    ProtocolModel::MultiSig(m) => m.payout_txid = Some(txid),
                    other => return Err(wrong_model(other.protocol())),
                }
                Ok(())
            }
            ProcessTask::CreateInvoice => {
                let preimage = self
                    .wallet
                    .swap_preimage(&trade_id)
                    .await
                    .map_err(wallet_failure)?;
                let m = swap(&mut draft.model)?;
                m.payment_hash = Some(hash_sha256(&preimage));
                m.preimage = Some(preimage);
                Ok(())
            }
            ProcessTask::LockHtlc => {
                let payment_hash = swap(&mut draft.model)?
                    .payment_hash
                    .ok_or_else(|| missing_for(task, "payment hash"))?;
                let txid = self
                    .wallet
                    .lock_htlc(&trade_id, &payment_hash, draft.contract.base_amount)
                    .await
                    .map_err(wallet_failure)?;
                swap(&mut draft.model)?.htlc_txid = Some(txid);
                Ok(())
            }
        }
    }

    /// Checks an inbound payload, then stores what it carries
    fn verify(&self, draft: &mut Trade, payload: &TradePayload) -> TaskResult<()> {
        match payload {
            TradePayload::TakeOfferRequest {
                contract,
                taker_signature,
            } => {
                require(
                    contract.verify().is_ok() && *contract == draft.contract,
                    FailureReason::InvalidContract,
                )?;
                self.contracts
                    .verify_signature(contract, taker_signature, PartyRole::Taker)
                    .map_err(|_| TaskError::Fail(FailureReason::InvalidContractSignature))?;
                draft.taker_signature = Some(taker_signature.clone());
            }
            TradePayload::TakeOfferResponse { maker_signature } => {
                self.contracts
                    .verify_signature(&draft.contract, maker_signature, PartyRole::Maker)
                    .map_err(|_| TaskError::Fail(FailureReason::InvalidContractSignature))?;
                draft.maker_signature = Some(maker_signature.clone());
            }
            TradePayload::CancelTrade { .. } => {}

            TradePayload::Escrowless(message) => {
                let m = escrowless(&mut draft.model)?;
                match message {
                    EscrowlessMessage::AccountData { account_data } => {
                        require(!account_data.is_empty(), FailureReason::InvalidMessage)?;
                        m.account_data = Some(account_data.clone());
                    }
                    EscrowlessMessage::PaymentSent { settlement_address } => {
                        require(!settlement_address.is_empty(), FailureReason::InvalidMessage)?;
                        m.settlement_address = Some(settlement_address.clone());
                    }
                    EscrowlessMessage::SettlementSent { txid } => {
                        require(!txid.is_empty(), FailureReason::InvalidMessage)?;
                        m.settlement_txid = Some(txid.clone());
                    }
                    EscrowlessMessage::PaymentReceived | EscrowlessMessage::SettlementReceived => {}
                }
            }

            TradePayload::MuSig(message) => {
                // the counterparty is the seller exactly when we buy
                let peer_is_seller = draft.role.is_buyer();
                let m = musig(&mut draft.model)?;
                match message {
                    MuSigMessage::KeyShares {
                        key_share,
                        nonce_share,
                    } => {
                        require(
                            !key_share.is_empty() && !nonce_share.is_empty(),
                            FailureReason::InvalidMessage,
                        )?;
                        m.peer_key_share = Some(key_share.clone());
                        m.peer_nonce_share = Some(nonce_share.clone());
                    }
                    MuSigMessage::PartialSignatures {
                        deposit_signature,
                        payout_signature,
                        swap_signature,
                    } => {
                        require(
                            swap_signature.is_none() == peer_is_seller,
                            FailureReason::RedactionMismatch,
                        )?;
                        require(
                            !deposit_signature.is_empty()
                                && !payout_signature.is_empty()
                                && !matches!(swap_signature, Some(s) if s.is_empty()),
                            FailureReason::InvalidMessage,
                        )?;
                        m.peer_deposit_signature = Some(deposit_signature.clone());
                        m.peer_payout_signature = Some(payout_signature.clone());
                        m.peer_swap_signature = swap_signature.clone();
                    }
                    MuSigMessage::DepositPublished { txid } => {
                        require(!txid.is_empty(), FailureReason::InvalidMessage)?;
                        m.deposit_txid = Some(txid.clone());
                    }
                    MuSigMessage::PaymentInitiated => {}
                    MuSigMessage::PaymentReceived { swap_signature } => {
                        require(!swap_signature.is_empty(), FailureReason::InvalidMessage)?;
                        m.peer_swap_signature = Some(swap_signature.clone());
                    }
                    MuSigMessage::CloseTrade { output_key_share } => {
                        require(!output_key_share.is_empty(), FailureReason::InvalidMessage)?;
                        m.peer_output_key_share = Some(output_key_share.clone());
                    }
                }
            }

            TradePayload::MultiSig(message) => {
                let m = multisig(&mut draft.model)?;
                match message {
                    MultiSigMessage::TakerInputs { inputs, key_share } => {
                        require(
                            !inputs.is_empty() && !key_share.is_empty(),
                            FailureReason::InvalidMessage,
                        )?;
                        m.peer_inputs = inputs.clone();
                        m.peer_key_share = Some(key_share.clone());
                    }
                    MultiSigMessage::DepositSignature {
                        inputs,
                        key_share,
                        signature,
                    } => {
                        require(
                            !inputs.is_empty()
                                && !key_share.is_empty()
                                && !signature.signature.is_empty(),
                            FailureReason::InvalidMessage,
                        )?;
                        m.peer_inputs = inputs.clone();
                        m.peer_key_share = Some(key_share.clone());
                        m.deposit_signature = Some(signature.clone());
                    }
                    MultiSigMessage::DepositPublished { txid } => {
                        require(!txid.is_empty(), FailureReason::InvalidMessage)?;
                        m.deposit_txid = Some(txid.clone());
                    }
                    MultiSigMessage::PaymentSent { payout_signature } => {
                        require(
                            !payout_signature.signature.is_empty(),
                            FailureReason::InvalidMessage,
                        )?;
                        m.payout_signature = Some(payout_signature.clone());
                    }
                    MultiSigMessage::PayoutPublished { txid } => {
                        require(!txid.is_empty(), FailureReason::InvalidMessage)?;
                        m.payout_txid = Some(txid.clone());
                    }
                }
            }

            TradePayload::Swap(message) => {
                let base_amount = draft.contract.base_amount;
                let m = swap(&mut draft.model)?;
                match message {
                    SwapMessage::Invoice {
                        payment_hash,
                        amount,
                    } => {
                        require(*amount == base_amount, FailureReason::InvalidMessage)?;
                        m.payment_hash = Some(*payment_hash);
                    }
                    SwapMessage::HtlcLocked { txid } => {
                        require(!txid.is_empty(), FailureReason::InvalidMessage)?;
                        m.htlc_txid = Some(txid.clone());
                    }
                    SwapMessage::Preimage { preimage } => {
                        require(
                            m.payment_hash == Some(hash_sha256(preimage)),
                            FailureReason::InvalidPreimage,
                        )?;
                        m.preimage = Some(*preimage);
                    }
                    SwapMessage::Completed => {}
                }
            }
        }
        Ok(())
    }
}
