//! Transition tables
//!
//! One table per protocol variant and local trade role, mapping
//! `(state, event)` to the tasks to run and the state to enter.

use crate::event::{ActionKind, EventKey};
use crate::message::MessageKind;
use crate::state::TradeState;
use crate::task::{ProcessTask, Task};
use crate::{TradeError, TradeResult};
use agora_contract::{ProtocolType, TradeRole};
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub tasks: Vec<Task>,
    pub next: TradeState,
}

#[derive(Debug, Clone)]
pub struct TransitionTable {
    protocol: ProtocolType,
    role: TradeRole,
    /// First state past the point of no return
    cutoff: TradeState,
    transitions: HashMap<(TradeState, EventKey), Transition>,
}

impl TransitionTable {
    pub fn build(protocol: ProtocolType, role: TradeRole) -> Self {
        let cutoff = match protocol {
            ProtocolType::Escrowless => TradeState::PaymentSent,
            ProtocolType::MuSig | ProtocolType::MultiSig => TradeState::DepositPublished,
            ProtocolType::SubmarineSwap => TradeState::HtlcLocked,
        };
        let mut table = Self {
            protocol,
            role,
            cutoff,
            transitions: HashMap::new(),
        };
        table.add_contract_phase();
        match protocol {
            ProtocolType::Escrowless => table.add_escrowless(),
            ProtocolType::MuSig => table.add_musig(),
            ProtocolType::MultiSig => table.add_multisig(),
            ProtocolType::SubmarineSwap => table.add_swap(),
        }
        table
    }

    pub fn protocol(&self) -> ProtocolType {
        self.protocol
    }

    pub fn role(&self) -> TradeRole {
        self.role
    }

    pub fn cutoff(&self) -> TradeState {
        self.cutoff
    }

    pub fn lookup(&self, state: TradeState, key: EventKey) -> Option<&Transition> {
        self.transitions.get(&(state, key))
    }

    /// Cancelling is possible only before the point of no return
    pub fn can_cancel(&self, state: TradeState) -> bool {
        !state.is_final() && state.ordinal() < self.cutoff.ordinal()
    }

    pub fn len(&self) -> usize {
        self.transitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transitions.is_empty()
    }

    /// Every transition must move strictly forward and leave a live state
    pub fn validate(&self) -> TradeResult<()> {
        for ((from, key), transition) in &self.transitions {
            if from.is_final() {
                return Err(TradeError::InvalidTable(format!(
                    "{} {}: transition out of final state {}",
                    self.protocol, self.role, from
                )));
            }
            if transition.next.ordinal() <= from.ordinal() {
                return Err(TradeError::InvalidTable(format!(
                    "{} {}: {} on {} goes back to {}",
                    self.protocol, self.role, from, key, transition.next
                )));
            }
        }
        Ok(())
    }

    fn on(&mut self, from: TradeState, key: EventKey, tasks: Vec<Task>, next: TradeState) {
        self.transitions.insert((from, key), Transition { tasks, next });
    }

    fn on_action(&mut self, from: TradeState, action: ActionKind, tasks: Vec<Task>, next: TradeState) {
        self.on(from, EventKey::Action(action), tasks, next);
    }

    /// Inbound messages always verify first
    fn on_message(
        &mut self,
        from: TradeState,
        kind: MessageKind,
        then: Vec<Task>,
        next: TradeState,
    ) {
        let mut tasks = vec![Task::verify(kind)];
        tasks.extend(then);
        self.on(from, EventKey::Message(kind), tasks, next);
    }

    /// Sends the variant appends to the local agreement transition
    fn kickoff(&self) -> Vec<Task> {
        match self.protocol {
            ProtocolType::Escrowless => vec![],
            ProtocolType::MuSig if self.role.is_maker() => vec![
                Task::process(ProcessTask::PrepareKeyShares),
                Task::send_awaiting(MessageKind::MuSigKeyShares),
            ],
            ProtocolType::MultiSig if self.role.is_taker() => vec![
                Task::process(ProcessTask::PrepareKeyShares),
                Task::send_awaiting(MessageKind::MultiSigTakerInputs),
            ],
            ProtocolType::SubmarineSwap if self.role.is_buyer() => vec![
                Task::process(ProcessTask::CreateInvoice),
                Task::send_awaiting(MessageKind::SwapInvoice),
            ],
            _ => vec![],
        }
    }

    fn add_contract_phase(&mut self) {
        let kickoff = self.kickoff();
        if self.role.is_taker() {
            self.on_action(
                TradeState::Init,
                ActionKind::TakeOffer,
                vec![
                    Task::process(ProcessTask::SignContract),
                    Task::send_awaiting(MessageKind::TakeOfferRequest),
                ],
                TradeState::ContractProposed,
            );
            self.on_message(
                TradeState::ContractProposed,
                MessageKind::TakeOfferResponse,
                kickoff,
                TradeState::ContractAgreed,
            );
        } else {
            let mut tasks = vec![
                Task::process(ProcessTask::SignContract),
                Task::send(MessageKind::TakeOfferResponse),
            ];
            tasks.extend(kickoff);
            self.on_message(
                TradeState::Init,
                MessageKind::TakeOfferRequest,
                tasks,
                TradeState::ContractAgreed,
            );
        }
    }

    fn add_escrowless(&mut self) {
        use MessageKind::*;
        use TradeState::*;

        if self.role.is_seller() {
            self.on_action(
                ContractAgreed,
                ActionKind::SendPaymentDetails,
                vec![
                    Task::process(ProcessTask::RecordAccountData),
                    Task::send(EscrowlessAccountData),
                ],
                PaymentDetailsExchanged,
            );
            self.on_message(PaymentDetailsExchanged, EscrowlessPaymentSent, vec![], PaymentSent);
            self.on_action(
                PaymentSent,
                ActionKind::ConfirmPaymentReceived,
                vec![Task::send(EscrowlessPaymentReceived)],
                PaymentReceived,
            );
            self.on_action(
                PaymentReceived,
                ActionKind::ConfirmSettlementSent,
                vec![
                    Task::process(ProcessTask::PublishPayout),
                    Task::send(EscrowlessSettlementSent),
                ],
                SettlementSent,
            );
            self.on_message(SettlementSent, EscrowlessSettlementReceived, vec![], Completed);
        } else {
            self.on_message(ContractAgreed, EscrowlessAccountData, vec![], PaymentDetailsExchanged);
            self.on_action(
                PaymentDetailsExchanged,
                ActionKind::ConfirmPaymentSent,
                vec![
                    Task::process(ProcessTask::ReserveAddress),
                    Task::send(EscrowlessPaymentSent),
                ],
                PaymentSent,
            );
            self.on_message(PaymentSent, EscrowlessPaymentReceived, vec![], PaymentReceived);
            self.on_message(PaymentReceived, EscrowlessSettlementSent, vec![], SettlementSent);
            self.on_action(
                SettlementSent,
                ActionKind::ConfirmSettlementReceived,
                vec![Task::send(EscrowlessSettlementReceived)],
                Completed,
            );
        }
    }

    fn add_musig(&mut self) {
        use MessageKind::*;
        use TradeState::*;

        // setup: maker opens with key shares, taker answers with shares and
        // signatures, maker countersigns, taker publishes the deposit
        if self.role.is_maker() {
            self.on_message(ContractAgreed, MuSigKeyShares, vec![], KeysExchanged);
            self.on_message(
                KeysExchanged,
                MuSigPartialSignatures,
                vec![
                    Task::process(ProcessTask::SignPartials),
                    Task::send_awaiting(MuSigPartialSignatures),
                ],
                PartialSignaturesExchanged,
            );
            self.on_message(
                PartialSignaturesExchanged,
                MuSigDepositPublished,
                vec![],
                DepositPublished,
            );
        } else {
            self.on_message(
                ContractAgreed,
                MuSigKeyShares,
                vec![
                    Task::process(ProcessTask::PrepareKeyShares),
                    Task::send(MuSigKeyShares),
                    Task::process(ProcessTask::SignPartials),
                    Task::send_awaiting(MuSigPartialSignatures),
                ],
                KeysExchanged,
            );
            self.on_message(
                KeysExchanged,
                MuSigPartialSignatures,
                vec![
                    Task::process(ProcessTask::PublishDeposit),
                    Task::send(MuSigDepositPublished),
                ],
                DepositPublished,
            );
        }

        // settlement
        if self.role.is_buyer() {
            self.on_action(
                DepositPublished,
                ActionKind::ConfirmPaymentSent,
                vec![Task::send(MuSigPaymentInitiated)],
                PaymentSent,
            );
            self.on_message(PaymentSent, MuSigPaymentReceived, vec![], PaymentReceived);
            self.on_action(
                PaymentReceived,
                ActionKind::ClaimSettlement,
                vec![
                    Task::process(ProcessTask::PublishPayout),
                    Task::send(MuSigCloseTrade),
                ],
                Completed,
            );
        } else {
            self.on_message(DepositPublished, MuSigPaymentInitiated, vec![], PaymentSent);
            self.on_action(
                PaymentSent,
                ActionKind::ConfirmPaymentReceived,
                vec![Task::send(MuSigPaymentReceived)],
                PaymentReceived,
            );
            self.on_message(PaymentReceived, MuSigCloseTrade, vec![], Completed);
        }
    }

    fn add_multisig(&mut self) {
        use MessageKind::*;
        use TradeState::*;

        if self.role.is_maker() {
            self.on_message(
                ContractAgreed,
                MultiSigTakerInputs,
                vec![
                    Task::process(ProcessTask::PrepareKeyShares),
                    Task::process(ProcessTask::SignDeposit),
                    Task::send_awaiting(MultiSigDepositSignature),
                ],
                DepositSigned,
            );
            self.on_message(DepositSigned, MultiSigDepositPublished, vec![], DepositPublished);
        } else {
            self.on_message(
                ContractAgreed,
                MultiSigDepositSignature,
                vec![
                    Task::process(ProcessTask::PublishDeposit),
                    Task::send(MultiSigDepositPublished),
                ],
                DepositPublished,
            );
        }

        if self.role.is_buyer() {
            self.on_action(
                DepositPublished,
                ActionKind::ConfirmPaymentSent,
                vec![
                    Task::process(ProcessTask::SignPayout),
                    Task::send(MultiSigPaymentSent),
                ],
                PaymentSent,
            );
            self.on_message(PaymentSent, MultiSigPayoutPublished, vec![], Completed);
        } else {
            self.on_message(DepositPublished, MultiSigPaymentSent, vec![], PaymentSent);
            self.on_action(
                PaymentSent,
                ActionKind::ConfirmPaymentReceived,
                vec![
                    Task::process(ProcessTask::PublishPayout),
                    Task::send(MultiSigPayoutPublished),
                ],
                Completed,
            );
        }
    }

    fn add_swap(&mut self) {
        use MessageKind::*;
        use TradeState::*;

        if self.role.is_buyer() {
            self.on_message(ContractAgreed, SwapHtlcLocked, vec![], HtlcLocked);
            self.on_action(
                HtlcLocked,
                ActionKind::ClaimSettlement,
                vec![Task::send_awaiting(SwapPreimage)],
                PreimageRevealed,
            );
            self.on_message(PreimageRevealed, SwapCompleted, vec![], Completed);
        } else {
            self.on_message(
                ContractAgreed,
                SwapInvoice,
                vec![
                    Task::process(ProcessTask::LockHtlc),
                    Task::send(SwapHtlcLocked),
                ],
                HtlcLocked,
            );
            self.on_message(HtlcLocked, SwapPreimage, vec![Task::send(SwapCompleted)], Completed);
        }
    }
}
