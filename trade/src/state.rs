//! Trade states
//!
//! All protocol variants share one state enum. The ordinal orders states
//! along the settlement path; every transition must move strictly forward.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Machine-readable reason a trade failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum FailureReason {
    InvalidContractSignature,
    InvalidContract,
    OfferNotFound,
    SenderMismatch,
    UnexpectedMessage,
    RedactionMismatch,
    InvalidMessage,
    InvalidPreimage,
    WalletFailure,
    Timeout,
    PeerUnreachable,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FailureReason::InvalidContractSignature => "invalid contract signature",
            FailureReason::InvalidContract => "invalid contract",
            FailureReason::OfferNotFound => "offer not found",
            FailureReason::SenderMismatch => "sender is not the counterparty",
            FailureReason::UnexpectedMessage => "unexpected message",
            FailureReason::RedactionMismatch => "redaction mismatch",
            FailureReason::InvalidMessage => "invalid message",
            FailureReason::InvalidPreimage => "invalid preimage",
            FailureReason::WalletFailure => "wallet failure",
            FailureReason::Timeout => "timeout",
            FailureReason::PeerUnreachable => "peer unreachable",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TradeState {
    Init,
    ContractProposed,
    ContractAgreed,

    // escrowless
    PaymentDetailsExchanged,

    // musig
    KeysExchanged,
    PartialSignaturesExchanged,

    // multisig
    DepositSigned,

    // musig and multisig
    DepositPublished,

    // submarine swap
    HtlcLocked,
    PreimageRevealed,

    PaymentSent,
    PaymentReceived,
    SettlementSent,

    Completed,
    Cancelled,
    Failed(FailureReason),
}

impl TradeState {
    pub fn ordinal(&self) -> u32 {
        match self {
            TradeState::Init => 0,
            TradeState::ContractProposed => 10,
            TradeState::ContractAgreed => 20,
            TradeState::PaymentDetailsExchanged | TradeState::KeysExchanged => 30,
            TradeState::PartialSignaturesExchanged
            | TradeState::DepositSigned
            | TradeState::HtlcLocked => 40,
            TradeState::DepositPublished => 50,
            TradeState::PaymentSent | TradeState::PreimageRevealed => 60,
            TradeState::PaymentReceived => 70,
            TradeState::SettlementSent => 80,
            TradeState::Completed | TradeState::Cancelled | TradeState::Failed(_) => 100,
        }
    }

    pub fn is_final(&self) -> bool {
        matches!(
            self,
            TradeState::Completed | TradeState::Cancelled | TradeState::Failed(_)
        )
    }

    pub fn is_success(&self) -> bool {
        matches!(self, TradeState::Completed)
    }

    pub fn failure(&self) -> Option<FailureReason> {
        match self {
            TradeState::Failed(reason) => Some(*reason),
            _ => None,
        }
    }
}

impl fmt::Display for TradeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TradeState::Failed(reason) => write!(f, "Failed({})", reason),
            other => write!(f, "{:?}", other),
        }
    }
}
