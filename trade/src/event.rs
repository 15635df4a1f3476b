//! Events that drive a trade

use crate::message::{MessageKind, SignedTradeMessage};
use crate::state::TradeState;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Explicit local action taken through a trade event handler
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum UserAction {
    TakeOffer,
    SendPaymentDetails { account_data: String },
    ConfirmPaymentSent,
    ConfirmPaymentReceived,
    ConfirmSettlementSent,
    ConfirmSettlementReceived,
    ClaimSettlement,
    Cancel,
}

/// Data-free tag of a [`UserAction`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ActionKind {
    TakeOffer,
    SendPaymentDetails,
    ConfirmPaymentSent,
    ConfirmPaymentReceived,
    ConfirmSettlementSent,
    ConfirmSettlementReceived,
    ClaimSettlement,
    Cancel,
}

impl UserAction {
    pub fn kind(&self) -> ActionKind {
        match self {
            UserAction::TakeOffer => ActionKind::TakeOffer,
            UserAction::SendPaymentDetails { .. } => ActionKind::SendPaymentDetails,
            UserAction::ConfirmPaymentSent => ActionKind::ConfirmPaymentSent,
            UserAction::ConfirmPaymentReceived => ActionKind::ConfirmPaymentReceived,
            UserAction::ConfirmSettlementSent => ActionKind::ConfirmSettlementSent,
            UserAction::ConfirmSettlementReceived => ActionKind::ConfirmSettlementReceived,
            UserAction::ClaimSettlement => ActionKind::ClaimSettlement,
            UserAction::Cancel => ActionKind::Cancel,
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TradeEvent {
    User(UserAction),
    Message(SignedTradeMessage),
    /// Response deadline armed when the trade entered `state`
    Timeout { state: TradeState },
    PeerUnreachable,
}

/// Transition table key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKey {
    Action(ActionKind),
    Message(MessageKind),
}

impl fmt::Display for EventKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventKey::Action(action) => write!(f, "action {}", action),
            EventKey::Message(kind) => write!(f, "message {}", kind),
        }
    }
}
