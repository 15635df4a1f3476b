//! Agora Trade Protocol
//!
//! Per-trade state machines for the settlement protocols. Each protocol
//! variant declares transition tables per trade role; the engine runs the
//! table's tasks, and the trade service serializes events per trade and
//! moves finished trades into the closed-trade history.

pub mod engine;
pub mod event;
pub mod history;
pub mod message;
pub mod messenger;
pub mod model;
pub mod service;
pub mod state;
pub mod table;
pub mod task;
pub mod wallet;

pub use engine::{Applied, TradeEngine};
pub use event::{ActionKind, EventKey, TradeEvent, UserAction};
pub use history::{ClosedTrade, TradeHistory, HISTORY_SNAPSHOT};
pub use message::{
    EscrowlessMessage, MessageKind, MuSigMessage, MultiSigMessage, PartialSignatureSet,
    SignedTradeMessage, SwapMessage, TradeMessage, TradePayload,
};
pub use messenger::{NetworkMessenger, RecordingMessenger, TradeMessenger};
pub use model::{EscrowlessModel, MuSigModel, MultiSigModel, ProtocolModel, SwapModel, Trade};
pub use service::{TradeConfig, TradeService, TradeUpdate};
pub use state::{FailureReason, TradeState};
pub use table::{Transition, TransitionTable};
pub use task::{ProcessTask, SendTask, Task};
pub use wallet::{MockWallet, SettlementWallet};

use agora_contract::{ContractError, TradeId};
use agora_storage::StorageError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TradeError {
    #[error("Unknown trade {0}")]
    UnknownTrade(TradeId),

    #[error("Trade {0} already exists")]
    AlreadyExists(TradeId),

    #[error("Trade {0} is closed")]
    TradeClosed(TradeId),

    #[error("{action} not allowed in state {state}")]
    ActionNotAllowed {
        state: TradeState,
        action: ActionKind,
    },

    #[error("Cancel not allowed in state {0}")]
    CancelNotAllowed(TradeState),

    #[error("Request rejected: {0}")]
    Rejected(FailureReason),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Cannot build {kind}: missing {field}")]
    ModelIncomplete {
        kind: MessageKind,
        field: &'static str,
    },

    #[error("Invalid transition table: {0}")]
    InvalidTable(String),

    #[error("Wallet error: {0}")]
    Wallet(String),

    #[error("Peer unreachable: {0}")]
    PeerUnreachable(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Contract error: {0}")]
    Contract(#[from] ContractError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

pub type TradeResult<T> = Result<T, TradeError>;
