//! Trade messages
//!
//! Every protocol variant has its own payload schema. Messages are signed by
//! the sender and travel as direct network messages on the trade channel.

use crate::{TradeError, TradeResult};
use agora_contract::{Contract, ContractSignatureData, ProtocolType, TradeId};
use agora_core::{NetworkId, SignedMessage, SpendableOutput, TxId};
use agora_crypto::KeyPair;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Escrowless settlement: fiat against a direct on-chain transfer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EscrowlessMessage {
    /// Seller's payment account
    AccountData { account_data: String },
    /// Buyer started the fiat payment
    PaymentSent { settlement_address: String },
    PaymentReceived,
    SettlementSent { txid: TxId },
    SettlementReceived,
}

/// Signatures one party contributes to the MuSig deposit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartialSignatureSet {
    pub deposit: Vec<u8>,
    pub payout: Vec<u8>,
    pub swap: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MuSigMessage {
    KeyShares {
        key_share: Vec<u8>,
        nonce_share: Vec<u8>,
    },
    /// The seller withholds its swap signature until the fiat arrives
    PartialSignatures {
        deposit_signature: Vec<u8>,
        payout_signature: Vec<u8>,
        swap_signature: Option<Vec<u8>>,
    },
    DepositPublished { txid: TxId },
    PaymentInitiated,
    /// Seller confirms receipt and releases the withheld swap signature
    PaymentReceived { swap_signature: Vec<u8> },
    CloseTrade { output_key_share: Vec<u8> },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MultiSigMessage {
    TakerInputs {
        inputs: Vec<SpendableOutput>,
        key_share: Vec<u8>,
    },
    DepositSignature {
        inputs: Vec<SpendableOutput>,
        key_share: Vec<u8>,
        signature: SignedMessage,
    },
    DepositPublished { txid: TxId },
    PaymentSent { payout_signature: SignedMessage },
    PayoutPublished { txid: TxId },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SwapMessage {
    Invoice { payment_hash: [u8; 32], amount: u64 },
    HtlcLocked { txid: TxId },
    Preimage { preimage: [u8; 32] },
    Completed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TradePayload {
    TakeOfferRequest {
        contract: Contract,
        taker_signature: ContractSignatureData,
    },
    TakeOfferResponse {
        maker_signature: ContractSignatureData,
    },
    CancelTrade {
        reason: String,
    },
    Escrowless(EscrowlessMessage),
    MuSig(MuSigMessage),
    MultiSig(MultiSigMessage),
    Swap(SwapMessage),
}

/// Payload type tag, used for transition lookup and deduplication
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum MessageKind {
    TakeOfferRequest,
    TakeOfferResponse,
    CancelTrade,

    EscrowlessAccountData,
    EscrowlessPaymentSent,
    EscrowlessPaymentReceived,
    EscrowlessSettlementSent,
    EscrowlessSettlementReceived,

    MuSigKeyShares,
    MuSigPartialSignatures,
    MuSigDepositPublished,
    MuSigPaymentInitiated,
    MuSigPaymentReceived,
    MuSigCloseTrade,

    MultiSigTakerInputs,
    MultiSigDepositSignature,
    MultiSigDepositPublished,
    MultiSigPaymentSent,
    MultiSigPayoutPublished,

    SwapInvoice,
    SwapHtlcLocked,
    SwapPreimage,
    SwapCompleted,
}

impl MessageKind {
    /// Protocol whose schema defines this kind; `None` for the shared kinds
    pub fn protocol(&self) -> Option<ProtocolType> {
        use MessageKind::*;
        match self {
            TakeOfferRequest | TakeOfferResponse | CancelTrade => None,
            EscrowlessAccountData
            | EscrowlessPaymentSent
            | EscrowlessPaymentReceived
            | EscrowlessSettlementSent
            | EscrowlessSettlementReceived => Some(ProtocolType::Escrowless),
            MuSigKeyShares
            | MuSigPartialSignatures
            | MuSigDepositPublished
            | MuSigPaymentInitiated
            | MuSigPaymentReceived
            | MuSigCloseTrade => Some(ProtocolType::MuSig),
            MultiSigTakerInputs
            | MultiSigDepositSignature
            | MultiSigDepositPublished
            | MultiSigPaymentSent
            | MultiSigPayoutPublished => Some(ProtocolType::MultiSig),
            SwapInvoice | SwapHtlcLocked | SwapPreimage | SwapCompleted => {
                Some(ProtocolType::SubmarineSwap)
            }
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl TradePayload {
    pub fn kind(&self) -> MessageKind {
        match self {
            TradePayload::TakeOfferRequest { .. } => MessageKind::TakeOfferRequest,
            TradePayload::TakeOfferResponse { .. } => MessageKind::TakeOfferResponse,
            TradePayload::CancelTrade { .. } => MessageKind::CancelTrade,
            TradePayload::Escrowless(m) => match m {
                EscrowlessMessage::AccountData { .. } => MessageKind::EscrowlessAccountData,
                EscrowlessMessage::PaymentSent { .. } => MessageKind::EscrowlessPaymentSent,
                EscrowlessMessage::PaymentReceived => MessageKind::EscrowlessPaymentReceived,
                EscrowlessMessage::SettlementSent { .. } => MessageKind::EscrowlessSettlementSent,
                EscrowlessMessage::SettlementReceived => MessageKind::EscrowlessSettlementReceived,
            },
            TradePayload::MuSig(m) => match m {
                MuSigMessage::KeyShares { .. } => MessageKind::MuSigKeyShares,
                MuSigMessage::PartialSignatures { .. } => MessageKind::MuSigPartialSignatures,
                MuSigMessage::DepositPublished { .. } => MessageKind::MuSigDepositPublished,
                MuSigMessage::PaymentInitiated => MessageKind::MuSigPaymentInitiated,
                MuSigMessage::PaymentReceived { .. } => MessageKind::MuSigPaymentReceived,
                MuSigMessage::CloseTrade { .. } => MessageKind::MuSigCloseTrade,
            },
            TradePayload::MultiSig(m) => match m {
                MultiSigMessage::TakerInputs { .. } => MessageKind::MultiSigTakerInputs,
                MultiSigMessage::DepositSignature { .. } => MessageKind::MultiSigDepositSignature,
                MultiSigMessage::DepositPublished { .. } => MessageKind::MultiSigDepositPublished,
                MultiSigMessage::PaymentSent { .. } => MessageKind::MultiSigPaymentSent,
                MultiSigMessage::PayoutPublished { .. } => MessageKind::MultiSigPayoutPublished,
            },
            TradePayload::Swap(m) => match m {
                SwapMessage::Invoice { .. } => MessageKind::SwapInvoice,
                SwapMessage::HtlcLocked { .. } => MessageKind::SwapHtlcLocked,
                SwapMessage::Preimage { .. } => MessageKind::SwapPreimage,
                SwapMessage::Completed => MessageKind::SwapCompleted,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TradeMessage {
    pub trade_id: TradeId,
    pub protocol: ProtocolType,
    pub sender: NetworkId,
    pub receiver: NetworkId,
    /// Position in the sender's message stream for this trade
    pub sequence: u64,
    pub payload: TradePayload,
}

impl TradeMessage {
    pub fn kind(&self) -> MessageKind {
        self.payload.kind()
    }

    fn signing_bytes(&self) -> TradeResult<Vec<u8>> {
        bincode::serialize(self).map_err(|e| TradeError::Serialization(e.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedTradeMessage {
    pub message: TradeMessage,
    pub signature: Vec<u8>,
}

impl SignedTradeMessage {
    pub fn sign(message: TradeMessage, keypair: &KeyPair) -> TradeResult<Self> {
        if message.sender.pubkey != keypair.public_key() {
            return Err(TradeError::InvalidInput(
                "sender key does not match signing key".into(),
            ));
        }
        let signature = keypair.sign(&message.signing_bytes()?);
        Ok(Self { message, signature })
    }

    /// Checks the signature against the sender's key
    pub fn verify(&self) -> bool {
        match self.message.signing_bytes() {
            Ok(bytes) => self
                .message
                .sender
                .pubkey
                .verify(&bytes, &self.signature)
                .is_ok(),
            Err(_) => false,
        }
    }

    pub fn kind(&self) -> MessageKind {
        self.message.kind()
    }

    pub fn trade_id(&self) -> TradeId {
        self.message.trade_id
    }

    pub fn serialize(&self) -> TradeResult<Vec<u8>> {
        bincode::serialize(self).map_err(|e| TradeError::Serialization(e.to_string()))
    }

    pub fn deserialize(bytes: &[u8]) -> TradeResult<Self> {
        bincode::deserialize(bytes).map_err(|e| TradeError::Serialization(e.to_string()))
    }
}
