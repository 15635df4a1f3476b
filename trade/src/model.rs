//! Trade aggregate and per-protocol model data

use crate::message::{MessageKind, PartialSignatureSet};
use crate::state::TradeState;
use agora_contract::{
    Contract, ContractSignatureData, Party, PartyRole, ProtocolType, TradeId, TradeRole,
};
use agora_core::{SignedMessage, SpendableOutput, TxId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EscrowlessModel {
    /// Seller's payment account, sent to the buyer
    pub account_data: Option<String>,
    /// Where the buyer wants the settlement sent
    pub settlement_address: Option<String>,
    pub settlement_txid: Option<TxId>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MuSigModel {
    pub my_key_share: Option<Vec<u8>>,
    pub my_nonce_share: Option<Vec<u8>>,
    pub peer_key_share: Option<Vec<u8>>,
    pub peer_nonce_share: Option<Vec<u8>>,
    pub my_signatures: Option<PartialSignatureSet>,
    pub peer_deposit_signature: Option<Vec<u8>>,
    pub peer_payout_signature: Option<Vec<u8>>,
    /// Buyer learns this from the seller only once the payment is received
    pub peer_swap_signature: Option<Vec<u8>>,
    pub deposit_txid: Option<TxId>,
    pub payout_txid: Option<TxId>,
    pub peer_output_key_share: Option<Vec<u8>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MultiSigModel {
    pub my_inputs: Vec<SpendableOutput>,
    pub peer_inputs: Vec<SpendableOutput>,
    pub my_key_share: Option<Vec<u8>>,
    pub peer_key_share: Option<Vec<u8>>,
    pub deposit_signature: Option<SignedMessage>,
    pub deposit_txid: Option<TxId>,
    pub payout_signature: Option<SignedMessage>,
    pub payout_txid: Option<TxId>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwapModel {
    /// Known to the buyer from the start; to the seller once revealed
    pub preimage: Option<[u8; 32]>,
    pub payment_hash: Option<[u8; 32]>,
    pub htlc_txid: Option<TxId>,
}

/// Protocol-specific mutable state of one trade
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProtocolModel {
    Escrowless(EscrowlessModel),
    MuSig(MuSigModel),
    MultiSig(MultiSigModel),
    Swap(SwapModel),
}

impl ProtocolModel {
    pub fn new(protocol: ProtocolType) -> Self {
        match protocol {
            ProtocolType::Escrowless => ProtocolModel::Escrowless(EscrowlessModel::default()),
            ProtocolType::MuSig => ProtocolModel::MuSig(MuSigModel::default()),
            ProtocolType::MultiSig => ProtocolModel::MultiSig(MultiSigModel::default()),
            ProtocolType::SubmarineSwap => ProtocolModel::Swap(SwapModel::default()),
        }
    }

    pub fn protocol(&self) -> ProtocolType {
        match self {
            ProtocolModel::Escrowless(_) => ProtocolType::Escrowless,
            ProtocolModel::MuSig(_) => ProtocolType::MuSig,
            ProtocolModel::MultiSig(_) => ProtocolType::MultiSig,
            ProtocolModel::Swap(_) => ProtocolType::SubmarineSwap,
        }
    }
}

/// One side's view of a trade
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trade {
    pub id: TradeId,
    pub contract: Contract,
    pub role: TradeRole,
    pub state: TradeState,
    pub model: ProtocolModel,
    pub taker_signature: Option<ContractSignatureData>,
    pub maker_signature: Option<ContractSignatureData>,
    /// Sequence of the next message we send
    pub next_sequence: u64,
    /// Inbound `(kind, sequence)` pairs already applied
    pub seen: BTreeSet<(MessageKind, u64)>,
}

impl Trade {
    pub fn new(contract: Contract, party_role: PartyRole) -> Self {
        let role = contract.trade_role(party_role);
        Self {
            id: contract.trade_id(),
            model: ProtocolModel::new(contract.protocol),
            contract,
            role,
            state: TradeState::Init,
            taker_signature: None,
            maker_signature: None,
            next_sequence: 0,
            seen: BTreeSet::new(),
        }
    }

    pub fn protocol(&self) -> ProtocolType {
        self.contract.protocol
    }

    pub fn me(&self) -> &Party {
        self.contract.party(self.role.party_role())
    }

    pub fn counterparty(&self) -> &Party {
        self.contract.counterparty(self.role.party_role())
    }

    pub fn is_final(&self) -> bool {
        self.state.is_final()
    }

    pub fn has_seen(&self, kind: MessageKind, sequence: u64) -> bool {
        self.seen.contains(&(kind, sequence))
    }
}
