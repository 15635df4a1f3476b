//! Offers published to the data store

use crate::{ContractError, ContractResult};
use agora_core::NetworkId;
use agora_storage::{DataType, SignedRecord, StorageKey};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Settlement protocol a trade runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ProtocolType {
    /// Fiat payment with no on-chain escrow
    Escrowless,
    MuSig,
    MultiSig,
    SubmarineSwap,
}

impl fmt::Display for ProtocolType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProtocolType::Escrowless => "escrowless",
            ProtocolType::MuSig => "musig",
            ProtocolType::MultiSig => "multisig",
            ProtocolType::SubmarineSwap => "submarine-swap",
        };
        write!(f, "{}", name)
    }
}

/// Side of the trade from the maker's point of view
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OfferDirection {
    Buy,
    Sell,
}

impl OfferDirection {
    pub fn mirror(&self) -> Self {
        match self {
            OfferDirection::Buy => OfferDirection::Sell,
            OfferDirection::Sell => OfferDirection::Buy,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Offer {
    pub id: String,
    pub maker: NetworkId,
    pub direction: OfferDirection,
    pub protocol: ProtocolType,
    /// Base asset amount in its smallest unit
    pub base_amount: u64,
    /// Quote asset amount in its smallest unit
    pub quote_amount: u64,
    pub payment_method: String,
    /// Unix milliseconds
    pub created_at: i64,
}

impl Offer {
    /// Data store key this offer is published under
    pub fn storage_key(&self) -> StorageKey {
        StorageKey::derive(DataType::Offer, &self.maker.pubkey, &self.id)
    }

    pub fn to_record_body(&self) -> ContractResult<Vec<u8>> {
        bincode::serialize(self).map_err(|e| ContractError::Serialization(e.to_string()))
    }

    pub fn from_record_body(body: &[u8]) -> ContractResult<Self> {
        bincode::deserialize(body).map_err(|e| ContractError::Serialization(e.to_string()))
    }

    /// Decode an offer record, checking it was published by its maker
    pub fn from_record(signed: &SignedRecord) -> ContractResult<Self> {
        let record = &signed.record;
        if record.data_type != DataType::Offer {
            return Err(ContractError::InvalidOffer(format!(
                "record holds {} data",
                record.data_type
            )));
        }
        let offer = Self::from_record_body(&record.body)?;
        if offer.maker.pubkey != record.author || offer.id != record.id {
            return Err(ContractError::InvalidOffer(
                "record author or id differs from offer".into(),
            ));
        }
        Ok(offer)
    }

    pub fn validate(&self) -> ContractResult<()> {
        if self.id.is_empty() {
            return Err(ContractError::InvalidOffer("empty offer id".into()));
        }
        self.maker
            .validate()
            .map_err(|e| ContractError::InvalidOffer(e.to_string()))?;
        if self.base_amount == 0 || self.quote_amount == 0 {
            return Err(ContractError::InvalidOffer("zero amount".into()));
        }
        if self.payment_method.is_empty() {
            return Err(ContractError::InvalidOffer("missing payment method".into()));
        }
        Ok(())
    }
}
