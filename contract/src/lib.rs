//! Agora Contract Library
//!
//! Offers, the two-party contracts built from them, and contract signatures.

pub mod contract;
pub mod offer;
pub mod signing;

pub use contract::{Contract, Party, PartyRole, TradeId, TradeRole};
pub use offer::{Offer, OfferDirection, ProtocolType};
pub use signing::{ContractService, ContractSignatureData};

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ContractError {
    #[error("Invalid offer: {0}")]
    InvalidOffer(String),

    #[error("Invalid contract: {0}")]
    InvalidContract(String),

    #[error("Contract hash does not match signature data")]
    HashMismatch,

    #[error("Signer is not the contract's {0}")]
    SignerMismatch(PartyRole),

    #[error("Invalid contract signature")]
    InvalidSignature,

    #[error("Serialization error: {0}")]
    Serialization(String),
}

pub type ContractResult<T> = Result<T, ContractError>;
