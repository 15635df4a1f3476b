//! Opaque wallet value objects
//!
//! Settlement tasks pass these around without interpreting them; the wallet
//! that produced them owns their meaning.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Id of a transaction broadcast by the wallet
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TxId(pub String);

impl TxId {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for TxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A message signed by a wallet key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedMessage {
    pub message: Vec<u8>,
    pub signature: Vec<u8>,
}

/// Output the wallet can contribute to a deposit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpendableOutput {
    pub txid: TxId,
    pub vout: u32,
    pub amount: u64,
}
