//! Contract signatures
//!
//! A signature commits to the SHA-256 of the contract's canonical bytes. A
//! failed check is a hard verification failure and is never retried.

use crate::contract::{Contract, PartyRole};
use crate::{ContractError, ContractResult};
use agora_crypto::{hash_sha256_parts, KeyPair, PublicKey};
use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContractSignatureData {
    pub contract_hash: [u8; 32],
    pub signature: Vec<u8>,
    pub signer_pubkey: PublicKey,
}

impl ContractSignatureData {
    /// Digest of the whole signature record
    pub fn hash(&self) -> [u8; 32] {
        hash_sha256_parts(&[
            &self.contract_hash,
            &self.signature,
            self.signer_pubkey.as_bytes(),
        ])
    }
}

/// Stateless signer and verifier for contracts
#[derive(Debug, Clone, Copy, Default)]
pub struct ContractService;

impl ContractService {
    pub fn new() -> Self {
        Self
    }

    pub fn sign_contract(
        &self,
        contract: &Contract,
        keypair: &KeyPair,
    ) -> ContractResult<ContractSignatureData> {
        contract.verify()?;
        let contract_hash = contract.hash()?;
        Ok(ContractSignatureData {
            contract_hash,
            signature: keypair.sign(&contract_hash),
            signer_pubkey: keypair.public_key(),
        })
    }

    /// Checks `signature` was made over `contract` by the party in `signer_role`
    pub fn verify_signature(
        &self,
        contract: &Contract,
        signature: &ContractSignatureData,
        signer_role: PartyRole,
    ) -> ContractResult<()> {
        contract.verify()?;
        if contract.hash()? != signature.contract_hash {
            debug!(role = %signer_role, "Contract hash mismatch");
            return Err(ContractError::HashMismatch);
        }
        if contract.party(signer_role).pubkey() != &signature.signer_pubkey {
            return Err(ContractError::SignerMismatch(signer_role));
        }
        signature
            .signer_pubkey
            .verify(&signature.contract_hash, &signature.signature)
            .map_err(|_| ContractError::InvalidSignature)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::offer::{Offer, OfferDirection, ProtocolType};
    use agora_core::{Address, NetworkId};

    fn setup() -> (KeyPair, KeyPair, Contract) {
        let maker = KeyPair::generate();
        let taker = KeyPair::generate();
        let offer = Offer {
            id: "offer-7".into(),
            maker: NetworkId::with_clear_address(maker.public_key(), Address::localhost(1))
                .unwrap(),
            direction: OfferDirection::Buy,
            protocol: ProtocolType::Escrowless,
            base_amount: 10_000,
            quote_amount: 700,
            payment_method: "Zelle".into(),
            created_at: 1_700_000_000_000,
        };
        let taker_id =
            NetworkId::with_clear_address(taker.public_key(), Address::localhost(2)).unwrap();
        let contract = Contract::take(offer, taker_id, 1_700_000_000_500);
        (maker, taker, contract)
    }

    #[test]
    fn test_sign_and_verify() {
        let service = ContractService::new();
        let (maker, taker, contract) = setup();

        let taker_sig = service.sign_contract(&contract, &taker).unwrap();
        let maker_sig = service.sign_contract(&contract, &maker).unwrap();
        assert_eq!(taker_sig.contract_hash, maker_sig.contract_hash);

        service
            .verify_signature(&contract, &taker_sig, PartyRole::Taker)
            .unwrap();
        service
            .verify_signature(&contract, &maker_sig, PartyRole::Maker)
            .unwrap();
    }

    #[test]
    fn test_signer_must_be_recorded_party() {
        let service = ContractService::new();
        let (_, taker, contract) = setup();
        let sig = service.sign_contract(&contract, &taker).unwrap();
        assert_eq!(
            service.verify_signature(&contract, &sig, PartyRole::Maker),
            Err(ContractError::SignerMismatch(PartyRole::Maker))
        );
    }

    #[test]
    fn test_tampered_signature_or_contract() {
        let service = ContractService::new();
        let (_, taker, contract) = setup();
        let sig = service.sign_contract(&contract, &taker).unwrap();

        let mut forged = sig.clone();
        forged.signature[0] ^= 0xff;
        assert_eq!(
            service.verify_signature(&contract, &forged, PartyRole::Taker),
            Err(ContractError::InvalidSignature)
        );

        let mut changed = contract.clone();
        changed.quote_amount = 1;
        assert_eq!(
            service.verify_signature(&changed, &sig, PartyRole::Taker),
            Err(ContractError::HashMismatch)
        );
    }

    #[test]
    fn test_refuses_to_sign_invalid_contract() {
        let service = ContractService::new();
        let (_, taker, mut contract) = setup();
        contract.protocol = ProtocolType::MuSig;
        assert!(matches!(
            service.sign_contract(&contract, &taker),
            Err(ContractError::InvalidContract(_))
        ));
    }
}
