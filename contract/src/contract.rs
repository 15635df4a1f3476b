//! Two-party trade contracts

use crate::offer::{Offer, OfferDirection, ProtocolType};
use crate::{ContractError, ContractResult};
use agora_core::NetworkId;
use agora_crypto::{hash_sha256, hash_sha256_parts, PublicKey};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PartyRole {
    Maker,
    Taker,
}

impl fmt::Display for PartyRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PartyRole::Maker => write!(f, "maker"),
            PartyRole::Taker => write!(f, "taker"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Party {
    pub role: PartyRole,
    pub network_id: NetworkId,
}

impl Party {
    pub fn new(role: PartyRole, network_id: NetworkId) -> Self {
        Self { role, network_id }
    }

    pub fn pubkey(&self) -> &PublicKey {
        &self.network_id.pubkey
    }
}

/// Immutable agreement between the maker of an offer and its taker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contract {
    pub offer: Offer,
    pub maker: Party,
    pub taker: Party,
    pub protocol: ProtocolType,
    /// Unix milliseconds at which the taker took the offer
    pub take_offer_date: i64,
    pub base_amount: u64,
    pub quote_amount: u64,
}

impl Contract {
    /// Contract for `taker` taking `offer` in full
    pub fn take(offer: Offer, taker: NetworkId, take_offer_date: i64) -> Self {
        Self {
            maker: Party::new(PartyRole::Maker, offer.maker.clone()),
            taker: Party::new(PartyRole::Taker, taker),
            protocol: offer.protocol,
            take_offer_date,
            base_amount: offer.base_amount,
            quote_amount: offer.quote_amount,
            offer,
        }
    }

    /// Checks every field a signature will commit to
    pub fn verify(&self) -> ContractResult<()> {
        self.offer
            .validate()
            .map_err(|e| ContractError::InvalidContract(e.to_string()))?;

        for party in [&self.maker, &self.taker] {
            party
                .network_id
                .validate()
                .map_err(|e| ContractError::InvalidContract(format!("{}: {}", party.role, e)))?;
        }
        if self.maker.role != PartyRole::Maker || self.taker.role != PartyRole::Taker {
            return Err(ContractError::InvalidContract("party roles swapped".into()));
        }
        if self.maker.network_id != self.offer.maker {
            return Err(ContractError::InvalidContract(
                "maker is not the offer's maker".into(),
            ));
        }
        if self.maker.pubkey() == self.taker.pubkey() {
            return Err(ContractError::InvalidContract(
                "maker cannot take own offer".into(),
            ));
        }
        if self.protocol != self.offer.protocol {
            return Err(ContractError::InvalidContract(format!(
                "protocol {} differs from offer protocol {}",
                self.protocol, self.offer.protocol
            )));
        }
        if self.base_amount == 0 || self.quote_amount == 0 {
            return Err(ContractError::InvalidContract("zero amount".into()));
        }
        if self.take_offer_date <= 0 {
            return Err(ContractError::InvalidContract("missing take offer date".into()));
        }
        Ok(())
    }

    pub fn canonical_bytes(&self) -> ContractResult<Vec<u8>> {
        bincode::serialize(self).map_err(|e| ContractError::Serialization(e.to_string()))
    }

    pub fn hash(&self) -> ContractResult<[u8; 32]> {
        Ok(hash_sha256(&self.canonical_bytes()?))
    }

    pub fn party(&self, role: PartyRole) -> &Party {
        match role {
            PartyRole::Maker => &self.maker,
            PartyRole::Taker => &self.taker,
        }
    }

    /// The other side of `role`
    pub fn counterparty(&self, role: PartyRole) -> &Party {
        match role {
            PartyRole::Maker => &self.taker,
            PartyRole::Taker => &self.maker,
        }
    }

    pub fn trade_id(&self) -> TradeId {
        TradeId::derive(&self.offer.id, self.taker.pubkey(), self.take_offer_date)
    }

    pub fn trade_role(&self, role: PartyRole) -> TradeRole {
        TradeRole::from_direction(self.offer.direction, role)
    }
}

/// Local role in a trade: buyer or seller, combined with maker or taker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TradeRole {
    BuyerAsTaker,
    BuyerAsMaker,
    SellerAsTaker,
    SellerAsMaker,
}

impl TradeRole {
    pub const ALL: [TradeRole; 4] = [
        TradeRole::BuyerAsTaker,
        TradeRole::BuyerAsMaker,
        TradeRole::SellerAsTaker,
        TradeRole::SellerAsMaker,
    ];

    /// The offer direction is the maker's side; the taker mirrors it
    pub fn from_direction(direction: OfferDirection, role: PartyRole) -> Self {
        let side = match role {
            PartyRole::Maker => direction,
            PartyRole::Taker => direction.mirror(),
        };
        match (side, role) {
            (OfferDirection::Buy, PartyRole::Taker) => TradeRole::BuyerAsTaker,
            (OfferDirection::Buy, PartyRole::Maker) => TradeRole::BuyerAsMaker,
            (OfferDirection::Sell, PartyRole::Taker) => TradeRole::SellerAsTaker,
            (OfferDirection::Sell, PartyRole::Maker) => TradeRole::SellerAsMaker,
        }
    }

    pub fn is_buyer(&self) -> bool {
        matches!(self, TradeRole::BuyerAsTaker | TradeRole::BuyerAsMaker)
    }

    pub fn is_seller(&self) -> bool {
        !self.is_buyer()
    }

    pub fn is_maker(&self) -> bool {
        matches!(self, TradeRole::BuyerAsMaker | TradeRole::SellerAsMaker)
    }

    pub fn is_taker(&self) -> bool {
        !self.is_maker()
    }

    pub fn party_role(&self) -> PartyRole {
        if self.is_maker() {
            PartyRole::Maker
        } else {
            PartyRole::Taker
        }
    }
}

impl fmt::Display for TradeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TradeRole::BuyerAsTaker => "buyer-as-taker",
            TradeRole::BuyerAsMaker => "buyer-as-maker",
            TradeRole::SellerAsTaker => "seller-as-taker",
            TradeRole::SellerAsMaker => "seller-as-maker",
        };
        write!(f, "{}", name)
    }
}

/// Deterministic trade id both parties derive from the contract
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TradeId(pub Uuid);

impl TradeId {
    pub fn derive(offer_id: &str, taker: &PublicKey, take_offer_date: i64) -> Self {
        let taker_hash = taker.hash();
        let digest = hash_sha256_parts(&[
            offer_id.as_bytes(),
            &taker_hash,
            &take_offer_date.to_be_bytes(),
        ]);
        TradeId(Uuid::new_v5(&Uuid::NAMESPACE_OID, &digest))
    }
}

impl fmt::Display for TradeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agora_core::Address;
    use agora_crypto::KeyPair;

    fn network_id(keypair: &KeyPair, port: u16) -> NetworkId {
        NetworkId::with_clear_address(keypair.public_key(), Address::localhost(port)).unwrap()
    }

    fn contract() -> Contract {
        let maker = KeyPair::from_seed([1u8; 32]);
        let taker = KeyPair::from_seed([2u8; 32]);
        let offer = Offer {
            id: "offer-1".into(),
            maker: network_id(&maker, 1),
            direction: OfferDirection::Sell,
            protocol: ProtocolType::MuSig,
            base_amount: 100_000,
            quote_amount: 5_000,
            payment_method: "SEPA".into(),
            created_at: 1_700_000_000_000,
        };
        Contract::take(offer, network_id(&taker, 2), 1_700_000_100_000)
    }

    #[test]
    fn test_verify_accepts_taken_offer() {
        assert!(contract().verify().is_ok());
    }

    #[test]
    fn test_verify_rejects_inconsistent_fields() {
        let mut c = contract();
        c.protocol = ProtocolType::Escrowless;
        assert!(matches!(c.verify(), Err(ContractError::InvalidContract(_))));

        let mut c = contract();
        c.maker.network_id = c.taker.network_id.clone();
        assert!(c.verify().is_err());

        let mut c = contract();
        c.taker.network_id.addresses.clear();
        assert!(c.verify().is_err());

        let mut c = contract();
        c.base_amount = 0;
        assert!(c.verify().is_err());
    }

    #[test]
    fn test_hash_is_stable_and_sensitive() {
        let c = contract();
        assert_eq!(c.hash().unwrap(), contract().hash().unwrap());

        let mut other = contract();
        other.quote_amount += 1;
        assert_ne!(c.hash().unwrap(), other.hash().unwrap());
    }

    #[test]
    fn test_trade_id_is_deterministic() {
        let c = contract();
        assert_eq!(c.trade_id(), contract().trade_id());

        let mut later = contract();
        later.take_offer_date += 1;
        assert_ne!(c.trade_id(), later.trade_id());
    }

    #[test]
    fn test_trade_roles() {
        let c = contract();
        // maker sells, so the taker buys
        assert_eq!(c.trade_role(PartyRole::Maker), TradeRole::SellerAsMaker);
        assert_eq!(c.trade_role(PartyRole::Taker), TradeRole::BuyerAsTaker);

        assert_eq!(
            TradeRole::from_direction(OfferDirection::Buy, PartyRole::Taker),
            TradeRole::SellerAsTaker
        );
        assert!(TradeRole::BuyerAsMaker.is_buyer());
        assert!(TradeRole::BuyerAsMaker.is_maker());
        assert_eq!(TradeRole::SellerAsTaker.party_role(), PartyRole::Taker);
    }
}
