//! The trade contract.
//!
//! The maker builds it from the offer and the taker's details, both
//! traders sign its SHA-256 hash, and from then on it is the reference
//! every payout is checked against. A trade locks its contract once both
//! signatures verify.

use serde::{Deserialize, Serialize};

use super::model::Side;
use crate::crypto::{sha256, sha256_hex, NodeKeypair, PublicKey, Signature};
use crate::escrow::{DepositAmounts, PayoutTerms};
use crate::network::NodeAddress;
use crate::offer::{OfferPayload, TradeAmounts};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contract {
    pub offer_id: String,
    pub trade_amount: u64,
    pub price: u64,
    pub currency_code: String,
    pub payment_method: String,
    pub maker_is_buyer: bool,
    pub maker_node: NodeAddress,
    pub maker_pub_key: PublicKey,
    pub taker_node: NodeAddress,
    pub taker_pub_key: PublicKey,
    pub arbitrator_node: NodeAddress,
    pub arbitrator_pub_key: PublicKey,
    pub maker_payout_address: String,
    pub taker_payout_address: String,
    pub buyer_security_deposit: u64,
    pub seller_security_deposit: u64,
    pub maker_fee: u64,
    pub taker_fee: u64,
    pub multisig_address: String,
}

/// Taker-side details the maker needs to draft the contract.
#[derive(Debug, Clone)]
pub struct ContractParties {
    pub taker_node: NodeAddress,
    pub taker_pub_key: PublicKey,
    pub maker_payout_address: String,
    pub taker_payout_address: String,
    pub multisig_address: String,
}

impl Contract {
    pub fn draft(offer: &OfferPayload, amounts: &TradeAmounts, parties: ContractParties) -> Self {
        Self {
            offer_id: offer.id.clone(),
            trade_amount: amounts.trade_amount,
            price: offer.price,
            currency_code: offer.currency_code.clone(),
            payment_method: offer.payment_method.clone(),
            maker_is_buyer: offer.maker_side() == Side::Buyer,
            maker_node: offer.maker_node.clone(),
            maker_pub_key: offer.maker_pub_key,
            taker_node: parties.taker_node,
            taker_pub_key: parties.taker_pub_key,
            arbitrator_node: offer.arbitrator_node.clone(),
            arbitrator_pub_key: offer.arbitrator_pub_key,
            maker_payout_address: parties.maker_payout_address,
            taker_payout_address: parties.taker_payout_address,
            buyer_security_deposit: amounts.buyer_security_deposit,
            seller_security_deposit: amounts.seller_security_deposit,
            maker_fee: amounts.maker_fee,
            taker_fee: amounts.taker_fee,
            multisig_address: parties.multisig_address,
        }
    }

    pub fn canonical_bytes(&self) -> Vec<u8> {
        // Plain structs of strings and integers always serialize.
        serde_json::to_vec(self).unwrap_or_default()
    }

    pub fn digest(&self) -> [u8; 32] {
        sha256(&self.canonical_bytes())
    }

    pub fn hash(&self) -> String {
        sha256_hex(&self.canonical_bytes())
    }

    pub fn sign(&self, keys: &NodeKeypair) -> Signature {
        keys.sign(&self.digest())
    }

    pub fn verify_signature(&self, signer: &PublicKey, signature: &Signature) -> bool {
        signer.verify(&self.digest(), signature)
    }

    pub fn buyer_payout_address(&self) -> &str {
        if self.maker_is_buyer {
            &self.maker_payout_address
        } else {
            &self.taker_payout_address
        }
    }

    pub fn seller_payout_address(&self) -> &str {
        if self.maker_is_buyer {
            &self.taker_payout_address
        } else {
            &self.maker_payout_address
        }
    }

    pub fn payout_address(&self, side: Side) -> &str {
        match side {
            Side::Buyer => self.buyer_payout_address(),
            Side::Seller => self.seller_payout_address(),
        }
    }

    pub fn buyer_pub_key(&self) -> &PublicKey {
        if self.maker_is_buyer {
            &self.maker_pub_key
        } else {
            &self.taker_pub_key
        }
    }

    pub fn seller_pub_key(&self) -> &PublicKey {
        if self.maker_is_buyer {
            &self.taker_pub_key
        } else {
            &self.maker_pub_key
        }
    }

    pub fn amounts(&self) -> TradeAmounts {
        TradeAmounts {
            trade_amount: self.trade_amount,
            buyer_security_deposit: self.buyer_security_deposit,
            seller_security_deposit: self.seller_security_deposit,
            maker_fee: self.maker_fee,
            taker_fee: self.taker_fee,
        }
    }

    /// Terms the payout verifiers check against, given the deposits that
    /// actually reached the multisig.
    pub fn payout_terms(&self, deposits: &DepositAmounts) -> Result<PayoutTerms, crate::escrow::EscrowError> {
        let (buyer_deposit, seller_deposit) = deposits.both()?;
        Ok(PayoutTerms {
            buyer_payout_address: self.buyer_payout_address().to_string(),
            seller_payout_address: self.seller_payout_address().to_string(),
            buyer_deposit,
            seller_deposit,
            trade_amount: self.trade_amount,
        })
    }

    /// Field-by-field comparison against what this party expects. Returns
    /// the name of the first field that differs.
    pub fn first_mismatch(&self, expected: &Contract) -> Option<&'static str> {
        let checks: [(&'static str, bool); 19] = [
            ("offer_id", self.offer_id == expected.offer_id),
            ("trade_amount", self.trade_amount == expected.trade_amount),
            ("price", self.price == expected.price),
            ("currency_code", self.currency_code == expected.currency_code),
            ("payment_method", self.payment_method == expected.payment_method),
            ("maker_is_buyer", self.maker_is_buyer == expected.maker_is_buyer),
            ("maker_node", self.maker_node == expected.maker_node),
            ("maker_pub_key", self.maker_pub_key == expected.maker_pub_key),
            ("taker_node", self.taker_node == expected.taker_node),
            ("taker_pub_key", self.taker_pub_key == expected.taker_pub_key),
            ("arbitrator_node", self.arbitrator_node == expected.arbitrator_node),
            ("arbitrator_pub_key", self.arbitrator_pub_key == expected.arbitrator_pub_key),
            ("maker_payout_address", self.maker_payout_address == expected.maker_payout_address),
            ("taker_payout_address", self.taker_payout_address == expected.taker_payout_address),
            ("buyer_security_deposit", self.buyer_security_deposit == expected.buyer_security_deposit),
            ("seller_security_deposit", self.seller_security_deposit == expected.seller_security_deposit),
            ("maker_fee", self.maker_fee == expected.maker_fee),
            ("taker_fee", self.taker_fee == expected.taker_fee),
            ("multisig_address", self.multisig_address == expected.multisig_address),
        ];
        checks.iter().find(|(_, ok)| !ok).map(|(name, _)| *name)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::ATOMIC_UNITS_PER_XMR as XMR;
    use crate::offer::tests::sample_payload;

    pub(crate) fn sample_contract(maker: &NodeKeypair, taker: &NodeKeypair, arb: &NodeKeypair) -> Contract {
        let offer = sample_payload(maker, arb);
        let amounts = TradeAmounts::compute(&offer, 2 * XMR).unwrap();
        Contract::draft(
            &offer,
            &amounts,
            ContractParties {
                taker_node: NodeAddress::new("taker.onion"),
                taker_pub_key: taker.public_key(),
                maker_payout_address: "maker-wallet".into(),
                taker_payout_address: "taker-wallet".into(),
                multisig_address: "mx01".into(),
            },
        )
    }

    #[test]
    fn test_signatures_bind_every_field() {
        let (maker, taker, arb) = (
            NodeKeypair::from_seed(&[1u8; 32]),
            NodeKeypair::from_seed(&[2u8; 32]),
            NodeKeypair::from_seed(&[3u8; 32]),
        );
        let contract = sample_contract(&maker, &taker, &arb);
        let sig = contract.sign(&maker);
        assert!(contract.verify_signature(&maker.public_key(), &sig));
        assert!(!contract.verify_signature(&taker.public_key(), &sig));

        let mut altered = contract.clone();
        altered.taker_payout_address = "attacker".into();
        assert!(!altered.verify_signature(&maker.public_key(), &sig));
        assert_ne!(altered.hash(), contract.hash());
        assert_eq!(altered.first_mismatch(&contract), Some("taker_payout_address"));
        assert_eq!(contract.first_mismatch(&contract.clone()), None);
    }

    #[test]
    fn test_sides_follow_offer_direction() {
        let (maker, taker, arb) = (
            NodeKeypair::from_seed(&[1u8; 32]),
            NodeKeypair::from_seed(&[2u8; 32]),
            NodeKeypair::from_seed(&[3u8; 32]),
        );
        // The sample offer sells XMR: the maker is the seller.
        let contract = sample_contract(&maker, &taker, &arb);
        assert!(!contract.maker_is_buyer);
        assert_eq!(contract.buyer_payout_address(), "taker-wallet");
        assert_eq!(contract.seller_payout_address(), "maker-wallet");
        assert_eq!(contract.seller_pub_key(), &maker.public_key());

        let mut deposits = DepositAmounts::default();
        assert!(contract.payout_terms(&deposits).is_err());
        deposits.record(Side::Buyer, 3 * XMR / 10);
        deposits.record(Side::Seller, 23 * XMR / 10);
        let terms = contract.payout_terms(&deposits).unwrap();
        assert_eq!(terms.buyer_payout_address, "taker-wallet");
        assert_eq!(terms.trade_amount, 2 * XMR);
    }
}
