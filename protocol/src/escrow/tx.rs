//! Transaction shapes exchanged between the wallet and the escrow engine.
//!
//! The engine never parses raw Monero transactions. It asks the wallet to
//! describe a hex blob and reasons over the [`TxDescription`] it gets back.

use serde::{Deserialize, Serialize};

/// One payment output.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Destination {
    pub address: String,
    pub amount: u64,
}

impl Destination {
    pub fn new(address: impl Into<String>, amount: u64) -> Self {
        Self {
            address: address.into(),
            amount,
        }
    }
}

/// What the wallet reports about a transaction it has decoded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxDescription {
    pub hash: String,
    pub destinations: Vec<Destination>,
    /// Address receiving change. `None` when the tx has no change output.
    pub change_address: Option<String>,
    pub change_amount: u64,
    pub fee: u64,
    /// Sum of every output, change included.
    pub output_sum: u64,
    /// Key images of the spent inputs.
    pub key_images: Vec<String>,
    /// Multisig signatures collected so far (zero for single-signer txs).
    pub signature_count: usize,
}

impl TxDescription {
    pub fn destination_sum(&self) -> Option<u64> {
        self.destinations
            .iter()
            .try_fold(0u64, |acc, d| acc.checked_add(d.amount))
    }

    pub fn amount_to(&self, address: &str) -> u64 {
        self.destinations
            .iter()
            .filter(|d| d.address == address)
            .map(|d| d.amount)
            .sum()
    }
}

/// A built transaction: hash, serialized hex and the tx private key that
/// lets a third party prove its outputs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuiltTx {
    pub hash: String,
    pub hex: String,
    pub key: String,
}

/// Proof that a trader set funds aside for an offer or trade.
///
/// The transaction spends exactly the frozen outputs. It is never broadcast
/// unless the trader misbehaves; its key images let the arbitrator detect a
/// second offer backed by the same coins.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReserveTx {
    pub hash: String,
    pub hex: String,
    pub key: String,
    pub key_images: Vec<String>,
    /// Trade fee the proof commits to.
    pub trade_fee: u64,
    /// Amount returned to the trader that backs the deposit.
    pub reserved_amount: u64,
    pub return_address: String,
}

/// A spendable wallet output as listed by the wallet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalletOutput {
    pub key_image: String,
    pub amount: u64,
    pub frozen: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_destination_sum_overflow_is_none() {
        let tx = TxDescription {
            hash: "h".into(),
            destinations: vec![Destination::new("a", u64::MAX), Destination::new("b", 1)],
            change_address: None,
            change_amount: 0,
            fee: 0,
            output_sum: 0,
            key_images: vec![],
            signature_count: 0,
        };
        assert_eq!(tx.destination_sum(), None);
    }

    #[test]
    fn test_amount_to_sums_repeated_address() {
        let tx = TxDescription {
            hash: "h".into(),
            destinations: vec![
                Destination::new("a", 5),
                Destination::new("b", 7),
                Destination::new("a", 3),
            ],
            change_address: None,
            change_amount: 0,
            fee: 0,
            output_sum: 15,
            key_images: vec![],
            signature_count: 0,
        };
        assert_eq!(tx.amount_to("a"), 8);
        assert_eq!(tx.amount_to("c"), 0);
    }
}
