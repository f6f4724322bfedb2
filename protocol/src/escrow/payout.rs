//! Payout construction and verification.
//!
//! ## Cooperative payout
//!
//! The buyer proposes, the seller checks and co-signs. With `cost` being
//! the network fee plus any change left in the multisig, the split is:
//!
//! ```text
//!   buyer  = buyer_deposit  + trade_amount - cost / 2
//!   seller = seller_deposit - trade_amount - cost / 2
//! ```
//!
//! The seller's deposit already contains the trade amount, so the seller
//! walks away with its security deposit and the buyer with its security
//! deposit plus the coins it bought. Integer division; an odd cost leaves
//! one piconero as change in the multisig.
//!
//! ## Dispute payout
//!
//! The arbitrator allocates the whole multisig balance between the traders.
//! The loser pays the transaction cost, unless the loser gets nothing, in
//! which case the winner pays it.

use serde::{Deserialize, Serialize};

use super::tx::{Destination, TxDescription};
use super::EscrowError;

/// What a payout verifier needs to know about the trade.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayoutTerms {
    pub buyer_payout_address: String,
    pub seller_payout_address: String,
    /// Amount the buyer's deposit put into the multisig.
    pub buyer_deposit: u64,
    /// Amount the seller's deposit put into the multisig (trade amount
    /// included).
    pub seller_deposit: u64,
    pub trade_amount: u64,
}

/// Net amounts each trader receives, and what the transaction cost.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayoutSplit {
    pub buyer_amount: u64,
    pub seller_amount: u64,
    pub tx_cost: u64,
}

impl PayoutTerms {
    pub fn buyer_gross(&self) -> Result<u64, EscrowError> {
        self.buyer_deposit
            .checked_add(self.trade_amount)
            .ok_or(EscrowError::Arithmetic("buyer gross payout"))
    }

    pub fn seller_gross(&self) -> Result<u64, EscrowError> {
        self.seller_deposit
            .checked_sub(self.trade_amount)
            .ok_or(EscrowError::Arithmetic("seller gross payout"))
    }

    /// Expected net split for a given transaction cost.
    pub fn expected_split(&self, tx_cost: u64) -> Result<PayoutSplit, EscrowError> {
        let half = tx_cost / 2;
        Ok(PayoutSplit {
            buyer_amount: self
                .buyer_gross()?
                .checked_sub(half)
                .ok_or(EscrowError::Arithmetic("buyer net payout"))?,
            seller_amount: self
                .seller_gross()?
                .checked_sub(half)
                .ok_or(EscrowError::Arithmetic("seller net payout"))?,
            tx_cost,
        })
    }

    /// Gross destinations handed to the wallet, with the fee split across
    /// both (`fee_from = [0, 1]`).
    pub fn proposal(&self) -> Result<(Vec<Destination>, Vec<usize>), EscrowError> {
        Ok((
            vec![
                Destination::new(self.buyer_payout_address.clone(), self.buyer_gross()?),
                Destination::new(self.seller_payout_address.clone(), self.seller_gross()?),
            ],
            vec![0, 1],
        ))
    }

    fn payout_addresses(&self) -> Vec<String> {
        vec![
            self.buyer_payout_address.clone(),
            self.seller_payout_address.clone(),
        ]
    }
}

/// Runs the five cooperative payout checks, in order, and returns the
/// verified split. Only sign when this returns `Ok`.
pub fn verify_payout_tx(
    tx: &TxDescription,
    terms: &PayoutTerms,
    multisig_address: &str,
) -> Result<PayoutSplit, EscrowError> {
    // 1. Exactly the two payout addresses, in either order.
    if tx.destinations.len() != 2 {
        return Err(EscrowError::WrongDestinationCount {
            expected: 2,
            actual: tx.destinations.len(),
        });
    }
    let (buyer_out, seller_out) = match_destinations(tx, terms)?;
    let (Some(buyer_out), Some(seller_out)) = (buyer_out, seller_out) else {
        return Err(address_mismatch(tx, terms));
    };

    // 2 + 3. Change stays in the multisig, and outputs add up.
    let tx_cost = check_change_and_sum(tx, multisig_address)?;

    // 4 + 5. The split.
    let expected = terms.expected_split(tx_cost)?;
    if buyer_out != expected.buyer_amount {
        return Err(EscrowError::BuyerPayoutMismatch {
            expected: expected.buyer_amount,
            actual: buyer_out,
        });
    }
    if seller_out != expected.seller_amount {
        return Err(EscrowError::SellerPayoutMismatch {
            expected: expected.seller_amount,
            actual: seller_out,
        });
    }
    Ok(expected)
}

// ---------------------------------------------------------------------------
// Dispute payout
// ---------------------------------------------------------------------------

/// The arbitrator's decision: gross amounts summing to the multisig balance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisputeAllocation {
    pub buyer_wins: bool,
    pub buyer_gross: u64,
    pub seller_gross: u64,
}

impl DisputeAllocation {
    pub fn total(&self) -> Result<u64, EscrowError> {
        self.buyer_gross
            .checked_add(self.seller_gross)
            .ok_or(EscrowError::Arithmetic("dispute allocation total"))
    }

    /// Net amounts after the cost is charged to the loser (or, if the loser
    /// gets nothing, to the winner).
    pub fn net(&self, tx_cost: u64) -> Result<PayoutSplit, EscrowError> {
        let (mut buyer, mut seller) = (self.buyer_gross, self.seller_gross);
        let loser_is_buyer = !self.buyer_wins;
        let loser_amount = if loser_is_buyer { buyer } else { seller };
        let buyer_pays = if loser_amount > 0 {
            loser_is_buyer
        } else {
            self.buyer_wins
        };
        let payer = if buyer_pays { &mut buyer } else { &mut seller };
        *payer = payer
            .checked_sub(tx_cost)
            .ok_or(EscrowError::Arithmetic("dispute payout cost"))?;
        Ok(PayoutSplit {
            buyer_amount: buyer,
            seller_amount: seller,
            tx_cost,
        })
    }

    /// Gross destinations (zero amounts omitted) and the index that pays
    /// the fee.
    pub fn proposal(
        &self,
        terms: &PayoutTerms,
    ) -> Result<(Vec<Destination>, Vec<usize>), EscrowError> {
        let mut destinations = Vec::with_capacity(2);
        let mut payer_index = 0;
        let loser_is_buyer = !self.buyer_wins;
        let loser_amount = if loser_is_buyer {
            self.buyer_gross
        } else {
            self.seller_gross
        };
        let buyer_pays = if loser_amount > 0 {
            loser_is_buyer
        } else {
            self.buyer_wins
        };
        if self.buyer_gross > 0 {
            if buyer_pays {
                payer_index = destinations.len();
            }
            destinations.push(Destination::new(
                terms.buyer_payout_address.clone(),
                self.buyer_gross,
            ));
        }
        if self.seller_gross > 0 {
            if !buyer_pays {
                payer_index = destinations.len();
            }
            destinations.push(Destination::new(
                terms.seller_payout_address.clone(),
                self.seller_gross,
            ));
        }
        if destinations.is_empty() {
            return Err(EscrowError::Arithmetic("empty dispute allocation"));
        }
        Ok((destinations, vec![payer_index]))
    }
}

/// Checks an arbitrator-built dispute payout against the allocation and
/// the multisig balance it spends.
pub fn verify_dispute_payout_tx(
    tx: &TxDescription,
    terms: &PayoutTerms,
    allocation: &DisputeAllocation,
    multisig_balance: u64,
    multisig_address: &str,
) -> Result<PayoutSplit, EscrowError> {
    let total = allocation.total()?;
    if total != multisig_balance {
        return Err(EscrowError::BalanceMismatch {
            expected: multisig_balance,
            actual: total,
        });
    }

    let expected_count = [allocation.buyer_gross, allocation.seller_gross]
        .iter()
        .filter(|a| **a > 0)
        .count();
    if tx.destinations.len() != expected_count {
        return Err(EscrowError::WrongDestinationCount {
            expected: expected_count,
            actual: tx.destinations.len(),
        });
    }
    let (buyer_out, seller_out) = match_destinations(tx, terms)?;

    let tx_cost = check_change_and_sum(tx, multisig_address)?;
    // Destinations, fee and change together spend the whole balance.
    let paid = tx
        .destination_sum()
        .and_then(|s| s.checked_add(tx.fee))
        .and_then(|s| s.checked_add(tx.change_amount))
        .ok_or(EscrowError::Arithmetic("dispute payout sum"))?;
    if paid != multisig_balance {
        return Err(EscrowError::BalanceMismatch {
            expected: multisig_balance,
            actual: paid,
        });
    }

    let expected = allocation.net(tx_cost)?;
    let buyer_out = buyer_out.unwrap_or(0);
    let seller_out = seller_out.unwrap_or(0);
    if buyer_out != expected.buyer_amount {
        return Err(EscrowError::BuyerPayoutMismatch {
            expected: expected.buyer_amount,
            actual: buyer_out,
        });
    }
    if seller_out != expected.seller_amount {
        return Err(EscrowError::SellerPayoutMismatch {
            expected: expected.seller_amount,
            actual: seller_out,
        });
    }
    Ok(expected)
}

// ---------------------------------------------------------------------------
// Shared checks
// ---------------------------------------------------------------------------

/// Maps each destination to the buyer or seller. Any unknown address, or
/// an address paid twice, is a mismatch.
fn match_destinations(
    tx: &TxDescription,
    terms: &PayoutTerms,
) -> Result<(Option<u64>, Option<u64>), EscrowError> {
    let mut buyer = None;
    let mut seller = None;
    for dest in &tx.destinations {
        let slot = if dest.address == terms.buyer_payout_address {
            &mut buyer
        } else if dest.address == terms.seller_payout_address {
            &mut seller
        } else {
            return Err(address_mismatch(tx, terms));
        };
        if slot.replace(dest.amount).is_some() {
            return Err(address_mismatch(tx, terms));
        }
    }
    Ok((buyer, seller))
}

fn address_mismatch(tx: &TxDescription, terms: &PayoutTerms) -> EscrowError {
    EscrowError::PayoutAddressMismatch {
        expected: terms.payout_addresses(),
        actual: tx.destinations.iter().map(|d| d.address.clone()).collect(),
    }
}

/// Change rule and output-sum identity. Returns the transaction cost
/// (fee plus change).
fn check_change_and_sum(tx: &TxDescription, multisig_address: &str) -> Result<u64, EscrowError> {
    if tx.change_amount > 0 && tx.change_address.as_deref() != Some(multisig_address) {
        return Err(EscrowError::ChangeAddressMismatch {
            expected: multisig_address.to_string(),
            actual: tx.change_address.clone(),
            amount: tx.change_amount,
        });
    }

    let destinations = tx
        .destination_sum()
        .ok_or(EscrowError::Arithmetic("destination sum"))?;
    let expected_sum = destinations
        .checked_add(tx.change_amount)
        .ok_or(EscrowError::Arithmetic("output sum"))?;
    if tx.output_sum != expected_sum {
        return Err(EscrowError::OutputSumMismatch {
            output_sum: tx.output_sum,
            destinations,
            change: tx.change_amount,
        });
    }

    tx.fee
        .checked_add(tx.change_amount)
        .ok_or(EscrowError::Arithmetic("transaction cost"))
}
