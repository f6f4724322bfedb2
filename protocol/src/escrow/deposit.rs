//! Deposit amounts and deposit transaction checks.
//!
//! Each trader sends one deposit transaction into the multisig. The buyer
//! deposits its security deposit. The seller deposits its security deposit
//! plus the trade amount, which the payout later hands to the buyer.

use serde::{Deserialize, Serialize};

use super::tx::{ReserveTx, TxDescription};
use super::EscrowError;
use crate::trade::Side;

/// What `side` must pay into the multisig.
pub fn required_deposit(
    side: Side,
    security_deposit: u64,
    trade_amount: u64,
) -> Result<u64, EscrowError> {
    match side {
        Side::Buyer => Ok(security_deposit),
        Side::Seller => security_deposit
            .checked_add(trade_amount)
            .ok_or(EscrowError::Arithmetic("seller deposit")),
    }
}

/// Checks a trader's deposit transaction and returns the amount it pays
/// into the multisig.
pub fn verify_deposit_tx(
    tx: &TxDescription,
    claimed_hash: &str,
    multisig_address: &str,
    expected_deposit: u64,
    trade_fee: u64,
    fee_address: &str,
) -> Result<u64, EscrowError> {
    if tx.hash != claimed_hash {
        return Err(EscrowError::HashMismatch {
            what: "deposit tx",
            expected: claimed_hash.to_string(),
            actual: tx.hash.clone(),
        });
    }

    let deposited = tx.amount_to(multisig_address);
    if deposited != expected_deposit {
        return Err(EscrowError::DepositAmountMismatch {
            expected: expected_deposit,
            actual: deposited,
        });
    }

    let fee_paid = tx.amount_to(fee_address);
    if fee_paid < trade_fee {
        return Err(EscrowError::InsufficientOutput {
            what: "trade fee",
            address: fee_address.to_string(),
            expected: trade_fee,
            actual: fee_paid,
        });
    }

    Ok(deposited)
}

/// Checks that a deposit spends exactly the outputs its reserve proof
/// froze. Anything else means the reserved coins may still be spent twice.
pub fn verify_deposit_inputs(tx: &TxDescription, reserve: &ReserveTx) -> Result<(), EscrowError> {
    if tx.key_images.is_empty() {
        return Err(EscrowError::MissingKeyImages);
    }
    let mut spent = tx.key_images.clone();
    let mut reserved = reserve.key_images.clone();
    spent.sort();
    reserved.sort();
    if spent != reserved {
        return Err(EscrowError::KeyImageMismatch);
    }
    Ok(())
}

/// Amounts that actually reached the multisig, per side.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepositAmounts {
    pub buyer: Option<u64>,
    pub seller: Option<u64>,
}

impl DepositAmounts {
    pub fn record(&mut self, side: Side, amount: u64) {
        match side {
            Side::Buyer => self.buyer = Some(amount),
            Side::Seller => self.seller = Some(amount),
        }
    }

    pub fn get(&self, side: Side) -> Option<u64> {
        match side {
            Side::Buyer => self.buyer,
            Side::Seller => self.seller,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.buyer.is_some() && self.seller.is_some()
    }

    /// `(buyer, seller)`, or the first side still missing.
    pub fn both(&self) -> Result<(u64, u64), EscrowError> {
        let buyer = self.buyer.ok_or(EscrowError::MissingDeposit(Side::Buyer))?;
        let seller = self.seller.ok_or(EscrowError::MissingDeposit(Side::Seller))?;
        Ok((buyer, seller))
    }

    pub fn total(&self) -> Result<u64, EscrowError> {
        let (buyer, seller) = self.both()?;
        buyer
            .checked_add(seller)
            .ok_or(EscrowError::Arithmetic("deposit total"))
    }
}
