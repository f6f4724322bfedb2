//! # Escrow Transaction Engine
//!
//! Builds and, above all, *checks* the three kinds of transactions a trade
//! moves money with:
//!
//! ```text
//!   reserve ──▶ deposit ──▶ payout
//!  (proof of    (funds the    (2-of-3 spend of the
//!   funds)       multisig)     whole multisig balance)
//! ```
//!
//! - [`reservation`]: freeze outputs for an offer or trade, prove it with
//!   a reserve tx, and catch key images that back two offers at once.
//! - [`deposit`]: per-trader deposit amounts and deposit tx checks.
//! - [`payout`]: the exact split of deposits, trade amount and fees,
//!   for both the cooperative and the dispute payout.
//!
//! Amounts are `u64` piconero throughout and every sum is checked.
//! Nothing here signs: callers only sign after a verifier returned `Ok`.

pub mod deposit;
pub mod payout;
pub mod reservation;
pub mod tx;

use thiserror::Error;

use crate::trade::Side;
use crate::wallet::WalletError;

pub use deposit::{required_deposit, verify_deposit_inputs, verify_deposit_tx, DepositAmounts};
pub use payout::{
    verify_dispute_payout_tx, verify_payout_tx, DisputeAllocation, PayoutSplit, PayoutTerms,
};
pub use reservation::{verify_reserve_tx, KeyImageRegistry, ReservationService};
pub use tx::{BuiltTx, Destination, ReserveTx, TxDescription, WalletOutput};

/// Everything that can be wrong with an escrow transaction.
///
/// Each payout check has its own variant so a failed verification says
/// exactly which rule was broken.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EscrowError {
    #[error("payout has {actual} destinations, expected {expected}")]
    WrongDestinationCount { expected: usize, actual: usize },

    #[error("payout destinations {actual:?} do not match payout addresses {expected:?}")]
    PayoutAddressMismatch {
        expected: Vec<String>,
        actual: Vec<String>,
    },

    #[error("change of {amount} goes to {actual:?}, expected multisig address {expected}")]
    ChangeAddressMismatch {
        expected: String,
        actual: Option<String>,
        amount: u64,
    },

    #[error("output sum {output_sum} != destinations {destinations} + change {change}")]
    OutputSumMismatch {
        output_sum: u64,
        destinations: u64,
        change: u64,
    },

    #[error("buyer payout is {actual}, expected {expected}")]
    BuyerPayoutMismatch { expected: u64, actual: u64 },

    #[error("seller payout is {actual}, expected {expected}")]
    SellerPayoutMismatch { expected: u64, actual: u64 },

    #[error("payout plus cost {actual} does not match multisig balance {expected}")]
    BalanceMismatch { expected: u64, actual: u64 },

    #[error("amount arithmetic out of range computing {0}")]
    Arithmetic(&'static str),

    #[error("{what} hash {actual} does not match claimed {expected}")]
    HashMismatch {
        what: &'static str,
        expected: String,
        actual: String,
    },

    #[error("reserve tx key images do not match the claimed set")]
    KeyImageMismatch,

    #[error("reserve tx spends no inputs")]
    MissingKeyImages,

    #[error("key image {key_image} already backs {holder}")]
    KeyImageReused { key_image: String, holder: String },

    #[error("{what}: {address} receives {actual}, expected at least {expected}")]
    InsufficientOutput {
        what: &'static str,
        address: String,
        expected: u64,
        actual: u64,
    },

    #[error("deposit pays {actual} to the multisig, expected {expected}")]
    DepositAmountMismatch { expected: u64, actual: u64 },

    #[error("no {0} deposit recorded")]
    MissingDeposit(Side),

    #[error("insufficient funds: need {required}, unfrozen {available}")]
    InsufficientFunds { required: u64, available: u64 },

    #[error("unknown reservation {0}")]
    UnknownReservation(String),

    #[error(transparent)]
    Wallet(#[from] WalletError),
}

impl EscrowError {
    /// True for failures that mean the counterparty sent something wrong,
    /// as opposed to a local shortfall or wallet hiccup.
    pub fn is_verification_failure(&self) -> bool {
        !matches!(
            self,
            EscrowError::InsufficientFunds { .. }
                | EscrowError::UnknownReservation(_)
                | EscrowError::MissingDeposit(_)
                | EscrowError::Wallet(_)
        )
    }
}
