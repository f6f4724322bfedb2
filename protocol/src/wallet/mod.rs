//! # Wallet Seam
//!
//! The settlement core never holds Monero keys. Everything that touches the
//! chain (listing outputs, freezing them, building, signing and relaying
//! transactions, the multisig dance) goes through [`XmrWallet`].
//!
//! ## Multisig lifecycle per trade
//!
//! ```text
//!  prepare_multisig ─▶ exchange prepared hex ─▶ make_multisig ─▶ address
//!          (each party)                         (all three agree)
//!
//!  export_multisig_hex ─▶ peer import_multisig_hex ─▶ sign_multisig_tx
//! ```
//!
//! A production node implements the trait over `monero-wallet-rpc`;
//! [`simulated`] provides a deterministic in-memory ledger for tests and
//! the node sandbox.

pub mod simulated;

use async_trait::async_trait;
use thiserror::Error;

use crate::escrow::tx::{BuiltTx, Destination, ReserveTx, TxDescription, WalletOutput};

pub use simulated::{SimulatedChain, SimulatedWallet};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum WalletError {
    #[error("insufficient unlocked funds: need {required}, have {available}")]
    InsufficientFunds { required: u64, available: u64 },

    #[error("unknown output {0}")]
    UnknownOutput(String),

    #[error("output {0} is already spent")]
    OutputSpent(String),

    #[error("malformed transaction: {0}")]
    MalformedTx(String),

    #[error("multisig wallet {0} is not ready")]
    MultisigNotReady(String),

    #[error("multisig wallet {0} has not imported peer state")]
    MultisigNotSynced(String),

    #[error("not enough signatures: have {have}, need {need}")]
    InsufficientSignatures { have: usize, need: usize },

    #[error("amount arithmetic overflow")]
    Overflow,

    #[error("wallet rpc: {0}")]
    Rpc(String),
}

/// Everything the trade protocol needs from a Monero wallet.
///
/// `wallet_id` names the per-trade multisig wallet; implementations keep one
/// multisig session per id.
#[async_trait]
pub trait XmrWallet: Send + Sync {
    /// The wallet's own receiving address, used as payout address.
    fn primary_address(&self) -> String;

    async fn unspent_outputs(&self) -> Result<Vec<WalletOutput>, WalletError>;

    async fn freeze_outputs(&self, key_images: &[String]) -> Result<(), WalletError>;

    async fn thaw_outputs(&self, key_images: &[String]) -> Result<(), WalletError>;

    /// Builds (but does not relay) a transaction spending `inputs` that pays
    /// `trade_fee` to `fee_address` and returns `reserved_amount` to us.
    async fn create_reserve_tx(
        &self,
        inputs: &[String],
        reserved_amount: u64,
        trade_fee: u64,
        fee_address: &str,
    ) -> Result<ReserveTx, WalletError>;

    /// Builds the deposit: `deposit` to the multisig, `trade_fee` to the fee
    /// address, remainder back to us.
    async fn create_deposit_tx(
        &self,
        inputs: &[String],
        multisig_address: &str,
        deposit: u64,
        trade_fee: u64,
        fee_address: &str,
    ) -> Result<BuiltTx, WalletError>;

    async fn describe_tx(&self, tx_hex: &str) -> Result<TxDescription, WalletError>;

    /// Relays a fully signed transaction; returns its hash. Relaying a
    /// transaction that is already on chain returns the same hash.
    async fn submit_tx(&self, tx_hex: &str) -> Result<String, WalletError>;

    /// `None` if unknown, `Some(0)` if in the pool.
    async fn tx_confirmations(&self, tx_hash: &str) -> Result<Option<u64>, WalletError>;

    async fn prepare_multisig(&self, wallet_id: &str) -> Result<String, WalletError>;

    /// Combines our prepared hex with the peers'; returns the shared address.
    async fn make_multisig(
        &self,
        wallet_id: &str,
        peer_hexes: &[String],
    ) -> Result<String, WalletError>;

    async fn export_multisig_hex(&self, wallet_id: &str) -> Result<String, WalletError>;

    /// Returns how many outputs the imported state covers.
    async fn import_multisig_hex(
        &self,
        wallet_id: &str,
        hexes: &[String],
    ) -> Result<usize, WalletError>;

    async fn multisig_balance(&self, wallet_id: &str) -> Result<u64, WalletError>;

    /// Creates an unsigned spend of the whole multisig balance. The network
    /// fee is split evenly across the destinations listed in `fee_from`.
    async fn create_multisig_payout(
        &self,
        wallet_id: &str,
        destinations: &[Destination],
        fee_from: &[usize],
    ) -> Result<BuiltTx, WalletError>;

    /// Adds our signature; returns the new hex.
    async fn sign_multisig_tx(&self, wallet_id: &str, tx_hex: &str)
        -> Result<String, WalletError>;

    async fn submit_multisig_tx(&self, wallet_id: &str, tx_hex: &str)
        -> Result<String, WalletError>;
}
