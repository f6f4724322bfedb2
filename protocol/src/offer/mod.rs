//! # Offers
//!
//! Before anyone can trade, a maker publishes terms and gets them
//! co-signed by an arbitrator:
//!
//! ```text
//!   maker                                   arbitrator
//!     │ reserve funds (freeze outputs)          │
//!     │── SignOfferRequest(payload, reserve) ──▶│ verify reserve tx
//!     │                                         │ claim key images
//!     │◀── SignOfferResponse(signed offer) ─────│ sign payload hash
//!   Signed
//! ```
//!
//! The signed payload is frozen from then on. A taker checks the
//! arbitrator signature before taking, and the arbitrator checks it again
//! when the take arrives.

pub mod book;
pub mod tasks;

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::config::BPS_DENOMINATOR;
use crate::crypto::{sha256, NodeKeypair, PublicKey, Signature};
use crate::escrow::{required_deposit, EscrowError, ReserveTx};
use crate::network::NodeAddress;
use crate::trade::Side;

pub use book::OfferBook;

#[derive(Debug, Error)]
pub enum OfferError {
    #[error("amount {amount} outside offer range [{min}, {max}]")]
    AmountOutOfRange { amount: u64, min: u64, max: u64 },

    #[error("invalid offer amounts: {0}")]
    InvalidAmounts(&'static str),

    #[error("unknown offer {0}")]
    UnknownOffer(String),

    #[error("offer {id} is {state}, not available")]
    NotAvailable { id: String, state: OfferState },

    #[error("offer already exists: {0}")]
    Duplicate(String),

    #[error("arbitrator signature does not verify")]
    InvalidSignature,

    #[error("offer serialization: {0}")]
    Serialization(String),

    #[error("offer {0} does not belong to this node")]
    NotOwned(String),

    #[error("maker and arbitrator must be different nodes")]
    SelfArbitration,

    #[error("{task} failed: {error}")]
    Pipeline { task: &'static str, error: String },

    #[error(transparent)]
    Escrow(#[from] EscrowError),
}

/// What the maker does with XMR.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OfferDirection {
    Buy,
    Sell,
}

impl OfferDirection {
    pub fn maker_side(self) -> Side {
        match self {
            OfferDirection::Buy => Side::Buyer,
            OfferDirection::Sell => Side::Seller,
        }
    }
}

/// The maker's terms. Everything a taker and arbitrator need to derive the
/// same trade amounts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OfferPayload {
    pub id: String,
    pub maker_node: NodeAddress,
    pub maker_pub_key: PublicKey,
    pub arbitrator_node: NodeAddress,
    pub arbitrator_pub_key: PublicKey,
    pub direction: OfferDirection,
    /// Maximum trade amount, atomic units.
    pub amount: u64,
    pub min_amount: u64,
    /// Counter-currency minor units per XMR.
    pub price: u64,
    pub currency_code: String,
    pub payment_method: String,
    pub security_deposit_bps: u32,
    pub min_security_deposit: u64,
    pub maker_fee_bps: u32,
    pub taker_fee_bps: u32,
    pub protocol_version: String,
    pub created_at_ms: i64,
}

impl OfferPayload {
    pub fn maker_side(&self) -> Side {
        self.direction.maker_side()
    }

    pub fn validate(&self) -> Result<(), OfferError> {
        if self.amount == 0 {
            return Err(OfferError::InvalidAmounts("zero amount"));
        }
        if self.min_amount == 0 || self.min_amount > self.amount {
            return Err(OfferError::InvalidAmounts("min amount outside (0, amount]"));
        }
        if u64::from(self.security_deposit_bps) > BPS_DENOMINATOR {
            return Err(OfferError::InvalidAmounts("security deposit above 100%"));
        }
        Ok(())
    }

    /// SHA-256 over the canonical JSON encoding.
    pub fn hash(&self) -> Result<[u8; 32], OfferError> {
        serde_json::to_vec(self)
            .map(|bytes| sha256(&bytes))
            .map_err(|e| OfferError::Serialization(e.to_string()))
    }

    /// What the maker must reserve to back this offer at its full amount:
    /// `(reserved amount, maker fee)`.
    pub fn maker_reservation(&self) -> Result<(u64, u64), OfferError> {
        let amounts = TradeAmounts::compute(self, self.amount)?;
        let reserved = required_deposit(
            self.maker_side(),
            amounts.security_deposit(self.maker_side()),
            self.amount,
        )?;
        Ok((reserved, amounts.maker_fee))
    }
}

/// An arbitrator-signed offer plus the maker's proof of reserved funds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedOffer {
    pub payload: OfferPayload,
    pub reserve_tx: ReserveTx,
    pub arbitrator_signature: Signature,
}

impl SignedOffer {
    pub fn sign(
        payload: OfferPayload,
        reserve_tx: ReserveTx,
        arbitrator: &NodeKeypair,
    ) -> Result<Self, OfferError> {
        let digest = payload.hash()?;
        Ok(Self {
            arbitrator_signature: arbitrator.sign(&digest),
            payload,
            reserve_tx,
        })
    }

    pub fn id(&self) -> &str {
        &self.payload.id
    }

    pub fn verify_arbitrator_signature(&self) -> Result<(), OfferError> {
        let digest = self.payload.hash()?;
        if self
            .payload
            .arbitrator_pub_key
            .verify(&digest, &self.arbitrator_signature)
        {
            Ok(())
        } else {
            Err(OfferError::InvalidSignature)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OfferState {
    Scheduled,
    FundsReserved,
    SigningRequested,
    Signed,
    Taken,
    Canceled,
    Failed,
}

impl fmt::Display for OfferState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// The maker's own, mutable view of one of its offers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenOffer {
    pub payload: OfferPayload,
    pub state: OfferState,
    pub reserve_tx: Option<ReserveTx>,
    pub signed: Option<SignedOffer>,
    pub error_message: Option<String>,
}

impl OpenOffer {
    pub fn new(payload: OfferPayload) -> Self {
        Self {
            payload,
            state: OfferState::Scheduled,
            reserve_tx: None,
            signed: None,
            error_message: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.payload.id
    }

    pub fn is_available(&self) -> bool {
        self.state == OfferState::Signed
    }
}

/// Amounts of one concrete trade against an offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TradeAmounts {
    pub trade_amount: u64,
    pub buyer_security_deposit: u64,
    pub seller_security_deposit: u64,
    pub maker_fee: u64,
    pub taker_fee: u64,
}

fn bps_of(amount: u64, bps: u32) -> Result<u64, OfferError> {
    let scaled = u128::from(amount) * u128::from(bps) / u128::from(BPS_DENOMINATOR);
    u64::try_from(scaled).map_err(|_| OfferError::InvalidAmounts("basis point overflow"))
}

impl TradeAmounts {
    /// Derives deposits and fees for `trade_amount`. Both sides post the
    /// same security deposit, never less than the offer's minimum.
    pub fn compute(offer: &OfferPayload, trade_amount: u64) -> Result<Self, OfferError> {
        if trade_amount < offer.min_amount || trade_amount > offer.amount {
            return Err(OfferError::AmountOutOfRange {
                amount: trade_amount,
                min: offer.min_amount,
                max: offer.amount,
            });
        }
        let deposit = bps_of(trade_amount, offer.security_deposit_bps)?.max(offer.min_security_deposit);
        Ok(Self {
            trade_amount,
            buyer_security_deposit: deposit,
            seller_security_deposit: deposit,
            maker_fee: bps_of(trade_amount, offer.maker_fee_bps)?,
            taker_fee: bps_of(trade_amount, offer.taker_fee_bps)?,
        })
    }

    pub fn security_deposit(&self, side: Side) -> u64 {
        match side {
            Side::Buyer => self.buyer_security_deposit,
            Side::Seller => self.seller_security_deposit,
        }
    }

    /// Deposit `side` sends into the multisig.
    pub fn deposit(&self, side: Side) -> Result<u64, EscrowError> {
        required_deposit(side, self.security_deposit(side), self.trade_amount)
    }
}
