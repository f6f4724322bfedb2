//! # Trade Protocol
//!
//! The per-trade state machine. One actor per trade owns the [`Trade`]
//! record; every inbound message, user action and chain event for that
//! trade is serialized through its inbox and turned into a short
//! [`TaskPipeline`](crate::pipeline::TaskPipeline) run.
//!
//! ## Happy path (maker sells XMR)
//!
//! ```text
//!  taker            arbitrator             maker
//!    │ reserve funds     │                   │
//!    │── InitTrade ─────▶│ verify reserve    │
//!    │                   │── InitTrade ─────▶│ multisig + contract
//!    │◀──────────── SignContractRequest ─────│
//!    │───────────── SignContractResponse ───▶│
//!    │── DepositRequest ▶│◀─ DepositRequest ─│
//!    │◀─ DepositResponse─│── DepositResponse▶│ (both deposits published)
//!        ... confirmations, multisig hex exchange, unlock ...
//!    │── PaymentSent ───────────────────────▶│ verify payout, import hex
//!    │◀────────────── PaymentReceived ───────│ co-sign + publish payout
//!        ... payout confirmed: Closed on all three ...
//! ```
//!
//! Modules:
//! - [`state`]: the state enum, transition table and message windows
//! - [`model`]: the trade record and its peers
//! - [`contract`]: the signed contract
//! - [`tasks`]: every protocol step as a [`TradeTask`](tasks::TradeTask)
//! - [`protocol`]: which steps run for which trigger
//! - [`manager`]: actors, routing, deferral and lifecycle polling

pub mod context;
pub mod contract;
pub mod manager;
pub mod model;
pub mod protocol;
pub mod state;
pub mod tasks;

use thiserror::Error;

use crate::escrow::EscrowError;
use crate::offer::OfferError;

pub use context::TradeContext;
pub use contract::Contract;
pub use manager::{DisputeUpdate, TradeEvent, TradeManager};
pub use model::{OutboundRecord, Role, Side, Trade, TradePeer};
pub use state::{
    acceptance, can_transition, Acceptance, DisputeState, MediationResultState, PayoutState,
    TradePhase, TradeState, TransitionError,
};
pub use tasks::TradeTask;

#[derive(Debug, Error)]
pub enum TradeError {
    #[error("unknown trade {0}")]
    UnknownTrade(String),

    #[error("trade {0} already exists")]
    AlreadyExists(String),

    #[error("offer {0} is our own")]
    OwnOffer(String),

    #[error("trade {id} cannot {action} in state {state}")]
    NotReady {
        id: String,
        state: TradeState,
        action: &'static str,
    },

    #[error("trade {0} has no contract yet")]
    NoContract(String),

    #[error("contract of trade {0} is locked")]
    ContractLocked(String),

    #[error("{task} failed: {error}")]
    Pipeline { task: &'static str, error: String },

    #[error("trade actor for {0} is gone")]
    ActorGone(String),

    #[error(transparent)]
    Offer(#[from] OfferError),

    #[error(transparent)]
    Escrow(#[from] EscrowError),

    #[error(transparent)]
    Transition(#[from] TransitionError),
}
