//! # Disputes
//!
//! When traders stop cooperating, either one (or the escalation listener,
//! after a fatal verification failure) opens a dispute with the trade's
//! arbitrator. The arbitrator collects both traders' multisig state,
//! decides a split and sends a payout it has already signed; one trader
//! co-signs and publishes it.
//!
//! ```text
//!  trader A            arbitrator                trader B
//!     │── OpenNewDispute ─▶│                          │
//!     │◀──────── ack ──────│── PeerOpenedDispute ────▶│
//!     │◀─ PayoutTxRequest ─│── PayoutTxRequest ──────▶│
//!     │── PayoutTxResponse▶│◀─ PayoutTxResponse ──────│
//!     │        ... chat, evidence ...                 │
//!     │◀─ DisputeResult ───│── DisputeResult ────────▶│
//!   co-sign + publish (first one wins, the other sees it on chain)
//! ```
//!
//! Mediation results are advisory: they are recorded and never signed.
//! Once a mediation result is in, either trader may take the trade to
//! arbitration or refund. The new dispute replaces the mediation under a
//! fresh id, and results addressed to the old id are refused.

pub mod coordinator;

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::escrow::EscrowError;
use crate::network::NodeAddress;
use crate::trade::{Side, TradeError};
use crate::wallet::WalletError;

pub use coordinator::DisputeCoordinator;

#[derive(Debug, Error)]
pub enum DisputeError {
    #[error("unknown trade {0}")]
    UnknownTrade(String),

    #[error("no dispute for trade {0}")]
    UnknownDispute(String),

    #[error("trade {0} already has an open dispute")]
    AlreadyOpen(String),

    #[error("dispute for trade {0} is closed")]
    Closed(String),

    #[error("only {expected} may {action}")]
    WrongRole {
        expected: &'static str,
        action: &'static str,
    },

    #[error("trade {0} has no contract, nothing to dispute")]
    NoContract(String),

    #[error("delivery failed: {0}")]
    Delivery(String),

    #[error(transparent)]
    Escrow(#[from] EscrowError),

    #[error("wallet: {0}")]
    Wallet(#[from] WalletError),

    #[error(transparent)]
    Trade(#[from] TradeError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SupportType {
    /// Advisory split proposed by a mediator; nothing is signed.
    Mediation,
    Arbitration,
    Refund,
}

impl SupportType {
    /// Whether a result moves funds.
    pub fn pays_out(self) -> bool {
        !matches!(self, SupportType::Mediation)
    }
}

impl fmt::Display for SupportType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DisputeStatus {
    Open,
    Closed,
}

/// One chat line. The sender fills the delivery fields as outcomes come
/// in; the receiver stores the message with `arrived` set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub uid: String,
    pub trade_id: String,
    pub dispute_id: String,
    pub sender: NodeAddress,
    pub sender_is_arbitrator: bool,
    pub text: String,
    pub sent_at_ms: i64,
    pub arrived: bool,
    pub stored_in_mailbox: bool,
    pub send_failed: Option<String>,
    pub acknowledged: bool,
    pub ack_error: Option<String>,
}

impl ChatMessage {
    pub fn new(
        trade_id: &str,
        dispute_id: &str,
        sender: NodeAddress,
        sender_is_arbitrator: bool,
        text: impl Into<String>,
    ) -> Self {
        Self {
            uid: uuid::Uuid::new_v4().to_string(),
            trade_id: trade_id.to_string(),
            dispute_id: dispute_id.to_string(),
            sender,
            sender_is_arbitrator,
            text: text.into(),
            sent_at_ms: chrono::Utc::now().timestamp_millis(),
            arrived: false,
            stored_in_mailbox: false,
            send_failed: None,
            acknowledged: false,
            ack_error: None,
        }
    }
}

/// The arbitrator's decision. Amounts are gross: together they are the
/// whole multisig balance, and the transaction cost comes out of the
/// loser's share.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisputeResult {
    pub winner: Side,
    pub buyer_amount: u64,
    pub seller_amount: u64,
    pub reason: String,
    pub summary: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dispute {
    pub id: String,
    pub trade_id: String,
    pub support_type: SupportType,
    /// Whether the node holding this copy opened the dispute.
    pub is_opener: bool,
    pub opener_side: Side,
    pub reason: String,
    pub contract_hash: String,
    pub chat: Vec<ChatMessage>,
    pub status: DisputeStatus,
    pub result: Option<DisputeResult>,
    pub opened_at_ms: i64,
}

impl Dispute {
    pub fn is_open(&self) -> bool {
        self.status == DisputeStatus::Open
    }

    /// Appends a chat line unless one with the same uid is already there.
    pub fn push_chat(&mut self, message: ChatMessage) -> bool {
        if self.chat.iter().any(|m| m.uid == message.uid) {
            return false;
        }
        self.chat.push(message);
        true
    }

    pub fn chat_mut(&mut self, uid: &str) -> Option<&mut ChatMessage> {
        self.chat.iter_mut().find(|m| m.uid == uid)
    }

    /// A mediation that produced its advisory result and may be replaced by
    /// a payout-bearing dispute.
    pub fn is_escalatable(&self) -> bool {
        self.is_open() && self.support_type == SupportType::Mediation && self.result.is_some()
    }

    pub fn close(&mut self, result: DisputeResult) {
        self.result = Some(result);
        self.status = DisputeStatus::Closed;
    }
}
