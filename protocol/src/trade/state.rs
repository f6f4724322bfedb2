//! # Trade States and the Transition Table
//!
//! A trade walks one ordered list of states. Roles skip the states that
//! belong to the other side (an arbitrator never sits in
//! `BuyerSentPaymentSentMsg`), but nobody moves backwards.
//!
//! ```text
//!  Preparation ─▶ FundsReserved ─▶ InitTradeRequested ─▶ ContractSignatureRequested
//!      ─▶ ContractSigned ─▶ DepositRequested ─▶ DepositTxsPublished
//!      ─▶ DepositTxsConfirmed ─▶ DepositTxsUnlocked
//!      ─▶ BuyerConfirmedPaymentSent ─▶ BuyerSent / StoredInMailbox / SendFailed
//!      ─▶ PaymentSentAcked ─▶ PaymentSentMsgReceived
//!      ─▶ SellerConfirmedPaymentReceipt ─▶ SellerSent / StoredInMailbox / SendFailed
//!      ─▶ PaymentReceivedAcked ─▶ PaymentReceivedMsgReceived
//!      ─▶ PayoutPublished ─▶ Closed
//!
//!  failure:  InitTradeFailed | DepositRequestFailed | PayoutFailed
//! ```
//!
//! [`can_transition`] is the only place that decides whether a move is
//! legal. [`acceptance`] decides whether an inbound message fits the
//! current state, is early (defer it) or late (ack and ignore it).

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use super::model::{Role, Side};
use crate::network::MessageKind;

/// Position of a trade in the protocol. Declaration order is protocol
/// order; the three failure states sort last and are never compared by
/// position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TradeState {
    Preparation,
    FundsReserved,
    InitTradeRequested,
    ContractSignatureRequested,
    ContractSigned,
    DepositRequested,
    DepositRequestSendFailed,
    DepositTxsPublished,
    DepositTxsConfirmed,
    DepositTxsUnlocked,
    BuyerConfirmedPaymentSent,
    BuyerSentPaymentSentMsg,
    BuyerStoredInMailboxPaymentSentMsg,
    BuyerSendFailedPaymentSentMsg,
    PaymentSentAcked,
    PaymentSentMsgReceived,
    SellerConfirmedPaymentReceipt,
    SellerSentPaymentReceivedMsg,
    SellerStoredInMailboxPaymentReceivedMsg,
    SellerSendFailedPaymentReceivedMsg,
    PaymentReceivedAcked,
    PaymentReceivedMsgReceived,
    PayoutPublished,
    Closed,

    InitTradeFailed,
    DepositRequestFailed,
    PayoutFailed,
}

/// Coarse grouping of states, used for failure handling and display.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TradePhase {
    Init,
    DepositRequested,
    DepositsPublished,
    DepositsConfirmed,
    DepositsUnlocked,
    PaymentSent,
    PaymentReceived,
    PayoutPublished,
    Completed,
}

impl TradeState {
    pub fn is_failure(self) -> bool {
        matches!(
            self,
            TradeState::InitTradeFailed | TradeState::DepositRequestFailed | TradeState::PayoutFailed
        )
    }

    pub fn is_closed(self) -> bool {
        self == TradeState::Closed
    }

    pub fn phase(self) -> TradePhase {
        use TradeState::*;
        match self {
            Preparation | FundsReserved | InitTradeRequested | ContractSignatureRequested
            | ContractSigned | InitTradeFailed => TradePhase::Init,
            DepositRequested | DepositRequestSendFailed | DepositRequestFailed => {
                TradePhase::DepositRequested
            }
            DepositTxsPublished => TradePhase::DepositsPublished,
            DepositTxsConfirmed => TradePhase::DepositsConfirmed,
            DepositTxsUnlocked => TradePhase::DepositsUnlocked,
            BuyerConfirmedPaymentSent
            | BuyerSentPaymentSentMsg
            | BuyerStoredInMailboxPaymentSentMsg
            | BuyerSendFailedPaymentSentMsg
            | PaymentSentAcked
            | PaymentSentMsgReceived
            | PayoutFailed => TradePhase::PaymentSent,
            SellerConfirmedPaymentReceipt
            | SellerSentPaymentReceivedMsg
            | SellerStoredInMailboxPaymentReceivedMsg
            | SellerSendFailedPaymentReceivedMsg
            | PaymentReceivedAcked
            | PaymentReceivedMsgReceived => TradePhase::PaymentReceived,
            PayoutPublished => TradePhase::PayoutPublished,
            Closed => TradePhase::Completed,
        }
    }

    /// Failure state a task failure in `self` lands in.
    pub fn failure_state(self) -> TradeState {
        match self.phase() {
            TradePhase::Init => TradeState::InitTradeFailed,
            TradePhase::DepositRequested | TradePhase::DepositsPublished => {
                TradeState::DepositRequestFailed
            }
            _ => TradeState::PayoutFailed,
        }
    }

    /// For a failure state, the earliest state a retry may resume at.
    pub fn resume_point(self) -> Option<TradeState> {
        match self {
            TradeState::InitTradeFailed => Some(TradeState::Preparation),
            TradeState::DepositRequestFailed => Some(TradeState::DepositRequested),
            TradeState::PayoutFailed => Some(TradeState::DepositTxsPublished),
            _ => None,
        }
    }

    /// States whose last outbound message did not get through and is
    /// resent on the redelivery tick.
    pub fn is_send_failed(self) -> bool {
        matches!(
            self,
            TradeState::DepositRequestSendFailed
                | TradeState::BuyerSendFailedPaymentSentMsg
                | TradeState::SellerSendFailedPaymentReceivedMsg
        )
    }

    fn is_retry_of(self, failed: TradeState) -> bool {
        use TradeState::*;
        matches!(
            (failed, self),
            (DepositRequestSendFailed, DepositRequested)
                | (BuyerSendFailedPaymentSentMsg, BuyerSentPaymentSentMsg)
                | (BuyerSendFailedPaymentSentMsg, BuyerStoredInMailboxPaymentSentMsg)
                | (SellerSendFailedPaymentReceivedMsg, SellerSentPaymentReceivedMsg)
                | (SellerSendFailedPaymentReceivedMsg, SellerStoredInMailboxPaymentReceivedMsg)
        )
    }
}

impl fmt::Display for TradeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("illegal trade state transition {from} -> {to}")]
pub struct TransitionError {
    pub from: TradeState,
    pub to: TradeState,
}

/// The transition table.
pub fn can_transition(from: TradeState, to: TradeState) -> Result<(), TransitionError> {
    let allowed = if from == to {
        true
    } else if from.is_closed() {
        false
    } else if to.is_failure() {
        !from.is_failure()
    } else if let Some(resume) = from.resume_point() {
        to >= resume
    } else {
        to.is_retry_of(from) || to > from
    };

    if allowed {
        Ok(())
    } else {
        Err(TransitionError { from, to })
    }
}

// ---------------------------------------------------------------------------
// Dispute, mediation and payout sub-states
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DisputeState {
    NoDispute,
    DisputeRequested,
    DisputeOpened,
    DisputeClosed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MediationResultState {
    NoResult,
    /// A mediator proposed a split. Nothing is signed on its basis.
    ResultReceived,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PayoutState {
    Unpublished,
    Published,
    Confirmed,
}

// ---------------------------------------------------------------------------
// Message acceptance
// ---------------------------------------------------------------------------

/// What to do with an inbound trade message given the current state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acceptance {
    Accept,
    /// Too early: keep it and retry once the trade has caught up.
    Defer,
    /// Too late or not meant for this role: ack and ignore.
    Stale,
}

/// Inclusive state window in which `kind` is applied for this role/side.
fn window(role: Role, side: Option<Side>, kind: MessageKind) -> Option<(TradeState, TradeState)> {
    use TradeState::*;
    match (kind, role, side) {
        (MessageKind::InitTradeRequest, Role::Arbitrator | Role::Maker, _) => {
            Some((Preparation, Preparation))
        }
        (MessageKind::SignContractRequest, Role::Taker, _) => {
            Some((InitTradeRequested, ContractSignatureRequested))
        }
        (MessageKind::SignContractResponse, Role::Maker, _) => {
            Some((ContractSignatureRequested, ContractSignatureRequested))
        }
        (MessageKind::DepositRequest, Role::Arbitrator, _) => {
            Some((InitTradeRequested, DepositRequested))
        }
        (MessageKind::DepositResponse, Role::Maker | Role::Taker, _) => {
            Some((DepositRequested, DepositRequestSendFailed))
        }
        (MessageKind::DepositsConfirmed, _, _) => Some((DepositTxsPublished, PayoutPublished)),
        (MessageKind::PaymentSent, Role::Arbitrator, _)
        | (MessageKind::PaymentSent, _, Some(Side::Seller)) => {
            Some((DepositTxsPublished, PaymentSentMsgReceived))
        }
        (MessageKind::PaymentReceived, Role::Arbitrator, _) => {
            Some((DepositTxsPublished, PayoutPublished))
        }
        (MessageKind::PaymentReceived, _, Some(Side::Buyer)) => {
            Some((BuyerSentPaymentSentMsg, PayoutPublished))
        }
        _ => None,
    }
}

/// Classifies an inbound message. `state` must be the trade's effective
/// (last good) state, never a failure state.
pub fn acceptance(
    role: Role,
    side: Option<Side>,
    state: TradeState,
    kind: MessageKind,
) -> Acceptance {
    match window(role, side, kind) {
        Some((min, _)) if state < min => Acceptance::Defer,
        Some((_, max)) if state > max => Acceptance::Stale,
        Some(_) => Acceptance::Accept,
        None => Acceptance::Stale,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use TradeState::*;

    #[test]
    fn test_forward_moves_allowed_backward_denied() {
        assert!(can_transition(Preparation, FundsReserved).is_ok());
        assert!(can_transition(DepositTxsUnlocked, PaymentSentMsgReceived).is_ok());
        assert!(can_transition(PaymentSentAcked, PaymentSentAcked).is_ok());
        assert_eq!(
            can_transition(DepositTxsConfirmed, DepositTxsPublished),
            Err(TransitionError {
                from: DepositTxsConfirmed,
                to: DepositTxsPublished
            })
        );
        assert!(can_transition(BuyerStoredInMailboxPaymentSentMsg, BuyerSentPaymentSentMsg).is_err());
    }

    #[test]
    fn test_nothing_leaves_closed() {
        assert!(can_transition(Closed, PayoutFailed).is_err());
        assert!(can_transition(Closed, PayoutPublished).is_err());
        assert!(can_transition(Closed, Closed).is_ok());
    }

    #[test]
    fn test_send_failed_retries() {
        assert!(can_transition(BuyerSendFailedPaymentSentMsg, BuyerSentPaymentSentMsg).is_ok());
        assert!(
            can_transition(BuyerSendFailedPaymentSentMsg, BuyerStoredInMailboxPaymentSentMsg).is_ok()
        );
        assert!(can_transition(DepositRequestSendFailed, DepositRequested).is_ok());
        assert!(
            can_transition(SellerSendFailedPaymentReceivedMsg, SellerSentPaymentReceivedMsg).is_ok()
        );
        assert!(BuyerSendFailedPaymentSentMsg.is_send_failed());
        assert!(!BuyerSentPaymentSentMsg.is_send_failed());
    }

    #[test]
    fn test_failure_states() {
        assert_eq!(ContractSigned.failure_state(), InitTradeFailed);
        assert_eq!(DepositTxsPublished.failure_state(), DepositRequestFailed);
        assert_eq!(PaymentSentMsgReceived.failure_state(), PayoutFailed);

        assert!(can_transition(DepositTxsUnlocked, PayoutFailed).is_ok());
        assert!(can_transition(PayoutFailed, InitTradeFailed).is_err());
        // Resume at or after the failed phase's start, never before it.
        assert!(can_transition(PayoutFailed, BuyerConfirmedPaymentSent).is_ok());
        assert!(can_transition(PayoutFailed, ContractSigned).is_err());
        assert!(can_transition(DepositRequestFailed, DepositRequested).is_ok());
    }

    #[test]
    fn test_payment_received_is_deferred_before_payment_sent() {
        let buyer = Some(Side::Buyer);
        assert_eq!(
            acceptance(Role::Taker, buyer, DepositTxsPublished, MessageKind::PaymentReceived),
            Acceptance::Defer
        );
        assert_eq!(
            acceptance(Role::Taker, buyer, PaymentSentAcked, MessageKind::PaymentReceived),
            Acceptance::Accept
        );
        assert_eq!(
            acceptance(Role::Taker, buyer, Closed, MessageKind::PaymentReceived),
            Acceptance::Stale
        );
    }

    #[test]
    fn test_messages_for_the_wrong_role_are_stale() {
        assert_eq!(
            acceptance(Role::Maker, Some(Side::Buyer), DepositTxsUnlocked, MessageKind::PaymentSent),
            Acceptance::Stale
        );
        assert_eq!(
            acceptance(Role::Taker, Some(Side::Seller), Preparation, MessageKind::InitTradeRequest),
            Acceptance::Stale
        );
    }

    #[test]
    fn test_arbitrator_deposit_window() {
        assert_eq!(
            acceptance(Role::Arbitrator, None, Preparation, MessageKind::DepositRequest),
            Acceptance::Defer
        );
        assert_eq!(
            acceptance(Role::Arbitrator, None, DepositRequested, MessageKind::DepositRequest),
            Acceptance::Accept
        );
        assert_eq!(
            acceptance(Role::Arbitrator, None, DepositTxsPublished, MessageKind::DepositRequest),
            Acceptance::Stale
        );
    }
}
