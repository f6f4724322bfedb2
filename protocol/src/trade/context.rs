//! Per-run scratch context of a trade pipeline.
//!
//! Built by the trade actor for one pipeline run and dropped afterwards.
//! It carries a working copy of the trade, so a failed step only ever
//! rolls back that copy; the actor adopts the copy when the run ends.

use std::sync::Arc;
use tracing::{debug, error, info, warn};

use super::model::{OutboundRecord, Role, Trade};
use super::state::TradeState;
use crate::network::{DeliveryOutcome, InboundMessage, MessageKind, ProtocolMessage, SendMode};
use crate::offer::OfferBook;
use crate::pipeline::{PipelineContext, TaskError};
use crate::services::Services;

pub struct TradeContext {
    pub trade: Trade,
    pub services: Arc<Services>,
    pub offers: Arc<OfferBook>,
    /// Message that triggered this run, if any.
    pub inbound: Option<InboundMessage>,
    /// Seat of the node that sent `inbound`.
    pub peer: Option<Role>,
    /// State changes made during the run, in order.
    pub transitions: Vec<(TradeState, TradeState)>,
    snapshot: Option<(Trade, usize)>,
}

impl TradeContext {
    pub fn new(
        trade: Trade,
        services: Arc<Services>,
        offers: Arc<OfferBook>,
        inbound: Option<InboundMessage>,
        peer: Option<Role>,
    ) -> Self {
        Self {
            trade,
            services,
            offers,
            inbound,
            peer,
            transitions: Vec::new(),
            snapshot: None,
        }
    }

    pub fn trade_id(&self) -> &str {
        &self.trade.id
    }

    /// Moves the trade to `to`. Illegal moves fail the step.
    pub fn set_state(&mut self, to: TradeState) -> Result<(), TaskError> {
        let from = self.trade.state;
        match self.trade.advance(to) {
            Ok(true) => {
                info!(trade_id = %self.trade.id, role = %self.trade.role, from = %from, to = %to, "trade state changed");
                self.transitions.push((from, to));
                Ok(())
            }
            Ok(false) => Ok(()),
            Err(e) => {
                error!(trade_id = %self.trade.id, error = %e, "illegal state transition");
                Err(e.into())
            }
        }
    }

    /// Moves forward to `to` unless the trade is already past it.
    pub fn advance_at_least(&mut self, to: TradeState) -> Result<(), TaskError> {
        if !self.trade.state.is_failure() && self.trade.state >= to {
            return Ok(());
        }
        self.set_state(to)
    }

    /// Seat of the sender of the triggering message.
    pub fn inbound_peer(&self) -> Result<Role, TaskError> {
        self.peer
            .ok_or_else(|| TaskError::InvalidMessage("no inbound sender".into()))
    }

    /// Fails unless the triggering message came from `expected`.
    pub fn expect_sender(&self, expected: Role) -> Result<(), TaskError> {
        match self.peer {
            Some(role) if role == expected => Ok(()),
            Some(role) => Err(TaskError::Verification(format!(
                "expected message from the {expected}, got the {role}"
            ))),
            None => Err(TaskError::InvalidMessage("no inbound sender".into())),
        }
    }

    /// Sends `message` to the peer in seat `to` and records the outcome on
    /// the trade. A failed delivery is an outcome, not an error.
    pub async fn send_to(
        &mut self,
        to: Role,
        message: ProtocolMessage,
    ) -> Result<DeliveryOutcome, TaskError> {
        let node = require(&self.trade.peer(to).node, "peer address")?;
        let sequence = self.trade.next_sequence();
        let envelope = self.services.envelope(&self.trade.id, sequence, message);
        let outcome = self
            .services
            .send(&node, &envelope, SendMode::DirectThenMailbox)
            .await;
        match &outcome {
            DeliveryOutcome::Failed(reason) => warn!(
                trade_id = %self.trade.id,
                to = %to,
                kind = %envelope.kind(),
                uid = %envelope.uid,
                reason = %reason,
                "send failed"
            ),
            _ => debug!(
                trade_id = %self.trade.id,
                to = %to,
                kind = %envelope.kind(),
                uid = %envelope.uid,
                sequence,
                outcome = ?outcome,
                "message sent"
            ),
        }
        self.trade
            .record_outbound(OutboundRecord::new(&envelope, to, outcome.clone()));
        Ok(outcome)
    }

    /// Like [`send_to`](Self::send_to) for steps that cannot continue
    /// unless the message will reach the peer.
    pub async fn send_required(
        &mut self,
        to: Role,
        message: ProtocolMessage,
    ) -> Result<(), TaskError> {
        let kind = message.kind();
        match self.send_to(to, message).await? {
            DeliveryOutcome::Failed(reason) => Err(delivery_error(kind, reason)),
            _ => Ok(()),
        }
    }
}

impl PipelineContext for TradeContext {
    fn begin_step(&mut self) {
        self.snapshot = Some((self.trade.clone(), self.transitions.len()));
    }

    fn commit_step(&mut self) {
        self.snapshot = None;
    }

    fn rollback_step(&mut self) {
        if let Some((trade, transitions)) = self.snapshot.take() {
            self.trade = trade;
            self.transitions.truncate(transitions);
        }
    }

    fn record_failure(&mut self, task: &'static str, error: &TaskError) {
        let from = self.trade.state;
        self.trade.record_failure(task, error);
        if self.trade.state != from {
            self.transitions.push((from, self.trade.state));
        }
    }
}

/// Clones a field a step cannot do without.
pub(crate) fn require<T: Clone>(value: &Option<T>, what: &str) -> Result<T, TaskError> {
    value
        .clone()
        .ok_or_else(|| TaskError::Precondition(format!("{what} unknown")))
}

pub(crate) fn delivery_error(kind: MessageKind, reason: String) -> TaskError {
    TaskError::Delivery {
        kind: kind.to_string(),
        reason,
    }
}
