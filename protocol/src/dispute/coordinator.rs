//! Dispute message handling for both seats: the trader that opens or
//! answers a dispute, and the arbitrator that decides it.
//!
//! The coordinator keeps one [`Dispute`] per trade id and reports
//! progress to the trade through [`TradeManager::update_dispute`]; it
//! never writes the trade itself.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::{
    ChatMessage, Dispute, DisputeError, DisputeResult, DisputeStatus, SupportType,
};
use crate::escrow::{verify_dispute_payout_tx, DisputeAllocation};
use crate::network::messages::{
    AckMessage, ArbitratorPayoutTxRequest, ArbitratorPayoutTxResponse, DisputeResultMessage,
    OpenNewDispute, PeerOpenedDispute,
};
use crate::network::{
    DeferOutcome, DeferredQueue, DeliveryOutcome, Envelope, InboundMessage, MessageKind,
    ProtocolMessage, SendMode,
};
use crate::services::Services;
use crate::storage::{Checkpoint, CheckpointWriter};
use crate::trade::{DisputeUpdate, Role, Side, Trade, TradeEvent, TradeManager};

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq)]
pub enum DisputeEvent {
    Opened {
        trade_id: String,
        support_type: SupportType,
    },
    ResultReceived {
        trade_id: String,
        support_type: SupportType,
    },
    Closed {
        trade_id: String,
        payout_tx_hash: Option<String>,
    },
}

/// Whether an inbound dispute message could be applied yet.
enum Applied {
    Done,
    /// Its trade or dispute is not known yet.
    Defer,
}

pub struct DisputeCoordinator {
    trades: Arc<TradeManager>,
    checkpoints: Arc<CheckpointWriter>,
    disputes: DashMap<String, Dispute>,
    pending: Mutex<DeferredQueue>,
    sequence: AtomicU64,
    events: broadcast::Sender<DisputeEvent>,
}

impl DisputeCoordinator {
    pub fn new(trades: Arc<TradeManager>, checkpoints: Arc<CheckpointWriter>) -> Arc<Self> {
        let pending = DeferredQueue::from_config(&trades.services().config);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Arc::new(Self {
            trades,
            checkpoints,
            disputes: DashMap::new(),
            pending: Mutex::new(pending),
            sequence: AtomicU64::new(1),
            events,
        })
    }

    fn services(&self) -> &Arc<Services> {
        self.trades.services()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DisputeEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: DisputeEvent) {
        let _ = self.events.send(event);
    }

    pub fn dispute(&self, trade_id: &str) -> Option<Dispute> {
        self.disputes.get(trade_id).map(|d| d.clone())
    }

    pub fn disputes(&self) -> Vec<Dispute> {
        let mut disputes: Vec<Dispute> = self.disputes.iter().map(|d| d.clone()).collect();
        disputes.sort_by_key(|d| d.opened_at_ms);
        disputes
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn restore(&self, disputes: Vec<Dispute>) {
        for dispute in disputes {
            self.disputes.insert(dispute.trade_id.clone(), dispute);
        }
    }

    fn save(&self, dispute: &Dispute) {
        self.disputes
            .insert(dispute.trade_id.clone(), dispute.clone());
        self.checkpoints.request(Checkpoint::Dispute(dispute.clone()));
    }

    fn trade(&self, trade_id: &str) -> Result<Trade, DisputeError> {
        self.trades
            .snapshot(trade_id)
            .ok_or_else(|| DisputeError::UnknownTrade(trade_id.to_string()))
    }

    fn envelope(&self, trade_id: &str, message: ProtocolMessage) -> Envelope {
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        self.services().envelope(trade_id, sequence, message)
    }

    async fn send(&self, trade: &Trade, to: Role, envelope: &Envelope) -> DeliveryOutcome {
        let Some(node) = trade.peer(to).node.clone() else {
            return DeliveryOutcome::Failed(format!("{to} address unknown"));
        };
        let outcome = self
            .services()
            .send(&node, envelope, SendMode::DirectThenMailbox)
            .await;
        if let DeliveryOutcome::Failed(reason) = &outcome {
            warn!(trade_id = %trade.id, to = %to, kind = %envelope.kind(), reason = %reason, "dispute message not delivered");
        }
        outcome
    }

    // -----------------------------------------------------------------------
    // Trader actions
    // -----------------------------------------------------------------------

    /// Opens a dispute with the trade's arbitrator. Resolves once the
    /// request was delivered or stored in the arbitrator's mailbox; the
    /// arbitrator's ack later marks the dispute opened.
    ///
    /// A mediation that already has its result may be replaced this way by
    /// an arbitration or refund dispute. Any other open dispute blocks.
    pub async fn open_dispute(
        &self,
        trade_id: &str,
        support_type: SupportType,
        reason: impl Into<String>,
    ) -> Result<Dispute, DisputeError> {
        let trade = self.trade(trade_id)?;
        let Some(side) = trade.side() else {
            return Err(DisputeError::WrongRole {
                expected: "a trader",
                action: "open a dispute",
            });
        };
        let contract = trade
            .contract
            .as_ref()
            .ok_or_else(|| DisputeError::NoContract(trade_id.to_string()))?;
        if let Some(current) = self.dispute(trade_id).filter(|d| d.is_open()) {
            if !(current.is_escalatable() && support_type.pays_out()) {
                return Err(DisputeError::AlreadyOpen(trade_id.to_string()));
            }
            info!(trade_id, mediation = %current.id, support = %support_type, "escalating mediated dispute");
        }

        let dispute = Dispute {
            id: uuid::Uuid::new_v4().to_string(),
            trade_id: trade_id.to_string(),
            support_type,
            is_opener: true,
            opener_side: side,
            reason: reason.into(),
            contract_hash: contract.hash(),
            chat: Vec::new(),
            status: DisputeStatus::Open,
            result: None,
            opened_at_ms: chrono::Utc::now().timestamp_millis(),
        };
        self.save(&dispute);
        self.trades
            .update_dispute(trade_id, DisputeUpdate::Requested)
            .await?;
        info!(trade_id, dispute_id = %dispute.id, support = %support_type, "opening dispute");

        let envelope = self.envelope(
            trade_id,
            ProtocolMessage::OpenNewDispute(OpenNewDispute {
                dispute: dispute.clone(),
            }),
        );
        let config = &self.services().config;
        let attempts = config.dispute_open_max_attempts.max(1);
        for attempt in 1..=attempts {
            match self.send(&trade, Role::Arbitrator, &envelope).await {
                DeliveryOutcome::Failed(reason) if attempt < attempts => {
                    warn!(trade_id, attempt, reason = %reason, "dispute request not delivered, retrying");
                    tokio::time::sleep(config.dispute_open_retry_delay()).await;
                }
                DeliveryOutcome::Failed(reason) => {
                    error!(trade_id, attempts, "giving up on dispute request");
                    return Err(DisputeError::Delivery(reason));
                }
                _ => break,
            }
        }
        self.emit(DisputeEvent::Opened {
            trade_id: trade_id.to_string(),
            support_type,
        });
        Ok(dispute)
    }

    /// Appends a chat line and sends it: trader to arbitrator, arbitrator
    /// to both traders. Never waits for the ack.
    pub async fn send_chat(
        &self,
        trade_id: &str,
        text: impl Into<String>,
    ) -> Result<ChatMessage, DisputeError> {
        let trade = self.trade(trade_id)?;
        let dispute = self
            .dispute(trade_id)
            .ok_or_else(|| DisputeError::UnknownDispute(trade_id.to_string()))?;
        if !dispute.is_open() {
            return Err(DisputeError::Closed(trade_id.to_string()));
        }

        let is_arbitrator = trade.role == Role::Arbitrator;
        let mut chat = ChatMessage::new(
            trade_id,
            &dispute.id,
            self.services().address().clone(),
            is_arbitrator,
            text,
        );
        let envelope = self
            .envelope(trade_id, ProtocolMessage::Chat(chat.clone()))
            .with_uid(chat.uid.clone());
        let recipients: &[Role] = match is_arbitrator {
            true => &[Role::Maker, Role::Taker],
            false => &[Role::Arbitrator],
        };
        for to in recipients {
            match self.send(&trade, *to, &envelope).await {
                DeliveryOutcome::Delivered => chat.arrived = true,
                DeliveryOutcome::Queued => chat.stored_in_mailbox = true,
                DeliveryOutcome::Failed(reason) => chat.send_failed = Some(reason),
            }
        }

        if let Some(mut dispute) = self.dispute(trade_id) {
            dispute.push_chat(chat.clone());
            self.save(&dispute);
        }
        Ok(chat)
    }

    // -----------------------------------------------------------------------
    // Arbitrator actions
    // -----------------------------------------------------------------------

    /// Decides a dispute. For arbitration and refund this builds the payout
    /// (cost charged to the loser), signs it and sends it to both traders;
    /// a mediation result is sent unsigned and moves nothing.
    pub async fn resolve_dispute(
        &self,
        trade_id: &str,
        result: DisputeResult,
    ) -> Result<Dispute, DisputeError> {
        let trade = self.trade(trade_id)?;
        if trade.role != Role::Arbitrator {
            return Err(DisputeError::WrongRole {
                expected: "the arbitrator",
                action: "resolve a dispute",
            });
        }
        let mut dispute = self
            .dispute(trade_id)
            .ok_or_else(|| DisputeError::UnknownDispute(trade_id.to_string()))?;
        if !dispute.is_open() {
            return Err(DisputeError::Closed(trade_id.to_string()));
        }

        let (payout_tx_hex, payout_tx_hash) = if dispute.support_type.pays_out() {
            let (hex, hash) = self.build_dispute_payout(&trade, &result).await?;
            (Some(hex), Some(hash))
        } else {
            (None, None)
        };

        let envelope = self.envelope(
            trade_id,
            ProtocolMessage::DisputeResult(DisputeResultMessage {
                dispute_id: dispute.id.clone(),
                result: result.clone(),
                payout_tx_hex,
            }),
        );
        let mut delivered = 0;
        for to in [Role::Maker, Role::Taker] {
            if self.send(&trade, to, &envelope).await.is_accepted() {
                delivered += 1;
            }
        }
        if delivered == 0 {
            return Err(DisputeError::Delivery(
                "result reached neither trader".into(),
            ));
        }

        info!(
            trade_id,
            winner = %result.winner,
            buyer_amount = result.buyer_amount,
            seller_amount = result.seller_amount,
            "dispute resolved"
        );
        if dispute.support_type.pays_out() {
            dispute.close(result);
            self.save(&dispute);
            self.trades
                .update_dispute(trade_id, DisputeUpdate::Closed { payout_tx_hash: payout_tx_hash.clone() })
                .await?;
            self.emit(DisputeEvent::Closed {
                trade_id: trade_id.to_string(),
                payout_tx_hash,
            });
        } else {
            dispute.result = Some(result);
            self.save(&dispute);
            self.trades
                .update_dispute(trade_id, DisputeUpdate::MediationResultReceived)
                .await?;
        }
        Ok(dispute)
    }

    /// Builds, checks and signs the payout for `result`. Returns the
    /// signed hex and the transaction hash.
    async fn build_dispute_payout(
        &self,
        trade: &Trade,
        result: &DisputeResult,
    ) -> Result<(String, String), DisputeError> {
        let wallet = &self.services().wallet;
        let terms = trade
            .payout_terms()
            .map_err(|e| DisputeError::NoContract(format!("{}: {e}", trade.id)))?;
        let allocation = allocation_of(result);
        let (destinations, fee_from) = allocation.proposal(&terms)?;
        let multisig = trade.multisig()?;

        let balance = wallet.multisig_balance(&trade.id).await?;
        let built = wallet
            .create_multisig_payout(&trade.id, &destinations, &fee_from)
            .await?;
        let described = wallet.describe_tx(&built.hex).await?;
        let split = verify_dispute_payout_tx(&described, &terms, &allocation, balance, multisig)?;
        let signed = wallet.sign_multisig_tx(&trade.id, &built.hex).await?;
        debug!(
            trade_id = %trade.id,
            buyer_amount = split.buyer_amount,
            seller_amount = split.seller_amount,
            tx_cost = split.tx_cost,
            "dispute payout signed"
        );
        Ok((signed, described.hash))
    }

    // -----------------------------------------------------------------------
    // Inbound
    // -----------------------------------------------------------------------

    /// Entry point for dispute-domain messages and acks of our dispute
    /// messages.
    pub async fn handle(&self, message: InboundMessage) {
        if let Applied::Defer = self.apply(&message).await {
            let outcome = self.pending.lock().push(message.clone());
            match outcome {
                DeferOutcome::Queued => {
                    debug!(trade_id = %message.trade_id(), kind = %message.kind(), "dispute message deferred")
                }
                DeferOutcome::Duplicate => {}
                DeferOutcome::Full => {
                    warn!(trade_id = %message.trade_id(), kind = %message.kind(), "dispute deferred queue full");
                    self.services()
                        .ack(&message, false, Some("unknown dispute".into()))
                        .await;
                }
            }
        }
    }

    /// Retries deferred messages; drops those past their budget.
    pub async fn retry_pending(&self) {
        let (expired, entries) = {
            let mut pending = self.pending.lock();
            (pending.expire(Instant::now()), pending.take_all())
        };
        for entry in expired {
            warn!(
                trade_id = %entry.message.trade_id(),
                kind = %entry.message.kind(),
                attempts = entry.attempts,
                "dispute message discarded"
            );
            self.services()
                .ack(&entry.message, false, Some("unknown dispute".into()))
                .await;
        }
        for entry in entries {
            if let Applied::Defer = self.apply(&entry.message).await {
                let message = entry.message.clone();
                if self.pending.lock().requeue(entry) == DeferOutcome::Full {
                    self.services()
                        .ack(&message, false, Some("unknown dispute".into()))
                        .await;
                }
            }
        }
    }

    async fn apply(&self, message: &InboundMessage) -> Applied {
        let trade_id = message.trade_id().to_string();
        let Some(trade) = self.trades.snapshot(&trade_id) else {
            return match message.kind() {
                MessageKind::Ack => Applied::Done,
                _ => Applied::Defer,
            };
        };
        let Some(from) = sender_role(&trade, message) else {
            warn!(trade_id = %trade_id, kind = %message.kind(), sender = %message.sender(), "dispute message from a stranger");
            if message.kind() != MessageKind::Ack {
                self.services()
                    .ack(message, false, Some("sender is not a party to this trade".into()))
                    .await;
            }
            return Applied::Done;
        };

        let result = match &message.envelope.message {
            ProtocolMessage::OpenNewDispute(m) => self.on_open_new_dispute(&trade, from, m).await,
            ProtocolMessage::PeerOpenedDispute(m) => self.on_peer_opened(&trade, from, m).await,
            ProtocolMessage::ArbitratorPayoutTxRequest(m) => {
                self.on_payout_tx_request(&trade, from, m).await
            }
            ProtocolMessage::ArbitratorPayoutTxResponse(m) => {
                self.on_payout_tx_response(&trade, from, m).await
            }
            ProtocolMessage::Chat(m) => match self.disputes.contains_key(&trade_id) {
                true => self.on_chat(&trade_id, m),
                false => return Applied::Defer,
            },
            // A result can overtake the notice of the dispute it answers,
            // including one that replaces a mediation.
            ProtocolMessage::DisputeResult(m) => match self.dispute(&trade_id) {
                Some(d) if d.id == m.dispute_id || !d.is_escalatable() => {
                    self.on_dispute_result(&trade, from, m).await
                }
                _ => return Applied::Defer,
            },
            ProtocolMessage::Ack(ack) => {
                self.on_ack(&trade, from, ack).await;
                return Applied::Done;
            }
            _ => return Applied::Done,
        };

        match result {
            Ok(()) => self.services().ack(message, true, None).await,
            Err(e) => {
                warn!(trade_id = %trade_id, kind = %message.kind(), error = %e, "dispute message rejected");
                self.services().ack(message, false, Some(e.to_string())).await;
            }
        }
        Applied::Done
    }

    async fn on_open_new_dispute(
        &self,
        trade: &Trade,
        from: Role,
        message: &OpenNewDispute,
    ) -> Result<(), DisputeError> {
        if trade.role != Role::Arbitrator {
            return Err(DisputeError::WrongRole {
                expected: "the arbitrator",
                action: "accept a dispute",
            });
        }
        let expected_side = trade.side_of(from);
        if expected_side != Some(message.dispute.opener_side) {
            return Err(DisputeError::WrongRole {
                expected: "the opener's own side",
                action: "open a dispute",
            });
        }
        let contract = trade
            .contract
            .as_ref()
            .ok_or_else(|| DisputeError::NoContract(trade.id.clone()))?;
        if contract.hash() != message.dispute.contract_hash {
            return Err(DisputeError::Escrow(crate::escrow::EscrowError::HashMismatch {
                what: "contract",
                expected: contract.hash(),
                actual: message.dispute.contract_hash.clone(),
            }));
        }
        if let Some(current) = self.dispute(&trade.id).filter(|d| d.is_open()) {
            let escalation = current.id != message.dispute.id
                && current.is_escalatable()
                && message.dispute.support_type.pays_out();
            if !escalation {
                debug!(trade_id = %trade.id, "dispute already open");
                return Ok(());
            }
            info!(trade_id = %trade.id, mediation = %current.id, "mediated dispute escalated");
        }

        let dispute = Dispute {
            is_opener: false,
            ..message.dispute.clone()
        };
        self.save(&dispute);
        self.trades
            .update_dispute(&trade.id, DisputeUpdate::Opened)
            .await?;
        info!(trade_id = %trade.id, opener = %from, support = %dispute.support_type, "dispute opened");
        self.emit(DisputeEvent::Opened {
            trade_id: trade.id.clone(),
            support_type: dispute.support_type,
        });

        let peer = match from {
            Role::Maker => Role::Taker,
            _ => Role::Maker,
        };
        let notice = self.envelope(
            &trade.id,
            ProtocolMessage::PeerOpenedDispute(PeerOpenedDispute {
                dispute: dispute.clone(),
            }),
        );
        self.send(trade, peer, &notice).await;

        let request = self.envelope(
            &trade.id,
            ProtocolMessage::ArbitratorPayoutTxRequest(ArbitratorPayoutTxRequest {
                dispute_id: dispute.id.clone(),
            }),
        );
        for to in [Role::Maker, Role::Taker] {
            self.send(trade, to, &request).await;
        }
        Ok(())
    }

    async fn on_peer_opened(
        &self,
        trade: &Trade,
        from: Role,
        message: &PeerOpenedDispute,
    ) -> Result<(), DisputeError> {
        expect_arbitrator(from)?;
        if self.disputes.get(&trade.id).is_some_and(|d| d.id == message.dispute.id) {
            return Ok(());
        }
        let dispute = Dispute {
            is_opener: false,
            ..message.dispute.clone()
        };
        self.save(&dispute);
        self.trades
            .update_dispute(&trade.id, DisputeUpdate::Opened)
            .await?;
        info!(trade_id = %trade.id, opener = %dispute.opener_side, "peer opened a dispute");
        Ok(())
    }

    async fn on_payout_tx_request(
        &self,
        trade: &Trade,
        from: Role,
        message: &ArbitratorPayoutTxRequest,
    ) -> Result<(), DisputeError> {
        expect_arbitrator(from)?;
        let updated_multisig_hex = self
            .services()
            .wallet
            .export_multisig_hex(&trade.id)
            .await?;
        let response = self.envelope(
            &trade.id,
            ProtocolMessage::ArbitratorPayoutTxResponse(ArbitratorPayoutTxResponse {
                dispute_id: message.dispute_id.clone(),
                updated_multisig_hex,
            }),
        );
        if let DeliveryOutcome::Failed(reason) = self.send(trade, Role::Arbitrator, &response).await {
            return Err(DisputeError::Delivery(reason));
        }
        Ok(())
    }

    async fn on_payout_tx_response(
        &self,
        trade: &Trade,
        from: Role,
        message: &ArbitratorPayoutTxResponse,
    ) -> Result<(), DisputeError> {
        if trade.role != Role::Arbitrator {
            return Err(DisputeError::WrongRole {
                expected: "the arbitrator",
                action: "collect multisig state",
            });
        }
        let outputs = self
            .services()
            .wallet
            .import_multisig_hex(&trade.id, std::slice::from_ref(&message.updated_multisig_hex))
            .await?;
        debug!(trade_id = %trade.id, from = %from, outputs, "dispute multisig state imported");
        Ok(())
    }

    fn on_chat(&self, trade_id: &str, message: &ChatMessage) -> Result<(), DisputeError> {
        let Some(mut dispute) = self.dispute(trade_id) else {
            return Err(DisputeError::UnknownDispute(trade_id.to_string()));
        };
        let chat = ChatMessage {
            arrived: true,
            ..message.clone()
        };
        if dispute.push_chat(chat) {
            self.save(&dispute);
        }
        Ok(())
    }

    async fn on_dispute_result(
        &self,
        trade: &Trade,
        from: Role,
        message: &DisputeResultMessage,
    ) -> Result<(), DisputeError> {
        expect_arbitrator(from)?;
        let Some(mut dispute) = self.dispute(&trade.id) else {
            return Err(DisputeError::UnknownDispute(trade.id.clone()));
        };
        if dispute.id != message.dispute_id {
            return Err(DisputeError::UnknownDispute(format!(
                "{} (result for {}, current is {})",
                trade.id, message.dispute_id, dispute.id
            )));
        }
        if !dispute.is_open() || dispute.is_escalatable() {
            return Ok(());
        }
        self.emit(DisputeEvent::ResultReceived {
            trade_id: trade.id.clone(),
            support_type: dispute.support_type,
        });

        if !dispute.support_type.pays_out() {
            info!(trade_id = %trade.id, winner = %message.result.winner, "mediation result received");
            dispute.result = Some(message.result.clone());
            self.save(&dispute);
            self.trades
                .update_dispute(&trade.id, DisputeUpdate::MediationResultReceived)
                .await?;
            return Ok(());
        }

        let payout_hex = message
            .payout_tx_hex
            .as_deref()
            .ok_or_else(|| DisputeError::Delivery("dispute result without payout".into()))?;
        let hash = self.publish_dispute_payout(trade, &message.result, payout_hex).await?;

        dispute.close(message.result.clone());
        self.save(&dispute);
        self.trades
            .update_dispute(
                &trade.id,
                DisputeUpdate::Closed {
                    payout_tx_hash: Some(hash.clone()),
                },
            )
            .await?;
        info!(trade_id = %trade.id, payout = %hash, "dispute closed");
        self.emit(DisputeEvent::Closed {
            trade_id: trade.id.clone(),
            payout_tx_hash: Some(hash),
        });
        Ok(())
    }

    /// Checks, co-signs and relays the arbitrator's payout. A payout the
    /// other trader already relayed counts as published.
    async fn publish_dispute_payout(
        &self,
        trade: &Trade,
        result: &DisputeResult,
        payout_hex: &str,
    ) -> Result<String, DisputeError> {
        let wallet = &self.services().wallet;
        let described = wallet.describe_tx(payout_hex).await?;
        if wallet.tx_confirmations(&described.hash).await?.is_some() {
            debug!(trade_id = %trade.id, payout = %described.hash, "dispute payout already relayed");
            return Ok(described.hash);
        }

        let terms = trade
            .payout_terms()
            .map_err(|e| DisputeError::NoContract(format!("{}: {e}", trade.id)))?;
        let balance = wallet.multisig_balance(&trade.id).await?;
        verify_dispute_payout_tx(
            &described,
            &terms,
            &allocation_of(result),
            balance,
            trade.multisig()?,
        )?;
        let signed = wallet.sign_multisig_tx(&trade.id, payout_hex).await?;
        Ok(wallet.submit_multisig_tx(&trade.id, &signed).await?)
    }

    async fn on_ack(&self, trade: &Trade, from: Role, ack: &AckMessage) {
        match ack.source_kind {
            MessageKind::OpenNewDispute if from == Role::Arbitrator => {
                if ack.success {
                    if let Err(e) = self
                        .trades
                        .update_dispute(&trade.id, DisputeUpdate::Opened)
                        .await
                    {
                        warn!(trade_id = %trade.id, error = %e, "could not mark dispute opened");
                    }
                } else {
                    warn!(trade_id = %trade.id, error = ?ack.error, "arbitrator refused the dispute");
                }
            }
            MessageKind::Chat => {
                let Some(mut dispute) = self.dispute(&trade.id) else {
                    return;
                };
                let Some(chat) = dispute.chat_mut(&ack.source_uid) else {
                    return;
                };
                chat.acknowledged = ack.success;
                chat.ack_error = ack.error.clone();
                self.save(&dispute);
            }
            kind => {
                if !ack.success {
                    warn!(trade_id = %trade.id, kind = %kind, from = %from, error = ?ack.error, "dispute message rejected by peer");
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Escalation
    // -----------------------------------------------------------------------

    /// Opens an arbitration dispute for every trade that reports a fatal
    /// verification failure.
    pub async fn run_escalations(
        self: Arc<Self>,
        mut events: broadcast::Receiver<TradeEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Ok(TradeEvent::EscalationRequired { trade_id, reason }) => {
                        let open = self.disputes.get(&trade_id).is_some_and(|d| d.is_open());
                        if !open {
                            if let Err(e) = self
                                .open_dispute(&trade_id, SupportType::Arbitration, reason)
                                .await
                            {
                                error!(trade_id = %trade_id, error = %e, "escalation failed");
                            }
                        }
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "escalation listener lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                _ = shutdown.changed() => break,
            }
        }
    }
}

fn allocation_of(result: &DisputeResult) -> DisputeAllocation {
    DisputeAllocation {
        buyer_wins: result.winner == Side::Buyer,
        buyer_gross: result.buyer_amount,
        seller_gross: result.seller_amount,
    }
}

fn sender_role(trade: &Trade, message: &InboundMessage) -> Option<Role> {
    let role = trade.role_at(message.sender())?;
    (role != trade.role && trade.peer(role).pub_key == Some(message.envelope.sender_pub_key))
        .then_some(role)
}

fn expect_arbitrator(from: Role) -> Result<(), DisputeError> {
    match from {
        Role::Arbitrator => Ok(()),
        _ => Err(DisputeError::WrongRole {
            expected: "the arbitrator",
            action: "send this",
        }),
    }
}
