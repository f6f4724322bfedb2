//! # Trade Manager
//!
//! Owns one actor task per open trade. The actor is the only writer of its
//! [`Trade`]; everything that can move a trade reaches it as a command on
//! its inbox, so at most one pipeline runs per trade at any time.
//!
//! ```text
//!  route(msg) ──────┐
//!  take_offer ──────┤                ┌─▶ acceptance: Accept ─▶ pipeline ─▶ ack
//!  confirm_* ───────┼─▶ actor inbox ─┤               Defer  ─▶ deferred queue
//!  update_dispute ──┘                │               Stale  ─▶ ack, ignore
//!                     tick ─────────▶└─▶ expire / resend / chain polling
//! ```
//!
//! Messages for trades we do not know yet (an offline peer's mailbox
//! flushed out of order) wait in a node-wide orphan queue until the trade
//! appears. Closed trades leave the actor map and are kept read-only.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::context::TradeContext;
use super::model::{Role, Side, Trade, TradePeer};
use super::protocol::{tasks_for, Trigger};
use super::state::{acceptance, Acceptance, DisputeState, MediationResultState, PayoutState, TradePhase, TradeState};
use super::tasks::{key_image_holder, TradeTask};
use super::TradeError;
use crate::network::{
    DeferOutcome, DeferredEntry, DeferredQueue, InboundMessage, MessageKind, ProtocolMessage,
};
use crate::offer::{OfferBook, SignedOffer, TradeAmounts};
use crate::pipeline::{InterceptHook, PipelineFailure, PipelineOutcome, TaskError, TaskPipeline};
use crate::services::Services;
use crate::storage::{Checkpoint, CheckpointWriter};

const EVENT_CAPACITY: usize = 1024;

/// Observable trade lifecycle, for metrics, the API and the dispute
/// coordinator.
#[derive(Debug, Clone, PartialEq)]
pub enum TradeEvent {
    Started {
        trade_id: String,
        role: Role,
    },
    StateChanged {
        trade_id: String,
        from: TradeState,
        to: TradeState,
    },
    PipelineFailed {
        trade_id: String,
        task: &'static str,
        error: String,
    },
    /// A verification failure after the contract was signed. Retrying will
    /// not help; the trade needs a dispute.
    EscalationRequired {
        trade_id: String,
        reason: String,
    },
    MessageDiscarded {
        trade_id: String,
        uid: String,
        kind: MessageKind,
    },
    Closed {
        trade_id: String,
    },
}

/// Dispute progress reported by the dispute coordinator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisputeUpdate {
    Requested,
    Opened,
    Closed { payout_tx_hash: Option<String> },
    MediationResultReceived,
}

type Reply = oneshot::Sender<Result<Trade, TradeError>>;

enum Command {
    Start(Reply),
    Inbound(InboundMessage),
    ConfirmPaymentSent(Reply),
    ConfirmPaymentReceived(Reply),
    Dispute(DisputeUpdate, Reply),
}

struct ActorHandle {
    inbox: mpsc::UnboundedSender<Command>,
    snapshot: Arc<RwLock<Trade>>,
}

pub struct TradeManager {
    services: Arc<Services>,
    offers: Arc<OfferBook>,
    checkpoints: Arc<CheckpointWriter>,
    actors: DashMap<String, ActorHandle>,
    closed: DashMap<String, Trade>,
    events: broadcast::Sender<TradeEvent>,
    intercept: RwLock<Option<InterceptHook<TradeTask>>>,
    orphans: Mutex<DeferredQueue>,
    shutdown: watch::Receiver<bool>,
    joins: Mutex<Vec<JoinHandle<()>>>,
}

impl TradeManager {
    pub fn new(
        services: Arc<Services>,
        offers: Arc<OfferBook>,
        checkpoints: Arc<CheckpointWriter>,
        shutdown: watch::Receiver<bool>,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let orphans = DeferredQueue::from_config(&services.config);
        Arc::new(Self {
            services,
            offers,
            checkpoints,
            actors: DashMap::new(),
            closed: DashMap::new(),
            events,
            intercept: RwLock::new(None),
            orphans: Mutex::new(orphans),
            shutdown,
            joins: Mutex::new(Vec::new()),
        })
    }

    pub fn services(&self) -> &Arc<Services> {
        &self.services
    }

    pub fn offers(&self) -> &Arc<OfferBook> {
        &self.offers
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TradeEvent> {
        self.events.subscribe()
    }

    /// Installs (or clears) a hook consulted before every trade task.
    pub fn set_intercept(&self, hook: Option<InterceptHook<TradeTask>>) {
        *self.intercept.write() = hook;
    }

    fn emit(&self, event: TradeEvent) {
        let _ = self.events.send(event);
    }

    // -----------------------------------------------------------------------
    // Entry points
    // -----------------------------------------------------------------------

    /// Takes a signed offer for `trade_amount`. Resolves once the start
    /// pipeline has run: the returned trade is in `InitTradeRequested`, or
    /// the error says why it stopped.
    pub async fn take_offer(
        self: &Arc<Self>,
        offer: SignedOffer,
        trade_amount: u64,
    ) -> Result<Trade, TradeError> {
        offer.verify_arbitrator_signature()?;
        let id = offer.id().to_string();
        let me = self.services.address();
        if offer.payload.maker_node == *me || offer.payload.arbitrator_node == *me {
            return Err(TradeError::OwnOffer(id));
        }
        if self.closed.contains_key(&id) {
            return Err(TradeError::AlreadyExists(id));
        }
        let amounts = TradeAmounts::compute(&offer.payload, trade_amount)?;

        let mut trade = Trade::new(Role::Taker, offer, amounts);
        trade.taker = TradePeer {
            payout_address: Some(self.services.wallet.primary_address()),
            ..TradePeer::identified(me.clone(), self.services.pub_key())
        };
        let inbox = self.spawn(trade)?;
        info!(trade_id = %id, trade_amount, "taking offer");
        self.emit(TradeEvent::Started {
            trade_id: id.clone(),
            role: Role::Taker,
        });

        let (reply, response) = oneshot::channel();
        inbox
            .send(Command::Start(reply))
            .map_err(|_| TradeError::ActorGone(id.clone()))?;
        response.await.map_err(|_| TradeError::ActorGone(id))?
    }

    /// Hands a trade-domain message (or an ack) to the trade it belongs to.
    pub async fn route(self: &Arc<Self>, message: InboundMessage) {
        let id = message.trade_id().to_string();
        let kind = message.kind();

        let inbox = self.actors.get(&id).map(|h| h.inbox.clone());
        let message = match inbox {
            Some(inbox) => match inbox.send(Command::Inbound(message)) {
                Ok(()) => return,
                // The actor finished between lookup and send.
                Err(mpsc::error::SendError(Command::Inbound(message))) => message,
                Err(_) => return,
            },
            None => message,
        };

        if self.closed.contains_key(&id) {
            if kind != MessageKind::Ack {
                debug!(trade_id = %id, kind = %kind, "message for closed trade");
                self.services.ack(&message, true, None).await;
            }
            return;
        }

        match kind {
            MessageKind::InitTradeRequest => self.create_from_init(message).await,
            MessageKind::Ack => {
                debug!(trade_id = %id, uid = %message.uid(), "ack for unknown trade dropped")
            }
            _ => self.park_orphan(message).await,
        }
    }

    pub async fn confirm_payment_sent(&self, trade_id: &str) -> Result<Trade, TradeError> {
        self.command(trade_id, "confirm payment sent", Command::ConfirmPaymentSent)
            .await
    }

    pub async fn confirm_payment_received(&self, trade_id: &str) -> Result<Trade, TradeError> {
        self.command(trade_id, "confirm payment received", Command::ConfirmPaymentReceived)
            .await
    }

    pub async fn update_dispute(
        &self,
        trade_id: &str,
        update: DisputeUpdate,
    ) -> Result<Trade, TradeError> {
        self.command(trade_id, "update dispute", |reply| Command::Dispute(update, reply))
            .await
    }

    async fn command(
        &self,
        trade_id: &str,
        action: &'static str,
        make: impl FnOnce(Reply) -> Command,
    ) -> Result<Trade, TradeError> {
        let Some(inbox) = self.actors.get(trade_id).map(|h| h.inbox.clone()) else {
            return Err(match self.closed.contains_key(trade_id) {
                true => TradeError::NotReady {
                    id: trade_id.to_string(),
                    state: TradeState::Closed,
                    action,
                },
                false => TradeError::UnknownTrade(trade_id.to_string()),
            });
        };
        let (reply, response) = oneshot::channel();
        inbox
            .send(make(reply))
            .map_err(|_| TradeError::ActorGone(trade_id.to_string()))?;
        response
            .await
            .map_err(|_| TradeError::ActorGone(trade_id.to_string()))?
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    /// Latest published snapshot of an open or closed trade.
    pub fn snapshot(&self, trade_id: &str) -> Option<Trade> {
        self.actors
            .get(trade_id)
            .map(|h| h.snapshot.read().clone())
            .or_else(|| self.closed.get(trade_id).map(|t| t.clone()))
    }

    /// Open trades.
    pub fn trades(&self) -> Vec<Trade> {
        let mut trades: Vec<Trade> = self
            .actors
            .iter()
            .map(|h| h.snapshot.read().clone())
            .collect();
        trades.sort_by_key(|t| t.created_at_ms);
        trades
    }

    pub fn closed_trades(&self) -> Vec<Trade> {
        let mut trades: Vec<Trade> = self.closed.iter().map(|t| t.clone()).collect();
        trades.sort_by_key(|t| t.updated_at_ms);
        trades
    }

    pub fn active_count(&self) -> usize {
        self.actors.len()
    }

    pub fn orphan_count(&self) -> usize {
        self.orphans.lock().len()
    }

    // -----------------------------------------------------------------------
    // Actors
    // -----------------------------------------------------------------------

    fn spawn(self: &Arc<Self>, trade: Trade) -> Result<mpsc::UnboundedSender<Command>, TradeError> {
        let (inbox, commands) = mpsc::unbounded_channel();
        let snapshot = Arc::new(RwLock::new(trade.clone()));
        match self.actors.entry(trade.id.clone()) {
            Entry::Occupied(_) => return Err(TradeError::AlreadyExists(trade.id)),
            Entry::Vacant(slot) => {
                slot.insert(ActorHandle {
                    inbox: inbox.clone(),
                    snapshot: snapshot.clone(),
                });
            }
        }
        self.checkpoints
            .request(Checkpoint::Trade(Box::new(trade.clone())));

        let deferred = DeferredQueue::from_config(&self.services.config);
        let actor = TradeActor {
            manager: self.clone(),
            trade,
            deferred,
            snapshot,
            commands,
        };
        let join = tokio::spawn(actor.run());
        let mut joins = self.joins.lock();
        joins.retain(|j| !j.is_finished());
        joins.push(join);
        Ok(inbox)
    }

    /// Creates the maker's or arbitrator's side of a trade from the
    /// request that opens it.
    async fn create_from_init(self: &Arc<Self>, message: InboundMessage) {
        let ProtocolMessage::InitTradeRequest(request) = &message.envelope.message else {
            return;
        };
        let id = message.trade_id().to_string();
        let payload = &request.offer.payload;
        let me = self.services.pub_key();

        let role = if payload.arbitrator_pub_key == me {
            Role::Arbitrator
        } else if payload.maker_pub_key == me {
            Role::Maker
        } else {
            warn!(trade_id = %id, "init request for an offer we are not part of");
            self.services
                .ack(&message, false, Some("not a party to this offer".into()))
                .await;
            return;
        };
        if id != request.offer.id() {
            self.services
                .ack(&message, false, Some("trade id does not match offer".into()))
                .await;
            return;
        }
        if role == Role::Maker && self.offers.open_offer(&id).and_then(|o| o.signed).is_none() {
            self.services
                .ack(&message, false, Some(format!("no open offer {id}")))
                .await;
            return;
        }
        let amounts = match TradeAmounts::compute(payload, request.trade_amount) {
            Ok(amounts) => amounts,
            Err(e) => {
                self.services.ack(&message, false, Some(e.to_string())).await;
                return;
            }
        };

        let trade = Trade::new(role, request.offer.clone(), amounts);
        match self.spawn(trade) {
            Ok(inbox) => {
                info!(trade_id = %id, role = %role, "trade created from init request");
                self.emit(TradeEvent::Started {
                    trade_id: id,
                    role,
                });
                let _ = inbox.send(Command::Inbound(message));
            }
            Err(_) => {
                // Lost a race with a concurrent request for the same id.
                if let Some(inbox) = self.actors.get(&id).map(|h| h.inbox.clone()) {
                    let _ = inbox.send(Command::Inbound(message));
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Orphans
    // -----------------------------------------------------------------------

    async fn park_orphan(&self, message: InboundMessage) {
        let outcome = self.orphans.lock().push(message.clone());
        match outcome {
            DeferOutcome::Queued => {
                debug!(trade_id = %message.trade_id(), kind = %message.kind(), "message for unknown trade parked")
            }
            DeferOutcome::Duplicate => {}
            DeferOutcome::Full => {
                warn!(trade_id = %message.trade_id(), kind = %message.kind(), "orphan queue full");
                self.services
                    .ack(&message, false, Some("unknown trade".into()))
                    .await;
            }
        }
    }

    /// Hands parked messages to trades that appeared since, and drops
    /// those that waited too long.
    pub async fn retry_orphans(self: &Arc<Self>) {
        let (expired, entries) = {
            let mut orphans = self.orphans.lock();
            (orphans.expire(Instant::now()), orphans.take_all())
        };

        for entry in expired {
            let message = entry.message;
            warn!(
                trade_id = %message.trade_id(),
                kind = %message.kind(),
                attempts = entry.attempts,
                "discarding message for unknown trade"
            );
            self.emit(TradeEvent::MessageDiscarded {
                trade_id: message.trade_id().to_string(),
                uid: message.uid().to_string(),
                kind: message.kind(),
            });
            self.services
                .ack(&message, false, Some("unknown trade".into()))
                .await;
        }

        for entry in entries {
            let id = entry.message.trade_id().to_string();
            if self.actors.contains_key(&id) || self.closed.contains_key(&id) {
                self.route(entry.message).await;
                continue;
            }
            let outcome = self.orphans.lock().requeue(entry.clone());
            if outcome == DeferOutcome::Full {
                self.services
                    .ack(&entry.message, false, Some("unknown trade".into()))
                    .await;
            }
        }
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Re-creates actors for persisted trades after a restart.
    pub fn restore(self: &Arc<Self>, open: Vec<Trade>, closed: Vec<Trade>) {
        for trade in closed {
            self.closed.insert(trade.id.clone(), trade);
        }
        for trade in open {
            if !trade.is_open() {
                self.closed.insert(trade.id.clone(), trade);
                continue;
            }
            let before_deposits = trade.effective_state() < TradeState::DepositTxsPublished;
            match trade.role {
                Role::Taker if before_deposits => {
                    if let Some(reserve) = trade.taker.reserve_tx.clone() {
                        self.services.reservations.restore(&trade.id, reserve);
                    }
                }
                Role::Arbitrator if before_deposits => {
                    if let Some(reserve) = &trade.taker.reserve_tx {
                        let holder = key_image_holder(&trade.id, Role::Taker);
                        if let Err(e) = self.services.key_images.claim(&holder, &reserve.key_images) {
                            warn!(trade_id = %trade.id, error = %e, "restored trade conflicts with another claim");
                        }
                    }
                }
                _ => {}
            }
            let id = trade.id.clone();
            let state = trade.state;
            match self.spawn(trade) {
                Ok(_) => info!(trade_id = %id, state = %state, "trade restored"),
                Err(e) => warn!(trade_id = %id, error = %e, "trade not restored"),
            }
        }
    }

    /// Waits for every actor to drain its inbox and stop. The shutdown
    /// signal itself belongs to the runtime.
    pub async fn shutdown(&self) {
        let joins = std::mem::take(&mut *self.joins.lock());
        for join in joins {
            if let Err(e) = join.await {
                error!(error = %e, "trade actor panicked");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Actor
// ---------------------------------------------------------------------------

struct TradeActor {
    manager: Arc<TradeManager>,
    trade: Trade,
    deferred: DeferredQueue,
    snapshot: Arc<RwLock<Trade>>,
    commands: mpsc::UnboundedReceiver<Command>,
}

impl TradeActor {
    fn services(&self) -> &Arc<Services> {
        &self.manager.services
    }

    async fn run(mut self) {
        let mut tick = tokio::time::interval(self.services().config.redelivery_interval());
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut shutdown = self.manager.shutdown.clone();

        loop {
            if !self.trade.is_open() {
                self.finish().await;
                return;
            }
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => self.handle(command).await,
                    None => break,
                },
                _ = tick.tick() => self.on_tick().await,
                _ = shutdown.changed() => {
                    while let Ok(command) = self.commands.try_recv() {
                        self.handle(command).await;
                    }
                    break;
                }
            }
        }

        if !self.trade.is_open() {
            self.finish().await;
        } else {
            self.publish();
            debug!(trade_id = %self.trade.id, state = %self.trade.state, "trade actor stopped");
        }
    }

    async fn handle(&mut self, command: Command) {
        match command {
            Command::Start(reply) => {
                let result = self
                    .run_pipeline(Trigger::Start, None, None)
                    .await
                    .map(|()| self.trade.clone());
                let _ = reply.send(result);
            }
            Command::Inbound(message) => self.on_inbound(message).await,
            Command::ConfirmPaymentSent(reply) => {
                let result = self.confirm_payment_sent().await;
                let _ = reply.send(result);
            }
            Command::ConfirmPaymentReceived(reply) => {
                let result = self.confirm_payment_received().await;
                let _ = reply.send(result);
            }
            Command::Dispute(update, reply) => {
                self.apply_dispute_update(update);
                self.publish();
                let _ = reply.send(Ok(self.trade.clone()));
            }
        }
    }

    fn publish(&self) {
        *self.snapshot.write() = self.trade.clone();
        self.manager
            .checkpoints
            .request(Checkpoint::Trade(Box::new(self.trade.clone())));
    }

    fn transition(&mut self, to: TradeState) {
        let from = self.trade.state;
        match self.trade.advance(to) {
            Ok(true) => {
                info!(trade_id = %self.trade.id, role = %self.trade.role, from = %from, to = %to, "trade state changed");
                self.manager.emit(TradeEvent::StateChanged {
                    trade_id: self.trade.id.clone(),
                    from,
                    to,
                });
            }
            Ok(false) => {}
            Err(e) => error!(trade_id = %self.trade.id, error = %e, "illegal state transition"),
        }
    }

    // -----------------------------------------------------------------------
    // Pipelines
    // -----------------------------------------------------------------------

    async fn run_pipeline(
        &mut self,
        trigger: Trigger,
        inbound: Option<InboundMessage>,
        peer: Option<Role>,
    ) -> Result<(), TradeError> {
        let tasks = tasks_for(&self.trade, &trigger);
        if tasks.is_empty() {
            debug!(trade_id = %self.trade.id, trigger = %trigger, "nothing to run");
            return Ok(());
        }

        let mut ctx = TradeContext::new(
            self.trade.clone(),
            self.services().clone(),
            self.manager.offers.clone(),
            inbound,
            peer,
        );
        let hook = self.manager.intercept.read().clone();
        let outcome = TaskPipeline::new(format!("{}/{}", self.trade.id, trigger), tasks)
            .with_intercept(hook)
            .run(&mut ctx)
            .await;

        self.trade = ctx.trade;
        for (from, to) in ctx.transitions {
            self.manager.emit(TradeEvent::StateChanged {
                trade_id: self.trade.id.clone(),
                from,
                to,
            });
        }

        let result = match outcome {
            PipelineOutcome::Completed { .. } => Ok(()),
            PipelineOutcome::Failed(failure) => {
                self.on_failure(&failure).await;
                Err(TradeError::Pipeline {
                    task: failure.task,
                    error: failure.error.to_string(),
                })
            }
        };
        self.publish();
        result
    }

    async fn on_failure(&mut self, failure: &PipelineFailure) {
        let trade_id = self.trade.id.clone();
        self.manager.emit(TradeEvent::PipelineFailed {
            trade_id: trade_id.clone(),
            task: failure.task,
            error: failure.error.to_string(),
        });

        if failure.error.is_fatal()
            && self.trade.role != Role::Arbitrator
            && self.trade.contract.is_some()
            && self.trade.dispute_state == DisputeState::NoDispute
        {
            warn!(trade_id = %trade_id, task = failure.task, error = %failure.error, "trade needs a dispute");
            self.manager.emit(TradeEvent::EscalationRequired {
                trade_id,
                reason: format!("{}: {}", failure.task, failure.error),
            });
        }

        if self.trade.state == TradeState::InitTradeFailed {
            self.release_init().await;
        }
    }

    /// Gives back what a trade that never got going was holding.
    async fn release_init(&mut self) {
        let id = self.trade.id.clone();
        match self.trade.role {
            Role::Taker => {
                if self.services().reservations.get(&id).is_some() {
                    if let Err(e) = self.services().reservations.release(&id).await {
                        warn!(trade_id = %id, error = %e, "could not release reserved funds");
                    }
                }
            }
            Role::Maker => self.manager.offers.reopen(&id),
            Role::Arbitrator => self
                .services()
                .key_images
                .release_holder(&key_image_holder(&id, Role::Taker)),
        }
    }

    // -----------------------------------------------------------------------
    // Inbound
    // -----------------------------------------------------------------------

    async fn on_inbound(&mut self, message: InboundMessage) {
        let kind = message.kind();
        if kind == MessageKind::Ack {
            self.on_ack(&message).await;
            return;
        }
        if self.trade.is_processed(message.uid()) {
            debug!(trade_id = %self.trade.id, uid = %message.uid(), "duplicate message");
            self.services().ack(&message, true, None).await;
            return;
        }
        if self.deferred.contains(message.uid()) {
            return;
        }

        if kind == MessageKind::InitTradeRequest
            && self.trade.state == TradeState::InitTradeFailed
            && self.trade.role != Role::Taker
        {
            if let Err(reason) = self.reset_for_new_taker(&message) {
                self.services().ack(&message, false, Some(reason)).await;
                return;
            }
        }

        if let Err(reason) = self.check_sender(&message) {
            warn!(trade_id = %self.trade.id, kind = %kind, sender = %message.sender(), reason = %reason, "message rejected");
            self.services().ack(&message, false, Some(reason)).await;
            return;
        }

        let state = self.trade.effective_state();
        match acceptance(self.trade.role, self.trade.side(), state, kind) {
            Acceptance::Accept => {
                self.process(message).await;
                self.drain_deferred().await;
            }
            Acceptance::Defer => match self.deferred.push(message.clone()) {
                DeferOutcome::Queued => {
                    debug!(trade_id = %self.trade.id, kind = %kind, state = %state, "message deferred")
                }
                DeferOutcome::Duplicate => {}
                DeferOutcome::Full => {
                    warn!(trade_id = %self.trade.id, kind = %kind, "deferred queue full");
                    self.services()
                        .ack(&message, false, Some("deferred queue full".into()))
                        .await;
                }
            },
            Acceptance::Stale => {
                debug!(trade_id = %self.trade.id, kind = %kind, state = %state, "stale message ignored");
                self.services().ack(&message, true, None).await;
            }
        }
    }

    /// Seat of the sender, if it is who the trade says sits there.
    fn check_sender(&self, message: &InboundMessage) -> Result<Role, String> {
        if message.sender() == self.services().address() {
            return Err("message from ourselves".into());
        }
        if message.kind() == MessageKind::InitTradeRequest
            && self.trade.role == Role::Arbitrator
            && self.trade.taker.node.is_none()
        {
            return Ok(Role::Taker);
        }
        let role = self
            .trade
            .role_at(message.sender())
            .ok_or_else(|| "sender is not a party to this trade".to_string())?;
        if role == self.trade.role {
            return Err("sender claims our seat".into());
        }
        if self.trade.peer(role).pub_key != Some(message.envelope.sender_pub_key) {
            return Err(format!("{role} key mismatch"));
        }
        Ok(role)
    }

    /// A fresh init request after a failed start begins the trade anew.
    fn reset_for_new_taker(&mut self, message: &InboundMessage) -> Result<(), String> {
        let ProtocolMessage::InitTradeRequest(request) = &message.envelope.message else {
            return Err("expected InitTradeRequest".into());
        };
        let amounts = TradeAmounts::compute(&request.offer.payload, request.trade_amount)
            .map_err(|e| e.to_string())?;
        let mut fresh = Trade::new(self.trade.role, request.offer.clone(), amounts);
        fresh.processed_uids = std::mem::take(&mut self.trade.processed_uids);
        fresh.next_sequence = self.trade.next_sequence;
        fresh.created_at_ms = self.trade.created_at_ms;
        info!(trade_id = %self.trade.id, "restarting failed trade for a new init request");
        self.trade = fresh;
        self.deferred.take_all();
        Ok(())
    }

    /// Runs the pipeline for an accepted message and answers it. Returns
    /// whether the message was applied.
    async fn process(&mut self, message: InboundMessage) -> bool {
        let peer = match self.check_sender(&message) {
            Ok(peer) => peer,
            Err(reason) => {
                self.services().ack(&message, false, Some(reason)).await;
                return false;
            }
        };
        let trigger = Trigger::Inbound(message.kind());
        match self
            .run_pipeline(trigger, Some(message.clone()), Some(peer))
            .await
        {
            Ok(()) => {
                self.trade.mark_processed(message.uid());
                self.publish();
                self.services().ack(&message, true, None).await;
                true
            }
            Err(e) => {
                self.services()
                    .ack(&message, false, Some(e.to_string()))
                    .await;
                false
            }
        }
    }

    /// Retries deferred messages until a pass makes no progress.
    async fn drain_deferred(&mut self) {
        loop {
            if self.deferred.is_empty() || !self.trade.is_open() {
                return;
            }
            let mut progressed = false;
            for entry in self.deferred.take_all() {
                let kind = entry.message.kind();
                let state = self.trade.effective_state();
                match acceptance(self.trade.role, self.trade.side(), state, kind) {
                    Acceptance::Accept => {
                        debug!(trade_id = %self.trade.id, kind = %kind, attempts = entry.attempts, "applying deferred message");
                        progressed |= self.process(entry.message).await;
                    }
                    Acceptance::Stale => {
                        self.services().ack(&entry.message, true, None).await;
                    }
                    Acceptance::Defer => self.requeue(entry).await,
                }
            }
            if !progressed {
                return;
            }
        }
    }

    async fn requeue(&mut self, entry: DeferredEntry) {
        let message = entry.message.clone();
        if self.deferred.requeue(entry) == DeferOutcome::Full {
            self.services()
                .ack(&message, false, Some("deferred queue full".into()))
                .await;
        }
    }

    async fn on_ack(&mut self, message: &InboundMessage) {
        let ProtocolMessage::Ack(ack) = &message.envelope.message else {
            return;
        };
        let from = self.trade.role_at(message.sender());
        let Some(record) = self
            .trade
            .record_ack(&ack.source_uid, ack.success, ack.error.clone())
            .cloned()
        else {
            debug!(trade_id = %self.trade.id, uid = %ack.source_uid, "ack for unknown message");
            return;
        };
        if from != Some(record.to) {
            warn!(trade_id = %self.trade.id, uid = %ack.source_uid, "ack from the wrong peer");
            return;
        }

        if ack.success {
            debug!(trade_id = %self.trade.id, kind = %record.kind, from = %record.to, "message acked");
            if Some(record.to) == self.trade.counterparty_role() {
                match (record.kind, self.trade.state) {
                    (
                        MessageKind::PaymentSent,
                        TradeState::BuyerSentPaymentSentMsg | TradeState::BuyerStoredInMailboxPaymentSentMsg,
                    ) => self.transition(TradeState::PaymentSentAcked),
                    (
                        MessageKind::PaymentReceived,
                        TradeState::SellerSentPaymentReceivedMsg
                        | TradeState::SellerStoredInMailboxPaymentReceivedMsg,
                    ) => self.transition(TradeState::PaymentReceivedAcked),
                    _ => {}
                }
            }
        } else {
            let error = ack.error.clone().unwrap_or_default();
            warn!(trade_id = %self.trade.id, kind = %record.kind, from = %record.to, error = %error, "peer rejected message");
            let starting = matches!(
                record.kind,
                MessageKind::InitTradeRequest
                    | MessageKind::SignContractRequest
                    | MessageKind::SignContractResponse
            );
            if starting
                && self.trade.state.phase() == TradePhase::Init
                && !self.trade.state.is_failure()
            {
                let from_state = self.trade.state;
                self.trade.record_failure(
                    "PeerAck",
                    &TaskError::Precondition(format!("peer rejected {}: {error}", record.kind)),
                );
                self.manager.emit(TradeEvent::StateChanged {
                    trade_id: self.trade.id.clone(),
                    from: from_state,
                    to: self.trade.state,
                });
                self.release_init().await;
            }
        }
        self.publish();
    }

    // -----------------------------------------------------------------------
    // User actions
    // -----------------------------------------------------------------------

    fn not_ready(&self, action: &'static str) -> TradeError {
        TradeError::NotReady {
            id: self.trade.id.clone(),
            state: self.trade.state,
            action,
        }
    }

    async fn confirm_payment_sent(&mut self) -> Result<Trade, TradeError> {
        let state = self.trade.effective_state();
        if self.trade.side() != Some(Side::Buyer)
            || self.trade.dispute_state != DisputeState::NoDispute
            || !matches!(
                state,
                TradeState::DepositTxsUnlocked | TradeState::BuyerConfirmedPaymentSent
            )
        {
            return Err(self.not_ready("confirm payment sent"));
        }
        self.run_pipeline(Trigger::PaymentSentConfirmed, None, None)
            .await?;
        self.drain_deferred().await;
        Ok(self.trade.clone())
    }

    async fn confirm_payment_received(&mut self) -> Result<Trade, TradeError> {
        let state = self.trade.effective_state();
        if self.trade.side() != Some(Side::Seller)
            || self.trade.dispute_state != DisputeState::NoDispute
            || !matches!(
                state,
                TradeState::PaymentSentMsgReceived | TradeState::SellerConfirmedPaymentReceipt
            )
        {
            return Err(self.not_ready("confirm payment received"));
        }
        self.run_pipeline(Trigger::PaymentReceiptConfirmed, None, None)
            .await?;
        Ok(self.trade.clone())
    }

    fn apply_dispute_update(&mut self, update: DisputeUpdate) {
        let raise = |trade: &mut Trade, to: DisputeState| {
            trade.dispute_state = trade.dispute_state.max(to);
        };
        match update {
            DisputeUpdate::Requested => raise(&mut self.trade, DisputeState::DisputeRequested),
            DisputeUpdate::Opened => raise(&mut self.trade, DisputeState::DisputeOpened),
            DisputeUpdate::Closed { payout_tx_hash } => {
                raise(&mut self.trade, DisputeState::DisputeClosed);
                if let Some(hash) = payout_tx_hash {
                    self.trade.payout_tx_hash = Some(hash);
                    self.trade.payout_state = self.trade.payout_state.max(PayoutState::Published);
                }
            }
            DisputeUpdate::MediationResultReceived => {
                self.trade.mediation_result_state = MediationResultState::ResultReceived;
            }
        }
        self.trade.touch();
        info!(trade_id = %self.trade.id, dispute = ?self.trade.dispute_state, "dispute state updated");
    }

    // -----------------------------------------------------------------------
    // Tick
    // -----------------------------------------------------------------------

    async fn on_tick(&mut self) {
        for entry in self.deferred.expire(Instant::now()) {
            let message = entry.message;
            warn!(
                trade_id = %self.trade.id,
                kind = %message.kind(),
                uid = %message.uid(),
                attempts = entry.attempts,
                "deferred message discarded"
            );
            self.manager.emit(TradeEvent::MessageDiscarded {
                trade_id: self.trade.id.clone(),
                uid: message.uid().to_string(),
                kind: message.kind(),
            });
            self.services()
                .ack(&message, false, Some("not applicable in time".into()))
                .await;
        }
        self.drain_deferred().await;

        let state = self.trade.state;
        if state.is_send_failed() {
            if self.trade.resend_count < self.services().config.max_message_resends {
                self.trade.resend_count += 1;
                info!(trade_id = %self.trade.id, state = %state, attempt = self.trade.resend_count, "resending");
                let _ = self.run_pipeline(Trigger::Resend(state), None, None).await;
                if !self.trade.state.is_send_failed() {
                    self.trade.resend_count = 0;
                    self.publish();
                }
            }
        }

        if let Some(trigger) = self.watch_chain().await {
            if self.run_pipeline(trigger, None, None).await.is_ok() {
                self.drain_deferred().await;
            }
        }
    }

    async fn confirmations(&self, hash: &str) -> u64 {
        match self.services().wallet.tx_confirmations(hash).await {
            Ok(confirmations) => confirmations.unwrap_or(0),
            Err(e) => {
                debug!(trade_id = %self.trade.id, tx = hash, error = %e, "confirmation lookup failed");
                0
            }
        }
    }

    /// The chain event the trade is waiting for, if it happened.
    async fn watch_chain(&self) -> Option<Trigger> {
        if !self.trade.is_open() {
            return None;
        }
        if let Some(hash) = &self.trade.payout_tx_hash {
            if self.trade.payout_state < PayoutState::Confirmed && self.confirmations(hash).await >= 1 {
                return Some(Trigger::PayoutConfirmed);
            }
            return None;
        }

        let state = self.trade.effective_state();
        if state < TradeState::DepositTxsPublished {
            return None;
        }
        let (Some(maker), Some(taker)) = (
            self.trade.maker.deposit_tx_hash.clone(),
            self.trade.taker.deposit_tx_hash.clone(),
        ) else {
            return None;
        };
        let confirmations = self
            .confirmations(&maker)
            .await
            .min(self.confirmations(&taker).await);

        if self.trade.me().updated_multisig_hex.is_none() && confirmations >= 1 {
            return Some(Trigger::DepositsConfirmed);
        }
        if state == TradeState::DepositTxsConfirmed
            && confirmations >= self.services().config.unlock_confirmations
        {
            return Some(Trigger::DepositsUnlocked);
        }
        None
    }

    // -----------------------------------------------------------------------
    // Close
    // -----------------------------------------------------------------------

    async fn finish(&mut self) {
        let id = self.trade.id.clone();
        *self.snapshot.write() = self.trade.clone();
        self.manager
            .checkpoints
            .request(Checkpoint::ClosedTrade(Box::new(self.trade.clone())));
        self.manager.closed.insert(id.clone(), self.trade.clone());
        self.manager.actors.remove(&id);

        match self.trade.role {
            Role::Arbitrator => {
                let key_images = &self.services().key_images;
                key_images.release_holder(&key_image_holder(&id, Role::Maker));
                key_images.release_holder(&key_image_holder(&id, Role::Taker));
            }
            _ => self.services().reservations.forget(&id),
        }

        for entry in self.deferred.take_all() {
            self.services().ack(&entry.message, true, None).await;
        }
        self.commands.close();
        while let Ok(command) = self.commands.try_recv() {
            match command {
                Command::Inbound(message) if message.kind() != MessageKind::Ack => {
                    self.services().ack(&message, true, None).await;
                }
                Command::Inbound(_) => {}
                Command::Start(reply)
                | Command::ConfirmPaymentSent(reply)
                | Command::ConfirmPaymentReceived(reply)
                | Command::Dispute(_, reply) => {
                    let _ = reply.send(Err(self.not_ready("run")));
                }
            }
        }

        info!(trade_id = %id, role = %self.trade.role, "trade closed");
        self.manager.emit(TradeEvent::Closed { trade_id: id });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ProtocolConfig, ATOMIC_UNITS_PER_XMR as XMR};
    use crate::crypto::NodeKeypair;
    use crate::network::{Envelope, LocalNetwork, NodeAddress};
    use crate::storage::MemoryStore;
    use crate::trade::model::tests::sample_trade;
    use crate::wallet::{SimulatedChain, SimulatedWallet};
    use std::time::Duration;

    struct Harness {
        manager: Arc<TradeManager>,
        _events: mpsc::UnboundedReceiver<crate::network::NetworkEvent>,
        _shutdown: watch::Sender<bool>,
    }

    fn harness(seed: u8, name: &str) -> Harness {
        let network = LocalNetwork::new();
        let chain = SimulatedChain::new();
        let (channel, events) = network.register(NodeAddress::new(name));
        let wallet = Arc::new(SimulatedWallet::new(chain, name));
        let services = Services::new(
            ProtocolConfig::fast(),
            NodeKeypair::from_seed(&[seed; 32]),
            wallet,
            Arc::new(channel),
        );
        let checkpoints = CheckpointWriter::new(Arc::new(MemoryStore::new()));
        let offers = Arc::new(OfferBook::new(services.clone(), checkpoints.clone()));
        let (tx, rx) = watch::channel(false);
        Harness {
            manager: TradeManager::new(services, offers, checkpoints, rx),
            _events: events,
            _shutdown: tx,
        }
    }

    #[tokio::test]
    async fn test_taking_own_offer_is_refused() {
        // The sample offer's maker sits at maker.onion.
        let h = harness(1, "maker.onion");
        let offer = sample_trade(Role::Taker).offer;
        let err = h.manager.take_offer(offer, 2 * XMR).await.unwrap_err();
        assert!(matches!(err, TradeError::OwnOffer(id) if id == "offer-1"));
        assert_eq!(h.manager.active_count(), 0);
    }

    #[tokio::test]
    async fn test_unknown_commands_report_unknown_trade() {
        let h = harness(5, "taker.onion");
        let err = h.manager.confirm_payment_sent("nope").await.unwrap_err();
        assert!(matches!(err, TradeError::UnknownTrade(id) if id == "nope"));
        assert!(h.manager.snapshot("nope").is_none());
    }

    #[tokio::test]
    async fn test_message_for_unknown_trade_is_parked() {
        let h = harness(5, "taker.onion");
        let keys = NodeKeypair::from_seed(&[9u8; 32]);
        let envelope = Envelope::new(
            "later",
            NodeAddress::new("someone.onion"),
            keys.public_key(),
            4,
            ProtocolMessage::DepositsConfirmed(crate::network::messages::DepositsConfirmed {
                updated_multisig_hex: "00".into(),
            }),
        );
        let message = InboundMessage::new(envelope, true);
        h.manager.route(message.clone()).await;
        h.manager.route(message).await;
        assert_eq!(h.manager.orphan_count(), 1);
    }

    #[tokio::test]
    async fn test_restore_splits_open_and_closed() {
        let h = harness(5, "taker.onion");
        let open = sample_trade(Role::Taker);
        let mut closed = sample_trade(Role::Taker);
        closed.id = "done".into();
        closed.state = TradeState::Closed;

        h.manager.restore(vec![open.clone(), closed], Vec::new());
        assert_eq!(h.manager.active_count(), 1);
        assert_eq!(h.manager.closed_trades().len(), 1);
        assert_eq!(h.manager.snapshot(&open.id).map(|t| t.state), Some(open.state));

        let err = h.manager.confirm_payment_received("done").await.unwrap_err();
        assert!(matches!(err, TradeError::NotReady { state: TradeState::Closed, .. }));
    }

    #[tokio::test]
    async fn test_confirm_payment_sent_refused_before_unlock() {
        let h = harness(5, "taker.onion");
        let trade = sample_trade(Role::Taker);
        let id = trade.id.clone();
        h.manager.restore(vec![trade], Vec::new());

        let err = h.manager.confirm_payment_sent(&id).await.unwrap_err();
        assert!(matches!(err, TradeError::NotReady { action: "confirm payment sent", .. }));
    }

    #[tokio::test]
    async fn test_dispute_updates_only_move_forward() {
        let h = harness(5, "taker.onion");
        let trade = sample_trade(Role::Taker);
        let id = trade.id.clone();
        h.manager.restore(vec![trade], Vec::new());

        h.manager.update_dispute(&id, DisputeUpdate::Opened).await.unwrap();
        let trade = h.manager.update_dispute(&id, DisputeUpdate::Requested).await.unwrap();
        assert_eq!(trade.dispute_state, DisputeState::DisputeOpened);

        let trade = h
            .manager
            .update_dispute(
                &id,
                DisputeUpdate::Closed {
                    payout_tx_hash: Some("ab".into()),
                },
            )
            .await
            .unwrap();
        assert_eq!(trade.dispute_state, DisputeState::DisputeClosed);
        assert_eq!(trade.payout_state, PayoutState::Published);
        assert_eq!(trade.payout_tx_hash.as_deref(), Some("ab"));
    }

    #[tokio::test]
    async fn test_early_payment_received_is_deferred_then_discarded() {
        let h = harness(5, "taker.onion");
        let mut trade = sample_trade(Role::Taker);
        trade.advance(TradeState::DepositTxsUnlocked).unwrap();
        let id = trade.id.clone();
        h.manager.restore(vec![trade], Vec::new());
        let mut events = h.manager.subscribe();

        // The buyer has not sent PaymentSent yet.
        let seller = NodeKeypair::from_seed(&[1u8; 32]);
        let envelope = Envelope::new(
            &id,
            NodeAddress::new("maker.onion"),
            seller.public_key(),
            7,
            ProtocolMessage::PaymentReceived(crate::network::messages::PaymentReceived {
                signed_payout_tx_hex: None,
                payout_published: false,
                updated_multisig_hex: None,
            }),
        );
        let uid = envelope.uid.clone();
        h.manager.route(InboundMessage::new(envelope, false)).await;

        let discarded = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match events.recv().await {
                    Ok(TradeEvent::MessageDiscarded { uid, kind, .. }) => break (uid, kind),
                    Ok(_) => continue,
                    Err(e) => panic!("event stream ended: {e}"),
                }
            }
        })
        .await
        .expect("deferred message discarded");
        assert_eq!(discarded, (uid.clone(), MessageKind::PaymentReceived));

        let trade = h.manager.snapshot(&id).unwrap();
        assert_eq!(trade.state, TradeState::DepositTxsUnlocked);
        assert!(!trade.is_processed(&uid));
    }
}
