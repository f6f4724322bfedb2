//! # Runtime
//!
//! The process-lifetime owner of one node's settlement core. It builds the
//! shared services, restores persisted state, and runs four loops until
//! [`Runtime::shutdown`]:
//!
//! | Loop        | Does                                                        |
//! |-------------|-------------------------------------------------------------|
//! | pump        | reads [`NetworkEvent`]s and routes them by message domain   |
//! | tick        | retries orphaned trade messages and deferred dispute ones   |
//! | checkpoint  | coalesces and writes snapshots to the [`TradeStore`]        |
//! | escalation  | opens a dispute for trades that failed verification        |
//!
//! Trade actors run their own redelivery tick; the runtime only owns
//! what spans trades.

use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

use crate::config::ProtocolConfig;
use crate::crypto::NodeKeypair;
use crate::dispute::DisputeCoordinator;
use crate::network::ordering::sort_batch;
use crate::network::messages::MessageDomain;
use crate::network::{InboundMessage, MessageChannel, NetworkEvent, ProtocolMessage};
use crate::offer::OfferBook;
use crate::services::Services;
use crate::storage::{CheckpointWriter, DbResult, TradeStore};
use crate::trade::TradeManager;
use crate::wallet::XmrWallet;

pub struct Runtime {
    services: Arc<Services>,
    checkpoints: Arc<CheckpointWriter>,
    offers: Arc<OfferBook>,
    trades: Arc<TradeManager>,
    disputes: Arc<DisputeCoordinator>,
    shutdown: watch::Sender<bool>,
    loops: Mutex<Vec<JoinHandle<()>>>,
}

impl Runtime {
    pub fn new(
        config: ProtocolConfig,
        keys: NodeKeypair,
        wallet: Arc<dyn XmrWallet>,
        channel: Arc<dyn MessageChannel>,
        store: Arc<dyn TradeStore>,
    ) -> Arc<Self> {
        let (shutdown, signal) = watch::channel(false);
        let services = Services::new(config, keys, wallet, channel);
        let checkpoints = CheckpointWriter::new(store);
        let offers = Arc::new(OfferBook::new(services.clone(), checkpoints.clone()));
        let trades = TradeManager::new(
            services.clone(),
            offers.clone(),
            checkpoints.clone(),
            signal,
        );
        let disputes = DisputeCoordinator::new(trades.clone(), checkpoints.clone());
        Arc::new(Self {
            services,
            checkpoints,
            offers,
            trades,
            disputes,
            shutdown,
            loops: Mutex::new(Vec::new()),
        })
    }

    pub fn services(&self) -> &Arc<Services> {
        &self.services
    }

    pub fn offers(&self) -> &Arc<OfferBook> {
        &self.offers
    }

    pub fn trades(&self) -> &Arc<TradeManager> {
        &self.trades
    }

    pub fn disputes(&self) -> &Arc<DisputeCoordinator> {
        &self.disputes
    }

    pub fn checkpoints(&self) -> &Arc<CheckpointWriter> {
        &self.checkpoints
    }

    /// Restores persisted offers, trades and disputes, then starts the
    /// background loops reading from `events`.
    pub fn start(self: &Arc<Self>, events: mpsc::UnboundedReceiver<NetworkEvent>) -> DbResult<()> {
        let store = self.checkpoints.store().clone();
        let offers = store.load_offers()?;
        let open = store.load_trades()?;
        let closed = store.load_closed_trades()?;
        let disputes = store.load_disputes()?;
        info!(
            node = %self.services.address(),
            offers = offers.len(),
            open_trades = open.len(),
            closed_trades = closed.len(),
            disputes = disputes.len(),
            "starting runtime"
        );
        self.offers.restore(offers);
        self.trades.restore(open, closed);
        self.disputes.restore(disputes);

        let signal = self.shutdown.subscribe();
        let mut loops = self.loops.lock();
        loops.push(tokio::spawn(self.clone().pump(events, signal.clone())));
        loops.push(tokio::spawn(self.clone().tick(signal.clone())));
        loops.push(tokio::spawn(self.checkpoints.clone().run(
            self.services.config.checkpoint_flush_interval(),
            signal.clone(),
        )));
        loops.push(tokio::spawn(
            self.disputes
                .clone()
                .run_escalations(self.trades.subscribe(), signal),
        ));
        Ok(())
    }

    /// Routes one inbound message to the subsystem that owns its kind.
    pub async fn deliver(&self, message: InboundMessage) {
        let domain = match &message.envelope.message {
            ProtocolMessage::Ack(ack) => ack.source_kind.domain(),
            other => other.kind().domain(),
        };
        debug!(
            trade_id = %message.trade_id(),
            kind = %message.kind(),
            uid = %message.uid(),
            via_mailbox = message.via_mailbox,
            "inbound"
        );
        match domain {
            MessageDomain::Offer => self.offers.handle(message).await,
            MessageDomain::Trade => self.trades.route(message).await,
            MessageDomain::Dispute => self.disputes.handle(message).await,
            MessageDomain::Ack => debug!(uid = %message.uid(), "ack of an ack dropped"),
        }
    }

    /// Applies a mailbox flush in sequence order.
    pub async fn deliver_batch(&self, mut batch: Vec<InboundMessage>) {
        sort_batch(&mut batch);
        for message in batch {
            self.deliver(message).await;
        }
    }

    async fn pump(
        self: Arc<Self>,
        mut events: mpsc::UnboundedReceiver<NetworkEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(NetworkEvent::Message(message)) => self.deliver(message).await,
                    Some(NetworkEvent::MailboxBatch(batch)) => {
                        debug!(messages = batch.len(), "mailbox flushed");
                        self.deliver_batch(batch).await;
                    }
                    None => break,
                },
                _ = shutdown.changed() => break,
            }
        }
    }

    async fn tick(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.services.config.redelivery_interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.trades.retry_orphans().await;
                    self.disputes.retry_pending().await;
                }
                _ = shutdown.changed() => break,
            }
        }
    }

    /// Signals every loop and actor, waits for them, and flushes pending
    /// checkpoints.
    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        self.trades.shutdown().await;
        let loops = std::mem::take(&mut *self.loops.lock());
        for handle in loops {
            if let Err(e) = handle.await {
                error!(error = %e, "runtime loop panicked");
            }
        }
        let written = self.checkpoints.flush();
        info!(node = %self.services.address(), written, "runtime stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::LocalNetwork;
    use crate::network::NodeAddress;
    use crate::storage::MemoryStore;
    use crate::trade::model::tests::sample_trade;
    use crate::trade::Role;
    use crate::wallet::{SimulatedChain, SimulatedWallet};

    #[tokio::test]
    async fn test_start_restores_and_shutdown_flushes() {
        let network = LocalNetwork::new();
        let chain = SimulatedChain::new();
        let (channel, events) = network.register(NodeAddress::new("taker.onion"));
        let store = Arc::new(MemoryStore::new());
        let trade = sample_trade(Role::Taker);
        store.save_trade(&trade).unwrap();

        let runtime = Runtime::new(
            ProtocolConfig::fast(),
            NodeKeypair::from_seed(&[5u8; 32]),
            Arc::new(SimulatedWallet::new(chain, "taker.onion")),
            Arc::new(channel),
            store.clone(),
        );
        runtime.start(events).unwrap();
        assert_eq!(runtime.trades().active_count(), 1);

        runtime.shutdown().await;
        assert_eq!(runtime.trades().active_count(), 1);
        assert_eq!(store.load_trades().unwrap().len(), 1);
    }
}
