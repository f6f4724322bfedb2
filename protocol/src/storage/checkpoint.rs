//! Coalescing checkpoint writer.
//!
//! Actors call [`CheckpointWriter::request`] after every change and move
//! on. Requests for the same entity overwrite each other until the flush
//! loop runs, so a burst of ten transitions costs one write.

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tracing::{debug, error};

use super::{DbResult, TradeStore};
use crate::dispute::Dispute;
use crate::offer::OpenOffer;
use crate::trade::Trade;

#[derive(Debug, Clone)]
pub enum Checkpoint {
    Trade(Box<Trade>),
    /// Final snapshot; moves the trade to closed storage.
    ClosedTrade(Box<Trade>),
    Offer(OpenOffer),
    Dispute(Dispute),
}

impl Checkpoint {
    /// Coalescing key. An open and a closed snapshot of the same trade
    /// share one, so the newer always wins.
    fn key(&self) -> String {
        match self {
            Checkpoint::Trade(t) | Checkpoint::ClosedTrade(t) => format!("trade/{}", t.id),
            Checkpoint::Offer(o) => format!("offer/{}", o.id()),
            Checkpoint::Dispute(d) => format!("dispute/{}", d.trade_id),
        }
    }

    fn write(&self, store: &dyn TradeStore) -> DbResult<()> {
        match self {
            Checkpoint::Trade(t) => store.save_trade(t),
            Checkpoint::ClosedTrade(t) => store.archive_trade(t),
            Checkpoint::Offer(o) => store.save_offer(o),
            Checkpoint::Dispute(d) => store.save_dispute(d),
        }
    }
}

pub struct CheckpointWriter {
    store: Arc<dyn TradeStore>,
    pending: DashMap<String, Checkpoint>,
    notify: Notify,
    written: AtomicU64,
}

impl CheckpointWriter {
    pub fn new(store: Arc<dyn TradeStore>) -> Arc<Self> {
        Arc::new(Self {
            store,
            pending: DashMap::new(),
            notify: Notify::new(),
            written: AtomicU64::new(0),
        })
    }

    pub fn store(&self) -> &Arc<dyn TradeStore> {
        &self.store
    }

    /// Fire-and-forget.
    pub fn request(&self, checkpoint: Checkpoint) {
        self.pending.insert(checkpoint.key(), checkpoint);
        self.notify.notify_one();
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Total snapshots written so far.
    pub fn written(&self) -> u64 {
        self.written.load(Ordering::Relaxed)
    }

    /// Writes everything pending now. Returns how many snapshots were
    /// written; failures are logged and dropped.
    pub fn flush(&self) -> usize {
        let keys: Vec<String> = self.pending.iter().map(|e| e.key().clone()).collect();
        let mut written = 0;
        for key in keys {
            let Some((_, checkpoint)) = self.pending.remove(&key) else {
                continue;
            };
            match checkpoint.write(self.store.as_ref()) {
                Ok(()) => written += 1,
                Err(e) => error!(key = %key, error = %e, "checkpoint write failed"),
            }
        }
        if written > 0 {
            self.written.fetch_add(written as u64, Ordering::Relaxed);
            debug!(written, "checkpoints flushed");
        }
        written
    }

    /// Flush loop: waits for a request, lets the coalescing window pass,
    /// writes. Flushes once more on shutdown.
    pub async fn run(self: Arc<Self>, window: Duration, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                _ = self.notify.notified() => {
                    tokio::select! {
                        _ = tokio::time::sleep(window) => {}
                        _ = shutdown.changed() => break,
                    }
                    self.flush();
                }
                _ = shutdown.changed() => break,
            }
        }
        self.flush();
    }
}
