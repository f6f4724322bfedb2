//! # Storage Module
//!
//! Trades, offers and disputes survive restarts through [`TradeStore`].
//! The protocol never writes synchronously from a trade actor: actors hand
//! snapshots to the [`checkpoint::CheckpointWriter`], which coalesces them
//! per entity and writes the newest one.
//!
//! ```text
//! trade actor ─┐
//! offer book  ─┼─▶ CheckpointWriter ──(flush loop)──▶ TradeStore
//! disputes    ─┘   newest snapshot per id              ├─ TradeDb (sled)
//!                                                      └─ MemoryStore
//! ```
//!
//! Values are bincode. JSON is for the API; bincode is for storage.

pub mod checkpoint;
pub mod db;

use parking_lot::RwLock;
use std::collections::BTreeMap;

use crate::dispute::Dispute;
use crate::offer::OpenOffer;
use crate::trade::Trade;

pub use checkpoint::{Checkpoint, CheckpointWriter};
pub use db::{DbError, DbResult, TradeDb};

/// Persistence seam of the settlement core.
pub trait TradeStore: Send + Sync {
    fn save_trade(&self, trade: &Trade) -> DbResult<()>;

    fn load_trades(&self) -> DbResult<Vec<Trade>>;

    /// Moves a finished trade from the open set to the closed set.
    fn archive_trade(&self, trade: &Trade) -> DbResult<()>;

    fn load_closed_trades(&self) -> DbResult<Vec<Trade>>;

    fn save_offer(&self, offer: &OpenOffer) -> DbResult<()>;

    fn load_offers(&self) -> DbResult<Vec<OpenOffer>>;

    fn save_dispute(&self, dispute: &Dispute) -> DbResult<()>;

    fn load_disputes(&self) -> DbResult<Vec<Dispute>>;
}

/// Volatile store for tests and the sandbox.
#[derive(Debug, Default)]
pub struct MemoryStore {
    trades: RwLock<BTreeMap<String, Trade>>,
    closed: RwLock<BTreeMap<String, Trade>>,
    offers: RwLock<BTreeMap<String, OpenOffer>>,
    disputes: RwLock<BTreeMap<String, Dispute>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TradeStore for MemoryStore {
    fn save_trade(&self, trade: &Trade) -> DbResult<()> {
        self.trades.write().insert(trade.id.clone(), trade.clone());
        Ok(())
    }

    fn load_trades(&self) -> DbResult<Vec<Trade>> {
        Ok(self.trades.read().values().cloned().collect())
    }

    fn archive_trade(&self, trade: &Trade) -> DbResult<()> {
        self.trades.write().remove(&trade.id);
        self.closed.write().insert(trade.id.clone(), trade.clone());
        Ok(())
    }

    fn load_closed_trades(&self) -> DbResult<Vec<Trade>> {
        Ok(self.closed.read().values().cloned().collect())
    }

    fn save_offer(&self, offer: &OpenOffer) -> DbResult<()> {
        self.offers.write().insert(offer.id().to_string(), offer.clone());
        Ok(())
    }

    fn load_offers(&self) -> DbResult<Vec<OpenOffer>> {
        Ok(self.offers.read().values().cloned().collect())
    }

    fn save_dispute(&self, dispute: &Dispute) -> DbResult<()> {
        self.disputes
            .write()
            .insert(dispute.trade_id.clone(), dispute.clone());
        Ok(())
    }

    fn load_disputes(&self) -> DbResult<Vec<Dispute>> {
        Ok(self.disputes.read().values().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trade::model::tests::sample_trade;
    use crate::trade::Role;

    #[test]
    fn test_memory_store_archive_moves_trade() {
        let store = MemoryStore::new();
        let trade = sample_trade(Role::Taker);
        store.save_trade(&trade).unwrap();
        assert_eq!(store.load_trades().unwrap().len(), 1);

        store.archive_trade(&trade).unwrap();
        assert!(store.load_trades().unwrap().is_empty());
        assert_eq!(store.load_closed_trades().unwrap(), vec![trade]);
    }
}
