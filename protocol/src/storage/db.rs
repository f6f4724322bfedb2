//! # TradeDb: sled-backed trade store
//!
//! ## Tree Layout
//!
//! | Tree            | Key               | Value               |
//! |-----------------|-------------------|---------------------|
//! | `trades`        | trade id (UTF-8)  | `bincode(Trade)`    |
//! | `closed_trades` | trade id (UTF-8)  | `bincode(Trade)`    |
//! | `offers`        | offer id (UTF-8)  | `bincode(OpenOffer)`|
//! | `disputes`      | trade id (UTF-8)  | `bincode(Dispute)`  |
//!
//! Archiving a trade removes it from `trades` and inserts it into
//! `closed_trades` in one sled transaction, so a crash never leaves a
//! trade in both trees or in neither.

use serde::de::DeserializeOwned;
use serde::Serialize;
use sled::transaction::{ConflictableTransactionError, TransactionError};
use sled::{Db, Transactional, Tree};
use std::path::Path;

use super::TradeStore;
use crate::dispute::Dispute;
use crate::offer::OpenOffer;
use crate::trade::Trade;

// ---------------------------------------------------------------------------
// Error Type
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum DbError {
    #[error("sled error: {0}")]
    Sled(#[from] sled::Error),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("key not found: {0}")]
    NotFound(String),
}

pub type DbResult<T> = Result<T, DbError>;

fn encode<T: Serialize>(value: &T) -> DbResult<Vec<u8>> {
    bincode::serialize(value).map_err(|e| DbError::Serialization(e.to_string()))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> DbResult<T> {
    bincode::deserialize(bytes).map_err(|e| DbError::Serialization(e.to_string()))
}

fn load_all<T: DeserializeOwned>(tree: &Tree) -> DbResult<Vec<T>> {
    tree.iter()
        .values()
        .map(|value| decode(&value?))
        .collect()
}

// ---------------------------------------------------------------------------
// TradeDb
// ---------------------------------------------------------------------------

/// sled is thread-safe; share a `TradeDb` through `Arc` without extra
/// locking.
#[derive(Debug, Clone)]
pub struct TradeDb {
    db: Db,
    trades: Tree,
    closed_trades: Tree,
    offers: Tree,
    disputes: Tree,
}

impl TradeDb {
    /// Opens or creates a database directory.
    pub fn open<P: AsRef<Path>>(path: P) -> DbResult<Self> {
        let db = sled::open(path)?;
        Self::from_db(db)
    }

    /// In-memory database, removed on drop. For tests.
    pub fn open_temporary() -> DbResult<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::from_db(db)
    }

    fn from_db(db: Db) -> DbResult<Self> {
        Ok(Self {
            trades: db.open_tree("trades")?,
            closed_trades: db.open_tree("closed_trades")?,
            offers: db.open_tree("offers")?,
            disputes: db.open_tree("disputes")?,
            db,
        })
    }

    pub fn get_trade(&self, id: &str) -> DbResult<Trade> {
        match self.trades.get(id.as_bytes())? {
            Some(bytes) => decode(&bytes),
            None => Err(DbError::NotFound(id.to_string())),
        }
    }

    pub fn trade_count(&self) -> usize {
        self.trades.len()
    }

    pub fn closed_trade_count(&self) -> usize {
        self.closed_trades.len()
    }

    /// Blocks until pending writes are durable.
    pub fn flush(&self) -> DbResult<()> {
        self.db.flush()?;
        Ok(())
    }
}

impl TradeStore for TradeDb {
    fn save_trade(&self, trade: &Trade) -> DbResult<()> {
        self.trades.insert(trade.id.as_bytes(), encode(trade)?)?;
        Ok(())
    }

    fn load_trades(&self) -> DbResult<Vec<Trade>> {
        load_all(&self.trades)
    }

    fn archive_trade(&self, trade: &Trade) -> DbResult<()> {
        let key = trade.id.as_bytes();
        let value = encode(trade)?;
        (&self.trades, &self.closed_trades)
            .transaction(|(trades, closed)| {
                trades.remove(key)?;
                closed.insert(key, value.as_slice())?;
                Ok::<(), ConflictableTransactionError<()>>(())
            })
            .map_err(|e| match e {
                TransactionError::Storage(e) => DbError::Sled(e),
                TransactionError::Abort(()) => {
                    DbError::Serialization(format!("archiving {} aborted", trade.id))
                }
            })?;
        self.db.flush()?;
        Ok(())
    }

    fn load_closed_trades(&self) -> DbResult<Vec<Trade>> {
        load_all(&self.closed_trades)
    }

    fn save_offer(&self, offer: &OpenOffer) -> DbResult<()> {
        self.offers.insert(offer.id().as_bytes(), encode(offer)?)?;
        Ok(())
    }

    fn load_offers(&self) -> DbResult<Vec<OpenOffer>> {
        load_all(&self.offers)
    }

    fn save_dispute(&self, dispute: &Dispute) -> DbResult<()> {
        self.disputes
            .insert(dispute.trade_id.as_bytes(), encode(dispute)?)?;
        Ok(())
    }

    fn load_disputes(&self) -> DbResult<Vec<Dispute>> {
        load_all(&self.disputes)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
