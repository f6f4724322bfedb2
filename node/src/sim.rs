//! # Three-Party Sandbox
//!
//! A maker, a taker and an arbitrator, each with its own [`Runtime`],
//! wallet and store, wired over one [`LocalNetwork`] and one
//! [`SimulatedChain`]. A miner task advances the chain on a fixed
//! interval so confirmations and unlocks happen on their own.
//!
//! Party keys are derived from the party name, so a sandbox restarted on
//! the same data directory finds its trades again.

use anyhow::{Context, Result};
use parking_lot::Mutex;
use serde::Deserialize;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use xmrx_protocol::config::{ProtocolConfig, PROTOCOL_VERSION};
use xmrx_protocol::crypto::{blake3_hash, NodeKeypair};
use xmrx_protocol::network::{LocalNetwork, NodeAddress};
use xmrx_protocol::offer::{OfferDirection, OfferError, OfferPayload, OpenOffer};
use xmrx_protocol::storage::{MemoryStore, TradeDb, TradeStore};
use xmrx_protocol::trade::{Trade, TradeError};
use xmrx_protocol::wallet::{SimulatedChain, SimulatedWallet, XmrWallet};
use xmrx_protocol::Runtime;

pub const PARTY_NAMES: [&str; 3] = ["maker", "taker", "arbitrator"];

pub struct Party {
    pub name: &'static str,
    pub runtime: Arc<Runtime>,
    pub wallet: Arc<SimulatedWallet>,
}

impl Party {
    pub fn address(&self) -> &NodeAddress {
        self.runtime.services().address()
    }
}

/// Terms for a new maker offer, as posted to `POST /offers`.
#[derive(Debug, Clone, Deserialize)]
pub struct NewOffer {
    pub direction: OfferDirection,
    /// Atomic units.
    pub amount: u64,
    pub min_amount: Option<u64>,
    pub price: u64,
    #[serde(default = "default_currency")]
    pub currency_code: String,
    #[serde(default = "default_payment_method")]
    pub payment_method: String,
}

fn default_currency() -> String {
    "EUR".to_string()
}

fn default_payment_method() -> String {
    "SEPA".to_string()
}

pub struct Sandbox {
    pub config: ProtocolConfig,
    pub network: Arc<LocalNetwork>,
    pub chain: Arc<SimulatedChain>,
    pub maker: Party,
    pub taker: Party,
    pub arbitrator: Party,
    stop_miner: watch::Sender<bool>,
    miner: Mutex<Option<JoinHandle<()>>>,
}

impl Sandbox {
    /// Builds and starts all three parties. With `data_dir`, each party
    /// persists to `<data_dir>/<party>`; otherwise state is in memory.
    /// The maker and the taker are credited `fund` atomic units.
    pub async fn start(
        config: ProtocolConfig,
        data_dir: Option<&Path>,
        fund: u64,
        block_interval: Option<Duration>,
    ) -> Result<Arc<Self>> {
        let network = LocalNetwork::new();
        let chain = SimulatedChain::new();

        let mut parties = Vec::with_capacity(PARTY_NAMES.len());
        for name in PARTY_NAMES {
            let store: Arc<dyn TradeStore> = match data_dir {
                Some(dir) => {
                    let path = dir.join(name);
                    Arc::new(
                        TradeDb::open(&path)
                            .with_context(|| format!("opening store at {}", path.display()))?,
                    )
                }
                None => Arc::new(MemoryStore::new()),
            };
            let (channel, events) =
                network.register(NodeAddress::new(format!("{name}.sandbox.onion")));
            let wallet = Arc::new(SimulatedWallet::new(chain.clone(), format!("{name}-wallet")));
            let keys = NodeKeypair::from_seed(&blake3_hash(
                format!("xmrx-sandbox-{name}").as_bytes(),
            ));
            let runtime = Runtime::new(config.clone(), keys, wallet.clone(), Arc::new(channel), store);
            runtime
                .start(events)
                .with_context(|| format!("starting {name}"))?;
            parties.push(Party {
                name,
                runtime,
                wallet,
            });
        }

        if fund > 0 {
            for party in &parties[..2] {
                chain.fund(&party.wallet.primary_address(), fund);
            }
        }
        let mut parties = parties.into_iter();
        let (Some(maker), Some(taker), Some(arbitrator)) =
            (parties.next(), parties.next(), parties.next())
        else {
            anyhow::bail!("sandbox needs three parties");
        };

        let (stop_miner, stopped) = watch::channel(false);
        let sandbox = Arc::new(Self {
            config,
            network,
            chain,
            maker,
            taker,
            arbitrator,
            stop_miner,
            miner: Mutex::new(None),
        });
        if let Some(interval) = block_interval {
            let miner = tokio::spawn(mine_blocks(sandbox.chain.clone(), interval, stopped));
            *sandbox.miner.lock() = Some(miner);
        }
        info!(
            maker = %sandbox.maker.address(),
            taker = %sandbox.taker.address(),
            arbitrator = %sandbox.arbitrator.address(),
            "sandbox started"
        );
        Ok(sandbox)
    }

    pub fn parties(&self) -> [&Party; 3] {
        [&self.maker, &self.taker, &self.arbitrator]
    }

    pub fn party(&self, name: &str) -> Option<&Party> {
        self.parties().into_iter().find(|p| p.name == name)
    }

    /// The maker's payload for `terms`, naming the sandbox arbitrator.
    pub fn offer_payload(&self, terms: &NewOffer) -> OfferPayload {
        let maker = self.maker.runtime.services();
        let arbitrator = self.arbitrator.runtime.services();
        OfferPayload {
            id: uuid::Uuid::new_v4().to_string(),
            maker_node: maker.address().clone(),
            maker_pub_key: maker.pub_key(),
            arbitrator_node: arbitrator.address().clone(),
            arbitrator_pub_key: arbitrator.pub_key(),
            direction: terms.direction,
            amount: terms.amount,
            min_amount: terms.min_amount.unwrap_or(terms.amount),
            price: terms.price,
            currency_code: terms.currency_code.clone(),
            payment_method: terms.payment_method.clone(),
            security_deposit_bps: self.config.security_deposit_bps,
            min_security_deposit: self.config.min_security_deposit,
            maker_fee_bps: self.config.maker_fee_bps,
            taker_fee_bps: self.config.taker_fee_bps,
            protocol_version: PROTOCOL_VERSION.to_string(),
            created_at_ms: chrono::Utc::now().timestamp_millis(),
        }
    }

    /// Reserves the maker's funds and sends the offer for signing. The
    /// returned offer is not takeable until the arbitrator answers.
    pub async fn place_offer(&self, terms: &NewOffer) -> Result<OpenOffer, OfferError> {
        let payload = self.offer_payload(terms);
        self.maker.runtime.offers().place_offer(payload).await
    }

    /// The taker takes a signed maker offer. The sandbox has no offer
    /// broadcast, so the signed offer is read straight from the maker's book.
    pub async fn take_offer(&self, offer_id: &str, amount: u64) -> Result<Trade, TradeError> {
        let offer = self
            .maker
            .runtime
            .offers()
            .signed_offer(offer_id)
            .ok_or_else(|| TradeError::UnknownTrade(offer_id.to_string()))?;
        self.taker.runtime.trades().take_offer(offer, amount).await
    }

    pub fn mine(&self, blocks: u64) {
        self.chain.mine(blocks);
    }

    /// Stops the miner and every party, flushing their stores.
    pub async fn shutdown(&self) {
        let _ = self.stop_miner.send(true);
        let miner = self.miner.lock().take();
        if let Some(miner) = miner {
            let _ = miner.await;
        }
        for party in self.parties() {
            party.runtime.shutdown().await;
        }
        info!("sandbox stopped");
    }
}

async fn mine_blocks(chain: Arc<SimulatedChain>, interval: Duration, mut stop: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                chain.mine(1);
                debug!(height = chain.height(), "block mined");
            }
            _ = stop.changed() => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use xmrx_protocol::config::ATOMIC_UNITS_PER_XMR as XMR;
    use xmrx_protocol::trade::TradeState;

    async fn wait_for<F: Fn() -> bool>(what: &str, check: F) {
        for _ in 0..500 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("timed out waiting for {what}");
    }

    #[tokio::test]
    async fn sandbox_trade_reaches_unlock() {
        let sandbox = Sandbox::start(ProtocolConfig::fast(), None, 100 * XMR, None)
            .await
            .unwrap();
        let offer = sandbox
            .place_offer(&NewOffer {
                direction: OfferDirection::Sell,
                amount: 5 * XMR,
                min_amount: Some(XMR),
                price: 150_00,
                currency_code: default_currency(),
                payment_method: default_payment_method(),
            })
            .await
            .unwrap();
        let id = offer.id().to_string();
        wait_for("signed offer", || {
            sandbox.maker.runtime.offers().signed_offer(&id).is_some()
        })
        .await;

        sandbox.take_offer(&id, 2 * XMR).await.unwrap();
        let taker = sandbox.taker.runtime.trades().clone();
        wait_for("deposits published", || {
            taker
                .snapshot(&id)
                .is_some_and(|t| t.state >= TradeState::DepositTxsPublished)
        })
        .await;

        sandbox.mine(sandbox.config.unlock_confirmations + 1);
        wait_for("unlock", || {
            taker
                .snapshot(&id)
                .is_some_and(|t| t.state >= TradeState::DepositTxsUnlocked)
        })
        .await;
        sandbox.shutdown().await;
    }

    #[tokio::test]
    async fn take_unknown_offer_fails() {
        let sandbox = Sandbox::start(ProtocolConfig::fast(), None, 0, None).await.unwrap();
        assert!(matches!(
            sandbox.take_offer("nope", XMR).await,
            Err(TradeError::UnknownTrade(_))
        ));
        assert!(sandbox.party("arbitrator").is_some());
        assert!(sandbox.party("mallory").is_none());
        sandbox.shutdown().await;
    }
}
