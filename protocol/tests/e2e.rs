//! End-to-end settlement tests.
//!
//! Three full runtimes (maker, taker, arbitrator) trade over one
//! in-process network and one simulated chain. Nothing is mocked below
//! the wallet: every message goes through the codec, every deposit and
//! payout is a chain transaction, and confirmations only happen when a
//! test mines blocks.
//!
//! The sample offer sells XMR, so the maker is the seller and the taker
//! is the buyer throughout.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use xmrx_protocol::config::{ProtocolConfig, ATOMIC_UNITS_PER_XMR as XMR, PROTOCOL_VERSION};
use xmrx_protocol::crypto::NodeKeypair;
use xmrx_protocol::dispute::{DisputeResult, DisputeStatus, SupportType};
use xmrx_protocol::escrow::{BuiltTx, Destination, ReserveTx, TxDescription, WalletOutput};
use xmrx_protocol::network::memory::DropFilter;
use xmrx_protocol::network::messages::{PaymentReceived, PaymentSent};
use xmrx_protocol::network::{
    Envelope, InboundMessage, LocalNetwork, NodeAddress, ProtocolMessage,
};
use xmrx_protocol::offer::{OfferDirection, OfferPayload};
use xmrx_protocol::storage::MemoryStore;
use xmrx_protocol::trade::{Role, Side, Trade, TradeEvent, TradeState};
use xmrx_protocol::wallet::{SimulatedChain, SimulatedWallet, WalletError, XmrWallet};
use xmrx_protocol::Runtime;

const FUND: u64 = 50 * XMR;
const TRADE_AMOUNT: u64 = 2 * XMR;

// ---------------------------------------------------------------------------
// Test Helpers
// ---------------------------------------------------------------------------

/// A simulated wallet whose multisig export can be switched to fail.
struct FaultyWallet {
    inner: Arc<SimulatedWallet>,
    fail_exports: AtomicBool,
}

#[async_trait]
impl XmrWallet for FaultyWallet {
    fn primary_address(&self) -> String {
        self.inner.primary_address()
    }

    async fn unspent_outputs(&self) -> Result<Vec<WalletOutput>, WalletError> {
        self.inner.unspent_outputs().await
    }

    async fn freeze_outputs(&self, key_images: &[String]) -> Result<(), WalletError> {
        self.inner.freeze_outputs(key_images).await
    }

    async fn thaw_outputs(&self, key_images: &[String]) -> Result<(), WalletError> {
        self.inner.thaw_outputs(key_images).await
    }

    async fn create_reserve_tx(
        &self,
        inputs: &[String],
        reserved_amount: u64,
        trade_fee: u64,
        fee_address: &str,
    ) -> Result<ReserveTx, WalletError> {
        self.inner
            .create_reserve_tx(inputs, reserved_amount, trade_fee, fee_address)
            .await
    }

    async fn create_deposit_tx(
        &self,
        inputs: &[String],
        multisig_address: &str,
        deposit: u64,
        trade_fee: u64,
        fee_address: &str,
    ) -> Result<BuiltTx, WalletError> {
        self.inner
            .create_deposit_tx(inputs, multisig_address, deposit, trade_fee, fee_address)
            .await
    }

    async fn describe_tx(&self, tx_hex: &str) -> Result<TxDescription, WalletError> {
        self.inner.describe_tx(tx_hex).await
    }

    async fn submit_tx(&self, tx_hex: &str) -> Result<String, WalletError> {
        self.inner.submit_tx(tx_hex).await
    }

    async fn tx_confirmations(&self, tx_hash: &str) -> Result<Option<u64>, WalletError> {
        self.inner.tx_confirmations(tx_hash).await
    }

    async fn prepare_multisig(&self, wallet_id: &str) -> Result<String, WalletError> {
        self.inner.prepare_multisig(wallet_id).await
    }

    async fn make_multisig(
        &self,
        wallet_id: &str,
        peer_hexes: &[String],
    ) -> Result<String, WalletError> {
        self.inner.make_multisig(wallet_id, peer_hexes).await
    }

    async fn export_multisig_hex(&self, wallet_id: &str) -> Result<String, WalletError> {
        if self.fail_exports.load(Ordering::SeqCst) {
            return Err(WalletError::Rpc("export_multisig_info timed out".into()));
        }
        self.inner.export_multisig_hex(wallet_id).await
    }

    async fn import_multisig_hex(
        &self,
        wallet_id: &str,
        hexes: &[String],
    ) -> Result<usize, WalletError> {
        self.inner.import_multisig_hex(wallet_id, hexes).await
    }

    async fn multisig_balance(&self, wallet_id: &str) -> Result<u64, WalletError> {
        self.inner.multisig_balance(wallet_id).await
    }

    async fn create_multisig_payout(
        &self,
        wallet_id: &str,
        destinations: &[Destination],
        fee_from: &[usize],
    ) -> Result<BuiltTx, WalletError> {
        self.inner
            .create_multisig_payout(wallet_id, destinations, fee_from)
            .await
    }

    async fn sign_multisig_tx(&self, wallet_id: &str, tx_hex: &str) -> Result<String, WalletError> {
        self.inner.sign_multisig_tx(wallet_id, tx_hex).await
    }

    async fn submit_multisig_tx(
        &self,
        wallet_id: &str,
        tx_hex: &str,
    ) -> Result<String, WalletError> {
        self.inner.submit_multisig_tx(wallet_id, tx_hex).await
    }
}

struct Node {
    runtime: Arc<Runtime>,
    wallet: Arc<SimulatedWallet>,
    faults: Arc<FaultyWallet>,
    address: NodeAddress,
}

impl Node {
    fn trade(&self, id: &str) -> Option<Trade> {
        self.runtime.trades().snapshot(id)
    }

    fn state(&self, id: &str) -> Option<TradeState> {
        self.trade(id).map(|t| t.state)
    }

    fn payout_hash(&self, id: &str) -> Option<String> {
        self.trade(id).and_then(|t| t.payout_tx_hash)
    }

    fn is_closed(&self, id: &str) -> bool {
        self.runtime
            .trades()
            .closed_trades()
            .iter()
            .any(|t| t.id == id && t.state == TradeState::Closed)
    }
}

struct Market {
    config: ProtocolConfig,
    network: Arc<LocalNetwork>,
    chain: Arc<SimulatedChain>,
    maker: Node,
    taker: Node,
    arbitrator: Node,
}

impl Market {
    fn start(config: ProtocolConfig) -> Self {
        let network = LocalNetwork::new();
        let chain = SimulatedChain::new();
        let node = |name: &str, seed: u8| {
            let address = NodeAddress::new(format!("{name}.onion"));
            let (channel, events) = network.register(address.clone());
            let wallet = Arc::new(SimulatedWallet::new(chain.clone(), format!("{name}-wallet")));
            let faults = Arc::new(FaultyWallet {
                inner: wallet.clone(),
                fail_exports: AtomicBool::new(false),
            });
            let runtime = Runtime::new(
                config.clone(),
                NodeKeypair::from_seed(&[seed; 32]),
                faults.clone(),
                Arc::new(channel),
                Arc::new(MemoryStore::new()),
            );
            runtime.start(events).expect("runtime starts");
            Node {
                runtime,
                wallet,
                faults,
                address,
            }
        };
        let maker = node("maker", 1);
        let taker = node("taker", 2);
        let arbitrator = node("arbitrator", 3);
        chain.fund(&maker.wallet.primary_address(), FUND);
        chain.fund(&taker.wallet.primary_address(), FUND);
        Self {
            config,
            network,
            chain,
            maker,
            taker,
            arbitrator,
        }
    }

    fn payload(&self, id: &str) -> OfferPayload {
        let maker = self.maker.runtime.services();
        let arbitrator = self.arbitrator.runtime.services();
        OfferPayload {
            id: id.to_string(),
            maker_node: self.maker.address.clone(),
            maker_pub_key: maker.pub_key(),
            arbitrator_node: self.arbitrator.address.clone(),
            arbitrator_pub_key: arbitrator.pub_key(),
            direction: OfferDirection::Sell,
            amount: 5 * XMR,
            min_amount: XMR,
            price: 150_00,
            currency_code: "EUR".into(),
            payment_method: "SEPA".into(),
            security_deposit_bps: self.config.security_deposit_bps,
            min_security_deposit: self.config.min_security_deposit,
            maker_fee_bps: self.config.maker_fee_bps,
            taker_fee_bps: self.config.taker_fee_bps,
            protocol_version: PROTOCOL_VERSION.to_string(),
            created_at_ms: chrono::Utc::now().timestamp_millis(),
        }
    }

    /// Places a signed offer and has the taker take it. Returns the trade id.
    async fn open_trade(&self, id: &str) -> String {
        self.maker
            .runtime
            .offers()
            .place_offer(self.payload(id))
            .await
            .expect("offer placed");
        wait_for("arbitrator signature", || {
            self.maker.runtime.offers().signed_offer(id).is_some()
        })
        .await;
        let offer = self
            .maker
            .runtime
            .offers()
            .signed_offer(id)
            .expect("signed offer");
        let trade = self
            .taker
            .runtime
            .trades()
            .take_offer(offer, TRADE_AMOUNT)
            .await
            .expect("offer taken");
        assert_eq!(trade.role, Role::Taker);
        assert_eq!(trade.side(), Some(Side::Buyer));
        trade.id
    }

    /// Drives a fresh trade until both traders see unlocked deposits and
    /// the arbitrator holds both traders' multisig state.
    async fn unlocked_trade(&self, id: &str) -> String {
        let id = self.open_trade(id).await;
        wait_for("deposits published", || {
            [&self.maker, &self.taker].iter().all(|n| {
                n.state(&id)
                    .is_some_and(|s| s >= TradeState::DepositTxsPublished)
            })
        })
        .await;

        self.chain.mine(self.config.unlock_confirmations + 1);
        wait_for("deposits unlocked", || {
            [&self.maker, &self.taker].iter().all(|n| {
                n.state(&id)
                    .is_some_and(|s| s >= TradeState::DepositTxsUnlocked)
            })
        })
        .await;
        wait_for("multisig state exchanged", || {
            let has_state = |node: &Node| node.trade(&id).is_some_and(|t| t.has_peer_multisig_state());
            has_state(&self.maker) && has_state(&self.taker) && {
                self.arbitrator.trade(&id).is_some_and(|t| {
                    t.peer(Role::Maker).updated_multisig_hex.is_some()
                        && t.peer(Role::Taker).updated_multisig_hex.is_some()
                })
            }
        })
        .await;
        id
    }

    async fn shutdown(&self) {
        for node in [&self.maker, &self.taker, &self.arbitrator] {
            node.runtime.shutdown().await;
        }
    }
}

async fn wait_for<F: Fn() -> bool>(what: &str, check: F) {
    for _ in 0..1_000 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

async fn next_escalation(
    events: &mut tokio::sync::broadcast::Receiver<TradeEvent>,
    id: &str,
) -> String {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            match events.recv().await {
                Ok(TradeEvent::EscalationRequired { trade_id, reason }) if trade_id == id => {
                    break reason
                }
                Ok(_) => continue,
                Err(e) => panic!("trade events ended: {e}"),
            }
        }
    })
    .await
    .expect("timed out waiting for escalation")
}

fn is_payment_sent_to(to: &NodeAddress, target: &NodeAddress, envelope: &Envelope) -> bool {
    to == target && matches!(envelope.message, ProtocolMessage::PaymentSent(_))
}

// ---------------------------------------------------------------------------
// Cooperative path
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_cooperative_trade_closes_for_all_three_parties() {
    let market = Market::start(ProtocolConfig::fast());
    let id = market.unlocked_trade("offer-happy").await;

    market
        .taker
        .runtime
        .trades()
        .confirm_payment_sent(&id)
        .await
        .unwrap();
    wait_for("seller saw payment sent", || {
        market
            .maker
            .state(&id)
            .is_some_and(|s| s >= TradeState::PaymentSentMsgReceived)
    })
    .await;
    wait_for("buyer got the ack", || {
        market.taker.state(&id) == Some(TradeState::PaymentSentAcked)
    })
    .await;

    market
        .maker
        .runtime
        .trades()
        .confirm_payment_received(&id)
        .await
        .unwrap();
    wait_for("buyer saw the payout", || {
        market.taker.trade(&id).is_some_and(|t| t.payout_tx_hash.is_some())
    })
    .await;

    market.chain.mine(1);
    wait_for("all three trades closed", || {
        market.maker.is_closed(&id) && market.taker.is_closed(&id) && market.arbitrator.is_closed(&id)
    })
    .await;

    // The buyer paid fees but received the trade amount; the seller gave it up.
    assert!(market.taker.wallet.balance() > FUND);
    assert!(market.maker.wallet.balance() < FUND - TRADE_AMOUNT + XMR / 10);
    assert_eq!(market.maker.runtime.trades().active_count(), 0);

    let payout = market.taker.trade(&id).unwrap().payout_tx_hash;
    assert_eq!(payout, market.maker.trade(&id).unwrap().payout_tx_hash);
    market.shutdown().await;
}

// ---------------------------------------------------------------------------
// Delivery failures
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_offline_seller_gets_payment_sent_from_mailbox() {
    let market = Market::start(ProtocolConfig::fast());
    let id = market.unlocked_trade("offer-mailbox").await;

    market.network.set_online(&market.maker.address, false);
    market
        .taker
        .runtime
        .trades()
        .confirm_payment_sent(&id)
        .await
        .unwrap();
    wait_for("payment sent stored in mailbox", || {
        market.taker.state(&id) == Some(TradeState::BuyerStoredInMailboxPaymentSentMsg)
    })
    .await;
    assert!(market.network.mailbox_len(&market.maker.address) >= 1);
    assert!(market.maker.state(&id) < Some(TradeState::PaymentSentMsgReceived));

    market.network.set_online(&market.maker.address, true);
    wait_for("seller processed the mailbox", || {
        market
            .maker
            .state(&id)
            .is_some_and(|s| s >= TradeState::PaymentSentMsgReceived)
    })
    .await;
    wait_for("buyer got the ack", || {
        market.taker.state(&id) == Some(TradeState::PaymentSentAcked)
    })
    .await;
    assert_eq!(market.network.mailbox_len(&market.maker.address), 0);
    market.shutdown().await;
}

#[tokio::test]
async fn test_failed_payment_sent_is_resent_on_tick() {
    let config = ProtocolConfig {
        max_message_resends: 1_000,
        ..ProtocolConfig::fast()
    };
    let market = Market::start(config);
    let id = market.unlocked_trade("offer-resend").await;

    let seller = market.maker.address.clone();
    let filter: DropFilter = Arc::new(move |to, envelope| is_payment_sent_to(to, &seller, envelope));
    market.network.set_drop_filter(Some(filter));

    market
        .taker
        .runtime
        .trades()
        .confirm_payment_sent(&id)
        .await
        .unwrap();
    wait_for("send failed", || {
        market.taker.state(&id) == Some(TradeState::BuyerSendFailedPaymentSentMsg)
    })
    .await;

    // Resends keep failing while the network drops the message.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(
        market.taker.state(&id),
        Some(TradeState::BuyerSendFailedPaymentSentMsg)
    );
    assert!(market.maker.state(&id) < Some(TradeState::PaymentSentMsgReceived));

    market.network.set_drop_filter(None);
    wait_for("resend reached the seller", || {
        market
            .maker
            .state(&id)
            .is_some_and(|s| s >= TradeState::PaymentSentMsgReceived)
    })
    .await;
    wait_for("buyer left the failed state", || {
        market.taker.state(&id) == Some(TradeState::PaymentSentAcked)
    })
    .await;
    assert_eq!(market.taker.trade(&id).unwrap().resend_count, 0);
    market.shutdown().await;
}

#[tokio::test]
async fn test_replayed_message_is_not_processed_twice() {
    let market = Market::start(ProtocolConfig::fast());
    let id = market.unlocked_trade("offer-replay").await;

    let seller = market.maker.address.clone();
    let recorded: Arc<Mutex<Option<Envelope>>> = Arc::new(Mutex::new(None));
    let sink = recorded.clone();
    let filter: DropFilter = Arc::new(move |to, envelope| {
        if is_payment_sent_to(to, &seller, envelope) {
            *sink.lock() = Some(envelope.clone());
        }
        false
    });
    market.network.set_drop_filter(Some(filter));

    market
        .taker
        .runtime
        .trades()
        .confirm_payment_sent(&id)
        .await
        .unwrap();
    wait_for("seller saw payment sent", || {
        market
            .maker
            .state(&id)
            .is_some_and(|s| s >= TradeState::PaymentSentMsgReceived)
    })
    .await;
    market.network.set_drop_filter(None);

    let before = market.maker.trade(&id).unwrap();
    let mut events = market.maker.runtime.trades().subscribe();
    let envelope = recorded.lock().clone().expect("payment sent recorded");
    market
        .maker
        .runtime
        .deliver(InboundMessage::new(envelope, false))
        .await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let after = market.maker.trade(&id).unwrap();
    assert_eq!(after.state, before.state);
    assert_eq!(after.processed_uids, before.processed_uids);
    while let Ok(event) = events.try_recv() {
        assert!(
            !matches!(event, TradeEvent::PipelineFailed { .. } | TradeEvent::StateChanged { .. }),
            "replay changed the trade: {event:?}"
        );
    }
    market.shutdown().await;
}

#[tokio::test]
async fn test_early_payment_received_applies_once_payment_sent_goes_out() {
    let market = Market::start(ProtocolConfig::fast());
    let id = market.unlocked_trade("offer-early").await;

    // A payout both traders signed, reported by the seller before the
    // buyer has even confirmed payment.
    let trade = market.taker.trade(&id).unwrap();
    let (destinations, fee_from) = trade.payout_terms().unwrap().proposal().unwrap();
    let built = market
        .taker
        .wallet
        .create_multisig_payout(&id, &destinations, &fee_from)
        .await
        .unwrap();
    let signed = market.taker.wallet.sign_multisig_tx(&id, &built.hex).await.unwrap();
    let signed = market.maker.wallet.sign_multisig_tx(&id, &signed).await.unwrap();
    let expected = market.taker.wallet.describe_tx(&signed).await.unwrap().hash;

    let envelope = Envelope::new(
        &id,
        market.maker.address.clone(),
        market.maker.runtime.services().pub_key(),
        1_000,
        ProtocolMessage::PaymentReceived(PaymentReceived {
            signed_payout_tx_hex: Some(signed),
            payout_published: false,
            updated_multisig_hex: None,
        }),
    );
    let uid = envelope.uid.clone();
    market
        .taker
        .runtime
        .deliver(InboundMessage::new(envelope, false))
        .await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    let parked = market.taker.trade(&id).unwrap();
    assert_eq!(parked.state, TradeState::DepositTxsUnlocked);
    assert!(!parked.is_processed(&uid));
    assert!(parked.payout_tx_hash.is_none());

    market
        .taker
        .runtime
        .trades()
        .confirm_payment_sent(&id)
        .await
        .unwrap();
    wait_for("deferred payment received applied", || {
        market.taker.trade(&id).is_some_and(|t| t.is_processed(&uid))
    })
    .await;
    let trade = market.taker.trade(&id).unwrap();
    assert!(trade.state >= TradeState::PaymentReceivedMsgReceived);
    assert_eq!(trade.payout_tx_hash, Some(expected));
    market.shutdown().await;
}

#[tokio::test]
async fn test_failed_export_does_not_forget_the_payout() {
    let market = Market::start(ProtocolConfig::fast());
    let id = market.unlocked_trade("offer-export").await;

    market
        .taker
        .runtime
        .trades()
        .confirm_payment_sent(&id)
        .await
        .unwrap();
    wait_for("seller saw payment sent", || {
        market
            .maker
            .state(&id)
            .is_some_and(|s| s >= TradeState::PaymentSentMsgReceived)
    })
    .await;

    let balance = market.maker.wallet.multisig_balance(&id).await.unwrap();
    market.maker.faults.fail_exports.store(true, Ordering::SeqCst);
    assert!(market
        .maker
        .runtime
        .trades()
        .confirm_payment_received(&id)
        .await
        .is_err());

    // Nothing reached the chain, so nothing had to be remembered.
    let trade = market.maker.trade(&id).unwrap();
    assert!(trade.payout_tx_hash.is_none());
    assert_eq!(trade.effective_state(), TradeState::PaymentSentMsgReceived);
    assert_eq!(market.maker.wallet.multisig_balance(&id).await.unwrap(), balance);

    market.maker.faults.fail_exports.store(false, Ordering::SeqCst);
    let trade = market
        .maker
        .runtime
        .trades()
        .confirm_payment_received(&id)
        .await
        .unwrap();
    assert!(trade.payout_tx_hash.is_some());
    wait_for("buyer saw the payout", || {
        market.taker.trade(&id).is_some_and(|t| t.payout_tx_hash == trade.payout_tx_hash)
    })
    .await;

    market.chain.mine(1);
    wait_for("all three trades closed", || {
        market.maker.is_closed(&id) && market.taker.is_closed(&id) && market.arbitrator.is_closed(&id)
    })
    .await;
    market.shutdown().await;
}

// ---------------------------------------------------------------------------
// Disputes
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_arbitration_pays_out_and_closes() {
    let market = Market::start(ProtocolConfig::fast());
    let id = market.unlocked_trade("offer-dispute").await;

    let dispute = market
        .taker
        .runtime
        .disputes()
        .open_dispute(&id, SupportType::Arbitration, "seller stopped answering")
        .await
        .unwrap();
    assert!(dispute.is_opener);
    assert_eq!(dispute.opener_side, Side::Buyer);

    wait_for("arbitrator accepted the dispute", || {
        market.arbitrator.runtime.disputes().dispute(&id).is_some()
    })
    .await;
    wait_for("seller learned of the dispute", || {
        market.maker.runtime.disputes().dispute(&id).is_some()
    })
    .await;

    let chat = market
        .maker
        .runtime
        .disputes()
        .send_chat(&id, "payment never arrived")
        .await
        .unwrap();
    wait_for("arbitrator got the chat", || {
        market
            .arbitrator
            .runtime
            .disputes()
            .dispute(&id)
            .is_some_and(|d| d.chat.iter().any(|c| c.uid == chat.uid))
    })
    .await;

    let balance = market
        .arbitrator
        .runtime
        .services()
        .wallet
        .multisig_balance(&id)
        .await
        .unwrap();
    let seller_amount = market.arbitrator.trade(&id).unwrap().amounts.seller_security_deposit;
    let result = DisputeResult {
        winner: Side::Buyer,
        buyer_amount: balance - seller_amount,
        seller_amount,
        reason: "seller unresponsive".into(),
        summary: "buyer proved payment".into(),
    };
    market
        .arbitrator
        .runtime
        .disputes()
        .resolve_dispute(&id, result)
        .await
        .unwrap();

    wait_for("both traders closed the dispute", || {
        [&market.maker, &market.taker].iter().all(|n| {
            n.runtime
                .disputes()
                .dispute(&id)
                .is_some_and(|d| d.status == DisputeStatus::Closed)
        })
    })
    .await;

    market.chain.mine(1);
    wait_for("all three trades closed", || {
        market.maker.is_closed(&id) && market.taker.is_closed(&id) && market.arbitrator.is_closed(&id)
    })
    .await;
    assert!(market.taker.wallet.balance() > FUND);
    market.shutdown().await;
}

#[tokio::test]
async fn test_only_one_open_dispute_per_trade() {
    let market = Market::start(ProtocolConfig::fast());
    let id = market.unlocked_trade("offer-twice").await;

    market
        .taker
        .runtime
        .disputes()
        .open_dispute(&id, SupportType::Mediation, "slow payment")
        .await
        .unwrap();
    let again = market
        .taker
        .runtime
        .disputes()
        .open_dispute(&id, SupportType::Mediation, "still slow")
        .await;
    assert!(again.is_err());

    // The arbitrator cannot open a dispute on its own trade.
    wait_for("arbitrator accepted the dispute", || {
        market.arbitrator.runtime.disputes().dispute(&id).is_some()
    })
    .await;
    assert!(market
        .arbitrator
        .runtime
        .disputes()
        .open_dispute(&id, SupportType::Arbitration, "no")
        .await
        .is_err());
    market.shutdown().await;
}

#[tokio::test]
async fn test_mediation_result_can_be_taken_to_arbitration() {
    let market = Market::start(ProtocolConfig::fast());
    let id = market.unlocked_trade("offer-mediation").await;

    let mediation = market
        .taker
        .runtime
        .disputes()
        .open_dispute(&id, SupportType::Mediation, "seller slow to confirm")
        .await
        .unwrap();
    wait_for("both sides know the mediation", || {
        market.arbitrator.runtime.disputes().dispute(&id).is_some()
            && market.maker.runtime.disputes().dispute(&id).is_some()
    })
    .await;

    let balance = market
        .arbitrator
        .runtime
        .services()
        .wallet
        .multisig_balance(&id)
        .await
        .unwrap();
    let amounts = market.arbitrator.trade(&id).unwrap().amounts;
    let proposal = DisputeResult {
        winner: Side::Buyer,
        buyer_amount: balance - amounts.seller_security_deposit,
        seller_amount: amounts.seller_security_deposit,
        reason: "payment looks genuine".into(),
        summary: "suggested split".into(),
    };
    let advised = market
        .arbitrator
        .runtime
        .disputes()
        .resolve_dispute(&id, proposal.clone())
        .await
        .unwrap();
    assert!(advised.is_open());
    wait_for("both traders got the proposal", || {
        [&market.maker, &market.taker].iter().all(|n| {
            n.runtime
                .disputes()
                .dispute(&id)
                .is_some_and(|d| d.is_escalatable() && d.result.as_ref() == Some(&proposal))
        })
    })
    .await;
    assert!(market.maker.payout_hash(&id).is_none());

    // The seller does not accept the proposal. Another mediation is not an
    // option; arbitration is.
    assert!(market
        .maker
        .runtime
        .disputes()
        .open_dispute(&id, SupportType::Mediation, "again")
        .await
        .is_err());
    let arbitration = market
        .maker
        .runtime
        .disputes()
        .open_dispute(&id, SupportType::Arbitration, "buyer never paid")
        .await
        .unwrap();
    assert_ne!(arbitration.id, mediation.id);
    assert_eq!(arbitration.opener_side, Side::Seller);
    wait_for("everyone moved to the arbitration", || {
        [&market.arbitrator, &market.taker].iter().all(|n| {
            n.runtime
                .disputes()
                .dispute(&id)
                .is_some_and(|d| d.id == arbitration.id && d.support_type == SupportType::Arbitration)
        })
    })
    .await;

    let result = DisputeResult {
        winner: Side::Seller,
        buyer_amount: amounts.buyer_security_deposit,
        seller_amount: balance - amounts.buyer_security_deposit,
        reason: "no payment shown".into(),
        summary: "seller keeps the trade amount".into(),
    };
    let decided = market
        .arbitrator
        .runtime
        .disputes()
        .resolve_dispute(&id, result)
        .await
        .unwrap();
    assert_eq!(decided.status, DisputeStatus::Closed);
    assert_eq!(decided.id, arbitration.id);

    wait_for("both traders closed the arbitration", || {
        [&market.maker, &market.taker].iter().all(|n| {
            n.runtime
                .disputes()
                .dispute(&id)
                .is_some_and(|d| d.id == arbitration.id && d.status == DisputeStatus::Closed)
        })
    })
    .await;
    market.chain.mine(1);
    wait_for("all three trades closed", || {
        market.maker.is_closed(&id) && market.taker.is_closed(&id) && market.arbitrator.is_closed(&id)
    })
    .await;
    assert!(market.maker.wallet.balance() > FUND - XMR / 10);
    assert!(market.taker.wallet.balance() < FUND);
    market.shutdown().await;
}

#[tokio::test]
async fn test_tampered_payout_escalates_to_arbitration() {
    let market = Market::start(ProtocolConfig::fast());
    let id = market.unlocked_trade("offer-tampered").await;

    // The buyer's payout takes a hundredth of an XMR from the seller.
    let trade = market.taker.trade(&id).unwrap();
    let (mut destinations, fee_from) = trade.payout_terms().unwrap().proposal().unwrap();
    destinations[0].amount += XMR / 100;
    destinations[1].amount -= XMR / 100;
    let built = market
        .taker
        .wallet
        .create_multisig_payout(&id, &destinations, &fee_from)
        .await
        .unwrap();
    let signed = market.taker.wallet.sign_multisig_tx(&id, &built.hex).await.unwrap();

    let mut events = market.maker.runtime.trades().subscribe();
    let envelope = Envelope::new(
        &id,
        market.taker.address.clone(),
        market.taker.runtime.services().pub_key(),
        1_000,
        ProtocolMessage::PaymentSent(PaymentSent {
            counter_currency_tx_id: None,
            payout_tx_hex: Some(signed),
            updated_multisig_hex: None,
        }),
    );
    market
        .maker
        .runtime
        .deliver(InboundMessage::new(envelope, false))
        .await;

    let reason = next_escalation(&mut events, &id).await;
    assert!(!reason.is_empty());
    wait_for("arbitrator holds the escalated dispute", || {
        market.arbitrator.runtime.disputes().dispute(&id).is_some_and(|d| {
            d.support_type == SupportType::Arbitration && d.opener_side == Side::Seller
        })
    })
    .await;
    let dispute = market.maker.runtime.disputes().dispute(&id).unwrap();
    assert!(dispute.is_opener);
    assert!(market.maker.payout_hash(&id).is_none());
    assert_eq!(market.maker.state(&id), Some(TradeState::PayoutFailed));
    market.shutdown().await;
}
