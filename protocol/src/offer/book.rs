//! The offer book of one node.
//!
//! A maker keeps its own offers in `open`, and adds each one to `signed`
//! once its arbitrator has signed it. An arbitrator keeps the offers it
//! co-signed in `signed`, and checks every take against that set. Each
//! offer has an async guard so a signing response can never interleave
//! with the pipeline that requested it.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::tasks::{maker_holder, OfferContext, OfferTask};
use super::{OfferError, OfferPayload, OfferState, OpenOffer, SignedOffer};
use crate::escrow::EscrowError;
use crate::network::messages::{AckMessage, SignOfferRequest};
use crate::network::{InboundMessage, MessageKind, ProtocolMessage};
use crate::pipeline::{PipelineOutcome, TaskPipeline};
use crate::services::Services;
use crate::storage::{Checkpoint, CheckpointWriter};

pub struct OfferBook {
    services: Arc<Services>,
    checkpoints: Arc<CheckpointWriter>,
    open: DashMap<String, OpenOffer>,
    signed: DashMap<String, SignedOffer>,
    guards: DashMap<String, Arc<Mutex<()>>>,
}

impl OfferBook {
    pub fn new(services: Arc<Services>, checkpoints: Arc<CheckpointWriter>) -> Self {
        Self {
            services,
            checkpoints,
            open: DashMap::new(),
            signed: DashMap::new(),
            guards: DashMap::new(),
        }
    }

    fn guard(&self, offer_id: &str) -> Arc<Mutex<()>> {
        self.guards.entry(offer_id.to_string()).or_default().clone()
    }

    fn store(&self, offer: OpenOffer) {
        self.checkpoints.request(Checkpoint::Offer(offer.clone()));
        self.open.insert(offer.id().to_string(), offer);
    }

    async fn release_reservation(&self, offer_id: &str) {
        match self.services.reservations.release(offer_id).await {
            Ok(()) | Err(EscrowError::UnknownReservation(_)) => {}
            Err(e) => warn!(offer_id, error = %e, "could not release offer reservation"),
        }
    }

    // -----------------------------------------------------------------------
    // Maker
    // -----------------------------------------------------------------------

    /// Reserves funds for `payload` and asks its arbitrator to sign it. The
    /// offer becomes available once the signed response arrives.
    pub async fn place_offer(&self, payload: OfferPayload) -> Result<OpenOffer, OfferError> {
        payload.validate()?;
        let id = payload.id.clone();
        if payload.maker_pub_key != self.services.pub_key() {
            return Err(OfferError::NotOwned(id));
        }
        if payload.arbitrator_pub_key == payload.maker_pub_key {
            return Err(OfferError::SelfArbitration);
        }

        let lock = self.guard(&id);
        let _guard = lock.lock().await;
        match self.open.entry(id.clone()) {
            Entry::Occupied(_) => return Err(OfferError::Duplicate(id)),
            Entry::Vacant(slot) => {
                slot.insert(OpenOffer::new(payload.clone()));
            }
        }

        let mut ctx = OfferContext::new(self.services.clone(), OpenOffer::new(payload), None);
        let outcome = TaskPipeline::new(
            format!("place-offer/{id}"),
            vec![
                OfferTask::MakerReserveOfferFunds,
                OfferTask::MakerSendSignOfferRequest,
            ],
        )
        .run(&mut ctx)
        .await;

        let result = match outcome {
            PipelineOutcome::Completed { .. } => {
                info!(offer_id = %id, "offer sent for signing");
                Ok(ctx.offer.clone())
            }
            PipelineOutcome::Failed(failure) => {
                self.release_reservation(&id).await;
                Err(OfferError::Pipeline {
                    task: failure.task,
                    error: failure.error.to_string(),
                })
            }
        };
        self.store(ctx.offer);
        result
    }

    /// Withdraws an offer that has not been taken and thaws its funds.
    pub async fn cancel(&self, offer_id: &str) -> Result<OpenOffer, OfferError> {
        let offer = {
            let mut entry = self
                .open
                .get_mut(offer_id)
                .ok_or_else(|| OfferError::UnknownOffer(offer_id.to_string()))?;
            match entry.state {
                OfferState::Taken => {
                    return Err(OfferError::NotAvailable {
                        id: offer_id.to_string(),
                        state: entry.state,
                    })
                }
                OfferState::Canceled => return Ok(entry.clone()),
                _ => {}
            }
            entry.state = OfferState::Canceled;
            entry.clone()
        };
        self.signed.remove(offer_id);
        self.release_reservation(offer_id).await;
        self.checkpoints.request(Checkpoint::Offer(offer.clone()));
        info!(offer_id, "offer canceled");
        Ok(offer)
    }

    /// Claims an available offer for a trade.
    pub fn mark_taken(&self, offer_id: &str) -> Result<OpenOffer, OfferError> {
        let offer = {
            let mut entry = self
                .open
                .get_mut(offer_id)
                .ok_or_else(|| OfferError::UnknownOffer(offer_id.to_string()))?;
            if !entry.is_available() {
                return Err(OfferError::NotAvailable {
                    id: offer_id.to_string(),
                    state: entry.state,
                });
            }
            entry.state = OfferState::Taken;
            entry.clone()
        };
        self.checkpoints.request(Checkpoint::Offer(offer.clone()));
        Ok(offer)
    }

    /// Puts a taken offer back on the book after its trade failed to start.
    pub fn reopen(&self, offer_id: &str) {
        let reopened = self.open.get_mut(offer_id).and_then(|mut entry| {
            (entry.state == OfferState::Taken).then(|| {
                entry.state = OfferState::Signed;
                entry.clone()
            })
        });
        if let Some(offer) = reopened {
            info!(offer_id, "offer reopened");
            self.checkpoints.request(Checkpoint::Offer(offer));
        }
    }

    pub fn open_offer(&self, offer_id: &str) -> Option<OpenOffer> {
        self.open.get(offer_id).map(|o| o.clone())
    }

    pub fn open_offers(&self) -> Vec<OpenOffer> {
        self.open.iter().map(|o| o.clone()).collect()
    }

    // -----------------------------------------------------------------------
    // Arbitrator
    // -----------------------------------------------------------------------

    /// An offer this node co-signed as arbitrator, or one of its own offers
    /// its arbitrator has signed.
    pub fn signed_offer(&self, offer_id: &str) -> Option<SignedOffer> {
        self.signed.get(offer_id).map(|o| o.clone())
    }

    pub fn signed_offers(&self) -> Vec<SignedOffer> {
        self.signed.iter().map(|o| o.clone()).collect()
    }

    // -----------------------------------------------------------------------
    // Inbound
    // -----------------------------------------------------------------------

    pub async fn handle(&self, message: InboundMessage) {
        match &message.envelope.message {
            ProtocolMessage::SignOfferRequest(request) => {
                let request = request.clone();
                self.handle_sign_request(&message, request).await;
            }
            ProtocolMessage::SignOfferResponse(_) => self.handle_sign_response(&message).await,
            ProtocolMessage::Ack(ack) => self.handle_ack(ack).await,
            _ => debug!(kind = %message.kind(), uid = %message.uid(), "not an offer message"),
        }
    }

    async fn handle_sign_request(&self, message: &InboundMessage, request: SignOfferRequest) {
        let id = request.offer.id.clone();
        let lock = self.guard(&id);
        let _guard = lock.lock().await;

        let mut offer = OpenOffer::new(request.offer.clone());
        offer.reserve_tx = Some(request.reserve_tx.clone());
        let tasks = match self.signed_offer(&id) {
            Some(existing)
                if existing.payload == request.offer && existing.reserve_tx == request.reserve_tx =>
            {
                // Repeated request: answer again with the same signature.
                offer.signed = Some(existing);
                offer.state = OfferState::Signed;
                vec![OfferTask::ArbitratorSendSignOfferResponse]
            }
            Some(_) => {
                self.services
                    .ack(message, false, Some(format!("offer {id} already signed with other terms")))
                    .await;
                return;
            }
            None => vec![
                OfferTask::ArbitratorVerifyReserveTx,
                OfferTask::ArbitratorSignOffer,
                OfferTask::ArbitratorSendSignOfferResponse,
            ],
        };

        let mut ctx = OfferContext::new(self.services.clone(), offer, Some(message.clone()));
        let outcome = TaskPipeline::new(format!("sign-offer/{id}"), tasks)
            .run(&mut ctx)
            .await;
        match outcome {
            PipelineOutcome::Completed { .. } => {
                if let Some(signed) = ctx.offer.signed.clone() {
                    self.signed.insert(id.clone(), signed);
                }
                self.checkpoints.request(Checkpoint::Offer(ctx.offer));
                info!(offer_id = %id, "offer co-signed");
                self.services.ack(message, true, None).await;
            }
            PipelineOutcome::Failed(failure) => {
                self.services.key_images.release_holder(&maker_holder(&id));
                self.services
                    .ack(
                        message,
                        false,
                        Some(format!("{}: {}", failure.task, failure.error)),
                    )
                    .await;
            }
        }
    }

    async fn handle_sign_response(&self, message: &InboundMessage) {
        let id = message.trade_id().to_string();
        let lock = self.guard(&id);
        let _guard = lock.lock().await;

        let Some(offer) = self.open_offer(&id) else {
            self.services
                .ack(message, false, Some(OfferError::UnknownOffer(id).to_string()))
                .await;
            return;
        };
        match offer.state {
            OfferState::Signed => {
                self.services.ack(message, true, None).await;
                return;
            }
            OfferState::FundsReserved | OfferState::SigningRequested => {}
            state => {
                self.services
                    .ack(message, false, Some(OfferError::NotAvailable { id, state }.to_string()))
                    .await;
                return;
            }
        }

        let mut ctx = OfferContext::new(self.services.clone(), offer, Some(message.clone()));
        let outcome = TaskPipeline::new(
            format!("signed-offer/{id}"),
            vec![OfferTask::MakerProcessSignOfferResponse],
        )
        .run(&mut ctx)
        .await;
        match outcome {
            PipelineOutcome::Completed { .. } => {
                info!(offer_id = %id, "offer signed and available");
                if let Some(signed) = ctx.offer.signed.clone() {
                    self.signed.insert(id.clone(), signed);
                }
                self.store(ctx.offer);
                self.services.ack(message, true, None).await;
            }
            PipelineOutcome::Failed(failure) => {
                self.store(ctx.offer);
                self.release_reservation(&id).await;
                self.services
                    .ack(
                        message,
                        false,
                        Some(format!("{}: {}", failure.task, failure.error)),
                    )
                    .await;
            }
        }
    }

    async fn handle_ack(&self, ack: &AckMessage) {
        if ack.success || ack.source_kind != MessageKind::SignOfferRequest {
            debug!(offer_id = %ack.source_id, kind = %ack.source_kind, success = ack.success, "offer ack");
            return;
        }
        let id = ack.source_id.clone();
        let lock = self.guard(&id);
        let _guard = lock.lock().await;
        let failed = self.open.get_mut(&id).and_then(|mut entry| {
            (entry.state == OfferState::SigningRequested).then(|| {
                entry.state = OfferState::Failed;
                entry.error_message = ack.error.clone();
                entry.clone()
            })
        });
        if let Some(offer) = failed {
            warn!(offer_id = %id, error = ?ack.error, "arbitrator refused to sign offer");
            self.release_reservation(&id).await;
            self.checkpoints.request(Checkpoint::Offer(offer));
        }
    }

    /// Loads persisted offers after a restart.
    pub fn restore(&self, offers: Vec<OpenOffer>) {
        let me = self.services.pub_key();
        for offer in offers {
            let id = offer.id().to_string();
            if offer.payload.maker_pub_key == me {
                if let (Some(reserve), true) = (
                    offer.reserve_tx.clone(),
                    matches!(
                        offer.state,
                        OfferState::FundsReserved
                            | OfferState::SigningRequested
                            | OfferState::Signed
                            | OfferState::Taken
                    ),
                ) {
                    self.services.reservations.restore(&id, reserve);
                }
                if let (OfferState::Signed | OfferState::Taken, Some(signed)) =
                    (offer.state, offer.signed.clone())
                {
                    self.signed.insert(id.clone(), signed);
                }
                self.open.insert(id, offer);
            } else if let Some(signed) = offer.signed {
                if let Err(e) = self
                    .services
                    .key_images
                    .claim(&maker_holder(&id), &signed.reserve_tx.key_images)
                {
                    warn!(offer_id = %id, error = %e, "restored offer conflicts with another claim");
                }
                self.signed.insert(id, signed);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ProtocolConfig, ATOMIC_UNITS_PER_XMR as XMR};
    use crate::crypto::NodeKeypair;
    use crate::network::{Envelope, LocalNetwork, NetworkEvent, NodeAddress};
    use crate::offer::tests::sample_payload;
    use crate::storage::MemoryStore;
    use crate::wallet::{SimulatedChain, SimulatedWallet, XmrWallet};
    use tokio::sync::mpsc::UnboundedReceiver;

    struct Node {
        services: Arc<Services>,
        book: OfferBook,
        rx: UnboundedReceiver<NetworkEvent>,
    }

    fn node(net: &Arc<LocalNetwork>, chain: &Arc<SimulatedChain>, seed: u8, name: &str) -> Node {
        let (channel, rx) = net.register(NodeAddress::new(name));
        let wallet = Arc::new(SimulatedWallet::new(chain.clone(), name));
        let services = Services::new(
            ProtocolConfig::fast(),
            NodeKeypair::from_seed(&[seed; 32]),
            wallet,
            Arc::new(channel),
        );
        let checkpoints = CheckpointWriter::new(Arc::new(MemoryStore::new()));
        Node {
            book: OfferBook::new(services.clone(), checkpoints),
            services,
            rx,
        }
    }

    async fn next_message(rx: &mut UnboundedReceiver<NetworkEvent>) -> InboundMessage {
        match rx.recv().await {
            Some(NetworkEvent::Message(message)) => message,
            other => panic!("expected a message, got {other:?}"),
        }
    }

    fn setup() -> (Node, Node, OfferPayload) {
        let net = LocalNetwork::new();
        let chain = SimulatedChain::new();
        let maker = node(&net, &chain, 1, "maker.onion");
        let arbitrator = node(&net, &chain, 2, "arbitrator.onion");
        chain.fund("maker.onion", 10 * XMR);
        let payload = sample_payload(&maker.services.keys, &arbitrator.services.keys);
        (maker, arbitrator, payload)
    }

    #[tokio::test]
    async fn test_offer_is_signed_by_arbitrator() {
        let (mut maker, mut arbitrator, payload) = setup();
        let placed = maker.book.place_offer(payload.clone()).await.unwrap();
        assert_eq!(placed.state, OfferState::SigningRequested);
        assert!(placed.reserve_tx.is_some());

        let request = next_message(&mut arbitrator.rx).await;
        arbitrator.book.handle(request).await;
        let signed = arbitrator.book.signed_offer(&payload.id).unwrap();
        signed.verify_arbitrator_signature().unwrap();

        let response = next_message(&mut maker.rx).await;
        assert_eq!(response.kind(), MessageKind::SignOfferResponse);
        maker.book.handle(response).await;
        let offer = maker.book.open_offer(&payload.id).unwrap();
        assert_eq!(offer.state, OfferState::Signed);
        assert!(offer.is_available());
        assert_eq!(offer.signed, Some(signed.clone()));
        assert_eq!(maker.book.signed_offer(&payload.id), Some(signed));

        let ack = next_message(&mut maker.rx).await;
        assert_eq!(ack.kind(), MessageKind::Ack);
    }

    #[tokio::test]
    async fn test_restored_maker_offer_is_still_signed() {
        let (mut maker, mut arbitrator, payload) = setup();
        maker.book.place_offer(payload.clone()).await.unwrap();
        arbitrator.book.handle(next_message(&mut arbitrator.rx).await).await;
        maker.book.handle(next_message(&mut maker.rx).await).await;
        let offer = maker.book.open_offer(&payload.id).unwrap();
        let signed = offer.signed.clone().unwrap();

        let net = LocalNetwork::new();
        let chain = SimulatedChain::new();
        let restarted = node(&net, &chain, 1, "maker.onion");
        restarted.book.restore(vec![offer]);
        assert_eq!(restarted.book.signed_offer(&payload.id), Some(signed));
        assert!(restarted.book.open_offer(&payload.id).unwrap().is_available());

        maker.book.cancel(&payload.id).await.unwrap();
        assert!(maker.book.signed_offer(&payload.id).is_none());
    }

    #[tokio::test]
    async fn test_reused_reserve_is_refused() {
        let (mut maker, mut arbitrator, payload) = setup();
        let placed = maker.book.place_offer(payload.clone()).await.unwrap();
        arbitrator.book.handle(next_message(&mut arbitrator.rx).await).await;
        let _response = next_message(&mut maker.rx).await;
        let _ack = next_message(&mut maker.rx).await;

        // Same coins behind a second offer.
        let mut second = payload.clone();
        second.id = "offer-2".into();
        let envelope: Envelope = maker.services.envelope(
            "offer-2",
            1,
            ProtocolMessage::SignOfferRequest(SignOfferRequest {
                offer: second,
                reserve_tx: placed.reserve_tx.unwrap(),
            }),
        );
        arbitrator.book.handle(InboundMessage::new(envelope, false)).await;
        assert!(arbitrator.book.signed_offer("offer-2").is_none());

        let nack = next_message(&mut maker.rx).await;
        let ProtocolMessage::Ack(ack) = nack.envelope.message else {
            panic!("expected ack");
        };
        assert!(!ack.success);
        assert!(ack.error.unwrap().contains("already backs"));
    }

    #[tokio::test]
    async fn test_cancel_thaws_reserved_outputs() {
        let (maker, _arbitrator, payload) = setup();
        maker.book.place_offer(payload.clone()).await.unwrap();
        let frozen = maker.services.wallet.unspent_outputs().await.unwrap();
        assert!(frozen.iter().any(|o| o.frozen));

        let canceled = maker.book.cancel(&payload.id).await.unwrap();
        assert_eq!(canceled.state, OfferState::Canceled);
        let outputs = maker.services.wallet.unspent_outputs().await.unwrap();
        assert!(outputs.iter().all(|o| !o.frozen));
        assert!(maker.services.reservations.get(&payload.id).is_none());
    }

    #[tokio::test]
    async fn test_take_and_reopen() {
        let (mut maker, mut arbitrator, payload) = setup();
        maker.book.place_offer(payload.clone()).await.unwrap();
        assert!(matches!(
            maker.book.mark_taken(&payload.id),
            Err(OfferError::NotAvailable { .. })
        ));
        arbitrator.book.handle(next_message(&mut arbitrator.rx).await).await;
        maker.book.handle(next_message(&mut maker.rx).await).await;

        assert_eq!(maker.book.mark_taken(&payload.id).unwrap().state, OfferState::Taken);
        assert!(maker.book.cancel(&payload.id).await.is_err());
        maker.book.reopen(&payload.id);
        assert!(maker.book.open_offer(&payload.id).unwrap().is_available());
    }

    #[tokio::test]
    async fn test_duplicate_and_foreign_offers_rejected() {
        let (maker, arbitrator, payload) = setup();
        maker.book.place_offer(payload.clone()).await.unwrap();
        assert!(matches!(
            maker.book.place_offer(payload.clone()).await,
            Err(OfferError::Duplicate(_))
        ));
        assert!(matches!(
            arbitrator.book.place_offer(payload).await,
            Err(OfferError::NotOwned(_))
        ));
    }
}
