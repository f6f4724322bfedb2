//! Offer-signing steps.
//!
//! Maker: reserve funds, ask the arbitrator to sign, check its answer.
//! Arbitrator: verify the reserve proof, sign, answer. Offer messages use
//! the offer id as trade id and always carry sequence 1: each side sends
//! exactly one message per offer.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;

use super::{OfferError, OfferState, OpenOffer, SignedOffer};
use crate::crypto::PublicKey;
use crate::escrow::verify_reserve_tx;
use crate::network::messages::{SignOfferRequest, SignOfferResponse};
use crate::network::{DeliveryOutcome, InboundMessage, NodeAddress, ProtocolMessage, SendMode};
use crate::pipeline::{inbound_payload, PipelineContext, Task, TaskError};
use crate::services::Services;

const OFFER_SEQUENCE: u64 = 1;

/// Key-image holder name for the maker's reservation behind an offer.
pub fn maker_holder(offer_id: &str) -> String {
    format!("{offer_id}/maker")
}

pub struct OfferContext {
    pub services: Arc<Services>,
    pub offer: OpenOffer,
    pub inbound: Option<InboundMessage>,
    snapshot: Option<OpenOffer>,
}

impl OfferContext {
    pub fn new(services: Arc<Services>, offer: OpenOffer, inbound: Option<InboundMessage>) -> Self {
        Self {
            services,
            offer,
            inbound,
            snapshot: None,
        }
    }

    fn set_state(&mut self, state: OfferState) {
        if self.offer.state != state {
            info!(offer_id = %self.offer.id(), from = %self.offer.state, to = %state, "offer state changed");
            self.offer.state = state;
        }
    }

    /// The trigger must come from `node` signed as `key`.
    fn check_sender(
        &self,
        node: &NodeAddress,
        key: PublicKey,
        who: &'static str,
    ) -> Result<(), TaskError> {
        let inbound = self
            .inbound
            .as_ref()
            .ok_or_else(|| TaskError::InvalidMessage("no inbound message".into()))?;
        if inbound.sender() != node || inbound.envelope.sender_pub_key != key {
            return Err(TaskError::Verification(format!(
                "message did not come from the offer's {who}"
            )));
        }
        Ok(())
    }

    async fn send(&self, to: &NodeAddress, message: ProtocolMessage) -> Result<(), TaskError> {
        let envelope = self
            .services
            .envelope(self.offer.id(), OFFER_SEQUENCE, message);
        match self
            .services
            .send(to, &envelope, SendMode::DirectThenMailbox)
            .await
        {
            DeliveryOutcome::Failed(reason) => Err(TaskError::Delivery {
                kind: envelope.kind().to_string(),
                reason,
            }),
            _ => Ok(()),
        }
    }
}

impl PipelineContext for OfferContext {
    fn begin_step(&mut self) {
        self.snapshot = Some(self.offer.clone());
    }

    fn commit_step(&mut self) {
        self.snapshot = None;
    }

    fn rollback_step(&mut self) {
        if let Some(snapshot) = self.snapshot.take() {
            self.offer = snapshot;
        }
    }

    fn record_failure(&mut self, task: &'static str, error: &TaskError) {
        self.offer.error_message = Some(format!("{task}: {error}"));
        self.offer.state = OfferState::Failed;
    }
}

fn offer_error(error: OfferError) -> TaskError {
    match error {
        OfferError::Escrow(e) => TaskError::Escrow(e),
        OfferError::InvalidSignature => TaskError::Verification(error.to_string()),
        other => TaskError::Precondition(other.to_string()),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OfferTask {
    MakerReserveOfferFunds,
    MakerSendSignOfferRequest,
    ArbitratorVerifyReserveTx,
    ArbitratorSignOffer,
    ArbitratorSendSignOfferResponse,
    MakerProcessSignOfferResponse,
}

#[async_trait]
impl Task for OfferTask {
    type Context = OfferContext;

    fn name(&self) -> &'static str {
        match self {
            OfferTask::MakerReserveOfferFunds => "MakerReserveOfferFunds",
            OfferTask::MakerSendSignOfferRequest => "MakerSendSignOfferRequest",
            OfferTask::ArbitratorVerifyReserveTx => "ArbitratorVerifyReserveTx",
            OfferTask::ArbitratorSignOffer => "ArbitratorSignOffer",
            OfferTask::ArbitratorSendSignOfferResponse => "ArbitratorSendSignOfferResponse",
            OfferTask::MakerProcessSignOfferResponse => "MakerProcessSignOfferResponse",
        }
    }

    async fn execute(&self, ctx: &mut OfferContext) -> Result<(), TaskError> {
        match self {
            OfferTask::MakerReserveOfferFunds => {
                ctx.offer.payload.validate().map_err(offer_error)?;
                let (reserved, maker_fee) =
                    ctx.offer.payload.maker_reservation().map_err(offer_error)?;
                let reserve = ctx
                    .services
                    .reservations
                    .reserve(ctx.offer.id(), reserved, maker_fee)
                    .await?;
                ctx.offer.reserve_tx = Some(reserve);
                ctx.set_state(OfferState::FundsReserved);
                Ok(())
            }

            OfferTask::MakerSendSignOfferRequest => {
                let reserve_tx = ctx
                    .offer
                    .reserve_tx
                    .clone()
                    .ok_or_else(|| TaskError::Precondition("offer funds not reserved".into()))?;
                let arbitrator = ctx.offer.payload.arbitrator_node.clone();
                ctx.send(
                    &arbitrator,
                    ProtocolMessage::SignOfferRequest(SignOfferRequest {
                        offer: ctx.offer.payload.clone(),
                        reserve_tx,
                    }),
                )
                .await?;
                ctx.set_state(OfferState::SigningRequested);
                Ok(())
            }

            OfferTask::ArbitratorVerifyReserveTx => {
                let payload = &ctx.offer.payload;
                ctx.check_sender(&payload.maker_node, payload.maker_pub_key, "maker")?;
                if ctx.offer.payload.arbitrator_pub_key != ctx.services.pub_key() {
                    return Err(TaskError::Verification(
                        "offer names a different arbitrator".into(),
                    ));
                }
                ctx.offer.payload.validate().map_err(offer_error)?;
                let reserve = ctx
                    .offer
                    .reserve_tx
                    .clone()
                    .ok_or_else(|| TaskError::InvalidMessage("no reserve tx".into()))?;
                let (reserved, maker_fee) =
                    ctx.offer.payload.maker_reservation().map_err(offer_error)?;
                let described = ctx.services.wallet.describe_tx(&reserve.hex).await?;
                verify_reserve_tx(
                    &described,
                    &reserve,
                    reserved,
                    maker_fee,
                    ctx.services.fee_address(),
                )?;
                ctx.services
                    .key_images
                    .claim(&maker_holder(ctx.offer.id()), &reserve.key_images)?;
                Ok(())
            }

            OfferTask::ArbitratorSignOffer => {
                let reserve = ctx
                    .offer
                    .reserve_tx
                    .clone()
                    .ok_or_else(|| TaskError::InvalidMessage("no reserve tx".into()))?;
                let signed =
                    SignedOffer::sign(ctx.offer.payload.clone(), reserve, &ctx.services.keys)
                        .map_err(offer_error)?;
                ctx.offer.signed = Some(signed);
                ctx.set_state(OfferState::Signed);
                Ok(())
            }

            OfferTask::ArbitratorSendSignOfferResponse => {
                let signed_offer = ctx
                    .offer
                    .signed
                    .clone()
                    .ok_or_else(|| TaskError::Precondition("offer not signed".into()))?;
                let maker = ctx.offer.payload.maker_node.clone();
                ctx.send(
                    &maker,
                    ProtocolMessage::SignOfferResponse(SignOfferResponse { signed_offer }),
                )
                .await
            }

            OfferTask::MakerProcessSignOfferResponse => {
                let response = inbound_payload!(ctx, SignOfferResponse);
                let payload = &ctx.offer.payload;
                ctx.check_sender(
                    &payload.arbitrator_node,
                    payload.arbitrator_pub_key,
                    "arbitrator",
                )?;
                let signed = response.signed_offer;
                if signed.payload != ctx.offer.payload {
                    return Err(TaskError::Verification(
                        "arbitrator signed different offer terms".into(),
                    ));
                }
                if Some(&signed.reserve_tx) != ctx.offer.reserve_tx.as_ref() {
                    return Err(TaskError::Verification(
                        "arbitrator signed a different reserve tx".into(),
                    ));
                }
                signed.verify_arbitrator_signature().map_err(offer_error)?;
                ctx.offer.signed = Some(signed);
                ctx.set_state(OfferState::Signed);
                Ok(())
            }
        }
    }
}
