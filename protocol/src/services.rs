//! Shared, process-lifetime collaborators of one node.
//!
//! Every trade actor, the offer book and the dispute coordinator hold an
//! `Arc<Services>`. Nothing in here is trade specific.

use std::sync::Arc;
use tracing::warn;

use crate::config::ProtocolConfig;
use crate::crypto::{NodeKeypair, PublicKey};
use crate::escrow::{KeyImageRegistry, ReservationService};
use crate::network::{
    send_with_limit, DeliveryOutcome, Envelope, InboundMessage, MessageChannel, NodeAddress,
    ProtocolMessage, SendMode,
};
use crate::wallet::XmrWallet;

pub struct Services {
    pub config: ProtocolConfig,
    pub keys: NodeKeypair,
    pub wallet: Arc<dyn XmrWallet>,
    pub channel: Arc<dyn MessageChannel>,
    pub reservations: ReservationService,
    pub key_images: KeyImageRegistry,
}

impl Services {
    pub fn new(
        config: ProtocolConfig,
        keys: NodeKeypair,
        wallet: Arc<dyn XmrWallet>,
        channel: Arc<dyn MessageChannel>,
    ) -> Arc<Self> {
        let reservations = ReservationService::new(wallet.clone(), config.trade_fee_address.clone());
        Arc::new(Self {
            config,
            keys,
            wallet,
            channel,
            reservations,
            key_images: KeyImageRegistry::new(),
        })
    }

    pub fn address(&self) -> &NodeAddress {
        self.channel.local_address()
    }

    pub fn pub_key(&self) -> PublicKey {
        self.keys.public_key()
    }

    pub fn fee_address(&self) -> &str {
        &self.config.trade_fee_address
    }

    /// Wraps `message` in an envelope from this node.
    pub fn envelope(&self, trade_id: &str, sequence: u64, message: ProtocolMessage) -> Envelope {
        Envelope::new(trade_id, self.address().clone(), self.pub_key(), sequence, message)
    }

    /// Sends under the configured step time limit.
    pub async fn send(&self, to: &NodeAddress, envelope: &Envelope, mode: SendMode) -> DeliveryOutcome {
        send_with_limit(
            self.channel.as_ref(),
            to,
            envelope,
            mode,
            self.config.step_time_limit(),
        )
        .await
    }

    /// Answers `message` with an ack. Failures are logged, never raised.
    pub async fn ack(&self, message: &InboundMessage, success: bool, error: Option<String>) {
        let ack = message
            .envelope
            .ack(self.address().clone(), self.pub_key(), success, error);
        let outcome = self
            .send(message.sender(), &ack, SendMode::DirectThenMailbox)
            .await;
        if let DeliveryOutcome::Failed(reason) = outcome {
            warn!(
                trade_id = %message.trade_id(),
                uid = %message.uid(),
                kind = %message.kind(),
                reason = %reason,
                "ack could not be delivered"
            );
        }
    }
}
