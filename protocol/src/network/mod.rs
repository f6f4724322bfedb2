//! # Messaging
//!
//! The trade protocol talks to peers through [`MessageChannel`], a small
//! seam over whatever actually carries bytes (Tor hidden services in
//! production, [`memory::LocalNetwork`] in tests and the sandbox).
//!
//! ## Delivery model
//!
//! Every send resolves to a [`DeliveryOutcome`]:
//!
//! ```text
//!   send_direct ──▶ Delivered            peer online, message handed over
//!              └──▶ Failed(reason) ──▶ send_mailbox ──▶ Queued
//!                                                   └──▶ Failed(reason)
//! ```
//!
//! A send that produces no outcome within the step time limit resolves to
//! `Failed`. Nothing ever waits forever on the network.
//!
//! Inbound traffic arrives as [`NetworkEvent`]s: single messages, or a
//! whole mailbox flushed on reconnect, which the receiver applies in
//! [`ordering::MessageOrderKey`] order.

pub mod codec;
pub mod memory;
pub mod messages;
pub mod ordering;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tracing::debug;

pub use codec::{decode, encode, CodecError};
pub use memory::{LocalChannel, LocalNetwork};
pub use messages::{AckMessage, Envelope, MessageKind, ProtocolMessage};
pub use ordering::{DeferOutcome, DeferredEntry, DeferredQueue, MessageOrderKey};

/// A peer's network address (an onion address in production).
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeAddress(String);

impl NodeAddress {
    pub fn new(address: impl Into<String>) -> Self {
        Self(address.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for NodeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeAddress({})", self.0)
    }
}

/// Result of one send attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeliveryOutcome {
    /// The peer has the message.
    Delivered,
    /// Stored in the peer's mailbox; delivered when it comes online.
    Queued,
    Failed(String),
}

impl DeliveryOutcome {
    /// Delivered or queued: the message will reach the peer.
    pub fn is_accepted(&self) -> bool {
        !matches!(self, DeliveryOutcome::Failed(_))
    }
}

/// How hard a send should try.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendMode {
    Direct,
    /// Fall back to the peer's mailbox when it is offline.
    DirectThenMailbox,
}

/// A received envelope plus local arrival metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundMessage {
    pub envelope: Envelope,
    pub received_at_ms: i64,
    pub via_mailbox: bool,
}

impl InboundMessage {
    pub fn new(envelope: Envelope, via_mailbox: bool) -> Self {
        Self {
            envelope,
            received_at_ms: chrono::Utc::now().timestamp_millis(),
            via_mailbox,
        }
    }

    pub fn uid(&self) -> &str {
        &self.envelope.uid
    }

    pub fn kind(&self) -> MessageKind {
        self.envelope.message.kind()
    }

    pub fn trade_id(&self) -> &str {
        &self.envelope.trade_id
    }

    pub fn sender(&self) -> &NodeAddress {
        &self.envelope.sender
    }

    pub fn order_key(&self) -> MessageOrderKey {
        MessageOrderKey {
            sequence: self.envelope.sequence,
            received_at_ms: self.received_at_ms,
            uid: self.envelope.uid.clone(),
        }
    }
}

/// What a transport hands to the node.
#[derive(Debug)]
pub enum NetworkEvent {
    Message(InboundMessage),
    /// Everything that piled up in our mailbox while we were offline.
    MailboxBatch(Vec<InboundMessage>),
}

/// Outbound half of a transport.
#[async_trait]
pub trait MessageChannel: Send + Sync {
    fn local_address(&self) -> &NodeAddress;

    async fn send_direct(&self, to: &NodeAddress, envelope: &Envelope) -> DeliveryOutcome;

    async fn send_mailbox(&self, to: &NodeAddress, envelope: &Envelope) -> DeliveryOutcome;
}

/// Sends `envelope` under a time limit, falling back to the mailbox when
/// `mode` allows it.
pub async fn send_with_limit(
    channel: &dyn MessageChannel,
    to: &NodeAddress,
    envelope: &Envelope,
    mode: SendMode,
    limit: Duration,
) -> DeliveryOutcome {
    let direct = tokio::time::timeout(limit, channel.send_direct(to, envelope))
        .await
        .unwrap_or_else(|_| DeliveryOutcome::Failed(format!("no outcome within {limit:?}")));

    match (direct, mode) {
        (DeliveryOutcome::Failed(reason), SendMode::DirectThenMailbox) => {
            debug!(
                to = %to,
                kind = %envelope.message.kind(),
                uid = %envelope.uid,
                reason = %reason,
                "direct send failed, trying mailbox"
            );
            tokio::time::timeout(limit, channel.send_mailbox(to, envelope))
                .await
                .unwrap_or_else(|_| {
                    DeliveryOutcome::Failed(format!("mailbox: no outcome within {limit:?}"))
                })
        }
        (outcome, _) => outcome,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::NodeKeypair;
    use crate::network::messages::AckMessage;

    /// A channel that never answers.
    struct BlackHole(NodeAddress);

    #[async_trait]
    impl MessageChannel for BlackHole {
        fn local_address(&self) -> &NodeAddress {
            &self.0
        }
        async fn send_direct(&self, _to: &NodeAddress, _e: &Envelope) -> DeliveryOutcome {
            futures::future::pending().await
        }
        async fn send_mailbox(&self, _to: &NodeAddress, _e: &Envelope) -> DeliveryOutcome {
            futures::future::pending().await
        }
    }

    fn ack_envelope() -> Envelope {
        let keys = NodeKeypair::from_seed(&[1u8; 32]);
        Envelope::new(
            "trade-1",
            NodeAddress::new("a.onion"),
            keys.public_key(),
            0,
            ProtocolMessage::Ack(AckMessage {
                source_uid: "x".into(),
                source_kind: MessageKind::PaymentSent,
                source_id: "trade-1".into(),
                success: true,
                error: None,
            }),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_peer_resolves_to_failed_within_limit() {
        let channel = BlackHole(NodeAddress::new("me.onion"));
        let outcome = send_with_limit(
            &channel,
            &NodeAddress::new("peer.onion"),
            &ack_envelope(),
            SendMode::DirectThenMailbox,
            Duration::from_secs(120),
        )
        .await;
        assert!(matches!(outcome, DeliveryOutcome::Failed(ref r) if r.starts_with("mailbox")));
    }

    #[test]
    fn test_delivery_outcome_acceptance() {
        assert!(DeliveryOutcome::Delivered.is_accepted());
        assert!(DeliveryOutcome::Queued.is_accepted());
        assert!(!DeliveryOutcome::Failed("x".into()).is_accepted());
    }
}
