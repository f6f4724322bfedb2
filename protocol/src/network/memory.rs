//! In-process transport.
//!
//! [`LocalNetwork`] connects any number of nodes inside one process. It
//! keeps the properties the protocol has to survive in production:
//! peers go offline, direct sends to them fail, mailbox sends pile up
//! and are flushed as one batch when the peer comes back. Every envelope
//! goes through the real codec on the way.

use dashmap::DashMap;
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use super::codec::{decode, encode};
use super::ordering::sort_batch;
use super::{DeliveryOutcome, Envelope, InboundMessage, MessageChannel, NetworkEvent, NodeAddress};

/// Returns true for envelopes the network should lose.
pub type DropFilter = Arc<dyn Fn(&NodeAddress, &Envelope) -> bool + Send + Sync>;

struct PeerSlot {
    inbox: mpsc::UnboundedSender<NetworkEvent>,
    online: bool,
}

struct StoredMessage {
    bytes: Vec<u8>,
    stored_at_ms: i64,
}

#[derive(Default)]
pub struct LocalNetwork {
    peers: DashMap<NodeAddress, PeerSlot>,
    mailboxes: DashMap<NodeAddress, Vec<StoredMessage>>,
    drop_filter: RwLock<Option<DropFilter>>,
}

impl LocalNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Adds an online node. Re-registering an address replaces its inbox.
    pub fn register(
        self: &Arc<Self>,
        address: NodeAddress,
    ) -> (LocalChannel, mpsc::UnboundedReceiver<NetworkEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        self.peers.insert(
            address.clone(),
            PeerSlot {
                inbox: tx,
                online: true,
            },
        );
        let channel = LocalChannel {
            address,
            network: self.clone(),
        };
        (channel, rx)
    }

    /// Takes a node on or offline. Coming online flushes its mailbox.
    pub fn set_online(&self, address: &NodeAddress, online: bool) {
        if let Some(mut slot) = self.peers.get_mut(address) {
            slot.online = online;
        }
        debug!(node = %address, online, "peer connectivity changed");
        if online {
            self.flush_mailbox(address);
        }
    }

    pub fn is_online(&self, address: &NodeAddress) -> bool {
        self.peers.get(address).map(|s| s.online).unwrap_or(false)
    }

    pub fn mailbox_len(&self, address: &NodeAddress) -> usize {
        self.mailboxes.get(address).map(|m| m.len()).unwrap_or(0)
    }

    pub fn set_drop_filter(&self, filter: Option<DropFilter>) {
        *self.drop_filter.write() = filter;
    }

    fn dropped(&self, to: &NodeAddress, envelope: &Envelope) -> bool {
        self.drop_filter
            .read()
            .as_ref()
            .map(|f| f(to, envelope))
            .unwrap_or(false)
    }

    fn deliver_direct(&self, to: &NodeAddress, bytes: Vec<u8>) -> DeliveryOutcome {
        let Some(slot) = self.peers.get(to) else {
            return DeliveryOutcome::Failed(format!("unknown peer {to}"));
        };
        if !slot.online {
            return DeliveryOutcome::Failed(format!("{to} is offline"));
        }
        // Decoding on the receiving side, exactly as a socket would.
        let envelope = match decode(&bytes) {
            Ok(envelope) => envelope,
            Err(e) => return DeliveryOutcome::Failed(e.to_string()),
        };
        match slot
            .inbox
            .send(NetworkEvent::Message(InboundMessage::new(envelope, false)))
        {
            Ok(()) => DeliveryOutcome::Delivered,
            Err(_) => DeliveryOutcome::Failed(format!("{to} stopped receiving")),
        }
    }

    fn store_in_mailbox(&self, to: &NodeAddress, bytes: Vec<u8>) -> DeliveryOutcome {
        if !self.peers.contains_key(to) {
            return DeliveryOutcome::Failed(format!("unknown peer {to}"));
        }
        self.mailboxes.entry(to.clone()).or_default().push(StoredMessage {
            bytes,
            stored_at_ms: chrono::Utc::now().timestamp_millis(),
        });
        if self.is_online(to) {
            self.flush_mailbox(to);
        }
        DeliveryOutcome::Queued
    }

    fn flush_mailbox(&self, address: &NodeAddress) {
        let Some((_, stored)) = self.mailboxes.remove(address) else {
            return;
        };
        let mut batch: Vec<InboundMessage> = stored
            .into_iter()
            .filter_map(|m| {
                let envelope = decode(&m.bytes).ok()?;
                Some(InboundMessage {
                    envelope,
                    received_at_ms: m.stored_at_ms,
                    via_mailbox: true,
                })
            })
            .collect();
        if batch.is_empty() {
            return;
        }
        sort_batch(&mut batch);
        trace!(node = %address, messages = batch.len(), "flushing mailbox");
        if let Some(slot) = self.peers.get(address) {
            let _ = slot.inbox.send(NetworkEvent::MailboxBatch(batch));
        }
    }
}

/// One node's handle on a [`LocalNetwork`].
#[derive(Clone)]
pub struct LocalChannel {
    address: NodeAddress,
    network: Arc<LocalNetwork>,
}

impl LocalChannel {
    pub fn network(&self) -> &Arc<LocalNetwork> {
        &self.network
    }

    fn encode_for(&self, to: &NodeAddress, envelope: &Envelope) -> Result<Vec<u8>, DeliveryOutcome> {
        if self.network.dropped(to, envelope) {
            return Err(DeliveryOutcome::Failed("dropped by network".into()));
        }
        encode(envelope).map_err(|e| DeliveryOutcome::Failed(e.to_string()))
    }
}

#[async_trait::async_trait]
impl MessageChannel for LocalChannel {
    fn local_address(&self) -> &NodeAddress {
        &self.address
    }

    async fn send_direct(&self, to: &NodeAddress, envelope: &Envelope) -> DeliveryOutcome {
        match self.encode_for(to, envelope) {
            Ok(bytes) => self.network.deliver_direct(to, bytes),
            Err(outcome) => outcome,
        }
    }

    async fn send_mailbox(&self, to: &NodeAddress, envelope: &Envelope) -> DeliveryOutcome {
        match self.encode_for(to, envelope) {
            Ok(bytes) => self.network.store_in_mailbox(to, bytes),
            Err(outcome) => outcome,
        }
    }
}
