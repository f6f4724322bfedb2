//! Message ordering and the deferred queue.
//!
//! Mailbox batches and deferred retries are applied in
//! [`MessageOrderKey`] order: sender sequence first, then arrival time,
//! then uid as the final tie-break. The same set of pending messages
//! therefore always replays in the same order, however they arrived.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tokio::time::Instant;

use super::InboundMessage;
use crate::config::ProtocolConfig;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MessageOrderKey {
    pub sequence: u64,
    pub received_at_ms: i64,
    pub uid: String,
}

/// Sorts a batch into application order.
pub fn sort_batch(batch: &mut [InboundMessage]) {
    batch.sort_by_cached_key(InboundMessage::order_key);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeferOutcome {
    Queued,
    /// A message with this uid is already waiting.
    Duplicate,
    /// Capacity reached; the message was not kept.
    Full,
}

#[derive(Debug, Clone)]
pub struct DeferredEntry {
    pub message: InboundMessage,
    /// Retries so far.
    pub attempts: u32,
    pub first_deferred: Instant,
}

/// Bounded, uid-deduplicated holding area for messages that arrived too
/// early. Entries leave by being retried successfully or by expiring.
#[derive(Debug)]
pub struct DeferredQueue {
    entries: BTreeMap<MessageOrderKey, DeferredEntry>,
    by_uid: HashMap<String, MessageOrderKey>,
    capacity: usize,
    max_attempts: u32,
    max_age: Duration,
}

impl DeferredQueue {
    pub fn new(capacity: usize, max_attempts: u32, max_age: Duration) -> Self {
        Self {
            entries: BTreeMap::new(),
            by_uid: HashMap::new(),
            capacity,
            max_attempts,
            max_age,
        }
    }

    pub fn from_config(config: &ProtocolConfig) -> Self {
        Self::new(
            config.max_deferred_messages,
            config.max_deferred_attempts,
            config.max_deferred_age(),
        )
    }

    pub fn push(&mut self, message: InboundMessage) -> DeferOutcome {
        self.insert(DeferredEntry {
            message,
            attempts: 0,
            first_deferred: Instant::now(),
        })
    }

    /// Puts back an entry whose retry was deferred again.
    pub fn requeue(&mut self, mut entry: DeferredEntry) -> DeferOutcome {
        entry.attempts = entry.attempts.saturating_add(1);
        self.insert(entry)
    }

    fn insert(&mut self, entry: DeferredEntry) -> DeferOutcome {
        let uid = entry.message.uid().to_string();
        if self.by_uid.contains_key(&uid) {
            return DeferOutcome::Duplicate;
        }
        if self.entries.len() >= self.capacity {
            return DeferOutcome::Full;
        }
        let key = entry.message.order_key();
        self.by_uid.insert(uid, key.clone());
        self.entries.insert(key, entry);
        DeferOutcome::Queued
    }

    /// Removes everything, in application order.
    pub fn take_all(&mut self) -> Vec<DeferredEntry> {
        self.by_uid.clear();
        std::mem::take(&mut self.entries).into_values().collect()
    }

    /// Removes and returns entries past the attempt or age budget.
    pub fn expire(&mut self, now: Instant) -> Vec<DeferredEntry> {
        let expired: Vec<MessageOrderKey> = self
            .entries
            .iter()
            .filter(|(_, e)| {
                e.attempts >= self.max_attempts
                    || now.saturating_duration_since(e.first_deferred) > self.max_age
            })
            .map(|(k, _)| k.clone())
            .collect();
        expired
            .into_iter()
            .filter_map(|key| {
                let entry = self.entries.remove(&key)?;
                self.by_uid.remove(entry.message.uid());
                Some(entry)
            })
            .collect()
    }

    pub fn contains(&self, uid: &str) -> bool {
        self.by_uid.contains_key(uid)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::NodeKeypair;
    use crate::network::messages::{DepositsConfirmed, Envelope, ProtocolMessage};
    use crate::network::NodeAddress;

    fn message(sequence: u64, received_at_ms: i64, uid: &str) -> InboundMessage {
        let keys = NodeKeypair::from_seed(&[6u8; 32]);
        let envelope = Envelope::new(
            "t",
            NodeAddress::new("peer.onion"),
            keys.public_key(),
            sequence,
            ProtocolMessage::DepositsConfirmed(DepositsConfirmed {
                updated_multisig_hex: String::new(),
            }),
        )
        .with_uid(uid);
        InboundMessage {
            envelope,
            received_at_ms,
            via_mailbox: true,
        }
    }

    #[test]
    fn test_batch_order_is_independent_of_arrival_order() {
        let a = message(2, 100, "a");
        let b = message(1, 300, "b");
        let c = message(2, 50, "c");
        let d = message(2, 50, "b2");

        let mut one = vec![a.clone(), b.clone(), c.clone(), d.clone()];
        let mut two = vec![d, c, b, a];
        sort_batch(&mut one);
        sort_batch(&mut two);

        let uids = |v: &[InboundMessage]| v.iter().map(|m| m.uid().to_string()).collect::<Vec<_>>();
        assert_eq!(uids(&one), vec!["b", "b2", "c", "a"]);
        assert_eq!(uids(&one), uids(&two));
    }

    #[test]
    fn test_dedup_and_capacity() {
        let mut queue = DeferredQueue::new(2, 5, Duration::from_secs(60));
        assert_eq!(queue.push(message(1, 1, "x")), DeferOutcome::Queued);
        assert_eq!(queue.push(message(1, 2, "x")), DeferOutcome::Duplicate);
        assert_eq!(queue.push(message(2, 1, "y")), DeferOutcome::Queued);
        assert_eq!(queue.push(message(3, 1, "z")), DeferOutcome::Full);
        assert_eq!(queue.len(), 2);
        assert!(queue.contains("y"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_expiry_by_attempts_and_age() {
        let mut queue = DeferredQueue::new(8, 2, Duration::from_secs(10));
        queue.push(message(1, 1, "retry"));
        queue.push(message(2, 1, "old"));

        // Two unsuccessful retries exhaust the first entry's budget.
        for _ in 0..2 {
            for entry in queue.take_all() {
                if entry.message.uid() == "retry" {
                    queue.requeue(entry);
                } else {
                    queue.insert(entry);
                }
            }
        }
        let expired = queue.expire(Instant::now());
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].message.uid(), "retry");

        tokio::time::advance(Duration::from_secs(11)).await;
        let expired = queue.expire(Instant::now());
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].message.uid(), "old");
        assert!(queue.is_empty());
    }

    #[test]
    fn test_take_all_drains_in_order() {
        let mut queue = DeferredQueue::new(8, 5, Duration::from_secs(60));
        queue.push(message(5, 1, "late"));
        queue.push(message(1, 9, "early"));
        let drained: Vec<_> = queue.take_all().into_iter().map(|e| e.message.uid().to_string()).collect();
        assert_eq!(drained, vec!["early", "late"]);
        assert!(queue.is_empty());
        assert!(!queue.contains("late"));
    }
}
