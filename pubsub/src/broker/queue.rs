//! Per-subscription queue state (spec §3 `SubscriptionQueue`).

use std::collections::{HashMap, VecDeque};

use super::lease::Lease;
use super::message::{Message, Timestamp};
use super::ordering::OrderingState;

#[derive(Debug)]
pub struct BackoffEntry {
    pub message: Message,
    pub available_at: Timestamp,
}

#[derive(Default, Debug)]
pub struct SubscriptionQueue {
    pub messages: VecDeque<Message>,
    pub ordering: Option<OrderingState>,
    pub in_flight: HashMap<String, Lease>,
    pub backoff: HashMap<String, BackoffEntry>,
    pub in_flight_count: u64,
    pub in_flight_bytes: u64,
    pub queue_size: u64,
    pub queue_bytes: u64,
}

impl SubscriptionQueue {
    pub fn new(ordering_enabled: bool) -> Self {
        Self {
            ordering: ordering_enabled.then(OrderingState::default),
            ..Default::default()
        }
    }

    /// Appends a freshly-published message to the main queue or, if
    /// ordering is enabled and the message carries a key, to that key's
    /// queue (spec §4.2 step 5). Bumps `queue_size`/`queue_bytes`.
    pub fn enqueue_published(&mut self, message: Message) {
        self.queue_size += 1;
        self.queue_bytes += message.length() as u64;
        match (&mut self.ordering, &message.ordering_key) {
            (Some(ordering), Some(key)) => ordering.push_back(key.clone(), message),
            _ => self.messages.push_back(message),
        }
    }

    pub fn insert_lease(&mut self, lease: Lease) {
        self.in_flight_count += 1;
        self.in_flight_bytes += lease.message.length() as u64;
        self.in_flight.insert(lease.ack_id.clone(), lease);
    }

    /// Removes a lease and returns it, decrementing in-flight counters.
    /// Does not touch `queue_size`/`queue_bytes` — callers decide whether
    /// the message is leaving the subscription entirely (ack, DLQ) or
    /// staying (nack-with-redelivery), per spec §4.4.
    pub fn remove_lease(&mut self, ack_id: &str) -> Option<Lease> {
        let lease = self.in_flight.remove(ack_id)?;
        self.in_flight_count -= 1;
        self.in_flight_bytes -= lease.message.length() as u64;
        Some(lease)
    }

    pub fn decrement_queue_accounting(&mut self, message: &Message) {
        self.queue_size = self.queue_size.saturating_sub(1);
        self.queue_bytes = self.queue_bytes.saturating_sub(message.length() as u64);
    }

    pub fn insert_backoff(&mut self, message: Message, available_at: Timestamp) {
        self.backoff.insert(
            message.id.clone(),
            BackoffEntry { message, available_at },
        );
    }

    /// Promotes every backoff entry whose `available_at` has passed to the
    /// front of its destination queue, oldest-first (spec §4.3 step 3).
    pub fn promote_ready_backoff(&mut self, now: Timestamp) {
        let mut ready: Vec<(Timestamp, Message)> = self
            .backoff
            .iter()
            .filter(|(_, entry)| entry.available_at <= now)
            .map(|(id, _)| id.clone())
            .collect::<Vec<_>>()
            .into_iter()
            .map(|id| {
                let entry = self.backoff.remove(&id).expect("just filtered");
                (entry.available_at, entry.message)
            })
            .collect();

        // oldest-available-first, so the order they rejoin the queue front matches arrival order
        ready.sort_by_key(|(available_at, _)| *available_at);

        // `push_front` means whatever is pushed last ends up frontmost, so
        // walk the oldest-first list back-to-front: the oldest entry is
        // pushed last and lands at the very front.
        for (_, message) in ready.into_iter().rev() {
            match (&mut self.ordering, &message.ordering_key) {
                (Some(ordering), Some(key)) => ordering.push_front(key, message),
                _ => self.messages.push_front(message),
            }
        }
    }

    /// Recomputes `queue_size`/`queue_bytes` from the surviving members —
    /// the authoritative recount the cleanup sweep does after retention
    /// expiry (spec §4.8.3), avoiding drift from piecemeal increments.
    pub fn recompute_queue_accounting(&mut self) {
        let mut size = 0u64;
        let mut bytes = 0u64;
        for message in &self.messages {
            size += 1;
            bytes += message.length() as u64;
        }
        if let Some(ordering) = &self.ordering {
            for message in ordering.iter_messages() {
                size += 1;
                bytes += message.length() as u64;
            }
        }
        for entry in self.backoff.values() {
            size += 1;
            bytes += entry.message.length() as u64;
        }
        for lease in self.in_flight.values() {
            size += 1;
            bytes += lease.message.length() as u64;
        }
        self.queue_size = size;
        self.queue_bytes = bytes;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as Map;
    use std::time::Duration;

    fn msg(id: &str, key: Option<&str>) -> Message {
        Message {
            id: id.to_string(),
            data: vec![],
            attributes: Map::new(),
            publish_time: Duration::ZERO,
            ordering_key: key.map(|k| k.to_string()),
            delivery_attempt: 1,
        }
    }

    #[test]
    fn promote_ready_backoff_preserves_oldest_first_order() {
        let mut queue = SubscriptionQueue::new(false);
        queue.insert_backoff(msg("newer", None), Duration::from_secs(5));
        queue.insert_backoff(msg("older", None), Duration::from_secs(1));

        queue.promote_ready_backoff(Duration::from_secs(10));

        let order: Vec<_> = queue.messages.iter().map(|m| m.id.clone()).collect();
        assert_eq!(order, vec!["older", "newer"]);
    }

    #[test]
    fn promote_ready_backoff_preserves_per_key_order() {
        let mut queue = SubscriptionQueue::new(true);
        queue.insert_backoff(msg("newer", Some("k")), Duration::from_secs(5));
        queue.insert_backoff(msg("older", Some("k")), Duration::from_secs(1));

        queue.promote_ready_backoff(Duration::from_secs(10));

        let (_, first) = queue.ordering.as_mut().unwrap().take_next_ready().unwrap();
        assert_eq!(first.id, "older");
    }
}
