//! Periodic cleanup sweep (spec §4.8): expired leases, orphaned leases,
//! retention expiry. Runs under the broker lock, bounded per tick (one
//! pass over each collection, never quadratic).

use std::collections::HashMap;
use std::time::Duration;

use super::message::Timestamp;
use super::queue::SubscriptionQueue;
use super::registry::SubscriptionEntry;

/// Leases older than this are assumed abandoned by their client and
/// reclaimed unconditionally; this is a safety net on top of the normal
/// timer-driven deadline expiry.
pub const EXPIRED_LEASE_AGE: Duration = Duration::from_secs(600);

/// Removes leases created more than `EXPIRED_LEASE_AGE` ago, cancelling
/// their timers and releasing any ordering-key block. Returns the ack ids
/// reclaimed so the caller can drop them from the broker-wide lease index.
pub fn reclaim_expired_leases(queue: &mut SubscriptionQueue, now: Timestamp) -> Vec<String> {
    let expired: Vec<String> = queue
        .in_flight
        .iter()
        .filter(|(_, lease)| now.saturating_sub(lease.created_at) >= EXPIRED_LEASE_AGE)
        .map(|(ack_id, _)| ack_id.clone())
        .collect();

    for ack_id in &expired {
        if let Some(lease) = queue.remove_lease(ack_id) {
            lease.timer.cancel();
            if let (Some(ordering), Some(key)) = (&mut queue.ordering, &lease.message.ordering_key) {
                ordering.unblock(key);
            }
        }
    }
    expired
}

/// Invariant repair (spec §4.8.2): removes ack ids present in the
/// broker-wide lease index but no longer present in their subscription's
/// `in_flight` map. Returns those ack ids should this happen.
pub fn find_orphaned_lease_ids(
    lease_index: &HashMap<String, String>,
    subscriptions: &HashMap<String, SubscriptionEntry>,
) -> Vec<String> {
    lease_index
        .iter()
        .filter(|(ack_id, sub_name)| {
            !subscriptions
                .get(*sub_name)
                .is_some_and(|sub| sub.queue.in_flight.contains_key(*ack_id))
        })
        .map(|(ack_id, _)| ack_id.clone())
        .collect()
}

/// Retention expiry (spec §4.8.3): drops messages older than
/// `retention` from the main queue, every ordering queue, and the
/// backoff queue. In-flight leases are untouched. Recomputes
/// `queue_size`/`queue_bytes` from survivors afterward.
pub fn expire_retained_messages(queue: &mut SubscriptionQueue, now: Timestamp, retention: Duration) {
    let cutoff = now.saturating_sub(retention);

    queue.messages.retain(|m| m.publish_time >= cutoff);
    if let Some(ordering) = &mut queue.ordering {
        ordering.retain(|m| m.publish_time >= cutoff);
    }
    queue.backoff.retain(|_, entry| entry.message.publish_time >= cutoff);

    queue.recompute_queue_accounting();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::lease::Lease;
    use crate::broker::message::Message;
    use crate::broker::scheduler::{ManualScheduler, Scheduler, TimerHandle};
    use std::collections::HashMap as Map;

    fn msg(id: &str, publish_time: Duration) -> Message {
        Message {
            id: id.to_string(),
            data: vec![],
            attributes: Map::new(),
            publish_time,
            ordering_key: None,
            delivery_attempt: 1,
        }
    }

    fn handle() -> TimerHandle {
        let scheduler = ManualScheduler::new();
        scheduler.schedule_once(Duration::from_secs(1), Box::new(|| {}))
    }

    #[test]
    fn expired_lease_reclaimed_after_ten_minutes() {
        let mut queue = SubscriptionQueue::new(false);
        queue.insert_lease(Lease {
            message: msg("1", Duration::ZERO),
            ack_id: "a1".to_string(),
            subscription: "S".to_string(),
            deadline: Duration::from_secs(10),
            created_at: Duration::ZERO,
            extension_count: 0,
            timer: handle(),
        });
        let reclaimed = reclaim_expired_leases(&mut queue, Duration::from_secs(599));
        assert!(reclaimed.is_empty());
        let reclaimed = reclaim_expired_leases(&mut queue, Duration::from_secs(600));
        assert_eq!(reclaimed, vec!["a1".to_string()]);
        assert_eq!(queue.in_flight_count, 0);
    }

    #[test]
    fn retention_drops_old_messages_and_recounts() {
        let mut queue = SubscriptionQueue::new(false);
        queue.enqueue_published(msg("old", Duration::ZERO));
        queue.enqueue_published(msg("new", Duration::from_secs(500_000)));
        expire_retained_messages(&mut queue, Duration::from_secs(604_800), Duration::from_secs(604_800));
        assert_eq!(queue.messages.len(), 1);
        assert_eq!(queue.messages[0].id, "new");
        assert_eq!(queue.queue_size, 1);
    }

    #[test]
    fn orphaned_lease_detected() {
        let mut lease_index = Map::new();
        lease_index.insert("stale-ack".to_string(), "S".to_string());
        let mut subscriptions = Map::new();
        subscriptions.insert(
            "S".to_string(),
            SubscriptionEntry::new("T".to_string(), crate::broker::registry::SubscriptionConfig::default()),
        );
        let orphaned = find_orphaned_lease_ids(&lease_index, &subscriptions);
        assert_eq!(orphaned, vec!["stale-ack".to_string()]);
    }
}
