//! Pull path (spec §4.3): flow control, backoff promotion, ordering gate.
//!
//! This module selects which already-queued messages become eligible for
//! delivery; it does not mint leases. Leasing needs a handle back into the
//! whole broker (to arm a deadline timer that can call `nack` later), so
//! `Broker::pull` in `mod.rs` creates the lease for each message this
//! module selects.

use super::message::Message;
use super::queue::SubscriptionQueue;
use super::registry::SubscriptionConfig;
use super::scheduler::Scheduler;

/// Selects up to `max_messages` messages ready for delivery, respecting
/// flow control and ordering gates. Mutates the queue to remove selected
/// messages and (for ordered keys) mark them blocked; does not touch
/// `in_flight` or lease accounting.
pub fn select_for_delivery(
    queue: &mut SubscriptionQueue,
    config: &SubscriptionConfig,
    scheduler: &dyn Scheduler,
    max_messages: u32,
) -> Vec<Message> {
    let flow_control = config.flow_control.clone().unwrap_or_default();
    if !flow_control.admits_pull(queue.in_flight_count, queue.in_flight_bytes) {
        return Vec::new();
    }

    queue.promote_ready_backoff(scheduler.now());

    let mut selected = Vec::new();
    let mut in_flight_count = queue.in_flight_count;
    let mut in_flight_bytes = queue.in_flight_bytes;

    while selected.len() < max_messages as usize {
        let Some(candidate) = queue.messages.front() else {
            break;
        };
        let candidate_len = candidate.length() as u64;
        if !flow_control.admits_message(in_flight_count, in_flight_bytes, candidate_len, in_flight_count == 0) {
            break;
        }
        let message = queue.messages.pop_front().expect("just peeked");
        in_flight_count += 1;
        in_flight_bytes += candidate_len;
        selected.push(message);
    }

    if selected.len() < max_messages as usize {
        if let Some(ordering) = &mut queue.ordering {
            while selected.len() < max_messages as usize {
                let Some((_key, candidate)) = ordering.take_next_ready() else {
                    break;
                };
                let candidate_len = candidate.length() as u64;
                if !flow_control.admits_message(in_flight_count, in_flight_bytes, candidate_len, in_flight_count == 0)
                {
                    // Put it back: this key shouldn't be blocked if we can't admit it.
                    ordering.unblock(&_key);
                    ordering.push_front(&_key, candidate);
                    break;
                }
                in_flight_count += 1;
                in_flight_bytes += candidate_len;
                selected.push(candidate);
            }
        }
    }

    selected
}
