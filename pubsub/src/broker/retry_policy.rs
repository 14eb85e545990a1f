//! Nack-time retry/DLQ decision (spec §4.5).

use std::time::Duration;

use pubsub_support::retry::retry_backoff;

use super::registry::{DeadLetterPolicy, RetryPolicy};

pub enum NackOutcome {
    /// Delivery attempts exhausted; route to the dead-letter topic.
    DeadLetter,
    /// Hold the message in backoff for `Duration` before it becomes
    /// eligible for redelivery again.
    Backoff(Duration),
    /// No retry policy and no dead-letter policy block redelivery:
    /// requeue at the front of the subscription's queue immediately.
    Immediate,
}

/// `delivery_attempt` is the attempt number *after* the nack-time
/// increment (spec §4.4: "Build a new instance with `deliveryAttempt`
/// incremented. Then..."). Dead-letter takes priority over backoff: an
/// exhausted message is routed to the DLQ even if a retry policy is also
/// configured, per spec §4.5's ordering ("if a dead-letter policy applies
/// AND new deliveryAttempt > maxDeliveryAttempts").
pub fn decide_nack_outcome(
    delivery_attempt: u32,
    retry_policy: Option<&RetryPolicy>,
    dead_letter_policy: Option<&DeadLetterPolicy>,
) -> NackOutcome {
    if let Some(dlq) = dead_letter_policy {
        if delivery_attempt > dlq.max_delivery_attempts {
            return NackOutcome::DeadLetter;
        }
    }

    // Absence of an explicit retry policy is an open design choice (spec
    // §9): this implementation applies the documented default of 10-600s
    // backoff rather than immediate redelivery.
    //
    // `retry_backoff` wants the attempt that just failed, i.e. before the
    // nack-time increment this function's own `delivery_attempt` already
    // reflects (see the doc comment above).
    let policy = retry_policy.cloned().unwrap_or_default();
    let failed_attempt = delivery_attempt.saturating_sub(1);
    let backoff = retry_backoff(policy.minimum_backoff, policy.maximum_backoff, failed_attempt);
    if backoff.is_zero() {
        NackOutcome::Immediate
    } else {
        NackOutcome::Backoff(backoff)
    }
}
