//! The lease manager's data type (spec §4.4). The operations — create,
//! ack, nack, modify-deadline — live on `Broker` in `mod.rs`, since they
//! touch the subscription queue, the broker-wide lease index, the retry/DLQ
//! policy and the scheduler all at once.

use super::message::{Message, Timestamp};
use super::scheduler::TimerHandle;

/// The broker-side record of one delivery attempt of one message.
#[derive(Debug)]
pub struct Lease {
    pub message: Message,
    pub ack_id: String,
    pub subscription: String,
    pub deadline: Timestamp,
    pub created_at: Timestamp,
    pub extension_count: u32,
    pub timer: TimerHandle,
}

/// `<messageId>-<deliveryAttempt>-<random>`, fresh per delivery attempt.
pub fn new_ack_id(message_id: &str, delivery_attempt: u32) -> String {
    format!("{message_id}-{delivery_attempt}-{}", uuid::Uuid::new_v4().simple())
}
