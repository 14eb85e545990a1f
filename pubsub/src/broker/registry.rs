//! Topic/subscription metadata and lifecycle (spec §4.1).

use std::collections::HashMap;
use std::time::Duration;

use super::flow_control::FlowControl;
use super::queue::SubscriptionQueue;

pub const MIN_ACK_DEADLINE_SECONDS: u32 = 10;
pub const MAX_ACK_DEADLINE_SECONDS: u32 = 600;
pub const DEFAULT_ACK_DEADLINE_SECONDS: u32 = 10;

pub const MIN_MESSAGE_RETENTION: Duration = Duration::from_secs(600);
pub const MAX_MESSAGE_RETENTION: Duration = Duration::from_secs(604_800);
pub const DEFAULT_MESSAGE_RETENTION: Duration = Duration::from_secs(604_800);

pub const SUBSCRIPTION_QUEUE_MAX_MESSAGES: u64 = 10_000;
pub const SUBSCRIPTION_QUEUE_MAX_BYTES: u64 = 100 * 1024 * 1024;

/// Caller-supplied metadata attached to a topic; opaque to the broker
/// beyond being stored and handed back by `get_topic`.
#[derive(Clone, Debug, Default)]
pub struct TopicMeta {
    pub labels: HashMap<String, String>,
}

#[derive(Debug)]
pub struct TopicEntry {
    pub meta: TopicMeta,
    pub subscriptions: Vec<String>,
}

impl TopicEntry {
    pub fn new(meta: TopicMeta) -> Self {
        Self {
            meta,
            subscriptions: Vec::new(),
        }
    }
}

/// `minimumBackoff`/`maximumBackoff` in seconds (spec §4.5), defaulting to
/// 10s/600s when a retry policy is configured but a field is left unset.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    pub minimum_backoff: Duration,
    pub maximum_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            minimum_backoff: Duration::from_secs(10),
            maximum_backoff: Duration::from_secs(600),
        }
    }
}

#[derive(Clone, Debug)]
pub struct DeadLetterPolicy {
    pub dead_letter_topic: String,
    pub max_delivery_attempts: u32,
}

/// Options accepted by `register_subscription`; everything here has a
/// cloud-compatible default so a bare `SubscriptionConfig::default()`
/// behaves like an unordered, unlimited, no-retry-policy subscription.
#[derive(Clone, Debug)]
pub struct SubscriptionConfig {
    pub ack_deadline_seconds: u32,
    pub enable_message_ordering: bool,
    pub retry_policy: Option<RetryPolicy>,
    pub dead_letter_policy: Option<DeadLetterPolicy>,
    pub flow_control: Option<FlowControl>,
    pub message_retention: Duration,
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        Self {
            ack_deadline_seconds: DEFAULT_ACK_DEADLINE_SECONDS,
            enable_message_ordering: false,
            retry_policy: None,
            dead_letter_policy: None,
            flow_control: None,
            message_retention: DEFAULT_MESSAGE_RETENTION,
        }
    }
}

#[derive(Debug)]
pub struct SubscriptionEntry {
    pub topic: String,
    pub config: SubscriptionConfig,
    pub queue: SubscriptionQueue,
}

impl SubscriptionEntry {
    pub fn new(topic: String, config: SubscriptionConfig) -> Self {
        let queue = SubscriptionQueue::new(config.enable_message_ordering);
        Self { topic, config, queue }
    }
}
