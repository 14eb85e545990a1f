//! The broker engine (spec §2-§8): topics, subscriptions, per-subscription
//! queues, ordering state, leases, retry timers, flow-control accounting,
//! and fan-out routing, behind a single coarse lock (spec §5).

pub mod error;
pub mod flow_control;
pub mod lease;
pub mod message;
pub mod ordering;
pub mod publish;
pub mod pull;
pub mod queue;
pub mod registry;
pub mod retry_policy;
pub mod scheduler;
pub mod sweep;

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub use error::{BrokerResult, Code, Status};
pub use flow_control::FlowControl;
pub use message::{Message, PublishMessage};
pub use registry::{DeadLetterPolicy, RetryPolicy, SubscriptionConfig, TopicMeta};
pub use scheduler::{ManualScheduler, Scheduler, TimerHandle, TokioScheduler};

use lease::{new_ack_id, Lease};
use registry::{SubscriptionEntry, TopicEntry, MAX_ACK_DEADLINE_SECONDS, MIN_ACK_DEADLINE_SECONDS};
use retry_policy::{decide_nack_outcome, NackOutcome};

const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// A message handed to a consumer by `pull` (spec §6 "Message on-wire
/// layout"): the stored message's fields plus the fresh `ack_id` for this
/// delivery attempt.
#[derive(Clone, Debug)]
pub struct DeliveredMessage {
    pub id: String,
    pub ack_id: String,
    pub data: Vec<u8>,
    pub attributes: HashMap<String, String>,
    pub publish_time: message::Timestamp,
    pub ordering_key: Option<String>,
    pub delivery_attempt: u32,
    pub length: usize,
}

#[derive(Clone, Debug)]
pub struct BrokerConfig {
    pub scheduler: Arc<dyn Scheduler>,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            scheduler: Arc::new(TokioScheduler::new()),
        }
    }
}

#[derive(Debug)]
struct BrokerState {
    topics: HashMap<String, TopicEntry>,
    subscriptions: HashMap<String, SubscriptionEntry>,
    /// ack id -> owning subscription name; mirrors each subscription's own
    /// `in_flight` map so a bare ack id is enough to find its lease.
    lease_index: HashMap<String, String>,
}

impl BrokerState {
    fn new() -> Self {
        Self {
            topics: HashMap::new(),
            subscriptions: HashMap::new(),
            lease_index: HashMap::new(),
        }
    }
}

#[derive(Debug)]
struct Inner {
    state: Mutex<BrokerState>,
    scheduler: Arc<dyn Scheduler>,
    sweep_timer: Mutex<Option<TimerHandle>>,
}

/// An explicit broker instance (spec §9 "singleton state -> explicit
/// handle"): cheap to clone, every clone shares the same underlying state.
#[derive(Clone, Debug)]
pub struct Broker {
    inner: Arc<Inner>,
}

impl Default for Broker {
    fn default() -> Self {
        Self::new(BrokerConfig::default())
    }
}

impl Broker {
    pub fn new(config: BrokerConfig) -> Self {
        let inner = Arc::new(Inner {
            state: Mutex::new(BrokerState::new()),
            scheduler: config.scheduler,
            sweep_timer: Mutex::new(None),
        });
        start_sweep(&inner);
        Self { inner }
    }

    // ---- registry -------------------------------------------------

    pub fn register_topic(&self, name: &str, meta: Option<TopicMeta>) {
        let mut state = self.inner.state.lock().unwrap();
        match state.topics.get_mut(name) {
            Some(entry) => {
                if let Some(meta) = meta {
                    entry.meta = meta;
                }
            }
            None => {
                state.topics.insert(name.to_string(), TopicEntry::new(meta.unwrap_or_default()));
            }
        }
    }

    pub fn unregister_topic(&self, name: &str) {
        let mut state = self.inner.state.lock().unwrap();
        let Some(entry) = state.topics.remove(name) else {
            return;
        };
        for sub_name in entry.subscriptions {
            if let Some(sub) = state.subscriptions.get_mut(&sub_name) {
                clear_subscription_queue(sub, &mut state.lease_index);
            }
        }
    }

    pub fn topic_exists(&self, name: &str) -> bool {
        self.inner.state.lock().unwrap().topics.contains_key(name)
    }

    pub fn get_topic(&self, name: &str) -> Option<TopicMeta> {
        self.inner.state.lock().unwrap().topics.get(name).map(|t| t.meta.clone())
    }

    pub fn list_topics(&self) -> Vec<String> {
        self.inner.state.lock().unwrap().topics.keys().cloned().collect()
    }

    pub fn register_subscription(&self, name: &str, topic: &str, config: SubscriptionConfig) -> BrokerResult<()> {
        if config.ack_deadline_seconds < MIN_ACK_DEADLINE_SECONDS || config.ack_deadline_seconds > MAX_ACK_DEADLINE_SECONDS {
            return Err(Status::invalid_argument(format!(
                "ack_deadline_seconds must be in [{MIN_ACK_DEADLINE_SECONDS}, {MAX_ACK_DEADLINE_SECONDS}]"
            )));
        }
        let mut state = self.inner.state.lock().unwrap();
        if !state.topics.contains_key(topic) {
            return Err(Status::not_found(format!("topic '{topic}' does not exist")));
        }
        if let Some(existing) = state.subscriptions.get_mut(name) {
            existing.config = config;
        } else {
            state.subscriptions.insert(name.to_string(), SubscriptionEntry::new(topic.to_string(), config));
            if let Some(topic_entry) = state.topics.get_mut(topic) {
                topic_entry.subscriptions.push(name.to_string());
            }
        }
        Ok(())
    }

    pub fn unregister_subscription(&self, name: &str) {
        let mut state = self.inner.state.lock().unwrap();
        let Some(mut sub) = state.subscriptions.remove(name) else {
            return;
        };
        clear_subscription_queue(&mut sub, &mut state.lease_index);
        if let Some(topic_entry) = state.topics.get_mut(&sub.topic) {
            topic_entry.subscriptions.retain(|s| s != name);
        }
    }

    pub fn subscription_exists(&self, name: &str) -> bool {
        self.inner.state.lock().unwrap().subscriptions.contains_key(name)
    }

    /// Returns the bound topic name and current config for `name`, mirroring
    /// `get_topic` (spec §4.1's "parallel operations for subscriptions").
    pub fn get_subscription(&self, name: &str) -> Option<(String, SubscriptionConfig)> {
        self.inner
            .state
            .lock()
            .unwrap()
            .subscriptions
            .get(name)
            .map(|sub| (sub.topic.clone(), sub.config.clone()))
    }

    pub fn list_subscriptions(&self) -> Vec<String> {
        self.inner.state.lock().unwrap().subscriptions.keys().cloned().collect()
    }

    // ---- publish ----------------------------------------------------

    pub fn publish(&self, topic: &str, messages: Vec<PublishMessage>) -> BrokerResult<Vec<String>> {
        let mut state = self.inner.state.lock().unwrap();
        let state = &mut *state;
        publish::publish(&state.topics, &mut state.subscriptions, self.inner.scheduler.as_ref(), topic, messages)
    }

    // ---- pull / lease -------------------------------------------------

    pub fn pull(&self, subscription: &str, max_messages: u32) -> BrokerResult<Vec<DeliveredMessage>> {
        let mut guard = self.inner.state.lock().unwrap();
        let state = &mut *guard;
        let now = self.inner.scheduler.now();

        let (selected, ack_deadline_seconds) = {
            let sub = state
                .subscriptions
                .get_mut(subscription)
                .ok_or_else(|| Status::not_found(format!("subscription '{subscription}' does not exist")))?;
            let selected =
                pull::select_for_delivery(&mut sub.queue, &sub.config, self.inner.scheduler.as_ref(), max_messages);
            (selected, sub.config.ack_deadline_seconds)
        };

        let mut delivered = Vec::with_capacity(selected.len());
        for message in selected {
            let ack_id = new_ack_id(&message.id, message.delivery_attempt);
            let deadline = now + Duration::from_secs(ack_deadline_seconds as u64);
            let inner = self.inner.clone();
            let timer_ack_id = ack_id.clone();
            let timer = self.inner.scheduler.schedule_once(
                Duration::from_secs(ack_deadline_seconds as u64),
                Box::new(move || {
                    if let Err(err) = nack_internal(&inner, &timer_ack_id) {
                        tracing::debug!(ack_id = timer_ack_id.as_str(), %err, "deadline-expiry nack found no live lease");
                    }
                }),
            );

            delivered.push(DeliveredMessage {
                id: message.id.clone(),
                ack_id: ack_id.clone(),
                data: message.data.clone(),
                attributes: message.attributes.clone(),
                publish_time: message.publish_time,
                ordering_key: message.ordering_key.clone(),
                delivery_attempt: message.delivery_attempt,
                length: message.length(),
            });

            state.lease_index.insert(ack_id.clone(), subscription.to_string());
            let sub = state.subscriptions.get_mut(subscription).expect("subscription still exists");
            sub.queue.insert_lease(Lease {
                message,
                ack_id,
                subscription: subscription.to_string(),
                deadline,
                created_at: now,
                extension_count: 0,
                timer,
            });
        }

        Ok(delivered)
    }

    pub fn ack(&self, ack_id: &str) -> BrokerResult<()> {
        ack_internal(&self.inner, ack_id)
    }

    pub fn nack(&self, ack_id: &str) -> BrokerResult<()> {
        nack_internal(&self.inner, ack_id)
    }

    pub fn modify_ack_deadline(&self, ack_id: &str, seconds: i32) -> BrokerResult<()> {
        if !(0..=MAX_ACK_DEADLINE_SECONDS as i32).contains(&seconds) {
            return Err(Status::invalid_argument(format!(
                "seconds must be in [0, {MAX_ACK_DEADLINE_SECONDS}]"
            )));
        }
        if seconds == 0 {
            return nack_internal(&self.inner, ack_id);
        }

        let mut state = self.inner.state.lock().unwrap();
        let sub_name = state
            .lease_index
            .get(ack_id)
            .cloned()
            .ok_or_else(|| Status::invalid_argument(format!("unknown ack id '{ack_id}'")))?;
        let sub = state
            .subscriptions
            .get_mut(&sub_name)
            .ok_or_else(|| Status::failed_precondition("subscription no longer exists"))?;
        let lease = sub
            .queue
            .in_flight
            .get_mut(ack_id)
            .ok_or_else(|| Status::invalid_argument(format!("unknown ack id '{ack_id}'")))?;

        lease.timer.cancel();
        let now = self.inner.scheduler.now();
        lease.deadline = now + Duration::from_secs(seconds as u64);
        lease.extension_count += 1;

        let inner = self.inner.clone();
        let timer_ack_id = ack_id.to_string();
        lease.timer = self.inner.scheduler.schedule_once(
            Duration::from_secs(seconds as u64),
            Box::new(move || {
                if let Err(err) = nack_internal(&inner, &timer_ack_id) {
                    tracing::debug!(ack_id = timer_ack_id.as_str(), %err, "deadline-expiry nack found no live lease");
                }
            }),
        );
        Ok(())
    }

    pub fn shutdown(&self) {
        if let Some(timer) = self.inner.sweep_timer.lock().unwrap().take() {
            timer.cancel();
        }
        let state = self.inner.state.lock().unwrap();
        for sub in state.subscriptions.values() {
            for lease in sub.queue.in_flight.values() {
                lease.timer.cancel();
            }
        }
    }
}

fn clear_subscription_queue(sub: &mut SubscriptionEntry, lease_index: &mut HashMap<String, String>) {
    for ack_id in sub.queue.in_flight.keys() {
        lease_index.remove(ack_id);
    }
    for lease in sub.queue.in_flight.values() {
        lease.timer.cancel();
    }
    sub.queue = queue::SubscriptionQueue::new(sub.config.enable_message_ordering);
}

fn ack_internal(inner: &Arc<Inner>, ack_id: &str) -> BrokerResult<()> {
    let mut state = inner.state.lock().unwrap();
    let sub_name = state
        .lease_index
        .remove(ack_id)
        .ok_or_else(|| Status::invalid_argument(format!("unknown ack id '{ack_id}'")))?;
    let sub = state
        .subscriptions
        .get_mut(&sub_name)
        .ok_or_else(|| Status::failed_precondition("subscription no longer exists"))?;
    let lease = sub
        .queue
        .remove_lease(ack_id)
        .ok_or_else(|| Status::invalid_argument(format!("unknown ack id '{ack_id}'")))?;
    lease.timer.cancel();
    sub.queue.decrement_queue_accounting(&lease.message);
    if let (Some(ordering), Some(key)) = (&mut sub.queue.ordering, &lease.message.ordering_key) {
        ordering.unblock(key);
    }
    Ok(())
}

fn nack_internal(inner: &Arc<Inner>, ack_id: &str) -> BrokerResult<()> {
    let (dlq_publish, dlq_topic) = {
        let mut state = inner.state.lock().unwrap();
        let sub_name = state
            .lease_index
            .remove(ack_id)
            .ok_or_else(|| Status::invalid_argument(format!("unknown ack id '{ack_id}'")))?;
        let sub = state
            .subscriptions
            .get_mut(&sub_name)
            .ok_or_else(|| Status::failed_precondition("subscription no longer exists"))?;
        let lease = sub
            .queue
            .remove_lease(ack_id)
            .ok_or_else(|| Status::invalid_argument(format!("unknown ack id '{ack_id}'")))?;
        lease.timer.cancel();

        if let (Some(ordering), Some(key)) = (&mut sub.queue.ordering, &lease.message.ordering_key) {
            ordering.unblock(key);
        }

        let incremented_attempt = lease.message.delivery_attempt + 1;
        let outcome = decide_nack_outcome(
            incremented_attempt,
            sub.config.retry_policy.as_ref(),
            sub.config.dead_letter_policy.as_ref(),
        );

        match outcome {
            NackOutcome::DeadLetter => {
                sub.queue.decrement_queue_accounting(&lease.message);
                let dlq_topic = sub.config.dead_letter_policy.as_ref().unwrap().dead_letter_topic.clone();
                (Some(lease.message.to_dead_letter_publish()), Some(dlq_topic))
            }
            NackOutcome::Backoff(backoff) => {
                let mut message = lease.message;
                message.delivery_attempt = incremented_attempt;
                let available_at = inner.scheduler.now() + backoff;
                sub.queue.insert_backoff(message, available_at);
                (None, None)
            }
            NackOutcome::Immediate => {
                let mut message = lease.message;
                message.delivery_attempt = incremented_attempt;
                match (&mut sub.queue.ordering, &message.ordering_key) {
                    (Some(ordering), Some(key)) => ordering.push_front(key, message),
                    _ => sub.queue.messages.push_front(message),
                }
                (None, None)
            }
        }
    };

    if let (Some(publish_message), Some(topic)) = (dlq_publish, dlq_topic) {
        let mut state = inner.state.lock().unwrap();
        let state = &mut *state;
        match publish::publish(&state.topics, &mut state.subscriptions, inner.scheduler.as_ref(), &topic, vec![publish_message]) {
            Ok(_) => {}
            Err(err) => {
                tracing::warn!(topic = topic.as_str(), %err, "dead-letter topic missing; dropping message");
            }
        }
    }

    Ok(())
}

fn start_sweep(inner: &Arc<Inner>) {
    let sweep_inner = inner.clone();
    let handle = inner.scheduler.schedule_interval(
        SWEEP_INTERVAL,
        Arc::new(move || run_sweep(&sweep_inner)),
    );
    *inner.sweep_timer.lock().unwrap() = Some(handle);
}

/// The sweep is wrapped so a single bad subscription's data never takes
/// down the periodic tick for everyone else (spec §7).
fn run_sweep(inner: &Arc<Inner>) {
    let result = std::panic::catch_unwind(AssertUnwindSafe(|| {
        let mut state = inner.state.lock().unwrap();
        let state = &mut *state;
        let now = inner.scheduler.now();

        for sub in state.subscriptions.values_mut() {
            let expired = sweep::reclaim_expired_leases(&mut sub.queue, now);
            for ack_id in expired {
                state.lease_index.remove(&ack_id);
            }
            sweep::expire_retained_messages(&mut sub.queue, now, sub.config.message_retention);
        }

        let orphaned = sweep::find_orphaned_lease_ids(&state.lease_index, &state.subscriptions);
        for ack_id in orphaned {
            state.lease_index.remove(&ack_id);
        }
    }));
    if let Err(panic) = result {
        tracing::error!(?panic, "cleanup sweep panicked; skipping this tick");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[ctor::ctor]
    fn init_test_tracing() {
        std::env::set_var("RUST_LOG", "pubsub=trace");
        let _ = tracing_subscriber::fmt::try_init();
    }

    fn broker_with_manual() -> (Broker, Arc<ManualScheduler>) {
        let scheduler = Arc::new(ManualScheduler::new());
        let broker = Broker::new(BrokerConfig {
            scheduler: scheduler.clone(),
        });
        (broker, scheduler)
    }

    fn publish_one(broker: &Broker, topic: &str, data: &[u8]) -> String {
        broker
            .publish(
                topic,
                vec![PublishMessage {
                    data: data.to_vec(),
                    ..Default::default()
                }],
            )
            .unwrap()
            .remove(0)
    }

    #[test]
    fn s1_basic_publish_pull_ack() {
        let (broker, _scheduler) = broker_with_manual();
        broker.register_topic("T", None);
        broker.register_subscription("S", "T", SubscriptionConfig::default()).unwrap();

        publish_one(&broker, "T", b"hello");
        let pulled = broker.pull("S", 10).unwrap();
        assert_eq!(pulled.len(), 1);
        assert_eq!(pulled[0].data, b"hello");
        assert!(!pulled[0].id.is_empty());
        assert!(!pulled[0].ack_id.is_empty());
        assert_eq!(pulled[0].delivery_attempt, 1);

        broker.ack(&pulled[0].ack_id).unwrap();
        let second = broker.pull("S", 10).unwrap();
        assert!(second.is_empty());
    }

    #[test]
    fn s2_fan_out_shares_ids_and_preserves_order() {
        let (broker, _scheduler) = broker_with_manual();
        broker.register_topic("T", None);
        broker.register_subscription("A", "T", SubscriptionConfig::default()).unwrap();
        broker.register_subscription("B", "T", SubscriptionConfig::default()).unwrap();

        let ids = broker
            .publish(
                "T",
                vec![
                    PublishMessage { data: b"m1".to_vec(), ..Default::default() },
                    PublishMessage { data: b"m2".to_vec(), ..Default::default() },
                ],
            )
            .unwrap();

        let a = broker.pull("A", 10).unwrap();
        let b = broker.pull("B", 10).unwrap();
        assert_eq!(a.iter().map(|m| m.id.clone()).collect::<Vec<_>>(), ids);
        assert_eq!(b.iter().map(|m| m.id.clone()).collect::<Vec<_>>(), ids);

        broker.ack(&a[0].ack_id).unwrap();
        let b_again = broker.pull("B", 10).unwrap();
        assert!(b_again.is_empty());
    }

    #[test]
    fn s3_nack_redelivers_with_incremented_attempt() {
        let (broker, scheduler) = broker_with_manual();
        broker.register_topic("T", None);
        broker.register_subscription("S", "T", SubscriptionConfig::default()).unwrap();
        publish_one(&broker, "T", b"x");

        let first = broker.pull("S", 10).unwrap();
        assert_eq!(first[0].delivery_attempt, 1);
        broker.nack(&first[0].ack_id).unwrap();

        // default backoff applies in the absence of a retry policy; advance
        // the virtual clock past it before redelivery is eligible.
        scheduler.advance(Duration::from_secs(10));
        let second = broker.pull("S", 10).unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].id, first[0].id);
        assert_eq!(second[0].delivery_attempt, 2);
    }

    #[test]
    fn s4_ordering_delivers_one_key_at_a_time() {
        let (broker, _scheduler) = broker_with_manual();
        broker.register_topic("T", None);
        broker
            .register_subscription(
                "S",
                "T",
                SubscriptionConfig {
                    enable_message_ordering: true,
                    ..Default::default()
                },
            )
            .unwrap();

        for data in ["1", "2", "3"] {
            broker
                .publish(
                    "T",
                    vec![PublishMessage {
                        data: data.as_bytes().to_vec(),
                        ordering_key: Some("k".to_string()),
                        ..Default::default()
                    }],
                )
                .unwrap();
        }

        let p1 = broker.pull("S", 10).unwrap();
        assert_eq!(p1.len(), 1);
        assert_eq!(p1[0].data, b"1");
        broker.ack(&p1[0].ack_id).unwrap();

        let p2 = broker.pull("S", 10).unwrap();
        assert_eq!(p2.len(), 1);
        assert_eq!(p2[0].data, b"2");
        broker.ack(&p2[0].ack_id).unwrap();

        let p3 = broker.pull("S", 10).unwrap();
        assert_eq!(p3.len(), 1);
        assert_eq!(p3[0].data, b"3");
    }

    #[test]
    fn s5_dead_letter_after_max_delivery_attempts() {
        let (broker, scheduler) = broker_with_manual();
        broker.register_topic("T", None);
        broker.register_topic("DLQ", None);
        broker
            .register_subscription(
                "S",
                "T",
                SubscriptionConfig {
                    dead_letter_policy: Some(DeadLetterPolicy {
                        dead_letter_topic: "DLQ".to_string(),
                        max_delivery_attempts: 2,
                    }),
                    ..Default::default()
                },
            )
            .unwrap();
        broker.register_subscription("D", "DLQ", SubscriptionConfig::default()).unwrap();

        publish_one(&broker, "T", b"boom");

        let p1 = broker.pull("S", 10).unwrap();
        broker.nack(&p1[0].ack_id).unwrap();

        // no retry policy is configured, so the first nack (attempt 1 -> 2,
        // not yet past max_delivery_attempts) takes the default 10-600s
        // backoff branch; advance past its 10s minimum before the message
        // is eligible for redelivery again.
        scheduler.advance(Duration::from_secs(10));
        let p2 = broker.pull("S", 10).unwrap();
        broker.nack(&p2[0].ack_id).unwrap();

        let dlq = broker.pull("D", 10).unwrap();
        assert_eq!(dlq.len(), 1);
        assert_eq!(dlq[0].data, b"boom");
        assert_eq!(dlq[0].delivery_attempt, 1);
        assert_eq!(dlq[0].publish_time, p1[0].publish_time);

        let empty = broker.pull("S", 10).unwrap();
        assert!(empty.is_empty());
    }

    #[test]
    fn s6_flow_control_gates_pull() {
        let (broker, _scheduler) = broker_with_manual();
        broker.register_topic("T", None);
        broker
            .register_subscription(
                "S",
                "T",
                SubscriptionConfig {
                    flow_control: Some(FlowControl {
                        max_messages: Some(2),
                        ..Default::default()
                    }),
                    ..Default::default()
                },
            )
            .unwrap();

        for i in 0..5 {
            publish_one(&broker, "T", format!("m{i}").as_bytes());
        }

        let first = broker.pull("S", 10).unwrap();
        assert_eq!(first.len(), 2);
        let again = broker.pull("S", 10).unwrap();
        assert!(again.is_empty());

        broker.ack(&first[0].ack_id).unwrap();
        let third = broker.pull("S", 10).unwrap();
        assert_eq!(third.len(), 1);
    }

    #[test]
    fn unknown_ack_id_fails_invalid_argument() {
        let (broker, _scheduler) = broker_with_manual();
        let err = broker.ack("nonexistent").unwrap_err();
        assert_eq!(err.code(), Code::InvalidArgument);
    }

    #[test]
    fn publish_to_unknown_topic_fails_not_found() {
        let (broker, _scheduler) = broker_with_manual();
        let err = broker.publish("nope", vec![PublishMessage::default()]).unwrap_err();
        assert_eq!(err.code(), Code::NotFound);
    }

    #[test]
    fn deadline_expiry_redelivers_like_a_client_nack() {
        let (broker, scheduler) = broker_with_manual();
        broker.register_topic("T", None);
        broker
            .register_subscription(
                "S",
                "T",
                SubscriptionConfig {
                    ack_deadline_seconds: 10,
                    ..Default::default()
                },
            )
            .unwrap();
        publish_one(&broker, "T", b"x");
        let first = broker.pull("S", 10).unwrap();
        assert_eq!(first.len(), 1);

        scheduler.advance(Duration::from_secs(10));
        scheduler.advance(Duration::from_secs(10));
        let second = broker.pull("S", 10).unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].delivery_attempt, 2);
    }
}
