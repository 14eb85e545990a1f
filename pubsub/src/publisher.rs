//! Publish-side batching layer (spec §1 "A publisher batching layer that
//! coalesces publishes before calling the core's publish entry point";
//! §9's wrapper-layer design notes). Ordering-key messages are sharded to a
//! dedicated per-key worker so that messages sharing a key are always
//! bundled and flushed by the same task in arrival order; unordered
//! messages fan out across a shared worker pool. Each worker batches by
//! `bundle_size`/`flush_interval`, then calls `Broker::publish` once per
//! flushed bundle. None of the ordering, flow-control, retry/DLQ or lease
//! bookkeeping lives here — it all stays in `crate::broker`.

use async_channel::{Receiver, TryRecvError};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tokio::select;
use tokio::sync::oneshot;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use pubsub_support::cancel::CancellationToken;
use pubsub_support::status::Status;

use crate::broker::{Broker, PublishMessage};
use crate::util::ToUsize;

pub(crate) struct ReservedMessage {
    pub producer: oneshot::Sender<Result<String, Status>>,
    pub message: PublishMessage,
}

#[derive(Clone, Debug)]
pub struct PublisherConfig {
    /// Worker count for unordered messages; also the shard count for
    /// ordering-key messages.
    pub workers: usize,
    /// Interval on which each worker flushes its bundle.
    pub flush_interval: Duration,
    /// Bundle size that triggers an early flush, ahead of `flush_interval`.
    pub bundle_size: usize,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            workers: 3,
            flush_interval: Duration::from_millis(100),
            bundle_size: 3,
        }
    }
}

/// Resolves to the broker-assigned message id once the bundle containing
/// this message has been flushed and published.
pub struct Awaiter {
    consumer: oneshot::Receiver<Result<String, Status>>,
}

impl Awaiter {
    pub(crate) fn new(consumer: oneshot::Receiver<Result<String, Status>>) -> Self {
        Self { consumer }
    }

    pub async fn get(self, cancel: Option<CancellationToken>) -> Result<String, Status> {
        let onetime = self.consumer;
        let awaited = match cancel {
            Some(cancel) => {
                select! {
                    _ = cancel.cancelled() => return Err(Status::internal("cancelled")),
                    v = onetime => v,
                }
            }
            None => onetime.await,
        };
        match awaited {
            Ok(v) => v,
            Err(_closed) => Err(Status::internal("publisher closed before the message was flushed")),
        }
    }
}

/// Batches publishes the way a real pub/sub client batches network calls,
/// even though the underlying `Broker::publish` is an in-process call with
/// no round trip to amortize. Same-ordering-key messages are routed to the
/// same worker (via `ToUsize`) so that same-key batches are flushed in a
/// single call and stay in order; unordered messages fan out across a
/// shared worker pool.
#[derive(Clone, Debug)]
pub struct Publisher {
    ordering_senders: Arc<Vec<async_channel::Sender<ReservedMessage>>>,
    sender: async_channel::Sender<ReservedMessage>,
    tasks: Arc<Mutex<Tasks>>,
    topic: String,
    broker: Broker,
}

impl Publisher {
    pub(crate) fn new(topic: String, broker: Broker, config: Option<PublisherConfig>) -> Self {
        let config = config.unwrap_or_default();
        let (sender, receiver) = async_channel::unbounded::<ReservedMessage>();
        let mut receivers = Vec::with_capacity(config.workers * 2);
        let mut ordering_senders = Vec::with_capacity(config.workers);

        // unordered messages: every worker shares one receiver
        for _ in 0..config.workers {
            tracing::trace!(topic = topic.as_str(), "start unordered publish worker");
            receivers.push(receiver.clone());
        }

        // ordering-key messages: one dedicated channel per shard
        for _ in 0..config.workers {
            tracing::trace!(topic = topic.as_str(), "start ordered publish worker");
            let (sender, receiver) = async_channel::unbounded::<ReservedMessage>();
            receivers.push(receiver);
            ordering_senders.push(sender);
        }

        Self {
            sender,
            ordering_senders: Arc::new(ordering_senders),
            tasks: Arc::new(Mutex::new(Tasks::new(topic.clone(), broker.clone(), receivers, &config))),
            topic,
            broker,
        }
    }

    /// Publishes `messages` to the broker synchronously, bypassing batching
    /// entirely.
    pub async fn publish_immediately(&self, messages: Vec<PublishMessage>) -> Result<Vec<String>, Status> {
        self.broker.publish(&self.topic, messages)
    }

    /// Enqueues `message` for the next bundle flush. Never blocks on the
    /// broker; returns an `Awaiter` that resolves once that bundle is sent.
    pub async fn publish(&self, message: PublishMessage) -> Awaiter {
        if self.sender.is_closed() {
            let (tx, rx) = oneshot::channel();
            drop(tx);
            return Awaiter::new(rx);
        }

        let (producer, consumer) = oneshot::channel();
        match message.ordering_key.as_deref() {
            Some(key) if !key.is_empty() => {
                let index = key.to_usize() % self.ordering_senders.len();
                let _ = self.ordering_senders[index].send(ReservedMessage { producer, message }).await;
            }
            _ => {
                let _ = self.sender.send(ReservedMessage { producer, message }).await;
            }
        }
        Awaiter::new(consumer)
    }

    pub async fn shutdown(&mut self) {
        self.sender.close();
        for s in self.ordering_senders.iter() {
            s.close();
        }
        self.tasks.lock().await.done().await;
    }
}

#[derive(Debug)]
struct Tasks {
    inner: Option<Vec<JoinHandle<()>>>,
}

impl Tasks {
    fn new(topic: String, broker: Broker, receivers: Vec<Receiver<ReservedMessage>>, config: &PublisherConfig) -> Self {
        let tasks = receivers
            .into_iter()
            .map(|receiver| Self::run_task(receiver, broker.clone(), topic.clone(), config.flush_interval, config.bundle_size))
            .collect();
        Self { inner: Some(tasks) }
    }

    fn run_task(
        receiver: Receiver<ReservedMessage>,
        broker: Broker,
        topic: String,
        flush_interval: Duration,
        bundle_size: usize,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval_timer = tokio::time::interval(flush_interval);
            let mut bundle = VecDeque::<ReservedMessage>::new();
            while !receiver.is_closed() {
                interval_timer.tick().await;

                loop {
                    match receiver.try_recv() {
                        Ok(message) => {
                            bundle.push_back(message);
                            if bundle.len() >= bundle_size {
                                tracing::trace!(bundle_size = bundle.len(), topic = topic.as_str(), "flush: bundle full");
                                Self::flush(&broker, topic.as_str(), &mut bundle);
                                break;
                            }
                        }
                        Err(TryRecvError::Empty) => {
                            if !bundle.is_empty() {
                                tracing::trace!(topic = topic.as_str(), "flush: interval elapsed");
                                Self::flush(&broker, topic.as_str(), &mut bundle);
                            }
                            break;
                        }
                        Err(TryRecvError::Closed) => break,
                    }
                }
            }

            tracing::trace!(topic = topic.as_str(), "stop publish worker");
            if !bundle.is_empty() {
                Self::flush(&broker, topic.as_str(), &mut bundle);
            }
        })
    }

    /// Publishes every message in `bundle` as a single `Broker::publish`
    /// call and notifies each message's `Awaiter` with its assigned id (or
    /// the shared failure, if the whole bundle was rejected).
    fn flush(broker: &Broker, topic: &str, bundle: &mut VecDeque<ReservedMessage>) {
        let mut data = Vec::with_capacity(bundle.len());
        let mut callbacks = Vec::with_capacity(bundle.len());
        while let Some(reserved) = bundle.pop_front() {
            data.push(reserved.message);
            callbacks.push(reserved.producer);
        }

        match broker.publish(topic, data) {
            Ok(ids) => {
                for (id, callback) in ids.into_iter().zip(callbacks.into_iter()) {
                    if callback.send(Ok(id.clone())).is_err() {
                        tracing::error!(message_id = id.as_str(), "failed to notify publisher awaiter");
                    }
                }
            }
            Err(status) => {
                for callback in callbacks {
                    if callback.send(Err(status.clone())).is_err() {
                        tracing::error!(%status, "failed to notify publisher awaiter of error");
                    }
                }
            }
        }
    }

    async fn done(&mut self) {
        if let Some(tasks) = self.inner.take() {
            for task in tasks {
                let _ = task.await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{BrokerConfig, ManualScheduler, SubscriptionConfig};

    fn broker() -> Broker {
        Broker::new(BrokerConfig {
            scheduler: Arc::new(ManualScheduler::new()),
        })
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn batches_and_publishes_unordered_messages() {
        let broker = broker();
        broker.register_topic("T", None);
        broker.register_subscription("S", "T", SubscriptionConfig::default()).unwrap();

        let mut publisher = Publisher::new(
            "T".to_string(),
            broker.clone(),
            Some(PublisherConfig {
                workers: 1,
                flush_interval: Duration::from_millis(10),
                bundle_size: 2,
            }),
        );

        let a = publisher
            .publish(PublishMessage { data: b"a".to_vec(), ..Default::default() })
            .await;
        let b = publisher
            .publish(PublishMessage { data: b"b".to_vec(), ..Default::default() })
            .await;

        let id_a = a.get(None).await.unwrap();
        let id_b = b.get(None).await.unwrap();
        assert_ne!(id_a, id_b);

        publisher.shutdown().await;
        let pulled = broker.pull("S", 10).unwrap();
        assert_eq!(pulled.len(), 2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn same_ordering_key_goes_through_one_shard() {
        let broker = broker();
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

        let mut publisher = Publisher::new(
            "T".to_string(),
            broker.clone(),
            Some(PublisherConfig {
                workers: 4,
                flush_interval: Duration::from_millis(10),
                bundle_size: 10,
            }),
        );

        for data in ["1", "2", "3"] {
            publisher
                .publish(PublishMessage {
                    data: data.as_bytes().to_vec(),
                    ordering_key: Some("k".to_string()),
                    ..Default::default()
                })
                .await;
        }
        publisher.shutdown().await;

        let pulled = broker.pull("S", 10).unwrap();
        assert_eq!(pulled.len(), 1);
        assert_eq!(pulled[0].data, b"1");
    }
}
