//! Subscription is a reference to a pub/sub subscription (spec §1):
//! binds a name to the broker and offers both a direct `pull` and a
//! continuous `receive` loop built on the polling `Subscriber` (spec §9
//! "event-emitter delivery -> polling loop with channels": the core only
//! offers `pull`, turning that into a continuous stream is this wrapper's
//! job).

use std::future::Future;

use pubsub_support::cancel::CancellationToken;
use pubsub_support::status::Status;

pub use crate::broker::SubscriptionConfig;
use crate::broker::Broker;
use crate::subscriber::{ReceivedMessage, Subscriber, SubscriberConfig};

pub struct ReceiveConfig {
    /// Number of concurrent tasks dispatching delivered messages to the
    /// caller's callback.
    pub worker_count: usize,
    pub subscriber_config: SubscriberConfig,
}

impl Default for ReceiveConfig {
    fn default() -> Self {
        Self {
            worker_count: 10,
            subscriber_config: SubscriberConfig::default(),
        }
    }
}

/// Subscription is a reference to a pub/sub subscription.
#[derive(Debug, Clone)]
pub struct Subscription {
    fqsn: String,
    broker: Broker,
}

impl Subscription {
    pub(crate) fn new(fqsn: String, broker: Broker) -> Self {
        Self { fqsn, broker }
    }

    /// id returns the unique identifier of the subscription within its project.
    pub fn id(&self) -> String {
        self.fqsn.rfind('/').map_or_else(|| self.fqsn.clone(), |i| self.fqsn[(i + 1)..].to_string())
    }

    /// fully_qualified_name returns the globally unique printable name of the subscription.
    pub fn fully_qualified_name(&self) -> &str {
        self.fqsn.as_str()
    }

    /// create registers the subscription against `topic` with the broker.
    pub async fn create(&self, topic: &str, config: SubscriptionConfig) -> Result<(), Status> {
        self.broker.register_subscription(&self.fqsn, topic, config)
    }

    /// delete unregisters the subscription, dropping its queue and timers.
    pub async fn delete(&self) -> Result<(), Status> {
        self.broker.unregister_subscription(&self.fqsn);
        Ok(())
    }

    /// exists reports whether the subscription is currently registered.
    pub async fn exists(&self) -> Result<bool, Status> {
        Ok(self.broker.subscription_exists(&self.fqsn))
    }

    /// config fetches the bound topic name and current configuration.
    pub async fn config(&self) -> Result<(String, SubscriptionConfig), Status> {
        self.broker
            .get_subscription(&self.fqsn)
            .ok_or_else(|| Status::not_found(format!("subscription '{}' does not exist", self.fqsn)))
    }

    /// pull gets up to `max_messages` from the broker, synchronously.
    pub async fn pull(&self, max_messages: u32) -> Result<Vec<ReceivedMessage>, Status> {
        let messages = self.broker.pull(&self.fqsn, max_messages)?;
        Ok(messages
            .into_iter()
            .map(|message| ReceivedMessage::new(self.broker.clone(), message))
            .collect())
    }

    /// receive calls `f` with every message the broker delivers to this
    /// subscription, fanning out across `worker_count` concurrent callback
    /// tasks. Blocks until `cancel` is cancelled.
    pub async fn receive<F>(
        &self,
        f: impl Fn(ReceivedMessage, CancellationToken) -> F + Send + 'static + Sync + Clone,
        cancel: CancellationToken,
        config: Option<ReceiveConfig>,
    ) -> Result<(), Status>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let op = config.unwrap_or_default();
        let (sender, receiver) = async_channel::unbounded::<ReceivedMessage>();

        let subscriber = Subscriber::spawn(self.fqsn.clone(), self.broker.clone(), sender, op.subscriber_config);

        let mut message_receivers = Vec::with_capacity(op.worker_count);
        for _ in 0..op.worker_count {
            let receiver = receiver.clone();
            let f = f.clone();
            let cancel = cancel.clone();
            let name = self.fqsn.clone();
            message_receivers.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        received = receiver.recv() => match received {
                            Ok(message) => f(message, cancel.clone()).await,
                            Err(_closed) => break,
                        },
                    }
                }
                tracing::trace!(subscription = name.as_str(), "stop message receiver");
            }));
        }

        cancel.cancelled().await;
        // stop polling first so no more messages land in the channel, then
        // let every callback worker drain what's already queued.
        drop(subscriber);
        drop(receiver);
        for message_receiver in message_receivers {
            let _ = message_receiver.await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{BrokerConfig, ManualScheduler, PublishMessage};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    fn broker() -> Broker {
        Broker::new(BrokerConfig {
            scheduler: Arc::new(ManualScheduler::new()),
        })
    }

    #[tokio::test]
    async fn pull_returns_delivered_messages() {
        let broker = broker();
        broker.register_topic("T", None);
        broker.register_subscription("S", "T", SubscriptionConfig::default()).unwrap();
        broker
            .publish("T", vec![PublishMessage { data: b"hi".to_vec(), ..Default::default() }])
            .unwrap();

        let subscription = Subscription::new("S".to_string(), broker);
        let pulled = subscription.pull(10).await.unwrap();
        assert_eq!(pulled.len(), 1);
        assert_eq!(pulled[0].data(), b"hi");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn receive_dispatches_to_the_callback_and_stops_on_cancel() {
        let broker = broker();
        broker.register_topic("T", None);
        broker.register_subscription("S", "T", SubscriptionConfig::default()).unwrap();
        broker
            .publish("T", vec![PublishMessage { data: b"hi".to_vec(), ..Default::default() }])
            .unwrap();

        let subscription = Subscription::new("S".to_string(), broker);
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = count.clone();
        let cancel = CancellationToken::new();
        let cancel_clone = cancel.clone();

        let handle = tokio::spawn(async move {
            subscription
                .receive(
                    move |message, _ctx| {
                        let count = count_clone.clone();
                        async move {
                            count.fetch_add(1, Ordering::SeqCst);
                            let _ = message.ack().await;
                        }
                    },
                    cancel_clone,
                    Some(ReceiveConfig {
                        worker_count: 1,
                        subscriber_config: SubscriberConfig {
                            poll_interval: Duration::from_millis(5),
                            ..Default::default()
                        },
                    }),
                )
                .await
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
        handle.await.unwrap().unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
