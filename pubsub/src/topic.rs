//! Topic is a reference to a pub/sub topic (spec §1 "Client-facing wrapper
//! types ... that forward to the core"): it holds the broker handle and
//! topic name, and lazily starts a publish-batching `Publisher` on first
//! `publish`.

use std::sync::Mutex;

use pubsub_support::status::Status;

use crate::broker::{Broker, PublishMessage, TopicMeta};
use crate::publisher::{Awaiter, Publisher, PublisherConfig};
use crate::subscription::Subscription;

pub struct Topic {
    name: String,
    broker: Broker,
    config: PublisherConfig,
    publisher: Mutex<Option<Publisher>>,
}

impl Topic {
    pub(crate) fn new(name: String, broker: Broker, config: PublisherConfig) -> Self {
        Self {
            name,
            broker,
            config,
            publisher: Mutex::new(None),
        }
    }

    /// id returns the unique identifier of the topic within its project.
    pub fn id(&self) -> Option<String> {
        self.name.rfind('/').map(|i| self.name[(i + 1)..].to_string())
    }

    /// fully_qualified_name returns the printable globally unique name for the topic.
    pub fn fully_qualified_name(&self) -> &str {
        self.name.as_str()
    }

    /// create registers the topic with the broker.
    pub async fn create(&self, meta: Option<TopicMeta>) -> Result<(), Status> {
        self.broker.register_topic(&self.name, meta);
        Ok(())
    }

    /// delete unregisters the topic, detaching every bound subscription.
    pub async fn delete(&self) -> Result<(), Status> {
        self.broker.unregister_topic(&self.name);
        Ok(())
    }

    /// exists reports whether the topic is currently registered.
    pub async fn exists(&self) -> Result<bool, Status> {
        Ok(self.broker.topic_exists(&self.name))
    }

    /// subscriptions returns the subscriptions currently bound to this topic.
    pub async fn subscriptions(&self) -> Result<Vec<Subscription>, Status> {
        let name = self.name.clone();
        let broker = self.broker.clone();
        Ok(broker
            .list_subscriptions()
            .into_iter()
            .filter(|sub_name| {
                broker
                    .get_subscription(sub_name)
                    .map(|(topic, _)| topic == name)
                    .unwrap_or(false)
            })
            .map(|sub_name| Subscription::new(sub_name, broker.clone()))
            .collect())
    }

    /// publish hands `message` to this topic's lazily-started batching
    /// `Publisher` (spec §9 "publisher batching layer"). Publish never
    /// blocks on the broker; the returned `Awaiter` resolves once the
    /// message's bundle has actually been flushed.
    pub async fn publish(&self, message: PublishMessage) -> Awaiter {
        let publisher = self.publisher().clone();
        publisher.publish(message).await
    }

    /// new_publisher starts a fresh `Publisher` for this topic with its own
    /// batching configuration, bypassing the lazily-shared one `publish` uses.
    pub fn new_publisher(&self, config: Option<PublisherConfig>) -> Publisher {
        Publisher::new(self.name.clone(), self.broker.clone(), config.or_else(|| Some(self.config.clone())))
    }

    fn publisher(&self) -> Publisher {
        let mut lock = self.publisher.lock().unwrap();
        if lock.is_none() {
            *lock = Some(Publisher::new(self.name.clone(), self.broker.clone(), Some(self.config.clone())));
        }
        lock.as_ref().unwrap().clone()
    }

    /// shutdown drains and stops the lazily-started publisher, if one was started.
    pub async fn shutdown(&self) {
        let publisher = self.publisher.lock().unwrap().take();
        if let Some(mut publisher) = publisher {
            publisher.shutdown().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{BrokerConfig, ManualScheduler};
    use std::sync::Arc;

    #[tokio::test(flavor = "multi_thread")]
    async fn publish_lazily_starts_a_publisher_and_reaches_the_broker() {
        let broker = Broker::new(BrokerConfig {
            scheduler: Arc::new(ManualScheduler::new()),
        });
        broker.register_topic("T", None);
        broker
            .register_subscription("S", "T", crate::broker::SubscriptionConfig::default())
            .unwrap();

        let topic = Topic::new("T".to_string(), broker.clone(), PublisherConfig {
            workers: 1,
            flush_interval: std::time::Duration::from_millis(10),
            bundle_size: 1,
        });

        let id = topic
            .publish(PublishMessage { data: b"hi".to_vec(), ..Default::default() })
            .await
            .get(None)
            .await
            .unwrap();
        assert!(!id.is_empty());

        topic.shutdown().await;
        let pulled = broker.pull("S", 10).unwrap();
        assert_eq!(pulled.len(), 1);
        assert_eq!(pulled[0].data, b"hi");
    }
}
