//! Client is the entry point for the broker (spec §1 "Client-facing
//! wrapper types ... that forward to the core"): it owns the `Broker`
//! handle and hands out `Topic`/`Subscription` references scoped to it.

use pubsub_support::status::Status;

use crate::broker::{Broker, BrokerConfig, SubscriptionConfig, TopicMeta};
use crate::publisher::PublisherConfig;
use crate::subscription::Subscription;
use crate::topic::Topic;

#[derive(Clone, Debug, Default)]
pub struct ClientConfig {
    pub broker: BrokerConfig,
    pub publisher: PublisherConfig,
}

/// Client is scoped to a single project and owns the broker backing every
/// topic and subscription it hands out.
///
/// Clients should be reused rather than being created as needed. A Client
/// may be shared across multiple tasks.
#[derive(Clone, Debug)]
pub struct Client {
    project_id: String,
    broker: Broker,
    publisher_config: PublisherConfig,
}

impl Client {
    /// new creates a client scoped to `project_id`.
    pub fn new(project_id: &str, config: Option<ClientConfig>) -> Result<Self, Status> {
        let config = config.unwrap_or_default();
        Ok(Self {
            project_id: project_id.to_string(),
            broker: Broker::new(config.broker),
            publisher_config: config.publisher,
        })
    }

    /// broker returns the handle backing every topic and subscription this
    /// client hands out.
    pub fn broker(&self) -> &Broker {
        &self.broker
    }

    pub fn fully_qualified_topic_name(&self, id: &str) -> String {
        format!("projects/{}/topics/{}", self.project_id, id)
    }

    pub fn fully_qualified_subscription_name(&self, id: &str) -> String {
        format!("projects/{}/subscriptions/{}", self.project_id, id)
    }

    /// create_topic creates a new topic.
    ///
    /// id is the name of the topic to create. It must start with a letter,
    /// and contain only letters ([A-Za-z]), numbers ([0-9]), dashes (-),
    /// underscores (_), periods (.), tildes (~), plus (+) or percent signs
    /// (%). It must be between 3 and 255 characters in length, and must not
    /// start with "goog".
    pub async fn create_topic(&self, id: &str, meta: Option<TopicMeta>) -> Result<Topic, Status> {
        let fqtn = self.fully_qualified_topic_name(id);
        let topic = self.topic(id);
        topic.create(meta).await?;
        tracing::debug!(topic = fqtn.as_str(), "created topic");
        Ok(topic)
    }

    /// topic creates a reference to a topic without checking whether it
    /// exists.
    pub fn topic(&self, id: &str) -> Topic {
        Topic::new(self.fully_qualified_topic_name(id), self.broker.clone(), self.publisher_config.clone())
    }

    /// topics lists every topic this client has created.
    pub async fn get_topics(&self) -> Result<Vec<Topic>, Status> {
        Ok(self
            .broker
            .list_topics()
            .into_iter()
            .map(|name| Topic::new(name, self.broker.clone(), self.publisher_config.clone()))
            .collect())
    }

    /// create_subscription creates a new subscription bound to `topic_id`.
    ///
    /// id is the name of the subscription to create; the same naming rules
    /// as `create_topic` apply.
    pub async fn create_subscription(
        &self,
        id: &str,
        topic_id: &str,
        config: SubscriptionConfig,
    ) -> Result<Subscription, Status> {
        let fqtn = self.fully_qualified_topic_name(topic_id);
        let subscription = self.subscription(id);
        subscription.create(&fqtn, config).await?;
        tracing::debug!(subscription = subscription.fully_qualified_name(), topic = fqtn.as_str(), "created subscription");
        Ok(subscription)
    }

    /// subscription creates a reference to a subscription without checking
    /// whether it exists.
    pub fn subscription(&self, id: &str) -> Subscription {
        Subscription::new(self.fully_qualified_subscription_name(id), self.broker.clone())
    }

    /// subscriptions lists every subscription this client has created.
    pub async fn get_subscriptions(&self) -> Result<Vec<Subscription>, Status> {
        Ok(self
            .broker
            .list_subscriptions()
            .into_iter()
            .map(|name| Subscription::new(name, self.broker.clone()))
            .collect())
    }
}
