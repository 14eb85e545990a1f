use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;

use pubsub_support::status::{Code, Status};

use crate::broker::{Broker, DeliveredMessage};

/// A message leased from a subscription. Wraps the broker's on-wire
/// `DeliveredMessage` with the idempotent ack/nack/modify-deadline contract
/// (spec §4.9): the first of the three calls wins, later calls are no-ops.
#[derive(Clone, Debug)]
pub struct ReceivedMessage {
    message: DeliveredMessage,
    broker: Broker,
    decided: Arc<AtomicBool>,
}

impl ReceivedMessage {
    pub(crate) fn new(broker: Broker, message: DeliveredMessage) -> Self {
        Self {
            message,
            broker,
            decided: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn id(&self) -> &str {
        &self.message.id
    }

    pub fn ack_id(&self) -> &str {
        &self.message.ack_id
    }

    pub fn data(&self) -> &[u8] {
        &self.message.data
    }

    pub fn attributes(&self) -> &HashMap<String, String> {
        &self.message.attributes
    }

    pub fn ordering_key(&self) -> Option<&str> {
        self.message.ordering_key.as_deref()
    }

    /// The approximate number of times the broker has attempted to deliver
    /// this message; 1 on first delivery.
    pub fn delivery_attempt(&self) -> u32 {
        self.message.delivery_attempt
    }

    pub fn publish_time(&self) -> Duration {
        self.message.publish_time
    }

    pub fn length(&self) -> usize {
        self.message.length
    }

    pub async fn ack(&self) -> Result<(), Status> {
        if self.decided.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        swallow_late_lease_error(self.broker.ack(&self.message.ack_id))
    }

    pub async fn nack(&self) -> Result<(), Status> {
        if self.decided.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        swallow_late_lease_error(self.broker.nack(&self.message.ack_id))
    }

    /// `modify_ack_deadline(0)` is equivalent to `nack` (spec §4.9).
    pub async fn modify_ack_deadline(&self, seconds: i32) -> Result<(), Status> {
        if seconds == 0 {
            return self.nack().await;
        }
        if self.decided.load(Ordering::SeqCst) {
            return Ok(());
        }
        swallow_late_lease_error(self.broker.modify_ack_deadline(&self.message.ack_id, seconds))
    }
}

/// A late ack/nack losing a race against deadline expiry (or a second
/// in-flight decision on the same message) is swallowed to preserve the
/// wrapper's idempotent contract (spec §7).
fn swallow_late_lease_error(result: Result<(), Status>) -> Result<(), Status> {
    match result {
        Ok(()) => Ok(()),
        Err(err) if matches!(err.code(), Code::FailedPrecondition | Code::InvalidArgument) => {
            tracing::debug!(%err, "late lease decision on an already-resolved message");
            Ok(())
        }
        Err(err) => Err(err),
    }
}

#[derive(Debug, Clone)]
pub struct SubscriberConfig {
    /// Messages requested per `pull` call.
    pub max_messages_per_pull: u32,
    /// How long the poll loop sleeps after an empty pull before trying again.
    pub poll_interval: Duration,
}

impl Default for SubscriberConfig {
    fn default() -> Self {
        Self {
            max_messages_per_pull: 50,
            poll_interval: Duration::from_millis(100),
        }
    }
}

/// Receiver with a dispose method to nack remaining messages, mirroring
/// the streaming client's drain-on-close behavior without a real stream.
pub(crate) struct Receiver {
    receiver: Option<async_channel::Receiver<ReceivedMessage>>,
}

impl Deref for Receiver {
    type Target = async_channel::Receiver<ReceivedMessage>;

    fn deref(&self) -> &Self::Target {
        self.receiver.as_ref().unwrap()
    }
}

impl DerefMut for Receiver {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.receiver.as_mut().unwrap()
    }
}

impl Receiver {
    pub fn new(receiver: async_channel::Receiver<ReceivedMessage>) -> Self {
        Self { receiver: Some(receiver) }
    }

    /// Aborts the background poll loop (via dropping `Subscriber` first)
    /// and nacks anything left sitting in the channel, returning how many
    /// messages were nacked.
    pub async fn dispose(mut self) -> usize {
        let receiver = match self.receiver.take() {
            None => return 0,
            Some(rx) => rx,
        };
        receiver.close();
        if receiver.is_empty() {
            return 0;
        }
        let mut count = 0;
        while let Ok(msg) = receiver.recv().await {
            match msg.nack().await {
                Ok(_) => count += 1,
                Err(e) => tracing::error!("nack message error: {}, {:?}", msg.ack_id(), e),
            }
        }
        count
    }
}

impl Drop for Receiver {
    fn drop(&mut self) {
        let receiver = match self.receiver.take() {
            None => return,
            Some(rx) => rx,
        };
        receiver.close();
        if receiver.is_empty() {
            return;
        }
        tracing::warn!("Call 'dispose' before drop in order to nack remaining messages");
        let _forget = tokio::spawn(async move {
            while let Ok(msg) = receiver.recv().await {
                if let Err(err) = msg.nack().await {
                    tracing::error!("failed to nack message: {:?}", err);
                }
            }
        });
    }
}

/// Polls the broker's `pull` entry point and hands messages into a bounded
/// channel (spec §9 "event-emitter delivery -> polling loop with
/// channels"): the core only offers `pull`, turning that into a continuous
/// stream is this wrapper's job.
#[derive(Debug)]
pub(crate) struct Subscriber {
    task_to_receive: Option<JoinHandle<()>>,
}

impl Drop for Subscriber {
    fn drop(&mut self) {
        if let Some(task) = self.task_to_receive.take() {
            task.abort();
        }
    }
}

impl Subscriber {
    pub fn spawn(
        subscription: String,
        broker: Broker,
        queue: async_channel::Sender<ReceivedMessage>,
        config: SubscriberConfig,
    ) -> Self {
        let task_to_receive = tokio::spawn(async move {
            tracing::debug!("start subscriber: {}", subscription);
            loop {
                let pulled = match broker.pull(&subscription, config.max_messages_per_pull) {
                    Ok(messages) => messages,
                    Err(err) => {
                        tracing::error!(%err, "pull failed: subscriber will stop {}", subscription);
                        break;
                    }
                };

                if pulled.is_empty() {
                    tokio::time::sleep(config.poll_interval).await;
                    continue;
                }

                for message in pulled {
                    let msg = ReceivedMessage::new(broker.clone(), message);
                    if queue.send(msg).await.is_err() {
                        tracing::debug!("stop subscriber: queue closed: {}", subscription);
                        return;
                    }
                }
            }
            tracing::debug!("stop subscriber: {}", subscription);
        });

        Self {
            task_to_receive: Some(task_to_receive),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{BrokerConfig, ManualScheduler, PublishMessage, SubscriptionConfig};

    #[tokio::test]
    async fn ack_is_idempotent_at_the_wrapper() {
        let broker = Broker::new(BrokerConfig {
            scheduler: Arc::new(ManualScheduler::new()),
        });
        broker.register_topic("T", None);
        broker.register_subscription("S", "T", SubscriptionConfig::default()).unwrap();
        broker
            .publish("T", vec![PublishMessage { data: b"x".to_vec(), ..Default::default() }])
            .unwrap();
        let pulled = broker.pull("S", 1).unwrap();
        let msg = ReceivedMessage::new(broker.clone(), pulled.into_iter().next().unwrap());

        assert!(msg.ack().await.is_ok());
        assert!(msg.ack().await.is_ok());
        assert!(msg.nack().await.is_ok());
    }

    #[tokio::test]
    async fn modify_ack_deadline_zero_behaves_like_nack() {
        let broker = Broker::new(BrokerConfig {
            scheduler: Arc::new(ManualScheduler::new()),
        });
        broker.register_topic("T", None);
        broker.register_subscription("S", "T", SubscriptionConfig::default()).unwrap();
        broker
            .publish("T", vec![PublishMessage { data: b"x".to_vec(), ..Default::default() }])
            .unwrap();
        let pulled = broker.pull("S", 1).unwrap();
        let msg = ReceivedMessage::new(broker.clone(), pulled.into_iter().next().unwrap());

        assert!(msg.modify_ack_deadline(0).await.is_ok());
        assert!(msg.ack().await.is_ok());
    }
}
