//! Publish path (spec §4.2): validate, assign identity, fan out.

use std::collections::HashMap;

use super::error::{BrokerResult, Status};
use super::message::{self, Message, PublishMessage};
use super::registry::{SubscriptionEntry, TopicEntry, SUBSCRIPTION_QUEUE_MAX_BYTES, SUBSCRIPTION_QUEUE_MAX_MESSAGES};
use super::scheduler::Scheduler;

/// Validates every input message, then stamps identity fields and fans
/// each out to every subscription currently bound to `topic_name`.
/// Returns the generated ids in input order, even when the topic has no
/// subscriptions (spec §4.2: "Publish returns ids even when no
/// subscriptions exist.").
pub fn publish(
    topics: &HashMap<String, TopicEntry>,
    subscriptions: &mut HashMap<String, SubscriptionEntry>,
    scheduler: &dyn Scheduler,
    topic_name: &str,
    inputs: Vec<PublishMessage>,
) -> BrokerResult<Vec<String>> {
    let topic = topics
        .get(topic_name)
        .ok_or_else(|| Status::not_found(format!("topic '{topic_name}' does not exist")))?;

    for input in &inputs {
        message::validate(input)?;
    }

    let now = scheduler.now();
    let stamped: Vec<Message> = inputs
        .into_iter()
        .map(|input| Message {
            id: message::new_message_id(),
            data: input.data,
            attributes: input.attributes,
            publish_time: input.publish_time_override.unwrap_or(now),
            ordering_key: input.ordering_key,
            delivery_attempt: 1,
        })
        .collect();

    let ids = stamped.iter().map(|m| m.id.clone()).collect();

    for sub_name in &topic.subscriptions {
        let Some(sub) = subscriptions.get_mut(sub_name) else {
            continue;
        };
        for message in &stamped {
            fan_out_one(sub_name, sub, message.clone());
        }
    }

    Ok(ids)
}

/// Copies `message` into one subscription's queue, silently dropping it
/// (with a warning) if that would exceed the subscription's capacity
/// ceiling — other subscriptions are unaffected (spec §4.2 step 4, §7).
fn fan_out_one(sub_name: &str, sub: &mut SubscriptionEntry, message: Message) {
    let projected_size = sub.queue.queue_size + 1;
    let projected_bytes = sub.queue.queue_bytes + message.length() as u64;
    if projected_size > SUBSCRIPTION_QUEUE_MAX_MESSAGES || projected_bytes > SUBSCRIPTION_QUEUE_MAX_BYTES {
        tracing::warn!(
            subscription = sub_name,
            message_id = message.id.as_str(),
            "dropping message: subscription queue capacity exceeded"
        );
        return;
    }
    sub.queue.enqueue_published(message);
}
