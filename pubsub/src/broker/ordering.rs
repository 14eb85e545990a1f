//! Per-key ordering (spec §4.6).

use std::collections::{HashSet, VecDeque};

use indexmap::IndexMap;

use super::message::Message;

/// Ordering state for one ordering-enabled subscription. Invariant: a key
/// appears in `blocked` iff there is currently a lease in flight for that
/// key on this subscription.
#[derive(Default, Debug)]
pub struct OrderingState {
    queues: IndexMap<String, VecDeque<Message>>,
    blocked: HashSet<String>,
}

impl OrderingState {
    pub fn push_back(&mut self, key: String, message: Message) {
        self.queues.entry(key).or_default().push_back(message);
    }

    pub fn push_front(&mut self, key: &str, message: Message) {
        self.queues.entry(key.to_string()).or_default().push_front(message);
    }

    /// First unblocked, non-empty key in queue-creation order, popped and
    /// blocked for delivery (spec §4.3 step 5).
    pub fn take_next_ready(&mut self) -> Option<(String, Message)> {
        let ready_key = self
            .queues
            .iter()
            .find(|(key, queue)| !queue.is_empty() && !self.blocked.contains(*key))
            .map(|(key, _)| key.clone())?;
        let message = self.queues.get_mut(&ready_key)?.pop_front()?;
        self.blocked.insert(ready_key.clone());
        Some((ready_key, message))
    }

    pub fn block(&mut self, key: &str) {
        self.blocked.insert(key.to_string());
    }

    pub fn unblock(&mut self, key: &str) {
        self.blocked.remove(key);
    }

    pub fn is_blocked(&self, key: &str) -> bool {
        self.blocked.contains(key)
    }

    pub fn blocked_keys(&self) -> &HashSet<String> {
        &self.blocked
    }

    pub fn iter_messages(&self) -> impl Iterator<Item = &Message> {
        self.queues.values().flatten()
    }

    pub fn retain(&mut self, mut keep: impl FnMut(&Message) -> bool) {
        for queue in self.queues.values_mut() {
            queue.retain(|m| keep(m));
        }
    }
}
