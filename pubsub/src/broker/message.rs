//! Message entity and validation (spec §3, §4.2, §4.9).

use std::collections::HashMap;
use std::time::Duration;

use pubsub_support::status::Status;

/// Broker-internal timestamp: elapsed time on the owning `Broker`'s
/// `Scheduler` clock, not wall-clock time. Using the scheduler's own clock
/// for `publish_time` (rather than `SystemTime::now()`) keeps every
/// time-dependent computation — retention cutoffs included — driven by the
/// same clock that a `ManualScheduler` advances in tests.
pub type Timestamp = Duration;

pub const MAX_MESSAGE_BYTES: usize = 10 * 1024 * 1024;
pub const MAX_ATTRIBUTE_KEY_BYTES: usize = 256;
pub const MAX_ATTRIBUTE_VALUE_BYTES: usize = 1024;
const RESERVED_ATTRIBUTE_PREFIXES: [&str; 2] = ["goog", "googclient_"];

/// What a caller hands to `publish` — everything about a `Message` that
/// isn't assigned by the broker.
#[derive(Clone, Debug, Default)]
pub struct PublishMessage {
    pub data: Vec<u8>,
    pub attributes: HashMap<String, String>,
    pub ordering_key: Option<String>,
    /// Set only when republishing a dead-lettered message (spec §4.5):
    /// carries the original `publish_time` through so the DLQ copy keeps
    /// it instead of being stamped with the republish-time `now`.
    pub publish_time_override: Option<Timestamp>,
}

/// A message as stored and delivered by the broker (spec §3).
#[derive(Clone, Debug)]
pub struct Message {
    pub id: String,
    pub data: Vec<u8>,
    pub attributes: HashMap<String, String>,
    pub publish_time: Timestamp,
    pub ordering_key: Option<String>,
    pub delivery_attempt: u32,
}

impl Message {
    pub fn length(&self) -> usize {
        message_length(&self.data, &self.attributes)
    }

    /// Builds the fresh copy of this message that gets published to the
    /// dead-letter topic (spec §4.5): new id, `delivery_attempt` reset to 1,
    /// `publish_time` preserved, everything else preserved.
    pub fn to_dead_letter_publish(&self) -> PublishMessage {
        PublishMessage {
            data: self.data.clone(),
            attributes: self.attributes.clone(),
            ordering_key: self.ordering_key.clone(),
            publish_time_override: Some(self.publish_time),
        }
    }
}

pub fn message_length(data: &[u8], attributes: &HashMap<String, String>) -> usize {
    let attrs: usize = attributes
        .iter()
        .map(|(k, v)| k.as_bytes().len() + v.as_bytes().len())
        .sum();
    data.len() + attrs
}

/// Validation rules from spec §4.2. Rejects with `InvalidArgument` on the
/// first rule broken — publish aborts before any fan-out on validation
/// failure (no partial acceptance).
pub fn validate(message: &PublishMessage) -> Result<(), Status> {
    if let Some(key) = &message.ordering_key {
        if key.is_empty() {
            return Err(Status::invalid_argument("ordering key must be non-empty if present"));
        }
    }

    for (key, value) in &message.attributes {
        if key.is_empty() {
            return Err(Status::invalid_argument("attribute key must not be empty"));
        }
        if key.as_bytes().len() > MAX_ATTRIBUTE_KEY_BYTES {
            return Err(Status::invalid_argument(format!(
                "attribute key '{key}' exceeds {MAX_ATTRIBUTE_KEY_BYTES} bytes"
            )));
        }
        if value.as_bytes().len() > MAX_ATTRIBUTE_VALUE_BYTES {
            return Err(Status::invalid_argument(format!(
                "attribute value for key '{key}' exceeds {MAX_ATTRIBUTE_VALUE_BYTES} bytes"
            )));
        }
        if RESERVED_ATTRIBUTE_PREFIXES.iter().any(|prefix| key.starts_with(prefix)) {
            return Err(Status::invalid_argument(format!(
                "attribute key '{key}' uses a reserved prefix"
            )));
        }
    }

    let length = message_length(&message.data, &message.attributes);
    if length > MAX_MESSAGE_BYTES {
        return Err(Status::invalid_argument(format!(
            "message of {length} bytes exceeds the {MAX_MESSAGE_BYTES} byte limit"
        )));
    }

    Ok(())
}

pub fn new_message_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(data: &[u8]) -> PublishMessage {
        PublishMessage {
            data: data.to_vec(),
            attributes: HashMap::new(),
            ordering_key: None,
            publish_time_override: None,
        }
    }

    #[test]
    fn attribute_key_boundary() {
        let mut m = msg(b"hello");
        m.attributes.insert("k".repeat(MAX_ATTRIBUTE_KEY_BYTES), "v".to_string());
        assert!(validate(&m).is_ok());
        m.attributes.clear();
        m.attributes.insert("k".repeat(MAX_ATTRIBUTE_KEY_BYTES + 1), "v".to_string());
        assert!(validate(&m).is_err());
    }

    #[test]
    fn attribute_value_boundary() {
        let mut m = msg(b"hello");
        m.attributes.insert("k".to_string(), "v".repeat(MAX_ATTRIBUTE_VALUE_BYTES));
        assert!(validate(&m).is_ok());
        m.attributes.clear();
        m.attributes.insert("k".to_string(), "v".repeat(MAX_ATTRIBUTE_VALUE_BYTES + 1));
        assert!(validate(&m).is_err());
    }

    #[test]
    fn reserved_attribute_prefix_rejected() {
        let mut m = msg(b"hello");
        m.attributes.insert("googclient_foo".to_string(), "v".to_string());
        assert!(validate(&m).is_err());
        m.attributes.clear();
        m.attributes.insert("goog-bar".to_string(), "v".to_string());
        assert!(validate(&m).is_err());
    }

    #[test]
    fn message_size_boundary() {
        let m = msg(&vec![0u8; MAX_MESSAGE_BYTES]);
        assert!(validate(&m).is_ok());
        let m = msg(&vec![0u8; MAX_MESSAGE_BYTES + 1]);
        assert!(validate(&m).is_err());
    }

    #[test]
    fn empty_ordering_key_rejected() {
        let mut m = msg(b"hello");
        m.ordering_key = Some(String::new());
        assert!(validate(&m).is_err());
    }
}
