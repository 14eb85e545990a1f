//! Error taxonomy (spec §7, §6 "Error taxonomy mapped to status codes").

pub use pubsub_support::status::{Code, Status};

pub type BrokerResult<T> = Result<T, Status>;
