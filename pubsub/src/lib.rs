//! # pubsub
//!
//! An in-process publish/subscribe message broker: at-least-once delivery,
//! per-ordering-key message ordering, lease-based acknowledgement, retry
//! backoff and dead-letter routing, all behind the same topic/subscription
//! vocabulary as a hosted pub/sub service, minus the network.
//!
//! `broker` is the dependency-free core; `client`, `topic`, `subscription`,
//! `publisher` and `subscriber` are a thin, cancellable convenience layer on
//! top of it.
//!
//! ## Quick Start
//!
//! ### Publish Message
//!
//! ```
//! use pubsub::client::Client;
//! use pubsub::broker::PublishMessage;
//! use pubsub_support::status::Status;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Status> {
//!     // Create a broker-backed client.
//!     let client = Client::new("local-project", None)?;
//!
//!     // Create topic.
//!     let topic = client.topic("test-topic");
//!     if !topic.exists().await? {
//!         topic.create(None).await?;
//!     }
//!
//!     // Publish messages; publish batches them internally.
//!     let mut awaiters = Vec::new();
//!     for _ in 0..10 {
//!         awaiters.push(topic.publish(PublishMessage {
//!             data: "abc".as_bytes().to_vec(),
//!             ..Default::default()
//!         }).await);
//!     }
//!
//!     // The get method blocks until the message's bundle is flushed.
//!     for awaiter in awaiters {
//!         let _message_id = awaiter.get(None).await?;
//!     }
//!
//!     // Wait for the publisher's background workers to drain.
//!     topic.shutdown().await;
//!
//!     Ok(())
//! }
//! ```
//!
//! ### Subscribe Message
//!
//! ```
//! use std::time::Duration;
//!
//! use pubsub::client::Client;
//! use pubsub::broker::SubscriptionConfig;
//! use pubsub_support::cancel::CancellationToken;
//! use pubsub_support::status::Status;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Status> {
//!     let client = Client::new("local-project", None)?;
//!
//!     // Token for cancel.
//!     let cancel = CancellationToken::new();
//!
//!     // Get the topic to subscribe to.
//!     let topic = client.topic("test-topic");
//!
//!     // Configure subscription.
//!     let mut config = SubscriptionConfig::default();
//!     // Enable message ordering if needed.
//!     config.enable_message_ordering = true;
//!
//!     // Create subscription.
//!     let subscription = client.subscription("test-subscription");
//!     if !subscription.exists().await? {
//!         subscription.create(topic.fully_qualified_name(), config).await?;
//!     }
//!
//!     let cancel2 = cancel.clone();
//!     tokio::spawn(async move {
//!         // Cancel after 10 seconds.
//!         tokio::time::sleep(Duration::from_secs(10)).await;
//!         cancel2.cancel();
//!     });
//!
//!     // Receive blocks until the token is cancelled or the broker stops
//!     // delivering.
//!     subscription.receive(|message, _cancel| async move {
//!         // Handle data.
//!         println!("{:?}", message.data());
//!
//!         // Ack or nack the message.
//!         let _ = message.ack().await;
//!     }, cancel.clone(), None).await?;
//!
//!     // Delete the subscription if needed.
//!     subscription.delete().await?;
//!
//!     Ok(())
//! }
//! ```
pub mod broker;
pub mod client;
pub mod publisher;
pub mod subscriber;
pub mod subscription;
pub mod topic;
mod util;
