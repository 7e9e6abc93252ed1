//! # jobhub-queue
//!
//! The transport-agnostic [`QueueClient`] contract and its drivers:
//!
//! - **sorted set**: two ordered sets per queue, over Redis or in process memory
//! - **sqs**: Amazon SQS through `aws-sdk-sqs`
//! - **nats**: NATS JetStream durable pull consumers
//!
//! Clients are created from URLs (`redis://host?visibilityTimeout=30000`)
//! and looked up by name through the [`QueueRegistry`].

pub mod channel;
pub mod client;
pub mod drivers;
pub mod envelope;
pub mod fanout;
pub mod listener;
pub mod message;
pub mod metrics;
pub mod options;
pub mod reconnect;
pub mod registry;

pub use channel::ChannelName;
pub use client::{QueueClient, SubmitReceipt};
pub use drivers::SortedSetClient;
pub use envelope::{QueueEnvelope, RetryDelay};
pub use message::{Delivery, DeliveryError, Handler, QueueMessage, handler_fn};
pub use metrics::QueueStats;
pub use options::{ClientOptions, QueueOptions};
pub use reconnect::{Backoff, Connection};
pub use registry::QueueRegistry;
