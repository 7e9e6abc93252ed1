//! Queue transport drivers.

#[cfg(feature = "nats-backend")]
pub mod jetstream;
pub mod sorted_set;
#[cfg(feature = "sqs-backend")]
pub mod sqs;

#[cfg(feature = "nats-backend")]
pub use self::jetstream::JetStreamClient;
pub use self::sorted_set::SortedSetClient;
#[cfg(feature = "sqs-backend")]
pub use self::sqs::SqsClient;
