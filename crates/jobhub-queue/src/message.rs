//! Delivered messages, handler results and the acknowledgment contract.
//!
//! A handler completes once per message with a [`Delivery`]:
//!
//! - `Ok(())` or a status below 500: the message is acknowledged and deleted.
//! - status 500..600 and above 600: transient failure, the message becomes
//!   visible again after the retry delay.
//! - status 600: kept in the queue and logged as a warning.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, error, warn};

use jobhub_core::error::AppError;

use crate::envelope::QueueEnvelope;
use crate::options::ClientOptions;

/// Status for an ordinary permanent failure.
pub const STATUS_PERMANENT: u16 = 400;
/// Lowest transient status.
pub const STATUS_TRANSIENT: u16 = 500;
/// Keep the message in the queue and only warn.
pub const STATUS_KEEP: u16 = 600;

/// A message handed to a handler.
#[derive(Debug, Clone)]
pub struct QueueMessage {
    /// The decoded envelope.
    pub envelope: QueueEnvelope,
    /// Name of the client that received it.
    pub queue: String,
    /// Backend delivery token (sorted-set member, SQS receipt handle,
    /// JetStream reply subject).
    pub receipt: Option<String>,
    /// Delivery attempt, starting at 1, when the backend reports it.
    pub attempt: u32,
}

impl QueueMessage {
    /// Message id.
    pub fn id(&self) -> &str {
        &self.envelope.id
    }

    /// Message payload.
    pub fn payload(&self) -> &Value {
        &self.envelope.payload
    }
}

/// A failed delivery.
#[derive(Debug, Clone, Error)]
#[error("delivery failed with status {status}: {message}")]
pub struct DeliveryError {
    /// Handler status code.
    pub status: u16,
    /// Failure description.
    pub message: String,
    /// Handler-requested delay before redelivery.
    pub retry_after: Option<Duration>,
}

impl DeliveryError {
    /// Failure with an explicit status.
    pub fn new(status: u16, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            retry_after: None,
        }
    }

    /// A failure that deletes the message.
    pub fn permanent(message: impl Into<String>) -> Self {
        Self::new(STATUS_PERMANENT, message)
    }

    /// A failure that makes the message visible again.
    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(STATUS_TRANSIENT, message)
    }

    /// Keep the message in the queue without treating it as an error.
    pub fn keep(message: impl Into<String>) -> Self {
        Self::new(STATUS_KEEP, message)
    }

    /// Request a redelivery delay.
    pub fn with_retry_after(mut self, delay: Duration) -> Self {
        self.retry_after = Some(delay);
        self
    }
}

impl From<AppError> for DeliveryError {
    fn from(err: AppError) -> Self {
        Self::permanent(err.to_string())
    }
}

/// Single completion of one message.
pub type Delivery = Result<(), DeliveryError>;

/// Work-queue and fan-out message handler.
pub type Handler = Arc<dyn Fn(QueueMessage) -> BoxFuture<'static, Delivery> + Send + Sync>;

/// Wrap an async closure as a [`Handler`].
pub fn handler_fn<F, Fut>(f: F) -> Handler
where
    F: Fn(QueueMessage) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Delivery> + Send + 'static,
{
    Arc::new(move |message| Box::pin(f(message)))
}

/// When a retried message becomes visible again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryAt {
    /// Immediately.
    Now,
    /// After a delay.
    After(Duration),
    /// Leave the current visibility untouched.
    Unchanged,
}

impl RetryAt {
    /// Delay before the message is visible again. An immediate retry waits
    /// at least `floor`; `None` leaves the visibility as it is.
    pub fn delay(self, floor: Duration) -> Option<Duration> {
        match self {
            Self::Now => Some(floor),
            Self::After(delay) => Some(delay),
            Self::Unchanged => None,
        }
    }
}

/// What the backend does with a message after the handler completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Acknowledge and delete.
    Complete,
    /// Failed permanently; delete.
    Discard { status: u16 },
    /// Failed transiently; make visible again.
    Retry { status: u16, at: RetryAt },
}

impl Disposition {
    /// Apply the acknowledgment contract to a handler result.
    ///
    /// The retry delay comes from the handler, then the message, then the
    /// client options. `noVisibility` on the message leaves the visibility
    /// timeout as it is.
    pub fn of(delivery: &Delivery, envelope: &QueueEnvelope, options: &ClientOptions) -> Self {
        let err = match delivery {
            Ok(()) => return Self::Complete,
            Err(err) => err,
        };
        if err.status < STATUS_TRANSIENT {
            return Self::Discard { status: err.status };
        }
        if envelope.no_visibility {
            return Self::Retry {
                status: err.status,
                at: RetryAt::Unchanged,
            };
        }
        let delay = err
            .retry_after
            .or_else(|| {
                envelope
                    .retry_visibility_timeout
                    .as_ref()
                    .and_then(|r| r.for_status(err.status))
            })
            .or_else(|| {
                options
                    .retry_visibility_timeout
                    .as_ref()
                    .and_then(|r| r.for_status(err.status))
            });
        let at = match delay {
            Some(d) if !d.is_zero() => RetryAt::After(d),
            _ => RetryAt::Now,
        };
        Self::Retry {
            status: err.status,
            at,
        }
    }

    /// Whether the message leaves the queue.
    pub fn removes(&self) -> bool {
        !matches!(self, Self::Retry { .. })
    }
}

/// Log a settled message at the level its outcome calls for.
pub(crate) fn log_outcome(queue: &str, message: &QueueMessage, delivery: &Delivery, disposition: &Disposition) {
    let id = message.id();
    match (delivery, disposition) {
        (Ok(()), _) => debug!(queue = %queue, message_id = %id, "Message completed"),
        (Err(err), Disposition::Retry { status, .. }) if *status == STATUS_KEEP => {
            warn!(queue = %queue, message_id = %id, reason = %err.message, "Message kept in queue")
        }
        (Err(err), Disposition::Retry { status, at }) => {
            error!(queue = %queue, message_id = %id, status, retry = ?at, "Message failed, will retry: {}", err.message)
        }
        (Err(err), _) => {
            error!(queue = %queue, message_id = %id, status = err.status, "Message failed permanently: {}", err.message)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::RetryDelay;
    use crate::options::QueueOptions;

    fn envelope() -> QueueEnvelope {
        QueueEnvelope::new("q", Value::Null, &QueueOptions::default())
    }

    #[test]
    fn test_success_and_low_status_remove() {
        let options = ClientOptions::default();
        let env = envelope();
        assert_eq!(Disposition::of(&Ok(()), &env, &options), Disposition::Complete);

        let rejected = Err(DeliveryError::new(404, "gone"));
        let disposition = Disposition::of(&rejected, &env, &options);
        assert_eq!(disposition, Disposition::Discard { status: 404 });
        assert!(disposition.removes());
    }

    #[test]
    fn test_transient_retry_delay_precedence() {
        let options = ClientOptions {
            retry_visibility_timeout: Some(RetryDelay::Fixed(5_000)),
            ..ClientOptions::default()
        };
        let mut env = envelope();

        let plain = Err(DeliveryError::transient("busy"));
        assert_eq!(
            Disposition::of(&plain, &env, &options),
            Disposition::Retry { status: 500, at: RetryAt::After(Duration::from_secs(5)) }
        );

        env.retry_visibility_timeout = Some(RetryDelay::Fixed(2_000));
        assert_eq!(
            Disposition::of(&plain, &env, &options),
            Disposition::Retry { status: 500, at: RetryAt::After(Duration::from_secs(2)) }
        );

        let explicit = Err(DeliveryError::transient("busy").with_retry_after(Duration::from_millis(10)));
        assert_eq!(
            Disposition::of(&explicit, &env, &options),
            Disposition::Retry { status: 500, at: RetryAt::After(Duration::from_millis(10)) }
        );
    }

    #[test]
    fn test_keep_status_and_no_visibility() {
        let options = ClientOptions::default();
        let mut env = envelope();
        let keep = Err(DeliveryError::keep("not yet"));
        assert_eq!(
            Disposition::of(&keep, &env, &options),
            Disposition::Retry { status: 600, at: RetryAt::Now }
        );

        env.no_visibility = true;
        assert_eq!(
            Disposition::of(&keep, &env, &options),
            Disposition::Retry { status: 600, at: RetryAt::Unchanged }
        );
    }

    #[test]
    fn test_immediate_retry_waits_for_floor() {
        let floor = Duration::from_millis(250);
        assert_eq!(RetryAt::Now.delay(floor), Some(floor));
        assert_eq!(
            RetryAt::After(Duration::from_millis(10)).delay(floor),
            Some(Duration::from_millis(10))
        );
        assert_eq!(RetryAt::Unchanged.delay(floor), None);
    }
}
