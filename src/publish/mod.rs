//! Publish contract between the uploader and whatever transport carries measurements.
//!
//! Delivery is at-least-once and messages are never retained by the broker. A publish that does
//! not complete within the timeout counts as a failure, same as an explicit transport error.

pub mod http;
pub mod retry;

use bytes::Bytes;
use std::time::Duration;

pub use http::{HttpPublisher, PROTOBUF_CONTENT_TYPE};
pub use retry::{with_retry, BackoffStrategy, IsRetryable, RetryConfig};

/// Default time to wait for a publish to be acknowledged.
pub const DEFAULT_PUBLISH_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("upload: timed out after {}s", .0.as_secs_f64())]
    Timeout(Duration),
    #[error("upload: HTTP {status} from {endpoint}")]
    Http { status: u16, endpoint: String },
    #[error("upload: network error: {0}")]
    Network(String),
    #[error("upload: encode error: {0}")]
    Encode(String),
}

impl IsRetryable for PublishError {
    fn is_retryable(&self) -> bool {
        match self {
            PublishError::Timeout(_) => true,
            PublishError::Http { status, .. } => matches!(status, 502..=504),
            PublishError::Network(_) => true,
            PublishError::Encode(_) => false,
        }
    }
}

/// Sends an encoded measurement to a topic.
#[async_trait::async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<(), PublishError>;
}

/// Publish, giving up after `timeout`.
pub async fn publish_with_timeout<P>(
    publisher: &P,
    topic: &str,
    payload: Bytes,
    timeout: Duration,
) -> Result<(), PublishError>
where
    P: Publisher + ?Sized,
{
    match tokio::time::timeout(timeout, publisher.publish(topic, payload)).await {
        Ok(result) => result,
        Err(_) => Err(PublishError::Timeout(timeout)),
    }
}
