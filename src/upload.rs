//! Device-side orchestration: publish a measurement, queue it when the link is down, and replay
//! the queue through the same publish path once it comes back.

use bytes::Bytes;
use chrono::Utc;
use prost::Message;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::measurement::{validate, ConversionError, Measurement, StorableMeasurement, ValidationError};
use crate::pending::{DrainSummary, PendingError, PendingQueue};
use crate::publish::{
    publish_with_timeout, with_retry, PublishError, Publisher, RetryConfig,
    DEFAULT_PUBLISH_TIMEOUT,
};

#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Conversion(#[from] ConversionError),
    /// The publish failed and the measurement could not be queued either.
    #[error("upload: failed to queue measurement after publish error: {0}")]
    Persistence(#[source] PendingError),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UploadOutcome {
    Published,
    /// Publishing failed; the measurement is in the pending queue.
    Queued,
}

pub struct Uploader {
    publisher: Arc<dyn Publisher>,
    queue: PendingQueue,
    topic: String,
    timeout: Duration,
    retry: RetryConfig,
}

impl Uploader {
    pub fn new(publisher: Arc<dyn Publisher>, queue: PendingQueue, topic: impl Into<String>) -> Self {
        Self {
            publisher,
            queue,
            topic: topic.into(),
            timeout: DEFAULT_PUBLISH_TIMEOUT,
            retry: RetryConfig::default(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn queue(&self) -> &PendingQueue {
        &self.queue
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    async fn publish(&self, payload: Bytes) -> Result<(), PublishError> {
        with_retry(&self.retry, || {
            publish_with_timeout(
                self.publisher.as_ref(),
                &self.topic,
                payload.clone(),
                self.timeout,
            )
        })
        .await
    }

    /// Publish a measurement, falling back to the pending queue if the publish fails.
    ///
    /// Invalid measurements are rejected before anything is published or queued.
    #[tracing::instrument(name = "upload", skip_all, fields(device_id = %m.device_id))]
    pub async fn upload(&self, m: &Measurement) -> Result<UploadOutcome, UploadError> {
        validate(m)?;
        let storable = StorableMeasurement::try_from(m)?;

        match self.publish(Bytes::from(m.encode_to_vec())).await {
            Ok(()) => {
                info!(measurement = %storable, "published measurement");
                Ok(UploadOutcome::Published)
            }
            Err(e) => {
                warn!(error = %e, "publish failed, queueing measurement");
                let path = self
                    .queue
                    .enqueue(&storable)
                    .map_err(UploadError::Persistence)?;
                info!(path = %path.display(), "measurement queued");
                Ok(UploadOutcome::Queued)
            }
        }
    }

    /// Replay every queued measurement, stopping at the first publish failure.
    ///
    /// Replayed measurements without an upload timestamp are stamped with the current time, so
    /// the receiver can tell them apart from on-time ones.
    pub async fn flush_pending(&self) -> Result<DrainSummary, PendingError> {
        self.queue.drain(|m| self.publish_replay(m)).await
    }

    async fn publish_replay(&self, mut m: StorableMeasurement) -> Result<(), PublishError> {
        if m.upload_timestamp.is_none() {
            m.upload_timestamp = Some(Utc::now());
        }
        let wire = Measurement::try_from(&m).map_err(|e| PublishError::Encode(e.to_string()))?;
        self.publish(Bytes::from(wire.encode_to_vec())).await
    }

    /// Flush the queue, then upload `m`. A failed flush is logged and does not stop `m` from
    /// being published or queued.
    pub async fn upload_and_flush(&self, m: &Measurement) -> Result<UploadOutcome, UploadError> {
        if let Err(e) = self.flush_pending().await {
            warn!(error = %e, "failed to flush pending measurements");
        }
        self.upload(m).await
    }
}
