use super::{PublishError, Publisher};
use bytes::Bytes;
use reqwest::Client;
use std::time::Duration;
use tracing::{debug, error};

pub const PROTOBUF_CONTENT_TYPE: &str = "application/x-protobuf";

/// Publishes measurements to a receiver over HTTP: `POST <base_url>/v1/topics/<topic>`.
pub struct HttpPublisher {
    client: Client,
    base_url: String,
    timeout: Duration,
}

impl HttpPublisher {
    /// The client's own request timeout backs up the publish timeout applied by the uploader.
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, PublishError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| PublishError::Network(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            timeout,
        })
    }

    pub fn topic_url(&self, topic: &str) -> String {
        format!(
            "{}/v1/topics/{}",
            self.base_url,
            urlencoding::encode(topic)
        )
    }
}

#[async_trait::async_trait]
impl Publisher for HttpPublisher {
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<(), PublishError> {
        let endpoint = self.topic_url(topic);
        debug!(endpoint = %endpoint, bytes = payload.len(), "publishing measurement");

        let response = self
            .client
            .post(&endpoint)
            .header("Content-Type", PROTOBUF_CONTENT_TYPE)
            .body(payload)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    PublishError::Timeout(self.timeout)
                } else {
                    PublishError::Network(e.to_string())
                }
            })?;

        let status = response.status().as_u16();
        if !(200..300).contains(&status) {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "(failed to read body)".to_string());
            error!(endpoint = %endpoint, status, response_body = %body, "receiver rejected publish");
            return Err(PublishError::Http { status, endpoint });
        }

        Ok(())
    }
}
