//! Batch delivery to downstream HTTP sinks.
//!
//! A pull consumer hands each non-empty batch to a [`BatchSink`]. Delivery
//! is all-or-nothing: any error makes the consumer nak the whole batch, so
//! a sink can receive the same batch more than once and must tolerate it
//! (idempotent handling or dedup on receipt).
//!
//! # Wire format
//!
//! ```text
//! POST <url>
//! Content-Type: application/json
//! X-Event-Count: 2
//!
//! {"consumer":"consumer-0","events":["<base64>","<base64>"],"count":2}
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use firehose_fanout::sink::WebhookSink;
//! use std::time::Duration;
//!
//! let sink = WebhookSink::new("https://sink.example/batches")
//!     .with_timeout(Duration::from_secs(10))
//!     .with_retries(1);
//! ```

use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// Header carrying the number of events in the batch
pub const EVENT_COUNT_HEADER: &str = "X-Event-Count";

/// Default timeout for webhook requests
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default number of in-call retries on 5xx and transport errors
const DEFAULT_RETRIES: u32 = 0;

/// Errors that fail a batch delivery.
#[derive(Error, Debug)]
pub enum SinkError {
    /// Transport failure or client-side timeout
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The sink answered with a non-success status
    #[error("sink returned status {0}")]
    Status(u16),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// One batch as sent to a sink.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookPayload {
    /// Name of the consumer instance that fetched the batch
    pub consumer: String,

    /// Raw event bytes, base64 encoded on the wire
    #[serde(with = "base64_events")]
    pub events: Vec<Vec<u8>>,

    pub count: usize,
}

impl WebhookPayload {
    pub fn new(consumer: impl Into<String>, events: Vec<Vec<u8>>) -> Self {
        let count = events.len();
        Self {
            consumer: consumer.into(),
            events,
            count,
        }
    }
}

mod base64_events {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::de::Error;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(events: &[Vec<u8>], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(events.iter().map(|event| STANDARD.encode(event)))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<Vec<u8>>, D::Error> {
        let encoded = Vec::<String>::deserialize(deserializer)?;
        encoded
            .iter()
            .map(|event| STANDARD.decode(event).map_err(D::Error::custom))
            .collect()
    }
}

/// Destination for fetched batches.
#[async_trait]
pub trait BatchSink: Send + Sync {
    /// Short name for logs
    fn name(&self) -> &str;

    /// Deliver the whole batch. `Ok` means the sink durably accepted it.
    async fn deliver(&self, payload: &WebhookPayload) -> Result<(), SinkError>;
}

/// Sink that POSTs batches to an HTTP endpoint.
///
/// - Bounded per-request timeout
/// - Optional retry on 5xx and transport errors (4xx is final)
/// - Shared client for connection pooling across consumers
#[derive(Debug, Clone)]
pub struct WebhookSink {
    /// Target URL for the webhook
    url: String,

    /// HTTP client (reused for connection pooling)
    client: Client,

    /// Request timeout
    timeout: Duration,

    /// Number of retries on 5xx and transport errors
    retries: u32,
}

impl WebhookSink {
    /// Create a new WebhookSink targeting the given URL
    pub fn new(url: impl Into<String>) -> Self {
        Self::with_client(url, Client::new())
    }

    /// Create a sink sharing an existing client
    pub fn with_client(url: impl Into<String>, client: Client) -> Self {
        Self {
            url: url.into(),
            client,
            timeout: DEFAULT_TIMEOUT,
            retries: DEFAULT_RETRIES,
        }
    }

    /// Set custom timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set number of retries on 5xx errors
    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Execute the webhook request with retries
    async fn send_request(&self, body: Vec<u8>, count: usize) -> Result<(), SinkError> {
        let mut attempts = 0;

        loop {
            if attempts > 0 {
                debug!(
                    attempt = attempts,
                    max_retries = self.retries,
                    "Retrying webhook request"
                );
            }

            let result = self
                .client
                .post(&self.url)
                .timeout(self.timeout)
                .header(CONTENT_TYPE, "application/json")
                .header(EVENT_COUNT_HEADER, count.to_string())
                .body(body.clone())
                .send()
                .await;

            let error = match result {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        return Ok(());
                    }

                    // Client error - don't retry
                    if status.is_client_error() {
                        warn!(status = %status, url = %self.url, "Webhook returned client error");
                        return Err(SinkError::Status(status.as_u16()));
                    }

                    warn!(
                        status = %status,
                        url = %self.url,
                        attempt = attempts,
                        "Webhook returned non-success status"
                    );
                    SinkError::Status(status.as_u16())
                }
                Err(e) => {
                    warn!(error = %e, url = %self.url, attempt = attempts, "Webhook request failed");
                    SinkError::Http(e)
                }
            };

            if attempts >= self.retries {
                return Err(error);
            }
            attempts += 1;
        }
    }
}

#[async_trait]
impl BatchSink for WebhookSink {
    fn name(&self) -> &str {
        "webhook"
    }

    async fn deliver(&self, payload: &WebhookPayload) -> Result<(), SinkError> {
        let body = serde_json::to_vec(payload)?;

        debug!(
            url = %self.url,
            consumer = %payload.consumer,
            count = payload.count,
            bytes = body.len(),
            "Sending batch to webhook"
        );

        self.send_request(body, payload.count).await
    }
}
