//! Broker contract for the durable broadcast log.
//!
//! The [`Broker`] trait is the only thing the publisher and consumers know
//! about storage. It offers idempotent publish, named pull subscriptions
//! with independent cursors, bounded fetches, and ack/nak redelivery.
//!
//! ## Implementations
//!
//! - [`RedisBroker`]: Redis Streams, one consumer group per durable name
//! - [`MemoryBroker`]: in-process log with the same semantics
//!
//! ## Broadcast, not competing consumers
//!
//! ```text
//!                 ┌── durable "consumer-0" (own cursor) ──> every event
//! topic log ──────┼── durable "consumer-1" (own cursor) ──> every event
//!                 └── durable "counter-…"  (own cursor) ──> every event
//! ```

pub mod memory;
pub mod redis_streams;

use crate::event::EventIdentity;
use async_trait::async_trait;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;

pub use self::memory::MemoryBroker;
pub use self::redis_streams::{RedisBroker, RedisPools};

/// Errors returned by broker operations.
#[derive(Error, Debug)]
pub enum BrokerError {
    /// Could not obtain a connection to the broker
    #[error("broker connection error: {0}")]
    Connection(String),

    /// The broker rejected or failed a command
    #[error("broker command error: {0}")]
    Command(String),

    /// The client gave up waiting for the broker
    #[error("broker operation timed out")]
    Timeout,

    /// A delivery handle could not be interpreted by this broker
    #[error("invalid delivery handle: {0}")]
    InvalidDelivery(String),
}

impl BrokerError {
    /// Timeouts are benign for fetch: they only mean nothing arrived.
    pub fn is_timeout(&self) -> bool {
        matches!(self, BrokerError::Timeout)
    }
}

/// Outcome of an idempotent publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishOutcome {
    /// Stored as a new message with the given broker id
    Accepted { id: String },

    /// Another publish with the same identity is inside the dedup window
    DuplicateSuppressed,
}

/// Where a newly created durable cursor starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StartPosition {
    /// Oldest retained message
    Earliest,

    /// Only messages published after the cursor is created
    #[default]
    New,
}

/// A named pull subscription returned by [`Broker::pull_subscribe`].
#[derive(Debug, Clone)]
pub struct Subscription {
    /// Topic the cursor reads
    pub topic: String,

    /// Durable cursor name; one independent cursor per name
    pub durable_name: String,

    /// Start id for replaying entries left pending by an earlier
    /// attachment; `None` once replay is complete
    recovery: Arc<Mutex<Option<String>>>,
}

impl Subscription {
    pub fn new(topic: impl Into<String>, durable_name: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            durable_name: durable_name.into(),
            recovery: Arc::new(Mutex::new(Some("0".to_string()))),
        }
    }

    /// Where the next replay read starts, if replay is still in progress.
    pub(crate) fn recovery_start(&self) -> Option<String> {
        self.recovery
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Move the replay position, or finish replay with `None`.
    pub(crate) fn advance_recovery(&self, next: Option<String>) {
        *self.recovery.lock().unwrap_or_else(PoisonError::into_inner) = next;
    }
}

/// One delivered message inside a fetched batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Broker-assigned message id
    pub id: String,

    /// Raw event bytes
    pub payload: Vec<u8>,

    /// Idempotency key the message was published with, if recorded
    pub identity: Option<String>,
}

/// The durable publish/subscribe log consumed by the core.
///
/// All operations are async and may be called concurrently from many
/// tasks; implementations must be `Send + Sync`.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Short name for logs ("redis", "memory")
    fn name(&self) -> &str;

    /// Publish `payload` with `identity` as its idempotency key.
    async fn publish(
        &self,
        topic: &str,
        payload: &[u8],
        identity: &EventIdentity,
    ) -> Result<PublishOutcome, BrokerError>;

    /// Create or re-attach the durable cursor `durable_name` on `topic`.
    async fn pull_subscribe(
        &self,
        topic: &str,
        durable_name: &str,
        start: StartPosition,
    ) -> Result<Subscription, BrokerError>;

    /// Fetch at most `max_count` deliveries, waiting at most `max_wait`.
    ///
    /// An empty batch means the wait elapsed with nothing available.
    /// Due redeliveries come before new messages.
    async fn fetch(
        &self,
        subscription: &Subscription,
        max_count: usize,
        max_wait: Duration,
    ) -> Result<Vec<Delivery>, BrokerError>;

    /// Acknowledge a delivery; it will not be delivered to this cursor again.
    async fn ack(&self, subscription: &Subscription, delivery: &Delivery)
        -> Result<(), BrokerError>;

    /// Negatively acknowledge a delivery; it is redelivered after `delay`.
    async fn nak(
        &self,
        subscription: &Subscription,
        delivery: &Delivery,
        delay: Duration,
    ) -> Result<(), BrokerError>;

    /// Connectivity check for health reporting.
    async fn ping(&self) -> Result<(), BrokerError> {
        Ok(())
    }
}
