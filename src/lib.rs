//! # Firehose Fanout
//!
//! Ingests a high-volume append-only event firehose, republishes it into a
//! durable deduplicated log, and fans it out to any number of independent
//! pull consumers with optional batch webhook delivery.
//!
//! ## Architecture
//!
//! ```text
//! relay ──> IngestPublisher ──> Broker topic ──┬──> PullConsumer × N ──> webhook sink
//!           (identity = sha256)  (dedup window)  └──> StatsAggregator ──> stats topic
//! ```
//!
//! ## Modules
//!
//! - [`event`]: Raw events and their content identity
//! - [`source`]: Upstream stream connectors
//! - [`broker`]: Broker contract with Redis Streams and in-memory backends
//! - [`publisher`]: Ingest publisher with bounded buffering
//! - [`consumer`]: Broadcast pull consumers
//! - [`sink`]: Batch webhook delivery
//! - [`stats`]: Traffic counter and periodic snapshots
//! - [`telemetry`]: `/metrics` and `/health`
//! - [`supervisor`]: Restart/terminate policies for every task

pub mod app;
pub mod broker;
pub mod buffer;
pub mod checkpoint;
pub mod config;
pub mod consumer;
pub mod event;
pub mod jitter;
pub mod publisher;
pub mod shutdown;
pub mod sink;
pub mod source;
pub mod stats;
pub mod supervisor;
pub mod telemetry;

// Re-export commonly used types at crate root
pub use broker::{Broker, BrokerError, Delivery, PublishOutcome, StartPosition, Subscription};
pub use consumer::{ConsumerHandle, PullConsumer};
pub use event::{EventIdentity, RawEvent};
pub use publisher::IngestPublisher;
pub use shutdown::ShutdownSignal;
pub use sink::{BatchSink, WebhookPayload, WebhookSink};
