//! Ingest publisher: source stream to deduplicated broker topic.
//!
//! ```text
//! source ──read──> [bounded buffer] ──drain──> broker.publish(topic, payload, identity)
//!    │                   │                            │
//!  read count      overflow policy          published / duplicate / error counts,
//!  last cursor     (block | drop_oldest)    retry with capped backoff, checkpoint
//! ```
//!
//! The read loop and the drain task are decoupled by [`PublishBuffer`], so
//! a broker outage turns into either source backpressure or counted drops,
//! never into silent loss. A single drain task publishes in read order.
//!
//! A source failure is fatal for [`IngestPublisher::run`]: buffered events
//! are flushed (bounded by the shutdown grace period) and the error is
//! returned so the supervisor can decide what to do.

use crate::broker::{Broker, PublishOutcome};
use crate::buffer::{BufferClosed, OverflowPolicy, PublishBuffer, PushOutcome};
use crate::checkpoint::CheckpointStore;
use crate::event::EventIdentity;
use crate::shutdown::ShutdownSignal;
use crate::source::{EventStream, SourceConnector, SourceError};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Default topic raw firehose frames are published to
pub const DEFAULT_TOPIC: &str = "atproto.firehose.raw";

const DEFAULT_BUFFER_CAPACITY: usize = 10_000;
const DEFAULT_CHECKPOINT_INTERVAL: Duration = Duration::from_secs(5);
const DEFAULT_RETRY_BASE: Duration = Duration::from_millis(100);
const DEFAULT_RETRY_MAX: Duration = Duration::from_secs(10);
const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Error, Debug)]
pub enum PublisherError {
    /// The upstream source could not be opened or failed mid-stream
    #[error("source connection error: {0}")]
    Source(#[from] SourceError),

    /// The drain task died before flushing
    #[error("publish task failed: {0}")]
    Drain(String),
}

/// Publisher tuning.
#[derive(Debug, Clone)]
pub struct PublisherSettings {
    /// Publisher identity, used as the checkpoint key
    pub name: String,
    pub topic: String,
    pub buffer_capacity: usize,
    pub overflow: OverflowPolicy,
    /// Pass the stored checkpoint to the source on connect
    pub resume: bool,
    pub checkpoint_interval: Duration,
    pub retry_base: Duration,
    pub retry_max: Duration,
    /// How long buffered events may keep publishing after the read loop ends
    pub shutdown_grace: Duration,
}

impl Default for PublisherSettings {
    fn default() -> Self {
        Self {
            name: "publisher".to_string(),
            topic: DEFAULT_TOPIC.to_string(),
            buffer_capacity: DEFAULT_BUFFER_CAPACITY,
            overflow: OverflowPolicy::default(),
            resume: false,
            checkpoint_interval: DEFAULT_CHECKPOINT_INTERVAL,
            retry_base: DEFAULT_RETRY_BASE,
            retry_max: DEFAULT_RETRY_MAX,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
        }
    }
}

/// Publisher counters, read by telemetry.
#[derive(Debug, Default)]
pub struct PublisherStats {
    read: AtomicU64,
    published: AtomicU64,
    duplicates: AtomicU64,
    dropped: AtomicU64,
    /// Read but never published because shutdown cut the flush short
    abandoned: AtomicU64,
    publish_errors: AtomicU64,
    /// Last cursor seen on the source; 0 means none yet
    last_cursor: AtomicU64,
    /// Cursor of the last event the broker accepted; 0 means none yet
    published_cursor: AtomicU64,
}

/// Point-in-time copy of [`PublisherStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PublisherSnapshot {
    pub read: u64,
    pub published: u64,
    pub duplicates: u64,
    pub dropped: u64,
    pub abandoned: u64,
    pub publish_errors: u64,
    pub last_cursor: Option<u64>,
}

impl PublisherStats {
    pub fn read(&self) -> u64 {
        self.read.load(Ordering::Relaxed)
    }

    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    pub fn duplicates(&self) -> u64 {
        self.duplicates.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn abandoned(&self) -> u64 {
        self.abandoned.load(Ordering::Relaxed)
    }

    pub fn publish_errors(&self) -> u64 {
        self.publish_errors.load(Ordering::Relaxed)
    }

    pub fn last_cursor(&self) -> Option<u64> {
        non_zero(self.last_cursor.load(Ordering::Relaxed))
    }

    fn published_cursor(&self) -> Option<u64> {
        non_zero(self.published_cursor.load(Ordering::Relaxed))
    }

    pub fn snapshot(&self) -> PublisherSnapshot {
        PublisherSnapshot {
            read: self.read(),
            published: self.published(),
            duplicates: self.duplicates(),
            dropped: self.dropped(),
            abandoned: self.abandoned(),
            publish_errors: self.publish_errors(),
            last_cursor: self.last_cursor(),
        }
    }
}

fn non_zero(value: u64) -> Option<u64> {
    (value != 0).then_some(value)
}

/// Capped exponential backoff: `base * 2^attempt`, at most `max`.
fn calculate_backoff(base: Duration, max: Duration, attempt: u32) -> Duration {
    base.saturating_mul(1 << attempt.min(16)).min(max)
}

/// A read event waiting to be published.
struct PendingPublish {
    identity: EventIdentity,
    payload: Vec<u8>,
    cursor: Option<u64>,
}

/// Reads the source and republishes every event with its content identity.
pub struct IngestPublisher {
    source: Arc<dyn SourceConnector>,
    broker: Arc<dyn Broker>,
    checkpoints: Option<Arc<dyn CheckpointStore>>,
    settings: PublisherSettings,
    stats: Arc<PublisherStats>,
}

impl IngestPublisher {
    pub fn new(
        source: Arc<dyn SourceConnector>,
        broker: Arc<dyn Broker>,
        settings: PublisherSettings,
    ) -> Self {
        Self {
            source,
            broker,
            checkpoints: None,
            settings,
            stats: Arc::new(PublisherStats::default()),
        }
    }

    /// Persist the last published cursor in `store`.
    pub fn with_checkpoints(mut self, store: Arc<dyn CheckpointStore>) -> Self {
        self.checkpoints = Some(store);
        self
    }

    /// Share counters with an existing holder, e.g. across restarts.
    pub fn with_stats(mut self, stats: Arc<PublisherStats>) -> Self {
        self.stats = stats;
        self
    }

    pub fn stats(&self) -> Arc<PublisherStats> {
        self.stats.clone()
    }

    pub fn settings(&self) -> &PublisherSettings {
        &self.settings
    }

    /// Read, identify and publish until shutdown or a source failure.
    pub async fn run(&self, shutdown: ShutdownSignal) -> Result<(), PublisherError> {
        let resume_from = self.resume_cursor().await;

        info!(
            publisher = %self.settings.name,
            source = %self.source.describe(),
            broker = self.broker.name(),
            topic = %self.settings.topic,
            overflow = ?self.settings.overflow,
            resume_from = ?resume_from,
            "Starting ingest publisher"
        );

        let mut stream = self.source.connect(resume_from).await?;

        let buffer = Arc::new(PublishBuffer::new(
            self.settings.buffer_capacity,
            self.settings.overflow,
        ));
        let in_flight = Arc::new(AtomicBool::new(false));
        let drain = tokio::spawn(drain_loop(
            DrainContext {
                broker: self.broker.clone(),
                checkpoints: self.checkpoints.clone(),
                settings: self.settings.clone(),
                stats: self.stats.clone(),
                in_flight: in_flight.clone(),
            },
            buffer.clone(),
        ));

        let outcome = self.read_loop(stream.as_mut(), &buffer, &shutdown).await;

        buffer.close().await;
        let flushed = self.finish_drain(drain, &buffer, &in_flight).await;
        self.save_checkpoint().await;

        match outcome {
            Err(e) => {
                error!(
                    publisher = %self.settings.name,
                    error = %e,
                    read = self.stats.read(),
                    "Ingest publisher stopped on source failure"
                );
                Err(e)
            }
            Ok(()) => {
                info!(
                    publisher = %self.settings.name,
                    read = self.stats.read(),
                    published = self.stats.published(),
                    "Ingest publisher stopped"
                );
                flushed
            }
        }
    }

    async fn resume_cursor(&self) -> Option<u64> {
        if !self.settings.resume {
            return None;
        }
        let store = self.checkpoints.as_ref()?;

        match store.load(&self.settings.name).await {
            Ok(cursor) => cursor,
            Err(e) => {
                warn!(
                    publisher = %self.settings.name,
                    error = %e,
                    "Failed to load checkpoint, starting from live"
                );
                None
            }
        }
    }

    async fn read_loop(
        &self,
        stream: &mut dyn EventStream,
        buffer: &PublishBuffer<PendingPublish>,
        shutdown: &ShutdownSignal,
    ) -> Result<(), PublisherError> {
        loop {
            let event = tokio::select! {
                biased;
                _ = shutdown.cancelled() => return Ok(()),
                event = stream.next_event() => event?,
            };

            self.stats.read.fetch_add(1, Ordering::Relaxed);
            if let Some(cursor) = event.cursor {
                self.stats.last_cursor.store(cursor, Ordering::Relaxed);
            }

            let pending = PendingPublish {
                identity: event.identity(),
                payload: event.payload,
                cursor: event.cursor,
            };

            // A push that has not completed never enqueued its entry, so
            // losing the race to shutdown abandons exactly this event.
            let pushed = tokio::select! {
                biased;
                _ = shutdown.cancelled() => Err(BufferClosed),
                pushed = buffer.push(pending) => pushed,
            };

            match pushed {
                Ok(PushOutcome::Queued) => {}
                Ok(PushOutcome::DroppedOldest) => {
                    let dropped = self.stats.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                    debug!(dropped, "Publish buffer full, dropped oldest event");
                }
                Err(BufferClosed) => {
                    self.stats.abandoned.fetch_add(1, Ordering::Relaxed);
                    return Ok(());
                }
            }
        }
    }

    async fn finish_drain(
        &self,
        mut drain: JoinHandle<()>,
        buffer: &PublishBuffer<PendingPublish>,
        in_flight: &AtomicBool,
    ) -> Result<(), PublisherError> {
        let result = match tokio::time::timeout(self.settings.shutdown_grace, &mut drain).await {
            Ok(Ok(())) => return Ok(()),
            Ok(Err(e)) => Err(PublisherError::Drain(e.to_string())),
            Err(_) => {
                drain.abort();
                // Wait for the abort so the in-flight flag is final
                let _ = drain.await;
                Ok(())
            }
        };

        let abandoned =
            (buffer.len().await + usize::from(in_flight.load(Ordering::Relaxed))) as u64;
        let total = self.stats.abandoned.fetch_add(abandoned, Ordering::Relaxed) + abandoned;
        warn!(
            publisher = %self.settings.name,
            abandoned = total,
            grace_secs = self.settings.shutdown_grace.as_secs_f64(),
            "Abandoned unpublished events after shutdown grace period"
        );
        result
    }

    async fn save_checkpoint(&self) {
        if let (Some(store), Some(cursor)) = (&self.checkpoints, self.stats.published_cursor()) {
            persist_checkpoint(store.as_ref(), &self.settings.name, cursor).await;
        }
    }
}

struct DrainContext {
    broker: Arc<dyn Broker>,
    checkpoints: Option<Arc<dyn CheckpointStore>>,
    settings: PublisherSettings,
    stats: Arc<PublisherStats>,
    in_flight: Arc<AtomicBool>,
}

async fn drain_loop(ctx: DrainContext, buffer: Arc<PublishBuffer<PendingPublish>>) {
    let mut last_checkpoint = Instant::now();
    let mut saved_cursor: Option<u64> = None;

    while let Some(entry) = buffer.pop().await {
        ctx.in_flight.store(true, Ordering::Relaxed);
        publish_with_retry(&ctx, &entry).await;
        ctx.in_flight.store(false, Ordering::Relaxed);

        if let Some(cursor) = entry.cursor {
            ctx.stats.published_cursor.store(cursor, Ordering::Relaxed);
        }

        if let (Some(store), Some(cursor)) = (&ctx.checkpoints, ctx.stats.published_cursor()) {
            if saved_cursor != Some(cursor)
                && last_checkpoint.elapsed() >= ctx.settings.checkpoint_interval
            {
                persist_checkpoint(store.as_ref(), &ctx.settings.name, cursor).await;
                saved_cursor = Some(cursor);
                last_checkpoint = Instant::now();
            }
        }
    }

    debug!(publisher = %ctx.settings.name, "Publish buffer drained");
}

/// Publish one entry, retrying until the broker answers.
async fn publish_with_retry(ctx: &DrainContext, entry: &PendingPublish) {
    let mut attempt: u32 = 0;
    loop {
        match ctx
            .broker
            .publish(&ctx.settings.topic, &entry.payload, &entry.identity)
            .await
        {
            Ok(PublishOutcome::Accepted { id }) => {
                ctx.stats.published.fetch_add(1, Ordering::Relaxed);
                debug!(id = %id, identity = %entry.identity, "Published event");
                return;
            }
            Ok(PublishOutcome::DuplicateSuppressed) => {
                ctx.stats.duplicates.fetch_add(1, Ordering::Relaxed);
                debug!(identity = %entry.identity, "Duplicate event suppressed");
                return;
            }
            Err(e) => {
                ctx.stats.publish_errors.fetch_add(1, Ordering::Relaxed);
                let delay = calculate_backoff(ctx.settings.retry_base, ctx.settings.retry_max, attempt);
                warn!(
                    identity = %entry.identity,
                    attempt = attempt + 1,
                    retry_in_ms = delay.as_millis() as u64,
                    error = %e,
                    "Publish failed, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt = attempt.saturating_add(1);
            }
        }
    }
}

async fn persist_checkpoint(store: &dyn CheckpointStore, publisher: &str, cursor: u64) {
    match store.store(publisher, cursor).await {
        Ok(()) => debug!(publisher, cursor, "Checkpoint saved"),
        Err(e) => warn!(publisher, cursor, error = %e, "Failed to save checkpoint"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryBroker;
    use crate::checkpoint::MemoryCheckpointStore;
    use crate::event::RawEvent;
    use crate::source::ChannelSource;

    fn settings() -> PublisherSettings {
        PublisherSettings {
            name: "test-publisher".into(),
            topic: "firehose".into(),
            buffer_capacity: 16,
            shutdown_grace: Duration::from_secs(1),
            ..PublisherSettings::default()
        }
    }

    #[test]
    fn test_calculate_backoff_is_capped() {
        let base = Duration::from_millis(100);
        let max = Duration::from_secs(10);
        assert_eq!(calculate_backoff(base, max, 0), Duration::from_millis(100));
        assert_eq!(calculate_backoff(base, max, 3), Duration::from_millis(800));
        assert_eq!(calculate_backoff(base, max, 40), max);
    }

    #[tokio::test]
    async fn test_source_close_flushes_and_returns_error() {
        let broker = Arc::new(MemoryBroker::new());
        let (source, tx) = ChannelSource::new(8);
        let publisher = IngestPublisher::new(Arc::new(source), broker.clone(), settings());
        let stats = publisher.stats();

        for i in 0..3 {
            tx.send(RawEvent::new(format!("frame-{}", i).into_bytes()))
                .await
                .unwrap();
        }
        drop(tx);

        let result = publisher.run(ShutdownSignal::new()).await;
        assert!(matches!(
            result,
            Err(PublisherError::Source(SourceError::Closed))
        ));
        assert_eq!(stats.read(), 3);
        assert_eq!(stats.published(), 3);
        assert_eq!(broker.stored_count("firehose").await, 3);
    }

    #[tokio::test]
    async fn test_cancellation_stops_reading_cleanly() {
        let broker = Arc::new(MemoryBroker::new());
        let (source, tx) = ChannelSource::new(8);
        let publisher = IngestPublisher::new(Arc::new(source), broker, settings());
        let shutdown = ShutdownSignal::new();

        tx.send(RawEvent::new(b"one".to_vec())).await.unwrap();
        let run = {
            let shutdown = shutdown.clone();
            tokio::spawn(async move { publisher.run(shutdown).await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown.trigger();

        let result = tokio::time::timeout(Duration::from_secs(2), run)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
        drop(tx);
    }

    #[tokio::test]
    async fn test_checkpoint_written_and_used_on_resume() {
        let broker = Arc::new(MemoryBroker::new());
        let store = Arc::new(MemoryCheckpointStore::new());

        let (source, tx) = ChannelSource::new(8);
        let publisher = IngestPublisher::new(Arc::new(source), broker.clone(), settings())
            .with_checkpoints(store.clone());
        tx.send(RawEvent::new(b"a".to_vec()).with_cursor(10)).await.unwrap();
        tx.send(RawEvent::new(b"b".to_vec()).with_cursor(11)).await.unwrap();
        drop(tx);
        let _ = publisher.run(ShutdownSignal::new()).await;

        assert_eq!(store.load("test-publisher").await.unwrap(), Some(11));

        let (source, tx) = ChannelSource::new(8);
        let source = Arc::new(source);
        let resumed = IngestPublisher::new(
            source.clone(),
            broker,
            PublisherSettings {
                resume: true,
                ..settings()
            },
        )
        .with_checkpoints(store);
        drop(tx);
        let _ = resumed.run(ShutdownSignal::new()).await;

        assert_eq!(source.connect_history(), vec![Some(11)]);
    }

    #[tokio::test]
    async fn test_last_cursor_tracks_reads() {
        let broker = Arc::new(MemoryBroker::new());
        let (source, tx) = ChannelSource::new(8);
        let publisher = IngestPublisher::new(Arc::new(source), broker, settings());
        let stats = publisher.stats();

        assert_eq!(stats.last_cursor(), None);
        tx.send(RawEvent::new(b"x".to_vec()).with_cursor(42)).await.unwrap();
        drop(tx);
        let _ = publisher.run(ShutdownSignal::new()).await;

        assert_eq!(stats.snapshot().last_cursor, Some(42));
    }
}
