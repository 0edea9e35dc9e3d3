//! Broadcast pull consumer.
//!
//! Every instance owns a durable cursor named after itself, so every
//! instance sees every event. Per tick:
//!
//! ```text
//! Waiting(jittered tick) ──> Fetching ──┬─ empty / timeout ─────────────> Waiting
//!                                       ├─ no sink ──> Acking ──────────> Waiting
//!                                       └─ sink ──> Delivering ─┬─ ok ──> Acking
//!                                                               └─ err ─> Nak all
//! ```
//!
//! Delivery is all-or-nothing per batch: a failed delivery naks every
//! handle with the redelivery delay and leaves `processed` untouched.
//! Cancellation is observed only while waiting for the next tick, so a
//! batch that has been fetched is always acked or nak'd before `run`
//! returns.

use crate::broker::{Broker, BrokerError, Delivery, StartPosition, Subscription};
use crate::jitter::{jittered_interval, DEFAULT_SPREAD};
use crate::publisher::DEFAULT_TOPIC;
use crate::shutdown::ShutdownSignal;
use crate::sink::{BatchSink, WebhookPayload};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(60);
const DEFAULT_BATCH_SIZE: usize = 100;
const DEFAULT_FETCH_WAIT: Duration = Duration::from_secs(5);
const DEFAULT_NAK_DELAY: Duration = Duration::from_secs(5);

#[derive(Error, Debug)]
pub enum ConsumerError {
    /// The durable cursor could not be created or attached
    #[error("subscribe failed for consumer '{name}': {source}")]
    Subscribe {
        name: String,
        #[source]
        source: BrokerError,
    },

    /// The consumer task panicked or was aborted
    #[error("consumer task failed: {0}")]
    Task(String),
}

/// Per-instance consumer tuning.
#[derive(Debug, Clone)]
pub struct ConsumerSettings {
    pub topic: String,
    /// Nominal poll interval before jitter
    pub poll_interval: Duration,
    pub batch_size: usize,
    /// Jitter spread as a fraction of `poll_interval`
    pub jitter_spread: f64,
    /// Upper bound on how long one fetch waits for messages
    pub fetch_wait: Duration,
    /// Redelivery delay for nak'd batches
    pub nak_delay: Duration,
    pub start_position: StartPosition,
}

impl Default for ConsumerSettings {
    fn default() -> Self {
        Self {
            topic: DEFAULT_TOPIC.to_string(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            batch_size: DEFAULT_BATCH_SIZE,
            jitter_spread: DEFAULT_SPREAD,
            fetch_wait: DEFAULT_FETCH_WAIT,
            nak_delay: DEFAULT_NAK_DELAY,
            start_position: StartPosition::New,
        }
    }
}

/// Counters owned by one consumer instance.
#[derive(Debug, Default)]
pub struct ConsumerCounters {
    /// Successfully acknowledged deliveries
    processed: AtomicU64,
    batches_delivered: AtomicU64,
    batches_failed: AtomicU64,
    nacked: AtomicU64,
    fetch_errors: AtomicU64,
    ack_errors: AtomicU64,
    /// Nak calls the broker refused; those entries redeliver only on reattach
    nak_errors: AtomicU64,
    running: AtomicBool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ConsumerSnapshot {
    pub processed: u64,
    pub batches_delivered: u64,
    pub batches_failed: u64,
    pub nacked: u64,
    pub fetch_errors: u64,
    pub ack_errors: u64,
    pub nak_errors: u64,
    pub running: bool,
}

impl ConsumerCounters {
    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> ConsumerSnapshot {
        ConsumerSnapshot {
            processed: self.processed(),
            batches_delivered: self.batches_delivered.load(Ordering::Relaxed),
            batches_failed: self.batches_failed.load(Ordering::Relaxed),
            nacked: self.nacked.load(Ordering::Relaxed),
            fetch_errors: self.fetch_errors.load(Ordering::Relaxed),
            ack_errors: self.ack_errors.load(Ordering::Relaxed),
            nak_errors: self.nak_errors.load(Ordering::Relaxed),
            running: self.is_running(),
        }
    }
}

/// What one tick did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Nothing to fetch within the wait
    Empty,
    /// Fetch failed with a non-timeout error
    FetchFailed,
    /// Batch acknowledged; carries the number of successful acks
    Acked(usize),
    /// Sink delivery failed; carries the number of handles nak'd
    Nacked(usize),
}

/// One broadcast consumer instance.
#[derive(Clone)]
pub struct PullConsumer {
    name: String,
    broker: Arc<dyn Broker>,
    sink: Option<Arc<dyn BatchSink>>,
    settings: ConsumerSettings,
    counters: Arc<ConsumerCounters>,
}

impl PullConsumer {
    pub fn new(name: impl Into<String>, broker: Arc<dyn Broker>, settings: ConsumerSettings) -> Self {
        Self {
            name: name.into(),
            broker,
            sink: None,
            settings,
            counters: Arc::new(ConsumerCounters::default()),
        }
    }

    /// Forward batches to `sink` before acknowledging them
    pub fn with_sink(mut self, sink: Arc<dyn BatchSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Share counters with an existing holder, e.g. across restarts
    pub fn with_counters(mut self, counters: Arc<ConsumerCounters>) -> Self {
        self.counters = counters;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn counters(&self) -> Arc<ConsumerCounters> {
        self.counters.clone()
    }

    /// This instance's poll interval, fixed for its lifetime.
    pub fn poll_interval(&self) -> Duration {
        jittered_interval(
            self.settings.poll_interval,
            self.settings.jitter_spread,
            &self.name,
        )
    }

    /// Spawn the consumer. It stops when `shutdown` fires or the handle
    /// is stopped, whichever comes first.
    pub fn start(self, shutdown: &ShutdownSignal) -> ConsumerHandle {
        let stop = shutdown.child();
        let counters = self.counters.clone();
        let name = self.name.clone();
        let task = {
            let stop = stop.clone();
            tokio::spawn(async move { self.run(stop).await })
        };

        ConsumerHandle {
            name,
            stop,
            counters,
            task,
        }
    }

    /// Subscribe and poll until `shutdown` fires.
    pub async fn run(&self, shutdown: ShutdownSignal) -> Result<(), ConsumerError> {
        let subscription = self
            .broker
            .pull_subscribe(
                &self.settings.topic,
                &self.name,
                self.settings.start_position,
            )
            .await
            .map_err(|source| ConsumerError::Subscribe {
                name: self.name.clone(),
                source,
            })?;

        let interval = self.poll_interval();
        info!(
            consumer = %self.name,
            topic = %self.settings.topic,
            interval_ms = interval.as_millis() as u64,
            batch_size = self.settings.batch_size,
            sink = self.sink.as_ref().map(|s| s.name()).unwrap_or("none"),
            "Pull consumer started"
        );

        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.counters.running.store(true, Ordering::Relaxed);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            self.poll_once(&subscription).await;
        }

        self.counters.running.store(false, Ordering::Relaxed);
        info!(
            consumer = %self.name,
            processed = self.counters.processed(),
            "Pull consumer stopped"
        );
        Ok(())
    }

    /// Run one fetch / deliver / ack-or-nak cycle.
    pub async fn poll_once(&self, subscription: &Subscription) -> TickOutcome {
        let batch = match self
            .broker
            .fetch(subscription, self.settings.batch_size, self.settings.fetch_wait)
            .await
        {
            Ok(batch) => batch,
            Err(e) if e.is_timeout() => return TickOutcome::Empty,
            Err(e) => {
                self.counters.fetch_errors.fetch_add(1, Ordering::Relaxed);
                warn!(consumer = %self.name, error = %e, "Fetch failed, skipping tick");
                return TickOutcome::FetchFailed;
            }
        };

        if batch.is_empty() {
            return TickOutcome::Empty;
        }

        if let Some(sink) = &self.sink {
            let payload = WebhookPayload::new(
                self.name.clone(),
                batch.iter().map(|d| d.payload.clone()).collect(),
            );

            if let Err(e) = sink.deliver(&payload).await {
                self.counters.batches_failed.fetch_add(1, Ordering::Relaxed);
                warn!(
                    consumer = %self.name,
                    count = batch.len(),
                    error = %e,
                    "Batch delivery failed, naking batch"
                );
                return TickOutcome::Nacked(self.nak_all(subscription, &batch).await);
            }
        }

        let acked = self.ack_all(subscription, &batch).await;
        self.counters.batches_delivered.fetch_add(1, Ordering::Relaxed);
        debug!(consumer = %self.name, count = acked, "Batch processed");
        TickOutcome::Acked(acked)
    }

    async fn ack_all(&self, subscription: &Subscription, batch: &[Delivery]) -> usize {
        let mut acked = 0;
        for delivery in batch {
            match self.broker.ack(subscription, delivery).await {
                Ok(()) => {
                    self.counters.processed.fetch_add(1, Ordering::Relaxed);
                    acked += 1;
                }
                Err(e) => {
                    self.counters.ack_errors.fetch_add(1, Ordering::Relaxed);
                    warn!(consumer = %self.name, id = %delivery.id, error = %e, "Ack failed");
                }
            }
        }
        acked
    }

    async fn nak_all(&self, subscription: &Subscription, batch: &[Delivery]) -> usize {
        let mut nacked = 0;
        for delivery in batch {
            match self
                .broker
                .nak(subscription, delivery, self.settings.nak_delay)
                .await
            {
                Ok(()) => {
                    self.counters.nacked.fetch_add(1, Ordering::Relaxed);
                    nacked += 1;
                }
                Err(e) => {
                    self.counters.nak_errors.fetch_add(1, Ordering::Relaxed);
                    warn!(consumer = %self.name, id = %delivery.id, error = %e, "Nak failed");
                }
            }
        }
        nacked
    }
}

/// Handle to a started consumer.
pub struct ConsumerHandle {
    name: String,
    stop: ShutdownSignal,
    counters: Arc<ConsumerCounters>,
    task: JoinHandle<Result<(), ConsumerError>>,
}

impl ConsumerHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Deliveries this instance has successfully acknowledged.
    pub fn count(&self) -> u64 {
        self.counters.processed()
    }

    pub fn counters(&self) -> Arc<ConsumerCounters> {
        self.counters.clone()
    }

    /// Stop scheduling ticks and wait for any in-flight batch to settle.
    pub async fn stop(self) -> Result<(), ConsumerError> {
        self.stop.trigger();
        self.task
            .await
            .map_err(|e| ConsumerError::Task(e.to_string()))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{MemoryBroker, PublishOutcome};
    use crate::event::EventIdentity;
    use crate::sink::SinkError;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use tokio::sync::Notify;

    /// Records batches; fails while `fail` is set.
    #[derive(Default)]
    struct RecordingSink {
        fail: AtomicBool,
        batches: Mutex<Vec<WebhookPayload>>,
    }

    #[async_trait]
    impl BatchSink for RecordingSink {
        fn name(&self) -> &str {
            "recording"
        }

        async fn deliver(&self, payload: &WebhookPayload) -> Result<(), SinkError> {
            self.batches.lock().unwrap().push(payload.clone());
            if self.fail.load(Ordering::SeqCst) {
                Err(SinkError::Status(500))
            } else {
                Ok(())
            }
        }
    }

    /// Blocks inside delivery until released.
    #[derive(Default)]
    struct GateSink {
        entered: Notify,
        release: Notify,
    }

    #[async_trait]
    impl BatchSink for GateSink {
        fn name(&self) -> &str {
            "gate"
        }

        async fn deliver(&self, _payload: &WebhookPayload) -> Result<(), SinkError> {
            self.entered.notify_one();
            self.release.notified().await;
            Ok(())
        }
    }

    /// Memory broker that refuses every nak.
    struct NoNakBroker(MemoryBroker);

    #[async_trait]
    impl Broker for NoNakBroker {
        fn name(&self) -> &str {
            "no-nak"
        }

        async fn publish(
            &self,
            topic: &str,
            payload: &[u8],
            identity: &EventIdentity,
        ) -> Result<PublishOutcome, BrokerError> {
            self.0.publish(topic, payload, identity).await
        }

        async fn pull_subscribe(
            &self,
            topic: &str,
            durable_name: &str,
            start: StartPosition,
        ) -> Result<Subscription, BrokerError> {
            self.0.pull_subscribe(topic, durable_name, start).await
        }

        async fn fetch(
            &self,
            subscription: &Subscription,
            max_count: usize,
            max_wait: Duration,
        ) -> Result<Vec<Delivery>, BrokerError> {
            self.0.fetch(subscription, max_count, max_wait).await
        }

        async fn ack(&self, subscription: &Subscription, delivery: &Delivery) -> Result<(), BrokerError> {
            self.0.ack(subscription, delivery).await
        }

        async fn nak(
            &self,
            _subscription: &Subscription,
            _delivery: &Delivery,
            _delay: Duration,
        ) -> Result<(), BrokerError> {
            Err(BrokerError::Command("nak refused".into()))
        }
    }

    async fn publish(broker: &MemoryBroker, topic: &str, payloads: &[&str]) {
        for p in payloads {
            broker
                .publish(topic, p.as_bytes(), &EventIdentity::of(p.as_bytes()))
                .await
                .unwrap();
        }
    }

    fn settings() -> ConsumerSettings {
        ConsumerSettings {
            topic: "t".into(),
            poll_interval: Duration::from_secs(1),
            batch_size: 10,
            fetch_wait: Duration::from_millis(100),
            nak_delay: Duration::from_secs(5),
            start_position: StartPosition::Earliest,
            ..ConsumerSettings::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_sink_acks_immediately() {
        let broker = Arc::new(MemoryBroker::new());
        publish(&broker, "t", &["a", "b", "c"]).await;

        let consumer = PullConsumer::new("c0", broker.clone(), settings());
        let sub = broker.pull_subscribe("t", "c0", StartPosition::Earliest).await.unwrap();

        assert_eq!(consumer.poll_once(&sub).await, TickOutcome::Acked(3));
        assert_eq!(consumer.counters().processed(), 3);
        assert_eq!(broker.pending_count("t", "c0").await, 0);
        assert_eq!(consumer.poll_once(&sub).await, TickOutcome::Empty);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_delivery_naks_whole_batch() {
        let broker = Arc::new(MemoryBroker::new());
        publish(&broker, "t", &["a", "b", "c", "d"]).await;

        let sink = Arc::new(RecordingSink::default());
        sink.fail.store(true, Ordering::SeqCst);
        let consumer = PullConsumer::new("c0", broker.clone(), settings()).with_sink(sink.clone());
        let sub = broker.pull_subscribe("t", "c0", StartPosition::Earliest).await.unwrap();

        assert_eq!(consumer.poll_once(&sub).await, TickOutcome::Nacked(4));
        let snapshot = consumer.counters().snapshot();
        assert_eq!(snapshot.processed, 0);
        assert_eq!(snapshot.nacked, 4);
        assert_eq!(snapshot.batches_failed, 1);

        // Redelivered after the nak delay, then counted once
        sink.fail.store(false, Ordering::SeqCst);
        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(consumer.poll_once(&sub).await, TickOutcome::Acked(4));
        assert_eq!(consumer.counters().processed(), 4);

        let batches = sink.batches.lock().unwrap();
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].events, batches[1].events);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refused_naks_are_counted_apart_from_acks() {
        let memory = MemoryBroker::new();
        publish(&memory, "t", &["a", "b", "c"]).await;
        let broker = Arc::new(NoNakBroker(memory));

        let sink = Arc::new(RecordingSink::default());
        sink.fail.store(true, Ordering::SeqCst);
        let consumer = PullConsumer::new("c0", broker.clone(), settings()).with_sink(sink);
        let sub = broker.pull_subscribe("t", "c0", StartPosition::Earliest).await.unwrap();

        assert_eq!(consumer.poll_once(&sub).await, TickOutcome::Nacked(0));
        let snapshot = consumer.counters().snapshot();
        assert_eq!(snapshot.nak_errors, 3);
        assert_eq!(snapshot.ack_errors, 0);
        assert_eq!(snapshot.nacked, 0);
        assert_eq!(snapshot.batches_failed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_broadcast_instances_each_see_everything() {
        let broker = Arc::new(MemoryBroker::new());
        let shutdown = ShutdownSignal::new();

        let handles: Vec<ConsumerHandle> = (0..3)
            .map(|i| {
                PullConsumer::new(format!("consumer-{}", i), broker.clone(), settings())
                    .start(&shutdown)
            })
            .collect();

        // Let every consumer attach its cursor before publishing
        tokio::task::yield_now().await;
        publish(&broker, "t", &["a", "b", "c", "d", "e"]).await;
        tokio::time::sleep(Duration::from_secs(5)).await;

        for handle in &handles {
            assert_eq!(handle.count(), 5, "{}", handle.name());
        }

        shutdown.trigger();
        for handle in handles {
            handle.stop().await.unwrap();
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_waits_for_in_flight_batch() {
        let broker = Arc::new(MemoryBroker::new());
        publish(&broker, "t", &["a", "b"]).await;

        let sink = Arc::new(GateSink::default());
        let shutdown = ShutdownSignal::new();
        let handle = PullConsumer::new("c0", broker.clone(), settings())
            .with_sink(sink.clone())
            .start(&shutdown);

        sink.entered.notified().await;
        shutdown.trigger();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(handle.count(), 0);
        assert_eq!(broker.pending_count("t", "c0").await, 2);

        sink.release.notify_one();
        let counters = handle.counters();
        handle.stop().await.unwrap();

        assert_eq!(counters.processed(), 2);
        assert!(!counters.is_running());
        assert_eq!(broker.pending_count("t", "c0").await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_ticks_after_stop() {
        let broker = Arc::new(MemoryBroker::new());
        let shutdown = ShutdownSignal::new();
        let handle = PullConsumer::new("c0", broker.clone(), settings()).start(&shutdown);
        let counters = handle.counters();

        tokio::time::sleep(Duration::from_secs(3)).await;
        handle.stop().await.unwrap();

        publish(&broker, "t", &["late"]).await;
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(counters.processed(), 0);
    }

    #[tokio::test]
    async fn test_poll_interval_is_jittered_per_instance() {
        let broker: Arc<dyn Broker> = Arc::new(MemoryBroker::new());
        let settings = ConsumerSettings {
            poll_interval: Duration::from_secs(60),
            jitter_spread: 0.5,
            ..ConsumerSettings::default()
        };

        let a = PullConsumer::new("consumer-0", broker.clone(), settings.clone());
        let b = PullConsumer::new("consumer-1", broker, settings);

        assert_ne!(a.poll_interval(), b.poll_interval());
        assert_eq!(a.poll_interval(), a.poll_interval());
        for interval in [a.poll_interval(), b.poll_interval()] {
            assert!(interval >= Duration::from_secs(30) && interval <= Duration::from_secs(90));
        }
    }
}
