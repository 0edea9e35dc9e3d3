//! Stats aggregator.
//!
//! An independent broadcast consumer that only counts traffic. It attaches
//! its own durable cursor (time-seeded name unless configured), so it never
//! competes with the processing consumers or depends on their ack state.
//! The name is fixed once per process, so a restarted aggregator resumes
//! the same cursor instead of recounting the log.
//!
//! Every period it emits a [`StatsSnapshot`]: logged at info level and
//! published as JSON to the stats topic. Period counters reset at every
//! emission; the lifetime counter only feeds telemetry. Failing to emit is
//! logged and counting goes on.

use crate::broker::{Broker, BrokerError, StartPosition, Subscription};
use crate::event::EventIdentity;
use crate::publisher::DEFAULT_TOPIC;
use crate::shutdown::ShutdownSignal;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{info, warn};

/// Default topic snapshots are published to
pub const DEFAULT_STATS_TOPIC: &str = "atproto.stats.counter";

const DEFAULT_PERIOD: Duration = Duration::from_secs(10);
const DEFAULT_BATCH_SIZE: usize = 500;

/// Longest single fetch wait, so shutdown is noticed promptly
const MAX_FETCH_WAIT: Duration = Duration::from_secs(1);

#[derive(Error, Debug)]
pub enum StatsError {
    #[error("stats subscribe failed: {0}")]
    Subscribe(#[from] BrokerError),
}

/// One emitted period summary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub timestamp: DateTime<Utc>,
    /// Measured period length, e.g. "10.0s"
    pub period: String,
    /// Messages counted during the period
    pub total_messages: u64,
    pub average_per_second: f64,
}

#[derive(Debug, Clone)]
pub struct StatsSettings {
    pub topic: String,
    pub stats_topic: String,
    /// Durable cursor name; time-seeded when `None`
    pub durable_name: Option<String>,
    pub period: Duration,
    pub batch_size: usize,
}

impl Default for StatsSettings {
    fn default() -> Self {
        Self {
            topic: DEFAULT_TOPIC.to_string(),
            stats_topic: DEFAULT_STATS_TOPIC.to_string(),
            durable_name: None,
            period: DEFAULT_PERIOD,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }
}

impl StatsSettings {
    /// Fill in a time-seeded durable name if none is set.
    pub fn with_resolved_durable(mut self) -> Self {
        if self.durable_name.is_none() {
            self.durable_name = Some(time_seeded_name());
        }
        self
    }
}

#[derive(Debug, Default)]
pub struct StatsCounters {
    lifetime: AtomicU64,
    period: AtomicU64,
    snapshots_emitted: AtomicU64,
    emit_errors: AtomicU64,
}

impl StatsCounters {
    /// Messages counted since start
    pub fn lifetime(&self) -> u64 {
        self.lifetime.load(Ordering::Relaxed)
    }

    /// Messages counted in the current period
    pub fn current_period(&self) -> u64 {
        self.period.load(Ordering::Relaxed)
    }

    pub fn snapshots_emitted(&self) -> u64 {
        self.snapshots_emitted.load(Ordering::Relaxed)
    }

    pub fn emit_errors(&self) -> u64 {
        self.emit_errors.load(Ordering::Relaxed)
    }

    fn record(&self) {
        self.lifetime.fetch_add(1, Ordering::Relaxed);
        self.period.fetch_add(1, Ordering::Relaxed);
    }
}

pub struct StatsAggregator {
    broker: Arc<dyn Broker>,
    settings: StatsSettings,
    counters: Arc<StatsCounters>,
}

impl StatsAggregator {
    pub fn new(broker: Arc<dyn Broker>, settings: StatsSettings) -> Self {
        Self {
            broker,
            settings: settings.with_resolved_durable(),
            counters: Arc::new(StatsCounters::default()),
        }
    }

    pub fn with_counters(mut self, counters: Arc<StatsCounters>) -> Self {
        self.counters = counters;
        self
    }

    pub fn counters(&self) -> Arc<StatsCounters> {
        self.counters.clone()
    }

    pub fn durable_name(&self) -> &str {
        self.settings.durable_name.as_deref().unwrap_or_default()
    }

    /// Count and emit until `shutdown` fires.
    pub async fn run(&self, shutdown: ShutdownSignal) -> Result<(), StatsError> {
        let durable = self.durable_name();

        let subscription = self
            .broker
            .pull_subscribe(&self.settings.topic, durable, StartPosition::Earliest)
            .await?;

        info!(
            consumer = %durable,
            topic = %self.settings.topic,
            period_secs = self.settings.period.as_secs_f64(),
            "Stats aggregator started"
        );

        let mut period_start = Instant::now();
        let mut next_emit = period_start + self.settings.period;

        while !shutdown.is_shutdown() {
            let now = Instant::now();
            if now >= next_emit {
                self.emit(now - period_start).await;
                period_start = now;
                next_emit = now + self.settings.period;
                continue;
            }

            let wait = (next_emit - now).min(MAX_FETCH_WAIT);
            self.count_batch(&subscription, wait).await;
        }

        info!(
            consumer = %durable,
            lifetime = self.counters.lifetime(),
            "Stats aggregator stopped"
        );
        Ok(())
    }

    async fn count_batch(&self, subscription: &Subscription, wait: Duration) {
        match self
            .broker
            .fetch(subscription, self.settings.batch_size, wait)
            .await
        {
            Ok(batch) => {
                for delivery in &batch {
                    self.counters.record();
                    if let Err(e) = self.broker.ack(subscription, delivery).await {
                        warn!(id = %delivery.id, error = %e, "Stats ack failed");
                    }
                }
            }
            Err(e) if e.is_timeout() => {}
            Err(e) => {
                warn!(error = %e, "Stats fetch failed");
                tokio::time::sleep(wait).await;
            }
        }
    }

    /// Build, log and publish the snapshot for the period just ended.
    async fn emit(&self, elapsed: Duration) -> StatsSnapshot {
        let total = self.counters.period.swap(0, Ordering::Relaxed);
        let secs = elapsed.as_secs_f64();
        let snapshot = StatsSnapshot {
            timestamp: Utc::now(),
            period: format!("{:.1}s", secs),
            total_messages: total,
            average_per_second: if secs > 0.0 { total as f64 / secs } else { 0.0 },
        };

        info!(
            period = %snapshot.period,
            total = snapshot.total_messages,
            avg_per_sec = snapshot.average_per_second,
            "Message counter stats"
        );

        if let Err(e) = self.publish(&snapshot).await {
            self.counters.emit_errors.fetch_add(1, Ordering::Relaxed);
            warn!(error = %e, topic = %self.settings.stats_topic, "Failed to publish stats");
        } else {
            self.counters.snapshots_emitted.fetch_add(1, Ordering::Relaxed);
        }

        snapshot
    }

    async fn publish(&self, snapshot: &StatsSnapshot) -> Result<(), BrokerError> {
        let body = serde_json::to_vec(snapshot)
            .map_err(|e| BrokerError::Command(format!("encode stats: {}", e)))?;
        self.broker
            .publish(&self.settings.stats_topic, &body, &EventIdentity::of(&body))
            .await?;
        Ok(())
    }
}

fn time_seeded_name() -> String {
    let nanos = Utc::now().timestamp_nanos_opt().unwrap_or_default();
    format!("counter-{}", nanos)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{Delivery, MemoryBroker, PublishOutcome};
    use async_trait::async_trait;

    /// Memory broker whose publishes to the stats topic always fail.
    struct NoStatsBroker(MemoryBroker);

    #[async_trait]
    impl Broker for NoStatsBroker {
        fn name(&self) -> &str {
            "no-stats"
        }

        async fn publish(
            &self,
            topic: &str,
            payload: &[u8],
            identity: &EventIdentity,
        ) -> Result<PublishOutcome, BrokerError> {
            if topic == DEFAULT_STATS_TOPIC {
                return Err(BrokerError::Connection("refused".into()));
            }
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
            subscription: &Subscription,
            delivery: &Delivery,
            delay: Duration,
        ) -> Result<(), BrokerError> {
            self.0.nak(subscription, delivery, delay).await
        }
    }

    async fn publish_frames(broker: &dyn Broker, count: usize) {
        for i in 0..count {
            let payload = format!("frame-{}", i).into_bytes();
            broker
                .publish(DEFAULT_TOPIC, &payload, &EventIdentity::of(&payload))
                .await
                .unwrap();
        }
    }

    #[test]
    fn test_time_seeded_names_are_counter_prefixed() {
        assert!(time_seeded_name().starts_with("counter-"));
    }

    #[test]
    fn test_resolved_durable_is_stable() {
        let settings = StatsSettings::default().with_resolved_durable();
        let name = settings.durable_name.clone().unwrap();
        assert!(name.starts_with("counter-"));

        let broker = Arc::new(MemoryBroker::new());
        let aggregator = StatsAggregator::new(broker, settings.clone());
        assert_eq!(aggregator.durable_name(), name);
        assert_eq!(settings.with_resolved_durable().durable_name, Some(name));
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_resumes_the_same_cursor() {
        let broker = Arc::new(MemoryBroker::new());
        publish_frames(broker.as_ref(), 3).await;

        let settings = StatsSettings::default().with_resolved_durable();
        let counters = Arc::new(StatsCounters::default());

        for _ in 0..2 {
            let aggregator = StatsAggregator::new(broker.clone(), settings.clone())
                .with_counters(counters.clone());
            let shutdown = ShutdownSignal::new();
            let task = {
                let shutdown = shutdown.clone();
                tokio::spawn(async move { aggregator.run(shutdown).await })
            };
            tokio::time::sleep(Duration::from_secs(2)).await;
            shutdown.trigger();
            task.await.unwrap().unwrap();
        }

        // The second run attached to the acked cursor, not a fresh one
        assert_eq!(counters.lifetime(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_emits_and_resets_period_counter() {
        let broker = Arc::new(MemoryBroker::new());
        publish_frames(broker.as_ref(), 5).await;

        let aggregator = StatsAggregator::new(broker.clone(), StatsSettings::default());
        let counters = aggregator.counters();
        let shutdown = ShutdownSignal::new();
        let task = {
            let shutdown = shutdown.clone();
            tokio::spawn(async move { aggregator.run(shutdown).await })
        };

        tokio::time::sleep(Duration::from_millis(10_500)).await;

        let published = broker.stored_payloads(DEFAULT_STATS_TOPIC).await;
        assert_eq!(published.len(), 1);
        let snapshot: StatsSnapshot = serde_json::from_slice(&published[0]).unwrap();
        assert_eq!(snapshot.total_messages, 5);
        assert_eq!(snapshot.period, "10.0s");
        assert!((snapshot.average_per_second - 0.5).abs() < 1e-9);

        assert_eq!(counters.current_period(), 0);
        assert_eq!(counters.lifetime(), 5);

        shutdown.trigger();
        task.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_emit_failure_does_not_stop_counting() {
        let broker = Arc::new(NoStatsBroker(MemoryBroker::new()));
        let aggregator = StatsAggregator::new(broker.clone(), StatsSettings::default());
        let counters = aggregator.counters();
        let shutdown = ShutdownSignal::new();
        let task = {
            let shutdown = shutdown.clone();
            tokio::spawn(async move { aggregator.run(shutdown).await })
        };

        publish_frames(broker.as_ref(), 3).await;
        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(counters.emit_errors(), 1);

        let more = b"frame-after".to_vec();
        broker
            .publish(DEFAULT_TOPIC, &more, &EventIdentity::of(&more))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(counters.lifetime(), 4);

        shutdown.trigger();
        task.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_independent_of_processing_cursor() {
        let broker = Arc::new(MemoryBroker::new());
        publish_frames(broker.as_ref(), 2).await;

        // A processing consumer that fetched but never acked
        let processing = broker
            .pull_subscribe(DEFAULT_TOPIC, "consumer-0", StartPosition::Earliest)
            .await
            .unwrap();
        let held = broker.fetch(&processing, 10, Duration::ZERO).await.unwrap();
        assert_eq!(held.len(), 2);

        let aggregator = StatsAggregator::new(
            broker.clone(),
            StatsSettings {
                durable_name: Some("counter-test".into()),
                ..StatsSettings::default()
            },
        );
        let counters = aggregator.counters();
        let shutdown = ShutdownSignal::new();
        let task = {
            let shutdown = shutdown.clone();
            tokio::spawn(async move { aggregator.run(shutdown).await })
        };

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(counters.lifetime(), 2);
        assert_eq!(broker.pending_count(DEFAULT_TOPIC, "consumer-0").await, 2);

        shutdown.trigger();
        task.await.unwrap().unwrap();
    }
}
