//! Application wiring.
//!
//! Turns a [`FanoutConfig`] into running components under one
//! [`Supervisor`]:
//!
//! | Task | Policy |
//! | --- | --- |
//! | `publisher` | terminate (external restart, resume via checkpoint) |
//! | `<prefix>-<n>` consumers | restart with backoff |
//! | `stats` | restart with backoff |
//! | `telemetry` | terminate |

use crate::broker::{Broker, BrokerError, MemoryBroker, RedisBroker};
use crate::checkpoint::{CheckpointStore, MemoryCheckpointStore, RedisCheckpointStore};
use crate::config::{BrokerBackend, ConfigError, FanoutConfig};
use crate::consumer::{ConsumerCounters, PullConsumer};
use crate::publisher::{IngestPublisher, PublisherStats};
use crate::shutdown::ShutdownSignal;
use crate::sink::{BatchSink, WebhookSink};
use crate::source::{SourceConnector, WebSocketSource};
use crate::stats::{StatsAggregator, StatsCounters};
use crate::supervisor::{RestartPolicy, Supervisor, SupervisorError};
use crate::telemetry::Telemetry;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Error, Debug)]
pub enum AppError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error(transparent)]
    Supervisor(#[from] SupervisorError),

    #[error("invalid telemetry address '{0}'")]
    InvalidAddress(String),
}

/// Build the broker and checkpoint store for the configured backend.
pub fn build_broker(
    config: &FanoutConfig,
) -> Result<(Arc<dyn Broker>, Arc<dyn CheckpointStore>), AppError> {
    match config.broker.backend {
        BrokerBackend::Redis => {
            let broker = RedisBroker::connect(
                &config.redis.url,
                config.redis_pools(),
                config.broker.dedup_window(),
                config.broker.retention(),
            )?;
            let checkpoints =
                RedisCheckpointStore::new(broker.pool().clone(), config.redis.checkpoint_prefix.clone());
            Ok((Arc::new(broker), Arc::new(checkpoints)))
        }
        BrokerBackend::Memory => {
            let broker = MemoryBroker::new()
                .with_dedup_window(config.broker.dedup_window())
                .with_retention(config.broker.retention());
            Ok((Arc::new(broker), Arc::new(MemoryCheckpointStore::new())))
        }
    }
}

/// Build the webhook sink, if one is configured.
pub fn build_sink(config: &FanoutConfig) -> Option<Arc<dyn BatchSink>> {
    let url = config.webhook.url.as_ref()?;
    let sink = WebhookSink::new(url.clone())
        .with_timeout(Duration::from_millis(config.webhook.timeout_ms))
        .with_retries(config.webhook.retries);
    Some(Arc::new(sink))
}

/// Run every configured component until shutdown or a terminating failure.
pub async fn run(config: FanoutConfig, shutdown: ShutdownSignal) -> Result<(), AppError> {
    config.validate()?;

    let (broker, checkpoints) = build_broker(&config)?;
    match broker.ping().await {
        Ok(()) => info!(broker = broker.name(), "Broker reachable"),
        Err(e) => warn!(broker = broker.name(), error = %e, "Broker not reachable yet"),
    }

    let mut supervisor = Supervisor::new(shutdown.clone());
    let mut telemetry = Telemetry::new(broker.clone());

    if config.publisher.enabled {
        let relay = config.publisher.relay_url.clone().unwrap_or_default();
        let mut source = WebSocketSource::new(relay).with_cursor_field(config.publisher.cursor_field.clone());
        if let Some(agent) = &config.publisher.user_agent {
            source = source.with_user_agent(agent.clone());
        }
        let source: Arc<dyn SourceConnector> = Arc::new(source);
        let settings = config.publisher_settings();
        let stats = Arc::new(PublisherStats::default());
        telemetry = telemetry.with_publisher(stats.clone());

        let broker = broker.clone();
        let checkpoints = checkpoints.clone();
        supervisor.spawn("publisher", RestartPolicy::Terminate, move |shutdown| {
            let publisher = IngestPublisher::new(source.clone(), broker.clone(), settings.clone())
                .with_checkpoints(checkpoints.clone())
                .with_stats(stats.clone());
            async move { publisher.run(shutdown).await }
        });
    }

    let sink = build_sink(&config);
    let consumer_policy = RestartPolicy::Restart {
        max_restarts: config.consumer.max_restarts,
        backoff: Duration::from_secs(config.consumer.restart_backoff_secs),
    };

    for name in config.consumer_names() {
        let counters = Arc::new(ConsumerCounters::default());
        telemetry = telemetry.with_consumer(name.clone(), counters.clone());

        let broker = broker.clone();
        let sink = sink.clone();
        let settings = config.consumer_settings();
        let task_name = name.clone();
        supervisor.spawn(task_name, consumer_policy, move |shutdown| {
            let mut consumer = PullConsumer::new(name.clone(), broker.clone(), settings.clone())
                .with_counters(counters.clone());
            if let Some(sink) = &sink {
                consumer = consumer.with_sink(sink.clone());
            }
            async move { consumer.run(shutdown).await }
        });
    }

    if config.stats.enabled {
        let counters = Arc::new(StatsCounters::default());
        telemetry = telemetry.with_stats(counters.clone());

        let broker = broker.clone();
        // Resolved here so restarts reuse one cursor
        let settings = config.stats_settings().with_resolved_durable();
        supervisor.spawn("stats", consumer_policy, move |shutdown| {
            let aggregator =
                StatsAggregator::new(broker.clone(), settings.clone()).with_counters(counters.clone());
            async move { aggregator.run(shutdown).await }
        });
    }

    if config.telemetry.enabled {
        let addr_str = format!("{}:{}", config.telemetry.bind, config.telemetry.port);
        let addr: SocketAddr = addr_str
            .parse()
            .map_err(|_| AppError::InvalidAddress(addr_str.clone()))?;

        supervisor.spawn("telemetry", RestartPolicy::Terminate, move |shutdown| {
            let telemetry = telemetry.clone();
            async move { telemetry.serve(addr, shutdown).await }
        });
    }

    info!(
        tasks = supervisor.len(),
        consumers = config.consumer.count,
        webhook = sink.is_some(),
        "Fanout service running"
    );

    supervisor.run().await?;
    info!("Fanout service stopped");
    Ok(())
}
