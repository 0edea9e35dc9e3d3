//! Read-only telemetry surface.
//!
//! Components own their counters; [`Telemetry`] only holds shared
//! references and sums them when a scrape arrives. Nothing here writes to a
//! counter.
//!
//! ## Endpoints
//!
//! - `GET /metrics`: plaintext, one `name value` pair per line
//! - `GET /health`: JSON status; 503 when the broker does not answer a ping

use crate::broker::Broker;
use crate::consumer::ConsumerCounters;
use crate::publisher::PublisherStats;
use crate::shutdown::ShutdownSignal;
use crate::stats::StatsCounters;
use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use serde_json::json;
use std::fmt::Write;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

/// Counter sources registered by the application.
#[derive(Clone)]
pub struct Telemetry {
    broker: Arc<dyn Broker>,
    publisher: Option<Arc<PublisherStats>>,
    consumers: Vec<(String, Arc<ConsumerCounters>)>,
    stats: Option<Arc<StatsCounters>>,
    start_time: Instant,
}

impl Telemetry {
    pub fn new(broker: Arc<dyn Broker>) -> Self {
        Self {
            broker,
            publisher: None,
            consumers: Vec::new(),
            stats: None,
            start_time: Instant::now(),
        }
    }

    pub fn with_publisher(mut self, stats: Arc<PublisherStats>) -> Self {
        self.publisher = Some(stats);
        self
    }

    pub fn with_consumer(mut self, name: impl Into<String>, counters: Arc<ConsumerCounters>) -> Self {
        self.consumers.push((name.into(), counters));
        self
    }

    pub fn with_stats(mut self, counters: Arc<StatsCounters>) -> Self {
        self.stats = Some(counters);
        self
    }

    fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Render every counter as `name value` lines.
    pub fn render_plaintext(&self) -> String {
        let mut lines: Vec<(&str, u64)> = Vec::new();

        if let Some(publisher) = &self.publisher {
            let snapshot = publisher.snapshot();
            lines.push(("messages_read_total", snapshot.read));
            lines.push(("messages_published_total", snapshot.published));
            lines.push(("messages_duplicate_total", snapshot.duplicates));
            lines.push(("messages_dropped_total", snapshot.dropped));
            lines.push(("messages_abandoned_total", snapshot.abandoned));
            lines.push(("publish_errors_total", snapshot.publish_errors));
            lines.push(("cursor_position", snapshot.last_cursor.unwrap_or(0)));
        }

        if !self.consumers.is_empty() {
            let mut active = 0;
            let mut processed = 0;
            let mut failed = 0;
            let mut nacked = 0;
            let mut nak_errors = 0;
            for (_, counters) in &self.consumers {
                let snapshot = counters.snapshot();
                active += u64::from(snapshot.running);
                processed += snapshot.processed;
                failed += snapshot.batches_failed;
                nacked += snapshot.nacked;
                nak_errors += snapshot.nak_errors;
            }
            lines.push(("consumers_active", active));
            lines.push(("messages_processed_total", processed));
            lines.push(("batches_failed_total", failed));
            lines.push(("messages_nacked_total", nacked));
            lines.push(("nak_errors_total", nak_errors));
        }

        if let Some(stats) = &self.stats {
            lines.push(("stats_messages_total", stats.lifetime()));
        }

        lines.push(("uptime_seconds", self.uptime_seconds()));

        let mut out = String::new();
        for (name, value) in lines {
            let _ = writeln!(out, "{} {}", name, value);
        }
        out
    }

    /// Build the axum router.
    pub fn router(self) -> Router {
        Router::new()
            .route("/metrics", get(get_metrics))
            .route("/health", get(health_check))
            .with_state(Arc::new(self))
    }

    /// Serve until `shutdown` fires.
    pub async fn serve(self, addr: SocketAddr, shutdown: ShutdownSignal) -> std::io::Result<()> {
        let listener = tokio::net::TcpListener::bind(addr).await?;
        info!(addr = %addr, "Telemetry server listening");

        axum::serve(listener, self.router())
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await
    }
}

async fn get_metrics(State(telemetry): State<Arc<Telemetry>>) -> Response {
    (
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        telemetry.render_plaintext(),
    )
        .into_response()
}

async fn health_check(State(telemetry): State<Arc<Telemetry>>) -> Response {
    let uptime = telemetry.uptime_seconds();
    match telemetry.broker.ping().await {
        Ok(()) => Json(json!({
            "status": "ok",
            "broker": telemetry.broker.name(),
            "broker_status": "connected",
            "version": env!("CARGO_PKG_VERSION"),
            "uptime_seconds": uptime,
        }))
        .into_response(),
        Err(e) => {
            warn!(error = %e, "Broker ping failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({
                    "status": "degraded",
                    "broker": telemetry.broker.name(),
                    "broker_status": "unreachable",
                    "error": e.to_string(),
                    "version": env!("CARGO_PKG_VERSION"),
                    "uptime_seconds": uptime,
                })),
            )
                .into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryBroker;

    fn parse(body: &str) -> Vec<(String, u64)> {
        body.lines()
            .map(|line| {
                let (name, value) = line.split_once(' ').unwrap();
                (name.to_string(), value.parse().unwrap())
            })
            .collect()
    }

    #[test]
    fn test_render_includes_registered_sources_only() {
        let telemetry = Telemetry::new(Arc::new(MemoryBroker::new()))
            .with_publisher(Arc::new(PublisherStats::default()));
        let body = telemetry.render_plaintext();
        let names: Vec<String> = parse(&body).into_iter().map(|(n, _)| n).collect();

        assert!(names.contains(&"messages_read_total".to_string()));
        assert!(names.contains(&"cursor_position".to_string()));
        assert!(!names.contains(&"messages_processed_total".to_string()));
        assert!(!names.contains(&"stats_messages_total".to_string()));
    }

    #[test]
    fn test_consumers_are_aggregated() {
        let telemetry = Telemetry::new(Arc::new(MemoryBroker::new()))
            .with_consumer("consumer-0", Arc::new(ConsumerCounters::default()))
            .with_consumer("consumer-1", Arc::new(ConsumerCounters::default()))
            .with_stats(Arc::new(StatsCounters::default()));
        let metrics = parse(&telemetry.render_plaintext());

        assert!(metrics.contains(&("consumers_active".to_string(), 0)));
        assert!(metrics.contains(&("messages_processed_total".to_string(), 0)));
        assert!(metrics.contains(&("stats_messages_total".to_string(), 0)));
    }
}
