//! Fanout service binary.
//!
//! ## Configuration
//!
//! - `FANOUT_CONFIG`: path to the TOML config (default: `config/fanout.toml`)
//! - `REDIS_URL`, `RELAY_HOST`, `CONSUMER_COUNT`, `POLL_INTERVAL_SECONDS`,
//!   `BATCH_SIZE`, `WEBHOOK_URL`, `METRICS_PORT`: override the file
//! - `RUST_LOG`: log filter, falling back to `LOG_LEVEL` (default: "info")
//! - `LOG_FORMAT=json`: emit JSON log lines

use firehose_fanout::app;
use firehose_fanout::config::FanoutConfig;
use firehose_fanout::shutdown::ShutdownSignal;
use std::env;
use std::process::ExitCode;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string())))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let json = env::var("LOG_FORMAT")
        .map(|format| format.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    init_tracing();

    info!(version = env!("CARGO_PKG_VERSION"), "Starting firehose fanout");

    let config = match FanoutConfig::load() {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "Failed to load configuration");
            return ExitCode::FAILURE;
        }
    };

    let shutdown = ShutdownSignal::with_timeout(Duration::from_secs(
        config.telemetry.shutdown_timeout_secs,
    ));
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move { shutdown.wait().await });
    }

    match app::run(config, shutdown).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "Fanout service failed");
            ExitCode::FAILURE
        }
    }
}
