//! Configuration for the fanout service.
//!
//! Loads configuration from TOML files with environment variable
//! substitution, then applies the deployment environment overrides.
//!
//! # Example
//!
//! ```toml
//! [broker]
//! backend = "redis"
//! topic = "atproto.firehose.raw"
//!
//! [publisher]
//! relay_url = "wss://bsky.network"
//! overflow = "drop_oldest"
//!
//! [consumer]
//! count = 4
//! poll_interval_secs = 60
//!
//! [webhook]
//! url = "${WEBHOOK_URL}"
//! ```
//!
//! # Environment overrides
//!
//! `REDIS_URL`, `RELAY_HOST`, `CONSUMER_COUNT`, `POLL_INTERVAL_SECONDS`,
//! `BATCH_SIZE`, `WEBHOOK_URL` and `METRICS_PORT` win over the file.

use crate::broker::{RedisPools, StartPosition};
use crate::buffer::OverflowPolicy;
use crate::consumer::ConsumerSettings;
use crate::jitter::{MAX_SPREAD, MIN_SPREAD};
use crate::publisher::{PublisherSettings, DEFAULT_TOPIC};
use crate::source::DEFAULT_CURSOR_FIELD;
use crate::stats::{StatsSettings, DEFAULT_STATS_TOPIC};
use regex::Regex;
use serde::Deserialize;
use std::env;
use std::fs;
use std::path::Path;
use std::str::FromStr;
use std::sync::OnceLock;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Invalid value for {var}: {value}")]
    InvalidEnv { var: String, value: String },
}

/// Root configuration structure
#[derive(Debug, Deserialize, Clone, Default)]
pub struct FanoutConfig {
    #[serde(default)]
    pub broker: BrokerConfig,

    #[serde(default)]
    pub redis: RedisConfig,

    #[serde(default)]
    pub publisher: PublisherConfig,

    #[serde(default)]
    pub consumer: ConsumerConfig,

    #[serde(default)]
    pub webhook: WebhookConfig,

    #[serde(default)]
    pub stats: StatsConfig,

    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum BrokerBackend {
    #[default]
    Redis,
    Memory,
}

/// Broker configuration
#[derive(Debug, Deserialize, Clone)]
pub struct BrokerConfig {
    #[serde(default)]
    pub backend: BrokerBackend,

    #[serde(default = "default_topic")]
    pub topic: String,

    #[serde(default = "default_stats_topic")]
    pub stats_topic: String,

    /// Window in which identical publishes collapse into one message
    #[serde(default = "default_five_minutes")]
    pub dedup_window_secs: u64,

    #[serde(default = "default_five_minutes")]
    pub retention_secs: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            backend: BrokerBackend::default(),
            topic: default_topic(),
            stats_topic: default_stats_topic(),
            dedup_window_secs: default_five_minutes(),
            retention_secs: default_five_minutes(),
        }
    }
}

impl BrokerConfig {
    pub fn dedup_window(&self) -> Duration {
        Duration::from_secs(self.dedup_window_secs)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }
}

fn default_topic() -> String {
    DEFAULT_TOPIC.to_string()
}

fn default_stats_topic() -> String {
    DEFAULT_STATS_TOPIC.to_string()
}

fn default_five_minutes() -> u64 {
    300
}

/// Redis configuration
#[derive(Debug, Deserialize, Clone)]
pub struct RedisConfig {
    #[serde(default = "default_redis_url")]
    pub url: String,

    /// Key prefix for publisher checkpoints
    #[serde(default = "default_checkpoint_prefix")]
    pub checkpoint_prefix: String,

    /// Connections for publish, ack, nak and checkpoints
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,

    /// Connections for fetches; defaults to one per blocking reader plus two
    #[serde(default)]
    pub read_pool_size: Option<usize>,

    #[serde(default = "default_pool_wait_timeout_ms")]
    pub pool_wait_timeout_ms: u64,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
            checkpoint_prefix: default_checkpoint_prefix(),
            pool_size: default_pool_size(),
            read_pool_size: None,
            pool_wait_timeout_ms: default_pool_wait_timeout_ms(),
        }
    }
}

fn default_pool_size() -> usize {
    16
}

fn default_pool_wait_timeout_ms() -> u64 {
    2000
}

fn default_redis_url() -> String {
    "redis://localhost:6379".to_string()
}

fn default_checkpoint_prefix() -> String {
    "fanout:checkpoint".to_string()
}

/// Ingest publisher configuration
#[derive(Debug, Deserialize, Clone)]
pub struct PublisherConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_publisher_name")]
    pub name: String,

    /// WebSocket relay, e.g. `wss://bsky.network`
    #[serde(default)]
    pub relay_url: Option<String>,

    #[serde(default)]
    pub user_agent: Option<String>,

    #[serde(default = "default_cursor_field")]
    pub cursor_field: String,

    #[serde(default = "default_buffer_capacity")]
    pub buffer_capacity: usize,

    #[serde(default)]
    pub overflow: OverflowPolicy,

    #[serde(default)]
    pub resume: bool,

    #[serde(default = "default_checkpoint_interval_secs")]
    pub checkpoint_interval_secs: u64,

    #[serde(default = "default_retry_base_ms")]
    pub retry_base_ms: u64,

    #[serde(default = "default_retry_max_ms")]
    pub retry_max_ms: u64,

    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            name: default_publisher_name(),
            relay_url: None,
            user_agent: None,
            cursor_field: default_cursor_field(),
            buffer_capacity: default_buffer_capacity(),
            overflow: OverflowPolicy::default(),
            resume: false,
            checkpoint_interval_secs: default_checkpoint_interval_secs(),
            retry_base_ms: default_retry_base_ms(),
            retry_max_ms: default_retry_max_ms(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_publisher_name() -> String {
    "publisher".to_string()
}

fn default_cursor_field() -> String {
    DEFAULT_CURSOR_FIELD.to_string()
}

fn default_buffer_capacity() -> usize {
    10_000
}

fn default_checkpoint_interval_secs() -> u64 {
    5
}

fn default_retry_base_ms() -> u64 {
    100
}

fn default_retry_max_ms() -> u64 {
    10_000
}

fn default_shutdown_grace_secs() -> u64 {
    5
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum StartFrom {
    Earliest,
    #[default]
    New,
}

impl From<StartFrom> for StartPosition {
    fn from(start: StartFrom) -> Self {
        match start {
            StartFrom::Earliest => StartPosition::Earliest,
            StartFrom::New => StartPosition::New,
        }
    }
}

/// Pull consumer configuration, shared by every instance
#[derive(Debug, Deserialize, Clone)]
pub struct ConsumerConfig {
    #[serde(default = "default_consumer_count")]
    pub count: usize,

    /// Instances are named `<prefix>-<index>`
    #[serde(default = "default_name_prefix")]
    pub name_prefix: String,

    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,

    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    #[serde(default = "default_jitter_spread")]
    pub jitter_spread: f64,

    #[serde(default = "default_five_secs")]
    pub fetch_wait_secs: u64,

    #[serde(default = "default_five_secs")]
    pub nak_delay_secs: u64,

    #[serde(default)]
    pub start: StartFrom,

    #[serde(default = "default_max_restarts")]
    pub max_restarts: u32,

    #[serde(default = "default_five_secs")]
    pub restart_backoff_secs: u64,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            count: default_consumer_count(),
            name_prefix: default_name_prefix(),
            poll_interval_secs: default_poll_interval_secs(),
            batch_size: default_batch_size(),
            jitter_spread: default_jitter_spread(),
            fetch_wait_secs: default_five_secs(),
            nak_delay_secs: default_five_secs(),
            start: StartFrom::default(),
            max_restarts: default_max_restarts(),
            restart_backoff_secs: default_five_secs(),
        }
    }
}

fn default_consumer_count() -> usize {
    1
}

fn default_name_prefix() -> String {
    "consumer".to_string()
}

fn default_poll_interval_secs() -> u64 {
    60
}

fn default_batch_size() -> usize {
    100
}

fn default_jitter_spread() -> f64 {
    0.5
}

fn default_five_secs() -> u64 {
    5
}

fn default_max_restarts() -> u32 {
    5
}

/// Webhook sink configuration; no URL means pass-through acking
#[derive(Debug, Deserialize, Clone)]
pub struct WebhookConfig {
    #[serde(default)]
    pub url: Option<String>,

    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    #[serde(default)]
    pub retries: u32,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            url: None,
            timeout_ms: default_timeout_ms(),
            retries: 0,
        }
    }
}

fn default_timeout_ms() -> u64 {
    10000
}

/// Stats aggregator configuration
#[derive(Debug, Deserialize, Clone)]
pub struct StatsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_stats_period_secs")]
    pub period_secs: u64,

    /// Fixed durable name; time-seeded when unset
    #[serde(default)]
    pub durable_name: Option<String>,
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            period_secs: default_stats_period_secs(),
            durable_name: None,
        }
    }
}

fn default_stats_period_secs() -> u64 {
    10
}

/// Telemetry server configuration
#[derive(Debug, Deserialize, Clone)]
pub struct TelemetryConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_bind")]
    pub bind: String,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind: default_bind(),
            port: default_port(),
            shutdown_timeout_secs: default_shutdown_timeout_secs(),
        }
    }
}

fn default_bind() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_shutdown_timeout_secs() -> u64 {
    30
}

impl FanoutConfig {
    /// Load configuration from the default path or FANOUT_CONFIG env var.
    pub fn load() -> Result<Self, ConfigError> {
        let config_path =
            env::var("FANOUT_CONFIG").unwrap_or_else(|_| "config/fanout.toml".to_string());

        Self::load_from(&config_path)
    }

    /// Load configuration from a specific path, then apply env overrides.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        let mut config = if path.exists() {
            info!(path = %path.display(), "Loading configuration");
            let content = fs::read_to_string(path)?;
            Self::parse(&content)?
        } else {
            info!(
                path = %path.display(),
                "Config file not found, using defaults"
            );
            Self::default()
        };

        config.apply_env_overrides(|var| env::var(var).ok())?;
        config.validate()?;

        info!(
            backend = ?config.broker.backend,
            topic = %config.broker.topic,
            publisher = config.publisher.enabled,
            consumers = config.consumer.count,
            webhook = config.webhook.url.is_some(),
            "Configuration loaded"
        );

        Ok(config)
    }

    /// Parse TOML content after `${VAR}` substitution.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let content = substitute_env_vars(content);
        debug!("Parsing TOML configuration");
        Ok(toml::from_str(&content)?)
    }

    /// Apply the deployment environment overrides through `lookup`.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup("REDIS_URL") {
            self.redis.url = url;
        }
        if let Some(relay) = lookup("RELAY_HOST") {
            self.publisher.relay_url = Some(relay);
        }
        if let Some(count) = parse_env(&lookup, "CONSUMER_COUNT")? {
            self.consumer.count = count;
        }
        if let Some(secs) = parse_env(&lookup, "POLL_INTERVAL_SECONDS")? {
            self.consumer.poll_interval_secs = secs;
        }
        if let Some(size) = parse_env(&lookup, "BATCH_SIZE")? {
            self.consumer.batch_size = size;
        }
        if let Some(url) = lookup("WEBHOOK_URL") {
            self.webhook.url = (!url.is_empty()).then_some(url);
        }
        if let Some(port) = parse_env(&lookup, "METRICS_PORT")? {
            self.telemetry.port = port;
        }
        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.broker.topic.is_empty() || self.broker.stats_topic.is_empty() {
            return Err(ConfigError::ValidationError(
                "broker topics must not be empty".to_string(),
            ));
        }
        if self.broker.topic == self.broker.stats_topic {
            return Err(ConfigError::ValidationError(
                "broker.stats_topic must differ from broker.topic".to_string(),
            ));
        }

        if self.publisher.enabled {
            let relay = self.publisher.relay_url.as_deref().ok_or_else(|| {
                ConfigError::ValidationError(
                    "publisher.relay_url (or RELAY_HOST) is required when the publisher is enabled"
                        .to_string(),
                )
            })?;
            if !relay.starts_with("ws://") && !relay.starts_with("wss://") {
                return Err(ConfigError::ValidationError(format!(
                    "publisher.relay_url must start with ws:// or wss://, got '{}'",
                    relay
                )));
            }
            if self.publisher.buffer_capacity == 0 {
                return Err(ConfigError::ValidationError(
                    "publisher.buffer_capacity must be at least 1".to_string(),
                ));
            }
        }

        if self.consumer.batch_size == 0 {
            return Err(ConfigError::ValidationError(
                "consumer.batch_size must be at least 1".to_string(),
            ));
        }
        if self.consumer.poll_interval_secs == 0 {
            return Err(ConfigError::ValidationError(
                "consumer.poll_interval_secs must be at least 1".to_string(),
            ));
        }
        if !(MIN_SPREAD..=MAX_SPREAD).contains(&self.consumer.jitter_spread) {
            return Err(ConfigError::ValidationError(format!(
                "consumer.jitter_spread must be within [{}, {}]",
                MIN_SPREAD, MAX_SPREAD
            )));
        }

        if let Some(url) = &self.webhook.url {
            // Check for unsubstituted env vars
            if url.contains("${") {
                warn!(url = %url, "Webhook URL contains unsubstituted environment variable");
            }

            if !url.starts_with("http://") && !url.starts_with("https://") {
                return Err(ConfigError::ValidationError(
                    "webhook.url must start with http:// or https://".to_string(),
                ));
            }
        }

        if self.stats.enabled && self.stats.period_secs == 0 {
            return Err(ConfigError::ValidationError(
                "stats.period_secs must be at least 1".to_string(),
            ));
        }

        if self.redis.pool_size == 0 {
            return Err(ConfigError::ValidationError(
                "redis.pool_size must be at least 1".to_string(),
            ));
        }
        if let Some(read) = self.redis.read_pool_size {
            if read < self.blocking_readers() {
                return Err(ConfigError::ValidationError(format!(
                    "redis.read_pool_size ({}) must cover every blocking reader ({})",
                    read,
                    self.blocking_readers()
                )));
            }
        }

        Ok(())
    }

    /// Publisher settings derived from this configuration
    pub fn publisher_settings(&self) -> PublisherSettings {
        PublisherSettings {
            name: self.publisher.name.clone(),
            topic: self.broker.topic.clone(),
            buffer_capacity: self.publisher.buffer_capacity,
            overflow: self.publisher.overflow,
            resume: self.publisher.resume,
            checkpoint_interval: Duration::from_secs(self.publisher.checkpoint_interval_secs),
            retry_base: Duration::from_millis(self.publisher.retry_base_ms),
            retry_max: Duration::from_millis(self.publisher.retry_max_ms),
            shutdown_grace: Duration::from_secs(self.publisher.shutdown_grace_secs),
        }
    }

    /// Settings shared by every consumer instance
    pub fn consumer_settings(&self) -> ConsumerSettings {
        ConsumerSettings {
            topic: self.broker.topic.clone(),
            poll_interval: Duration::from_secs(self.consumer.poll_interval_secs),
            batch_size: self.consumer.batch_size,
            jitter_spread: self.consumer.jitter_spread,
            fetch_wait: Duration::from_secs(self.consumer.fetch_wait_secs),
            nak_delay: Duration::from_secs(self.consumer.nak_delay_secs),
            start_position: self.consumer.start.into(),
        }
    }

    pub fn stats_settings(&self) -> StatsSettings {
        StatsSettings {
            topic: self.broker.topic.clone(),
            stats_topic: self.broker.stats_topic.clone(),
            durable_name: self.stats.durable_name.clone(),
            period: Duration::from_secs(self.stats.period_secs),
            ..StatsSettings::default()
        }
    }

    /// Tasks that can hold a read connection for a whole fetch wait
    pub fn blocking_readers(&self) -> usize {
        self.consumer.count + usize::from(self.stats.enabled)
    }

    pub fn redis_pools(&self) -> RedisPools {
        RedisPools {
            command_size: self.redis.pool_size,
            read_size: self
                .redis
                .read_pool_size
                .unwrap_or(self.blocking_readers() + 2),
            wait_timeout: Duration::from_millis(self.redis.pool_wait_timeout_ms),
        }
    }

    /// Consumer instance names, `<prefix>-0` .. `<prefix>-<count-1>`
    pub fn consumer_names(&self) -> Vec<String> {
        (0..self.consumer.count)
            .map(|i| format!("{}-{}", self.consumer.name_prefix, i))
            .collect()
    }
}

fn parse_env<T, F>(lookup: &F, var: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(var) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidEnv {
                var: var.to_string(),
                value,
            }),
    }
}

fn env_var_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").unwrap_or_else(|e| unreachable!("{}", e))
    })
}

/// Substitute environment variables in the format ${VAR_NAME}
fn substitute_env_vars(content: &str) -> String {
    env_var_pattern()
        .replace_all(content, |caps: &regex::Captures| {
            let var_name = &caps[1];
            match env::var(var_name) {
                Ok(value) => value,
                Err(_) => {
                    debug!(var = %var_name, "Environment variable not set, keeping placeholder");
                    caps[0].to_string()
                }
            }
        })
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn valid() -> FanoutConfig {
        let mut config = FanoutConfig::default();
        config.publisher.relay_url = Some("wss://bsky.network".to_string());
        config
    }

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |var| map.get(var).cloned()
    }

    #[test]
    fn test_env_var_substitution() {
        env::set_var("FANOUT_TEST_VAR", "substituted_value");
        let input = "url = \"${FANOUT_TEST_VAR}\"";
        let output = substitute_env_vars(input);
        assert_eq!(output, "url = \"substituted_value\"");
        env::remove_var("FANOUT_TEST_VAR");
    }

    #[test]
    fn test_env_var_not_set() {
        let input = "url = \"${FANOUT_NONEXISTENT_VAR}\"";
        let output = substitute_env_vars(input);
        assert_eq!(output, "url = \"${FANOUT_NONEXISTENT_VAR}\"");
    }

    #[test]
    fn test_default_config() {
        let config = FanoutConfig::default();
        assert_eq!(config.broker.backend, BrokerBackend::Redis);
        assert_eq!(config.broker.topic, "atproto.firehose.raw");
        assert_eq!(config.redis.url, "redis://localhost:6379");
        assert_eq!(config.consumer.count, 1);
        assert_eq!(config.consumer.poll_interval_secs, 60);
        assert_eq!(config.consumer.batch_size, 100);
        assert_eq!(config.consumer.start, StartFrom::New);
        assert_eq!(config.publisher.overflow, OverflowPolicy::Block);
        assert_eq!(config.telemetry.port, 8080);
        assert!(config.webhook.url.is_none());
    }

    #[test]
    fn test_read_pool_covers_blocking_readers() {
        let mut config = valid();
        config.consumer.count = 12;

        let pools = config.redis_pools();
        assert_eq!(pools.command_size, 16);
        assert_eq!(pools.read_size, 15);
        assert_eq!(pools.wait_timeout, Duration::from_secs(2));

        config.redis.read_pool_size = Some(12);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ValidationError(msg)) if msg.contains("read_pool_size")
        ));

        config.stats.enabled = false;
        assert!(config.validate().is_ok());
        assert_eq!(config.redis_pools().read_size, 12);
    }

    #[test]
    fn test_parse_sections() {
        let toml = r#"
            [broker]
            backend = "memory"
            dedup_window_secs = 120

            [publisher]
            relay_url = "wss://jetstream.example/subscribe"
            overflow = "drop_oldest"
            buffer_capacity = 50
            resume = true

            [consumer]
            count = 3
            start = "earliest"
            jitter_spread = 0.3

            [webhook]
            url = "https://sink.example/batches"
            retries = 2
        "#;

        let config = FanoutConfig::parse(toml).unwrap();
        assert_eq!(config.broker.backend, BrokerBackend::Memory);
        assert_eq!(config.broker.dedup_window(), Duration::from_secs(120));
        assert_eq!(config.publisher.overflow, OverflowPolicy::DropOldest);
        assert_eq!(config.publisher.buffer_capacity, 50);
        assert!(config.publisher.resume);
        assert_eq!(config.consumer.count, 3);
        assert_eq!(config.webhook.retries, 2);
        assert!(config.validate().is_ok());

        let settings = config.consumer_settings();
        assert_eq!(settings.start_position, StartPosition::Earliest);
        assert_eq!(settings.batch_size, 100);
        assert_eq!(
            config.consumer_names(),
            vec!["consumer-0", "consumer-1", "consumer-2"]
        );
    }

    #[test]
    fn test_env_overrides_win() {
        let mut config = valid();
        config
            .apply_env_overrides(lookup(&[
                ("REDIS_URL", "redis://cache:6379"),
                ("RELAY_HOST", "wss://relay.example"),
                ("CONSUMER_COUNT", "8"),
                ("POLL_INTERVAL_SECONDS", "30"),
                ("BATCH_SIZE", "250"),
                ("WEBHOOK_URL", "http://receiver:8080/webhook"),
                ("METRICS_PORT", "9100"),
            ]))
            .unwrap();

        assert_eq!(config.redis.url, "redis://cache:6379");
        assert_eq!(config.publisher.relay_url.as_deref(), Some("wss://relay.example"));
        assert_eq!(config.consumer.count, 8);
        assert_eq!(config.consumer.poll_interval_secs, 30);
        assert_eq!(config.consumer.batch_size, 250);
        assert_eq!(config.webhook.url.as_deref(), Some("http://receiver:8080/webhook"));
        assert_eq!(config.telemetry.port, 9100);
    }

    #[test]
    fn test_env_override_rejects_garbage() {
        let mut config = valid();
        let result = config.apply_env_overrides(lookup(&[("BATCH_SIZE", "lots")]));
        assert!(matches!(result, Err(ConfigError::InvalidEnv { .. })));
    }

    #[test]
    fn test_publisher_requires_relay() {
        assert!(FanoutConfig::default().validate().is_err());

        let mut config = FanoutConfig::default();
        config.publisher.enabled = false;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation_rejections() {
        let mut config = valid();
        config.consumer.batch_size = 0;
        assert!(config.validate().is_err());

        let mut config = valid();
        config.consumer.poll_interval_secs = 0;
        assert!(config.validate().is_err());

        let mut config = valid();
        config.consumer.jitter_spread = 0.1;
        assert!(config.validate().is_err());

        let mut config = valid();
        config.publisher.buffer_capacity = 0;
        assert!(config.validate().is_err());

        let mut config = valid();
        config.publisher.relay_url = Some("https://bsky.network".into());
        assert!(config.validate().is_err());

        let mut config = valid();
        config.webhook.url = Some("not-a-url".into());
        assert!(config.validate().is_err());

        assert!(valid().validate().is_ok());
    }
}
