//! Upstream event sources.
//!
//! A [`SourceConnector`] opens an [`EventStream`]; the stream yields
//! [`RawEvent`]s one at a time. Any read failure is terminal for the
//! stream: the publisher surfaces it and an outer supervisor decides
//! whether to reconnect (optionally resuming from a checkpointed cursor).
//!
//! - [`WebSocketSource`]: relay firehose over WebSocket (production)
//! - [`ChannelSource`]: in-process channel (tests and local runs)

use crate::event::RawEvent;
use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::Url;
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::{HeaderValue, USER_AGENT};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info};

/// Path appended to relay URLs given without one
pub const SUBSCRIBE_REPOS_PATH: &str = "/xrpc/com.atproto.sync.subscribeRepos";

/// User agent sent on the WebSocket upgrade
pub const DEFAULT_USER_AGENT: &str = concat!("firehose-fanout/", env!("CARGO_PKG_VERSION"));

/// JSON field read as the cursor from text frames
pub const DEFAULT_CURSOR_FIELD: &str = "time_us";

/// Errors raised by event sources. All of them end the stream.
#[derive(Error, Debug)]
pub enum SourceError {
    #[error("invalid source url: {0}")]
    InvalidUrl(String),

    #[error("source connection failed: {0}")]
    Connect(String),

    #[error("source read failed: {0}")]
    Read(String),

    #[error("source stream closed")]
    Closed,
}

/// Opens event streams, optionally resuming from a cursor.
#[async_trait]
pub trait SourceConnector: Send + Sync {
    /// Human-readable description for logs
    fn describe(&self) -> String;

    /// Open a stream. `resume_from` is the last cursor known to be
    /// published, if any.
    async fn connect(&self, resume_from: Option<u64>) -> Result<Box<dyn EventStream>, SourceError>;
}

/// A connected, sequential stream of events.
#[async_trait]
pub trait EventStream: Send {
    /// Read the next event. Blocks until one arrives or the stream fails.
    async fn next_event(&mut self) -> Result<RawEvent, SourceError>;
}

/// WebSocket relay source.
#[derive(Debug, Clone)]
pub struct WebSocketSource {
    relay_url: String,
    user_agent: String,
    cursor_field: String,
}

impl WebSocketSource {
    pub fn new(relay_url: impl Into<String>) -> Self {
        Self {
            relay_url: relay_url.into(),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            cursor_field: DEFAULT_CURSOR_FIELD.to_string(),
        }
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    /// Set the numeric JSON field read as cursor from text frames
    pub fn with_cursor_field(mut self, field: impl Into<String>) -> Self {
        self.cursor_field = field.into();
        self
    }

    /// Build the subscription URL for a connection attempt.
    pub fn subscription_url(&self, resume_from: Option<u64>) -> Result<Url, SourceError> {
        let mut url = Url::parse(&self.relay_url)
            .map_err(|e| SourceError::InvalidUrl(format!("{}: {}", self.relay_url, e)))?;

        match url.scheme() {
            "ws" | "wss" => {}
            other => {
                return Err(SourceError::InvalidUrl(format!(
                    "unsupported scheme '{}' in {}",
                    other, self.relay_url
                )))
            }
        }

        if url.path().is_empty() || url.path() == "/" {
            url.set_path(SUBSCRIBE_REPOS_PATH);
        }

        if let Some(cursor) = resume_from {
            url.query_pairs_mut()
                .append_pair("cursor", &cursor.to_string());
        }

        Ok(url)
    }
}

#[async_trait]
impl SourceConnector for WebSocketSource {
    fn describe(&self) -> String {
        self.relay_url.clone()
    }

    async fn connect(&self, resume_from: Option<u64>) -> Result<Box<dyn EventStream>, SourceError> {
        let url = self.subscription_url(resume_from)?;

        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| SourceError::InvalidUrl(e.to_string()))?;
        let agent = HeaderValue::from_str(&self.user_agent)
            .map_err(|e| SourceError::Connect(format!("invalid user agent: {}", e)))?;
        request.headers_mut().insert(USER_AGENT, agent);

        let (socket, response) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| SourceError::Connect(e.to_string()))?;

        info!(
            url = %url,
            status = %response.status(),
            resume_from = ?resume_from,
            "Connected to relay"
        );

        Ok(Box::new(WebSocketStreamReader {
            socket,
            cursor_field: self.cursor_field.clone(),
        }))
    }
}

struct WebSocketStreamReader {
    socket: WebSocketStream<MaybeTlsStream<TcpStream>>,
    cursor_field: String,
}

#[async_trait]
impl EventStream for WebSocketStreamReader {
    async fn next_event(&mut self) -> Result<RawEvent, SourceError> {
        loop {
            let message = match self.socket.next().await {
                Some(Ok(message)) => message,
                Some(Err(e)) => return Err(SourceError::Read(e.to_string())),
                None => return Err(SourceError::Closed),
            };

            match message {
                Message::Binary(bytes) => return Ok(RawEvent::new(bytes)),
                Message::Text(text) => {
                    let cursor = cursor_from_json(&text, &self.cursor_field);
                    let mut event = RawEvent::new(text.into_bytes());
                    event.cursor = cursor;
                    return Ok(event);
                }
                Message::Close(frame) => {
                    debug!(frame = ?frame, "Relay closed the stream");
                    return Err(SourceError::Closed);
                }
                // Control frames are answered by the protocol layer
                Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => continue,
            }
        }
    }
}

/// Extract a numeric cursor from a JSON text frame.
fn cursor_from_json(text: &str, field: &str) -> Option<u64> {
    let value: serde_json::Value = serde_json::from_str(text).ok()?;
    value.get(field)?.as_u64()
}

/// Source fed through an in-process channel.
///
/// The stream ends with [`SourceError::Closed`] when every sender is
/// dropped. The receiver can be connected once; later connects fail.
#[derive(Clone)]
pub struct ChannelSource {
    receiver: Arc<Mutex<Option<mpsc::Receiver<RawEvent>>>>,
    connects: Arc<Mutex<Vec<Option<u64>>>>,
}

impl ChannelSource {
    /// Create a source and the sender that feeds it.
    pub fn new(capacity: usize) -> (Self, mpsc::Sender<RawEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let source = Self {
            receiver: Arc::new(Mutex::new(Some(rx))),
            connects: Arc::new(Mutex::new(Vec::new())),
        };
        (source, tx)
    }

    /// The `resume_from` argument of every connect call so far.
    pub fn connect_history(&self) -> Vec<Option<u64>> {
        self.connects
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl SourceConnector for ChannelSource {
    fn describe(&self) -> String {
        "channel".to_string()
    }

    async fn connect(&self, resume_from: Option<u64>) -> Result<Box<dyn EventStream>, SourceError> {
        self.connects
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(resume_from);

        let receiver = self
            .receiver
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or_else(|| SourceError::Connect("channel already consumed".to_string()))?;

        Ok(Box::new(ChannelStream { receiver }))
    }
}

struct ChannelStream {
    receiver: mpsc::Receiver<RawEvent>,
}

#[async_trait]
impl EventStream for ChannelStream {
    async fn next_event(&mut self) -> Result<RawEvent, SourceError> {
        self.receiver.recv().await.ok_or(SourceError::Closed)
    }
}
