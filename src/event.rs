//! Core event types shared by the publisher and the consumers.
//!
//! A [`RawEvent`] is one frame read from the upstream firehose. Its
//! [`EventIdentity`] is derived from the payload bytes alone, so the same
//! frame read twice (by a reconnecting publisher, or by two publishers in
//! parallel) always maps to the same broker idempotency key.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// A single frame read from the upstream event source.
///
/// # Fields
///
/// - `payload`: opaque frame bytes, forwarded to the broker untouched
/// - `cursor`: source-assigned position marker, when the frame exposes one
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawEvent {
    /// Opaque frame bytes
    pub payload: Vec<u8>,

    /// Upstream position marker (sequence number or microsecond timestamp)
    pub cursor: Option<u64>,
}

impl RawEvent {
    /// Create an event without a cursor
    pub fn new(payload: impl Into<Vec<u8>>) -> Self {
        Self {
            payload: payload.into(),
            cursor: None,
        }
    }

    /// Attach the upstream cursor
    pub fn with_cursor(mut self, cursor: u64) -> Self {
        self.cursor = Some(cursor);
        self
    }

    /// Compute the deterministic identity of this event's payload
    pub fn identity(&self) -> EventIdentity {
        EventIdentity::of(&self.payload)
    }
}

/// Deterministic digest of an event payload, used as the broker's
/// idempotency key.
///
/// Lowercase hex SHA-256 of the payload bytes (64 characters).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventIdentity(String);

impl EventIdentity {
    /// Compute the identity of a payload
    pub fn of(payload: &[u8]) -> Self {
        let digest = Sha256::digest(payload);
        EventIdentity(hex::encode(digest))
    }

    /// Borrow the hex form
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EventIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_is_deterministic() {
        let a = RawEvent::new(b"frame-1".to_vec());
        let b = RawEvent::new(b"frame-1".to_vec()).with_cursor(42);

        // Cursor is not part of the identity
        assert_eq!(a.identity(), b.identity());
    }

    #[test]
    fn test_identity_differs_for_different_payloads() {
        assert_ne!(EventIdentity::of(b"frame-1"), EventIdentity::of(b"frame-2"));
    }

    #[test]
    fn test_identity_format() {
        let id = EventIdentity::of(b"");
        assert_eq!(id.as_str().len(), 64);
        assert_eq!(
            id.as_str(),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        assert_eq!(id.to_string(), id.as_str());
    }

    #[test]
    fn test_identity_serializes_as_string() {
        let id = EventIdentity::of(b"x");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{}\"", id));
    }
}
