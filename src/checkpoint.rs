//! Durable source cursor checkpoints.
//!
//! The publisher records the cursor of the last event it handed to the
//! broker and periodically persists it here. On restart with resume
//! enabled, the stored cursor is passed to the source so reading continues
//! near where it stopped; the overlap is absorbed by broker-side dedup.
//!
//! Checkpoints are keyed by publisher name so several publishers reading
//! the same source never overwrite each other.

use crate::broker::BrokerError;
use async_trait::async_trait;
use deadpool_redis::redis::{AsyncCommands, RedisError};
use deadpool_redis::Pool;
use std::collections::HashMap;
use tokio::sync::Mutex;

/// Persistent storage for the last published source cursor.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Load the cursor stored for `publisher`
    async fn load(&self, publisher: &str) -> Result<Option<u64>, BrokerError>;

    /// Persist `cursor` for `publisher`
    async fn store(&self, publisher: &str, cursor: u64) -> Result<(), BrokerError>;
}

/// Checkpoints kept in Redis string keys `<prefix>:<publisher>`.
#[derive(Clone)]
pub struct RedisCheckpointStore {
    pool: Pool,
    prefix: String,
}

impl RedisCheckpointStore {
    pub fn new(pool: Pool, prefix: impl Into<String>) -> Self {
        Self {
            pool,
            prefix: prefix.into(),
        }
    }

    fn key(&self, publisher: &str) -> String {
        format!("{}:{}", self.prefix, publisher)
    }
}

fn redis_error(e: RedisError) -> BrokerError {
    BrokerError::Command(e.to_string())
}

#[async_trait]
impl CheckpointStore for RedisCheckpointStore {
    async fn load(&self, publisher: &str) -> Result<Option<u64>, BrokerError> {
        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| BrokerError::Connection(e.to_string()))?;
        conn.get(self.key(publisher)).await.map_err(redis_error)
    }

    async fn store(&self, publisher: &str, cursor: u64) -> Result<(), BrokerError> {
        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| BrokerError::Connection(e.to_string()))?;
        conn.set(self.key(publisher), cursor)
            .await
            .map_err(redis_error)
    }
}

/// In-process checkpoints, for tests and the memory backend.
#[derive(Default)]
pub struct MemoryCheckpointStore {
    cursors: Mutex<HashMap<String, u64>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn load(&self, publisher: &str) -> Result<Option<u64>, BrokerError> {
        Ok(self.cursors.lock().await.get(publisher).copied())
    }

    async fn store(&self, publisher: &str, cursor: u64) -> Result<(), BrokerError> {
        self.cursors
            .lock()
            .await
            .insert(publisher.to_string(), cursor);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_store_roundtrip_per_publisher() {
        let store = MemoryCheckpointStore::new();
        assert_eq!(store.load("shuffler-a").await.unwrap(), None);

        store.store("shuffler-a", 100).await.unwrap();
        store.store("shuffler-a", 150).await.unwrap();
        store.store("shuffler-b", 7).await.unwrap();

        assert_eq!(store.load("shuffler-a").await.unwrap(), Some(150));
        assert_eq!(store.load("shuffler-b").await.unwrap(), Some(7));
    }
}
