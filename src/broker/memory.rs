//! In-process broker.
//!
//! [`MemoryBroker`] keeps one append log per topic together with a dedup
//! table and an independent cursor per durable name. It honours the same
//! contract as the Redis broker (dedup window, retention by age, nak with
//! redelivery delay, replay of in-flight entries on re-attach) and runs on
//! `tokio::time`, so tests can drive it under a paused clock.

use super::{Broker, BrokerError, Delivery, PublishOutcome, StartPosition, Subscription};
use crate::event::EventIdentity;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tracing::debug;

/// Default dedup window (matches the retention of the firehose stream)
pub const DEFAULT_DEDUP_WINDOW: Duration = Duration::from_secs(300);

/// Default retention by age
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(300);

struct StoredMessage {
    seq: u64,
    payload: Vec<u8>,
    identity: String,
    stored_at: Instant,
}

impl StoredMessage {
    fn to_delivery(&self) -> Delivery {
        Delivery {
            id: self.seq.to_string(),
            payload: self.payload.clone(),
            identity: Some(self.identity.clone()),
        }
    }
}

/// Per-durable state: next unseen sequence and the delivered-but-unacked
/// table. A pending value of `None` means in flight, `Some(t)` means nak'd
/// and due again at `t`.
struct Cursor {
    next_seq: u64,
    pending: BTreeMap<u64, Option<Instant>>,
}

struct TopicLog {
    messages: VecDeque<StoredMessage>,
    next_seq: u64,
    dedup: HashMap<String, Instant>,
    cursors: HashMap<String, Cursor>,
}

impl TopicLog {
    fn new() -> Self {
        Self {
            messages: VecDeque::new(),
            next_seq: 1,
            dedup: HashMap::new(),
            cursors: HashMap::new(),
        }
    }

    fn first_seq(&self) -> u64 {
        self.messages
            .front()
            .map(|m| m.seq)
            .unwrap_or(self.next_seq)
    }

    fn expire(&mut self, now: Instant, retention: Duration) {
        while let Some(front) = self.messages.front() {
            if front.stored_at + retention <= now {
                self.messages.pop_front();
            } else {
                break;
            }
        }
        self.dedup.retain(|_, expires_at| *expires_at > now);

        // Handed out but never settled, and now gone from the log
        let first = self.first_seq();
        for cursor in self.cursors.values_mut() {
            cursor.pending.retain(|seq, _| *seq >= first);
        }
    }
}

/// Sequences are contiguous inside the log, so lookup is an offset.
fn message_at(messages: &VecDeque<StoredMessage>, seq: u64) -> Option<&StoredMessage> {
    let first = messages.front()?.seq;
    if seq < first {
        return None;
    }
    messages.get((seq - first) as usize)
}

fn parse_seq(delivery: &Delivery) -> Result<u64, BrokerError> {
    delivery
        .id
        .parse()
        .map_err(|_| BrokerError::InvalidDelivery(delivery.id.clone()))
}

fn unknown_cursor(subscription: &Subscription) -> BrokerError {
    BrokerError::Command(format!(
        "no durable cursor '{}' on topic '{}'",
        subscription.durable_name, subscription.topic
    ))
}

/// In-process implementation of [`Broker`].
pub struct MemoryBroker {
    topics: Mutex<HashMap<String, TopicLog>>,
    notify: Notify,
    dedup_window: Duration,
    retention: Duration,
}

impl MemoryBroker {
    /// Create a broker with the default dedup window and retention
    pub fn new() -> Self {
        Self {
            topics: Mutex::new(HashMap::new()),
            notify: Notify::new(),
            dedup_window: DEFAULT_DEDUP_WINDOW,
            retention: DEFAULT_RETENTION,
        }
    }

    /// Set the dedup window
    pub fn with_dedup_window(mut self, window: Duration) -> Self {
        self.dedup_window = window;
        self
    }

    /// Set retention by age
    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    /// Number of messages currently stored on `topic`.
    pub async fn stored_count(&self, topic: &str) -> usize {
        let topics = self.topics.lock().await;
        topics.get(topic).map_or(0, |log| log.messages.len())
    }

    /// Payloads currently stored on `topic`, oldest first.
    pub async fn stored_payloads(&self, topic: &str) -> Vec<Vec<u8>> {
        let topics = self.topics.lock().await;
        topics.get(topic).map_or_else(Vec::new, |log| {
            log.messages.iter().map(|m| m.payload.clone()).collect()
        })
    }

    /// Number of delivered-but-unacknowledged entries for a durable cursor.
    pub async fn pending_count(&self, topic: &str, durable_name: &str) -> usize {
        let topics = self.topics.lock().await;
        topics
            .get(topic)
            .and_then(|log| log.cursors.get(durable_name))
            .map_or(0, |cursor| cursor.pending.len())
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    fn name(&self) -> &str {
        "memory"
    }

    async fn publish(
        &self,
        topic: &str,
        payload: &[u8],
        identity: &EventIdentity,
    ) -> Result<PublishOutcome, BrokerError> {
        let now = Instant::now();
        let seq = {
            let mut topics = self.topics.lock().await;
            let log = topics
                .entry(topic.to_string())
                .or_insert_with(TopicLog::new);
            log.expire(now, self.retention);

            if log.dedup.contains_key(identity.as_str()) {
                debug!(topic = %topic, identity = %identity, "Duplicate publish suppressed");
                return Ok(PublishOutcome::DuplicateSuppressed);
            }
            log.dedup
                .insert(identity.as_str().to_string(), now + self.dedup_window);

            let seq = log.next_seq;
            log.next_seq += 1;
            log.messages.push_back(StoredMessage {
                seq,
                payload: payload.to_vec(),
                identity: identity.as_str().to_string(),
                stored_at: now,
            });
            seq
        };

        self.notify.notify_waiters();
        Ok(PublishOutcome::Accepted {
            id: seq.to_string(),
        })
    }

    async fn pull_subscribe(
        &self,
        topic: &str,
        durable_name: &str,
        start: StartPosition,
    ) -> Result<Subscription, BrokerError> {
        let now = Instant::now();
        let mut topics = self.topics.lock().await;
        let log = topics
            .entry(topic.to_string())
            .or_insert_with(TopicLog::new);
        log.expire(now, self.retention);

        let start_seq = match start {
            StartPosition::Earliest => log.first_seq(),
            StartPosition::New => log.next_seq,
        };

        match log.cursors.get_mut(durable_name) {
            Some(cursor) => {
                // Re-attach: anything still in flight is due again now
                for due in cursor.pending.values_mut() {
                    if due.is_none() {
                        *due = Some(now);
                    }
                }
                debug!(topic = %topic, durable = %durable_name, "Re-attached durable cursor");
            }
            None => {
                log.cursors.insert(
                    durable_name.to_string(),
                    Cursor {
                        next_seq: start_seq,
                        pending: BTreeMap::new(),
                    },
                );
                debug!(topic = %topic, durable = %durable_name, start = ?start, "Created durable cursor");
            }
        }

        Ok(Subscription::new(topic, durable_name))
    }

    async fn fetch(
        &self,
        subscription: &Subscription,
        max_count: usize,
        max_wait: Duration,
    ) -> Result<Vec<Delivery>, BrokerError> {
        if max_count == 0 {
            return Ok(Vec::new());
        }
        let deadline = Instant::now() + max_wait;

        loop {
            // Register interest before inspecting state so a publish that
            // lands in between still wakes us.
            let notified = self.notify.notified();

            let wake_at = {
                let now = Instant::now();
                let mut topics = self.topics.lock().await;
                let log = topics
                    .get_mut(&subscription.topic)
                    .ok_or_else(|| unknown_cursor(subscription))?;
                log.expire(now, self.retention);

                let first = log.first_seq();
                let messages = &log.messages;
                let cursor = log
                    .cursors
                    .get_mut(&subscription.durable_name)
                    .ok_or_else(|| unknown_cursor(subscription))?;

                let mut batch = Vec::new();

                let due: Vec<u64> = cursor
                    .pending
                    .iter()
                    .filter(|(_, at)| matches!(at, Some(t) if *t <= now))
                    .map(|(seq, _)| *seq)
                    .collect();
                for seq in due {
                    if batch.len() >= max_count {
                        break;
                    }
                    match message_at(messages, seq) {
                        Some(message) => {
                            cursor.pending.insert(seq, None);
                            batch.push(message.to_delivery());
                        }
                        // Aged out of retention while waiting for redelivery
                        None => {
                            cursor.pending.remove(&seq);
                        }
                    }
                }

                if cursor.next_seq < first {
                    cursor.next_seq = first;
                }
                while batch.len() < max_count {
                    match message_at(messages, cursor.next_seq) {
                        Some(message) => {
                            cursor.pending.insert(message.seq, None);
                            batch.push(message.to_delivery());
                            cursor.next_seq += 1;
                        }
                        None => break,
                    }
                }

                if !batch.is_empty() {
                    return Ok(batch);
                }
                if now >= deadline {
                    return Ok(Vec::new());
                }

                cursor
                    .pending
                    .values()
                    .filter_map(|at| *at)
                    .min()
                    .map_or(deadline, |next_due| next_due.min(deadline))
            };

            let _ = tokio::time::timeout_at(wake_at, notified).await;
        }
    }

    async fn ack(
        &self,
        subscription: &Subscription,
        delivery: &Delivery,
    ) -> Result<(), BrokerError> {
        let seq = parse_seq(delivery)?;
        let mut topics = self.topics.lock().await;
        let cursor = topics
            .get_mut(&subscription.topic)
            .and_then(|log| log.cursors.get_mut(&subscription.durable_name))
            .ok_or_else(|| unknown_cursor(subscription))?;

        // Acking twice is harmless
        cursor.pending.remove(&seq);
        Ok(())
    }

    async fn nak(
        &self,
        subscription: &Subscription,
        delivery: &Delivery,
        delay: Duration,
    ) -> Result<(), BrokerError> {
        let seq = parse_seq(delivery)?;
        {
            let mut topics = self.topics.lock().await;
            let cursor = topics
                .get_mut(&subscription.topic)
                .and_then(|log| log.cursors.get_mut(&subscription.durable_name))
                .ok_or_else(|| unknown_cursor(subscription))?;

            if let Some(due) = cursor.pending.get_mut(&seq) {
                *due = Some(Instant::now() + delay);
            }
        }

        // Blocked fetches recompute their wake-up time
        self.notify.notify_waiters();
        Ok(())
    }
}
