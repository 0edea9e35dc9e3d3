//! Redis Streams broker.
//!
//! # Layout
//!
//! ```text
//! <topic>                     stream of {data, msg_id}
//! <topic>:dedup:<identity>    SET NX PX <dedup window>
//! <topic>:nak:<durable>       ZSET of nak'd ids scored by ready-at (ms)
//! ```
//!
//! Every durable name is its own consumer group, which gives each cursor
//! an independent position and pending list (broadcast fan-out). Inside
//! the group the durable name is also the consumer name.
//!
//! Publish is a single Lua script so the dedup marker and the `XADD`
//! commit together. Retention is age based through `XADD MINID ~`.
//!
//! Fetches run on their own pool. A blocking `XREADGROUP` holds its
//! connection for the whole wait, and must never hold up publish, ack or
//! nak traffic on the command pool.
//!
//! Requires Redis 6.2 or newer.

use super::{Broker, BrokerError, Delivery, PublishOutcome, StartPosition, Subscription};
use crate::event::EventIdentity;
use async_trait::async_trait;
use deadpool_redis::redis::streams::{
    StreamClaimReply, StreamId, StreamReadOptions, StreamReadReply,
};
use deadpool_redis::redis::{cmd, AsyncCommands, RedisError, Script, Value as RedisValue};
use deadpool_redis::{Config, Connection, Pool, PoolConfig, PoolError, Runtime};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

/// Field holding the raw event bytes
const DATA_FIELD: &str = "data";

/// Field holding the idempotency key
const MSG_ID_FIELD: &str = "msg_id";

/// KEYS[1] stream, KEYS[2] dedup key
/// ARGV[1] payload, ARGV[2] identity, ARGV[3] dedup window ms, ARGV[4] retention ms
const PUBLISH_SCRIPT: &str = r#"
if not redis.call('SET', KEYS[2], '1', 'NX', 'PX', ARGV[3]) then
  return false
end
local t = redis.call('TIME')
local now_ms = tonumber(t[1]) * 1000 + math.floor(tonumber(t[2]) / 1000)
local min_id = now_ms - tonumber(ARGV[4])
if min_id < 0 then min_id = 0 end
return redis.call('XADD', KEYS[1], 'MINID', '~', min_id, '*', 'data', ARGV[1], 'msg_id', ARGV[2])
"#;

fn command_error(e: RedisError) -> BrokerError {
    if e.is_timeout() {
        BrokerError::Timeout
    } else {
        BrokerError::Command(e.to_string())
    }
}

fn pool_error(e: PoolError) -> BrokerError {
    match e {
        PoolError::Timeout(_) => BrokerError::Timeout,
        other => BrokerError::Connection(other.to_string()),
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

fn nak_key(subscription: &Subscription) -> String {
    format!("{}:nak:{}", subscription.topic, subscription.durable_name)
}

fn dedup_key(topic: &str, identity: &EventIdentity) -> String {
    format!("{}:dedup:{}", topic, identity)
}

/// Extract raw bytes from a stream field.
fn field_bytes(entry: &StreamId, key: &str) -> Option<Vec<u8>> {
    match entry.map.get(key)? {
        RedisValue::BulkString(bytes) => Some(bytes.clone()),
        RedisValue::SimpleString(s) => Some(s.clone().into_bytes()),
        _ => None,
    }
}

/// Convert a stream entry into a delivery.
///
/// Entries whose body was trimmed away come back with an empty field map;
/// those yield `None`.
fn to_delivery(entry: &StreamId) -> Option<Delivery> {
    let payload = field_bytes(entry, DATA_FIELD)?;
    let identity =
        field_bytes(entry, MSG_ID_FIELD).map(|b| String::from_utf8_lossy(&b).into_owned());
    Some(Delivery {
        id: entry.id.clone(),
        payload,
        identity,
    })
}

/// Split entries into deliveries and the ids of entries whose body was
/// trimmed away.
fn split_trimmed<'a, I>(entries: I) -> (Vec<Delivery>, Vec<String>)
where
    I: IntoIterator<Item = &'a StreamId>,
{
    let mut deliveries = Vec::new();
    let mut trimmed = Vec::new();
    for entry in entries {
        match to_delivery(entry) {
            Some(delivery) => deliveries.push(delivery),
            None => trimmed.push(entry.id.clone()),
        }
    }
    (deliveries, trimmed)
}

/// Pending entries to replay on recovery.
///
/// Ids with a nak schedule are left to [`ClaimPlan`] so they wait out
/// their redelivery delay.
fn recoverable(
    entries: &[StreamId],
    scheduled: &HashSet<String>,
) -> (Vec<Delivery>, Vec<String>) {
    split_trimmed(entries.iter().filter(|e| !scheduled.contains(&e.id)))
}

/// What to do after `XCLAIM` answered for a set of due ids.
#[derive(Debug)]
struct ClaimPlan {
    deliveries: Vec<Delivery>,
    /// Claimed but trimmed; acked so they leave the pending list
    trimmed: Vec<String>,
    /// Every due id leaves the schedule: claimed ones are in flight again,
    /// unclaimed ones are no longer pending at all
    unschedule: Vec<String>,
}

impl ClaimPlan {
    fn new(due: Vec<String>, claimed: &[StreamId]) -> Self {
        let (deliveries, trimmed) = split_trimmed(claimed);
        Self {
            deliveries,
            trimmed,
            unschedule: due,
        }
    }
}

/// Pool sizing for [`RedisBroker::connect`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RedisPools {
    /// Publish, ack, nak, ping and checkpoint traffic
    pub command_size: usize,
    /// Fetches, each of which may block for its whole wait
    pub read_size: usize,
    /// How long a caller waits for a free connection
    pub wait_timeout: Duration,
}

impl Default for RedisPools {
    fn default() -> Self {
        Self {
            command_size: 16,
            read_size: 8,
            wait_timeout: Duration::from_secs(2),
        }
    }
}

fn pool_config(max_size: usize, wait_timeout: Duration) -> PoolConfig {
    let mut config = PoolConfig::new(max_size.max(1));
    config.timeouts.wait = Some(wait_timeout);
    config.timeouts.create = Some(wait_timeout);
    config
}

fn create_pool(
    redis_url: &str,
    max_size: usize,
    wait_timeout: Duration,
) -> Result<Pool, BrokerError> {
    let mut cfg = Config::from_url(redis_url);
    cfg.pool = Some(pool_config(max_size, wait_timeout));
    cfg.create_pool(Some(Runtime::Tokio1))
        .map_err(|e| BrokerError::Connection(e.to_string()))
}

/// Redis Streams implementation of [`Broker`].
#[derive(Clone)]
pub struct RedisBroker {
    pool: Pool,
    read_pool: Pool,
    publish_script: Arc<Script>,
    dedup_window: Duration,
    retention: Duration,
}

impl RedisBroker {
    /// Create a broker with a command pool and a read pool for `redis_url`.
    pub fn connect(
        redis_url: &str,
        pools: RedisPools,
        dedup_window: Duration,
        retention: Duration,
    ) -> Result<Self, BrokerError> {
        let pool = create_pool(redis_url, pools.command_size, pools.wait_timeout)?;
        let read_pool = create_pool(redis_url, pools.read_size, pools.wait_timeout)?;
        info!(
            command_pool = pools.command_size,
            read_pool = pools.read_size,
            wait_timeout_ms = pools.wait_timeout.as_millis() as u64,
            "Created Redis connection pools"
        );

        Ok(Self {
            pool,
            read_pool,
            publish_script: Arc::new(Script::new(PUBLISH_SCRIPT)),
            dedup_window,
            retention,
        })
    }

    /// Access the command pool (shared with the checkpoint store)
    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    async fn conn(&self) -> Result<Connection, BrokerError> {
        self.pool.get().await.map_err(pool_error)
    }

    async fn read_conn(&self) -> Result<Connection, BrokerError> {
        self.read_pool.get().await.map_err(pool_error)
    }

    /// Claim nak'd entries whose redelivery time has passed.
    ///
    /// The schedule is only cleared once `XCLAIM` succeeded, so a failed
    /// claim leaves the ids due for the next fetch.
    async fn claim_due(
        &self,
        conn: &mut Connection,
        subscription: &Subscription,
        max_count: usize,
    ) -> Result<Vec<Delivery>, BrokerError> {
        let key = nak_key(subscription);
        let due: Vec<String> = conn
            .zrangebyscore_limit(&key, "-inf", now_millis(), 0, max_count as isize)
            .await
            .map_err(command_error)?;
        if due.is_empty() {
            return Ok(Vec::new());
        }

        let claimed: StreamClaimReply = conn
            .xclaim(
                &subscription.topic,
                &subscription.durable_name,
                &subscription.durable_name,
                0,
                &due[..],
            )
            .await
            .map_err(command_error)?;
        let plan = ClaimPlan::new(due, &claimed.ids);

        if !plan.trimmed.is_empty() {
            let acked: Result<(), RedisError> = conn
                .xack(&subscription.topic, &subscription.durable_name, &plan.trimmed[..])
                .await;
            if let Err(e) = acked {
                warn!(durable = %subscription.durable_name, error = %e, "Failed to ack trimmed entries");
            }
        }

        let cleared: Result<(), RedisError> = conn.zrem(&key, &plan.unschedule[..]).await;
        if let Err(e) = cleared {
            // Claimed entries are already back in flight; a stale schedule
            // only causes an extra claim later
            warn!(durable = %subscription.durable_name, error = %e, "Failed to clear nak schedule");
        }

        debug!(
            durable = %subscription.durable_name,
            due = plan.unschedule.len(),
            claimed = plan.deliveries.len(),
            trimmed = plan.trimmed.len(),
            "Claimed nak'd entries for redelivery"
        );

        Ok(plan.deliveries)
    }

    /// Read from the group with the given id (`>` for new, `0` for own pending).
    async fn read_group(
        &self,
        conn: &mut Connection,
        subscription: &Subscription,
        id: &str,
        max_count: usize,
        block: Option<Duration>,
    ) -> Result<Vec<StreamId>, BrokerError> {
        let mut opts = StreamReadOptions::default()
            .group(&subscription.durable_name, &subscription.durable_name)
            .count(max_count);
        if let Some(block) = block {
            // BLOCK 0 would wait forever
            opts = opts.block(block.as_millis().max(1) as usize);
        }

        let reply: Option<StreamReadReply> = conn
            .xread_options(&[subscription.topic.as_str()], &[id], &opts)
            .await
            .map_err(command_error)?;

        Ok(reply
            .map(|r| r.keys.into_iter().flat_map(|k| k.ids).collect())
            .unwrap_or_default())
    }

    /// Replay entries left pending by a previous process for this durable,
    /// one page per call until the pending list is exhausted.
    async fn recover_pending(
        &self,
        conn: &mut Connection,
        subscription: &Subscription,
        start: &str,
        max_count: usize,
    ) -> Result<Vec<Delivery>, BrokerError> {
        let entries = self
            .read_group(conn, subscription, start, max_count, None)
            .await?;

        let next = if entries.len() < max_count {
            None
        } else {
            entries.last().map(|e| e.id.clone())
        };
        subscription.advance_recovery(next);
        if entries.is_empty() {
            return Ok(Vec::new());
        }

        let scheduled: Vec<String> = conn
            .zrange(nak_key(subscription), 0, -1)
            .await
            .map_err(command_error)?;
        let scheduled: HashSet<String> = scheduled.into_iter().collect();
        let (batch, trimmed) = recoverable(&entries, &scheduled);

        if !trimmed.is_empty() {
            let _: () = conn
                .xack(&subscription.topic, &subscription.durable_name, &trimmed[..])
                .await
                .map_err(command_error)?;
        }

        if !batch.is_empty() {
            info!(
                durable = %subscription.durable_name,
                count = batch.len(),
                "Replaying entries pending from a previous run"
            );
        }
        Ok(batch)
    }
}

#[async_trait]
impl Broker for RedisBroker {
    fn name(&self) -> &str {
        "redis"
    }

    async fn publish(
        &self,
        topic: &str,
        payload: &[u8],
        identity: &EventIdentity,
    ) -> Result<PublishOutcome, BrokerError> {
        let mut conn = self.conn().await?;

        let id: Option<String> = self
            .publish_script
            .key(topic)
            .key(dedup_key(topic, identity))
            .arg(payload)
            .arg(identity.as_str())
            .arg(self.dedup_window.as_millis() as u64)
            .arg(self.retention.as_millis() as u64)
            .invoke_async(&mut conn)
            .await
            .map_err(command_error)?;

        Ok(match id {
            Some(id) => PublishOutcome::Accepted { id },
            None => PublishOutcome::DuplicateSuppressed,
        })
    }

    async fn pull_subscribe(
        &self,
        topic: &str,
        durable_name: &str,
        start: StartPosition,
    ) -> Result<Subscription, BrokerError> {
        let mut conn = self.conn().await?;

        let start_id = match start {
            StartPosition::Earliest => "0",
            StartPosition::New => "$",
        };

        let created: Result<(), RedisError> = cmd("XGROUP")
            .arg("CREATE")
            .arg(topic)
            .arg(durable_name)
            .arg(start_id)
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;

        match created {
            Ok(()) => info!(topic = %topic, durable = %durable_name, "Created durable cursor"),
            Err(e) if e.to_string().contains("BUSYGROUP") => {
                debug!(topic = %topic, durable = %durable_name, "Durable cursor already exists")
            }
            Err(e) => return Err(command_error(e)),
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
        let mut conn = self.read_conn().await?;

        if let Some(start) = subscription.recovery_start() {
            let recovered = self
                .recover_pending(&mut conn, subscription, &start, max_count)
                .await?;
            if !recovered.is_empty() {
                return Ok(recovered);
            }
        }

        let mut batch = self.claim_due(&mut conn, subscription, max_count).await?;
        let remaining = max_count - batch.len().min(max_count);
        if remaining == 0 {
            return Ok(batch);
        }

        // Only block when there is nothing to hand back yet
        let block = if batch.is_empty() && !max_wait.is_zero() {
            Some(max_wait)
        } else {
            None
        };
        let entries = self
            .read_group(&mut conn, subscription, ">", remaining, block)
            .await?;
        batch.extend(entries.iter().filter_map(to_delivery));

        Ok(batch)
    }

    async fn ack(
        &self,
        subscription: &Subscription,
        delivery: &Delivery,
    ) -> Result<(), BrokerError> {
        let mut conn = self.conn().await?;
        let _: () = conn
            .xack(
                &subscription.topic,
                &subscription.durable_name,
                &[&delivery.id],
            )
            .await
            .map_err(command_error)?;

        // Drop any stale redelivery schedule for the same id
        let cleared: Result<(), RedisError> = conn.zrem(nak_key(subscription), &delivery.id).await;
        if let Err(e) = cleared {
            warn!(id = %delivery.id, error = %e, "Failed to clear nak schedule after ack");
        }
        Ok(())
    }

    async fn nak(
        &self,
        subscription: &Subscription,
        delivery: &Delivery,
        delay: Duration,
    ) -> Result<(), BrokerError> {
        let mut conn = self.conn().await?;
        let ready_at = now_millis() + delay.as_millis() as u64;
        let _: () = conn
            .zadd(nak_key(subscription), &delivery.id, ready_at)
            .await
            .map_err(command_error)?;
        Ok(())
    }

    async fn ping(&self) -> Result<(), BrokerError> {
        let mut conn = self.conn().await?;
        let _: String = cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(command_error)?;
        Ok(())
    }
}
