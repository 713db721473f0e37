//! Redis Streams-backed queue (durable, manual acknowledgment).
//!
//! ## Layout
//!
//! - **Stream key**: the queue name (e.g. `booking_inserts`)
//! - **Consumer group**: `<queue>.consumers`, shared by every worker of every pod
//! - **Consumers**: one per worker channel (`<prefix>-<n>-<uuid>`)
//! - **Dead-letter stream**: `<queue>:dlq`
//!
//! ## Terminal actions
//!
//! | Action | Commands |
//! |--------|----------|
//! | ack | `XACK` |
//! | requeue | `MULTI; XADD <queue> (redelivery_count + 1); XACK; EXEC` |
//! | discard | `MULTI; XADD <queue>:dlq; XACK; EXEC` |
//!
//! Entries left pending by a consumer that died (or whose ack never reached Redis)
//! are claimed by live consumers with `XAUTOCLAIM` once idle for `pending_timeout`.
//! Consumers of earlier runs are removed by [`RedisStreamsQueue::prune_idle_consumers`]
//! once they own no pending entries and have been idle that long.
//! A channel is not re-established after its connection drops mid-batch: settle calls
//! fail, get logged, and the entries are reclaimed later.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use redis::Value;
use redis::aio::MultiplexedConnection;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, mpsc};
use tracing::{debug, error, info, warn};

use super::delivery::{
    Acknowledger, Broker, Delivery, DeliveryChannel, QueueError, Settlement,
};

/// Default blocking timeout for `XREADGROUP`.
const DEFAULT_BLOCK_MS: u64 = 1000;

/// Entries pending longer than this are claimed from their (presumed dead) consumer.
const DEFAULT_PENDING_TIMEOUT_MS: u64 = 60000; // 60 seconds

/// Pause after a failed read before polling again.
const READ_ERROR_BACKOFF: Duration = Duration::from_millis(500);

/// `XGROUP DELCONSUMER`, but only for a consumer with nothing pending.
const DELETE_IF_IDLE_SCRIPT: &str = r#"
if #redis.call('XPENDING', KEYS[1], ARGV[1], '-', '+', 1, ARGV[2]) > 0 then
    return -1
end
return redis.call('XGROUP', 'DELCONSUMER', KEYS[1], ARGV[1], ARGV[2])
"#;

const PAYLOAD_FIELD: &str = "payload";
const REDELIVERY_FIELD: &str = "redelivery_count";

#[derive(Debug, Clone)]
pub struct RedisStreamsQueue {
    client: Arc<redis::Client>,
    stream_key: String,
    group_name: String,
    dlq_key: String,
    block_ms: u64,
    pending_timeout_ms: u64,
}

impl RedisStreamsQueue {
    /// Create a queue handle.
    ///
    /// # Arguments
    ///
    /// * `redis_url` - Redis connection URL (e.g., "redis://localhost:6379")
    /// * `queue_name` - stream key; the group and dead-letter keys derive from it
    pub fn new(redis_url: impl AsRef<str>, queue_name: &str) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| QueueError::Connection(e.to_string()))?;

        Ok(Self {
            client: Arc::new(client),
            stream_key: queue_name.to_string(),
            group_name: format!("{queue_name}.consumers"),
            dlq_key: format!("{queue_name}:dlq"),
            block_ms: DEFAULT_BLOCK_MS,
            pending_timeout_ms: DEFAULT_PENDING_TIMEOUT_MS,
        })
    }

    pub fn with_pending_timeout(mut self, timeout: Duration) -> Self {
        self.pending_timeout_ms = timeout.as_millis() as u64;
        self
    }

    async fn connect(&self) -> Result<MultiplexedConnection, QueueError> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| QueueError::Connection(e.to_string()))
    }

    /// Ensure the consumer group exists (idempotent).
    pub async fn ensure_consumer_group(&self) -> Result<(), QueueError> {
        let mut conn = self.connect().await?;

        // MKSTREAM creates the stream if needed; "0" starts the group at the beginning.
        let created: redis::RedisResult<Value> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(&self.stream_key)
            .arg(&self.group_name)
            .arg("0")
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;

        match created {
            Ok(_) => Ok(()),
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
            Err(e) => Err(QueueError::Command(format!("XGROUP CREATE failed: {e}"))),
        }
    }

    /// Remove group consumers that own no pending entries and have been idle for at
    /// least the pending timeout. Returns how many were deleted.
    pub async fn prune_idle_consumers(&self) -> Result<usize, QueueError> {
        let mut conn = self.connect().await?;
        let reply: Value = redis::cmd("XINFO")
            .arg("CONSUMERS")
            .arg(&self.stream_key)
            .arg(&self.group_name)
            .query_async(&mut conn)
            .await
            .map_err(|e| QueueError::Command(format!("XINFO CONSUMERS failed: {e}")))?;

        let mut removed = 0;
        for info in parse_consumers(reply) {
            if info.pending > 0 || info.idle_ms < self.pending_timeout_ms {
                continue;
            }
            let result: i64 = self
                .delete_if_idle_cmd(&info.name)
                .query_async(&mut conn)
                .await
                .map_err(|e| QueueError::Command(format!("XGROUP DELCONSUMER failed: {e}")))?;
            if result >= 0 {
                debug!(consumer = %info.name, idle_ms = info.idle_ms, "removed idle consumer");
                removed += 1;
            }
        }
        if removed > 0 {
            info!(group = %self.group_name, removed, "pruned idle stream consumers");
        }
        Ok(removed)
    }

    fn delete_if_idle_cmd(&self, consumer: &str) -> redis::Cmd {
        let mut cmd = redis::cmd("EVAL");
        cmd.arg(DELETE_IF_IDLE_SCRIPT)
            .arg(1)
            .arg(&self.stream_key)
            .arg(&self.group_name)
            .arg(consumer);
        cmd
    }

    /// Append a payload to the queue.
    pub async fn publish(&self, payload: &[u8]) -> Result<String, QueueError> {
        let mut conn = self.connect().await?;
        redis::cmd("XADD")
            .arg(&self.stream_key)
            .arg("*")
            .arg(PAYLOAD_FIELD)
            .arg(payload)
            .arg(REDELIVERY_FIELD)
            .arg(0u32)
            .query_async(&mut conn)
            .await
            .map_err(|e| QueueError::Command(format!("XADD failed: {e}")))
    }

    /// Claim entries idle past the pending timeout.
    async fn claim_stale(
        &self,
        conn: &mut MultiplexedConnection,
        consumer: &str,
        count: usize,
    ) -> Result<Vec<StreamEntry>, QueueError> {
        let reply: Value = redis::cmd("XAUTOCLAIM")
            .arg(&self.stream_key)
            .arg(&self.group_name)
            .arg(consumer)
            .arg(self.pending_timeout_ms)
            .arg("0-0")
            .arg("COUNT")
            .arg(count)
            .query_async(conn)
            .await
            .map_err(|e| QueueError::Command(format!("XAUTOCLAIM failed: {e}")))?;

        // Reply: [next_start_id, [entries...], (deleted ids)]
        match reply {
            Value::Bulk(parts) => match parts.into_iter().nth(1) {
                Some(Value::Bulk(entries)) => Ok(parse_entries(entries)),
                _ => Ok(Vec::new()),
            },
            _ => Ok(Vec::new()),
        }
    }

    /// Read new entries for this consumer (blocking up to `block_ms`).
    async fn read_new(
        &self,
        conn: &mut MultiplexedConnection,
        consumer: &str,
        count: usize,
    ) -> Result<Vec<StreamEntry>, QueueError> {
        let reply: Value = redis::cmd("XREADGROUP")
            .arg("GROUP")
            .arg(&self.group_name)
            .arg(consumer)
            .arg("COUNT")
            .arg(count)
            .arg("BLOCK")
            .arg(self.block_ms)
            .arg("STREAMS")
            .arg(&self.stream_key)
            .arg(">")
            .query_async(conn)
            .await
            .map_err(|e| QueueError::Command(format!("XREADGROUP failed: {e}")))?;

        // Reply: nil on timeout, else [[stream_key, [entries...]]]
        let Value::Bulk(streams) = reply else {
            return Ok(Vec::new());
        };

        let mut out = Vec::new();
        for stream in streams {
            if let Value::Bulk(mut pair) = stream {
                if pair.len() == 2 {
                    if let Value::Bulk(entries) = pair.remove(1) {
                        out.extend(parse_entries(entries));
                    }
                }
            }
        }
        Ok(out)
    }
}

/// Entry read from the stream.
#[derive(Debug, Clone, PartialEq, Eq)]
struct StreamEntry {
    id: String,
    payload: Vec<u8>,
    redelivery_count: u32,
}

fn parse_entries(entries: Vec<Value>) -> Vec<StreamEntry> {
    entries
        .into_iter()
        .filter_map(|entry| match parse_stream_entry(entry) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!(error = %e, "skipping unreadable stream entry");
                None
            }
        })
        .collect()
}

/// Parse one `[id, [field, value, ...]]` entry.
///
/// Entries deleted while pending come back with a nil field list; those yield `None`.
fn parse_stream_entry(entry: Value) -> Result<Option<StreamEntry>, QueueError> {
    let Value::Bulk(mut parts) = entry else {
        return Err(QueueError::Command("invalid entry format".to_string()));
    };
    if parts.len() < 2 {
        return Err(QueueError::Command("entry too short".to_string()));
    }

    let fields = parts.remove(1);
    let id = match parts.remove(0) {
        Value::Data(data) => String::from_utf8_lossy(&data).to_string(),
        Value::Status(s) => s,
        _ => return Err(QueueError::Command("invalid entry id".to_string())),
    };

    let fields = match fields {
        Value::Bulk(fields) => fields,
        Value::Nil => return Ok(None),
        _ => return Err(QueueError::Command(format!("invalid fields for {id}"))),
    };

    let mut payload = None;
    let mut redelivery_count = 0;
    for chunk in fields.chunks(2) {
        if let [Value::Data(key), Value::Data(value)] = chunk {
            match key.as_slice() {
                k if k == PAYLOAD_FIELD.as_bytes() => payload = Some(value.clone()),
                k if k == REDELIVERY_FIELD.as_bytes() => {
                    redelivery_count = String::from_utf8_lossy(value).parse().unwrap_or(0);
                }
                _ => {}
            }
        }
    }

    // A missing payload field still reaches the worker, which discards it as malformed.
    Ok(Some(StreamEntry {
        id,
        payload: payload.unwrap_or_default(),
        redelivery_count,
    }))
}

/// One row of `XINFO CONSUMERS`.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ConsumerInfo {
    name: String,
    pending: u64,
    idle_ms: u64,
}

/// Parse `[[name, n, pending, p, idle, i, ...], ...]`; rows without a name are skipped.
fn parse_consumers(reply: Value) -> Vec<ConsumerInfo> {
    let Value::Bulk(rows) = reply else {
        return Vec::new();
    };

    rows.into_iter()
        .filter_map(|row| {
            let Value::Bulk(fields) = row else {
                return None;
            };
            let mut name = None;
            let mut pending = 0;
            let mut idle_ms = 0;
            for chunk in fields.chunks(2) {
                let [Value::Data(key), value] = chunk else {
                    continue;
                };
                match (key.as_slice(), value) {
                    (b"name", Value::Data(v)) => name = Some(String::from_utf8_lossy(v).to_string()),
                    (b"pending", Value::Int(n)) => pending = (*n).max(0) as u64,
                    (b"idle", Value::Int(n)) => idle_ms = (*n).max(0) as u64,
                    _ => {}
                }
            }
            name.map(|name| ConsumerInfo {
                name,
                pending,
                idle_ms,
            })
        })
        .collect()
}

/// Applies terminal actions for one channel over its own connection.
struct RedisAcknowledger {
    conn: MultiplexedConnection,
    stream_key: String,
    group_name: String,
    dlq_key: String,
}

impl std::fmt::Debug for RedisAcknowledger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisAcknowledger")
            .field("stream_key", &self.stream_key)
            .field("group_name", &self.group_name)
            .finish()
    }
}

#[async_trait]
impl Acknowledger for RedisAcknowledger {
    async fn settle(&self, delivery: &Delivery, settlement: Settlement) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        pipe.atomic();

        match settlement {
            Settlement::Ack => {}
            Settlement::Requeue => {
                pipe.cmd("XADD")
                    .arg(&self.stream_key)
                    .arg("*")
                    .arg(PAYLOAD_FIELD)
                    .arg(delivery.payload())
                    .arg(REDELIVERY_FIELD)
                    .arg(delivery.redelivery_count() + 1)
                    .ignore();
            }
            Settlement::Discard(reason) => {
                pipe.cmd("XADD")
                    .arg(&self.dlq_key)
                    .arg("*")
                    .arg("original_message_id")
                    .arg(delivery.tag())
                    .arg("reason")
                    .arg(reason.as_str())
                    .arg(REDELIVERY_FIELD)
                    .arg(delivery.redelivery_count())
                    .arg("failed_at")
                    .arg(chrono::Utc::now().to_rfc3339())
                    .arg(PAYLOAD_FIELD)
                    .arg(delivery.payload())
                    .ignore();
            }
        }

        pipe.cmd("XACK")
            .arg(&self.stream_key)
            .arg(&self.group_name)
            .arg(delivery.tag())
            .ignore();

        pipe.query_async::<_, ()>(&mut conn)
            .await
            .map_err(|e| QueueError::Command(format!("settle {settlement:?} failed: {e}")))
    }
}

/// Background poller: reads up to the free prefetch slots and forwards entries.
async fn poll(
    queue: RedisStreamsQueue,
    mut conn: MultiplexedConnection,
    consumer: String,
    acker: Arc<dyn Acknowledger>,
    tx: mpsc::Sender<Delivery>,
    prefetch: Arc<Semaphore>,
    max_prefetch: usize,
) {
    loop {
        let first = tokio::select! {
            permit = Arc::clone(&prefetch).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => return,
            },
            _ = tx.closed() => return,
        };
        let mut permits: Vec<OwnedSemaphorePermit> = vec![first];
        while permits.len() < max_prefetch {
            match Arc::clone(&prefetch).try_acquire_owned() {
                Ok(permit) => permits.push(permit),
                Err(_) => break,
            }
        }

        let entries = match queue.claim_stale(&mut conn, &consumer, permits.len()).await {
            Ok(stale) if !stale.is_empty() => {
                warn!(consumer = %consumer, count = stale.len(), "claimed stale pending entries");
                Ok(stale)
            }
            Ok(_) => queue.read_new(&mut conn, &consumer, permits.len()).await,
            Err(e) => Err(e),
        };

        let entries = match entries {
            Ok(entries) => entries,
            Err(e) => {
                error!(consumer = %consumer, error = %e, "failed to read from stream");
                drop(permits);
                tokio::time::sleep(READ_ERROR_BACKOFF).await;
                continue;
            }
        };

        for entry in entries {
            let Some(permit) = permits.pop() else {
                break;
            };
            let delivery = Delivery::new(
                entry.id,
                entry.payload,
                entry.redelivery_count,
                Arc::clone(&acker),
            )
            .with_permit(permit);

            if tx.send(delivery).await.is_err() {
                debug!(consumer = %consumer, "channel receiver dropped; stopping poller");
                return;
            }
        }
    }
}

#[async_trait]
impl Broker for RedisStreamsQueue {
    async fn open_channel(
        &self,
        consumer: &str,
        prefetch: usize,
    ) -> Result<DeliveryChannel, QueueError> {
        // Separate connections: a blocking XREADGROUP must not stall acks.
        let read_conn = self.connect().await?;
        let ack_conn = self.connect().await?;
        self.ensure_consumer_group().await?;

        let acker: Arc<dyn Acknowledger> = Arc::new(RedisAcknowledger {
            conn: ack_conn,
            stream_key: self.stream_key.clone(),
            group_name: self.group_name.clone(),
            dlq_key: self.dlq_key.clone(),
        });

        let prefetch = prefetch.max(1);
        let (tx, rx) = mpsc::channel(prefetch);
        let poller = tokio::spawn(poll(
            self.clone(),
            read_conn,
            consumer.to_string(),
            acker,
            tx,
            Arc::new(Semaphore::new(prefetch)),
            prefetch,
        ));

        debug!(
            consumer,
            prefetch,
            stream_key = %self.stream_key,
            group = %self.group_name,
            "opened stream channel"
        );
        Ok(DeliveryChannel::with_feeder(rx, poller))
    }
}
