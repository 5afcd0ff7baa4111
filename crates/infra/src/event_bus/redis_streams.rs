//! Redis Streams-backed message bus (durable, at-least-once delivery).
//!
//! - **Durable delivery**: entries persist until acknowledged
//! - **Consumer groups**: one group per orchestrator deployment, competing consumers inside it
//! - **Redelivery**: negatively acknowledged entries stay pending and are re-claimed
//!   by the same consumer once their backoff expires; entries left pending by a dead
//!   consumer are claimed after `pending_timeout`
//! - **Dead-letter handling**: dead-lettered entries are copied to `waypoint:<type>:dlq`
//!   with reason, attempt and timestamp, then acknowledged
//!
//! ## Layout
//!
//! - **Stream key**: `waypoint:<message type>` (one stream per message type)
//! - **Entry fields**: `message_id`, `correlation_id`, `payload` (the JSON envelope)

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::streams::{StreamClaimReply, StreamId, StreamPendingCountReply, StreamReadReply};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, instrument, warn};

use waypoint_events::{BusError, Delivery, MessageBus, MessageEnvelope, MessagePublisher, Subscription};

use super::{dlq_key, stream_key};

/// Default pending entry timeout (entries idle longer than this are reclaimed).
const DEFAULT_PENDING_TIMEOUT: Duration = Duration::from_secs(60);

/// How many stale entries to inspect per poll.
const CLAIM_BATCH: usize = 10;

#[derive(Debug, thiserror::Error)]
pub enum RedisStreamsError {
    #[error("Redis connection error: {0}")]
    Connection(String),

    #[error("Redis command error: {0}")]
    Command(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Consumer group error: {0}")]
    ConsumerGroup(String),

    #[error("Malformed entry {entry_id}: {message}")]
    MalformedEntry { entry_id: String, message: String },
}

impl From<RedisStreamsError> for BusError {
    fn from(err: RedisStreamsError) -> Self {
        match err {
            RedisStreamsError::Connection(m) => BusError::Connection(m),
            RedisStreamsError::Serialization(m) => BusError::Serialization(m),
            err @ RedisStreamsError::MalformedEntry { .. } => BusError::Serialization(err.to_string()),
            RedisStreamsError::Command(m) | RedisStreamsError::ConsumerGroup(m) => {
                BusError::Command(m)
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct RedisStreamsMessageBus {
    client: Arc<redis::Client>,
    publisher: Arc<Mutex<Option<MultiplexedConnection>>>,
    pending_timeout: Duration,
}

impl RedisStreamsMessageBus {
    /// Create a new Redis Streams message bus.
    ///
    /// * `redis_url` - Redis connection URL (e.g., "redis://localhost:6379")
    pub fn new(redis_url: impl AsRef<str>) -> Result<Self, RedisStreamsError> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| RedisStreamsError::Connection(e.to_string()))?;

        Ok(Self {
            client: Arc::new(client),
            publisher: Arc::new(Mutex::new(None)),
            pending_timeout: DEFAULT_PENDING_TIMEOUT,
        })
    }

    pub fn with_pending_timeout(mut self, pending_timeout: Duration) -> Self {
        self.pending_timeout = pending_timeout;
        self
    }

    async fn connect(&self) -> Result<MultiplexedConnection, RedisStreamsError> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| RedisStreamsError::Connection(e.to_string()))
    }

    /// Shared publishing connection, opened lazily.
    async fn publisher_connection(&self) -> Result<MultiplexedConnection, RedisStreamsError> {
        let mut guard = self.publisher.lock().await;
        if let Some(conn) = guard.as_ref() {
            return Ok(conn.clone());
        }
        let conn = self.connect().await?;
        *guard = Some(conn.clone());
        Ok(conn)
    }

    /// Ensure a consumer group exists (idempotent).
    ///
    /// A new group starts at the beginning of the stream.
    pub async fn ensure_consumer_group(
        &self,
        conn: &mut MultiplexedConnection,
        stream_key: &str,
        group: &str,
    ) -> Result<(), RedisStreamsError> {
        let created: redis::RedisResult<String> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(stream_key)
            .arg(group)
            .arg("0")
            .arg("MKSTREAM")
            .query_async(conn)
            .await;

        match created {
            Ok(_) => Ok(()),
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
            Err(e) => Err(RedisStreamsError::ConsumerGroup(format!(
                "XGROUP CREATE {stream_key} {group} failed: {e}"
            ))),
        }
    }

    #[instrument(
        skip(self, envelope),
        fields(
            stream_key = %stream_key(envelope.message_type()),
            message_id = %envelope.message_id(),
            correlation_id = %envelope.correlation_id()
        ),
        err
    )]
    async fn publish_envelope(&self, envelope: &MessageEnvelope) -> Result<(), RedisStreamsError> {
        let payload = serde_json::to_string(envelope)
            .map_err(|e| RedisStreamsError::Serialization(e.to_string()))?;
        let mut conn = self.publisher_connection().await?;

        let _: String = redis::cmd("XADD")
            .arg(stream_key(envelope.message_type()))
            .arg("*")
            .arg("message_id")
            .arg(envelope.message_id().to_string())
            .arg("correlation_id")
            .arg(envelope.correlation_id().to_string())
            .arg("payload")
            .arg(&payload)
            .query_async(&mut conn)
            .await
            .map_err(|e| RedisStreamsError::Command(format!("XADD failed: {}", e)))?;

        Ok(())
    }
}

#[async_trait]
impl MessagePublisher for RedisStreamsMessageBus {
    async fn publish(&self, envelope: MessageEnvelope) -> Result<(), BusError> {
        Ok(self.publish_envelope(&envelope).await?)
    }
}

#[async_trait]
impl MessageBus for RedisStreamsMessageBus {
    async fn subscribe(
        &self,
        message_type: &str,
        group: &str,
        consumer: &str,
    ) -> Result<Box<dyn Subscription>, BusError> {
        let stream_key = stream_key(message_type);
        let mut conn = self.connect().await?;
        self.ensure_consumer_group(&mut conn, &stream_key, group)
            .await?;

        Ok(Box::new(RedisStreamsSubscription {
            conn,
            message_type: message_type.to_string(),
            stream_key,
            dlq_key: dlq_key(message_type),
            group: group.to_string(),
            consumer: consumer.to_string(),
            pending_timeout: self.pending_timeout,
            scheduled: HashMap::new(),
        }))
    }
}

/// A negatively acknowledged entry waiting for its backoff to expire.
#[derive(Debug, Clone, Copy)]
struct Scheduled {
    due: Instant,
    attempt: u32,
}

/// Subscription that reads one stream through a consumer group.
///
/// Owns a dedicated connection so blocking reads do not stall publishers.
pub struct RedisStreamsSubscription {
    conn: MultiplexedConnection,
    message_type: String,
    stream_key: String,
    dlq_key: String,
    group: String,
    consumer: String,
    pending_timeout: Duration,
    scheduled: HashMap<String, Scheduled>,
}

impl RedisStreamsSubscription {
    /// Re-claim our own entry whose backoff expired.
    async fn take_due(&mut self) -> Result<Option<Delivery>, RedisStreamsError> {
        let now = Instant::now();
        let Some((entry_id, scheduled)) = self
            .scheduled
            .iter()
            .filter(|(_, s)| s.due <= now)
            .min_by_key(|(_, s)| s.due)
            .map(|(id, s)| (id.clone(), *s))
        else {
            return Ok(None);
        };
        self.scheduled.remove(&entry_id);

        let claimed: StreamClaimReply = redis::cmd("XCLAIM")
            .arg(&self.stream_key)
            .arg(&self.group)
            .arg(&self.consumer)
            .arg(0)
            .arg(&entry_id)
            .query_async(&mut self.conn)
            .await
            .map_err(|e| RedisStreamsError::Command(format!("XCLAIM failed: {}", e)))?;

        // The entry may have been claimed by another consumer or trimmed meanwhile.
        match claimed.ids.first() {
            Some(entry) => self.to_delivery(entry, scheduled.attempt).map(Some),
            None => Ok(None),
        }
    }

    /// Claim an entry another consumer left pending for longer than `pending_timeout`.
    async fn take_stale(&mut self) -> Result<Option<Delivery>, RedisStreamsError> {
        let min_idle_ms = self.pending_timeout.as_millis() as u64;

        let pending: StreamPendingCountReply = redis::cmd("XPENDING")
            .arg(&self.stream_key)
            .arg(&self.group)
            .arg("IDLE")
            .arg(min_idle_ms)
            .arg("-")
            .arg("+")
            .arg(CLAIM_BATCH)
            .query_async(&mut self.conn)
            .await
            .map_err(|e| RedisStreamsError::Command(format!("XPENDING failed: {}", e)))?;

        for candidate in pending.ids {
            if self.scheduled.contains_key(&candidate.id) {
                continue;
            }

            let claimed: StreamClaimReply = redis::cmd("XCLAIM")
                .arg(&self.stream_key)
                .arg(&self.group)
                .arg(&self.consumer)
                .arg(min_idle_ms)
                .arg(&candidate.id)
                .query_async(&mut self.conn)
                .await
                .map_err(|e| RedisStreamsError::Command(format!("XCLAIM failed: {}", e)))?;

            if let Some(entry) = claimed.ids.first() {
                let attempt = u32::try_from(candidate.times_delivered)
                    .unwrap_or(u32::MAX)
                    .saturating_add(1);
                debug!(
                    entry_id = %candidate.id,
                    previous_consumer = %candidate.consumer,
                    attempt,
                    "reclaimed stale pending entry"
                );
                return self.to_delivery(entry, attempt).map(Some);
            }
        }

        Ok(None)
    }

    async fn read_new(&mut self, block: Duration) -> Result<Option<Delivery>, RedisStreamsError> {
        let block_ms = block.as_millis().max(1) as u64;

        let reply: Option<StreamReadReply> = redis::cmd("XREADGROUP")
            .arg("GROUP")
            .arg(&self.group)
            .arg(&self.consumer)
            .arg("COUNT")
            .arg(1)
            .arg("BLOCK")
            .arg(block_ms)
            .arg("STREAMS")
            .arg(&self.stream_key)
            .arg(">")
            .query_async(&mut self.conn)
            .await
            .map_err(|e| RedisStreamsError::Command(format!("XREADGROUP failed: {}", e)))?;

        let entry = reply
            .and_then(|r| r.keys.into_iter().next())
            .and_then(|k| k.ids.into_iter().next());

        match entry {
            Some(entry) => self.to_delivery(&entry, 1).map(Some),
            None => Ok(None),
        }
    }

    fn to_delivery(&self, entry: &StreamId, attempt: u32) -> Result<Delivery, RedisStreamsError> {
        let payload: String =
            entry
                .get("payload")
                .ok_or_else(|| RedisStreamsError::MalformedEntry {
                    entry_id: entry.id.clone(),
                    message: "no payload field".to_string(),
                })?;

        let envelope: MessageEnvelope =
            serde_json::from_str(&payload).map_err(|e| RedisStreamsError::MalformedEntry {
                entry_id: entry.id.clone(),
                message: format!("not a message envelope: {e}"),
            })?;

        Ok(Delivery::new(entry.id.clone(), attempt, envelope))
    }

    async fn poll(&mut self, wait: Duration) -> Result<Option<Delivery>, RedisStreamsError> {
        if let Some(d) = self.take_due().await? {
            return Ok(Some(d));
        }
        if let Some(d) = self.take_stale().await? {
            return Ok(Some(d));
        }

        // Wake up in time for the earliest scheduled redelivery.
        let block = self
            .scheduled
            .values()
            .map(|s| s.due.saturating_duration_since(Instant::now()))
            .min()
            .map_or(wait, |until_due| until_due.min(wait));
        self.read_new(block).await
    }

    async fn xack(&mut self, entry_id: &str) -> Result<(), RedisStreamsError> {
        let _: u64 = redis::cmd("XACK")
            .arg(&self.stream_key)
            .arg(&self.group)
            .arg(entry_id)
            .query_async(&mut self.conn)
            .await
            .map_err(|e| RedisStreamsError::Command(format!("XACK failed: {}", e)))?;
        Ok(())
    }

    /// Park an undecodable entry on the DLQ by id (no envelope available).
    async fn dead_letter_raw(&mut self, entry_id: &str, reason: &str) -> Result<(), RedisStreamsError> {
        let _: String = redis::cmd("XADD")
            .arg(&self.dlq_key)
            .arg("*")
            .arg("original_entry_id")
            .arg(entry_id)
            .arg("group")
            .arg(&self.group)
            .arg("reason")
            .arg(reason)
            .arg("failed_at")
            .arg(chrono::Utc::now().to_rfc3339())
            .query_async(&mut self.conn)
            .await
            .map_err(|e| RedisStreamsError::Command(format!("DLQ XADD failed: {}", e)))?;
        self.xack(entry_id).await
    }
}

#[async_trait]
impl Subscription for RedisStreamsSubscription {
    async fn next(&mut self, wait: Duration) -> Result<Option<Delivery>, BusError> {
        match self.poll(wait).await {
            Ok(d) => Ok(d),
            Err(RedisStreamsError::MalformedEntry { entry_id, message }) => {
                // Entries that are not envelopes can never succeed.
                warn!(stream_key = %self.stream_key, %entry_id, %message, "dead-lettering malformed entry");
                self.scheduled.remove(&entry_id);
                self.dead_letter_raw(&entry_id, &message).await?;
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    #[instrument(skip(self, delivery), fields(stream_key = %self.stream_key, entry_id = %delivery.tag()), err)]
    async fn ack(&mut self, delivery: &Delivery) -> Result<(), BusError> {
        self.scheduled.remove(delivery.tag());
        Ok(self.xack(delivery.tag()).await?)
    }

    async fn nack(&mut self, delivery: &Delivery, redeliver_after: Duration) -> Result<(), BusError> {
        // Leave the entry pending; `next` re-claims it once due.
        self.scheduled.insert(
            delivery.tag().to_string(),
            Scheduled {
                due: Instant::now() + redeliver_after,
                attempt: delivery.attempt().saturating_add(1),
            },
        );
        Ok(())
    }

    #[instrument(
        skip(self, delivery),
        fields(stream_key = %self.stream_key, entry_id = %delivery.tag(), attempt = delivery.attempt()),
        err
    )]
    async fn dead_letter(&mut self, delivery: &Delivery, reason: &str) -> Result<(), BusError> {
        self.scheduled.remove(delivery.tag());

        let payload = serde_json::to_string(delivery.envelope())
            .map_err(|e| RedisStreamsError::Serialization(e.to_string()))?;

        let _: String = redis::cmd("XADD")
            .arg(&self.dlq_key)
            .arg("*")
            .arg("original_entry_id")
            .arg(delivery.tag())
            .arg("message_type")
            .arg(&self.message_type)
            .arg("group")
            .arg(&self.group)
            .arg("attempt")
            .arg(delivery.attempt())
            .arg("reason")
            .arg(reason)
            .arg("failed_at")
            .arg(chrono::Utc::now().to_rfc3339())
            .arg("payload")
            .arg(&payload)
            .query_async(&mut self.conn)
            .await
            .map_err(|e| RedisStreamsError::Command(format!("DLQ XADD failed: {}", e)))?;

        warn!(
            entry_id = %delivery.tag(),
            correlation_id = %delivery.envelope().correlation_id(),
            attempt = delivery.attempt(),
            reason,
            "message sent to dead-letter queue"
        );

        Ok(self.xack(delivery.tag()).await?)
    }
}

#[cfg(test)]
mod tests {
    //! Needs a disposable Redis in `WAYPOINT_TEST_REDIS_URL`; passes trivially when unset.

    use super::*;
    use waypoint_core::{JobId, JobStatus};
    use waypoint_events::{JobStatusUpdate, publish_message};

    fn bus() -> Option<RedisStreamsMessageBus> {
        let url = std::env::var("WAYPOINT_TEST_REDIS_URL").ok()?;
        RedisStreamsMessageBus::new(url).ok()
    }

    #[test]
    fn stream_errors_map_onto_bus_errors() {
        let err: BusError = RedisStreamsError::MalformedEntry {
            entry_id: "1-0".to_string(),
            message: "no payload field".to_string(),
        }
        .into();
        assert!(matches!(err, BusError::Serialization(m) if m.contains("1-0")));
        let err: BusError = RedisStreamsError::ConsumerGroup("nope".to_string()).into();
        assert!(matches!(err, BusError::Command(_)));
    }

    #[tokio::test]
    async fn publish_consume_nack_and_ack() {
        let Some(bus) = bus() else { return };
        let group = format!("test-{}", uuid::Uuid::now_v7());
        let mut sub = bus
            .subscribe("job.status_update", &group, "c1")
            .await
            .unwrap();

        let msg = JobStatusUpdate {
            job_id: JobId::new(),
            status: JobStatus::Processing,
            details: None,
        };
        let envelope = publish_message(&bus, &msg).await.unwrap();

        // The group starts at the beginning of the stream; skip older entries.
        let first = loop {
            let d = sub.next(Duration::from_secs(2)).await.unwrap().expect("delivery");
            if d.envelope().message_id() == envelope.message_id() {
                break d;
            }
            sub.ack(&d).await.unwrap();
        };
        assert_eq!(first.attempt(), 1);

        sub.nack(&first, Duration::from_millis(10)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        let second = sub.next(Duration::from_secs(2)).await.unwrap().expect("redelivery");
        assert_eq!(second.tag(), first.tag());
        assert_eq!(second.attempt(), 2);

        sub.ack(&second).await.unwrap();
    }
}
