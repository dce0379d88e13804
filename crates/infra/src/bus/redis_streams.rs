//! Redis Streams-backed message bus (durable, at-least-once delivery).
//!
//! - **Publish**: `XADD` on a single stream; the entry id is the message id
//! - **Consume**: one consumer group shared by all workers, `XREADGROUP`
//! - **Acknowledge**: `XACK` once a delivery is settled
//! - **Redelivery**: pending entries idle past the timeout are claimed with
//!   `XCLAIM` and flagged through `Delivery::delivery_count`

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::{error, instrument, warn};

use jobwarden_bus::{Delivery, EncodedCommand, MessageBus, MessageId, Subscription};
use jobwarden_core::{JobId, StructMap};

/// Default stream key for job commands.
pub const DEFAULT_STREAM_KEY: &str = "jobwarden:jobs";

/// Default consumer group shared by dispatch workers.
pub const DEFAULT_GROUP: &str = "jobwarden.dispatch";

/// Pending entries idle longer than this are claimed for redelivery.
const DEFAULT_PENDING_TIMEOUT_MS: u64 = 60_000;

const READ_COUNT: usize = 10;
const BLOCK_MS: u64 = 100;

#[derive(Debug, Clone)]
pub struct RedisStreamsMessageBus {
    client: Arc<redis::Client>,
    stream_key: String,
    group: String,
    consumer: String,
    pending_timeout_ms: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum RedisStreamsError {
    #[error("Redis connection error: {0}")]
    Connection(String),

    #[error("Redis command error: {0}")]
    Command(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),
}

impl RedisStreamsMessageBus {
    /// Create a bus reading as `consumer` within `group`.
    ///
    /// * `redis_url` - Redis connection URL (e.g., "redis://localhost:6379")
    /// * `stream_key` - stream key (default: "jobwarden:jobs")
    pub fn new(
        redis_url: impl AsRef<str>,
        stream_key: Option<String>,
        group: impl Into<String>,
        consumer: impl Into<String>,
    ) -> Result<Self, RedisStreamsError> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| RedisStreamsError::Connection(e.to_string()))?;

        Ok(Self {
            client: Arc::new(client),
            stream_key: stream_key.unwrap_or_else(|| DEFAULT_STREAM_KEY.to_string()),
            group: group.into(),
            consumer: consumer.into(),
            pending_timeout_ms: DEFAULT_PENDING_TIMEOUT_MS,
        })
    }

    pub fn with_pending_timeout(mut self, timeout: Duration) -> Self {
        self.pending_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn stream_key(&self) -> &str {
        &self.stream_key
    }

    fn connection(&self) -> Result<redis::Connection, RedisStreamsError> {
        self.client
            .get_connection()
            .map_err(|e| RedisStreamsError::Connection(e.to_string()))
    }

    /// Ensure the consumer group exists (idempotent).
    pub fn ensure_consumer_group(&self) -> Result<(), RedisStreamsError> {
        let mut conn = self.connection()?;

        // MKSTREAM creates the stream if needed; BUSYGROUP means it already exists.
        let created: redis::RedisResult<String> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(&self.stream_key)
            .arg(&self.group)
            .arg("0")
            .arg("MKSTREAM")
            .query(&mut conn);

        match created {
            Ok(_) => Ok(()),
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
            Err(e) => Err(RedisStreamsError::Command(format!("XGROUP CREATE failed: {e}"))),
        }
    }

    #[instrument(
        skip(self, command),
        fields(stream_key = %self.stream_key, job_type = %command.job_type),
        err
    )]
    fn publish_sync(&self, command: &EncodedCommand) -> Result<MessageId, RedisStreamsError> {
        let payload = serde_json::to_string(&command.payload)
            .map_err(|e| RedisStreamsError::Serialization(e.to_string()))?;

        let mut conn = self.connection()?;

        let mut xadd = redis::cmd("XADD");
        xadd.arg(&self.stream_key)
            .arg("*")
            .arg("job_type")
            .arg(&command.job_type);
        if let Some(job_id) = command.job_id {
            xadd.arg("job_id").arg(job_id.to_string());
        }
        xadd.arg("payload").arg(&payload);

        let entry_id: String = xadd
            .query(&mut conn)
            .map_err(|e| RedisStreamsError::Command(format!("XADD failed: {e}")))?;

        MessageId::new(entry_id).map_err(|e| RedisStreamsError::Deserialization(e.to_string()))
    }

    #[instrument(skip(self), fields(stream_key = %self.stream_key, group = %self.group), err)]
    fn acknowledge_sync(&self, message_id: &MessageId) -> Result<(), RedisStreamsError> {
        let mut conn = self.connection()?;

        let _: u64 = redis::cmd("XACK")
            .arg(&self.stream_key)
            .arg(&self.group)
            .arg(message_id.as_str())
            .query(&mut conn)
            .map_err(|e| RedisStreamsError::Command(format!("XACK failed: {e}")))?;

        Ok(())
    }

    /// Claimed redeliveries first, then new entries.
    fn read_batch(&self) -> Result<Vec<Delivery>, RedisStreamsError> {
        let mut conn = self.connection()?;

        let pending = self.claim_pending(&mut conn)?;
        if !pending.is_empty() {
            return Ok(pending);
        }

        self.read_new(&mut conn)
    }

    /// Claim entries left unacknowledged (by any consumer) for too long.
    fn claim_pending(&self, conn: &mut redis::Connection) -> Result<Vec<Delivery>, RedisStreamsError> {
        // Extended form: [id, consumer, idle_ms, times_delivered]
        let pending: Vec<(String, String, u64, u64)> = redis::cmd("XPENDING")
            .arg(&self.stream_key)
            .arg(&self.group)
            .arg("IDLE")
            .arg(self.pending_timeout_ms)
            .arg("-")
            .arg("+")
            .arg(READ_COUNT)
            .query(conn)
            .map_err(|e| RedisStreamsError::Command(format!("XPENDING failed: {e}")))?;

        if pending.is_empty() {
            return Ok(vec![]);
        }

        let counts: HashMap<String, u32> = pending
            .into_iter()
            .map(|(id, _, _, delivered)| (id, u32::try_from(delivered).unwrap_or(u32::MAX)))
            .collect();
        let ids: Vec<&String> = counts.keys().collect();

        let claimed: redis::Value = redis::cmd("XCLAIM")
            .arg(&self.stream_key)
            .arg(&self.group)
            .arg(&self.consumer)
            .arg(self.pending_timeout_ms)
            .arg(&ids[..])
            .query(conn)
            .map_err(|e| RedisStreamsError::Command(format!("XCLAIM failed: {e}")))?;

        let mut deliveries = Vec::new();
        for entry in bulk(claimed) {
            // XCLAIM itself counts as one more delivery.
            match parse_entry(entry, |id| counts.get(id).map_or(2, |c| c.saturating_add(1))) {
                Ok(delivery) => deliveries.push(delivery),
                Err(e) => warn!(error = %e, "skipping unreadable claimed entry"),
            }
        }
        Ok(deliveries)
    }

    fn read_new(&self, conn: &mut redis::Connection) -> Result<Vec<Delivery>, RedisStreamsError> {
        // Reply: [[stream_key, [entry, ...]]], or nil when the block times out.
        let reply: redis::Value = redis::cmd("XREADGROUP")
            .arg("GROUP")
            .arg(&self.group)
            .arg(&self.consumer)
            .arg("COUNT")
            .arg(READ_COUNT)
            .arg("BLOCK")
            .arg(BLOCK_MS)
            .arg("STREAMS")
            .arg(&self.stream_key)
            .arg(">")
            .query(conn)
            .map_err(|e| RedisStreamsError::Command(format!("XREADGROUP failed: {e}")))?;

        let mut deliveries = Vec::new();
        for stream in bulk(reply) {
            let Some(entries) = bulk(stream).into_iter().nth(1) else {
                continue;
            };
            for entry in bulk(entries) {
                match parse_entry(entry, |_| 1) {
                    Ok(delivery) => deliveries.push(delivery),
                    Err(e) => warn!(error = %e, "skipping unreadable stream entry"),
                }
            }
        }
        Ok(deliveries)
    }
}

fn bulk(value: redis::Value) -> Vec<redis::Value> {
    match value {
        redis::Value::Bulk(items) => items,
        _ => Vec::new(),
    }
}

fn text(value: &redis::Value) -> Option<String> {
    match value {
        redis::Value::Data(data) => Some(String::from_utf8_lossy(data).into_owned()),
        redis::Value::Status(s) => Some(s.clone()),
        _ => None,
    }
}

/// Entry format: `[message_id, [field1, value1, field2, value2, ...]]`.
fn parse_entry(
    entry: redis::Value,
    delivery_count: impl Fn(&str) -> u32,
) -> Result<Delivery, RedisStreamsError> {
    let invalid = |what: &str| RedisStreamsError::Deserialization(what.to_string());

    let mut parts = bulk(entry).into_iter();
    let id = parts
        .next()
        .as_ref()
        .and_then(text)
        .ok_or_else(|| invalid("invalid message id"))?;
    let fields_vec = parts.next().map(bulk).ok_or_else(|| invalid("missing fields"))?;

    let mut fields = HashMap::new();
    for chunk in fields_vec.chunks(2) {
        if let [key, value] = chunk {
            if let (Some(key), Some(value)) = (text(key), text(value)) {
                fields.insert(key, value);
            }
        }
    }

    let job_type = fields
        .remove("job_type")
        .ok_or_else(|| invalid("missing job_type field"))?;
    let job_id = fields
        .get("job_id")
        .map(|s| s.parse::<JobId>())
        .transpose()
        .map_err(|e| RedisStreamsError::Deserialization(format!("invalid job_id: {e}")))?;
    let payload_str = fields
        .get("payload")
        .ok_or_else(|| invalid("missing payload field"))?;
    let payload: StructMap = serde_json::from_str(payload_str)
        .map_err(|e| RedisStreamsError::Deserialization(format!("invalid payload: {e}")))?;

    let count = delivery_count(&id);
    let message_id =
        MessageId::new(id).map_err(|e| RedisStreamsError::Deserialization(e.to_string()))?;
    Ok(Delivery {
        message_id,
        command: EncodedCommand::new(job_type, job_id, payload),
        delivery_count: count,
    })
}

impl MessageBus for RedisStreamsMessageBus {
    type Error = RedisStreamsError;

    fn publish(&self, command: &EncodedCommand) -> Result<MessageId, Self::Error> {
        self.publish_sync(command)
    }

    /// Background thread polling the consumer group and forwarding
    /// deliveries; it stops once the subscription is dropped.
    fn subscribe(&self) -> Subscription<Delivery> {
        if let Err(e) = self.ensure_consumer_group() {
            error!(group = %self.group, error = %e, "failed to create consumer group");
        }

        let (tx, rx) = std::sync::mpsc::channel();
        let bus = self.clone();

        std::thread::spawn(move || {
            loop {
                match bus.read_batch() {
                    Ok(deliveries) => {
                        for delivery in deliveries {
                            if tx.send(delivery).is_err() {
                                return; // Receiver dropped
                            }
                        }
                    }
                    Err(e) => error!(stream_key = %bus.stream_key, error = %e, "failed to read from stream"),
                }

                std::thread::sleep(Duration::from_millis(BLOCK_MS));
            }
        });

        Subscription::new(rx)
    }

    fn acknowledge(&self, delivery: &Delivery) -> Result<(), Self::Error> {
        self.acknowledge_sync(&delivery.message_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data(s: &str) -> redis::Value {
        redis::Value::Data(s.as_bytes().to_vec())
    }

    #[test]
    fn parses_stream_entries() {
        let job_id = JobId::new();
        let entry = redis::Value::Bulk(vec![
            data("1700000000000-0"),
            redis::Value::Bulk(vec![
                data("job_type"),
                data("geocode"),
                data("job_id"),
                data(&job_id.to_string()),
                data("payload"),
                data(r#"{"address":"1 Main St"}"#),
            ]),
        ]);

        let delivery = parse_entry(entry, |_| 3).unwrap();
        assert_eq!(delivery.message_id.as_str(), "1700000000000-0");
        assert_eq!(delivery.command.job_type, "geocode");
        assert_eq!(delivery.command.job_id, Some(job_id));
        assert_eq!(delivery.command.payload["address"], "1 Main St");
        assert!(delivery.is_redelivery());
    }

    #[test]
    fn unbound_entries_carry_no_job_id() {
        let entry = redis::Value::Bulk(vec![
            data("1-0"),
            redis::Value::Bulk(vec![
                data("job_type"),
                data("geocode"),
                data("payload"),
                data("{}"),
            ]),
        ]);
        let delivery = parse_entry(entry, |_| 1).unwrap();
        assert_eq!(delivery.command.job_id, None);
    }

    #[test]
    fn rejects_malformed_entries() {
        let missing_type = redis::Value::Bulk(vec![
            data("1-0"),
            redis::Value::Bulk(vec![data("payload"), data("{}")]),
        ]);
        assert!(parse_entry(missing_type, |_| 1).is_err());
        assert!(parse_entry(redis::Value::Nil, |_| 1).is_err());
    }
}
