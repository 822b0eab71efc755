//! Parking lot for undeliverable events.
//!
//! Events whose sink write failed permanently, or transiently past the
//! retry cap, are parked in a Redis-stream dead letter queue together with
//! the failure classification. Operators can list, inspect, and remove
//! parked events, and re-submit them through the intake API once the sink
//! is healthy again.
//!
//! # Example
//!
//! ```rust,ignore
//! use tickpipe::dlq::DeadLetterQueue;
//!
//! let dlq = DeadLetterQueue::new(redis_pool);
//! dlq.park(&event, ErrorKind::Permanent, "postgres connection refused", 0, Some("1-0")).await?;
//!
//! let parked = dlq.list(10, 0).await?;
//! ```

use deadpool_redis::redis::cmd;
use deadpool_redis::Pool;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use thiserror::Error;
use tracing::{debug, error, info};

use crate::envelope::CanonicalEvent;
use crate::sinks::ErrorKind;

/// Redis stream name for the dead letter queue
pub const DLQ_STREAM_NAME: &str = "tickpipe:events:dlq";

/// Maximum entries to keep in the DLQ (older entries are trimmed)
const DLQ_MAX_LEN: usize = 10000;

/// A parked event together with its failure context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParkedEvent {
    /// The canonical event that could not be delivered
    pub event: CanonicalEvent,

    /// "transient" or "permanent"
    #[serde(rename = "errorKind")]
    pub error_kind: String,

    /// Error message from the last failed write
    pub error: String,

    /// Delivery attempts made before parking
    #[serde(rename = "retryCount")]
    pub retry_count: u32,

    /// RFC 3339 timestamp when the event was parked
    #[serde(rename = "failedAt")]
    pub failed_at: String,

    /// Intake stream id the event arrived under, if known
    #[serde(rename = "originalId", skip_serializing_if = "Option::is_none")]
    pub original_id: Option<String>,
}

/// Errors from dead letter queue operations.
#[derive(Debug, Error)]
pub enum DlqError {
    #[error("Redis connection error: {0}")]
    ConnectionError(String),

    #[error("Redis command error: {0}")]
    RedisError(String),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}

/// Dead letter queue over a Redis stream.
#[derive(Clone)]
pub struct DeadLetterQueue {
    pool: Pool,
}

impl DeadLetterQueue {
    /// Create a dead letter queue handle.
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    async fn conn(&self) -> Result<deadpool_redis::Connection, DlqError> {
        self.pool.get().await.map_err(|e| {
            error!(error = %e, "Failed to get Redis connection for DLQ");
            DlqError::ConnectionError(e.to_string())
        })
    }

    /// Park an undeliverable event.
    pub async fn park(
        &self,
        event: &CanonicalEvent,
        error_kind: ErrorKind,
        error: &str,
        retry_count: u32,
        original_id: Option<&str>,
    ) -> Result<String, DlqError> {
        let mut conn = self.conn().await?;

        let failed_at = chrono::Utc::now().to_rfc3339();
        let event_json = serde_json::to_string(event)?;

        // MAXLEN keeps the parking lot bounded
        let id: String = cmd("XADD")
            .arg(DLQ_STREAM_NAME)
            .arg("MAXLEN")
            .arg("~")
            .arg(DLQ_MAX_LEN)
            .arg("*")
            .arg("event")
            .arg(&event_json)
            .arg("kind")
            .arg(event.kind().as_str())
            .arg("routingKey")
            .arg(event.routing_key())
            .arg("errorKind")
            .arg(error_kind.as_str())
            .arg("error")
            .arg(error)
            .arg("retryCount")
            .arg(retry_count)
            .arg("failedAt")
            .arg(&failed_at)
            .arg("originalId")
            .arg(original_id.unwrap_or(""))
            .query_async(&mut conn)
            .await
            .map_err(|e| {
                error!(error = %e, "Failed to park event in DLQ");
                DlqError::RedisError(e.to_string())
            })?;

        info!(
            dlq_id = %id,
            original_id = ?original_id,
            kind = %event.kind(),
            error_kind = %error_kind,
            retry_count = retry_count,
            "Event parked in dead letter queue"
        );

        Ok(id)
    }

    /// Number of parked events.
    pub async fn count(&self) -> Result<u64, DlqError> {
        let mut conn = self.conn().await?;

        let count: u64 = cmd("XLEN")
            .arg(DLQ_STREAM_NAME)
            .query_async(&mut conn)
            .await
            .map_err(|e| DlqError::RedisError(e.to_string()))?;

        Ok(count)
    }

    /// List parked events as (stream_id, entry) pairs.
    pub async fn list(&self, count: usize, offset: usize) -> Result<Vec<(String, Value)>, DlqError> {
        let mut conn = self.conn().await?;

        let entries: Vec<(String, Vec<(String, String)>)> = cmd("XRANGE")
            .arg(DLQ_STREAM_NAME)
            .arg("-")
            .arg("+")
            .arg("COUNT")
            .arg(count + offset)
            .query_async(&mut conn)
            .await
            .map_err(|e| DlqError::RedisError(e.to_string()))?;

        let result: Vec<(String, Value)> = entries
            .into_iter()
            .skip(offset)
            .take(count)
            .map(|(id, fields)| (id, fields_to_value(fields)))
            .collect();

        debug!(count = result.len(), "Retrieved DLQ entries");
        Ok(result)
    }

    /// Fetch a single parked event by stream id.
    pub async fn get(&self, id: &str) -> Result<Option<Value>, DlqError> {
        let mut conn = self.conn().await?;

        let entries: Vec<(String, Vec<(String, String)>)> = cmd("XRANGE")
            .arg(DLQ_STREAM_NAME)
            .arg(id)
            .arg(id)
            .query_async(&mut conn)
            .await
            .map_err(|e| DlqError::RedisError(e.to_string()))?;

        Ok(entries
            .into_iter()
            .next()
            .map(|(_, fields)| fields_to_value(fields)))
    }

    /// Remove a parked event after review or re-submission.
    pub async fn remove(&self, id: &str) -> Result<bool, DlqError> {
        let mut conn = self.conn().await?;

        let removed: u64 = cmd("XDEL")
            .arg(DLQ_STREAM_NAME)
            .arg(id)
            .query_async(&mut conn)
            .await
            .map_err(|e| DlqError::RedisError(e.to_string()))?;

        if removed > 0 {
            info!(id = %id, "Removed event from DLQ");
            Ok(true)
        } else {
            debug!(id = %id, "Event not found in DLQ");
            Ok(false)
        }
    }
}

/// Decode the flat field pairs of a DLQ stream entry into a JSON object.
///
/// The "event" field holds the serialized envelope and is re-inflated;
/// "retryCount" becomes a number; everything else stays a string.
fn fields_to_value(fields: Vec<(String, String)>) -> Value {
    let mut obj = Map::new();
    for (key, value) in fields {
        match key.as_str() {
            "event" => {
                let parsed = serde_json::from_str::<Value>(&value)
                    .unwrap_or(Value::String(value));
                obj.insert(key, parsed);
            }
            "retryCount" => {
                let parsed = value
                    .parse::<u32>()
                    .map(|n| json!(n))
                    .unwrap_or(Value::String(value));
                obj.insert(key, parsed);
            }
            _ => {
                obj.insert(key, Value::String(value));
            }
        }
    }
    Value::Object(obj)
}
