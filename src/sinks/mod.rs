//! Durable sinks for canonical events.
//!
//! A [`Sink`] accepts exactly one canonical event per [`Sink::write`] call
//! and performs a single best-effort write against its backing store. No
//! sink retries internally; failures come back classified as transient or
//! permanent so the caller can decide what to do.
//!
//! ## Built-in Sinks
//!
//! - [`StreamSink`]: append to a named Redis stream with a routing key
//! - [`DocumentStoreSink`]: keyed upsert into Redis hashes
//! - [`RelationalSink`]: parameterized insert into Postgres

pub mod document;
pub mod relational;
pub mod stream;

use crate::envelope::CanonicalEvent;
use async_trait::async_trait;
use deadpool_redis::redis::RedisError;
use deadpool_redis::PoolError;
use std::fmt;
use thiserror::Error;

pub use document::DocumentStoreSink;
pub use relational::RelationalSink;
pub use stream::StreamSink;

/// Failure classification surfaced to the caller.
///
/// Transient failures may be retried by the caller; permanent failures are
/// terminal for that call and need operator attention.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Transient,
    Permanent,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Transient => "transient",
            ErrorKind::Permanent => "permanent",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors from a single sink write attempt.
#[derive(Debug, Error)]
pub enum SinkError {
    /// The sink was temporarily unreachable or overloaded; retryable
    #[error("transient sink failure: {0}")]
    Transient(String),

    /// The write cannot succeed without intervention (bad credentials,
    /// missing destination, rejected statement)
    #[error("permanent sink failure: {0}")]
    Permanent(String),

    /// The envelope could not be serialized for the sink
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl SinkError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SinkError::Transient(_) => ErrorKind::Transient,
            SinkError::Permanent(_) | SinkError::Serialization(_) => ErrorKind::Permanent,
        }
    }
}

/// Acknowledgement of a successful sink write.
#[derive(Debug, Clone)]
pub struct SinkAck {
    /// Identifier of the sink that accepted the event
    pub sink_id: String,

    /// Human-readable description of what happened
    pub message: String,

    /// Opaque receipt from the underlying store (stream entry id,
    /// document key, inserted row count)
    pub receipt: Option<String>,
}

impl SinkAck {
    /// Create an acknowledgement without a receipt
    pub fn new(sink_id: &str, message: impl Into<String>) -> Self {
        Self {
            sink_id: sink_id.to_string(),
            message: message.into(),
            receipt: None,
        }
    }

    /// Create an acknowledgement carrying a store receipt
    pub fn with_receipt(
        sink_id: &str,
        message: impl Into<String>,
        receipt: impl Into<String>,
    ) -> Self {
        Self {
            sink_id: sink_id.to_string(),
            message: message.into(),
            receipt: Some(receipt.into()),
        }
    }
}

/// The core Sink trait.
///
/// Implementations own their connection handles (pools are injected at
/// construction) and must be `Send + Sync` for shared use across tasks.
#[async_trait]
pub trait Sink: Send + Sync {
    /// Stable identifier of this sink (e.g. "stream", "documents",
    /// "relational"), used in results and logs
    fn id(&self) -> &str;

    /// Write one canonical event.
    ///
    /// A single attempt: implementations must not loop or retry. Returns
    /// the acknowledgement on success or a classified [`SinkError`].
    async fn write(&self, event: &CanonicalEvent) -> Result<SinkAck, SinkError>;
}

/// Classify a Redis pool acquisition failure.
pub(crate) fn classify_pool_error(err: PoolError) -> SinkError {
    match err {
        PoolError::Timeout(_) => {
            SinkError::Transient(format!("redis pool timeout: {}", err))
        }
        PoolError::Backend(e) => classify_redis_error(&e),
        _ => SinkError::Permanent(format!("redis pool unavailable: {}", err)),
    }
}

/// Classify a Redis command failure.
///
/// Connection refusal and authentication failures mean the destination is
/// missing or misconfigured; timeouts and dropped connections are worth a
/// retry from the caller.
pub(crate) fn classify_redis_error(err: &RedisError) -> SinkError {
    use deadpool_redis::redis::ErrorKind as RedisKind;

    if err.is_connection_refusal() {
        return SinkError::Permanent(format!("redis connection refused: {}", err));
    }
    if err.kind() == RedisKind::AuthenticationFailed {
        return SinkError::Permanent(format!("redis authentication failed: {}", err));
    }
    if err.is_timeout() || err.is_connection_dropped() || err.is_io_error() {
        return SinkError::Transient(format!("redis unavailable: {}", err));
    }

    SinkError::Permanent(format!("redis command rejected: {}", err))
}
