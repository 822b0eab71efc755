//! Stream sink backed by Redis Streams.
//!
//! Serializes the envelope to UTF-8 JSON and appends it to a named stream
//! with a routing key derived from the event (the tick symbol for market
//! ticks). The stream entry id assigned by Redis is returned as the
//! receipt.

use super::{classify_pool_error, classify_redis_error, Sink, SinkAck, SinkError};
use crate::envelope::CanonicalEvent;
use async_trait::async_trait;
use deadpool_redis::redis::cmd;
use deadpool_redis::Pool;
use tracing::{debug, info};

/// Maximum entries retained in the destination stream (approximate trim)
const STREAM_MAX_LEN: usize = 1_000_000;

/// A sink that appends canonical events to a Redis stream.
pub struct StreamSink {
    pool: Pool,
    stream: String,
}

impl StreamSink {
    /// Create a stream sink targeting the given stream name.
    pub fn new(pool: Pool, stream: impl Into<String>) -> Self {
        Self {
            pool,
            stream: stream.into(),
        }
    }

    /// Destination stream name.
    pub fn stream(&self) -> &str {
        &self.stream
    }
}

#[async_trait]
impl Sink for StreamSink {
    fn id(&self) -> &str {
        "stream"
    }

    async fn write(&self, event: &CanonicalEvent) -> Result<SinkAck, SinkError> {
        let payload = serde_json::to_string(event)?;

        debug!(
            stream = %self.stream,
            kind = %event.kind(),
            routing_key = %event.routing_key(),
            "Appending event to stream"
        );

        let mut conn = self.pool.get().await.map_err(classify_pool_error)?;

        let entry_id: String = cmd("XADD")
            .arg(&self.stream)
            .arg("MAXLEN")
            .arg("~")
            .arg(STREAM_MAX_LEN)
            .arg("*")
            .arg("kind")
            .arg(event.kind().as_str())
            .arg("routingKey")
            .arg(event.routing_key())
            .arg("payload")
            .arg(&payload)
            .query_async(&mut conn)
            .await
            .map_err(|e| classify_redis_error(&e))?;

        info!(
            stream = %self.stream,
            entry_id = %entry_id,
            kind = %event.kind(),
            routing_key = %event.routing_key(),
            "Event appended to stream"
        );

        Ok(SinkAck::with_receipt(
            self.id(),
            format!("appended to stream '{}'", self.stream),
            entry_id,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_stream_payload_carries_all_fields() {
        let event = crate::envelope::build(&json!({
            "symbol": "NVDA",
            "price": 118.85,
            "volume": 211909315u64,
            "timestamp": "2024-10-02T09:35:12Z"
        }))
        .unwrap();

        let payload = serde_json::to_string(&event).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&payload).unwrap();

        assert_eq!(parsed["symbol"], "NVDA");
        assert_eq!(parsed["price"], 118.85);
        assert_eq!(parsed["volume"], 211909315u64);
        assert_eq!(parsed["timestamp"], "2024-10-02T09:35:12Z");
    }

    #[test]
    fn test_routing_key_is_symbol() {
        let event = CanonicalEvent::MarketTick {
            symbol: "AAPL".to_string(),
            price: 227.5,
            volume: 1000,
            timestamp: "2024-10-02T09:35:12Z".to_string(),
        };
        assert_eq!(event.routing_key(), "AAPL");
    }
}
