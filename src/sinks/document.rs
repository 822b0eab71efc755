//! Document store sink backed by Redis hashes.
//!
//! Converts the envelope into a keyed record and upserts it with HSET under
//! `<table>:<primary_key>`. Writing the same event twice overwrites the
//! same record, so the operation is idempotent on the primary key.

use super::{classify_pool_error, classify_redis_error, Sink, SinkAck, SinkError};
use crate::envelope::CanonicalEvent;
use async_trait::async_trait;
use deadpool_redis::redis::cmd;
use deadpool_redis::Pool;
use tracing::{debug, info};

/// A sink that upserts canonical events as keyed records.
pub struct DocumentStoreSink {
    pool: Pool,
    table: String,
}

impl DocumentStoreSink {
    /// Create a document store sink writing under the given table prefix.
    pub fn new(pool: Pool, table: impl Into<String>) -> Self {
        Self {
            pool,
            table: table.into(),
        }
    }

    /// Table (key prefix) this sink writes under.
    pub fn table(&self) -> &str {
        &self.table
    }

    /// Full document key for an event: `<table>:<primary_key>`.
    fn document_key(&self, event: &CanonicalEvent) -> String {
        format!("{}:{}", self.table, primary_key(event))
    }
}

/// Primary key of the record derived from an envelope.
///
/// Signals key on the signal id and risk evaluations on the trade id, so
/// re-delivery of the same event lands on the same record. Ticks have no
/// natural id and key on symbol plus instant.
pub fn primary_key(event: &CanonicalEvent) -> String {
    match event {
        CanonicalEvent::MarketTick {
            symbol, timestamp, ..
        } => format!("{}@{}", symbol, timestamp),
        CanonicalEvent::TradeSignal { id, .. } => id.clone(),
        CanonicalEvent::RiskEvaluation { trade_id, .. } => trade_id.clone(),
    }
}

/// Flatten an envelope into the attribute pairs stored on the record.
pub fn attributes(event: &CanonicalEvent) -> Vec<(&'static str, String)> {
    match event {
        CanonicalEvent::MarketTick {
            symbol,
            price,
            volume,
            timestamp,
        } => vec![
            ("kind", event.kind().as_str().to_string()),
            ("symbol", symbol.clone()),
            ("price", price.to_string()),
            ("volume", volume.to_string()),
            ("timestamp", timestamp.clone()),
        ],
        CanonicalEvent::TradeSignal {
            id,
            signal,
            timestamp,
        } => vec![
            ("kind", event.kind().as_str().to_string()),
            ("id", id.clone()),
            ("signal", signal.as_str().to_string()),
            ("timestamp", timestamp.clone()),
        ],
        CanonicalEvent::RiskEvaluation {
            trade_id,
            risk_score,
            timestamp,
        } => vec![
            ("kind", event.kind().as_str().to_string()),
            ("tradeId", trade_id.clone()),
            ("riskScore", risk_score.to_string()),
            ("timestamp", timestamp.clone()),
        ],
    }
}

#[async_trait]
impl Sink for DocumentStoreSink {
    fn id(&self) -> &str {
        "documents"
    }

    async fn write(&self, event: &CanonicalEvent) -> Result<SinkAck, SinkError> {
        let key = self.document_key(event);
        let pairs = attributes(event);

        debug!(
            key = %key,
            kind = %event.kind(),
            "Upserting document record"
        );

        let mut conn = self.pool.get().await.map_err(classify_pool_error)?;

        let mut hset = cmd("HSET");
        hset.arg(&key);
        for (field, value) in &pairs {
            hset.arg(*field).arg(value);
        }

        let _: usize = hset
            .query_async(&mut conn)
            .await
            .map_err(|e| classify_redis_error(&e))?;

        info!(
            key = %key,
            kind = %event.kind(),
            fields = pairs.len(),
            "Document record upserted"
        );

        Ok(SinkAck::with_receipt(
            self.id(),
            format!("upserted record '{}'", key),
            key,
        ))
    }
}
