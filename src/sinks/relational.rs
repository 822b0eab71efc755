//! Relational sink backed by Postgres.
//!
//! Executes a parameterized insert into a fixed per-kind table:
//! `market_ticks`, `trade_signals`, or `risk_evaluations`. Inserts are not
//! idempotent; duplicate deliveries create duplicate rows unless a unique
//! constraint exists on the table.

use super::{Sink, SinkAck, SinkError};
use crate::envelope::CanonicalEvent;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tracing::{debug, info};

/// A sink that inserts canonical events as relational rows.
pub struct RelationalSink {
    pool: PgPool,
}

impl RelationalSink {
    /// Create a relational sink over an existing connection pool.
    ///
    /// Pool lifecycle belongs to the caller; the sink only borrows
    /// connections per write.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Table an event kind is inserted into.
    pub fn table_for(event: &CanonicalEvent) -> &'static str {
        match event {
            CanonicalEvent::MarketTick { .. } => "market_ticks",
            CanonicalEvent::TradeSignal { .. } => "trade_signals",
            CanonicalEvent::RiskEvaluation { .. } => "risk_evaluations",
        }
    }
}

/// Classify a sqlx failure into the caller-facing taxonomy.
///
/// Connection refusal means the destination is absent or misaddressed and
/// is terminal for the call. Pool exhaustion and interrupted I/O are worth
/// a retry. Statement and schema rejections are terminal.
fn classify_sqlx_error(err: sqlx::Error) -> SinkError {
    use std::io::ErrorKind as IoKind;

    match &err {
        sqlx::Error::PoolTimedOut => {
            SinkError::Transient(format!("postgres pool timeout: {}", err))
        }
        sqlx::Error::Io(io) => match io.kind() {
            IoKind::ConnectionRefused => {
                SinkError::Permanent(format!("postgres connection refused: {}", err))
            }
            _ => SinkError::Transient(format!("postgres i/o failure: {}", err)),
        },
        sqlx::Error::Database(db) => {
            SinkError::Permanent(format!("postgres rejected statement: {}", db))
        }
        sqlx::Error::Configuration(_) | sqlx::Error::Tls(_) | sqlx::Error::PoolClosed => {
            SinkError::Permanent(format!("postgres unavailable: {}", err))
        }
        _ => SinkError::Transient(format!("postgres failure: {}", err)),
    }
}

/// Parse an envelope timestamp for a TIMESTAMPTZ column.
///
/// The envelope builder guarantees parseability; a failure here means the
/// event bypassed validation and is terminal.
fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, SinkError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| SinkError::Permanent(format!("unparseable event timestamp '{}': {}", raw, e)))
}

#[async_trait]
impl Sink for RelationalSink {
    fn id(&self) -> &str {
        "relational"
    }

    async fn write(&self, event: &CanonicalEvent) -> Result<SinkAck, SinkError> {
        let table = Self::table_for(event);

        debug!(
            table = table,
            kind = %event.kind(),
            "Inserting event row"
        );

        let result = match event {
            CanonicalEvent::MarketTick {
                symbol,
                price,
                volume,
                timestamp,
            } => {
                sqlx::query(
                    "INSERT INTO market_ticks (symbol, price, volume, timestamp) \
                     VALUES ($1, $2, $3, $4)",
                )
                .bind(symbol)
                .bind(price)
                .bind(*volume as i64)
                .bind(parse_timestamp(timestamp)?)
                .execute(&self.pool)
                .await
            }
            CanonicalEvent::TradeSignal {
                id,
                signal,
                timestamp,
            } => {
                sqlx::query(
                    "INSERT INTO trade_signals (id, signal, timestamp) \
                     VALUES ($1, $2, $3)",
                )
                .bind(id)
                .bind(signal.as_str())
                .bind(parse_timestamp(timestamp)?)
                .execute(&self.pool)
                .await
            }
            CanonicalEvent::RiskEvaluation {
                trade_id,
                risk_score,
                timestamp,
            } => {
                sqlx::query(
                    "INSERT INTO risk_evaluations (trade_id, risk_score, timestamp) \
                     VALUES ($1, $2, $3)",
                )
                .bind(trade_id)
                .bind(risk_score)
                .bind(parse_timestamp(timestamp)?)
                .execute(&self.pool)
                .await
            }
        };

        let done = result.map_err(classify_sqlx_error)?;

        info!(
            table = table,
            kind = %event.kind(),
            rows = done.rows_affected(),
            "Event row inserted"
        );

        Ok(SinkAck::with_receipt(
            self.id(),
            format!("inserted into '{}'", table),
            done.rows_affected().to_string(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sinks::ErrorKind;

    #[test]
    fn test_table_per_kind() {
        let tick = CanonicalEvent::MarketTick {
            symbol: "NVDA".to_string(),
            price: 118.85,
            volume: 100,
            timestamp: "2024-10-02T09:35:12Z".to_string(),
        };
        assert_eq!(RelationalSink::table_for(&tick), "market_ticks");

        let risk = CanonicalEvent::RiskEvaluation {
            trade_id: "5301".to_string(),
            risk_score: 0.85,
            timestamp: "2024-10-02T09:53:34Z".to_string(),
        };
        assert_eq!(RelationalSink::table_for(&risk), "risk_evaluations");
    }

    #[test]
    fn test_connection_refused_is_permanent() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        let err = classify_sqlx_error(sqlx::Error::Io(io));
        assert_eq!(err.kind(), ErrorKind::Permanent);
    }

    #[test]
    fn test_pool_timeout_is_transient() {
        let err = classify_sqlx_error(sqlx::Error::PoolTimedOut);
        assert_eq!(err.kind(), ErrorKind::Transient);
    }

    #[test]
    fn test_interrupted_io_is_transient() {
        let io = std::io::Error::new(std::io::ErrorKind::TimedOut, "timed out");
        let err = classify_sqlx_error(sqlx::Error::Io(io));
        assert_eq!(err.kind(), ErrorKind::Transient);
    }

    #[test]
    fn test_timestamp_parsing() {
        let parsed = parse_timestamp("2024-10-02T09:35:12Z").unwrap();
        assert_eq!(parsed.timestamp(), 1727861712);

        assert!(parse_timestamp("2024-10-02T09:21:Z").is_err());
    }
}
