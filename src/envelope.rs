//! Canonical event envelope for tickpipe.
//!
//! [`build`] turns an untyped JSON mapping into a validated
//! [`CanonicalEvent`]. All validation happens here, before any sink is
//! touched: malformed input fails with a [`ValidationError`] naming the
//! offending field, and no partial envelope is ever returned.
//!
//! # Example
//!
//! ```json
//! {
//!   "symbol": "NVDA",
//!   "price": 118.85,
//!   "volume": 211909315,
//!   "timestamp": "2024-10-02T09:35:12Z"
//! }
//! ```

use chrono::DateTime;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use thiserror::Error;

/// Rejection of an inbound record, naming the first field that failed.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("invalid field '{field}': {reason}")]
pub struct ValidationError {
    /// Field that failed validation ("$" for whole-record failures)
    pub field: String,

    /// Human-readable reason for the rejection
    pub reason: String,
}

impl ValidationError {
    fn new(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

/// Trade signal direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Signal {
    Buy,
    Sell,
    Hold,
}

impl Signal {
    /// Parse the uppercase wire form ("BUY", "SELL", "HOLD").
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "BUY" => Some(Signal::Buy),
            "SELL" => Some(Signal::Sell),
            "HOLD" => Some(Signal::Hold),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Signal::Buy => "BUY",
            Signal::Sell => "SELL",
            Signal::Hold => "HOLD",
        }
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Event kind, used to select the destination sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    MarketTick,
    TradeSignal,
    RiskEvaluation,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::MarketTick => "marketTick",
            EventKind::TradeSignal => "tradeSignal",
            EventKind::RiskEvaluation => "riskEvaluation",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A validated, normalized market event.
///
/// Constructed once per inbound record via [`build`], consumed exactly once
/// by a sink write, then discarded. Timestamps are kept in their original
/// RFC 3339 form; [`build`] guarantees they parse to a valid instant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum CanonicalEvent {
    /// A single observed market quote
    #[serde(rename_all = "camelCase")]
    MarketTick {
        symbol: String,
        price: f64,
        volume: u64,
        timestamp: String,
    },

    /// A buy/sell/hold decision emitted by a strategy
    #[serde(rename_all = "camelCase")]
    TradeSignal {
        id: String,
        signal: Signal,
        timestamp: String,
    },

    /// A risk score attached to a trade
    #[serde(rename_all = "camelCase")]
    RiskEvaluation {
        trade_id: String,
        risk_score: f64,
        timestamp: String,
    },
}

impl CanonicalEvent {
    /// Kind discriminant, used for sink selection.
    pub fn kind(&self) -> EventKind {
        match self {
            CanonicalEvent::MarketTick { .. } => EventKind::MarketTick,
            CanonicalEvent::TradeSignal { .. } => EventKind::TradeSignal,
            CanonicalEvent::RiskEvaluation { .. } => EventKind::RiskEvaluation,
        }
    }

    /// Routing key for partitioned stores: the tick symbol, signal id, or
    /// evaluated trade id.
    pub fn routing_key(&self) -> &str {
        match self {
            CanonicalEvent::MarketTick { symbol, .. } => symbol,
            CanonicalEvent::TradeSignal { id, .. } => id,
            CanonicalEvent::RiskEvaluation { trade_id, .. } => trade_id,
        }
    }

    /// Event timestamp in its original RFC 3339 form.
    pub fn timestamp(&self) -> &str {
        match self {
            CanonicalEvent::MarketTick { timestamp, .. }
            | CanonicalEvent::TradeSignal { timestamp, .. }
            | CanonicalEvent::RiskEvaluation { timestamp, .. } => timestamp,
        }
    }
}

/// Validate and normalize an untyped record into a [`CanonicalEvent`].
///
/// The event kind is inferred from the shape of the input:
///
/// - `symbol` or `price` present => market tick
/// - `signal` present => trade signal
/// - `risk_score` present => risk evaluation
///
/// Both snake_case and camelCase spellings are accepted for multi-word
/// fields on input; the canonical form serializes camelCase.
///
/// Pure function: no side effects, fails on the first violation.
pub fn build(raw: &Value) -> Result<CanonicalEvent, ValidationError> {
    let obj = raw
        .as_object()
        .ok_or_else(|| ValidationError::new("$", "input must be a JSON object"))?;

    if obj.contains_key("symbol") || obj.contains_key("price") {
        build_market_tick(obj)
    } else if obj.contains_key("signal") {
        build_trade_signal(obj)
    } else if obj.contains_key("risk_score") || obj.contains_key("riskScore") {
        build_risk_evaluation(obj)
    } else {
        Err(ValidationError::new(
            "$",
            "unrecognized event shape: expected market tick, trade signal, or risk evaluation fields",
        ))
    }
}

fn build_market_tick(obj: &Map<String, Value>) -> Result<CanonicalEvent, ValidationError> {
    let symbol = require_string(obj, &["symbol"])?;
    let price = require_number(obj, &["price"])?;
    if !price.is_finite() || price <= 0.0 {
        return Err(ValidationError::new(
            "price",
            "must be a positive finite number",
        ));
    }
    let volume = require_unsigned(obj, &["volume"])?;
    let timestamp = require_timestamp(obj, &["timestamp"])?;

    Ok(CanonicalEvent::MarketTick {
        symbol,
        price,
        volume,
        timestamp,
    })
}

fn build_trade_signal(obj: &Map<String, Value>) -> Result<CanonicalEvent, ValidationError> {
    let id = require_string(obj, &["id"])?;
    let signal_str = require_string(obj, &["signal"])?;
    let signal = Signal::parse(&signal_str).ok_or_else(|| {
        ValidationError::new("signal", "must be one of BUY, SELL, HOLD")
    })?;
    let timestamp = require_timestamp(obj, &["timestamp"])?;

    Ok(CanonicalEvent::TradeSignal {
        id,
        signal,
        timestamp,
    })
}

fn build_risk_evaluation(obj: &Map<String, Value>) -> Result<CanonicalEvent, ValidationError> {
    let trade_id = require_string(obj, &["trade_id", "tradeId"])?;
    let risk_score = require_number(obj, &["risk_score", "riskScore"])?;
    if !(0.0..=1.0).contains(&risk_score) {
        return Err(ValidationError::new(
            "risk_score",
            "must be a number between 0 and 1",
        ));
    }
    let timestamp = require_timestamp(obj, &["timestamp"])?;

    Ok(CanonicalEvent::RiskEvaluation {
        trade_id,
        risk_score,
        timestamp,
    })
}

/// Look a field up under any of its accepted spellings. The first name is
/// the canonical one and is used in error messages.
fn lookup<'a>(obj: &'a Map<String, Value>, names: &[&str]) -> Option<&'a Value> {
    names.iter().find_map(|name| obj.get(*name))
}

fn require_string(obj: &Map<String, Value>, names: &[&str]) -> Result<String, ValidationError> {
    let field = names[0];
    let value = lookup(obj, names)
        .ok_or_else(|| ValidationError::new(field, "required field is missing"))?;
    let s = value
        .as_str()
        .ok_or_else(|| ValidationError::new(field, "must be a string"))?;
    if s.is_empty() {
        return Err(ValidationError::new(field, "must not be empty"));
    }
    Ok(s.to_string())
}

fn require_number(obj: &Map<String, Value>, names: &[&str]) -> Result<f64, ValidationError> {
    let field = names[0];
    let value = lookup(obj, names)
        .ok_or_else(|| ValidationError::new(field, "required field is missing"))?;
    value
        .as_f64()
        .ok_or_else(|| ValidationError::new(field, "must be a number"))
}

fn require_unsigned(obj: &Map<String, Value>, names: &[&str]) -> Result<u64, ValidationError> {
    let field = names[0];
    let value = lookup(obj, names)
        .ok_or_else(|| ValidationError::new(field, "required field is missing"))?;
    value
        .as_u64()
        .ok_or_else(|| ValidationError::new(field, "must be a non-negative integer"))
}

fn require_timestamp(obj: &Map<String, Value>, names: &[&str]) -> Result<String, ValidationError> {
    let field = names[0];
    let s = require_string(obj, names)?;
    DateTime::parse_from_rfc3339(&s)
        .map_err(|e| ValidationError::new(field, format!("must be an RFC 3339 timestamp: {}", e)))?;
    Ok(s)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_build_market_tick() {
        let raw = json!({
            "symbol": "NVDA",
            "price": 118.85,
            "volume": 211909315u64,
            "timestamp": "2024-10-02T09:35:12Z"
        });

        let event = build(&raw).unwrap();
        assert_eq!(event.kind(), EventKind::MarketTick);
        assert_eq!(event.routing_key(), "NVDA");

        match event {
            CanonicalEvent::MarketTick {
                symbol,
                price,
                volume,
                timestamp,
            } => {
                assert_eq!(symbol, "NVDA");
                assert_eq!(price, 118.85);
                assert_eq!(volume, 211909315);
                assert_eq!(timestamp, "2024-10-02T09:35:12Z");
            }
            other => panic!("expected market tick, got {:?}", other),
        }
    }

    #[test]
    fn test_build_trade_signal() {
        let raw = json!({
            "id": "5301",
            "signal": "BUY",
            "timestamp": "2024-10-02T09:21:00Z"
        });

        let event = build(&raw).unwrap();
        assert_eq!(event.kind(), EventKind::TradeSignal);
        assert_eq!(event.routing_key(), "5301");
    }

    #[test]
    fn test_build_risk_evaluation() {
        let raw = json!({
            "trade_id": "5301",
            "risk_score": 0.85,
            "timestamp": "2024-10-02T09:53:34Z"
        });

        let event = build(&raw).unwrap();
        assert_eq!(event.kind(), EventKind::RiskEvaluation);

        // camelCase spellings are accepted too
        let raw = json!({
            "tradeId": "5301",
            "riskScore": 0.85,
            "timestamp": "2024-10-02T09:53:34Z"
        });
        assert_eq!(build(&raw).unwrap().routing_key(), "5301");
    }

    #[test]
    fn test_missing_field_names_the_field() {
        let raw = json!({
            "symbol": "NVDA",
            "price": 118.85,
            "timestamp": "2024-10-02T09:35:12Z"
        });

        let err = build(&raw).unwrap_err();
        assert_eq!(err.field, "volume");

        let raw = json!({
            "id": "5301",
            "signal": "BUY"
        });
        assert_eq!(build(&raw).unwrap_err().field, "timestamp");
    }

    #[test]
    fn test_negative_price_rejected() {
        let raw = json!({
            "symbol": "NVDA",
            "price": -1,
            "volume": 100,
            "timestamp": "2024-10-02T09:35:12Z"
        });

        let err = build(&raw).unwrap_err();
        assert_eq!(err.field, "price");
    }

    #[test]
    fn test_non_numeric_price_rejected() {
        let raw = json!({
            "symbol": "NVDA",
            "price": "118.85",
            "volume": 100,
            "timestamp": "2024-10-02T09:35:12Z"
        });
        assert_eq!(build(&raw).unwrap_err().field, "price");
    }

    #[test]
    fn test_negative_volume_rejected() {
        let raw = json!({
            "symbol": "NVDA",
            "price": 118.85,
            "volume": -5,
            "timestamp": "2024-10-02T09:35:12Z"
        });
        assert_eq!(build(&raw).unwrap_err().field, "volume");
    }

    #[test]
    fn test_malformed_timestamp_rejected() {
        // The truncated form from upstream sample data must not pass
        let raw = json!({
            "id": "5301",
            "signal": "BUY",
            "timestamp": "2024-10-02T09:21:Z"
        });
        assert_eq!(build(&raw).unwrap_err().field, "timestamp");
    }

    #[test]
    fn test_unknown_signal_rejected() {
        let raw = json!({
            "id": "5301",
            "signal": "SHORT",
            "timestamp": "2024-10-02T09:21:00Z"
        });
        assert_eq!(build(&raw).unwrap_err().field, "signal");
    }

    #[test]
    fn test_risk_score_out_of_range() {
        let raw = json!({
            "trade_id": "5301",
            "risk_score": 1.5,
            "timestamp": "2024-10-02T09:53:34Z"
        });
        assert_eq!(build(&raw).unwrap_err().field, "risk_score");
    }

    #[test]
    fn test_empty_symbol_rejected() {
        let raw = json!({
            "symbol": "",
            "price": 118.85,
            "volume": 100,
            "timestamp": "2024-10-02T09:35:12Z"
        });
        assert_eq!(build(&raw).unwrap_err().field, "symbol");
    }

    #[test]
    fn test_unrecognized_shape_rejected() {
        let raw = json!({"foo": "bar"});
        assert_eq!(build(&raw).unwrap_err().field, "$");

        let raw = json!([1, 2, 3]);
        assert_eq!(build(&raw).unwrap_err().field, "$");
    }

    #[test]
    fn test_canonical_serialization() {
        let raw = json!({
            "symbol": "NVDA",
            "price": 118.85,
            "volume": 211909315u64,
            "timestamp": "2024-10-02T09:35:12Z"
        });
        let event = build(&raw).unwrap();

        let json_str = serde_json::to_string(&event).unwrap();
        assert!(json_str.contains("\"kind\":\"marketTick\""));
        assert!(json_str.contains("NVDA"));

        let back: CanonicalEvent = serde_json::from_str(&json_str).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn test_risk_evaluation_camel_case_wire_form() {
        let event = CanonicalEvent::RiskEvaluation {
            trade_id: "5301".to_string(),
            risk_score: 0.85,
            timestamp: "2024-10-02T09:53:34Z".to_string(),
        };

        let json_str = serde_json::to_string(&event).unwrap();
        assert!(json_str.contains("tradeId"));
        assert!(json_str.contains("riskScore"));
    }

    #[test]
    fn test_signal_wire_form() {
        assert_eq!(Signal::parse("BUY"), Some(Signal::Buy));
        assert_eq!(Signal::parse("buy"), None);
        assert_eq!(
            serde_json::to_string(&Signal::Hold).unwrap(),
            "\"HOLD\""
        );
    }
}
