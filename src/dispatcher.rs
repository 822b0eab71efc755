//! Sink dispatcher - the routing core of tickpipe.
//!
//! The [`Dispatcher`] hands a canonical event to exactly one durable sink,
//! selected by event kind:
//!
//! ```text
//! Kind            | Sink
//! ----------------|-------------------
//! marketTick      | StreamSink
//! tradeSignal     | DocumentStoreSink
//! riskEvaluation  | RelationalSink
//! ```
//!
//! # Architecture
//!
//! ```text
//! CanonicalEvent (kind: "marketTick")
//!     │
//!     ▼
//! ┌─────────────────────────────────────┐
//! │           DISPATCHER                │
//! │                                     │
//! │  1. Select sink by kind             │
//! │  2. Single write attempt            │
//! │  3. Classify failure, never panic   │
//! └─────────────────────────────────────┘
//!     │
//!     ▼
//! SinkResult { accepted, sink_id, receipt?, error? }
//! ```
//!
//! The dispatcher guarantees at most one write attempt per call and never
//! retries; transient failures are surfaced in the result for the caller
//! to act on. No error crosses the dispatch boundary as a panic or an Err.
//!
//! # Example
//!
//! ```rust,ignore
//! use tickpipe::{Dispatcher, envelope};
//! use std::sync::Arc;
//!
//! let dispatcher = Dispatcher::new(stream_sink, document_sink, relational_sink);
//!
//! let event = envelope::build(&raw)?;
//! let result = dispatcher.dispatch(&event).await;
//! if !result.accepted {
//!     // result.error carries the transient/permanent classification
//! }
//! ```

use crate::envelope::{CanonicalEvent, EventKind};
use crate::sinks::{ErrorKind, Sink, SinkError};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Outcome of dispatching one event.
///
/// `accepted` is true iff the selected sink acknowledged the write. On
/// failure `error` carries the classified [`SinkError`]; nothing is ever
/// silently dropped.
#[derive(Debug)]
pub struct SinkResult {
    /// Whether the sink acknowledged the write
    pub accepted: bool,

    /// Identifier of the sink that was selected for this event
    pub sink_id: String,

    /// Opaque receipt from the sink on success
    pub receipt: Option<String>,

    /// Classified failure, present iff `accepted` is false
    pub error: Option<SinkError>,
}

impl SinkResult {
    /// Failure classification, if the write failed.
    pub fn error_kind(&self) -> Option<ErrorKind> {
        self.error.as_ref().map(|e| e.kind())
    }

    /// True if the write failed and the caller may retry it.
    pub fn is_transient_failure(&self) -> bool {
        self.error_kind() == Some(ErrorKind::Transient)
    }
}

/// Routes canonical events to their durable sink.
///
/// Sink handles are injected at construction and owned elsewhere; the
/// dispatcher holds no other state and keeps nothing between calls, so
/// concurrent dispatches are independent.
///
/// # Thread Safety
///
/// Designed to be wrapped in `Arc` for shared access across async tasks.
pub struct Dispatcher {
    stream: Arc<dyn Sink>,
    documents: Arc<dyn Sink>,
    relational: Arc<dyn Sink>,
}

impl Dispatcher {
    /// Create a dispatcher over the three sink roles.
    pub fn new(
        stream: Arc<dyn Sink>,
        documents: Arc<dyn Sink>,
        relational: Arc<dyn Sink>,
    ) -> Self {
        Self {
            stream,
            documents,
            relational,
        }
    }

    /// The sink an event kind routes to.
    fn sink_for(&self, kind: EventKind) -> &Arc<dyn Sink> {
        match kind {
            EventKind::MarketTick => &self.stream,
            EventKind::TradeSignal => &self.documents,
            EventKind::RiskEvaluation => &self.relational,
        }
    }

    /// Identifier of the sink an event kind routes to.
    pub fn sink_id_for(&self, kind: EventKind) -> &str {
        self.sink_for(kind).id()
    }

    /// Dispatch an event to its sink.
    ///
    /// Exactly one write attempt is made against exactly one sink. The
    /// outcome comes back as a [`SinkResult`]; sink failures are classified
    /// and embedded in the result rather than returned as an `Err`.
    pub async fn dispatch(&self, event: &CanonicalEvent) -> SinkResult {
        let kind = event.kind();
        let sink = self.sink_for(kind);

        debug!(
            kind = %kind,
            sink = sink.id(),
            routing_key = %event.routing_key(),
            "Dispatching event"
        );

        match sink.write(event).await {
            Ok(ack) => {
                info!(
                    kind = %kind,
                    sink = sink.id(),
                    receipt = ?ack.receipt,
                    "Event accepted by sink"
                );

                SinkResult {
                    accepted: true,
                    sink_id: ack.sink_id,
                    receipt: ack.receipt,
                    error: None,
                }
            }
            Err(e) => {
                warn!(
                    kind = %kind,
                    sink = sink.id(),
                    error_kind = %e.kind(),
                    error = %e,
                    "Sink write failed"
                );

                SinkResult {
                    accepted: false,
                    sink_id: sink.id().to_string(),
                    receipt: None,
                    error: Some(e),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::Signal;
    use crate::sinks::SinkAck;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Counts writes; optionally fails every one of them.
    struct RecordingSink {
        id: &'static str,
        writes: AtomicUsize,
        fail_with: Option<fn() -> SinkError>,
    }

    impl RecordingSink {
        fn accepting(id: &'static str) -> Arc<Self> {
            Arc::new(Self {
                id,
                writes: AtomicUsize::new(0),
                fail_with: None,
            })
        }

        fn failing(id: &'static str, fail_with: fn() -> SinkError) -> Arc<Self> {
            Arc::new(Self {
                id,
                writes: AtomicUsize::new(0),
                fail_with: Some(fail_with),
            })
        }

        fn write_count(&self) -> usize {
            self.writes.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Sink for RecordingSink {
        fn id(&self) -> &str {
            self.id
        }

        async fn write(&self, _event: &CanonicalEvent) -> Result<SinkAck, SinkError> {
            self.writes.fetch_add(1, Ordering::SeqCst);
            match self.fail_with {
                Some(make_error) => Err(make_error()),
                None => Ok(SinkAck::with_receipt(self.id, "ok", "receipt-1")),
            }
        }
    }

    fn tick() -> CanonicalEvent {
        CanonicalEvent::MarketTick {
            symbol: "NVDA".to_string(),
            price: 118.85,
            volume: 211909315,
            timestamp: "2024-10-02T09:35:12Z".to_string(),
        }
    }

    fn signal() -> CanonicalEvent {
        CanonicalEvent::TradeSignal {
            id: "5301".to_string(),
            signal: Signal::Buy,
            timestamp: "2024-10-02T09:21:00Z".to_string(),
        }
    }

    fn risk() -> CanonicalEvent {
        CanonicalEvent::RiskEvaluation {
            trade_id: "5301".to_string(),
            risk_score: 0.85,
            timestamp: "2024-10-02T09:53:34Z".to_string(),
        }
    }

    fn harness() -> (
        Dispatcher,
        Arc<RecordingSink>,
        Arc<RecordingSink>,
        Arc<RecordingSink>,
    ) {
        let stream = RecordingSink::accepting("stream");
        let documents = RecordingSink::accepting("documents");
        let relational = RecordingSink::accepting("relational");
        let dispatcher = Dispatcher::new(
            stream.clone(),
            documents.clone(),
            relational.clone(),
        );
        (dispatcher, stream, documents, relational)
    }

    #[tokio::test]
    async fn test_market_tick_routes_to_stream_only() {
        let (dispatcher, stream, documents, relational) = harness();

        let result = dispatcher.dispatch(&tick()).await;

        assert!(result.accepted);
        assert_eq!(result.sink_id, "stream");
        assert_eq!(result.receipt.as_deref(), Some("receipt-1"));
        assert_eq!(stream.write_count(), 1);
        assert_eq!(documents.write_count(), 0);
        assert_eq!(relational.write_count(), 0);
    }

    #[tokio::test]
    async fn test_trade_signal_routes_to_documents_only() {
        let (dispatcher, stream, documents, relational) = harness();

        let result = dispatcher.dispatch(&signal()).await;

        assert!(result.accepted);
        assert_eq!(result.sink_id, "documents");
        assert_eq!(stream.write_count(), 0);
        assert_eq!(documents.write_count(), 1);
        assert_eq!(relational.write_count(), 0);
    }

    #[tokio::test]
    async fn test_risk_evaluation_routes_to_relational_only() {
        let (dispatcher, stream, documents, relational) = harness();

        let result = dispatcher.dispatch(&risk()).await;

        assert!(result.accepted);
        assert_eq!(result.sink_id, "relational");
        assert_eq!(stream.write_count(), 0);
        assert_eq!(documents.write_count(), 0);
        assert_eq!(relational.write_count(), 1);
    }

    #[tokio::test]
    async fn test_connection_refused_surfaces_as_permanent() {
        let stream = RecordingSink::accepting("stream");
        let documents = RecordingSink::accepting("documents");
        let relational = RecordingSink::failing("relational", || {
            SinkError::Permanent("postgres connection refused".to_string())
        });
        let dispatcher = Dispatcher::new(stream, documents, relational.clone());

        let result = dispatcher.dispatch(&risk()).await;

        assert!(!result.accepted);
        assert_eq!(result.sink_id, "relational");
        assert_eq!(result.error_kind(), Some(ErrorKind::Permanent));
        assert!(!result.is_transient_failure());
        assert_eq!(relational.write_count(), 1);
    }

    #[tokio::test]
    async fn test_transient_failure_is_reported_not_retried() {
        let stream = RecordingSink::failing("stream", || {
            SinkError::Transient("redis pool timeout".to_string())
        });
        let documents = RecordingSink::accepting("documents");
        let relational = RecordingSink::accepting("relational");
        let dispatcher = Dispatcher::new(stream.clone(), documents, relational);

        let result = dispatcher.dispatch(&tick()).await;

        assert!(!result.accepted);
        assert!(result.is_transient_failure());
        // single attempt, the caller owns retry policy
        assert_eq!(stream.write_count(), 1);
    }

    #[tokio::test]
    async fn test_each_dispatch_writes_exactly_once() {
        let (dispatcher, stream, _, _) = harness();

        for _ in 0..5 {
            dispatcher.dispatch(&tick()).await;
        }

        assert_eq!(stream.write_count(), 5);
    }
}
