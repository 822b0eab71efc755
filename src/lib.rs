//! # Tickpipe
//!
//! An ingestion-and-persistence pipeline for market events: market ticks,
//! trade signals, and risk evaluations.
//!
//! ## Architecture
//!
//! ```text
//! Client -> HTTP API -> Intake Stream -> Worker -> Dispatcher -> Sinks
//!                                                                 ├─ stream
//!                                                                 ├─ documents
//!                                                                 └─ relational
//! ```
//!
//! ## Modules
//!
//! - [`envelope`]: Validation and normalization of inbound records
//! - [`dispatcher`]: Routing of canonical events to their durable sink
//! - [`sinks`]: Sink trait and the three built-in sink backends
//! - [`config`]: TOML configuration with environment substitution
//! - [`dlq`]: Parking lot for events that could not be delivered
//! - [`shutdown`]: Graceful shutdown coordination

pub mod config;
pub mod dispatcher;
pub mod dlq;
pub mod envelope;
pub mod shutdown;
pub mod sinks;

// Re-export commonly used types at crate root
pub use dispatcher::{Dispatcher, SinkResult};
pub use envelope::{build, CanonicalEvent, ValidationError};
pub use sinks::{ErrorKind, Sink, SinkAck, SinkError};

/// Redis stream name for inbound events awaiting dispatch
pub const INTAKE_STREAM_NAME: &str = "tickpipe:intake";

/// Default consumer group name
pub const DEFAULT_CONSUMER_GROUP: &str = "tickpipe_workers";
