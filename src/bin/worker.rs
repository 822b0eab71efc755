//! Tickpipe Worker - Event Dispatch Engine
//!
//! The worker consumes canonical events from the intake stream and hands
//! each one to the Dispatcher, which routes it to its durable sink. The
//! dispatcher itself never retries; this worker owns the failure policy:
//! transient sink failures are re-queued with backoff up to a cap, and
//! permanent failures are parked in the dead letter queue.
//!
//! ## Configuration
//!
//! Environment variables:
//! - `REDIS_URL`: Redis connection string (overrides config file)
//! - `DATABASE_URL`: Postgres connection string for the relational sink
//! - `TICKPIPE_WORKER_NAME`: Unique worker identifier (default: hostname or UUID)
//! - `TICKPIPE_CONSUMER_GROUP`: Consumer group name (default: "tickpipe_workers")
//! - `RUST_LOG`: Logging level (default: "info")

use deadpool_redis::redis::streams::{StreamReadOptions, StreamReadReply};
use deadpool_redis::redis::{cmd, AsyncCommands, Value as RedisValue};
use deadpool_redis::{Config, Runtime};
use sqlx::postgres::PgPoolOptions;
use std::collections::HashMap;
use std::env;
use std::time::Duration;
use tracing::{debug, error, info, warn};

// Import from the tickpipe library
use tickpipe::config::TickpipeConfig;
use tickpipe::dispatcher::Dispatcher;
use tickpipe::dlq::DeadLetterQueue;
use tickpipe::envelope::CanonicalEvent;
use tickpipe::shutdown::ShutdownSignal;
use tickpipe::sinks::ErrorKind;
use tickpipe::{DEFAULT_CONSUMER_GROUP, INTAKE_STREAM_NAME};

/// Delivery attempts before a transiently failing event is parked
const MAX_RETRIES: u32 = 3;

/// Base delay for exponential backoff (in milliseconds)
const RETRY_BASE_DELAY_MS: u64 = 1000;

/// Idle time threshold for claiming pending messages (in milliseconds)
const PENDING_IDLE_THRESHOLD_MS: u64 = 30000;

/// Get the worker name from environment, config, or generate one.
fn get_worker_name(config: &TickpipeConfig) -> String {
    if let Ok(name) = env::var("TICKPIPE_WORKER_NAME") {
        return name;
    }

    if let Some(name) = &config.worker.name {
        return name.clone();
    }

    // Try hostname
    if let Ok(hostname) = hostname::get() {
        if let Some(name) = hostname.to_str() {
            return format!("worker-{}", name);
        }
    }

    // Fallback to UUID
    format!("worker-{}", uuid::Uuid::new_v4())
}

/// Get the consumer group name from environment or config.
fn get_consumer_group(config: &TickpipeConfig) -> String {
    env::var("TICKPIPE_CONSUMER_GROUP").unwrap_or_else(|_| config.worker.consumer_group.clone())
}

/// Extract a string field from Redis stream data.
fn get_str_field(map: &HashMap<String, RedisValue>, key: &str) -> Option<String> {
    map.get(key).and_then(|val| match val {
        RedisValue::BulkString(bytes) => {
            let s = String::from_utf8_lossy(bytes).to_string();
            if s.is_empty() {
                None
            } else {
                Some(s)
            }
        }
        RedisValue::SimpleString(s) => {
            if s.is_empty() {
                None
            } else {
                Some(s.clone())
            }
        }
        _ => None,
    })
}

/// Rebuild the canonical envelope from an intake stream entry.
fn parse_envelope(map: &HashMap<String, RedisValue>) -> Option<CanonicalEvent> {
    let payload = get_str_field(map, "payload")?;

    match serde_json::from_str::<CanonicalEvent>(&payload) {
        Ok(event) => Some(event),
        Err(e) => {
            warn!(error = %e, "Intake entry payload is not a canonical envelope");
            None
        }
    }
}

/// Get retry count from entry metadata, defaulting to 0.
fn get_retry_count(map: &HashMap<String, RedisValue>) -> u32 {
    get_str_field(map, "retryCount")
        .and_then(|s| s.parse().ok())
        .unwrap_or(0)
}

/// Calculate exponential backoff delay.
fn calculate_backoff(retry_count: u32) -> Duration {
    let delay_ms = RETRY_BASE_DELAY_MS * (1 << retry_count.min(5)); // Cap at 32 seconds
    Duration::from_millis(delay_ms)
}

/// Re-queue an event on the intake stream with an incremented retry count.
async fn requeue_event(
    conn: &mut deadpool_redis::Connection,
    event: &CanonicalEvent,
    retry_count: u32,
    correlation_id: Option<&str>,
) -> Result<String, Box<dyn std::error::Error + Send + Sync>> {
    let payload = serde_json::to_string(event)?;

    let id: String = cmd("XADD")
        .arg(INTAKE_STREAM_NAME)
        .arg("*")
        .arg("kind")
        .arg(event.kind().as_str())
        .arg("routingKey")
        .arg(event.routing_key())
        .arg("payload")
        .arg(payload)
        .arg("retryCount")
        .arg(retry_count + 1)
        .arg("correlationId")
        .arg(correlation_id.unwrap_or(""))
        .query_async(conn)
        .await?;

    Ok(id)
}

/// Claim pending messages that have been idle for too long.
/// Returns the number of messages claimed.
#[allow(clippy::type_complexity)]
async fn claim_pending_messages(
    conn: &mut deadpool_redis::Connection,
    consumer_group: &str,
    worker_name: &str,
) -> Result<usize, Box<dyn std::error::Error + Send + Sync>> {
    // XAUTOCLAIM key group consumer min-idle-time start [COUNT count]
    let result: Result<(String, Vec<(String, HashMap<String, RedisValue>)>), _> = cmd("XAUTOCLAIM")
        .arg(INTAKE_STREAM_NAME)
        .arg(consumer_group)
        .arg(worker_name)
        .arg(PENDING_IDLE_THRESHOLD_MS)
        .arg("0-0") // Start from beginning
        .arg("COUNT")
        .arg(10) // Claim up to 10 messages at a time
        .query_async(conn)
        .await;

    match result {
        Ok((_, messages)) => {
            let count = messages.len();
            if count > 0 {
                info!(
                    count = count,
                    "Claimed pending messages from previous workers"
                );
            }
            Ok(count)
        }
        Err(e) => {
            // XAUTOCLAIM might not be available in older Redis versions
            debug!(error = %e, "XAUTOCLAIM failed, skipping pending recovery");
            Ok(0)
        }
    }
}

/// Outcome of handling a single intake entry.
enum EntryOutcome {
    Delivered,
    Requeued,
    Parked,
}

/// Dispatch one envelope and apply the worker's failure policy.
async fn handle_entry(
    conn: &mut deadpool_redis::Connection,
    dispatcher: &Dispatcher,
    dlq: &DeadLetterQueue,
    entry_id: &str,
    event: &CanonicalEvent,
    retry_count: u32,
    correlation_id: Option<&str>,
) -> EntryOutcome {
    let result = dispatcher.dispatch(event).await;

    if result.accepted {
        debug!(
            id = %entry_id,
            sink = %result.sink_id,
            receipt = ?result.receipt,
            "Event delivered"
        );
        return EntryOutcome::Delivered;
    }

    let error_kind = result.error_kind().unwrap_or(ErrorKind::Permanent);
    let error_message = result
        .error
        .as_ref()
        .map(|e| e.to_string())
        .unwrap_or_else(|| "unknown sink failure".to_string());

    if error_kind == ErrorKind::Transient && retry_count < MAX_RETRIES {
        let backoff = calculate_backoff(retry_count);
        debug!(
            id = %entry_id,
            retry_count = retry_count,
            backoff_ms = backoff.as_millis(),
            "Transient sink failure, re-queueing with backoff"
        );
        tokio::time::sleep(backoff).await;

        match requeue_event(conn, event, retry_count, correlation_id).await {
            Ok(requeue_id) => {
                info!(
                    id = %entry_id,
                    requeue_id = %requeue_id,
                    retry_count = retry_count + 1,
                    "Event re-queued"
                );
                return EntryOutcome::Requeued;
            }
            Err(e) => {
                error!(id = %entry_id, error = %e, "Failed to re-queue event, parking instead");
            }
        }
    }

    if error_kind == ErrorKind::Transient {
        warn!(
            id = %entry_id,
            retry_count = retry_count,
            max_retries = MAX_RETRIES,
            "Retry budget exhausted, parking event"
        );
    } else {
        warn!(
            id = %entry_id,
            sink = %result.sink_id,
            "Permanent sink failure, parking event"
        );
    }

    if let Err(e) = dlq
        .park(event, error_kind, &error_message, retry_count, Some(entry_id))
        .await
    {
        error!(id = %entry_id, error = %e, "Failed to park event in DLQ");
    }

    EntryOutcome::Parked
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt::init();
    dotenvy::dotenv().ok();

    // Load configuration (falls back to defaults when no file is present)
    let config = match TickpipeConfig::load() {
        Ok(config) => config,
        Err(e) => {
            warn!(error = %e, "Failed to load config, using defaults");
            TickpipeConfig::default()
        }
    };

    let worker_name = get_worker_name(&config);
    let consumer_group = get_consumer_group(&config);
    let redis_url = env::var("REDIS_URL").unwrap_or_else(|_| config.redis.url.clone());
    let database_url = config
        .database_url()
        .expect("DATABASE_URL must be set for the relational sink");

    info!(
        worker_name = %worker_name,
        consumer_group = %consumer_group,
        "Tickpipe worker starting"
    );

    // Create Redis connection pool
    let cfg = Config::from_url(redis_url);
    let redis_pool = cfg
        .create_pool(Some(Runtime::Tokio1))
        .expect("Failed to create Redis pool");

    // Create Postgres pool lazily so a cold database surfaces as a
    // classified sink error instead of a startup crash
    let pg_pool = PgPoolOptions::new()
        .max_connections(config.sinks.relational.max_connections)
        .connect_lazy(&database_url)
        .expect("Invalid DATABASE_URL");

    // Build the dispatcher over the configured sink destinations
    let dispatcher = config.build_dispatcher(redis_pool.clone(), pg_pool);

    info!(
        tick_stream = %config.sinks.stream.stream,
        document_table = %config.sinks.document.table,
        "Dispatcher configured"
    );

    // Create consumer group (if not exists)
    let mut conn = redis_pool
        .get()
        .await
        .map_err(|e| Box::new(e) as Box<dyn std::error::Error>)?;

    let create_group_result: Result<(), _> = cmd("XGROUP")
        .arg("CREATE")
        .arg(INTAKE_STREAM_NAME)
        .arg(&consumer_group)
        .arg("$")
        .arg("MKSTREAM")
        .query_async(&mut conn)
        .await;

    match create_group_result {
        Ok(_) => info!(
            consumer_group = %consumer_group,
            "Created consumer group"
        ),
        Err(e) => {
            if e.to_string().contains("BUSYGROUP") {
                info!(
                    consumer_group = %consumer_group,
                    "Consumer group already exists"
                );
            } else {
                error!(error = %e, "Failed to create consumer group");
                return Err(Box::new(e) as Box<dyn std::error::Error>);
            }
        }
    }

    // Create the dead letter queue
    let dlq = DeadLetterQueue::new(redis_pool.clone());

    // Claim any pending messages from previous workers
    if let Err(e) = claim_pending_messages(&mut conn, &consumer_group, &worker_name).await {
        warn!(error = %e, "Failed to claim pending messages");
    }

    drop(conn);

    // Setup graceful shutdown
    let shutdown = ShutdownSignal::new();
    let mut shutdown_receiver = shutdown.subscribe();

    // Processing loop
    info!(
        stream = %INTAKE_STREAM_NAME,
        "Listening for events"
    );

    let mut events_delivered: u64 = 0;
    let mut events_requeued: u64 = 0;
    let mut events_parked: u64 = 0;
    let mut shutting_down = false;

    loop {
        // Check for shutdown signal (non-blocking)
        if shutdown_receiver.try_recv().is_ok() {
            info!("Shutdown signal received, finishing current batch...");
            shutting_down = true;
        }

        if shutting_down {
            info!(
                events_delivered = events_delivered,
                events_requeued = events_requeued,
                events_parked = events_parked,
                "Worker shutting down gracefully"
            );
            break;
        }

        let mut conn = match redis_pool.get().await {
            Ok(c) => c,
            Err(e) => {
                error!(error = %e, "Failed to get Redis connection");
                tokio::time::sleep(Duration::from_secs(5)).await;
                continue;
            }
        };

        let opts = StreamReadOptions::default()
            .group(&consumer_group, &worker_name)
            .block(2000)
            .count(10); // Process up to 10 events per batch

        // Use select to handle shutdown during blocking read
        let result: Result<StreamReadReply, _> = tokio::select! {
            _ = shutdown.wait() => {
                info!("Shutdown signal received during read, finishing...");
                shutting_down = true;
                continue;
            }
            result = conn.xread_options(&[INTAKE_STREAM_NAME], &[">"], &opts) => result,
        };

        match result {
            Ok(reply) => {
                for stream_key in reply.keys {
                    for element in stream_key.ids {
                        let id = element.id.clone();

                        // Rebuild the envelope
                        let event = match parse_envelope(&element.map) {
                            Some(e) => e,
                            None => {
                                warn!(id = %id, "Skipping unparseable intake entry");
                                // Still ACK to avoid reprocessing
                                let _: Result<(), _> =
                                    conn.xack(INTAKE_STREAM_NAME, &consumer_group, &[&id]).await;
                                continue;
                            }
                        };

                        let retry_count = get_retry_count(&element.map);
                        let correlation_id = get_str_field(&element.map, "correlationId");

                        debug!(
                            id = %id,
                            kind = %event.kind(),
                            routing_key = %event.routing_key(),
                            retry_count = retry_count,
                            "Processing event"
                        );

                        let outcome = handle_entry(
                            &mut conn,
                            &dispatcher,
                            &dlq,
                            &id,
                            &event,
                            retry_count,
                            correlation_id.as_deref(),
                        )
                        .await;

                        match outcome {
                            EntryOutcome::Delivered => events_delivered += 1,
                            EntryOutcome::Requeued => events_requeued += 1,
                            EntryOutcome::Parked => events_parked += 1,
                        }

                        // ACK the entry; failed events live on in the
                        // re-queue or the DLQ, never in the pending list
                        let ack_result: Result<(), _> =
                            conn.xack(INTAKE_STREAM_NAME, &consumer_group, &[&id]).await;

                        if let Err(e) = ack_result {
                            error!(id = %id, error = %e, "Failed to ACK message");
                        }
                    }
                }
            }
            Err(e) => {
                let err_str = e.to_string();
                // Ignore timeout/nil errors (normal when no messages)
                if !err_str.contains("timed out") && !err_str.contains("response was nil") {
                    warn!(error = %e, "Stream read error");
                }
            }
        }

        // Periodic stats (every 100 deliveries)
        if events_delivered > 0 && events_delivered.is_multiple_of(100) {
            info!(
                events_delivered = events_delivered,
                events_requeued = events_requeued,
                events_parked = events_parked,
                "Worker statistics"
            );
        }
    }

    info!("Worker shutdown complete");
    Ok(())
}
