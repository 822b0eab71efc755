use axum::{
    extract::{Request, State},
    http::{header, HeaderMap, StatusCode},
    middleware::{self, Next},
    response::{Json, Response},
    routing::{get, post},
    Router,
};
use chrono::Utc;
use deadpool_redis::redis::cmd;
use deadpool_redis::{Config, Pool, Runtime};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::env;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

// Import from the tickpipe library
use tickpipe::envelope;
use tickpipe::INTAKE_STREAM_NAME;

/// Application metrics
struct Metrics {
    events_received: AtomicU64,
    events_rejected: AtomicU64,
    start_time: Instant,
}

impl Metrics {
    fn new() -> Self {
        Self {
            events_received: AtomicU64::new(0),
            events_rejected: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    fn increment_received(&self) {
        self.events_received.fetch_add(1, Ordering::Relaxed);
    }

    fn increment_rejected(&self) {
        self.events_rejected.fetch_add(1, Ordering::Relaxed);
    }

    fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

#[derive(Clone)]
struct AppState {
    redis_pool: Pool,
    api_key: String,
    metrics: Arc<Metrics>,
}

/// Response returned when an event is accepted into the intake stream.
#[derive(Debug, Serialize, Deserialize)]
struct EventResponse {
    /// Intake stream id assigned to the event
    id: String,
    /// Status of the request
    status: String,
    /// Kind the envelope builder inferred
    kind: String,
    /// Correlation ID for tracing
    #[serde(rename = "correlationId")]
    correlation_id: String,
}

#[tokio::main]
async fn main() {
    // 1. Initialize Logging
    tracing_subscriber::fmt::init();
    dotenvy::dotenv().ok();

    // 2. Setup Configuration
    let redis_url = env::var("REDIS_URL").expect("REDIS_URL must be set");
    let api_key = env::var("TICKPIPE_API_KEY").unwrap_or_else(|_| {
        warn!("TICKPIPE_API_KEY not set, defaulting to 'dev-key'. DO NOT USE IN PRODUCTION.");
        "dev-key".to_string()
    });

    // 3. Setup Redis Pool
    let cfg = Config::from_url(redis_url);
    let pool = cfg
        .create_pool(Some(Runtime::Tokio1))
        .expect("Failed to create Redis pool");

    let app_state = Arc::new(AppState {
        redis_pool: pool,
        api_key,
        metrics: Arc::new(Metrics::new()),
    });

    // 4. Build Router with Auth Middleware
    let app = Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(get_metrics))
        .route("/api/v1/events", post(ingest_event))
        .layer(middleware::from_fn_with_state(
            app_state.clone(),
            auth_middleware,
        ))
        .with_state(app_state);

    // 5. Start Server
    let port = env::var("PORT").unwrap_or_else(|_| "3000".to_string());
    let addr_str = format!("0.0.0.0:{}", port);
    let addr: SocketAddr = addr_str.parse().expect("Invalid address");

    info!("Tickpipe ingest server listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await.unwrap();
    axum::serve(listener, app).await.unwrap();
}

async fn auth_middleware(
    State(state): State<Arc<AppState>>,
    req: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    // Skip auth for health check and metrics
    let path = req.uri().path();
    if path == "/health" || path == "/metrics" {
        return Ok(next.run(req).await);
    }

    let auth_header = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|header| header.to_str().ok());

    match auth_header {
        Some(auth_header) if auth_header.starts_with("Bearer ") => {
            let token = &auth_header[7..];
            if token == state.api_key {
                Ok(next.run(req).await)
            } else {
                warn!("Invalid API Key attempt");
                Err(StatusCode::UNAUTHORIZED)
            }
        }
        _ => {
            warn!("Missing or malformed Authorization header");
            Err(StatusCode::UNAUTHORIZED)
        }
    }
}

async fn health_check(State(state): State<Arc<AppState>>) -> Result<Json<Value>, StatusCode> {
    let mut conn = state.redis_pool.get().await.map_err(|e| {
        error!("Failed to get Redis connection: {}", e);
        StatusCode::INTERNAL_SERVER_ERROR
    })?;

    // Simple PING to check Redis connectivity
    let _: String = cmd("PING").query_async(&mut conn).await.map_err(|e| {
        error!("Redis PING failed: {}", e);
        StatusCode::INTERNAL_SERVER_ERROR
    })?;

    Ok(Json(json!({ "status": "ok", "redis": "connected" })))
}

/// Get metrics endpoint - returns server metrics as JSON
async fn get_metrics(State(state): State<Arc<AppState>>) -> Json<Value> {
    let uptime = state.metrics.uptime_seconds();
    let events_received = state.metrics.events_received.load(Ordering::Relaxed);
    let events_rejected = state.metrics.events_rejected.load(Ordering::Relaxed);

    // Format uptime as human-readable
    let uptime_str = if uptime < 60 {
        format!("{}s", uptime)
    } else if uptime < 3600 {
        format!("{}m {}s", uptime / 60, uptime % 60)
    } else {
        format!("{}h {}m {}s", uptime / 3600, (uptime % 3600) / 60, uptime % 60)
    };

    Json(json!({
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_seconds": uptime,
        "uptime": uptime_str,
        "events": {
            "received": events_received,
            "rejected": events_rejected
        },
        "status": "running"
    }))
}

/// Validate a raw record and append its canonical envelope to the intake
/// stream. Validation failures return 422 naming the offending field and
/// never touch Redis.
async fn ingest_event(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(raw): Json<Value>,
) -> Result<(StatusCode, Json<EventResponse>), (StatusCode, Json<Value>)> {
    debug!("Received raw record: {:?}", raw);

    let event = match envelope::build(&raw) {
        Ok(event) => event,
        Err(e) => {
            state.metrics.increment_rejected();
            warn!(field = %e.field, reason = %e.reason, "Rejected malformed record");
            return Err((
                StatusCode::UNPROCESSABLE_ENTITY,
                Json(json!({
                    "status": "rejected",
                    "error": { "field": e.field, "reason": e.reason }
                })),
            ));
        }
    };

    state.metrics.increment_received();

    // Extract or generate correlation ID
    let correlation_id = headers
        .get("X-Correlation-ID")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    // Server-side receipt timestamp (ISO 8601)
    let received_at = Utc::now().to_rfc3339();

    debug!(
        correlation_id = %correlation_id,
        kind = %event.kind(),
        received_at = %received_at,
        "Event metadata"
    );

    // Get connection from pool
    let mut conn = state.redis_pool.get().await.map_err(|e| {
        error!("Failed to get Redis connection: {}", e);
        internal_error()
    })?;

    // Serialize the canonical envelope for the intake stream
    let payload_str = serde_json::to_string(&event).map_err(|e| {
        error!("Failed to serialize envelope: {}", e);
        internal_error()
    })?;

    // Push to the intake stream (XADD) with metadata
    let id: String = cmd("XADD")
        .arg(INTAKE_STREAM_NAME)
        .arg("*") // Auto-generate ID
        .arg("kind")
        .arg(event.kind().as_str())
        .arg("routingKey")
        .arg(event.routing_key())
        .arg("payload")
        .arg(payload_str)
        .arg("receivedAt")
        .arg(&received_at)
        .arg("correlationId")
        .arg(&correlation_id)
        .query_async(&mut conn)
        .await
        .map_err(|e| {
            error!("Failed to push event to intake stream: {}", e);
            internal_error()
        })?;

    info!(
        id = %id,
        kind = %event.kind(),
        routing_key = %event.routing_key(),
        correlation_id = %correlation_id,
        "Event accepted"
    );

    Ok((
        StatusCode::ACCEPTED,
        Json(EventResponse {
            id,
            status: "accepted".to_string(),
            kind: event.kind().as_str().to_string(),
            correlation_id,
        }),
    ))
}

fn internal_error() -> (StatusCode, Json<Value>) {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "status": "error" })),
    )
}
