//! Route definitions and router setup
//!
//! Liveness and readiness probes plus the shared middleware stack.

use crate::error::{ApiResult, AppError};
use crate::state::SharedState;
use axum::{
    error_handling::HandleErrorLayer,
    extract::{Request, State},
    http::StatusCode,
    routing::get,
    Json, Router,
};
use std::time::Duration;
use tower::{
    buffer::BufferLayer, limit::RateLimitLayer, load_shed::error::Overloaded,
    load_shed::LoadShedLayer, BoxError, ServiceBuilder,
};
use tower_http::{
    catch_panic::CatchPanicLayer,
    cors::{Any, CorsLayer},
    request_id::MakeRequestUuid,
    timeout::TimeoutLayer,
    trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer},
    ServiceBuilderExt,
};
use tracing::{warn, Level};

/// Requests admitted per second across the whole server
pub const RATE_LIMIT_PER_SECOND: u64 = 100;

/// Requests allowed to wait for a rate-limit slot before new ones get 429
const RATE_LIMIT_QUEUE: usize = 1024;

/// Create the application router with all routes and middleware
pub fn create_router(state: SharedState) -> Router {
    let timeout = Duration::from_secs(state.settings.server.timeout_secs);

    let routes = Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .with_state(state);

    with_middleware(routes, timeout, RATE_LIMIT_PER_SECOND)
}

fn with_middleware(routes: Router, timeout: Duration, per_second: u64) -> Router {
    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
        .on_request(DefaultOnRequest::new().level(Level::INFO))
        .on_response(DefaultOnResponse::new().level(Level::INFO));

    let middleware = ServiceBuilder::new()
        .set_x_request_id(MakeRequestUuid)
        .layer(trace_layer)
        .layer(TimeoutLayer::with_status_code(StatusCode::REQUEST_TIMEOUT, timeout))
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any))
        .propagate_x_request_id()
        .layer(CatchPanicLayer::new());

    // One limiter for the whole server rather than one per route
    let rate_limited = ServiceBuilder::new()
        .layer(HandleErrorLayer::new(handle_middleware_error))
        .layer(LoadShedLayer::new())
        .layer(BufferLayer::<Request>::new(RATE_LIMIT_QUEUE))
        .layer(RateLimitLayer::new(per_second, Duration::from_secs(1)))
        .service(routes);

    Router::new().fallback_service(rate_limited).layer(middleware)
}

async fn handle_middleware_error(err: BoxError) -> AppError {
    if err.is::<Overloaded>() {
        warn!("Rate limit queue full, rejecting request");
        AppError::RateLimited
    } else {
        AppError::Internal(err.to_string())
    }
}

/// Liveness; never touches the database
async fn health_check() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "success": true,
        "message": "Server is running fine.",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// Readiness; round-trips to the database through the shared pool
async fn readiness_check(State(state): State<SharedState>) -> ApiResult<Json<serde_json::Value>> {
    let handle = state.connections.db()?;
    let client = handle.get().await?;
    client.query_one("SELECT 1", &[]).await?;

    let limits = handle.limits();
    Ok(Json(serde_json::json!({
        "success": true,
        "environment": state.settings.environment.as_str(),
        "database": handle.dsn().redacted(),
        "pool": {
            "max_open": limits.max_open,
            "max_idle": limits.max_idle,
            "max_lifetime_secs": limits.max_lifetime.as_secs(),
        }
    })))
}
