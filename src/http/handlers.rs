//! Request handlers.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use super::{HEADER_LIMIT, HEADER_REMAINING, HEADER_RESET};
use crate::config::RatewardenConfig;
use crate::error::RatewardenError;
use crate::ratelimit::{RateLimitResult, RateLimiter};
use crate::store::StateStore;

/// State shared by every handler.
#[derive(Clone)]
pub struct AppState {
    limiter: Arc<RateLimiter>,
    store: Arc<dyn StateStore>,
    node_id: Arc<str>,
    address: Arc<str>,
    default_limit: i64,
    default_window_ms: i64,
    store_timeout: Duration,
    retry_jitter_ms: u64,
}

impl AppState {
    /// Build handler state from the service configuration.
    pub fn new(
        limiter: Arc<RateLimiter>,
        store: Arc<dyn StateStore>,
        config: &RatewardenConfig,
    ) -> Self {
        Self {
            limiter,
            store,
            node_id: Arc::from(config.node.node_id.as_str()),
            address: Arc::from(config.advertise_addr()),
            default_limit: config.rate_limiting.default_limit,
            default_window_ms: config.rate_limiting.default_window_ms,
            store_timeout: config.server.store_timeout(),
            retry_jitter_ms: config.rate_limiting.retry_jitter_ms,
        }
    }

    /// This node's identifier.
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    fn retry_after_secs(&self, result: &RateLimitResult) -> u64 {
        let jitter = if self.retry_jitter_ms > 0 {
            rand::thread_rng().gen_range(0..=self.retry_jitter_ms)
        } else {
            0
        };
        (result.retry_after_ms + jitter).div_ceil(1_000)
    }
}

/// Build the router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/check", post(check_handler))
        .route("/health", get(health_handler))
        .with_state(state)
}

/// Body of `POST /check`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckRequest {
    /// The rate-limited key
    pub key: String,
    /// Falls back to the node's default limit when omitted
    #[serde(default)]
    pub limit: Option<i64>,
    /// Falls back to the node's default window when omitted
    #[serde(default)]
    pub window_ms: Option<i64>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    allowed: bool,
    error: String,
}

/// Body of `GET /health`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    /// This node's identifier
    pub node_id: String,
    /// The advertised address
    pub address: String,
    /// `up` or `down`
    pub status: String,
    /// RFC 3339 timestamp of the check
    pub timestamp: String,
}

/// Decide one request.
///
/// 200 when admitted, 429 when limited, 400 on bad input. A store failure or
/// timeout answers 503, any other error 500; neither admits the request.
async fn check_handler(
    State(state): State<AppState>,
    Json(request): Json<CheckRequest>,
) -> Response {
    let limit = request.limit.unwrap_or(state.default_limit);
    let window_ms = request.window_ms.unwrap_or(state.default_window_ms);

    let checked = tokio::time::timeout(
        state.store_timeout,
        state.limiter.check(&request.key, limit, window_ms),
    )
    .await;

    match checked {
        Ok(Ok(result)) => decision_response(&state, result),
        Ok(Err(RatewardenError::Validation(message))) => {
            debug!(key = %request.key, error = %message, "Rejected malformed check");
            error_response(StatusCode::BAD_REQUEST, message)
        }
        Ok(Err(e)) if e.is_infrastructure() => {
            error!(key = %request.key, error = %e, "Store failure, failing closed");
            error_response(StatusCode::SERVICE_UNAVAILABLE, e.to_string())
        }
        Ok(Err(e)) => {
            error!(key = %request.key, error = %e, "Check failed, failing closed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
        Err(_) => {
            warn!(
                key = %request.key,
                timeout_ms = state.store_timeout.as_millis() as u64,
                "Store call timed out, failing closed"
            );
            error_response(
                StatusCode::SERVICE_UNAVAILABLE,
                "rate limit store timed out".to_string(),
            )
        }
    }
}

fn decision_response(state: &AppState, result: RateLimitResult) -> Response {
    let mut headers = HeaderMap::new();
    headers.insert(HEADER_LIMIT, HeaderValue::from(result.limit));
    headers.insert(HEADER_REMAINING, HeaderValue::from(result.remaining));
    headers.insert(HEADER_RESET, HeaderValue::from(result.reset_after_secs()));

    let status = if result.allowed {
        StatusCode::OK
    } else {
        headers.insert(
            header::RETRY_AFTER,
            HeaderValue::from(state.retry_after_secs(&result)),
        );
        StatusCode::TOO_MANY_REQUESTS
    };

    (status, headers, Json(result)).into_response()
}

fn error_response(status: StatusCode, error: String) -> Response {
    (
        status,
        Json(ErrorBody {
            allowed: false,
            error,
        }),
    )
        .into_response()
}

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let up = matches!(
        tokio::time::timeout(state.store_timeout, state.store.ping()).await,
        Ok(Ok(()))
    );

    let status = if up {
        StatusCode::OK
    } else {
        warn!(node_id = %state.node_id, "Health check failed: store unreachable");
        StatusCode::SERVICE_UNAVAILABLE
    };

    let body = HealthResponse {
        node_id: state.node_id.to_string(),
        address: state.address.to_string(),
        status: if up { "up" } else { "down" }.to_string(),
        timestamp: chrono::Utc::now().to_rfc3339(),
    };

    (status, Json(body))
}
