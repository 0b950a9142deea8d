//! HTTP request handling: maps `POST /check` onto [`RateLimiter::check`]
//! and reports node health.
//!
//! [`RateLimiter::check`]: crate::ratelimit::RateLimiter::check

mod handlers;
mod server;

pub use handlers::{router, AppState, CheckRequest, HealthResponse};
pub use server::HttpServer;

/// Header carrying the limit that applied.
pub const HEADER_LIMIT: &str = "x-ratelimit-limit";
/// Header carrying the requests left in the window.
pub const HEADER_REMAINING: &str = "x-ratelimit-remaining";
/// Header carrying seconds until the oldest request leaves the window.
pub const HEADER_RESET: &str = "x-ratelimit-reset";
