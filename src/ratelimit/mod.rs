//! Sliding-window rate limiting.

mod limiter;
mod window;

pub use limiter::{RateLimitResult, RateLimiter, MAX_WINDOW_MS};
pub use window::{SlidingWindow, WindowOp, WindowOutcome, SLIDING_WINDOW_SCRIPT};
