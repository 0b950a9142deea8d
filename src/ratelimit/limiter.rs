//! Core rate limiter implementation.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, trace};

use super::window::WindowOp;
use crate::clock::SharedClock;
use crate::config::RateLimitingConfig;
use crate::error::{RatewardenError, Result};
use crate::store::{StateStore, SEQUENCE_KEY_SUFFIX};

/// Longest accepted window: 365 days.
pub const MAX_WINDOW_MS: i64 = 365 * 24 * 60 * 60 * 1_000;

/// Outcome of a single [`RateLimiter::check`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RateLimitResult {
    /// Whether the request was admitted and recorded
    pub allowed: bool,
    /// The limit the check ran against
    pub limit: u64,
    /// In-window requests after this decision
    pub count: u64,
    /// Requests still admissible in the current window
    pub remaining: u64,
    /// Milliseconds until a retry can succeed; 0 when allowed
    pub retry_after_ms: u64,
    /// Milliseconds until the oldest in-window request leaves the window
    pub reset_after_ms: u64,
}

impl RateLimitResult {
    /// `retry_after_ms` rounded up to whole seconds.
    pub fn retry_after_secs(&self) -> u64 {
        self.retry_after_ms.div_ceil(1_000)
    }

    /// `reset_after_ms` rounded up to whole seconds.
    pub fn reset_after_secs(&self) -> u64 {
        self.reset_after_ms.div_ceil(1_000)
    }
}

/// Sliding-window rate limiter over a shared [`StateStore`].
///
/// Holds no counts of its own. Concurrent checks for the same key are not
/// serialized here; the store executes each check indivisibly.
pub struct RateLimiter {
    store: Arc<dyn StateStore>,
    clock: SharedClock,
    default_window_ms: u64,
    ttl_buffer_ms: u64,
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("default_window_ms", &self.default_window_ms)
            .field("ttl_buffer_ms", &self.ttl_buffer_ms)
            .finish()
    }
}

impl RateLimiter {
    /// Create a rate limiter over `store`.
    pub fn new(
        store: Arc<dyn StateStore>,
        clock: SharedClock,
        config: &RateLimitingConfig,
    ) -> Self {
        Self {
            store,
            clock,
            default_window_ms: config.default_window_ms.max(1) as u64,
            ttl_buffer_ms: config.ttl_buffer_ms,
        }
    }

    /// Check `key` against `limit` requests per `window_ms`, recording the
    /// request if it is admitted.
    ///
    /// Exactly one store round-trip; failures are returned as-is without
    /// retrying.
    pub async fn check(&self, key: &str, limit: i64, window_ms: i64) -> Result<RateLimitResult> {
        validate_key(key)?;
        if limit < 0 {
            return Err(RatewardenError::Validation(format!(
                "limit must be >= 0, got {}",
                limit
            )));
        }
        if window_ms <= 0 || window_ms > MAX_WINDOW_MS {
            return Err(RatewardenError::Validation(format!(
                "window_ms must be in 1..={}, got {}",
                MAX_WINDOW_MS, window_ms
            )));
        }

        let limit = limit as u64;
        let window_ms = window_ms as u64;
        let op = WindowOp {
            key: key.to_string(),
            now_ms: self.clock.now_ms(),
            limit,
            window_ms,
            ttl_ms: window_ms.saturating_add(self.ttl_buffer_ms),
        };

        trace!(key = %key, limit, window_ms, "Checking rate limit");

        let outcome = self.store.apply_window(&op).await?;

        let result = RateLimitResult {
            allowed: outcome.allowed,
            limit,
            count: outcome.count,
            remaining: if outcome.allowed {
                limit.saturating_sub(outcome.count)
            } else {
                0
            },
            retry_after_ms: outcome.retry_after_ms,
            reset_after_ms: outcome.reset_after_ms,
        };

        if !result.allowed {
            debug!(
                key = %key,
                count = result.count,
                limit,
                retry_after_ms = result.retry_after_ms,
                "Rate limit exceeded"
            );
        }

        Ok(result)
    }

    /// Current in-window count for `key`, measured over the default window.
    ///
    /// Read-only: entries that have left the window are skipped, not pruned.
    pub async fn get_counter(&self, key: &str) -> Result<u64> {
        validate_key(key)?;
        self.store
            .count_in_window(key, self.clock.now_ms(), self.default_window_ms)
            .await
    }

    /// Delete every recorded request for `key`.
    pub async fn reset_counter(&self, key: &str) -> Result<()> {
        validate_key(key)?;
        self.store.delete_window(key).await?;
        debug!(key = %key, "Counter reset");
        Ok(())
    }
}

/// Reject keys that are empty or would alias another key's sequence counter.
fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(RatewardenError::Validation("key must not be empty".to_string()));
    }
    if key
        .strip_suffix(SEQUENCE_KEY_SUFFIX)
        .is_some_and(|rest| rest.ends_with(':'))
    {
        return Err(RatewardenError::Validation(format!(
            "key must not end with ':{}'",
            SEQUENCE_KEY_SUFFIX
        )));
    }
    Ok(())
}
