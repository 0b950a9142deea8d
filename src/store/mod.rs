//! Shared state store abstraction.
//!
//! Every node talks to the same store; it is the single source of truth for
//! window entries and node presence. Nothing is cached locally.
//!
//! Key layout:
//! - `ratelimit:{key}` sorted set of window entries, TTL = window + buffer
//! - `ratelimit:{key}:seq` member sequence counter, same TTL
//! - `nodes:{node_id}` presence hash `{address, registered_at, last_heartbeat}`

mod memory_store;
mod redis_store;

pub use memory_store::{MemoryStore, SWEEP_INTERVAL_MS};
pub use redis_store::RedisStore;

use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;
use crate::ratelimit::{WindowOp, WindowOutcome};
use crate::registry::NodeRecord;

/// Prefix of window keys.
pub const WINDOW_KEY_PREFIX: &str = "ratelimit";
/// Suffix distinguishing a window's sequence counter.
pub const SEQUENCE_KEY_SUFFIX: &str = "seq";
/// Prefix of node presence keys.
pub const NODE_KEY_PREFIX: &str = "nodes";

/// Store key of the sorted set holding `key`'s window entries.
pub fn window_key(key: &str) -> String {
    format!("{}:{}", WINDOW_KEY_PREFIX, key)
}

/// Store key of the counter used to build unique members for `key`.
pub fn sequence_key(key: &str) -> String {
    format!("{}:{}:{}", WINDOW_KEY_PREFIX, key, SEQUENCE_KEY_SUFFIX)
}

/// Store key of a node's presence record.
pub fn node_key(node_id: &str) -> String {
    format!("{}:{}", NODE_KEY_PREFIX, node_id)
}

/// Inverse of [`node_key`].
pub fn node_id_from_key(key: &str) -> Option<&str> {
    key.strip_prefix(NODE_KEY_PREFIX)
        .and_then(|rest| rest.strip_prefix(':'))
        .filter(|id| !id.is_empty())
}

/// Operations the limiter and the registry need from the shared store.
///
/// Implementations must execute [`StateStore::apply_window`] as one
/// indivisible unit per key, across every process sharing the store.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Run the sliding-window check-and-record operation.
    async fn apply_window(&self, op: &WindowOp) -> Result<WindowOutcome>;

    /// Count entries for `key` inside `(now - window, now]` without pruning.
    async fn count_in_window(&self, key: &str, now_ms: u64, window_ms: u64) -> Result<u64>;

    /// Delete every entry and the sequence counter for `key`.
    async fn delete_window(&self, key: &str) -> Result<()>;

    /// Whether the backing structure for `key` currently exists.
    async fn window_exists(&self, key: &str) -> Result<bool>;

    /// Write a node presence record that disappears after `ttl`.
    async fn put_node(&self, record: &NodeRecord, ttl: Duration) -> Result<()>;

    /// Every unexpired presence record.
    async fn list_nodes(&self) -> Result<Vec<NodeRecord>>;

    /// Round-trip check used by health reporting.
    async fn ping(&self) -> Result<()>;
}
