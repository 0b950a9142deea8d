//! Process-local [`StateStore`].
//!
//! Exact only within one process: the window operation is indivisible per
//! key because it runs under the map shard's write lock. TTLs are emulated
//! against the injected clock: enforced on access, and expired keys are swept
//! at most once per [`SWEEP_INTERVAL_MS`] of clock time from `apply_window`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::debug;

use super::StateStore;
use crate::clock::SharedClock;
use crate::error::Result;
use crate::ratelimit::{SlidingWindow, WindowOp, WindowOutcome};
use crate::registry::NodeRecord;

/// Minimum clock time between two sweeps of expired window keys.
pub const SWEEP_INTERVAL_MS: u64 = 1_000;

#[derive(Debug, Default)]
struct WindowSlot {
    window: SlidingWindow,
    expires_at_ms: u64,
}

impl WindowSlot {
    fn is_expired(&self, now_ms: u64) -> bool {
        self.expires_at_ms <= now_ms
    }

    fn apply(&mut self, op: &WindowOp) -> WindowOutcome {
        let outcome = self.window.apply(op);
        if outcome.allowed {
            self.expires_at_ms = op.now_ms + op.ttl_ms;
        }
        outcome
    }
}

#[derive(Debug)]
struct NodeSlot {
    record: NodeRecord,
    expires_at_ms: u64,
}

/// An in-memory store.
pub struct MemoryStore {
    clock: SharedClock,
    windows: DashMap<String, WindowSlot>,
    nodes: DashMap<String, NodeSlot>,
    next_sweep_ms: AtomicU64,
}

impl MemoryStore {
    /// Create an empty store whose TTLs follow `clock`.
    pub fn new(clock: SharedClock) -> Self {
        Self {
            clock,
            windows: DashMap::new(),
            nodes: DashMap::new(),
            next_sweep_ms: AtomicU64::new(0),
        }
    }

    /// Drop every window key whose TTL has passed. Returns how many went.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now_ms();
        let before = self.windows.len();
        self.windows.retain(|_, slot| !slot.is_expired(now));
        self.nodes.retain(|_, slot| slot.expires_at_ms > now);
        before.saturating_sub(self.windows.len())
    }

    fn maybe_sweep(&self, now_ms: u64) {
        let due = self.next_sweep_ms.load(Ordering::Relaxed);
        if now_ms < due {
            return;
        }
        // One caller wins the slot; the rest skip this round.
        if self
            .next_sweep_ms
            .compare_exchange(
                due,
                now_ms + SWEEP_INTERVAL_MS,
                Ordering::AcqRel,
                Ordering::Relaxed,
            )
            .is_ok()
        {
            let purged = self.purge_expired();
            if purged > 0 {
                debug!(purged, "Swept expired window keys");
            }
        }
    }

    /// Member ids recorded for `key`, in score order.
    pub fn members(&self, key: &str) -> Vec<String> {
        let now = self.clock.now_ms();
        self.windows
            .get(key)
            .filter(|slot| !slot.is_expired(now))
            .map(|slot| slot.window.members().collect())
            .unwrap_or_default()
    }

    /// Number of keys currently held, expired or not.
    pub fn window_count(&self) -> usize {
        self.windows.len()
    }
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore")
            .field("windows", &self.windows.len())
            .field("nodes", &self.nodes.len())
            .finish()
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn apply_window(&self, op: &WindowOp) -> Result<WindowOutcome> {
        let outcome = match self.windows.entry(op.key.clone()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_expired(op.now_ms) {
                    *occupied.get_mut() = WindowSlot::default();
                }
                let outcome = occupied.get_mut().apply(op);
                if occupied.get().window.is_empty() {
                    occupied.remove();
                }
                outcome
            }
            Entry::Vacant(vacant) => {
                let mut slot = WindowSlot::default();
                let outcome = slot.apply(op);
                if outcome.allowed {
                    vacant.insert(slot);
                }
                outcome
            }
        };

        self.maybe_sweep(op.now_ms);
        Ok(outcome)
    }

    async fn count_in_window(&self, key: &str, now_ms: u64, window_ms: u64) -> Result<u64> {
        let cutoff = now_ms as i64 - window_ms as i64;
        let count = self
            .windows
            .get(key)
            .filter(|slot| !slot.is_expired(now_ms))
            .map(|slot| slot.window.count_after(cutoff))
            .unwrap_or(0);
        Ok(count)
    }

    async fn delete_window(&self, key: &str) -> Result<()> {
        self.windows.remove(key);
        Ok(())
    }

    async fn window_exists(&self, key: &str) -> Result<bool> {
        let now = self.clock.now_ms();
        self.windows.remove_if(key, |_, slot| slot.is_expired(now));
        Ok(self.windows.contains_key(key))
    }

    async fn put_node(&self, record: &NodeRecord, ttl: Duration) -> Result<()> {
        let expires_at_ms = self.clock.now_ms() + ttl.as_millis() as u64;
        self.nodes.insert(
            record.node_id.clone(),
            NodeSlot {
                record: record.clone(),
                expires_at_ms,
            },
        );
        Ok(())
    }

    async fn list_nodes(&self) -> Result<Vec<NodeRecord>> {
        let now = self.clock.now_ms();
        self.nodes.retain(|_, slot| slot.expires_at_ms > now);

        let mut records: Vec<NodeRecord> = self
            .nodes
            .iter()
            .map(|slot| slot.record.clone())
            .collect();
        records.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        Ok(records)
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}
