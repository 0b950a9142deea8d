//! The atomic sliding-window check-and-record operation.
//!
//! The operation runs as one indivisible unit inside the store:
//!
//! 1. drop every entry whose score is at or before `now - window`
//! 2. count what is left
//! 3. if the count has reached the limit, report a block and the time until
//!    the oldest entry leaves the window
//! 4. otherwise insert `now:seq` with score `now`, refresh the TTL and report
//!    the new count
//!
//! The window is the half-open interval `(now - window, now]`.
//!
//! [`SLIDING_WINDOW_SCRIPT`] is the Redis rendition, [`SlidingWindow`] the
//! in-process one used by [`MemoryStore`](crate::store::MemoryStore). Both
//! must produce identical [`WindowOutcome`]s for identical inputs.

use std::collections::BTreeSet;

/// Redis Lua script executing the four steps in a single `EVALSHA`.
///
/// KEYS: window sorted set, sequence counter.
/// ARGV: now, prune cutoff (inclusive), limit, window, ttl; all in ms.
/// Returns `{allowed (0|1), count, ms until the oldest entry leaves}`.
pub const SLIDING_WINDOW_SCRIPT: &str = r#"
local window_key = KEYS[1]
local seq_key = KEYS[2]

local now = tonumber(ARGV[1])
local cutoff = ARGV[2]
local limit = tonumber(ARGV[3])
local window_ms = tonumber(ARGV[4])
local ttl_ms = ARGV[5]

redis.call("ZREMRANGEBYSCORE", window_key, "-inf", cutoff)
local count = redis.call("ZCARD", window_key)

if count >= limit then
    local oldest = redis.call("ZRANGE", window_key, 0, 0, "WITHSCORES")
    if #oldest == 0 then
        return {0, count, window_ms}
    end
    return {0, count, tonumber(oldest[2]) + window_ms - now}
end

local seq = redis.call("INCR", seq_key)
redis.call("ZADD", window_key, ARGV[1], ARGV[1] .. ":" .. seq)
redis.call("PEXPIRE", window_key, ttl_ms)
redis.call("PEXPIRE", seq_key, ttl_ms)

local oldest = redis.call("ZRANGE", window_key, 0, 0, "WITHSCORES")
return {1, count + 1, tonumber(oldest[2]) + window_ms - now}
"#;

/// Input to one execution of the window operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowOp {
    /// The rate-limited key, before any store prefixing
    pub key: String,
    /// Current time in ms since the epoch
    pub now_ms: u64,
    /// Maximum entries allowed inside the window
    pub limit: u64,
    /// Window length in ms, always > 0
    pub window_ms: u64,
    /// TTL applied to the key's structures on admission
    pub ttl_ms: u64,
}

impl WindowOp {
    /// Entries scored at or below this value are outside the window.
    ///
    /// Negative when the window reaches back past the epoch.
    pub fn prune_cutoff(&self) -> i64 {
        self.now_ms as i64 - self.window_ms as i64
    }
}

/// What the window operation decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowOutcome {
    /// Whether an entry was recorded
    pub allowed: bool,
    /// In-window entries after the decision
    pub count: u64,
    /// Wait before a retry can succeed; 0 when allowed
    pub retry_after_ms: u64,
    /// Time until the oldest in-window entry leaves the window
    pub reset_after_ms: u64,
}

impl WindowOutcome {
    /// Build an outcome from the raw script reply, clamping negative waits
    /// produced by clock skew to zero.
    pub fn from_script_reply(allowed: i64, count: i64, until_oldest_exits: i64) -> Self {
        let allowed = allowed == 1;
        let wait = until_oldest_exits.max(0) as u64;
        Self {
            allowed,
            count: count.max(0) as u64,
            retry_after_ms: if allowed { 0 } else { wait },
            reset_after_ms: wait,
        }
    }
}

/// In-process window for one key: entries ordered by `(score, seq)`.
#[derive(Debug, Default, Clone)]
pub struct SlidingWindow {
    entries: BTreeSet<(u64, u64)>,
    seq: u64,
}

impl SlidingWindow {
    /// Create an empty window.
    pub fn new() -> Self {
        Self::default()
    }

    /// Run the four steps against this window.
    pub fn apply(&mut self, op: &WindowOp) -> WindowOutcome {
        self.prune(op.prune_cutoff());
        let count = self.entries.len() as u64;

        if count >= op.limit {
            let wait = self.until_oldest_exits(op).unwrap_or(op.window_ms);
            return WindowOutcome {
                allowed: false,
                count,
                retry_after_ms: wait,
                reset_after_ms: wait,
            };
        }

        self.seq += 1;
        self.entries.insert((op.now_ms, self.seq));

        WindowOutcome {
            allowed: true,
            count: count + 1,
            retry_after_ms: 0,
            reset_after_ms: self.until_oldest_exits(op).unwrap_or(op.window_ms),
        }
    }

    /// Entries scored strictly after `cutoff`, without pruning.
    pub fn count_after(&self, cutoff: i64) -> u64 {
        self.entries
            .iter()
            .filter(|(score, _)| *score as i64 > cutoff)
            .count() as u64
    }

    /// Number of recorded entries, including any not yet pruned.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no entries are recorded.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Member ids in score order, formatted as `timestamp:sequence`.
    pub fn members(&self) -> impl Iterator<Item = String> + '_ {
        self.entries
            .iter()
            .map(|(score, seq)| format!("{}:{}", score, seq))
    }

    fn prune(&mut self, cutoff: i64) {
        if cutoff < 0 {
            return;
        }
        let first_kept = (cutoff as u64 + 1, 0);
        self.entries = self.entries.split_off(&first_kept);
    }

    fn until_oldest_exits(&self, op: &WindowOp) -> Option<u64> {
        self.entries
            .first()
            .map(|(score, _)| (score + op.window_ms).saturating_sub(op.now_ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn op(now_ms: u64, limit: u64, window_ms: u64) -> WindowOp {
        WindowOp {
            key: "k".to_string(),
            now_ms,
            limit,
            window_ms,
            ttl_ms: window_ms + 1_000,
        }
    }

    #[test]
    fn test_admits_up_to_limit() {
        let mut window = SlidingWindow::new();

        for i in 1..=3 {
            let outcome = window.apply(&op(10_000, 3, 1_000));
            assert!(outcome.allowed);
            assert_eq!(outcome.count, i);
            assert_eq!(outcome.retry_after_ms, 0);
        }

        let blocked = window.apply(&op(10_000, 3, 1_000));
        assert!(!blocked.allowed);
        assert_eq!(blocked.count, 3);
        assert_eq!(blocked.retry_after_ms, 1_000);
        assert_eq!(window.len(), 3);
    }

    #[test]
    fn test_retry_after_tracks_oldest_entry() {
        let mut window = SlidingWindow::new();
        window.apply(&op(10_000, 2, 1_000));
        window.apply(&op(10_400, 2, 1_000));

        let blocked = window.apply(&op(10_700, 2, 1_000));
        assert!(!blocked.allowed);
        assert_eq!(blocked.retry_after_ms, 300);
        assert_eq!(blocked.reset_after_ms, 300);
    }

    #[test]
    fn test_boundary_entries() {
        let mut window = SlidingWindow::new();
        // Scores 9_000 and 9_001 straddle the edge when checked at 10_000.
        window.apply(&op(9_000, 10, 1_000));
        window.apply(&op(9_001, 10, 1_000));
        window.apply(&op(9_500, 10, 1_000));

        assert_eq!(window.count_after(10_000 - 1_000), 2);

        let outcome = window.apply(&op(10_000, 10, 1_000));
        assert!(outcome.allowed);
        assert_eq!(outcome.count, 3);
        assert_eq!(outcome.reset_after_ms, 1);
        assert_eq!(window.len(), 3);
    }

    #[test]
    fn test_blocked_check_still_prunes() {
        let mut window = SlidingWindow::new();
        window.apply(&op(1_000, 1, 500));
        assert_eq!(window.len(), 1);

        let outcome = window.apply(&op(5_000, 0, 500));
        assert!(!outcome.allowed);
        assert_eq!(outcome.count, 0);
        assert!(window.is_empty());
    }

    #[test]
    fn test_zero_limit_never_writes() {
        let mut window = SlidingWindow::new();
        let outcome = window.apply(&op(1_000, 0, 2_000));

        assert!(!outcome.allowed);
        assert_eq!(outcome.count, 0);
        assert_eq!(outcome.retry_after_ms, 2_000);
        assert!(window.is_empty());
    }

    #[test]
    fn test_window_reaching_before_epoch() {
        let mut window = SlidingWindow::new();
        window.apply(&op(0, 5, 1_000));
        let outcome = window.apply(&op(500, 5, 1_000));
        assert_eq!(outcome.count, 2);
    }

    #[test]
    fn test_same_millisecond_members_are_unique() {
        let mut window = SlidingWindow::new();
        for _ in 0..1_000 {
            window.apply(&op(42, 10_000, 1_000));
        }

        let members: BTreeSet<String> = window.members().collect();
        assert_eq!(members.len(), 1_000);
        assert!(members.contains("42:1"));
        assert!(members.contains("42:1000"));
    }

    #[test]
    fn test_outcome_from_script_reply() {
        let allowed = WindowOutcome::from_script_reply(1, 4, 900);
        assert!(allowed.allowed);
        assert_eq!(allowed.count, 4);
        assert_eq!(allowed.retry_after_ms, 0);
        assert_eq!(allowed.reset_after_ms, 900);

        let skewed = WindowOutcome::from_script_reply(0, 4, -20);
        assert!(!skewed.allowed);
        assert_eq!(skewed.retry_after_ms, 0);
    }

    #[test]
    fn test_prune_cutoff_can_be_negative() {
        assert_eq!(op(100, 1, 1_000).prune_cutoff(), -900);
        assert_eq!(op(5_000, 1, 1_000).prune_cutoff(), 4_000);
    }
}
