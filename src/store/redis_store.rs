//! Redis-backed [`StateStore`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{Client, Script};
use tracing::{debug, info};

use super::{node_id_from_key, node_key, sequence_key, window_key, StateStore, NODE_KEY_PREFIX};
use crate::error::{RatewardenError, Result};
use crate::ratelimit::{WindowOp, WindowOutcome, SLIDING_WINDOW_SCRIPT};
use crate::registry::NodeRecord;

const SCAN_BATCH: usize = 100;

/// A store backed by a Redis server shared by every node.
///
/// Holds a fixed set of multiplexed [`ConnectionManager`]s and hands them out
/// round-robin. Connection managers reconnect on their own; a request that
/// hits a broken connection fails with [`RatewardenError::Connection`] and is
/// not retried here.
pub struct RedisStore {
    connections: Arc<Vec<ConnectionManager>>,
    next: AtomicUsize,
    window_script: Script,
}

impl RedisStore {
    /// Connect to `url`, opening `connection_count` connection managers.
    pub async fn connect(url: &str, connection_count: usize) -> Result<Self> {
        if connection_count == 0 {
            return Err(RatewardenError::Config(
                "connection count must be > 0".to_string(),
            ));
        }

        let client = Client::open(url)
            .map_err(|e| RatewardenError::Config(format!("invalid store url: {}", e)))?;

        let mut connections = Vec::with_capacity(connection_count);
        for _ in 0..connection_count {
            connections.push(client.get_connection_manager().await?);
        }

        info!(connection_count, "Connected to Redis store");

        Ok(Self {
            connections: Arc::new(connections),
            next: AtomicUsize::new(0),
            window_script: Script::new(SLIDING_WINDOW_SCRIPT),
        })
    }

    fn connection(&self) -> ConnectionManager {
        let index = self.next.fetch_add(1, Ordering::Relaxed);
        self.connections[index % self.connections.len()].clone()
    }

    async fn scan_node_keys(&self, conn: &mut ConnectionManager) -> Result<Vec<String>> {
        let pattern = format!("{}:*", NODE_KEY_PREFIX);
        let mut cursor: u64 = 0;
        let mut keys = Vec::new();

        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(conn)
                .await?;

            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }

        // SCAN may return a key more than once.
        keys.sort();
        keys.dedup();
        Ok(keys)
    }
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore")
            .field("connections", &self.connections.len())
            .finish()
    }
}

#[async_trait]
impl StateStore for RedisStore {
    async fn apply_window(&self, op: &WindowOp) -> Result<WindowOutcome> {
        let mut conn = self.connection();

        let (allowed, count, until_oldest_exits): (i64, i64, i64) = self
            .window_script
            .key(window_key(&op.key))
            .key(sequence_key(&op.key))
            .arg(op.now_ms)
            .arg(op.prune_cutoff())
            .arg(op.limit)
            .arg(op.window_ms)
            .arg(op.ttl_ms)
            .invoke_async(&mut conn)
            .await?;

        Ok(WindowOutcome::from_script_reply(
            allowed,
            count,
            until_oldest_exits,
        ))
    }

    async fn count_in_window(&self, key: &str, now_ms: u64, window_ms: u64) -> Result<u64> {
        let mut conn = self.connection();
        let cutoff = now_ms as i64 - window_ms as i64;

        let count: u64 = redis::cmd("ZCOUNT")
            .arg(window_key(key))
            .arg(format!("({}", cutoff))
            .arg("+inf")
            .query_async(&mut conn)
            .await?;

        Ok(count)
    }

    async fn delete_window(&self, key: &str) -> Result<()> {
        let mut conn = self.connection();

        let removed: u64 = redis::cmd("DEL")
            .arg(window_key(key))
            .arg(sequence_key(key))
            .query_async(&mut conn)
            .await?;

        debug!(key = %key, removed, "Deleted window");
        Ok(())
    }

    async fn window_exists(&self, key: &str) -> Result<bool> {
        let mut conn = self.connection();

        let exists: u64 = redis::cmd("EXISTS")
            .arg(window_key(key))
            .query_async(&mut conn)
            .await?;

        Ok(exists > 0)
    }

    async fn put_node(&self, record: &NodeRecord, ttl: Duration) -> Result<()> {
        let mut conn = self.connection();
        let key = node_key(&record.node_id);

        let _: () = redis::pipe()
            .atomic()
            .hset_multiple(&key, &record.to_fields())
            .ignore()
            .pexpire(&key, ttl.as_millis() as i64)
            .ignore()
            .query_async(&mut conn)
            .await?;

        Ok(())
    }

    async fn list_nodes(&self) -> Result<Vec<NodeRecord>> {
        let mut conn = self.connection();
        let keys = self.scan_node_keys(&mut conn).await?;
        if keys.is_empty() {
            return Ok(Vec::new());
        }

        let mut pipe = redis::pipe();
        for key in &keys {
            pipe.hgetall(key);
        }
        let hashes: Vec<HashMap<String, String>> = pipe.query_async(&mut conn).await?;

        // A record that expired between SCAN and HGETALL comes back empty.
        let records = keys
            .iter()
            .zip(hashes.iter())
            .filter_map(|(key, fields)| {
                let node_id = node_id_from_key(key)?;
                NodeRecord::from_fields(node_id, fields)
            })
            .collect();

        Ok(records)
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.connection();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }
}
