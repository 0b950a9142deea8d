//! Heartbeat-based node registry.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace, warn};

use super::NodeRecord;
use crate::clock::SharedClock;
use crate::config::RatewardenConfig;
use crate::error::{RatewardenError, Result};
use crate::store::StateStore;

/// Configuration for the registry.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Unique node identifier.
    pub node_id: String,
    /// The address to advertise to other nodes.
    pub address: String,
    /// How long a presence record survives without renewal.
    pub ttl: Duration,
}

impl RegistryConfig {
    /// Derive the registry settings from the service configuration.
    pub fn from_config(config: &RatewardenConfig) -> Self {
        Self {
            node_id: config.node.node_id.clone(),
            address: config.advertise_addr(),
            ttl: Duration::from_secs(config.node.heartbeat_ttl_secs),
        }
    }
}

/// Registration lifecycle as seen by this process.
///
/// Expiry is never observed locally: a record whose heartbeats stop simply
/// disappears from the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationState {
    /// No presence record has been written yet
    Unregistered,
    /// A presence record has been written at least once
    Registered,
}

/// Advertises this node and discovers its peers through the shared store.
pub struct NodeRegistry {
    store: Arc<dyn StateStore>,
    clock: SharedClock,
    config: RegistryConfig,
    record: Mutex<Option<NodeRecord>>,
}

impl std::fmt::Debug for NodeRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeRegistry")
            .field("config", &self.config)
            .field("state", &self.state())
            .finish()
    }
}

impl NodeRegistry {
    /// Create a registry for this node. Nothing is written until
    /// [`register`](Self::register) is called.
    pub fn new(store: Arc<dyn StateStore>, clock: SharedClock, config: RegistryConfig) -> Self {
        Self {
            store,
            clock,
            config,
            record: Mutex::new(None),
        }
    }

    /// Our node ID.
    pub fn node_id(&self) -> &str {
        &self.config.node_id
    }

    /// The advertised address.
    pub fn address(&self) -> &str {
        &self.config.address
    }

    /// Current registration state.
    pub fn state(&self) -> RegistrationState {
        if self.record.lock().is_some() {
            RegistrationState::Registered
        } else {
            RegistrationState::Unregistered
        }
    }

    /// Interval between heartbeats, a third of the TTL.
    pub fn heartbeat_interval(&self) -> Duration {
        (self.config.ttl / 3).max(Duration::from_millis(1))
    }

    /// Write the presence record for the first time.
    pub async fn register(&self) -> Result<NodeRecord> {
        let record = NodeRecord::new(
            &self.config.node_id,
            &self.config.address,
            self.clock.now_ms(),
        );
        self.store.put_node(&record, self.config.ttl).await?;
        *self.record.lock() = Some(record.clone());

        info!(
            node_id = %record.node_id,
            address = %record.address,
            ttl_ms = self.config.ttl.as_millis() as u64,
            "Node registered"
        );
        Ok(record)
    }

    /// Renew the presence record, registering first if that never succeeded.
    pub async fn heartbeat(&self) -> Result<NodeRecord> {
        let previous = self.record.lock().clone();
        let Some(previous) = previous else {
            return self.register().await;
        };

        let record = previous.renewed(self.clock.now_ms());
        self.store.put_node(&record, self.config.ttl).await?;
        *self.record.lock() = Some(record.clone());

        trace!(node_id = %record.node_id, "Heartbeat written");
        Ok(record)
    }

    /// Every node whose presence record has not expired, ourselves included.
    pub async fn live_nodes(&self) -> Result<Vec<NodeRecord>> {
        self.store.list_nodes().await
    }

    /// Start renewing the presence record in the background.
    ///
    /// The task shares nothing with request handling except the store. A
    /// failed or slow write is logged and retried on the next tick. Dropping
    /// the returned handle stops the task as well.
    pub fn spawn_heartbeat(self: &Arc<Self>) -> HeartbeatHandle {
        let registry = Arc::clone(self);
        let interval = self.heartbeat_interval();
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();

        let join = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately; registration already wrote.
            ticker.tick().await;

            debug!(
                node_id = %registry.node_id(),
                interval_ms = interval.as_millis() as u64,
                "Heartbeat loop started"
            );

            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    _ = ticker.tick() => {
                        match tokio::time::timeout(interval, registry.heartbeat()).await {
                            Ok(Ok(_)) => {}
                            Ok(Err(e)) => warn!(
                                node_id = %registry.node_id(),
                                error = %e,
                                "Heartbeat write failed, retrying next interval"
                            ),
                            Err(_) => warn!(
                                node_id = %registry.node_id(),
                                "Heartbeat write timed out, retrying next interval"
                            ),
                        }
                    }
                }
            }

            info!(node_id = %registry.node_id(), "Heartbeat loop stopped");
        });

        HeartbeatHandle {
            shutdown: Some(shutdown_tx),
            join,
        }
    }
}

/// Handle to a running heartbeat task.
#[derive(Debug)]
pub struct HeartbeatHandle {
    shutdown: Option<oneshot::Sender<()>>,
    join: JoinHandle<()>,
}

impl HeartbeatHandle {
    /// Stop renewing. The presence record is left to expire on its own.
    pub async fn stop(mut self) -> Result<()> {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        (&mut self.join)
            .await
            .map_err(|e| RatewardenError::Server(format!("heartbeat task failed: {}", e)))
    }

    /// Whether the task has exited.
    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn test_registry(
        node_id: &str,
        ttl: Duration,
    ) -> (Arc<ManualClock>, Arc<MemoryStore>, Arc<NodeRegistry>) {
        let clock = Arc::new(ManualClock::new(1_000_000));
        let store = Arc::new(MemoryStore::new(clock.clone()));
        let registry = Arc::new(NodeRegistry::new(
            store.clone(),
            clock.clone(),
            RegistryConfig {
                node_id: node_id.to_string(),
                address: format!("{}.internal:8080", node_id),
                ttl,
            },
        ));
        (clock, store, registry)
    }

    #[test]
    fn test_heartbeat_interval_is_third_of_ttl() {
        let (_clock, _store, registry) = test_registry("node-a", Duration::from_secs(15));
        assert_eq!(registry.heartbeat_interval(), Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_register() {
        let (_clock, _store, registry) = test_registry("node-a", Duration::from_secs(15));
        assert_eq!(registry.state(), RegistrationState::Unregistered);

        let record = registry.register().await.unwrap();
        assert_eq!(registry.state(), RegistrationState::Registered);
        assert_eq!(record.address, "node-a.internal:8080");
        assert_eq!(registry.live_nodes().await.unwrap(), vec![record]);
    }

    #[tokio::test]
    async fn test_heartbeat_keeps_record_alive() {
        let (clock, _store, registry) = test_registry("node-a", Duration::from_secs(15));
        let record = registry.register().await.unwrap();

        clock.advance(Duration::from_secs(10));
        let renewed = registry.heartbeat().await.unwrap();
        assert_eq!(renewed.registered_at_ms, record.registered_at_ms);
        assert_eq!(renewed.last_heartbeat_ms, record.last_heartbeat_ms + 10_000);

        clock.advance(Duration::from_secs(10));
        assert_eq!(registry.live_nodes().await.unwrap(), vec![renewed]);
    }

    #[tokio::test]
    async fn test_heartbeat_registers_when_unregistered() {
        let (_clock, _store, registry) = test_registry("node-a", Duration::from_secs(15));
        registry.heartbeat().await.unwrap();
        assert_eq!(registry.state(), RegistrationState::Registered);
    }

    #[tokio::test]
    async fn test_peers_discover_each_other() {
        let clock = Arc::new(ManualClock::new(0));
        let store: Arc<dyn StateStore> = Arc::new(MemoryStore::new(clock.clone()));
        let make = |id: &str| {
            NodeRegistry::new(
                store.clone(),
                clock.clone(),
                RegistryConfig {
                    node_id: id.to_string(),
                    address: format!("{}:8080", id),
                    ttl: Duration::from_secs(15),
                },
            )
        };

        let a = make("node-a");
        let b = make("node-b");
        a.register().await.unwrap();
        b.register().await.unwrap();

        let ids: Vec<String> = a
            .live_nodes()
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.node_id)
            .collect();
        assert_eq!(ids, vec!["node-a".to_string(), "node-b".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stopped_node_expires_from_discovery() {
        let ttl = Duration::from_secs(3);
        let (clock, _store, registry) = test_registry("node-a", ttl);
        registry.register().await.unwrap();

        let handle = registry.spawn_heartbeat();
        handle.stop().await.unwrap();

        assert_eq!(registry.live_nodes().await.unwrap().len(), 1);

        clock.advance(ttl + Duration::from_millis(1));
        assert!(registry.live_nodes().await.unwrap().is_empty());
        // Local state never moves to an expired state on its own.
        assert_eq!(registry.state(), RegistrationState::Registered);
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_loop_renews_record() {
        let ttl = Duration::from_secs(3);
        let (clock, _store, registry) = test_registry("node-a", ttl);
        let registered = registry.register().await.unwrap();

        let handle = registry.spawn_heartbeat();
        clock.advance(Duration::from_secs(2));

        let mut renewed = false;
        for _ in 0..10 {
            tokio::time::sleep(registry.heartbeat_interval()).await;
            let nodes = registry.live_nodes().await.unwrap();
            if nodes[0].last_heartbeat_ms > registered.last_heartbeat_ms {
                renewed = true;
                break;
            }
        }
        assert!(renewed, "heartbeat loop never renewed the record");

        handle.stop().await.unwrap();
    }

    struct FailingStore {
        attempts: AtomicUsize,
        inner: MemoryStore,
    }

    #[async_trait]
    impl StateStore for FailingStore {
        async fn apply_window(
            &self,
            op: &crate::ratelimit::WindowOp,
        ) -> Result<crate::ratelimit::WindowOutcome> {
            self.inner.apply_window(op).await
        }

        async fn count_in_window(&self, key: &str, now_ms: u64, window_ms: u64) -> Result<u64> {
            self.inner.count_in_window(key, now_ms, window_ms).await
        }

        async fn delete_window(&self, key: &str) -> Result<()> {
            self.inner.delete_window(key).await
        }

        async fn window_exists(&self, key: &str) -> Result<bool> {
            self.inner.window_exists(key).await
        }

        async fn put_node(&self, record: &NodeRecord, ttl: Duration) -> Result<()> {
            // Fail the first two writes after registration.
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
            if attempt == 1 || attempt == 2 {
                return Err(RatewardenError::Connection("connection refused".to_string()));
            }
            self.inner.put_node(record, ttl).await
        }

        async fn list_nodes(&self) -> Result<Vec<NodeRecord>> {
            self.inner.list_nodes().await
        }

        async fn ping(&self) -> Result<()> {
            self.inner.ping().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_loop_survives_failed_writes() {
        let clock = Arc::new(ManualClock::new(0));
        let store = Arc::new(FailingStore {
            attempts: AtomicUsize::new(0),
            inner: MemoryStore::new(clock.clone()),
        });
        let registry = Arc::new(NodeRegistry::new(
            store.clone(),
            clock.clone(),
            RegistryConfig {
                node_id: "node-a".to_string(),
                address: "node-a:8080".to_string(),
                ttl: Duration::from_secs(3),
            },
        ));
        registry.register().await.unwrap();
        let handle = registry.spawn_heartbeat();

        for _ in 0..20 {
            if store.attempts.load(Ordering::SeqCst) >= 4 {
                break;
            }
            tokio::time::sleep(registry.heartbeat_interval()).await;
        }

        assert!(store.attempts.load(Ordering::SeqCst) >= 4);
        assert!(!handle.is_finished());
        handle.stop().await.unwrap();
    }
}
