//! Runs against a real Redis server. Skipped unless `REDIS_URL` is set.

use std::collections::BTreeSet;
use std::env;
use std::sync::Arc;
use std::time::Duration;

use ratewarden::clock::{ManualClock, SharedClock, SystemClock};
use ratewarden::config::RateLimitingConfig;
use ratewarden::ratelimit::RateLimiter;
use ratewarden::registry::{NodeRegistry, RegistryConfig};
use ratewarden::store::{RedisStore, StateStore};

fn redis_url() -> Option<String> {
    env::var("REDIS_URL").ok()
}

fn unique_key(name: &str) -> String {
    let n: u64 = rand::random();
    format!("itest_{}_{}", name, n)
}

async fn connect(url: &str) -> Arc<RedisStore> {
    Arc::new(RedisStore::connect(url, 4).await.unwrap())
}

fn limiter(store: Arc<RedisStore>, clock: SharedClock) -> Arc<RateLimiter> {
    Arc::new(RateLimiter::new(store, clock, &RateLimitingConfig::default()))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn concurrent_burst_admits_exactly_the_limit() {
    let Some(url) = redis_url() else { return };
    let store = connect(&url).await;
    let limiter = limiter(store.clone(), Arc::new(SystemClock));
    let key = unique_key("burst");

    let tasks: Vec<_> = (0..20)
        .map(|_| {
            let limiter = limiter.clone();
            let key = key.clone();
            tokio::spawn(async move { limiter.check(&key, 10, 60_000).await.unwrap() })
        })
        .collect();

    let results: Vec<_> = futures::future::join_all(tasks)
        .await
        .into_iter()
        .map(|r| r.unwrap())
        .collect();

    let counts: BTreeSet<u64> = results
        .iter()
        .filter(|r| r.allowed)
        .map(|r| r.count)
        .collect();
    assert_eq!(counts, (1..=10).collect::<BTreeSet<u64>>());
    assert_eq!(results.iter().filter(|r| !r.allowed).count(), 10);

    limiter.reset_counter(&key).await.unwrap();
}

#[tokio::test]
async fn stale_entries_are_pruned_after_window() {
    let Some(url) = redis_url() else { return };
    let store = connect(&url).await;
    let limiter = limiter(store.clone(), Arc::new(SystemClock));
    let key = unique_key("prune");

    for _ in 0..5 {
        assert!(limiter.check(&key, 5, 1_000).await.unwrap().allowed);
    }
    assert!(!limiter.check(&key, 5, 1_000).await.unwrap().allowed);

    tokio::time::sleep(Duration::from_millis(1_100)).await;

    let result = limiter.check(&key, 5, 1_000).await.unwrap();
    assert!(result.allowed);
    assert_eq!(result.count, 1);

    limiter.reset_counter(&key).await.unwrap();
}

#[tokio::test]
async fn sliding_boundary_with_injected_clock() {
    let Some(url) = redis_url() else { return };
    let store = connect(&url).await;
    let clock = Arc::new(ManualClock::new(1_700_000_000_000));
    let limiter = limiter(store.clone(), clock.clone());
    let key = unique_key("boundary");

    limiter.check(&key, 10, 1_000).await.unwrap();
    clock.advance(Duration::from_millis(1));
    limiter.check(&key, 10, 1_000).await.unwrap();
    clock.advance(Duration::from_millis(999));

    // The first entry sits exactly on the edge, the second just inside.
    let result = limiter.check(&key, 10, 1_000).await.unwrap();
    assert_eq!(result.count, 2);
    assert_eq!(result.reset_after_ms, 1);

    limiter.reset_counter(&key).await.unwrap();
}

#[tokio::test]
async fn same_millisecond_requests_do_not_collide() {
    let Some(url) = redis_url() else { return };
    let store = connect(&url).await;
    let clock = Arc::new(ManualClock::new(1_700_000_000_000));
    let limiter = limiter(store.clone(), clock);
    let key = unique_key("unique");

    for i in 1..=200 {
        let result = limiter.check(&key, 1_000, 60_000).await.unwrap();
        assert_eq!(result.count, i);
    }
    assert_eq!(
        store
            .count_in_window(&key, 1_700_000_000_000, 60_000)
            .await
            .unwrap(),
        200
    );

    limiter.reset_counter(&key).await.unwrap();
}

#[tokio::test]
async fn idle_key_expires() {
    let Some(url) = redis_url() else { return };
    let store = connect(&url).await;
    let limiter = Arc::new(RateLimiter::new(
        store.clone(),
        Arc::new(SystemClock),
        &RateLimitingConfig {
            ttl_buffer_ms: 100,
            ..RateLimitingConfig::default()
        },
    ));
    let key = unique_key("ttl");

    limiter.check(&key, 5, 500).await.unwrap();
    assert!(store.window_exists(&key).await.unwrap());

    tokio::time::sleep(Duration::from_millis(1_000)).await;
    assert!(!store.window_exists(&key).await.unwrap());
}

#[tokio::test]
async fn zero_limit_writes_nothing() {
    let Some(url) = redis_url() else { return };
    let store = connect(&url).await;
    let limiter = limiter(store.clone(), Arc::new(SystemClock));
    let key = unique_key("zero");

    let result = limiter.check(&key, 0, 1_000).await.unwrap();
    assert!(!result.allowed);
    assert!(!store.window_exists(&key).await.unwrap());
}

#[tokio::test]
async fn stopped_node_disappears_from_discovery() {
    let Some(url) = redis_url() else { return };
    let store = connect(&url).await;
    let node_id = unique_key("node");
    let registry = Arc::new(NodeRegistry::new(
        store.clone(),
        Arc::new(SystemClock),
        RegistryConfig {
            node_id: node_id.clone(),
            address: "127.0.0.1:8080".to_string(),
            ttl: Duration::from_millis(600),
        },
    ));

    registry.register().await.unwrap();
    let heartbeat = registry.spawn_heartbeat();

    tokio::time::sleep(Duration::from_millis(900)).await;
    let live = registry.live_nodes().await.unwrap();
    assert!(live.iter().any(|n| n.node_id == node_id));

    heartbeat.stop().await.unwrap();
    tokio::time::sleep(Duration::from_millis(800)).await;

    let live = registry.live_nodes().await.unwrap();
    assert!(!live.iter().any(|n| n.node_id == node_id));
}
