//! Chaos Testing for State Substrate
//!
//! This module tests failure scenarios using:
//! 1. **FailingRemote wrapper** - precise error injection per operation
//! 2. **Outage injection** - the in-process remote going unreachable or slow
//! 3. **Data corruption** - garbage and stale files in the fallback directory
//!
//! # Running Chaos Tests
//! ```bash
//! cargo test --test chaos -- --nocapture
//! ```

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::json;

use state_substrate::storage::traits::{Connector, RemoteStore, StorageError};
use state_substrate::{
    ConnectionConfig, ConnectionManager, ConnectionState, InMemoryRemote, LocalFallbackStore,
    MemoryConnector, QueueConfig, RetryConfig, Substrate, SubstrateConfig,
};

// =============================================================================
// Failing Remote Wrapper - Precise Error Injection
// =============================================================================

/// Wraps an [`InMemoryRemote`] and fails selected operations on demand.
/// Ping always passes, so the link itself looks healthy.
pub struct FailingRemote {
    inner: Arc<InMemoryRemote>,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
    injected: AtomicU64,
}

impl FailingRemote {
    pub fn new(inner: Arc<InMemoryRemote>) -> Self {
        Self {
            inner,
            fail_reads: AtomicBool::new(false),
            fail_writes: AtomicBool::new(false),
            injected: AtomicU64::new(0),
        }
    }

    fn maybe_fail(&self, flag: &AtomicBool) -> Result<(), StorageError> {
        if flag.load(Ordering::SeqCst) {
            self.injected.fetch_add(1, Ordering::SeqCst);
            Err(StorageError::Backend("injected failure".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl RemoteStore for FailingRemote {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        self.maybe_fail(&self.fail_reads)?;
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StorageError> {
        self.maybe_fail(&self.fail_writes)?;
        self.inner.set(key, value, ttl).await
    }

    async fn del(&self, key: &str) -> Result<bool, StorageError> {
        self.maybe_fail(&self.fail_writes)?;
        self.inner.del(key).await
    }

    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        self.maybe_fail(&self.fail_reads)?;
        self.inner.exists(key).await
    }

    async fn pttl(&self, key: &str) -> Result<Option<Duration>, StorageError> {
        self.maybe_fail(&self.fail_reads)?;
        self.inner.pttl(key).await
    }

    async fn incr_with_expiry(&self, key: &str, window: Duration) -> Result<u64, StorageError> {
        self.maybe_fail(&self.fail_writes)?;
        self.inner.incr_with_expiry(key, window).await
    }

    async fn rpush(&self, key: &str, values: &[String]) -> Result<u64, StorageError> {
        self.maybe_fail(&self.fail_writes)?;
        self.inner.rpush(key, values).await
    }

    async fn lpop(&self, key: &str, count: usize) -> Result<Vec<String>, StorageError> {
        self.maybe_fail(&self.fail_writes)?;
        self.inner.lpop(key, count).await
    }

    async fn lfront(&self, key: &str) -> Result<Option<String>, StorageError> {
        self.maybe_fail(&self.fail_reads)?;
        self.inner.lfront(key).await
    }

    async fn llen(&self, key: &str) -> Result<u64, StorageError> {
        self.maybe_fail(&self.fail_reads)?;
        self.inner.llen(key).await
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        self.maybe_fail(&self.fail_reads)?;
        self.inner.scan_prefix(prefix).await
    }

    async fn ping(&self) -> Result<(), StorageError> {
        self.inner.ping().await
    }

    async fn used_memory(&self) -> Result<Option<u64>, StorageError> {
        self.inner.used_memory().await
    }
}

struct FailingConnector {
    remote: Arc<FailingRemote>,
}

#[async_trait]
impl Connector for FailingConnector {
    fn describe(&self) -> String {
        "failing://".into()
    }

    async fn connect(&self) -> Result<Arc<dyn RemoteStore>, StorageError> {
        Ok(self.remote.clone() as Arc<dyn RemoteStore>)
    }
}

// =============================================================================
// Helpers
// =============================================================================

fn fast_connection() -> ConnectionConfig {
    ConnectionConfig {
        connect_timeout_ms: 200,
        operation_timeout_ms: 100,
        reconnect_base_delay_ms: 10,
        reconnect_max_delay_ms: 40,
        reconnect_jitter_ms: 0,
        max_retry_time_ms: 200,
        watchdog_interval_ms: 30,
        fallback_probe_interval_ms: 40,
        ..ConnectionConfig::default()
    }
}

fn quick_startup() -> RetryConfig {
    RetryConfig {
        initial_delay: Duration::from_millis(5),
        max_delay: Duration::from_millis(20),
        jitter: Duration::ZERO,
        max_retries: Some(3),
    }
}

fn test_config(dir: &tempfile::TempDir) -> SubstrateConfig {
    SubstrateConfig {
        instance_id: "chaos".into(),
        fallback_dir: dir.path().to_string_lossy().into_owned(),
        connection: fast_connection(),
        ..SubstrateConfig::default()
    }
}

async fn wait_for(manager: &ConnectionManager, wanted: ConnectionState) {
    let mut rx = manager.watch_state();
    tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|s| *s == wanted))
        .await
        .expect("state not reached in time")
        .expect("state channel closed");
}

fn local_file(dir: &tempfile::TempDir, key: &str) -> std::path::PathBuf {
    dir.path().join(format!("{}.json", hex::encode(key)))
}

// =============================================================================
// Injected Operation Failures
// =============================================================================

#[tokio::test]
async fn chaos_failed_remote_read_served_from_mirror() {
    let dir = tempfile::tempdir().unwrap();
    let remote = Arc::new(FailingRemote::new(Arc::new(InMemoryRemote::new())));
    let connector = Arc::new(FailingConnector { remote: remote.clone() });
    let substrate = Substrate::start_with(test_config(&dir), connector, quick_startup())
        .await
        .unwrap();

    substrate.set("doc", &json!({"rev": 1}), None).await;
    remote.fail_reads.store(true, Ordering::SeqCst);

    assert_eq!(substrate.get("doc").await, Some(json!({"rev": 1})));
    assert!(remote.injected.load(Ordering::SeqCst) >= 1);

    // Ping still passes, so the link is kept
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(substrate.connection().state(), ConnectionState::Connected);
    substrate.shutdown().await;
}

#[tokio::test]
async fn chaos_failed_remote_write_lands_locally() {
    let dir = tempfile::tempdir().unwrap();
    let remote = Arc::new(FailingRemote::new(Arc::new(InMemoryRemote::new())));
    let connector = Arc::new(FailingConnector { remote: remote.clone() });
    let substrate = Substrate::start_with(test_config(&dir), connector, quick_startup())
        .await
        .unwrap();

    remote.fail_writes.store(true, Ordering::SeqCst);
    substrate.set("order:1", &json!("pending"), None).await;
    remote.fail_writes.store(false, Ordering::SeqCst);

    // Remote misses, local answers
    assert_eq!(substrate.get("order:1").await, Some(json!("pending")));
    assert!(local_file(&dir, "order:1").exists());

    let health = substrate.connection().health_status().await;
    assert!(health.errors >= 1);
    assert!(health.fallback_operations >= 1);
    substrate.shutdown().await;
}

#[tokio::test]
async fn chaos_rate_limiter_counts_locally_when_remote_incr_fails() {
    let dir = tempfile::tempdir().unwrap();
    let remote = Arc::new(FailingRemote::new(Arc::new(InMemoryRemote::new())));
    let connector = Arc::new(FailingConnector { remote: remote.clone() });
    let mut config = test_config(&dir);
    config.rate_limit.max_requests = 2;
    config.rate_limit.fallback_threshold = 0;
    let substrate = Substrate::start_with(config, connector, quick_startup()).await.unwrap();

    remote.fail_writes.store(true, Ordering::SeqCst);
    let limiter = substrate.rate_limiter();
    assert!(limiter.check_rate_limit("x").await.allowed);
    assert!(limiter.check_rate_limit("x").await.allowed);
    assert!(!limiter.check_rate_limit("x").await.allowed);
    substrate.shutdown().await;
}

// =============================================================================
// Outages and Latency
// =============================================================================

#[tokio::test]
async fn chaos_slow_remote_times_out_to_local() {
    let dir = tempfile::tempdir().unwrap();
    let remote = Arc::new(InMemoryRemote::new());
    let substrate = Substrate::start_with(
        test_config(&dir),
        Arc::new(MemoryConnector::new(remote.clone())),
        quick_startup(),
    )
    .await
    .unwrap();

    substrate.set("slow", &json!(1), None).await;
    remote.set_latency(Duration::from_millis(500));

    let started = Instant::now();
    assert_eq!(substrate.get("slow").await, Some(json!(1)));
    assert!(started.elapsed() < Duration::from_millis(450), "operation not bounded by timeout");

    remote.set_latency(Duration::ZERO);
    substrate.shutdown().await;
}

#[tokio::test]
async fn chaos_flapping_remote_keeps_every_write() {
    let dir = tempfile::tempdir().unwrap();
    let remote = Arc::new(InMemoryRemote::new());
    let substrate = Substrate::start_with(
        test_config(&dir),
        Arc::new(MemoryConnector::new(remote.clone())),
        quick_startup(),
    )
    .await
    .unwrap();

    for round in 0..6 {
        remote.set_reachable(round % 2 == 1);
        for i in 0..5 {
            substrate.set(&format!("flap:{}:{}", round, i), &json!(i), None).await;
        }
    }
    remote.set_reachable(true);
    wait_for(substrate.connection(), ConnectionState::Connected).await;

    for round in 0..6 {
        for i in 0..5 {
            assert_eq!(
                substrate.get(&format!("flap:{}:{}", round, i)).await,
                Some(json!(i)),
                "lost flap:{}:{}",
                round,
                i
            );
        }
    }
    substrate.shutdown().await;
}

#[tokio::test]
async fn chaos_queue_survives_outage_during_promotion() {
    let dir = tempfile::tempdir().unwrap();
    let remote = Arc::new(InMemoryRemote::new());
    let mut config = test_config(&dir);
    config.queue = QueueConfig {
        max_memory_length: 5,
        ..QueueConfig::default()
    };
    let substrate = Substrate::start_with(
        config,
        Arc::new(MemoryConnector::new(remote.clone())),
        quick_startup(),
    )
    .await
    .unwrap();
    let queue = substrate.queue("chaos").await;

    remote.set_reachable(false);
    for i in 0..12 {
        queue.enqueue(json!(i)).await.unwrap();
    }
    remote.set_reachable(true);
    wait_for(substrate.connection(), ConnectionState::Connected).await;

    let mut drained = Vec::new();
    while let Some(item) = queue.dequeue().await {
        drained.push(item.payload);
    }
    assert_eq!(drained, (0..12).map(|i| json!(i)).collect::<Vec<_>>());
    substrate.shutdown().await;
}

#[tokio::test]
async fn chaos_auth_failure_at_startup_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let connector = Arc::new(MemoryConnector::new(Arc::new(InMemoryRemote::new())));
    connector.set_reject_auth(true);

    let result = Substrate::start_with(test_config(&dir), connector.clone(), quick_startup()).await;
    assert!(matches!(result, Err(StorageError::Config(_))));
    assert_eq!(connector.attempts(), 1, "configuration errors must not be retried");
}

// =============================================================================
// Local Store Corruption
// =============================================================================

#[tokio::test]
async fn chaos_corrupt_local_file_treated_as_absent() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(local_file(&dir, "broken"), b"{not json at all").unwrap();
    std::fs::write(local_file(&dir, "fine"), br#"{"value": 42, "ttl": null}"#).unwrap();

    let local = Arc::new(LocalFallbackStore::open(dir.path()).await);
    assert_eq!(local.get("broken").await.unwrap(), None);
    assert_eq!(local.get("fine").await.unwrap(), Some(json!(42)));
    assert_eq!(local.stats().corrupt_removed, 1);
    assert!(!local_file(&dir, "broken").exists());
}

#[tokio::test]
async fn chaos_stale_local_file_expires_on_read() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(local_file(&dir, "old"), br#"{"value": "stale", "ttl": 1}"#).unwrap();

    let remote = Arc::new(InMemoryRemote::new());
    remote.set_reachable(false);
    let substrate = Substrate::start_with(
        test_config(&dir),
        Arc::new(MemoryConnector::new(remote)),
        quick_startup(),
    )
    .await
    .unwrap();

    assert_eq!(substrate.get("old").await, None);
    assert!(!local_file(&dir, "old").exists());
    substrate.shutdown().await;
}

#[tokio::test]
async fn chaos_garbage_in_fallback_dir_does_not_break_startup() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("not-hex.json"), b"\x00\xff garbage").unwrap();
    std::fs::write(local_file(&dir, "q"), b"").unwrap();

    let remote = Arc::new(InMemoryRemote::new());
    remote.set_reachable(false);
    let substrate = Substrate::start_with(
        test_config(&dir),
        Arc::new(MemoryConnector::new(remote)),
        quick_startup(),
    )
    .await
    .expect("startup must tolerate a dirty fallback directory");

    substrate.set("after", &json!(true), None).await;
    assert_eq!(substrate.get("after").await, Some(json!(true)));
    assert_eq!(substrate.get("q").await, None);
    substrate.shutdown().await;
}
