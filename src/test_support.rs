// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Shared fixtures for unit tests.

use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use crate::config::ConnectionConfig;
use crate::connection::{ConnectionManager, ConnectionState};
use crate::storage::local::LocalFallbackStore;
use crate::storage::memory::{InMemoryRemote, MemoryConnector};

/// Millisecond-scale timings so lifecycle tests finish quickly.
pub fn fast_connection_config() -> ConnectionConfig {
    ConnectionConfig {
        redis_url: None,
        key_prefix: None,
        connect_timeout_ms: 200,
        operation_timeout_ms: 200,
        reconnect_base_delay_ms: 5,
        reconnect_max_delay_ms: 20,
        reconnect_jitter_ms: 0,
        max_retry_time_ms: 150,
        watchdog_interval_ms: 20,
        fallback_probe_interval_ms: 30,
        mirror_writes_locally: true,
    }
}

pub struct Harness {
    pub manager: Arc<ConnectionManager>,
    pub remote: Arc<InMemoryRemote>,
    pub connector: Arc<MemoryConnector>,
    /// Keeps the fallback directory alive for the test's duration
    pub dir: TempDir,
}

pub async fn harness_with(config: ConnectionConfig) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let local = Arc::new(LocalFallbackStore::open(dir.path()).await);
    let remote = Arc::new(InMemoryRemote::new());
    let connector = Arc::new(MemoryConnector::new(remote.clone()));
    let manager = ConnectionManager::new(connector.clone(), config, local);
    Harness { manager, remote, connector, dir }
}

/// Harness with the manager already connected.
pub async fn connected_harness() -> Harness {
    let harness = harness_with(fast_connection_config()).await;
    harness.manager.connect().await.unwrap();
    harness
}

pub async fn wait_for_state(manager: &ConnectionManager, wanted: ConnectionState) {
    let mut rx = manager.watch_state();
    tokio::time::timeout(Duration::from_secs(3), rx.wait_for(|s| *s == wanted))
        .await
        .expect("state not reached in time")
        .unwrap();
}
