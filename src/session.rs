// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Periodic session snapshots.
//!
//! Each backup writes two keys through the connection manager:
//!
//! ```text
//! session:<id>     → caller's session blob
//! session_ts:<id>  → epoch millis of the backup
//! ```
//!
//! Timestamps live in their own namespace, so no session id can land on
//! another session's timestamp key.
//!
//! The manager keeps no registry of live sessions. The periodic timer asks a
//! caller-supplied [`SessionSource`] for the current set on every tick.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::config::SessionBackupConfig;
use crate::connection::ConnectionManager;
use crate::metrics;
use crate::storage::epoch_millis;

/// Enumerates the sessions that should be snapshotted on a timer tick.
#[async_trait]
pub trait SessionSource: Send + Sync {
    async fn live_sessions(&self) -> Vec<(String, Value)>;
}

pub struct SessionBackupManager {
    manager: Arc<ConnectionManager>,
    config: SessionBackupConfig,
    source: RwLock<Option<Arc<dyn SessionSource>>>,
    timer: Mutex<Option<JoinHandle<()>>>,
    backups: AtomicU64,
}

impl SessionBackupManager {
    pub fn new(manager: Arc<ConnectionManager>, config: SessionBackupConfig) -> Self {
        Self {
            manager,
            config,
            source: RwLock::new(None),
            timer: Mutex::new(None),
            backups: AtomicU64::new(0),
        }
    }

    fn blob_key(id: &str) -> String {
        format!("session:{}", id)
    }

    fn timestamp_key(id: &str) -> String {
        format!("session_ts:{}", id)
    }

    fn ttl(&self) -> Option<Duration> {
        self.config.backup_ttl_secs.map(Duration::from_secs)
    }

    pub fn set_source(&self, source: Arc<dyn SessionSource>) {
        *self.source.write() = Some(source);
    }

    /// Number of session snapshots written since creation.
    #[must_use]
    pub fn backups_written(&self) -> u64 {
        self.backups.load(Ordering::Relaxed)
    }

    /// Overwrites any previous snapshot of `id`.
    #[tracing::instrument(skip(self, blob))]
    pub async fn backup_session(&self, id: &str, blob: &Value) {
        let ttl = self.ttl();
        self.manager.set(&Self::blob_key(id), blob, ttl).await;
        self.manager
            .set(&Self::timestamp_key(id), &Value::from(epoch_millis()), ttl)
            .await;
        self.backups.fetch_add(1, Ordering::Relaxed);
        debug!(session = %id, "Session backed up");
    }

    pub async fn restore_session(&self, id: &str) -> Option<Value> {
        self.manager.get(&Self::blob_key(id)).await
    }

    /// Epoch millis of the latest backup of `id`.
    pub async fn last_backup_time(&self, id: &str) -> Option<u64> {
        self.manager
            .get(&Self::timestamp_key(id))
            .await
            .and_then(|v| v.as_u64())
    }

    pub async fn delete_backup(&self, id: &str) -> bool {
        let removed = self.manager.del(&Self::blob_key(id)).await;
        self.manager.del(&Self::timestamp_key(id)).await;
        removed
    }

    /// Snapshot every session the source reports. Returns how many were written.
    pub async fn backup_all(&self) -> usize {
        let source = self.source.read().clone();
        let Some(source) = source else {
            debug!("No session source registered, skipping backup");
            return 0;
        };

        let sessions = source.live_sessions().await;
        for (id, blob) in &sessions {
            self.backup_session(id, blob).await;
        }
        metrics::record_session_backup("ok", sessions.len());
        if !sessions.is_empty() {
            info!(count = sessions.len(), "Session backup pass complete");
        }
        sessions.len()
    }

    /// Start the periodic backup timer. No-op when already running.
    pub fn start(self: &Arc<Self>) {
        let mut timer = self.timer.lock();
        if timer.as_ref().is_some_and(|t| !t.is_finished()) {
            return;
        }
        let interval = Duration::from_secs(self.config.backup_interval_secs.max(1));
        let weak = Arc::downgrade(self);
        *timer = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(this) = weak.upgrade() else { break };
                this.backup_all().await;
            }
        }));
        info!(interval_secs = interval.as_secs(), "Session backup timer started");
    }

    pub fn stop(&self) {
        if let Some(handle) = self.timer.lock().take() {
            handle.abort();
            info!("Session backup timer stopped");
        }
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.timer.lock().as_ref().is_some_and(|t| !t.is_finished())
    }
}

impl Drop for SessionBackupManager {
    fn drop(&mut self) {
        if let Some(handle) = self.timer.get_mut().take() {
            handle.abort();
        }
    }
}

/// Sessions held in a shared map; handy when the caller already keeps one.
#[derive(Default)]
pub struct SessionMap {
    sessions: RwLock<std::collections::HashMap<String, Value>>,
}

impl SessionMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, id: impl Into<String>, blob: Value) {
        self.sessions.write().insert(id.into(), blob);
    }

    pub fn remove(&self, id: &str) -> Option<Value> {
        self.sessions.write().remove(id)
    }
}

#[async_trait]
impl SessionSource for SessionMap {
    async fn live_sessions(&self) -> Vec<(String, Value)> {
        self.sessions
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}
