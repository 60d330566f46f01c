// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! In-process remote tier.
//!
//! Behaves like the Redis tier (TTLs, fixed windows, lists, prefix scans) and
//! can be made unreachable at runtime, which is how tests simulate outages.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;

use super::traits::{Connector, RemoteStore, StorageError};

#[derive(Debug, Clone)]
enum Stored {
    Str(String),
    List(VecDeque<String>),
}

#[derive(Debug, Clone)]
struct Slot {
    data: Stored,
    expires_at: Option<Instant>,
}

impl Slot {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

pub struct InMemoryRemote {
    data: DashMap<String, Slot>,
    reachable: AtomicBool,
    operations: AtomicU64,
    latency_ms: AtomicU64,
}

impl InMemoryRemote {
    #[must_use]
    pub fn new() -> Self {
        Self {
            data: DashMap::new(),
            reachable: AtomicBool::new(true),
            operations: AtomicU64::new(0),
            latency_ms: AtomicU64::new(0),
        }
    }

    /// Simulate the server going away (`false`) or coming back (`true`).
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_reachable(&self) -> bool {
        self.reachable.load(Ordering::SeqCst)
    }

    /// Live (non-expired) key count, reachable or not.
    #[must_use]
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.data.iter().filter(|e| !e.value().is_expired(now)).count()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Operations served since creation.
    #[must_use]
    pub fn operations(&self) -> u64 {
        self.operations.load(Ordering::Relaxed)
    }

    pub fn clear(&self) {
        self.data.clear();
    }

    /// Delay every operation, e.g. to push calls past a timeout.
    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms.store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    async fn gate(&self) -> Result<(), StorageError> {
        let latency = self.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        self.check()
    }

    fn check(&self) -> Result<(), StorageError> {
        if !self.is_reachable() {
            return Err(StorageError::Backend("connection refused".into()));
        }
        self.operations.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Drop the key if expired; returns whether a live slot remains.
    fn purge_if_expired(&self, key: &str) -> bool {
        let now = Instant::now();
        self.data.remove_if(key, |_, slot| slot.is_expired(now));
        self.data.contains_key(key)
    }

    fn wrong_type(key: &str) -> StorageError {
        StorageError::Backend(format!("WRONGTYPE operation against key '{}'", key))
    }
}

impl Default for InMemoryRemote {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RemoteStore for InMemoryRemote {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        self.gate().await?;
        if !self.purge_if_expired(key) {
            return Ok(None);
        }
        match self.data.get(key).map(|s| s.data.clone()) {
            Some(Stored::Str(value)) => Ok(Some(value)),
            Some(Stored::List(_)) => Err(Self::wrong_type(key)),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StorageError> {
        self.gate().await?;
        self.data.insert(
            key.to_string(),
            Slot {
                data: Stored::Str(value.to_string()),
                expires_at: ttl.map(|t| Instant::now() + t),
            },
        );
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<bool, StorageError> {
        self.gate().await?;
        let live = self.purge_if_expired(key);
        Ok(live && self.data.remove(key).is_some())
    }

    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        self.gate().await?;
        Ok(self.purge_if_expired(key))
    }

    async fn pttl(&self, key: &str) -> Result<Option<Duration>, StorageError> {
        self.gate().await?;
        if !self.purge_if_expired(key) {
            return Ok(Some(Duration::ZERO));
        }
        let now = Instant::now();
        Ok(self
            .data
            .get(key)
            .and_then(|slot| slot.expires_at)
            .map(|at| at.saturating_duration_since(now)))
    }

    async fn incr_with_expiry(&self, key: &str, window: Duration) -> Result<u64, StorageError> {
        self.gate().await?;
        self.purge_if_expired(key);
        let mut slot = self.data.entry(key.to_string()).or_insert_with(|| Slot {
            data: Stored::Str("0".into()),
            expires_at: None,
        });
        let current = match &slot.data {
            Stored::Str(v) => v
                .parse::<u64>()
                .map_err(|_| StorageError::Backend(format!("value at '{}' is not an integer", key)))?,
            Stored::List(_) => return Err(Self::wrong_type(key)),
        };
        let next = current + 1;
        slot.data = Stored::Str(next.to_string());
        if next == 1 {
            slot.expires_at = Some(Instant::now() + window);
        }
        Ok(next)
    }

    async fn rpush(&self, key: &str, values: &[String]) -> Result<u64, StorageError> {
        self.gate().await?;
        self.purge_if_expired(key);
        let mut slot = self.data.entry(key.to_string()).or_insert_with(|| Slot {
            data: Stored::List(VecDeque::new()),
            expires_at: None,
        });
        match &mut slot.data {
            Stored::List(list) => {
                list.extend(values.iter().cloned());
                Ok(list.len() as u64)
            }
            Stored::Str(_) => Err(Self::wrong_type(key)),
        }
    }

    async fn lpop(&self, key: &str, count: usize) -> Result<Vec<String>, StorageError> {
        self.gate().await?;
        if !self.purge_if_expired(key) {
            return Ok(Vec::new());
        }
        let popped = {
            let Some(mut slot) = self.data.get_mut(key) else {
                return Ok(Vec::new());
            };
            match &mut slot.data {
                Stored::List(list) => {
                    let n = count.min(list.len());
                    list.drain(..n).collect::<Vec<_>>()
                }
                Stored::Str(_) => return Err(Self::wrong_type(key)),
            }
        };
        // Redis deletes a list once it is empty
        self.data.remove_if(key, |_, slot| matches!(&slot.data, Stored::List(l) if l.is_empty()));
        Ok(popped)
    }

    async fn lfront(&self, key: &str) -> Result<Option<String>, StorageError> {
        self.gate().await?;
        if !self.purge_if_expired(key) {
            return Ok(None);
        }
        match self.data.get(key).map(|s| s.data.clone()) {
            Some(Stored::List(list)) => Ok(list.front().cloned()),
            Some(Stored::Str(_)) => Err(Self::wrong_type(key)),
            None => Ok(None),
        }
    }

    async fn llen(&self, key: &str) -> Result<u64, StorageError> {
        self.gate().await?;
        if !self.purge_if_expired(key) {
            return Ok(0);
        }
        match self.data.get(key).map(|s| s.data.clone()) {
            Some(Stored::List(list)) => Ok(list.len() as u64),
            Some(Stored::Str(_)) => Err(Self::wrong_type(key)),
            None => Ok(0),
        }
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        self.gate().await?;
        let now = Instant::now();
        let mut keys: Vec<String> = self
            .data
            .iter()
            .filter(|e| e.key().starts_with(prefix) && !e.value().is_expired(now))
            .map(|e| e.key().clone())
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn ping(&self) -> Result<(), StorageError> {
        self.gate().await
    }

    async fn used_memory(&self) -> Result<Option<u64>, StorageError> {
        self.gate().await?;
        let bytes = self
            .data
            .iter()
            .map(|e| {
                let payload = match &e.value().data {
                    Stored::Str(v) => v.len(),
                    Stored::List(l) => l.iter().map(String::len).sum(),
                };
                e.key().len() + payload
            })
            .sum::<usize>();
        Ok(Some(bytes as u64))
    }
}

/// Connector handing out a shared [`InMemoryRemote`].
///
/// Connecting fails while the remote is unreachable, and fails with a
/// configuration error while `reject_auth` is set.
pub struct MemoryConnector {
    remote: Arc<InMemoryRemote>,
    reject_auth: AtomicBool,
    attempts: AtomicU64,
}

impl MemoryConnector {
    #[must_use]
    pub fn new(remote: Arc<InMemoryRemote>) -> Self {
        Self {
            remote,
            reject_auth: AtomicBool::new(false),
            attempts: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn remote(&self) -> Arc<InMemoryRemote> {
        self.remote.clone()
    }

    /// Make subsequent connects fail as if the credentials were wrong.
    pub fn set_reject_auth(&self, reject: bool) {
        self.reject_auth.store(reject, Ordering::SeqCst);
    }

    /// Connect attempts made so far.
    #[must_use]
    pub fn attempts(&self) -> u64 {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    fn describe(&self) -> String {
        "memory://".to_string()
    }

    async fn connect(&self) -> Result<Arc<dyn RemoteStore>, StorageError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.reject_auth.load(Ordering::SeqCst) {
            return Err(StorageError::Config("WRONGPASS invalid username-password pair".into()));
        }
        if !self.remote.is_reachable() {
            return Err(StorageError::Backend("connection refused".into()));
        }
        Ok(self.remote.clone() as Arc<dyn RemoteStore>)
    }
}
