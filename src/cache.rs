// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Two-level cache: an in-process memory tier over the connection manager.
//!
//! ```text
//! set ──► memory (sync, always succeeds) ──spawn──► manager.set (best effort)
//! get ──► memory ──miss──► manager.get ──hit──► repopulate memory
//! ```
//!
//! Remote keys live under the cache namespace (default `cache:`), and
//! `flush` only ever deletes inside it. The memory tier holds at most
//! `max_memory_entries`; when full, expired entries go first, then the
//! entry closest to expiry.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info};

use crate::config::CacheConfig;
use crate::connection::ConnectionManager;
use crate::metrics;

#[derive(Debug, Clone)]
struct MemoryEntry {
    value: Value,
    expires_at: Instant,
}

/// Per-key lookup counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct KeyStats {
    pub hits: u64,
    pub misses: u64,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub memory_hits: u64,
    pub remote_hits: u64,
    pub evictions: u64,
    pub memory_entries: usize,
    pub hit_rate: f64,
}

pub struct TieredCache {
    manager: Arc<ConnectionManager>,
    config: CacheConfig,
    memory: DashMap<String, MemoryEntry>,
    key_stats: DashMap<String, KeyStats>,
    memory_enabled: AtomicBool,
    hits: AtomicU64,
    misses: AtomicU64,
    memory_hits: AtomicU64,
    remote_hits: AtomicU64,
    evictions: AtomicU64,
}

impl TieredCache {
    pub fn new(manager: Arc<ConnectionManager>, config: CacheConfig) -> Self {
        Self {
            manager,
            config,
            memory: DashMap::new(),
            key_stats: DashMap::new(),
            memory_enabled: AtomicBool::new(true),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            memory_hits: AtomicU64::new(0),
            remote_hits: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    fn remote_key(&self, key: &str) -> String {
        format!("{}{}", self.config.namespace, key)
    }

    fn remote_ttl(&self, ttl: Option<Duration>) -> Duration {
        ttl.unwrap_or(Duration::from_secs(self.config.default_ttl_secs))
    }

    fn memory_ttl(&self, remote_ttl: Duration) -> Duration {
        remote_ttl.min(Duration::from_secs(self.config.memory_ttl_secs))
    }

    /// Cache a value. The memory write happens before this returns; the
    /// remote mirror runs in the background.
    pub fn set(&self, key: &str, value: Value, ttl: Option<Duration>) {
        let ttl = self.remote_ttl(ttl);
        self.insert_memory(key, value.clone(), self.memory_ttl(ttl));

        let manager = Arc::clone(&self.manager);
        let remote_key = self.remote_key(key);
        tokio::spawn(async move {
            manager.set(&remote_key, &value, Some(ttl)).await;
        });
    }

    /// Like [`set`](Self::set), but waits for the remote mirror.
    pub async fn set_through(&self, key: &str, value: Value, ttl: Option<Duration>) {
        let ttl = self.remote_ttl(ttl);
        self.insert_memory(key, value.clone(), self.memory_ttl(ttl));
        self.manager.set(&self.remote_key(key), &value, Some(ttl)).await;
    }

    pub async fn get(&self, key: &str) -> Option<Value> {
        if let Some(value) = self.memory_get(key) {
            self.memory_hits.fetch_add(1, Ordering::Relaxed);
            metrics::record_cache_lookup("memory", true);
            self.count(key, true);
            return Some(value);
        }
        metrics::record_cache_lookup("memory", false);

        match self.manager.get_with_ttl(&self.remote_key(key)).await {
            Some((value, remaining)) => {
                self.remote_hits.fetch_add(1, Ordering::Relaxed);
                metrics::record_cache_lookup("remote", true);
                self.count(key, true);
                // Never outlive the remote entry
                let ttl = self.memory_ttl(remaining.unwrap_or_else(|| self.remote_ttl(None)));
                self.insert_memory(key, value.clone(), ttl);
                Some(value)
            }
            None => {
                metrics::record_cache_lookup("remote", false);
                self.count(key, false);
                None
            }
        }
    }

    /// Remove from both tiers. Returns whether either tier held the key.
    pub async fn delete(&self, key: &str) -> bool {
        let in_memory = self.memory.remove(key).is_some();
        let remote = self.manager.del(&self.remote_key(key)).await;
        metrics::set_cache_entries(self.memory.len());
        in_memory || remote
    }

    /// Drop every entry of this cache, memory and remote. Keys outside the
    /// namespace are never touched. Returns the remote keys removed.
    pub async fn flush(&self) -> usize {
        self.memory.clear();
        let removed = self.manager.del_prefix(&self.config.namespace).await;
        metrics::set_cache_entries(0);
        info!(namespace = %self.config.namespace, removed, "Cache flushed");
        removed
    }

    /// Turn the memory tier on or off. Disabling clears it.
    pub fn set_memory_enabled(&self, enabled: bool) {
        self.memory_enabled.store(enabled, Ordering::SeqCst);
        if !enabled {
            self.memory.clear();
            metrics::set_cache_entries(0);
        }
        info!(enabled, "Cache memory tier toggled");
    }

    #[must_use]
    pub fn memory_enabled(&self) -> bool {
        self.memory_enabled.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn key_stats(&self, key: &str) -> Option<KeyStats> {
        self.key_stats.get(key).map(|s| *s)
    }

    #[must_use]
    pub fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        CacheStats {
            hits,
            misses,
            memory_hits: self.memory_hits.load(Ordering::Relaxed),
            remote_hits: self.remote_hits.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            memory_entries: self.memory.len(),
            hit_rate: if total == 0 { 0.0 } else { hits as f64 / total as f64 },
        }
    }

    /// Remove expired memory entries. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.memory.len();
        self.memory.retain(|_, entry| entry.expires_at > now);
        let removed = before.saturating_sub(self.memory.len());
        metrics::set_cache_entries(self.memory.len());
        removed
    }

    fn count(&self, key: &str, hit: bool) {
        if hit {
            self.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
        let mut stats = self.key_stats.entry(key.to_string()).or_default();
        if hit {
            stats.hits += 1;
        } else {
            stats.misses += 1;
        }
    }

    fn memory_get(&self, key: &str) -> Option<Value> {
        if !self.memory_enabled() {
            return None;
        }
        let now = Instant::now();
        // Drop an expired entry on the way
        self.memory.remove_if(key, |_, entry| entry.expires_at <= now);
        self.memory.get(key).map(|entry| entry.value.clone())
    }

    fn insert_memory(&self, key: &str, value: Value, ttl: Duration) {
        if !self.memory_enabled() || ttl.is_zero() {
            return;
        }
        if !self.memory.contains_key(key) && self.memory.len() >= self.config.max_memory_entries {
            self.make_room();
        }
        self.memory.insert(
            key.to_string(),
            MemoryEntry {
                value,
                expires_at: Instant::now() + ttl,
            },
        );
        metrics::set_cache_entries(self.memory.len());
    }

    fn make_room(&self) {
        let mut evicted = self.purge_expired();
        while self.memory.len() >= self.config.max_memory_entries {
            let victim = self
                .memory
                .iter()
                .min_by_key(|e| e.value().expires_at)
                .map(|e| e.key().clone());
            let Some(victim) = victim else {
                break;
            };
            self.memory.remove(&victim);
            evicted += 1;
        }
        if evicted > 0 {
            self.evictions.fetch_add(evicted as u64, Ordering::Relaxed);
            metrics::record_cache_eviction(evicted);
            debug!(evicted, "Cache memory tier made room");
        }
    }
}
