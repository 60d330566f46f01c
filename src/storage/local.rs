// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Local fallback store.
//!
//! When the remote tier is unavailable, state lands here instead: one JSON
//! file per key under a dedicated directory, so a restart or an outage does
//! not lose what was written.
//!
//! ```text
//! <dir>/<hex(key)>.json         {"value": <json>, "ttl": <epoch ms> | null}
//! <dir>/sha256-<digest>.json    {"value": ..., "ttl": ..., "key": <key>}
//! ```
//!
//! Keys longer than 100 bytes are named by their SHA-256 digest so file
//! names stay under the 255-byte limit; the file then records the key.
//!
//! - Writes go to a temp file and are renamed into place, serialized per key.
//! - An expired entry is deleted on read and by the periodic sweep.
//! - An entry that fails to decode is treated as absent and removed.
//!
//! List and counter helpers store a JSON array / number under the key and
//! do read-modify-write under the same per-key lock, which lets queues and
//! rate windows degrade onto disk with the rest of the state.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::epoch_millis;
use super::traits::StorageError;

const ENTRY_SUFFIX: &str = ".json";
const TEMP_SUFFIX: &str = ".tmp";
const HASHED_PREFIX: &str = "sha256-";
/// Longest key still stored under its hex name.
const MAX_HEX_KEY_LEN: usize = 100;

/// On-disk entry layout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalEntry {
    pub value: Value,
    /// Absolute expiry in epoch milliseconds; `None` never expires.
    pub ttl: Option<u64>,
}

impl LocalEntry {
    #[must_use]
    pub fn new(value: Value, ttl: Option<Duration>) -> Self {
        Self {
            value,
            ttl: ttl.map(|t| epoch_millis().saturating_add(t.as_millis() as u64)),
        }
    }

    #[must_use]
    pub fn is_expired_at(&self, now_millis: u64) -> bool {
        self.ttl.is_some_and(|at| at <= now_millis)
    }
}

/// What goes to disk: the entry, plus the key when the name is a digest.
#[derive(Serialize)]
struct StoredEntry<'a> {
    #[serde(flatten)]
    entry: &'a LocalEntry,
    #[serde(skip_serializing_if = "Option::is_none")]
    key: Option<&'a str>,
}

#[derive(Deserialize)]
struct NamedEntry {
    key: Option<String>,
}

fn file_stem(key: &str) -> String {
    if key.len() <= MAX_HEX_KEY_LEN {
        hex::encode(key)
    } else {
        format!("{}{}", HASHED_PREFIX, hex::encode(Sha256::digest(key.as_bytes())))
    }
}

/// Decode raw file contents. Never panics on arbitrary input.
pub fn decode_entry(key: &str, bytes: &[u8]) -> Result<LocalEntry, StorageError> {
    serde_json::from_slice(bytes).map_err(|e| StorageError::Serialization {
        key: key.to_string(),
        message: e.to_string(),
    })
}

/// Counters for observability
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalStats {
    pub writes: u64,
    pub reads: u64,
    pub expired_removed: u64,
    pub corrupt_removed: u64,
    pub write_failures: u64,
}

pub struct LocalFallbackStore {
    dir: PathBuf,
    locks: DashMap<String, Arc<Mutex<()>>>,
    writes: AtomicU64,
    reads: AtomicU64,
    expired_removed: AtomicU64,
    corrupt_removed: AtomicU64,
    write_failures: AtomicU64,
}

impl LocalFallbackStore {
    /// Open (creating if needed) the store directory.
    ///
    /// A directory that cannot be created is not fatal: the store still
    /// opens, and every later write reports the failure.
    pub async fn open(dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref().to_path_buf();
        match fs::create_dir_all(&dir).await {
            Ok(()) => info!(dir = %dir.display(), "Local fallback store ready"),
            Err(e) => warn!(
                dir = %dir.display(),
                error = %e,
                "Local fallback directory unusable, local writes will fail"
            ),
        }

        Self {
            dir,
            locks: DashMap::new(),
            writes: AtomicU64::new(0),
            reads: AtomicU64::new(0),
            expired_removed: AtomicU64::new(0),
            corrupt_removed: AtomicU64::new(0),
            write_failures: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    #[must_use]
    pub fn stats(&self) -> LocalStats {
        LocalStats {
            writes: self.writes.load(Ordering::Relaxed),
            reads: self.reads.load(Ordering::Relaxed),
            expired_removed: self.expired_removed.load(Ordering::Relaxed),
            corrupt_removed: self.corrupt_removed.load(Ordering::Relaxed),
            write_failures: self.write_failures.load(Ordering::Relaxed),
        }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}{}", file_stem(key), ENTRY_SUFFIX))
    }

    fn lock_for(&self, key: &str) -> Arc<Mutex<()>> {
        self.locks.entry(key.to_string()).or_default().clone()
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Unlocked primitives (callers hold the key lock)
    // ═══════════════════════════════════════════════════════════════════════

    async fn load(&self, key: &str) -> Result<Option<LocalEntry>, StorageError> {
        let path = self.path_for(key);
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        self.reads.fetch_add(1, Ordering::Relaxed);

        let entry = match decode_entry(key, &bytes) {
            Ok(entry) => entry,
            Err(e) => {
                warn!(key, error = %e, "Discarding corrupt local entry");
                self.corrupt_removed.fetch_add(1, Ordering::Relaxed);
                crate::metrics::record_corruption("local");
                remove_quietly(&path).await;
                return Ok(None);
            }
        };

        if entry.is_expired_at(epoch_millis()) {
            self.expired_removed.fetch_add(1, Ordering::Relaxed);
            remove_quietly(&path).await;
            return Ok(None);
        }
        Ok(Some(entry))
    }

    async fn store(&self, key: &str, entry: &LocalEntry) -> Result<(), StorageError> {
        let stored = StoredEntry {
            entry,
            key: (key.len() > MAX_HEX_KEY_LEN).then_some(key),
        };
        let bytes = serde_json::to_vec(&stored).map_err(|e| StorageError::Serialization {
            key: key.to_string(),
            message: e.to_string(),
        })?;
        let path = self.path_for(key);
        let temp = self.dir.join(format!("{}{}", file_stem(key), TEMP_SUFFIX));

        let result = match self.write_atomic(&temp, &path, &bytes).await {
            // Directory removed underneath us: recreate once and retry.
            Err(e) if e.kind() == ErrorKind::NotFound => {
                fs::create_dir_all(&self.dir).await?;
                self.write_atomic(&temp, &path, &bytes).await
            }
            other => other,
        };

        match result {
            Ok(()) => {
                self.writes.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(e) => {
                self.write_failures.fetch_add(1, Ordering::Relaxed);
                remove_quietly(&temp).await;
                Err(e.into())
            }
        }
    }

    async fn write_atomic(&self, temp: &Path, path: &Path, bytes: &[u8]) -> std::io::Result<()> {
        fs::write(temp, bytes).await?;
        fs::rename(temp, path).await
    }

    async fn remove(&self, key: &str) -> Result<bool, StorageError> {
        match fs::remove_file(self.path_for(key)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Key/value
    // ═══════════════════════════════════════════════════════════════════════

    pub async fn get(&self, key: &str) -> Result<Option<Value>, StorageError> {
        let lock = self.lock_for(key);
        let _guard = lock.lock().await;
        Ok(self.load(key).await?.map(|e| e.value))
    }

    /// Value plus remaining time to live (`None` never expires).
    pub async fn get_with_ttl(&self, key: &str) -> Result<Option<(Value, Option<Duration>)>, StorageError> {
        let lock = self.lock_for(key);
        let _guard = lock.lock().await;
        let now = epoch_millis();
        Ok(self.load(key).await?.map(|entry| {
            let remaining = entry.ttl.map(|at| Duration::from_millis(at.saturating_sub(now)));
            (entry.value, remaining)
        }))
    }

    pub async fn set(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<(), StorageError> {
        let lock = self.lock_for(key);
        let _guard = lock.lock().await;
        self.store(key, &LocalEntry::new(value, ttl)).await?;
        debug!(key, "Local entry written");
        Ok(())
    }

    pub async fn del(&self, key: &str) -> Result<bool, StorageError> {
        let lock = self.lock_for(key);
        let _guard = lock.lock().await;
        // An expired entry counts as already gone
        let live = self.load(key).await?.is_some();
        self.remove(key).await?;
        Ok(live)
    }

    pub async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        let lock = self.lock_for(key);
        let _guard = lock.lock().await;
        Ok(self.load(key).await?.is_some())
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Lists and counters
    // ═══════════════════════════════════════════════════════════════════════

    async fn load_list(&self, key: &str) -> Result<(Vec<Value>, Option<u64>), StorageError> {
        match self.load(key).await? {
            None => Ok((Vec::new(), None)),
            Some(LocalEntry { value: Value::Array(items), ttl }) => Ok((items, ttl)),
            Some(_) => Err(StorageError::Serialization {
                key: key.to_string(),
                message: "local entry is not a list".into(),
            }),
        }
    }

    /// Append to the tail of a list. Returns the new length.
    pub async fn rpush(&self, key: &str, values: Vec<Value>) -> Result<u64, StorageError> {
        let lock = self.lock_for(key);
        let _guard = lock.lock().await;
        let (mut items, ttl) = self.load_list(key).await?;
        if values.is_empty() {
            return Ok(items.len() as u64);
        }
        items.extend(values);
        let len = items.len() as u64;
        self.store(key, &LocalEntry { value: Value::Array(items), ttl }).await?;
        Ok(len)
    }

    /// Pop up to `count` values from the head of a list.
    pub async fn lpop(&self, key: &str, count: usize) -> Result<Vec<Value>, StorageError> {
        let lock = self.lock_for(key);
        let _guard = lock.lock().await;
        let (mut items, ttl) = self.load_list(key).await?;
        if items.is_empty() || count == 0 {
            return Ok(Vec::new());
        }
        let n = count.min(items.len());
        let popped: Vec<Value> = items.drain(..n).collect();
        if items.is_empty() {
            self.remove(key).await?;
        } else {
            self.store(key, &LocalEntry { value: Value::Array(items), ttl }).await?;
        }
        Ok(popped)
    }

    pub async fn lfront(&self, key: &str) -> Result<Option<Value>, StorageError> {
        let lock = self.lock_for(key);
        let _guard = lock.lock().await;
        let (items, _) = self.load_list(key).await?;
        Ok(items.into_iter().next())
    }

    pub async fn llen(&self, key: &str) -> Result<u64, StorageError> {
        let lock = self.lock_for(key);
        let _guard = lock.lock().await;
        let (items, _) = self.load_list(key).await?;
        Ok(items.len() as u64)
    }

    /// Fixed-window counter. The first increment of a window sets its expiry.
    pub async fn incr_with_expiry(&self, key: &str, window: Duration) -> Result<u64, StorageError> {
        let lock = self.lock_for(key);
        let _guard = lock.lock().await;
        let (current, ttl) = match self.load(key).await? {
            Some(LocalEntry { value, ttl }) => (value.as_u64().unwrap_or(0), ttl),
            None => (0, None),
        };
        let next = current + 1;
        let entry = if current == 0 {
            LocalEntry::new(Value::from(next), Some(window))
        } else {
            LocalEntry { value: Value::from(next), ttl }
        };
        self.store(key, &entry).await?;
        Ok(next)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Scans and maintenance
    // ═══════════════════════════════════════════════════════════════════════

    /// Keys of every entry file, live or not. Hex names decode directly;
    /// digest names are resolved from the key recorded in the file.
    async fn stored_keys(&self) -> Result<Vec<String>, StorageError> {
        let mut dir = match fs::read_dir(&self.dir).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut keys = Vec::new();
        while let Some(dirent) = dir.next_entry().await? {
            let name = dirent.file_name();
            let Some(stem) = name.to_str().and_then(|n| n.strip_suffix(ENTRY_SUFFIX)) else {
                continue;
            };
            let key = if stem.starts_with(HASHED_PREFIX) {
                recorded_key(&dirent.path()).await
            } else {
                hex::decode(stem).ok().and_then(|raw| String::from_utf8(raw).ok())
            };
            match key {
                Some(key) => keys.push(key),
                None => debug!(file = %stem, "Ignoring foreign file in local store"),
            }
        }
        Ok(keys)
    }

    /// Live keys starting with `prefix`, sorted.
    pub async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let mut live = Vec::new();
        for key in self.stored_keys().await? {
            if key.starts_with(prefix) && self.exists(&key).await? {
                live.push(key);
            }
        }
        live.sort();
        Ok(live)
    }

    /// Number of entry files on disk (expired ones included until swept).
    pub async fn len(&self) -> Result<usize, StorageError> {
        Ok(self.stored_keys().await?.len())
    }

    pub async fn is_empty(&self) -> Result<bool, StorageError> {
        Ok(self.len().await? == 0)
    }

    /// Remove expired and corrupt entries. Returns how many were removed.
    pub async fn sweep_expired(&self) -> Result<usize, StorageError> {
        let keys = self.stored_keys().await?;
        let mut removed = 0;
        for key in &keys {
            // load() deletes expired/corrupt files as a side effect
            if !self.exists(key).await? {
                removed += 1;
            }
        }
        // Drop lock slots nobody is holding
        self.locks.retain(|_, lock| Arc::strong_count(lock) > 1);

        let remaining = keys.len() - removed;
        crate::metrics::set_local_entries(remaining);
        if removed > 0 {
            crate::metrics::record_local_swept(removed);
            debug!(removed, remaining, "Local sweep removed expired entries");
        }
        Ok(removed)
    }

    /// Spawn the periodic sweep. The task ends when the store is dropped.
    pub fn start_sweeper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(store) = weak.upgrade() else {
                    break;
                };
                if let Err(e) = store.sweep_expired().await {
                    warn!(error = %e, "Local sweep failed");
                }
            }
        })
    }
}

async fn recorded_key(path: &Path) -> Option<String> {
    let bytes = fs::read(path).await.ok()?;
    serde_json::from_slice::<NamedEntry>(&bytes).ok()?.key
}

async fn remove_quietly(path: &Path) {
    if let Err(e) = fs::remove_file(path).await {
        if e.kind() != ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "Failed to remove local file");
        }
    }
}
