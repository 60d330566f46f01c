// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Storage backend error: {0}")]
    Backend(String),
    #[error("Operation '{operation}' timed out after {timeout:?}")]
    Timeout {
        operation: String,
        timeout: Duration,
    },
    #[error("Remote store unavailable")]
    Unavailable,
    #[error("Corrupt entry for '{key}': {message}")]
    Serialization {
        key: String,
        message: String,
    },
    #[error("Local store I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("Queue '{queue}' is full ({capacity} items)")]
    QueueFull {
        queue: String,
        capacity: usize,
    },
}

impl StorageError {
    /// Configuration errors never heal by retrying.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Config(_))
    }

    /// Short label used for the `error_type` metric dimension.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Backend(_) => "backend",
            Self::Timeout { .. } => "timeout",
            Self::Unavailable => "unavailable",
            Self::Serialization { .. } => "serialization",
            Self::Io(_) => "io",
            Self::Config(_) => "config",
            Self::QueueFull { .. } => "capacity",
        }
    }
}

/// Primitive operations the substrate needs from the remote tier.
///
/// Values cross this boundary as already-serialized JSON strings so the
/// trait stays object safe. Implementations must not retry internally:
/// the connection manager decides between retrying, reconnecting and
/// falling back to local storage.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError>;
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StorageError>;
    async fn del(&self, key: &str) -> Result<bool, StorageError>;
    async fn exists(&self, key: &str) -> Result<bool, StorageError>;

    /// Remaining time to live. `None` when the key never expires; a missing
    /// key reports zero.
    async fn pttl(&self, key: &str) -> Result<Option<Duration>, StorageError>;

    /// Read a value together with its remaining time to live.
    async fn get_with_ttl(&self, key: &str) -> Result<Option<(String, Option<Duration>)>, StorageError> {
        let Some(value) = self.get(key).await? else {
            return Ok(None);
        };
        Ok(Some((value, self.pttl(key).await?)))
    }

    /// Increment a fixed-window counter. The window starts (and its expiry
    /// is set) on the first increment, in the same atomic step, so a counter
    /// never exists without an expiry.
    async fn incr_with_expiry(&self, key: &str, window: Duration) -> Result<u64, StorageError>;

    /// Append values to the tail of a list in one command. Returns the new length.
    async fn rpush(&self, key: &str, values: &[String]) -> Result<u64, StorageError>;

    /// Pop up to `count` values from the head of a list, oldest first.
    async fn lpop(&self, key: &str, count: usize) -> Result<Vec<String>, StorageError>;

    /// Read the head of a list without removing it.
    async fn lfront(&self, key: &str) -> Result<Option<String>, StorageError>;

    async fn llen(&self, key: &str) -> Result<u64, StorageError>;

    /// All keys starting with `prefix`.
    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>, StorageError>;

    async fn ping(&self) -> Result<(), StorageError>;

    /// Memory used by the remote server, when it reports one.
    async fn used_memory(&self) -> Result<Option<u64>, StorageError>;
}

/// Opens live [`RemoteStore`] handles.
///
/// The connection manager owns the lifecycle; a connector only knows how to
/// produce one fresh handle per call.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Human readable target with credentials redacted (for logs).
    fn describe(&self) -> String;

    async fn connect(&self) -> Result<Arc<dyn RemoteStore>, StorageError>;
}
