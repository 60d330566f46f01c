// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Configuration for the state substrate.
//!
//! # Example
//!
//! ```
//! use state_substrate::SubstrateConfig;
//!
//! // Minimal config (uses defaults)
//! let config = SubstrateConfig::default();
//! assert_eq!(config.queue.max_memory_length, 1000);
//!
//! // Override a section
//! let mut config = SubstrateConfig {
//!     fallback_dir: "/var/lib/bot/fallback".into(),
//!     ..Default::default()
//! };
//! config.connection.redis_url = Some("redis://localhost:6379".into());
//! config.rate_limit.max_requests = 30;
//! assert!(config.validate().is_ok());
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::storage::traits::StorageError;

/// Top-level configuration. Every field has a default.
#[derive(Debug, Clone, Deserialize)]
pub struct SubstrateConfig {
    /// Names this process in `performance:<instance_id>:*` keys
    #[serde(default = "default_instance_id")]
    pub instance_id: String,

    /// Directory of the local fallback store
    #[serde(default = "default_fallback_dir")]
    pub fallback_dir: String,

    /// Interval of the expired-entry sweep over the fallback directory
    #[serde(default = "default_local_sweep_interval_secs")]
    pub local_sweep_interval_secs: u64,

    #[serde(default)]
    pub connection: ConnectionConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub session_backup: SessionBackupConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
}

fn default_instance_id() -> String { format!("substrate-{}", uuid::Uuid::new_v4().simple()) }
fn default_fallback_dir() -> String { "./data/fallback".into() }
fn default_local_sweep_interval_secs() -> u64 { 300 }

impl Default for SubstrateConfig {
    fn default() -> Self {
        Self {
            instance_id: default_instance_id(),
            fallback_dir: default_fallback_dir(),
            local_sweep_interval_secs: default_local_sweep_interval_secs(),
            connection: ConnectionConfig::default(),
            cache: CacheConfig::default(),
            queue: QueueConfig::default(),
            rate_limit: RateLimitConfig::default(),
            session_backup: SessionBackupConfig::default(),
            monitor: MonitorConfig::default(),
            orchestrator: OrchestratorConfig::default(),
        }
    }
}

impl SubstrateConfig {
    /// Defaults overlaid with `REDIS_URL`, `FALLBACK_DIR` and
    /// `SUBSTRATE_INSTANCE_ID` when set.
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(url) = env_nonempty("REDIS_URL") {
            config.connection.redis_url = Some(url);
        }
        if let Some(dir) = env_nonempty("FALLBACK_DIR") {
            config.fallback_dir = dir;
        }
        if let Some(id) = env_nonempty("SUBSTRATE_INSTANCE_ID") {
            config.instance_id = id;
        }
        config
    }

    /// Reject values that can never work. Called once by `Substrate::start`.
    pub fn validate(&self) -> Result<(), StorageError> {
        if self.instance_id.trim().is_empty() {
            return Err(invalid("instance_id must not be empty"));
        }
        if self.fallback_dir.trim().is_empty() {
            return Err(invalid("fallback_dir must not be empty"));
        }
        if self.local_sweep_interval_secs == 0 {
            return Err(invalid("local_sweep_interval_secs must be > 0"));
        }
        self.connection.validate()?;
        self.cache.validate()?;
        self.queue.validate()?;
        self.rate_limit.validate()?;
        if self.session_backup.backup_interval_secs == 0 {
            return Err(invalid("session_backup.backup_interval_secs must be > 0"));
        }
        self.monitor.validate()?;
        if self.orchestrator.health_check_interval_secs == 0 {
            return Err(invalid("orchestrator.health_check_interval_secs must be > 0"));
        }
        Ok(())
    }

    #[must_use]
    pub fn local_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.local_sweep_interval_secs)
    }
}

fn env_nonempty(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn invalid(message: impl Into<String>) -> StorageError {
    StorageError::Config(message.into())
}

// ═══════════════════════════════════════════════════════════════════════════
// Connection
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Deserialize)]
pub struct ConnectionConfig {
    /// Redis connection string (e.g., "redis://localhost:6379")
    #[serde(default)]
    pub redis_url: Option<String>,

    /// Optional namespace prepended to every remote key
    #[serde(default)]
    pub key_prefix: Option<String>,

    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Bound on every individual remote call
    #[serde(default = "default_operation_timeout_ms")]
    pub operation_timeout_ms: u64,

    /// Reconnect backoff: `min(max, base * 2^retry + random(0..jitter))`
    #[serde(default = "default_reconnect_base_delay_ms")]
    pub reconnect_base_delay_ms: u64,
    #[serde(default = "default_reconnect_max_delay_ms")]
    pub reconnect_max_delay_ms: u64,
    #[serde(default = "default_reconnect_jitter_ms")]
    pub reconnect_jitter_ms: u64,

    /// Time spent reconnecting before entering fallback mode
    #[serde(default = "default_max_retry_time_ms")]
    pub max_retry_time_ms: u64,

    /// PING interval while connected
    #[serde(default = "default_watchdog_interval_ms")]
    pub watchdog_interval_ms: u64,

    /// Reconnect probe interval once in fallback mode
    #[serde(default = "default_fallback_probe_interval_ms")]
    pub fallback_probe_interval_ms: u64,

    /// Mirror successful remote writes into the local store
    #[serde(default = "default_true")]
    pub mirror_writes_locally: bool,
}

fn default_connect_timeout_ms() -> u64 { 5_000 }
fn default_operation_timeout_ms() -> u64 { 2_000 }
fn default_reconnect_base_delay_ms() -> u64 { 1_000 }
fn default_reconnect_max_delay_ms() -> u64 { 30_000 }
fn default_reconnect_jitter_ms() -> u64 { 1_000 }
fn default_max_retry_time_ms() -> u64 { 120_000 }
fn default_watchdog_interval_ms() -> u64 { 10_000 }
fn default_fallback_probe_interval_ms() -> u64 { 30_000 }
fn default_true() -> bool { true }

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            redis_url: None,
            key_prefix: None,
            connect_timeout_ms: default_connect_timeout_ms(),
            operation_timeout_ms: default_operation_timeout_ms(),
            reconnect_base_delay_ms: default_reconnect_base_delay_ms(),
            reconnect_max_delay_ms: default_reconnect_max_delay_ms(),
            reconnect_jitter_ms: default_reconnect_jitter_ms(),
            max_retry_time_ms: default_max_retry_time_ms(),
            watchdog_interval_ms: default_watchdog_interval_ms(),
            fallback_probe_interval_ms: default_fallback_probe_interval_ms(),
            mirror_writes_locally: true,
        }
    }
}

impl ConnectionConfig {
    fn validate(&self) -> Result<(), StorageError> {
        if let Some(url) = &self.redis_url {
            let known_scheme = ["redis://", "rediss://", "unix://", "redis+unix://"]
                .iter()
                .any(|scheme| url.starts_with(scheme));
            if !known_scheme {
                return Err(invalid("connection.redis_url must be a redis://, rediss:// or unix:// URL"));
            }
        }
        if self.connect_timeout_ms == 0 || self.operation_timeout_ms == 0 {
            return Err(invalid("connection timeouts must be > 0"));
        }
        if self.reconnect_base_delay_ms == 0 || self.reconnect_base_delay_ms > self.reconnect_max_delay_ms {
            return Err(invalid("connection.reconnect_base_delay_ms must be in 1..=reconnect_max_delay_ms"));
        }
        if self.watchdog_interval_ms == 0 || self.fallback_probe_interval_ms == 0 {
            return Err(invalid("connection watchdog/probe intervals must be > 0"));
        }
        Ok(())
    }

    /// Connection string, required when connecting to Redis.
    pub fn require_redis_url(&self) -> Result<&str, StorageError> {
        self.redis_url
            .as_deref()
            .filter(|u| !u.trim().is_empty())
            .ok_or_else(|| invalid("connection.redis_url is not set (REDIS_URL)"))
    }

    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    #[must_use]
    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }

    #[must_use]
    pub fn max_retry_time(&self) -> Duration {
        Duration::from_millis(self.max_retry_time_ms)
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Subsystems
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    /// Remote namespace; `flush` never touches keys outside it
    #[serde(default = "default_cache_namespace")]
    pub namespace: String,
    /// TTL used when the caller passes none
    #[serde(default = "default_cache_ttl_secs")]
    pub default_ttl_secs: u64,
    /// Memory-tier TTL ceiling (memory TTL ≤ remote TTL)
    #[serde(default = "default_cache_memory_ttl_secs")]
    pub memory_ttl_secs: u64,
    #[serde(default = "default_cache_max_memory_entries")]
    pub max_memory_entries: usize,
}

fn default_cache_namespace() -> String { "cache:".into() }
fn default_cache_ttl_secs() -> u64 { 3_600 }
fn default_cache_memory_ttl_secs() -> u64 { 300 }
fn default_cache_max_memory_entries() -> usize { 10_000 }

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            namespace: default_cache_namespace(),
            default_ttl_secs: default_cache_ttl_secs(),
            memory_ttl_secs: default_cache_memory_ttl_secs(),
            max_memory_entries: default_cache_max_memory_entries(),
        }
    }
}

impl CacheConfig {
    fn validate(&self) -> Result<(), StorageError> {
        if self.namespace.is_empty() {
            return Err(invalid("cache.namespace must not be empty"));
        }
        if self.max_memory_entries == 0 {
            return Err(invalid("cache.max_memory_entries must be > 0"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    #[serde(default = "default_queue_max_memory_length")]
    pub max_memory_length: usize,
    /// Fraction of capacity that triggers promotion to the remote list
    #[serde(default = "default_queue_high_watermark")]
    pub high_watermark: f64,
    /// Fraction of capacity below which the queue demotes back to memory
    #[serde(default = "default_queue_low_watermark")]
    pub low_watermark: f64,
    /// Cap on the remote list (`None` = unbounded)
    #[serde(default)]
    pub max_remote_length: Option<usize>,
}

fn default_queue_max_memory_length() -> usize { 1_000 }
fn default_queue_high_watermark() -> f64 { 0.9 }
fn default_queue_low_watermark() -> f64 { 0.7 }

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_memory_length: default_queue_max_memory_length(),
            high_watermark: default_queue_high_watermark(),
            low_watermark: default_queue_low_watermark(),
            max_remote_length: None,
        }
    }
}

impl QueueConfig {
    fn validate(&self) -> Result<(), StorageError> {
        if self.max_memory_length == 0 {
            return Err(invalid("queue.max_memory_length must be > 0"));
        }
        let in_range = |w: f64| w > 0.0 && w <= 1.0;
        if !in_range(self.high_watermark) || !in_range(self.low_watermark) {
            return Err(invalid("queue watermarks must be in (0, 1]"));
        }
        if self.low_watermark >= self.high_watermark {
            return Err(invalid("queue.low_watermark must be below queue.high_watermark"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitConfig {
    /// Admissions per identifier per window
    #[serde(default = "default_rate_max_requests")]
    pub max_requests: u64,
    #[serde(default = "default_rate_window_secs")]
    pub window_secs: u64,
    /// Local checks admitted without a remote round-trip
    #[serde(default = "default_rate_fallback_threshold")]
    pub fallback_threshold: u64,
}

fn default_rate_max_requests() -> u64 { 100 }
fn default_rate_window_secs() -> u64 { 60 }
fn default_rate_fallback_threshold() -> u64 { 10 }

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: default_rate_max_requests(),
            window_secs: default_rate_window_secs(),
            fallback_threshold: default_rate_fallback_threshold(),
        }
    }
}

impl RateLimitConfig {
    fn validate(&self) -> Result<(), StorageError> {
        if self.max_requests == 0 || self.window_secs == 0 {
            return Err(invalid("rate_limit.max_requests and window_secs must be > 0"));
        }
        Ok(())
    }

    #[must_use]
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionBackupConfig {
    #[serde(default = "default_backup_interval_secs")]
    pub backup_interval_secs: u64,
    /// Expiry of stored snapshots (`None` keeps them until deleted)
    #[serde(default = "default_backup_ttl_secs")]
    pub backup_ttl_secs: Option<u64>,
}

fn default_backup_interval_secs() -> u64 { 300 }
fn default_backup_ttl_secs() -> Option<u64> { Some(7 * 24 * 3_600) }

impl Default for SessionBackupConfig {
    fn default() -> Self {
        Self {
            backup_interval_secs: default_backup_interval_secs(),
            backup_ttl_secs: default_backup_ttl_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MonitorConfig {
    #[serde(default = "default_collect_interval_secs")]
    pub collect_interval_secs: u64,
    /// Sliding window kept per metric series
    #[serde(default = "default_monitor_window_secs")]
    pub window_secs: u64,
    /// Persist the latest sample of each metric remotely
    #[serde(default = "default_true")]
    pub persist: bool,
    #[serde(default)]
    pub thresholds: FallbackThresholds,
}

fn default_collect_interval_secs() -> u64 { 10 }
fn default_monitor_window_secs() -> u64 { 3_600 }

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            collect_interval_secs: default_collect_interval_secs(),
            window_secs: default_monitor_window_secs(),
            persist: true,
            thresholds: FallbackThresholds::default(),
        }
    }
}

impl MonitorConfig {
    fn validate(&self) -> Result<(), StorageError> {
        if self.collect_interval_secs == 0 || self.window_secs == 0 {
            return Err(invalid("monitor intervals must be > 0"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct OrchestratorConfig {
    #[serde(default = "default_health_check_interval_secs")]
    pub health_check_interval_secs: u64,
    /// Flags used when none are persisted remotely
    #[serde(default)]
    pub features: FeatureFlags,
}

fn default_health_check_interval_secs() -> u64 { 60 }

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            health_check_interval_secs: default_health_check_interval_secs(),
            features: FeatureFlags::default(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Persisted degradation state (stored under `fallback:config`)
// ═══════════════════════════════════════════════════════════════════════════

/// One switch per degradable behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureFlags {
    #[serde(default = "default_true")]
    pub local_fallback: bool,
    #[serde(default = "default_true")]
    pub memory_cache: bool,
    #[serde(default = "default_true")]
    pub local_rate_limit: bool,
    #[serde(default = "default_true")]
    pub session_backup: bool,
    #[serde(default = "default_true")]
    pub performance_monitoring: bool,
}

impl Default for FeatureFlags {
    fn default() -> Self {
        Self {
            local_fallback: true,
            memory_cache: true,
            local_rate_limit: true,
            session_backup: true,
            performance_monitoring: true,
        }
    }
}

/// Health limits evaluated by the performance monitor.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FallbackThresholds {
    /// 1-minute load average as a percentage of available cores
    #[serde(default = "default_cpu_percent")]
    pub cpu_percent: f64,
    /// Resident memory of this process
    #[serde(default = "default_memory_bytes")]
    pub memory_bytes: u64,
    /// Open file descriptors plus in-flight remote operations
    #[serde(default = "default_active_handles")]
    pub active_handles: u64,
}

fn default_cpu_percent() -> f64 { 80.0 }
fn default_memory_bytes() -> u64 { 1024 * 1024 * 1024 } // 1 GiB
fn default_active_handles() -> u64 { 1_000 }

impl Default for FallbackThresholds {
    fn default() -> Self {
        Self {
            cpu_percent: default_cpu_percent(),
            memory_bytes: default_memory_bytes(),
            active_handles: default_active_handles(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = SubstrateConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.queue.high_watermark, 0.9);
        assert_eq!(config.queue.low_watermark, 0.7);
        assert_eq!(config.monitor.thresholds.memory_bytes, 1 << 30);
        assert_eq!(config.orchestrator.health_check_interval_secs, 60);
        assert!(config.instance_id.starts_with("substrate-"));
    }

    #[test]
    fn test_deserialize_partial_json() {
        let json = r#"{
            "fallback_dir": "/tmp/fb",
            "connection": { "redis_url": "redis://cache:6379", "max_retry_time_ms": 5000 },
            "queue": { "max_memory_length": 50 },
            "orchestrator": { "features": { "session_backup": false } }
        }"#;
        let config: SubstrateConfig = serde_json::from_str(json).unwrap();

        assert_eq!(config.fallback_dir, "/tmp/fb");
        assert_eq!(config.connection.max_retry_time(), Duration::from_secs(5));
        assert_eq!(config.connection.operation_timeout_ms, 2_000);
        assert_eq!(config.queue.max_memory_length, 50);
        assert!(!config.orchestrator.features.session_backup);
        assert!(config.orchestrator.features.local_fallback);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_inverted_watermarks_rejected() {
        let mut config = SubstrateConfig::default();
        config.queue.low_watermark = 0.9;
        config.queue.high_watermark = 0.7;
        let err = config.validate().unwrap_err();
        assert!(err.is_fatal());
        assert!(err.to_string().contains("low_watermark"));
    }

    #[test]
    fn test_malformed_url_rejected() {
        let mut config = SubstrateConfig::default();
        config.connection.redis_url = Some("localhost:6379".into());
        assert!(matches!(config.validate(), Err(StorageError::Config(_))));
    }

    #[test]
    fn test_missing_url_is_config_error() {
        let config = ConnectionConfig::default();
        assert!(matches!(config.require_redis_url(), Err(StorageError::Config(_))));

        let config = ConnectionConfig {
            redis_url: Some("redis://localhost".into()),
            ..Default::default()
        };
        assert_eq!(config.require_redis_url().unwrap(), "redis://localhost");
    }

    #[test]
    fn test_zero_rate_window_rejected() {
        let mut config = SubstrateConfig::default();
        config.rate_limit.window_secs = 0;
        assert!(config.validate().is_err());
    }
}
