//! # State Substrate
//!
//! A resilient, dual-tier state layer for services that must keep serving
//! while their shared Redis is slow, flapping or gone.
//!
//! ## Architecture
//!
//! Every read and write goes to the remote tier first and falls back to a
//! local on-disk store when the remote cannot answer in time:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     Feature Components                      │
//! │  • TieredCache      (memory → remote, namespaced)          │
//! │  • HybridQueue      (memory, promoted to a remote list)    │
//! │  • HybridRateLimiter (local fast path + remote window)     │
//! │  • SessionBackupManager / PerformanceMonitor               │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    ConnectionManager                        │
//! │  • Lifecycle: connect / backoff reconnect / fallback mode  │
//! │  • Timeout-bounded remote ops, transparent local fallback  │
//! │  • Watchdog ping, connection events, health status         │
//! └─────────────────────────────────────────────────────────────┘
//!               │                               │
//!               ▼                               ▼
//! ┌───────────────────────────┐   ┌───────────────────────────┐
//! │   Remote: Redis           │   │   Local: one file per key │
//! │   (RemoteStore trait)     │   │   JSON {value, ttl}       │
//! └───────────────────────────┘   └───────────────────────────┘
//! ```
//!
//! The [`FallbackOrchestrator`] sits beside the components and switches
//! degradable behavior on and off from persisted feature flags and health
//! checks.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use state_substrate::{Substrate, SubstrateConfig};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() {
//!     let mut config = SubstrateConfig::from_env();
//!     config.connection.redis_url = Some("redis://localhost:6379".into());
//!
//!     // Starts degraded (local only) if Redis is unreachable
//!     let substrate = Substrate::start(config).await.expect("invalid configuration");
//!
//!     substrate.cache().set("user:42", json!({"name": "Ada"}), None);
//!     let user = substrate.cache().get("user:42").await;
//!     println!("cached: {:?}", user);
//!
//!     let jobs = substrate.queue("jobs").await;
//!     jobs.enqueue(json!({"task": "resize"})).await.expect("queue full");
//!
//!     let decision = substrate.rate_limiter().check_rate_limit("client-a").await;
//!     println!("allowed: {}", decision.allowed);
//!
//!     substrate.shutdown().await;
//! }
//! ```
//!
//! ## Modules
//!
//! - [`connection`]: [`ConnectionManager`], states, events, health
//! - [`storage`]: remote tier trait + Redis/in-memory backends, local fallback store
//! - [`cache`], [`queue`], [`rate_limit`], [`session`], [`monitor`]: feature components
//! - [`orchestrator`]: feature flags and forced recovery
//! - [`resilience`]: backoff and retry policies
//! - [`substrate`]: wires everything together

pub mod config;
pub mod metrics;
pub mod storage;
pub mod resilience;
pub mod connection;
pub mod cache;
pub mod queue;
pub mod rate_limit;
pub mod session;
pub mod monitor;
pub mod orchestrator;
pub mod substrate;

#[cfg(test)]
mod test_support;

pub use config::{
    CacheConfig, ConnectionConfig, FallbackThresholds, FeatureFlags, MonitorConfig,
    OrchestratorConfig, QueueConfig, RateLimitConfig, SessionBackupConfig, SubstrateConfig,
};
pub use connection::{ConnectionEvent, ConnectionManager, ConnectionState, HealthStatus, ListLength};
pub use storage::traits::{Connector, RemoteStore, StorageError};
pub use storage::local::LocalFallbackStore;
pub use storage::memory::{InMemoryRemote, MemoryConnector};
pub use storage::redis::RedisConnector;
pub use cache::{CacheStats, TieredCache};
pub use queue::{HybridQueue, QueueItem, QueueMode, QueueStats};
pub use rate_limit::{HybridRateLimiter, RateLimitDecision};
pub use session::{SessionBackupManager, SessionMap, SessionSource};
pub use monitor::{HealthReport, HealthState, PerformanceMonitor};
pub use orchestrator::{Feature, FallbackOrchestrator, OrchestratorStatus};
pub use resilience::retry::RetryConfig;
pub use substrate::Substrate;
pub use metrics::LatencyTimer;
