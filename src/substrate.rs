// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! The assembled substrate: every component built and started in dependency
//! order, plus a single shutdown path.

use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::cache::TieredCache;
use crate::config::SubstrateConfig;
use crate::connection::ConnectionManager;
use crate::metrics;
use crate::monitor::PerformanceMonitor;
use crate::orchestrator::{FallbackOrchestrator, Subsystems};
use crate::queue::HybridQueue;
use crate::rate_limit::HybridRateLimiter;
use crate::resilience::retry::{retry, RetryConfig};
use crate::session::SessionBackupManager;
use crate::storage::local::LocalFallbackStore;
use crate::storage::redis::RedisConnector;
use crate::storage::traits::{Connector, StorageError};

pub struct Substrate {
    config: SubstrateConfig,
    manager: Arc<ConnectionManager>,
    local: Arc<LocalFallbackStore>,
    cache: Arc<TieredCache>,
    rate_limiter: Arc<HybridRateLimiter>,
    sessions: Arc<SessionBackupManager>,
    monitor: Arc<PerformanceMonitor>,
    orchestrator: Arc<FallbackOrchestrator>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl Substrate {
    /// Start against the Redis instance named by `connection.redis_url`.
    pub async fn start(config: SubstrateConfig) -> Result<Self, StorageError> {
        config.validate()?;
        let url = config.connection.require_redis_url()?;
        let connector = RedisConnector::new(url, config.connection.key_prefix.as_deref())?;
        Self::start_with(config, Arc::new(connector), RetryConfig::startup()).await
    }

    /// Start against any remote tier with the default startup retry.
    pub async fn start_with_connector(
        config: SubstrateConfig,
        connector: Arc<dyn Connector>,
    ) -> Result<Self, StorageError> {
        Self::start_with(config, connector, RetryConfig::startup()).await
    }

    /// Startup sequence:
    /// 1. Validate configuration (errors here are fatal)
    /// 2. Open the local fallback store and start its expiry sweep
    /// 3. Connect to the remote tier with bounded retry
    ///    - Configuration/auth errors abort startup
    ///    - Anything else starts degraded; the manager keeps reconnecting
    /// 4. Build cache, rate limiter, session backup, monitor
    /// 5. Load persisted feature flags and apply them
    /// 6. Start the orchestrator's health loop and event listener
    #[tracing::instrument(skip_all, fields(instance = %config.instance_id, remote = %connector.describe()))]
    pub async fn start_with(
        config: SubstrateConfig,
        connector: Arc<dyn Connector>,
        startup_retry: RetryConfig,
    ) -> Result<Self, StorageError> {
        let startup_start = Instant::now();
        info!("Starting state substrate...");

        // ========== PHASE 1: Validate ==========
        config.validate()?;

        // ========== PHASE 2: Local fallback store ==========
        let phase_start = Instant::now();
        let local = Arc::new(LocalFallbackStore::open(&config.fallback_dir).await);
        let sweeper = local.start_sweeper(config.local_sweep_interval());
        metrics::record_startup_phase("local_open", phase_start.elapsed());
        info!(dir = %config.fallback_dir, "Local fallback store ready");

        // ========== PHASE 3: Remote tier ==========
        let phase_start = Instant::now();
        let manager = ConnectionManager::new(connector, config.connection.clone(), Arc::clone(&local));
        match retry("remote_connect", &startup_retry, || manager.connect()).await {
            Ok(()) => info!("Remote tier connected"),
            Err(e) if e.is_fatal() => {
                sweeper.abort();
                manager.shutdown().await;
                return Err(e);
            }
            Err(e) => warn!(error = %e, "Remote tier unreachable, starting degraded"),
        }
        metrics::record_startup_phase("remote_connect", phase_start.elapsed());

        // ========== PHASE 4: Components ==========
        let cache = Arc::new(TieredCache::new(Arc::clone(&manager), config.cache.clone()));
        let rate_limiter = Arc::new(HybridRateLimiter::new(Arc::clone(&manager), config.rate_limit.clone()));
        let sessions = Arc::new(SessionBackupManager::new(
            Arc::clone(&manager),
            config.session_backup.clone(),
        ));
        let monitor = Arc::new(PerformanceMonitor::new(
            Arc::clone(&manager),
            config.instance_id.clone(),
            config.monitor.clone(),
        ));

        // ========== PHASE 5: Feature flags ==========
        let phase_start = Instant::now();
        let orchestrator = Arc::new(FallbackOrchestrator::new(
            Arc::clone(&manager),
            Subsystems {
                cache: Arc::clone(&cache),
                rate_limiter: Arc::clone(&rate_limiter),
                sessions: Arc::clone(&sessions),
                monitor: Arc::clone(&monitor),
            },
            config.orchestrator.clone(),
        ));
        orchestrator.load().await;
        metrics::record_startup_phase("flags_load", phase_start.elapsed());

        // ========== PHASE 6: Supervision ==========
        orchestrator.start();

        metrics::record_startup_phase("total", startup_start.elapsed());
        info!(state = %manager.state(), "State substrate ready");

        Ok(Self {
            config,
            manager,
            local,
            cache,
            rate_limiter,
            sessions,
            monitor,
            orchestrator,
            sweeper: Mutex::new(Some(sweeper)),
        })
    }

    pub fn config(&self) -> &SubstrateConfig {
        &self.config
    }

    pub fn connection(&self) -> &Arc<ConnectionManager> {
        &self.manager
    }

    pub fn local_store(&self) -> &Arc<LocalFallbackStore> {
        &self.local
    }

    pub fn cache(&self) -> &Arc<TieredCache> {
        &self.cache
    }

    pub fn rate_limiter(&self) -> &Arc<HybridRateLimiter> {
        &self.rate_limiter
    }

    pub fn sessions(&self) -> &Arc<SessionBackupManager> {
        &self.sessions
    }

    pub fn monitor(&self) -> &Arc<PerformanceMonitor> {
        &self.monitor
    }

    pub fn orchestrator(&self) -> &Arc<FallbackOrchestrator> {
        &self.orchestrator
    }

    /// Open (and recover) the hybrid queue called `name`.
    pub async fn queue(&self, name: &str) -> HybridQueue {
        HybridQueue::open(name, Arc::clone(&self.manager), &self.config.queue).await
    }

    pub async fn get(&self, key: &str) -> Option<Value> {
        self.manager.get(key).await
    }

    pub async fn set(&self, key: &str, value: &Value, ttl: Option<std::time::Duration>) {
        self.manager.set(key, value, ttl).await
    }

    pub async fn del(&self, key: &str) -> bool {
        self.manager.del(key).await
    }

    pub async fn exists(&self, key: &str) -> bool {
        self.manager.exists(key).await
    }

    /// Stop every background task and close the remote link.
    #[tracing::instrument(skip(self))]
    pub async fn shutdown(&self) {
        let shutdown_start = Instant::now();
        info!("Initiating state substrate shutdown...");

        self.orchestrator.stop();
        self.sessions.stop();
        self.monitor.stop();
        if let Some(sweeper) = self.sweeper.lock().take() {
            sweeper.abort();
        }
        self.manager.shutdown().await;

        metrics::record_startup_phase("shutdown", shutdown_start.elapsed());
        info!("State substrate shutdown complete");
    }
}
