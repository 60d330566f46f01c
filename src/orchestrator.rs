// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Degradation control.
//!
//! The orchestrator owns the feature flag set and pushes every change into
//! the subsystem that implements it:
//!
//! ```text
//! ┌───────────────────────┬──────────────────────────────────────────────┐
//! │ Feature               │ Effect when toggled                          │
//! ├───────────────────────┼──────────────────────────────────────────────┤
//! │ LocalFallback         │ ConnectionManager local tier on/off          │
//! │ MemoryCache           │ TieredCache memory tier on/off (cleared)     │
//! │ LocalRateLimit        │ rate limiter fast path on/off                │
//! │ SessionBackup         │ session backup timer start/stop              │
//! │ PerformanceMonitoring │ metric collector start/stop                  │
//! └───────────────────────┴──────────────────────────────────────────────┘
//! ```
//!
//! Flags and thresholds persist under `fallback:config`. A health loop
//! force-enables every disabled feature while the monitor reports unhealthy,
//! and a connection event listener turns the local fallback back on whenever
//! the manager enters fallback mode.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cache::TieredCache;
use crate::config::{FallbackThresholds, FeatureFlags, OrchestratorConfig};
use crate::connection::{ConnectionEvent, ConnectionManager, HealthStatus};
use crate::metrics;
use crate::monitor::{HealthReport, PerformanceMonitor};
use crate::rate_limit::HybridRateLimiter;
use crate::session::SessionBackupManager;
use crate::storage::traits::StorageError;

const CONFIG_KEY: &str = "fallback:config";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Feature {
    LocalFallback,
    MemoryCache,
    LocalRateLimit,
    SessionBackup,
    PerformanceMonitoring,
}

impl Feature {
    pub const ALL: [Feature; 5] = [
        Feature::LocalFallback,
        Feature::MemoryCache,
        Feature::LocalRateLimit,
        Feature::SessionBackup,
        Feature::PerformanceMonitoring,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Feature::LocalFallback => "local_fallback",
            Feature::MemoryCache => "memory_cache",
            Feature::LocalRateLimit => "local_rate_limit",
            Feature::SessionBackup => "session_backup",
            Feature::PerformanceMonitoring => "performance_monitoring",
        }
    }
}

impl fmt::Display for Feature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Feature {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Feature::ALL
            .into_iter()
            .find(|f| f.as_str() == s)
            .ok_or_else(|| StorageError::Config(format!("unknown feature '{}'", s)))
    }
}

impl FeatureFlags {
    #[must_use]
    pub fn get(&self, feature: Feature) -> bool {
        match feature {
            Feature::LocalFallback => self.local_fallback,
            Feature::MemoryCache => self.memory_cache,
            Feature::LocalRateLimit => self.local_rate_limit,
            Feature::SessionBackup => self.session_backup,
            Feature::PerformanceMonitoring => self.performance_monitoring,
        }
    }

    pub fn set(&mut self, feature: Feature, enabled: bool) {
        let slot = match feature {
            Feature::LocalFallback => &mut self.local_fallback,
            Feature::MemoryCache => &mut self.memory_cache,
            Feature::LocalRateLimit => &mut self.local_rate_limit,
            Feature::SessionBackup => &mut self.session_backup,
            Feature::PerformanceMonitoring => &mut self.performance_monitoring,
        };
        *slot = enabled;
    }
}

/// Stored shape of `fallback:config`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
struct PersistedConfig {
    features: FeatureFlags,
    #[serde(default)]
    thresholds: FallbackThresholds,
}

/// Handles to the subsystems whose behavior the flags control.
#[derive(Clone)]
pub struct Subsystems {
    pub cache: Arc<TieredCache>,
    pub rate_limiter: Arc<HybridRateLimiter>,
    pub sessions: Arc<SessionBackupManager>,
    pub monitor: Arc<PerformanceMonitor>,
}

#[derive(Debug, Clone, Serialize)]
pub struct OrchestratorStatus {
    pub features: FeatureFlags,
    pub thresholds: FallbackThresholds,
    pub connection: HealthStatus,
    pub last_health: Option<HealthReport>,
}

pub struct FallbackOrchestrator {
    manager: Arc<ConnectionManager>,
    subsystems: Subsystems,
    config: OrchestratorConfig,
    flags: RwLock<FeatureFlags>,
    last_health: RwLock<Option<HealthReport>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl FallbackOrchestrator {
    pub fn new(manager: Arc<ConnectionManager>, subsystems: Subsystems, config: OrchestratorConfig) -> Self {
        Self {
            flags: RwLock::new(config.features),
            manager,
            subsystems,
            config,
            last_health: RwLock::new(None),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Load persisted flags and thresholds (falling back to the configured
    /// defaults) and apply every flag to its subsystem.
    #[tracing::instrument(skip(self))]
    pub async fn load(&self) {
        match self.manager.get_json::<PersistedConfig>(CONFIG_KEY).await {
            Some(stored) => {
                info!(features = ?stored.features, "Loaded persisted feature flags");
                *self.flags.write() = stored.features;
                self.subsystems.monitor.set_thresholds(stored.thresholds);
            }
            None => debug!("No persisted feature flags, using configured defaults"),
        }
        let flags = self.flags();
        for feature in Feature::ALL {
            self.apply(feature, flags.get(feature));
        }
    }

    #[must_use]
    pub fn flags(&self) -> FeatureFlags {
        *self.flags.read()
    }

    #[must_use]
    pub fn feature_state(&self, feature: Feature) -> bool {
        self.flags.read().get(feature)
    }

    /// Persist the new flag set, then apply the transition.
    #[tracing::instrument(skip(self))]
    pub async fn update_feature(&self, feature: Feature, enabled: bool) {
        self.set_feature(feature, enabled, false).await;
    }

    async fn set_feature(&self, feature: Feature, enabled: bool, forced: bool) {
        let changed = {
            let mut flags = self.flags.write();
            let changed = flags.get(feature) != enabled;
            flags.set(feature, enabled);
            changed
        };
        self.persist().await;
        self.apply(feature, enabled);
        if changed {
            metrics::record_feature_toggle(feature.as_str(), enabled, forced);
            info!(feature = %feature, enabled, forced, "Feature updated");
        }
    }

    pub async fn update_thresholds(&self, thresholds: FallbackThresholds) {
        self.subsystems.monitor.set_thresholds(thresholds);
        self.persist().await;
    }

    async fn persist(&self) {
        let stored = PersistedConfig {
            features: self.flags(),
            thresholds: self.subsystems.monitor.thresholds(),
        };
        self.manager.set_json(CONFIG_KEY, &stored, None).await;
    }

    fn apply(&self, feature: Feature, enabled: bool) {
        let s = &self.subsystems;
        match feature {
            Feature::LocalFallback => self.manager.set_local_fallback_enabled(enabled),
            Feature::MemoryCache => s.cache.set_memory_enabled(enabled),
            Feature::LocalRateLimit => s.rate_limiter.set_local_fast_path(enabled),
            Feature::SessionBackup if enabled => s.sessions.start(),
            Feature::SessionBackup => s.sessions.stop(),
            Feature::PerformanceMonitoring if enabled => s.monitor.start(),
            Feature::PerformanceMonitoring => s.monitor.stop(),
        }
    }

    /// Run one health evaluation. When unhealthy, every disabled feature is
    /// turned back on.
    pub async fn health_tick(&self) -> HealthReport {
        let report = self.subsystems.monitor.check_health();
        if !report.is_healthy() {
            let flags = self.flags();
            let disabled: Vec<Feature> = Feature::ALL.into_iter().filter(|f| !flags.get(*f)).collect();
            if !disabled.is_empty() {
                warn!(disabled = ?disabled, "Unhealthy, re-enabling degraded features");
            }
            for feature in disabled {
                self.set_feature(feature, true, true).await;
            }
        }
        *self.last_health.write() = Some(report.clone());
        report
    }

    async fn on_connection_event(&self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::Fallback { reason } => {
                if !self.feature_state(Feature::LocalFallback) {
                    warn!(reason = %reason, "Fallback mode entered with local fallback disabled, enabling");
                    self.set_feature(Feature::LocalFallback, true, true).await;
                }
            }
            // Flags loaded while the remote was down only live locally
            ConnectionEvent::Connected => self.persist().await,
            ConnectionEvent::Disconnected { .. } => {}
        }
    }

    /// Start the health loop and the connection event listener.
    pub fn start(self: &Arc<Self>) {
        let mut tasks = self.tasks.lock();
        if !tasks.is_empty() {
            return;
        }

        let interval = Duration::from_secs(self.config.health_check_interval_secs.max(1));
        let weak = Arc::downgrade(self);
        tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(this) = weak.upgrade() else { break };
                this.health_tick().await;
            }
        }));

        let mut events = self.manager.subscribe();
        let weak = Arc::downgrade(self);
        tasks.push(tokio::spawn(async move {
            loop {
                let event = match events.recv().await {
                    Ok(event) => event,
                    Err(RecvError::Lagged(skipped)) => {
                        debug!(skipped, "Connection event listener lagged");
                        continue;
                    }
                    Err(RecvError::Closed) => break,
                };
                let Some(this) = weak.upgrade() else { break };
                this.on_connection_event(event).await;
            }
        }));
        info!(interval_secs = interval.as_secs(), "Fallback orchestrator started");
    }

    pub fn stop(&self) {
        for handle in self.tasks.lock().drain(..) {
            handle.abort();
        }
    }

    pub async fn status(&self) -> OrchestratorStatus {
        OrchestratorStatus {
            features: self.flags(),
            thresholds: self.subsystems.monitor.thresholds(),
            connection: self.manager.health_status().await,
            last_health: self.last_health.read().clone(),
        }
    }
}

impl Drop for FallbackOrchestrator {
    fn drop(&mut self) {
        for handle in self.tasks.get_mut().drain(..) {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CacheConfig, MonitorConfig, RateLimitConfig, SessionBackupConfig};
    use crate::connection::ConnectionState;
    use crate::monitor::MEMORY_BYTES;
    use crate::test_support::{connected_harness, wait_for_state, Harness};

    fn orchestrator(h: &Harness) -> Arc<FallbackOrchestrator> {
        let subsystems = Subsystems {
            cache: Arc::new(TieredCache::new(h.manager.clone(), CacheConfig::default())),
            rate_limiter: Arc::new(HybridRateLimiter::new(h.manager.clone(), RateLimitConfig::default())),
            sessions: Arc::new(SessionBackupManager::new(h.manager.clone(), SessionBackupConfig::default())),
            monitor: Arc::new(PerformanceMonitor::new(h.manager.clone(), "orch", MonitorConfig::default())),
        };
        Arc::new(FallbackOrchestrator::new(
            h.manager.clone(),
            subsystems,
            OrchestratorConfig::default(),
        ))
    }

    #[test]
    fn test_feature_names_round_trip_through_from_str() {
        for feature in Feature::ALL {
            assert_eq!(feature.as_str().parse::<Feature>().unwrap(), feature);
        }
        assert!("bogus".parse::<Feature>().is_err());
    }

    #[tokio::test]
    async fn test_load_applies_defaults() {
        let h = connected_harness().await;
        let orch = orchestrator(&h);
        orch.load().await;

        assert!(orch.feature_state(Feature::SessionBackup));
        assert!(orch.subsystems.sessions.is_running());
        assert!(orch.subsystems.monitor.is_running());
        assert!(h.manager.local_fallback_enabled());
    }

    #[tokio::test]
    async fn test_update_feature_applies_and_persists() {
        let h = connected_harness().await;
        let orch = orchestrator(&h);
        orch.load().await;

        orch.update_feature(Feature::SessionBackup, false).await;
        assert!(!orch.subsystems.sessions.is_running());
        orch.update_feature(Feature::MemoryCache, false).await;
        assert!(!orch.subsystems.cache.memory_enabled());
        orch.update_feature(Feature::LocalRateLimit, false).await;
        assert!(!orch.subsystems.rate_limiter.local_fast_path());
        orch.update_feature(Feature::LocalFallback, false).await;
        assert!(!h.manager.local_fallback_enabled());

        let stored: PersistedConfig = h.manager.get_json(CONFIG_KEY).await.unwrap();
        assert!(!stored.features.session_backup);
        assert!(!stored.features.memory_cache);

        orch.update_feature(Feature::SessionBackup, true).await;
        assert!(orch.subsystems.sessions.is_running());
    }

    #[tokio::test]
    async fn test_load_restores_persisted_flags() {
        let h = connected_harness().await;
        {
            let first = orchestrator(&h);
            first.update_feature(Feature::PerformanceMonitoring, false).await;
            first
                .update_thresholds(FallbackThresholds {
                    cpu_percent: 50.0,
                    ..FallbackThresholds::default()
                })
                .await;
        }

        let second = orchestrator(&h);
        second.load().await;
        assert!(!second.feature_state(Feature::PerformanceMonitoring));
        assert!(!second.subsystems.monitor.is_running());
        assert_eq!(second.subsystems.monitor.thresholds().cpu_percent, 50.0);
    }

    #[tokio::test]
    async fn test_unhealthy_tick_force_enables() {
        let h = connected_harness().await;
        let orch = orchestrator(&h);
        orch.update_feature(Feature::MemoryCache, false).await;
        orch.update_feature(Feature::SessionBackup, false).await;

        let report = orch.health_tick().await;
        assert!(report.is_healthy());
        assert!(!orch.feature_state(Feature::MemoryCache));

        orch.subsystems.monitor.record_metric(MEMORY_BYTES, 4.0 * 1024.0 * 1024.0 * 1024.0);
        let report = orch.health_tick().await;
        assert!(!report.is_healthy());
        assert!(orch.feature_state(Feature::MemoryCache));
        assert!(orch.feature_state(Feature::SessionBackup));
        assert!(orch.subsystems.sessions.is_running());
        assert!(orch.status().await.last_health.is_some());
    }

    #[tokio::test]
    async fn test_fallback_event_reenables_local_fallback() {
        let h = connected_harness().await;
        let orch = orchestrator(&h);
        orch.start();
        orch.update_feature(Feature::LocalFallback, false).await;

        h.remote.set_reachable(false);
        h.manager.get("poke").await;
        wait_for_state(&h.manager, ConnectionState::FallbackMode).await;

        tokio::time::timeout(Duration::from_secs(3), async {
            while !orch.feature_state(Feature::LocalFallback) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert!(h.manager.local_fallback_enabled());
        orch.stop();
    }

    #[tokio::test]
    async fn test_status_aggregates() {
        let h = connected_harness().await;
        let orch = orchestrator(&h);
        let status = orch.status().await;
        assert_eq!(status.features, FeatureFlags::default());
        assert_eq!(status.connection.state, ConnectionState::Connected);
        assert!(status.last_health.is_none());
    }
}
