// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Host and process telemetry with threshold-based health checks.
//!
//! A collector samples the host every `collect_interval_secs` and appends to
//! per-metric sliding windows. Health is judged on the latest value of each
//! tracked metric:
//!
//! ```text
//! cpu_load        < thresholds.cpu_percent     (1-min load avg, % of cores)
//! memory_bytes    < thresholds.memory_bytes    (process resident memory)
//! active_handles  < thresholds.active_handles  (open fds + in-flight ops)
//! ```
//!
//! A metric with no samples yet passes its check.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use sysinfo::System;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{FallbackThresholds, MonitorConfig};
use crate::connection::ConnectionManager;
use crate::metrics;
use crate::storage::epoch_millis;

pub const CPU_LOAD: &str = "cpu_load";
pub const MEMORY_BYTES: &str = "memory_bytes";
pub const UPTIME_SECONDS: &str = "uptime_seconds";
pub const ACTIVE_HANDLES: &str = "active_handles";
pub const ACTIVE_REQUESTS: &str = "active_requests";

/// Persisted samples expire after an hour.
const PERSIST_TTL: Duration = Duration::from_secs(3_600);

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MetricPoint {
    /// Epoch millis
    pub timestamp: u64,
    pub value: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    Healthy,
    Unhealthy,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthCheck {
    pub metric: &'static str,
    /// Latest sample, if any
    pub value: Option<f64>,
    pub threshold: f64,
    pub passed: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthReport {
    pub status: HealthState,
    pub checks: Vec<HealthCheck>,
    pub checked_at: u64,
}

impl HealthReport {
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.status == HealthState::Healthy
    }

    pub fn failed_checks(&self) -> impl Iterator<Item = &HealthCheck> {
        self.checks.iter().filter(|c| !c.passed)
    }
}

/// One host sample.
#[derive(Debug, Clone, Copy)]
struct HostSample {
    cpu_load: f64,
    memory_bytes: f64,
    uptime_seconds: f64,
    open_handles: f64,
    active_requests: f64,
}

pub struct PerformanceMonitor {
    manager: Arc<ConnectionManager>,
    instance_id: String,
    config: MonitorConfig,
    thresholds: RwLock<FallbackThresholds>,
    series: RwLock<HashMap<String, VecDeque<MetricPoint>>>,
    system: Mutex<System>,
    started: Instant,
    collector: Mutex<Option<JoinHandle<()>>>,
}

impl PerformanceMonitor {
    pub fn new(manager: Arc<ConnectionManager>, instance_id: impl Into<String>, config: MonitorConfig) -> Self {
        Self {
            manager,
            instance_id: instance_id.into(),
            thresholds: RwLock::new(config.thresholds),
            config,
            series: RwLock::new(HashMap::new()),
            system: Mutex::new(System::new()),
            started: Instant::now(),
            collector: Mutex::new(None),
        }
    }

    fn window_millis(&self) -> u64 {
        self.config.window_secs.saturating_mul(1_000)
    }

    /// Append a sample, dropping points older than the window.
    pub fn record_metric(&self, name: &str, value: f64) {
        let now = epoch_millis();
        let cutoff = now.saturating_sub(self.window_millis());
        let mut series = self.series.write();
        let points = series.entry(name.to_string()).or_default();
        points.push_back(MetricPoint { timestamp: now, value });
        while points.front().is_some_and(|p| p.timestamp < cutoff) {
            points.pop_front();
        }
        metrics::set_host_metric(name, value);
    }

    /// Samples of `name` taken at or after `since` (epoch millis).
    pub fn metrics(&self, name: &str, since: u64) -> Vec<MetricPoint> {
        let cutoff = epoch_millis().saturating_sub(self.window_millis()).max(since);
        self.series
            .read()
            .get(name)
            .map(|points| points.iter().filter(|p| p.timestamp >= cutoff).copied().collect())
            .unwrap_or_default()
    }

    pub fn latest(&self, name: &str) -> Option<MetricPoint> {
        self.series.read().get(name).and_then(|p| p.back().copied())
    }

    pub fn thresholds(&self) -> FallbackThresholds {
        *self.thresholds.read()
    }

    pub fn set_thresholds(&self, thresholds: FallbackThresholds) {
        *self.thresholds.write() = thresholds;
        info!(?thresholds, "Health thresholds updated");
    }

    pub fn check_health(&self) -> HealthReport {
        let thresholds = self.thresholds();
        let checks: Vec<HealthCheck> = [
            (CPU_LOAD, thresholds.cpu_percent),
            (MEMORY_BYTES, thresholds.memory_bytes as f64),
            (ACTIVE_HANDLES, thresholds.active_handles as f64),
        ]
        .into_iter()
        .map(|(metric, threshold)| {
            let value = self.latest(metric).map(|p| p.value);
            HealthCheck {
                metric,
                value,
                threshold,
                passed: value.map_or(true, |v| v < threshold),
            }
        })
        .collect();

        let status = if checks.iter().all(|c| c.passed) {
            HealthState::Healthy
        } else {
            HealthState::Unhealthy
        };
        metrics::set_healthy(status == HealthState::Healthy);
        HealthReport {
            status,
            checks,
            checked_at: epoch_millis(),
        }
    }

    fn sample_host(&self) -> HostSample {
        let cores = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1) as f64;
        let cpu_load = System::load_average().one / cores * 100.0;

        let memory_bytes = match sysinfo::get_current_pid() {
            Ok(pid) => {
                let mut system = self.system.lock();
                system.refresh_process(pid);
                system.process(pid).map(|p| p.memory()).unwrap_or(0)
            }
            Err(e) => {
                debug!(error = e, "Current pid unavailable");
                0
            }
        };

        // Linux only; elsewhere handle counts are in-flight operations alone
        let open_fds = std::fs::read_dir("/proc/self/fd").map(|d| d.count()).unwrap_or(0);
        let in_flight = self.manager.in_flight_operations();

        HostSample {
            cpu_load,
            memory_bytes: memory_bytes as f64,
            uptime_seconds: self.started.elapsed().as_secs_f64(),
            open_handles: (open_fds + in_flight) as f64,
            active_requests: in_flight as f64,
        }
    }

    /// Take one sample of every host metric and persist it if configured.
    pub async fn collect_once(&self) {
        let sample = self.sample_host();
        let values = [
            (CPU_LOAD, sample.cpu_load),
            (MEMORY_BYTES, sample.memory_bytes),
            (UPTIME_SECONDS, sample.uptime_seconds),
            (ACTIVE_HANDLES, sample.open_handles),
            (ACTIVE_REQUESTS, sample.active_requests),
        ];
        for (name, value) in values {
            self.record_metric(name, value);
        }

        if !self.config.persist {
            return;
        }
        for (name, _) in values {
            let Some(point) = self.latest(name) else { continue };
            let key = format!("performance:{}:{}", self.instance_id, name);
            self.manager.set_json(&key, &point, Some(PERSIST_TTL)).await;
        }
    }

    /// Start the periodic collector. No-op when already running.
    pub fn start(self: &Arc<Self>) {
        let mut collector = self.collector.lock();
        if collector.as_ref().is_some_and(|t| !t.is_finished()) {
            return;
        }
        let interval = Duration::from_secs(self.config.collect_interval_secs.max(1));
        let weak = Arc::downgrade(self);
        *collector = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let Some(this) = weak.upgrade() else { break };
                this.collect_once().await;
                let report = this.check_health();
                if !report.is_healthy() {
                    let failed: Vec<&str> = report.failed_checks().map(|c| c.metric).collect();
                    warn!(failed = ?failed, "Host health checks failing");
                }
            }
        }));
        info!(interval_secs = interval.as_secs(), "Performance collector started");
    }

    pub fn stop(&self) {
        if let Some(handle) = self.collector.lock().take() {
            handle.abort();
            info!("Performance collector stopped");
        }
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.collector.lock().as_ref().is_some_and(|t| !t.is_finished())
    }
}

impl Drop for PerformanceMonitor {
    fn drop(&mut self) {
        if let Some(handle) = self.collector.get_mut().take() {
            handle.abort();
        }
    }
}
