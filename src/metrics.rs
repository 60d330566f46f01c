// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics instrumentation for the state substrate.
//!
//! Uses the `metrics` crate for backend-agnostic metrics collection.
//! The host application is responsible for choosing the exporter (Prometheus, OTEL, etc.)
//!
//! # Metric Naming Convention
//! - `substrate_` prefix for all metrics
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Labels
//! - `tier`: memory, remote, local
//! - `operation`: get, set, del, exists, rpush, lpop, incr, scan
//! - `status`: success, error, miss

use metrics::{counter, gauge, histogram};
use std::time::{Duration, Instant};

/// Record a storage operation outcome
pub fn record_operation(tier: &str, operation: &str, status: &str) {
    counter!(
        "substrate_operations_total",
        "tier" => tier.to_string(),
        "operation" => operation.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

/// Record operation latency
pub fn record_latency(tier: &str, operation: &str, duration: Duration) {
    histogram!(
        "substrate_operation_seconds",
        "tier" => tier.to_string(),
        "operation" => operation.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Remote operation that was served by the local fallback store instead
pub fn record_fallback(operation: &str) {
    counter!(
        "substrate_fallback_total",
        "operation" => operation.to_string()
    )
    .increment(1);
}

/// Operations currently awaiting the remote tier
pub fn set_in_flight_operations(count: usize) {
    gauge!("substrate_in_flight_operations").set(count as f64);
}

// ═══════════════════════════════════════════════════════════════════════════
// ERROR TRACKING - Categorized error counters for alerting
// ═══════════════════════════════════════════════════════════════════════════

/// Record an error with category for alerting
pub fn record_error(tier: &str, operation: &str, error_type: &str) {
    counter!(
        "substrate_errors_total",
        "tier" => tier.to_string(),
        "operation" => operation.to_string(),
        "error_type" => error_type.to_string()
    )
    .increment(1);
}

/// Record a timeout error
pub fn record_timeout(tier: &str, operation: &str) {
    counter!(
        "substrate_timeouts_total",
        "tier" => tier.to_string(),
        "operation" => operation.to_string()
    )
    .increment(1);
}

/// A write that neither tier accepted
pub fn record_data_loss(operation: &str) {
    counter!(
        "substrate_data_loss_total",
        "operation" => operation.to_string()
    )
    .increment(1);
}

/// A local entry that failed to decode and was discarded
pub fn record_corruption(tier: &str) {
    counter!(
        "substrate_corruption_detected_total",
        "tier" => tier.to_string()
    )
    .increment(1);
}

// ═══════════════════════════════════════════════════════════════════════════
// CONNECTION LIFECYCLE
// ═══════════════════════════════════════════════════════════════════════════

/// Connection state (0 = Disconnected, 1 = Connecting, 2 = Connected,
/// 3 = Reconnecting, 4 = FallbackMode)
pub fn set_connection_state(state: u8) {
    gauge!("substrate_connection_state").set(state as f64);
}

/// Record a connect attempt and its outcome
pub fn record_connect_attempt(success: bool) {
    counter!(
        "substrate_connect_attempts_total",
        "status" => if success { "success" } else { "error" }
    )
    .increment(1);
}

/// An established connection was lost
pub fn record_connection_drop() {
    counter!("substrate_connection_drops_total").increment(1);
}

/// The reconnect budget ran out
pub fn record_fallback_mode_entered() {
    counter!("substrate_fallback_mode_entered_total").increment(1);
}

/// Round-trip of the last watchdog ping
pub fn record_ping_latency(duration: Duration) {
    histogram!("substrate_ping_seconds").record(duration.as_secs_f64());
}

// ═══════════════════════════════════════════════════════════════════════════
// LOCAL FALLBACK STORE
// ═══════════════════════════════════════════════════════════════════════════

/// Set number of entries on disk
pub fn set_local_entries(count: usize) {
    gauge!("substrate_local_entries").set(count as f64);
}

/// Record expired entries removed by the sweep
pub fn record_local_swept(count: usize) {
    counter!("substrate_local_swept_total").increment(count as u64);
}

// ═══════════════════════════════════════════════════════════════════════════
// SUBSYSTEMS
// ═══════════════════════════════════════════════════════════════════════════

/// Record a cache lookup at a tier
pub fn record_cache_lookup(tier: &str, hit: bool) {
    counter!(
        "substrate_cache_lookups_total",
        "tier" => tier.to_string(),
        "result" => if hit { "hit" } else { "miss" }
    )
    .increment(1);
}

/// Set current memory-tier entry count
pub fn set_cache_entries(count: usize) {
    gauge!("substrate_cache_memory_entries").set(count as f64);
}

/// Record memory-tier evictions
pub fn record_cache_eviction(count: usize) {
    counter!("substrate_cache_evictions_total").increment(count as u64);
}

/// Set queue depth per backing tier
pub fn set_queue_depth(queue: &str, tier: &str, depth: usize) {
    gauge!(
        "substrate_queue_depth",
        "queue" => queue.to_string(),
        "tier" => tier.to_string()
    )
    .set(depth as f64);
}

/// Record a queue mode change ("promote" or "demote")
pub fn record_queue_transition(queue: &str, direction: &str) {
    counter!(
        "substrate_queue_transitions_total",
        "queue" => queue.to_string(),
        "direction" => direction.to_string()
    )
    .increment(1);
}

/// Record an enqueue refused for capacity
pub fn record_queue_rejected(queue: &str) {
    counter!(
        "substrate_queue_rejected_total",
        "queue" => queue.to_string()
    )
    .increment(1);
}

/// Record a rate limit decision; `path` is "local" or "remote"
pub fn record_rate_limit_decision(allowed: bool, path: &str) {
    counter!(
        "substrate_rate_limit_decisions_total",
        "decision" => if allowed { "allowed" } else { "denied" },
        "path" => path.to_string()
    )
    .increment(1);
}

/// Record a session backup outcome
pub fn record_session_backup(status: &str, count: usize) {
    counter!(
        "substrate_session_backups_total",
        "status" => status.to_string()
    )
    .increment(count as u64);
}

/// Latest host sample
pub fn set_host_metric(name: &str, value: f64) {
    gauge!(
        "substrate_host_metric",
        "metric" => name.to_string()
    )
    .set(value);
}

/// Overall health (1 = healthy, 0 = unhealthy)
pub fn set_healthy(healthy: bool) {
    gauge!("substrate_healthy").set(if healthy { 1.0 } else { 0.0 });
}

/// Record a feature flag change
pub fn record_feature_toggle(feature: &str, enabled: bool, forced: bool) {
    counter!(
        "substrate_feature_toggles_total",
        "feature" => feature.to_string(),
        "enabled" => enabled.to_string(),
        "forced" => forced.to_string()
    )
    .increment(1);
}

/// Record startup phase timing
pub fn record_startup_phase(phase: &str, duration: Duration) {
    histogram!(
        "substrate_startup_seconds",
        "phase" => phase.to_string()
    )
    .record(duration.as_secs_f64());
}

/// A timing guard that records latency on drop
pub struct LatencyTimer {
    tier: &'static str,
    operation: &'static str,
    start: Instant,
}

impl LatencyTimer {
    /// Start a new latency timer
    pub fn new(tier: &'static str, operation: &'static str) -> Self {
        Self {
            tier,
            operation,
            start: Instant::now(),
        }
    }
}

impl Drop for LatencyTimer {
    fn drop(&mut self) {
        record_latency(self.tier, self.operation, self.start.elapsed());
    }
}
