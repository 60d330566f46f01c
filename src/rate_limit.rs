// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Hybrid rate limiter: local fast path plus a remote fixed window.
//!
//! Every check bumps a local per-identifier counter. The first
//! `fallback_threshold` checks are admitted without waiting on the remote
//! tier (its counter is still incremented in the background). After that,
//! each check increments the remote fixed-window counter at
//! `ratelimit:<id>` and is denied once the window count passes
//! `max_requests`.
//!
//! Windows reset through the remote key's expiry; local counters only reset
//! through [`HybridRateLimiter::reset_limits`]. Because the fast path does
//! not wait for the remote count, an instance can admit up to
//! `fallback_threshold` requests beyond `max_requests` in one window. That
//! over-admission is accepted in exchange for skipping a round-trip on the
//! common path.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::RateLimitConfig;
use crate::connection::ConnectionManager;
use crate::metrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub local_count: u64,
    /// Window count from the remote counter, when it was consulted
    pub remote_count: Option<u64>,
    pub limit: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RateUsage {
    pub local_count: u64,
    pub remote_count: Option<u64>,
}

pub struct HybridRateLimiter {
    manager: Arc<ConnectionManager>,
    config: RateLimitConfig,
    local: DashMap<String, u64>,
    local_fast_path: AtomicBool,
}

impl HybridRateLimiter {
    pub fn new(manager: Arc<ConnectionManager>, config: RateLimitConfig) -> Self {
        Self {
            manager,
            config,
            local: DashMap::new(),
            local_fast_path: AtomicBool::new(true),
        }
    }

    fn remote_key(id: &str) -> String {
        format!("ratelimit:{}", id)
    }

    /// When off, every check waits for the remote counter.
    pub fn set_local_fast_path(&self, enabled: bool) {
        self.local_fast_path.store(enabled, Ordering::SeqCst);
        info!(enabled, "Rate limiter local fast path toggled");
    }

    #[must_use]
    pub fn local_fast_path(&self) -> bool {
        self.local_fast_path.load(Ordering::SeqCst)
    }

    pub async fn check_rate_limit(&self, id: &str) -> RateLimitDecision {
        let local_count = {
            let mut count = self.local.entry(id.to_string()).or_insert(0);
            *count += 1;
            *count
        };
        let key = Self::remote_key(id);
        let window = self.config.window();

        if self.local_fast_path() && local_count <= self.config.fallback_threshold {
            let manager = Arc::clone(&self.manager);
            tokio::spawn(async move {
                if let Err(e) = manager.incr_with_expiry(&key, window).await {
                    debug!(key = %key, error = %e, "Background rate counter increment failed");
                }
            });
            metrics::record_rate_limit_decision(true, "local");
            return RateLimitDecision {
                allowed: true,
                local_count,
                remote_count: None,
                limit: self.config.max_requests,
            };
        }

        let (allowed, remote_count) = match self.manager.incr_with_expiry(&key, window).await {
            Ok(count) => (count <= self.config.max_requests, Some(count)),
            Err(e) => {
                // No tier could count: admit rather than fail the caller
                warn!(id, error = %e, "Rate counter unavailable, admitting request");
                (true, None)
            }
        };
        metrics::record_rate_limit_decision(allowed, "remote");
        if !allowed {
            debug!(id, local_count, remote_count = ?remote_count, "Rate limit exceeded");
        }
        RateLimitDecision {
            allowed,
            local_count,
            remote_count,
            limit: self.config.max_requests,
        }
    }

    /// Forget the local counter and the current remote window for `id`.
    pub async fn reset_limits(&self, id: &str) {
        self.local.remove(id);
        self.manager.del(&Self::remote_key(id)).await;
        debug!(id, "Rate limits reset");
    }

    pub async fn usage(&self, id: &str) -> RateUsage {
        let local_count = self.local.get(id).map(|c| *c).unwrap_or(0);
        let remote_count = self
            .manager
            .get(&Self::remote_key(id))
            .await
            .and_then(|v| v.as_u64().or_else(|| v.as_str().and_then(|s| s.parse().ok())));
        RateUsage { local_count, remote_count }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::connected_harness;
    use std::time::Duration;

    fn config(max: u64, threshold: u64, window_secs: u64) -> RateLimitConfig {
        RateLimitConfig {
            max_requests: max,
            window_secs,
            fallback_threshold: threshold,
        }
    }

    #[tokio::test]
    async fn test_fast_path_admits_up_to_threshold() {
        let h = connected_harness().await;
        let limiter = HybridRateLimiter::new(h.manager.clone(), config(100, 3, 60));

        for i in 1..=3 {
            let decision = limiter.check_rate_limit("user").await;
            assert!(decision.allowed);
            assert_eq!(decision.local_count, i);
            assert_eq!(decision.remote_count, None);
        }
        let decision = limiter.check_rate_limit("user").await;
        assert!(decision.remote_count.is_some());
    }

    #[tokio::test]
    async fn test_admissions_bounded_by_max_plus_threshold() {
        let h = connected_harness().await;
        let limiter = HybridRateLimiter::new(h.manager.clone(), config(5, 3, 60));

        let mut admitted = 0;
        for _ in 0..30 {
            if limiter.check_rate_limit("burst").await.allowed {
                admitted += 1;
            }
        }
        assert!(admitted >= 5, "admitted {}", admitted);
        assert!(admitted <= 5 + 3, "admitted {}", admitted);
    }

    #[tokio::test]
    async fn test_strict_when_fast_path_disabled() {
        let h = connected_harness().await;
        let limiter = HybridRateLimiter::new(h.manager.clone(), config(4, 10, 60));
        limiter.set_local_fast_path(false);

        let admitted = {
            let mut n = 0;
            for _ in 0..10 {
                if limiter.check_rate_limit("strict").await.allowed {
                    n += 1;
                }
            }
            n
        };
        assert_eq!(admitted, 4);
    }

    #[tokio::test]
    async fn test_window_expiry_readmits() {
        let h = connected_harness().await;
        let limiter = HybridRateLimiter::new(h.manager.clone(), config(2, 0, 1));

        assert!(limiter.check_rate_limit("w").await.allowed);
        assert!(limiter.check_rate_limit("w").await.allowed);
        assert!(!limiter.check_rate_limit("w").await.allowed);

        tokio::time::sleep(Duration::from_millis(1_100)).await;
        assert!(limiter.check_rate_limit("w").await.allowed);
    }

    #[tokio::test]
    async fn test_reset_limits_clears_both_counters() {
        let h = connected_harness().await;
        let limiter = HybridRateLimiter::new(h.manager.clone(), config(1, 0, 60));
        assert!(limiter.check_rate_limit("r").await.allowed);
        assert!(!limiter.check_rate_limit("r").await.allowed);

        limiter.reset_limits("r").await;
        assert_eq!(limiter.usage("r").await, RateUsage { local_count: 0, remote_count: None });
        assert!(limiter.check_rate_limit("r").await.allowed);
    }

    #[tokio::test]
    async fn test_usage_reports_counts() {
        let h = connected_harness().await;
        let limiter = HybridRateLimiter::new(h.manager.clone(), config(10, 0, 60));
        for _ in 0..3 {
            limiter.check_rate_limit("u").await;
        }
        let usage = limiter.usage("u").await;
        assert_eq!(usage.local_count, 3);
        assert_eq!(usage.remote_count, Some(3));
    }

    #[tokio::test]
    async fn test_counts_locally_during_outage() {
        let h = connected_harness().await;
        let limiter = HybridRateLimiter::new(h.manager.clone(), config(2, 0, 60));
        h.remote.set_reachable(false);

        assert!(limiter.check_rate_limit("o").await.allowed);
        assert!(limiter.check_rate_limit("o").await.allowed);
        assert!(!limiter.check_rate_limit("o").await.allowed);
    }
}
