// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Basic state-substrate usage example.
//!
//! Demonstrates:
//! 1. Starting against Redis (or an in-process remote when `REDIS_URL` is unset)
//! 2. Cache, queue and rate limiter on a healthy link
//! 3. A simulated outage: writes keep landing in the local fallback store
//! 4. Recovery and the orchestrator status
//! 5. Displaying captured metrics
//! 6. Clean shutdown
//!
//! # Run
//!
//! ```bash
//! # In-process remote (outage simulation enabled)
//! cargo run --example basic_usage
//!
//! # Real Redis
//! REDIS_URL=redis://localhost:6379 cargo run --example basic_usage
//! ```

use std::sync::Arc;
use std::time::Duration;

use metrics_util::debugging::{DebugValue, DebuggingRecorder, Snapshotter};
use serde_json::json;
use state_substrate::{
    ConnectionState, InMemoryRemote, MemoryConnector, Substrate, SubstrateConfig,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    recorder.install().expect("failed to install metrics recorder");

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "state_substrate=info".into()),
        )
        .with_target(false)
        .compact()
        .init();

    println!("\n╔═══════════════════════════════════════════════════════════════╗");
    println!("║           state-substrate: Basic Usage Example                ║");
    println!("╚═══════════════════════════════════════════════════════════════╝\n");

    // ─────────────────────────────────────────────────────────────────────────
    // 1. Configure and start
    // ─────────────────────────────────────────────────────────────────────────
    let mut config = SubstrateConfig::from_env();
    config.fallback_dir = std::env::temp_dir()
        .join(format!("substrate-demo-{}", std::process::id()))
        .to_string_lossy()
        .into_owned();
    config.connection.watchdog_interval_ms = 200;
    config.connection.max_retry_time_ms = 1_000;
    config.connection.fallback_probe_interval_ms = 500;
    let fallback_dir = config.fallback_dir.clone();

    let simulated = config.connection.redis_url.is_none();
    let remote = Arc::new(InMemoryRemote::new());
    println!("🚀 Starting substrate ({})...", if simulated { "in-process remote" } else { "Redis" });
    let substrate = if simulated {
        Substrate::start_with_connector(config, Arc::new(MemoryConnector::new(remote.clone()))).await?
    } else {
        Substrate::start(config).await?
    };
    println!("   ✅ State: {}", substrate.connection().state());

    // ─────────────────────────────────────────────────────────────────────────
    // 2. Healthy link
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n📝 Cache, queue and rate limiter...");
    let cache = substrate.cache();
    cache.set_through("user:alice", json!({"name": "Alice", "role": "admin"}), None).await;
    let start = std::time::Instant::now();
    let alice = cache.get("user:alice").await;
    println!("   └─ cache.get('user:alice') → {:?} ({:?}, memory tier)", alice, start.elapsed());

    let jobs = substrate.queue("demo-jobs").await;
    for i in 0..3 {
        jobs.enqueue(json!({"job": i})).await?;
    }
    println!("   └─ queue length: {} (mode {:?})", jobs.len().await, jobs.mode().await);

    let limiter = substrate.rate_limiter();
    let decisions: Vec<bool> = {
        let mut out = Vec::new();
        for _ in 0..5 {
            out.push(limiter.check_rate_limit("demo-client").await.allowed);
        }
        out
    };
    println!("   └─ rate limit decisions: {:?}", decisions);

    // ─────────────────────────────────────────────────────────────────────────
    // 3. Outage
    // ─────────────────────────────────────────────────────────────────────────
    if simulated {
        println!("\n💥 Simulating remote outage...");
        remote.set_reachable(false);
        let mut states = substrate.connection().watch_state();
        let _ = tokio::time::timeout(
            Duration::from_secs(5),
            states.wait_for(|s| *s == ConnectionState::FallbackMode),
        )
        .await;
        println!("   └─ State: {}", substrate.connection().state());

        substrate.set("written:during-outage", &json!({"ok": true}), None).await;
        println!(
            "   └─ get('written:during-outage') → {:?} (local fallback)",
            substrate.get("written:during-outage").await
        );
        jobs.enqueue(json!({"job": "offline"})).await?;
        println!("   └─ queue length: {}", jobs.len().await);

        // ─────────────────────────────────────────────────────────────────────
        // 4. Recovery
        // ─────────────────────────────────────────────────────────────────────
        println!("\n🔌 Restoring remote...");
        remote.set_reachable(true);
        let _ = tokio::time::timeout(
            Duration::from_secs(5),
            states.wait_for(|s| *s == ConnectionState::Connected),
        )
        .await;
        println!("   └─ State: {}", substrate.connection().state());
    }

    while let Some(item) = jobs.dequeue().await {
        println!("   └─ dequeued {}", item.payload);
    }

    let status = substrate.orchestrator().status().await;
    println!("\n📍 Orchestrator status:");
    println!("{}", serde_json::to_string_pretty(&status)?);

    // ─────────────────────────────────────────────────────────────────────────
    // 5. Metrics
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n📈 Captured metrics:");
    dump_metrics(&snapshotter);

    // ─────────────────────────────────────────────────────────────────────────
    // 6. Shutdown
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n🛑 Shutting down...");
    substrate.shutdown().await;
    let _ = std::fs::remove_dir_all(&fallback_dir);
    println!("   ✅ Shutdown complete! State: {}", substrate.connection().state());

    Ok(())
}

/// Print counters and gauges, then histogram summaries, sorted by name.
fn dump_metrics(snapshotter: &Snapshotter) {
    let mut lines: Vec<String> = snapshotter
        .snapshot()
        .into_vec()
        .into_iter()
        .map(|(composite_key, _, _, value)| {
            let (_, key) = composite_key.into_parts();
            let labels: Vec<String> = key.labels().map(|l| format!("{}={}", l.key(), l.value())).collect();
            let name = if labels.is_empty() {
                key.name().to_string()
            } else {
                format!("{}{{{}}}", key.name(), labels.join(","))
            };
            match value {
                DebugValue::Counter(v) => format!("{} = {}", name, v),
                DebugValue::Gauge(v) => format!("{} = {:.2}", name, v.into_inner()),
                DebugValue::Histogram(samples) => {
                    let sum: f64 = samples.iter().map(|v| v.into_inner()).sum();
                    format!("{} count={} sum={:.4}", name, samples.len(), sum)
                }
            }
        })
        .collect();
    lines.sort();

    if lines.is_empty() {
        println!("   └─ (no metrics recorded)");
    }
    for line in lines {
        println!("   └─ {}", line);
    }
}
