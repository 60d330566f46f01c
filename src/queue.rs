// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Hybrid FIFO queue: memory first, remote list under load.
//!
//! ```text
//!              enqueue                                   dequeue
//! Memory mode  ──► [memory ...........]                  ◄── memory head
//!                   len ≥ high (90%) ─► promote: RPUSH all memory, clear
//! Remote mode  ──► remote list tail      [memory head][remote list]  ◄──
//!                   remote < low (70%) ─► demote: LPOP into memory up to
//!                                          capacity; memory mode once the
//!                                          remote list is empty
//! ```
//!
//! In remote mode the memory list, when non-empty, always holds items older
//! than anything in the remote list, so popping memory first and the remote
//! head second keeps global FIFO order. Promotion pushes the whole memory
//! list in one command and clears memory only once that succeeded.
//!
//! The remote list lives at `queue:<name>`; during an outage the connection
//! manager keeps it in the local fallback store with the same semantics.
//! A queue only leaves remote mode after the remote tier has answered with
//! its length: an unreachable remote is never mistaken for an empty one.

use std::collections::VecDeque;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::QueueConfig;
use crate::connection::{ConnectionManager, ListLength};
use crate::metrics;
use crate::storage::epoch_millis;
use crate::storage::traits::StorageError;

/// A queued payload and when it entered the queue (epoch millis).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueItem {
    pub payload: Value,
    pub enqueued_at: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum QueueMode {
    Memory,
    Remote,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct QueueStats {
    pub mode: QueueMode,
    pub memory_len: usize,
    pub enqueued: u64,
    pub dequeued: u64,
    pub promotions: u64,
    pub demotions: u64,
    pub rejected: u64,
    pub recovered: u64,
}

struct QueueState {
    memory: VecDeque<QueueItem>,
    mode: QueueMode,
    enqueued: u64,
    dequeued: u64,
    promotions: u64,
    demotions: u64,
    rejected: u64,
    recovered: u64,
    /// Last remote list length the remote tier reported
    remote_len: u64,
}

pub struct HybridQueue {
    name: String,
    remote_key: String,
    manager: Arc<ConnectionManager>,
    capacity: usize,
    high_watermark: usize,
    low_watermark: usize,
    max_remote_length: Option<usize>,
    state: Mutex<QueueState>,
}

fn watermark(capacity: usize, fraction: f64) -> usize {
    ((capacity as f64 * fraction).ceil() as usize).clamp(1, capacity)
}

impl HybridQueue {
    /// Open a queue, pulling back anything a previous process left in the
    /// remote list (up to capacity) before returning.
    pub async fn open(name: &str, manager: Arc<ConnectionManager>, config: &QueueConfig) -> Self {
        let capacity = config.max_memory_length;
        let queue = Self {
            name: name.to_string(),
            remote_key: format!("queue:{}", name),
            manager,
            capacity,
            high_watermark: watermark(capacity, config.high_watermark),
            low_watermark: watermark(capacity, config.low_watermark),
            max_remote_length: config.max_remote_length,
            state: Mutex::new(QueueState {
                memory: VecDeque::with_capacity(capacity),
                mode: QueueMode::Memory,
                enqueued: 0,
                dequeued: 0,
                promotions: 0,
                demotions: 0,
                rejected: 0,
                recovered: 0,
                remote_len: 0,
            }),
        };
        queue.recover().await;
        queue
    }

    async fn recover(&self) {
        let mut state = self.state.lock().await;
        let waiting = match self.list_length(&mut state).await {
            Some(ListLength { remote: Some(remote), local }) => (remote + local) as usize,
            Some(ListLength { remote: None, local }) => {
                // Leftovers may sit in the remote list; dequeue will reach them
                state.mode = QueueMode::Remote;
                warn!(queue = %self.name, local, "Remote list length unknown, opening in remote mode");
                return;
            }
            None => {
                warn!(queue = %self.name, "Recovery scan failed, starting empty");
                return;
            }
        };
        if waiting == 0 {
            return;
        }

        let pulled = self.pull_into_memory(&mut state, waiting.min(self.capacity)).await;
        state.recovered = pulled as u64;
        let remaining = waiting.saturating_sub(pulled);
        state.mode = if remaining > 0 || state.memory.len() >= self.high_watermark {
            QueueMode::Remote
        } else {
            QueueMode::Memory
        };
        info!(
            queue = %self.name,
            recovered = pulled,
            remaining,
            mode = ?state.mode,
            "Recovered items left by a previous run"
        );
        self.publish_depth(&state);
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Append a payload. Fails with [`StorageError::QueueFull`] when the
    /// active backing store is at capacity.
    pub async fn enqueue(&self, payload: Value) -> Result<(), StorageError> {
        let item = QueueItem { payload, enqueued_at: epoch_millis() };
        let mut state = self.state.lock().await;

        match state.mode {
            QueueMode::Memory => {
                if state.memory.len() >= self.capacity {
                    return Err(self.reject(&mut state, self.capacity));
                }
                state.memory.push_back(item);
                state.enqueued += 1;
                if state.memory.len() >= self.high_watermark {
                    self.promote(&mut state).await;
                }
            }
            QueueMode::Remote => {
                if let Some(max) = self.max_remote_length {
                    let remote_len = self.backing_len(&mut state).await;
                    if remote_len >= max {
                        return Err(self.reject(&mut state, max));
                    }
                }
                let value = encode(&item)?;
                self.manager.rpush_many(&self.remote_key, &[value]).await?;
                state.enqueued += 1;
            }
        }
        self.publish_depth(&state);
        Ok(())
    }

    /// Remove the oldest item.
    pub async fn dequeue(&self) -> Option<QueueItem> {
        let mut state = self.state.lock().await;
        let item = match state.memory.pop_front() {
            Some(item) => Some(item),
            None if state.mode == QueueMode::Remote => self.pop_remote().await,
            None => None,
        };
        if item.is_some() {
            state.dequeued += 1;
        }
        if state.mode == QueueMode::Remote {
            self.maybe_demote(&mut state).await;
        }
        self.publish_depth(&state);
        item
    }

    /// The item `dequeue` would return, without removing it.
    pub async fn peek(&self) -> Option<QueueItem> {
        let state = self.state.lock().await;
        if let Some(head) = state.memory.front() {
            return Some(head.clone());
        }
        if state.mode == QueueMode::Memory {
            return None;
        }
        match self.manager.lindex_head(&self.remote_key).await {
            Ok(head) => head.and_then(|v| decode(&self.name, v)),
            Err(e) => {
                warn!(queue = %self.name, error = %e, "Peek failed");
                None
            }
        }
    }

    /// Items across memory and the remote list. While the remote tier is
    /// unreachable its last reported length stands in for it.
    pub async fn len(&self) -> usize {
        let mut state = self.state.lock().await;
        let remote = match state.mode {
            QueueMode::Memory => 0,
            QueueMode::Remote => self.backing_len(&mut state).await,
        };
        state.memory.len() + remote
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn mode(&self) -> QueueMode {
        self.state.lock().await.mode
    }

    pub async fn stats(&self) -> QueueStats {
        let state = self.state.lock().await;
        QueueStats {
            mode: state.mode,
            memory_len: state.memory.len(),
            enqueued: state.enqueued,
            dequeued: state.dequeued,
            promotions: state.promotions,
            demotions: state.demotions,
            rejected: state.rejected,
            recovered: state.recovered,
        }
    }

    /// Drop every item in both tiers and return to memory mode.
    pub async fn clear(&self) {
        let mut state = self.state.lock().await;
        state.memory.clear();
        self.manager.del(&self.remote_key).await;
        state.remote_len = 0;
        state.mode = QueueMode::Memory;
        self.publish_depth(&state);
        info!(queue = %self.name, "Queue cleared");
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Transitions
    // ═══════════════════════════════════════════════════════════════════════

    async fn promote(&self, state: &mut QueueState) {
        let values: Vec<Value> = match state.memory.iter().map(encode).collect() {
            Ok(values) => values,
            Err(e) => {
                warn!(queue = %self.name, error = %e, "Promotion skipped, item not serializable");
                return;
            }
        };
        let moved = values.len();
        match self.manager.rpush_many(&self.remote_key, &values).await {
            Ok(()) => {
                state.memory.clear();
                state.mode = QueueMode::Remote;
                state.promotions += 1;
                metrics::record_queue_transition(&self.name, "promote");
                info!(queue = %self.name, moved, "Queue promoted to remote list");
            }
            Err(e) => {
                // Items stay in memory; the next enqueue retries
                warn!(queue = %self.name, error = %e, moved, "Promotion failed, staying in memory");
            }
        }
    }

    async fn maybe_demote(&self, state: &mut QueueState) {
        let remote_len = match self.list_length(state).await.and_then(|parts| parts.total()) {
            Some(len) => len as usize,
            None => {
                debug!(queue = %self.name, "Remote length unknown, demotion check skipped");
                return;
            }
        };
        if remote_len >= self.low_watermark {
            return;
        }

        let room = self.capacity.saturating_sub(state.memory.len());
        let pulled = self.pull_into_memory(state, room.min(remote_len)).await;
        let remote_left = remote_len.saturating_sub(pulled);
        if remote_left == 0 && state.memory.len() < self.high_watermark {
            state.mode = QueueMode::Memory;
            state.demotions += 1;
            metrics::record_queue_transition(&self.name, "demote");
            info!(queue = %self.name, pulled, "Queue demoted to memory");
        } else if pulled > 0 {
            debug!(queue = %self.name, pulled, remote_left, "Pulled remote items into memory");
        }
    }

    /// Per-tier length of the backing list, remembering the remote count.
    async fn list_length(&self, state: &mut QueueState) -> Option<ListLength> {
        match self.manager.llen_parts(&self.remote_key).await {
            Ok(parts) => {
                if let Some(remote) = parts.remote {
                    state.remote_len = remote;
                }
                Some(parts)
            }
            Err(e) => {
                debug!(queue = %self.name, error = %e, "List length unavailable");
                None
            }
        }
    }

    /// Best-known length of the backing list across both tiers.
    async fn backing_len(&self, state: &mut QueueState) -> usize {
        match self.list_length(state).await {
            Some(parts) => (parts.remote.unwrap_or(state.remote_len) + parts.local) as usize,
            None => state.remote_len as usize,
        }
    }

    async fn pull_into_memory(&self, state: &mut QueueState, count: usize) -> usize {
        if count == 0 {
            return 0;
        }
        match self.manager.lpop_many(&self.remote_key, count).await {
            Ok(values) => {
                let popped = values.len();
                state.memory.extend(values.into_iter().filter_map(|v| decode(&self.name, v)));
                popped
            }
            Err(e) => {
                warn!(queue = %self.name, error = %e, "Could not pull items from remote list");
                0
            }
        }
    }

    async fn pop_remote(&self) -> Option<QueueItem> {
        match self.manager.lpop(&self.remote_key).await {
            Ok(value) => value.and_then(|v| decode(&self.name, v)),
            Err(e) => {
                warn!(queue = %self.name, error = %e, "Remote dequeue failed");
                None
            }
        }
    }

    fn reject(&self, state: &mut QueueState, capacity: usize) -> StorageError {
        state.rejected += 1;
        metrics::record_queue_rejected(&self.name);
        StorageError::QueueFull { queue: self.name.clone(), capacity }
    }

    fn publish_depth(&self, state: &QueueState) {
        metrics::set_queue_depth(&self.name, "memory", state.memory.len());
    }
}

fn encode(item: &QueueItem) -> Result<Value, StorageError> {
    serde_json::to_value(item).map_err(|e| StorageError::Serialization {
        key: "queue item".into(),
        message: e.to_string(),
    })
}

fn decode(queue: &str, value: Value) -> Option<QueueItem> {
    match serde_json::from_value(value) {
        Ok(item) => Some(item),
        Err(e) => {
            warn!(queue, error = %e, "Dropping malformed queue item");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionState;
    use crate::test_support::{connected_harness, fast_connection_config, harness_with, wait_for_state};
    use serde_json::json;

    fn config(capacity: usize) -> QueueConfig {
        QueueConfig {
            max_memory_length: capacity,
            ..QueueConfig::default()
        }
    }

    async fn drain(queue: &HybridQueue) -> Vec<Value> {
        let mut out = Vec::new();
        while let Some(item) = queue.dequeue().await {
            out.push(item.payload);
        }
        out
    }

    #[test]
    fn test_watermarks() {
        assert_eq!(watermark(1000, 0.9), 900);
        assert_eq!(watermark(1000, 0.7), 700);
        assert_eq!(watermark(10, 0.9), 9);
        assert_eq!(watermark(1, 0.7), 1);
    }

    #[tokio::test]
    async fn test_memory_mode_fifo() {
        let h = connected_harness().await;
        let queue = HybridQueue::open("jobs", h.manager.clone(), &config(100)).await;
        for i in 0..5 {
            queue.enqueue(json!(i)).await.unwrap();
        }
        assert_eq!(queue.mode().await, QueueMode::Memory);
        assert_eq!(queue.len().await, 5);
        assert_eq!(queue.peek().await.unwrap().payload, json!(0));
        assert_eq!(drain(&queue).await, (0..5).map(|i| json!(i)).collect::<Vec<_>>());
        assert!(queue.dequeue().await.is_none());
    }

    #[tokio::test]
    async fn test_promotes_after_high_watermark() {
        let h = connected_harness().await;
        let queue = HybridQueue::open("bulk", h.manager.clone(), &config(1000)).await;

        for i in 0..899 {
            queue.enqueue(json!(i)).await.unwrap();
        }
        assert_eq!(queue.mode().await, QueueMode::Memory);
        queue.enqueue(json!(899)).await.unwrap();
        assert_eq!(queue.mode().await, QueueMode::Remote);

        for i in 900..950 {
            queue.enqueue(json!(i)).await.unwrap();
        }
        assert_eq!(queue.mode().await, QueueMode::Remote);
        assert_eq!(queue.len().await, 950);
        assert_eq!(queue.stats().await.promotions, 1);
    }

    #[tokio::test]
    async fn test_length_conserved_across_promotion() {
        let h = connected_harness().await;
        let queue = HybridQueue::open("conserve", h.manager.clone(), &config(10)).await;
        for i in 0..8 {
            queue.enqueue(json!(i)).await.unwrap();
        }
        assert_eq!(queue.len().await, 8);

        queue.enqueue(json!(8)).await.unwrap();
        let stats = queue.stats().await;
        assert_eq!(stats.mode, QueueMode::Remote);
        assert_eq!(stats.memory_len, 0);
        assert_eq!(h.manager.llen("queue:conserve").await.unwrap(), 9);
        assert_eq!(queue.len().await, 9);
    }

    #[tokio::test]
    async fn test_order_across_promotion_and_demotion() {
        let h = connected_harness().await;
        let queue = HybridQueue::open("orders", h.manager.clone(), &config(10)).await;

        for i in 0..25 {
            queue.enqueue(json!(i)).await.unwrap();
        }
        let mut out = Vec::new();
        for _ in 0..12 {
            out.push(queue.dequeue().await.unwrap().payload);
        }
        for i in 25..30 {
            queue.enqueue(json!(i)).await.unwrap();
        }
        out.extend(drain(&queue).await);

        assert_eq!(out, (0..30).map(|i| json!(i)).collect::<Vec<_>>());
        let stats = queue.stats().await;
        assert!(stats.promotions >= 1);
        assert!(stats.demotions >= 1);
        assert_eq!(stats.mode, QueueMode::Memory);
        assert_eq!(stats.enqueued, 30);
        assert_eq!(stats.dequeued, 30);
    }

    #[tokio::test]
    async fn test_queue_full_when_no_tier_accepts_promotion() {
        let h = harness_with(fast_connection_config()).await;
        h.manager.set_local_fallback_enabled(false);
        let queue = HybridQueue::open("stuck", h.manager.clone(), &config(4)).await;

        for i in 0..4 {
            queue.enqueue(json!(i)).await.unwrap();
        }
        let err = queue.enqueue(json!(4)).await.unwrap_err();
        assert!(matches!(err, StorageError::QueueFull { capacity: 4, .. }));
        assert_eq!(queue.stats().await.rejected, 1);
        // Nothing was lost
        assert_eq!(drain(&queue).await, (0..4).map(|i| json!(i)).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_remote_length_cap() {
        let h = connected_harness().await;
        let config = QueueConfig {
            max_memory_length: 2,
            max_remote_length: Some(3),
            ..QueueConfig::default()
        };
        let queue = HybridQueue::open("capped", h.manager.clone(), &config).await;
        for i in 0..3 {
            queue.enqueue(json!(i)).await.unwrap();
        }
        assert!(matches!(queue.enqueue(json!(3)).await, Err(StorageError::QueueFull { capacity: 3, .. })));
    }

    #[tokio::test]
    async fn test_recovery_pulls_leftovers() {
        let h = connected_harness().await;
        let leftovers: Vec<Value> = (0..15)
            .map(|i| serde_json::to_value(QueueItem { payload: json!(i), enqueued_at: 0 }).unwrap())
            .collect();
        h.manager.rpush_many("queue:crashed", &leftovers).await.unwrap();

        let queue = HybridQueue::open("crashed", h.manager.clone(), &config(10)).await;
        let stats = queue.stats().await;
        assert_eq!(stats.recovered, 10);
        assert_eq!(stats.memory_len, 10);
        assert_eq!(stats.mode, QueueMode::Remote);
        assert_eq!(queue.len().await, 15);
        assert_eq!(drain(&queue).await, (0..15).map(|i| json!(i)).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_remote_mode_survives_outage() {
        let h = connected_harness().await;
        let queue = HybridQueue::open("outage", h.manager.clone(), &config(4)).await;
        for i in 0..6 {
            queue.enqueue(json!(i)).await.unwrap();
        }
        assert_eq!(queue.mode().await, QueueMode::Remote);
        assert_eq!(queue.len().await, 6);

        h.remote.set_reachable(false);
        queue.enqueue(json!(6)).await.unwrap();
        queue.enqueue(json!(7)).await.unwrap();
        assert_eq!(queue.len().await, 8);

        // Items written during the outage queue up behind the remote ones
        h.remote.set_reachable(true);
        wait_for_state(&h.manager, ConnectionState::Connected).await;
        assert_eq!(drain(&queue).await, (0..8).map(|i| json!(i)).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_dequeue_during_outage_keeps_remote_items() {
        let h = connected_harness().await;
        let queue = HybridQueue::open("stranded", h.manager.clone(), &config(4)).await;
        for i in 0..6 {
            queue.enqueue(json!(i)).await.unwrap();
        }
        assert_eq!(queue.len().await, 6);

        h.remote.set_reachable(false);
        assert!(queue.dequeue().await.is_none());
        assert!(queue.dequeue().await.is_none());
        // An unreachable remote is not an empty one
        assert_eq!(queue.mode().await, QueueMode::Remote);
        assert_eq!(queue.stats().await.demotions, 0);
        assert_eq!(queue.len().await, 6);

        h.remote.set_reachable(true);
        wait_for_state(&h.manager, ConnectionState::Connected).await;
        assert_eq!(drain(&queue).await, (0..6).map(|i| json!(i)).collect::<Vec<_>>());
        assert_eq!(queue.len().await, 0);
        assert_eq!(queue.mode().await, QueueMode::Memory);
    }

    #[tokio::test]
    async fn test_open_during_outage_reaches_leftovers() {
        let h = connected_harness().await;
        let leftovers: Vec<Value> = (0..3)
            .map(|i| serde_json::to_value(QueueItem { payload: json!(i), enqueued_at: 0 }).unwrap())
            .collect();
        h.manager.rpush_many("queue:later", &leftovers).await.unwrap();

        h.remote.set_reachable(false);
        let queue = HybridQueue::open("later", h.manager.clone(), &config(10)).await;
        assert_eq!(queue.mode().await, QueueMode::Remote);

        h.remote.set_reachable(true);
        wait_for_state(&h.manager, ConnectionState::Connected).await;
        assert_eq!(drain(&queue).await, (0..3).map(|i| json!(i)).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_clear() {
        let h = connected_harness().await;
        let queue = HybridQueue::open("wipe", h.manager.clone(), &config(4)).await;
        for i in 0..6 {
            queue.enqueue(json!(i)).await.unwrap();
        }
        queue.clear().await;
        assert_eq!(queue.len().await, 0);
        assert_eq!(queue.mode().await, QueueMode::Memory);
        assert!(queue.peek().await.is_none());
    }
}
