// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Storage tiers.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │  traits.rs  - StorageError, RemoteStore, Connector           │
//! │  redis.rs   - Redis remote tier (multiplexed connection)     │
//! │  memory.rs  - In-process remote tier with outage injection   │
//! │  local.rs   - One-file-per-key local fallback store          │
//! └──────────────────────────────────────────────────────────────┘
//! ```

pub mod traits;
pub mod redis;
pub mod memory;
pub mod local;

use std::time::{SystemTime, UNIX_EPOCH};

/// Milliseconds since the Unix epoch.
pub(crate) fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
