// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Connection lifecycle types.

use std::fmt;

use serde::Serialize;

/// Remote link state.
///
/// ```text
/// Disconnected ──connect()──► Connecting ──ready──► Connected
///      ▲                                               │ error / close
///      │ disconnect()                                  ▼
///      └──────────────────────────────────────── Reconnecting
///                                                      │ retry budget spent
///                                                      ▼
///                                                 FallbackMode ──probe ok──► Connected
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    FallbackMode,
}

impl ConnectionState {
    /// Gauge encoding
    #[must_use]
    pub fn as_u8(self) -> u8 {
        match self {
            Self::Disconnected => 0,
            Self::Connecting => 1,
            Self::Connected => 2,
            Self::Reconnecting => 3,
            Self::FallbackMode => 4,
        }
    }

    #[must_use]
    pub fn is_connected(self) -> bool {
        self == Self::Connected
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Disconnected => "Disconnected",
            Self::Connecting => "Connecting",
            Self::Connected => "Connected",
            Self::Reconnecting => "Reconnecting",
            Self::FallbackMode => "FallbackMode",
        };
        f.write_str(name)
    }
}

/// Broadcast to every subscriber of the connection manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connected,
    Disconnected { reason: String },
    /// Retry budget exhausted; fired once per outage.
    Fallback { reason: String },
}

/// Snapshot returned by `ConnectionManager::health_status`.
#[derive(Debug, Clone, Serialize)]
pub struct HealthStatus {
    pub state: ConnectionState,
    pub target: String,
    /// Epoch millis of the current connection, if connected
    pub connected_since: Option<u64>,
    pub retry_count: u32,
    pub last_error: Option<String>,
    /// `used_memory` reported by the remote server
    pub remote_used_memory: Option<u64>,
    /// Round-trip of the most recent ping, in milliseconds
    pub remote_latency_ms: Option<f64>,
    pub operations: u64,
    pub errors: u64,
    pub connection_drops: u64,
    /// Operations served by the local store instead of the remote one
    pub fallback_operations: u64,
    pub success_rate: f64,
}

/// `1 - errors / operations`, or 1.0 before any operation.
#[must_use]
pub fn success_rate(operations: u64, errors: u64) -> f64 {
    if operations == 0 {
        1.0
    } else {
        1.0 - (errors.min(operations) as f64 / operations as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_display_and_gauge() {
        assert_eq!(ConnectionState::FallbackMode.to_string(), "FallbackMode");
        assert_eq!(ConnectionState::Connected.as_u8(), 2);
        assert!(ConnectionState::Connected.is_connected());
        assert!(!ConnectionState::Reconnecting.is_connected());
    }

    #[test]
    fn test_success_rate() {
        assert_eq!(success_rate(0, 0), 1.0);
        assert_eq!(success_rate(10, 1), 0.9);
        assert_eq!(success_rate(4, 4), 0.0);
    }
}
