// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Retry logic with exponential backoff and jitter.
//!
//! Provides configurable retry behavior for transient failures, used for
//! the initial connection. Runtime reconnection follows the same
//! [`backoff_delay`] curve with the connection manager's own settings.
//!
//! # Example
//!
//! ```
//! use state_substrate::RetryConfig;
//! use std::time::Duration;
//!
//! // Startup: fail fast on bad config
//! let startup = RetryConfig::startup();
//! assert_eq!(startup.max_retries, Some(5));
//!
//! // Every delay stays under the cap, jitter included
//! assert!(startup.delay_for_attempt(40) <= startup.max_delay);
//! ```

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio::time::sleep;
use tracing::{info, warn};

use crate::storage::traits::StorageError;

/// Errors that can tell a transient failure from a permanent one.
///
/// [`retry`] stops immediately on a non-transient error.
pub trait Transient {
    fn is_transient(&self) -> bool;
}

impl Transient for StorageError {
    fn is_transient(&self) -> bool {
        !self.is_fatal()
    }
}

/// `min(max_delay, base * 2^attempt + random(0..jitter))`
#[must_use]
pub fn backoff_delay(base: Duration, max_delay: Duration, attempt: u32, jitter: Duration) -> Duration {
    let exponential = 2u32
        .checked_pow(attempt)
        .and_then(|factor| base.checked_mul(factor))
        .unwrap_or(max_delay);
    let jitter_ms = jitter.as_millis() as u64;
    let jitter = if jitter_ms == 0 {
        Duration::ZERO
    } else {
        Duration::from_millis(rand::thread_rng().gen_range(0..jitter_ms))
    };
    exponential.saturating_add(jitter).min(max_delay)
}

/// Configuration for connection/operation retry behavior.
///
/// [`RetryConfig::startup()`] is the default: fast-fail for the initial
/// connection. `max_retries: None` retries until success.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// Upper bound of the random component added to each delay
    pub jitter: Duration,
    pub max_retries: Option<usize>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::startup()
    }
}

impl RetryConfig {
    /// Fast-fail retry for the initial connection.
    /// Attempts 5 times with exponential backoff, failing after a few seconds.
    /// A configuration error (bad credentials, malformed URL) stops at once.
    #[must_use]
    pub fn startup() -> Self {
        Self {
            max_retries: Some(5),
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(2),
            jitter: Duration::from_millis(100),
        }
    }

    /// Fast retry for tests (minimal delays)
    #[cfg(test)]
    pub fn test() -> Self {
        Self {
            max_retries: Some(3),
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            jitter: Duration::ZERO,
        }
    }

    /// Delay before retry number `attempt` (0-based).
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        backoff_delay(self.initial_delay, self.max_delay, attempt, self.jitter)
    }
}

pub async fn retry<F, Fut, T, E>(
    operation_name: &str,
    config: &RetryConfig,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display + Transient,
{
    let mut attempts: usize = 0;

    loop {
        match operation().await {
            Ok(val) => {
                if attempts > 0 {
                    info!(operation = operation_name, retries = attempts, "Operation succeeded after retries");
                }
                return Ok(val);
            }
            Err(err) => {
                attempts += 1;

                if !err.is_transient() {
                    warn!(operation = operation_name, error = %err, "Operation failed permanently, not retrying");
                    return Err(err);
                }

                if let Some(max) = config.max_retries {
                    if attempts >= max {
                        return Err(err);
                    }
                }

                let delay = config.delay_for_attempt((attempts - 1) as u32);
                match config.max_retries {
                    None => warn!(
                        operation = operation_name,
                        attempt = attempts,
                        error = %err,
                        next_retry = ?delay,
                        "Operation failed, will retry forever"
                    ),
                    Some(max) => warn!(
                        operation = operation_name,
                        attempt = attempts,
                        max_attempts = max,
                        error = %err,
                        next_retry = ?delay,
                        "Operation failed, retrying"
                    ),
                }

                sleep(delay).await;
            }
        }
    }
}
