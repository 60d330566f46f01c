// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Connection manager: the single owner of the remote link.
//!
//! Every subsystem reaches storage through this type. Data operations try
//! the remote tier first (bounded by `operation_timeout`) and transparently
//! fall back to the [`LocalFallbackStore`] on any failure, so callers see
//! slower but correct behavior during an outage instead of errors.
//!
//! # Lifecycle
//!
//! ```text
//! connect() ──► Connecting ──► Connected ◄──────────────┐
//!                                  │ ping/op failure     │ reconnect ok
//!                                  ▼                     │
//!                             Reconnecting ──backoff─────┤
//!                                  │ retry budget spent  │
//!                                  ▼                     │
//!                             FallbackMode ──probe───────┘
//! ```
//!
//! - At most one reconnect is pending; scheduling a new one aborts the old.
//! - The previous client is dropped before a new one is opened.
//! - `disconnect()` suppresses automatic reconnection until `connect()`.
//! - `Fallback` fires once per outage, when the elapsed retry time exceeds
//!   `max_retry_time`. Probing continues at `fallback_probe_interval`.

pub mod state;

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::ConnectionConfig;
use crate::metrics;
use crate::resilience::retry::backoff_delay;
use crate::storage::epoch_millis;
use crate::storage::local::LocalFallbackStore;
use crate::storage::traits::{Connector, RemoteStore, StorageError};

pub use state::{ConnectionEvent, ConnectionState, HealthStatus};

const EVENT_CHANNEL_CAPACITY: usize = 64;

#[derive(Default)]
struct Link {
    client: Option<Arc<dyn RemoteStore>>,
    retry_count: u32,
    /// First failure of the current outage
    retry_started: Option<Instant>,
    last_error: Option<String>,
    connected_since: Option<u64>,
    manual_disconnect: bool,
    reconnect_task: Option<JoinHandle<()>>,
    last_ping: Option<Duration>,
}

/// Decrements the in-flight counter even when the caller is cancelled.
struct InFlight<'a>(&'a AtomicUsize);

impl<'a> InFlight<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        let now = counter.fetch_add(1, Ordering::Relaxed) + 1;
        metrics::set_in_flight_operations(now);
        Self(counter)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        let now = self.0.fetch_sub(1, Ordering::Relaxed).saturating_sub(1);
        metrics::set_in_flight_operations(now);
    }
}

pub struct ConnectionManager {
    connector: Arc<dyn Connector>,
    target: String,
    config: ConnectionConfig,
    local: Arc<LocalFallbackStore>,
    local_enabled: AtomicBool,
    link: Mutex<Link>,
    /// Serializes connect / reconnect / disconnect
    connect_lock: tokio::sync::Mutex<()>,
    state_tx: watch::Sender<ConnectionState>,
    events: broadcast::Sender<ConnectionEvent>,
    watchdog: Mutex<Option<JoinHandle<()>>>,
    probing: AtomicBool,
    operations: AtomicU64,
    errors: AtomicU64,
    drops: AtomicU64,
    fallbacks: AtomicU64,
    in_flight: AtomicUsize,
    self_ref: Weak<Self>,
}

impl ConnectionManager {
    /// Create a manager in `Disconnected` state. Nothing connects until
    /// `connect()` (or a lazy `client()` call).
    pub fn new(
        connector: Arc<dyn Connector>,
        config: ConnectionConfig,
        local: Arc<LocalFallbackStore>,
    ) -> Arc<Self> {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let target = connector.describe();
        Arc::new_cyclic(|self_ref| Self {
            connector,
            target,
            config,
            local,
            local_enabled: AtomicBool::new(true),
            link: Mutex::new(Link::default()),
            connect_lock: tokio::sync::Mutex::new(()),
            state_tx,
            events,
            watchdog: Mutex::new(None),
            probing: AtomicBool::new(false),
            operations: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            drops: AtomicU64::new(0),
            fallbacks: AtomicU64::new(0),
            in_flight: AtomicUsize::new(0),
            self_ref: self_ref.clone(),
        })
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    /// Receiver that always holds the latest state.
    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    #[must_use]
    pub fn local_store(&self) -> &Arc<LocalFallbackStore> {
        &self.local
    }

    /// Toggle reads from / writes to the local fallback store.
    pub fn set_local_fallback_enabled(&self, enabled: bool) {
        let was = self.local_enabled.swap(enabled, Ordering::SeqCst);
        if was != enabled {
            info!(enabled, "Local fallback toggled");
        }
    }

    #[must_use]
    pub fn local_fallback_enabled(&self) -> bool {
        self.local_enabled.load(Ordering::SeqCst)
    }

    /// Remote operations currently awaiting a reply.
    #[must_use]
    pub fn in_flight_operations(&self) -> usize {
        self.in_flight.load(Ordering::Relaxed)
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            debug!(from = %previous, to = %state, "Connection state changed");
        }
        metrics::set_connection_state(state.as_u8());
    }

    fn emit(&self, event: ConnectionEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Lifecycle
    // ═══════════════════════════════════════════════════════════════════════

    /// Open the remote link. Idempotent: an existing connection is torn
    /// down and replaced (credential rotation). Fails after
    /// `connect_timeout`; a transient failure also schedules a background
    /// reconnect, a configuration failure does not.
    #[tracing::instrument(skip(self), fields(target = %self.target))]
    pub async fn connect(&self) -> Result<(), StorageError> {
        let _guard = self.connect_lock.lock().await;
        let previous = self.state();
        let had_client = {
            let mut link = self.link.lock();
            link.manual_disconnect = false;
            if let Some(task) = link.reconnect_task.take() {
                task.abort();
            }
            link.connected_since = None;
            link.client.take().is_some()
        };
        if had_client {
            info!("Replacing existing remote connection");
        }
        // Keep Reconnecting/FallbackMode so the outage bookkeeping survives
        if !matches!(previous, ConnectionState::Reconnecting | ConnectionState::FallbackMode) {
            self.set_state(ConnectionState::Connecting);
        }

        match self.open_client().await {
            Ok(client) => {
                self.on_connected(client);
                Ok(())
            }
            Err(e) if e.is_fatal() => {
                error!(error = %e, "Remote rejected configuration, not retrying");
                self.set_state(ConnectionState::Disconnected);
                if previous.is_connected() {
                    self.emit(ConnectionEvent::Disconnected { reason: e.to_string() });
                }
                Err(e)
            }
            Err(e) => {
                warn!(error = %e, "Connect failed, scheduling reconnect");
                self.schedule_reconnect(e.to_string());
                Err(e)
            }
        }
    }

    /// Drop the link and stay down until the next `connect()`.
    #[tracing::instrument(skip(self), fields(target = %self.target))]
    pub async fn disconnect(&self) {
        let pending = {
            let mut link = self.link.lock();
            link.manual_disconnect = true;
            link.reconnect_task.take()
        };
        if let Some(task) = pending {
            task.abort();
        }

        let _guard = self.connect_lock.lock().await;
        let was_connected = {
            let mut link = self.link.lock();
            link.manual_disconnect = true;
            link.client = None;
            link.connected_since = None;
            link.retry_count = 0;
            link.retry_started = None;
            let was = self.state().is_connected();
            self.set_state(ConnectionState::Disconnected);
            was
        };
        if was_connected {
            self.emit(ConnectionEvent::Disconnected { reason: "manual disconnect".into() });
        }
        info!("Disconnected from remote store");
    }

    /// Disconnect and stop the watchdog.
    pub async fn shutdown(&self) {
        if let Some(watchdog) = self.watchdog.lock().take() {
            watchdog.abort();
        }
        self.disconnect().await;
    }

    /// A live handle, or `None` when the remote is unreachable.
    ///
    /// From `Disconnected` (and not manually disconnected) this makes one
    /// lazy connect attempt bounded by `connect_timeout`; in any other
    /// non-connected state it returns `None` at once.
    pub async fn client(&self) -> Option<Arc<dyn RemoteStore>> {
        if let Some(client) = self.live_client() {
            return Some(client);
        }
        let lazy = self.state() == ConnectionState::Disconnected && !self.link.lock().manual_disconnect;
        if lazy {
            debug!("Lazy connect from client()");
            if self.connect().await.is_err() {
                return None;
            }
        }
        self.live_client()
    }

    fn live_client(&self) -> Option<Arc<dyn RemoteStore>> {
        let link = self.link.lock();
        if self.state().is_connected() {
            link.client.clone()
        } else {
            None
        }
    }

    async fn open_client(&self) -> Result<Arc<dyn RemoteStore>, StorageError> {
        let timeout = self.config.connect_timeout();
        let result = match tokio::time::timeout(timeout, self.connector.connect()).await {
            Ok(result) => result,
            Err(_) => Err(StorageError::Timeout { operation: "connect".into(), timeout }),
        };
        metrics::record_connect_attempt(result.is_ok());
        if let Err(e) = &result {
            self.link.lock().last_error = Some(e.to_string());
        }
        result
    }

    fn on_connected(&self, client: Arc<dyn RemoteStore>) {
        let recovered_after = {
            let mut link = self.link.lock();
            let retries = link.retry_count;
            link.client = Some(client);
            link.retry_count = 0;
            link.retry_started = None;
            link.last_error = None;
            link.connected_since = Some(epoch_millis());
            // A reconnect task that got us here is finished; forget it
            link.reconnect_task.take();
            self.set_state(ConnectionState::Connected);
            retries
        };
        if recovered_after > 0 {
            info!(target = %self.target, retries = recovered_after, "Remote store connection restored");
        } else {
            info!(target = %self.target, "Connected to remote store");
        }
        self.emit(ConnectionEvent::Connected);
        self.ensure_watchdog();
    }

    fn on_connection_lost(&self, reason: String) {
        {
            let mut link = self.link.lock();
            if link.manual_disconnect || !self.state().is_connected() {
                return;
            }
            link.client = None;
            link.connected_since = None;
            self.set_state(ConnectionState::Reconnecting);
        }
        self.drops.fetch_add(1, Ordering::Relaxed);
        metrics::record_connection_drop();
        warn!(target = %self.target, reason = %reason, "Remote connection lost");
        self.emit(ConnectionEvent::Disconnected { reason: reason.clone() });
        self.schedule_reconnect(reason);
    }

    /// Arm the next reconnect attempt, or enter fallback mode when the
    /// outage has outlasted `max_retry_time`.
    fn schedule_reconnect(&self, reason: String) {
        let mut link = self.link.lock();
        if link.manual_disconnect {
            return;
        }
        link.last_error = Some(reason.clone());
        let started = *link.retry_started.get_or_insert_with(Instant::now);
        let budget = self.config.max_retry_time();

        let delay = if started.elapsed() >= budget {
            if self.state() != ConnectionState::FallbackMode {
                self.set_state(ConnectionState::FallbackMode);
                metrics::record_fallback_mode_entered();
                error!(
                    target = %self.target,
                    retries = link.retry_count,
                    elapsed = ?started.elapsed(),
                    reason = %reason,
                    "Reconnect budget exhausted, entering fallback mode"
                );
                self.emit(ConnectionEvent::Fallback { reason });
            }
            Duration::from_millis(self.config.fallback_probe_interval_ms)
        } else {
            self.set_state(ConnectionState::Reconnecting);
            let delay = backoff_delay(
                Duration::from_millis(self.config.reconnect_base_delay_ms),
                Duration::from_millis(self.config.reconnect_max_delay_ms),
                link.retry_count,
                Duration::from_millis(self.config.reconnect_jitter_ms),
            )
            .min(budget);
            link.retry_count = link.retry_count.saturating_add(1);
            delay
        };

        if let Some(task) = link.reconnect_task.take() {
            task.abort();
        }
        let weak = self.self_ref.clone();
        link.reconnect_task = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(manager) = weak.upgrade() {
                manager.reconnect_attempt().await;
            }
        }));
        debug!(delay = ?delay, attempt = link.retry_count, "Reconnect scheduled");
    }

    async fn reconnect_attempt(self: Arc<Self>) {
        // Detach our own handle so a failure below can arm the next attempt
        drop(self.link.lock().reconnect_task.take());

        let _guard = self.connect_lock.lock().await;
        {
            let mut link = self.link.lock();
            if link.manual_disconnect || self.state().is_connected() {
                return;
            }
            link.client = None;
        }

        match self.open_client().await {
            Ok(client) => self.on_connected(client),
            Err(e) => {
                debug!(error = %e, "Reconnect attempt failed");
                self.schedule_reconnect(e.to_string());
            }
        }
    }

    fn ensure_watchdog(&self) {
        let mut slot = self.watchdog.lock();
        if slot.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }
        let weak = self.self_ref.clone();
        let interval = Duration::from_millis(self.config.watchdog_interval_ms);
        *slot = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(manager) = weak.upgrade() else {
                    break;
                };
                manager.check_link().await;
            }
        }));
    }

    /// Ping the live client; a failure counts as a dropped connection.
    async fn check_link(&self) {
        let Some(client) = self.live_client() else {
            return;
        };
        let started = Instant::now();
        match tokio::time::timeout(self.config.operation_timeout(), client.ping()).await {
            Ok(Ok(())) => {
                let rtt = started.elapsed();
                metrics::record_ping_latency(rtt);
                self.link.lock().last_ping = Some(rtt);
            }
            Ok(Err(e)) => self.on_connection_lost(format!("ping failed: {}", e)),
            Err(_) => self.on_connection_lost("ping timed out".into()),
        }
    }

    /// After a failed operation, verify the link out of band.
    fn probe_link(&self) {
        if self.probing.swap(true, Ordering::SeqCst) {
            return;
        }
        let weak = self.self_ref.clone();
        tokio::spawn(async move {
            if let Some(manager) = weak.upgrade() {
                manager.check_link().await;
                manager.probing.store(false, Ordering::SeqCst);
            }
        });
    }

    /// Snapshot of link state and counters. The `INFO` query behind
    /// `remote_used_memory` is not itself counted as an operation.
    pub async fn health_status(&self) -> HealthStatus {
        let remote_used_memory = match self.live_client() {
            Some(client) => {
                match tokio::time::timeout(self.config.operation_timeout(), client.used_memory()).await {
                    Ok(Ok(used)) => used,
                    Ok(Err(e)) => {
                        debug!(error = %e, "Remote memory query failed");
                        None
                    }
                    Err(_) => None,
                }
            }
            None => None,
        };
        let operations = self.operations.load(Ordering::Relaxed);
        let errors = self.errors.load(Ordering::Relaxed);
        let link = self.link.lock();
        HealthStatus {
            state: self.state(),
            target: self.target.clone(),
            connected_since: link.connected_since,
            retry_count: link.retry_count,
            last_error: link.last_error.clone(),
            remote_used_memory,
            remote_latency_ms: link.last_ping.map(|d| d.as_secs_f64() * 1000.0),
            operations,
            errors,
            connection_drops: self.drops.load(Ordering::Relaxed),
            fallback_operations: self.fallbacks.load(Ordering::Relaxed),
            success_rate: state::success_rate(operations, errors),
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Tier plumbing
    // ═══════════════════════════════════════════════════════════════════════

    /// Run `call` against the live client, bounded by `operation_timeout`.
    /// `None` when there is no live client.
    async fn remote<T, F, Fut>(&self, operation: &'static str, call: F) -> Option<Result<T, StorageError>>
    where
        F: FnOnce(Arc<dyn RemoteStore>) -> Fut,
        Fut: Future<Output = Result<T, StorageError>>,
    {
        let client = self.live_client()?;
        self.operations.fetch_add(1, Ordering::Relaxed);
        let _in_flight = InFlight::enter(&self.in_flight);
        let _timer = metrics::LatencyTimer::new("remote", operation);

        let timeout = self.config.operation_timeout();
        let result = match tokio::time::timeout(timeout, call(client)).await {
            Ok(result) => result,
            Err(_) => {
                metrics::record_timeout("remote", operation);
                Err(StorageError::Timeout { operation: operation.into(), timeout })
            }
        };

        match &result {
            Ok(_) => metrics::record_operation("remote", operation, "success"),
            Err(e) => {
                self.errors.fetch_add(1, Ordering::Relaxed);
                metrics::record_operation("remote", operation, "error");
                metrics::record_error("remote", operation, e.kind());
                warn!(operation, error = %e, "Remote operation failed, using local store");
                self.probe_link();
            }
        }
        Some(result)
    }

    fn local(&self) -> Option<&LocalFallbackStore> {
        self.local_fallback_enabled().then(|| self.local.as_ref())
    }

    fn note_fallback(&self, operation: &str) {
        self.fallbacks.fetch_add(1, Ordering::Relaxed);
        metrics::record_fallback(operation);
        metrics::record_operation("local", operation, "success");
    }

    fn note_local_error(&self, operation: &str, key: &str, e: &StorageError) {
        metrics::record_error("local", operation, e.kind());
        warn!(operation, key, error = %e, "Local fallback store failed");
    }

    fn data_loss(&self, operation: &str, key: &str, cause: &str) {
        metrics::record_data_loss(operation);
        error!(
            operation,
            key,
            cause,
            "DATA LOSS RISK: write dropped, neither remote nor local store accepted it"
        );
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Key/value
    // ═══════════════════════════════════════════════════════════════════════

    /// Read a value. Remote first, then the local store.
    pub async fn get(&self, key: &str) -> Option<Value> {
        if let Some(Ok(Some(raw))) = self.remote("get", |c| async move { c.get(key).await }).await {
            return decode_remote(key, &raw);
        }
        let local = self.local()?;
        match local.get(key).await {
            Ok(Some(value)) => {
                self.note_fallback("get");
                Some(value)
            }
            Ok(None) => None,
            Err(e) => {
                self.note_local_error("get", key, &e);
                None
            }
        }
    }

    /// Read a value with its remaining time to live (`None`: no expiry).
    pub async fn get_with_ttl(&self, key: &str) -> Option<(Value, Option<Duration>)> {
        if let Some(Ok(Some((raw, ttl)))) = self.remote("get", |c| async move { c.get_with_ttl(key).await }).await {
            return decode_remote(key, &raw).map(|value| (value, ttl));
        }
        let local = self.local()?;
        match local.get_with_ttl(key).await {
            Ok(Some(hit)) => {
                self.note_fallback("get");
                Some(hit)
            }
            Ok(None) => None,
            Err(e) => {
                self.note_local_error("get", key, &e);
                None
            }
        }
    }

    /// Write a value. Never fails: a write neither tier accepts is logged
    /// as data loss.
    pub async fn set(&self, key: &str, value: &Value, ttl: Option<Duration>) {
        let payload = value.to_string();
        let remote_ok = matches!(
            self.remote("set", |c| async move { c.set(key, &payload, ttl).await }).await,
            Some(Ok(()))
        );
        if remote_ok && !self.config.mirror_writes_locally {
            return;
        }

        let Some(local) = self.local() else {
            if !remote_ok {
                self.data_loss("set", key, "local fallback disabled");
            }
            return;
        };
        match local.set(key, value.clone(), ttl).await {
            Ok(()) if !remote_ok => self.note_fallback("set"),
            Ok(()) => {}
            Err(e) if remote_ok => self.note_local_error("mirror", key, &e),
            Err(e) => self.data_loss("set", key, &e.to_string()),
        }
    }

    /// Delete from both tiers. Returns whether either held the key.
    pub async fn del(&self, key: &str) -> bool {
        let remote = matches!(
            self.remote("del", |c| async move { c.del(key).await }).await,
            Some(Ok(true))
        );
        let local = match self.local() {
            Some(local) => local.del(key).await.unwrap_or_else(|e| {
                self.note_local_error("del", key, &e);
                false
            }),
            None => false,
        };
        remote || local
    }

    pub async fn exists(&self, key: &str) -> bool {
        if let Some(Ok(true)) = self.remote("exists", |c| async move { c.exists(key).await }).await {
            return true;
        }
        match self.local() {
            Some(local) => local.exists(key).await.unwrap_or_else(|e| {
                self.note_local_error("exists", key, &e);
                false
            }),
            None => false,
        }
    }

    /// Typed read; a value of the wrong shape is treated as absent.
    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let value = self.get(key).await?;
        match serde_json::from_value(value) {
            Ok(typed) => Some(typed),
            Err(e) => {
                warn!(key, error = %e, "Stored value has unexpected shape, treating as absent");
                None
            }
        }
    }

    pub async fn set_json<T: Serialize>(&self, key: &str, value: &T, ttl: Option<Duration>) {
        match serde_json::to_value(value) {
            Ok(value) => self.set(key, &value, ttl).await,
            Err(e) => warn!(key, error = %e, "Value not serializable, write skipped"),
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Lists, counters, scans
    // ═══════════════════════════════════════════════════════════════════════

    /// Append to a list in one command.
    ///
    /// While a local backlog exists for `key` (items pushed during an
    /// outage), new items join it so that head-first pops stay FIFO.
    pub async fn rpush_many(&self, key: &str, items: &[Value]) -> Result<(), StorageError> {
        if items.is_empty() {
            return Ok(());
        }
        let backlog = match self.local() {
            Some(local) => local.llen(key).await.unwrap_or(0),
            None => 0,
        };
        if backlog == 0 {
            let payloads: Vec<String> = items.iter().map(Value::to_string).collect();
            if let Some(Ok(_)) = self.remote("rpush", |c| async move { c.rpush(key, &payloads).await }).await {
                return Ok(());
            }
        }

        let Some(local) = self.local() else {
            self.data_loss("rpush", key, "local fallback disabled");
            return Err(StorageError::Unavailable);
        };
        match local.rpush(key, items.to_vec()).await {
            Ok(_) => {
                self.note_fallback("rpush");
                Ok(())
            }
            Err(e) => {
                self.data_loss("rpush", key, &e.to_string());
                Err(e)
            }
        }
    }

    /// Pop up to `count` items, remote head first, then the local backlog.
    pub async fn lpop_many(&self, key: &str, count: usize) -> Result<Vec<Value>, StorageError> {
        if count == 0 {
            return Ok(Vec::new());
        }
        let mut out = Vec::with_capacity(count);
        let mut popped = 0;
        let mut answered = false;

        if let Some(Ok(raw)) = self.remote("lpop", |c| async move { c.lpop(key, count).await }).await {
            answered = true;
            popped = raw.len();
            out.extend(raw.iter().filter_map(|r| decode_remote(key, r)));
        }

        if popped < count {
            if let Some(local) = self.local() {
                match local.lpop(key, count - popped).await {
                    Ok(items) => {
                        if !items.is_empty() {
                            self.note_fallback("lpop");
                        }
                        out.extend(items);
                    }
                    Err(e) if !answered => return Err(e),
                    Err(e) => self.note_local_error("lpop", key, &e),
                }
            } else if !answered {
                return Err(StorageError::Unavailable);
            }
        }
        Ok(out)
    }

    pub async fn lpop(&self, key: &str) -> Result<Option<Value>, StorageError> {
        Ok(self.lpop_many(key, 1).await?.into_iter().next())
    }

    /// The item `lpop` would return next, without removing it.
    pub async fn lindex_head(&self, key: &str) -> Result<Option<Value>, StorageError> {
        let mut answered = false;
        match self.remote("lindex", |c| async move { c.lfront(key).await }).await {
            Some(Ok(Some(raw))) => {
                if let Some(value) = decode_remote(key, &raw) {
                    return Ok(Some(value));
                }
                answered = true;
            }
            Some(Ok(None)) => answered = true,
            _ => {}
        }
        match self.local() {
            Some(local) => match local.lfront(key).await {
                Ok(head) => Ok(head),
                Err(e) if !answered => Err(e),
                Err(e) => {
                    self.note_local_error("lindex", key, &e);
                    Ok(None)
                }
            },
            None if answered => Ok(None),
            None => Err(StorageError::Unavailable),
        }
    }

    /// Length of a list on each tier. `remote` is `None` when the remote
    /// tier did not answer, so callers can tell "empty" from "unknown".
    pub async fn llen_parts(&self, key: &str) -> Result<ListLength, StorageError> {
        let remote = match self.remote("llen", |c| async move { c.llen(key).await }).await {
            Some(Ok(len)) => Some(len),
            _ => None,
        };
        let local = match self.local() {
            Some(local) => match local.llen(key).await {
                Ok(len) => Some(len),
                Err(e) => {
                    self.note_local_error("llen", key, &e);
                    None
                }
            },
            None => None,
        };
        match (remote, local) {
            (None, None) => Err(StorageError::Unavailable),
            (remote, local) => Ok(ListLength { remote, local: local.unwrap_or(0) }),
        }
    }

    /// Combined length of the remote list and its local backlog. Fails
    /// unless the remote tier answered.
    pub async fn llen(&self, key: &str) -> Result<u64, StorageError> {
        let parts = self.llen_parts(key).await?;
        parts.total().ok_or(StorageError::Unavailable)
    }

    /// Fixed-window counter on whichever tier answers.
    pub async fn incr_with_expiry(&self, key: &str, window: Duration) -> Result<u64, StorageError> {
        if let Some(Ok(count)) = self.remote("incr", |c| async move { c.incr_with_expiry(key, window).await }).await {
            return Ok(count);
        }
        let local = self.local().ok_or(StorageError::Unavailable)?;
        let count = local.incr_with_expiry(key, window).await?;
        self.note_fallback("incr");
        Ok(count)
    }

    /// Union of matching keys on both tiers, sorted.
    pub async fn keys_with_prefix(&self, prefix: &str) -> Vec<String> {
        let mut keys = match self.remote("scan", |c| async move { c.scan_prefix(prefix).await }).await {
            Some(Ok(keys)) => keys,
            _ => Vec::new(),
        };
        if let Some(local) = self.local() {
            match local.keys_with_prefix(prefix).await {
                Ok(local_keys) => keys.extend(local_keys),
                Err(e) => self.note_local_error("scan", prefix, &e),
            }
        }
        keys.sort();
        keys.dedup();
        keys
    }

    /// Delete every key under `prefix` on both tiers. Returns how many went.
    pub async fn del_prefix(&self, prefix: &str) -> usize {
        let mut removed = 0;
        for key in self.keys_with_prefix(prefix).await {
            if self.del(&key).await {
                removed += 1;
            }
        }
        debug!(prefix, removed, "Prefix deleted");
        removed
    }
}

/// Per-tier list length from [`ConnectionManager::llen_parts`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListLength {
    pub remote: Option<u64>,
    pub local: u64,
}

impl ListLength {
    /// Both tiers combined, when the remote count is known.
    #[must_use]
    pub fn total(&self) -> Option<u64> {
        self.remote.map(|r| r + self.local)
    }
}

fn decode_remote(key: &str, raw: &str) -> Option<Value> {
    match serde_json::from_str(raw) {
        Ok(value) => Some(value),
        Err(e) => {
            metrics::record_corruption("remote");
            warn!(key, error = %e, "Malformed remote value treated as absent");
            None
        }
    }
}
