//! Sync Orchestrator.
//!
//! The only component that dispatches queued operations, and the single
//! source of truth for whether a drain is running.
//!
//! # Drain
//!
//! A drain walks the queue in drain order. Before each operation it checks
//! that the network is usable, that the operation's backoff has elapsed and
//! that the per-minute budget has room. Each dispatch then ends in one of:
//!
//! - **applied**: removed from the queue, cached reads invalidated
//! - **conflict**: resolved with the configured strategy, handed to the
//!   host hooks, removed, and counted as a success
//! - **transient failure**: retry count incremented and the next attempt
//!   scheduled from the backoff table; abandoned once the count is at the
//!   maximum. Losing the network also stops the drain.
//! - **permanent failure**: removed and, if configured, retained for
//!   inspection
//!
//! # Single flight
//!
//! At most one drain runs at a time. A caller arriving during a drain waits
//! for it and receives its outcome instead of starting another.
//!
//! # Storage failures
//!
//! A storage error stops the drain. The results settled before it are still
//! folded into the status, and every caller of that drain gets
//! [`SyncError::DrainInterrupted`] carrying those results and the error.

use crate::clock::{Clock, SystemClock};
use crate::config::HavenConfig;
use crate::conflict::ConflictResolver;
use crate::dispatch::{DispatchOutcome, DispatchRequest, MutationDispatcher};
use crate::error::{Result, SyncError};
use crate::failed::{FailedLedger, FailedOperation};
use crate::network::{NetworkMonitor, NetworkState};
use crate::observer::{ObserverList, SubscriptionId};
use crate::persist::blocking;
use crate::queue::{OperationPatch, PendingOperation, SyncQueue};
use crate::rate_limit::RateLimiter;
use crate::status::{NoopHooks, SyncHooks, SyncResult, SyncStatus};
use haven_store::{EncryptedStore, StorageKey};
use haven_types::{OperationId, OperationKind, Timestamp};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, warn};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Default)]
struct Flight {
    syncing: bool,
    last_results: Vec<SyncResult>,
    last_error: Option<Arc<SyncError>>,
    last_manual: Option<Instant>,
}

impl Flight {
    /// The outcome of the most recent drain.
    fn outcome(&self) -> Result<Vec<SyncResult>> {
        match &self.last_error {
            Some(source) => Err(SyncError::DrainInterrupted {
                completed: self.last_results.clone(),
                source: Arc::clone(source),
            }),
            None => Ok(self.last_results.clone()),
        }
    }
}

struct DrainReport {
    results: Vec<SyncResult>,
    error: Option<SyncError>,
}

enum Step {
    Continue(SyncResult),
    /// The network went away; stop scheduling further operations.
    Halt(SyncResult),
}

/// Drains the sync queue against the network.
pub struct SyncOrchestrator {
    config: Arc<HavenConfig>,
    store: Arc<EncryptedStore>,
    queue: SyncQueue,
    failed: FailedLedger,
    network: Arc<NetworkMonitor>,
    dispatcher: Arc<dyn MutationDispatcher>,
    resolver: ConflictResolver,
    hooks: Arc<dyn SyncHooks>,
    clock: Arc<dyn Clock>,
    limiter: Mutex<RateLimiter>,
    flight: Mutex<Flight>,
    drain_done: Notify,
    wake: Notify,
    status: Mutex<SyncStatus>,
    listeners: ObserverList<bool>,
    closing: AtomicBool,
}

/// Assembles a [`SyncOrchestrator`].
pub struct OrchestratorBuilder {
    config: Arc<HavenConfig>,
    store: Arc<EncryptedStore>,
    network: Arc<NetworkMonitor>,
    dispatcher: Arc<dyn MutationDispatcher>,
    hooks: Arc<dyn SyncHooks>,
    clock: Arc<dyn Clock>,
}

impl OrchestratorBuilder {
    pub fn hooks(mut self, hooks: Arc<dyn SyncHooks>) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Recovers the persisted queue, failed operations and last sync time.
    pub async fn build(self) -> Result<Arc<SyncOrchestrator>> {
        let queue = SyncQueue::open(
            Arc::clone(&self.store),
            Arc::clone(&self.config),
            Arc::clone(&self.clock),
        )
        .await?;
        let failed = FailedLedger::open(Arc::clone(&self.store)).await?;
        let last_sync_time = load_last_sync(&self.store).await?;

        Ok(Arc::new(SyncOrchestrator {
            resolver: ConflictResolver::new(self.config.conflict.clone()),
            limiter: Mutex::new(RateLimiter::new(&self.config.security.rate_limit)),
            config: self.config,
            store: self.store,
            queue,
            failed,
            network: self.network,
            dispatcher: self.dispatcher,
            hooks: self.hooks,
            clock: self.clock,
            flight: Mutex::new(Flight::default()),
            drain_done: Notify::new(),
            wake: Notify::new(),
            status: Mutex::new(SyncStatus {
                last_sync_time,
                ..SyncStatus::default()
            }),
            listeners: ObserverList::new(),
            closing: AtomicBool::new(false),
        }))
    }
}

async fn load_last_sync(store: &Arc<EncryptedStore>) -> Result<Option<Timestamp>> {
    blocking(store, |store| store.get_json::<Timestamp>(StorageKey::LastSync)).await
}

/// Resets the syncing flag and wakes waiters, even if the drain panicked.
struct FlightGuard<'a> {
    orchestrator: &'a SyncOrchestrator,
}

impl<'a> FlightGuard<'a> {
    fn begin(orchestrator: &'a SyncOrchestrator) -> Self {
        orchestrator.publish_syncing(true);
        Self { orchestrator }
    }
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        lock(&self.orchestrator.flight).syncing = false;
        self.orchestrator.publish_syncing(false);
        self.orchestrator.drain_done.notify_waiters();
    }
}

impl SyncOrchestrator {
    pub fn builder(
        config: Arc<HavenConfig>,
        store: Arc<EncryptedStore>,
        network: Arc<NetworkMonitor>,
        dispatcher: Arc<dyn MutationDispatcher>,
    ) -> OrchestratorBuilder {
        OrchestratorBuilder {
            config,
            store,
            network,
            dispatcher,
            hooks: Arc::new(NoopHooks),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn config(&self) -> &HavenConfig {
        &self.config
    }

    // ── Enqueue and queries ─────────────────────────────────────

    /// Queues a mutation for the next drain.
    pub async fn queue_operation(&self, kind: OperationKind, data: Value) -> Result<PendingOperation> {
        let op = self.queue.add_operation(kind, data).await?;
        self.wake.notify_one();
        Ok(op)
    }

    pub async fn pending_count(&self) -> usize {
        self.queue.pending_count().await
    }

    /// Queued operations in drain order.
    pub async fn pending_operations(&self) -> Vec<PendingOperation> {
        self.queue.get_sorted_queue().await
    }

    pub async fn status(&self) -> SyncStatus {
        let pending_count = self.queue.pending_count().await;
        let mut status = lock(&self.status).clone();
        status.pending_count = pending_count;
        status
    }

    pub fn is_syncing(&self) -> bool {
        lock(&self.flight).syncing
    }

    /// Registers a callback for every idle/syncing transition.
    pub fn on_sync_change<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(bool) + Send + Sync + 'static,
    {
        self.listeners.add(move |syncing: &bool| callback(*syncing))
    }

    pub fn remove_sync_listener(&self, id: SubscriptionId) -> bool {
        self.listeners.remove(id)
    }

    fn publish_syncing(&self, syncing: bool) {
        lock(&self.status).is_syncing = syncing;
        debug!("Sync state: {}", if syncing { "SYNCING" } else { "IDLE" });
        self.listeners.notify(&syncing);
    }

    fn network_usable(&self) -> bool {
        self.network
            .current_state()
            .is_usable(self.config.network.minimum_quality)
    }

    /// Whether the device has been offline longer than the configured
    /// offline timeout.
    pub fn offline_session_expired(&self) -> bool {
        self.network
            .offline_for()
            .is_some_and(|offline| offline > self.config.security.offline_timeout)
    }

    // ── Triggers ────────────────────────────────────────────────

    /// User-initiated sync.
    ///
    /// A call within the debounce window of the previous manual trigger
    /// returns the last results without draining again. A call during a
    /// drain waits for that drain.
    pub async fn manual_sync(&self) -> Result<Vec<SyncResult>> {
        {
            let mut flight = lock(&self.flight);
            let now = Instant::now();
            let debounce = self.config.sync.manual.debounce;
            if let Some(previous) = flight.last_manual
                && !flight.syncing
                && now.duration_since(previous) < debounce
            {
                debug!("Manual sync debounced");
                return flight.outcome();
            }
            flight.last_manual = Some(now);
        }
        self.sync_now().await
    }

    /// Drains now, or joins the drain already running.
    ///
    /// Joined callers receive the same outcome as the caller that started
    /// the drain, including [`SyncError::DrainInterrupted`].
    pub async fn sync_now(&self) -> Result<Vec<SyncResult>> {
        let running = {
            let mut flight = lock(&self.flight);
            if flight.syncing {
                Some(self.drain_done.notified())
            } else {
                flight.syncing = true;
                None
            }
        };
        if let Some(done) = running {
            debug!("Drain already running, joining it");
            done.await;
            return lock(&self.flight).outcome();
        }

        let _guard = FlightGuard::begin(self);
        let report = self.drain().await;
        let mut flight = lock(&self.flight);
        flight.last_results = report.results;
        flight.last_error = report.error.map(Arc::new);
        flight.outcome()
    }

    // ── Drain ───────────────────────────────────────────────────

    async fn drain(&self) -> DrainReport {
        let delays = &self.config.sync.retry_delays;
        let operations = self.queue.get_sorted_queue().await;
        info!("Draining {} pending operations", operations.len());

        let mut results = Vec::new();
        let mut error = None;
        for op in operations {
            if self.closing.load(Ordering::SeqCst) {
                info!("Shutting down, drain stopped");
                break;
            }
            if !self.network_usable() {
                info!("Network unavailable, drain paused");
                break;
            }
            // Skip anything removed since the snapshot was taken.
            let Some(op) = self.queue.get(op.id).await else {
                continue;
            };
            let now = self.clock.now();
            if !op.is_due(now, delays) {
                debug!(op_id = %op.id, retry_count = op.retry_count, "waiting out backoff");
                continue;
            }
            if !lock(&self.limiter).try_acquire(now) {
                warn!("{}, drain paused", SyncError::RateLimitExceeded);
                break;
            }

            match self.process(op).await {
                Ok(Step::Continue(result)) => results.push(result),
                Ok(Step::Halt(result)) => {
                    results.push(result);
                    info!("Network lost mid-drain, drain paused");
                    break;
                }
                Err(SyncError::OperationNotFound(id)) => {
                    debug!(op_id = %id, "operation left the queue during dispatch");
                }
                Err(e) => {
                    warn!(settled = results.len(), "drain interrupted: {}", e);
                    error = Some(e);
                    break;
                }
            }
        }

        if let Err(e) = self.finish_drain(&results).await {
            warn!("Failed to record last sync time: {}", e);
            error.get_or_insert(e);
        }
        DrainReport { results, error }
    }

    async fn process(&self, op: PendingOperation) -> Result<Step> {
        let Some(endpoint) = self.config.mutations.endpoint_for(op.kind) else {
            let err = SyncError::Configuration(format!("no endpoint configured for {}", op.kind));
            return self.abandon(op, err.to_string()).await.map(Step::Continue);
        };
        let path = match endpoint.resolve_path(&op.data) {
            Ok(path) => path,
            Err(err) => return self.abandon(op, err.to_string()).await.map(Step::Continue),
        };

        let request = DispatchRequest {
            id: op.id,
            kind: op.kind,
            method: endpoint.method,
            path,
            body: op.data.clone(),
        };
        debug!(op_id = %op.id, kind = %op.kind, retry_count = op.retry_count, "dispatching");

        let timeout = self.config.network.connection_timeout;
        let outcome = match tokio::time::timeout(timeout, self.dispatcher.dispatch(request)).await {
            Ok(Ok(outcome)) => Ok(outcome),
            Ok(Err(e)) => Err(SyncError::from(e)),
            Err(_) => Err(SyncError::Timeout),
        };

        match outcome {
            Ok(DispatchOutcome::Applied { .. }) => {
                self.queue.remove_operation(op.id).await?;
                self.hooks.invalidate(&endpoint.invalidates).await;
                info!(op_id = %op.id, kind = %op.kind, "operation synced");
                Ok(Step::Continue(SyncResult::succeeded(&op, self.clock.now())))
            }
            Ok(DispatchOutcome::Conflict { server }) => {
                let conflict = self
                    .resolver
                    .conflict_for(op.data.clone(), server, op.enqueued_at);
                let resolved = self.resolver.resolve_by_type(&conflict, op.kind);
                info!(
                    op_id = %op.id,
                    kind = %op.kind,
                    strategy = ?self.config.conflict.strategy_for(op.kind),
                    local_ts = conflict.local_timestamp.as_millis(),
                    server_ts = conflict.server_timestamp.as_millis(),
                    "{} and resolved",
                    SyncError::ConflictDetected
                );
                self.queue.remove_operation(op.id).await?;
                self.hooks.apply_resolved(&op, &resolved).await;
                self.hooks.invalidate(&endpoint.invalidates).await;
                Ok(Step::Continue(SyncResult::succeeded(&op, self.clock.now())))
            }
            Err(err) if err.is_transient() => {
                let network_lost = matches!(err, SyncError::NetworkUnavailable);
                let result = self.retry_or_abandon(op, err).await?;
                Ok(if network_lost {
                    Step::Halt(result)
                } else {
                    Step::Continue(result)
                })
            }
            Err(err) => self.abandon(op, err.to_string()).await.map(Step::Continue),
        }
    }

    async fn retry_or_abandon(&self, op: PendingOperation, err: SyncError) -> Result<SyncResult> {
        if op.retry_count >= self.config.sync.max_retry_attempts {
            let exceeded = SyncError::MaxRetriesExceeded {
                attempts: op.retry_count,
            };
            return self.abandon(op, format!("{exceeded}: {err}")).await;
        }

        self.queue.increment_retry_count(op.id).await?;
        let updated = self
            .queue
            .update_operation(
                op.id,
                OperationPatch {
                    last_error: Some(Some(err.to_string())),
                    ..OperationPatch::default()
                },
            )
            .await?;
        let delay = self.config.sync.retry_delay(updated.retry_count);
        warn!(
            op_id = %op.id,
            kind = %op.kind,
            retry_count = updated.retry_count,
            delay_ms = delay.as_millis() as u64,
            "dispatch failed, will retry: {}",
            err
        );
        Ok(SyncResult::failed(&op, err.to_string(), self.clock.now()))
    }

    /// Takes an operation out of the queue for good.
    async fn abandon(&self, op: PendingOperation, error: String) -> Result<SyncResult> {
        let now = self.clock.now();
        if self.config.sync.retain_failed {
            let mut operation = op.clone();
            operation.last_error = Some(error.clone());
            self.failed
                .push(
                    FailedOperation {
                        operation,
                        error: error.clone(),
                        failed_at: now,
                    },
                    self.config.sync.max_failed_operations,
                )
                .await?;
        }
        self.queue.remove_operation(op.id).await?;
        warn!(op_id = %op.id, kind = %op.kind, "operation failed permanently: {}", error);
        Ok(SyncResult::failed(&op, error, now))
    }

    /// Folds a drain's results into the status, then persists the sync time.
    async fn finish_drain(&self, results: &[SyncResult]) -> Result<()> {
        let synced = results.iter().filter(|r| r.success).count();
        let failed = results.len() - synced;
        let now = self.clock.now();

        {
            let mut status = lock(&self.status);
            if synced > 0 {
                status.last_sync_time = Some(now);
            }
            status.record_errors(results, self.config.sync.max_errors);
        }
        info!(synced, failed, "drain finished");

        if synced > 0 {
            blocking(&self.store, move |store| store.set_json(StorageKey::LastSync, &now)).await?;
        }
        Ok(())
    }

    // ── Failed operations ───────────────────────────────────────

    pub async fn failed_operations(&self) -> Vec<FailedOperation> {
        self.failed.list().await
    }

    /// Puts a failed operation back in the queue with a fresh retry budget.
    /// Its id, priority and enqueue time are kept.
    pub async fn retry_failed(&self, id: OperationId) -> Result<PendingOperation> {
        let entry = self.failed.get(id).await?;
        let mut op = entry.operation;
        op.retry_count = 0;
        op.last_attempt_at = None;
        op.last_error = None;

        self.queue.restore_operation(op.clone()).await?;
        self.failed.remove(id).await?;
        self.wake.notify_one();
        info!(op_id = %id, kind = %op.kind, "failed operation re-queued");
        Ok(op)
    }

    /// Returns whether the entry existed.
    pub async fn discard_failed(&self, id: OperationId) -> Result<bool> {
        self.failed.remove(id).await
    }

    // ── Session ─────────────────────────────────────────────────

    /// Purges the `clear_on_logout` keys and resyncs in-memory state with
    /// what is left in the store. Returns how many keys were removed.
    pub async fn logout(&self) -> Result<usize> {
        let keys = self.config.security.clear_on_logout.clone();
        let removed = blocking(&self.store, move |store| store.remove_items(&keys)).await?;

        self.queue.reload().await?;
        self.failed.reload().await?;
        let last_sync_time = load_last_sync(&self.store).await?;
        {
            let mut status = lock(&self.status);
            status.last_sync_time = last_sync_time;
            status.errors.clear();
        }
        {
            let mut flight = lock(&self.flight);
            flight.last_results.clear();
            flight.last_error = None;
        }

        info!(removed, "logout purge complete");
        Ok(removed)
    }

    // ── Background worker ───────────────────────────────────────

    /// Starts the background worker.
    ///
    /// It drains on the background interval (when enabled), when the
    /// network comes back with work queued, when the earliest backoff
    /// deadline passes, and after new operations are queued while online.
    /// Dropping the handle stops the worker.
    pub fn spawn_background(self: &Arc<Self>) -> BackgroundHandle {
        let (shutdown, shutdown_rx) = watch::channel(false);
        let network = self.network.watch();
        let worker = Arc::clone(self);
        let task = tokio::spawn(async move { worker.run_background(network, shutdown_rx).await });
        BackgroundHandle {
            orchestrator: Arc::clone(self),
            shutdown,
            task,
        }
    }

    async fn run_background(
        &self,
        mut network: watch::Receiver<NetworkState>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let background = &self.config.sync.background;
        let mut ticker = background.enabled.then(|| {
            let mut interval =
                tokio::time::interval_at(Instant::now() + background.interval, background.interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval
        });
        let minimum = self.config.network.minimum_quality;
        let mut was_online = network.borrow_and_update().is_usable(minimum);
        info!("Background sync started");

        loop {
            let retry_in = self.next_wakeup().await;
            let reason = tokio::select! {
                _ = shutdown.changed() => break,
                _ = next_tick(&mut ticker) => "interval",
                changed = network.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let online = network.borrow_and_update().is_usable(minimum);
                    let reconnected = online && !was_online;
                    was_online = online;
                    if !reconnected || self.queue.pending_count().await == 0 {
                        continue;
                    }
                    "reconnected"
                }
                _ = sleep_for(retry_in) => "retry due",
                _ = self.wake.notified() => "enqueued",
            };

            if !self.network_usable() {
                debug!("Skipping {} drain while offline", reason);
                continue;
            }
            match self.sync_now().await {
                Ok(results) => debug!("Background drain ({}) produced {} results", reason, results.len()),
                Err(e) => warn!("Background drain ({}) failed: {}", reason, e),
            }
        }
        info!("Background sync stopped");
    }

    /// Time until the earliest backoff deadline or rate-limit slot.
    async fn next_wakeup(&self) -> Option<Duration> {
        let operations = self.queue.get_queue().await;
        if operations.is_empty() {
            return None;
        }
        let now = self.clock.now();
        let delays = &self.config.sync.retry_delays;
        let slot = lock(&self.limiter).next_slot(now);
        operations
            .iter()
            .filter_map(|op| op.next_attempt_at(delays))
            .chain(slot)
            .filter(|due| *due > now)
            .min()
            .map(|due| due.saturating_duration_since(now))
    }
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn sleep_for(delay: Option<Duration>) {
    match delay {
        Some(delay) => tokio::time::sleep(delay).await,
        None => std::future::pending().await,
    }
}

/// Owns the background worker task.
pub struct BackgroundHandle {
    orchestrator: Arc<SyncOrchestrator>,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl BackgroundHandle {
    /// Stops scheduling drains and waits for the worker to exit. A drain in
    /// progress stops before its next operation.
    pub async fn shutdown(self) {
        self.orchestrator.closing.store(true, Ordering::SeqCst);
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            warn!("Background sync task failed: {}", e);
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}
