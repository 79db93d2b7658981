//! The sync coordinator.
//!
//! A sync cycle moves through three states:
//!
//! ```text
//! Idle --(online + trigger)--> Draining --(queue empty)--> Reconciling --> Idle
//! ```
//!
//! - **Draining** applies queued mutations to the remote tier in per-entity
//!   FIFO order (see [`OfflineQueue::drain`]).
//! - **Reconciling** compares every key touched since it was last reconciled
//!   against the remote tier and applies last-writer-wins (see
//!   [`crate::reconcile`]). Resolved keys leave the touched set; skipped ones
//!   stay for the next cycle.
//!
//! Only one cycle runs at a time. A trigger that arrives mid-cycle is
//! coalesced: the running cycle goes around once more instead of a second
//! cycle starting.
//!
//! Foreground writes reach the remote tier through
//! [`SyncCoordinator::push_or_enqueue`], which falls back to the queue
//! whenever the device is offline, the key already has queued work, or the
//! remote call fails.

use crate::{
    error::Result,
    queue::{OfflineQueue, OfflineQueueItem, QueueOperation},
    reconcile::{resolve, Resolution},
    remote::{with_single_retry, RemoteError, RemoteStore},
    storage::TieredStore,
    Clock, ConnectivityObserver, Error, Record, RecordKey,
};
use dashmap::DashMap;
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, MutexGuard, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Where the coordinator is in its cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum SyncState {
    Idle,
    Draining,
    Reconciling,
}

/// What started a sync cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum SyncTrigger {
    Startup,
    ConnectivityRestored,
    Interval,
    Manual,
}

/// Counts from the reconciling phase.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileReport {
    /// Local tier overwritten with a newer remote record
    pub pulled: usize,
    /// Remote tier overwritten with a newer local record
    pub pushed: usize,
    /// Timestamp ties with differing content (remote applied)
    pub ambiguous: usize,
    /// Keys left alone because they still have queued or dead-lettered work
    pub skipped: usize,
}

/// Outcome of [`SyncCoordinator::sync`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncReport {
    /// Queue items applied to the remote tier
    pub drained: usize,
    /// Queue items moved to the dead-letter list
    pub dead_lettered: usize,
    pub reconciled: ReconcileReport,
    /// Cycles run for this request; above one when later requests were
    /// folded into it
    pub cycles: usize,
    /// The request was folded into a cycle already running
    pub coalesced: bool,
    /// Non-fatal problems surfaced for operator tooling
    pub warnings: Vec<Error>,
}

/// Resets the published state to `Idle` however a cycle ends.
struct IdleOnDrop<'a>(&'a watch::Sender<SyncState>);

impl Drop for IdleOnDrop<'_> {
    fn drop(&mut self) {
        self.0.send_replace(SyncState::Idle);
    }
}

/// Drives the offline queue and reconciliation against the remote tier.
pub struct SyncCoordinator {
    store: Arc<TieredStore>,
    remote: Arc<dyn RemoteStore>,
    queue: Arc<OfflineQueue>,
    connectivity: Arc<dyn ConnectivityObserver>,
    clock: Arc<dyn Clock>,
    retry_delay: Duration,
    state: watch::Sender<SyncState>,
    cycle: Mutex<()>,
    pending: AtomicBool,
    touched: parking_lot::Mutex<BTreeSet<RecordKey>>,
    key_locks: DashMap<RecordKey, Arc<Mutex<()>>>,
    shutdown: watch::Sender<bool>,
}

impl std::fmt::Debug for SyncCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncCoordinator")
            .field("state", &self.state())
            .field("queue", &self.queue)
            .finish_non_exhaustive()
    }
}

impl SyncCoordinator {
    pub fn new(
        store: Arc<TieredStore>,
        remote: Arc<dyn RemoteStore>,
        queue: Arc<OfflineQueue>,
        connectivity: Arc<dyn ConnectivityObserver>,
        clock: Arc<dyn Clock>,
        retry_delay: Duration,
    ) -> Self {
        let (state, _) = watch::channel(SyncState::Idle);
        let (shutdown, _) = watch::channel(false);
        Self {
            store,
            remote,
            queue,
            connectivity,
            clock,
            retry_delay,
            state,
            cycle: Mutex::new(()),
            pending: AtomicBool::new(false),
            touched: parking_lot::Mutex::new(BTreeSet::new()),
            key_locks: DashMap::new(),
            shutdown,
        }
    }

    pub fn state(&self) -> SyncState {
        *self.state.borrow()
    }

    /// Receiver for state transitions.
    pub fn watch_state(&self) -> watch::Receiver<SyncState> {
        self.state.subscribe()
    }

    pub fn is_online(&self) -> bool {
        self.connectivity.is_online()
    }

    pub fn queue(&self) -> &OfflineQueue {
        &self.queue
    }

    /// Include `key` in the next reconciliation.
    pub fn touch(&self, key: RecordKey) {
        self.touched.lock().insert(key);
    }

    /// Serialize work on one key. Writes to the same entity hold this across
    /// the local write and the remote pass-through so they reach the remote
    /// tier in call order.
    pub async fn lock_key(&self, key: &RecordKey) -> OwnedMutexGuard<()> {
        let lock = self.key_locks.entry(key.clone()).or_default().clone();
        lock.lock_owned().await
    }

    /// Send one mutation to the remote tier, or queue it.
    ///
    /// Returns the stored remote record when a save went straight through.
    /// Connectivity problems are never returned as errors; only a failure to
    /// persist the queue item is. Callers hold [`SyncCoordinator::lock_key`].
    pub async fn push_or_enqueue(&self, item: OfflineQueueItem) -> Result<Option<Record>> {
        let key = item.key();
        self.touch(key.clone());

        if !self.is_online() {
            debug!(%key, "offline, queueing");
            self.queue.enqueue(item)?;
            return Ok(None);
        }
        if self.queue.has_pending(&key)? {
            debug!(%key, "earlier mutations queued, queueing behind them");
            self.queue.enqueue(item)?;
            return Ok(None);
        }

        match self.apply_remote(&item).await {
            Ok(stored) => {
                if let Some(stored) = &stored {
                    self.adopt_server_copy(stored)?;
                }
                Ok(stored)
            }
            Err(err) => {
                let remote_err = Error::RemoteUnreachable(err.to_string());
                warn!(%key, error = %remote_err, "remote write failed, queueing");
                let mut item = item;
                item.last_error = Some(err.to_string());
                self.queue.enqueue(item)?;
                Ok(None)
            }
        }
    }

    /// Run a sync cycle, or fold the request into the one already running.
    pub async fn sync(&self, trigger: SyncTrigger) -> Result<SyncReport> {
        let mut report = SyncReport::default();
        loop {
            let guard = match self.cycle.try_lock() {
                Ok(guard) => guard,
                Err(_) => {
                    self.pending.store(true, Ordering::SeqCst);
                    // The running cycle may have finished in between.
                    match self.cycle.try_lock() {
                        Ok(guard) => guard,
                        Err(_) => {
                            debug!(?trigger, "sync already running, coalesced");
                            report.coalesced = true;
                            return Ok(report);
                        }
                    }
                }
            };

            self.pending.store(false, Ordering::SeqCst);
            let cycle = self.run_cycle(trigger, &mut report).await;
            self.prune_key_locks();
            drop(guard);
            cycle?;

            if !self.pending.swap(false, Ordering::SeqCst) {
                break;
            }
        }
        Ok(report)
    }

    /// Wait for any running cycle, then run a full cycle.
    pub async fn sync_and_wait(&self, trigger: SyncTrigger) -> Result<SyncReport> {
        let _guard = self.cycle.lock().await;
        self.pending.store(false, Ordering::SeqCst);
        let mut report = SyncReport::default();
        let cycle = self.run_cycle(trigger, &mut report).await;
        self.prune_key_locks();
        cycle?;
        Ok(report)
    }

    /// Hold off sync cycles while the returned guard lives.
    pub async fn exclusive(&self) -> MutexGuard<'_, ()> {
        self.cycle.lock().await
    }

    /// Start the background loop: sync on startup, whenever connectivity is
    /// restored, and every `every`, until [`SyncCoordinator::shutdown`].
    pub fn spawn(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let this = Arc::clone(self);
        let mut online = this.connectivity.watch();
        let mut shutdown = this.shutdown.subscribe();

        tokio::spawn(async move {
            info!(interval_secs = every.as_secs(), "sync loop started");
            this.run_logged(SyncTrigger::Startup).await;

            let mut ticker = interval_at(Instant::now() + every, every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    Ok(()) = online.changed() => {
                        let is_online = *online.borrow_and_update();
                        if is_online {
                            info!("connectivity restored");
                            this.run_logged(SyncTrigger::ConnectivityRestored).await;
                        }
                    }
                    _ = ticker.tick() => {
                        this.run_logged(SyncTrigger::Interval).await;
                    }
                    _ = shutdown.changed() => {
                        break;
                    }
                }
            }

            info!("sync loop stopped");
        })
    }

    /// Stop the background loop and interrupt any drain in progress.
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    fn is_shut_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    async fn run_logged(&self, trigger: SyncTrigger) {
        if !self.is_online() {
            return;
        }
        match self.sync(trigger).await {
            Ok(report) if !report.coalesced => {
                debug!(
                    ?trigger,
                    drained = report.drained,
                    pulled = report.reconciled.pulled,
                    pushed = report.reconciled.pushed,
                    "sync finished"
                );
            }
            Ok(_) => {}
            Err(err) => warn!(?trigger, error = %err, "sync failed"),
        }
    }

    async fn run_cycle(&self, trigger: SyncTrigger, report: &mut SyncReport) -> Result<()> {
        if !self.is_online() || self.is_shut_down() {
            debug!(?trigger, "offline, sync skipped");
            return Ok(());
        }

        let _idle = IdleOnDrop(&self.state);
        report.cycles += 1;
        self.state.send_replace(SyncState::Draining);
        debug!(?trigger, pending = self.queue.len(), "draining");

        let drained = self
            .queue
            .drain(
                |item| async move { self.apply_remote(&item).await },
                || self.is_online() && !self.is_shut_down(),
            )
            .await?;

        report.drained += drained.applied;
        report.dead_lettered += drained.dead_lettered.len();
        for item in &drained.dead_lettered {
            report.warnings.push(Error::QueueRetryExhausted {
                id: item.id.clone(),
                retries: item.retry_count,
            });
        }
        for key in drained.touched {
            self.touch(key);
        }
        for stored in &drained.synced {
            let _lock = self.lock_key(&stored.key()).await;
            self.adopt_server_copy(stored)?;
        }

        if drained.remaining > 0 {
            debug!(remaining = drained.remaining, "drain interrupted, reconcile deferred");
            return Ok(());
        }

        self.state.send_replace(SyncState::Reconciling);
        self.reconcile(report).await
    }

    async fn reconcile(&self, report: &mut SyncReport) -> Result<()> {
        let keys: Vec<RecordKey> = self.touched.lock().iter().cloned().collect();

        for key in keys {
            if !self.is_online() || self.is_shut_down() {
                break;
            }
            let _lock = self.lock_key(&key).await;
            if self.queue.has_pending(&key)? {
                report.reconciled.skipped += 1;
                continue;
            }

            let local = self.store.get(&key)?;
            let remote = match with_single_retry("fetch", self.retry_delay, || {
                self.remote.fetch(&key)
            })
            .await
            {
                Ok(remote) => remote,
                Err(err) if err.is_transient() => {
                    debug!(%key, error = %err, "remote unreachable, reconcile stopped");
                    break;
                }
                Err(err) => {
                    warn!(%key, error = %err, "remote fetch failed, key skipped");
                    report.reconciled.skipped += 1;
                    continue;
                }
            };

            let resolved = match resolve(local.as_ref(), remote.as_ref()) {
                Resolution::InSync => true,
                Resolution::PullRemote(record) => {
                    if self.adopt_remote(&record) {
                        report.reconciled.pulled += 1;
                    }
                    true
                }
                Resolution::PushLocal(record) => {
                    let pushed = with_single_retry("upsert", self.retry_delay, || {
                        self.remote.upsert(&record)
                    })
                    .await;
                    match pushed {
                        Ok(stored) => {
                            self.store.put(&stored)?;
                            report.reconciled.pushed += 1;
                            true
                        }
                        Err(err) => {
                            debug!(%key, error = %err, "push failed, queueing");
                            self.queue
                                .enqueue(OfflineQueueItem::save(record, self.clock.now_millis()))?;
                            false
                        }
                    }
                }
                Resolution::Ambiguous { remote, .. } => {
                    let ambiguous = Error::ConflictResolutionAmbiguous(key.to_string());
                    warn!(%key, "{ambiguous}, remote record applied");
                    if self.adopt_remote(&remote) {
                        report.reconciled.ambiguous += 1;
                    }
                    report.warnings.push(ambiguous);
                    true
                }
            };

            if resolved {
                self.touched.lock().remove(&key);
            }
        }

        Ok(())
    }

    /// Drop per-key locks nobody holds or waits on.
    fn prune_key_locks(&self) {
        self.key_locks.retain(|_, lock| Arc::strong_count(lock) > 1);
    }

    /// Apply one mutation to the remote tier with a single retry.
    async fn apply_remote(
        &self,
        item: &OfflineQueueItem,
    ) -> std::result::Result<Option<Record>, RemoteError> {
        let key = item.key();
        match item.operation {
            QueueOperation::Save => {
                let record = item.record.as_ref().ok_or_else(|| {
                    RemoteError::Decode(format!("queued save of {key} carries no record"))
                })?;
                let stored = with_single_retry("upsert", self.retry_delay, || {
                    self.remote.upsert(record)
                })
                .await?;
                Ok(Some(stored))
            }
            QueueOperation::Delete => {
                with_single_retry("remove", self.retry_delay, || self.remote.remove(&key))
                    .await?;
                Ok(None)
            }
        }
    }

    /// Take the server's timestamp for a record the local tier still holds
    /// unchanged.
    fn adopt_server_copy(&self, stored: &Record) -> Result<()> {
        if let Some(current) = self.store.get(&stored.key())? {
            if current.same_content(stored) && current.updated_at != stored.updated_at {
                self.store.put(stored)?;
            }
        }
        Ok(())
    }

    /// Write a remote record locally. Records that fail validation are left
    /// out with a warning.
    fn adopt_remote(&self, record: &Record) -> bool {
        match self.store.put(record) {
            Ok(()) => true,
            Err(err) => {
                warn!(key = %record.key(), error = %err, "remote record not applied");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload::{LearningProgress, Payload};
    use crate::{ManualClock, ManualConnectivity, MemoryRemote};

    struct Harness {
        clock: Arc<ManualClock>,
        remote: Arc<MemoryRemote>,
        connectivity: Arc<ManualConnectivity>,
        store: Arc<TieredStore>,
        sync: Arc<SyncCoordinator>,
    }

    fn harness(online: bool) -> Harness {
        let clock = Arc::new(ManualClock::new(1_000));
        let remote = Arc::new(MemoryRemote::with_clock(clock.clone()));
        let connectivity = Arc::new(ManualConnectivity::new(online));
        let store = Arc::new(TieredStore::open(None));
        let queue = Arc::new(OfflineQueue::load(store.clone(), clock.clone(), 3).unwrap());
        let sync = Arc::new(SyncCoordinator::new(
            store.clone(),
            remote.clone(),
            queue,
            connectivity.clone(),
            clock.clone(),
            Duration::from_millis(1),
        ));
        Harness {
            clock,
            remote,
            connectivity,
            store,
            sync,
        }
    }

    fn progress(id: &str, xp: u64, updated_at: u64) -> Record {
        let mut payload = LearningProgress::new("es");
        payload.xp = xp;
        Record::new(id, "learner-1", Payload::Progress(payload), updated_at)
    }

    #[tokio::test]
    async fn online_write_goes_straight_through() {
        let h = harness(true);
        let record = progress("p-1", 10, 1_000);
        h.store.put(&record).unwrap();
        h.clock.set(2_000);

        let stored = h
            .sync
            .push_or_enqueue(OfflineQueueItem::save(record.clone(), 1_000))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(stored.updated_at, 2_000);
        assert!(h.sync.queue().is_empty());
        // local tier adopted the server timestamp
        assert_eq!(h.store.get(&record.key()).unwrap().unwrap().updated_at, 2_000);
    }

    #[tokio::test]
    async fn offline_write_is_queued() {
        let h = harness(false);
        let record = progress("p-1", 10, 1_000);

        let stored = h
            .sync
            .push_or_enqueue(OfflineQueueItem::save(record, 1_000))
            .await
            .unwrap();

        assert_eq!(stored, None);
        assert_eq!(h.sync.queue().len(), 1);
        assert!(h.remote.documents().is_empty());
    }

    #[tokio::test]
    async fn unreachable_remote_is_absorbed() {
        let h = harness(true);
        h.remote.set_reachable(false);

        let result = h
            .sync
            .push_or_enqueue(OfflineQueueItem::save(progress("p-1", 1, 1_000), 1_000))
            .await;

        assert!(matches!(result, Ok(None)));
        let items = h.sync.queue().items();
        assert_eq!(items.len(), 1);
        assert!(items[0].last_error.is_some());
    }

    #[tokio::test]
    async fn queued_key_is_not_overtaken() {
        let h = harness(false);
        h.sync
            .push_or_enqueue(OfflineQueueItem::save(progress("p-1", 1, 1_000), 1_000))
            .await
            .unwrap();

        h.connectivity.set_online(true);
        h.sync
            .push_or_enqueue(OfflineQueueItem::save(progress("p-1", 2, 1_001), 1_001))
            .await
            .unwrap();

        assert_eq!(h.sync.queue().len(), 2);
        assert!(h.remote.documents().is_empty());
    }

    #[tokio::test]
    async fn sync_drains_then_reconciles() {
        let h = harness(false);
        let record = progress("p-1", 7, 1_000);
        h.store.put(&record).unwrap();
        h.sync
            .push_or_enqueue(OfflineQueueItem::save(record.clone(), 1_000))
            .await
            .unwrap();

        h.connectivity.set_online(true);
        h.clock.set(5_000);
        let report = h.sync.sync(SyncTrigger::Manual).await.unwrap();

        assert_eq!(report.drained, 1);
        assert_eq!(report.reconciled, ReconcileReport::default());
        assert_eq!(h.sync.state(), SyncState::Idle);

        let remote = h.remote.document(&record.key()).unwrap();
        assert_eq!(remote.updated_at, 5_000);
        assert_eq!(h.store.get(&record.key()).unwrap(), Some(remote));
    }

    #[tokio::test]
    async fn offline_sync_does_nothing() {
        let h = harness(false);
        h.sync
            .push_or_enqueue(OfflineQueueItem::save(progress("p-1", 1, 1_000), 1_000))
            .await
            .unwrap();

        let report = h.sync.sync(SyncTrigger::Manual).await.unwrap();
        assert_eq!(report, SyncReport::default());
        assert_eq!(h.sync.queue().len(), 1);
    }

    #[tokio::test]
    async fn newer_remote_is_pulled() {
        let h = harness(true);
        let local = progress("p-1", 1, 1_000);
        h.store.put(&local).unwrap();
        h.sync.touch(local.key());

        let newer = progress("p-1", 50, 3_000);
        h.remote.seed(newer.clone());

        let report = h.sync.sync(SyncTrigger::Manual).await.unwrap();
        assert_eq!(report.reconciled.pulled, 1);
        assert_eq!(h.store.get(&local.key()).unwrap(), Some(newer));
    }

    #[tokio::test]
    async fn newer_local_is_pushed() {
        let h = harness(true);
        h.remote.seed(progress("p-1", 1, 1_000));
        let local = progress("p-1", 50, 3_000);
        h.store.put(&local).unwrap();
        h.sync.touch(local.key());
        h.clock.set(4_000);

        let report = h.sync.sync(SyncTrigger::Manual).await.unwrap();
        assert_eq!(report.reconciled.pushed, 1);

        let remote = h.remote.document(&local.key()).unwrap();
        assert!(remote.same_content(&local));
        assert_eq!(h.store.get(&local.key()).unwrap(), Some(remote));
    }

    #[tokio::test]
    async fn tie_with_different_content_prefers_remote() {
        let h = harness(true);
        let local = progress("p-1", 1, 2_000);
        let remote = progress("p-1", 2, 2_000);
        h.store.put(&local).unwrap();
        h.remote.seed(remote.clone());
        h.sync.touch(local.key());

        let report = h.sync.sync(SyncTrigger::Manual).await.unwrap();
        assert_eq!(report.reconciled.ambiguous, 1);
        assert!(matches!(
            report.warnings.as_slice(),
            [Error::ConflictResolutionAmbiguous(_)]
        ));
        assert_eq!(h.store.get(&local.key()).unwrap(), Some(remote));
    }

    #[tokio::test]
    async fn keys_with_dead_letters_are_not_reconciled() {
        let h = harness(true);
        let local = progress("p-1", 1, 1_000);
        h.store.put(&local).unwrap();
        h.remote.reject(local.key());
        h.sync
            .push_or_enqueue(OfflineQueueItem::save(local.clone(), 1_000))
            .await
            .unwrap();

        let report = h.sync.sync(SyncTrigger::Manual).await.unwrap();
        assert_eq!(report.dead_lettered, 1);
        assert_eq!(report.reconciled.skipped, 1);
        assert!(matches!(
            report.warnings.as_slice(),
            [Error::QueueRetryExhausted { retries: 4, .. }]
        ));
        assert_eq!(h.store.get(&local.key()).unwrap(), Some(local));
    }

    #[tokio::test]
    async fn state_moves_through_cycle() {
        let h = harness(true);
        let mut states = h.sync.watch_state();
        let record = progress("p-1", 1, 1_000);
        h.store.put(&record).unwrap();
        h.sync.touch(record.key());

        let seen = tokio::spawn(async move {
            let mut seen = Vec::new();
            while states.changed().await.is_ok() {
                let state = *states.borrow_and_update();
                seen.push(state);
                if state == SyncState::Idle {
                    break;
                }
            }
            seen
        });

        h.sync.sync(SyncTrigger::Manual).await.unwrap();
        let seen = seen.await.unwrap();
        assert_eq!(seen.last(), Some(&SyncState::Idle));
        assert!(!seen.is_empty());
    }

    #[tokio::test]
    async fn reconciled_keys_leave_the_touched_set() {
        let h = harness(true);
        let synced = progress("p-1", 1, 1_000);
        h.store.put(&synced).unwrap();
        h.sync.touch(synced.key());

        let blocked = progress("p-2", 1, 1_000);
        h.store.put(&blocked).unwrap();
        h.remote.reject(blocked.key());
        h.sync
            .push_or_enqueue(OfflineQueueItem::save(blocked.clone(), 1_000))
            .await
            .unwrap();

        let report = h.sync.sync(SyncTrigger::Manual).await.unwrap();
        assert_eq!(report.reconciled.pushed, 1);
        assert_eq!(report.reconciled.skipped, 1);

        let touched: Vec<RecordKey> = h.sync.touched.lock().iter().cloned().collect();
        assert_eq!(touched, vec![blocked.key()]);
        assert!(h.sync.key_locks.is_empty());

        // A later cycle only looks at what is still outstanding.
        let report = h.sync.sync(SyncTrigger::Interval).await.unwrap();
        assert_eq!(report.reconciled.pushed, 0);
        assert_eq!(report.reconciled.skipped, 1);
    }

    /// Remote whose first upsert waits until the test releases it.
    struct GatedRemote {
        inner: MemoryRemote,
        hold: AtomicBool,
        entered: tokio::sync::Notify,
        release: tokio::sync::Notify,
    }

    #[async_trait::async_trait]
    impl RemoteStore for GatedRemote {
        async fn fetch(&self, key: &RecordKey) -> std::result::Result<Option<Record>, RemoteError> {
            self.inner.fetch(key).await
        }

        async fn upsert(&self, record: &Record) -> std::result::Result<Record, RemoteError> {
            if self.hold.swap(false, Ordering::SeqCst) {
                self.entered.notify_one();
                self.release.notified().await;
            }
            self.inner.upsert(record).await
        }

        async fn remove(&self, key: &RecordKey) -> std::result::Result<(), RemoteError> {
            self.inner.remove(key).await
        }

        async fn remove_all(
            &self,
            kind: crate::EntityKind,
            owner_id: &str,
        ) -> std::result::Result<usize, RemoteError> {
            self.inner.remove_all(kind, owner_id).await
        }

        fn subscribe(&self, key: RecordKey, callback: crate::RemoteCallback) -> crate::Subscription {
            self.inner.subscribe(key, callback)
        }

        async fn ping(&self) -> std::result::Result<(), RemoteError> {
            self.inner.ping().await
        }
    }

    #[tokio::test]
    async fn request_during_cycle_is_coalesced() {
        let clock = Arc::new(ManualClock::new(1_000));
        let remote = Arc::new(GatedRemote {
            inner: MemoryRemote::with_clock(clock.clone()),
            hold: AtomicBool::new(true),
            entered: tokio::sync::Notify::new(),
            release: tokio::sync::Notify::new(),
        });
        let connectivity = Arc::new(ManualConnectivity::new(false));
        let store = Arc::new(TieredStore::open(None));
        let queue = Arc::new(OfflineQueue::load(store.clone(), clock.clone(), 3).unwrap());
        let sync = Arc::new(SyncCoordinator::new(
            store.clone(),
            remote.clone(),
            queue,
            connectivity.clone(),
            clock,
            Duration::from_millis(1),
        ));

        let record = progress("p-1", 4, 1_000);
        store.put(&record).unwrap();
        sync.push_or_enqueue(OfflineQueueItem::save(record.clone(), 1_000))
            .await
            .unwrap();
        connectivity.set_online(true);

        let first = tokio::spawn({
            let sync = sync.clone();
            async move { sync.sync(SyncTrigger::Manual).await }
        });
        remote.entered.notified().await;
        assert_eq!(sync.state(), SyncState::Draining);

        let second = sync.sync(SyncTrigger::Manual).await.unwrap();
        assert!(second.coalesced);
        assert_eq!(second.cycles, 0);
        assert!(sync.cycle.try_lock().is_err());

        remote.release.notify_one();
        let first = first.await.unwrap().unwrap();
        assert!(!first.coalesced);
        assert_eq!(first.cycles, 2);
        assert_eq!(first.drained, 1);
        assert_eq!(sync.state(), SyncState::Idle);
        assert!(remote.inner.document(&record.key()).is_some());
    }

    #[tokio::test]
    async fn background_loop_syncs_when_connectivity_returns() {
        let h = harness(false);
        let record = progress("p-1", 3, 1_000);
        h.store.put(&record).unwrap();
        h.sync
            .push_or_enqueue(OfflineQueueItem::save(record.clone(), 1_000))
            .await
            .unwrap();

        let handle = h.sync.spawn(Duration::from_secs(3600));
        h.connectivity.set_online(true);

        for _ in 0..200 {
            if h.sync.queue().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(h.sync.queue().is_empty());
        assert!(h.remote.document(&record.key()).is_some());

        h.sync.shutdown();
        handle.await.unwrap();
    }
}
