//! The public engine facade.
//!
//! [`SyncEngine`] owns every tier and collaborator and exposes the operations
//! the app calls. It must be initialized before use: initialization opens the
//! device tiers, runs schema migrations, loads the offline queue and starts
//! background sync.

use crate::{
    backup::{BackupManager, BackupSnapshot, RestoreSummary},
    error::Result,
    queue::{OfflineQueue, OfflineQueueItem},
    reconcile::{resolve, Resolution},
    remote::{with_single_retry, HttpRemote, RemoteStore, Subscription},
    schema::{MigrationResult, SchemaMigrator},
    storage::TieredStore,
    sync::{SyncCoordinator, SyncReport, SyncState, SyncTrigger},
    Clock, ConnectivityObserver, EngineConfig, EntityKind, Error, Payload, ProbeConnectivity,
    Record, RecordKey, SystemClock, Version,
};
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Builder for [`SyncEngine`].
pub struct SyncEngineBuilder {
    config: EngineConfig,
    remote: Arc<dyn RemoteStore>,
    clock: Option<Arc<dyn Clock>>,
    connectivity: Option<Arc<dyn ConnectivityObserver>>,
    migrator: Option<SchemaMigrator>,
}

impl SyncEngineBuilder {
    /// Time source (defaults to the system clock).
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Connectivity source (defaults to probing the remote tier).
    pub fn connectivity(mut self, connectivity: Arc<dyn ConnectivityObserver>) -> Self {
        self.connectivity = Some(connectivity);
        self
    }

    /// Migration steps (defaults to the built-in steps).
    pub fn migrator(mut self, migrator: SchemaMigrator) -> Self {
        self.migrator = Some(migrator);
        self
    }

    pub fn build(self) -> SyncEngine {
        SyncEngine {
            config: self.config,
            remote: self.remote,
            clock: self.clock.unwrap_or_else(|| Arc::new(SystemClock)),
            connectivity: self.connectivity,
            migrator: self.migrator.unwrap_or_else(SchemaMigrator::builtin),
            state: RwLock::new(EngineState::Uninitialized),
            init_lock: tokio::sync::Mutex::new(()),
        }
    }
}

/// Everything that exists once initialization succeeded.
struct Ready {
    store: Arc<TieredStore>,
    queue: Arc<OfflineQueue>,
    sync: Arc<SyncCoordinator>,
    backups: BackupManager,
    background: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

enum EngineState {
    Uninitialized,
    /// Migration failed: reads are served, writes are refused
    Blocked {
        store: Arc<TieredStore>,
        error: Error,
    },
    Ready(Arc<Ready>),
}

/// The data synchronization and migration engine.
pub struct SyncEngine {
    config: EngineConfig,
    remote: Arc<dyn RemoteStore>,
    clock: Arc<dyn Clock>,
    connectivity: Option<Arc<dyn ConnectivityObserver>>,
    migrator: SchemaMigrator,
    state: RwLock<EngineState>,
    init_lock: tokio::sync::Mutex<()>,
}

impl std::fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match &*self.state.read() {
            EngineState::Uninitialized => "uninitialized",
            EngineState::Blocked { .. } => "blocked",
            EngineState::Ready(_) => "ready",
        };
        f.debug_struct("SyncEngine")
            .field("config", &self.config)
            .field("state", &state)
            .finish_non_exhaustive()
    }
}

impl SyncEngine {
    pub fn builder(config: EngineConfig, remote: Arc<dyn RemoteStore>) -> SyncEngineBuilder {
        SyncEngineBuilder {
            config,
            remote,
            clock: None,
            connectivity: None,
            migrator: None,
        }
    }

    /// An engine talking to the document service at `config.remote_url`.
    pub fn http(config: EngineConfig) -> Result<Self> {
        let url = config
            .remote_url
            .clone()
            .ok_or_else(|| Error::Config("TANDEM_REMOTE_URL is not set".into()))?;
        let remote = Arc::new(HttpRemote::new(url, config.auth_token.clone())?);
        Ok(Self::builder(config, remote).build())
    }

    /// Open the tiers, migrate, load the queue and start background sync.
    ///
    /// Calling it again after success is a no-op. A failed migration leaves
    /// the engine blocked: the error is returned here and from every write.
    pub async fn initialize(&self) -> Result<MigrationResult> {
        let _init = self.init_lock.lock().await;
        if let EngineState::Ready(_) = &*self.state.read() {
            return Ok(MigrationResult::default());
        }

        let store = Arc::new(TieredStore::open(self.config.db_path.as_deref()));
        if store.is_degraded() {
            warn!(
                "{}, continuing cache-only",
                Error::StorageUnavailable("embedded store could not be opened".into())
            );
        }

        let target = self.migrator.latest_version();
        let migration = self.migrator.migrate(&store, self.clock.as_ref(), target);
        for warning in &migration.warnings {
            warn!(%warning, "migration warning");
        }
        if let Some(error) = migration.errors.first().cloned() {
            warn!(error = %error, "startup stopped by failed migration");
            *self.state.write() = EngineState::Blocked {
                store,
                error: error.clone(),
            };
            return Err(error);
        }

        let queue = Arc::new(OfflineQueue::load(
            store.clone(),
            self.clock.clone(),
            self.config.retry_cap,
        )?);

        let connectivity = match &self.connectivity {
            Some(connectivity) => connectivity.clone(),
            None => Arc::new(ProbeConnectivity::spawn(
                self.remote.clone(),
                self.config.probe_interval,
            )),
        };

        let sync = Arc::new(SyncCoordinator::new(
            store.clone(),
            self.remote.clone(),
            queue.clone(),
            connectivity,
            self.clock.clone(),
            self.config.remote_retry_delay,
        ));
        let background = sync.spawn(self.config.sync_interval);

        info!(
            schema_version = migration.to_version,
            records_migrated = migration.records_migrated,
            pending = queue.len(),
            degraded = store.is_degraded(),
            "engine initialized"
        );

        *self.state.write() = EngineState::Ready(Arc::new(Ready {
            backups: BackupManager::new(store.clone(), self.clock.clone()),
            store,
            queue,
            sync,
            background: parking_lot::Mutex::new(Some(background)),
        }));

        Ok(migration)
    }

    fn ready(&self) -> Result<Arc<Ready>> {
        match &*self.state.read() {
            EngineState::Uninitialized => Err(Error::NotInitialized),
            EngineState::Blocked { error, .. } => Err(error.clone()),
            EngineState::Ready(ready) => Ok(ready.clone()),
        }
    }

    fn readable(&self) -> Result<Arc<TieredStore>> {
        match &*self.state.read() {
            EngineState::Uninitialized => Err(Error::NotInitialized),
            EngineState::Blocked { store, .. } => Ok(store.clone()),
            EngineState::Ready(ready) => Ok(ready.store.clone()),
        }
    }

    /// Save an entity, returning the record as stored.
    ///
    /// The write lands in the Local and Cache tiers before this returns. It
    /// then goes straight to the remote tier when possible (the returned
    /// record then carries the server timestamp) and is queued otherwise.
    /// Connectivity never makes a save fail.
    pub async fn save(
        &self,
        kind: EntityKind,
        id: impl Into<String>,
        owner_id: impl Into<String>,
        payload: Payload,
    ) -> Result<Record> {
        let ready = self.ready()?;
        if payload.kind() != kind {
            return Err(Error::KindMismatch {
                record: kind,
                payload: payload.kind(),
            });
        }

        let now = self.clock.now_millis();
        let record = Record::new(id, owner_id, payload, now);
        record.validate()?;

        let _lock = ready.sync.lock_key(&record.key()).await;
        ready.store.put(&record)?;
        let stored = ready
            .sync
            .push_or_enqueue(OfflineQueueItem::save(record.clone(), now))
            .await?;

        Ok(stored.unwrap_or(record))
    }

    /// Read an entity from the Local tier, falling back to the Cache.
    pub fn get(&self, kind: EntityKind, id: &str) -> Result<Option<Record>> {
        self.readable()?.get(&RecordKey::new(kind, id))
    }

    /// Delete an entity everywhere.
    pub async fn delete(&self, kind: EntityKind, id: &str) -> Result<()> {
        let ready = self.ready()?;
        let key = RecordKey::new(kind, id);

        let _lock = ready.sync.lock_key(&key).await;
        ready.store.delete(&key)?;
        ready
            .sync
            .push_or_enqueue(OfflineQueueItem::delete(key, self.clock.now_millis()))
            .await?;
        Ok(())
    }

    /// Every record of `kind` owned by `owner_id`.
    pub fn scan(&self, kind: EntityKind, owner_id: &str) -> Result<Vec<Record>> {
        self.readable()?.scan(kind, owner_id)
    }

    /// Remove every record belonging to `owner_id` from all tiers, returning
    /// how many local records were removed.
    pub async fn clear_owner(&self, owner_id: &str) -> Result<usize> {
        let ready = self.ready()?;
        let mut removed = 0;

        for kind in EntityKind::ALL {
            let keys: Vec<RecordKey> = ready
                .store
                .scan(kind, owner_id)?
                .iter()
                .map(Record::key)
                .collect();

            for key in &keys {
                let _lock = ready.sync.lock_key(key).await;
                ready.store.delete(key)?;
                ready.sync.touch(key.clone());
            }
            removed += keys.len();

            let mut queued = false;
            for key in &keys {
                queued |= ready.queue.has_pending(key)?;
            }

            if ready.sync.is_online() && !queued {
                let result = with_single_retry("remove_all", self.config.remote_retry_delay, || {
                    self.remote.remove_all(kind, owner_id)
                })
                .await;
                match result {
                    Ok(count) => {
                        debug!(%kind, owner_id, count, "remote documents removed");
                        continue;
                    }
                    Err(err) => warn!(%kind, owner_id, error = %err, "remote removal failed, queueing"),
                }
            }

            for key in keys {
                let _lock = ready.sync.lock_key(&key).await;
                ready
                    .queue
                    .enqueue(OfflineQueueItem::delete(key, self.clock.now_millis()))?;
            }
        }

        info!(owner_id, removed, "owner data cleared");
        Ok(removed)
    }

    /// Watch one entity on the remote tier.
    ///
    /// Newer remote versions are written to the local tiers before
    /// `callback` sees them, unless the entity has local mutations still
    /// waiting to be synced.
    pub fn subscribe<F>(&self, kind: EntityKind, id: &str, callback: F) -> Result<Subscription>
    where
        F: Fn(Option<Record>) + Send + Sync + 'static,
    {
        let ready = self.ready()?;
        let key = RecordKey::new(kind, id);
        let store = ready.store.clone();
        let queue = ready.queue.clone();

        let watched = key.clone();
        let subscription = self.remote.subscribe(
            key,
            Arc::new(move |remote: Option<Record>| {
                let pending = queue.has_pending(&watched).unwrap_or(true);
                if !pending {
                    if let Ok(local) = store.get(&watched) {
                        match resolve(local.as_ref(), remote.as_ref()) {
                            Resolution::PullRemote(record)
                            | Resolution::Ambiguous { remote: record, .. } => {
                                if let Err(err) = store.put(&record) {
                                    warn!(key = %watched, error = %err, "remote update not applied");
                                }
                            }
                            Resolution::InSync | Resolution::PushLocal(_) => {}
                        }
                    }
                }
                callback(remote);
            }),
        );
        Ok(subscription)
    }

    /// Snapshot the Local tier into the backup slot.
    pub fn create_backup(&self) -> Result<BackupSnapshot> {
        self.ready()?.backups.create()
    }

    /// The backup currently in the slot.
    pub fn latest_backup(&self) -> Result<Option<BackupSnapshot>> {
        self.ready()?.backups.latest()
    }

    /// Replace the local contents with `snapshot`.
    ///
    /// On success the restored state is queued for the remote tier: a save
    /// for every restored record and a delete for every record the restore
    /// removed. On failure the local contents are unchanged.
    pub async fn restore_backup(&self, snapshot: &BackupSnapshot) -> Result<RestoreSummary> {
        let ready = self.ready()?;
        let _cycle = ready.sync.exclusive().await;

        let summary = ready.backups.restore(snapshot)?;
        let now = self.clock.now_millis();

        for key in &summary.restored {
            if let Some(record) = snapshot.get_record(key) {
                ready.queue.enqueue(OfflineQueueItem::save(record.clone(), now))?;
                ready.sync.touch(key.clone());
            }
        }
        for key in &summary.removed {
            ready.queue.enqueue(OfflineQueueItem::delete(key.clone(), now))?;
            ready.sync.touch(key.clone());
        }

        Ok(summary)
    }

    /// Whether the remote tier is currently considered reachable.
    pub fn is_online(&self) -> bool {
        match self.ready() {
            Ok(ready) => ready.sync.is_online(),
            Err(_) => self.connectivity.as_ref().is_some_and(|c| c.is_online()),
        }
    }

    /// Mutations waiting for the remote tier (dead letters excluded).
    pub fn pending_queue_length(&self) -> usize {
        self.ready().map(|ready| ready.queue.len()).unwrap_or(0)
    }

    /// Mutations that exhausted their retries.
    pub fn dead_letters(&self) -> Result<Vec<OfflineQueueItem>> {
        self.ready()?.queue.dead_letters()
    }

    /// Give a dead-lettered mutation a fresh retry budget.
    pub fn requeue_dead_letter(&self, id: &str) -> Result<bool> {
        self.ready()?.queue.requeue_dead_letter(id)
    }

    /// Drain and reconcile now, waiting for any cycle already running. Does
    /// nothing while offline.
    pub async fn force_sync(&self) -> Result<SyncReport> {
        let ready = self.ready()?;
        ready.sync.sync_and_wait(SyncTrigger::Manual).await
    }

    pub fn sync_state(&self) -> SyncState {
        self.ready()
            .map(|ready| ready.sync.state())
            .unwrap_or(SyncState::Idle)
    }

    /// Highest applied schema version.
    pub fn schema_version(&self) -> Result<Version> {
        let store = self.readable()?;
        self.migrator.current_version(&store)
    }

    /// True when the embedded store could not be opened.
    pub fn is_degraded(&self) -> bool {
        self.readable().map(|s| s.is_degraded()).unwrap_or(false)
    }

    /// Stop background sync. The engine must be initialized again before
    /// further use.
    pub async fn shutdown(&self) {
        let previous = std::mem::replace(&mut *self.state.write(), EngineState::Uninitialized);
        if let EngineState::Ready(ready) = previous {
            ready.sync.shutdown();
            let handle = ready.background.lock().take();
            if let Some(handle) = handle {
                if let Err(err) = handle.await {
                    warn!(error = %err, "sync loop ended abnormally");
                }
            }
            info!("engine shut down");
        }
    }
}
