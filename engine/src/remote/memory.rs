use super::{RemoteCallback, RemoteError, RemoteStore, Subscription};
use crate::{Clock, EntityKind, Record, RecordKey, SystemClock};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

type Listeners = Arc<Mutex<HashMap<RecordKey, Vec<(u64, RemoteCallback)>>>>;

/// An in-process remote document store.
///
/// Assigns server timestamps the same way the document service does
/// (`max(now, previous + 1)`) and fans changes out to subscribers. Faults can
/// be injected to simulate an unreachable service or rejected writes.
pub struct MemoryRemote {
    clock: Arc<dyn Clock>,
    docs: Mutex<HashMap<RecordKey, Record>>,
    listeners: Listeners,
    next_listener: AtomicU64,
    reachable: AtomicBool,
    fail_next: AtomicUsize,
    rejected: Mutex<HashSet<RecordKey>>,
    writes: AtomicUsize,
}

impl std::fmt::Debug for MemoryRemote {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryRemote")
            .field("documents", &self.docs.lock().len())
            .field("reachable", &self.is_reachable())
            .finish()
    }
}

impl Default for MemoryRemote {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRemote {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// A store that stamps writes with `clock`.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            docs: Mutex::new(HashMap::new()),
            listeners: Arc::new(Mutex::new(HashMap::new())),
            next_listener: AtomicU64::new(0),
            reachable: AtomicBool::new(true),
            fail_next: AtomicUsize::new(0),
            rejected: Mutex::new(HashSet::new()),
            writes: AtomicUsize::new(0),
        }
    }

    /// Simulate losing or regaining the network.
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    pub fn is_reachable(&self) -> bool {
        self.reachable.load(Ordering::SeqCst)
    }

    /// Make the next `calls` calls fail as unreachable.
    pub fn fail_next(&self, calls: usize) {
        self.fail_next.store(calls, Ordering::SeqCst);
    }

    /// Refuse every write to `key` until [`MemoryRemote::accept`] is called.
    pub fn reject(&self, key: RecordKey) {
        self.rejected.lock().insert(key);
    }

    pub fn accept(&self, key: &RecordKey) {
        self.rejected.lock().remove(key);
    }

    /// Store a document exactly as given, as another device would have
    /// written it. Subscribers are notified.
    pub fn seed(&self, record: Record) {
        let key = record.key();
        self.docs.lock().insert(key.clone(), record.clone());
        self.notify(&key, Some(record));
    }

    /// Peek at a stored document.
    pub fn document(&self, key: &RecordKey) -> Option<Record> {
        self.docs.lock().get(key).cloned()
    }

    /// Every stored document, sorted by key.
    pub fn documents(&self) -> Vec<Record> {
        let mut docs: Vec<Record> = self.docs.lock().values().cloned().collect();
        docs.sort_by_key(|r| r.key());
        docs
    }

    /// Number of successful upserts and removals.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    fn check_reachable(&self) -> Result<(), RemoteError> {
        if !self.is_reachable() {
            return Err(RemoteError::Unreachable("network down".into()));
        }
        let injected = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if injected.is_ok() {
            return Err(RemoteError::Unreachable("injected failure".into()));
        }
        Ok(())
    }

    fn check_accepted(&self, key: &RecordKey) -> Result<(), RemoteError> {
        if self.rejected.lock().contains(key) {
            return Err(RemoteError::Rejected {
                status: 422,
                message: format!("write to {key} refused"),
            });
        }
        Ok(())
    }

    fn notify(&self, key: &RecordKey, record: Option<Record>) {
        // Callbacks run without the listener lock held so they may unsubscribe.
        let callbacks: Vec<RemoteCallback> = self
            .listeners
            .lock()
            .get(key)
            .map(|list| list.iter().map(|(_, cb)| cb.clone()).collect())
            .unwrap_or_default();
        for callback in callbacks {
            callback(record.clone());
        }
    }
}

#[async_trait]
impl RemoteStore for MemoryRemote {
    async fn fetch(&self, key: &RecordKey) -> Result<Option<Record>, RemoteError> {
        self.check_reachable()?;
        Ok(self.document(key))
    }

    async fn upsert(&self, record: &Record) -> Result<Record, RemoteError> {
        self.check_reachable()?;
        let key = record.key();
        self.check_accepted(&key)?;

        let stored = {
            let mut docs = self.docs.lock();
            let previous = docs.get(&key).map_or(0, |r| r.updated_at);
            let mut stored = record.clone();
            stored.updated_at = self.clock.now_millis().max(previous + 1);
            docs.insert(key.clone(), stored.clone());
            stored
        };
        self.writes.fetch_add(1, Ordering::SeqCst);

        self.notify(&key, Some(stored.clone()));
        Ok(stored)
    }

    async fn remove(&self, key: &RecordKey) -> Result<(), RemoteError> {
        self.check_reachable()?;
        self.check_accepted(key)?;

        let removed = self.docs.lock().remove(key);
        self.writes.fetch_add(1, Ordering::SeqCst);
        if removed.is_some() {
            self.notify(key, None);
        }
        Ok(())
    }

    async fn remove_all(&self, kind: EntityKind, owner_id: &str) -> Result<usize, RemoteError> {
        self.check_reachable()?;

        let removed: Vec<RecordKey> = {
            let mut docs = self.docs.lock();
            let keys: Vec<RecordKey> = docs
                .values()
                .filter(|r| r.kind == kind && r.owner_id == owner_id)
                .map(Record::key)
                .collect();
            for key in &keys {
                docs.remove(key);
            }
            keys
        };
        self.writes.fetch_add(1, Ordering::SeqCst);

        for key in &removed {
            self.notify(key, None);
        }
        Ok(removed.len())
    }

    fn subscribe(&self, key: RecordKey, callback: RemoteCallback) -> Subscription {
        let id = self.next_listener.fetch_add(1, Ordering::SeqCst);
        self.listeners
            .lock()
            .entry(key.clone())
            .or_default()
            .push((id, callback));

        let listeners = Arc::clone(&self.listeners);
        Subscription::new(move || {
            let mut listeners = listeners.lock();
            if let Some(list) = listeners.get_mut(&key) {
                list.retain(|(listener, _)| *listener != id);
                if list.is_empty() {
                    listeners.remove(&key);
                }
            }
        })
    }

    async fn ping(&self) -> Result<(), RemoteError> {
        self.check_reachable()
    }
}
