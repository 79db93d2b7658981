//! The persisted offline mutation queue.
//!
//! Writes that cannot reach the remote tier are queued here and applied later
//! by [`OfflineQueue::drain`]. Ordering is FIFO per `(kind, id)`; mutations of
//! different entities may be applied concurrently.
//!
//! # Drain passes
//!
//! Each pass takes the queue's current head-to-tail order and groups it by
//! entity key. Items within a group are applied one after another and a
//! failure ends the group for that pass, so a later mutation never overtakes
//! an earlier one. Groups run concurrently. Once every group has finished the
//! outcomes are committed: applied items are removed, failed items have their
//! retry count incremented, and items over the retry cap move to the
//! dead-letter list. Passes repeat until the queue is empty or `keep_going`
//! says stop.

use crate::{
    error::Result,
    remote::RemoteError,
    storage::{QueueEntry, TieredStore},
    Clock, EntityKind, Error, Record, RecordId, RecordKey, Timestamp,
};
use futures::future::join_all;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, warn};

/// Default number of failed retries before an item is dead-lettered.
pub const DEFAULT_RETRY_CAP: u32 = 3;

/// The mutation a queue item carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum QueueOperation {
    Save,
    Delete,
}

/// A pending remote mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OfflineQueueItem {
    /// Unique item id
    pub id: String,
    pub operation: QueueOperation,
    pub kind: EntityKind,
    pub entity_id: RecordId,
    /// Record to upsert; `None` for deletes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record: Option<Record>,
    pub enqueued_at: Timestamp,
    pub retry_count: u32,
    /// Most recent failure, for operator tooling
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl OfflineQueueItem {
    pub fn new(
        operation: QueueOperation,
        key: RecordKey,
        record: Option<Record>,
        enqueued_at: Timestamp,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            operation,
            kind: key.kind,
            entity_id: key.id,
            record,
            enqueued_at,
            retry_count: 0,
            last_error: None,
        }
    }

    /// A save of `record`.
    pub fn save(record: Record, enqueued_at: Timestamp) -> Self {
        Self::new(QueueOperation::Save, record.key(), Some(record), enqueued_at)
    }

    /// A delete of `key`.
    pub fn delete(key: RecordKey, enqueued_at: Timestamp) -> Self {
        Self::new(QueueOperation::Delete, key, None, enqueued_at)
    }

    pub fn key(&self) -> RecordKey {
        RecordKey::new(self.kind, self.entity_id.clone())
    }
}

/// Outcome of one [`OfflineQueue::drain`] call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DrainReport {
    /// Items applied and removed
    pub applied: usize,
    /// Failures that were re-queued
    pub retried: usize,
    /// Items moved to the dead-letter list
    pub dead_lettered: Vec<OfflineQueueItem>,
    /// Stored records returned by applied saves, in apply order
    pub synced: Vec<Record>,
    /// Keys of every applied item
    pub touched: Vec<RecordKey>,
    /// Items still queued when the drain stopped
    pub remaining: usize,
}

enum Outcome {
    Applied(Option<Record>),
    Failed(RemoteError),
}

/// The offline queue, persisted in the primary tier's metadata.
pub struct OfflineQueue {
    store: Arc<TieredStore>,
    clock: Arc<dyn Clock>,
    retry_cap: u32,
    entries: Mutex<Vec<QueueEntry>>,
}

impl std::fmt::Debug for OfflineQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OfflineQueue")
            .field("len", &self.len())
            .field("retry_cap", &self.retry_cap)
            .finish()
    }
}

impl OfflineQueue {
    /// Load the persisted queue.
    pub fn load(store: Arc<TieredStore>, clock: Arc<dyn Clock>, retry_cap: u32) -> Result<Self> {
        let entries = store.meta().queue_load()?;
        if !entries.is_empty() {
            debug!(pending = entries.len(), "loaded offline queue");
        }
        Ok(Self {
            store,
            clock,
            retry_cap,
            entries: Mutex::new(entries),
        })
    }

    /// Persist an item at the tail of the queue.
    pub fn enqueue(&self, item: OfflineQueueItem) -> Result<()> {
        // Holding the lock across the write keeps memory and storage in the same order.
        let mut entries = self.entries.lock();
        let seq = self.store.meta().queue_push(&item)?;
        debug!(key = %item.key(), op = ?item.operation, seq, "enqueued");
        entries.push(QueueEntry { seq, item });
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn retry_cap(&self) -> u32 {
        self.retry_cap
    }

    /// Queued items, head first.
    pub fn items(&self) -> Vec<OfflineQueueItem> {
        self.entries.lock().iter().map(|e| e.item.clone()).collect()
    }

    /// True when `key` has queued or dead-lettered mutations.
    pub fn has_pending(&self, key: &RecordKey) -> Result<bool> {
        let queued = self
            .entries
            .lock()
            .iter()
            .any(|e| e.item.kind == key.kind && e.item.entity_id == key.id);
        if queued {
            return Ok(true);
        }
        Ok(self
            .store
            .meta()
            .dead_letters()?
            .iter()
            .any(|item| item.kind == key.kind && item.entity_id == key.id))
    }

    pub fn dead_letters(&self) -> Result<Vec<OfflineQueueItem>> {
        self.store.meta().dead_letters()
    }

    /// Move a dead-lettered item back to the tail of the queue with a fresh
    /// retry budget. Returns false when no such item exists.
    pub fn requeue_dead_letter(&self, id: &str) -> Result<bool> {
        let Some(mut item) = self
            .dead_letters()?
            .into_iter()
            .find(|item| item.id == id)
        else {
            return Ok(false);
        };

        item.retry_count = 0;
        item.last_error = None;
        self.enqueue(item)?;
        self.store.meta().dead_letter_remove(id)?;
        Ok(true)
    }

    /// Apply queued items with `apply` until the queue is empty or
    /// `keep_going` returns false.
    ///
    /// `apply` returns the stored record for a save (when the remote reports
    /// one) and `None` for a delete.
    pub async fn drain<F, Fut, K>(&self, apply: F, keep_going: K) -> Result<DrainReport>
    where
        F: Fn(OfflineQueueItem) -> Fut,
        Fut: Future<Output = std::result::Result<Option<Record>, RemoteError>>,
        K: Fn() -> bool,
    {
        let mut report = DrainReport::default();

        while keep_going() {
            let snapshot = self.entries.lock().clone();
            if snapshot.is_empty() {
                break;
            }

            let groups = group_by_key(snapshot);
            let passes = groups.into_iter().map(|group| {
                let apply = &apply;
                async move {
                    let mut outcomes = Vec::with_capacity(group.len());
                    for entry in group {
                        debug!(key = %entry.item.key(), op = ?entry.item.operation, "applying");
                        match apply(entry.item.clone()).await {
                            Ok(stored) => outcomes.push((entry, Outcome::Applied(stored))),
                            Err(err) => {
                                outcomes.push((entry, Outcome::Failed(err)));
                                break;
                            }
                        }
                    }
                    outcomes
                }
            });

            for (entry, outcome) in join_all(passes).await.into_iter().flatten() {
                self.commit(entry, outcome, &mut report)?;
            }
        }

        report.remaining = self.len();
        Ok(report)
    }

    fn commit(&self, entry: QueueEntry, outcome: Outcome, report: &mut DrainReport) -> Result<()> {
        match outcome {
            Outcome::Applied(stored) => {
                self.remove_entry(entry.seq)?;
                report.applied += 1;
                report.touched.push(entry.item.key());
                report.synced.extend(stored);
            }
            Outcome::Failed(err) => {
                let mut item = entry.item;
                item.retry_count += 1;
                item.last_error = Some(err.to_string());

                if item.retry_count > self.retry_cap {
                    let exhausted = Error::QueueRetryExhausted {
                        id: item.id.clone(),
                        retries: item.retry_count,
                    };
                    warn!(key = %item.key(), error = %err, "{exhausted}, moved to dead letters");
                    self.store
                        .meta()
                        .dead_letter_push(&item, self.clock.now_millis())?;
                    self.remove_entry(entry.seq)?;
                    report.dead_lettered.push(item);
                } else {
                    debug!(key = %item.key(), retry = item.retry_count, error = %err, "apply failed");
                    self.store.meta().queue_update(entry.seq, &item)?;
                    if let Some(slot) = self.entries.lock().iter_mut().find(|e| e.seq == entry.seq)
                    {
                        slot.item = item;
                    }
                    report.retried += 1;
                }
            }
        }
        Ok(())
    }

    fn remove_entry(&self, seq: u64) -> Result<()> {
        self.store.meta().queue_remove(seq)?;
        self.entries.lock().retain(|e| e.seq != seq);
        Ok(())
    }
}

/// Split entries into per-key groups, each in queue order. Groups are ordered
/// by their first entry.
fn group_by_key(entries: Vec<QueueEntry>) -> Vec<Vec<QueueEntry>> {
    let mut index: HashMap<RecordKey, usize> = HashMap::new();
    let mut groups: Vec<Vec<QueueEntry>> = Vec::new();
    for entry in entries {
        let key = entry.item.key();
        match index.get(&key) {
            Some(&i) => groups[i].push(entry),
            None => {
                index.insert(key, groups.len());
                groups.push(vec![entry]);
            }
        }
    }
    groups
}
