use super::{MetaStore, QueueEntry, RecordTier};
use crate::{
    error::Result, EntityKind, OfflineQueueItem, Record, RecordKey, SchemaVersion, Timestamp,
};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// In-memory tier.
///
/// Serves as the Cache tier and, when the embedded database is unavailable,
/// as a non-durable stand-in for the Local tier.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: DashMap<RecordKey, Record>,
    schema: Mutex<Vec<SchemaVersion>>,
    queue: Mutex<BTreeMap<u64, OfflineQueueItem>>,
    next_seq: AtomicU64,
    dead: Mutex<Vec<OfflineQueueItem>>,
    backup: Mutex<Option<(Timestamp, String)>>,
    kv: DashMap<String, String>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of cached records.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl RecordTier for MemoryStore {
    fn tier_name(&self) -> &'static str {
        "cache"
    }

    fn get(&self, key: &RecordKey) -> Result<Option<Record>> {
        Ok(self.records.get(key).map(|r| r.value().clone()))
    }

    fn put(&self, record: &Record) -> Result<()> {
        self.records.insert(record.key(), record.clone());
        Ok(())
    }

    fn delete(&self, key: &RecordKey) -> Result<()> {
        self.records.remove(key);
        Ok(())
    }

    fn scan(&self, kind: EntityKind, owner_id: &str) -> Result<Vec<Record>> {
        let mut found: Vec<Record> = self
            .records
            .iter()
            .filter(|r| r.kind == kind && r.owner_id == owner_id)
            .map(|r| r.value().clone())
            .collect();
        found.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(found)
    }

    fn all(&self) -> Result<Vec<Record>> {
        let mut found: Vec<Record> = self.records.iter().map(|r| r.value().clone()).collect();
        found.sort_by_key(|r| r.key());
        Ok(found)
    }

    fn clear(&self) -> Result<()> {
        self.records.clear();
        Ok(())
    }
}

impl MetaStore for MemoryStore {
    fn schema_history(&self) -> Result<Vec<SchemaVersion>> {
        Ok(self.schema.lock().clone())
    }

    fn record_schema_version(&self, version: &SchemaVersion) -> Result<()> {
        let mut history = self.schema.lock();
        history.retain(|v| v.version != version.version);
        history.push(version.clone());
        history.sort_by_key(|v| v.version);
        Ok(())
    }

    fn queue_push(&self, item: &OfflineQueueItem) -> Result<u64> {
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst) + 1;
        self.queue.lock().insert(seq, item.clone());
        Ok(seq)
    }

    fn queue_update(&self, seq: u64, item: &OfflineQueueItem) -> Result<()> {
        if let Some(slot) = self.queue.lock().get_mut(&seq) {
            *slot = item.clone();
        }
        Ok(())
    }

    fn queue_remove(&self, seq: u64) -> Result<()> {
        self.queue.lock().remove(&seq);
        Ok(())
    }

    fn queue_load(&self) -> Result<Vec<QueueEntry>> {
        Ok(self
            .queue
            .lock()
            .iter()
            .map(|(seq, item)| QueueEntry {
                seq: *seq,
                item: item.clone(),
            })
            .collect())
    }

    fn dead_letter_push(&self, item: &OfflineQueueItem, _at: Timestamp) -> Result<()> {
        self.dead.lock().push(item.clone());
        Ok(())
    }

    fn dead_letter_remove(&self, id: &str) -> Result<()> {
        self.dead.lock().retain(|item| item.id != id);
        Ok(())
    }

    fn dead_letters(&self) -> Result<Vec<OfflineQueueItem>> {
        Ok(self.dead.lock().clone())
    }

    fn save_backup(&self, snapshot_json: &str, created_at: Timestamp) -> Result<()> {
        *self.backup.lock() = Some((created_at, snapshot_json.to_string()));
        Ok(())
    }

    fn latest_backup(&self) -> Result<Option<String>> {
        Ok(self.backup.lock().as_ref().map(|(_, json)| json.clone()))
    }

    fn kv_get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.kv.get(key).map(|v| v.value().clone()))
    }

    fn kv_set(&self, key: &str, value: &str) -> Result<()> {
        self.kv.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn kv_remove(&self, key: &str) -> Result<()> {
        self.kv.remove(key);
        Ok(())
    }

    fn kv_keys(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys: Vec<String> = self
            .kv
            .iter()
            .filter(|e| e.key().starts_with(prefix))
            .map(|e| e.key().clone())
            .collect();
        keys.sort();
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload::{LearningProgress, Payload};
    use crate::QueueOperation;

    fn progress(id: &str, owner: &str) -> Record {
        Record::new(id, owner, Payload::Progress(LearningProgress::new("es")), 1000)
    }

    #[test]
    fn new_store_is_empty() {
        let store = MemoryStore::new();
        assert!(store.is_empty());
        assert_eq!(store.len(), 0);
    }

    #[test]
    fn put_replaces() {
        let store = MemoryStore::new();
        let mut record = progress("p-1", "learner-1");
        store.put(&record).unwrap();

        record.updated_at = 2000;
        store.put(&record).unwrap();

        assert_eq!(store.len(), 1);
        assert_eq!(store.get(&record.key()).unwrap().unwrap().updated_at, 2000);
    }

    #[test]
    fn scan_filters_kind_and_owner() {
        let store = MemoryStore::new();
        store.put(&progress("p-2", "learner-1")).unwrap();
        store.put(&progress("p-1", "learner-1")).unwrap();
        store.put(&progress("p-3", "learner-2")).unwrap();

        let found = store.scan(EntityKind::Progress, "learner-1").unwrap();
        let ids: Vec<_> = found.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["p-1", "p-2"]);

        assert!(store.scan(EntityKind::User, "learner-1").unwrap().is_empty());
    }

    #[test]
    fn queue_sequence_is_monotonic() {
        let store = MemoryStore::new();
        let record = progress("p-1", "learner-1");
        let a = OfflineQueueItem::new(QueueOperation::Save, record.key(), Some(record.clone()), 1);
        let b = OfflineQueueItem::new(QueueOperation::Delete, record.key(), None, 2);

        let seq_a = store.queue_push(&a).unwrap();
        let seq_b = store.queue_push(&b).unwrap();
        assert!(seq_b > seq_a);

        store.queue_remove(seq_a).unwrap();
        let loaded = store.queue_load().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].seq, seq_b);
    }

    #[test]
    fn kv_prefix_listing() {
        let store = MemoryStore::new();
        store.kv_set("legacy/user/1", "{}").unwrap();
        store.kv_set("legacy/progress/1", "{}").unwrap();
        store.kv_set("settings/theme", "dark").unwrap();

        assert_eq!(
            store.kv_keys("legacy/").unwrap(),
            vec!["legacy/progress/1", "legacy/user/1"]
        );
    }
}
