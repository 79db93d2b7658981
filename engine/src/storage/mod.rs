//! Device-side storage tiers.
//!
//! - [`SqliteStore`] - the embedded durable store (Local tier)
//! - [`MemoryStore`] - the key-value mirror (Cache tier), also used as the
//!   local store when the embedded database cannot be opened
//! - [`TieredStore`] - the read/write paths across both

mod memory;
mod sqlite;
mod tiered;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;
pub use tiered::TieredStore;

use crate::{
    error::Result, EntityKind, OfflineQueueItem, Record, RecordKey, SchemaVersion, Timestamp,
};

/// Prefix of keys written by pre-migration app versions.
pub const LEGACY_PREFIX: &str = "legacy/";

/// Record storage for one tier. Writes replace, never append.
pub trait RecordTier: Send + Sync {
    /// Short tier name used in logs.
    fn tier_name(&self) -> &'static str;

    fn get(&self, key: &RecordKey) -> Result<Option<Record>>;

    fn put(&self, record: &Record) -> Result<()>;

    fn delete(&self, key: &RecordKey) -> Result<()>;

    /// Records of one kind belonging to one owner.
    fn scan(&self, kind: EntityKind, owner_id: &str) -> Result<Vec<Record>>;

    /// Every record in the tier.
    fn all(&self) -> Result<Vec<Record>>;

    /// Remove every record (metadata is untouched).
    fn clear(&self) -> Result<()>;
}

/// A persisted offline-queue entry with its ordering sequence.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueEntry {
    pub seq: u64,
    pub item: OfflineQueueItem,
}

/// Engine metadata kept alongside the records: schema history, the offline
/// queue, dead letters, the backup slot and the legacy key-value namespace.
pub trait MetaStore: Send + Sync {
    fn schema_history(&self) -> Result<Vec<SchemaVersion>>;

    fn record_schema_version(&self, version: &SchemaVersion) -> Result<()>;

    /// Persist a queue item and return its sequence number.
    fn queue_push(&self, item: &OfflineQueueItem) -> Result<u64>;

    fn queue_update(&self, seq: u64, item: &OfflineQueueItem) -> Result<()>;

    fn queue_remove(&self, seq: u64) -> Result<()>;

    /// Every queued entry in sequence order.
    fn queue_load(&self) -> Result<Vec<QueueEntry>>;

    fn dead_letter_push(&self, item: &OfflineQueueItem, at: Timestamp) -> Result<()>;

    fn dead_letter_remove(&self, id: &str) -> Result<()>;

    /// Dead-lettered items, oldest first.
    fn dead_letters(&self) -> Result<Vec<OfflineQueueItem>>;

    /// Replace the single backup slot.
    fn save_backup(&self, snapshot_json: &str, created_at: Timestamp) -> Result<()>;

    fn latest_backup(&self) -> Result<Option<String>>;

    fn kv_get(&self, key: &str) -> Result<Option<String>>;

    fn kv_set(&self, key: &str, value: &str) -> Result<()>;

    fn kv_remove(&self, key: &str) -> Result<()>;

    /// Keys starting with `prefix`, sorted.
    fn kv_keys(&self, prefix: &str) -> Result<Vec<String>>;
}

/// A store usable as the Local tier.
pub trait LocalStore: RecordTier + MetaStore {
    fn as_records(&self) -> &dyn RecordTier;

    fn as_meta(&self) -> &dyn MetaStore;
}

impl<T: RecordTier + MetaStore> LocalStore for T {
    fn as_records(&self) -> &dyn RecordTier {
        self
    }

    fn as_meta(&self) -> &dyn MetaStore {
        self
    }
}
