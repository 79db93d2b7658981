//! Backup and restore of the local tier.
//!
//! A [`BackupSnapshot`] is a self-describing copy of every local record plus
//! the schema version it was taken under. Snapshots use `BTreeMap` so the same
//! contents always serialize to the same bytes.
//!
//! Restore is all-or-nothing: the snapshot is validated before anything is
//! touched, and if replaying it fails part-way the pre-restore contents are
//! put back.

use crate::{
    error::Result, storage::TieredStore, Clock, Error, Record, RecordKey, SchemaVersion,
    Timestamp, CURRENT_SCHEMA_VERSION,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{info, warn};

/// Version of the backup format written by this build.
pub const BACKUP_FORMAT_VERSION: &str = "1";

/// A point-in-time copy of the local tier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupSnapshot {
    pub format_version: String,
    pub created_at: Timestamp,
    /// Schema the records were written under
    pub schema: SchemaVersion,
    /// Records keyed by `"kind:id"`
    pub records: BTreeMap<RecordKey, Record>,
}

impl BackupSnapshot {
    /// Create an empty snapshot.
    pub fn new(schema: SchemaVersion, created_at: Timestamp) -> Self {
        Self {
            format_version: BACKUP_FORMAT_VERSION.to_string(),
            created_at,
            schema,
            records: BTreeMap::new(),
        }
    }

    pub fn add_record(&mut self, record: Record) {
        self.records.insert(record.key(), record);
    }

    pub fn get_record(&self, key: &RecordKey) -> Option<&Record> {
        self.records.get(key)
    }

    pub fn record_count(&self) -> usize {
        self.records.len()
    }

    /// Check the snapshot can be restored by this engine.
    pub fn validate(&self) -> Result<()> {
        if self.format_version != BACKUP_FORMAT_VERSION {
            return Err(Error::BackupInvalid(format!(
                "unsupported backup format version: {}",
                self.format_version
            )));
        }

        if self.schema.version > CURRENT_SCHEMA_VERSION {
            return Err(Error::BackupInvalid(format!(
                "backup schema version {} is newer than supported version {}",
                self.schema.version, CURRENT_SCHEMA_VERSION
            )));
        }

        for (key, record) in &self.records {
            if *key != record.key() {
                return Err(Error::BackupInvalid(format!(
                    "entry {key} holds record {}",
                    record.key()
                )));
            }
            record
                .validate()
                .map_err(|e| Error::BackupInvalid(format!("{key}: {e}")))?;
        }

        Ok(())
    }

    /// Serialize to JSON with deterministic ordering.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn to_json_pretty(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Deserialize from JSON, rejecting unknown format versions.
    pub fn from_json(json: &str) -> Result<Self> {
        let snapshot: Self =
            serde_json::from_str(json).map_err(|e| Error::BackupInvalid(e.to_string()))?;

        if snapshot.format_version != BACKUP_FORMAT_VERSION {
            return Err(Error::BackupInvalid(format!(
                "unsupported backup format version: {} (supported: {})",
                snapshot.format_version, BACKUP_FORMAT_VERSION
            )));
        }

        Ok(snapshot)
    }
}

/// What a successful restore changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RestoreSummary {
    /// Keys written from the snapshot
    pub restored: Vec<RecordKey>,
    /// Keys present before the restore and absent from the snapshot
    pub removed: Vec<RecordKey>,
}

/// Creates and restores backups of the local tier.
#[derive(Clone)]
pub struct BackupManager {
    store: Arc<TieredStore>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for BackupManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackupManager")
            .field("store", &self.store)
            .finish_non_exhaustive()
    }
}

impl BackupManager {
    pub fn new(store: Arc<TieredStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Snapshot the local tier and keep it in the backup slot, replacing any
    /// earlier backup.
    pub fn create(&self) -> Result<BackupSnapshot> {
        let created_at = self.clock.now_millis();
        let schema = self
            .store
            .meta()
            .schema_history()?
            .into_iter()
            .max_by_key(|v| v.version)
            .unwrap_or_else(|| SchemaVersion::baseline(created_at));

        let mut snapshot = BackupSnapshot::new(schema, created_at);
        for record in self.store.primary().all()? {
            snapshot.add_record(record);
        }

        self.store
            .meta()
            .save_backup(&snapshot.to_json()?, created_at)?;
        info!(records = snapshot.record_count(), "backup created");
        Ok(snapshot)
    }

    /// The backup currently in the slot.
    pub fn latest(&self) -> Result<Option<BackupSnapshot>> {
        self.store
            .meta()
            .latest_backup()?
            .map(|json| BackupSnapshot::from_json(&json))
            .transpose()
    }

    /// Replace the local contents with `snapshot`.
    ///
    /// Records taken under an older schema are stamped with the version
    /// storage is at, matching what the schema steps did to live records.
    ///
    /// Fails with [`Error::BackupInvalid`] before touching anything when the
    /// snapshot does not validate, and with [`Error::RestoreAborted`] after
    /// rolling back when replaying it fails.
    pub fn restore(&self, snapshot: &BackupSnapshot) -> Result<RestoreSummary> {
        snapshot.validate()?;

        let storage_version = self
            .store
            .meta()
            .schema_history()?
            .iter()
            .map(|v| v.version)
            .max()
            .unwrap_or(0);
        let upgraded: Vec<Record> = snapshot
            .records
            .values()
            .map(|record| {
                let mut record = record.clone();
                record.schema_version = record.schema_version.max(storage_version);
                record
            })
            .collect();

        let before = self.store.primary().all()?;

        if let Err(err) = self.replace_contents(upgraded.iter()) {
            warn!(error = %err, "restore failed, rolling back");
            if let Err(rollback) = self.replace_contents(before.iter()) {
                warn!(error = %rollback, "rollback incomplete");
            }
            return Err(Error::RestoreAborted(err.to_string()));
        }

        let restored: Vec<RecordKey> = snapshot.records.keys().cloned().collect();
        let kept: BTreeSet<&RecordKey> = snapshot.records.keys().collect();
        let removed = before
            .iter()
            .map(Record::key)
            .filter(|key| !kept.contains(key))
            .collect();

        info!(records = restored.len(), "backup restored");
        Ok(RestoreSummary { restored, removed })
    }

    fn replace_contents<'a>(&self, records: impl Iterator<Item = &'a Record>) -> Result<()> {
        self.store.clear()?;
        for record in records {
            self.store.put(record)?;
        }
        Ok(())
    }
}
