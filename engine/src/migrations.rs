//! Built-in schema migration steps.
//!
//! | Version | Step |
//! |---------|------|
//! | 1 | Import legacy key-value entries into typed records |
//! | 2 | Stamp the schema version on every stored record |

use crate::{
    error::Result,
    schema::{Migration, MigrationContext, MigrationOutcome},
    storage::{MetaStore, LEGACY_PREFIX},
    EntityKind, Error, Payload, Record, Timestamp, Version,
};
use serde::Deserialize;
use tracing::{debug, warn};

/// Every built-in step, in version order.
pub fn builtin() -> Vec<Migration> {
    vec![
        Migration::new(1, "import legacy key-value entries", import_legacy),
        Migration::new(2, "stamp schema version on records", stamp_schema_version),
    ]
}

/// Value stored under a `legacy/<kind>/<id>` key by older app versions.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LegacyEntry {
    owner_id: String,
    payload: serde_json::Value,
    #[serde(default)]
    updated_at: Timestamp,
}

const IMPORTED_VERSION: Version = 1;
const STAMPED_VERSION: Version = 2;

fn import_legacy(ctx: &MigrationContext<'_>) -> Result<MigrationOutcome> {
    let mut outcome = MigrationOutcome::default();

    for tier in ctx.store.meta_tiers() {
        for key in tier.kv_keys(LEGACY_PREFIX)? {
            match parse_legacy(tier, &key) {
                Ok(Some(record)) => {
                    let existing = ctx.store.get(&record.key())?;
                    match existing {
                        Some(current) if current.updated_at >= record.updated_at => {
                            debug!(%key, "legacy entry older than stored record, discarded");
                        }
                        _ => {
                            ctx.store.put(&record)?;
                            outcome.records_migrated += 1;
                        }
                    }
                }
                Ok(None) => {}
                Err(err) => {
                    warn!(%key, error = %err, "unreadable legacy entry removed");
                    outcome.warnings.push(format!("{key}: {err}"));
                }
            }
            tier.kv_remove(&key)?;
        }
    }

    Ok(outcome)
}

fn parse_legacy(tier: &dyn MetaStore, key: &str) -> Result<Option<Record>> {
    let Some(raw) = tier.kv_get(key)? else {
        return Ok(None);
    };

    let rest = key.strip_prefix(LEGACY_PREFIX).unwrap_or(key);
    let (kind, id) = rest
        .split_once('/')
        .ok_or_else(|| Error::InvalidRecord(format!("malformed legacy key {key}")))?;
    let kind: EntityKind = kind.parse()?;

    let entry: LegacyEntry = serde_json::from_str(&raw)?;
    let mut record = Record::new(
        id,
        entry.owner_id,
        Payload::from_json(kind, entry.payload)?,
        entry.updated_at,
    );
    record.schema_version = IMPORTED_VERSION;
    record.validate()?;
    Ok(Some(record))
}

fn stamp_schema_version(ctx: &MigrationContext<'_>) -> Result<MigrationOutcome> {
    let mut outcome = MigrationOutcome::default();
    for mut record in ctx.store.all()? {
        if record.schema_version < STAMPED_VERSION {
            record.schema_version = STAMPED_VERSION;
            ctx.store.put(&record)?;
            outcome.records_migrated += 1;
        }
    }
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload::LearningProgress;
    use crate::storage::{RecordTier, TieredStore};
    use crate::{ManualClock, RecordKey, SchemaMigrator, CURRENT_SCHEMA_VERSION};
    use serde_json::json;

    fn legacy_progress(updated_at: Timestamp) -> String {
        json!({
            "ownerId": "learner-1",
            "updatedAt": updated_at,
            "payload": {
                "language": "it",
                "level": 2,
                "xp": 340,
                "lessonsCompleted": 6,
                "accuracy": 0.7
            }
        })
        .to_string()
    }

    #[test]
    fn builtin_steps_are_gapless() {
        let versions: Vec<_> = builtin().iter().map(|m| m.version).collect();
        assert_eq!(versions, vec![1, 2]);
        assert_eq!(SchemaMigrator::builtin().latest_version(), CURRENT_SCHEMA_VERSION);
    }

    #[test]
    fn imports_legacy_entries() {
        let store = TieredStore::open(None);
        let clock = ManualClock::new(10_000);
        store
            .meta()
            .kv_set("legacy/progress/p-it", &legacy_progress(500))
            .unwrap();

        let result = SchemaMigrator::builtin().migrate(&store, &clock, CURRENT_SCHEMA_VERSION);
        assert!(result.is_success());
        assert_eq!(result.to_version, CURRENT_SCHEMA_VERSION);

        let record = store
            .get(&RecordKey::new(EntityKind::Progress, "p-it"))
            .unwrap()
            .unwrap();
        assert_eq!(record.owner_id, "learner-1");
        assert_eq!(record.updated_at, 500);
        assert_eq!(record.schema_version, CURRENT_SCHEMA_VERSION);
        assert!(store.meta().kv_keys(LEGACY_PREFIX).unwrap().is_empty());
    }

    #[test]
    fn legacy_entries_in_cache_tier_are_imported() {
        let store = TieredStore::open(None);
        let clock = ManualClock::new(10_000);
        store
            .cache()
            .kv_set("legacy/progress/p-it", &legacy_progress(500))
            .unwrap();

        SchemaMigrator::builtin().migrate(&store, &clock, CURRENT_SCHEMA_VERSION);

        let key = RecordKey::new(EntityKind::Progress, "p-it");
        assert!(store.primary().get(&key).unwrap().is_some());
        assert!(store.cache().kv_keys(LEGACY_PREFIX).unwrap().is_empty());
    }

    #[test]
    fn unreadable_entry_warns_and_is_removed() {
        let store = TieredStore::open(None);
        let clock = ManualClock::new(10_000);
        store.meta().kv_set("legacy/progress/p-1", "{not json").unwrap();
        store.meta().kv_set("legacy/planet/x", "{}").unwrap();

        let result = SchemaMigrator::builtin().migrate(&store, &clock, CURRENT_SCHEMA_VERSION);
        assert!(result.is_success());
        assert_eq!(result.warnings.len(), 2);
        assert!(store.meta().kv_keys(LEGACY_PREFIX).unwrap().is_empty());
        assert!(store.all().unwrap().is_empty());
    }

    #[test]
    fn newer_stored_record_is_kept() {
        let store = TieredStore::open(None);
        let clock = ManualClock::new(10_000);
        let mut current = LearningProgress::new("it");
        current.level = 9;
        store
            .put(&Record::new("p-it", "learner-1", Payload::Progress(current.clone()), 900))
            .unwrap();
        store
            .meta()
            .kv_set("legacy/progress/p-it", &legacy_progress(500))
            .unwrap();

        SchemaMigrator::builtin().migrate(&store, &clock, CURRENT_SCHEMA_VERSION);

        let record = store
            .get(&RecordKey::new(EntityKind::Progress, "p-it"))
            .unwrap()
            .unwrap();
        assert_eq!(record.payload, Payload::Progress(current));
        assert_eq!(record.updated_at, 900);
    }

    #[test]
    fn stamps_old_records() {
        let store = TieredStore::open(None);
        let clock = ManualClock::new(10_000);
        let mut record = Record::new(
            "p-1",
            "learner-1",
            Payload::Progress(LearningProgress::new("fr")),
            100,
        );
        record.schema_version = 1;
        store.put(&record).unwrap();
        store
            .meta()
            .record_schema_version(&crate::SchemaVersion::baseline(1))
            .unwrap();
        store
            .meta()
            .record_schema_version(&crate::SchemaVersion {
                version: 1,
                applied_at: 2,
                description: "import legacy key-value entries".into(),
            })
            .unwrap();

        let result = SchemaMigrator::builtin().migrate(&store, &clock, CURRENT_SCHEMA_VERSION);
        assert_eq!(result.from_version, 1);
        assert_eq!(result.records_migrated, 1);
        assert_eq!(
            store.get(&record.key()).unwrap().unwrap().schema_version,
            CURRENT_SCHEMA_VERSION
        );
    }
}
