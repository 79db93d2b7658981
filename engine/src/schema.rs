//! Schema versioning and migration.
//!
//! Persisted data carries a schema version. At startup the [`SchemaMigrator`]
//! brings storage up to the latest known version by running each pending
//! [`Migration`] step in order. Every applied step is recorded in the schema
//! history, so running the migrator again is a no-op. A step that fails is
//! rolled back: the records and key-value entries it changed are put back as
//! they were before it ran.

use crate::{error::Result, storage::TieredStore, Clock, Error, Record, Timestamp, Version};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{info, warn};

/// One applied entry of the schema history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchemaVersion {
    pub version: Version,
    /// When the step was applied (milliseconds since epoch)
    pub applied_at: Timestamp,
    pub description: String,
}

impl SchemaVersion {
    /// The version-0 entry recorded when storage is first created.
    pub fn baseline(applied_at: Timestamp) -> Self {
        Self {
            version: 0,
            applied_at,
            description: "baseline".into(),
        }
    }
}

/// What a migration step sees.
pub struct MigrationContext<'a> {
    pub store: &'a TieredStore,
    pub clock: &'a dyn Clock,
}

/// What a migration step did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MigrationOutcome {
    pub records_migrated: usize,
    pub warnings: Vec<String>,
}

type MigrationStep = Box<dyn Fn(&MigrationContext<'_>) -> Result<MigrationOutcome> + Send + Sync>;

/// A single numbered schema step.
pub struct Migration {
    pub version: Version,
    pub description: String,
    step: MigrationStep,
}

impl Migration {
    pub fn new<F>(version: Version, description: impl Into<String>, step: F) -> Self
    where
        F: Fn(&MigrationContext<'_>) -> Result<MigrationOutcome> + Send + Sync + 'static,
    {
        Self {
            version,
            description: description.into(),
            step: Box::new(step),
        }
    }

    fn run(&self, ctx: &MigrationContext<'_>) -> Result<MigrationOutcome> {
        (self.step)(ctx)
    }
}

impl fmt::Debug for Migration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Migration")
            .field("version", &self.version)
            .field("description", &self.description)
            .finish_non_exhaustive()
    }
}

/// Outcome of one [`SchemaMigrator::migrate`] run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MigrationResult {
    pub from_version: Version,
    pub to_version: Version,
    pub records_migrated: usize,
    /// At most one entry: the step that failed and stopped the run
    pub errors: Vec<Error>,
    pub warnings: Vec<String>,
}

impl MigrationResult {
    pub fn is_success(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Runs ordered migration steps against a [`TieredStore`].
#[derive(Debug)]
pub struct SchemaMigrator {
    migrations: Vec<Migration>,
}

impl SchemaMigrator {
    /// Build a migrator. Steps must be numbered 1, 2, 3... without gaps.
    pub fn new(mut migrations: Vec<Migration>) -> Result<Self> {
        migrations.sort_by_key(|m| m.version);
        for (index, migration) in migrations.iter().enumerate() {
            let expected = index as Version + 1;
            if migration.version != expected {
                return Err(Error::SchemaMigrationFailed {
                    version: migration.version,
                    reason: format!("migration steps must be gapless, expected version {expected}"),
                });
            }
        }
        Ok(Self { migrations })
    }

    /// The migrator with the engine's built-in steps.
    pub fn builtin() -> Self {
        Self {
            migrations: crate::migrations::builtin(),
        }
    }

    /// Highest version any step brings storage to.
    pub fn latest_version(&self) -> Version {
        self.migrations.last().map_or(0, |m| m.version)
    }

    /// Applied history, oldest first.
    pub fn history(&self, store: &TieredStore) -> Result<Vec<SchemaVersion>> {
        store.meta().schema_history()
    }

    /// Highest applied version (0 for fresh storage).
    pub fn current_version(&self, store: &TieredStore) -> Result<Version> {
        Ok(self
            .history(store)?
            .iter()
            .map(|v| v.version)
            .max()
            .unwrap_or(0))
    }

    /// Apply every pending step up to and including `target`.
    ///
    /// A step that fails stops the run; its version is not recorded and the
    /// steps after it are not attempted.
    pub fn migrate(
        &self,
        store: &TieredStore,
        clock: &dyn Clock,
        target: Version,
    ) -> MigrationResult {
        let mut result = MigrationResult::default();

        let current = match self.prepare(store, clock) {
            Ok(current) => current,
            Err(err) => {
                result.errors.push(Error::SchemaMigrationFailed {
                    version: 0,
                    reason: err.to_string(),
                });
                return result;
            }
        };
        result.from_version = current;
        result.to_version = current;

        if target > self.latest_version() {
            result.warnings.push(format!(
                "target version {target} is above the latest known step {}",
                self.latest_version()
            ));
        }
        if target < current {
            result.warnings.push(format!(
                "storage is at version {current}, downgrade to {target} not supported"
            ));
            return result;
        }

        let ctx = MigrationContext { store, clock };
        for migration in self
            .migrations
            .iter()
            .filter(|m| m.version > current && m.version <= target)
        {
            info!(
                version = migration.version,
                description = %migration.description,
                "applying migration"
            );

            let checkpoint = match Checkpoint::take(store) {
                Ok(checkpoint) => checkpoint,
                Err(err) => {
                    warn!(version = migration.version, error = %err, "migration checkpoint failed");
                    result.errors.push(Error::SchemaMigrationFailed {
                        version: migration.version,
                        reason: err.to_string(),
                    });
                    break;
                }
            };

            let applied = migration.run(&ctx).and_then(|outcome| {
                store.meta().record_schema_version(&SchemaVersion {
                    version: migration.version,
                    applied_at: clock.now_millis(),
                    description: migration.description.clone(),
                })?;
                Ok(outcome)
            });

            match applied {
                Ok(outcome) => {
                    result.records_migrated += outcome.records_migrated;
                    result.warnings.extend(outcome.warnings);
                    result.to_version = migration.version;
                }
                Err(err) => {
                    warn!(version = migration.version, error = %err, "migration failed, rolling back");
                    if let Err(rollback) = checkpoint.restore(store) {
                        warn!(version = migration.version, error = %rollback, "rollback incomplete");
                        result.warnings.push(format!(
                            "rollback of step {} incomplete: {rollback}",
                            migration.version
                        ));
                    }
                    result.errors.push(Error::SchemaMigrationFailed {
                        version: migration.version,
                        reason: err.to_string(),
                    });
                    break;
                }
            }
        }

        result
    }

    /// Record the baseline on fresh storage and return the current version.
    fn prepare(&self, store: &TieredStore, clock: &dyn Clock) -> Result<Version> {
        let history = self.history(store)?;
        if history.is_empty() {
            store
                .meta()
                .record_schema_version(&SchemaVersion::baseline(clock.now_millis()))?;
            return Ok(0);
        }
        Ok(history.iter().map(|v| v.version).max().unwrap_or(0))
    }
}

/// Storage contents captured before a step runs.
struct Checkpoint {
    records: Vec<Record>,
    /// Key-value entries of each metadata tier, in `meta_tiers` order
    entries: Vec<Vec<(String, String)>>,
}

impl Checkpoint {
    fn take(store: &TieredStore) -> Result<Self> {
        let records = store.all()?;
        let mut entries = Vec::new();
        for tier in store.meta_tiers() {
            let mut tier_entries = Vec::new();
            for key in tier.kv_keys("")? {
                if let Some(value) = tier.kv_get(&key)? {
                    tier_entries.push((key, value));
                }
            }
            entries.push(tier_entries);
        }
        Ok(Self { records, entries })
    }

    /// Put storage back to the captured contents. The Cache tier is emptied
    /// and refills from Local on read.
    fn restore(&self, store: &TieredStore) -> Result<()> {
        store.clear()?;
        let primary = store.primary();
        for record in &self.records {
            primary.put(record)?;
        }

        for (tier, entries) in store.meta_tiers().into_iter().zip(&self.entries) {
            for key in tier.kv_keys("")? {
                tier.kv_remove(&key)?;
            }
            for (key, value) in entries {
                tier.kv_set(key, value)?;
            }
        }
        Ok(())
    }
}
