//! # Tandem Engine
//!
//! The data synchronization and migration engine behind the Tandem language
//! learning app.
//!
//! The engine keeps learner state (profile, progress, spaced-repetition items,
//! daily analytics, challenges and achievements) consistent across three tiers
//! while the device is intermittently offline:
//!
//! - **Local** - an embedded SQLite store, the authoritative tier on the device
//! - **Cache** - an in-memory key-value mirror used as a fallback read path
//! - **Remote** - a cloud document store, the system of record when online
//!
//! ## Core Concepts
//!
//! ### Records
//!
//! Every entity is stored as a [`Record`]: a `(kind, id)` identity, the owning
//! learner, a typed [`Payload`], the last-update timestamp and the schema
//! version it was written under. For a given `(kind, id)` a tier holds at most
//! one record; writes replace, never append.
//!
//! ### Schema migrations
//!
//! The [`SchemaMigrator`] runs ordered, idempotent [`Migration`] steps once at
//! startup, before any other operation is permitted.
//!
//! ### Offline queue
//!
//! Writes that cannot reach the remote tier are recorded in the persisted
//! [`OfflineQueue`] and applied later, in per-entity FIFO order. Items that
//! keep failing are moved to a dead-letter list instead of being dropped.
//!
//! ### Sync
//!
//! The [`SyncCoordinator`] drains the queue and reconciles the local and remote
//! tiers with last-writer-wins on `updatedAt` (see [`reconcile`]).
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use tandem_engine::{
//!     EngineConfig, EntityKind, LearningProgress, MemoryRemote, Payload, SyncEngine,
//! };
//!
//! # async fn run() -> tandem_engine::Result<()> {
//! let remote = Arc::new(MemoryRemote::new());
//! let engine = SyncEngine::builder(EngineConfig::default(), remote).build();
//! engine.initialize().await?;
//!
//! let progress = Payload::Progress(LearningProgress::new("es"));
//! engine
//!     .save(EntityKind::Progress, "progress-es", "learner-1", progress)
//!     .await?;
//!
//! let record = engine.get(EntityKind::Progress, "progress-es")?;
//! assert!(record.is_some());
//!
//! engine.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod backup;
pub mod clock;
pub mod config;
pub mod connectivity;
pub mod engine;
pub mod error;
pub mod migrations;
pub mod payload;
pub mod queue;
pub mod reconcile;
pub mod record;
pub mod remote;
pub mod schema;
pub mod storage;
pub mod sync;

// Re-export main types at crate root
pub use backup::{BackupManager, BackupSnapshot, RestoreSummary, BACKUP_FORMAT_VERSION};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ConfigError, EngineConfig};
pub use connectivity::{ConnectivityObserver, ManualConnectivity, ProbeConnectivity};
pub use engine::{SyncEngine, SyncEngineBuilder};
pub use error::Error;
pub use payload::{
    Achievement, AnalyticsDay, Challenge, LearningProgress, Payload, SrsItem, UserProfile,
};
pub use queue::{DrainReport, OfflineQueue, OfflineQueueItem, QueueOperation, DEFAULT_RETRY_CAP};
pub use reconcile::{resolve, Resolution};
pub use record::{EntityKind, Record, RecordKey};
pub use remote::{
    HttpRemote, MemoryRemote, RemoteCallback, RemoteError, RemoteStore, Subscription,
};
pub use schema::{
    Migration, MigrationContext, MigrationOutcome, MigrationResult, SchemaMigrator, SchemaVersion,
};
pub use storage::{LocalStore, MemoryStore, MetaStore, RecordTier, SqliteStore, TieredStore};
pub use sync::{ReconcileReport, SyncCoordinator, SyncReport, SyncState, SyncTrigger};

/// Type aliases for clarity
pub type RecordId = String;
pub type OwnerId = String;
pub type Timestamp = u64;
pub type Version = u32;

/// Schema version written by this build of the engine.
pub const CURRENT_SCHEMA_VERSION: Version = 2;

// Result type used across the crate.
pub use error::Result;
