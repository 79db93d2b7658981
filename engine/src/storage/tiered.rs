use super::{LocalStore, MemoryStore, MetaStore, RecordTier, SqliteStore};
use crate::{error::Result, EntityKind, Record, RecordKey};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, warn};

/// The Local and Cache tiers behind one read/write path.
///
/// Reads go to Local first and fall back to Cache; a Local hit refreshes the
/// Cache. Writes are validated, then applied to Local, then mirrored to Cache.
/// Without a Local tier the store runs degraded: the Cache serves every read
/// and write, and the engine metadata lives in memory only.
pub struct TieredStore {
    local: Option<Arc<dyn LocalStore>>,
    cache: Arc<MemoryStore>,
}

impl std::fmt::Debug for TieredStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TieredStore")
            .field("degraded", &self.is_degraded())
            .field("cached", &self.cache.len())
            .finish()
    }
}

impl TieredStore {
    /// Combine an explicit Local tier (or none) with a Cache tier.
    pub fn new(local: Option<Arc<dyn LocalStore>>, cache: Arc<MemoryStore>) -> Self {
        Self { local, cache }
    }

    /// Open the embedded store at `path` (in-memory when `None`).
    ///
    /// An embedded store that cannot be opened is not fatal: a warning is
    /// logged and the store runs cache-only.
    pub fn open(path: Option<&Path>) -> Self {
        let opened = match path {
            Some(path) => SqliteStore::open(path),
            None => SqliteStore::open_in_memory(),
        };

        let local: Option<Arc<dyn LocalStore>> = match opened {
            Ok(store) => Some(Arc::new(store)),
            Err(err) => {
                warn!(error = %err, "embedded store unavailable, running cache-only");
                None
            }
        };

        Self::new(local, Arc::new(MemoryStore::new()))
    }

    /// A cache-only store.
    pub fn degraded() -> Self {
        Self::new(None, Arc::new(MemoryStore::new()))
    }

    /// True when no Local tier is available.
    pub fn is_degraded(&self) -> bool {
        self.local.is_none()
    }

    /// The Cache tier.
    pub fn cache(&self) -> &MemoryStore {
        &self.cache
    }

    /// The tier holding durable records: Local, or Cache when degraded.
    pub fn primary(&self) -> &dyn RecordTier {
        match &self.local {
            Some(local) => local.as_records(),
            None => self.cache.as_ref(),
        }
    }

    /// Metadata of the primary tier.
    pub fn meta(&self) -> &dyn MetaStore {
        match &self.local {
            Some(local) => local.as_meta(),
            None => self.cache.as_ref(),
        }
    }

    /// Every distinct metadata store, Local first.
    pub fn meta_tiers(&self) -> Vec<&dyn MetaStore> {
        let mut tiers: Vec<&dyn MetaStore> = Vec::with_capacity(2);
        if let Some(local) = &self.local {
            tiers.push(local.as_meta());
        }
        tiers.push(self.cache.as_ref());
        tiers
    }

    pub fn get(&self, key: &RecordKey) -> Result<Option<Record>> {
        if let Some(local) = &self.local {
            match local.get(key) {
                Ok(Some(record)) => {
                    self.cache.put(&record)?;
                    return Ok(Some(record));
                }
                Ok(None) => {}
                Err(err) => {
                    warn!(%key, error = %err, "local read failed, falling back to cache");
                }
            }
        }

        let cached = self.cache.get(key)?;
        if cached.is_some() {
            debug!(%key, "served from cache");
        }
        Ok(cached)
    }

    pub fn put(&self, record: &Record) -> Result<()> {
        record.validate()?;
        if let Some(local) = &self.local {
            local.put(record)?;
        }
        self.cache.put(record)
    }

    pub fn delete(&self, key: &RecordKey) -> Result<()> {
        if let Some(local) = &self.local {
            local.delete(key)?;
        }
        self.cache.delete(key)
    }

    pub fn scan(&self, kind: EntityKind, owner_id: &str) -> Result<Vec<Record>> {
        self.primary().scan(kind, owner_id)
    }

    pub fn all(&self) -> Result<Vec<Record>> {
        self.primary().all()
    }

    /// Empty both tiers.
    pub fn clear(&self) -> Result<()> {
        if let Some(local) = &self.local {
            local.clear()?;
        }
        self.cache.clear()
    }
}
