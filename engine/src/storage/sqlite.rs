use super::{MetaStore, QueueEntry, RecordTier};
use crate::{
    error::Result, EntityKind, Error, OfflineQueueItem, Payload, Record, RecordKey,
    SchemaVersion, Timestamp, Version,
};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, Row};
use std::path::Path;

/// Columns of a record row before the payload is decoded.
struct RawRecord {
    id: String,
    owner_id: String,
    payload: String,
    updated_at: i64,
    schema_version: i64,
}

/// Embedded SQLite store - the Local tier.
///
/// Layout: one table per entity kind keyed by id, `schema_versions`,
/// `offline_queue` keyed by an autoincrement sequence, `dead_letters`, a
/// single-row `backup_slot` and a `kv` table for legacy keys.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl std::fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore").finish_non_exhaustive()
    }
}

impl SqliteStore {
    /// Open or create a database file.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| Error::StorageUnavailable(e.to_string()))?;
            }
        }

        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        let conn = Connection::open_with_flags(path, flags)
            .map_err(|e| Error::StorageUnavailable(e.to_string()))?;
        conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;
            PRAGMA synchronous=NORMAL;
            PRAGMA busy_timeout=5000;
            "#,
        )
        .map_err(|e| Error::StorageUnavailable(e.to_string()))?;

        Self::with_connection(conn)
    }

    /// Open a private in-memory database.
    pub fn open_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().map_err(|e| Error::StorageUnavailable(e.to_string()))?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        Self::ensure_layout(&conn).map_err(|e| Error::StorageUnavailable(e.to_string()))?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn ensure_layout(conn: &Connection) -> rusqlite::Result<()> {
        for kind in EntityKind::ALL {
            let table = kind.table_name();
            conn.execute_batch(&format!(
                r#"
                CREATE TABLE IF NOT EXISTS {table} (
                    id TEXT PRIMARY KEY,
                    owner_id TEXT NOT NULL,
                    payload TEXT NOT NULL,
                    updated_at INTEGER NOT NULL,
                    schema_version INTEGER NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_{table}_owner ON {table}(owner_id);
                "#
            ))?;
        }

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS schema_versions (
                version INTEGER PRIMARY KEY,
                applied_at INTEGER NOT NULL,
                description TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS offline_queue (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                item TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS dead_letters (
                id TEXT PRIMARY KEY,
                item TEXT NOT NULL,
                dead_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS backup_slot (
                slot INTEGER PRIMARY KEY CHECK (slot = 1),
                created_at INTEGER NOT NULL,
                snapshot TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS kv (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );
            "#,
        )
    }

    fn record_from_row(row: &Row<'_>) -> rusqlite::Result<RawRecord> {
        Ok(RawRecord {
            id: row.get("id")?,
            owner_id: row.get("owner_id")?,
            payload: row.get("payload")?,
            updated_at: row.get("updated_at")?,
            schema_version: row.get("schema_version")?,
        })
    }

    fn decode(kind: EntityKind, raw: RawRecord) -> Result<Record> {
        let payload: Payload = serde_json::from_str(&raw.payload)?;
        if payload.kind() != kind {
            return Err(Error::KindMismatch {
                record: kind,
                payload: payload.kind(),
            });
        }
        Ok(Record {
            kind,
            id: raw.id,
            owner_id: raw.owner_id,
            payload,
            updated_at: raw.updated_at as Timestamp,
            schema_version: raw.schema_version as Version,
        })
    }

    fn query_kind(
        conn: &Connection,
        kind: EntityKind,
        filter: &str,
        args: &[&dyn rusqlite::ToSql],
    ) -> Result<Vec<Record>> {
        let sql = format!(
            "SELECT id, owner_id, payload, updated_at, schema_version FROM {} {} ORDER BY id",
            kind.table_name(),
            filter
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(args, Self::record_from_row)?;

        let mut records = Vec::new();
        for row in rows {
            records.push(Self::decode(kind, row?)?);
        }
        Ok(records)
    }
}

impl RecordTier for SqliteStore {
    fn tier_name(&self) -> &'static str {
        "local"
    }

    fn get(&self, key: &RecordKey) -> Result<Option<Record>> {
        let conn = self.conn.lock();
        let sql = format!(
            "SELECT id, owner_id, payload, updated_at, schema_version FROM {} WHERE id = ?1",
            key.kind.table_name()
        );
        let row = conn
            .query_row(&sql, params![key.id], Self::record_from_row)
            .optional()?;

        row.map(|r| Self::decode(key.kind, r)).transpose()
    }

    fn put(&self, record: &Record) -> Result<()> {
        let payload = serde_json::to_string(&record.payload)?;
        let conn = self.conn.lock();
        conn.execute(
            &format!(
                r#"
                INSERT INTO {} (id, owner_id, payload, updated_at, schema_version)
                VALUES (?1, ?2, ?3, ?4, ?5)
                ON CONFLICT(id) DO UPDATE SET
                    owner_id = excluded.owner_id,
                    payload = excluded.payload,
                    updated_at = excluded.updated_at,
                    schema_version = excluded.schema_version
                "#,
                record.kind.table_name()
            ),
            params![
                record.id,
                record.owner_id,
                payload,
                record.updated_at as i64,
                record.schema_version as i64
            ],
        )?;
        Ok(())
    }

    fn delete(&self, key: &RecordKey) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            &format!("DELETE FROM {} WHERE id = ?1", key.kind.table_name()),
            params![key.id],
        )?;
        Ok(())
    }

    fn scan(&self, kind: EntityKind, owner_id: &str) -> Result<Vec<Record>> {
        let conn = self.conn.lock();
        Self::query_kind(&conn, kind, "WHERE owner_id = ?1", &[&owner_id])
    }

    fn all(&self) -> Result<Vec<Record>> {
        let conn = self.conn.lock();
        let mut records = Vec::new();
        for kind in EntityKind::ALL {
            records.extend(Self::query_kind(&conn, kind, "", &[])?);
        }
        Ok(records)
    }

    fn clear(&self) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        for kind in EntityKind::ALL {
            tx.execute(&format!("DELETE FROM {}", kind.table_name()), [])?;
        }
        tx.commit()?;
        Ok(())
    }
}

impl MetaStore for SqliteStore {
    fn schema_history(&self) -> Result<Vec<SchemaVersion>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT version, applied_at, description FROM schema_versions ORDER BY version",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(SchemaVersion {
                version: row.get::<_, i64>(0)? as Version,
                applied_at: row.get::<_, i64>(1)? as Timestamp,
                description: row.get(2)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn record_schema_version(&self, version: &SchemaVersion) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR REPLACE INTO schema_versions (version, applied_at, description)
             VALUES (?1, ?2, ?3)",
            params![
                version.version as i64,
                version.applied_at as i64,
                version.description
            ],
        )?;
        Ok(())
    }

    fn queue_push(&self, item: &OfflineQueueItem) -> Result<u64> {
        let json = serde_json::to_string(item)?;
        let conn = self.conn.lock();
        conn.execute("INSERT INTO offline_queue (item) VALUES (?1)", params![json])?;
        Ok(conn.last_insert_rowid() as u64)
    }

    fn queue_update(&self, seq: u64, item: &OfflineQueueItem) -> Result<()> {
        let json = serde_json::to_string(item)?;
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE offline_queue SET item = ?1 WHERE seq = ?2",
            params![json, seq as i64],
        )?;
        Ok(())
    }

    fn queue_remove(&self, seq: u64) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute("DELETE FROM offline_queue WHERE seq = ?1", params![seq as i64])?;
        Ok(())
    }

    fn queue_load(&self) -> Result<Vec<QueueEntry>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT seq, item FROM offline_queue ORDER BY seq")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, i64>(0)? as u64, row.get::<_, String>(1)?))
        })?;

        let mut entries = Vec::new();
        for row in rows {
            let (seq, json) = row?;
            entries.push(QueueEntry {
                seq,
                item: serde_json::from_str(&json)?,
            });
        }
        Ok(entries)
    }

    fn dead_letter_push(&self, item: &OfflineQueueItem, at: Timestamp) -> Result<()> {
        let json = serde_json::to_string(item)?;
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR REPLACE INTO dead_letters (id, item, dead_at) VALUES (?1, ?2, ?3)",
            params![item.id, json, at as i64],
        )?;
        Ok(())
    }

    fn dead_letter_remove(&self, id: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute("DELETE FROM dead_letters WHERE id = ?1", params![id])?;
        Ok(())
    }

    fn dead_letters(&self) -> Result<Vec<OfflineQueueItem>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT item FROM dead_letters ORDER BY dead_at, id")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;

        let mut items = Vec::new();
        for row in rows {
            items.push(serde_json::from_str(&row?)?);
        }
        Ok(items)
    }

    fn save_backup(&self, snapshot_json: &str, created_at: Timestamp) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR REPLACE INTO backup_slot (slot, created_at, snapshot) VALUES (1, ?1, ?2)",
            params![created_at as i64, snapshot_json],
        )?;
        Ok(())
    }

    fn latest_backup(&self) -> Result<Option<String>> {
        let conn = self.conn.lock();
        Ok(conn
            .query_row("SELECT snapshot FROM backup_slot WHERE slot = 1", [], |row| {
                row.get(0)
            })
            .optional()?)
    }

    fn kv_get(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn.lock();
        Ok(conn
            .query_row("SELECT value FROM kv WHERE key = ?1", params![key], |row| {
                row.get(0)
            })
            .optional()?)
    }

    fn kv_set(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR REPLACE INTO kv (key, value) VALUES (?1, ?2)",
            params![key, value],
        )?;
        Ok(())
    }

    fn kv_remove(&self, key: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute("DELETE FROM kv WHERE key = ?1", params![key])?;
        Ok(())
    }

    fn kv_keys(&self, prefix: &str) -> Result<Vec<String>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT key FROM kv WHERE substr(key, 1, ?2) = ?1 ORDER BY key")?;
        let rows = stmt.query_map(params![prefix, prefix.chars().count() as i64], |row| row.get(0))?;
        Ok(rows.collect::<rusqlite::Result<Vec<String>>>()?)
    }
}
