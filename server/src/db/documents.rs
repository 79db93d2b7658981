//! Database operations for the documents table.

use sqlx::{PgPool, Row};
use tandem_engine::{EntityKind, Payload, Record, RecordKey};

/// A stored document row from the database.
#[derive(Debug)]
pub struct StoredDocument {
    pub kind: String,
    pub record_id: String,
    pub owner_id: String,
    pub payload: serde_json::Value,
    pub updated_at: i64,
    pub schema_version: i32,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for StoredDocument {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(StoredDocument {
            kind: row.try_get("kind")?,
            record_id: row.try_get("record_id")?,
            owner_id: row.try_get("owner_id")?,
            payload: row.try_get("payload")?,
            updated_at: row.try_get("updated_at")?,
            schema_version: row.try_get("schema_version")?,
        })
    }
}

impl StoredDocument {
    /// Convert a database row to an engine record.
    pub fn to_record(&self) -> Result<Record, tandem_engine::Error> {
        let kind: EntityKind = self.kind.parse()?;
        let payload: Payload = serde_json::from_value(self.payload.clone())?;
        if payload.kind() != kind {
            return Err(tandem_engine::Error::KindMismatch {
                record: kind,
                payload: payload.kind(),
            });
        }

        Ok(Record {
            kind,
            id: self.record_id.clone(),
            owner_id: self.owner_id.clone(),
            payload,
            updated_at: self.updated_at.max(0) as u64,
            schema_version: self.schema_version.max(0) as u32,
        })
    }
}

/// Insert or replace a document, stamping it with the server time.
///
/// The stored `updated_at` is `now`, or one past the previous value when the
/// previous value is not older, so every write to a document moves its
/// timestamp forward.
pub async fn upsert_document(
    pool: &PgPool,
    record: &Record,
    now: i64,
) -> Result<StoredDocument, sqlx::Error> {
    let payload = serde_json::to_value(&record.payload)
        .map_err(|e| sqlx::Error::Encode(Box::new(e)))?;

    sqlx::query_as::<_, StoredDocument>(
        r#"
        INSERT INTO documents (kind, record_id, owner_id, payload, updated_at, schema_version)
        VALUES ($1, $2, $3, $4, $5, $6)
        ON CONFLICT (kind, record_id) DO UPDATE SET
            owner_id = EXCLUDED.owner_id,
            payload = EXCLUDED.payload,
            updated_at = GREATEST(EXCLUDED.updated_at, documents.updated_at + 1),
            schema_version = EXCLUDED.schema_version
        RETURNING kind, record_id, owner_id, payload, updated_at, schema_version
        "#,
    )
    .bind(record.kind.as_str())
    .bind(&record.id)
    .bind(&record.owner_id)
    .bind(&payload)
    .bind(now)
    .bind(record.schema_version as i32)
    .fetch_one(pool)
    .await
}

/// Get a document by key.
pub async fn get_document(
    pool: &PgPool,
    key: &RecordKey,
) -> Result<Option<StoredDocument>, sqlx::Error> {
    sqlx::query_as::<_, StoredDocument>(
        r#"
        SELECT kind, record_id, owner_id, payload, updated_at, schema_version
        FROM documents
        WHERE kind = $1 AND record_id = $2
        "#,
    )
    .bind(key.kind.as_str())
    .bind(&key.id)
    .fetch_optional(pool)
    .await
}

/// Delete a document. Returns whether a row was removed.
pub async fn delete_document(pool: &PgPool, key: &RecordKey) -> Result<bool, sqlx::Error> {
    let result = sqlx::query("DELETE FROM documents WHERE kind = $1 AND record_id = $2")
        .bind(key.kind.as_str())
        .bind(&key.id)
        .execute(pool)
        .await?;

    Ok(result.rows_affected() > 0)
}

/// Delete every document of `kind` owned by `owner_id`.
pub async fn delete_owner_documents(
    pool: &PgPool,
    kind: EntityKind,
    owner_id: &str,
) -> Result<u64, sqlx::Error> {
    let result = sqlx::query("DELETE FROM documents WHERE kind = $1 AND owner_id = $2")
        .bind(kind.as_str())
        .bind(owner_id)
        .execute(pool)
        .await?;

    Ok(result.rows_affected())
}
