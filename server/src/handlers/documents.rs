//! Document handlers - the remote tier the engine syncs against.

use crate::db;
use crate::error::{AppError, Result};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use tandem_engine::{EntityKind, Record, RecordKey};

/// Query parameters for clearing an owner's documents.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OwnerQuery {
    pub owner_id: String,
}

/// Response for clearing an owner's documents.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoveAllResponse {
    /// Number of documents deleted
    pub removed: u64,
}

/// Parse the `{kind}/{id}` path segments into a key.
pub fn parse_key(kind: &str, id: &str) -> Result<RecordKey> {
    let kind: EntityKind = kind
        .parse()
        .map_err(|_| AppError::BadRequest(format!("unknown document kind: {kind}")))?;
    if id.trim().is_empty() {
        return Err(AppError::BadRequest("document id must not be empty".into()));
    }
    Ok(RecordKey::new(kind, id))
}

/// Fetch one document.
pub async fn handle_get(pool: &PgPool, key: &RecordKey) -> Result<Record> {
    let stored = db::get_document(pool, key)
        .await?
        .ok_or_else(|| AppError::NotFound(key.to_string()))?;
    Ok(stored.to_record()?)
}

/// Store a document and return it with its server-assigned timestamp.
pub async fn handle_put(pool: &PgPool, key: &RecordKey, record: Record) -> Result<Record> {
    if record.key() != *key {
        return Err(AppError::BadRequest(format!(
            "body holds {} but path names {key}",
            record.key()
        )));
    }
    record.validate()?;

    let now = chrono::Utc::now().timestamp_millis();
    let stored = db::upsert_document(pool, &record, now).await?;
    let stored = stored.to_record()?;

    tracing::debug!(
        key = %key,
        owner_id = %stored.owner_id,
        updated_at = stored.updated_at,
        "document stored"
    );
    Ok(stored)
}

/// Delete one document. Deleting a missing document succeeds.
pub async fn handle_delete(pool: &PgPool, key: &RecordKey) -> Result<()> {
    let removed = db::delete_document(pool, key).await?;
    tracing::debug!(key = %key, removed, "document delete");
    Ok(())
}

/// Delete every document of one kind owned by one learner.
pub async fn handle_remove_all(
    pool: &PgPool,
    kind: &str,
    query: OwnerQuery,
) -> Result<RemoveAllResponse> {
    let kind: EntityKind = kind
        .parse()
        .map_err(|_| AppError::BadRequest(format!("unknown document kind: {kind}")))?;
    if query.owner_id.trim().is_empty() {
        return Err(AppError::BadRequest("ownerId must not be empty".into()));
    }

    let removed = db::delete_owner_documents(pool, kind, &query.owner_id).await?;
    tracing::info!(%kind, owner_id = %query.owner_id, removed, "owner documents cleared");
    Ok(RemoveAllResponse { removed })
}
