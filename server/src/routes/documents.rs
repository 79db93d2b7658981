//! Document endpoint routes.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{delete, get},
    Json, Router,
};
use tandem_engine::Record;

use crate::auth::AuthUser;
use crate::error::Result;
use crate::handlers::{
    handle_delete, handle_get, handle_put, handle_remove_all, parse_key, OwnerQuery,
    RemoveAllResponse,
};
use crate::AppState;

/// Create document routes.
pub fn routes() -> Router<AppState> {
    Router::new()
        .route(
            "/documents/{kind}/{id}",
            get(get_handler).put(put_handler).delete(delete_handler),
        )
        .route("/documents/{kind}", delete(remove_all_handler))
}

/// GET /documents/{kind}/{id} - Fetch one document.
async fn get_handler(
    State(state): State<AppState>,
    _auth: AuthUser,
    Path((kind, id)): Path<(String, String)>,
) -> Result<Json<Record>> {
    let key = parse_key(&kind, &id)?;
    Ok(Json(handle_get(&state.pool, &key).await?))
}

/// PUT /documents/{kind}/{id} - Store a document.
async fn put_handler(
    State(state): State<AppState>,
    _auth: AuthUser,
    Path((kind, id)): Path<(String, String)>,
    Json(record): Json<Record>,
) -> Result<Json<Record>> {
    let key = parse_key(&kind, &id)?;
    Ok(Json(handle_put(&state.pool, &key, record).await?))
}

/// DELETE /documents/{kind}/{id} - Delete one document.
async fn delete_handler(
    State(state): State<AppState>,
    _auth: AuthUser,
    Path((kind, id)): Path<(String, String)>,
) -> Result<StatusCode> {
    let key = parse_key(&kind, &id)?;
    handle_delete(&state.pool, &key).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// DELETE /documents/{kind}?ownerId=... - Delete one learner's documents.
async fn remove_all_handler(
    State(state): State<AppState>,
    _auth: AuthUser,
    Path(kind): Path<String>,
    Query(query): Query<OwnerQuery>,
) -> Result<Json<RemoveAllResponse>> {
    Ok(Json(handle_remove_all(&state.pool, &kind, query).await?))
}
