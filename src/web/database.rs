//! `/database/*` (§6, §8): collection management over the application's
//! dynamic database. Grounded on `server/routers/database.py`'s
//! `collections`/`create_collection`/`documents`/`delete_collection`/
//! `clear_collection` handlers, backed here by [`crate::db::DynamicDb`].

use serde::Deserialize;
use serde_json::Value;

use crate::db::DynamicDbError;
use crate::error::{ControllerError, ControllerResult, Envelope};

use axum::extract::State;
use axum::Json;

use super::AppState;

/// §8's "conflict code" testable property is a [`ControllerError::Conflict`]
/// here; everything else that can go wrong maps to its closest existing
/// envelope kind.
fn map_err(e: DynamicDbError) -> ControllerError {
    match e {
        DynamicDbError::NotFound(name) => ControllerError::NotFound(format!("collection {name}")),
        DynamicDbError::NotEmpty(name) => ControllerError::Conflict(format!(
            "cannot delete non-empty collection {name}, clear it first"
        )),
        DynamicDbError::InvalidName(name) => {
            ControllerError::Validation(format!("invalid collection name: {name}"))
        }
        DynamicDbError::Sqlite(_) | DynamicDbError::Serialization(_) => {
            ControllerError::Internal(e.to_string())
        }
    }
}

async fn owned_app(state: &AppState, app_id: &str) -> ControllerResult<crate::db::Application> {
    state
        .db
        .get_application(app_id)
        .await?
        .ok_or_else(|| ControllerError::NotFound(format!("application {app_id}")))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetCollectionsRequest {
    pub app_id: String,
}

pub async fn collections(
    State(state): State<AppState>,
    Json(req): Json<GetCollectionsRequest>,
) -> ControllerResult<Envelope> {
    let app = owned_app(&state, &req.app_id).await?;
    let names = state
        .dynamic_db
        .list_collections(&app.app_id_lc())
        .await
        .map_err(map_err)?;
    Ok(Envelope::ok(serde_json::json!({ "data": names })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateCollectionRequest {
    pub app_id: String,
    pub col_name: String,
}

pub async fn create_collection(
    State(state): State<AppState>,
    Json(req): Json<CreateCollectionRequest>,
) -> ControllerResult<Envelope> {
    let app = owned_app(&state, &req.app_id).await?;
    state
        .dynamic_db
        .create_collection(&app.app_id_lc(), &req.col_name)
        .await
        .map_err(map_err)?;
    Ok(Envelope::ok(
        serde_json::json!({ "collection_name": req.col_name }),
    ))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InsertDocumentRequest {
    pub app_id: String,
    pub col_name: String,
    pub doc_id: String,
    pub doc_data: Value,
}

pub async fn insert_document(
    State(state): State<AppState>,
    Json(req): Json<InsertDocumentRequest>,
) -> ControllerResult<Envelope> {
    let app = owned_app(&state, &req.app_id).await?;
    state
        .dynamic_db
        .insert_document(&app.app_id_lc(), &req.col_name, &req.doc_id, &req.doc_data)
        .await
        .map_err(map_err)?;
    Ok(Envelope::ok_empty())
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetCollectionDocumentsRequest {
    pub app_id: String,
    pub col_name: String,
    #[serde(default = "default_page")]
    pub page: u32,
    #[serde(default = "default_length")]
    pub length: u32,
}

fn default_page() -> u32 {
    1
}

fn default_length() -> u32 {
    25
}

pub async fn documents(
    State(state): State<AppState>,
    Json(req): Json<GetCollectionDocumentsRequest>,
) -> ControllerResult<Envelope> {
    let app = owned_app(&state, &req.app_id).await?;
    let length = req.length.clamp(1, 100);
    let (docs, total) = state
        .dynamic_db
        .list_documents(&app.app_id_lc(), &req.col_name, req.page.max(1), length)
        .await
        .map_err(map_err)?;
    let page_num = (total as f64 / length as f64).ceil() as i64;
    Ok(Envelope::ok(serde_json::json!({
        "data": docs,
        "pageNum": page_num,
        "pageSize": length,
        "total": total,
    })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClearCollectionRequest {
    pub app_id: String,
    pub col_name: String,
}

pub async fn clear_collection(
    State(state): State<AppState>,
    Json(req): Json<ClearCollectionRequest>,
) -> ControllerResult<Envelope> {
    let app = owned_app(&state, &req.app_id).await?;
    state
        .dynamic_db
        .clear_collection(&app.app_id_lc(), &req.col_name)
        .await
        .map_err(map_err)?;
    Ok(Envelope::ok_empty())
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteCollectionRequest {
    pub app_id: String,
    pub col_name: String,
}

/// `/database/delete_collection` (§6, §8): refuses with a conflict envelope
/// when the collection still holds documents, without dropping anything.
pub async fn delete_collection(
    State(state): State<AppState>,
    Json(req): Json<DeleteCollectionRequest>,
) -> ControllerResult<Envelope> {
    let app = owned_app(&state, &req.app_id).await?;
    state
        .dynamic_db
        .delete_collection(&app.app_id_lc(), &req.col_name)
        .await
        .map_err(map_err)?;
    Ok(Envelope::ok_empty())
}
