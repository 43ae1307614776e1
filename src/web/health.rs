//! `GET /__server_health__` (§6): DB ping + blob list-buckets.

use axum::extract::State;

use crate::error::{ControllerError, ControllerResult, Envelope};

use super::AppState;

pub async fn server_health(State(state): State<AppState>) -> ControllerResult<Envelope> {
    state
        .db
        .list_applications_page(1, 1)
        .await
        .map_err(|e| ControllerError::Upstream(format!("document store ping failed: {e}")))?;

    state
        .blob
        .list_buckets()
        .await
        .map_err(|e| ControllerError::Upstream(format!("blob store ping failed: {e}")))?;

    Ok(Envelope::ok(serde_json::json!({ "status": "ok" })))
}
