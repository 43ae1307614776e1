//! `/settings/*` (§6): per-app config mutations, all implemented as a
//! read-modify-`replace_application` cycle so they emit the `Replace` event
//! the environment/function watchers already know how to react to.

use serde::Deserialize;

use crate::db::{AiConfig, CorsConfig, EnvVar, NotificationConfig};
use crate::error::{ControllerError, ControllerResult, Envelope};

use axum::extract::State;
use axum::Json;

use super::AppState;

async fn load_app(
    state: &AppState,
    app_id: &str,
) -> ControllerResult<crate::db::Application> {
    state
        .db
        .get_application(app_id)
        .await?
        .ok_or_else(|| ControllerError::NotFound(format!("application {app_id}")))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvAddRequest {
    pub app_id: String,
    pub key: String,
    pub value: String,
}

pub async fn env_add(
    State(state): State<AppState>,
    Json(req): Json<EnvAddRequest>,
) -> ControllerResult<Envelope> {
    let mut app = load_app(&state, &req.app_id).await?;
    if let Some(existing) = app.environment_variables.iter_mut().find(|e| e.key == req.key) {
        existing.value = req.value;
    } else {
        app.environment_variables.push(EnvVar {
            key: req.key,
            value: req.value,
        });
    }
    app.updated_at = chrono::Utc::now().timestamp();
    state.db.replace_application(&app).await?;
    Ok(Envelope::ok_empty())
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvRemoveRequest {
    pub app_id: String,
    pub key: String,
}

pub async fn env_remove(
    State(state): State<AppState>,
    Json(req): Json<EnvRemoveRequest>,
) -> ControllerResult<Envelope> {
    let mut app = load_app(&state, &req.app_id).await?;
    app.environment_variables.retain(|e| e.key != req.key);
    app.updated_at = chrono::Utc::now().timestamp();
    state.db.replace_application(&app).await?;
    Ok(Envelope::ok_empty())
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CorsUpdateRequest {
    pub app_id: String,
    pub cors: CorsConfig,
}

pub async fn cors_update(
    State(state): State<AppState>,
    Json(req): Json<CorsUpdateRequest>,
) -> ControllerResult<Envelope> {
    let mut app = load_app(&state, &req.app_id).await?;
    app.cors = req.cors;
    app.updated_at = chrono::Utc::now().timestamp();
    state.db.replace_application(&app).await?;
    Ok(Envelope::ok_empty())
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationUpdateRequest {
    pub app_id: String,
    pub notification: NotificationConfig,
}

pub async fn notification_update(
    State(state): State<AppState>,
    Json(req): Json<NotificationUpdateRequest>,
) -> ControllerResult<Envelope> {
    let mut app = load_app(&state, &req.app_id).await?;
    app.notification = req.notification;
    app.updated_at = chrono::Utc::now().timestamp();
    state.db.replace_application(&app).await?;
    Ok(Envelope::ok_empty())
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AiConfigUpdateRequest {
    pub app_id: String,
    pub ai: AiConfig,
}

pub async fn ai_config_update(
    State(state): State<AppState>,
    Json(req): Json<AiConfigUpdateRequest>,
) -> ControllerResult<Envelope> {
    let mut app = load_app(&state, &req.app_id).await?;
    app.ai = req.ai;
    app.updated_at = chrono::Utc::now().timestamp();
    state.db.replace_application(&app).await?;
    Ok(Envelope::ok_empty())
}
