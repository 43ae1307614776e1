//! `/applications/*` (§6): state-machine-gated lifecycle operations. Every
//! handler here only validates and writes intent — side effects happen in
//! the [`crate::worker::Worker`] that drains the tasks these handlers
//! insert (§4.1).

use axum::extract::State;
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::db::{AppStatus, Application, CorsConfig, NotificationConfig, AiConfig, Task, TaskAction};
use crate::error::{ControllerError, ControllerResult, Envelope};
use crate::db::model::generate_id;

use super::AppState;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateAppRequest {
    pub app_name: String,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateAppResponse {
    pub app_id: String,
    pub task_id: String,
}

pub async fn create(
    State(state): State<AppState>,
    Json(req): Json<CreateAppRequest>,
) -> ControllerResult<Envelope> {
    if req.app_name.trim().is_empty() {
        return Err(ControllerError::Validation("appName must not be empty".into()));
    }
    if state.db.get_application_by_name(&req.app_name).await?.is_some() {
        return Err(ControllerError::Conflict(format!(
            "application name '{}' already exists",
            req.app_name
        )));
    }

    let now = chrono::Utc::now().timestamp();
    let app = Application {
        app_id: generate_id(),
        app_name: req.app_name,
        db_password: generate_id(),
        description: req.description,
        users: Vec::new(),
        common_dependencies: Vec::new(),
        environment_variables: Vec::new(),
        cors: CorsConfig::default(),
        notification: NotificationConfig::default(),
        ai: AiConfig::default(),
        status: AppStatus::Starting,
        created_at: now,
        updated_at: now,
    };

    state.db.insert_application(&app).await?;
    let task = Task::new(TaskAction::StartApp, app.app_id.clone());
    state.db.insert_task(&task).await?;

    Ok(Envelope::ok(CreateAppResponse {
        app_id: app.app_id,
        task_id: task.task_id,
    }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppIdRequest {
    pub app_id: String,
}

/// Outcome of validating a requested transition against the current
/// `status` (§4.1's allowed-requests table).
enum Transition {
    /// Write this transitional status and enqueue the task.
    Proceed(AppStatus),
    /// Same action already in flight for this app; no-op success.
    AlreadyInFlight,
}

fn validate_transition(current: AppStatus, action: TaskAction) -> Result<Transition, ControllerError> {
    use AppStatus::*;
    use TaskAction::*;

    match (current, action) {
        (Stopped | Error, StartApp) => Ok(Transition::Proceed(Starting)),
        (Stopped | Error, DeleteApp) => Ok(Transition::Proceed(Deleting)),
        (Running, StopApp) => Ok(Transition::Proceed(Stopping)),
        (Running, RestartApp) => Ok(Transition::Proceed(Starting)),
        (Running, DeleteApp) => Ok(Transition::Proceed(Deleting)),
        (Starting, StartApp | RestartApp) => Ok(Transition::AlreadyInFlight),
        (Stopping, StopApp) => Ok(Transition::AlreadyInFlight),
        (Deleting, DeleteApp) => Ok(Transition::AlreadyInFlight),
        (other, action) => Err(ControllerError::Conflict(format!(
            "cannot {action} application in state {other}"
        ))),
    }
}

async fn request_transition(
    state: &AppState,
    app_id: &str,
    action: TaskAction,
) -> ControllerResult<Envelope> {
    let app = state
        .db
        .get_application(app_id)
        .await?
        .ok_or_else(|| ControllerError::NotFound(format!("application {app_id}")))?;

    match validate_transition(app.status, action)? {
        Transition::AlreadyInFlight => Ok(Envelope::ok_empty()),
        Transition::Proceed(transitional) => {
            state.db.update_application_status(app_id, transitional).await?;
            let task = Task::new(action, app_id.to_string());
            state.db.insert_task(&task).await?;
            Ok(Envelope::ok(serde_json::json!({ "taskId": task.task_id })))
        }
    }
}

pub async fn start(
    State(state): State<AppState>,
    Json(req): Json<AppIdRequest>,
) -> ControllerResult<Envelope> {
    request_transition(&state, &req.app_id, TaskAction::StartApp).await
}

pub async fn stop(
    State(state): State<AppState>,
    Json(req): Json<AppIdRequest>,
) -> ControllerResult<Envelope> {
    request_transition(&state, &req.app_id, TaskAction::StopApp).await
}

pub async fn restart(
    State(state): State<AppState>,
    Json(req): Json<AppIdRequest>,
) -> ControllerResult<Envelope> {
    request_transition(&state, &req.app_id, TaskAction::RestartApp).await
}

pub async fn delete(
    State(state): State<AppState>,
    Json(req): Json<AppIdRequest>,
) -> ControllerResult<Envelope> {
    request_transition(&state, &req.app_id, TaskAction::DeleteApp).await
}

#[derive(Debug, Deserialize)]
pub struct PageRequest {
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

pub async fn data(
    State(state): State<AppState>,
    Json(req): Json<PageRequest>,
) -> ControllerResult<Envelope> {
    let apps = state
        .db
        .list_applications_page(req.page, req.length.min(100))
        .await?;
    Ok(Envelope::ok(apps))
}

/// `update_description`/`update_dependencies` (§4.1): metadata-only
/// mutations. Unlike `start`/`stop`/`restart`/`delete` these don't touch
/// `status` or the task queue — they're a read-modify-`replace_application`
/// cycle, same shape as `web::settings`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateDescriptionRequest {
    pub app_id: String,
    pub description: Option<String>,
}

pub async fn update_description(
    State(state): State<AppState>,
    Json(req): Json<UpdateDescriptionRequest>,
) -> ControllerResult<Envelope> {
    let mut app = state
        .db
        .get_application(&req.app_id)
        .await?
        .ok_or_else(|| ControllerError::NotFound(format!("application {}", req.app_id)))?;
    app.description = req.description;
    app.updated_at = chrono::Utc::now().timestamp();
    state.db.replace_application(&app).await?;
    Ok(Envelope::ok_empty())
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateDependenciesRequest {
    pub app_id: String,
    pub common_dependencies: Vec<crate::db::DependencySpec>,
}

pub async fn update_dependencies(
    State(state): State<AppState>,
    Json(req): Json<UpdateDependenciesRequest>,
) -> ControllerResult<Envelope> {
    let mut app = state
        .db
        .get_application(&req.app_id)
        .await?
        .ok_or_else(|| ControllerError::NotFound(format!("application {}", req.app_id)))?;
    app.common_dependencies = req.common_dependencies;
    app.updated_at = chrono::Utc::now().timestamp();
    state.db.replace_application(&app).await?;
    Ok(Envelope::ok_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_allowed_from_stopped() {
        assert!(matches!(
            validate_transition(AppStatus::Stopped, TaskAction::StartApp),
            Ok(Transition::Proceed(AppStatus::Starting))
        ));
    }

    #[test]
    fn start_rejected_while_running() {
        assert!(validate_transition(AppStatus::Running, TaskAction::StartApp).is_err());
    }

    #[test]
    fn duplicate_start_while_starting_is_idempotent() {
        assert!(matches!(
            validate_transition(AppStatus::Starting, TaskAction::StartApp),
            Ok(Transition::AlreadyInFlight)
        ));
    }

    #[test]
    fn stop_rejected_while_stopping_with_a_different_action() {
        assert!(validate_transition(AppStatus::Stopping, TaskAction::DeleteApp).is_err());
    }

    #[test]
    fn delete_allowed_from_any_terminal_state() {
        for s in [AppStatus::Stopped, AppStatus::Error, AppStatus::Running] {
            assert!(matches!(
                validate_transition(s, TaskAction::DeleteApp),
                Ok(Transition::Proceed(AppStatus::Deleting))
            ));
        }
    }
}
