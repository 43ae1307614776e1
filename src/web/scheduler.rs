//! `/scheduler/*` (§6): CRUD over `ScheduledTask` plus an immediate-dispatch
//! `trigger` endpoint. Persistence goes through [`crate::db::Db`]; the
//! actual timers live in [`crate::scheduler::Scheduler`], reloaded here
//! after every write so the running job set stays in sync with the store.

use serde::Deserialize;

use crate::db::model::generate_id;
use crate::db::{FunctionType, ScheduledTask, TriggerKind};
use crate::error::{ControllerError, ControllerResult, Envelope};

use axum::extract::State;
use axum::Json;

use super::AppState;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetRequest {
    #[serde(default)]
    pub task_id: Option<String>,
    #[serde(default)]
    pub app_id: Option<String>,
}

pub async fn get(
    State(state): State<AppState>,
    Json(req): Json<GetRequest>,
) -> ControllerResult<Envelope> {
    if let Some(task_id) = req.task_id {
        let task = state
            .db
            .get_scheduled_task(&task_id)
            .await?
            .ok_or_else(|| ControllerError::NotFound(format!("scheduled task {task_id}")))?;
        return Ok(Envelope::ok(task));
    }
    if let Some(app_id) = req.app_id {
        let tasks = state.db.list_scheduled_tasks_by_app(&app_id).await?;
        return Ok(Envelope::ok(tasks));
    }
    Err(ControllerError::Validation(
        "either taskId or appId is required".into(),
    ))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpsertRequest {
    #[serde(default)]
    pub task_id: Option<String>,
    pub app_id: String,
    pub function_id: String,
    pub trigger: TriggerKind,
    pub trigger_config: String,
    #[serde(default)]
    pub params: serde_json::Value,
    #[serde(default)]
    pub body: serde_json::Value,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

pub async fn upsert(
    State(state): State<AppState>,
    Json(req): Json<UpsertRequest>,
) -> ControllerResult<Envelope> {
    let function = state
        .db
        .get_function(&req.function_id)
        .await?
        .ok_or_else(|| ControllerError::NotFound(format!("function {}", req.function_id)))?;
    if function.app_id != req.app_id {
        return Err(ControllerError::NotFound(format!("function {}", req.function_id)));
    }
    // common functions may not have scheduled tasks (§3).
    if function.function_type == FunctionType::Common {
        return Err(ControllerError::Validation(
            "common functions may not have scheduled tasks".into(),
        ));
    }

    let now = chrono::Utc::now().timestamp();
    let task_id = req.task_id.clone().unwrap_or_else(generate_id);
    let created_at = match &req.task_id {
        Some(id) => match state.db.get_scheduled_task(id).await? {
            Some(existing) => existing.created_at,
            None => now,
        },
        None => now,
    };

    let task = ScheduledTask {
        task_id: task_id.clone(),
        app_id: req.app_id,
        function_id: req.function_id,
        trigger: req.trigger,
        trigger_config: req.trigger_config,
        params: req.params,
        body: req.body,
        enabled: req.enabled,
        is_system_task: false,
        created_at,
        updated_at: now,
    };

    state.db.upsert_scheduled_task(&task).await?;
    state
        .scheduler
        .reload(&task_id)
        .await
        .map_err(|e| ControllerError::Internal(e.to_string()))?;

    Ok(Envelope::ok(serde_json::json!({ "taskId": task_id })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskIdRequest {
    pub task_id: String,
}

pub async fn delete(
    State(state): State<AppState>,
    Json(req): Json<TaskIdRequest>,
) -> ControllerResult<Envelope> {
    state.db.delete_scheduled_task(&req.task_id).await?;
    state.scheduler.remove(&req.task_id);
    Ok(Envelope::ok_empty())
}

pub async fn trigger(
    State(state): State<AppState>,
    Json(req): Json<TaskIdRequest>,
) -> ControllerResult<Envelope> {
    let result = state
        .scheduler
        .trigger_now(&req.task_id)
        .await
        .map_err(|e| ControllerError::Internal(e.to_string()))?;
    Ok(Envelope::ok(result))
}
