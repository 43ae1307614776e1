//! Task Queue & Worker (§4.1): a durable intent log with at-least-once
//! execution. Grounded on `manager.rs`'s boot-time reconciliation sweep and
//! `system::Locker` for per-resource mutual exclusion, generalized from
//! "one locker per server" to "one locker per app_id", keyed in a
//! `DashMap` the way `Manager::servers` keys its registry.

use std::sync::Arc;

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::db::{Collection, Db, DbError, Operation, Task, TaskAction, TaskStatus};
use crate::orchestrator::Orchestrator;
use crate::system::Locker;

/// Boot-time drain + steady-state dispatch of [`Task`]s, serialized per
/// `app_id` so e.g. a `start_app` and a racing `delete_app` for the same
/// application never run concurrently.
pub struct Worker {
    db: Arc<Db>,
    orchestrator: Arc<Orchestrator>,
    lockers: DashMap<String, Arc<Locker>>,
}

impl Worker {
    pub fn new(db: Arc<Db>, orchestrator: Arc<Orchestrator>) -> Self {
        Self {
            db,
            orchestrator,
            lockers: DashMap::new(),
        }
    }

    fn locker_for(&self, app_id: &str) -> Arc<Locker> {
        self.lockers
            .entry(app_id.to_string())
            .or_insert_with(|| Arc::new(Locker::new()))
            .clone()
    }

    /// Boot sequence (§4.1): drain pending tasks, retry tasks that failed
    /// mid-flight on a previous run, then reconcile any application the
    /// store still records as `running` but whose container isn't actually
    /// live (crash recovery for a process that died between "container up"
    /// and "status persisted").
    pub async fn boot(self: &Arc<Self>) -> Result<(), DbError> {
        info!("worker boot: draining pending tasks");
        let pending = self.db.list_tasks_by_status(TaskStatus::Pending).await?;
        for task in pending {
            self.spawn_task(task);
        }

        info!("worker boot: retrying failed start_app tasks");
        let failed_starts = self.db.list_failed_start_app_tasks().await?;
        for task in failed_starts {
            self.spawn_task(task);
        }

        self.reconcile_running_without_container().await?;
        Ok(())
    }

    async fn reconcile_running_without_container(&self) -> Result<(), DbError> {
        let live = match self.orchestrator.live_container_names().await {
            Ok(names) => names,
            Err(e) => {
                warn!(error = %e, "failed to list live containers during boot reconciliation");
                return Ok(());
            }
        };
        let running_apps = self
            .db
            .list_applications_by_status(crate::db::AppStatus::Running)
            .await?;
        for app in running_apps {
            if !live.contains(&app.container_name()) {
                warn!(app_id = %app.app_id, "application recorded running but container is not live, re-enqueueing start");
                let task = Task::new(TaskAction::StartApp, app.app_id.clone());
                self.db.insert_task(&task).await?;
            }
        }
        Ok(())
    }

    /// Subscribes to the change feed and dispatches every newly-inserted
    /// task, until `cancel` fires.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut rx = self.db.change_feed().subscribe();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("worker stopping");
                    return;
                }
                event = rx.recv() => {
                    let event = match event {
                        Ok(e) => e,
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                            warn!(skipped = n, "worker lagged behind change feed");
                            continue;
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
                    };
                    if event.collection != Collection::Tasks || event.operation != Operation::Insert {
                        continue;
                    }
                    match self.db.get_task(&event.id).await {
                        Ok(Some(task)) if task.status == TaskStatus::Pending => {
                            self.spawn_task(task);
                        }
                        Ok(_) => {}
                        Err(e) => warn!(task_id = %event.id, error = %e, "failed to load newly-inserted task"),
                    }
                }
            }
        }
    }

    fn spawn_task(self: &Arc<Self>, task: Task) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            this.process_task(task).await;
        });
    }

    async fn process_task(&self, task: Task) {
        let app_id = task.payload.app_id.clone();
        let locker = self.locker_for(&app_id);
        let _guard = locker.acquire().await;

        // Another worker tick (or a previous run before a crash) may have
        // already finished this task by the time we get the lock.
        let current = match self.db.get_task(&task.task_id).await {
            Ok(Some(t)) => t,
            Ok(None) => return,
            Err(e) => {
                error!(task_id = %task.task_id, error = %e, "failed to reload task before execution");
                return;
            }
        };
        if current.status != TaskStatus::Pending {
            return;
        }

        if let Err(e) = self
            .db
            .update_task_status(&task.task_id, TaskStatus::Running, None)
            .await
        {
            error!(task_id = %task.task_id, error = %e, "failed to mark task running");
            return;
        }

        let outcome = self.execute(&task).await;

        let (status, result) = match outcome {
            Ok(value) => (TaskStatus::Success, Some(value)),
            Err(e) => {
                warn!(task_id = %task.task_id, app_id, action = %task.action, error = %e, "task execution failed");
                (
                    TaskStatus::Failed,
                    Some(serde_json::json!({ "error": e.to_string() })),
                )
            }
        };

        if let Err(e) = self
            .db
            .update_task_status(&task.task_id, status, result)
            .await
        {
            error!(task_id = %task.task_id, error = %e, "failed to persist task completion");
        }
    }

    async fn execute(
        &self,
        task: &Task,
    ) -> Result<serde_json::Value, crate::orchestrator::OrchestratorError> {
        let app = self.db.get_application(&task.payload.app_id).await?;

        // delete_app must tolerate a missing Application: a prior run of the
        // same task (or a racing duplicate) may have already removed the
        // document before crashing partway through resource cleanup (§4.1).
        let Some(app) = app else {
            if task.action == TaskAction::DeleteApp {
                return Ok(serde_json::json!({}));
            }
            return Err(crate::orchestrator::OrchestratorError::NotFound(
                task.payload.app_id.clone(),
            ));
        };

        match task.action {
            TaskAction::StartApp => {
                self.db
                    .update_application_status(&app.app_id, crate::db::AppStatus::Starting)
                    .await?;
                let running = match self.orchestrator.start_app(&app).await {
                    Ok(running) => running,
                    Err(e) => {
                        // §4.1: "On start_app failure the Application is
                        // transitioned to error." Best-effort: the task's
                        // own failure still wins if this write also fails.
                        if let Err(write_err) = self
                            .db
                            .update_application_status(&app.app_id, crate::db::AppStatus::Error)
                            .await
                        {
                            warn!(app_id = %app.app_id, error = %write_err, "failed to record error status after start_app failure");
                        }
                        return Err(e);
                    }
                };
                self.db
                    .update_application_status(&app.app_id, crate::db::AppStatus::Running)
                    .await?;
                Ok(serde_json::json!({ "container_name": running.container_name }))
            }
            TaskAction::StopApp => {
                self.db
                    .update_application_status(&app.app_id, crate::db::AppStatus::Stopping)
                    .await?;
                self.orchestrator.stop_app(&app).await?;
                self.db
                    .update_application_status(&app.app_id, crate::db::AppStatus::Stopped)
                    .await?;
                Ok(serde_json::json!({}))
            }
            TaskAction::RestartApp => {
                self.db
                    .update_application_status(&app.app_id, crate::db::AppStatus::Starting)
                    .await?;
                let running = match self.orchestrator.restart_app(&app).await {
                    Ok(running) => running,
                    Err(e) => {
                        if let Err(write_err) = self
                            .db
                            .update_application_status(&app.app_id, crate::db::AppStatus::Error)
                            .await
                        {
                            warn!(app_id = %app.app_id, error = %write_err, "failed to record error status after restart_app failure");
                        }
                        return Err(e);
                    }
                };
                self.db
                    .update_application_status(&app.app_id, crate::db::AppStatus::Running)
                    .await?;
                Ok(serde_json::json!({ "container_name": running.container_name }))
            }
            TaskAction::DeleteApp => {
                self.db
                    .update_application_status(&app.app_id, crate::db::AppStatus::Deleting)
                    .await?;
                self.orchestrator.delete_app(&app).await?;
                Ok(serde_json::json!({}))
            }
        }
    }
}
