//! Scheduler (§4.5, §6 `/scheduler/*`): CRON/interval `ScheduledTask`s
//! dispatched to the owning application's runtime container. Grounded on
//! `cron::scheduler::JobScheduler`'s one-task-per-job pattern (job, handle,
//! cancellation), generalized from an in-process interval callback to an
//! HTTP dispatch against a per-app runtime, and enriched with the real
//! `cron` crate for 5-field expression parsing, which the teacher's job
//! scheduler never needed since it only ran fixed intervals.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use cron::Schedule;
use dashmap::DashMap;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::db::{Db, DbError, ScheduledTask, TriggerKind};
use crate::proxy::{ContainerStarter, ProxyError};

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("invalid cron expression {0:?}: {1}")]
    InvalidCron(String, String),

    #[error("invalid interval {0:?}")]
    InvalidInterval(String),

    #[error(transparent)]
    Db(#[from] DbError),

    #[error("failed to bring up runtime container: {0}")]
    StartFailed(#[from] ProxyError),

    #[error("dispatch request failed: {0}")]
    Dispatch(#[from] reqwest::Error),

    #[error("scheduled task not found: {0}")]
    NotFound(String),
}

pub type SchedulerResult<T> = Result<T, SchedulerError>;

/// One running job per `ScheduledTask`, keyed by `task_id` so `upsert`/
/// `delete` can cancel and (for upsert) respawn it without touching any
/// other task's timer.
pub struct Scheduler {
    db: Arc<Db>,
    starter: Arc<dyn ContainerStarter>,
    client: reqwest::Client,
    runtime_port: u16,
    jobs: DashMap<String, CancellationToken>,
}

impl Scheduler {
    pub fn new(
        db: Arc<Db>,
        starter: Arc<dyn ContainerStarter>,
        client: reqwest::Client,
        runtime_port: u16,
    ) -> Self {
        Self {
            db,
            starter,
            client,
            runtime_port,
            jobs: DashMap::new(),
        }
    }

    /// Loads every enabled `ScheduledTask` and spawns its job. Called once
    /// at controller boot.
    pub async fn boot(self: &Arc<Self>) -> SchedulerResult<()> {
        let tasks = self.db.list_enabled_scheduled_tasks().await?;
        info!(count = tasks.len(), "scheduler boot: loading enabled tasks");
        for task in tasks {
            self.spawn_job(task);
        }
        Ok(())
    }

    /// (Re)starts the job for one task: cancels any existing timer for this
    /// `task_id` and, if the task is `enabled`, spawns a fresh one reading
    /// the current `trigger`/`trigger_config`. Called after `/scheduler/upsert`
    /// writes the record.
    pub async fn reload(self: &Arc<Self>, task_id: &str) -> SchedulerResult<()> {
        self.cancel_job(task_id);
        let task = self
            .db
            .get_scheduled_task(task_id)
            .await?
            .ok_or_else(|| SchedulerError::NotFound(task_id.to_string()))?;
        if task.enabled {
            self.spawn_job(task);
        }
        Ok(())
    }

    /// Cancels the job for a deleted task. Called after `/scheduler/delete`
    /// removes the record.
    pub fn remove(&self, task_id: &str) {
        self.cancel_job(task_id);
    }

    fn cancel_job(&self, task_id: &str) {
        if let Some((_, token)) = self.jobs.remove(task_id) {
            token.cancel();
        }
    }

    fn spawn_job(self: &Arc<Self>, task: ScheduledTask) {
        let token = CancellationToken::new();
        self.jobs.insert(task.task_id.clone(), token.clone());
        let this = Arc::clone(self);
        tokio::spawn(async move {
            this.run_job(task, token).await;
        });
    }

    async fn run_job(self: Arc<Self>, task: ScheduledTask, cancel: CancellationToken) {
        loop {
            let wait = match next_fire_delay(&task) {
                Ok(d) => d,
                Err(e) => {
                    warn!(task_id = %task.task_id, error = %e, "scheduled task has an invalid trigger, not rescheduling");
                    return;
                }
            };

            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(task_id = %task.task_id, "scheduled job cancelled");
                    return;
                }
                _ = tokio::time::sleep(wait) => {}
            }

            if let Err(e) = self.dispatch(&task).await {
                warn!(task_id = %task.task_id, app_id = %task.app_id, error = %e, "scheduled dispatch failed");
            }

            // interval triggers repeat on a fixed period from this job loop;
            // cron triggers recompute their next fire time from "now" each
            // pass, so both converge on the same loop shape.
        }
    }

    /// Dispatches one invocation immediately, bypassing its normal trigger
    /// (`/scheduler/trigger`, §6).
    pub async fn trigger_now(&self, task_id: &str) -> SchedulerResult<serde_json::Value> {
        let task = self
            .db
            .get_scheduled_task(task_id)
            .await?
            .ok_or_else(|| SchedulerError::NotFound(task_id.to_string()))?;
        self.dispatch(&task).await
    }

    async fn dispatch(&self, task: &ScheduledTask) -> SchedulerResult<serde_json::Value> {
        let started = self.starter.ensure_started(&task.app_id).await?;
        let url = format!(
            "http://{}:{}/{}",
            started.container_name, self.runtime_port, task.function_id
        );

        let mut req = self.client.post(&url).json(&task.body);
        if let serde_json::Value::Object(params) = &task.params {
            req = req.query(params);
        }

        let resp = req.send().await?;
        let status = resp.status();
        let body: serde_json::Value = resp.json().await.unwrap_or(serde_json::Value::Null);
        info!(task_id = %task.task_id, app_id = %task.app_id, %status, "scheduled task dispatched");
        Ok(body)
    }
}

/// Computes how long to sleep before the next dispatch. Interval triggers
/// are a fixed period; cron triggers recompute the next occurrence from the
/// current time, which also makes a cron job self-correcting if the process
/// was paused (e.g. suspended VM) past an occurrence — it fires once for
/// "now" and resumes on the following occurrence, rather than firing a
/// backlog of missed ticks.
fn next_fire_delay(task: &ScheduledTask) -> SchedulerResult<Duration> {
    match task.trigger {
        TriggerKind::Interval => {
            let secs: u64 = task
                .trigger_config
                .trim()
                .parse()
                .map_err(|_| SchedulerError::InvalidInterval(task.trigger_config.clone()))?;
            Ok(Duration::from_secs(secs.max(1)))
        }
        TriggerKind::Cron => {
            let schedule = parse_cron(&task.trigger_config)?;
            let now = Utc::now();
            let next = schedule
                .after(&now)
                .next()
                .ok_or_else(|| SchedulerError::InvalidCron(task.trigger_config.clone(), "no upcoming occurrence".into()))?;
            let delay = (next - now).to_std().unwrap_or(Duration::from_secs(0));
            Ok(delay)
        }
    }
}

/// The `cron` crate requires a leading seconds field; this spec's
/// `trigger_config` follows the conventional 5-field crontab format
/// (minute hour day-of-month month day-of-week), so a `"0 "` seconds field
/// is prepended before parsing.
fn parse_cron(expr: &str) -> SchedulerResult<Schedule> {
    let fields = expr.split_whitespace().count();
    let normalized = if fields == 5 {
        format!("0 {expr}")
    } else {
        expr.to_string()
    };
    Schedule::from_str(&normalized).map_err(|e| SchedulerError::InvalidCron(expr.to_string(), e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn task(trigger: TriggerKind, config: &str) -> ScheduledTask {
        ScheduledTask {
            task_id: "t1".into(),
            app_id: "app1".into(),
            function_id: "f1".into(),
            trigger,
            trigger_config: config.to_string(),
            params: json!({}),
            body: json!({}),
            enabled: true,
            is_system_task: false,
            created_at: 0,
            updated_at: 0,
        }
    }

    #[test]
    fn interval_delay_matches_configured_seconds() {
        let t = task(TriggerKind::Interval, "45");
        let delay = next_fire_delay(&t).unwrap();
        assert_eq!(delay, Duration::from_secs(45));
    }

    #[test]
    fn invalid_interval_is_rejected() {
        let t = task(TriggerKind::Interval, "not-a-number");
        assert!(next_fire_delay(&t).is_err());
    }

    #[test]
    fn five_field_cron_expression_parses() {
        // every minute
        let t = task(TriggerKind::Cron, "* * * * *");
        assert!(next_fire_delay(&t).is_ok());
    }

    #[test]
    fn malformed_cron_expression_is_rejected() {
        let t = task(TriggerKind::Cron, "not a cron expr");
        assert!(next_fire_delay(&t).is_err());
    }
}
