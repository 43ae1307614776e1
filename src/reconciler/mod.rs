//! Status Reconciler (§4.4): a periodic sweep that reconciles observed
//! container health against `Application.status`, independent of whatever
//! the in-memory orchestrator registry believes. Grounded on
//! `manager.rs`'s periodic `sync_all_statuses`/`report_all_statuses` sweep,
//! generalized from "poll the panel" to "poll Docker and write sqlite".

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::db::{AppStatus, Application, Db};
use crate::orchestrator::{ContainerHealth, Orchestrator};

/// Interval between sweeps. Reference: 30s (§4.4).
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(30);

pub struct Reconciler {
    db: Arc<Db>,
    orchestrator: Arc<Orchestrator>,
    interval: Duration,
}

impl Reconciler {
    pub fn new(db: Arc<Db>, orchestrator: Arc<Orchestrator>) -> Self {
        Self::with_interval(db, orchestrator, DEFAULT_SWEEP_INTERVAL)
    }

    pub fn with_interval(db: Arc<Db>, orchestrator: Arc<Orchestrator>, interval: Duration) -> Self {
        Self {
            db,
            orchestrator,
            interval,
        }
    }

    /// Runs the sweep loop until `cancel` fires. Each tick reconciles every
    /// application not presently `Stopping`/`Stopped`/`Deleting` (§4.4):
    /// `Stopping`/`Deleting` are owned by an in-flight task and would race
    /// with it, and `Stopped` is a settled terminal state that a lingering
    /// container (e.g. slow to exit after `stop_app`) must not flip back to
    /// `Running` out from under a just-completed stop.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.tick().await; // first tick fires immediately; skip it
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("reconciler stopping");
                    return;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.sweep_once().await {
                        error!(error = %e, "reconciler sweep failed");
                    }
                }
            }
        }
    }

    pub async fn sweep_once(&self) -> Result<(), crate::db::DbError> {
        let apps = self.all_applications().await?;
        debug!(count = apps.len(), "reconciler sweep");
        for app in apps {
            if matches!(
                app.status,
                AppStatus::Stopping | AppStatus::Stopped | AppStatus::Deleting
            ) {
                continue;
            }
            self.reconcile_one(&app).await;
        }
        Ok(())
    }

    async fn all_applications(&self) -> Result<Vec<Application>, crate::db::DbError> {
        let mut apps = Vec::new();
        for status in [
            AppStatus::Starting,
            AppStatus::Running,
            AppStatus::Stopping,
            AppStatus::Stopped,
            AppStatus::Deleting,
            AppStatus::Error,
        ] {
            apps.extend(self.db.list_applications_by_status(status).await?);
        }
        Ok(apps)
    }

    async fn reconcile_one(&self, app: &Application) {
        let health = match self.orchestrator.observe_health(app).await {
            Ok(h) => h,
            Err(e) => {
                warn!(app_id = %app.app_id, error = %e, "failed to observe container health, skipping");
                return;
            }
        };

        let desired = map_health(health);
        if desired == app.status {
            return;
        }

        debug!(app_id = %app.app_id, from = %app.status, to = %desired, "reconciling application status");
        if let Err(e) = self.db.update_application_status(&app.app_id, desired).await {
            warn!(app_id = %app.app_id, error = %e, "failed to write reconciled status");
        }
    }
}

/// Health-to-status mapping table (§4.4): a direct translation of the
/// already-computed [`ContainerHealth`], with no additional state of its
/// own.
fn map_health(health: ContainerHealth) -> AppStatus {
    match health {
        ContainerHealth::Absent => AppStatus::Stopped,
        ContainerHealth::Healthy => AppStatus::Running,
        ContainerHealth::Unhealthy => AppStatus::Error,
        ContainerHealth::Starting => AppStatus::Starting,
        ContainerHealth::Stopped => AppStatus::Stopped,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_every_health_variant() {
        assert_eq!(map_health(ContainerHealth::Absent), AppStatus::Stopped);
        assert_eq!(map_health(ContainerHealth::Healthy), AppStatus::Running);
        assert_eq!(map_health(ContainerHealth::Unhealthy), AppStatus::Error);
        assert_eq!(map_health(ContainerHealth::Starting), AppStatus::Starting);
        assert_eq!(map_health(ContainerHealth::Stopped), AppStatus::Stopped);
    }
}
