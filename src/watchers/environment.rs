//! Environment-change watcher: applies a watched application's
//! `environment_variables` to the runtime process whenever the
//! `Application` document changes (§4.5, §9.3 `context.env`).

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::db::{ChangeFeed, Collection};

use super::{resilient_loop, EnvApplier};

pub struct EnvironmentWatcher {
    app_id: String,
    feed_source: Box<dyn Fn() -> ChangeFeed + Send + Sync>,
    applier: Arc<dyn EnvApplier>,
}

impl EnvironmentWatcher {
    pub fn new(
        app_id: impl Into<String>,
        feed_source: impl Fn() -> ChangeFeed + Send + Sync + 'static,
        applier: Arc<dyn EnvApplier>,
    ) -> Self {
        Self {
            app_id: app_id.into(),
            feed_source: Box::new(feed_source),
            applier,
        }
    }

    pub async fn run(self, cancel: CancellationToken) {
        let app_id = self.app_id.clone();
        let applier = self.applier;
        let feed_source = self.feed_source;
        resilient_loop(
            "environment_watcher",
            move || feed_source().subscribe(),
            cancel,
            move |event| {
                if event.collection != Collection::Applications || event.id != app_id {
                    return;
                }
                let Some(vars) = event
                    .document
                    .get("environment_variables")
                    .and_then(|v| serde_json::from_value::<Vec<crate::db::EnvVar>>(v.clone()).ok())
                else {
                    return;
                };
                applier.apply(&app_id, &vars);
                info!(app_id, count = vars.len(), "environment variables applied");
            },
        )
        .await;
    }
}
