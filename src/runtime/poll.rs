//! Cross-process change-feed bridge. The controller and a runtime process
//! share nothing but the WAL-mode sqlite file underneath [`crate::db::Db`];
//! an in-process [`crate::db::ChangeFeed`] only fans out within the process
//! that publishes to it. This poller diffs the documents it can see against
//! what it saw last sweep and synthesizes [`crate::db::ChangeEvent`]s onto a
//! local feed, so [`crate::watchers`] can subscribe to a runtime-local feed
//! exactly as if it were running in the controller process.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::db::{ChangeEvent, ChangeFeed, Collection, Db, Operation};

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Watches one application's functions and environment variables for
/// changes made by the controller process, polling the shared document
/// store instead of observing an in-process publish.
pub struct PollingBridge {
    db: Arc<Db>,
    app_id: String,
    feed: ChangeFeed,
    interval: Duration,
}

impl PollingBridge {
    pub fn new(db: Arc<Db>, app_id: String) -> Self {
        Self {
            db,
            app_id,
            feed: ChangeFeed::new(),
            interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn feed(&self) -> ChangeFeed {
        self.feed.clone()
    }

    pub async fn run(&self, cancel: CancellationToken) {
        let mut known_functions: HashMap<String, i64> = HashMap::new();
        let mut known_app_updated_at: Option<i64> = None;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(self.interval) => {}
            }

            if let Err(e) = self.sweep_functions(&mut known_functions).await {
                warn!(app_id = %self.app_id, error = %e, "polling bridge function sweep failed");
            }
            if let Err(e) = self.sweep_application(&mut known_app_updated_at).await {
                warn!(app_id = %self.app_id, error = %e, "polling bridge application sweep failed");
            }
        }
    }

    async fn sweep_functions(&self, known: &mut HashMap<String, i64>) -> Result<(), crate::db::DbError> {
        let current = self.db.list_functions_by_app(&self.app_id).await?;
        let mut seen = std::collections::HashSet::new();

        for function in &current {
            seen.insert(function.function_id.clone());
            let prior = known.insert(function.function_id.clone(), function.updated_at);
            let operation = match prior {
                None => Operation::Insert,
                Some(prev) if prev != function.updated_at => Operation::Update,
                _ => continue,
            };
            self.feed.publish(ChangeEvent {
                collection: Collection::Functions,
                operation,
                id: function.function_id.clone(),
                document: serde_json::to_value(function).unwrap_or(serde_json::Value::Null),
                updated_fields: vec![],
            });
        }

        let vanished: Vec<String> = known
            .keys()
            .filter(|id| !seen.contains(*id))
            .cloned()
            .collect();
        for id in vanished {
            known.remove(&id);
            self.feed.publish(ChangeEvent {
                collection: Collection::Functions,
                operation: Operation::Delete,
                id,
                document: serde_json::Value::Null,
                updated_fields: vec![],
            });
        }

        Ok(())
    }

    async fn sweep_application(&self, known_updated_at: &mut Option<i64>) -> Result<(), crate::db::DbError> {
        let Some(app) = self.db.get_application(&self.app_id).await? else {
            return Ok(());
        };
        if *known_updated_at == Some(app.updated_at) {
            return Ok(());
        }
        let operation = if known_updated_at.is_none() {
            Operation::Insert
        } else {
            Operation::Update
        };
        *known_updated_at = Some(app.updated_at);
        self.feed.publish(ChangeEvent {
            collection: Collection::Applications,
            operation,
            id: app.app_id.clone(),
            document: serde_json::to_value(&app).unwrap_or(serde_json::Value::Null),
            updated_fields: vec![],
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{AppStatus, Application};

    fn app(app_id: &str, updated_at: i64) -> Application {
        Application {
            app_id: app_id.to_string(),
            app_name: app_id.to_string(),
            db_password: "pw".into(),
            description: None,
            users: vec![],
            common_dependencies: vec![],
            environment_variables: vec![],
            cors: Default::default(),
            notification: Default::default(),
            ai: Default::default(),
            status: AppStatus::Running,
            created_at: updated_at,
            updated_at,
        }
    }

    #[tokio::test]
    async fn publishes_insert_then_update_on_application_change() {
        let db = Arc::new(Db::open_in_memory().unwrap());
        db.insert_application(&app("app1", 1)).await.unwrap();

        let bridge = PollingBridge::new(db.clone(), "app1".to_string());
        let mut rx = bridge.feed().subscribe();
        let mut known = None;
        bridge.sweep_application(&mut known).await.unwrap();
        let event = rx.try_recv().unwrap();
        assert!(matches!(event.operation, Operation::Insert));

        let mut updated = app("app1", 2);
        updated.app_name = "app1".to_string();
        db.replace_application(&updated).await.unwrap();
        bridge.sweep_application(&mut known).await.unwrap();
        let event = rx.try_recv().unwrap();
        assert!(matches!(event.operation, Operation::Update));
    }
}
