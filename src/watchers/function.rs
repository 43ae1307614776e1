//! Function-change watcher: invalidates the runtime's code cache entry the
//! moment a watched application's function document changes, so the next
//! dispatch recompiles instead of serving stale code (§4.5, §4.6).

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::db::{ChangeFeed, Collection, Operation};

use super::{resilient_loop, CacheInvalidator};

pub struct FunctionWatcher {
    app_id: String,
    feed_source: Box<dyn Fn() -> ChangeFeed + Send + Sync>,
    invalidator: Arc<dyn CacheInvalidator>,
}

impl FunctionWatcher {
    /// `feed_source` is called each time the watcher needs a fresh
    /// subscription (initial start, or reconnect after the feed closes).
    pub fn new(
        app_id: impl Into<String>,
        feed_source: impl Fn() -> ChangeFeed + Send + Sync + 'static,
        invalidator: Arc<dyn CacheInvalidator>,
    ) -> Self {
        Self {
            app_id: app_id.into(),
            feed_source: Box::new(feed_source),
            invalidator,
        }
    }

    pub async fn run(self, cancel: CancellationToken) {
        let app_id = self.app_id.clone();
        let invalidator = self.invalidator;
        let feed_source = self.feed_source;
        resilient_loop(
            "function_watcher",
            move || feed_source().subscribe(),
            cancel,
            move |event| {
                if event.collection != Collection::Functions {
                    return;
                }
                match event.operation {
                    // Delete events carry no document (§ data model), so the
                    // owning app_id isn't observable here; invalidating
                    // unconditionally is harmless since the cache key is
                    // namespaced by app_id and a miss is a no-op.
                    Operation::Delete => {
                        invalidator.invalidate(&app_id, &event.id);
                        info!(app_id, function_id = %event.id, "function deleted, cache entry invalidated");
                    }
                    Operation::Update | Operation::Replace | Operation::Insert => {
                        let Some(event_app_id) = event.document.get("app_id").and_then(|v| v.as_str()) else {
                            return;
                        };
                        if event_app_id != app_id {
                            return;
                        }
                        invalidator.invalidate(&app_id, &event.id);
                        info!(app_id, function_id = %event.id, "function changed, cache entry invalidated");
                    }
                }
            },
        )
        .await;
    }
}
