//! Change Watchers (§4.5): resilient subscribers that react to function and
//! environment-variable changes for one application, reconnecting with
//! backoff if their change-feed subscription lags or closes. Grounded on
//! `events::bus::EventBus` subscription shape, generalized from "process
//! state/stats events" to "function code changed" / "env vars changed".
//!
//! These watchers are deliberately decoupled from the runtime's code cache
//! and environment facade: they depend only on the callback traits below, so
//! the same watcher runs unchanged whether it's fed by an in-process
//! [`crate::db::ChangeFeed`] (single-process dev/test) or by the
//! cross-process polling bridge a separate runtime process uses to observe
//! a controller-owned document store (`crate::runtime::poll`).

mod environment;
mod function;

pub use environment::EnvironmentWatcher;
pub use function::FunctionWatcher;

use std::time::Duration;

use tokio::sync::broadcast;
use tracing::warn;

/// Invoked when a function belonging to the watched app changes. Identifier
/// is the function's id; `is_common` distinguishes the `common` namespace
/// cache-key suffix (§4.6 key format).
pub trait CacheInvalidator: Send + Sync {
    fn invalidate(&self, app_id: &str, function_id: &str);
    fn invalidate_all(&self, app_id: &str);
}

/// Invoked when the watched app's environment variables change.
pub trait EnvApplier: Send + Sync {
    fn apply(&self, app_id: &str, vars: &[crate::db::EnvVar]);
}

/// Resubscribes to `subscribe` and re-enters `handle_event` whenever the
/// receiver lags or the feed is recreated underneath it (the polling
/// bridge replaces its internal feed on restart), backing off briefly
/// between reconnect attempts so a persistently broken feed doesn't spin.
pub(crate) async fn resilient_loop<F>(
    label: &'static str,
    mut subscribe: impl FnMut() -> broadcast::Receiver<crate::db::ChangeEvent>,
    cancel: tokio_util::sync::CancellationToken,
    mut handle_event: F,
) where
    F: FnMut(crate::db::ChangeEvent),
{
    let mut rx = subscribe();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            event = rx.recv() => {
                match event {
                    Ok(event) => handle_event(event),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(label, skipped = n, "watcher lagged behind change feed");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        warn!(label, "change feed subscription closed, reconnecting");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                        rx = subscribe();
                    }
                }
            }
        }
    }
}
