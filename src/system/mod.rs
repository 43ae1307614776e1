//! Per-app serialization ([`Locker`]), generalized from the teacher's
//! per-server mutual-exclusion primitive to be keyed by `app_id` (§5
//! concurrency model). Captured-output forwarding (§4.6 step 5) goes
//! through the document store's change feed directly (`db::LogEntry`
//! inserts consumed by `web::logs`) rather than a separate sink pool, since
//! the controller and runtime planes already share that feed.

mod locker;

pub use locker::{Locker, LockerGuard};
