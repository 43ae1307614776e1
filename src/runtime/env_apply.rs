//! Concrete [`EnvApplier`] for the runtime process: diffs the application's
//! persisted `environment_variables` against the process env and applies
//! additions/updates/removals (§4.5 watcher 2).

use std::collections::HashSet;
use std::sync::Mutex;

use crate::db::EnvVar;
use crate::watchers::EnvApplier;

/// Tracks which env keys this mechanism itself set, so a removal never
/// deletes a variable the host process or container runtime set some other
/// way ("removals delete only keys that were previously managed by this
/// mechanism", §4.5).
pub struct RuntimeEnvApplier {
    app_id: String,
    managed: Mutex<HashSet<String>>,
}

impl RuntimeEnvApplier {
    pub fn new(app_id: impl Into<String>) -> Self {
        Self {
            app_id: app_id.into(),
            managed: Mutex::new(HashSet::new()),
        }
    }
}

impl EnvApplier for RuntimeEnvApplier {
    fn apply(&self, app_id: &str, vars: &[EnvVar]) {
        if app_id != self.app_id {
            return;
        }

        let mut managed = self.managed.lock().unwrap();
        let mut next = HashSet::with_capacity(vars.len());
        for var in vars {
            std::env::set_var(&var.key, &var.value);
            next.insert(var.key.clone());
        }
        for stale in managed.difference(&next) {
            std::env::remove_var(stale);
        }
        *managed = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn applies_additions_and_removes_stale_managed_keys() {
        let applier = RuntimeEnvApplier::new("app1");
        applier.apply(
            "app1",
            &[
                EnvVar { key: "HYAC_TEST_A".into(), value: "1".into() },
                EnvVar { key: "HYAC_TEST_B".into(), value: "2".into() },
            ],
        );
        assert_eq!(std::env::var("HYAC_TEST_A").unwrap(), "1");
        assert_eq!(std::env::var("HYAC_TEST_B").unwrap(), "2");

        applier.apply("app1", &[EnvVar { key: "HYAC_TEST_A".into(), value: "3".into() }]);
        assert_eq!(std::env::var("HYAC_TEST_A").unwrap(), "3");
        assert!(std::env::var("HYAC_TEST_B").is_err());
    }

    #[test]
    fn ignores_updates_for_a_different_app() {
        let applier = RuntimeEnvApplier::new("app1");
        applier.apply("other-app", &[EnvVar { key: "HYAC_TEST_C".into(), value: "x".into() }]);
        assert!(std::env::var("HYAC_TEST_C").is_err());
    }
}
