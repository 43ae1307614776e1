//! Code cache (§4.6): bounded-size FIFO eviction, TTL-checked reads, and
//! single-flight compilation so concurrent misses for the same key coalesce
//! into one compile instead of stampeding. Reference sizing: 1024 entries,
//! 7200s TTL. Keyed `<app_id>::<identifier>[::"common"]`.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::Mutex as AsyncMutex;

use super::compiler::CompiledArtifact;

#[derive(Clone)]
pub struct CacheEntry {
    pub artifact: Arc<CompiledArtifact>,
    expires_at: Instant,
}

pub struct CodeCache {
    entries: DashMap<String, CacheEntry>,
    order: parking_lot::Mutex<VecDeque<String>>,
    inflight: DashMap<String, Arc<AsyncMutex<()>>>,
    max_size: usize,
    ttl: Duration,
}

impl CodeCache {
    pub fn new(max_size: usize, ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            order: parking_lot::Mutex::new(VecDeque::new()),
            inflight: DashMap::new(),
            max_size,
            ttl,
        }
    }

    /// Default sizing referenced by §4.6: 1024 entries, 2 hour TTL.
    pub fn with_defaults() -> Self {
        Self::new(1024, Duration::from_secs(7200))
    }

    pub fn get(&self, key: &str) -> Option<Arc<CompiledArtifact>> {
        let entry = self.entries.get(key)?;
        if entry.expires_at <= Instant::now() {
            drop(entry);
            self.entries.remove(key);
            return None;
        }
        Some(entry.artifact.clone())
    }

    /// Returns the cached artifact, compiling via `compile` on a miss.
    /// Concurrent callers racing on the same key share one compile: the
    /// second caller blocks on the first's per-key lock and then finds the
    /// entry already populated (double-checked after acquiring the lock).
    pub async fn get_or_compile<E, F, Fut>(
        &self,
        key: &str,
        compile: F,
    ) -> Result<Arc<CompiledArtifact>, E>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<CompiledArtifact, E>>,
    {
        if let Some(artifact) = self.get(key) {
            return Ok(artifact);
        }

        let lock = self
            .inflight
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        if let Some(artifact) = self.get(key) {
            return Ok(artifact);
        }

        let artifact = Arc::new(compile().await?);
        self.set(key, artifact.clone());
        Ok(artifact)
    }

    pub fn set(&self, key: &str, artifact: Arc<CompiledArtifact>) {
        let entry = CacheEntry {
            artifact,
            expires_at: Instant::now() + self.ttl,
        };
        let is_new = self.entries.insert(key.to_string(), entry).is_none();
        if is_new {
            let mut order = self.order.lock();
            order.push_back(key.to_string());
            while order.len() > self.max_size {
                if let Some(oldest) = order.pop_front() {
                    self.entries.remove(&oldest);
                }
            }
        }
    }

    /// Removes every cached variant of one function (the bare key and its
    /// `::common` suffix), used by the function watcher on code change.
    pub fn invalidate(&self, app_id: &str, identifier: &str) {
        let prefix = format!("{app_id}::{identifier}");
        self.entries.retain(|k, _| !k.starts_with(&prefix));
        self.order.lock().retain(|k| !k.starts_with(&prefix));
    }

    /// Removes every cached entry for an application, used when the app
    /// itself is deleted or its dependency set changes.
    pub fn invalidate_app(&self, app_id: &str) {
        let prefix = format!("{app_id}::");
        self.entries.retain(|k, _| !k.starts_with(&prefix));
        self.order.lock().retain(|k| !k.starts_with(&prefix));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn artifact(key: &str) -> CompiledArtifact {
        CompiledArtifact {
            module_key: key.to_string(),
            params: vec!["context".into(), "request".into()],
            source: "handler".into(),
            has_handler: true,
        }
    }

    #[tokio::test]
    async fn compiles_once_on_miss_then_hits() {
        let cache = CodeCache::new(16, Duration::from_secs(60));
        let calls = Arc::new(AtomicU32::new(0));

        let c = calls.clone();
        cache
            .get_or_compile::<(), _, _>("app1::f1", || async move {
                c.fetch_add(1, Ordering::SeqCst);
                Ok(artifact("app1::f1"))
            })
            .await
            .unwrap();

        let c = calls.clone();
        cache
            .get_or_compile::<(), _, _>("app1::f1", || async move {
                c.fetch_add(1, Ordering::SeqCst);
                Ok(artifact("app1::f1"))
            })
            .await
            .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn fifo_evicts_oldest_beyond_capacity() {
        let cache = CodeCache::new(2, Duration::from_secs(60));
        cache.set("a", Arc::new(artifact("a")));
        cache.set("b", Arc::new(artifact("b")));
        cache.set("c", Arc::new(artifact("c")));

        assert!(cache.get("a").is_none());
        assert!(cache.get("b").is_some());
        assert!(cache.get("c").is_some());
    }

    #[tokio::test]
    async fn ttl_expiry_evicts_on_read() {
        let cache = CodeCache::new(16, Duration::from_millis(1));
        cache.set("a", Arc::new(artifact("a")));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(cache.get("a").is_none());
    }

    #[tokio::test]
    async fn invalidate_removes_bare_and_common_suffix() {
        let cache = CodeCache::new(16, Duration::from_secs(60));
        cache.set("app1::f1", Arc::new(artifact("app1::f1")));
        cache.set("app1::f1::common", Arc::new(artifact("app1::f1::common")));
        cache.set("app1::f2", Arc::new(artifact("app1::f2")));

        cache.invalidate("app1", "f1");

        assert!(cache.get("app1::f1").is_none());
        assert!(cache.get("app1::f1::common").is_none());
        assert!(cache.get("app1::f2").is_some());
    }
}
