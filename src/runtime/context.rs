//! The `context` object injected into every handler invocation (§4.6,
//! Design Note 9.3): scoped primitives instead of ambient globals — scoped
//! DB access, the `minio_open` capability, an env facade, the populated
//! `common` namespace, and a notification dispatcher.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock as SyncRwLock;
use tracing::warn;

use crate::blob::{BlobError, BlobStore};
use crate::db::{Db, EnvVar, NotificationConfig};

use super::compiler::CompiledArtifact;

/// Functions published under a namespace peers can call without an HTTP
/// round-trip, populated at runtime boot and refreshed by the function
/// watcher (§4.6 `context.common`).
#[derive(Default)]
pub struct CommonNamespace {
    functions: SyncRwLock<HashMap<String, Arc<CompiledArtifact>>>,
}

impl CommonNamespace {
    pub fn set(&self, name: &str, artifact: Arc<CompiledArtifact>) {
        self.functions.write().insert(name.to_string(), artifact);
    }

    pub fn remove(&self, name: &str) {
        self.functions.write().remove(name);
    }

    pub fn get(&self, name: &str) -> Option<Arc<CompiledArtifact>> {
        self.functions.read().get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.functions.read().keys().cloned().collect()
    }

    /// Drops any published function no longer present in `keep`, used after
    /// a refresh sweep to forget functions that were unpublished or deleted.
    pub fn retain_only(&self, keep: &std::collections::HashSet<String>) {
        self.functions.write().retain(|name, _| keep.contains(name));
    }
}

/// Scoped access to and mutation of the application's environment
/// variables. `get` reads from the process environment (set at container
/// start and kept current by the environment watcher); `set` persists the
/// change back to the `Application` document in addition to the process
/// environment, so it survives a restart.
pub struct EnvFacade {
    app_id: String,
    db: Arc<Db>,
}

impl EnvFacade {
    pub fn new(app_id: String, db: Arc<Db>) -> Self {
        Self { app_id, db }
    }

    pub fn get(&self, key: &str) -> Option<String> {
        std::env::var(key).ok()
    }

    pub fn get_or(&self, key: &str, default: impl Into<String>) -> String {
        self.get(key).unwrap_or_else(|| default.into())
    }

    pub async fn set(&self, key: &str, value: &str) -> Result<(), crate::db::DbError> {
        std::env::set_var(key, value);
        let Some(mut app) = self.db.get_application(&self.app_id).await? else {
            return Ok(());
        };
        match app.environment_variables.iter_mut().find(|v| v.key == key) {
            Some(existing) => existing.value = value.to_string(),
            None => app.environment_variables.push(EnvVar {
                key: key.to_string(),
                value: value.to_string(),
            }),
        }
        self.db.replace_application(&app).await?;
        Ok(())
    }

    /// Replaces the whole snapshot the environment watcher observed,
    /// without a round-trip through the document store (it's already the
    /// source of the change).
    pub fn apply_snapshot(&self, vars: &[EnvVar]) {
        for var in vars {
            std::env::set_var(&var.key, &var.value);
        }
    }
}

pub struct NotificationDispatcher {
    config: NotificationConfig,
    client: reqwest::Client,
}

impl NotificationDispatcher {
    pub fn new(config: NotificationConfig, client: reqwest::Client) -> Self {
        Self { config, client }
    }

    /// Best-effort webhook delivery; failures are logged, never propagated
    /// to the handler that triggered the notification (§4.6, fire-and-forget
    /// side channel).
    pub async fn notify(&self, payload: serde_json::Value) {
        if !self.config.enabled {
            return;
        }
        let Some(url) = &self.config.webhook_url else {
            return;
        };
        if let Err(e) = self.client.post(url).json(&payload).send().await {
            warn!(url, error = %e, "notification webhook delivery failed");
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    Read,
    Write,
    ExclusiveWrite,
}

/// Capability-based equivalent of `minio_open` (Design Note 9.2): a scoped
/// handle to one blob-store object. Write modes guarantee upload-on-close
/// via the standard scoped-release idiom — `Drop` fires a best-effort
/// fire-and-forget upload of whatever was buffered if the handler never
/// called [`BlobHandle::close`] explicitly.
pub struct BlobHandle {
    bucket: String,
    key: String,
    mode: OpenMode,
    blob: Arc<BlobStore>,
    buffer: Vec<u8>,
}

impl BlobHandle {
    pub fn write(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Single non-streaming read of the whole object.
    pub async fn read_all(&self) -> Result<bytes::Bytes, BlobError> {
        self.blob.get_object(&self.bucket, &self.key).await
    }

    /// Chunked read with a short eventual-consistency retry budget (Design
    /// Note 9.2 reference: 3 attempts x 0.1s), for objects that may not
    /// have propagated yet after a very recent write from another node.
    pub async fn read_streaming(&self) -> Result<bytes::Bytes, BlobError> {
        let mut last_err = None;
        for attempt in 1..=3u32 {
            match self.blob.get_object(&self.bucket, &self.key).await {
                Ok(bytes) => return Ok(bytes),
                Err(BlobError::NotFound(detail)) => {
                    last_err = Some(BlobError::NotFound(detail));
                    if attempt < 3 {
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_err.expect("loop runs at least once"))
    }

    /// Explicit close: uploads the buffered write (if any) and surfaces
    /// errors, unlike the implicit `Drop`-based fallback.
    pub async fn close(mut self) -> Result<(), BlobError> {
        self.flush().await
    }

    async fn flush(&mut self) -> Result<(), BlobError> {
        if matches!(self.mode, OpenMode::Write | OpenMode::ExclusiveWrite) && !self.buffer.is_empty() {
            let buffer = std::mem::take(&mut self.buffer);
            self.blob
                .put_object(&self.bucket, &self.key, bytes::Bytes::from(buffer))
                .await?;
        }
        Ok(())
    }
}

impl Drop for BlobHandle {
    fn drop(&mut self) {
        if !matches!(self.mode, OpenMode::Write | OpenMode::ExclusiveWrite) || self.buffer.is_empty() {
            return;
        }
        let blob = self.blob.clone();
        let bucket = self.bucket.clone();
        let key = self.key.clone();
        let buffer = std::mem::take(&mut self.buffer);
        tokio::spawn(async move {
            if let Err(e) = blob.put_object(&bucket, &key, bytes::Bytes::from(buffer)).await {
                warn!(bucket, key, error = %e, "upload-on-close failed");
            }
        });
    }
}

pub struct RuntimeContext {
    pub app_id: String,
    pub func_id: String,
    pub db: Arc<Db>,
    pub env: EnvFacade,
    pub common: Arc<CommonNamespace>,
    pub notification: NotificationDispatcher,
    blob: Arc<BlobStore>,
    data_bucket: String,
}

impl RuntimeContext {
    pub fn new(
        app_id: String,
        func_id: String,
        db: Arc<Db>,
        blob: Arc<BlobStore>,
        data_bucket: String,
        common: Arc<CommonNamespace>,
        notification: NotificationDispatcher,
    ) -> Self {
        let env = EnvFacade::new(app_id.clone(), db.clone());
        Self {
            app_id,
            func_id,
            db,
            env,
            common,
            notification,
            blob,
            data_bucket,
        }
    }

    /// Opens a scoped handle to an object in the application's data bucket
    /// (Design Note 9.2). `Read` fails with [`BlobError::NotFound`] if the
    /// object doesn't exist; `ExclusiveWrite` fails with
    /// [`BlobError::BucketExists`]-shaped semantics if it already does.
    pub async fn open(&self, path: &str, mode: OpenMode) -> Result<BlobHandle, BlobError> {
        match mode {
            OpenMode::Read => {
                if !self.blob.object_exists(&self.data_bucket, path).await? {
                    return Err(BlobError::NotFound(path.to_string()));
                }
            }
            OpenMode::ExclusiveWrite => {
                if self.blob.object_exists(&self.data_bucket, path).await? {
                    return Err(BlobError::BucketExists(path.to_string()));
                }
            }
            OpenMode::Write => {}
        }
        Ok(BlobHandle {
            bucket: self.data_bucket.clone(),
            key: path.to_string(),
            mode,
            blob: self.blob.clone(),
            buffer: Vec::new(),
        })
    }
}
