//! Sqlite-backed document store: collections with per-document upserts plus
//! the [`ChangeFeed`]. One `Db` is shared (behind an `Arc`) across the whole
//! controller process and, in the runtime process, backs the scoped DB
//! clients handed to handlers via `context`.

use std::path::Path;

use rusqlite::{params, Connection, OptionalExtension};
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::info;

use super::change_feed::{ChangeEvent, ChangeFeed, Collection, Operation};
use super::model::*;
use super::model::timestamp;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),
}

pub type DbResult<T> = Result<T, DbError>;

pub struct Db {
    conn: Mutex<Connection>,
    feed: ChangeFeed,
}

impl Db {
    pub fn open(path: impl AsRef<Path>) -> DbResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DbError::Sqlite(rusqlite::Error::ToSqlConversionFailure(Box::new(e)))
            })?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        Self::init_tables(&conn)?;
        info!(path = %path.display(), "document store opened");
        Ok(Self {
            conn: Mutex::new(conn),
            feed: ChangeFeed::new(),
        })
    }

    pub fn open_in_memory() -> DbResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init_tables(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            feed: ChangeFeed::new(),
        })
    }

    pub fn change_feed(&self) -> ChangeFeed {
        self.feed.clone()
    }

    fn init_tables(conn: &Connection) -> rusqlite::Result<()> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS applications (
                app_id TEXT PRIMARY KEY,
                app_name TEXT NOT NULL UNIQUE,
                document TEXT NOT NULL,
                status TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS functions (
                function_id TEXT PRIMARY KEY,
                app_id TEXT NOT NULL,
                function_name TEXT NOT NULL,
                function_type TEXT NOT NULL,
                status TEXT NOT NULL,
                document TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                UNIQUE(app_id, function_name)
            );

            CREATE TABLE IF NOT EXISTS function_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                function_id TEXT NOT NULL,
                old_code TEXT NOT NULL,
                new_code TEXT NOT NULL,
                updated_by TEXT NOT NULL,
                created_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS tasks (
                task_id TEXT PRIMARY KEY,
                app_id TEXT NOT NULL,
                action TEXT NOT NULL,
                status TEXT NOT NULL,
                document TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS scheduled_tasks (
                task_id TEXT PRIMARY KEY,
                app_id TEXT NOT NULL,
                function_id TEXT NOT NULL,
                document TEXT NOT NULL,
                enabled INTEGER NOT NULL,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS function_metrics (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                function_id TEXT NOT NULL,
                app_id TEXT NOT NULL,
                document TEXT NOT NULL,
                timestamp INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS log_entries (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                app_id TEXT,
                function_id TEXT,
                document TEXT NOT NULL,
                timestamp INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_functions_app ON functions(app_id);
            CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status);
            CREATE INDEX IF NOT EXISTS idx_scheduled_app ON scheduled_tasks(app_id);
            CREATE INDEX IF NOT EXISTS idx_metrics_function ON function_metrics(function_id);
            CREATE INDEX IF NOT EXISTS idx_log_app_function ON log_entries(app_id, function_id);
            "#,
        )
    }

    // ---- applications -------------------------------------------------

    pub async fn insert_application(&self, app: &Application) -> DbResult<()> {
        let conn = self.conn.lock().await;
        let doc = serde_json::to_string(app)?;
        conn.execute(
            "INSERT INTO applications (app_id, app_name, document, status, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                app.app_id,
                app.app_name,
                doc,
                app.status.to_string(),
                app.created_at,
                app.updated_at
            ],
        )?;
        drop(conn);
        self.feed.publish(ChangeEvent {
            collection: Collection::Applications,
            operation: Operation::Insert,
            id: app.app_id.clone(),
            document: serde_json::to_value(app)?,
            updated_fields: vec![],
        });
        Ok(())
    }

    pub async fn get_application(&self, app_id: &str) -> DbResult<Option<Application>> {
        let conn = self.conn.lock().await;
        let doc: Option<String> = conn
            .query_row(
                "SELECT document FROM applications WHERE app_id = ?1",
                [app_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(match doc {
            Some(d) => Some(serde_json::from_str(&d)?),
            None => None,
        })
    }

    /// Case-insensitive lookup by `app_id_lc`, used by the lazy-start proxy
    /// which only has the lowercased subdomain label to go on.
    pub async fn get_application_by_lc_id(&self, app_id_lc: &str) -> DbResult<Option<Application>> {
        let conn = self.conn.lock().await;
        let doc: Option<String> = conn
            .query_row(
                "SELECT document FROM applications WHERE LOWER(app_id) = ?1",
                [app_id_lc],
                |row| row.get(0),
            )
            .optional()?;
        Ok(match doc {
            Some(d) => Some(serde_json::from_str(&d)?),
            None => None,
        })
    }

    pub async fn get_application_by_name(&self, app_name: &str) -> DbResult<Option<Application>> {
        let conn = self.conn.lock().await;
        let doc: Option<String> = conn
            .query_row(
                "SELECT document FROM applications WHERE app_name = ?1",
                [app_name],
                |row| row.get(0),
            )
            .optional()?;
        Ok(match doc {
            Some(d) => Some(serde_json::from_str(&d)?),
            None => None,
        })
    }

    pub async fn list_applications_by_status(&self, status: AppStatus) -> DbResult<Vec<Application>> {
        let conn = self.conn.lock().await;
        let mut stmt =
            conn.prepare("SELECT document FROM applications WHERE status = ?1")?;
        let rows = stmt
            .query_map([status.to_string()], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter()
            .map(|d| Ok(serde_json::from_str(&d)?))
            .collect()
    }

    pub async fn list_applications_page(&self, page: u32, length: u32) -> DbResult<Vec<Application>> {
        let conn = self.conn.lock().await;
        let offset = (page.saturating_sub(1)) as i64 * length as i64;
        let mut stmt = conn.prepare(
            "SELECT document FROM applications ORDER BY created_at DESC LIMIT ?1 OFFSET ?2",
        )?;
        let rows = stmt
            .query_map(params![length as i64, offset], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter()
            .map(|d| Ok(serde_json::from_str(&d)?))
            .collect()
    }

    /// Transitional/terminal status write. Emits an `Update` event with
    /// `updated_fields = ["status"]`, which is what the function/env
    /// watchers key their "did code change" check off of for other
    /// collections, and what the reconciler relies on being observable.
    pub async fn update_application_status(
        &self,
        app_id: &str,
        status: AppStatus,
    ) -> DbResult<()> {
        let conn = self.conn.lock().await;
        let now = timestamp();
        let doc: Option<String> = conn
            .query_row(
                "SELECT document FROM applications WHERE app_id = ?1",
                [app_id],
                |row| row.get(0),
            )
            .optional()?;
        let Some(doc) = doc else {
            return Err(DbError::NotFound(format!("application {app_id}")));
        };
        let mut app: Application = serde_json::from_str(&doc)?;
        app.status = status;
        app.updated_at = now;
        let new_doc = serde_json::to_string(&app)?;
        conn.execute(
            "UPDATE applications SET document = ?1, status = ?2, updated_at = ?3 WHERE app_id = ?4",
            params![new_doc, status.to_string(), now, app_id],
        )?;
        drop(conn);
        self.feed.publish(ChangeEvent {
            collection: Collection::Applications,
            operation: Operation::Update,
            id: app_id.to_string(),
            document: serde_json::to_value(&app)?,
            updated_fields: vec!["status".to_string()],
        });
        Ok(())
    }

    /// Full-document replace (environment variables, cors, notification,
    /// ai config, dependency list). Emits `Replace`, which the function
    /// watcher treats as an unconditional cache invalidation and the
    /// environment watcher treats as "recompute the env diff".
    pub async fn replace_application(&self, app: &Application) -> DbResult<()> {
        let conn = self.conn.lock().await;
        let doc = serde_json::to_string(app)?;
        let rows = conn.execute(
            "UPDATE applications SET document = ?1, app_name = ?2, status = ?3, updated_at = ?4 WHERE app_id = ?5",
            params![doc, app.app_name, app.status.to_string(), app.updated_at, app.app_id],
        )?;
        if rows == 0 {
            return Err(DbError::NotFound(format!("application {}", app.app_id)));
        }
        drop(conn);
        self.feed.publish(ChangeEvent {
            collection: Collection::Applications,
            operation: Operation::Replace,
            id: app.app_id.clone(),
            document: serde_json::to_value(app)?,
            updated_fields: vec![],
        });
        Ok(())
    }

    pub async fn delete_application(&self, app_id: &str) -> DbResult<()> {
        let conn = self.conn.lock().await;
        conn.execute("DELETE FROM applications WHERE app_id = ?1", [app_id])?;
        drop(conn);
        self.feed.publish(ChangeEvent {
            collection: Collection::Applications,
            operation: Operation::Delete,
            id: app_id.to_string(),
            document: Value::Null,
            updated_fields: vec![],
        });
        Ok(())
    }

    // ---- functions ------------------------------------------------------

    pub async fn insert_function(&self, f: &HyacFunction) -> DbResult<()> {
        let conn = self.conn.lock().await;
        let doc = serde_json::to_string(f)?;
        let function_type = match f.function_type {
            FunctionType::Endpoint => "endpoint",
            FunctionType::Common => "common",
        };
        let status = match f.status {
            FunctionStatus::Unpublished => "unpublished",
            FunctionStatus::Published => "published",
        };
        conn.execute(
            "INSERT INTO functions (function_id, app_id, function_name, function_type, status, document, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![f.function_id, f.app_id, f.function_name, function_type, status, doc, f.created_at, f.updated_at],
        ).map_err(|e| match e {
            rusqlite::Error::SqliteFailure(err, _) if err.code == rusqlite::ErrorCode::ConstraintViolation => {
                DbError::Conflict(format!("function name '{}' already exists in app", f.function_name))
            }
            other => DbError::Sqlite(other),
        })?;
        drop(conn);
        self.feed.publish(ChangeEvent {
            collection: Collection::Functions,
            operation: Operation::Insert,
            id: f.function_id.clone(),
            document: serde_json::to_value(f)?,
            updated_fields: vec![],
        });
        Ok(())
    }

    pub async fn get_function(&self, function_id: &str) -> DbResult<Option<HyacFunction>> {
        let conn = self.conn.lock().await;
        let doc: Option<String> = conn
            .query_row(
                "SELECT document FROM functions WHERE function_id = ?1",
                [function_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(match doc {
            Some(d) => Some(serde_json::from_str(&d)?),
            None => None,
        })
    }

    pub async fn get_function_by_name(
        &self,
        app_id: &str,
        function_name: &str,
    ) -> DbResult<Option<HyacFunction>> {
        let conn = self.conn.lock().await;
        let doc: Option<String> = conn
            .query_row(
                "SELECT document FROM functions WHERE app_id = ?1 AND function_name = ?2",
                params![app_id, function_name],
                |row| row.get(0),
            )
            .optional()?;
        Ok(match doc {
            Some(d) => Some(serde_json::from_str(&d)?),
            None => None,
        })
    }

    /// Published endpoint function dispatched at `app_id`/`function_id`
    /// (§4.6 step 2).
    pub async fn get_published_endpoint(
        &self,
        app_id: &str,
        function_id: &str,
    ) -> DbResult<Option<HyacFunction>> {
        let f = self.get_function(function_id).await?;
        Ok(f.filter(|f| {
            f.app_id == app_id
                && f.status == FunctionStatus::Published
                && f.function_type == FunctionType::Endpoint
        }))
    }

    pub async fn list_functions_by_app(&self, app_id: &str) -> DbResult<Vec<HyacFunction>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare("SELECT document FROM functions WHERE app_id = ?1")?;
        let rows = stmt
            .query_map([app_id], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter()
            .map(|d| Ok(serde_json::from_str(&d)?))
            .collect()
    }

    /// All `published` `common` functions of an app, for populating
    /// `context.common` (§4.6).
    pub async fn list_published_common(&self, app_id: &str) -> DbResult<Vec<HyacFunction>> {
        Ok(self
            .list_functions_by_app(app_id)
            .await?
            .into_iter()
            .filter(|f| f.status == FunctionStatus::Published && f.function_type == FunctionType::Common)
            .collect())
    }

    /// Appends a `FunctionHistory` row, updates `code`, bumps `updated_at`,
    /// and emits an `Update` event naming `code` as the updated field.
    pub async fn update_function_code(
        &self,
        function_id: &str,
        new_code: &str,
        updated_by: &str,
    ) -> DbResult<HyacFunction> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        let doc: Option<String> = tx
            .query_row(
                "SELECT document FROM functions WHERE function_id = ?1",
                [function_id],
                |row| row.get(0),
            )
            .optional()?;
        let Some(doc) = doc else {
            return Err(DbError::NotFound(format!("function {function_id}")));
        };
        let mut f: HyacFunction = serde_json::from_str(&doc)?;
        let old_code = f.code.clone();
        let now = timestamp();
        f.code = new_code.to_string();
        f.updated_at = now;

        tx.execute(
            "INSERT INTO function_history (function_id, old_code, new_code, updated_by, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![function_id, old_code, new_code, updated_by, now],
        )?;
        let new_doc = serde_json::to_string(&f)?;
        tx.execute(
            "UPDATE functions SET document = ?1, updated_at = ?2 WHERE function_id = ?3",
            params![new_doc, now, function_id],
        )?;
        tx.commit()?;
        drop(conn);

        self.feed.publish(ChangeEvent {
            collection: Collection::Functions,
            operation: Operation::Update,
            id: function_id.to_string(),
            document: serde_json::to_value(&f)?,
            updated_fields: vec!["code".to_string()],
        });
        Ok(f)
    }

    /// Removes the function, its history, and its metrics (§3 ownership:
    /// history/metrics survive only if explicitly preserved; the delete
    /// path removes both).
    pub async fn delete_function(&self, function_id: &str) -> DbResult<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "DELETE FROM function_history WHERE function_id = ?1",
            [function_id],
        )?;
        conn.execute(
            "DELETE FROM function_metrics WHERE function_id = ?1",
            [function_id],
        )?;
        conn.execute("DELETE FROM functions WHERE function_id = ?1", [function_id])?;
        drop(conn);
        self.feed.publish(ChangeEvent {
            collection: Collection::Functions,
            operation: Operation::Delete,
            id: function_id.to_string(),
            document: Value::Null,
            updated_fields: vec![],
        });
        Ok(())
    }

    pub async fn delete_functions_by_app(&self, app_id: &str) -> DbResult<()> {
        let ids: Vec<String> = self
            .list_functions_by_app(app_id)
            .await?
            .into_iter()
            .map(|f| f.function_id)
            .collect();
        for id in ids {
            self.delete_function(&id).await?;
        }
        Ok(())
    }

    pub async fn function_history(&self, function_id: &str) -> DbResult<Vec<FunctionHistoryEntry>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, function_id, old_code, new_code, updated_by, created_at
             FROM function_history WHERE function_id = ?1 ORDER BY created_at ASC",
        )?;
        let rows = stmt
            .query_map([function_id], |row| {
                Ok(FunctionHistoryEntry {
                    id: row.get(0)?,
                    function_id: row.get(1)?,
                    old_code: row.get(2)?,
                    new_code: row.get(3)?,
                    updated_by: row.get(4)?,
                    created_at: row.get(5)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // ---- tasks ------------------------------------------------------

    pub async fn insert_task(&self, task: &Task) -> DbResult<()> {
        let conn = self.conn.lock().await;
        let doc = serde_json::to_string(task)?;
        conn.execute(
            "INSERT INTO tasks (task_id, app_id, action, status, document, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                task.task_id,
                task.payload.app_id,
                task.action.to_string(),
                task.status.to_string(),
                doc,
                task.created_at,
                task.updated_at
            ],
        )?;
        drop(conn);
        self.feed.publish(ChangeEvent {
            collection: Collection::Tasks,
            operation: Operation::Insert,
            id: task.task_id.clone(),
            document: serde_json::to_value(task)?,
            updated_fields: vec![],
        });
        Ok(())
    }

    pub async fn get_task(&self, task_id: &str) -> DbResult<Option<Task>> {
        let conn = self.conn.lock().await;
        let doc: Option<String> = conn
            .query_row(
                "SELECT document FROM tasks WHERE task_id = ?1",
                [task_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(match doc {
            Some(d) => Some(serde_json::from_str(&d)?),
            None => None,
        })
    }

    pub async fn list_tasks_by_status(&self, status: TaskStatus) -> DbResult<Vec<Task>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare("SELECT document FROM tasks WHERE status = ?1")?;
        let rows = stmt
            .query_map([status.to_string()], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter()
            .map(|d| Ok(serde_json::from_str(&d)?))
            .collect()
    }

    /// `failed` tasks whose action is `start_app` (retry-on-restart, §4.1).
    pub async fn list_failed_start_app_tasks(&self) -> DbResult<Vec<Task>> {
        Ok(self
            .list_tasks_by_status(TaskStatus::Failed)
            .await?
            .into_iter()
            .filter(|t| t.action == TaskAction::StartApp)
            .collect())
    }

    pub async fn update_task_status(
        &self,
        task_id: &str,
        status: TaskStatus,
        result: Option<Value>,
    ) -> DbResult<Task> {
        let conn = self.conn.lock().await;
        let now = timestamp();
        let doc: Option<String> = conn
            .query_row(
                "SELECT document FROM tasks WHERE task_id = ?1",
                [task_id],
                |row| row.get(0),
            )
            .optional()?;
        let Some(doc) = doc else {
            return Err(DbError::NotFound(format!("task {task_id}")));
        };
        let mut task: Task = serde_json::from_str(&doc)?;
        task.status = status;
        task.updated_at = now;
        if result.is_some() {
            task.result = result;
        }
        let new_doc = serde_json::to_string(&task)?;
        conn.execute(
            "UPDATE tasks SET document = ?1, status = ?2, updated_at = ?3 WHERE task_id = ?4",
            params![new_doc, status.to_string(), now, task_id],
        )?;
        drop(conn);
        self.feed.publish(ChangeEvent {
            collection: Collection::Tasks,
            operation: Operation::Update,
            id: task_id.to_string(),
            document: serde_json::to_value(&task)?,
            updated_fields: vec!["status".to_string()],
        });
        Ok(task)
    }

    // ---- scheduled tasks ------------------------------------------------

    pub async fn upsert_scheduled_task(&self, st: &ScheduledTask) -> DbResult<()> {
        let conn = self.conn.lock().await;
        let doc = serde_json::to_string(st)?;
        conn.execute(
            "INSERT INTO scheduled_tasks (task_id, app_id, function_id, document, enabled, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(task_id) DO UPDATE SET document=excluded.document, enabled=excluded.enabled, updated_at=excluded.updated_at",
            params![st.task_id, st.app_id, st.function_id, doc, st.enabled as i32, st.created_at, st.updated_at],
        )?;
        drop(conn);
        self.feed.publish(ChangeEvent {
            collection: Collection::ScheduledTasks,
            operation: Operation::Replace,
            id: st.task_id.clone(),
            document: serde_json::to_value(st)?,
            updated_fields: vec![],
        });
        Ok(())
    }

    pub async fn get_scheduled_task(&self, task_id: &str) -> DbResult<Option<ScheduledTask>> {
        let conn = self.conn.lock().await;
        let doc: Option<String> = conn
            .query_row(
                "SELECT document FROM scheduled_tasks WHERE task_id = ?1",
                [task_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(match doc {
            Some(d) => Some(serde_json::from_str(&d)?),
            None => None,
        })
    }

    pub async fn delete_scheduled_task(&self, task_id: &str) -> DbResult<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "DELETE FROM scheduled_tasks WHERE task_id = ?1",
            [task_id],
        )?;
        drop(conn);
        self.feed.publish(ChangeEvent {
            collection: Collection::ScheduledTasks,
            operation: Operation::Delete,
            id: task_id.to_string(),
            document: Value::Null,
            updated_fields: vec![],
        });
        Ok(())
    }

    pub async fn list_enabled_scheduled_tasks(&self) -> DbResult<Vec<ScheduledTask>> {
        let conn = self.conn.lock().await;
        let mut stmt =
            conn.prepare("SELECT document FROM scheduled_tasks WHERE enabled = 1")?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter()
            .map(|d| Ok(serde_json::from_str(&d)?))
            .collect()
    }

    pub async fn list_scheduled_tasks_by_app(&self, app_id: &str) -> DbResult<Vec<ScheduledTask>> {
        let conn = self.conn.lock().await;
        let mut stmt =
            conn.prepare("SELECT document FROM scheduled_tasks WHERE app_id = ?1")?;
        let rows = stmt
            .query_map([app_id], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter()
            .map(|d| Ok(serde_json::from_str(&d)?))
            .collect()
    }

    // ---- metrics & logs --------------------------------------------------

    /// Fire-and-forget insert; callers should spawn this rather than await
    /// it inline on the request path (§4.6 step 6).
    pub async fn insert_metric(&self, metric: &FunctionMetric) -> DbResult<()> {
        let conn = self.conn.lock().await;
        let doc = serde_json::to_string(metric)?;
        conn.execute(
            "INSERT INTO function_metrics (function_id, app_id, document, timestamp) VALUES (?1, ?2, ?3, ?4)",
            params![metric.function_id, metric.app_id, doc, metric.timestamp],
        )?;
        Ok(())
    }

    pub async fn insert_log(&self, entry: &LogEntry) -> DbResult<()> {
        let conn = self.conn.lock().await;
        let doc = serde_json::to_string(entry)?;
        conn.execute(
            "INSERT INTO log_entries (app_id, function_id, document, timestamp) VALUES (?1, ?2, ?3, ?4)",
            params![entry.app_id, entry.function_id, doc, entry.timestamp],
        )?;
        drop(conn);
        self.feed.publish(ChangeEvent {
            collection: Collection::LogEntries,
            operation: Operation::Insert,
            id: entry
                .function_id
                .clone()
                .unwrap_or_else(|| entry.app_id.clone().unwrap_or_default()),
            document: serde_json::to_value(entry)?,
            updated_fields: vec![],
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_app(app_id: &str) -> Application {
        let ts = crate::db::model::timestamp();
        Application {
            app_id: app_id.to_string(),
            app_name: format!("name-{app_id}"),
            db_password: "pw".into(),
            description: None,
            users: vec![],
            common_dependencies: vec![],
            environment_variables: vec![],
            cors: Default::default(),
            notification: Default::default(),
            ai: Default::default(),
            status: AppStatus::Starting,
            created_at: ts,
            updated_at: ts,
        }
    }

    #[tokio::test]
    async fn insert_and_get_application() {
        let db = Db::open_in_memory().unwrap();
        let app = sample_app("app1");
        db.insert_application(&app).await.unwrap();

        let loaded = db.get_application("app1").await.unwrap().unwrap();
        assert_eq!(loaded.app_name, "name-app1");
        assert_eq!(loaded.status, AppStatus::Starting);
    }

    #[tokio::test]
    async fn duplicate_app_name_conflicts() {
        let db = Db::open_in_memory().unwrap();
        let mut a = sample_app("app1");
        a.app_name = "dup".into();
        db.insert_application(&a).await.unwrap();

        let mut b = sample_app("app2");
        b.app_name = "dup".into();
        let err = db.insert_application(&b).await.unwrap_err();
        assert!(matches!(err, DbError::Sqlite(_)));
    }

    #[tokio::test]
    async fn status_update_emits_change_event() {
        let db = Db::open_in_memory().unwrap();
        let app = sample_app("app1");
        db.insert_application(&app).await.unwrap();

        let mut rx = db.change_feed().subscribe();
        db.update_application_status("app1", AppStatus::Running)
            .await
            .unwrap();

        let event = rx.recv().await.unwrap();
        assert_eq!(event.collection, Collection::Applications);
        assert_eq!(event.operation, Operation::Update);
        assert_eq!(event.updated_fields, vec!["status".to_string()]);

        let loaded = db.get_application("app1").await.unwrap().unwrap();
        assert_eq!(loaded.status, AppStatus::Running);
    }

    #[tokio::test]
    async fn update_function_code_appends_history() {
        let db = Db::open_in_memory().unwrap();
        let ts = crate::db::model::timestamp();
        let f = HyacFunction {
            function_id: "f1".into(),
            function_name: "hello".into(),
            app_id: "app1".into(),
            function_type: FunctionType::Endpoint,
            status: FunctionStatus::Published,
            code: "def handler(): pass".into(),
            tags: vec![],
            users: vec![],
            timeout: 30,
            memory_limit: 128,
            created_at: ts,
            updated_at: ts,
        };
        db.insert_function(&f).await.unwrap();

        db.update_function_code("f1", "def handler(): return 1", "alice")
            .await
            .unwrap();

        let history = db.function_history("f1").await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].old_code, "def handler(): pass");
        assert_eq!(history[0].new_code, "def handler(): return 1");

        let updated = db.get_function("f1").await.unwrap().unwrap();
        assert_eq!(updated.code, "def handler(): return 1");
    }

    #[tokio::test]
    async fn delete_function_removes_history_and_metrics() {
        let db = Db::open_in_memory().unwrap();
        let ts = crate::db::model::timestamp();
        let f = HyacFunction {
            function_id: "f1".into(),
            function_name: "hello".into(),
            app_id: "app1".into(),
            function_type: FunctionType::Endpoint,
            status: FunctionStatus::Published,
            code: "code".into(),
            tags: vec![],
            users: vec![],
            timeout: 30,
            memory_limit: 128,
            created_at: ts,
            updated_at: ts,
        };
        db.insert_function(&f).await.unwrap();
        db.insert_metric(&FunctionMetric {
            function_id: "f1".into(),
            function_name: "hello".into(),
            app_id: "app1".into(),
            status: MetricStatus::Success,
            execution_time: 0.01,
            timestamp: ts,
            extra: json!({}),
        })
        .await
        .unwrap();

        db.delete_function("f1").await.unwrap();
        assert!(db.get_function("f1").await.unwrap().is_none());
        assert!(db.function_history("f1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn list_failed_start_app_tasks_filters_by_action() {
        let db = Db::open_in_memory().unwrap();
        let t1 = Task::new(TaskAction::StartApp, "app1");
        let t2 = Task::new(TaskAction::StopApp, "app1");
        db.insert_task(&t1).await.unwrap();
        db.insert_task(&t2).await.unwrap();

        db.update_task_status(&t1.task_id, TaskStatus::Failed, None)
            .await
            .unwrap();
        db.update_task_status(&t2.task_id, TaskStatus::Failed, None)
            .await
            .unwrap();

        let retryable = db.list_failed_start_app_tasks().await.unwrap();
        assert_eq!(retryable.len(), 1);
        assert_eq!(retryable[0].task_id, t1.task_id);
    }
}
