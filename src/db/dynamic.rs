//! Per-application "dynamic" database (§6 `/database/*`): user-defined
//! collections living inside the app's own dedicated sqlite file, distinct
//! from the control plane's own document store (`super::store::Db`).
//! Grounded on `server/core/database_dynamic.py`'s `dynamic_db` collection
//! operations, with `app_collection_documents_counts` +
//! `delete_collection`'s non-empty guard (`server/routers/database.py`)
//! carried over as the conflict-without-destroying-data rule from §8.

use std::path::PathBuf;

use dashmap::DashMap;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::Mutex;

#[derive(Debug, Error)]
pub enum DynamicDbError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid collection name: {0}")]
    InvalidName(String),

    #[error("collection not found: {0}")]
    NotFound(String),

    #[error("collection {0} is not empty")]
    NotEmpty(String),
}

pub type DynamicDbResult<T> = Result<T, DynamicDbError>;

/// One sqlite connection per app, opened lazily against the same file the
/// orchestrator provisions at `start_app_container` time
/// (`<data_directory>/apps/<app_id_lc>.sqlite3`) and cached for the
/// controller process's lifetime.
pub struct DynamicDb {
    data_directory: PathBuf,
    conns: DashMap<String, std::sync::Arc<Mutex<Connection>>>,
}

/// Collection names become table names; restrict to what's safe to splice
/// into a quoted identifier (table/column names can't be bound as sqlite
/// parameters).
fn validate_collection_name(col_name: &str) -> DynamicDbResult<()> {
    let valid = !col_name.is_empty()
        && col_name.len() <= 64
        && col_name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
        && col_name.chars().next().is_some_and(|c| !c.is_ascii_digit());
    if valid {
        Ok(())
    } else {
        Err(DynamicDbError::InvalidName(col_name.to_string()))
    }
}

fn table_name(col_name: &str) -> String {
    format!("col_{col_name}")
}

impl DynamicDb {
    pub fn new(data_directory: PathBuf) -> Self {
        Self {
            data_directory,
            conns: DashMap::new(),
        }
    }

    fn path_for(&self, app_id_lc: &str) -> PathBuf {
        self.data_directory
            .join("apps")
            .join(format!("{app_id_lc}.sqlite3"))
    }

    fn conn_for(&self, app_id_lc: &str) -> DynamicDbResult<std::sync::Arc<Mutex<Connection>>> {
        if let Some(conn) = self.conns.get(app_id_lc) {
            return Ok(conn.clone());
        }
        let path = self.path_for(app_id_lc);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DynamicDbError::Sqlite(rusqlite::Error::ToSqlConversionFailure(Box::new(e)))
            })?;
        }
        let conn = Connection::open(&path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        let conn = std::sync::Arc::new(Mutex::new(conn));
        self.conns.insert(app_id_lc.to_string(), conn.clone());
        Ok(conn)
    }

    async fn table_exists(conn: &Connection, table: &str) -> DynamicDbResult<bool> {
        let found: Option<String> = conn
            .query_row(
                "SELECT name FROM sqlite_master WHERE type='table' AND name = ?1",
                params![table],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    pub async fn list_collections(&self, app_id_lc: &str) -> DynamicDbResult<Vec<String>> {
        let conn = self.conn_for(app_id_lc)?;
        let conn = conn.lock().await;
        let mut stmt =
            conn.prepare("SELECT name FROM sqlite_master WHERE type='table' AND name LIKE 'col\\_%' ESCAPE '\\'")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut names = Vec::new();
        for row in rows {
            let name = row?;
            names.push(name.trim_start_matches("col_").to_string());
        }
        Ok(names)
    }

    pub async fn create_collection(&self, app_id_lc: &str, col_name: &str) -> DynamicDbResult<()> {
        validate_collection_name(col_name)?;
        let conn = self.conn_for(app_id_lc)?;
        let conn = conn.lock().await;
        conn.execute(
            &format!(
                "CREATE TABLE IF NOT EXISTS \"{}\" (doc_id TEXT PRIMARY KEY, document TEXT NOT NULL)",
                table_name(col_name)
            ),
            [],
        )?;
        Ok(())
    }

    pub async fn document_count(&self, app_id_lc: &str, col_name: &str) -> DynamicDbResult<i64> {
        validate_collection_name(col_name)?;
        let conn = self.conn_for(app_id_lc)?;
        let conn = conn.lock().await;
        let table = table_name(col_name);
        if !Self::table_exists(&conn, &table).await? {
            return Err(DynamicDbError::NotFound(col_name.to_string()));
        }
        let count: i64 = conn.query_row(&format!("SELECT COUNT(*) FROM \"{table}\""), [], |row| row.get(0))?;
        Ok(count)
    }

    pub async fn insert_document(
        &self,
        app_id_lc: &str,
        col_name: &str,
        doc_id: &str,
        document: &Value,
    ) -> DynamicDbResult<()> {
        self.create_collection(app_id_lc, col_name).await?;
        let conn = self.conn_for(app_id_lc)?;
        let conn = conn.lock().await;
        let table = table_name(col_name);
        conn.execute(
            &format!("INSERT OR REPLACE INTO \"{table}\" (doc_id, document) VALUES (?1, ?2)"),
            params![doc_id, serde_json::to_string(document)?],
        )?;
        Ok(())
    }

    pub async fn list_documents(
        &self,
        app_id_lc: &str,
        col_name: &str,
        page: u32,
        length: u32,
    ) -> DynamicDbResult<(Vec<Value>, i64)> {
        validate_collection_name(col_name)?;
        let conn = self.conn_for(app_id_lc)?;
        let conn = conn.lock().await;
        let table = table_name(col_name);
        if !Self::table_exists(&conn, &table).await? {
            return Err(DynamicDbError::NotFound(col_name.to_string()));
        }
        let total: i64 = conn.query_row(&format!("SELECT COUNT(*) FROM \"{table}\""), [], |row| row.get(0))?;
        let offset = (page.saturating_sub(1)) as i64 * length as i64;
        let mut stmt = conn.prepare(&format!(
            "SELECT document FROM \"{table}\" ORDER BY doc_id LIMIT ?1 OFFSET ?2"
        ))?;
        let rows = stmt.query_map(params![length as i64, offset], |row| row.get::<_, String>(0))?;
        let mut docs = Vec::new();
        for row in rows {
            docs.push(serde_json::from_str(&row?)?);
        }
        Ok((docs, total))
    }

    /// Clears every document but keeps the collection itself, the remedy
    /// the original's `delete_collection` error message points the caller
    /// at ("Please clear it first").
    pub async fn clear_collection(&self, app_id_lc: &str, col_name: &str) -> DynamicDbResult<()> {
        validate_collection_name(col_name)?;
        let conn = self.conn_for(app_id_lc)?;
        let conn = conn.lock().await;
        let table = table_name(col_name);
        if !Self::table_exists(&conn, &table).await? {
            return Err(DynamicDbError::NotFound(col_name.to_string()));
        }
        conn.execute(&format!("DELETE FROM \"{table}\""), [])?;
        Ok(())
    }

    /// Drops a collection outright. Refuses with [`DynamicDbError::NotEmpty`]
    /// when it still holds documents (§8: "must return a conflict code
    /// without destroying data") — callers map that to the management API's
    /// conflict envelope rather than a 500.
    pub async fn delete_collection(&self, app_id_lc: &str, col_name: &str) -> DynamicDbResult<()> {
        let count = self.document_count(app_id_lc, col_name).await?;
        if count != 0 {
            return Err(DynamicDbError::NotEmpty(col_name.to_string()));
        }
        let conn = self.conn_for(app_id_lc)?;
        let conn = conn.lock().await;
        conn.execute(&format!("DROP TABLE \"{}\"", table_name(col_name)), [])?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool() -> DynamicDb {
        DynamicDb::new(std::env::temp_dir().join(format!("hyac-dynamic-test-{}", uuid::Uuid::new_v4())))
    }

    #[tokio::test]
    async fn delete_collection_refuses_when_non_empty() {
        let db = pool();
        db.insert_document("app1", "widgets", "d1", &serde_json::json!({"a": 1}))
            .await
            .unwrap();

        let err = db.delete_collection("app1", "widgets").await.unwrap_err();
        assert!(matches!(err, DynamicDbError::NotEmpty(_)));

        // data must still be there afterwards
        assert_eq!(db.document_count("app1", "widgets").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn delete_collection_succeeds_once_empty() {
        let db = pool();
        db.insert_document("app1", "widgets", "d1", &serde_json::json!({"a": 1}))
            .await
            .unwrap();
        db.clear_collection("app1", "widgets").await.unwrap();
        db.delete_collection("app1", "widgets").await.unwrap();

        let err = db.document_count("app1", "widgets").await.unwrap_err();
        assert!(matches!(err, DynamicDbError::NotFound(_)));
    }

    #[tokio::test]
    async fn rejects_unsafe_collection_names() {
        let db = pool();
        let err = db
            .insert_document("app1", "widgets; DROP TABLE x;--", "d1", &serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, DynamicDbError::InvalidName(_)));
    }
}
