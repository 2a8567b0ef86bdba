//! `SQLite`-backed diff store
//!
//! One row per committed diff in a `diffs` table with a
//! `(document_id, version)` primary key. `SQLite` commits the row before
//! `append` returns, which is the durability point the ledger waits on.

use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};

use pagesync_protocol::Step;

use super::{DiffStore, PersistedDiffRecord, StoreError};

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Create or open the diff database at `path`.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| StoreError::Backend(e.to_string()))?;
        }
        let conn = Connection::open(path)?;
        Self::with_connection(conn)
    }

    /// In-process database, handy for tests.
    pub fn in_memory() -> Result<Self, StoreError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS diffs (
                document_id TEXT NOT NULL,
                version INTEGER NOT NULL,
                client_id TEXT NOT NULL,
                steps TEXT NOT NULL,
                created_at TEXT NOT NULL,
                created_by TEXT NOT NULL,
                PRIMARY KEY (document_id, version)
            )",
            [],
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn query_records(
        conn: &Connection,
        sql: &str,
        params: impl rusqlite::Params,
    ) -> Result<Vec<PersistedDiffRecord>, StoreError> {
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map(params, |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
            ))
        })?;

        let mut records = Vec::new();
        for row in rows {
            let (document_id, version, client_id, steps_json, created_at, created_by) = row?;
            records.push(PersistedDiffRecord {
                document_id,
                version: u64::try_from(version).unwrap_or_default(),
                client_id,
                steps: serde_json::from_str::<Vec<Step>>(&steps_json)?,
                created_at: created_at
                    .parse::<DateTime<Utc>>()
                    .unwrap_or(DateTime::<Utc>::MIN_UTC),
                created_by,
            });
        }
        Ok(records)
    }
}

#[async_trait]
impl DiffStore for SqliteStore {
    async fn append(&self, record: PersistedDiffRecord) -> Result<(), StoreError> {
        let conn = self.conn.lock().map_err(|e| StoreError::Backend(e.to_string()))?;
        let steps = serde_json::to_string(&record.steps)?;
        let result = conn.execute(
            "INSERT INTO diffs (document_id, version, client_id, steps, created_at, created_by)
             VALUES (?, ?, ?, ?, ?, ?)",
            params![
                record.document_id,
                i64::try_from(record.version).unwrap_or(i64::MAX),
                record.client_id,
                steps,
                record.created_at.to_rfc3339(),
                record.created_by,
            ],
        );
        match result {
            Ok(_) => Ok(()),
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Err(StoreError::VersionExists {
                    document_id: record.document_id,
                    version: record.version,
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn load_since(
        &self,
        document_id: &str,
        version: u64,
    ) -> Result<Vec<PersistedDiffRecord>, StoreError> {
        let conn = self.conn.lock().map_err(|e| StoreError::Backend(e.to_string()))?;
        Self::query_records(
            &conn,
            "SELECT document_id, version, client_id, steps, created_at, created_by
             FROM diffs WHERE document_id = ? AND version > ? ORDER BY version ASC",
            params![document_id, i64::try_from(version).unwrap_or(i64::MAX)],
        )
    }

    async fn load_log(&self, document_id: &str) -> Result<Vec<PersistedDiffRecord>, StoreError> {
        let conn = self.conn.lock().map_err(|e| StoreError::Backend(e.to_string()))?;
        Self::query_records(
            &conn,
            "SELECT document_id, version, client_id, steps, created_at, created_by
             FROM diffs WHERE document_id = ? ORDER BY version ASC",
            params![document_id],
        )
    }

    async fn latest_version(&self, document_id: &str) -> Result<Option<u64>, StoreError> {
        let conn = self.conn.lock().map_err(|e| StoreError::Backend(e.to_string()))?;
        let version: Option<i64> = conn.query_row(
            "SELECT MAX(version) FROM diffs WHERE document_id = ?",
            [document_id],
            |row| row.get(0),
        )?;
        Ok(version.and_then(|v| u64::try_from(v).ok()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::SpliceModel;
    use serde_json::json;
    use tempfile::tempdir;

    fn record(version: u64, insert: &str) -> PersistedDiffRecord {
        PersistedDiffRecord {
            document_id: "doc".to_string(),
            version,
            client_id: "c1".to_string(),
            steps: vec![Step::new(json!({ "from": 0, "to": 0, "insert": insert }))],
            created_at: Utc::now(),
            created_by: "u1".to_string(),
        }
    }

    #[tokio::test]
    async fn append_load_roundtrip() {
        let store = SqliteStore::in_memory().unwrap();
        store.append(record(0, "hello")).await.unwrap();
        store.append(record(1, "x")).await.unwrap();

        let log = store.load_log("doc").await.unwrap();
        assert_eq!(log.len(), 2);
        assert_eq!(log[0].version, 0);
        assert_eq!(log[1].version, 1);
        assert_eq!(log[0].created_by, "u1");

        let since = store.load_since("doc", 0).await.unwrap();
        assert_eq!(since.len(), 1);
        assert_eq!(since[0].version, 1);

        assert_eq!(store.latest_version("doc").await.unwrap(), Some(1));
        assert_eq!(store.latest_version("other").await.unwrap(), None);
    }

    #[tokio::test]
    async fn duplicate_version_is_a_conflict() {
        let store = SqliteStore::in_memory().unwrap();
        store.append(record(0, "a")).await.unwrap();
        let err = store.append(record(0, "b")).await.unwrap_err();
        assert!(matches!(err, StoreError::VersionExists { version: 0, .. }));
    }

    #[tokio::test]
    async fn load_full_folds_the_log() {
        let store = SqliteStore::in_memory().unwrap();
        store.append(record(0, "hello")).await.unwrap();
        store.append(record(1, "x")).await.unwrap();

        let content = store.load_full("doc", &SpliceModel).await.unwrap();
        assert_eq!(content, Some(json!("xhello")));
        assert_eq!(store.load_full("other", &SpliceModel).await.unwrap(), None);
    }

    #[tokio::test]
    async fn survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("diffs.db");

        {
            let store = SqliteStore::open(&path).unwrap();
            store.append(record(0, "hello")).await.unwrap();
        }

        let store = SqliteStore::open(&path).unwrap();
        assert_eq!(store.latest_version("doc").await.unwrap(), Some(0));
        let log = store.load_log("doc").await.unwrap();
        assert_eq!(log[0].steps.len(), 1);
    }
}
