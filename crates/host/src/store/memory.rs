//! In-memory diff store for tests and ephemeral runs.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use super::{DiffStore, PersistedDiffRecord, StoreError};

#[derive(Debug, Default)]
pub struct MemoryStore {
    logs: Mutex<HashMap<String, Vec<PersistedDiffRecord>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DiffStore for MemoryStore {
    async fn append(&self, record: PersistedDiffRecord) -> Result<(), StoreError> {
        let mut logs = self.logs.lock().map_err(|e| StoreError::Backend(e.to_string()))?;
        let log = logs.entry(record.document_id.clone()).or_default();
        if log.iter().any(|r| r.version == record.version) {
            return Err(StoreError::VersionExists {
                document_id: record.document_id,
                version: record.version,
            });
        }
        log.push(record);
        log.sort_by_key(|r| r.version);
        Ok(())
    }

    async fn load_since(
        &self,
        document_id: &str,
        version: u64,
    ) -> Result<Vec<PersistedDiffRecord>, StoreError> {
        let logs = self.logs.lock().map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(logs
            .get(document_id)
            .map(|log| {
                log.iter()
                    .filter(|r| r.version > version)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn load_log(&self, document_id: &str) -> Result<Vec<PersistedDiffRecord>, StoreError> {
        let logs = self.logs.lock().map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(logs.get(document_id).cloned().unwrap_or_default())
    }

    async fn latest_version(&self, document_id: &str) -> Result<Option<u64>, StoreError> {
        let logs = self.logs.lock().map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(logs
            .get(document_id)
            .and_then(|log| log.last().map(|r| r.version)))
    }
}
