//! Durable diff storage
//!
//! One append-only row per committed diff, keyed by `(document_id,
//! version)`. The version ledger's in-memory log is only a cache over this
//! store: after a relay restart the ledger rehydrates from here and resumes
//! at the stored version. Rows are never mutated, only appended.

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use pagesync_protocol::{CommittedDiff, Step};

use crate::model::{ApplyError, StepApplier};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("document {document_id} already has version {version}")]
    VersionExists { document_id: String, version: u64 },

    #[error("storage backend failure: {0}")]
    Backend(String),

    #[error(transparent)]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Apply(#[from] ApplyError),
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Backend(err.to_string())
    }
}

/// The durable form of one committed diff: the audit trail and replay
/// source for its document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedDiffRecord {
    pub document_id: String,
    pub version: u64,
    pub client_id: String,
    pub steps: Vec<Step>,
    pub created_at: DateTime<Utc>,
    pub created_by: String,
}

impl PersistedDiffRecord {
    /// The wire form relayed to subscribers.
    pub fn to_committed(&self) -> CommittedDiff {
        CommittedDiff {
            version: self.version,
            client_id: self.client_id.clone(),
            steps: self.steps.clone(),
        }
    }
}

/// Append-only store of committed diffs.
///
/// `append` must be durable before it returns: the commit path advances the
/// document version only after this acknowledgment, so a crash between
/// append and broadcast loses nothing.
#[async_trait]
pub trait DiffStore: Send + Sync {
    /// Persist one committed diff. Fails if the `(document_id, version)`
    /// slot is already taken.
    async fn append(&self, record: PersistedDiffRecord) -> Result<(), StoreError>;

    /// All diffs with version strictly greater than `version`, ascending.
    async fn load_since(
        &self,
        document_id: &str,
        version: u64,
    ) -> Result<Vec<PersistedDiffRecord>, StoreError>;

    /// The full log for a document, ascending from version 0.
    async fn load_log(&self, document_id: &str) -> Result<Vec<PersistedDiffRecord>, StoreError>;

    /// Highest committed version, or `None` if the document has no log.
    async fn latest_version(&self, document_id: &str) -> Result<Option<u64>, StoreError>;

    /// Reconstruct document content by folding the whole log through the
    /// model. Returns `None` for an unknown document. This is the canonical
    /// derivation of content; no separately maintained copy is trusted.
    async fn load_full(
        &self,
        document_id: &str,
        model: &dyn StepApplier,
    ) -> Result<Option<Value>, StoreError> {
        let log = self.load_log(document_id).await?;
        if log.is_empty() {
            return Ok(None);
        }
        let mut content = Value::Null;
        for record in &log {
            content = model.apply(&content, &record.steps)?;
        }
        Ok(Some(content))
    }
}
