//! Version ledger
//!
//! Per-document commit sequencing. Each document's ledger entry tracks the
//! last committed version, a bounded in-memory tail of the diff log (a cache
//! over the durable store), and an idempotency table of recently
//! acknowledged `(client_id, request_id)` pairs.
//!
//! The commit path for one document is a single critical section: read the
//! current version, compare against the envelope's base, durably append,
//! advance. Two envelopes racing on the same base version are serialized;
//! the loser is demoted to a rebase against the winner's now-committed diff.
//! Commit order therefore equals arrival order at the serialization point.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};

use pagesync_protocol::{CommittedDiff, DiffEnvelope, ProtocolError};

use crate::store::{DiffStore, PersistedDiffRecord, StoreError};

/// How many acknowledged requests to remember per document for duplicate
/// detection.
const ACK_CAPACITY: usize = 256;

#[derive(Debug, Error)]
pub enum LedgerError {
    /// The client claimed a version ahead of the ledger: a protocol
    /// violation, fatal for that client's session on this document.
    #[error("base version {base} is ahead of committed version {committed}")]
    FutureVersion { base: u64, committed: u64 },

    #[error("document {0} already exists")]
    AlreadyExists(String),

    #[error("document {0} not found")]
    UnknownDocument(String),

    #[error("bootstrap envelope must have base version 0, got {0}")]
    InvalidBootstrap(u64),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Durable write failed; the version did not advance and nothing was
    /// broadcast. Retryable by the client.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Result of offering an envelope to a document's ledger.
#[derive(Debug, Clone, PartialEq)]
pub enum CommitOutcome {
    /// Appended and advanced: broadcast to the room.
    Committed { version: u64 },
    /// Same `(client_id, request_id)` already committed; re-ack without a
    /// new log entry.
    Duplicate { version: u64 },
    /// The client is behind; it must rebase over these diffs and resubmit.
    Rebase { missed: Vec<CommittedDiff> },
    /// The client is behind and the gap has been pruned from the in-memory
    /// log; it must refetch the full document.
    ResyncRequired,
}

/// Mutable per-document state. Owned by [`VersionLedger`], reachable only
/// through its per-document mutex.
pub struct DocumentLedger {
    document_id: String,
    committed_version: u64,
    log: VecDeque<CommittedDiff>,
    acks: HashMap<(String, u64), u64>,
    ack_order: VecDeque<(String, u64)>,
    history_limit: usize,
}

impl DocumentLedger {
    fn new(document_id: String, history_limit: usize) -> Self {
        Self {
            document_id,
            committed_version: 0,
            log: VecDeque::new(),
            acks: HashMap::new(),
            ack_order: VecDeque::new(),
            history_limit,
        }
    }

    pub fn committed_version(&self) -> u64 {
        self.committed_version
    }

    /// Offer a validated envelope for commit. Awaits the store's durable
    /// acknowledgment before advancing the version; on store failure the
    /// ledger state is unchanged.
    pub async fn commit(
        &mut self,
        envelope: &DiffEnvelope,
        user_id: &str,
        store: &dyn DiffStore,
    ) -> Result<CommitOutcome, LedgerError> {
        envelope.validate()?;

        let key = (envelope.client_id.clone(), envelope.request_id);
        if let Some(&version) = self.acks.get(&key) {
            return Ok(CommitOutcome::Duplicate { version });
        }

        if envelope.base_version > self.committed_version {
            return Err(LedgerError::FutureVersion {
                base: envelope.base_version,
                committed: self.committed_version,
            });
        }

        if envelope.base_version < self.committed_version {
            return Ok(self.missed_slice(envelope.base_version));
        }

        let version = self.committed_version + 1;
        store
            .append(PersistedDiffRecord {
                document_id: self.document_id.clone(),
                version,
                client_id: envelope.client_id.clone(),
                steps: envelope.steps.clone(),
                created_at: Utc::now(),
                created_by: user_id.to_string(),
            })
            .await?;

        self.committed_version = version;
        self.push_log(CommittedDiff {
            version,
            client_id: envelope.client_id.clone(),
            steps: envelope.steps.clone(),
        });
        self.remember_ack(key, version);
        Ok(CommitOutcome::Committed { version })
    }

    /// The log slice with `version > base`, or a resync demand if the tail
    /// no longer reaches back that far.
    fn missed_slice(&self, base: u64) -> CommitOutcome {
        let covered = self
            .log
            .front()
            .is_some_and(|oldest| oldest.version <= base + 1);
        if !covered {
            return CommitOutcome::ResyncRequired;
        }
        let missed = self
            .log
            .iter()
            .filter(|d| d.version > base)
            .cloned()
            .collect();
        CommitOutcome::Rebase { missed }
    }

    fn push_log(&mut self, diff: CommittedDiff) {
        self.log.push_back(diff);
        while self.log.len() > self.history_limit {
            self.log.pop_front();
        }
    }

    fn remember_ack(&mut self, key: (String, u64), version: u64) {
        self.acks.insert(key.clone(), version);
        self.ack_order.push_back(key);
        while self.ack_order.len() > ACK_CAPACITY {
            if let Some(old) = self.ack_order.pop_front() {
                self.acks.remove(&old);
            }
        }
    }
}

/// Registry of per-document ledgers. Different documents commit fully
/// independently; the only mutual exclusion is each document's own mutex,
/// which callers hold across commit and broadcast to pin fan-out order to
/// commit order.
pub struct VersionLedger {
    docs: RwLock<HashMap<String, Arc<Mutex<DocumentLedger>>>>,
    store: Arc<dyn DiffStore>,
    history_limit: usize,
}

impl VersionLedger {
    pub fn new(store: Arc<dyn DiffStore>, history_limit: usize) -> Self {
        Self {
            docs: RwLock::new(HashMap::new()),
            store,
            history_limit,
        }
    }

    pub fn store(&self) -> &Arc<dyn DiffStore> {
        &self.store
    }

    /// Commit the synthetic version-0 diff carrying a fresh document's
    /// initial content. After this the document replays from version 0 like
    /// any other, with no special bootstrap path.
    pub async fn bootstrap(
        &self,
        document_id: &str,
        envelope: &DiffEnvelope,
        user_id: &str,
    ) -> Result<(), LedgerError> {
        envelope.validate()?;
        if envelope.base_version != 0 {
            return Err(LedgerError::InvalidBootstrap(envelope.base_version));
        }

        // Only the existence pre-check touches the registry lock. The
        // durable append happens outside it so a slow write cannot stall
        // commits on other documents, which reach their ledgers through
        // that same registry. Two racing creations of the same id are
        // resolved by the store's version uniqueness constraint.
        if self.docs.read().await.contains_key(document_id)
            || self.store.latest_version(document_id).await?.is_some()
        {
            return Err(LedgerError::AlreadyExists(document_id.to_string()));
        }

        let append = self
            .store
            .append(PersistedDiffRecord {
                document_id: document_id.to_string(),
                version: 0,
                client_id: envelope.client_id.clone(),
                steps: envelope.steps.clone(),
                created_at: Utc::now(),
                created_by: user_id.to_string(),
            })
            .await;
        match append {
            Ok(()) => {}
            Err(StoreError::VersionExists { .. }) => {
                return Err(LedgerError::AlreadyExists(document_id.to_string()));
            }
            Err(e) => return Err(e.into()),
        }

        let mut ledger = DocumentLedger::new(document_id.to_string(), self.history_limit);
        ledger.push_log(CommittedDiff {
            version: 0,
            client_id: envelope.client_id.clone(),
            steps: envelope.steps.clone(),
        });
        ledger.remember_ack((envelope.client_id.clone(), envelope.request_id), 0);
        self.docs
            .write()
            .await
            .entry(document_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(ledger)));
        tracing::info!(document_id, user_id, "document created");
        Ok(())
    }

    /// Per-document ledger handle, rehydrating from the durable store on
    /// first access after a restart.
    pub async fn document(
        &self,
        document_id: &str,
    ) -> Result<Arc<Mutex<DocumentLedger>>, LedgerError> {
        if let Some(entry) = self.docs.read().await.get(document_id) {
            return Ok(entry.clone());
        }

        let log = self.store.load_log(document_id).await?;
        let Some(last) = log.last() else {
            return Err(LedgerError::UnknownDocument(document_id.to_string()));
        };

        let mut ledger = DocumentLedger::new(document_id.to_string(), self.history_limit);
        ledger.committed_version = last.version;
        for record in log.iter().rev().take(self.history_limit).rev() {
            ledger.push_log(record.to_committed());
        }

        let mut docs = self.docs.write().await;
        let entry = docs
            .entry(document_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(ledger)));
        tracing::debug!(document_id, "ledger rehydrated from store");
        Ok(entry.clone())
    }

    pub async fn committed_version(&self, document_id: &str) -> Result<u64, LedgerError> {
        let entry = self.document(document_id).await?;
        let ledger = entry.lock().await;
        Ok(ledger.committed_version())
    }

    /// Diffs a reconnecting client missed: exactly `known_version+1 ..=
    /// committed`, served from the durable store.
    pub async fn catch_up(
        &self,
        document_id: &str,
        known_version: u64,
    ) -> Result<Vec<CommittedDiff>, LedgerError> {
        // Existence check first so unknown documents fail loudly.
        let _ = self.document(document_id).await?;
        let records = self.store.load_since(document_id, known_version).await?;
        Ok(records.iter().map(PersistedDiffRecord::to_committed).collect())
    }
}
