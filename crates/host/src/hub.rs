//! Sync hub
//!
//! Glues the version ledger, the room relay and the durable store together.
//! All connection handlers and the REST surface go through these operations;
//! no component reaches into another's state directly.
//!
//! Ordering: the hub holds a document's ledger mutex across commit *and*
//! broadcast. Fan-out is a non-blocking push into per-subscriber channels,
//! so the critical section stays short while every subscriber still sees
//! diffs in exactly the commit order.

use std::sync::Arc;

use serde_json::Value;

use pagesync_protocol::{CommittedDiff, DiffEnvelope, ServerMessage};

use crate::ledger::{CommitOutcome, LedgerError, VersionLedger};
use crate::model::StepApplier;
use crate::room::{RoomRelay, SessionSender};
use crate::store::DiffStore;

pub struct SyncHub {
    ledger: VersionLedger,
    relay: RoomRelay,
    model: Arc<dyn StepApplier>,
}

impl SyncHub {
    pub fn new(store: Arc<dyn DiffStore>, model: Arc<dyn StepApplier>, history_limit: usize) -> Self {
        Self {
            ledger: VersionLedger::new(store, history_limit),
            relay: RoomRelay::new(),
            model,
        }
    }

    pub fn ledger(&self) -> &VersionLedger {
        &self.ledger
    }

    pub fn relay(&self) -> &RoomRelay {
        &self.relay
    }

    /// Create a document from its synthetic version-0 envelope.
    pub async fn create_document(
        &self,
        document_id: &str,
        envelope: &DiffEnvelope,
        user_id: &str,
    ) -> Result<(), LedgerError> {
        self.ledger.bootstrap(document_id, envelope, user_id).await
    }

    /// Register a session in a document's room and produce its direct
    /// replies: the subscription confirmation plus either the exact missed
    /// diffs (when the client supplied a known version) or the full
    /// document.
    pub async fn subscribe(
        &self,
        document_id: &str,
        session_id: &str,
        user_id: &str,
        known_version: Option<u64>,
        sender: SessionSender,
    ) -> Result<Vec<ServerMessage>, LedgerError> {
        // Fail before touching the room if the document does not exist.
        let committed = self.ledger.committed_version(document_id).await?;
        self.relay
            .subscribe(document_id, session_id, user_id, sender)
            .await;

        let mut replies = vec![ServerMessage::Subscribed {
            document_id: document_id.to_string(),
        }];
        match known_version {
            Some(known) if known <= committed => {
                let missed = self.ledger.catch_up(document_id, known).await?;
                replies.extend(
                    missed
                        .into_iter()
                        .map(|diff| remote_diff(document_id, diff)),
                );
            }
            // A claimed future version cannot be bridged by catch-up.
            Some(_) | None => replies.push(self.document_data(document_id).await?),
        }

        self.broadcast_participants(document_id).await;
        Ok(replies)
    }

    pub async fn unsubscribe(&self, document_id: &str, session_id: &str) {
        if self.relay.unsubscribe(document_id, session_id).await {
            self.broadcast_participants(document_id).await;
        }
    }

    /// Tear down every subscription of a dropped connection.
    pub async fn remove_session(&self, session_id: &str) {
        for document_id in self.relay.remove_session(session_id).await {
            self.broadcast_participants(&document_id).await;
        }
    }

    /// Offer an envelope for commit and fan out the result. Returns the
    /// direct replies for the submitting session; broadcasts to the rest of
    /// the room happen inside.
    pub async fn submit_diff(
        &self,
        document_id: &str,
        session_id: &str,
        user_id: &str,
        envelope: &DiffEnvelope,
    ) -> Vec<ServerMessage> {
        let entry = match self.ledger.document(document_id).await {
            Ok(entry) => entry,
            Err(err) => return vec![error_reply(Some(envelope.request_id), &err)],
        };

        // Critical section: commit order and broadcast order must agree.
        let mut doc = entry.lock().await;
        let outcome = doc
            .commit(envelope, user_id, self.ledger.store().as_ref())
            .await;

        match outcome {
            Ok(CommitOutcome::Committed { version }) => {
                tracing::debug!(document_id, version, client_id = %envelope.client_id, "diff committed");
                let broadcast = remote_diff(
                    document_id,
                    CommittedDiff {
                        version,
                        client_id: envelope.client_id.clone(),
                        steps: envelope.steps.clone(),
                    },
                );
                self.relay
                    .broadcast(document_id, &broadcast, Some(session_id))
                    .await;
                vec![ServerMessage::Ack {
                    request_id: envelope.request_id,
                    committed_version: version,
                }]
            }
            Ok(CommitOutcome::Duplicate { version }) => vec![ServerMessage::Ack {
                request_id: envelope.request_id,
                committed_version: version,
            }],
            Ok(CommitOutcome::Rebase { missed }) => vec![ServerMessage::Rebase {
                request_id: envelope.request_id,
                missed_diffs: missed,
            }],
            Ok(CommitOutcome::ResyncRequired) => {
                drop(doc);
                match self.document_data(document_id).await {
                    Ok(data) => vec![data],
                    Err(err) => vec![error_reply(Some(envelope.request_id), &err)],
                }
            }
            Err(err) => vec![error_reply(Some(envelope.request_id), &err)],
        }
    }

    /// Full current content, derived by folding the durable log.
    pub async fn document_data(&self, document_id: &str) -> Result<ServerMessage, LedgerError> {
        let entry = self.ledger.document(document_id).await?;
        let doc = entry.lock().await;
        let version = doc.committed_version();
        let content = self
            .ledger
            .store()
            .load_full(document_id, self.model.as_ref())
            .await?
            .unwrap_or(Value::Null);
        Ok(ServerMessage::DocData {
            document_id: document_id.to_string(),
            version,
            content,
        })
    }

    async fn broadcast_participants(&self, document_id: &str) {
        let participants = self.relay.participants(document_id).await;
        if participants.is_empty() {
            return;
        }
        let msg = ServerMessage::Connections {
            document_id: document_id.to_string(),
            participants,
        };
        self.relay.broadcast(document_id, &msg, None).await;
    }
}

fn remote_diff(document_id: &str, diff: CommittedDiff) -> ServerMessage {
    ServerMessage::RemoteDiff {
        document_id: document_id.to_string(),
        version: diff.version,
        steps: diff.steps,
        origin_client_id: diff.client_id,
    }
}

/// Map a ledger error onto the wire. Future-version violations and unknown
/// documents are fatal for the session's view of that document; everything
/// else is retryable.
pub(crate) fn error_reply(request_id: Option<u64>, err: &LedgerError) -> ServerMessage {
    let fatal = matches!(
        err,
        LedgerError::FutureVersion { .. } | LedgerError::UnknownDocument(_)
    );
    ServerMessage::Error {
        request_id,
        message: err.to_string(),
        fatal,
    }
}
