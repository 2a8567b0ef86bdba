//! Wire message variants
//!
//! Messages travel as JSON text frames over the WebSocket, tagged by a
//! `type` field. Every payload is validated at the boundary before it
//! reaches the version ledger.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::envelope::{CommittedDiff, DiffEnvelope};

/// A session subscribed to one document's broadcasts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    pub user_id: String,
    pub session_id: String,
}

/// Client -> server messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Join a document room. `known_version` requests catch-up delivery of
    /// everything committed after it; absent, the server sends the full
    /// document instead.
    #[serde(rename_all = "camelCase")]
    Subscribe {
        document_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        known_version: Option<u64>,
    },

    /// Leave a document room. Idempotent.
    #[serde(rename_all = "camelCase")]
    Unsubscribe { document_id: String },

    /// Submit a batch of local steps for commit.
    #[serde(rename_all = "camelCase")]
    Diff {
        document_id: String,
        #[serde(flatten)]
        envelope: DiffEnvelope,
    },

    /// Request the full current document content.
    #[serde(rename_all = "camelCase")]
    GetDocument { document_id: String },
}

/// Server -> client messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// First message on every connection.
    #[serde(rename_all = "camelCase")]
    Welcome { session_id: String },

    /// Subscription registered.
    #[serde(rename_all = "camelCase")]
    Subscribed { document_id: String },

    /// The submitted envelope committed at `committed_version`.
    #[serde(rename_all = "camelCase")]
    Ack {
        request_id: u64,
        committed_version: u64,
    },

    /// The submitted envelope was stale; rebase over `missed_diffs` and
    /// resubmit. Not an error.
    #[serde(rename_all = "camelCase")]
    Rebase {
        request_id: u64,
        missed_diffs: Vec<CommittedDiff>,
    },

    /// Another session's diff committed; apply in order.
    #[serde(rename_all = "camelCase")]
    RemoteDiff {
        document_id: String,
        version: u64,
        steps: Vec<crate::step::Step>,
        origin_client_id: String,
    },

    /// Full document content at `version`, the resync path when catch-up is
    /// impossible or was not requested.
    #[serde(rename_all = "camelCase")]
    DocData {
        document_id: String,
        version: u64,
        content: Value,
    },

    /// Current room membership.
    #[serde(rename_all = "camelCase")]
    Connections {
        document_id: String,
        participants: Vec<Participant>,
    },

    /// Error report. `fatal` means the client must resynchronize (full
    /// document fetch plus fresh subscribe) before submitting again.
    #[serde(rename_all = "camelCase")]
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<u64>,
        message: String,
        fatal: bool,
    },
}
