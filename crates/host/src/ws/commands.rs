//! Client message command handlers
//!
//! Dispatches parsed messages from a connected session to the hub and
//! collects the direct replies for that session. Broadcasts to other
//! sessions in the room happen inside the hub.

use std::sync::Arc;

use pagesync_protocol::{ClientMessage, ServerMessage};

use crate::hub::{error_reply, SyncHub};
use crate::room::SessionSender;

/// Handle one message from a connected client
///
/// Diff submissions are rejected unless the session has subscribed to the
/// document first, so a session cannot write into rooms it never joined.
#[tracing::instrument(skip(hub, sender, msg), level = "debug")]
pub async fn handle_client_message(
    hub: &Arc<SyncHub>,
    session_id: &str,
    user_id: &str,
    sender: &SessionSender,
    msg: ClientMessage,
) -> Vec<ServerMessage> {
    match msg {
        ClientMessage::Subscribe {
            document_id,
            known_version,
        } => {
            match hub
                .subscribe(
                    &document_id,
                    session_id,
                    user_id,
                    known_version,
                    sender.clone(),
                )
                .await
            {
                Ok(replies) => replies,
                Err(err) => vec![error_reply(None, &err)],
            }
        }

        ClientMessage::Unsubscribe { document_id } => {
            hub.unsubscribe(&document_id, session_id).await;
            Vec::new()
        }

        ClientMessage::Diff {
            document_id,
            envelope,
        } => {
            if !hub.relay().is_subscribed(&document_id, session_id).await {
                return vec![ServerMessage::Error {
                    request_id: Some(envelope.request_id),
                    message: format!("not subscribed to document {document_id}"),
                    fatal: false,
                }];
            }
            hub.submit_diff(&document_id, session_id, user_id, &envelope)
                .await
        }

        ClientMessage::GetDocument { document_id } => {
            match hub.document_data(&document_id).await {
                Ok(data) => vec![data],
                Err(err) => vec![error_reply(None, &err)],
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Arc;

    use pagesync_protocol::{DiffEnvelope, Step};
    use serde_json::json;
    use tokio::sync::mpsc;

    use crate::model::SpliceModel;
    use crate::store::MemoryStore;

    fn hub() -> Arc<SyncHub> {
        Arc::new(SyncHub::new(
            Arc::new(MemoryStore::new()),
            Arc::new(SpliceModel),
            1000,
        ))
    }

    fn bootstrap_envelope() -> DiffEnvelope {
        DiffEnvelope {
            request_id: 0,
            client_id: "creator".to_string(),
            base_version: 0,
            steps: vec![Step::new(json!({"from": 0, "to": 0, "insert": ""}))],
        }
    }

    #[tokio::test]
    async fn test_diff_without_subscription_rejected() {
        let hub = hub();
        hub.create_document("doc", &bootstrap_envelope(), "creator")
            .await
            .unwrap();

        let (tx, _rx) = mpsc::unbounded_channel();
        let envelope = DiffEnvelope {
            request_id: 1,
            client_id: "c1".to_string(),
            base_version: 0,
            steps: vec![Step::new(json!({"from": 0, "to": 0, "insert": "hi"}))],
        };
        let replies = handle_client_message(
            &hub,
            "s1",
            "alice",
            &tx,
            ClientMessage::Diff {
                document_id: "doc".to_string(),
                envelope,
            },
        )
        .await;

        assert!(matches!(
            replies.as_slice(),
            [ServerMessage::Error { fatal: false, .. }]
        ));
    }

    #[tokio::test]
    async fn test_subscribe_then_diff() {
        let hub = hub();
        hub.create_document("doc", &bootstrap_envelope(), "creator")
            .await
            .unwrap();

        let (tx, _rx) = mpsc::unbounded_channel();
        let replies = handle_client_message(
            &hub,
            "s1",
            "alice",
            &tx,
            ClientMessage::Subscribe {
                document_id: "doc".to_string(),
                known_version: Some(0),
            },
        )
        .await;
        assert!(matches!(
            replies.first(),
            Some(ServerMessage::Subscribed { .. })
        ));

        let envelope = DiffEnvelope {
            request_id: 1,
            client_id: "c1".to_string(),
            base_version: 0,
            steps: vec![Step::new(json!({"from": 0, "to": 0, "insert": "hi"}))],
        };
        let replies = handle_client_message(
            &hub,
            "s1",
            "alice",
            &tx,
            ClientMessage::Diff {
                document_id: "doc".to_string(),
                envelope,
            },
        )
        .await;
        assert!(matches!(
            replies.as_slice(),
            [ServerMessage::Ack {
                request_id: 1,
                committed_version: 1,
            }]
        ));
    }

    #[tokio::test]
    async fn test_subscribe_unknown_document() {
        let hub = hub();
        let (tx, _rx) = mpsc::unbounded_channel();
        let replies = handle_client_message(
            &hub,
            "s1",
            "alice",
            &tx,
            ClientMessage::Subscribe {
                document_id: "missing".to_string(),
                known_version: None,
            },
        )
        .await;
        assert!(matches!(
            replies.as_slice(),
            [ServerMessage::Error { fatal: true, .. }]
        ));
    }
}
