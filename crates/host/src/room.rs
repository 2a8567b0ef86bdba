//! Room relay
//!
//! Per-document broadcast groups. A room holds one subscriber entry per
//! `(document_id, session_id)` pair; each entry owns an ordered outbound
//! channel to that session's connection task. Broadcast walks the room and
//! pushes the message into every channel except the originator's. Sends are
//! fire-and-forget, so one dead subscriber never blocks the rest or the
//! commit that triggered the fan-out. Dead subscribers are pruned on the
//! spot and self-heal via catch-up when they reconnect.

use std::collections::HashMap;

use tokio::sync::{mpsc, RwLock};

use pagesync_protocol::{Participant, ServerMessage};

/// Ordered delivery channel to one connected session.
pub type SessionSender = mpsc::UnboundedSender<ServerMessage>;

struct Subscriber {
    user_id: String,
    sender: SessionSender,
}

#[derive(Default)]
struct Room {
    /// session_id -> subscriber
    subscribers: HashMap<String, Subscriber>,
}

/// Subscription registry for all documents.
///
/// Sole owner of room membership; commit logic only ever touches it through
/// the broadcast operation.
#[derive(Default)]
pub struct RoomRelay {
    rooms: RwLock<HashMap<String, Room>>,
}

impl RoomRelay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session in a document's room, replacing any previous
    /// entry for the same pair.
    pub async fn subscribe(
        &self,
        document_id: &str,
        session_id: &str,
        user_id: &str,
        sender: SessionSender,
    ) {
        let mut rooms = self.rooms.write().await;
        let room = rooms.entry(document_id.to_string()).or_default();
        room.subscribers.insert(
            session_id.to_string(),
            Subscriber {
                user_id: user_id.to_string(),
                sender,
            },
        );
        tracing::debug!(document_id, session_id, user_id, "subscribed");
    }

    /// Remove one subscription. Idempotent; returns whether an entry
    /// existed.
    pub async fn unsubscribe(&self, document_id: &str, session_id: &str) -> bool {
        let mut rooms = self.rooms.write().await;
        let Some(room) = rooms.get_mut(document_id) else {
            return false;
        };
        let removed = room.subscribers.remove(session_id).is_some();
        if room.subscribers.is_empty() {
            rooms.remove(document_id);
        }
        removed
    }

    /// Drop every subscription of a disconnecting session. Returns the
    /// affected document ids so callers can update participant lists.
    pub async fn remove_session(&self, session_id: &str) -> Vec<String> {
        let mut rooms = self.rooms.write().await;
        let mut affected = Vec::new();
        rooms.retain(|document_id, room| {
            if room.subscribers.remove(session_id).is_some() {
                affected.push(document_id.clone());
            }
            !room.subscribers.is_empty()
        });
        affected
    }

    /// Deliver a message to every subscriber of a document except
    /// `except_session`. Failed sends prune the subscriber and never
    /// surface to the caller.
    pub async fn broadcast(
        &self,
        document_id: &str,
        message: &ServerMessage,
        except_session: Option<&str>,
    ) {
        let mut rooms = self.rooms.write().await;
        let Some(room) = rooms.get_mut(document_id) else {
            return;
        };
        room.subscribers.retain(|session_id, sub| {
            if Some(session_id.as_str()) == except_session {
                return true;
            }
            if sub.sender.send(message.clone()).is_ok() {
                true
            } else {
                tracing::debug!(document_id, session_id, "pruning dead subscriber");
                false
            }
        });
        if room.subscribers.is_empty() {
            rooms.remove(document_id);
        }
    }

    /// Current membership of a document's room.
    pub async fn participants(&self, document_id: &str) -> Vec<Participant> {
        let rooms = self.rooms.read().await;
        rooms.get(document_id).map_or_else(Vec::new, |room| {
            let mut list: Vec<Participant> = room
                .subscribers
                .iter()
                .map(|(session_id, sub)| Participant {
                    user_id: sub.user_id.clone(),
                    session_id: session_id.clone(),
                })
                .collect();
            list.sort_by(|a, b| a.session_id.cmp(&b.session_id));
            list
        })
    }

    pub async fn is_subscribed(&self, document_id: &str, session_id: &str) -> bool {
        let rooms = self.rooms.read().await;
        rooms
            .get(document_id)
            .is_some_and(|room| room.subscribers.contains_key(session_id))
    }
}
