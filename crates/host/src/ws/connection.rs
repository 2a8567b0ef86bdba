//! WebSocket connection handling
//!
//! Manages individual connections including handshake, token
//! verification and bidirectional message bridging. Each connection gets
//! a single session id for its lifetime; subscriptions die with it.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::{
    handshake::server::{Request, Response},
    Message,
};

use pagesync_protocol::{ClientMessage, ServerMessage};

use crate::auth;
use crate::hub::SyncHub;

use super::commands::handle_client_message;
use super::protocol::{parse_token_from_uri, validate_origin};
use super::rate_limit::{MessageBudget, UNPARSED_COST};

/// Connection metadata extracted during WebSocket handshake
#[derive(Debug, Clone, Default)]
pub struct ConnectionInfo {
    pub token: Option<String>,
    pub origin: Option<String>,
    pub origin_valid: bool,
}

// Heartbeat configuration
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(300); // 5 minutes

/// Handle a single WebSocket connection
#[allow(clippy::too_many_lines)]
#[allow(clippy::significant_drop_tightening)]
pub async fn handle_connection<S>(stream: S, hub: Arc<SyncHub>, secret: Arc<String>) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    // Capture connection info during handshake
    let conn_info = Arc::new(std::sync::Mutex::new(ConnectionInfo::default()));
    let conn_info_clone = conn_info.clone();

    // Accept WebSocket with header callback
    let callback = move |req: &Request,
                         response: Response|
          -> std::result::Result<Response, http::Response<Option<String>>> {
        let mut info = conn_info_clone.lock().unwrap();

        // Extract the sealed session token from the URI
        let uri = req.uri().to_string();
        info.token = parse_token_from_uri(&uri);

        // Extract and validate origin
        if let Some(origin) = req.headers().get("origin") {
            if let Ok(origin_str) = origin.to_str() {
                info.origin = Some(origin_str.to_string());
                info.origin_valid = validate_origin(origin_str);
            }
        } else {
            // No origin header = same-origin request (OK)
            info.origin_valid = true;
        }

        Ok(response)
    };

    let ws = tokio_tungstenite::accept_hdr_async(stream, callback).await?;
    let (mut ws_tx, mut ws_rx) = ws.split();

    // Check origin validation result
    let info = conn_info.lock().unwrap().clone();
    if !info.origin_valid {
        tracing::warn!(
            origin = ?info.origin,
            "Rejected connection from invalid origin"
        );
        let _ = ws_tx.close().await;
        return Err(anyhow::anyhow!("Invalid origin"));
    }

    // Unseal the token. Connections without a valid token never reach the
    // hub.
    let now = chrono::Utc::now().timestamp();
    let claims = match info.token.as_deref().map(|t| auth::verify_token(&secret, t, now)) {
        Some(Ok(claims)) => claims,
        Some(Err(e)) => {
            tracing::warn!(error = %e, "Rejected connection with invalid token");
            let _ = ws_tx.close().await;
            return Err(anyhow::anyhow!("Invalid token"));
        }
        None => {
            tracing::warn!("Rejected connection without token");
            let _ = ws_tx.close().await;
            return Err(anyhow::anyhow!("Missing token"));
        }
    };

    let user_id = claims.user_id;
    let session_id = uuid::Uuid::new_v4().to_string();

    tracing::info!(
        session_id = %session_id,
        user_id = %user_id,
        "Session connected"
    );

    // Greet the client with its session id
    let welcome = serde_json::to_string(&ServerMessage::Welcome {
        session_id: session_id.clone(),
    })?;
    ws_tx.send(Message::Text(welcome)).await?;

    // Room broadcasts arrive on this channel; a dedicated task drains it
    // into the socket so the hub never blocks on a slow connection.
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();

    let ws_tx = Arc::new(tokio::sync::Mutex::new(ws_tx));
    let ws_tx_sender = ws_tx.clone();
    let sender_session_id = session_id.clone();

    let sender_handle = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let text = match serde_json::to_string(&msg) {
                Ok(text) => text,
                Err(e) => {
                    tracing::error!(error = %e, "Failed to encode broadcast");
                    continue;
                }
            };
            let mut tx = ws_tx_sender.lock().await;
            if tx.send(Message::Text(text)).await.is_err() {
                tracing::warn!(session_id = %sender_session_id, "Send failed, stopping sender");
                break;
            }
        }
    });

    // Message budget: 200 burst, 50/sec sustained, charged per class
    let mut budget = MessageBudget::for_session();

    let mut heartbeat_interval = tokio::time::interval(HEARTBEAT_INTERVAL);
    let mut last_activity = Instant::now();

    // ========================================
    // Main loop: client -> hub
    // With heartbeat to detect zombie connections
    // ========================================
    loop {
        tokio::select! {
            // Heartbeat tick - send ping
            _ = heartbeat_interval.tick() => {
                if last_activity.elapsed() > HEARTBEAT_TIMEOUT {
                    tracing::warn!(
                        session_id = %session_id,
                        elapsed_secs = last_activity.elapsed().as_secs(),
                        "Session heartbeat timeout, closing"
                    );
                    break;
                }

                let mut tx = ws_tx.lock().await;
                if tx.send(Message::Ping(vec![])).await.is_err() {
                    tracing::debug!(session_id = %session_id, "Ping send failed");
                    break;
                }
            }

            // WebSocket message
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Text(data))) => {
                        last_activity = Instant::now();

                        // Parse first so the budget can charge diffs more
                        // than queries, then drop if exhausted
                        let parsed = serde_json::from_str::<ClientMessage>(&data);
                        let cost = parsed
                            .as_ref()
                            .map_or(UNPARSED_COST, MessageBudget::cost_of);
                        if !budget.charge(cost) {
                            tracing::warn!(
                                session_id = %session_id,
                                "Message budget exhausted, dropping message"
                            );
                            continue;
                        }

                        let replies = match parsed {
                            Ok(msg) => {
                                handle_client_message(&hub, &session_id, &user_id, &tx, msg).await
                            }
                            Err(e) => vec![ServerMessage::Error {
                                request_id: None,
                                message: format!("unparseable message: {e}"),
                                fatal: false,
                            }],
                        };

                        let mut failed = false;
                        for reply in replies {
                            let text = serde_json::to_string(&reply)?;
                            let mut tx = ws_tx.lock().await;
                            if tx.send(Message::Text(text)).await.is_err() {
                                tracing::warn!(session_id = %session_id, "Failed to send reply");
                                failed = true;
                                break;
                            }
                        }
                        if failed {
                            break;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {
                        // Pong received - connection is alive
                        last_activity = Instant::now();
                    }
                    Some(Ok(Message::Close(_))) => {
                        break;
                    }
                    Some(Err(_e)) => {
                        break;
                    }
                    None => {
                        break;
                    }
                    _ => {}
                }
            }
        }
    }

    // Clean up sender task and room membership
    sender_handle.abort();
    hub.remove_session(&session_id).await;

    tracing::info!(session_id = %session_id, "Client disconnected");
    Ok(())
}
