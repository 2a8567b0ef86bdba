//! WebSocket relay integration tests
//!
//! Runs the relay on an ephemeral port and drives it with real
//! tokio-tungstenite clients.

use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use pagesync_host::auth;
use pagesync_host::hub::SyncHub;
use pagesync_host::model::SpliceModel;
use pagesync_host::store::MemoryStore;
use pagesync_host::ws;
use pagesync_protocol::{ClientMessage, DiffEnvelope, ServerMessage, Step};
use serde_json::json;
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

type WsClient = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

const SECRET: &str = "integration-test-secret";

fn insert_step(from: u64, to: u64, text: &str) -> Step {
    Step::new(json!({"from": from, "to": to, "insert": text}))
}

/// Start a relay with one bootstrapped document, return its address.
async fn start_relay() -> std::net::SocketAddr {
    let hub = Arc::new(SyncHub::new(
        Arc::new(MemoryStore::new()),
        Arc::new(SpliceModel),
        1000,
    ));
    hub.create_document(
        "doc",
        &DiffEnvelope {
            request_id: 0,
            client_id: "seed".to_string(),
            base_version: 0,
            steps: vec![insert_step(0, 0, "")],
        },
        "seed",
    )
    .await
    .unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        if let Err(e) = ws::serve(listener, hub, Arc::new(SECRET.to_string())).await {
            eprintln!("Server error: {e}");
        }
    });
    addr
}

async fn connect(addr: std::net::SocketAddr, user_id: &str) -> WsClient {
    let now = chrono::Utc::now().timestamp();
    let token = auth::seal_token(SECRET, user_id, now, 3600);
    let url = format!("ws://{addr}/?token={token}");
    let (ws, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
    ws
}

async fn send(ws: &mut WsClient, msg: &ClientMessage) {
    let text = serde_json::to_string(msg).unwrap();
    ws.send(Message::Text(text)).await.unwrap();
}

/// Next server message, skipping transport frames.
async fn recv(ws: &mut WsClient) -> ServerMessage {
    loop {
        let frame = tokio::time::timeout(std::time::Duration::from_secs(5), ws.next())
            .await
            .expect("timed out waiting for server message")
            .expect("connection closed")
            .expect("websocket error");
        match frame {
            Message::Text(text) => return serde_json::from_str(&text).unwrap(),
            Message::Ping(_) | Message::Pong(_) => {}
            other => panic!("unexpected frame: {other:?}"),
        }
    }
}

/// Next remote diff, skipping participant updates.
async fn recv_remote_diff(ws: &mut WsClient) -> (u64, String) {
    loop {
        match recv(ws).await {
            ServerMessage::RemoteDiff {
                version,
                origin_client_id,
                ..
            } => return (version, origin_client_id),
            ServerMessage::Connections { .. } => {}
            other => panic!("unexpected message: {other:?}"),
        }
    }
}

#[tokio::test]
async fn test_subscribe_and_commit_over_socket() {
    let addr = start_relay().await;
    let mut ws = connect(addr, "alice").await;

    assert!(matches!(recv(&mut ws).await, ServerMessage::Welcome { .. }));

    send(
        &mut ws,
        &ClientMessage::Subscribe {
            document_id: "doc".to_string(),
            known_version: Some(0),
        },
    )
    .await;
    assert!(matches!(
        recv(&mut ws).await,
        ServerMessage::Subscribed { .. }
    ));

    send(
        &mut ws,
        &ClientMessage::Diff {
            document_id: "doc".to_string(),
            envelope: DiffEnvelope {
                request_id: 1,
                client_id: "a".to_string(),
                base_version: 0,
                steps: vec![insert_step(0, 0, "hello")],
            },
        },
    )
    .await;

    loop {
        match recv(&mut ws).await {
            ServerMessage::Ack {
                request_id,
                committed_version,
            } => {
                assert_eq!(request_id, 1);
                assert_eq!(committed_version, 1);
                break;
            }
            ServerMessage::Connections { .. } => {}
            other => panic!("unexpected message: {other:?}"),
        }
    }
}

#[tokio::test]
async fn test_remote_diff_reaches_other_subscriber() {
    let addr = start_relay().await;
    let mut ws_a = connect(addr, "alice").await;
    let mut ws_b = connect(addr, "bob").await;

    for ws in [&mut ws_a, &mut ws_b] {
        assert!(matches!(recv(ws).await, ServerMessage::Welcome { .. }));
        send(
            ws,
            &ClientMessage::Subscribe {
                document_id: "doc".to_string(),
                known_version: Some(0),
            },
        )
        .await;
        assert!(matches!(recv(ws).await, ServerMessage::Subscribed { .. }));
    }

    send(
        &mut ws_a,
        &ClientMessage::Diff {
            document_id: "doc".to_string(),
            envelope: DiffEnvelope {
                request_id: 1,
                client_id: "a".to_string(),
                base_version: 0,
                steps: vec![insert_step(0, 0, "hi")],
            },
        },
    )
    .await;

    // B gets the committed diff; the originator only gets the ack.
    let (version, origin) = recv_remote_diff(&mut ws_b).await;
    assert_eq!(version, 1);
    assert_eq!(origin, "a");
}

#[tokio::test]
async fn test_get_document_returns_folded_content() {
    let addr = start_relay().await;
    let mut ws = connect(addr, "alice").await;
    assert!(matches!(recv(&mut ws).await, ServerMessage::Welcome { .. }));

    send(
        &mut ws,
        &ClientMessage::GetDocument {
            document_id: "doc".to_string(),
        },
    )
    .await;
    match recv(&mut ws).await {
        ServerMessage::DocData {
            document_id,
            version,
            content,
        } => {
            assert_eq!(document_id, "doc");
            assert_eq!(version, 0);
            assert_eq!(content, json!(""));
        }
        other => panic!("unexpected message: {other:?}"),
    }
}

#[tokio::test]
async fn test_invalid_token_rejected() {
    let addr = start_relay().await;
    let url = format!("ws://{addr}/?token=not.a.real-token");

    match tokio_tungstenite::connect_async(&url).await {
        Ok((mut ws, _)) => {
            // Server accepts the handshake but must close without a welcome
            match ws.next().await {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => {}
                Some(Ok(msg)) => panic!("invalid token got data: {msg:?}"),
            }
        }
        Err(_) => {} // rejected at handshake, also fine
    }
}

#[tokio::test]
async fn test_missing_token_rejected() {
    let addr = start_relay().await;
    let url = format!("ws://{addr}/");

    if let Ok((mut ws, _)) = tokio_tungstenite::connect_async(&url).await {
        match ws.next().await {
            Some(Ok(Message::Close(_))) | Some(Err(_)) | None => {}
            Some(Ok(msg)) => panic!("tokenless connection got data: {msg:?}"),
        }
    }
}
