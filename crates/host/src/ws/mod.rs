//! Async WebSocket server using tokio-tungstenite
//!
//! Handles multiple concurrent sync sessions. Includes origin validation,
//! sealed-token authentication and per-connection rate limiting.
//!
//! ## Module Structure
//! - `protocol`: URI parsing, origin validation
//! - `connection`: WebSocket handshake, heartbeat, message bridging
//! - `commands`: dispatch of parsed client messages to the hub

mod commands;
mod connection;
mod protocol;
mod rate_limit;

pub use rate_limit::MessageBudget;

use std::sync::Arc;

use anyhow::Result;
use tokio::net::TcpListener;

use crate::hub::SyncHub;

// Re-export for external use
pub use connection::ConnectionInfo;
pub use protocol::{parse_token_from_uri, validate_origin, ALLOWED_ORIGINS};

/// Main async WebSocket server
///
/// Takes an already-bound listener so callers (and tests) control the
/// port.
pub async fn serve(listener: TcpListener, hub: Arc<SyncHub>, secret: Arc<String>) -> Result<()> {
    if let Ok(addr) = listener.local_addr() {
        tracing::info!(addr = %addr, "WebSocket server listening");
    }

    loop {
        match listener.accept().await {
            Ok((stream, _addr)) => {
                let hub = hub.clone();
                let secret = secret.clone();

                tokio::spawn(async move {
                    if let Err(e) = connection::handle_connection(stream, hub, secret).await {
                        tracing::warn!(error = %e, "Connection error");
                    }
                });
            }
            Err(e) => {
                tracing::error!(error = %e, "Accept failed");
            }
        }
    }
}
