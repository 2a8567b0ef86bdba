//! Protocol utilities for WebSocket handshakes
//!
//! Handles URI parsing and origin validation.

use url::Url;

/// Allowed origins for WebSocket connections
/// Only localhost is allowed by default for security
pub const ALLOWED_ORIGINS: &[&str] = &[
    "http://localhost",
    "http://127.0.0.1",
    "https://localhost",
    "https://127.0.0.1",
];

/// Parse the sealed session token from the URI query string
/// Format: /?token=<sealed token>
pub fn parse_token_from_uri(uri: &str) -> Option<String> {
    if let Some(query_start) = uri.find('?') {
        let query = &uri[query_start + 1..];
        for param in query.split('&') {
            if let Some(eq_pos) = param.find('=') {
                let key = &param[..eq_pos];
                let value = &param[eq_pos + 1..];
                if key == "token" && !value.is_empty() {
                    return Some(value.to_string());
                }
            }
        }
    }
    None
}

/// Validate origin header against whitelist using strict URL parsing
///
/// This function parses both the origin and allowed origins as URLs,
/// then compares scheme and host exactly. This prevents bypass attacks
/// like `http://localhost.evil.com` which would pass a naive `starts_with` check.
pub fn validate_origin(origin: &str) -> bool {
    let Ok(origin_url) = Url::parse(origin) else {
        return false;
    };

    let origin_host = origin_url.host_str().unwrap_or("");
    let origin_scheme = origin_url.scheme();

    ALLOWED_ORIGINS.iter().any(|allowed| {
        let Ok(allowed_url) = Url::parse(allowed) else {
            return false;
        };

        let allowed_host = allowed_url.host_str().unwrap_or("");
        let allowed_scheme = allowed_url.scheme();

        // Strict comparison: scheme and host must match exactly
        origin_scheme == allowed_scheme && origin_host == allowed_host
    })
}
