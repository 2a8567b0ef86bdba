//! Sealed session tokens
//!
//! A connecting client proves its user identity with a sealed token minted
//! by the platform's authentication layer: `user_id.expires_at.mac`, where
//! `mac` is HMAC-SHA256 over `user_id.expires_at` keyed with the shared
//! secret. The relay only unseals and checks expiry; issuing sessions is
//! the platform's job.

use std::fs::{File, Permissions};
use std::io::{Read, Write};
use std::path::Path;

use anyhow::{Context, Result};
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;
use thiserror::Error;

/// Length of the shared secret in bytes (32 bytes = 256 bits)
const SECRET_LENGTH: usize = 32;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("token is malformed")]
    Malformed,

    #[error("token expired at {0}")]
    Expired(i64),

    #[error("token signature mismatch")]
    BadSignature,
}

/// Identity carried by a verified token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthClaims {
    pub user_id: String,
    pub expires_at: i64,
}

/// Generate a cryptographically secure shared secret
pub fn generate_secret() -> String {
    let mut bytes = [0u8; SECRET_LENGTH];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

fn sign(secret: &str, payload: &str) -> Vec<u8> {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC can take key of any size");
    mac.update(payload.as_bytes());
    mac.finalize().into_bytes().to_vec()
}

/// Mint a sealed token for `user_id`, valid for `ttl_secs` from `now`
/// (unix seconds).
pub fn seal_token(secret: &str, user_id: &str, now: i64, ttl_secs: i64) -> String {
    let expires_at = now + ttl_secs;
    let payload = format!("{user_id}.{expires_at}");
    format!("{payload}.{}", hex::encode(sign(secret, &payload)))
}

/// Unseal and verify a token against `now` (unix seconds). Signature is
/// checked in constant time.
pub fn verify_token(secret: &str, token: &str, now: i64) -> Result<AuthClaims, AuthError> {
    // user_id may itself contain dots; mac and expiry are the last two
    // segments.
    let mut parts = token.rsplitn(3, '.');
    let mac_hex = parts.next().ok_or(AuthError::Malformed)?;
    let expires_str = parts.next().ok_or(AuthError::Malformed)?;
    let user_id = parts.next().ok_or(AuthError::Malformed)?;
    if user_id.is_empty() {
        return Err(AuthError::Malformed);
    }
    let expires_at: i64 = expires_str.parse().map_err(|_| AuthError::Malformed)?;
    let mac = hex::decode(mac_hex).map_err(|_| AuthError::Malformed)?;

    let payload = format!("{user_id}.{expires_at}");
    let mut verifier =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC can take key of any size");
    verifier.update(payload.as_bytes());
    verifier
        .verify_slice(&mac)
        .map_err(|_| AuthError::BadSignature)?;

    if expires_at <= now {
        return Err(AuthError::Expired(expires_at));
    }
    Ok(AuthClaims {
        user_id: user_id.to_string(),
        expires_at,
    })
}

/// Write the shared secret to a file with secure permissions (0600)
#[cfg(unix)]
pub fn write_secret_file(path: &Path, secret: &str) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let mut file = File::create(path).context("Failed to create secret file")?;
    file.write_all(secret.as_bytes())
        .context("Failed to write secret")?;
    file.set_permissions(Permissions::from_mode(0o600))
        .context("Failed to set secret file permissions")?;
    Ok(())
}

#[cfg(not(unix))]
pub fn write_secret_file(path: &Path, secret: &str) -> Result<()> {
    let mut file = File::create(path).context("Failed to create secret file")?;
    file.write_all(secret.as_bytes())
        .context("Failed to write secret")?;
    Ok(())
}

/// Read the shared secret from a file
pub fn read_secret_file(path: &Path) -> Result<String> {
    let mut file = File::open(path).context("Failed to open secret file")?;
    let mut secret = String::new();
    file.read_to_string(&mut secret)
        .context("Failed to read secret file")?;
    Ok(secret.trim().to_string())
}

/// Resolve the secret from config (inline takes priority over env, env
/// over file)
pub fn resolve_secret(inline: Option<&str>, secret_file: Option<&str>) -> Result<Option<String>> {
    if let Some(secret) = inline {
        if !secret.is_empty() {
            return Ok(Some(secret.to_string()));
        }
    }

    if let Ok(env_secret) = std::env::var("PAGESYNC_SECRET") {
        if !env_secret.is_empty() {
            return Ok(Some(env_secret));
        }
    }
    if let Some(file_path) = secret_file {
        if !file_path.is_empty() {
            let secret = read_secret_file(Path::new(file_path))?;
            return Ok(Some(secret));
        }
    }
    Ok(None)
}
