//! Configuration system for pagesync
//!
//! Reads config from ~/.config/pagesync/config.toml

use std::path::PathBuf;

use serde::Deserialize;

/// Server configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub ws_port: u16,
    pub http_port: u16,
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            ws_port: 9001,
            http_port: 8080,
            bind: "127.0.0.1".to_string(),
        }
    }
}

/// Storage configuration
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Path to the diff log database. Defaults to
    /// ~/.local/share/pagesync/diffs.db when unset.
    pub db_path: Option<String>,
}

impl StorageConfig {
    pub fn resolved_db_path(&self) -> PathBuf {
        self.db_path.as_ref().map_or_else(
            || {
                dirs::data_dir()
                    .unwrap_or_else(|| PathBuf::from("."))
                    .join("pagesync")
                    .join("diffs.db")
            },
            PathBuf::from,
        )
    }
}

/// Authentication configuration
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Shared secret for session tokens (inline)
    pub secret: Option<String>,
    /// Path to a file holding the shared secret
    pub secret_file: Option<String>,
}

/// Synchronization tuning
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// How many committed diffs to keep in memory per document for
    /// rebasing stale submissions
    pub history_limit: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            history_limit: 1000,
        }
    }
}

/// Full application configuration
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub auth: AuthConfig,
    pub sync: SyncConfig,
}

impl Config {
    /// Load configuration from default path
    pub fn load() -> Self {
        let config_path = Self::default_config_path();
        Self::load_from_path(&config_path).unwrap_or_default()
    }

    /// Get default config path
    pub fn default_config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("pagesync")
            .join("config.toml")
    }

    /// Load from specific path
    pub fn load_from_path(path: &PathBuf) -> Option<Self> {
        let content = std::fs::read_to_string(path).ok()?;
        match toml::from_str(&content) {
            Ok(config) => Some(config),
            Err(e) => {
                eprintln!("  [warn] Failed to parse {}: {e}", path.display());
                None
            }
        }
    }

    /// Create default config file if it doesn't exist
    pub fn create_default_if_missing() {
        let path = Self::default_config_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                let _ = std::fs::create_dir_all(parent);
            }
            let default_config = r#"# pagesync Configuration

[server]
ws_port = 9001
http_port = 8080
bind = "127.0.0.1"

[storage]
# db_path = "/var/lib/pagesync/diffs.db"

[auth]
# secret = "hex-encoded shared secret"
# secret_file = "/etc/pagesync/secret"

[sync]
history_limit = 1000
"#;
            let _ = std::fs::write(&path, default_config);
        }
    }
}
