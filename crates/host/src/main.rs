use std::net::TcpListener;
use std::sync::Arc;

use axum::Router;
use pagesync_host::api;
use pagesync_host::auth;
use pagesync_host::config::Config;
use pagesync_host::hub::SyncHub;
use pagesync_host::model::SpliceModel;
use pagesync_host::store::SqliteStore;
use pagesync_host::ws;
use tokio::signal;
use tower_http::cors::{Any, CorsLayer};

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Graceful start: Check if port is available
fn check_port_available(bind: &str, port: u16) -> bool {
    TcpListener::bind(format!("{bind}:{port}")).is_ok()
}

/// Graceful start: Find available port starting from default
fn find_available_port(bind: &str, start: u16) -> Option<u16> {
    (start..start + 10).find(|&port| check_port_available(bind, port))
}

fn pick_port(bind: &str, wanted: u16, label: &str) -> u16 {
    if check_port_available(bind, wanted) {
        return wanted;
    }
    eprintln!("  [warn]   {label} port {wanted} in use, finding alternative...");
    if let Some(p) = find_available_port(bind, wanted + 1) {
        eprintln!("  [check]  Using {label} port {p}");
        p
    } else {
        eprintln!(
            "  [error]  No available {label} ports in range {}-{}",
            wanted,
            wanted + 10
        );
        std::process::exit(1);
    }
}

/// Resolve the shared secret, generating and persisting one on first run.
fn resolve_or_generate_secret(config: &Config) -> anyhow::Result<String> {
    if let Some(secret) = auth::resolve_secret(
        config.auth.secret.as_deref(),
        config.auth.secret_file.as_deref(),
    )? {
        return Ok(secret);
    }

    let path = Config::default_config_path().with_file_name("secret");
    if path.exists() {
        return auth::read_secret_file(&path);
    }

    let secret = auth::generate_secret();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    auth::write_secret_file(&path, &secret)?;
    eprintln!("  [auth]   Generated new secret at {}", path.display());
    Ok(secret)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize structured logging (tracing)
    tracing_subscriber::fmt()
        .with_target(false)
        .with_level(true)
        .init();

    // Handle --version and --help
    let args: Vec<String> = std::env::args().collect();
    if args.len() > 1 {
        match args[1].as_str() {
            "--version" | "-v" => {
                println!("pagesync {VERSION}");
                return Ok(());
            }
            "--help" | "-h" => {
                println!("pagesync - Collaborative document sync relay");
                println!();
                println!("USAGE:");
                println!("    pagesync-host [OPTIONS]");
                println!();
                println!("OPTIONS:");
                println!("    -h, --help       Print help information");
                println!("    -v, --version    Print version");
                println!();
                println!("CONFIG:");
                println!("    ~/.config/pagesync/config.toml");
                println!();
                println!("ENDPOINTS:");
                println!("    ws://<bind>:<ws_port>/?token=...   Sync relay");
                println!("    http://<bind>:<http_port>/api      REST API");
                return Ok(());
            }
            _ => {}
        }
    }

    // === LOAD CONFIGURATION ===
    Config::create_default_if_missing();
    let config = Config::load();
    eprintln!(
        "  [config] Loaded from {}",
        Config::default_config_path().display()
    );

    // === GRACEFUL START ===
    let http_port = pick_port(&config.server.bind, config.server.http_port, "HTTP");
    let ws_port = pick_port(&config.server.bind, config.server.ws_port, "WS");

    let secret = Arc::new(resolve_or_generate_secret(&config)?);

    let db_path = config.storage.resolved_db_path();
    let store = Arc::new(SqliteStore::open(&db_path)?);
    eprintln!("  [store]  Diff log at {}", db_path.display());

    let hub = Arc::new(SyncHub::new(
        store,
        Arc::new(SpliceModel),
        config.sync.history_limit,
    ));

    eprintln!("  [http]   REST API on port {http_port}");
    eprintln!("  [ws]     Sync relay on port {ws_port}");
    eprintln!();
    eprintln!("  Press Ctrl+C to stop");
    eprintln!();

    // === START HTTP SERVER (axum) ===
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app_state = api::AppState {
        hub: hub.clone(),
        secret: secret.clone(),
        ws_port,
    };

    let app = Router::new()
        .nest("/api", api::api_router())
        .with_state(app_state)
        .layer(cors);

    let http_addr = format!("{}:{}", config.server.bind, http_port);
    let http_listener = tokio::net::TcpListener::bind(&http_addr).await?;
    let http_server = axum::serve(http_listener, app);

    let ws_addr = format!("{}:{}", config.server.bind, ws_port);
    let ws_listener = tokio::net::TcpListener::bind(&ws_addr).await?;

    // === GRACEFUL SHUTDOWN HANDLER ===
    let shutdown_signal = async {
        let ctrl_c = async {
            signal::ctrl_c()
                .await
                .expect("Failed to install Ctrl+C handler");
        };

        #[cfg(unix)]
        let terminate = async {
            signal::unix::signal(signal::unix::SignalKind::terminate())
                .expect("Failed to install SIGTERM handler")
                .recv()
                .await;
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            () = ctrl_c => {},
            () = terminate => {},
        }

        eprintln!();
        eprintln!("  [stop]   Graceful shutdown initiated...");
    };

    // Run both servers concurrently with shutdown handler
    tokio::select! {
        result = ws::serve(ws_listener, hub, secret) => {
            result?;
        }
        result = http_server => {
            if let Err(e) = result {
                eprintln!("  [error]  HTTP server error: {e}");
            }
        }
        () = shutdown_signal => {
            // Shutdown was triggered; pending diffs are already durable,
            // sockets drop with the process.
        }
    }

    Ok(())
}
