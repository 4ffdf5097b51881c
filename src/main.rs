#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! # pillarctl
//!
//! Dashboard backend for managing an EthPillar Ethereum node over SSH.
//!
//! The browser never talks to the node directly: it opens a session here with
//! the node's SSH credentials, gets an `ssh_session` cookie, and from then on
//! runs commands over REST and watches logs and service status over a
//! WebSocket. One SSH connection per session is pooled and shared by every
//! request and socket belonging to that session.
//!
//! ## API surface
//!
//! | Method | Path                      | Description                        |
//! |--------|---------------------------|------------------------------------|
//! | GET    | `/api/health`             | Liveness, uptime, connection counts|
//! | POST   | `/api/session/connect`    | Open SSH session, set cookie       |
//! | POST   | `/api/session/disconnect` | Close session, clear cookie        |
//! | POST   | `/api/exec`               | One-shot command execution         |
//! | GET    | `/api/ws`                 | Realtime logs + status gateway     |
//!
//! ## Architecture
//!
//! ```text
//! main.rs       — entry point, clap, composition root, background tasks
//! config.rs     — TOML + env-var configuration
//! error.rs      — error taxonomy, HTTP mapping, shell-noise cleanup
//! store/        — session registry: backend trait, Redis, memory fallback
//! ssh/          — transport traits, russh client, command executor
//! pool.rs       — session-keyed connection pool, single-flight acquire
//! mux/          — journal tails and status polling per connection
//! ws/           — gateway protocol and connection state machine
//! routes/       — REST handlers
//! state.rs      — shared AppState
//! ```

use std::sync::atomic::Ordering;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tracing::info;

use pillarctl::ssh::SshConnector;
use pillarctl::{AppState, Config, ConnectionPool, SessionStore};

/// Dashboard backend for managing an EthPillar Ethereum node over SSH.
#[derive(Parser)]
#[command(name = "pillarctl", version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP/WS server (default when no subcommand given).
    Serve {
        /// Path to TOML config file.
        #[arg(long)]
        config: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Serve { config }) => run_server(config.as_deref()).await,
        None => run_server(None).await,
    }
}

async fn run_server(config_path: Option<&str>) {
    let config = Config::load(config_path);

    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone());
    tracing_subscriber::fmt().with_env_filter(log_filter).init();

    info!("pillarctl v{} starting", env!("CARGO_PKG_VERSION"));
    info!("Listening on {}", config.server.listen);

    // Composition root: everything downstream receives its dependencies
    // here, nothing reaches for globals.
    let config = Arc::new(config);
    let store = SessionStore::from_config(&config).await;
    let connector = Arc::new(SshConnector::new(config.ssh.clone()));
    let pool = ConnectionPool::new(Arc::clone(&store), connector);
    let state = AppState::new(Arc::clone(&config), Arc::clone(&store), Arc::clone(&pool));

    let app = pillarctl::routes::router(state.clone());

    // Periodic sweep: expire idle sessions and close their SSH handles.
    let sweep_store = Arc::clone(&store);
    let sweep_pool = Arc::clone(&pool);
    let sweep_interval = config.session.sweep_interval_secs;
    let sweep_task = tokio::spawn(async move {
        let mut interval =
            tokio::time::interval(tokio::time::Duration::from_secs(sweep_interval.max(1)));
        interval.tick().await;
        loop {
            interval.tick().await;
            for session_id in sweep_store.sweep().await {
                sweep_pool.release(&session_id).await;
            }
            // Pooled handles whose session vanished out-of-band (deleted
            // straight in Redis) get closed here too.
            for session_id in sweep_pool.session_ids().await {
                if !sweep_store.exists(&session_id).await.unwrap_or(true) {
                    sweep_pool.release(&session_id).await;
                }
            }
        }
    });

    // Heartbeat: periodic connection-count log line.
    let heartbeat_state = state.clone();
    let heartbeat_interval = config.server.heartbeat_interval_secs;
    let heartbeat_task = tokio::spawn(async move {
        let mut interval =
            tokio::time::interval(tokio::time::Duration::from_secs(heartbeat_interval.max(1)));
        interval.tick().await;
        loop {
            interval.tick().await;
            info!(
                "Heartbeat: {} websocket connection(s), {} pooled session(s)",
                heartbeat_state.ws_connections.load(Ordering::Relaxed),
                heartbeat_state.pool.session_ids().await.len()
            );
        }
    });

    let listener = TcpListener::bind(&config.server.listen)
        .await
        .expect("Failed to bind");

    info!("Server ready");

    let shutdown = async {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            let mut sigterm =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect("Failed to register SIGTERM");
            tokio::select! {
                _ = ctrl_c => info!("Received SIGINT"),
                _ = sigterm.recv() => info!("Received SIGTERM"),
            }
        }
        #[cfg(not(unix))]
        {
            ctrl_c.await.ok();
            info!("Received SIGINT");
        }
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .expect("Server error");

    info!("Shutting down...");
    sweep_task.abort();
    heartbeat_task.abort();

    // Close every SSH transport; durable session records stay put so cookies
    // keep working across the restart.
    pool.shutdown().await;
    info!("Goodbye");
}
