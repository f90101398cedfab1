//! # termgate
//!
//! Web bastion gateway bridging browser sessions to remote-administration
//! back-ends.
//!
//! Browser clients establish a session over HTTP, then bind a WebSocket that
//! the gateway bridges to either the configured SSH relay (character
//! sessions) or a Guacamole daemon (RDP/VNC). Administrators can observe any
//! live session read-only and terminate sessions; session metadata is kept in
//! a relational store.
//!
//! ## API surface
//!
//! | Method | Path                                         | Description                        |
//! |--------|----------------------------------------------|------------------------------------|
//! | GET    | `/health`                                    | Liveness probe                     |
//! | POST   | `/connect/{asset_id}/{account_id}/{protocol}`| Establish a session                |
//! | GET    | `/connect/{session_id}`                      | WebSocket bind (primary client)    |
//! | GET    | `/connect/monitor/{session_id}`              | WebSocket attach (admin observer)  |
//! | POST   | `/connect/close/{session_id}`                | Terminate a session (admin)        |
//!
//! Identity comes from the fronting auth layer via `x-auth-*` headers; this
//! process never sees credentials beyond the relay account it is configured
//! with.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use termgate::config::Config;
use termgate::i18n::Catalog;
use termgate::session::registry::{offline_session, SessionRegistry};
use termgate::state::AppState;
use termgate::store::Db;
use termgate::{routes, ws};

/// Web bastion gateway for SSH/RDP/VNC sessions.
#[derive(Parser)]
#[command(name = "termgate", version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the gateway (default when no subcommand given).
    Serve {
        /// Path to TOML config file.
        #[arg(long)]
        config: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let config_path = match cli.command {
        Some(Commands::Serve { config }) => config,
        None => None,
    };
    run_server(config_path.as_deref()).await;
}

async fn run_server(config_path: Option<&str>) {
    let config = Config::load(config_path);

    // Initialize tracing
    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone());
    tracing_subscriber::fmt().with_env_filter(log_filter).init();

    info!("termgate v{} starting", env!("CARGO_PKG_VERSION"));
    info!("Relay: {}:{}", config.relay.host, config.relay.port);
    info!("Listening on {}", config.server.listen);

    if config.relay.password == "change-me" {
        warn!("Using default relay password — set TERMGATE_RELAY_PASSWORD or update config");
    }
    if config.relay.host_key_fingerprint.is_none() {
        warn!("Relay host key is not pinned — set relay.host_key_fingerprint");
    }

    let db = Db::connect(&config.database.url)
        .await
        .expect("Failed to connect database");
    let catalog = Catalog::load(&config.i18n.dir, &config.i18n.default_lang);

    let state = AppState {
        config: Arc::new(config),
        db,
        registry: Arc::new(SessionRegistry::new()),
        catalog: Arc::new(catalog),
    };

    let app = Router::new()
        .route("/health", get(routes::health::health))
        .route(
            "/connect/{asset_id}/{account_id}/{protocol}",
            post(routes::connect::connect),
        )
        .route("/connect/{session_id}", get(ws::ws_connect))
        .route("/connect/monitor/{session_id}", get(ws::monitor::ws_monitor))
        .route(
            "/connect/close/{session_id}",
            post(routes::connect::close_session),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state.clone());

    let listener = TcpListener::bind(&state.config.server.listen)
        .await
        .expect("Failed to bind");

    info!("Server ready");

    // Graceful shutdown
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

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await
    .expect("Server error");

    // Cleanup: unwind every live session so monitors get their farewell and
    // connectors stop.
    info!("Shutting down...");
    for session_id in state.registry.session_ids() {
        if let Some(session) = state.registry.load(&session_id) {
            if let Some(bus) = session.bus.lock().await.clone() {
                bus.close_away();
            }
        }
        offline_session(&state.registry, &state.catalog, &session_id, None).await;
    }
    info!("Goodbye");
}
