mod channel;
mod cli;
mod config;
mod handlers;
mod protocol;
mod registry;
mod storage;
mod target;
mod websocket;

use axum::{
    routing::{get, post},
    Router,
};
use clap::Parser;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::{
    cli::Cli,
    config::Config,
    handlers::{
        get_target, health_check, list_targets, remove_target, run_target, set_target_status,
        stop_target,
    },
    registry::{Registry, SharedRegistry},
    storage::Storage,
    websocket::{device_ws_handler, observer_ws_handler, WsState},
};

#[tokio::main]
async fn main() {
    // Default to INFO if RUST_LOG is not set
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info");
    }
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();

    // Debug-client subcommands short-circuit the server
    if let Some(command) = cli.command {
        if let Err(e) = cli::run_client(command).await {
            error!("debug client error: {}", e);
            std::process::exit(1);
        }
        return;
    }

    let config = Config::from_env();
    info!("starting companion hub on port {}", config.port);

    // Persistence is a should-have, not a must-have: without it the hub
    // serves from memory and known targets simply do not survive a restart.
    let storage = match Storage::connect(&config.redis_url).await {
        Ok(storage) => {
            info!("persistence store connected: {}", config.redis_url);
            Some(storage)
        }
        Err(e) => {
            warn!("persistence store unavailable, serving from memory only: {}", e);
            None
        }
    };

    let registry: SharedRegistry = Arc::new(Registry::new(storage));
    registry.load_persisted().await;

    let ws_state = WsState {
        registry: registry.clone(),
        handshake_timeout: config.handshake_timeout(),
    };

    let http_routes = Router::new()
        .route("/health", get(health_check))
        .route("/targets", get(list_targets))
        .route("/targets/:identity", get(get_target).delete(remove_target))
        .route("/targets/:identity/run", post(run_target))
        .route("/targets/:identity/stop", post(stop_target))
        .route("/targets/:identity/status", post(set_target_status))
        .with_state(registry);

    let ws_routes = Router::new()
        .route("/ws/device", get(device_ws_handler))
        .route("/ws/observer", get(observer_ws_handler))
        .with_state(ws_state);

    let app = Router::new()
        .merge(http_routes)
        .merge(ws_routes)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("Failed to bind to address");

    info!("companion hub listening on {}", addr);

    axum::serve(listener, app)
        .await
        .expect("Failed to start server");
}
