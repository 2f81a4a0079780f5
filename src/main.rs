use axum::{
    routing::{get, post},
    Router,
};
use clap::Parser;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use viewlink::{
    cli::{run_debug_agent, Cli, Commands},
    config::Config,
    frames, handlers, monitor,
    registry::SessionRegistry,
    storage::DirectoryStore,
    ws_agent::agent_ws_handler,
    ws_viewer::viewer_ws_handler,
};

#[tokio::main]
async fn main() {
    // Default to INFO if RUST_LOG is not set.
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info");
    }
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();

    // Check if running as a synthetic debug agent.
    if let Some(Commands::Agent {
        url,
        session,
        frames,
    }) = cli.command
    {
        if let Err(e) = run_debug_agent(url, session, frames).await {
            error!("debug agent error: {}", e);
            std::process::exit(1);
        }
        return;
    }

    // Otherwise, run as relay.
    let config = Config::from_env();
    info!("starting viewlink relay on port {}", config.port);
    info!("directory store: {}", config.redis_url);

    let store = match DirectoryStore::connect(&config.redis_url).await {
        Ok(store) => store,
        Err(e) => {
            error!("failed to connect to directory store: {}", e);
            std::process::exit(1);
        }
    };

    let registry = Arc::new(SessionRegistry::new(store.clone()));
    tokio::spawn(frames::run_decode_pipeline(registry.clone()));
    tokio::spawn(monitor::run_heartbeat_monitor(registry.clone()));

    let state = handlers::AppState { registry, store };
    let app = Router::new()
        .route("/health", get(handlers::health_check))
        .route("/sessions/request", post(handlers::request_session))
        .route("/sessions/stop", post(handlers::stop_session))
        .route("/sessions/monitor", post(handlers::start_monitor))
        .route("/ws/agent/:session_id", get(agent_ws_handler))
        .route("/ws/stream/:session_id", get(viewer_ws_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("Failed to bind to address");

    info!("viewlink listening on {}", addr);

    axum::serve(listener, app)
        .await
        .expect("Failed to start server");
}
