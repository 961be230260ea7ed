//! Process entry point: parses configuration, builds shared state, and
//! serves the `/ws` duplex upgrade plus the status/metrics/static HTTP surface.

mod config;
mod gateway;
mod state;
mod status;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::routing::get;
use axum::Router;
use clap::Parser;
use tower_http::cors::{Any, CorsLayer};
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;

use config::Config;
use state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = Config::parse();
    tracing::info!(
        product = %config.product.product_name,
        maintenance = config.product.maintenance_mode,
        endpoints = config.endpoints.urls().len(),
        "starting"
    );

    let state = Arc::new(AppState::new(&config));

    let app = Router::new()
        .route("/ws", get(gateway::upgrade))
        .route("/api/status", get(status::status))
        .route("/api/metrics", get(status::metrics))
        .fallback_service(ServeDir::new(&config.public_dir).append_index_html_on_directories(true))
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(config.bind).await?;
    tracing::info!(addr = %config.bind, "listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}
