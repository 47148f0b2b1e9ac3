//! buff-api entry point.
//!
//! This file is intentionally thin: it sets up tracing, builds the shared
//! state from the environment, wires middleware, and starts the HTTP
//! server. All route handlers live in `routes.rs`; state in `state.rs`.

use std::{net::SocketAddr, sync::Arc};

use anyhow::Context;
use axum::http::HeaderValue;
use buff_api::{routes, state};
use tower_http::{
    cors::{AllowHeaders, AllowMethods, CorsLayer},
    trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer},
};
use tracing::{info, Level};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Dev convenience; silent when the file does not exist.
    let _ = dotenvy::from_filename(".env.local");

    init_tracing();

    let shared = Arc::new(state::AppState::from_env());
    let cors = cors_layer(shared.dev_ui_port);

    let app = routes::build_router(Arc::clone(&shared))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .layer(cors);

    let addr = bind_addr_from_env().unwrap_or_else(|| SocketAddr::from(([127, 0, 0, 1], 8780)));
    info!("buff-api listening on http://{}", addr);

    axum::serve(tokio::net::TcpListener::bind(addr).await?, app)
        .await
        .context("server crashed")?;

    Ok(())
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();
}

fn bind_addr_from_env() -> Option<SocketAddr> {
    std::env::var(state::BIND_ADDR_ENV).ok()?.parse().ok()
}

/// CORS: the UI origins plus an optional dev UI port; credentialed, all
/// methods and headers.
fn cors_layer(dev_ui_port: Option<u16>) -> CorsLayer {
    let mut allowed = vec![
        "http://localhost:3000".to_string(),
        "http://127.0.0.1:3000".to_string(),
    ];
    if let Some(port) = dev_ui_port {
        allowed.push(format!("http://localhost:{port}"));
        allowed.push(format!("http://127.0.0.1:{port}"));
    }

    let origins: Vec<HeaderValue> = allowed
        .iter()
        .filter_map(|o| HeaderValue::from_str(o).ok())
        .collect();

    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods(AllowMethods::mirror_request())
        .allow_headers(AllowHeaders::mirror_request())
        .allow_credentials(true)
}
