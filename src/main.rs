//! Typerace Server
//!
//! Runs the race coordination engine: a WebSocket server for live race
//! events and a thin HTTP API for room creation and lookup.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use typerace::content::BuiltinContent;
use typerace::http::{build_router, HttpContext};
use typerace::network::auth::AuthConfig;
use typerace::network::server::{RaceServer, ServerConfig};
use typerace::race::coordinator::{RaceConfig, RaceCoordinator};
use typerace::store::MemoryStore;

fn addr_from_env(var: &str, default: &str) -> SocketAddr {
    std::env::var(var)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or_else(|| default.parse().expect("static default address"))
}

fn process_seed() -> u64 {
    u64::from_le_bytes(Uuid::new_v4().as_bytes()[..8].try_into().unwrap_or([0; 8]))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Typerace Server v{}", typerace::VERSION);

    let ws_addr = addr_from_env("TYPERACE_WS_ADDR", "0.0.0.0:8080");
    let http_addr = addr_from_env("TYPERACE_HTTP_ADDR", "0.0.0.0:5000");

    let auth = AuthConfig::from_env();
    if !auth.is_configured() {
        warn!("No AUTH_SECRET or AUTH_PUBLIC_KEY_PEM set; REST requests will be rejected");
    }

    let store = Arc::new(MemoryStore::new());
    let content = Arc::new(BuiltinContent::new(process_seed()));
    let coordinator = RaceCoordinator::new(RaceConfig::default(), store, content);

    // HTTP API
    let router = build_router(Arc::new(HttpContext {
        coordinator: coordinator.clone(),
        auth,
    }));
    let http_listener = tokio::net::TcpListener::bind(http_addr)
        .await
        .with_context(|| format!("binding HTTP listener on {http_addr}"))?;
    info!("HTTP API listening on {}", http_addr);
    let http_task = tokio::spawn(async move {
        if let Err(e) = axum::serve(http_listener, router).await {
            warn!("HTTP server exited: {}", e);
        }
    });

    // WebSocket race server (runs the matchmaking loop internally)
    let server = RaceServer::new(
        ServerConfig {
            bind_addr: ws_addr,
            ..Default::default()
        },
        coordinator,
    );
    server.run().await.context("race server failed")?;

    http_task.abort();
    Ok(())
}
