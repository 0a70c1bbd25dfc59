// =============================================================================
// Meridian Broker Gateway — Main Entry Point
// =============================================================================
//
// The gateway starts read-only: trading-side tools stay disabled until the
// operator turns on ENABLE_TRADING (and the per-domain flags) explicitly.
// A failed broker connection at startup is tolerated; the process serves
// read endpoints and the operator reconnects via the reconnect tool.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod api;
mod app_state;
mod audit;
mod config;
mod error;
mod forex;
mod ibkr;
mod orders;
mod portfolio;
mod resolve;
mod safety;
mod tools;
mod types;

use std::sync::Arc;

use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::app_state::AppState;
use crate::config::Settings;
use crate::ibkr::bridge::WsBridge;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & logging ─────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║        Meridian Broker Gateway — Starting Up             ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    let settings = Settings::from_env();
    if !settings.enable_trading {
        info!("trading is DISABLED; the gateway starts read-only");
    }
    if settings.require_paper_account_verification {
        info!(
            prefixes = ?settings.allowed_account_prefixes,
            "paper account verification is ON"
        );
    } else {
        warn!("paper account verification is OFF; live accounts will NOT be blocked");
    }

    // ── 2. Build shared state over the bridge transport ──────────────────
    let bridge = Arc::new(WsBridge::new(settings.bridge_url.clone()));
    let bind_addr = settings.bind_addr.clone();
    let state = AppState::new(settings, bridge);
    state.spawn_background_tasks();

    // ── 3. Connect the broker session ────────────────────────────────────
    match state.connect_broker().await {
        Ok(account) => info!(account = %account, "broker session established"),
        Err(e) => warn!(
            error = %e,
            "broker connection failed at startup; use the reconnect_broker tool"
        ),
    }

    // ── 4. Serve the API ─────────────────────────────────────────────────
    let app = api::rest::router(state.clone());
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!(addr = %bind_addr, "API server listening");

    let server = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            warn!(error = %e, "API server stopped");
        }
    });

    info!("All subsystems running. Press Ctrl+C to stop.");

    // ── 5. Graceful shutdown ─────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("Shutdown signal received — stopping gracefully");

    state.session.disconnect().await;
    server.abort();

    info!("Meridian gateway shut down complete.");
    Ok(())
}
