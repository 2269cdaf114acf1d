// =============================================================================
// Maestro Trading Core — Main Entry Point
// =============================================================================
//
// The control plane starts fail-safe: every user's kill-switch defaults to
// disabled and execution always terminates at the shadow-trade writer. A
// broker URL pointing anywhere but a paper host aborts startup.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod app_state;
mod clients;
mod config;
mod consensus;
mod errors;
mod executor;
mod heartbeat;
mod identity;
mod maestro;
mod materializer;
mod money;
mod performance;
mod regime;
mod risk;
mod store;
mod strategies;
mod types;
mod watchdog;
mod whale_flow;

use std::sync::Arc;

use chrono::Utc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::app_state::AppState;
use crate::clients::broker::PaperBrokerClient;
use crate::clients::llm::DisabledLlm;
use crate::clients::options::StaticOptionsClient;
use crate::config::{CoreConfig, EXIT_SAFETY_CONFIG};
use crate::heartbeat::HeartbeatScheduler;
use crate::money::Money;
use crate::store::memory::MemoryStore;
use crate::strategies::StrategyRegistry;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║        Maestro Trading Core — Starting Up               ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    let config = CoreConfig::from_env();

    // SAFETY: refuse to start against anything but a paper broker host.
    if let Err(e) = config.ensure_paper_host() {
        error!(error = %e, "refusing to start: broker URL is not a paper host");
        std::process::exit(EXIT_SAFETY_CONFIG);
    }

    info!(
        broker = %config.broker_base_url,
        datastore = %config.datastore_project_id,
        tick_seconds = config.tick_seconds,
        "safety checks passed, wiring control plane"
    );

    // ── 2. External collaborators ────────────────────────────────────────
    let broker = Arc::new(PaperBrokerClient::new(
        config.broker_base_url.clone(),
        &config.broker_key_id,
        &config.broker_secret_key,
    ));
    let options = Arc::new(StaticOptionsClient::symmetric(
        Money::parse_str("448.00").expect("literal"),
        Utc::now().date_naive(),
    ));
    let llm = Arc::new(DisabledLlm);
    let raw_store = Arc::new(MemoryStore::new());

    // ── 3. Strategy fleet & shared state ─────────────────────────────────
    let registry = StrategyRegistry::default();
    let state = Arc::new(AppState::new(
        config,
        raw_store,
        broker,
        options,
        llm,
        registry,
    ));

    // Per-process agent identities: generate keys, publish public halves.
    for strategy in state.registry.all() {
        state
            .vault
            .register_or_load(state.store.as_ref(), strategy.agent_id())
            .await?;
    }
    info!(
        agents = state.registry.len(),
        session_id = %state.vault.session_id(),
        "agent identities registered"
    );

    // ── 4. Heartbeat loop (every tick: scheduler + watchdog) ─────────────
    let beat_state = state.clone();
    let heartbeat_handle = tokio::spawn(async move {
        let scheduler = HeartbeatScheduler::new(beat_state.clone());
        let mut interval = tokio::time::interval(tokio::time::Duration::from_secs(
            beat_state.config.tick_seconds,
        ));
        loop {
            interval.tick().await;
            let summary = scheduler.run_tick().await;

            let streak = beat_state
                .consecutive_store_failures
                .load(std::sync::atomic::Ordering::Relaxed);
            if streak > beat_state.config.persistence_outage_fatal_ticks {
                error!(
                    streak,
                    limit = beat_state.config.persistence_outage_fatal_ticks,
                    "persistence unreachable for too many ticks, exiting for supervisor restart"
                );
                std::process::exit(1);
            }

            if summary.errors > 0 {
                warn!(errors = summary.errors, "tick finished with unit errors");
            }
        }
    });

    // ── 5. Regime loop (every 5 minutes) ─────────────────────────────────
    let regime_state = state.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(tokio::time::Duration::from_secs(
            regime_state.config.regime_sync_secs,
        ));
        loop {
            interval.tick().await;
            if let Err(e) = regime_state.regime_engine.sync().await {
                warn!(error = %e, "regime sync failed, last good regime retained");
            }
        }
    });

    info!("All subsystems running. Press Ctrl+C to stop.");

    // ── 6. Graceful shutdown ─────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("Shutdown signal received — stopping gracefully");
    heartbeat_handle.abort();

    info!(
        ticks = state.ticks_run.load(std::sync::atomic::Ordering::Relaxed),
        uptime_secs = state.start_time.elapsed().as_secs(),
        "Maestro Trading Core shut down complete."
    );
    Ok(())
}
