// =============================================================================
// Meridian Arb Nexus — Main Entry Point
// =============================================================================
//
// Cross-venue arbitrage pipeline over an append-only message bus:
// scanner -> risk engine -> router-executor -> order simulator, with an
// independent trade assembler joining fills into the accounting record.
//
// The engine starts with autoTrade disabled unless the toggle store (or
// AUTO_TRADE) says otherwise; flipping toggles at runtime needs no restart.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod api;
mod app_state;
mod assembler;
mod bus;
mod config;
mod executor;
mod instruments;
mod journal;
mod metrics;
mod model;
mod risk;
mod scanner;
mod sim;
mod toggles;
mod types;

use std::sync::Arc;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::api::rest::ApiContext;
use crate::app_state::AppState;
use crate::assembler::Assembler;
use crate::bus::{groups, streams, MemoryBus, MessageBus, RedisBus};
use crate::config::EngineConfig;
use crate::executor::Executor;
use crate::journal::TradeJournal;
use crate::metrics::Metrics;
use crate::scanner::Scanner;
use crate::toggles::ToggleCache;

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
    info!("║        Meridian Arb Nexus — Starting Up                 ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    let config = Arc::new(EngineConfig::load("meridian_config.json").unwrap_or_else(|e| {
        warn!(error = %e, "failed to load config file, using defaults + env");
        let mut cfg = EngineConfig::default();
        cfg.apply_env_overrides();
        cfg
    }));

    info!(
        venues = ?config.venues,
        scan_interval_ms = config.scan_interval_ms,
        redis_url = %config.redis_url,
        "engine configuration"
    );

    // ── 2. Message bus ───────────────────────────────────────────────────
    let bus: Arc<dyn MessageBus> = if config.redis_url == "memory"
        || config.redis_url.starts_with("memory://")
    {
        info!("using in-process memory bus (standalone mode)");
        Arc::new(MemoryBus::new())
    } else {
        Arc::new(RedisBus::connect(&config.redis_url)?)
    };

    bootstrap_groups(bus.as_ref()).await;

    // ── 3. Shared state ──────────────────────────────────────────────────
    let metrics = Arc::new(Metrics::default());

    let initial_toggles = toggles::seed_defaults(bus.as_ref(), &config).await;
    let toggle_cache = Arc::new(ToggleCache::new(initial_toggles));
    let (toggle_tx, toggle_rx) = tokio::sync::watch::channel(initial_toggles);

    let app = Arc::new(AppState::new(
        config.clone(),
        metrics.clone(),
        toggle_cache.clone(),
    ));

    // ── 4. Toggle refresher ──────────────────────────────────────────────
    tokio::spawn(toggles::run_refresher(
        bus.clone(),
        toggle_cache.clone(),
        toggle_tx,
    ));

    // ── 5. Scanner ───────────────────────────────────────────────────────
    {
        let scanner = Scanner::new(
            bus.clone(),
            config.clone(),
            metrics.clone(),
            toggle_cache.clone(),
        );
        tokio::spawn(scanner.run());
    }

    // ── 6. Risk engine ───────────────────────────────────────────────────
    tokio::spawn(risk::run_risk_loop(
        bus.clone(),
        config.clone(),
        metrics.clone(),
    ));

    // ── 7. Router-executor ───────────────────────────────────────────────
    let exec = Arc::new(Executor::new(
        bus.clone(),
        config.clone(),
        metrics.clone(),
        toggle_cache.clone(),
        app.clone(),
    ));
    tokio::spawn(executor::run_opportunity_loop(exec.clone()));
    tokio::spawn(executor::run_fill_loop(exec.clone()));
    tokio::spawn(executor::run_toggle_watcher(exec.clone(), toggle_rx));

    // ── 8. Order simulator ───────────────────────────────────────────────
    tokio::spawn(sim::run_sim_loop(bus.clone(), metrics.clone()));

    // ── 9. Trade assembler ───────────────────────────────────────────────
    {
        let journal = Arc::new(TradeJournal::new(&config.trade_journal_path));
        let asm = Arc::new(Assembler::new(
            bus.clone(),
            config.clone(),
            metrics.clone(),
            app.clone(),
            journal,
        ));
        tokio::spawn(assembler::run_assembler_loop(asm));
    }

    // ── 10. Ops API ──────────────────────────────────────────────────────
    {
        let ctx = Arc::new(ApiContext {
            app: app.clone(),
            bus: bus.clone(),
        });
        let bind_addr = config.bind_addr.clone();
        tokio::spawn(async move {
            let router = api::rest::router(ctx);
            let listener = tokio::net::TcpListener::bind(&bind_addr)
                .await
                .expect("Failed to bind API server");
            info!(addr = %bind_addr, "ops API listening");
            axum::serve(listener, router).await.expect("API server failed");
        });
    }

    info!("All subsystems running. Press Ctrl+C to stop.");

    // ── 11. Graceful shutdown ────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("Shutdown signal received — stopping");
    info!(
        trades_executor = metrics.trades_executor.load(std::sync::atomic::Ordering::Relaxed),
        trades_assembler = metrics.trades_assembler.load(std::sync::atomic::Ordering::Relaxed),
        "Meridian Arb Nexus shut down complete"
    );
    Ok(())
}

/// Idempotently create every consumer group the pipeline uses. Transient
/// bus failures are retried for a while; a persistent failure is logged
/// and the affected consumer will simply see empty reads until an operator
/// intervenes.
async fn bootstrap_groups(bus: &dyn MessageBus) {
    const GROUPS: &[(&str, &str)] = &[
        (streams::OPPORTUNITIES, groups::EXECUTOR),
        (streams::APPROVED, groups::EXECUTOR),
        (streams::SCANNER_TO_RISK, groups::RISK),
        (streams::ORDERS_NEW, groups::SIM),
        (streams::ORDERS_FILLS, groups::EXECUTOR),
        (streams::ORDERS_FILLS, groups::ASM),
    ];

    for (stream, group) in GROUPS {
        let mut attempts = 0u32;
        loop {
            match bus.ensure_group(stream, group).await {
                Ok(()) => break,
                Err(e) if attempts < 10 => {
                    attempts += 1;
                    warn!(stream = %stream, group = %group, error = %e, attempts, "group create failed — retrying");
                    tokio::time::sleep(tokio::time::Duration::from_millis(500)).await;
                }
                Err(e) => {
                    error!(stream = %stream, group = %group, error = %e, "group create failed — giving up");
                    break;
                }
            }
        }
    }
}
