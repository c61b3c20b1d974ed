//! Subsystem wiring for `worldd serve` and the one-shot commands.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{error, info, warn};
use worldgrid_api::ApiState;
use worldgrid_core::GridConfig;
use worldgrid_core::config::ProviderKind;
use worldgrid_provider::{ComputeProvider, HttpComputeProvider, SimulatedProvider};
use worldgrid_state::StateStore;
use worldgrid_tasks::epoch_millis;

fn open_store(data_dir: &Path) -> anyhow::Result<StateStore> {
    std::fs::create_dir_all(data_dir)?;
    let db_path = data_dir.join("worldgrid.redb");
    let store = StateStore::open(&db_path)?;
    info!(path = ?db_path, "state store opened");
    Ok(store)
}

fn build_provider(config: &GridConfig) -> anyhow::Result<Arc<dyn ComputeProvider>> {
    match config.provider.kind {
        ProviderKind::Simulated => {
            warn!("using the simulated compute provider; no real instances will be created");
            Ok(Arc::new(SimulatedProvider::new(
                config.provider.simulated_polls_to_complete,
            )))
        }
        ProviderKind::Http => {
            let provider = HttpComputeProvider::from_config(&config.provider)?;
            info!(endpoint = %config.provider.endpoint, project = %config.provider.project, "http compute provider configured");
            Ok(Arc::new(provider))
        }
    }
}

fn build_state(config: GridConfig, data_dir: &Path) -> anyhow::Result<ApiState> {
    let store = open_store(data_dir)?;
    let provider = build_provider(&config)?;
    Ok(ApiState::new(store, provider, Arc::new(config)))
}

pub async fn serve(config: GridConfig, data_dir: &Path) -> anyhow::Result<()> {
    info!("worldgrid daemon starting");

    let port = config.api.port;
    let dispatch_interval = Duration::from_millis(config.tasks.poll_interval_ms);
    let sweep_interval = Duration::from_secs(config.sweep.interval_secs);
    let render_interval = Duration::from_secs(config.sweep.render_interval_secs);
    let state = build_state(config, data_dir)?;

    // ── Shutdown signal ────────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // ── Start background tasks ─────────────────────────────────

    let dispatcher = state.dispatcher.clone();
    let dispatch_shutdown = shutdown_rx.clone();
    let dispatch_handle = tokio::spawn(async move {
        dispatcher.run(dispatch_interval, dispatch_shutdown).await;
    });

    let sweep = state.lifecycle.sweep.clone();
    let sweep_shutdown = shutdown_rx.clone();
    let sweep_handle = tokio::spawn(async move {
        sweep.run(sweep_interval, sweep_shutdown).await;
    });

    let render = state.lifecycle.render.clone();
    let render_shutdown = shutdown_rx;
    let render_handle = tokio::spawn(async move {
        render.run(render_interval, render_shutdown).await;
    });

    // ── Start API server ───────────────────────────────────────

    let router = worldgrid_api::build_router(state);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));

    info!(%addr, "API server starting");

    let listener = tokio::net::TcpListener::bind(addr).await?;

    // Graceful shutdown on Ctrl-C.
    let server = axum::serve(listener, router).with_graceful_shutdown(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for ctrl-c");
        }
        info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    server.await?;

    // Wait for background tasks.
    let _ = dispatch_handle.await;
    let _ = sweep_handle.await;
    let _ = render_handle.await;

    info!("worldgrid daemon stopped");
    Ok(())
}

pub async fn sweep_once(config: GridConfig, data_dir: &Path) -> anyhow::Result<()> {
    let state = build_state(config, data_dir)?;
    let report = state.lifecycle.sweep.run_once().await?;
    for unit in report.failures() {
        error!(instance = %unit.instance, zone = %unit.zone, outcome = ?unit.outcome, "unit failed");
    }
    if !report.is_success() {
        anyhow::bail!("{} sweep unit(s) failed", report.failures().count());
    }
    Ok(())
}

pub async fn render_once(config: GridConfig, data_dir: &Path) -> anyhow::Result<()> {
    let state = build_state(config, data_dir)?;
    let report = state.lifecycle.render.run_once().await?;
    if !report.is_success() {
        anyhow::bail!("{} render clone(s) failed", report.failures.len());
    }
    Ok(())
}

pub async fn drain_once(config: GridConfig, data_dir: &Path) -> anyhow::Result<()> {
    let state = build_state(config, data_dir)?;
    let report = state.dispatcher.dispatch_due(epoch_millis()).await?;
    info!(
        delivered = report.delivered,
        completed = report.completed,
        retrying = report.retrying,
        dead_lettered = report.dead_lettered,
        "drain finished"
    );
    Ok(())
}

pub fn print_worlds(data_dir: &Path) -> anyhow::Result<()> {
    let store = open_store(data_dir)?;
    let worlds = store.list_worlds()?;
    println!("{}", serde_json::to_string_pretty(&worlds)?);
    Ok(())
}
