use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use calibration::{CalibrationPhase, CalibrationStore};
use clap::Parser;
use core_types::ExecutionPort;
use infra_clock::{Clock, MonotonicClock};
use market_state::MarketStateTracker;
use observability::{init_metrics, init_tracing};
use paper_executor::DryRunExecutor;
use parking_lot::RwLock;
use risk_engine::RiskEngine;
use strategy_maker::{QuoteEngine, QuoteSupervisor};
use tokio::sync::{mpsc, watch, RwLock as AsyncRwLock};

mod config_loader;
mod control_api;
mod feed_runtime;
mod quote_runtime;
mod state;

use crate::config_loader::{load_app_config, resolve_config_path};
use crate::feed_runtime::{spawn_stdin_reader, FeedChannels, FeedRuntime};
use crate::quote_runtime::QuoteRuntime;
use crate::state::{AppState, CalibrationView, EngineSnapshot, QuoteView};

const CHANNEL_CAPACITY: usize = 1_024;

#[derive(Debug, Parser)]
#[command(
    name = "polyquote",
    version,
    about = "Self-calibrating quoting engine for one binary market"
)]
struct Cli {
    /// TOML config; defaults to configs/polyquote.toml.
    #[arg(long, env = "POLYQUOTE_CONFIG_PATH")]
    config: Option<PathBuf>,
    /// Quote through the in-process dry-run port with simulated fills.
    #[arg(long)]
    dry_run: bool,
    /// Run warmup to completion, persist the bundle and exit.
    #[arg(long)]
    calibrate_only: bool,
    /// Overrides [persistence].state_dir.
    #[arg(long, env = "POLYQUOTE_STATE_DIR")]
    state_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let clock: Arc<dyn Clock> = Arc::new(MonotonicClock::default());

    let config_path = resolve_config_path(cli.config.clone());
    let mut cfg = load_app_config(&config_path, clock.now_ms())?;
    if let Some(dir) = cli.state_dir.clone() {
        cfg.persistence.state_dir = dir;
    }

    let _log_guard = init_tracing("polyquote", cfg.log_dir.as_deref());
    let prometheus = match init_metrics() {
        Ok(handle) => Some(handle),
        Err(err) => {
            tracing::warn!(error = %err, "prometheus recorder not installed");
            None
        }
    };
    tracing::info!(
        config = %config_path.display(),
        market = %cfg.market.market_id,
        dry_run = cli.dry_run,
        calibrate_only = cli.calibrate_only,
        "polyquote starting"
    );
    if !cli.dry_run && !cli.calibrate_only {
        bail!("no live execution port is built in; run with --dry-run or --calibrate-only");
    }

    let store = CalibrationStore::new(cfg.persistence.state_dir.clone());
    store
        .check_writable(&cfg.market.market_id)
        .context("calibration state dir is not writable")?;

    let now_ms = clock.now_ms();
    let empty = MarketStateTracker::new(cfg.tracker.clone()).snapshot(now_ms);
    let (snapshot_tx, snapshot_rx) = watch::channel(Arc::new(EngineSnapshot::empty(empty)));
    let (calibration_tx, calibration_rx) = watch::channel(Arc::new(CalibrationView {
        phase: CalibrationPhase::Observation,
        bundle: cfg.warmup.defaults.clone(),
        degraded: None,
        report: None,
        adaptations: 0,
        last_persist_ms: None,
    }));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (fill_fwd_tx, fill_fwd_rx) = mpsc::channel(CHANNEL_CAPACITY);
    let (executor, exec_fills_rx) = DryRunExecutor::channel(CHANNEL_CAPACITY);
    let executor = Arc::new(executor);

    let feed = FeedRuntime::bootstrap(
        &cfg,
        store,
        cli.dry_run.then(|| executor.clone()),
        FeedChannels {
            snapshot_tx,
            calibration_tx,
            fill_fwd: Some(fill_fwd_tx),
        },
        now_ms,
    );
    if cli.calibrate_only && feed.is_live() {
        tracing::info!(
            market = %cfg.market.market_id,
            "calibration already complete, nothing to do"
        );
        return Ok(());
    }

    let input = spawn_stdin_reader(CHANNEL_CAPACITY);
    let mut feed_task = tokio::spawn(feed.run(
        input,
        clock.clone(),
        Some(exec_fills_rx),
        shutdown_rx.clone(),
        cli.calibrate_only,
    ));

    if cli.calibrate_only {
        tokio::select! {
            joined = &mut feed_task => {
                log_join("feed", joined);
                return Ok(());
            }
            _ = tokio::signal::ctrl_c() => tracing::info!("ctrl-c received, stopping calibration"),
        }
        let _ = shutdown_tx.send(true);
        log_join("feed", feed_task.await);
        return Ok(());
    }

    let quote_view = Arc::new(RwLock::new(QuoteView::default()));
    let (control_tx, control_rx) = mpsc::channel(16);
    let port: Arc<dyn ExecutionPort> = executor.clone();
    let quote = QuoteRuntime::new(
        RiskEngine::new(cfg.risk.clone(), &cfg.archetypes, cfg.market.clone()),
        QuoteEngine::new(cfg.quote.clone()),
        QuoteSupervisor::new(cfg.supervisor.clone()),
        port,
        Duration::from_millis(cfg.refresh_interval_ms),
        quote_view.clone(),
        &cfg.market.market_id,
    );
    let quote_task = tokio::spawn(quote.run(
        snapshot_rx.clone(),
        fill_fwd_rx,
        control_rx,
        clock.clone(),
        shutdown_rx.clone(),
    ));

    let api_task = match cfg.control_listen {
        Some(addr) => {
            let app = control_api::build_router(AppState {
                market_id: cfg.market.market_id.clone(),
                paused: Arc::new(AsyncRwLock::new(false)),
                snapshot: snapshot_rx,
                calibration: calibration_rx,
                quote: quote_view,
                control_tx,
                prometheus,
                clock: clock.clone(),
            });
            let listener = tokio::net::TcpListener::bind(addr)
                .await
                .with_context(|| format!("bind control api {addr}"))?;
            tracing::info!(%addr, "control api started");
            let mut api_shutdown = shutdown_rx.clone();
            Some(tokio::spawn(async move {
                axum::serve(listener, app)
                    .with_graceful_shutdown(async move {
                        let _ = api_shutdown.wait_for(|stop| *stop).await;
                    })
                    .await
                    .context("control api")
            }))
        }
        None => None,
    };

    let mut remaining = vec![("quote", quote_task)];
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("ctrl-c received, shutting down");
            remaining.push(("feed", feed_task));
        }
        joined = &mut feed_task => {
            log_join("feed", joined);
            tracing::warn!("feed ended, shutting down");
        }
    }
    if let Some(task) = api_task {
        remaining.push(("control api", task));
    }
    stop_tasks(&shutdown_tx, remaining).await;
    tracing::info!("polyquote stopped");
    Ok(())
}

/// Signals shutdown, then joins every task in order.
async fn stop_tasks(
    shutdown_tx: &watch::Sender<bool>,
    tasks: Vec<(&'static str, tokio::task::JoinHandle<Result<()>>)>,
) {
    let _ = shutdown_tx.send(true);
    for (name, task) in tasks {
        log_join(name, task.await);
    }
}

fn log_join(name: &str, joined: Result<Result<()>, tokio::task::JoinError>) {
    match joined {
        Ok(Ok(())) => tracing::debug!(task = name, "task finished"),
        Ok(Err(err)) => tracing::error!(task = name, error = ?err, "task failed"),
        Err(err) => tracing::error!(task = name, error = %err, "task panicked or was cancelled"),
    }
}
