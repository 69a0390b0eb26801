use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use core_types::{EngineError, ExecutionPort, FillEvent, QuoteMode, QuotePlan};
use infra_clock::Clock;
use parking_lot::RwLock;
use risk_engine::RiskEngine;
use strategy_maker::{QuoteEngine, QuoteInputs, QuoteSupervisor, SupervisorAction};
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;

use crate::state::{ControlCommand, EngineSnapshot, QuoteView, SnapshotRx};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CycleOutcome {
    /// Paused or still calibrating.
    Idle,
    Published(QuoteMode),
    Held,
    Withdrawn,
    Halted,
}

struct Executed {
    outcome: CycleOutcome,
    timed_out: bool,
}

/// Periodic reader of the feed snapshot. Owns inventory and the quote
/// supervisor; never writes market or indicator state.
pub(crate) struct QuoteRuntime {
    market_id: String,
    risk: RiskEngine,
    engine: QuoteEngine,
    supervisor: QuoteSupervisor,
    port: Arc<dyn ExecutionPort>,
    refresh: Duration,
    view: Arc<RwLock<QuoteView>>,
    paused: bool,
    halt_withdrawn: bool,
}

impl QuoteRuntime {
    pub(crate) fn new(
        risk: RiskEngine,
        engine: QuoteEngine,
        supervisor: QuoteSupervisor,
        port: Arc<dyn ExecutionPort>,
        refresh: Duration,
        view: Arc<RwLock<QuoteView>>,
        market_id: &str,
    ) -> Self {
        Self {
            market_id: market_id.to_string(),
            risk,
            engine,
            supervisor,
            port,
            refresh,
            view,
            paused: false,
            halt_withdrawn: false,
        }
    }

    pub(crate) fn inventory(&self) -> f64 {
        self.risk.state().inventory
    }

    pub(crate) fn on_fill(&mut self, fill: &FillEvent) {
        let inventory = self.risk.on_fill(fill);
        let state = self.risk.state();
        tracing::info!(
            market = %fill.market_id,
            side = %fill.side,
            price = fill.price,
            size = fill.size,
            inventory,
            "fill applied"
        );
        let mut view = self.view.write();
        view.inventory = inventory;
        view.fills = state.fills;
    }

    pub(crate) async fn on_control(&mut self, cmd: ControlCommand, now_ms: i64) {
        match cmd {
            ControlCommand::Pause => {
                self.paused = true;
                tracing::warn!(market = %self.market_id, "quoting paused");
                self.send_withdraw().await;
                self.store_plan(QuotePlan::withdrawn(&self.market_id, now_ms));
            }
            ControlCommand::Resume => {
                self.paused = false;
                self.halt_withdrawn = false;
                self.supervisor.resume();
                self.view.write().halted = None;
                tracing::info!(market = %self.market_id, "quoting resumed");
            }
        }
    }

    pub(crate) async fn cycle(&mut self, snapshot: &EngineSnapshot, now_ms: i64) -> CycleOutcome {
        if self.paused || !snapshot.ready() {
            return CycleOutcome::Idle;
        }
        let started = Instant::now();
        // A one-sided book has no mid and is treated like no book at all.
        // Silence is local time since arrival, never the exchange stamp.
        let silent_ms = snapshot
            .market
            .mid
            .and(snapshot.market.last_book_recv_ms)
            .map(|ts| (now_ms - ts).max(0));
        let computed = self.compute(snapshot, now_ms);
        metrics::histogram!("quote.compute_us").record(started.elapsed().as_micros() as f64);
        if let Err(EngineError::NumericDegenerate(reason)) = &computed {
            metrics::counter!("quote.degenerate").increment(1);
            tracing::warn!(market = %self.market_id, %reason, "quote cycle aborted");
        }

        let tick = snapshot.market.tick_size;
        let action = self
            .supervisor
            .on_cycle(&self.engine, tick, now_ms, silent_ms, computed);
        let executed = self.execute(action, now_ms).await;

        let refresh_ms = self.refresh.as_millis().max(1);
        let mut skipped = (started.elapsed().as_millis() / refresh_ms) as u64;
        if executed.timed_out {
            skipped = skipped.max(1);
        }
        for _ in 0..skipped {
            metrics::counter!("quote.skipped").increment(1);
            self.view.write().skipped_ticks += 1;
            if let Some(fallback) = self.supervisor.on_skip(&self.engine, tick, now_ms) {
                self.execute(fallback, now_ms).await;
            }
        }
        executed.outcome
    }

    fn compute(
        &mut self,
        snapshot: &EngineSnapshot,
        now_ms: i64,
    ) -> Result<QuotePlan, EngineError> {
        let mid = snapshot
            .market
            .mid
            .ok_or_else(|| EngineError::NumericDegenerate("no mid".to_string()))?;
        let assessment = self.risk.assess(mid, snapshot.market.crowd_size, now_ms)?;
        metrics::gauge!("risk.q_hat").set(assessment.q_hat);
        self.view.write().q_max = assessment.q_max;

        let inputs = QuoteInputs {
            market_id: self.market_id.clone(),
            mid,
            tick_size: snapshot.market.tick_size,
            buy_rate_per_s: snapshot.market.buy_rate_per_s,
            sell_rate_per_s: snapshot.market.sell_rate_per_s,
            sigma: snapshot.sigma,
            inventory: self.risk.state().inventory,
            now_ms,
        };
        self.engine.compute(&inputs, &assessment)
    }

    async fn execute(&mut self, action: SupervisorAction, now_ms: i64) -> Executed {
        match action {
            SupervisorAction::Publish(plan) => {
                if plan.mode != QuoteMode::Normal {
                    metrics::counter!("quote.defensive").increment(1);
                }
                let mode = plan.mode;
                let timed_out = !self.send_plan(&plan).await;
                if !timed_out {
                    metrics::counter!("quote.published").increment(1);
                }
                self.store_plan(plan);
                Executed {
                    outcome: CycleOutcome::Published(mode),
                    timed_out,
                }
            }
            SupervisorAction::Hold(plan) => {
                self.store_plan(plan);
                Executed {
                    outcome: CycleOutcome::Held,
                    timed_out: false,
                }
            }
            SupervisorAction::Withdraw { reason } => {
                metrics::counter!("quote.defensive").increment(1);
                tracing::warn!(market = %self.market_id, error = %reason, "withdrawing quotes");
                let timed_out = !self.send_withdraw().await;
                self.store_plan(QuotePlan::withdrawn(&self.market_id, now_ms));
                Executed {
                    outcome: CycleOutcome::Withdrawn,
                    timed_out,
                }
            }
            SupervisorAction::Halt { reason } => {
                let mut timed_out = false;
                if !self.halt_withdrawn {
                    tracing::error!(
                        market = %self.market_id,
                        error = %reason,
                        "quoting halted, operator resume required"
                    );
                    timed_out = !self.send_withdraw().await;
                    self.halt_withdrawn = true;
                    self.store_plan(QuotePlan::withdrawn(&self.market_id, now_ms));
                }
                self.view.write().halted = Some(reason.to_string());
                Executed {
                    outcome: CycleOutcome::Halted,
                    timed_out,
                }
            }
        }
    }

    /// False when the port errored or did not answer within one refresh.
    async fn send_plan(&self, plan: &QuotePlan) -> bool {
        match tokio::time::timeout(self.refresh, self.port.apply_plan(plan)).await {
            Ok(Ok(_acks)) => true,
            Ok(Err(err)) => {
                tracing::warn!(market = %self.market_id, error = ?err, "apply_plan failed");
                false
            }
            Err(_) => {
                tracing::warn!(market = %self.market_id, "apply_plan timed out");
                false
            }
        }
    }

    async fn send_withdraw(&self) -> bool {
        match tokio::time::timeout(self.refresh, self.port.withdraw_all(&self.market_id)).await {
            Ok(Ok(())) => true,
            Ok(Err(err)) => {
                tracing::warn!(market = %self.market_id, error = ?err, "withdraw_all failed");
                false
            }
            Err(_) => {
                tracing::warn!(market = %self.market_id, "withdraw_all timed out");
                false
            }
        }
    }

    fn store_plan(&self, plan: QuotePlan) {
        self.view.write().plan = Some(plan);
    }

    pub(crate) async fn run(
        mut self,
        snapshots: SnapshotRx,
        mut fills: mpsc::Receiver<FillEvent>,
        mut control: mpsc::Receiver<ControlCommand>,
        clock: Arc<dyn Clock>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        let mut ticker = tokio::time::interval(self.refresh);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                Some(fill) = fills.recv() => self.on_fill(&fill),
                Some(cmd) = control.recv() => self.on_control(cmd, clock.now_ms()).await,
                _ = ticker.tick() => {
                    let snapshot = Arc::clone(&*snapshots.borrow());
                    self.cycle(&snapshot, clock.now_ms()).await;
                }
            }
        }
        // Bypasses the refresh timeout; shutdown waits for the port.
        self.port.withdraw_all(&self.market_id).await?;
        tracing::info!(
            market = %self.market_id,
            inventory = self.inventory(),
            "quotes withdrawn on shutdown"
        );
        Ok(())
    }
}
