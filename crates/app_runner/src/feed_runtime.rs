use std::io::BufRead;
use std::sync::Arc;
use std::time::Duration;

use activity_analyzer::AnalyzerConfig;
use anyhow::Result;
use calibration::{
    CalibrationMachine, CalibrationPhase, CalibrationReport, CalibrationStore, ContinuousAdapter,
    PersistedCalibration, WarmupConfig,
};
use core_types::{BinaryMarket, CalibrationBundle, FeedEvent, FillEvent, TopOfBook};
use feed_polymarket::MarketDecoder;
use infra_clock::Clock;
use market_state::{ApplyOutcome, MarketStateTracker};
use paper_executor::DryRunExecutor;
use tokio::sync::{mpsc, watch};
use vol_indicators::{IndicatorParams, IndicatorState, SampleOutcome, ToxicityConfig};

use crate::config_loader::AppConfig;
use crate::state::{CalibrationView, EngineSnapshot};

struct LiveIndicators {
    bundle: CalibrationBundle,
    params: IndicatorParams,
    indicators: IndicatorState,
    adapter: ContinuousAdapter,
    report: Option<CalibrationReport>,
    degraded: Option<String>,
}

pub(crate) struct FeedChannels {
    pub(crate) snapshot_tx: watch::Sender<Arc<EngineSnapshot>>,
    pub(crate) calibration_tx: watch::Sender<Arc<CalibrationView>>,
    /// Fills forwarded to the quote task once markouts are recorded.
    pub(crate) fill_fwd: Option<mpsc::Sender<FillEvent>>,
}

/// Sole writer of market state, the calibration machine and live indicators.
pub(crate) struct FeedRuntime {
    market: BinaryMarket,
    decoder: MarketDecoder,
    tracker: MarketStateTracker,
    warmup_cfg: WarmupConfig,
    tox: ToxicityConfig,
    analyzer_cfg: AnalyzerConfig,
    warmup: Option<CalibrationMachine>,
    live: Option<LiveIndicators>,
    store: CalibrationStore,
    executor: Option<Arc<DryRunExecutor>>,
    channels: FeedChannels,
    seq: u64,
    next_step_ms: i64,
    checkpoint_interval_ms: i64,
    last_checkpoint_ms: i64,
    last_persist_ms: Option<i64>,
    adaptations: u64,
}

impl FeedRuntime {
    /// Resumes from the persisted snapshot when one loads cleanly; a corrupt
    /// or mismatched snapshot is logged and calibration starts over.
    pub(crate) fn bootstrap(
        cfg: &AppConfig,
        store: CalibrationStore,
        executor: Option<Arc<DryRunExecutor>>,
        channels: FeedChannels,
        now_ms: i64,
    ) -> Self {
        let market_id = cfg.market.market_id.as_str();
        let machine = match store.load(market_id) {
            Ok(Some(persisted)) => CalibrationMachine::resume(
                cfg.warmup.clone(),
                cfg.toxicity.clone(),
                cfg.analyzer.clone(),
                persisted,
                now_ms,
            ),
            Ok(None) => {
                tracing::info!(market = %market_id, "no calibration snapshot, starting warmup");
                CalibrationMachine::new(
                    market_id,
                    cfg.warmup.clone(),
                    cfg.toxicity.clone(),
                    cfg.analyzer.clone(),
                    now_ms,
                )
            }
            Err(err) => {
                tracing::warn!(
                    market = %market_id,
                    error = ?err,
                    "calibration snapshot unusable, starting fresh"
                );
                CalibrationMachine::new(
                    market_id,
                    cfg.warmup.clone(),
                    cfg.toxicity.clone(),
                    cfg.analyzer.clone(),
                    now_ms,
                )
            }
        };

        let mut runtime = Self {
            market: cfg.market.clone(),
            decoder: MarketDecoder::new(&cfg.market),
            tracker: MarketStateTracker::new(cfg.tracker.clone()),
            warmup_cfg: cfg.warmup.clone(),
            tox: cfg.toxicity.clone(),
            analyzer_cfg: cfg.analyzer.clone(),
            warmup: None,
            live: None,
            store,
            executor,
            channels,
            seq: 0,
            next_step_ms: now_ms,
            checkpoint_interval_ms: (cfg.persistence.checkpoint_interval_s * 1_000.0) as i64,
            last_checkpoint_ms: now_ms,
            last_persist_ms: None,
            adaptations: 0,
        };
        metrics::gauge!("calibration.phase").set(machine.phase().gauge_value());
        if machine.is_complete() {
            runtime.go_live(machine, now_ms);
        } else {
            runtime.warmup = Some(machine);
        }
        runtime.publish_calibration();
        runtime.publish_snapshot(now_ms);
        runtime
    }

    pub(crate) fn is_live(&self) -> bool {
        self.live.is_some()
    }

    pub(crate) fn phase(&self) -> CalibrationPhase {
        match &self.warmup {
            Some(machine) => machine.phase(),
            None => CalibrationPhase::Complete,
        }
    }

    #[cfg(test)]
    pub(crate) fn tracker(&self) -> &MarketStateTracker {
        &self.tracker
    }

    pub(crate) fn sigma(&self) -> f64 {
        self.live.as_ref().map_or(1.0, |l| l.indicators.sigma)
    }

    #[cfg(test)]
    pub(crate) fn next_step_ms(&self) -> i64 {
        self.next_step_ms
    }

    pub(crate) fn on_line(&mut self, raw: &str, now_ms: i64) {
        let events = self.decoder.decode(raw, now_ms);
        if events.is_empty() {
            return;
        }
        let mut touched_top = false;
        for event in &events {
            match self.tracker.apply_at(event, now_ms) {
                ApplyOutcome::Applied { .. } => {
                    metrics::counter!("feed.accepted").increment(1);
                    touched_top |= matches!(event, FeedEvent::Book(_) | FeedEvent::PriceChange(_));
                }
                ApplyOutcome::Duplicate => metrics::counter!("feed.duplicate").increment(1),
                ApplyOutcome::OutOfOrder => metrics::counter!("feed.out_of_order").increment(1),
                ApplyOutcome::Rejected => metrics::counter!("feed.rejected").increment(1),
            }
        }
        if touched_top {
            if let (Some(exec), Some(ts_ms)) = (&self.executor, self.tracker.last_book_ts_ms()) {
                let top = TopOfBook {
                    ts_ms,
                    best_bid: self.tracker.best_bid(),
                    best_ask: self.tracker.best_ask(),
                    seq: None,
                };
                exec.on_top(&self.market.market_id, &top);
            }
        }
        self.publish_snapshot(now_ms);
    }

    pub(crate) fn on_fill(&mut self, fill: &FillEvent) {
        if let Some(live) = self.live.as_mut() {
            let indicators = std::mem::replace(
                &mut live.indicators,
                IndicatorState::new(&self.market.market_id, &live.params),
            );
            live.indicators = indicators.record_fill(fill, &live.params);
        }
        if let Some(tx) = &self.channels.fill_fwd {
            if tx.try_send(fill.clone()).is_err() {
                tracing::warn!(
                    order_id = %fill.order_id,
                    "quote task fill queue full, fill dropped"
                );
            }
        }
    }

    /// Runs whatever is scheduled at `now_ms`. Returns true on the step that
    /// completed calibration.
    pub(crate) fn on_timer(&mut self, now_ms: i64) -> bool {
        if now_ms < self.next_step_ms {
            return false;
        }
        let completed = match self.warmup.take() {
            Some(machine) => self.step_warmup(machine, now_ms),
            None => {
                self.step_live(now_ms);
                false
            }
        };
        self.publish_snapshot(now_ms);
        completed
    }

    fn step_warmup(&mut self, mut machine: CalibrationMachine, now_ms: i64) -> bool {
        let change = machine.step(now_ms, &self.tracker);
        let Some(change) = change else {
            self.next_step_ms = now_ms + delay_ms(machine.next_delay());
            self.warmup = Some(machine);
            return false;
        };

        metrics::gauge!("calibration.phase").set(change.to.gauge_value());
        match change.to {
            CalibrationPhase::Complete => {
                self.persist(&machine.checkpoint(now_ms));
                self.go_live(machine, now_ms);
                self.publish_calibration();
                true
            }
            CalibrationPhase::Sampling => {
                self.persist(&machine.checkpoint(now_ms));
                self.next_step_ms = now_ms + delay_ms(machine.next_delay());
                self.warmup = Some(machine);
                self.publish_calibration();
                false
            }
            CalibrationPhase::Observation | CalibrationPhase::MetaCalibration => {
                self.next_step_ms = now_ms + delay_ms(machine.next_delay());
                self.warmup = Some(machine);
                self.publish_calibration();
                false
            }
        }
    }

    fn go_live(&mut self, machine: CalibrationMachine, now_ms: i64) {
        let degraded = machine.degraded().map(ToString::to_string);
        let (bundle, indicators, report) = machine.into_parts();
        let params = IndicatorParams::new(&bundle, &self.tox);
        tracing::info!(
            market = %self.market.market_id,
            provenance = %bundle.provenance,
            dt_sample_s = bundle.dt_sample_s,
            tau_fast_s = bundle.tau_fast_s,
            tau_slow_s = bundle.tau_slow_s,
            sigma = indicators.sigma,
            "indicators live"
        );
        self.next_step_ms = now_ms + (bundle.dt_sample_s * 1_000.0) as i64;
        self.live = Some(LiveIndicators {
            bundle,
            params,
            indicators,
            adapter: ContinuousAdapter::new(
                self.warmup_cfg.clone(),
                self.analyzer_cfg.clone(),
                now_ms,
            ),
            report,
            degraded,
        });
    }

    fn step_live(&mut self, now_ms: i64) {
        let Some(live) = self.live.as_mut() else {
            return;
        };
        if let Some(mid) = self.tracker.mid() {
            let rate = self.tracker.trade_rate_per_s(now_ms);
            let indicators = std::mem::replace(
                &mut live.indicators,
                IndicatorState::new(&self.market.market_id, &live.params),
            );
            let (indicators, outcome) = indicators.advance(&live.params, now_ms, mid, rate);
            live.indicators = indicators;
            if let SampleOutcome::Return(r) = outcome {
                tracing::trace!(r, sigma = live.indicators.sigma, "indicator sample");
            }
            metrics::gauge!("sigma.current").set(live.indicators.sigma);
        }

        let mut adapted = false;
        if let Some(next) = live
            .adapter
            .adapt(&live.bundle, &live.indicators, &self.tracker, now_ms)
        {
            live.params = IndicatorParams::new(&next, &self.tox);
            live.bundle = next;
            self.adaptations += 1;
            adapted = true;
        }
        self.next_step_ms = now_ms + (live.bundle.dt_sample_s * 1_000.0) as i64;

        let checkpoint_due = self.checkpoint_interval_ms > 0
            && now_ms - self.last_checkpoint_ms >= self.checkpoint_interval_ms;
        if adapted || checkpoint_due {
            if let Some(snapshot) = self.live_checkpoint(now_ms) {
                self.persist(&snapshot);
            }
            self.last_checkpoint_ms = now_ms;
            self.publish_calibration();
        }
    }

    fn live_checkpoint(&self, now_ms: i64) -> Option<PersistedCalibration> {
        self.live.as_ref().map(|live| {
            PersistedCalibration::new(
                &self.market.market_id,
                now_ms,
                live.bundle.clone(),
                Some(live.indicators.clone()),
            )
        })
    }

    fn persist(&mut self, snapshot: &PersistedCalibration) {
        match self.store.save(snapshot) {
            Ok(path) => {
                metrics::counter!("persist.writes").increment(1);
                self.last_persist_ms = Some(snapshot.saved_at_ms);
                tracing::info!(
                    market = %snapshot.market_id,
                    path = %path.display(),
                    with_indicators = snapshot.indicators.is_some(),
                    "calibration snapshot written"
                );
            }
            Err(err) => {
                tracing::error!(
                    market = %snapshot.market_id,
                    error = ?err,
                    "calibration snapshot write failed"
                );
            }
        }
    }

    /// Final snapshot on shutdown. Nothing is written before sampling starts,
    /// so a restart never skips observation on a default bundle.
    pub(crate) fn flush(&mut self, now_ms: i64) {
        let snapshot = match &self.warmup {
            Some(machine) if machine.phase() == CalibrationPhase::Sampling => {
                Some(machine.checkpoint(now_ms))
            }
            Some(_) => None,
            None => self.live_checkpoint(now_ms),
        };
        if let Some(snapshot) = snapshot {
            self.persist(&snapshot);
        }
    }

    fn publish_snapshot(&mut self, now_ms: i64) {
        self.seq += 1;
        let snapshot = EngineSnapshot {
            seq: self.seq,
            market: self.tracker.snapshot(now_ms),
            phase: self.phase(),
            sigma: self.sigma(),
        };
        self.channels.snapshot_tx.send_replace(Arc::new(snapshot));
    }

    fn publish_calibration(&self) {
        let view = match (&self.warmup, &self.live) {
            (Some(machine), _) => CalibrationView {
                phase: machine.phase(),
                bundle: machine.bundle().clone(),
                degraded: machine.degraded().map(ToString::to_string),
                report: machine.report().cloned(),
                adaptations: self.adaptations,
                last_persist_ms: self.last_persist_ms,
            },
            (None, Some(live)) => CalibrationView {
                phase: CalibrationPhase::Complete,
                bundle: live.bundle.clone(),
                degraded: live.degraded.clone(),
                report: live.report.clone(),
                adaptations: self.adaptations,
                last_persist_ms: self.last_persist_ms,
            },
            (None, None) => return,
        };
        self.channels.calibration_tx.send_replace(Arc::new(view));
    }

    pub(crate) async fn run(
        mut self,
        mut lines: mpsc::Receiver<String>,
        clock: Arc<dyn Clock>,
        mut fills_rx: Option<mpsc::Receiver<FillEvent>>,
        mut shutdown: watch::Receiver<bool>,
        exit_on_complete: bool,
    ) -> Result<()> {
        let mut feed_open = true;
        loop {
            let wait = Duration::from_millis((self.next_step_ms - clock.now_ms()).max(0) as u64);
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                line = lines.recv(), if feed_open => match line {
                    Some(raw) => self.on_line(&raw, clock.now_ms()),
                    None => {
                        feed_open = false;
                        tracing::warn!(market = %self.market.market_id, "feed input closed");
                    }
                },
                Some(fill) = next_fill(&mut fills_rx) => self.on_fill(&fill),
                _ = tokio::time::sleep(wait) => {
                    if self.on_timer(clock.now_ms()) && exit_on_complete {
                        tracing::info!(
                            market = %self.market.market_id,
                            "calibration complete, exiting"
                        );
                        break;
                    }
                }
            }
        }
        self.flush(clock.now_ms());
        Ok(())
    }
}

/// Reads NDJSON frames from stdin on a plain thread; a pending tokio stdin
/// read would hold the runtime open at shutdown.
pub(crate) fn spawn_stdin_reader(capacity: usize) -> mpsc::Receiver<String> {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            match line {
                Ok(line) => {
                    if tx.blocking_send(line).is_err() {
                        break;
                    }
                }
                Err(err) => {
                    tracing::error!(error = %err, "stdin read failed");
                    break;
                }
            }
        }
    });
    rx
}

async fn next_fill(rx: &mut Option<mpsc::Receiver<FillEvent>>) -> Option<FillEvent> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

fn delay_ms(delay: Option<Duration>) -> i64 {
    delay.map_or(0, |d| d.as_millis() as i64)
}
