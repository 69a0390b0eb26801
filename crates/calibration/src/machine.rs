use std::fmt;
use std::time::Duration;

use activity_analyzer::{ActivityAnalyzer, AnalyzerConfig};
use core_types::{CalibrationBundle, EngineError};
use market_state::MarketStateTracker;
use serde::{Deserialize, Serialize};
use vol_indicators::{IndicatorParams, IndicatorState, SampleOutcome, ToxicityConfig};

use crate::config::WarmupConfig;
use crate::meta::{default_bundle, meta_calibrate};
use crate::report::{CalibrationReport, SamplingSummary};
use crate::store::PersistedCalibration;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CalibrationPhase {
    Observation,
    MetaCalibration,
    Sampling,
    Complete,
}

impl CalibrationPhase {
    pub fn gauge_value(self) -> f64 {
        match self {
            Self::Observation => 0.0,
            Self::MetaCalibration => 1.0,
            Self::Sampling => 2.0,
            Self::Complete => 3.0,
        }
    }
}

impl fmt::Display for CalibrationPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let value = match self {
            Self::Observation => "observation",
            Self::MetaCalibration => "meta_calibration",
            Self::Sampling => "sampling",
            Self::Complete => "complete",
        };
        f.write_str(value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhaseChange {
    pub from: CalibrationPhase,
    pub to: CalibrationPhase,
}

#[derive(Debug, Default, Clone)]
struct SamplingAccum {
    price_lo: Option<f64>,
    price_hi: Option<f64>,
    spread_sum: f64,
    spread_n: usize,
    last_trade_rate: f64,
}

impl SamplingAccum {
    fn observe(&mut self, mid: f64, spread: Option<f64>, trade_rate: f64) {
        self.price_lo = Some(self.price_lo.map_or(mid, |lo| lo.min(mid)));
        self.price_hi = Some(self.price_hi.map_or(mid, |hi| hi.max(mid)));
        if let Some(s) = spread.filter(|s| s.is_finite() && *s >= 0.0) {
            self.spread_sum += s;
            self.spread_n += 1;
        }
        self.last_trade_rate = trade_rate;
    }
}

/// Observation → MetaCalibration → Sampling → Complete for one market.
///
/// The machine is driven by [`CalibrationMachine::step`] from the task that
/// owns the tracker; it never sleeps itself. [`CalibrationMachine::next_delay`]
/// tells the driver how long to wait before the next step.
#[derive(Debug, Clone)]
pub struct CalibrationMachine {
    cfg: WarmupConfig,
    tox: ToxicityConfig,
    market_id: String,
    phase: CalibrationPhase,
    started_ms: i64,
    phase_started_ms: i64,
    observation_since_ms: i64,
    bundle: CalibrationBundle,
    params: IndicatorParams,
    indicators: IndicatorState,
    analyzer: ActivityAnalyzer,
    degraded: Option<EngineError>,
    report: Option<CalibrationReport>,
    accum: SamplingAccum,
}

impl CalibrationMachine {
    pub fn new(
        market_id: &str,
        cfg: WarmupConfig,
        tox: ToxicityConfig,
        analyzer_cfg: AnalyzerConfig,
        now_ms: i64,
    ) -> Self {
        let bundle = cfg.defaults.clone();
        let params = IndicatorParams::new(&bundle, &tox);
        let indicators = IndicatorState::new(market_id, &params);
        Self {
            cfg,
            tox,
            market_id: market_id.to_string(),
            phase: CalibrationPhase::Observation,
            started_ms: now_ms,
            phase_started_ms: now_ms,
            observation_since_ms: now_ms,
            bundle,
            params,
            indicators,
            analyzer: ActivityAnalyzer::new(analyzer_cfg),
            degraded: None,
            report: None,
            accum: SamplingAccum::default(),
        }
    }

    /// Restores from a snapshot. With an indicator record the machine is
    /// already complete; with a bundle only it resumes sampling.
    pub fn resume(
        cfg: WarmupConfig,
        tox: ToxicityConfig,
        analyzer_cfg: AnalyzerConfig,
        persisted: PersistedCalibration,
        now_ms: i64,
    ) -> Self {
        let mut machine = Self::new(&persisted.market_id, cfg, tox, analyzer_cfg, now_ms);
        machine.params = IndicatorParams::new(&persisted.bundle, &machine.tox);
        machine.bundle = persisted.bundle;
        match persisted.indicators {
            Some(indicators) => {
                machine.indicators = indicators;
                machine.phase = CalibrationPhase::Complete;
            }
            None => {
                machine.indicators = IndicatorState::new(&machine.market_id, &machine.params);
                machine.phase = CalibrationPhase::Sampling;
            }
        }
        tracing::info!(
            market = %machine.market_id,
            phase = %machine.phase,
            provenance = %machine.bundle.provenance,
            "calibration resumed from snapshot"
        );
        machine
    }

    pub fn market_id(&self) -> &str {
        &self.market_id
    }

    pub fn phase(&self) -> CalibrationPhase {
        self.phase
    }

    pub fn is_complete(&self) -> bool {
        self.phase == CalibrationPhase::Complete
    }

    pub fn bundle(&self) -> &CalibrationBundle {
        &self.bundle
    }

    pub fn indicators(&self) -> &IndicatorState {
        &self.indicators
    }

    pub fn params(&self) -> &IndicatorParams {
        &self.params
    }

    pub fn report(&self) -> Option<&CalibrationReport> {
        self.report.as_ref()
    }

    /// Set when observation timed out; the bundle is then the default one.
    pub fn degraded(&self) -> Option<&EngineError> {
        self.degraded.as_ref()
    }

    /// Wait before the next [`step`](Self::step); `None` once complete.
    pub fn next_delay(&self) -> Option<Duration> {
        match self.phase {
            CalibrationPhase::Observation => {
                Some(Duration::from_millis(self.cfg.observation_cadence_ms.max(1)))
            }
            CalibrationPhase::MetaCalibration => Some(Duration::ZERO),
            CalibrationPhase::Sampling => {
                Some(Duration::from_secs_f64(self.bundle.dt_sample_s.max(0.001)))
            }
            CalibrationPhase::Complete => None,
        }
    }

    pub fn step(&mut self, now_ms: i64, tracker: &MarketStateTracker) -> Option<PhaseChange> {
        match self.phase {
            CalibrationPhase::Observation => self.observe(now_ms, tracker),
            CalibrationPhase::MetaCalibration => self.meta_calibrate(now_ms, tracker),
            CalibrationPhase::Sampling => self.sample(now_ms, tracker),
            CalibrationPhase::Complete => None,
        }
    }

    fn observe(&mut self, now_ms: i64, tracker: &MarketStateTracker) -> Option<PhaseChange> {
        let price_changes = tracker.price_change_count_since(self.observation_since_ms);
        let trades = tracker.trade_count_since(self.observation_since_ms);
        if price_changes >= self.cfg.min_price_changes && trades >= self.cfg.min_trades {
            tracing::info!(
                market = %self.market_id,
                price_changes,
                trades,
                "observation thresholds reached"
            );
            return Some(self.transition(CalibrationPhase::MetaCalibration, now_ms));
        }

        let elapsed_s = (now_ms - self.phase_started_ms) as f64 / 1_000.0;
        if elapsed_s < self.cfg.observation_timeout_s {
            return None;
        }

        let err = EngineError::InsufficientCalibrationData {
            price_changes,
            trades,
        };
        tracing::warn!(
            market = %self.market_id,
            error = %err,
            elapsed_s,
            "observation timed out, falling back to default calibration"
        );
        let profile = self
            .analyzer
            .profile(
                tracker.price_samples(),
                tracker.trades(),
                self.observation_since_ms,
                now_ms,
            )
            .clone();
        self.install_bundle(default_bundle(&self.cfg, &profile, now_ms));
        self.degraded = Some(err);
        Some(self.transition(CalibrationPhase::Sampling, now_ms))
    }

    fn meta_calibrate(&mut self, now_ms: i64, tracker: &MarketStateTracker) -> Option<PhaseChange> {
        self.analyzer.invalidate();
        let profile = self
            .analyzer
            .profile(
                tracker.price_samples(),
                tracker.trades(),
                self.observation_since_ms,
                now_ms,
            )
            .clone();
        let bundle = meta_calibrate(&profile, &self.cfg, now_ms);
        let bundle = match bundle.validate() {
            Ok(()) => bundle,
            Err(err) => {
                tracing::warn!(
                    market = %self.market_id,
                    error = %err,
                    "meta calibration produced an invalid bundle"
                );
                default_bundle(&self.cfg, &profile, now_ms)
            }
        };
        tracing::info!(
            market = %self.market_id,
            dt_sample_s = bundle.dt_sample_s,
            tau_fast_s = bundle.tau_fast_s,
            tau_slow_s = bundle.tau_slow_s,
            markout_h1_s = bundle.markout_h1_s,
            markout_h2_s = bundle.markout_h2_s,
            half_life_s = ?profile.return_half_life_s,
            "meta calibration complete"
        );
        self.install_bundle(bundle);
        Some(self.transition(CalibrationPhase::Sampling, now_ms))
    }

    fn sample(&mut self, now_ms: i64, tracker: &MarketStateTracker) -> Option<PhaseChange> {
        if let Some(mid) = tracker.mid() {
            let trade_rate = tracker.trade_rate_per_s(now_ms);
            let state = std::mem::replace(
                &mut self.indicators,
                IndicatorState::new(&self.market_id, &self.params),
            );
            let (state, outcome) = state.advance(&self.params, now_ms, mid, trade_rate);
            self.indicators = state;
            if matches!(outcome, SampleOutcome::Return(_) | SampleOutcome::Anchored) {
                let spread = tracker.best_bid().zip(tracker.best_ask()).map(|(b, a)| a - b);
                self.accum.observe(mid, spread, trade_rate);
            }
        }

        let elapsed_s = (now_ms - self.phase_started_ms) as f64 / 1_000.0;
        let enough = self.indicators.return_count() >= self.cfg.min_return_samples;
        if !enough && elapsed_s < self.cfg.max_sampling_s {
            return None;
        }
        if !enough {
            tracing::warn!(
                market = %self.market_id,
                samples = self.indicators.return_count(),
                need = self.cfg.min_return_samples,
                "sampling hit its time limit"
            );
        }

        if let Some(base) = self
            .indicators
            .baseline_volatility()
            .filter(|v| v.is_finite() && *v > 0.0)
        {
            self.bundle.baseline_volatility = base;
        }
        let summary = SamplingSummary {
            samples_collected: self.indicators.return_count(),
            collection_s: elapsed_s,
            ema_fast: self.indicators.ema_fast.value,
            ema_slow: self.indicators.ema_slow.value,
            sigma: self.indicators.sigma,
            price_range: self.accum.price_lo.zip(self.accum.price_hi),
            avg_spread: (self.accum.spread_n > 0)
                .then(|| self.accum.spread_sum / self.accum.spread_n as f64),
            trade_rate_per_s: self.accum.last_trade_rate,
        };
        let report = CalibrationReport::build(
            &self.market_id,
            &self.bundle,
            &summary,
            self.cfg.min_return_samples,
        );
        tracing::info!(market = %self.market_id, "{report}");
        self.report = Some(report);
        Some(self.transition(CalibrationPhase::Complete, now_ms))
    }

    fn install_bundle(&mut self, bundle: CalibrationBundle) {
        self.params = IndicatorParams::new(&bundle, &self.tox);
        self.indicators = IndicatorState::new(&self.market_id, &self.params);
        self.bundle = bundle;
    }

    fn transition(&mut self, to: CalibrationPhase, now_ms: i64) -> PhaseChange {
        let change = PhaseChange {
            from: self.phase,
            to,
        };
        tracing::info!(
            market = %self.market_id,
            from = %change.from,
            to = %change.to,
            phase_s = (now_ms - self.phase_started_ms) as f64 / 1_000.0,
            total_s = (now_ms - self.started_ms) as f64 / 1_000.0,
            "calibration phase change"
        );
        self.phase = to;
        self.phase_started_ms = now_ms;
        change
    }

    /// Snapshot to persist: bundle only until complete, then bundle plus indicators.
    pub fn checkpoint(&self, now_ms: i64) -> PersistedCalibration {
        let indicators = self.is_complete().then(|| self.indicators.clone());
        PersistedCalibration::new(&self.market_id, now_ms, self.bundle.clone(), indicators)
    }

    pub fn into_parts(self) -> (CalibrationBundle, IndicatorState, Option<CalibrationReport>) {
        (self.bundle, self.indicators, self.report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core_types::{FeedEvent, Provenance, TopOfBook, TradeEvent, TradeSide};
    use market_state::TrackerConfig;

    fn quick_cfg() -> WarmupConfig {
        WarmupConfig {
            min_return_samples: 50,
            ..WarmupConfig::default()
        }
    }

    fn top(ts_ms: i64, mid: f64) -> FeedEvent {
        FeedEvent::PriceChange(TopOfBook {
            ts_ms,
            best_bid: Some(mid - 0.005),
            best_ask: Some(mid + 0.005),
            seq: None,
        })
    }

    fn trade(ts_ms: i64, price: f64, side: TradeSide) -> FeedEvent {
        FeedEvent::Trade(TradeEvent {
            ts_ms,
            side,
            size: 10.0,
            price,
            seq: None,
        })
    }

    #[test]
    fn alternating_ticks_drive_the_full_warmup() {
        let mut tracker = MarketStateTracker::new(TrackerConfig::default());
        let mut machine = CalibrationMachine::new(
            "m",
            quick_cfg(),
            ToxicityConfig::default(),
            AnalyzerConfig::default(),
            0,
        );
        let mut phases = vec![machine.phase()];
        let mut ts = 0;
        for i in 0..360 {
            ts += if i % 2 == 0 { 2_000 } else { 3_000 };
            let mid = if i % 2 == 0 { 0.50 } else { 0.51 };
            tracker.apply(&top(ts, mid));
            if i % 3 == 0 {
                let side = if i % 2 == 0 { TradeSide::Buy } else { TradeSide::Sell };
                tracker.apply(&trade(ts, mid, side));
            }
            if let Some(change) = machine.step(ts, &tracker) {
                phases.push(change.to);
                if change.to == CalibrationPhase::Sampling {
                    let b = machine.bundle();
                    assert!((2.0..=3.0).contains(&b.dt_sample_s), "dt={}", b.dt_sample_s);
                }
            }
            if machine.is_complete() {
                break;
            }
        }
        assert_eq!(
            phases,
            vec![
                CalibrationPhase::Observation,
                CalibrationPhase::MetaCalibration,
                CalibrationPhase::Sampling,
                CalibrationPhase::Complete,
            ]
        );
        let bundle = machine.bundle();
        assert_eq!(bundle.provenance, Provenance::MetaCalibrated);
        assert!(bundle.validate().is_ok());
        assert!(bundle.baseline_volatility > 0.0);
        assert!(machine.report().is_some());
        assert!(machine.next_delay().is_none());

        let snap = machine.checkpoint(ts);
        assert!(snap.indicators.is_some());
    }

    #[test]
    fn quiet_market_times_out_to_default_bundle() {
        let tracker = MarketStateTracker::new(TrackerConfig::default());
        let cfg = quick_cfg();
        let timeout_ms = (cfg.observation_timeout_s * 1_000.0) as i64;
        let mut machine = CalibrationMachine::new(
            "m",
            cfg,
            ToxicityConfig::default(),
            AnalyzerConfig::default(),
            0,
        );
        assert_eq!(machine.step(timeout_ms - 1, &tracker), None);
        let change = machine.step(timeout_ms, &tracker);
        assert_eq!(
            change,
            Some(PhaseChange {
                from: CalibrationPhase::Observation,
                to: CalibrationPhase::Sampling,
            })
        );
        assert_eq!(machine.bundle().provenance, Provenance::Default);
        assert!(matches!(
            machine.degraded(),
            Some(EngineError::InsufficientCalibrationData { price_changes: 0, trades: 0 })
        ));
        assert!(machine.checkpoint(timeout_ms).indicators.is_none());
    }

    #[test]
    fn sampling_is_time_bounded() {
        let tracker = MarketStateTracker::new(TrackerConfig::default());
        let persisted = PersistedCalibration::new("m", 0, CalibrationBundle::default(), None);
        let mut machine = CalibrationMachine::resume(
            quick_cfg(),
            ToxicityConfig::default(),
            AnalyzerConfig::default(),
            persisted,
            0,
        );
        assert_eq!(machine.phase(), CalibrationPhase::Sampling);
        assert_eq!(machine.step(1_000, &tracker), None);
        let limit_ms = (quick_cfg().max_sampling_s * 1_000.0) as i64;
        let change = machine.step(limit_ms, &tracker).map(|c| c.to);
        assert_eq!(change, Some(CalibrationPhase::Complete));
        assert_eq!(
            machine.bundle().baseline_volatility,
            CalibrationBundle::default().baseline_volatility
        );
    }

    #[test]
    fn snapshot_with_indicators_resumes_complete() {
        let bundle = CalibrationBundle {
            provenance: Provenance::MetaCalibrated,
            ..CalibrationBundle::default()
        };
        let params = IndicatorParams::new(&bundle, &ToxicityConfig::default());
        let persisted = PersistedCalibration::new(
            "m",
            0,
            bundle.clone(),
            Some(IndicatorState::new("m", &params)),
        );
        let machine = CalibrationMachine::resume(
            WarmupConfig::default(),
            ToxicityConfig::default(),
            AnalyzerConfig::default(),
            persisted,
            10,
        );
        assert!(machine.is_complete());
        assert_eq!(machine.bundle(), &bundle);
    }
}
