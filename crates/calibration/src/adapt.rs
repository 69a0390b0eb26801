use std::f64::consts::LN_2;

use activity_analyzer::{ActivityAnalyzer, AnalyzerConfig};
use core_types::{CalibrationBundle, Provenance};
use logit_space::clip;
use market_state::MarketStateTracker;
use vol_indicators::IndicatorState;

use crate::config::WarmupConfig;
use crate::meta::meta_calibrate;

/// Blend weight after `elapsed_s` for an exponential tracker with the given half-life.
pub fn adaptation_alpha(elapsed_s: f64, half_life_s: f64) -> f64 {
    if !elapsed_s.is_finite() || elapsed_s <= 0.0 {
        return 0.0;
    }
    if !half_life_s.is_finite() || half_life_s <= 0.0 {
        return 1.0;
    }
    1.0 - (-elapsed_s * LN_2 / half_life_s).exp()
}

/// Moves every numeric field of `current` toward `candidate` by `alpha`, then
/// re-imposes the bundle ordering constraints.
pub fn blend_bundle(
    current: &CalibrationBundle,
    candidate: &CalibrationBundle,
    alpha: f64,
    cfg: &WarmupConfig,
) -> CalibrationBundle {
    let a = clip(alpha, 0.0, 1.0);
    let mix = |cur: f64, new: f64| cur + a * (new - cur);

    let dt_sample_s = clip(
        mix(current.dt_sample_s, candidate.dt_sample_s),
        cfg.dt_min_s,
        cfg.dt_max_s,
    );
    let tau_fast_floor = (3.0 * dt_sample_s).max(cfg.tau_fast_min_s);
    let tau_fast_s = clip(
        mix(current.tau_fast_s, candidate.tau_fast_s),
        tau_fast_floor,
        cfg.tau_fast_max_s.max(tau_fast_floor),
    );
    let mut tau_slow_s = mix(current.tau_slow_s, candidate.tau_slow_s).min(cfg.tau_slow_max_s);
    if tau_slow_s <= tau_fast_s {
        tau_slow_s = tau_fast_s * 2.0;
    }
    let markout_h1_s = clip(
        mix(current.markout_h1_s, candidate.markout_h1_s),
        dt_sample_s,
        cfg.markout_max_s.max(dt_sample_s),
    );
    let mut markout_h2_s = mix(current.markout_h2_s, candidate.markout_h2_s);
    if markout_h2_s <= markout_h1_s {
        markout_h2_s = markout_h1_s * 2.0;
    }

    let provenance = if candidate.provenance == Provenance::MetaCalibrated {
        Provenance::MetaCalibrated
    } else {
        current.provenance
    };

    CalibrationBundle {
        dt_sample_s,
        tau_fast_s,
        tau_slow_s,
        markout_h1_s,
        markout_h2_s,
        baseline_volatility: mix(current.baseline_volatility, candidate.baseline_volatility)
            .max(0.0),
        provenance,
        calibrated_at_ms: candidate.calibrated_at_ms,
        activity: candidate.activity.clone(),
    }
}

/// Periodic post-warmup refinement of the live bundle.
#[derive(Debug, Clone)]
pub struct ContinuousAdapter {
    cfg: WarmupConfig,
    analyzer: ActivityAnalyzer,
    last_adapted_ms: i64,
}

impl ContinuousAdapter {
    /// `live_since_ms` is when this process began running the bundle live,
    /// not when the bundle was first calibrated.
    pub fn new(cfg: WarmupConfig, analyzer_cfg: AnalyzerConfig, live_since_ms: i64) -> Self {
        Self {
            cfg,
            analyzer: ActivityAnalyzer::new(analyzer_cfg),
            last_adapted_ms: live_since_ms,
        }
    }

    fn elapsed_s(&self, now_ms: i64) -> f64 {
        (now_ms - self.last_adapted_ms).max(0) as f64 / 1_000.0
    }

    pub fn due(&self, now_ms: i64) -> bool {
        self.elapsed_s(now_ms) >= self.cfg.adaptation_interval_s
    }

    /// Returns the blended bundle when an adaptation ran, `None` when it was
    /// not due or the recent window was too thin to trust.
    pub fn adapt(
        &mut self,
        current: &CalibrationBundle,
        indicators: &IndicatorState,
        tracker: &MarketStateTracker,
        now_ms: i64,
    ) -> Option<CalibrationBundle> {
        if !self.due(now_ms) {
            return None;
        }
        let elapsed_s = self.elapsed_s(now_ms);
        self.last_adapted_ms = now_ms;

        let window_start = now_ms - (self.cfg.adaptation_window_s * 1_000.0) as i64;
        self.analyzer.invalidate();
        let profile = self
            .analyzer
            .profile(tracker.price_samples(), tracker.trades(), window_start, now_ms)
            .clone();
        if profile.price_changes < self.cfg.min_price_changes
            || profile.trades < self.cfg.min_trades
        {
            tracing::debug!(
                price_changes = profile.price_changes,
                trades = profile.trades,
                "adaptation skipped, recent window too thin"
            );
            return None;
        }

        let mut candidate = meta_calibrate(&profile, &self.cfg, now_ms);
        candidate.baseline_volatility = indicators
            .baseline_volatility()
            .filter(|v| v.is_finite() && *v > 0.0)
            .unwrap_or(current.baseline_volatility);

        let alpha = adaptation_alpha(elapsed_s, self.cfg.adaptation_half_life_s);
        let blended = blend_bundle(current, &candidate, alpha, &self.cfg);
        match blended.validate() {
            Ok(()) => {
                tracing::info!(
                    market = %indicators.market_id,
                    alpha,
                    dt_sample_s = blended.dt_sample_s,
                    tau_fast_s = blended.tau_fast_s,
                    tau_slow_s = blended.tau_slow_s,
                    "calibration adapted"
                );
                Some(blended)
            }
            Err(err) => {
                tracing::warn!(error = %err, "adapted bundle rejected");
                None
            }
        }
    }
}
