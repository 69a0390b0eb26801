//! Dual-timescale volatility and toxicity indicators over logit returns.
//!
//! [`IndicatorState`] is a plain serialisable record. Every update consumes
//! the state and returns the next one, so the feed task owns it outright and
//! publishes copies for readers.

pub mod ema;
pub mod toxicity;

use std::collections::VecDeque;

use activity_analyzer::stats::{mad, median};
use core_types::{CalibrationBundle, EngineError, FillEvent};
use logit_space::logit;
use serde::{Deserialize, Serialize};

pub use activity_analyzer::stats::MAD_SCALE;
pub use crate::ema::{ema_step, EmaState};
pub use crate::toxicity::{
    intensity, shock_ratio, sigma_from_shock, smooth_sigma, MarkoutState, ToxicityConfig,
};

/// A gap longer than this many sample periods re-anchors instead of producing a return.
const REANCHOR_GAP_SAMPLES: f64 = 10.0;

/// Samples closer than `dt_sample - SAMPLE_SLACK_MS` to the previous one are ignored.
const SAMPLE_SLACK_MS: i64 = 10;

#[derive(Debug, Clone, PartialEq)]
pub struct IndicatorParams {
    pub dt_sample_s: f64,
    pub tau_fast_s: f64,
    pub tau_slow_s: f64,
    pub markout_h1_s: f64,
    pub markout_h2_s: f64,
    pub tox: ToxicityConfig,
}

impl IndicatorParams {
    pub fn new(bundle: &CalibrationBundle, tox: &ToxicityConfig) -> Self {
        Self {
            dt_sample_s: bundle.dt_sample_s,
            tau_fast_s: bundle.tau_fast_s,
            tau_slow_s: bundle.tau_slow_s,
            markout_h1_s: bundle.markout_h1_s,
            markout_h2_s: bundle.markout_h2_s,
            tox: tox.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SampleOutcome {
    /// First usable sample (or first after a long gap); no return yet.
    Anchored,
    Return(f64),
    TooEarly,
    Invalid,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IndicatorState {
    pub market_id: String,
    pub ema_fast: EmaState,
    pub ema_slow: EmaState,
    pub sigma: f64,
    pub sigma_raw: f64,
    pub last_sample_ms: Option<i64>,
    pub last_x: Option<f64>,
    pub returns: VecDeque<f64>,
    pub samples_taken: u64,
    #[serde(default)]
    pub markouts: MarkoutState,
}

impl IndicatorState {
    pub fn new(market_id: &str, params: &IndicatorParams) -> Self {
        Self {
            market_id: market_id.to_string(),
            ema_fast: EmaState::new(params.tau_fast_s),
            ema_slow: EmaState::new(params.tau_slow_s),
            sigma: 1.0,
            sigma_raw: 1.0,
            last_sample_ms: None,
            last_x: None,
            returns: VecDeque::new(),
            samples_taken: 0,
            markouts: MarkoutState::default(),
        }
    }

    /// Advances on one scheduled mid sample.
    #[must_use]
    pub fn advance(
        mut self,
        params: &IndicatorParams,
        ts_ms: i64,
        mid: f64,
        trade_rate_per_s: f64,
    ) -> (Self, SampleOutcome) {
        if !(mid.is_finite() && mid > 0.0 && mid < 1.0) {
            return (self, SampleOutcome::Invalid);
        }
        let x = logit(mid);
        let dt_ms = (params.dt_sample_s * 1_000.0) as i64;

        self.markouts = self.markouts.mark(
            ts_ms,
            x,
            (params.markout_h1_s, params.markout_h2_s),
            params.tau_fast_s,
            params.dt_sample_s,
        );

        let (Some(last_ms), Some(last_x)) = (self.last_sample_ms, self.last_x) else {
            self.last_sample_ms = Some(ts_ms);
            self.last_x = Some(x);
            return (self, SampleOutcome::Anchored);
        };
        let elapsed_ms = ts_ms - last_ms;
        if elapsed_ms < dt_ms - SAMPLE_SLACK_MS {
            return (self, SampleOutcome::TooEarly);
        }
        if elapsed_ms as f64 > REANCHOR_GAP_SAMPLES * dt_ms as f64 {
            self.last_sample_ms = Some(ts_ms);
            self.last_x = Some(x);
            return (self, SampleOutcome::Anchored);
        }

        let r = x - last_x;
        let abs_r = r.abs();
        let dt_s = elapsed_ms as f64 / 1_000.0;

        while self.returns.len() >= params.tox.return_history_cap.max(1) {
            self.returns.pop_front();
        }
        self.returns.push_back(r);
        self.last_sample_ms = Some(ts_ms);
        self.last_x = Some(x);
        self.samples_taken += 1;

        self.ema_fast = self.ema_fast.with_tau(params.tau_fast_s).update(abs_r, ts_ms);
        self.ema_slow = self.ema_slow.with_tau(params.tau_slow_s).update(abs_r, ts_ms);

        let j = self.shock_ratio();
        let z_tox = self.markouts.weighted(&params.tox) / self.ema_slow.value.max(1e-9);
        let lambda = intensity(trade_rate_per_s, &params.tox);
        self.sigma_raw = sigma_from_shock(j, lambda, z_tox, &params.tox);
        self.sigma = smooth_sigma(self.sigma, self.sigma_raw, dt_s, &params.tox)
            .clamp(1.0, params.tox.sigma_max.max(1.0));

        (self, SampleOutcome::Return(r))
    }

    #[must_use]
    pub fn record_fill(mut self, fill: &FillEvent, params: &IndicatorParams) -> Self {
        self.markouts = self.markouts.record_fill(fill, params.tox.pending_fill_cap);
        self
    }

    pub fn shock_ratio(&self) -> f64 {
        shock_ratio(self.ema_fast.value, self.ema_slow.value)
    }

    pub fn return_count(&self) -> usize {
        self.returns.len()
    }

    pub fn returns(&self) -> &VecDeque<f64> {
        &self.returns
    }

    /// `1.4826 * MAD` of the stored logit returns.
    pub fn baseline_volatility(&self) -> Option<f64> {
        let returns: Vec<f64> = self.returns.iter().copied().collect();
        if returns.len() < 2 {
            return None;
        }
        mad(&returns).map(|m| MAD_SCALE * m)
    }

    pub fn median_return(&self) -> Option<f64> {
        let returns: Vec<f64> = self.returns.iter().copied().collect();
        median(&returns)
    }

    pub fn to_json(&self) -> Result<String, EngineError> {
        serde_json::to_string(self).map_err(|e| EngineError::Persistence(e.to_string()))
    }

    pub fn from_json(raw: &str, market_id: &str) -> Result<Self, EngineError> {
        let state: Self =
            serde_json::from_str(raw).map_err(|e| EngineError::Persistence(e.to_string()))?;
        if state.market_id != market_id {
            return Err(EngineError::Persistence(format!(
                "indicator snapshot belongs to {}, not {market_id}",
                state.market_id
            )));
        }
        Ok(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core_types::OrderSide;

    fn params() -> IndicatorParams {
        IndicatorParams::new(&CalibrationBundle::default(), &ToxicityConfig::default())
    }

    fn drive(
        state: IndicatorState,
        p: &IndicatorParams,
        mids: &[f64],
        start_ms: i64,
    ) -> IndicatorState {
        let step = (p.dt_sample_s * 1_000.0) as i64;
        mids.iter().enumerate().fold(state, |s, (i, mid)| {
            s.advance(p, start_ms + i as i64 * step, *mid, 0.0).0
        })
    }

    #[test]
    fn first_sample_anchors_and_early_samples_are_ignored() {
        let p = params();
        let (s, out) = IndicatorState::new("m", &p).advance(&p, 0, 0.5, 0.0);
        assert_eq!(out, SampleOutcome::Anchored);
        let (s, out) = s.advance(&p, 2_000, 0.51, 0.0);
        assert_eq!(out, SampleOutcome::TooEarly);
        let (s, out) = s.advance(&p, 4_995, 0.51, 0.0);
        let expected = logit(0.51) - logit(0.5);
        assert!(matches!(out, SampleOutcome::Return(r) if (r - expected).abs() < 1e-12));
        let (s, out) = s.advance(&p, 10_000, 1.2, 0.0);
        assert_eq!(out, SampleOutcome::Invalid);
        assert_eq!(s.return_count(), 1);
    }

    #[test]
    fn long_gap_reanchors() {
        let p = params();
        let s = drive(IndicatorState::new("m", &p), &p, &[0.5, 0.5, 0.5], 0);
        let (s, out) = s.advance(&p, 10 * 60_000, 0.8, 0.0);
        assert_eq!(out, SampleOutcome::Anchored);
        assert_eq!(s.return_count(), 2);
    }

    #[test]
    fn volatility_burst_raises_shock_ratio_and_sigma() {
        let p = params();
        let calm: Vec<f64> = (0..400).map(|i| if i % 2 == 0 { 0.500 } else { 0.502 }).collect();
        let s = drive(IndicatorState::new("m", &p), &p, &calm, 0);
        assert!((s.shock_ratio() - 1.0).abs() < 0.1);
        assert!(s.sigma < 1.05);

        let start = 400 * 5_000;
        let wild: Vec<f64> = (0..12).map(|i| if i % 2 == 0 { 0.45 } else { 0.55 }).collect();
        let s = drive(s, &p, &wild, start);
        assert!(s.shock_ratio() > 2.0);
        assert!(s.sigma > 1.5);
        assert!(s.sigma <= p.tox.sigma_max);
        assert!(s.ema_fast.value > s.ema_slow.value);
    }

    #[test]
    fn baseline_volatility_is_scaled_mad() {
        let p = params();
        let mut s = IndicatorState::new("m", &p);
        s.returns = [0.01, -0.01, 0.02, -0.02, 0.0].into_iter().collect();
        let expected = MAD_SCALE * 0.01;
        assert!((s.baseline_volatility().unwrap_or_default() - expected).abs() < 1e-12);
    }

    #[test]
    fn snapshot_restores_for_same_market_only() {
        let p = params();
        let s = drive(IndicatorState::new("m", &p), &p, &[0.40, 0.42, 0.41, 0.43], 0);
        let fill = FillEvent {
            order_id: "o".to_string(),
            market_id: "m".to_string(),
            side: OrderSide::Sell,
            price: 0.43,
            size: 2.0,
            ts_ms: 15_000,
        };
        let s = s.record_fill(&fill, &p);
        let raw = s.to_json().unwrap_or_default();
        let restored = IndicatorState::from_json(&raw, "m").unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(restored, s);
        assert!(IndicatorState::from_json(&raw, "other").is_err());
    }
}
