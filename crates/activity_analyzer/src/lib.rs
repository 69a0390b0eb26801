//! Microstructure statistics over the tracker's bounded history.
//!
//! Everything here is median-based. The analyzer caches its last profile and
//! only recomputes once the cache is older than `refresh_after_ms`.

pub mod stats;

use std::collections::BTreeMap;

use core_types::{PriceSample, TradeEvent};
use logit_space::logit;
use serde::{Deserialize, Serialize};

use crate::stats::{autocorrelation, mean, median, percentile, within_mads};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalyzerConfig {
    pub refresh_after_ms: i64,
    pub max_acf_lag: usize,
    /// Minimum inter-arrival intervals before a distribution is reported.
    pub min_intervals: usize,
    /// Minimum resampled grid points before a half-life is estimated.
    pub min_grid_points: usize,
    pub min_grid_step_ms: i64,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            refresh_after_ms: 30_000,
            max_acf_lag: 5,
            min_intervals: 5,
            min_grid_points: 30,
            min_grid_step_ms: 250,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IntervalStats {
    pub count: usize,
    pub median_s: f64,
    pub p10_s: f64,
    pub p25_s: f64,
    pub p50_s: f64,
    pub p75_s: f64,
    pub p90_s: f64,
    /// Mean of the intervals within three scaled MADs of the median.
    pub trimmed_mean_s: f64,
}

impl IntervalStats {
    pub fn from_intervals(intervals_s: &[f64], min_count: usize) -> Option<Self> {
        if intervals_s.len() < min_count.max(1) {
            return None;
        }
        let trimmed = within_mads(intervals_s, 3.0);
        Some(Self {
            count: intervals_s.len(),
            median_s: median(intervals_s)?,
            p10_s: percentile(intervals_s, 0.10)?,
            p25_s: percentile(intervals_s, 0.25)?,
            p50_s: percentile(intervals_s, 0.50)?,
            p75_s: percentile(intervals_s, 0.75)?,
            p90_s: percentile(intervals_s, 0.90)?,
            trimmed_mean_s: mean(&trimmed)?,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MicrostructureProfile {
    pub window_start_ms: i64,
    pub window_end_ms: i64,
    pub price_changes: usize,
    pub trades: usize,
    pub price_change_intervals: Option<IntervalStats>,
    pub trade_intervals: Option<IntervalStats>,
    pub grid_step_s: Option<f64>,
    pub return_half_life_s: Option<f64>,
}

impl MicrostructureProfile {
    pub fn span_s(&self) -> f64 {
        ((self.window_end_ms - self.window_start_ms).max(0)) as f64 / 1_000.0
    }

    /// Flat key/value summary kept alongside a calibration bundle.
    pub fn summary(&self) -> BTreeMap<String, f64> {
        let mut out = BTreeMap::new();
        out.insert("observed_s".to_string(), self.span_s());
        out.insert("price_changes".to_string(), self.price_changes as f64);
        out.insert("trades".to_string(), self.trades as f64);
        if let Some(pc) = &self.price_change_intervals {
            out.insert("price_change_median_s".to_string(), pc.median_s);
            out.insert("price_change_p90_s".to_string(), pc.p90_s);
        }
        if let Some(tr) = &self.trade_intervals {
            out.insert("trade_median_s".to_string(), tr.median_s);
            out.insert("trade_p90_s".to_string(), tr.p90_s);
        }
        if let Some(h) = self.return_half_life_s {
            out.insert("return_half_life_s".to_string(), h);
        }
        out
    }
}

/// Successive differences of timestamps in seconds, zero gaps dropped.
pub fn inter_arrival_s(ts_ms: impl Iterator<Item = i64>) -> Vec<f64> {
    let mut out = Vec::new();
    let mut prev: Option<i64> = None;
    for ts in ts_ms {
        if let Some(p) = prev {
            let gap = ts - p;
            if gap > 0 {
                out.push(gap as f64 / 1_000.0);
            }
        }
        prev = Some(ts);
    }
    out
}

/// Step-function resampling of mid onto a regular grid starting at the first sample.
pub fn resample_mid(samples: &[PriceSample], step_ms: i64, end_ms: i64) -> Vec<f64> {
    let Some(first) = samples.first() else {
        return Vec::new();
    };
    if step_ms <= 0 {
        return Vec::new();
    }
    let mut out = Vec::new();
    let mut idx = 0;
    let mut t = first.ts_ms;
    while t <= end_ms {
        while idx + 1 < samples.len() && samples[idx + 1].ts_ms <= t {
            idx += 1;
        }
        out.push(samples[idx].mid);
        t += step_ms;
    }
    out
}

/// Median of the per-lag half-lives implied by `rho_k = exp(-k ln2 / h)`.
/// `acf[0]` is lag 1. Lags with `rho` outside (0,1) carry no information.
pub fn half_life_from_acf(acf: &[Option<f64>]) -> Option<f64> {
    let implied: Vec<f64> = acf
        .iter()
        .enumerate()
        .filter_map(|(i, rho)| {
            let rho = (*rho)?;
            if rho > 0.0 && rho < 1.0 {
                Some((i + 1) as f64 * std::f64::consts::LN_2 / -rho.ln())
            } else {
                None
            }
        })
        .collect();
    median(&implied)
}

pub fn analyze(
    cfg: &AnalyzerConfig,
    samples: &[PriceSample],
    trades: &[TradeEvent],
    now_ms: i64,
) -> MicrostructureProfile {
    let window_start_ms = samples
        .first()
        .map(|s| s.ts_ms)
        .into_iter()
        .chain(trades.first().map(|t| t.ts_ms))
        .min()
        .unwrap_or(now_ms);

    let pc_intervals = inter_arrival_s(samples.iter().map(|s| s.ts_ms));
    let tr_intervals = inter_arrival_s(trades.iter().map(|t| t.ts_ms));
    let price_change_intervals = IntervalStats::from_intervals(&pc_intervals, cfg.min_intervals);
    let trade_intervals = IntervalStats::from_intervals(&tr_intervals, cfg.min_intervals);

    let grid_step_ms = price_change_intervals
        .as_ref()
        .map(|pc| ((pc.median_s * 1_000.0).round() as i64).max(cfg.min_grid_step_ms));

    let return_half_life_s = grid_step_ms.and_then(|step_ms| {
        let grid = resample_mid(samples, step_ms, now_ms);
        if grid.len() < cfg.min_grid_points {
            return None;
        }
        let abs_returns: Vec<f64> = grid
            .windows(2)
            .map(|w| (logit(w[1]) - logit(w[0])).abs())
            .collect();
        let acf: Vec<Option<f64>> = (1..=cfg.max_acf_lag.max(1))
            .map(|lag| autocorrelation(&abs_returns, lag))
            .collect();
        half_life_from_acf(&acf).map(|lags| lags * step_ms as f64 / 1_000.0)
    });

    MicrostructureProfile {
        window_start_ms,
        window_end_ms: now_ms,
        price_changes: samples.len(),
        trades: trades.len(),
        price_change_intervals,
        trade_intervals,
        grid_step_s: grid_step_ms.map(|ms| ms as f64 / 1_000.0),
        return_half_life_s,
    }
}

#[derive(Debug, Clone, Default)]
pub struct ActivityAnalyzer {
    cfg: AnalyzerConfig,
    cached: Option<MicrostructureProfile>,
}

impl ActivityAnalyzer {
    pub fn new(cfg: AnalyzerConfig) -> Self {
        Self { cfg, cached: None }
    }

    pub fn config(&self) -> &AnalyzerConfig {
        &self.cfg
    }

    /// Cached profile of everything at or after `since_ms`; recomputed when stale.
    pub fn profile<'a, S, T>(
        &mut self,
        samples: S,
        trades: T,
        since_ms: i64,
        now_ms: i64,
    ) -> &MicrostructureProfile
    where
        S: IntoIterator<Item = &'a PriceSample>,
        T: IntoIterator<Item = &'a TradeEvent>,
    {
        let fresh = self
            .cached
            .as_ref()
            .is_some_and(|p| now_ms - p.window_end_ms < self.cfg.refresh_after_ms);
        if !fresh {
            let samples: Vec<PriceSample> = samples
                .into_iter()
                .filter(|s| s.ts_ms >= since_ms)
                .copied()
                .collect();
            let trades: Vec<TradeEvent> = trades
                .into_iter()
                .filter(|t| t.ts_ms >= since_ms)
                .cloned()
                .collect();
            self.cached = Some(analyze(&self.cfg, &samples, &trades, now_ms));
        }
        self.cached
            .get_or_insert_with(|| analyze(&self.cfg, &[], &[], now_ms))
    }

    pub fn invalidate(&mut self) {
        self.cached = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core_types::TradeSide;

    fn alternating_samples(n: usize) -> Vec<PriceSample> {
        let mut ts = 0;
        (0..n)
            .map(|i| {
                ts += if i % 2 == 0 { 2_000 } else { 3_000 };
                let mid = if i % 2 == 0 { 0.50 } else { 0.51 };
                PriceSample {
                    ts_ms: ts,
                    mid,
                    bid: mid - 0.005,
                    ask: mid + 0.005,
                }
            })
            .collect()
    }

    #[test]
    fn interval_distribution_of_alternating_feed() {
        let samples = alternating_samples(101);
        let intervals = inter_arrival_s(samples.iter().map(|s| s.ts_ms));
        let stats = IntervalStats::from_intervals(&intervals, 5).unwrap_or_else(|| panic!("stats"));
        assert_eq!(stats.count, 100);
        assert!((stats.median_s - 2.5).abs() < 1e-12);
        assert!(stats.p10_s >= 2.0 && stats.p90_s <= 3.0);
    }

    #[test]
    fn half_life_from_geometric_acf() {
        let acf = [Some(0.5), Some(0.25), Some(0.125)];
        assert!((half_life_from_acf(&acf).unwrap_or_default() - 1.0).abs() < 1e-12);
        assert_eq!(half_life_from_acf(&[Some(-0.3), None, Some(1.0)]), None);
    }

    #[test]
    fn resample_holds_last_mid() {
        let samples = [
            PriceSample { ts_ms: 0, mid: 0.4, bid: 0.39, ask: 0.41 },
            PriceSample { ts_ms: 2_500, mid: 0.6, bid: 0.59, ask: 0.61 },
        ];
        assert_eq!(resample_mid(&samples, 1_000, 4_000), vec![0.4, 0.4, 0.4, 0.6, 0.6]);
    }

    #[test]
    fn clustered_volatility_has_positive_half_life() {
        // Bursts of large moves separated by quiet stretches.
        let mut samples = Vec::new();
        let mut mid: f64 = 0.5;
        for i in 0..400 {
            let burst = (i / 20) % 2 == 0;
            let step = if burst { 0.02 } else { 0.001 };
            mid = if i % 2 == 0 { mid + step } else { mid - step * 0.9 };
            samples.push(PriceSample {
                ts_ms: i * 1_000,
                mid: mid.clamp(0.05, 0.95),
                bid: 0.0,
                ask: 0.0,
            });
        }
        let profile = analyze(&AnalyzerConfig::default(), &samples, &[], 399_000);
        let h = profile.return_half_life_s.unwrap_or_default();
        assert!(h > 1.0, "half-life {h}");
    }

    #[test]
    fn profile_is_cached_until_refresh() {
        let samples = alternating_samples(40);
        let trades: Vec<TradeEvent> = (0..10)
            .map(|i| TradeEvent {
                ts_ms: i * 4_000,
                side: TradeSide::Buy,
                size: 1.0,
                price: 0.5,
                seq: None,
            })
            .collect();
        let mut analyzer = ActivityAnalyzer::default();
        let first = analyzer.profile(&samples, &trades, 0, 100_000).clone();
        assert_eq!(first.trades, 10);
        let second = analyzer.profile(&samples[..5], &trades[..2], 0, 110_000).clone();
        assert_eq!(first, second);
        let third = analyzer.profile(&samples[..5], &trades[..2], 0, 140_000).clone();
        assert_eq!(third.trades, 2);
        assert!(third.trade_intervals.is_none());
    }
}
