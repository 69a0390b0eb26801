use std::collections::VecDeque;

use core_types::{FillEvent, OrderSide};
use logit_space::{clip, logit};
use serde::{Deserialize, Serialize};

use crate::ema::ema_step;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToxicityConfig {
    pub c_sigma: f64,
    /// Convexity exponent, > 1.
    pub nu: f64,
    pub sigma_max: f64,
    pub c_tox: f64,
    pub i_max: f64,
    pub rate_ref_per_s: f64,
    pub tau_sigma_up_s: f64,
    pub tau_sigma_down_s: f64,
    pub markout_w1: f64,
    pub markout_w2: f64,
    pub return_history_cap: usize,
    pub pending_fill_cap: usize,
}

impl Default for ToxicityConfig {
    fn default() -> Self {
        Self {
            c_sigma: 1.0,
            nu: 1.4,
            sigma_max: 6.0,
            c_tox: 1.0,
            i_max: 3.0,
            rate_ref_per_s: 0.05,
            tau_sigma_up_s: 10.0,
            tau_sigma_down_s: 90.0,
            markout_w1: 0.6,
            markout_w2: 0.4,
            return_history_cap: 5_000,
            pending_fill_cap: 2_000,
        }
    }
}

/// `J = ema_fast / ema_slow` with the slow leg floored.
pub fn shock_ratio(ema_fast: f64, ema_slow: f64) -> f64 {
    ema_fast / ema_slow.max(1e-9)
}

/// Trade-intensity amplifier in `[1, i_max]`.
pub fn intensity(trade_rate_per_s: f64, cfg: &ToxicityConfig) -> f64 {
    clip(
        trade_rate_per_s / cfg.rate_ref_per_s.max(1e-9),
        1.0,
        cfg.i_max.max(1.0),
    )
}

/// Maps the shock ratio (plus markout toxicity) into `[1, sigma_max]`.
/// Non-decreasing and convex in `j` for fixed `intensity` and `z_tox`.
pub fn sigma_from_shock(j: f64, intensity: f64, z_tox: f64, cfg: &ToxicityConfig) -> f64 {
    let shock = if j.is_finite() { (j - 1.0).max(0.0) } else { 0.0 };
    let tox = if z_tox.is_finite() { z_tox.max(0.0) } else { 0.0 };
    let stress = shock * intensity.max(1.0) + cfg.c_tox.max(0.0) * tox;
    let raw = 1.0 + cfg.c_sigma.max(0.0) * stress.powf(cfg.nu.max(1.0));
    if raw.is_finite() {
        clip(raw, 1.0, cfg.sigma_max.max(1.0))
    } else {
        cfg.sigma_max.max(1.0)
    }
}

/// Follows `raw` quickly upward and slowly downward.
pub fn smooth_sigma(prev: f64, raw: f64, dt_s: f64, cfg: &ToxicityConfig) -> f64 {
    let tau = if raw > prev {
        cfg.tau_sigma_up_s
    } else {
        cfg.tau_sigma_down_s
    };
    ema_step(prev, raw, tau, dt_s)
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct PendingFill {
    pub ts_ms: i64,
    pub x_fill: f64,
    pub sign: f64,
    pub h1_done: bool,
    pub h2_done: bool,
}

/// Own-fill markouts at two horizons. Only adverse moves (price moving
/// through the fill against our side) feed the EMAs.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct MarkoutState {
    pub pending: VecDeque<PendingFill>,
    pub tox_h1: f64,
    pub tox_h2: f64,
}

impl MarkoutState {
    #[must_use]
    pub fn record_fill(mut self, fill: &FillEvent, cap: usize) -> Self {
        if !(fill.price.is_finite() && fill.price > 0.0 && fill.price < 1.0) {
            return self;
        }
        let sign = match fill.side {
            OrderSide::Buy => 1.0,
            OrderSide::Sell => -1.0,
        };
        while cap > 0 && self.pending.len() >= cap {
            self.pending.pop_front();
        }
        self.pending.push_back(PendingFill {
            ts_ms: fill.ts_ms,
            x_fill: logit(fill.price),
            sign,
            h1_done: false,
            h2_done: false,
        });
        self
    }

    /// Marks every pending fill that crossed a horizon against `x_now`.
    #[must_use]
    pub fn mark(
        mut self,
        ts_ms: i64,
        x_now: f64,
        horizons_s: (f64, f64),
        tau_s: f64,
        dt_s: f64,
    ) -> Self {
        let h1_ms = (horizons_s.0 * 1_000.0) as i64;
        let h2_ms = (horizons_s.1 * 1_000.0) as i64;
        for fill in self.pending.iter_mut() {
            let age = ts_ms - fill.ts_ms;
            let adverse = (-fill.sign * (x_now - fill.x_fill)).max(0.0);
            if age >= h1_ms && !fill.h1_done {
                self.tox_h1 = ema_step(self.tox_h1, adverse, tau_s, dt_s);
                fill.h1_done = true;
            }
            if age >= h2_ms && !fill.h2_done {
                self.tox_h2 = ema_step(self.tox_h2, adverse, tau_s, dt_s);
                fill.h2_done = true;
            }
        }
        self.pending.retain(|f| !(f.h1_done && f.h2_done));
        self
    }

    pub fn weighted(&self, cfg: &ToxicityConfig) -> f64 {
        cfg.markout_w1 * self.tox_h1 + cfg.markout_w2 * self.tox_h2
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sigma_is_monotone_and_bounded_in_shock_ratio() {
        let cfg = ToxicityConfig::default();
        let mut prev = 0.0;
        for i in 0..2_000 {
            let j = i as f64 * 0.01;
            let s = sigma_from_shock(j, 1.0, 0.0, &cfg);
            assert!(s >= prev - 1e-15, "j={j}");
            assert!((1.0..=cfg.sigma_max).contains(&s));
            prev = s;
        }
        assert_eq!(sigma_from_shock(0.5, 1.0, 0.0, &cfg), 1.0);
        assert_eq!(sigma_from_shock(1e9, 3.0, 0.0, &cfg), cfg.sigma_max);
        assert_eq!(sigma_from_shock(f64::NAN, 1.0, 0.0, &cfg), 1.0);
    }

    #[test]
    fn sigma_is_convex_above_one() {
        let cfg = ToxicityConfig::default();
        let f = |j| sigma_from_shock(j, 1.0, 0.0, &cfg);
        let (a, b, c) = (f(1.5), f(2.0), f(2.5));
        assert!(b - a < c - b);
    }

    #[test]
    fn smoothing_is_asymmetric() {
        let cfg = ToxicityConfig::default();
        let up = smooth_sigma(1.0, 3.0, 5.0, &cfg) - 1.0;
        let down = 3.0 - smooth_sigma(3.0, 1.0, 5.0, &cfg);
        assert!(up > down);
    }

    #[test]
    fn adverse_markouts_raise_toxicity() {
        let fill = FillEvent {
            order_id: "o1".to_string(),
            market_id: "m".to_string(),
            side: OrderSide::Buy,
            price: 0.50,
            size: 5.0,
            ts_ms: 0,
        };
        let state = MarkoutState::default().record_fill(&fill, 10);
        // Mid moved up after our buy: favourable, nothing recorded.
        let rose = state.clone().mark(11_000, logit(0.55), (10.0, 60.0), 30.0, 5.0);
        assert_eq!(rose.tox_h1, 0.0);
        assert_eq!(rose.pending.len(), 1);
        // Mid fell through our bid at both horizons.
        let fell = state.mark(61_000, logit(0.45), (10.0, 60.0), 30.0, 5.0);
        assert!(fell.tox_h1 > 0.0 && fell.tox_h2 > 0.0);
        assert!(fell.pending.is_empty());
    }
}
