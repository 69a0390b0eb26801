//! Logit-space reservation price, per-side half-spreads and the order ladder.

pub mod ladder;
pub mod supervisor;

use core_types::{
    EngineError, OrderSide, QuoteIntent, QuoteMetrics, QuoteMode, QuotePlan, VolRegime,
};
use logit_space::{ceil_to_tick, clamp_to_band, clip, floor_to_tick, logit, sigmoid, try_logit};
use risk_engine::RiskAssessment;
use serde::{Deserialize, Serialize};

pub use crate::ladder::{build_ladder, Ladder, LadderConfig, LadderLevel};
pub use crate::supervisor::{GapAction, QuoteSupervisor, SupervisorAction, SupervisorConfig};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QuoteConfig {
    pub c_risk: f64,
    pub kappa0: f64,
    pub rate_ref_per_s: f64,
    pub min_half_spread_prob: f64,
    pub max_half_spread_logit: f64,
    pub regime_active_sigma: f64,
    pub regime_stressed_sigma: f64,
    pub kappa_mult_calm: f64,
    pub kappa_mult_active: f64,
    pub kappa_mult_stressed: f64,
    pub ladder: LadderConfig,
    pub min_order_size: f64,
    pub max_order_size: f64,
    pub max_order_notional_side: f64,
}

impl Default for QuoteConfig {
    fn default() -> Self {
        Self {
            c_risk: 0.2,
            kappa0: 1.0,
            rate_ref_per_s: 0.05,
            min_half_spread_prob: 0.01,
            max_half_spread_logit: 1.5,
            regime_active_sigma: 1.5,
            regime_stressed_sigma: 3.0,
            kappa_mult_calm: 1.0,
            kappa_mult_active: 0.8,
            kappa_mult_stressed: 0.5,
            ladder: LadderConfig::default(),
            min_order_size: 1.0,
            max_order_size: 500.0,
            max_order_notional_side: 100.0,
        }
    }
}

/// Market-side inputs of one quote computation.
#[derive(Debug, Clone, PartialEq)]
pub struct QuoteInputs {
    pub market_id: String,
    pub mid: f64,
    pub tick_size: f64,
    /// Buy-aggressor trades per second; these lift our asks.
    pub buy_rate_per_s: f64,
    /// Sell-aggressor trades per second; these hit our bids.
    pub sell_rate_per_s: f64,
    pub sigma: f64,
    pub inventory: f64,
    pub now_ms: i64,
}

pub fn classify_regime(sigma: f64, cfg: &QuoteConfig) -> VolRegime {
    if sigma < cfg.regime_active_sigma {
        VolRegime::Calm
    } else if sigma < cfg.regime_stressed_sigma {
        VolRegime::Active
    } else {
        VolRegime::Stressed
    }
}

pub fn regime_kappa_mult(regime: VolRegime, cfg: &QuoteConfig) -> f64 {
    match regime {
        VolRegime::Calm => cfg.kappa_mult_calm,
        VolRegime::Active => cfg.kappa_mult_active,
        VolRegime::Stressed => cfg.kappa_mult_stressed,
    }
}

/// Fill intensity for one side: `kappa0 * (1 + rate / (rate_ref / 2)) * mult`.
pub fn side_kappa(kappa0: f64, side_rate_per_s: f64, rate_ref_per_s: f64, regime_mult: f64) -> f64 {
    let half_ref = (rate_ref_per_s / 2.0).max(1e-9);
    kappa0 * (1.0 + side_rate_per_s.max(0.0) / half_ref) * regime_mult
}

/// `(1/gamma) * ln(1 + gamma/kappa)`.
pub fn liquidity_half_spread(gamma: f64, kappa: f64) -> f64 {
    let gamma = gamma.max(1e-9);
    (1.0 / gamma) * (1.0 + gamma / kappa.max(1e-9)).ln()
}

/// Logit width of a `±half_prob` band around `p`.
pub fn min_half_spread_logit(p: f64, half_prob: f64) -> f64 {
    let lo = clip(p - half_prob, 1e-6, 1.0 - 1e-6);
    let hi = clip(p + half_prob, 1e-6, 1.0 - 1e-6);
    ((logit(hi) - logit(lo)) / 2.0).max(0.0)
}

#[derive(Debug, Clone)]
pub struct QuoteEngine {
    cfg: QuoteConfig,
}

impl QuoteEngine {
    pub fn new(cfg: QuoteConfig) -> Self {
        Self { cfg }
    }

    pub fn config(&self) -> &QuoteConfig {
        &self.cfg
    }

    pub fn compute(
        &self,
        inputs: &QuoteInputs,
        risk: &RiskAssessment,
    ) -> Result<QuotePlan, EngineError> {
        let x_mid = try_logit(inputs.mid)?;
        let sigma = if inputs.sigma.is_finite() { inputs.sigma.max(1.0) } else { 1.0 };
        let gamma = risk.gamma;
        let lambda = risk.lambda;

        let skew = risk.q_hat * gamma * lambda * sigma;
        let reservation = x_mid - skew;

        let regime = classify_regime(sigma, &self.cfg);
        let mult = regime_kappa_mult(regime, &self.cfg);
        let (kappa0, rate_ref) = (self.cfg.kappa0, self.cfg.rate_ref_per_s);
        let kappa_bid = side_kappa(kappa0, inputs.sell_rate_per_s, rate_ref, mult);
        let kappa_ask = side_kappa(kappa0, inputs.buy_rate_per_s, rate_ref, mult);

        let risk_half = self.cfg.c_risk * gamma * lambda * sigma;
        let hi = self.cfg.max_half_spread_logit.max(0.0);
        let lo = min_half_spread_logit(inputs.mid, self.cfg.min_half_spread_prob).min(hi);
        let half_spread_bid = clip(risk_half + liquidity_half_spread(gamma, kappa_bid), lo, hi);
        let half_spread_ask = clip(risk_half + liquidity_half_spread(gamma, kappa_ask), lo, hi);

        let terms = [skew, reservation, half_spread_bid, half_spread_ask, kappa_bid, kappa_ask];
        if terms.iter().any(|v| !v.is_finite()) {
            return Err(EngineError::NumericDegenerate(format!(
                "quote terms not finite: skew={skew} r={reservation} \
                 hb={half_spread_bid} ha={half_spread_ask}"
            )));
        }

        let budget = risk.b_side * risk.time_factor;
        let ladder = build_ladder(
            reservation,
            half_spread_bid,
            half_spread_ask,
            inputs.tick_size,
            budget,
            &self.cfg.ladder,
        );

        let metrics = QuoteMetrics {
            mid: inputs.mid,
            x_mid,
            inventory: inputs.inventory,
            q_max: risk.q_max,
            q_hat: risk.q_hat,
            gamma,
            lambda,
            sigma,
            skew,
            reservation,
            half_spread_bid,
            half_spread_ask,
            kappa_bid,
            kappa_ask,
            regime,
        };

        Ok(QuotePlan {
            market_id: inputs.market_id.clone(),
            mode: QuoteMode::Normal,
            bids: self.size_orders(&inputs.market_id, OrderSide::Buy, &ladder.bids),
            asks: self.size_orders(&inputs.market_id, OrderSide::Sell, &ladder.asks),
            metrics: Some(metrics),
            ts_ms: inputs.now_ms,
            stale: false,
        })
    }

    /// Min/max size per order and a running per-side notional cap; the
    /// ladder is cut at the first level that would breach the cap.
    fn size_orders(
        &self,
        market_id: &str,
        side: OrderSide,
        levels: &[LadderLevel],
    ) -> Vec<QuoteIntent> {
        let min_size = self.cfg.min_order_size.max(0.0);
        let max_size = self.cfg.max_order_size.max(min_size);
        let mut total = 0.0;
        let mut out = Vec::with_capacity(levels.len());
        for level in levels {
            let intent = QuoteIntent {
                market_id: market_id.to_string(),
                side,
                price: level.price,
                size: clip(level.size, min_size, max_size),
                level: level.level,
            };
            let notional = intent.notional();
            if !notional.is_finite() || total + notional > self.cfg.max_order_notional_side {
                break;
            }
            total += notional;
            out.push(intent);
        }
        out
    }

    /// Wide single-level quote around the last good reservation. Without a
    /// previous computation there is nothing to anchor on, so it withdraws.
    pub fn defensive_plan(
        &self,
        last_good: &QuotePlan,
        tick: f64,
        spread_mult: f64,
        now_ms: i64,
    ) -> QuotePlan {
        let Some(last) = last_good.metrics.as_ref() else {
            return QuotePlan::withdrawn(&last_good.market_id, now_ms);
        };
        let mult = spread_mult.max(1.0);
        let half_bid = last.half_spread_bid * mult;
        let half_ask = last.half_spread_ask * mult;
        let bid = clamp_to_band(floor_to_tick(sigmoid(last.reservation - half_bid), tick), tick);
        let mut ask = clamp_to_band(ceil_to_tick(sigmoid(last.reservation + half_ask), tick), tick);
        if bid >= ask {
            ask = ceil_to_tick(bid + tick, tick);
        }

        let size = self.cfg.min_order_size.max(0.0);
        let intent = |side, price| QuoteIntent {
            market_id: last_good.market_id.clone(),
            side,
            price,
            size,
            level: 0,
        };
        let bids = vec![intent(OrderSide::Buy, bid)];
        let asks = if ask <= 1.0 - tick + 1e-12 {
            vec![intent(OrderSide::Sell, ask)]
        } else {
            Vec::new()
        };

        QuotePlan {
            market_id: last_good.market_id.clone(),
            mode: QuoteMode::Defensive,
            bids,
            asks,
            metrics: Some(QuoteMetrics {
                half_spread_bid: half_bid,
                half_spread_ask: half_ask,
                ..last.clone()
            }),
            ts_ms: now_ms,
            stale: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn risk(q_hat: f64) -> RiskAssessment {
        let gamma = risk_engine::solvency_fear(q_hat, 1.0);
        RiskAssessment {
            p: 0.5,
            time_factor: 1.0,
            b_side: 100.0,
            q_max: 100.0,
            q_hat,
            gamma,
            ambiguity: 1.0,
            crowd_weakness: 1.0,
            score: 1.0,
            lambda: 1.2,
            crowd_size: 0.0,
        }
    }

    fn inputs(mid: f64) -> QuoteInputs {
        QuoteInputs {
            market_id: "m".to_string(),
            mid,
            tick_size: 0.01,
            buy_rate_per_s: 0.0,
            sell_rate_per_s: 0.0,
            sigma: 1.0,
            inventory: 0.0,
            now_ms: 1_000,
        }
    }

    #[test]
    fn flat_inventory_quotes_symmetrically() {
        let engine = QuoteEngine::new(QuoteConfig::default());
        let plan = engine.compute(&inputs(0.5), &risk(0.0)).unwrap();
        let m = plan.metrics.clone().unwrap();
        assert_eq!(m.skew, 0.0);
        assert!((m.half_spread_bid - m.half_spread_ask).abs() < 1e-12);
        let (bid, ask) = (plan.best_bid().unwrap(), plan.best_ask().unwrap());
        assert!(((0.5 - bid) - (ask - 0.5)).abs() < 1e-9);
        assert!(bid < ask);
        assert_eq!(plan.mode, QuoteMode::Normal);
    }

    #[test]
    fn long_inventory_shifts_reservation_below_mid() {
        let engine = QuoteEngine::new(QuoteConfig::default());
        let plan = engine.compute(&inputs(0.5), &risk(0.4)).unwrap();
        let m = plan.metrics.unwrap();
        assert!(m.reservation < m.x_mid);
        assert!((m.skew - 0.4 * m.gamma * 1.2).abs() < 1e-12);

        let short = engine.compute(&inputs(0.5), &risk(-0.4)).unwrap();
        assert!(short.metrics.unwrap().reservation > m.x_mid);
    }

    #[test]
    fn prices_stay_in_band_and_uncrossed() {
        let engine = QuoteEngine::new(QuoteConfig::default());
        for mid in [0.02, 0.1, 0.33, 0.5, 0.77, 0.97] {
            for q_hat in [-0.999, -0.5, 0.0, 0.5, 0.999] {
                let plan = engine.compute(&inputs(mid), &risk(q_hat)).unwrap();
                for q in plan.intents() {
                    assert!(
                        q.price >= 0.01 - 1e-12 && q.price <= 0.99 + 1e-12,
                        "{mid} {q_hat} {}",
                        q.price
                    );
                    assert!(q.size >= 1.0);
                }
                if let (Some(b), Some(a)) = (plan.best_bid(), plan.best_ask()) {
                    assert!(b < a, "{mid} {q_hat}");
                }
            }
        }
    }

    #[test]
    fn flow_and_regime_narrow_the_liquidity_term() {
        let cfg = QuoteConfig::default();
        let calm = side_kappa(1.0, 0.0, 0.05, regime_kappa_mult(VolRegime::Calm, &cfg));
        let busy = side_kappa(1.0, 0.1, 0.05, regime_kappa_mult(VolRegime::Calm, &cfg));
        assert!((busy - 5.0).abs() < 1e-12);
        assert!(liquidity_half_spread(1.0, busy) < liquidity_half_spread(1.0, calm));
        assert_eq!(classify_regime(1.2, &cfg), VolRegime::Calm);
        assert_eq!(classify_regime(2.0, &cfg), VolRegime::Active);
        assert_eq!(classify_regime(3.0, &cfg), VolRegime::Stressed);

        let engine = QuoteEngine::new(cfg);
        let plan = engine
            .compute(&QuoteInputs { buy_rate_per_s: 0.2, ..inputs(0.5) }, &risk(0.0))
            .unwrap();
        let m = plan.metrics.unwrap();
        assert!(m.kappa_ask > m.kappa_bid);
        assert!(m.half_spread_ask < m.half_spread_bid);
    }

    #[test]
    fn half_spread_is_capped() {
        let engine = QuoteEngine::new(QuoteConfig::default());
        let plan = engine
            .compute(&QuoteInputs { sigma: 6.0, ..inputs(0.5) }, &risk(0.95))
            .unwrap();
        let m = plan.metrics.unwrap();
        assert_eq!(m.half_spread_bid, 1.5);
        assert_eq!(m.regime, VolRegime::Stressed);
    }

    #[test]
    fn notional_cap_truncates_the_ladder() {
        let cfg = QuoteConfig {
            max_order_notional_side: 15.0,
            ..QuoteConfig::default()
        };
        let engine = QuoteEngine::new(cfg);
        let plan = engine.compute(&inputs(0.5), &risk(0.0)).unwrap();
        let bid_notional: f64 = plan.bids.iter().map(QuoteIntent::notional).sum();
        assert!(bid_notional <= 15.0);
        assert!(plan.bids.len() < 5);
    }

    #[test]
    fn degenerate_mid_is_an_error() {
        let engine = QuoteEngine::new(QuoteConfig::default());
        assert!(matches!(
            engine.compute(&inputs(1.0), &risk(0.0)),
            Err(EngineError::NumericDegenerate(_))
        ));
        assert!(engine.compute(&inputs(f64::NAN), &risk(0.0)).is_err());
    }

    #[test]
    fn defensive_plan_widens_around_last_reservation() {
        let engine = QuoteEngine::new(QuoteConfig::default());
        let good = engine.compute(&inputs(0.5), &risk(0.2)).unwrap();
        let wide = engine.defensive_plan(&good, 0.01, 3.0, 5_000);
        assert_eq!(wide.mode, QuoteMode::Defensive);
        assert_eq!(wide.bids.len(), 1);
        assert_eq!(wide.asks.len(), 1);
        assert!(wide.best_bid().unwrap() <= good.best_bid().unwrap());
        assert!(wide.best_ask().unwrap() >= good.best_ask().unwrap());
        assert_eq!(wide.bids[0].size, 1.0);
        let (gm, wm) = (good.metrics.unwrap(), wide.metrics.unwrap());
        assert_eq!(wm.reservation, gm.reservation);

        let nothing = engine.defensive_plan(&QuotePlan::withdrawn("m", 0), 0.01, 3.0, 5_000);
        assert_eq!(nothing.mode, QuoteMode::Withdrawn);
    }
}
