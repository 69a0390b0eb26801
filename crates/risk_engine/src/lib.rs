//! Inventory limits, solvency fear and the archetype-driven structural tilt.

pub mod archetype;

use core_types::{BinaryMarket, EngineError, FillEvent};
use logit_space::clip;
use serde::{Deserialize, Serialize};

pub use crate::archetype::{
    Archetype, ArchetypeTable, InformationLevel, MarchetypeProfile, ResolutionStyle,
};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RiskConfig {
    pub bankroll: f64,
    pub n_plays: u32,
    /// Share of the bankroll given to this market; `1 / n_plays` when unset.
    pub capital_weight: Option<f64>,
    pub eta_time: f64,
    pub slippage_buffer: f64,
    pub gamma_a: f64,
    /// Numerical ceiling on solvency fear.
    pub gamma_max: f64,
    pub q_hat_cap: f64,
    pub w_a: f64,
    pub w_l: f64,
    pub archetype: Archetype,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            bankroll: 50.0,
            n_plays: 3,
            capital_weight: None,
            eta_time: 0.5,
            slippage_buffer: 0.10,
            gamma_a: 1.0,
            gamma_max: 50.0,
            q_hat_cap: 0.999,
            w_a: 1.0,
            w_l: 1.0,
            archetype: Archetype::A3,
        }
    }
}

impl RiskConfig {
    pub fn capital_weight(&self) -> f64 {
        match self.capital_weight {
            Some(w) if w.is_finite() && w > 0.0 => w.min(1.0),
            _ => 1.0 / f64::from(self.n_plays.max(1)),
        }
    }
}

/// `(remaining / horizon)^eta`, 0 at or after resolution.
pub fn time_factor(market: &BinaryMarket, now_ms: i64, eta: f64) -> f64 {
    let horizon_s = market.horizon_ms().max(1) as f64 / 1_000.0;
    let remaining_s = market.remaining_ms(now_ms).max(0) as f64 / 1_000.0;
    clip(remaining_s / horizon_s, 0.0, 1.0).powf(eta.max(0.0))
}

/// One side's capital: half the bankroll times this market's weight.
pub fn side_budget(bankroll: f64, capital_weight: f64) -> f64 {
    0.5 * bankroll.max(0.0) * capital_weight.max(0.0)
}

/// Largest inventory the side budget can hedge at the opposite outcome's price.
pub fn max_inventory(b_side: f64, time_factor: f64, p: f64, q: f64, slippage_buffer: f64) -> f64 {
    let p_opp = if q >= 0.0 { 1.0 - p } else { p };
    let denom = (p_opp * (1.0 + slippage_buffer.max(0.0))).max(1e-9);
    b_side * time_factor / denom
}

/// `q / q_max` clamped to `±cap` with `cap < 1`.
pub fn normalized_inventory(q: f64, q_max: f64, cap: f64) -> f64 {
    let cap = clip(cap, 0.0, 0.999_999);
    if !q.is_finite() || q == 0.0 {
        return 0.0;
    }
    if !(q_max.is_finite() && q_max > 0.0) {
        return cap.copysign(q);
    }
    clip(q / q_max, -cap, cap)
}

/// `1 / (1 - |q̂|)^gamma_a`. Unbounded as `|q̂| → 1`.
pub fn solvency_fear(q_hat: f64, gamma_a: f64) -> f64 {
    1.0 / (1.0 - q_hat.abs()).powf(gamma_a)
}

/// `(p(1-p) / 0.25)^beta_p`, 1 at p = 0.5.
pub fn ambiguity_score(p: f64, beta_p: f64) -> f64 {
    let p = clip(p, 0.0, 1.0);
    (p * (1.0 - p) / 0.25).powf(beta_p)
}

/// `(U_ref / (U + U_ref))^alpha_U`, 1 at U = 0.
pub fn crowd_weakness(u: f64, alpha_u: f64, u_ref: f64) -> f64 {
    let u_ref = u_ref.max(1e-9);
    (u_ref / (u.max(0.0) + u_ref)).powf(alpha_u)
}

pub fn blended_score(a: f64, l: f64, w_a: f64, w_l: f64) -> f64 {
    let (w_a, w_l) = (w_a.max(0.0), w_l.max(0.0));
    let total = w_a + w_l;
    if total <= 0.0 {
        return 0.0;
    }
    clip((w_a * a + w_l * l) / total, 0.0, 1.0)
}

pub fn lambda_from_score(s: f64, profile: &MarchetypeProfile) -> f64 {
    profile.lambda_min + (profile.lambda_max - profile.lambda_min) * clip(s, 0.0, 1.0)
}

pub fn structural_lambda(p: f64, u: f64, profile: &MarchetypeProfile, w_a: f64, w_l: f64) -> f64 {
    let a = ambiguity_score(p, profile.beta_p);
    let l = crowd_weakness(u, profile.alpha_u, profile.u_ref);
    lambda_from_score(blended_score(a, l, w_a, w_l), profile)
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct RiskState {
    /// Net YES inventory; negative is net short YES.
    pub inventory: f64,
    pub capital: f64,
    pub time_to_resolution_s: f64,
    pub q_max: f64,
    pub fills: u64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct RiskAssessment {
    pub p: f64,
    pub time_factor: f64,
    pub b_side: f64,
    pub q_max: f64,
    pub q_hat: f64,
    pub gamma: f64,
    pub ambiguity: f64,
    pub crowd_weakness: f64,
    pub score: f64,
    pub lambda: f64,
    pub crowd_size: f64,
}

#[derive(Debug, Clone)]
pub struct RiskEngine {
    cfg: RiskConfig,
    profile: MarchetypeProfile,
    market: BinaryMarket,
    state: RiskState,
}

impl RiskEngine {
    pub fn new(cfg: RiskConfig, table: &ArchetypeTable, market: BinaryMarket) -> Self {
        let profile = table.get(cfg.archetype);
        let state = RiskState {
            inventory: 0.0,
            capital: cfg.bankroll,
            time_to_resolution_s: 0.0,
            q_max: 0.0,
            fills: 0,
        };
        Self {
            cfg,
            profile,
            market,
            state,
        }
    }

    pub fn config(&self) -> &RiskConfig {
        &self.cfg
    }

    pub fn profile(&self) -> &MarchetypeProfile {
        &self.profile
    }

    pub fn state(&self) -> RiskState {
        self.state
    }

    pub fn set_inventory(&mut self, inventory: f64) {
        if inventory.is_finite() {
            self.state.inventory = inventory;
        }
    }

    /// Applies one fill to inventory. Fills for other markets are ignored.
    pub fn on_fill(&mut self, fill: &FillEvent) -> f64 {
        if fill.market_id != self.market.market_id || !fill.size.is_finite() || fill.size <= 0.0 {
            tracing::debug!(order_id = %fill.order_id, "fill ignored by risk engine");
            return self.state.inventory;
        }
        self.state.inventory += fill.signed_size();
        self.state.fills += 1;
        self.state.inventory
    }

    /// Recomputes `q_max` and the risk terms at mid `p`.
    pub fn assess(
        &mut self,
        p: f64,
        crowd_size: f64,
        now_ms: i64,
    ) -> Result<RiskAssessment, EngineError> {
        if !(p.is_finite() && p > 0.0 && p < 1.0) {
            return Err(EngineError::NumericDegenerate(format!("mid {p} outside (0,1)")));
        }
        let tf = time_factor(&self.market, now_ms, self.cfg.eta_time);
        let b_side = side_budget(self.state.capital, self.cfg.capital_weight());
        let q = self.state.inventory;
        let q_max = max_inventory(b_side, tf, p, q, self.cfg.slippage_buffer);
        let q_hat = normalized_inventory(q, q_max, self.cfg.q_hat_cap);
        let gamma = solvency_fear(q_hat, self.cfg.gamma_a).min(self.cfg.gamma_max.max(1.0));

        let u = if crowd_size.is_finite() { crowd_size.max(0.0) } else { 0.0 };
        let a = ambiguity_score(p, self.profile.beta_p);
        let l = crowd_weakness(u, self.profile.alpha_u, self.profile.u_ref);
        let score = blended_score(a, l, self.cfg.w_a, self.cfg.w_l);
        let lambda = lambda_from_score(score, &self.profile);

        if !(gamma.is_finite() && lambda.is_finite() && q_max.is_finite()) {
            return Err(EngineError::NumericDegenerate(format!(
                "risk terms not finite: gamma={gamma} lambda={lambda} q_max={q_max}"
            )));
        }

        self.state.q_max = q_max;
        self.state.time_to_resolution_s = self.market.remaining_ms(now_ms).max(0) as f64 / 1_000.0;

        Ok(RiskAssessment {
            p,
            time_factor: tf,
            b_side,
            q_max,
            q_hat,
            gamma,
            ambiguity: a,
            crowd_weakness: l,
            score,
            lambda,
            crowd_size: u,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core_types::OrderSide;

    fn market() -> BinaryMarket {
        BinaryMarket {
            market_id: "m".to_string(),
            yes_asset_id: "yes".to_string(),
            no_asset_id: "no".to_string(),
            start_ts_ms: 0,
            resolve_ts_ms: 100_000_000,
        }
    }

    fn fill(side: OrderSide, size: f64) -> FillEvent {
        FillEvent {
            order_id: "o".to_string(),
            market_id: "m".to_string(),
            side,
            price: 0.5,
            size,
            ts_ms: 1,
        }
    }

    #[test]
    fn ambiguity_and_crowd_scores_have_expected_shape() {
        assert!((ambiguity_score(0.5, 0.7) - 1.0).abs() < 1e-12);
        assert!(ambiguity_score(1e-6, 0.7) < 0.01);
        assert!(ambiguity_score(1.0 - 1e-6, 0.7) < 0.01);
        assert_eq!(crowd_weakness(0.0, 0.5, 50.0), 1.0);
        let mut prev = 1.0;
        for u in 1..200 {
            let l = crowd_weakness(u as f64, 0.5, 50.0);
            assert!(l < prev);
            prev = l;
        }
    }

    #[test]
    fn lambda_stays_in_band() {
        let profile = Archetype::A4.default_profile();
        assert_eq!(lambda_from_score(0.0, &profile), profile.lambda_min);
        assert_eq!(lambda_from_score(1.0, &profile), profile.lambda_max);
        for i in 1..100 {
            let p = i as f64 / 100.0;
            for u in [0.0, 3.0, 40.0, 1e6] {
                let lam = structural_lambda(p, u, &profile, 1.0, 1.0);
                assert!((profile.lambda_min..=profile.lambda_max).contains(&lam));
            }
        }
    }

    #[test]
    fn ambiguous_market_with_no_crowd_hits_lambda_max() {
        let profile = Archetype::A1.default_profile();
        assert_eq!(profile.beta_p, 0.5);
        assert_eq!(profile.alpha_u, 0.8);
        assert_eq!(profile.u_ref, 100.0);
        let lam = structural_lambda(0.5, 0.0, &profile, 1.0, 1.0);
        assert!((lam - profile.lambda_max).abs() < 1e-12);
    }

    #[test]
    fn solvency_fear_is_one_when_flat_and_diverges_near_limit() {
        assert_eq!(solvency_fear(0.0, 1.0), 1.0);
        assert!(solvency_fear(0.99, 1.0) > 99.0);
        assert!(solvency_fear(-0.999_999, 1.0) > 1e5);
        assert!(solvency_fear(0.9, 2.0) > solvency_fear(0.9, 1.0));
    }

    #[test]
    fn inventory_at_limit_is_clamped_below_one() {
        let q_max = max_inventory(side_budget(50.0, 1.0 / 3.0), 1.0, 0.5, 1.0, 0.10);
        let q_hat = normalized_inventory(q_max, q_max, 0.999);
        assert!(q_hat <= 0.999);
        assert!(solvency_fear(q_hat, 1.0).is_finite());
        assert_eq!(normalized_inventory(-10.0 * q_max, q_max, 0.999), -0.999);
        assert_eq!(normalized_inventory(5.0, 0.0, 0.999), 0.999);
        assert_eq!(normalized_inventory(0.0, 0.0, 0.999), 0.0);
    }

    #[test]
    fn q_max_uses_opposite_side_and_shrinks_toward_resolution() {
        let m = market();
        let long = max_inventory(10.0, 1.0, 0.8, 1.0, 0.0);
        let short = max_inventory(10.0, 1.0, 0.8, -1.0, 0.0);
        assert!((long - 50.0).abs() < 1e-9);
        assert!((short - 12.5).abs() < 1e-9);

        let early = time_factor(&m, 0, 0.5);
        let late = time_factor(&m, 75_000_000, 0.5);
        assert!((early - 1.0).abs() < 1e-12);
        assert!((late - 0.5).abs() < 1e-12);
        assert_eq!(time_factor(&m, 200_000_000, 0.5), 0.0);
    }

    #[test]
    fn engine_tracks_fills_and_caps_gamma() {
        let cfg = RiskConfig {
            gamma_max: 20.0,
            ..RiskConfig::default()
        };
        let mut engine = RiskEngine::new(cfg, &ArchetypeTable::default(), market());
        engine.on_fill(&fill(OrderSide::Buy, 5.0));
        engine.on_fill(&fill(OrderSide::Sell, 2.0));
        let foreign = FillEvent {
            market_id: "other".to_string(),
            ..fill(OrderSide::Buy, 9.0)
        };
        assert_eq!(engine.on_fill(&foreign), 3.0);
        assert_eq!(engine.state().fills, 2);

        let flat = engine.assess(0.5, 0.0, 0).unwrap();
        assert!(flat.q_hat > 0.0 && flat.gamma > 1.0);
        assert!(flat.q_max > 0.0);

        engine.set_inventory(10_000.0);
        let maxed = engine.assess(0.5, 0.0, 0).unwrap();
        assert_eq!(maxed.q_hat, 0.999);
        assert_eq!(maxed.gamma, 20.0);
        assert!(engine.assess(1.0, 0.0, 0).is_err());
    }
}
