use logit_space::{ceil_to_tick, clamp_to_band, floor_to_tick, logit, sigmoid};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LadderConfig {
    /// Per-level risk multiplier; level i risks `decay^i` of level 0.
    pub decay: f64,
    pub step_mult: f64,
    pub min_step_logit: f64,
    pub max_levels: usize,
    /// Share of the side budget risked at level 0.
    pub risk_fraction: f64,
}

impl Default for LadderConfig {
    fn default() -> Self {
        Self {
            decay: 0.8,
            step_mult: 0.5,
            min_step_logit: 0.05,
            max_levels: 5,
            risk_fraction: 0.10,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct LadderLevel {
    pub level: u32,
    pub price: f64,
    pub size: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Ladder {
    /// Best first (descending price).
    pub bids: Vec<LadderLevel>,
    /// Best first (ascending price).
    pub asks: Vec<LadderLevel>,
}

impl Ladder {
    pub fn best_bid(&self) -> Option<f64> {
        self.bids.first().map(|l| l.price)
    }

    pub fn best_ask(&self) -> Option<f64> {
        self.asks.first().map(|l| l.price)
    }
}

pub fn ladder_step(half_bid: f64, half_ask: f64, cfg: &LadderConfig) -> f64 {
    (cfg.step_mult * (half_bid + half_ask) / 2.0).max(cfg.min_step_logit)
}

/// Lays levels outward from `r_x ∓ half` in logit space. Bids are floored to
/// the tick, asks ceiled; if the inner bid meets the inner ask the asks move
/// out to one tick above the bid.
pub fn build_ladder(
    r_x: f64,
    half_bid: f64,
    half_ask: f64,
    tick: f64,
    side_budget: f64,
    cfg: &LadderConfig,
) -> Ladder {
    let step = ladder_step(half_bid, half_ask, cfg);
    if !(step.is_finite() && step > 1e-9) {
        return Ladder::default();
    }
    let x_min = logit(tick.max(0.001));
    let x_max = logit((1.0 - tick).min(0.999));
    let base_risk = side_budget.max(0.0) * cfg.risk_fraction;

    let mut bids = Vec::new();
    let x_b0 = r_x - half_bid;
    for i in 0..cfg.max_levels {
        let x = x_b0 - i as f64 * step;
        if x < x_min {
            break;
        }
        let p = clamp_to_band(floor_to_tick(sigmoid(x), tick), tick);
        let risk = base_risk * cfg.decay.powi(i as i32);
        bids.push(LadderLevel {
            level: i as u32,
            price: p,
            size: risk / p.max(1e-3),
        });
    }

    let mut asks = Vec::new();
    let x_a0 = r_x + half_ask;
    for i in 0..cfg.max_levels {
        let x = x_a0 + i as f64 * step;
        if x > x_max {
            break;
        }
        let p = clamp_to_band(ceil_to_tick(sigmoid(x), tick), tick);
        let risk = base_risk * cfg.decay.powi(i as i32);
        asks.push(LadderLevel {
            level: i as u32,
            price: p,
            size: risk / (1.0 - p).max(1e-3),
        });
    }

    let bids = dedupe(bids, true);
    let mut asks = dedupe(asks, false);

    if let (Some(bid), Some(ask)) = (bids.first().map(|l| l.price), asks.first().map(|l| l.price)) {
        if bid >= ask {
            let floor = ceil_to_tick(bid + tick, tick);
            for level in asks.iter_mut() {
                if level.price < floor {
                    level.price = floor;
                }
            }
            asks.retain(|l| l.price <= 1.0 - tick + 1e-12);
            asks = dedupe(asks, false);
        }
    }

    Ladder { bids, asks }
}

/// One level per price, keeping the innermost; sorted best first.
fn dedupe(levels: Vec<LadderLevel>, descending: bool) -> Vec<LadderLevel> {
    let mut out: Vec<LadderLevel> = Vec::with_capacity(levels.len());
    for level in levels {
        match out.iter_mut().find(|l| (l.price - level.price).abs() < 1e-12) {
            Some(existing) => {
                if level.level < existing.level {
                    *existing = level;
                }
            }
            None => out.push(level),
        }
    }
    if descending {
        out.sort_by(|a, b| b.price.total_cmp(&a.price));
    } else {
        out.sort_by(|a, b| a.price.total_cmp(&b.price));
    }
    out
}
