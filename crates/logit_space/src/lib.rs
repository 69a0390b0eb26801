//! Probability/logit transforms and price-grid rounding for the (0,1) domain.

use core_types::EngineError;

/// Clip applied by [`logit`] so the transform stays finite at the edges.
pub const PROB_EPS: f64 = 1e-6;

pub fn clip(x: f64, lo: f64, hi: f64) -> f64 {
    x.max(lo).min(hi)
}

pub fn logit(p: f64) -> f64 {
    let p = clip(p, PROB_EPS, 1.0 - PROB_EPS);
    (p / (1.0 - p)).ln()
}

/// Strict variant: rejects anything that is not a probability instead of clipping.
pub fn try_logit(p: f64) -> Result<f64, EngineError> {
    if !p.is_finite() || p <= 0.0 || p >= 1.0 {
        return Err(EngineError::NumericDegenerate(format!(
            "probability {p} outside (0,1)"
        )));
    }
    Ok(logit(p))
}

pub fn sigmoid(x: f64) -> f64 {
    if x >= 0.0 {
        1.0 / (1.0 + (-x).exp())
    } else {
        let e = x.exp();
        e / (1.0 + e)
    }
}

pub fn floor_to_tick(p: f64, tick: f64) -> f64 {
    snap(p, tick, f64::floor, 1e-9)
}

pub fn ceil_to_tick(p: f64, tick: f64) -> f64 {
    snap(p, tick, f64::ceil, -1e-9)
}

/// Clamp into `[tick, 1 - tick]`, the tradable band of a binary price.
pub fn clamp_to_band(p: f64, tick: f64) -> f64 {
    let tick = effective_tick(tick);
    clip(p, tick, 1.0 - tick)
}

fn effective_tick(tick: f64) -> f64 {
    if tick.is_finite() && tick > 0.0 && tick < 0.5 {
        tick
    } else {
        0.01
    }
}

fn snap(p: f64, tick: f64, round: fn(f64) -> f64, nudge: f64) -> f64 {
    let tick = effective_tick(tick);
    let units = round(p / tick + nudge);
    let factor = 10f64.powi(decimal_scale(tick) as i32);
    // Re-snap to the tick's decimal scale to drop fp tails.
    ((units * tick) * factor).round() / factor
}

fn decimal_scale(step: f64) -> usize {
    let formatted = format!("{step:.12}");
    match formatted.split_once('.') {
        Some((_, frac)) => frac.trim_end_matches('0').len(),
        None => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sigmoid_inverts_logit_across_the_domain() {
        for i in 1..1000 {
            let p = i as f64 / 1000.0;
            assert!((sigmoid(logit(p)) - p).abs() < 1e-12, "p={p}");
        }
        for p in [1e-5, 0.5, 1.0 - 1e-5] {
            assert!((sigmoid(logit(p)) - p).abs() < 1e-12);
        }
    }

    #[test]
    fn sigmoid_is_stable_at_extremes() {
        assert_eq!(sigmoid(-800.0), 0.0);
        assert_eq!(sigmoid(800.0), 1.0);
        assert!((sigmoid(0.0) - 0.5).abs() < 1e-15);
    }

    #[test]
    fn logit_clips_edges() {
        assert!(logit(0.0).is_finite());
        assert!(logit(1.0).is_finite());
        assert!(logit(0.0) < -13.0);
        assert!(try_logit(0.0).is_err());
        assert!(try_logit(f64::NAN).is_err());
        assert!(try_logit(0.3).is_ok());
    }

    #[test]
    fn tick_rounding() {
        assert!((floor_to_tick(0.4567, 0.01) - 0.45).abs() < 1e-12);
        assert!((ceil_to_tick(0.4512, 0.01) - 0.46).abs() < 1e-12);
        assert!((floor_to_tick(0.3, 0.1) - 0.3).abs() < 1e-12);
        assert!((ceil_to_tick(0.45, 0.01) - 0.45).abs() < 1e-12);
        assert!((floor_to_tick(0.4567, 0.001) - 0.456).abs() < 1e-12);
    }

    #[test]
    fn band_clamp_uses_tick() {
        assert!((clamp_to_band(0.0001, 0.01) - 0.01).abs() < 1e-12);
        assert!((clamp_to_band(0.9999, 0.001) - 0.999).abs() < 1e-12);
        assert!((clamp_to_band(0.5, f64::NAN) - 0.5).abs() < 1e-12);
    }
}
