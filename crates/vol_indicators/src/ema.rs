use serde::{Deserialize, Serialize};

/// One continuous-time EMA step: `prev + (x - prev) * (1 - exp(-dt/tau))`.
/// A non-positive time constant tracks the input exactly.
pub fn ema_step(prev: f64, x: f64, tau_s: f64, dt_s: f64) -> f64 {
    if !(tau_s.is_finite() && tau_s > 0.0) {
        return x;
    }
    let dt_s = dt_s.max(0.0);
    let alpha = 1.0 - (-dt_s / tau_s).exp();
    prev + alpha * (x - prev)
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct EmaState {
    pub value: f64,
    pub tau_s: f64,
    pub last_update_ms: Option<i64>,
}

impl EmaState {
    pub fn new(tau_s: f64) -> Self {
        Self {
            value: 0.0,
            tau_s,
            last_update_ms: None,
        }
    }

    pub fn is_seeded(&self) -> bool {
        self.last_update_ms.is_some()
    }

    /// Next state after observing `x` at `ts_ms`. The first observation seeds the value.
    #[must_use]
    pub fn update(self, x: f64, ts_ms: i64) -> Self {
        let value = match self.last_update_ms {
            None => x,
            Some(last) => ema_step(self.value, x, self.tau_s, (ts_ms - last) as f64 / 1_000.0),
        };
        Self {
            value,
            tau_s: self.tau_s,
            last_update_ms: Some(self.last_update_ms.map_or(ts_ms, |last| last.max(ts_ms))),
        }
    }

    #[must_use]
    pub fn with_tau(self, tau_s: f64) -> Self {
        Self { tau_s, ..self }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_decays_toward_input() {
        let one_tau = ema_step(0.0, 1.0, 30.0, 30.0);
        assert!((one_tau - (1.0 - (-1.0f64).exp())).abs() < 1e-12);
        assert_eq!(ema_step(0.3, 0.9, 0.0, 5.0), 0.9);
        assert_eq!(ema_step(0.3, 0.9, 30.0, 0.0), 0.3);
    }

    #[test]
    fn state_seeds_then_smooths() {
        let s = EmaState::new(10.0).update(2.0, 1_000);
        assert!(s.is_seeded());
        assert_eq!(s.value, 2.0);
        let s = s.update(0.0, 11_000);
        assert!((s.value - 2.0 * (-1.0f64).exp()).abs() < 1e-12);
        assert_eq!(s.last_update_ms, Some(11_000));
    }
}
