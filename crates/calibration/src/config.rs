use core_types::CalibrationBundle;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WarmupConfig {
    pub observation_cadence_ms: u64,
    pub min_price_changes: usize,
    pub min_trades: usize,
    pub observation_timeout_s: f64,
    pub dt_min_s: f64,
    pub dt_max_s: f64,
    pub tau_fast_min_s: f64,
    pub tau_fast_max_s: f64,
    pub slow_fast_ratio: f64,
    pub tau_slow_max_s: f64,
    pub markout_max_s: f64,
    pub min_return_samples: usize,
    pub max_sampling_s: f64,
    pub adaptation_half_life_s: f64,
    pub adaptation_interval_s: f64,
    pub adaptation_window_s: f64,
    /// Used whenever a statistic is unavailable, and wholesale on the degraded path.
    pub defaults: CalibrationBundle,
}

impl Default for WarmupConfig {
    fn default() -> Self {
        Self {
            observation_cadence_ms: 200,
            min_price_changes: 30,
            min_trades: 10,
            observation_timeout_s: 900.0,
            dt_min_s: 1.0,
            dt_max_s: 30.0,
            tau_fast_min_s: 10.0,
            tau_fast_max_s: 600.0,
            slow_fast_ratio: 60.0,
            tau_slow_max_s: 21_600.0,
            markout_max_s: 600.0,
            min_return_samples: 360,
            max_sampling_s: 7_200.0,
            adaptation_half_life_s: 7_200.0,
            adaptation_interval_s: 600.0,
            adaptation_window_s: 3_600.0,
            defaults: CalibrationBundle::default(),
        }
    }
}
