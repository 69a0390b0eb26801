use activity_analyzer::MicrostructureProfile;
use core_types::{CalibrationBundle, Provenance};
use logit_space::clip;

use crate::config::WarmupConfig;

/// Derives cadence, time constants and markout horizons from an observation
/// profile. Always returns a valid bundle; missing statistics fall back to
/// `cfg.defaults` field by field.
pub fn meta_calibrate(
    profile: &MicrostructureProfile,
    cfg: &WarmupConfig,
    now_ms: i64,
) -> CalibrationBundle {
    let defaults = &cfg.defaults;

    let dt_raw = profile
        .price_change_intervals
        .as_ref()
        .map(|pc| pc.median_s)
        .unwrap_or(defaults.dt_sample_s);
    let dt_sample_s = clip(dt_raw, cfg.dt_min_s, cfg.dt_max_s);

    let tau_fast_raw = profile.return_half_life_s.unwrap_or(defaults.tau_fast_s);
    let tau_fast_floor = (3.0 * dt_sample_s).max(cfg.tau_fast_min_s);
    let tau_fast_s = clip(tau_fast_raw, tau_fast_floor, cfg.tau_fast_max_s.max(tau_fast_floor));

    let mut tau_slow_s = (tau_fast_s * cfg.slow_fast_ratio).max(tau_fast_s * 2.0);
    tau_slow_s = tau_slow_s.min(cfg.tau_slow_max_s);
    if tau_slow_s <= tau_fast_s {
        tau_slow_s = tau_fast_s * 2.0;
    }

    let (h1_raw, h2_raw) = profile
        .trade_intervals
        .as_ref()
        .map(|tr| (tr.p50_s, tr.p90_s))
        .unwrap_or((defaults.markout_h1_s, defaults.markout_h2_s));
    let markout_h1_s = clip(h1_raw, dt_sample_s, cfg.markout_max_s.max(dt_sample_s));
    let mut markout_h2_s = clip(h2_raw, markout_h1_s * 2.0, cfg.markout_max_s);
    if markout_h2_s <= markout_h1_s {
        markout_h2_s = markout_h1_s * 2.0;
    }

    CalibrationBundle {
        dt_sample_s,
        tau_fast_s,
        tau_slow_s,
        markout_h1_s,
        markout_h2_s,
        baseline_volatility: defaults.baseline_volatility,
        provenance: Provenance::MetaCalibrated,
        calibrated_at_ms: now_ms,
        activity: profile.summary(),
    }
}

/// The bundle used when observation timed out below its thresholds.
pub fn default_bundle(
    cfg: &WarmupConfig,
    profile: &MicrostructureProfile,
    now_ms: i64,
) -> CalibrationBundle {
    CalibrationBundle {
        provenance: Provenance::Default,
        calibrated_at_ms: now_ms,
        activity: profile.summary(),
        ..cfg.defaults.clone()
    }
}
