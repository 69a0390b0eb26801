use std::fmt;

use core_types::CalibrationBundle;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum VolatilityVerdict {
    Low,
    Moderate,
    High,
}

impl VolatilityVerdict {
    pub fn classify(baseline_volatility: f64) -> Self {
        if baseline_volatility < 0.05 {
            Self::Low
        } else if baseline_volatility > 0.20 {
            Self::High
        } else {
            Self::Moderate
        }
    }
}

impl fmt::Display for VolatilityVerdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let value = match self {
            Self::Low => "low volatility, spreads can tighten",
            Self::Moderate => "moderate volatility",
            Self::High => "high volatility, expect wide spreads",
        };
        f.write_str(value)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "flag", rename_all = "snake_case")]
pub enum SanityFlag {
    SigmaInRange,
    SigmaOutOfRange { sigma: f64 },
    SufficientSamples,
    InsufficientSamples { got: usize, need: usize },
    VolatilityStable,
    VolatilityRising,
    DefaultParameters,
}

impl SanityFlag {
    pub fn is_warning(&self) -> bool {
        !matches!(
            self,
            Self::SigmaInRange | Self::SufficientSamples | Self::VolatilityStable
        )
    }
}

impl fmt::Display for SanityFlag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SigmaInRange => write!(f, "sigma within 1.0-2.0"),
            Self::SigmaOutOfRange { sigma } => write!(f, "sigma outside typical range: {sigma:.2}"),
            Self::SufficientSamples => write!(f, "sufficient samples collected"),
            Self::InsufficientSamples { got, need } => {
                write!(f, "only {got}/{need} samples collected")
            }
            Self::VolatilityStable => {
                write!(f, "EMA fast <= EMA slow, volatility stable or falling")
            }
            Self::VolatilityRising => write!(f, "EMA fast > EMA slow, volatility rising"),
            Self::DefaultParameters => {
                write!(f, "observation timed out, running on default parameters")
            }
        }
    }
}

/// Inputs gathered over the Sampling phase.
#[derive(Debug, Clone, Default)]
pub struct SamplingSummary {
    pub samples_collected: usize,
    pub collection_s: f64,
    pub ema_fast: f64,
    pub ema_slow: f64,
    pub sigma: f64,
    pub price_range: Option<(f64, f64)>,
    pub avg_spread: Option<f64>,
    pub trade_rate_per_s: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CalibrationReport {
    pub market_id: String,
    pub samples_collected: usize,
    pub samples_required: usize,
    pub collection_s: f64,
    pub baseline_volatility: f64,
    pub ema_fast: f64,
    pub ema_slow: f64,
    pub sigma: f64,
    pub verdict: VolatilityVerdict,
    pub price_range: Option<(f64, f64)>,
    pub avg_spread: Option<f64>,
    pub trade_rate_per_s: f64,
    pub bundle: CalibrationBundle,
    pub flags: Vec<SanityFlag>,
}

impl CalibrationReport {
    pub fn build(
        market_id: &str,
        bundle: &CalibrationBundle,
        summary: &SamplingSummary,
        samples_required: usize,
    ) -> Self {
        let mut flags = Vec::new();
        if (1.0..=2.0).contains(&summary.sigma) {
            flags.push(SanityFlag::SigmaInRange);
        } else {
            flags.push(SanityFlag::SigmaOutOfRange {
                sigma: summary.sigma,
            });
        }
        if summary.samples_collected >= samples_required {
            flags.push(SanityFlag::SufficientSamples);
        } else {
            flags.push(SanityFlag::InsufficientSamples {
                got: summary.samples_collected,
                need: samples_required,
            });
        }
        if summary.ema_fast > summary.ema_slow {
            flags.push(SanityFlag::VolatilityRising);
        } else {
            flags.push(SanityFlag::VolatilityStable);
        }
        if bundle.is_degraded() {
            flags.push(SanityFlag::DefaultParameters);
        }

        Self {
            market_id: market_id.to_string(),
            samples_collected: summary.samples_collected,
            samples_required,
            collection_s: summary.collection_s,
            baseline_volatility: bundle.baseline_volatility,
            ema_fast: summary.ema_fast,
            ema_slow: summary.ema_slow,
            sigma: summary.sigma,
            verdict: VolatilityVerdict::classify(bundle.baseline_volatility),
            price_range: summary.price_range,
            avg_spread: summary.avg_spread,
            trade_rate_per_s: summary.trade_rate_per_s,
            bundle: bundle.clone(),
            flags,
        }
    }

    pub fn warnings(&self) -> impl Iterator<Item = &SanityFlag> {
        self.flags.iter().filter(|f| f.is_warning())
    }
}

impl fmt::Display for CalibrationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let secs = self.collection_s.max(0.0) as u64;
        writeln!(f, "calibration report for {}", self.market_id)?;
        writeln!(
            f,
            "  samples: {} / {} in {}m {}s",
            self.samples_collected,
            self.samples_required,
            secs / 60,
            secs % 60
        )?;
        writeln!(
            f,
            "  cadence {:.2}s  tau fast/slow {:.1}s / {:.1}s  markouts {:.1}s / {:.1}s  ({})",
            self.bundle.dt_sample_s,
            self.bundle.tau_fast_s,
            self.bundle.tau_slow_s,
            self.bundle.markout_h1_s,
            self.bundle.markout_h2_s,
            self.bundle.provenance
        )?;
        writeln!(f, "  base volatility (MAD): {:.4}", self.baseline_volatility)?;
        writeln!(f, "  EMA fast/slow: {:.4} / {:.4}", self.ema_fast, self.ema_slow)?;
        writeln!(f, "  sigma: {:.2}x  verdict: {}", self.sigma, self.verdict)?;
        match self.price_range {
            Some((lo, hi)) => writeln!(f, "  price range: {lo:.2} - {hi:.2}")?,
            None => writeln!(f, "  price range: n/a")?,
        }
        match self.avg_spread {
            Some(spread) => writeln!(f, "  average spread: {spread:.4}")?,
            None => writeln!(f, "  average spread: n/a")?,
        }
        writeln!(f, "  trade rate: {:.2}/s", self.trade_rate_per_s)?;
        for flag in &self.flags {
            let mark = if flag.is_warning() { "warn" } else { "ok" };
            writeln!(f, "  [{mark}] {flag}")?;
        }
        Ok(())
    }
}
