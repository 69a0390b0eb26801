use std::collections::BTreeMap;
use std::fmt;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// One binary market: two outcome tokens that settle at a known time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BinaryMarket {
    pub market_id: String,
    pub yes_asset_id: String,
    pub no_asset_id: String,
    /// Start of the quoting horizon; `time_factor` is 1.0 here.
    pub start_ts_ms: i64,
    pub resolve_ts_ms: i64,
}

impl BinaryMarket {
    pub fn horizon_ms(&self) -> i64 {
        (self.resolve_ts_ms - self.start_ts_ms).max(0)
    }

    pub fn remaining_ms(&self, now_ms: i64) -> i64 {
        (self.resolve_ts_ms - now_ms).max(0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum TradeSide {
    Buy,
    Sell,
}

impl TradeSide {
    pub fn sign(self) -> f64 {
        match self {
            Self::Buy => 1.0,
            Self::Sell => -1.0,
        }
    }

    pub fn flipped(self) -> Self {
        match self {
            Self::Buy => Self::Sell,
            Self::Sell => Self::Buy,
        }
    }
}

impl fmt::Display for TradeSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let value = match self {
            Self::Buy => "buy",
            Self::Sell => "sell",
        };
        f.write_str(value)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct PriceSample {
    pub ts_ms: i64,
    pub mid: f64,
    pub bid: f64,
    pub ask: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TradeEvent {
    pub ts_ms: i64,
    /// Aggressor side, in YES terms.
    pub side: TradeSide,
    pub size: f64,
    pub price: f64,
    #[serde(default)]
    pub seq: Option<u64>,
}

/// Best bid/ask as carried by one book message. Either side may be empty.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TopOfBook {
    pub ts_ms: i64,
    pub best_bid: Option<f64>,
    pub best_ask: Option<f64>,
    #[serde(default)]
    pub seq: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum FeedEvent {
    /// Full book snapshot.
    Book(TopOfBook),
    /// Incremental level change that moved (or confirmed) the top.
    PriceChange(TopOfBook),
    Trade(TradeEvent),
    TickSize { ts_ms: i64, tick_size: f64 },
}

impl FeedEvent {
    pub fn ts_ms(&self) -> i64 {
        match self {
            Self::Book(top) | Self::PriceChange(top) => top.ts_ms,
            Self::Trade(trade) => trade.ts_ms,
            Self::TickSize { ts_ms, .. } => *ts_ms,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl fmt::Display for OrderSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let value = match self {
            Self::Buy => "buy",
            Self::Sell => "sell",
        };
        f.write_str(value)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QuoteIntent {
    pub market_id: String,
    pub side: OrderSide,
    pub price: f64,
    pub size: f64,
    /// 0 is the innermost level.
    pub level: u32,
}

impl QuoteIntent {
    pub fn notional(&self) -> f64 {
        match self.side {
            OrderSide::Buy => self.price * self.size,
            OrderSide::Sell => (1.0 - self.price) * self.size,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum QuoteMode {
    Normal,
    Defensive,
    Withdrawn,
}

impl fmt::Display for QuoteMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let value = match self {
            Self::Normal => "normal",
            Self::Defensive => "defensive",
            Self::Withdrawn => "withdrawn",
        };
        f.write_str(value)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum VolRegime {
    Calm,
    Active,
    Stressed,
}

impl fmt::Display for VolRegime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let value = match self {
            Self::Calm => "calm",
            Self::Active => "active",
            Self::Stressed => "stressed",
        };
        f.write_str(value)
    }
}

/// Every intermediate of one quote computation, kept for logs and the control API.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QuoteMetrics {
    pub mid: f64,
    pub x_mid: f64,
    pub inventory: f64,
    pub q_max: f64,
    pub q_hat: f64,
    pub gamma: f64,
    pub lambda: f64,
    pub sigma: f64,
    pub skew: f64,
    pub reservation: f64,
    pub half_spread_bid: f64,
    pub half_spread_ask: f64,
    pub kappa_bid: f64,
    pub kappa_ask: f64,
    pub regime: VolRegime,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QuotePlan {
    pub market_id: String,
    pub mode: QuoteMode,
    pub bids: Vec<QuoteIntent>,
    pub asks: Vec<QuoteIntent>,
    pub metrics: Option<QuoteMetrics>,
    pub ts_ms: i64,
    /// Set when the plan is a held copy of an older computation.
    #[serde(default)]
    pub stale: bool,
}

impl QuotePlan {
    pub fn withdrawn(market_id: &str, ts_ms: i64) -> Self {
        Self {
            market_id: market_id.to_string(),
            mode: QuoteMode::Withdrawn,
            bids: Vec::new(),
            asks: Vec::new(),
            metrics: None,
            ts_ms,
            stale: false,
        }
    }

    pub fn best_bid(&self) -> Option<f64> {
        self.bids.iter().map(|q| q.price).reduce(f64::max)
    }

    pub fn best_ask(&self) -> Option<f64> {
        self.asks.iter().map(|q| q.price).reduce(f64::min)
    }

    pub fn is_empty(&self) -> bool {
        self.bids.is_empty() && self.asks.is_empty()
    }

    pub fn intents(&self) -> impl Iterator<Item = &QuoteIntent> {
        self.bids.iter().chain(self.asks.iter())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OrderAck {
    pub order_id: String,
    pub market_id: String,
    pub accepted: bool,
    pub ts_ms: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FillEvent {
    pub order_id: String,
    pub market_id: String,
    pub side: OrderSide,
    pub price: f64,
    pub size: f64,
    pub ts_ms: i64,
}

impl FillEvent {
    /// YES inventory change caused by this fill.
    pub fn signed_size(&self) -> f64 {
        match self.side {
            OrderSide::Buy => self.size,
            OrderSide::Sell => -self.size,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Provenance {
    Default,
    MetaCalibrated,
}

impl fmt::Display for Provenance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let value = match self {
            Self::Default => "default",
            Self::MetaCalibrated => "meta_calibrated",
        };
        f.write_str(value)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CalibrationBundle {
    pub dt_sample_s: f64,
    pub tau_fast_s: f64,
    pub tau_slow_s: f64,
    pub markout_h1_s: f64,
    pub markout_h2_s: f64,
    /// Robust scale of logit returns per sample.
    pub baseline_volatility: f64,
    pub provenance: Provenance,
    #[serde(default)]
    pub calibrated_at_ms: i64,
    /// Observation-phase summary (counts, medians) for the report.
    #[serde(default)]
    pub activity: BTreeMap<String, f64>,
}

impl Default for CalibrationBundle {
    fn default() -> Self {
        Self {
            dt_sample_s: 5.0,
            tau_fast_s: 30.0,
            tau_slow_s: 1_800.0,
            markout_h1_s: 10.0,
            markout_h2_s: 60.0,
            baseline_volatility: 0.10,
            provenance: Provenance::Default,
            calibrated_at_ms: 0,
            activity: BTreeMap::new(),
        }
    }
}

impl CalibrationBundle {
    pub fn validate(&self) -> Result<(), EngineError> {
        let fields = [
            ("dt_sample_s", self.dt_sample_s),
            ("tau_fast_s", self.tau_fast_s),
            ("tau_slow_s", self.tau_slow_s),
            ("markout_h1_s", self.markout_h1_s),
            ("markout_h2_s", self.markout_h2_s),
        ];
        for (name, value) in fields {
            if !value.is_finite() || value <= 0.0 {
                return Err(EngineError::Config(format!("{name} must be positive, got {value}")));
            }
        }
        if self.tau_fast_s >= self.tau_slow_s {
            return Err(EngineError::Config(format!(
                "tau_fast_s {} must be below tau_slow_s {}",
                self.tau_fast_s, self.tau_slow_s
            )));
        }
        if self.markout_h1_s >= self.markout_h2_s {
            return Err(EngineError::Config(format!(
                "markout_h1_s {} must be below markout_h2_s {}",
                self.markout_h1_s, self.markout_h2_s
            )));
        }
        if !self.baseline_volatility.is_finite() || self.baseline_volatility < 0.0 {
            return Err(EngineError::Config(format!(
                "baseline_volatility must be non-negative, got {}",
                self.baseline_volatility
            )));
        }
        Ok(())
    }

    pub fn is_degraded(&self) -> bool {
        self.provenance == Provenance::Default
    }
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum EngineError {
    #[error("feed gap: no book update for {silent_ms}ms")]
    FeedGap { silent_ms: i64 },
    #[error("insufficient calibration data: {price_changes} price changes, {trades} trades")]
    InsufficientCalibrationData { price_changes: usize, trades: usize },
    #[error("numeric degenerate: {0}")]
    NumericDegenerate(String),
    #[error("stale quote: {skipped} consecutive refreshes skipped")]
    StaleQuote { skipped: u32 },
    #[error("persistence failed: {0}")]
    Persistence(String),
    #[error("invalid config: {0}")]
    Config(String),
}

impl EngineError {
    /// Kinds the pipeline recovers from on the next cycle.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, Self::Persistence(_) | Self::Config(_))
    }
}

/// Outbound order path. Implementations own placement and cancellation; the
/// engine only hands over the plan it wants resting.
#[async_trait]
pub trait ExecutionPort: Send + Sync {
    async fn apply_plan(&self, plan: &QuotePlan) -> Result<Vec<OrderAck>>;
    async fn withdraw_all(&self, market_id: &str) -> Result<()>;
}

pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}
