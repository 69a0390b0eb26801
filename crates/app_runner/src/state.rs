use std::sync::Arc;

use calibration::{CalibrationPhase, CalibrationReport};
use core_types::{CalibrationBundle, QuotePlan};
use infra_clock::Clock;
use market_state::MarketSnapshot;
use metrics_exporter_prometheus::PrometheusHandle;
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::{mpsc, watch, RwLock as AsyncRwLock};

/// Immutable view the feed task publishes after every state write.
#[derive(Debug, Clone, Serialize)]
pub(crate) struct EngineSnapshot {
    pub(crate) seq: u64,
    pub(crate) market: MarketSnapshot,
    pub(crate) phase: CalibrationPhase,
    /// Smoothed toxicity multiplier, 1.0 until indicators run live.
    pub(crate) sigma: f64,
}

impl EngineSnapshot {
    pub(crate) fn empty(market: MarketSnapshot) -> Self {
        Self {
            seq: 0,
            market,
            phase: CalibrationPhase::Observation,
            sigma: 1.0,
        }
    }

    pub(crate) fn ready(&self) -> bool {
        self.phase == CalibrationPhase::Complete
    }
}

#[derive(Debug, Clone, Serialize)]
pub(crate) struct CalibrationView {
    pub(crate) phase: CalibrationPhase,
    pub(crate) bundle: CalibrationBundle,
    pub(crate) degraded: Option<String>,
    pub(crate) report: Option<CalibrationReport>,
    pub(crate) adaptations: u64,
    pub(crate) last_persist_ms: Option<i64>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub(crate) struct QuoteView {
    pub(crate) plan: Option<QuotePlan>,
    pub(crate) inventory: f64,
    pub(crate) q_max: f64,
    pub(crate) fills: u64,
    pub(crate) halted: Option<String>,
    pub(crate) skipped_ticks: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ControlCommand {
    Pause,
    Resume,
}

pub(crate) type SnapshotRx = watch::Receiver<Arc<EngineSnapshot>>;
pub(crate) type CalibrationRx = watch::Receiver<Arc<CalibrationView>>;

#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) market_id: String,
    pub(crate) paused: Arc<AsyncRwLock<bool>>,
    pub(crate) snapshot: SnapshotRx,
    pub(crate) calibration: CalibrationRx,
    pub(crate) quote: Arc<RwLock<QuoteView>>,
    pub(crate) control_tx: mpsc::Sender<ControlCommand>,
    pub(crate) prometheus: Option<PrometheusHandle>,
    /// Same clock the quote task measures silence with.
    pub(crate) clock: Arc<dyn Clock>,
}
