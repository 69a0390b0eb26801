use core_types::{EngineError, QuotePlan};
use serde::{Deserialize, Serialize};

use crate::QuoteEngine;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum GapAction {
    Defensive,
    Withdraw,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SupervisorConfig {
    pub feed_gap_timeout_ms: i64,
    pub gap_action: GapAction,
    pub defensive_spread_mult: f64,
    pub halt_after_degenerate: u32,
    pub stale_after_skips: u32,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            feed_gap_timeout_ms: 10_000,
            gap_action: GapAction::Defensive,
            defensive_spread_mult: 3.0,
            halt_after_degenerate: 5,
            stale_after_skips: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SupervisorAction {
    /// Fresh plan (normal or defensive) for the execution port.
    Publish(QuotePlan),
    /// Last good plan, flagged stale; what is resting stays as is.
    Hold(QuotePlan),
    Withdraw { reason: EngineError },
    /// Quoting stopped until [`QuoteSupervisor::resume`].
    Halt { reason: EngineError },
}

/// Turns each quote cycle's outcome into what the execution port should see.
#[derive(Debug, Clone)]
pub struct QuoteSupervisor {
    cfg: SupervisorConfig,
    last_good: Option<QuotePlan>,
    degenerate_streak: u32,
    skip_streak: u32,
    halted: Option<EngineError>,
}

impl QuoteSupervisor {
    pub fn new(cfg: SupervisorConfig) -> Self {
        Self {
            cfg,
            last_good: None,
            degenerate_streak: 0,
            skip_streak: 0,
            halted: None,
        }
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.cfg
    }

    pub fn last_good(&self) -> Option<&QuotePlan> {
        self.last_good.as_ref()
    }

    pub fn is_halted(&self) -> bool {
        self.halted.is_some()
    }

    pub fn halt_reason(&self) -> Option<&EngineError> {
        self.halted.as_ref()
    }

    /// Feed gap check. `silent_ms` is `None` before the first book update.
    pub fn feed_gap(&self, silent_ms: Option<i64>) -> Option<EngineError> {
        match silent_ms {
            None => Some(EngineError::FeedGap { silent_ms: 0 }),
            Some(ms) if ms > self.cfg.feed_gap_timeout_ms => {
                Some(EngineError::FeedGap { silent_ms: ms })
            }
            Some(_) => None,
        }
    }

    pub fn on_cycle(
        &mut self,
        engine: &QuoteEngine,
        tick: f64,
        now_ms: i64,
        silent_ms: Option<i64>,
        computed: Result<QuotePlan, EngineError>,
    ) -> SupervisorAction {
        if let Some(reason) = &self.halted {
            return SupervisorAction::Halt {
                reason: reason.clone(),
            };
        }
        self.skip_streak = 0;

        if let Some(gap) = self.feed_gap(silent_ms) {
            if silent_ms.is_some() {
                tracing::warn!(error = %gap, "feed gap, quoting defensively");
            }
            return self.degrade(engine, tick, now_ms, gap, self.cfg.gap_action);
        }

        match computed {
            Ok(plan) => {
                self.degenerate_streak = 0;
                self.last_good = Some(plan.clone());
                SupervisorAction::Publish(plan)
            }
            Err(err) => {
                self.degenerate_streak += 1;
                if self.degenerate_streak >= self.cfg.halt_after_degenerate.max(1) {
                    tracing::error!(
                        error = %err,
                        streak = self.degenerate_streak,
                        "repeated degenerate quote cycles, halting"
                    );
                    self.halted = Some(err.clone());
                    return SupervisorAction::Halt { reason: err };
                }
                tracing::warn!(
                    error = %err,
                    streak = self.degenerate_streak,
                    "holding last good quote"
                );
                match &self.last_good {
                    Some(last) => SupervisorAction::Hold(QuotePlan {
                        stale: true,
                        ..last.clone()
                    }),
                    None => SupervisorAction::Withdraw { reason: err },
                }
            }
        }
    }

    /// A refresh tick was dropped. Enough of them in a row make the resting
    /// quote stale and force the defensive plan.
    pub fn on_skip(
        &mut self,
        engine: &QuoteEngine,
        tick: f64,
        now_ms: i64,
    ) -> Option<SupervisorAction> {
        if self.halted.is_some() {
            return None;
        }
        self.skip_streak += 1;
        if self.skip_streak < self.cfg.stale_after_skips.max(1) {
            return None;
        }
        let reason = EngineError::StaleQuote {
            skipped: self.skip_streak,
        };
        tracing::warn!(error = %reason, "quote went stale");
        Some(self.degrade(engine, tick, now_ms, reason, GapAction::Defensive))
    }

    fn degrade(
        &self,
        engine: &QuoteEngine,
        tick: f64,
        now_ms: i64,
        reason: EngineError,
        action: GapAction,
    ) -> SupervisorAction {
        match (action, &self.last_good) {
            (GapAction::Defensive, Some(last)) => SupervisorAction::Publish(engine.defensive_plan(
                last,
                tick,
                self.cfg.defensive_spread_mult,
                now_ms,
            )),
            _ => SupervisorAction::Withdraw { reason },
        }
    }

    /// Clears a halt after operator action.
    pub fn resume(&mut self) {
        if let Some(reason) = self.halted.take() {
            tracing::info!(error = %reason, "quote supervisor resumed");
        }
        self.degenerate_streak = 0;
        self.skip_streak = 0;
    }
}
