use std::collections::VecDeque;

use core_types::{FeedEvent, PriceSample, TopOfBook, TradeEvent, TradeSide};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackerConfig {
    pub price_history_cap: usize,
    pub trade_history_cap: usize,
    pub trade_rate_window_ms: i64,
    /// Trailing window for the crowd-size proxy.
    pub crowd_window_ms: i64,
    pub default_tick_size: f64,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            price_history_cap: 5_000,
            trade_history_cap: 5_000,
            trade_rate_window_ms: 60_000,
            crowd_window_ms: 6 * 3_600_000,
            default_tick_size: 0.01,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied { mid_changed: bool },
    Duplicate,
    OutOfOrder,
    Rejected,
}

#[derive(Debug, Default, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct TrackerStats {
    pub accepted: u64,
    pub duplicates: u64,
    pub out_of_order: u64,
    pub rejected: u64,
}

/// Read-only view handed to the quote task.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MarketSnapshot {
    pub ts_ms: i64,
    pub best_bid: Option<f64>,
    pub best_ask: Option<f64>,
    pub mid: Option<f64>,
    pub tick_size: f64,
    /// Exchange timestamp of the last applied book message.
    pub last_book_ts_ms: Option<i64>,
    /// Local receive time of the last applied book message.
    pub last_book_recv_ms: Option<i64>,
    pub trade_rate_per_s: f64,
    /// Buy-aggressor rate; these trades lift asks.
    pub buy_rate_per_s: f64,
    /// Sell-aggressor rate; these trades hit bids.
    pub sell_rate_per_s: f64,
    pub crowd_size: f64,
    pub price_samples: usize,
    pub trades: usize,
}

/// Single-writer view of one market's book top and recent activity.
#[derive(Debug, Clone)]
pub struct MarketStateTracker {
    cfg: TrackerConfig,
    best_bid: Option<f64>,
    best_ask: Option<f64>,
    mid: Option<f64>,
    tick_size: f64,
    last_book_ts_ms: Option<i64>,
    last_book_recv_ms: Option<i64>,
    last_book_seq: Option<u64>,
    last_trade_seq: Option<u64>,
    samples: VecDeque<PriceSample>,
    trades: VecDeque<TradeEvent>,
    stats: TrackerStats,
}

impl MarketStateTracker {
    pub fn new(cfg: TrackerConfig) -> Self {
        let tick_size = cfg.default_tick_size;
        Self {
            samples: VecDeque::with_capacity(cfg.price_history_cap.min(8_192)),
            trades: VecDeque::with_capacity(cfg.trade_history_cap.min(8_192)),
            cfg,
            best_bid: None,
            best_ask: None,
            mid: None,
            tick_size,
            last_book_ts_ms: None,
            last_book_recv_ms: None,
            last_book_seq: None,
            last_trade_seq: None,
            stats: TrackerStats::default(),
        }
    }

    /// Applies an event whose receive time is its own timestamp (replay, tests).
    pub fn apply(&mut self, event: &FeedEvent) -> ApplyOutcome {
        self.apply_at(event, event.ts_ms())
    }

    /// Applies an event received locally at `recv_ms`. Liveness is tracked
    /// on the local clock; history keeps the exchange timestamps.
    pub fn apply_at(&mut self, event: &FeedEvent, recv_ms: i64) -> ApplyOutcome {
        let outcome = match event {
            FeedEvent::Book(top) | FeedEvent::PriceChange(top) => self.apply_top(top, recv_ms),
            FeedEvent::Trade(trade) => self.apply_trade(trade),
            FeedEvent::TickSize { tick_size, .. } => {
                if tick_size.is_finite() && *tick_size > 0.0 && *tick_size < 0.5 {
                    self.tick_size = *tick_size;
                    ApplyOutcome::Applied { mid_changed: false }
                } else {
                    ApplyOutcome::Rejected
                }
            }
        };
        match outcome {
            ApplyOutcome::Applied { .. } => self.stats.accepted += 1,
            ApplyOutcome::Duplicate => self.stats.duplicates += 1,
            ApplyOutcome::OutOfOrder => self.stats.out_of_order += 1,
            ApplyOutcome::Rejected => self.stats.rejected += 1,
        }
        outcome
    }

    fn apply_top(&mut self, top: &TopOfBook, recv_ms: i64) -> ApplyOutcome {
        let valid = |p: Option<f64>| p.map_or(true, |v| v.is_finite() && (0.0..=1.0).contains(&v));
        if !valid(top.best_bid) || !valid(top.best_ask) {
            return ApplyOutcome::Rejected;
        }
        if let (Some(bid), Some(ask)) = (top.best_bid, top.best_ask) {
            if bid >= ask {
                return ApplyOutcome::Rejected;
            }
        }
        if let (Some(seq), Some(last)) = (top.seq, self.last_book_seq) {
            if seq == last {
                return ApplyOutcome::Duplicate;
            }
            if seq < last {
                return ApplyOutcome::OutOfOrder;
            }
        }
        if let Some(last_ts) = self.last_book_ts_ms {
            if top.ts_ms < last_ts {
                return ApplyOutcome::OutOfOrder;
            }
            if top.seq.is_none()
                && top.ts_ms == last_ts
                && top.best_bid == self.best_bid
                && top.best_ask == self.best_ask
            {
                return ApplyOutcome::Duplicate;
            }
        }

        self.best_bid = top.best_bid;
        self.best_ask = top.best_ask;
        self.last_book_ts_ms = Some(top.ts_ms);
        self.last_book_recv_ms = Some(recv_ms);
        if top.seq.is_some() {
            self.last_book_seq = top.seq;
        }

        let mid_changed = self.update_mid(top.ts_ms);
        ApplyOutcome::Applied { mid_changed }
    }

    /// Mid moves only on a proper two-sided book strictly inside (0,1).
    fn update_mid(&mut self, ts_ms: i64) -> bool {
        let (Some(bid), Some(ask)) = (self.best_bid, self.best_ask) else {
            return false;
        };
        if !(0.0 < bid && bid < ask && ask < 1.0) {
            return false;
        }
        let mid = 0.5 * (bid + ask);
        if self.mid == Some(mid) {
            return false;
        }
        self.mid = Some(mid);
        push_capped(
            &mut self.samples,
            PriceSample {
                ts_ms,
                mid,
                bid,
                ask,
            },
            self.cfg.price_history_cap,
        );
        true
    }

    fn apply_trade(&mut self, trade: &TradeEvent) -> ApplyOutcome {
        if !trade.price.is_finite()
            || !(0.0..=1.0).contains(&trade.price)
            || !trade.size.is_finite()
            || trade.size <= 0.0
        {
            return ApplyOutcome::Rejected;
        }
        if let (Some(seq), Some(last)) = (trade.seq, self.last_trade_seq) {
            if seq == last {
                return ApplyOutcome::Duplicate;
            }
            if seq < last {
                return ApplyOutcome::OutOfOrder;
            }
        }
        if let Some(newest) = self.trades.back() {
            if trade.ts_ms < newest.ts_ms {
                return ApplyOutcome::OutOfOrder;
            }
            if trade.seq.is_none()
                && self
                    .trades
                    .iter()
                    .rev()
                    .take_while(|t| t.ts_ms == trade.ts_ms)
                    .any(|t| same_print(t, trade))
            {
                return ApplyOutcome::Duplicate;
            }
        }
        if trade.seq.is_some() {
            self.last_trade_seq = trade.seq;
        }
        push_capped(&mut self.trades, trade.clone(), self.cfg.trade_history_cap);
        ApplyOutcome::Applied { mid_changed: false }
    }

    pub fn mid(&self) -> Option<f64> {
        self.mid
    }

    pub fn best_bid(&self) -> Option<f64> {
        self.best_bid
    }

    pub fn best_ask(&self) -> Option<f64> {
        self.best_ask
    }

    pub fn tick_size(&self) -> f64 {
        self.tick_size
    }

    pub fn last_book_ts_ms(&self) -> Option<i64> {
        self.last_book_ts_ms
    }

    pub fn last_book_recv_ms(&self) -> Option<i64> {
        self.last_book_recv_ms
    }

    pub fn stats(&self) -> TrackerStats {
        self.stats
    }

    pub fn price_samples(&self) -> &VecDeque<PriceSample> {
        &self.samples
    }

    pub fn trades(&self) -> &VecDeque<TradeEvent> {
        &self.trades
    }

    pub fn price_change_count_since(&self, since_ms: i64) -> usize {
        self.samples.iter().rev().take_while(|s| s.ts_ms >= since_ms).count()
    }

    pub fn trade_count_since(&self, since_ms: i64) -> usize {
        self.trades.iter().rev().take_while(|t| t.ts_ms >= since_ms).count()
    }

    /// Local milliseconds since the last book message arrived, `None` before
    /// the first one.
    pub fn silent_ms(&self, now_ms: i64) -> Option<i64> {
        self.last_book_recv_ms.map(|ts| (now_ms - ts).max(0))
    }

    pub fn trade_rate_per_s(&self, now_ms: i64) -> f64 {
        self.side_rate(now_ms, None)
    }

    fn side_rate(&self, now_ms: i64, side: Option<TradeSide>) -> f64 {
        let window_ms = self.cfg.trade_rate_window_ms.max(1);
        let cutoff = now_ms - window_ms;
        let count = self
            .trades
            .iter()
            .rev()
            .take_while(|t| t.ts_ms >= cutoff)
            .filter(|t| side.map_or(true, |s| t.side == s))
            .count();
        count as f64 / (window_ms as f64 / 1_000.0)
    }

    /// Crowd-size proxy: sqrt of the trade count over the crowd window.
    pub fn crowd_size(&self, now_ms: i64) -> f64 {
        let cutoff = now_ms - self.cfg.crowd_window_ms;
        (self.trade_count_since(cutoff) as f64).sqrt()
    }

    pub fn snapshot(&self, now_ms: i64) -> MarketSnapshot {
        MarketSnapshot {
            ts_ms: now_ms,
            best_bid: self.best_bid,
            best_ask: self.best_ask,
            mid: self.mid,
            tick_size: self.tick_size,
            last_book_ts_ms: self.last_book_ts_ms,
            last_book_recv_ms: self.last_book_recv_ms,
            trade_rate_per_s: self.trade_rate_per_s(now_ms),
            buy_rate_per_s: self.side_rate(now_ms, Some(TradeSide::Buy)),
            sell_rate_per_s: self.side_rate(now_ms, Some(TradeSide::Sell)),
            crowd_size: self.crowd_size(now_ms),
            price_samples: self.samples.len(),
            trades: self.trades.len(),
        }
    }
}

fn same_print(a: &TradeEvent, b: &TradeEvent) -> bool {
    a.side == b.side && a.price == b.price && a.size == b.size
}

fn push_capped<T>(buf: &mut VecDeque<T>, value: T, cap: usize) {
    if cap == 0 {
        return;
    }
    while buf.len() >= cap {
        buf.pop_front();
    }
    buf.push_back(value);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn book(ts_ms: i64, bid: f64, ask: f64) -> FeedEvent {
        FeedEvent::PriceChange(TopOfBook {
            ts_ms,
            best_bid: Some(bid),
            best_ask: Some(ask),
            seq: None,
        })
    }

    fn trade(ts_ms: i64, side: TradeSide, price: f64) -> FeedEvent {
        FeedEvent::Trade(TradeEvent {
            ts_ms,
            side,
            size: 10.0,
            price,
            seq: None,
        })
    }

    #[test]
    fn mid_tracks_valid_two_sided_book() {
        let mut t = MarketStateTracker::new(TrackerConfig::default());
        assert_eq!(
            t.apply(&book(1_000, 0.40, 0.44)),
            ApplyOutcome::Applied { mid_changed: true }
        );
        assert!((t.mid().unwrap_or_default() - 0.42).abs() < 1e-12);

        // One-sided book keeps the previous mid but refreshes liveness.
        let one_sided = FeedEvent::Book(TopOfBook {
            ts_ms: 2_000,
            best_bid: Some(0.41),
            best_ask: None,
            seq: None,
        });
        assert_eq!(t.apply(&one_sided), ApplyOutcome::Applied { mid_changed: false });
        assert!((t.mid().unwrap_or_default() - 0.42).abs() < 1e-12);
        assert_eq!(t.last_book_ts_ms(), Some(2_000));
        assert_eq!(t.price_samples().len(), 1);

        assert_eq!(t.apply(&book(3_000, 0.45, 0.44)), ApplyOutcome::Rejected);
    }

    #[test]
    fn duplicates_and_out_of_order_do_not_touch_history() {
        let mut t = MarketStateTracker::new(TrackerConfig::default());
        t.apply(&book(1_000, 0.40, 0.44));
        t.apply(&book(2_000, 0.41, 0.45));
        assert_eq!(t.apply(&book(2_000, 0.41, 0.45)), ApplyOutcome::Duplicate);
        assert_eq!(t.apply(&book(1_500, 0.30, 0.35)), ApplyOutcome::OutOfOrder);
        assert!((t.mid().unwrap_or_default() - 0.43).abs() < 1e-12);

        let samples: Vec<i64> = t.price_samples().iter().map(|s| s.ts_ms).collect();
        assert_eq!(samples, vec![1_000, 2_000]);

        t.apply(&trade(5_000, TradeSide::Buy, 0.43));
        assert_eq!(t.apply(&trade(5_000, TradeSide::Buy, 0.43)), ApplyOutcome::Duplicate);
        assert_eq!(t.apply(&trade(4_000, TradeSide::Sell, 0.42)), ApplyOutcome::OutOfOrder);
        assert_eq!(
            t.apply(&trade(5_000, TradeSide::Sell, 0.43)),
            ApplyOutcome::Applied { mid_changed: false }
        );

        let stats = t.stats();
        assert_eq!(stats.duplicates, 2);
        assert_eq!(stats.out_of_order, 2);
        assert_eq!(t.trades().len(), 2);
    }

    #[test]
    fn sequence_ids_take_precedence() {
        let mut t = MarketStateTracker::new(TrackerConfig::default());
        let seq_book = |seq, ts_ms, bid| {
            FeedEvent::Book(TopOfBook {
                ts_ms,
                best_bid: Some(bid),
                best_ask: Some(0.6),
                seq: Some(seq),
            })
        };
        t.apply(&seq_book(10, 1_000, 0.50));
        assert_eq!(t.apply(&seq_book(10, 1_100, 0.52)), ApplyOutcome::Duplicate);
        assert_eq!(t.apply(&seq_book(9, 1_200, 0.52)), ApplyOutcome::OutOfOrder);
        assert_eq!(
            t.apply(&seq_book(11, 1_000, 0.52)),
            ApplyOutcome::Applied { mid_changed: true }
        );
    }

    #[test]
    fn ring_buffers_evict_oldest() {
        let mut t = MarketStateTracker::new(TrackerConfig {
            price_history_cap: 3,
            ..TrackerConfig::default()
        });
        for i in 0..5 {
            t.apply(&book(i * 1_000, 0.40 + i as f64 * 0.01, 0.50 + i as f64 * 0.01));
        }
        let first = t.price_samples().front().map(|s| s.ts_ms);
        assert_eq!(t.price_samples().len(), 3);
        assert_eq!(first, Some(2_000));
    }

    #[test]
    fn trade_sequence_gaps_are_out_of_order_not_duplicates() {
        let mut t = MarketStateTracker::new(TrackerConfig::default());
        let seq_trade = |seq, ts_ms| {
            FeedEvent::Trade(TradeEvent {
                ts_ms,
                side: TradeSide::Buy,
                size: 5.0,
                price: 0.5,
                seq: Some(seq),
            })
        };
        t.apply(&seq_trade(20, 1_000));
        assert_eq!(t.apply(&seq_trade(20, 1_000)), ApplyOutcome::Duplicate);
        assert_eq!(t.apply(&seq_trade(18, 1_100)), ApplyOutcome::OutOfOrder);
        let stats = t.stats();
        assert_eq!(stats.duplicates, 1);
        assert_eq!(stats.out_of_order, 1);
        assert_eq!(t.trades().len(), 1);
    }

    #[test]
    fn silence_is_measured_on_the_receive_clock() {
        let mut t = MarketStateTracker::new(TrackerConfig::default());
        // Exchange stamps run a minute behind the local clock.
        t.apply_at(&book(40_000, 0.40, 0.44), 100_000);
        assert_eq!(t.last_book_ts_ms(), Some(40_000));
        assert_eq!(t.silent_ms(100_500), Some(500));

        t.apply_at(&book(41_000, 0.41, 0.45), 101_000);
        let snap = t.snapshot(101_200);
        assert_eq!(snap.last_book_ts_ms, Some(41_000));
        assert_eq!(snap.last_book_recv_ms, Some(101_000));
        assert_eq!(t.price_samples().back().map(|s| s.ts_ms), Some(41_000));

        // A stale replayed frame does not refresh liveness.
        assert_eq!(t.apply_at(&book(30_000, 0.3, 0.4), 102_000), ApplyOutcome::OutOfOrder);
        assert_eq!(t.silent_ms(112_000), Some(11_000));
    }

    #[test]
    fn rates_and_crowd_proxy() {
        let mut t = MarketStateTracker::new(TrackerConfig::default());
        for i in 0..30 {
            let side = if i % 3 == 0 { TradeSide::Sell } else { TradeSide::Buy };
            t.apply(&trade(100_000 + i * 1_000, side, 0.5));
        }
        let now = 130_000;
        let snap = t.snapshot(now);
        assert!((snap.trade_rate_per_s - 0.5).abs() < 1e-12);
        assert!((snap.buy_rate_per_s - 20.0 / 60.0).abs() < 1e-12);
        assert!((snap.sell_rate_per_s - 10.0 / 60.0).abs() < 1e-12);
        assert!((snap.crowd_size - 30f64.sqrt()).abs() < 1e-12);
        assert_eq!(t.silent_ms(now), None);
    }
}
