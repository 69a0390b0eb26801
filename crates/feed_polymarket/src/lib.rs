//! Decoder for Polymarket market-channel messages.
//!
//! Network transport lives outside this crate; callers hand over raw text
//! frames (one JSON document per frame) and receive [`FeedEvent`]s expressed
//! in YES-outcome terms. NO-outcome books and trades are mirrored (`1 - p`).

use std::collections::{BTreeMap, HashMap};

use core_types::{BinaryMarket, FeedEvent, TopOfBook, TradeEvent, TradeSide};
use serde::Deserialize;

const PRICE_SCALE: f64 = 1_000_000.0;

fn validate_price(price: f64) -> bool {
    price.is_finite() && (0.0..=1.0).contains(&price)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Outcome {
    Yes,
    No,
}

/// Aggregated size per price level for one asset.
#[derive(Debug, Default, Clone)]
struct LevelBook {
    bids: BTreeMap<u64, f64>,
    asks: BTreeMap<u64, f64>,
}

impl LevelBook {
    fn reset(&mut self, bids: &[WsLevel], asks: &[WsLevel]) {
        self.bids.clear();
        self.asks.clear();
        for level in bids {
            if let (Some(price), Some(size)) = (level.price, level.size) {
                Self::set(&mut self.bids, price, size);
            }
        }
        for level in asks {
            if let (Some(price), Some(size)) = (level.price, level.size) {
                Self::set(&mut self.asks, price, size);
            }
        }
    }

    fn apply(&mut self, side: BookSide, price: f64, size: f64) {
        match side {
            BookSide::Bid => Self::set(&mut self.bids, price, size),
            BookSide::Ask => Self::set(&mut self.asks, price, size),
        }
    }

    fn set(levels: &mut BTreeMap<u64, f64>, price: f64, size: f64) {
        if !validate_price(price) || !size.is_finite() {
            return;
        }
        let key = (price * PRICE_SCALE).round() as u64;
        if size <= 0.0 {
            levels.remove(&key);
        } else {
            levels.insert(key, size);
        }
    }

    fn best_bid(&self) -> Option<f64> {
        self.bids.keys().next_back().map(|k| *k as f64 / PRICE_SCALE)
    }

    fn best_ask(&self) -> Option<f64> {
        self.asks.keys().next().map(|k| *k as f64 / PRICE_SCALE)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BookSide {
    Bid,
    Ask,
}

fn parse_side(raw: Option<&str>) -> Option<BookSide> {
    match raw?.trim().to_ascii_lowercase().as_str() {
        "buy" | "bid" => Some(BookSide::Bid),
        "sell" | "ask" => Some(BookSide::Ask),
        _ => None,
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct DecoderStats {
    pub frames: u64,
    pub malformed: u64,
    pub ignored: u64,
}

/// Stateful decoder for one binary market. Keeps a level book per outcome so
/// that incremental `changes` lists without explicit best prices still yield
/// a correct top of book.
#[derive(Debug)]
pub struct MarketDecoder {
    yes_asset: String,
    no_asset: String,
    books: HashMap<Outcome, LevelBook>,
    stats: DecoderStats,
}

impl MarketDecoder {
    pub fn new(market: &BinaryMarket) -> Self {
        Self {
            yes_asset: market.yes_asset_id.clone(),
            no_asset: market.no_asset_id.clone(),
            books: HashMap::new(),
            stats: DecoderStats::default(),
        }
    }

    pub fn stats(&self) -> DecoderStats {
        self.stats
    }

    /// Decodes one frame. `recv_ts_ms` stands in for messages without a timestamp.
    pub fn decode(&mut self, raw: &str, recv_ts_ms: i64) -> Vec<FeedEvent> {
        self.stats.frames += 1;
        let raw = raw.trim();
        if raw.is_empty() || raw.eq_ignore_ascii_case("pong") {
            return Vec::new();
        }
        let envelope = match serde_json::from_str::<WsEnvelope>(raw) {
            Ok(envelope) => envelope,
            Err(err) => {
                self.stats.malformed += 1;
                tracing::debug!(%err, "dropping malformed market frame");
                return Vec::new();
            }
        };

        let mut out = Vec::new();
        for event in envelope.into_events() {
            let before = out.len();
            self.decode_event(&event, recv_ts_ms, &mut out);
            if out.len() == before {
                self.stats.ignored += 1;
            }
        }
        out
    }

    fn outcome(&self, asset_id: Option<&str>) -> Option<Outcome> {
        let asset_id = asset_id?;
        if asset_id == self.yes_asset {
            Some(Outcome::Yes)
        } else if asset_id == self.no_asset {
            Some(Outcome::No)
        } else {
            None
        }
    }

    fn decode_event(&mut self, event: &WsEvent, recv_ts_ms: i64, out: &mut Vec<FeedEvent>) {
        let ts_ms = event.timestamp.unwrap_or(recv_ts_ms);
        match event.event_type() {
            "book" => self.decode_book(event, ts_ms, out),
            "price_change" => self.decode_price_change(event, ts_ms, out),
            "last_trade_price" | "trade" => self.decode_trade(event, ts_ms, out),
            "tick_size_change" => self.decode_tick_size(event, ts_ms, out),
            _ => {}
        }
    }

    fn decode_book(&mut self, event: &WsEvent, ts_ms: i64, out: &mut Vec<FeedEvent>) {
        let Some(outcome) = self.outcome(event.asset_id.as_deref()) else {
            return;
        };
        let bids = event.bids.as_deref().or(event.buys.as_deref()).unwrap_or(&[]);
        let asks = event.asks.as_deref().or(event.sells.as_deref()).unwrap_or(&[]);
        let book = self.books.entry(outcome).or_default();
        book.reset(bids, asks);
        let top = yes_top(outcome, book.best_bid(), book.best_ask(), ts_ms, event.seq);
        out.push(FeedEvent::Book(top));
    }

    fn decode_price_change(&mut self, event: &WsEvent, ts_ms: i64, out: &mut Vec<FeedEvent>) {
        // Legacy frames: one asset with a `changes` list.
        if let Some(outcome) = self.outcome(event.asset_id.as_deref()) {
            if !event.changes.is_empty() {
                let book = self.books.entry(outcome).or_default();
                for change in &event.changes {
                    let side = parse_side(change.side.as_deref());
                    if let (Some(side), Some(price)) = (side, change.price) {
                        book.apply(side, price, change.size.unwrap_or(0.0));
                    }
                }
                let best_bid = event.best_bid.or_else(|| book.best_bid());
                let best_ask = event.best_ask.or_else(|| book.best_ask());
                out.push(FeedEvent::PriceChange(yes_top(
                    outcome, best_bid, best_ask, ts_ms, event.seq,
                )));
            }
        }

        // Current frames: `price_changes` entries, each carrying its own asset and top.
        let mut touched: Vec<(Outcome, Option<f64>, Option<f64>)> = Vec::new();
        for change in &event.price_changes {
            let Some(outcome) = self.outcome(change.asset_id.as_deref()) else {
                continue;
            };
            let book = self.books.entry(outcome).or_default();
            if let (Some(side), Some(price)) = (parse_side(change.side.as_deref()), change.price) {
                book.apply(side, price, change.size.unwrap_or(0.0));
            }
            let best_bid = change.best_bid.or_else(|| book.best_bid());
            let best_ask = change.best_ask.or_else(|| book.best_ask());
            match touched.iter_mut().find(|(o, _, _)| *o == outcome) {
                Some(entry) => {
                    entry.1 = best_bid;
                    entry.2 = best_ask;
                }
                None => touched.push((outcome, best_bid, best_ask)),
            }
        }
        for (outcome, best_bid, best_ask) in touched {
            out.push(FeedEvent::PriceChange(yes_top(
                outcome, best_bid, best_ask, ts_ms, event.seq,
            )));
        }
    }

    fn decode_trade(&self, event: &WsEvent, ts_ms: i64, out: &mut Vec<FeedEvent>) {
        let Some(outcome) = self.outcome(event.asset_id.as_deref()) else {
            return;
        };
        let (Some(price), Some(size)) = (event.price, event.size) else {
            return;
        };
        if !validate_price(price) || !size.is_finite() || size <= 0.0 {
            return;
        }
        let side = match parse_side(event.side.as_deref()) {
            Some(BookSide::Bid) => TradeSide::Buy,
            Some(BookSide::Ask) => TradeSide::Sell,
            None => return,
        };
        let (price, side) = match outcome {
            Outcome::Yes => (price, side),
            Outcome::No => (1.0 - price, side.flipped()),
        };
        out.push(FeedEvent::Trade(TradeEvent {
            ts_ms,
            side,
            size,
            price,
            seq: event.seq,
        }));
    }

    fn decode_tick_size(&self, event: &WsEvent, ts_ms: i64, out: &mut Vec<FeedEvent>) {
        if self.outcome(event.asset_id.as_deref()).is_none() {
            return;
        }
        let Some(tick_size) = event.new_tick_size else {
            return;
        };
        if tick_size.is_finite() && tick_size > 0.0 && tick_size < 0.5 {
            out.push(FeedEvent::TickSize { ts_ms, tick_size });
        }
    }
}

fn yes_top(
    outcome: Outcome,
    best_bid: Option<f64>,
    best_ask: Option<f64>,
    ts_ms: i64,
    seq: Option<u64>,
) -> TopOfBook {
    let best_bid = best_bid.filter(|p| validate_price(*p));
    let best_ask = best_ask.filter(|p| validate_price(*p));
    let (best_bid, best_ask) = match outcome {
        Outcome::Yes => (best_bid, best_ask),
        Outcome::No => (best_ask.map(|p| 1.0 - p), best_bid.map(|p| 1.0 - p)),
    };
    TopOfBook {
        ts_ms,
        best_bid,
        best_ask,
        seq,
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum WsEnvelope {
    One(Box<WsEvent>),
    Many(Vec<WsEvent>),
}

impl WsEnvelope {
    fn into_events(self) -> Vec<WsEvent> {
        match self {
            Self::One(v) => vec![*v],
            Self::Many(v) => v,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
struct WsEvent {
    #[serde(default, alias = "type")]
    kind: Option<String>,
    #[serde(default)]
    event_type: Option<String>,
    #[serde(default, alias = "assetId")]
    asset_id: Option<String>,
    #[serde(default, deserialize_with = "de_opt_f64")]
    best_bid: Option<f64>,
    #[serde(default, deserialize_with = "de_opt_f64")]
    best_ask: Option<f64>,
    #[serde(default, deserialize_with = "de_opt_i64")]
    timestamp: Option<i64>,
    #[serde(default, alias = "sequence", deserialize_with = "de_opt_u64")]
    seq: Option<u64>,
    #[serde(default)]
    side: Option<String>,
    #[serde(default, deserialize_with = "de_opt_f64")]
    price: Option<f64>,
    #[serde(default, deserialize_with = "de_opt_f64")]
    size: Option<f64>,
    #[serde(default, deserialize_with = "de_opt_f64")]
    new_tick_size: Option<f64>,
    #[serde(default)]
    bids: Option<Vec<WsLevel>>,
    #[serde(default)]
    asks: Option<Vec<WsLevel>>,
    #[serde(default)]
    buys: Option<Vec<WsLevel>>,
    #[serde(default)]
    sells: Option<Vec<WsLevel>>,
    #[serde(default)]
    changes: Vec<WsChange>,
    #[serde(default)]
    price_changes: Vec<WsChange>,
}

impl WsEvent {
    fn event_type(&self) -> &str {
        self.event_type
            .as_deref()
            .or(self.kind.as_deref())
            .unwrap_or_default()
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
struct WsLevel {
    #[serde(default, deserialize_with = "de_opt_f64")]
    price: Option<f64>,
    #[serde(default, deserialize_with = "de_opt_f64")]
    size: Option<f64>,
}

#[derive(Debug, Deserialize, Clone, Default)]
struct WsChange {
    #[serde(default, alias = "assetId")]
    asset_id: Option<String>,
    #[serde(default)]
    side: Option<String>,
    #[serde(default, deserialize_with = "de_opt_f64")]
    price: Option<f64>,
    #[serde(default, deserialize_with = "de_opt_f64")]
    size: Option<f64>,
    #[serde(default, deserialize_with = "de_opt_f64")]
    best_bid: Option<f64>,
    #[serde(default, deserialize_with = "de_opt_f64")]
    best_ask: Option<f64>,
}

fn de_opt_f64<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum NumOrStr {
        Num(f64),
        Str(String),
    }
    let parsed = Option::<NumOrStr>::deserialize(deserializer)?;
    Ok(match parsed {
        Some(NumOrStr::Num(v)) => Some(v),
        Some(NumOrStr::Str(s)) => s.trim().parse::<f64>().ok(),
        None => None,
    })
}

fn de_opt_i64<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum NumOrStr {
        Num(i64),
        Str(String),
    }
    let parsed = Option::<NumOrStr>::deserialize(deserializer)?;
    Ok(match parsed {
        Some(NumOrStr::Num(v)) => Some(v),
        Some(NumOrStr::Str(s)) => s.trim().parse::<i64>().ok(),
        None => None,
    })
}

fn de_opt_u64<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(de_opt_i64(deserializer)?.and_then(|v| u64::try_from(v).ok()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decoder() -> MarketDecoder {
        MarketDecoder::new(&BinaryMarket {
            market_id: "m1".to_string(),
            yes_asset_id: "yes_token".to_string(),
            no_asset_id: "no_token".to_string(),
            start_ts_ms: 0,
            resolve_ts_ms: 1_000_000,
        })
    }

    fn top(event: &FeedEvent) -> &TopOfBook {
        match event {
            FeedEvent::Book(top) | FeedEvent::PriceChange(top) => top,
            other => panic!("expected a book event, got {other:?}"),
        }
    }

    #[test]
    fn book_snapshot_uses_best_levels_regardless_of_order() {
        let mut dec = decoder();
        let events = dec.decode(
            r#"{"event_type":"book","asset_id":"yes_token","timestamp":"1700000000000",
                "bids":[{"price":"0.40","size":"10"},{"price":"0.44","size":"3"}],
                "asks":[{"price":"0.49","size":"8"},{"price":"0.46","size":"1"}]}"#,
            0,
        );
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], FeedEvent::Book(_)));
        let t = top(&events[0]);
        assert_eq!(t.ts_ms, 1_700_000_000_000);
        assert_eq!(t.best_bid, Some(0.44));
        assert_eq!(t.best_ask, Some(0.46));
    }

    #[test]
    fn legacy_changes_update_level_book() {
        let mut dec = decoder();
        dec.decode(
            r#"{"event_type":"book","asset_id":"yes_token","timestamp":1,
                "bids":[{"price":"0.44","size":"3"}],"asks":[{"price":"0.46","size":"1"}]}"#,
            0,
        );
        let events = dec.decode(
            r#"{"event_type":"price_change","asset_id":"yes_token","timestamp":2,
                "changes":[{"side":"BUY","price":"0.44","size":"0"},{"side":"SELL","price":"0.45","size":"5"}]}"#,
            0,
        );
        assert_eq!(events.len(), 1);
        let t = top(&events[0]);
        assert_eq!(t.best_bid, None);
        assert_eq!(t.best_ask, Some(0.45));
    }

    #[test]
    fn nested_price_changes_mirror_no_outcome() {
        let mut dec = decoder();
        let events = dec.decode(
            r#"{"event_type":"price_change","market":"0xabc","timestamp":"5",
                "price_changes":[
                    {"asset_id":"no_token","price":"0.55","size":"10","side":"BUY","best_bid":"0.55","best_ask":"0.57"},
                    {"asset_id":"other","price":"0.10","size":"1","side":"BUY"}
                ]}"#,
            0,
        );
        assert_eq!(events.len(), 1);
        let t = top(&events[0]);
        assert!((t.best_bid.unwrap_or_default() - 0.43).abs() < 1e-12);
        assert!((t.best_ask.unwrap_or_default() - 0.45).abs() < 1e-12);
    }

    #[test]
    fn trades_decode_and_mirror() {
        let mut dec = decoder();
        let events = dec.decode(
            r#"[{"event_type":"last_trade_price","asset_id":"yes_token","price":"0.47","size":"20","side":"BUY","timestamp":"10"},
                {"event_type":"last_trade_price","asset_id":"no_token","price":"0.60","size":"5","side":"BUY","timestamp":"11"}]"#,
            0,
        );
        assert_eq!(events.len(), 2);
        let FeedEvent::Trade(yes) = &events[0] else {
            panic!("expected trade");
        };
        assert_eq!(yes.side, TradeSide::Buy);
        assert_eq!(yes.price, 0.47);
        let FeedEvent::Trade(no) = &events[1] else {
            panic!("expected trade");
        };
        assert_eq!(no.side, TradeSide::Sell);
        assert!((no.price - 0.40).abs() < 1e-12);
    }

    #[test]
    fn tick_size_and_missing_timestamp() {
        let mut dec = decoder();
        let events = dec.decode(
            r#"{"event_type":"tick_size_change","asset_id":"yes_token","old_tick_size":"0.01","new_tick_size":"0.001"}"#,
            99,
        );
        assert_eq!(
            events,
            vec![FeedEvent::TickSize {
                ts_ms: 99,
                tick_size: 0.001
            }]
        );
    }

    #[test]
    fn malformed_frames_yield_nothing() {
        let mut dec = decoder();
        assert!(dec.decode("{not json", 0).is_empty());
        assert!(dec.decode("PONG", 0).is_empty());
        assert!(dec
            .decode(
                r#"{"event_type":"last_trade_price","asset_id":"yes_token","price":"1.7","size":"1","side":"BUY"}"#,
                0
            )
            .is_empty());
        assert!(dec.decode(r#"{"event_type":"mystery","asset_id":"yes_token"}"#, 0).is_empty());
        let stats = dec.stats();
        assert_eq!(stats.malformed, 1);
        assert_eq!(stats.ignored, 2);
    }
}
