use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use core_types::{
    new_id, ExecutionPort, FillEvent, OrderAck, OrderSide, QuoteIntent, QuotePlan, TopOfBook,
};
use parking_lot::RwLock;
use tokio::sync::mpsc;

#[derive(Debug, Clone)]
pub struct RestingOrder {
    pub order_id: String,
    pub intent: QuoteIntent,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct DryRunStats {
    pub plans: u64,
    pub placed: u64,
    pub withdrawn: u64,
    pub fills: u64,
    pub dropped_fills: u64,
}

/// Execution port that never leaves the process. Each plan replaces the
/// resting set; a top of book crossing a resting quote fills it in full.
pub struct DryRunExecutor {
    orders: RwLock<HashMap<String, RestingOrder>>,
    stats: RwLock<DryRunStats>,
    fills_tx: mpsc::Sender<FillEvent>,
}

impl DryRunExecutor {
    pub fn new(fills_tx: mpsc::Sender<FillEvent>) -> Self {
        Self {
            orders: RwLock::new(HashMap::new()),
            stats: RwLock::new(DryRunStats::default()),
            fills_tx,
        }
    }

    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<FillEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self::new(tx), rx)
    }

    pub fn open_orders(&self) -> usize {
        self.orders.read().len()
    }

    /// Resting intents, bids first, best first within a side.
    pub fn resting(&self) -> Vec<QuoteIntent> {
        let mut out: Vec<QuoteIntent> =
            self.orders.read().values().map(|o| o.intent.clone()).collect();
        out.sort_by(|a, b| match (a.side, b.side) {
            (OrderSide::Buy, OrderSide::Sell) => std::cmp::Ordering::Less,
            (OrderSide::Sell, OrderSide::Buy) => std::cmp::Ordering::Greater,
            (OrderSide::Buy, OrderSide::Buy) => b.price.total_cmp(&a.price),
            (OrderSide::Sell, OrderSide::Sell) => a.price.total_cmp(&b.price),
        });
        out
    }

    pub fn stats(&self) -> DryRunStats {
        *self.stats.read()
    }

    pub fn on_top(&self, market_id: &str, top: &TopOfBook) -> Vec<FillEvent> {
        let mut fills = Vec::new();
        let mut to_remove = Vec::new();

        {
            let orders = self.orders.read();
            for (id, order) in orders.iter() {
                if order.intent.market_id != market_id {
                    continue;
                }
                let fill_price = match order.intent.side {
                    OrderSide::Buy => top.best_ask.filter(|ask| order.intent.price >= *ask),
                    OrderSide::Sell => top.best_bid.filter(|bid| order.intent.price <= *bid),
                };
                if let Some(px) = fill_price {
                    fills.push(FillEvent {
                        order_id: id.clone(),
                        market_id: order.intent.market_id.clone(),
                        side: order.intent.side,
                        price: px,
                        size: order.intent.size,
                        ts_ms: top.ts_ms,
                    });
                    to_remove.push(id.clone());
                }
            }
        }

        if !to_remove.is_empty() {
            let mut orders = self.orders.write();
            for id in to_remove {
                orders.remove(&id);
            }
        }

        for fill in &fills {
            tracing::info!(
                market = %fill.market_id,
                side = %fill.side,
                price = fill.price,
                size = fill.size,
                "dry-run fill"
            );
            let mut stats = self.stats.write();
            stats.fills += 1;
            if self.fills_tx.try_send(fill.clone()).is_err() {
                stats.dropped_fills += 1;
                tracing::warn!(
                    order_id = %fill.order_id,
                    "fill channel full or closed, fill dropped"
                );
            }
        }
        fills
    }
}

#[async_trait]
impl ExecutionPort for DryRunExecutor {
    async fn apply_plan(&self, plan: &QuotePlan) -> Result<Vec<OrderAck>> {
        let mut acks = Vec::with_capacity(plan.bids.len() + plan.asks.len());
        let mut orders = self.orders.write();
        let cancelled = orders.len();
        orders.retain(|_, o| o.intent.market_id != plan.market_id);
        let cancelled = cancelled - orders.len();

        for intent in plan.intents() {
            let order_id = new_id();
            tracing::debug!(
                market = %intent.market_id,
                side = %intent.side,
                level = intent.level,
                price = intent.price,
                size = intent.size,
                "would place"
            );
            orders.insert(
                order_id.clone(),
                RestingOrder {
                    order_id: order_id.clone(),
                    intent: intent.clone(),
                },
            );
            acks.push(OrderAck {
                order_id,
                market_id: intent.market_id.clone(),
                accepted: true,
                ts_ms: plan.ts_ms,
            });
        }
        drop(orders);

        tracing::info!(
            market = %plan.market_id,
            mode = %plan.mode,
            bids = plan.bids.len(),
            asks = plan.asks.len(),
            best_bid = ?plan.best_bid(),
            best_ask = ?plan.best_ask(),
            cancelled,
            "dry-run plan applied"
        );
        let mut stats = self.stats.write();
        stats.plans += 1;
        stats.placed += acks.len() as u64;
        Ok(acks)
    }

    async fn withdraw_all(&self, market_id: &str) -> Result<()> {
        let mut orders = self.orders.write();
        let before = orders.len();
        orders.retain(|_, o| o.intent.market_id != market_id);
        let removed = before - orders.len();
        drop(orders);
        self.stats.write().withdrawn += removed as u64;
        tracing::info!(market = %market_id, removed, "would withdraw all quotes");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core_types::QuoteMode;

    fn intent(side: OrderSide, price: f64, level: u32) -> QuoteIntent {
        QuoteIntent {
            market_id: "m1".to_string(),
            side,
            price,
            size: 10.0,
            level,
        }
    }

    fn plan(bids: Vec<QuoteIntent>, asks: Vec<QuoteIntent>) -> QuotePlan {
        QuotePlan {
            market_id: "m1".to_string(),
            mode: QuoteMode::Normal,
            bids,
            asks,
            metrics: None,
            ts_ms: 1,
            stale: false,
        }
    }

    fn top(bid: f64, ask: f64) -> TopOfBook {
        TopOfBook {
            ts_ms: 5,
            best_bid: Some(bid),
            best_ask: Some(ask),
            seq: None,
        }
    }

    #[tokio::test]
    async fn plan_replaces_resting_set() {
        let (exec, _rx) = DryRunExecutor::channel(8);
        let acks = exec
            .apply_plan(&plan(
                vec![intent(OrderSide::Buy, 0.45, 0), intent(OrderSide::Buy, 0.40, 1)],
                vec![intent(OrderSide::Sell, 0.55, 0)],
            ))
            .await
            .unwrap();
        assert_eq!(acks.len(), 3);
        assert_eq!(exec.open_orders(), 3);

        exec.apply_plan(&plan(vec![intent(OrderSide::Buy, 0.44, 0)], vec![]))
            .await
            .unwrap();
        let resting = exec.resting();
        assert_eq!(resting.len(), 1);
        assert_eq!(resting[0].price, 0.44);

        exec.withdraw_all("m1").await.unwrap();
        assert_eq!(exec.open_orders(), 0);
        assert_eq!(exec.stats().withdrawn, 1);
    }

    #[tokio::test]
    async fn crossing_top_fills_and_notifies() {
        let (exec, mut rx) = DryRunExecutor::channel(8);
        exec.apply_plan(&plan(
            vec![intent(OrderSide::Buy, 0.45, 0)],
            vec![intent(OrderSide::Sell, 0.55, 0)],
        ))
        .await
        .unwrap();

        assert!(exec.on_top("m1", &top(0.44, 0.50)).is_empty());

        let fills = exec.on_top("m1", &top(0.40, 0.44));
        assert_eq!(fills.len(), 1);
        assert_eq!(fills[0].side, OrderSide::Buy);
        assert_eq!(fills[0].price, 0.44);
        assert_eq!(exec.open_orders(), 1);

        let received = rx.recv().await.unwrap();
        assert_eq!(received.signed_size(), 10.0);

        let fills = exec.on_top("m1", &top(0.56, 0.60));
        assert_eq!(fills.len(), 1);
        assert_eq!(fills[0].signed_size(), -10.0);
        assert_eq!(exec.open_orders(), 0);
    }

    #[tokio::test]
    async fn other_market_tops_are_ignored() {
        let (exec, _rx) = DryRunExecutor::channel(8);
        exec.apply_plan(&plan(vec![intent(OrderSide::Buy, 0.45, 0)], vec![]))
            .await
            .unwrap();
        assert!(exec.on_top("m2", &top(0.30, 0.31)).is_empty());
        assert_eq!(exec.open_orders(), 1);
    }
}
