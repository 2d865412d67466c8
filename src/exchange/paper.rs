use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::info;
use uuid::Uuid;

use crate::exchange::{
    Account, CancelResult, ExchangeApi, OrderAck, OrderKind, OrderRequest, OrderSide,
    OrderState, OrderStatus,
};
use crate::models::{CandleSeries, Timeframe};

const PAPER_FEE_RATE: f64 = 0.001;

#[derive(Debug, Clone)]
struct SimOrder {
    request: OrderRequest,
    status: OrderStatus,
    filled_size: f64,
    average_fill_price: f64,
    fees: f64,
    completed_at: Option<DateTime<Utc>>,
}

struct PaperState {
    last_price: Option<f64>,
    quote_balance: f64,
    base_balance: f64,
    orders: HashMap<String, SimOrder>,
}

/// Order-API simulator for paper mode. Market data still comes from the
/// real exchange; this mimics only order placement, resting-order
/// triggers, and balances, all held locally.
pub struct PaperExchange {
    symbol: String,
    state: Mutex<PaperState>,
}

impl PaperExchange {
    pub fn new(symbol: &str, starting_quote_balance: f64) -> Self {
        Self {
            symbol: symbol.to_string(),
            state: Mutex::new(PaperState {
                last_price: None,
                quote_balance: starting_quote_balance,
                base_balance: 0.0,
                orders: HashMap::new(),
            }),
        }
    }

    /// Feed the latest trade price; resting stop/limit orders trigger
    /// against it.
    pub fn set_price(&self, price: f64, at: DateTime<Utc>) {
        let mut state = self.state.lock().expect("paper state poisoned");
        state.last_price = Some(price);

        let ids: Vec<String> = state
            .orders
            .iter()
            .filter(|(_, o)| !o.status.is_terminal())
            .map(|(id, _)| id.clone())
            .collect();

        for id in ids {
            let order = state.orders.get(&id).expect("order vanished").clone();
            let triggered = match (order.request.kind, order.request.side) {
                (OrderKind::Limit, OrderSide::Sell) => {
                    order.request.limit_price.is_some_and(|l| price >= l)
                }
                (OrderKind::Limit, OrderSide::Buy) => {
                    order.request.limit_price.is_some_and(|l| price <= l)
                }
                (OrderKind::StopLimit, OrderSide::Sell) => {
                    order.request.stop_price.is_some_and(|s| price <= s)
                }
                (OrderKind::StopLimit, OrderSide::Buy) => {
                    order.request.stop_price.is_some_and(|s| price >= s)
                }
                (OrderKind::Market, _) => false,
            };

            if triggered {
                // stops fill at their trigger, limits at their limit
                let fill_price = match order.request.kind {
                    OrderKind::StopLimit => order.request.stop_price.unwrap_or(price),
                    _ => order.request.limit_price.unwrap_or(price),
                };
                fill(&mut state, &id, fill_price, at);
            }
        }
    }
}

fn fill(state: &mut PaperState, order_id: &str, price: f64, at: DateTime<Utc>) {
    let order = match state.orders.get_mut(order_id) {
        Some(o) => o,
        None => return,
    };
    let size = order.request.size_base;
    let notional = size * price;
    let fees = notional * PAPER_FEE_RATE;

    order.status = OrderStatus::Filled;
    order.filled_size = size;
    order.average_fill_price = price;
    order.fees = fees;
    order.completed_at = Some(at);

    match order.request.side {
        OrderSide::Buy => {
            state.quote_balance -= notional + fees;
            state.base_balance += size;
        }
        OrderSide::Sell => {
            state.base_balance -= size;
            state.quote_balance += notional - fees;
        }
    }
    info!(order_id, price, size, "paper fill");
}

#[async_trait]
impl ExchangeApi for PaperExchange {
    async fn get_candles(
        &self,
        _timeframe: Timeframe,
        _from: DateTime<Utc>,
        _to: DateTime<Utc>,
    ) -> Result<CandleSeries> {
        bail!("paper exchange simulates orders only; fetch candles from the market client")
    }

    async fn best_price(&self) -> Result<f64> {
        self.state
            .lock()
            .expect("paper state poisoned")
            .last_price
            .context("paper exchange has not seen a price yet")
    }

    async fn list_accounts(&self) -> Result<Vec<Account>> {
        let state = self.state.lock().expect("paper state poisoned");
        let base = self.symbol.split('-').next().unwrap_or("BTC").to_string();
        let quote = self.symbol.split('-').nth(1).unwrap_or("USD").to_string();
        Ok(vec![
            Account {
                currency: base,
                available: state.base_balance,
            },
            Account {
                currency: quote,
                available: state.quote_balance,
            },
        ])
    }

    async fn place_order(&self, request: &OrderRequest) -> Result<OrderAck> {
        let mut state = self.state.lock().expect("paper state poisoned");
        let order_id = Uuid::new_v4().to_string();

        let order = SimOrder {
            request: request.clone(),
            status: if request.kind == OrderKind::Market {
                OrderStatus::Pending
            } else {
                OrderStatus::Open
            },
            filled_size: 0.0,
            average_fill_price: 0.0,
            fees: 0.0,
            completed_at: None,
        };
        state.orders.insert(order_id.clone(), order);

        if request.kind == OrderKind::Market {
            let price = state
                .last_price
                .context("cannot fill a market order before any price is seen")?;
            fill(&mut state, &order_id, price, Utc::now());
        }

        Ok(OrderAck { order_id })
    }

    async fn get_order(&self, order_id: &str) -> Result<OrderState> {
        let state = self.state.lock().expect("paper state poisoned");
        let order = state
            .orders
            .get(order_id)
            .with_context(|| format!("unknown paper order {order_id}"))?;
        Ok(OrderState {
            status: order.status,
            filled_size: order.filled_size,
            average_fill_price: order.average_fill_price,
            fees: order.fees,
            completed_at: order.completed_at,
        })
    }

    async fn cancel_orders(&self, order_ids: &[String]) -> Result<Vec<CancelResult>> {
        let mut state = self.state.lock().expect("paper state poisoned");
        Ok(order_ids
            .iter()
            .map(|id| {
                let success = match state.orders.get_mut(id) {
                    Some(order) if !order.status.is_terminal() => {
                        order.status = OrderStatus::Cancelled;
                        order.completed_at = Some(Utc::now());
                        true
                    }
                    _ => false,
                };
                CancelResult {
                    order_id: id.clone(),
                    success,
                }
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::ts;

    #[tokio::test]
    async fn market_order_fills_at_last_price() {
        let paper = PaperExchange::new("BTC-USD", 10_000.0);
        paper.set_price(90_000.0, ts(0));

        let ack = paper
            .place_order(&OrderRequest::market(OrderSide::Buy, 0.01))
            .await
            .unwrap();
        let state = paper.get_order(&ack.order_id).await.unwrap();
        assert_eq!(state.status, OrderStatus::Filled);
        assert!((state.average_fill_price - 90_000.0).abs() < 1e-9);
        assert!((state.filled_size - 0.01).abs() < 1e-12);

        let accounts = paper.list_accounts().await.unwrap();
        let quote = accounts.iter().find(|a| a.currency == "USD").unwrap();
        assert!(quote.available < 10_000.0 - 900.0 + 1.0);
    }

    #[tokio::test]
    async fn market_order_without_price_fails() {
        let paper = PaperExchange::new("BTC-USD", 10_000.0);
        let result = paper
            .place_order(&OrderRequest::market(OrderSide::Buy, 0.01))
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn sell_stop_triggers_below_stop_price() {
        let paper = PaperExchange::new("BTC-USD", 10_000.0);
        paper.set_price(90_000.0, ts(0));

        let ack = paper
            .place_order(&OrderRequest::stop_limit(OrderSide::Sell, 0.01, 88_200.0))
            .await
            .unwrap();
        assert_eq!(
            paper.get_order(&ack.order_id).await.unwrap().status,
            OrderStatus::Open
        );

        paper.set_price(88_500.0, ts(10));
        assert_eq!(
            paper.get_order(&ack.order_id).await.unwrap().status,
            OrderStatus::Open
        );

        paper.set_price(88_100.0, ts(20));
        let state = paper.get_order(&ack.order_id).await.unwrap();
        assert_eq!(state.status, OrderStatus::Filled);
        // stop fills at its trigger price
        assert!((state.average_fill_price - 88_200.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn sell_limit_triggers_above_limit_price() {
        let paper = PaperExchange::new("BTC-USD", 10_000.0);
        paper.set_price(90_000.0, ts(0));

        let ack = paper
            .place_order(&OrderRequest::limit(OrderSide::Sell, 0.01, 92_156.4))
            .await
            .unwrap();

        paper.set_price(92_200.0, ts(10));
        let state = paper.get_order(&ack.order_id).await.unwrap();
        assert_eq!(state.status, OrderStatus::Filled);
        assert!((state.average_fill_price - 92_156.4).abs() < 1e-9);
    }

    #[tokio::test]
    async fn cancel_only_touches_live_orders() {
        let paper = PaperExchange::new("BTC-USD", 10_000.0);
        paper.set_price(90_000.0, ts(0));

        let resting = paper
            .place_order(&OrderRequest::stop_limit(OrderSide::Sell, 0.01, 88_200.0))
            .await
            .unwrap();
        let filled = paper
            .place_order(&OrderRequest::market(OrderSide::Buy, 0.01))
            .await
            .unwrap();

        let results = paper
            .cancel_orders(&[resting.order_id.clone(), filled.order_id.clone()])
            .await
            .unwrap();
        assert!(results[0].success);
        assert!(!results[1].success, "filled order cannot be cancelled");

        assert_eq!(
            paper.get_order(&resting.order_id).await.unwrap().status,
            OrderStatus::Cancelled
        );
    }
}
