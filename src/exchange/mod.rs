pub mod coinbase;
pub mod paper;
pub mod rate_limit;
pub mod stream;

pub use coinbase::CoinbaseClient;
pub use paper::PaperExchange;
pub use rate_limit::{ApiBuckets, TokenBucket};
pub use stream::{PriceTick, TickerStream};

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::models::{CandleSeries, Timeframe};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderSide::Buy => "BUY",
            OrderSide::Sell => "SELL",
        }
    }

    pub fn opposite(&self) -> OrderSide {
        match self {
            OrderSide::Buy => OrderSide::Sell,
            OrderSide::Sell => OrderSide::Buy,
        }
    }
}

impl fmt::Display for OrderSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderKind {
    Market,
    StopLimit,
    Limit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderStatus {
    Pending,
    Open,
    Filled,
    Cancelled,
    Expired,
    Failed,
}

impl OrderStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Filled | OrderStatus::Cancelled | OrderStatus::Expired | OrderStatus::Failed
        )
    }

    pub fn parse(s: &str) -> Option<OrderStatus> {
        match s {
            "PENDING" | "QUEUED" => Some(OrderStatus::Pending),
            "OPEN" => Some(OrderStatus::Open),
            "FILLED" => Some(OrderStatus::Filled),
            "CANCELLED" => Some(OrderStatus::Cancelled),
            "EXPIRED" => Some(OrderStatus::Expired),
            "FAILED" => Some(OrderStatus::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct OrderRequest {
    pub client_order_id: String,
    pub kind: OrderKind,
    pub side: OrderSide,
    pub size_base: f64,
    pub limit_price: Option<f64>,
    pub stop_price: Option<f64>,
}

impl OrderRequest {
    pub fn market(side: OrderSide, size_base: f64) -> Self {
        Self {
            client_order_id: uuid::Uuid::new_v4().to_string(),
            kind: OrderKind::Market,
            side,
            size_base,
            limit_price: None,
            stop_price: None,
        }
    }

    /// Stop order with the limit a hair past the trigger so the resting
    /// order actually executes once triggered.
    pub fn stop_limit(side: OrderSide, size_base: f64, stop_price: f64) -> Self {
        let slip = match side {
            OrderSide::Sell => stop_price * 0.999,
            OrderSide::Buy => stop_price * 1.001,
        };
        Self {
            client_order_id: uuid::Uuid::new_v4().to_string(),
            kind: OrderKind::StopLimit,
            side,
            size_base,
            limit_price: Some(slip),
            stop_price: Some(stop_price),
        }
    }

    pub fn limit(side: OrderSide, size_base: f64, limit_price: f64) -> Self {
        Self {
            client_order_id: uuid::Uuid::new_v4().to_string(),
            kind: OrderKind::Limit,
            side,
            size_base,
            limit_price: Some(limit_price),
            stop_price: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct OrderAck {
    pub order_id: String,
}

#[derive(Debug, Clone)]
pub struct OrderState {
    pub status: OrderStatus,
    pub filled_size: f64,
    pub average_fill_price: f64,
    pub fees: f64,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct Account {
    pub currency: String,
    pub available: f64,
}

/// Available balance of the quote currency (USD side of the pair).
pub fn quote_balance(accounts: &[Account], symbol: &str) -> f64 {
    let quote = symbol.split('-').nth(1).unwrap_or("USD");
    accounts
        .iter()
        .find(|a| a.currency == quote)
        .map(|a| a.available)
        .unwrap_or(0.0)
}

#[derive(Debug, Clone)]
pub struct CancelResult {
    pub order_id: String,
    pub success: bool,
}

/// The REST surface the pipeline needs from the exchange. The Coinbase
/// client implements it for live trading; the paper simulator implements
/// it against local state.
#[async_trait]
pub trait ExchangeApi: Send + Sync {
    async fn get_candles(
        &self,
        timeframe: Timeframe,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<CandleSeries>;
    async fn best_price(&self) -> Result<f64>;
    async fn list_accounts(&self) -> Result<Vec<Account>>;
    async fn place_order(&self, request: &OrderRequest) -> Result<OrderAck>;
    async fn get_order(&self, order_id: &str) -> Result<OrderState>;
    async fn cancel_orders(&self, order_ids: &[String]) -> Result<Vec<CancelResult>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stop_limit_slips_limit_past_trigger() {
        let sell = OrderRequest::stop_limit(OrderSide::Sell, 0.01, 88_000.0);
        assert!(sell.limit_price.unwrap() < 88_000.0);
        let buy = OrderRequest::stop_limit(OrderSide::Buy, 0.01, 92_000.0);
        assert!(buy.limit_price.unwrap() > 92_000.0);
    }

    #[test]
    fn quote_balance_picks_pair_quote() {
        let accounts = vec![
            Account {
                currency: "BTC".into(),
                available: 0.5,
            },
            Account {
                currency: "USD".into(),
                available: 10_000.0,
            },
        ];
        assert!((quote_balance(&accounts, "BTC-USD") - 10_000.0).abs() < 1e-9);
        assert_eq!(quote_balance(&accounts, "ETH-EUR"), 0.0);
    }

    #[test]
    fn order_status_parsing_and_terminality() {
        assert_eq!(OrderStatus::parse("FILLED"), Some(OrderStatus::Filled));
        assert!(OrderStatus::Filled.is_terminal());
        assert!(!OrderStatus::Open.is_terminal());
        assert_eq!(OrderStatus::parse("???"), None);
    }
}
