use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::config::Config;
use crate::exchange::{
    Account, ApiBuckets, CancelResult, ExchangeApi, OrderAck, OrderKind, OrderRequest,
    OrderState, OrderStatus,
};
use crate::models::{Candle, CandleSeries, Timeframe};

const BASE_URL: &str = "https://api.coinbase.com";
/// Coinbase caps candle responses; stay under it per request.
const MAX_CANDLES_PER_REQUEST: i64 = 300;

#[derive(Debug, Serialize)]
struct JwtClaims {
    sub: String,
    iss: String,
    nbf: u64,
    exp: u64,
    uri: String,
}

#[derive(Debug, Deserialize)]
struct CandleResponse {
    candles: Vec<RawCandle>,
}

#[derive(Debug, Deserialize)]
struct RawCandle {
    start: String,
    low: String,
    high: String,
    open: String,
    close: String,
    volume: String,
}

#[derive(Debug, Deserialize)]
struct TickerResponse {
    trades: Vec<TickerTrade>,
}

#[derive(Debug, Deserialize)]
struct TickerTrade {
    price: String,
}

#[derive(Debug, Deserialize)]
struct AccountsResponse {
    accounts: Vec<RawAccount>,
}

#[derive(Debug, Deserialize)]
struct RawAccount {
    currency: String,
    available_balance: RawBalance,
}

#[derive(Debug, Deserialize)]
struct RawBalance {
    value: String,
}

#[derive(Debug, Deserialize)]
struct PlaceOrderResponse {
    success: bool,
    #[serde(default)]
    success_response: Option<OrderIdHolder>,
    #[serde(default)]
    error_response: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct OrderIdHolder {
    order_id: String,
}

#[derive(Debug, Deserialize)]
struct GetOrderResponse {
    order: RawOrder,
}

#[derive(Debug, Deserialize)]
struct RawOrder {
    status: String,
    #[serde(default)]
    filled_size: String,
    #[serde(default)]
    average_filled_price: String,
    #[serde(default)]
    total_fees: String,
    #[serde(default)]
    last_fill_time: Option<String>,
}

#[derive(Debug, Deserialize)]
struct BatchCancelResponse {
    results: Vec<RawCancelResult>,
}

#[derive(Debug, Deserialize)]
struct RawCancelResult {
    success: bool,
    order_id: String,
}

/// Coinbase Advanced Trade REST client. Each request mints a short-lived
/// ES256 JWT and takes a token from the bucket for its rate-limit class.
pub struct CoinbaseClient {
    client: Client,
    api_key: String,
    api_secret: String,
    symbol: String,
    buckets: Arc<ApiBuckets>,
}

impl CoinbaseClient {
    pub fn new(cfg: &Config, buckets: Arc<ApiBuckets>) -> Self {
        Self {
            client: Client::new(),
            api_key: cfg.coinbase_api_key.clone(),
            api_secret: cfg.coinbase_api_secret.clone(),
            symbol: cfg.symbol.clone(),
            buckets,
        }
    }

    pub fn generate_jwt(&self, method: &str, path: &str) -> Result<String> {
        let now = SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs();

        let uri = format!("{} {}{}", method, "api.coinbase.com", path);

        let claims = JwtClaims {
            sub: self.api_key.clone(),
            iss: "cdp".to_string(),
            nbf: now,
            exp: now + 120,
            uri,
        };

        // The secret is an EC private key in PEM form.
        let key = EncodingKey::from_ec_pem(self.api_secret.as_bytes())
            .context("Failed to parse API secret as EC key")?;

        let mut header = Header::new(Algorithm::ES256);
        header.kid = Some(self.api_key.clone());
        header.typ = Some("JWT".to_string());

        encode(&header, &claims, &key).context("Failed to encode JWT")
    }

    async fn fetch_native_candles(
        &self,
        granularity: &str,
        step_secs: i64,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Candle>> {
        let path = format!("/api/v3/brokerage/market/products/{}/candles", self.symbol);
        let mut all: Vec<Candle> = Vec::new();
        let mut cursor = from.timestamp();
        let end = to.timestamp();

        while cursor < end {
            let chunk_end = (cursor + step_secs * MAX_CANDLES_PER_REQUEST).min(end);

            self.buckets.public.acquire().await;
            let jwt = self.generate_jwt("GET", &path)?;
            let resp = self
                .client
                .get(format!("{}{}", BASE_URL, path))
                .query(&[
                    ("start", cursor.to_string()),
                    ("end", chunk_end.to_string()),
                    ("granularity", granularity.to_string()),
                ])
                .header("Authorization", format!("Bearer {}", jwt))
                .send()
                .await
                .context("Failed to fetch candles")?;

            let status = resp.status();
            if !status.is_success() {
                let body = resp.text().await.unwrap_or_default();
                anyhow::bail!("Coinbase candles error {}: {}", status, body);
            }

            let data: CandleResponse =
                resp.json().await.context("Failed to parse candle response")?;
            all.extend(data.candles.into_iter().filter_map(|rc| {
                let ts = rc.start.parse::<i64>().ok()?;
                Some(Candle {
                    bucket_start: DateTime::from_timestamp(ts, 0)?,
                    open: rc.open.parse().ok()?,
                    high: rc.high.parse().ok()?,
                    low: rc.low.parse().ok()?,
                    close: rc.close.parse().ok()?,
                    volume: rc.volume.parse().ok()?,
                })
            }));

            cursor = chunk_end;
        }

        // Coinbase returns newest first per page; normalize to oldest first
        all.sort_by_key(|c| c.bucket_start);
        all.dedup_by_key(|c| c.bucket_start);
        Ok(all)
    }

    fn order_configuration(&self, request: &OrderRequest) -> Result<serde_json::Value> {
        let size = format!("{:.8}", request.size_base);
        Ok(match request.kind {
            OrderKind::Market => json!({
                "market_market_ioc": { "base_size": size }
            }),
            OrderKind::Limit => {
                let limit = request
                    .limit_price
                    .context("limit order without a limit price")?;
                json!({
                    "limit_limit_gtc": {
                        "base_size": size,
                        "limit_price": format!("{:.2}", limit),
                    }
                })
            }
            OrderKind::StopLimit => {
                let stop = request
                    .stop_price
                    .context("stop order without a trigger price")?;
                let limit = request
                    .limit_price
                    .context("stop order without a limit price")?;
                let direction = if limit < stop {
                    "STOP_DIRECTION_STOP_DOWN"
                } else {
                    "STOP_DIRECTION_STOP_UP"
                };
                json!({
                    "stop_limit_stop_limit_gtc": {
                        "base_size": size,
                        "stop_price": format!("{:.2}", stop),
                        "limit_price": format!("{:.2}", limit),
                        "stop_direction": direction,
                    }
                })
            }
        })
    }
}

#[async_trait]
impl ExchangeApi for CoinbaseClient {
    async fn get_candles(
        &self,
        timeframe: Timeframe,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<CandleSeries> {
        match timeframe {
            Timeframe::M5 | Timeframe::H1 => {
                let candles = self
                    .fetch_native_candles(
                        timeframe.coinbase_granularity(),
                        timeframe.as_seconds(),
                        from,
                        to,
                    )
                    .await?;
                Ok(CandleSeries::new(candles))
            }
            // no native 4h granularity: pull 1h and resample
            Timeframe::H4 => {
                let h1 = self
                    .fetch_native_candles(
                        Timeframe::H1.coinbase_granularity(),
                        Timeframe::H1.as_seconds(),
                        from,
                        to,
                    )
                    .await?;
                Ok(CandleSeries::new(h1).resample(Duration::from_secs(14400)))
            }
        }
    }

    async fn best_price(&self) -> Result<f64> {
        self.buckets.public.acquire().await;

        let path = format!("/api/v3/brokerage/market/products/{}/ticker", self.symbol);
        let jwt = self.generate_jwt("GET", &path)?;

        let resp = self
            .client
            .get(format!("{}{}", BASE_URL, path))
            .query(&[("limit", "1")])
            .header("Authorization", format!("Bearer {}", jwt))
            .send()
            .await
            .context("Failed to fetch ticker")?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("Coinbase ticker error {}: {}", status, body);
        }

        let data: TickerResponse = resp.json().await.context("Failed to parse ticker")?;

        data.trades
            .first()
            .and_then(|t| t.price.parse::<f64>().ok())
            .context("No price in ticker response")
    }

    async fn list_accounts(&self) -> Result<Vec<Account>> {
        self.buckets.private.acquire().await;

        let path = "/api/v3/brokerage/accounts";
        let jwt = self.generate_jwt("GET", path)?;

        let resp = self
            .client
            .get(format!("{}{}", BASE_URL, path))
            .header("Authorization", format!("Bearer {}", jwt))
            .send()
            .await
            .context("Failed to list accounts")?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("Coinbase accounts error {}: {}", status, body);
        }

        let data: AccountsResponse =
            resp.json().await.context("Failed to parse accounts")?;
        Ok(data
            .accounts
            .into_iter()
            .filter_map(|a| {
                Some(Account {
                    currency: a.currency,
                    available: a.available_balance.value.parse().ok()?,
                })
            })
            .collect())
    }

    async fn place_order(&self, request: &OrderRequest) -> Result<OrderAck> {
        self.buckets.order.acquire().await;

        let path = "/api/v3/brokerage/orders";
        let jwt = self.generate_jwt("POST", path)?;

        let body = json!({
            "client_order_id": request.client_order_id,
            "product_id": self.symbol,
            "side": request.side.as_str(),
            "order_configuration": self.order_configuration(request)?,
        });

        let resp = self
            .client
            .post(format!("{}{}", BASE_URL, path))
            .header("Authorization", format!("Bearer {}", jwt))
            .json(&body)
            .send()
            .await
            .context("Failed to place order")?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("Coinbase order error {}: {}", status, body);
        }

        let data: PlaceOrderResponse =
            resp.json().await.context("Failed to parse order response")?;
        if !data.success {
            anyhow::bail!(
                "Coinbase rejected order: {}",
                data.error_response
                    .map(|e| e.to_string())
                    .unwrap_or_else(|| "unknown reason".to_string())
            );
        }

        let order_id = data
            .success_response
            .context("Order accepted without an order id")?
            .order_id;
        Ok(OrderAck { order_id })
    }

    async fn get_order(&self, order_id: &str) -> Result<OrderState> {
        self.buckets.private.acquire().await;

        let path = format!("/api/v3/brokerage/orders/historical/{order_id}");
        let jwt = self.generate_jwt("GET", &path)?;

        let resp = self
            .client
            .get(format!("{}{}", BASE_URL, path))
            .header("Authorization", format!("Bearer {}", jwt))
            .send()
            .await
            .context("Failed to fetch order")?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("Coinbase get-order error {}: {}", status, body);
        }

        let data: GetOrderResponse =
            resp.json().await.context("Failed to parse order state")?;
        let order = data.order;

        Ok(OrderState {
            status: OrderStatus::parse(&order.status)
                .with_context(|| format!("unknown order status {}", order.status))?,
            filled_size: order.filled_size.parse().unwrap_or(0.0),
            average_fill_price: order.average_filled_price.parse().unwrap_or(0.0),
            fees: order.total_fees.parse().unwrap_or(0.0),
            completed_at: order
                .last_fill_time
                .as_deref()
                .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
                .map(|t| t.with_timezone(&Utc)),
        })
    }

    async fn cancel_orders(&self, order_ids: &[String]) -> Result<Vec<CancelResult>> {
        if order_ids.is_empty() {
            return Ok(Vec::new());
        }
        self.buckets.order.acquire().await;

        let path = "/api/v3/brokerage/orders/batch_cancel";
        let jwt = self.generate_jwt("POST", path)?;

        let resp = self
            .client
            .post(format!("{}{}", BASE_URL, path))
            .header("Authorization", format!("Bearer {}", jwt))
            .json(&json!({ "order_ids": order_ids }))
            .send()
            .await
            .context("Failed to cancel orders")?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("Coinbase cancel error {}: {}", status, body);
        }

        let data: BatchCancelResponse =
            resp.json().await.context("Failed to parse cancel response")?;
        Ok(data
            .results
            .into_iter()
            .map(|r| CancelResult {
                order_id: r.order_id,
                success: r.success,
            })
            .collect())
    }
}
