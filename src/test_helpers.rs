use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use uuid::Uuid;

use crate::config::Config;
use crate::exchange::{
    Account, CancelResult, ExchangeApi, OrderAck, OrderRequest, OrderState, OrderStatus,
};
use crate::models::{
    Candle, CandleSeries, Direction, StopSource, SwingKind, Timeframe, Trade, TradeStatus,
};
use crate::store::{Database, SweepRepository, SwingRepository};

/// Fixed test epoch, aligned to a 4h bucket boundary.
pub fn base_time() -> DateTime<Utc> {
    DateTime::parse_from_rfc3339("2024-01-15T00:00:00Z")
        .unwrap()
        .with_timezone(&Utc)
}

/// Test epoch plus an offset in seconds.
pub fn ts(secs: i64) -> DateTime<Utc> {
    base_time() + Duration::seconds(secs)
}

/// One candle at 5m bucket index `i`.
pub fn candle_at(i: i64, open: f64, high: f64, low: f64, close: f64) -> Candle {
    Candle {
        bucket_start: ts(i * 300),
        open,
        high,
        low,
        close,
        volume: 100.0,
    }
}

pub fn m5_candle_at(i: i64, open: f64, high: f64, low: f64, close: f64) -> Candle {
    candle_at(i, open, high, low, close)
}

/// One candle at 4h bucket index `i`.
pub fn h4_candle_at(i: i64, open: f64, high: f64, low: f64, close: f64) -> Candle {
    Candle {
        bucket_start: ts(i * 14400),
        open,
        high,
        low,
        close,
        volume: 100.0,
    }
}

/// Series from (open, high, low, close) tuples with 5m spacing.
pub fn make_candles(data: &[(f64, f64, f64, f64)]) -> CandleSeries {
    let candles: Vec<Candle> = data
        .iter()
        .enumerate()
        .map(|(i, &(o, h, l, c))| candle_at(i as i64, o, h, l, c))
        .collect();
    CandleSeries::new(candles)
}

/// Seed a swing + sweep so foreign keys line up, returning the id of the
/// confluence state created with the sweep.
pub async fn seed_confluence_state(db: &Database) -> i64 {
    let swing = SwingRepository::new(db.clone())
        .record(Timeframe::H4, SwingKind::Low, ts(0), 89_000.0)
        .await
        .unwrap();
    SweepRepository::new(db.clone())
        .emit(ts(0), SwingKind::Low, 88_910.9, swing.id, 12)
        .await
        .unwrap()
        .state
        .id
}

/// An open Trade value with the exit fields blank.
pub fn make_open_trade(direction: Direction, entry: f64, stop: f64, tp: f64) -> Trade {
    Trade {
        id: 1,
        confluence_state_id: 1,
        direction,
        entry_price: entry,
        entry_at: ts(0),
        size_base: 0.05,
        size_quote: 0.05 * entry,
        stop_price: stop,
        stop_source: StopSource::M5,
        take_profit: tp,
        rr_ratio: 2.0,
        entry_order_id: "entry".into(),
        stop_order_id: "stop".into(),
        tp_order_id: "tp".into(),
        status: TradeStatus::Open,
        outcome: None,
        exit_price: None,
        exit_at: None,
        pnl_quote: None,
        pnl_percent: None,
        trailing_activated: false,
        trailing_price: None,
        ai_confidence: 85.0,
        ai_reasoning: "test trade".into(),
    }
}

/// A Config with the stock defaults and no environment reads.
pub fn test_config() -> Config {
    Config {
        symbol: "BTC-USD".into(),
        coinbase_api_key: String::new(),
        coinbase_api_secret: String::new(),
        database_url: "sqlite::memory:".into(),
        paper_trade: true,
        paper_starting_balance: 10_000.0,
        risk_per_trade: 0.01,
        max_daily_loss: 0.03,
        max_open_positions: 1,
        max_consecutive_losses: 3,
        min_account_balance: 100.0,
        sweep_threshold: 0.001,
        sweep_ttl_hours: 12,
        choch_lookback: 5,
        fvg_scan_window: 20,
        fvg_min_gap_percent: 0.001,
        bos_threshold: 0.001,
        long_stop_buffer: 0.998,
        short_stop_buffer: 1.003,
        stop_distance_min: 0.005,
        stop_distance_max: 0.03,
        min_rr: 2.0,
        entry_price_tolerance: 0.002,
        entry_fill_timeout_secs: 2,
        entry_poll_interval_secs: 1,
        monitor_interval_secs: 30,
        max_trade_hours: 72,
        trailing_trigger: 0.8,
        trailing_mode: crate::config::TrailingMode::Breakeven,
        trailing_entry_band: 0.005,
        llm_url: "http://localhost:11434/api/generate".into(),
        llm_model: "llama3.1:8b".into(),
        llm_temperature: 0.2,
        llm_max_tokens: 512,
        llm_timeout_secs: 1,
        ai_min_confidence: 70.0,
        ai_entry_deviation_max: 0.005,
        ai_size_tolerance: 0.05,
        ai_rr_tolerance: 0.1,
        ai_min_reasoning_len: 20,
        max_hourly_volatility: 0.05,
        min_volume_ratio: 0.3,
        max_spread: 0.001,
        max_daily_change: 0.15,
        event_windows: Vec::new(),
        price_sanity_min: 1_000.0,
        price_sanity_max: 1_000_000.0,
        public_rate_per_sec: 10.0,
        private_rate_per_sec: 15.0,
        order_rate_per_sec: 5.0,
        ws_heartbeat_secs: 30,
        ws_max_reconnect_attempts: 10,
        ws_backoff_cap_secs: 60,
        collector_interval_secs: 60,
        h4_retention_buckets: 200,
        m5_retention_days: 7,
        webhook_url: None,
        log_level: "error".into(),
    }
}

/// Exchange stub with a fixed price; `reachable = false` makes every call
/// fail, for the reachability check.
pub struct StaticExchange {
    price: f64,
    reachable: bool,
}

impl StaticExchange {
    pub fn new(price: f64, reachable: bool) -> Self {
        Self { price, reachable }
    }

    fn guard(&self) -> Result<()> {
        if self.reachable {
            Ok(())
        } else {
            anyhow::bail!("connection refused")
        }
    }
}

#[async_trait]
impl ExchangeApi for StaticExchange {
    async fn get_candles(
        &self,
        _timeframe: Timeframe,
        _from: DateTime<Utc>,
        _to: DateTime<Utc>,
    ) -> Result<CandleSeries> {
        self.guard()?;
        Ok(CandleSeries::default())
    }

    async fn best_price(&self) -> Result<f64> {
        self.guard()?;
        Ok(self.price)
    }

    async fn list_accounts(&self) -> Result<Vec<Account>> {
        self.guard()?;
        Ok(vec![Account {
            currency: "USD".into(),
            available: 10_000.0,
        }])
    }

    async fn place_order(&self, _request: &OrderRequest) -> Result<OrderAck> {
        self.guard()?;
        Ok(OrderAck {
            order_id: Uuid::new_v4().to_string(),
        })
    }

    async fn get_order(&self, _order_id: &str) -> Result<OrderState> {
        self.guard()?;
        Ok(OrderState {
            status: OrderStatus::Open,
            filled_size: 0.0,
            average_fill_price: 0.0,
            fees: 0.0,
            completed_at: None,
        })
    }

    async fn cancel_orders(&self, order_ids: &[String]) -> Result<Vec<CancelResult>> {
        self.guard()?;
        Ok(order_ids
            .iter()
            .map(|id| CancelResult {
                order_id: id.clone(),
                success: true,
            })
            .collect())
    }
}

/// Exchange stub that fails the Nth place_order call; market orders fill
/// instantly at the fixed price. Counts rollback cancels.
pub struct FlakyExchange {
    price: f64,
    fail_on_order: usize,
    order_calls: AtomicUsize,
    cancelled: AtomicUsize,
    sizes: Mutex<HashMap<String, f64>>,
}

impl FlakyExchange {
    pub fn failing_on_order(nth: usize, price: f64) -> Self {
        Self {
            price,
            fail_on_order: nth,
            order_calls: AtomicUsize::new(0),
            cancelled: AtomicUsize::new(0),
            sizes: Mutex::new(HashMap::new()),
        }
    }

    pub fn cancelled_count(&self) -> usize {
        self.cancelled.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ExchangeApi for FlakyExchange {
    async fn get_candles(
        &self,
        _timeframe: Timeframe,
        _from: DateTime<Utc>,
        _to: DateTime<Utc>,
    ) -> Result<CandleSeries> {
        Ok(CandleSeries::default())
    }

    async fn best_price(&self) -> Result<f64> {
        Ok(self.price)
    }

    async fn list_accounts(&self) -> Result<Vec<Account>> {
        Ok(vec![Account {
            currency: "USD".into(),
            available: 10_000.0,
        }])
    }

    async fn place_order(&self, request: &OrderRequest) -> Result<OrderAck> {
        let call = self.order_calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call == self.fail_on_order {
            anyhow::bail!("exchange rejected order (simulated)");
        }
        let order_id = Uuid::new_v4().to_string();
        self.sizes
            .lock()
            .unwrap()
            .insert(order_id.clone(), request.size_base);
        Ok(OrderAck { order_id })
    }

    async fn get_order(&self, order_id: &str) -> Result<OrderState> {
        let size = self
            .sizes
            .lock()
            .unwrap()
            .get(order_id)
            .copied()
            .unwrap_or(0.0);
        Ok(OrderState {
            status: OrderStatus::Filled,
            filled_size: size,
            average_fill_price: self.price,
            fees: 0.0,
            completed_at: Some(Utc::now()),
        })
    }

    async fn cancel_orders(&self, order_ids: &[String]) -> Result<Vec<CancelResult>> {
        self.cancelled.fetch_add(order_ids.len(), Ordering::SeqCst);
        Ok(order_ids
            .iter()
            .map(|id| CancelResult {
                order_id: id.clone(),
                success: true,
            })
            .collect())
    }
}
