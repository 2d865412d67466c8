use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::RwLock;

pub type SharedConfig = Arc<RwLock<Config>>;

/// How the stop is promoted once progress-to-target crosses the trigger.
/// Breakeven is the default; the other variants are configuration points.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrailingMode {
    Breakeven,
    Buffer,
    DynamicLock,
}

impl TrailingMode {
    fn from_env_str(s: &str) -> TrailingMode {
        match s {
            "buffer" => TrailingMode::Buffer,
            "dynamic_lock" => TrailingMode::DynamicLock,
            _ => TrailingMode::Breakeven,
        }
    }
}

/// A window during which trading is suppressed (scheduled economic events).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl EventWindow {
    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        at >= self.start && at < self.end
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    // Exchange
    pub symbol: String,
    pub coinbase_api_key: String,
    pub coinbase_api_secret: String,

    // Persistence
    pub database_url: String,

    // Mode
    pub paper_trade: bool,
    pub paper_starting_balance: f64,

    // Risk
    pub risk_per_trade: f64,
    pub max_daily_loss: f64,
    pub max_open_positions: usize,
    pub max_consecutive_losses: usize,
    pub min_account_balance: f64,

    // Scanners
    pub sweep_threshold: f64,
    pub sweep_ttl_hours: i64,
    pub choch_lookback: usize,
    pub fvg_scan_window: usize,
    pub fvg_min_gap_percent: f64,
    pub bos_threshold: f64,

    // Stops & sizing
    pub long_stop_buffer: f64,
    pub short_stop_buffer: f64,
    pub stop_distance_min: f64,
    pub stop_distance_max: f64,
    pub min_rr: f64,

    // Executor
    pub entry_price_tolerance: f64,
    pub entry_fill_timeout_secs: u64,
    pub entry_poll_interval_secs: u64,

    // Monitor
    pub monitor_interval_secs: u64,
    pub max_trade_hours: i64,
    pub trailing_trigger: f64,
    pub trailing_mode: TrailingMode,
    pub trailing_entry_band: f64,

    // Language model
    pub llm_url: String,
    pub llm_model: String,
    pub llm_temperature: f64,
    pub llm_max_tokens: u32,
    pub llm_timeout_secs: u64,
    pub ai_min_confidence: f64,
    pub ai_entry_deviation_max: f64,
    pub ai_size_tolerance: f64,
    pub ai_rr_tolerance: f64,
    pub ai_min_reasoning_len: usize,

    // Market-safety overrides
    pub max_hourly_volatility: f64,
    pub min_volume_ratio: f64,
    pub max_spread: f64,
    pub max_daily_change: f64,
    pub event_windows: Vec<EventWindow>,
    pub price_sanity_min: f64,
    pub price_sanity_max: f64,

    // API rate limits (tokens per second)
    pub public_rate_per_sec: f64,
    pub private_rate_per_sec: f64,
    pub order_rate_per_sec: f64,

    // WebSocket
    pub ws_heartbeat_secs: u64,
    pub ws_max_reconnect_attempts: u32,
    pub ws_backoff_cap_secs: u64,

    // Candle collection & retention
    pub collector_interval_secs: u64,
    pub h4_retention_buckets: usize,
    pub m5_retention_days: i64,

    // Notifications
    pub webhook_url: Option<String>,

    // Logging
    pub log_level: String,
}

impl Config {
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();

        let env = |key: &str, default: &str| -> String {
            std::env::var(key).unwrap_or_else(|_| default.to_string())
        };
        let env_f64 = |key: &str, default: f64| -> f64 {
            std::env::var(key)
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(default)
        };

        Config {
            symbol: env("SYMBOL", "BTC-USD"),
            coinbase_api_key: env("COINBASE_API_KEY", ""),
            coinbase_api_secret: env("COINBASE_API_SECRET", "").replace("\\n", "\n"),
            database_url: env("DATABASE_URL", "sqlite://data/sweep_bot.db"),
            paper_trade: env("PAPER_TRADE", "true").to_lowercase() == "true",
            paper_starting_balance: env_f64("PAPER_STARTING_BALANCE", 10_000.0),
            risk_per_trade: env_f64("RISK_PER_TRADE", 0.01),
            max_daily_loss: env_f64("MAX_DAILY_LOSS", 0.03),
            max_open_positions: 1,
            max_consecutive_losses: 3,
            min_account_balance: env_f64("MIN_ACCOUNT_BALANCE", 100.0),
            sweep_threshold: env_f64("SWEEP_THRESHOLD", 0.001),
            sweep_ttl_hours: 12,
            choch_lookback: 5,
            fvg_scan_window: 20,
            fvg_min_gap_percent: env_f64("FVG_MIN_GAP", 0.001),
            bos_threshold: env_f64("BOS_THRESHOLD", 0.001),
            long_stop_buffer: 0.998,
            short_stop_buffer: 1.003,
            stop_distance_min: 0.005,
            stop_distance_max: 0.03,
            min_rr: 2.0,
            entry_price_tolerance: 0.002,
            entry_fill_timeout_secs: 30,
            entry_poll_interval_secs: 1,
            monitor_interval_secs: env("MONITOR_INTERVAL", "30").parse().unwrap_or(30),
            max_trade_hours: 72,
            trailing_trigger: env_f64("TRAILING_TRIGGER", 0.8),
            trailing_mode: TrailingMode::from_env_str(&env("TRAILING_MODE", "breakeven")),
            trailing_entry_band: 0.005,
            llm_url: env("LLM_URL", "http://localhost:11434/api/generate"),
            llm_model: env("LLM_MODEL", "llama3.1:8b"),
            llm_temperature: env_f64("LLM_TEMPERATURE", 0.2),
            llm_max_tokens: env("LLM_MAX_TOKENS", "512").parse().unwrap_or(512),
            llm_timeout_secs: env("LLM_TIMEOUT", "30").parse().unwrap_or(30),
            ai_min_confidence: 70.0,
            ai_entry_deviation_max: 0.005,
            ai_size_tolerance: 0.05,
            ai_rr_tolerance: 0.1,
            ai_min_reasoning_len: 20,
            max_hourly_volatility: 0.05,
            min_volume_ratio: 0.3,
            max_spread: 0.001,
            max_daily_change: 0.15,
            event_windows: parse_event_windows(&env("EVENT_WINDOWS", "")),
            price_sanity_min: env_f64("PRICE_SANITY_MIN", 1_000.0),
            price_sanity_max: env_f64("PRICE_SANITY_MAX", 1_000_000.0),
            public_rate_per_sec: 10.0,
            private_rate_per_sec: 15.0,
            order_rate_per_sec: 5.0,
            ws_heartbeat_secs: 30,
            ws_max_reconnect_attempts: 10,
            ws_backoff_cap_secs: 60,
            collector_interval_secs: env("COLLECTOR_INTERVAL", "60").parse().unwrap_or(60),
            h4_retention_buckets: 200,
            m5_retention_days: 7,
            webhook_url: std::env::var("WEBHOOK_URL").ok().filter(|s| !s.is_empty()),
            log_level: env("LOG_LEVEL", "info"),
        }
    }

    pub fn shared(self) -> SharedConfig {
        Arc::new(RwLock::new(self))
    }
}

/// Comma-separated `start/end` RFC-3339 pairs, e.g.
/// `2026-08-01T12:00:00Z/2026-08-01T14:00:00Z`. Malformed entries are
/// skipped.
fn parse_event_windows(raw: &str) -> Vec<EventWindow> {
    raw.split(',')
        .filter_map(|pair| {
            let (start, end) = pair.trim().split_once('/')?;
            let start = DateTime::parse_from_rfc3339(start).ok()?.with_timezone(&Utc);
            let end = DateTime::parse_from_rfc3339(end).ok()?.with_timezone(&Utc);
            (start < end).then_some(EventWindow { start, end })
        })
        .collect()
}
