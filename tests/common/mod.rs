use chrono::{DateTime, Duration, Utc};

use sweep_bot::models::{Candle, Timeframe};
use sweep_bot::store::{CandleRepository, Database};

/// Fixed test epoch on a 4h boundary.
pub fn base_time() -> DateTime<Utc> {
    DateTime::parse_from_rfc3339("2024-01-15T00:00:00Z")
        .unwrap()
        .with_timezone(&Utc)
}

pub fn ts(secs: i64) -> DateTime<Utc> {
    base_time() + Duration::seconds(secs)
}

pub fn m5_candle(i: i64, open: f64, high: f64, low: f64, close: f64) -> Candle {
    Candle {
        bucket_start: ts(i * 300),
        open,
        high,
        low,
        close,
        volume: 100.0,
    }
}

pub fn h4_candle(i: i64, open: f64, high: f64, low: f64, close: f64) -> Candle {
    Candle {
        bucket_start: ts(i * 14400),
        open,
        high,
        low,
        close,
        volume: 100.0,
    }
}

pub async fn insert_h4(repo: &CandleRepository, data: &[(f64, f64, f64, f64)]) {
    for (i, &(o, h, l, c)) in data.iter().enumerate() {
        repo.insert(Timeframe::H4, &h4_candle(i as i64, o, h, l, c))
            .await
            .unwrap();
    }
}

pub async fn fresh_db() -> Database {
    Database::in_memory().await.unwrap()
}
