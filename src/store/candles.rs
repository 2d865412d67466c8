use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};

use crate::models::{Candle, CandleSeries, Timeframe};
use crate::store::database::Database;

/// Result of attempting to insert a candle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    DuplicateIgnored,
    Invalid,
}

/// Durable candle storage, one table per scanner timeframe. Inserts are
/// idempotent on bucket_start; the OHLCV invariant is enforced on insert.
#[derive(Clone)]
pub struct CandleRepository {
    db: Database,
}

impl CandleRepository {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    fn table(timeframe: Timeframe) -> Result<&'static str> {
        match timeframe {
            Timeframe::M5 => Ok("candles_m5"),
            Timeframe::H4 => Ok("candles_h4"),
            Timeframe::H1 => bail!("1h candles are not stored; resample to 4h first"),
        }
    }

    pub async fn insert(&self, timeframe: Timeframe, candle: &Candle) -> Result<InsertOutcome> {
        if !candle.is_valid() {
            return Ok(InsertOutcome::Invalid);
        }

        let table = Self::table(timeframe)?;
        let result = sqlx::query(&format!(
            r#"
            INSERT OR IGNORE INTO {table} (bucket_start, open, high, low, close, volume)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#
        ))
        .bind(candle.bucket_start.timestamp())
        .bind(candle.open)
        .bind(candle.high)
        .bind(candle.low)
        .bind(candle.close)
        .bind(candle.volume)
        .execute(&self.db.pool)
        .await
        .context("Failed to insert candle")?;

        if result.rows_affected() == 1 {
            Ok(InsertOutcome::Inserted)
        } else {
            Ok(InsertOutcome::DuplicateIgnored)
        }
    }

    /// Candles with bucket_start in [from, to], oldest first.
    pub async fn range(
        &self,
        timeframe: Timeframe,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<CandleSeries> {
        let table = Self::table(timeframe)?;
        let rows = sqlx::query_as::<_, (i64, f64, f64, f64, f64, f64)>(&format!(
            r#"
            SELECT bucket_start, open, high, low, close, volume
            FROM {table}
            WHERE bucket_start >= $1 AND bucket_start <= $2
            ORDER BY bucket_start ASC
            "#
        ))
        .bind(from.timestamp())
        .bind(to.timestamp())
        .fetch_all(&self.db.pool)
        .await
        .context("Failed to query candle range")?;

        Ok(rows_to_series(rows))
    }

    /// The n most recent candles, oldest first.
    pub async fn latest(&self, timeframe: Timeframe, n: usize) -> Result<CandleSeries> {
        let table = Self::table(timeframe)?;
        let mut rows = sqlx::query_as::<_, (i64, f64, f64, f64, f64, f64)>(&format!(
            r#"
            SELECT bucket_start, open, high, low, close, volume
            FROM {table}
            ORDER BY bucket_start DESC
            LIMIT $1
            "#
        ))
        .bind(n as i64)
        .fetch_all(&self.db.pool)
        .await
        .context("Failed to query latest candles")?;

        rows.reverse();
        Ok(rows_to_series(rows))
    }

    /// Bucket starts missing from the trailing `window` buckets, measured
    /// back from the newest stored candle.
    pub async fn detect_gaps(
        &self,
        timeframe: Timeframe,
        window: usize,
    ) -> Result<Vec<DateTime<Utc>>> {
        let stored = self.latest(timeframe, window).await?;
        let newest = match stored.last() {
            Some(c) => c.bucket_start.timestamp(),
            None => return Ok(Vec::new()),
        };

        let step = timeframe.as_seconds();
        let present: std::collections::HashSet<i64> =
            stored.iter().map(|c| c.bucket_start.timestamp()).collect();

        let mut missing = Vec::new();
        for i in 0..window as i64 {
            let bucket = newest - i * step;
            if !present.contains(&bucket) {
                if let Some(ts) = DateTime::from_timestamp(bucket, 0) {
                    missing.push(ts);
                }
            }
        }
        missing.reverse();
        Ok(missing)
    }

    /// Delete candles older than the cutoff. Returns rows removed.
    pub async fn prune(&self, timeframe: Timeframe, older_than: DateTime<Utc>) -> Result<u64> {
        let table = Self::table(timeframe)?;
        let result = sqlx::query(&format!(
            "DELETE FROM {table} WHERE bucket_start < $1"
        ))
        .bind(older_than.timestamp())
        .execute(&self.db.pool)
        .await
        .context("Failed to prune candles")?;
        Ok(result.rows_affected())
    }
}

fn rows_to_series(rows: Vec<(i64, f64, f64, f64, f64, f64)>) -> CandleSeries {
    let candles: Vec<Candle> = rows
        .into_iter()
        .filter_map(|(ts, open, high, low, close, volume)| {
            Some(Candle {
                bucket_start: DateTime::from_timestamp(ts, 0)?,
                open,
                high,
                low,
                close,
                volume,
            })
        })
        .collect();
    CandleSeries::new(candles)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::candle_at;

    async fn repo() -> CandleRepository {
        CandleRepository::new(Database::in_memory().await.unwrap())
    }

    #[tokio::test]
    async fn insert_is_idempotent() {
        let repo = repo().await;
        let c = candle_at(0, 100.0, 105.0, 95.0, 102.0);

        assert_eq!(
            repo.insert(Timeframe::M5, &c).await.unwrap(),
            InsertOutcome::Inserted
        );
        assert_eq!(
            repo.insert(Timeframe::M5, &c).await.unwrap(),
            InsertOutcome::DuplicateIgnored
        );

        let stored = repo.latest(Timeframe::M5, 10).await.unwrap();
        assert_eq!(stored.len(), 1);
    }

    #[tokio::test]
    async fn insert_rejects_malformed_ohlcv() {
        let repo = repo().await;
        // low above the body
        let c = candle_at(0, 100.0, 105.0, 101.0, 102.0);
        assert_eq!(
            repo.insert(Timeframe::M5, &c).await.unwrap(),
            InsertOutcome::Invalid
        );
        assert!(repo.latest(Timeframe::M5, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn latest_returns_ascending_order() {
        let repo = repo().await;
        for i in 0..5 {
            let c = candle_at(i, 100.0 + i as f64, 105.0 + i as f64, 95.0, 102.0 + i as f64);
            repo.insert(Timeframe::M5, &c).await.unwrap();
        }
        let latest = repo.latest(Timeframe::M5, 3).await.unwrap();
        assert_eq!(latest.len(), 3);
        assert!(latest[0].bucket_start < latest[1].bucket_start);
        assert!(latest[1].bucket_start < latest[2].bucket_start);
        // newest three of the five
        assert!((latest[0].open - 102.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn detects_missing_buckets() {
        let repo = repo().await;
        for i in [0, 1, 3, 4] {
            repo.insert(Timeframe::M5, &candle_at(i, 100.0, 105.0, 95.0, 102.0))
                .await
                .unwrap();
        }
        let gaps = repo.detect_gaps(Timeframe::M5, 5).await.unwrap();
        assert_eq!(gaps.len(), 1);
        // bucket index 2 is the hole
        assert_eq!(
            gaps[0],
            candle_at(2, 100.0, 105.0, 95.0, 102.0).bucket_start
        );
    }

    #[tokio::test]
    async fn prune_removes_old_rows() {
        let repo = repo().await;
        for i in 0..4 {
            repo.insert(Timeframe::M5, &candle_at(i, 100.0, 105.0, 95.0, 102.0))
                .await
                .unwrap();
        }
        let cutoff = candle_at(2, 100.0, 105.0, 95.0, 102.0).bucket_start;
        let removed = repo.prune(Timeframe::M5, cutoff).await.unwrap();
        assert_eq!(removed, 2);
        assert_eq!(repo.latest(Timeframe::M5, 10).await.unwrap().len(), 2);
    }
}
