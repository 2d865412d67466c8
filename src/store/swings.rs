use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};

use crate::models::{SwingKind, SwingLevel, Timeframe};
use crate::store::database::Database;

/// Swing-level lifecycle: confirmed swings are inserted active and the
/// prior active swing of the same (timeframe, kind) is superseded in the
/// same transaction. Rows are never deleted.
#[derive(Clone)]
pub struct SwingRepository {
    db: Database,
}

impl SwingRepository {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub async fn record(
        &self,
        timeframe: Timeframe,
        kind: SwingKind,
        bucket_start: DateTime<Utc>,
        price: f64,
    ) -> Result<SwingLevel> {
        let mut tx = self.db.pool.begin().await?;

        sqlx::query(
            r#"
            UPDATE swing_levels
            SET active = 0, updated_at = strftime('%s', 'now')
            WHERE timeframe = $1 AND kind = $2 AND active = 1
            "#,
        )
        .bind(timeframe.as_str())
        .bind(kind.as_str())
        .execute(&mut *tx)
        .await
        .context("Failed to supersede prior swing")?;

        let result = sqlx::query(
            r#"
            INSERT INTO swing_levels (timeframe, kind, bucket_start, price, active)
            VALUES ($1, $2, $3, $4, 1)
            "#,
        )
        .bind(timeframe.as_str())
        .bind(kind.as_str())
        .bind(bucket_start.timestamp())
        .bind(price)
        .execute(&mut *tx)
        .await
        .context("Failed to insert swing level")?;

        tx.commit().await?;

        Ok(SwingLevel {
            id: result.last_insert_rowid(),
            timeframe,
            kind,
            bucket_start,
            price,
            active: true,
        })
    }

    pub async fn active(
        &self,
        timeframe: Timeframe,
        kind: SwingKind,
    ) -> Result<Option<SwingLevel>> {
        let row = sqlx::query_as::<_, (i64, String, String, i64, f64, i64)>(
            r#"
            SELECT id, timeframe, kind, bucket_start, price, active
            FROM swing_levels
            WHERE timeframe = $1 AND kind = $2 AND active = 1
            ORDER BY bucket_start DESC
            LIMIT 1
            "#,
        )
        .bind(timeframe.as_str())
        .bind(kind.as_str())
        .fetch_optional(&self.db.pool)
        .await
        .context("Failed to query active swing")?;

        row.map(row_to_swing).transpose()
    }

    pub async fn get(&self, id: i64) -> Result<Option<SwingLevel>> {
        let row = sqlx::query_as::<_, (i64, String, String, i64, f64, i64)>(
            r#"
            SELECT id, timeframe, kind, bucket_start, price, active
            FROM swing_levels
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.db.pool)
        .await
        .context("Failed to load swing level")?;

        row.map(row_to_swing).transpose()
    }
}

fn row_to_swing(row: (i64, String, String, i64, f64, i64)) -> Result<SwingLevel> {
    let (id, timeframe, kind, bucket_start, price, active) = row;
    Ok(SwingLevel {
        id,
        timeframe: Timeframe::from_str_loose(&timeframe)
            .ok_or_else(|| anyhow!("unknown timeframe in swing_levels: {timeframe}"))?,
        kind: SwingKind::parse(&kind)
            .ok_or_else(|| anyhow!("unknown swing kind in swing_levels: {kind}"))?,
        bucket_start: DateTime::from_timestamp(bucket_start, 0)
            .ok_or_else(|| anyhow!("bad bucket_start in swing_levels: {bucket_start}"))?,
        price,
        active: active != 0,
    })
}
