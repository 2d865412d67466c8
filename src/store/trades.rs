use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

use crate::models::{Direction, StopSource, Trade, TradeOutcome, TradeStatus};
use crate::store::database::Database;

/// Fields required to open a trade. The executor fills this in only after
/// all three exchange orders are live.
#[derive(Debug, Clone)]
pub struct NewTrade {
    pub confluence_state_id: i64,
    pub direction: Direction,
    pub entry_price: f64,
    pub entry_at: DateTime<Utc>,
    pub size_base: f64,
    pub size_quote: f64,
    pub stop_price: f64,
    pub stop_source: StopSource,
    pub take_profit: f64,
    pub rr_ratio: f64,
    pub entry_order_id: String,
    pub stop_order_id: String,
    pub tp_order_id: String,
    pub ai_confidence: f64,
    pub ai_reasoning: String,
}

#[derive(Clone)]
pub struct TradeRepository {
    db: Database,
}

impl TradeRepository {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub async fn insert_open(&self, new: &NewTrade) -> Result<i64> {
        let result = sqlx::query(
            r#"
            INSERT INTO trades (
                confluence_state_id, direction, entry_price, entry_at,
                size_base, size_quote, stop_price, stop_source, take_profit, rr_ratio,
                entry_order_id, stop_order_id, tp_order_id,
                status, ai_confidence, ai_reasoning
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, 'open', $14, $15)
            "#,
        )
        .bind(new.confluence_state_id)
        .bind(new.direction.as_str())
        .bind(new.entry_price)
        .bind(new.entry_at.timestamp())
        .bind(new.size_base)
        .bind(new.size_quote)
        .bind(new.stop_price)
        .bind(new.stop_source.as_str())
        .bind(new.take_profit)
        .bind(new.rr_ratio)
        .bind(&new.entry_order_id)
        .bind(&new.stop_order_id)
        .bind(&new.tp_order_id)
        .bind(new.ai_confidence)
        .bind(&new.ai_reasoning)
        .execute(&self.db.pool)
        .await
        .context("Failed to insert trade")?;

        Ok(result.last_insert_rowid())
    }

    pub async fn get(&self, id: i64) -> Result<Option<Trade>> {
        let row = sqlx::query(&format!("{SELECT_TRADE} WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.db.pool)
            .await
            .context("Failed to load trade")?;

        row.map(|r| row_to_trade(&r)).transpose()
    }

    pub async fn open_trades(&self) -> Result<Vec<Trade>> {
        let rows = sqlx::query(&format!(
            "{SELECT_TRADE} WHERE status = 'open' ORDER BY entry_at ASC"
        ))
        .fetch_all(&self.db.pool)
        .await
        .context("Failed to query open trades")?;

        rows.iter().map(row_to_trade).collect()
    }

    pub async fn open_count(&self) -> Result<usize> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM trades WHERE status = 'open'")
                .fetch_one(&self.db.pool)
                .await
                .context("Failed to count open trades")?;
        Ok(count as usize)
    }

    /// One-shot OPEN -> CLOSED transition. The conditional update makes a
    /// second close attempt a no-op; returns whether this call closed it.
    pub async fn close(
        &self,
        id: i64,
        outcome: TradeOutcome,
        exit_price: f64,
        exit_at: DateTime<Utc>,
        pnl_quote: f64,
        pnl_percent: f64,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE trades
            SET status = 'closed', outcome = $2, exit_price = $3, exit_at = $4,
                pnl_quote = $5, pnl_percent = $6, updated_at = strftime('%s', 'now')
            WHERE id = $1 AND status = 'open'
            "#,
        )
        .bind(id)
        .bind(outcome.as_str())
        .bind(exit_price)
        .bind(exit_at.timestamp())
        .bind(pnl_quote)
        .bind(pnl_percent)
        .execute(&self.db.pool)
        .await
        .context("Failed to close trade")?;

        Ok(result.rows_affected() == 1)
    }

    /// Record the one-shot trailing promotion: the replaced stop order id
    /// and the new stop level.
    pub async fn mark_trailing(
        &self,
        id: i64,
        trailing_price: f64,
        new_stop_order_id: &str,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE trades
            SET trailing_activated = 1, trailing_price = $2, stop_price = $2,
                stop_order_id = $3, updated_at = strftime('%s', 'now')
            WHERE id = $1 AND status = 'open' AND trailing_activated = 0
            "#,
        )
        .bind(id)
        .bind(trailing_price)
        .bind(new_stop_order_id)
        .execute(&self.db.pool)
        .await
        .context("Failed to mark trailing stop")?;

        Ok(result.rows_affected() == 1)
    }

    /// Point the trade at a replacement stop order without touching the
    /// trailing flag (used when a failed promotion reinstates the
    /// original stop at its old price).
    pub async fn update_stop_order(&self, id: i64, stop_order_id: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE trades
            SET stop_order_id = $2, updated_at = strftime('%s', 'now')
            WHERE id = $1 AND status = 'open'
            "#,
        )
        .bind(id)
        .bind(stop_order_id)
        .execute(&self.db.pool)
        .await
        .context("Failed to update stop order id")?;
        Ok(())
    }

    /// Latest unrealized P&L for the dashboard row. Overwritten each poll.
    pub async fn update_unrealized(&self, id: i64, pnl_quote: f64, pnl_percent: f64) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE trades
            SET pnl_quote = $2, pnl_percent = $3, updated_at = strftime('%s', 'now')
            WHERE id = $1 AND status = 'open'
            "#,
        )
        .bind(id)
        .bind(pnl_quote)
        .bind(pnl_percent)
        .execute(&self.db.pool)
        .await
        .context("Failed to update unrealized P&L")?;
        Ok(())
    }

    /// Sum of realized P&L across trades closed at or after the cutoff.
    pub async fn realized_pnl_since(&self, since: DateTime<Utc>) -> Result<f64> {
        let (total,): (Option<f64>,) = sqlx::query_as(
            r#"
            SELECT SUM(pnl_quote)
            FROM trades
            WHERE status = 'closed' AND exit_at >= $1
            "#,
        )
        .bind(since.timestamp())
        .fetch_one(&self.db.pool)
        .await
        .context("Failed to sum realized P&L")?;
        Ok(total.unwrap_or(0.0))
    }

    /// Length of the trailing run of losses among closed trades, newest
    /// first. A win or breakeven breaks the run.
    pub async fn consecutive_losses(&self) -> Result<usize> {
        let rows: Vec<(String,)> = sqlx::query_as(
            r#"
            SELECT outcome
            FROM trades
            WHERE status = 'closed' AND outcome IS NOT NULL
            ORDER BY exit_at DESC
            LIMIT 20
            "#,
        )
        .fetch_all(&self.db.pool)
        .await
        .context("Failed to query trade outcomes")?;

        Ok(rows
            .iter()
            .take_while(|(outcome,)| outcome == "loss")
            .count())
    }
}

const SELECT_TRADE: &str = r#"
    SELECT id, confluence_state_id, direction, entry_price, entry_at,
           size_base, size_quote, stop_price, stop_source, take_profit, rr_ratio,
           entry_order_id, stop_order_id, tp_order_id,
           status, outcome, exit_price, exit_at, pnl_quote, pnl_percent,
           trailing_activated, trailing_price, ai_confidence, ai_reasoning
    FROM trades
"#;

fn row_to_trade(row: &SqliteRow) -> Result<Trade> {
    let direction: String = row.try_get("direction")?;
    let stop_source: String = row.try_get("stop_source")?;
    let status: String = row.try_get("status")?;
    let outcome: Option<String> = row.try_get("outcome")?;
    let entry_at: i64 = row.try_get("entry_at")?;
    let exit_at: Option<i64> = row.try_get("exit_at")?;
    let trailing_activated: i64 = row.try_get("trailing_activated")?;

    let to_time = |secs: i64| {
        DateTime::from_timestamp(secs, 0)
            .ok_or_else(|| anyhow!("bad timestamp in trades: {secs}"))
    };

    Ok(Trade {
        id: row.try_get("id")?,
        confluence_state_id: row.try_get("confluence_state_id")?,
        direction: Direction::parse(&direction)
            .ok_or_else(|| anyhow!("unknown trade direction: {direction}"))?,
        entry_price: row.try_get("entry_price")?,
        entry_at: to_time(entry_at)?,
        size_base: row.try_get("size_base")?,
        size_quote: row.try_get("size_quote")?,
        stop_price: row.try_get("stop_price")?,
        stop_source: StopSource::parse(&stop_source)
            .ok_or_else(|| anyhow!("unknown stop source: {stop_source}"))?,
        take_profit: row.try_get("take_profit")?,
        rr_ratio: row.try_get("rr_ratio")?,
        entry_order_id: row.try_get("entry_order_id")?,
        stop_order_id: row.try_get("stop_order_id")?,
        tp_order_id: row.try_get("tp_order_id")?,
        status: TradeStatus::parse(&status)
            .ok_or_else(|| anyhow!("unknown trade status: {status}"))?,
        outcome: outcome
            .map(|o| TradeOutcome::parse(&o).ok_or_else(|| anyhow!("unknown outcome: {o}")))
            .transpose()?,
        exit_price: row.try_get("exit_price")?,
        exit_at: exit_at.map(to_time).transpose()?,
        pnl_quote: row.try_get("pnl_quote")?,
        pnl_percent: row.try_get("pnl_percent")?,
        trailing_activated: trailing_activated != 0,
        trailing_price: row.try_get("trailing_price")?,
        ai_confidence: row.try_get("ai_confidence")?,
        ai_reasoning: row.try_get("ai_reasoning")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::{seed_confluence_state, ts};

    async fn setup() -> (TradeRepository, i64) {
        let db = Database::in_memory().await.unwrap();
        let state_id = seed_confluence_state(&db).await;
        (TradeRepository::new(db), state_id)
    }

    fn new_trade(state_id: i64) -> NewTrade {
        NewTrade {
            confluence_state_id: state_id,
            direction: Direction::Long,
            entry_price: 90_000.0,
            entry_at: ts(1000),
            size_base: 0.09275,
            size_quote: 8_347.5,
            stop_price: 88_921.8,
            stop_source: StopSource::M5,
            take_profit: 92_156.4,
            rr_ratio: 2.0,
            entry_order_id: "entry-1".into(),
            stop_order_id: "stop-1".into(),
            tp_order_id: "tp-1".into(),
            ai_confidence: 85.0,
            ai_reasoning: "bullish sweep confluence with clean displacement".into(),
        }
    }

    #[tokio::test]
    async fn insert_and_load_round_trip() {
        let (repo, state_id) = setup().await;
        let id = repo.insert_open(&new_trade(state_id)).await.unwrap();

        let trade = repo.get(id).await.unwrap().unwrap();
        assert_eq!(trade.status, TradeStatus::Open);
        assert_eq!(trade.direction, Direction::Long);
        assert_eq!(trade.stop_source, StopSource::M5);
        assert!(trade.outcome.is_none());
        assert!(!trade.trailing_activated);
        assert_eq!(repo.open_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn close_happens_exactly_once() {
        let (repo, state_id) = setup().await;
        let id = repo.insert_open(&new_trade(state_id)).await.unwrap();

        let first = repo
            .close(id, TradeOutcome::Win, 92_156.4, ts(5000), 200.0, 2.4)
            .await
            .unwrap();
        assert!(first);

        let second = repo
            .close(id, TradeOutcome::Loss, 88_921.8, ts(6000), -100.0, -1.2)
            .await
            .unwrap();
        assert!(!second, "second close must be a no-op");

        let trade = repo.get(id).await.unwrap().unwrap();
        assert_eq!(trade.outcome, Some(TradeOutcome::Win));
        assert_eq!(repo.open_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn trailing_promotion_is_one_shot() {
        let (repo, state_id) = setup().await;
        let id = repo.insert_open(&new_trade(state_id)).await.unwrap();

        assert!(repo.mark_trailing(id, 90_000.0, "stop-2").await.unwrap());
        assert!(!repo.mark_trailing(id, 90_500.0, "stop-3").await.unwrap());

        let trade = repo.get(id).await.unwrap().unwrap();
        assert!(trade.trailing_activated);
        assert_eq!(trade.trailing_price, Some(90_000.0));
        assert_eq!(trade.stop_order_id, "stop-2");
        assert!((trade.stop_price - 90_000.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn daily_pnl_and_loss_streak() {
        let (repo, state_id) = setup().await;

        for (i, (outcome, pnl)) in [
            (TradeOutcome::Win, 120.0),
            (TradeOutcome::Loss, -60.0),
            (TradeOutcome::Loss, -55.0),
        ]
        .iter()
        .enumerate()
        {
            let id = repo.insert_open(&new_trade(state_id)).await.unwrap();
            repo.close(id, *outcome, 90_000.0, ts(1000 + i as i64 * 100), *pnl, 0.0)
                .await
                .unwrap();
        }

        let total = repo.realized_pnl_since(ts(0)).await.unwrap();
        assert!((total - 5.0).abs() < 1e-9);

        // newest two closes are losses, the win before them breaks the run
        assert_eq!(repo.consecutive_losses().await.unwrap(), 2);

        // a cutoff after the first close excludes the win
        let later = repo.realized_pnl_since(ts(1050)).await.unwrap();
        assert!((later + 115.0).abs() < 1e-9);
    }
}
