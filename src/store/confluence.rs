use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, Utc};

use crate::models::{ConfluenceState, Phase};
use crate::store::database::Database;

/// Confluence-state transitions. Every advance is guarded by the current
/// phase in the WHERE clause, so phases only ever move forward, and the
/// stage-time ordering is checked before anything is written.
#[derive(Clone)]
pub struct ConfluenceRepository {
    db: Database,
}

impl ConfluenceRepository {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub async fn get(&self, id: i64) -> Result<Option<ConfluenceState>> {
        let row = sqlx::query_as::<_, StateRow>(&format!(
            "{SELECT_STATE} WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.db.pool)
        .await
        .context("Failed to load confluence state")?;

        row.map(row_to_state).transpose()
    }

    /// All states that are neither complete nor expired, oldest first.
    pub async fn non_terminal(&self) -> Result<Vec<ConfluenceState>> {
        let rows = sqlx::query_as::<_, StateRow>(&format!(
            "{SELECT_STATE} WHERE phase NOT IN ('complete', 'expired') ORDER BY created_at ASC"
        ))
        .fetch_all(&self.db.pool)
        .await
        .context("Failed to query non-terminal states")?;

        rows.into_iter().map(row_to_state).collect()
    }

    /// waiting_choch -> waiting_fvg, recording the confirming close.
    pub async fn record_choch(
        &self,
        id: i64,
        choch_price: f64,
        choch_at: DateTime<Utc>,
    ) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE confluence_states
            SET phase = 'waiting_fvg', choch_price = $2, choch_at = $3, updated_at = $3
            WHERE id = $1 AND phase = 'waiting_choch'
            "#,
        )
        .bind(id)
        .bind(choch_price)
        .bind(choch_at.timestamp())
        .execute(&self.db.pool)
        .await
        .context("Failed to record CHoCH")?;

        if result.rows_affected() != 1 {
            bail!("CHoCH transition rejected for state {id}: phase is not waiting_choch");
        }
        Ok(())
    }

    /// waiting_fvg -> waiting_bos, recording the gap zone and its fill.
    pub async fn record_fvg_fill(
        &self,
        id: i64,
        fvg_low: f64,
        fvg_high: f64,
        fill_price: f64,
        fill_at: DateTime<Utc>,
    ) -> Result<()> {
        let current = self
            .get(id)
            .await?
            .ok_or_else(|| anyhow!("confluence state {id} not found"))?;
        match current.choch_at {
            Some(choch_at) if choch_at <= fill_at => {}
            Some(_) => bail!("FVG fill for state {id} predates its CHoCH"),
            None => bail!("FVG fill for state {id} without a recorded CHoCH"),
        }

        let result = sqlx::query(
            r#"
            UPDATE confluence_states
            SET phase = 'waiting_bos',
                fvg_low = $2, fvg_high = $3, fvg_fill_price = $4, fvg_fill_at = $5,
                updated_at = $5
            WHERE id = $1 AND phase = 'waiting_fvg'
            "#,
        )
        .bind(id)
        .bind(fvg_low)
        .bind(fvg_high)
        .bind(fill_price)
        .bind(fill_at.timestamp())
        .execute(&self.db.pool)
        .await
        .context("Failed to record FVG fill")?;

        if result.rows_affected() != 1 {
            bail!("FVG transition rejected for state {id}: phase is not waiting_fvg");
        }
        Ok(())
    }

    /// waiting_bos -> complete.
    pub async fn record_bos(
        &self,
        id: i64,
        bos_price: f64,
        bos_at: DateTime<Utc>,
    ) -> Result<()> {
        let current = self
            .get(id)
            .await?
            .ok_or_else(|| anyhow!("confluence state {id} not found"))?;
        match current.fvg_fill_at {
            Some(fill_at) if fill_at <= bos_at => {}
            Some(_) => bail!("BOS for state {id} predates its FVG fill"),
            None => bail!("BOS for state {id} without a recorded FVG fill"),
        }

        let result = sqlx::query(
            r#"
            UPDATE confluence_states
            SET phase = 'complete', bos_price = $2, bos_at = $3, updated_at = $3
            WHERE id = $1 AND phase = 'waiting_bos'
            "#,
        )
        .bind(id)
        .bind(bos_price)
        .bind(bos_at.timestamp())
        .execute(&self.db.pool)
        .await
        .context("Failed to record BOS")?;

        if result.rows_affected() != 1 {
            bail!("BOS transition rejected for state {id}: phase is not waiting_bos");
        }
        Ok(())
    }

    /// Expire from any non-terminal phase. Returns whether a row changed.
    pub async fn expire(&self, id: i64, at: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE confluence_states
            SET phase = 'expired', updated_at = $2
            WHERE id = $1 AND phase NOT IN ('complete', 'expired')
            "#,
        )
        .bind(id)
        .bind(at.timestamp())
        .execute(&self.db.pool)
        .await
        .context("Failed to expire confluence state")?;

        Ok(result.rows_affected() == 1)
    }
}

const SELECT_STATE: &str = r#"
    SELECT id, sweep_id, phase, choch_price, choch_at, fvg_low, fvg_high,
           fvg_fill_price, fvg_fill_at, bos_price, bos_at, created_at, updated_at
    FROM confluence_states
"#;

type StateRow = (
    i64,
    i64,
    String,
    Option<f64>,
    Option<i64>,
    Option<f64>,
    Option<f64>,
    Option<f64>,
    Option<i64>,
    Option<f64>,
    Option<i64>,
    i64,
    i64,
);

fn row_to_state(row: StateRow) -> Result<ConfluenceState> {
    let (
        id,
        sweep_id,
        phase,
        choch_price,
        choch_at,
        fvg_low,
        fvg_high,
        fvg_fill_price,
        fvg_fill_at,
        bos_price,
        bos_at,
        created_at,
        updated_at,
    ) = row;

    let to_time = |secs: i64| {
        DateTime::from_timestamp(secs, 0)
            .ok_or_else(|| anyhow!("bad timestamp in confluence_states: {secs}"))
    };

    Ok(ConfluenceState {
        id,
        sweep_id,
        phase: Phase::parse(&phase).ok_or_else(|| anyhow!("unknown phase: {phase}"))?,
        choch_price,
        choch_at: choch_at.map(to_time).transpose()?,
        fvg_low,
        fvg_high,
        fvg_fill_price,
        fvg_fill_at: fvg_fill_at.map(to_time).transpose()?,
        bos_price,
        bos_at: bos_at.map(to_time).transpose()?,
        created_at: to_time(created_at)?,
        updated_at: to_time(updated_at)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{SwingKind, Timeframe};
    use crate::store::sweeps::SweepRepository;
    use crate::store::swings::SwingRepository;
    use crate::test_helpers::ts;

    async fn setup() -> (ConfluenceRepository, i64) {
        let db = Database::in_memory().await.unwrap();
        let swings = SwingRepository::new(db.clone());
        let swing = swings
            .record(Timeframe::H4, SwingKind::Low, ts(0), 89_000.0)
            .await
            .unwrap();
        let emitted = SweepRepository::new(db.clone())
            .emit(ts(100), SwingKind::Low, 88_910.9, swing.id, 12)
            .await
            .unwrap();
        (ConfluenceRepository::new(db), emitted.state.id)
    }

    #[tokio::test]
    async fn full_forward_progression() {
        let (repo, id) = setup().await;

        repo.record_choch(id, 89_600.0, ts(400)).await.unwrap();
        let state = repo.get(id).await.unwrap().unwrap();
        assert_eq!(state.phase, Phase::WaitingFvg);
        assert_eq!(state.choch_price, Some(89_600.0));

        repo.record_fvg_fill(id, 89_200.0, 89_350.0, 89_300.0, ts(700))
            .await
            .unwrap();
        let state = repo.get(id).await.unwrap().unwrap();
        assert_eq!(state.phase, Phase::WaitingBos);

        repo.record_bos(id, 89_800.0, ts(1000)).await.unwrap();
        let state = repo.get(id).await.unwrap().unwrap();
        assert_eq!(state.phase, Phase::Complete);
        assert!(state.times_ordered());
    }

    #[tokio::test]
    async fn phases_never_rewind() {
        let (repo, id) = setup().await;

        repo.record_choch(id, 89_600.0, ts(400)).await.unwrap();
        // a second CHoCH against the advanced state is rejected
        assert!(repo.record_choch(id, 89_700.0, ts(500)).await.is_err());

        // BOS cannot jump the FVG phase
        assert!(repo.record_bos(id, 89_800.0, ts(600)).await.is_err());
    }

    #[tokio::test]
    async fn fill_before_choch_is_rejected() {
        let (repo, id) = setup().await;
        repo.record_choch(id, 89_600.0, ts(400)).await.unwrap();
        let err = repo
            .record_fvg_fill(id, 89_200.0, 89_350.0, 89_300.0, ts(300))
            .await;
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn expire_only_touches_non_terminal() {
        let (repo, id) = setup().await;
        assert!(repo.expire(id, ts(999)).await.unwrap());
        // already expired: second expire is a no-op
        assert!(!repo.expire(id, ts(1000)).await.unwrap());
        let state = repo.get(id).await.unwrap().unwrap();
        assert_eq!(state.phase, Phase::Expired);
    }

    #[tokio::test]
    async fn non_terminal_lists_open_states() {
        let (repo, id) = setup().await;
        let open = repo.non_terminal().await.unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].id, id);

        repo.expire(id, ts(999)).await.unwrap();
        assert!(repo.non_terminal().await.unwrap().is_empty());
    }
}
