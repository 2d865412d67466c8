use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Duration, Utc};

use crate::models::{Bias, ConfluenceState, Phase, Sweep, SwingKind};
use crate::store::database::Database;

/// A sweep plus the confluence state created with it, and any states
/// expired by the supersession.
#[derive(Debug, Clone)]
pub struct EmittedSweep {
    pub sweep: Sweep,
    pub state: ConfluenceState,
    pub superseded_state_ids: Vec<i64>,
}

/// Sweep lifecycle. A sweep and its initial confluence state are created
/// in one transaction; at most one sweep is active at a time, so the same
/// transaction expires whatever was active before.
#[derive(Clone)]
pub struct SweepRepository {
    db: Database,
}

impl SweepRepository {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub async fn emit(
        &self,
        detected_at: DateTime<Utc>,
        kind: SwingKind,
        price_at_detection: f64,
        swing_level_id: i64,
        ttl_hours: i64,
    ) -> Result<EmittedSweep> {
        let bias = Bias::from_sweep_kind(kind);
        let expires_at = detected_at + Duration::hours(ttl_hours);

        let mut tx = self.db.pool.begin().await?;

        // Supersede the currently active sweep and expire its state.
        let superseded: Vec<(i64,)> = sqlx::query_as(
            r#"
            SELECT cs.id
            FROM confluence_states cs
            JOIN sweeps s ON s.id = cs.sweep_id
            WHERE s.active = 1 AND cs.phase NOT IN ('complete', 'expired')
            "#,
        )
        .fetch_all(&mut *tx)
        .await
        .context("Failed to find superseded states")?;

        let superseded_state_ids: Vec<i64> = superseded.into_iter().map(|(id,)| id).collect();

        if !superseded_state_ids.is_empty() {
            sqlx::query(
                r#"
                UPDATE confluence_states
                SET phase = 'expired', updated_at = $1
                WHERE sweep_id IN (SELECT id FROM sweeps WHERE active = 1)
                  AND phase NOT IN ('complete', 'expired')
                "#,
            )
            .bind(detected_at.timestamp())
            .execute(&mut *tx)
            .await
            .context("Failed to expire superseded states")?;
        }

        sqlx::query(
            r#"
            UPDATE sweeps
            SET active = 0, updated_at = strftime('%s', 'now')
            WHERE active = 1
            "#,
        )
        .execute(&mut *tx)
        .await
        .context("Failed to deactivate prior sweeps")?;

        let sweep_result = sqlx::query(
            r#"
            INSERT INTO sweeps (detected_at, kind, price_at_detection, swing_level_id, bias, active, expires_at)
            VALUES ($1, $2, $3, $4, $5, 1, $6)
            "#,
        )
        .bind(detected_at.timestamp())
        .bind(kind.as_str())
        .bind(price_at_detection)
        .bind(swing_level_id)
        .bind(bias.as_str())
        .bind(expires_at.timestamp())
        .execute(&mut *tx)
        .await
        .context("Failed to insert sweep")?;

        let sweep_id = sweep_result.last_insert_rowid();

        let state_result = sqlx::query(
            r#"
            INSERT INTO confluence_states (sweep_id, phase, created_at, updated_at)
            VALUES ($1, 'waiting_choch', $2, $2)
            "#,
        )
        .bind(sweep_id)
        .bind(detected_at.timestamp())
        .execute(&mut *tx)
        .await
        .context("Failed to insert confluence state")?;

        tx.commit().await?;

        let sweep = Sweep {
            id: sweep_id,
            detected_at,
            kind,
            price_at_detection,
            swing_level_id,
            bias,
            active: true,
            expires_at,
        };
        let state = ConfluenceState {
            id: state_result.last_insert_rowid(),
            sweep_id,
            phase: Phase::WaitingChoch,
            choch_price: None,
            choch_at: None,
            fvg_low: None,
            fvg_high: None,
            fvg_fill_price: None,
            fvg_fill_at: None,
            bos_price: None,
            bos_at: None,
            created_at: detected_at,
            updated_at: detected_at,
        };

        Ok(EmittedSweep {
            sweep,
            state,
            superseded_state_ids,
        })
    }

    pub async fn active(&self) -> Result<Option<Sweep>> {
        let row = sqlx::query_as::<_, SweepRow>(
            r#"
            SELECT id, detected_at, kind, price_at_detection, swing_level_id, bias, active, expires_at
            FROM sweeps
            WHERE active = 1
            ORDER BY detected_at DESC
            LIMIT 1
            "#,
        )
        .fetch_optional(&self.db.pool)
        .await
        .context("Failed to query active sweep")?;

        row.map(row_to_sweep).transpose()
    }

    pub async fn get(&self, id: i64) -> Result<Option<Sweep>> {
        let row = sqlx::query_as::<_, SweepRow>(
            r#"
            SELECT id, detected_at, kind, price_at_detection, swing_level_id, bias, active, expires_at
            FROM sweeps
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.db.pool)
        .await
        .context("Failed to load sweep")?;

        row.map(row_to_sweep).transpose()
    }

    /// Deactivate a sweep that ran out its TTL.
    pub async fn expire(&self, id: i64) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE sweeps
            SET active = 0, updated_at = strftime('%s', 'now')
            WHERE id = $1
            "#,
        )
        .bind(id)
        .execute(&self.db.pool)
        .await
        .context("Failed to expire sweep")?;
        Ok(())
    }
}

type SweepRow = (i64, i64, String, f64, i64, String, i64, i64);

fn row_to_sweep(row: SweepRow) -> Result<Sweep> {
    let (id, detected_at, kind, price_at_detection, swing_level_id, bias, active, expires_at) = row;
    Ok(Sweep {
        id,
        detected_at: DateTime::from_timestamp(detected_at, 0)
            .ok_or_else(|| anyhow!("bad detected_at in sweeps: {detected_at}"))?,
        kind: SwingKind::parse(&kind).ok_or_else(|| anyhow!("unknown sweep kind: {kind}"))?,
        price_at_detection,
        swing_level_id,
        bias: Bias::parse(&bias).ok_or_else(|| anyhow!("unknown sweep bias: {bias}"))?,
        active: active != 0,
        expires_at: DateTime::from_timestamp(expires_at, 0)
            .ok_or_else(|| anyhow!("bad expires_at in sweeps: {expires_at}"))?,
    })
}
