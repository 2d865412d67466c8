use anyhow::Result;
use chrono::{DateTime, Utc};
use tracing::info;

use crate::models::{Candle, SwingKind, Timeframe};
use crate::store::{EmittedSweep, SweepRepository, SwingRepository};

/// Scanner result the scheduler branches on; errors travel in the outer
/// Result.
#[derive(Debug, Clone)]
pub enum SweepScan {
    Emitted(EmittedSweep),
    NoChange,
}

/// Watches price against the active 4h swings and emits a sweep when the
/// breach threshold is crossed. Emission is transactional with the
/// creation of the initial confluence state; replaying the same tick
/// never emits twice for the same swing.
pub struct SweepDetector {
    swings: SwingRepository,
    sweeps: SweepRepository,
    threshold: f64,
    ttl_hours: i64,
}

impl SweepDetector {
    pub fn new(
        swings: SwingRepository,
        sweeps: SweepRepository,
        threshold: f64,
        ttl_hours: i64,
    ) -> Self {
        Self {
            swings,
            sweeps,
            threshold,
            ttl_hours,
        }
    }

    /// Evaluate both swing kinds against the given price. At most one
    /// sweep comes out of a single call; a fresh sweep supersedes the
    /// previously active one inside the emit transaction.
    pub async fn check_and_emit(&self, price: f64, at: DateTime<Utc>) -> Result<SweepScan> {
        for kind in [SwingKind::High, SwingKind::Low] {
            let swing = match self.swings.active(Timeframe::H4, kind).await? {
                Some(s) => s,
                None => continue,
            };

            let breached = match kind {
                SwingKind::High => price > swing.price * (1.0 + self.threshold),
                SwingKind::Low => price < swing.price * (1.0 - self.threshold),
            };
            if !breached {
                continue;
            }

            // Already swept this swing: the active sweep owns it.
            if let Some(active) = self.sweeps.active().await? {
                if active.kind == kind && active.swing_level_id == swing.id {
                    continue;
                }
            }

            let emitted = self
                .sweeps
                .emit(at, kind, price, swing.id, self.ttl_hours)
                .await?;
            info!(
                sweep_id = emitted.sweep.id,
                kind = %kind,
                bias = %emitted.sweep.bias,
                price,
                swing_price = swing.price,
                "liquidity sweep detected"
            );
            return Ok(SweepScan::Emitted(emitted));
        }

        Ok(SweepScan::NoChange)
    }

    /// Run once against a freshly closed 4h bucket, using its close as
    /// the probe price and the bucket end as the detection time.
    pub async fn on_h4_close(&self, candle: &Candle) -> Result<SweepScan> {
        let bucket_end = candle.bucket_start
            + chrono::Duration::seconds(Timeframe::H4.as_seconds());
        self.check_and_emit(candle.close, bucket_end).await
    }
}
