use anyhow::Result;
use tracing::info;

use crate::models::{SwingKind, SwingLevel, Timeframe};
use crate::store::{CandleRepository, SwingRepository};

/// Detects three-candle swing highs/lows on newly closed candles. The
/// candidate candle sits two closed candles back, so both neighbours at
/// distance two are confirmed before a swing is recorded.
pub struct SwingTracker {
    candles: CandleRepository,
    swings: SwingRepository,
}

impl SwingTracker {
    pub fn new(candles: CandleRepository, swings: SwingRepository) -> Self {
        Self { candles, swings }
    }

    /// Run after a candle close on `timeframe`. Returns any swings this
    /// close confirmed (a candle can confirm a high and a low at once).
    pub async fn on_candle_close(&self, timeframe: Timeframe) -> Result<Vec<SwingLevel>> {
        let window = self.candles.latest(timeframe, 5).await?;
        if window.len() < 5 {
            return Ok(Vec::new());
        }

        // center candle, with window[0] and window[4] as its confirmed
        // distance-two neighbours
        let center = &window[2];
        let mut confirmed = Vec::new();

        if center.high > window[0].high && center.high > window[4].high {
            let swing = self
                .swings
                .record(timeframe, SwingKind::High, center.bucket_start, center.high)
                .await?;
            info!(
                timeframe = %timeframe,
                price = swing.price,
                bucket = %swing.bucket_start,
                "swing high confirmed"
            );
            confirmed.push(swing);
        }

        if center.low < window[0].low && center.low < window[4].low {
            let swing = self
                .swings
                .record(timeframe, SwingKind::Low, center.bucket_start, center.low)
                .await?;
            info!(
                timeframe = %timeframe,
                price = swing.price,
                bucket = %swing.bucket_start,
                "swing low confirmed"
            );
            confirmed.push(swing);
        }

        Ok(confirmed)
    }
}
