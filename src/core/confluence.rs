use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info};

use crate::models::{Bias, Candle, CandleSeries, ConfluenceState, Phase, Timeframe};
use crate::store::{CandleRepository, ConfluenceRepository, SweepRepository};

/// What a confluence scan pass produced; the scheduler decides follow-up.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfluenceScan {
    /// The state moved to a later non-terminal phase.
    Advanced(Phase),
    /// BOS confirmed; the setup is ready for the trade pipeline.
    SetupReady { state_id: i64 },
    /// The state ran out its window and was expired.
    Expired { state_id: i64 },
    NoChange,
    /// No state is armed.
    Idle,
}

/// The FVG zone between detection and fill, tracked in memory only; the
/// zone bounds are persisted together with the fill.
#[derive(Debug, Clone, Copy)]
struct FvgZone {
    low: f64,
    high: f64,
}

struct ArmedState {
    state: ConfluenceState,
    bias: Bias,
    zone: Option<FvgZone>,
}

/// Drives the single active confluence state through
/// CHoCH -> FVG-fill -> BOS on 5m closes and price ticks. Only one task
/// calls into this engine, which gives transitions their total order; the
/// repository's phase guards back that up at the database.
pub struct ConfluenceEngine {
    candles: CandleRepository,
    states: ConfluenceRepository,
    sweeps: SweepRepository,
    choch_lookback: usize,
    fvg_scan_window: usize,
    fvg_min_gap_percent: f64,
    bos_threshold: f64,
    ttl: Duration,
    armed: Option<ArmedState>,
}

impl ConfluenceEngine {
    pub fn new(
        candles: CandleRepository,
        states: ConfluenceRepository,
        sweeps: SweepRepository,
        choch_lookback: usize,
        fvg_scan_window: usize,
        fvg_min_gap_percent: f64,
        bos_threshold: f64,
        ttl_hours: i64,
    ) -> Self {
        Self {
            candles,
            states,
            sweeps,
            choch_lookback,
            fvg_scan_window,
            fvg_min_gap_percent,
            bos_threshold,
            ttl: Duration::hours(ttl_hours),
            armed: None,
        }
    }

    /// Take over a freshly created or recovered state.
    pub fn arm(&mut self, state: ConfluenceState, bias: Bias) {
        info!(state_id = state.id, phase = %state.phase, bias = %bias, "confluence state armed");
        self.armed = Some(ArmedState {
            state,
            bias,
            zone: None,
        });
    }

    /// Drop the armed state if it matches (used when a new sweep
    /// supersedes the old one).
    pub fn disarm(&mut self, state_id: i64) {
        if self.armed.as_ref().is_some_and(|a| a.state.id == state_id) {
            self.armed = None;
        }
    }

    pub fn armed_state_id(&self) -> Option<i64> {
        self.armed.as_ref().map(|a| a.state.id)
    }

    /// Expire the armed state if its window has elapsed.
    pub async fn check_expiry(&mut self, now: DateTime<Utc>) -> Result<ConfluenceScan> {
        let Some(armed) = &self.armed else {
            return Ok(ConfluenceScan::Idle);
        };
        if now - armed.state.created_at <= self.ttl {
            return Ok(ConfluenceScan::NoChange);
        }

        let state_id = armed.state.id;
        let sweep_id = armed.state.sweep_id;
        self.states.expire(state_id, now).await?;
        self.sweeps.expire(sweep_id).await?;
        self.armed = None;
        info!(state_id, "confluence state expired before completion");
        Ok(ConfluenceScan::Expired { state_id })
    }

    /// Drive the state machine with a freshly closed 5m candle.
    pub async fn on_m5_close(&mut self, candle: &Candle) -> Result<ConfluenceScan> {
        let bucket_end =
            candle.bucket_start + Duration::seconds(Timeframe::M5.as_seconds());
        match self.check_expiry(bucket_end).await? {
            ConfluenceScan::NoChange => {}
            other => return Ok(other),
        }

        let Some(armed) = &mut self.armed else {
            return Ok(ConfluenceScan::Idle);
        };

        match armed.state.phase {
            Phase::WaitingChoch => {
                let series = self
                    .candles
                    .latest(Timeframe::M5, self.choch_lookback + 1)
                    .await?;
                if series.len() < self.choch_lookback + 1 {
                    return Ok(ConfluenceScan::NoChange);
                }
                let prior = series.slice(0, self.choch_lookback);

                let confirmed = match armed.bias {
                    Bias::Bullish => candle.close > prior.highs_max(),
                    Bias::Bearish => candle.close < prior.lows_min(),
                };
                if !confirmed {
                    return Ok(ConfluenceScan::NoChange);
                }

                self.states
                    .record_choch(armed.state.id, candle.close, candle.bucket_start)
                    .await?;
                armed.state.phase = Phase::WaitingFvg;
                armed.state.choch_price = Some(candle.close);
                armed.state.choch_at = Some(candle.bucket_start);
                info!(
                    state_id = armed.state.id,
                    price = candle.close,
                    "CHoCH confirmed"
                );
                Ok(ConfluenceScan::Advanced(Phase::WaitingFvg))
            }
            Phase::WaitingFvg => {
                if armed.zone.is_none() {
                    let series = self
                        .candles
                        .latest(Timeframe::M5, self.fvg_scan_window)
                        .await?;
                    if let Some(zone) =
                        find_fvg(&series, armed.bias, candle.close, self.fvg_min_gap_percent)
                    {
                        debug!(
                            state_id = armed.state.id,
                            low = zone.low,
                            high = zone.high,
                            "FVG zone located"
                        );
                        armed.zone = Some(zone);
                    }
                    // fills are only checked on inputs after detection
                    return Ok(ConfluenceScan::NoChange);
                }
                Self::try_fill(&self.states, armed, candle.close, candle.bucket_start).await
            }
            Phase::WaitingBos => {
                Self::try_bos(&self.states, armed, self.bos_threshold, candle.close, candle.bucket_start)
                    .await
            }
            Phase::Complete | Phase::Expired => Ok(ConfluenceScan::NoChange),
        }
    }

    /// Drive fill/BOS checks with a live price tick. CHoCH and FVG
    /// detection need closed candles and ignore ticks.
    pub async fn on_tick(&mut self, price: f64, at: DateTime<Utc>) -> Result<ConfluenceScan> {
        match self.check_expiry(at).await? {
            ConfluenceScan::NoChange => {}
            other => return Ok(other),
        }

        let Some(armed) = &mut self.armed else {
            return Ok(ConfluenceScan::Idle);
        };

        match armed.state.phase {
            Phase::WaitingFvg if armed.zone.is_some() => {
                Self::try_fill(&self.states, armed, price, at).await
            }
            Phase::WaitingBos => {
                Self::try_bos(&self.states, armed, self.bos_threshold, price, at).await
            }
            _ => Ok(ConfluenceScan::NoChange),
        }
    }

    async fn try_fill(
        states: &ConfluenceRepository,
        armed: &mut ArmedState,
        price: f64,
        at: DateTime<Utc>,
    ) -> Result<ConfluenceScan> {
        let zone = armed.zone.expect("fill checked without a zone");
        if price < zone.low || price > zone.high {
            return Ok(ConfluenceScan::NoChange);
        }

        states
            .record_fvg_fill(armed.state.id, zone.low, zone.high, price, at)
            .await?;
        armed.state.phase = Phase::WaitingBos;
        armed.state.fvg_low = Some(zone.low);
        armed.state.fvg_high = Some(zone.high);
        armed.state.fvg_fill_price = Some(price);
        armed.state.fvg_fill_at = Some(at);
        info!(state_id = armed.state.id, price, "FVG filled");
        Ok(ConfluenceScan::Advanced(Phase::WaitingBos))
    }

    async fn try_bos(
        states: &ConfluenceRepository,
        armed: &mut ArmedState,
        threshold: f64,
        price: f64,
        at: DateTime<Utc>,
    ) -> Result<ConfluenceScan> {
        let choch_price = armed
            .state
            .choch_price
            .expect("waiting_bos without a CHoCH price");

        let confirmed = match armed.bias {
            Bias::Bullish => price > choch_price * (1.0 + threshold),
            Bias::Bearish => price < choch_price * (1.0 - threshold),
        };
        if !confirmed {
            return Ok(ConfluenceScan::NoChange);
        }

        states.record_bos(armed.state.id, price, at).await?;
        let state_id = armed.state.id;
        armed.state.phase = Phase::Complete;
        info!(state_id, price, "BOS confirmed, setup complete");
        Ok(ConfluenceScan::SetupReady { state_id })
    }
}

/// Find the most recent three-candle fair value gap matching the bias.
/// The gap must exceed `min_gap_percent` of the current price.
fn find_fvg(
    series: &CandleSeries,
    bias: Bias,
    current_price: f64,
    min_gap_percent: f64,
) -> Option<FvgZone> {
    let min_gap = current_price * min_gap_percent;
    if series.len() < 3 {
        return None;
    }

    for i in (2..series.len()).rev() {
        let c1 = &series[i - 2];
        let c3 = &series[i];
        match bias {
            Bias::Bullish => {
                let gap = c3.low - c1.high;
                if gap > min_gap {
                    return Some(FvgZone {
                        low: c1.high,
                        high: c3.low,
                    });
                }
            }
            Bias::Bearish => {
                let gap = c1.low - c3.high;
                if gap > min_gap {
                    return Some(FvgZone {
                        low: c3.high,
                        high: c1.low,
                    });
                }
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SwingKind;
    use crate::store::{Database, SweepRepository, SwingRepository};
    use crate::test_helpers::{m5_candle_at, ts};

    struct Fixture {
        engine: ConfluenceEngine,
        candles: CandleRepository,
        states: ConfluenceRepository,
        sweeps: SweepRepository,
        state_id: i64,
    }

    /// Armed bullish state (sweep at t=0) over an in-memory database.
    async fn bullish_fixture() -> Fixture {
        let db = Database::in_memory().await.unwrap();
        let candles = CandleRepository::new(db.clone());
        let states = ConfluenceRepository::new(db.clone());
        let sweeps = SweepRepository::new(db.clone());
        let swings = SwingRepository::new(db);

        let swing = swings
            .record(Timeframe::H4, SwingKind::Low, ts(0), 89_000.0)
            .await
            .unwrap();
        let emitted = sweeps
            .emit(ts(0), SwingKind::Low, 88_910.9, swing.id, 12)
            .await
            .unwrap();

        let mut engine = ConfluenceEngine::new(
            candles.clone(),
            states.clone(),
            sweeps.clone(),
            5,
            20,
            0.001,
            0.001,
            12,
        );
        engine.arm(emitted.state.clone(), emitted.sweep.bias);

        Fixture {
            engine,
            candles,
            states,
            sweeps,
            state_id: emitted.state.id,
        }
    }

    async fn insert_and_close(
        fx: &mut Fixture,
        bucket: i64,
        ohlc: (f64, f64, f64, f64),
    ) -> ConfluenceScan {
        let candle = m5_candle_at(bucket, ohlc.0, ohlc.1, ohlc.2, ohlc.3);
        fx.candles.insert(Timeframe::M5, &candle).await.unwrap();
        fx.engine.on_m5_close(&candle).await.unwrap()
    }

    /// Five quiet candles with highs capped at 89,400 and lows at 89,150.
    async fn seed_quiet_market(fx: &mut Fixture) {
        for i in 0..5 {
            let scan = insert_and_close(
                fx,
                i,
                (89_250.0, 89_400.0, 89_150.0, 89_300.0),
            )
            .await;
            assert_eq!(scan, ConfluenceScan::NoChange);
        }
    }

    #[tokio::test]
    async fn bullish_choch_requires_break_of_prior_highs() {
        let mut fx = bullish_fixture().await;
        seed_quiet_market(&mut fx).await;

        // close below the prior-5 max high: nothing
        let scan = insert_and_close(&mut fx, 5, (89_300.0, 89_380.0, 89_200.0, 89_350.0)).await;
        assert_eq!(scan, ConfluenceScan::NoChange);

        // close at 89,600 above prior max 89,400: CHoCH
        let scan = insert_and_close(&mut fx, 6, (89_350.0, 89_650.0, 89_300.0, 89_600.0)).await;
        assert_eq!(scan, ConfluenceScan::Advanced(Phase::WaitingFvg));

        let state = fx.states.get(fx.state_id).await.unwrap().unwrap();
        assert_eq!(state.choch_price, Some(89_600.0));
    }

    #[tokio::test]
    async fn full_bullish_path_to_setup_ready() {
        let mut fx = bullish_fixture().await;
        seed_quiet_market(&mut fx).await;
        insert_and_close(&mut fx, 5, (89_350.0, 89_650.0, 89_300.0, 89_600.0)).await;

        // three candles leaving a gap: c1.high = 89,200 < c3.low = 89,350
        insert_and_close(&mut fx, 6, (89_150.0, 89_200.0, 89_100.0, 89_180.0)).await;
        insert_and_close(&mut fx, 7, (89_250.0, 89_320.0, 89_240.0, 89_300.0)).await;
        let scan = insert_and_close(&mut fx, 8, (89_360.0, 89_420.0, 89_350.0, 89_400.0)).await;
        // zone detected on this close; fills only count afterwards
        assert_eq!(scan, ConfluenceScan::NoChange);

        // tick into the zone fills it
        let scan = fx.engine.on_tick(89_300.0, ts(8 * 300 + 400)).await.unwrap();
        assert_eq!(scan, ConfluenceScan::Advanced(Phase::WaitingBos));

        // tick beyond choch * 1.001 = 89,689.6 confirms BOS
        let scan = fx.engine.on_tick(89_800.0, ts(8 * 300 + 500)).await.unwrap();
        assert_eq!(
            scan,
            ConfluenceScan::SetupReady {
                state_id: fx.state_id
            }
        );

        let state = fx.states.get(fx.state_id).await.unwrap().unwrap();
        assert_eq!(state.phase, Phase::Complete);
        assert_eq!(state.fvg_low, Some(89_200.0));
        assert_eq!(state.fvg_high, Some(89_350.0));
        assert!(state.times_ordered());
    }

    #[tokio::test]
    async fn bos_not_confirmed_inside_threshold() {
        let mut fx = bullish_fixture().await;
        seed_quiet_market(&mut fx).await;
        insert_and_close(&mut fx, 5, (89_350.0, 89_650.0, 89_300.0, 89_600.0)).await;
        insert_and_close(&mut fx, 6, (89_150.0, 89_200.0, 89_100.0, 89_180.0)).await;
        insert_and_close(&mut fx, 7, (89_250.0, 89_320.0, 89_240.0, 89_300.0)).await;
        insert_and_close(&mut fx, 8, (89_360.0, 89_420.0, 89_350.0, 89_400.0)).await;
        fx.engine.on_tick(89_300.0, ts(8 * 300 + 400)).await.unwrap();

        // above choch but inside the 0.1% band: 89,650 < 89,689.6
        let scan = fx.engine.on_tick(89_650.0, ts(8 * 300 + 500)).await.unwrap();
        assert_eq!(scan, ConfluenceScan::NoChange);
    }

    #[tokio::test]
    async fn state_expires_after_window() {
        let mut fx = bullish_fixture().await;
        seed_quiet_market(&mut fx).await;

        // 12h + a minute after the sweep
        let late = ts(12 * 3600 + 60);
        let scan = fx.engine.on_tick(89_000.0, late).await.unwrap();
        assert_eq!(
            scan,
            ConfluenceScan::Expired {
                state_id: fx.state_id
            }
        );

        let state = fx.states.get(fx.state_id).await.unwrap().unwrap();
        assert_eq!(state.phase, Phase::Expired);
        assert!(fx.sweeps.active().await.unwrap().is_none());
        assert_eq!(fx.engine.armed_state_id(), None);
    }

    #[tokio::test]
    async fn finds_most_recent_gap_only_above_min_size() {
        let series = crate::test_helpers::make_candles(&[
            (100.0, 101.0, 99.0, 100.5),
            (101.0, 102.0, 100.0, 101.5),
            // tiny gap up from candle 0 (c3.low 101.2 vs c1.high 101.0)
            (101.5, 103.0, 101.2, 102.5),
            (102.5, 103.5, 102.0, 103.0),
            // real gap: c1.high 103.0 (idx 2) .. c3.low 105.0 (idx 4)
            (105.5, 107.0, 105.0, 106.5),
        ]);
        let zone = find_fvg(&series, Bias::Bullish, 100.0, 0.001).unwrap();
        assert!((zone.low - 103.0).abs() < 1e-9);
        assert!((zone.high - 105.0).abs() < 1e-9);

        // at a 2% minimum nothing qualifies
        assert!(find_fvg(&series, Bias::Bullish, 100.0, 0.02).is_none());
    }

    #[tokio::test]
    async fn bearish_gap_orientation() {
        let series = crate::test_helpers::make_candles(&[
            (110.0, 115.0, 108.0, 112.0),
            (106.0, 107.0, 103.0, 104.0),
            (100.0, 102.0, 96.0, 98.0),
        ]);
        let zone = find_fvg(&series, Bias::Bearish, 100.0, 0.001).unwrap();
        assert!((zone.low - 102.0).abs() < 1e-9);
        assert!((zone.high - 108.0).abs() < 1e-9);
    }
}
