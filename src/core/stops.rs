use anyhow::Result;
use tracing::debug;

use crate::models::{Direction, StopSource, SwingKind, SwingStop, Timeframe};
use crate::store::SwingRepository;

/// Position size derived from the accepted stop.
#[derive(Debug, Clone, Copy)]
pub struct PositionSize {
    pub size_base: f64,
    pub size_quote: f64,
    pub risk_quote: f64,
}

/// Computes swing-based stops with a fixed reward:risk floor. The 5m
/// swing is preferred; the 4h swing is the fallback. A setup with no
/// candidate inside the distance band is rejected outright.
pub struct StopPlanner {
    swings: SwingRepository,
    long_buffer: f64,
    short_buffer: f64,
    distance_min: f64,
    distance_max: f64,
    rr_multiple: f64,
    risk_fraction: f64,
}

impl StopPlanner {
    pub fn new(
        swings: SwingRepository,
        long_buffer: f64,
        short_buffer: f64,
        distance_min: f64,
        distance_max: f64,
        rr_multiple: f64,
        risk_fraction: f64,
    ) -> Self {
        Self {
            swings,
            long_buffer,
            short_buffer,
            distance_min,
            distance_max,
            rr_multiple,
            risk_fraction,
        }
    }

    /// Swing-based stop for the expected entry, or None when neither the
    /// 5m nor the 4h swing yields a stop inside the distance band.
    pub async fn plan(&self, entry: f64, direction: Direction) -> Result<Option<SwingStop>> {
        let kind = match direction {
            Direction::Long => SwingKind::Low,
            Direction::Short => SwingKind::High,
        };

        for (timeframe, source) in [
            (Timeframe::M5, StopSource::M5),
            (Timeframe::H4, StopSource::H4),
        ] {
            let Some(swing) = self.swings.active(timeframe, kind).await? else {
                continue;
            };

            if let Some(stop) = self.candidate(entry, direction, swing.price, source) {
                return Ok(Some(stop));
            }
            debug!(
                timeframe = %timeframe,
                swing_price = swing.price,
                entry,
                "stop candidate rejected"
            );
        }

        Ok(None)
    }

    fn candidate(
        &self,
        entry: f64,
        direction: Direction,
        swing_price: f64,
        source: StopSource,
    ) -> Option<SwingStop> {
        let (stop, correct_side) = match direction {
            Direction::Long => {
                let stop = swing_price * self.long_buffer;
                (stop, stop < entry)
            }
            Direction::Short => {
                let stop = swing_price * self.short_buffer;
                (stop, stop > entry)
            }
        };
        if !correct_side {
            return None;
        }

        let distance = (entry - stop).abs() / entry;
        if distance < self.distance_min || distance > self.distance_max {
            return None;
        }

        let reward = self.rr_multiple * (entry - stop).abs();
        let minimum_take_profit = match direction {
            Direction::Long => entry + reward,
            Direction::Short => entry - reward,
        };

        Some(SwingStop {
            price: stop,
            source,
            swing_price,
            distance_percent: distance * 100.0,
            minimum_take_profit,
        })
    }

    /// Fixed-fraction sizing: risk a set slice of the balance across the
    /// entry-to-stop distance.
    pub fn position_size(&self, balance: f64, entry: f64, stop: f64) -> PositionSize {
        let risk_quote = balance * self.risk_fraction;
        let size_base = risk_quote / (entry - stop).abs();
        PositionSize {
            size_base,
            size_quote: size_base * entry,
            risk_quote,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Database;
    use crate::test_helpers::ts;

    async fn planner_with_swings(
        swings: &[(Timeframe, SwingKind, f64)],
    ) -> StopPlanner {
        let db = Database::in_memory().await.unwrap();
        let repo = SwingRepository::new(db);
        for (tf, kind, price) in swings {
            repo.record(*tf, *kind, ts(0), *price).await.unwrap();
        }
        StopPlanner::new(repo, 0.998, 1.003, 0.005, 0.03, 2.0, 0.01)
    }

    #[tokio::test]
    async fn long_stop_from_m5_swing() {
        let planner =
            planner_with_swings(&[(Timeframe::M5, SwingKind::Low, 89_100.0)]).await;

        let stop = planner.plan(90_000.0, Direction::Long).await.unwrap().unwrap();
        assert_eq!(stop.source, StopSource::M5);
        assert!((stop.price - 88_921.8).abs() < 0.1);
        assert!((stop.distance_percent - 1.202).abs() < 0.01);
        assert!((stop.minimum_take_profit - 92_156.4).abs() < 0.1);

        let size = planner.position_size(10_000.0, 90_000.0, stop.price);
        assert!((size.risk_quote - 100.0).abs() < 1e-9);
        assert!((size.size_base - 0.09275).abs() < 0.0001);
    }

    #[tokio::test]
    async fn falls_back_to_h4_when_m5_too_tight() {
        let planner = planner_with_swings(&[
            // 0.3% away after buffer: below the 0.5% floor
            (Timeframe::M5, SwingKind::Low, 89_900.0),
            (Timeframe::H4, SwingKind::Low, 88_500.0),
        ])
        .await;

        let stop = planner.plan(90_000.0, Direction::Long).await.unwrap().unwrap();
        assert_eq!(stop.source, StopSource::H4);
        assert!((stop.price - 88_500.0 * 0.998).abs() < 0.1);
    }

    #[tokio::test]
    async fn short_setup_rejected_when_both_candidates_fail() {
        // 5m candidate lands at 0.355% (too tight), 4h at 3.055% (too wide)
        let planner = planner_with_swings(&[
            (Timeframe::M5, SwingKind::High, 91_050.0),
            (Timeframe::H4, SwingKind::High, 93_500.0),
        ])
        .await;

        let stop = planner.plan(91_000.0, Direction::Short).await.unwrap();
        assert!(stop.is_none());
    }

    #[tokio::test]
    async fn short_stop_sits_above_entry() {
        let planner =
            planner_with_swings(&[(Timeframe::M5, SwingKind::High, 91_500.0)]).await;

        let stop = planner.plan(91_000.0, Direction::Short).await.unwrap().unwrap();
        assert!(stop.price > 91_000.0);
        assert!((stop.minimum_take_profit
            - (91_000.0 - 2.0 * (stop.price - 91_000.0)))
            .abs()
            < 1e-6);
    }

    #[tokio::test]
    async fn wrong_side_swing_is_rejected() {
        // a "low" swing sitting above the entry can't protect a long
        let planner =
            planner_with_swings(&[(Timeframe::M5, SwingKind::Low, 91_000.0)]).await;
        let stop = planner.plan(90_000.0, Direction::Long).await.unwrap();
        assert!(stop.is_none());
    }

    #[tokio::test]
    async fn rr_is_two_at_minimum_take_profit() {
        let planner =
            planner_with_swings(&[(Timeframe::M5, SwingKind::Low, 89_100.0)]).await;
        let stop = planner.plan(90_000.0, Direction::Long).await.unwrap().unwrap();
        let risk = 90_000.0 - stop.price;
        let reward = stop.minimum_take_profit - 90_000.0;
        assert!((reward / risk - 2.0).abs() < 0.01);
    }
}
