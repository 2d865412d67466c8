use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{Bias, Direction, Phase, StopSource, SwingKind, Timeframe, TradeOutcome, TradeStatus};

/// A confirmed local extremum. At most one row per (timeframe, kind) is
/// active; superseded rows stay on disk with active = false.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwingLevel {
    pub id: i64,
    pub timeframe: Timeframe,
    pub kind: SwingKind,
    pub bucket_start: DateTime<Utc>,
    pub price: f64,
    pub active: bool,
}

/// A breach of the active 4h swing. Owned by its confluence state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sweep {
    pub id: i64,
    pub detected_at: DateTime<Utc>,
    pub kind: SwingKind,
    pub price_at_detection: f64,
    pub swing_level_id: i64,
    pub bias: Bias,
    pub active: bool,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfluenceState {
    pub id: i64,
    pub sweep_id: i64,
    pub phase: Phase,
    pub choch_price: Option<f64>,
    pub choch_at: Option<DateTime<Utc>>,
    pub fvg_low: Option<f64>,
    pub fvg_high: Option<f64>,
    pub fvg_fill_price: Option<f64>,
    pub fvg_fill_at: Option<DateTime<Utc>>,
    pub bos_price: Option<f64>,
    pub bos_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ConfluenceState {
    /// Strict ordering of the recorded stage times, required for a
    /// completed state to be considered coherent.
    pub fn times_ordered(&self) -> bool {
        match (self.choch_at, self.fvg_fill_at, self.bos_at) {
            (Some(choch), Some(fill), Some(bos)) => choch < fill && fill < bos,
            _ => false,
        }
    }
}

/// Swing-based stop candidate produced by the stop planner. Computed per
/// setup, never stored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwingStop {
    pub price: f64,
    pub source: StopSource,
    pub swing_price: f64,
    pub distance_percent: f64,
    pub minimum_take_profit: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trade {
    pub id: i64,
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
    pub status: TradeStatus,
    pub outcome: Option<TradeOutcome>,
    pub exit_price: Option<f64>,
    pub exit_at: Option<DateTime<Utc>>,
    pub pnl_quote: Option<f64>,
    pub pnl_percent: Option<f64>,
    pub trailing_activated: bool,
    pub trailing_price: Option<f64>,
    pub ai_confidence: f64,
    pub ai_reasoning: String,
}

impl Trade {
    pub fn is_open(&self) -> bool {
        self.status == TradeStatus::Open
    }

    /// Signed quote-currency P&L at the given price for the full size.
    pub fn unrealized_pnl(&self, price: f64) -> f64 {
        match self.direction {
            Direction::Long => self.size_base * (price - self.entry_price),
            Direction::Short => self.size_base * (self.entry_price - price),
        }
    }

    /// Fraction of the entry-to-target distance covered, clipped to
    /// [0, 1]; adverse moves report 0.
    pub fn progress_to_target(&self, price: f64) -> f64 {
        let span = self.take_profit - self.entry_price;
        if span.abs() < f64::EPSILON {
            return 0.0;
        }
        ((price - self.entry_price) / span).clamp(0.0, 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::make_open_trade;

    #[test]
    fn progress_long_counts_toward_tp() {
        let trade = make_open_trade(Direction::Long, 90_000.0, 88_200.0, 93_600.0);
        let p = trade.progress_to_target(92_880.0);
        assert!((p - 0.8).abs() < 1e-9);
    }

    #[test]
    fn progress_clamps_adverse_and_overshoot() {
        let trade = make_open_trade(Direction::Long, 90_000.0, 88_200.0, 93_600.0);
        assert_eq!(trade.progress_to_target(89_000.0), 0.0);
        assert_eq!(trade.progress_to_target(95_000.0), 1.0);
    }

    #[test]
    fn progress_short_counts_downward() {
        let trade = make_open_trade(Direction::Short, 90_000.0, 91_800.0, 86_400.0);
        let p = trade.progress_to_target(87_120.0);
        assert!((p - 0.8).abs() < 1e-9);
    }

    #[test]
    fn unrealized_pnl_signs() {
        let long = make_open_trade(Direction::Long, 90_000.0, 88_200.0, 93_600.0);
        assert!(long.unrealized_pnl(91_000.0) > 0.0);
        assert!(long.unrealized_pnl(89_000.0) < 0.0);
        let short = make_open_trade(Direction::Short, 90_000.0, 91_800.0, 86_400.0);
        assert!(short.unrealized_pnl(89_000.0) > 0.0);
        assert!(short.unrealized_pnl(91_000.0) < 0.0);
    }
}
