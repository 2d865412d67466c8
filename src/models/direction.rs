use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Long,
    Short,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Long => "long",
            Direction::Short => "short",
        }
    }

    pub fn parse(s: &str) -> Option<Direction> {
        match s {
            "long" => Some(Direction::Long),
            "short" => Some(Direction::Short),
            _ => None,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SwingKind {
    High,
    Low,
}

impl SwingKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SwingKind::High => "high",
            SwingKind::Low => "low",
        }
    }

    pub fn parse(s: &str) -> Option<SwingKind> {
        match s {
            "high" => Some(SwingKind::High),
            "low" => Some(SwingKind::Low),
            _ => None,
        }
    }

    pub fn opposite(&self) -> SwingKind {
        match self {
            SwingKind::High => SwingKind::Low,
            SwingKind::Low => SwingKind::High,
        }
    }
}

impl fmt::Display for SwingKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Direction implied by a sweep: taking out a low implies longs, taking
/// out a high implies shorts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Bias {
    Bullish,
    Bearish,
}

impl Bias {
    pub fn from_sweep_kind(kind: SwingKind) -> Bias {
        match kind {
            SwingKind::Low => Bias::Bullish,
            SwingKind::High => Bias::Bearish,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Bias::Bullish => "bullish",
            Bias::Bearish => "bearish",
        }
    }

    pub fn parse(s: &str) -> Option<Bias> {
        match s {
            "bullish" => Some(Bias::Bullish),
            "bearish" => Some(Bias::Bearish),
            _ => None,
        }
    }

    pub fn to_direction(self) -> Direction {
        match self {
            Bias::Bullish => Direction::Long,
            Bias::Bearish => Direction::Short,
        }
    }
}

impl fmt::Display for Bias {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Confluence progression. Phases only ever advance; the two terminal
/// phases are Complete and Expired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    WaitingChoch,
    WaitingFvg,
    WaitingBos,
    Complete,
    Expired,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::WaitingChoch => "waiting_choch",
            Phase::WaitingFvg => "waiting_fvg",
            Phase::WaitingBos => "waiting_bos",
            Phase::Complete => "complete",
            Phase::Expired => "expired",
        }
    }

    pub fn parse(s: &str) -> Option<Phase> {
        match s {
            "waiting_choch" => Some(Phase::WaitingChoch),
            "waiting_fvg" => Some(Phase::WaitingFvg),
            "waiting_bos" => Some(Phase::WaitingBos),
            "complete" => Some(Phase::Complete),
            "expired" => Some(Phase::Expired),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::Complete | Phase::Expired)
    }

    /// Position in the forward chain; Expired is reachable from any
    /// non-terminal phase and sits outside the ordering.
    pub fn rank(&self) -> u8 {
        match self {
            Phase::WaitingChoch => 0,
            Phase::WaitingFvg => 1,
            Phase::WaitingBos => 2,
            Phase::Complete => 3,
            Phase::Expired => 4,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeStatus {
    Open,
    Closed,
}

impl TradeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeStatus::Open => "open",
            TradeStatus::Closed => "closed",
        }
    }

    pub fn parse(s: &str) -> Option<TradeStatus> {
        match s {
            "open" => Some(TradeStatus::Open),
            "closed" => Some(TradeStatus::Closed),
            _ => None,
        }
    }
}

impl fmt::Display for TradeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeOutcome {
    Win,
    Loss,
    Breakeven,
}

impl TradeOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeOutcome::Win => "win",
            TradeOutcome::Loss => "loss",
            TradeOutcome::Breakeven => "breakeven",
        }
    }

    pub fn parse(s: &str) -> Option<TradeOutcome> {
        match s {
            "win" => Some(TradeOutcome::Win),
            "loss" => Some(TradeOutcome::Loss),
            "breakeven" => Some(TradeOutcome::Breakeven),
            _ => None,
        }
    }
}

impl fmt::Display for TradeOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Which timeframe's swing produced the accepted stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StopSource {
    M5,
    H4,
}

impl StopSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            StopSource::M5 => "5m",
            StopSource::H4 => "4h",
        }
    }

    pub fn parse(s: &str) -> Option<StopSource> {
        match s {
            "5m" => Some(StopSource::M5),
            "4h" => Some(StopSource::H4),
            _ => None,
        }
    }
}

impl fmt::Display for StopSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bias_follows_swept_kind() {
        assert_eq!(Bias::from_sweep_kind(SwingKind::Low), Bias::Bullish);
        assert_eq!(Bias::from_sweep_kind(SwingKind::High), Bias::Bearish);
    }

    #[test]
    fn phase_ordering_is_monotonic() {
        assert!(Phase::WaitingChoch.rank() < Phase::WaitingFvg.rank());
        assert!(Phase::WaitingFvg.rank() < Phase::WaitingBos.rank());
        assert!(Phase::WaitingBos.rank() < Phase::Complete.rank());
        assert!(Phase::Complete.is_terminal());
        assert!(Phase::Expired.is_terminal());
        assert!(!Phase::WaitingBos.is_terminal());
    }

    #[test]
    fn enum_round_trips_through_strings() {
        assert_eq!(Phase::parse(Phase::WaitingFvg.as_str()), Some(Phase::WaitingFvg));
        assert_eq!(StopSource::parse("4h"), Some(StopSource::H4));
        assert_eq!(TradeOutcome::parse("breakeven"), Some(TradeOutcome::Breakeven));
        assert_eq!(Bias::parse("nope"), None);
    }
}
