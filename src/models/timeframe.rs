use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// The two timeframes the scanner pipeline runs on, plus the 1h feed
/// that 4h buckets are resampled from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Timeframe {
    #[serde(rename = "5m")]
    M5,
    #[serde(rename = "1h")]
    H1,
    #[serde(rename = "4h")]
    H4,
}

impl Timeframe {
    pub fn as_str(&self) -> &'static str {
        match self {
            Timeframe::M5 => "5m",
            Timeframe::H1 => "1h",
            Timeframe::H4 => "4h",
        }
    }

    pub fn as_duration(&self) -> Duration {
        match self {
            Timeframe::M5 => Duration::from_secs(300),
            Timeframe::H1 => Duration::from_secs(3600),
            Timeframe::H4 => Duration::from_secs(14400),
        }
    }

    /// Coinbase REST API granularity string. 4h is not a native
    /// granularity; the client resamples it from 1h.
    pub fn coinbase_granularity(&self) -> &'static str {
        match self {
            Timeframe::M5 => "FIVE_MINUTE",
            Timeframe::H1 => "ONE_HOUR",
            Timeframe::H4 => "ONE_HOUR",
        }
    }

    pub fn from_str_loose(s: &str) -> Option<Timeframe> {
        match s {
            "5m" => Some(Timeframe::M5),
            "1h" => Some(Timeframe::H1),
            "4h" => Some(Timeframe::H4),
            _ => None,
        }
    }

    pub fn as_seconds(&self) -> i64 {
        self.as_duration().as_secs() as i64
    }

    /// Align a unix timestamp down to the start of its bucket.
    pub fn bucket_start_of(&self, unix_secs: i64) -> i64 {
        let secs = self.as_seconds();
        unix_secs - unix_secs.rem_euclid(secs)
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bucket_alignment() {
        // 2024-01-15T13:37:21Z = 1705325841
        let ts = 1705325841;
        assert_eq!(Timeframe::M5.bucket_start_of(ts) % 300, 0);
        assert_eq!(Timeframe::H4.bucket_start_of(ts) % 14400, 0);
        assert!(Timeframe::M5.bucket_start_of(ts) <= ts);
    }

    #[test]
    fn granularity_strings() {
        assert_eq!(Timeframe::M5.coinbase_granularity(), "FIVE_MINUTE");
        // 4h resamples from the native 1h granularity
        assert_eq!(Timeframe::H4.coinbase_granularity(), "ONE_HOUR");
    }
}
