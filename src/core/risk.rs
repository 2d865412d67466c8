use std::fmt;
use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use tracing::warn;

use crate::exchange::ExchangeApi;
use crate::store::TradeRepository;

#[derive(Debug, Clone, PartialEq)]
pub enum RiskCheck {
    OpenPositionCap { open: usize, max: usize },
    DailyLoss { realized: f64, limit: f64 },
    ConsecutiveLosses { count: usize, max: usize },
    BalanceFloor { balance: f64, floor: f64 },
    ExchangeUnreachable { reason: String },
}

impl fmt::Display for RiskCheck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RiskCheck::OpenPositionCap { open, max } => {
                write!(f, "open positions {open} >= cap {max}")
            }
            RiskCheck::DailyLoss { realized, limit } => {
                write!(f, "daily P&L {realized:.2} breaches limit {limit:.2}")
            }
            RiskCheck::ConsecutiveLosses { count, max } => {
                write!(f, "{count} consecutive losses >= cap {max}")
            }
            RiskCheck::BalanceFloor { balance, floor } => {
                write!(f, "balance {balance:.2} under floor {floor:.2}")
            }
            RiskCheck::ExchangeUnreachable { reason } => {
                write!(f, "exchange unreachable: {reason}")
            }
        }
    }
}

/// Outcome of the pre-trade gate; failing checks are all recorded, not
/// just the first.
#[derive(Debug, Clone, Default)]
pub struct RiskVerdict {
    pub failures: Vec<RiskCheck>,
}

impl RiskVerdict {
    pub fn passed(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Pre-trade circuit breakers: position cap, daily loss, loss streak,
/// balance floor, exchange reachability.
pub struct RiskGate {
    trades: TradeRepository,
    exchange: Arc<dyn ExchangeApi>,
    max_open_positions: usize,
    max_daily_loss: f64,
    max_consecutive_losses: usize,
    min_account_balance: f64,
}

impl RiskGate {
    pub fn new(
        trades: TradeRepository,
        exchange: Arc<dyn ExchangeApi>,
        max_open_positions: usize,
        max_daily_loss: f64,
        max_consecutive_losses: usize,
        min_account_balance: f64,
    ) -> Self {
        Self {
            trades,
            exchange,
            max_open_positions,
            max_daily_loss,
            max_consecutive_losses,
            min_account_balance,
        }
    }

    pub async fn check(&self, balance: f64, now: DateTime<Utc>) -> Result<RiskVerdict> {
        let mut verdict = RiskVerdict::default();

        let open = self.trades.open_count().await?;
        if open >= self.max_open_positions {
            verdict.failures.push(RiskCheck::OpenPositionCap {
                open,
                max: self.max_open_positions,
            });
        }

        let midnight = now
            .date_naive()
            .and_hms_opt(0, 0, 0)
            .expect("midnight is always valid")
            .and_utc();
        let realized = self.trades.realized_pnl_since(midnight).await?;
        let limit = -(self.max_daily_loss * balance);
        if realized <= limit {
            verdict.failures.push(RiskCheck::DailyLoss { realized, limit });
        }

        let losses = self.trades.consecutive_losses().await?;
        if losses >= self.max_consecutive_losses {
            verdict.failures.push(RiskCheck::ConsecutiveLosses {
                count: losses,
                max: self.max_consecutive_losses,
            });
        }

        if balance < self.min_account_balance {
            verdict.failures.push(RiskCheck::BalanceFloor {
                balance,
                floor: self.min_account_balance,
            });
        }

        if let Err(e) = self.exchange.best_price().await {
            verdict.failures.push(RiskCheck::ExchangeUnreachable {
                reason: e.to_string(),
            });
        }

        if !verdict.passed() {
            for failure in &verdict.failures {
                warn!(check = %failure, "risk gate check failed");
            }
        }

        Ok(verdict)
    }
}
