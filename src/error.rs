use std::future::Future;
use std::time::Duration;

use rand::Rng;
use thiserror::Error;
use tracing::warn;

/// Failure classification the scheduler and retry helper branch on.
#[derive(Debug, Error)]
pub enum BotError {
    /// Network, rate-limit, timeout. Retried with backoff.
    #[error("transient: {0}")]
    Transient(String),

    /// Bad inputs or a violated invariant. Rejected, never retried.
    #[error("validation: {0}")]
    Validation(String),

    /// Risk-gate block, no valid stop, AI rejection. Surfaced; the
    /// current setup is abandoned.
    #[error("business: {0}")]
    Business(String),

    /// Order rejected by the exchange due to market state.
    #[error("exchange conflict: {reason}")]
    ExchangeConflict {
        reason: String,
        /// Insufficient funds kills the trade; a stale price is retried once.
        fatal_for_trade: bool,
    },

    /// Invalid credentials, schema mismatch. Scanners halt, operator alerted.
    #[error("fatal: {0}")]
    Fatal(String),
}

impl BotError {
    pub fn is_transient(&self) -> bool {
        matches!(self, BotError::Transient(_))
    }

    pub fn stale_price(reason: impl Into<String>) -> Self {
        BotError::ExchangeConflict {
            reason: reason.into(),
            fatal_for_trade: false,
        }
    }

    pub fn insufficient_funds(reason: impl Into<String>) -> Self {
        BotError::ExchangeConflict {
            reason: reason.into(),
            fatal_for_trade: true,
        }
    }
}

pub type BotResult<T> = Result<T, BotError>;

/// Retry a fallible async operation. Only Transient errors are retried;
/// everything else propagates on the first occurrence. Delay doubles per
/// attempt with up to 50% added jitter.
pub async fn retry_transient<T, F, Fut>(
    stage: &str,
    max_attempts: u32,
    base_delay: Duration,
    mut op: F,
) -> BotResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = BotResult<T>>,
{
    let mut delay = base_delay;
    let mut attempt = 1;

    loop {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) if e.is_transient() && attempt < max_attempts => {
                let jitter = Duration::from_millis(
                    rand::thread_rng().gen_range(0..=delay.as_millis().max(1) as u64 / 2),
                );
                warn!(stage, attempt, error = %e, "transient failure, retrying");
                tokio::time::sleep(delay + jitter).await;
                delay = (delay * 2).min(Duration::from_secs(60));
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
