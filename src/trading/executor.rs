use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::ai::AdvisorVerdict;
use crate::error::{BotError, BotResult};
use crate::exchange::{ExchangeApi, OrderRequest, OrderSide, OrderStatus};
use crate::models::{Direction, Trade};
use crate::notify::{Notifier, Severity};
use crate::store::{NewTrade, TradeRepository};

/// Places entry, stop, and take-profit in sequence and persists the trade
/// only once all three are live. A failure after the entry fill cancels
/// whatever risk order was already resting and surfaces the error; the
/// filled entry is left for the operator.
pub struct TradeExecutor {
    exchange: Arc<dyn ExchangeApi>,
    trades: TradeRepository,
    notifier: Notifier,
    entry_price_tolerance: f64,
    fill_timeout: Duration,
    poll_interval: Duration,
}

impl TradeExecutor {
    pub fn new(
        exchange: Arc<dyn ExchangeApi>,
        trades: TradeRepository,
        notifier: Notifier,
        entry_price_tolerance: f64,
        fill_timeout_secs: u64,
        poll_interval_secs: u64,
    ) -> Self {
        Self {
            exchange,
            trades,
            notifier,
            entry_price_tolerance,
            fill_timeout: Duration::from_secs(fill_timeout_secs),
            poll_interval: Duration::from_secs(poll_interval_secs),
        }
    }

    pub async fn execute(
        &self,
        verdict: &AdvisorVerdict,
        confluence_state_id: i64,
    ) -> BotResult<Trade> {
        // 1. re-validate against the live market
        let current = self
            .exchange
            .best_price()
            .await
            .map_err(|e| BotError::Transient(format!("price check failed: {e}")))?;

        let drift = (current - verdict.entry).abs() / verdict.entry;
        if drift > self.entry_price_tolerance {
            return Err(BotError::stale_price(format!(
                "price moved {:.2}% from decision entry {:.2}",
                drift * 100.0,
                verdict.entry
            )));
        }

        let sides_ok = match verdict.direction {
            Direction::Long => {
                verdict.stop < verdict.entry && verdict.take_profit > verdict.entry
            }
            Direction::Short => {
                verdict.stop > verdict.entry && verdict.take_profit < verdict.entry
            }
        };
        if !sides_ok {
            return Err(BotError::Validation(format!(
                "stop {:.2} / tp {:.2} misplaced around entry {:.2}",
                verdict.stop, verdict.take_profit, verdict.entry
            )));
        }
        if verdict.size_base <= 0.0 {
            return Err(BotError::Validation("non-positive order size".into()));
        }

        let (entry_side, exit_side) = match verdict.direction {
            Direction::Long => (OrderSide::Buy, OrderSide::Sell),
            Direction::Short => (OrderSide::Sell, OrderSide::Buy),
        };

        // 2. market entry, then wait out the fill
        let entry_ack = self
            .exchange
            .place_order(&OrderRequest::market(entry_side, verdict.size_base))
            .await
            .map_err(classify_order_error)?;
        info!(order_id = %entry_ack.order_id, "entry order placed");

        let (fill_price, fill_size) = self.await_entry_fill(&entry_ack.order_id).await?;
        info!(
            order_id = %entry_ack.order_id,
            fill_price,
            fill_size,
            "entry filled"
        );

        // 3. protective stop for the filled size
        let stop_ack = match self
            .exchange
            .place_order(&OrderRequest::stop_limit(exit_side, fill_size, verdict.stop))
            .await
        {
            Ok(ack) => ack,
            Err(e) => {
                self.surface_rollback(confluence_state_id, &[], "stop placement failed", &e)
                    .await;
                return Err(classify_order_error(e));
            }
        };

        // 4. take-profit limit
        let tp_ack = match self
            .exchange
            .place_order(&OrderRequest::limit(exit_side, fill_size, verdict.take_profit))
            .await
        {
            Ok(ack) => ack,
            Err(e) => {
                self.surface_rollback(
                    confluence_state_id,
                    &[stop_ack.order_id.clone()],
                    "take-profit placement failed",
                    &e,
                )
                .await;
                return Err(classify_order_error(e));
            }
        };

        // 5. persist the open trade
        let entry_at = Utc::now();
        let new_trade = NewTrade {
            confluence_state_id,
            direction: verdict.direction,
            entry_price: fill_price,
            entry_at,
            size_base: fill_size,
            size_quote: fill_size * fill_price,
            stop_price: verdict.stop,
            stop_source: verdict.stop_source,
            take_profit: verdict.take_profit,
            rr_ratio: verdict.rr,
            entry_order_id: entry_ack.order_id,
            stop_order_id: stop_ack.order_id,
            tp_order_id: tp_ack.order_id,
            ai_confidence: verdict.confidence,
            ai_reasoning: verdict.reasoning.clone(),
        };
        let trade_id = self
            .trades
            .insert_open(&new_trade)
            .await
            .map_err(|e| BotError::Fatal(format!("trade persistence failed: {e}")))?;

        let trade = self
            .trades
            .get(trade_id)
            .await
            .map_err(|e| BotError::Fatal(format!("trade readback failed: {e}")))?
            .ok_or_else(|| BotError::Fatal("trade row vanished after insert".into()))?;

        info!(
            trade_id,
            direction = %trade.direction,
            entry = trade.entry_price,
            stop = trade.stop_price,
            tp = trade.take_profit,
            size = trade.size_base,
            "trade open"
        );
        Ok(trade)
    }

    /// Poll the entry order until FILLED or the budget runs out. A
    /// terminal non-fill status or a timeout aborts before any risk
    /// orders exist.
    async fn await_entry_fill(&self, order_id: &str) -> BotResult<(f64, f64)> {
        let deadline = tokio::time::Instant::now() + self.fill_timeout;

        loop {
            let state = self
                .exchange
                .get_order(order_id)
                .await
                .map_err(|e| BotError::Transient(format!("order poll failed: {e}")))?;

            match state.status {
                OrderStatus::Filled => {
                    if state.filled_size <= 0.0 || state.average_fill_price <= 0.0 {
                        return Err(BotError::Validation(format!(
                            "entry {order_id} filled with degenerate fill data"
                        )));
                    }
                    return Ok((state.average_fill_price, state.filled_size));
                }
                OrderStatus::Cancelled | OrderStatus::Expired | OrderStatus::Failed => {
                    return Err(BotError::ExchangeConflict {
                        reason: format!("entry {order_id} ended {:?}", state.status),
                        fatal_for_trade: true,
                    });
                }
                OrderStatus::Pending | OrderStatus::Open => {
                    if tokio::time::Instant::now() >= deadline {
                        return Err(BotError::ExchangeConflict {
                            reason: format!("entry {order_id} not filled within budget"),
                            fatal_for_trade: true,
                        });
                    }
                    tokio::time::sleep(self.poll_interval).await;
                }
            }
        }
    }

    /// Cancel any risk orders that made it out, then alert the operator:
    /// the filled entry is now unprotected.
    async fn surface_rollback(
        &self,
        confluence_state_id: i64,
        cancel_ids: &[String],
        stage: &str,
        cause: &anyhow::Error,
    ) {
        error!(
            stage,
            state_id = confluence_state_id,
            error = %cause,
            "executor rollback"
        );

        if !cancel_ids.is_empty() {
            match self.exchange.cancel_orders(cancel_ids).await {
                Ok(results) => {
                    for r in results.iter().filter(|r| !r.success) {
                        warn!(order_id = %r.order_id, "rollback cancel did not succeed");
                    }
                }
                Err(e) => error!(error = %e, "rollback cancel request failed"),
            }
        }

        self.notifier.notify(
            Severity::Crit,
            "executor_rollback",
            &[
                ("stage", stage.to_string()),
                ("state_id", confluence_state_id.to_string()),
                ("error", cause.to_string()),
                (
                    "note",
                    "entry fill remains on the book, operator intervention required".to_string(),
                ),
            ],
        );
    }
}

/// Map an exchange rejection onto the error taxonomy: insufficient funds
/// kills the trade, everything else is assumed transient enough to report
/// upward as a conflict.
fn classify_order_error(e: anyhow::Error) -> BotError {
    let text = e.to_string();
    if text.to_ascii_uppercase().contains("INSUFFICIENT_FUND") {
        BotError::insufficient_funds(text)
    } else {
        BotError::ExchangeConflict {
            reason: text,
            fatal_for_trade: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::PaperExchange;
    use crate::models::{StopSource, TradeStatus};
    use crate::store::Database;
    use crate::test_helpers::{seed_confluence_state, ts, FlakyExchange};

    fn verdict() -> AdvisorVerdict {
        AdvisorVerdict {
            approved: true,
            direction: Direction::Long,
            entry: 90_000.0,
            stop: 88_921.8,
            stop_source: StopSource::M5,
            take_profit: 92_156.4,
            size_base: 0.09275,
            rr: 2.0,
            confidence: 85.0,
            reasoning: "test verdict".into(),
            rejection: None,
        }
    }

    async fn executor_with(
        exchange: Arc<dyn ExchangeApi>,
    ) -> (TradeExecutor, TradeRepository, i64) {
        let db = Database::in_memory().await.unwrap();
        let state_id = seed_confluence_state(&db).await;
        let trades = TradeRepository::new(db);
        let executor = TradeExecutor::new(
            exchange,
            trades.clone(),
            Notifier::new(None),
            0.002,
            2,
            1,
        );
        (executor, trades, state_id)
    }

    #[tokio::test]
    async fn happy_path_opens_trade_with_three_orders() {
        let paper = Arc::new(PaperExchange::new("BTC-USD", 10_000.0));
        paper.set_price(90_000.0, ts(0));
        let (executor, trades, state_id) = executor_with(paper.clone()).await;

        let trade = executor.execute(&verdict(), state_id).await.unwrap();
        assert_eq!(trade.status, TradeStatus::Open);
        assert!((trade.entry_price - 90_000.0).abs() < 1e-6);
        assert!(!trade.entry_order_id.is_empty());
        assert!(!trade.stop_order_id.is_empty());
        assert!(!trade.tp_order_id.is_empty());
        assert_ne!(trade.stop_order_id, trade.tp_order_id);
        assert_eq!(trades.open_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn stale_price_aborts_before_any_order() {
        let paper = Arc::new(PaperExchange::new("BTC-USD", 10_000.0));
        paper.set_price(91_000.0, ts(0)); // > 0.2% from 90,000
        let (executor, trades, state_id) = executor_with(paper).await;

        let err = executor.execute(&verdict(), state_id).await.unwrap_err();
        assert!(matches!(
            err,
            BotError::ExchangeConflict {
                fatal_for_trade: false,
                ..
            }
        ));
        assert_eq!(trades.open_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn misplaced_tp_is_a_validation_error() {
        let paper = Arc::new(PaperExchange::new("BTC-USD", 10_000.0));
        paper.set_price(90_000.0, ts(0));
        let (executor, _, state_id) = executor_with(paper).await;

        let mut bad = verdict();
        bad.take_profit = 89_000.0; // below entry on a long
        let err = executor.execute(&bad, state_id).await.unwrap_err();
        assert!(matches!(err, BotError::Validation(_)));
    }

    #[tokio::test]
    async fn tp_failure_cancels_the_stop_and_writes_no_trade() {
        // third place_order call (the tp) fails
        let flaky = Arc::new(FlakyExchange::failing_on_order(3, 90_000.0));
        let (executor, trades, state_id) = executor_with(flaky.clone()).await;

        let err = executor.execute(&verdict(), state_id).await.unwrap_err();
        assert!(matches!(err, BotError::ExchangeConflict { .. }));
        assert_eq!(trades.open_count().await.unwrap(), 0, "no trade row on rollback");
        // the stop that did get placed was cancelled
        assert_eq!(flaky.cancelled_count(), 1);
    }

    #[tokio::test]
    async fn stop_failure_aborts_with_nothing_to_cancel() {
        let flaky = Arc::new(FlakyExchange::failing_on_order(2, 90_000.0));
        let (executor, trades, state_id) = executor_with(flaky.clone()).await;

        let err = executor.execute(&verdict(), state_id).await.unwrap_err();
        assert!(matches!(err, BotError::ExchangeConflict { .. }));
        assert_eq!(trades.open_count().await.unwrap(), 0);
        assert_eq!(flaky.cancelled_count(), 0);
    }
}
