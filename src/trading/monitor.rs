use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::config::TrailingMode;
use crate::exchange::{ExchangeApi, OrderRequest, OrderSide, OrderStatus};
use crate::models::{Direction, Trade, TradeOutcome};
use crate::notify::{Notifier, Severity};
use crate::store::TradeRepository;

/// P&L this close to zero (relative to entry notional) reads as breakeven.
const BREAKEVEN_EPSILON: f64 = 1e-6;

#[derive(Debug, Clone, PartialEq)]
pub enum MonitorEvent {
    Closed {
        trade_id: i64,
        outcome: TradeOutcome,
        pnl_quote: f64,
    },
    TrailingActivated {
        trade_id: i64,
        new_stop: f64,
    },
    /// Something went wrong mid-replacement; a human needs to look.
    Flagged {
        trade_id: i64,
        reason: String,
    },
}

/// Watches every open trade: exit-order fills, the time stop, unrealized
/// P&L, and the one-shot trailing promotion.
pub struct TradeMonitor {
    exchange: Arc<dyn ExchangeApi>,
    trades: TradeRepository,
    notifier: Notifier,
    max_trade_duration: Duration,
    trailing_trigger: f64,
    trailing_mode: TrailingMode,
    trailing_entry_band: f64,
}

impl TradeMonitor {
    pub fn new(
        exchange: Arc<dyn ExchangeApi>,
        trades: TradeRepository,
        notifier: Notifier,
        max_trade_hours: i64,
        trailing_trigger: f64,
        trailing_mode: TrailingMode,
        trailing_entry_band: f64,
    ) -> Self {
        Self {
            exchange,
            trades,
            notifier,
            max_trade_duration: Duration::hours(max_trade_hours),
            trailing_trigger,
            trailing_mode,
            trailing_entry_band,
        }
    }

    /// One monitoring pass over all open trades.
    pub async fn sweep_once(&self, now: DateTime<Utc>) -> Result<Vec<MonitorEvent>> {
        let mut events = Vec::new();
        for trade in self.trades.open_trades().await? {
            match self.check_trade(&trade, now).await {
                Ok(mut trade_events) => events.append(&mut trade_events),
                Err(e) => {
                    warn!(trade_id = trade.id, error = %e, "monitor pass failed for trade");
                }
            }
        }
        Ok(events)
    }

    async fn check_trade(&self, trade: &Trade, now: DateTime<Utc>) -> Result<Vec<MonitorEvent>> {
        let mut events = Vec::new();

        // 1. stop fill
        let stop_state = self.exchange.get_order(&trade.stop_order_id).await?;
        if stop_state.status == OrderStatus::Filled {
            let exit = stop_state.average_fill_price;
            let event = self
                .close_trade(trade, exit, now, &[trade.tp_order_id.clone()])
                .await?;
            events.extend(event);
            return Ok(events);
        }

        // 2. take-profit fill
        let tp_state = self.exchange.get_order(&trade.tp_order_id).await?;
        if tp_state.status == OrderStatus::Filled {
            let exit = tp_state.average_fill_price;
            let event = self
                .close_trade(trade, exit, now, &[trade.stop_order_id.clone()])
                .await?;
            events.extend(event);
            return Ok(events);
        }

        // 3. time stop
        if now - trade.entry_at > self.max_trade_duration {
            info!(trade_id = trade.id, "time stop reached, closing at market");
            let event = self.market_close(trade, now).await?;
            events.extend(event);
            return Ok(events);
        }

        // 4. unrealized P&L
        let price = self.exchange.best_price().await?;
        let pnl = trade.unrealized_pnl(price);
        let pnl_percent = pnl / (trade.entry_price * trade.size_base) * 100.0;
        self.trades
            .update_unrealized(trade.id, pnl, pnl_percent)
            .await?;

        // 5. trailing promotion
        if !trade.trailing_activated
            && trade.progress_to_target(price) >= self.trailing_trigger
        {
            events.extend(self.promote_stop(trade, price).await?);
        }

        Ok(events)
    }

    /// Close against a known exit fill, cancelling the sibling exit order.
    async fn close_trade(
        &self,
        trade: &Trade,
        exit_price: f64,
        now: DateTime<Utc>,
        cancel_ids: &[String],
    ) -> Result<Vec<MonitorEvent>> {
        if let Err(e) = self.exchange.cancel_orders(cancel_ids).await {
            warn!(trade_id = trade.id, error = %e, "sibling exit order cancel failed");
        }

        let pnl = trade.unrealized_pnl(exit_price);
        let notional = trade.entry_price * trade.size_base;
        let pnl_percent = pnl / notional * 100.0;
        let outcome = outcome_from_pnl(pnl, notional);

        let closed = self
            .trades
            .close(trade.id, outcome, exit_price, now, pnl, pnl_percent)
            .await?;
        if !closed {
            // someone else already closed it; nothing to report twice
            return Ok(Vec::new());
        }

        info!(
            trade_id = trade.id,
            outcome = %outcome,
            exit_price,
            pnl,
            "trade closed"
        );
        self.notifier.notify(
            Severity::Info,
            "trade_closed",
            &[
                ("trade_id", trade.id.to_string()),
                ("outcome", outcome.to_string()),
                ("pnl_quote", format!("{pnl:.2}")),
            ],
        );
        Ok(vec![MonitorEvent::Closed {
            trade_id: trade.id,
            outcome,
            pnl_quote: pnl,
        }])
    }

    /// Time-based exit: lift both exit orders, close at market, settle by
    /// realized sign.
    async fn market_close(&self, trade: &Trade, now: DateTime<Utc>) -> Result<Vec<MonitorEvent>> {
        self.exchange
            .cancel_orders(&[trade.stop_order_id.clone(), trade.tp_order_id.clone()])
            .await
            .context("failed to cancel exit orders for time stop")?;

        let close_side = match trade.direction {
            Direction::Long => OrderSide::Sell,
            Direction::Short => OrderSide::Buy,
        };
        let ack = self
            .exchange
            .place_order(&OrderRequest::market(close_side, trade.size_base))
            .await
            .context("market close order failed")?;
        let state = self.exchange.get_order(&ack.order_id).await?;
        let exit_price = if state.average_fill_price > 0.0 {
            state.average_fill_price
        } else {
            self.exchange.best_price().await?
        };

        self.close_trade(trade, exit_price, now, &[]).await
    }

    /// Emergency-stop path: lift every exit order and close every open
    /// position at market.
    pub async fn emergency_close_all(&self, now: DateTime<Utc>) -> Result<Vec<MonitorEvent>> {
        let mut events = Vec::new();
        for trade in self.trades.open_trades().await? {
            warn!(trade_id = trade.id, "emergency close");
            match self.market_close(&trade, now).await {
                Ok(mut e) => events.append(&mut e),
                Err(e) => {
                    error!(trade_id = trade.id, error = %e, "emergency close failed");
                    self.notifier.notify(
                        Severity::Crit,
                        "emergency_close_failed",
                        &[
                            ("trade_id", trade.id.to_string()),
                            ("error", e.to_string()),
                        ],
                    );
                }
            }
        }
        Ok(events)
    }

    /// One-shot stop promotion once progress crosses the trigger.
    async fn promote_stop(&self, trade: &Trade, price: f64) -> Result<Vec<MonitorEvent>> {
        let new_stop = match self.trailing_mode {
            TrailingMode::Breakeven => trade.entry_price,
            TrailingMode::Buffer => match trade.direction {
                Direction::Long => trade.entry_price * 1.001,
                Direction::Short => trade.entry_price * 0.999,
            },
            TrailingMode::DynamicLock => match trade.direction {
                Direction::Long => trade.entry_price + 0.25 * (price - trade.entry_price),
                Direction::Short => trade.entry_price - 0.25 * (trade.entry_price - price),
            },
        };

        // only ever tighten, never cross the market, stay near entry
        let improves = match trade.direction {
            Direction::Long => new_stop > trade.stop_price && new_stop < price,
            Direction::Short => new_stop < trade.stop_price && new_stop > price,
        };
        let near_entry =
            (new_stop - trade.entry_price).abs() / trade.entry_price <= self.trailing_entry_band;
        if !improves || !near_entry {
            return Ok(Vec::new());
        }

        let cancel = self
            .exchange
            .cancel_orders(&[trade.stop_order_id.clone()])
            .await?;
        if !cancel.iter().all(|r| r.success) {
            // the stop may have just filled; next sweep settles it
            warn!(trade_id = trade.id, "stop cancel rejected, skipping promotion");
            return Ok(Vec::new());
        }

        let exit_side = match trade.direction {
            Direction::Long => OrderSide::Sell,
            Direction::Short => OrderSide::Buy,
        };
        match self
            .exchange
            .place_order(&OrderRequest::stop_limit(exit_side, trade.size_base, new_stop))
            .await
        {
            Ok(ack) => {
                self.trades
                    .mark_trailing(trade.id, new_stop, &ack.order_id)
                    .await?;
                info!(
                    trade_id = trade.id,
                    old_stop = trade.stop_price,
                    new_stop,
                    "trailing stop promoted"
                );
                Ok(vec![MonitorEvent::TrailingActivated {
                    trade_id: trade.id,
                    new_stop,
                }])
            }
            Err(e) => {
                // the old stop is gone and the new one never landed:
                // try to reinstate, and flag the trade either way
                error!(trade_id = trade.id, error = %e, "trailing replacement failed");
                let reinstated = self
                    .exchange
                    .place_order(&OrderRequest::stop_limit(
                        exit_side,
                        trade.size_base,
                        trade.stop_price,
                    ))
                    .await;

                let reason = match reinstated {
                    Ok(ack) => {
                        self.trades.update_stop_order(trade.id, &ack.order_id).await?;
                        format!("trailing replacement failed, original stop reinstated: {e}")
                    }
                    Err(e2) => {
                        format!("trailing replacement failed and stop NOT reinstated: {e}; {e2}")
                    }
                };

                self.notifier.notify(
                    Severity::Crit,
                    "trailing_stop_inconsistent",
                    &[
                        ("trade_id", trade.id.to_string()),
                        ("reason", reason.clone()),
                    ],
                );
                Ok(vec![MonitorEvent::Flagged {
                    trade_id: trade.id,
                    reason,
                }])
            }
        }
    }
}

fn outcome_from_pnl(pnl_quote: f64, notional: f64) -> TradeOutcome {
    if pnl_quote.abs() <= notional * BREAKEVEN_EPSILON {
        TradeOutcome::Breakeven
    } else if pnl_quote > 0.0 {
        TradeOutcome::Win
    } else {
        TradeOutcome::Loss
    }
}
