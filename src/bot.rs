use anyhow::{Context, Result};
use chrono::{Duration as ChronoDuration, NaiveDate, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use sweep_bot::ai::{MarketConditions, SetupSnapshot, TradeAdvisor};
use sweep_bot::config::Config;
use sweep_bot::core::confluence::{ConfluenceEngine, ConfluenceScan};
use sweep_bot::core::recovery::StateRecovery;
use sweep_bot::core::risk::RiskGate;
use sweep_bot::core::stops::StopPlanner;
use sweep_bot::core::sweeps::{SweepDetector, SweepScan};
use sweep_bot::core::swings::SwingTracker;
use sweep_bot::error::BotError;
use sweep_bot::events::{BotEvent, EventBus};
use sweep_bot::exchange::{
    quote_balance, ApiBuckets, CoinbaseClient, ExchangeApi, PaperExchange, PriceTick,
    TickerStream,
};
use sweep_bot::models::Timeframe;
use sweep_bot::notify::{Notifier, Severity};
use sweep_bot::store::{
    flags, CandleRepository, ConfluenceRepository, Database, FlagsRepository, SweepRepository,
    SwingRepository, TradeRepository,
};
use sweep_bot::trading::{MonitorEvent, TradeExecutor, TradeMonitor};

/// The composition root and scheduler. Owns every component, wires them
/// at startup, and drives the scanners from one loop so that state
/// transitions stay totally ordered.
pub struct SweepBot {
    config: Config,
    market: Arc<CoinbaseClient>,
    broker: Arc<dyn ExchangeApi>,
    paper: Option<Arc<PaperExchange>>,
    bus: EventBus,
    notifier: Notifier,

    flags: FlagsRepository,
    candles: CandleRepository,
    sweeps: SweepRepository,
    states: ConfluenceRepository,
    trades: TradeRepository,

    swing_tracker: SwingTracker,
    sweep_detector: SweepDetector,
    confluence: ConfluenceEngine,
    stop_planner: StopPlanner,
    risk_gate: RiskGate,
    advisor: TradeAdvisor,
    executor: TradeExecutor,
    monitor: TradeMonitor,

    last_spread: Option<f64>,
    last_processed: HashMap<Timeframe, i64>,
    last_prune_day: Option<NaiveDate>,
    halted: bool,
}

impl SweepBot {
    pub async fn new(config: Config) -> Result<Self> {
        info!("{}", "=".repeat(60));
        info!("Sweep confluence bot starting up");
        info!(
            "Mode: {}",
            if config.paper_trade {
                "PAPER TRADING"
            } else {
                "LIVE TRADING"
            }
        );
        info!("Symbol: {}", config.symbol);
        info!("{}", "=".repeat(60));

        let db = Database::new(&config.database_url).await?;

        let buckets = Arc::new(ApiBuckets::new(
            config.public_rate_per_sec,
            config.private_rate_per_sec,
            config.order_rate_per_sec,
        ));
        let market = Arc::new(CoinbaseClient::new(&config, buckets));

        let paper = if config.paper_trade {
            Some(Arc::new(PaperExchange::new(
                &config.symbol,
                config.paper_starting_balance,
            )))
        } else {
            None
        };
        let broker: Arc<dyn ExchangeApi> = match &paper {
            Some(p) => p.clone(),
            None => market.clone(),
        };

        let flags_repo = FlagsRepository::new(db.clone());
        flags_repo
            .set_bool(flags::PAPER_MODE, config.paper_trade)
            .await?;

        let candles = CandleRepository::new(db.clone());
        let swings = SwingRepository::new(db.clone());
        let sweeps = SweepRepository::new(db.clone());
        let states = ConfluenceRepository::new(db.clone());
        let trades = TradeRepository::new(db.clone());
        let notifier = Notifier::new(config.webhook_url.clone());

        let swing_tracker = SwingTracker::new(candles.clone(), swings.clone());
        let sweep_detector = SweepDetector::new(
            swings.clone(),
            sweeps.clone(),
            config.sweep_threshold,
            config.sweep_ttl_hours,
        );
        let confluence = ConfluenceEngine::new(
            candles.clone(),
            states.clone(),
            sweeps.clone(),
            config.choch_lookback,
            config.fvg_scan_window,
            config.fvg_min_gap_percent,
            config.bos_threshold,
            config.sweep_ttl_hours,
        );
        let stop_planner = StopPlanner::new(
            swings.clone(),
            config.long_stop_buffer,
            config.short_stop_buffer,
            config.stop_distance_min,
            config.stop_distance_max,
            config.min_rr,
            config.risk_per_trade,
        );
        let risk_gate = RiskGate::new(
            trades.clone(),
            market.clone(),
            config.max_open_positions,
            config.max_daily_loss,
            config.max_consecutive_losses,
            config.min_account_balance,
        );
        let advisor = TradeAdvisor::new(&config);
        let executor = TradeExecutor::new(
            broker.clone(),
            trades.clone(),
            notifier.clone(),
            config.entry_price_tolerance,
            config.entry_fill_timeout_secs,
            config.entry_poll_interval_secs,
        );
        let monitor = TradeMonitor::new(
            broker.clone(),
            trades.clone(),
            notifier.clone(),
            config.max_trade_hours,
            config.trailing_trigger,
            config.trailing_mode,
            config.trailing_entry_band,
        );

        Ok(Self {
            config,
            market,
            broker,
            paper,
            bus: EventBus::default(),
            notifier,
            flags: flags_repo,
            candles,
            sweeps,
            states,
            trades,
            swing_tracker,
            sweep_detector,
            confluence,
            stop_planner,
            risk_gate,
            advisor,
            executor,
            monitor,
            last_spread: None,
            last_processed: HashMap::new(),
            last_prune_day: None,
            halted: false,
        })
    }

    pub async fn run(&mut self) -> Result<()> {
        self.startup_recovery().await?;
        self.print_status().await;

        let (tick_tx, mut tick_rx) = mpsc::channel::<PriceTick>(256);
        let stream = TickerStream::new(
            &self.config.symbol,
            self.market.clone(),
            self.config.ws_heartbeat_secs,
            self.config.ws_max_reconnect_attempts,
            self.config.ws_backoff_cap_secs,
        );
        let stream_task = tokio::spawn(async move { stream.run(tick_tx).await });

        // observers get the event firehose at debug level
        let mut observer_rx = self.bus.subscribe();
        tokio::spawn(async move {
            while let Ok(event) = observer_rx.recv().await {
                debug!(?event, "bus");
            }
        });

        let mut collect_timer =
            tokio::time::interval(Duration::from_secs(self.config.collector_interval_secs));
        let mut monitor_timer =
            tokio::time::interval(Duration::from_secs(self.config.monitor_interval_secs));
        let mut flags_timer = tokio::time::interval(Duration::from_secs(5));

        info!("Bot is now running. Press Ctrl+C to stop.");

        let result = loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("Shutting down...");
                    break Ok(());
                }
                maybe_tick = tick_rx.recv() => {
                    match maybe_tick {
                        Some(tick) => self.on_tick(tick).await,
                        None => {
                            self.notifier.notify(
                                Severity::Crit,
                                "price_feed_lost",
                                &[("symbol", self.config.symbol.clone())],
                            );
                            break Err(anyhow::anyhow!("price feed terminated"));
                        }
                    }
                }
                _ = collect_timer.tick() => {
                    if !self.halted {
                        if let Err(e) = self.collect_candles().await {
                            warn!(error = %e, "candle collection pass failed");
                        }
                    }
                }
                _ = monitor_timer.tick() => {
                    match self.monitor.sweep_once(Utc::now()).await {
                        Ok(events) => self.publish_monitor_events(&events),
                        Err(e) => warn!(error = %e, "monitor sweep failed"),
                    }
                }
                _ = flags_timer.tick() => {
                    if let Err(e) = self.check_emergency().await {
                        warn!(error = %e, "emergency flag check failed");
                    }
                }
            }
        };

        stream_task.abort();
        self.print_status().await;
        info!("Bot stopped.");
        result
    }

    /// Re-arm or expire whatever confluence state survived the restart.
    async fn startup_recovery(&mut self) -> Result<()> {
        let recovery = StateRecovery::new(
            self.states.clone(),
            self.sweeps.clone(),
            self.config.sweep_ttl_hours,
        );
        let report = recovery.run(Utc::now()).await?;
        for id in &report.expired_state_ids {
            self.bus.publish(BotEvent::SetupExpired { state_id: *id });
        }
        if let Some(recovered) = report.recovered.into_iter().next() {
            self.confluence.arm(recovered.state, recovered.bias);
        }
        Ok(())
    }

    async fn on_tick(&mut self, tick: PriceTick) {
        if let Some(paper) = &self.paper {
            paper.set_price(tick.price, tick.at);
        }
        if self.halted {
            return;
        }

        self.last_spread = tick.spread().or(self.last_spread);
        self.bus.publish(BotEvent::PriceTick {
            price: tick.price,
            at: tick.at,
        });

        match self.sweep_detector.check_and_emit(tick.price, tick.at).await {
            Ok(SweepScan::Emitted(emitted)) => {
                self.bus.publish(BotEvent::SweepDetected {
                    sweep_id: emitted.sweep.id,
                    kind: emitted.sweep.kind,
                    bias: emitted.sweep.bias,
                    price: emitted.sweep.price_at_detection,
                });
                for id in &emitted.superseded_state_ids {
                    self.bus.publish(BotEvent::SetupExpired { state_id: *id });
                    self.confluence.disarm(*id);
                }
                self.confluence.arm(emitted.state, emitted.sweep.bias);
            }
            Ok(SweepScan::NoChange) => {}
            Err(e) => warn!(error = %e, "sweep detection failed on tick"),
        }

        match self.confluence.on_tick(tick.price, tick.at).await {
            Ok(scan) => self.handle_confluence_scan(scan).await,
            Err(e) => warn!(error = %e, "confluence scan failed on tick"),
        }
    }

    /// Pull recent candles from the exchange, store the fully closed
    /// ones, and feed every newly closed bucket through the scanners in
    /// bucket order.
    async fn collect_candles(&mut self) -> Result<()> {
        let now = Utc::now();

        for timeframe in [Timeframe::H4, Timeframe::M5] {
            let step = timeframe.as_seconds();
            let lookback_buckets: i64 = if self.candles.latest(timeframe, 1).await?.is_empty() {
                match timeframe {
                    Timeframe::M5 => 600,
                    _ => self.config.h4_retention_buckets as i64,
                }
            } else {
                10
            };
            let from = now - ChronoDuration::seconds(step * lookback_buckets);

            let fetched = self
                .market
                .get_candles(timeframe, from, now)
                .await
                .with_context(|| format!("candle fetch failed for {timeframe}"))?;

            let mut new_closes = Vec::new();
            for candle in fetched.iter() {
                // the forming bucket stays out: rows are immutable
                let closed = candle.bucket_start + ChronoDuration::seconds(step) <= now;
                if !closed {
                    continue;
                }
                self.candles.insert(timeframe, candle).await?;

                let bucket = candle.bucket_start.timestamp();
                if bucket > self.last_processed.get(&timeframe).copied().unwrap_or(i64::MIN) {
                    new_closes.push(candle.clone());
                }
            }

            new_closes.sort_by_key(|c| c.bucket_start);
            for candle in new_closes {
                self.last_processed
                    .insert(timeframe, candle.bucket_start.timestamp());
                self.bus.publish(BotEvent::CandleClosed {
                    timeframe,
                    bucket_start: candle.bucket_start,
                    close: candle.close,
                });

                if let Err(e) = self.swing_tracker.on_candle_close(timeframe).await {
                    warn!(error = %e, timeframe = %timeframe, "swing tracking failed");
                }

                match timeframe {
                    Timeframe::H4 => {
                        match self.sweep_detector.on_h4_close(&candle).await {
                            Ok(SweepScan::Emitted(emitted)) => {
                                self.bus.publish(BotEvent::SweepDetected {
                                    sweep_id: emitted.sweep.id,
                                    kind: emitted.sweep.kind,
                                    bias: emitted.sweep.bias,
                                    price: emitted.sweep.price_at_detection,
                                });
                                for id in &emitted.superseded_state_ids {
                                    self.bus.publish(BotEvent::SetupExpired { state_id: *id });
                                    self.confluence.disarm(*id);
                                }
                                self.confluence.arm(emitted.state, emitted.sweep.bias);
                            }
                            Ok(SweepScan::NoChange) => {}
                            Err(e) => warn!(error = %e, "sweep detection failed on 4h close"),
                        }
                    }
                    Timeframe::M5 => {
                        match self.confluence.on_m5_close(&candle).await {
                            Ok(scan) => self.handle_confluence_scan(scan).await,
                            Err(e) => warn!(error = %e, "confluence scan failed on 5m close"),
                        }
                    }
                    Timeframe::H1 => unreachable!("1h is never collected directly"),
                }
            }
        }

        let gaps = self.candles.detect_gaps(Timeframe::M5, 24).await?;
        if !gaps.is_empty() {
            warn!(
                missing = gaps.len(),
                oldest = %gaps[0],
                "5m candle gaps in the trailing window"
            );
        }

        self.prune_if_due(now.date_naive()).await?;
        Ok(())
    }

    async fn prune_if_due(&mut self, today: NaiveDate) -> Result<()> {
        if self.last_prune_day == Some(today) {
            return Ok(());
        }
        self.last_prune_day = Some(today);

        let now = Utc::now();
        let m5_cutoff = now - ChronoDuration::days(self.config.m5_retention_days);
        let removed_m5 = self.candles.prune(Timeframe::M5, m5_cutoff).await?;

        let h4_cutoff = now
            - ChronoDuration::seconds(
                Timeframe::H4.as_seconds() * self.config.h4_retention_buckets as i64,
            );
        let removed_h4 = self.candles.prune(Timeframe::H4, h4_cutoff).await?;

        if removed_m5 + removed_h4 > 0 {
            info!(removed_m5, removed_h4, "candle retention prune");
        }
        Ok(())
    }

    async fn handle_confluence_scan(&mut self, scan: ConfluenceScan) {
        match scan {
            ConfluenceScan::Advanced(phase) => {
                if let Some(state_id) = self.confluence.armed_state_id() {
                    self.bus.publish(BotEvent::PhaseChanged { state_id, phase });
                }
            }
            ConfluenceScan::SetupReady { state_id } => {
                self.bus.publish(BotEvent::SetupReady { state_id });
                if let Err(e) = self.handle_setup(state_id).await {
                    error!(state_id, error = %e, "setup pipeline failed");
                }
            }
            ConfluenceScan::Expired { state_id } => {
                self.bus.publish(BotEvent::SetupExpired { state_id });
            }
            ConfluenceScan::NoChange | ConfluenceScan::Idle => {}
        }
    }

    /// The trade pipeline for a completed setup: stop plan, risk gate,
    /// model decision, execution.
    async fn handle_setup(&mut self, state_id: i64) -> Result<()> {
        let now = Utc::now();
        let state = self
            .states
            .get(state_id)
            .await?
            .context("completed state vanished")?;
        let sweep = self
            .sweeps
            .get(state.sweep_id)
            .await?
            .context("setup references a missing sweep")?;
        let direction = sweep.bias.to_direction();

        let current_price = self.market.best_price().await?;

        let Some(stop) = self.stop_planner.plan(current_price, direction).await? else {
            info!(state_id, "setup rejected: no valid stop");
            self.notifier.notify(
                Severity::Warn,
                "setup_rejected",
                &[
                    ("state_id", state_id.to_string()),
                    ("reason", "no valid stop".to_string()),
                ],
            );
            return Ok(());
        };

        let accounts = self.broker.list_accounts().await?;
        let balance = quote_balance(&accounts, &self.config.symbol);

        let risk = self.risk_gate.check(balance, now).await?;
        if !risk.passed() {
            let reasons: Vec<String> =
                risk.failures.iter().map(|f| f.to_string()).collect();
            info!(state_id, reasons = %reasons.join("; "), "setup blocked by risk gate");
            self.notifier.notify(
                Severity::Warn,
                "risk_gate_blocked",
                &[
                    ("state_id", state_id.to_string()),
                    ("checks", reasons.join("; ")),
                ],
            );
            return Ok(());
        }

        let size = self
            .stop_planner
            .position_size(balance, current_price, stop.price);

        let m5 = self.candles.latest(Timeframe::M5, 20).await?;
        let h4 = self.candles.latest(Timeframe::H4, 6).await?;
        let market = MarketConditions::assess(
            &m5,
            &h4,
            self.last_spread,
            current_price,
            now,
            &self.config.event_windows,
        );

        let snapshot = SetupSnapshot::assemble(
            &sweep,
            &state,
            &stop,
            size,
            current_price,
            balance,
            market,
        );
        let verdict = self.advisor.decide(&snapshot).await?;

        if !verdict.approved {
            let reason = verdict
                .rejection
                .unwrap_or_else(|| "model declined".to_string());
            info!(state_id, reason = %reason, "setup not taken");
            self.notifier.notify(
                Severity::Warn,
                "ai_rejected",
                &[("state_id", state_id.to_string()), ("reason", reason)],
            );
            return Ok(());
        }

        // a stale price at execution time is retried once
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.executor.execute(&verdict, state_id).await {
                Ok(trade) => {
                    self.bus.publish(BotEvent::TradeOpened { trade_id: trade.id });
                    self.notifier.notify(
                        Severity::Info,
                        "trade_opened",
                        &[
                            ("trade_id", trade.id.to_string()),
                            ("direction", trade.direction.to_string()),
                            ("entry", format!("{:.2}", trade.entry_price)),
                            ("stop", format!("{:.2}", trade.stop_price)),
                            ("tp", format!("{:.2}", trade.take_profit)),
                        ],
                    );
                    return Ok(());
                }
                Err(BotError::ExchangeConflict {
                    reason,
                    fatal_for_trade: false,
                }) if attempt == 1 => {
                    warn!(state_id, reason = %reason, "stale price at execution, retrying once");
                    continue;
                }
                Err(e) => {
                    error!(state_id, error = %e, "execution failed");
                    self.notifier.notify(
                        Severity::Crit,
                        "execution_failed",
                        &[
                            ("state_id", state_id.to_string()),
                            ("error", e.to_string()),
                        ],
                    );
                    return Ok(());
                }
            }
        }
    }

    fn publish_monitor_events(&self, events: &[MonitorEvent]) {
        for event in events {
            match event {
                MonitorEvent::Closed {
                    trade_id,
                    outcome,
                    pnl_quote,
                } => self.bus.publish(BotEvent::TradeClosed {
                    trade_id: *trade_id,
                    outcome: *outcome,
                    pnl_quote: *pnl_quote,
                }),
                MonitorEvent::TrailingActivated { trade_id, new_stop } => {
                    info!(trade_id, new_stop, "trailing stop active");
                }
                MonitorEvent::Flagged { trade_id, reason } => {
                    warn!(trade_id, reason = %reason, "trade flagged for operator");
                }
            }
        }
    }

    /// Emergency stop: close everything and pause the scanners until the
    /// operator clears the flag.
    async fn check_emergency(&mut self) -> Result<()> {
        let stop = self.flags.get_bool(flags::EMERGENCY_STOP).await?;

        if stop && !self.halted {
            warn!("EMERGENCY STOP set: closing positions, pausing scanners");
            self.halted = true;
            let events = self.monitor.emergency_close_all(Utc::now()).await?;
            self.publish_monitor_events(&events);
            self.notifier.notify(
                Severity::Crit,
                "emergency_stop",
                &[("closed_trades", events.len().to_string())],
            );
        } else if !stop && self.halted {
            info!("emergency stop cleared, scanners resume");
            self.halted = false;
        }
        Ok(())
    }

    async fn print_status(&self) {
        let open = self.trades.open_count().await.unwrap_or(0);
        info!("Open trades: {open}");
        if let Ok(accounts) = self.broker.list_accounts().await {
            let balance = quote_balance(&accounts, &self.config.symbol);
            info!("Balance: ${balance:.2}");
        }
        if let Some(state_id) = self.confluence.armed_state_id() {
            info!("Armed confluence state: {state_id}");
        }
    }
}
