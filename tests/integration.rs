mod common;

use std::sync::Arc;

use common::{fresh_db, insert_h4, m5_candle, ts};

use sweep_bot::ai::{MarketConditions, RawDecision, SetupSnapshot, TradeAdvisor};
use sweep_bot::config::{Config, TrailingMode};
use sweep_bot::core::confluence::{ConfluenceEngine, ConfluenceScan};
use sweep_bot::core::recovery::StateRecovery;
use sweep_bot::core::risk::RiskGate;
use sweep_bot::core::stops::StopPlanner;
use sweep_bot::core::sweeps::{SweepDetector, SweepScan};
use sweep_bot::core::swings::SwingTracker;
use sweep_bot::exchange::{quote_balance, ExchangeApi, PaperExchange};
use sweep_bot::models::{
    Bias, Direction, Phase, StopSource, SwingKind, Timeframe, TradeOutcome, TradeStatus,
};
use sweep_bot::notify::Notifier;
use sweep_bot::store::{
    CandleRepository, ConfluenceRepository, Database, SweepRepository, SwingRepository,
    TradeRepository,
};
use sweep_bot::trading::{MonitorEvent, TradeExecutor, TradeMonitor};

fn offline_config() -> Config {
    let mut cfg = Config::from_env();
    cfg.paper_trade = true;
    cfg.coinbase_api_key = String::new();
    cfg.coinbase_api_secret = String::new();
    cfg.database_url = "sqlite::memory:".into();
    cfg.entry_fill_timeout_secs = 2;
    cfg.llm_timeout_secs = 1;
    cfg.event_windows = Vec::new();
    cfg
}

struct Pipeline {
    candles: CandleRepository,
    swings: SwingRepository,
    sweeps: SweepRepository,
    states: ConfluenceRepository,
    trades: TradeRepository,
    tracker: SwingTracker,
    detector: SweepDetector,
    engine: ConfluenceEngine,
    planner: StopPlanner,
    paper: Arc<PaperExchange>,
}

impl Pipeline {
    async fn new(db: &Database) -> Self {
        let cfg = offline_config();
        let candles = CandleRepository::new(db.clone());
        let swings = SwingRepository::new(db.clone());
        let sweeps = SweepRepository::new(db.clone());
        let states = ConfluenceRepository::new(db.clone());
        let trades = TradeRepository::new(db.clone());

        let tracker = SwingTracker::new(candles.clone(), swings.clone());
        let detector = SweepDetector::new(
            swings.clone(),
            sweeps.clone(),
            cfg.sweep_threshold,
            cfg.sweep_ttl_hours,
        );
        let engine = ConfluenceEngine::new(
            candles.clone(),
            states.clone(),
            sweeps.clone(),
            cfg.choch_lookback,
            cfg.fvg_scan_window,
            cfg.fvg_min_gap_percent,
            cfg.bos_threshold,
            cfg.sweep_ttl_hours,
        );
        let planner = StopPlanner::new(
            swings.clone(),
            cfg.long_stop_buffer,
            cfg.short_stop_buffer,
            cfg.stop_distance_min,
            cfg.stop_distance_max,
            cfg.min_rr,
            cfg.risk_per_trade,
        );
        let paper = Arc::new(PaperExchange::new(&cfg.symbol, 10_000.0));

        Self {
            candles,
            swings,
            sweeps,
            states,
            trades,
            tracker,
            detector,
            engine,
            planner,
            paper,
        }
    }

    async fn close_m5(&mut self, i: i64, ohlc: (f64, f64, f64, f64)) -> ConfluenceScan {
        let candle = m5_candle(i, ohlc.0, ohlc.1, ohlc.2, ohlc.3);
        self.candles.insert(Timeframe::M5, &candle).await.unwrap();
        self.engine.on_m5_close(&candle).await.unwrap()
    }
}

/// Scenario: the bullish LONG path from sweep to closed WIN trade.
#[tokio::test]
async fn bullish_sweep_to_winning_trade() {
    let db = fresh_db().await;
    let mut pipe = Pipeline::new(&db).await;

    // 4h swing low at 89,000 confirms with two lower-low neighbours each side
    insert_h4(
        &pipe.candles,
        &[
            (89_700.0, 89_900.0, 89_500.0, 89_600.0),
            (89_600.0, 89_700.0, 89_200.0, 89_400.0),
            (89_400.0, 89_500.0, 89_000.0, 89_200.0),
            (89_200.0, 89_600.0, 89_300.0, 89_500.0),
            (89_500.0, 89_900.0, 89_600.0, 89_800.0),
        ],
    )
    .await;
    let confirmed = pipe.tracker.on_candle_close(Timeframe::H4).await.unwrap();
    assert!(confirmed.iter().any(|s| s.kind == SwingKind::Low));
    let h4_swing = pipe
        .swings
        .active(Timeframe::H4, SwingKind::Low)
        .await
        .unwrap()
        .unwrap();
    assert!((h4_swing.price - 89_000.0).abs() < 1e-9);

    // a 5m swing low for the stop planner
    pipe.swings
        .record(Timeframe::M5, SwingKind::Low, ts(0), 89_100.0)
        .await
        .unwrap();

    // tick under 89,000 * 0.999 sweeps the low
    let scan = pipe.detector.check_and_emit(88_910.9, ts(100)).await.unwrap();
    let emitted = match scan {
        SweepScan::Emitted(e) => e,
        SweepScan::NoChange => panic!("sweep expected"),
    };
    assert_eq!(emitted.sweep.bias, Bias::Bullish);
    pipe.engine.arm(emitted.state.clone(), emitted.sweep.bias);

    // quiet 5m market, prior-5 high capped at 89,400
    for i in 0..5 {
        let scan = pipe
            .close_m5(i, (89_250.0, 89_400.0, 89_150.0, 89_300.0))
            .await;
        assert_eq!(scan, ConfluenceScan::NoChange);
    }

    // close at 89,600 breaks the prior-5 high: CHoCH
    let scan = pipe
        .close_m5(5, (89_350.0, 89_650.0, 89_300.0, 89_600.0))
        .await;
    assert_eq!(scan, ConfluenceScan::Advanced(Phase::WaitingFvg));

    // three candles leave a gap between 89,200 and 89,350
    pipe.close_m5(6, (89_150.0, 89_200.0, 89_100.0, 89_180.0)).await;
    pipe.close_m5(7, (89_250.0, 89_320.0, 89_240.0, 89_300.0)).await;
    pipe.close_m5(8, (89_360.0, 89_420.0, 89_350.0, 89_400.0)).await;

    // tick into the zone, then through choch * 1.001
    let scan = pipe.engine.on_tick(89_300.0, ts(8 * 300 + 60)).await.unwrap();
    assert_eq!(scan, ConfluenceScan::Advanced(Phase::WaitingBos));
    let scan = pipe.engine.on_tick(89_800.0, ts(8 * 300 + 120)).await.unwrap();
    let state_id = match scan {
        ConfluenceScan::SetupReady { state_id } => state_id,
        other => panic!("expected SetupReady, got {other:?}"),
    };

    let state = pipe.states.get(state_id).await.unwrap().unwrap();
    assert_eq!(state.phase, Phase::Complete);
    assert!(state.times_ordered());

    // recovery validation finds the completed state coherent
    let recovery = StateRecovery::new(pipe.states.clone(), pipe.sweeps.clone(), 12);
    let issues = recovery.validate_complete(&state).await.unwrap();
    assert!(issues.is_empty(), "issues: {issues:?}");

    // stop plan at an expected entry of 90,000
    let stop = pipe
        .planner
        .plan(90_000.0, Direction::Long)
        .await
        .unwrap()
        .expect("stop candidate");
    assert_eq!(stop.source, StopSource::M5);
    assert!((stop.price - 88_921.8).abs() < 0.1);
    assert!((stop.minimum_take_profit - 92_156.4).abs() < 0.1);

    // risk gate against the paper account
    pipe.paper.set_price(90_000.0, ts(3000));
    let gate = RiskGate::new(pipe.trades.clone(), pipe.paper.clone(), 1, 0.03, 3, 100.0);
    let accounts = pipe.paper.list_accounts().await.unwrap();
    let balance = quote_balance(&accounts, "BTC-USD");
    let verdict = gate.check(balance, ts(3000)).await.unwrap();
    assert!(verdict.passed(), "failures: {:?}", verdict.failures);

    let size = pipe.planner.position_size(balance, 90_000.0, stop.price);
    assert!((size.size_base - 0.09275).abs() < 0.0001);

    // the model approves; judge() validates the reply offline
    let sweep = pipe.sweeps.get(state.sweep_id).await.unwrap().unwrap();
    let market = MarketConditions {
        hourly_volatility: 0.01,
        volume_ratio: 1.0,
        spread: Some(0.0003),
        change_24h: 0.01,
        in_event_window: false,
    };
    let snapshot =
        SetupSnapshot::assemble(&sweep, &state, &stop, size, 90_000.0, balance, market);
    let advisor = TradeAdvisor::new(&offline_config());
    let decision = advisor.judge(
        &snapshot,
        RawDecision {
            decision: "YES".into(),
            direction: "long".into(),
            entry: 90_000.0,
            stop: stop.price,
            stop_source: "5m".into(),
            take_profit: stop.minimum_take_profit,
            size_base: size.size_base,
            rr: 2.0,
            confidence: 85.0,
            reasoning: "swept the 4h low, displaced through structure, gap filled".into(),
        },
    );
    assert!(decision.approved, "rejection: {:?}", decision.rejection);

    // execution against the paper book
    let executor = TradeExecutor::new(
        pipe.paper.clone(),
        pipe.trades.clone(),
        Notifier::new(None),
        0.002,
        2,
        1,
    );
    let trade = executor.execute(&decision, state_id).await.unwrap();
    assert_eq!(trade.status, TradeStatus::Open);
    assert_eq!(trade.direction, Direction::Long);

    // price runs to the target; the monitor books the win
    let monitor = TradeMonitor::new(
        pipe.paper.clone(),
        pipe.trades.clone(),
        Notifier::new(None),
        72,
        0.8,
        TrailingMode::Breakeven,
        0.005,
    );
    pipe.paper.set_price(92_200.0, ts(4000));
    let events = monitor.sweep_once(ts(4100)).await.unwrap();
    match events.as_slice() {
        [MonitorEvent::Closed {
            outcome, pnl_quote, ..
        }] => {
            assert_eq!(*outcome, TradeOutcome::Win);
            assert!(*pnl_quote > 0.0);
        }
        other => panic!("unexpected events {other:?}"),
    }

    let closed = pipe.trades.get(trade.id).await.unwrap().unwrap();
    assert_eq!(closed.status, TradeStatus::Closed);
    assert_eq!(closed.outcome, Some(TradeOutcome::Win));
    // size never mutates after creation
    assert!((closed.size_base - trade.size_base).abs() < 1e-12);
}

/// Scenario: bearish confluence completes but both stop candidates fall
/// outside the distance band, so no trade is created.
#[tokio::test]
async fn bearish_setup_dies_on_stop_rejection() {
    let db = fresh_db().await;
    let mut pipe = Pipeline::new(&db).await;

    // active 4h swing high at 91,000; swing candidates that will fail:
    // 5m high too close (0.355% after buffer), 4h high too far (3.055%)
    pipe.swings
        .record(Timeframe::H4, SwingKind::High, ts(0), 91_000.0)
        .await
        .unwrap();
    pipe.swings
        .record(Timeframe::M5, SwingKind::High, ts(0), 91_050.0)
        .await
        .unwrap();

    let scan = pipe.detector.check_and_emit(91_120.0, ts(100)).await.unwrap();
    let emitted = match scan {
        SweepScan::Emitted(e) => e,
        SweepScan::NoChange => panic!("sweep expected"),
    };
    assert_eq!(emitted.sweep.bias, Bias::Bearish);
    pipe.engine.arm(emitted.state.clone(), emitted.sweep.bias);

    // quiet market, prior-5 low floor at 90,900
    for i in 0..5 {
        pipe.close_m5(i, (91_000.0, 91_100.0, 90_900.0, 91_000.0)).await;
    }
    // close below the floor: CHoCH
    let scan = pipe
        .close_m5(5, (90_950.0, 91_000.0, 90_700.0, 90_750.0))
        .await;
    assert_eq!(scan, ConfluenceScan::Advanced(Phase::WaitingFvg));

    // bearish gap: c1.low 90,700 > c3.high 90,500
    pipe.close_m5(6, (90_750.0, 90_800.0, 90_700.0, 90_720.0)).await;
    pipe.close_m5(7, (90_600.0, 90_650.0, 90_550.0, 90_580.0)).await;
    pipe.close_m5(8, (90_480.0, 90_500.0, 90_400.0, 90_450.0)).await;

    // fill from below, then break structure downward
    let scan = pipe.engine.on_tick(90_600.0, ts(8 * 300 + 60)).await.unwrap();
    assert_eq!(scan, ConfluenceScan::Advanced(Phase::WaitingBos));
    let scan = pipe.engine.on_tick(90_600.0, ts(8 * 300 + 120)).await.unwrap();
    let state_id = match scan {
        ConfluenceScan::SetupReady { state_id } => state_id,
        other => panic!("expected SetupReady, got {other:?}"),
    };
    assert!(state_id > 0);

    // expected entry 91,000: both candidates rejected, setup ends here
    let stop = pipe.planner.plan(91_000.0, Direction::Short).await.unwrap();
    assert!(stop.is_none(), "no stop candidate should survive the band");
    assert_eq!(pipe.trades.open_count().await.unwrap(), 0);
}

/// Scenario: persisted mid-flight state survives a restart and re-arms
/// at its phase; a stale sibling expires.
#[tokio::test]
async fn restart_recovers_live_state() {
    let db = fresh_db().await;
    let mut pipe = Pipeline::new(&db).await;

    pipe.swings
        .record(Timeframe::H4, SwingKind::Low, ts(0), 89_000.0)
        .await
        .unwrap();
    let scan = pipe.detector.check_and_emit(88_910.9, ts(100)).await.unwrap();
    let emitted = match scan {
        SweepScan::Emitted(e) => e,
        SweepScan::NoChange => panic!("sweep expected"),
    };
    pipe.engine.arm(emitted.state.clone(), emitted.sweep.bias);

    for i in 0..5 {
        pipe.close_m5(i, (89_250.0, 89_400.0, 89_150.0, 89_300.0)).await;
    }
    pipe.close_m5(5, (89_350.0, 89_650.0, 89_300.0, 89_600.0)).await;

    // "restart": a fresh recovery pass over the same database
    let recovery = StateRecovery::new(pipe.states.clone(), pipe.sweeps.clone(), 12);
    let report = recovery.run(ts(2 * 3600)).await.unwrap();
    assert_eq!(report.recovered.len(), 1);
    let recovered = &report.recovered[0];
    assert_eq!(recovered.state.id, emitted.state.id);
    assert_eq!(recovered.state.phase, Phase::WaitingFvg);
    assert_eq!(recovered.bias, Bias::Bullish);

    // twelve hours on, the same pass expires it instead
    let report = recovery.run(ts(13 * 3600)).await.unwrap();
    assert!(report.recovered.is_empty());
    assert_eq!(report.expired_state_ids, vec![emitted.state.id]);
}

/// Scenario: a flagged market condition forces an approved decision to
/// no, and nothing reaches the executor.
#[tokio::test]
async fn safety_override_blocks_approved_decision() {
    let db = fresh_db().await;
    let pipe = Pipeline::new(&db).await;

    pipe.swings
        .record(Timeframe::H4, SwingKind::Low, ts(0), 89_000.0)
        .await
        .unwrap();
    pipe.swings
        .record(Timeframe::M5, SwingKind::Low, ts(0), 89_100.0)
        .await
        .unwrap();
    let emitted = pipe
        .sweeps
        .emit(ts(100), SwingKind::Low, 88_910.9, 1, 12)
        .await
        .unwrap();
    let state = emitted.state;
    let sweep = emitted.sweep;

    let stop = pipe
        .planner
        .plan(90_000.0, Direction::Long)
        .await
        .unwrap()
        .unwrap();
    let size = pipe.planner.position_size(10_000.0, 90_000.0, stop.price);

    // spread at 0.12%, past the 0.1% override line
    let market = MarketConditions {
        hourly_volatility: 0.01,
        volume_ratio: 1.0,
        spread: Some(0.0012),
        change_24h: 0.01,
        in_event_window: false,
    };
    let snapshot =
        SetupSnapshot::assemble(&sweep, &state, &stop, size, 90_000.0, 10_000.0, market);

    let advisor = TradeAdvisor::new(&offline_config());
    let decision = advisor.judge(
        &snapshot,
        RawDecision {
            decision: "YES".into(),
            direction: "long".into(),
            entry: 90_000.0,
            stop: stop.price,
            stop_source: "5m".into(),
            take_profit: stop.minimum_take_profit,
            size_base: size.size_base,
            rr: 2.0,
            confidence: 85.0,
            reasoning: "confident setup with every confluence stage in place".into(),
        },
    );

    assert!(!decision.approved);
    assert!(decision.rejection.unwrap().contains("spread"));
    assert_eq!(pipe.trades.open_count().await.unwrap(), 0);
}
