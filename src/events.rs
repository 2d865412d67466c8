use chrono::{DateTime, Utc};
use tokio::sync::broadcast;

use crate::models::{Bias, Phase, SwingKind, Timeframe, TradeOutcome};

/// Everything the pipeline announces to in-process observers. Values are
/// immutable snapshots; slow subscribers lag and drop, they never block
/// the producer.
#[derive(Debug, Clone)]
pub enum BotEvent {
    PriceTick {
        price: f64,
        at: DateTime<Utc>,
    },
    CandleClosed {
        timeframe: Timeframe,
        bucket_start: DateTime<Utc>,
        close: f64,
    },
    SweepDetected {
        sweep_id: i64,
        kind: SwingKind,
        bias: Bias,
        price: f64,
    },
    PhaseChanged {
        state_id: i64,
        phase: Phase,
    },
    SetupReady {
        state_id: i64,
    },
    SetupExpired {
        state_id: i64,
    },
    TradeOpened {
        trade_id: i64,
    },
    TradeClosed {
        trade_id: i64,
        outcome: TradeOutcome,
        pnl_quote: f64,
    },
}

/// In-process fan-out over a broadcast channel.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<BotEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn publish(&self, event: BotEvent) {
        // A send error just means nobody is subscribed right now.
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BotEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
