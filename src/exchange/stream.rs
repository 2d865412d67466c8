use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{info, warn};

use crate::exchange::CoinbaseClient;

const WS_URL: &str = "wss://advanced-trade-ws.coinbase.com";

/// One ticker update off the wire. Bid/ask are carried when the exchange
/// includes them; the spread check in the AI safety overrides uses them.
#[derive(Debug, Clone, Copy)]
pub struct PriceTick {
    pub price: f64,
    pub best_bid: Option<f64>,
    pub best_ask: Option<f64>,
    pub at: DateTime<Utc>,
}

impl PriceTick {
    /// Relative bid-ask spread, when both sides are known.
    pub fn spread(&self) -> Option<f64> {
        match (self.best_bid, self.best_ask) {
            (Some(bid), Some(ask)) if bid > 0.0 => Some((ask - bid) / bid),
            _ => None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct WsMessage {
    #[serde(default)]
    channel: String,
    #[serde(default)]
    events: Vec<WsEvent>,
}

#[derive(Debug, Deserialize)]
struct WsEvent {
    #[serde(default)]
    tickers: Vec<WsTicker>,
}

#[derive(Debug, Deserialize)]
struct WsTicker {
    #[serde(default)]
    price: String,
    #[serde(default)]
    best_bid: String,
    #[serde(default)]
    best_ask: String,
}

/// Ticker subscription with a heartbeat watchdog. Any frame resets the
/// watchdog; silence past the deadline forces a reconnect with
/// exponential backoff, and the attempt budget turns a dead feed into an
/// error instead of looping forever.
pub struct TickerStream {
    symbol: String,
    client: Arc<CoinbaseClient>,
    heartbeat: Duration,
    max_attempts: u32,
    backoff_cap: Duration,
}

impl TickerStream {
    pub fn new(
        symbol: &str,
        client: Arc<CoinbaseClient>,
        heartbeat_secs: u64,
        max_attempts: u32,
        backoff_cap_secs: u64,
    ) -> Self {
        Self {
            symbol: symbol.to_string(),
            client,
            heartbeat: Duration::from_secs(heartbeat_secs),
            max_attempts,
            backoff_cap: Duration::from_secs(backoff_cap_secs),
        }
    }

    /// Run until the sender closes or the reconnect budget is exhausted.
    pub async fn run(&self, tx: mpsc::Sender<PriceTick>) -> Result<()> {
        let mut attempt: u32 = 0;
        let mut backoff = Duration::from_secs(1);

        loop {
            match self.run_connection(&tx).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    attempt += 1;
                    if attempt >= self.max_attempts {
                        return Err(e.context(format!(
                            "ticker stream gave up after {attempt} reconnect attempts"
                        )));
                    }
                    warn!(attempt, error = %e, "ticker stream dropped, reconnecting");
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(self.backoff_cap);
                }
            }
        }
    }

    /// One connection lifetime: subscribe, then pump frames until the
    /// watchdog fires or the connection dies.
    async fn run_connection(&self, tx: &mpsc::Sender<PriceTick>) -> Result<()> {
        let (ws, _) = connect_async(WS_URL)
            .await
            .context("failed to connect ticker WebSocket")?;
        let (mut write, mut read) = ws.split();

        // fresh token per subscribe
        let jwt = self.client.generate_jwt("GET", "/ws")?;
        for channel in ["ticker", "heartbeats"] {
            let sub = json!({
                "type": "subscribe",
                "product_ids": [self.symbol],
                "channel": channel,
                "jwt": jwt,
            });
            write
                .send(Message::Text(sub.to_string()))
                .await
                .context("failed to subscribe")?;
        }
        info!(symbol = %self.symbol, "ticker WebSocket subscribed");

        loop {
            let frame = tokio::time::timeout(self.heartbeat, read.next()).await;
            let message = match frame {
                Err(_) => anyhow::bail!("no frame within heartbeat window"),
                Ok(None) => anyhow::bail!("ticker WebSocket closed by peer"),
                Ok(Some(m)) => m.context("ticker WebSocket read error")?,
            };

            let text = match message {
                Message::Text(t) => t,
                Message::Ping(_) | Message::Pong(_) => continue,
                Message::Close(_) => anyhow::bail!("ticker WebSocket close frame"),
                _ => continue,
            };

            let parsed: WsMessage = match serde_json::from_str(&text) {
                Ok(p) => p,
                Err(_) => continue,
            };
            if parsed.channel != "ticker" {
                // heartbeat and subscription acks only reset the watchdog
                continue;
            }

            for event in parsed.events {
                for ticker in event.tickers {
                    let Ok(price) = ticker.price.parse::<f64>() else {
                        continue;
                    };
                    let tick = PriceTick {
                        price,
                        best_bid: ticker.best_bid.parse().ok(),
                        best_ask: ticker.best_ask.parse().ok(),
                        at: Utc::now(),
                    };
                    if tx.send(tick).await.is_err() {
                        // receiver dropped: orderly shutdown
                        return Ok(());
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spread_requires_both_sides() {
        let tick = PriceTick {
            price: 90_000.0,
            best_bid: Some(89_990.0),
            best_ask: Some(90_010.0),
            at: Utc::now(),
        };
        let spread = tick.spread().unwrap();
        assert!((spread - 20.0 / 89_990.0).abs() < 1e-12);

        let no_book = PriceTick {
            price: 90_000.0,
            best_bid: None,
            best_ask: Some(90_010.0),
            at: Utc::now(),
        };
        assert!(no_book.spread().is_none());
    }

    #[test]
    fn ticker_frames_parse() {
        let raw = r#"{
            "channel": "ticker",
            "events": [{
                "type": "update",
                "tickers": [{
                    "product_id": "BTC-USD",
                    "price": "90000.5",
                    "best_bid": "89999.0",
                    "best_ask": "90001.0"
                }]
            }]
        }"#;
        let parsed: WsMessage = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed.channel, "ticker");
        assert_eq!(parsed.events[0].tickers[0].price, "90000.5");
    }
}
