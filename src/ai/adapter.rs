use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::ai::client::LlmClient;
use crate::config::{Config, EventWindow};
use crate::core::stops::PositionSize;
use crate::models::{Bias, CandleSeries, ConfluenceState, Direction, StopSource, Sweep, SwingStop};

/// Everything the model sees about the setup, plus what the validator
/// checks the reply against.
#[derive(Debug, Clone, Serialize)]
pub struct SetupSnapshot {
    pub bias: Bias,
    pub direction: Direction,
    pub current_price: f64,
    pub account_balance: f64,
    pub sweep_kind: String,
    pub sweep_price: f64,
    pub choch_price: Option<f64>,
    pub fvg_low: Option<f64>,
    pub fvg_high: Option<f64>,
    pub fvg_fill_price: Option<f64>,
    pub bos_price: Option<f64>,
    pub stop: SwingStop,
    #[serde(skip)]
    pub size: PositionSize,
    pub size_base: f64,
    pub market: MarketConditions,
}

impl SetupSnapshot {
    pub fn assemble(
        sweep: &Sweep,
        state: &ConfluenceState,
        stop: &SwingStop,
        size: PositionSize,
        current_price: f64,
        account_balance: f64,
        market: MarketConditions,
    ) -> Self {
        Self {
            bias: sweep.bias,
            direction: sweep.bias.to_direction(),
            current_price,
            account_balance,
            sweep_kind: sweep.kind.to_string(),
            sweep_price: sweep.price_at_detection,
            choch_price: state.choch_price,
            fvg_low: state.fvg_low,
            fvg_high: state.fvg_high,
            fvg_fill_price: state.fvg_fill_price,
            bos_price: state.bos_price,
            stop: stop.clone(),
            size,
            size_base: size.size_base,
            market,
        }
    }
}

/// Snapshot of market health at decision time, feeding the safety
/// overrides.
#[derive(Debug, Clone, Serialize)]
pub struct MarketConditions {
    pub hourly_volatility: f64,
    pub volume_ratio: f64,
    pub spread: Option<f64>,
    pub change_24h: f64,
    pub in_event_window: bool,
}

impl MarketConditions {
    /// Derive conditions from recent candles and the latest book spread.
    /// Volatility looks at the last hour of 5m candles, volume at the
    /// last close against its trailing average, the 24h change at the 4h
    /// series.
    pub fn assess(
        m5: &CandleSeries,
        h4: &CandleSeries,
        spread: Option<f64>,
        current_price: f64,
        now: DateTime<Utc>,
        event_windows: &[EventWindow],
    ) -> Self {
        let hour = m5.tail(12);
        let hourly_volatility = if hour.is_empty() || current_price <= 0.0 {
            0.0
        } else {
            (hour.highs_max() - hour.lows_min()) / current_price
        };

        let volume_ratio = match (m5.last(), m5.tail(20).volume_mean()) {
            (Some(last), mean) if mean > 0.0 => last.volume / mean,
            _ => 1.0,
        };

        let change_24h = h4
            .tail(6)
            .first()
            .map(|c| (current_price - c.open) / c.open)
            .unwrap_or(0.0);

        Self {
            hourly_volatility,
            volume_ratio,
            spread,
            change_24h,
            in_event_window: event_windows.iter().any(|w| w.contains(now)),
        }
    }
}

/// The model's reply, parsed from the first JSON object in its output.
#[derive(Debug, Clone, Deserialize)]
pub struct RawDecision {
    pub decision: String,
    #[serde(default)]
    pub direction: String,
    #[serde(default)]
    pub entry: f64,
    #[serde(default)]
    pub stop: f64,
    #[serde(default)]
    pub stop_source: String,
    #[serde(default)]
    pub take_profit: f64,
    #[serde(default)]
    pub size_base: f64,
    #[serde(default)]
    pub rr: f64,
    #[serde(default)]
    pub confidence: f64,
    #[serde(default)]
    pub reasoning: String,
}

/// Final verdict handed to the executor.
#[derive(Debug, Clone)]
pub struct AdvisorVerdict {
    pub approved: bool,
    pub direction: Direction,
    pub entry: f64,
    pub stop: f64,
    pub stop_source: StopSource,
    pub take_profit: f64,
    pub size_base: f64,
    pub rr: f64,
    pub confidence: f64,
    pub reasoning: String,
    /// Why approval was withdrawn, when it was the validator or a safety
    /// override rather than the model saying no.
    pub rejection: Option<String>,
}

impl AdvisorVerdict {
    fn rejected(snapshot: &SetupSnapshot, reason: String) -> Self {
        Self {
            approved: false,
            direction: snapshot.direction,
            entry: snapshot.current_price,
            stop: snapshot.stop.price,
            stop_source: snapshot.stop.source,
            take_profit: snapshot.stop.minimum_take_profit,
            size_base: snapshot.size.size_base,
            rr: 0.0,
            confidence: 0.0,
            reasoning: String::new(),
            rejection: Some(reason),
        }
    }
}

/// Asks the model whether to take a completed setup, then distrusts the
/// answer: structural validation first, market-safety overrides second.
pub struct TradeAdvisor {
    llm: LlmClient,
    min_confidence: f64,
    entry_deviation_max: f64,
    stop_distance_min: f64,
    stop_distance_max: f64,
    min_rr: f64,
    rr_tolerance: f64,
    size_tolerance: f64,
    min_reasoning_len: usize,
    max_hourly_volatility: f64,
    min_volume_ratio: f64,
    max_spread: f64,
    max_daily_change: f64,
    price_sanity_min: f64,
    price_sanity_max: f64,
}

impl TradeAdvisor {
    pub fn new(cfg: &Config) -> Self {
        Self {
            llm: LlmClient::new(
                &cfg.llm_url,
                &cfg.llm_model,
                cfg.llm_temperature,
                cfg.llm_max_tokens,
                cfg.llm_timeout_secs,
            ),
            min_confidence: cfg.ai_min_confidence,
            entry_deviation_max: cfg.ai_entry_deviation_max,
            stop_distance_min: cfg.stop_distance_min,
            stop_distance_max: cfg.stop_distance_max,
            min_rr: cfg.min_rr,
            rr_tolerance: cfg.ai_rr_tolerance,
            size_tolerance: cfg.ai_size_tolerance,
            min_reasoning_len: cfg.ai_min_reasoning_len,
            max_hourly_volatility: cfg.max_hourly_volatility,
            min_volume_ratio: cfg.min_volume_ratio,
            max_spread: cfg.max_spread,
            max_daily_change: cfg.max_daily_change,
            price_sanity_min: cfg.price_sanity_min,
            price_sanity_max: cfg.price_sanity_max,
        }
    }

    /// Full decision path: prompt, parse, validate, override. A model
    /// timeout or unparseable reply is a rejection, never an error that
    /// stalls the scanner.
    pub async fn decide(&self, snapshot: &SetupSnapshot) -> Result<AdvisorVerdict> {
        let prompt = self.build_prompt(snapshot);

        let reply = match self.llm.generate(&prompt).await {
            Ok(text) => text,
            Err(e) => {
                warn!(error = %e, "model call failed, treating as rejection");
                return Ok(AdvisorVerdict::rejected(
                    snapshot,
                    format!("model unavailable: {e}"),
                ));
            }
        };

        let raw = match extract_first_json(&reply)
            .and_then(|json| serde_json::from_str::<RawDecision>(json).ok())
        {
            Some(raw) => raw,
            None => {
                warn!("model reply carried no parseable decision object");
                return Ok(AdvisorVerdict::rejected(
                    snapshot,
                    "unparseable model reply".to_string(),
                ));
            }
        };

        Ok(self.judge(snapshot, raw))
    }

    /// Validate the parsed reply and apply safety overrides. Pure of any
    /// I/O so the whole rule set is unit-testable.
    pub fn judge(&self, snapshot: &SetupSnapshot, raw: RawDecision) -> AdvisorVerdict {
        match self.validate(snapshot, &raw) {
            Err(reason) => {
                info!(reason = %reason, "model decision rejected by validator");
                AdvisorVerdict::rejected(snapshot, reason)
            }
            Ok(None) => {
                // the model itself said no
                let mut verdict = AdvisorVerdict::rejected(snapshot, "model declined".into());
                verdict.confidence = raw.confidence;
                verdict.reasoning = raw.reasoning;
                verdict.rejection = None;
                verdict
            }
            Ok(Some(stop_source)) => {
                let mut verdict = AdvisorVerdict {
                    approved: true,
                    direction: snapshot.direction,
                    entry: raw.entry,
                    stop: raw.stop,
                    stop_source,
                    take_profit: raw.take_profit,
                    size_base: raw.size_base,
                    rr: raw.rr,
                    confidence: raw.confidence,
                    reasoning: raw.reasoning.clone(),
                    rejection: None,
                };

                if let Some(reason) = self.safety_override(snapshot) {
                    warn!(
                        original_decision = "yes",
                        confidence = raw.confidence,
                        reason = %reason,
                        "market-safety override forced decision to no"
                    );
                    verdict.approved = false;
                    verdict.rejection = Some(reason);
                }
                verdict
            }
        }
    }

    /// Ok(None): clean "no". Ok(Some(source)): clean "yes". Err: the
    /// reply failed a structural check.
    fn validate(
        &self,
        snapshot: &SetupSnapshot,
        raw: &RawDecision,
    ) -> std::result::Result<Option<StopSource>, String> {
        match raw.decision.trim().to_ascii_uppercase().as_str() {
            "YES" => {}
            "NO" => return Ok(None),
            other => return Err(format!("decision must be YES or NO, got {other:?}")),
        }

        let expected_direction = snapshot.bias.to_direction();
        match Direction::parse(raw.direction.trim()) {
            Some(d) if d == expected_direction => {}
            _ => {
                return Err(format!(
                    "direction {:?} inconsistent with {} bias",
                    raw.direction, snapshot.bias
                ))
            }
        }

        let deviation = (raw.entry - snapshot.current_price).abs() / snapshot.current_price;
        if deviation > self.entry_deviation_max {
            return Err(format!(
                "entry {:.2} deviates {:.2}% from current price {:.2}",
                raw.entry,
                deviation * 100.0,
                snapshot.current_price
            ));
        }

        let stop_ok = match expected_direction {
            Direction::Long => raw.stop < raw.entry,
            Direction::Short => raw.stop > raw.entry,
        };
        if !stop_ok {
            return Err(format!(
                "stop {:.2} on the wrong side of entry {:.2}",
                raw.stop, raw.entry
            ));
        }

        let stop_distance = (raw.entry - raw.stop).abs() / raw.entry;
        if stop_distance < self.stop_distance_min || stop_distance > self.stop_distance_max {
            return Err(format!(
                "stop distance {:.2}% outside the accepted band",
                stop_distance * 100.0
            ));
        }

        let implied_rr = (raw.take_profit - raw.entry).abs() / (raw.entry - raw.stop).abs();
        if raw.rr < self.min_rr || (implied_rr - raw.rr).abs() > self.rr_tolerance {
            return Err(format!(
                "reported rr {:.2} under the floor or inconsistent with implied {:.2}",
                raw.rr, implied_rr
            ));
        }

        if raw.confidence < self.min_confidence {
            return Err(format!(
                "confidence {:.0} under the {} floor",
                raw.confidence, self.min_confidence
            ));
        }

        let planned = snapshot.size.size_base;
        if planned > 0.0 && ((raw.size_base - planned).abs() / planned) > self.size_tolerance {
            return Err(format!(
                "size {:.6} deviates from planned {:.6} beyond tolerance",
                raw.size_base, planned
            ));
        }

        if raw.reasoning.trim().len() < self.min_reasoning_len {
            return Err("reasoning too short to audit".to_string());
        }

        let stop_source = StopSource::parse(raw.stop_source.trim())
            .ok_or_else(|| format!("unknown stop source {:?}", raw.stop_source))?;

        Ok(Some(stop_source))
    }

    /// First tripped safety condition, if any.
    fn safety_override(&self, snapshot: &SetupSnapshot) -> Option<String> {
        let m = &snapshot.market;
        if m.hourly_volatility > self.max_hourly_volatility {
            return Some(format!(
                "hourly volatility {:.2}% over limit",
                m.hourly_volatility * 100.0
            ));
        }
        if m.volume_ratio < self.min_volume_ratio {
            return Some(format!(
                "volume at {:.0}% of average",
                m.volume_ratio * 100.0
            ));
        }
        if let Some(spread) = m.spread {
            if spread > self.max_spread {
                return Some(format!("spread {:.3}% too wide", spread * 100.0));
            }
        }
        if m.change_24h.abs() > self.max_daily_change {
            return Some(format!(
                "24h move {:.1}% over limit",
                m.change_24h * 100.0
            ));
        }
        if m.in_event_window {
            return Some("inside a flagged economic event window".to_string());
        }
        if snapshot.current_price < self.price_sanity_min
            || snapshot.current_price > self.price_sanity_max
        {
            return Some(format!(
                "price {:.2} outside the sanity band",
                snapshot.current_price
            ));
        }
        None
    }

    fn build_prompt(&self, snapshot: &SetupSnapshot) -> String {
        let setup = serde_json::to_string_pretty(snapshot).unwrap_or_default();
        format!(
            "You are the final reviewer for a BTC-USD spot setup produced by a \
             liquidity-sweep confluence scanner (sweep -> CHoCH -> FVG fill -> BOS).\n\
             Setup snapshot:\n{setup}\n\n\
             Decide whether to open the trade. Respond with a single JSON object and \
             nothing else:\n\
             {{\"decision\": \"YES|NO\", \"direction\": \"long|short\", \"entry\": number, \
             \"stop\": number, \"stop_source\": \"5m|4h\", \"take_profit\": number, \
             \"size_base\": number, \"rr\": number, \"confidence\": 0-100, \
             \"reasoning\": \"...\"}}\n\
             Keep entry near the current price, the stop at the planned swing stop, and \
             reward:risk at or above {:.1}.",
            self.min_rr
        )
    }
}

/// Extract the first balanced JSON object from free-form model output.
pub fn extract_first_json(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let bytes = text.as_bytes();
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, &b) in bytes.iter().enumerate().skip(start) {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..=i]);
                }
            }
            _ => {}
        }
    }
    None
}
