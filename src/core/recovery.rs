use anyhow::{anyhow, Result};
use chrono::{DateTime, Duration, Utc};
use tracing::{info, warn};

use crate::models::{Bias, ConfluenceState, SwingKind};
use crate::store::{ConfluenceRepository, SweepRepository};

/// A state that survived restart and should be re-armed at its persisted
/// phase, with the bias of its originating sweep.
#[derive(Debug, Clone)]
pub struct RecoveredState {
    pub state: ConfluenceState,
    pub bias: Bias,
}

#[derive(Debug, Default)]
pub struct RecoveryReport {
    pub recovered: Vec<RecoveredState>,
    pub expired_state_ids: Vec<i64>,
}

/// Startup pass over persisted confluence state: stale states are
/// expired, live ones handed back to the scanner. Only one state may be
/// active, so anything beyond the newest survivor is expired too.
pub struct StateRecovery {
    states: ConfluenceRepository,
    sweeps: SweepRepository,
    ttl: Duration,
}

impl StateRecovery {
    pub fn new(
        states: ConfluenceRepository,
        sweeps: SweepRepository,
        ttl_hours: i64,
    ) -> Self {
        Self {
            states,
            sweeps,
            ttl: Duration::hours(ttl_hours),
        }
    }

    pub async fn run(&self, now: DateTime<Utc>) -> Result<RecoveryReport> {
        let mut report = RecoveryReport::default();
        let open = self.states.non_terminal().await?;

        let mut survivors = Vec::new();
        for state in open {
            if now - state.created_at > self.ttl {
                self.states.expire(state.id, now).await?;
                self.sweeps.expire(state.sweep_id).await?;
                info!(state_id = state.id, "expired stale confluence state at startup");
                report.expired_state_ids.push(state.id);
            } else {
                survivors.push(state);
            }
        }

        // Newest survivor wins; older ones violate the single-active
        // invariant and are expired.
        survivors.sort_by_key(|s| s.created_at);
        while survivors.len() > 1 {
            let extra = survivors.remove(0);
            warn!(
                state_id = extra.id,
                "multiple live confluence states found, expiring the older"
            );
            self.states.expire(extra.id, now).await?;
            self.sweeps.expire(extra.sweep_id).await?;
            report.expired_state_ids.push(extra.id);
        }

        for state in survivors {
            let sweep = self
                .sweeps
                .get(state.sweep_id)
                .await?
                .ok_or_else(|| anyhow!("state {} references missing sweep {}", state.id, state.sweep_id))?;
            info!(
                state_id = state.id,
                phase = %state.phase,
                bias = %sweep.bias,
                "re-armed confluence state"
            );
            report.recovered.push(RecoveredState {
                state,
                bias: sweep.bias,
            });
        }

        Ok(report)
    }

    /// Coherence check for a completed state: all stage fields present,
    /// stage times strictly ordered, bias consistent with the sweep.
    /// Returns the list of problems found (empty when sound).
    pub async fn validate_complete(&self, state: &ConfluenceState) -> Result<Vec<String>> {
        let mut issues = Vec::new();

        if state.choch_price.is_none() || state.choch_at.is_none() {
            issues.push("missing CHoCH fields".to_string());
        }
        if state.fvg_low.is_none()
            || state.fvg_high.is_none()
            || state.fvg_fill_price.is_none()
            || state.fvg_fill_at.is_none()
        {
            issues.push("missing FVG fields".to_string());
        }
        if state.bos_price.is_none() || state.bos_at.is_none() {
            issues.push("missing BOS fields".to_string());
        }
        if issues.is_empty() && !state.times_ordered() {
            issues.push("stage times out of order".to_string());
        }

        let sweep = self
            .sweeps
            .get(state.sweep_id)
            .await?
            .ok_or_else(|| anyhow!("state {} references missing sweep {}", state.id, state.sweep_id))?;
        let expected = Bias::from_sweep_kind(sweep.kind);
        if sweep.bias != expected {
            issues.push(format!(
                "sweep bias {} inconsistent with kind {}",
                sweep.bias, sweep.kind
            ));
        }
        if let (Some(choch_price), Bias::Bullish, SwingKind::Low) =
            (state.choch_price, sweep.bias, sweep.kind)
        {
            if choch_price <= sweep.price_at_detection {
                issues.push("bullish CHoCH did not clear the sweep price".to_string());
            }
        }

        Ok(issues)
    }
}
