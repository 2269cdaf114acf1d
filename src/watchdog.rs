// =============================================================================
// Operational Watchdog — anomaly detection and the one-way kill-switch
// =============================================================================
//
// Runs its own pass every tick, per user, over the trailing window of shadow
// trades:
//
//   losing streak    — k consecutive marked losses summing past the dollar
//                      threshold. CRITICAL, trips the kill-switch.
//   rapid drawdown   — equity off more than the limit inside the window.
//                      HIGH, trips the kill-switch.
//   market mismatch  — repeated BUY fills against a SHORT_GAMMA tape, or
//                      repeated SELL fills against a LONG_GAMMA tape.
//                      MEDIUM, log only.
//
// Tripping writes `TradingStatus{enabled:false, disabled_by:"watchdog"}`,
// appends a CRITICAL unread alert, and records a WatchdogEvent. Nothing in
// the core ever re-enables a user; that takes a human.
// =============================================================================

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use tracing::{info, warn};
use uuid::Uuid;

use crate::clients::llm::{generate_with_deadline, LlmClient};
use crate::errors::CoreResult;
use crate::money::Money;
use crate::store::{get_doc, set_doc, Store, UserScope};
use crate::types::{
    Alert, AnomalyType, MarketRegime, RegimeLabel, Severity, ShadowTrade, Side, TradingStatus,
    WatchdogEvent,
};

/// Tunables for the anomaly detectors.
#[derive(Debug, Clone)]
pub struct WatchdogConfig {
    /// Consecutive losing trades that define a streak.
    pub streak_len: usize,
    /// Absolute dollar loss a streak must reach before tripping.
    pub streak_dollars: Money,
    /// Equity drawdown fraction inside the window that trips the switch.
    pub drawdown_limit: Money,
    /// Fills against the prevailing gamma regime (BUYs under SHORT_GAMMA,
    /// SELLs under LONG_GAMMA) before a mismatch event.
    pub mismatch_fills: usize,
    /// Lookback window, minutes.
    pub window_mins: i64,
}

/// Per-tick anomaly detector with an in-memory equity trail per user.
pub struct Watchdog {
    store: Arc<dyn Store>,
    llm: Arc<dyn LlmClient>,
    cfg: WatchdogConfig,
    llm_deadline: StdDuration,
    equity_trail: RwLock<HashMap<String, VecDeque<(DateTime<Utc>, Money)>>>,
}

impl Watchdog {
    pub fn new(
        store: Arc<dyn Store>,
        llm: Arc<dyn LlmClient>,
        cfg: WatchdogConfig,
        llm_deadline: StdDuration,
    ) -> Self {
        Self {
            store,
            llm,
            cfg,
            llm_deadline,
            equity_trail: RwLock::new(HashMap::new()),
        }
    }

    /// Feed the per-tick equity observation used by the drawdown detector.
    pub fn observe_equity(&self, uid: &str, equity: Money, at: DateTime<Utc>) {
        let cutoff = at - Duration::minutes(self.cfg.window_mins);
        let mut trail = self.equity_trail.write();
        let series = trail.entry(uid.to_string()).or_default();
        series.push_back((at, equity));
        while series.front().is_some_and(|(t, _)| *t < cutoff) {
            series.pop_front();
        }
    }

    /// One watchdog pass for one user. Returns the events recorded.
    pub async fn run_user(
        &self,
        scope: &UserScope,
        regime: Option<&MarketRegime>,
    ) -> CoreResult<Vec<WatchdogEvent>> {
        let now = Utc::now();
        let cutoff = now - Duration::minutes(self.cfg.window_mins);
        let trades = self.recent_trades(scope, cutoff).await?;

        let mut events = Vec::new();

        if let Some(explanation) = self.losing_streak(&trades) {
            events.push(
                self.record(
                    scope,
                    AnomalyType::LosingStreak,
                    Severity::Critical,
                    true,
                    explanation,
                )
                .await?,
            );
        }

        if let Some(explanation) = self.rapid_drawdown(&scope.uid)? {
            events.push(
                self.record(
                    scope,
                    AnomalyType::RapidDrawdown,
                    Severity::High,
                    true,
                    explanation,
                )
                .await?,
            );
        }

        if let Some(explanation) = self.market_mismatch(&trades, regime) {
            events.push(
                self.record(
                    scope,
                    AnomalyType::MarketMismatch,
                    Severity::Medium,
                    false,
                    explanation,
                )
                .await?,
            );
        }

        Ok(events)
    }

    // ── Detectors ───────────────────────────────────────────────────────

    fn losing_streak(&self, trades: &[ShadowTrade]) -> Option<String> {
        // Trailing run of consecutive losses, most recent last.
        let mut streak = Vec::new();
        for trade in trades.iter().rev() {
            if trade.pnl_percent.is_negative() {
                streak.push(trade);
            } else {
                break;
            }
        }
        if streak.len() < self.cfg.streak_len {
            return None;
        }

        let mut total_loss = Money::ZERO;
        for trade in &streak {
            total_loss = total_loss.checked_add(trade.current_pnl.abs()).ok()?;
        }
        if total_loss < self.cfg.streak_dollars {
            return None;
        }

        Some(format!(
            "{} consecutive losing trades totalling -{} inside {} minutes",
            streak.len(),
            total_loss,
            self.cfg.window_mins
        ))
    }

    fn rapid_drawdown(&self, uid: &str) -> CoreResult<Option<String>> {
        let trail = self.equity_trail.read();
        let Some(series) = trail.get(uid) else {
            return Ok(None);
        };
        let Some((_, latest)) = series.back() else {
            return Ok(None);
        };
        let Some(peak) = series.iter().map(|(_, e)| *e).max() else {
            return Ok(None);
        };
        if peak.is_zero() || *latest >= peak {
            return Ok(None);
        }

        let drop = peak.checked_sub(*latest)?.checked_div(peak, 8)?;
        if drop > self.cfg.drawdown_limit {
            Ok(Some(format!(
                "equity fell {} from {} to {} within {} minutes",
                drop, peak, latest, self.cfg.window_mins
            )))
        } else {
            Ok(None)
        }
    }

    fn market_mismatch(
        &self,
        trades: &[ShadowTrade],
        regime: Option<&MarketRegime>,
    ) -> Option<String> {
        let regime = regime?;
        // SHORT_GAMMA is the bearish amplifying tape, so repeated BUYs run
        // against it; LONG_GAMMA inverts the check.
        let against = match regime.regime {
            RegimeLabel::ShortGamma => Side::Buy,
            RegimeLabel::LongGamma => Side::Sell,
            RegimeLabel::Neutral => return None,
        };
        let count = trades.iter().filter(|t| t.side == against).count();
        if count >= self.cfg.mismatch_fills {
            Some(format!(
                "{count} {against} fills against a {} regime (net GEX {})",
                regime.regime, regime.net_gex
            ))
        } else {
            None
        }
    }

    // ── Recording ───────────────────────────────────────────────────────

    async fn recent_trades(
        &self,
        scope: &UserScope,
        cutoff: DateTime<Utc>,
    ) -> CoreResult<Vec<ShadowTrade>> {
        let rows = self.store.list(&scope.shadow_trades_prefix()).await?;
        let mut trades = Vec::new();
        for (path, _) in rows {
            match get_doc::<ShadowTrade>(self.store.as_ref(), &path).await {
                Ok(Some(t)) if t.last_updated >= cutoff => trades.push(t),
                Ok(_) => {}
                Err(e) => warn!(path = %path, error = %e, "unreadable trade in watchdog pass"),
            }
        }
        trades.sort_by_key(|t| t.last_updated);
        Ok(trades)
    }

    async fn record(
        &self,
        scope: &UserScope,
        anomaly: AnomalyType,
        severity: Severity,
        trip: bool,
        detail: String,
    ) -> CoreResult<WatchdogEvent> {
        let explanation = self.explain(anomaly, &detail).await;
        let tripped = if trip { self.trip(scope, &explanation).await? } else { false };

        let event = WatchdogEvent {
            id: Uuid::new_v4().to_string(),
            anomaly_type: anomaly,
            severity,
            kill_switch_activated: tripped,
            explanation,
            ts: Utc::now(),
        };
        set_doc(
            self.store.as_ref(),
            &scope.watchdog_event(&event.id),
            &event,
        )
        .await?;

        warn!(
            uid = %scope.uid,
            anomaly = %anomaly,
            severity = %severity,
            kill_switch = tripped,
            "watchdog anomaly recorded"
        );
        Ok(event)
    }

    /// Set the kill-switch if it is not already off. Returns whether this
    /// call performed the trip.
    async fn trip(&self, scope: &UserScope, explanation: &str) -> CoreResult<bool> {
        let path = scope.trading_status();
        scope.assert_owns(&path)?;

        let status: TradingStatus = get_doc(self.store.as_ref(), &path)
            .await?
            .unwrap_or_default();
        if !status.enabled {
            return Ok(false);
        }

        let disabled = TradingStatus {
            enabled: false,
            disabled_by: Some("watchdog".to_string()),
            reason: Some(explanation.to_string()),
            since: Utc::now(),
        };
        set_doc(self.store.as_ref(), &path, &disabled).await?;

        let alert = Alert {
            id: Uuid::new_v4().to_string(),
            alert_type: "kill_switch".to_string(),
            severity: Severity::Critical,
            title: "Trading disabled by watchdog".to_string(),
            message: explanation.to_string(),
            read: false,
            ts: Utc::now(),
        };
        set_doc(self.store.as_ref(), &scope.alert(&alert.id), &alert).await?;

        info!(uid = %scope.uid, "kill-switch tripped");
        Ok(true)
    }

    /// Advisory explanation, LLM when available, deterministic otherwise.
    async fn explain(&self, anomaly: AnomalyType, detail: &str) -> String {
        let fallback = format!("{anomaly}: {detail}");
        let prompt = format!(
            "Explain this trading anomaly to an account holder in one sentence: {fallback}"
        );
        match generate_with_deadline(self.llm.as_ref(), &prompt, self.llm_deadline).await {
            Ok(text) if !text.trim().is_empty() => text,
            _ => fallback,
        }
    }
}

impl std::fmt::Debug for Watchdog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Watchdog").field("cfg", &self.cfg).finish()
    }
}
