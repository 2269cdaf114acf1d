// =============================================================================
// Risk Circuit Breaker — ordered stateless guards over orchestrated signals
// =============================================================================
//
// Three guards, applied in order after consensus:
//   1. Daily Loss      — equity down more than the daily limit coerces the
//                        signal to HOLD with zero allocation.
//   2. Volatility      — an elevated ambient volatility index halves the
//                        allocation.
//   3. Concentration   — a BUY that would push one symbol past its share of
//                        NAV coerces to HOLD.
//
// Every triggered guard appends a human-readable reason to the signal.
// All comparisons run through the money kernel.
// =============================================================================

use tracing::warn;

use crate::errors::CoreResult;
use crate::maestro::OrchestratedSignal;
use crate::money::Money;
use crate::types::{AccountSnapshot, RiskOverrides, SignalKind};

/// Inputs the guards evaluate against.
#[derive(Debug, Clone)]
pub struct GuardContext {
    /// Equity at the day's first snapshot.
    pub starting_equity: Money,
    /// Equity right now.
    pub current_equity: Money,
    /// Ambient volatility index, when the data feed provides one.
    pub volatility_index: Option<Money>,
    /// Current broker positions, for concentration math.
    pub account: AccountSnapshot,
    /// Mark price for the signal's symbol.
    pub mark_price: Money,
}

/// The guard set with its configured limits.
#[derive(Debug, Clone)]
pub struct RiskBreaker {
    /// Daily loss fraction (0.02 = 2 %).
    pub daily_loss_limit: Money,
    /// Volatility index level above which allocation halves.
    pub volatility_threshold: Money,
    /// Maximum single-symbol weight of NAV (0.20 = 20 %).
    pub max_concentration: Money,
}

impl RiskBreaker {
    pub fn new(
        daily_loss_limit: Money,
        volatility_threshold: Money,
        max_concentration: Money,
    ) -> Self {
        Self {
            daily_loss_limit,
            volatility_threshold,
            max_concentration,
        }
    }

    /// Layer a user's risk-config overrides over the process-level limits.
    /// Unset fields keep the defaults.
    pub fn with_overrides(&self, overrides: Option<&RiskOverrides>) -> RiskBreaker {
        let Some(o) = overrides else {
            return self.clone();
        };
        RiskBreaker {
            daily_loss_limit: o.daily_loss_limit.unwrap_or(self.daily_loss_limit),
            volatility_threshold: o
                .volatility_threshold
                .unwrap_or(self.volatility_threshold),
            max_concentration: o.max_concentration.unwrap_or(self.max_concentration),
        }
    }

    /// Run all guards over `sig` in order, mutating it in place.
    pub fn apply(&self, sig: &mut OrchestratedSignal, ctx: &GuardContext) -> CoreResult<()> {
        self.daily_loss_guard(sig, ctx)?;
        self.volatility_guard(sig, ctx)?;
        self.concentration_guard(sig, ctx)?;
        Ok(())
    }

    // ── 1. Daily loss ───────────────────────────────────────────────────

    fn daily_loss_guard(&self, sig: &mut OrchestratedSignal, ctx: &GuardContext) -> CoreResult<()> {
        if ctx.starting_equity.is_zero() {
            return Ok(());
        }
        let change = ctx
            .current_equity
            .checked_sub(ctx.starting_equity)?
            .checked_div(ctx.starting_equity, 8)?;

        if change < self.daily_loss_limit.neg() {
            let reason = format!(
                "daily loss guard: equity change {} breaches limit -{}",
                change, self.daily_loss_limit
            );
            warn!(agent_id = %sig.agent_id, symbol = %sig.symbol, %change, "daily loss guard tripped");
            coerce_hold(sig, reason);
        }
        Ok(())
    }

    // ── 2. Volatility ───────────────────────────────────────────────────

    fn volatility_guard(&self, sig: &mut OrchestratedSignal, ctx: &GuardContext) -> CoreResult<()> {
        if sig.kind == SignalKind::Hold {
            return Ok(());
        }
        let Some(vol) = ctx.volatility_index else {
            return Ok(());
        };
        if vol > self.volatility_threshold {
            sig.allocation = sig
                .allocation
                .checked_mul(Money::parse_str("0.5").expect("literal"))?;
            sig.reasons.push(format!(
                "volatility guard: index {} above {}, allocation halved",
                vol, self.volatility_threshold
            ));
        }
        Ok(())
    }

    // ── 3. Concentration ────────────────────────────────────────────────

    fn concentration_guard(
        &self,
        sig: &mut OrchestratedSignal,
        ctx: &GuardContext,
    ) -> CoreResult<()> {
        if sig.kind != SignalKind::Buy || ctx.current_equity.is_zero() {
            return Ok(());
        }

        let existing = ctx.account.symbol_exposure(&sig.symbol, ctx.mark_price)?;
        let proposed = sig.allocation.checked_mul(ctx.current_equity)?;
        let weight = existing
            .checked_add(proposed)?
            .checked_div(ctx.current_equity, 8)?;

        if weight > self.max_concentration {
            let reason = format!(
                "concentration guard: {} weight {} would exceed {} of NAV",
                sig.symbol, weight, self.max_concentration
            );
            warn!(agent_id = %sig.agent_id, symbol = %sig.symbol, %weight, "concentration guard tripped");
            coerce_hold(sig, reason);
        }
        Ok(())
    }
}

fn coerce_hold(sig: &mut OrchestratedSignal, reason: String) {
    sig.kind = SignalKind::Hold;
    sig.allocation = Money::ZERO;
    sig.reasons.push(reason);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BrokerPosition, StrategyMode};
    use chrono::Utc;

    fn m(s: &str) -> Money {
        Money::parse_str(s).unwrap()
    }

    fn breaker() -> RiskBreaker {
        RiskBreaker::new(m("0.02"), m("30"), m("0.20"))
    }

    fn buy_signal(allocation: &str) -> OrchestratedSignal {
        OrchestratedSignal {
            agent_id: "momentum".into(),
            symbol: "SPY".into(),
            kind: SignalKind::Buy,
            confidence: 0.9,
            allocation: m(allocation),
            mode: StrategyMode::Active,
            reasoning: "test".into(),
            reasons: vec![],
            override_reason: None,
            metadata: None,
            provenance: None,
        }
    }

    fn ctx(starting: &str, current: &str, vol: Option<&str>) -> GuardContext {
        GuardContext {
            starting_equity: m(starting),
            current_equity: m(current),
            volatility_index: vol.map(m),
            account: AccountSnapshot {
                equity: m(current),
                cash: m(current),
                buying_power: m(current),
                positions: vec![],
                as_of: Utc::now(),
            },
            mark_price: m("448.00"),
        }
    }

    #[test]
    fn daily_loss_past_two_percent_holds() {
        // The -2.1% day: 100000 -> 97900.
        let mut sig = buy_signal("0.3");
        breaker()
            .apply(&mut sig, &ctx("100000", "97900", None))
            .unwrap();
        assert_eq!(sig.kind, SignalKind::Hold);
        assert!(sig.allocation.is_zero());
        assert!(sig.reasons.iter().any(|r| r.contains("daily loss")));
    }

    #[test]
    fn daily_loss_at_exactly_the_limit_passes() {
        let mut sig = buy_signal("0.1");
        breaker()
            .apply(&mut sig, &ctx("100000", "98000", None))
            .unwrap();
        assert_eq!(sig.kind, SignalKind::Buy);
    }

    #[test]
    fn elevated_volatility_halves_allocation() {
        let mut sig = buy_signal("0.4");
        breaker()
            .apply(&mut sig, &ctx("100000", "100000", Some("35")))
            .unwrap();
        assert_eq!(sig.kind, SignalKind::Buy);
        assert_eq!(sig.allocation, m("0.2"));
        assert!(sig.reasons.iter().any(|r| r.contains("volatility")));
    }

    #[test]
    fn volatility_at_threshold_passes_untouched() {
        let mut sig = buy_signal("0.15");
        breaker()
            .apply(&mut sig, &ctx("100000", "100000", Some("30")))
            .unwrap();
        assert_eq!(sig.kind, SignalKind::Buy);
        assert_eq!(sig.allocation, m("0.15"));
    }

    #[test]
    fn concentration_blocks_oversized_buy() {
        let mut sig = buy_signal("0.25");
        breaker()
            .apply(&mut sig, &ctx("100000", "100000", None))
            .unwrap();
        assert_eq!(sig.kind, SignalKind::Hold);
        assert!(sig.reasons.iter().any(|r| r.contains("concentration")));
    }

    #[test]
    fn concentration_counts_existing_exposure() {
        // 0.1 proposed on top of ~15% held pushes past 20%.
        let mut sig = buy_signal("0.1");
        let mut context = ctx("100000", "100000", None);
        context.account.positions.push(BrokerPosition {
            symbol: "SPY".into(),
            qty: m("33.5"),
            avg_entry_price: m("440"),
        });
        breaker().apply(&mut sig, &context).unwrap();
        assert_eq!(sig.kind, SignalKind::Hold);
    }

    #[test]
    fn sells_skip_the_concentration_guard() {
        let mut sig = buy_signal("0.5");
        sig.kind = SignalKind::Sell;
        breaker()
            .apply(&mut sig, &ctx("100000", "100000", None))
            .unwrap();
        assert_eq!(sig.kind, SignalKind::Sell);
    }

    #[test]
    fn overrides_replace_only_the_set_fields() {
        let base = breaker();
        let layered = base.with_overrides(Some(&RiskOverrides {
            daily_loss_limit: Some(m("0.01")),
            volatility_threshold: None,
            max_concentration: None,
        }));
        assert_eq!(layered.daily_loss_limit, m("0.01"));
        assert_eq!(layered.volatility_threshold, base.volatility_threshold);
        assert_eq!(layered.max_concentration, base.max_concentration);

        let untouched = base.with_overrides(None);
        assert_eq!(untouched.daily_loss_limit, base.daily_loss_limit);
    }

    #[test]
    fn overridden_daily_loss_limit_is_enforced() {
        // A stricter 1% user limit trips where the 2% default would not.
        let layered = breaker().with_overrides(Some(&RiskOverrides {
            daily_loss_limit: Some(m("0.01")),
            volatility_threshold: None,
            max_concentration: None,
        }));
        let mut sig = buy_signal("0.1");
        layered
            .apply(&mut sig, &ctx("100000", "98500", None))
            .unwrap();
        assert_eq!(sig.kind, SignalKind::Hold);
        assert!(sig.reasons.iter().any(|r| r.contains("daily loss")));
    }

    #[test]
    fn guards_stack_in_order() {
        // Vol halves 0.5 -> 0.25, then concentration trips on 25%.
        let mut sig = buy_signal("0.5");
        breaker()
            .apply(&mut sig, &ctx("100000", "100000", Some("40")))
            .unwrap();
        assert_eq!(sig.kind, SignalKind::Hold);
        assert_eq!(sig.reasons.len(), 2);
    }
}
