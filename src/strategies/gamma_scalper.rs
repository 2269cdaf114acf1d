// =============================================================================
// Gamma scalper — regime-aware strategy with allocation shaping
// =============================================================================
//
// Under SHORT_GAMMA dealers chase moves, so the strategy follows drift with
// allocation scaled 1.5x (capped at the full book). Under LONG_GAMMA dealers
// dampen moves, so it fades drift at half size. Without a regime read it
// stands down entirely.
// =============================================================================

use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use parking_lot::RwLock;
use rust_decimal::prelude::ToPrimitive;

use super::{EvalContext, Signal, SignalMetadata, Strategy};
use crate::errors::CoreResult;
use crate::money::Money;
use crate::types::{RegimeLabel, SignalKind};

const HISTORY_LEN: usize = 30;
const MIN_HISTORY: usize = 4;
/// Drift that counts as a move worth trading (0.001 = 0.1 %).
const DRIFT_THRESHOLD: f64 = 0.001;

fn short_gamma_multiplier() -> Money {
    Money::parse_str("1.5").expect("literal")
}

fn long_gamma_multiplier() -> Money {
    Money::parse_str("0.5").expect("literal")
}

/// Trades the dealer-gamma regime published by the regime engine.
pub struct GammaScalperStrategy {
    base_allocation: Money,
    history: RwLock<HashMap<String, VecDeque<Money>>>,
}

impl GammaScalperStrategy {
    pub fn new(base_allocation: Money) -> Self {
        Self {
            base_allocation,
            history: RwLock::new(HashMap::new()),
        }
    }

    fn observe(&self, symbol: &str, price: Money) -> Vec<Money> {
        let mut history = self.history.write();
        let series = history.entry(symbol.to_string()).or_default();
        series.push_back(price);
        while series.len() > HISTORY_LEN {
            series.pop_front();
        }
        series.iter().copied().collect()
    }

    fn shaped_allocation(&self, regime: RegimeLabel) -> CoreResult<(Money, f64)> {
        let multiplier = match regime {
            RegimeLabel::ShortGamma => short_gamma_multiplier(),
            RegimeLabel::LongGamma => long_gamma_multiplier(),
            RegimeLabel::Neutral => Money::ONE,
        };
        let mut allocation = self.base_allocation.checked_mul(multiplier)?;
        if allocation > Money::ONE {
            allocation = Money::ONE;
        }
        let applied = multiplier.inner().to_f64().unwrap_or(1.0);
        Ok((allocation, applied))
    }
}

#[async_trait]
impl Strategy for GammaScalperStrategy {
    fn agent_id(&self) -> &str {
        "gamma_scalper"
    }

    async fn evaluate(&self, ctx: &EvalContext) -> CoreResult<Signal> {
        let series = self.observe(&ctx.symbol, ctx.quote.last);

        let Some(regime) = ctx.regime.as_ref() else {
            return Ok(Signal::hold("no regime data, standing down"));
        };

        if series.len() < MIN_HISTORY {
            return Ok(Signal::hold(format!(
                "warming up: {} of {} observations",
                series.len(),
                MIN_HISTORY
            )));
        }

        let first = series[0];
        let last = series[series.len() - 1];
        let drift = last
            .checked_sub(first)?
            .checked_div(first, 8)?
            .inner()
            .to_f64()
            .unwrap_or(0.0);

        if drift.abs() < DRIFT_THRESHOLD {
            return Ok(Signal::hold(format!(
                "no tradable drift under {} regime",
                regime.regime
            )));
        }

        // SHORT_GAMMA amplifies moves: go with the drift. LONG_GAMMA
        // dampens them: fade it. NEUTRAL takes the momentum read at par.
        let kind = match regime.regime {
            RegimeLabel::ShortGamma | RegimeLabel::Neutral => {
                if drift > 0.0 {
                    SignalKind::Buy
                } else {
                    SignalKind::Sell
                }
            }
            RegimeLabel::LongGamma => {
                if drift > 0.0 {
                    SignalKind::Sell
                } else {
                    SignalKind::Buy
                }
            }
        };

        let (allocation, multiplier) = self.shaped_allocation(regime.regime)?;
        let confidence = (drift.abs() / (DRIFT_THRESHOLD * 10.0)).min(1.0);

        Ok(Signal {
            kind,
            confidence,
            reasoning: format!(
                "{} drift {:.4}% under {} (net GEX {})",
                ctx.symbol,
                drift * 100.0,
                regime.regime,
                regime.net_gex
            ),
            allocation,
            metadata: Some(SignalMetadata {
                regime_multiplier: Some(multiplier),
                ..SignalMetadata::default()
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategies::test_support::ctx;
    use chrono::Utc;
    use crate::types::MarketRegime;

    fn regime(label: RegimeLabel) -> MarketRegime {
        MarketRegime {
            symbol: "SPY".into(),
            net_gex: Money::from_int(-2_000_000),
            call_gex: Money::from_int(1_000_000),
            put_gex: Money::from_int(-3_000_000),
            regime: label,
            spot: Money::parse_str("448.00").unwrap(),
            ts: Utc::now(),
        }
    }

    async fn warmed(strat: &GammaScalperStrategy, prices: &[&str], label: RegimeLabel) -> Signal {
        let mut last = Signal::hold("seed");
        for p in prices {
            let mut c = ctx("SPY", p);
            c.regime = Some(regime(label));
            last = strat.evaluate(&c).await.unwrap();
        }
        last
    }

    #[tokio::test]
    async fn no_regime_stands_down() {
        let strat = GammaScalperStrategy::new(Money::parse_str("0.5").unwrap());
        let signal = strat.evaluate(&ctx("SPY", "448.00")).await.unwrap();
        assert_eq!(signal.kind, SignalKind::Hold);
    }

    #[tokio::test]
    async fn short_gamma_follows_drift_at_one_point_five_x() {
        let strat = GammaScalperStrategy::new(Money::parse_str("0.5").unwrap());
        let signal = warmed(
            &strat,
            &["440", "442", "444", "446", "448"],
            RegimeLabel::ShortGamma,
        )
        .await;
        assert_eq!(signal.kind, SignalKind::Buy);
        assert_eq!(signal.allocation, Money::parse_str("0.75").unwrap());
        assert_eq!(
            signal.metadata.unwrap().regime_multiplier,
            Some(1.5)
        );
    }

    #[tokio::test]
    async fn long_gamma_fades_drift_at_half_size() {
        let strat = GammaScalperStrategy::new(Money::parse_str("0.5").unwrap());
        let signal = warmed(
            &strat,
            &["440", "442", "444", "446", "448"],
            RegimeLabel::LongGamma,
        )
        .await;
        assert_eq!(signal.kind, SignalKind::Sell);
        assert_eq!(signal.allocation, Money::parse_str("0.25").unwrap());
    }

    #[tokio::test]
    async fn shaped_allocation_caps_at_full_book() {
        let strat = GammaScalperStrategy::new(Money::parse_str("0.9").unwrap());
        let (allocation, _) = strat.shaped_allocation(RegimeLabel::ShortGamma).unwrap();
        assert_eq!(allocation, Money::ONE);
    }
}
