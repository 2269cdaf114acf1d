// =============================================================================
// Mean-reversion strategy — fades deviation from its rolling mean
// =============================================================================

use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use parking_lot::RwLock;
use rust_decimal::prelude::ToPrimitive;

use super::{EvalContext, Signal, SignalMetadata, Strategy};
use crate::errors::CoreResult;
use crate::money::Money;
use crate::types::SignalKind;

/// Quotes retained per symbol.
const HISTORY_LEN: usize = 40;
/// Observations required before the strategy will act.
const MIN_HISTORY: usize = 8;
/// Deviation from the mean that counts as stretched (0.004 = 0.4 %).
const DEVIATION_THRESHOLD: f64 = 0.004;

/// Buys dips below, sells pops above, its own rolling mean.
pub struct MeanReversionStrategy {
    base_allocation: Money,
    history: RwLock<HashMap<String, VecDeque<Money>>>,
}

impl MeanReversionStrategy {
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
}

#[async_trait]
impl Strategy for MeanReversionStrategy {
    fn agent_id(&self) -> &str {
        "mean_reversion"
    }

    async fn evaluate(&self, ctx: &EvalContext) -> CoreResult<Signal> {
        let series = self.observe(&ctx.symbol, ctx.quote.last);
        if series.len() < MIN_HISTORY {
            return Ok(Signal::hold(format!(
                "warming up: {} of {} observations",
                series.len(),
                MIN_HISTORY
            )));
        }

        let mut sum = Money::ZERO;
        for p in &series {
            sum = sum.checked_add(*p)?;
        }
        let mean = sum.checked_div(Money::from_int(series.len() as i64), 8)?;
        let last = series[series.len() - 1];

        let deviation = last
            .checked_sub(mean)?
            .checked_div(mean, 8)?
            .inner()
            .to_f64()
            .unwrap_or(0.0);

        let (kind, confidence) = if deviation < -DEVIATION_THRESHOLD {
            (
                SignalKind::Buy,
                (-deviation / (DEVIATION_THRESHOLD * 5.0)).min(1.0),
            )
        } else if deviation > DEVIATION_THRESHOLD {
            (
                SignalKind::Sell,
                (deviation / (DEVIATION_THRESHOLD * 5.0)).min(1.0),
            )
        } else {
            return Ok(Signal::hold(format!(
                "near mean: deviation {:.4}%",
                deviation * 100.0
            )));
        };

        Ok(Signal {
            kind,
            confidence,
            reasoning: format!(
                "{} stretched {:.4}% from rolling mean {}",
                ctx.symbol,
                deviation * 100.0,
                mean
            ),
            allocation: self.base_allocation,
            metadata: Some(SignalMetadata {
                indicator: Some(format!("mean_dev={deviation:.6}")),
                ..SignalMetadata::default()
            }),
        })
    }
}
