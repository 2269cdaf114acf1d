// =============================================================================
// Momentum strategy — rate-of-change over the quotes it has observed
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
const HISTORY_LEN: usize = 60;
/// Observations required before the strategy will act.
const MIN_HISTORY: usize = 5;
/// Absolute rate-of-change that counts as momentum (0.002 = 0.2 %).
const ROC_THRESHOLD: f64 = 0.002;

/// Follows short-horizon drift in the prices it is shown each tick.
pub struct MomentumStrategy {
    base_allocation: Money,
    history: RwLock<HashMap<String, VecDeque<Money>>>,
}

impl MomentumStrategy {
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
impl Strategy for MomentumStrategy {
    fn agent_id(&self) -> &str {
        "momentum"
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

        let first = series[0];
        let last = series[series.len() - 1];
        let roc = last
            .checked_sub(first)?
            .checked_div(first, 8)?
            .inner()
            .to_f64()
            .unwrap_or(0.0);

        let (kind, confidence) = if roc > ROC_THRESHOLD {
            (SignalKind::Buy, (roc / (ROC_THRESHOLD * 10.0)).min(1.0))
        } else if roc < -ROC_THRESHOLD {
            (SignalKind::Sell, (-roc / (ROC_THRESHOLD * 10.0)).min(1.0))
        } else {
            return Ok(Signal::hold(format!("flat tape: roc {:.4}%", roc * 100.0)));
        };

        Ok(Signal {
            kind,
            confidence,
            reasoning: format!(
                "{} drift {:.4}% over {} observations",
                ctx.symbol,
                roc * 100.0,
                series.len()
            ),
            allocation: self.base_allocation,
            metadata: Some(SignalMetadata {
                indicator: Some(format!("roc={roc:.6}")),
                ..SignalMetadata::default()
            }),
        })
    }
}
