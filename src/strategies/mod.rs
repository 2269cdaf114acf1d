// =============================================================================
// Strategy Registry — static constructors keyed by agent id
// =============================================================================
//
// A strategy is anything implementing `Strategy`: given shared market state
// it produces one `Signal` per evaluation. Strategies are instantiated once
// per process and registered at init; there is no runtime module scanning.
// Two strategies advertising the same agent id is a configuration mistake:
// the first discovered wins, the second is logged and skipped.
// =============================================================================

pub mod gamma_scalper;
pub mod mean_reversion;
pub mod momentum;
pub mod whale_follow;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::errors::CoreResult;
use crate::money::Money;
use crate::types::{AccountSnapshot, MarketRegime, Quote, SignalKind};
use crate::whale_flow::ConvictionSummary;

/// Small, typed, optional annotations a strategy may attach.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SignalMetadata {
    /// Regime-driven allocation multiplier the strategy applied, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub regime_multiplier: Option<f64>,
    /// Whale conviction the strategy acted on, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub whale_conviction: Option<Money>,
    /// Free-form indicator note.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub indicator: Option<String>,
}

/// The raw output of one strategy evaluation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    pub kind: SignalKind,
    /// Conviction on `[0, 1]`.
    pub confidence: f64,
    pub reasoning: String,
    /// Requested fraction of equity, before orchestration.
    pub allocation: Money,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<SignalMetadata>,
}

impl Signal {
    /// A do-nothing signal with zero allocation.
    pub fn hold(reasoning: impl Into<String>) -> Self {
        Self {
            kind: SignalKind::Hold,
            confidence: 0.0,
            reasoning: reasoning.into(),
            allocation: Money::ZERO,
            metadata: None,
        }
    }
}

/// Everything a strategy may read during one evaluation. Strategies never
/// touch persistence directly.
#[derive(Debug, Clone)]
pub struct EvalContext {
    pub symbol: String,
    pub account: AccountSnapshot,
    pub quote: Quote,
    pub regime: Option<MarketRegime>,
    pub whale: Option<ConvictionSummary>,
}

/// The single capability every strategy exposes.
#[async_trait]
pub trait Strategy: Send + Sync {
    fn agent_id(&self) -> &str;
    async fn evaluate(&self, ctx: &EvalContext) -> CoreResult<Signal>;
}

// =============================================================================
// Registry
// =============================================================================

/// Read-only after startup.
pub struct StrategyRegistry {
    strategies: Vec<Arc<dyn Strategy>>,
}

impl StrategyRegistry {
    pub fn new() -> Self {
        Self {
            strategies: Vec::new(),
        }
    }

    /// Register a strategy. Duplicate agent ids keep the first registration.
    pub fn register(&mut self, strategy: Arc<dyn Strategy>) {
        let id = strategy.agent_id().to_string();
        if self.strategies.iter().any(|s| s.agent_id() == id) {
            warn!(agent_id = %id, "duplicate agent id, keeping first registration");
            return;
        }
        info!(agent_id = %id, "strategy registered");
        self.strategies.push(strategy);
    }

    /// The built-in strategy set, each sized at `base_allocation`.
    pub fn builtin(base_allocation: Money) -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(momentum::MomentumStrategy::new(base_allocation)));
        registry.register(Arc::new(mean_reversion::MeanReversionStrategy::new(
            base_allocation,
        )));
        registry.register(Arc::new(gamma_scalper::GammaScalperStrategy::new(
            base_allocation,
        )));
        registry.register(Arc::new(whale_follow::WhaleFollowStrategy::new(
            base_allocation,
        )));
        registry
    }

    pub fn all(&self) -> &[Arc<dyn Strategy>] {
        &self.strategies
    }

    pub fn len(&self) -> usize {
        self.strategies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.strategies.is_empty()
    }
}

impl Default for StrategyRegistry {
    fn default() -> Self {
        Self::builtin(Money::parse_str("0.5").expect("literal"))
    }
}

impl std::fmt::Debug for StrategyRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let ids: Vec<&str> = self.strategies.iter().map(|s| s.agent_id()).collect();
        f.debug_struct("StrategyRegistry").field("agents", &ids).finish()
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use chrono::Utc;

    /// Build a minimal evaluation context around one quote price.
    pub fn ctx(symbol: &str, last: &str) -> EvalContext {
        let last = Money::parse_str(last).unwrap();
        EvalContext {
            symbol: symbol.to_string(),
            account: AccountSnapshot {
                equity: Money::parse_str("100000.00").unwrap(),
                cash: Money::parse_str("50000.00").unwrap(),
                buying_power: Money::parse_str("200000.00").unwrap(),
                positions: vec![],
                as_of: Utc::now(),
            },
            quote: Quote {
                symbol: symbol.to_string(),
                bid: last,
                ask: last,
                last,
                ts: Utc::now(),
            },
            regime: None,
            whale: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Named(&'static str);

    #[async_trait]
    impl Strategy for Named {
        fn agent_id(&self) -> &str {
            self.0
        }

        async fn evaluate(&self, _ctx: &EvalContext) -> CoreResult<Signal> {
            Ok(Signal::hold("test"))
        }
    }

    #[test]
    fn builtin_set_registers_four_agents() {
        let registry = StrategyRegistry::default();
        assert_eq!(registry.len(), 4);
        let ids: Vec<&str> = registry.all().iter().map(|s| s.agent_id()).collect();
        assert!(ids.contains(&"momentum"));
        assert!(ids.contains(&"mean_reversion"));
        assert!(ids.contains(&"gamma_scalper"));
        assert!(ids.contains(&"whale_follow"));
    }

    #[test]
    fn duplicate_agent_id_keeps_first() {
        let mut registry = StrategyRegistry::new();
        registry.register(Arc::new(Named("alpha")));
        registry.register(Arc::new(Named("alpha")));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn hold_signal_has_zero_allocation() {
        let s = Signal::hold("nothing to do");
        assert_eq!(s.kind, SignalKind::Hold);
        assert!(s.allocation.is_zero());
        assert_eq!(s.confidence, 0.0);
    }
}
