// =============================================================================
// Market Regime Engine — net gamma exposure over the 0/1-DTE chains
// =============================================================================
//
// Runs on its own 5-minute cadence. Per strike:
//
//   CallGEX = gamma * OI * 100 * spot
//   PutGEX  = gamma * OI * 100 * spot * (-1)
//
// NetGEX above +epsilon means dealers are long gamma and dampen moves;
// below -epsilon they are short and amplify them. On any upstream failure
// the engine records the error in a sibling document and keeps serving the
// last good regime; consumers already tolerate `None`.
// =============================================================================

use std::sync::Arc;

use chrono::{Duration, Utc};
use parking_lot::RwLock;
use tracing::{info, warn};

use crate::clients::broker::BrokerClient;
use crate::clients::options::{OptionContract, OptionRight, OptionsDataClient};
use crate::errors::{CoreError, CoreResult};
use crate::money::Money;
use crate::store::{market_regime_error_path, market_regime_path, set_doc, Store};
use crate::types::{MarketRegime, RegimeLabel};

/// Contract multiplier for equity options.
fn contract_multiplier() -> Money {
    Money::from_int(100)
}

/// Gamma-exposure contributions of one chain.
#[derive(Debug, Clone, Copy)]
pub struct GexTotals {
    pub call_gex: Money,
    pub put_gex: Money,
    pub net_gex: Money,
}

/// Sum per-strike gamma exposure across `chain` at the given spot.
pub fn net_gex(chain: &[OptionContract], spot: Money) -> CoreResult<GexTotals> {
    let mut call_gex = Money::ZERO;
    let mut put_gex = Money::ZERO;

    for contract in chain {
        let exposure = contract
            .gamma
            .checked_mul(Money::from_int(contract.oi as i64))?
            .checked_mul(contract_multiplier())?
            .checked_mul(spot)?;

        match contract.right {
            OptionRight::Call => call_gex = call_gex.checked_add(exposure)?,
            OptionRight::Put => put_gex = put_gex.checked_sub(exposure)?,
        }
    }

    Ok(GexTotals {
        call_gex,
        put_gex,
        net_gex: call_gex.checked_add(put_gex)?,
    })
}

/// Classify net exposure against the neutrality band.
pub fn classify(net: Money, epsilon: Money) -> RegimeLabel {
    if net > epsilon {
        RegimeLabel::LongGamma
    } else if net < epsilon.neg() {
        RegimeLabel::ShortGamma
    } else {
        RegimeLabel::Neutral
    }
}

/// Computes and publishes the market regime on a fixed cadence.
pub struct RegimeEngine {
    symbol: String,
    epsilon: Money,
    broker: Arc<dyn BrokerClient>,
    options: Arc<dyn OptionsDataClient>,
    store: Arc<dyn Store>,
    last_good: RwLock<Option<MarketRegime>>,
}

impl RegimeEngine {
    pub fn new(
        symbol: impl Into<String>,
        epsilon: Money,
        broker: Arc<dyn BrokerClient>,
        options: Arc<dyn OptionsDataClient>,
        store: Arc<dyn Store>,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            epsilon,
            broker,
            options,
            store,
            last_good: RwLock::new(None),
        }
    }

    /// The most recent successfully computed regime, if any.
    pub fn current(&self) -> Option<MarketRegime> {
        self.last_good.read().clone()
    }

    /// One regime-sync pass: compute, persist, cache. On failure the error
    /// is persisted beside the regime document and the last good regime
    /// stays in place.
    pub async fn sync(&self) -> CoreResult<MarketRegime> {
        match self.compute().await {
            Ok(regime) => {
                set_doc(
                    self.store.as_ref(),
                    &market_regime_path(&self.symbol),
                    &regime,
                )
                .await?;
                *self.last_good.write() = Some(regime.clone());
                info!(
                    symbol = %self.symbol,
                    regime = %regime.regime,
                    net_gex = %regime.net_gex,
                    "market regime updated"
                );
                Ok(regime)
            }
            Err(e) => {
                warn!(symbol = %self.symbol, error = %e, "regime sync failed, keeping last good");
                let error_doc = serde_json::json!({
                    "error": e.to_string(),
                    "kind": e.kind(),
                    "ts": Utc::now().to_rfc3339(),
                });
                if let Err(write_err) = self
                    .store
                    .set(&market_regime_error_path(&self.symbol), error_doc)
                    .await
                {
                    warn!(error = %write_err, "failed to record regime error");
                }
                Err(e)
            }
        }
    }

    async fn compute(&self) -> CoreResult<MarketRegime> {
        let quote = self.broker.get_quote(&self.symbol).await?;
        let spot = quote.last;

        let today = Utc::now().date_naive();
        let expiries = [today, today + Duration::days(1)];
        let chain = self.options.option_chain(&self.symbol, &expiries).await?;
        if chain.is_empty() {
            return Err(CoreError::Validation(format!(
                "empty 0/1-DTE chain for {}",
                self.symbol
            )));
        }

        let totals = net_gex(&chain, spot)?;
        Ok(MarketRegime {
            symbol: self.symbol.clone(),
            net_gex: totals.net_gex,
            call_gex: totals.call_gex,
            put_gex: totals.put_gex,
            regime: classify(totals.net_gex, self.epsilon),
            spot,
            ts: Utc::now(),
        })
    }
}

impl std::fmt::Debug for RegimeEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegimeEngine")
            .field("symbol", &self.symbol)
            .field("epsilon", &self.epsilon)
            .field("has_last_good", &self.last_good.read().is_some())
            .finish()
    }
}
