// =============================================================================
// Shadow Executor — fail-closed gate and synthetic fill writer
// =============================================================================
//
// The only component that records trades, and it only ever records shadow
// trades: the live path is not wired, and any failure reading the execution
// mode flag is treated as shadow.
//
// A trade is recorded only when all four gates pass:
//   (a) the user's kill-switch is enabled,
//   (b) the signal's signature verifies against its canonical payload,
//   (c) no upstream guard coerced the signal to HOLD,
//   (d) the signal's nonce has not been consumed before.
// Any failure short-circuits to "no trade" with a structured reason.
// =============================================================================

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::consensus::ConsensusOutcome;
use crate::errors::CoreError;
use crate::identity::{IdentityVault, SignalSignature};
use crate::maestro::{signal_payload, OrchestratedSignal};
use crate::money::Money;
use crate::store::{execution_mode_path, set_doc, Store, UserScope};
use crate::types::{AccountSnapshot, Quote, ShadowTrade, TradeStatus, TradingStatus};

/// Result scale for synthetic fill quantities.
const QTY_SCALE: u32 = 8;

/// Outcome of one execution attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ExecutionOutcome {
    /// A shadow trade was written.
    Recorded {
        trade_id: String,
        fill_price: Money,
        quantity: Money,
    },
    /// A gate declined the signal; nothing was written.
    Skipped(String),
    /// A security violation was detected; nothing was written.
    Blocked(String),
    /// Persistence failed mid-write.
    Failed(String),
}

impl std::fmt::Display for ExecutionOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Recorded { trade_id, .. } => write!(f, "Recorded({trade_id})"),
            Self::Skipped(reason) => write!(f, "Skipped({reason})"),
            Self::Blocked(reason) => write!(f, "Blocked({reason})"),
            Self::Failed(reason) => write!(f, "Failed({reason})"),
        }
    }
}

/// The fail-closed execution path.
pub struct ShadowExecutor {
    store: Arc<dyn Store>,
    vault: Arc<IdentityVault>,
}

impl ShadowExecutor {
    pub fn new(store: Arc<dyn Store>, vault: Arc<IdentityVault>) -> Self {
        Self { store, vault }
    }

    /// Read the global execution-mode flag. Any error reads as shadow.
    pub async fn is_shadow_mode(&self) -> bool {
        match self.store.get(&execution_mode_path()).await {
            Ok(Some(doc)) => doc.get("shadow").and_then(|v| v.as_bool()).unwrap_or(true),
            Ok(None) => true,
            Err(e) => {
                warn!(error = %e, "execution mode unreadable, failing closed to shadow");
                true
            }
        }
    }

    /// Attempt to record one orchestrated signal as a shadow trade.
    pub async fn execute(
        &self,
        scope: &UserScope,
        sig: &OrchestratedSignal,
        status: &TradingStatus,
        quote: &Quote,
        account: &AccountSnapshot,
        consensus: &ConsensusOutcome,
    ) -> ExecutionOutcome {
        // The live path is deliberately absent: whatever the flag says, this
        // function terminates at the shadow-trade writer.
        let shadow = self.is_shadow_mode().await;
        if !shadow {
            warn!(uid = %scope.uid, "live mode flagged but not wired, recording shadow trade");
        }

        // ── Gate (a): kill-switch ────────────────────────────────────────
        if !status.enabled {
            return ExecutionOutcome::Skipped(format!(
                "trading disabled{}",
                status
                    .disabled_by
                    .as_deref()
                    .map(|by| format!(" by {by}"))
                    .unwrap_or_default()
            ));
        }

        // ── Gate (c): guard-coerced or empty signals ─────────────────────
        let Some(side) = sig.kind.side() else {
            let reason = sig
                .override_reason
                .clone()
                .or_else(|| sig.reasons.last().cloned())
                .unwrap_or_else(|| "HOLD signal".to_string());
            return ExecutionOutcome::Skipped(reason);
        };
        if sig.allocation.is_zero() {
            return ExecutionOutcome::Skipped("zero allocation".to_string());
        }

        // ── Gates (b) and (d): signature + nonce ─────────────────────────
        let Some(provenance) = sig.provenance.as_ref() else {
            return self
                .reject(
                    &crate::errors::SecurityViolation::BadSignature(sig.agent_id.clone()),
                    "unsigned signal reached the executor",
                )
                .await;
        };
        let signature = SignalSignature {
            agent_id: provenance.agent_id.clone(),
            signature: provenance.signature.clone(),
            nonce: provenance.nonce.clone(),
            signed_at: provenance.signed_at,
            cert_id: provenance.cert_id.clone(),
        };
        if let Err(e) = self.vault.verify(&signal_payload(sig), &signature) {
            return match e {
                CoreError::Security(violation) => {
                    self.reject(&violation, "signal rejected at execution gate")
                        .await
                }
                other => ExecutionOutcome::Failed(other.to_string()),
            };
        }

        // ── Synthetic fill ───────────────────────────────────────────────
        let trade = match self.build_trade(scope, sig, side, quote, account) {
            Ok(t) => t,
            Err(e) => return ExecutionOutcome::Failed(e.to_string()),
        };
        if trade.quantity.is_zero() {
            return ExecutionOutcome::Skipped("computed quantity is zero".to_string());
        }

        // ── Persist trade + consensus audit ──────────────────────────────
        let trade_path = scope.shadow_trade(&trade.id);
        if let Err(e) = scope.assert_owns(&trade_path) {
            return ExecutionOutcome::Failed(e.to_string());
        }
        if let Err(e) = set_doc(self.store.as_ref(), &trade_path, &trade).await {
            return ExecutionOutcome::Failed(e.to_string());
        }
        let audit_path = scope.signal(&trade.id);
        if let Err(e) = set_doc(self.store.as_ref(), &audit_path, consensus).await {
            warn!(error = %e, "consensus audit write failed after trade write");
        }

        info!(
            uid = %scope.uid,
            trade_id = %trade.id,
            symbol = %trade.symbol,
            side = %trade.side,
            entry_price = %trade.entry_price,
            quantity = %trade.quantity,
            agent_id = %sig.agent_id,
            "shadow trade recorded"
        );

        ExecutionOutcome::Recorded {
            trade_id: trade.id,
            fill_price: trade.entry_price,
            quantity: trade.quantity,
        }
    }

    fn build_trade(
        &self,
        scope: &UserScope,
        sig: &OrchestratedSignal,
        side: crate::types::Side,
        quote: &Quote,
        account: &AccountSnapshot,
    ) -> crate::errors::CoreResult<ShadowTrade> {
        let fill_price = quote.mid()?;
        let notional = account.equity.checked_mul(sig.allocation)?;
        let quantity = notional.checked_div(fill_price, QTY_SCALE)?;
        let now = Utc::now();

        Ok(ShadowTrade {
            id: Uuid::new_v4().to_string(),
            uid: scope.uid.clone(),
            symbol: sig.symbol.clone(),
            side,
            quantity,
            entry_price: fill_price,
            current_price: fill_price,
            current_pnl: Money::parse_str("0.00").expect("literal"),
            pnl_percent: Money::parse_str("0.00").expect("literal"),
            status: TradeStatus::Open,
            created_at: now,
            last_updated: now,
            reasoning: sig.reasoning.clone(),
            agent_provenance: sig.provenance.clone().expect("verified above"),
            allocation: sig.allocation,
        })
    }

    async fn reject(
        &self,
        violation: &crate::errors::SecurityViolation,
        context: &str,
    ) -> ExecutionOutcome {
        warn!(violation = %violation, context, "security violation at execution gate");
        if let Err(e) = self
            .vault
            .log_violation(self.store.as_ref(), violation, context)
            .await
        {
            warn!(error = %e, "failed to persist security violation");
        }
        ExecutionOutcome::Blocked(violation.to_string())
    }
}

impl std::fmt::Debug for ShadowExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShadowExecutor").finish_non_exhaustive()
    }
}
