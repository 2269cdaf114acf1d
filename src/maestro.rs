// =============================================================================
// Maestro Orchestrator — weighting, systemic-risk override, identity
// =============================================================================
//
// Takes the raw signals of one user's strategy fleet and produces the
// orchestrated set the consensus/risk/executor pipeline consumes.
//
// Pipeline (single deterministic pass, votes sorted by agent id):
//   1. Allocation weighting by rolling Sharpe (ACTIVE / REDUCED / SHADOW).
//   2. Systemic-sell detection: enough SELLs override every BUY to HOLD.
//   3. Identity enrichment: sign each surviving signal.
//   4. Allocation cap at the full book.
//   5. Advisory summary (LLM with deterministic fallback).
// =============================================================================

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::clients::llm::{generate_with_deadline, LlmClient};
use crate::errors::CoreResult;
use crate::identity::IdentityVault;
use crate::money::Money;
use crate::strategies::{Signal, SignalMetadata};
use crate::types::{AgentProvenance, SignalKind, StrategyMode};

/// Reason tag attached to BUYs suppressed by a sell cascade.
pub const SYSTEMIC_SELL_REASON: &str = "systemic_sell_cascade";

/// A signal after orchestration: weighted, possibly overridden, signed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratedSignal {
    pub agent_id: String,
    pub symbol: String,
    pub kind: SignalKind,
    pub confidence: f64,
    pub allocation: Money,
    pub mode: StrategyMode,
    pub reasoning: String,
    /// Annotations appended by orchestration and risk guards.
    #[serde(default)]
    pub reasons: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub override_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<SignalMetadata>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provenance: Option<AgentProvenance>,
}

/// The canonical payload a signal's signature covers. The executor rebuilds
/// this from the same fields, so any post-signing mutation is detectable.
pub fn signal_payload(sig: &OrchestratedSignal) -> serde_json::Value {
    json!({
        "agent_id": sig.agent_id,
        "symbol": sig.symbol,
        "kind": sig.kind,
        "confidence": sig.confidence,
        "allocation": sig.allocation,
    })
}

/// Orchestration engine. Stateless apart from its handles.
pub struct Maestro {
    vault: Arc<IdentityVault>,
    llm: Arc<dyn LlmClient>,
    systemic_sell_threshold: usize,
    sharpe_reduce: f64,
    sharpe_shadow: f64,
    llm_deadline: Duration,
}

impl Maestro {
    pub fn new(
        vault: Arc<IdentityVault>,
        llm: Arc<dyn LlmClient>,
        systemic_sell_threshold: usize,
        sharpe_reduce: f64,
        sharpe_shadow: f64,
        llm_deadline: Duration,
    ) -> Self {
        Self {
            vault,
            llm,
            systemic_sell_threshold,
            sharpe_reduce,
            sharpe_shadow,
            llm_deadline,
        }
    }

    /// Orchestrate one user's raw signals for `symbol`.
    ///
    /// `sharpes` carries each strategy's rolling Sharpe, `None` for young
    /// books. The returned map preserves the input keys.
    pub async fn orchestrate(
        &self,
        symbol: &str,
        raw: BTreeMap<String, Signal>,
        sharpes: &BTreeMap<String, Option<f64>>,
    ) -> CoreResult<(BTreeMap<String, OrchestratedSignal>, String)> {
        // ── 1. Sharpe weighting ──────────────────────────────────────────
        let mut signals: BTreeMap<String, OrchestratedSignal> = BTreeMap::new();
        for (agent_id, signal) in raw {
            let sharpe = sharpes.get(&agent_id).copied().flatten();
            let (mode, allocation) = self.weighted_allocation(sharpe, signal.allocation)?;

            if mode != StrategyMode::Active {
                debug!(
                    agent_id = %agent_id,
                    ?sharpe,
                    mode = %mode,
                    "strategy throttled by performance"
                );
            }

            signals.insert(
                agent_id.clone(),
                OrchestratedSignal {
                    agent_id,
                    symbol: symbol.to_string(),
                    kind: signal.kind,
                    confidence: signal.confidence,
                    allocation,
                    mode,
                    reasoning: signal.reasoning,
                    reasons: Vec::new(),
                    override_reason: None,
                    metadata: signal.metadata,
                    provenance: None,
                },
            );
        }

        // ── 2. Systemic-sell cascade ─────────────────────────────────────
        let sell_count = signals
            .values()
            .filter(|s| matches!(s.kind, SignalKind::Sell | SignalKind::CloseAll))
            .count();

        if sell_count >= self.systemic_sell_threshold {
            warn!(
                symbol,
                sell_count,
                threshold = self.systemic_sell_threshold,
                "systemic sell cascade detected, suppressing BUYs"
            );
            for sig in signals.values_mut() {
                if sig.kind == SignalKind::Buy {
                    sig.kind = SignalKind::Hold;
                    sig.allocation = Money::ZERO;
                    sig.override_reason = Some(SYSTEMIC_SELL_REASON.to_string());
                    sig.reasons.push(format!(
                        "{sell_count} strategies selling simultaneously"
                    ));
                }
            }
        }

        // ── 3. Identity enrichment (after overrides, so the signature
        //       covers the final kind/allocation) ──────────────────────────
        let session_id = self.vault.session_id().to_string();
        for sig in signals.values_mut() {
            let signature = self.vault.sign(&sig.agent_id, &signal_payload(sig))?;
            sig.provenance = Some(AgentProvenance {
                agent_id: signature.agent_id.clone(),
                nonce: signature.nonce.clone(),
                session_id: session_id.clone(),
                cert_id: signature.cert_id.clone(),
                signature: signature.signature.clone(),
                signed_at: signature.signed_at,
            });
        }

        // ── 4. Allocation cap ────────────────────────────────────────────
        for sig in signals.values_mut() {
            if sig.allocation > Money::ONE {
                sig.allocation = Money::ONE;
                sig.reasons.push("allocation capped at full book".into());
            }
        }

        // ── 5. Advisory summary ──────────────────────────────────────────
        let summary = self.summarize(symbol, &signals).await;
        info!(symbol, agents = signals.len(), sell_count, %summary, "orchestration complete");

        Ok((signals, summary))
    }

    /// Map a rolling Sharpe onto a participation mode and allocation.
    fn weighted_allocation(
        &self,
        sharpe: Option<f64>,
        base: Money,
    ) -> CoreResult<(StrategyMode, Money)> {
        match sharpe {
            // A young strategy trades at full size until proven otherwise.
            None => Ok((StrategyMode::Active, base)),
            Some(s) if s >= self.sharpe_reduce => Ok((StrategyMode::Active, base)),
            Some(s) if s >= self.sharpe_shadow => {
                let halved = base.checked_mul(Money::parse_str("0.5").expect("literal"))?;
                Ok((StrategyMode::Reduced, halved))
            }
            Some(_) => Ok((StrategyMode::ShadowMode, Money::ZERO)),
        }
    }

    /// One human-readable sentence about the decision set. Never
    /// authoritative; the deterministic fallback covers LLM failure.
    async fn summarize(
        &self,
        symbol: &str,
        signals: &BTreeMap<String, OrchestratedSignal>,
    ) -> String {
        let fallback = deterministic_summary(symbol, signals);
        let prompt = format!(
            "In one sentence, summarise these trading votes for {symbol}: {fallback}"
        );
        match generate_with_deadline(self.llm.as_ref(), &prompt, self.llm_deadline).await {
            Ok(text) if !text.trim().is_empty() => text,
            _ => fallback,
        }
    }
}

/// Fallback summary assembled from the vote table.
pub fn deterministic_summary(
    symbol: &str,
    signals: &BTreeMap<String, OrchestratedSignal>,
) -> String {
    let mut buys = 0;
    let mut sells = 0;
    let mut holds = 0;
    for sig in signals.values() {
        match sig.kind {
            SignalKind::Buy => buys += 1,
            SignalKind::Sell | SignalKind::CloseAll => sells += 1,
            SignalKind::Hold => holds += 1,
        }
    }
    let overridden = signals
        .values()
        .filter(|s| s.override_reason.is_some())
        .count();

    if overridden > 0 {
        format!(
            "{symbol}: {buys} buy / {sells} sell / {holds} hold across {} agents; \
             {overridden} buy vote(s) suppressed by sell cascade",
            signals.len()
        )
    } else {
        format!(
            "{symbol}: {buys} buy / {sells} sell / {holds} hold across {} agents",
            signals.len()
        )
    }
}
