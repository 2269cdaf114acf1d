// =============================================================================
// Consensus Engine — weighted vote aggregation with a fail-safe gate
// =============================================================================
//
// Votes carry `{kind, confidence, weight}`. Each action's score is its share
// of the total confidence-weighted mass, so adding a vote that agrees with
// the winner can only raise the winner's score. Ties prefer not trading:
// HOLD beats SELL beats BUY.
//
// Discordance is the normalised Shannon entropy of the action distribution:
// 0 for unanimity, 1 for a maximal split. High discordance is recorded for
// auditing but never moves the execution gate.
// =============================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::SignalKind;

/// Discordance level above which an audit event is recorded.
pub const DISCORDANCE_AUDIT_LEVEL: f64 = 0.5;

/// One strategy's weighted vote.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Vote {
    pub agent_id: String,
    pub kind: SignalKind,
    pub confidence: f64,
    pub weight: f64,
}

/// Aggregated consensus over one tick's votes. Persisted as the signal
/// audit record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsensusOutcome {
    pub final_action: SignalKind,
    pub score: f64,
    pub discordance: f64,
    pub should_execute: bool,
    pub votes: Vec<Vote>,
    pub ts: DateTime<Utc>,
}

/// Collapse a signal kind onto the three voting actions.
fn voting_action(kind: SignalKind) -> SignalKind {
    match kind {
        SignalKind::CloseAll => SignalKind::Sell,
        other => other,
    }
}

/// Aggregate `votes` under the given execution threshold.
pub fn evaluate(votes: &[Vote], threshold: f64) -> ConsensusOutcome {
    let total_mass: f64 = votes.iter().map(|v| v.weight * v.confidence).sum();

    let mass_for = |action: SignalKind| -> f64 {
        votes
            .iter()
            .filter(|v| voting_action(v.kind) == action)
            .map(|v| v.weight * v.confidence)
            .sum()
    };

    let score_for = |action: SignalKind| -> f64 {
        if total_mass > 0.0 {
            mass_for(action) / total_mass
        } else {
            0.0
        }
    };

    // Tie precedence is the iteration order: HOLD, then SELL, then BUY.
    // A later action must beat the incumbent strictly to take the win.
    let mut final_action = SignalKind::Hold;
    let mut best = score_for(SignalKind::Hold);
    for action in [SignalKind::Sell, SignalKind::Buy] {
        let s = score_for(action);
        if s > best {
            best = s;
            final_action = action;
        }
    }

    let should_execute = best >= threshold && final_action != SignalKind::Hold;

    ConsensusOutcome {
        final_action,
        score: best,
        discordance: discordance(votes),
        should_execute,
        votes: votes.to_vec(),
        ts: Utc::now(),
    }
}

/// Normalised Shannon entropy of the vote-count distribution across the
/// distinct actions present.
pub fn discordance(votes: &[Vote]) -> f64 {
    let mut counts = [0usize; 3];
    for v in votes {
        match voting_action(v.kind) {
            SignalKind::Buy => counts[0] += 1,
            SignalKind::Sell => counts[1] += 1,
            SignalKind::Hold => counts[2] += 1,
            SignalKind::CloseAll => unreachable!("normalised above"),
        }
    }

    let total: usize = counts.iter().sum();
    let distinct = counts.iter().filter(|&&c| c > 0).count();
    if total == 0 || distinct <= 1 {
        return 0.0;
    }

    let entropy: f64 = counts
        .iter()
        .filter(|&&c| c > 0)
        .map(|&c| {
            let p = c as f64 / total as f64;
            -p * p.log2()
        })
        .sum();

    entropy / (distinct as f64).log2()
}
