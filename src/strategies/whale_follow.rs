// =============================================================================
// Whale-follow strategy — trades alongside convicted institutional flow
// =============================================================================

use async_trait::async_trait;
use rust_decimal::prelude::ToPrimitive;

use super::{EvalContext, Signal, SignalMetadata, Strategy};
use crate::errors::CoreResult;
use crate::money::Money;
use crate::types::SignalKind;
use crate::whale_flow::DominantSentiment;

/// Average conviction below which the flow is just noise.
fn conviction_floor() -> Money {
    Money::parse_str("0.6").expect("literal")
}

/// Follows the dominant sentiment of recent high-conviction whale flow.
pub struct WhaleFollowStrategy {
    base_allocation: Money,
}

impl WhaleFollowStrategy {
    pub fn new(base_allocation: Money) -> Self {
        Self { base_allocation }
    }
}

#[async_trait]
impl Strategy for WhaleFollowStrategy {
    fn agent_id(&self) -> &str {
        "whale_follow"
    }

    async fn evaluate(&self, ctx: &EvalContext) -> CoreResult<Signal> {
        let Some(summary) = ctx.whale.as_ref() else {
            return Ok(Signal::hold("no whale flow data"));
        };

        if !summary.has_activity {
            return Ok(Signal::hold("no institutional activity in window"));
        }
        if summary.avg_conviction < conviction_floor() {
            return Ok(Signal::hold(format!(
                "flow conviction {} below floor",
                summary.avg_conviction
            )));
        }

        let kind = match summary.dominant_sentiment {
            DominantSentiment::Bullish => SignalKind::Buy,
            DominantSentiment::Bearish => SignalKind::Sell,
            DominantSentiment::Neutral | DominantSentiment::Mixed => {
                return Ok(Signal::hold(format!(
                    "sentiment {:?} gives no edge",
                    summary.dominant_sentiment
                )));
            }
        };

        let confidence = summary.avg_conviction.inner().to_f64().unwrap_or(0.0);

        Ok(Signal {
            kind,
            confidence,
            reasoning: format!(
                "{} flows, avg conviction {}, total premium {}",
                summary.total_flows, summary.avg_conviction, summary.total_premium
            ),
            allocation: self.base_allocation,
            metadata: Some(SignalMetadata {
                whale_conviction: Some(summary.avg_conviction),
                ..SignalMetadata::default()
            }),
        })
    }
}
