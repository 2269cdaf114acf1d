// =============================================================================
// Whale Flow Conviction — institutional options-flow scoring
// =============================================================================
//
// Sweeps executed across venues signal urgency; blocks signal size. The
// conviction score folds flow type, moneyness and volume/OI into a single
// [0, 1] figure that strategies can consume directly.
// =============================================================================

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::CoreResult;
use crate::money::Money;
use crate::store::{get_doc, Store, UserScope};

/// How the order printed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FlowType {
    Sweep,
    Block,
    Unknown,
}

/// Directional read of a single flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FlowSentiment {
    Bullish,
    Bearish,
    Neutral,
}

/// Aggregate sentiment over a lookback window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DominantSentiment {
    Bullish,
    Bearish,
    Neutral,
    Mixed,
}

/// One recorded institutional flow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WhaleFlow {
    pub flow_type: FlowType,
    pub sentiment: FlowSentiment,
    pub underlying: String,
    pub strike: Money,
    pub premium: Money,
    pub vol_oi_ratio: Money,
    pub is_otm: bool,
    pub conviction_score: Money,
    pub ts: DateTime<Utc>,
}

/// Aggregated conviction over a user's recent flows for one ticker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConvictionSummary {
    pub has_activity: bool,
    pub total_flows: usize,
    pub avg_conviction: Money,
    pub max_conviction: Money,
    pub total_premium: Money,
    pub dominant_sentiment: DominantSentiment,
}

impl ConvictionSummary {
    fn quiet() -> Self {
        Self {
            has_activity: false,
            total_flows: 0,
            avg_conviction: Money::ZERO,
            max_conviction: Money::ZERO,
            total_premium: Money::ZERO,
            dominant_sentiment: DominantSentiment::Neutral,
        }
    }
}

/// Volume/OI ratio above which a flow reads as fresh positioning.
fn vol_oi_hot() -> Money {
    Money::parse_str("1.2").expect("literal")
}

/// Score a flow's conviction on `[0, 1]`.
pub fn score_conviction(
    flow_type: FlowType,
    is_otm: bool,
    vol_oi_ratio: Money,
) -> CoreResult<Money> {
    let base = match flow_type {
        FlowType::Sweep => "0.8",
        FlowType::Block => "0.5",
        FlowType::Unknown => "0.3",
    };
    let mut score = Money::parse_str(base).expect("literal");

    let bump = Money::parse_str("0.1").expect("literal");
    if is_otm {
        score = score.checked_add(bump)?;
    }
    if vol_oi_ratio > vol_oi_hot() {
        score = score.checked_add(bump)?;
    }

    if score > Money::ONE {
        score = Money::ONE;
    }
    if score < Money::ZERO {
        score = Money::ZERO;
    }
    Ok(score)
}

/// Aggregate a user's flows for `ticker` over the trailing `lookback`.
///
/// `mixed_margin` is the bullish/bearish count difference at or under which
/// the window reads as `MIXED`.
pub async fn recent_conviction(
    store: &dyn Store,
    scope: &UserScope,
    ticker: &str,
    lookback: Duration,
    mixed_margin: i64,
) -> CoreResult<ConvictionSummary> {
    let cutoff = Utc::now() - lookback;
    let rows = store.list(&scope.whale_flow_prefix()).await?;

    let mut flows: Vec<WhaleFlow> = Vec::new();
    for (path, _) in rows {
        if let Some(flow) = get_doc::<WhaleFlow>(store, &path).await? {
            if flow.underlying == ticker && flow.ts >= cutoff {
                flows.push(flow);
            }
        }
    }

    if flows.is_empty() {
        return Ok(ConvictionSummary::quiet());
    }

    let mut total = Money::ZERO;
    let mut max = Money::ZERO;
    let mut premium = Money::ZERO;
    let mut bullish = 0i64;
    let mut bearish = 0i64;

    for flow in &flows {
        total = total.checked_add(flow.conviction_score)?;
        premium = premium.checked_add(flow.premium)?;
        if flow.conviction_score > max {
            max = flow.conviction_score;
        }
        match flow.sentiment {
            FlowSentiment::Bullish => bullish += 1,
            FlowSentiment::Bearish => bearish += 1,
            FlowSentiment::Neutral => {}
        }
    }

    let count = flows.len();
    let avg = total.checked_div(Money::from_int(count as i64), 4)?;

    let dominant = if bullish == 0 && bearish == 0 {
        DominantSentiment::Neutral
    } else if (bullish - bearish).abs() <= mixed_margin {
        DominantSentiment::Mixed
    } else if bullish > bearish {
        DominantSentiment::Bullish
    } else {
        DominantSentiment::Bearish
    };

    Ok(ConvictionSummary {
        has_activity: true,
        total_flows: count,
        avg_conviction: avg,
        max_conviction: max,
        total_premium: premium,
        dominant_sentiment: dominant,
    })
}
