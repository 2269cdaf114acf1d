// =============================================================================
// Performance Tracker — rolling FIFO realized P&L and Sharpe per strategy
// =============================================================================
//
// Tracks per-`{tenant, user, strategy}` books. Fills accumulate entry lots;
// exits realize P&L against the earliest-remaining lots (FIFO). The rolling
// window is 30 days; the Sharpe ratio is annualised over daily P&L points
// and withheld until enough days are populated to mean anything.
// =============================================================================

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Duration, NaiveDate, Utc};
use parking_lot::RwLock;
use rust_decimal::prelude::ToPrimitive;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::errors::CoreResult;
use crate::money::Money;
use crate::types::Side;

/// Rolling window over which outcomes are retained.
const WINDOW_DAYS: i64 = 30;
/// Annualisation factor: sqrt of trading days per year.
const ANNUALISATION: f64 = 15.874_507_866_387_544; // sqrt(252)

/// Identifies one strategy's book for one user.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PerfKey {
    pub tid: String,
    pub uid: String,
    pub strategy: String,
}

impl PerfKey {
    pub fn new(
        tid: impl Into<String>,
        uid: impl Into<String>,
        strategy: impl Into<String>,
    ) -> Self {
        Self {
            tid: tid.into(),
            uid: uid.into(),
            strategy: strategy.into(),
        }
    }
}

/// One realized outcome in the rolling series.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RealizedTrade {
    pub pnl: Money,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct Lot {
    qty: Money,
    price: Money,
}

#[derive(Default)]
struct Book {
    lots: VecDeque<Lot>,
    realized: Vec<RealizedTrade>,
}

/// Process-scoped tracker, safe for concurrent use.
pub struct PerformanceTracker {
    books: RwLock<HashMap<PerfKey, Book>>,
    /// Minimum populated daily points before a Sharpe is reported.
    min_days: usize,
}

impl PerformanceTracker {
    pub fn new(min_days: usize) -> Self {
        Self {
            books: RwLock::new(HashMap::new()),
            min_days,
        }
    }

    /// Record a fill. Buys open lots; sells realize against the earliest
    /// remaining lots.
    pub fn record_fill(
        &self,
        key: &PerfKey,
        side: Side,
        qty: Money,
        price: Money,
        at: DateTime<Utc>,
    ) -> CoreResult<()> {
        let mut books = self.books.write();
        let book = books.entry(key.clone()).or_default();

        match side {
            Side::Buy => {
                book.lots.push_back(Lot { qty, price });
            }
            Side::Sell => {
                let mut remaining = qty;
                while remaining.is_positive() {
                    let Some(front) = book.lots.front_mut() else {
                        warn!(
                            strategy = %key.strategy,
                            uid = %key.uid,
                            unmatched = %remaining,
                            "sell exceeds open lots, excess ignored"
                        );
                        break;
                    };

                    let matched = if front.qty <= remaining {
                        front.qty
                    } else {
                        remaining
                    };
                    let pnl = price
                        .checked_sub(front.price)?
                        .checked_mul(matched)?;
                    book.realized.push(RealizedTrade { pnl, at });

                    remaining = remaining.checked_sub(matched)?;
                    front.qty = front.qty.checked_sub(matched)?;
                    if front.qty.is_zero() {
                        book.lots.pop_front();
                    }
                }
            }
        }

        let cutoff = at - Duration::days(WINDOW_DAYS);
        book.realized.retain(|r| r.at >= cutoff);
        Ok(())
    }

    /// The realized series inside the window, oldest first.
    pub fn realized(&self, key: &PerfKey) -> Vec<RealizedTrade> {
        self.books
            .read()
            .get(key)
            .map(|b| b.realized.clone())
            .unwrap_or_default()
    }

    /// Annualised Sharpe over daily P&L points in the window.
    ///
    /// Returns `None` for a young book (fewer than `min_days` populated
    /// days) or a degenerate one (zero dispersion).
    pub fn sharpe(&self, key: &PerfKey, now: DateTime<Utc>) -> Option<f64> {
        let books = self.books.read();
        let book = books.get(key)?;
        let cutoff = now - Duration::days(WINDOW_DAYS);

        let mut daily: HashMap<NaiveDate, Money> = HashMap::new();
        for r in book.realized.iter().filter(|r| r.at >= cutoff) {
            let day = r.at.date_naive();
            let entry = daily.entry(day).or_insert(Money::ZERO);
            *entry = entry.checked_add(r.pnl).ok()?;
        }

        if daily.len() < self.min_days {
            return None;
        }

        let points: Vec<f64> = daily
            .values()
            .map(|m| m.inner().to_f64())
            .collect::<Option<Vec<_>>>()?;

        let n = points.len() as f64;
        let mean = points.iter().sum::<f64>() / n;
        let variance = points.iter().map(|p| (p - mean).powi(2)).sum::<f64>() / n;
        let stddev = variance.sqrt();
        if stddev == 0.0 {
            return None;
        }

        Some(mean / stddev * ANNUALISATION)
    }
}

impl std::fmt::Debug for PerformanceTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PerformanceTracker")
            .field("books", &self.books.read().len())
            .field("min_days", &self.min_days)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> PerfKey {
        PerfKey::new("t1", "u1", "momentum")
    }

    fn m(s: &str) -> Money {
        Money::parse_str(s).unwrap()
    }

    #[test]
    fn fifo_matches_earliest_lot_first() {
        let tracker = PerformanceTracker::new(5);
        let now = Utc::now();

        tracker
            .record_fill(&key(), Side::Buy, m("10"), m("100"), now)
            .unwrap();
        tracker
            .record_fill(&key(), Side::Buy, m("10"), m("110"), now)
            .unwrap();
        // Sell 15 @ 120: 10 from the 100 lot, 5 from the 110 lot.
        tracker
            .record_fill(&key(), Side::Sell, m("15"), m("120"), now)
            .unwrap();

        let realized = tracker.realized(&key());
        assert_eq!(realized.len(), 2);
        assert_eq!(realized[0].pnl, m("200")); // (120-100)*10
        assert_eq!(realized[1].pnl, m("50")); // (120-110)*5
    }

    #[test]
    fn partial_lot_consumption_keeps_remainder() {
        let tracker = PerformanceTracker::new(5);
        let now = Utc::now();

        tracker
            .record_fill(&key(), Side::Buy, m("10"), m("100"), now)
            .unwrap();
        tracker
            .record_fill(&key(), Side::Sell, m("4"), m("105"), now)
            .unwrap();
        tracker
            .record_fill(&key(), Side::Sell, m("6"), m("110"), now)
            .unwrap();

        let realized = tracker.realized(&key());
        assert_eq!(realized.len(), 2);
        assert_eq!(realized[0].pnl, m("20")); // (105-100)*4
        assert_eq!(realized[1].pnl, m("60")); // (110-100)*6
    }

    #[test]
    fn sell_without_lots_is_ignored() {
        let tracker = PerformanceTracker::new(5);
        tracker
            .record_fill(&key(), Side::Sell, m("5"), m("100"), Utc::now())
            .unwrap();
        assert!(tracker.realized(&key()).is_empty());
    }

    #[test]
    fn young_book_has_no_sharpe() {
        let tracker = PerformanceTracker::new(5);
        let now = Utc::now();

        // Only three populated days.
        for days_ago in 1..=3 {
            let at = now - Duration::days(days_ago);
            tracker
                .record_fill(&key(), Side::Buy, m("1"), m("100"), at)
                .unwrap();
            tracker
                .record_fill(&key(), Side::Sell, m("1"), m("101"), at)
                .unwrap();
        }

        assert!(tracker.sharpe(&key(), now).is_none());
    }

    #[test]
    fn sharpe_positive_for_consistent_gains() {
        let tracker = PerformanceTracker::new(5);
        let now = Utc::now();

        let gains = ["101", "102", "101.5", "103", "102.5", "104"];
        for (i, exit) in gains.iter().enumerate() {
            let at = now - Duration::days(i as i64 + 1);
            tracker
                .record_fill(&key(), Side::Buy, m("1"), m("100"), at)
                .unwrap();
            tracker
                .record_fill(&key(), Side::Sell, m("1"), m(exit), at)
                .unwrap();
        }

        let sharpe = tracker.sharpe(&key(), now).unwrap();
        assert!(sharpe > 0.0, "consistent gains must annualise positive");
    }

    #[test]
    fn zero_dispersion_withholds_sharpe() {
        let tracker = PerformanceTracker::new(2);
        let now = Utc::now();

        for days_ago in 1..=3 {
            let at = now - Duration::days(days_ago);
            tracker
                .record_fill(&key(), Side::Buy, m("1"), m("100"), at)
                .unwrap();
            tracker
                .record_fill(&key(), Side::Sell, m("1"), m("101"), at)
                .unwrap();
        }

        assert!(tracker.sharpe(&key(), now).is_none());
    }

    #[test]
    fn old_outcomes_age_out_of_the_window() {
        let tracker = PerformanceTracker::new(5);
        let old = Utc::now() - Duration::days(40);

        tracker
            .record_fill(&key(), Side::Buy, m("1"), m("100"), old)
            .unwrap();
        tracker
            .record_fill(&key(), Side::Sell, m("1"), m("110"), old)
            .unwrap();

        // A fresh fill triggers pruning against its own timestamp.
        tracker
            .record_fill(&key(), Side::Buy, m("1"), m("100"), Utc::now())
            .unwrap();
        assert!(tracker.realized(&key()).is_empty());
    }
}
