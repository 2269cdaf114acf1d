// =============================================================================
// Shadow P&L Materializer — per-tick mark-to-market of OPEN trades
// =============================================================================
//
// For every OPEN shadow trade the materializer looks up the current market
// price and refreshes exactly four fields: `{current_price, current_pnl,
// pnl_percent, last_updated}`. A missing quote leaves the trade untouched
// and counts it stale; one trade's failure never touches its neighbours.
// CLOSED trades are immutable and are skipped outright.
// =============================================================================

use std::collections::HashMap;

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, warn};

use crate::clients::broker::BrokerClient;
use crate::errors::{CoreError, CoreResult};
use crate::money::Money;
use crate::store::{get_doc, set_doc, Store, UserScope};
use crate::types::{Quote, ShadowTrade, Side, TradeStatus};

/// Scale of the stored P&L percentage.
const PCT_SCALE: u32 = 6;
/// Scale of the stored P&L dollars.
const PNL_SCALE: u32 = 8;

/// Aggregate result of one materializer pass for one user.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MaterializerReport {
    pub updated: u32,
    pub stale: u32,
    pub errors: u32,
    pub skipped_closed: u32,
}

/// Mark-to-market math for one trade at `price`.
///
/// Returns `(pnl, pnl_percent)`.
pub fn mark_trade(trade: &ShadowTrade, price: Money) -> CoreResult<(Money, Money)> {
    let pnl = match trade.side {
        Side::Buy => price.checked_sub(trade.entry_price)?,
        Side::Sell => trade.entry_price.checked_sub(price)?,
    }
    .checked_mul(trade.quantity)?
    .round_dp(PNL_SCALE);

    let basis = trade.entry_price.checked_mul(trade.quantity)?;
    let pnl_percent = pnl
        .checked_div(basis, PCT_SCALE + 2)?
        .checked_mul(Money::ONE_HUNDRED)?
        .round_dp(PCT_SCALE);

    Ok((pnl, pnl_percent))
}

/// Refresh all of one user's OPEN shadow trades.
pub async fn mark_open_trades(
    store: &dyn Store,
    broker: &dyn BrokerClient,
    scope: &UserScope,
) -> CoreResult<MaterializerReport> {
    let mut report = MaterializerReport::default();
    let mut quotes: HashMap<String, Option<Quote>> = HashMap::new();

    let rows = store.list(&scope.shadow_trades_prefix()).await?;
    for (path, _) in rows {
        let trade = match get_doc::<ShadowTrade>(store, &path).await {
            Ok(Some(t)) => t,
            Ok(None) => continue,
            Err(e) => {
                warn!(path = %path, error = %e, "unreadable shadow trade, skipping");
                report.errors += 1;
                continue;
            }
        };

        if trade.status == TradeStatus::Closed {
            report.skipped_closed += 1;
            continue;
        }

        // One quote fetch per symbol per pass.
        let quote = match quotes.get(&trade.symbol) {
            Some(cached) => cached.clone(),
            None => {
                let fetched = match broker.get_quote(&trade.symbol).await {
                    Ok(q) => Some(q),
                    Err(e) => {
                        warn!(symbol = %trade.symbol, error = %e, "quote unavailable");
                        None
                    }
                };
                quotes.insert(trade.symbol.clone(), fetched.clone());
                fetched
            }
        };

        let Some(quote) = quote else {
            debug!(trade_id = %trade.id, symbol = %trade.symbol, "stale mark, fields untouched");
            report.stale += 1;
            continue;
        };

        match apply_mark(store, scope, trade, quote.last).await {
            Ok(()) => report.updated += 1,
            Err(e) => {
                warn!(path = %path, error = %e, "mark-to-market failed for trade");
                report.errors += 1;
            }
        }
    }

    Ok(report)
}

async fn apply_mark(
    store: &dyn Store,
    scope: &UserScope,
    mut trade: ShadowTrade,
    price: Money,
) -> CoreResult<()> {
    let (pnl, pnl_percent) = mark_trade(&trade, price)?;

    trade.current_price = price;
    trade.current_pnl = pnl;
    trade.pnl_percent = pnl_percent;
    trade.last_updated = Utc::now();

    let path = scope.shadow_trade(&trade.id);
    scope.assert_owns(&path)?;
    set_doc(store, &path, &trade).await
}

/// Close a trade at `exit_price`. The OPEN -> CLOSED transition happens
/// exactly once; closing a CLOSED trade is an invariant violation.
pub async fn close_trade(
    store: &dyn Store,
    scope: &UserScope,
    trade_id: &str,
    exit_price: Money,
) -> CoreResult<ShadowTrade> {
    let path = scope.shadow_trade(trade_id);
    scope.assert_owns(&path)?;

    let mut trade: ShadowTrade = get_doc(store, &path)
        .await?
        .ok_or_else(|| CoreError::Validation(format!("unknown trade {trade_id}")))?;

    if trade.status == TradeStatus::Closed {
        return Err(CoreError::Invariant(format!(
            "trade {trade_id} is CLOSED and immutable"
        )));
    }

    let (pnl, pnl_percent) = mark_trade(&trade, exit_price)?;
    trade.current_price = exit_price;
    trade.current_pnl = pnl;
    trade.pnl_percent = pnl_percent;
    trade.status = TradeStatus::Closed;
    trade.last_updated = Utc::now();

    set_doc(store, &path, &trade).await?;
    Ok(trade)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::CoreResult;
    use crate::store::memory::MemoryStore;
    use crate::types::{AccountSnapshot, AgentProvenance};
    use async_trait::async_trait;
    use parking_lot::RwLock;
    use std::collections::HashSet;

    #[derive(Debug)]
    struct QuoteBook {
        prices: RwLock<HashMap<String, Money>>,
        failing: RwLock<HashSet<String>>,
    }

    impl QuoteBook {
        fn new() -> Self {
            Self {
                prices: RwLock::new(HashMap::new()),
                failing: RwLock::new(HashSet::new()),
            }
        }

        fn set(&self, symbol: &str, price: &str) {
            self.prices
                .write()
                .insert(symbol.into(), Money::parse_str(price).unwrap());
        }

        fn fail(&self, symbol: &str) {
            self.failing.write().insert(symbol.into());
        }
    }

    #[async_trait]
    impl BrokerClient for QuoteBook {
        async fn get_account(&self) -> CoreResult<AccountSnapshot> {
            unimplemented!("materializer never reads accounts")
        }

        async fn get_quote(&self, symbol: &str) -> CoreResult<Quote> {
            if self.failing.read().contains(symbol) {
                return Err(CoreError::Transient("feed down".into()));
            }
            let price = self
                .prices
                .read()
                .get(symbol)
                .copied()
                .ok_or_else(|| CoreError::Validation(format!("no quote for {symbol}")))?;
            Ok(Quote {
                symbol: symbol.into(),
                bid: price,
                ask: price,
                last: price,
                ts: Utc::now(),
            })
        }
    }

    fn provenance() -> AgentProvenance {
        AgentProvenance {
            agent_id: "momentum".into(),
            nonce: "n".into(),
            session_id: "s".into(),
            cert_id: "c".into(),
            signature: "sig".into(),
            signed_at: Utc::now(),
        }
    }

    fn trade(id: &str, symbol: &str, side: Side, qty: &str, entry: &str) -> ShadowTrade {
        let entry = Money::parse_str(entry).unwrap();
        ShadowTrade {
            id: id.into(),
            uid: "u1".into(),
            symbol: symbol.into(),
            side,
            quantity: Money::parse_str(qty).unwrap(),
            entry_price: entry,
            current_price: entry,
            current_pnl: Money::ZERO,
            pnl_percent: Money::ZERO,
            status: TradeStatus::Open,
            created_at: Utc::now(),
            last_updated: Utc::now(),
            reasoning: "test".into(),
            agent_provenance: provenance(),
            allocation: Money::parse_str("0.5").unwrap(),
        }
    }

    async fn seed(store: &MemoryStore, scope: &UserScope, t: &ShadowTrade) {
        set_doc(store, &scope.shadow_trade(&t.id), t).await.unwrap();
    }

    #[tokio::test]
    async fn buy_marks_with_exact_decimals() {
        let store = MemoryStore::new();
        let scope = UserScope::new("t1", "u1");
        let broker = QuoteBook::new();
        broker.set("SPY", "449.00");
        seed(
            &store,
            &scope,
            &trade("t-1", "SPY", Side::Buy, "111.60714286", "448.00"),
        )
        .await;

        let report = mark_open_trades(&store, &broker, &scope).await.unwrap();
        assert_eq!(report.updated, 1);

        let doc = store
            .get("users/u1/shadowTradeHistory/t-1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(doc["current_price"], "449.00");
        assert_eq!(doc["current_pnl"], "111.60714286");
        assert_eq!(doc["pnl_percent"], "0.223214");
        // Immutable fields untouched.
        assert_eq!(doc["entry_price"], "448.00");
        assert_eq!(doc["status"], "OPEN");
    }

    #[tokio::test]
    async fn sell_side_inverts_the_sign() {
        let store = MemoryStore::new();
        let scope = UserScope::new("t1", "u1");
        let broker = QuoteBook::new();
        broker.set("SPY", "449.00");
        seed(&store, &scope, &trade("t-1", "SPY", Side::Sell, "10", "448.00")).await;

        mark_open_trades(&store, &broker, &scope).await.unwrap();
        let doc = store
            .get("users/u1/shadowTradeHistory/t-1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(doc["current_pnl"], "-10.00");
    }

    #[tokio::test]
    async fn missing_quote_leaves_trade_untouched() {
        let store = MemoryStore::new();
        let scope = UserScope::new("t1", "u1");
        let broker = QuoteBook::new();
        broker.fail("SPY");
        broker.set("QQQ", "381.00");
        seed(&store, &scope, &trade("t-1", "SPY", Side::Buy, "10", "448.00")).await;
        seed(&store, &scope, &trade("t-2", "QQQ", Side::Buy, "10", "380.00")).await;

        let report = mark_open_trades(&store, &broker, &scope).await.unwrap();
        assert_eq!(report.stale, 1);
        assert_eq!(report.updated, 1);

        let untouched = store
            .get("users/u1/shadowTradeHistory/t-1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(untouched["current_pnl"], "0");

        let marked = store
            .get("users/u1/shadowTradeHistory/t-2")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(marked["current_pnl"], "10.00");
    }

    #[tokio::test]
    async fn closed_trades_are_never_touched() {
        let store = MemoryStore::new();
        let scope = UserScope::new("t1", "u1");
        let broker = QuoteBook::new();
        broker.set("SPY", "500.00");

        let mut closed = trade("t-1", "SPY", Side::Buy, "10", "448.00");
        closed.status = TradeStatus::Closed;
        seed(&store, &scope, &closed).await;

        let report = mark_open_trades(&store, &broker, &scope).await.unwrap();
        assert_eq!(report.skipped_closed, 1);
        assert_eq!(report.updated, 0);

        let doc = store
            .get("users/u1/shadowTradeHistory/t-1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(doc["current_price"], "448.00");
    }

    #[tokio::test]
    async fn one_bad_document_does_not_stop_the_pass() {
        let store = MemoryStore::new();
        let scope = UserScope::new("t1", "u1");
        let broker = QuoteBook::new();
        broker.set("SPY", "449.00");

        store
            .set(
                "users/u1/shadowTradeHistory/corrupt",
                serde_json::json!({"not": "a trade"}),
            )
            .await
            .unwrap();
        seed(&store, &scope, &trade("t-2", "SPY", Side::Buy, "10", "448.00")).await;

        let report = mark_open_trades(&store, &broker, &scope).await.unwrap();
        assert_eq!(report.errors, 1);
        assert_eq!(report.updated, 1);
    }

    #[tokio::test]
    async fn close_transition_happens_exactly_once() {
        let store = MemoryStore::new();
        let scope = UserScope::new("t1", "u1");
        seed(&store, &scope, &trade("t-1", "SPY", Side::Buy, "10", "448.00")).await;

        let closed = close_trade(&store, &scope, "t-1", Money::parse_str("450.00").unwrap())
            .await
            .unwrap();
        assert_eq!(closed.status, TradeStatus::Closed);
        assert_eq!(closed.current_pnl, Money::parse_str("20.00").unwrap());

        let err = close_trade(&store, &scope, "t-1", Money::parse_str("451.00").unwrap())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "invariant");
    }
}
