// =============================================================================
// Heartbeat Scheduler — per-tick tenant fan-out with strict isolation
// =============================================================================
//
// Invoked every minute. Lists tenants and users, then runs one bounded-
// concurrency unit of work per `{tenant, user}`:
//
//   trading-status check -> account snapshot -> P&L materializer ->
//   strategies -> maestro -> consensus -> risk guards -> shadow executor
//
// Every error is caught at the unit boundary and recorded to the user's own
// `status/last_sync_error`; one user's failure never touches another. The
// whole tick carries a deadline; each unit carries a shorter one. After all
// units finish the watchdog makes its own pass and a single tick summary is
// written.
// =============================================================================

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::StreamExt;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::app_state::AppState;
use crate::consensus::{self, Vote, DISCORDANCE_AUDIT_LEVEL};
use crate::errors::{CoreError, CoreResult};
use crate::executor::ExecutionOutcome;
use crate::materializer;
use crate::performance::PerfKey;
use crate::store::{get_doc, heartbeat_summary_path, set_doc, Store, UserScope};
use crate::strategies::{EvalContext, Signal};
use crate::types::{TickSummary, TradingStatus, UserConfig};
use crate::whale_flow;

/// Whale-flow lookback for strategy context, minutes.
const WHALE_LOOKBACK_MINS: i64 = 60;

/// Per-unit outcome, aggregated into the tick summary.
enum UnitResult {
    Processed,
    Skipped,
}

#[derive(Default)]
struct TickCounters {
    success: AtomicU32,
    errors: AtomicU32,
    skipped: AtomicU32,
}

/// Drives one tick of the control plane.
pub struct HeartbeatScheduler {
    state: Arc<AppState>,
}

impl HeartbeatScheduler {
    pub fn new(state: Arc<AppState>) -> Self {
        Self { state }
    }

    /// Run one full tick: fan out over all users, then the watchdog pass,
    /// then write the summary.
    pub async fn run_tick(&self) -> TickSummary {
        let started_at = Utc::now();
        let start = std::time::Instant::now();
        let tick_id = Uuid::new_v4().to_string();
        let counters = Arc::new(TickCounters::default());

        match self.discover_scopes().await {
            Ok(scopes) => {
                let tick_deadline = Duration::from_secs(self.state.config.tick_deadline_secs);
                let fan_out = self.run_units(&scopes, counters.clone());
                if tokio::time::timeout(tick_deadline, fan_out).await.is_err() {
                    warn!(
                        tick_id = %tick_id,
                        deadline_secs = self.state.config.tick_deadline_secs,
                        "tick deadline expired, in-flight units cancelled"
                    );
                }

                self.watchdog_pass(&scopes).await;
            }
            Err(e) => {
                warn!(error = %e, "tenant discovery failed, tick aborted");
                counters.errors.fetch_add(1, Ordering::Relaxed);
                self.state.note_store_health(false);
            }
        }

        let summary = TickSummary {
            tick_id,
            success: counters.success.load(Ordering::Relaxed),
            errors: counters.errors.load(Ordering::Relaxed),
            skipped: counters.skipped.load(Ordering::Relaxed),
            duration_ms: start.elapsed().as_millis() as u64,
            started_at,
        };

        let store_ok = set_doc(
            self.state.store.as_ref(),
            &heartbeat_summary_path(),
            &summary,
        )
        .await
        .is_ok();
        self.state.note_store_health(store_ok);
        self.state.push_tick_summary(summary.clone());

        info!(
            tick_id = %summary.tick_id,
            success = summary.success,
            errors = summary.errors,
            skipped = summary.skipped,
            duration_ms = summary.duration_ms,
            "tick complete"
        );
        summary
    }

    // ── Discovery ───────────────────────────────────────────────────────

    /// Every `{tenant, user}` pair under active tenants.
    async fn discover_scopes(&self) -> CoreResult<Vec<UserScope>> {
        let rows = self.state.store.list("tenants/").await?;
        let mut scopes = Vec::new();

        for (path, doc) in &rows {
            let segments: Vec<&str> = path.split('/').collect();
            // Tenant documents live at tenants/{tid}.
            if segments.len() == 2 {
                let active = doc.get("active").and_then(|v| v.as_bool()).unwrap_or(true);
                if !active {
                    debug!(tid = segments[1], "tenant inactive, skipping");
                    continue;
                }
                let user_prefix = format!("tenants/{}/users/", segments[1]);
                for (user_path, _) in rows.iter().filter(|(p, _)| p.starts_with(&user_prefix)) {
                    let user_segments: Vec<&str> = user_path.split('/').collect();
                    if user_segments.len() == 4 {
                        scopes.push(UserScope::new(segments[1], user_segments[3]));
                    }
                }
            }
        }

        Ok(scopes)
    }

    // ── Fan-out ─────────────────────────────────────────────────────────

    async fn run_units(&self, scopes: &[UserScope], counters: Arc<TickCounters>) {
        let unit_deadline = Duration::from_secs(self.state.config.unit_deadline_secs);

        futures_util::stream::iter(scopes.iter().cloned())
            .for_each_concurrent(self.state.config.user_fanout, |scope| {
                let counters = counters.clone();
                async move {
                    let outcome =
                        tokio::time::timeout(unit_deadline, self.process_unit(&scope)).await;
                    match outcome {
                        Ok(Ok(UnitResult::Processed)) => {
                            counters.success.fetch_add(1, Ordering::Relaxed);
                        }
                        Ok(Ok(UnitResult::Skipped)) => {
                            counters.skipped.fetch_add(1, Ordering::Relaxed);
                        }
                        Ok(Err(e)) => {
                            counters.errors.fetch_add(1, Ordering::Relaxed);
                            self.record_unit_error(&scope, &e).await;
                        }
                        Err(_) => {
                            counters.errors.fetch_add(1, Ordering::Relaxed);
                            let e = CoreError::Timeout("unit_timeout".to_string());
                            self.record_unit_error(&scope, &e).await;
                        }
                    }
                }
            })
            .await;
    }

    // ── One unit of work ────────────────────────────────────────────────

    async fn process_unit(&self, scope: &UserScope) -> CoreResult<UnitResult> {
        let store = self.state.store.as_ref();
        let config = &self.state.config;

        // ── 1. Kill-switch check. Missing status means the fail-safe
        //       default: disabled. ────────────────────────────────────────
        let status: TradingStatus = get_doc(store, &scope.trading_status())
            .await?
            .unwrap_or_default();
        if !status.enabled {
            debug!(uid = %scope.uid, "trading disabled, unit skipped");
            return Ok(UnitResult::Skipped);
        }

        // ── 2. Per-user configuration. Mutable by the user, read-only
        //       here; a missing document means defaults (full fleet,
        //       process risk limits, shared broker). ───────────────────────
        let user_config: UserConfig = get_doc(store, &scope.trading_config())
            .await?
            .unwrap_or_default();

        // ── 3. Account snapshot, through the user's own broker when they
        //       have credentials on file ──────────────────────────────────
        let broker = self.state.brokers.broker_for(scope).await?;
        let account = broker.get_account().await?;
        let snapshot_path = scope.account_snapshot();
        scope.assert_owns(&snapshot_path)?;
        set_doc(store, &snapshot_path, &account).await?;

        let now = Utc::now();
        self.state
            .watchdog
            .observe_equity(&scope.uid, account.equity, now);
        let starting_equity =
            self.state
                .day_start_equity(&scope.uid, now.date_naive(), account.equity);

        // ── 4. Mark-to-market ────────────────────────────────────────────
        let marks = materializer::mark_open_trades(store, broker.as_ref(), scope).await?;
        if marks.stale > 0 || marks.errors > 0 {
            debug!(
                uid = %scope.uid,
                updated = marks.updated,
                stale = marks.stale,
                errors = marks.errors,
                "materializer pass had gaps"
            );
        }

        // ── 5. Shared market state ───────────────────────────────────────
        let symbol = config.regime_symbol.clone();
        let quote = broker.get_quote(&symbol).await?;
        let regime = self.state.regime_engine.current();
        let whale = whale_flow::recent_conviction(
            store,
            scope,
            &symbol,
            chrono::Duration::minutes(WHALE_LOOKBACK_MINS),
            config.whale_mixed_margin,
        )
        .await
        .ok();

        let ctx = EvalContext {
            symbol: symbol.clone(),
            account: account.clone(),
            quote: quote.clone(),
            regime: regime.clone(),
            whale,
        };

        // ── 6. Strategy evaluation over the user's selected fleet
        //       (parallel, then deterministically sorted by agent id
        //       through the BTreeMap) ───────────────────────────────────────
        let selected: Vec<_> = self
            .state
            .registry
            .all()
            .iter()
            .filter(|s| user_config.strategy_enabled(s.agent_id()))
            .collect();
        if selected.is_empty() {
            debug!(uid = %scope.uid, "user has no strategies enabled, nothing to evaluate");
            return Ok(UnitResult::Processed);
        }

        let ctx_ref = &ctx;
        let evaluations = futures_util::future::join_all(selected.iter().map(|s| {
            let ctx = ctx_ref;
            async move { (s.agent_id().to_string(), s.evaluate(ctx).await) }
        }))
        .await;

        let mut raw: BTreeMap<String, Signal> = BTreeMap::new();
        for (agent_id, result) in evaluations {
            match result {
                Ok(signal) => {
                    raw.insert(agent_id, signal);
                }
                Err(e) => {
                    warn!(uid = %scope.uid, agent_id = %agent_id, error = %e, "strategy evaluation failed");
                }
            }
        }
        if raw.is_empty() {
            return Err(CoreError::Validation("no strategy produced a signal".into()));
        }

        // ── 7. Orchestrate ───────────────────────────────────────────────
        let mut sharpes: BTreeMap<String, Option<f64>> = BTreeMap::new();
        for agent_id in raw.keys() {
            let key = PerfKey::new(&scope.tid, &scope.uid, agent_id);
            sharpes.insert(agent_id.clone(), self.state.performance.sharpe(&key, now));
        }
        let (mut signals, _summary) = self
            .state
            .maestro
            .orchestrate(&symbol, raw, &sharpes)
            .await?;

        // ── 8. Consensus ─────────────────────────────────────────────────
        let votes: Vec<Vote> = signals
            .values()
            .map(|s| Vote {
                agent_id: s.agent_id.clone(),
                kind: s.kind,
                confidence: s.confidence,
                weight: 1.0,
            })
            .collect();
        let outcome = consensus::evaluate(&votes, config.consensus_threshold);

        if outcome.discordance > DISCORDANCE_AUDIT_LEVEL {
            let audit_id = Uuid::new_v4().to_string();
            set_doc(store, &scope.signal(&audit_id), &outcome).await?;
            debug!(uid = %scope.uid, discordance = outcome.discordance, "high discordance recorded");
        }

        if !outcome.should_execute {
            debug!(
                uid = %scope.uid,
                action = %outcome.final_action,
                score = outcome.score,
                "consensus below gate, no execution"
            );
            return Ok(UnitResult::Processed);
        }

        // ── 9. Risk guards (with the user's overrides) + execution, in
        //       agent order ──────────────────────────────────────────────
        let breaker = self.state.breaker.with_overrides(user_config.risk.as_ref());
        let guard_ctx = crate::risk::GuardContext {
            starting_equity,
            current_equity: account.equity,
            volatility_index: None,
            account: account.clone(),
            mark_price: quote.last,
        };

        for (agent_id, sig) in signals.iter_mut() {
            if sig.kind != outcome.final_action {
                continue;
            }
            breaker.apply(sig, &guard_ctx)?;

            let result = self
                .state
                .executor
                .execute(scope, sig, &status, &quote, &account, &outcome)
                .await;

            if let ExecutionOutcome::Recorded {
                quantity,
                fill_price,
                ..
            } = &result
            {
                if let Some(side) = sig.kind.side() {
                    let key = PerfKey::new(&scope.tid, &scope.uid, agent_id);
                    self.state
                        .performance
                        .record_fill(&key, side, *quantity, *fill_price, now)?;
                }
            }
            debug!(uid = %scope.uid, agent_id = %agent_id, result = %result, "execution attempt");
        }

        Ok(UnitResult::Processed)
    }

    async fn record_unit_error(&self, scope: &UserScope, error: &CoreError) {
        warn!(uid = %scope.uid, kind = error.kind(), error = %error, "unit failed");
        let doc = serde_json::json!({
            "kind": error.kind(),
            "message": error.to_string(),
            "ts": Utc::now().to_rfc3339(),
        });
        if let Err(e) = self
            .state
            .store
            .set(&scope.last_sync_error(), doc)
            .await
        {
            warn!(uid = %scope.uid, error = %e, "failed to record unit error");
        }
    }

    // ── Watchdog pass ───────────────────────────────────────────────────

    async fn watchdog_pass(&self, scopes: &[UserScope]) {
        let regime = self.state.regime_engine.current();
        for scope in scopes {
            if let Err(e) = self
                .state
                .watchdog
                .run_user(scope, regime.as_ref())
                .await
            {
                warn!(uid = %scope.uid, error = %e, "watchdog pass failed for user");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app_state::BrokerProvider;
    use crate::clients::broker::BrokerClient;
    use crate::clients::llm::DisabledLlm;
    use crate::clients::options::StaticOptionsClient;
    use crate::config::CoreConfig;
    use crate::money::Money;
    use crate::store::memory::MemoryStore;
    use crate::strategies::{Strategy, StrategyRegistry};
    use crate::types::{AccountSnapshot, Quote, SignalKind};
    use async_trait::async_trait;
    use std::collections::HashMap;

    #[derive(Debug)]
    struct StubBroker {
        equity: Money,
        last: Money,
        delay_ms: u64,
        fail: bool,
    }

    impl StubBroker {
        fn healthy() -> Self {
            Self {
                equity: Money::parse_str("100000.00").unwrap(),
                last: Money::parse_str("448.00").unwrap(),
                delay_ms: 0,
                fail: false,
            }
        }
    }

    #[async_trait]
    impl BrokerClient for StubBroker {
        async fn get_account(&self) -> CoreResult<AccountSnapshot> {
            if self.delay_ms > 0 {
                tokio::time::sleep(Duration::from_millis(self.delay_ms)).await;
            }
            if self.fail {
                return Err(CoreError::Transient("broker unreachable".into()));
            }
            Ok(AccountSnapshot {
                equity: self.equity,
                cash: self.equity,
                buying_power: self.equity,
                positions: vec![],
                as_of: Utc::now(),
            })
        }

        async fn get_quote(&self, symbol: &str) -> CoreResult<Quote> {
            if self.fail {
                return Err(CoreError::Transient("broker unreachable".into()));
            }
            Ok(Quote {
                symbol: symbol.to_string(),
                bid: self.last,
                ask: self.last,
                last: self.last,
                ts: Utc::now(),
            })
        }
    }

    /// Per-uid broker routing for isolation tests.
    struct RoutedBrokers {
        routes: HashMap<String, Arc<dyn BrokerClient>>,
        default: Arc<dyn BrokerClient>,
    }

    #[async_trait]
    impl BrokerProvider for RoutedBrokers {
        async fn broker_for(&self, scope: &UserScope) -> CoreResult<Arc<dyn BrokerClient>> {
            Ok(self
                .routes
                .get(&scope.uid)
                .cloned()
                .unwrap_or_else(|| self.default.clone()))
        }
    }

    struct AlwaysBuy;

    #[async_trait]
    impl Strategy for AlwaysBuy {
        fn agent_id(&self) -> &str {
            "always_buy"
        }

        async fn evaluate(&self, _ctx: &EvalContext) -> CoreResult<Signal> {
            Ok(Signal {
                kind: SignalKind::Buy,
                confidence: 0.9,
                reasoning: "test strategy".into(),
                allocation: Money::parse_str("0.15").unwrap(),
                metadata: None,
            })
        }
    }

    async fn seed_tenancy(store: &MemoryStore, users: &[(&str, bool)]) {
        store
            .set("tenants/t1", serde_json::json!({"active": true}))
            .await
            .unwrap();
        for (uid, enabled) in users {
            store
                .set(
                    &format!("tenants/t1/users/{uid}"),
                    serde_json::json!({"onboarded": true}),
                )
                .await
                .unwrap();
            let status = TradingStatus {
                enabled: *enabled,
                disabled_by: None,
                reason: None,
                since: Utc::now(),
            };
            set_doc(store, &format!("users/{uid}/status/trading"), &status)
                .await
                .unwrap();
        }
    }

    async fn build_state(
        raw_store: Arc<MemoryStore>,
        registry: StrategyRegistry,
    ) -> Arc<AppState> {
        let state = AppState::new(
            CoreConfig::default(),
            raw_store,
            Arc::new(StubBroker::healthy()),
            Arc::new(StaticOptionsClient::symmetric(
                Money::from_int(448),
                Utc::now().date_naive(),
            )),
            Arc::new(DisabledLlm),
            registry,
        );
        // The test strategy set must have signing identities.
        for strategy in state.registry.all() {
            state
                .vault
                .register_or_load(state.store.as_ref(), strategy.agent_id())
                .await
                .unwrap();
        }
        Arc::new(state)
    }

    fn registry_with_always_buy() -> StrategyRegistry {
        let mut registry = StrategyRegistry::new();
        registry.register(Arc::new(AlwaysBuy));
        registry
    }

    #[tokio::test]
    async fn tick_processes_enabled_and_skips_disabled() {
        let raw = Arc::new(MemoryStore::new());
        seed_tenancy(&raw, &[("u1", true), ("u2", false)]).await;
        let state = build_state(raw.clone(), registry_with_always_buy()).await;

        let scheduler = HeartbeatScheduler::new(state);
        let summary = scheduler.run_tick().await;

        assert_eq!(summary.success, 1);
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.errors, 0);

        // The enabled user got an account snapshot and a shadow trade.
        assert!(raw.get("users/u1/data/snapshot").await.unwrap().is_some());
        let trades = raw.list("users/u1/shadowTradeHistory/").await.unwrap();
        assert_eq!(trades.len(), 1);
        assert_eq!(trades[0].1["side"], "BUY");
        assert_eq!(trades[0].1["status"], "OPEN");

        // The disabled user got neither.
        assert!(raw.get("users/u2/data/snapshot").await.unwrap().is_none());
        assert!(raw
            .list("users/u2/shadowTradeHistory/")
            .await
            .unwrap()
            .is_empty());

        // One tick summary landed in the store.
        assert!(raw
            .get("systemStatus/heartbeat/last_tick")
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn one_failing_user_never_blocks_the_others() {
        let raw = Arc::new(MemoryStore::new());
        seed_tenancy(&raw, &[("u1", true), ("u2", true), ("u3", true)]).await;

        let mut routes: HashMap<String, Arc<dyn BrokerClient>> = HashMap::new();
        routes.insert(
            "u2".to_string(),
            Arc::new(StubBroker {
                equity: Money::ZERO,
                last: Money::ZERO,
                delay_ms: 0,
                fail: true,
            }),
        );
        let provider = Arc::new(RoutedBrokers {
            routes,
            default: Arc::new(StubBroker::healthy()),
        });

        let state = AppState::new(
            CoreConfig::default(),
            raw.clone(),
            Arc::new(StubBroker::healthy()),
            Arc::new(StaticOptionsClient::symmetric(
                Money::from_int(448),
                Utc::now().date_naive(),
            )),
            Arc::new(DisabledLlm),
            registry_with_always_buy(),
        )
        .with_broker_provider(provider);
        state
            .vault
            .register_or_load(state.store.as_ref(), "always_buy")
            .await
            .unwrap();
        let state = Arc::new(state);

        let summary = HeartbeatScheduler::new(state).run_tick().await;
        assert_eq!(summary.success, 2);
        assert_eq!(summary.errors, 1);
        assert_eq!(summary.skipped, 0);

        // The failing user's error is recorded in their own subtree.
        let err_doc = raw
            .get("users/u2/status/last_sync_error")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(err_doc["kind"], "transient");

        // The healthy users still traded.
        assert_eq!(raw.list("users/u1/shadowTradeHistory/").await.unwrap().len(), 1);
        assert_eq!(raw.list("users/u3/shadowTradeHistory/").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn slow_unit_times_out_and_is_recorded() {
        let raw = Arc::new(MemoryStore::new());
        seed_tenancy(&raw, &[("u1", true)]).await;

        let mut config = CoreConfig::default();
        config.unit_deadline_secs = 0;

        let state = AppState::new(
            config,
            raw.clone(),
            Arc::new(StubBroker {
                equity: Money::parse_str("100000").unwrap(),
                last: Money::parse_str("448").unwrap(),
                delay_ms: 200,
                fail: false,
            }),
            Arc::new(StaticOptionsClient::symmetric(
                Money::from_int(448),
                Utc::now().date_naive(),
            )),
            Arc::new(DisabledLlm),
            registry_with_always_buy(),
        );
        state
            .vault
            .register_or_load(state.store.as_ref(), "always_buy")
            .await
            .unwrap();

        let summary = HeartbeatScheduler::new(Arc::new(state)).run_tick().await;
        assert_eq!(summary.errors, 1);

        let err_doc = raw
            .get("users/u1/status/last_sync_error")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(err_doc["kind"], "timeout");
    }

    #[tokio::test]
    async fn inactive_tenant_is_skipped_entirely() {
        let raw = Arc::new(MemoryStore::new());
        raw.set("tenants/t9", serde_json::json!({"active": false}))
            .await
            .unwrap();
        raw.set("tenants/t9/users/u9", serde_json::json!({}))
            .await
            .unwrap();

        let state = build_state(raw.clone(), registry_with_always_buy()).await;
        let summary = HeartbeatScheduler::new(state).run_tick().await;
        assert_eq!(summary.success + summary.errors + summary.skipped, 0);
    }

    #[tokio::test]
    async fn strategy_selection_scopes_the_fleet_per_user() {
        let raw = Arc::new(MemoryStore::new());
        seed_tenancy(&raw, &[("u1", true), ("u2", true)]).await;

        // u1 keeps the buying strategy, u2 opts out of everything.
        set_doc(
            raw.as_ref(),
            "users/u1/config/trading",
            &UserConfig {
                strategies: Some(vec!["always_buy".into()]),
                risk: None,
            },
        )
        .await
        .unwrap();
        set_doc(
            raw.as_ref(),
            "users/u2/config/trading",
            &UserConfig {
                strategies: Some(vec![]),
                risk: None,
            },
        )
        .await
        .unwrap();

        let state = build_state(raw.clone(), registry_with_always_buy()).await;
        let summary = HeartbeatScheduler::new(state).run_tick().await;
        assert_eq!(summary.success, 2);
        assert_eq!(summary.errors, 0);

        assert_eq!(raw.list("users/u1/shadowTradeHistory/").await.unwrap().len(), 1);
        // u2 was processed (snapshot written) but evaluated nothing.
        assert!(raw.get("users/u2/data/snapshot").await.unwrap().is_some());
        assert!(raw
            .list("users/u2/shadowTradeHistory/")
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn per_user_risk_override_blocks_the_trade() {
        let raw = Arc::new(MemoryStore::new());
        seed_tenancy(&raw, &[("u1", true), ("u2", true)]).await;

        // u1 tightens concentration below the strategy's 0.15 allocation;
        // u2 runs the process default of 0.20.
        set_doc(
            raw.as_ref(),
            "users/u1/config/trading",
            &UserConfig {
                strategies: None,
                risk: Some(crate::types::RiskOverrides {
                    daily_loss_limit: None,
                    volatility_threshold: None,
                    max_concentration: Some(Money::parse_str("0.10").unwrap()),
                }),
            },
        )
        .await
        .unwrap();

        let state = build_state(raw.clone(), registry_with_always_buy()).await;
        let summary = HeartbeatScheduler::new(state).run_tick().await;
        assert_eq!(summary.success, 2);

        // u1's buy was coerced to HOLD by their own limit; u2 traded.
        assert!(raw
            .list("users/u1/shadowTradeHistory/")
            .await
            .unwrap()
            .is_empty());
        assert_eq!(raw.list("users/u2/shadowTradeHistory/").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn user_without_status_defaults_to_disabled() {
        let raw = Arc::new(MemoryStore::new());
        raw.set("tenants/t1", serde_json::json!({"active": true}))
            .await
            .unwrap();
        raw.set("tenants/t1/users/u1", serde_json::json!({}))
            .await
            .unwrap();

        let state = build_state(raw.clone(), registry_with_always_buy()).await;
        let summary = HeartbeatScheduler::new(state).run_tick().await;
        assert_eq!(summary.skipped, 1);
        assert!(raw
            .list("users/u1/shadowTradeHistory/")
            .await
            .unwrap()
            .is_empty());
    }
}
