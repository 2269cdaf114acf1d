// =============================================================================
// Central Application State — Maestro trading core
// =============================================================================
//
// The single wiring point for the control plane. All long-lived handles are
// created once at startup and carried through the pipeline explicitly; no
// subsystem reaches for globals.
//
// Thread safety:
//   - Atomic counters for tick bookkeeping.
//   - parking_lot::RwLock for the small mutable collections.
//   - Arc wrappers for subsystems managing their own interior mutability.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use parking_lot::RwLock;
use tracing::info;

use crate::clients::broker::{AlpacaConfig, AlpacaSecrets, BrokerClient, PaperBrokerClient};
use crate::clients::llm::LlmClient;
use crate::clients::options::OptionsDataClient;
use crate::config::{ensure_paper_host, CoreConfig};
use crate::errors::CoreResult;
use crate::executor::ShadowExecutor;
use crate::identity::IdentityVault;
use crate::maestro::Maestro;
use crate::money::Money;
use crate::performance::PerformanceTracker;
use crate::regime::RegimeEngine;
use crate::risk::RiskBreaker;
use crate::store::rate_limit::{RateLimitedStore, WriteLimiter};
use crate::store::{get_doc, Store, UserScope};
use crate::strategies::StrategyRegistry;
use crate::types::TickSummary;
use crate::watchdog::{Watchdog, WatchdogConfig};

/// Maximum number of recent tick summaries retained in memory.
const MAX_RECENT_TICKS: usize = 120;

/// Hands a broker client to each unit of work.
#[async_trait]
pub trait BrokerProvider: Send + Sync {
    async fn broker_for(&self, scope: &UserScope) -> CoreResult<Arc<dyn BrokerClient>>;
}

/// One client for every user, regardless of scope.
pub struct SharedBroker(pub Arc<dyn BrokerClient>);

#[async_trait]
impl BrokerProvider for SharedBroker {
    async fn broker_for(&self, _scope: &UserScope) -> CoreResult<Arc<dyn BrokerClient>> {
        Ok(self.0.clone())
    }
}

/// The default provider: builds one client per user from the credentials at
/// `users/{uid}/config/alpaca` + `users/{uid}/secrets/alpaca`, falling back
/// to the process-level client for users with nothing on file.
///
/// A per-user base URL must still be a paper host; anything else is refused
/// as a safety violation, which fails that user's unit and nobody else's.
/// Credentialed clients are cached per uid for the life of the process.
pub struct UserCredentialBrokers {
    store: Arc<dyn Store>,
    fallback: Arc<dyn BrokerClient>,
    default_base_url: String,
    cache: RwLock<HashMap<String, Arc<dyn BrokerClient>>>,
}

impl UserCredentialBrokers {
    pub fn new(
        store: Arc<dyn Store>,
        fallback: Arc<dyn BrokerClient>,
        default_base_url: impl Into<String>,
    ) -> Self {
        Self {
            store,
            fallback,
            default_base_url: default_base_url.into(),
            cache: RwLock::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl BrokerProvider for UserCredentialBrokers {
    async fn broker_for(&self, scope: &UserScope) -> CoreResult<Arc<dyn BrokerClient>> {
        if let Some(client) = self.cache.read().get(&scope.uid) {
            return Ok(client.clone());
        }

        let config: Option<AlpacaConfig> =
            get_doc(self.store.as_ref(), &scope.config_alpaca()).await?;
        let secrets: Option<AlpacaSecrets> =
            get_doc(self.store.as_ref(), &scope.secrets_alpaca()).await?;

        match (config, secrets) {
            (Some(config), Some(secrets)) => {
                let base_url = config
                    .base_url
                    .clone()
                    .unwrap_or_else(|| self.default_base_url.clone());
                ensure_paper_host(&base_url)?;

                let client: Arc<dyn BrokerClient> = Arc::new(PaperBrokerClient::new(
                    base_url,
                    &config.key_id,
                    &secrets.secret_key,
                ));
                info!(uid = %scope.uid, "per-user broker client built from stored credentials");
                self.cache
                    .write()
                    .insert(scope.uid.clone(), client.clone());
                Ok(client)
            }
            // No (complete) credentials on file: shared client, uncached so
            // a later credential upload takes effect next tick.
            _ => Ok(self.fallback.clone()),
        }
    }
}

/// Process-scoped state shared across all tasks via `Arc<AppState>`.
pub struct AppState {
    pub config: CoreConfig,

    // ── Persistence ─────────────────────────────────────────────────────
    /// Rate-limited store every component writes through.
    pub store: Arc<dyn Store>,
    pub limiter: Arc<WriteLimiter>,

    // ── External collaborators ──────────────────────────────────────────
    pub brokers: Arc<dyn BrokerProvider>,

    // ── Pipeline components ─────────────────────────────────────────────
    pub vault: Arc<IdentityVault>,
    pub registry: Arc<StrategyRegistry>,
    pub performance: Arc<PerformanceTracker>,
    pub maestro: Maestro,
    pub breaker: RiskBreaker,
    pub executor: ShadowExecutor,
    pub watchdog: Watchdog,
    pub regime_engine: Arc<RegimeEngine>,

    // ── Tick bookkeeping ────────────────────────────────────────────────
    pub ticks_run: AtomicU64,
    pub consecutive_store_failures: AtomicU32,
    pub recent_ticks: RwLock<Vec<TickSummary>>,
    /// First equity observation of the calendar day, per user. The daily
    /// loss guard measures against this anchor.
    day_anchor: RwLock<HashMap<String, (NaiveDate, Money)>>,

    pub start_time: std::time::Instant,
}

impl AppState {
    /// Wire up the full control plane from its external collaborators.
    pub fn new(
        config: CoreConfig,
        raw_store: Arc<dyn Store>,
        broker: Arc<dyn BrokerClient>,
        options: Arc<dyn OptionsDataClient>,
        llm: Arc<dyn LlmClient>,
        registry: StrategyRegistry,
    ) -> Self {
        let limiter = Arc::new(WriteLimiter::new(
            config.rate_limit_writes_per_sec,
            config.rate_limit_burst,
        ));
        let store: Arc<dyn Store> =
            Arc::new(RateLimitedStore::new(raw_store, limiter.clone()));

        let vault = Arc::new(IdentityVault::new());
        let llm_deadline = Duration::from_millis(config.llm_deadline_ms);

        let maestro = Maestro::new(
            vault.clone(),
            llm.clone(),
            config.systemic_sell_threshold,
            config.sharpe_reduce,
            config.sharpe_shadow,
            llm_deadline,
        );

        let breaker = RiskBreaker::new(
            config.daily_loss_limit,
            config.volatility_threshold,
            config.max_concentration,
        );

        let executor = ShadowExecutor::new(store.clone(), vault.clone());

        let watchdog = Watchdog::new(
            store.clone(),
            llm,
            WatchdogConfig {
                streak_len: config.watchdog_streak_len,
                streak_dollars: config.watchdog_streak_dollars,
                drawdown_limit: config.watchdog_drawdown_limit,
                mismatch_fills: config.watchdog_mismatch_fills,
                window_mins: config.watchdog_window_mins,
            },
            llm_deadline,
        );

        let regime_engine = Arc::new(RegimeEngine::new(
            config.regime_symbol.clone(),
            config.regime_epsilon,
            broker.clone(),
            options,
            store.clone(),
        ));

        let brokers = Arc::new(UserCredentialBrokers::new(
            store.clone(),
            broker,
            config.broker_base_url.clone(),
        ));

        Self {
            config,
            store,
            limiter,
            brokers,
            vault,
            registry: Arc::new(registry),
            performance: Arc::new(PerformanceTracker::new(5)),
            maestro,
            breaker,
            executor,
            watchdog,
            regime_engine,
            ticks_run: AtomicU64::new(0),
            consecutive_store_failures: AtomicU32::new(0),
            recent_ticks: RwLock::new(Vec::new()),
            day_anchor: RwLock::new(HashMap::new()),
            start_time: std::time::Instant::now(),
        }
    }

    /// Swap in a different broker provider (per-user credentials).
    pub fn with_broker_provider(mut self, provider: Arc<dyn BrokerProvider>) -> Self {
        self.brokers = provider;
        self
    }

    // ── Day anchors ─────────────────────────────────────────────────────

    /// The user's equity at the day's first observation. Inserts `current`
    /// when the calendar day rolls over.
    pub fn day_start_equity(&self, uid: &str, today: NaiveDate, current: Money) -> Money {
        let mut anchors = self.day_anchor.write();
        match anchors.get(uid) {
            Some((date, equity)) if *date == today => *equity,
            _ => {
                anchors.insert(uid.to_string(), (today, current));
                current
            }
        }
    }

    // ── Tick bookkeeping ────────────────────────────────────────────────

    pub fn push_tick_summary(&self, summary: TickSummary) {
        self.ticks_run.fetch_add(1, Ordering::Relaxed);
        let mut ticks = self.recent_ticks.write();
        ticks.push(summary);
        while ticks.len() > MAX_RECENT_TICKS {
            ticks.remove(0);
        }
    }

    /// Track persistence health. Returns the current failure streak.
    pub fn note_store_health(&self, ok: bool) -> u32 {
        if ok {
            self.consecutive_store_failures.store(0, Ordering::Relaxed);
            0
        } else {
            self.consecutive_store_failures.fetch_add(1, Ordering::Relaxed) + 1
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::llm::DisabledLlm;
    use crate::clients::options::StaticOptionsClient;
    use crate::errors::CoreError;
    use crate::store::memory::MemoryStore;
    use crate::types::{AccountSnapshot, Quote};
    use chrono::Utc;
    use serde_json::json;

    #[derive(Debug)]
    struct NoBroker;

    #[async_trait]
    impl BrokerClient for NoBroker {
        async fn get_account(&self) -> CoreResult<AccountSnapshot> {
            Err(CoreError::Transient("test".into()))
        }

        async fn get_quote(&self, _symbol: &str) -> CoreResult<Quote> {
            Err(CoreError::Transient("test".into()))
        }
    }

    #[test]
    fn day_anchor_holds_for_the_day_and_rolls_over() {
        let state_anchor = |uid: &str, day: NaiveDate, eq: &str, state: &AppState| {
            state.day_start_equity(uid, day, Money::parse_str(eq).unwrap())
        };

        let state = test_state();
        let today = Utc::now().date_naive();
        let tomorrow = today.succ_opt().unwrap();

        // First observation anchors the day.
        assert_eq!(
            state_anchor("u1", today, "100000", &state),
            Money::parse_str("100000").unwrap()
        );
        // Later observations keep the anchor.
        assert_eq!(
            state_anchor("u1", today, "97000", &state),
            Money::parse_str("100000").unwrap()
        );
        // A new day re-anchors.
        assert_eq!(
            state_anchor("u1", tomorrow, "97000", &state),
            Money::parse_str("97000").unwrap()
        );
    }

    #[test]
    fn store_health_streak_counts_and_resets() {
        let state = test_state();
        assert_eq!(state.note_store_health(false), 1);
        assert_eq!(state.note_store_health(false), 2);
        assert_eq!(state.note_store_health(true), 0);
        assert_eq!(state.note_store_health(false), 1);
    }

    #[test]
    fn tick_ring_buffer_is_bounded() {
        let state = test_state();
        for i in 0..(MAX_RECENT_TICKS + 10) {
            state.push_tick_summary(TickSummary {
                tick_id: format!("tick-{i}"),
                success: 1,
                errors: 0,
                skipped: 0,
                duration_ms: 5,
                started_at: Utc::now(),
            });
        }
        assert_eq!(state.recent_ticks.read().len(), MAX_RECENT_TICKS);
        assert_eq!(
            state.ticks_run.load(Ordering::Relaxed),
            (MAX_RECENT_TICKS + 10) as u64
        );
    }

    fn test_state() -> AppState {
        AppState::new(
            CoreConfig::default(),
            Arc::new(MemoryStore::new()),
            Arc::new(NoBroker),
            Arc::new(StaticOptionsClient::symmetric(
                Money::from_int(448),
                Utc::now().date_naive(),
            )),
            Arc::new(DisabledLlm),
            StrategyRegistry::default(),
        )
    }

    // ── Per-user broker routing ─────────────────────────────────────────

    fn provider(store: Arc<MemoryStore>, fallback: Arc<dyn BrokerClient>) -> UserCredentialBrokers {
        UserCredentialBrokers::new(store, fallback, "https://paper-api.alpaca.markets")
    }

    #[tokio::test]
    async fn shared_broker_ignores_scope() {
        let client: Arc<dyn BrokerClient> = Arc::new(NoBroker);
        let brokers = SharedBroker(client.clone());
        let a = brokers.broker_for(&UserScope::new("t1", "u1")).await.unwrap();
        let b = brokers.broker_for(&UserScope::new("t2", "u2")).await.unwrap();
        assert!(Arc::ptr_eq(&a, &client));
        assert!(Arc::ptr_eq(&b, &client));
    }

    #[tokio::test]
    async fn missing_credentials_fall_back_to_shared_client() {
        let store = Arc::new(MemoryStore::new());
        let fallback: Arc<dyn BrokerClient> = Arc::new(NoBroker);
        let brokers = provider(store, fallback.clone());

        let client = brokers
            .broker_for(&UserScope::new("t1", "u1"))
            .await
            .unwrap();
        assert!(Arc::ptr_eq(&client, &fallback));
    }

    #[tokio::test]
    async fn stored_credentials_build_a_dedicated_client() {
        let store = Arc::new(MemoryStore::new());
        store
            .set(
                "users/u1/config/alpaca",
                json!({"key_id": "PKTEST", "base_url": "https://paper-api.alpaca.markets"}),
            )
            .await
            .unwrap();
        store
            .set("users/u1/secrets/alpaca", json!({"secret_key": "s3cr3t"}))
            .await
            .unwrap();

        let fallback: Arc<dyn BrokerClient> = Arc::new(NoBroker);
        let brokers = provider(store, fallback.clone());
        let scope = UserScope::new("t1", "u1");

        let client = brokers.broker_for(&scope).await.unwrap();
        assert!(!Arc::ptr_eq(&client, &fallback));

        // Cached on the second lookup.
        let again = brokers.broker_for(&scope).await.unwrap();
        assert!(Arc::ptr_eq(&client, &again));
    }

    #[tokio::test]
    async fn partial_credentials_fall_back() {
        let store = Arc::new(MemoryStore::new());
        store
            .set("users/u1/config/alpaca", json!({"key_id": "PKTEST"}))
            .await
            .unwrap();

        let fallback: Arc<dyn BrokerClient> = Arc::new(NoBroker);
        let brokers = provider(store, fallback.clone());
        let client = brokers
            .broker_for(&UserScope::new("t1", "u1"))
            .await
            .unwrap();
        assert!(Arc::ptr_eq(&client, &fallback));
    }

    #[tokio::test]
    async fn live_per_user_url_is_refused() {
        let store = Arc::new(MemoryStore::new());
        store
            .set(
                "users/u1/config/alpaca",
                json!({"key_id": "PKTEST", "base_url": "https://api.alpaca.markets"}),
            )
            .await
            .unwrap();
        store
            .set("users/u1/secrets/alpaca", json!({"secret_key": "s3cr3t"}))
            .await
            .unwrap();

        let brokers = provider(store, Arc::new(NoBroker));
        let err = brokers
            .broker_for(&UserScope::new("t1", "u1"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "safety");
    }
}
