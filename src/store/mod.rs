// =============================================================================
// Document Store — tenant-scoped key-value persistence with range queries
// =============================================================================
//
// The core only ever talks to persistence through the `Store` trait. Paths
// are `/`-separated document addresses (`users/{uid}/status/trading`). Every
// mutation must be rooted in one of the sanctioned namespaces; anything else
// is an invariant violation, not an error to retry.
// =============================================================================

pub mod memory;
pub mod rate_limit;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::errors::{CoreError, CoreResult};

/// Namespace roots a write may live under. `tenants/` is the primary tree,
/// `users/` is the per-user operational tree, `systemStatus/` is shared
/// process-level state.
const WRITE_ROOTS: [&str; 3] = ["tenants/", "users/", "systemStatus/"];

/// Key-value document store with prefix range queries.
#[async_trait]
pub trait Store: Send + Sync {
    async fn get(&self, path: &str) -> CoreResult<Option<Value>>;
    async fn set(&self, path: &str, doc: Value) -> CoreResult<()>;
    async fn delete(&self, path: &str) -> CoreResult<()>;
    /// All documents whose path starts with `prefix`, in path order.
    async fn list(&self, prefix: &str) -> CoreResult<Vec<(String, Value)>>;
}

/// Validate that `path` is a well-formed document address under a sanctioned
/// write root.
pub fn guard_write_path(path: &str) -> CoreResult<()> {
    if !WRITE_ROOTS.iter().any(|root| path.starts_with(root)) {
        return Err(CoreError::Invariant(format!(
            "write outside sanctioned namespaces: {path:?}"
        )));
    }
    if path.ends_with('/') || path.split('/').any(|seg| seg.is_empty() || seg == "..") {
        return Err(CoreError::Invariant(format!(
            "malformed document path: {path:?}"
        )));
    }
    Ok(())
}

/// Typed read helper. Schema validation happens here, on read.
pub async fn get_doc<T: DeserializeOwned>(store: &dyn Store, path: &str) -> CoreResult<Option<T>> {
    match store.get(path).await? {
        None => Ok(None),
        Some(v) => serde_json::from_value(v)
            .map(Some)
            .map_err(|e| CoreError::Validation(format!("document at {path} failed schema: {e}"))),
    }
}

/// Typed write helper.
pub async fn set_doc<T: Serialize>(store: &dyn Store, path: &str, doc: &T) -> CoreResult<()> {
    let v = serde_json::to_value(doc)
        .map_err(|e| CoreError::Validation(format!("document for {path} unserialisable: {e}")))?;
    store.set(path, v).await
}

// =============================================================================
// UserScope — the caller's authenticated tenant/user pair
// =============================================================================

/// Identifies the `{tenant, user}` a unit of work is operating for. All of a
/// unit's writes must pass [`UserScope::assert_owns`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UserScope {
    pub tid: String,
    pub uid: String,
}

impl UserScope {
    pub fn new(tid: impl Into<String>, uid: impl Into<String>) -> Self {
        Self {
            tid: tid.into(),
            uid: uid.into(),
        }
    }

    /// Tenancy check: a scoped write may only touch the caller's own
    /// subtrees. A violation is fatal for the unit, never silently ignored.
    pub fn assert_owns(&self, path: &str) -> CoreResult<()> {
        let tenant_root = format!("tenants/{}/", self.tid);
        let user_root = format!("users/{}/", self.uid);
        if path.starts_with(&tenant_root) || path.starts_with(&user_root) {
            Ok(())
        } else {
            Err(CoreError::Invariant(format!(
                "cross-tenant write blocked: {} is outside {} / {}",
                path, tenant_root, user_root
            )))
        }
    }

    // ── Document paths ──────────────────────────────────────────────────

    /// Non-secret broker configuration (key id, base URL).
    pub fn config_alpaca(&self) -> String {
        format!("users/{}/config/alpaca", self.uid)
    }

    /// Broker secret key. Read only to build the user's client; never
    /// logged or re-persisted.
    pub fn secrets_alpaca(&self) -> String {
        format!("users/{}/secrets/alpaca", self.uid)
    }

    /// Strategy selection and risk-config overrides.
    pub fn trading_config(&self) -> String {
        format!("users/{}/config/trading", self.uid)
    }

    pub fn trading_status(&self) -> String {
        format!("users/{}/status/trading", self.uid)
    }

    pub fn last_sync_error(&self) -> String {
        format!("users/{}/status/last_sync_error", self.uid)
    }

    pub fn account_snapshot(&self) -> String {
        format!("users/{}/data/snapshot", self.uid)
    }

    pub fn shadow_trade(&self, trade_id: &str) -> String {
        format!("users/{}/shadowTradeHistory/{}", self.uid, trade_id)
    }

    pub fn shadow_trades_prefix(&self) -> String {
        format!("users/{}/shadowTradeHistory/", self.uid)
    }

    pub fn signal(&self, signal_id: &str) -> String {
        format!("users/{}/signals/{}", self.uid, signal_id)
    }

    pub fn alert(&self, alert_id: &str) -> String {
        format!("users/{}/alerts/{}", self.uid, alert_id)
    }

    pub fn watchdog_event(&self, event_id: &str) -> String {
        format!("users/{}/watchdog_events/{}", self.uid, event_id)
    }

    pub fn whale_flow_prefix(&self) -> String {
        format!("users/{}/whaleFlow/", self.uid)
    }
}

// =============================================================================
// Shared (non-tenant) paths
// =============================================================================

pub fn market_regime_path(symbol: &str) -> String {
    format!("systemStatus/market_regime/{symbol}")
}

pub fn market_regime_error_path(symbol: &str) -> String {
    format!("systemStatus/market_regime_error/{symbol}")
}

pub fn agent_registry_path(agent_id: &str) -> String {
    format!("systemStatus/agent_registry/agents/{agent_id}")
}

pub fn security_violation_path(id: &str) -> String {
    format!("systemStatus/security_log/violations/{id}")
}

pub fn execution_mode_path() -> String {
    "systemStatus/execution/mode".to_string()
}

pub fn heartbeat_summary_path() -> String {
    "systemStatus/heartbeat/last_tick".to_string()
}
