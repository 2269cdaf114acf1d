// =============================================================================
// Shared domain types used across the Maestro trading core
// =============================================================================
//
// Records that cross module boundaries or get persisted live here. Strict
// schemas with explicit optional fields; validation happens on read at the
// persistence boundary, not on write.
// =============================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::money::{Money, MoneyError};

// =============================================================================
// Action / status enums
// =============================================================================

/// Direction of a recorded trade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Side {
    Buy,
    Sell,
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => write!(f, "BUY"),
            Self::Sell => write!(f, "SELL"),
        }
    }
}

/// The action carried by a strategy signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SignalKind {
    Buy,
    Sell,
    Hold,
    CloseAll,
}

impl SignalKind {
    /// The trade side this action maps to, if it trades at all.
    pub fn side(&self) -> Option<Side> {
        match self {
            Self::Buy => Some(Side::Buy),
            Self::Sell | Self::CloseAll => Some(Side::Sell),
            Self::Hold => None,
        }
    }
}

impl std::fmt::Display for SignalKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => write!(f, "BUY"),
            Self::Sell => write!(f, "SELL"),
            Self::Hold => write!(f, "HOLD"),
            Self::CloseAll => write!(f, "CLOSE_ALL"),
        }
    }
}

/// Lifecycle of a shadow trade. `Closed` is terminal and immutable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TradeStatus {
    Open,
    Closed,
}

/// Dealer-gamma regime label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RegimeLabel {
    LongGamma,
    ShortGamma,
    Neutral,
}

impl std::fmt::Display for RegimeLabel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::LongGamma => write!(f, "LONG_GAMMA"),
            Self::ShortGamma => write!(f, "SHORT_GAMMA"),
            Self::Neutral => write!(f, "NEUTRAL"),
        }
    }
}

/// Derived per-strategy participation mode, recomputed each tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StrategyMode {
    Active,
    Reduced,
    ShadowMode,
}

impl std::fmt::Display for StrategyMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => write!(f, "ACTIVE"),
            Self::Reduced => write!(f, "REDUCED"),
            Self::ShadowMode => write!(f, "SHADOW_MODE"),
        }
    }
}

/// Alert / watchdog-event severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    Medium,
    High,
    Critical,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Medium => write!(f, "MEDIUM"),
            Self::High => write!(f, "HIGH"),
            Self::Critical => write!(f, "CRITICAL"),
        }
    }
}

/// Anomaly classes the watchdog can detect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyType {
    LosingStreak,
    RapidDrawdown,
    MarketMismatch,
}

impl std::fmt::Display for AnomalyType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::LosingStreak => write!(f, "losing_streak"),
            Self::RapidDrawdown => write!(f, "rapid_drawdown"),
            Self::MarketMismatch => write!(f, "market_mismatch"),
        }
    }
}

// =============================================================================
// Per-user control records
// =============================================================================

/// Per-user risk limit overrides. Anything unset falls back to the
/// process-level limit.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RiskOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub daily_loss_limit: Option<Money>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub volatility_threshold: Option<Money>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_concentration: Option<Money>,
}

/// Per-user trading configuration. Mutable by the user, read-only to the
/// core; read once per unit of work each tick.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserConfig {
    /// Agent ids this user has enabled. `None` means the full fleet.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategies: Option<Vec<String>>,
    /// Risk limit overrides layered over the process defaults.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub risk: Option<RiskOverrides>,
}

impl UserConfig {
    /// Whether this user has enabled the given strategy.
    pub fn strategy_enabled(&self, agent_id: &str) -> bool {
        match &self.strategies {
            None => true,
            Some(selected) => selected.iter().any(|s| s == agent_id),
        }
    }
}

/// The per-user kill-switch, read before every trade.
///
/// New users start disabled: trading is opt-in, never opt-out.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradingStatus {
    pub enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disabled_by: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub since: DateTime<Utc>,
}

impl Default for TradingStatus {
    fn default() -> Self {
        Self {
            enabled: false,
            disabled_by: None,
            reason: Some("not yet enabled".to_string()),
            since: Utc::now(),
        }
    }
}

// =============================================================================
// Broker-derived records
// =============================================================================

/// A broker-reported position. Derived, not authoritative.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerPosition {
    pub symbol: String,
    pub qty: Money,
    pub avg_entry_price: Money,
}

/// Broker account snapshot, overwritten every tick.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountSnapshot {
    pub equity: Money,
    pub cash: Money,
    pub buying_power: Money,
    #[serde(default)]
    pub positions: Vec<BrokerPosition>,
    pub as_of: DateTime<Utc>,
}

impl AccountSnapshot {
    /// Market value currently allocated to `symbol`, from broker positions.
    pub fn symbol_exposure(&self, symbol: &str, mark: Money) -> Result<Money, MoneyError> {
        let mut total = Money::ZERO;
        for p in self.positions.iter().filter(|p| p.symbol == symbol) {
            total = total.checked_add(p.qty.checked_mul(mark)?)?;
        }
        Ok(total)
    }
}

/// A top-of-book quote from the broker's data feed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Quote {
    pub symbol: String,
    pub bid: Money,
    pub ask: Money,
    pub last: Money,
    pub ts: DateTime<Utc>,
}

impl Quote {
    /// Synthetic fill price: the bid/ask midpoint.
    pub fn mid(&self) -> Result<Money, MoneyError> {
        self.bid
            .checked_add(self.ask)?
            .checked_div(Money::from_int(2), 4)
    }
}

// =============================================================================
// Shadow trades
// =============================================================================

/// Identity attribution attached to every recorded trade.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentProvenance {
    pub agent_id: String,
    pub nonce: String,
    pub session_id: String,
    pub cert_id: String,
    pub signature: String,
    pub signed_at: DateTime<Utc>,
}

/// A synthetic fill recorded by the shadow executor.
///
/// While `Open`, only `{current_price, current_pnl, pnl_percent,
/// last_updated}` may change. Once `Closed`, the record is immutable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShadowTrade {
    pub id: String,
    pub uid: String,
    pub symbol: String,
    pub side: Side,
    pub quantity: Money,
    pub entry_price: Money,
    pub current_price: Money,
    pub current_pnl: Money,
    pub pnl_percent: Money,
    pub status: TradeStatus,
    pub created_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
    pub reasoning: String,
    pub agent_provenance: AgentProvenance,
    pub allocation: Money,
}

// =============================================================================
// Market regime
// =============================================================================

/// Net gamma-exposure regime record, overwritten on each regime sync.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketRegime {
    pub symbol: String,
    pub net_gex: Money,
    pub call_gex: Money,
    pub put_gex: Money,
    pub regime: RegimeLabel,
    pub spot: Money,
    pub ts: DateTime<Utc>,
}

// =============================================================================
// Watchdog output
// =============================================================================

/// Append-only record of a detected anomaly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchdogEvent {
    pub id: String,
    pub anomaly_type: AnomalyType,
    pub severity: Severity,
    pub kill_switch_activated: bool,
    pub explanation: String,
    pub ts: DateTime<Utc>,
}

/// Append-only user-facing alert.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub id: String,
    #[serde(rename = "type")]
    pub alert_type: String,
    pub severity: Severity,
    pub title: String,
    pub message: String,
    pub read: bool,
    pub ts: DateTime<Utc>,
}

// =============================================================================
// Tick summary
// =============================================================================

/// Aggregate outcome of one heartbeat tick.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TickSummary {
    pub tick_id: String,
    pub success: u32,
    pub errors: u32,
    pub skipped: u32,
    pub duration_ms: u64,
    pub started_at: DateTime<Utc>,
}
