// =============================================================================
// Core Configuration — env-driven settings with safe defaults
// =============================================================================
//
// Every tunable the control plane consumes lives here. Values come from the
// host environment (see `from_env`); anything unset falls back to the
// defaults below. The broker base URL is safety-checked: the core refuses to
// start against anything but a paper host.
// =============================================================================

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::errors::{CoreError, CoreResult};
use crate::money::Money;

/// Process exit code for a safety-config violation at startup.
pub const EXIT_SAFETY_CONFIG: i32 = 78;

fn default_broker_base_url() -> String {
    "https://paper-api.alpaca.markets".to_string()
}

fn default_tick_seconds() -> u64 {
    60
}

fn default_writes_per_sec() -> u32 {
    500
}

fn default_write_burst() -> u32 {
    50
}

fn default_consensus_threshold() -> f64 {
    0.7
}

fn default_systemic_sell_threshold() -> usize {
    3
}

fn default_sharpe_reduce() -> f64 {
    1.0
}

fn default_sharpe_shadow() -> f64 {
    0.5
}

fn default_regime_symbol() -> String {
    "SPY".to_string()
}

fn default_money(s: &str) -> Money {
    Money::parse_str(s).expect("literal default must parse")
}

/// Top-level configuration for the Maestro core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreConfig {
    // ── Broker ──────────────────────────────────────────────────────────
    /// Paper broker REST base URL. A live host here is a fatal startup error.
    #[serde(default = "default_broker_base_url")]
    pub broker_base_url: String,
    #[serde(skip_serializing, default)]
    pub broker_key_id: String,
    #[serde(skip_serializing, default)]
    pub broker_secret_key: String,

    /// Document-store project identifier (opaque to the core).
    pub datastore_project_id: String,

    // ── Scheduling ──────────────────────────────────────────────────────
    #[serde(default = "default_tick_seconds")]
    pub tick_seconds: u64,
    /// Whole-tick cooperative deadline, seconds.
    pub tick_deadline_secs: u64,
    /// Per-user unit deadline, seconds.
    pub unit_deadline_secs: u64,
    /// Regime sync cadence, seconds.
    pub regime_sync_secs: u64,
    /// Bounded fan-out across `{tenant, user}` units.
    pub user_fanout: usize,
    /// Consecutive failed ticks tolerated before the process exits so the
    /// supervisor can restart it.
    pub persistence_outage_fatal_ticks: u32,

    // ── Write limiter ───────────────────────────────────────────────────
    #[serde(default = "default_writes_per_sec")]
    pub rate_limit_writes_per_sec: u32,
    #[serde(default = "default_write_burst")]
    pub rate_limit_burst: u32,

    // ── Consensus / orchestration ───────────────────────────────────────
    #[serde(default = "default_consensus_threshold")]
    pub consensus_threshold: f64,
    #[serde(default = "default_systemic_sell_threshold")]
    pub systemic_sell_threshold: usize,
    #[serde(default = "default_sharpe_reduce")]
    pub sharpe_reduce: f64,
    #[serde(default = "default_sharpe_shadow")]
    pub sharpe_shadow: f64,
    /// Minimum populated daily points before a Sharpe is reported.
    pub sharpe_min_days: usize,

    // ── Risk guards ─────────────────────────────────────────────────────
    /// Daily loss fraction that coerces signals to HOLD (0.02 = 2 %).
    pub daily_loss_limit: Money,
    /// Ambient volatility index level above which allocation is halved.
    pub volatility_threshold: Money,
    /// Maximum single-symbol weight of NAV (0.20 = 20 %).
    pub max_concentration: Money,

    // ── Regime engine ───────────────────────────────────────────────────
    #[serde(default = "default_regime_symbol")]
    pub regime_symbol: String,
    /// Net-GEX magnitude below which the regime is NEUTRAL.
    pub regime_epsilon: Money,

    // ── Watchdog ────────────────────────────────────────────────────────
    /// Consecutive losing trades that define a streak.
    pub watchdog_streak_len: usize,
    /// Absolute dollar loss a streak must reach before tripping.
    pub watchdog_streak_dollars: Money,
    /// Equity drawdown fraction inside the window that trips the switch.
    pub watchdog_drawdown_limit: Money,
    /// Fills against the prevailing gamma regime (BUYs under SHORT_GAMMA,
    /// SELLs under LONG_GAMMA) before a mismatch event.
    pub watchdog_mismatch_fills: usize,
    /// Lookback window, minutes.
    pub watchdog_window_mins: i64,

    // ── Whale flow ──────────────────────────────────────────────────────
    /// Bullish/bearish count margin at or under which sentiment is MIXED.
    pub whale_mixed_margin: i64,

    // ── LLM ─────────────────────────────────────────────────────────────
    /// Advisory-text deadline, milliseconds.
    pub llm_deadline_ms: u64,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            broker_base_url: default_broker_base_url(),
            broker_key_id: String::new(),
            broker_secret_key: String::new(),
            datastore_project_id: "local".to_string(),
            tick_seconds: default_tick_seconds(),
            tick_deadline_secs: 45,
            unit_deadline_secs: 10,
            regime_sync_secs: 300,
            user_fanout: 16,
            persistence_outage_fatal_ticks: 5,
            rate_limit_writes_per_sec: default_writes_per_sec(),
            rate_limit_burst: default_write_burst(),
            consensus_threshold: default_consensus_threshold(),
            systemic_sell_threshold: default_systemic_sell_threshold(),
            sharpe_reduce: default_sharpe_reduce(),
            sharpe_shadow: default_sharpe_shadow(),
            sharpe_min_days: 5,
            daily_loss_limit: default_money("0.02"),
            volatility_threshold: default_money("30"),
            max_concentration: default_money("0.20"),
            regime_symbol: default_regime_symbol(),
            regime_epsilon: default_money("1000000"),
            watchdog_streak_len: 5,
            watchdog_streak_dollars: default_money("500"),
            watchdog_drawdown_limit: default_money("0.05"),
            watchdog_mismatch_fills: 3,
            watchdog_window_mins: 10,
            whale_mixed_margin: 1,
            llm_deadline_ms: 2000,
        }
    }
}

impl CoreConfig {
    /// Build the configuration from the host environment, falling back to
    /// defaults for anything unset or unparseable.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Ok(v) = std::env::var("BROKER_PAPER_BASE_URL") {
            cfg.broker_base_url = v;
        }
        cfg.broker_key_id = std::env::var("BROKER_KEY_ID").unwrap_or_default();
        cfg.broker_secret_key = std::env::var("BROKER_SECRET_KEY").unwrap_or_default();
        if let Ok(v) = std::env::var("DATASTORE_PROJECT_ID") {
            cfg.datastore_project_id = v;
        }

        cfg.tick_seconds = env_parsed("SCHEDULER_TICK_SECONDS", cfg.tick_seconds);
        cfg.rate_limit_writes_per_sec =
            env_parsed("RATE_LIMIT_WRITES_PER_SEC", cfg.rate_limit_writes_per_sec);
        cfg.consensus_threshold = env_parsed("CONSENSUS_THRESHOLD", cfg.consensus_threshold);
        cfg.systemic_sell_threshold =
            env_parsed("SYSTEMIC_SELL_THRESHOLD", cfg.systemic_sell_threshold);
        cfg.sharpe_reduce = env_parsed("SHARPE_REDUCE", cfg.sharpe_reduce);
        cfg.sharpe_shadow = env_parsed("SHARPE_SHADOW", cfg.sharpe_shadow);

        info!(
            tick_seconds = cfg.tick_seconds,
            writes_per_sec = cfg.rate_limit_writes_per_sec,
            consensus_threshold = cfg.consensus_threshold,
            systemic_sell_threshold = cfg.systemic_sell_threshold,
            "core configuration resolved from environment"
        );

        cfg
    }

    /// Refuse a process-level broker base URL whose host is not a paper
    /// host.
    ///
    /// Called once at startup, before any client is constructed; a violation
    /// terminates the process with [`EXIT_SAFETY_CONFIG`].
    pub fn ensure_paper_host(&self) -> CoreResult<()> {
        ensure_paper_host(&self.broker_base_url)
    }
}

/// Refuse any broker base URL whose host is not a paper host. Applied to
/// the process-level URL at startup and to every per-user credential URL
/// before a client is built from it.
pub fn ensure_paper_host(url: &str) -> CoreResult<()> {
    let host = url
        .trim_start_matches("https://")
        .trim_start_matches("http://")
        .split('/')
        .next()
        .unwrap_or_default()
        .to_ascii_lowercase();

    if host.is_empty() {
        return Err(CoreError::Safety("broker base URL is empty".to_string()));
    }

    if !host.contains("paper") {
        return Err(CoreError::Safety(format!(
            "broker URL resolves to non-paper host {host:?}; live trading is disabled"
        )));
    }

    Ok(())
}

/// Parse an env var, keeping `fallback` (with a warning) when unset or bad.
fn env_parsed<T: std::str::FromStr + Copy>(key: &str, fallback: T) -> T {
    match std::env::var(key) {
        Ok(raw) => match raw.trim().parse() {
            Ok(v) => v,
            Err(_) => {
                warn!(key, value = %raw, "unparseable env var, keeping default");
                fallback
            }
        },
        Err(_) => fallback,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_contract() {
        let cfg = CoreConfig::default();
        assert_eq!(cfg.tick_seconds, 60);
        assert_eq!(cfg.rate_limit_writes_per_sec, 500);
        assert!((cfg.consensus_threshold - 0.7).abs() < f64::EPSILON);
        assert_eq!(cfg.systemic_sell_threshold, 3);
        assert_eq!(cfg.tick_deadline_secs, 45);
        assert_eq!(cfg.unit_deadline_secs, 10);
        assert_eq!(cfg.persistence_outage_fatal_ticks, 5);
        assert_eq!(cfg.sharpe_min_days, 5);
        assert_eq!(cfg.watchdog_streak_len, 5);
        assert_eq!(cfg.llm_deadline_ms, 2000);
    }

    #[test]
    fn paper_host_accepted() {
        let cfg = CoreConfig {
            broker_base_url: "https://paper-api.alpaca.markets".into(),
            ..CoreConfig::default()
        };
        assert!(cfg.ensure_paper_host().is_ok());
    }

    #[test]
    fn live_host_rejected() {
        let cfg = CoreConfig {
            broker_base_url: "https://api.alpaca.markets".into(),
            ..CoreConfig::default()
        };
        let err = cfg.ensure_paper_host().unwrap_err();
        assert_eq!(err.kind(), "safety");
    }

    #[test]
    fn empty_url_rejected() {
        let cfg = CoreConfig {
            broker_base_url: String::new(),
            ..CoreConfig::default()
        };
        assert!(cfg.ensure_paper_host().is_err());
    }

    #[test]
    fn secrets_never_serialised() {
        let cfg = CoreConfig {
            broker_key_id: "AKIDEXAMPLE".into(),
            broker_secret_key: "s3cr3t".into(),
            ..CoreConfig::default()
        };
        let json = serde_json::to_string(&cfg).unwrap();
        assert!(!json.contains("AKIDEXAMPLE"));
        assert!(!json.contains("s3cr3t"));
    }
}
