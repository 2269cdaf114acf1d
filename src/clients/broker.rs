// =============================================================================
// Paper Broker REST Client — account snapshots and quotes
// =============================================================================
//
// SECURITY: credentials travel as request headers and are never logged or
// serialised. The base URL is validated at startup to be a paper host; this
// client has no order-placement surface at all.
//
// All numeric fields arrive as strings (or JSON numbers routed through their
// text form) and are parsed straight into `Money`.
// =============================================================================

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;
use reqwest::header::{HeaderMap, HeaderValue};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::errors::{CoreError, CoreResult};
use crate::money::money_from_json;
use crate::types::{AccountSnapshot, BrokerPosition, Quote};

/// Retry budget for transient failures, capped by the unit deadline upstream.
const MAX_ATTEMPTS: u32 = 3;
/// Base backoff between attempts, milliseconds.
const BACKOFF_BASE_MS: u64 = 200;

/// Read-side broker operations the core consumes.
#[async_trait]
pub trait BrokerClient: Send + Sync + std::fmt::Debug {
    async fn get_account(&self) -> CoreResult<AccountSnapshot>;
    async fn get_quote(&self, symbol: &str) -> CoreResult<Quote>;
}

/// Non-secret half of a user's broker credentials, stored at
/// `users/{uid}/config/alpaca`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlpacaConfig {
    pub key_id: String,
    /// Per-user base URL override. Must still be a paper host.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
}

/// Secret half, stored at `users/{uid}/secrets/alpaca`. Never logged and
/// never re-persisted by the core.
#[derive(Clone, Deserialize)]
pub struct AlpacaSecrets {
    pub secret_key: String,
}

impl std::fmt::Debug for AlpacaSecrets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlpacaSecrets")
            .field("secret_key", &"<redacted>")
            .finish()
    }
}

/// REST client against the paper broker host.
#[derive(Clone)]
pub struct PaperBrokerClient {
    base_url: String,
    client: reqwest::Client,
}

impl PaperBrokerClient {
    /// Create a new client.
    ///
    /// # Arguments
    /// * `base_url` — paper host, already safety-checked by the config layer.
    /// * `key_id` / `secret_key` — credentials, sent as headers only.
    pub fn new(base_url: impl Into<String>, key_id: &str, secret_key: &str) -> Self {
        let mut default_headers = HeaderMap::new();
        if let Ok(val) = HeaderValue::from_str(key_id) {
            default_headers.insert("APCA-API-KEY-ID", val);
        }
        if let Ok(val) = HeaderValue::from_str(secret_key) {
            default_headers.insert("APCA-API-SECRET-KEY", val);
        }

        let client = reqwest::Client::builder()
            .default_headers(default_headers)
            .timeout(Duration::from_secs(5))
            .build()
            .expect("failed to build reqwest client");

        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
        }
    }

    /// GET a JSON document with jittered exponential backoff on transient
    /// failures (max [`MAX_ATTEMPTS`]).
    async fn get_json(&self, path: &str) -> CoreResult<Value> {
        let url = format!("{}{}", self.base_url, path);
        let mut attempt = 0;

        loop {
            attempt += 1;
            match self.try_get(&url).await {
                Ok(v) => return Ok(v),
                Err(e) if e.is_transient() && attempt < MAX_ATTEMPTS => {
                    let backoff = BACKOFF_BASE_MS * 2u64.pow(attempt - 1);
                    let jitter = rand::thread_rng().gen_range(0..=backoff / 2);
                    warn!(
                        url = %url,
                        attempt,
                        backoff_ms = backoff + jitter,
                        error = %e,
                        "transient broker error, retrying"
                    );
                    tokio::time::sleep(Duration::from_millis(backoff + jitter)).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn try_get(&self, url: &str) -> CoreResult<Value> {
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| CoreError::Transient(format!("broker request failed: {e}")))?;

        let status = resp.status();
        let body: Value = resp
            .json()
            .await
            .map_err(|e| CoreError::Validation(format!("broker returned non-JSON: {e}")))?;

        if status.is_success() {
            Ok(body)
        } else if status.is_server_error() || status.as_u16() == 429 {
            Err(CoreError::Transient(format!(
                "broker returned {status}: {body}"
            )))
        } else {
            Err(CoreError::Validation(format!(
                "broker returned {status}: {body}"
            )))
        }
    }
}

#[async_trait]
impl BrokerClient for PaperBrokerClient {
    async fn get_account(&self) -> CoreResult<AccountSnapshot> {
        let account = self.get_json("/v2/account").await?;
        let positions = self.get_json("/v2/positions").await?;
        let snapshot = parse_account(&account, &positions)?;
        debug!(equity = %snapshot.equity, positions = snapshot.positions.len(), "account snapshot fetched");
        Ok(snapshot)
    }

    async fn get_quote(&self, symbol: &str) -> CoreResult<Quote> {
        let doc = self.get_json(&format!("/v2/quotes/{symbol}")).await?;
        parse_quote(symbol, &doc)
    }
}

// =============================================================================
// Response parsing — strict schemas, validated on read
// =============================================================================

/// Parse `/v2/account` + `/v2/positions` payloads into a snapshot.
pub fn parse_account(account: &Value, positions: &Value) -> CoreResult<AccountSnapshot> {
    let field = |name: &str| -> CoreResult<_> {
        let v = account
            .get(name)
            .ok_or_else(|| CoreError::Validation(format!("account missing field {name:?}")))?;
        money_from_json(v).map_err(|e| CoreError::Validation(format!("account.{name}: {e}")))
    };

    let mut parsed_positions = Vec::new();
    if let Some(rows) = positions.as_array() {
        for row in rows {
            let symbol = row
                .get("symbol")
                .and_then(|v| v.as_str())
                .ok_or_else(|| CoreError::Validation("position missing symbol".into()))?;
            let qty = row
                .get("qty")
                .ok_or_else(|| CoreError::Validation("position missing qty".into()))
                .and_then(|v| {
                    money_from_json(v)
                        .map_err(|e| CoreError::Validation(format!("position.qty: {e}")))
                })?;
            let avg_entry_price = row
                .get("avg_entry_price")
                .ok_or_else(|| CoreError::Validation("position missing avg_entry_price".into()))
                .and_then(|v| {
                    money_from_json(v)
                        .map_err(|e| CoreError::Validation(format!("position.avg_entry_price: {e}")))
                })?;
            parsed_positions.push(BrokerPosition {
                symbol: symbol.to_string(),
                qty,
                avg_entry_price,
            });
        }
    }

    Ok(AccountSnapshot {
        equity: field("equity")?,
        cash: field("cash")?,
        buying_power: field("buying_power")?,
        positions: parsed_positions,
        as_of: Utc::now(),
    })
}

/// Parse a `/v2/quotes/{symbol}` payload.
pub fn parse_quote(symbol: &str, doc: &Value) -> CoreResult<Quote> {
    let field = |name: &str| -> CoreResult<_> {
        let v = doc
            .get(name)
            .ok_or_else(|| CoreError::Validation(format!("quote missing field {name:?}")))?;
        money_from_json(v).map_err(|e| CoreError::Validation(format!("quote.{name}: {e}")))
    };

    let ts = doc
        .get("ts")
        .and_then(|v| v.as_str())
        .and_then(|s| s.parse::<DateTime<Utc>>().ok())
        .unwrap_or_else(Utc::now);

    Ok(Quote {
        symbol: symbol.to_string(),
        bid: field("bid")?,
        ask: field("ask")?,
        last: field("last")?,
        ts,
    })
}

impl std::fmt::Debug for PaperBrokerClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PaperBrokerClient")
            .field("base_url", &self.base_url)
            .finish()
    }
}
