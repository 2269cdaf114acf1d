// =============================================================================
// Options market-data client — option chains with Greeks and open interest
// =============================================================================

use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::errors::CoreResult;
use crate::money::Money;

/// Call or put.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OptionRight {
    #[serde(rename = "C")]
    Call,
    #[serde(rename = "P")]
    Put,
}

/// One strike row of an option chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptionContract {
    pub strike: Money,
    pub right: OptionRight,
    pub expiry: NaiveDate,
    /// Open interest, contracts.
    pub oi: u64,
    pub gamma: Money,
    pub iv: Money,
    pub last: Money,
}

/// Provider of option chains for the regime engine.
#[async_trait]
pub trait OptionsDataClient: Send + Sync {
    /// The chain for `symbol` restricted to the given expiries.
    async fn option_chain(
        &self,
        symbol: &str,
        expiries: &[NaiveDate],
    ) -> CoreResult<Vec<OptionContract>>;
}

/// Fixed-chain client used when no market-data vendor is configured.
///
/// Serves a small symmetric chain around a reference spot so the regime
/// engine has something to chew on in offline runs.
pub struct StaticOptionsClient {
    contracts: Vec<OptionContract>,
}

impl StaticOptionsClient {
    pub fn new(contracts: Vec<OptionContract>) -> Self {
        Self { contracts }
    }

    /// A symmetric chain around `spot` with uniform gamma and open interest.
    pub fn symmetric(spot: Money, expiry: NaiveDate) -> Self {
        let gamma = Money::parse_str("0.02").expect("literal");
        let iv = Money::parse_str("0.18").expect("literal");
        let mut contracts = Vec::new();
        for offset in -2i64..=2 {
            let strike = spot
                .checked_add(Money::from_int(offset))
                .expect("small offsets never overflow");
            for right in [OptionRight::Call, OptionRight::Put] {
                contracts.push(OptionContract {
                    strike,
                    right,
                    expiry,
                    oi: 1000,
                    gamma,
                    iv,
                    last: Money::parse_str("1.50").expect("literal"),
                });
            }
        }
        Self { contracts }
    }
}

#[async_trait]
impl OptionsDataClient for StaticOptionsClient {
    async fn option_chain(
        &self,
        _symbol: &str,
        expiries: &[NaiveDate],
    ) -> CoreResult<Vec<OptionContract>> {
        Ok(self
            .contracts
            .iter()
            .filter(|c| expiries.contains(&c.expiry))
            .cloned()
            .collect())
    }
}
