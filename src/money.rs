// =============================================================================
// Money Kernel — exact fixed-precision arithmetic for prices, sizes and P&L
// =============================================================================
//
// Every monetary quantity in the core is a `Money`, a thin wrapper over a
// 96-bit decimal mantissa (28-29 significant digits). Binary floats are only
// permitted at the process boundary, where external JSON numbers are routed
// through their string form before parsing, so no binary representation ever
// participates in P&L or position-sizing math.
//
// Division always takes an explicit result scale and rounds half-to-even.
// Division by zero and overflow both surface as `ArithmeticOverflow`.
// =============================================================================

use std::fmt;
use std::str::FromStr;

use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failure modes of the money kernel.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MoneyError {
    /// Overflow, underflow, or division by zero.
    #[error("arithmetic overflow")]
    ArithmeticOverflow,

    /// The input string is not a valid decimal number.
    #[error("unparseable decimal: {0:?}")]
    Unparseable(String),
}

/// Exact fixed-precision monetary value.
///
/// Serialises as a string so the scale survives a JSON round trip
/// (`"448.00"` stays `"448.00"`, not `448`).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
pub struct Money(#[serde(with = "rust_decimal::serde::str")] Decimal);

impl Money {
    pub const ZERO: Money = Money(Decimal::ZERO);
    pub const ONE: Money = Money(Decimal::ONE);
    pub const ONE_HUNDRED: Money = Money(Decimal::ONE_HUNDRED);

    /// Wrap a raw decimal.
    pub fn new(inner: Decimal) -> Self {
        Self(inner)
    }

    /// Parse from a string representation. This is the only sanctioned entry
    /// point for external numeric data.
    pub fn parse_str(s: &str) -> Result<Self, MoneyError> {
        Decimal::from_str(s.trim())
            .map(Money)
            .map_err(|_| MoneyError::Unparseable(s.to_string()))
    }

    /// Construct from an integer quantity.
    pub fn from_int(v: i64) -> Self {
        Self(Decimal::from(v))
    }

    pub fn inner(&self) -> Decimal {
        self.0
    }

    // ── Checked arithmetic ──────────────────────────────────────────────

    pub fn checked_add(self, rhs: Money) -> Result<Money, MoneyError> {
        self.0
            .checked_add(rhs.0)
            .map(Money)
            .ok_or(MoneyError::ArithmeticOverflow)
    }

    pub fn checked_sub(self, rhs: Money) -> Result<Money, MoneyError> {
        self.0
            .checked_sub(rhs.0)
            .map(Money)
            .ok_or(MoneyError::ArithmeticOverflow)
    }

    pub fn checked_mul(self, rhs: Money) -> Result<Money, MoneyError> {
        self.0
            .checked_mul(rhs.0)
            .map(Money)
            .ok_or(MoneyError::ArithmeticOverflow)
    }

    /// Divide and round the result to `scale` fractional digits, half-to-even.
    ///
    /// Division by zero reports `ArithmeticOverflow`, matching the contract
    /// that downstream components have exactly one arithmetic failure mode.
    pub fn checked_div(self, rhs: Money, scale: u32) -> Result<Money, MoneyError> {
        if rhs.0.is_zero() {
            return Err(MoneyError::ArithmeticOverflow);
        }
        self.0
            .checked_div(rhs.0)
            .map(|d| Money(d.round_dp_with_strategy(scale, RoundingStrategy::MidpointNearestEven)))
            .ok_or(MoneyError::ArithmeticOverflow)
    }

    // ── Sign / shape helpers ────────────────────────────────────────────

    pub fn abs(self) -> Money {
        Money(self.0.abs())
    }

    pub fn neg(self) -> Money {
        Money(-self.0)
    }

    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }

    pub fn is_negative(&self) -> bool {
        self.0.is_sign_negative() && !self.0.is_zero()
    }

    pub fn is_positive(&self) -> bool {
        !self.0.is_sign_negative() && !self.0.is_zero()
    }

    /// Round to `scale` fractional digits, half-to-even.
    pub fn round_dp(self, scale: u32) -> Money {
        Money(
            self.0
                .round_dp_with_strategy(scale, RoundingStrategy::MidpointNearestEven),
        )
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Money {
    type Err = MoneyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Money::parse_str(s)
    }
}

/// Extract a `Money` from a JSON value that may carry the number either as a
/// string (`"447.98"`) or as a raw JSON number.
///
/// Raw numbers are routed through their decimal text form, never through an
/// `f64`, so binary drift cannot enter.
pub fn money_from_json(v: &serde_json::Value) -> Result<Money, MoneyError> {
    match v {
        serde_json::Value::String(s) => Money::parse_str(s),
        serde_json::Value::Number(n) => Money::parse_str(&n.to_string()),
        other => Err(MoneyError::Unparseable(other.to_string())),
    }
}
