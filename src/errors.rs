// =============================================================================
// Error taxonomy — structured result values at every unit boundary
// =============================================================================
//
// Every fallible path in the core returns a `CoreError` kind rather than
// bubbling ad-hoc strings. Errors are caught at the per-user boundary in the
// heartbeat scheduler and at the per-trade boundary in the materializer; they
// never cross tenant or user boundaries.
//
// Only two conditions are process-fatal: a safety-config violation at startup
// and loss of persistence connectivity past the configured tick window.
// =============================================================================

use thiserror::Error;

use crate::money::MoneyError;

/// A security violation detected while verifying a signed signal.
///
/// These are never retried: the signal is dropped and the violation is
/// written to the security log.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SecurityViolation {
    /// The signing agent is not present in the identity registry.
    #[error("unknown agent: {0}")]
    UnknownAgent(String),

    /// The detached signature does not verify against the canonical payload.
    #[error("bad signature from agent {0}")]
    BadSignature(String),

    /// The signature nonce has already been consumed in this process.
    #[error("replayed nonce {nonce} from agent {agent_id}")]
    ReplayedNonce { agent_id: String, nonce: String },
}

impl SecurityViolation {
    /// Short machine-readable tag used in security-log documents.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::UnknownAgent(_) => "unknown_agent",
            Self::BadSignature(_) => "bad_signature",
            Self::ReplayedNonce { .. } => "replayed_nonce",
        }
    }
}

/// The core error taxonomy.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Bad inputs from the broker or persistence; the unit records and
    /// continues.
    #[error("validation: {0}")]
    Validation(String),

    /// Network blips and other retryable I/O failures.
    #[error("transient i/o: {0}")]
    Transient(String),

    /// Safety-configuration violation (e.g. non-paper broker host). Fatal.
    #[error("safety config: {0}")]
    Safety(String),

    /// A hard invariant was broken (cross-tenant write, mutation of a
    /// CLOSED trade). The offending unit aborts; the process stays alive.
    #[error("invariant violation: {0}")]
    Invariant(String),

    /// Cooperative deadline expiry.
    #[error("timeout: {0}")]
    Timeout(String),

    /// Signature/nonce failure; the signal is dropped.
    #[error("security violation: {0}")]
    Security(#[from] SecurityViolation),

    /// Decimal arithmetic failure (overflow, division by zero).
    #[error("arithmetic: {0}")]
    Arithmetic(#[from] MoneyError),

    /// Persistence-layer failure.
    #[error("store: {0}")]
    Store(String),
}

impl CoreError {
    /// Short tag for structured logging and per-unit error records.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::Transient(_) => "transient",
            Self::Safety(_) => "safety",
            Self::Invariant(_) => "invariant",
            Self::Timeout(_) => "timeout",
            Self::Security(_) => "security",
            Self::Arithmetic(_) => "arithmetic",
            Self::Store(_) => "store",
        }
    }

    /// Whether a retry inside a client could plausibly succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// Convenience alias used throughout the core.
pub type CoreResult<T> = Result<T, CoreError>;
