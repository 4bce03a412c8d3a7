use thiserror::Error;

/// Errors surfaced by the exchange client.
#[derive(Debug, Clone, Error)]
pub enum ExchangeError {
    #[error("request timed out after {duration_ms}ms")]
    Timeout { duration_ms: u64 },

    #[error("rate limited: too many outstanding requests")]
    RateLimited,

    #[error("authentication required or expired")]
    AuthRequired,

    #[error("rejected by venue: code {code}, {message}")]
    Rejected { code: i64, message: String },

    #[error("transport failure (retryable: {retryable}): {reason}")]
    Transport { retryable: bool, reason: String },
}

impl ExchangeError {
    pub fn transport(reason: impl Into<String>) -> Self {
        Self::Transport {
            retryable: true,
            reason: reason.into(),
        }
    }

    /// Whether retrying the same request can succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout { .. } | Self::RateLimited => true,
            Self::AuthRequired => false,
            Self::Rejected { code, .. } => rejection_is_retryable(*code),
            Self::Transport { retryable, .. } => *retryable,
        }
    }

    /// Venue reports the instrument as de-listed or expired.
    pub fn is_expired_instrument(&self) -> bool {
        matches!(self, Self::Rejected { code, .. } if *code == CODE_EXPIRED_INSTRUMENT)
    }
}

/// Venue rejection code for an expired or de-listed instrument.
pub const CODE_EXPIRED_INSTRUMENT: i64 = 10_004;

/// Rejection codes that indicate a transient venue condition.
fn rejection_is_retryable(code: i64) -> bool {
    // 10_040-10_049: matching engine busy / temporary trading halt
    (10_040..10_050).contains(&code)
}

/// Errors from the portfolio store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("portfolio not found: {id}")]
    NotFound { id: String },

    #[error("portfolio already exists: {id}")]
    Conflict { id: String },

    #[error("storage io failure: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt portfolio snapshot: {reason}")]
    Corrupt { reason: String },
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::Corrupt {
            reason: err.to_string(),
        }
    }
}

/// Hedger-local failures. Contained to the hedger that raised them.
#[derive(Debug, Error)]
pub enum HedgeError {
    #[error("market data stale for {instrument}")]
    StaleMarket { instrument: String },

    #[error("no running hedger for portfolio {id}")]
    NotRunning { id: String },

    #[error("invariant violated: {0}")]
    InvariantViolation(String),

    #[error(transparent)]
    Exchange(#[from] ExchangeError),

    #[error(transparent)]
    Store(#[from] StoreError),
}
