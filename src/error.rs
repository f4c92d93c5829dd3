use rust_decimal::Decimal;
use thiserror::Error;

/// Errors surfaced by a [`PriceFeed`](crate::execution::PriceFeed) poll
#[derive(Debug, Clone, Error, PartialEq)]
pub enum FeedError {
    #[error("network failure: {0}")]
    Network(String),

    #[error("invalid symbol: {0}")]
    InvalidSymbol(String),

    #[error("malformed feed response: {0}")]
    Malformed(String),
}

/// Errors surfaced by an [`Exchange`](crate::exchange::Exchange)
///
/// The variants are kept distinct so the executor can tell a transient
/// failure (retry) from a hard rejection (report) from a fatal one (pause).
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ExchangeError {
    #[error("insufficient balance: {0}")]
    InsufficientBalance(String),

    #[error("network failure: {0}")]
    Network(String),

    #[error("order rejected: {0}")]
    Rejected(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),
}

impl ExchangeError {
    /// Transient failures are worth another attempt
    pub fn is_transient(&self) -> bool {
        matches!(self, ExchangeError::Network(_))
    }
}

/// Crate-wide error taxonomy
#[derive(Debug, Error)]
pub enum BotError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("stale data: {0}")]
    Stale(String),

    #[error("network failure: {0}")]
    NetworkFailure(String),

    #[error("insufficient balance: required {required}, available {available}")]
    InsufficientBalance { required: Decimal, available: Decimal },

    #[error("rejected: {0}")]
    Rejected(String),

    #[error("timed out: {0}")]
    TimedOut(String),

    #[error("fatal: {0}")]
    Fatal(String),

    #[error("unauthorized command from {0}")]
    Unauthorized(String),

    #[error("bad command: {0}")]
    Command(String),

    #[error("feed error: {0}")]
    Feed(#[from] FeedError),

    #[error("exchange error: {0}")]
    Exchange(#[from] ExchangeError),

    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("persistence error: {0}")]
    Persistence(#[from] redis::RedisError),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}
