//! Error types for the custody assistant

use alloy::primitives::Address;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Rate limit exceeded, retry in {retry_after_ms} ms")]
    RateLimitExceeded { retry_after_ms: u64 },

    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    #[error(
        "Insufficient balance: available {available:.6}, required {required:.6}. \
         Top up {shortfall:.6} to {top_up_address}"
    )]
    InsufficientBalance {
        available: f64,
        required: f64,
        shortfall: f64,
        top_up_address: Address,
    },

    #[error("No liquidity for this swap (quote returned zero output)")]
    NoLiquidity,

    #[error("Price impact {price_impact:.2}% exceeds maximum {max:.2}%")]
    SlippageTooHigh { price_impact: f64, max: f64 },

    #[error("Slippage {requested:.2}% outside allowed range [{min:.2}%, {max:.2}%]")]
    InvalidSlippage { requested: f64, min: f64, max: f64 },

    #[error("Network error: {0}")]
    Network(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("No wallet key stored for user {0}")]
    KeyNotFound(i64),

    #[error("User {0} already has a wallet")]
    WalletExists(i64),

    #[error("Export blocked: {reason} (${blocking_value_usd:.2} not controlled by this key)")]
    SafetyBlocked {
        blocking_value_usd: f64,
        reason: String,
    },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Wallet error: {0}")]
    Wallet(String),

    #[error("Encryption error: {0}")]
    Crypto(String),

    #[error("Chain read failed: {0}")]
    Chain(String),

    #[error("Quote provider error: {0}")]
    Quote(String),

    #[error("Transaction submission failed: {0}")]
    Submission(String),

    #[error("Invalid state transition: {0}")]
    InvalidTransition(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

impl Error {
    /// Transient failures the caller may retry unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::RateLimitExceeded { .. }
                | Error::Network(_)
                | Error::Timeout(_)
                | Error::Chain(_)
                | Error::Submission(_)
        )
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Error::Timeout(e.to_string())
        } else {
            Error::Network(e.to_string())
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
