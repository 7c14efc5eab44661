//! Error types for the rental market maker

use thiserror::Error;

/// Main error type for the market maker
#[derive(Error, Debug)]
pub enum MarketError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Tracking store error: {0}")]
    Store(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Chain connection error: {0}")]
    ChainConnection(String),

    #[error("{what} not found")]
    NotFound { what: String },

    #[error("Contract error: {0}")]
    Contract(String),

    #[error("Transaction error: {0}")]
    Transaction(String),

    #[error("Transaction {tx_hash} reverted")]
    Reverted { tx_hash: String },

    #[error("No receipt available for transaction {tx_hash}")]
    ReceiptMissing { tx_hash: String },

    #[error("Gas estimation error: {0}")]
    GasEstimation(String),

    #[error("Event parsing error: {0}")]
    EventParsing(String),

    #[error("Wallet error: {0}")]
    Wallet(String),

    #[error("Timeout waiting for {operation}")]
    Timeout { operation: String },

    #[error("Loan index error: {0}")]
    Index(#[from] reqwest::Error),

    #[error("Ledger unhealthy: {0}")]
    Unhealthy(String),
}

impl MarketError {
    /// Build a `NotFound` error for the described entity
    pub fn not_found(what: impl Into<String>) -> Self {
        MarketError::NotFound { what: what.into() }
    }

    /// Check if error is a transient node/RPC condition
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            MarketError::ChainConnection(_) | MarketError::Timeout { .. }
        )
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, MarketError::Timeout { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, MarketError::NotFound { .. })
    }

    /// Classify a raw provider error message.
    ///
    /// Node timeouts, dropped connections and rate limiting are transient;
    /// everything else (reverts, bad params, insufficient funds) is attributed
    /// to the contract or the transaction itself.
    pub fn from_provider(context: &str, message: impl Into<String>) -> Self {
        let message = message.into();
        let lower = message.to_lowercase();

        if lower.contains("revert") {
            MarketError::Contract(format!("{}: {}", context, message))
        } else if lower.contains("timed out")
            || lower.contains("timeout")
            || lower.contains("connection")
            || lower.contains("429")
            || lower.contains("rate limit")
            || lower.contains("too many requests")
        {
            MarketError::ChainConnection(format!("{}: {}", context, message))
        } else {
            MarketError::Transaction(format!("{}: {}", context, message))
        }
    }
}

/// Result type for market maker operations
pub type MarketResult<T> = Result<T, MarketError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_error_classification() {
        assert!(MarketError::from_provider("call", "request timed out").is_retryable());
        assert!(MarketError::from_provider("call", "HTTP 429 Too Many Requests").is_retryable());
        assert!(matches!(
            MarketError::from_provider("call", "execution reverted: not owner"),
            MarketError::Contract(_)
        ));
        assert!(!MarketError::from_provider("send", "insufficient funds for gas").is_retryable());
    }
}
