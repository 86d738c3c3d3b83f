//! Error types for the nonce keeper

use ethers::types::Address;
use thiserror::Error;

/// Main error type for the keeper
#[derive(Error, Debug, Clone)]
pub enum KeeperError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Broadcast error: {0}")]
    Broadcast(String),

    /// Corrupted nonce input. Never retried.
    #[error("Invalid nonce for {address:?}: {message}")]
    InvalidNonce { address: Address, message: String },

    #[error("Transaction {id} has no hash")]
    MissingHash { id: u64 },

    #[error("Nonce conflict for {address:?}: requested {requested}, next is {expected}")]
    NonceConflict {
        address: Address,
        requested: u64,
        expected: u64,
    },

    #[error("Insufficient balance for {address:?}: have {have}, need {need}")]
    InsufficientBalance {
        address: Address,
        have: String,
        need: String,
    },

    #[error("Timeout waiting for {operation}")]
    Timeout { operation: String },

    #[error("Transaction {id} not found")]
    TransactionNotFound { id: u64 },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl KeeperError {
    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            KeeperError::Network(_) | KeeperError::Timeout { .. }
        )
    }

    /// Check if error indicates corrupted upstream data
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            KeeperError::InvalidNonce { .. } | KeeperError::MissingHash { .. }
        )
    }
}

/// Result type for keeper operations
pub type KeeperResult<T> = Result<T, KeeperError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let invalid = KeeperError::InvalidNonce {
            address: Address::zero(),
            message: "count overflows u64".to_string(),
        };
        assert!(invalid.is_fatal());
        assert!(!invalid.is_retryable());

        let timeout = KeeperError::Timeout {
            operation: "transaction count".to_string(),
        };
        assert!(timeout.is_retryable());
        assert!(!timeout.is_fatal());

        assert!(!KeeperError::Broadcast("boom".to_string()).is_retryable());
    }
}
