//! Error types for the staking flow

use ethers_core::types::{Address, H256};
use thiserror::Error;

/// Result type alias for staking operations
pub type Result<T> = std::result::Result<T, StakeError>;

/// Errors that can occur while staking
#[derive(Debug, Error)]
pub enum StakeError {
    /// Invalid deployment configuration or CLI input
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Staking API answered with a non-success status
    #[error("Staking API returned {status}: {body}")]
    Api { status: u16, body: String },

    /// Chain RPC reported an error
    #[error("RPC error: {0}")]
    Rpc(String),

    /// Transport failure talking to the staking API or the chain
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Key management or threshold signing failed
    #[error("Threshold signing error: {0}")]
    Signing(#[from] tsm_core::Error),

    /// A response could not be interpreted
    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    /// Amount arithmetic overflowed
    #[error("Amount overflow: {0}")]
    Overflow(String),

    /// Signature does not recover the sending address; nothing was broadcast
    #[error("Signature recovers {recovered:?}, expected {expected:?}")]
    SignatureMismatch { expected: Address, recovered: Address },

    /// Transaction was mined but reverted
    #[error("Transaction {0:?} was rejected")]
    Rejected(H256),

    /// Gave up waiting
    #[error("Timeout waiting for {0}")]
    Timeout(String),

    /// JSON encoding error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl StakeError {
    /// Whether the run may be repeated as-is
    pub fn is_retryable(&self) -> bool {
        match self {
            StakeError::Http(_) | StakeError::Timeout(_) => true,
            StakeError::Api { status, .. } => *status >= 500,
            StakeError::Signing(e) => e.is_retryable(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable() {
        assert!(StakeError::Api {
            status: 503,
            body: String::new()
        }
        .is_retryable());
        assert!(!StakeError::Api {
            status: 400,
            body: String::new()
        }
        .is_retryable());
        assert!(StakeError::Signing(tsm_core::Error::PartialSignFailure {
            source: Box::new(tsm_core::Error::Timeout("player 1".into()))
        })
        .is_retryable());
        assert!(!StakeError::Signing(tsm_core::Error::KeyConsistency("x".into())).is_retryable());
        assert!(!StakeError::SignatureMismatch {
            expected: Address::zero(),
            recovered: Address::repeat_byte(1),
        }
        .is_retryable());
    }
}
