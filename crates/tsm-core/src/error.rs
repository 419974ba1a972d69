//! Error types for threshold key management and signing

use crate::PlayerId;
use thiserror::Error;

/// Result type alias for threshold signing operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while coordinating participants
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid deployment or call configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Threshold requirements not met
    #[error("Threshold not met: required {required}, got {actual}")]
    ThresholdNotMet { required: usize, actual: usize },

    /// Player id not part of the deployment
    #[error("Invalid player ID: {0}")]
    InvalidPlayerId(PlayerId),

    /// Player id listed more than once
    #[error("Duplicate player ID: {0}")]
    DuplicatePlayer(PlayerId),

    /// Participants disagree on a key id or derived public key
    #[error("Key consistency error: {0}")]
    KeyConsistency(String),

    /// A participant failed during a fan-out round
    #[error("Player {player} failed during {operation}: {source}")]
    Participant {
        player: PlayerId,
        operation: &'static str,
        #[source]
        source: Box<Error>,
    },

    /// A signing attempt failed; retry with a fresh session
    #[error("Partial signing failed: {source}")]
    PartialSignFailure {
        #[source]
        source: Box<Error>,
    },

    /// Transport or remote error reported by a participant endpoint
    #[error("Endpoint error: {0}")]
    Endpoint(String),

    /// Message verification failed
    #[error("Message verification failed: {0}")]
    VerificationFailed(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Deserialization error
    #[error("Deserialization error: {0}")]
    Deserialization(String),

    /// Cryptographic operation failed
    #[error("Cryptographic error: {0}")]
    Crypto(String),

    /// Relay error
    #[error("Relay error: {0}")]
    Relay(String),

    /// Timeout waiting for participants or messages
    #[error("Timeout waiting for {0}")]
    Timeout(String),

    /// Unknown key id
    #[error("Key not found: {0}")]
    KeyNotFound(String),

    /// Combined signature does not verify against the expected key
    #[error("Invalid signature")]
    InvalidSignature,

    /// Key derivation error
    #[error("Key derivation error: {0}")]
    Derivation(String),

    /// The operating system random source is unavailable
    #[error("Random source unavailable: {0}")]
    Randomness(String),

    /// Key id persistence failed
    #[error("Key store error: {0}")]
    KeyStore(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether the whole operation may be retried with a fresh session.
    ///
    /// Consistency and configuration errors are never retryable: they mean
    /// participants disagree or the deployment is wrong.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::PartialSignFailure { .. }
            | Error::Timeout(_)
            | Error::Endpoint(_)
            | Error::Relay(_) => true,
            Error::Participant { source, .. } => source.is_retryable(),
            _ => false,
        }
    }

    pub(crate) fn participant(player: PlayerId, operation: &'static str, source: Error) -> Self {
        Error::Participant {
            player,
            operation,
            source: Box::new(source),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        let partial = Error::PartialSignFailure {
            source: Box::new(Error::Timeout("player 1".into())),
        };
        assert!(partial.is_retryable());
        assert!(Error::participant(1, "sign", Error::Endpoint("reset".into())).is_retryable());

        assert!(!Error::KeyConsistency("ids differ".into()).is_retryable());
        assert!(!Error::DuplicatePlayer(0).is_retryable());
        assert!(!Error::participant(2, "keygen", Error::InvalidConfig("x".into())).is_retryable());
    }
}
