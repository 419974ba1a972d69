//! Node-to-node messages of the loopback protocol

use crate::PlayerId;
use serde::{Deserialize, Serialize};

/// Key generation round 1: commitment to the secret polynomial
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeygenCommitMessage {
    /// Sender player ID
    pub player_id: PlayerId,
    /// Commitments to polynomial coefficients (Feldman VSS)
    pub commitments: Vec<Vec<u8>>,
}

/// Key generation round 2: secret share for one player
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeygenShareMessage {
    /// Sender player ID
    pub from: PlayerId,
    /// Receiver player ID
    pub to: PlayerId,
    /// Polynomial evaluated at the receiver's point
    pub share: Vec<u8>,
}

/// Signing round 1: nonce contribution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NonceMessage {
    /// Sender player ID
    pub player_id: PlayerId,
    /// Nonce share k_i
    pub nonce_share: Vec<u8>,
    /// Commitment k_i * G
    pub nonce_commitment: Vec<u8>,
}
