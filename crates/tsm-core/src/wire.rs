//! JSON bodies of the participant HTTP API
//!
//! | Route | Request | Response |
//! |-------|---------|----------|
//! | `POST /v1/ecdsa/keys` | [`Envelope`] of [`KeygenPayload`] | [`KeygenResponse`] |
//! | `POST /v1/ecdsa/keys/{key_id}/public-key` | [`PublicKeyRequest`] | [`PublicKeyResponse`] |
//! | `POST /v1/ecdsa/sign` | [`Envelope`] of [`SignPayload`] | [`SignResponse`] |
//!
//! Errors come back as [`ErrorResponse`] with a non-2xx status.

pub use crate::envelope::Envelope;
use crate::types::hex_array;
use crate::{Curve, Digest, KeyId, SigningSession};
use serde::{Deserialize, Serialize};

/// Envelope context of key generation payloads
pub const KEYGEN_CONTEXT: &str = "tsm v1 ecdsa keygen";

/// Envelope context of signing payloads
pub const SIGN_CONTEXT: &str = "tsm v1 ecdsa sign";

/// Decrypted body of a key generation request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeygenPayload {
    pub session: SigningSession,
    pub threshold: usize,
    pub curve: Curve,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeygenResponse {
    pub key_id: KeyId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublicKeyRequest {
    /// Derivation path, e.g. `m/44/60`
    pub path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublicKeyResponse {
    /// Hex-encoded compressed public key
    pub public_key: String,
}

/// Decrypted body of a signing request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignPayload {
    pub session: SigningSession,
    pub key_id: KeyId,
    pub path: String,
    #[serde(with = "hex_array")]
    pub digest: Digest,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignResponse {
    /// Base64-encoded partial signature
    pub partial_signature: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    /// Whether the caller may retry with a fresh session
    #[serde(default)]
    pub retryable: bool,
}
