//! End-to-end encryption of protocol payloads to a participant
//!
//! Payloads are sealed to the participant's X25519 key with an ephemeral
//! key pair. The ChaCha20-Poly1305 key is derived with BLAKE3 from the
//! shared secret and both public keys, bound to a per-operation context.

use crate::{EncryptionKey, Error, Result};
use base64::{engine::general_purpose::STANDARD, Engine};
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Nonce,
};
use rand::rngs::OsRng;
use rand_core::RngCore;
use serde::{Deserialize, Serialize};
use x25519_dalek::{EphemeralSecret, PublicKey, StaticSecret};

/// Sealed payload as carried on the wire (all fields base64)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub ephemeral_key: String,
    pub nonce: String,
    pub ciphertext: String,
}

/// Encrypt `plaintext` to `recipient` under `context`
pub fn seal(recipient: &EncryptionKey, context: &str, plaintext: &[u8]) -> Result<Envelope> {
    let recipient = PublicKey::from(*recipient);
    let ephemeral = EphemeralSecret::random_from_rng(OsRng);
    let ephemeral_public = PublicKey::from(&ephemeral);
    let shared = ephemeral.diffie_hellman(&recipient);

    let key = derive_key(context, shared.as_bytes(), &ephemeral_public, &recipient);
    let mut nonce = [0u8; 12];
    OsRng
        .try_fill_bytes(&mut nonce)
        .map_err(|e| Error::Randomness(e.to_string()))?;

    let ciphertext = ChaCha20Poly1305::new(&key.into())
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|_| Error::Crypto("Encryption failed".into()))?;

    Ok(Envelope {
        ephemeral_key: STANDARD.encode(ephemeral_public.as_bytes()),
        nonce: STANDARD.encode(nonce),
        ciphertext: STANDARD.encode(ciphertext),
    })
}

/// Decrypt an envelope sealed to `secret` under `context`
pub fn open(secret: &StaticSecret, context: &str, envelope: &Envelope) -> Result<Vec<u8>> {
    let ephemeral_public = PublicKey::from(decode_key(&envelope.ephemeral_key)?);
    let nonce: [u8; 12] = decode(&envelope.nonce)?
        .try_into()
        .map_err(|_| Error::Deserialization("Nonce must be 12 bytes".into()))?;
    let ciphertext = decode(&envelope.ciphertext)?;

    let shared = secret.diffie_hellman(&ephemeral_public);
    let key = derive_key(
        context,
        shared.as_bytes(),
        &ephemeral_public,
        &PublicKey::from(secret),
    );

    ChaCha20Poly1305::new(&key.into())
        .decrypt(Nonce::from_slice(&nonce), ciphertext.as_slice())
        .map_err(|_| Error::Crypto("Envelope authentication failed".into()))
}

/// Encryption key from its base64 form
pub fn parse_encryption_key(encoded: &str) -> Result<EncryptionKey> {
    decode_key(encoded.trim())
}

/// Base64 form of an encryption key
pub fn encode_encryption_key(key: &EncryptionKey) -> String {
    STANDARD.encode(key)
}

fn derive_key(
    context: &str,
    shared: &[u8; 32],
    ephemeral: &PublicKey,
    recipient: &PublicKey,
) -> [u8; 32] {
    let mut material = Vec::with_capacity(96);
    material.extend_from_slice(shared);
    material.extend_from_slice(ephemeral.as_bytes());
    material.extend_from_slice(recipient.as_bytes());
    blake3::derive_key(context, &material)
}

fn decode(encoded: &str) -> Result<Vec<u8>> {
    STANDARD
        .decode(encoded)
        .map_err(|e| Error::Deserialization(format!("Invalid base64: {e}")))
}

fn decode_key(encoded: &str) -> Result<[u8; 32]> {
    decode(encoded)?
        .try_into()
        .map_err(|_| Error::Deserialization("Encryption key must be 32 bytes".into()))
}
