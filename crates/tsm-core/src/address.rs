//! Ethereum address of a secp256k1 public key

use crate::{Error, PublicKey, Result};
use k256::elliptic_curve::sec1::ToEncodedPoint;
use tiny_keccak::{Hasher, Keccak};

/// Keccak-256 hash
pub fn keccak256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Keccak::v256();
    hasher.update(data);
    let mut out = [0u8; 32];
    hasher.finalize(&mut out);
    out
}

/// Parse SEC1 bytes (compressed or uncompressed) into a compressed key
pub fn compress_public_key(bytes: &[u8]) -> Result<PublicKey> {
    let key = k256::PublicKey::from_sec1_bytes(bytes)
        .map_err(|e| Error::Crypto(format!("Invalid secp256k1 public key: {e}")))?;
    key.to_encoded_point(true)
        .as_bytes()
        .try_into()
        .map_err(|_| Error::Internal("Invalid compressed point length".into()))
}

/// Ethereum address: last 20 bytes of keccak256(X || Y)
pub fn eth_address(public_key: &[u8]) -> Result<[u8; 20]> {
    let key = k256::PublicKey::from_sec1_bytes(public_key)
        .map_err(|e| Error::Crypto(format!("Invalid secp256k1 public key: {e}")))?;
    let uncompressed = key.to_encoded_point(false);

    let hash = keccak256(&uncompressed.as_bytes()[1..]);
    let mut address = [0u8; 20];
    address.copy_from_slice(&hash[12..]);
    Ok(address)
}
