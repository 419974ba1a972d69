//! Combination of partial signatures into a canonical ECDSA signature
//!
//! A partial signature is laid out as the compressed nonce point `R`
//! (33 bytes) followed by the signer's additive share of `s` (32 bytes).
//! Every partial of one session carries the same `R`.

use crate::{Digest, Error, FinalSignature, PartialSignature, Result};
use k256::{
    ecdsa::{signature::hazmat::PrehashVerifier, RecoveryId, Signature, VerifyingKey},
    elliptic_curve::{
        bigint::U256,
        ops::Reduce,
        sec1::{FromEncodedPoint, ToEncodedPoint},
    },
    AffinePoint, Scalar,
};

/// Byte length of an encoded partial signature
pub const PARTIAL_SIGNATURE_LEN: usize = 65;

/// Decoded partial signature
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SignatureShare {
    /// Nonce point R (compressed)
    pub r_point: [u8; 33],
    /// Share of s
    pub sigma: Scalar,
}

impl SignatureShare {
    /// Encode as an opaque partial signature
    pub fn to_partial(&self) -> PartialSignature {
        let mut bytes = Vec::with_capacity(PARTIAL_SIGNATURE_LEN);
        bytes.extend_from_slice(&self.r_point);
        bytes.extend_from_slice(&self.sigma.to_bytes());
        PartialSignature::new(bytes)
    }

    /// Decode an opaque partial signature
    pub fn from_partial(partial: &PartialSignature) -> Result<Self> {
        let bytes = partial.as_bytes();
        if bytes.len() != PARTIAL_SIGNATURE_LEN {
            return Err(Error::Deserialization(format!(
                "Partial signature must be {PARTIAL_SIGNATURE_LEN} bytes, got {}",
                bytes.len()
            )));
        }

        let r_point: [u8; 33] = bytes[..33]
            .try_into()
            .map_err(|_| Error::Deserialization("Invalid R point length".into()))?;
        let sigma_bytes: [u8; 32] = bytes[33..]
            .try_into()
            .map_err(|_| Error::Deserialization("Invalid sigma length".into()))?;
        let sigma = <Scalar as Reduce<U256>>::reduce_bytes(&sigma_bytes.into());

        Ok(Self { r_point, sigma })
    }
}

/// Combine partial signatures into a low-s ECDSA signature
pub fn combine_partial_signatures(partials: &[PartialSignature]) -> Result<Signature> {
    let shares = partials
        .iter()
        .map(SignatureShare::from_partial)
        .collect::<Result<Vec<_>>>()?;

    let first = shares
        .first()
        .ok_or_else(|| Error::InvalidConfig("No partial signatures to combine".into()))?;
    if shares.iter().any(|share| share.r_point != first.r_point) {
        return Err(Error::VerificationFailed(
            "Partial signatures disagree on the nonce point".into(),
        ));
    }

    // Sum all sigma shares
    let s = shares
        .iter()
        .fold(Scalar::ZERO, |acc, share| acc + share.sigma);

    let r = r_from_point(&first.r_point)?;

    let signature = Signature::from_scalars(r.to_bytes(), s.to_bytes())
        .map_err(|e| Error::Crypto(format!("Degenerate signature: {e}")))?;

    Ok(signature.normalize_s().unwrap_or(signature))
}

/// r = x-coordinate of R mod n
pub fn r_from_point(r_point: &[u8; 33]) -> Result<Scalar> {
    let encoded = k256::EncodedPoint::from_bytes(r_point)
        .map_err(|e| Error::Deserialization(e.to_string()))?;
    let affine: AffinePoint = Option::from(AffinePoint::from_encoded_point(&encoded))
        .ok_or_else(|| Error::VerificationFailed("Invalid R point".into()))?;

    let uncompressed = affine.to_encoded_point(false);
    let x: [u8; 32] = uncompressed.as_bytes()[1..33]
        .try_into()
        .map_err(|_| Error::Internal("Invalid R coordinate".into()))?;

    Ok(<Scalar as Reduce<U256>>::reduce_bytes(&x.into()))
}

/// Find the recovery id under which `signature` recovers `public_key`.
///
/// Candidates are tried in order; the first match wins.
pub fn recovery_id(digest: &Digest, signature: &Signature, public_key: &[u8]) -> Result<u8> {
    let expected = VerifyingKey::from_sec1_bytes(public_key)
        .map_err(|e| Error::Crypto(format!("Invalid public key: {e}")))?;

    for candidate in 0u8..=3 {
        let Some(id) = RecoveryId::from_byte(candidate) else {
            continue;
        };
        match VerifyingKey::recover_from_prehash(digest, signature, id) {
            Ok(recovered) if recovered == expected => return Ok(candidate),
            _ => continue,
        }
    }

    Err(Error::InvalidSignature)
}

/// Build the final 65-byte signature, deriving the recovery id
pub fn finalize(digest: &Digest, signature: &Signature, public_key: &[u8]) -> Result<FinalSignature> {
    let recovery_id = recovery_id(digest, signature, public_key)?;
    let (r, s) = signature.split_bytes();

    let mut r_bytes = [0u8; 32];
    let mut s_bytes = [0u8; 32];
    r_bytes.copy_from_slice(&r);
    s_bytes.copy_from_slice(&s);

    Ok(FinalSignature::new(r_bytes, s_bytes, recovery_id))
}

/// Verify a final signature against a public key
pub fn verify(digest: &Digest, signature: &FinalSignature, public_key: &[u8]) -> Result<()> {
    let key = VerifyingKey::from_sec1_bytes(public_key)
        .map_err(|e| Error::Crypto(format!("Invalid public key: {e}")))?;
    let sig = Signature::from_scalars(signature.r, signature.s)
        .map_err(|_| Error::InvalidSignature)?;

    key.verify_prehash(digest, &sig)
        .map_err(|_| Error::InvalidSignature)?;

    let recovered = RecoveryId::from_byte(signature.recovery_id)
        .and_then(|id| VerifyingKey::recover_from_prehash(digest, &sig, id).ok())
        .ok_or(Error::InvalidSignature)?;
    if recovered != key {
        return Err(Error::InvalidSignature);
    }

    Ok(())
}

/// Compressed bytes of a nonce point
pub(crate) fn compress_point(point: &k256::ProjectivePoint) -> Result<[u8; 33]> {
    point
        .to_affine()
        .to_encoded_point(true)
        .as_bytes()
        .try_into()
        .map_err(|_| Error::Internal("Invalid R point".into()))
}
