//! Key shares held by a loopback node and their child derivation

use crate::{DerivationPath, Error, PlayerId, Result, HARDENED_BIT};
use hmac::{Hmac, Mac};
use k256::{
    elliptic_curve::{bigint::U256, ops::Reduce, sec1::FromEncodedPoint},
    AffinePoint, ProjectivePoint, Scalar,
};
use sha2::Sha512;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Key share held by one player after key generation
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct KeyShare {
    /// This player's ID
    pub player_id: PlayerId,

    /// Players holding a share of the key
    pub players: Vec<PlayerId>,

    /// Degree of the sharing polynomial; `threshold + 1` players sign
    pub threshold: usize,

    /// This player's secret share (x_i)
    #[zeroize(skip)]
    pub secret_share: Scalar,

    /// Master public key (compressed)
    #[zeroize(skip)]
    pub public_key: Vec<u8>,

    /// Chain code for child derivation, identical on every player
    pub chain_code: [u8; 32],
}

/// Result of deriving a child key
pub struct ChildKey {
    /// Sum of all derivation tweaks; added to every share
    pub tweak: Scalar,
    /// Child public key
    pub public_key: ProjectivePoint,
}

impl KeyShare {
    /// Get the master public key as a ProjectivePoint
    pub fn public_key_point(&self) -> Result<ProjectivePoint> {
        decode_point(&self.public_key)
    }

    /// Derive the child key at `path` using non-hardened derivation.
    ///
    /// Shares stay consistent because every player adds the same tweak and
    /// Lagrange coefficients of any signing set sum to one.
    pub fn derive_child(&self, path: &DerivationPath) -> Result<ChildKey> {
        let mut public_key = self.public_key_point()?;
        let mut chain_code = self.chain_code;
        let mut tweak = Scalar::ZERO;

        for &index in path.indices() {
            if index & HARDENED_BIT != 0 {
                return Err(Error::Derivation(
                    "Hardened derivation not supported in threshold setting".into(),
                ));
            }

            let (child_tweak, child_chain_code) =
                derive_non_hardened(&public_key, &chain_code, index)?;

            tweak += child_tweak;
            public_key += ProjectivePoint::GENERATOR * child_tweak;
            chain_code = child_chain_code;
        }

        Ok(ChildKey { tweak, public_key })
    }
}

/// Derive non-hardened child tweak and chain code
fn derive_non_hardened(
    parent: &ProjectivePoint,
    chain_code: &[u8; 32],
    index: u32,
) -> Result<(Scalar, [u8; 32])> {
    // HMAC-SHA512(chain_code, public_key || index)
    let mut hmac = Hmac::<Sha512>::new_from_slice(chain_code)
        .map_err(|e| Error::Derivation(e.to_string()))?;

    hmac.update(&crate::combine::compress_point(parent)?);
    hmac.update(&index.to_be_bytes());

    let result = hmac.finalize().into_bytes();

    let tweak_bytes: [u8; 32] = result[..32]
        .try_into()
        .map_err(|_| Error::Derivation("Invalid HMAC output".into()))?;
    let tweak = <Scalar as Reduce<U256>>::reduce_bytes(&tweak_bytes.into());
    let new_chain_code: [u8; 32] = result[32..]
        .try_into()
        .map_err(|_| Error::Derivation("Invalid HMAC output".into()))?;

    Ok((tweak, new_chain_code))
}

/// Decode a SEC1 point
pub(crate) fn decode_point(bytes: &[u8]) -> Result<ProjectivePoint> {
    let encoded = k256::EncodedPoint::from_bytes(bytes)
        .map_err(|e| Error::VerificationFailed(e.to_string()))?;
    let affine: AffinePoint = Option::from(AffinePoint::from_encoded_point(&encoded))
        .ok_or_else(|| Error::VerificationFailed("Invalid curve point".into()))?;
    Ok(ProjectivePoint::from(affine))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::combine::compress_point;
    use k256::elliptic_curve::Field;
    use rand::rngs::OsRng;

    fn share(secret: Scalar) -> KeyShare {
        KeyShare {
            player_id: 0,
            players: vec![0, 1],
            threshold: 1,
            secret_share: secret,
            public_key: compress_point(&(ProjectivePoint::GENERATOR * secret))
                .unwrap()
                .to_vec(),
            chain_code: [5u8; 32],
        }
    }

    #[test]
    fn test_child_public_key_matches_child_secret() {
        let secret = Scalar::random(&mut OsRng);
        let share = share(secret);
        let path: DerivationPath = "m/44/60".parse().unwrap();

        let child = share.derive_child(&path).unwrap();

        assert_eq!(
            child.public_key,
            ProjectivePoint::GENERATOR * (secret + child.tweak)
        );
        assert_ne!(child.public_key, share.public_key_point().unwrap());
    }

    #[test]
    fn test_derivation_is_deterministic_and_path_sensitive() {
        let share = share(Scalar::random(&mut OsRng));
        let a = share.derive_child(&"m/44/60".parse().unwrap()).unwrap();
        let b = share.derive_child(&"m/44/60".parse().unwrap()).unwrap();
        let c = share.derive_child(&"m/44/61".parse().unwrap()).unwrap();

        assert_eq!(a.public_key, b.public_key);
        assert_ne!(a.public_key, c.public_key);
    }

    #[test]
    fn test_empty_path_is_master_key() {
        let share = share(Scalar::random(&mut OsRng));
        let child = share.derive_child(&DerivationPath::default()).unwrap();

        assert_eq!(child.tweak, Scalar::ZERO);
        assert_eq!(child.public_key, share.public_key_point().unwrap());
    }

    #[test]
    fn test_rejects_hardened() {
        let share = share(Scalar::random(&mut OsRng));
        let path: DerivationPath = "m/44'/60".parse().unwrap();

        assert!(matches!(share.derive_child(&path), Err(Error::Derivation(_))));
    }
}
