//! Signing round between loopback nodes

use super::keygen::decode_scalar;
use super::messages::NonceMessage;
use super::share::{decode_point, KeyShare};
use crate::combine::{compress_point, r_from_point, SignatureShare};
use crate::mpc::Relay;
use crate::{DerivationPath, Digest, Error, PlayerId, Result, SigningSession};
use k256::{
    elliptic_curve::{bigint::U256, ops::Reduce, Field},
    ProjectivePoint, Scalar,
};
use rand::rngs::OsRng;
use std::collections::BTreeSet;
use tracing::{debug, info, instrument};

const ROUND_NONCE: u32 = 1;

/// Produce this player's share of the signature over `digest`.
///
/// Each signer contributes an additive nonce share in the clear, so every
/// co-signer learns k. That keeps combination a plain sum of shares but
/// means this round is only suitable for local development and tests.
#[instrument(skip(key_share, session, relay), fields(session_id = %session.id_hex()))]
pub async fn run_signing<R: Relay>(
    key_share: &KeyShare,
    session: &SigningSession,
    path: &DerivationPath,
    digest: &Digest,
    relay: &R,
) -> Result<SignatureShare> {
    let player_id = key_share.player_id;
    info!(player_id, signers = ?session.players, path = %path, "Starting signing round");

    if session.players.len() <= key_share.threshold {
        return Err(Error::ThresholdNotMet {
            required: key_share.threshold + 1,
            actual: session.players.len(),
        });
    }
    if !session.contains(player_id) {
        return Err(Error::InvalidPlayerId(player_id));
    }
    if let Some(outsider) = session
        .players
        .iter()
        .find(|p| !key_share.players.contains(p))
    {
        return Err(Error::InvalidPlayerId(*outsider));
    }

    let child = key_share.derive_child(path)?;
    let child_share = key_share.secret_share + child.tweak;

    // Round 1: nonce contributions
    debug!("Signing round 1: nonce");
    let k_i = Scalar::random(&mut OsRng);
    relay
        .broadcast(
            &session.session_id,
            ROUND_NONCE,
            &NonceMessage {
                player_id,
                nonce_share: k_i.to_bytes().to_vec(),
                nonce_commitment: compress_point(&(ProjectivePoint::GENERATOR * k_i))?.to_vec(),
            },
        )
        .await?;

    let nonces = relay
        .collect_broadcasts::<NonceMessage>(&session.session_id, ROUND_NONCE, session.players.len())
        .await?;

    let k = combine_nonces(session, &nonces)?;
    let k_inv: Scalar = Option::from(k.invert())
        .ok_or_else(|| Error::Crypto("Degenerate nonce".into()))?;

    let r_point = compress_point(&(ProjectivePoint::GENERATOR * k))?;
    let r = r_from_point(&r_point)?;
    let m = <Scalar as Reduce<U256>>::reduce_bytes(&(*digest).into());

    // sigma_i = k^-1 * (m / n + r * lambda_i * x_i)
    let n_inv: Scalar = Option::from(Scalar::from(session.players.len() as u64).invert())
        .ok_or_else(|| Error::Internal("Empty signing set".into()))?;
    let lambda_i = lagrange_coefficient(player_id, &session.players)?;
    let sigma = k_inv * (m * n_inv + r * lambda_i * child_share);

    debug!(player_id, r_point = hex::encode(r_point), "Partial signature ready");

    Ok(SignatureShare { r_point, sigma })
}

/// Check every signer's nonce against its commitment and sum them
fn combine_nonces(session: &SigningSession, nonces: &[NonceMessage]) -> Result<Scalar> {
    let mut seen = BTreeSet::new();
    let mut k = Scalar::ZERO;

    for msg in nonces {
        if !session.contains(msg.player_id) || !seen.insert(msg.player_id) {
            return Err(Error::VerificationFailed(format!(
                "Unexpected nonce from player {}",
                msg.player_id
            )));
        }

        let k_i = decode_scalar(&msg.nonce_share)?;
        let commitment = decode_point(&msg.nonce_commitment)?;
        if ProjectivePoint::GENERATOR * k_i != commitment {
            return Err(Error::VerificationFailed(format!(
                "Nonce from player {} does not match commitment",
                msg.player_id
            )));
        }
        k += k_i;
    }

    Ok(k)
}

/// Compute Lagrange coefficient at zero for `player_id` over `players`
fn lagrange_coefficient(player_id: PlayerId, players: &[PlayerId]) -> Result<Scalar> {
    let i = Scalar::from(player_id as u64 + 1);
    let mut numerator = Scalar::ONE;
    let mut denominator = Scalar::ONE;

    for &other in players {
        if other == player_id {
            continue;
        }
        let j = Scalar::from(other as u64 + 1);
        numerator *= j;
        denominator *= j - i;
    }

    Option::from(denominator.invert())
        .map(|inv: Scalar| numerator * inv)
        .ok_or_else(|| Error::Crypto("Repeated evaluation point".into()))
}
