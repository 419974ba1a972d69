//! Distributed key generation between loopback nodes

use super::messages::{KeygenCommitMessage, KeygenShareMessage};
use super::share::{decode_point, KeyShare};
use crate::mpc::Relay;
use crate::{Error, KeyId, PlayerId, Result, SigningSession};
use k256::{
    elliptic_curve::{bigint::U256, ops::Reduce, sec1::ToEncodedPoint, Field},
    ProjectivePoint, Scalar,
};
use rand::rngs::OsRng;
use sha2::{Digest as _, Sha256};
use std::collections::BTreeMap;
use tracing::{debug, info, instrument};

const ROUND_COMMIT: u32 = 1;
const ROUND_SHARE: u32 = 2;

/// Run Feldman-VSS key generation for `player_id` within `session`.
///
/// Every player ends with a share of a degree `threshold` polynomial, so
/// `threshold + 1` players are needed to sign. All players agree on the
/// public key, the chain code and the key id.
#[instrument(skip(session, relay), fields(session_id = %session.id_hex()))]
pub async fn run_keygen<R: Relay>(
    session: &SigningSession,
    player_id: PlayerId,
    threshold: usize,
    relay: &R,
) -> Result<(KeyId, KeyShare)> {
    let n_players = session.players.len();
    if threshold == 0 || threshold >= n_players {
        return Err(Error::InvalidConfig(format!(
            "Threshold {threshold} out of range for {n_players} players"
        )));
    }

    // Round 1: commit to a random polynomial
    debug!("Keygen round 1: commitment");
    let (secret_poly, commitments) = generate_secret_polynomial(threshold);

    relay
        .broadcast(
            &session.session_id,
            ROUND_COMMIT,
            &KeygenCommitMessage {
                player_id,
                commitments,
            },
        )
        .await?;

    let all_commitments = index_commitments(
        session,
        threshold,
        relay
            .collect_broadcasts::<KeygenCommitMessage>(&session.session_id, ROUND_COMMIT, n_players)
            .await?,
    )?;

    // Round 2: send each player its evaluation
    debug!("Keygen round 2: secret sharing");
    for &other in &session.players {
        if other == player_id {
            continue;
        }
        let share = evaluate_polynomial(&secret_poly, other as u64 + 1);
        relay
            .send_direct(
                &session.session_id,
                ROUND_SHARE,
                other,
                &KeygenShareMessage {
                    from: player_id,
                    to: other,
                    share: share.to_bytes().to_vec(),
                },
            )
            .await?;
    }

    let received_shares = relay
        .collect_direct::<KeygenShareMessage>(
            &session.session_id,
            ROUND_SHARE,
            player_id,
            n_players - 1,
        )
        .await?;

    // Verify received shares and add them up
    let mut secret_share = evaluate_polynomial(&secret_poly, player_id as u64 + 1);
    for share_msg in &received_shares {
        let commitments = all_commitments.get(&share_msg.from).ok_or_else(|| {
            Error::VerificationFailed(format!("Share from unknown player {}", share_msg.from))
        })?;
        let share = decode_scalar(&share_msg.share)?;
        verify_share(share_msg.from, &share, commitments, player_id)?;
        secret_share += share;
    }

    let public_key = compute_public_key(&all_commitments)?;
    let chain_code = compute_chain_code(&all_commitments);
    let key_id = compute_key_id(&session.session_id, &public_key);

    info!(
        player_id,
        key_id = %key_id,
        public_key = hex::encode(&public_key),
        "Key generation completed"
    );

    Ok((
        key_id,
        KeyShare {
            player_id,
            players: session.players.clone(),
            threshold,
            secret_share,
            public_key,
            chain_code,
        },
    ))
}

/// Generate a random secret polynomial of degree t and its commitments
fn generate_secret_polynomial(threshold: usize) -> (Vec<Scalar>, Vec<Vec<u8>>) {
    let mut rng = OsRng;
    let mut coefficients = Vec::with_capacity(threshold + 1);
    let mut commitments = Vec::with_capacity(threshold + 1);

    for _ in 0..=threshold {
        let coef = Scalar::random(&mut rng);
        let commitment = (ProjectivePoint::GENERATOR * coef).to_affine();

        coefficients.push(coef);
        commitments.push(commitment.to_encoded_point(true).as_bytes().to_vec());
    }

    (coefficients, commitments)
}

/// Evaluate polynomial at a point
fn evaluate_polynomial(coefficients: &[Scalar], x: u64) -> Scalar {
    let x_scalar = Scalar::from(x);
    let mut result = Scalar::ZERO;
    let mut x_power = Scalar::ONE;

    for coef in coefficients {
        result += *coef * x_power;
        x_power *= x_scalar;
    }

    result
}

/// Key commitments by sender, checking every session player sent exactly one
fn index_commitments(
    session: &SigningSession,
    threshold: usize,
    messages: Vec<KeygenCommitMessage>,
) -> Result<BTreeMap<PlayerId, Vec<ProjectivePoint>>> {
    let mut indexed = BTreeMap::new();

    for msg in messages {
        if !session.contains(msg.player_id) {
            return Err(Error::VerificationFailed(format!(
                "Commitment from player {} outside the session",
                msg.player_id
            )));
        }
        if msg.commitments.len() != threshold + 1 {
            return Err(Error::VerificationFailed(format!(
                "Player {} committed to {} coefficients, expected {}",
                msg.player_id,
                msg.commitments.len(),
                threshold + 1
            )));
        }
        let points = msg
            .commitments
            .iter()
            .map(|bytes| decode_point(bytes))
            .collect::<Result<Vec<_>>>()?;
        if indexed.insert(msg.player_id, points).is_some() {
            return Err(Error::VerificationFailed(format!(
                "Duplicate commitment from player {}",
                msg.player_id
            )));
        }
    }

    Ok(indexed)
}

/// Verify a share against the sender's commitments
fn verify_share(
    from: PlayerId,
    share: &Scalar,
    commitments: &[ProjectivePoint],
    my_id: PlayerId,
) -> Result<()> {
    let expected = ProjectivePoint::GENERATOR * share;

    let x_scalar = Scalar::from(my_id as u64 + 1);
    let mut actual = ProjectivePoint::IDENTITY;
    let mut x_power = Scalar::ONE;

    for commitment in commitments {
        actual += *commitment * x_power;
        x_power *= x_scalar;
    }

    if expected != actual {
        return Err(Error::VerificationFailed(format!(
            "Share from player {from} does not match commitment"
        )));
    }

    Ok(())
}

/// Public key = sum of every player's constant-term commitment
fn compute_public_key(all_commitments: &BTreeMap<PlayerId, Vec<ProjectivePoint>>) -> Result<Vec<u8>> {
    let mut public_key = ProjectivePoint::IDENTITY;
    for commitments in all_commitments.values() {
        let constant = commitments
            .first()
            .ok_or_else(|| Error::VerificationFailed("Empty commitments".into()))?;
        public_key += constant;
    }

    Ok(crate::combine::compress_point(&public_key)?.to_vec())
}

/// Chain code bound to the full commitment transcript
fn compute_chain_code(all_commitments: &BTreeMap<PlayerId, Vec<ProjectivePoint>>) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(b"tsm-loopback/chain-code");
    for (player, commitments) in all_commitments {
        hasher.update((*player as u64).to_be_bytes());
        for commitment in commitments {
            hasher.update(commitment.to_affine().to_encoded_point(true).as_bytes());
        }
    }
    hasher.finalize().into()
}

/// Key id derived from the session and the resulting public key
fn compute_key_id(session_id: &[u8; 32], public_key: &[u8]) -> KeyId {
    let mut hasher = blake3::Hasher::new();
    hasher.update(session_id);
    hasher.update(public_key);
    let hash = hasher.finalize();

    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&hash.as_bytes()[..16]);
    KeyId::new(uuid::Builder::from_random_bytes(bytes).into_uuid().to_string())
}

pub(crate) fn decode_scalar(bytes: &[u8]) -> Result<Scalar> {
    let array: [u8; 32] = bytes
        .try_into()
        .map_err(|_| Error::Deserialization("Invalid scalar length".into()))?;
    Ok(<Scalar as Reduce<U256>>::reduce_bytes(&array.into()))
}
