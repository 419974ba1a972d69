//! Threshold signing across a subset of participants

use crate::combine::{combine_partial_signatures, finalize};
use crate::{DerivedKey, Digest, Error, FinalSignature, ParticipantSet, PlayerId, Result};
use std::time::Duration;
use tracing::{info, instrument, warn};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);

/// Collects partial signatures and combines them into one ECDSA signature
pub struct SignatureAggregator {
    participants: ParticipantSet,
    timeout: Duration,
}

impl SignatureAggregator {
    pub fn new(participants: ParticipantSet) -> Self {
        Self {
            participants,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Set the deadline of the partial-signing fan-out
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sign `digest` with the child key `key` using exactly `players`.
    ///
    /// Every call opens a fresh session. If any player fails or the
    /// deadline passes, no signature is produced and the error is a
    /// [`Error::PartialSignFailure`]; the caller may retry the whole call.
    #[instrument(skip(self, key, digest), fields(key_id = %key.master.id, path = %key.path))]
    pub async fn sign(
        &self,
        key: &DerivedKey,
        digest: &Digest,
        players: &[PlayerId],
    ) -> Result<FinalSignature> {
        // Session validation covers count, duplicates and unknown ids
        let session = self.participants.sessions().new_session(players)?;
        if session.players.len() <= key.master.threshold {
            return Err(Error::ThresholdNotMet {
                required: key.master.threshold + 1,
                actual: session.players.len(),
            });
        }

        info!(
            session_id = %session.id_hex(),
            players = ?session.players,
            digest = hex::encode(digest),
            "Collecting partial signatures"
        );

        let key_id = key.master.id.clone();
        let path = key.path.clone();
        let digest_copy = *digest;
        let partials = self
            .participants
            .fan_out(&session.players, "partial signing", self.timeout, |endpoint| {
                let session = session.clone();
                let key_id = key_id.clone();
                let path = path.clone();
                async move {
                    endpoint
                        .partial_sign(&session, &key_id, &path, &digest_copy)
                        .await
                }
            })
            .await
            .map_err(|e| {
                warn!(error = %e, "Partial signing failed");
                Error::PartialSignFailure {
                    source: Box::new(e),
                }
            })?;

        let partials: Vec<_> = partials.into_values().collect();
        let signature = combine_partial_signatures(&partials)?;
        let final_signature = finalize(digest, &signature, &key.public_key)?;

        info!(
            recovery_id = final_signature.recovery_id,
            "Combined signature"
        );

        Ok(final_signature)
    }
}
