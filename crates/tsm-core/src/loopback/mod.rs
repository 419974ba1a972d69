//! In-process participant nodes
//!
//! A [`LoopbackNode`] holds one player's key shares and takes part in key
//! generation and signing over a shared [`Relay`]. Nodes reveal their nonce
//! shares to each other while signing, so they are a development and test
//! double for real MPC nodes, never a production signer.

pub mod keygen;
pub mod messages;
pub mod share;
pub mod sign;

pub use share::KeyShare;

use crate::combine::compress_point;
use crate::endpoint::{async_trait, ParticipantEndpoint};
use crate::mpc::Relay;
use crate::{
    Curve, DerivationPath, Digest, EncryptionKey, Error, KeyId, PartialSignature, PlayerId,
    Result, SigningSession,
};
use dashmap::DashMap;
use std::sync::Arc;
use tracing::{debug, instrument};

/// One participant running in this process
pub struct LoopbackNode<R: Relay> {
    player_id: PlayerId,
    encryption_key: EncryptionKey,
    relay: Arc<R>,
    shares: DashMap<KeyId, KeyShare>,
}

impl<R: Relay> LoopbackNode<R> {
    pub fn new(player_id: PlayerId, encryption_key: EncryptionKey, relay: Arc<R>) -> Self {
        Self {
            player_id,
            encryption_key,
            relay,
            shares: DashMap::new(),
        }
    }

    /// Number of keys this node holds a share of
    pub fn key_count(&self) -> usize {
        self.shares.len()
    }

    fn share(&self, key_id: &KeyId) -> Result<KeyShare> {
        self.shares
            .get(key_id)
            .map(|share| share.clone())
            .ok_or_else(|| Error::KeyNotFound(key_id.to_string()))
    }

    /// Refuse sessions that declare a different key for this node
    fn check_session(&self, session: &SigningSession) -> Result<()> {
        match session.encryption_key(self.player_id) {
            Some(key) if *key == self.encryption_key => Ok(()),
            Some(_) => Err(Error::VerificationFailed(format!(
                "Session declares a different encryption key for player {}",
                self.player_id
            ))),
            None => Err(Error::InvalidPlayerId(self.player_id)),
        }
    }
}

#[async_trait]
impl<R: Relay + 'static> ParticipantEndpoint for LoopbackNode<R> {
    fn player_id(&self) -> PlayerId {
        self.player_id
    }

    fn encryption_key(&self) -> EncryptionKey {
        self.encryption_key
    }

    #[instrument(skip(self, session), fields(player_id = self.player_id))]
    async fn generate_key(
        &self,
        session: &SigningSession,
        threshold: usize,
        curve: Curve,
    ) -> Result<KeyId> {
        self.check_session(session)?;
        match curve {
            Curve::Secp256k1 => {}
        }

        let (key_id, share) =
            keygen::run_keygen(session, self.player_id, threshold, self.relay.as_ref()).await?;
        self.shares.insert(key_id.clone(), share);

        Ok(key_id)
    }

    async fn public_key(&self, key_id: &KeyId, path: &DerivationPath) -> Result<Vec<u8>> {
        let child = self.share(key_id)?.derive_child(path)?;
        let public_key = compress_point(&child.public_key)?;
        debug!(player_id = self.player_id, key_id = %key_id, path = %path, "Derived public key");
        Ok(public_key.to_vec())
    }

    #[instrument(skip(self, session, digest), fields(player_id = self.player_id))]
    async fn partial_sign(
        &self,
        session: &SigningSession,
        key_id: &KeyId,
        path: &DerivationPath,
        digest: &Digest,
    ) -> Result<PartialSignature> {
        self.check_session(session)?;
        let share = self.share(key_id)?;

        let signature_share =
            sign::run_signing(&share, session, path, digest, self.relay.as_ref()).await?;
        Ok(signature_share.to_partial())
    }
}
