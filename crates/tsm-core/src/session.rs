//! Session coordination for key-generation and signing rounds

use crate::types::hex_array;
use crate::{EncryptionKey, Error, PlayerId, Result, SessionId};
use rand::rngs::OsRng;
use rand_core::RngCore;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

/// Descriptor of one protocol round.
///
/// Created fresh for every key generation or signing attempt and never
/// persisted. The session id is what keeps concurrent rounds apart on the
/// participants' side, so it must never be reused.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SigningSession {
    /// Session identifier
    #[serde(with = "hex_array")]
    pub session_id: SessionId,
    /// Participating player IDs, ascending
    pub players: Vec<PlayerId>,
    /// Encryption key of every participating player
    pub encryption_keys: BTreeMap<PlayerId, EncryptionKey>,
}

impl SigningSession {
    /// Hex-encoded session id for logging
    pub fn id_hex(&self) -> String {
        hex::encode(self.session_id)
    }

    /// Declared encryption key for a player
    pub fn encryption_key(&self, player: PlayerId) -> Option<&EncryptionKey> {
        self.encryption_keys.get(&player)
    }

    pub fn contains(&self, player: PlayerId) -> bool {
        self.players.binary_search(&player).is_ok()
    }
}

/// Creates session descriptors from the deployment's participant manifest
#[derive(Debug, Clone)]
pub struct SessionCoordinator {
    manifest: BTreeMap<PlayerId, EncryptionKey>,
}

impl SessionCoordinator {
    /// Create a coordinator for a fixed participant manifest
    pub fn new(manifest: BTreeMap<PlayerId, EncryptionKey>) -> Self {
        Self { manifest }
    }

    /// All configured player IDs
    pub fn players(&self) -> impl Iterator<Item = PlayerId> + '_ {
        self.manifest.keys().copied()
    }

    /// Create a fresh session for `player_ids`.
    ///
    /// Fails if fewer than two players are given, if an id repeats or is
    /// unknown, or if the OS random source cannot produce a session id.
    pub fn new_session(&self, player_ids: &[PlayerId]) -> Result<SigningSession> {
        let players = validate_players(player_ids)?;

        let mut encryption_keys = BTreeMap::new();
        for player in &players {
            let key = self
                .manifest
                .get(player)
                .ok_or(Error::InvalidPlayerId(*player))?;
            encryption_keys.insert(*player, *key);
        }

        let mut session_id = [0u8; 32];
        OsRng
            .try_fill_bytes(&mut session_id)
            .map_err(|e| Error::Randomness(e.to_string()))?;

        let session = SigningSession {
            session_id,
            players,
            encryption_keys,
        };
        debug!(session_id = %session.id_hex(), players = ?session.players, "New session");

        Ok(session)
    }
}

/// Check a player list and return it sorted.
pub(crate) fn validate_players(player_ids: &[PlayerId]) -> Result<Vec<PlayerId>> {
    if player_ids.len() < 2 {
        return Err(Error::InvalidConfig(format!(
            "At least two players are required, got {}",
            player_ids.len()
        )));
    }

    let mut seen = BTreeSet::new();
    for player in player_ids {
        if !seen.insert(*player) {
            return Err(Error::DuplicatePlayer(*player));
        }
    }

    Ok(seen.into_iter().collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn coordinator(n: usize) -> SessionCoordinator {
        SessionCoordinator::new((0..n).map(|id| (id, [id as u8; 32])).collect())
    }

    #[test]
    fn test_new_session() {
        let session = coordinator(3).new_session(&[2, 0]).unwrap();

        assert_eq!(session.players, vec![0, 2]);
        assert_eq!(session.encryption_keys.len(), 2);
        assert_eq!(session.encryption_key(2), Some(&[2u8; 32]));
        assert!(session.encryption_key(1).is_none());
        assert!(session.contains(0));
        assert!(!session.contains(1));
    }

    #[test]
    fn test_sessions_are_fresh() {
        let coordinator = coordinator(2);
        let a = coordinator.new_session(&[0, 1]).unwrap();
        let b = coordinator.new_session(&[0, 1]).unwrap();

        assert_ne!(a.session_id, b.session_id);
        assert_ne!(a.session_id, [0u8; 32]);
    }

    #[test]
    fn test_rejects_invalid_player_sets() {
        let coordinator = coordinator(3);

        assert!(matches!(
            coordinator.new_session(&[]),
            Err(Error::InvalidConfig(_))
        ));
        assert!(matches!(
            coordinator.new_session(&[1]),
            Err(Error::InvalidConfig(_))
        ));
        assert!(matches!(
            coordinator.new_session(&[0, 1, 1]),
            Err(Error::DuplicatePlayer(1))
        ));
        assert!(matches!(
            coordinator.new_session(&[0, 7]),
            Err(Error::InvalidPlayerId(7))
        ));
    }

    #[test]
    fn test_session_serde() {
        let session = coordinator(2).new_session(&[0, 1]).unwrap();
        let json = serde_json::to_string(&session).unwrap();

        assert!(json.contains(&session.id_hex()));
        let decoded: SigningSession = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, session);
    }
}
