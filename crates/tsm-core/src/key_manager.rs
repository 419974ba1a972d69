//! Master key lifecycle and cross-validated public key derivation

use crate::address::{compress_public_key, eth_address};
use crate::keystore::KeyStore;
use crate::{
    Curve, DerivationPath, DerivedKey, Error, KeyId, MasterKey, ParticipantSet, Result,
};
use std::time::Duration;
use tracing::{info, instrument, warn};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// Creates or loads the master key and derives child keys from it
pub struct KeyManager<S: KeyStore> {
    participants: ParticipantSet,
    store: S,
    timeout: Duration,
}

impl<S: KeyStore> KeyManager<S> {
    pub fn new(participants: ParticipantSet, store: S) -> Self {
        Self {
            participants,
            store,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Set the deadline of each fan-out
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn participants(&self) -> &ParticipantSet {
        &self.participants
    }

    /// Return the persisted master key, or run key generation on every
    /// participant and persist the agreed id.
    ///
    /// `threshold` must lie in `1..n` and is checked before the store is
    /// read, so a threshold that no longer fits the deployment fails even
    /// when an id is already persisted. A persisted id is otherwise trusted
    /// as-is. Nothing is persisted unless every participant returned the
    /// same id.
    #[instrument(skip(self))]
    pub async fn get_or_create_master_key(
        &self,
        threshold: usize,
        curve: Curve,
    ) -> Result<MasterKey> {
        let players = self.participants.player_ids();
        if threshold == 0 || threshold >= players.len() {
            return Err(Error::InvalidConfig(format!(
                "Threshold {threshold} out of range for {} players",
                players.len()
            )));
        }

        if let Some(id) = self.store.load()? {
            info!(key_id = %id, "Using persisted master key");
            return Ok(MasterKey {
                id,
                threshold,
                curve,
            });
        }

        let session = self.participants.sessions().new_session(&players)?;
        info!(session_id = %session.id_hex(), players = ?players, "Generating master key");

        let ids = self
            .participants
            .fan_out(&players, "key generation", self.timeout, |endpoint| {
                let session = session.clone();
                async move { endpoint.generate_key(&session, threshold, curve).await }
            })
            .await?;

        let id = agreed(ids.into_iter(), |player, id: &KeyId| {
            format!("player {player} returned key id {id}")
        })?;

        self.store.save(&id)?;
        info!(key_id = %id, "Generated master key");

        Ok(MasterKey {
            id,
            threshold,
            curve,
        })
    }

    /// Ask every participant for the child public key at `path` and
    /// require byte-exact agreement
    #[instrument(skip(self, master), fields(key_id = %master.id))]
    pub async fn derive_public_key(
        &self,
        master: &MasterKey,
        path: &DerivationPath,
    ) -> Result<DerivedKey> {
        let players = self.participants.player_ids();
        let key_id = master.id.clone();

        let keys = self
            .participants
            .fan_out(&players, "public key derivation", self.timeout, |endpoint| {
                let key_id = key_id.clone();
                let path = path.clone();
                async move { endpoint.public_key(&key_id, &path).await }
            })
            .await?;

        let bytes = agreed(keys.into_iter(), |player, key: &Vec<u8>| {
            format!("player {player} returned public key {}", hex::encode(key))
        })?;

        let public_key = compress_public_key(&bytes)?;
        let address = eth_address(&public_key)?;

        let derived = DerivedKey {
            master: master.clone(),
            path: path.clone(),
            public_key,
            address,
        };
        info!(
            path = %path,
            public_key = hex::encode(public_key),
            address = %derived.address_hex(),
            "Derived public key"
        );

        Ok(derived)
    }
}

/// The single value every player returned
fn agreed<T, I, F>(mut values: I, describe: F) -> Result<T>
where
    T: PartialEq,
    I: Iterator<Item = (usize, T)>,
    F: Fn(usize, &T) -> String,
{
    let (first_player, first) = values
        .next()
        .ok_or_else(|| Error::Internal("No participant responded".into()))?;

    for (player, value) in values {
        if value != first {
            warn!(first_player, player, "Participants disagree");
            return Err(Error::KeyConsistency(format!(
                "{} but {}",
                describe(first_player, &first),
                describe(player, &value)
            )));
        }
    }

    Ok(first)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::testing::ScriptedEndpoint;
    use crate::keystore::MemoryKeyStore;
    use crate::loopback::testing::{nodes, participant_set};
    use crate::ParticipantEndpoint;
    use std::sync::Arc;

    fn scripted(endpoints: Vec<ScriptedEndpoint>) -> (ParticipantSet, Vec<Arc<ScriptedEndpoint>>) {
        let endpoints: Vec<Arc<ScriptedEndpoint>> = endpoints.into_iter().map(Arc::new).collect();
        let set = ParticipantSet::new(
            endpoints
                .iter()
                .map(|e| Arc::clone(e) as Arc<dyn ParticipantEndpoint>)
                .collect(),
        )
        .unwrap();
        (set, endpoints)
    }

    #[tokio::test]
    async fn test_generates_and_persists_key() {
        let nodes = nodes(3);
        let store = Arc::new(MemoryKeyStore::new());
        let manager = KeyManager::new(participant_set(&nodes), Arc::clone(&store));

        let master = manager
            .get_or_create_master_key(2, Curve::Secp256k1)
            .await
            .unwrap();

        assert_eq!(store.load().unwrap(), Some(master.id.clone()));
        assert_eq!(master.threshold, 2);
        assert!(nodes.iter().all(|node| node.key_count() == 1));

        // Second call reuses the stored id without another key generation
        let again = manager
            .get_or_create_master_key(2, Curve::Secp256k1)
            .await
            .unwrap();
        assert_eq!(again.id, master.id);
        assert!(nodes.iter().all(|node| node.key_count() == 1));
    }

    #[tokio::test]
    async fn test_persisted_key_skips_participants() {
        let (set, endpoints) = scripted(vec![ScriptedEndpoint::new(0), ScriptedEndpoint::new(1)]);
        let manager = KeyManager::new(set, MemoryKeyStore::with_key(KeyId::new("stored")));

        let master = manager
            .get_or_create_master_key(1, Curve::Secp256k1)
            .await
            .unwrap();

        assert_eq!(master.id, KeyId::new("stored"));
        assert!(endpoints.iter().all(|e| e.calls() == 0));
    }

    #[tokio::test]
    async fn test_key_id_mismatch_persists_nothing() {
        let mut odd = ScriptedEndpoint::new(1);
        odd.key_id = Ok(KeyId::new("key-2"));
        let (set, _) = scripted(vec![ScriptedEndpoint::new(0), odd]);
        let store = Arc::new(MemoryKeyStore::new());
        let manager = KeyManager::new(set, Arc::clone(&store));

        let result = manager.get_or_create_master_key(1, Curve::Secp256k1).await;

        assert!(matches!(result, Err(Error::KeyConsistency(_))));
        assert_eq!(store.load().unwrap(), None);
    }

    #[tokio::test]
    async fn test_key_id_mismatch_leaves_no_key_file() {
        let mut odd = ScriptedEndpoint::new(2);
        odd.key_id = Ok(KeyId::new("key-2"));
        let (set, endpoints) = scripted(vec![
            ScriptedEndpoint::new(0),
            ScriptedEndpoint::new(1),
            odd,
        ]);
        let path = std::env::temp_dir().join(format!("tsm-key-{}.txt", uuid::Uuid::new_v4()));
        let manager = KeyManager::new(set, crate::FileKeyStore::new(&path));

        let result = manager.get_or_create_master_key(2, Curve::Secp256k1).await;

        assert!(matches!(result, Err(Error::KeyConsistency(_))));
        assert!(endpoints.iter().all(|e| e.calls() == 1));
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_participant_failure_is_fatal() {
        let mut failing = ScriptedEndpoint::new(2);
        failing.key_id = Err(Error::Endpoint("connection refused".into()));
        let (set, _) = scripted(vec![
            ScriptedEndpoint::new(0),
            ScriptedEndpoint::new(1),
            failing,
        ]);
        let store = Arc::new(MemoryKeyStore::new());
        let manager = KeyManager::new(set, Arc::clone(&store));

        let result = manager.get_or_create_master_key(2, Curve::Secp256k1).await;

        assert!(matches!(result, Err(Error::Participant { player: 2, .. })));
        assert_eq!(store.load().unwrap(), None);
    }

    #[tokio::test]
    async fn test_node_with_wrong_manifest_key_aborts_keygen() {
        // Node 2 is configured with an encryption key the deployment does not declare
        let relay = Arc::new(crate::mpc::MemoryRelay::new().with_timeout(Duration::from_secs(2)));
        let honest: Vec<Arc<dyn ParticipantEndpoint>> = (0..2)
            .map(|id| {
                Arc::new(crate::LoopbackNode::new(id, [id as u8; 32], Arc::clone(&relay)))
                    as Arc<dyn ParticipantEndpoint>
            })
            .collect();
        let node = Arc::new(crate::LoopbackNode::new(2, [9u8; 32], Arc::clone(&relay)));
        let declared = Arc::new(ManifestOverride {
            inner: Arc::clone(&node),
            declared: [2u8; 32],
        });

        let mut endpoints = honest;
        endpoints.push(declared);
        let store = Arc::new(MemoryKeyStore::new());
        let manager = KeyManager::new(ParticipantSet::new(endpoints).unwrap(), Arc::clone(&store))
            .with_timeout(Duration::from_secs(10));

        let result = manager.get_or_create_master_key(2, Curve::Secp256k1).await;

        assert!(result.is_err());
        assert_eq!(store.load().unwrap(), None);
        assert_eq!(node.key_count(), 0);
    }

    #[tokio::test]
    async fn test_rejects_bad_threshold() {
        let (set, endpoints) = scripted(vec![ScriptedEndpoint::new(0), ScriptedEndpoint::new(1)]);
        let manager = KeyManager::new(set, MemoryKeyStore::new());

        for threshold in [0, 2, 3] {
            let result = manager
                .get_or_create_master_key(threshold, Curve::Secp256k1)
                .await;
            assert!(matches!(result, Err(Error::InvalidConfig(_))));
        }
        assert!(endpoints.iter().all(|e| e.calls() == 0));
    }

    #[tokio::test]
    async fn test_threshold_checked_before_persisted_id() {
        let (set, _) = scripted(vec![ScriptedEndpoint::new(0), ScriptedEndpoint::new(1)]);
        let manager = KeyManager::new(set, MemoryKeyStore::with_key(KeyId::new("stored")));

        let result = manager.get_or_create_master_key(2, Curve::Secp256k1).await;

        assert!(matches!(result, Err(Error::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn test_derive_public_key_agrees() {
        let nodes = nodes(3);
        let manager = KeyManager::new(participant_set(&nodes), MemoryKeyStore::new());
        let master = manager
            .get_or_create_master_key(2, Curve::Secp256k1)
            .await
            .unwrap();
        let path: DerivationPath = "m/44/60".parse().unwrap();

        let derived = manager.derive_public_key(&master, &path).await.unwrap();
        let again = manager.derive_public_key(&master, &path).await.unwrap();

        assert_eq!(derived, again);
        assert_eq!(derived.address, eth_address(&derived.public_key).unwrap());
        assert_eq!(derived.address_hex().len(), 42);
    }

    #[tokio::test]
    async fn test_public_key_mismatch() {
        let mut odd = ScriptedEndpoint::new(1);
        odd.public_key = vec![3u8; 33];
        let (set, _) = scripted(vec![ScriptedEndpoint::new(0), odd]);
        let manager = KeyManager::new(set, MemoryKeyStore::new());
        let master = MasterKey {
            id: KeyId::new("key-1"),
            threshold: 1,
            curve: Curve::Secp256k1,
        };

        let result = manager
            .derive_public_key(&master, &"m/44/60".parse().unwrap())
            .await;

        assert!(matches!(result, Err(Error::KeyConsistency(_))));
    }

    #[tokio::test]
    async fn test_agreed_bytes_must_be_a_point() {
        let endpoints = (0..2)
            .map(|id| {
                let mut endpoint = ScriptedEndpoint::new(id);
                endpoint.public_key = vec![0x05; 33];
                endpoint
            })
            .collect();
        let (set, _) = scripted(endpoints);
        let manager = KeyManager::new(set, MemoryKeyStore::new());
        let master = MasterKey {
            id: KeyId::new("key-1"),
            threshold: 1,
            curve: Curve::Secp256k1,
        };

        // Both agree, but 0x05 is not a SEC1 tag
        let result = manager
            .derive_public_key(&master, &DerivationPath::default())
            .await;

        assert!(matches!(result, Err(Error::Crypto(_))));
    }

    /// Endpoint advertising a different encryption key than the node it wraps
    struct ManifestOverride {
        inner: Arc<crate::LoopbackNode<crate::mpc::MemoryRelay>>,
        declared: crate::EncryptionKey,
    }

    #[crate::endpoint::async_trait]
    impl ParticipantEndpoint for ManifestOverride {
        fn player_id(&self) -> crate::PlayerId {
            self.inner.player_id()
        }

        fn encryption_key(&self) -> crate::EncryptionKey {
            self.declared
        }

        async fn generate_key(
            &self,
            session: &crate::SigningSession,
            threshold: usize,
            curve: Curve,
        ) -> Result<KeyId> {
            self.inner.generate_key(session, threshold, curve).await
        }

        async fn public_key(&self, key_id: &KeyId, path: &DerivationPath) -> Result<Vec<u8>> {
            self.inner.public_key(key_id, path).await
        }

        async fn partial_sign(
            &self,
            session: &crate::SigningSession,
            key_id: &KeyId,
            path: &DerivationPath,
            digest: &crate::Digest,
        ) -> Result<crate::PartialSignature> {
            self.inner.partial_sign(session, key_id, path, digest).await
        }
    }
}
