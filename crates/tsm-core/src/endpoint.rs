//! Participant endpoints and the fan-out used to reach them

use crate::session::SessionCoordinator;
use crate::{
    Curve, DerivationPath, Digest, EncryptionKey, Error, KeyId, PartialSignature, PlayerId,
    Result, SigningSession,
};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tracing::{debug, warn};

pub use ::async_trait::async_trait;

/// One MPC node, reached over an authenticated channel
#[async_trait]
pub trait ParticipantEndpoint: Send + Sync {
    /// Player id of this node
    fn player_id(&self) -> PlayerId;

    /// Public key protocol payloads are encrypted to
    fn encryption_key(&self) -> EncryptionKey;

    /// Take part in a key-generation round and return the new key id
    async fn generate_key(
        &self,
        session: &SigningSession,
        threshold: usize,
        curve: Curve,
    ) -> Result<KeyId>;

    /// Compressed public key of the child at `path`
    async fn public_key(&self, key_id: &KeyId, path: &DerivationPath) -> Result<Vec<u8>>;

    /// Take part in a signing round and return this node's partial signature
    async fn partial_sign(
        &self,
        session: &SigningSession,
        key_id: &KeyId,
        path: &DerivationPath,
        digest: &Digest,
    ) -> Result<PartialSignature>;
}

/// The fixed set of participants of a deployment
#[derive(Clone)]
pub struct ParticipantSet {
    endpoints: BTreeMap<PlayerId, Arc<dyn ParticipantEndpoint>>,
    sessions: SessionCoordinator,
}

impl ParticipantSet {
    /// Build the set, rejecting fewer than two endpoints or repeated ids
    pub fn new(endpoints: Vec<Arc<dyn ParticipantEndpoint>>) -> Result<Self> {
        let ids: Vec<PlayerId> = endpoints.iter().map(|e| e.player_id()).collect();
        crate::session::validate_players(&ids)?;

        let manifest = endpoints
            .iter()
            .map(|e| (e.player_id(), e.encryption_key()))
            .collect();
        let endpoints = endpoints.into_iter().map(|e| (e.player_id(), e)).collect();

        Ok(Self {
            endpoints,
            sessions: SessionCoordinator::new(manifest),
        })
    }

    /// All configured player IDs, ascending
    pub fn player_ids(&self) -> Vec<PlayerId> {
        self.endpoints.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    pub fn sessions(&self) -> &SessionCoordinator {
        &self.sessions
    }

    pub(crate) fn endpoint(&self, player: PlayerId) -> Result<Arc<dyn ParticipantEndpoint>> {
        self.endpoints
            .get(&player)
            .cloned()
            .ok_or(Error::InvalidPlayerId(player))
    }

    /// Run `op` against every player concurrently and collect the results.
    ///
    /// All-or-fail: the first failing player aborts the tasks still in
    /// flight, and so does the deadline.
    pub(crate) async fn fan_out<T, F, Fut>(
        &self,
        players: &[PlayerId],
        operation: &'static str,
        deadline: Duration,
        op: F,
    ) -> Result<BTreeMap<PlayerId, T>>
    where
        T: Send + 'static,
        F: Fn(Arc<dyn ParticipantEndpoint>) -> Fut,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let results = Arc::new(Mutex::new(BTreeMap::new()));
        let mut tasks = JoinSet::new();

        for &player in players {
            let request = op(self.endpoint(player)?);
            let results = Arc::clone(&results);
            tasks.spawn(async move {
                let value = request
                    .await
                    .map_err(|e| Error::participant(player, operation, e))?;
                results.lock().await.insert(player, value);
                debug!(player, operation, "Participant responded");
                Ok::<_, Error>(())
            });
        }

        let joined = tokio::time::timeout(deadline, async {
            while let Some(joined) = tasks.join_next().await {
                joined.map_err(|e| Error::Internal(format!("{operation} task failed: {e}")))??;
            }
            Ok::<_, Error>(())
        })
        .await;

        match joined {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!(operation, error = %e, "Aborting fan-out");
                tasks.abort_all();
                return Err(e);
            }
            Err(_) => {
                warn!(operation, ?deadline, "Fan-out deadline elapsed");
                tasks.abort_all();
                return Err(Error::Timeout(format!(
                    "{operation} from {} players",
                    players.len()
                )));
            }
        }

        let mut results = results.lock().await;
        Ok(std::mem::take(&mut *results))
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scripted endpoints for exercising the fan-out paths

    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Endpoint returning canned answers and counting calls
    pub struct ScriptedEndpoint {
        pub id: PlayerId,
        pub key_id: Result<KeyId>,
        pub public_key: Vec<u8>,
        pub partial: Option<PartialSignature>,
        pub delay: Duration,
        pub calls: AtomicUsize,
        pub sessions: std::sync::Mutex<Vec<SigningSession>>,
    }

    impl ScriptedEndpoint {
        pub fn new(id: PlayerId) -> Self {
            Self {
                id,
                key_id: Ok(KeyId::new("key-1")),
                public_key: vec![2u8; 33],
                partial: None,
                delay: Duration::ZERO,
                calls: AtomicUsize::new(0),
                sessions: std::sync::Mutex::new(Vec::new()),
            }
        }

        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        fn record(&self, session: Option<&SigningSession>) {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(session) = session {
                self.sessions.lock().unwrap().push(session.clone());
            }
        }
    }

    #[async_trait]
    impl ParticipantEndpoint for ScriptedEndpoint {
        fn player_id(&self) -> PlayerId {
            self.id
        }

        fn encryption_key(&self) -> EncryptionKey {
            [self.id as u8; 32]
        }

        async fn generate_key(
            &self,
            session: &SigningSession,
            _threshold: usize,
            _curve: Curve,
        ) -> Result<KeyId> {
            self.record(Some(session));
            tokio::time::sleep(self.delay).await;
            match &self.key_id {
                Ok(id) => Ok(id.clone()),
                Err(e) => Err(Error::Endpoint(e.to_string())),
            }
        }

        async fn public_key(&self, _key_id: &KeyId, _path: &DerivationPath) -> Result<Vec<u8>> {
            self.record(None);
            tokio::time::sleep(self.delay).await;
            Ok(self.public_key.clone())
        }

        async fn partial_sign(
            &self,
            session: &SigningSession,
            _key_id: &KeyId,
            _path: &DerivationPath,
            _digest: &Digest,
        ) -> Result<PartialSignature> {
            self.record(Some(session));
            tokio::time::sleep(self.delay).await;
            self.partial
                .clone()
                .ok_or_else(|| Error::Endpoint(format!("player {} refused to sign", self.id)))
        }
    }
}
