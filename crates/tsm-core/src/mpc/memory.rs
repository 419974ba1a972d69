//! In-memory relay implementation shared by co-located loopback nodes

use super::{async_trait, Relay};
use crate::{Error, PlayerId, Result, SessionId};
use dashmap::DashMap;
use serde::{de::DeserializeOwned, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// In-memory message relay
pub struct MemoryRelay {
    /// Broadcast messages: (session_id, round) -> Vec<message_bytes>
    broadcasts: Arc<DashMap<(SessionId, u32), Vec<Vec<u8>>>>,
    /// Direct messages: (session_id, round, to) -> Vec<message_bytes>
    directs: Arc<DashMap<(SessionId, u32, PlayerId), Vec<Vec<u8>>>>,
    /// When each session first posted a message
    first_seen: Arc<DashMap<SessionId, Instant>>,
    /// Notification channel
    notify: broadcast::Sender<()>,
    /// How long a collect waits before giving up
    timeout: Duration,
}

impl MemoryRelay {
    /// Create a new in-memory relay
    pub fn new() -> Self {
        let (notify, _) = broadcast::channel(100);
        Self {
            broadcasts: Arc::new(DashMap::new()),
            directs: Arc::new(DashMap::new()),
            first_seen: Arc::new(DashMap::new()),
            notify,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Set collect timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Drop every session older than `max_age`
    pub fn cleanup(&self, max_age: Duration) {
        let now = Instant::now();
        self.first_seen
            .retain(|_, seen| now.duration_since(*seen) < max_age);
        self.broadcasts
            .retain(|(sid, _), _| self.first_seen.contains_key(sid));
        self.directs
            .retain(|(sid, _, _), _| self.first_seen.contains_key(sid));
    }

    /// Number of sessions with stored messages
    pub fn pending_sessions(&self) -> usize {
        self.first_seen.len()
    }

    fn touch(&self, session_id: &SessionId) {
        self.first_seen
            .entry(*session_id)
            .or_insert_with(Instant::now);
    }

    async fn wait_for<T, F>(&self, what: String, mut ready: F) -> Result<Vec<T>>
    where
        F: FnMut() -> Option<Result<Vec<T>>>,
    {
        let mut rx = self.notify.subscribe();
        let deadline = Instant::now() + self.timeout;

        loop {
            if let Some(result) = ready() {
                return result;
            }
            if Instant::now() >= deadline {
                return Err(Error::Timeout(what));
            }

            // Wake on notification, poll again at least every 100ms
            tokio::select! {
                _ = rx.recv() => continue,
                _ = tokio::time::sleep(Duration::from_millis(100)) => continue,
            }
        }
    }
}

impl Default for MemoryRelay {
    fn default() -> Self {
        Self::new()
    }
}

fn serialize<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    serde_json::to_vec(value).map_err(|e| Error::Serialization(e.to_string()))
}

fn deserialize<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    serde_json::from_slice(bytes).map_err(|e| Error::Deserialization(e.to_string()))
}

#[async_trait]
impl Relay for MemoryRelay {
    async fn broadcast<T: Serialize + Send + Sync>(
        &self,
        session_id: &SessionId,
        round: u32,
        message: &T,
    ) -> Result<()> {
        let bytes = serialize(message)?;
        self.touch(session_id);

        self.broadcasts
            .entry((*session_id, round))
            .or_default()
            .push(bytes);

        let _ = self.notify.send(());
        Ok(())
    }

    async fn send_direct<T: Serialize + Send + Sync>(
        &self,
        session_id: &SessionId,
        round: u32,
        to: PlayerId,
        message: &T,
    ) -> Result<()> {
        let bytes = serialize(message)?;
        self.touch(session_id);

        self.directs
            .entry((*session_id, round, to))
            .or_default()
            .push(bytes);

        let _ = self.notify.send(());
        Ok(())
    }

    async fn collect_broadcasts<T: DeserializeOwned + Send>(
        &self,
        session_id: &SessionId,
        round: u32,
        count: usize,
    ) -> Result<Vec<T>> {
        let key = (*session_id, round);
        self.wait_for(
            format!("{count} broadcast messages in round {round}"),
            || {
                let messages = self.broadcasts.get(&key)?;
                if messages.len() < count {
                    return None;
                }
                let result: Result<Vec<T>> = messages
                    .iter()
                    .take(count)
                    .map(|bytes| deserialize(bytes))
                    .collect();
                Some(result)
            },
        )
        .await
    }

    async fn collect_direct<T: DeserializeOwned + Send>(
        &self,
        session_id: &SessionId,
        round: u32,
        my_id: PlayerId,
        count: usize,
    ) -> Result<Vec<T>> {
        let key = (*session_id, round, my_id);
        self.wait_for(
            format!("{count} direct messages in round {round}"),
            || {
                let messages = self.directs.get(&key)?;
                if messages.len() < count {
                    return None;
                }
                let result: Result<Vec<T>> = messages
                    .iter()
                    .take(count)
                    .map(|bytes| deserialize(bytes))
                    .collect();
                Some(result)
            },
        )
        .await
    }
}
