//! Node-to-node message relay used by the loopback participants

use crate::{PlayerId, Result, SessionId};
use serde::{de::DeserializeOwned, Serialize};

pub use ::async_trait::async_trait;

/// Message relay trait for node-to-node protocol traffic
#[async_trait]
pub trait Relay: Send + Sync {
    /// Broadcast a message to all players of the session
    async fn broadcast<T: Serialize + Send + Sync>(
        &self,
        session_id: &SessionId,
        round: u32,
        message: &T,
    ) -> Result<()>;

    /// Send a direct message to a specific player
    async fn send_direct<T: Serialize + Send + Sync>(
        &self,
        session_id: &SessionId,
        round: u32,
        to: PlayerId,
        message: &T,
    ) -> Result<()>;

    /// Collect `count` broadcast messages of a round
    async fn collect_broadcasts<T: DeserializeOwned + Send>(
        &self,
        session_id: &SessionId,
        round: u32,
        count: usize,
    ) -> Result<Vec<T>>;

    /// Collect `count` direct messages sent to `my_id`
    async fn collect_direct<T: DeserializeOwned + Send>(
        &self,
        session_id: &SessionId,
        round: u32,
        my_id: PlayerId,
        count: usize,
    ) -> Result<Vec<T>>;
}

/// In-memory relay
pub mod memory;

pub use memory::MemoryRelay;
