//! # TSM Core
//!
//! Coordination layer for threshold ECDSA signing with a set of MPC nodes.
//!
//! This crate provides:
//! - Session coordination (fresh session ids, participant manifests)
//! - Master key creation and cross-validated public key derivation
//! - Concurrent partial signing with all-or-fail semantics
//! - Combination of partial signatures into a recoverable ECDSA signature
//!
//! The MPC nodes themselves sit behind the [`ParticipantEndpoint`] trait.
//! [`LoopbackNode`] implements it in-process for development and tests.
//!
//! ## Example
//!
//! ```rust,ignore
//! use tsm_core::{Curve, FileKeyStore, KeyManager, ParticipantSet, SignatureAggregator};
//!
//! let participants = ParticipantSet::new(endpoints)?;
//! let keys = KeyManager::new(participants.clone(), FileKeyStore::new("key.txt"));
//!
//! let master = keys.get_or_create_master_key(1, Curve::Secp256k1).await?;
//! let derived = keys.derive_public_key(&master, &"m/44/60".parse()?).await?;
//!
//! let signature = SignatureAggregator::new(participants)
//!     .sign(&derived, &digest, &[0, 2])
//!     .await?;
//! ```

pub mod address;
pub mod aggregator;
pub mod combine;
pub mod endpoint;
pub mod envelope;
pub mod error;
pub mod key_manager;
pub mod keystore;
pub mod loopback;
pub mod mpc;
pub mod session;
pub mod types;
pub mod wire;

pub use aggregator::SignatureAggregator;
pub use endpoint::{ParticipantEndpoint, ParticipantSet};
pub use error::{Error, Result};
pub use key_manager::KeyManager;
pub use keystore::{FileKeyStore, KeyStore, MemoryKeyStore};
pub use loopback::LoopbackNode;
pub use session::{SessionCoordinator, SigningSession};
pub use types::{
    Curve, DerivationPath, DerivedKey, Digest, EncryptionKey, FinalSignature, KeyId, MasterKey,
    PartialSignature, PlayerId, PublicKey, SessionId, HARDENED_BIT,
};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Derivation path of the staking account
pub const DEFAULT_DERIVATION_PATH: &str = "m/44/60";
