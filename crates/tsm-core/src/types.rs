//! Core types shared by the key manager, aggregator and participant endpoints

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Identifier of a participant (MPC node) in the deployment
pub type PlayerId = usize;

/// Unique identifier for a protocol round
pub type SessionId = [u8; 32];

/// X25519 public key used to encrypt protocol payloads to a participant
pub type EncryptionKey = [u8; 32];

/// Compressed SEC1 public key bytes
pub type PublicKey = [u8; 33];

/// Signing digest of a transaction
pub type Digest = [u8; 32];

/// Bit set on hardened derivation indices
pub const HARDENED_BIT: u32 = 0x8000_0000;

/// Opaque identifier of a distributed master key
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct KeyId(String);

impl KeyId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Curve of a master key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Curve {
    #[default]
    Secp256k1,
}

impl Curve {
    /// Canonical curve name used on the wire
    pub fn name(&self) -> &'static str {
        match self {
            Curve::Secp256k1 => "secp256k1",
        }
    }
}

impl fmt::Display for Curve {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A distributed key whose shares are held one per participant.
///
/// Only the id outlives a process; threshold and curve come from the
/// deployment configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MasterKey {
    /// Key id agreed by every participant
    pub id: KeyId,
    /// Security threshold t: up to t colluding participants learn nothing,
    /// and any t + 1 of them can sign
    pub threshold: usize,
    /// Curve of the key
    pub curve: Curve,
}

/// Hierarchical derivation path of a child key, e.g. `m/44/60`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DerivationPath(Vec<u32>);

impl DerivationPath {
    pub fn new(indices: Vec<u32>) -> Self {
        Self(indices)
    }

    /// Raw indices, hardened ones carrying [`HARDENED_BIT`]
    pub fn indices(&self) -> &[u32] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromStr for DerivationPath {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        use derivation_path::ChildIndex;

        let parsed: derivation_path::DerivationPath = s
            .trim()
            .parse()
            .map_err(|e| Error::Derivation(format!("Invalid path {s:?}: {e:?}")))?;

        let indices = parsed
            .path()
            .iter()
            .map(|child| match child {
                ChildIndex::Normal(index) => *index,
                ChildIndex::Hardened(index) => *index | HARDENED_BIT,
            })
            .collect();

        Ok(Self(indices))
    }
}

impl fmt::Display for DerivationPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("m")?;
        for index in &self.0 {
            if index & HARDENED_BIT != 0 {
                write!(f, "/{}'", index & !HARDENED_BIT)?;
            } else {
                write!(f, "/{index}")?;
            }
        }
        Ok(())
    }
}

/// A child public key every participant agreed on, with its address
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DerivedKey {
    /// Master key the child belongs to
    pub master: MasterKey,
    /// Derivation path used for both public-key derivation and signing
    pub path: DerivationPath,
    /// Agreed compressed public key
    pub public_key: PublicKey,
    /// Ethereum address of the public key
    pub address: [u8; 20],
}

impl DerivedKey {
    /// Address as `0x`-prefixed lowercase hex
    pub fn address_hex(&self) -> String {
        format!("0x{}", hex::encode(self.address))
    }
}

/// One participant's contribution to a threshold signature
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartialSignature(Vec<u8>);

impl PartialSignature {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }
}

/// Final ECDSA signature (r, s, recovery id)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FinalSignature {
    /// R component
    pub r: [u8; 32],
    /// S component (low-s)
    pub s: [u8; 32],
    /// Recovery ID
    pub recovery_id: u8,
}

impl FinalSignature {
    /// Length of the `r || s || v` layout
    pub const LEN: usize = 65;

    /// Create a new signature
    pub fn new(r: [u8; 32], s: [u8; 32], recovery_id: u8) -> Self {
        Self { r, s, recovery_id }
    }

    /// Convert to bytes (r || s || v)
    pub fn to_bytes(&self) -> [u8; 65] {
        let mut bytes = [0u8; 65];
        bytes[..32].copy_from_slice(&self.r);
        bytes[32..64].copy_from_slice(&self.s);
        bytes[64] = self.recovery_id;
        bytes
    }

    /// Parse the `r || s || v` layout
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != Self::LEN {
            return Err(Error::Deserialization(format!(
                "Signature must be {} bytes, got {}",
                Self::LEN,
                bytes.len()
            )));
        }
        let recovery_id = bytes[64];
        if recovery_id > 3 {
            return Err(Error::Deserialization(format!(
                "Recovery id out of range: {recovery_id}"
            )));
        }

        let mut r = [0u8; 32];
        let mut s = [0u8; 32];
        r.copy_from_slice(&bytes[..32]);
        s.copy_from_slice(&bytes[32..64]);
        Ok(Self::new(r, s, recovery_id))
    }
}

/// Serde helper for fixed-size byte arrays as hex strings
pub(crate) mod hex_array {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S, const N: usize>(bytes: &[u8; N], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D, const N: usize>(deserializer: D) -> Result<[u8; N], D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        let bytes = hex::decode(s.trim_start_matches("0x")).map_err(serde::de::Error::custom)?;
        bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom(format!("expected {N} bytes")))
    }
}
