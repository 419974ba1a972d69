//! Deployment configuration

use crate::{Result, StakeError};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tsm_client::{ClientAuth, HttpParticipant};
use tsm_core::{DerivationPath, ParticipantEndpoint, ParticipantSet, PlayerId};

fn default_derivation_path() -> String {
    tsm_core::DEFAULT_DERIVATION_PATH.to_string()
}

fn default_key_file() -> PathBuf {
    PathBuf::from("key.txt")
}

fn default_service_url() -> String {
    "https://svc.blockdaemon.com".to_string()
}

fn default_signing_timeout() -> u64 {
    120
}

/// How the client authenticates to one participant
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ParticipantAuth {
    ApiKey { api_key: String },
    /// Client certificate; `server_certificate` is the pinned node certificate
    Mtls { server_certificate: PathBuf },
}

#[derive(Debug, Clone, Deserialize)]
pub struct ParticipantConfig {
    pub id: PlayerId,
    pub url: String,
    /// Base64 X25519 public key of the node
    pub encryption_key: String,
    pub auth: ParticipantAuth,
}

/// Everything fixed for a deployment, loaded once at startup
#[derive(Debug, Clone, Deserialize)]
pub struct DeploymentConfig {
    pub participants: Vec<ParticipantConfig>,
    /// Security threshold t, in `1..n`; any t + 1 participants can sign
    pub threshold: usize,
    #[serde(default = "default_derivation_path")]
    pub derivation_path: String,
    #[serde(default = "default_key_file")]
    pub key_file: PathBuf,
    #[serde(default = "default_service_url")]
    pub service_url: String,
    #[serde(default = "default_signing_timeout")]
    pub signing_timeout_secs: u64,
}

/// PEM client certificate and key used for mTLS participants
#[derive(Clone)]
pub struct ClientIdentity {
    pub certificate: Vec<u8>,
    pub key: Vec<u8>,
}

impl ClientIdentity {
    pub fn load(certificate: &Path, key: &Path) -> Result<Self> {
        Ok(Self {
            certificate: read(certificate, "client certificate")?,
            key: read(key, "client key")?,
        })
    }
}

fn read(path: &Path, what: &str) -> Result<Vec<u8>> {
    std::fs::read(path)
        .map_err(|e| StakeError::Config(format!("Cannot read {what} {}: {e}", path.display())))
}

impl DeploymentConfig {
    /// Read and validate a JSON deployment file
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            StakeError::Config(format!("Cannot read deployment {}: {e}", path.display()))
        })?;
        Self::from_json(&text)
    }

    pub fn from_json(text: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(text)
            .map_err(|e| StakeError::Config(format!("Invalid deployment: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.participants.len() < 2 {
            return Err(StakeError::Config(format!(
                "At least 2 participants required, got {}",
                self.participants.len()
            )));
        }

        let mut seen = HashSet::new();
        for participant in &self.participants {
            if !seen.insert(participant.id) {
                return Err(StakeError::Config(format!(
                    "Duplicate participant id {}",
                    participant.id
                )));
            }
            if participant.url.trim().is_empty() {
                return Err(StakeError::Config(format!(
                    "Participant {} has no URL",
                    participant.id
                )));
            }
            tsm_core::envelope::parse_encryption_key(&participant.encryption_key).map_err(
                |e| StakeError::Config(format!("Participant {}: {e}", participant.id)),
            )?;
        }

        if self.threshold == 0 || self.threshold >= self.participants.len() {
            return Err(StakeError::Config(format!(
                "Threshold {} out of range for {} participants",
                self.threshold,
                self.participants.len()
            )));
        }

        self.derivation_path()?;
        Ok(())
    }

    pub fn derivation_path(&self) -> Result<DerivationPath> {
        self.derivation_path
            .parse()
            .map_err(|e| StakeError::Config(format!("Derivation path: {e}")))
    }

    pub fn signing_timeout(&self) -> Duration {
        Duration::from_secs(self.signing_timeout_secs)
    }

    /// Whether any participant needs a client certificate
    pub fn requires_client_identity(&self) -> bool {
        self.participants
            .iter()
            .any(|p| matches!(p.auth, ParticipantAuth::Mtls { .. }))
    }

    /// Build HTTP endpoints for every participant
    pub fn participant_set(&self, identity: Option<&ClientIdentity>) -> Result<ParticipantSet> {
        let mut endpoints: Vec<Arc<dyn ParticipantEndpoint>> = Vec::new();
        for participant in &self.participants {
            let auth = match &participant.auth {
                ParticipantAuth::ApiKey { api_key } => ClientAuth::ApiKey(api_key.clone()),
                ParticipantAuth::Mtls { server_certificate } => {
                    let identity = identity.ok_or_else(|| {
                        StakeError::Config(format!(
                            "Participant {} uses mTLS but no client certificate was given",
                            participant.id
                        ))
                    })?;
                    ClientAuth::Mtls {
                        client_certificate: identity.certificate.clone(),
                        client_key: identity.key.clone(),
                        server_certificate: read(server_certificate, "server certificate")?,
                    }
                }
            };

            let encryption_key =
                tsm_core::envelope::parse_encryption_key(&participant.encryption_key)?;
            let endpoint =
                HttpParticipant::new(participant.id, &participant.url, encryption_key, auth)?
                    .with_timeout(self.signing_timeout());
            endpoints.push(Arc::new(endpoint));
        }
        Ok(ParticipantSet::new(endpoints)?)
    }
}
