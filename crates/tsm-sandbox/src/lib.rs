//! TSM Sandbox
//!
//! Local development cluster: one HTTP server per player on consecutive
//! ports, each backed by a [`LoopbackNode`] sharing a single in-memory
//! relay. The nodes reveal signing nonces to each other, so the sandbox
//! must never hold real funds.

use axum::{
    extract::{Path, Request, State},
    http::StatusCode,
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use base64::{engine::general_purpose::STANDARD, Engine};
use rand::rngs::OsRng;
use serde::de::DeserializeOwned;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use subtle::ConstantTimeEq;
use thiserror::Error;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tsm_core::endpoint::ParticipantEndpoint;
use tsm_core::envelope::{open, Envelope};
use tsm_core::mpc::MemoryRelay;
use tsm_core::wire::{
    ErrorResponse, KeygenPayload, KeygenResponse, PublicKeyRequest, PublicKeyResponse,
    SignPayload, SignResponse, KEYGEN_CONTEXT, SIGN_CONTEXT,
};
use tsm_core::{DerivationPath, EncryptionKey, Error, KeyId, LoopbackNode, PlayerId};
use x25519_dalek::{PublicKey, StaticSecret};

/// Header carrying the API key
pub const API_KEY_HEADER: &str = "X-API-Key";

/// Sandbox errors
#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("Invalid sandbox configuration: {0}")]
    Config(String),
    #[error("Binding {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
}

/// State of one node's HTTP server
pub struct NodeState {
    node: LoopbackNode<MemoryRelay>,
    secret: StaticSecret,
    api_key: String,
}

impl NodeState {
    /// Create a node with a fresh encryption key pair
    pub fn new(player_id: PlayerId, relay: Arc<MemoryRelay>, api_key: impl Into<String>) -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let encryption_key = PublicKey::from(&secret).to_bytes();
        Self {
            node: LoopbackNode::new(player_id, encryption_key, relay),
            secret,
            api_key: api_key.into(),
        }
    }

    pub fn player_id(&self) -> PlayerId {
        self.node.player_id()
    }

    pub fn encryption_key(&self) -> EncryptionKey {
        self.node.encryption_key()
    }
}

/// Error answer of the node API
pub struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            Error::KeyNotFound(_) => StatusCode::NOT_FOUND,
            Error::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Error::InvalidConfig(_)
            | Error::ThresholdNotMet { .. }
            | Error::InvalidPlayerId(_)
            | Error::DuplicatePlayer(_)
            | Error::VerificationFailed(_)
            | Error::Deserialization(_)
            | Error::Derivation(_)
            | Error::Crypto(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        warn!(status = %status, error = %self.0, "Request failed");
        let body = ErrorResponse {
            error: self.0.to_string(),
            retryable: self.0.is_retryable(),
        };
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = std::result::Result<Json<T>, ApiError>;

/// Router of one node
pub fn router(state: Arc<NodeState>) -> Router {
    let protected = Router::new()
        .route("/v1/ecdsa/keys", post(generate_key))
        .route("/v1/ecdsa/keys/:key_id/public-key", post(public_key))
        .route("/v1/ecdsa/sign", post(partial_sign))
        .route_layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            require_api_key,
        ));

    Router::new()
        .route("/health", get(health))
        .merge(protected)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Reject requests without the node's API key
async fn require_api_key(
    State(state): State<Arc<NodeState>>,
    request: Request,
    next: Next,
) -> Response {
    let presented = request
        .headers()
        .get(API_KEY_HEADER)
        .map(|value| value.as_bytes())
        .unwrap_or_default();

    if !bool::from(presented.ct_eq(state.api_key.as_bytes())) {
        let body = ErrorResponse {
            error: "Missing or invalid API key".into(),
            retryable: false,
        };
        return (StatusCode::UNAUTHORIZED, Json(body)).into_response();
    }

    next.run(request).await
}

async fn health(State(state): State<Arc<NodeState>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "tsm-sandbox",
        "player_id": state.player_id(),
        "keys": state.node.key_count(),
        "version": env!("CARGO_PKG_VERSION")
    }))
}

fn open_payload<T: DeserializeOwned>(
    state: &NodeState,
    context: &str,
    envelope: &Envelope,
) -> tsm_core::Result<T> {
    let plaintext = open(&state.secret, context, envelope)?;
    serde_json::from_slice(&plaintext).map_err(|e| Error::Deserialization(e.to_string()))
}

async fn generate_key(
    State(state): State<Arc<NodeState>>,
    Json(envelope): Json<Envelope>,
) -> ApiResult<KeygenResponse> {
    let payload: KeygenPayload = open_payload(&state, KEYGEN_CONTEXT, &envelope)?;
    let key_id = state
        .node
        .generate_key(&payload.session, payload.threshold, payload.curve)
        .await?;

    info!(player_id = state.player_id(), key_id = %key_id, "Key generated");
    Ok(Json(KeygenResponse { key_id }))
}

async fn public_key(
    State(state): State<Arc<NodeState>>,
    Path(key_id): Path<String>,
    Json(request): Json<PublicKeyRequest>,
) -> ApiResult<PublicKeyResponse> {
    let path: DerivationPath = request.path.parse()?;
    let public_key = state.node.public_key(&KeyId::new(key_id), &path).await?;

    Ok(Json(PublicKeyResponse {
        public_key: hex::encode(public_key),
    }))
}

async fn partial_sign(
    State(state): State<Arc<NodeState>>,
    Json(envelope): Json<Envelope>,
) -> ApiResult<SignResponse> {
    let payload: SignPayload = open_payload(&state, SIGN_CONTEXT, &envelope)?;
    let path: DerivationPath = payload.path.parse()?;
    let partial = state
        .node
        .partial_sign(&payload.session, &payload.key_id, &path, &payload.digest)
        .await?;

    Ok(Json(SignResponse {
        partial_signature: STANDARD.encode(partial.as_bytes()),
    }))
}

/// Settings of a sandbox cluster
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// Number of players
    pub players: usize,
    /// Host to bind
    pub host: String,
    /// Port of player 0; player i listens on `base_port + i`. Zero picks free ports.
    pub base_port: u16,
    /// API key every node expects
    pub api_key: String,
    /// How long a node waits for its peers' messages
    pub relay_timeout: Duration,
    /// How long relay messages of a session are kept
    pub session_ttl: Duration,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            players: 3,
            host: "127.0.0.1".into(),
            base_port: 8500,
            api_key: "sandbox".into(),
            relay_timeout: Duration::from_secs(30),
            session_ttl: Duration::from_secs(600),
        }
    }
}

/// Address book entry of a running node
#[derive(Debug, Clone)]
pub struct ClusterMember {
    pub player_id: PlayerId,
    pub url: String,
    pub encryption_key: EncryptionKey,
}

/// A running sandbox cluster; dropping it stops every server
pub struct Cluster {
    members: Vec<ClusterMember>,
    relay: Arc<MemoryRelay>,
    tasks: Vec<JoinHandle<()>>,
}

impl Cluster {
    /// Bind every node and start serving
    pub async fn start(config: &ClusterConfig) -> Result<Self, SandboxError> {
        if config.players < 2 {
            return Err(SandboxError::Config(format!(
                "At least two players are required, got {}",
                config.players
            )));
        }

        let relay = Arc::new(MemoryRelay::new().with_timeout(config.relay_timeout));
        let mut members = Vec::with_capacity(config.players);
        let mut tasks = Vec::with_capacity(config.players + 1);

        for player_id in 0..config.players {
            let port = if config.base_port == 0 {
                0
            } else {
                u16::try_from(player_id)
                    .ok()
                    .and_then(|offset| config.base_port.checked_add(offset))
                    .ok_or_else(|| {
                        SandboxError::Config(format!("No port left for player {player_id}"))
                    })?
            };
            let addr = format!("{}:{port}", config.host);
            let listener = tokio::net::TcpListener::bind(&addr)
                .await
                .map_err(|source| SandboxError::Bind {
                    addr: addr.clone(),
                    source,
                })?;
            let local: SocketAddr = listener
                .local_addr()
                .map_err(|source| SandboxError::Bind { addr, source })?;

            let state = Arc::new(NodeState::new(
                player_id,
                Arc::clone(&relay),
                config.api_key.clone(),
            ));
            members.push(ClusterMember {
                player_id,
                url: format!("http://{local}"),
                encryption_key: state.encryption_key(),
            });

            let app = router(state);
            tasks.push(tokio::spawn(async move {
                if let Err(e) = axum::serve(listener, app).await {
                    warn!(player_id, error = %e, "Node server stopped");
                }
            }));
            info!(player_id, address = %local, "Node listening");
        }

        // Spawn cleanup task
        let cleanup_relay = Arc::clone(&relay);
        let ttl = config.session_ttl;
        tasks.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(60));
            loop {
                interval.tick().await;
                cleanup_relay.cleanup(ttl);
            }
        }));

        Ok(Self {
            members,
            relay,
            tasks,
        })
    }

    pub fn members(&self) -> &[ClusterMember] {
        &self.members
    }

    /// Sessions still held by the shared relay
    pub fn pending_sessions(&self) -> usize {
        self.relay.pending_sessions()
    }

    /// Participant entries for a deployment configuration
    pub fn deployment_participants(&self, api_key: &str) -> serde_json::Value {
        let participants: Vec<_> = self
            .members
            .iter()
            .map(|member| {
                serde_json::json!({
                    "id": member.player_id,
                    "url": member.url,
                    "encryption_key": tsm_core::envelope::encode_encryption_key(&member.encryption_key),
                    "auth": { "type": "api_key", "api_key": api_key },
                })
            })
            .collect();
        serde_json::Value::Array(participants)
    }

    /// Stop every server
    pub fn shutdown(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

impl Drop for Cluster {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::Request as HttpRequest;
    use tower::ServiceExt;
    use tsm_core::envelope::seal;
    use tsm_core::SigningSession;

    fn state() -> Arc<NodeState> {
        Arc::new(NodeState::new(0, Arc::new(MemoryRelay::new()), "secret"))
    }

    async fn json_body(response: Response) -> serde_json::Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn post_json(uri: &str, api_key: Option<&str>, body: &impl serde::Serialize) -> HttpRequest<Body> {
        let mut builder = HttpRequest::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json");
        if let Some(key) = api_key {
            builder = builder.header(API_KEY_HEADER, key);
        }
        builder
            .body(Body::from(serde_json::to_vec(body).unwrap()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_health_needs_no_key() {
        let response = router(state())
            .oneshot(HttpRequest::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["status"], "ok");
        assert_eq!(body["keys"], 0);
    }

    #[tokio::test]
    async fn test_rejects_missing_or_wrong_key() {
        let request = PublicKeyRequest {
            path: "m/44/60".into(),
        };

        for key in [None, Some("wrong"), Some("")] {
            let response = router(state())
                .oneshot(post_json("/v1/ecdsa/keys/k/public-key", key, &request))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        }
    }

    #[tokio::test]
    async fn test_unknown_key_is_not_found() {
        let response = router(state())
            .oneshot(post_json(
                "/v1/ecdsa/keys/missing/public-key",
                Some("secret"),
                &PublicKeyRequest {
                    path: "m/44/60".into(),
                },
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body = json_body(response).await;
        assert_eq!(body["retryable"], false);
    }

    #[tokio::test]
    async fn test_envelope_for_another_node_is_rejected() {
        let state = state();
        let session = SigningSession {
            session_id: [1u8; 32],
            players: vec![0, 1],
            encryption_keys: [(0, state.encryption_key()), (1, [1u8; 32])]
                .into_iter()
                .collect(),
        };
        let payload = serde_json::to_vec(&KeygenPayload {
            session,
            threshold: 1,
            curve: tsm_core::Curve::Secp256k1,
        })
        .unwrap();
        let envelope = seal(&[7u8; 32], KEYGEN_CONTEXT, &payload).unwrap();

        let response = router(Arc::clone(&state))
            .oneshot(post_json("/v1/ecdsa/keys", Some("secret"), &envelope))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(state.node.key_count(), 0);
    }

    #[tokio::test]
    async fn test_cluster_binds_every_player() {
        let config = ClusterConfig {
            players: 3,
            base_port: 0,
            ..ClusterConfig::default()
        };
        let mut cluster = Cluster::start(&config).await.unwrap();

        assert_eq!(cluster.members().len(), 3);
        let ids: Vec<_> = cluster.members().iter().map(|m| m.player_id).collect();
        assert_eq!(ids, vec![0, 1, 2]);
        assert_ne!(
            cluster.members()[0].encryption_key,
            cluster.members()[1].encryption_key
        );

        let participants = cluster.deployment_participants("sandbox");
        assert_eq!(participants[2]["id"], 2);
        assert_eq!(participants[0]["auth"]["type"], "api_key");
        assert_eq!(cluster.pending_sessions(), 0);

        cluster.shutdown();
    }

    #[tokio::test]
    async fn test_cluster_needs_two_players() {
        let config = ClusterConfig {
            players: 1,
            base_port: 0,
            ..ClusterConfig::default()
        };

        assert!(matches!(
            Cluster::start(&config).await,
            Err(SandboxError::Config(_))
        ));
    }
}
