//! TSM Client
//!
//! HTTP implementation of [`ParticipantEndpoint`] for remote MPC nodes.
//! Key generation and signing payloads are sealed to the node's
//! encryption key; the transport is authenticated either with an API key
//! or with a client certificate against a pinned server certificate.

use reqwest::{Certificate, Client, Identity, StatusCode};
use serde::{de::DeserializeOwned, Serialize};
use std::time::Duration;
use tracing::{debug, instrument};
use tsm_core::endpoint::{async_trait, ParticipantEndpoint};
use tsm_core::envelope::seal;
use tsm_core::wire::{
    ErrorResponse, KeygenPayload, KeygenResponse, PublicKeyRequest, PublicKeyResponse,
    SignPayload, SignResponse, KEYGEN_CONTEXT, SIGN_CONTEXT,
};
use tsm_core::{
    Curve, DerivationPath, Digest, EncryptionKey, Error, KeyId, PartialSignature, PlayerId,
    Result, SigningSession,
};

/// Header carrying the API key
pub const API_KEY_HEADER: &str = "X-API-Key";

/// How a node authenticates this client
#[derive(Clone)]
pub enum ClientAuth {
    /// Shared API key sent with every request
    ApiKey(String),
    /// Client certificate, with the node's certificate pinned as sole trust root
    Mtls {
        client_certificate: Vec<u8>,
        client_key: Vec<u8>,
        server_certificate: Vec<u8>,
    },
}

impl std::fmt::Debug for ClientAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClientAuth::ApiKey(_) => f.write_str("ApiKey(..)"),
            ClientAuth::Mtls { .. } => f.write_str("Mtls { .. }"),
        }
    }
}

/// One remote MPC node reached over HTTP
pub struct HttpParticipant {
    /// HTTP client
    client: Client,
    /// Node base URL
    url: String,
    /// Node's player ID
    player_id: PlayerId,
    /// Node's payload encryption key
    encryption_key: EncryptionKey,
    /// API key, when not using mTLS
    api_key: Option<String>,
    /// Request timeout
    timeout: Duration,
}

impl HttpParticipant {
    /// Create a client for the node at `url`
    pub fn new(
        player_id: PlayerId,
        url: &str,
        encryption_key: EncryptionKey,
        auth: ClientAuth,
    ) -> Result<Self> {
        let (client, api_key) = match auth {
            ClientAuth::ApiKey(key) => (Client::new(), Some(key)),
            ClientAuth::Mtls {
                client_certificate,
                client_key,
                server_certificate,
            } => {
                let identity = Identity::from_pkcs8_pem(&client_certificate, &client_key)
                    .map_err(|e| Error::InvalidConfig(format!("Client identity: {e}")))?;
                let pinned = Certificate::from_pem(&server_certificate)
                    .map_err(|e| Error::InvalidConfig(format!("Server certificate: {e}")))?;
                let client = Client::builder()
                    .identity(identity)
                    .add_root_certificate(pinned)
                    .tls_built_in_root_certs(false)
                    .build()
                    .map_err(|e| Error::InvalidConfig(format!("TLS client: {e}")))?;
                (client, None)
            }
        };

        Ok(Self {
            client,
            url: url.trim_end_matches('/').to_string(),
            player_id,
            encryption_key,
            api_key,
            timeout: Duration::from_secs(60),
        })
    }

    /// Set request timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Check the node answers its health route
    pub async fn health(&self) -> Result<()> {
        let response = self
            .authorize(self.client.get(format!("{}/health", self.url)))
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| Error::Endpoint(e.to_string()))?;

        if !response.status().is_success() {
            return Err(Error::Endpoint(format!(
                "Health check failed with status: {}",
                response.status()
            )));
        }
        Ok(())
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => request.header(API_KEY_HEADER, key),
            None => request,
        }
    }

    /// POST a JSON body and decode the JSON answer
    async fn post<B, T>(&self, route: &str, body: &B) -> Result<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let response = self
            .authorize(self.client.post(format!("{}{route}", self.url)))
            .json(body)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| Error::Endpoint(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(remote_error(status, &body));
        }

        response
            .json()
            .await
            .map_err(|e| Error::Deserialization(e.to_string()))
    }

    /// Seal `payload` to this node and POST it
    async fn post_sealed<P, T>(&self, route: &str, context: &str, payload: &P) -> Result<T>
    where
        P: Serialize,
        T: DeserializeOwned,
    {
        let plaintext = serde_json::to_vec(payload)?;
        let envelope = seal(&self.encryption_key, context, &plaintext)?;
        self.post(route, &envelope).await
    }
}

/// Map a non-2xx answer to an error, keeping the node's message
fn remote_error(status: StatusCode, body: &str) -> Error {
    let parsed: Option<ErrorResponse> = serde_json::from_str(body).ok();
    let message = parsed
        .as_ref()
        .map(|e| e.error.clone())
        .unwrap_or_else(|| body.to_string());
    let retryable = parsed.map(|e| e.retryable).unwrap_or(true);

    match status {
        StatusCode::NOT_FOUND => Error::KeyNotFound(message),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            Error::InvalidConfig(format!("Node refused credentials ({status}): {message}"))
        }
        s if s.is_client_error() && !retryable => {
            Error::InvalidConfig(format!("Request rejected ({s}): {message}"))
        }
        s => Error::Endpoint(format!("{s}: {message}")),
    }
}

#[async_trait]
impl ParticipantEndpoint for HttpParticipant {
    fn player_id(&self) -> PlayerId {
        self.player_id
    }

    fn encryption_key(&self) -> EncryptionKey {
        self.encryption_key
    }

    #[instrument(skip(self, session), fields(player_id = self.player_id, session_id = %session.id_hex()))]
    async fn generate_key(
        &self,
        session: &SigningSession,
        threshold: usize,
        curve: Curve,
    ) -> Result<KeyId> {
        let payload = KeygenPayload {
            session: session.clone(),
            threshold,
            curve,
        };
        let response: KeygenResponse = self
            .post_sealed("/v1/ecdsa/keys", KEYGEN_CONTEXT, &payload)
            .await?;

        debug!(key_id = %response.key_id, "Node generated key");
        Ok(response.key_id)
    }

    async fn public_key(&self, key_id: &KeyId, path: &DerivationPath) -> Result<Vec<u8>> {
        let response: PublicKeyResponse = self
            .post(
                &format!("/v1/ecdsa/keys/{key_id}/public-key"),
                &PublicKeyRequest {
                    path: path.to_string(),
                },
            )
            .await?;

        hex::decode(response.public_key.trim_start_matches("0x"))
            .map_err(|e| Error::Deserialization(format!("Public key: {e}")))
    }

    #[instrument(skip(self, session, digest), fields(player_id = self.player_id, session_id = %session.id_hex()))]
    async fn partial_sign(
        &self,
        session: &SigningSession,
        key_id: &KeyId,
        path: &DerivationPath,
        digest: &Digest,
    ) -> Result<PartialSignature> {
        use base64::{engine::general_purpose::STANDARD, Engine};

        let payload = SignPayload {
            session: session.clone(),
            key_id: key_id.clone(),
            path: path.to_string(),
            digest: *digest,
        };
        let response: SignResponse = self
            .post_sealed("/v1/ecdsa/sign", SIGN_CONTEXT, &payload)
            .await?;

        let bytes = STANDARD
            .decode(&response.partial_signature)
            .map_err(|e| Error::Deserialization(format!("Partial signature: {e}")))?;
        debug!(len = bytes.len(), "Received partial signature");
        Ok(PartialSignature::new(bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        extract::{Path, State},
        http::{HeaderMap, StatusCode as AxumStatus},
        routing::post,
        Json, Router,
    };
    use rand::rngs::OsRng;
    use std::sync::Arc;
    use tsm_core::envelope::open;
    use tsm_core::wire::Envelope;
    use x25519_dalek::{PublicKey, StaticSecret};

    struct MockNode {
        secret: StaticSecret,
        api_key: String,
    }

    fn authorized(node: &MockNode, headers: &HeaderMap) -> bool {
        headers
            .get(API_KEY_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(|v| v == node.api_key)
            .unwrap_or(false)
    }

    async fn keygen(
        State(node): State<Arc<MockNode>>,
        headers: HeaderMap,
        Json(envelope): Json<Envelope>,
    ) -> (AxumStatus, Json<serde_json::Value>) {
        if !authorized(&node, &headers) {
            return (
                AxumStatus::UNAUTHORIZED,
                Json(serde_json::json!({ "error": "bad api key" })),
            );
        }
        let plaintext = open(&node.secret, KEYGEN_CONTEXT, &envelope).unwrap();
        let payload: KeygenPayload = serde_json::from_slice(&plaintext).unwrap();
        (
            AxumStatus::OK,
            Json(serde_json::json!({ "key_id": format!("key-t{}", payload.threshold) })),
        )
    }

    async fn public_key(
        Path(key_id): Path<String>,
        Json(request): Json<PublicKeyRequest>,
    ) -> (AxumStatus, Json<serde_json::Value>) {
        if key_id != "key-t1" {
            return (
                AxumStatus::NOT_FOUND,
                Json(serde_json::json!({ "error": format!("unknown key {key_id}") })),
            );
        }
        assert_eq!(request.path, "m/44/60");
        (
            AxumStatus::OK,
            Json(serde_json::json!({ "public_key": hex::encode([2u8; 33]) })),
        )
    }

    async fn sign(
        State(node): State<Arc<MockNode>>,
        Json(envelope): Json<Envelope>,
    ) -> (AxumStatus, Json<serde_json::Value>) {
        use base64::{engine::general_purpose::STANDARD, Engine};

        let plaintext = open(&node.secret, SIGN_CONTEXT, &envelope).unwrap();
        let payload: SignPayload = serde_json::from_slice(&plaintext).unwrap();
        (
            AxumStatus::OK,
            Json(serde_json::json!({ "partial_signature": STANDARD.encode(payload.digest) })),
        )
    }

    async fn spawn_mock() -> (String, EncryptionKey) {
        let secret = StaticSecret::random_from_rng(OsRng);
        let encryption_key = PublicKey::from(&secret).to_bytes();
        let state = Arc::new(MockNode {
            secret,
            api_key: "node-key".into(),
        });

        let app = Router::new()
            .route("/v1/ecdsa/keys", post(keygen))
            .route("/v1/ecdsa/keys/:key_id/public-key", post(public_key))
            .route("/v1/ecdsa/sign", post(sign))
            .with_state(state);

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        (format!("http://{addr}"), encryption_key)
    }

    fn session() -> SigningSession {
        SigningSession {
            session_id: [4u8; 32],
            players: vec![0, 1],
            encryption_keys: [(0, [0u8; 32]), (1, [1u8; 32])].into_iter().collect(),
        }
    }

    #[tokio::test]
    async fn test_sealed_requests_reach_node() {
        let (url, encryption_key) = spawn_mock().await;
        let client =
            HttpParticipant::new(0, &url, encryption_key, ClientAuth::ApiKey("node-key".into()))
                .unwrap();

        let key_id = client
            .generate_key(&session(), 1, Curve::Secp256k1)
            .await
            .unwrap();
        assert_eq!(key_id, KeyId::new("key-t1"));

        let partial = client
            .partial_sign(&session(), &key_id, &"m/44/60".parse().unwrap(), &[6u8; 32])
            .await
            .unwrap();
        assert_eq!(partial.as_bytes(), &[6u8; 32]);
    }

    #[tokio::test]
    async fn test_public_key_and_missing_key() {
        let (url, encryption_key) = spawn_mock().await;
        let client =
            HttpParticipant::new(1, &url, encryption_key, ClientAuth::ApiKey("node-key".into()))
                .unwrap();
        let path: DerivationPath = "m/44/60".parse().unwrap();

        let key = client.public_key(&KeyId::new("key-t1"), &path).await.unwrap();
        assert_eq!(key, vec![2u8; 33]);

        let missing = client.public_key(&KeyId::new("other"), &path).await;
        assert!(matches!(missing, Err(Error::KeyNotFound(_))));
    }

    #[tokio::test]
    async fn test_wrong_api_key_is_rejected() {
        let (url, encryption_key) = spawn_mock().await;
        let client =
            HttpParticipant::new(0, &url, encryption_key, ClientAuth::ApiKey("wrong".into()))
                .unwrap();

        let result = client.generate_key(&session(), 1, Curve::Secp256k1).await;

        match result {
            Err(e @ Error::InvalidConfig(_)) => assert!(!e.is_retryable()),
            other => panic!("expected credential rejection, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unreachable_node() {
        let client = HttpParticipant::new(
            0,
            "http://127.0.0.1:9/",
            [0u8; 32],
            ClientAuth::ApiKey("k".into()),
        )
        .unwrap()
        .with_timeout(Duration::from_secs(2));

        assert_eq!(client.url(), "http://127.0.0.1:9");
        let result = client.health().await;
        assert!(matches!(result, Err(Error::Endpoint(_))));
    }

    #[test]
    fn test_invalid_mtls_material() {
        let result = HttpParticipant::new(
            0,
            "https://node.example",
            [0u8; 32],
            ClientAuth::Mtls {
                client_certificate: b"not a cert".to_vec(),
                client_key: b"not a key".to_vec(),
                server_certificate: b"not a cert".to_vec(),
            },
        );

        assert!(matches!(result, Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_remote_error_mapping() {
        assert!(matches!(
            remote_error(StatusCode::BAD_REQUEST, r#"{"error":"bad session","retryable":false}"#),
            Error::InvalidConfig(_)
        ));
        assert!(matches!(
            remote_error(StatusCode::INTERNAL_SERVER_ERROR, "oops"),
            Error::Endpoint(_)
        ));
        assert!(matches!(
            remote_error(StatusCode::NOT_FOUND, r#"{"error":"no key"}"#),
            Error::KeyNotFound(m) if m == "no key"
        ));
    }
}
