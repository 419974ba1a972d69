//! Key generation, derivation and signing against a running sandbox

use futures_util::future::try_join_all;
use std::sync::Arc;
use std::time::Duration;
use tsm_client::{ClientAuth, HttpParticipant};
use tsm_core::{
    address::keccak256, combine, Curve, Error, FileKeyStore, KeyManager, KeyStore,
    ParticipantEndpoint, ParticipantSet, SignatureAggregator,
};
use tsm_sandbox::{Cluster, ClusterConfig};

async fn start(players: usize) -> Cluster {
    let config = ClusterConfig {
        players,
        base_port: 0,
        api_key: "it-key".into(),
        relay_timeout: Duration::from_secs(5),
        ..ClusterConfig::default()
    };
    Cluster::start(&config).await.unwrap()
}

fn clients(cluster: &Cluster, api_key: &str) -> Vec<Arc<HttpParticipant>> {
    cluster
        .members()
        .iter()
        .map(|member| {
            Arc::new(
                HttpParticipant::new(
                    member.player_id,
                    &member.url,
                    member.encryption_key,
                    ClientAuth::ApiKey(api_key.into()),
                )
                .unwrap(),
            )
        })
        .collect()
}

fn participant_set(clients: &[Arc<HttpParticipant>]) -> ParticipantSet {
    ParticipantSet::new(
        clients
            .iter()
            .map(|c| Arc::clone(c) as Arc<dyn ParticipantEndpoint>)
            .collect(),
    )
    .unwrap()
}

#[tokio::test]
async fn test_sign_over_http() {
    let cluster = start(3).await;
    let clients = clients(&cluster, "it-key");
    try_join_all(clients.iter().map(|c| c.health())).await.unwrap();

    let key_file = std::env::temp_dir().join(format!("tsm-key-{}.txt", uuid::Uuid::new_v4()));
    let set = participant_set(&clients);
    let manager = KeyManager::new(set.clone(), FileKeyStore::new(&key_file));

    let master = manager
        .get_or_create_master_key(1, Curve::Secp256k1)
        .await
        .unwrap();
    assert_eq!(
        std::fs::read_to_string(&key_file).unwrap().trim(),
        master.id.as_str()
    );

    let derived = manager
        .derive_public_key(&master, &"m/44/60".parse().unwrap())
        .await
        .unwrap();

    let digest = keccak256(b"sandbox transaction");
    let aggregator = SignatureAggregator::new(set);
    for players in [vec![0, 1, 2], vec![1, 2]] {
        let signature = aggregator.sign(&derived, &digest, &players).await.unwrap();
        combine::verify(&digest, &signature, &derived.public_key).unwrap();
    }

    // A second manager on the same file reuses the key
    let reloaded = FileKeyStore::new(&key_file).load().unwrap();
    assert_eq!(reloaded, Some(master.id));

    let _ = std::fs::remove_file(&key_file);
}

#[tokio::test]
async fn test_wrong_api_key_fails_keygen() {
    let cluster = start(2).await;
    let clients = clients(&cluster, "not-the-key");
    let store = Arc::new(tsm_core::MemoryKeyStore::new());
    let manager = KeyManager::new(participant_set(&clients), Arc::clone(&store));

    let result = manager.get_or_create_master_key(1, Curve::Secp256k1).await;

    match result {
        Err(e @ Error::Participant { .. }) => assert!(!e.is_retryable()),
        other => panic!("expected participant failure, got {other:?}"),
    }
    assert_eq!(store.load().unwrap(), None);
}
