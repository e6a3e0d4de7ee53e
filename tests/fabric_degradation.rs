//! Degradation tests: the gateway must come up and relay locally even when
//! the configured external store is unreachable at bootstrap.

use std::sync::Arc;
use std::time::Duration;

use collab_gateway::{
    mint_credential, ClientEvent, GatewayClient, GatewayConfig, GatewayServer, InMemoryDirectory,
    Role, ServerEvent,
};

const SECRET: &str = "degradation-secret";
const RECV: Duration = Duration::from_secs(2);

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

async fn free_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

#[tokio::test]
async fn test_unreachable_store_still_relays_locally() {
    init_logging();
    let directory = Arc::new(InMemoryDirectory::new());
    let alice = directory.add_subject("Alice", Role::Candidate);
    let bob = directory.add_subject("Bob", Role::Interviewer);
    let session = directory.add_session(vec![alice, bob]);

    let port = free_port().await;
    let config = GatewayConfig {
        bind_addr: format!("127.0.0.1:{port}"),
        jwt_secret: SECRET.to_string(),
        // Nothing listens here; bootstrap must fall back within its budget
        redis_url: Some("redis://127.0.0.1:1/".to_string()),
        fabric_connect_timeout: Duration::from_millis(500),
        ..GatewayConfig::default()
    };
    let server = Arc::new(GatewayServer::bootstrap(config, directory).await);
    assert!(!server.fabric_attached());

    let runner = server.clone();
    tokio::spawn(async move {
        runner.run().await.unwrap();
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    let url = format!("ws://127.0.0.1:{port}");

    let mut alice_c = GatewayClient::connect(&url, &mint_credential(alice, SECRET, 60))
        .await
        .unwrap();
    let mut bob_c = GatewayClient::connect(&url, &mint_credential(bob, SECRET, 60))
        .await
        .unwrap();

    for client in [&mut alice_c, &mut bob_c] {
        client
            .send(&ClientEvent::JoinSession { session_id: session })
            .await
            .unwrap();
        assert!(matches!(
            client.recv_timeout(RECV).await,
            Some(ServerEvent::Joined { .. })
        ));
    }
    assert!(matches!(
        alice_c.recv_timeout(RECV).await,
        Some(ServerEvent::PeerJoined { .. })
    ));

    // Same-instance relay works with no fabric and no presence store
    alice_c
        .send(&ClientEvent::Draw {
            session_id: session,
            stroke: serde_json::json!({"points": [[0, 0], [4, 4]]}),
        })
        .await
        .unwrap();
    assert!(matches!(
        bob_c.recv_timeout(RECV).await,
        Some(ServerEvent::Draw { from_subject_id, .. }) if from_subject_id == alice
    ));
}

#[tokio::test]
async fn test_bootstrap_without_store_is_local() {
    init_logging();
    let directory = Arc::new(InMemoryDirectory::new());
    let port = free_port().await;
    let config = GatewayConfig {
        bind_addr: format!("127.0.0.1:{port}"),
        jwt_secret: SECRET.to_string(),
        redis_url: None,
        ..GatewayConfig::default()
    };
    let server = GatewayServer::bootstrap(config, directory).await;
    assert!(!server.fabric_attached());
}
