use super::start_mirror_server;
use burrow::Event;
use burrow_common::version::VERSION;
use burrow_core::tracker::NoopTracker;
use burrow_protocol::{read_to, write_message, HandshakeRequest, HandshakeResponse, StatusCode};
use burrow_tests::{tcp_tunnel, wait_until, Harness, AGENT_HASH, AGENT_ID};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;

async fn handshake(harness: &Harness, id: &str, version: &str) -> StatusCode {
    let mut conn = TcpStream::connect(harness.broker.control_addr()).await.unwrap();
    let request = HandshakeRequest {
        id: id.into(),
        client_hash: AGENT_HASH.into(),
        version: version.into(),
        device: "linux/x86_64".into(),
    };
    write_message(&mut conn, &request.into()).await.unwrap();
    let response: HandshakeResponse = read_to(&mut conn).await.unwrap();
    response.status
}

#[tokio::test]
async fn test_second_login_is_duplicate() {
    let harness = Harness::start(Vec::new()).await;
    let (agent, _running) = harness.spawn_agent();

    let fixture = &harness;
    assert!(
        wait_until(Duration::from_secs(5), || async move {
            fixture.broker.validator().is_connected(AGENT_ID, AGENT_HASH)
                && fixture
                    .storage
                    .agent(AGENT_ID, AGENT_HASH)
                    .is_some_and(|a| a.status == "Connected")
        })
        .await
    );
    assert_eq!(
        handshake(&harness, AGENT_ID, VERSION).await,
        StatusCode::DuplicateAgent
    );

    let record = harness.storage.agent(AGENT_ID, AGENT_HASH).unwrap();
    assert_eq!(record.version, VERSION);
    assert_eq!(record.status, "Connected");
    assert_eq!(harness.broker.metrics().agents_connected.get(), 1);

    agent.close();
    harness.stop().await;
}

#[tokio::test]
async fn test_handshake_rejections() {
    let harness = Harness::start(Vec::new()).await;

    assert_eq!(
        handshake(&harness, AGENT_ID, "0.9.0").await,
        StatusCode::BadVersion
    );
    assert_eq!(
        handshake(&harness, "stranger", VERSION).await,
        StatusCode::BadClient
    );
    assert!(!harness.broker.validator().is_connected(AGENT_ID, AGENT_HASH));

    harness.stop().await;
}

#[tokio::test]
async fn test_reject_agent_event_stops_agent() {
    let mirror = start_mirror_server().await;
    let harness = Harness::start(vec![tcp_tunnel("t1", mirror)]).await;
    let (_agent, running) = harness.spawn_agent();
    harness.wait_for_session("t1").await;

    harness
        .pubsub
        .publish(AGENT_HASH, [Event::RejectAgent])
        .await;

    let stopped = tokio::time::timeout(Duration::from_secs(5), running)
        .await
        .expect("agent kept running after rejection")
        .unwrap();
    assert!(stopped.is_ok());

    let fixture = &harness;
    assert!(
        wait_until(Duration::from_secs(5), || async move {
            !fixture.broker.validator().is_connected(AGENT_ID, AGENT_HASH)
                && fixture.broker.registry().is_empty().await
        })
        .await
    );
    assert!(!harness.pubsub.is_subscribed(AGENT_HASH));
    assert_eq!(
        harness.storage.agent(AGENT_ID, AGENT_HASH).unwrap().status,
        "Disconnected"
    );

    harness.stop().await;
}

#[tokio::test]
async fn test_deregister_is_idempotent() {
    let harness = Harness::start(Vec::new()).await;
    let registry = harness.broker.registry();

    let tunnel = registry
        .register("h", "t", "tcp", "127.0.0.1:0", Arc::new(NoopTracker))
        .await
        .unwrap();
    let again = registry
        .register("h", "t", "tcp", "127.0.0.1:0", Arc::new(NoopTracker))
        .await
        .unwrap();
    assert!(Arc::ptr_eq(&tunnel, &again));

    assert!(registry.deregister("h", "t").await);
    assert!(tunnel.is_closed());
    assert!(!registry.deregister("h", "t").await);
    assert!(registry.is_empty().await);

    harness.stop().await;
}
