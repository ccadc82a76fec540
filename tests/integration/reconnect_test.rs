use super::get_free_port;
use burrow::Agent;
use burrow_common::config::RetryConfig;
use burrow_common::TunnelError;
use burrow_core::ClientState;
use burrow_protocol::{read_to, write_message, HandshakeRequest, HandshakeResponse, StatusCode};
use burrow_tests::{wait_until, Harness, AGENT_HASH};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

fn agent(server_addr: String, backoff: Duration) -> Agent {
    Agent::builder()
        .server_addr(server_addr)
        .id("agent-1")
        .client_hash("hash-1")
        .retry(RetryConfig {
            backoff,
            max_attempts: 5,
        })
        .build()
        .unwrap()
}

/// Accepts the first handshake and then hangs up; every later connection is
/// dropped before the handshake completes.
async fn flaky_broker() -> (SocketAddr, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let accepted = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&accepted);
    tokio::spawn(async move {
        while let Ok((mut conn, _)) = listener.accept().await {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                let _: HandshakeRequest = read_to(&mut conn).await.unwrap();
                write_message(&mut conn, &HandshakeResponse::default().into())
                    .await
                    .unwrap();
            }
            drop(conn);
        }
    });
    (addr, accepted)
}

#[tokio::test]
async fn test_reconnect_gives_up_after_max_attempts() {
    let (addr, accepted) = flaky_broker().await;

    let agent = agent(addr.to_string(), Duration::from_millis(20));
    let result = tokio::time::timeout(Duration::from_secs(5), agent.run())
        .await
        .expect("run loop did not give up");

    assert!(result.is_err());
    // The initial connection plus exactly five redials
    assert_eq!(accepted.load(Ordering::SeqCst), 6);
    assert_eq!(agent.state(), ClientState::Terminated);
}

#[tokio::test]
async fn test_unreachable_broker() {
    let port = get_free_port();
    let agent = agent(format!("127.0.0.1:{port}"), Duration::from_secs(10));

    let result = tokio::time::timeout(Duration::from_secs(2), agent.run())
        .await
        .expect("first connect was retried");
    assert!(matches!(result, Err(TunnelError::Io(_))));
}

#[tokio::test]
async fn test_unknown_agent_fails_fast() {
    let harness = Harness::start(Vec::new()).await;
    let agent = Agent::builder()
        .server_addr(harness.broker.control_addr().to_string())
        .id("stranger")
        .client_hash(AGENT_HASH)
        .retry(RetryConfig {
            backoff: Duration::from_secs(10),
            max_attempts: 5,
        })
        .build()
        .unwrap();

    let result = tokio::time::timeout(Duration::from_secs(2), agent.run())
        .await
        .expect("rejected handshake was retried");
    assert!(matches!(
        result,
        Err(TunnelError::Rejected(StatusCode::BadClient))
    ));

    harness.stop().await;
}

#[tokio::test]
async fn test_close_interrupts_reconnect() {
    let (addr, accepted) = flaky_broker().await;
    let agent = Arc::new(agent(addr.to_string(), Duration::from_secs(10)));

    let running = Arc::clone(&agent);
    let handle = tokio::spawn(async move { running.run().await });

    // First redial fails, then the agent sleeps out its backoff
    let counter = &accepted;
    assert!(
        wait_until(Duration::from_secs(2), || async move {
            counter.load(Ordering::SeqCst) >= 2
        })
        .await
    );
    assert_eq!(agent.state(), ClientState::Handshaking);

    agent.close();
    let result = tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .expect("close did not stop the agent")
        .unwrap();
    assert!(result.is_ok());
}
