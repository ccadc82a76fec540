use super::start_mirror_server;
use burrow::Event;
use burrow_tests::{tcp_tunnel, wait_until, Harness, AGENT_HASH};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

const PAYLOAD_LEN: usize = 10_000;

#[tokio::test]
async fn test_tcp_tunnel_round_trip_and_traffic() {
    let mirror = start_mirror_server().await;
    let harness = Harness::start(vec![tcp_tunnel("t1", mirror)]).await;
    let (agent, _running) = harness.spawn_agent();

    let tunnel = harness.wait_for_session("t1").await;
    let public_addr = tunnel.local_addr().unwrap();

    let payload: Vec<u8> = (0..PAYLOAD_LEN).map(|i| (i % 251) as u8).collect();
    let mut conn = TcpStream::connect(public_addr).await.unwrap();
    conn.write_all(&payload).await.unwrap();

    let mut echoed = vec![0u8; PAYLOAD_LEN];
    conn.read_exact(&mut echoed).await.unwrap();
    assert_eq!(echoed, payload);

    conn.shutdown().await.unwrap();
    let mut rest = Vec::new();
    conn.read_to_end(&mut rest).await.unwrap();
    assert!(rest.is_empty());
    drop(conn);

    let fixture = &harness;
    let counted = wait_until(Duration::from_secs(5), || async move {
        let record = fixture.tunnel_record("t1");
        record.traffic_in > 0 || record.traffic_out > 0
    })
    .await;
    assert!(counted, "traffic was never recorded");

    let record = harness.tunnel_record("t1");
    assert_eq!(record.traffic_in, PAYLOAD_LEN as u64);
    assert_eq!(record.traffic_out, PAYLOAD_LEN as u64);
    assert!(record.count_at.is_some());

    let metrics = harness.broker.metrics();
    assert_eq!(metrics.traffic_in_bytes.get(), PAYLOAD_LEN as u64);
    assert_eq!(metrics.traffic_out_bytes.get(), PAYLOAD_LEN as u64);
    assert_eq!(metrics.connections_total.get(), 1);

    assert!(
        wait_until(Duration::from_secs(2), || async move {
            fixture.tunnel_record("t1").status == "IDLE"
        })
        .await
    );
    assert_eq!(tunnel.active_conns(), 0);

    agent.close();
    harness.stop().await;
}

#[tokio::test]
async fn test_many_connections_share_one_session() {
    let mirror = start_mirror_server().await;
    let harness = Harness::start(vec![tcp_tunnel("t1", mirror)]).await;
    let (agent, _running) = harness.spawn_agent();

    let public_addr = harness.wait_for_session("t1").await.local_addr().unwrap();

    let mut clients = Vec::new();
    for i in 0..8u8 {
        clients.push(tokio::spawn(async move {
            let mut conn = TcpStream::connect(public_addr).await.unwrap();
            let message = vec![i; 512];
            conn.write_all(&message).await.unwrap();
            let mut echoed = vec![0u8; 512];
            conn.read_exact(&mut echoed).await.unwrap();
            assert_eq!(echoed, message);
        }));
    }
    for client in clients {
        client.await.unwrap();
    }

    agent.close();
    harness.stop().await;
}

#[tokio::test]
async fn test_close_and_reopen_tunnel_by_event() {
    let mirror = start_mirror_server().await;
    let harness = Harness::start(vec![tcp_tunnel("t1", mirror)]).await;
    let (agent, _running) = harness.spawn_agent();
    harness.wait_for_session("t1").await;

    harness
        .pubsub
        .publish(AGENT_HASH, [Event::CloseTunnel("t1".into())])
        .await;

    let registry = harness.broker.registry();
    assert!(
        wait_until(Duration::from_secs(5), || async move {
            registry.tunnel(AGENT_HASH, "t1").await.is_none()
        })
        .await
    );
    let controller = agent.controller();
    assert!(
        wait_until(Duration::from_secs(5), || async move {
            controller.tunnels().await.is_empty()
        })
        .await
    );
    assert_eq!(harness.tunnel_record("t1").status, "Closed");

    harness
        .pubsub
        .publish(AGENT_HASH, [Event::OpenTunnel("t1".into())])
        .await;
    let public_addr = harness.wait_for_session("t1").await.local_addr().unwrap();

    let mut conn = TcpStream::connect(public_addr).await.unwrap();
    conn.write_all(b"again").await.unwrap();
    let mut echoed = [0u8; 5];
    conn.read_exact(&mut echoed).await.unwrap();
    assert_eq!(&echoed, b"again");
    drop(conn);

    agent.close();
    harness.stop().await;
}
