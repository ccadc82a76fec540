use super::{start_echo_server, wait_for_server};
use burrow_tests::{http_tunnel, Harness, DOMAIN};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

/// Send one request with the given Host header and read until the peer closes
async fn request(addr: SocketAddr, host: &str) -> Vec<u8> {
    let mut conn = TcpStream::connect(addr).await.unwrap();
    let request = format!("GET /hello HTTP/1.1\r\nHost: {host}\r\nUser-Agent: burrow-test\r\n\r\n");
    conn.write_all(request.as_bytes()).await.unwrap();

    let mut response = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), conn.read_to_end(&mut response))
        .await
        .expect("response timed out")
        .unwrap();
    response
}

/// Status code, Content-Length header and body of a complete response
fn parse_response(raw: &[u8]) -> (u16, Option<usize>, &[u8]) {
    let mut headers = [httparse::EMPTY_HEADER; 16];
    let mut response = httparse::Response::new(&mut headers);
    let head_len = match response.parse(raw).unwrap() {
        httparse::Status::Complete(len) => len,
        httparse::Status::Partial => panic!("incomplete response head"),
    };
    let content_length = response
        .headers
        .iter()
        .find(|h| h.name.eq_ignore_ascii_case("content-length"))
        .map(|h| std::str::from_utf8(h.value).unwrap().parse().unwrap());
    (response.code.unwrap(), content_length, &raw[head_len..])
}

#[tokio::test]
async fn test_unknown_subdomain_gets_404() {
    let harness = Harness::start_http(Vec::new()).await;
    let http_addr = harness.http_addr();
    assert!(wait_for_server(http_addr, Duration::from_secs(2)).await);

    let raw = request(http_addr, &format!("nope.{DOMAIN}:{}", http_addr.port())).await;
    let (status, content_length, body) = parse_response(&raw);

    assert_eq!(status, 404);
    assert_eq!(content_length, Some(body.len()));
    assert_eq!(body, b"No such tunnel: nope");

    harness.stop().await;
}

#[tokio::test]
async fn test_subdomain_routes_to_agent_service() {
    let service = start_echo_server().await;
    let harness = Harness::start_http(vec![http_tunnel("web-1", "web", service)]).await;
    let (agent, _running) = harness.spawn_agent();
    harness.wait_for_session("web-1").await;

    let http_addr = harness.http_addr();
    let raw = request(http_addr, &format!("WEB.{DOMAIN}")).await;
    let (status, content_length, body) = parse_response(&raw);
    assert_eq!(status, 200);
    assert_eq!(content_length, Some(13));
    assert_eq!(body, b"Hello, World!");

    // Other subdomains are unaffected
    let raw = request(http_addr, &format!("api.{DOMAIN}")).await;
    assert_eq!(parse_response(&raw).0, 404);

    agent.close();
    harness.stop().await;
}
