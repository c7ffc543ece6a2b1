//! Scenario: a rule with two targets round-robins between them
//! (spec.md §8 "Rule match & round-robin load balancing").

mod common;

use common::{base_listener_config, rule_with_targets, spawn_fixed_response_backend, TestProxy};
use proxy_core::config::{ListenerType, LoadBalancing};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

async fn get(proxy_port: u16) -> String {
    let mut client = TcpStream::connect(("127.0.0.1", proxy_port)).await.unwrap();
    client
        .write_all(b"GET / HTTP/1.1\r\nHost: proxy\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();
    let mut response = Vec::new();
    client.read_to_end(&mut response).await.unwrap();
    String::from_utf8_lossy(&response).to_string()
}

#[tokio::test]
async fn alternates_between_both_targets() {
    let b1 = spawn_fixed_response_backend(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nB1").await;
    let b2 = spawn_fixed_response_backend(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nB2").await;

    let mut config = base_listener_config("rr", 19102, ListenerType::Http);
    config.rules.push(rule_with_targets(
        None,
        vec![format!("http://{b1}"), format!("http://{b2}")],
        LoadBalancing::RoundRobin,
    ));
    let proxy = TestProxy::start(config).await;

    let r1 = get(19102).await;
    let r2 = get(19102).await;
    let r3 = get(19102).await;
    let r4 = get(19102).await;

    assert!(r1.ends_with("B1"), "first response: {r1}");
    assert!(r2.ends_with("B2"), "second response: {r2}");
    assert!(r3.ends_with("B1"), "third response: {r3}");
    assert!(r4.ends_with("B2"), "fourth response: {r4}");

    proxy.stop().await;
}
