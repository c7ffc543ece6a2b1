//! Scenario: a backend marked down by health checks is taken out of the
//! load-balancing pool, then put back once it starts responding again
//! (spec.md §8 "Health failover").

mod common;

use common::{base_listener_config, rule_with_targets, spawn_fixed_response_backend, spawn_stoppable_backend, TestProxy};
use proxy_core::config::{ListenerType, LoadBalancing};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

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
async fn traffic_shifts_away_from_and_back_to_a_recovered_target() {
    let (b1_addr, b1_stop) = spawn_stoppable_backend(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nB1").await;
    let b2_addr = spawn_fixed_response_backend(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nB2").await;

    let interval = Duration::from_millis(100);
    let mut config = base_listener_config("failover", 19107, ListenerType::Http);
    let mut rule = rule_with_targets(
        None,
        vec![format!("http://{b1_addr}"), format!("http://{b2_addr}")],
        LoadBalancing::RoundRobin,
    );
    rule.health_check_path = Some("/healthz".to_string());
    rule.health_check_interval_ms = interval.as_millis() as u64;
    rule.health_check_timeout_ms = 100;
    config.rules.push(rule);
    let proxy = TestProxy::start(config).await;

    // Let one probe round confirm both targets start out healthy.
    tokio::time::sleep(interval * 2).await;

    b1_stop.send(()).unwrap();

    // Wait past 2 probe intervals for the down target to be marked
    // unhealthy and filtered out of the round-robin pool.
    tokio::time::sleep(interval * 3).await;

    for _ in 0..4 {
        let response = get(19107).await;
        assert!(response.ends_with("B2"), "expected only B2 while B1 is down: {response}");
    }

    // Bring a listener back up on the same address to simulate recovery.
    let recovered = TcpListener::bind(b1_addr).await.unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut sock, _)) = recovered.accept().await else { break };
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                let _ = tokio::time::timeout(Duration::from_millis(200), sock.read(&mut buf)).await;
                let _ = sock
                    .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nB1")
                    .await;
                let _ = sock.shutdown().await;
            });
        }
    });

    tokio::time::sleep(interval * 3).await;

    let mut saw_b1 = false;
    let mut saw_b2 = false;
    for _ in 0..6 {
        let response = get(19107).await;
        saw_b1 |= response.ends_with("B1");
        saw_b2 |= response.ends_with("B2");
    }
    assert!(saw_b1, "recovered target should rejoin the pool");
    assert!(saw_b2, "the other target should still be in the pool");

    proxy.stop().await;
}
