//! Scenario: a rule with `rateLimit=1, burst=1` admits one request per
//! second per client IP (spec.md §8 "Rate limiting").

mod common;

use common::{base_listener_config, rule_with_targets, spawn_fixed_response_backend, TestProxy};
use proxy_core::config::{ListenerType, LoadBalancing};
use std::net::SocketAddr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpSocket, TcpStream};

async fn get_status_from(proxy_port: u16, local_ip: &str) -> u16 {
    let socket = TcpSocket::new_v4().unwrap();
    socket
        .bind(format!("{local_ip}:0").parse::<SocketAddr>().unwrap())
        .unwrap();
    let mut client = socket
        .connect(format!("127.0.0.1:{proxy_port}").parse().unwrap())
        .await
        .unwrap();
    client
        .write_all(b"GET / HTTP/1.1\r\nHost: proxy\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();
    let mut response = Vec::new();
    client.read_to_end(&mut response).await.unwrap();
    let text = String::from_utf8_lossy(&response);
    text.split_whitespace().nth(1).unwrap().parse().unwrap()
}

#[tokio::test]
async fn second_request_from_same_ip_is_limited_but_other_ips_are_not() {
    let backend = spawn_fixed_response_backend(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nhi").await;

    let mut config = base_listener_config("ratelimit", 19106, ListenerType::Http);
    let mut rule = rule_with_targets(None, vec![format!("http://{backend}")], LoadBalancing::RoundRobin);
    rule.rate_limit = 1.0;
    rule.burst = 1;
    config.rules.push(rule);
    let proxy = TestProxy::start(config).await;

    let first = get_status_from(19106, "127.0.0.1").await;
    assert_eq!(first, 200);

    let second = get_status_from(19106, "127.0.0.1").await;
    assert_eq!(second, 429);

    let other_ip = get_status_from(19106, "127.0.0.2").await;
    assert_eq!(other_ip, 200);

    proxy.stop().await;
}
