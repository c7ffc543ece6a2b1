//! Scenario: a CONNECT request opens an opaque tunnel and arbitrary bytes
//! are relayed verbatim in both directions (spec.md §8 "CONNECT tunnel").

mod common;

use common::{base_listener_config, spawn_echo_backend, TestProxy};
use proxy_core::config::ListenerType;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

#[tokio::test]
async fn connect_then_relay_is_transparent() {
    let backend = spawn_echo_backend().await;

    let config = base_listener_config("connect", 19103, ListenerType::Http);
    let proxy = TestProxy::start(config).await;

    let mut client = TcpStream::connect(("127.0.0.1", 19103)).await.unwrap();
    client
        .write_all(format!("CONNECT {backend} HTTP/1.1\r\nHost: {backend}\r\n\r\n").as_bytes())
        .await
        .unwrap();

    let mut established = [0u8; 39];
    client.read_exact(&mut established).await.unwrap();
    assert_eq!(&established, b"HTTP/1.1 200 Connection Established\r\n\r\n");

    client.write_all(b"PING").await.unwrap();
    let mut echoed = [0u8; 4];
    client.read_exact(&mut echoed).await.unwrap();
    assert_eq!(&echoed, b"PING");

    drop(client);
    proxy.stop().await;
}
