//! Scenario: SOCKS5 with username/password negotiation (RFC 1929) followed
//! by a CONNECT request tunneling an HTTP request through to a backend
//! (spec.md §8 "SOCKS5 userpass + CONNECT").

mod common;

use common::{base_listener_config, make_credentials, spawn_fixed_response_backend, TestProxy};
use proxy_core::config::ListenerType;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

#[tokio::test]
async fn userpass_handshake_then_connect_relays_http() {
    let backend = spawn_fixed_response_backend(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nhi").await;

    let mut config = base_listener_config("socks5", 19104, ListenerType::Socks5);
    config.auth_enabled = true;
    let credentials = make_credentials("alice", "wonderland");
    let proxy = TestProxy::start_with_credentials(config, Some(credentials)).await;

    let mut client = TcpStream::connect(("127.0.0.1", 19104)).await.unwrap();

    // Method negotiation: offer no-auth and user/pass, expect user/pass (0x02).
    client.write_all(&[0x05, 0x02, 0x00, 0x02]).await.unwrap();
    let mut method_reply = [0u8; 2];
    client.read_exact(&mut method_reply).await.unwrap();
    assert_eq!(method_reply, [0x05, 0x02]);

    // RFC 1929 sub-negotiation.
    let mut auth_request = vec![0x01, 5];
    auth_request.extend_from_slice(b"alice");
    auth_request.push(10);
    auth_request.extend_from_slice(b"wonderland");
    client.write_all(&auth_request).await.unwrap();
    let mut auth_reply = [0u8; 2];
    client.read_exact(&mut auth_reply).await.unwrap();
    assert_eq!(auth_reply, [0x01, 0x00]);

    // CONNECT request, address type 3 (domain name), targeting the backend.
    let host = backend.ip().to_string();
    let mut connect_request = vec![0x05, 0x01, 0x00, 0x03, host.len() as u8];
    connect_request.extend_from_slice(host.as_bytes());
    connect_request.extend_from_slice(&backend.port().to_be_bytes());
    client.write_all(&connect_request).await.unwrap();

    let mut reply_header = [0u8; 4];
    client.read_exact(&mut reply_header).await.unwrap();
    assert_eq!(reply_header, [0x05, 0x00, 0x00, 0x01]);
    let mut bound = [0u8; 6];
    client.read_exact(&mut bound).await.unwrap();

    client
        .write_all(b"GET / HTTP/1.1\r\nHost: backend\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();
    let mut response = Vec::new();
    client.read_to_end(&mut response).await.unwrap();
    let text = String::from_utf8_lossy(&response);
    assert!(text.starts_with("HTTP/1.1 200 OK"), "unexpected response: {text}");

    proxy.stop().await;
}

#[tokio::test]
async fn wrong_password_rejects_and_closes() {
    let mut config = base_listener_config("socks5-reject", 19105, ListenerType::Socks5);
    config.auth_enabled = true;
    let credentials = make_credentials("alice", "wonderland");
    let proxy = TestProxy::start_with_credentials(config, Some(credentials)).await;

    let mut client = TcpStream::connect(("127.0.0.1", 19105)).await.unwrap();
    client.write_all(&[0x05, 0x01, 0x02]).await.unwrap();
    let mut method_reply = [0u8; 2];
    client.read_exact(&mut method_reply).await.unwrap();
    assert_eq!(method_reply, [0x05, 0x02]);

    let mut auth_request = vec![0x01, 5];
    auth_request.extend_from_slice(b"alice");
    auth_request.push(5);
    auth_request.extend_from_slice(b"wrong");
    client.write_all(&auth_request).await.unwrap();
    let mut auth_reply = [0u8; 2];
    client.read_exact(&mut auth_reply).await.unwrap();
    assert_eq!(auth_reply, [0x01, 0x01]);

    let mut trailing = [0u8; 1];
    let n = client.read(&mut trailing).await.unwrap();
    assert_eq!(n, 0, "connection should be closed after a failed sub-negotiation");

    proxy.stop().await;
}
