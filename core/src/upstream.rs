//! Upstream connection establishment (spec.md §4.5).
//!
//! Produces a plain `TcpStream` to the target, routed either directly or
//! through a configured upstream proxy. `UpstreamProxyConfig` with
//! `Socks5` + credentials is rejected at config-validation time (spec.md
//! §3) — by the time code here runs, a SOCKS5 upstream proxy is always
//! no-auth.

use std::time::Duration;

use http::Uri;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::config::{UpstreamProxyConfig, UpstreamProxyType};
use crate::error::UpstreamError;

pub struct UpstreamConnector;

impl UpstreamConnector {
    /// Connects to `target`, optionally tunneled through `proxy`.
    /// `connect_timeout` of `None` means no deadline (listener
    /// `timeout_ms == -1`).
    pub async fn connect(
        target: &Uri,
        proxy: Option<&UpstreamProxyConfig>,
        connect_timeout: Option<Duration>,
    ) -> Result<TcpStream, UpstreamError> {
        match proxy {
            None => Self::connect_direct(target, connect_timeout).await,
            Some(proxy) => match proxy.proxy_type {
                UpstreamProxyType::Http => {
                    Self::connect_via_http_proxy(target, proxy, connect_timeout).await
                }
                UpstreamProxyType::Socks5 => {
                    Self::connect_via_socks5_proxy(target, proxy, connect_timeout).await
                }
            },
        }
    }

    async fn connect_direct(
        target: &Uri,
        connect_timeout: Option<Duration>,
    ) -> Result<TcpStream, UpstreamError> {
        let host = target
            .host()
            .ok_or_else(|| UpstreamError::Connect(target.to_string(), not_host_err()))?;
        let port = target.port_u16().unwrap_or(match target.scheme_str() {
            Some("https") => 443,
            _ => 80,
        });
        Self::dial(host, port, connect_timeout).await
    }

    async fn connect_via_http_proxy(
        target: &Uri,
        proxy: &UpstreamProxyConfig,
        connect_timeout: Option<Duration>,
    ) -> Result<TcpStream, UpstreamError> {
        let mut stream = Self::dial(&proxy.host, proxy.port, connect_timeout).await?;
        let host = target
            .host()
            .ok_or_else(|| UpstreamError::Connect(target.to_string(), not_host_err()))?;
        let port = target.port_u16().unwrap_or(443);
        let authority = format!("{host}:{port}");

        let mut request = format!("CONNECT {authority} HTTP/1.1\r\nHost: {authority}\r\n");
        if let (Some(user), Some(pass)) = (&proxy.username, &proxy.password) {
            use base64::Engine as _;
            let creds = base64::engine::general_purpose::STANDARD
                .encode(format!("{user}:{pass}"));
            request.push_str(&format!("Proxy-Authorization: Basic {creds}\r\n"));
        }
        request.push_str("\r\n");

        stream
            .write_all(request.as_bytes())
            .await
            .map_err(UpstreamError::Io)?;

        let status_line = read_status_line(&mut stream).await?;
        if !status_line.contains(" 200 ") {
            return Err(UpstreamError::ProxyHandshake(status_line));
        }
        Ok(stream)
    }

    async fn connect_via_socks5_proxy(
        target: &Uri,
        proxy: &UpstreamProxyConfig,
        connect_timeout: Option<Duration>,
    ) -> Result<TcpStream, UpstreamError> {
        let mut stream = Self::dial(&proxy.host, proxy.port, connect_timeout).await?;
        let host = target
            .host()
            .ok_or_else(|| UpstreamError::Connect(target.to_string(), not_host_err()))?;
        let port = target.port_u16().unwrap_or(443);

        // Greeting: version 5, one method, no-auth (0x00).
        stream
            .write_all(&[0x05, 0x01, 0x00])
            .await
            .map_err(UpstreamError::Io)?;
        let mut reply = [0u8; 2];
        stream.read_exact(&mut reply).await.map_err(UpstreamError::Io)?;
        if reply != [0x05, 0x00] {
            return Err(UpstreamError::ProxyHandshake(
                "upstream SOCKS5 proxy rejected no-auth".to_string(),
            ));
        }

        // CONNECT request, address type 3 (domain name).
        let mut request = vec![0x05, 0x01, 0x00, 0x03];
        request.push(host.len() as u8);
        request.extend_from_slice(host.as_bytes());
        request.extend_from_slice(&port.to_be_bytes());
        stream.write_all(&request).await.map_err(UpstreamError::Io)?;

        let mut header = [0u8; 4];
        stream.read_exact(&mut header).await.map_err(UpstreamError::Io)?;
        if header[1] != 0x00 {
            return Err(UpstreamError::ProxyHandshake(format!(
                "upstream SOCKS5 proxy returned reply code {}",
                header[1]
            )));
        }
        skip_bound_address(&mut stream, header[3]).await?;
        Ok(stream)
    }

    async fn dial(
        host: &str,
        port: u16,
        connect_timeout: Option<Duration>,
    ) -> Result<TcpStream, UpstreamError> {
        let addr = format!("{host}:{port}");
        let connect = TcpStream::connect(&addr);
        let result = match connect_timeout {
            Some(d) => timeout(d, connect)
                .await
                .map_err(|_| UpstreamError::Connect(addr.clone(), timed_out_err()))?,
            None => connect.await,
        };
        result.map_err(|e| UpstreamError::Connect(addr, e))
    }
}

async fn skip_bound_address(stream: &mut TcpStream, atyp: u8) -> Result<(), UpstreamError> {
    let addr_len = match atyp {
        0x01 => 4,
        0x04 => 16,
        0x03 => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await.map_err(UpstreamError::Io)?;
            len[0] as usize
        }
        other => {
            return Err(UpstreamError::ProxyHandshake(format!(
                "unsupported bound address type {other}"
            )))
        }
    };
    let mut buf = vec![0u8; addr_len + 2];
    stream.read_exact(&mut buf).await.map_err(UpstreamError::Io)?;
    Ok(())
}

/// Reads the proxy's CONNECT response up through the terminating blank
/// line and returns just the status line. The rest of the header block
/// is discarded; this proxy doesn't need anything the upstream proxy
/// sends beyond the status code.
async fn read_status_line(stream: &mut TcpStream) -> Result<String, UpstreamError> {
    let mut buf = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        stream.read_exact(&mut byte).await.map_err(UpstreamError::Io)?;
        buf.push(byte[0]);
        if buf.ends_with(b"\r\n\r\n") {
            break;
        }
        if buf.len() > 64 * 1024 {
            return Err(UpstreamError::ProxyHandshake(
                "upstream proxy response too long".to_string(),
            ));
        }
    }
    let text = String::from_utf8_lossy(&buf);
    let status_line = text.lines().next().unwrap_or_default();
    Ok(status_line.to_string())
}

fn not_host_err() -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::InvalidInput, "target URI has no host")
}

fn timed_out_err() -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::TimedOut, "connect timed out")
}
