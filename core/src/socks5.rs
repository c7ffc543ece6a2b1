//! SOCKS5 engine (spec.md §4.9, RFC 1928 + RFC 1929).

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Instant;

use http::Uri;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::collaborators::SocksAccessRecord;
use crate::error::ProtocolError;
use crate::relay::relay;
use crate::runtime_context::ListenerRuntime;

pub async fn serve<S>(stream: &mut S, runtime: Arc<ListenerRuntime>, client_ip: IpAddr) -> std::io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let start = Instant::now();
    if negotiate_methods(stream, runtime.config.auth_enabled).await?.is_none() {
        return Ok(());
    }

    if runtime.config.auth_enabled {
        let ok = run_userpass(stream, runtime.as_ref()).await?;
        if !ok {
            return Ok(());
        }
    }

    let request = match read_request(stream).await {
        Ok(Ok(r)) => r,
        Ok(Err(ProtocolError::BadAtyp(_))) => {
            write_reply(stream, 0x08, SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0))).await?;
            return Ok(());
        }
        Ok(Err(_)) | Err(_) => return Ok(()),
    };
    let destination = format!("{}:{}", request.host, request.port);

    if request.command != 0x01 {
        write_reply(stream, 0x07, SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0))).await?;
        log_socks(&runtime, client_ip, destination, 0x07, 0, 0, start);
        return Ok(());
    }

    let Ok(target): Result<Uri, _> = format!("http://{}:{}", request.host, request.port).parse() else {
        write_reply(stream, 0x04, SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0))).await?;
        log_socks(&runtime, client_ip, destination, 0x04, 0, 0, start);
        return Ok(());
    };

    runtime.metrics.increment_counter(
        "proxy.socks5.requests.total",
        &[("name", &runtime.config.key())],
        1,
    );

    match runtime.connect_upstream(&target, None).await {
        Ok(mut upstream) => {
            let bound = upstream
                .local_addr()
                .unwrap_or_else(|_| SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)));
            write_reply(stream, 0x00, bound).await?;
            let stats = relay(stream, &mut upstream).await?;
            let name = runtime.config.key();
            runtime.metrics.increment_counter(
                "proxy.traffic.bytes.received",
                &[("name", &name)],
                stats.bytes_client_to_upstream,
            );
            runtime.metrics.increment_counter(
                "proxy.traffic.bytes.sent",
                &[("name", &name)],
                stats.bytes_upstream_to_client,
            );
            log_socks(
                &runtime,
                client_ip,
                destination,
                0x00,
                stats.bytes_client_to_upstream,
                stats.bytes_upstream_to_client,
                start,
            );
        }
        Err(_) => {
            write_reply(stream, 0x04, SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0))).await?;
            log_socks(&runtime, client_ip, destination, 0x04, 0, 0, start);
        }
    }
    Ok(())
}

fn log_socks(
    runtime: &ListenerRuntime,
    client_ip: IpAddr,
    destination: String,
    reply_code: u8,
    bytes_in: u64,
    bytes_out: u64,
    start: Instant,
) {
    runtime.access_log.log_socks(SocksAccessRecord {
        client_ip,
        destination,
        protocol: "socks5".to_string(),
        reply_code,
        bytes_in,
        bytes_out,
        duration_ms: start.elapsed().as_millis() as u64,
    });
}

/// Returns `Some(())` once a method has been accepted and its
/// acceptance byte written; `None` if negotiation failed and the
/// connection should close.
async fn negotiate_methods<S: AsyncRead + AsyncWrite + Unpin>(
    stream: &mut S,
    auth_enabled: bool,
) -> std::io::Result<Option<()>> {
    let mut header = [0u8; 2];
    stream.read_exact(&mut header).await?;
    if header[0] != 0x05 {
        return Ok(None);
    }
    let nmethods = header[1] as usize;
    let mut methods = vec![0u8; nmethods];
    stream.read_exact(&mut methods).await?;

    if auth_enabled {
        if !methods.contains(&0x02) {
            stream.write_all(&[0x05, 0xFF]).await?;
            return Ok(None);
        }
        stream.write_all(&[0x05, 0x02]).await?;
    } else {
        stream.write_all(&[0x05, 0x00]).await?;
    }
    Ok(Some(()))
}

/// RFC 1929 sub-negotiation. Returns `true` on success (`0x01 0x00`
/// already written), `false` on failure (`0x01 0x01` written, caller
/// closes).
async fn run_userpass<S: AsyncRead + AsyncWrite + Unpin>(
    stream: &mut S,
    runtime: &ListenerRuntime,
) -> std::io::Result<bool> {
    let mut ver = [0u8; 1];
    stream.read_exact(&mut ver).await?;
    if ver[0] != 0x01 {
        stream.write_all(&[0x01, 0x01]).await?;
        return Ok(false);
    }

    let mut ulen = [0u8; 1];
    stream.read_exact(&mut ulen).await?;
    if ulen[0] == 0 {
        stream.write_all(&[0x01, 0x01]).await?;
        return Ok(false);
    }
    let mut user = vec![0u8; ulen[0] as usize];
    stream.read_exact(&mut user).await?;

    let mut plen = [0u8; 1];
    stream.read_exact(&mut plen).await?;
    if plen[0] == 0 {
        stream.write_all(&[0x01, 0x01]).await?;
        return Ok(false);
    }
    let mut pass = vec![0u8; plen[0] as usize];
    stream.read_exact(&mut pass).await?;

    let user = String::from_utf8_lossy(&user).to_string();
    let pass = String::from_utf8_lossy(&pass).to_string();
    let ok = runtime
        .credentials
        .as_ref()
        .map(|c| c.authenticate(&user, &pass))
        .unwrap_or(false);

    if ok {
        stream.write_all(&[0x01, 0x00]).await?;
    } else {
        stream.write_all(&[0x01, 0x01]).await?;
    }
    Ok(ok)
}

struct ConnectRequest {
    command: u8,
    host: String,
    port: u16,
}

async fn read_request<S: AsyncRead + Unpin>(stream: &mut S) -> std::io::Result<Result<ConnectRequest, ProtocolError>> {
    let mut header = [0u8; 4];
    stream.read_exact(&mut header).await?;
    if header[0] != 0x05 {
        return Ok(Err(ProtocolError::BadSocksVersion(header[0])));
    }
    let command = header[1];
    let atyp = header[3];

    let host = match atyp {
        0x01 => {
            let mut buf = [0u8; 4];
            stream.read_exact(&mut buf).await?;
            Ipv4Addr::from(buf).to_string()
        }
        0x04 => {
            let mut buf = [0u8; 16];
            stream.read_exact(&mut buf).await?;
            Ipv6Addr::from(buf).to_string()
        }
        0x03 => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            let mut buf = vec![0u8; len[0] as usize];
            stream.read_exact(&mut buf).await?;
            String::from_utf8_lossy(&buf).to_string()
        }
        other => return Ok(Err(ProtocolError::BadAtyp(other))),
    };

    let mut port_bytes = [0u8; 2];
    stream.read_exact(&mut port_bytes).await?;
    let port = u16::from_be_bytes(port_bytes);

    Ok(Ok(ConnectRequest { command, host, port }))
}

async fn write_reply<S: AsyncWrite + Unpin>(stream: &mut S, reply_code: u8, bound: SocketAddr) -> std::io::Result<()> {
    let mut out = vec![0x05, reply_code, 0x00];
    match bound.ip() {
        IpAddr::V4(ip) => {
            out.push(0x01);
            out.extend_from_slice(&ip.octets());
        }
        IpAddr::V6(ip) => {
            out.push(0x04);
            out.extend_from_slice(&ip.octets());
        }
    }
    out.extend_from_slice(&bound.port().to_be_bytes());
    stream.write_all(&out).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn no_auth_negotiation_replies_0x00() {
        let (mut a, mut b) = duplex(64);
        tokio::spawn(async move {
            b.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        });
        let ok = negotiate_methods(&mut a, false).await.unwrap();
        assert!(ok.is_some());
        let mut reply = [0u8; 2];
        a.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, [0x05, 0x00]);
    }

    #[tokio::test]
    async fn auth_required_without_userpass_method_rejects() {
        let (mut a, mut b) = duplex(64);
        tokio::spawn(async move {
            b.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        });
        let ok = negotiate_methods(&mut a, true).await.unwrap();
        assert!(ok.is_none());
    }

    #[tokio::test]
    async fn reply_encodes_ipv4_bound_address() {
        let mut buf = Vec::new();
        write_reply(&mut buf, 0x00, SocketAddr::from((Ipv4Addr::new(127, 0, 0, 1), 9000)))
            .await
            .unwrap();
        assert_eq!(buf, vec![0x05, 0x00, 0x00, 0x01, 127, 0, 0, 1, 0x23, 0x28]);
    }
}
