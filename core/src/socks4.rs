//! SOCKS4/4a engine (spec.md §4.8).

use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Instant;

use http::Uri;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::collaborators::SocksAccessRecord;
use crate::relay::relay;
use crate::runtime_context::ListenerRuntime;

const MAX_FIELD: usize = 1024;

pub async fn serve<S>(stream: &mut S, runtime: Arc<ListenerRuntime>, client_ip: IpAddr) -> std::io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let start = Instant::now();
    let mut header = [0u8; 8];
    if stream.read_exact(&mut header).await.is_err() {
        return Ok(());
    }
    if header[0] != 0x04 {
        return Ok(());
    }
    let command = header[1];
    let port = u16::from_be_bytes([header[2], header[3]]);
    let ip_bytes = [header[4], header[5], header[6], header[7]];

    let Ok(user_id) = read_nul_terminated(stream, MAX_FIELD).await else {
        return Ok(());
    };

    let is_socks4a = ip_bytes[0] == 0 && ip_bytes[1] == 0 && ip_bytes[2] == 0 && ip_bytes[3] != 0;
    let host = if is_socks4a {
        match read_nul_terminated(stream, MAX_FIELD).await {
            Ok(h) => h,
            Err(_) => return Ok(()),
        }
    } else {
        Ipv4Addr::from(ip_bytes).to_string()
    };
    let destination = format!("{host}:{port}");

    if runtime.config.auth_enabled {
        let known = runtime
            .credentials
            .as_ref()
            .map(|c| c.user_exists(&user_id))
            .unwrap_or(false);
        if !known {
            write_reply(stream, 0x5B, Ipv4Addr::UNSPECIFIED, 0).await?;
            log_socks(&runtime, client_ip, destination, 0x5B, 0, 0, start);
            return Ok(());
        }
    }

    if command != 0x01 {
        write_reply(stream, 0x5B, Ipv4Addr::UNSPECIFIED, 0).await?;
        log_socks(&runtime, client_ip, destination, 0x5B, 0, 0, start);
        return Ok(());
    }

    let Ok(target): Result<Uri, _> = format!("http://{host}:{port}").parse() else {
        write_reply(stream, 0x5B, Ipv4Addr::UNSPECIFIED, 0).await?;
        log_socks(&runtime, client_ip, destination, 0x5B, 0, 0, start);
        return Ok(());
    };

    runtime.metrics.increment_counter(
        "proxy.socks4.requests.total",
        &[("name", &runtime.config.key())],
        1,
    );

    match runtime.connect_upstream(&target, None).await {
        Ok(mut upstream) => {
            let bound_ip = local_ipv4(&upstream);
            write_reply(stream, 0x5A, bound_ip, port).await?;
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
                0x5A,
                stats.bytes_client_to_upstream,
                stats.bytes_upstream_to_client,
                start,
            );
        }
        Err(_) => {
            write_reply(stream, 0x5B, Ipv4Addr::UNSPECIFIED, 0).await?;
            log_socks(&runtime, client_ip, destination, 0x5B, 0, 0, start);
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
        protocol: "socks4".to_string(),
        reply_code,
        bytes_in,
        bytes_out,
        duration_ms: start.elapsed().as_millis() as u64,
    });
}

fn local_ipv4(stream: &tokio::net::TcpStream) -> Ipv4Addr {
    match stream.local_addr() {
        Ok(std::net::SocketAddr::V4(addr)) => *addr.ip(),
        _ => Ipv4Addr::UNSPECIFIED,
    }
}

async fn write_reply<S: AsyncWrite + Unpin>(stream: &mut S, code: u8, ip: Ipv4Addr, port: u16) -> std::io::Result<()> {
    let mut reply = [0u8; 8];
    reply[0] = 0x00;
    reply[1] = code;
    reply[2..4].copy_from_slice(&port.to_be_bytes());
    reply[4..8].copy_from_slice(&ip.octets());
    stream.write_all(&reply).await
}

async fn read_nul_terminated<S: AsyncRead + Unpin>(stream: &mut S, max: usize) -> std::io::Result<String> {
    let mut buf = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        stream.read_exact(&mut byte).await?;
        if byte[0] == 0 {
            break;
        }
        buf.push(byte[0]);
        if buf.len() > max {
            return Err(std::io::Error::new(std::io::ErrorKind::InvalidData, "field too long"));
        }
    }
    Ok(String::from_utf8_lossy(&buf).to_string())
}
