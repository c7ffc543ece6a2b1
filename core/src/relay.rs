//! Bidirectional byte relay (spec.md §4.11).
//!
//! Used by CONNECT tunnels, WebSocket upgrades, and both SOCKS engines
//! once their handshake completes: from that point on the proxy just
//! shuttles bytes in both directions until either side closes. Each
//! direction is copied independently with an 8 KiB buffer; a half-close
//! on one side (e.g. the client finishes sending but keeps reading)
//! shuts down only that direction rather than killing the whole
//! connection.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

#[derive(Debug, Clone, Copy, Default)]
pub struct RelayStats {
    pub bytes_client_to_upstream: u64,
    pub bytes_upstream_to_client: u64,
}

const BUFFER_SIZE: usize = 8 * 1024;

/// Relays `client` <-> `upstream` until both directions have closed.
/// Returns byte counts in each direction once finished. Neither
/// direction is allowed to abort the other: an error or EOF on one side
/// only half-closes that side's destination writer, per spec.md §4.11 —
/// so this awaits both copy loops unconditionally rather than
/// short-circuiting on the first error.
pub async fn relay<C, U>(client: &mut C, upstream: &mut U) -> std::io::Result<RelayStats>
where
    C: AsyncRead + AsyncWrite + Unpin,
    U: AsyncRead + AsyncWrite + Unpin,
{
    let (mut client_r, mut client_w) = tokio::io::split(client);
    let (mut upstream_r, mut upstream_w) = tokio::io::split(upstream);

    let to_upstream = copy_and_shutdown(&mut client_r, &mut upstream_w);
    let to_client = copy_and_shutdown(&mut upstream_r, &mut client_w);

    let (sent, received) = tokio::join!(to_upstream, to_client);
    Ok(RelayStats {
        bytes_client_to_upstream: sent,
        bytes_upstream_to_client: received,
    })
}

/// Copies until EOF or a read/write error, then half-closes the
/// destination's write side so the other direction's own EOF detection
/// isn't starved waiting on a socket nothing will ever write to again.
/// A read or write error ends only this direction; it never propagates
/// to cancel the other one.
async fn copy_and_shutdown<R, W>(reader: &mut R, writer: &mut W) -> u64
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; BUFFER_SIZE];
    let mut total = 0u64;
    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        if writer.write_all(&buf[..n]).await.is_err() {
            break;
        }
        total += n as u64;
    }
    let _ = writer.shutdown().await;
    total
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn relays_bytes_both_ways_and_counts_them() {
        let (mut client, mut client_peer) = duplex(64);
        let (mut upstream, mut upstream_peer) = duplex(64);

        let relay_task = tokio::spawn(async move { relay(&mut client, &mut upstream).await });

        client_peer.write_all(b"hello").await.unwrap();
        let mut from_client = [0u8; 5];
        upstream_peer.read_exact(&mut from_client).await.unwrap();
        assert_eq!(&from_client, b"hello");

        upstream_peer.write_all(b"world!").await.unwrap();
        let mut from_upstream = [0u8; 6];
        client_peer.read_exact(&mut from_upstream).await.unwrap();
        assert_eq!(&from_upstream, b"world!");

        drop(client_peer);
        drop(upstream_peer);

        let stats = relay_task.await.unwrap().unwrap();
        assert_eq!(stats.bytes_client_to_upstream, 5);
        assert_eq!(stats.bytes_upstream_to_client, 6);
    }
}
