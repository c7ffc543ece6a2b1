//! CONNECT tunnel (spec.md §4.3.1).

use http::Uri;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

use crate::relay::{relay, RelayStats};
use crate::runtime_context::ListenerRuntime;

/// Parses a CONNECT authority (`host:port`, port defaulting to 443) into
/// a URI the upstream connector can dial.
pub fn authority_to_uri(authority: &str) -> Option<Uri> {
    let (host, port) = match authority.rsplit_once(':') {
        Some((h, p)) => (h, p.parse::<u16>().ok()?),
        None => (authority, 443),
    };
    format!("https://{host}:{port}").parse().ok()
}

/// Opens the upstream connection and, on success, emits `200 Connection
/// Established` then relays bytes until either side closes. On failure
/// emits `502 Bad Gateway`. Returns the relay byte counts, or `None` if
/// the tunnel was never established.
pub async fn serve_connect<S>(
    stream: &mut S,
    authority: &str,
    runtime: &ListenerRuntime,
) -> std::io::Result<Option<RelayStats>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let Some(target) = authority_to_uri(authority) else {
        stream
            .write_all(b"HTTP/1.1 400 Bad Request\r\nContent-Length: 0\r\n\r\n")
            .await?;
        return Ok(None);
    };

    match runtime.connect_upstream(&target, None).await {
        Ok(mut upstream) => {
            stream
                .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
                .await?;
            let stats = relay(stream, &mut upstream).await?;
            Ok(Some(stats))
        }
        Err(_) => {
            stream
                .write_all(b"HTTP/1.1 502 Bad Gateway\r\nContent-Length: 0\r\n\r\n")
                .await?;
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_host_and_port() {
        let uri = authority_to_uri("example.com:8443").unwrap();
        assert_eq!(uri.host(), Some("example.com"));
        assert_eq!(uri.port_u16(), Some(8443));
    }

    #[test]
    fn defaults_to_443_when_port_omitted() {
        let uri = authority_to_uri("example.com").unwrap();
        assert_eq!(uri.port_u16(), Some(443));
    }
}
