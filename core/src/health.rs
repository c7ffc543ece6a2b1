//! Active health checking (spec.md §4.7).
//!
//! One probe loop runs per rule that has a `health_check_path`
//! configured, polling every target in that rule's pool at
//! `health_check_interval_ms`. Probes across different rules run
//! concurrently; probes within the same rule run one at a time so a slow
//! or hanging backend doesn't pile up overlapping requests against
//! itself.

use std::sync::Arc;
use std::time::Duration;

use http::Uri;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::rule_runtime::RuleRuntime;

/// Spawns one background task for this rule's whole target pool: each
/// tick it probes every target in `targets` one after another (never
/// concurrently with itself), then sleeps `interval` before the next
/// round. Returns a single-element vec of the task's handle — dropped
/// (which aborts it) when the owning listener shuts down; the `Vec`
/// shape lets the caller fold every rule's probe task into one flat
/// list without matching on arity.
pub fn spawn_probes(
    runtime: Arc<RuleRuntime>,
    targets: Vec<Uri>,
    path: String,
    interval: Duration,
    probe_timeout: Duration,
) -> Vec<tokio::task::JoinHandle<()>> {
    let handle = tokio::spawn(async move {
        loop {
            for target in &targets {
                let healthy = probe_once(target, &path, probe_timeout).await;
                if healthy {
                    runtime.mark_healthy(target);
                } else {
                    runtime.mark_unhealthy(target);
                }
            }
            tokio::time::sleep(interval).await;
        }
    });
    vec![handle]
}

/// Issues one `GET <path>` against `target` and judges health by
/// whether the connection succeeds and a response status line with a
/// 2xx or 3xx code comes back before `probe_timeout` elapses. Any I/O
/// error, timeout, or non-2xx/3xx status counts as unhealthy.
async fn probe_once(target: &Uri, path: &str, probe_timeout: Duration) -> bool {
    match timeout(probe_timeout, probe_inner(target, path)).await {
        Ok(Ok(ok)) => ok,
        _ => false,
    }
}

async fn probe_inner(target: &Uri, path: &str) -> std::io::Result<bool> {
    let host = target
        .host()
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::InvalidInput, "no host"))?;
    let port = target.port_u16().unwrap_or(80);
    let mut stream = TcpStream::connect((host, port)).await?;

    let request = format!(
        "GET {path} HTTP/1.1\r\nHost: {host}\r\nConnection: close\r\n\r\n"
    );
    stream.write_all(request.as_bytes()).await?;

    let mut buf = Vec::new();
    let mut chunk = [0u8; 512];
    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
        if buf.windows(4).any(|w| w == b"\r\n\r\n") || buf.len() > 16 * 1024 {
            break;
        }
    }
    let text = String::from_utf8_lossy(&buf);
    let Some(status_line) = text.lines().next() else {
        return Ok(false);
    };
    let status: Option<u16> = status_line.split_whitespace().nth(1).and_then(|s| s.parse().ok());
    Ok(matches!(status, Some(code) if (200..400).contains(&code)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn probe_marks_2xx_as_healthy() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            if let Ok((mut sock, _)) = listener.accept().await {
                let mut buf = [0u8; 1024];
                let _ = sock.read(&mut buf).await;
                let _ = sock
                    .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n")
                    .await;
            }
        });
        let target: Uri = format!("http://{addr}").parse().unwrap();
        let ok = probe_once(&target, "/healthz", Duration::from_secs(1)).await;
        assert!(ok);
    }

    #[tokio::test]
    async fn probe_marks_connection_refused_as_unhealthy() {
        let target: Uri = "http://127.0.0.1:1".parse().unwrap();
        let ok = probe_once(&target, "/healthz", Duration::from_millis(200)).await;
        assert!(!ok);
    }

    #[tokio::test]
    async fn probe_marks_5xx_as_unhealthy() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            if let Ok((mut sock, _)) = listener.accept().await {
                let mut buf = [0u8; 1024];
                let _ = sock.read(&mut buf).await;
                let _ = sock
                    .write_all(b"HTTP/1.1 503 Service Unavailable\r\nContent-Length: 0\r\n\r\n")
                    .await;
            }
        });
        let target: Uri = format!("http://{addr}").parse().unwrap();
        let ok = probe_once(&target, "/healthz", Duration::from_secs(1)).await;
        assert!(!ok);
    }
}
