//! Regular HTTP forwarding, redirects, and reverse-mode rewriting
//! (spec.md §4.3.3).

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use http::Uri;
use tokio::io::{AsyncBufRead, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

use crate::config::{ListenerConfig, Rule};
use crate::error::UpstreamError;
use crate::http_engine::parse::{self, header_value, Headers};
use crate::load_balancer::LoadBalancerRegistry;
use crate::reason::{is_disallowed_inbound, is_hop_by_hop, reason_phrase};
use crate::rule_runtime::RuleRuntime;
use crate::upstream::UpstreamConnector;

/// Resolves the base URL a request should forward to, per spec.md
/// §4.3.3's "Target resolution": `Err(status)` short-circuits straight to
/// that response.
pub enum TargetResolution {
    Rule {
        rule_index: usize,
        base: Uri,
    },
    ForwardProxy {
        uri: Uri,
    },
    Reject {
        status: u16,
    },
}

pub fn resolve_target(
    listener: &ListenerConfig,
    matched: Option<usize>,
    runtimes: &[Arc<RuleRuntime>],
    registry: &LoadBalancerRegistry,
    uri: &Uri,
    client_ip: IpAddr,
) -> TargetResolution {
    match matched {
        None if !listener.rules.is_empty() => TargetResolution::Reject { status: 404 },
        None => TargetResolution::ForwardProxy { uri: uri.clone() },
        Some(idx) => {
            let rule = &listener.rules[idx];
            let runtime = &runtimes[idx];
            if runtime.try_acquire(client_ip) == Some(false) {
                return TargetResolution::Reject { status: 429 };
            }
            let all_targets = rule.get_all_targets();
            if all_targets.is_empty() {
                let Some(target) = &rule.target else {
                    return TargetResolution::Reject { status: 502 };
                };
                return TargetResolution::Rule {
                    rule_index: idx,
                    base: target.clone(),
                };
            }
            let healthy: Vec<Uri> = runtime.healthy_targets(&all_targets).into_iter().cloned().collect();
            let strategy = match runtime.strategy(registry) {
                Ok(s) => s,
                Err(_) => return TargetResolution::Reject { status: 502 },
            };
            let picked = strategy.select(&healthy, client_ip).clone();
            TargetResolution::Rule {
                rule_index: idx,
                base: picked,
            }
        }
    }
}

/// Builds the full target URL for a matched rule: `base` with the
/// request path's rule-prefix stripped and appended, plus the original
/// query string.
pub fn build_target_url(base: &Uri, rule: &Rule, uri: &Uri) -> Uri {
    let base_str = base.to_string();
    let base_trimmed = base_str.trim_end_matches('/');
    let request_path = uri.path();
    let prefix_len = rule.path.as_deref().map(str::len).unwrap_or(0);
    let mut suffix = request_path.get(prefix_len..).unwrap_or("").to_string();
    if !suffix.starts_with('/') {
        suffix.insert(0, '/');
    }
    let mut full = format!("{base_trimmed}{suffix}");
    if let Some(query) = uri.query() {
        full.push('?');
        full.push_str(query);
    }
    full.parse().unwrap_or_else(|_| base.clone())
}

/// Bodies at or above this size are streamed straight through to the
/// upstream connection instead of buffered in memory (spec.md §4.3.3).
/// A streamed body can't be replayed, so it forfeits redirect-following —
/// only a fully-buffered body under this threshold is redeliverable.
pub const STREAM_THRESHOLD: u64 = 64 * 1024;

/// Reads exactly `length` bytes of request body into memory. Used by the
/// main request loop for bodies under [`STREAM_THRESHOLD`], which need to
/// be redeliverable if the response turns out to be a redirect.
pub async fn read_body<R: AsyncBufRead + Unpin>(reader: &mut R, length: u64) -> std::io::Result<Vec<u8>> {
    if length == 0 {
        return Ok(Vec::new());
    }
    let mut buf = vec![0u8; length as usize];
    reader.read_exact(&mut buf).await?;
    Ok(buf)
}

/// Reads and discards `length` bytes — used when a request is denied
/// before routing but still has a body the client is about to send.
pub async fn drain_body<R: AsyncBufRead + Unpin>(reader: &mut R, length: u64) -> std::io::Result<()> {
    let mut remaining = length;
    let mut buf = [0u8; 4096];
    while remaining > 0 {
        let chunk = remaining.min(buf.len() as u64) as usize;
        reader.read_exact(&mut buf[..chunk]).await?;
        remaining -= chunk as u64;
    }
    Ok(())
}

pub fn content_length(headers: &Headers) -> u64 {
    header_value(headers, "content-length")
        .and_then(|v| v.parse().ok())
        .unwrap_or(0)
}

/// Builds the outbound request headers: strips the DISALLOWED set,
/// appends `X-Forwarded-*`, then merges in rule-injected headers
/// (overwriting on name conflict).
pub fn build_outbound_headers(
    inbound: &Headers,
    remote_ip: IpAddr,
    uri: &Uri,
    rule_headers: &std::collections::HashMap<String, String>,
) -> Headers {
    const DISALLOWED: &[&str] = &[
        "host",
        "proxy-authorization",
        "connection",
        "content-length",
        "transfer-encoding",
    ];
    let mut out: Headers = inbound
        .iter()
        .filter(|(name, _)| {
            !DISALLOWED.iter().any(|d| name.eq_ignore_ascii_case(d)) && !is_disallowed_inbound(name)
        })
        .cloned()
        .collect();

    let prior_xff = header_value(inbound, "x-forwarded-for");
    let xff = match prior_xff {
        Some(prior) => format!("{prior}, {remote_ip}"),
        None => remote_ip.to_string(),
    };
    out.push(("X-Forwarded-For".to_string(), xff));
    out.push((
        "X-Forwarded-Proto".to_string(),
        uri.scheme_str().unwrap_or("http").to_string(),
    ));
    out.push((
        "X-Forwarded-Host".to_string(),
        uri.host().unwrap_or_default().to_string(),
    ));

    for (name, value) in rule_headers {
        out.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
        out.push((name.clone(), value.clone()));
    }
    out
}

pub struct BackendResponse {
    pub status: u16,
    pub reason: String,
    pub headers: Headers,
    pub body: Vec<u8>,
}

/// Issues one request to `target` over a fresh connection (no connection
/// pooling — the teacher's per-request-connect model carries over
/// unchanged) and reads back the full response.
pub async fn issue_request(
    method: &str,
    target: &Uri,
    headers: &Headers,
    body: &[u8],
    listener: &ListenerConfig,
    rule_proxy: Option<&crate::config::UpstreamProxyConfig>,
    connect_timeout: Option<Duration>,
) -> Result<BackendResponse, UpstreamError> {
    let mut stream = connect_and_write_headers(method, target, headers, body.len() as u64, listener, rule_proxy, connect_timeout).await?;
    if !body.is_empty() {
        stream.write_all(body).await.map_err(UpstreamError::Io)?;
    }
    read_backend_response(&mut stream).await
}

/// Like [`issue_request`] but for bodies at or above [`STREAM_THRESHOLD`]:
/// the body is copied directly from `client` to the upstream connection
/// without ever landing fully in memory. Returns the number of body bytes
/// streamed alongside the response, since the caller needs it for its own
/// byte-count bookkeeping.
#[allow(clippy::too_many_arguments)]
pub async fn issue_request_streamed<R>(
    method: &str,
    target: &Uri,
    headers: &Headers,
    client: &mut R,
    length: u64,
    listener: &ListenerConfig,
    rule_proxy: Option<&crate::config::UpstreamProxyConfig>,
    connect_timeout: Option<Duration>,
) -> Result<(BackendResponse, u64), UpstreamError>
where
    R: AsyncRead + Unpin,
{
    let mut stream = connect_and_write_headers(method, target, headers, length, listener, rule_proxy, connect_timeout).await?;
    let copied = tokio::io::copy(&mut client.take(length), &mut stream)
        .await
        .map_err(UpstreamError::Io)?;
    let response = read_backend_response(&mut stream).await?;
    Ok((response, copied))
}

#[allow(clippy::too_many_arguments)]
async fn connect_and_write_headers(
    method: &str,
    target: &Uri,
    headers: &Headers,
    content_length: u64,
    listener: &ListenerConfig,
    rule_proxy: Option<&crate::config::UpstreamProxyConfig>,
    connect_timeout: Option<Duration>,
) -> Result<BufReader<tokio::net::TcpStream>, UpstreamError> {
    let proxy = rule_proxy.or(listener.upstream_proxy.as_ref());
    let stream = UpstreamConnector::connect(target, proxy, connect_timeout).await?;
    let mut stream = BufReader::new(stream);

    let path_and_query = target
        .path_and_query()
        .map(|p| p.to_string())
        .unwrap_or_else(|| "/".to_string());
    let host = target.host().unwrap_or_default();
    let mut request = format!("{method} {path_and_query} HTTP/1.1\r\n");
    request.push_str(&format!("Host: {host}\r\n"));
    for (name, value) in headers {
        request.push_str(&format!("{name}: {value}\r\n"));
    }
    request.push_str(&format!("Content-Length: {content_length}\r\n"));
    request.push_str("Connection: close\r\n\r\n");

    stream.write_all(request.as_bytes()).await.map_err(UpstreamError::Io)?;
    Ok(stream)
}

async fn read_backend_response<R: AsyncBufRead + Unpin>(
    stream: &mut R,
) -> Result<BackendResponse, UpstreamError> {
    let (status, reason) = read_status_line(stream)
        .await
        .map_err(UpstreamError::Io)?
        .ok_or_else(|| UpstreamError::ProxyHandshake("empty response".to_string()))?;

    let response_headers = parse::read_headers(stream)
        .await
        .map_err(UpstreamError::Io)?
        .map_err(|_| UpstreamError::ProxyHandshake("malformed response headers".to_string()))?;

    let body = read_response_body(stream, &response_headers).await.map_err(UpstreamError::Io)?;

    Ok(BackendResponse {
        status,
        reason,
        headers: response_headers,
        body,
    })
}

/// Reads `HTTP/1.1 <status> <reason>` and splits it into the status code
/// and reason phrase. `Ok(None)` on a connection that closed without
/// sending anything.
async fn read_status_line<R: AsyncBufRead + Unpin>(
    reader: &mut R,
) -> std::io::Result<Option<(u16, String)>> {
    let Some(raw) = parse::read_raw_line(reader).await? else {
        return Ok(None);
    };
    let mut parts = raw.splitn(3, ' ');
    let _version = parts.next();
    let status_str = parts.next().unwrap_or("");
    let reason = parts.next().unwrap_or("").to_string();
    let status: u16 = status_str
        .parse()
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidData, "bad status code"))?;
    Ok(Some((status, reason)))
}

async fn read_response_body<R: AsyncBufRead + Unpin>(
    reader: &mut R,
    headers: &Headers,
) -> std::io::Result<Vec<u8>> {
    if let Some(encoding) = header_value(headers, "transfer-encoding") {
        if encoding.eq_ignore_ascii_case("chunked") {
            return read_chunked_body(reader).await;
        }
    }
    let length = content_length(headers);
    if length > 0 || header_value(headers, "content-length").is_some() {
        let mut buf = vec![0u8; length as usize];
        reader.read_exact(&mut buf).await?;
        return Ok(buf);
    }
    let mut buf = Vec::new();
    reader.read_to_end(&mut buf).await?;
    Ok(buf)
}

async fn read_chunked_body<R: AsyncBufRead + Unpin>(reader: &mut R) -> std::io::Result<Vec<u8>> {
    let mut body = Vec::new();
    loop {
        let Some(size_line) = parse::read_raw_line(reader).await? else {
            break;
        };
        let size_hex = size_line.split(';').next().unwrap_or("0").trim();
        let size = u64::from_str_radix(size_hex, 16).unwrap_or(0);
        if size == 0 {
            // Trailing headers block (usually just the blank line).
            let _ = parse::read_headers(reader).await;
            break;
        }
        let mut chunk = vec![0u8; size as usize];
        reader.read_exact(&mut chunk).await?;
        body.extend_from_slice(&chunk);
        let mut crlf = [0u8; 2];
        reader.read_exact(&mut crlf).await?;
    }
    Ok(body)
}

/// Rewrites `Location`/`Content-Location` under reverse mode (spec.md
/// §4.3.3, §9 "reverse mode"): if the value begins with any of the
/// rule's configured targets, replace that prefix with the public base
/// URL for this request.
pub fn rewrite_reverse_header(value: &str, rule: &Rule, request_uri: &Uri) -> String {
    let targets = rule.get_all_targets();
    for target in &targets {
        let target_str = target.to_string();
        let target_trimmed = target_str.trim_end_matches('/');
        if let Some(suffix) = value.strip_prefix(target_trimmed) {
            let public_base = public_base_url(rule, request_uri);
            return format!("{public_base}{suffix}");
        }
    }
    value.to_string()
}

fn public_base_url(rule: &Rule, request_uri: &Uri) -> String {
    let scheme = request_uri.scheme_str().unwrap_or("http");
    let host = request_uri.host().unwrap_or_default();
    let port_part = match request_uri.port_u16() {
        Some(443) if scheme == "https" => String::new(),
        Some(80) if scheme == "http" => String::new(),
        Some(p) => format!(":{p}"),
        None => String::new(),
    };
    let path = rule.path.clone().unwrap_or_default();
    format!("{scheme}://{host}{port_part}{path}")
}

/// Writes a response line + headers (minus hop-by-hop) + body to the
/// client.
pub async fn write_response<W: AsyncWrite + Unpin>(
    writer: &mut W,
    status: u16,
    reason: &str,
    headers: &Headers,
    body: &[u8],
) -> std::io::Result<()> {
    let reason = if reason.is_empty() {
        reason_phrase(status)
    } else {
        reason
    };
    writer
        .write_all(format!("HTTP/1.1 {status} {reason}\r\n").as_bytes())
        .await?;
    let mut wrote_length = false;
    for (name, value) in headers {
        if is_hop_by_hop(name) {
            continue;
        }
        if name.eq_ignore_ascii_case("content-length") {
            wrote_length = true;
        }
        writer.write_all(format!("{name}: {value}\r\n").as_bytes()).await?;
    }
    if !wrote_length {
        writer
            .write_all(format!("Content-Length: {}\r\n", body.len()).as_bytes())
            .await?;
    }
    writer.write_all(b"\r\n").await?;
    writer.write_all(body).await?;
    Ok(())
}

pub async fn write_simple_status<W: AsyncWrite + Unpin>(writer: &mut W, status: u16) -> std::io::Result<()> {
    let reason = reason_phrase(status);
    writer
        .write_all(format!("HTTP/1.1 {status} {reason}\r\nContent-Length: 0\r\n\r\n").as_bytes())
        .await
}
