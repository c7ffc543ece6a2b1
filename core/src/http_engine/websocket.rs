//! WebSocket tunnel (spec.md §4.3.2).
//!
//! "Match a rule on host+path; resolve single-target URL (no rate
//! limiting, no load balancing for the handshake itself — the rule's
//! `target` or LB-selected target is used). Open upstream, replay the
//! original request line and headers verbatim, then bidirectional
//! relay."

use http::Uri;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

use crate::config::Rule;
use crate::http_engine::parse::Headers;
use crate::load_balancer::LoadBalancerRegistry;
use crate::relay::{relay, RelayStats};
use crate::rule_runtime::RuleRuntime;
use crate::runtime_context::ListenerRuntime;

/// Picks the rule's single target: `targets`, LB-selected (but without
/// consuming a rate-limit token — the handshake itself is exempt), else
/// `target`.
pub fn resolve_handshake_target(
    rule: &Rule,
    runtime: &RuleRuntime,
    registry: &LoadBalancerRegistry,
    client_ip: std::net::IpAddr,
) -> Option<Uri> {
    let all = rule.get_all_targets();
    if all.is_empty() {
        return rule.target.clone();
    }
    let healthy = runtime.healthy_targets(&all);
    let strategy = runtime.strategy(registry).ok()?;
    let owned: Vec<Uri> = healthy.into_iter().cloned().collect();
    Some(strategy.select(&owned, client_ip).clone())
}

pub async fn serve_websocket<S>(
    stream: &mut S,
    method: &str,
    target: &str,
    headers: &Headers,
    upstream_target: &Uri,
    runtime: &ListenerRuntime,
) -> std::io::Result<Option<RelayStats>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut upstream = match runtime.connect_upstream(upstream_target, None).await {
        Ok(s) => s,
        Err(_) => {
            stream
                .write_all(b"HTTP/1.1 502 Bad Gateway\r\nContent-Length: 0\r\n\r\n")
                .await?;
            return Ok(None);
        }
    };

    let mut request = format!("{method} {target} HTTP/1.1\r\n");
    for (name, value) in headers {
        request.push_str(&format!("{name}: {value}\r\n"));
    }
    request.push_str("\r\n");
    upstream.write_all(request.as_bytes()).await?;

    let stats = relay(stream, &mut upstream).await?;
    Ok(Some(stats))
}
