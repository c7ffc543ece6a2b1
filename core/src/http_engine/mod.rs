//! Per-connection HTTP/1.1 engine (spec.md §4.3).
//!
//! [`serve`] runs the request loop described in spec.md §4.3 over one
//! already-accepted (and, if the listener is TLS, already-wrapped)
//! connection: parse, pre-handlers, route to CONNECT/WebSocket/regular
//! forwarding, loop while keep-alive holds.

pub mod connect;
pub mod filters;
pub mod forward;
pub mod parse;
pub mod websocket;

use std::net::IpAddr;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};

use crate::http_engine::filters::{AuthFilter, FilterOutcome, LoggingFilter, PreHandler, RequestContext};
use crate::http_engine::parse::header_value;
use crate::reason::reason_phrase;
use crate::rule_matcher::match_rule_index;
use crate::runtime_context::ListenerRuntime;

pub async fn serve<S>(stream: S, runtime: Arc<ListenerRuntime>, client_ip: IpAddr) -> std::io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut stream = BufReader::new(stream);

    loop {
        let request_line = match parse::read_request_line(&mut stream).await? {
            Ok(Some(rl)) => rl,
            Ok(None) => break,
            Err(_) => {
                write_bad_request(&mut stream).await?;
                break;
            }
        };

        let headers = match parse::read_headers(&mut stream).await? {
            Ok(h) => h,
            Err(_) => {
                write_bad_request(&mut stream).await?;
                break;
            }
        };

        let uri = match parse::resolve_uri(&request_line.method, &request_line.target, &headers) {
            Ok(u) => u,
            Err(_) => {
                write_bad_request(&mut stream).await?;
                break;
            }
        };

        let length = forward::content_length(&headers);
        let mut ctx = RequestContext::new(request_line.method.clone(), uri.clone(), headers.clone(), client_ip);

        let auth_filter = AuthFilter {
            enabled: runtime.config.auth_enabled,
            credentials: runtime.credentials.clone(),
            realm: "proxy".to_string(),
        };
        let logging_filter = LoggingFilter;
        let handlers: [&dyn PreHandler; 2] = [&auth_filter, &logging_filter];

        if let FilterOutcome::Deny { status } = filters::run_pre_handlers(&handlers, &mut ctx) {
            forward::drain_body(&mut stream, length).await?;
            write_denied(&mut stream, status).await?;
            logging_filter.post_handle(&ctx, status, runtime.access_log.as_ref());
            break;
        }

        if request_line.method.eq_ignore_ascii_case("CONNECT") {
            let stats = connect::serve_connect(&mut stream, &request_line.target, &runtime).await?;
            if let Some(stats) = stats {
                ctx.bytes_in = stats.bytes_client_to_upstream;
                ctx.bytes_out = stats.bytes_upstream_to_client;
            }
            logging_filter.post_handle(&ctx, 200, runtime.access_log.as_ref());
            record_traffic(&runtime, &ctx);
            return Ok(());
        }

        let host = uri.host().map(str::to_string);
        let is_websocket = header_value(&headers, "upgrade")
            .map(|v| v.eq_ignore_ascii_case("websocket"))
            .unwrap_or(false);

        if is_websocket {
            let matched = match_rule_index(&runtime.config.rules, host.as_deref(), Some(uri.path()));
            let status = match matched {
                Some(idx) => {
                    let rule = &runtime.config.rules[idx];
                    let rule_runtime = &runtime.rule_runtimes[idx];
                    let target = websocket::resolve_handshake_target(
                        rule,
                        rule_runtime,
                        &runtime.lb_registry,
                        client_ip,
                    );
                    match target {
                        Some(target) => {
                            let stats = websocket::serve_websocket(
                                &mut stream,
                                &request_line.method,
                                &request_line.target,
                                &headers,
                                &target,
                                &runtime,
                            )
                            .await?;
                            if let Some(stats) = stats {
                                ctx.bytes_in = stats.bytes_client_to_upstream;
                                ctx.bytes_out = stats.bytes_upstream_to_client;
                            }
                            101
                        }
                        None => {
                            write_denied(&mut stream, 502).await?;
                            502
                        }
                    }
                }
                None => {
                    write_denied(&mut stream, 404).await?;
                    404
                }
            };
            logging_filter.post_handle(&ctx, status, runtime.access_log.as_ref());
            record_traffic(&runtime, &ctx);
            return Ok(());
        }

        let matched = match_rule_index(&runtime.config.rules, host.as_deref(), Some(uri.path()));
        let status = handle_regular(&mut stream, &request_line.method, &headers, &uri, matched, &runtime, client_ip, &mut ctx).await?;
        logging_filter.post_handle(&ctx, status, runtime.access_log.as_ref());
        runtime.metrics.increment_counter(
            "proxy.http.requests.total",
            &[("name", &runtime.config.key())],
            1,
        );
        record_traffic(&runtime, &ctx);

        let client_close = header_value(&headers, "connection")
            .map(|v| v.eq_ignore_ascii_case("close"))
            .unwrap_or(false);
        if !runtime.config.keep_alive || client_close {
            break;
        }
    }
    Ok(())
}

/// Handles steps 8-9 of spec.md §4.3: target resolution, redirect
/// following, reverse-mode rewriting, response forwarding.
async fn handle_regular<S>(
    stream: &mut BufReader<S>,
    method: &str,
    headers: &parse::Headers,
    uri: &http::Uri,
    matched: Option<usize>,
    runtime: &ListenerRuntime,
    client_ip: IpAddr,
    ctx: &mut RequestContext,
) -> std::io::Result<u16>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let length = forward::content_length(headers);

    let resolution = forward::resolve_target(
        &runtime.config,
        matched,
        &runtime.rule_runtimes,
        &runtime.lb_registry,
        uri,
        client_ip,
    );

    let (rule_index, mut current_target) = match resolution {
        forward::TargetResolution::Reject { status } => {
            forward::drain_body(stream, length).await?;
            write_denied(stream, status).await?;
            return Ok(status);
        }
        forward::TargetResolution::ForwardProxy { uri } => (None, uri),
        forward::TargetResolution::Rule { rule_index, base } => {
            let rule = &runtime.config.rules[rule_index];
            (Some(rule_index), forward::build_target_url(&base, rule, uri))
        }
    };

    if length >= forward::STREAM_THRESHOLD {
        return handle_streamed_body(stream, method, headers, uri, rule_index, current_target, length, runtime, client_ip, ctx).await;
    }

    let body = forward::read_body(stream, length).await?;
    ctx.bytes_in = body.len() as u64;

    let mut redirects_left = runtime.config.max_redirects;
    let mut outbound_body = body;

    loop {
        let rule_headers = rule_index
            .map(|idx| runtime.config.rules[idx].headers.clone())
            .unwrap_or_default();
        let outbound_headers = forward::build_outbound_headers(headers, client_ip, uri, &rule_headers);
        let rule_proxy = rule_index.and_then(|idx| runtime.config.rules[idx].upstream_proxy.as_ref());

        let response = forward::issue_request(
            method,
            &current_target,
            &outbound_headers,
            &outbound_body,
            &runtime.config,
            rule_proxy,
            runtime.connect_timeout(),
        )
        .await;

        let response = match response {
            Ok(r) => r,
            Err(_) => {
                write_denied(stream, 502).await?;
                return Ok(502);
            }
        };

        let is_redirect = (300..400).contains(&response.status);
        let location = parse::header_value(&response.headers, "location").map(str::to_string);

        if is_redirect && redirects_left > 0 {
            if let Some(location) = location {
                if let Ok(next) = resolve_redirect_target(&current_target, &location) {
                    redirects_left -= 1;
                    current_target = next;
                    outbound_body = Vec::new();
                    continue;
                }
            }
        }

        let mut response_headers = response.headers;
        if let Some(idx) = rule_index {
            let rule = &runtime.config.rules[idx];
            if rule.reverse {
                for (name, value) in response_headers.iter_mut() {
                    if name.eq_ignore_ascii_case("location") || name.eq_ignore_ascii_case("content-location") {
                        *value = forward::rewrite_reverse_header(value, rule, uri);
                    }
                }
            }
        }

        ctx.bytes_out = response.body.len() as u64;
        forward::write_response(stream, response.status, &response.reason, &response_headers, &response.body)
            .await?;
        return Ok(response.status);
    }
}

/// Emits `proxy.traffic.bytes.received`/`.sent` for one finished
/// request/tunnel: bytes received from the client and bytes sent back
/// to it, per spec.md §6.
fn record_traffic(runtime: &ListenerRuntime, ctx: &RequestContext) {
    let name = runtime.config.key();
    runtime
        .metrics
        .increment_counter("proxy.traffic.bytes.received", &[("name", &name)], ctx.bytes_in);
    runtime
        .metrics
        .increment_counter("proxy.traffic.bytes.sent", &[("name", &name)], ctx.bytes_out);
}

/// Handles a request body at or above [`forward::STREAM_THRESHOLD`]:
/// streamed straight to the upstream connection rather than buffered, per
/// spec.md §4.3.3. A streamed body can't be replayed, so redirects are
/// not followed here — the first response, whatever it is, goes straight
/// back to the client.
#[allow(clippy::too_many_arguments)]
async fn handle_streamed_body<S>(
    stream: &mut BufReader<S>,
    method: &str,
    headers: &parse::Headers,
    uri: &http::Uri,
    rule_index: Option<usize>,
    target: http::Uri,
    length: u64,
    runtime: &ListenerRuntime,
    client_ip: IpAddr,
    ctx: &mut RequestContext,
) -> std::io::Result<u16>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let rule_headers = rule_index
        .map(|idx| runtime.config.rules[idx].headers.clone())
        .unwrap_or_default();
    let outbound_headers = forward::build_outbound_headers(headers, client_ip, uri, &rule_headers);
    let rule_proxy = rule_index.and_then(|idx| runtime.config.rules[idx].upstream_proxy.as_ref());

    let result = forward::issue_request_streamed(
        method,
        &target,
        &outbound_headers,
        stream,
        length,
        &runtime.config,
        rule_proxy,
        runtime.connect_timeout(),
    )
    .await;

    let (response, streamed) = match result {
        Ok(pair) => pair,
        Err(_) => {
            write_denied(stream, 502).await?;
            return Ok(502);
        }
    };
    ctx.bytes_in = streamed;

    let mut response_headers = response.headers;
    if let Some(idx) = rule_index {
        let rule = &runtime.config.rules[idx];
        if rule.reverse {
            for (name, value) in response_headers.iter_mut() {
                if name.eq_ignore_ascii_case("location") || name.eq_ignore_ascii_case("content-location") {
                    *value = forward::rewrite_reverse_header(value, rule, uri);
                }
            }
        }
    }

    ctx.bytes_out = response.body.len() as u64;
    forward::write_response(stream, response.status, &response.reason, &response_headers, &response.body).await?;
    Ok(response.status)
}

fn resolve_redirect_target(current: &http::Uri, location: &str) -> Result<http::Uri, http::uri::InvalidUri> {
    if location.starts_with("http://") || location.starts_with("https://") {
        return location.parse();
    }
    let scheme = current.scheme_str().unwrap_or("http");
    let authority = current
        .authority()
        .map(|a| a.to_string())
        .unwrap_or_default();
    if location.starts_with('/') {
        format!("{scheme}://{authority}{location}").parse()
    } else {
        let base_path = current.path().rsplit_once('/').map(|(p, _)| p).unwrap_or("");
        format!("{scheme}://{authority}{base_path}/{location}").parse()
    }
}

async fn write_bad_request<W: AsyncWrite + Unpin>(writer: &mut W) -> std::io::Result<()> {
    writer
        .write_all(b"HTTP/1.1 400 Bad Request\r\nContent-Length: 0\r\nConnection: close\r\n\r\n")
        .await
}

async fn write_denied<W: AsyncWrite + Unpin>(writer: &mut W, status: u16) -> std::io::Result<()> {
    if status == 407 {
        writer
            .write_all(
                format!(
                    "HTTP/1.1 407 {}\r\nProxy-Authenticate: Basic realm=\"proxy\"\r\nContent-Length: 0\r\n\r\n",
                    reason_phrase(407)
                )
                .as_bytes(),
            )
            .await
    } else {
        forward::write_simple_status(writer, status).await
    }
}
