//! Pre/post request handlers (spec.md §4.3 step 5, §2 "AuthFilter,
//! LoggingFilter").
//!
//! The request loop runs the pre-handler chain `[AuthFilter,
//! LoggingFilter]` before routing; a `Deny` from either one short-circuits
//! the request. `LoggingFilter` never denies — it only records a start
//! time — but participates in the same chain shape as AuthFilter so the
//! loop doesn't need two different kinds of handler list.

use std::net::IpAddr;
use std::time::Instant;

use http::Uri;

use crate::collaborators::CredentialsSink;
use crate::http_engine::parse::{header_value, Headers};

pub struct RequestContext {
    pub method: String,
    pub uri: Uri,
    pub headers: Headers,
    pub remote_ip: IpAddr,
    pub user: Option<String>,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub started_at: Instant,
}

impl RequestContext {
    pub fn new(method: String, uri: Uri, headers: Headers, remote_ip: IpAddr) -> Self {
        RequestContext {
            method,
            uri,
            headers,
            remote_ip,
            user: None,
            bytes_in: 0,
            bytes_out: 0,
            started_at: Instant::now(),
        }
    }
}

pub enum FilterOutcome {
    Allow,
    Deny { status: u16 },
}

pub trait PreHandler: Send + Sync {
    fn pre_handle(&self, ctx: &mut RequestContext) -> FilterOutcome;
}

/// Enforces `listener.authEnabled` against HTTP Basic credentials
/// (spec.md §4.10). A no-op when auth isn't enabled for the listener.
pub struct AuthFilter {
    pub enabled: bool,
    pub credentials: Option<std::sync::Arc<dyn CredentialsSink>>,
    pub realm: String,
}

impl PreHandler for AuthFilter {
    fn pre_handle(&self, ctx: &mut RequestContext) -> FilterOutcome {
        if !self.enabled {
            return FilterOutcome::Allow;
        }
        let Some(sink) = &self.credentials else {
            return FilterOutcome::Deny { status: 407 };
        };
        let Some(auth) = header_value(&ctx.headers, "authorization") else {
            return FilterOutcome::Deny { status: 407 };
        };
        if !sink.authenticate_basic(auth) {
            return FilterOutcome::Deny { status: 407 };
        }
        // The basic auth payload's username is re-extracted here only for
        // logging; the sink already validated the password above.
        if let Some(encoded) = auth.strip_prefix("Basic ") {
            use base64::Engine as _;
            if let Ok(decoded) = base64::engine::general_purpose::STANDARD.decode(encoded.trim()) {
                if let Ok(text) = String::from_utf8(decoded) {
                    if let Some((user, _)) = text.split_once(':') {
                        ctx.user = Some(user.to_string());
                    }
                }
            }
        }
        FilterOutcome::Allow
    }
}

/// Never denies; exists to complete the `[AuthFilter, LoggingFilter]`
/// pre-handler chain named in spec.md §2. The actual logging happens in
/// `post_handle`, invoked once the response status is known.
pub struct LoggingFilter;

impl PreHandler for LoggingFilter {
    fn pre_handle(&self, _ctx: &mut RequestContext) -> FilterOutcome {
        FilterOutcome::Allow
    }
}

impl LoggingFilter {
    pub fn post_handle(
        &self,
        ctx: &RequestContext,
        status: u16,
        sink: &dyn crate::collaborators::AccessLogSink,
    ) {
        sink.log_http(crate::collaborators::HttpAccessRecord {
            client_ip: ctx.remote_ip,
            user: ctx.user.clone(),
            method: ctx.method.clone(),
            target: ctx.uri.to_string(),
            status,
            bytes_in: ctx.bytes_in,
            bytes_out: ctx.bytes_out,
            duration_ms: ctx.started_at.elapsed().as_millis() as u64,
        });
    }
}

/// Runs the pre-handler chain in order; returns the first `Deny`, if any.
pub fn run_pre_handlers(handlers: &[&dyn PreHandler], ctx: &mut RequestContext) -> FilterOutcome {
    for handler in handlers {
        if let FilterOutcome::Deny { status } = handler.pre_handle(ctx) {
            return FilterOutcome::Deny { status };
        }
    }
    FilterOutcome::Allow
}
