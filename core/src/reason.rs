//! Wire-level constants for the HTTP engine (spec.md §4.3.3).

/// Canonical reason phrase for a status code, used when building a
/// response line from a status alone (e.g. synthesized errors, not
/// forwarded responses — a forwarded response's own reason phrase is
/// passed through unchanged).
pub fn reason_phrase(status: u16) -> &'static str {
    match status {
        100 => "Continue",
        101 => "Switching Protocols",
        200 => "OK",
        201 => "Created",
        202 => "Accepted",
        204 => "No Content",
        206 => "Partial Content",
        300 => "Multiple Choices",
        301 => "Moved Permanently",
        302 => "Found",
        303 => "See Other",
        304 => "Not Modified",
        307 => "Temporary Redirect",
        308 => "Permanent Redirect",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        407 => "Proxy Authentication Required",
        408 => "Request Timeout",
        413 => "Payload Too Large",
        429 => "Too Many Requests",
        500 => "Internal Server Error",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        _ => "Unknown",
    }
}

/// Headers a reverse/forward proxy must not forward verbatim between
/// client and upstream because they describe the hop itself rather than
/// the message (RFC 7230 §6.1 plus `Proxy-Authorization`/`Proxy-Connection`,
/// which never belong on the wire past the proxy that consumed them).
pub const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Additional headers the proxy itself sets and never accepts a
/// client-supplied value for, since trusting an inbound value here would
/// let a client spoof proxy-internal bookkeeping.
pub const DISALLOWED_INBOUND_HEADERS: &[&str] = &["x-forwarded-for", "x-forwarded-proto"];

pub fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP_HEADERS.iter().any(|h| h.eq_ignore_ascii_case(name))
}

pub fn is_disallowed_inbound(name: &str) -> bool {
    DISALLOWED_INBOUND_HEADERS
        .iter()
        .any(|h| h.eq_ignore_ascii_case(name))
}
