//! Design-level error kinds (spec.md §7).
//!
//! Each kind maps to a wire-level response at the engine boundary; none of
//! them ever escapes a connection's handling task.

use std::net::IpAddr;
use thiserror::Error;

/// Malformed configuration. Fatal for the affected listener only; never
/// propagates past the orchestrator boundary.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("keystore not found at {0}")]
    KeystoreMissing(String),
    #[error("keystore password rejected for {0}")]
    KeystorePassword(String),
    #[error("health check path {0:?} must start with '/' and contain no '..' segment")]
    InvalidHealthCheckPath(String),
    #[error("upstream proxy {host}:{port} is SOCKS5 with credentials, which is unsupported")]
    UpstreamSocks5Auth { host: String, port: u16 },
    #[error("load balancer {0:?} is not registered")]
    UnknownLoadBalancer(String),
}

/// Malformed request from a client. Response: HTTP 400, or the matching
/// SOCKS reply code, followed by close. Logged at warn, never retried.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("request line exceeded 8 KiB")]
    RequestLineTooLong,
    #[error("more than 100 headers")]
    TooManyHeaders,
    #[error("malformed request-target")]
    BadRequestTarget,
    #[error("unsupported SOCKS version {0}")]
    BadSocksVersion(u8),
    #[error("unsupported SOCKS5 address type {0}")]
    BadAtyp(u8),
    #[error("zero-length username or password in RFC 1929 sub-negotiation")]
    EmptyCredential,
    #[error("unsupported SOCKS command, only CONNECT is implemented")]
    UnsupportedCommand,
}

/// Connect or I/O failure to the backend. Response: HTTP 502, SOCKS5 reply
/// 4, SOCKS4 reply 91. Never retried beyond configured redirect handling.
#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("connect to {0} failed: {1}")]
    Connect(String, std::io::Error),
    #[error("upstream proxy handshake failed: {0}")]
    ProxyHandshake(String),
    #[error("i/o error talking to backend: {0}")]
    Io(#[from] std::io::Error),
}

/// Authentication failed. Response: HTTP 407, SOCKS5 0x01 0x01, SOCKS4
/// reply 91.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("credentials rejected")]
    Rejected,
    #[error("client {0} is blacklisted")]
    Blacklisted(IpAddr),
}
