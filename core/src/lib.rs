//! # proxy-core
//!
//! The request-path runtime for a multi-protocol TCP proxy: connection
//! lifecycle and bounded concurrency per listener, an HTTP/1.1 engine
//! (routing, CONNECT/WebSocket tunneling, reverse-proxy rewriting), the
//! SOCKS4/4a and SOCKS5 state machines, the routing/rate-limit/
//! load-balance/health subsystem, an upstream-proxy connector, and the
//! orchestrator that diffs configuration snapshots and restarts only the
//! listeners that changed.
//!
//! Everything this crate needs from the outside world — where
//! configuration comes from, who counts as an authenticated user, how
//! TLS keystores are loaded, where access-log lines and metrics go —
//! arrives through the traits in [`collaborators`]. This crate ships one
//! small, non-YAML, non-admin-API implementation of each so it compiles
//! and runs standalone; wiring a production-grade collaborator (a file
//! watcher, an admin HTTP API, a metrics scrape endpoint) is left to the
//! embedding process.

pub mod collaborators;
pub mod config;
pub mod error;
pub mod health;
pub mod http_engine;
pub mod listener;
pub mod load_balancer;
pub mod orchestrator;
pub mod reason;
pub mod relay;
pub mod rule_matcher;
pub mod rule_runtime;
pub mod runtime_context;
pub mod socks4;
pub mod socks5;
pub mod token_bucket;
pub mod upstream;

pub use config::Configuration;
pub use orchestrator::Orchestrator;
