//! Collaborator contracts (spec.md §6, SPEC_FULL.md §4.12).
//!
//! The core never watches files, parses YAML, serves an admin API, or
//! rotates logs — those are explicitly out of scope (spec.md §1). What
//! the core *does* need is a stable seam to receive configuration,
//! authenticate users, terminate TLS, and emit logs/metrics. Each seam is
//! a trait here, plus one small concrete implementation so the crate
//! still runs end to end without a real admin surface behind it.

pub mod access_log;
pub mod config_source;
pub mod credentials;
pub mod metrics;
pub mod tls;

pub use access_log::{AccessLogSink, AccessRecord, ChannelAccessLogSink, HttpAccessRecord, SocksAccessRecord};
pub use config_source::{ConfigSource, JsonFileConfigSource, StaticConfigSource};
pub use credentials::{CredentialsSink, StaticCredentials};
pub use metrics::{AtomicMetrics, MetricsSink, NoopMetrics};
pub use tls::{OpenSslTlsListenerFactory, TlsListener, TlsListenerFactory};
