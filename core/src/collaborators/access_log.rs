//! Access log sink (spec.md §6 (iv)).
//!
//! "Receives one structured record per completed request/connection...
//! Log rotation, shipping, and formatting beyond a single structured
//! record are collaborator concerns." The shipped sink here queues
//! records onto a bounded channel and drains them to the `log` crate at
//! info level; a full queue drops the oldest record rather than blocking
//! the connection that's trying to log.

use std::net::IpAddr;

use async_channel::{Receiver, Sender, TrySendError};

/// One HTTP request/response pair.
#[derive(Debug, Clone)]
pub struct HttpAccessRecord {
    pub client_ip: IpAddr,
    pub user: Option<String>,
    pub method: String,
    pub target: String,
    pub status: u16,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub duration_ms: u64,
}

/// One SOCKS4/SOCKS5 tunnel, logged once it closes (or once the request
/// is refused — `reply_code` is the wire reply byte sent to the client,
/// e.g. `0x5A`/`0x5B` for SOCKS4 or `0x00`/`0x04` for SOCKS5).
#[derive(Debug, Clone)]
pub struct SocksAccessRecord {
    pub client_ip: IpAddr,
    pub destination: String,
    pub protocol: String,
    pub reply_code: u8,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub duration_ms: u64,
}

#[derive(Debug, Clone)]
pub enum AccessRecord {
    Http(HttpAccessRecord),
    Socks(SocksAccessRecord),
}

pub trait AccessLogSink: Send + Sync {
    fn log_http(&self, record: HttpAccessRecord);
    fn log_socks(&self, record: SocksAccessRecord);
}

/// Bounded-queue sink backed by `async-channel`. Overflow policy: drop the
/// incoming record and emit a single debug-level note, rather than
/// blocking the caller or growing without limit.
pub struct ChannelAccessLogSink {
    tx: Sender<AccessRecord>,
}

impl ChannelAccessLogSink {
    pub fn new(capacity: usize) -> (Self, Receiver<AccessRecord>) {
        let (tx, rx) = async_channel::bounded(capacity);
        (ChannelAccessLogSink { tx }, rx)
    }

    fn offer(&self, record: AccessRecord) {
        match self.tx.try_send(record) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                log::debug!("access log queue full, dropping record");
            }
            Err(TrySendError::Closed(_)) => {
                log::debug!("access log queue closed, dropping record");
            }
        }
    }
}

impl AccessLogSink for ChannelAccessLogSink {
    fn log_http(&self, record: HttpAccessRecord) {
        self.offer(AccessRecord::Http(record));
    }

    fn log_socks(&self, record: SocksAccessRecord) {
        self.offer(AccessRecord::Socks(record));
    }
}

/// Drains records from the receiver side of a [`ChannelAccessLogSink`] and
/// writes them through the `log` crate. Runs for the lifetime of the
/// process; the orchestrator spawns exactly one of these per sink.
pub async fn drain_to_log(rx: Receiver<AccessRecord>) {
    while let Ok(record) = rx.recv().await {
        match record {
            AccessRecord::Http(r) => log::info!(
                "{} {} \"{} {}\" {} in={} out={} {}ms",
                r.client_ip,
                r.user.as_deref().unwrap_or("-"),
                r.method,
                r.target,
                r.status,
                r.bytes_in,
                r.bytes_out,
                r.duration_ms
            ),
            AccessRecord::Socks(r) => log::info!(
                "{} {} -> {} reply={:#04x} in={} out={} {}ms",
                r.client_ip,
                r.protocol,
                r.destination,
                r.reply_code,
                r.bytes_in,
                r.bytes_out,
                r.duration_ms
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn full_queue_drops_instead_of_blocking() {
        let (sink, rx) = ChannelAccessLogSink::new(1);
        let record = || HttpAccessRecord {
            client_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            user: None,
            method: "GET".to_string(),
            target: "/".to_string(),
            status: 200,
            bytes_in: 0,
            bytes_out: 0,
            duration_ms: 0,
        };
        sink.log_http(record());
        sink.log_http(record());
        assert_eq!(rx.len(), 1);
    }
}
