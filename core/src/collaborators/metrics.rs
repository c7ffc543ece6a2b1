//! Metrics sink (spec.md §6 (v)).
//!
//! "Receives counter/gauge updates keyed by listener and rule name.
//! Aggregation, scraping format, and exposition are collaborator
//! concerns." The shipped sink keeps an in-memory atomic table; nothing
//! here serves a `/metrics` endpoint or speaks any particular exposition
//! format.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::RwLock;

/// Named per spec.md §6: `proxy.connections.total`,
/// `proxy.connections.errors`, `proxy.connections.active`,
/// `proxy.http.requests.total`, `proxy.socks4.requests.total`,
/// `proxy.socks5.requests.total`, `proxy.traffic.bytes.sent`,
/// `proxy.traffic.bytes.received`, tagged by listener `name`.
pub trait MetricsSink: Send + Sync {
    fn increment_counter(&self, name: &str, labels: &[(&str, &str)], delta: u64);
    fn set_gauge(&self, name: &str, labels: &[(&str, &str)], value: i64);
}

fn key(name: &str, labels: &[(&str, &str)]) -> String {
    let mut k = String::from(name);
    for (l, v) in labels {
        k.push('{');
        k.push_str(l);
        k.push('=');
        k.push_str(v);
        k.push('}');
    }
    k
}

/// Plain in-process atomic table, read back only by tests or an embedding
/// process; no scrape surface is exposed by core itself.
#[derive(Default)]
pub struct AtomicMetrics {
    counters: RwLock<HashMap<String, AtomicU64>>,
    gauges: RwLock<HashMap<String, AtomicI64>>,
}

impl AtomicMetrics {
    pub fn new() -> Self {
        AtomicMetrics::default()
    }

    pub fn counter_value(&self, name: &str, labels: &[(&str, &str)]) -> u64 {
        self.counters
            .read()
            .unwrap()
            .get(&key(name, labels))
            .map(|a| a.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn gauge_value(&self, name: &str, labels: &[(&str, &str)]) -> i64 {
        self.gauges
            .read()
            .unwrap()
            .get(&key(name, labels))
            .map(|a| a.load(Ordering::Relaxed))
            .unwrap_or(0)
    }
}

impl MetricsSink for AtomicMetrics {
    fn increment_counter(&self, name: &str, labels: &[(&str, &str)], delta: u64) {
        let k = key(name, labels);
        if let Some(existing) = self.counters.read().unwrap().get(&k) {
            existing.fetch_add(delta, Ordering::Relaxed);
            return;
        }
        let mut counters = self.counters.write().unwrap();
        counters
            .entry(k)
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(delta, Ordering::Relaxed);
    }

    fn set_gauge(&self, name: &str, labels: &[(&str, &str)], value: i64) {
        let k = key(name, labels);
        if let Some(existing) = self.gauges.read().unwrap().get(&k) {
            existing.store(value, Ordering::Relaxed);
            return;
        }
        let mut gauges = self.gauges.write().unwrap();
        gauges
            .entry(k)
            .or_insert_with(|| AtomicI64::new(0))
            .store(value, Ordering::Relaxed);
    }
}

/// A sink that discards every update; used wherever a `MetricsSink` is
/// required but the embedding process doesn't care to collect any.
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn increment_counter(&self, _name: &str, _labels: &[(&str, &str)], _delta: u64) {}
    fn set_gauge(&self, _name: &str, _labels: &[(&str, &str)], _value: i64) {}
}
