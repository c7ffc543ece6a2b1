//! Load balancing strategies (spec.md §4.6, §9 "plugin load balancers").
//!
//! A [`LoadBalancer`] picks one target out of a rule's healthy pool.
//! Built-ins are round-robin and IP-hash; a `Custom` rule name resolves
//! through [`LoadBalancerRegistry`], letting an embedding process plug in
//! its own strategy without the core knowing its name in advance.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};

use http::Uri;

use crate::error::ConfigError;

/// Implementations must be safe to call concurrently from many connection
/// tasks sharing one [`crate::rule_runtime::RuleRuntime`].
pub trait LoadBalancer: Send + Sync {
    /// Picks one of `targets` given the requesting client's address.
    /// `targets` is never empty when this is called — callers filter out
    /// unhealthy targets and short-circuit to a 503 if none remain.
    fn select<'a>(&self, targets: &'a [Uri], client_ip: IpAddr) -> &'a Uri;
}

/// Cycles through targets in order, ignoring the client address. The
/// counter wraps via modulo so it never needs resetting.
#[derive(Default)]
pub struct RoundRobin {
    next: AtomicUsize,
}

impl RoundRobin {
    pub fn new() -> Self {
        RoundRobin::default()
    }
}

impl LoadBalancer for RoundRobin {
    fn select<'a>(&self, targets: &'a [Uri], _client_ip: IpAddr) -> &'a Uri {
        let i = self.next.fetch_add(1, Ordering::Relaxed) % targets.len();
        &targets[i]
    }
}

/// Deterministic per-client target: the same client IP always lands on
/// the same backend as long as the pool's size doesn't change, which is
/// useful for session affinity without a shared session store.
#[derive(Default)]
pub struct IpHash;

impl IpHash {
    pub fn new() -> Self {
        IpHash
    }
}

impl LoadBalancer for IpHash {
    fn select<'a>(&self, targets: &'a [Uri], client_ip: IpAddr) -> &'a Uri {
        let mut hasher = DefaultHasher::new();
        client_ip.hash(&mut hasher);
        let i = (hasher.finish() as usize) % targets.len();
        &targets[i]
    }
}

/// A factory for a named custom strategy, called once per rule the first
/// time it's needed (spec.md §4.6's lazy-init requirement).
pub type LoadBalancerFactory = Box<dyn Fn() -> Box<dyn LoadBalancer> + Send + Sync>;

/// Maps the `customLoadBalancer` name on a [`crate::config::Rule`] to a
/// factory supplied at startup. Resolving an unregistered name is a
/// config error, not a panic — it surfaces as a fatal bind failure for
/// the affected listener, same as a bad keystore.
#[derive(Default)]
pub struct LoadBalancerRegistry {
    factories: HashMap<String, LoadBalancerFactory>,
}

impl LoadBalancerRegistry {
    pub fn new() -> Self {
        LoadBalancerRegistry::default()
    }

    pub fn register(&mut self, name: impl Into<String>, factory: LoadBalancerFactory) {
        self.factories.insert(name.into(), factory);
    }

    pub fn create(&self, name: &str) -> Result<Box<dyn LoadBalancer>, ConfigError> {
        match self.factories.get(name) {
            Some(factory) => Ok(factory()),
            None => Err(ConfigError::UnknownLoadBalancer(name.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uris(n: usize) -> Vec<Uri> {
        (0..n)
            .map(|i| format!("http://backend-{i}").parse().unwrap())
            .collect()
    }

    #[test]
    fn round_robin_cycles() {
        let lb = RoundRobin::new();
        let targets = uris(3);
        let ip = "127.0.0.1".parse().unwrap();
        let picks: Vec<_> = (0..6).map(|_| lb.select(&targets, ip).to_string()).collect();
        assert_eq!(
            picks,
            vec![
                "http://backend-0/",
                "http://backend-1/",
                "http://backend-2/",
                "http://backend-0/",
                "http://backend-1/",
                "http://backend-2/",
            ]
        );
    }

    #[test]
    fn ip_hash_is_stable_for_same_ip() {
        let lb = IpHash::new();
        let targets = uris(4);
        let ip: IpAddr = "10.0.0.7".parse().unwrap();
        let first = lb.select(&targets, ip).clone();
        for _ in 0..5 {
            assert_eq!(lb.select(&targets, ip), &first);
        }
    }

    #[test]
    fn registry_resolves_registered_name() {
        let mut registry = LoadBalancerRegistry::new();
        registry.register("sticky", Box::new(|| Box::new(RoundRobin::new())));
        assert!(registry.create("sticky").is_ok());
        assert!(matches!(
            registry.create("missing"),
            Err(ConfigError::UnknownLoadBalancer(_))
        ));
    }
}
