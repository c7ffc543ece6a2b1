//! Per-rule runtime state (spec.md §4.6).
//!
//! Each [`crate::config::Rule`] that has targets gets exactly one
//! `RuleRuntime`, created once at listener start and held for the
//! listener's lifetime (a config replacement recreates the whole
//! listener, so there's no need to migrate this state across reloads).
//! It owns three pieces of mutable state a rule accumulates while
//! serving traffic: which load-balancing strategy it settled on, which
//! targets health checks have marked down, and one token bucket per
//! client IP.

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use http::Uri;

use crate::config::{LoadBalancing, Rule};
use crate::error::ConfigError;
use crate::load_balancer::{IpHash, LoadBalancer, LoadBalancerRegistry, RoundRobin};
use crate::token_bucket::TokenBucket;

/// Buckets idle longer than this are swept on the next rate-limit check
/// so a rule that saw a burst of distinct client IPs doesn't hold onto
/// their buckets forever (spec.md §3: "buckets idle >60 s are evicted
/// when the map size first exceeds 1000").
const BUCKET_IDLE_EVICTION: Duration = Duration::from_secs(60);

pub struct RuleRuntime {
    load_balancing: LoadBalancing,
    custom_name: Option<String>,
    strategy: Mutex<Option<Arc<dyn LoadBalancer>>>,
    unhealthy: RwLock<HashSet<String>>,
    buckets: RwLock<HashMap<IpAddr, Arc<TokenBucket>>>,
    rate_limit: f64,
    burst: u32,
}

impl RuleRuntime {
    pub fn new(rule: &Rule) -> Self {
        RuleRuntime {
            load_balancing: rule.load_balancing,
            custom_name: rule.custom_load_balancer.clone(),
            strategy: Mutex::new(None),
            unhealthy: RwLock::new(HashSet::new()),
            buckets: RwLock::new(HashMap::new()),
            rate_limit: rule.rate_limit,
            burst: rule.effective_burst(),
        }
    }

    /// Lazily constructs (once) and returns this rule's strategy. Built
    /// from `registry` the first time a `Custom` rule needs it; later
    /// calls reuse the cached instance without touching the registry
    /// again.
    pub fn strategy(
        &self,
        registry: &LoadBalancerRegistry,
    ) -> Result<Arc<dyn LoadBalancer>, ConfigError> {
        let mut guard = self.strategy.lock().unwrap();
        if let Some(existing) = &*guard {
            return Ok(existing.clone());
        }
        let built: Arc<dyn LoadBalancer> = match self.load_balancing {
            LoadBalancing::RoundRobin => Arc::new(RoundRobin::new()),
            LoadBalancing::IpHash => Arc::new(IpHash::new()),
            LoadBalancing::Custom => {
                let name = self.custom_name.as_deref().ok_or_else(|| {
                    ConfigError::UnknownLoadBalancer("<unset custom_load_balancer>".to_string())
                })?;
                registry.create(name)?.into()
            }
        };
        *guard = Some(built.clone());
        Ok(built)
    }

    pub fn mark_unhealthy(&self, target: &Uri) {
        self.unhealthy.write().unwrap().insert(target.to_string());
    }

    pub fn mark_healthy(&self, target: &Uri) {
        self.unhealthy.write().unwrap().remove(&target.to_string());
    }

    pub fn is_healthy(&self, target: &Uri) -> bool {
        !self.unhealthy.read().unwrap().contains(&target.to_string())
    }

    /// Filters `all` down to the targets not currently marked down by
    /// health checks. If every target is down, returns `all` unfiltered
    /// so callers degrade to "try anyway" rather than refusing outright —
    /// health checks are advisory, not a hard circuit breaker.
    pub fn healthy_targets<'a>(&self, all: &'a [Uri]) -> Vec<&'a Uri> {
        let unhealthy = self.unhealthy.read().unwrap();
        let filtered: Vec<&Uri> = all
            .iter()
            .filter(|t| !unhealthy.contains(&t.to_string()))
            .collect();
        if filtered.is_empty() {
            all.iter().collect()
        } else {
            filtered
        }
    }

    /// `None` when the rule has no rate limit configured.
    pub fn try_acquire(&self, client_ip: IpAddr) -> Option<bool> {
        if self.rate_limit <= 0.0 {
            return None;
        }
        self.evict_idle_if_large();
        let bucket = {
            let buckets = self.buckets.read().unwrap();
            buckets.get(&client_ip).cloned()
        };
        let bucket = bucket.unwrap_or_else(|| {
            let mut buckets = self.buckets.write().unwrap();
            buckets
                .entry(client_ip)
                .or_insert_with(|| Arc::new(TokenBucket::new(self.rate_limit, self.burst)))
                .clone()
        });
        Some(bucket.try_acquire())
    }

    /// Sweeps buckets idle past [`BUCKET_IDLE_EVICTION`] once the table
    /// grows past a size worth bothering with; keeps memory bounded for
    /// listeners that see a long tail of one-off client IPs.
    fn evict_idle_if_large(&self) {
        const SWEEP_THRESHOLD: usize = 1_000;
        let needs_sweep = self.buckets.read().unwrap().len() > SWEEP_THRESHOLD;
        if !needs_sweep {
            return;
        }
        self.buckets
            .write()
            .unwrap()
            .retain(|_, bucket| bucket.idle_for() < BUCKET_IDLE_EVICTION);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Rule;

    fn rule(load_balancing: LoadBalancing, rate_limit: f64) -> Rule {
        Rule {
            host: None,
            path: None,
            target: None,
            targets: vec![],
            headers: Default::default(),
            upstream_proxy: None,
            reverse: false,
            health_check_path: None,
            health_check_interval_ms: 10_000,
            health_check_timeout_ms: 5_000,
            rate_limit,
            burst: 0,
            load_balancing,
            custom_load_balancer: None,
        }
    }

    #[test]
    fn strategy_is_cached_across_calls() {
        let runtime = RuleRuntime::new(&rule(LoadBalancing::RoundRobin, 0.0));
        let registry = LoadBalancerRegistry::new();
        let a = runtime.strategy(&registry).unwrap();
        let b = runtime.strategy(&registry).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn unknown_custom_strategy_is_a_config_error() {
        let mut r = rule(LoadBalancing::Custom, 0.0);
        r.custom_load_balancer = Some("nope".to_string());
        let runtime = RuleRuntime::new(&r);
        let registry = LoadBalancerRegistry::new();
        assert!(runtime.strategy(&registry).is_err());
    }

    #[test]
    fn health_marking_filters_targets() {
        let runtime = RuleRuntime::new(&rule(LoadBalancing::RoundRobin, 0.0));
        let a: Uri = "http://a".parse().unwrap();
        let b: Uri = "http://b".parse().unwrap();
        let all = vec![a.clone(), b.clone()];
        runtime.mark_unhealthy(&a);
        assert_eq!(runtime.healthy_targets(&all), vec![&b]);
        runtime.mark_healthy(&a);
        assert_eq!(runtime.healthy_targets(&all).len(), 2);
    }

    #[test]
    fn all_unhealthy_degrades_to_trying_everything() {
        let runtime = RuleRuntime::new(&rule(LoadBalancing::RoundRobin, 0.0));
        let a: Uri = "http://a".parse().unwrap();
        let all = vec![a.clone()];
        runtime.mark_unhealthy(&a);
        assert_eq!(runtime.healthy_targets(&all).len(), 1);
    }

    #[test]
    fn rate_limit_disabled_returns_none() {
        let runtime = RuleRuntime::new(&rule(LoadBalancing::RoundRobin, 0.0));
        let ip: IpAddr = "127.0.0.1".parse().unwrap();
        assert_eq!(runtime.try_acquire(ip), None);
    }

    #[test]
    fn rate_limit_enforces_per_ip_buckets() {
        let mut r = rule(LoadBalancing::RoundRobin, 1.0);
        r.burst = 1;
        let runtime = RuleRuntime::new(&r);
        let ip: IpAddr = "127.0.0.1".parse().unwrap();
        let other: IpAddr = "127.0.0.2".parse().unwrap();
        assert_eq!(runtime.try_acquire(ip), Some(true));
        assert_eq!(runtime.try_acquire(ip), Some(false));
        assert_eq!(runtime.try_acquire(other), Some(true));
    }
}
