//! Shared per-listener runtime handle.
//!
//! One [`ListenerRuntime`] is built when a [`crate::listener::Listener`]
//! starts and handed to every connection task it spawns — the engines
//! (`http_engine`, `socks4`, `socks5`) only ever see this, never the
//! `Orchestrator` or `ConfigSource` directly.

use std::sync::Arc;

use crate::collaborators::{AccessLogSink, CredentialsSink, MetricsSink};
use crate::config::ListenerConfig;
use crate::load_balancer::LoadBalancerRegistry;
use crate::rule_runtime::RuleRuntime;
use crate::upstream::UpstreamConnector;

pub struct ListenerRuntime {
    pub config: ListenerConfig,
    /// Parallel to `config.rules` by index.
    pub rule_runtimes: Vec<Arc<RuleRuntime>>,
    pub credentials: Option<Arc<dyn CredentialsSink>>,
    pub access_log: Arc<dyn AccessLogSink>,
    pub metrics: Arc<dyn MetricsSink>,
    pub lb_registry: Arc<LoadBalancerRegistry>,
}

impl ListenerRuntime {
    pub fn new(
        config: ListenerConfig,
        credentials: Option<Arc<dyn CredentialsSink>>,
        access_log: Arc<dyn AccessLogSink>,
        metrics: Arc<dyn MetricsSink>,
        lb_registry: Arc<LoadBalancerRegistry>,
    ) -> Self {
        let rule_runtimes = config.rules.iter().map(RuleRuntime::new).map(Arc::new).collect();
        ListenerRuntime {
            config,
            rule_runtimes,
            credentials,
            access_log,
            metrics,
            lb_registry,
        }
    }

    pub fn connect_timeout(&self) -> Option<std::time::Duration> {
        let ms = self.config.effective_timeout_ms();
        if ms < 0 {
            None
        } else {
            Some(std::time::Duration::from_millis(ms as u64))
        }
    }

    pub async fn connect_upstream(
        &self,
        target: &http::Uri,
        per_rule_proxy: Option<&crate::config::UpstreamProxyConfig>,
    ) -> Result<tokio::net::TcpStream, crate::error::UpstreamError> {
        let proxy = per_rule_proxy.or(self.config.upstream_proxy.as_ref());
        UpstreamConnector::connect(target, proxy, self.connect_timeout()).await
    }
}
