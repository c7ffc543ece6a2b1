//! Shared helpers for the end-to-end scenarios in spec.md §8.
//!
//! Every scenario here drives real loopback TCP connections against a
//! real [`proxy_core::listener::Listener`] — no protocol mocking.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use proxy_core::collaborators::{
    AccessLogSink, ChannelAccessLogSink, CredentialsSink, MetricsSink, NoopMetrics,
    OpenSslTlsListenerFactory, StaticCredentials, TlsListenerFactory,
};
use proxy_core::config::{ListenerConfig, ListenerType, LoadBalancing, Rule};
use proxy_core::listener::Listener;
use proxy_core::load_balancer::LoadBalancerRegistry;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener as TokioTcpListener;

/// Starts a background TCP server on an OS-assigned loopback port that
/// writes `response` once per accepted connection (after draining
/// whatever the client sent) and then closes. Returns the bound address
/// so callers can point a target URL or SOCKS request at it.
pub async fn spawn_fixed_response_backend(response: &'static [u8]) -> SocketAddr {
    let listener = TokioTcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut sock, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                // Best-effort drain of whatever the client sent; a real
                // request always arrives before the backend is expected to
                // reply, and a short read is enough to unblock it.
                let _ = tokio::time::timeout(Duration::from_millis(200), sock.read(&mut buf)).await;
                let _ = sock.write_all(response).await;
                let _ = sock.shutdown().await;
            });
        }
    });
    addr
}

/// Starts a background TCP server that echoes back whatever it reads,
/// byte for byte, until the connection closes. Used by the CONNECT
/// tunnel scenario, which needs an arbitrary byte string relayed rather
/// than a canned HTTP response.
pub async fn spawn_echo_backend() -> SocketAddr {
    let listener = TokioTcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut sock, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                loop {
                    match sock.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if sock.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }
    });
    addr
}

/// Starts a background TCP server like [`spawn_fixed_response_backend`],
/// except it stops accepting (and closes its listening socket) as soon
/// as `stop` fires, so a health probe's next connect attempt sees
/// ECONNREFUSED. Used by the failover scenario to simulate a backend
/// going down without tearing down the whole test process.
pub async fn spawn_stoppable_backend(response: &'static [u8]) -> (SocketAddr, tokio::sync::oneshot::Sender<()>) {
    let listener = TokioTcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (stop_tx, mut stop_rx) = tokio::sync::oneshot::channel();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = &mut stop_rx => break,
                accepted = listener.accept() => {
                    let Ok((mut sock, _)) = accepted else { break };
                    tokio::spawn(async move {
                        let mut buf = [0u8; 4096];
                        let _ = tokio::time::timeout(Duration::from_millis(200), sock.read(&mut buf)).await;
                        let _ = sock.write_all(response).await;
                        let _ = sock.shutdown().await;
                    });
                }
            }
        }
    });
    (addr, stop_tx)
}

pub struct TestProxy {
    listener: Option<Listener>,
    pub metrics: Arc<NoopMetrics>,
}

impl TestProxy {
    /// Starts `config` as a live listener, binding immediately (no TLS —
    /// every scenario below runs plaintext) and waiting for its ready
    /// signal the same way the orchestrator does.
    pub async fn start(config: ListenerConfig) -> Self {
        Self::start_with_credentials(config, None).await
    }

    pub async fn start_with_credentials(
        config: ListenerConfig,
        credentials: Option<Arc<dyn CredentialsSink>>,
    ) -> Self {
        let tls_factory: Arc<dyn TlsListenerFactory> = Arc::new(OpenSslTlsListenerFactory);
        let (access_log, _rx) = ChannelAccessLogSink::new(64);
        let access_log: Arc<dyn AccessLogSink> = Arc::new(access_log);
        let metrics = Arc::new(NoopMetrics);
        let metrics_dyn: Arc<dyn MetricsSink> = metrics.clone();
        let registry = Arc::new(LoadBalancerRegistry::new());

        let (listener, ready_rx) = Listener::start(
            config,
            tls_factory,
            None,
            HashSet::new(),
            credentials,
            access_log,
            metrics_dyn,
            registry,
        );

        tokio::time::timeout(Duration::from_secs(2), ready_rx)
            .await
            .expect("listener ready signal timed out")
            .expect("ready channel dropped")
            .expect("listener failed to bind");

        TestProxy {
            listener: Some(listener),
            metrics,
        }
    }

    pub async fn stop(mut self) {
        if let Some(listener) = self.listener.take() {
            listener.stop().await;
        }
    }
}

pub fn base_listener_config(name: &str, port: u16, listener_type: ListenerType) -> ListenerConfig {
    ListenerConfig {
        name: Some(name.to_string()),
        port,
        listener_type,
        rules: vec![],
        auth_enabled: false,
        keep_alive: true,
        timeout_ms: 0,
        max_redirects: 0,
        max_connections: 10_000,
        bind_address: Some("127.0.0.1".parse().unwrap()),
        tls_enabled: false,
        keystore_path: None,
        keystore_password: None,
        blacklist: HashSet::new(),
        upstream_proxy: None,
    }
}

pub fn rule_with_targets(path: Option<&str>, targets: Vec<String>, load_balancing: LoadBalancing) -> Rule {
    Rule {
        host: None,
        path: path.map(str::to_string),
        target: None,
        targets: targets.iter().map(|t| t.parse().unwrap()).collect(),
        headers: Default::default(),
        upstream_proxy: None,
        reverse: false,
        health_check_path: None,
        health_check_interval_ms: 10_000,
        health_check_timeout_ms: 5_000,
        rate_limit: 0.0,
        burst: 0,
        load_balancing,
        custom_load_balancer: None,
    }
}

pub fn make_credentials(user: &str, pass: &str) -> Arc<dyn CredentialsSink> {
    let mut map = std::collections::HashMap::new();
    map.insert(user.to_string(), pass.to_string());
    Arc::new(StaticCredentials::from_map(map))
}
