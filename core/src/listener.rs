//! A single bound proxy front-end (spec.md §4.1).
//!
//! `Listener::start` binds the socket, signals a ready latch once the
//! bind attempt is resolved, then runs the accept loop as a background
//! task until `stop()` is called. The orchestrator never touches a
//! socket directly — it only ever holds a `Listener` handle.

use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::{oneshot, Notify, Semaphore};
use tokio::task::JoinSet;

use crate::collaborators::{AccessLogSink, CredentialsSink, MetricsSink, TlsListenerFactory};
use crate::config::ListenerConfig;
use crate::error::ConfigError;
use crate::health;
use crate::load_balancer::LoadBalancerRegistry;
use crate::runtime_context::ListenerRuntime;

const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// A running (or not-yet-bound) listener. Dropping this without calling
/// [`Listener::stop`] leaves its accept loop and health probes running
/// in the background — the orchestrator always calls `stop` explicitly
/// before letting a handle go.
pub struct Listener {
    key: String,
    close: Arc<Notify>,
    closed: Arc<std::sync::atomic::AtomicBool>,
    tasks: Arc<tokio::sync::Mutex<JoinSet<()>>>,
    probes: Vec<tokio::task::JoinHandle<()>>,
    accept_loop: Option<tokio::task::JoinHandle<()>>,
}

impl Listener {
    /// Starts binding in the background and returns immediately with a
    /// handle plus a one-shot ready signal, matching the orchestrator's
    /// "wait up to 2 seconds on readyLatch" contract (spec.md §4.2).
    pub fn start(
        config: ListenerConfig,
        tls_factory: Arc<dyn TlsListenerFactory>,
        certificates_path: Option<std::path::PathBuf>,
        global_blacklist: HashSet<IpAddr>,
        credentials: Option<Arc<dyn CredentialsSink>>,
        access_log: Arc<dyn AccessLogSink>,
        metrics: Arc<dyn MetricsSink>,
        lb_registry: Arc<LoadBalancerRegistry>,
    ) -> (Self, oneshot::Receiver<Result<(), ConfigError>>) {
        let key = config.key();
        let (ready_tx, ready_rx) = oneshot::channel();
        let close = Arc::new(Notify::new());
        let closed = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let tasks: Arc<tokio::sync::Mutex<JoinSet<()>>> = Arc::new(tokio::sync::Mutex::new(JoinSet::new()));

        let runtime = Arc::new(ListenerRuntime::new(
            config.clone(),
            credentials,
            access_log,
            metrics.clone(),
            lb_registry,
        ));

        let probes = spawn_health_probes(&runtime);

        let accept_close = close.clone();
        let accept_closed = closed.clone();
        let accept_tasks = tasks.clone();
        let accept_loop = tokio::spawn(accept_loop(
            config,
            tls_factory,
            certificates_path,
            global_blacklist,
            runtime,
            ready_tx,
            accept_close,
            accept_closed,
            accept_tasks,
        ));

        (
            Listener {
                key,
                close,
                closed,
                tasks,
                probes,
                accept_loop: Some(accept_loop),
            },
            ready_rx,
        )
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Closes the listening socket, stops health probes, and waits up
    /// to 5 seconds for active connections to finish on their own
    /// before aborting whatever remains (spec.md §4.1).
    pub async fn stop(mut self) {
        self.closed.store(true, Ordering::SeqCst);
        self.close.notify_waiters();

        if let Some(handle) = self.accept_loop.take() {
            let _ = handle.await;
        }
        for probe in &self.probes {
            probe.abort();
        }

        let deadline = tokio::time::Instant::now() + DRAIN_TIMEOUT;
        let mut tasks = self.tasks.lock().await;
        loop {
            if tasks.is_empty() {
                break;
            }
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                tasks.abort_all();
                break;
            }
            match tokio::time::timeout(remaining, tasks.join_next()).await {
                Ok(Some(_)) => continue,
                Ok(None) => break,
                Err(_) => {
                    tasks.abort_all();
                    break;
                }
            }
        }
        while tasks.join_next().await.is_some() {}
    }
}

fn spawn_health_probes(runtime: &Arc<ListenerRuntime>) -> Vec<tokio::task::JoinHandle<()>> {
    let mut handles = Vec::new();
    for (rule, rule_runtime) in runtime.config.rules.iter().zip(runtime.rule_runtimes.iter()) {
        let Some(path) = rule.health_check_path.clone() else {
            continue;
        };
        let targets = rule.get_all_targets();
        if targets.is_empty() {
            continue;
        }
        handles.extend(health::spawn_probes(
            rule_runtime.clone(),
            targets,
            path,
            Duration::from_millis(rule.health_check_interval_ms),
            Duration::from_millis(rule.health_check_timeout_ms),
        ));
    }
    handles
}

#[allow(clippy::too_many_arguments)]
async fn accept_loop(
    config: ListenerConfig,
    tls_factory: Arc<dyn TlsListenerFactory>,
    certificates_path: Option<std::path::PathBuf>,
    global_blacklist: HashSet<IpAddr>,
    runtime: Arc<ListenerRuntime>,
    ready_tx: oneshot::Sender<Result<(), ConfigError>>,
    close: Arc<Notify>,
    closed: Arc<std::sync::atomic::AtomicBool>,
    tasks: Arc<tokio::sync::Mutex<JoinSet<()>>>,
) {
    if let Err(e) = config.validate() {
        log::error!("listener {} has an invalid configuration: {}", config.key(), e);
        let _ = ready_tx.send(Err(e));
        return;
    }

    let bind_ip = config.bind_address.unwrap_or(IpAddr::from([0, 0, 0, 0]));
    let addr = SocketAddr::new(bind_ip, config.port);

    let bound = tls_factory.bind(
        addr,
        config.keystore_path.as_deref(),
        config.keystore_password.as_deref(),
        certificates_path.as_deref(),
    );

    let (tcp_listener, tls_listener) = match bound {
        Ok(pair) => {
            let _ = ready_tx.send(Ok(()));
            pair
        }
        Err(e) => {
            log::error!("listener {} failed to bind {}: {}", config.key(), addr, e);
            let _ = ready_tx.send(Err(e));
            return;
        }
    };
    let tls_listener = Arc::new(tls_listener);

    log::info!("listener {} accepting on {}", config.key(), addr);

    let semaphore = Arc::new(Semaphore::new(config.max_connections as usize));
    let connections_total = Arc::new(AtomicU64::new(0));
    let active_connections = Arc::new(AtomicU64::new(0));
    let blacklist: Arc<HashSet<IpAddr>> = Arc::new(
        global_blacklist
            .union(&config.blacklist)
            .cloned()
            .collect(),
    );

    loop {
        if closed.load(Ordering::SeqCst) {
            break;
        }

        let accepted = tokio::select! {
            biased;
            _ = close.notified() => break,
            accepted = tcp_listener.accept() => accepted,
        };

        let (socket, peer) = match accepted {
            Ok(pair) => pair,
            Err(e) => {
                log::warn!("listener {} accept error: {}", config.key(), e);
                runtime.metrics.increment_counter(
                    "proxy.connections.errors",
                    &[("name", &config.key())],
                    1,
                );
                continue;
            }
        };

        if blacklist.contains(&peer.ip()) {
            continue;
        }

        let permit = match semaphore.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                runtime.metrics.increment_counter(
                    "connections.dropped",
                    &[("name", &config.key())],
                    1,
                );
                continue;
            }
        };

        connections_total.fetch_add(1, Ordering::Relaxed);
        runtime.metrics.increment_counter("proxy.connections.total", &[("name", &config.key())], 1);
        let active = active_connections.fetch_add(1, Ordering::Relaxed) + 1;
        runtime.metrics.set_gauge("proxy.connections.active", &[("name", &config.key())], active as i64);

        if let Err(e) = socket.set_nodelay(true) {
            log::debug!("set_nodelay failed for {}: {}", peer, e);
        }

        let runtime = runtime.clone();
        let tls_listener = tls_listener.clone();
        let listener_type = config.listener_type.clone();
        let timeout_ms = config.effective_timeout_ms();
        let active_connections = active_connections.clone();
        let key = config.key();

        let mut tasks = tasks.lock().await;
        tasks.spawn(async move {
            let _permit = permit;
            serve_connection(socket, peer, tls_listener, listener_type, timeout_ms, runtime.clone()).await;
            let remaining = active_connections.fetch_sub(1, Ordering::Relaxed) - 1;
            runtime.metrics.set_gauge("proxy.connections.active", &[("name", &key)], remaining as i64);
        });
    }
}

async fn serve_connection(
    socket: TcpStream,
    peer: SocketAddr,
    tls_listener: Arc<crate::collaborators::TlsListener>,
    listener_type: crate::config::ListenerType,
    timeout_ms: i64,
    runtime: Arc<ListenerRuntime>,
) {
    let stream = match tls_listener.accept(socket).await {
        Ok(s) => s,
        Err(e) => {
            log::debug!("TLS handshake with {} failed: {}", peer, e);
            return;
        }
    };

    let result = run_with_timeout(stream, peer, listener_type, timeout_ms, runtime).await;
    if let Err(e) = result {
        log::debug!("connection from {} ended with error: {}", peer, e);
    }
}

async fn run_with_timeout(
    stream: crate::collaborators::tls::BoxedStream,
    peer: SocketAddr,
    listener_type: crate::config::ListenerType,
    timeout_ms: i64,
    runtime: Arc<ListenerRuntime>,
) -> std::io::Result<()> {
    let body = dispatch(stream, peer.ip(), listener_type, runtime);
    if timeout_ms < 0 {
        body.await
    } else {
        match tokio::time::timeout(Duration::from_millis(timeout_ms as u64), body).await {
            Ok(result) => result,
            Err(_) => Ok(()),
        }
    }
}

async fn dispatch(
    mut stream: crate::collaborators::tls::BoxedStream,
    client_ip: IpAddr,
    listener_type: crate::config::ListenerType,
    runtime: Arc<ListenerRuntime>,
) -> std::io::Result<()> {
    match listener_type {
        crate::config::ListenerType::Http => {
            crate::http_engine::serve(stream, runtime, client_ip).await
        }
        crate::config::ListenerType::Socks4 => crate::socks4::serve(&mut stream, runtime, client_ip).await,
        crate::config::ListenerType::Socks5 => crate::socks5::serve(&mut stream, runtime, client_ip).await,
        crate::config::ListenerType::Plugin(name) => {
            log::warn!("no protocol handler registered for plugin listener type {name:?}");
            Ok(())
        }
    }
}
