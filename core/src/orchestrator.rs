//! Live reconfiguration (spec.md §4.2).
//!
//! One [`Orchestrator`] owns the set of currently running [`Listener`]s
//! and reconciles it against each [`Configuration`] snapshot handed to
//! it by a [`ConfigSource`]. `applyConfiguration` is the only mutating
//! entry point and is serialized by an internal mutex so overlapping
//! config pushes can never race each other's diff.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;

use crate::collaborators::{AccessLogSink, ConfigSource, CredentialsSink, MetricsSink, TlsListenerFactory};
use crate::config::{Configuration, ListenerConfig};
use crate::listener::Listener;
use crate::load_balancer::LoadBalancerRegistry;

const READY_TIMEOUT: Duration = Duration::from_secs(2);

/// A running listener alongside the exact config it was started with,
/// so a later snapshot can be compared without re-deriving anything
/// from the listener itself.
struct LiveListener {
    config: ListenerConfig,
    listener: Listener,
}

pub struct Orchestrator {
    config_source: Arc<dyn ConfigSource>,
    tls_factory: Arc<dyn TlsListenerFactory>,
    credentials: Option<Arc<dyn CredentialsSink>>,
    access_log: Arc<dyn AccessLogSink>,
    metrics: Arc<dyn MetricsSink>,
    lb_registry: Arc<LoadBalancerRegistry>,
    live: Mutex<HashMap<String, LiveListener>>,
}

impl Orchestrator {
    pub fn new(
        config_source: Arc<dyn ConfigSource>,
        tls_factory: Arc<dyn TlsListenerFactory>,
        credentials: Option<Arc<dyn CredentialsSink>>,
        access_log: Arc<dyn AccessLogSink>,
        metrics: Arc<dyn MetricsSink>,
        lb_registry: Arc<LoadBalancerRegistry>,
    ) -> Self {
        Orchestrator {
            config_source,
            tls_factory,
            credentials,
            access_log,
            metrics,
            lb_registry,
            live: Mutex::new(HashMap::new()),
        }
    }

    /// Applies the config source's initial snapshot, then follows its
    /// replacement stream forever, applying each one as it arrives.
    /// Returns only if the config source's channel closes.
    pub async fn run(&self) {
        let initial = self.config_source.initial();
        self.apply_configuration(initial).await;

        let mut rx = self.config_source.subscribe();
        loop {
            match rx.changed().await {
                Ok(()) => {
                    let cfg = rx.borrow_and_update().clone();
                    self.apply_configuration(cfg).await;
                }
                Err(_) => break,
            }
        }
    }

    /// Stops every currently live listener. Used by the process
    /// entrypoint's signal handler (spec.md §9 "Shutdown hooks": "the
    /// process entrypoint wires signal handlers to call it once") rather
    /// than by any reconfiguration path.
    pub async fn shutdown(&self) {
        let mut live = self.live.lock().await;
        for (key, entry) in live.drain() {
            log::info!("stopping listener {key} for shutdown");
            entry.listener.stop().await;
        }
    }

    /// Diffs `new_cfg.listeners` against the live set by
    /// [`ListenerConfig::key`]: listeners only in the old set are
    /// stopped, listeners only in the new set are started, listeners in
    /// both are stopped-then-restarted iff their config changed, and
    /// unchanged listeners are left running untouched.
    pub async fn apply_configuration(&self, new_cfg: Configuration) {
        let mut live = self.live.lock().await;

        let new_by_key: HashMap<String, &ListenerConfig> =
            new_cfg.listeners.iter().map(|l| (l.key(), l)).collect();

        let stale_keys: Vec<String> = live
            .keys()
            .filter(|key| !new_by_key.contains_key(key.as_str()))
            .cloned()
            .collect();

        let mut to_start: Vec<ListenerConfig> = Vec::new();
        for (key, cfg) in &new_by_key {
            match live.get(key) {
                None => to_start.push((*cfg).clone()),
                Some(existing) if &existing.config != *cfg => to_start.push((*cfg).clone()),
                Some(_) => {}
            }
        }

        let mut to_stop = stale_keys;
        to_stop.extend(to_start.iter().map(|cfg| cfg.key()).filter(|k| live.contains_key(k)));

        for key in to_stop {
            if let Some(entry) = live.remove(&key) {
                log::info!("stopping listener {key}");
                entry.listener.stop().await;
            }
        }

        for cfg in to_start {
            let key = cfg.key();
            log::info!("starting listener {key}");
            let cfg_for_live = cfg.clone();
            let (listener, ready_rx) = Listener::start(
                cfg,
                self.tls_factory.clone(),
                new_cfg.certificates_path.clone(),
                new_cfg.global_blacklist.clone(),
                self.credentials.clone(),
                self.access_log.clone(),
                self.metrics.clone(),
                self.lb_registry.clone(),
            );

            match tokio::time::timeout(READY_TIMEOUT, ready_rx).await {
                Ok(Ok(Ok(()))) => {
                    live.insert(
                        key,
                        LiveListener {
                            config: cfg_for_live,
                            listener,
                        },
                    );
                }
                Ok(Ok(Err(e))) => {
                    log::error!("listener {key} failed to bind: {e}");
                }
                Ok(Err(_)) => {
                    log::error!("listener {key} dropped its ready signal before binding");
                }
                Err(_) => {
                    log::error!("listener {key} did not become ready within {READY_TIMEOUT:?}");
                }
            }
        }
    }
}
