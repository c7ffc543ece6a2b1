//! Process entrypoint: wires one concrete collaborator per trait in
//! `proxy_core::collaborators` (spec.md §6) to the orchestrator and runs
//! it until a signal asks it to stop.
//!
//! None of the collaborators built here are the "real" production
//! versions the spec describes as out of scope (§1): there's no YAML, no
//! debounced file watch, no admin HTTP API, no metrics scrape endpoint,
//! no log rotation. This binary exists to prove the `core` crate runs
//! end to end against a static JSON configuration file.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::Notify;

use proxy_core::collaborators::{
    AtomicMetrics, ChannelAccessLogSink, ConfigSource, CredentialsSink, JsonFileConfigSource,
    OpenSslTlsListenerFactory, StaticCredentials,
};
use proxy_core::config::AuthSource;
use proxy_core::load_balancer::LoadBalancerRegistry;
use proxy_core::orchestrator::Orchestrator;

#[derive(Parser)]
#[command(name = "proxy")]
#[command(about = "Multi-protocol TCP proxy server", long_about = None)]
struct Cli {
    /// Path to a JSON configuration snapshot (see proxy_core::config::Configuration).
    #[arg(long, short)]
    config: PathBuf,
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(num_cpus::get())
        .enable_all()
        .build()
        .context("failed to build the tokio runtime")?;

    runtime.block_on(run(cli))
}

async fn run(cli: Cli) -> Result<()> {
    let config_source = Arc::new(
        JsonFileConfigSource::load(&cli.config)
            .with_context(|| format!("loading configuration from {}", cli.config.display()))?,
    );
    let initial = config_source.initial();

    let credentials = build_credentials(&initial.auth_source)?;

    let (access_log, access_log_rx) = ChannelAccessLogSink::new(4096);
    let access_log = Arc::new(access_log);
    tokio::spawn(proxy_core::collaborators::access_log::drain_to_log(access_log_rx));

    let metrics = Arc::new(AtomicMetrics::new());
    let tls_factory = Arc::new(OpenSslTlsListenerFactory);
    let lb_registry = Arc::new(LoadBalancerRegistry::new());

    let orchestrator = Arc::new(Orchestrator::new(
        config_source,
        tls_factory,
        credentials,
        access_log,
        metrics,
        lb_registry,
    ));

    let shutdown = Arc::new(Notify::new());
    {
        let shutdown = shutdown.clone();
        ctrlc::set_handler(move || {
            log::info!("received interrupt, shutting down listeners");
            shutdown.notify_one();
        })
        .context("failed to install Ctrl-C handler")?;
    }

    let run_handle = tokio::spawn({
        let orchestrator = orchestrator.clone();
        async move { orchestrator.run().await }
    });

    shutdown.notified().await;
    orchestrator.shutdown().await;
    run_handle.abort();

    Ok(())
}

/// Builds the one `CredentialsSink` the configuration names (spec.md
/// §6 (ii)'s three sources), or `None` if `auth_source` is `AuthSource::None` —
/// in which case any rule with `authEnabled = true` can never authenticate.
fn build_credentials(source: &AuthSource) -> Result<Option<Arc<dyn CredentialsSink>>> {
    let sink: Arc<dyn CredentialsSink> = match source {
        AuthSource::None => return Ok(None),
        AuthSource::List(creds) => {
            let map: HashMap<String, String> = creds
                .iter()
                .map(|c| (c.username.clone(), c.password.clone()))
                .collect();
            Arc::new(StaticCredentials::from_map(map))
        }
        AuthSource::Directory(dir) => Arc::new(
            StaticCredentials::from_directory(dir)
                .with_context(|| format!("loading credentials directory {}", dir.display()))?,
        ),
        AuthSource::EnvVar(var_name) => {
            let value = std::env::var(var_name)
                .with_context(|| format!("credentials environment variable {var_name} is not set"))?;
            Arc::new(StaticCredentials::from_env_value(&value))
        }
    };
    Ok(Some(sink))
}
