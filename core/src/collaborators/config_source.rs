//! Configuration provider contract (spec.md §6 (i)): "supplies an initial
//! `Configuration` and a stream of replacements". File-watching with
//! debounce and YAML parsing are explicitly out of scope; the two
//! implementations here cover only what the core needs to run.

use std::path::Path;
use std::sync::Arc;

use tokio::sync::watch;

use crate::config::Configuration;

/// Hands the orchestrator an initial snapshot and a channel of
/// replacements. Implementations are free to source replacements however
/// they like (file watch, admin API, test harness) — the core only ever
/// reads through this trait.
pub trait ConfigSource: Send + Sync {
    fn initial(&self) -> Configuration;
    fn subscribe(&self) -> watch::Receiver<Configuration>;
}

/// A `ConfigSource` whose replacements are pushed in directly, e.g. by a
/// test, or by whatever admin surface an embedding process wires up.
/// Holding the `Sender` is how a caller publishes a new snapshot.
pub struct StaticConfigSource {
    tx: watch::Sender<Configuration>,
}

impl StaticConfigSource {
    pub fn new(initial: Configuration) -> Arc<Self> {
        let (tx, _rx) = watch::channel(initial);
        Arc::new(StaticConfigSource { tx })
    }

    /// Publish a replacement snapshot to every subscriber.
    pub fn publish(&self, cfg: Configuration) {
        let _ = self.tx.send(cfg);
    }
}

impl ConfigSource for StaticConfigSource {
    fn initial(&self) -> Configuration {
        self.tx.borrow().clone()
    }

    fn subscribe(&self) -> watch::Receiver<Configuration> {
        self.tx.subscribe()
    }
}

/// Loads one JSON configuration file exactly once at construction. There
/// is no debounced file-watch here on purpose (spec.md §1 lists that as a
/// collaborator concern, not a core one); reconfiguration after startup
/// happens only via [`StaticConfigSource::publish`]-style pushes from
/// whatever admin surface is layered on top.
pub struct JsonFileConfigSource {
    inner: Arc<StaticConfigSource>,
}

impl JsonFileConfigSource {
    pub fn load(path: &Path) -> std::io::Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let cfg: Configuration = serde_json::from_str(&raw)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        Ok(JsonFileConfigSource {
            inner: StaticConfigSource::new(cfg),
        })
    }
}

impl ConfigSource for JsonFileConfigSource {
    fn initial(&self) -> Configuration {
        self.inner.initial()
    }

    fn subscribe(&self) -> watch::Receiver<Configuration> {
        self.inner.subscribe()
    }
}
