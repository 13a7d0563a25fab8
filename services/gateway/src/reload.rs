//! Routing configuration loading and hot reload.
//!
//! ```text
//! timer ----------+
//!                 +--> ReloadTrigger channel --> reload task --> load() --> ConfigStore::replace()
//! fs watcher -----+
//! ```
//!
//! The channel holds at most one pending trigger, so a burst of filesystem
//! events collapses into a single reload. A failed reload keeps the current
//! table.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::{ConfigError, GatewayError};
use crate::proxy::{ConfigStore, RoutingTable};

/// Default interval of the unconditional reload timer.
pub const DEFAULT_RELOAD_INTERVAL: Duration = Duration::from_secs(60);

/// On-disk routing document.
///
/// ```json
/// {"port": 25565, "hosts": {"play.example.com": "10.0.0.2:25565"}, "default": "10.0.0.3:25565"}
/// ```
#[derive(Debug, Deserialize)]
pub struct ConfigDocument {
    pub port: u16,
    /// Missing and `null` both mean no host routes.
    #[serde(default)]
    pub hosts: Option<HashMap<String, String>>,
    pub default: String,
}

impl ConfigDocument {
    fn into_table(self, path: &Path) -> Result<RoutingTable, ConfigError> {
        if self.default.trim().is_empty() {
            return Err(ConfigError::Invalid {
                path: path.to_path_buf(),
                reason: "default backend is empty".to_string(),
            });
        }

        Ok(RoutingTable::new(
            self.port,
            self.hosts.unwrap_or_default(),
            self.default,
        ))
    }
}

/// Read and parse the routing document at `path`.
pub fn load(path: &Path) -> Result<RoutingTable, ConfigError> {
    let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;

    let document: ConfigDocument =
        serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;

    document.into_table(path)
}

/// Why a reload was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReloadTrigger {
    Timer,
    FileChanged,
}

/// Producer side of the reload channel.
#[derive(Debug, Clone)]
pub struct ReloadHandle {
    tx: mpsc::Sender<ReloadTrigger>,
}

impl ReloadHandle {
    /// Request a reload. Returns false if one is already pending or the
    /// reload task has stopped.
    pub fn request(&self, trigger: ReloadTrigger) -> bool {
        match self.tx.try_send(trigger) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                debug!(trigger = ?trigger, "Reload already pending");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }
}

/// Single consumer of reload triggers.
pub struct Reloader {
    path: PathBuf,
    store: Arc<ConfigStore>,
    bound_port: u16,
    rx: mpsc::Receiver<ReloadTrigger>,
}

impl Reloader {
    /// Build the reload task for `store`.
    ///
    /// The port of the table installed in `store` at this point is taken as
    /// the port the listener bound; later port changes are only reported.
    pub fn new(path: impl Into<PathBuf>, store: Arc<ConfigStore>) -> (Self, ReloadHandle) {
        let (tx, rx) = mpsc::channel(1);
        let bound_port = store.current().listen_port();
        (
            Self {
                path: path.into(),
                store,
                bound_port,
                rx,
            },
            ReloadHandle { tx },
        )
    }

    pub fn bound_port(&self) -> u16 {
        self.bound_port
    }

    /// Process triggers until every [`ReloadHandle`] is dropped.
    pub async fn run(mut self) {
        info!(path = %self.path.display(), "Reload task started");

        while let Some(trigger) = self.rx.recv().await {
            if let Err(e) = reload_once(&self.path, &self.store, self.bound_port, trigger) {
                let e = GatewayError::from(e);
                error!(
                    path = %self.path.display(),
                    trigger = ?trigger,
                    reason = e.reason_code(),
                    error = %e,
                    "Failed to reload config, keeping current routing table"
                );
            }
        }

        debug!("Reload task stopped");
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }
}

/// Whether `table` asks for a port other than the one the listener bound.
pub fn restart_required(bound_port: u16, table: &RoutingTable) -> bool {
    table.listen_port() != bound_port
}

/// Load the document and install it if it parses.
///
/// `bound_port` is the port the listener actually holds, which stays fixed
/// across reloads even when installed tables carry a different one.
pub fn reload_once(
    path: &Path,
    store: &ConfigStore,
    bound_port: u16,
    trigger: ReloadTrigger,
) -> Result<(), ConfigError> {
    let table = load(path)?;
    let current = store.current();

    if restart_required(bound_port, &table) {
        warn!(
            bound_port = bound_port,
            configured_port = table.listen_port(),
            "Listen port changed; restart required to rebind"
        );
    }

    if table == *current {
        debug!(trigger = ?trigger, "Config unchanged");
        return Ok(());
    }

    info!(trigger = ?trigger, "Reloading config");
    store.replace(table);
    Ok(())
}

/// Fire a [`ReloadTrigger::Timer`] every `interval`.
pub fn spawn_reload_timer(handle: ReloadHandle, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately; startup already loaded.
        ticker.tick().await;

        loop {
            ticker.tick().await;
            if handle.tx.is_closed() {
                break;
            }
            handle.request(ReloadTrigger::Timer);
        }
    })
}

/// Watch the directory containing `config_path` and request a reload for
/// every event that touches the config file.
///
/// The returned watcher stops when dropped.
pub fn watch_config(
    config_path: &Path,
    handle: ReloadHandle,
) -> Result<RecommendedWatcher, notify::Error> {
    let dir = match config_path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let file_name = config_path.file_name().map(|n| n.to_os_string());

    let mut watcher =
        notify::recommended_watcher(move |res: notify::Result<Event>| match res {
            Ok(event) => {
                let touches_config = match &file_name {
                    Some(name) => event
                        .paths
                        .iter()
                        .any(|p| p.file_name() == Some(name.as_os_str())),
                    None => true,
                };
                if touches_config && !event.kind.is_access() {
                    debug!(kind = ?event.kind, "Config file change detected");
                    handle.request(ReloadTrigger::FileChanged);
                }
            }
            Err(e) => error!(error = %e, "Config watch error"),
        })?;

    watcher.watch(&dir, RecursiveMode::NonRecursive)?;

    info!(dir = %dir.display(), "Config watcher started");
    Ok(watcher)
}
