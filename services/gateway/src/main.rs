//! hostgate
//!
//! TCP gateway that routes on the hostname carried in a client's opening
//! handshake.
//!
//! This service:
//! - Loads the routing document (fatal if the first load fails)
//! - Accepts TCP connections on the configured port
//! - Extracts the requested hostname from the first read
//! - Relays the connection to the matching backend, or the default one
//! - Reloads routing on file change and on a timer without dropping connections

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use anyhow::{Context, Result};
use hostgate::config::Config;
use hostgate::reload::{self, Reloader};
use hostgate::{ConfigStore, HandshakeConfig, Listener, ListenerConfig, RelayConfig};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    // Initialize tracing (prefer RUST_LOG, fallback to HOSTGATE_LOG_LEVEL)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting hostgate");

    let table = reload::load(&config.config_path).with_context(|| {
        format!(
            "Initial config load failed: {}",
            config.config_path.display()
        )
    })?;
    let port = table.listen_port();

    info!(
        config_path = %config.config_path.display(),
        port = port,
        route_count = table.routes().len(),
        default_backend = %table.default_backend(),
        reload_interval_secs = config.reload_interval.as_secs(),
        "Configuration loaded"
    );

    let store = Arc::new(ConfigStore::new(table));

    let mut listener_config = ListenerConfig::new(SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)));
    listener_config.handshake = HandshakeConfig {
        timeout: config.handshake_timeout,
        ..HandshakeConfig::default()
    };
    listener_config.relay = RelayConfig {
        idle_timeout: config.idle_timeout,
        ..RelayConfig::default()
    };

    let listener = match Listener::bind(listener_config, Arc::clone(&store)).await {
        Ok(listener) => Arc::new(listener),
        Err(e) => {
            error!(port = port, error = %e, "Failed to bind listener");
            return Err(e.into());
        }
    };

    let (reloader, reload_handle) = Reloader::new(config.config_path.clone(), Arc::clone(&store));
    reloader.spawn();
    reload::spawn_reload_timer(reload_handle.clone(), config.reload_interval);

    // Kept alive for the lifetime of main.
    let _watcher = if config.watch {
        match reload::watch_config(&config.config_path, reload_handle) {
            Ok(watcher) => Some(watcher),
            Err(e) => {
                warn!(error = %e, "Config watcher unavailable, relying on reload timer");
                None
            }
        }
    } else {
        drop(reload_handle);
        None
    };

    tokio::select! {
        _ = listener.run() => {}
        result = tokio::signal::ctrl_c() => {
            result.context("Failed to listen for shutdown signal")?;
            info!("Shutdown signal received");
        }
    }

    Ok(())
}
