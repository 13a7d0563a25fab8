//! Gateway process configuration.
//!
//! Routing itself lives in the JSON document at `config_path`; this covers
//! the knobs around it.

use std::{path::PathBuf, time::Duration};

use anyhow::{Context, Result};

use crate::reload::DEFAULT_RELOAD_INTERVAL;

/// Gateway configuration (env-driven).
#[derive(Debug, Clone)]
pub struct Config {
    /// Routing document path.
    pub config_path: PathBuf,

    /// Interval of the unconditional reload timer.
    pub reload_interval: Duration,

    /// Watch the routing document's directory for changes.
    pub watch: bool,

    /// Deadline for the client's first read (none by default).
    pub handshake_timeout: Option<Duration>,

    /// Relay idle timeout (none by default).
    pub idle_timeout: Option<Duration>,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let config_path = lookup("HOSTGATE_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("config.json"));

        let reload_interval = lookup("HOSTGATE_RELOAD_INTERVAL_SECS")
            .map(|v| v.parse::<u64>())
            .transpose()
            .context("HOSTGATE_RELOAD_INTERVAL_SECS must be an integer (seconds).")?
            .map(|secs| Duration::from_secs(secs.max(1)))
            .unwrap_or(DEFAULT_RELOAD_INTERVAL);

        let watch = lookup("HOSTGATE_WATCH")
            .map(|v| !(v == "0" || v.eq_ignore_ascii_case("false")))
            .unwrap_or(true);

        let handshake_timeout = lookup("HOSTGATE_HANDSHAKE_TIMEOUT_MS")
            .map(|v| v.parse::<u64>())
            .transpose()
            .context("HOSTGATE_HANDSHAKE_TIMEOUT_MS must be an integer (milliseconds).")?
            .map(Duration::from_millis);

        let idle_timeout = lookup("HOSTGATE_IDLE_TIMEOUT_SECS")
            .map(|v| v.parse::<u64>())
            .transpose()
            .context("HOSTGATE_IDLE_TIMEOUT_SECS must be an integer (seconds).")?
            .map(Duration::from_secs);

        let log_level = lookup("HOSTGATE_LOG_LEVEL").unwrap_or_else(|| "info".to_string());

        Ok(Self {
            config_path,
            reload_interval,
            watch,
            handshake_timeout,
            idle_timeout,
            log_level,
        })
    }
}
