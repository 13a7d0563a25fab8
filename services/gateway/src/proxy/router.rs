//! Routing table and routing decisions.
//!
//! - Exact hostname match only (no wildcards, no case folding)
//! - Unmatched hostnames, including the empty one, go to the default backend
//! - Tables are immutable; reload swaps in a whole new table atomically
//! - Reload must not disturb established connections

use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use tracing::info;

/// Immutable routing snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingTable {
    listen_port: u16,
    routes: HashMap<String, String>,
    default_backend: String,
}

impl RoutingTable {
    pub fn new(
        listen_port: u16,
        routes: HashMap<String, String>,
        default_backend: impl Into<String>,
    ) -> Self {
        Self {
            listen_port,
            routes,
            default_backend: default_backend.into(),
        }
    }

    /// Port the gateway binds at startup.
    pub fn listen_port(&self) -> u16 {
        self.listen_port
    }

    pub fn routes(&self) -> &HashMap<String, String> {
        &self.routes
    }

    pub fn default_backend(&self) -> &str {
        &self.default_backend
    }

    /// Resolve a hostname to a backend address.
    pub fn resolve(&self, host: &str) -> &str {
        resolve(host, self)
    }
}

/// Exact-match lookup with fallback to the default backend.
pub fn resolve<'a>(host: &str, table: &'a RoutingTable) -> &'a str {
    table
        .routes
        .get(host)
        .map(String::as_str)
        .unwrap_or(table.default_backend.as_str())
}

/// Holder of the current routing table.
///
/// Uses ArcSwap for lock-free atomic replacement.
/// Readers get a consistent snapshot without blocking.
/// Writers publish a complete new table in a single pointer swap.
pub struct ConfigStore {
    current: ArcSwap<RoutingTable>,
}

impl ConfigStore {
    pub fn new(initial: RoutingTable) -> Self {
        Self {
            current: ArcSwap::from_pointee(initial),
        }
    }

    /// The latest installed table.
    ///
    /// Take this once per connection and keep it for the connection's
    /// lifetime so that every decision for the connection uses one table.
    pub fn current(&self) -> Arc<RoutingTable> {
        self.current.load_full()
    }

    /// Atomically install a new table.
    ///
    /// Readers holding the previous snapshot keep it until they drop it.
    pub fn replace(&self, table: RoutingTable) {
        let route_count = table.routes.len();
        let default_backend = table.default_backend.clone();

        self.current.store(Arc::new(table));

        info!(
            route_count = route_count,
            default_backend = %default_backend,
            "Routing table replaced atomically"
        );
    }
}

/// Shared config store reference.
pub type SharedConfigStore = Arc<ConfigStore>;
