//! Hostname-routed L4 proxy.
//!
//! ## Architecture
//!
//! ```text
//! Client -> Listener -> Handshake Inspector -> Router (ConfigStore snapshot) -> Backend
//!                \                                                              /
//!                 +------------------------- Relay ----------------------------+
//! ```
//!
//! ## Usage
//!
//! ```ignore
//! use proxy::{ConfigStore, Listener, ListenerConfig};
//!
//! let store = Arc::new(ConfigStore::new(table));
//! let config = ListenerConfig::new("0.0.0.0:25565".parse()?);
//! let listener = Arc::new(Listener::bind(config, store).await?);
//! listener.run().await;
//! ```

mod handshake;
mod listener;
mod relay;
mod router;

pub use handshake::{
    extract_host, HandshakeConfig, HandshakeInspector, DEFAULT_MAX_HANDSHAKE_BYTES,
    MIN_HANDSHAKE_LEN,
};
pub use listener::{Listener, ListenerConfig, ListenerStats};
pub use relay::{relay, Direction, RelayConfig, RelayStats, DEFAULT_RELAY_BUFFER_BYTES};
pub use router::{resolve, ConfigStore, RoutingTable, SharedConfigStore};
