pub mod config;
pub mod error;
pub mod proxy;
pub mod reload;

pub use error::{ConfigError, GatewayError};
pub use proxy::{
    extract_host, relay, resolve, ConfigStore, HandshakeConfig, HandshakeInspector, Listener,
    ListenerConfig, ListenerStats, RelayConfig, RelayStats, RoutingTable, SharedConfigStore,
};
pub use reload::{load, ReloadHandle, ReloadTrigger, Reloader};
