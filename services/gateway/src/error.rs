//! Error types for the gateway.

use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;

use thiserror::Error;

/// Failure to produce a routing table from the configuration document.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Document missing or unreadable.
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Document is not valid JSON or has the wrong shape.
    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// Document parsed but its contents are unusable.
    #[error("invalid config {path}: {reason}")]
    Invalid { path: PathBuf, reason: String },
}

/// Gateway errors, one variant per failure stage of a connection's life.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Could not bind the listening socket.
    #[error("failed to bind {addr}: {source}")]
    Listen {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    /// A single accept call failed.
    #[error("accept failed: {0}")]
    Accept(#[source] io::Error),

    /// Reading the opening bytes from the client failed.
    #[error("handshake read failed: {0}")]
    HandshakeRead(#[source] io::Error),

    /// Connecting to the resolved backend failed.
    #[error("dial {backend} failed: {source}")]
    Dial {
        backend: String,
        #[source]
        source: io::Error,
    },

    /// Read or write failure while relaying; ordinary teardown.
    #[error("relay: {0}")]
    Relay(#[source] io::Error),

    /// A connection task panicked.
    #[error("handler fault: {0}")]
    HandlerFault(String),
}

impl GatewayError {
    /// Short reason code for structured logs.
    pub fn reason_code(&self) -> &'static str {
        match self {
            GatewayError::Config(_) => "config_error",
            GatewayError::Listen { .. } => "listen_error",
            GatewayError::Accept(_) => "accept_error",
            GatewayError::HandshakeRead(_) => "handshake_read_error",
            GatewayError::Dial { .. } => "dial_error",
            GatewayError::Relay(_) => "relay_error",
            GatewayError::HandlerFault(_) => "handler_fault",
        }
    }
}

pub type Result<T, E = GatewayError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dial_error_message() {
        let err = GatewayError::Dial {
            backend: "10.0.0.2:25565".to_string(),
            source: io::Error::new(io::ErrorKind::ConnectionRefused, "refused"),
        };
        assert_eq!(err.to_string(), "dial 10.0.0.2:25565 failed: refused");
        assert_eq!(err.reason_code(), "dial_error");
    }

    #[test]
    fn test_config_error_is_transparent() {
        let err: GatewayError = ConfigError::Invalid {
            path: PathBuf::from("config.json"),
            reason: "default backend is empty".to_string(),
        }
        .into();
        assert_eq!(
            err.to_string(),
            "invalid config config.json: default backend is empty"
        );
        assert_eq!(err.reason_code(), "config_error");
    }
}
